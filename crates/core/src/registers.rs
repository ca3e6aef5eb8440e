//! The fixed register discipline.
//!
//! Flap forgoes a register allocator in favor of a fixed set of
//! general-purpose and XMM registers, and the emitter facade
//! validates every register operand it is handed against
//! these tables rather than accepting an arbitrary string. `Gpr`/`Xmm` are
//! that validation in typed form; `Gpr::parse` additionally recognizes the
//! narrow aliases such as `al/ax/eax/r10b/r10d`.

/// Operand width for a general-purpose register reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Byte,
    Word,
    Dword,
    Qword,
}

/// One of the 16 general-purpose registers, independent of the width at
/// which a particular instruction addresses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// The 4-bit x86-64 register encoding (bit 3 goes into REX.B/R/X).
    pub fn encoding(self) -> u8 {
        self as u8
    }

    /// The low 3 bits used directly in ModR/M or SIB reg/rm fields; bit 3
    /// is carried separately in the REX prefix.
    pub fn low3(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Whether referencing this register at all requires a REX prefix
    /// (r8-r15), independent of width.
    pub fn needs_rex(self) -> bool {
        self.encoding() >= 8
    }

    /// Parse any of the names the emitter facade accepts for this
    /// register family, returning the register and the width the name
    /// implies.
    pub fn parse(name: &str) -> Option<(Gpr, Width)> {
        use Gpr::*;
        use Width::*;
        Some(match name {
            "rax" => (Rax, Qword),
            "eax" => (Rax, Dword),
            "ax" => (Rax, Word),
            "al" => (Rax, Byte),
            "rbx" => (Rbx, Qword),
            "ebx" => (Rbx, Dword),
            "bx" => (Rbx, Word),
            "bl" => (Rbx, Byte),
            "rcx" => (Rcx, Qword),
            "ecx" => (Rcx, Dword),
            "cx" => (Rcx, Word),
            "cl" => (Rcx, Byte),
            "rdx" => (Rdx, Qword),
            "edx" => (Rdx, Dword),
            "dx" => (Rdx, Word),
            "dl" => (Rdx, Byte),
            "rsi" => (Rsi, Qword),
            "esi" => (Rsi, Dword),
            "si" => (Rsi, Word),
            "sil" => (Rsi, Byte),
            "rdi" => (Rdi, Qword),
            "edi" => (Rdi, Dword),
            "di" => (Rdi, Word),
            "dil" => (Rdi, Byte),
            "rsp" => (Rsp, Qword),
            "esp" => (Rsp, Dword),
            "sp" => (Rsp, Word),
            "spl" => (Rsp, Byte),
            "rbp" => (Rbp, Qword),
            "ebp" => (Rbp, Dword),
            "bp" => (Rbp, Word),
            "bpl" => (Rbp, Byte),
            "r8" => (R8, Qword),
            "r8d" => (R8, Dword),
            "r8w" => (R8, Word),
            "r8b" => (R8, Byte),
            "r9" => (R9, Qword),
            "r9d" => (R9, Dword),
            "r9w" => (R9, Word),
            "r9b" => (R9, Byte),
            "r10" => (R10, Qword),
            "r10d" => (R10, Dword),
            "r10w" => (R10, Word),
            "r10b" => (R10, Byte),
            "r11" => (R11, Qword),
            "r11d" => (R11, Dword),
            "r11w" => (R11, Word),
            "r11b" => (R11, Byte),
            "r12" => (R12, Qword),
            "r12d" => (R12, Dword),
            "r12w" => (R12, Word),
            "r12b" => (R12, Byte),
            "r13" => (R13, Qword),
            "r13d" => (R13, Dword),
            "r13w" => (R13, Word),
            "r13b" => (R13, Byte),
            "r14" => (R14, Qword),
            "r14d" => (R14, Dword),
            "r14w" => (R14, Word),
            "r14b" => (R14, Byte),
            "r15" => (R15, Qword),
            "r15d" => (R15, Dword),
            "r15w" => (R15, Word),
            "r15b" => (R15, Byte),
            _ => return None,
        })
    }
}

/// One of the 16 SSE/AVX XMM registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

impl Xmm {
    pub fn encoding(self) -> u8 {
        self as u8
    }

    pub fn needs_rex(self) -> bool {
        self.encoding() >= 8
    }

    pub fn parse(name: &str) -> Option<Xmm> {
        use Xmm::*;
        Some(match name {
            "xmm0" => Xmm0,
            "xmm1" => Xmm1,
            "xmm2" => Xmm2,
            "xmm3" => Xmm3,
            "xmm4" => Xmm4,
            "xmm5" => Xmm5,
            "xmm6" => Xmm6,
            "xmm7" => Xmm7,
            "xmm8" => Xmm8,
            "xmm9" => Xmm9,
            "xmm10" => Xmm10,
            "xmm11" => Xmm11,
            "xmm12" => Xmm12,
            "xmm13" => Xmm13,
            "xmm14" => Xmm14,
            "xmm15" => Xmm15,
            _ => return None,
        })
    }
}

/// The System V AMD64 integer argument-passing order (used when
/// C-namespace call marshaling).
pub const SYSV_INT_ARGS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

/// The System V AMD64 XMM argument-passing order.
pub const SYSV_XMM_ARGS: [Xmm; 8] = [
    Xmm::Xmm0,
    Xmm::Xmm1,
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
    Xmm::Xmm6,
    Xmm::Xmm7,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_narrow_aliases_to_the_right_family() {
        assert_eq!(Gpr::parse("r10b"), Some((Gpr::R10, Width::Byte)));
        assert_eq!(Gpr::parse("r10d"), Some((Gpr::R10, Width::Dword)));
        assert_eq!(Gpr::parse("al"), Some((Gpr::Rax, Width::Byte)));
        assert_eq!(Gpr::parse("eax"), Some((Gpr::Rax, Width::Dword)));
        assert_eq!(Gpr::parse("nope"), None);
    }

    #[test]
    fn extended_registers_need_rex() {
        assert!(Gpr::R8.needs_rex());
        assert!(!Gpr::Rax.needs_rex());
        assert!(Xmm::Xmm15.needs_rex());
        assert!(!Xmm::Xmm0.needs_rex());
    }
}
