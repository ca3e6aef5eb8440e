//! The x86-64 emitter façade.
//!
//! A thin, typed wrapper over a raw `ByteBuffer`: one method per logical
//! instruction class, each taking `Gpr`/`Xmm` operands (never bare
//! strings — that validation already happened at the register-parsing
//! boundary in `flap-core::registers`). This module owns REX prefix
//! synthesis, ModR/M and SIB byte computation, and the zeroed-placeholder
//! convention for 32-bit jump/call displacements that the two-pass driver
//! patches once addresses are known.
//!
//! Every method emits into the buffer it's constructed over — callers
//! swap in the text buffer for pass 1 and the (cleared) text buffer again
//! for pass 2, never the rodata buffer.

use crate::buffer::{ByteBuffer, ForwardRef};
use crate::registers::{Gpr, Width, Xmm};

/// A memory operand of the form `[base + disp32]` — the only addressing
/// mode the expression/statement compilers need: every local lives at a
/// fixed `rbp`-relative (or, inside a parallel-loop child, `r11`-relative)
/// offset, and every heap/rodata access goes through a GPR holding a base
/// pointer plus a constant or register-scaled displacement.
#[derive(Debug, Clone, Copy)]
pub struct Mem {
    pub base: Gpr,
    pub disp: i32,
}

impl Mem {
    pub fn new(base: Gpr, disp: i32) -> Self {
        Mem { base, disp }
    }
}

pub struct Emitter<'a> {
    buf: &'a mut ByteBuffer,
}

impl<'a> Emitter<'a> {
    pub fn new(buf: &'a mut ByteBuffer) -> Self {
        Emitter { buf }
    }

    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    /// Patch a previously-emitted rel32 field (jump, call) so it targets
    /// `target`. Used both by the two-pass driver for cross-pass
    /// relocations and by runtime-helper generators for local,
    /// single-pass loop backpatching.
    pub fn patch_rel32(&mut self, fref: ForwardRef, target: usize) {
        self.buf.patch_rel32(fref, target);
    }

    fn rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        if w || r || x || b {
            let mut byte = 0x40u8;
            if w {
                byte |= 0x08;
            }
            if r {
                byte |= 0x04;
            }
            if x {
                byte |= 0x02;
            }
            if b {
                byte |= 0x01;
            }
            self.buf.push_u8(byte);
        }
    }

    /// ModR/M byte for register-direct addressing (mod = 11).
    fn modrm_reg(&mut self, reg: u8, rm: u8) {
        self.buf.push_u8(0xC0 | ((reg & 7) << 3) | (rm & 7));
    }

    /// ModR/M + optional SIB + displacement for `[base + disp32]`. rbp/r13
    /// as a base always needs a disp8/disp32 (mod=00,rm=101 means
    /// RIP-relative), so this always emits mod=10 (disp32) for simplicity
    /// and determinism between passes.
    fn modrm_mem(&mut self, reg: u8, base: Gpr, disp: i32) {
        let base_low = base.low3();
        self.buf.push_u8(0x80 | ((reg & 7) << 3) | base_low);
        if base_low == 4 {
            // rsp/r12 as base requires a SIB byte (no index, scale 0).
            self.buf.push_u8(0x24);
        }
        self.buf.push_i32_le(disp);
    }

    // ---- integer moves ----------------------------------------------

    /// `mov reg64, imm64`.
    pub fn mov_reg_imm64(&mut self, dst: Gpr, imm: i64) {
        self.rex(true, false, false, dst.needs_rex());
        self.buf.push_u8(0xB8 | dst.low3());
        self.buf.push_i64_le(imm);
    }

    /// `mov reg32, imm32` (zero-extends into the full register).
    pub fn mov_reg_imm32(&mut self, dst: Gpr, imm: i32) {
        self.rex(false, false, false, dst.needs_rex());
        self.buf.push_u8(0xB8 | dst.low3());
        self.buf.push_i32_le(imm);
    }

    /// `mov dst, src` (register to register, 64-bit).
    pub fn mov_reg_reg(&mut self, dst: Gpr, src: Gpr) {
        self.rex(true, src.needs_rex(), false, dst.needs_rex());
        self.buf.push_u8(0x89);
        self.modrm_reg(src.low3(), dst.low3());
    }

    /// `mov dst, [mem]` at the given width, zero- or sign-extending into
    /// the full 64-bit register as the narrow-load builtins require.
    pub fn mov_reg_mem(&mut self, dst: Gpr, mem: Mem, width: Width, sign_extend: bool) {
        match width {
            Width::Qword => {
                self.rex(true, dst.needs_rex(), false, mem.base.needs_rex());
                self.buf.push_u8(0x8B);
                self.modrm_mem(dst.low3(), mem.base, mem.disp);
            }
            Width::Dword => {
                if sign_extend {
                    self.rex(true, dst.needs_rex(), false, mem.base.needs_rex());
                    self.buf.push_u8(0x63); // movsxd
                    self.modrm_mem(dst.low3(), mem.base, mem.disp);
                } else {
                    self.rex(false, dst.needs_rex(), false, mem.base.needs_rex());
                    self.buf.push_u8(0x8B);
                    self.modrm_mem(dst.low3(), mem.base, mem.disp);
                }
            }
            Width::Word => {
                self.buf.push_u8(0x66);
                self.rex(true, dst.needs_rex(), false, mem.base.needs_rex());
                self.buf.push_u8(if sign_extend { 0xBF } else { 0xB7 });
                self.buf.push_u8(0x0F);
                self.modrm_mem(dst.low3(), mem.base, mem.disp);
            }
            Width::Byte => {
                self.rex(true, dst.needs_rex(), false, mem.base.needs_rex());
                self.buf.push_u8(0x0F);
                self.buf.push_u8(if sign_extend { 0xBE } else { 0xB6 });
                self.modrm_mem(dst.low3(), mem.base, mem.disp);
            }
        }
    }

    /// `mov [mem], src` at the given width.
    pub fn mov_mem_reg(&mut self, mem: Mem, src: Gpr, width: Width) {
        match width {
            Width::Qword => {
                self.rex(true, src.needs_rex(), false, mem.base.needs_rex());
                self.buf.push_u8(0x89);
            }
            Width::Dword => {
                self.rex(false, src.needs_rex(), false, mem.base.needs_rex());
                self.buf.push_u8(0x89);
            }
            Width::Word => {
                self.buf.push_u8(0x66);
                self.rex(false, src.needs_rex(), false, mem.base.needs_rex());
                self.buf.push_u8(0x89);
            }
            Width::Byte => {
                self.rex(false, src.needs_rex(), false, mem.base.needs_rex());
                self.buf.push_u8(0x88);
            }
        }
        self.modrm_mem(src.low3(), mem.base, mem.disp);
    }

    /// `lea dst, [base + disp]`.
    pub fn lea(&mut self, dst: Gpr, mem: Mem) {
        self.rex(true, dst.needs_rex(), false, mem.base.needs_rex());
        self.buf.push_u8(0x8D);
        self.modrm_mem(dst.low3(), mem.base, mem.disp);
    }

    /// `lea dst, [rip + disp32]`; returns the `ForwardRef` of the disp32
    /// field so the caller can patch it once the rodata symbol's address
    /// (or, during pass 1, its estimated address) is known.
    pub fn lea_rip(&mut self, dst: Gpr) -> ForwardRef {
        self.rex(true, dst.needs_rex(), false, false);
        self.buf.push_u8(0x8D);
        self.buf.push_u8(0x05 | (dst.low3() << 3));
        self.buf.placeholder_i32()
    }

    pub fn push_reg(&mut self, reg: Gpr) {
        self.rex(false, false, false, reg.needs_rex());
        self.buf.push_u8(0x50 | reg.low3());
    }

    pub fn pop_reg(&mut self, reg: Gpr) {
        self.rex(false, false, false, reg.needs_rex());
        self.buf.push_u8(0x58 | reg.low3());
    }

    // ---- integer arithmetic / compare --------------------------------

    fn alu_reg_reg(&mut self, opcode: u8, dst: Gpr, src: Gpr) {
        self.rex(true, src.needs_rex(), false, dst.needs_rex());
        self.buf.push_u8(opcode);
        self.modrm_reg(src.low3(), dst.low3());
    }

    pub fn add_reg_reg(&mut self, dst: Gpr, src: Gpr) {
        self.alu_reg_reg(0x01, dst, src)
    }
    pub fn sub_reg_reg(&mut self, dst: Gpr, src: Gpr) {
        self.alu_reg_reg(0x29, dst, src)
    }
    pub fn and_reg_reg(&mut self, dst: Gpr, src: Gpr) {
        self.alu_reg_reg(0x21, dst, src)
    }
    pub fn or_reg_reg(&mut self, dst: Gpr, src: Gpr) {
        self.alu_reg_reg(0x09, dst, src)
    }
    pub fn xor_reg_reg(&mut self, dst: Gpr, src: Gpr) {
        self.alu_reg_reg(0x31, dst, src)
    }
    pub fn cmp_reg_reg(&mut self, a: Gpr, b: Gpr) {
        self.alu_reg_reg(0x39, a, b)
    }
    pub fn test_reg_reg(&mut self, a: Gpr, b: Gpr) {
        self.alu_reg_reg(0x85, a, b)
    }

    pub fn not_reg(&mut self, reg: Gpr) {
        self.rex(true, false, false, reg.needs_rex());
        self.buf.push_u8(0xF7);
        self.buf.push_u8(0xD0 | reg.low3());
    }

    pub fn neg_reg(&mut self, reg: Gpr) {
        self.rex(true, false, false, reg.needs_rex());
        self.buf.push_u8(0xF7);
        self.buf.push_u8(0xD8 | reg.low3());
    }

    /// `add reg, imm32` (sign-extended).
    pub fn add_reg_imm32(&mut self, reg: Gpr, imm: i32) {
        self.rex(true, false, false, reg.needs_rex());
        self.buf.push_u8(0x81);
        self.buf.push_u8(0xC0 | reg.low3());
        self.buf.push_i32_le(imm);
    }

    /// `sub reg, imm32` (sign-extended) — used for the prologue's `rsp`
    /// adjustment, sized by the symbol collector's frame size.
    pub fn sub_reg_imm32(&mut self, reg: Gpr, imm: i32) {
        self.rex(true, false, false, reg.needs_rex());
        self.buf.push_u8(0x81);
        self.buf.push_u8(0xE8 | reg.low3());
        self.buf.push_i32_le(imm);
    }

    pub fn cmp_reg_imm32(&mut self, reg: Gpr, imm: i32) {
        self.rex(true, false, false, reg.needs_rex());
        self.buf.push_u8(0x81);
        self.buf.push_u8(0xF8 | reg.low3());
        self.buf.push_i32_le(imm);
    }

    pub fn inc_reg(&mut self, reg: Gpr) {
        self.add_reg_imm32(reg, 1);
    }

    /// Signed 64-bit `imul dst, src`.
    pub fn imul_reg_reg(&mut self, dst: Gpr, src: Gpr) {
        self.rex(true, dst.needs_rex(), false, src.needs_rex());
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0xAF);
        self.modrm_reg(dst.low3(), src.low3());
    }

    /// `shl reg, imm8`.
    pub fn shl_reg_imm8(&mut self, reg: Gpr, imm: u8) {
        self.rex(true, false, false, reg.needs_rex());
        self.buf.push_u8(0xC1);
        self.buf.push_u8(0xE0 | reg.low3());
        self.buf.push_u8(imm);
    }

    pub fn shr_reg_imm8(&mut self, reg: Gpr, imm: u8) {
        self.rex(true, false, false, reg.needs_rex());
        self.buf.push_u8(0xC1);
        self.buf.push_u8(0xE8 | reg.low3());
        self.buf.push_u8(imm);
    }

    /// `shl reg, cl` / `shr reg, cl` / `rol reg, cl` / `ror reg, cl` —
    /// variable shift counts come from `rcx` per the fixed calling
    /// discipline (the compiler always spills the shift amount there).
    pub fn shift_reg_cl(&mut self, reg: Gpr, which: ShiftKind) {
        self.rex(true, false, false, reg.needs_rex());
        self.buf.push_u8(0xD3);
        let modrm_reg = match which {
            ShiftKind::Shl => 4,
            ShiftKind::Shr => 5,
            ShiftKind::Rol => 0,
            ShiftKind::Ror => 1,
        };
        self.buf.push_u8(0xC0 | (modrm_reg << 3) | reg.low3());
    }

    /// Signed division: `cqo; idiv divisor` leaving quotient in `rax`,
    /// remainder in `rdx`. Caller has already placed the dividend in
    /// `rax`.
    pub fn cqo(&mut self) {
        self.rex(true, false, false, false);
        self.buf.push_u8(0x99);
    }

    pub fn idiv_reg(&mut self, divisor: Gpr) {
        self.rex(true, false, false, divisor.needs_rex());
        self.buf.push_u8(0xF7);
        self.buf.push_u8(0xF8 | divisor.low3());
    }

    // ---- SSE2 scalar double ------------------------------------------

    fn sse_rr(&mut self, prefix: u8, opcode: u8, dst: Xmm, src: Xmm) {
        self.buf.push_u8(prefix);
        if dst.needs_rex() || src.needs_rex() {
            let mut rex = 0x40u8;
            if dst.needs_rex() {
                rex |= 0x04;
            }
            if src.needs_rex() {
                rex |= 0x01;
            }
            self.buf.push_u8(rex);
        }
        self.buf.push_u8(0x0F);
        self.buf.push_u8(opcode);
        self.buf.push_u8(0xC0 | ((dst.encoding() & 7) << 3) | (src.encoding() & 7));
    }

    fn sse_rm(&mut self, prefix: u8, opcode: u8, dst: Xmm, mem: Mem) {
        self.buf.push_u8(prefix);
        if dst.needs_rex() || mem.base.needs_rex() {
            let mut rex = 0x40u8;
            if dst.needs_rex() {
                rex |= 0x04;
            }
            if mem.base.needs_rex() {
                rex |= 0x01;
            }
            self.buf.push_u8(rex);
        }
        self.buf.push_u8(0x0F);
        self.buf.push_u8(opcode);
        self.modrm_mem(dst.encoding() & 7, mem.base, mem.disp);
    }

    pub fn movsd_load(&mut self, dst: Xmm, mem: Mem) {
        self.sse_rm(0xF2, 0x10, dst, mem)
    }
    pub fn movsd_store(&mut self, mem: Mem, src: Xmm) {
        // movsd [mem], xmm uses opcode 0x11 with operand order reversed
        // relative to the load form, but our modrm_mem helper always
        // treats its first argument as the "reg" field.
        self.buf.push_u8(0xF2);
        if src.needs_rex() || mem.base.needs_rex() {
            let mut rex = 0x40u8;
            if src.needs_rex() {
                rex |= 0x04;
            }
            if mem.base.needs_rex() {
                rex |= 0x01;
            }
            self.buf.push_u8(rex);
        }
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0x11);
        self.modrm_mem(src.encoding() & 7, mem.base, mem.disp);
    }
    pub fn movsd_reg_reg(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x10, dst, src)
    }
    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x58, dst, src)
    }
    pub fn subsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x5C, dst, src)
    }
    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x59, dst, src)
    }
    pub fn divsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x5E, dst, src)
    }
    pub fn ucomisd(&mut self, a: Xmm, b: Xmm) {
        self.sse_rr(0x66, 0x2E, a, b)
    }

    /// `cvtsi2sd dst_xmm, src_gpr` (64-bit integer source).
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Gpr) {
        self.buf.push_u8(0xF2);
        self.rex(true, dst.needs_rex(), false, src.needs_rex());
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0x2A);
        self.buf.push_u8(0xC0 | ((dst.encoding() & 7) << 3) | src.low3());
    }

    /// `cvttsd2si dst_gpr, src_xmm` (truncating toward zero).
    pub fn cvttsd2si(&mut self, dst: Gpr, src: Xmm) {
        self.buf.push_u8(0xF2);
        self.rex(true, dst.needs_rex(), false, src.needs_rex());
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0x2C);
        self.buf.push_u8(0xC0 | ((dst.low3()) << 3) | (src.encoding() & 7));
    }

    /// `movq dst_gpr, src_xmm` — bitcast, the pointer-through-f64
    /// round-trip's GPR-reading half.
    pub fn movq_gpr_xmm(&mut self, dst: Gpr, src: Xmm) {
        self.buf.push_u8(0x66);
        self.rex(true, src.needs_rex(), false, dst.needs_rex());
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0x7E);
        self.buf.push_u8(0xC0 | ((src.encoding() & 7) << 3) | dst.low3());
    }

    /// `movq dst_xmm, src_gpr` — the other half of the round-trip.
    pub fn movq_xmm_gpr(&mut self, dst: Xmm, src: Gpr) {
        self.buf.push_u8(0x66);
        self.rex(true, dst.needs_rex(), false, src.needs_rex());
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0x6E);
        self.buf.push_u8(0xC0 | ((dst.encoding() & 7) << 3) | src.low3());
    }

    // ---- conditional moves / sets (used for comparison -> 0.0/1.0) ---

    /// `cmovCC dst, src` (64-bit). `cc` is the 4-bit x86 condition code.
    pub fn cmov_reg_reg(&mut self, cc: Cond, dst: Gpr, src: Gpr) {
        self.rex(true, dst.needs_rex(), false, src.needs_rex());
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0x40 | cc as u8);
        self.modrm_reg(dst.low3(), src.low3());
    }

    pub fn sete(&mut self, dst: Gpr) {
        self.set_cc(Cond::E, dst)
    }

    pub fn set_cc(&mut self, cc: Cond, dst: Gpr) {
        if dst.needs_rex() {
            self.rex(false, false, false, true);
        }
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0x90 | cc as u8);
        self.buf.push_u8(0xC0 | dst.low3());
    }

    // ---- control flow --------------------------------------------------

    /// `jmp rel32`, placeholder displacement returned for later patching.
    pub fn jmp_rel32(&mut self) -> ForwardRef {
        self.buf.push_u8(0xE9);
        self.buf.placeholder_i32()
    }

    /// `jCC rel32`.
    pub fn jcc_rel32(&mut self, cc: Cond) -> ForwardRef {
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0x80 | cc as u8);
        self.buf.placeholder_i32()
    }

    /// `call rel32` — target is a PLT stub or an internal direct-call
    /// site; both are patched the same way once addresses are known.
    pub fn call_rel32(&mut self) -> ForwardRef {
        self.buf.push_u8(0xE8);
        self.buf.placeholder_i32()
    }

    /// `call reg` — indirect call through a closure's function pointer.
    pub fn call_reg(&mut self, reg: Gpr) {
        self.rex(false, false, false, reg.needs_rex());
        self.buf.push_u8(0xFF);
        self.buf.push_u8(0xD0 | reg.low3());
    }

    /// `jmp reg` — tail of a PLT-stub trampoline (`mov rax, imm64; jmp rax`).
    pub fn jmp_reg(&mut self, reg: Gpr) {
        self.rex(false, false, false, reg.needs_rex());
        self.buf.push_u8(0xFF);
        self.buf.push_u8(0xE0 | reg.low3());
    }

    pub fn ret(&mut self) {
        self.buf.push_u8(0xC3);
    }

    pub fn syscall(&mut self) {
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0x05);
    }

    pub fn nop(&mut self) {
        self.buf.push_u8(0x90);
    }

    /// `lock xadd [mem], reg` — atomic fetch-and-add, the parallel-loop
    /// barrier's counter decrement (`reg` is loaded with -1 beforehand).
    pub fn lock_xadd_mem_reg(&mut self, mem: Mem, reg: Gpr) {
        self.buf.push_u8(0xF0); // LOCK
        self.rex(true, reg.needs_rex(), false, mem.base.needs_rex());
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0xC1);
        self.modrm_mem(reg.low3(), mem.base, mem.disp);
    }

    /// CPUID — used once at program entry to probe for AVX-512 support;
    /// the caller has already loaded the leaf number into `eax`.
    pub fn cpuid(&mut self) {
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0xA2);
    }

    // ---- x87 transcendental math --------------------------------------
    //
    // Every hardware math builtin round-trips through the x87 stack rather
    // than calling into libm (`spec.md §6.2`'s "hardware-only" math list):
    // the double already in an XMM register is stored to a scratch stack
    // slot, loaded onto the x87 stack with `fld`, operated on, and popped
    // back to the same slot with `fstp` for the caller to `movsd` out.

    fn fp_rm(&mut self, opcode: u8, reg_field: u8, mem: Mem) {
        self.buf.push_u8(opcode);
        self.modrm_mem(reg_field, mem.base, mem.disp);
    }

    /// `fld qword [mem]`.
    pub fn fld_mem(&mut self, mem: Mem) {
        self.fp_rm(0xDD, 0, mem)
    }

    /// `fstp qword [mem]`.
    pub fn fstp_mem(&mut self, mem: Mem) {
        self.fp_rm(0xDD, 3, mem)
    }

    fn fp_noop(&mut self, opcode2: u8) {
        self.buf.push_u8(0xD9);
        self.buf.push_u8(opcode2);
    }

    pub fn fsqrt(&mut self) {
        self.fp_noop(0xFA)
    }
    pub fn fsin(&mut self) {
        self.fp_noop(0xFE)
    }
    pub fn fcos(&mut self) {
        self.fp_noop(0xFF)
    }
    pub fn fptan(&mut self) {
        self.fp_noop(0xF2)
    }
    pub fn fpatan(&mut self) {
        self.fp_noop(0xF3)
    }
    pub fn f2xm1(&mut self) {
        self.fp_noop(0xF0)
    }
    pub fn fscale(&mut self) {
        self.fp_noop(0xFD)
    }
    pub fn fabs_st0(&mut self) {
        self.fp_noop(0xE1)
    }
    pub fn fld1(&mut self) {
        self.fp_noop(0xE8)
    }
    pub fn fldz(&mut self) {
        self.fp_noop(0xEE)
    }
    pub fn fldln2(&mut self) {
        self.fp_noop(0xED)
    }

    /// `fyl2x` — pops `st(0), st(1)`, pushes `st(1) * log2(st(0))`.
    pub fn fyl2x(&mut self) {
        self.buf.push_u8(0xD9);
        self.buf.push_u8(0xF1);
    }

    /// `fstp st(0)` — discards the top of the x87 stack (used after
    /// `fptan` leaves a constant `1.0` on top that the caller doesn't
    /// want).
    pub fn fstp_st0(&mut self) {
        self.buf.push_u8(0xDD);
        self.buf.push_u8(0xD8);
    }

    /// `fmulp st(1), st(0)` — pops `st(0)`, multiplies into `st(1)`.
    pub fn fmulp(&mut self) {
        self.buf.push_u8(0xDE);
        self.buf.push_u8(0xC9);
    }

    /// `faddp st(1), st(0)` — pops `st(0)`, adds into `st(1)`.
    pub fn faddp(&mut self) {
        self.buf.push_u8(0xDE);
        self.buf.push_u8(0xC1);
    }

    /// `fsubp st(1), st(0)` — pops `st(0)`, computes `st(1) - st(0)` into
    /// `st(1)`.
    pub fn fsubp(&mut self) {
        self.buf.push_u8(0xDE);
        self.buf.push_u8(0xE9);
    }

    /// `fxch st(1)` — swaps `st(0)` and `st(1)`.
    pub fn fxch(&mut self) {
        self.buf.push_u8(0xD9);
        self.buf.push_u8(0xC9);
    }

    /// `maxsd dst, src` (SSE2).
    pub fn maxsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x5F, dst, src)
    }

    /// `roundsd dst, src, imm8` (SSE4.1) — `mode` 0 = nearest, 1 = floor,
    /// 2 = ceil, 3 = truncate. Used for `floor`/`ceil`/`round` without a
    /// libm call.
    pub fn roundsd(&mut self, dst: Xmm, src: Xmm, mode: u8) {
        self.buf.push_u8(0x66);
        if dst.needs_rex() || src.needs_rex() {
            let mut rex = 0x40u8;
            if dst.needs_rex() {
                rex |= 0x04;
            }
            if src.needs_rex() {
                rex |= 0x01;
            }
            self.buf.push_u8(rex);
        }
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0x3A);
        self.buf.push_u8(0x0B);
        self.buf.push_u8(0xC0 | ((dst.encoding() & 7) << 3) | (src.encoding() & 7));
        self.buf.push_u8(mode);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ShiftKind {
    Shl,
    Shr,
    Rol,
    Ror,
}

/// The subset of x86 condition codes the expression/statement compilers
/// need: equality, ordering (both signed-integer and SSE unordered
/// variants resolve to the same 4-bit codes at the `Jcc`/`SETcc`/`CMOVcc`
/// encoding level).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Gpr;

    #[test]
    fn mov_reg_imm64_is_ten_bytes() {
        let mut buf = ByteBuffer::new();
        Emitter::new(&mut buf).mov_reg_imm64(Gpr::Rax, 42);
        assert_eq!(buf.len(), 10); // REX.W + opcode + imm64
    }

    #[test]
    fn extended_register_destinations_emit_rex_b() {
        let mut buf = ByteBuffer::new();
        Emitter::new(&mut buf).mov_reg_imm64(Gpr::R8, 1);
        let bytes = buf.as_slice();
        assert_eq!(bytes[0] & 0x49, 0x49); // REX.W and REX.B both set
    }

    #[test]
    fn call_rel32_leaves_a_patchable_placeholder() {
        let mut buf = ByteBuffer::new();
        let fref = Emitter::new(&mut buf).call_rel32();
        assert_eq!(buf.len(), 5);
        buf.patch_rel32(fref, 100);
        assert_ne!(buf.as_slice()[1..5], [0, 0, 0, 0]);
    }

    #[test]
    fn jmp_and_ret_round_trip_through_a_forward_ref() {
        let mut buf = ByteBuffer::new();
        let mut em = Emitter::new(&mut buf);
        let fref = em.jmp_rel32();
        em.nop();
        let target = em.pos();
        buf.patch_rel32(fref, target);
        assert_eq!(buf.as_slice()[0], 0xE9);
    }
}
