//! `str_concat(a, b) -> new` — the runtime half of f-string/`+`
//! concatenation on Flap strings.
//!
//! Calling convention (internal, not the Flap-level calling convention):
//! `rdi` = pointer to string `a`, `rsi` = pointer to string `b`, result
//! pointer returned in `rax`. Both operands and the result use the
//! standard Flap string layout: an 8-byte element count (stored as an
//! `f64`, per the universal-float convention) followed by that many
//! codepoints, each itself stored as an `f64`.

use crate::{EmittedHelper, ExternalCall};
use flap_core::buffer::ByteBuffer;
use flap_core::emitter::{Cond, Emitter, Mem};
use flap_core::registers::{Gpr, Xmm};

/// Emit the helper into `buf`, returning its entry offset and the
/// `malloc` call site the container writer's PLT layer must patch.
pub fn emit(buf: &mut ByteBuffer) -> EmittedHelper {
    let entry_offset = buf.len();
    let mut external_calls = Vec::new();
    let mut em = Emitter::new(buf);

    // Prologue: save callee-saved regs we use as long-lived temporaries.
    em.push_reg(Gpr::Rbx);
    em.push_reg(Gpr::R12);
    em.push_reg(Gpr::R13);
    em.push_reg(Gpr::R14);
    em.push_reg(Gpr::R15);

    em.mov_reg_reg(Gpr::R12, Gpr::Rdi); // a_ptr
    em.mov_reg_reg(Gpr::R13, Gpr::Rsi); // b_ptr

    // count_a (truncated to integer) -> r14, count_b -> rbx.
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::R12, 0));
    em.cvttsd2si(Gpr::R14, Xmm::Xmm0);
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::R13, 0));
    em.cvttsd2si(Gpr::Rbx, Xmm::Xmm0);

    // total = count_a + count_b, kept in a fresh temp (r8); r14/rbx keep
    // their individual counts for the two copy loops below.
    em.mov_reg_reg(Gpr::R8, Gpr::R14);
    em.add_reg_reg(Gpr::R8, Gpr::Rbx);

    // size = 8 + total * 8, passed to malloc in rdi.
    em.mov_reg_reg(Gpr::Rdi, Gpr::R8);
    em.shl_reg_imm8(Gpr::Rdi, 3);
    em.add_reg_imm32(Gpr::Rdi, 8);

    let malloc_site = em.call_rel32();
    external_calls.push(ExternalCall { symbol: "malloc", call_site: malloc_site });

    em.mov_reg_reg(Gpr::R15, Gpr::Rax); // dest ptr

    // dest count field.
    em.cvtsi2sd(Xmm::Xmm0, Gpr::R8);
    em.movsd_store(Mem::new(Gpr::R15, 0), Xmm::Xmm0);

    // --- copy loop 1: dest[8 + i*8] = a[8 + i*8] for i in 0..count_a ---
    em.mov_reg_imm32(Gpr::Rcx, 0); // index i

    let loop1_top = em.pos();
    em.cmp_reg_reg(Gpr::Rcx, Gpr::R14);
    let loop1_exit = em.jcc_rel32(Cond::Ge);
    copy_element(&mut em, Gpr::R12, Gpr::R15, Gpr::Rcx, None);
    em.inc_reg(Gpr::Rcx);
    let back1 = em.jmp_rel32();
    em.patch_rel32(back1, loop1_top);
    let after_loop1 = em.pos();
    em.patch_rel32(loop1_exit, after_loop1);

    // --- copy loop 2: dest[8 + (count_a + i)*8] = b[8 + i*8] ---
    em.mov_reg_imm32(Gpr::Rcx, 0);

    let loop2_top = em.pos();
    em.cmp_reg_reg(Gpr::Rcx, Gpr::Rbx);
    let loop2_exit = em.jcc_rel32(Cond::Ge);
    copy_element(&mut em, Gpr::R13, Gpr::R15, Gpr::Rcx, Some(Gpr::R14));
    em.inc_reg(Gpr::Rcx);
    let back2 = em.jmp_rel32();
    em.patch_rel32(back2, loop2_top);
    let after_loop2 = em.pos();
    em.patch_rel32(loop2_exit, after_loop2);

    em.mov_reg_reg(Gpr::Rax, Gpr::R15);
    em.pop_reg(Gpr::R15);
    em.pop_reg(Gpr::R14);
    em.pop_reg(Gpr::R13);
    em.pop_reg(Gpr::R12);
    em.pop_reg(Gpr::Rbx);
    em.ret();

    EmittedHelper { entry_offset, external_calls }
}

/// `dest[8 + (dest_shift + index)*8] = src[8 + index*8]`, computing each
/// address by shifting the index into a scratch register (`r9`) rather
/// than relying on a scaled-index addressing mode — the emitter only
/// supports `[base + disp32]`.
fn copy_element(em: &mut Emitter, src_base: Gpr, dest_base: Gpr, index: Gpr, dest_shift: Option<Gpr>) {
    em.mov_reg_reg(Gpr::R9, index);
    em.shl_reg_imm8(Gpr::R9, 3);
    em.add_reg_reg(Gpr::R9, src_base);
    em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::R9, 8));

    em.mov_reg_reg(Gpr::R9, index);
    if let Some(shift) = dest_shift {
        em.add_reg_reg(Gpr::R9, shift);
    }
    em.shl_reg_imm8(Gpr::R9, 3);
    em.add_reg_reg(Gpr::R9, dest_base);
    em.movsd_store(Mem::new(Gpr::R9, 8), Xmm::Xmm1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_a_nonempty_helper_with_one_malloc_call() {
        let mut buf = ByteBuffer::new();
        let helper = emit(&mut buf);
        assert_eq!(helper.entry_offset, 0);
        assert_eq!(helper.external_calls.len(), 1);
        assert_eq!(helper.external_calls[0].symbol, "malloc");
        assert!(buf.len() > 32);
    }
}
