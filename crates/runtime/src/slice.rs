//! Collection slicing: `slice(src, start, end, step) -> new`.
//!
//! The expression compiler resolves `None` bounds to concrete start/end
//! values before calling this helper (the default depends on the sign of
//! `step`, per `spec.md §8`'s edge-case list — that resolution happens
//! at the call site, not here, since it may need a runtime length when
//! the collection isn't a literal). This helper only has to walk
//! `start, start+step, start+2*step, ...` until it passes `end` (in
//! whichever direction `step`'s sign implies), which handles negative
//! step uniformly with positive step.

use crate::{EmittedHelper, ExternalCall};
use flap_core::buffer::ByteBuffer;
use flap_core::emitter::{Cond, Emitter, Mem};
use flap_core::registers::{Gpr, Xmm};

/// `slice(src: rdi, start: rsi, end: rdx, step: rcx) -> rax`. All four
/// inputs are raw 64-bit integers, not `f64`-boxed Flap values — the
/// caller has already converted them via `cvttsd2si`.
pub fn emit(buf: &mut ByteBuffer) -> EmittedHelper {
    let entry_offset = buf.len();
    let mut external_calls = Vec::new();
    let mut em = Emitter::new(buf);

    em.push_reg(Gpr::Rbx);
    em.push_reg(Gpr::R12);
    em.push_reg(Gpr::R13);
    em.push_reg(Gpr::R14);
    em.push_reg(Gpr::R15);

    em.mov_reg_reg(Gpr::R12, Gpr::Rdi); // src
    em.mov_reg_reg(Gpr::R13, Gpr::Rsi); // start (kept immutable)
    em.mov_reg_reg(Gpr::R14, Gpr::Rcx); // step
    em.mov_reg_reg(Gpr::Rax, Gpr::Rdx); // end, scratch (pre-call only)

    em.mov_reg_reg(Gpr::Rbx, Gpr::R13); // running i
    em.mov_reg_imm32(Gpr::R15, 0); // count accumulator

    em.cmp_reg_imm32(Gpr::R14, 0);
    let neg_step = em.jcc_rel32(Cond::Le);

    let pos_count_top = em.pos();
    em.cmp_reg_reg(Gpr::Rbx, Gpr::Rax);
    let pos_done = em.jcc_rel32(Cond::Ge);
    em.inc_reg(Gpr::R15);
    em.add_reg_reg(Gpr::Rbx, Gpr::R14);
    let pos_back = em.jmp_rel32();
    em.patch_rel32(pos_back, pos_count_top);
    let pos_done_target = em.pos();
    em.patch_rel32(pos_done, pos_done_target);
    let skip_neg = em.jmp_rel32();

    let neg_step_target = em.pos();
    em.patch_rel32(neg_step, neg_step_target);
    let neg_count_top = em.pos();
    em.cmp_reg_reg(Gpr::Rbx, Gpr::Rax);
    let neg_done = em.jcc_rel32(Cond::Le);
    em.inc_reg(Gpr::R15);
    em.add_reg_reg(Gpr::Rbx, Gpr::R14);
    let neg_back = em.jmp_rel32();
    em.patch_rel32(neg_back, neg_count_top);
    let neg_done_target = em.pos();
    em.patch_rel32(neg_done, neg_done_target);

    let after_count = em.pos();
    em.patch_rel32(skip_neg, after_count);

    // size = 8 + count * 8.
    em.mov_reg_reg(Gpr::Rdi, Gpr::R15);
    em.shl_reg_imm8(Gpr::Rdi, 3);
    em.add_reg_imm32(Gpr::Rdi, 8);
    let malloc_site = em.call_rel32();
    external_calls.push(ExternalCall { symbol: "malloc", call_site: malloc_site });

    em.mov_reg_reg(Gpr::Rbx, Gpr::Rax); // dest ptr
    em.cvtsi2sd(Xmm::Xmm0, Gpr::R15);
    em.movsd_store(Mem::new(Gpr::Rbx, 0), Xmm::Xmm0);

    // Fill loop: j in 0..count, i = start + j*step.
    em.mov_reg_reg(Gpr::R8, Gpr::R13); // i
    em.mov_reg_imm32(Gpr::Rcx, 0); // j

    let fill_top = em.pos();
    em.cmp_reg_reg(Gpr::Rcx, Gpr::R15);
    let fill_done = em.jcc_rel32(Cond::Ge);

    em.mov_reg_reg(Gpr::R10, Gpr::R8);
    em.shl_reg_imm8(Gpr::R10, 3);
    em.add_reg_reg(Gpr::R10, Gpr::R12);
    em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::R10, 8));

    em.mov_reg_reg(Gpr::R10, Gpr::Rcx);
    em.shl_reg_imm8(Gpr::R10, 3);
    em.add_reg_reg(Gpr::R10, Gpr::Rbx);
    em.movsd_store(Mem::new(Gpr::R10, 8), Xmm::Xmm1);

    em.add_reg_reg(Gpr::R8, Gpr::R14);
    em.inc_reg(Gpr::Rcx);
    let fill_back = em.jmp_rel32();
    em.patch_rel32(fill_back, fill_top);
    let fill_done_target = em.pos();
    em.patch_rel32(fill_done, fill_done_target);

    em.mov_reg_reg(Gpr::Rax, Gpr::Rbx);
    em.pop_reg(Gpr::R15);
    em.pop_reg(Gpr::R14);
    em.pop_reg(Gpr::R13);
    em.pop_reg(Gpr::R12);
    em.pop_reg(Gpr::Rbx);
    em.ret();

    EmittedHelper { entry_offset, external_calls }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_exactly_one_malloc_call() {
        let mut buf = ByteBuffer::new();
        let helper = emit(&mut buf);
        assert_eq!(helper.external_calls.len(), 1);
        assert_eq!(helper.external_calls[0].symbol, "malloc");
    }
}
