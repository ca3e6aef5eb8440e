//! Closure-object construction for capturing lambdas.
//!
//! A closure object is always 16 bytes: `[function-pointer][environment-
//! pointer]`. Non-capturing lambdas get a static instance of this laid
//! down once in rodata (no helper call needed — the expression compiler
//! just materializes the two constant words directly). Capturing lambdas
//! need a heap allocation sized to the capture list, which is what this
//! helper builds: `16 + 8 * capture_count` bytes, with the environment
//! pointer aimed at `alloc + 16` (so the environment is a suffix of the
//! same allocation rather than a second pointer chase).

use crate::{EmittedHelper, ExternalCall};
use flap_core::buffer::ByteBuffer;
use flap_core::emitter::{Emitter, Mem};
use flap_core::registers::{Gpr, Width};

/// `closure_alloc(fn_ptr: rdi, capture_count: rsi, captures_ptr: rdx) ->
/// rax`. `captures_ptr` points to `capture_count` consecutive `f64`
/// values (the current value of each captured variable, already loaded
/// by the caller); they're copied verbatim into the new environment.
pub fn emit_alloc(buf: &mut ByteBuffer) -> EmittedHelper {
    let entry_offset = buf.len();
    let mut external_calls = Vec::new();
    let mut em = Emitter::new(buf);

    em.push_reg(Gpr::R12); // fn ptr
    em.push_reg(Gpr::R13); // capture count
    em.push_reg(Gpr::R14); // captures source ptr
    em.mov_reg_reg(Gpr::R12, Gpr::Rdi);
    em.mov_reg_reg(Gpr::R13, Gpr::Rsi);
    em.mov_reg_reg(Gpr::R14, Gpr::Rdx);

    // size = 16 + 8 * capture_count
    em.mov_reg_reg(Gpr::Rdi, Gpr::R13);
    em.shl_reg_imm8(Gpr::Rdi, 3);
    em.add_reg_imm32(Gpr::Rdi, 16);
    let malloc_site = em.call_rel32();
    external_calls.push(ExternalCall { symbol: "malloc", call_site: malloc_site });

    // rax now holds the new closure object's base address.
    em.mov_mem_reg(Mem::new(Gpr::Rax, 0), Gpr::R12, Width::Qword); // fn ptr
    em.mov_reg_reg(Gpr::R15, Gpr::Rax);
    em.add_reg_imm32(Gpr::R15, 16); // env ptr = base + 16
    em.mov_mem_reg(Mem::new(Gpr::Rax, 8), Gpr::R15, Width::Qword);

    // Copy capture_count f64s from [r14 + i*8] to [r15 + i*8].
    em.mov_reg_imm32(Gpr::Rcx, 0);
    let loop_top = em.pos();
    em.cmp_reg_reg(Gpr::Rcx, Gpr::R13);
    let loop_exit = em.jcc_rel32(flap_core::emitter::Cond::Ge);

    em.mov_reg_reg(Gpr::R9, Gpr::Rcx);
    em.shl_reg_imm8(Gpr::R9, 3);
    em.mov_reg_reg(Gpr::R8, Gpr::R14);
    em.add_reg_reg(Gpr::R8, Gpr::R9);
    em.movsd_load(flap_core::registers::Xmm::Xmm0, Mem::new(Gpr::R8, 0));

    em.mov_reg_reg(Gpr::R8, Gpr::R15);
    em.add_reg_reg(Gpr::R8, Gpr::R9);
    em.movsd_store(Mem::new(Gpr::R8, 0), flap_core::registers::Xmm::Xmm0);

    em.inc_reg(Gpr::Rcx);
    let back = em.jmp_rel32();
    em.patch_rel32(back, loop_top);
    let after = em.pos();
    em.patch_rel32(loop_exit, after);

    // The closure object's base address was overwritten by the copy
    // loop's arithmetic; recover it as `env_ptr - 16` (r15 still holds
    // the environment pointer, which is base + 16 by construction).
    em.mov_reg_reg(Gpr::Rax, Gpr::R15);
    em.add_reg_imm32(Gpr::Rax, -16);

    em.pop_reg(Gpr::R14);
    em.pop_reg(Gpr::R13);
    em.pop_reg(Gpr::R12);
    em.ret();

    EmittedHelper { entry_offset, external_calls }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_helper_calls_malloc_exactly_once() {
        let mut buf = ByteBuffer::new();
        let helper = emit_alloc(&mut buf);
        assert_eq!(helper.external_calls.len(), 1);
        assert_eq!(helper.external_calls[0].symbol, "malloc");
    }
}
