//! Arena bump allocation with grow-via-`realloc`-on-exhaustion.
//!
//! Each lexical `arena { ... }` scope gets a 24-byte slot in the
//! compiler's mutable runtime-data segment (not rodata proper — see
//! `spec.md §9`'s "global mutable process state" note): `[base_ptr:8]
//! [capacity:8][offset:8]`. Because arena *nesting depth* is known at
//! compile time (the symbol collector's arena-depth counter), the
//! compiler can `lea` the address of the exact slot statically; the
//! helper itself never has to index a meta-arena array at runtime.
//!
//! `alloc` bump-allocates `size` bytes from the slot's current offset,
//! growing the backing buffer by doubling (or further, if a single
//! request exceeds double the current capacity) via `realloc` when the
//! request doesn't fit. `reset` zeroes the offset without freeing the
//! buffer — the memory is reused, not released, per the arena's "reset
//! not free" contract.

use crate::{EmittedHelper, ExternalCall};
use flap_core::buffer::ByteBuffer;
use flap_core::emitter::{Cond, Emitter, Mem};
use flap_core::registers::Gpr;

/// `arena_alloc(slot_ptr: rdi, size: rsi) -> rax`.
pub fn emit_alloc(buf: &mut ByteBuffer) -> EmittedHelper {
    let entry_offset = buf.len();
    let mut external_calls = Vec::new();
    let mut em = Emitter::new(buf);

    em.push_reg(Gpr::R12);
    em.push_reg(Gpr::R13);
    em.mov_reg_reg(Gpr::R12, Gpr::Rdi); // slot ptr
    em.mov_reg_reg(Gpr::R13, Gpr::Rsi); // requested size

    // r8 = offset + size (the offset the allocation would end at).
    em.mov_reg_mem(Gpr::R8, Mem::new(Gpr::R12, 16), flap_core::registers::Width::Qword, false);
    em.add_reg_reg(Gpr::R8, Gpr::R13);

    // rax = capacity; compare against r8.
    em.mov_reg_mem(Gpr::Rax, Mem::new(Gpr::R12, 8), flap_core::registers::Width::Qword, false);
    em.cmp_reg_reg(Gpr::R8, Gpr::Rax);
    let have_room = em.jcc_rel32(Cond::Le);

    // Grow: new_cap = max(capacity * 2, r8).
    em.mov_reg_mem(Gpr::R9, Mem::new(Gpr::R12, 8), flap_core::registers::Width::Qword, false);
    em.shl_reg_imm8(Gpr::R9, 1);
    em.cmp_reg_reg(Gpr::R9, Gpr::R8);
    let cap_ok = em.jcc_rel32(Cond::Ge);
    em.mov_reg_reg(Gpr::R9, Gpr::R8);
    let cap_ok_target = em.pos();
    em.patch_rel32(cap_ok, cap_ok_target);

    em.mov_reg_mem(Gpr::Rdi, Mem::new(Gpr::R12, 0), flap_core::registers::Width::Qword, false);
    em.mov_reg_reg(Gpr::Rsi, Gpr::R9);
    let realloc_site = em.call_rel32();
    external_calls.push(ExternalCall { symbol: "realloc", call_site: realloc_site });
    em.mov_mem_reg(Mem::new(Gpr::R12, 0), Gpr::Rax, flap_core::registers::Width::Qword);
    em.mov_mem_reg(Mem::new(Gpr::R12, 8), Gpr::R9, flap_core::registers::Width::Qword);

    let have_room_target = em.pos();
    em.patch_rel32(have_room, have_room_target);

    // rax = base + offset (the pointer handed back to the caller).
    em.mov_reg_mem(Gpr::Rax, Mem::new(Gpr::R12, 0), flap_core::registers::Width::Qword, false);
    em.mov_reg_mem(Gpr::R8, Mem::new(Gpr::R12, 16), flap_core::registers::Width::Qword, false);
    em.add_reg_reg(Gpr::Rax, Gpr::R8);

    // offset += size.
    em.add_reg_reg(Gpr::R8, Gpr::R13);
    em.mov_mem_reg(Mem::new(Gpr::R12, 16), Gpr::R8, flap_core::registers::Width::Qword);

    em.pop_reg(Gpr::R13);
    em.pop_reg(Gpr::R12);
    em.ret();

    EmittedHelper { entry_offset, external_calls }
}

/// `arena_reset(slot_ptr: rdi)` — zeroes the bump offset, leaving the
/// backing allocation in place for reuse.
pub fn emit_reset(buf: &mut ByteBuffer) -> EmittedHelper {
    let entry_offset = buf.len();
    let mut em = Emitter::new(buf);
    em.mov_reg_imm32(Gpr::Rax, 0);
    em.mov_mem_reg(Mem::new(Gpr::Rdi, 16), Gpr::Rax, flap_core::registers::Width::Qword);
    em.ret();
    EmittedHelper { entry_offset, external_calls: Vec::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_helper_calls_realloc_exactly_once() {
        let mut buf = ByteBuffer::new();
        let helper = emit_alloc(&mut buf);
        assert_eq!(helper.external_calls.len(), 1);
        assert_eq!(helper.external_calls[0].symbol, "realloc");
    }

    #[test]
    fn reset_helper_has_no_external_calls() {
        let mut buf = ByteBuffer::new();
        let helper = emit_reset(&mut buf);
        assert!(helper.external_calls.is_empty());
        assert!(buf.len() > 0);
    }
}
