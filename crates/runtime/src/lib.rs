//! Generators for Flap's "bundled runtime helpers".
//!
//! `spec.md §1` calls these out as interface-specified, implementation-
//! opaque: string concatenation, the arena bump/realloc sequence, closure-
//! environment construction, collection slicing, and the three-tier
//! map/string key search. Unlike an ordinary runtime *library*, none of
//! this is compiled ahead of time and linked in — every function here
//! *emits* the machine code for its helper directly into the caller's
//! text buffer, using the same `flap_core::Emitter` façade the
//! expression/statement compilers use, so the finished executable never
//! touches an external assembler, linker, or C toolchain.
//!
//! Each helper is emitted at most once per compilation (on first use);
//! the compiler's `codegen::state::CompilerState` records the offset it
//! landed at and routes subsequent references through ordinary
//! `call rel32` sites. Helpers that need a libc entry point (`malloc`,
//! `realloc`) don't call it directly — they record an
//! [`ExternalCall`] describing the symbol name and the `ForwardRef` of
//! the `call rel32` site, which the container writer's PLT layer patches
//! exactly like a user-level C-import call.

pub mod arena;
pub mod closure;
pub mod map_search;
pub mod slice;
pub mod string_concat;

use flap_core::ForwardRef;

/// A call site inside a generated helper that targets an external
/// (PLT-resolved) symbol rather than another helper or Flap lambda.
#[derive(Debug, Clone)]
pub struct ExternalCall {
    pub symbol: &'static str,
    pub call_site: ForwardRef,
}

/// The result of emitting one runtime helper: where it starts (relative
/// to the start of the buffer it was emitted into) and which external
/// symbols it still needs patched in.
#[derive(Debug, Clone)]
pub struct EmittedHelper {
    pub entry_offset: usize,
    pub external_calls: Vec<ExternalCall>,
}

/// Every helper kind this crate can emit, used as the key for the
/// compiler's "emit at most once" cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperKind {
    StringConcat,
    ArenaAlloc,
    ArenaReset,
    ClosureAllocSimple,
    ClosureAllocCapturing,
    Slice,
    MapSearch,
    CpuidProbe,
}
