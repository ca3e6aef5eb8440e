//! Flap Core: architecture-agnostic foundations for the Flap compiler
//!
//! This crate provides the primitives that are shared by every
//! architecture-specific emitter and by the container writers:
//!
//! - `value`: the tagged `Value`/`Kind` model that stands in for the
//!   source language's "every expression is an f64, sometimes bit-cast
//!   from a pointer" convention (the pointer-through-f64
//!   re-architecture note).
//! - `buffer`: a growable byte sink with typed forward-reference handles,
//!   used for both the text section and the rodata section during
//!   emission.
//! - `registers`: the fixed register-name tables the emitter validates
//!   every operand against.
//! - `emitter`: the typed x86-64 instruction encoder façade (`spec §4.4`).
//!   It lives here rather than in `flapc` so that both the expression/
//!   statement compilers and `flap-runtime-gen`'s machine-code generators
//!   share one encoder instead of duplicating REX/ModRM synthesis.

pub mod buffer;
pub mod emitter;
pub mod registers;
pub mod value;

pub use buffer::{ByteBuffer, ForwardRef};
pub use emitter::{Cond, Emitter, Mem, ShiftKind};
pub use registers::{Gpr, Width, Xmm};
pub use value::{Kind, Value};
