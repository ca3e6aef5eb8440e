//! Direct-to-machine-code compilation: the expression/statement compilers,
//! the executable container writer, and the two-pass driver that
//! orchestrates them (`spec.md §2`, components 5-9).
//!
//! Submodule layout mirrors the dependency order in the spec's component
//! table: [`state`] holds the single mutable `FlapCompiler` instance every
//! other module operates on; [`expr`] and [`stmt`] lower AST nodes into
//! calls against its embedded `Emitter`; [`container`] assembles the
//! finished ELF bytes; [`driver`] runs the two emission passes and ties
//! everything together.

mod container;
mod driver;
mod expr;
mod rodata;
mod state;
mod stmt;

pub use driver::{compile_program, CompileOutput};
pub use state::{FlapCompiler, TailPosition};
