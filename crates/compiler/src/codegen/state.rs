//! The single mutable compiler instance (`spec.md §3.4`, §9's "one struct,
//! not three contexts" redesign note): one `FlapCompiler` is constructed
//! per compilation and threaded by `&mut` reference through every
//! `expr.rs`/`stmt.rs` lowering function. It owns the in-progress text
//! buffer, the rodata table, the symbol table produced by
//! [`crate::symbols::SymbolCollector`], and everything that has to persist
//! across the whole emission pass — active loop labels for `break`/`next`
//! targeting, the defer-stack-of-stacks, arena nesting depth, the
//! per-helper "emit at most once" cache, and the hot-function/memoization
//! tables that get patched once emission finishes.

use flap_core::buffer::{ByteBuffer, ForwardRef};
use flap_runtime_gen::HelperKind;
use std::collections::HashMap;

use crate::codegen::rodata::{RodataRef, RodataTable};
use crate::config::CompilerConfig;
use crate::symbols::SymbolTable;

/// Whether the expression currently being compiled sits in tail position
/// of the hot or `max`-bounded lambda that contains it, and if so, the
/// bookkeeping a self-call there needs to become a jump-and-rewrite
/// instead of a `call` (`spec.md §4.5`'s tail-call-optimization note).
#[derive(Debug, Clone)]
pub enum TailPosition {
    /// Not in tail position, or the enclosing function isn't eligible:
    /// calls here always emit a real `call`.
    No,
    /// In tail position of `function_name`. `param_slots` holds the
    /// rbp-relative stack offset of each parameter in declaration order
    /// (a same-callee recursive tail call rewrites each slot before
    /// jumping back to `body_start`, taking care to stage rewritten
    /// values through scratch registers first so a later parameter's
    /// new value never clobbers an earlier one still being read).
    SelfRecursive { function_name: String, param_slots: Vec<i32>, body_start: usize },
}

/// A `call rel32` site whose target is another point in the text buffer
/// discovered only after the callee itself has been emitted (a forward
/// call to a lambda defined later, or a recursive call to the enclosing
/// function before its `body_start` offset is known during pass 1).
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub call_site: ForwardRef,
    pub target_name: String,
}

/// A `lea rip, [disp32]` site that must end up pointing at a rodata
/// entry. Both passes record these; the driver resolves them once text
/// and rodata base addresses are fixed, via
/// `text_buf.patch_rel32(fref, (rodata_base + offset) - text_base)`.
#[derive(Debug, Clone)]
pub struct PendingRodataRef {
    pub site: ForwardRef,
    pub target: RodataRef,
}

/// A non-capturing lambda's static closure object needs its function-
/// pointer half patched once the lambda's entry offset is known, but
/// that's a plain 8-byte rodata write, not a `rel32` call-site patch —
/// kept as its own queue instead of overloading [`PendingCall`].
#[derive(Debug, Clone)]
pub struct PendingClosureFixup {
    pub slot: RodataRef,
    pub lambda_name: String,
}

/// What the driver's lambda-body work queue has to emit for one queued
/// function: either an ordinary lambda AST (the common case — a plain
/// `Lambda`, or a per-arity variant synthesized out of a `MultiLambda`),
/// or the clause list of a pattern-dispatched (`(0) => .., (n) => ..`)
/// definition, which needs its own dispatch prologue instead of a plain
/// body compile.
#[derive(Debug, Clone)]
pub enum PendingLambdaBody {
    Lambda(crate::ast::Lambda),
    PatternClauses { clauses: Vec<crate::ast::PatternClause>, arg_slots: Vec<String> },
}

/// One `hot`-bound or `pure`-bound lambda discovered during emission,
/// queued so the driver can reserve its hot-table/memo-table slot and
/// patch it once the lambda's own entry offset is known.
#[derive(Debug, Clone)]
pub struct PendingLambda {
    pub name: String,
    pub entry_offset: Option<usize>,
    pub hot_table_ref: Option<RodataRef>,
    pub memo_slot_ref: Option<RodataRef>,
    /// The lambda's own AST (or pattern-clause list), carried along so
    /// the driver's lambda-body work queue doesn't need a separate
    /// name -> body lookup built by a redundant pre-pass over the
    /// program.
    pub body: PendingLambdaBody,
}

/// One active `N, is_last from list` loop: the label the symbol
/// collector assigned it (`Stmt::Loop::label`/`ReceiveLoop` share the
/// same numbering) and the forward-ref list `break`/`next` need patched
/// once the loop's exit/continue points are known.
#[derive(Debug, Clone, Default)]
pub struct LoopContext {
    pub label: u32,
    pub break_refs: Vec<ForwardRef>,
    pub continue_refs: Vec<ForwardRef>,
    pub base_stack_offset: i32,
}

/// One `arena { ... }` block's guard bookkeeping: the rodata slot
/// holding its `[base_ptr][capacity][offset]` triple and the depth it
/// was entered at (nested arenas get independent slots, `spec.md §4.6`).
#[derive(Debug, Clone)]
pub struct ArenaContext {
    pub slot: RodataRef,
    pub depth: u32,
}

/// The full mutable state of one compilation, threaded through every
/// `expr.rs`/`stmt.rs` function as `&mut FlapCompiler`.
pub struct FlapCompiler {
    pub config: CompilerConfig,
    pub symbols: SymbolTable,

    /// Machine code emitted so far; swapped for a fresh, empty buffer
    /// between pass 1 and pass 2 by the driver (see `spec.md §4.8`).
    pub text: ByteBuffer,
    pub rodata: RodataTable,

    /// `call rel32` sites targeting a named lambda or top-level function,
    /// resolved once every function's entry offset is known.
    pub pending_calls: Vec<PendingCall>,
    /// `lea rip` sites targeting a rodata entry.
    pub pending_rodata_refs: Vec<PendingRodataRef>,
    /// Every lambda/top-level-function's text offset, filled in as each
    /// is emitted; looked up by [`FlapCompiler::pending_calls`]'s resolution
    /// step and by direct-call compilation once a callee has already been
    /// seen.
    pub function_offsets: HashMap<String, usize>,

    /// Helpers already emitted this compilation, keyed by kind, so a
    /// second call site reuses the first emission instead of duplicating
    /// it (`flap_runtime_gen`'s "emit at most once" contract).
    pub helper_offsets: HashMap<HelperKind, usize>,
    /// External (libc/PLT) symbols referenced anywhere in the program,
    /// deduplicated by name, in first-reference order — the container
    /// writer's PLT/GOT layer consumes this directly.
    pub external_symbols: Vec<String>,
    external_symbols_seen: std::collections::HashSet<String>,

    /// Shared libraries the emitted `DT_NEEDED` list must name
    /// (`spec.md §4.7`/§6.3): `"libc.so.6"` always (seeded in `new`),
    /// `"libm.so.6"` only if `**`/a libm FFI call is compiled, plus one
    /// entry per `import`ed C library actually referenced.
    pub needed_libraries: Vec<String>,
    needed_libraries_seen: std::collections::HashSet<String>,

    pub active_loops: Vec<LoopContext>,
    /// Defer-stack-of-stacks: one `Vec<Expr>` per lexical scope that can
    /// `defer`, pushed on scope entry and drained (in reverse order) on
    /// every exit path from that scope, per `spec.md §4.6`.
    pub defer_stacks: Vec<Vec<crate::ast::Expr>>,
    pub active_arenas: Vec<ArenaContext>,
    pub arena_depth: u32,

    pub pending_lambdas: Vec<PendingLambda>,
    pub pending_closure_fixups: Vec<PendingClosureFixup>,
    pub cpuid_flag: Option<RodataRef>,

    /// Names bound to a `MultiLambda` (arity-dispatched) definition, so
    /// `compile_named_call` knows to mangle the call target to
    /// `"{name}#{argc}"` instead of looking up `name` directly. A bare
    /// reference to one of these names as a value (not a direct call)
    /// is not supported — see `compile_multi_lambda_value`.
    pub multi_arity_names: std::collections::HashSet<String>,

    /// Bumped for every byte of extra stack this compilation's parallel
    /// loops or FFI calls need beyond the symbol table's static frame
    /// size, so the prologue's `sub rsp, N` covers both.
    pub max_dynamic_stack: i32,

    /// `true` once pass 1 (size/offset discovery) has completed and the
    /// driver is re-emitting with real addresses; several lowering
    /// routines use this to decide whether a diagnostic should be a hard
    /// error yet (symbol-table lookups that are allowed to be forward
    /// references during pass 1 must have resolved by pass 2).
    pub is_second_pass: bool,

    /// The line number of the statement currently being lowered. Several
    /// `Expr` variants (`Ident`, `Binary`, ...) carry no line of their
    /// own; the statement compiler refreshes this from each `Stmt`'s
    /// `line` field before descending, so expression-level diagnostics
    /// still point somewhere useful.
    pub current_line: usize,
}

impl FlapCompiler {
    pub fn new(config: CompilerConfig, symbols: SymbolTable) -> Self {
        FlapCompiler {
            config,
            symbols,
            text: ByteBuffer::new(),
            rodata: RodataTable::new(),
            pending_calls: Vec::new(),
            pending_rodata_refs: Vec::new(),
            function_offsets: HashMap::new(),
            helper_offsets: HashMap::new(),
            external_symbols: Vec::new(),
            external_symbols_seen: std::collections::HashSet::new(),
            needed_libraries: vec!["libc.so.6".to_string()],
            needed_libraries_seen: ["libc.so.6".to_string()].into_iter().collect(),
            active_loops: Vec::new(),
            defer_stacks: Vec::new(),
            active_arenas: Vec::new(),
            arena_depth: 0,
            pending_lambdas: Vec::new(),
            pending_closure_fixups: Vec::new(),
            cpuid_flag: None,
            multi_arity_names: std::collections::HashSet::new(),
            max_dynamic_stack: 0,
            is_second_pass: false,
            current_line: 0,
        }
    }

    /// Reset everything the two-pass driver needs reset between pass 1
    /// and pass 2 while keeping the symbol table and config fixed (stack
    /// layout must not change between passes, per the state's own
    /// invariant above).
    pub fn begin_second_pass(&mut self) {
        self.text.clear();
        self.rodata = RodataTable::new();
        self.pending_calls.clear();
        self.pending_rodata_refs.clear();
        self.function_offsets.clear();
        self.helper_offsets.clear();
        self.external_symbols.clear();
        self.external_symbols_seen.clear();
        self.needed_libraries = vec!["libc.so.6".to_string()];
        self.needed_libraries_seen = ["libc.so.6".to_string()].into_iter().collect();
        self.active_loops.clear();
        self.defer_stacks.clear();
        self.active_arenas.clear();
        self.arena_depth = 0;
        self.pending_lambdas.clear();
        self.pending_closure_fixups.clear();
        self.cpuid_flag = None;
        self.multi_arity_names.clear();
        self.is_second_pass = true;
    }

    pub fn record_external_symbol(&mut self, symbol: &str) {
        if self.external_symbols_seen.insert(symbol.to_string()) {
            self.external_symbols.push(symbol.to_string());
        }
    }

    pub fn record_needed_library(&mut self, library: &str) {
        if self.needed_libraries_seen.insert(library.to_string()) {
            self.needed_libraries.push(library.to_string());
        }
    }

    pub fn current_loop(&self) -> Option<&LoopContext> {
        self.active_loops.last()
    }

    pub fn current_loop_mut(&mut self) -> Option<&mut LoopContext> {
        self.active_loops.last_mut()
    }

    pub fn find_loop_mut(&mut self, label: u32) -> Option<&mut LoopContext> {
        self.active_loops.iter_mut().rev().find(|l| l.label == label)
    }
}

/// Mangle a Flap identifier into a text-section symbol name: dots and
/// hyphens (valid in namespaced imports) aren't valid in the bare labels
/// the container writer's symbol table uses, so they're replaced with
/// underscores; collisions across distinct source names are accepted as
/// a known limitation (`spec.md §9`'s open questions don't cover this,
/// so it's decided here: first-come wins, no uniquification).
pub fn mangle_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangle_name_replaces_non_identifier_characters() {
        assert_eq!(mangle_name("my.module-fn"), "my_module_fn");
    }

    #[test]
    fn recording_the_same_external_symbol_twice_keeps_it_once() {
        let mut c = FlapCompiler::new(CompilerConfig::new(), SymbolTable::default());
        c.record_external_symbol("malloc");
        c.record_external_symbol("malloc");
        c.record_external_symbol("realloc");
        assert_eq!(c.external_symbols, vec!["malloc".to_string(), "realloc".to_string()]);
    }

    #[test]
    fn libc_is_always_the_first_needed_library() {
        let c = FlapCompiler::new(CompilerConfig::new(), SymbolTable::default());
        assert_eq!(c.needed_libraries, vec!["libc.so.6".to_string()]);
    }

    #[test]
    fn recording_the_same_needed_library_twice_keeps_it_once() {
        let mut c = FlapCompiler::new(CompilerConfig::new(), SymbolTable::default());
        c.record_needed_library("libm.so.6");
        c.record_needed_library("libm.so.6");
        assert_eq!(c.needed_libraries, vec!["libc.so.6".to_string(), "libm.so.6".to_string()]);
    }

    #[test]
    fn begin_second_pass_clears_emission_state_but_keeps_symbols() {
        let mut c = FlapCompiler::new(CompilerConfig::new(), SymbolTable::default());
        c.text.push_u8(0x90);
        c.record_external_symbol("malloc");
        c.begin_second_pass();
        assert_eq!(c.text.len(), 0);
        assert!(c.external_symbols.is_empty());
        assert!(c.is_second_pass);
    }
}
