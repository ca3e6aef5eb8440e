//! Stack-slot assignment and loop-frame sizing.
//!
//! Every local binding gets a 16-byte-aligned slot on the function's
//! stack frame; this pass walks the AST once to decide where. It is
//! run twice per compilation (once ahead of the size-discovery pass,
//! once ahead of the address-patching pass) and must produce identical
//! offsets both times, since the two-pass driver assumes stack layout
//! is independent of section addresses.

use crate::ast::*;
use std::collections::HashMap;

/// Stack-frame footprint reserved for a loop's bookkeeping (iteration
/// counter, first/last flags, and — for list loops — the cursor and
/// length). Sized in 16-byte-aligned units.
pub const RANGE_NO_CHECK_FRAME: i32 = 32;
pub const RANGE_WITH_CHECK_FRAME: i32 = 48;
pub const LIST_LOOP_FRAME: i32 = 64;

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    /// name -> (rbp-relative offset, is_mutable)
    pub offsets: HashMap<String, (i32, bool)>,
    pub frame_size: i32,
    /// cstruct name -> (SIZEOF, field name -> OFFSET)
    pub cstruct_layout: HashMap<String, (u32, HashMap<String, u32>)>,
}

pub struct SymbolCollector {
    next_offset: i32,
    table: SymbolTable,
    arena_depth: u32,
}

impl SymbolCollector {
    pub fn new() -> Self {
        SymbolCollector { next_offset: -16, table: SymbolTable::default(), arena_depth: 0 }
    }

    pub fn collect(mut self, program: &Program) -> SymbolTable {
        for stmt in &program.statements {
            self.visit_stmt(stmt);
        }
        self.table.frame_size = align_up((-self.next_offset) as i32, 16);
        self.table
    }

    fn alloc_slot(&mut self, name: &str, mutable: bool) -> i32 {
        if let Some((offset, _)) = self.table.offsets.get(name) {
            return *offset;
        }
        let offset = self.next_offset;
        self.next_offset -= 16;
        self.table.offsets.insert(name.to_string(), (offset, mutable));
        offset
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Assign { name, value, kind, .. } => {
                self.visit_expr(value);
                self.alloc_slot(name, *kind != MutKind::Immutable);
            }
            Stmt::ExpressionStmt(e) => self.visit_expr(e),
            Stmt::Loop { iterator, iterable, body, thread_count, reducer, .. } => {
                self.visit_expr(iterable);
                self.alloc_slot(iterator, false);
                let frame = match (thread_count, is_literal_range(iterable)) {
                    (_, false) if is_range(iterable) => RANGE_WITH_CHECK_FRAME,
                    (_, true) => RANGE_NO_CHECK_FRAME,
                    _ => LIST_LOOP_FRAME,
                };
                self.next_offset -= frame;
                for s in body {
                    self.visit_stmt(s);
                }
                if let Some(r) = reducer {
                    self.alloc_slot(&r.params.0, true);
                    self.alloc_slot(&r.params.1, true);
                    for s in &r.body {
                        self.visit_stmt(s);
                    }
                }
            }
            Stmt::ReceiveLoop { msg_var, sender_var, address, body, .. } => {
                self.visit_expr(address);
                self.alloc_slot(msg_var, false);
                self.alloc_slot(sender_var, false);
                self.next_offset -= LIST_LOOP_FRAME;
                for s in body {
                    self.visit_stmt(s);
                }
            }
            Stmt::Jump { value, .. } => {
                if let Some(v) = value {
                    self.visit_expr(v);
                }
            }
            Stmt::Arena { body, .. } => {
                self.arena_depth += 1;
                for s in body {
                    self.visit_stmt(s);
                }
                self.arena_depth -= 1;
            }
            Stmt::Defer { call, .. } => self.visit_expr(call),
            Stmt::Spawn { expr, pipe_block, .. } => {
                self.visit_expr(expr);
                if let Some(body) = pipe_block {
                    for s in body {
                        self.visit_stmt(s);
                    }
                }
            }
            Stmt::Alias { .. } | Stmt::Import { .. } | Stmt::Use { .. } => {}
            Stmt::CStructDecl { name, fields, computed_size, .. } => {
                let mut field_offsets = HashMap::new();
                for f in fields {
                    field_offsets.insert(f.name.clone(), f.offset);
                }
                self.table.cstruct_layout.insert(name.clone(), (*computed_size, field_offsets));
            }
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Binary(_, a, b) => {
                self.visit_expr(a);
                self.visit_expr(b);
            }
            Expr::Unary(_, a) | Expr::Postfix(_, a) | Expr::Cast(a, _) | Expr::Length(a) => {
                self.visit_expr(a)
            }
            Expr::Range(a, b, _) => {
                self.visit_expr(a);
                self.visit_expr(b);
            }
            Expr::List(items) => items.iter().for_each(|e| self.visit_expr(e)),
            Expr::Map(keys, values) => {
                keys.iter().for_each(|e| self.visit_expr(e));
                values.iter().for_each(|e| self.visit_expr(e));
            }
            Expr::Index(a, b) => {
                self.visit_expr(a);
                self.visit_expr(b);
            }
            Expr::Slice { collection, start, end, step } => {
                self.visit_expr(collection);
                [start, end, step].into_iter().flatten().for_each(|e| self.visit_expr(e));
            }
            Expr::Lambda(l) => {
                for p in &l.params {
                    self.alloc_slot(p, false);
                }
                self.visit_expr(&l.body);
            }
            Expr::PatternLambda(clauses) => {
                let arity = clauses.first().map(|c| c.patterns.len()).unwrap_or(0);
                for i in 0..arity {
                    self.alloc_slot(&pattern_positional_name(i), false);
                }
                for c in clauses {
                    for p in &c.patterns {
                        if let Pattern::Bind(name) = p {
                            self.alloc_slot(name, false);
                        }
                    }
                    self.visit_expr(&c.body);
                }
            }
            Expr::MultiLambda(lambdas) => {
                for l in lambdas {
                    for p in &l.params {
                        self.alloc_slot(p, false);
                    }
                    self.visit_expr(&l.body);
                }
            }
            Expr::DirectCall { callee, args } => {
                self.visit_expr(callee);
                args.iter().for_each(|e| self.visit_expr(e));
            }
            Expr::Call { args, .. } => args.iter().for_each(|e| self.visit_expr(e)),
            Expr::Match { condition, clauses, default_expr, .. } => {
                self.visit_expr(condition);
                for c in clauses {
                    if let Some(g) = &c.guard {
                        self.visit_expr(g);
                    }
                    self.visit_expr(&c.result);
                }
                self.visit_expr(default_expr);
            }
            Expr::Block(stmts) => stmts.iter().for_each(|s| self.visit_stmt(s)),
            Expr::Pipe(a, b)
            | Expr::Parallel(a, b)
            | Expr::ConcurrentGather(a, b)
            | Expr::Send(a, b)
            | Expr::In(a, b) => {
                self.visit_expr(a);
                self.visit_expr(b);
            }
            Expr::Vector(items, _) => items.iter().for_each(|e| self.visit_expr(e)),
            Expr::JumpExpr { value, .. } => {
                if let Some(v) = value {
                    self.visit_expr(v);
                }
            }
            Expr::StructLiteral { fields, .. } => {
                fields.iter().for_each(|(_, e)| self.visit_expr(e))
            }
            Expr::ArenaExpr(stmts) => stmts.iter().for_each(|s| self.visit_stmt(s)),
            Expr::Number(_)
            | Expr::String(_)
            | Expr::FString(_)
            | Expr::Ident(_)
            | Expr::NamespacedIdent(_, _)
            | Expr::Unsafe(_)
            | Expr::LoopState(_, _) => {}
        }
    }
}

/// The stack slot name a pattern-dispatched lambda's `i`-th positional
/// argument is marshaled into before clause matching begins — distinct
/// from any `Pattern::Bind` name a clause introduces for that same
/// position, since a `Wildcard`/`Literal` clause binds nothing.
pub fn pattern_positional_name(i: usize) -> String {
    format!("__pat_arg{i}")
}

fn is_range(expr: &Expr) -> bool {
    matches!(expr, Expr::Range(_, _, _))
}

fn is_literal_range(expr: &Expr) -> bool {
    matches!(expr, Expr::Range(a, b, _) if matches!(**a, Expr::Number(_)) && matches!(**b, Expr::Number(_)))
}

fn align_up(n: i32, align: i32) -> i32 {
    (n + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_distinct_16_byte_aligned_slots() {
        let prog = Program {
            statements: vec![
                Stmt::Assign {
                    name: "a".into(),
                    value: Expr::Number(1.0),
                    kind: MutKind::Immutable,
                    compound_op: None,
                    precision: None,
                    hot: false,
                    is_update: false,
                    line: 0,
                },
                Stmt::Assign {
                    name: "b".into(),
                    value: Expr::Number(2.0),
                    kind: MutKind::Mutable,
                    compound_op: None,
                    precision: None,
                    hot: false,
                    is_update: false,
                    line: 0,
                },
            ],
        };
        let table = SymbolCollector::new().collect(&prog);
        let (off_a, mut_a) = table.offsets["a"];
        let (off_b, mut_b) = table.offsets["b"];
        assert_eq!(off_a % 16, 0);
        assert_eq!(off_b % 16, 0);
        assert_ne!(off_a, off_b);
        assert!(!mut_a);
        assert!(mut_b);
    }

    #[test]
    fn collecting_twice_is_idempotent() {
        let prog = Program {
            statements: vec![Stmt::Assign {
                name: "x".into(),
                value: Expr::Number(1.0),
                kind: MutKind::Mutable,
                compound_op: None,
                precision: None,
                hot: false,
                is_update: false,
                line: 0,
            }],
        };
        let first = SymbolCollector::new().collect(&prog);
        let second = SymbolCollector::new().collect(&prog);
        assert_eq!(first.offsets["x"], second.offsets["x"]);
        assert_eq!(first.frame_size, second.frame_size);
    }

    #[test]
    fn list_loop_reserves_a_larger_frame_than_a_literal_range_loop() {
        let range_loop = Program {
            statements: vec![Stmt::Loop {
                iterator: "i".into(),
                iterable: Expr::Range(Box::new(Expr::Number(0.0)), Box::new(Expr::Number(10.0)), false),
                body: vec![],
                max_iterations: None,
                needs_runtime_max_check: false,
                thread_count: None,
                reducer: None,
                base_stack_offset: 0,
                label: 1,
                line: 0,
            }],
        };
        let list_loop = Program {
            statements: vec![Stmt::Loop {
                iterator: "i".into(),
                iterable: Expr::Ident("xs".into()),
                body: vec![],
                max_iterations: None,
                needs_runtime_max_check: true,
                thread_count: None,
                reducer: None,
                base_stack_offset: 0,
                label: 1,
                line: 0,
            }],
        };
        let range_table = SymbolCollector::new().collect(&range_loop);
        let list_table = SymbolCollector::new().collect(&list_loop);
        assert!(list_table.frame_size > range_table.frame_size);
    }
}
