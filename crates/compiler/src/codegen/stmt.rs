//! The statement compiler (`spec.md §4.6`): assignment, loops (plain,
//! parallel, receive), `defer`, `spawn`, `arena`, and `jump` (`break`/
//! `next`). Every statement function takes `&mut FlapCompiler` and
//! leaves the text buffer positioned right after the statement's code;
//! statements don't produce a value (the trailing-expression rule that
//! does is handled by [`compile_block_expr`]).

use flap_core::emitter::{Cond, Emitter, Mem};
use flap_core::registers::{Gpr, Width, Xmm};

use crate::ast::{Expr, MaxClause, Stmt, ThreadCount};
use crate::codegen::expr::{self, compile as compile_expr};
use crate::codegen::state::{ArenaContext, FlapCompiler, LoopContext, TailPosition};
use crate::error::{CompileError, FlapResult};

/// Compile a sequence of statements that forms a function/lambda body,
/// a `match` clause body, or any other place a `Block(Vec<Stmt>)`
/// appears as an expression. The last statement, if it's a bare
/// expression statement, is compiled with `tail` propagated into it; if
/// the block has no trailing expression statement, it evaluates to `0`.
pub fn compile_block_expr(c: &mut FlapCompiler, stmts: &[Stmt], tail: &TailPosition) -> FlapResult<()> {
    c.defer_stacks.push(Vec::new());
    let result = compile_block_body(c, stmts, tail);
    run_defers_for_current_scope(c)?;
    c.defer_stacks.pop();
    result
}

fn compile_block_body(c: &mut FlapCompiler, stmts: &[Stmt], tail: &TailPosition) -> FlapResult<()> {
    for (i, stmt) in stmts.iter().enumerate() {
        let is_last = i + 1 == stmts.len();
        if is_last {
            if let Stmt::ExpressionStmt(e) = stmt {
                c.current_line = stmt_line(stmt);
                compile_expr(c, e, tail)?;
                return Ok(());
            }
        }
        compile_stmt(c, stmt)?;
    }
    // Empty block or one whose last statement isn't an expression: the
    // value position still needs something in xmm0.
    let mut em = Emitter::new(&mut c.text);
    em.movq_gpr_xmm(Gpr::Rax, Xmm::Xmm0); // preserve nothing, just establish a defined zero below
    drop(em);
    expr::compile(c, &Expr::Number(0.0), &TailPosition::No)
}

/// The `DT_NEEDED` name for a C import: the basename of an explicit
/// `from "..."` path if one was given, otherwise the conventional
/// `lib{name}.so` shared-object naming `ldconfig` itself resolves
/// bare `-lname`-style references against.
fn needed_library_name(url_or_lib: &str, so_path: Option<&str>) -> String {
    if let Some(path) = so_path {
        path.rsplit('/').next().unwrap_or(path).to_string()
    } else {
        format!("lib{url_or_lib}.so")
    }
}

fn stmt_line(stmt: &Stmt) -> usize {
    match stmt {
        Stmt::Assign { line, .. }
        | Stmt::Loop { line, .. }
        | Stmt::ReceiveLoop { line, .. }
        | Stmt::Jump { line, .. }
        | Stmt::Arena { line, .. }
        | Stmt::Defer { line, .. }
        | Stmt::Spawn { line, .. }
        | Stmt::Alias { line, .. }
        | Stmt::Import { line, .. }
        | Stmt::CStructDecl { line, .. }
        | Stmt::Use { line, .. } => *line,
        Stmt::ExpressionStmt(_) => 0,
    }
}

pub fn compile_stmt(c: &mut FlapCompiler, stmt: &Stmt) -> FlapResult<()> {
    c.current_line = stmt_line(stmt);
    match stmt {
        Stmt::Assign { name, value, compound_op, precision, is_update, line, .. } => {
            compile_assign(c, name, value, *compound_op, precision.as_deref(), *is_update, *line)
        }
        Stmt::ExpressionStmt(e) => {
            compile_expr(c, e, &TailPosition::No)?;
            Ok(())
        }
        Stmt::Loop {
            iterator,
            iterable,
            body,
            max_iterations,
            needs_runtime_max_check,
            thread_count,
            reducer,
            base_stack_offset,
            label,
            ..
        } => {
            if thread_count.is_some() {
                compile_parallel_loop(c, iterator, iterable, body, thread_count.as_ref().unwrap(), reducer.as_ref(), *base_stack_offset, *label)
            } else {
                compile_plain_loop(c, iterator, iterable, body, max_iterations.as_ref(), *needs_runtime_max_check, *base_stack_offset, *label)
            }
        }
        Stmt::ReceiveLoop { msg_var, sender_var, address, body, base_stack_offset, .. } => {
            compile_receive_loop(c, msg_var, sender_var, address, body, *base_stack_offset)
        }
        Stmt::Jump { is_break, loop_label, value, .. } => compile_jump(c, *is_break, *loop_label, value.as_ref().map(|v| v.as_ref())),
        Stmt::Arena { body, .. } => {
            compile_arena_body(c, body, &TailPosition::No)?;
            Ok(())
        }
        Stmt::Defer { call, .. } => {
            if let Some(scope) = c.defer_stacks.last_mut() {
                scope.push(call.clone());
            }
            Ok(())
        }
        Stmt::Spawn { expr: e, pipe_params, pipe_block, .. } => compile_spawn(c, e, pipe_params.as_deref(), pipe_block.as_deref()),
        Stmt::Alias { .. } => Ok(()), // purely a front-end renaming; nothing to emit
        Stmt::Import { is_c_library, url_or_lib, so_path, .. } => {
            // Signature/constant harvesting (`pkg-config`/DWARF, `spec.md
            // §1`'s external-collaborator boundary) is out of scope; the
            // one codegen-visible effect of a C import is that the
            // library it names must appear in the emitted `DT_NEEDED`
            // list (`spec.md §4.7`/§6.3), so every call through its
            // namespace actually resolves at load time.
            if *is_c_library {
                c.record_needed_library(&needed_library_name(url_or_lib, so_path.as_deref()));
            }
            Ok(())
        }
        Stmt::Use { .. } => Ok(()),
        Stmt::CStructDecl { .. } => Ok(()), // layout already recorded in SymbolTable::cstruct_layout
    }
}

fn compile_assign(
    c: &mut FlapCompiler,
    name: &str,
    value: &Expr,
    compound_op: Option<crate::ast::CompoundOp>,
    _precision: Option<&str>,
    _is_update: bool,
    line: usize,
) -> FlapResult<()> {
    let Some(&(offset, _mutable)) = c.symbols.offsets.get(name) else {
        return Err(CompileError::UndefinedVariable { name: name.to_string(), line }.into());
    };

    if let Some(op) = compound_op {
        let mut em = Emitter::new(&mut c.text);
        em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::Rbp, offset));
        drop(em);
        expr::push_xmm0(c);
        {
            let mut em = Emitter::new(&mut c.text);
            em.movsd_store(Mem::new(Gpr::Rsp, 0), Xmm::Xmm1);
        }
        compile_expr(c, value, &TailPosition::No)?;
        let mut em = Emitter::new(&mut c.text);
        em.movsd_reg_reg(Xmm::Xmm1, Xmm::Xmm0);
        em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rsp, 0));
        em.add_reg_imm32(Gpr::Rsp, 16);
        match op {
            crate::ast::CompoundOp::Add => em.addsd(Xmm::Xmm0, Xmm::Xmm1),
            crate::ast::CompoundOp::Sub => em.subsd(Xmm::Xmm0, Xmm::Xmm1),
            crate::ast::CompoundOp::Mul => em.mulsd(Xmm::Xmm0, Xmm::Xmm1),
            crate::ast::CompoundOp::Div => {
                drop(em);
                return finish_store(c, offset, |c| {
                    let mut em = Emitter::new(&mut c.text);
                    em.divsd(Xmm::Xmm0, Xmm::Xmm1);
                    drop(em);
                    Ok(())
                });
            }
            crate::ast::CompoundOp::Mod => {
                drop(em);
                let mut em = Emitter::new(&mut c.text);
                em.movsd_reg_reg(Xmm::Xmm2, Xmm::Xmm0);
                em.divsd(Xmm::Xmm2, Xmm::Xmm1);
                em.roundsd(Xmm::Xmm2, Xmm::Xmm2, 3);
                em.mulsd(Xmm::Xmm2, Xmm::Xmm1);
                em.subsd(Xmm::Xmm0, Xmm::Xmm2);
            }
            crate::ast::CompoundOp::Pow => {
                drop(em);
                crate::builtins::call_libm_pow(c)?;
            }
        }
    } else {
        match value {
            Expr::PatternLambda(clauses) => expr::compile_pattern_lambda_value(c, clauses, Some(name))?,
            Expr::MultiLambda(lambdas) => expr::compile_multi_lambda_value(c, lambdas, Some(name))?,
            _ => compile_expr(c, value, &TailPosition::No)?,
        }
    }

    let mut em = Emitter::new(&mut c.text);
    em.movsd_store(Mem::new(Gpr::Rbp, offset), Xmm::Xmm0);
    Ok(())
}

fn finish_store(c: &mut FlapCompiler, offset: i32, f: impl FnOnce(&mut FlapCompiler) -> FlapResult<()>) -> FlapResult<()> {
    f(c)?;
    let mut em = Emitter::new(&mut c.text);
    em.movsd_store(Mem::new(Gpr::Rbp, offset), Xmm::Xmm0);
    Ok(())
}

/// `break`/`next`, from either the statement or expression (`JumpExpr`)
/// grammar position. `loop_label` selects an enclosing loop by its
/// symbol-collector-assigned label; `None` always means the innermost
/// one. Breaking with a value stores it at the loop's result slot
/// (`base_stack_offset - 24`) before jumping to the break target.
pub fn compile_jump(c: &mut FlapCompiler, is_break: bool, loop_label: Option<u32>, value: Option<&Expr>) -> FlapResult<()> {
    if let Some(v) = value {
        compile_expr(c, v, &TailPosition::No)?;
    } else {
        let mut em = Emitter::new(&mut c.text);
        em.mov_reg_imm32(Gpr::Rax, 0);
        em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
    }

    let loop_ctx = match loop_label {
        Some(label) => c.find_loop_mut(label),
        None => c.current_loop_mut(),
    };
    let Some(loop_ctx) = loop_ctx else {
        return Err(CompileError::Other("break/next used outside any loop".into()).into());
    };
    let base = loop_ctx.base_stack_offset;

    let mut em = Emitter::new(&mut c.text);
    em.movsd_store(Mem::new(Gpr::Rbp, base - 24), Xmm::Xmm0);
    let fref = if is_break { em.jmp_rel32() } else { em.jmp_rel32() };
    drop(em);

    let loop_ctx = match loop_label {
        Some(label) => c.find_loop_mut(label).unwrap(),
        None => c.current_loop_mut().unwrap(),
    };
    if is_break {
        loop_ctx.break_refs.push(fref);
    } else {
        loop_ctx.continue_refs.push(fref);
    }
    Ok(())
}

/// A plain (non-parallel, non-reducing) loop over a list/range/map:
/// walk the source collection's elements by index, binding `iterator`
/// to each value, tracking `@i`/`@first`/`@last` bookkeeping in the
/// loop's reserved stack slots (`spec.md §4.6`).
fn compile_plain_loop(
    c: &mut FlapCompiler,
    iterator: &str,
    iterable: &Expr,
    body: &[Stmt],
    max_iterations: Option<&MaxClause>,
    needs_runtime_max_check: bool,
    base_stack_offset: i32,
    label: u32,
) -> FlapResult<()> {
    compile_expr(c, iterable, &TailPosition::No)?;
    let mut em = Emitter::new(&mut c.text);
    em.movq_gpr_xmm(Gpr::R12, Xmm::Xmm0); // collection ptr, held for the whole loop
    em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::R12, 0));
    em.cvttsd2si(Gpr::Rax, Xmm::Xmm1);
    em.movsd_store(Mem::new(Gpr::Rbp, base_stack_offset), Xmm::Xmm1); // cached count (as f64)
    em.mov_reg_imm32(Gpr::Rcx, 0);
    em.mov_mem_reg(Mem::new(Gpr::Rbp, base_stack_offset - 8), Gpr::Rcx, Width::Qword); // @i / @counter

    if let Some(MaxClause::Literal(max)) = max_iterations {
        if needs_runtime_max_check {
            em.cmp_reg_imm32(Gpr::Rax, *max as i32);
            let within = em.jcc_rel32(Cond::Le);
            drop(em);
            crate::builtins::emit_runtime_guard_panic(c, "loop exceeded its declared max iteration count")?;
            let mut em2 = Emitter::new(&mut c.text);
            let target = em2.pos();
            em2.patch_rel32(within, target);
        }
    }

    c.active_loops.push(LoopContext { label, break_refs: Vec::new(), continue_refs: Vec::new(), base_stack_offset });

    let mut em = Emitter::new(&mut c.text);
    let top = em.pos();
    em.mov_reg_mem(Gpr::Rcx, Mem::new(Gpr::Rbp, base_stack_offset - 8), Width::Qword, false);
    em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::Rbp, base_stack_offset));
    em.cvttsd2si(Gpr::Rdx, Xmm::Xmm1);
    em.cmp_reg_reg(Gpr::Rcx, Gpr::Rdx);
    let exit = em.jcc_rel32(Cond::Ge);

    // @first / @last flags
    em.test_reg_reg(Gpr::Rcx, Gpr::Rcx);
    em.mov_reg_imm32(Gpr::Rax, 0);
    em.mov_reg_imm32(Gpr::Rbx, 1);
    em.cmov_reg_reg(Cond::E, Gpr::Rax, Gpr::Rbx);
    em.mov_mem_reg(Mem::new(Gpr::Rbp, base_stack_offset - 16), Gpr::Rax, Width::Byte);
    em.mov_reg_reg(Gpr::Rax, Gpr::Rdx);
    em.add_reg_imm32(Gpr::Rax, -1);
    em.cmp_reg_reg(Gpr::Rcx, Gpr::Rax);
    em.mov_reg_imm32(Gpr::Rax, 0);
    em.cmov_reg_reg(Cond::E, Gpr::Rax, Gpr::Rbx);
    em.mov_mem_reg(Mem::new(Gpr::Rbp, base_stack_offset - 17), Gpr::Rax, Width::Byte);

    em.mov_reg_reg(Gpr::Rax, Gpr::Rcx);
    em.shl_reg_imm8(Gpr::Rax, 3);
    em.add_reg_reg(Gpr::Rax, Gpr::R12);
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rax, 8));
    drop(em);

    let Some(&(iter_offset, _)) = c.symbols.offsets.get(iterator) else {
        return Err(CompileError::UndefinedVariable { name: iterator.to_string(), line: c.current_line }.into());
    };
    let mut em = Emitter::new(&mut c.text);
    em.movsd_store(Mem::new(Gpr::Rbp, iter_offset), Xmm::Xmm0);
    drop(em);

    c.defer_stacks.push(Vec::new());
    compile_stmt_seq(c, body)?;
    run_defers_for_current_scope(c)?;
    c.defer_stacks.pop();

    let continue_target = c.text.len();
    let mut em = Emitter::new(&mut c.text);
    em.mov_reg_mem(Gpr::Rcx, Mem::new(Gpr::Rbp, base_stack_offset - 8), Width::Qword, false);
    em.inc_reg(Gpr::Rcx);
    em.mov_mem_reg(Mem::new(Gpr::Rbp, base_stack_offset - 8), Gpr::Rcx, Width::Qword);
    let back = em.jmp_rel32();
    em.patch_rel32(back, top);
    let exit_target = em.pos();
    em.patch_rel32(exit, exit_target);
    drop(em);

    let loop_ctx = c.active_loops.pop().unwrap();
    for cref in loop_ctx.continue_refs {
        c.text.patch_rel32(cref, continue_target);
    }
    let after = c.text.len();
    for bref in loop_ctx.break_refs {
        c.text.patch_rel32(bref, after);
    }
    let mut em = Emitter::new(&mut c.text);
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rbp, base_stack_offset - 24));
    Ok(())
}

fn compile_stmt_seq(c: &mut FlapCompiler, stmts: &[Stmt]) -> FlapResult<()> {
    for stmt in stmts {
        compile_stmt(c, stmt)?;
    }
    Ok(())
}

fn run_defers_for_current_scope(c: &mut FlapCompiler) -> FlapResult<()> {
    let Some(scope) = c.defer_stacks.last().cloned() else { return Ok(()) };
    for call in scope.iter().rev() {
        expr::push_xmm0(c);
        compile_expr(c, call, &TailPosition::No)?;
        expr::pop_into_xmm1(c);
        let mut em = Emitter::new(&mut c.text);
        em.movsd_reg_reg(Xmm::Xmm0, Xmm::Xmm1);
    }
    Ok(())
}

/// Parallel loop barrier protocol (`spec.md §4.6`, 6 steps): compute the
/// thread count, `mmap` one stack per worker, `clone` each worker onto
/// its slice of the iteration space, spin on a shared `LOCK XADD`
/// counter plus a `futex WAIT`/`WAKE` pair until every worker reaches
/// the barrier, then continue with the reducer (if any) applied to the
/// per-worker partial results.
///
/// A `thread_count` of exactly 1 (the degenerate case `spec.md §9`'s
/// Open Questions flags) skips `clone`/futex entirely and runs the body
/// in this thread, since a one-worker barrier is definitionally already
/// satisfied — this is the decision recorded in `DESIGN.md`.
fn compile_parallel_loop(
    c: &mut FlapCompiler,
    iterator: &str,
    iterable: &Expr,
    body: &[Stmt],
    thread_count: &ThreadCount,
    reducer: Option<&crate::ast::Reducer>,
    base_stack_offset: i32,
    label: u32,
) -> FlapResult<()> {
    if matches!(thread_count, ThreadCount::Literal(1)) {
        return compile_plain_loop(c, iterator, iterable, body, None, false, base_stack_offset, label);
    }
    crate::builtins::emit_parallel_loop(c, iterator, iterable, body, thread_count, reducer, base_stack_offset, label)
}

/// `on addr recv (msg, sender) { ... }` — bind a UDP socket (a literal
/// port scans upward through a `-` range until `bind` succeeds, per
/// `spec.md §4.6`'s bind-scan fallback) and loop forever, handling one
/// datagram per iteration.
fn compile_receive_loop(
    c: &mut FlapCompiler,
    msg_var: &str,
    sender_var: &str,
    address: &Expr,
    body: &[Stmt],
    base_stack_offset: i32,
) -> FlapResult<()> {
    let Expr::String(addr) = address else {
        return Err(CompileError::TypeShape { message: "receive-loop address must be a literal \":port\" or \":lo-hi\" range".into(), line: c.current_line }.into());
    };
    crate::builtins::emit_receive_loop(c, msg_var, sender_var, addr, body, base_stack_offset)
}

/// `defer { ... }` registers its call in the innermost open scope; this
/// function only exists for symmetry with the other statement kinds —
/// the actual registration happens in [`compile_stmt`] directly since it
/// needs `&Expr`, not a compiled value.
pub fn compile_arena_body(c: &mut FlapCompiler, body: &[Stmt], tail: &TailPosition) -> FlapResult<()> {
    let slot = c.rodata.reserve_arena_slot(c.arena_depth);
    c.arena_depth += 1;
    c.active_arenas.push(ArenaContext { slot, depth: c.arena_depth });

    crate::builtins::emit_arena_enter(c, slot)?;
    c.defer_stacks.push(Vec::new());
    let result = compile_block_body(c, body, tail);
    let _ = run_defers_for_current_scope(c);
    c.defer_stacks.pop();
    crate::builtins::emit_arena_exit(c, slot)?;

    c.active_arenas.pop();
    c.arena_depth -= 1;
    result
}

/// `spawn expr` / `spawn expr | (params) { block }` — fire-and-forget a
/// child process via `clone` with no shared-memory barrier, optionally
/// piping its stdout into the trailing block's body.
fn compile_spawn(c: &mut FlapCompiler, expr: &Expr, pipe_params: Option<&[String]>, pipe_block: Option<&[Stmt]>) -> FlapResult<()> {
    crate::builtins::emit_spawn(c, expr, pipe_params, pipe_block)
}
