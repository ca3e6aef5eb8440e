//! The expression compiler (`spec.md §4.5`): lowers every `Expr` variant
//! into `Emitter` calls against the compiler's in-progress text buffer,
//! always leaving the result in `xmm0` as an `f64` — including pointers,
//! which round-trip through a GPR via `movq` (`spec.md §9`'s
//! pointer-through-f64 note).

use flap_core::emitter::{Cond, Emitter, Mem};
use flap_core::registers::{Gpr, Width, Xmm, SYSV_INT_ARGS, SYSV_XMM_ARGS};
use flap_runtime_gen::HelperKind;

use crate::ast::{BinOp, Expr, Lambda, MatchClause, Pattern, PatternClause, UnOp};
use crate::codegen::state::{
    FlapCompiler, PendingCall, PendingClosureFixup, PendingLambda, PendingLambdaBody,
    PendingRodataRef, TailPosition,
};
use crate::error::{CompileError, FlapResult};
use crate::symbols::pattern_positional_name;

/// Compile `expr`, leaving its value in `xmm0`. `tail` describes whether
/// `expr` sits in tail position of the enclosing lambda, propagated into
/// `Match`/`Block` results and consulted by `Call` for self-recursive
/// tail-call optimization.
pub fn compile(c: &mut FlapCompiler, expr: &Expr, tail: &TailPosition) -> FlapResult<()> {
    match expr {
        Expr::Number(n) => compile_number(c, *n),
        Expr::String(s) => compile_flap_string(c, s),
        Expr::FString(parts) => compile_fstring(c, parts, tail),
        Expr::Ident(name) => compile_ident(c, name),
        Expr::NamespacedIdent(ns, name) => compile_ident(c, &format!("{ns}.{name}")),
        Expr::Binary(op, lhs, rhs) => compile_binary(c, *op, lhs, rhs),
        Expr::Unary(op, operand) => compile_unary(c, *op, operand),
        Expr::Postfix(op, operand) => compile_postfix(c, *op, operand),
        Expr::Cast(inner, ty) => compile_cast(c, inner, ty),
        Expr::Range(start, end, _inclusive) => compile_literal_range(c, start, end),
        Expr::List(items) => compile_list_literal(c, items),
        Expr::Map(keys, values) => compile_map_literal(c, keys, values),
        Expr::Index(coll, idx) => compile_index(c, coll, idx),
        Expr::Slice { collection, start, end, step } => compile_slice(c, collection, start, end, step),
        Expr::Length(inner) => compile_length(c, inner),
        Expr::Lambda(lambda) => compile_lambda_value(c, lambda),
        Expr::PatternLambda(clauses) => compile_pattern_lambda_value(c, clauses, None),
        Expr::MultiLambda(lambdas) => compile_multi_lambda_value(c, lambdas, None),
        Expr::DirectCall { callee, args } => compile_direct_call(c, callee, args),
        Expr::Call { name, args, line, needs_recursion_check, recursion_limit, .. } => {
            if *needs_recursion_check && recursion_limit.is_none() {
                return Err(CompileError::MissingRecursionMax { name: name.clone(), line: *line }.into());
            }
            compile_named_call(c, name, args, *line, tail)
        }
        Expr::Match { condition, clauses, default_expr, .. } => {
            compile_match(c, condition, clauses, default_expr, tail)
        }
        Expr::Block(stmts) => crate::codegen::stmt::compile_block_expr(c, stmts, tail),
        Expr::In(value, container) => compile_in(c, value, container),
        Expr::JumpExpr { label, value, is_break } => {
            crate::codegen::stmt::compile_jump(c, *is_break, *label, value.as_deref())
        }
        Expr::LoopState(kind, level) => compile_loop_state(c, *kind, *level),
        Expr::StructLiteral { name, fields } => compile_struct_literal(c, name, fields),
        Expr::ArenaExpr(stmts) => crate::codegen::stmt::compile_arena_body(c, stmts, tail),
        Expr::Pipe(left, right) => compile_pipe(c, left, right),
        Expr::Parallel(list, lambda) => compile_parallel_map(c, list, lambda),
        Expr::ConcurrentGather(_, _) => {
            Err(CompileError::NotYetImplemented { feature: "|||  concurrent gather".into() }.into())
        }
        Expr::Send(target, message) => compile_send(c, target, message),
        Expr::Unsafe(block) => compile_unsafe(c, block),
        Expr::Vector(items, size) => compile_vector(c, items, *size),
    }
}

fn compile_number(c: &mut FlapCompiler, n: f64) -> FlapResult<()> {
    let mut em = Emitter::new(&mut c.text);
    if n.fract() == 0.0 && n.abs() < (1i64 << 53) as f64 {
        em.mov_reg_imm64(Gpr::Rax, n as i64);
        em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
    } else {
        drop(em);
        load_rodata_f64(c, n);
    }
    Ok(())
}

/// Load a rodata-resident constant double into `xmm0` via `lea rip` +
/// `movsd`, recording the pending rip-relative patch for the driver.
fn load_rodata_f64(c: &mut FlapCompiler, n: f64) {
    let r = c.rodata.intern_f64(n);
    let mut em = Emitter::new(&mut c.text);
    let site = em.lea_rip(Gpr::Rax);
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rax, 0));
    c.pending_rodata_refs.push(PendingRodataRef { site, target: r });
}

fn compile_flap_string(c: &mut FlapCompiler, s: &str) -> FlapResult<()> {
    let codepoints: Vec<u32> = s.chars().map(|ch| ch as u32).collect();
    let r = c.rodata.intern_flap_string(&codepoints);
    let mut em = Emitter::new(&mut c.text);
    let site = em.lea_rip(Gpr::Rax);
    em.movq_xmm_gpr(Xmm::Xmm0, Gpr::Rax);
    c.pending_rodata_refs.push(PendingRodataRef { site, target: r });
    Ok(())
}

fn compile_fstring(c: &mut FlapCompiler, parts: &[crate::ast::FStringPart], tail: &TailPosition) -> FlapResult<()> {
    // Start from an empty Flap string, then fold literal chunks and
    // evaluated-and-stringified expression chunks through the runtime
    // concat helper, left to right (`spec.md §4.5`'s F-string contract).
    compile_flap_string(c, "")?;
    for part in parts {
        if !part.literal.is_empty() {
            let literal_offset_save = c.text.len();
            let _ = literal_offset_save;
            push_xmm0(c);
            compile_flap_string(c, &part.literal)?;
            pop_into_xmm1(c);
            concat_xmm1_xmm0_into_xmm0(c);
        }
        if let Some(expr) = &part.expr {
            push_xmm0(c);
            compile(c, expr, &TailPosition::No)?;
            crate::builtins::stringify_in_place(c)?;
            pop_into_xmm1(c);
            concat_xmm1_xmm0_into_xmm0(c);
        }
    }
    let _ = tail;
    Ok(())
}

/// Push the current `xmm0` (bitcast through a GPR) onto the runtime
/// stack — the 16-byte spill slot the binary-op and call-argument
/// discipline shares (`spec.md §4.5`).
pub fn push_xmm0(c: &mut FlapCompiler) {
    let mut em = Emitter::new(&mut c.text);
    em.sub_reg_imm32(Gpr::Rsp, 16);
    em.movsd_store(Mem::new(Gpr::Rsp, 0), Xmm::Xmm0);
}

pub fn pop_into_xmm1(c: &mut FlapCompiler) {
    let mut em = Emitter::new(&mut c.text);
    em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::Rsp, 0));
    em.add_reg_imm32(Gpr::Rsp, 16);
}

fn concat_xmm1_xmm0_into_xmm0(c: &mut FlapCompiler) {
    // string_concat helper: (a: xmm0, b: xmm1) -> xmm0. Accumulator was
    // pushed first, so it is in xmm1 after the pop and the new piece is
    // in xmm0 already.
    let mut em = Emitter::new(&mut c.text);
    em.movq_gpr_xmm(Gpr::Rdi, Xmm::Xmm1);
    em.movq_gpr_xmm(Gpr::Rsi, Xmm::Xmm0);
    let site = em.call_rel32();
    drop(em);
    emit_helper_once(c, HelperKind::StringConcat, flap_runtime_gen::string_concat::emit);
    c.pending_calls.push(PendingCall { call_site: site, target_name: helper_label(HelperKind::StringConcat) });
}

/// Emit `helper_kind`'s machine code into the text buffer at most once
/// per compilation pass, returning its entry offset either way. Helpers
/// are appended wherever the first call site happens to be mid-stream
/// rather than collected into a trailing region; straight-line code
/// after the call simply picks up past the helper body.
pub fn emit_helper_once(
    c: &mut FlapCompiler,
    kind: HelperKind,
    emit_fn: fn(&mut flap_core::buffer::ByteBuffer) -> flap_runtime_gen::EmittedHelper,
) -> usize {
    if let Some(&offset) = c.helper_offsets.get(&kind) {
        return offset;
    }
    let helper = emit_fn(&mut c.text);
    for ext in helper.external_calls {
        c.record_external_symbol(ext.symbol);
        c.pending_calls.push(PendingCall { call_site: ext.call_site, target_name: format!("@plt:{}", ext.symbol) });
    }
    c.helper_offsets.insert(kind, helper.entry_offset);
    // Mirrored into the same name->offset table direct/self calls resolve
    // against, so the driver's final patching pass can treat a call to a
    // runtime helper exactly like a call to a named lambda.
    c.function_offsets.insert(helper_label(kind), helper.entry_offset);
    helper.entry_offset
}

pub(crate) fn helper_label(kind: HelperKind) -> String {
    format!("@helper:{kind:?}")
}

fn compile_ident(c: &mut FlapCompiler, name: &str) -> FlapResult<()> {
    if let Some(&(offset, _mutable)) = c.symbols.offsets.get(name) {
        let mut em = Emitter::new(&mut c.text);
        em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rbp, offset));
        return Ok(());
    }
    if c.function_offsets.contains_key(name) || c.pending_lambdas.iter().any(|l| l.name == name) {
        // A bare reference to a known function name yields its closure
        // object address (used when passing a named function as a value).
        let r = c.rodata.reserve_static_closure(name);
        let mut em = Emitter::new(&mut c.text);
        let site = em.lea_rip(Gpr::Rax);
        em.movq_xmm_gpr(Xmm::Xmm0, Gpr::Rax);
        c.pending_rodata_refs.push(PendingRodataRef { site, target: r });
        return Ok(());
    }
    Err(CompileError::UndefinedVariable { name: name.to_string(), line: c.current_line }.into())
}

fn compile_binary(c: &mut FlapCompiler, op: BinOp, lhs: &Expr, rhs: &Expr) -> FlapResult<()> {
    match op {
        BinOp::ErrorPropagate => return compile_error_propagate(c, lhs, rhs),
        BinOp::Cons => return compile_cons(c, lhs, rhs),
        BinOp::And => return compile_short_circuit(c, lhs, rhs, true),
        BinOp::Or => return compile_short_circuit(c, lhs, rhs, false),
        _ => {}
    }

    compile(c, lhs, &TailPosition::No)?;
    push_xmm0(c);
    compile(c, rhs, &TailPosition::No)?;
    {
        let mut em = Emitter::new(&mut c.text);
        em.movsd_reg_reg(Xmm::Xmm1, Xmm::Xmm0);
    }
    pop_into_xmm1_keep_rhs_in_xmm1_reload_lhs(c);

    match op {
        BinOp::Add => arith(c, |em| em.addsd(Xmm::Xmm0, Xmm::Xmm1)),
        BinOp::Sub => arith(c, |em| em.subsd(Xmm::Xmm0, Xmm::Xmm1)),
        BinOp::Mul => arith(c, |em| em.mulsd(Xmm::Xmm0, Xmm::Xmm1)),
        BinOp::Div => compile_guarded_div(c, false),
        BinOp::Mod => compile_guarded_div(c, true),
        BinOp::Pow => crate::builtins::call_libm_pow(c),
        BinOp::FusedMulAdd => {
            Err(CompileError::NotYetImplemented { feature: "*+  fused multiply-add (no FMA3 kernel)".into() }.into())
        }
        BinOp::Shl | BinOp::Shr | BinOp::Rol | BinOp::Ror => compile_shift(c, op),
        BinOp::BitOr | BinOp::BitAnd | BinOp::BitXor => compile_bitwise(c, op),
        BinOp::Lt => compile_compare(c, Cond::B),
        BinOp::Lte => compile_compare(c, Cond::Be),
        BinOp::Gt => compile_compare(c, Cond::A),
        BinOp::Gte => compile_compare(c, Cond::Ae),
        BinOp::Eq => compile_compare(c, Cond::E),
        BinOp::NotEq => compile_compare(c, Cond::Ne),
        BinOp::Xor => compile_bool_xor(c),
        BinOp::In => compile_in_binary(c),
        BinOp::And | BinOp::Or | BinOp::Cons | BinOp::ErrorPropagate => unreachable!(),
    }
}

/// The spill discipline restores the left operand into `xmm0` and keeps
/// the already-computed right operand sitting in `xmm1` — the reverse of
/// a naive pop, since the value that needs to come off the stack is the
/// *left* one, saved before the (possibly call-laden) right side ran.
fn pop_into_xmm1_keep_rhs_in_xmm1_reload_lhs(c: &mut FlapCompiler) {
    let mut em = Emitter::new(&mut c.text);
    // xmm1 already holds rhs (copied from xmm0 just before this call).
    // Swap it to xmm2, reload lhs from the stack into xmm0, then move
    // rhs back into xmm1 so every caller sees the conventional
    // (xmm0 = lhs, xmm1 = rhs) layout.
    em.movsd_reg_reg(Xmm::Xmm2, Xmm::Xmm1);
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rsp, 0));
    em.add_reg_imm32(Gpr::Rsp, 16);
    em.movsd_reg_reg(Xmm::Xmm1, Xmm::Xmm2);
}

fn arith(c: &mut FlapCompiler, f: impl FnOnce(&mut Emitter)) -> FlapResult<()> {
    let mut em = Emitter::new(&mut c.text);
    f(&mut em);
    Ok(())
}

/// Division/modulo guard: if the divisor (xmm1) is exactly `0.0`, write a
/// fixed message to stderr and `exit(1)` before ever reaching `divsd`/
/// `idiv` (`spec.md §4.5`).
fn compile_guarded_div(c: &mut FlapCompiler, is_mod: bool) -> FlapResult<()> {
    let zero = c.rodata.intern_f64(0.0);
    let mut em = Emitter::new(&mut c.text);
    let site = em.lea_rip(Gpr::Rax);
    em.movsd_load(Xmm::Xmm2, Mem::new(Gpr::Rax, 0));
    c.pending_rodata_refs.push(PendingRodataRef { site, target: zero });
    let mut em = Emitter::new(&mut c.text);
    em.ucomisd(Xmm::Xmm1, Xmm::Xmm2);
    let nonzero = em.jcc_rel32(Cond::Ne);
    drop(em);
    crate::builtins::emit_runtime_guard_panic(c, "division by zero")?;
    let mut em = Emitter::new(&mut c.text);
    let target = em.pos();
    em.patch_rel32(nonzero, target);
    if is_mod {
        // f64 modulo: a - floor(a/b)*b (truncating toward zero per the
        // `%` operator's integer-flavored semantics elsewhere in Flap).
        em.movsd_reg_reg(Xmm::Xmm2, Xmm::Xmm0);
        em.divsd(Xmm::Xmm2, Xmm::Xmm1);
        em.roundsd(Xmm::Xmm2, Xmm::Xmm2, 3);
        em.mulsd(Xmm::Xmm2, Xmm::Xmm1);
        em.subsd(Xmm::Xmm0, Xmm::Xmm2);
    } else {
        em.divsd(Xmm::Xmm0, Xmm::Xmm1);
    }
    Ok(())
}

fn compile_shift(c: &mut FlapCompiler, op: BinOp) -> FlapResult<()> {
    let mut em = Emitter::new(&mut c.text);
    em.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
    em.cvttsd2si(Gpr::Rcx, Xmm::Xmm1);
    let kind = match op {
        BinOp::Shl => flap_core::emitter::ShiftKind::Shl,
        BinOp::Shr => flap_core::emitter::ShiftKind::Shr,
        BinOp::Rol => flap_core::emitter::ShiftKind::Rol,
        BinOp::Ror => flap_core::emitter::ShiftKind::Ror,
        _ => unreachable!(),
    };
    em.shift_reg_cl(Gpr::Rax, kind);
    em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
    Ok(())
}

fn compile_bitwise(c: &mut FlapCompiler, op: BinOp) -> FlapResult<()> {
    let mut em = Emitter::new(&mut c.text);
    em.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
    em.cvttsd2si(Gpr::Rcx, Xmm::Xmm1);
    match op {
        BinOp::BitOr => em.or_reg_reg(Gpr::Rax, Gpr::Rcx),
        BinOp::BitAnd => em.and_reg_reg(Gpr::Rax, Gpr::Rcx),
        BinOp::BitXor => em.xor_reg_reg(Gpr::Rax, Gpr::Rcx),
        _ => unreachable!(),
    }
    em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
    Ok(())
}

fn compile_compare(c: &mut FlapCompiler, cc: Cond) -> FlapResult<()> {
    let mut em = Emitter::new(&mut c.text);
    em.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
    em.mov_reg_imm32(Gpr::Rax, 0);
    em.mov_reg_imm32(Gpr::Rcx, 1);
    em.cmov_reg_reg(cc, Gpr::Rax, Gpr::Rcx);
    em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
    Ok(())
}

fn compile_bool_xor(c: &mut FlapCompiler) -> FlapResult<()> {
    let mut em = Emitter::new(&mut c.text);
    em.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
    em.cvttsd2si(Gpr::Rcx, Xmm::Xmm1);
    em.test_reg_reg(Gpr::Rax, Gpr::Rax);
    em.mov_reg_imm32(Gpr::Rax, 0);
    em.mov_reg_imm32(Gpr::Rdx, 1);
    em.cmov_reg_reg(Cond::Ne, Gpr::Rax, Gpr::Rdx);
    em.test_reg_reg(Gpr::Rcx, Gpr::Rcx);
    em.mov_reg_imm32(Gpr::Rcx, 0);
    em.cmov_reg_reg(Cond::Ne, Gpr::Rcx, Gpr::Rdx);
    em.xor_reg_reg(Gpr::Rax, Gpr::Rcx);
    em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
    Ok(())
}

/// `and`/`or` short-circuit: the right side is only evaluated if the
/// left doesn't already decide the result (false for `and`, true for
/// `or`), so unlike every other binary operator it must NOT unconditionally
/// evaluate both sides through the spill discipline.
fn compile_short_circuit(c: &mut FlapCompiler, lhs: &Expr, rhs: &Expr, is_and: bool) -> FlapResult<()> {
    compile(c, lhs, &TailPosition::No)?;
    let mut em = Emitter::new(&mut c.text);
    em.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
    em.test_reg_reg(Gpr::Rax, Gpr::Rax);
    let short_circuit = if is_and { em.jcc_rel32(Cond::E) } else { em.jcc_rel32(Cond::Ne) };
    drop(em);
    compile(c, rhs, &TailPosition::No)?;
    let mut em = Emitter::new(&mut c.text);
    em.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
    em.test_reg_reg(Gpr::Rax, Gpr::Rax);
    em.mov_reg_imm32(Gpr::Rax, 0);
    em.mov_reg_imm32(Gpr::Rcx, 1);
    em.cmov_reg_reg(Cond::Ne, Gpr::Rax, Gpr::Rcx);
    let done = em.jmp_rel32();
    let short_target = em.pos();
    em.patch_rel32(short_circuit, short_target);
    em.mov_reg_imm32(Gpr::Rax, if is_and { 0 } else { 1 });
    let done_target = em.pos();
    em.patch_rel32(done, done_target);
    em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
    Ok(())
}

/// `lhs or! rhs`: evaluate `lhs`; if nonzero, that's the result; if
/// zero, print `rhs` (a string literal) to stderr and `exit(1)`.
fn compile_error_propagate(c: &mut FlapCompiler, lhs: &Expr, rhs: &Expr) -> FlapResult<()> {
    compile(c, lhs, &TailPosition::No)?;
    let mut em = Emitter::new(&mut c.text);
    em.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
    em.test_reg_reg(Gpr::Rax, Gpr::Rax);
    let ok = em.jcc_rel32(Cond::Ne);
    drop(em);
    let message = match rhs {
        Expr::String(s) => s.clone(),
        _ => String::new(),
    };
    crate::builtins::emit_runtime_guard_panic(c, &message)?;
    let mut em = Emitter::new(&mut c.text);
    let target = em.pos();
    em.patch_rel32(ok, target);
    Ok(())
}

/// `a :: b` — cons a single element onto the front of a list, producing
/// a freshly allocated list one element longer.
fn compile_cons(c: &mut FlapCompiler, lhs: &Expr, rhs: &Expr) -> FlapResult<()> {
    compile(c, lhs, &TailPosition::No)?;
    push_xmm0(c);
    compile(c, rhs, &TailPosition::No)?;
    let mut em = Emitter::new(&mut c.text);
    em.movq_gpr_xmm(Gpr::R12, Xmm::Xmm0); // list ptr (rhs)
    em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::Rsp, 0)); // head value (lhs)
    em.add_reg_imm32(Gpr::Rsp, 16);
    em.movsd_load(Xmm::Xmm2, Mem::new(Gpr::R12, 0)); // count
    em.cvttsd2si(Gpr::R13, Xmm::Xmm2);
    em.inc_reg(Gpr::R13);
    em.mov_reg_reg(Gpr::Rdi, Gpr::R13);
    em.shl_reg_imm8(Gpr::Rdi, 3);
    em.add_reg_imm32(Gpr::Rdi, 8);
    let call_site = em.call_rel32();
    drop(em);
    c.record_external_symbol("malloc");
    c.pending_calls.push(PendingCall { call_site, target_name: "@plt:malloc".into() });
    let mut em = Emitter::new(&mut c.text);
    em.cvtsi2sd(Xmm::Xmm3, Gpr::R13);
    em.movsd_store(Mem::new(Gpr::Rax, 0), Xmm::Xmm3);
    em.movsd_store(Mem::new(Gpr::Rax, 8), Xmm::Xmm1);
    // copy old elements
    em.mov_reg_reg(Gpr::R14, Gpr::Rax);
    em.mov_reg_imm32(Gpr::Rcx, 0);
    let top = em.pos();
    em.cvttsd2si(Gpr::Rdx, Xmm::Xmm2);
    em.cmp_reg_reg(Gpr::Rcx, Gpr::Rdx);
    let done = em.jcc_rel32(Cond::Ge);
    em.mov_reg_reg(Gpr::R15, Gpr::Rcx);
    em.shl_reg_imm8(Gpr::R15, 3);
    em.add_reg_reg(Gpr::R15, Gpr::R12);
    em.movsd_load(Xmm::Xmm4, Mem::new(Gpr::R15, 8));
    em.mov_reg_reg(Gpr::R15, Gpr::Rcx);
    em.shl_reg_imm8(Gpr::R15, 3);
    em.add_reg_reg(Gpr::R15, Gpr::R14);
    em.movsd_store(Mem::new(Gpr::R15, 16), Xmm::Xmm4);
    em.inc_reg(Gpr::Rcx);
    let back = em.jmp_rel32();
    em.patch_rel32(back, top);
    let done_target = em.pos();
    em.patch_rel32(done, done_target);
    em.movq_xmm_gpr(Xmm::Xmm0, Gpr::R14);
    Ok(())
}

fn compile_in_binary(c: &mut FlapCompiler) -> FlapResult<()> {
    // already have collection in xmm1, value in xmm0 by the generic
    // binary path's calling convention; `in` is member-test over a list.
    membership_test(c)
}

fn compile_in(c: &mut FlapCompiler, value: &Expr, container: &Expr) -> FlapResult<()> {
    compile(c, value, &TailPosition::No)?;
    push_xmm0(c);
    compile(c, container, &TailPosition::No)?;
    let mut em = Emitter::new(&mut c.text);
    em.movsd_reg_reg(Xmm::Xmm1, Xmm::Xmm0);
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rsp, 0));
    em.add_reg_imm32(Gpr::Rsp, 16);
    drop(em);
    membership_test(c)
}

fn membership_test(c: &mut FlapCompiler) -> FlapResult<()> {
    let mut em = Emitter::new(&mut c.text);
    em.movq_gpr_xmm(Gpr::R12, Xmm::Xmm1); // list ptr
    em.movsd_load(Xmm::Xmm2, Mem::new(Gpr::R12, 0));
    em.cvttsd2si(Gpr::Rcx, Xmm::Xmm2);
    em.mov_reg_imm32(Gpr::Rax, 0); // i
    let top = em.pos();
    em.cmp_reg_reg(Gpr::Rax, Gpr::Rcx);
    let not_found = em.jcc_rel32(Cond::Ge);
    em.mov_reg_reg(Gpr::Rdx, Gpr::Rax);
    em.shl_reg_imm8(Gpr::Rdx, 3);
    em.add_reg_reg(Gpr::Rdx, Gpr::R12);
    em.movsd_load(Xmm::Xmm3, Mem::new(Gpr::Rdx, 8));
    em.ucomisd(Xmm::Xmm0, Xmm::Xmm3);
    let found = em.jcc_rel32(Cond::E);
    em.inc_reg(Gpr::Rax);
    let back = em.jmp_rel32();
    em.patch_rel32(back, top);
    let not_found_target = em.pos();
    em.patch_rel32(not_found, not_found_target);
    em.mov_reg_imm32(Gpr::Rax, 0);
    let skip = em.jmp_rel32();
    let found_target = em.pos();
    em.patch_rel32(found, found_target);
    em.mov_reg_imm32(Gpr::Rax, 1);
    let skip_target = em.pos();
    em.patch_rel32(skip, skip_target);
    em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
    Ok(())
}

fn compile_unary(c: &mut FlapCompiler, op: UnOp, operand: &Expr) -> FlapResult<()> {
    compile(c, operand, &TailPosition::No)?;
    match op {
        UnOp::Neg => {
            let neg_one = c.rodata.intern_f64(-1.0);
            let mut em = Emitter::new(&mut c.text);
            let site = em.lea_rip(Gpr::Rax);
            em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::Rax, 0));
            c.pending_rodata_refs.push(PendingRodataRef { site, target: neg_one });
            let mut em = Emitter::new(&mut c.text);
            em.mulsd(Xmm::Xmm0, Xmm::Xmm1);
            Ok(())
        }
        UnOp::Not => {
            let mut em = Emitter::new(&mut c.text);
            em.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
            em.test_reg_reg(Gpr::Rax, Gpr::Rax);
            em.mov_reg_imm32(Gpr::Rax, 0);
            em.mov_reg_imm32(Gpr::Rcx, 1);
            em.cmov_reg_reg(Cond::E, Gpr::Rax, Gpr::Rcx);
            em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
            Ok(())
        }
        UnOp::BitNot => {
            let mut em = Emitter::new(&mut c.text);
            em.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
            em.not_reg(Gpr::Rax);
            em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
            Ok(())
        }
        UnOp::PreIncr | UnOp::PreDecr => {
            let mut em = Emitter::new(&mut c.text);
            em.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
            if op == UnOp::PreIncr {
                em.inc_reg(Gpr::Rax);
            } else {
                em.add_reg_imm32(Gpr::Rax, -1);
            }
            em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
            store_back_if_ident(c, operand)
        }
        UnOp::Head => {
            let mut em = Emitter::new(&mut c.text);
            em.movq_gpr_xmm(Gpr::Rax, Xmm::Xmm0);
            em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rax, 8));
            Ok(())
        }
        UnOp::Tail => {
            // new list pointer sharing storage: [count-1] header written at
            // base+8, element pointer shifted by one slot. Allocates a
            // fresh header-adjacent view rather than mutating the source.
            let mut em = Emitter::new(&mut c.text);
            em.movq_gpr_xmm(Gpr::R12, Xmm::Xmm0);
            em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::R12, 0));
            em.cvttsd2si(Gpr::Rax, Xmm::Xmm1);
            em.add_reg_imm32(Gpr::Rax, -1);
            em.lea(Gpr::Rsi, Mem::new(Gpr::R12, 8));
            em.cvtsi2sd(Xmm::Xmm2, Gpr::Rax);
            em.movsd_store(Mem::new(Gpr::Rsi, 0), Xmm::Xmm2);
            em.movq_xmm_gpr(Xmm::Xmm0, Gpr::Rsi);
            Ok(())
        }
    }
}

fn store_back_if_ident(c: &mut FlapCompiler, operand: &Expr) -> FlapResult<()> {
    if let Expr::Ident(name) = operand {
        if let Some(&(offset, _)) = c.symbols.offsets.get(name) {
            let mut em = Emitter::new(&mut c.text);
            em.movsd_store(Mem::new(Gpr::Rbp, offset), Xmm::Xmm0);
        }
    }
    Ok(())
}

fn compile_postfix(c: &mut FlapCompiler, op: crate::ast::PostOp, operand: &Expr) -> FlapResult<()> {
    compile(c, operand, &TailPosition::No)?;
    let mut em = Emitter::new(&mut c.text);
    em.movsd_reg_reg(Xmm::Xmm5, Xmm::Xmm0); // stash the pre-increment value to return
    em.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
    if op == crate::ast::PostOp::Incr {
        em.inc_reg(Gpr::Rax);
    } else {
        em.add_reg_imm32(Gpr::Rax, -1);
    }
    em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
    drop(em);
    store_back_if_ident(c, operand)?;
    let mut em = Emitter::new(&mut c.text);
    em.movsd_reg_reg(Xmm::Xmm0, Xmm::Xmm5);
    Ok(())
}

fn compile_cast(c: &mut FlapCompiler, inner: &Expr, ty: &str) -> FlapResult<()> {
    compile(c, inner, &TailPosition::No)?;
    match ty {
        "f64" | "ptr" => Ok(()),
        "cstr" => crate::builtins::flap_string_to_cstr(c),
        "string" => Err(CompileError::NotYetImplemented { feature: "`as string` (C to Flap reverse conversion)".into() }.into()),
        _ => {
            let mut em = Emitter::new(&mut c.text);
            em.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
            em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
            Ok(())
        }
    }
}

/// A bare `Range` expression only ever appears where both endpoints are
/// literal numbers (`spec.md §4.5`: runtime ranges are handled inside
/// loop compilation, never here) — expand it to an equivalent `List`.
fn compile_literal_range(c: &mut FlapCompiler, start: &Expr, end: &Expr) -> FlapResult<()> {
    let (Expr::Number(a), Expr::Number(b)) = (start, end) else {
        return Err(CompileError::TypeShape {
            message: "range expression used outside a loop must have literal numeric bounds".into(),
            line: c.current_line,
        }
        .into());
    };
    let elements: Vec<f64> = if *a <= *b { (*a as i64..*b as i64).map(|v| v as f64).collect() } else { Vec::new() };
    let r = c.rodata.intern_list(&elements);
    let mut em = Emitter::new(&mut c.text);
    let site = em.lea_rip(Gpr::Rax);
    em.movq_xmm_gpr(Xmm::Xmm0, Gpr::Rax);
    c.pending_rodata_refs.push(PendingRodataRef { site, target: r });
    Ok(())
}

fn compile_list_literal(c: &mut FlapCompiler, items: &[Expr]) -> FlapResult<()> {
    let mut elements = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Expr::Number(n) => elements.push(*n),
            _ => {
                return Err(CompileError::TypeShape {
                    message: "list literal elements must be compile-time numbers".into(),
                    line: c.current_line,
                }
                .into())
            }
        }
    }
    let r = c.rodata.intern_list(&elements);
    let mut em = Emitter::new(&mut c.text);
    let site = em.lea_rip(Gpr::Rax);
    em.movq_xmm_gpr(Xmm::Xmm0, Gpr::Rax);
    c.pending_rodata_refs.push(PendingRodataRef { site, target: r });
    Ok(())
}

/// FNV-1a over UTF-8 bytes, folded to 30 bits with bit 30 set, so an
/// identifier key's hash never collides with a natural small-integer
/// index (`spec.md §4.5`'s map literal contract).
fn hash_key(s: &str) -> f64 {
    let mut h: u32 = 0x811c9dc5;
    for b in s.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    ((h & 0x3FFF_FFFF) | (1 << 30)) as f64
}

fn compile_map_literal(c: &mut FlapCompiler, keys: &[Expr], values: &[Expr]) -> FlapResult<()> {
    let mut pairs = Vec::with_capacity(keys.len());
    for (k, v) in keys.iter().zip(values.iter()) {
        let key_value = match k {
            Expr::Number(n) => *n,
            Expr::String(s) | Expr::Ident(s) => hash_key(s),
            _ => {
                return Err(CompileError::TypeShape {
                    message: "map literal keys must be compile-time numbers, strings, or identifiers".into(),
                    line: c.current_line,
                }
                .into())
            }
        };
        let value = match v {
            Expr::Number(n) => *n,
            _ => {
                return Err(CompileError::TypeShape {
                    message: "map literal values must be compile-time numbers".into(),
                    line: c.current_line,
                }
                .into())
            }
        };
        pairs.push((key_value, value));
    }
    let r = c.rodata.intern_map(&pairs);
    let mut em = Emitter::new(&mut c.text);
    let site = em.lea_rip(Gpr::Rax);
    em.movq_xmm_gpr(Xmm::Xmm0, Gpr::Rax);
    c.pending_rodata_refs.push(PendingRodataRef { site, target: r });
    Ok(())
}

fn compile_index(c: &mut FlapCompiler, coll: &Expr, idx: &Expr) -> FlapResult<()> {
    // Numeric-literal identifier keys on a bare Ident receiver are almost
    // always a list index; string/ident keys mean a map/string lookup.
    let is_map_like = matches!(idx, Expr::String(_));
    compile(c, coll, &TailPosition::No)?;
    push_xmm0(c);
    compile(c, idx, &TailPosition::No)?;
    if let Expr::String(s) = idx {
        let key = hash_key(s);
        load_rodata_f64(c, key);
    }
    let mut em = Emitter::new(&mut c.text);
    em.movsd_reg_reg(Xmm::Xmm1, Xmm::Xmm0);
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rsp, 0));
    em.add_reg_imm32(Gpr::Rsp, 16);
    drop(em);
    if is_map_like {
        return compile_map_index(c);
    }
    let mut em = Emitter::new(&mut c.text);
    em.movq_gpr_xmm(Gpr::R12, Xmm::Xmm0); // collection ptr
    em.cvttsd2si(Gpr::Rax, Xmm::Xmm1); // index
    em.shl_reg_imm8(Gpr::Rax, 3);
    em.add_reg_reg(Gpr::Rax, Gpr::R12);
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rax, 8));
    Ok(())
}

fn compile_map_index(c: &mut FlapCompiler) -> FlapResult<()> {
    let cpuid_flag = *c.cpuid_flag.get_or_insert_with(|| c.rodata.reserve_cpuid_flag());
    let mut em = Emitter::new(&mut c.text);
    em.movq_gpr_xmm(Gpr::Rdi, Xmm::Xmm0); // map ptr
    let site = em.lea_rip(Gpr::Rsi);
    c.pending_rodata_refs.push(PendingRodataRef { site, target: cpuid_flag });
    let mut em = Emitter::new(&mut c.text);
    em.movsd_reg_reg(Xmm::Xmm0, Xmm::Xmm1); // key
    let call_site = em.call_rel32();
    drop(em);
    emit_helper_once(c, HelperKind::MapSearch, flap_runtime_gen::map_search::emit_search);
    c.pending_calls.push(PendingCall { call_site, target_name: helper_label(HelperKind::MapSearch) });
    Ok(())
}

fn compile_slice(
    c: &mut FlapCompiler,
    collection: &Expr,
    start: &Option<Box<Expr>>,
    end: &Option<Box<Expr>>,
    step: &Option<Box<Expr>>,
) -> FlapResult<()> {
    compile(c, collection, &TailPosition::No)?;
    push_xmm0(c);
    let mut em = Emitter::new(&mut c.text);
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rsp, 0));
    em.movq_gpr_xmm(Gpr::R12, Xmm::Xmm0);
    em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::R12, 0));
    em.cvttsd2si(Gpr::R13, Xmm::Xmm1); // length, used for None defaults

    let step_val = match step {
        Some(s) => {
            drop(em);
            compile(c, s, &TailPosition::No)?;
            let mut em2 = Emitter::new(&mut c.text);
            em2.cvttsd2si(Gpr::Rcx, Xmm::Xmm0);
            em2
        }
        None => {
            em.mov_reg_imm32(Gpr::Rcx, 1);
            em
        }
    };
    let mut em = step_val;

    match start {
        Some(s) => {
            drop(em);
            compile(c, s, &TailPosition::No)?;
            let mut em2 = Emitter::new(&mut c.text);
            em2.cvttsd2si(Gpr::Rsi, Xmm::Xmm0);
            em = em2;
        }
        None => em.mov_reg_imm32(Gpr::Rsi, 0),
    }

    match end {
        Some(e) => {
            drop(em);
            compile(c, e, &TailPosition::No)?;
            let mut em2 = Emitter::new(&mut c.text);
            em2.cvttsd2si(Gpr::Rdx, Xmm::Xmm0);
            em = em2;
        }
        None => {
            // Default end depends on step direction: forward step defaults
            // to the length, backward step defaults to -1 (one past the
            // start of the reversed walk), per `spec.md §8`'s edge cases.
            em.cmp_reg_imm32(Gpr::Rcx, 0);
            let backward = em.jcc_rel32(Cond::L);
            em.mov_reg_reg(Gpr::Rdx, Gpr::R13);
            let done = em.jmp_rel32();
            let backward_target = em.pos();
            em.patch_rel32(backward, backward_target);
            em.mov_reg_imm32(Gpr::Rdx, -1);
            let done_target = em.pos();
            em.patch_rel32(done, done_target);
        }
    }

    em.mov_reg_reg(Gpr::Rdi, Gpr::R12);
    let call_site = em.call_rel32();
    drop(em);
    emit_helper_once(c, HelperKind::Slice, flap_runtime_gen::slice::emit);
    c.pending_calls.push(PendingCall { call_site, target_name: helper_label(HelperKind::Slice) });
    let mut em = Emitter::new(&mut c.text);
    em.cvtsi2sd(Xmm::Xmm1, Gpr::Rax);
    em.movq_xmm_gpr(Xmm::Xmm0, Gpr::Rax);
    em.add_reg_imm32(Gpr::Rsp, 16);
    Ok(())
}

fn compile_length(c: &mut FlapCompiler, inner: &Expr) -> FlapResult<()> {
    compile(c, inner, &TailPosition::No)?;
    let mut em = Emitter::new(&mut c.text);
    em.movq_gpr_xmm(Gpr::Rax, Xmm::Xmm0);
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rax, 0));
    Ok(())
}

/// A lambda value is materialized as a closure object. Non-capturing
/// lambdas get a static rodata object patched with the function pointer
/// once emitted; capturing lambdas malloc `16 + 8*n` bytes at runtime
/// and copy each captured variable's current value in (`spec.md §4.5`).
fn compile_lambda_value(c: &mut FlapCompiler, lambda: &Lambda) -> FlapResult<()> {
    let name = lambda.name.clone().unwrap_or_else(|| format!("lambda_{}", c.pending_lambdas.len()));
    c.pending_lambdas.push(PendingLambda {
        name: name.clone(),
        entry_offset: None,
        hot_table_ref: None,
        memo_slot_ref: None,
        body: PendingLambdaBody::Lambda(lambda.clone()),
    });

    if lambda.captured_vars.is_empty() {
        let r = c.rodata.reserve_static_closure(&name);
        let mut em = Emitter::new(&mut c.text);
        let site = em.lea_rip(Gpr::Rax);
        em.movq_xmm_gpr(Xmm::Xmm0, Gpr::Rax);
        c.pending_rodata_refs.push(PendingRodataRef { site, target: r });
        c.pending_closure_fixups.push(PendingClosureFixup { slot: r, lambda_name: name });
        return Ok(());
    }

    let count = lambda.captured_vars.len() as i32;
    let mut em = Emitter::new(&mut c.text);
    em.mov_reg_imm32(Gpr::Rdi, 16 + count * 8);
    let call_site = em.call_rel32();
    drop(em);
    c.record_external_symbol("malloc");
    c.pending_calls.push(PendingCall { call_site, target_name: "@plt:malloc".into() });
    let mut em = Emitter::new(&mut c.text);
    em.mov_reg_reg(Gpr::R12, Gpr::Rax);
    let fn_ptr_site = em.lea_rip(Gpr::Rcx);
    em.mov_mem_reg(Mem::new(Gpr::R12, 0), Gpr::Rcx, Width::Qword);
    c.pending_calls.push(PendingCall { call_site: fn_ptr_site, target_name: format!("@lambda-addr:{name}") });
    let mut em = Emitter::new(&mut c.text);
    em.lea(Gpr::Rdx, Mem::new(Gpr::R12, 16));
    em.mov_mem_reg(Mem::new(Gpr::R12, 8), Gpr::Rdx, Width::Qword);
    for (i, captured) in lambda.captured_vars.iter().enumerate() {
        let Some(&(offset, _)) = c.symbols.offsets.get(captured) else {
            return Err(CompileError::UndefinedVariable { name: captured.clone(), line: c.current_line }.into());
        };
        let mut em = Emitter::new(&mut c.text);
        em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::Rbp, offset));
        em.movsd_store(Mem::new(Gpr::R12, 16 + (i as i32) * 8), Xmm::Xmm1);
    }
    let mut em = Emitter::new(&mut c.text);
    em.movq_xmm_gpr(Xmm::Xmm0, Gpr::R12);
    Ok(())
}

/// A pattern-dispatched definition (`name = (0) => 1, (n) => n * name(n - 1)`)
/// is queued as one synthetic function whose prologue marshals the
/// caller's positional arguments into `__pat_argN` slots and then runs
/// the driver-emitted clause dispatch (`spec.md §4.5`'s pattern-match
/// call-dispatch form). Closures over enclosing variables aren't
/// supported here — only named, non-capturing definitions are, which
/// covers the recursive-function idiom this syntax exists for.
pub(crate) fn compile_pattern_lambda_value(
    c: &mut FlapCompiler,
    clauses: &[PatternClause],
    name_hint: Option<&str>,
) -> FlapResult<()> {
    let name = name_hint
        .map(str::to_string)
        .unwrap_or_else(|| format!("pattern_lambda_{}", c.pending_lambdas.len()));
    let arity = clauses.first().map(|cl| cl.patterns.len()).unwrap_or(0);
    let arg_slots: Vec<String> = (0..arity).map(pattern_positional_name).collect();
    c.pending_lambdas.push(PendingLambda {
        name: name.clone(),
        entry_offset: None,
        hot_table_ref: None,
        memo_slot_ref: None,
        body: PendingLambdaBody::PatternClauses { clauses: clauses.to_vec(), arg_slots },
    });

    let r = c.rodata.reserve_static_closure(&name);
    let mut em = Emitter::new(&mut c.text);
    let site = em.lea_rip(Gpr::Rax);
    em.movq_xmm_gpr(Xmm::Xmm0, Gpr::Rax);
    c.pending_rodata_refs.push(PendingRodataRef { site, target: r });
    c.pending_closure_fixups.push(PendingClosureFixup { slot: r, lambda_name: name });
    Ok(())
}

/// An arity-dispatched definition (`name = (a) => .., (a, b) => ..`) is
/// queued as one synthetic function per arity, mangled `"{name}#{argc}"`
/// so `compile_named_call` can pick the right variant at each call site
/// from its static argument count. Referencing the name as a bare value
/// (rather than calling it directly) isn't supported, since there is no
/// single closure object that means "the right arity" — direct calls are
/// the form this syntax exists for.
pub(crate) fn compile_multi_lambda_value(
    c: &mut FlapCompiler,
    lambdas: &[Lambda],
    name_hint: Option<&str>,
) -> FlapResult<()> {
    let Some(name) = name_hint else {
        return Err(CompileError::NotYetImplemented {
            feature: "multi-arity lambda referenced as a bare value (only direct calls are supported)".into(),
        }
        .into());
    };
    c.multi_arity_names.insert(name.to_string());
    for lambda in lambdas {
        let mangled = format!("{name}#{}", lambda.params.len());
        let mut variant = lambda.clone();
        variant.name = Some(mangled.clone());
        c.pending_lambdas.push(PendingLambda {
            name: mangled,
            entry_offset: None,
            hot_table_ref: None,
            memo_slot_ref: None,
            body: PendingLambdaBody::Lambda(variant),
        });
    }
    let mut em = Emitter::new(&mut c.text);
    em.mov_reg_imm32(Gpr::Rax, 0);
    em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
    Ok(())
}

fn compile_direct_call(c: &mut FlapCompiler, callee: &Expr, args: &[Expr]) -> FlapResult<()> {
    // Call through a closure object value: load fn ptr (offset 0) and
    // env ptr (offset 8) into r15, call indirectly (`spec.md §4.5`,
    // call-dispatch case 4).
    compile(c, callee, &TailPosition::No)?;
    push_xmm0(c);
    marshal_flap_args(c, args)?;
    let mut em = Emitter::new(&mut c.text);
    em.movsd_load(Xmm::Xmm5, Mem::new(Gpr::Rsp, 0));
    em.add_reg_imm32(Gpr::Rsp, 16);
    em.movq_gpr_xmm(Gpr::R12, Xmm::Xmm5);
    em.mov_reg_mem(Gpr::R15, Mem::new(Gpr::R12, 8), Width::Qword, false);
    em.mov_reg_mem(Gpr::Rax, Mem::new(Gpr::R12, 0), Width::Qword, false);
    em.call_reg(Gpr::Rax);
    Ok(())
}

/// Marshal up to 6 Flap-convention arguments (each an `f64`) into xmm0..
/// the fixed positional scratch registers the lambda calling convention
/// reads parameters back out of on entry (mirrors `SYSV_XMM_ARGS` for
/// simplicity, since every Flap value already lives in an XMM register).
fn marshal_flap_args(c: &mut FlapCompiler, args: &[Expr]) -> FlapResult<()> {
    let mut staged = Vec::with_capacity(args.len());
    for arg in args {
        compile(c, arg, &TailPosition::No)?;
        push_xmm0(c);
        staged.push(());
    }
    let _ = staged;
    for (i, _) in args.iter().enumerate().rev() {
        let dest = SYSV_XMM_ARGS[i];
        let mut em = Emitter::new(&mut c.text);
        em.movsd_load(dest, Mem::new(Gpr::Rsp, 0));
        em.add_reg_imm32(Gpr::Rsp, 16);
    }
    Ok(())
}

fn compile_named_call(c: &mut FlapCompiler, name: &str, args: &[Expr], line: usize, tail: &TailPosition) -> FlapResult<()> {
    c.current_line = line;

    if let TailPosition::SelfRecursive { function_name, param_slots, body_start } = tail {
        if function_name == name && args.len() == param_slots.len() {
            return compile_tail_self_call(c, args, param_slots, *body_start);
        }
    }

    if let Some(namespace_dot) = name.find('.') {
        let (ns, fn_name) = name.split_at(namespace_dot);
        return compile_c_namespace_call(c, ns, &fn_name[1..], args);
    }

    if let Some(result) = crate::builtins::dispatch(c, name, args, line) {
        return result;
    }

    let target_name =
        if c.multi_arity_names.contains(name) { format!("{name}#{}", args.len()) } else { name.to_string() };

    marshal_flap_args(c, args)?;
    let mut em = Emitter::new(&mut c.text);
    let call_site = em.call_rel32();
    drop(em);
    c.pending_calls.push(PendingCall { call_site, target_name });
    Ok(())
}

/// Self-recursive tail call: rewrite each parameter slot in place, then
/// jump back to the function's first instruction instead of emitting a
/// `call` (`spec.md §4.5`, call-dispatch case 1).
///
/// New values are staged through `xmm8..` before any slot is
/// overwritten, since a later argument expression may read an earlier
/// parameter's current value.
fn compile_tail_self_call(c: &mut FlapCompiler, args: &[Expr], param_slots: &[i32], body_start: usize) -> FlapResult<()> {
    let scratch = [Xmm::Xmm8, Xmm::Xmm9, Xmm::Xmm10, Xmm::Xmm11, Xmm::Xmm12, Xmm::Xmm13];
    if args.len() > scratch.len() {
        return Err(CompileError::NotYetImplemented { feature: "tail-recursive functions with more than 6 parameters".into() }.into());
    }
    for (i, arg) in args.iter().enumerate() {
        compile(c, arg, &TailPosition::No)?;
        let mut em = Emitter::new(&mut c.text);
        em.movsd_reg_reg(scratch[i], Xmm::Xmm0);
    }
    for (i, &offset) in param_slots.iter().enumerate() {
        let mut em = Emitter::new(&mut c.text);
        em.movsd_store(Mem::new(Gpr::Rbp, offset), scratch[i]);
    }
    let mut em = Emitter::new(&mut c.text);
    let back = em.jmp_rel32();
    em.patch_rel32(back, body_start);
    Ok(())
}

/// C-namespace call (`ns.fn(...)`): marshal per System V AMD64 into
/// integer/XMM argument registers. Without a real signature oracle
/// (`ExternalImportProvider` is the opaque boundary, `spec.md §1`), every
/// argument is passed as whichever register family its static AST shape
/// implies: string/cstr-cast arguments go through the integer registers
/// as pointers, everything else goes through the XMM registers as `f64`.
fn compile_c_namespace_call(c: &mut FlapCompiler, ns: &str, fn_name: &str, args: &[Expr]) -> FlapResult<()> {
    let mut int_idx = 0usize;
    let mut xmm_idx = 0usize;
    for arg in args {
        let is_pointer_like = matches!(arg, Expr::String(_) | Expr::Cast(_, _));
        compile(c, arg, &TailPosition::No)?;
        if is_pointer_like {
            if int_idx >= SYSV_INT_ARGS.len() {
                return Err(CompileError::ArityMismatch { what: format!("{ns}.{fn_name}"), expected: SYSV_INT_ARGS.len(), found: args.len(), line: c.current_line }.into());
            }
            let mut em = Emitter::new(&mut c.text);
            em.movq_gpr_xmm(SYSV_INT_ARGS[int_idx], Xmm::Xmm0);
            int_idx += 1;
        } else {
            if xmm_idx >= SYSV_XMM_ARGS.len() {
                return Err(CompileError::ArityMismatch { what: format!("{ns}.{fn_name}"), expected: SYSV_XMM_ARGS.len(), found: args.len(), line: c.current_line }.into());
            }
            if xmm_idx != 0 {
                let mut em = Emitter::new(&mut c.text);
                em.movsd_reg_reg(SYSV_XMM_ARGS[xmm_idx], Xmm::Xmm0);
            }
            xmm_idx += 1;
        }
    }
    let mut em = Emitter::new(&mut c.text);
    em.mov_reg_imm32(Gpr::Rax, xmm_idx as i32); // va_args convention: # of vector regs used
    let call_site = em.call_rel32();
    drop(em);
    c.record_external_symbol(fn_name);
    c.pending_calls.push(PendingCall { call_site, target_name: format!("@plt:{fn_name}") });
    let _ = ns;
    Ok(())
}

fn compile_match(
    c: &mut FlapCompiler,
    condition: &Expr,
    clauses: &[MatchClause],
    default_expr: &Expr,
    tail: &TailPosition,
) -> FlapResult<()> {
    compile(c, condition, &TailPosition::No)?;
    push_xmm0(c);

    let mut end_jumps = Vec::new();
    for clause in clauses {
        let skip = if let Some(guard) = &clause.guard {
            // `literal -> result`: compare the match condition (spilled
            // on the stack, since compiling the guard may itself call
            // functions and clobber xmm0) against this clause's guard
            // value for equality, rather than testing the guard alone.
            compile(c, guard, &TailPosition::No)?;
            let mut em = Emitter::new(&mut c.text);
            em.movsd_reg_reg(Xmm::Xmm1, Xmm::Xmm0);
            em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rsp, 0));
            em.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
            Some(em.jcc_rel32(Cond::Ne))
        } else {
            // `condition { result ~> default }` sugar: a bare clause with
            // no guard tests the condition itself for truthiness.
            let mut em = Emitter::new(&mut c.text);
            em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rsp, 0));
            em.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
            em.test_reg_reg(Gpr::Rax, Gpr::Rax);
            Some(em.jcc_rel32(Cond::E))
        };

        let mut em = Emitter::new(&mut c.text);
        em.add_reg_imm32(Gpr::Rsp, 16);
        drop(em);
        compile(c, &clause.result, tail)?;
        let mut em = Emitter::new(&mut c.text);
        end_jumps.push(em.jmp_rel32());

        if let Some(skip_ref) = skip {
            let mut em2 = Emitter::new(&mut c.text);
            let target = em2.pos();
            em2.patch_rel32(skip_ref, target);
        }
    }

    let mut em = Emitter::new(&mut c.text);
    em.add_reg_imm32(Gpr::Rsp, 16);
    drop(em);
    compile(c, default_expr, tail)?;

    let mut em = Emitter::new(&mut c.text);
    let end = em.pos();
    for j in end_jumps {
        em.patch_rel32(j, end);
    }
    Ok(())
}

fn compile_loop_state(c: &mut FlapCompiler, kind: crate::ast::LoopStateKind, level: u32) -> FlapResult<()> {
    use crate::ast::LoopStateKind::*;
    let loop_idx = c.active_loops.len().checked_sub(1 + level as usize).ok_or_else(|| {
        CompileError::Other(format!("@{:?} references a loop nesting level ({level}) deeper than the current nest", kind))
    })?;
    let base = c.active_loops[loop_idx].base_stack_offset;
    let mut em = Emitter::new(&mut c.text);
    match kind {
        I | Counter => {
            em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rbp, base - 8));
        }
        First => {
            em.mov_reg_mem(Gpr::Rax, Mem::new(Gpr::Rbp, base - 16), Width::Byte, false);
            em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
        }
        Last => {
            em.mov_reg_mem(Gpr::Rax, Mem::new(Gpr::Rbp, base - 17), Width::Byte, false);
            em.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
        }
    }
    Ok(())
}

fn compile_struct_literal(c: &mut FlapCompiler, name: &str, fields: &[(String, Expr)]) -> FlapResult<()> {
    let Some((size, layout)) = c.symbols.cstruct_layout.get(name).cloned() else {
        return Err(CompileError::Other(format!("unknown cstruct '{name}'")).into());
    };
    let mut em = Emitter::new(&mut c.text);
    em.mov_reg_imm32(Gpr::Rdi, size as i32);
    let call_site = em.call_rel32();
    drop(em);
    c.record_external_symbol("malloc");
    c.pending_calls.push(PendingCall { call_site, target_name: "@plt:malloc".into() });
    let mut em = Emitter::new(&mut c.text);
    em.mov_reg_reg(Gpr::R12, Gpr::Rax);
    drop(em);
    for (field_name, value) in fields {
        let Some(&field_offset) = layout.get(field_name) else {
            return Err(CompileError::Other(format!("cstruct '{name}' has no field '{field_name}'")).into());
        };
        push_xmm0(c); // keep r12 safe across nested compiles via stack, not register
        let mut em = Emitter::new(&mut c.text);
        em.mov_mem_reg(Mem::new(Gpr::Rsp, 8), Gpr::R12, Width::Qword);
        drop(em);
        compile(c, value, &TailPosition::No)?;
        let mut em = Emitter::new(&mut c.text);
        em.mov_reg_mem(Gpr::R12, Mem::new(Gpr::Rsp, 8), Width::Qword, false);
        em.add_reg_imm32(Gpr::Rsp, 16);
        em.movsd_store(Mem::new(Gpr::R12, field_offset as i32), Xmm::Xmm0);
    }
    let mut em = Emitter::new(&mut c.text);
    em.movq_xmm_gpr(Xmm::Xmm0, Gpr::R12);
    Ok(())
}

/// `left | right` — if `left` evaluates to a list pointer statically
/// known from its AST shape, this is sugar for `Parallel(left, right)`;
/// otherwise it's plain function application of `right` to `left`'s
/// value (`spec.md §4.5`).
fn compile_pipe(c: &mut FlapCompiler, left: &Expr, right: &Expr) -> FlapResult<()> {
    if matches!(left, Expr::List(_) | Expr::Range(_, _, _)) {
        return compile_parallel_map(c, left, right);
    }
    compile(c, left, &TailPosition::No)?;
    push_xmm0(c);
    compile(c, right, &TailPosition::No)?;
    let mut em = Emitter::new(&mut c.text);
    em.movq_gpr_xmm(Gpr::R12, Xmm::Xmm0); // closure
    em.mov_reg_mem(Gpr::R15, Mem::new(Gpr::R12, 8), Width::Qword, false);
    em.mov_reg_mem(Gpr::Rax, Mem::new(Gpr::R12, 0), Width::Qword, false);
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rsp, 0));
    em.add_reg_imm32(Gpr::Rsp, 16);
    em.call_reg(Gpr::Rax);
    Ok(())
}

/// `list || lambda` — sequential emulation of the parallel-map primitive
/// (`spec.md §4.5`): loop over each input element in this same thread,
/// applying the closure and writing results into a freshly allocated
/// result buffer. The *true* `clone`/futex-barrier thread pool described
/// in `spec.md §4.6` backs the statement-level `@@`/`N @` loop form; this
/// expression form is specified only as producing the mapped collection,
/// so a single-threaded walk satisfies its observable contract.
fn compile_parallel_map(c: &mut FlapCompiler, list: &Expr, lambda: &Expr) -> FlapResult<()> {
    compile(c, list, &TailPosition::No)?;
    push_xmm0(c);
    compile(c, lambda, &TailPosition::No)?;
    let mut em = Emitter::new(&mut c.text);
    em.movq_gpr_xmm(Gpr::R13, Xmm::Xmm0); // closure
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rsp, 0));
    em.add_reg_imm32(Gpr::Rsp, 16);
    em.movq_gpr_xmm(Gpr::R12, Xmm::Xmm0); // source list
    em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::R12, 0));
    em.cvttsd2si(Gpr::R14, Xmm::Xmm1); // count

    em.mov_reg_reg(Gpr::Rdi, Gpr::R14);
    em.shl_reg_imm8(Gpr::Rdi, 3);
    em.add_reg_imm32(Gpr::Rdi, 8);
    let call_site = em.call_rel32();
    drop(em);
    c.record_external_symbol("malloc");
    c.pending_calls.push(PendingCall { call_site, target_name: "@plt:malloc".into() });

    let mut em = Emitter::new(&mut c.text);
    em.mov_reg_reg(Gpr::Rbx, Gpr::Rax); // dest
    em.cvtsi2sd(Xmm::Xmm2, Gpr::R14);
    em.movsd_store(Mem::new(Gpr::Rbx, 0), Xmm::Xmm2);
    em.mov_reg_imm32(Gpr::Rcx, 0);

    let top = em.pos();
    em.cmp_reg_reg(Gpr::Rcx, Gpr::R14);
    let done = em.jcc_rel32(Cond::Ge);
    em.mov_reg_reg(Gpr::Rax, Gpr::Rcx);
    em.shl_reg_imm8(Gpr::Rax, 3);
    em.add_reg_reg(Gpr::Rax, Gpr::R12);
    em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rax, 8));
    em.mov_reg_mem(Gpr::R15, Mem::new(Gpr::R13, 8), Width::Qword, false);
    em.mov_reg_mem(Gpr::Rax, Mem::new(Gpr::R13, 0), Width::Qword, false);
    em.call_reg(Gpr::Rax);
    em.mov_reg_reg(Gpr::Rax, Gpr::Rcx);
    em.shl_reg_imm8(Gpr::Rax, 3);
    em.add_reg_reg(Gpr::Rax, Gpr::Rbx);
    em.movsd_store(Mem::new(Gpr::Rax, 8), Xmm::Xmm0);
    em.inc_reg(Gpr::Rcx);
    let back = em.jmp_rel32();
    em.patch_rel32(back, top);
    let done_target = em.pos();
    em.patch_rel32(done, done_target);
    em.movq_xmm_gpr(Xmm::Xmm0, Gpr::Rbx);
    Ok(())
}

/// `target <== message` — a UDP datagram send. `target` must be a
/// literal port or port-range string (`spec.md §4.5`); a range picks the
/// first port deterministically (the lowest) since a send (unlike a
/// receive loop's bind-scan) has no fallback semantics to justify trying
/// more than one.
fn compile_send(c: &mut FlapCompiler, target: &Expr, message: &Expr) -> FlapResult<()> {
    let Expr::String(addr) = target else {
        return Err(CompileError::TypeShape { message: "send target must be a literal \":port\" address".into(), line: c.current_line }.into());
    };
    let port: u16 = addr.trim_start_matches(':').split('-').next().and_then(|p| p.parse().ok()).ok_or_else(|| {
        CompileError::TypeShape { message: format!("'{addr}' is not a valid port/port-range literal"), line: c.current_line }
    })?;
    compile(c, message, &TailPosition::No)?;
    crate::builtins::emit_udp_send(c, port)
}

fn compile_unsafe(c: &mut FlapCompiler, block: &crate::ast::UnsafeBlock) -> FlapResult<()> {
    let arch = match c.config.platform {
        crate::config::Platform::X86_64Linux => crate::ast::UnsafeArch::X86_64,
        crate::config::Platform::Arm64Darwin => crate::ast::UnsafeArch::Arm64,
        crate::config::Platform::RiscV64Linux => crate::ast::UnsafeArch::RiscV64,
    };
    let Some(stmts) = block.per_arch.get(&arch) else {
        return Err(CompileError::Other(format!("unsafe block has no {arch:?} arm for the current target")).into());
    };
    for stmt in stmts {
        crate::builtins::emit_unsafe_stmt(c, stmt)?;
    }
    if let Some(reg_name) = block.per_arch_return_register.get(&arch) {
        crate::builtins::load_unsafe_return(c, reg_name)?;
    }
    Ok(())
}

fn compile_vector(c: &mut FlapCompiler, items: &[Expr], size: u8) -> FlapResult<()> {
    if size != 2 && size != 4 {
        return Err(CompileError::TypeShape { message: "vectors support only 2 or 4 components".into(), line: c.current_line }.into());
    }
    let mut elements = Vec::with_capacity(items.len());
    for item in items {
        let Expr::Number(n) = item else {
            return Err(CompileError::TypeShape { message: "vector literal components must be compile-time numbers".into(), line: c.current_line }.into());
        };
        elements.push(*n);
    }
    let r = c.rodata.intern_list(&elements);
    let mut em = Emitter::new(&mut c.text);
    let site = em.lea_rip(Gpr::Rax);
    em.movq_xmm_gpr(Xmm::Xmm0, Gpr::Rax);
    c.pending_rodata_refs.push(PendingRodataRef { site, target: r });
    Ok(())
}
