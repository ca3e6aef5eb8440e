//! AST-level optimization passes, run before symbol collection.
//!
//! Order matters: constant folding runs first so purity analysis and
//! the inliner see simplified bodies, then closure-capture analysis
//! runs last so it observes post-inlining call sites. Dead-code
//! elimination is deliberately not implemented at this stage — sibling
//! imports are merged after this pass runs, and removing an apparently
//! unused top-level binding here could delete something only a
//! not-yet-merged import references.

use crate::ast::*;
use std::collections::HashMap;

pub fn optimize(mut program: Program) -> Program {
    fold_constants_program(&mut program);
    propagate_constants(&mut program);
    fold_constants_program(&mut program);
    let purity = analyze_purity(&program);
    let call_counts = count_call_sites(&program);
    inline_candidates(&mut program, &purity, &call_counts);
    fold_constants_program(&mut program);
    analyze_captures(&mut program);
    program
}

// ---- constant folding ----

fn fold_constants_program(program: &mut Program) {
    for stmt in &mut program.statements {
        fold_stmt(stmt);
    }
}

fn fold_stmt(stmt: &mut Stmt) {
    match stmt {
        Stmt::Assign { value, .. } => fold_expr(value),
        Stmt::ExpressionStmt(e) => fold_expr(e),
        Stmt::Loop { iterable, body, reducer, .. } => {
            fold_expr(iterable);
            body.iter_mut().for_each(fold_stmt);
            if let Some(r) = reducer {
                r.body.iter_mut().for_each(fold_stmt);
            }
        }
        Stmt::ReceiveLoop { address, body, .. } => {
            fold_expr(address);
            body.iter_mut().for_each(fold_stmt);
        }
        Stmt::Jump { value: Some(v), .. } => fold_expr(v),
        Stmt::Jump { value: None, .. } => {}
        Stmt::Arena { body, .. } => body.iter_mut().for_each(fold_stmt),
        Stmt::Defer { call, .. } => fold_expr(call),
        Stmt::Spawn { expr, pipe_block, .. } => {
            fold_expr(expr);
            if let Some(body) = pipe_block {
                body.iter_mut().for_each(fold_stmt);
            }
        }
        Stmt::Alias { .. } | Stmt::Import { .. } | Stmt::Use { .. } | Stmt::CStructDecl { .. } => {}
    }
}

fn fold_expr(expr: &mut Expr) {
    match expr {
        Expr::Binary(op, a, b) => {
            fold_expr(a);
            fold_expr(b);
            if let (Expr::Number(x), Expr::Number(y)) = (a.as_ref(), b.as_ref()) {
                if let Some(folded) = fold_numeric_binop(*op, *x, *y) {
                    *expr = Expr::Number(folded);
                }
            }
        }
        Expr::Unary(op, a) => {
            fold_expr(a);
            if let Expr::Number(x) = a.as_ref() {
                match op {
                    UnOp::Neg => *expr = Expr::Number(-x),
                    UnOp::Not => *expr = Expr::Number(if *x == 0.0 { 1.0 } else { 0.0 }),
                    UnOp::BitNot => *expr = Expr::Number(!(*x as i64) as f64),
                    _ => {}
                }
            }
        }
        Expr::Postfix(_, a) => fold_expr(a),
        Expr::Cast(a, _) => fold_expr(a),
        Expr::Range(a, b, _) => {
            fold_expr(a);
            fold_expr(b);
        }
        Expr::List(items) => items.iter_mut().for_each(fold_expr),
        Expr::Map(keys, values) => {
            keys.iter_mut().for_each(fold_expr);
            values.iter_mut().for_each(fold_expr);
        }
        Expr::Index(a, b) => {
            fold_expr(a);
            fold_expr(b);
        }
        Expr::Slice { collection, start, end, step } => {
            fold_expr(collection);
            [start, end, step].into_iter().flatten().for_each(|e| fold_expr(e));
        }
        Expr::Length(a) => fold_expr(a),
        Expr::Lambda(l) => fold_expr(&mut l.body),
        Expr::PatternLambda(clauses) => clauses.iter_mut().for_each(|c| fold_expr(&mut c.body)),
        Expr::MultiLambda(lambdas) => lambdas.iter_mut().for_each(|l| fold_expr(&mut l.body)),
        Expr::DirectCall { callee, args } => {
            fold_expr(callee);
            args.iter_mut().for_each(fold_expr);
        }
        Expr::Call { args, .. } => args.iter_mut().for_each(fold_expr),
        Expr::Match { condition, clauses, default_expr, .. } => {
            fold_expr(condition);
            for c in clauses {
                if let Some(g) = &mut c.guard {
                    fold_expr(g);
                }
                fold_expr(&mut c.result);
            }
            fold_expr(default_expr);
        }
        Expr::Block(stmts) => stmts.iter_mut().for_each(fold_stmt),
        Expr::Pipe(a, b)
        | Expr::Parallel(a, b)
        | Expr::ConcurrentGather(a, b)
        | Expr::Send(a, b)
        | Expr::In(a, b) => {
            fold_expr(a);
            fold_expr(b);
        }
        Expr::Vector(items, _) => items.iter_mut().for_each(fold_expr),
        Expr::JumpExpr { value: Some(v), .. } => fold_expr(v),
        Expr::StructLiteral { fields, .. } => fields.iter_mut().for_each(|(_, e)| fold_expr(e)),
        Expr::ArenaExpr(stmts) => stmts.iter_mut().for_each(fold_stmt),
        _ => {}
    }
}

fn fold_numeric_binop(op: BinOp, x: f64, y: f64) -> Option<f64> {
    Some(match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div if y != 0.0 => x / y,
        BinOp::Mod if y != 0.0 => x % y,
        BinOp::Pow => x.powf(y),
        BinOp::FusedMulAdd => x.mul_add(y, 0.0),
        BinOp::Lt => bool_f64(x < y),
        BinOp::Lte => bool_f64(x <= y),
        BinOp::Gt => bool_f64(x > y),
        BinOp::Gte => bool_f64(x >= y),
        BinOp::Eq => bool_f64(x == y),
        BinOp::NotEq => bool_f64(x != y),
        BinOp::And => bool_f64(x != 0.0 && y != 0.0),
        BinOp::Or => bool_f64(x != 0.0 || y != 0.0),
        BinOp::Xor => bool_f64((x != 0.0) ^ (y != 0.0)),
        BinOp::BitOr => ((x as i64) | (y as i64)) as f64,
        BinOp::BitAnd => ((x as i64) & (y as i64)) as f64,
        BinOp::BitXor => ((x as i64) ^ (y as i64)) as f64,
        BinOp::Shl => ((x as i64) << (y as i64)) as f64,
        BinOp::Shr => ((x as i64) >> (y as i64)) as f64,
        BinOp::Rol => (x as i64).rotate_left(y as u32) as f64,
        BinOp::Ror => (x as i64).rotate_right(y as u32) as f64,
        _ => return None,
    })
}

fn bool_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

// ---- constant propagation ----

/// Substitutes every reference to an immutable, never-reassigned,
/// literal-valued top-level binding with its value, then leaves the
/// (now possibly-dead) binding in place for the final trimming to
/// decide about — this pass only ever simplifies reads, never removes
/// bindings.
fn propagate_constants(program: &mut Program) {
    let mut known: HashMap<String, Expr> = HashMap::new();
    for stmt in &program.statements {
        if let Stmt::Assign { name, value, kind: MutKind::Immutable, .. } = stmt {
            if is_propagatable(value) {
                known.insert(name.clone(), value.clone());
            }
        }
    }
    for stmt in &mut program.statements {
        substitute_stmt(stmt, &known);
    }
}

fn is_propagatable(expr: &Expr) -> bool {
    matches!(expr, Expr::Number(_) | Expr::String(_))
}

fn substitute_stmt(stmt: &mut Stmt, known: &HashMap<String, Expr>) {
    match stmt {
        Stmt::Assign { value, .. } => substitute_expr(value, known),
        Stmt::ExpressionStmt(e) => substitute_expr(e, known),
        Stmt::Loop { iterable, body, reducer, .. } => {
            substitute_expr(iterable, known);
            body.iter_mut().for_each(|s| substitute_stmt(s, known));
            if let Some(r) = reducer {
                r.body.iter_mut().for_each(|s| substitute_stmt(s, known));
            }
        }
        Stmt::ReceiveLoop { address, body, .. } => {
            substitute_expr(address, known);
            body.iter_mut().for_each(|s| substitute_stmt(s, known));
        }
        Stmt::Jump { value: Some(v), .. } => substitute_expr(v, known),
        Stmt::Arena { body, .. } => body.iter_mut().for_each(|s| substitute_stmt(s, known)),
        Stmt::Defer { call, .. } => substitute_expr(call, known),
        Stmt::Spawn { expr, pipe_block, .. } => {
            substitute_expr(expr, known);
            if let Some(body) = pipe_block {
                body.iter_mut().for_each(|s| substitute_stmt(s, known));
            }
        }
        _ => {}
    }
}

fn substitute_expr(expr: &mut Expr, known: &HashMap<String, Expr>) {
    if let Expr::Ident(name) = expr {
        if let Some(value) = known.get(name) {
            *expr = value.clone();
            return;
        }
    }
    match expr {
        Expr::Binary(_, a, b) => {
            substitute_expr(a, known);
            substitute_expr(b, known);
        }
        Expr::Unary(_, a) | Expr::Postfix(_, a) | Expr::Cast(a, _) | Expr::Length(a) => {
            substitute_expr(a, known)
        }
        Expr::Range(a, b, _) => {
            substitute_expr(a, known);
            substitute_expr(b, known);
        }
        Expr::List(items) => items.iter_mut().for_each(|e| substitute_expr(e, known)),
        Expr::Map(keys, values) => {
            keys.iter_mut().for_each(|e| substitute_expr(e, known));
            values.iter_mut().for_each(|e| substitute_expr(e, known));
        }
        Expr::Index(a, b) => {
            substitute_expr(a, known);
            substitute_expr(b, known);
        }
        Expr::Slice { collection, start, end, step } => {
            substitute_expr(collection, known);
            [start, end, step].into_iter().flatten().for_each(|e| substitute_expr(e, known));
        }
        Expr::Lambda(l) => substitute_expr(&mut l.body, known),
        Expr::PatternLambda(clauses) => {
            clauses.iter_mut().for_each(|c| substitute_expr(&mut c.body, known))
        }
        Expr::MultiLambda(lambdas) => {
            lambdas.iter_mut().for_each(|l| substitute_expr(&mut l.body, known))
        }
        Expr::DirectCall { callee, args } => {
            substitute_expr(callee, known);
            args.iter_mut().for_each(|e| substitute_expr(e, known));
        }
        Expr::Call { args, .. } => args.iter_mut().for_each(|e| substitute_expr(e, known)),
        Expr::Match { condition, clauses, default_expr, .. } => {
            substitute_expr(condition, known);
            for c in clauses {
                if let Some(g) = &mut c.guard {
                    substitute_expr(g, known);
                }
                substitute_expr(&mut c.result, known);
            }
            substitute_expr(default_expr, known);
        }
        Expr::Pipe(a, b)
        | Expr::Parallel(a, b)
        | Expr::ConcurrentGather(a, b)
        | Expr::Send(a, b)
        | Expr::In(a, b) => {
            substitute_expr(a, known);
            substitute_expr(b, known);
        }
        Expr::Vector(items, _) => items.iter_mut().for_each(|e| substitute_expr(e, known)),
        Expr::JumpExpr { value: Some(v), .. } => substitute_expr(v, known),
        Expr::StructLiteral { fields, .. } => {
            fields.iter_mut().for_each(|(_, e)| substitute_expr(e, known))
        }
        _ => {}
    }
}

// ---- purity analysis ----

/// A lambda is pure if its body performs no I/O, process, FFI, or
/// mutable-update operation. Purity gates inlining: an impure callee
/// inlined at more than one call site would duplicate its side effects.
pub fn analyze_purity(program: &Program) -> HashMap<String, bool> {
    let mut purity = HashMap::new();
    for stmt in &program.statements {
        if let Stmt::Assign { name, value, .. } = stmt {
            collect_lambda_purity(name, value, &mut purity);
        }
    }
    purity
}

fn collect_lambda_purity(name: &str, expr: &Expr, out: &mut HashMap<String, bool>) {
    if let Expr::Lambda(l) = expr {
        let pure = is_pure_expr(&l.body);
        out.insert(name.to_string(), pure);
    }
}

const IMPURE_BUILTINS: &[&str] = &[
    "print", "println", "read_line", "read_file", "write_file", "exit", "spawn_process", "env",
    "time_now", "rand",
];

fn is_pure_expr(expr: &Expr) -> bool {
    match expr {
        Expr::Call { name, args, .. } => {
            !IMPURE_BUILTINS.contains(&name.as_str()) && args.iter().all(is_pure_expr)
        }
        Expr::DirectCall { callee, args } => is_pure_expr(callee) && args.iter().all(is_pure_expr),
        Expr::Binary(_, a, b) => is_pure_expr(a) && is_pure_expr(b),
        Expr::Unary(_, a) | Expr::Postfix(_, a) | Expr::Cast(a, _) | Expr::Length(a) => {
            is_pure_expr(a)
        }
        Expr::Range(a, b, _) => is_pure_expr(a) && is_pure_expr(b),
        Expr::List(items) => items.iter().all(is_pure_expr),
        Expr::Index(a, b) => is_pure_expr(a) && is_pure_expr(b),
        Expr::Match { condition, clauses, default_expr, .. } => {
            is_pure_expr(condition)
                && clauses.iter().all(|c| c.guard.as_ref().map(is_pure_expr).unwrap_or(true) && is_pure_expr(&c.result))
                && is_pure_expr(default_expr)
        }
        Expr::Send(_, _) => false,
        Expr::Unsafe(_) => false,
        _ => true,
    }
}

// ---- call-site counting & inlining ----

pub fn count_call_sites(program: &Program) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for stmt in &program.statements {
        count_in_stmt(stmt, &mut counts);
    }
    counts
}

fn count_in_stmt(stmt: &Stmt, counts: &mut HashMap<String, u32>) {
    match stmt {
        Stmt::Assign { value, .. } => count_in_expr(value, counts),
        Stmt::ExpressionStmt(e) => count_in_expr(e, counts),
        Stmt::Loop { iterable, body, .. } => {
            count_in_expr(iterable, counts);
            body.iter().for_each(|s| count_in_stmt(s, counts));
        }
        Stmt::ReceiveLoop { address, body, .. } => {
            count_in_expr(address, counts);
            body.iter().for_each(|s| count_in_stmt(s, counts));
        }
        Stmt::Arena { body, .. } => body.iter().for_each(|s| count_in_stmt(s, counts)),
        Stmt::Defer { call, .. } => count_in_expr(call, counts),
        Stmt::Spawn { expr, .. } => count_in_expr(expr, counts),
        _ => {}
    }
}

fn count_in_expr(expr: &Expr, counts: &mut HashMap<String, u32>) {
    if let Expr::Call { name, args, .. } = expr {
        *counts.entry(name.clone()).or_insert(0) += 1;
        args.iter().for_each(|a| count_in_expr(a, counts));
        return;
    }
    match expr {
        Expr::Binary(_, a, b) => {
            count_in_expr(a, counts);
            count_in_expr(b, counts);
        }
        Expr::Unary(_, a) | Expr::Postfix(_, a) | Expr::Cast(a, _) | Expr::Length(a) => {
            count_in_expr(a, counts)
        }
        Expr::List(items) => items.iter().for_each(|e| count_in_expr(e, counts)),
        Expr::DirectCall { callee, args } => {
            count_in_expr(callee, counts);
            args.iter().for_each(|a| count_in_expr(a, counts));
        }
        Expr::Lambda(l) => count_in_expr(&l.body, counts),
        Expr::Match { condition, clauses, default_expr, .. } => {
            count_in_expr(condition, counts);
            for c in clauses {
                count_in_expr(&c.result, counts);
            }
            count_in_expr(default_expr, counts);
        }
        _ => {}
    }
}

/// Inlines single-call-site, pure, non-recursive lambdas at their lone
/// call site. Anything else (impure, called more than once, or
/// self-recursive) is left as an ordinary call.
fn inline_candidates(program: &mut Program, purity: &HashMap<String, bool>, counts: &HashMap<String, u32>) {
    let mut bodies: HashMap<String, Lambda> = HashMap::new();
    for stmt in &program.statements {
        if let Stmt::Assign { name, value: Expr::Lambda(l), .. } = stmt {
            if purity.get(name).copied().unwrap_or(false)
                && counts.get(name).copied().unwrap_or(0) <= 1
                && !calls_itself(&l.body, name)
            {
                bodies.insert(name.clone(), l.clone());
            }
        }
    }
    if bodies.is_empty() {
        return;
    }
    for stmt in &mut program.statements {
        inline_in_stmt(stmt, &bodies);
    }
}

fn calls_itself(expr: &Expr, name: &str) -> bool {
    match expr {
        Expr::Call { name: n, args, .. } => n == name || args.iter().any(|a| calls_itself(a, name)),
        Expr::Binary(_, a, b) => calls_itself(a, name) || calls_itself(b, name),
        Expr::Lambda(l) => calls_itself(&l.body, name),
        _ => false,
    }
}

fn inline_in_stmt(stmt: &mut Stmt, bodies: &HashMap<String, Lambda>) {
    match stmt {
        Stmt::Assign { value, .. } => inline_in_expr(value, bodies),
        Stmt::ExpressionStmt(e) => inline_in_expr(e, bodies),
        Stmt::Loop { iterable, body, .. } => {
            inline_in_expr(iterable, bodies);
            body.iter_mut().for_each(|s| inline_in_stmt(s, bodies));
        }
        Stmt::Arena { body, .. } => body.iter_mut().for_each(|s| inline_in_stmt(s, bodies)),
        Stmt::Defer { call, .. } => inline_in_expr(call, bodies),
        Stmt::Spawn { expr, .. } => inline_in_expr(expr, bodies),
        _ => {}
    }
}

fn inline_in_expr(expr: &mut Expr, bodies: &HashMap<String, Lambda>) {
    if let Expr::Call { name, args, .. } = expr {
        args.iter_mut().for_each(|a| inline_in_expr(a, bodies));
        if let Some(lambda) = bodies.get(name) {
            let mut substitution = HashMap::new();
            for (param, arg) in lambda.params.iter().zip(args.iter()) {
                substitution.insert(param.clone(), arg.clone());
            }
            let mut body = (*lambda.body).clone();
            substitute_expr(&mut body, &substitution);
            *expr = body;
        }
        return;
    }
    match expr {
        Expr::Binary(_, a, b) => {
            inline_in_expr(a, bodies);
            inline_in_expr(b, bodies);
        }
        Expr::Unary(_, a) | Expr::Postfix(_, a) | Expr::Cast(a, _) | Expr::Length(a) => {
            inline_in_expr(a, bodies)
        }
        Expr::List(items) => items.iter_mut().for_each(|e| inline_in_expr(e, bodies)),
        Expr::Lambda(l) => inline_in_expr(&mut l.body, bodies),
        Expr::Match { condition, clauses, default_expr, .. } => {
            inline_in_expr(condition, bodies);
            for c in clauses {
                inline_in_expr(&mut c.result, bodies);
            }
            inline_in_expr(default_expr, bodies);
        }
        _ => {}
    }
}

// ---- closure capture analysis ----

/// Fills in `captured_vars` for every `Lambda`: the free variables in
/// its body that are not its own parameters, resolved against the set
/// of names bound by enclosing scopes.
pub fn analyze_captures(program: &mut Program) {
    let top_level: std::collections::HashSet<String> = program
        .statements
        .iter()
        .filter_map(|s| match s {
            Stmt::Assign { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();
    for stmt in &mut program.statements {
        capture_in_stmt(stmt, &top_level);
    }
}

fn capture_in_stmt(stmt: &mut Stmt, enclosing: &std::collections::HashSet<String>) {
    match stmt {
        Stmt::Assign { value, .. } => capture_in_expr(value, enclosing),
        Stmt::ExpressionStmt(e) => capture_in_expr(e, enclosing),
        Stmt::Loop { iterable, body, .. } => {
            capture_in_expr(iterable, enclosing);
            let mut inner = enclosing.clone();
            body.iter().for_each(|s| collect_bound_names(s, &mut inner));
            body.iter_mut().for_each(|s| capture_in_stmt(s, &inner));
        }
        Stmt::Arena { body, .. } => body.iter_mut().for_each(|s| capture_in_stmt(s, enclosing)),
        Stmt::Defer { call, .. } => capture_in_expr(call, enclosing),
        Stmt::Spawn { expr, .. } => capture_in_expr(expr, enclosing),
        _ => {}
    }
}

fn collect_bound_names(stmt: &Stmt, out: &mut std::collections::HashSet<String>) {
    if let Stmt::Assign { name, .. } = stmt {
        out.insert(name.clone());
    }
}

fn capture_in_expr(expr: &mut Expr, enclosing: &std::collections::HashSet<String>) {
    match expr {
        Expr::Lambda(l) => {
            let params: std::collections::HashSet<String> = l.params.iter().cloned().collect();
            let mut free = std::collections::HashSet::new();
            free_vars(&l.body, &params, &mut free);
            l.captured_vars = free.into_iter().filter(|v| enclosing.contains(v)).collect();
            l.captured_vars.sort();
            l.is_nested = !l.captured_vars.is_empty();
            capture_in_expr(&mut l.body, enclosing);
        }
        Expr::MultiLambda(lambdas) => {
            for l in lambdas {
                let params: std::collections::HashSet<String> = l.params.iter().cloned().collect();
                let mut free = std::collections::HashSet::new();
                free_vars(&l.body, &params, &mut free);
                l.captured_vars = free.into_iter().filter(|v| enclosing.contains(v)).collect();
                l.captured_vars.sort();
                l.is_nested = !l.captured_vars.is_empty();
                capture_in_expr(&mut l.body, enclosing);
            }
        }
        Expr::Binary(_, a, b) => {
            capture_in_expr(a, enclosing);
            capture_in_expr(b, enclosing);
        }
        Expr::Unary(_, a) | Expr::Postfix(_, a) | Expr::Cast(a, _) | Expr::Length(a) => {
            capture_in_expr(a, enclosing)
        }
        Expr::List(items) => items.iter_mut().for_each(|e| capture_in_expr(e, enclosing)),
        Expr::DirectCall { callee, args } => {
            capture_in_expr(callee, enclosing);
            args.iter_mut().for_each(|a| capture_in_expr(a, enclosing));
        }
        Expr::Call { args, .. } => args.iter_mut().for_each(|a| capture_in_expr(a, enclosing)),
        Expr::Match { condition, clauses, default_expr, .. } => {
            capture_in_expr(condition, enclosing);
            for c in clauses {
                capture_in_expr(&mut c.result, enclosing);
            }
            capture_in_expr(default_expr, enclosing);
        }
        _ => {}
    }
}

/// Collects identifiers referenced in `expr` that are not in `bound`,
/// descending into nested lambdas with their own params added to the
/// bound set.
fn free_vars(expr: &Expr, bound: &std::collections::HashSet<String>, out: &mut std::collections::HashSet<String>) {
    match expr {
        Expr::Ident(name) => {
            if !bound.contains(name) {
                out.insert(name.clone());
            }
        }
        Expr::Binary(_, a, b) => {
            free_vars(a, bound, out);
            free_vars(b, bound, out);
        }
        Expr::Unary(_, a) | Expr::Postfix(_, a) | Expr::Cast(a, _) | Expr::Length(a) => {
            free_vars(a, bound, out)
        }
        Expr::List(items) => items.iter().for_each(|e| free_vars(e, bound, out)),
        Expr::Index(a, b) => {
            free_vars(a, bound, out);
            free_vars(b, bound, out);
        }
        Expr::DirectCall { callee, args } => {
            free_vars(callee, bound, out);
            args.iter().for_each(|a| free_vars(a, bound, out));
        }
        Expr::Call { args, .. } => args.iter().for_each(|a| free_vars(a, bound, out)),
        Expr::Lambda(l) => {
            let mut inner = bound.clone();
            inner.extend(l.params.iter().cloned());
            free_vars(&l.body, &inner, out);
        }
        Expr::Match { condition, clauses, default_expr, .. } => {
            free_vars(condition, bound, out);
            for c in clauses {
                if let Some(g) = &c.guard {
                    free_vars(g, bound, out);
                }
                free_vars(&c.result, bound, out);
            }
            free_vars(default_expr, bound, out);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_nested_arithmetic_constants() {
        let mut e = Expr::Binary(
            BinOp::Add,
            Box::new(Expr::Number(2.0)),
            Box::new(Expr::Binary(BinOp::Mul, Box::new(Expr::Number(3.0)), Box::new(Expr::Number(4.0)))),
        );
        fold_expr(&mut e);
        assert_eq!(e, Expr::Number(14.0));
    }

    #[test]
    fn propagates_top_level_literal_into_later_use() {
        let mut program = Program {
            statements: vec![
                Stmt::Assign {
                    name: "x".into(),
                    value: Expr::Number(5.0),
                    kind: MutKind::Immutable,
                    compound_op: None,
                    precision: None,
                    hot: false,
                    is_update: false,
                    line: 0,
                },
                Stmt::ExpressionStmt(Expr::Binary(
                    BinOp::Add,
                    Box::new(Expr::Ident("x".into())),
                    Box::new(Expr::Number(1.0)),
                )),
            ],
        };
        propagate_constants(&mut program);
        fold_constants_program(&mut program);
        match &program.statements[1] {
            Stmt::ExpressionStmt(Expr::Number(n)) => assert_eq!(*n, 6.0),
            other => panic!("expected folded number, got {:?}", other),
        }
    }

    #[test]
    fn closure_captures_enclosing_immutable_binding() {
        let mut program = Program {
            statements: vec![
                Stmt::Assign {
                    name: "n".into(),
                    value: Expr::Number(10.0),
                    kind: MutKind::Immutable,
                    compound_op: None,
                    precision: None,
                    hot: false,
                    is_update: false,
                    line: 0,
                },
                Stmt::Assign {
                    name: "adder".into(),
                    value: Expr::Lambda(Lambda {
                        params: vec!["x".into()],
                        body: Box::new(Expr::Binary(
                            BinOp::Add,
                            Box::new(Expr::Ident("x".into())),
                            Box::new(Expr::Ident("n".into())),
                        )),
                        captured_vars: vec![],
                        is_nested: false,
                        is_pure: false,
                        hot: false,
                        name: Some("adder".into()),
                    }),
                    kind: MutKind::Immutable,
                    compound_op: None,
                    precision: None,
                    hot: false,
                    is_update: false,
                    line: 0,
                },
            ],
        };
        analyze_captures(&mut program);
        match &program.statements[1] {
            Stmt::Assign { value: Expr::Lambda(l), .. } => {
                assert_eq!(l.captured_vars, vec!["n".to_string()]);
                assert!(l.is_nested);
            }
            other => panic!("expected lambda assign, got {:?}", other),
        }
    }
}
