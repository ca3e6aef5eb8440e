//! The two-pass compilation driver (`spec.md §4.8`).
//!
//! A direct `call rel32`/`lea rip` instruction's own length never depends
//! on the value of its displacement, but the ELF layout the displacement
//! resolves against does depend on the total size of everything emitted
//! before it. Pass 1 compiles the whole program once, purely to learn how
//! long the text section turns out to be; pass 2 resets every piece of
//! emission state but keeps the symbol table and recompiles from
//! scratch, landing on byte-identical output (checked with
//! `debug_assert_eq!` below) since nothing in this compiler's lowering
//! ever branches on an address. Only after pass 2 are PLT stubs appended
//! and every `ForwardRef` collected during that pass patched to its
//! final target.

use std::collections::HashMap;

use flap_core::emitter::{Cond, Emitter, Mem};
use flap_core::registers::{Gpr, SYSV_XMM_ARGS, Xmm};

use crate::ast::{Pattern, PatternClause, Program};
use crate::codegen::container::{self, Layout, PltPlan};
use crate::codegen::state::{FlapCompiler, PendingLambda, PendingLambdaBody, TailPosition};
use crate::config::CompilerConfig;
use crate::error::{CompileError, ContainerError, FlapResult};
use crate::symbols::SymbolCollector;

/// What [`compile_program`] hands back: the finished executable bytes,
/// plus an optional `--keep-asm` dump of the final text section.
pub struct CompileOutput {
    pub bytes: Vec<u8>,
    pub asm_dump: Option<String>,
}

/// Parse → optimize already happened by the time this is called; this
/// is `NewFlapCompiler → Compile(program)` (`spec.md §4.1`'s control
/// flow sketch).
pub fn compile_program(program: Program, config: CompilerConfig) -> FlapResult<CompileOutput> {
    if !config.platform.is_implemented() {
        return Err(ContainerError::UnsupportedPlatform(config.platform.triple().to_string()).into());
    }

    let mut c = FlapCompiler::new(config, SymbolCollector::new().collect(&program));

    tracing::debug!("pass 1: size discovery");
    emit_whole_program(&mut c, &program)?;
    let pass1_len = c.text.len();

    tracing::debug!("pass 2: re-emission with a fresh symbol table replay");
    c.symbols = SymbolCollector::new().collect(&program);
    c.begin_second_pass();
    emit_whole_program(&mut c, &program)?;
    debug_assert_eq!(
        c.text.len(),
        pass1_len,
        "pass 1 and pass 2 must emit byte-identical text lengths (spec.md §8 determinism)"
    );

    tracing::debug!("laying out dynamic-linking metadata and patching forward references");
    let plan = PltPlan::new(&c.external_symbols, &c.needed_libraries);
    resolve_and_patch(&mut c, &plan)?;

    let labels: HashMap<usize, String> =
        c.function_offsets.iter().map(|(name, &offset)| (offset, name.clone())).collect();
    let asm_dump = c.config.keep_asm.then(|| container::dump_text_bytes(c.text.as_slice(), &labels));

    let rodata_vaddr = plan.rodata_vaddr(c.text.len());
    let layout = Layout { text: c.text.as_slice().to_vec(), rodata: c.rodata.to_bytes(rodata_vaddr as usize), plan };
    let bytes = container::write_elf(&layout)?;

    Ok(CompileOutput { bytes, asm_dump })
}

/// Compile the top-level statements as the program's entry point, then
/// drain the lambda work queue those statements (and every lambda body
/// compiled in turn) discover along the way.
fn emit_whole_program(c: &mut FlapCompiler, program: &Program) -> FlapResult<()> {
    {
        let mut em = Emitter::new(&mut c.text);
        em.push_reg(Gpr::Rbp);
        em.mov_reg_reg(Gpr::Rbp, Gpr::Rsp);
        em.sub_reg_imm32(Gpr::Rsp, c.symbols.frame_size);
    }
    for stmt in &program.statements {
        crate::codegen::stmt::compile_stmt(c, stmt)?;
    }
    // Implicit program end: `exit(0)` (`spec.md §6.4`), via the same raw
    // syscall the `exit()` builtin itself uses rather than a second PLT
    // mechanism just for this one case.
    {
        let mut em = Emitter::new(&mut c.text);
        em.mov_reg_imm32(Gpr::Rdi, 0);
        em.mov_reg_imm32(Gpr::Rax, 60); // SYS_exit
        em.syscall();
    }
    drain_pending_lambdas(c)
}

fn drain_pending_lambdas(c: &mut FlapCompiler) -> FlapResult<()> {
    let mut i = 0;
    while i < c.pending_lambdas.len() {
        let pending = c.pending_lambdas[i].clone();
        compile_pending_lambda(c, &pending)?;
        i += 1;
    }
    Ok(())
}

/// Emit one queued function: prologue (frame + captured-environment
/// unpack + parameter marshaling), body, epilogue. Every function shares
/// the same whole-program frame size (`spec.md §4.6`'s flat symbol table
/// note), so nothing here needs to know which lambda it is beyond its
/// own parameter list.
fn compile_pending_lambda(c: &mut FlapCompiler, pending: &PendingLambda) -> FlapResult<()> {
    let entry_offset = c.text.len();
    c.function_offsets.insert(pending.name.clone(), entry_offset);

    {
        let mut em = Emitter::new(&mut c.text);
        em.push_reg(Gpr::Rbp);
        em.mov_reg_reg(Gpr::Rbp, Gpr::Rsp);
        em.sub_reg_imm32(Gpr::Rsp, c.symbols.frame_size);
    }

    match &pending.body {
        PendingLambdaBody::Lambda(lambda) => {
            // A capturing lambda is entered with r15 holding the env
            // pointer (`compile_direct_call`'s convention); unpack each
            // captured variable back into the flat symbol slot its
            // defining scope already uses, so the body's plain
            // `compile_ident` lookups need no special case.
            for (i, captured) in lambda.captured_vars.iter().enumerate() {
                let offset = slot_offset(c, captured)?;
                let mut em = Emitter::new(&mut c.text);
                em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::R15, (i as i32) * 8));
                em.movsd_store(Mem::new(Gpr::Rbp, offset), Xmm::Xmm1);
            }

            if lambda.params.len() > SYSV_XMM_ARGS.len() {
                return Err(CompileError::ArityMismatch {
                    what: pending.name.clone(),
                    expected: SYSV_XMM_ARGS.len(),
                    found: lambda.params.len(),
                    line: 0,
                }
                .into());
            }
            let mut param_slots = Vec::with_capacity(lambda.params.len());
            for (i, param) in lambda.params.iter().enumerate() {
                let offset = slot_offset(c, param)?;
                let mut em = Emitter::new(&mut c.text);
                em.movsd_store(Mem::new(Gpr::Rbp, offset), SYSV_XMM_ARGS[i]);
                param_slots.push(offset);
            }

            let tail = TailPosition::SelfRecursive {
                function_name: pending.name.clone(),
                param_slots,
                body_start: entry_offset,
            };
            crate::codegen::expr::compile(c, &lambda.body, &tail)?;
        }
        PendingLambdaBody::PatternClauses { clauses, arg_slots } => {
            if arg_slots.len() > SYSV_XMM_ARGS.len() {
                return Err(CompileError::ArityMismatch {
                    what: pending.name.clone(),
                    expected: SYSV_XMM_ARGS.len(),
                    found: arg_slots.len(),
                    line: 0,
                }
                .into());
            }
            let mut param_slots = Vec::with_capacity(arg_slots.len());
            for (i, slot_name) in arg_slots.iter().enumerate() {
                let offset = slot_offset(c, slot_name)?;
                let mut em = Emitter::new(&mut c.text);
                em.movsd_store(Mem::new(Gpr::Rbp, offset), SYSV_XMM_ARGS[i]);
                param_slots.push(offset);
            }
            let tail = TailPosition::SelfRecursive {
                function_name: pending.name.clone(),
                param_slots,
                body_start: entry_offset,
            };
            compile_pattern_dispatch(c, clauses, arg_slots, &tail)?;
        }
    }

    let mut em = Emitter::new(&mut c.text);
    em.mov_reg_reg(Gpr::Rsp, Gpr::Rbp);
    em.pop_reg(Gpr::Rbp);
    em.ret();
    Ok(())
}

fn slot_offset(c: &FlapCompiler, name: &str) -> FlapResult<i32> {
    c.symbols
        .offsets
        .get(name)
        .map(|&(offset, _)| offset)
        .ok_or_else(|| CompileError::UndefinedVariable { name: name.to_string(), line: 0 }.into())
}

/// Pattern-dispatched function body: try each clause in declaration
/// order, testing `Literal` patterns against the argument already
/// marshaled into its `__pat_argN` slot and binding `Bind` patterns into
/// their own slot before running the clause body. Falls through to a
/// runtime guard panic if no clause matches (`spec.md §6.4`'s inline
/// `write(2, msg, len); exit(1)` convention).
fn compile_pattern_dispatch(
    c: &mut FlapCompiler,
    clauses: &[PatternClause],
    arg_slots: &[String],
    tail: &TailPosition,
) -> FlapResult<()> {
    let mut end_jumps = Vec::new();
    for clause in clauses {
        let mut mismatches = Vec::new();
        for (pat, slot_name) in clause.patterns.iter().zip(arg_slots) {
            if let Pattern::Literal(lit_expr) = pat {
                let offset = slot_offset(c, slot_name)?;
                crate::codegen::expr::compile(c, lit_expr, &TailPosition::No)?;
                let mut em = Emitter::new(&mut c.text);
                em.movsd_reg_reg(Xmm::Xmm1, Xmm::Xmm0);
                em.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rbp, offset));
                em.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
                mismatches.push(em.jcc_rel32(Cond::Ne));
            }
        }
        for (pat, slot_name) in clause.patterns.iter().zip(arg_slots) {
            if let Pattern::Bind(bound_name) = pat {
                let src = slot_offset(c, slot_name)?;
                let dst = slot_offset(c, bound_name)?;
                let mut em = Emitter::new(&mut c.text);
                em.movsd_load(Xmm::Xmm1, Mem::new(Gpr::Rbp, src));
                em.movsd_store(Mem::new(Gpr::Rbp, dst), Xmm::Xmm1);
            }
        }
        crate::codegen::expr::compile(c, &clause.body, tail)?;
        let mut em = Emitter::new(&mut c.text);
        end_jumps.push(em.jmp_rel32());
        let mismatch_target = em.pos();
        for m in mismatches {
            em.patch_rel32(m, mismatch_target);
        }
    }
    crate::builtins::emit_runtime_guard_panic(c, "no pattern clause matched")?;
    let mut em = Emitter::new(&mut c.text);
    let end = em.pos();
    for j in end_jumps {
        em.patch_rel32(j, end);
    }
    Ok(())
}

/// Patch every queued forward reference to its final address now that
/// the dynamic-linking metadata's layout (hence `.text`'s own base
/// address) is fixed: PLT-style external calls go to their `.plt` stub
/// (`plan.plt_entry_vaddr`, resolved at program load time by `ld.so`
/// rather than by this compiler — `spec.md §4.7`'s real dynamic-linking
/// contract, not the host-`dlsym` shortcut an earlier version of this
/// writer used), `lea rip` sites go to their rodata entry, lambda
/// function pointers get baked into their closure objects.
///
/// Every patch computes a `rel32` displacement via `c.text.patch_rel32`,
/// which expects its `target` argument in the *same coordinate space* as
/// the call site (a `.text`-buffer-local offset). Since `.plt` precedes
/// `.text` in this container's layout while `.rodata` follows it, both
/// directions are handled by the identical `absolute_vaddr.wrapping_sub
/// (text_vaddr)` expression: wrapping subtraction reproduces the correct
/// two's-complement bit pattern for a negative (backward) displacement
/// just as well as a positive one, so one code path covers both.
fn resolve_and_patch(c: &mut FlapCompiler, plan: &PltPlan) -> FlapResult<()> {
    let text_vaddr = plan.text_vaddr as usize;

    for fixup in c.pending_closure_fixups.clone() {
        let entry = *c.function_offsets.get(&fixup.lambda_name).ok_or_else(|| {
            CompileError::Other(format!("closure fixup for undefined function '{}'", fixup.lambda_name))
        })?;
        c.rodata.patch_u64(fixup.slot, 0, (text_vaddr + entry) as u64);
    }

    let rodata_vaddr = plan.rodata_vaddr(c.text.len()) as usize;
    let (rodata_addrs, _) = c.rodata.layout(rodata_vaddr);
    for rref in c.pending_rodata_refs.clone() {
        let target = rodata_addrs[rref.target.0].wrapping_sub(text_vaddr);
        c.text.patch_rel32(rref.site, target);
    }

    for call in c.pending_calls.clone() {
        let target = if let Some(symbol) = call.target_name.strip_prefix("@plt:") {
            let plt_vaddr = plan
                .plt_entry_vaddr(symbol)
                .ok_or_else(|| CompileError::Other(format!("unresolved external symbol '{symbol}'")))?
                as usize;
            plt_vaddr.wrapping_sub(text_vaddr)
        } else if let Some(name) = call.target_name.strip_prefix("@lambda-addr:") {
            *c.function_offsets
                .get(name)
                .ok_or_else(|| CompileError::UndefinedVariable { name: name.to_string(), line: 0 })?
        } else {
            *c.function_offsets
                .get(&call.target_name)
                .ok_or_else(|| CompileError::UndefinedVariable { name: call.target_name.clone(), line: 0 })?
        };
        c.text.patch_rel32(call.call_site, target);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, MutKind, Stmt};

    fn assign(name: &str, value: Expr) -> Stmt {
        Stmt::Assign {
            name: name.into(),
            value,
            kind: MutKind::Immutable,
            compound_op: None,
            precision: None,
            hot: false,
            is_update: false,
            line: 0,
        }
    }

    #[test]
    fn compiling_a_trivial_program_produces_a_valid_elf_header() {
        let program = Program { statements: vec![assign("x", Expr::Number(1.0))] };
        let output = compile_program(program, CompilerConfig::new()).unwrap();
        assert_eq!(&output.bytes[0..4], &[0x7f, b'E', b'L', b'F']);
    }

    #[test]
    fn unimplemented_platform_is_rejected_before_any_emission() {
        let program = Program { statements: vec![] };
        let config = CompilerConfig::new().with_platform(crate::config::Platform::Arm64Darwin);
        let err = compile_program(program, config).unwrap_err();
        assert!(matches!(err, crate::error::FlapError::Container(ContainerError::UnsupportedPlatform(_))));
    }

    #[test]
    fn keep_asm_produces_a_non_empty_dump_when_requested() {
        let program = Program { statements: vec![assign("x", Expr::Number(2.0))] };
        let config = CompilerConfig::new().with_keep_asm(true);
        let output = compile_program(program, config).unwrap();
        assert!(output.asm_dump.is_some());
        assert!(!output.asm_dump.unwrap().is_empty());
    }
}
