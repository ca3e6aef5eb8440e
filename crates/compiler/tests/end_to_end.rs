//! Structural end-to-end checks over the emitted ELF image.
//!
//! This sandbox can't execute the binaries flapc produces, so these tests
//! assert on the container's structure (ELF header, program header count,
//! section ordering, entry point) rather than on stdout, plus compile-time
//! rejections for the edge cases that must fail before any bytes are
//! emitted.

use flapc::{CompilerConfig, FlapError};
use std::path::Path;

fn compile(src: &str) -> flapc::CompileOutput {
    flapc::compile_source(src, Path::new("<test>"), &CompilerConfig::new())
        .unwrap_or_else(|e| panic!("expected {src:?} to compile, got {e}"))
}

fn compile_err(src: &str) -> FlapError {
    flapc::compile_source(src, Path::new("<test>"), &CompilerConfig::new())
        .expect_err("expected a compile error")
}

fn assert_valid_elf(bytes: &[u8]) {
    assert_eq!(&bytes[0..4], &[0x7f, b'E', b'L', b'F'], "missing ELF magic");
    assert_eq!(bytes[4], 2, "expected ELFCLASS64");
    assert_eq!(bytes[5], 1, "expected ELFDATA2LSB");
    let e_phnum = u16::from_le_bytes([bytes[56], bytes[57]]);
    // PT_PHDR, PT_INTERP, 2x PT_LOAD, PT_DYNAMIC.
    assert_eq!(e_phnum, 5, "expected the fixed five-program-header layout");
    let e_entry = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
    assert!(e_entry >= 0x400000, "entry point should sit at or above the base load address");

    let p_type_at = |i: u64| u32::from_le_bytes(bytes[(64 + i * 56) as usize..(64 + i * 56 + 4) as usize].try_into().unwrap());
    assert_eq!(p_type_at(0), 6, "expected PT_PHDR first");
    assert_eq!(p_type_at(1), 3, "expected PT_INTERP second");
    assert_eq!(p_type_at(4), 2, "expected PT_DYNAMIC last");
}

#[test]
fn scenario_hello_world_compiles_to_a_runnable_image() {
    let out = compile(r#"println("hello")"#);
    assert_valid_elf(&out.bytes);
}

#[test]
fn scenario_arithmetic_compiles_to_a_runnable_image() {
    let out = compile("x = 2 + 3 * 4\nprintln(x)\n");
    assert_valid_elf(&out.bytes);
}

#[test]
fn scenario_factorial_with_explicit_recursion_max_compiles() {
    let out = compile("fact = (n) => n { 0 -> 1 ~> n * fact(n-1) max 100 }\nprintln(fact(5))\n");
    assert_valid_elf(&out.bytes);
}

#[test]
fn scenario_literal_range_loop_compiles_without_a_max_clause() {
    let out = compile("sum := 0\n@ i in 0..<10 { sum <- sum + i }\nprintln(sum)\n");
    assert_valid_elf(&out.bytes);
}

#[test]
fn scenario_or_bang_error_propagation_compiles() {
    let out = compile(r#"a = 10
b = a + 5 or! "bad"
println(b)
"#);
    assert_valid_elf(&out.bytes);
}

#[test]
fn empty_list_and_map_literals_compile() {
    let out = compile("xs = []\nm = {}\nprintln(xs)\n");
    assert_valid_elf(&out.bytes);
}

#[test]
fn keep_asm_dump_is_populated_when_requested() {
    let config = CompilerConfig::new().with_keep_asm(true);
    let out = flapc::compile_source("println(\"hi\")\n", Path::new("<test>"), &config).unwrap();
    assert!(out.asm_dump.is_some_and(|d| !d.is_empty()));
}

#[test]
fn recursive_call_without_a_max_clause_is_a_compile_error() {
    let err = compile_err("fact = (n) => n { 0 -> 1 ~> n * fact(n-1) }\nprintln(fact(5))\n");
    match err {
        FlapError::Compile(flapc::CompileError::MissingRecursionMax { name, .. }) => {
            assert_eq!(name, "fact");
        }
        other => panic!("expected MissingRecursionMax, got {other:?}"),
    }
}

#[test]
fn non_self_recursive_calls_need_no_max_clause() {
    let out = compile("double = (n) => n * 2\nprintln(double(21))\n");
    assert_valid_elf(&out.bytes);
}

#[test]
fn loop_over_a_non_literal_bound_without_max_is_a_parse_error() {
    let err = compile_err("n = 10\n@ i in 0..<n { println(i) }\n");
    assert!(matches!(err, FlapError::Parse(_)), "expected a parse error, got {err:?}");
}

#[test]
fn parallel_loop_with_a_single_thread_compiles() {
    let out = compile("1 @ i in 0..<4 { println(i) }\n");
    assert_valid_elf(&out.bytes);
}

#[test]
fn nested_lambdas_capturing_a_shadowed_outer_name_compile() {
    let out = compile(r#"x = 1
outer = () => {
    x = 2
    inner = () => x
    inner()
}
println(outer())
"#);
    assert_valid_elf(&out.bytes);
}

#[test]
fn negative_step_slice_with_open_bounds_compiles() {
    let out = compile("xs = [1, 2, 3, 4, 5]\nprintln(xs[::-1])\n");
    assert_valid_elf(&out.bytes);
}

#[test]
fn utf8_fstring_interpolation_compiles() {
    let out = compile("name = \"caf\u{e9}\"\nprintln(f\"hello {name}\")\n");
    assert_valid_elf(&out.bytes);
}

#[test]
fn a_syntax_error_is_reported_as_a_parse_error_not_a_panic() {
    let err = compile_err("x = (\n");
    assert!(matches!(err, FlapError::Parse(_)));
}
