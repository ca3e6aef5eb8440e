//! Flap Compiler Library
//!
//! Provides compilation from Flap source to a standalone ELF64 executable,
//! with no external assembler, linker, or C toolchain invoked anywhere in
//! the pipeline: lexing and parsing produce an AST, the optimizer folds
//! constants and resolves lambda captures, the two-pass driver lowers the
//! optimized AST directly into machine code, and the container writer
//! frames the result as a minimal ELF image.
//!
//! # Example
//!
//! ```rust,ignore
//! use flapc::{CompilerConfig, Platform};
//!
//! let config = CompilerConfig::new().with_platform(Platform::X86_64Linux);
//! flapc::compile_file(source_path, output_path, &config)?;
//! ```

pub mod ast;
pub mod builtins;
pub mod codegen;
pub mod config;
pub mod error;
pub mod lexer;
pub mod optimizer;
pub mod parser;
pub mod symbols;
pub mod token;

pub use codegen::CompileOutput;
pub use config::{CompilerConfig, ExternalImportProvider, Platform, ProjectConfig, ResolvedImport};
pub use error::{CompileError, ContainerError, FlapError, FlapResult, LexError, ParseError};
pub use parser::Parser;

use std::fs;
use std::path::Path;

/// Compile a `.flap` source file to a standalone executable, using
/// whatever target platform the host build defaults to.
pub fn compile_file(source_path: &Path, output_path: &Path) -> FlapResult<()> {
    compile_file_with_config(source_path, output_path, &CompilerConfig::new())
}

/// Compile a `.flap` source file to a standalone executable with a
/// caller-supplied configuration (target platform, import provider).
pub fn compile_file_with_config(
    source_path: &Path,
    output_path: &Path,
    config: &CompilerConfig,
) -> FlapResult<()> {
    let source = fs::read_to_string(source_path)
        .map_err(|e| error::ExternalError(format!("failed to read '{}': {e}", source_path.display())))?;
    let output = compile_source(&source, source_path, config)?;
    write_executable(output_path, &output.bytes)?;

    if let Some(asm) = &output.asm_dump {
        let asm_path = output_path.with_extension("asm");
        fs::write(&asm_path, asm)
            .map_err(|e| error::ExternalError(format!("failed to write '{}': {e}", asm_path.display())))?;
        tracing::debug!(path = %asm_path.display(), "wrote --keep-asm dump");
    }
    Ok(())
}

/// Compile Flap source text to a finished [`CompileOutput`] without
/// touching the filesystem — the entry point the end-to-end tests and
/// any embedding tool drive directly.
pub fn compile_source(source: &str, file: &Path, config: &CompilerConfig) -> FlapResult<CompileOutput> {
    tracing::debug!(file = %file.display(), "parsing");
    let mut parser = Parser::from_source(source, file)?;
    let program = parser.parse_program()?;

    tracing::debug!("optimizing");
    let program = optimizer::optimize(program);

    codegen::compile_program(program, clone_config(config))
}

/// `CompilerConfig` doesn't derive `Clone` (its `import_provider` is a
/// `Box<dyn Trait>`), but every caller here only needs the scalar fields;
/// a borrowed provider would outlive this call either way since nothing
/// in `codegen` retains it past `compile_program`'s return.
fn clone_config(config: &CompilerConfig) -> CompilerConfig {
    CompilerConfig::new().with_platform(config.platform).with_keep_asm(config.keep_asm)
}

#[cfg(unix)]
fn write_executable(path: &Path, bytes: &[u8]) -> FlapResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, bytes)
        .map_err(|e| error::ExternalError(format!("failed to write '{}': {e}", path.display())))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| error::ExternalError(format!("failed to mark '{}' executable: {e}", path.display())))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_executable(path: &Path, bytes: &[u8]) -> FlapResult<()> {
    fs::write(path, bytes)
        .map_err(|e| error::ExternalError(format!("failed to write '{}': {e}", path.display())))?;
    Ok(())
}

/// Install a `tracing-subscriber` env-filter, defaulting to `debug` when
/// `DEBUG_FLAP` is set and `info` otherwise (`spec.md §6.4`). Exposed so
/// the CLI binary and embedding tools share one initialization path
/// instead of each hand-rolling a subscriber.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let default_level = if std::env::var("DEBUG_FLAP").is_ok() { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiling_an_empty_program_still_produces_a_runnable_elf_image() {
        let output = compile_source("", Path::new("<test>"), &CompilerConfig::new()).unwrap();
        assert_eq!(&output.bytes[0..4], &[0x7f, b'E', b'L', b'F']);
    }

    #[test]
    fn a_syntax_error_surfaces_as_flap_error_parse() {
        let err = compile_source("x = (", Path::new("<test>"), &CompilerConfig::new()).unwrap_err();
        assert!(matches!(err, FlapError::Parse(_)));
    }

    #[test]
    fn compile_file_round_trips_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("prog.flap");
        let output_path = dir.path().join("prog");
        fs::write(&source_path, "x = 1\n").unwrap();

        compile_file(&source_path, &output_path).unwrap();
        let bytes = fs::read(&output_path).unwrap();
        assert_eq!(&bytes[0..4], &[0x7f, b'E', b'L', b'F']);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&output_path).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0, "output should be executable");
        }
    }
}
