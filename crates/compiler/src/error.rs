//! Error taxonomy.
//!
//! No `anyhow`/`thiserror` in this workspace: errors are hand-written
//! enums implementing `std::error::Error` + `Display`, one enum per
//! compilation stage, unified by `FlapError` at the public API boundary.

use std::fmt;
use std::path::PathBuf;

/// A three-line `file:line` / source-text / caret-marker error, the
/// minimum user-visible contract for lexical and syntactic failures.
#[derive(Debug, Clone)]
pub struct SourceError {
    pub file: PathBuf,
    pub line: usize,
    pub column: usize,
    pub source_line: String,
    pub message: String,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:{}: {}", self.file.display(), self.line + 1, self.message)?;
        writeln!(f, "{}", self.source_line)?;
        write!(f, "{}^", " ".repeat(self.column))
    }
}

impl std::error::Error for SourceError {}

/// Lexical errors: unrecognized character, unterminated string.
#[derive(Debug, Clone)]
pub struct LexError(pub SourceError);

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for LexError {}

/// Syntactic errors: unexpected token, missing delimiter.
#[derive(Debug, Clone)]
pub struct ParseError(pub SourceError);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for ParseError {}

/// A sentinel used only inside the parser's speculative mode: "this
/// alternative failed, roll back and try the next one". Never surfaces
/// outside the parser.
#[derive(Debug, Clone, Copy)]
pub struct SpeculativeFailure;

/// Compile-time semantic errors: undefined variable, re-bound immutable,
/// update of an undefined/immutable name, shadowed mutable, missing
/// `max` on a recursive call, arity/type-shape mismatches, and explicit
/// "not yet implemented" feature gates.
#[derive(Debug, Clone)]
pub enum CompileError {
    UndefinedVariable { name: String, line: usize },
    RebindImmutable { name: String, line: usize },
    UpdateUndefined { name: String, line: usize },
    ShadowMutable { name: String, line: usize },
    MissingRecursionMax { name: String, line: usize },
    ArityMismatch { what: String, expected: usize, found: usize, line: usize },
    TypeShape { message: String, line: usize },
    NotYetImplemented { feature: String },
    MultipleDefaults { line: usize },
    Other(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::UndefinedVariable { name, line } => {
                write!(f, "line {}: undefined variable '{}'", line + 1, name)
            }
            CompileError::RebindImmutable { name, line } => {
                write!(f, "line {}: cannot redefine immutable binding '{}' with '='", line + 1, name)
            }
            CompileError::UpdateUndefined { name, line } => {
                write!(f, "line {}: cannot update undefined name '{}'", line + 1, name)
            }
            CompileError::ShadowMutable { name, line } => {
                write!(f, "line {}: cannot shadow mutable binding '{}' with '='", line + 1, name)
            }
            CompileError::MissingRecursionMax { name, line } => write!(
                f,
                "line {}: recursive call to '{}' requires an explicit 'max N' or 'max inf' clause",
                line + 1,
                name
            ),
            CompileError::ArityMismatch { what, expected, found, line } => write!(
                f,
                "line {}: {} expects {} argument(s), found {}",
                line + 1,
                what,
                expected,
                found
            ),
            CompileError::TypeShape { message, line } => write!(f, "line {}: {}", line + 1, message),
            CompileError::NotYetImplemented { feature } => {
                write!(f, "not yet implemented: {}", feature)
            }
            CompileError::MultipleDefaults { line } => {
                write!(f, "line {}: match block may have at most one explicit default", line + 1)
            }
            CompileError::Other(s) => write!(f, "{}", s),
        }
    }
}
impl std::error::Error for CompileError {}

/// ELF/Mach-O container synthesis failures.
#[derive(Debug, Clone)]
pub enum ContainerError {
    UnsupportedPlatform(String),
    MissingEntryPoint,
    Layout(String),
    Io(String),
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerError::UnsupportedPlatform(p) => write!(f, "unsupported target platform: {}", p),
            ContainerError::MissingEntryPoint => write!(f, "program has no entry point"),
            ContainerError::Layout(s) => write!(f, "container layout error: {}", s),
            ContainerError::Io(s) => write!(f, "i/o error writing container: {}", s),
        }
    }
}
impl std::error::Error for ContainerError {}

impl From<std::io::Error> for ContainerError {
    fn from(e: std::io::Error) -> Self {
        ContainerError::Io(e.to_string())
    }
}

/// External-collaborator failures: Git fetch, pkg-config, ldconfig probing.
/// These are opaque providers by design; this workspace
/// only models their interface, so failures are reported but never
/// constructed by this crate's own logic.
#[derive(Debug, Clone)]
pub struct ExternalError(pub String);

impl fmt::Display for ExternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for ExternalError {}

/// The unified error type for the compiler's public API.
#[derive(Debug, Clone)]
pub enum FlapError {
    Lex(LexError),
    Parse(ParseError),
    Compile(CompileError),
    Container(ContainerError),
    External(ExternalError),
}

impl fmt::Display for FlapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlapError::Lex(e) => write!(f, "{}", e),
            FlapError::Parse(e) => write!(f, "{}", e),
            FlapError::Compile(e) => write!(f, "{}", e),
            FlapError::Container(e) => write!(f, "{}", e),
            FlapError::External(e) => write!(f, "{}", e),
        }
    }
}
impl std::error::Error for FlapError {}

impl From<LexError> for FlapError {
    fn from(e: LexError) -> Self {
        FlapError::Lex(e)
    }
}
impl From<ParseError> for FlapError {
    fn from(e: ParseError) -> Self {
        FlapError::Parse(e)
    }
}
impl From<CompileError> for FlapError {
    fn from(e: CompileError) -> Self {
        FlapError::Compile(e)
    }
}
impl From<ContainerError> for FlapError {
    fn from(e: ContainerError) -> Self {
        FlapError::Container(e)
    }
}
impl From<ExternalError> for FlapError {
    fn from(e: ExternalError) -> Self {
        FlapError::External(e)
    }
}

pub type FlapResult<T> = Result<T, FlapError>;
