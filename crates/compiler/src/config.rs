//! Compiler configuration: target platform selection and the
//! extension points for sibling-import and C-library-import resolution.
//!
//! # Example
//!
//! ```rust,ignore
//! use flapc::{CompilerConfig, Platform};
//!
//! let config = CompilerConfig::new().with_platform(Platform::X86_64Linux);
//! compile_file_with_config(source_path, output_path, &config)?;
//! ```

use crate::error::ExternalError;
use std::path::PathBuf;

/// The target triple this build of the compiler can emit a container
/// for. Only `X86_64Linux` is fully implemented; the other two are
/// accepted by the CLI and produce a `ContainerError::UnsupportedPlatform`
/// at the emission step rather than being rejected up front, so that
/// front-end-only use (parsing, optimization, linting a file for a
/// platform you're cross-developing for) still works.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    X86_64Linux,
    Arm64Darwin,
    RiscV64Linux,
}

impl Platform {
    pub fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Platform::X86_64Linux
        }
        #[cfg(target_arch = "aarch64")]
        {
            Platform::Arm64Darwin
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            Platform::RiscV64Linux
        }
    }

    pub fn is_implemented(self) -> bool {
        matches!(self, Platform::X86_64Linux)
    }

    pub fn triple(self) -> &'static str {
        match self {
            Platform::X86_64Linux => "x86_64-unknown-linux-gnu",
            Platform::Arm64Darwin => "aarch64-apple-darwin",
            Platform::RiscV64Linux => "riscv64gc-unknown-linux-flap",
        }
    }
}

/// A resolved sibling-import or C-library-import, ready for the
/// container writer to fold into the build (its exported symbols made
/// callable, its `.so`/static archive staged for linking metadata).
#[derive(Debug, Clone)]
pub struct ResolvedImport {
    pub alias: String,
    pub exported_symbols: Vec<String>,
    pub so_path: Option<PathBuf>,
}

/// The extension point for `import`. Flap programs can import other
/// Flap source files (by URL-shaped path) or C shared libraries; both
/// are opaque providers from this compiler's point of view; it only
/// models the interface. The default implementation refuses every
/// request, so a build with no provider configured fails loudly at the
/// `import` site rather than silently compiling a program with holes.
pub trait ExternalImportProvider: std::fmt::Debug {
    fn resolve_flap_import(
        &self,
        url: &str,
        version: Option<&str>,
    ) -> Result<ResolvedImport, ExternalError>;

    fn resolve_c_import(
        &self,
        library: &str,
        so_path: Option<&str>,
    ) -> Result<ResolvedImport, ExternalError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredImportProvider;

impl ExternalImportProvider for UnconfiguredImportProvider {
    fn resolve_flap_import(
        &self,
        url: &str,
        _version: Option<&str>,
    ) -> Result<ResolvedImport, ExternalError> {
        Err(ExternalError(format!(
            "no import provider configured: cannot resolve '{}' (pass a CompilerConfig with \
             with_import_provider to enable sibling imports)",
            url
        )))
    }

    fn resolve_c_import(
        &self,
        library: &str,
        _so_path: Option<&str>,
    ) -> Result<ResolvedImport, ExternalError> {
        Err(ExternalError(format!(
            "no import provider configured: cannot resolve C library '{}'",
            library
        )))
    }
}

pub struct CompilerConfig {
    pub platform: Platform,
    pub import_provider: Box<dyn ExternalImportProvider>,
    pub debug_flap: bool,
    /// `--keep-asm`: have [`crate::compile_program`] also return a
    /// textual byte/offset dump of the emitted text section, analogous
    /// to the teacher's `--keep-ir`.
    pub keep_asm: bool,
}

impl std::fmt::Debug for CompilerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerConfig")
            .field("platform", &self.platform)
            .field("import_provider", &self.import_provider)
            .field("debug_flap", &self.debug_flap)
            .field("keep_asm", &self.keep_asm)
            .finish()
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            platform: Platform::host(),
            import_provider: Box::new(UnconfiguredImportProvider),
            debug_flap: std::env::var("DEBUG_FLAP").is_ok(),
            keep_asm: false,
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_import_provider(mut self, provider: Box<dyn ExternalImportProvider>) -> Self {
        self.import_provider = provider;
        self
    }

    pub fn with_keep_asm(mut self, keep_asm: bool) -> Self {
        self.keep_asm = keep_asm;
        self
    }
}

/// Optional per-project settings read from a `flap.toml` beside the
/// entry file. Everything here has a sensible default; the file itself
/// is entirely optional.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub stdlib_path: Option<PathBuf>,
}

impl ProjectConfig {
    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_provider_refuses_every_import() {
        let provider = UnconfiguredImportProvider;
        assert!(provider.resolve_flap_import("github.com/x/y", None).is_err());
        assert!(provider.resolve_c_import("m", None).is_err());
    }

    #[test]
    fn only_x86_64_linux_is_implemented() {
        assert!(Platform::X86_64Linux.is_implemented());
        assert!(!Platform::Arm64Darwin.is_implemented());
        assert!(!Platform::RiscV64Linux.is_implemented());
    }

    #[test]
    fn project_config_parses_minimal_toml() {
        let cfg: ProjectConfig = toml::from_str("name = \"demo\"\n").unwrap();
        assert_eq!(cfg.name.as_deref(), Some("demo"));
        assert_eq!(cfg.platform, None);
    }
}
