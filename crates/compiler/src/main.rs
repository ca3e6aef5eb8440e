//! Flap Compiler CLI
//!
//! A thin wrapper around the `flapc` library: the CLI surface itself is
//! explicitly out of scope for this compiler (no subcommands, no lint/test
//! runners), so this binary only exposes what's needed to drive a build
//! from a shell or a `Makefile`.

use clap::Parser as ClapParser;
use flapc::{CompilerConfig, Platform};
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "flapc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Flap compiler - compile .flap programs to standalone executables", long_about = None)]
struct Cli {
    /// Input .flap source file
    input: PathBuf,

    /// Output executable path (defaults to the input filename without its extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Target triple to emit for
    #[arg(long, default_value = "x86_64-unknown-linux-flap")]
    target: String,

    /// Write a textual disassembly-like dump of the emitted text section
    /// next to the output binary (`<output>.asm`)
    #[arg(long)]
    keep_asm: bool,
}

fn main() {
    flapc::init_tracing();
    let cli = Cli::parse();

    let platform = match parse_target(&cli.target) {
        Some(p) => p,
        None => {
            eprintln!("error: unrecognized target triple '{}'", cli.target);
            process::exit(1);
        }
    };

    let output = cli.output.clone().unwrap_or_else(|| {
        let stem = cli.input.file_stem().unwrap_or_default();
        PathBuf::from(stem)
    });

    let config = CompilerConfig::new().with_platform(platform).with_keep_asm(cli.keep_asm);

    match flapc::compile_file_with_config(&cli.input, &output, &config) {
        Ok(()) => {
            println!("Compiled {} -> {}", cli.input.display(), output.display());
            if cli.keep_asm {
                println!("Disassembly dump written to {}", output.with_extension("asm").display());
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

fn parse_target(triple: &str) -> Option<Platform> {
    match triple {
        "x86_64-unknown-linux-flap" | "x86_64-unknown-linux-gnu" => Some(Platform::X86_64Linux),
        "aarch64-apple-darwin" => Some(Platform::Arm64Darwin),
        "riscv64gc-unknown-linux-flap" => Some(Platform::RiscV64Linux),
        _ => None,
    }
}
