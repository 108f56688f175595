//! chert compiler CLI.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use chert_core::{CompileError, Compiler, Target};

#[derive(Parser)]
#[command(name = "chertc")]
#[command(version, about = "C-subset compiler producing x86-64 assembly or WebAssembly")]
struct Cli {
    /// Input files; `-` or no inputs reads standard input.
    inputs: Vec<PathBuf>,

    /// Output file (default: a.s for x86-64, a.wasm for wasm32).
    #[arg(short = 'o', value_name = "path")]
    output: Option<PathBuf>,

    /// Target backend.
    #[arg(short = 't', long = "target", value_enum, default_value = "x86-64")]
    target: TargetArg,

    /// Symbol names to export (wasm32 only; at least one required).
    #[arg(short = 'e', value_name = "name", value_delimiter = ',')]
    exports: Vec<String>,

    /// Emit progress diagnostics to standard error.
    #[arg(long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum TargetArg {
    #[value(name = "x86-64")]
    X86_64,
    #[value(name = "wasm32")]
    Wasm32,
}

impl From<TargetArg> for Target {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::X86_64 => Target::X86_64,
            TargetArg::Wasm32 => Target::Wasm32,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let target = Target::from(cli.target);
    info!(?target, inputs = cli.inputs.len().max(1), "starting compilation");
    let mut compiler = Compiler::new(target);

    let result = load_inputs(cli, &mut compiler).and_then(|()| compiler.compile(&cli.exports));
    let bytes = match result {
        Ok(bytes) => bytes,
        Err(err) => {
            // Accumulated diagnostics go to stderr, one per line; the
            // output file is not written.
            let rendered = compiler.render_diagnostics();
            if !rendered.is_empty() {
                eprintln!("{}", rendered);
            }
            return Err(err.into());
        }
    };

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(target.default_output()));
    std::fs::write(&output, &bytes)
        .with_context(|| format!("cannot write output file: {}", output.display()))?;
    info!(output = %output.display(), bytes = bytes.len(), "wrote output");
    Ok(())
}

fn load_inputs(cli: &Cli, compiler: &mut Compiler) -> Result<(), CompileError> {
    if cli.inputs.is_empty() {
        return load_stdin(compiler);
    }
    for path in &cli.inputs {
        if path.as_os_str() == "-" {
            load_stdin(compiler)?;
        } else {
            compiler.load_file(path)?;
        }
    }
    Ok(())
}

fn load_stdin(compiler: &mut Compiler) -> Result<(), CompileError> {
    let mut content = String::new();
    std::io::stdin().read_to_string(&mut content)?;
    compiler.parse_source(&content)
}
