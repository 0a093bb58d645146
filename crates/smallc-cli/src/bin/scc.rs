//! `scc` - Small-C compiler driver: C subset in, assembly text out.

use anyhow::{anyhow, Context};
use clap::Parser;
use smallc_cli::{output, TargetArg};
use smallc_compiler::compile_program;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "scc")]
#[command(about = "Small-C compiler")]
#[command(version)]
struct Cli {
    /// Source file to compile
    input: PathBuf,

    /// Code generation target
    #[arg(short, long, value_enum, default_value = "x64")]
    target: TargetArg,

    /// Output file (stdout if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    if let Err(err) = run(Cli::parse()) {
        output::error(&format!("{err:#}"));
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let file = cli.input.display().to_string();
    let source = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("cannot read {file}"))?;

    let parser = smallc_parser::Parser::new(&source).map_err(|e| anyhow!("{file}:{e}"))?;
    for warning in parser.warnings() {
        output::warning(&format!("{file}:{}: {}", warning.line, warning.message));
    }
    let program = parser.parse().map_err(|e| anyhow!("{file}:{e}"))?;
    let asm = compile_program(&program, cli.target.to_target())
        .map_err(|e| anyhow!("{file}:{e}"))?;

    match cli.output {
        Some(path) => std::fs::write(&path, asm)
            .with_context(|| format!("cannot write {}", path.display()))?,
        None => std::io::stdout().write_all(asm.as_bytes())?,
    }
    Ok(())
}
