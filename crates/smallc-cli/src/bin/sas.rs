//! `sas` - two-architecture assembler driver.

use anyhow::{anyhow, Context};
use clap::Parser;
use smallc_cli::{output, TargetArg};
use smallc_object::{elf, sas};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Format {
    /// Native SAS container
    Sas,
    /// ELF64 relocatable
    Elf,
}

#[derive(Parser)]
#[command(name = "sas")]
#[command(about = "Small-C assembler")]
#[command(version)]
struct Cli {
    /// Assembly source file
    input: PathBuf,

    /// Target architecture
    #[arg(short, long, value_enum, default_value = "x64")]
    target: TargetArg,

    /// Object container format
    #[arg(short, long, value_enum, default_value = "sas")]
    format: Format,

    /// Output object file
    #[arg(short, long)]
    output: PathBuf,
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

    let object =
        smallc_asm::assemble(&source, cli.target.to_arch()).map_err(|e| anyhow!("{file}:{e}"))?;

    let bytes = match cli.format {
        Format::Sas => sas::encode(&object),
        Format::Elf => elf::write_relocatable(&object),
    };
    std::fs::write(&cli.output, bytes)
        .with_context(|| format!("cannot write {}", cli.output.display()))?;
    Ok(())
}
