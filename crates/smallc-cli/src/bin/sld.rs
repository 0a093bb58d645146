//! `sld` - static linker driver.

use anyhow::Context;
use clap::Parser;
use smallc_cli::output;
use smallc_linker::{read_object, Linker, OutputFormat};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Format {
    /// Linux ELF64 executable
    Elf,
    /// Windows PE32+ executable
    Pe,
}

#[derive(Parser)]
#[command(name = "sld")]
#[command(about = "Small-C linker")]
#[command(version)]
struct Cli {
    /// Object files to link
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Executable format
    #[arg(short, long, value_enum, default_value = "elf")]
    format: Format,

    /// Output executable
    #[arg(short, long, default_value = "a.out")]
    output: PathBuf,
}

fn main() {
    if let Err(err) = run(Cli::parse()) {
        output::error(&format!("{err:#}"));
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut linker = Linker::new();
    for input in &cli.inputs {
        let file = input.display().to_string();
        let bytes = std::fs::read(input).with_context(|| format!("cannot read {file}"))?;
        let object = read_object(&bytes, &file)?;
        linker.add_object(&object, &file)?;
    }

    let format = match cli.format {
        Format::Elf => OutputFormat::Elf,
        Format::Pe => OutputFormat::Pe,
    };
    let image = linker.link(format)?;

    std::fs::write(&cli.output, &image.bytes)
        .with_context(|| format!("cannot write {}", cli.output.display()))?;

    #[cfg(unix)]
    if format == OutputFormat::Elf {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&cli.output)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&cli.output, perms)?;
    }
    Ok(())
}
