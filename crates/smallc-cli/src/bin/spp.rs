//! `spp` - Small-C preprocessor driver.

use anyhow::Context;
use clap::Parser;
use smallc_cli::output;
use smallc_preprocessor::Preprocessor;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "spp")]
#[command(about = "Small-C preprocessor")]
#[command(version)]
struct Cli {
    /// Source file to preprocess
    input: PathBuf,

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
    let expanded = Preprocessor::new().process_file(&cli.input)?;
    match cli.output {
        Some(path) => std::fs::write(&path, expanded)
            .with_context(|| format!("cannot write {}", path.display()))?,
        None => std::io::stdout().write_all(expanded.as_bytes())?,
    }
    Ok(())
}
