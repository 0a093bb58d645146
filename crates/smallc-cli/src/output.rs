//! Colored stderr diagnostics for the command-line tools.

use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

fn emit(prefix: &str, color: Color, message: &str) {
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    let mut spec = ColorSpec::new();
    spec.set_fg(Some(color)).set_bold(true);
    let _ = stderr.set_color(&spec);
    let _ = write!(stderr, "{prefix}: ");
    let _ = stderr.reset();
    let _ = writeln!(stderr, "{message}");
}

/// Print a fatal diagnostic.
pub fn error(message: &str) {
    emit("error", Color::Red, message);
}

/// Print a non-fatal diagnostic.
pub fn warning(message: &str) {
    emit("warning", Color::Yellow, message);
}
