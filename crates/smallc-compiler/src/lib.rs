//! Small-C code generation.
//!
//! Walks the AST from `smallc-parser` and emits assembly text for one of the
//! two supported targets. The evaluation model is a single accumulator
//! (`%rax` / `x0`) plus the machine stack for intermediate values.

mod codegen;
mod emitter;
mod error;
mod symbols;

pub use codegen::compile_program;
pub use error::{CompileError, CompileResult};

/// Maximum nesting depth of loops carrying break/continue targets.
pub const MAXWHILE: usize = 20;

/// Maximum locals (including parameters) per function.
pub const MAXLOCALS: usize = 32;

/// Maximum global variables per translation unit.
pub const MAXGLOBALS: usize = 200;

/// Code generation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    X64,
    Arm64,
}

impl Target {
    /// Integer argument registers available for calls
    pub fn max_call_args(self) -> usize {
        match self {
            Target::X64 => 6,
            Target::Arm64 => 8,
        }
    }
}

/// Convenience: parse and compile a source string in one step.
pub fn compile_source(source: &str, target: Target) -> CompileResult<String> {
    let parser = smallc_parser::Parser::new(source)?;
    let program = parser.parse()?;
    compile_program(&program, target)
}
