//! Compilation errors

use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{0}")]
    Parse(#[from] smallc_parser::ParseError),

    #[error("{line}: undefined variable '{name}'")]
    UndefinedVariable { name: String, line: u32 },

    #[error("{line}: function '{name}' already defined")]
    DuplicateFunction { name: String, line: u32 },

    #[error("{line}: duplicate global '{name}'")]
    DuplicateGlobal { name: String, line: u32 },

    #[error("{line}: duplicate local '{name}'")]
    DuplicateLocal { name: String, line: u32 },

    #[error("{line}: too many arguments in call (max {max})")]
    TooManyArgs { line: u32, max: usize },

    #[error("{line}: too many local variables (max {max})")]
    TooManyLocals { line: u32, max: usize },

    #[error("too many global variables (max {max})")]
    TooManyGlobals { max: usize },

    #[error("{line}: break outside loop")]
    BreakOutsideLoop { line: u32 },

    #[error("{line}: continue outside loop")]
    ContinueOutsideLoop { line: u32 },

    #[error("{line}: loops nested too deeply (max {max})")]
    LoopTooDeep { line: u32, max: usize },

    #[error("{line}: invalid initializer")]
    InvalidInitializer { line: u32 },

    #[error("{line}: string initializer does not fit array of {size}")]
    InitializerTooLong { line: u32, size: i64 },
}
