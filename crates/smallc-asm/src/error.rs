//! Assembler errors

use thiserror::Error;

pub type AsmResult<T> = Result<T, AsmError>;

#[derive(Debug, Error)]
pub enum AsmError {
    #[error("{line}: syntax error: {message}")]
    Syntax { line: u32, message: String },

    #[error("{line}: unknown mnemonic '{mnemonic}'")]
    UnknownMnemonic { line: u32, mnemonic: String },

    #[error("{line}: bad operands for '{mnemonic}': {message}")]
    BadOperands {
        line: u32,
        mnemonic: String,
        message: String,
    },

    #[error("{line}: undefined branch target '{name}'")]
    UndefinedBranchTarget { line: u32, name: String },

    #[error("{line}: immediate out of range: {message}")]
    ImmOutOfRange { line: u32, message: String },

    #[error("{line}: branch displacement out of range to '{name}'")]
    BranchOutOfRange { line: u32, name: String },

    #[error("{line}: symbol '{name}' redefined with a different value")]
    SymbolRedefined { line: u32, name: String },

    #[error("{line}: cannot emit data into .bss")]
    DataInBss { line: u32 },

    #[error("{line}: instruction width changed between passes ({pass1} vs {pass2})")]
    PassSizeMismatch { line: u32, pass1: u64, pass2: u64 },
}

impl AsmError {
    pub fn syntax(line: u32, message: impl Into<String>) -> Self {
        AsmError::Syntax {
            line,
            message: message.into(),
        }
    }

    pub fn bad_operands(line: u32, mnemonic: &str, message: impl Into<String>) -> Self {
        AsmError::BadOperands {
            line,
            mnemonic: mnemonic.to_owned(),
            message: message.into(),
        }
    }
}
