//! Link errors

use thiserror::Error;

pub type LinkResult<T> = Result<T, LinkError>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{file}: not a recognized object file")]
    BadMagic { file: String },

    #[error("{file}: {message}")]
    BadObject { file: String, message: String },

    #[error("{file}: unsupported machine type")]
    UnsupportedMachine { file: String },

    #[error("{file}: object architecture does not match earlier inputs")]
    ArchMismatch { file: String },

    #[error("duplicate symbol '{name}'")]
    DuplicateSymbol { name: String },

    #[error("undefined symbols: {}", names.join(", "))]
    UndefinedSymbols { names: Vec<String> },

    #[error("relocation against '{symbol}' out of range")]
    RelocOutOfRange { symbol: String },

    #[error("no entry point: none of {candidates} is defined", candidates = "_start/main")]
    NoEntryPoint,

    #[error("no input objects")]
    NoInput,
}
