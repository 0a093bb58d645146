//! Shared pieces of the smallc command-line tools.

pub mod output;

use smallc_compiler::Target;
use smallc_object::Arch;

/// Architecture selector shared by `scc` and `sas`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TargetArg {
    X64,
    Arm64,
}

impl TargetArg {
    pub fn to_target(self) -> Target {
        match self {
            TargetArg::X64 => Target::X64,
            TargetArg::Arm64 => Target::Arm64,
        }
    }

    pub fn to_arch(self) -> Arch {
        match self {
            TargetArg::X64 => Arch::X64,
            TargetArg::Arm64 => Arch::Arm64,
        }
    }
}
