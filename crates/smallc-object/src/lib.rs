//! Relocatable object model for the smallc toolchain.
//!
//! The assembler produces an [`Object`] and serializes it into either the
//! native SAS container or an ELF64 relocatable file; the linker reads both
//! back into the same in-memory model.

pub mod elf;
pub mod encode;
pub mod object;
pub mod sas;

pub use encode::{ByteReader, ByteWriter, DecodeError};
pub use object::{
    Arch, Object, ObjectError, RelocKind, Relocation, Section, SectionFlags, SectionKind,
    SymbolBinding, SymbolRecord,
};
