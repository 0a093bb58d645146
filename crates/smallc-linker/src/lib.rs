//! Static linker for the smallc toolchain.
//!
//! Reads SAS, ELF64 relocatable and COFF/AMD64 objects, concatenates
//! same-named sections, lays the result out (code, data, bss), resolves
//! symbols, applies relocations and writes a Linux ELF64 or Windows PE32+
//! executable.

mod coff;
mod elf_exec;
mod error;
mod input;
mod linker;
mod pe;

pub use error::{LinkError, LinkResult};
pub use input::read_object;
pub use linker::{Linker, LinkedImage, OutputFormat};

/// Lowest virtual address of a Linux executable image.
pub const BASE_ADDR: u64 = 0x400000;

/// Preferred image base of a PE32+ executable.
pub const IMAGE_BASE: u64 = 0x1_4000_0000;

/// Loader page size; code, data and bss start on page boundaries.
pub const PAGE_SIZE: u64 = 0x1000;

/// Alignment between section contributions from different objects.
pub const SECTION_ALIGN: u64 = 16;

/// PE file alignment.
pub const FILE_ALIGN: u64 = 0x200;
