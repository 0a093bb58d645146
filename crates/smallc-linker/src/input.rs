//! Object-file ingestion with container auto-detection.

use crate::coff;
use crate::error::{LinkError, LinkResult};
use smallc_object::{elf, sas, Object};

/// Parse an object file, detecting SAS, ELF64 relocatable or COFF/AMD64 by
/// magic. `file` is used only for diagnostics.
pub fn read_object(bytes: &[u8], file: &str) -> LinkResult<Object> {
    if bytes.starts_with(&sas::MAGIC) {
        return sas::decode(bytes).map_err(|e| LinkError::BadObject {
            file: file.to_owned(),
            message: e.to_string(),
        });
    }
    if bytes.starts_with(&elf::ELF_MAGIC) {
        return elf::read_relocatable(bytes).map_err(|e| match e {
            elf::ElfError::UnsupportedMachine(_) => LinkError::UnsupportedMachine {
                file: file.to_owned(),
            },
            other => LinkError::BadObject {
                file: file.to_owned(),
                message: other.to_string(),
            },
        });
    }
    if coff::looks_like_coff(bytes) {
        return coff::read(bytes, file);
    }
    Err(LinkError::BadMagic {
        file: file.to_owned(),
    })
}
