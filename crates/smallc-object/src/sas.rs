//! The native SAS object container.
//!
//! Layout (all fields little-endian):
//!
//! ```text
//! magic   "SAS\0"
//! u32     arch            0 = x86-64, 1 = aarch64
//! u32     section count
//! u32     symbol count
//! u32     relocation count
//! sections:    name[128]  u32 size  u32 flags  u32 align  bytes (non-bss)
//! symbols:     name[128]  u32 value i32 section u32 binding u32 defined
//! relocations: u32 offset u32 symbol u32 kind  u32 section i32 addend
//! ```

use crate::encode::{ByteReader, ByteWriter, DecodeError};
use crate::object::{
    Arch, Object, RelocKind, Relocation, Section, SectionFlags, SectionKind, SymbolBinding,
    SymbolRecord,
};
use thiserror::Error;

/// Magic number for SAS object files
pub const MAGIC: [u8; 4] = *b"SAS\0";

/// Width of every fixed name field
pub const NAME_FIELD: usize = 128;

const SEC_CODE: u32 = 1;
const SEC_DATA: u32 = 2;
const SEC_BSS: u32 = 4;
const SEC_READONLY: u32 = 8;

/// SAS container errors
#[derive(Debug, Error)]
pub enum SasError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid magic number: expected SAS, got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unknown architecture tag {0}")]
    UnknownArch(u32),

    #[error("unknown symbol binding {0}")]
    UnknownBinding(u32),

    #[error("unknown relocation kind {0}")]
    UnknownRelocKind(u32),
}

fn kind_to_flags(section: &Section) -> u32 {
    let mut flags = match section.kind {
        SectionKind::Text => SEC_CODE,
        SectionKind::Data => SEC_DATA,
        SectionKind::Bss => SEC_BSS,
        SectionKind::Other => 0,
    };
    if !section.flags.write && section.kind != SectionKind::Text {
        flags |= SEC_READONLY;
    }
    flags
}

fn flags_to_kind(flags: u32) -> (SectionKind, SectionFlags) {
    let kind = if flags & SEC_BSS != 0 {
        SectionKind::Bss
    } else if flags & SEC_CODE != 0 {
        SectionKind::Text
    } else if flags & SEC_DATA != 0 {
        SectionKind::Data
    } else {
        SectionKind::Other
    };
    let mut sf = SectionFlags::for_kind(kind);
    if flags & SEC_READONLY != 0 {
        sf.write = false;
    }
    (kind, sf)
}

/// Serialize an object into the SAS container.
pub fn encode(object: &Object) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(1024);
    w.emit_bytes(&MAGIC);
    w.emit_u32(match object.arch {
        Arch::X64 => 0,
        Arch::Arm64 => 1,
    });
    w.emit_u32(object.sections.len() as u32);
    w.emit_u32(object.symbols.len() as u32);
    w.emit_u32(object.relocs.len() as u32);

    for section in &object.sections {
        w.emit_name(&section.name, NAME_FIELD);
        w.emit_u32(section.size as u32);
        w.emit_u32(kind_to_flags(section));
        w.emit_u32(section.align);
        if !section.is_bss() {
            w.emit_bytes(&section.data);
        }
    }

    for symbol in &object.symbols {
        w.emit_name(&symbol.name, NAME_FIELD);
        w.emit_u32(symbol.value as u32);
        w.emit_i32(symbol.section.map_or(-1, |s| s as i32));
        w.emit_u32(symbol.binding.to_raw());
        w.emit_u32(symbol.defined as u32);
    }

    for reloc in &object.relocs {
        w.emit_u32(reloc.offset as u32);
        w.emit_u32(reloc.symbol as u32);
        w.emit_u32(reloc.kind.to_raw(object.arch));
        w.emit_u32(reloc.section as u32);
        w.emit_i32(reloc.addend as i32);
    }

    w.into_bytes()
}

/// Parse a SAS container back into an object.
pub fn decode(data: &[u8]) -> Result<Object, SasError> {
    let mut r = ByteReader::new(data);

    let magic = r.read_bytes(4)?;
    if magic != MAGIC {
        return Err(SasError::InvalidMagic([
            magic[0], magic[1], magic[2], magic[3],
        ]));
    }

    let arch = match r.read_u32()? {
        0 => Arch::X64,
        1 => Arch::Arm64,
        other => return Err(SasError::UnknownArch(other)),
    };
    let nsections = r.read_u32()? as usize;
    let nsymbols = r.read_u32()? as usize;
    let nrelocs = r.read_u32()? as usize;

    let mut object = Object::new(arch);

    for _ in 0..nsections {
        let name = r.read_name(NAME_FIELD)?;
        let size = r.read_u32()? as u64;
        let raw_flags = r.read_u32()?;
        let align = r.read_u32()?;
        let (kind, flags) = flags_to_kind(raw_flags);
        let data = if kind == SectionKind::Bss {
            Vec::new()
        } else {
            r.read_bytes(size as usize)?.to_vec()
        };
        object.sections.push(Section {
            name,
            kind,
            flags,
            align,
            data,
            size,
        });
    }

    for _ in 0..nsymbols {
        let name = r.read_name(NAME_FIELD)?;
        let value = r.read_u32()? as u64;
        let section = r.read_i32()?;
        let binding_raw = r.read_u32()?;
        let defined = r.read_u32()? != 0;
        let binding =
            SymbolBinding::from_raw(binding_raw).ok_or(SasError::UnknownBinding(binding_raw))?;
        object.symbols.push(SymbolRecord {
            name,
            section: (section >= 0).then_some(section as usize),
            value,
            binding,
            defined,
        });
    }

    for _ in 0..nrelocs {
        let offset = r.read_u32()? as u64;
        let symbol = r.read_u32()? as usize;
        let raw_kind = r.read_u32()?;
        let section = r.read_u32()? as usize;
        let addend = r.read_i32()? as i64;
        let kind = RelocKind::from_raw(arch, raw_kind)
            .map_err(|_| SasError::UnknownRelocKind(raw_kind))?;
        object.relocs.push(Relocation {
            section,
            offset,
            symbol,
            kind,
            addend,
        });
    }

    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_object() -> Object {
        let mut obj = Object::new(Arch::X64);
        let text = obj.add_section(".text", SectionKind::Text, 16);
        obj.sections[text].data = vec![0x48, 0x31, 0xC0, 0xC3];
        obj.sections[text].size = 4;
        let bss = obj.add_section(".bss", SectionKind::Bss, 8);
        obj.sections[bss].size = 32;
        let main = obj.add_symbol("main", Some(text), 0, SymbolBinding::Global);
        let external = obj.add_symbol("putchar", None, 0, SymbolBinding::External);
        obj.relocs.push(Relocation {
            section: text,
            offset: 0,
            symbol: external,
            kind: RelocKind::Pc32,
            addend: -4,
        });
        obj.symbols[main].binding = SymbolBinding::Global;
        obj
    }

    #[test]
    fn test_roundtrip() {
        let obj = sample_object();
        let bytes = encode(&obj);
        let back = decode(&bytes).unwrap();

        assert_eq!(back.arch, Arch::X64);
        assert_eq!(back.sections.len(), 2);
        assert_eq!(back.sections[0].name, ".text");
        assert_eq!(back.sections[0].data, obj.sections[0].data);
        assert_eq!(back.sections[1].kind, SectionKind::Bss);
        assert_eq!(back.sections[1].size, 32);
        assert!(back.sections[1].data.is_empty());

        assert_eq!(back.symbols.len(), 2);
        assert_eq!(back.symbols[0].name, "main");
        assert!(back.symbols[0].defined);
        assert_eq!(back.symbols[1].name, "putchar");
        assert!(!back.symbols[1].defined);

        assert_eq!(back.relocs.len(), 1);
        assert_eq!(back.relocs[0].kind, RelocKind::Pc32);
        assert_eq!(back.relocs[0].addend, -4);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = encode(&sample_object());
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(SasError::InvalidMagic(_))));
    }

    #[test]
    fn test_truncated_input() {
        let bytes = encode(&sample_object());
        assert!(decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_bss_contributes_no_bytes() {
        let mut obj = Object::new(Arch::Arm64);
        let bss = obj.add_section(".bss", SectionKind::Bss, 8);
        obj.sections[bss].size = 4096;
        let bytes = encode(&obj);
        // header + one section record only
        assert_eq!(bytes.len(), 4 + 16 + NAME_FIELD + 12);
    }
}
