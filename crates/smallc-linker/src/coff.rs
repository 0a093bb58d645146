//! COFF/AMD64 relocatable object reader.
//!
//! Covers the subset a Small-C assembler produces on Windows: section table,
//! symbol table with string table, and the ADDR64/ADDR32/REL32..REL32_5
//! relocation family. COFF stores relocation addends implicitly in the
//! patched field, so they are lifted out of the section bytes here.

use crate::error::{LinkError, LinkResult};
use smallc_object::{
    Arch, ByteReader, Object, RelocKind, Relocation, Section, SectionFlags, SectionKind,
    SymbolBinding, SymbolRecord,
};

const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

const IMAGE_SYM_CLASS_EXTERNAL: u8 = 2;

const IMAGE_REL_AMD64_ADDR64: u16 = 0x0001;
const IMAGE_REL_AMD64_ADDR32: u16 = 0x0002;
const IMAGE_REL_AMD64_REL32: u16 = 0x0004;
const IMAGE_REL_AMD64_REL32_5: u16 = 0x0009;

/// Quick shape check: a plausible COFF header for AMD64.
pub fn looks_like_coff(bytes: &[u8]) -> bool {
    bytes.len() >= 20 && u16::from_le_bytes([bytes[0], bytes[1]]) == IMAGE_FILE_MACHINE_AMD64
}

fn bad(file: &str, message: impl Into<String>) -> LinkError {
    LinkError::BadObject {
        file: file.to_owned(),
        message: message.into(),
    }
}

pub fn read(bytes: &[u8], file: &str) -> LinkResult<Object> {
    let mut r = ByteReader::new(bytes);
    let decode = |_e: smallc_object::DecodeError| bad(file, "truncated COFF file");

    let machine = r.read_u16().map_err(decode)?;
    if machine != IMAGE_FILE_MACHINE_AMD64 {
        return Err(LinkError::UnsupportedMachine {
            file: file.to_owned(),
        });
    }
    let nsections = r.read_u16().map_err(decode)? as usize;
    let _timestamp = r.read_u32().map_err(decode)?;
    let symtab_offset = r.read_u32().map_err(decode)? as usize;
    let nsymbols = r.read_u32().map_err(decode)? as usize;
    let opt_size = r.read_u16().map_err(decode)? as usize;
    let _characteristics = r.read_u16().map_err(decode)?;

    // String table sits right after the symbol table
    let strtab_offset = symtab_offset + nsymbols * 18;
    let strtab = bytes.get(strtab_offset..).unwrap_or(&[]);

    let mut object = Object::new(Arch::X64);

    struct RawSection {
        raw_offset: usize,
        reloc_offset: usize,
        nrelocs: usize,
    }
    let mut raw_sections = Vec::with_capacity(nsections);

    let section_base = 20 + opt_size;
    for i in 0..nsections {
        r.seek(section_base + i * 40).map_err(decode)?;
        let name_bytes = r.read_bytes(8).map_err(decode)?;
        let name = section_name(name_bytes, strtab);
        let _vsize = r.read_u32().map_err(decode)?;
        let _vaddr = r.read_u32().map_err(decode)?;
        let raw_size = r.read_u32().map_err(decode)? as usize;
        let raw_offset = r.read_u32().map_err(decode)? as usize;
        let reloc_offset = r.read_u32().map_err(decode)? as usize;
        let _lineno_offset = r.read_u32().map_err(decode)?;
        let nrelocs = r.read_u16().map_err(decode)? as usize;
        let _nlinenos = r.read_u16().map_err(decode)?;
        let characteristics = r.read_u32().map_err(decode)?;

        let kind = if characteristics & IMAGE_SCN_CNT_CODE != 0 {
            SectionKind::Text
        } else if characteristics & IMAGE_SCN_CNT_UNINITIALIZED_DATA != 0 {
            SectionKind::Bss
        } else {
            SectionKind::Data
        };
        let data = if kind == SectionKind::Bss || raw_offset == 0 {
            Vec::new()
        } else {
            bytes
                .get(raw_offset..raw_offset + raw_size)
                .ok_or_else(|| bad(file, "section data out of bounds"))?
                .to_vec()
        };
        let mut flags = SectionFlags::for_kind(kind);
        if kind == SectionKind::Data {
            flags.write = characteristics & IMAGE_SCN_MEM_WRITE != 0;
        }
        object.sections.push(Section {
            name,
            kind,
            flags,
            align: 16,
            size: if data.is_empty() && kind == SectionKind::Bss {
                raw_size as u64
            } else {
                data.len() as u64
            },
            data,
        });
        raw_sections.push(RawSection {
            raw_offset,
            reloc_offset,
            nrelocs,
        });
    }

    // Symbol table; `symbol_map` translates COFF symbol indices
    let mut symbol_map = vec![None; nsymbols];
    let mut i = 0;
    while i < nsymbols {
        r.seek(symtab_offset + i * 18).map_err(decode)?;
        let name_bytes = r.read_bytes(8).map_err(decode)?;
        let name = symbol_name(name_bytes, strtab);
        let value = r.read_u32().map_err(decode)? as u64;
        let section_number = r.read_u16().map_err(decode)? as i16;
        let _sym_type = r.read_u16().map_err(decode)?;
        let storage_class = r.read_u8().map_err(decode)?;
        let aux = r.read_u8().map_err(decode)? as usize;

        if !name.is_empty() {
            let section = (section_number > 0).then(|| section_number as usize - 1);
            let binding = if storage_class == IMAGE_SYM_CLASS_EXTERNAL {
                if section.is_some() {
                    SymbolBinding::Global
                } else {
                    SymbolBinding::External
                }
            } else {
                SymbolBinding::Local
            };
            object.symbols.push(SymbolRecord {
                name,
                section,
                value,
                binding,
                defined: section.is_some(),
            });
            symbol_map[i] = Some(object.symbols.len() - 1);
        }
        i += 1 + aux;
    }

    // Relocations, with the implicit addend read from the patched field
    for (sect_idx, raw) in raw_sections.iter().enumerate() {
        for j in 0..raw.nrelocs {
            r.seek(raw.reloc_offset + j * 10).map_err(decode)?;
            let offset = r.read_u32().map_err(decode)? as u64;
            let sym_idx = r.read_u32().map_err(decode)? as usize;
            let reloc_type = r.read_u16().map_err(decode)?;

            let Some(&Some(symbol)) = symbol_map.get(sym_idx) else {
                return Err(bad(file, format!("relocation against symbol {sym_idx}")));
            };
            let field = raw.raw_offset + offset as usize;
            let implicit32 = bytes
                .get(field..field + 4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64)
                .unwrap_or(0);

            let (kind, addend) = match reloc_type {
                IMAGE_REL_AMD64_ADDR64 => {
                    let implicit64 = bytes
                        .get(field..field + 8)
                        .map(|b| {
                            i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
                        })
                        .unwrap_or(0);
                    (RelocKind::Abs64, implicit64)
                }
                IMAGE_REL_AMD64_ADDR32 => (RelocKind::Abs32, implicit32),
                IMAGE_REL_AMD64_REL32..=IMAGE_REL_AMD64_REL32_5 => {
                    let extra = (reloc_type - IMAGE_REL_AMD64_REL32) as i64;
                    (RelocKind::Pc32, implicit32 - 4 - extra)
                }
                other => {
                    return Err(bad(file, format!("unknown COFF relocation type {other:#x}")))
                }
            };
            object.relocs.push(Relocation {
                section: sect_idx,
                offset,
                symbol,
                kind,
                addend,
            });
        }
    }

    Ok(object)
}

fn section_name(raw: &[u8], strtab: &[u8]) -> String {
    if raw[0] == b'/' {
        // long name: /NNN indexes the string table
        let idx: usize = std::str::from_utf8(&raw[1..])
            .ok()
            .and_then(|s| s.trim_end_matches('\0').parse().ok())
            .unwrap_or(0);
        return strtab_string(strtab, idx);
    }
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn symbol_name(raw: &[u8], strtab: &[u8]) -> String {
    if raw[..4] == [0, 0, 0, 0] {
        let offset = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
        return strtab_string(strtab, offset);
    }
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn strtab_string(strtab: &[u8], offset: usize) -> String {
    if offset >= strtab.len() {
        return String::new();
    }
    let end = strtab[offset..]
        .iter()
        .position(|&b| b == 0)
        .map_or(strtab.len(), |p| offset + p);
    String::from_utf8_lossy(&strtab[offset..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a one-section COFF object by hand: code calling an external.
    fn sample_coff() -> Vec<u8> {
        let mut bytes = Vec::new();
        // COFF header
        bytes.extend_from_slice(&IMAGE_FILE_MACHINE_AMD64.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // one section
        bytes.extend_from_slice(&0u32.to_le_bytes()); // timestamp
        let symtab_offset = 20 + 40 + 16; // header + section + data
        bytes.extend_from_slice(&(symtab_offset as u32).to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes()); // two symbols
        bytes.extend_from_slice(&0u16.to_le_bytes()); // no optional header
        bytes.extend_from_slice(&0u16.to_le_bytes());

        // Section header .text
        let mut name = *b".text\0\0\0";
        bytes.extend_from_slice(&name);
        bytes.extend_from_slice(&6u32.to_le_bytes()); // vsize
        bytes.extend_from_slice(&0u32.to_le_bytes()); // vaddr
        bytes.extend_from_slice(&6u32.to_le_bytes()); // raw size
        bytes.extend_from_slice(&60u32.to_le_bytes()); // raw offset
        let reloc_offset = symtab_offset + 2 * 18 + 4;
        bytes.extend_from_slice(&(reloc_offset as u32).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // lineno
        bytes.extend_from_slice(&1u16.to_le_bytes()); // one reloc
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&IMAGE_SCN_CNT_CODE.to_le_bytes());

        // Section data at offset 60: call rel32; ret, padded to 16
        assert_eq!(bytes.len(), 60);
        bytes.extend_from_slice(&[0xE8, 0, 0, 0, 0, 0xC3]);
        bytes.extend_from_slice(&[0; 10]);

        // Symbols: main (defined), helper (undefined)
        assert_eq!(bytes.len(), symtab_offset);
        name = *b"main\0\0\0\0";
        bytes.extend_from_slice(&name);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // section 1
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.push(IMAGE_SYM_CLASS_EXTERNAL);
        bytes.push(0);

        name = *b"helper\0\0";
        bytes.extend_from_slice(&name);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes()); // undefined
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.push(IMAGE_SYM_CLASS_EXTERNAL);
        bytes.push(0);

        // Empty string table (just its length field)
        bytes.extend_from_slice(&4u32.to_le_bytes());

        // Relocation: REL32 at offset 1 against symbol 1 (helper)
        assert_eq!(bytes.len(), reloc_offset);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&IMAGE_REL_AMD64_REL32.to_le_bytes());

        bytes
    }

    #[test]
    fn test_read_coff_object() {
        let bytes = sample_coff();
        let obj = read(&bytes, "t.obj").unwrap();

        assert_eq!(obj.arch, Arch::X64);
        assert_eq!(obj.sections.len(), 1);
        assert_eq!(obj.sections[0].name, ".text");
        assert_eq!(obj.sections[0].kind, SectionKind::Text);
        assert_eq!(&obj.sections[0].data[..6], &[0xE8, 0, 0, 0, 0, 0xC3]);

        let main = &obj.symbols[obj.find_symbol("main").unwrap()];
        assert!(main.defined);
        assert_eq!(main.binding, SymbolBinding::Global);
        let helper = &obj.symbols[obj.find_symbol("helper").unwrap()];
        assert!(!helper.defined);

        assert_eq!(obj.relocs.len(), 1);
        let reloc = &obj.relocs[0];
        assert_eq!(reloc.kind, RelocKind::Pc32);
        assert_eq!(reloc.offset, 1);
        assert_eq!(reloc.addend, -4);
        assert_eq!(obj.symbols[reloc.symbol].name, "helper");
    }

    #[test]
    fn test_rejects_wrong_machine() {
        let mut bytes = sample_coff();
        bytes[0] = 0x4C; // i386
        bytes[1] = 0x01;
        assert!(!looks_like_coff(&bytes));
    }
}
