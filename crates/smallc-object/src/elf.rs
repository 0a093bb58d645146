//! ELF64 relocatable reading and writing.
//!
//! The writer produces a conforming `ET_REL` file with `.symtab`, `.strtab`,
//! `.shstrtab` and one `.rela.<name>` section per relocated section; the
//! reader accepts the same shape back (including files produced by other
//! assemblers, as long as they stay within the SysV base feature set).

use crate::encode::{ByteReader, ByteWriter, DecodeError};
use crate::object::{
    Arch, Object, ObjectError, RelocKind, Relocation, Section, SectionFlags, SectionKind,
    SymbolBinding, SymbolRecord,
};
use thiserror::Error;

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_NOBITS: u32 = 8;

const SHF_WRITE: u64 = 1;
const SHF_ALLOC: u64 = 2;
const SHF_EXECINSTR: u64 = 4;

const STB_LOCAL: u8 = 0;
const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;

const STT_NOTYPE: u8 = 0;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;
const STT_SECTION: u8 = 3;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const RELA_SIZE: usize = 24;

/// ELF container errors
#[derive(Debug, Error)]
pub enum ElfError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("not an ELF file")]
    InvalidMagic,

    #[error("not a 64-bit little-endian relocatable file")]
    UnsupportedLayout,

    #[error("unsupported machine type {0}")]
    UnsupportedMachine(u16),

    #[error("object error: {0}")]
    Object(#[from] ObjectError),
}

/// String table builder (offset 0 is the empty string).
struct StringTable {
    data: Vec<u8>,
}

impl StringTable {
    fn new() -> Self {
        Self { data: vec![0] }
    }

    fn add(&mut self, s: &str) -> u32 {
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        offset
    }
}

struct ShdrEntry {
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
}

fn section_sh_flags(section: &Section) -> u64 {
    let mut flags = 0;
    if section.flags.alloc {
        flags |= SHF_ALLOC;
    }
    if section.flags.exec {
        flags |= SHF_EXECINSTR;
    }
    if section.flags.write {
        flags |= SHF_WRITE;
    }
    flags
}

fn symbol_st_type(object: &Object, symbol: &SymbolRecord) -> u8 {
    match symbol.section.map(|s| object.sections[s].kind) {
        Some(SectionKind::Text) => STT_FUNC,
        Some(SectionKind::Data) | Some(SectionKind::Bss) => STT_OBJECT,
        _ => STT_NOTYPE,
    }
}

/// Serialize an object as an ELF64 relocatable file.
pub fn write_relocatable(object: &Object) -> Vec<u8> {
    let machine = match object.arch {
        Arch::X64 => EM_X86_64,
        Arch::Arm64 => EM_AARCH64,
    };

    let mut shstrtab = StringTable::new();
    let mut strtab = StringTable::new();
    let mut shdrs: Vec<ShdrEntry> = Vec::new();

    // Null section header
    shdrs.push(ShdrEntry {
        name: 0,
        sh_type: 0,
        flags: 0,
        addr: 0,
        offset: 0,
        size: 0,
        link: 0,
        info: 0,
        align: 0,
        entsize: 0,
    });

    let mut w = ByteWriter::with_capacity(4096);
    // Header is patched in at the end; reserve its bytes now.
    w.emit_bytes(&[0u8; EHDR_SIZE]);

    // Object sections: shndx = object index + 1
    for section in &object.sections {
        let name = shstrtab.add(&section.name);
        let (sh_type, offset, size) = if section.is_bss() {
            (SHT_NOBITS, w.offset() as u64, section.size)
        } else {
            w.align_to(section.align.max(1) as usize);
            let offset = w.offset() as u64;
            w.emit_bytes(&section.data);
            (SHT_PROGBITS, offset, section.size)
        };
        shdrs.push(ShdrEntry {
            name,
            sh_type,
            flags: section_sh_flags(section),
            addr: 0,
            offset,
            size,
            link: 0,
            info: 0,
            align: section.align.max(1) as u64,
            entsize: 0,
        });
    }

    // Symbol table: null entry, then locals, then globals.
    // `order[i]` is the symtab slot for object symbol i.
    let mut order = vec![0u32; object.symbols.len()];
    let mut slot = 1u32;
    for (i, sym) in object.symbols.iter().enumerate() {
        if sym.binding == SymbolBinding::Local {
            order[i] = slot;
            slot += 1;
        }
    }
    let first_global = slot;
    for (i, sym) in object.symbols.iter().enumerate() {
        if sym.binding != SymbolBinding::Local {
            order[i] = slot;
            slot += 1;
        }
    }

    let mut symtab = ByteWriter::with_capacity((slot as usize) * SYM_SIZE);
    symtab.emit_bytes(&[0u8; SYM_SIZE]);
    let mut emit_sym = |object: &Object, sym: &SymbolRecord, strtab: &mut StringTable| {
        let bind = match sym.binding {
            SymbolBinding::Local => STB_LOCAL,
            SymbolBinding::Weak => STB_WEAK,
            SymbolBinding::Global | SymbolBinding::External => STB_GLOBAL,
        };
        symtab.emit_u32(strtab.add(&sym.name));
        symtab.emit_u8(bind << 4 | symbol_st_type(object, sym));
        symtab.emit_u8(0); // st_other
        symtab.emit_u16(sym.section.map_or(0, |s| s as u16 + 1));
        symtab.emit_u64(sym.value);
        symtab.emit_u64(0); // st_size
    };
    for sym in object.symbols.iter().filter(|s| s.binding == SymbolBinding::Local) {
        emit_sym(object, sym, &mut strtab);
    }
    for sym in object.symbols.iter().filter(|s| s.binding != SymbolBinding::Local) {
        emit_sym(object, sym, &mut strtab);
    }

    let symtab_shndx = shdrs.len();
    let strtab_shndx = symtab_shndx + 1;

    w.align_to(8);
    let symtab_offset = w.offset() as u64;
    let symtab_bytes = symtab.into_bytes();
    let symtab_size = symtab_bytes.len() as u64;
    w.emit_bytes(&symtab_bytes);
    shdrs.push(ShdrEntry {
        name: shstrtab.add(".symtab"),
        sh_type: SHT_SYMTAB,
        flags: 0,
        addr: 0,
        offset: symtab_offset,
        size: symtab_size,
        link: strtab_shndx as u32,
        info: first_global,
        align: 8,
        entsize: SYM_SIZE as u64,
    });

    let strtab_offset = w.offset() as u64;
    w.emit_bytes(&strtab.data);
    shdrs.push(ShdrEntry {
        name: shstrtab.add(".strtab"),
        sh_type: SHT_STRTAB,
        flags: 0,
        addr: 0,
        offset: strtab_offset,
        size: strtab.data.len() as u64,
        link: 0,
        info: 0,
        align: 1,
        entsize: 0,
    });

    // One .rela.<name> per section with relocations
    for (sect_idx, section) in object.sections.iter().enumerate() {
        let relocs: Vec<&Relocation> = object
            .relocs
            .iter()
            .filter(|r| r.section == sect_idx)
            .collect();
        if relocs.is_empty() {
            continue;
        }
        w.align_to(8);
        let offset = w.offset() as u64;
        for reloc in &relocs {
            w.emit_u64(reloc.offset);
            let info =
                ((order[reloc.symbol] as u64) << 32) | reloc.kind.to_raw(object.arch) as u64;
            w.emit_u64(info);
            w.emit_i64(reloc.addend);
        }
        shdrs.push(ShdrEntry {
            name: shstrtab.add(&format!(".rela{}", section.name)),
            sh_type: SHT_RELA,
            flags: 0,
            addr: 0,
            offset,
            size: (relocs.len() * RELA_SIZE) as u64,
            link: symtab_shndx as u32,
            info: sect_idx as u32 + 1,
            align: 8,
            entsize: RELA_SIZE as u64,
        });
    }

    // .shstrtab goes last so its own name lands in it
    let shstrtab_name = shstrtab.add(".shstrtab");
    let shstrtab_shndx = shdrs.len();
    let shstrtab_offset = w.offset() as u64;
    w.emit_bytes(&shstrtab.data);
    shdrs.push(ShdrEntry {
        name: shstrtab_name,
        sh_type: SHT_STRTAB,
        flags: 0,
        addr: 0,
        offset: shstrtab_offset,
        size: shstrtab.data.len() as u64,
        link: 0,
        info: 0,
        align: 1,
        entsize: 0,
    });

    w.align_to(8);
    let shoff = w.offset() as u64;
    for shdr in &shdrs {
        w.emit_u32(shdr.name);
        w.emit_u32(shdr.sh_type);
        w.emit_u64(shdr.flags);
        w.emit_u64(shdr.addr);
        w.emit_u64(shdr.offset);
        w.emit_u64(shdr.size);
        w.emit_u32(shdr.link);
        w.emit_u32(shdr.info);
        w.emit_u64(shdr.align);
        w.emit_u64(shdr.entsize);
    }

    let mut bytes = w.into_bytes();
    let mut ehdr = ByteWriter::with_capacity(EHDR_SIZE);
    ehdr.emit_bytes(&ELF_MAGIC);
    ehdr.emit_u8(ELFCLASS64);
    ehdr.emit_u8(ELFDATA2LSB);
    ehdr.emit_u8(EV_CURRENT);
    ehdr.emit_bytes(&[0u8; 9]); // OS/ABI, padding
    ehdr.emit_u16(ET_REL);
    ehdr.emit_u16(machine);
    ehdr.emit_u32(EV_CURRENT as u32);
    ehdr.emit_u64(0); // e_entry
    ehdr.emit_u64(0); // e_phoff
    ehdr.emit_u64(shoff);
    ehdr.emit_u32(0); // e_flags
    ehdr.emit_u16(EHDR_SIZE as u16);
    ehdr.emit_u16(0); // e_phentsize
    ehdr.emit_u16(0); // e_phnum
    ehdr.emit_u16(SHDR_SIZE as u16);
    ehdr.emit_u16(shdrs.len() as u16);
    ehdr.emit_u16(shstrtab_shndx as u16);
    bytes[..EHDR_SIZE].copy_from_slice(&ehdr.into_bytes());
    bytes
}

struct RawShdr {
    name: u32,
    sh_type: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
}

fn read_shdr(r: &mut ByteReader) -> Result<RawShdr, DecodeError> {
    let name = r.read_u32()?;
    let sh_type = r.read_u32()?;
    let flags = r.read_u64()?;
    let _addr = r.read_u64()?;
    let offset = r.read_u64()?;
    let size = r.read_u64()?;
    let link = r.read_u32()?;
    let info = r.read_u32()?;
    let align = r.read_u64()?;
    let entsize = r.read_u64()?;
    Ok(RawShdr {
        name,
        sh_type,
        flags,
        offset,
        size,
        link,
        info,
        align,
        entsize,
    })
}

fn strtab_lookup(table: &[u8], offset: u32) -> String {
    let start = offset as usize;
    if start >= table.len() {
        return String::new();
    }
    let end = table[start..]
        .iter()
        .position(|&b| b == 0)
        .map_or(table.len(), |p| start + p);
    String::from_utf8_lossy(&table[start..end]).into_owned()
}

/// Parse an ELF64 relocatable file into the object model.
pub fn read_relocatable(data: &[u8]) -> Result<Object, ElfError> {
    let mut r = ByteReader::new(data);
    if r.read_bytes(4)? != ELF_MAGIC {
        return Err(ElfError::InvalidMagic);
    }
    if r.read_u8()? != ELFCLASS64 || r.read_u8()? != ELFDATA2LSB {
        return Err(ElfError::UnsupportedLayout);
    }
    r.seek(16)?;
    let e_type = r.read_u16()?;
    if e_type != ET_REL {
        return Err(ElfError::UnsupportedLayout);
    }
    let machine = r.read_u16()?;
    let arch = match machine {
        EM_X86_64 => Arch::X64,
        EM_AARCH64 => Arch::Arm64,
        other => return Err(ElfError::UnsupportedMachine(other)),
    };
    r.seek(40)?;
    let shoff = r.read_u64()? as usize;
    r.seek(58)?;
    let shentsize = r.read_u16()? as usize;
    let shnum = r.read_u16()? as usize;
    let shstrndx = r.read_u16()? as usize;

    let mut shdrs = Vec::with_capacity(shnum);
    for i in 0..shnum {
        r.seek(shoff + i * shentsize)?;
        shdrs.push(read_shdr(&mut r)?);
    }

    let shstr = &shdrs[shstrndx];
    r.seek(shstr.offset as usize)?;
    let shstrtab = r.read_bytes(shstr.size as usize)?.to_vec();

    let mut object = Object::new(arch);
    // shndx -> object section index
    let mut section_map = vec![None; shnum];

    for (i, shdr) in shdrs.iter().enumerate() {
        let allocated = shdr.flags & SHF_ALLOC != 0;
        if !(allocated && (shdr.sh_type == SHT_PROGBITS || shdr.sh_type == SHT_NOBITS)) {
            continue;
        }
        let name = strtab_lookup(&shstrtab, shdr.name);
        let kind = if shdr.sh_type == SHT_NOBITS {
            SectionKind::Bss
        } else if shdr.flags & SHF_EXECINSTR != 0 {
            SectionKind::Text
        } else {
            SectionKind::Data
        };
        let data = if kind == SectionKind::Bss {
            Vec::new()
        } else {
            r.seek(shdr.offset as usize)?;
            r.read_bytes(shdr.size as usize)?.to_vec()
        };
        let mut flags = SectionFlags::for_kind(kind);
        flags.write = shdr.flags & SHF_WRITE != 0;
        object.sections.push(Section {
            name,
            kind,
            flags,
            align: shdr.align.max(1) as u32,
            data,
            size: shdr.size,
        });
        section_map[i] = Some(object.sections.len() - 1);
    }

    // Symbols: symtab index -> object symbol index
    let mut symbol_map: Vec<Option<usize>> = Vec::new();
    for shdr in shdrs.iter().filter(|s| s.sh_type == SHT_SYMTAB) {
        let strhdr = &shdrs[shdr.link as usize];
        r.seek(strhdr.offset as usize)?;
        let strtab = r.read_bytes(strhdr.size as usize)?.to_vec();

        let count = (shdr.size / shdr.entsize.max(1)) as usize;
        symbol_map = vec![None; count];
        for j in 1..count {
            r.seek((shdr.offset + j as u64 * shdr.entsize) as usize)?;
            let name_off = r.read_u32()?;
            let st_info = r.read_u8()?;
            let _other = r.read_u8()?;
            let shndx = r.read_u16()? as usize;
            let value = r.read_u64()?;
            let _size = r.read_u64()?;

            let bind = st_info >> 4;
            let st_type = st_info & 0xF;
            let section = if shndx > 0 && shndx < shnum {
                section_map[shndx]
            } else {
                None
            };

            let name = if st_type == STT_SECTION {
                match section {
                    Some(s) => object.sections[s].name.clone(),
                    None => continue,
                }
            } else {
                strtab_lookup(&strtab, name_off)
            };
            if name.is_empty() {
                continue;
            }

            let binding = match bind {
                STB_WEAK => SymbolBinding::Weak,
                STB_GLOBAL if section.is_none() => SymbolBinding::External,
                STB_GLOBAL => SymbolBinding::Global,
                _ => SymbolBinding::Local,
            };
            object.symbols.push(SymbolRecord {
                name,
                section,
                value,
                binding,
                defined: section.is_some(),
            });
            symbol_map[j] = Some(object.symbols.len() - 1);
        }
    }

    for (i, shdr) in shdrs.iter().enumerate() {
        if shdrs[i].sh_type != SHT_RELA {
            continue;
        }
        let Some(target) = section_map.get(shdr.info as usize).copied().flatten() else {
            continue;
        };
        let count = (shdr.size / shdr.entsize.max(1)) as usize;
        for j in 0..count {
            r.seek((shdr.offset + j as u64 * shdr.entsize) as usize)?;
            let offset = r.read_u64()?;
            let info = r.read_u64()?;
            let addend = r.read_i64()?;
            let sym_idx = (info >> 32) as usize;
            let kind = RelocKind::from_raw(arch, info as u32)?;
            let Some(&Some(symbol)) = symbol_map.get(sym_idx) else {
                continue;
            };
            object.relocs.push(Relocation {
                section: target,
                offset,
                symbol,
                kind,
                addend,
            });
        }
    }

    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_object() -> Object {
        let mut obj = Object::new(Arch::X64);
        let text = obj.add_section(".text", SectionKind::Text, 16);
        obj.sections[text].data = vec![0xE8, 0, 0, 0, 0, 0xC3];
        obj.sections[text].size = 6;
        let data = obj.add_section(".data", SectionKind::Data, 8);
        obj.sections[data].data = vec![1, 0, 0, 0, 0, 0, 0, 0];
        obj.sections[data].size = 8;
        obj.add_symbol("main", Some(text), 0, SymbolBinding::Global);
        let callee = obj.add_symbol("helper", None, 0, SymbolBinding::External);
        let local = obj.add_symbol("L1", Some(text), 5, SymbolBinding::Local);
        obj.relocs.push(Relocation {
            section: text,
            offset: 1,
            symbol: callee,
            kind: RelocKind::Pc32,
            addend: -4,
        });
        obj.relocs.push(Relocation {
            section: data,
            offset: 0,
            symbol: local,
            kind: RelocKind::Abs64,
            addend: 0,
        });
        obj
    }

    #[test]
    fn test_header_shape() {
        let bytes = write_relocatable(&sample_object());
        assert_eq!(&bytes[..4], &ELF_MAGIC);
        assert_eq!(bytes[4], ELFCLASS64);
        assert_eq!(u16::from_le_bytes([bytes[16], bytes[17]]), ET_REL);
        assert_eq!(u16::from_le_bytes([bytes[18], bytes[19]]), EM_X86_64);
    }

    #[test]
    fn test_roundtrip() {
        let obj = sample_object();
        let bytes = write_relocatable(&obj);
        let back = read_relocatable(&bytes).unwrap();

        assert_eq!(back.arch, Arch::X64);
        assert_eq!(back.find_section(".text").map(|i| &back.sections[i].data[..]),
                   Some(&obj.sections[0].data[..]));
        assert!(back.find_symbol("main").is_some());
        assert!(back.find_symbol("helper").is_some());
        let helper = &back.symbols[back.find_symbol("helper").unwrap()];
        assert!(!helper.defined);
        assert_eq!(helper.binding, SymbolBinding::External);

        assert_eq!(back.relocs.len(), 2);
        let call = back
            .relocs
            .iter()
            .find(|r| r.kind == RelocKind::Pc32)
            .unwrap();
        assert_eq!(call.offset, 1);
        assert_eq!(call.addend, -4);
        assert_eq!(back.symbols[call.symbol].name, "helper");

        back.validate().unwrap();
    }

    #[test]
    fn test_arm64_machine_tag() {
        let mut obj = Object::new(Arch::Arm64);
        let text = obj.add_section(".text", SectionKind::Text, 4);
        obj.sections[text].data = vec![0xC0, 0x03, 0x5F, 0xD6];
        obj.sections[text].size = 4;
        let bytes = write_relocatable(&obj);
        assert_eq!(u16::from_le_bytes([bytes[18], bytes[19]]), EM_AARCH64);
        let back = read_relocatable(&bytes).unwrap();
        assert_eq!(back.arch, Arch::Arm64);
    }

    #[test]
    fn test_reject_garbage() {
        assert!(matches!(
            read_relocatable(b"not an elf file at all"),
            Err(ElfError::InvalidMagic)
        ));
    }
}
