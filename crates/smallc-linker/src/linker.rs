//! Section merging, layout, symbol resolution and relocation.

use crate::error::{LinkError, LinkResult};
use crate::{elf_exec, pe, BASE_ADDR, IMAGE_BASE, PAGE_SIZE, SECTION_ALIGN};
use rustc_hash::FxHashMap;
use smallc_object::{Arch, Object, RelocKind, SectionFlags, SectionKind, SymbolBinding};

/// Output executable container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Elf,
    Pe,
}

impl OutputFormat {
    pub fn image_base(self) -> u64 {
        match self {
            OutputFormat::Elf => BASE_ADDR,
            OutputFormat::Pe => IMAGE_BASE,
        }
    }
}

/// A merged output section
#[derive(Debug)]
pub struct OutSection {
    pub name: String,
    pub kind: SectionKind,
    pub flags: SectionFlags,
    pub data: Vec<u8>,
    pub size: u64,
    pub vaddr: u64,
}

/// A resolved output symbol
#[derive(Debug)]
pub struct OutSymbol {
    pub name: String,
    pub section: Option<usize>,
    pub value: u64,
    pub binding: SymbolBinding,
    pub defined: bool,
}

#[derive(Debug)]
struct OutReloc {
    section: usize,
    offset: u64,
    symbol: usize,
    kind: RelocKind,
    addend: i64,
}

/// The final image plus the facts tests and drivers want to check.
#[derive(Debug)]
pub struct LinkedImage {
    pub bytes: Vec<u8>,
    pub entry: u64,
    /// (name, vaddr, size) per output section in layout order
    pub sections: Vec<(String, u64, u64)>,
}

impl LinkedImage {
    /// Virtual address of a section by name
    pub fn section_vaddr(&self, name: &str) -> Option<u64> {
        self.sections
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|&(_, vaddr, _)| vaddr)
    }
}

/// Linker state: built up by [`Linker::add_object`], consumed by
/// [`Linker::link`].
pub struct Linker {
    arch: Option<Arch>,
    pub(crate) sections: Vec<OutSection>,
    pub(crate) symbols: Vec<OutSymbol>,
    globals: FxHashMap<String, usize>,
    relocs: Vec<OutReloc>,
}

impl Linker {
    pub fn new() -> Self {
        Self {
            arch: None,
            sections: Vec::new(),
            symbols: Vec::new(),
            globals: FxHashMap::default(),
            relocs: Vec::new(),
        }
    }

    pub fn arch(&self) -> Option<Arch> {
        self.arch
    }

    /// Merge one object: concatenate alloc sections, fold symbols, rewrite
    /// relocations into output coordinates.
    pub fn add_object(&mut self, object: &Object, file: &str) -> LinkResult<()> {
        match self.arch {
            None => self.arch = Some(object.arch),
            Some(arch) if arch != object.arch => {
                return Err(LinkError::ArchMismatch {
                    file: file.to_owned(),
                })
            }
            Some(_) => {}
        }

        // Where each input section landed: (output section, base offset)
        let mut section_map: Vec<Option<(usize, u64)>> = vec![None; object.sections.len()];
        for (i, section) in object.sections.iter().enumerate() {
            if !section.flags.alloc {
                continue;
            }
            let out_idx = self.find_or_add_section(section);
            let out = &mut self.sections[out_idx];
            // Pad between contributions
            let align = SECTION_ALIGN.max(section.align as u64);
            let base = (out.size + align - 1) & !(align - 1);
            if out.kind != SectionKind::Bss {
                out.data.resize(base as usize, 0);
                out.data.extend_from_slice(&section.data);
            }
            out.size = base + section.size;
            section_map[i] = Some((out_idx, base));
        }

        // Symbols: globals fold by name, locals stay per-object
        let mut symbol_map: Vec<usize> = Vec::with_capacity(object.symbols.len());
        for symbol in &object.symbols {
            let (section, value) = match symbol.section.and_then(|s| section_map[s]) {
                Some((out_idx, base)) => (Some(out_idx), base + symbol.value),
                None => (None, symbol.value),
            };
            let defined = symbol.defined && section.is_some();

            let out_idx = if symbol.binding == SymbolBinding::Local {
                self.symbols.push(OutSymbol {
                    name: symbol.name.clone(),
                    section,
                    value,
                    binding: SymbolBinding::Local,
                    defined,
                });
                self.symbols.len() - 1
            } else {
                match self.globals.get(&symbol.name).copied() {
                    Some(existing) => {
                        let slot = &mut self.symbols[existing];
                        if defined {
                            if slot.defined
                                && slot.binding != SymbolBinding::Weak
                                && symbol.binding != SymbolBinding::Weak
                            {
                                return Err(LinkError::DuplicateSymbol {
                                    name: symbol.name.clone(),
                                });
                            }
                            if !slot.defined || slot.binding == SymbolBinding::Weak {
                                slot.section = section;
                                slot.value = value;
                                slot.defined = true;
                                slot.binding = symbol.binding;
                            }
                        } else if symbol.binding == SymbolBinding::Weak && !slot.defined {
                            slot.binding = SymbolBinding::Weak;
                        }
                        existing
                    }
                    None => {
                        self.symbols.push(OutSymbol {
                            name: symbol.name.clone(),
                            section,
                            value,
                            binding: symbol.binding,
                            defined,
                        });
                        let idx = self.symbols.len() - 1;
                        self.globals.insert(symbol.name.clone(), idx);
                        idx
                    }
                }
            };
            symbol_map.push(out_idx);
        }

        for reloc in &object.relocs {
            let Some((out_section, base)) = section_map[reloc.section] else {
                continue;
            };
            self.relocs.push(OutReloc {
                section: out_section,
                offset: base + reloc.offset,
                symbol: symbol_map[reloc.symbol],
                kind: reloc.kind,
                addend: reloc.addend,
            });
        }
        Ok(())
    }

    fn find_or_add_section(&mut self, section: &smallc_object::Section) -> usize {
        if let Some(idx) = self.sections.iter().position(|s| s.name == section.name) {
            return idx;
        }
        self.sections.push(OutSection {
            name: section.name.clone(),
            kind: section.kind,
            flags: section.flags,
            data: Vec::new(),
            size: 0,
            vaddr: 0,
        });
        self.sections.len() - 1
    }

    /// Assign virtual addresses: code first at base + one page, then data on
    /// the next page boundary, then bss. First-seen order within each class.
    fn layout(&mut self, base: u64) {
        let mut vaddr = base + PAGE_SIZE;
        for section in self.sections.iter_mut().filter(|s| s.flags.exec) {
            section.vaddr = vaddr;
            vaddr = (vaddr + section.size + SECTION_ALIGN - 1) & !(SECTION_ALIGN - 1);
        }
        vaddr = (vaddr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        for section in self
            .sections
            .iter_mut()
            .filter(|s| !s.flags.exec && s.kind != SectionKind::Bss)
        {
            section.vaddr = vaddr;
            vaddr = (vaddr + section.size + SECTION_ALIGN - 1) & !(SECTION_ALIGN - 1);
        }
        for section in self.sections.iter_mut().filter(|s| s.kind == SectionKind::Bss) {
            section.vaddr = vaddr;
            vaddr = (vaddr + section.size + SECTION_ALIGN - 1) & !(SECTION_ALIGN - 1);
        }
    }

    /// Every relocated symbol must be defined somewhere, weak ones excepted.
    fn resolve(&self) -> LinkResult<()> {
        let mut missing: Vec<String> = Vec::new();
        for reloc in &self.relocs {
            let symbol = &self.symbols[reloc.symbol];
            if !symbol.defined && symbol.binding != SymbolBinding::Weak {
                if !missing.contains(&symbol.name) {
                    missing.push(symbol.name.clone());
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(LinkError::UndefinedSymbols { names: missing })
        }
    }

    fn relocate(&mut self) -> LinkResult<()> {
        for reloc in &self.relocs {
            let symbol = &self.symbols[reloc.symbol];
            // Undefined weak symbols resolve to zero
            let s = match symbol.section {
                Some(section) => self.sections[section].vaddr + symbol.value,
                None => 0,
            };
            let p = self.sections[reloc.section].vaddr + reloc.offset;
            let a = reloc.addend;
            let value = s.wrapping_add_signed(a);

            let out_of_range = || LinkError::RelocOutOfRange {
                symbol: symbol.name.clone(),
            };
            let section = &mut self.sections[reloc.section];
            let at = reloc.offset as usize;

            match reloc.kind {
                RelocKind::Abs64 => {
                    section.data[at..at + 8].copy_from_slice(&value.to_le_bytes());
                }
                RelocKind::Abs32 => {
                    let narrow = u32::try_from(value).map_err(|_| out_of_range())?;
                    section.data[at..at + 4].copy_from_slice(&narrow.to_le_bytes());
                }
                RelocKind::Abs32S => {
                    let narrow = i32::try_from(value as i64).map_err(|_| out_of_range())?;
                    section.data[at..at + 4].copy_from_slice(&narrow.to_le_bytes());
                }
                RelocKind::Pc32 => {
                    let rel = (value as i64).wrapping_sub(p as i64);
                    let narrow = i32::try_from(rel).map_err(|_| out_of_range())?;
                    section.data[at..at + 4].copy_from_slice(&narrow.to_le_bytes());
                }
                RelocKind::Call26 | RelocKind::Jump26 => {
                    let rel = (value as i64).wrapping_sub(p as i64);
                    if rel % 4 != 0 || !(-(1 << 27)..(1 << 27)).contains(&rel) {
                        return Err(out_of_range());
                    }
                    let word = read_u32(&section.data, at);
                    let patched = (word & 0xFC00_0000) | (((rel >> 2) as u32) & 0x03FF_FFFF);
                    section.data[at..at + 4].copy_from_slice(&patched.to_le_bytes());
                }
                RelocKind::AdrPrelPgHi21 => {
                    // Page delta on 4 KiB boundaries
                    let page = (value & !0xFFF) as i64 - (p & !0xFFF) as i64;
                    if !(-(1i64 << 32)..(1i64 << 32)).contains(&page) {
                        return Err(out_of_range());
                    }
                    let imm = (page >> 12) as u32;
                    let immlo = imm & 0x3;
                    let immhi = (imm >> 2) & 0x7_FFFF;
                    let word = read_u32(&section.data, at);
                    let patched = (word & 0x9F00_001F) | (immlo << 29) | (immhi << 5);
                    section.data[at..at + 4].copy_from_slice(&patched.to_le_bytes());
                }
                RelocKind::AddAbsLo12Nc => {
                    let imm = (value & 0xFFF) as u32;
                    let word = read_u32(&section.data, at);
                    let patched = (word & 0xFFC0_03FF) | (imm << 10);
                    section.data[at..at + 4].copy_from_slice(&patched.to_le_bytes());
                }
                RelocKind::Ldst64AbsLo12Nc => {
                    // 8-byte-scaled immediate: bits [11:3] of the address
                    let imm = ((value & 0xFFF) >> 3) as u32;
                    let word = read_u32(&section.data, at);
                    let patched = (word & 0xFFC0_03FF) | (imm << 10);
                    section.data[at..at + 4].copy_from_slice(&patched.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    /// Entry point: `_start`, else `main` (PE prefers `mainCRTStartup`).
    fn entry_point(&self, format: OutputFormat) -> LinkResult<u64> {
        let candidates: &[&str] = match format {
            OutputFormat::Elf => &["_start", "main"],
            OutputFormat::Pe => &["mainCRTStartup", "_start", "main"],
        };
        for name in candidates {
            if let Some(&idx) = self.globals.get(*name) {
                let symbol = &self.symbols[idx];
                if let (true, Some(section)) = (symbol.defined, symbol.section) {
                    return Ok(self.sections[section].vaddr + symbol.value);
                }
            }
        }
        Err(LinkError::NoEntryPoint)
    }

    /// Run layout, resolution and relocation, then serialize the executable.
    pub fn link(mut self, format: OutputFormat) -> LinkResult<LinkedImage> {
        if self.sections.is_empty() {
            return Err(LinkError::NoInput);
        }
        self.layout(format.image_base());
        self.resolve()?;
        self.relocate()?;
        let entry = self.entry_point(format)?;

        let section_info: Vec<(String, u64, u64)> = self
            .sections
            .iter()
            .map(|s| (s.name.clone(), s.vaddr, s.size))
            .collect();

        let bytes = match format {
            OutputFormat::Elf => elf_exec::write(&self, entry),
            OutputFormat::Pe => pe::write(&self, entry),
        };

        Ok(LinkedImage {
            bytes,
            entry,
            sections: section_info,
        })
    }
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallc_object::{Object, Relocation, SymbolRecord};

    fn object_with_call(arch: Arch, callee: &str) -> Object {
        let mut obj = Object::new(arch);
        let text = obj.add_section(".text", SectionKind::Text, 16);
        match arch {
            Arch::X64 => {
                obj.sections[text].data = vec![0xE8, 0, 0, 0, 0, 0xC3];
                obj.sections[text].size = 6;
            }
            Arch::Arm64 => {
                obj.sections[text].data = vec![0, 0, 0, 0x94, 0xC0, 0x03, 0x5F, 0xD6];
                obj.sections[text].size = 8;
            }
        }
        obj.add_symbol("main", Some(text), 0, SymbolBinding::Global);
        let callee_idx = obj.add_symbol(callee, None, 0, SymbolBinding::External);
        let kind = match arch {
            Arch::X64 => RelocKind::Pc32,
            Arch::Arm64 => RelocKind::Call26,
        };
        obj.relocs.push(Relocation {
            section: text,
            offset: match arch {
                Arch::X64 => 1,
                Arch::Arm64 => 0,
            },
            symbol: callee_idx,
            kind,
            addend: match arch {
                Arch::X64 => -4,
                Arch::Arm64 => 0,
            },
        });
        obj
    }

    fn object_with_function(arch: Arch, name: &str) -> Object {
        let mut obj = Object::new(arch);
        let text = obj.add_section(".text", SectionKind::Text, 16);
        obj.sections[text].data = match arch {
            Arch::X64 => vec![0xC3],
            Arch::Arm64 => vec![0xC0, 0x03, 0x5F, 0xD6],
        };
        obj.sections[text].size = obj.sections[text].data.len() as u64;
        obj.add_symbol(name, Some(text), 0, SymbolBinding::Global);
        obj
    }

    #[test]
    fn test_two_object_call_resolution() {
        let mut linker = Linker::new();
        linker
            .add_object(&object_with_call(Arch::X64, "helper"), "a.o")
            .unwrap();
        linker
            .add_object(&object_with_function(Arch::X64, "helper"), "b.o")
            .unwrap();
        let image = linker.link(OutputFormat::Elf).unwrap();

        let text_vaddr = image.section_vaddr(".text").unwrap();
        assert_eq!(text_vaddr, BASE_ADDR + PAGE_SIZE);

        // helper lands at .text + 16 (second contribution is aligned)
        // call displacement: S - P - 4 with the field at text+1
        let file_off = (text_vaddr - BASE_ADDR) as usize + 1;
        let disp = i32::from_le_bytes([
            image.bytes[file_off],
            image.bytes[file_off + 1],
            image.bytes[file_off + 2],
            image.bytes[file_off + 3],
        ]);
        assert_eq!(disp, 16 - 1 - 4);
    }

    #[test]
    fn test_undefined_symbol_fails() {
        let mut linker = Linker::new();
        linker
            .add_object(&object_with_call(Arch::X64, "nowhere"), "a.o")
            .unwrap();
        let err = linker.link(OutputFormat::Elf).unwrap_err();
        match err {
            LinkError::UndefinedSymbols { names } => assert_eq!(names, ["nowhere"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_undefined_weak_symbol_allowed() {
        let mut obj = object_with_call(Arch::X64, "optional");
        let idx = obj.find_symbol("optional").unwrap();
        obj.symbols[idx].binding = SymbolBinding::Weak;
        let mut linker = Linker::new();
        linker.add_object(&obj, "a.o").unwrap();
        // Resolves to zero instead of failing
        linker.link(OutputFormat::Elf).unwrap();
    }

    #[test]
    fn test_duplicate_strong_symbol_fails() {
        let mut linker = Linker::new();
        linker
            .add_object(&object_with_function(Arch::X64, "main"), "a.o")
            .unwrap();
        let err = linker
            .add_object(&object_with_function(Arch::X64, "main"), "b.o")
            .unwrap_err();
        assert!(matches!(err, LinkError::DuplicateSymbol { .. }));
    }

    #[test]
    fn test_arch_mismatch_rejected() {
        let mut linker = Linker::new();
        linker
            .add_object(&object_with_function(Arch::X64, "main"), "a.o")
            .unwrap();
        let err = linker
            .add_object(&object_with_function(Arch::Arm64, "other"), "b.o")
            .unwrap_err();
        assert!(matches!(err, LinkError::ArchMismatch { .. }));
    }

    #[test]
    fn test_layout_order_code_data_bss() {
        let mut obj = object_with_function(Arch::X64, "main");
        let data = obj.add_section(".data", SectionKind::Data, 8);
        obj.sections[data].data = vec![1, 2, 3, 4, 5, 6, 7, 8];
        obj.sections[data].size = 8;
        let bss = obj.add_section(".bss", SectionKind::Bss, 8);
        obj.sections[bss].size = 32;

        let mut linker = Linker::new();
        linker.add_object(&obj, "a.o").unwrap();
        let image = linker.link(OutputFormat::Elf).unwrap();

        let text = image.section_vaddr(".text").unwrap();
        let data = image.section_vaddr(".data").unwrap();
        let bss = image.section_vaddr(".bss").unwrap();
        assert_eq!(text, BASE_ADDR + PAGE_SIZE);
        assert_eq!(data % PAGE_SIZE, 0);
        assert!(data > text);
        assert!(bss >= data + 8);
    }

    #[test]
    fn test_arm64_call26_patch() {
        let mut linker = Linker::new();
        linker
            .add_object(&object_with_call(Arch::Arm64, "helper"), "a.o")
            .unwrap();
        linker
            .add_object(&object_with_function(Arch::Arm64, "helper"), "b.o")
            .unwrap();
        let image = linker.link(OutputFormat::Elf).unwrap();

        let text_vaddr = image.section_vaddr(".text").unwrap();
        let file_off = (text_vaddr - BASE_ADDR) as usize;
        let word = u32::from_le_bytes([
            image.bytes[file_off],
            image.bytes[file_off + 1],
            image.bytes[file_off + 2],
            image.bytes[file_off + 3],
        ]);
        // bl helper at offset 0; helper at 16: imm26 = 16 >> 2 = 4
        assert_eq!(word, 0x9400_0004);
    }

    #[test]
    fn test_reloc_readback_matches_formula() {
        // Abs64 against a data symbol: the patched slot equals S + A
        let mut obj = Object::new(Arch::X64);
        let text = obj.add_section(".text", SectionKind::Text, 16);
        obj.sections[text].data = vec![0xC3];
        obj.sections[text].size = 1;
        obj.add_symbol("main", Some(text), 0, SymbolBinding::Global);
        let data = obj.add_section(".data", SectionKind::Data, 8);
        obj.sections[data].data = vec![0; 16];
        obj.sections[data].size = 16;
        let target = obj.add_symbol("value", Some(data), 8, SymbolBinding::Global);
        obj.relocs.push(Relocation {
            section: data,
            offset: 0,
            symbol: target,
            kind: RelocKind::Abs64,
            addend: 4,
        });

        let mut linker = Linker::new();
        linker.add_object(&obj, "a.o").unwrap();
        let image = linker.link(OutputFormat::Elf).unwrap();

        let data_vaddr = image.section_vaddr(".data").unwrap();
        let file_off = (data_vaddr - BASE_ADDR) as usize;
        let slot = u64::from_le_bytes(image.bytes[file_off..file_off + 8].try_into().unwrap());
        assert_eq!(slot, data_vaddr + 8 + 4);
    }
}
