//! In-memory relocatable object model shared by the assembler and linker.

use thiserror::Error;

/// Errors raised when constructing or validating an object
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("relocation targets missing section index {0}")]
    BadRelocSection(usize),

    #[error("relocation references missing symbol index {0}")]
    BadRelocSymbol(usize),

    #[error("relocation at {section}+{offset:#x} extends past section end ({size:#x})")]
    RelocOutOfRange {
        section: String,
        offset: u64,
        size: u64,
    },

    #[error("symbol {0} defined in missing section index {1}")]
    BadSymbolSection(String, usize),

    #[error("unknown relocation kind {0} for {1}")]
    UnknownRelocKind(u32, &'static str),
}

/// Target architecture of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X64,
    Arm64,
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Arch::X64 => "x86-64",
            Arch::Arm64 => "aarch64",
        }
    }
}

/// Section classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Text,
    Data,
    Bss,
    Other,
}

/// Loader-visible section attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionFlags {
    pub alloc: bool,
    pub exec: bool,
    pub write: bool,
}

impl SectionFlags {
    /// Default flags for a section kind
    pub fn for_kind(kind: SectionKind) -> Self {
        match kind {
            SectionKind::Text => Self {
                alloc: true,
                exec: true,
                write: false,
            },
            SectionKind::Data | SectionKind::Bss => Self {
                alloc: true,
                exec: false,
                write: true,
            },
            SectionKind::Other => Self {
                alloc: false,
                exec: false,
                write: false,
            },
        }
    }
}

/// A named run of bytes with uniform permissions.
///
/// For bss sections `data` stays empty and `size` carries the reserved
/// length; for everything else `size == data.len()`.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub kind: SectionKind,
    pub flags: SectionFlags,
    pub align: u32,
    pub data: Vec<u8>,
    pub size: u64,
}

impl Section {
    pub fn new(name: impl Into<String>, kind: SectionKind, align: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            flags: SectionFlags::for_kind(kind),
            align,
            data: Vec::new(),
            size: 0,
        }
    }

    pub fn is_bss(&self) -> bool {
        self.kind == SectionKind::Bss
    }
}

/// Symbol binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolBinding {
    Local,
    Global,
    Weak,
    External,
}

impl SymbolBinding {
    pub fn to_raw(self) -> u32 {
        match self {
            SymbolBinding::Local => 0,
            SymbolBinding::Global => 1,
            SymbolBinding::Weak => 2,
            SymbolBinding::External => 3,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(SymbolBinding::Local),
            1 => Some(SymbolBinding::Global),
            2 => Some(SymbolBinding::Weak),
            3 => Some(SymbolBinding::External),
            _ => None,
        }
    }
}

/// A defined or external symbol
#[derive(Debug, Clone)]
pub struct SymbolRecord {
    pub name: String,
    /// Defining section index, or `None` for externals
    pub section: Option<usize>,
    /// Offset within the defining section
    pub value: u64,
    pub binding: SymbolBinding,
    pub defined: bool,
}

/// Relocation kinds understood by the toolchain.
///
/// The x86-64 PLT32/GOTPCREL and COFF REL32_1..5 families all collapse to
/// [`RelocKind::Pc32`] with an addend adjustment at ingest time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    // x86-64
    Abs64,
    Abs32,
    Abs32S,
    Pc32,
    // AArch64
    Call26,
    Jump26,
    AdrPrelPgHi21,
    AddAbsLo12Nc,
    Ldst64AbsLo12Nc,
}

// psABI relocation numbers
const R_X86_64_64: u32 = 1;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_PLT32: u32 = 4;
const R_X86_64_GOTPCREL: u32 = 9;
const R_X86_64_32: u32 = 10;
const R_X86_64_32S: u32 = 11;

const R_AARCH64_ABS64: u32 = 257;
const R_AARCH64_ABS32: u32 = 258;
const R_AARCH64_ADR_PREL_PG_HI21: u32 = 275;
const R_AARCH64_ADD_ABS_LO12_NC: u32 = 277;
const R_AARCH64_JUMP26: u32 = 282;
const R_AARCH64_CALL26: u32 = 283;
const R_AARCH64_LDST64_ABS_LO12_NC: u32 = 286;

impl RelocKind {
    /// Width in bytes of the patched field
    pub fn width(self) -> u64 {
        match self {
            RelocKind::Abs64 => 8,
            RelocKind::Abs32 | RelocKind::Abs32S | RelocKind::Pc32 => 4,
            // AArch64 kinds patch fields inside a 4-byte instruction word
            _ => 4,
        }
    }

    /// psABI numbering for the container formats
    pub fn to_raw(self, arch: Arch) -> u32 {
        match (arch, self) {
            (Arch::X64, RelocKind::Abs64) => R_X86_64_64,
            (Arch::X64, RelocKind::Abs32) => R_X86_64_32,
            (Arch::X64, RelocKind::Abs32S) => R_X86_64_32S,
            (Arch::X64, RelocKind::Pc32) => R_X86_64_PC32,
            (Arch::Arm64, RelocKind::Abs64) => R_AARCH64_ABS64,
            (Arch::Arm64, RelocKind::Abs32) => R_AARCH64_ABS32,
            (Arch::Arm64, RelocKind::Call26) => R_AARCH64_CALL26,
            (Arch::Arm64, RelocKind::Jump26) => R_AARCH64_JUMP26,
            (Arch::Arm64, RelocKind::AdrPrelPgHi21) => R_AARCH64_ADR_PREL_PG_HI21,
            (Arch::Arm64, RelocKind::AddAbsLo12Nc) => R_AARCH64_ADD_ABS_LO12_NC,
            (Arch::Arm64, RelocKind::Ldst64AbsLo12Nc) => R_AARCH64_LDST64_ABS_LO12_NC,
            // Branch kinds never appear on x64, nor Abs32S on arm64
            _ => 0,
        }
    }

    /// Map a psABI number back to a kind. PLT32 and GOTPCREL read back as
    /// plain PC32; their link-time formula is identical here (no PLT/GOT).
    pub fn from_raw(arch: Arch, raw: u32) -> Result<Self, ObjectError> {
        let kind = match (arch, raw) {
            (Arch::X64, R_X86_64_64) => RelocKind::Abs64,
            (Arch::X64, R_X86_64_32) => RelocKind::Abs32,
            (Arch::X64, R_X86_64_32S) => RelocKind::Abs32S,
            (Arch::X64, R_X86_64_PC32 | R_X86_64_PLT32 | R_X86_64_GOTPCREL) => RelocKind::Pc32,
            (Arch::Arm64, R_AARCH64_ABS64) => RelocKind::Abs64,
            (Arch::Arm64, R_AARCH64_ABS32) => RelocKind::Abs32,
            (Arch::Arm64, R_AARCH64_CALL26) => RelocKind::Call26,
            (Arch::Arm64, R_AARCH64_JUMP26) => RelocKind::Jump26,
            (Arch::Arm64, R_AARCH64_ADR_PREL_PG_HI21) => RelocKind::AdrPrelPgHi21,
            (Arch::Arm64, R_AARCH64_ADD_ABS_LO12_NC) => RelocKind::AddAbsLo12Nc,
            (Arch::Arm64, R_AARCH64_LDST64_ABS_LO12_NC) => RelocKind::Ldst64AbsLo12Nc,
            _ => return Err(ObjectError::UnknownRelocKind(raw, arch.name())),
        };
        Ok(kind)
    }
}

/// A patch request against a section
#[derive(Debug, Clone)]
pub struct Relocation {
    /// Section the patch applies to
    pub section: usize,
    /// Offset of the patched field within the section
    pub offset: u64,
    /// Index of the referenced symbol
    pub symbol: usize,
    pub kind: RelocKind,
    pub addend: i64,
}

/// A complete relocatable object
#[derive(Debug, Clone)]
pub struct Object {
    pub arch: Arch,
    pub sections: Vec<Section>,
    pub symbols: Vec<SymbolRecord>,
    pub relocs: Vec<Relocation>,
}

impl Object {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            sections: Vec::new(),
            symbols: Vec::new(),
            relocs: Vec::new(),
        }
    }

    /// Find a section by name
    pub fn find_section(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }

    /// Find an existing section or append a new one with the given kind
    pub fn add_section(&mut self, name: &str, kind: SectionKind, align: u32) -> usize {
        if let Some(idx) = self.find_section(name) {
            return idx;
        }
        self.sections.push(Section::new(name, kind, align));
        self.sections.len() - 1
    }

    /// Find a symbol by name
    pub fn find_symbol(&self, name: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s.name == name)
    }

    /// Find-or-add a symbol. A later definition overwrites an earlier
    /// external placeholder; the binding of an already-defined symbol is
    /// left alone.
    pub fn add_symbol(
        &mut self,
        name: &str,
        section: Option<usize>,
        value: u64,
        binding: SymbolBinding,
    ) -> usize {
        let idx = match self.find_symbol(name) {
            Some(idx) => idx,
            None => {
                self.symbols.push(SymbolRecord {
                    name: name.to_owned(),
                    section: None,
                    value: 0,
                    binding,
                    defined: false,
                });
                self.symbols.len() - 1
            }
        };
        if let Some(sect) = section {
            let sym = &mut self.symbols[idx];
            sym.section = Some(sect);
            sym.value = value;
            sym.defined = true;
            // A .globl marker seen first must survive the later definition
            if sym.binding == SymbolBinding::External {
                sym.binding = binding;
            }
        }
        idx
    }

    /// Check the structural invariants every consumer relies on.
    pub fn validate(&self) -> Result<(), ObjectError> {
        for sym in &self.symbols {
            if let Some(sect) = sym.section {
                if sect >= self.sections.len() {
                    return Err(ObjectError::BadSymbolSection(sym.name.clone(), sect));
                }
            }
        }
        for reloc in &self.relocs {
            let sect = self
                .sections
                .get(reloc.section)
                .ok_or(ObjectError::BadRelocSection(reloc.section))?;
            if reloc.symbol >= self.symbols.len() {
                return Err(ObjectError::BadRelocSymbol(reloc.symbol));
            }
            if reloc.offset + reloc.kind.width() > sect.size {
                return Err(ObjectError::RelocOutOfRange {
                    section: sect.name.clone(),
                    offset: reloc.offset,
                    size: sect.size,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_section_dedup() {
        let mut obj = Object::new(Arch::X64);
        let a = obj.add_section(".text", SectionKind::Text, 16);
        let b = obj.add_section(".text", SectionKind::Text, 16);
        assert_eq!(a, b);
        assert_eq!(obj.sections.len(), 1);
    }

    #[test]
    fn test_symbol_definition_fills_placeholder() {
        let mut obj = Object::new(Arch::X64);
        let idx = obj.add_symbol("main", None, 0, SymbolBinding::External);
        assert!(!obj.symbols[idx].defined);

        let text = obj.add_section(".text", SectionKind::Text, 16);
        let idx2 = obj.add_symbol("main", Some(text), 0x10, SymbolBinding::Local);
        assert_eq!(idx, idx2);
        assert!(obj.symbols[idx].defined);
        assert_eq!(obj.symbols[idx].value, 0x10);
    }

    #[test]
    fn test_globl_marker_survives_definition() {
        let mut obj = Object::new(Arch::X64);
        let idx = obj.add_symbol("main", None, 0, SymbolBinding::Global);
        let text = obj.add_section(".text", SectionKind::Text, 16);
        obj.add_symbol("main", Some(text), 0, SymbolBinding::Local);
        assert_eq!(obj.symbols[idx].binding, SymbolBinding::Global);
    }

    #[test]
    fn test_validate_reloc_bounds() {
        let mut obj = Object::new(Arch::X64);
        let text = obj.add_section(".text", SectionKind::Text, 16);
        obj.sections[text].data = vec![0; 8];
        obj.sections[text].size = 8;
        let sym = obj.add_symbol("x", None, 0, SymbolBinding::External);
        obj.relocs.push(Relocation {
            section: text,
            offset: 6,
            symbol: sym,
            kind: RelocKind::Pc32,
            addend: -4,
        });
        assert!(obj.validate().is_err());

        obj.relocs[0].offset = 4;
        assert!(obj.validate().is_ok());
    }

    #[test]
    fn test_reloc_raw_roundtrip() {
        for kind in [
            RelocKind::Abs64,
            RelocKind::Abs32,
            RelocKind::Abs32S,
            RelocKind::Pc32,
        ] {
            let raw = kind.to_raw(Arch::X64);
            assert_eq!(RelocKind::from_raw(Arch::X64, raw).unwrap(), kind);
        }
        for kind in [
            RelocKind::Abs64,
            RelocKind::Abs32,
            RelocKind::Call26,
            RelocKind::Jump26,
            RelocKind::AdrPrelPgHi21,
            RelocKind::AddAbsLo12Nc,
            RelocKind::Ldst64AbsLo12Nc,
        ] {
            let raw = kind.to_raw(Arch::Arm64);
            assert_eq!(RelocKind::from_raw(Arch::Arm64, raw).unwrap(), kind);
        }
    }

    #[test]
    fn test_plt32_reads_back_as_pc32() {
        assert_eq!(
            RelocKind::from_raw(Arch::X64, 4).unwrap(),
            RelocKind::Pc32
        );
    }
}
