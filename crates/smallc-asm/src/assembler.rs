//! Two-pass assembler driver: sections, labels, directives, relocations.

use crate::error::{AsmError, AsmResult};
use crate::expr::{self, ExprEnv, ExprValue};
use crate::scanner::{scan_line, Line};
use crate::{arm64, x64};
use rustc_hash::{FxHashMap, FxHashSet};
use smallc_object::{Arch, Object, RelocKind, Relocation, SectionKind, SymbolBinding};

/// Assemble a complete source text into a relocatable object.
pub fn assemble(source: &str, arch: Arch) -> AsmResult<Object> {
    let mut asm = Assembler::new(arch);
    asm.run_pass(source, 1)?;
    asm.begin_pass2();
    asm.run_pass(source, 2)?;
    asm.finalize()
}

/// Assembler state shared by both passes and the instruction encoders.
pub struct Assembler {
    arch: Arch,
    start_arch: Arch,
    pub(crate) pass: u8,
    pub(crate) line_no: u32,
    object: Object,
    current: usize,
    labels: FxHashMap<String, (usize, u64)>,
    label_order: Vec<String>,
    absolutes: FxHashMap<String, i64>,
    globals: FxHashSet<String>,
    /// Byte width each line produced in pass 1
    line_sizes: Vec<u64>,
    line_index: usize,
}

impl Assembler {
    fn new(arch: Arch) -> Self {
        let mut object = Object::new(arch);
        let text = object.add_section(".text", SectionKind::Text, 16);
        Self {
            arch,
            start_arch: arch,
            pass: 0,
            line_no: 0,
            object,
            current: text,
            labels: FxHashMap::default(),
            label_order: Vec::new(),
            absolutes: FxHashMap::default(),
            globals: FxHashSet::default(),
            line_sizes: Vec::new(),
            line_index: 0,
        }
    }

    fn begin_pass2(&mut self) {
        for section in &mut self.object.sections {
            section.data.clear();
            section.size = 0;
        }
        self.object.symbols.clear();
        self.object.relocs.clear();
        self.arch = self.start_arch;
        self.current = 0;
        self.line_no = 0;
        self.line_index = 0;
    }

    fn run_pass(&mut self, source: &str, pass: u8) -> AsmResult<()> {
        self.pass = pass;
        for raw in source.lines() {
            self.line_no += 1;
            let Some(line) = scan_line(raw) else {
                continue;
            };
            for label in &line.labels {
                self.define_label(label)?;
            }
            let section_before = self.current;
            let size_before = self.object.sections[self.current].size;

            if let Some(mnemonic) = &line.mnemonic {
                if let Some(directive) = mnemonic.strip_prefix('.') {
                    self.directive(directive, &line)?;
                } else {
                    self.instruction(mnemonic, &line)?;
                }
            }

            let emitted = if self.current == section_before {
                self.object.sections[self.current].size - size_before
            } else {
                0
            };
            if pass == 1 {
                self.line_sizes.push(emitted);
            } else {
                let reserved = self.line_sizes[self.line_index];
                if reserved != emitted {
                    return Err(AsmError::PassSizeMismatch {
                        line: self.line_no,
                        pass1: reserved,
                        pass2: emitted,
                    });
                }
            }
            self.line_index += 1;
        }
        Ok(())
    }

    fn finalize(mut self) -> AsmResult<Object> {
        for name in &self.label_order {
            let (section, offset) = self.labels[name];
            let binding = if self.globals.contains(name) {
                SymbolBinding::Global
            } else {
                SymbolBinding::Local
            };
            self.object.add_symbol(name, Some(section), offset, binding);
        }
        // .globl names never defined stay external
        for name in &self.globals {
            if !self.labels.contains_key(name) {
                self.object.add_symbol(name, None, 0, SymbolBinding::External);
            }
        }
        self.object
            .validate()
            .map_err(|e| AsmError::syntax(0, e.to_string()))?;
        Ok(self.object)
    }

    // ========================================================================
    // State shared with the encoders
    // ========================================================================

    pub(crate) fn current_section(&self) -> usize {
        self.current
    }

    /// Current offset in the current section
    pub(crate) fn here(&self) -> u64 {
        self.object.sections[self.current].size
    }

    pub(crate) fn emit_u8(&mut self, byte: u8) -> AsmResult<()> {
        let section = &mut self.object.sections[self.current];
        if section.kind == SectionKind::Bss {
            return Err(AsmError::DataInBss { line: self.line_no });
        }
        section.data.push(byte);
        section.size += 1;
        Ok(())
    }

    pub(crate) fn emit_bytes(&mut self, bytes: &[u8]) -> AsmResult<()> {
        for &b in bytes {
            self.emit_u8(b)?;
        }
        Ok(())
    }

    pub(crate) fn emit_u16(&mut self, value: u16) -> AsmResult<()> {
        self.emit_bytes(&value.to_le_bytes())
    }

    pub(crate) fn emit_u32(&mut self, value: u32) -> AsmResult<()> {
        self.emit_bytes(&value.to_le_bytes())
    }

    pub(crate) fn emit_u64(&mut self, value: u64) -> AsmResult<()> {
        self.emit_bytes(&value.to_le_bytes())
    }

    /// Reserve space without bytes (bss) or with zero fill (elsewhere).
    fn reserve(&mut self, count: u64, fill: u8) -> AsmResult<()> {
        let section = &mut self.object.sections[self.current];
        if section.kind == SectionKind::Bss {
            if fill != 0 {
                return Err(AsmError::DataInBss { line: self.line_no });
            }
            section.size += count;
            return Ok(());
        }
        for _ in 0..count {
            self.emit_u8(fill)?;
        }
        Ok(())
    }

    /// Look up a label placed in pass 1.
    pub(crate) fn lookup_label(&self, name: &str) -> Option<(usize, u64)> {
        self.labels.get(name).copied()
    }

    /// Symbol index for relocation records (find-or-add as external).
    pub(crate) fn symbol_index(&mut self, name: &str) -> usize {
        self.object.add_symbol(name, None, 0, SymbolBinding::External)
    }

    /// Record a relocation at `offset` in the current section (pass 2 only).
    pub(crate) fn reloc(&mut self, offset: u64, name: &str, kind: RelocKind, addend: i64) {
        if self.pass != 2 {
            return;
        }
        let symbol = self.symbol_index(name);
        self.object.relocs.push(Relocation {
            section: self.current,
            offset,
            symbol,
            kind,
            addend,
        });
    }

    /// Evaluate a numeric expression. With `with_labels`, labels resolve to
    /// their section offsets; otherwise they surface as the pending symbol so
    /// the caller can emit a relocation.
    pub(crate) fn eval(&self, text: &str, with_labels: bool) -> AsmResult<ExprValue> {
        let env = EnvView {
            asm: self,
            with_labels,
        };
        expr::eval(text, self.line_no, &env)
    }

    fn define_label(&mut self, name: &str) -> AsmResult<()> {
        let here = (self.current, self.here());
        match self.labels.get(name) {
            None => {
                self.labels.insert(name.to_owned(), here);
                self.label_order.push(name.to_owned());
                Ok(())
            }
            Some(&existing) if self.pass == 2 => {
                if existing != here {
                    return Err(AsmError::SymbolRedefined {
                        line: self.line_no,
                        name: name.to_owned(),
                    });
                }
                Ok(())
            }
            Some(_) => Err(AsmError::SymbolRedefined {
                line: self.line_no,
                name: name.to_owned(),
            }),
        }
    }

    // ========================================================================
    // Directives
    // ========================================================================

    fn directive(&mut self, name: &str, line: &Line) -> AsmResult<()> {
        let operands = &line.operands;
        match name {
            "text" => {
                self.current = self.object.add_section(".text", SectionKind::Text, 16);
            }
            "data" => {
                self.current = self.object.add_section(".data", SectionKind::Data, 8);
            }
            "bss" => {
                self.current = self.object.add_section(".bss", SectionKind::Bss, 8);
            }
            "section" => {
                let section_name = operands
                    .first()
                    .ok_or_else(|| AsmError::syntax(self.line_no, ".section needs a name"))?;
                let kind = match section_name.as_str() {
                    ".text" => SectionKind::Text,
                    ".bss" => SectionKind::Bss,
                    ".data" => SectionKind::Data,
                    _ => SectionKind::Other,
                };
                self.current = self.object.add_section(section_name, kind, 1);
            }
            "globl" | "global" => {
                for op in operands {
                    self.globals.insert(op.clone());
                }
            }
            "extern" => {
                if self.pass == 2 {
                    for op in operands {
                        self.symbol_index(op);
                    }
                }
            }
            "byte" | "db" => self.data_values(operands, 1)?,
            "word" | "dw" => self.data_values(operands, 2)?,
            "long" | "dd" | "int" => self.data_values(operands, 4)?,
            "quad" | "dq" => self.data_values(operands, 8)?,
            "ascii" => self.string_data(operands, false)?,
            "asciz" | "string" => self.string_data(operands, true)?,
            "space" | "skip" | "zero" => {
                let count = self
                    .eval(
                        operands
                            .first()
                            .ok_or_else(|| AsmError::syntax(self.line_no, ".space needs a size"))?,
                        true,
                    )?
                    .value;
                let fill = match operands.get(1) {
                    Some(op) => self.eval(op, true)?.value as u8,
                    None => 0,
                };
                self.reserve(count.max(0) as u64, fill)?;
            }
            "align" => {
                let align = self
                    .eval(
                        operands
                            .first()
                            .ok_or_else(|| AsmError::syntax(self.line_no, ".align needs a value"))?,
                        true,
                    )?
                    .value;
                if align > 1 {
                    let align = align as u64;
                    while self.here() % align != 0 {
                        self.reserve(1, 0)?;
                    }
                }
            }
            "arch" => {
                let arch = operands
                    .first()
                    .ok_or_else(|| AsmError::syntax(self.line_no, ".arch needs a name"))?;
                self.arch = match arch.as_str() {
                    "x64" | "x86_64" | "amd64" => Arch::X64,
                    "arm64" | "aarch64" => Arch::Arm64,
                    other => {
                        return Err(AsmError::syntax(
                            self.line_no,
                            format!("unknown architecture '{other}'"),
                        ))
                    }
                };
            }
            "equ" | "set" => {
                let (name_op, value_op) = match operands.as_slice() {
                    [n, v] => (n, v),
                    _ => {
                        return Err(AsmError::syntax(
                            self.line_no,
                            ".equ needs a name and a value",
                        ))
                    }
                };
                let value = self.eval(value_op, true)?.value;
                if let Some(&existing) = self.absolutes.get(name_op.as_str()) {
                    if existing != value && self.pass == 1 {
                        return Err(AsmError::SymbolRedefined {
                            line: self.line_no,
                            name: name_op.clone(),
                        });
                    }
                }
                self.absolutes.insert(name_op.clone(), value);
            }
            // Directives other assemblers emit that carry no meaning here
            "file" | "ident" | "size" | "type" => {}
            other => {
                return Err(AsmError::syntax(
                    self.line_no,
                    format!("unknown directive '.{other}'"),
                ))
            }
        }
        Ok(())
    }

    /// `.byte`/`.word`/`.long`/`.quad` operand lists. Symbolic values at
    /// pointer widths record absolute relocations.
    fn data_values(&mut self, operands: &[String], width: u8) -> AsmResult<()> {
        for op in operands {
            if width == 1 {
                if let Some(bytes) = parse_string_literal(op) {
                    self.emit_bytes(&bytes)?;
                    continue;
                }
            }
            let with_labels = width < 4;
            let result = self.eval(op, with_labels)?;
            if let Some(symbol) = &result.symbol {
                match width {
                    8 => {
                        let offset = self.here();
                        self.reloc(offset, &symbol.clone(), RelocKind::Abs64, result.value);
                    }
                    4 => {
                        let offset = self.here();
                        self.reloc(offset, &symbol.clone(), RelocKind::Abs32, result.value);
                    }
                    _ => {}
                }
            }
            match width {
                1 => self.emit_u8(result.value as u8)?,
                2 => self.emit_u16(result.value as u16)?,
                4 => self.emit_u32(result.value as u32)?,
                _ => self.emit_u64(result.value as u64)?,
            }
        }
        Ok(())
    }

    fn string_data(&mut self, operands: &[String], nul: bool) -> AsmResult<()> {
        for op in operands {
            let bytes = parse_string_literal(op)
                .ok_or_else(|| AsmError::syntax(self.line_no, "expected a string literal"))?;
            self.emit_bytes(&bytes)?;
            if nul {
                self.emit_u8(0)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Instructions
    // ========================================================================

    fn instruction(&mut self, mnemonic: &str, line: &Line) -> AsmResult<()> {
        if self.object.sections[self.current].kind == SectionKind::Bss {
            return Err(AsmError::DataInBss { line: self.line_no });
        }
        match self.arch {
            Arch::X64 => x64::encode(self, mnemonic, &line.operands),
            Arch::Arm64 => arm64::encode(self, mnemonic, &line.operands),
        }
    }
}

struct EnvView<'a> {
    asm: &'a Assembler,
    with_labels: bool,
}

impl ExprEnv for EnvView<'_> {
    fn symbol(&self, name: &str) -> Option<i64> {
        if let Some(&value) = self.asm.absolutes.get(name) {
            return Some(value);
        }
        if self.with_labels {
            if let Some(&(_, offset)) = self.asm.labels.get(name) {
                return Some(offset as i64);
            }
        }
        None
    }

    fn here(&self) -> i64 {
        self.asm.here() as i64
    }
}

/// Decode a quoted string literal with the shared escape set.
pub(crate) fn parse_string_literal(text: &str) -> Option<Vec<u8>> {
    let inner = text.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = Vec::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('r') => out.push(b'\r'),
            Some('b') => out.push(0x08),
            Some('0') => out.push(0),
            Some('\\') => out.push(b'\\'),
            Some('"') => out.push(b'"'),
            Some(other) => out.push(other as u8),
            None => break,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble_x64(source: &str) -> Object {
        assemble(source, Arch::X64).unwrap()
    }

    #[test]
    fn test_ret_only_function() {
        let obj = assemble_x64(".text\nmain:\n  ret\n");
        let text = &obj.sections[obj.find_section(".text").unwrap()];
        assert_eq!(text.data, vec![0xC3]);
        assert_eq!(text.size, 1);
    }

    #[test]
    fn test_arm64_ret_only() {
        let obj = assemble(".text\nmain:\n  ret\n", Arch::Arm64).unwrap();
        let text = &obj.sections[0];
        assert_eq!(text.data, vec![0xC0, 0x03, 0x5F, 0xD6]);
    }

    #[test]
    fn test_label_symbol_recorded() {
        let obj = assemble_x64(".globl main\nmain:\n  ret\nlocal:\n  ret\n");
        let main = &obj.symbols[obj.find_symbol("main").unwrap()];
        assert_eq!(main.binding, SymbolBinding::Global);
        assert_eq!(main.value, 0);
        assert!(main.defined);
        let local = &obj.symbols[obj.find_symbol("local").unwrap()];
        assert_eq!(local.binding, SymbolBinding::Local);
        assert_eq!(local.value, 1);
    }

    #[test]
    fn test_data_directives() {
        let obj = assemble_x64(".data\nv:\n  .byte 1, 2\n  .word 0x0304\n  .long 5\n  .quad 6\n");
        let data = &obj.sections[obj.find_section(".data").unwrap()];
        assert_eq!(data.data[..4], [1, 2, 4, 3]);
        assert_eq!(data.data[4..8], [5, 0, 0, 0]);
        assert_eq!(data.data[8..16], [6, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_quad_of_label_gets_abs64_reloc() {
        let obj = assemble_x64(".data\nptr:\n  .quad target\n.text\ntarget:\n  ret\n");
        let reloc = &obj.relocs[0];
        assert_eq!(reloc.kind, RelocKind::Abs64);
        assert_eq!(obj.symbols[reloc.symbol].name, "target");
    }

    #[test]
    fn test_asciz_and_space() {
        let obj = assemble_x64(".data\ns:\n  .asciz \"hi\"\n  .space 3\n");
        let data = &obj.sections[obj.find_section(".data").unwrap()];
        assert_eq!(data.data, vec![b'h', b'i', 0, 0, 0, 0]);
    }

    #[test]
    fn test_ascii_escapes() {
        let obj = assemble_x64(".data\n  .ascii \"a\\n\\\"b\\\"\"\n");
        let data = &obj.sections[obj.find_section(".data").unwrap()];
        assert_eq!(data.data, b"a\n\"b\"");
    }

    #[test]
    fn test_align_pads() {
        let obj = assemble_x64(".data\n  .byte 1\n  .align 8\n  .byte 2\n");
        let data = &obj.sections[obj.find_section(".data").unwrap()];
        assert_eq!(data.size, 9);
        assert_eq!(data.data[8], 2);
    }

    #[test]
    fn test_bss_reserves_without_bytes() {
        let obj = assemble_x64(".bss\nbuf:\n  .space 64\n");
        let bss = &obj.sections[obj.find_section(".bss").unwrap()];
        assert_eq!(bss.size, 64);
        assert!(bss.data.is_empty());
    }

    #[test]
    fn test_data_in_bss_rejected() {
        let err = assemble(".bss\n  .byte 1\n", Arch::X64).unwrap_err();
        assert!(matches!(err, AsmError::DataInBss { .. }));
    }

    #[test]
    fn test_equ_symbol_in_expression() {
        let obj = assemble_x64(".equ SIZE, 16\n.data\n  .long SIZE * 2\n");
        let data = &obj.sections[obj.find_section(".data").unwrap()];
        assert_eq!(data.data[..4], [32, 0, 0, 0]);
        assert!(obj.relocs.is_empty());
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let err = assemble("a:\n  ret\na:\n  ret\n", Arch::X64).unwrap_err();
        assert!(matches!(err, AsmError::SymbolRedefined { .. }));
    }

    #[test]
    fn test_unknown_mnemonic() {
        let err = assemble("  frobnicate %rax\n", Arch::X64).unwrap_err();
        assert!(matches!(err, AsmError::UnknownMnemonic { .. }));
    }

    #[test]
    fn test_arch_directive_switches_encoder() {
        let obj = assemble(".arch arm64\n  nop\n", Arch::X64).unwrap();
        assert_eq!(obj.sections[0].data, vec![0x1F, 0x20, 0x03, 0xD5]);
    }

    #[test]
    fn test_section_directive() {
        let obj = assemble_x64(".section .rodata\n  .byte 7\n");
        let idx = obj.find_section(".rodata").unwrap();
        assert_eq!(obj.sections[idx].data, vec![7]);
    }
}
