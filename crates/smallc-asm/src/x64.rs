//! x86-64 instruction encoding (AT&T syntax).
//!
//! Operands are written source-first (`movq %rax, %rbx` copies rax to rbx);
//! immediates carry `$`, registers `%`, and memory operands use
//! `disp(base,index,scale)` or `sym(%rip)`. Encoding composes optional
//! legacy prefixes, a REX byte, one- to three-byte opcodes, ModR/M, an
//! optional SIB byte and little-endian displacement/immediate fields.

use crate::assembler::Assembler;
use crate::error::{AsmError, AsmResult};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use smallc_object::RelocKind;

/// Operand width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    B,
    W,
    L,
    Q,
}

impl Size {
    fn from_suffix(c: char) -> Option<Size> {
        match c {
            'b' => Some(Size::B),
            'w' => Some(Size::W),
            'l' => Some(Size::L),
            'q' => Some(Size::Q),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reg {
    num: u8,
    size: Size,
    /// spl/bpl/sil/dil need a REX byte even without extension bits
    needs_rex: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
struct Mem {
    disp: i64,
    sym: Option<String>,
    base: Option<Reg>,
    index: Option<Reg>,
    scale: u8,
    rip: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Reg(Reg),
    Imm { value: i64, sym: Option<String> },
    Mem(Mem),
    /// Bare symbol or number: branch target
    Target(String),
}

const REG64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
const REG32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];
const REG16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w",
    "r14w", "r15w",
];
const REG8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];

fn reg_by_name(name: &str) -> Option<Reg> {
    for (table, size) in [
        (&REG64, Size::Q),
        (&REG32, Size::L),
        (&REG16, Size::W),
        (&REG8, Size::B),
    ] {
        if let Some(num) = table.iter().position(|&r| r == name) {
            let needs_rex = size == Size::B && (4..8).contains(&num);
            return Some(Reg {
                num: num as u8,
                size,
                needs_rex,
            });
        }
    }
    None
}

// ============================================================================
// Mnemonic table
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Kind {
    /// add/or/adc/sbb/and/sub/xor/cmp: base opcode row + immediate group ext
    Alu { ext: u8 },
    Mov,
    Movabs,
    Lea,
    Test,
    Xchg,
    /// rol/ror/rcl/rcr/shl/shr/sar via C0/C1/D2/D3 group
    Shift { ext: u8 },
    /// F6/F7 group: not/neg/mul/imul/div/idiv
    Unary { ext: u8 },
    /// FE/FF group
    IncDec { ext: u8 },
    Push,
    Pop,
    Jmp,
    Call,
    Ret,
    Jcc(u8),
    Setcc(u8),
    Cmovcc(u8),
    /// movzb*/movsb*/movzw*/movsw* with explicit source width
    MovExt { opcode: u8, src: Size, dst: Size },
    Movslq,
    Imul,
    /// Complete fixed byte sequence, no operands
    Fixed(&'static [u8]),
    /// reg <- r/m through an 0F-escape opcode, optional mandatory prefix
    RmToReg {
        prefix: Option<u8>,
        opcode: &'static [u8],
    },
    /// r/m <- reg through an 0F-escape opcode (bt family, xadd, cmpxchg)
    RegToRm { opcode: u8, imm_ext: Option<u8> },
    IntImm,
    Prefetch { ext: u8 },
    Xbegin,
    Xabort,
    /// BMI instruction encoded with a VEX prefix
    Vex(VexOp),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum VexOp {
    Andn,
    Bextr,
    Bzhi,
    Blsi,
    Blsmsk,
    Blsr,
    Mulx,
    Pdep,
    Pext,
    Rorx,
    Sarx,
    Shlx,
    Shrx,
}

/// Condition-code suffixes in encoding order (tttn)
const CC: [(&str, u8); 30] = [
    ("o", 0x0),
    ("no", 0x1),
    ("b", 0x2),
    ("c", 0x2),
    ("nae", 0x2),
    ("ae", 0x3),
    ("nb", 0x3),
    ("nc", 0x3),
    ("e", 0x4),
    ("z", 0x4),
    ("ne", 0x5),
    ("nz", 0x5),
    ("be", 0x6),
    ("na", 0x6),
    ("a", 0x7),
    ("nbe", 0x7),
    ("s", 0x8),
    ("ns", 0x9),
    ("p", 0xA),
    ("pe", 0xA),
    ("np", 0xB),
    ("po", 0xB),
    ("l", 0xC),
    ("nge", 0xC),
    ("ge", 0xD),
    ("nl", 0xD),
    ("le", 0xE),
    ("ng", 0xE),
    ("g", 0xF),
    ("nle", 0xF),
];

static TABLE: Lazy<FxHashMap<&'static str, Kind>> = Lazy::new(|| {
    let mut t = FxHashMap::default();

    // ALU group: row base opcodes are derived from the ModR/M group ext
    for (name, ext) in [
        ("add", 0u8),
        ("or", 1),
        ("adc", 2),
        ("sbb", 3),
        ("and", 4),
        ("sub", 5),
        ("xor", 6),
        ("cmp", 7),
    ] {
        t.insert(name, Kind::Alu { ext });
    }

    t.insert("mov", Kind::Mov);
    t.insert("movabs", Kind::Movabs);
    t.insert("lea", Kind::Lea);
    t.insert("test", Kind::Test);
    t.insert("xchg", Kind::Xchg);

    for (name, ext) in [
        ("rol", 0u8),
        ("ror", 1),
        ("rcl", 2),
        ("rcr", 3),
        ("shl", 4),
        ("sal", 4),
        ("shr", 5),
        ("sar", 7),
    ] {
        t.insert(name, Kind::Shift { ext });
    }

    for (name, ext) in [("not", 2u8), ("neg", 3), ("mul", 4), ("div", 6), ("idiv", 7)] {
        t.insert(name, Kind::Unary { ext });
    }
    t.insert("imul", Kind::Imul);
    t.insert("inc", Kind::IncDec { ext: 0 });
    t.insert("dec", Kind::IncDec { ext: 1 });

    t.insert("push", Kind::Push);
    t.insert("pop", Kind::Pop);
    t.insert("jmp", Kind::Jmp);
    t.insert("call", Kind::Call);
    t.insert("ret", Kind::Ret);
    t.insert("retq", Kind::Ret);
    t.insert("int", Kind::IntImm);

    for (suffix, cc) in CC {
        t.insert(
            Box::leak(format!("j{suffix}").into_boxed_str()),
            Kind::Jcc(cc),
        );
        t.insert(
            Box::leak(format!("set{suffix}").into_boxed_str()),
            Kind::Setcc(cc),
        );
        t.insert(
            Box::leak(format!("cmov{suffix}").into_boxed_str()),
            Kind::Cmovcc(cc),
        );
    }

    // AT&T zero/sign extension forms
    for (name, opcode, src, dst) in [
        ("movzbw", 0xB6u8, Size::B, Size::W),
        ("movzbl", 0xB6, Size::B, Size::L),
        ("movzbq", 0xB6, Size::B, Size::Q),
        ("movzwl", 0xB7, Size::W, Size::L),
        ("movzwq", 0xB7, Size::W, Size::Q),
        ("movsbw", 0xBE, Size::B, Size::W),
        ("movsbl", 0xBE, Size::B, Size::L),
        ("movsbq", 0xBE, Size::B, Size::Q),
        ("movswl", 0xBF, Size::W, Size::L),
        ("movswq", 0xBF, Size::W, Size::Q),
        ("movzx", 0xB6, Size::B, Size::Q),
        ("movsx", 0xBE, Size::B, Size::Q),
    ] {
        t.insert(name, Kind::MovExt { opcode, src, dst });
    }
    t.insert("movslq", Kind::Movslq);
    t.insert("movsxd", Kind::Movslq);

    // Complete fixed encodings
    let fixed: &[(&str, &[u8])] = &[
        ("nop", &[0x90]),
        ("leave", &[0xC9]),
        ("hlt", &[0xF4]),
        ("pause", &[0xF3, 0x90]),
        ("int3", &[0xCC]),
        ("syscall", &[0x0F, 0x05]),
        ("sysret", &[0x0F, 0x07]),
        ("sysretq", &[0x48, 0x0F, 0x07]),
        ("cpuid", &[0x0F, 0xA2]),
        ("rdtsc", &[0x0F, 0x31]),
        ("rdtscp", &[0x0F, 0x01, 0xF9]),
        ("rdmsr", &[0x0F, 0x32]),
        ("wrmsr", &[0x0F, 0x30]),
        ("mfence", &[0x0F, 0xAE, 0xF0]),
        ("lfence", &[0x0F, 0xAE, 0xE8]),
        ("sfence", &[0x0F, 0xAE, 0xF8]),
        ("cqo", &[0x48, 0x99]),
        ("cqto", &[0x48, 0x99]),
        ("cdq", &[0x99]),
        ("cltd", &[0x99]),
        ("cwd", &[0x66, 0x99]),
        ("cbw", &[0x66, 0x98]),
        ("cwde", &[0x98]),
        ("cltq", &[0x48, 0x98]),
        ("cdqe", &[0x48, 0x98]),
        ("clc", &[0xF8]),
        ("stc", &[0xF9]),
        ("cmc", &[0xF5]),
        ("cld", &[0xFC]),
        ("std", &[0xFD]),
        ("sahf", &[0x9E]),
        ("lahf", &[0x9F]),
        ("ud2", &[0x0F, 0x0B]),
        ("endbr64", &[0xF3, 0x0F, 0x1E, 0xFA]),
        ("xend", &[0x0F, 0x01, 0xD5]),
        ("xtest", &[0x0F, 0x01, 0xD6]),
        ("movsb", &[0xA4]),
        ("movsw", &[0x66, 0xA5]),
        ("movsl", &[0xA5]),
        ("movsq", &[0x48, 0xA5]),
        ("stosb", &[0xAA]),
        ("stosw", &[0x66, 0xAB]),
        ("stosl", &[0xAB]),
        ("stosq", &[0x48, 0xAB]),
        ("lodsb", &[0xAC]),
        ("lodsw", &[0x66, 0xAD]),
        ("lodsl", &[0xAD]),
        ("lodsq", &[0x48, 0xAD]),
        ("scasb", &[0xAE]),
        ("scasw", &[0x66, 0xAF]),
        ("scasl", &[0xAF]),
        ("scasq", &[0x48, 0xAF]),
        ("cmpsb", &[0xA6]),
        ("cmpsw", &[0x66, 0xA7]),
        ("cmpsl", &[0xA7]),
        ("cmpsq", &[0x48, 0xA7]),
        ("insb", &[0x6C]),
        ("insw", &[0x66, 0x6D]),
        ("insl", &[0x6D]),
        ("outsb", &[0x6E]),
        ("outsw", &[0x66, 0x6F]),
        ("outsl", &[0x6F]),
        ("xgetbv", &[0x0F, 0x01, 0xD0]),
    ];
    for &(name, bytes) in fixed {
        t.insert(name, Kind::Fixed(bytes));
    }

    // Bit scans, counts, conditional data movement
    t.insert(
        "bsf",
        Kind::RmToReg {
            prefix: None,
            opcode: &[0x0F, 0xBC],
        },
    );
    t.insert(
        "bsr",
        Kind::RmToReg {
            prefix: None,
            opcode: &[0x0F, 0xBD],
        },
    );
    t.insert(
        "popcnt",
        Kind::RmToReg {
            prefix: Some(0xF3),
            opcode: &[0x0F, 0xB8],
        },
    );
    t.insert(
        "lzcnt",
        Kind::RmToReg {
            prefix: Some(0xF3),
            opcode: &[0x0F, 0xBD],
        },
    );
    t.insert(
        "tzcnt",
        Kind::RmToReg {
            prefix: Some(0xF3),
            opcode: &[0x0F, 0xBC],
        },
    );
    t.insert(
        "crc32",
        Kind::RmToReg {
            prefix: Some(0xF2),
            opcode: &[0x0F, 0x38, 0xF1],
        },
    );

    t.insert("bt", Kind::RegToRm { opcode: 0xA3, imm_ext: Some(4) });
    t.insert("bts", Kind::RegToRm { opcode: 0xAB, imm_ext: Some(5) });
    t.insert("btr", Kind::RegToRm { opcode: 0xB3, imm_ext: Some(6) });
    t.insert("btc", Kind::RegToRm { opcode: 0xBB, imm_ext: Some(7) });
    t.insert("xadd", Kind::RegToRm { opcode: 0xC1, imm_ext: None });
    t.insert("cmpxchg", Kind::RegToRm { opcode: 0xB1, imm_ext: None });

    t.insert("prefetchnta", Kind::Prefetch { ext: 0 });
    t.insert("prefetcht0", Kind::Prefetch { ext: 1 });
    t.insert("prefetcht1", Kind::Prefetch { ext: 2 });
    t.insert("prefetcht2", Kind::Prefetch { ext: 3 });

    t.insert("xbegin", Kind::Xbegin);
    t.insert("xabort", Kind::Xabort);

    for (name, op) in [
        ("andn", VexOp::Andn),
        ("bextr", VexOp::Bextr),
        ("bzhi", VexOp::Bzhi),
        ("blsi", VexOp::Blsi),
        ("blsmsk", VexOp::Blsmsk),
        ("blsr", VexOp::Blsr),
        ("mulx", VexOp::Mulx),
        ("pdep", VexOp::Pdep),
        ("pext", VexOp::Pext),
        ("rorx", VexOp::Rorx),
        ("sarx", VexOp::Sarx),
        ("shlx", VexOp::Shlx),
        ("shrx", VexOp::Shrx),
    ] {
        t.insert(name, Kind::Vex(op));
    }

    t
});

fn lookup(mnemonic: &str) -> Option<(Kind, Option<Size>)> {
    if let Some(&kind) = TABLE.get(mnemonic) {
        return Some((kind, None));
    }
    // AT&T size suffix: addq -> add + Q
    let mut chars = mnemonic.chars();
    let last = chars.next_back()?;
    let base = chars.as_str();
    let size = Size::from_suffix(last)?;
    TABLE.get(base).map(|&kind| (kind, Some(size)))
}

// ============================================================================
// Operand parsing
// ============================================================================

fn parse_operand(asm: &Assembler, text: &str) -> AsmResult<Operand> {
    let line = asm.line_no;
    if let Some(reg_name) = text.strip_prefix('%') {
        if reg_name == "rip" {
            return Err(AsmError::syntax(line, "%rip is only valid as a base"));
        }
        return reg_by_name(reg_name)
            .map(Operand::Reg)
            .ok_or_else(|| AsmError::syntax(line, format!("unknown register %{reg_name}")));
    }
    if let Some(imm) = text.strip_prefix('$') {
        let value = asm.eval(imm, false)?;
        return Ok(Operand::Imm {
            value: value.value,
            sym: value.symbol,
        });
    }
    if let Some(open) = text.find('(') {
        let close = text
            .rfind(')')
            .ok_or_else(|| AsmError::syntax(line, "missing ')' in memory operand"))?;
        let disp_text = text[..open].trim();
        let inner = &text[open + 1..close];

        let mut mem = Mem::default();
        if !disp_text.is_empty() {
            let value = asm.eval(disp_text, false)?;
            mem.disp = value.value;
            mem.sym = value.symbol;
        }

        let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
        if parts.first() == Some(&"%rip") {
            mem.rip = true;
            return Ok(Operand::Mem(mem));
        }
        if let Some(base) = parts.first().filter(|p| !p.is_empty()) {
            let name = base
                .strip_prefix('%')
                .ok_or_else(|| AsmError::syntax(line, "expected a base register"))?;
            mem.base = Some(
                reg_by_name(name)
                    .ok_or_else(|| AsmError::syntax(line, format!("unknown register %{name}")))?,
            );
        }
        if let Some(index) = parts.get(1).filter(|p| !p.is_empty()) {
            let name = index
                .strip_prefix('%')
                .ok_or_else(|| AsmError::syntax(line, "expected an index register"))?;
            mem.index = Some(
                reg_by_name(name)
                    .ok_or_else(|| AsmError::syntax(line, format!("unknown register %{name}")))?,
            );
            mem.scale = match parts.get(2) {
                Some(s) if !s.is_empty() => match *s {
                    "1" => 1,
                    "2" => 2,
                    "4" => 4,
                    "8" => 8,
                    other => {
                        return Err(AsmError::syntax(line, format!("bad scale '{other}'")))
                    }
                },
                _ => 1,
            };
        }
        return Ok(Operand::Mem(mem));
    }
    Ok(Operand::Target(text.to_owned()))
}

// ============================================================================
// Instruction composition
// ============================================================================

enum Rm<'a> {
    Reg(Reg),
    Mem(&'a Mem),
}

struct Insn<'a> {
    prefixes: Vec<u8>,
    size: Size,
    opcode: Vec<u8>,
    /// ModR/M reg field: register number or group /digit
    reg: u8,
    reg_needs_rex: bool,
    rm: Option<Rm<'a>>,
    /// Immediate bytes appended after the addressing fields
    imm: Vec<u8>,
    /// Relocation against the immediate field
    imm_reloc: Option<(String, RelocKind, i64)>,
}

impl<'a> Insn<'a> {
    fn new(size: Size, opcode: Vec<u8>) -> Self {
        Insn {
            prefixes: Vec::new(),
            size,
            opcode,
            reg: 0,
            reg_needs_rex: false,
            rm: None,
            imm: Vec::new(),
            imm_reloc: None,
        }
    }

    fn reg_field(mut self, reg: Reg) -> Self {
        self.reg = reg.num;
        self.reg_needs_rex = reg.needs_rex;
        self
    }

    fn ext(mut self, digit: u8) -> Self {
        self.reg = digit;
        self
    }

    fn rm(mut self, rm: Rm<'a>) -> Self {
        self.rm = Some(rm);
        self
    }

    fn imm8(mut self, value: i64) -> Self {
        self.imm.extend_from_slice(&(value as i8).to_le_bytes());
        self
    }

    fn imm16(mut self, value: i64) -> Self {
        self.imm.extend_from_slice(&(value as i16).to_le_bytes());
        self
    }

    fn imm32(mut self, value: i64, sym: Option<String>) -> Self {
        self.imm.extend_from_slice(&(value as i32).to_le_bytes());
        if let Some(sym) = sym {
            self.imm_reloc = Some((sym, RelocKind::Abs32S, value));
        }
        self
    }

    fn imm64(mut self, value: i64, sym: Option<String>) -> Self {
        self.imm.extend_from_slice(&value.to_le_bytes());
        if let Some(sym) = sym {
            self.imm_reloc = Some((sym, RelocKind::Abs64, value));
        }
        self
    }
}

/// Emit a fully described instruction: prefixes, REX, opcode, ModR/M, SIB,
/// displacement, immediate; record any displacement/immediate relocations.
fn emit_insn(asm: &mut Assembler, insn: Insn) -> AsmResult<()> {
    let Insn {
        prefixes,
        size,
        opcode,
        reg,
        reg_needs_rex,
        rm,
        imm,
        imm_reloc,
    } = insn;

    if size == Size::W {
        asm.emit_u8(0x66)?;
    }
    for p in &prefixes {
        asm.emit_u8(*p)?;
    }

    let mut rex: u8 = 0x40;
    let mut need_rex = reg_needs_rex;
    if size == Size::Q {
        rex |= 0x08;
    }
    if reg >= 8 {
        rex |= 0x04;
    }
    match &rm {
        Some(Rm::Reg(r)) => {
            if r.num >= 8 {
                rex |= 0x01;
            }
            need_rex |= r.needs_rex;
        }
        Some(Rm::Mem(mem)) => {
            if mem.base.is_some_and(|b| b.num >= 8) {
                rex |= 0x01;
            }
            if mem.index.is_some_and(|i| i.num >= 8) {
                rex |= 0x02;
            }
        }
        None => {}
    }
    if rex != 0x40 || need_rex {
        asm.emit_u8(rex)?;
    }

    for b in &opcode {
        asm.emit_u8(*b)?;
    }

    // Addressing fields
    let mut disp_reloc: Option<(u64, String, RelocKind, i64)> = None;
    match &rm {
        None => {}
        Some(Rm::Reg(r)) => {
            asm.emit_u8(0xC0 | ((reg & 7) << 3) | (r.num & 7))?;
        }
        Some(Rm::Mem(mem)) => {
            let reg_bits = (reg & 7) << 3;
            if mem.rip {
                asm.emit_u8(reg_bits | 0x05)?;
                let offset = asm.here();
                if let Some(sym) = &mem.sym {
                    disp_reloc = Some((
                        offset,
                        sym.clone(),
                        RelocKind::Pc32,
                        mem.disp - 4 - imm.len() as i64,
                    ));
                }
                asm.emit_u32(mem.disp as u32)?;
            } else if mem.base.is_none() && mem.index.is_none() {
                // Absolute [disp32] via SIB with no base
                asm.emit_u8(reg_bits | 0x04)?;
                asm.emit_u8(0x25)?;
                let offset = asm.here();
                if let Some(sym) = &mem.sym {
                    disp_reloc = Some((offset, sym.clone(), RelocKind::Abs32S, mem.disp));
                }
                asm.emit_u32(mem.disp as u32)?;
            } else {
                let base = mem.base;
                let need_sib =
                    mem.index.is_some() || base.is_none() || base.is_some_and(|b| b.num & 7 == 4);
                // rbp/r13 as base cannot use mod=00
                let base_is_bp = base.is_some_and(|b| b.num & 7 == 5);
                let (modbits, disp_width) = if mem.sym.is_some() {
                    (0x80u8, 4u8)
                } else if mem.disp == 0 && !base_is_bp {
                    (0x00, 0)
                } else if (-128..=127).contains(&mem.disp) {
                    (0x40, 1)
                } else {
                    (0x80, 4)
                };

                if need_sib && base.is_none() {
                    // index without base: mod=00, disp32 always
                    asm.emit_u8(reg_bits | 0x04)?;
                    asm.emit_u8(sib_byte(mem.scale, mem.index, None))?;
                    let offset = asm.here();
                    if let Some(sym) = &mem.sym {
                        disp_reloc = Some((offset, sym.clone(), RelocKind::Abs32S, mem.disp));
                    }
                    asm.emit_u32(mem.disp as u32)?;
                } else {
                    if need_sib {
                        asm.emit_u8(modbits | reg_bits | 0x04)?;
                        asm.emit_u8(sib_byte(mem.scale, mem.index, base))?;
                    } else {
                        asm.emit_u8(modbits | reg_bits | (base.map_or(0, |b| b.num & 7)))?;
                    }
                    match disp_width {
                        0 => {}
                        1 => asm.emit_u8(mem.disp as u8)?,
                        _ => {
                            let offset = asm.here();
                            if let Some(sym) = &mem.sym {
                                disp_reloc =
                                    Some((offset, sym.clone(), RelocKind::Abs32S, mem.disp));
                            }
                            asm.emit_u32(mem.disp as u32)?;
                        }
                    }
                }
            }
        }
    }

    if let Some((offset, sym, kind, addend)) = disp_reloc {
        asm.reloc(offset, &sym, kind, addend);
    }
    if let Some((sym, kind, addend)) = &imm_reloc {
        let offset = asm.here();
        asm.reloc(offset, sym, *kind, *addend);
    }
    asm.emit_bytes(&imm)
}

fn sib_byte(scale: u8, index: Option<Reg>, base: Option<Reg>) -> u8 {
    let scale_bits = match scale {
        0 | 1 => 0u8,
        2 => 1,
        4 => 2,
        _ => 3,
    };
    let index_bits = index.map_or(4, |i| i.num & 7);
    let base_bits = base.map_or(5, |b| b.num & 7);
    (scale_bits << 6) | (index_bits << 3) | base_bits
}

/// PC-relative branch operand: direct displacement to a section-local label,
/// numeric displacement, or a relocation against an external symbol.
fn branch_target(asm: &mut Assembler, target: &str, opcode: &[u8]) -> AsmResult<()> {
    for b in opcode {
        asm.emit_u8(*b)?;
    }
    if target
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == '-')
    {
        let value = asm.eval(target, true)?.value;
        asm.emit_u32(value as u32)?;
        return Ok(());
    }
    if asm.pass == 2 {
        match asm.lookup_label(target) {
            // Section-local label: direct rel32 from the end of the field
            Some((section, offset)) if section == asm.current_section() => {
                let rel = offset as i64 - (asm.here() as i64 + 4);
                if i32::try_from(rel).is_err() {
                    return Err(AsmError::BranchOutOfRange {
                        line: asm.line_no,
                        name: target.to_owned(),
                    });
                }
                asm.emit_u32(rel as u32)?;
                return Ok(());
            }
            _ => {
                let offset = asm.here();
                asm.reloc(offset, target, RelocKind::Pc32, -4);
            }
        }
    }
    asm.emit_u32(0)
}

fn size_of(suffix: Option<Size>, ops: &[Operand]) -> Size {
    if let Some(size) = suffix {
        return size;
    }
    for op in ops {
        if let Operand::Reg(reg) = op {
            return reg.size;
        }
    }
    Size::Q
}

fn rm_of<'a>(asm: &Assembler, op: &'a Operand) -> AsmResult<Rm<'a>> {
    match op {
        Operand::Reg(reg) => Ok(Rm::Reg(*reg)),
        Operand::Mem(mem) => Ok(Rm::Mem(mem)),
        _ => Err(AsmError::syntax(
            asm.line_no,
            "expected a register or memory operand",
        )),
    }
}

fn expect_reg(asm: &Assembler, op: &Operand) -> AsmResult<Reg> {
    match op {
        Operand::Reg(reg) => Ok(*reg),
        _ => Err(AsmError::syntax(asm.line_no, "expected a register")),
    }
}

/// Opcode within a classic row: `row` is the r/m8,r8 opcode.
fn row(base: u8, size: Size) -> u8 {
    if size == Size::B {
        base
    } else {
        base + 1
    }
}

// ============================================================================
// Entry point
// ============================================================================

pub fn encode(asm: &mut Assembler, mnemonic: &str, operand_text: &[String]) -> AsmResult<()> {
    // rep/lock prefixes stand in the mnemonic position
    match mnemonic {
        "rep" | "repe" | "repz" => {
            asm.emit_u8(0xF3)?;
            return match operand_text.split_first() {
                Some((inner, rest)) => encode(asm, inner, rest),
                None => Err(AsmError::syntax(asm.line_no, "rep needs an instruction")),
            };
        }
        "repne" | "repnz" => {
            asm.emit_u8(0xF2)?;
            return match operand_text.split_first() {
                Some((inner, rest)) => encode(asm, inner, rest),
                None => Err(AsmError::syntax(asm.line_no, "repne needs an instruction")),
            };
        }
        "lock" => {
            asm.emit_u8(0xF0)?;
            return match operand_text.split_first() {
                Some((inner, rest)) => encode(asm, inner, rest),
                None => Err(AsmError::syntax(asm.line_no, "lock needs an instruction")),
            };
        }
        _ => {}
    }

    let Some((kind, suffix)) = lookup(mnemonic) else {
        return Err(AsmError::UnknownMnemonic {
            line: asm.line_no,
            mnemonic: mnemonic.to_owned(),
        });
    };

    let ops: Vec<Operand> = operand_text
        .iter()
        .map(|t| parse_operand(asm, t))
        .collect::<AsmResult<_>>()?;
    let line = asm.line_no;
    let bad = |msg: &str| AsmError::bad_operands(line, mnemonic, msg.to_owned());

    match kind {
        Kind::Fixed(bytes) => {
            if !ops.is_empty() {
                return Err(bad("takes no operands"));
            }
            for b in bytes {
                asm.emit_u8(*b)?;
            }
            Ok(())
        }

        Kind::Alu { ext } => {
            let size = size_of(suffix, &ops);
            let base = ext * 8;
            match ops.as_slice() {
                [Operand::Imm { value, sym }, dst] => {
                    let rm = rm_of(asm, dst)?;
                    if size == Size::B {
                        emit_insn(asm, Insn::new(size, vec![0x80]).ext(ext).rm(rm).imm8(*value))
                    } else if sym.is_none() && (-128..=127).contains(value) {
                        emit_insn(asm, Insn::new(size, vec![0x83]).ext(ext).rm(rm).imm8(*value))
                    } else if size == Size::W {
                        emit_insn(asm, Insn::new(size, vec![0x81]).ext(ext).rm(rm).imm16(*value))
                    } else {
                        emit_insn(
                            asm,
                            Insn::new(size, vec![0x81])
                                .ext(ext)
                                .rm(rm)
                                .imm32(*value, sym.clone()),
                        )
                    }
                }
                [Operand::Reg(src), dst @ (Operand::Mem(_) | Operand::Reg(_))] => {
                    let rm = rm_of(asm, dst)?;
                    emit_insn(
                        asm,
                        Insn::new(size, vec![row(base, size)]).reg_field(*src).rm(rm),
                    )
                }
                [Operand::Mem(mem), Operand::Reg(dst)] => emit_insn(
                    asm,
                    Insn::new(size, vec![row(base + 2, size)])
                        .reg_field(*dst)
                        .rm(Rm::Mem(mem)),
                ),
                _ => Err(bad("unsupported combination")),
            }
        }

        Kind::Mov => {
            let size = size_of(suffix, &ops);
            match ops.as_slice() {
                [Operand::Imm { value, sym }, Operand::Reg(dst)] => match size {
                    Size::Q => {
                        let fits = i32::try_from(*value).is_ok();
                        if fits || sym.is_some() {
                            emit_insn(
                                asm,
                                Insn::new(size, vec![0xC7])
                                    .ext(0)
                                    .rm(Rm::Reg(*dst))
                                    .imm32(*value, sym.clone()),
                            )
                        } else {
                            // movabs form for a full 64-bit immediate
                            emit_mov_oi(
                                asm,
                                *dst,
                                Insn::new(size, vec![0xB8 + (dst.num & 7)]).imm64(*value, None),
                            )
                        }
                    }
                    Size::L => emit_mov_oi(
                        asm,
                        *dst,
                        Insn::new(size, vec![0xB8 + (dst.num & 7)]).imm32(*value, sym.clone()),
                    ),
                    Size::W => emit_mov_oi(
                        asm,
                        *dst,
                        Insn::new(size, vec![0xB8 + (dst.num & 7)]).imm16(*value),
                    ),
                    Size::B => emit_mov_oi(
                        asm,
                        *dst,
                        Insn::new(size, vec![0xB0 + (dst.num & 7)]).imm8(*value),
                    ),
                },
                [Operand::Imm { value, sym }, Operand::Mem(mem)] => {
                    let opcode = if size == Size::B { 0xC6 } else { 0xC7 };
                    let insn = Insn::new(size, vec![opcode]).ext(0).rm(Rm::Mem(mem));
                    let insn = match size {
                        Size::B => insn.imm8(*value),
                        Size::W => insn.imm16(*value),
                        _ => insn.imm32(*value, sym.clone()),
                    };
                    emit_insn(asm, insn)
                }
                [Operand::Reg(src), dst @ (Operand::Reg(_) | Operand::Mem(_))] => {
                    let rm = rm_of(asm, dst)?;
                    emit_insn(
                        asm,
                        Insn::new(size, vec![row(0x88, size)]).reg_field(*src).rm(rm),
                    )
                }
                [Operand::Mem(mem), Operand::Reg(dst)] => emit_insn(
                    asm,
                    Insn::new(size, vec![row(0x8A, size)])
                        .reg_field(*dst)
                        .rm(Rm::Mem(mem)),
                ),
                _ => Err(bad("unsupported combination")),
            }
        }

        Kind::Movabs => match ops.as_slice() {
            [Operand::Imm { value, sym }, Operand::Reg(dst)] => emit_mov_oi(
                asm,
                *dst,
                Insn::new(Size::Q, vec![0xB8 + (dst.num & 7)]).imm64(*value, sym.clone()),
            ),
            _ => Err(bad("expected $imm64, %reg")),
        },

        Kind::Lea => match ops.as_slice() {
            [Operand::Mem(mem), Operand::Reg(dst)] => {
                let size = size_of(suffix, &ops);
                emit_insn(
                    asm,
                    Insn::new(size, vec![0x8D]).reg_field(*dst).rm(Rm::Mem(mem)),
                )
            }
            _ => Err(bad("expected memory, %reg")),
        },

        Kind::Test => {
            let size = size_of(suffix, &ops);
            match ops.as_slice() {
                [Operand::Imm { value, .. }, dst] => {
                    let rm = rm_of(asm, dst)?;
                    let opcode = if size == Size::B { 0xF6 } else { 0xF7 };
                    let insn = Insn::new(size, vec![opcode]).ext(0).rm(rm);
                    let insn = match size {
                        Size::B => insn.imm8(*value),
                        Size::W => insn.imm16(*value),
                        _ => insn.imm32(*value, None),
                    };
                    emit_insn(asm, insn)
                }
                [Operand::Reg(src), dst] => {
                    let rm = rm_of(asm, dst)?;
                    emit_insn(
                        asm,
                        Insn::new(size, vec![row(0x84, size)]).reg_field(*src).rm(rm),
                    )
                }
                _ => Err(bad("unsupported combination")),
            }
        }

        Kind::Xchg => {
            let size = size_of(suffix, &ops);
            match ops.as_slice() {
                [Operand::Reg(src), dst] => {
                    let rm = rm_of(asm, dst)?;
                    emit_insn(
                        asm,
                        Insn::new(size, vec![row(0x86, size)]).reg_field(*src).rm(rm),
                    )
                }
                [Operand::Mem(mem), Operand::Reg(dst)] => emit_insn(
                    asm,
                    Insn::new(size, vec![row(0x86, size)])
                        .reg_field(*dst)
                        .rm(Rm::Mem(mem)),
                ),
                _ => Err(bad("unsupported combination")),
            }
        }

        Kind::Shift { ext } => {
            let size = size_of(suffix, &ops);
            match ops.as_slice() {
                [Operand::Imm { value, .. }, dst] => {
                    let rm = rm_of(asm, dst)?;
                    let opcode = if size == Size::B { 0xC0 } else { 0xC1 };
                    emit_insn(asm, Insn::new(size, vec![opcode]).ext(ext).rm(rm).imm8(*value))
                }
                [Operand::Reg(cl), dst] if cl.num == 1 && cl.size == Size::B => {
                    let rm = rm_of(asm, dst)?;
                    let opcode = if size == Size::B { 0xD2 } else { 0xD3 };
                    emit_insn(asm, Insn::new(size, vec![opcode]).ext(ext).rm(rm))
                }
                [dst] => {
                    // shift by one
                    let rm = rm_of(asm, dst)?;
                    let opcode = if size == Size::B { 0xD0 } else { 0xD1 };
                    emit_insn(asm, Insn::new(size, vec![opcode]).ext(ext).rm(rm))
                }
                _ => Err(bad("expected $imm/%cl and destination")),
            }
        }

        Kind::Unary { ext } => {
            let size = size_of(suffix, &ops);
            match ops.as_slice() {
                [dst] => {
                    let rm = rm_of(asm, dst)?;
                    let opcode = if size == Size::B { 0xF6 } else { 0xF7 };
                    emit_insn(asm, Insn::new(size, vec![opcode]).ext(ext).rm(rm))
                }
                _ => Err(bad("expected one operand")),
            }
        }

        Kind::Imul => {
            let size = size_of(suffix, &ops);
            match ops.as_slice() {
                [dst] => {
                    let rm = rm_of(asm, dst)?;
                    let opcode = if size == Size::B { 0xF6 } else { 0xF7 };
                    emit_insn(asm, Insn::new(size, vec![opcode]).ext(5).rm(rm))
                }
                [src, Operand::Reg(dst)] => {
                    let rm = rm_of(asm, src)?;
                    emit_insn(
                        asm,
                        Insn::new(size, vec![0x0F, 0xAF]).reg_field(*dst).rm(rm),
                    )
                }
                [Operand::Imm { value, .. }, src, Operand::Reg(dst)] => {
                    let rm = rm_of(asm, src)?;
                    if (-128..=127).contains(value) {
                        emit_insn(
                            asm,
                            Insn::new(size, vec![0x6B]).reg_field(*dst).rm(rm).imm8(*value),
                        )
                    } else {
                        emit_insn(
                            asm,
                            Insn::new(size, vec![0x69])
                                .reg_field(*dst)
                                .rm(rm)
                                .imm32(*value, None),
                        )
                    }
                }
                _ => Err(bad("unsupported combination")),
            }
        }

        Kind::IncDec { ext } => {
            let size = size_of(suffix, &ops);
            match ops.as_slice() {
                [dst] => {
                    let rm = rm_of(asm, dst)?;
                    let opcode = if size == Size::B { 0xFE } else { 0xFF };
                    emit_insn(asm, Insn::new(size, vec![opcode]).ext(ext).rm(rm))
                }
                _ => Err(bad("expected one operand")),
            }
        }

        Kind::Push => match ops.as_slice() {
            [Operand::Reg(reg)] => {
                if reg.num >= 8 {
                    asm.emit_u8(0x41)?;
                }
                asm.emit_u8(0x50 + (reg.num & 7))
            }
            [Operand::Imm { value, sym }] => {
                if sym.is_none() && (-128..=127).contains(value) {
                    asm.emit_u8(0x6A)?;
                    asm.emit_u8(*value as u8)
                } else {
                    asm.emit_u8(0x68)?;
                    let offset = asm.here();
                    if let Some(sym) = sym {
                        asm.reloc(offset, sym, RelocKind::Abs32S, *value);
                    }
                    asm.emit_u32(*value as u32)
                }
            }
            [Operand::Mem(mem)] => {
                emit_insn(asm, Insn::new(Size::L, vec![0xFF]).ext(6).rm(Rm::Mem(mem)))
            }
            _ => Err(bad("expected %reg, $imm or memory")),
        },

        Kind::Pop => match ops.as_slice() {
            [Operand::Reg(reg)] => {
                if reg.num >= 8 {
                    asm.emit_u8(0x41)?;
                }
                asm.emit_u8(0x58 + (reg.num & 7))
            }
            [Operand::Mem(mem)] => {
                emit_insn(asm, Insn::new(Size::L, vec![0x8F]).ext(0).rm(Rm::Mem(mem)))
            }
            _ => Err(bad("expected %reg or memory")),
        },

        Kind::Jmp => match ops.as_slice() {
            [Operand::Target(target)] => branch_target(asm, target, &[0xE9]),
            _ => Err(bad("expected a label")),
        },

        Kind::Call => match ops.as_slice() {
            [Operand::Target(target)] => branch_target(asm, target, &[0xE8]),
            _ => Err(bad("expected a label")),
        },

        Kind::Ret => match ops.as_slice() {
            [] => asm.emit_u8(0xC3),
            [Operand::Imm { value, .. }] => {
                asm.emit_u8(0xC2)?;
                asm.emit_u16(*value as u16)
            }
            _ => Err(bad("expected nothing or $imm16")),
        },

        Kind::Jcc(cc) => match ops.as_slice() {
            [Operand::Target(target)] => branch_target(asm, target, &[0x0F, 0x80 + cc]),
            _ => Err(bad("expected a label")),
        },

        Kind::Setcc(cc) => match ops.as_slice() {
            [dst] => {
                let rm = rm_of(asm, dst)?;
                emit_insn(asm, Insn::new(Size::B, vec![0x0F, 0x90 + cc]).ext(0).rm(rm))
            }
            _ => Err(bad("expected an 8-bit destination")),
        },

        Kind::Cmovcc(cc) => match ops.as_slice() {
            [src, Operand::Reg(dst)] => {
                let size = size_of(suffix, &ops);
                let rm = rm_of(asm, src)?;
                emit_insn(
                    asm,
                    Insn::new(size, vec![0x0F, 0x40 + cc]).reg_field(*dst).rm(rm),
                )
            }
            _ => Err(bad("expected source, %reg")),
        },

        Kind::MovExt { opcode, src, dst } => match ops.as_slice() {
            [src_op, Operand::Reg(dst_reg)] => {
                let rm = rm_of(asm, src_op)?;
                // Source width picks the opcode row; REX.W comes from dst
                let _ = src;
                let size = if dst == Size::Q || dst_reg.size == Size::Q {
                    Size::Q
                } else {
                    dst_reg.size
                };
                emit_insn(
                    asm,
                    Insn::new(size, vec![0x0F, opcode]).reg_field(*dst_reg).rm(rm),
                )
            }
            _ => Err(bad("expected source, %reg")),
        },

        Kind::Movslq => match ops.as_slice() {
            [src, Operand::Reg(dst)] => {
                let rm = rm_of(asm, src)?;
                emit_insn(asm, Insn::new(Size::Q, vec![0x63]).reg_field(*dst).rm(rm))
            }
            _ => Err(bad("expected source, %reg")),
        },

        Kind::RmToReg { prefix, opcode } => match ops.as_slice() {
            [src, Operand::Reg(dst)] => {
                let size = size_of(suffix, &ops);
                let rm = rm_of(asm, src)?;
                let mut insn = Insn::new(size, opcode.to_vec()).reg_field(*dst).rm(rm);
                if let Some(p) = prefix {
                    insn.prefixes.push(p);
                }
                emit_insn(asm, insn)
            }
            _ => Err(bad("expected source, %reg")),
        },

        Kind::RegToRm { opcode, imm_ext } => {
            let size = size_of(suffix, &ops);
            match ops.as_slice() {
                [Operand::Reg(src), dst] => {
                    let rm = rm_of(asm, dst)?;
                    emit_insn(
                        asm,
                        Insn::new(size, vec![0x0F, opcode]).reg_field(*src).rm(rm),
                    )
                }
                [Operand::Imm { value, .. }, dst] => match imm_ext {
                    Some(ext) => {
                        let rm = rm_of(asm, dst)?;
                        emit_insn(
                            asm,
                            Insn::new(size, vec![0x0F, 0xBA]).ext(ext).rm(rm).imm8(*value),
                        )
                    }
                    None => Err(bad("immediate form not available")),
                },
                _ => Err(bad("unsupported combination")),
            }
        }

        Kind::IntImm => match ops.as_slice() {
            [Operand::Imm { .. }] | [Operand::Target(_)] => {
                let value = match &ops[0] {
                    Operand::Imm { value, .. } => *value,
                    Operand::Target(text) => asm.eval(text, true)?.value,
                    _ => unreachable!(),
                };
                if value == 3 {
                    asm.emit_u8(0xCC)
                } else {
                    asm.emit_u8(0xCD)?;
                    asm.emit_u8(value as u8)
                }
            }
            _ => Err(bad("expected an interrupt number")),
        },

        Kind::Prefetch { ext } => match ops.as_slice() {
            [Operand::Mem(mem)] => emit_insn(
                asm,
                Insn::new(Size::L, vec![0x0F, 0x18]).ext(ext).rm(Rm::Mem(mem)),
            ),
            _ => Err(bad("expected a memory operand")),
        },

        Kind::Xbegin => match ops.as_slice() {
            [Operand::Target(target)] => branch_target(asm, target, &[0xC7, 0xF8]),
            _ => Err(bad("expected a label")),
        },

        Kind::Xabort => match ops.as_slice() {
            [Operand::Imm { value, .. }] => {
                asm.emit_u8(0xC6)?;
                asm.emit_u8(0xF8)?;
                asm.emit_u8(*value as u8)
            }
            _ => Err(bad("expected $imm8")),
        },

        Kind::Vex(op) => encode_vex(asm, mnemonic, op, &ops),
    }
}

/// MOV B8+r / B0+r forms select the register in the opcode byte; only REX.B
/// extends it.
fn emit_mov_oi(asm: &mut Assembler, dst: Reg, insn: Insn) -> AsmResult<()> {
    if insn.size == Size::W {
        asm.emit_u8(0x66)?;
    }
    let mut rex = 0x40u8;
    if insn.size == Size::Q {
        rex |= 0x08;
    }
    if dst.num >= 8 {
        rex |= 0x01;
    }
    if rex != 0x40 || dst.needs_rex {
        asm.emit_u8(rex)?;
    }
    for b in &insn.opcode {
        asm.emit_u8(*b)?;
    }
    if let Some((sym, kind, addend)) = &insn.imm_reloc {
        let offset = asm.here();
        asm.reloc(offset, sym, *kind, *addend);
    }
    asm.emit_bytes(&insn.imm)
}

/// Three-byte VEX prefix for the BMI families.
fn emit_vex(
    asm: &mut Assembler,
    map: u8,
    pp: u8,
    reg: Reg,
    vvvv: u8,
    rm: Rm,
    opcode: u8,
) -> AsmResult<()> {
    let (b_bit, x_bit) = match &rm {
        Rm::Reg(r) => (r.num >= 8, false),
        Rm::Mem(m) => (
            m.base.is_some_and(|b| b.num >= 8),
            m.index.is_some_and(|i| i.num >= 8),
        ),
    };
    asm.emit_u8(0xC4)?;
    let byte1 = (u8::from(reg.num < 8) << 7)
        | (u8::from(!x_bit) << 6)
        | (u8::from(!b_bit) << 5)
        | map;
    asm.emit_u8(byte1)?;
    // W=1 (64-bit), L=0
    let byte2 = 0x80 | ((!vvvv & 0xF) << 3) | pp;
    asm.emit_u8(byte2)?;
    asm.emit_u8(opcode)?;
    match rm {
        Rm::Reg(r) => asm.emit_u8(0xC0 | ((reg.num & 7) << 3) | (r.num & 7)),
        Rm::Mem(_) => Err(AsmError::syntax(
            asm.line_no,
            "memory operands are not supported for VEX instructions here",
        )),
    }
}

fn encode_vex(asm: &mut Assembler, mnemonic: &str, op: VexOp, ops: &[Operand]) -> AsmResult<()> {
    let line = asm.line_no;
    let bad = || AsmError::bad_operands(line, mnemonic, "unsupported combination".to_owned());
    let reg3 = |asm: &Assembler| -> AsmResult<(Reg, Reg, Reg)> {
        match ops {
            [a, b, c] => Ok((expect_reg(asm, a)?, expect_reg(asm, b)?, expect_reg(asm, c)?)),
            _ => Err(AsmError::bad_operands(
                line,
                mnemonic,
                "expected three operands".to_owned(),
            )),
        }
    };

    match op {
        // andn src2(rm), src1(vvvv), dst(reg)
        VexOp::Andn => {
            let (rm, vvvv, dst) = reg3(asm)?;
            emit_vex(asm, 2, 0, dst, vvvv.num, Rm::Reg(rm), 0xF2)
        }
        // bextr/bzhi ctrl(vvvv), src(rm), dst(reg)
        VexOp::Bextr => {
            let (vvvv, rm, dst) = reg3(asm)?;
            emit_vex(asm, 2, 0, dst, vvvv.num, Rm::Reg(rm), 0xF7)
        }
        VexOp::Bzhi => {
            let (vvvv, rm, dst) = reg3(asm)?;
            emit_vex(asm, 2, 0, dst, vvvv.num, Rm::Reg(rm), 0xF5)
        }
        // blsi/blsmsk/blsr src(rm), dst(vvvv)
        VexOp::Blsi | VexOp::Blsmsk | VexOp::Blsr => match ops {
            [src, dst] => {
                let rm = expect_reg(asm, src)?;
                let vvvv = expect_reg(asm, dst)?;
                let ext = match op {
                    VexOp::Blsr => 1,
                    VexOp::Blsmsk => 2,
                    _ => 3,
                };
                let fake_reg = Reg {
                    num: ext,
                    size: Size::Q,
                    needs_rex: false,
                };
                emit_vex(asm, 2, 0, fake_reg, vvvv.num, Rm::Reg(rm), 0xF3)
            }
            _ => Err(bad()),
        },
        // mulx/pdep/pext src2(rm), src1(vvvv), dst(reg)
        VexOp::Mulx => {
            let (rm, vvvv, dst) = reg3(asm)?;
            emit_vex(asm, 2, 3, dst, vvvv.num, Rm::Reg(rm), 0xF6)
        }
        VexOp::Pdep => {
            let (rm, vvvv, dst) = reg3(asm)?;
            emit_vex(asm, 2, 3, dst, vvvv.num, Rm::Reg(rm), 0xF5)
        }
        VexOp::Pext => {
            let (rm, vvvv, dst) = reg3(asm)?;
            emit_vex(asm, 2, 2, dst, vvvv.num, Rm::Reg(rm), 0xF5)
        }
        // sarx/shlx/shrx count(vvvv), src(rm), dst(reg)
        VexOp::Sarx => {
            let (vvvv, rm, dst) = reg3(asm)?;
            emit_vex(asm, 2, 2, dst, vvvv.num, Rm::Reg(rm), 0xF7)
        }
        VexOp::Shlx => {
            let (vvvv, rm, dst) = reg3(asm)?;
            emit_vex(asm, 2, 1, dst, vvvv.num, Rm::Reg(rm), 0xF7)
        }
        VexOp::Shrx => {
            let (vvvv, rm, dst) = reg3(asm)?;
            emit_vex(asm, 2, 3, dst, vvvv.num, Rm::Reg(rm), 0xF7)
        }
        // rorx $imm, src(rm), dst(reg)
        VexOp::Rorx => match ops {
            [Operand::Imm { value, .. }, src, dst] => {
                let rm = expect_reg(asm, src)?;
                let dst = expect_reg(asm, dst)?;
                emit_vex(asm, 3, 3, dst, 0, Rm::Reg(rm), 0xF0)?;
                asm.emit_u8(*value as u8)
            }
            _ => Err(bad()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble;
    use smallc_object::Arch;

    fn bytes(source: &str) -> Vec<u8> {
        let obj = assemble(source, Arch::X64).unwrap();
        obj.sections[0].data.clone()
    }

    #[test]
    fn test_mov_reg_reg() {
        assert_eq!(bytes("movq %rax, %rbx"), vec![0x48, 0x89, 0xC3]);
        assert_eq!(bytes("movl %eax, %ebx"), vec![0x89, 0xC3]);
        assert_eq!(bytes("movq %r8, %rax"), vec![0x4C, 0x89, 0xC0]);
    }

    #[test]
    fn test_mov_imm() {
        assert_eq!(
            bytes("movq $2, %rax"),
            vec![0x48, 0xC7, 0xC0, 2, 0, 0, 0]
        );
        assert_eq!(bytes("movl $1, %eax"), vec![0xB8, 1, 0, 0, 0]);
        // too wide for imm32: movabs form
        assert_eq!(
            bytes("movq $0x123456789A, %rax"),
            vec![0x48, 0xB8, 0x9A, 0x78, 0x56, 0x34, 0x12, 0, 0, 0]
        );
    }

    #[test]
    fn test_mov_mem_forms() {
        // movq -8(%rbp), %rax
        assert_eq!(bytes("movq -8(%rbp), %rax"), vec![0x48, 0x8B, 0x45, 0xF8]);
        // movq %rax, (%rdx)
        assert_eq!(bytes("movq %rax, (%rdx)"), vec![0x48, 0x89, 0x02]);
        // (%rsp) needs a SIB byte
        assert_eq!(bytes("movq (%rsp), %rdx"), vec![0x48, 0x8B, 0x14, 0x24]);
        // disp32
        assert_eq!(
            bytes("movq 512(%rbp), %rax"),
            vec![0x48, 0x8B, 0x85, 0, 2, 0, 0]
        );
    }

    #[test]
    fn test_sib_scaled_index() {
        assert_eq!(
            bytes("movq 8(%rbp,%rdx,4), %rax"),
            vec![0x48, 0x8B, 0x44, 0x95, 0x08]
        );
    }

    #[test]
    fn test_rip_relative_with_reloc() {
        let obj = assemble("movq g(%rip), %rax", Arch::X64).unwrap();
        assert_eq!(obj.sections[0].data, vec![0x48, 0x8B, 0x05, 0, 0, 0, 0]);
        assert_eq!(obj.relocs.len(), 1);
        let reloc = &obj.relocs[0];
        assert_eq!(reloc.kind, RelocKind::Pc32);
        assert_eq!(reloc.offset, 3);
        assert_eq!(reloc.addend, -4);
        assert_eq!(obj.symbols[reloc.symbol].name, "g");
    }

    #[test]
    fn test_imm_symbol_gets_abs32s() {
        let obj = assemble("movq $msg, %rax", Arch::X64).unwrap();
        assert_eq!(obj.sections[0].data, vec![0x48, 0xC7, 0xC0, 0, 0, 0, 0]);
        let reloc = &obj.relocs[0];
        assert_eq!(reloc.kind, RelocKind::Abs32S);
        assert_eq!(reloc.offset, 3);
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(bytes("pushq %rbp"), vec![0x55]);
        assert_eq!(bytes("pushq %r9"), vec![0x41, 0x51]);
        assert_eq!(bytes("popq %rbp"), vec![0x5D]);
        assert_eq!(bytes("popq %r12"), vec![0x41, 0x5C]);
    }

    #[test]
    fn test_alu_forms() {
        assert_eq!(bytes("addq %rdx, %rax"), vec![0x48, 0x01, 0xD0]);
        assert_eq!(bytes("subq %rax, %rdx"), vec![0x48, 0x29, 0xC2]);
        assert_eq!(bytes("xorq %rax, %rax"), vec![0x48, 0x31, 0xC0]);
        assert_eq!(bytes("cmpq %rax, %rdx"), vec![0x48, 0x39, 0xC2]);
        // short immediate uses the sign-extended imm8 form
        assert_eq!(bytes("addq $8, %rsp"), vec![0x48, 0x83, 0xC4, 0x08]);
        assert_eq!(
            bytes("subq $256, %rsp"),
            vec![0x48, 0x81, 0xEC, 0, 1, 0, 0]
        );
    }

    #[test]
    fn test_imul_and_div() {
        assert_eq!(bytes("imulq %rdx, %rax"), vec![0x48, 0x0F, 0xAF, 0xC2]);
        assert_eq!(bytes("idivq %rbx"), vec![0x48, 0xF7, 0xFB]);
        assert_eq!(bytes("cqo"), vec![0x48, 0x99]);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(bytes("shlq $3, %rax"), vec![0x48, 0xC1, 0xE0, 0x03]);
        assert_eq!(bytes("shlq %cl, %rax"), vec![0x48, 0xD3, 0xE0]);
        assert_eq!(bytes("shrq %cl, %rax"), vec![0x48, 0xD3, 0xE8]);
        assert_eq!(bytes("sarq $1, %rax"), vec![0x48, 0xC1, 0xF8, 0x01]);
    }

    #[test]
    fn test_unary_group() {
        assert_eq!(bytes("notq %rax"), vec![0x48, 0xF7, 0xD0]);
        assert_eq!(bytes("negq %rax"), vec![0x48, 0xF7, 0xD8]);
        assert_eq!(bytes("incq (%rax)"), vec![0x48, 0xFF, 0x00]);
        assert_eq!(bytes("decq (%rdx)"), vec![0x48, 0xFF, 0x0A]);
    }

    #[test]
    fn test_test_setcc_movzbq() {
        assert_eq!(bytes("testq %rax, %rax"), vec![0x48, 0x85, 0xC0]);
        assert_eq!(bytes("setne %al"), vec![0x0F, 0x95, 0xC0]);
        assert_eq!(bytes("sete %al"), vec![0x0F, 0x94, 0xC0]);
        assert_eq!(bytes("setz %al"), vec![0x0F, 0x94, 0xC0]);
        assert_eq!(bytes("movzbq %al, %rax"), vec![0x48, 0x0F, 0xB6, 0xC0]);
    }

    #[test]
    fn test_lea() {
        assert_eq!(bytes("leaq -8(%rbp), %rax"), vec![0x48, 0x8D, 0x45, 0xF8]);
    }

    #[test]
    fn test_local_branch_resolved_directly() {
        // jmp back over itself: E9 + rel32
        let code = bytes("L1:\n  nop\n  jmp L1\n");
        assert_eq!(code, vec![0x90, 0xE9, 0xFA, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_forward_local_branch() {
        let code = bytes("  jz L2\n  nop\nL2:\n  ret\n");
        // 0F 84 rel32(=1) 90 C3
        assert_eq!(code, vec![0x0F, 0x84, 1, 0, 0, 0, 0x90, 0xC3]);
    }

    #[test]
    fn test_external_call_reloc() {
        let obj = assemble("  call putchar\n  ret\n", Arch::X64).unwrap();
        assert_eq!(obj.sections[0].data, vec![0xE8, 0, 0, 0, 0, 0xC3]);
        let reloc = &obj.relocs[0];
        assert_eq!(reloc.kind, RelocKind::Pc32);
        assert_eq!(reloc.offset, 1);
        assert_eq!(reloc.addend, -4);
    }

    #[test]
    fn test_cmov_and_bit_ops() {
        assert_eq!(bytes("cmovge %rdx, %rax"), vec![0x48, 0x0F, 0x4D, 0xC2]);
        assert_eq!(bytes("popcntq %rax, %rbx"), vec![0xF3, 0x48, 0x0F, 0xB8, 0xD8]);
        assert_eq!(bytes("bsfq %rax, %rbx"), vec![0x48, 0x0F, 0xBC, 0xD8]);
        assert_eq!(bytes("btq $3, %rax"), vec![0x48, 0x0F, 0xBA, 0xE0, 0x03]);
    }

    #[test]
    fn test_string_ops_with_rep() {
        assert_eq!(bytes("rep movsb"), vec![0xF3, 0xA4]);
        assert_eq!(bytes("rep stosq"), vec![0xF3, 0x48, 0xAB]);
        assert_eq!(bytes("repne scasb"), vec![0xF2, 0xAE]);
    }

    #[test]
    fn test_system_instructions() {
        assert_eq!(bytes("syscall"), vec![0x0F, 0x05]);
        assert_eq!(bytes("cpuid"), vec![0x0F, 0xA2]);
        assert_eq!(bytes("mfence"), vec![0x0F, 0xAE, 0xF0]);
        assert_eq!(bytes("endbr64"), vec![0xF3, 0x0F, 0x1E, 0xFA]);
        assert_eq!(bytes("int $3"), vec![0xCC]);
        assert_eq!(bytes("int $0x80"), vec![0xCD, 0x80]);
    }

    #[test]
    fn test_tsx() {
        assert_eq!(bytes("xtest"), vec![0x0F, 0x01, 0xD6]);
        assert_eq!(bytes("xend"), vec![0x0F, 0x01, 0xD5]);
        assert_eq!(bytes("xabort $1"), vec![0xC6, 0xF8, 0x01]);
        // xbegin to next instruction
        assert_eq!(bytes("xbegin L1\nL1:"), vec![0xC7, 0xF8, 0, 0, 0, 0]);
    }

    #[test]
    fn test_bmi_vex() {
        // andn %rax, %rbx, %rcx: vvvv=rbx -> ~3 in VEX byte 2
        assert_eq!(
            bytes("andn %rax, %rbx, %rcx"),
            vec![0xC4, 0xE2, 0xE0, 0xF2, 0xC8]
        );
        // shlx %rbx, %rax, %rcx: pp=66
        assert_eq!(
            bytes("shlx %rbx, %rax, %rcx"),
            vec![0xC4, 0xE2, 0xE1, 0xF7, 0xC8]
        );
    }

    #[test]
    fn test_pass_widths_stable_with_forward_refs() {
        // The branch width must not depend on whether the label is known yet
        let forward = bytes("  jmp L9\n  nop\nL9:\n  ret\n");
        let backward = bytes("L9:\n  jmp L9\n  nop\n  ret\n");
        assert_eq!(forward.len(), backward.len() + 0); // both jmps are rel32
    }

    #[test]
    fn test_unknown_register() {
        let err = assemble("movq %rqq, %rax", Arch::X64).unwrap_err();
        assert!(matches!(err, AsmError::Syntax { .. }));
    }
}
