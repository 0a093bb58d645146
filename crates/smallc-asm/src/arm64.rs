//! AArch64 instruction encoding.
//!
//! Every instruction is one 4-byte little-endian word composed by OR-ing
//! register and immediate fields into a base pattern. Aliases encode through
//! their underlying instructions (`mov` via ORR/ADD, `cmp` via SUBS,
//! `cset` via CSINC, `neg` via SUB, `mvn` via ORN, shifts by constant via
//! UBFM/SBFM).

use crate::assembler::Assembler;
use crate::error::{AsmError, AsmResult};
use smallc_object::RelocKind;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Reg {
    num: u8,
    /// 32-bit (wN) register
    w: bool,
    /// r31 names the stack pointer rather than the zero register
    sp: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum MemMode {
    Offset,
    PreIndex,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Reg(Reg),
    Imm(i64),
    Mem {
        base: Reg,
        offset: i64,
        lo12: Option<String>,
        mode: MemMode,
    },
    /// `:lo12:sym` outside a memory operand (ADD immediate)
    Lo12(String),
    /// Label, symbol or condition name
    Target(String),
}

fn parse_reg(name: &str) -> Option<Reg> {
    match name {
        "sp" => {
            return Some(Reg {
                num: 31,
                w: false,
                sp: true,
            })
        }
        "wsp" => {
            return Some(Reg {
                num: 31,
                w: true,
                sp: true,
            })
        }
        "xzr" => {
            return Some(Reg {
                num: 31,
                w: false,
                sp: false,
            })
        }
        "wzr" => {
            return Some(Reg {
                num: 31,
                w: true,
                sp: false,
            })
        }
        "fp" => {
            return Some(Reg {
                num: 29,
                w: false,
                sp: false,
            })
        }
        "lr" => {
            return Some(Reg {
                num: 30,
                w: false,
                sp: false,
            })
        }
        _ => {}
    }
    let (w, digits) = if let Some(rest) = name.strip_prefix('x') {
        (false, rest)
    } else if let Some(rest) = name.strip_prefix('w') {
        (true, rest)
    } else {
        return None;
    };
    let num: u8 = digits.parse().ok()?;
    (num <= 30).then_some(Reg { num, w, sp: false })
}

fn cond_code(name: &str) -> Option<u8> {
    let code = match name {
        "eq" => 0,
        "ne" => 1,
        "cs" | "hs" => 2,
        "cc" | "lo" => 3,
        "mi" => 4,
        "pl" => 5,
        "vs" => 6,
        "vc" => 7,
        "hi" => 8,
        "ls" => 9,
        "ge" => 10,
        "lt" => 11,
        "gt" => 12,
        "le" => 13,
        "al" => 14,
        _ => return None,
    };
    Some(code)
}

fn parse_operand(asm: &Assembler, text: &str) -> AsmResult<Operand> {
    let line = asm.line_no;
    if let Some(imm) = text.strip_prefix('#') {
        return Ok(Operand::Imm(asm.eval(imm, true)?.value));
    }
    if let Some(sym) = text.strip_prefix(":lo12:") {
        return Ok(Operand::Lo12(sym.to_owned()));
    }
    if text.starts_with('[') {
        let pre_index = text.ends_with('!');
        let inner = text
            .trim_end_matches('!')
            .strip_prefix('[')
            .and_then(|t| t.strip_suffix(']'))
            .ok_or_else(|| AsmError::syntax(line, "malformed memory operand"))?;
        let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
        let base = parse_reg(parts[0])
            .ok_or_else(|| AsmError::syntax(line, format!("bad base register '{}'", parts[0])))?;
        let mut offset = 0;
        let mut lo12 = None;
        if let Some(second) = parts.get(1) {
            if let Some(sym) = second.strip_prefix(":lo12:") {
                lo12 = Some(sym.to_owned());
            } else if let Some(imm) = second.strip_prefix('#') {
                offset = asm.eval(imm, true)?.value;
            } else {
                return Err(AsmError::syntax(
                    line,
                    format!("bad memory offset '{second}'"),
                ));
            }
        }
        return Ok(Operand::Mem {
            base,
            offset,
            lo12,
            mode: if pre_index {
                MemMode::PreIndex
            } else {
                MemMode::Offset
            },
        });
    }
    if let Some(reg) = parse_reg(text) {
        return Ok(Operand::Reg(reg));
    }
    Ok(Operand::Target(text.to_owned()))
}

/// sf bit for a destination register
fn sf(reg: Reg) -> u32 {
    if reg.w {
        0
    } else {
        1 << 31
    }
}

fn rd(reg: Reg) -> u32 {
    reg.num as u32
}

fn rn(reg: Reg) -> u32 {
    (reg.num as u32) << 5
}

fn rm(reg: Reg) -> u32 {
    (reg.num as u32) << 16
}

fn ra(reg: Reg) -> u32 {
    (reg.num as u32) << 10
}

const ZR: Reg = Reg {
    num: 31,
    w: false,
    sp: false,
};

// ============================================================================
// Entry point
// ============================================================================

pub fn encode(asm: &mut Assembler, mnemonic: &str, operand_text: &[String]) -> AsmResult<()> {
    let ops: Vec<Operand> = operand_text
        .iter()
        .map(|t| parse_operand(asm, t))
        .collect::<AsmResult<_>>()?;
    let line = asm.line_no;
    let bad = |msg: &str| AsmError::bad_operands(line, mnemonic, msg.to_owned());

    // Conditional branches: b.eq, b.ne, ...
    if let Some(cond_name) = mnemonic.strip_prefix("b.") {
        let cond = cond_code(cond_name)
            .ok_or_else(|| AsmError::syntax(line, format!("unknown condition '{cond_name}'")))?;
        let [Operand::Target(target)] = ops.as_slice() else {
            return Err(bad("expected a label"));
        };
        let imm19 = branch19(asm, target)?;
        return word(asm, 0x5400_0000 | (imm19 << 5) | cond as u32);
    }

    match mnemonic {
        "nop" => word(asm, 0xD503_201F),
        "ret" => match ops.as_slice() {
            [] => word(asm, 0xD65F_03C0),
            [Operand::Reg(reg)] => word(asm, 0xD65F_0000 | rn(*reg)),
            _ => Err(bad("expected nothing or a register")),
        },
        "svc" => match ops.as_slice() {
            [Operand::Imm(imm)] => word(asm, 0xD400_0001 | ((*imm as u32 & 0xFFFF) << 5)),
            _ => Err(bad("expected #imm")),
        },
        "brk" => match ops.as_slice() {
            [Operand::Imm(imm)] => word(asm, 0xD420_0000 | ((*imm as u32 & 0xFFFF) << 5)),
            _ => Err(bad("expected #imm")),
        },

        "b" | "bl" => match ops.as_slice() {
            [Operand::Target(target)] => {
                let base = if mnemonic == "bl" {
                    0x9400_0000
                } else {
                    0x1400_0000
                };
                match section_local(asm, target) {
                    Some(offset) => {
                        let rel = offset as i64 - asm.here() as i64;
                        word(asm, base | imm26(asm, rel, target)?)
                    }
                    None => {
                        let kind = if mnemonic == "bl" {
                            RelocKind::Call26
                        } else {
                            RelocKind::Jump26
                        };
                        let offset = asm.here();
                        asm.reloc(offset, target, kind, 0);
                        word(asm, base)
                    }
                }
            }
            _ => Err(bad("expected a label")),
        },

        "cbz" | "cbnz" => match ops.as_slice() {
            [Operand::Reg(rt), Operand::Target(target)] => {
                let imm19 = branch19(asm, target)?;
                let base = if mnemonic == "cbz" {
                    0x3400_0000
                } else {
                    0x3500_0000
                };
                word(asm, sf(*rt) | base | (imm19 << 5) | rd(*rt))
            }
            _ => Err(bad("expected a register and a label")),
        },

        "adrp" => match ops.as_slice() {
            [Operand::Reg(dst), Operand::Target(sym)] => {
                let offset = asm.here();
                asm.reloc(offset, sym, RelocKind::AdrPrelPgHi21, 0);
                word(asm, 0x9000_0000 | rd(*dst))
            }
            _ => Err(bad("expected a register and a symbol")),
        },

        "mov" => match ops.as_slice() {
            [Operand::Reg(dst), Operand::Reg(src)] => {
                if dst.sp || src.sp {
                    // moves to or from sp go through ADD #0
                    word(asm, sf(*dst) | 0x1100_0000 | rn(*src) | rd(*dst))
                } else {
                    word(asm, sf(*dst) | 0x2A00_03E0 | rm(*src) | rd(*dst))
                }
            }
            [Operand::Reg(dst), Operand::Imm(value)] => mov_imm(asm, *dst, *value),
            _ => Err(bad("expected register or immediate source")),
        },
        "movz" | "movn" | "movk" => match ops.as_slice() {
            [Operand::Reg(dst), Operand::Imm(value)] => {
                if !(0..=0xFFFF).contains(value) {
                    return Err(AsmError::ImmOutOfRange {
                        line,
                        message: format!("{mnemonic} immediate {value} exceeds 16 bits"),
                    });
                }
                let base = match mnemonic {
                    "movz" => 0x5280_0000,
                    "movn" => 0x1280_0000,
                    _ => 0x7280_0000,
                };
                word(
                    asm,
                    sf(*dst) | base | ((*value as u32 & 0xFFFF) << 5) | rd(*dst),
                )
            }
            _ => Err(bad("expected a register and #imm16")),
        },

        "add" | "sub" | "adds" | "subs" => {
            let (imm_base, reg_base) = match mnemonic {
                "add" => (0x1100_0000u32, 0x0B00_0000u32),
                "adds" => (0x3100_0000, 0x2B00_0000),
                "sub" => (0x5100_0000, 0x4B00_0000),
                _ => (0x7100_0000, 0x6B00_0000),
            };
            match ops.as_slice() {
                [Operand::Reg(dst), Operand::Reg(src), Operand::Imm(imm)] => {
                    let imm12 = imm12_field(asm, *imm)?;
                    word(asm, sf(*dst) | imm_base | imm12 | rn(*src) | rd(*dst))
                }
                [Operand::Reg(dst), Operand::Reg(src), Operand::Lo12(sym)] => {
                    if mnemonic != "add" {
                        return Err(bad(":lo12: only combines with add"));
                    }
                    let offset = asm.here();
                    asm.reloc(offset, sym, RelocKind::AddAbsLo12Nc, 0);
                    word(asm, sf(*dst) | imm_base | rn(*src) | rd(*dst))
                }
                [Operand::Reg(dst), Operand::Reg(src1), Operand::Reg(src2)] => {
                    word(asm, sf(*dst) | reg_base | rm(*src2) | rn(*src1) | rd(*dst))
                }
                _ => Err(bad("expected rd, rn, (rm|#imm)")),
            }
        }

        "cmp" | "cmn" => {
            let (imm_base, reg_base) = if mnemonic == "cmp" {
                (0x7100_0000u32, 0x6B00_0000u32)
            } else {
                (0x3100_0000, 0x2B00_0000)
            };
            match ops.as_slice() {
                [Operand::Reg(src), Operand::Imm(imm)] => {
                    let imm12 = imm12_field(asm, *imm)?;
                    word(asm, sf(*src) | imm_base | imm12 | rn(*src) | 31)
                }
                [Operand::Reg(src1), Operand::Reg(src2)] => {
                    word(asm, sf(*src1) | reg_base | rm(*src2) | rn(*src1) | 31)
                }
                _ => Err(bad("expected rn, (rm|#imm)")),
            }
        }

        "and" | "orr" | "eor" | "orn" | "ands" => {
            let base = match mnemonic {
                "and" => 0x0A00_0000u32,
                "orr" => 0x2A00_0000,
                "orn" => 0x2A20_0000,
                "eor" => 0x4A00_0000,
                _ => 0x6A00_0000,
            };
            match ops.as_slice() {
                [Operand::Reg(dst), Operand::Reg(src1), Operand::Reg(src2)] => {
                    word(asm, sf(*dst) | base | rm(*src2) | rn(*src1) | rd(*dst))
                }
                _ => Err(bad("expected rd, rn, rm")),
            }
        }
        "tst" => match ops.as_slice() {
            [Operand::Reg(src1), Operand::Reg(src2)] => {
                word(asm, sf(*src1) | 0x6A00_0000 | rm(*src2) | rn(*src1) | 31)
            }
            _ => Err(bad("expected rn, rm")),
        },
        "mvn" => match ops.as_slice() {
            [Operand::Reg(dst), Operand::Reg(src)] => {
                word(asm, sf(*dst) | 0x2A20_0000 | rm(*src) | rn(ZR) | rd(*dst))
            }
            _ => Err(bad("expected rd, rm")),
        },
        "neg" => match ops.as_slice() {
            [Operand::Reg(dst), Operand::Reg(src)] => {
                word(asm, sf(*dst) | 0x4B00_0000 | rm(*src) | rn(ZR) | rd(*dst))
            }
            _ => Err(bad("expected rd, rm")),
        },

        "mul" => match ops.as_slice() {
            [Operand::Reg(dst), Operand::Reg(src1), Operand::Reg(src2)] => word(
                asm,
                sf(*dst) | 0x1B00_7C00 | rm(*src2) | rn(*src1) | rd(*dst),
            ),
            _ => Err(bad("expected rd, rn, rm")),
        },
        "madd" | "msub" => match ops.as_slice() {
            [Operand::Reg(dst), Operand::Reg(src1), Operand::Reg(src2), Operand::Reg(acc)] => {
                let base = if mnemonic == "madd" {
                    0x1B00_0000
                } else {
                    0x1B00_8000
                };
                word(
                    asm,
                    sf(*dst) | base | rm(*src2) | ra(*acc) | rn(*src1) | rd(*dst),
                )
            }
            _ => Err(bad("expected rd, rn, rm, ra")),
        },
        "sdiv" | "udiv" => match ops.as_slice() {
            [Operand::Reg(dst), Operand::Reg(src1), Operand::Reg(src2)] => {
                let base = if mnemonic == "sdiv" {
                    0x1AC0_0C00
                } else {
                    0x1AC0_0800
                };
                word(asm, sf(*dst) | base | rm(*src2) | rn(*src1) | rd(*dst))
            }
            _ => Err(bad("expected rd, rn, rm")),
        },

        "lsl" | "lsr" | "asr" => match ops.as_slice() {
            [Operand::Reg(dst), Operand::Reg(src), Operand::Reg(amount)] => {
                let base = match mnemonic {
                    "lsl" => 0x1AC0_2000,
                    "lsr" => 0x1AC0_2400,
                    _ => 0x1AC0_2800,
                };
                word(asm, sf(*dst) | base | rm(*amount) | rn(*src) | rd(*dst))
            }
            [Operand::Reg(dst), Operand::Reg(src), Operand::Imm(shift)] => {
                let bits = if dst.w { 32 } else { 64 };
                if !(0..bits).contains(shift) {
                    return Err(AsmError::ImmOutOfRange {
                        line,
                        message: format!("shift {shift} out of range"),
                    });
                }
                let shift = *shift as u32;
                // lsl: UBFM rd, rn, #(-shift mod bits), #(bits-1-shift)
                // lsr/asr: xBFM rd, rn, #shift, #(bits-1)
                let (base, immr, imms) = match mnemonic {
                    "lsl" => (
                        0x5300_0000u32,
                        (bits as u32 - shift) % bits as u32,
                        bits as u32 - 1 - shift,
                    ),
                    "lsr" => (0x5300_0000, shift, bits as u32 - 1),
                    _ => (0x1300_0000, shift, bits as u32 - 1),
                };
                let n = if dst.w { 0 } else { 1 << 22 };
                word(
                    asm,
                    sf(*dst) | base | n | (immr << 16) | (imms << 10) | rn(*src) | rd(*dst),
                )
            }
            _ => Err(bad("expected rd, rn, (rm|#imm)")),
        },

        "cset" => match ops.as_slice() {
            [Operand::Reg(dst), Operand::Target(cond_name)] => {
                let cond = cond_code(cond_name).ok_or_else(|| {
                    AsmError::syntax(line, format!("unknown condition '{cond_name}'"))
                })?;
                // CSINC rd, xzr, xzr, inverted cond
                let inv = (cond ^ 1) as u32;
                word(
                    asm,
                    sf(*dst) | 0x1A80_0400 | rm(ZR) | (inv << 12) | rn(ZR) | rd(*dst),
                )
            }
            _ => Err(bad("expected rd, cond")),
        },

        "ldr" | "str" | "ldur" | "stur" => load_store(asm, mnemonic, &ops),
        "ldp" | "stp" => load_store_pair(asm, mnemonic, &ops),

        _ => Err(AsmError::UnknownMnemonic {
            line,
            mnemonic: mnemonic.to_owned(),
        }),
    }
}

fn word(asm: &mut Assembler, value: u32) -> AsmResult<()> {
    asm.emit_u32(value)
}

fn mov_imm(asm: &mut Assembler, dst: Reg, value: i64) -> AsmResult<()> {
    if (0..=0xFFFF).contains(&value) {
        return word(
            asm,
            sf(dst) | 0x5280_0000 | ((value as u32 & 0xFFFF) << 5) | rd(dst),
        );
    }
    let inverted = !value;
    if (0..=0xFFFF).contains(&inverted) {
        return word(
            asm,
            sf(dst) | 0x1280_0000 | ((inverted as u32 & 0xFFFF) << 5) | rd(dst),
        );
    }
    Err(AsmError::ImmOutOfRange {
        line: asm.line_no,
        message: format!("mov immediate {value} needs a movz/movk sequence"),
    })
}

fn imm12_field(asm: &Assembler, imm: i64) -> AsmResult<u32> {
    if !(0..=4095).contains(&imm) {
        return Err(AsmError::ImmOutOfRange {
            line: asm.line_no,
            message: format!("immediate {imm} exceeds 12 bits"),
        });
    }
    Ok((imm as u32) << 10)
}

/// Label lookup restricted to the current section.
fn section_local(asm: &Assembler, target: &str) -> Option<u64> {
    match asm.lookup_label(target) {
        Some((section, offset)) if section == asm.current_section() => Some(offset),
        _ => None,
    }
}

fn imm26(asm: &Assembler, rel: i64, target: &str) -> AsmResult<u32> {
    if rel % 4 != 0 || !(-(1 << 27)..(1 << 27)).contains(&rel) {
        return Err(AsmError::BranchOutOfRange {
            line: asm.line_no,
            name: target.to_owned(),
        });
    }
    Ok(((rel >> 2) as u32) & 0x03FF_FFFF)
}

/// 19-bit branch field for CBZ/CBNZ/B.cond; the target must be placed in the
/// current section (there is no relocation kind for these here).
fn branch19(asm: &Assembler, target: &str) -> AsmResult<u32> {
    let Some(offset) = section_local(asm, target) else {
        if asm.pass == 1 {
            return Ok(0);
        }
        return Err(AsmError::UndefinedBranchTarget {
            line: asm.line_no,
            name: target.to_owned(),
        });
    };
    let rel = offset as i64 - asm.here() as i64;
    if rel % 4 != 0 || !(-(1 << 20)..(1 << 20)).contains(&rel) {
        return Err(AsmError::BranchOutOfRange {
            line: asm.line_no,
            name: target.to_owned(),
        });
    }
    Ok(((rel >> 2) as u32) & 0x7_FFFF)
}

fn load_store(asm: &mut Assembler, mnemonic: &str, ops: &[Operand]) -> AsmResult<()> {
    let line = asm.line_no;
    let bad = |msg: &str| AsmError::bad_operands(line, mnemonic, msg.to_owned());
    let is_load = mnemonic.starts_with("ld");
    let force_unscaled = mnemonic.ends_with("ur");

    match ops {
        // [base] / [base, #imm] / [base, :lo12:sym] / pre-index
        [Operand::Reg(rt), Operand::Mem {
            base,
            offset,
            lo12,
            mode,
        }] => {
            let scale: i64 = if rt.w { 4 } else { 8 };
            let size_base: u32 = if rt.w { 0xB800_0000 } else { 0xF800_0000 };
            let opc: u32 = if is_load { 0x0040_0000 } else { 0 };

            if let Some(sym) = lo12 {
                if rt.w || *mode != MemMode::Offset {
                    return Err(bad(":lo12: needs a 64-bit unscaled form"));
                }
                let at = asm.here();
                asm.reloc(at, sym, RelocKind::Ldst64AbsLo12Nc, 0);
                // LDR/STR unsigned offset, field patched by the linker
                return word(asm, size_base | 0x0100_0000 | opc | rn(*base) | rd(*rt));
            }

            match mode {
                MemMode::Offset => {
                    if !force_unscaled && *offset >= 0 && offset % scale == 0
                        && offset / scale <= 0xFFF
                    {
                        // unsigned scaled offset
                        let imm = ((offset / scale) as u32) << 10;
                        word(asm, size_base | 0x0100_0000 | opc | imm | rn(*base) | rd(*rt))
                    } else if (-256..=255).contains(offset) {
                        // unscaled 9-bit signed (LDUR/STUR)
                        let imm = ((*offset as u32) & 0x1FF) << 12;
                        word(asm, size_base | opc | imm | rn(*base) | rd(*rt))
                    } else {
                        Err(AsmError::ImmOutOfRange {
                            line,
                            message: format!("load/store offset {offset}"),
                        })
                    }
                }
                MemMode::PreIndex => {
                    let imm = imm9(asm, *offset)?;
                    word(
                        asm,
                        size_base | opc | imm | 0x0000_0C00 | rn(*base) | rd(*rt),
                    )
                }
            }
        }
        // post-index: rt, [base], #imm
        [Operand::Reg(rt), Operand::Mem {
            base,
            offset: 0,
            lo12: None,
            mode: MemMode::Offset,
        }, Operand::Imm(post)] => {
            let size_base: u32 = if rt.w { 0xB800_0000 } else { 0xF800_0000 };
            let opc: u32 = if is_load { 0x0040_0000 } else { 0 };
            let imm = imm9(asm, *post)?;
            word(
                asm,
                size_base | opc | imm | 0x0000_0400 | rn(*base) | rd(*rt),
            )
        }
        _ => Err(bad("unsupported addressing form")),
    }
}

fn load_store_pair(asm: &mut Assembler, mnemonic: &str, ops: &[Operand]) -> AsmResult<()> {
    let line = asm.line_no;
    let bad = |msg: &str| AsmError::bad_operands(line, mnemonic, msg.to_owned());
    let is_load = mnemonic == "ldp";

    let imm7 = |asm: &Assembler, offset: i64| -> AsmResult<u32> {
        if offset % 8 != 0 || !(-512..=504).contains(&offset) {
            return Err(AsmError::ImmOutOfRange {
                line: asm.line_no,
                message: format!("pair offset {offset}"),
            });
        }
        Ok((((offset / 8) as u32) & 0x7F) << 15)
    };

    match ops {
        [Operand::Reg(rt), Operand::Reg(rt2), Operand::Mem {
            base,
            offset,
            lo12: None,
            mode,
        }] => {
            let (base_word, offset_bits) = match mode {
                MemMode::PreIndex => (0xA980_0000u32, imm7(asm, *offset)?),
                MemMode::Offset => (0xA900_0000, imm7(asm, *offset)?),
            };
            let opc = if is_load { 0x0040_0000 } else { 0 };
            word(
                asm,
                base_word | opc | offset_bits | ((rt2.num as u32) << 10) | rn(*base) | rd(*rt),
            )
        }
        // post-index: rt, rt2, [base], #imm
        [Operand::Reg(rt), Operand::Reg(rt2), Operand::Mem {
            base,
            offset: 0,
            lo12: None,
            mode: MemMode::Offset,
        }, Operand::Imm(post)] => {
            let opc = if is_load { 0x0040_0000 } else { 0 };
            word(
                asm,
                0xA880_0000 | opc | imm7(asm, *post)? | ((rt2.num as u32) << 10) | rn(*base)
                    | rd(*rt),
            )
        }
        _ => Err(bad("unsupported addressing form")),
    }
}

fn imm9(asm: &Assembler, offset: i64) -> AsmResult<u32> {
    if !(-256..=255).contains(&offset) {
        return Err(AsmError::ImmOutOfRange {
            line: asm.line_no,
            message: format!("index offset {offset} exceeds 9 bits"),
        });
    }
    Ok(((offset as u32) & 0x1FF) << 12)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble;
    use smallc_object::Arch;

    fn words(source: &str) -> Vec<u32> {
        let obj = assemble(source, Arch::Arm64).unwrap();
        obj.sections[0]
            .data
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_ret_nop_svc() {
        assert_eq!(words("ret"), vec![0xD65F03C0]);
        assert_eq!(words("nop"), vec![0xD503201F]);
        assert_eq!(words("svc #0"), vec![0xD4000001]);
    }

    #[test]
    fn test_mov_register_forms() {
        // mov x1, x2 -> orr x1, xzr, x2
        assert_eq!(words("mov x1, x2"), vec![0xAA0203E1]);
        // mov x29, sp -> add x29, sp, #0
        assert_eq!(words("mov x29, sp"), vec![0x910003FD]);
        // mov sp, x29 -> add sp, x29, #0
        assert_eq!(words("mov sp, x29"), vec![0x910003BF]);
    }

    #[test]
    fn test_mov_immediates() {
        // movz
        assert_eq!(words("mov x0, #0"), vec![0xD2800000]);
        assert_eq!(words("mov x0, #7"), vec![0xD28000E0]);
        // movn for small negatives
        assert_eq!(words("mov x0, #-1"), vec![0x92800000]);
        assert_eq!(words("mov x0, #-5"), vec![0x92800080]);
    }

    #[test]
    fn test_add_sub() {
        assert_eq!(words("add x0, x1, x2"), vec![0x8B020020]);
        assert_eq!(words("add x0, x1, #16"), vec![0x91004020]);
        assert_eq!(words("sub sp, sp, #32"), vec![0xD10083FF]);
        assert_eq!(words("sub x0, x1, x2"), vec![0xCB020020]);
    }

    #[test]
    fn test_cmp_cset() {
        // cmp x1, x0 -> subs xzr, x1, x0
        assert_eq!(words("cmp x1, x0"), vec![0xEB00003F]);
        assert_eq!(words("cmp x0, #0"), vec![0xF100001F]);
        // cset x0, ne -> csinc x0, xzr, xzr, eq
        assert_eq!(words("cset x0, ne"), vec![0x9A9F07E0]);
        assert_eq!(words("cset x0, le"), vec![0x9A9FC7E0]);
    }

    #[test]
    fn test_mul_div_msub() {
        assert_eq!(words("mul x0, x1, x0"), vec![0x9B007C20]);
        assert_eq!(words("sdiv x0, x1, x0"), vec![0x9AC00C20]);
        assert_eq!(words("msub x0, x2, x0, x1"), vec![0x9B008440]);
    }

    #[test]
    fn test_logical_and_shifts() {
        assert_eq!(words("and x0, x1, x0"), vec![0x8A000020]);
        assert_eq!(words("orr x0, x1, x0"), vec![0xAA000020]);
        assert_eq!(words("eor x0, x1, x0"), vec![0xCA000020]);
        assert_eq!(words("mvn x0, x0"), vec![0xAA2003E0]);
        assert_eq!(words("neg x0, x0"), vec![0xCB0003E0]);
        // register shifts
        assert_eq!(words("lsl x0, x0, x2"), vec![0x9AC22000]);
        assert_eq!(words("lsr x0, x0, x2"), vec![0x9AC22400]);
        // constant shift: lsl x0, x0, #3 == ubfm x0, x0, #61, #60
        assert_eq!(words("lsl x0, x0, #3"), vec![0xD37DF000]);
    }

    #[test]
    fn test_load_store_forms() {
        // scaled unsigned offset
        assert_eq!(words("ldr x0, [x0]"), vec![0xF9400000]);
        assert_eq!(words("ldr x0, [x29, #16]"), vec![0xF9400BA0]);
        assert_eq!(words("str x0, [x1]"), vec![0xF9000020]);
        // negative offset falls back to unscaled ldur/stur
        assert_eq!(words("ldr x0, [x29, #-16]"), vec![0xF85F03A0]);
        assert_eq!(words("str x0, [x29, #-8]"), vec![0xF81F83A0]);
        // pre/post index
        assert_eq!(words("str x0, [sp, #-16]!"), vec![0xF81F0FE0]);
        assert_eq!(words("ldr x1, [sp], #16"), vec![0xF84107E1]);
    }

    #[test]
    fn test_pair_forms() {
        assert_eq!(words("stp x29, x30, [sp, #-16]!"), vec![0xA9BF7BFD]);
        assert_eq!(words("ldp x29, x30, [sp], #16"), vec![0xA8C17BFD]);
    }

    #[test]
    fn test_branches_local() {
        // b back to itself
        assert_eq!(words("L1:\n  b L1"), vec![0x14000000]);
        // forward cbz over one instruction
        let code = words("  cbz x0, L2\n  nop\nL2:\n  ret");
        assert_eq!(code[0], 0xB4000040);
    }

    #[test]
    fn test_bl_external_gets_call26() {
        let obj = assemble("  bl putchar\n  ret", Arch::Arm64).unwrap();
        assert_eq!(obj.sections[0].data[..4], [0x00, 0x00, 0x00, 0x94]);
        let reloc = &obj.relocs[0];
        assert_eq!(reloc.kind, RelocKind::Call26);
        assert_eq!(reloc.offset, 0);
    }

    #[test]
    fn test_adrp_and_lo12() {
        let obj = assemble("  adrp x0, g\n  add x0, x0, :lo12:g\n  ldr x0, [x0, :lo12:g]", Arch::Arm64)
            .unwrap();
        assert_eq!(obj.relocs.len(), 3);
        assert_eq!(obj.relocs[0].kind, RelocKind::AdrPrelPgHi21);
        assert_eq!(obj.relocs[1].kind, RelocKind::AddAbsLo12Nc);
        assert_eq!(obj.relocs[2].kind, RelocKind::Ldst64AbsLo12Nc);
        // adrp x0, g placeholder
        assert_eq!(obj.sections[0].data[..4], [0x00, 0x00, 0x00, 0x90]);
    }

    #[test]
    fn test_conditional_branch() {
        let code = words("  b.le L1\n  nop\nL1:\n  ret");
        assert_eq!(code[0], 0x5400004D);
    }

    #[test]
    fn test_undefined_conditional_target_fails() {
        let err = assemble("  cbz x0, nowhere", Arch::Arm64).unwrap_err();
        assert!(matches!(err, AsmError::UndefinedBranchTarget { .. }));
    }

    #[test]
    fn test_imm_out_of_range() {
        let err = assemble("  add x0, x0, #5000", Arch::Arm64).unwrap_err();
        assert!(matches!(err, AsmError::ImmOutOfRange { .. }));
    }

    #[test]
    fn test_w_registers() {
        assert_eq!(words("mov w0, #1"), vec![0x52800020]);
        assert_eq!(words("add w0, w1, w2"), vec![0x0B020020]);
        assert_eq!(words("ldr w0, [x1]"), vec![0xB9400020]);
    }
}
