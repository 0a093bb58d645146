//! Target-specific instruction templates.
//!
//! All architecture knowledge lives behind [`TargetEmitter`]; the code
//! generator only talks in terms of the accumulator machine (load, push,
//! combine, branch). The x86-64 emitter produces AT&T syntax, the AArch64
//! emitter standard A64 syntax.

use smallc_parser::ast::BinaryOp;
use std::fmt::Write;

/// Accumulating assembly text
#[derive(Default)]
pub struct AsmText {
    buf: String,
}

impl AsmText {
    pub fn new() -> Self {
        Self::default()
    }

    /// A line at column zero (directives, labels)
    pub fn raw(&mut self, line: impl AsRef<str>) {
        self.buf.push_str(line.as_ref());
        self.buf.push('\n');
    }

    /// An indented instruction line
    pub fn ins(&mut self, line: impl AsRef<str>) {
        self.buf.push_str("  ");
        self.buf.push_str(line.as_ref());
        self.buf.push('\n');
    }

    pub fn label(&mut self, n: u32) {
        let _ = writeln!(self.buf, "L{n}:");
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

/// The narrow seam between the accumulator machine and a real ISA.
pub trait TargetEmitter {
    /// Function entry: save the frame pointer, establish the new frame,
    /// spill the first `nparams` argument registers.
    fn prologue(&self, out: &mut AsmText, nparams: usize);

    /// Claim `bytes` of frame space below the spilled parameters.
    fn alloc_frame(&self, out: &mut AsmText, bytes: i64);

    /// Restore the caller frame and return.
    fn epilogue(&self, out: &mut AsmText);

    fn load_imm(&self, out: &mut AsmText, value: i64);
    fn load_zero(&self, out: &mut AsmText);

    /// Push the accumulator onto the value stack.
    fn push_acc(&self, out: &mut AsmText);

    /// Left operand on the stack, right in the accumulator; pop, combine,
    /// leave the result in the accumulator. Handles every [`BinaryOp`]
    /// except the short-circuit forms.
    fn binop(&self, out: &mut AsmText, op: BinaryOp);

    fn load_local(&self, out: &mut AsmText, offset: i64);
    fn store_local(&self, out: &mut AsmText, offset: i64);
    fn addr_local(&self, out: &mut AsmText, offset: i64);

    fn load_global(&self, out: &mut AsmText, name: &str);
    fn addr_global(&self, out: &mut AsmText, name: &str);

    /// Accumulator holds an address; replace it with the word it points to.
    fn load_indirect(&self, out: &mut AsmText);

    /// Address on the stack, value in the accumulator; pop and store.
    fn store_indirect(&self, out: &mut AsmText);

    /// Scale an index in the accumulator by the 8-byte word size.
    fn index_scale(&self, out: &mut AsmText);

    fn branch_false(&self, out: &mut AsmText, label: u32);
    fn branch_true(&self, out: &mut AsmText, label: u32);
    fn jump(&self, out: &mut AsmText, label: u32);

    /// Normalize the accumulator to 0/1.
    fn bool_from_acc(&self, out: &mut AsmText);
    fn logical_not(&self, out: &mut AsmText);
    fn bit_not(&self, out: &mut AsmText);
    fn negate(&self, out: &mut AsmText);

    /// Accumulator holds an address; bump the word behind it and leave the
    /// new value in the accumulator.
    fn pre_incdec(&self, out: &mut AsmText, dec: bool);

    /// Accumulator holds an address; leave the old value in the accumulator
    /// and bump the word behind it.
    fn post_incdec(&self, out: &mut AsmText, dec: bool);

    /// Pop `count` pushed arguments into the argument registers, last first.
    fn pop_args(&self, out: &mut AsmText, count: usize);
    fn call(&self, out: &mut AsmText, name: &str);
}

// ============================================================================
// x86-64
// ============================================================================

pub struct X64Emitter;

const X64_ARG_REGS: [&str; 6] = ["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];

impl X64Emitter {
    fn pop(&self, out: &mut AsmText, reg: &str) {
        out.ins(format!("popq {reg}"));
    }
}

impl TargetEmitter for X64Emitter {
    fn prologue(&self, out: &mut AsmText, nparams: usize) {
        out.ins("pushq %rbp");
        out.ins("movq %rsp, %rbp");
        for reg in &X64_ARG_REGS[..nparams] {
            out.ins(format!("pushq {reg}"));
        }
    }

    fn alloc_frame(&self, out: &mut AsmText, bytes: i64) {
        if bytes > 0 {
            out.ins(format!("subq ${bytes}, %rsp"));
        }
    }

    fn epilogue(&self, out: &mut AsmText) {
        out.ins("movq %rbp, %rsp");
        out.ins("popq %rbp");
        out.ins("ret");
    }

    fn load_imm(&self, out: &mut AsmText, value: i64) {
        out.ins(format!("movq ${value}, %rax"));
    }

    fn load_zero(&self, out: &mut AsmText) {
        out.ins("xorq %rax, %rax");
    }

    fn push_acc(&self, out: &mut AsmText) {
        out.ins("pushq %rax");
    }

    fn binop(&self, out: &mut AsmText, op: BinaryOp) {
        match op {
            BinaryOp::Add => {
                self.pop(out, "%rdx");
                out.ins("addq %rdx, %rax");
            }
            BinaryOp::Sub => {
                self.pop(out, "%rdx");
                out.ins("subq %rax, %rdx");
                out.ins("movq %rdx, %rax");
            }
            BinaryOp::Mul => {
                self.pop(out, "%rdx");
                out.ins("imulq %rdx, %rax");
            }
            BinaryOp::Div | BinaryOp::Rem => {
                out.ins("movq %rax, %rbx");
                self.pop(out, "%rax");
                out.ins("cqo");
                out.ins("idivq %rbx");
                if op == BinaryOp::Rem {
                    out.ins("movq %rdx, %rax");
                }
            }
            BinaryOp::BitAnd => {
                self.pop(out, "%rdx");
                out.ins("andq %rdx, %rax");
            }
            BinaryOp::BitOr => {
                self.pop(out, "%rdx");
                out.ins("orq %rdx, %rax");
            }
            BinaryOp::BitXor => {
                self.pop(out, "%rdx");
                out.ins("xorq %rdx, %rax");
            }
            BinaryOp::Shl | BinaryOp::Shr => {
                out.ins("movq %rax, %rcx");
                self.pop(out, "%rax");
                if op == BinaryOp::Shl {
                    out.ins("shlq %cl, %rax");
                } else {
                    out.ins("shrq %cl, %rax");
                }
            }
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge | BinaryOp::Eq
            | BinaryOp::Ne => {
                self.pop(out, "%rdx");
                out.ins("cmpq %rax, %rdx");
                let set = match op {
                    BinaryOp::Lt => "setl",
                    BinaryOp::Gt => "setg",
                    BinaryOp::Le => "setle",
                    BinaryOp::Ge => "setge",
                    BinaryOp::Eq => "sete",
                    _ => "setne",
                };
                out.ins(format!("{set} %al"));
                out.ins("movzbq %al, %rax");
            }
            BinaryOp::LogAnd | BinaryOp::LogOr => {
                unreachable!("short-circuit operators are lowered in codegen")
            }
        }
    }

    fn load_local(&self, out: &mut AsmText, offset: i64) {
        out.ins(format!("movq {offset}(%rbp), %rax"));
    }

    fn store_local(&self, out: &mut AsmText, offset: i64) {
        out.ins(format!("movq %rax, {offset}(%rbp)"));
    }

    fn addr_local(&self, out: &mut AsmText, offset: i64) {
        out.ins(format!("leaq {offset}(%rbp), %rax"));
    }

    fn load_global(&self, out: &mut AsmText, name: &str) {
        out.ins(format!("movq {name}(%rip), %rax"));
    }

    fn addr_global(&self, out: &mut AsmText, name: &str) {
        out.ins(format!("movq ${name}, %rax"));
    }

    fn load_indirect(&self, out: &mut AsmText) {
        out.ins("movq (%rax), %rax");
    }

    fn store_indirect(&self, out: &mut AsmText) {
        self.pop(out, "%rdx");
        out.ins("movq %rax, (%rdx)");
    }

    fn index_scale(&self, out: &mut AsmText) {
        out.ins("shlq $3, %rax");
    }

    fn branch_false(&self, out: &mut AsmText, label: u32) {
        out.ins("testq %rax, %rax");
        out.ins(format!("jz L{label}"));
    }

    fn branch_true(&self, out: &mut AsmText, label: u32) {
        out.ins("testq %rax, %rax");
        out.ins(format!("jnz L{label}"));
    }

    fn jump(&self, out: &mut AsmText, label: u32) {
        out.ins(format!("jmp L{label}"));
    }

    fn bool_from_acc(&self, out: &mut AsmText) {
        out.ins("testq %rax, %rax");
        out.ins("setne %al");
        out.ins("movzbq %al, %rax");
    }

    fn logical_not(&self, out: &mut AsmText) {
        out.ins("testq %rax, %rax");
        out.ins("setz %al");
        out.ins("movzbq %al, %rax");
    }

    fn bit_not(&self, out: &mut AsmText) {
        out.ins("notq %rax");
    }

    fn negate(&self, out: &mut AsmText) {
        out.ins("negq %rax");
    }

    fn pre_incdec(&self, out: &mut AsmText, dec: bool) {
        out.ins(if dec { "decq (%rax)" } else { "incq (%rax)" });
        out.ins("movq (%rax), %rax");
    }

    fn post_incdec(&self, out: &mut AsmText, dec: bool) {
        out.ins("movq %rax, %rdx");
        out.ins("movq (%rax), %rax");
        out.ins(if dec { "decq (%rdx)" } else { "incq (%rdx)" });
    }

    fn pop_args(&self, out: &mut AsmText, count: usize) {
        for reg in X64_ARG_REGS[..count].iter().rev() {
            self.pop(out, reg);
        }
    }

    fn call(&self, out: &mut AsmText, name: &str) {
        out.ins(format!("call {name}"));
    }
}

// ============================================================================
// AArch64
// ============================================================================

pub struct Arm64Emitter;

impl Arm64Emitter {
    /// Pop the left operand into x1
    fn pop(&self, out: &mut AsmText, reg: &str) {
        out.ins(format!("ldr {reg}, [sp], #16"));
    }

    fn cset(&self, out: &mut AsmText, cond: &str) {
        out.ins("cmp x0, #0");
        out.ins(format!("cset x0, {cond}"));
    }
}

impl TargetEmitter for Arm64Emitter {
    fn prologue(&self, out: &mut AsmText, nparams: usize) {
        out.ins("stp x29, x30, [sp, #-16]!");
        out.ins("mov x29, sp");
        for i in 0..nparams {
            out.ins(format!("str x{i}, [sp, #-16]!"));
        }
    }

    fn alloc_frame(&self, out: &mut AsmText, bytes: i64) {
        if bytes > 0 {
            out.ins(format!("sub sp, sp, #{bytes}"));
        }
    }

    fn epilogue(&self, out: &mut AsmText) {
        out.ins("mov sp, x29");
        out.ins("ldp x29, x30, [sp], #16");
        out.ins("ret");
    }

    fn load_imm(&self, out: &mut AsmText, value: i64) {
        out.ins(format!("mov x0, #{value}"));
    }

    fn load_zero(&self, out: &mut AsmText) {
        out.ins("mov x0, #0");
    }

    fn push_acc(&self, out: &mut AsmText) {
        out.ins("str x0, [sp, #-16]!");
    }

    fn binop(&self, out: &mut AsmText, op: BinaryOp) {
        match op {
            BinaryOp::Add => {
                self.pop(out, "x1");
                out.ins("add x0, x1, x0");
            }
            BinaryOp::Sub => {
                self.pop(out, "x1");
                out.ins("sub x0, x1, x0");
            }
            BinaryOp::Mul => {
                self.pop(out, "x1");
                out.ins("mul x0, x1, x0");
            }
            BinaryOp::Div => {
                self.pop(out, "x1");
                out.ins("sdiv x0, x1, x0");
            }
            BinaryOp::Rem => {
                self.pop(out, "x1");
                out.ins("sdiv x2, x1, x0");
                out.ins("msub x0, x2, x0, x1");
            }
            BinaryOp::BitAnd => {
                self.pop(out, "x1");
                out.ins("and x0, x1, x0");
            }
            BinaryOp::BitOr => {
                self.pop(out, "x1");
                out.ins("orr x0, x1, x0");
            }
            BinaryOp::BitXor => {
                self.pop(out, "x1");
                out.ins("eor x0, x1, x0");
            }
            BinaryOp::Shl | BinaryOp::Shr => {
                out.ins("mov x2, x0");
                self.pop(out, "x0");
                if op == BinaryOp::Shl {
                    out.ins("lsl x0, x0, x2");
                } else {
                    out.ins("lsr x0, x0, x2");
                }
            }
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge | BinaryOp::Eq
            | BinaryOp::Ne => {
                self.pop(out, "x1");
                out.ins("cmp x1, x0");
                let cond = match op {
                    BinaryOp::Lt => "lt",
                    BinaryOp::Gt => "gt",
                    BinaryOp::Le => "le",
                    BinaryOp::Ge => "ge",
                    BinaryOp::Eq => "eq",
                    _ => "ne",
                };
                out.ins(format!("cset x0, {cond}"));
            }
            BinaryOp::LogAnd | BinaryOp::LogOr => {
                unreachable!("short-circuit operators are lowered in codegen")
            }
        }
    }

    fn load_local(&self, out: &mut AsmText, offset: i64) {
        out.ins(format!("ldr x0, [x29, #{offset}]"));
    }

    fn store_local(&self, out: &mut AsmText, offset: i64) {
        out.ins(format!("str x0, [x29, #{offset}]"));
    }

    fn addr_local(&self, out: &mut AsmText, offset: i64) {
        if offset < 0 {
            out.ins(format!("sub x0, x29, #{}", -offset));
        } else {
            out.ins(format!("add x0, x29, #{offset}"));
        }
    }

    fn load_global(&self, out: &mut AsmText, name: &str) {
        out.ins(format!("adrp x0, {name}"));
        out.ins(format!("ldr x0, [x0, :lo12:{name}]"));
    }

    fn addr_global(&self, out: &mut AsmText, name: &str) {
        out.ins(format!("adrp x0, {name}"));
        out.ins(format!("add x0, x0, :lo12:{name}"));
    }

    fn load_indirect(&self, out: &mut AsmText) {
        out.ins("ldr x0, [x0]");
    }

    fn store_indirect(&self, out: &mut AsmText) {
        self.pop(out, "x1");
        out.ins("str x0, [x1]");
    }

    fn index_scale(&self, out: &mut AsmText) {
        out.ins("lsl x0, x0, #3");
    }

    fn branch_false(&self, out: &mut AsmText, label: u32) {
        out.ins(format!("cbz x0, L{label}"));
    }

    fn branch_true(&self, out: &mut AsmText, label: u32) {
        out.ins(format!("cbnz x0, L{label}"));
    }

    fn jump(&self, out: &mut AsmText, label: u32) {
        out.ins(format!("b L{label}"));
    }

    fn bool_from_acc(&self, out: &mut AsmText) {
        self.cset(out, "ne");
    }

    fn logical_not(&self, out: &mut AsmText) {
        self.cset(out, "eq");
    }

    fn bit_not(&self, out: &mut AsmText) {
        out.ins("mvn x0, x0");
    }

    fn negate(&self, out: &mut AsmText) {
        out.ins("neg x0, x0");
    }

    fn pre_incdec(&self, out: &mut AsmText, dec: bool) {
        out.ins("ldr x1, [x0]");
        out.ins(if dec {
            "sub x1, x1, #1"
        } else {
            "add x1, x1, #1"
        });
        out.ins("str x1, [x0]");
        out.ins("mov x0, x1");
    }

    fn post_incdec(&self, out: &mut AsmText, dec: bool) {
        out.ins("mov x1, x0");
        out.ins("ldr x0, [x0]");
        out.ins("ldr x2, [x1]");
        out.ins(if dec {
            "sub x2, x2, #1"
        } else {
            "add x2, x2, #1"
        });
        out.ins("str x2, [x1]");
    }

    fn pop_args(&self, out: &mut AsmText, count: usize) {
        for i in (0..count).rev() {
            self.pop(out, &format!("x{i}"));
        }
    }

    fn call(&self, out: &mut AsmText, name: &str) {
        out.ins(format!("bl {name}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x64_sub_order() {
        let mut out = AsmText::new();
        X64Emitter.binop(&mut out, BinaryOp::Sub);
        let text = out.finish();
        assert!(text.contains("subq %rax, %rdx"));
        assert!(text.contains("movq %rdx, %rax"));
    }

    #[test]
    fn test_x64_push_pop_pairing() {
        let mut out = AsmText::new();
        let e = X64Emitter;
        e.push_acc(&mut out);
        e.binop(&mut out, BinaryOp::Add);
        let text = out.finish();
        assert_eq!(text.matches("pushq").count(), text.matches("popq").count());
    }

    #[test]
    fn test_arm64_push_uses_sixteen_byte_slots() {
        let mut out = AsmText::new();
        Arm64Emitter.push_acc(&mut out);
        assert_eq!(out.finish(), "  str x0, [sp, #-16]!\n");
    }

    #[test]
    fn test_arm64_rem_uses_msub() {
        let mut out = AsmText::new();
        Arm64Emitter.binop(&mut out, BinaryOp::Rem);
        let text = out.finish();
        assert!(text.contains("sdiv x2, x1, x0"));
        assert!(text.contains("msub x0, x2, x0, x1"));
    }

    #[test]
    fn test_arm64_negative_local_addr_uses_sub() {
        let mut out = AsmText::new();
        Arm64Emitter.addr_local(&mut out, -24);
        assert_eq!(out.finish(), "  sub x0, x29, #24\n");
    }

    #[test]
    fn test_pop_args_reverse_order() {
        let mut out = AsmText::new();
        X64Emitter.pop_args(&mut out, 3);
        let text = out.finish();
        let rdx = text.find("%rdx").unwrap();
        let rsi = text.find("%rsi").unwrap();
        let rdi = text.find("%rdi").unwrap();
        assert!(rdx < rsi && rsi < rdi);
    }
}
