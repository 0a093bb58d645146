//! AST-walking code generation.

use crate::emitter::{Arm64Emitter, AsmText, TargetEmitter, X64Emitter};
use crate::error::{CompileError, CompileResult};
use crate::symbols::{Frame, FunctionTable, GlobalTable, Storage, VarInfo};
use crate::{Target, MAXWHILE};
use smallc_parser::ast::*;

/// Compile a parsed program into assembly text for `target`.
pub fn compile_program(program: &Program, target: Target) -> CompileResult<String> {
    let emitter: Box<dyn TargetEmitter> = match target {
        Target::X64 => Box::new(X64Emitter),
        Target::Arm64 => Box::new(Arm64Emitter),
    };
    let mut generator = CodeGenerator {
        target,
        emitter,
        out: AsmText::new(),
        globals: GlobalTable::default(),
        funcs: FunctionTable::default(),
        frame: Frame::new(target),
        loop_stack: Vec::new(),
        next_label: 1,
    };
    generator.run(program)
}

struct CodeGenerator {
    target: Target,
    emitter: Box<dyn TargetEmitter>,
    out: AsmText,
    globals: GlobalTable,
    funcs: FunctionTable,
    frame: Frame,
    /// (break target, continue target)
    loop_stack: Vec<(u32, u32)>,
    next_label: u32,
}

impl CodeGenerator {
    fn run(mut self, program: &Program) -> CompileResult<String> {
        self.out.raw(".text");
        for item in &program.items {
            match item {
                Item::Global(global) => self.gen_global(global)?,
                Item::Function(function) => self.gen_function(function)?,
            }
        }
        Ok(self.out.finish())
    }

    fn new_label(&mut self) -> u32 {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    // ========================================================================
    // Globals
    // ========================================================================

    fn gen_global(&mut self, global: &Global) -> CompileResult<()> {
        self.globals
            .define(&global.name, global.ty, global.array_len, global.line)?;

        self.out.raw(".data");
        self.out.raw(format!(".globl {}", global.name));
        self.out.raw(format!("{}:", global.name));

        match (&global.init, global.array_len) {
            (Some(GlobalInit::Number(value)), _) => {
                self.out.ins(format!(".quad {value}"));
            }
            (Some(GlobalInit::Str(text)), Some(size)) => {
                let needed = text.len() as i64 + 1;
                if needed > size {
                    return Err(CompileError::InitializerTooLong {
                        line: global.line,
                        size,
                    });
                }
                self.out.ins(format!(".asciz \"{}\"", escape_asm(text)));
                if size > needed {
                    self.out.ins(format!(".space {}", size - needed));
                }
            }
            (Some(GlobalInit::Str(_)), None) => {
                return Err(CompileError::InvalidInitializer { line: global.line });
            }
            (None, Some(size)) => {
                self.out.ins(format!(".space {}", size * 8));
            }
            (None, None) => {
                self.out.ins(".quad 0");
            }
        }
        self.out.raw(".text");
        Ok(())
    }

    // ========================================================================
    // Functions
    // ========================================================================

    fn gen_function(&mut self, function: &Function) -> CompileResult<()> {
        self.funcs
            .define(&function.name, function.params.len(), function.line)?;

        self.out.raw(format!(".globl {}", function.name));
        self.out.raw(format!("{}:", function.name));

        self.frame = Frame::new(self.target);
        for param in &function.params {
            self.frame.add_param(&param.name, param.ty, function.line)?;
        }
        self.emitter.prologue(&mut self.out, function.params.len());

        // Claim all frame space before running initializers
        let mut inits = Vec::new();
        for local in &function.locals {
            let offset =
                self.frame
                    .add_local(&local.name, local.ty, local.array_len, local.line)?;
            if let Some(init) = &local.init {
                inits.push((offset, init));
            }
        }
        let alloc = self.frame.frame_bytes() - self.frame.spilled_bytes();
        self.emitter.alloc_frame(&mut self.out, alloc);

        for (offset, init) in inits {
            self.gen_expr(init)?;
            self.emitter.store_local(&mut self.out, offset);
        }

        for stmt in &function.body {
            self.gen_stmt(stmt)?;
        }

        self.emitter.epilogue(&mut self.out);
        Ok(())
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn gen_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::Block(stmts) => {
                for stmt in stmts {
                    self.gen_stmt(stmt)?;
                }
                Ok(())
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                self.gen_expr(cond)?;
                let false_label = self.new_label();
                self.emitter.branch_false(&mut self.out, false_label);
                self.gen_stmt(then_branch)?;
                match else_branch {
                    Some(else_branch) => {
                        let end_label = self.new_label();
                        self.emitter.jump(&mut self.out, end_label);
                        self.out.label(false_label);
                        self.gen_stmt(else_branch)?;
                        self.out.label(end_label);
                    }
                    None => self.out.label(false_label),
                }
                Ok(())
            }
            Stmt::While { cond, body, line } => {
                let start = self.new_label();
                let end = self.new_label();
                self.push_loop(end, start, *line)?;
                self.out.label(start);
                self.gen_expr(cond)?;
                self.emitter.branch_false(&mut self.out, end);
                self.gen_stmt(body)?;
                self.emitter.jump(&mut self.out, start);
                self.out.label(end);
                self.loop_stack.pop();
                Ok(())
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
                line,
            } => {
                let start = self.new_label();
                let end = self.new_label();
                let cont = self.new_label();
                self.push_loop(end, cont, *line)?;
                if let Some(init) = init {
                    self.gen_expr(init)?;
                }
                self.out.label(start);
                if let Some(cond) = cond {
                    self.gen_expr(cond)?;
                    self.emitter.branch_false(&mut self.out, end);
                }
                self.gen_stmt(body)?;
                self.out.label(cont);
                if let Some(step) = step {
                    self.gen_expr(step)?;
                }
                self.emitter.jump(&mut self.out, start);
                self.out.label(end);
                self.loop_stack.pop();
                Ok(())
            }
            Stmt::Return { value, .. } => {
                match value {
                    Some(value) => self.gen_expr(value)?,
                    None => self.emitter.load_zero(&mut self.out),
                }
                self.emitter.epilogue(&mut self.out);
                Ok(())
            }
            Stmt::Break { line } => match self.loop_stack.last() {
                Some(&(break_label, _)) => {
                    self.emitter.jump(&mut self.out, break_label);
                    Ok(())
                }
                None => Err(CompileError::BreakOutsideLoop { line: *line }),
            },
            Stmt::Continue { line } => match self.loop_stack.last() {
                Some(&(_, cont_label)) => {
                    self.emitter.jump(&mut self.out, cont_label);
                    Ok(())
                }
                None => Err(CompileError::ContinueOutsideLoop { line: *line }),
            },
            Stmt::Expr(expr) => {
                self.gen_expr(expr)?;
                Ok(())
            }
            Stmt::Empty => Ok(()),
        }
    }

    fn push_loop(&mut self, break_label: u32, cont_label: u32, line: u32) -> CompileResult<()> {
        if self.loop_stack.len() >= MAXWHILE {
            return Err(CompileError::LoopTooDeep {
                line,
                max: MAXWHILE,
            });
        }
        self.loop_stack.push((break_label, cont_label));
        Ok(())
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn resolve(&self, name: &str) -> Option<&VarInfo> {
        self.frame.get(name).or_else(|| self.globals.get(name))
    }

    fn gen_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        match expr {
            Expr::Number { value, .. } | Expr::CharLit { value, .. } => {
                self.emitter.load_imm(&mut self.out, *value);
                Ok(())
            }
            Expr::Str { value, .. } => {
                let label = self.new_label();
                self.out.raw(".data");
                self.out.raw(format!("S{label}:"));
                self.out.ins(format!(".asciz \"{}\"", escape_asm(value)));
                self.out.raw(".text");
                self.emitter.addr_global(&mut self.out, &format!("S{label}"));
                Ok(())
            }
            Expr::Var { name, line } => match self.resolve(name) {
                Some(var) => {
                    match (var.is_array(), var.storage) {
                        (true, Storage::Frame(offset)) => {
                            self.emitter.addr_local(&mut self.out, offset)
                        }
                        (true, Storage::Global) => self.emitter.addr_global(&mut self.out, name),
                        (false, Storage::Frame(offset)) => {
                            self.emitter.load_local(&mut self.out, offset)
                        }
                        (false, Storage::Global) => self.emitter.load_global(&mut self.out, name),
                    }
                    Ok(())
                }
                None if self.funcs.is_defined(name) => {
                    self.emitter.addr_global(&mut self.out, name);
                    Ok(())
                }
                None => Err(CompileError::UndefinedVariable {
                    name: name.clone(),
                    line: *line,
                }),
            },
            Expr::Unary { op, operand, .. } => {
                self.gen_expr(operand)?;
                match op {
                    UnaryOp::Neg => self.emitter.negate(&mut self.out),
                    UnaryOp::Not => self.emitter.logical_not(&mut self.out),
                    UnaryOp::BitNot => self.emitter.bit_not(&mut self.out),
                }
                Ok(())
            }
            Expr::Deref { operand, .. } => {
                self.gen_expr(operand)?;
                self.emitter.load_indirect(&mut self.out);
                Ok(())
            }
            Expr::AddrOf { name, line } => match self.resolve(name) {
                Some(var) => {
                    match var.storage {
                        Storage::Frame(offset) => self.emitter.addr_local(&mut self.out, offset),
                        Storage::Global => self.emitter.addr_global(&mut self.out, name),
                    }
                    Ok(())
                }
                None if self.funcs.is_defined(name) => {
                    self.emitter.addr_global(&mut self.out, name);
                    Ok(())
                }
                None => Err(CompileError::UndefinedVariable {
                    name: name.clone(),
                    line: *line,
                }),
            },
            Expr::Binary {
                op: BinaryOp::LogAnd,
                lhs,
                rhs,
                ..
            } => {
                // Branch past the right side, materialize 0/1 at the join
                self.gen_expr(lhs)?;
                let short = self.new_label();
                let done = self.new_label();
                self.emitter.branch_false(&mut self.out, short);
                self.gen_expr(rhs)?;
                self.emitter.bool_from_acc(&mut self.out);
                self.emitter.jump(&mut self.out, done);
                self.out.label(short);
                self.emitter.load_zero(&mut self.out);
                self.out.label(done);
                Ok(())
            }
            Expr::Binary {
                op: BinaryOp::LogOr,
                lhs,
                rhs,
                ..
            } => {
                self.gen_expr(lhs)?;
                let join = self.new_label();
                self.emitter.branch_true(&mut self.out, join);
                self.gen_expr(rhs)?;
                self.out.label(join);
                self.emitter.bool_from_acc(&mut self.out);
                Ok(())
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                self.gen_expr(lhs)?;
                self.emitter.push_acc(&mut self.out);
                self.gen_expr(rhs)?;
                self.emitter.binop(&mut self.out, *op);
                Ok(())
            }
            Expr::Assign {
                op,
                target,
                value,
                ..
            } => {
                self.gen_addr(target)?;
                self.emitter.push_acc(&mut self.out);
                if let Some(binop) = compound_op(*op) {
                    // Load the old value, combine with the right side
                    self.emitter.load_indirect(&mut self.out);
                    self.emitter.push_acc(&mut self.out);
                    self.gen_expr(value)?;
                    self.emitter.binop(&mut self.out, binop);
                } else {
                    self.gen_expr(value)?;
                }
                self.emitter.store_indirect(&mut self.out);
                Ok(())
            }
            Expr::Call { callee, args, line } => {
                let max = self.target.max_call_args();
                if args.len() > max {
                    return Err(CompileError::TooManyArgs { line: *line, max });
                }
                for arg in args {
                    self.gen_expr(arg)?;
                    self.emitter.push_acc(&mut self.out);
                }
                self.emitter.pop_args(&mut self.out, args.len());
                self.emitter.call(&mut self.out, callee);
                Ok(())
            }
            Expr::Index { .. } => {
                self.gen_addr(expr)?;
                self.emitter.load_indirect(&mut self.out);
                Ok(())
            }
            Expr::PreIncDec { dec, target, .. } => {
                self.gen_addr(target)?;
                self.emitter.pre_incdec(&mut self.out, *dec);
                Ok(())
            }
            Expr::PostIncDec { dec, target, .. } => {
                self.gen_addr(target)?;
                self.emitter.post_incdec(&mut self.out, *dec);
                Ok(())
            }
        }
    }

    /// Leave the address of an lvalue in the accumulator.
    fn gen_addr(&mut self, expr: &Expr) -> CompileResult<()> {
        match expr {
            Expr::Var { name, line } => match self.resolve(name) {
                Some(var) => {
                    match var.storage {
                        Storage::Frame(offset) => self.emitter.addr_local(&mut self.out, offset),
                        Storage::Global => self.emitter.addr_global(&mut self.out, name),
                    }
                    Ok(())
                }
                None => Err(CompileError::UndefinedVariable {
                    name: name.clone(),
                    line: *line,
                }),
            },
            Expr::Index { base, index, .. } => {
                // base address + index * 8
                self.gen_expr(base)?;
                self.emitter.push_acc(&mut self.out);
                self.gen_expr(index)?;
                self.emitter.index_scale(&mut self.out);
                self.emitter.binop(&mut self.out, BinaryOp::Add);
                Ok(())
            }
            Expr::Deref { operand, .. } => self.gen_expr(operand),
            // The parser only lets lvalues through
            _ => Err(CompileError::InvalidInitializer { line: expr.line() }),
        }
    }
}

fn compound_op(op: AssignOp) -> Option<BinaryOp> {
    match op {
        AssignOp::Assign => None,
        AssignOp::AddAssign => Some(BinaryOp::Add),
        AssignOp::SubAssign => Some(BinaryOp::Sub),
        AssignOp::MulAssign => Some(BinaryOp::Mul),
        AssignOp::DivAssign => Some(BinaryOp::Div),
    }
}

/// Escape a string for an `.ascii`/`.asciz` operand.
fn escape_asm(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '\x08' => out.push_str("\\b"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile_source;

    fn x64(source: &str) -> String {
        compile_source(source, Target::X64).unwrap()
    }

    fn arm64(source: &str) -> String {
        compile_source(source, Target::Arm64).unwrap()
    }

    #[test]
    fn test_arithmetic_precedence_sequence() {
        let asm = x64("int main() { return 2 + 3 * 4; }");
        assert!(asm.contains("movq $2, %rax"));
        assert!(asm.contains("imulq %rdx, %rax"));
        assert!(asm.contains("addq %rdx, %rax"));
        // multiply must happen before add
        assert!(asm.find("imulq").unwrap() < asm.find("addq %rdx").unwrap());
    }

    #[test]
    fn test_function_is_global_and_labeled() {
        let asm = x64("int main() { return 0; }");
        assert!(asm.contains(".globl main"));
        assert!(asm.contains("main:"));
        assert!(asm.contains("ret"));
    }

    #[test]
    fn test_push_pop_balance() {
        let asm = x64("int f(int a, int b) { return a * b + a / b; }");
        let pushes = asm.matches("pushq").count();
        let pops = asm.matches("popq").count();
        assert_eq!(pushes, pops);
    }

    #[test]
    fn test_param_spill_and_load() {
        let asm = x64("int id(int x) { return x; }");
        assert!(asm.contains("pushq %rdi"));
        assert!(asm.contains("movq -8(%rbp), %rax"));
    }

    #[test]
    fn test_arm64_param_spill_and_load() {
        let asm = arm64("int id(int x) { return x; }");
        assert!(asm.contains("str x0, [sp, #-16]!"));
        assert!(asm.contains("ldr x0, [x29, #-16]"));
    }

    #[test]
    fn test_frame_allocation_rounded() {
        let asm = x64("int main() { int a; a = 1; return a; }");
        assert!(asm.contains("subq $16, %rsp"), "asm was:\n{asm}");
    }

    #[test]
    fn test_call_pops_args_in_reverse() {
        let asm = x64("int main() { return add(1, 2); }");
        let rsi = asm.find("popq %rsi").unwrap();
        let rdi = asm.find("popq %rdi").unwrap();
        assert!(rsi < rdi);
        assert!(asm.contains("call add"));
    }

    #[test]
    fn test_too_many_call_args() {
        let err =
            compile_source("int main() { return f(1,2,3,4,5,6,7); }", Target::X64).unwrap_err();
        assert!(matches!(err, CompileError::TooManyArgs { max: 6, .. }));
        // arm64 allows up to eight
        assert!(compile_source("int main() { return f(1,2,3,4,5,6,7); }", Target::Arm64).is_ok());
    }

    #[test]
    fn test_global_array_addressing() {
        let asm = x64("int a[4];\nint main() { a[1] = 2; return a[1]; }");
        assert!(asm.contains(".space 32"));
        assert!(asm.contains("movq $a, %rax"));
        assert!(asm.contains("shlq $3, %rax"));
    }

    #[test]
    fn test_arm64_global_uses_page_addressing() {
        let asm = arm64("int g;\nint main() { g = 1; return g; }");
        assert!(asm.contains("adrp x0, g"));
        assert!(asm.contains("ldr x0, [x0, :lo12:g]"));
    }

    #[test]
    fn test_string_literal_in_data() {
        let asm = x64("int main() { puts(\"Hi\"); return 0; }");
        assert!(asm.contains(".asciz \"Hi\""));
        assert!(asm.contains("call puts"));
    }

    #[test]
    fn test_string_escapes_in_data() {
        let asm = x64("int main() { puts(\"a\\n\\\"b\\\"\"); return 0; }");
        assert!(asm.contains(".asciz \"a\\n\\\"b\\\"\""));
    }

    #[test]
    fn test_string_global_init_pads_to_size() {
        let asm = x64("char msg[8] = \"hi\";\nint main() { return 0; }");
        assert!(asm.contains(".asciz \"hi\""));
        assert!(asm.contains(".space 5"));
    }

    #[test]
    fn test_string_init_too_long() {
        let err = compile_source("char m[2] = \"hello\";", Target::X64).unwrap_err();
        assert!(matches!(err, CompileError::InitializerTooLong { .. }));
    }

    #[test]
    fn test_if_else_labels() {
        let asm = x64("int main() { if (1) return 2; else return 3; }");
        assert!(asm.contains("jz L1"));
        assert!(asm.contains("jmp L2"));
        assert!(asm.contains("L1:"));
        assert!(asm.contains("L2:"));
    }

    #[test]
    fn test_while_loop_shape() {
        let asm = x64("int main() { int i; i = 0; while (i < 3) i = i + 1; return i; }");
        assert!(asm.contains("L1:"));
        assert!(asm.contains("jz L2"));
        assert!(asm.contains("jmp L1"));
    }

    #[test]
    fn test_for_step_emitted_after_body() {
        let asm = x64("int main() { int i, s; s = 0; for (i = 0; i < 4; i = i + 1) s = s + i; return s; }");
        // continue label sits between body and back-edge
        let cont = asm.find("L3:").unwrap();
        let back = asm.rfind("jmp L1").unwrap();
        assert!(cont < back);
    }

    #[test]
    fn test_break_and_continue_targets() {
        let asm = x64("int main() { while (1) { if (0) break; continue; } return 0; }");
        assert!(asm.contains("jmp L2")); // break -> end
        assert!(asm.contains("jmp L1")); // continue -> condition
    }

    #[test]
    fn test_break_outside_loop_fails() {
        let err = compile_source("int main() { break; }", Target::X64).unwrap_err();
        assert!(matches!(err, CompileError::BreakOutsideLoop { .. }));
    }

    #[test]
    fn test_undefined_variable() {
        let err = compile_source("int main() { return nope; }", Target::X64).unwrap_err();
        assert!(matches!(err, CompileError::UndefinedVariable { .. }));
    }

    #[test]
    fn test_duplicate_function() {
        let err = compile_source("int f() { return 1; }\nint f() { return 2; }", Target::X64)
            .unwrap_err();
        assert!(matches!(err, CompileError::DuplicateFunction { .. }));
    }

    #[test]
    fn test_short_circuit_and() {
        let asm = x64("int main() { return 1 && 2; }");
        assert!(asm.contains("jz L1"));
        assert!(asm.contains("setne %al"));
        assert!(asm.contains("xorq %rax, %rax"));
    }

    #[test]
    fn test_compound_assignment_loads_old_value() {
        let asm = x64("int main() { int x; x = 1; x += 2; return x; }");
        assert!(asm.contains("movq (%rax), %rax"));
    }

    #[test]
    fn test_post_increment() {
        let asm = x64("int main() { int i; i = 0; i++; return i; }");
        assert!(asm.contains("incq (%rdx)"));
    }

    #[test]
    fn test_arm64_fib_compiles() {
        let asm = arm64(
            "int fib(int n) { if (n <= 1) return n; return fib(n - 1) + fib(n - 2); }\nint main() { return fib(10); }",
        );
        assert!(asm.contains("bl fib"));
        assert!(asm.contains("cset x0, le"));
        assert!(asm.contains("stp x29, x30, [sp, #-16]!"));
    }

    #[test]
    fn test_local_initializer_after_alloc() {
        let asm = x64("int main() { int a = 5; return a; }");
        let sub = asm.find("subq $16, %rsp").unwrap();
        let store = asm.find("movq %rax, -8(%rbp)").unwrap();
        assert!(sub < store);
    }

    #[test]
    fn test_return_without_value_is_zero() {
        let asm = x64("int main() { return; }");
        assert!(asm.contains("xorq %rax, %rax"));
    }
}
