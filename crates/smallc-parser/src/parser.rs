//! Recursive-descent parser for the Small-C dialect.

use crate::ast::*;
use crate::lexer::{LexError, LexWarning, Lexer};
use crate::token::Token;
use crate::MAXARGS;
use thiserror::Error;

/// Parse errors. The first error aborts the compile.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0}")]
    Lex(#[from] LexError),

    #[error("{line}: expected {expected}, found `{found}`{near}")]
    UnexpectedToken {
        expected: String,
        found: String,
        line: u32,
        near: String,
    },

    #[error("{line}: too many parameters (max {MAXARGS})")]
    TooManyParameters { line: u32 },

    #[error("{line}: expression is not assignable")]
    ExpectedLvalue { line: u32 },

    #[error("{line}: function call requires a function name")]
    BadCallTarget { line: u32 },
}

/// Parser state over a pre-tokenized input.
pub struct Parser {
    tokens: Vec<(Token, u32)>,
    pos: usize,
    /// Source lines kept for near-context diagnostics
    lines: Vec<String>,
    warnings: Vec<LexWarning>,
}

impl Parser {
    /// Tokenize and set up a parser.
    pub fn new(source: &str) -> Result<Self, ParseError> {
        let (tokens, warnings) = Lexer::new(source).tokenize()?;
        Ok(Self {
            tokens,
            pos: 0,
            lines: source.lines().map(str::to_owned).collect(),
            warnings,
        })
    }

    /// Warnings collected while lexing (identifier truncation, odd escapes).
    pub fn warnings(&self) -> &[LexWarning] {
        &self.warnings
    }

    /// Parse a whole translation unit.
    pub fn parse(mut self) -> Result<Program, ParseError> {
        let mut items = Vec::new();
        while !self.at_eof() {
            items.push(self.item()?);
        }
        Ok(Program { items })
    }

    // ========================================================================
    // Token management
    // ========================================================================

    #[inline]
    fn current(&self) -> &Token {
        &self.tokens[self.pos].0
    }

    #[inline]
    fn line(&self) -> u32 {
        self.tokens[self.pos].1
    }

    #[inline]
    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].0.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    #[inline]
    fn check(&self, expected: &Token) -> bool {
        std::mem::discriminant(self.current()) == std::mem::discriminant(expected)
    }

    /// Consume the current token if it matches, else report what was wanted.
    fn expect(&mut self, expected: Token) -> Result<Token, ParseError> {
        if self.check(&expected) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&format!("`{expected}`")))
        }
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    #[inline]
    fn at_eof(&self) -> bool {
        matches!(self.current(), Token::Eof)
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let line = self.line();
        let near = self
            .lines
            .get(line as usize - 1)
            .map(|l| {
                let trimmed = l.trim();
                let excerpt: String = trimmed.chars().take(24).collect();
                format!(" (near: {excerpt})")
            })
            .unwrap_or_default();
        ParseError::UnexpectedToken {
            expected: expected.to_owned(),
            found: self.current().to_string(),
            line,
            near,
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.current() {
            Token::Ident(_) => match self.advance() {
                Token::Ident(name) => Ok(name),
                _ => unreachable!(),
            },
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn expect_number(&mut self) -> Result<i64, ParseError> {
        match self.current() {
            Token::Number(_) => match self.advance() {
                Token::Number(n) => Ok(n),
                _ => unreachable!(),
            },
            _ => Err(self.unexpected("number")),
        }
    }

    // ========================================================================
    // Declarations
    // ========================================================================

    /// Optional base type; an untyped declaration defaults to `int`.
    fn base_type(&mut self) -> Ty {
        if self.eat(&Token::Int) {
            Ty::Int
        } else if self.eat(&Token::Char) {
            Ty::Char
        } else {
            Ty::Int
        }
    }

    /// Consume `*` declarator stars onto a base type.
    fn declarator_type(&mut self, base: Ty) -> Ty {
        let mut ty = base;
        while self.eat(&Token::Star) {
            ty = ty.pointer_to();
        }
        ty
    }

    fn item(&mut self) -> Result<Item, ParseError> {
        let line = self.line();
        let base = self.base_type();
        let ty = self.declarator_type(base);
        let name = self.expect_ident()?;

        if self.check(&Token::LParen) {
            self.advance();
            let function = self.function(name, ty, line)?;
            Ok(Item::Function(function))
        } else {
            let global = self.global(name, ty, line)?;
            Ok(Item::Global(global))
        }
    }

    fn global(&mut self, name: String, ty: Ty, line: u32) -> Result<Global, ParseError> {
        let array_len = if self.eat(&Token::LBracket) {
            let len = self.expect_number()?;
            self.expect(Token::RBracket)?;
            Some(len)
        } else {
            None
        };

        let init = if self.eat(&Token::Eq) {
            let init = match self.current().clone() {
                Token::Number(n) => {
                    self.advance();
                    GlobalInit::Number(n)
                }
                Token::CharLit(c) => {
                    self.advance();
                    GlobalInit::Number(c)
                }
                Token::Str(s) => {
                    self.advance();
                    GlobalInit::Str(s)
                }
                _ => return Err(self.unexpected("initializer")),
            };
            Some(init)
        } else {
            None
        };

        self.expect(Token::Semi)?;
        Ok(Global {
            name,
            ty,
            array_len,
            init,
            line,
        })
    }

    fn function(&mut self, name: String, ret: Ty, line: u32) -> Result<Function, ParseError> {
        let params = self.parameter_list()?;
        self.expect(Token::LBrace)?;
        let locals = self.local_declarations()?;

        let mut body = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.at_eof() {
                return Err(self.unexpected("`}`"));
            }
            body.push(self.statement()?);
        }
        self.advance();

        Ok(Function {
            name,
            ret,
            params,
            locals,
            body,
            line,
        })
    }

    fn parameter_list(&mut self) -> Result<Vec<Param>, ParseError> {
        let mut params = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(params);
        }
        loop {
            let base = self.base_type();
            let ty = self.declarator_type(base);
            let name = self.expect_ident()?;
            if params.len() >= MAXARGS {
                return Err(ParseError::TooManyParameters { line: self.line() });
            }
            params.push(Param { name, ty });
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RParen)?;
            break;
        }
        Ok(params)
    }

    fn local_declarations(&mut self) -> Result<Vec<LocalDecl>, ParseError> {
        let mut locals = Vec::new();
        while self.check(&Token::Int) || self.check(&Token::Char) {
            let base = self.base_type();
            loop {
                let line = self.line();
                let ty = self.declarator_type(base);
                let name = self.expect_ident()?;
                let array_len = if self.eat(&Token::LBracket) {
                    let len = self.expect_number()?;
                    self.expect(Token::RBracket)?;
                    Some(len)
                } else {
                    None
                };
                let init = if self.eat(&Token::Eq) {
                    Some(self.expression()?)
                } else {
                    None
                };
                locals.push(LocalDecl {
                    name,
                    ty,
                    array_len,
                    init,
                    line,
                });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::Semi)?;
        }
        Ok(locals)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        match self.current() {
            Token::LBrace => {
                self.advance();
                let mut stmts = Vec::new();
                while !self.check(&Token::RBrace) {
                    if self.at_eof() {
                        return Err(self.unexpected("`}`"));
                    }
                    stmts.push(self.statement()?);
                }
                self.advance();
                Ok(Stmt::Block(stmts))
            }
            Token::If => {
                self.advance();
                self.expect(Token::LParen)?;
                let cond = self.expression()?;
                self.expect(Token::RParen)?;
                let then_branch = Box::new(self.statement()?);
                let else_branch = if self.eat(&Token::Else) {
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                Ok(Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                    line,
                })
            }
            Token::While => {
                self.advance();
                self.expect(Token::LParen)?;
                let cond = self.expression()?;
                self.expect(Token::RParen)?;
                let body = Box::new(self.statement()?);
                Ok(Stmt::While { cond, body, line })
            }
            Token::For => {
                self.advance();
                self.expect(Token::LParen)?;
                let init = if self.check(&Token::Semi) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(Token::Semi)?;
                let cond = if self.check(&Token::Semi) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(Token::Semi)?;
                let step = if self.check(&Token::RParen) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(Token::RParen)?;
                let body = Box::new(self.statement()?);
                Ok(Stmt::For {
                    init,
                    cond,
                    step,
                    body,
                    line,
                })
            }
            Token::Return => {
                self.advance();
                let value = if self.check(&Token::Semi) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(Token::Semi)?;
                Ok(Stmt::Return { value, line })
            }
            Token::Break => {
                self.advance();
                self.expect(Token::Semi)?;
                Ok(Stmt::Break { line })
            }
            Token::Continue => {
                self.advance();
                self.expect(Token::Semi)?;
                Ok(Stmt::Continue { line })
            }
            Token::Semi => {
                self.advance();
                Ok(Stmt::Empty)
            }
            _ => {
                let expr = self.expression()?;
                self.expect(Token::Semi)?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    // ========================================================================
    // Expressions, lowest precedence first
    // ========================================================================

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, ParseError> {
        let target = self.logical_or()?;
        let op = match self.current() {
            Token::Eq => AssignOp::Assign,
            Token::PlusEq => AssignOp::AddAssign,
            Token::MinusEq => AssignOp::SubAssign,
            Token::StarEq => AssignOp::MulAssign,
            Token::SlashEq => AssignOp::DivAssign,
            _ => return Ok(target),
        };
        let line = self.line();
        if !target.is_lvalue() {
            return Err(ParseError::ExpectedLvalue { line });
        }
        self.advance();
        // Right-associative
        let value = self.assignment()?;
        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
            line,
        })
    }

    fn logical_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.logical_and()?;
        while self.check(&Token::OrOr) {
            let line = self.line();
            self.advance();
            let rhs = self.logical_and()?;
            lhs = Expr::Binary {
                op: BinaryOp::LogOr,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.bitwise_or()?;
        while self.check(&Token::AndAnd) {
            let line = self.line();
            self.advance();
            let rhs = self.bitwise_or()?;
            lhs = Expr::Binary {
                op: BinaryOp::LogAnd,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn bitwise_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.bitwise_xor()?;
        while self.check(&Token::Pipe) {
            let line = self.line();
            self.advance();
            let rhs = self.bitwise_xor()?;
            lhs = Expr::Binary {
                op: BinaryOp::BitOr,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn bitwise_xor(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.bitwise_and()?;
        while self.check(&Token::Caret) {
            let line = self.line();
            self.advance();
            let rhs = self.bitwise_and()?;
            lhs = Expr::Binary {
                op: BinaryOp::BitXor,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn bitwise_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.equality()?;
        while self.check(&Token::Amp) {
            let line = self.line();
            self.advance();
            let rhs = self.equality()?;
            lhs = Expr::Binary {
                op: BinaryOp::BitAnd,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.current() {
                Token::EqEq => BinaryOp::Eq,
                Token::BangEq => BinaryOp::Ne,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.relational()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn relational(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.shift()?;
        loop {
            let op = match self.current() {
                Token::Less => BinaryOp::Lt,
                Token::Greater => BinaryOp::Gt,
                Token::LessEq => BinaryOp::Le,
                Token::GreaterEq => BinaryOp::Ge,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.shift()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn shift(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.current() {
                Token::Shl => BinaryOp::Shl,
                Token::Shr => BinaryOp::Shr,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.current() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.current() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        match self.current() {
            Token::Bang => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                    line,
                })
            }
            Token::Tilde => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::BitNot,
                    operand: Box::new(operand),
                    line,
                })
            }
            Token::Minus => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                    line,
                })
            }
            Token::Star => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::Deref {
                    operand: Box::new(operand),
                    line,
                })
            }
            Token::Amp => {
                self.advance();
                let name = self.expect_ident()?;
                Ok(Expr::AddrOf { name, line })
            }
            Token::PlusPlus | Token::MinusMinus => {
                let dec = matches!(self.current(), Token::MinusMinus);
                self.advance();
                let target = self.unary()?;
                if !target.is_lvalue() {
                    return Err(ParseError::ExpectedLvalue { line });
                }
                Ok(Expr::PreIncDec {
                    dec,
                    target: Box::new(target),
                    line,
                })
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            match self.current() {
                Token::LBracket => {
                    let line = self.line();
                    self.advance();
                    let index = self.expression()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index {
                        base: Box::new(expr),
                        index: Box::new(index),
                        line,
                    };
                }
                Token::LParen => {
                    let line = self.line();
                    let callee = match &expr {
                        Expr::Var { name, .. } => name.clone(),
                        _ => return Err(ParseError::BadCallTarget { line }),
                    };
                    self.advance();
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if self.eat(&Token::Comma) {
                                continue;
                            }
                            self.expect(Token::RParen)?;
                            break;
                        }
                    }
                    expr = Expr::Call { callee, args, line };
                }
                Token::PlusPlus | Token::MinusMinus => {
                    let line = self.line();
                    let dec = matches!(self.current(), Token::MinusMinus);
                    if !expr.is_lvalue() {
                        return Err(ParseError::ExpectedLvalue { line });
                    }
                    self.advance();
                    expr = Expr::PostIncDec {
                        dec,
                        target: Box::new(expr),
                        line,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        match self.current().clone() {
            Token::Number(value) => {
                self.advance();
                Ok(Expr::Number { value, line })
            }
            Token::CharLit(value) => {
                self.advance();
                Ok(Expr::CharLit { value, line })
            }
            Token::Str(value) => {
                self.advance();
                Ok(Expr::Str { value, line })
            }
            Token::Ident(name) => {
                self.advance();
                Ok(Expr::Var { name, line })
            }
            Token::LParen => {
                self.advance();
                let expr = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            _ => Err(self.unexpected("expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Program {
        Parser::new(source).unwrap().parse().unwrap()
    }

    fn parse_err(source: &str) -> ParseError {
        Parser::new(source).unwrap().parse().unwrap_err()
    }

    #[test]
    fn test_global_variants() {
        let program = parse("int x;\nint a[4];\nint y = 3;\nchar msg[8] = \"hi\";\n");
        assert_eq!(program.items.len(), 4);
        match &program.items[1] {
            Item::Global(g) => {
                assert_eq!(g.name, "a");
                assert_eq!(g.array_len, Some(4));
            }
            other => panic!("expected global, got {other:?}"),
        }
        match &program.items[3] {
            Item::Global(g) => assert_eq!(g.init, Some(GlobalInit::Str("hi".into()))),
            other => panic!("expected global, got {other:?}"),
        }
    }

    #[test]
    fn test_function_with_params_and_locals() {
        let program = parse("int add(int a, int b) { int s; s = a + b; return s; }");
        let Item::Function(f) = &program.items[0] else {
            panic!("expected function");
        };
        assert_eq!(f.name, "add");
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.locals.len(), 1);
        assert_eq!(f.body.len(), 2);
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let program = parse("int main() { return 2 + 3 * 4; }");
        let Item::Function(f) = &program.items[0] else {
            panic!()
        };
        let Stmt::Return {
            value: Some(Expr::Binary { op, rhs, .. }),
            ..
        } = &f.body[0]
        else {
            panic!("expected return of binary expr")
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            **rhs,
            Expr::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_assignment_right_associative() {
        let program = parse("int main() { int a, b; a = b = 1; return a; }");
        let Item::Function(f) = &program.items[0] else {
            panic!()
        };
        let Stmt::Expr(Expr::Assign { value, .. }) = &f.body[0] else {
            panic!("expected assignment")
        };
        assert!(matches!(**value, Expr::Assign { .. }));
    }

    #[test]
    fn test_compound_assignment_needs_lvalue() {
        assert!(matches!(
            parse_err("int main() { 3 += 1; }"),
            ParseError::ExpectedLvalue { .. }
        ));
    }

    #[test]
    fn test_for_with_all_clauses() {
        let program = parse("int main() { int i, s; s = 0; for (i = 0; i < 10; i++) s += i; return s; }");
        let Item::Function(f) = &program.items[0] else {
            panic!()
        };
        let Stmt::For {
            init, cond, step, ..
        } = &f.body[1]
        else {
            panic!("expected for")
        };
        assert!(init.is_some());
        assert!(cond.is_some());
        assert!(matches!(step, Some(Expr::PostIncDec { .. })));
    }

    #[test]
    fn test_for_with_empty_clauses() {
        let program = parse("int main() { for (;;) break; return 0; }");
        let Item::Function(f) = &program.items[0] else {
            panic!()
        };
        assert!(matches!(
            f.body[0],
            Stmt::For {
                init: None,
                cond: None,
                step: None,
                ..
            }
        ));
    }

    #[test]
    fn test_nested_call_args() {
        let program = parse("int main() { return max(min(1, 2), 3); }");
        let Item::Function(f) = &program.items[0] else {
            panic!()
        };
        let Stmt::Return {
            value: Some(Expr::Call { callee, args, .. }),
            ..
        } = &f.body[0]
        else {
            panic!("expected call")
        };
        assert_eq!(callee, "max");
        assert_eq!(args.len(), 2);
        assert!(matches!(args[0], Expr::Call { .. }));
    }

    #[test]
    fn test_too_many_parameters() {
        let err = parse_err("int f(int a,int b,int c,int d,int e,int g,int h,int i,int j) { return 0; }");
        assert!(matches!(err, ParseError::TooManyParameters { .. }));
    }

    #[test]
    fn test_pointer_declarators() {
        let program = parse("char *p;\nint f(int *q) { return *q; }");
        let Item::Global(g) = &program.items[0] else {
            panic!()
        };
        assert_eq!(g.ty, Ty::CharPtr);
        let Item::Function(f) = &program.items[1] else {
            panic!()
        };
        assert_eq!(f.params[0].ty, Ty::IntPtr);
    }

    #[test]
    fn test_address_of_and_deref() {
        let program = parse("int main() { int x, y; x = 5; y = *&x; return y; }");
        let Item::Function(f) = &program.items[0] else {
            panic!()
        };
        let Stmt::Expr(Expr::Assign { value, .. }) = &f.body[1] else {
            panic!()
        };
        assert!(matches!(**value, Expr::Deref { .. }));
    }

    #[test]
    fn test_error_reports_line_and_context() {
        let err = parse_err("int main() {\n  return 1 +;\n}\n");
        let text = err.to_string();
        assert!(text.starts_with("2:"), "got: {text}");
        assert!(text.contains("near:"), "got: {text}");
    }

    #[test]
    fn test_empty_statement_and_blocks() {
        let program = parse("int main() { ; { ; } return 0; }");
        let Item::Function(f) = &program.items[0] else {
            panic!()
        };
        assert!(matches!(f.body[0], Stmt::Empty));
        assert!(matches!(f.body[1], Stmt::Block(_)));
    }
}
