//! Constant-expression evaluation for directives and immediates.
//!
//! Supports `+ - * / % << >> & | ^ ~`, parentheses, character literals,
//! decimal/hex/binary/octal numbers, symbol references and `$`/`.` for the
//! current offset in the current section.

use crate::error::{AsmError, AsmResult};

/// Name resolution for the evaluator.
pub trait ExprEnv {
    /// Value of a symbol, if it has one at this point.
    fn symbol(&self, name: &str) -> Option<i64>;
    /// Current offset in the current section.
    fn here(&self) -> i64;
}

/// Result of evaluating an expression. `symbol` is set when the expression
/// consisted of a single relocatable symbol term (plus a constant), which is
/// what data directives need to decide on a relocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprValue {
    pub value: i64,
    pub symbol: Option<String>,
}

struct Cursor<'a> {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    env: &'a dyn ExprEnv,
    /// First symbol without a known value seen during evaluation
    pending_symbol: Option<String>,
}

pub fn eval(text: &str, line: u32, env: &dyn ExprEnv) -> AsmResult<ExprValue> {
    let mut cursor = Cursor {
        chars: text.chars().collect(),
        pos: 0,
        line,
        env,
        pending_symbol: None,
    };
    let value = cursor.bitor()?;
    cursor.skip_space();
    if cursor.pos != cursor.chars.len() {
        return Err(AsmError::syntax(
            line,
            format!("trailing characters in expression '{text}'"),
        ));
    }
    Ok(ExprValue {
        value,
        symbol: cursor.pending_symbol,
    })
}

impl Cursor<'_> {
    fn skip_space(&mut self) {
        while self
            .chars
            .get(self.pos)
            .is_some_and(|c| *c == ' ' || *c == '\t')
        {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_space();
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat2(&mut self, a: char, b: char) -> bool {
        self.skip_space();
        if self.chars.get(self.pos) == Some(&a) && self.chars.get(self.pos + 1) == Some(&b) {
            self.pos += 2;
            true
        } else {
            false
        }
    }

    fn bitor(&mut self) -> AsmResult<i64> {
        let mut left = self.bitxor()?;
        loop {
            self.skip_space();
            // `||` would be a different operator; only a single `|` combines
            if self.chars.get(self.pos) == Some(&'|') && self.chars.get(self.pos + 1) != Some(&'|')
            {
                self.pos += 1;
                left |= self.bitxor()?;
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn bitxor(&mut self) -> AsmResult<i64> {
        let mut left = self.bitand()?;
        while self.eat('^') {
            left ^= self.bitand()?;
        }
        Ok(left)
    }

    fn bitand(&mut self) -> AsmResult<i64> {
        let mut left = self.shift()?;
        loop {
            self.skip_space();
            if self.chars.get(self.pos) == Some(&'&') && self.chars.get(self.pos + 1) != Some(&'&')
            {
                self.pos += 1;
                left &= self.shift()?;
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn shift(&mut self) -> AsmResult<i64> {
        let mut left = self.additive()?;
        loop {
            if self.eat2('<', '<') {
                left = left.wrapping_shl(self.additive()? as u32);
            } else if self.eat2('>', '>') {
                left = left.wrapping_shr(self.additive()? as u32);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn additive(&mut self) -> AsmResult<i64> {
        let mut left = self.term()?;
        loop {
            if self.eat('+') {
                left = left.wrapping_add(self.term()?);
            } else if self.eat('-') {
                left = left.wrapping_sub(self.term()?);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn term(&mut self) -> AsmResult<i64> {
        let mut left = self.primary()?;
        loop {
            match self.peek() {
                Some('*') => {
                    self.pos += 1;
                    left = left.wrapping_mul(self.primary()?);
                }
                Some('/') => {
                    self.pos += 1;
                    let right = self.primary()?;
                    if right == 0 {
                        return Err(AsmError::syntax(self.line, "division by zero"));
                    }
                    left /= right;
                }
                Some('%') => {
                    self.pos += 1;
                    let right = self.primary()?;
                    if right == 0 {
                        return Err(AsmError::syntax(self.line, "division by zero"));
                    }
                    left %= right;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn primary(&mut self) -> AsmResult<i64> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let value = self.bitor()?;
                if !self.eat(')') {
                    return Err(AsmError::syntax(self.line, "missing ')'"));
                }
                Ok(value)
            }
            Some('-') => {
                self.pos += 1;
                Ok(-self.primary()?)
            }
            Some('~') => {
                self.pos += 1;
                Ok(!self.primary()?)
            }
            Some('+') => {
                self.pos += 1;
                self.primary()
            }
            Some('$') | Some('.')
                if !self
                    .chars
                    .get(self.pos + 1)
                    .is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_') =>
            {
                self.pos += 1;
                Ok(self.env.here())
            }
            Some('\'') => {
                self.pos += 1;
                let c = self
                    .bump()
                    .ok_or_else(|| AsmError::syntax(self.line, "unterminated char literal"))?;
                let value = if c == '\\' {
                    match self.bump() {
                        Some('n') => 10,
                        Some('t') => 9,
                        Some('r') => 13,
                        Some('0') => 0,
                        Some('\\') => 92,
                        Some('\'') => 39,
                        Some(other) => other as i64,
                        None => {
                            return Err(AsmError::syntax(self.line, "unterminated char literal"))
                        }
                    }
                } else {
                    c as i64
                };
                if !self.eat('\'') {
                    return Err(AsmError::syntax(self.line, "unterminated char literal"));
                }
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '.' || c == '$' => {
                let start = self.pos;
                while self.chars.get(self.pos).is_some_and(|c| {
                    c.is_ascii_alphanumeric() || *c == '_' || *c == '.' || *c == '$'
                }) {
                    self.pos += 1;
                }
                let name: String = self.chars[start..self.pos].iter().collect();
                match self.env.symbol(&name) {
                    Some(value) => Ok(value),
                    None => {
                        // Undefined here: contributes zero, remembered for
                        // relocation by the caller
                        if self.pending_symbol.is_none() {
                            self.pending_symbol = Some(name);
                        }
                        Ok(0)
                    }
                }
            }
            other => Err(AsmError::syntax(
                self.line,
                format!("unexpected {:?} in expression", other),
            )),
        }
    }

    fn number(&mut self) -> AsmResult<i64> {
        let start = self.pos;
        while self
            .chars
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_alphanumeric())
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))
        {
            i64::from_str_radix(hex, 16)
        } else if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
            i64::from_str_radix(bin, 2)
        } else if text.len() > 1 && text.starts_with('0') {
            i64::from_str_radix(&text[1..], 8)
        } else {
            text.parse()
        };
        parsed.map_err(|_| AsmError::syntax(self.line, format!("bad number '{text}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    struct TestEnv {
        symbols: FxHashMap<String, i64>,
        here: i64,
    }

    impl ExprEnv for TestEnv {
        fn symbol(&self, name: &str) -> Option<i64> {
            self.symbols.get(name).copied()
        }
        fn here(&self) -> i64 {
            self.here
        }
    }

    fn env() -> TestEnv {
        let mut symbols = FxHashMap::default();
        symbols.insert("SIZE".to_owned(), 64);
        TestEnv { symbols, here: 0x30 }
    }

    fn value(text: &str) -> i64 {
        eval(text, 1, &env()).unwrap().value
    }

    #[test]
    fn test_precedence() {
        assert_eq!(value("2 + 3 * 4"), 14);
        assert_eq!(value("(2 + 3) * 4"), 20);
        assert_eq!(value("1 << 4 | 3"), 19);
        assert_eq!(value("~0 & 0xFF"), 255);
    }

    #[test]
    fn test_bases() {
        assert_eq!(value("0x10"), 16);
        assert_eq!(value("0b101"), 5);
        assert_eq!(value("017"), 15);
        assert_eq!(value("'A'"), 65);
        assert_eq!(value("'\\n'"), 10);
    }

    #[test]
    fn test_unary() {
        assert_eq!(value("-5 + 3"), -2);
        assert_eq!(value("~0"), -1);
    }

    #[test]
    fn test_symbols_and_here() {
        assert_eq!(value("SIZE / 8"), 8);
        assert_eq!(value("$ + 4"), 0x34);
        assert_eq!(value(". + 4"), 0x34);
    }

    #[test]
    fn test_undefined_symbol_reported() {
        let result = eval("missing + 8", 1, &env()).unwrap();
        assert_eq!(result.value, 8);
        assert_eq!(result.symbol.as_deref(), Some("missing"));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(eval("1/0", 1, &env()).is_err());
    }

    #[test]
    fn test_trailing_garbage() {
        assert!(eval("1 2", 1, &env()).is_err());
    }
}
