//! Lexer for the Small-C dialect, built on logos.
//!
//! The logos-generated enum is internal; it is converted to the public
//! [`Token`] with per-token line numbers tracked manually.

use crate::token::Token;
use crate::NAMESIZE;
use logos::Logos;
use thiserror::Error;

/// Logos token enum used internally for tokenization.
#[derive(Logos, Debug, Clone, PartialEq)]
enum LogosToken {
    #[regex(r"[ \t\r\n]+", logos::skip)]
    Whitespace,

    #[regex(r"//[^\n]*", logos::skip)]
    LineComment,

    #[regex(r"/\*", lex_block_comment)]
    BlockComment,

    // Keywords (before identifiers)
    #[token("int")]
    Int,
    #[token("char")]
    Char,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("return")]
    Return,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Number(i64),

    #[regex(r"'([^'\\\n]|\\.)'", |lex| lex.slice().to_string())]
    CharLit(String),

    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| lex.slice().to_string())]
    Str(String),

    // Operators (two-character before one-character)
    #[token("==")]
    EqEq,
    #[token("!=")]
    BangEq,
    #[token("<=")]
    LessEq,
    #[token(">=")]
    GreaterEq,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("*=")]
    StarEq,
    #[token("/=")]
    SlashEq,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("!")]
    Bang,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("=")]
    Eq,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
}

fn lex_block_comment(lex: &mut logos::Lexer<LogosToken>) -> logos::Skip {
    let remainder = lex.remainder();
    match remainder.find("*/") {
        Some(end) => lex.bump(end + 2),
        // Unterminated comment swallows the rest of the input
        None => lex.bump(remainder.len()),
    }
    logos::Skip
}

/// Lexing errors (fatal; the first one aborts the compile)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LexError {
    #[error("{line}: unexpected character '{found}'")]
    UnexpectedCharacter { found: char, line: u32 },

    #[error("{line}: number literal out of range")]
    NumberOutOfRange { line: u32 },
}

/// Non-fatal lexer diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct LexWarning {
    pub line: u32,
    pub message: String,
}

/// Decode the escape sequences shared by character and string literals.
/// Unknown escapes keep the escaped character and produce a warning.
fn unescape(text: &str, line: u32, warnings: &mut Vec<LexWarning>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\x08'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('0') => out.push('\0'),
            Some(other) => {
                warnings.push(LexWarning {
                    line,
                    message: format!("unknown escape sequence '\\{other}'"),
                });
                out.push(other);
            }
            None => break,
        }
    }
    out
}

/// Small-C lexer. Produces a token stream with source lines, plus any
/// non-fatal warnings.
pub struct Lexer<'a> {
    source: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self { source }
    }

    pub fn tokenize(self) -> Result<(Vec<(Token, u32)>, Vec<LexWarning>), LexError> {
        let mut tokens = Vec::new();
        let mut warnings = Vec::new();
        let mut lexer = LogosToken::lexer(self.source);
        let mut line = 1u32;
        let mut last_end = 0usize;

        while let Some(result) = lexer.next() {
            let span = lexer.span();
            // Count newlines in any skipped trivia plus the token itself
            line += self.source[last_end..span.start]
                .bytes()
                .filter(|&b| b == b'\n')
                .count() as u32;
            let token_line = line;
            line += self.source[span.start..span.end]
                .bytes()
                .filter(|&b| b == b'\n')
                .count() as u32;
            last_end = span.end;

            let logos_token = match result {
                Ok(t) => t,
                Err(()) => {
                    let found = self.source[span.start..].chars().next().unwrap_or('\0');
                    // A failed match starting with a digit is an overflowed
                    // number literal
                    if found.is_ascii_digit() {
                        return Err(LexError::NumberOutOfRange { line: token_line });
                    }
                    return Err(LexError::UnexpectedCharacter {
                        found,
                        line: token_line,
                    });
                }
            };

            let token = match logos_token {
                LogosToken::Int => Token::Int,
                LogosToken::Char => Token::Char,
                LogosToken::If => Token::If,
                LogosToken::Else => Token::Else,
                LogosToken::While => Token::While,
                LogosToken::For => Token::For,
                LogosToken::Return => Token::Return,
                LogosToken::Break => Token::Break,
                LogosToken::Continue => Token::Continue,
                LogosToken::Ident(mut name) => {
                    if name.len() > NAMESIZE {
                        warnings.push(LexWarning {
                            line: token_line,
                            message: format!(
                                "identifier '{name}' truncated to {NAMESIZE} characters"
                            ),
                        });
                        name.truncate(NAMESIZE);
                    }
                    Token::Ident(name)
                }
                LogosToken::Number(n) => Token::Number(n),
                LogosToken::CharLit(raw) => {
                    let inner = &raw[1..raw.len() - 1];
                    let decoded = unescape(inner, token_line, &mut warnings);
                    Token::CharLit(decoded.chars().next().unwrap_or('\0') as i64)
                }
                LogosToken::Str(raw) => {
                    let inner = &raw[1..raw.len() - 1];
                    Token::Str(unescape(inner, token_line, &mut warnings))
                }
                LogosToken::EqEq => Token::EqEq,
                LogosToken::BangEq => Token::BangEq,
                LogosToken::LessEq => Token::LessEq,
                LogosToken::GreaterEq => Token::GreaterEq,
                LogosToken::Shl => Token::Shl,
                LogosToken::Shr => Token::Shr,
                LogosToken::AndAnd => Token::AndAnd,
                LogosToken::OrOr => Token::OrOr,
                LogosToken::PlusPlus => Token::PlusPlus,
                LogosToken::MinusMinus => Token::MinusMinus,
                LogosToken::PlusEq => Token::PlusEq,
                LogosToken::MinusEq => Token::MinusEq,
                LogosToken::StarEq => Token::StarEq,
                LogosToken::SlashEq => Token::SlashEq,
                LogosToken::Plus => Token::Plus,
                LogosToken::Minus => Token::Minus,
                LogosToken::Star => Token::Star,
                LogosToken::Slash => Token::Slash,
                LogosToken::Percent => Token::Percent,
                LogosToken::Amp => Token::Amp,
                LogosToken::Pipe => Token::Pipe,
                LogosToken::Caret => Token::Caret,
                LogosToken::Tilde => Token::Tilde,
                LogosToken::Bang => Token::Bang,
                LogosToken::Less => Token::Less,
                LogosToken::Greater => Token::Greater,
                LogosToken::Eq => Token::Eq,
                LogosToken::LParen => Token::LParen,
                LogosToken::RParen => Token::RParen,
                LogosToken::LBracket => Token::LBracket,
                LogosToken::RBracket => Token::RBracket,
                LogosToken::LBrace => Token::LBrace,
                LogosToken::RBrace => Token::RBrace,
                LogosToken::Comma => Token::Comma,
                LogosToken::Semi => Token::Semi,
                LogosToken::Whitespace | LogosToken::LineComment | LogosToken::BlockComment => {
                    unreachable!("trivia is skipped")
                }
            };
            tokens.push((token, token_line));
        }

        tokens.push((Token::Eof, line));
        Ok((tokens, warnings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Token> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .0
            .into_iter()
            .map(|(t, _)| t)
            .collect()
    }

    #[test]
    fn test_keywords_and_idents() {
        let tokens = lex("int main while whiley");
        assert_eq!(
            tokens,
            vec![
                Token::Int,
                Token::Ident("main".into()),
                Token::While,
                Token::Ident("whiley".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_multichar_operators_win() {
        let tokens = lex("a <= b << c < d");
        assert!(tokens.contains(&Token::LessEq));
        assert!(tokens.contains(&Token::Shl));
        assert!(tokens.contains(&Token::Less));
    }

    #[test]
    fn test_char_literals() {
        assert_eq!(lex(r"'a'")[0], Token::CharLit('a' as i64));
        assert_eq!(lex(r"'\n'")[0], Token::CharLit(10));
        assert_eq!(lex(r"'\0'")[0], Token::CharLit(0));
        assert_eq!(lex(r"'\\'")[0], Token::CharLit(92));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(lex(r#""a\tb\"c""#)[0], Token::Str("a\tb\"c".into()));
    }

    #[test]
    fn test_comments_skipped_lines_tracked() {
        let (tokens, _) = Lexer::new("// one\n/* two\nthree */ int x;")
            .tokenize()
            .unwrap();
        assert_eq!(tokens[0], (Token::Int, 3));
    }

    #[test]
    fn test_line_numbers() {
        let (tokens, _) = Lexer::new("int\nmain\n42").tokenize().unwrap();
        assert_eq!(tokens[0].1, 1);
        assert_eq!(tokens[1].1, 2);
        assert_eq!(tokens[2].1, 3);
    }

    #[test]
    fn test_unexpected_character() {
        let err = Lexer::new("int @x;").tokenize().unwrap_err();
        assert_eq!(
            err,
            LexError::UnexpectedCharacter {
                found: '@',
                line: 1
            }
        );
    }

    #[test]
    fn test_long_identifier_truncated_with_warning() {
        let long = "a".repeat(40);
        let (tokens, warnings) = Lexer::new(&long).tokenize().unwrap();
        assert_eq!(tokens[0].0, Token::Ident("a".repeat(32)));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_unknown_escape_warns_and_continues() {
        let (tokens, warnings) = Lexer::new(r"'\q'").tokenize().unwrap();
        assert_eq!(tokens[0].0, Token::CharLit('q' as i64));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_token_display_roundtrip() {
        let source = "int main ( ) { return 2 + 3 * 4 ; }";
        let tokens = lex(source);
        let rendered: Vec<String> = tokens[..tokens.len() - 1]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(rendered.join(" "), source);
    }
}
