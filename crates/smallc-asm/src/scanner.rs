//! Line-oriented scanning: labels, mnemonics and operand splitting.

/// A scanned source line
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Line {
    pub labels: Vec<String>,
    pub mnemonic: Option<String>,
    pub operands: Vec<String>,
}

fn is_label_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '.' || c == '$'
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$'
}

/// Split a raw source line into labels, a mnemonic and raw operand strings.
/// Returns `None` for blank lines and comments (`#` or `;` in the first
/// non-space column).
pub fn scan_line(raw: &str) -> Option<Line> {
    let mut rest = raw.trim();
    if rest.is_empty() || rest.starts_with('#') || rest.starts_with(';') {
        return None;
    }

    let mut line = Line::default();

    // Leading `name:` labels, possibly several
    loop {
        let end = rest
            .char_indices()
            .find(|&(i, c)| {
                if i == 0 {
                    !is_label_start(c)
                } else {
                    !is_label_char(c)
                }
            })
            .map_or(rest.len(), |(i, _)| i);
        if end > 0 && rest[end..].starts_with(':') {
            line.labels.push(rest[..end].to_owned());
            rest = rest[end + 1..].trim_start();
        } else {
            break;
        }
    }

    if rest.is_empty() {
        return Some(line);
    }

    // Mnemonic: directives start with '.', conditional branches contain '.'
    let end = rest
        .char_indices()
        .find(|&(_, c)| !(c.is_ascii_alphanumeric() || c == '.' || c == '_'))
        .map_or(rest.len(), |(i, _)| i);
    line.mnemonic = Some(rest[..end].to_owned());
    rest = rest[end..].trim_start();

    if !rest.is_empty() {
        line.operands = split_operands(rest);
    }
    Some(line)
}

/// Split operand text at top-level commas. Commas inside parentheses,
/// brackets and quoted literals do not split; a trailing `!` (AArch64
/// pre-index) stays attached to its operand.
pub fn split_operands(text: &str) -> Vec<String> {
    let mut operands = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                current.push(c);
                let quote = c;
                while let Some(inner) = chars.next() {
                    current.push(inner);
                    if inner == '\\' {
                        if let Some(esc) = chars.next() {
                            current.push(esc);
                        }
                    } else if inner == quote {
                        break;
                    }
                }
            }
            '(' | '[' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                operands.push(current.trim().to_owned());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        operands.push(current.trim().to_owned());
    }
    operands
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_and_comment_lines() {
        assert_eq!(scan_line(""), None);
        assert_eq!(scan_line("   "), None);
        assert_eq!(scan_line("# a comment"), None);
        assert_eq!(scan_line("; also a comment"), None);
    }

    #[test]
    fn test_label_only() {
        let line = scan_line("main:").unwrap();
        assert_eq!(line.labels, ["main"]);
        assert_eq!(line.mnemonic, None);
    }

    #[test]
    fn test_label_and_instruction() {
        let line = scan_line("L3: movq %rax, %rbx").unwrap();
        assert_eq!(line.labels, ["L3"]);
        assert_eq!(line.mnemonic.as_deref(), Some("movq"));
        assert_eq!(line.operands, ["%rax", "%rbx"]);
    }

    #[test]
    fn test_directive() {
        let line = scan_line(".globl main").unwrap();
        assert_eq!(line.mnemonic.as_deref(), Some(".globl"));
        assert_eq!(line.operands, ["main"]);
    }

    #[test]
    fn test_memory_operand_commas_protected() {
        let line = scan_line("movq 8(%rbp,%rdx,4), %rax").unwrap();
        assert_eq!(line.operands, ["8(%rbp,%rdx,4)", "%rax"]);
    }

    #[test]
    fn test_arm64_writeback_operand() {
        let line = scan_line("stp x29, x30, [sp, #-16]!").unwrap();
        assert_eq!(line.operands, ["x29", "x30", "[sp, #-16]!"]);
    }

    #[test]
    fn test_post_index_operand() {
        let line = scan_line("ldr x1, [sp], #16").unwrap();
        assert_eq!(line.operands, ["x1", "[sp]", "#16"]);
    }

    #[test]
    fn test_string_operand_with_comma() {
        let line = scan_line(".asciz \"a, b\"").unwrap();
        assert_eq!(line.operands, ["\"a, b\""]);
    }

    #[test]
    fn test_conditional_branch_mnemonic() {
        let line = scan_line("b.le L4").unwrap();
        assert_eq!(line.mnemonic.as_deref(), Some("b.le"));
        assert_eq!(line.operands, ["L4"]);
    }
}
