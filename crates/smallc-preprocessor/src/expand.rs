//! Macro substitution with hide-set rescanning.

use crate::MacroDef;
use rustc_hash::FxHashMap;

pub(crate) fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

pub(crate) fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Expand every macro in `line`.
pub(crate) fn substitute(macros: &FxHashMap<String, MacroDef>, line: &str) -> String {
    let mut hide = Vec::new();
    expand_text(macros, line, &mut hide)
}

/// Copy a quoted literal starting at `chars[i]` into `out`, honoring
/// backslash escapes. Returns the index past the closing quote.
fn copy_literal(chars: &[char], mut i: usize, out: &mut String) -> usize {
    let quote = chars[i];
    out.push(quote);
    i += 1;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        i += 1;
        if c == '\\' && i < chars.len() {
            out.push(chars[i]);
            i += 1;
        } else if c == quote {
            break;
        }
    }
    i
}

/// Parse a parenthesized argument list starting just inside the open paren.
/// Arguments split at top-level commas only; nested parentheses and quoted
/// literals are tracked. Returns the arguments and the index past `)`.
fn parse_args(chars: &[char], mut i: usize) -> (Vec<String>, usize) {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 1usize;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                let mut literal = String::new();
                i = copy_literal(chars, i, &mut literal);
                current.push_str(&literal);
                continue;
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    i += 1;
                    break;
                }
                current.push(c);
            }
            ',' if depth == 1 => {
                args.push(current.trim().to_owned());
                current.clear();
            }
            _ => current.push(c),
        }
        i += 1;
    }
    if !current.trim().is_empty() || !args.is_empty() {
        args.push(current.trim().to_owned());
    }
    (args, i)
}

/// Replace parameter names in a macro body with argument text.
fn substitute_params(body: &str, params: &[String], args: &[String]) -> String {
    let chars: Vec<char> = body.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' {
            i = copy_literal(&chars, i, &mut out);
        } else if is_ident_start(c) {
            let start = i;
            while i < chars.len() && is_ident_continue(chars[i]) {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            match params.iter().position(|p| *p == word) {
                Some(idx) => out.push_str(args.get(idx).map_or("", String::as_str)),
                None => out.push_str(&word),
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// Scan `text`, expanding macros not in the hide set. Each expansion is
/// rescanned with its own macro name hidden so a self-referential macro
/// cannot loop.
fn expand_text(macros: &FxHashMap<String, MacroDef>, text: &str, hide: &mut Vec<String>) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' {
            i = copy_literal(&chars, i, &mut out);
            continue;
        }
        if !is_ident_start(c) {
            out.push(c);
            i += 1;
            continue;
        }

        let start = i;
        while i < chars.len() && is_ident_continue(chars[i]) {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect();

        let def = match macros.get(&word) {
            Some(def) if !hide.contains(&word) => def,
            _ => {
                out.push_str(&word);
                continue;
            }
        };

        match &def.params {
            None => {
                hide.push(word);
                let expanded = expand_text(macros, &def.body, hide);
                hide.pop();
                out.push_str(&expanded);
            }
            Some(params) => {
                let mut j = i;
                while j < chars.len() && (chars[j] == ' ' || chars[j] == '\t') {
                    j += 1;
                }
                if j < chars.len() && chars[j] == '(' {
                    let (args, after) = parse_args(&chars, j + 1);
                    i = after;
                    let body = substitute_params(&def.body, params, &args);
                    hide.push(word);
                    let expanded = expand_text(macros, &body, hide);
                    hide.pop();
                    out.push_str(&expanded);
                } else {
                    // Function-like macro without a call: leave the name
                    out.push_str(&word);
                }
            }
        }
    }

    out
}
