//! Small-C preprocessor.
//!
//! A line-oriented text-to-text expander: `#include` with a bounded include
//! stack, object- and function-like `#define`, `#undef`, conditional
//! compilation (`#ifdef`/`#ifndef`/`#else`/`#endif`), `#error`, and
//! backslash line splicing. Macro substitution only touches complete
//! identifiers and never fires inside string or character literals.

mod expand;

use expand::is_ident_start;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Maximum `#include` nesting depth
pub const MAX_INCLUDES: usize = 16;

/// Maximum conditional nesting depth
pub const MAX_IF_STACK: usize = 32;

pub type PreprocessResult<T> = Result<T, PreprocessError>;

/// Preprocessing errors
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("{file}:{line}: cannot open include file: {name}")]
    IncludeOpen {
        file: String,
        line: u32,
        name: String,
    },

    #[error("{file}:{line}: too many nested includes (max {MAX_INCLUDES})")]
    TooManyIncludes { file: String, line: u32 },

    #[error("{file}:{line}: too many nested conditionals (max {MAX_IF_STACK})")]
    TooManyConditionals { file: String, line: u32 },

    #[error("{file}:{line}: #else without #ifdef/#ifndef")]
    ElseWithoutIf { file: String, line: u32 },

    #[error("{file}:{line}: #endif without #ifdef/#ifndef")]
    EndifWithoutIf { file: String, line: u32 },

    #[error("{file}: unterminated #ifdef/#ifndef at end of file")]
    UnterminatedConditional { file: String },

    #[error("{file}:{line}: #error {message}")]
    UserError {
        file: String,
        line: u32,
        message: String,
    },

    #[error("cannot read {file}: {source}")]
    Io {
        file: String,
        source: std::io::Error,
    },
}

/// A stored macro definition
#[derive(Debug, Clone)]
pub struct MacroDef {
    /// `None` for object-like macros
    pub params: Option<Vec<String>>,
    pub body: String,
}

/// Preprocessor state: macro table, conditional stack, include depth.
pub struct Preprocessor {
    macros: FxHashMap<String, MacroDef>,
    /// Saved skip states of enclosing conditionals
    cond_stack: Vec<bool>,
    skipping: bool,
    include_depth: usize,
    out: String,
}

impl Preprocessor {
    pub fn new() -> Self {
        let mut macros = FxHashMap::default();
        macros.insert(
            "__SMALLC__".to_owned(),
            MacroDef {
                params: None,
                body: "1".to_owned(),
            },
        );
        Self {
            macros,
            cond_stack: Vec::new(),
            skipping: false,
            include_depth: 0,
            out: String::new(),
        }
    }

    /// Preprocess a file from disk, returning the expanded text.
    pub fn process_file(mut self, path: &Path) -> PreprocessResult<String> {
        self.include(path, path.display().to_string(), 0)?;
        self.finish(&path.display().to_string())
    }

    /// Preprocess in-memory source, returning the expanded text.
    pub fn process_source(mut self, source: &str, name: &str) -> PreprocessResult<String> {
        self.run(source, name, None)?;
        self.finish(name)
    }

    fn finish(self, file: &str) -> PreprocessResult<String> {
        if !self.cond_stack.is_empty() {
            return Err(PreprocessError::UnterminatedConditional {
                file: file.to_owned(),
            });
        }
        Ok(self.out)
    }

    fn include(&mut self, path: &Path, display: String, from_line: u32) -> PreprocessResult<()> {
        if self.include_depth >= MAX_INCLUDES {
            return Err(PreprocessError::TooManyIncludes {
                file: display,
                line: from_line,
            });
        }
        let source = std::fs::read_to_string(path).map_err(|source| PreprocessError::Io {
            file: display.clone(),
            source,
        })?;
        self.include_depth += 1;
        let dir = path.parent().map(Path::to_path_buf);
        let result = self.run(&source, &display, dir);
        self.include_depth -= 1;
        result
    }

    fn run(&mut self, source: &str, file: &str, dir: Option<PathBuf>) -> PreprocessResult<()> {
        let mut spliced = String::new();
        let mut line_no = 0u32;
        let mut start_line = 0u32;

        for line in source.lines() {
            line_no += 1;
            if spliced.is_empty() {
                start_line = line_no;
            }
            spliced.push_str(line);
            if let Some(stripped) = spliced.strip_suffix('\\') {
                spliced.truncate(stripped.len());
                continue;
            }
            let logical = std::mem::take(&mut spliced);
            self.process_line(&logical, file, start_line, dir.as_deref())?;
        }
        if !spliced.is_empty() {
            self.process_line(&spliced, file, start_line, dir.as_deref())?;
        }
        Ok(())
    }

    fn process_line(
        &mut self,
        line: &str,
        file: &str,
        line_no: u32,
        dir: Option<&Path>,
    ) -> PreprocessResult<()> {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix('#') {
            return self.directive(rest.trim_start(), file, line_no, dir);
        }
        if !self.skipping {
            self.out.push_str(&expand::substitute(&self.macros, line));
            self.out.push('\n');
        }
        Ok(())
    }

    fn directive(
        &mut self,
        rest: &str,
        file: &str,
        line_no: u32,
        dir: Option<&Path>,
    ) -> PreprocessResult<()> {
        let (word, args) = split_word(rest);
        match word {
            "include" if !self.skipping => self.do_include(args, file, line_no, dir),
            "define" if !self.skipping => {
                self.do_define(args);
                Ok(())
            }
            "undef" if !self.skipping => {
                let (name, _) = split_word(args);
                self.macros.remove(name);
                Ok(())
            }
            "ifdef" | "ifndef" => {
                if self.cond_stack.len() >= MAX_IF_STACK {
                    return Err(PreprocessError::TooManyConditionals {
                        file: file.to_owned(),
                        line: line_no,
                    });
                }
                let (name, _) = split_word(args);
                let defined = self.macros.contains_key(name);
                let take = if word == "ifdef" { defined } else { !defined };
                self.cond_stack.push(self.skipping);
                if !take && !self.skipping {
                    self.skipping = true;
                }
                Ok(())
            }
            "else" => {
                match self.cond_stack.last() {
                    None => Err(PreprocessError::ElseWithoutIf {
                        file: file.to_owned(),
                        line: line_no,
                    }),
                    // Only flip when the enclosing context itself emits
                    Some(false) => {
                        self.skipping = !self.skipping;
                        Ok(())
                    }
                    Some(true) => Ok(()),
                }
            }
            "endif" => match self.cond_stack.pop() {
                Some(saved) => {
                    self.skipping = saved;
                    Ok(())
                }
                None => Err(PreprocessError::EndifWithoutIf {
                    file: file.to_owned(),
                    line: line_no,
                }),
            },
            "error" if !self.skipping => Err(PreprocessError::UserError {
                file: file.to_owned(),
                line: line_no,
                message: args.trim().to_owned(),
            }),
            // Unknown directives (and suppressed ones inside skipped blocks)
            // are dropped.
            _ => Ok(()),
        }
    }

    fn do_include(
        &mut self,
        args: &str,
        file: &str,
        line_no: u32,
        dir: Option<&Path>,
    ) -> PreprocessResult<()> {
        let args = args.trim_start();
        let Some(rest) = args.strip_prefix('"') else {
            return Ok(());
        };
        let Some(end) = rest.find('"') else {
            return Ok(());
        };
        let name = &rest[..end];
        let mut path = PathBuf::from(name);
        if path.is_relative() {
            if let Some(dir) = dir {
                let candidate = dir.join(name);
                if candidate.exists() {
                    path = candidate;
                }
            }
        }
        if !path.exists() {
            return Err(PreprocessError::IncludeOpen {
                file: file.to_owned(),
                line: line_no,
                name: name.to_owned(),
            });
        }
        self.include(&path, name.to_owned(), line_no)
    }

    fn do_define(&mut self, args: &str) {
        let args = args.trim_start();
        let name_end = args
            .char_indices()
            .find(|&(i, c)| {
                if i == 0 {
                    !is_ident_start(c)
                } else {
                    !expand::is_ident_continue(c)
                }
            })
            .map_or(args.len(), |(i, _)| i);
        if name_end == 0 {
            return;
        }
        let name = &args[..name_end];
        let rest = &args[name_end..];

        // A parameter list only counts when the paren hugs the name
        let (params, body) = if let Some(plist) = rest.strip_prefix('(') {
            let close = plist.find(')').unwrap_or(plist.len());
            let params: Vec<String> = plist[..close]
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect();
            let body = plist.get(close + 1..).unwrap_or("");
            (Some(params), body)
        } else {
            (None, rest)
        };

        self.macros.insert(
            name.to_owned(),
            MacroDef {
                params,
                body: body.trim().to_owned(),
            },
        );
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Split off a leading word (identifier characters) from `text`.
fn split_word(text: &str) -> (&str, &str) {
    let end = text
        .char_indices()
        .find(|&(_, c)| !expand::is_ident_continue(c))
        .map_or(text.len(), |(i, _)| i);
    (&text[..end], &text[end..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pp(source: &str) -> String {
        Preprocessor::new().process_source(source, "test.c").unwrap()
    }

    #[test]
    fn test_plain_text_passthrough() {
        assert_eq!(pp("int main() { return 0; }\n"), "int main() { return 0; }\n");
    }

    #[test]
    fn test_object_macro() {
        let out = pp("#define N 10\nint a[N];\n");
        assert_eq!(out, "int a[10];\n");
    }

    #[test]
    fn test_function_macro_nested_call() {
        let out = pp("#define ADD(x,y) ((x)+(y))\nint main(){ return ADD(3,ADD(4,5)); }\n");
        assert_eq!(out, "int main(){ return ((3)+((4)+(5))); }\n");
    }

    #[test]
    fn test_no_expansion_in_strings() {
        let out = pp("#define FOO bar\nchar *s = \"FOO\"; int x = FOO;\n");
        assert_eq!(out, "char *s = \"FOO\"; int x = bar;\n");
    }

    #[test]
    fn test_ifdef_taken_and_skipped() {
        let out = pp("#define FOO\n#ifdef FOO\nint main(){ return 7; }\n#else\nint main(){ return 0; }\n#endif\n");
        assert_eq!(out, "int main(){ return 7; }\n");
    }

    #[test]
    fn test_ifndef() {
        let out = pp("#ifndef MISSING\nyes\n#else\nno\n#endif\n");
        assert_eq!(out, "yes\n");
    }

    #[test]
    fn test_nested_conditionals_inherit_skip() {
        let src = "#ifdef MISSING\n#ifdef ALSO_MISSING\na\n#else\nb\n#endif\nc\n#endif\nd\n";
        assert_eq!(pp(src), "d\n");
    }

    #[test]
    fn test_undef() {
        let out = pp("#define N 1\n#undef N\n#ifdef N\ndefined\n#else\nundefined\n#endif\n");
        assert_eq!(out, "undefined\n");
    }

    #[test]
    fn test_line_splicing() {
        let out = pp("#define MSG hello \\\nworld\nMSG\n");
        assert_eq!(out, "hello world\n");
    }

    #[test]
    fn test_predefined_smallc() {
        let out = pp("#ifdef __SMALLC__\nyes\n#endif\n");
        assert_eq!(out, "yes\n");
    }

    #[test]
    fn test_error_directive() {
        let err = Preprocessor::new()
            .process_source("#error something broke\n", "t.c")
            .unwrap_err();
        assert!(matches!(err, PreprocessError::UserError { line: 1, .. }));
    }

    #[test]
    fn test_error_in_skipped_block_ignored() {
        let out = pp("#ifdef MISSING\n#error unreachable\n#endif\nok\n");
        assert_eq!(out, "ok\n");
    }

    #[test]
    fn test_unterminated_conditional() {
        let err = Preprocessor::new()
            .process_source("#ifdef FOO\nbody\n", "t.c")
            .unwrap_err();
        assert!(matches!(err, PreprocessError::UnterminatedConditional { .. }));
    }

    #[test]
    fn test_else_without_if() {
        let err = Preprocessor::new().process_source("#else\n", "t.c").unwrap_err();
        assert!(matches!(err, PreprocessError::ElseWithoutIf { .. }));
    }

    #[test]
    fn test_line_accounting() {
        // Output lines = input lines minus directive lines minus skipped lines
        let source = "#define A 1\nint x = A;\n#ifdef A\nint y;\n#endif\nint z;\n";
        let out = pp(source);
        assert_eq!(out.lines().count(), 3);
        assert_eq!(out, "int x = 1;\nint y;\nint z;\n");
    }

    #[test]
    fn test_idempotent_on_directive_free_input() {
        let source = "int x;\nint main() { return x; }\n";
        let once = pp(source);
        let twice = pp(&once);
        assert_eq!(once, twice);
        assert_eq!(once, source);
    }

    #[test]
    fn test_includes_from_disk() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("defs.h");
        let mut f = std::fs::File::create(&header).unwrap();
        writeln!(f, "#define ANSWER 42").unwrap();

        let main = dir.path().join("main.c");
        let mut f = std::fs::File::create(&main).unwrap();
        writeln!(f, "#include \"defs.h\"").unwrap();
        writeln!(f, "int main() {{ return ANSWER; }}").unwrap();

        let out = Preprocessor::new().process_file(&main).unwrap();
        assert_eq!(out, "int main() { return 42; }\n");
    }

    #[test]
    fn test_missing_include_fails() {
        let err = Preprocessor::new()
            .process_source("#include \"nope_not_here.h\"\n", "t.c")
            .unwrap_err();
        assert!(matches!(err, PreprocessError::IncludeOpen { .. }));
    }
}
