//! Symbol and function tables for code generation.

use crate::error::{CompileError, CompileResult};
use crate::{Target, MAXGLOBALS, MAXLOCALS};
use rustc_hash::FxHashMap;
use smallc_parser::ast::Ty;

/// Where a variable lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Offset from the frame pointer (parameters and locals, all negative)
    Frame(i64),
    /// Addressed by its own label
    Global,
}

/// One resolved variable
#[derive(Debug, Clone)]
pub struct VarInfo {
    pub ty: Ty,
    pub array_len: Option<i64>,
    pub storage: Storage,
}

impl VarInfo {
    pub fn is_array(&self) -> bool {
        self.array_len.is_some()
    }
}

/// Global variable table, alive for the whole translation unit.
#[derive(Default)]
pub struct GlobalTable {
    vars: FxHashMap<String, VarInfo>,
}

impl GlobalTable {
    pub fn define(&mut self, name: &str, ty: Ty, array_len: Option<i64>, line: u32) -> CompileResult<()> {
        if self.vars.contains_key(name) {
            return Err(CompileError::DuplicateGlobal {
                name: name.to_owned(),
                line,
            });
        }
        if self.vars.len() >= MAXGLOBALS {
            return Err(CompileError::TooManyGlobals { max: MAXGLOBALS });
        }
        self.vars.insert(
            name.to_owned(),
            VarInfo {
                ty,
                array_len,
                storage: Storage::Global,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&VarInfo> {
        self.vars.get(name)
    }
}

/// Per-function frame: parameters spilled by the prologue, then locals.
///
/// The prologue pushes each argument register, so parameter `i` sits at
/// `-slot*(i+1)` from the frame pointer, where `slot` is the push width of
/// the target (8 on x86-64, 16 on AArch64). Locals continue downward in
/// 8-byte words.
pub struct Frame {
    vars: FxHashMap<String, VarInfo>,
    cursor: i64,
    param_bytes: i64,
    slot: i64,
}

impl Frame {
    pub fn new(target: Target) -> Self {
        Self {
            vars: FxHashMap::default(),
            cursor: 0,
            param_bytes: 0,
            slot: match target {
                Target::X64 => 8,
                Target::Arm64 => 16,
            },
        }
    }

    pub fn add_param(&mut self, name: &str, ty: Ty, line: u32) -> CompileResult<i64> {
        self.check_capacity(line)?;
        if self.vars.contains_key(name) {
            return Err(CompileError::DuplicateLocal {
                name: name.to_owned(),
                line,
            });
        }
        self.param_bytes += self.slot;
        let offset = -self.param_bytes;
        self.cursor = -self.param_bytes;
        self.vars.insert(
            name.to_owned(),
            VarInfo {
                ty,
                array_len: None,
                storage: Storage::Frame(offset),
            },
        );
        Ok(offset)
    }

    pub fn add_local(
        &mut self,
        name: &str,
        ty: Ty,
        array_len: Option<i64>,
        line: u32,
    ) -> CompileResult<i64> {
        self.check_capacity(line)?;
        if self.vars.contains_key(name) {
            return Err(CompileError::DuplicateLocal {
                name: name.to_owned(),
                line,
            });
        }
        let words = array_len.unwrap_or(1).max(1);
        self.cursor -= 8 * words;
        let offset = self.cursor;
        self.vars.insert(
            name.to_owned(),
            VarInfo {
                ty,
                array_len,
                storage: Storage::Frame(offset),
            },
        );
        Ok(offset)
    }

    fn check_capacity(&self, line: u32) -> CompileResult<()> {
        if self.vars.len() >= MAXLOCALS {
            return Err(CompileError::TooManyLocals {
                line,
                max: MAXLOCALS,
            });
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&VarInfo> {
        self.vars.get(name)
    }

    /// Bytes below the frame pointer, rounded up to a 16-byte multiple.
    pub fn frame_bytes(&self) -> i64 {
        (-self.cursor + 15) & !15
    }

    /// Bytes the prologue already claimed by spilling parameters.
    pub fn spilled_bytes(&self) -> i64 {
        self.param_bytes
    }
}

/// Known functions: definition flag and arity.
#[derive(Default)]
pub struct FunctionTable {
    funcs: FxHashMap<String, usize>,
}

impl FunctionTable {
    /// Record a definition; a second definition of the same name fails.
    pub fn define(&mut self, name: &str, nparams: usize, line: u32) -> CompileResult<()> {
        if self.funcs.contains_key(name) {
            return Err(CompileError::DuplicateFunction {
                name: name.to_owned(),
                line,
            });
        }
        self.funcs.insert(name.to_owned(), nparams);
        Ok(())
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }
}
