//! In-memory bytecode program (§3.4).
//!
//! Grounded on `fuel_vm::Interpreter`'s construction-time view of a
//! transaction's script/predicate bytecode plus its constants, and on
//! the teacher's general preference for one immutable, fully-validated
//! struct handed to the interpreter rather than lazily-resolved lookups.

use std::collections::HashMap;

use strand_asm::{Instruction, ValueKind};

use crate::value::Value;

/// A foreign function descriptor (§3.4, §4.H).
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignDescriptor {
    /// Host library name the symbol is resolved from.
    pub library: String,
    /// Symbol name within that library.
    pub symbol: String,
    /// Declared parameter kinds, in order.
    pub param_kinds: Vec<ValueKind>,
    /// Declared return kind.
    pub return_kind: ValueKind,
}

/// One entry in the function table (§3.4, §6).
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionEntry {
    /// Name, for diagnostics and the foreign-call dispatch table.
    pub name: String,
    /// PC of the function's first instruction.
    pub entry_pc: u32,
    /// Declared parameter count.
    pub param_count: u16,
    /// Size of the register file this function needs.
    pub register_count: u16,
    /// Parameter names, for debugging.
    pub param_names: Vec<String>,
    /// If `Some`, this entry is a foreign function and has no bytecode
    /// body; `entry_pc`/`register_count` are unused.
    pub foreign: Option<ForeignDescriptor>,
}

impl FunctionEntry {
    /// True if this entry is implemented in bytecode (not foreign).
    pub fn is_bytecode(&self) -> bool {
        self.foreign.is_none()
    }
}

/// One instruction's source position, keyed by PC (§10.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugRecord {
    /// Index into [`DebugInfo::files`].
    pub file: u32,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

/// Optional per-instruction debug positions (§7, §10.6).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugInfo {
    /// File-name pool.
    pub files: Vec<String>,
    /// PC -> source position. Absent entries report PC only.
    pub positions: HashMap<u32, DebugRecord>,
}

/// A fully-loaded, immutable bytecode program (§3.4).
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// The constant pool, indexed by `LoadConst`/`GetGlobal`-style
    /// operands (§4.E).
    pub constants: Vec<Value>,
    /// The function table, indexed by `Call`'s `funcIdx` operand.
    pub functions: Vec<FunctionEntry>,
    /// Type name -> destructor function index, if any (§3.4).
    pub destructors: HashMap<String, Option<u32>>,
    /// The flat instruction vector shared by every function.
    pub instructions: Vec<Instruction>,
    /// Optional debug positions.
    pub debug: DebugInfo,
    /// Index of the entry function in `functions` (§2: "an initial frame
    /// pointing at the entry function").
    pub entry_function: u32,
}

impl Program {
    /// Look up a function by index.
    pub fn function(&self, idx: u32) -> Option<&FunctionEntry> {
        self.functions.get(idx as usize)
    }

    /// Look up the source position for a PC, falling back to a
    /// PC-only position when no debug info was loaded.
    pub fn position_of(&self, pc: u32) -> crate::error::SourcePosition {
        match self.debug.positions.get(&pc) {
            Some(rec) => crate::error::SourcePosition {
                file: Some(rec.file),
                line: rec.line,
                column: rec.column,
            },
            None => crate::error::SourcePosition { file: None, line: pc, column: 0 },
        }
    }
}
