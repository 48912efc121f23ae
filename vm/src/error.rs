//! Interpreter-level error types (§7).
//!
//! Grounded on `fuel-vm::error::InterpreterError<StorageError>`: a small
//! enum distinguishing well-formed runtime panics from host/loader-level
//! failures, using `thiserror` here in place of the teacher's
//! `derive_more::Display` (both are `Display`-derivation crates from the
//! grounding pack; `thiserror` is used because it also derives
//! `std::error::Error`, which this workspace's error types need and the
//! teacher gets from a hand-written `impl std::error::Error` elsewhere).

use strand_asm::RuntimeErrorReason;

/// A source position derived from a function's debug record (§10.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePosition {
    /// Index into the program's file-name pool, if debug info is present.
    pub file: Option<u32>,
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

impl std::fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.file {
            Some(file) => write!(f, "file#{file}:{}:{}", self.line, self.column),
            None => write!(f, "<pc>:{}:{}", self.line, self.column),
        }
    }
}

/// A fatal runtime error (§7): a [`RuntimeErrorReason`] paired with the
/// instruction's program counter and, if available, its source position.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("runtime error at pc={pc} ({position}): {reason}")]
pub struct RuntimeFault {
    /// The reason execution halted.
    pub reason: RuntimeErrorReason,
    /// The program counter of the faulting instruction.
    pub pc: u32,
    /// The faulting instruction's source position, if debug info exists.
    pub position: SourcePosition,
}

/// Top-level error returned by host-facing operations.
#[derive(Debug, thiserror::Error)]
pub enum InterpreterError {
    /// A fatal runtime error halted execution (§7).
    #[error(transparent)]
    Runtime(#[from] RuntimeFault),
    /// The loader rejected a malformed program (§6).
    #[error("invalid program: {0}")]
    InvalidProgram(String),
    /// The heap verifier found an unrecoverable corruption (§4.D, §7:
    /// "mark the heap corrupt and halt the VM on the next allocation").
    #[error("heap corrupt: {0}")]
    HeapCorrupt(String),
    /// `execute` was called on a VM that is not `Idle` (§4.F state
    /// machine: "Halted is terminal for that invocation").
    #[error("vm is not idle (state: {0:?})")]
    NotIdle(crate::state::VmState),
}
