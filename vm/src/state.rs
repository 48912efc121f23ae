//! VM state machine (§4.F) and execution outcomes.
//!
//! Grounded on `fuel-vm::state::{ExecuteState, ProgramState}`: a small
//! per-instruction result distinguishing "keep going" from "the program
//! is done", layered under a VM-wide state machine.

use crate::value::Value;

/// The VM's current state (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VmState {
    /// Constructed but `execute` has not been called yet.
    #[default]
    Idle,
    /// Executing normal program instructions.
    Running,
    /// Executing inside a synchronously-invoked destructor (§4.F).
    InDestructor,
    /// `execute` has returned; terminal for this invocation.
    Halted,
}

/// Per-instruction dispatch result: either keep running, or the current
/// frame returned/the entry frame's execution concluded.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExecuteState {
    /// Proceed to the next instruction.
    Proceed,
    /// The current frame executed `Return`; `Vec<Value>` is the set of
    /// returned values.
    Return(Vec<Value>),
}

/// The outcome of a completed `Vm::execute` call (§6: `vm_execute(vm) ->
/// exit_code`).
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramOutcome {
    /// The entry frame returned. `exit_code` is the returned `Int`, if
    /// the return value was an `Int` (§4.F: "yields an exit code if the
    /// returned value is Int"), else `0`.
    Returned {
        /// The process exit code.
        exit_code: i64,
        /// The raw return value(s) of the entry function.
        values: Vec<Value>,
    },
}

impl ProgramOutcome {
    /// The process exit code for this outcome.
    pub fn exit_code(&self) -> i64 {
        match self {
            ProgramOutcome::Returned { exit_code, .. } => *exit_code,
        }
    }
}
