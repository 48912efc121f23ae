//! Instruction encoding and opcode catalog for the Strand runtime.
//!
//! This crate has no notion of a heap, a frame stack, or dispatch — it is
//! the pure data layer the `strand-vm` interpreter decodes and executes.
//! The split mirrors the teacher repo this workspace is grounded on, which
//! carves its instruction set out into its own crate (`fuel-asm`) so that
//! tooling (assemblers, disassemblers, the compiler front-end) can depend
//! on the instruction format without pulling in the interpreter.

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod error;
mod instruction;
mod opcode;
mod value_kind;

pub use error::RuntimeErrorReason;
pub use instruction::{Instruction, OpType};
pub use opcode::Opcode;
pub use value_kind::ValueKind;
