//! The closed catalog of fatal runtime-fault reasons (§7).
//!
//! Grounded on `fuel-asm::panic_reason::PanicReason`: a closed, `Display`-
//! able enum of "well-formed panic" causes, paired elsewhere
//! (`strand_vm::error::RuntimeFault`) with the triggering instruction and
//! its source position, the way `fuel-asm::PanicInstruction` pairs a
//! `PanicReason` with the raw instruction that caused it.

use strum::{Display, EnumIter};

/// Why the dispatch loop halted execution (§7).
#[derive(Debug, Display, EnumIter, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeErrorReason {
    /// An opcode was applied to a value of the wrong tag.
    #[strum(to_string = "type mismatch")]
    TypeMismatch,
    /// Signed 64-bit integer arithmetic overflowed.
    #[strum(to_string = "integer overflow")]
    IntegerOverflow,
    /// Integer division with a zero divisor.
    #[strum(to_string = "division by zero")]
    DivisionByZero,
    /// Integer modulo with a zero divisor.
    #[strum(to_string = "modulo by zero")]
    ModuloByZero,
    /// An array/string index was negative or >= length.
    #[strum(to_string = "index out of bounds")]
    IndexOutOfBounds,
    /// A slice's `start > end` (after resolving a negative end).
    #[strum(to_string = "invalid slice")]
    InvalidSlice,
    /// `Deref`-like access on a `None`/`Nil` where a value was required.
    #[strum(to_string = "nil dereference")]
    NilDeref,
    /// A foreign function signaled failure via its declared return kind.
    #[strum(to_string = "foreign call failed")]
    ForeignCallFailed,
    /// The heap verifier found an unrecoverable invariant violation.
    #[strum(to_string = "heap corrupt")]
    HeapCorrupt,
    /// `Cast` named a conversion that is not defined.
    #[strum(to_string = "invalid cast")]
    InvalidCast,
    /// `GetGlobal`/`SetGlobal` named a global that is not bound.
    #[strum(to_string = "unknown global")]
    UnknownGlobal,
    /// A jump target does not address an instruction boundary within the
    /// current function's range.
    #[strum(to_string = "jump out of range")]
    JumpOutOfRange,
}

impl std::error::Error for RuntimeErrorReason {}
