//! Opcode catalog (§4.E).
//!
//! Numeric encodings are stable within this crate's version but, as §4.E
//! notes, are otherwise implementation-defined — only the grouping by role
//! and the operand layout per opcode are part of the contract.

use crate::instruction::OpType;
use strum::{Display, EnumIter};

/// One entry in the instruction catalog of §4.E.
#[derive(Debug, Display, EnumIter, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Opcode {
    // --- Literals / moves ---
    /// Load a constant-pool entry (or packed small immediate) into A.
    LoadConst = 0x00,
    /// Copy register B into A.
    Move = 0x01,
    /// Load a bool literal into A, with optional branch-skip in C.
    LoadBool = 0x02,
    /// Set registers A..A+B to Nil.
    LoadNil = 0x03,
    /// Set register A to `None`.
    LoadNone = 0x04,

    // --- Arithmetic ---
    /// A = B + C.
    Add = 0x10,
    /// A = B - C.
    Sub = 0x11,
    /// A = B * C.
    Mul = 0x12,
    /// A = B / C.
    Div = 0x13,
    /// A = B % C.
    Mod = 0x14,
    /// A = B ^ C (power).
    Pow = 0x15,
    /// A = -B (unary minus).
    Unm = 0x16,
    /// A = B + imm8 (immediate in the high byte of Bx).
    AddImm = 0x17,
    /// A = B - imm8.
    SubImm = 0x18,
    /// A = B * imm8.
    MulImm = 0x19,
    /// A = B / imm8.
    DivImm = 0x1a,

    // --- Compare (skip-next-if semantics) ---
    /// Skip next instruction based on B == C (A=0 skip-if-true).
    Eq = 0x20,
    /// Skip next instruction based on B < C.
    Lt = 0x21,
    /// Skip next instruction based on B <= C.
    Le = 0x22,
    /// Store (B == C) as a Bool into A.
    EqStore = 0x23,
    /// Store (B < C) as a Bool into A.
    LtStore = 0x24,
    /// Store (B <= C) as a Bool into A.
    LeStore = 0x25,

    // --- Logical ---
    /// A = !B.
    Not = 0x30,
    /// A = B && C.
    And = 0x31,
    /// A = B || C.
    Or = 0x32,

    // --- Control ---
    /// Unconditional relative jump by sBx.
    Jmp = 0x40,
    /// Skip next instruction based on truthiness of A, per C.
    Test = 0x41,
    /// Conditionally move and skip, combining Test and Move.
    TestSet = 0x42,
    /// Prepare a numeric `for` loop.
    ForPrep = 0x43,
    /// Advance and test a numeric `for` loop.
    ForLoop = 0x44,
    /// Return `n` values starting at register `reg`.
    Return = 0x45,

    // --- Aggregates ---
    /// Allocate a new array of the given size into A.
    NewArray = 0x50,
    /// Allocate a new empty table into A.
    NewTable = 0x51,
    /// A = container[index].
    GetIndex = 0x52,
    /// container[index] = value.
    SetIndex = 0x53,
    /// A = container[immediate index].
    GetIndexImm = 0x54,
    /// container[immediate index] = value.
    SetIndexImm = 0x55,
    /// A = container[start..end] (R[C]/R[C+1] carry start/end).
    Slice = 0x56,
    /// A = container.field (field name in the constant pool).
    GetField = 0x57,
    /// container.field = value.
    SetField = 0x58,
    /// A = len(B).
    Len = 0x59,

    // --- Wrappers ---
    /// A = Some(B).
    WrapSome = 0x60,
    /// A = Ok(B).
    WrapOk = 0x61,
    /// A = Err(B).
    WrapErr = 0x62,
    /// A = unwrap Option B (fatal on None).
    UnwrapOption = 0x63,
    /// A = unwrap Result B (fatal on Err).
    UnwrapResult = 0x64,
    /// Test the variant tag of B against kind C, skipping as Test does.
    TestTag = 0x65,

    // --- Globals ---
    /// A = globals[name].
    GetGlobal = 0x70,
    /// globals[name] = A.
    SetGlobal = 0x71,
    /// globals[name] = A, only if unbound (idempotent).
    InitGlobal = 0x72,

    // --- Refs ---
    /// Allocate a new heap object and wrap a Ref to it in A.
    NewRef = 0x80,
    /// Increment the strong refcount of the object referenced by A.
    IncRef = 0x81,
    /// Decrement the strong refcount of the object referenced by A.
    DecRef = 0x82,
    /// Allocate a Weak forwarder to the object referenced by B into A.
    NewWeak = 0x83,
    /// Attempt to promote the Weak in B to a strong Ref into A.
    WeakToStrong = 0x84,
    /// Ask the cycle detector to run, subject to the frame budget.
    CheckCycles = 0x85,

    // --- Coercion ---
    /// A = cast(B, targetKind).
    Cast = 0x90,

    // --- Calls and defer ---
    /// Call function `funcIdx` with `numArgs` arguments starting at A+1.
    Call = 0xa0,
    /// Reserved tail-call form; semantics equal to Call followed by Return.
    TailCall = 0xa1,
    /// Push a deferred block (PC = here + sBx) onto the frame's defer stack.
    PushDefer = 0xa2,
    /// Pop and run all deferred blocks LIFO.
    ExecDefers = 0xa3,
    /// Return control to the PC saved by the matching ExecDefers.
    DeferEnd = 0xa4,

    // --- Membership ---
    /// A = B in C (array/string containment).
    In = 0xb0,
    /// A = B not in C.
    NotIn = 0xb1,

    // --- Fused (peephole) ---
    /// Fused `R[rd] = R[ra] + R[rb] + R[rc]`.
    AddAdd = 0xc0,
    /// Fused `R[rd] = R[ra] * R[rb] + R[rc]`.
    MulAdd = 0xc1,
    /// Fused compare-then-jump; equals the unfused Eq/Lt/Le + Jmp pair.
    CmpJmp = 0xc2,
    /// Fused increment-then-test; equals `AddImm 1` + `Test`.
    IncTest = 0xc3,
    /// Fused load-add-store; equals `GetIndex`/`GetField` + `Add` + store.
    LoadAddStore = 0xc4,
    /// Fused get-add-set; equals `GetField` + `Add` + `SetField`.
    GetAddSet = 0xc5,
}

impl Opcode {
    /// Decode a raw opcode byte into a known [`Opcode`], if recognized.
    pub fn from_u8(byte: u8) -> Option<Self> {
        use Opcode::*;
        Some(match byte {
            0x00 => LoadConst,
            0x01 => Move,
            0x02 => LoadBool,
            0x03 => LoadNil,
            0x04 => LoadNone,
            0x10 => Add,
            0x11 => Sub,
            0x12 => Mul,
            0x13 => Div,
            0x14 => Mod,
            0x15 => Pow,
            0x16 => Unm,
            0x17 => AddImm,
            0x18 => SubImm,
            0x19 => MulImm,
            0x1a => DivImm,
            0x20 => Eq,
            0x21 => Lt,
            0x22 => Le,
            0x23 => EqStore,
            0x24 => LtStore,
            0x25 => LeStore,
            0x30 => Not,
            0x31 => And,
            0x32 => Or,
            0x40 => Jmp,
            0x41 => Test,
            0x42 => TestSet,
            0x43 => ForPrep,
            0x44 => ForLoop,
            0x45 => Return,
            0x50 => NewArray,
            0x51 => NewTable,
            0x52 => GetIndex,
            0x53 => SetIndex,
            0x54 => GetIndexImm,
            0x55 => SetIndexImm,
            0x56 => Slice,
            0x57 => GetField,
            0x58 => SetField,
            0x59 => Len,
            0x60 => WrapSome,
            0x61 => WrapOk,
            0x62 => WrapErr,
            0x63 => UnwrapOption,
            0x64 => UnwrapResult,
            0x65 => TestTag,
            0x70 => GetGlobal,
            0x71 => SetGlobal,
            0x72 => InitGlobal,
            0x80 => NewRef,
            0x81 => IncRef,
            0x82 => DecRef,
            0x83 => NewWeak,
            0x84 => WeakToStrong,
            0x85 => CheckCycles,
            0x90 => Cast,
            0xa0 => Call,
            0xa1 => TailCall,
            0xa2 => PushDefer,
            0xa3 => ExecDefers,
            0xa4 => DeferEnd,
            0xb0 => In,
            0xb1 => NotIn,
            0xc0 => AddAdd,
            0xc1 => MulAdd,
            0xc2 => CmpJmp,
            0xc3 => IncTest,
            0xc4 => LoadAddStore,
            0xc5 => GetAddSet,
            _ => return None,
        })
    }

    /// The fixed operand layout for this opcode.
    pub const fn op_type(self) -> OpType {
        use Opcode::*;
        match self {
            LoadBool | Add | Sub | Mul | Div | Mod | Pow | Unm | Eq | Lt | Le | EqStore
            | LtStore | LeStore | Not | And | Or | Test | GetIndex | SetIndex | Slice
            | TestTag | In | NotIn | Cast => OpType::Abc,

            LoadConst | LoadNil | LoadNone | AddImm | SubImm | MulImm | DivImm | NewArray
            | GetIndexImm | SetIndexImm | GetField | SetField | Len | WrapSome | WrapOk
            | WrapErr | UnwrapOption | UnwrapResult | GetGlobal | SetGlobal | InitGlobal
            | NewWeak | WeakToStrong | Move | NewTable | NewRef | IncRef | DecRef
            | CheckCycles => OpType::Abx,

            Jmp | TestSet | ForPrep | ForLoop | Return | PushDefer => OpType::AsBx,

            Call | TailCall => OpType::Call,

            ExecDefers | DeferEnd | AddAdd | MulAdd | CmpJmp | IncTest | LoadAddStore
            | GetAddSet => OpType::Ax,
        }
    }

    /// True for the fused peephole opcodes of §4.E, whose semantics must
    /// equal their unfused sequence.
    pub const fn is_fused(self) -> bool {
        matches!(
            self,
            Opcode::AddAdd
                | Opcode::MulAdd
                | Opcode::CmpJmp
                | Opcode::IncTest
                | Opcode::LoadAddStore
                | Opcode::GetAddSet
        )
    }

    /// True for opcodes that may allocate on the heap (§4.F: "Handlers
    /// that allocate ... go through §4.B").
    pub const fn allocates(self) -> bool {
        matches!(
            self,
            Opcode::NewArray
                | Opcode::NewTable
                | Opcode::NewRef
                | Opcode::NewWeak
                | Opcode::WrapSome
                | Opcode::WrapOk
                | Opcode::WrapErr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn every_opcode_round_trips_through_its_byte() {
        for op in Opcode::iter() {
            assert_eq!(Opcode::from_u8(op as u8), Some(op), "opcode {op:?}");
        }
    }

    #[test]
    fn fused_opcodes_are_exactly_the_ax_group_minus_defer_control() {
        for op in Opcode::iter() {
            if matches!(op.op_type(), OpType::Ax) {
                assert!(
                    op.is_fused() || matches!(op, Opcode::ExecDefers | Opcode::DeferEnd),
                    "{op:?} uses Ax layout but is neither fused nor a defer-control op"
                );
            }
        }
    }
}
