//! Ref/weak-handle opcode handlers (§4.B, §4.C, §4.E "Refs").
//!
//! `NewRef`'s packed operand widens the spec's two-way scalar/table
//! `kindFlag` to three heap kinds (Scalar/Table/Array, §3.2), since a
//! single bit cannot select among three. Layout, chosen here since §4.E
//! leaves operand packing implementation-defined: `B` names the source
//! register (read only for the Scalar kind); `C`'s low two bits are the
//! kind (0=Table, 1=Scalar, 2=Array), the remaining six bits are
//! `destructor index + 1` (0 = no destructor), recorded in `DESIGN.md`.

use strand_asm::{Instruction, RuntimeErrorReason};

use super::Vm;
use crate::heap::Heap;
use crate::value::Value;

type OpResult = Result<(), RuntimeErrorReason>;

const KIND_TABLE: u8 = 0;
const KIND_SCALAR: u8 = 1;
const KIND_ARRAY: u8 = 2;

/// `R[A] = Ref(alloc(...))`, per the packed kind/destructor byte in `C`.
pub(super) fn new_ref(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> OpResult {
    let packed = ins.c();
    let kind = packed & 0b11;
    let destructor_plus_one = packed >> 2;
    let destructor = if destructor_plus_one == 0 { None } else { Some((destructor_plus_one - 1) as u32) };

    let id = match kind {
        KIND_SCALAR => {
            let value = vm.cur_frame().reg(ins.b());
            heap.alloc_scalar(value, destructor)
        }
        KIND_TABLE => heap.alloc_table(destructor),
        KIND_ARRAY => heap.alloc_array(),
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    };
    vm.cur_frame_mut().set_reg(ins.a(), Value::Ref(id));
    Ok(())
}

/// `IncRef(A)`: increment the strong refcount of `R[A]`'s target. `R[A]`
/// may itself hold either a strong `Ref` or a `Weak` handle; either way
/// it names the target id to refcount.
pub(super) fn inc_ref(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> OpResult {
    let id = vm.cur_frame().reg(ins.a()).as_refcounted_id()?;
    heap.inc_ref(id);
    Ok(())
}

/// `DecRef(A)`: decrement the strong refcount of `R[A]`'s target, freeing
/// it (and, synchronously, running its destructor) if it reaches zero.
pub(super) fn dec_ref(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> OpResult {
    let id = vm.cur_frame().reg(ins.a()).as_refcounted_id()?;
    heap.dec_ref(id, vm);
    Ok(())
}

/// `NewWeak(A,B)`: `R[A] = Weak(target of R[B])`. `B`, like `Move`'s
/// source register, sits in the low byte of the Abx payload (`c()`).
pub(super) fn new_weak(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> OpResult {
    let target = vm.cur_frame().reg(ins.c()).as_ref_id()?;
    let id = heap.alloc_weak(target);
    vm.cur_frame_mut().set_reg(ins.a(), Value::Weak(id));
    Ok(())
}

/// `WeakToStrong(A,B)`: promote `R[B]` to a strong `Ref` in `R[A]`, or
/// `Nil` if the target has been freed (§8.3).
pub(super) fn weak_to_strong(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> OpResult {
    let weak_value = vm.cur_frame().reg(ins.c());
    let weak_id = weak_value.as_weak_id()?;
    let target = heap.weak_target(weak_id).unwrap_or(0);
    let result = match heap.weak_to_strong(weak_id) {
        Some(strong_id) => {
            debug_assert_eq!(strong_id, target);
            Value::Ref(strong_id)
        }
        None => Value::Nil,
    };
    vm.cur_frame_mut().set_reg(ins.a(), result);
    Ok(())
}

/// `CheckCycles`: ask the cycle detector to run, subject to the frame
/// budget if one is active.
pub(super) fn check_cycles(vm: &mut Vm, heap: &mut Heap, _ins: Instruction) -> OpResult {
    heap.maybe_detect_cycles_within_budget(vm);
    Ok(())
}
