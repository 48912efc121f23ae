//! Control-flow, call, and defer opcode handlers (§4.F).
//!
//! `Return`/`ForPrep`/`ForLoop` are formally `AsBx`-encoded but several of
//! them need more than one byte-sized field; since `Instruction`'s
//! accessors just slice fixed bit ranges out of the raw word regardless
//! of which constructor built it (see `strand_asm::Instruction`), this
//! module reads whichever raw accessor its packing actually needs — the
//! same trick `refs`/`globals` use for `NewRef`/`GetField`.

use strand_asm::{Instruction, RuntimeErrorReason};

use super::Vm;
use crate::error::RuntimeFault;
use crate::frame::{DeferEntry, Frame};
use crate::heap::Heap;
use crate::state::ExecuteState;
use crate::value::Value;

type OpResult = Result<(), RuntimeErrorReason>;

/// `Jmp(sBx)`: unconditional relative jump.
pub(super) fn op_jmp(vm: &mut Vm, ins: Instruction) {
    vm.cur_frame_mut().jump(ins.s_bx());
}

/// `Test(A,C)`: skip the next instruction unless `R[A]`'s truthiness
/// matches `C`.
pub(super) fn op_test(vm: &mut Vm, ins: Instruction) -> OpResult {
    let truth = vm.cur_frame().reg(ins.a()).truthy()?;
    if truth != (ins.c() != 0) {
        vm.cur_frame_mut().advance();
    }
    Ok(())
}

/// `TestSet(A,B,C)`: `R[A] := R[B]` if `R[B]`'s truthiness matches `C`,
/// else skip the next instruction.
pub(super) fn op_testset(vm: &mut Vm, ins: Instruction) -> OpResult {
    let src = vm.cur_frame().reg(ins.b());
    let truth = src.truthy()?;
    if truth == (ins.c() != 0) {
        vm.cur_frame_mut().set_reg(ins.a(), src);
    } else {
        vm.cur_frame_mut().advance();
    }
    Ok(())
}

/// `ForPrep(A,sBx)`: `R[A] -= R[A+2]` (undo the first `ForLoop` step),
/// then jump to the loop test.
pub(super) fn op_forprep(vm: &mut Vm, ins: Instruction) -> OpResult {
    let a = ins.a();
    let init = vm.cur_frame().reg(a).as_int()?;
    let step = vm.cur_frame().reg(a.wrapping_add(2)).as_int()?;
    let adjusted = init.checked_sub(step).ok_or(RuntimeErrorReason::IntegerOverflow)?;
    vm.cur_frame_mut().set_reg(a, Value::Int(adjusted));
    vm.cur_frame_mut().jump(ins.s_bx());
    Ok(())
}

/// `ForLoop(A,sBx)`: advance the counter by the step; if still within
/// range, publish it to `R[A+3]` and jump back to the loop body.
pub(super) fn op_forloop(vm: &mut Vm, ins: Instruction) -> OpResult {
    let a = ins.a();
    let cur = vm.cur_frame().reg(a).as_int()?;
    let step = vm.cur_frame().reg(a.wrapping_add(2)).as_int()?;
    let limit = vm.cur_frame().reg(a.wrapping_add(1)).as_int()?;
    let next = cur.checked_add(step).ok_or(RuntimeErrorReason::IntegerOverflow)?;
    let continues = match step.cmp(&0) {
        std::cmp::Ordering::Greater => next <= limit,
        std::cmp::Ordering::Less => next >= limit,
        std::cmp::Ordering::Equal => false,
    };
    vm.cur_frame_mut().set_reg(a, Value::Int(next));
    if continues {
        vm.cur_frame_mut().set_reg(a.wrapping_add(3), Value::Int(next));
        vm.cur_frame_mut().jump(ins.s_bx());
    }
    Ok(())
}

fn perform_return(vm: &mut Vm, values: Vec<Value>) -> ExecuteState {
    let returning = vm.frames.pop().expect("Return requires an active frame");
    match (vm.frames.last_mut(), returning.result_register) {
        (Some(caller), Some(reg)) => {
            caller.set_reg(reg, values.into_iter().next().unwrap_or(Value::Nil));
            ExecuteState::Proceed
        }
        _ => ExecuteState::Return(values),
    }
}

/// `Return(n, reg)`: return `n` values starting at register `reg`.
/// Packed as raw `A`/`B` bytes rather than the formal `sBx` field.
pub(super) fn op_return(vm: &mut Vm, ins: Instruction) -> Result<ExecuteState, RuntimeFault> {
    let count = ins.a();
    let start = ins.b();
    let values: Vec<Value> = (0..count).map(|i| vm.cur_frame().reg(start.wrapping_add(i))).collect();
    Ok(perform_return(vm, values))
}

fn call_args(vm: &Vm, base: u8, num_args: u8) -> Vec<Value> {
    (0..num_args).map(|i| vm.cur_frame().reg(base.wrapping_add(1).wrapping_add(i))).collect()
}

/// `Call(A, funcIdx, numArgs)`: invoke a bytecode or foreign function,
/// placing its result in `R[A]`.
pub(super) fn op_call(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> Result<ExecuteState, RuntimeFault> {
    let func_idx = ins.func_idx() as u32;
    let result_reg = ins.a();
    let entry = vm
        .program
        .function(func_idx)
        .cloned()
        .ok_or_else(|| vm.fault(RuntimeErrorReason::TypeMismatch))?;
    let args = call_args(vm, result_reg, ins.num_args());

    if let Some(descriptor) = &entry.foreign {
        let value =
            super::foreign::call(vm, &entry.name, descriptor, &args).map_err(|r| vm.fault(r))?;
        vm.cur_frame_mut().set_reg(result_reg, value);
        return Ok(ExecuteState::Proceed);
    }

    let _ = heap;
    let mut frame = Frame::new(func_idx, entry.entry_pc, entry.register_count, Some(result_reg));
    for (i, value) in args.into_iter().enumerate() {
        frame.set_reg(i as u8, value);
    }
    vm.frames.push(frame);
    Ok(ExecuteState::Proceed)
}

/// `TailCall(A, funcIdx, numArgs)`: equals `Call` immediately followed by
/// `Return` — the tail-calling frame is popped first, so the callee
/// returns straight to the original caller (§4.E).
pub(super) fn op_tailcall(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> Result<ExecuteState, RuntimeFault> {
    let func_idx = ins.func_idx() as u32;
    let base = ins.a();
    let entry = vm
        .program
        .function(func_idx)
        .cloned()
        .ok_or_else(|| vm.fault(RuntimeErrorReason::TypeMismatch))?;
    let args = call_args(vm, base, ins.num_args());

    if let Some(descriptor) = &entry.foreign {
        let value =
            super::foreign::call(vm, &entry.name, descriptor, &args).map_err(|r| vm.fault(r))?;
        return Ok(perform_return(vm, vec![value]));
    }

    let _ = heap;
    let caller = vm.frames.pop().expect("TailCall requires an active frame");
    let mut frame = Frame::new(func_idx, entry.entry_pc, entry.register_count, caller.result_register);
    for (i, value) in args.into_iter().enumerate() {
        frame.set_reg(i as u8, value);
    }
    vm.frames.push(frame);
    Ok(ExecuteState::Proceed)
}

/// `PushDefer(sBx)`: push a deferred block's PC onto the frame's defer
/// stack.
pub(super) fn op_push_defer(vm: &mut Vm, ins: Instruction) {
    let target_pc = (vm.cur_frame().pc as i64 + ins.s_bx() as i64) as u32;
    vm.cur_frame_mut().defer_stack.push(DeferEntry { target_pc });
}

/// `ExecDefers`: stash the current PC, pop the newest deferred block, and
/// jump to it. A no-op if no defers are pending.
pub(super) fn op_exec_defers(vm: &mut Vm) {
    let frame = vm.cur_frame_mut();
    if let Some(entry) = frame.defer_stack.pop() {
        let return_pc = frame.pc;
        frame.defer_return_stack.push(return_pc);
        frame.pc = entry.target_pc;
    }
}

/// `DeferEnd`: jump to the next pending deferred block, or back to the
/// stashed return PC once the defer stack is empty.
pub(super) fn op_defer_end(vm: &mut Vm) {
    let frame = vm.cur_frame_mut();
    if let Some(entry) = frame.defer_stack.pop() {
        frame.pc = entry.target_pc;
    } else if let Some(return_pc) = frame.defer_return_stack.pop() {
        frame.pc = return_pc;
    }
}
