//! Fused peephole opcodes (§4.E "Fused"): each must behave exactly like
//! its unfused sequence, just without the intermediate register traffic.
//! All are `Ax`-encoded: `A` plus a 24-bit field `ax_registers()` unpacks
//! as three bytes.

use strand_asm::{Instruction, RuntimeErrorReason};

use super::aggregates::{field_name, read_indexed, value_ref_id, write_indexed};
use super::Vm;
use crate::heap::Heap;
use crate::value::Value;

type OpResult = Result<(), RuntimeErrorReason>;

fn numeric_add(a: &Value, b: &Value) -> Result<Value, RuntimeErrorReason> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            Ok(Value::Int(x.checked_add(*y).ok_or(RuntimeErrorReason::IntegerOverflow)?))
        }
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x + y)),
        _ => Err(RuntimeErrorReason::TypeMismatch),
    }
}

fn numeric_mul(a: &Value, b: &Value) -> Result<Value, RuntimeErrorReason> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            Ok(Value::Int(x.checked_mul(*y).ok_or(RuntimeErrorReason::IntegerOverflow)?))
        }
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x * y)),
        _ => Err(RuntimeErrorReason::TypeMismatch),
    }
}

/// `AddAdd(A,[B,C,D])`: `R[A] = R[B] + R[C] + R[D]`, equal to two chained
/// `Add`s.
pub(super) fn add_add(vm: &mut Vm, ins: Instruction) -> OpResult {
    let (b, c, d) = ins.ax_registers();
    let partial = numeric_add(&vm.cur_frame().reg(b), &vm.cur_frame().reg(c))?;
    let result = numeric_add(&partial, &vm.cur_frame().reg(d))?;
    vm.cur_frame_mut().set_reg(ins.a(), result);
    Ok(())
}

/// `MulAdd(A,[B,C,D])`: `R[A] = R[B] * R[C] + R[D]`, equal to `Mul`
/// followed by `Add`.
pub(super) fn mul_add(vm: &mut Vm, ins: Instruction) -> OpResult {
    let (b, c, d) = ins.ax_registers();
    let product = numeric_mul(&vm.cur_frame().reg(b), &vm.cur_frame().reg(c))?;
    let result = numeric_add(&product, &vm.cur_frame().reg(d))?;
    vm.cur_frame_mut().set_reg(ins.a(), result);
    Ok(())
}

/// `CmpJmp(kind,[B,C,off])`: equal to the matching `Lt`/`Le`/`Eq`
/// followed by an unconditional `Jmp`, but jumps directly on a true
/// comparison rather than skip-then-jump. `A` selects Eq(0)/Lt(1)/Le(2);
/// the jump offset is the third packed byte, read as signed.
pub(super) fn cmp_jmp(vm: &mut Vm, ins: Instruction) -> OpResult {
    let (b, c, off) = ins.ax_registers();
    let lhs = vm.cur_frame().reg(b);
    let rhs = vm.cur_frame().reg(c);
    let truth = match ins.a() {
        0 => lhs == rhs,
        1 => super::alu::numeric_lt(&lhs, &rhs)?,
        2 => super::alu::numeric_le(&lhs, &rhs)?,
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    };
    if truth {
        vm.cur_frame_mut().jump(off as i8 as i16);
    }
    Ok(())
}

/// `IncTest(A,[limit,_,polarity])`: `R[A] += 1`, then skip the next
/// instruction unless `R[A] < R[limit]` matches `polarity` (0 = skip if
/// true). Equal to `+imm 1` followed by a `Lt`-skip compare.
pub(super) fn inc_test(vm: &mut Vm, ins: Instruction) -> OpResult {
    let (limit_reg, _, polarity) = ins.ax_registers();
    let counter = vm.cur_frame().reg(ins.a()).as_int()?;
    let next = counter.checked_add(1).ok_or(RuntimeErrorReason::IntegerOverflow)?;
    vm.cur_frame_mut().set_reg(ins.a(), Value::Int(next));
    let limit = vm.cur_frame().reg(limit_reg).as_int()?;
    let skip_if_true = polarity == 0;
    if (next < limit) == skip_if_true {
        vm.cur_frame_mut().advance();
    }
    Ok(())
}

/// `LoadAddStore(A,[index,addend,_])`: `R[A][index] += R[addend]`, equal
/// to `GetIndex`, `Add`, `SetIndex`.
pub(super) fn load_add_store(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> OpResult {
    let (index_reg, addend_reg, _) = ins.ax_registers();
    let container = vm.cur_frame().reg(ins.a());
    let index = vm.cur_frame().reg(index_reg);
    let addend = vm.cur_frame().reg(addend_reg);
    let current = read_indexed(&container, &index, heap)?;
    let sum = numeric_add(&current, &addend)?;
    write_indexed(vm, heap, ins.a(), &index, sum)
}

/// `GetAddSet(A,[container,field,addend])`: `container.field += R[addend]`,
/// also leaving the new sum in `R[A]`. Equal to `GetField`, `Add`,
/// `SetField`.
pub(super) fn get_add_set(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> OpResult {
    let (container_reg, field_idx, addend_reg) = ins.ax_registers();
    let name = field_name(vm, field_idx)?;
    let container = vm.cur_frame().reg(container_reg);
    let addend = vm.cur_frame().reg(addend_reg);

    let current = match &container {
        Value::Table(t) => t.get(&name).cloned().unwrap_or(Value::Nil),
        Value::Ref(id) => {
            heap.table(*id).ok_or(RuntimeErrorReason::TypeMismatch)?.get(&name).cloned().unwrap_or(Value::Nil)
        }
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    };
    let sum = numeric_add(&current, &addend)?;

    match container {
        Value::Table(mut t) => {
            t.set(name, sum.clone());
            vm.cur_frame_mut().set_reg(container_reg, Value::Table(t));
        }
        Value::Ref(id) => {
            let old_id = value_ref_id(&current);
            heap.table_mut(id).ok_or(RuntimeErrorReason::TypeMismatch)?.set(name, sum.clone());
            heap.track_edge(id, old_id, value_ref_id(&sum), vm);
        }
        _ => unreachable!("checked above"),
    }

    vm.cur_frame_mut().set_reg(ins.a(), sum);
    Ok(())
}
