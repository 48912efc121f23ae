//! Aggregate, wrapper, coercion, and membership opcode handlers (§4.E).
//!
//! `NewArray`/`NewTable` build *inline* values straight into a register;
//! they never touch the heap (§3.1). `GetIndex`/`SetIndex`/`GetField`/
//! `SetField` resolve their container either way: an inline `Array`/
//! `Table` register is mutated directly with no bookkeeping (the
//! compiler is responsible for any `IncRef`/`DecRef` bracketing it
//! needs), while a `Ref` to a heap Table/Array object goes through
//! `Heap::track_edge` so the cycle detector sees the new edge.
//!
//! `GetField`/`SetField`/`GetIndexImm`/`SetIndexImm` are formally `Abx`
//! but are read here as raw `A`/`B`/`C` bytes, same as `NewRef` — this
//! caps field-name constants and literal indices at 255, traded for a
//! third operand the formal encoding doesn't have room for.

use strand_asm::{Instruction, RuntimeErrorReason, ValueKind};

use super::Vm;
use crate::heap::Heap;
use crate::value::{ObjectId, Table, Value};

type OpResult = Result<(), RuntimeErrorReason>;

/// `NewArray(A, size)`: `R[A] = Array[Nil; size]`, inline.
pub(super) fn new_array(vm: &mut Vm, ins: Instruction) -> OpResult {
    let size = ins.bx() as usize;
    vm.cur_frame_mut().set_reg(ins.a(), Value::Array(vec![Value::Nil; size]));
    Ok(())
}

/// `NewTable(A)`: `R[A] = Table{}`, inline.
pub(super) fn new_table(vm: &mut Vm, ins: Instruction) -> OpResult {
    vm.cur_frame_mut().set_reg(ins.a(), Value::Table(Table::new()));
    Ok(())
}

pub(super) fn value_ref_id(v: &Value) -> ObjectId {
    match v {
        Value::Ref(id) | Value::Weak(id) => *id,
        _ => 0,
    }
}

pub(super) fn index_to_usize(index: &Value, len: usize) -> Result<usize, RuntimeErrorReason> {
    let i = index.as_int()?;
    if i < 0 || i as usize >= len {
        return Err(RuntimeErrorReason::IndexOutOfBounds);
    }
    Ok(i as usize)
}

pub(super) fn read_indexed(container: &Value, index: &Value, heap: &Heap) -> Result<Value, RuntimeErrorReason> {
    match container {
        Value::Array(items) => Ok(items[index_to_usize(index, items.len())?].clone()),
        Value::String(bytes) => {
            let s = std::str::from_utf8(bytes).map_err(|_| RuntimeErrorReason::TypeMismatch)?;
            let i = index.as_int()?;
            if i < 0 {
                return Err(RuntimeErrorReason::IndexOutOfBounds);
            }
            s.chars().nth(i as usize).map(Value::Char).ok_or(RuntimeErrorReason::IndexOutOfBounds)
        }
        Value::Ref(id) => {
            let items = heap.array(*id).ok_or(RuntimeErrorReason::TypeMismatch)?;
            Ok(items[index_to_usize(index, items.len())?].clone())
        }
        _ => Err(RuntimeErrorReason::TypeMismatch),
    }
}

pub(super) fn write_indexed(vm: &mut Vm, heap: &mut Heap, dest: u8, index: &Value, new_value: Value) -> OpResult {
    let container = vm.cur_frame().reg(dest);
    match container {
        Value::Array(mut items) => {
            let i = index_to_usize(index, items.len())?;
            items[i] = new_value;
            vm.cur_frame_mut().set_reg(dest, Value::Array(items));
            Ok(())
        }
        Value::Ref(id) => {
            let len = heap.array(id).ok_or(RuntimeErrorReason::TypeMismatch)?.len();
            let i = index_to_usize(index, len)?;
            let old = heap.array(id).unwrap()[i].clone();
            heap.array_mut(id).unwrap()[i] = new_value.clone();
            heap.track_edge(id, value_ref_id(&old), value_ref_id(&new_value), vm);
            Ok(())
        }
        _ => Err(RuntimeErrorReason::TypeMismatch),
    }
}

/// `GetIndex(A,B,C)`: `R[A] = R[B][R[C]]`.
pub(super) fn get_index(vm: &mut Vm, heap: &Heap, ins: Instruction) -> OpResult {
    let container = vm.cur_frame().reg(ins.b());
    let index = vm.cur_frame().reg(ins.c());
    let value = read_indexed(&container, &index, heap)?;
    vm.cur_frame_mut().set_reg(ins.a(), value);
    Ok(())
}

/// `SetIndex(A,B,C)`: `R[A][R[B]] = R[C]`.
pub(super) fn set_index(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> OpResult {
    let index = vm.cur_frame().reg(ins.b());
    let new_value = vm.cur_frame().reg(ins.c());
    write_indexed(vm, heap, ins.a(), &index, new_value)
}

/// `GetIndexImm(A,B,imm)`: `R[A] = R[B][imm]`.
pub(super) fn get_index_imm(vm: &mut Vm, heap: &Heap, ins: Instruction) -> OpResult {
    let container = vm.cur_frame().reg(ins.b());
    let index = Value::Int(ins.c() as i64);
    let value = read_indexed(&container, &index, heap)?;
    vm.cur_frame_mut().set_reg(ins.a(), value);
    Ok(())
}

/// `SetIndexImm(A,imm,C)`: `R[A][imm] = R[C]`.
pub(super) fn set_index_imm(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> OpResult {
    let index = Value::Int(ins.b() as i64);
    let new_value = vm.cur_frame().reg(ins.c());
    write_indexed(vm, heap, ins.a(), &index, new_value)
}

fn resolve_range(start: i64, end_raw: i64, len: usize) -> Result<(usize, usize), RuntimeErrorReason> {
    let end = if end_raw < 0 { len as i64 } else { end_raw };
    if start < 0 || end < start || end > len as i64 {
        return Err(RuntimeErrorReason::InvalidSlice);
    }
    Ok((start as usize, end as usize))
}

/// `Slice(A,B,C)`: `R[A] = R[B][R[C]..R[C+1]]`; `R[C+1] < 0` means "to
/// end". Produces a fresh inline copy; elements are cloned, not
/// re-refcounted (§3.1).
pub(super) fn slice(vm: &mut Vm, heap: &Heap, ins: Instruction) -> OpResult {
    let container = vm.cur_frame().reg(ins.b());
    let start = vm.cur_frame().reg(ins.c()).as_int()?;
    let end_raw = vm.cur_frame().reg(ins.c().wrapping_add(1)).as_int()?;
    let result = match &container {
        Value::Array(items) => {
            let (s, e) = resolve_range(start, end_raw, items.len())?;
            Value::Array(items[s..e].to_vec())
        }
        Value::String(bytes) => {
            let (s, e) = resolve_range(start, end_raw, bytes.len())?;
            Value::String(bytes[s..e].into())
        }
        Value::Ref(id) => {
            let items = heap.array(*id).ok_or(RuntimeErrorReason::TypeMismatch)?;
            let (s, e) = resolve_range(start, end_raw, items.len())?;
            Value::Array(items[s..e].to_vec())
        }
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    };
    vm.cur_frame_mut().set_reg(ins.a(), result);
    Ok(())
}

/// `Len(A,B)`: `R[A] = len(R[B])`, constant-time.
pub(super) fn len(vm: &mut Vm, heap: &Heap, ins: Instruction) -> OpResult {
    let container = vm.cur_frame().reg(ins.b());
    let n = match &container {
        Value::Array(items) => items.len(),
        Value::String(bytes) => bytes.len(),
        Value::Table(t) => t.len(),
        Value::Ref(id) => match (heap.array(*id), heap.table(*id)) {
            (Some(a), _) => a.len(),
            (_, Some(t)) => t.len(),
            _ => return Err(RuntimeErrorReason::TypeMismatch),
        },
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    };
    vm.cur_frame_mut().set_reg(ins.a(), Value::Int(n as i64));
    Ok(())
}

pub(super) fn field_name(vm: &Vm, idx: u8) -> Result<std::rc::Rc<str>, RuntimeErrorReason> {
    let constant = vm.program.constants.get(idx as usize).ok_or(RuntimeErrorReason::TypeMismatch)?;
    Ok(std::rc::Rc::from(String::from_utf8_lossy(constant.as_bytes()?).into_owned()))
}

/// `GetField(A,B,nameConst)`: `R[A] = R[B].name`, `Nil` if unset.
pub(super) fn get_field(vm: &mut Vm, heap: &Heap, ins: Instruction) -> OpResult {
    let name = field_name(vm, ins.c())?;
    let container = vm.cur_frame().reg(ins.b());
    let value = match &container {
        Value::Table(t) => t.get(&name).cloned().unwrap_or(Value::Nil),
        Value::Ref(id) => heap.table(*id).ok_or(RuntimeErrorReason::TypeMismatch)?.get(&name).cloned().unwrap_or(Value::Nil),
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    };
    vm.cur_frame_mut().set_reg(ins.a(), value);
    Ok(())
}

/// `SetField(A,nameConst,C)`: `R[A].name = R[C]`.
pub(super) fn set_field(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> OpResult {
    let name = field_name(vm, ins.b())?;
    let container = vm.cur_frame().reg(ins.a());
    let new_value = vm.cur_frame().reg(ins.c());
    match container {
        Value::Table(mut t) => {
            t.set(name, new_value);
            vm.cur_frame_mut().set_reg(ins.a(), Value::Table(t));
        }
        Value::Ref(id) => {
            let old = heap.table(id).ok_or(RuntimeErrorReason::TypeMismatch)?.get(&name).cloned();
            let old_id = old.as_ref().map(value_ref_id).unwrap_or(0);
            let new_id = value_ref_id(&new_value);
            heap.table_mut(id).ok_or(RuntimeErrorReason::TypeMismatch)?.set(name, new_value);
            heap.track_edge(id, old_id, new_id, vm);
        }
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    }
    Ok(())
}

/// `WrapSome(A,B)`: `R[A] = Some(R[B])`.
pub(super) fn wrap_some(vm: &mut Vm, ins: Instruction) -> OpResult {
    let v = vm.cur_frame().reg(ins.b());
    vm.cur_frame_mut().set_reg(ins.a(), Value::Some(Box::new(v)));
    Ok(())
}

/// `WrapOk(A,B)`: `R[A] = Ok(R[B])`.
pub(super) fn wrap_ok(vm: &mut Vm, ins: Instruction) -> OpResult {
    let v = vm.cur_frame().reg(ins.b());
    vm.cur_frame_mut().set_reg(ins.a(), Value::Ok(Box::new(v)));
    Ok(())
}

/// `WrapErr(A,B)`: `R[A] = Err(R[B])`.
pub(super) fn wrap_err(vm: &mut Vm, ins: Instruction) -> OpResult {
    let v = vm.cur_frame().reg(ins.b());
    vm.cur_frame_mut().set_reg(ins.a(), Value::Err(Box::new(v)));
    Ok(())
}

/// `UnwrapOption(A,B)`: `R[A] = R[B]`'s `Some` payload; `None` is a nil
/// dereference (§7, §8.3).
pub(super) fn unwrap_option(vm: &mut Vm, ins: Instruction) -> OpResult {
    let v = vm.cur_frame().reg(ins.b()).unwrap_option()?;
    vm.cur_frame_mut().set_reg(ins.a(), v);
    Ok(())
}

/// `UnwrapResult(A,B)`: `R[A] = R[B]`'s `Ok`/`Err` payload.
pub(super) fn unwrap_result(vm: &mut Vm, ins: Instruction) -> OpResult {
    let v = vm.cur_frame().reg(ins.b()).unwrap_result()?;
    vm.cur_frame_mut().set_reg(ins.a(), v);
    Ok(())
}

/// `TestTag(A,kind)`: skip the next instruction unless `R[A]`'s kind
/// equals `kind`, mirroring `Test`'s skip-if-mismatch convention so a
/// matching arm falls straight through.
pub(super) fn test_tag(vm: &mut Vm, ins: Instruction) -> OpResult {
    let value = vm.cur_frame().reg(ins.a());
    let want = ValueKind::try_from(ins.b()).map_err(|_| RuntimeErrorReason::TypeMismatch)?;
    if value.kind() != want {
        vm.cur_frame_mut().advance();
    }
    Ok(())
}

fn convert(src: &Value, target: ValueKind) -> Result<Value, RuntimeErrorReason> {
    if src.kind() == target {
        return Ok(src.clone());
    }
    match (src, target) {
        (Value::Int(i), ValueKind::Float) => Ok(Value::Float(*i as f64)),
        (Value::Float(f), ValueKind::Int) => Ok(Value::Int(*f as i64)),
        (Value::Int(i), ValueKind::Bool) => Ok(Value::Bool(*i != 0)),
        (Value::Int(i), ValueKind::String) => Ok(Value::string(i.to_string())),
        (Value::Float(f), ValueKind::String) => Ok(Value::string(f.to_string())),
        (Value::Bool(b), ValueKind::String) => Ok(Value::string(b.to_string())),
        (Value::Char(c), ValueKind::String) => Ok(Value::string(c.to_string())),
        (Value::Char(c), ValueKind::Int) => Ok(Value::Int(*c as i64)),
        _ => Err(RuntimeErrorReason::InvalidCast),
    }
}

/// `Cast(A,B,targetKind)`: numeric/bool/string coercions of §4.E;
/// anything else is a runtime error.
pub(super) fn cast(vm: &mut Vm, ins: Instruction) -> OpResult {
    let src = vm.cur_frame().reg(ins.b());
    let target = ValueKind::try_from(ins.c()).map_err(|_| RuntimeErrorReason::InvalidCast)?;
    let result = convert(&src, target)?;
    vm.cur_frame_mut().set_reg(ins.a(), result);
    Ok(())
}

fn membership(vm: &mut Vm, ins: Instruction, want: bool) -> OpResult {
    let needle = vm.cur_frame().reg(ins.b());
    let haystack = vm.cur_frame().reg(ins.c());
    let found = match &haystack {
        Value::Array(items) => items.contains(&needle),
        Value::String(bytes) => {
            let hay = std::str::from_utf8(bytes).map_err(|_| RuntimeErrorReason::TypeMismatch)?;
            let needle_str = std::str::from_utf8(needle.as_bytes()?).map_err(|_| RuntimeErrorReason::TypeMismatch)?;
            hay.contains(needle_str)
        }
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    };
    vm.cur_frame_mut().set_reg(ins.a(), Value::Bool(found == want));
    Ok(())
}

/// `In(A,B,C)`: `R[A] = R[B] in R[C]`.
pub(super) fn in_op(vm: &mut Vm, ins: Instruction) -> OpResult {
    membership(vm, ins, true)
}

/// `NotIn(A,B,C)`: `R[A] = R[B] not in R[C]`.
pub(super) fn not_in_op(vm: &mut Vm, ins: Instruction) -> OpResult {
    membership(vm, ins, false)
}
