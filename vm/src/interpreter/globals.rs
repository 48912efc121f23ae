//! Process-wide-looking but per-VM global table (§4.F "Globals").
//!
//! A global slot that holds a `Ref` counts toward that object's strong
//! refcount, same as a heap-held field, but globals need no `track_edge`
//! parent id: they are always roots, so the cycle detector never needs to
//! know about them specially — a live global simply keeps its target's
//! strong count above its in-cycle in-edge count, which is exactly what
//! `is_isolated` already checks (§4.C).

use std::rc::Rc;

use strand_asm::{Instruction, RuntimeErrorReason};

use super::Vm;
use crate::heap::Heap;
use crate::value::Value;

type OpResult = Result<(), RuntimeErrorReason>;

fn global_name(vm: &Vm, ins: Instruction) -> Result<Rc<str>, RuntimeErrorReason> {
    let name = vm.program.constants.get(ins.bx() as usize).ok_or(RuntimeErrorReason::UnknownGlobal)?;
    Ok(Rc::from(String::from_utf8_lossy(name.as_bytes()?).into_owned()))
}

/// `R[A] = globals[name]`.
pub(super) fn get_global(vm: &mut Vm, ins: Instruction) -> OpResult {
    let name = global_name(vm, ins)?;
    let value = vm.globals.get(&name).cloned().ok_or(RuntimeErrorReason::UnknownGlobal)?;
    vm.cur_frame_mut().set_reg(ins.a(), value);
    Ok(())
}

/// `globals[name] = R[A]`, always overwriting.
pub(super) fn set_global(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> OpResult {
    let name = global_name(vm, ins)?;
    let value = vm.cur_frame().reg(ins.a());
    let old = vm.globals.insert(name, value.clone());
    retarget(heap, vm, old, &value);
    Ok(())
}

/// `globals[name] = R[A]`, only if `name` is unbound; first binding
/// persists (§8.2).
pub(super) fn init_global(vm: &mut Vm, heap: &mut Heap, ins: Instruction) -> OpResult {
    let name = global_name(vm, ins)?;
    if vm.globals.contains_key(&name) {
        return Ok(());
    }
    let value = vm.cur_frame().reg(ins.a());
    if let Value::Ref(id) = &value {
        heap.inc_ref(*id);
    }
    vm.globals.insert(name, value);
    Ok(())
}

fn retarget(heap: &mut Heap, vm: &mut Vm, old: Option<Value>, new: &Value) {
    if let Some(Value::Ref(old_id)) = old {
        heap.dec_ref(old_id, vm);
    }
    if let Value::Ref(new_id) = new {
        heap.inc_ref(*new_id);
    }
}
