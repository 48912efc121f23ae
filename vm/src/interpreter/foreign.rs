//! Foreign-call dispatch (§4.H): marshals `Call`'s arguments against a
//! function table entry's declared parameter kinds, invokes the
//! host-registered closure, and checks the return kind. Foreign calls
//! never push a VM frame and are opaque to the cycle detector.

use strand_asm::RuntimeErrorReason;

use super::Vm;
use crate::bytecode::program::ForeignDescriptor;
use crate::value::Value;

/// A host-registered foreign function (§4.H, §6 `vm_register_foreign`).
pub(crate) type ForeignFn = Box<dyn FnMut(&[Value]) -> Result<Value, RuntimeErrorReason>>;

/// Marshal `args` against `descriptor`, invoke the closure registered
/// under `name`, and check the declared return kind.
pub(super) fn call(
    vm: &mut Vm,
    name: &str,
    descriptor: &ForeignDescriptor,
    args: &[Value],
) -> Result<Value, RuntimeErrorReason> {
    if args.len() != descriptor.param_kinds.len() {
        return Err(RuntimeErrorReason::ForeignCallFailed);
    }
    for (arg, expected) in args.iter().zip(&descriptor.param_kinds) {
        if arg.kind() != *expected {
            return Err(RuntimeErrorReason::TypeMismatch);
        }
    }
    let f = vm.foreign.get_mut(name).ok_or(RuntimeErrorReason::ForeignCallFailed)?;
    let result = f(args)?;
    if result.kind() != descriptor.return_kind {
        return Err(RuntimeErrorReason::TypeMismatch);
    }
    Ok(result)
}
