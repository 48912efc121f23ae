//! Host-facing embedding surface (§4.H, §6).
//!
//! The spec describes the host boundary as a small set of C-shaped free
//! functions (`vm_new`, `vm_execute`, `vm_register_foreign`, ...); here
//! they are ordinary methods on [`crate::Vm`] plus this one config
//! struct, the way `fuel_vm::interpreter::InterpreterParams` carries a
//! VM's startup knobs as a plain data type rather than constructor
//! arguments threaded individually.

/// Host-configurable defaults applied when a [`crate::Vm`] is built
/// (§6). Foreign functions are registered after construction via
/// [`crate::Vm::register_foreign`], not through this struct, since a
/// foreign closure isn't `Clone`/`Default`-friendly data.
#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    /// If set, applied as the VM's first cycle-scan frame budget (§4.C),
    /// so `CheckCycles`/allocation-triggered scans during the entry
    /// function's first frame are already budget-aware.
    pub initial_frame_budget_us: Option<u64>,
}
