//! The register-based dispatch loop (§2, §4.A, §4.F).
//!
//! `Vm` owns the frame stack, globals, and foreign-function table; the
//! heap is threaded through explicitly rather than held as a plain field
//! during dispatch, so that [`Heap::dec_ref`]/[`Heap::track_edge`] can take
//! `&mut Vm` as their [`crate::heap::DestructorRunner`] without aliasing
//! `&mut self.heap`. `execute` bridges the two views with a
//! `std::mem::take` at the call boundary, the same shape
//! `fuel_vm::interpreter::Interpreter::run` uses to hand its memory and
//! its own `&mut self` to instruction handlers separately.

mod alu;
mod flow;
pub(crate) mod foreign;
mod fused;
mod aggregates;
mod globals;
mod refs;

use std::collections::HashMap;
use std::rc::Rc;

use strand_asm::{Instruction, Opcode, RuntimeErrorReason};
use tracing::trace;

use crate::bytecode::Program;
use crate::error::{InterpreterError, RuntimeFault};
use crate::frame::Frame;
use crate::heap::{DestructorRunner, Heap};
use crate::host::VmConfig;
use crate::state::{ExecuteState, ProgramOutcome, VmState};
use crate::value::{ObjectId, Value};

/// The interpreter: frame stack, globals, foreign-call table, and the
/// program it is running (§2, §3.4). The heap lives alongside it but is
/// only ever borrowed out during a step; see the module doc comment.
pub struct Vm {
    program: Program,
    frames: Vec<Frame>,
    globals: HashMap<Rc<str>, Value>,
    pub(crate) foreign: HashMap<String, foreign::ForeignFn>,
    heap: Heap,
    state: VmState,
    #[cfg(feature = "replay")]
    replay: Option<crate::replay::ReplayRecorder>,
}

impl Vm {
    /// Build a VM ready to run `program`'s entry function, with default
    /// host configuration.
    pub fn new(program: Program) -> Self {
        Self::with_config(program, VmConfig::default())
    }

    /// As [`Vm::new`], applying `config`'s initial frame budget up front
    /// (§4.H, §6). Foreign functions are registered separately via
    /// [`Vm::register_foreign`].
    pub fn with_config(program: Program, config: VmConfig) -> Self {
        let mut vm = Self {
            program,
            frames: Vec::new(),
            globals: HashMap::new(),
            foreign: HashMap::new(),
            heap: Heap::new(),
            state: VmState::Idle,
            #[cfg(feature = "replay")]
            replay: None,
        };
        if let Some(budget_us) = config.initial_frame_budget_us {
            vm.heap.begin_frame(budget_us);
        }
        vm
    }

    /// The VM's current lifecycle state (§4.F).
    pub fn state(&self) -> VmState {
        self.state
    }

    /// Register a foreign function under `name` (§4.H, §6
    /// `vm_register_foreign`). Replaces any prior registration.
    pub fn register_foreign(&mut self, name: impl Into<String>, f: foreign::ForeignFn) {
        self.foreign.insert(name.into(), f);
    }

    /// Record the current host frame's cycle-scan time budget (§4.C, §6
    /// `vm_begin_frame`).
    pub fn begin_frame(&mut self, budget_us: u64) {
        self.heap.begin_frame(budget_us);
    }

    /// True once the dirty set is large enough that the host should grant
    /// a cycle-scan frame soon (§4.C, §6 `vm_needs_gc_frame`).
    pub fn needs_gc_frame(&self) -> bool {
        self.heap.needs_gc_frame()
    }

    /// Diagnostics for the most recent cycle-scan frame (§4.H, §6
    /// `vm_get_gc_stats`).
    pub fn get_gc_stats(&self) -> crate::heap::GcStats {
        self.heap.get_gc_stats()
    }

    /// Direct read-only access to the heap, for host introspection and
    /// the `verify` feature's external checks.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Start recording a replay of this VM's execution (§4.G). Has no
    /// effect, and the recorder is unreachable, unless built with the
    /// `replay` feature.
    #[cfg(feature = "replay")]
    pub fn enable_replay(&mut self) {
        self.replay = Some(crate::replay::ReplayRecorder::new());
    }

    /// The replay recorder, if [`Vm::enable_replay`] has been called.
    #[cfg(feature = "replay")]
    pub fn replay_recorder(&self) -> Option<&crate::replay::ReplayRecorder> {
        self.replay.as_ref()
    }

    fn cur_frame(&self) -> &Frame {
        self.frames.last().expect("step called with an empty frame stack")
    }

    fn cur_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("step called with an empty frame stack")
    }

    fn fault(&self, reason: RuntimeErrorReason) -> RuntimeFault {
        // handlers raise faults before touching `pc` themselves, so the
        // step loop's pre-dispatch advance is the only adjustment to undo.
        let pc = self.cur_frame().pc.saturating_sub(1);
        RuntimeFault { reason, pc, position: self.program.position_of(pc) }
    }

    /// Run the entry function to completion (§2, §4.F).
    ///
    /// Fails if the VM is not [`VmState::Idle`]; a `Vm` runs its program
    /// exactly once.
    pub fn execute(&mut self) -> Result<ProgramOutcome, InterpreterError> {
        if self.state != VmState::Idle {
            return Err(InterpreterError::NotIdle(self.state));
        }
        let entry = self
            .program
            .function(self.program.entry_function)
            .ok_or_else(|| InterpreterError::InvalidProgram("entry function index out of range".into()))?
            .clone();
        if !entry.is_bytecode() {
            return Err(InterpreterError::InvalidProgram("entry function must not be foreign".into()));
        }
        self.frames.push(Frame::new(self.program.entry_function, entry.entry_pc, entry.register_count, None));
        self.state = VmState::Running;

        let mut heap = std::mem::take(&mut self.heap);
        let result = self.run_until_empty(&mut heap);
        self.heap = heap;
        self.state = VmState::Halted;

        match result {
            Ok(values) => {
                let exit_code = values.first().and_then(|v| v.as_int().ok()).unwrap_or(0);
                Ok(ProgramOutcome::Returned { exit_code, values })
            }
            Err(fault) => Err(InterpreterError::Runtime(fault)),
        }
    }

    fn run_until_empty(&mut self, heap: &mut Heap) -> Result<Vec<Value>, RuntimeFault> {
        loop {
            match self.step(heap)? {
                ExecuteState::Proceed => continue,
                ExecuteState::Return(values) => return Ok(values),
            }
        }
    }

    /// Fetch, decode, and dispatch a single instruction (§4.A, §4.F).
    fn step(&mut self, heap: &mut Heap) -> Result<ExecuteState, RuntimeFault> {
        let pc = self.cur_frame().pc;
        let ins = *self
            .program
            .instructions
            .get(pc as usize)
            .ok_or_else(|| self.fault_at(RuntimeErrorReason::JumpOutOfRange, pc))?;
        self.cur_frame_mut().advance();
        let opcode = ins.opcode().ok_or_else(|| self.fault_at(RuntimeErrorReason::TypeMismatch, pc))?;
        trace!(pc, ?opcode, "dispatch");
        let result = self.dispatch(heap, opcode, ins);
        #[cfg(feature = "replay")]
        if result.is_ok() {
            self.record_replay(opcode, ins, pc);
        }
        result
    }

    /// Hook the dispatch loop into the replay recorder, if recording is
    /// active (§4.G). The only place this crate touches the recorder —
    /// everything past "record a delta here" is `ReplayRecorder`'s job.
    #[cfg(feature = "replay")]
    fn record_replay(&mut self, opcode: Opcode, ins: Instruction, pc_before: u32) {
        let pc_after = self.cur_frame().pc;
        let top_function = self.cur_frame().function;
        let global_write = match opcode {
            Opcode::SetGlobal | Opcode::InitGlobal => self
                .program
                .constants
                .get(ins.bx() as usize)
                .and_then(|c| c.as_bytes().ok())
                .map(|bytes| {
                    let name: Rc<str> = Rc::from(String::from_utf8_lossy(bytes).into_owned());
                    let value = self.globals.get(&name).cloned().unwrap_or(Value::Nil);
                    (name, value)
                }),
            _ => None,
        };

        let Some(recorder) = self.replay.as_mut() else { return };
        recorder.tick();
        if pc_after != pc_before.wrapping_add(1) {
            recorder.record(crate::replay::Delta::PcJump { to: pc_after });
        }
        match opcode {
            Opcode::Call | Opcode::TailCall => {
                recorder.record(crate::replay::Delta::FramePush { function: top_function, pc: pc_after });
            }
            Opcode::Return => recorder.record(crate::replay::Delta::FramePop),
            _ => {}
        }
        if let Some((name, value)) = global_write {
            recorder.record(crate::replay::Delta::GlobalWrite { name, value });
        }

        let call_stack: Vec<(u32, u32)> = self.frames.iter().map(|f| (f.function, f.pc)).collect();
        let globals: Vec<(Rc<str>, Value)> = self.globals.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.replay.as_mut().unwrap().maybe_snapshot(call_stack, globals);
    }

    fn fault_at(&self, reason: RuntimeErrorReason, pc: u32) -> RuntimeFault {
        RuntimeFault { reason, pc, position: self.program.position_of(pc) }
    }

    fn dispatch(
        &mut self,
        heap: &mut Heap,
        opcode: Opcode,
        ins: Instruction,
    ) -> Result<ExecuteState, RuntimeFault> {
        use Opcode::*;

        macro_rules! simple {
            ($call:expr) => {{
                $call.map_err(|r| self.fault(r))?;
                Ok(ExecuteState::Proceed)
            }};
        }

        match opcode {
            // --- Literals / moves ---
            LoadConst => {
                let v = self
                    .program
                    .constants
                    .get(ins.bx() as usize)
                    .cloned()
                    .ok_or_else(|| self.fault(RuntimeErrorReason::TypeMismatch))?;
                self.cur_frame_mut().set_reg(ins.a(), v);
                Ok(ExecuteState::Proceed)
            }
            Move => {
                let v = self.cur_frame().reg(ins.c());
                self.cur_frame_mut().set_reg(ins.a(), v);
                Ok(ExecuteState::Proceed)
            }
            LoadBool => {
                self.cur_frame_mut().set_reg(ins.a(), Value::Bool(ins.b() != 0));
                if ins.c() != 0 {
                    self.cur_frame_mut().advance();
                }
                Ok(ExecuteState::Proceed)
            }
            LoadNil => {
                let base = ins.a() as u16;
                for offset in 0..=ins.bx() {
                    self.cur_frame_mut().set_reg(base.wrapping_add(offset) as u8, Value::Nil);
                }
                Ok(ExecuteState::Proceed)
            }
            LoadNone => {
                self.cur_frame_mut().set_reg(ins.a(), Value::None);
                Ok(ExecuteState::Proceed)
            }

            // --- Arithmetic ---
            Add => simple!(alu::add(self, ins)),
            Sub => simple!(alu::sub(self, ins)),
            Mul => simple!(alu::mul(self, ins)),
            Div => simple!(alu::div(self, ins)),
            Mod => simple!(alu::modulo(self, ins)),
            Pow => simple!(alu::pow(self, ins)),
            Unm => simple!(alu::unm(self, ins)),
            AddImm => simple!(alu::imm_binop(self, ins, alu::ImmOp::Add)),
            SubImm => simple!(alu::imm_binop(self, ins, alu::ImmOp::Sub)),
            MulImm => simple!(alu::imm_binop(self, ins, alu::ImmOp::Mul)),
            DivImm => simple!(alu::imm_binop(self, ins, alu::ImmOp::Div)),

            // --- Compare ---
            Eq => simple!(alu::skip_compare(self, ins, alu::Cmp::Eq)),
            Lt => simple!(alu::skip_compare(self, ins, alu::Cmp::Lt)),
            Le => simple!(alu::skip_compare(self, ins, alu::Cmp::Le)),
            EqStore => simple!(alu::store_compare(self, ins, alu::Cmp::Eq)),
            LtStore => simple!(alu::store_compare(self, ins, alu::Cmp::Lt)),
            LeStore => simple!(alu::store_compare(self, ins, alu::Cmp::Le)),

            // --- Logical ---
            Not => simple!(alu::not(self, ins)),
            And => simple!(alu::and(self, ins)),
            Or => simple!(alu::or(self, ins)),

            // --- Control ---
            Jmp => {
                flow::op_jmp(self, ins);
                Ok(ExecuteState::Proceed)
            }
            Test => simple!(flow::op_test(self, ins)),
            TestSet => simple!(flow::op_testset(self, ins)),
            ForPrep => simple!(flow::op_forprep(self, ins)),
            ForLoop => simple!(flow::op_forloop(self, ins)),
            Return => flow::op_return(self, ins),

            // --- Aggregates ---
            NewArray => simple!(aggregates::new_array(self, ins)),
            NewTable => simple!(aggregates::new_table(self, ins)),
            GetIndex => simple!(aggregates::get_index(self, heap, ins)),
            SetIndex => simple!(aggregates::set_index(self, heap, ins)),
            GetIndexImm => simple!(aggregates::get_index_imm(self, heap, ins)),
            SetIndexImm => simple!(aggregates::set_index_imm(self, heap, ins)),
            Slice => simple!(aggregates::slice(self, heap, ins)),
            GetField => simple!(aggregates::get_field(self, heap, ins)),
            SetField => simple!(aggregates::set_field(self, heap, ins)),
            Len => simple!(aggregates::len(self, heap, ins)),

            // --- Wrappers ---
            WrapSome => simple!(aggregates::wrap_some(self, ins)),
            WrapOk => simple!(aggregates::wrap_ok(self, ins)),
            WrapErr => simple!(aggregates::wrap_err(self, ins)),
            UnwrapOption => simple!(aggregates::unwrap_option(self, ins)),
            UnwrapResult => simple!(aggregates::unwrap_result(self, ins)),
            TestTag => simple!(aggregates::test_tag(self, ins)),

            // --- Globals ---
            GetGlobal => simple!(globals::get_global(self, ins)),
            SetGlobal => simple!(globals::set_global(self, heap, ins)),
            InitGlobal => simple!(globals::init_global(self, heap, ins)),

            // --- Refs ---
            NewRef => simple!(refs::new_ref(self, heap, ins)),
            IncRef => simple!(refs::inc_ref(self, heap, ins)),
            DecRef => simple!(refs::dec_ref(self, heap, ins)),
            NewWeak => simple!(refs::new_weak(self, heap, ins)),
            WeakToStrong => simple!(refs::weak_to_strong(self, heap, ins)),
            CheckCycles => simple!(refs::check_cycles(self, heap, ins)),

            // --- Coercion ---
            Cast => simple!(aggregates::cast(self, ins)),

            // --- Calls and defer ---
            Call => flow::op_call(self, heap, ins),
            TailCall => flow::op_tailcall(self, heap, ins),
            PushDefer => {
                flow::op_push_defer(self, ins);
                Ok(ExecuteState::Proceed)
            }
            ExecDefers => {
                flow::op_exec_defers(self);
                Ok(ExecuteState::Proceed)
            }
            DeferEnd => {
                flow::op_defer_end(self);
                Ok(ExecuteState::Proceed)
            }

            // --- Membership ---
            In => simple!(aggregates::in_op(self, ins)),
            NotIn => simple!(aggregates::not_in_op(self, ins)),

            // --- Fused ---
            AddAdd => simple!(fused::add_add(self, ins)),
            MulAdd => simple!(fused::mul_add(self, ins)),
            CmpJmp => simple!(fused::cmp_jmp(self, ins)),
            IncTest => simple!(fused::inc_test(self, ins)),
            LoadAddStore => simple!(fused::load_add_store(self, heap, ins)),
            GetAddSet => simple!(fused::get_add_set(self, heap, ins)),
        }
    }
}

impl DestructorRunner for Vm {
    /// Push a frame for `func_idx` with `Ref(object_id)` in register 0
    /// and run it to completion (§4.B free-protocol step 3, §4.F). A
    /// fault inside a destructor is logged and swallowed — the free that
    /// triggered it must still complete (§7).
    fn run_destructor(&mut self, heap: &mut Heap, func_idx: u32, object_id: ObjectId) {
        let entry = match self.program.function(func_idx) {
            Some(e) if e.is_bytecode() => e.clone(),
            _ => return,
        };
        let depth_before = self.frames.len();
        let prev_state = self.state;
        self.state = VmState::InDestructor;

        let mut frame = Frame::new(func_idx, entry.entry_pc, entry.register_count, None);
        frame.set_reg(0, Value::Ref(object_id));
        self.frames.push(frame);

        loop {
            match self.step(heap) {
                Ok(ExecuteState::Return(_)) => break,
                Ok(ExecuteState::Proceed) => {
                    if self.frames.len() <= depth_before {
                        break;
                    }
                }
                Err(fault) => {
                    tracing::warn!(
                        object = object_id,
                        func = func_idx,
                        reason = %fault.reason,
                        pc = fault.pc,
                        "destructor raised a fault; ignoring and continuing the free (§7)"
                    );
                    self.frames.truncate(depth_before);
                    break;
                }
            }
        }
        self.state = prev_state;
    }
}

impl Drop for Vm {
    /// Release every live object on scope exit, running destructors in
    /// reverse-allocation order (§6 `vm_free`).
    fn drop(&mut self) {
        let mut heap = std::mem::take(&mut self.heap);
        heap.free_all(self);
    }
}
