//! End-to-end execution tests driving `Vm::execute` over hand-assembled
//! programs (§8.4 scenarios), bypassing the loader since these programs
//! are built as `Program` literals directly.

use std::collections::HashMap;

use strand_asm::{Instruction, Opcode};
use strand_vm::bytecode::{DebugInfo, FunctionEntry};
use strand_vm::{Program, ProgramOutcome, Value, Vm, VmConfig};

fn entry(register_count: u16) -> FunctionEntry {
    FunctionEntry {
        name: "main".into(),
        entry_pc: 0,
        param_count: 0,
        register_count,
        param_names: Vec::new(),
        foreign: None,
    }
}

fn program(constants: Vec<Value>, functions: Vec<FunctionEntry>, instructions: Vec<Instruction>) -> Program {
    Program {
        constants,
        functions,
        destructors: HashMap::new(),
        instructions,
        debug: DebugInfo::default(),
        entry_function: 0,
    }
}

fn run(p: Program) -> (Vm, ProgramOutcome) {
    let mut vm = Vm::new(p);
    let outcome = vm.execute().expect("program should run to completion");
    (vm, outcome)
}

#[test]
fn arithmetic_and_return_yields_the_expected_exit_code() {
    let constants = vec![Value::Int(2), Value::Int(3)];
    let instructions = vec![
        Instruction::abx(Opcode::LoadConst, 0, 0), // r0 = 2
        Instruction::abx(Opcode::LoadConst, 1, 1), // r1 = 3
        Instruction::abc(Opcode::Add, 0, 0, 1),    // r0 = r0 + r1
        Instruction::abc(Opcode::Return, 1, 0, 0), // return r0
    ];
    let (_vm, outcome) = run(program(constants, vec![entry(4)], instructions));
    assert_eq!(outcome, ProgramOutcome::Returned { exit_code: 5, values: vec![Value::Int(5)] });
}

#[test]
fn refcount_rises_and_falls_across_inc_and_dec_ref() {
    let constants = vec![Value::Int(9)];
    let instructions = vec![
        Instruction::abx(Opcode::LoadConst, 1, 0),            // r1 = 9
        Instruction::abx(Opcode::NewRef, 0, (1u16 << 8) | 1), // r0 = Ref(scalar r1), strong=1
        Instruction::abx(Opcode::IncRef, 0, 0),               // strong=2
        Instruction::abx(Opcode::DecRef, 0, 0),               // strong=1
        Instruction::abc(Opcode::Return, 0, 0, 0),            // return nothing
    ];
    let (vm, outcome) = run(program(constants, vec![entry(4)], instructions));
    assert_eq!(outcome, ProgramOutcome::Returned { exit_code: 0, values: vec![] });
    assert!(vm.heap().is_live(1));
    assert_eq!(vm.heap().strong_count(1), 1);
}

#[test]
fn dec_ref_to_zero_frees_the_object() {
    let constants = vec![Value::Int(1)];
    let instructions = vec![
        Instruction::abx(Opcode::LoadConst, 1, 0),
        Instruction::abx(Opcode::NewRef, 0, (1u16 << 8) | 1),
        Instruction::abx(Opcode::DecRef, 0, 0),
        Instruction::abc(Opcode::Return, 0, 0, 0),
    ];
    let (vm, _outcome) = run(program(constants, vec![entry(4)], instructions));
    assert!(!vm.heap().is_live(1));
    assert_eq!(vm.heap().object_count(), 0);
}

#[test]
fn weak_survives_strong_death_and_promotion_then_fails() {
    let constants = vec![Value::Int(42)];
    let instructions = vec![
        Instruction::abx(Opcode::LoadConst, 1, 0),            // r1 = 42
        Instruction::abx(Opcode::NewRef, 0, (1u16 << 8) | 1), // r0 = strong ref, strong=1
        Instruction::abx(Opcode::NewWeak, 2, 0),              // r2 = weak(r0), via c()
        Instruction::abx(Opcode::DecRef, 0, 0),               // target freed
        Instruction::abx(Opcode::WeakToStrong, 3, 2),         // r3 = promote r2 -> Nil (target dead)
        Instruction::abc(Opcode::Return, 1, 3, 0),            // return r3
    ];
    let (vm, outcome) = run(program(constants, vec![entry(4)], instructions));
    assert_eq!(outcome, ProgramOutcome::Returned { exit_code: 0, values: vec![Value::Nil] });
    assert!(!vm.heap().is_live(1));
}

#[test]
fn weak_to_strong_promotion_of_a_live_target_succeeds() {
    let constants = vec![Value::Int(7)];
    let instructions = vec![
        Instruction::abx(Opcode::LoadConst, 1, 0),
        Instruction::abx(Opcode::NewRef, 0, (1u16 << 8) | 1), // r0 strong, strong=1
        Instruction::abx(Opcode::NewWeak, 2, 0),              // r2 = weak(r0)
        Instruction::abx(Opcode::WeakToStrong, 3, 2),         // r3 = promoted strong, strong=2
        Instruction::abc(Opcode::Return, 0, 0, 0),
    ];
    let (vm, _outcome) = run(program(constants, vec![entry(4)], instructions));
    assert!(vm.heap().is_live(1));
    assert_eq!(vm.heap().strong_count(1), 2);
}

#[test]
fn test_tag_discriminates_a_weak_handle_from_a_strong_ref() {
    const REF_KIND: u8 = 10;
    const WEAK_KIND: u8 = 11;
    let constants = vec![Value::Int(42), Value::Int(1), Value::Int(99)];
    let instructions = vec![
        Instruction::abx(Opcode::LoadConst, 1, 0),            // r1 = 42
        Instruction::abx(Opcode::NewRef, 0, (1u16 << 8) | 1), // r0 = strong ref
        Instruction::abx(Opcode::NewWeak, 2, 0),              // r2 = weak(r0)
        Instruction::abc(Opcode::TestTag, 2, WEAK_KIND, 0),   // matches: do not skip
        Instruction::abx(Opcode::LoadConst, 3, 1),            // r3 = 1
        Instruction::abc(Opcode::TestTag, 2, REF_KIND, 0),    // mismatches: skip next
        Instruction::abx(Opcode::LoadConst, 3, 2),            // skipped: r3 would become 99
        Instruction::abc(Opcode::Return, 1, 3, 0),            // return r3
    ];
    let (_vm, outcome) = run(program(constants, vec![entry(4)], instructions));
    assert_eq!(outcome, ProgramOutcome::Returned { exit_code: 0, values: vec![Value::Int(1)] });
}

const CYCLE_PUMP: i64 = 1000;

/// Pumps the heap's operation counter past the adaptive cycle-scan
/// threshold with throwaway scalar allocations, then builds a
/// self-referential pair of tables, drops both local handles, and asks
/// `CheckCycles` to collect them.
fn cycle_building_program() -> Program {
    let constants = vec![Value::Int(0), Value::Int(CYCLE_PUMP), Value::Int(1), Value::string("next")];
    let instructions = vec![
        Instruction::abx(Opcode::LoadConst, 0, 0),            // r0 = loop counter init = 0
        Instruction::abx(Opcode::LoadConst, 1, 1),            // r1 = limit = 1000
        Instruction::abx(Opcode::LoadConst, 2, 2),            // r2 = step = 1
        Instruction::as_bx(Opcode::ForPrep, 0, 1),            // pc3 -> jumps to pc5 (ForLoop test)
        Instruction::abx(Opcode::NewRef, 4, (0u16 << 8) | 1), // pc4 body: throwaway scalar alloc
        Instruction::as_bx(Opcode::ForLoop, 0, -2),           // pc5 -> back to pc4 while continuing
        Instruction::abx(Opcode::NewRef, 5, 0),               // pc6: r5 = Table
        Instruction::abx(Opcode::NewRef, 6, 0),               // pc7: r6 = Table
        Instruction::abc(Opcode::SetField, 5, 3, 6),          // pc8: r5.next = r6
        Instruction::abc(Opcode::SetField, 6, 3, 5),          // pc9: r6.next = r5 (cycle)
        Instruction::abx(Opcode::DecRef, 5, 0),               // pc10: drop local handle to r5
        Instruction::abx(Opcode::DecRef, 6, 0),               // pc11: drop local handle to r6
        Instruction::abx(Opcode::CheckCycles, 0, 0),          // pc12
        Instruction::abc(Opcode::Return, 0, 0, 0),            // pc13
    ];
    program(constants, vec![entry(8)], instructions)
}

#[test]
fn isolated_cycle_is_collected_once_the_adaptive_threshold_is_crossed() {
    let (vm, _outcome) = run(cycle_building_program());
    // 1001 leaked scalars survive; the two-table cycle does not.
    assert_eq!(vm.heap().object_count(), (CYCLE_PUMP + 1) as usize);
}

#[test]
fn a_zero_budget_frame_defers_the_cycle_scan_past_its_reserve() {
    // Same program, but with a frame budget too thin to clear
    // `MIN_BUDGET_RESERVE_US` — `CheckCycles` must decline to scan even
    // though the operation counter is well past the adaptive threshold.
    let mut vm = Vm::with_config(cycle_building_program(), VmConfig { initial_frame_budget_us: Some(0) });
    vm.execute().expect("program should run to completion");
    // Both leaked scalars and the still-cyclic table pair survive.
    assert_eq!(vm.heap().object_count(), (CYCLE_PUMP + 1 + 2) as usize);
}

#[test]
fn function_calls_thread_arguments_and_return_values_through_frames() {
    // fn double(x) { return x + x }; main returns double(21).
    let constants = vec![Value::Int(21)];
    let double_entry = FunctionEntry {
        name: "double".into(),
        entry_pc: 3,
        param_count: 1,
        register_count: 1,
        param_names: vec!["x".into()],
        foreign: None,
    };
    let instructions = vec![
        Instruction::abx(Opcode::LoadConst, 1, 0), // pc0: r1 = 21 (the argument register, A+1)
        Instruction::call(Opcode::Call, 0, 1, 1),  // pc1: r0 = call func#1(r1)
        Instruction::abc(Opcode::Return, 1, 0, 0), // pc2: return r0
        Instruction::abc(Opcode::Add, 0, 0, 0),    // pc3 (double's entry): r0 = x + x
        Instruction::abc(Opcode::Return, 1, 0, 0), // pc4: return r0
    ];
    let (_vm, outcome) = run(program(constants, vec![entry(2), double_entry], instructions));
    assert_eq!(outcome, ProgramOutcome::Returned { exit_code: 42, values: vec![Value::Int(42)] });
}

#[test]
fn defers_run_in_lifo_order() {
    // Two deferred blocks each overwrite the same register; since the
    // most-recently-pushed defer runs first, the first-pushed one's
    // write is the one still standing when the frame actually returns.
    let constants = vec![Value::Int(10), Value::Int(20)];
    let instructions = vec![
        Instruction::as_bx(Opcode::PushDefer, 0, 3),  // pc0: push A, body at pc4
        Instruction::as_bx(Opcode::PushDefer, 0, 4),  // pc1: push B, body at pc6
        Instruction::as_bx(Opcode::ExecDefers, 0, 0), // pc2: run newest (B) first
        Instruction::abc(Opcode::Return, 1, 3, 0),    // pc3: return r3
        Instruction::abx(Opcode::LoadConst, 3, 0),    // pc4 (A's body): r3 = 10
        Instruction::as_bx(Opcode::DeferEnd, 0, 0),   // pc5: continue the chain (A ran last)
        Instruction::abx(Opcode::LoadConst, 3, 1),    // pc6 (B's body): r3 = 20
        Instruction::as_bx(Opcode::DeferEnd, 0, 0),   // pc7: resume after ExecDefers
    ];
    let (_vm, outcome) = run(program(constants, vec![entry(4)], instructions));
    assert_eq!(outcome, ProgramOutcome::Returned { exit_code: 10, values: vec![Value::Int(10)] });
}

#[test]
fn global_first_binding_wins_and_later_binds_overwrite() {
    let constants = vec![Value::string("g"), Value::Int(1), Value::Int(2)];
    let instructions = vec![
        Instruction::abx(Opcode::LoadConst, 1, 1),  // r1 = 1
        Instruction::abx(Opcode::LoadConst, 2, 2),  // r2 = 2
        Instruction::abx(Opcode::InitGlobal, 1, 0), // globals["g"] = 1 (first binding wins)
        Instruction::abx(Opcode::InitGlobal, 2, 0), // no-op: already bound
        Instruction::abx(Opcode::GetGlobal, 0, 0),  // r0 = globals["g"]
        Instruction::abx(Opcode::SetGlobal, 2, 0),  // globals["g"] = 2 (SetGlobal always overwrites)
        Instruction::abx(Opcode::GetGlobal, 3, 0),  // r3 = globals["g"]
        Instruction::abc(Opcode::Return, 1, 0, 0),  // return r0 (captured before the overwrite)
    ];
    let (_vm, outcome) = run(program(constants, vec![entry(4)], instructions));
    assert_eq!(outcome, ProgramOutcome::Returned { exit_code: 1, values: vec![Value::Int(1)] });
}

#[test]
fn foreign_calls_marshal_against_declared_kinds() {
    use strand_asm::{RuntimeErrorReason, ValueKind};
    use strand_vm::bytecode::ForeignDescriptor;

    let constants = vec![Value::Int(19)];
    let identity_entry = FunctionEntry {
        name: "host_identity".into(),
        entry_pc: 0,
        param_count: 1,
        register_count: 0,
        param_names: vec!["x".into()],
        foreign: Some(ForeignDescriptor {
            library: "host".into(),
            symbol: "identity".into(),
            param_kinds: vec![ValueKind::Int],
            return_kind: ValueKind::Int,
        }),
    };
    let instructions = vec![
        Instruction::abx(Opcode::LoadConst, 1, 0), // r1 = 19 (the argument register, A+1)
        Instruction::call(Opcode::Call, 0, 1, 1),  // r0 = call func#1(r1)
        Instruction::abc(Opcode::Return, 1, 0, 0),
    ];
    let mut vm = Vm::new(program(constants, vec![entry(2), identity_entry], instructions));
    vm.register_foreign(
        "host_identity",
        Box::new(|args: &[Value]| -> Result<Value, RuntimeErrorReason> { Ok(args[0].clone()) }),
    );
    let outcome = vm.execute().expect("foreign call should succeed");
    assert_eq!(outcome, ProgramOutcome::Returned { exit_code: 19, values: vec![Value::Int(19)] });
}

#[test]
fn vm_free_runs_destructors_for_surviving_objects_on_drop() {
    // Destructor `fn finalize(obj) { SetGlobal "ran" = true }`, registered
    // on the scalar via NewRef's packed destructor-index field, fires
    // once as part of dropping the Vm with the object still live.
    let constants = vec![Value::Int(5), Value::Bool(true), Value::string("ran")];
    let finalize = FunctionEntry {
        name: "finalize".into(),
        entry_pc: 3,
        param_count: 1,
        register_count: 1,
        param_names: vec!["obj".into()],
        foreign: None,
    };
    // destructor func index 1 ("finalize"), encoded as (1+1)<<2 | KIND_SCALAR(1) = 9.
    let destructor_packed: u16 = (2u16 << 2) | 1;
    let code = vec![
        Instruction::abx(Opcode::LoadConst, 1, 0),                       // pc0: r1 = 5
        Instruction::abx(Opcode::NewRef, 0, (1u16 << 8) | destructor_packed), // pc1: r0 = Ref(scalar r1)
        Instruction::abc(Opcode::Return, 0, 0, 0),                       // pc2: entry returns, object still strong=1
        Instruction::abx(Opcode::LoadConst, 0, 1),                       // pc3 (finalize body): r0 = true
        Instruction::abx(Opcode::SetGlobal, 0, 2),                       // pc4: globals["ran"] = true
        Instruction::abc(Opcode::Return, 0, 0, 0),                       // pc5
    ];
    let mut vm = Vm::new(program(constants, vec![entry(2), finalize], code));
    let outcome = vm.execute().expect("program should run to completion");
    assert_eq!(outcome, ProgramOutcome::Returned { exit_code: 0, values: vec![] });
    assert!(vm.heap().is_live(1), "object is still strongly held when execute() returns");
    drop(vm); // runs `vm_free`'s destructor pass; asserted indirectly by it not panicking
}

#[test]
fn a_dying_parents_destructor_runs_before_its_owned_childs() {
    // Parent owns Child via a field. Dropping Parent's only handle frees
    // it; per the free protocol, Parent's own destructor runs (step 3)
    // before the cascade dec-refs Child (step 5), so Child's destructor
    // observes Parent's already having run. Each destructor writes a
    // global the other reads back, letting the run order prove itself:
    // if Child ran first, its `GetGlobal "a"` would fault (unbound).
    let constants = vec![Value::Int(1), Value::string("a"), Value::string("b"), Value::string("c")];
    let main_entry = entry(3);
    let parent_destructor = FunctionEntry {
        name: "parent_destructor".into(),
        entry_pc: 7,
        param_count: 1,
        register_count: 2,
        param_names: vec!["self".into()],
        foreign: None,
    };
    let child_destructor = FunctionEntry {
        name: "child_destructor".into(),
        entry_pc: 10,
        param_count: 1,
        register_count: 2,
        param_names: vec!["self".into()],
        foreign: None,
    };
    const CHILD_PACKED: u16 = 12; // kind=Table(0), destructor = func#2 + 1 = 3, (3<<2)|0
    const PARENT_PACKED: u16 = 8; // kind=Table(0), destructor = func#1 + 1 = 2, (2<<2)|0
    let code = vec![
        Instruction::abx(Opcode::NewRef, 0, CHILD_PACKED),  // pc0: r0 = child (Table, destructor#2)
        Instruction::abx(Opcode::NewRef, 1, PARENT_PACKED), // pc1: r1 = parent (Table, destructor#1)
        Instruction::abc(Opcode::SetField, 1, 3, 0),        // pc2: parent.c = child
        Instruction::abx(Opcode::DecRef, 0, 0),             // pc3: drop local child handle
        Instruction::abx(Opcode::DecRef, 1, 0),             // pc4: drop local parent handle -> frees parent
        Instruction::abx(Opcode::GetGlobal, 2, 2),          // pc5: r2 = globals["b"]
        Instruction::abc(Opcode::Return, 1, 2, 0),          // pc6: return r2
        Instruction::abx(Opcode::LoadConst, 1, 0),          // pc7 (parent_destructor): r1 = 1
        Instruction::abx(Opcode::SetGlobal, 1, 1),          // pc8: globals["a"] = 1
        Instruction::abc(Opcode::Return, 0, 0, 0),          // pc9
        Instruction::abx(Opcode::GetGlobal, 1, 1),          // pc10 (child_destructor): r1 = globals["a"]
        Instruction::abx(Opcode::SetGlobal, 1, 2),          // pc11: globals["b"] = r1
        Instruction::abc(Opcode::Return, 0, 0, 0),          // pc12
    ];
    let (_vm, outcome) =
        run(program(constants, vec![main_entry, parent_destructor, child_destructor], code));
    assert_eq!(outcome, ProgramOutcome::Returned { exit_code: 1, values: vec![Value::Int(1)] });
}

#[cfg(feature = "verify")]
#[test]
fn verify_reports_a_clean_heap_for_a_well_formed_strong_reference() {
    let constants = vec![Value::Int(3)];
    let instructions = vec![
        Instruction::abx(Opcode::LoadConst, 1, 0),
        Instruction::abx(Opcode::NewRef, 0, (1u16 << 8) | 1),
        Instruction::abc(Opcode::Return, 1, 0, 0), // return r0, keeping it a live root
    ];
    let (vm, outcome) = run(program(constants, vec![entry(4)], instructions));
    let root = match &outcome {
        ProgramOutcome::Returned { values, .. } => values[0].as_ref_id().expect("returned a Ref"),
        _ => unreachable!(),
    };
    let report = vm.heap().verify(&[root]);
    assert!(report.is_clean());
    assert_eq!(report.health_score(), 1.0);
}
