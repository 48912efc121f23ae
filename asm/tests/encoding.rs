//! Integration tests for instruction encoding, mirroring the teacher's
//! convention of a `tests/encoding.rs` alongside the crate's unit tests.

use strand_asm::{Instruction, Opcode};

#[test]
fn a_small_program_survives_byte_round_trip() {
    let program = [
        Instruction::abx(Opcode::LoadConst, 0, 0),
        Instruction::abx(Opcode::LoadConst, 1, 1),
        Instruction::abc(Opcode::Add, 2, 0, 1),
        Instruction::as_bx(Opcode::Return, 2, 1),
    ];

    let bytes: Vec<u8> = program.iter().flat_map(|i| i.to_le_bytes()).collect();
    assert_eq!(bytes.len(), program.len() * Instruction::LEN);

    let decoded: Vec<Instruction> = bytes
        .chunks_exact(Instruction::LEN)
        .map(|chunk| Instruction::from_le_bytes(chunk.try_into().unwrap()))
        .collect();

    assert_eq!(decoded, program);
    assert_eq!(decoded[2].opcode(), Some(Opcode::Add));
    assert_eq!((decoded[2].a(), decoded[2].b(), decoded[2].c()), (2, 0, 1));
}

#[test]
fn call_and_defer_opcodes_use_their_declared_layouts() {
    use strand_asm::OpType;

    assert_eq!(Opcode::Call.op_type(), OpType::Call);
    assert_eq!(Opcode::PushDefer.op_type(), OpType::AsBx);
    assert_eq!(Opcode::ExecDefers.op_type(), OpType::Ax);
}
