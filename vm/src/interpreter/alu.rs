//! Arithmetic, comparison, and logical opcode handlers (§4.E, §4.F, §7).
//!
//! None of these allocate on the heap: string concatenation grows a plain
//! Rust `Vec`/`Rc<[u8]>` backing buffer, which is invisible to the cycle
//! detector per §3.1's note on inline aggregates. Grounded on
//! `fuel_vm::interpreter::alu`'s split of checked-overflow helpers from
//! the opcode handlers that call them.

use strand_asm::{Instruction, RuntimeErrorReason};

use super::Vm;
use crate::value::Value;

type OpResult = Result<(), RuntimeErrorReason>;

fn checked_int_op(
    a: i64,
    b: i64,
    op: impl Fn(i64, i64) -> Option<i64>,
) -> Result<i64, RuntimeErrorReason> {
    op(a, b).ok_or(RuntimeErrorReason::IntegerOverflow)
}

/// `R[A] = R[B] + R[C]`: Int (checked), Float (IEEE), or String (concat).
pub(super) fn add(vm: &mut Vm, ins: Instruction) -> OpResult {
    let b = vm.cur_frame().reg(ins.b());
    let c = vm.cur_frame().reg(ins.c());
    let result = match (&b, &c) {
        (Value::Int(x), Value::Int(y)) => Value::Int(checked_int_op(*x, *y, i64::checked_add)?),
        (Value::Float(x), Value::Float(y)) => Value::Float(x + y),
        (Value::String(x), Value::String(y)) => {
            let mut bytes = x.to_vec();
            bytes.extend_from_slice(y);
            Value::String(bytes.into())
        }
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    };
    vm.cur_frame_mut().set_reg(ins.a(), result);
    Ok(())
}

/// `R[A] = R[B] - R[C]`.
pub(super) fn sub(vm: &mut Vm, ins: Instruction) -> OpResult {
    numeric_binop(vm, ins, i64::checked_sub, |x, y| x - y)
}

/// `R[A] = R[B] * R[C]`.
pub(super) fn mul(vm: &mut Vm, ins: Instruction) -> OpResult {
    numeric_binop(vm, ins, i64::checked_mul, |x, y| x * y)
}

/// `R[A] = R[B] / R[C]`; zero divisor is fatal for Int, IEEE for Float.
pub(super) fn div(vm: &mut Vm, ins: Instruction) -> OpResult {
    let b = vm.cur_frame().reg(ins.b());
    let c = vm.cur_frame().reg(ins.c());
    let result = match (&b, &c) {
        (Value::Int(x), Value::Int(y)) => Value::Int(checked_int_div(*x, *y)?),
        (Value::Float(x), Value::Float(y)) => Value::Float(x / y),
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    };
    vm.cur_frame_mut().set_reg(ins.a(), result);
    Ok(())
}

/// `R[A] = R[B] % R[C]`.
pub(super) fn modulo(vm: &mut Vm, ins: Instruction) -> OpResult {
    let b = vm.cur_frame().reg(ins.b());
    let c = vm.cur_frame().reg(ins.c());
    let result = match (&b, &c) {
        (Value::Int(x), Value::Int(y)) => Value::Int(checked_int_rem(*x, *y)?),
        (Value::Float(x), Value::Float(y)) => Value::Float(x % y),
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    };
    vm.cur_frame_mut().set_reg(ins.a(), result);
    Ok(())
}

/// `R[A] = R[B] ^ R[C]`.
pub(super) fn pow(vm: &mut Vm, ins: Instruction) -> OpResult {
    let b = vm.cur_frame().reg(ins.b());
    let c = vm.cur_frame().reg(ins.c());
    let result = match (&b, &c) {
        (Value::Int(x), Value::Int(y)) => {
            let exp: u32 = (*y).try_into().map_err(|_| RuntimeErrorReason::IntegerOverflow)?;
            Value::Int(x.checked_pow(exp).ok_or(RuntimeErrorReason::IntegerOverflow)?)
        }
        (Value::Float(x), Value::Float(y)) => Value::Float(x.powf(*y)),
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    };
    vm.cur_frame_mut().set_reg(ins.a(), result);
    Ok(())
}

/// `R[A] = -R[B]`.
pub(super) fn unm(vm: &mut Vm, ins: Instruction) -> OpResult {
    let b = vm.cur_frame().reg(ins.b());
    let result = match b {
        Value::Int(x) => Value::Int(x.checked_neg().ok_or(RuntimeErrorReason::IntegerOverflow)?),
        Value::Float(x) => Value::Float(-x),
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    };
    vm.cur_frame_mut().set_reg(ins.a(), result);
    Ok(())
}

fn numeric_binop(
    vm: &mut Vm,
    ins: Instruction,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> OpResult {
    let b = vm.cur_frame().reg(ins.b());
    let c = vm.cur_frame().reg(ins.c());
    let result = match (&b, &c) {
        (Value::Int(x), Value::Int(y)) => Value::Int(checked_int_op(*x, *y, int_op)?),
        (Value::Float(x), Value::Float(y)) => Value::Float(float_op(*x, *y)),
        _ => return Err(RuntimeErrorReason::TypeMismatch),
    };
    vm.cur_frame_mut().set_reg(ins.a(), result);
    Ok(())
}

fn checked_int_div(a: i64, b: i64) -> Result<i64, RuntimeErrorReason> {
    if b == 0 {
        return Err(RuntimeErrorReason::DivisionByZero);
    }
    a.checked_div(b).ok_or(RuntimeErrorReason::IntegerOverflow)
}

fn checked_int_rem(a: i64, b: i64) -> Result<i64, RuntimeErrorReason> {
    if b == 0 {
        return Err(RuntimeErrorReason::ModuloByZero);
    }
    a.checked_rem(b).ok_or(RuntimeErrorReason::IntegerOverflow)
}

/// `R[A] = R[B] op imm8`, the `+imm`/`-imm`/`*imm`/`/imm` family (§4.E):
/// Int only, immediate packed in the high byte of `Bx`.
pub(super) fn imm_binop(vm: &mut Vm, ins: Instruction, op: ImmOp) -> OpResult {
    let b = vm.cur_frame().reg(ins.b());
    let x = b.as_int()?;
    let imm = ins.imm8() as i64;
    let result = match op {
        ImmOp::Add => x.checked_add(imm).ok_or(RuntimeErrorReason::IntegerOverflow)?,
        ImmOp::Sub => x.checked_sub(imm).ok_or(RuntimeErrorReason::IntegerOverflow)?,
        ImmOp::Mul => x.checked_mul(imm).ok_or(RuntimeErrorReason::IntegerOverflow)?,
        ImmOp::Div => checked_int_div(x, imm)?,
    };
    vm.cur_frame_mut().set_reg(ins.a(), Value::Int(result));
    Ok(())
}

/// Which immediate-arithmetic family `imm_binop` performs.
#[derive(Debug, Clone, Copy)]
pub(super) enum ImmOp {
    Add,
    Sub,
    Mul,
    Div,
}

pub(super) fn numeric_lt(a: &Value, b: &Value) -> Result<bool, RuntimeErrorReason> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x < y),
        (Value::Float(x), Value::Float(y)) => Ok(x < y),
        _ => Err(RuntimeErrorReason::TypeMismatch),
    }
}

pub(super) fn numeric_le(a: &Value, b: &Value) -> Result<bool, RuntimeErrorReason> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x <= y),
        (Value::Float(x), Value::Float(y)) => Ok(x <= y),
        _ => Err(RuntimeErrorReason::TypeMismatch),
    }
}

/// Skip-next-if compare family: `Eq`/`Lt`/`Le`. `A` selects polarity (0 =
/// skip if the comparison is true, non-zero = skip if false), `B`/`C` are
/// the operand registers.
pub(super) fn skip_compare(vm: &mut Vm, ins: Instruction, cmp: Cmp) -> OpResult {
    let b = vm.cur_frame().reg(ins.b());
    let c = vm.cur_frame().reg(ins.c());
    let truth = match cmp {
        Cmp::Eq => b == c,
        Cmp::Lt => numeric_lt(&b, &c)?,
        Cmp::Le => numeric_le(&b, &c)?,
    };
    let skip_if_true = ins.a() == 0;
    if truth == skip_if_true {
        vm.cur_frame_mut().advance();
    }
    Ok(())
}

/// Store-variant compare family: writes the Bool result into `R[A]`
/// rather than skipping.
pub(super) fn store_compare(vm: &mut Vm, ins: Instruction, cmp: Cmp) -> OpResult {
    let b = vm.cur_frame().reg(ins.b());
    let c = vm.cur_frame().reg(ins.c());
    let truth = match cmp {
        Cmp::Eq => b == c,
        Cmp::Lt => numeric_lt(&b, &c)?,
        Cmp::Le => numeric_le(&b, &c)?,
    };
    vm.cur_frame_mut().set_reg(ins.a(), Value::Bool(truth));
    Ok(())
}

/// Which relation `skip_compare`/`store_compare` evaluates.
#[derive(Debug, Clone, Copy)]
pub(super) enum Cmp {
    Eq,
    Lt,
    Le,
}

/// `R[A] = !R[B]`.
pub(super) fn not(vm: &mut Vm, ins: Instruction) -> OpResult {
    let b = vm.cur_frame().reg(ins.b());
    let result = !b.truthy()?;
    vm.cur_frame_mut().set_reg(ins.a(), Value::Bool(result));
    Ok(())
}

/// `R[A] = R[B] && R[C]`.
pub(super) fn and(vm: &mut Vm, ins: Instruction) -> OpResult {
    let b = vm.cur_frame().reg(ins.b()).truthy()?;
    let c = vm.cur_frame().reg(ins.c()).truthy()?;
    vm.cur_frame_mut().set_reg(ins.a(), Value::Bool(b && c));
    Ok(())
}

/// `R[A] = R[B] || R[C]`.
pub(super) fn or(vm: &mut Vm, ins: Instruction) -> OpResult {
    let b = vm.cur_frame().reg(ins.b()).truthy()?;
    let c = vm.cur_frame().reg(ins.c()).truthy()?;
    vm.cur_frame_mut().set_reg(ins.a(), Value::Bool(b || c));
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1, 2, true)]
    #[case(2, 1, false)]
    #[case(3, 3, false)]
    fn numeric_lt_matches_native_int_ordering(#[case] x: i64, #[case] y: i64, #[case] expected: bool) {
        assert_eq!(numeric_lt(&Value::Int(x), &Value::Int(y)).unwrap(), expected);
    }

    #[rstest]
    #[case(1, 2, true)]
    #[case(2, 1, false)]
    #[case(3, 3, true)]
    fn numeric_le_matches_native_int_ordering(#[case] x: i64, #[case] y: i64, #[case] expected: bool) {
        assert_eq!(numeric_le(&Value::Int(x), &Value::Int(y)).unwrap(), expected);
    }

    #[rstest]
    #[case(10, 0, RuntimeErrorReason::DivisionByZero)]
    #[case(i64::MIN, -1, RuntimeErrorReason::IntegerOverflow)]
    fn checked_int_div_rejects_its_edge_cases(
        #[case] a: i64,
        #[case] b: i64,
        #[case] expected: RuntimeErrorReason,
    ) {
        assert_eq!(checked_int_div(a, b), Err(expected));
    }

    #[rstest]
    #[case(10, 0, RuntimeErrorReason::ModuloByZero)]
    #[case(i64::MIN, -1, RuntimeErrorReason::IntegerOverflow)]
    fn checked_int_rem_rejects_its_edge_cases(
        #[case] a: i64,
        #[case] b: i64,
        #[case] expected: RuntimeErrorReason,
    ) {
        assert_eq!(checked_int_rem(a, b), Err(expected));
    }
}
