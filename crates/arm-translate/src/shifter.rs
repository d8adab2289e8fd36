//! The barrel shifter subroutine shared by data-processing operand2
//! resolution and single-data-transfer register offsets (§4.1).
//!
//! Resolves an [`arm_decode::Operand2`]/[`ShiftAmount`] pair into the
//! shifted `VarOrImm`, emitting the LSL/LSR/ASR/ROR/RRX IR op that performs
//! it. Carry-out only matters to the caller when the instruction is a
//! logical data-processing op with the S bit set (arithmetic ops derive
//! their C from the addition/subtraction itself, not from the shifter) —
//! callers pass `carry_matters` to request the shift op update the live C
//! flag as a side effect; when the shift amount is a compile-time-zero LSL,
//! nothing is emitted at all and C is left untouched, matching hardware.

use arm_decode::{Operand2, ShiftAmount, ShiftOp};
use arm_ir::{Emitter, VarOrImm};

/// Resolves `operand2` (register form only — immediate form is handled
/// directly by the data-processing lowering, since its carry-out is known
/// at translation time from the constant rotate amount) into a shifted
/// value.
///
/// `rm_value` and `amount_value` are already fetched by the caller; a
/// register-shift amount sourced from R15 needs the pipeline correction in
/// [`crate::pipeline::read_shift_amount`] before it reaches here.
pub fn barrel_shift(
    emitter: &mut Emitter<'_>,
    shift_op: ShiftOp,
    amount: ShiftAmount,
    rm_value: VarOrImm,
    amount_value: Option<VarOrImm>,
    carry_matters: bool,
) -> VarOrImm {
    match amount {
        ShiftAmount::Immediate(0) => match shift_op {
            // LSL #0: the default "no shift" encoding. Value and carry both
            // pass through untouched.
            ShiftOp::Lsl => rm_value,
            // LSR #0 / ASR #0 encode a shift by 32.
            ShiftOp::Lsr => emitter.lsr(rm_value, 32u32, carry_matters).into(),
            ShiftOp::Asr => emitter.asr(rm_value, 32u32, carry_matters).into(),
            // ROR #0 encodes RRX: rotate right through carry by one bit.
            ShiftOp::Ror => emitter.rrx(rm_value, carry_matters).into(),
        },
        ShiftAmount::Immediate(n) => emit_shift(emitter, shift_op, rm_value, (n as u32).into(), carry_matters),
        ShiftAmount::Register(_) => {
            let amount_value = amount_value.expect("register-shift amount must be supplied by the caller");
            emit_shift(emitter, shift_op, rm_value, amount_value, carry_matters)
        }
    }
}

fn emit_shift(
    emitter: &mut Emitter<'_>,
    shift_op: ShiftOp,
    value: VarOrImm,
    amount: VarOrImm,
    set_flags: bool,
) -> VarOrImm {
    match shift_op {
        ShiftOp::Lsl => emitter.lsl(value, amount, set_flags).into(),
        ShiftOp::Lsr => emitter.lsr(value, amount, set_flags).into(),
        ShiftOp::Asr => emitter.asr(value, amount, set_flags).into(),
        ShiftOp::Ror => emitter.ror(value, amount, set_flags).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm_ir::{BasicBlock, Op};
    use arm_state::{Condition, LocationRef, Mode};

    fn block() -> BasicBlock {
        BasicBlock::new(LocationRef::new(0, Mode::Supervisor, false), Condition::Al)
    }

    #[test]
    fn lsl_by_immediate_zero_emits_nothing() {
        let mut block = block();
        let mut emitter = Emitter::new(&mut block);
        let rm = emitter.constant(5).into();
        let before = block_len(&block);
        let mut emitter = Emitter::new(&mut block);
        let result = barrel_shift(&mut emitter, ShiftOp::Lsl, ShiftAmount::Immediate(0), rm, None, true);
        assert_eq!(result, rm);
        assert_eq!(block_len(&block), before);
    }

    #[test]
    fn ror_by_immediate_zero_becomes_rrx() {
        let mut block = block();
        let mut emitter = Emitter::new(&mut block);
        let rm = emitter.constant(5).into();
        let _ = barrel_shift(&mut emitter, ShiftOp::Ror, ShiftAmount::Immediate(0), rm, None, true);
        let last = block.iter().last().unwrap().1;
        assert!(matches!(last, Op::Rrx { .. }));
    }

    #[test]
    fn lsr_by_immediate_zero_shifts_by_32() {
        let mut block = block();
        let mut emitter = Emitter::new(&mut block);
        let rm = emitter.constant(5).into();
        let _ = barrel_shift(&mut emitter, ShiftOp::Lsr, ShiftAmount::Immediate(0), rm, None, true);
        let last = block.iter().last().unwrap().1;
        assert!(matches!(last, Op::Lsr { amount: VarOrImm::Imm(32), .. }));
    }

    fn block_len(block: &BasicBlock) -> usize {
        block.len()
    }
}
