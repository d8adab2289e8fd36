//! R15-as-shift-amount pipeline correction.
//!
//! `ArmState::pc()` always holds the architectural R15 value a guest
//! instruction would observe — fetch address plus two instructions' worth
//! of prefetch (+8 in ARM state, +4 in Thumb state) — so an ordinary read
//! of R15 as a data-processing or addressing operand needs no adjustment
//! here: `Emitter::load_gpr` already returns the pipeline-correct value,
//! and `LocationRef::advance` (used to step the translator through a block)
//! already adds one instruction width per step, which is exactly how that
//! constant offset propagates. The one place needing an explicit
//! correction is a register-shift amount sourced from R15, which the
//! decode stage samples one instruction earlier than a normal operand read
//! (spec.md §4.1: "R15 as amount requires subtracting the instruction size
//! to account for the pipeline").

use arm_decode::ShiftAmount;
use arm_ir::{Emitter, GprArg, VarOrImm};
use arm_state::Gpr;

/// Resolves a register-sourced shift amount, masking to the bottom byte as
/// hardware does. Returns `None` for an immediate amount (nothing to
/// compute).
pub fn read_shift_amount(
    emitter: &mut Emitter<'_>,
    amount: ShiftAmount,
    pc_value: u32,
    instruction_size: u32,
) -> Option<VarOrImm> {
    match amount {
        ShiftAmount::Immediate(_) => None,
        ShiftAmount::Register(rs) => {
            let value: VarOrImm = if rs == 15 {
                pc_value.wrapping_sub(instruction_size).into()
            } else {
                emitter.load_gpr(GprArg::new(Gpr(rs))).into()
            };
            let dst = emitter.new_variable();
            emitter.and(Some(dst), value, 0xFFu32, false);
            Some(dst.into())
        }
    }
}
