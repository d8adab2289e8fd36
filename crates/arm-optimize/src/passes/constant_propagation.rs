use arm_ir::{BasicBlock, Op, OpRef, VarOrImm, Variable};

use crate::substitution::{self, Substitution};

/// Pass 1: folds ops whose operands are all immediates (after substitution)
/// into `Constant`, and records every fold as a variable -> immediate
/// substitution so later ops in the same scan already see the folded value.
///
/// A single forward scan: each op is first rewritten through `subst` (so a
/// use of an already-folded variable sees its immediate), then checked for
/// foldability. Idempotent — a block with nothing left to fold leaves every
/// op and `subst` unchanged.
pub fn run(block: &mut BasicBlock, subst: &mut Substitution) -> bool {
    let mut changed = false;
    let ops: Vec<(OpRef, Op)> = block.iter().map(|(op_ref, op)| (op_ref, op.clone())).collect();

    for (op_ref, original) in ops {
        // `CopyVar::src` is a bare `Variable`, not a `VarOrImm` — it can't be
        // rewritten in place by the generic substitutor, but if the chain it
        // points to resolves to a known immediate, the whole op folds to a
        // `Constant` directly.
        if let Op::CopyVar { dst, src } = original {
            if let VarOrImm::Imm(value) = subst.resolve(VarOrImm::Var(src)) {
                subst.set(dst, VarOrImm::Imm(value));
                *block.get_mut(op_ref) = Op::Constant { dst, value };
                changed = true;
                continue;
            }
        }

        let (rewritten, _) = substitution::apply_to_op(&original, subst);
        let final_op = match try_fold(&rewritten) {
            Some((dst, value)) => {
                subst.set(dst, VarOrImm::Imm(value));
                Op::Constant { dst, value }
            }
            None => rewritten,
        };

        if final_op != original {
            *block.get_mut(op_ref) = final_op;
            changed = true;
        }
    }

    changed
}

/// Tries to evaluate `op` at compile time, returning its destination and
/// folded value. Only considers forms that don't also need flag semantics
/// modeled (`set_flags: false` where the op has one) — flag-bit knowledge is
/// the host-flags tracker's job (see `flags.rs`), not constant propagation's.
fn try_fold(op: &Op) -> Option<(Variable, u32)> {
    match *op {
        Op::Constant { dst, value } => Some((dst, value)),
        Op::Mov { dst, value: VarOrImm::Imm(v), set_flags: false } => Some((dst, v)),
        Op::Mvn { dst, value: VarOrImm::Imm(v), set_flags: false } => Some((dst, !v)),
        Op::And { dst: Some(dst), lhs: VarOrImm::Imm(a), rhs: VarOrImm::Imm(b), set_flags: false } => Some((dst, a & b)),
        Op::Eor { dst: Some(dst), lhs: VarOrImm::Imm(a), rhs: VarOrImm::Imm(b), set_flags: false } => Some((dst, a ^ b)),
        Op::Orr { dst, lhs: VarOrImm::Imm(a), rhs: VarOrImm::Imm(b), set_flags: false } => Some((dst, a | b)),
        Op::Bic { dst, lhs: VarOrImm::Imm(a), rhs: VarOrImm::Imm(b), set_flags: false } => Some((dst, a & !b)),
        Op::Add { dst: Some(dst), lhs: VarOrImm::Imm(a), rhs: VarOrImm::Imm(b), set_flags: false } => {
            Some((dst, a.wrapping_add(b)))
        }
        Op::Sub { dst: Some(dst), lhs: VarOrImm::Imm(a), rhs: VarOrImm::Imm(b), set_flags: false } => {
            Some((dst, a.wrapping_sub(b)))
        }
        Op::Lsl { dst, value: VarOrImm::Imm(v), amount: VarOrImm::Imm(a), set_flags: false } => {
            Some((dst, if a >= 32 { 0 } else { v.wrapping_shl(a) }))
        }
        Op::Lsr { dst, value: VarOrImm::Imm(v), amount: VarOrImm::Imm(a), set_flags: false } => {
            Some((dst, if a >= 32 { 0 } else { v >> a }))
        }
        Op::Asr { dst, value: VarOrImm::Imm(v), amount: VarOrImm::Imm(a), set_flags: false } => {
            Some((dst, ((v as i32) >> a.min(31)) as u32))
        }
        Op::Ror { dst, value: VarOrImm::Imm(v), amount: VarOrImm::Imm(a), set_flags: false } => {
            Some((dst, v.rotate_right(a % 32)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use arm_state::{Condition, LocationRef, Mode};

    use super::*;

    fn sample_block() -> BasicBlock {
        BasicBlock::new(LocationRef::new(0, Mode::Supervisor, false), Condition::Al)
    }

    #[test]
    fn folds_constant_add_chain() {
        let mut block = sample_block();
        let v0 = block.new_variable();
        block.push(Op::Constant { dst: v0, value: 3 });
        let v1 = block.new_variable();
        block.push(Op::Add { dst: Some(v1), lhs: VarOrImm::Var(v0), rhs: VarOrImm::Imm(4), set_flags: false });

        let mut subst = Substitution::new();
        let changed = run(&mut block, &mut subst);
        assert!(changed);

        let folded: Vec<&Op> = block.iter().map(|(_, op)| op).collect();
        assert_eq!(folded[1], &Op::Constant { dst: v1, value: 7 });
    }

    #[test]
    fn copy_var_folds_through_known_source() {
        let mut block = sample_block();
        let v0 = block.new_variable();
        block.push(Op::Constant { dst: v0, value: 42 });
        let v1 = block.new_variable();
        block.push(Op::CopyVar { dst: v1, src: v0 });

        let mut subst = Substitution::new();
        run(&mut block, &mut subst);

        let ops: Vec<&Op> = block.iter().map(|(_, op)| op).collect();
        assert_eq!(ops[1], &Op::Constant { dst: v1, value: 42 });
    }

    #[test]
    fn second_pass_is_idempotent() {
        let mut block = sample_block();
        let v0 = block.new_variable();
        block.push(Op::Constant { dst: v0, value: 1 });
        let mut subst = Substitution::new();
        run(&mut block, &mut subst);
        assert!(!run(&mut block, &mut subst));
    }
}
