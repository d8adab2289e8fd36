use arm_ir::{BasicBlock, Op, OpRef, VarOrImm, FLAG_C};

use crate::flags::FlagState;

/// Pass 8: two independent arithmetic simplifications.
///
/// 1. Adjacent `add`/`sub` against the same variable with both sides
///    immediate fold into one, same adjacent/single-use shape as pass 7.
/// 2. `adc`/`sbc`/`rsc` read the live carry flag implicitly (see
///    `arm_translate::arm_lower`'s data-processing lowering) rather than
///    taking it as an SSA input, so folding them needs a forward scan of
///    `StoreFlags` carry state rather than a dataflow check on the op's own
///    operands. When the carry bit is statically known at the op and the op
///    has an immediate `rhs`, it becomes a plain `add`/`sub`/`rsb` with the
///    carry baked into the immediate — the same op the backend already knows
///    how to generate, one step cheaper to execute.
pub fn run(block: &mut BasicBlock) -> bool {
    let mut changed = false;
    changed |= fold_adjacent_immediates(block);
    changed |= fold_known_carry(block);
    changed
}

fn fold_adjacent_immediates(block: &mut BasicBlock) -> bool {
    let mut changed = false;
    let ops: Vec<(OpRef, Op)> = block.iter().map(|(op_ref, op)| (op_ref, op.clone())).collect();

    for window in 0..ops.len().saturating_sub(1) {
        let (a_ref, a_op) = &ops[window];
        let (b_ref, b_op) = &ops[window + 1];

        let folded = match (a_op, b_op) {
            (
                Op::Add { dst: Some(a_dst), lhs: a_lhs, rhs: VarOrImm::Imm(x), set_flags: false },
                Op::Add { dst: b_dst, lhs: VarOrImm::Var(b_lhs), rhs: VarOrImm::Imm(y), set_flags },
            ) if *b_lhs == *a_dst => {
                Some(Op::Add { dst: *b_dst, lhs: *a_lhs, rhs: VarOrImm::Imm(x.wrapping_add(*y)), set_flags: *set_flags })
            }
            (
                Op::Sub { dst: Some(a_dst), lhs: a_lhs, rhs: VarOrImm::Imm(x), set_flags: false },
                Op::Sub { dst: b_dst, lhs: VarOrImm::Var(b_lhs), rhs: VarOrImm::Imm(y), set_flags },
            ) if *b_lhs == *a_dst => {
                Some(Op::Sub { dst: *b_dst, lhs: *a_lhs, rhs: VarOrImm::Imm(x.wrapping_add(*y)), set_flags: *set_flags })
            }
            _ => None,
        };

        let Some(folded) = folded else { continue };
        if !single_use_of(&ops, a_op, window + 1) {
            continue;
        }
        *block.get_mut(*b_ref) = folded;
        block.remove(*a_ref);
        changed = true;
    }

    changed
}

fn single_use_of(ops: &[(OpRef, Op)], a_op: &Op, from: usize) -> bool {
    let Some(dst) = a_op.defined_var() else { return false };
    let mut count = 0;
    for (_, op) in &ops[from..] {
        op.for_each_used_var(|v| {
            if v == dst {
                count += 1;
            }
        });
    }
    count == 1
}

fn fold_known_carry(block: &mut BasicBlock) -> bool {
    let mut changed = false;
    let ops: Vec<(OpRef, Op)> = block.iter().map(|(op_ref, op)| (op_ref, op.clone())).collect();
    let mut carry = FlagState::default();

    for (op_ref, op) in &ops {
        match op {
            Op::StoreFlags { mask, values: VarOrImm::Imm(imm), .. } if mask & FLAG_C != 0 => {
                let c_set = imm & FLAG_C as u32 != 0;
                carry.set_known(FLAG_C, if c_set { FLAG_C } else { 0 });
            }
            Op::StoreFlags { mask, .. } => carry.set_unknown(*mask),
            Op::UpdateFlags { mask, .. } => carry.set_unknown(*mask),
            Op::UpdateStickyOverflow { .. } => {}
            Op::LoadCpsr { .. } | Op::Branch { .. } | Op::BranchExchange { .. } => carry.set_unknown(FLAG_C),
            Op::Adc { dst, lhs, rhs: VarOrImm::Imm(rhs), set_flags: false } if carry.is_known(FLAG_C) => {
                let c = carry.value(FLAG_C).unwrap() != 0;
                *block.get_mut(*op_ref) = Op::Add { dst: Some(*dst), lhs: *lhs, rhs: VarOrImm::Imm(rhs.wrapping_add(c as u32)), set_flags: false };
                changed = true;
            }
            Op::Sbc { dst, lhs, rhs: VarOrImm::Imm(rhs), set_flags: false } if carry.is_known(FLAG_C) => {
                let borrow = if carry.value(FLAG_C).unwrap() != 0 { 0 } else { 1 };
                *block.get_mut(*op_ref) = Op::Sub { dst: Some(*dst), lhs: *lhs, rhs: VarOrImm::Imm(rhs.wrapping_add(borrow)), set_flags: false };
                changed = true;
            }
            _ => {}
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use arm_ir::FLAG_C;
    use arm_state::{Condition, LocationRef, Mode};

    use super::*;

    fn sample_block() -> BasicBlock {
        BasicBlock::new(LocationRef::new(0, Mode::Supervisor, false), Condition::Al)
    }

    #[test]
    fn adjacent_add_immediates_combine() {
        let mut block = sample_block();
        let base = block.new_variable();
        let mid = block.new_variable();
        let tail = block.new_variable();
        block.push(Op::Add { dst: Some(mid), lhs: base.into(), rhs: VarOrImm::Imm(4), set_flags: false });
        block.push(Op::Add { dst: Some(tail), lhs: mid.into(), rhs: VarOrImm::Imm(8), set_flags: false });

        assert!(run(&mut block));
        assert_eq!(block.len(), 1);
        let remaining = block.iter().next().unwrap().1;
        assert!(matches!(remaining, Op::Add { rhs: VarOrImm::Imm(12), .. }));
    }

    #[test]
    fn adc_with_known_set_carry_becomes_add() {
        let mut block = sample_block();
        let src = block.new_variable();
        let flags_dst = block.new_variable();
        let lhs = block.new_variable();
        let dst = block.new_variable();
        block.push(Op::StoreFlags { mask: FLAG_C, dst_cpsr: flags_dst, src_cpsr: src, values: VarOrImm::Imm(FLAG_C as u32) });
        block.push(Op::Adc { dst, lhs: lhs.into(), rhs: VarOrImm::Imm(10), set_flags: false });

        assert!(run(&mut block));
        let ops: Vec<_> = block.iter().map(|(_, op)| op.clone()).collect();
        assert!(matches!(ops[1], Op::Add { rhs: VarOrImm::Imm(11), .. }));
    }

    #[test]
    fn adc_with_unknown_carry_is_left_alone() {
        let mut block = sample_block();
        let lhs = block.new_variable();
        let dst = block.new_variable();
        block.push(Op::Adc { dst, lhs: lhs.into(), rhs: VarOrImm::Imm(10), set_flags: false });

        assert!(!run(&mut block));
    }
}
