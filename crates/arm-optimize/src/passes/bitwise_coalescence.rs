use arm_ir::{BasicBlock, Op, OpRef, VarOrImm};

/// Pass 7: merges a bitwise op with an immediate into an immediately
/// following bitwise op of the same kind, also against an immediate, when
/// the second op's only other input is the first op's result and nothing
/// else reads it.
///
/// `and x, a, #m1; and y, x, #m2` becomes `and y, a, #(m1 & m2)` (same shape
/// for `orr`/`eor`). This only ever looks at adjacent pairs — like pass 5,
/// chasing a chain across arbitrary distance would need full liveness
/// bookkeeping this pass doesn't carry, and adjacent coverage is what the
/// constant-propagation/dead-store passes feed it in practice.
pub fn run(block: &mut BasicBlock) -> bool {
    let mut changed = false;
    let ops: Vec<(OpRef, Op)> = block.iter().map(|(op_ref, op)| (op_ref, op.clone())).collect();

    for window in 0..ops.len().saturating_sub(1) {
        let (a_ref, a_op) = &ops[window];
        let (b_ref, b_op) = &ops[window + 1];

        if let Some(folded) = try_fold_pair(a_op, b_op) {
            if single_use_of(&ops, a_op, window + 1) {
                *block.get_mut(*b_ref) = folded;
                block.remove(*a_ref);
                changed = true;
            }
        }
    }

    changed
}

/// True if `a`'s defined variable is referenced exactly once among
/// `ops[from..]` (the use `b` itself makes). Anything more means some other
/// op still needs `a`'s standalone result, so it can't be folded away.
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

fn try_fold_pair(a: &Op, b: &Op) -> Option<Op> {
    match (a, b) {
        (
            Op::And { dst: Some(a_dst), lhs: a_lhs, rhs: VarOrImm::Imm(m1), set_flags: false },
            Op::And { dst: b_dst, lhs: VarOrImm::Var(b_lhs), rhs: VarOrImm::Imm(m2), set_flags },
        ) if *b_lhs == *a_dst => {
            Some(Op::And { dst: *b_dst, lhs: *a_lhs, rhs: VarOrImm::Imm(m1 & m2), set_flags: *set_flags })
        }
        (
            Op::Orr { dst: a_dst, lhs: a_lhs, rhs: VarOrImm::Imm(m1), set_flags: false },
            Op::Orr { dst: b_dst, lhs: VarOrImm::Var(b_lhs), rhs: VarOrImm::Imm(m2), set_flags },
        ) if *b_lhs == *a_dst => {
            Some(Op::Orr { dst: *b_dst, lhs: *a_lhs, rhs: VarOrImm::Imm(m1 | m2), set_flags: *set_flags })
        }
        (
            Op::Eor { dst: Some(a_dst), lhs: a_lhs, rhs: VarOrImm::Imm(m1), set_flags: false },
            Op::Eor { dst: b_dst, lhs: VarOrImm::Var(b_lhs), rhs: VarOrImm::Imm(m2), set_flags },
        ) if *b_lhs == *a_dst => {
            Some(Op::Eor { dst: *b_dst, lhs: *a_lhs, rhs: VarOrImm::Imm(m1 ^ m2), set_flags: *set_flags })
        }
        // A double Mvn (bitwise-not of a bitwise-not) is a no-op copy.
        (Op::Mvn { dst: a_dst, value: a_value, set_flags: false }, Op::Mvn { dst: b_dst, value: VarOrImm::Var(b_value), set_flags })
            if *b_value == *a_dst =>
        {
            Some(Op::Mov { dst: *b_dst, value: *a_value, set_flags: *set_flags })
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
    fn adjacent_and_immediates_combine() {
        let mut block = sample_block();
        let base = block.new_variable();
        let mid = block.new_variable();
        let tail = block.new_variable();
        block.push(Op::And { dst: Some(mid), lhs: base.into(), rhs: VarOrImm::Imm(0xFF00), set_flags: false });
        block.push(Op::And { dst: Some(tail), lhs: mid.into(), rhs: VarOrImm::Imm(0x0F0F), set_flags: false });

        assert!(run(&mut block));
        assert_eq!(block.len(), 1);
        let remaining = block.iter().next().unwrap().1;
        assert!(matches!(remaining, Op::And { lhs, rhs: VarOrImm::Imm(0x0F00), .. } if *lhs == VarOrImm::Var(base)));
    }

    #[test]
    fn mid_value_observed_elsewhere_blocks_the_fold() {
        let mut block = sample_block();
        let base = block.new_variable();
        let mid = block.new_variable();
        let tail = block.new_variable();
        block.push(Op::And { dst: Some(mid), lhs: base.into(), rhs: VarOrImm::Imm(0xFF00), set_flags: false });
        block.push(Op::And { dst: Some(tail), lhs: mid.into(), rhs: VarOrImm::Imm(0x0F0F), set_flags: false });
        block.push(Op::StoreGpr { dst: arm_ir::GprArg::new(arm_state::Gpr(0)), src: mid.into() });

        assert!(!run(&mut block));
        assert_eq!(block.len(), 3);
    }

    #[test]
    fn double_negate_becomes_a_move() {
        let mut block = sample_block();
        let base = block.new_variable();
        let mid = block.new_variable();
        let tail = block.new_variable();
        block.push(Op::Mvn { dst: mid, value: base.into(), set_flags: false });
        block.push(Op::Mvn { dst: tail, value: mid.into(), set_flags: false });

        assert!(run(&mut block));
        assert_eq!(block.len(), 1);
        let remaining = block.iter().next().unwrap().1;
        assert!(matches!(remaining, Op::Mov { value, .. } if *value == VarOrImm::Var(base)));
    }
}
