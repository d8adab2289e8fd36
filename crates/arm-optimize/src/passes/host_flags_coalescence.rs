use arm_ir::{BasicBlock, Op, OpRef, VarOrImm};

/// Pass 9: two CPSR-shaped simplifications that round out the flag-chain
/// cleanup passes 3-5 started.
///
/// 1. Two adjacent `StoreFlags` writing disjoint bit ranges of the same
///    chain (`b.src_cpsr == a.dst_cpsr`) collapse into one write of the
///    union, when both write known immediates — there's no observer that
///    could tell the two writes apart from the combined one.
/// 2. A `LoadCpsr` that follows a `StoreCpsr` with a known immediate value,
///    with nothing in between that could have changed it, is just that
///    immediate — becomes a `Constant`, which the dead-variable pass (6)
///    and constant propagation (1) can then chase further on the next
///    fixed-point iteration.
pub fn run(block: &mut BasicBlock) -> bool {
    let mut changed = false;
    changed |= merge_disjoint_store_flags(block);
    changed |= fold_known_cpsr_load(block);
    changed
}

fn merge_disjoint_store_flags(block: &mut BasicBlock) -> bool {
    let mut changed = false;
    let ops: Vec<(OpRef, Op)> = block.iter().map(|(op_ref, op)| (op_ref, op.clone())).collect();

    for window in 0..ops.len().saturating_sub(1) {
        let (a_ref, a_op) = &ops[window];
        let (b_ref, b_op) = &ops[window + 1];

        let Op::StoreFlags { mask: a_mask, dst_cpsr: a_dst, src_cpsr: a_src, values: VarOrImm::Imm(a_val) } = a_op else {
            continue;
        };
        let Op::StoreFlags { mask: b_mask, dst_cpsr: b_dst, src_cpsr: b_src, values: VarOrImm::Imm(b_val) } = b_op else {
            continue;
        };
        if *b_src != *a_dst || a_mask & b_mask != 0 {
            continue;
        }
        if !single_use_of(&ops, *a_dst, window + 1) {
            continue;
        }

        *block.get_mut(*b_ref) =
            Op::StoreFlags { mask: a_mask | b_mask, dst_cpsr: *b_dst, src_cpsr: *a_src, values: VarOrImm::Imm(a_val | b_val) };
        block.remove(*a_ref);
        changed = true;
    }

    changed
}

fn single_use_of(ops: &[(OpRef, Op)], dst: arm_ir::Variable, from: usize) -> bool {
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

fn fold_known_cpsr_load(block: &mut BasicBlock) -> bool {
    let mut changed = false;
    let ops: Vec<(OpRef, Op)> = block.iter().map(|(op_ref, op)| (op_ref, op.clone())).collect();
    let mut known: Option<u32> = None;

    for (op_ref, op) in &ops {
        match op {
            Op::StoreCpsr { src: VarOrImm::Imm(value) } => known = Some(*value),
            Op::StoreCpsr { .. } | Op::StoreFlags { .. } | Op::UpdateFlags { .. } | Op::UpdateStickyOverflow { .. } => known = None,
            Op::LoadCpsr { dst } => {
                if let Some(value) = known {
                    *block.get_mut(*op_ref) = Op::Constant { dst: *dst, value };
                    changed = true;
                }
            }
            _ => {}
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use arm_ir::{FLAG_C, FLAG_Z};
    use arm_state::{Condition, LocationRef, Mode};

    use super::*;

    fn sample_block() -> BasicBlock {
        BasicBlock::new(LocationRef::new(0, Mode::Supervisor, false), Condition::Al)
    }

    #[test]
    fn disjoint_adjacent_stores_merge() {
        let mut block = sample_block();
        let src = block.new_variable();
        let mid = block.new_variable();
        let tail = block.new_variable();
        block.push(Op::StoreFlags { mask: FLAG_Z, dst_cpsr: mid, src_cpsr: src, values: VarOrImm::Imm(FLAG_Z as u32) });
        block.push(Op::StoreFlags { mask: FLAG_C, dst_cpsr: tail, src_cpsr: mid, values: VarOrImm::Imm(0) });

        assert!(run(&mut block));
        assert_eq!(block.len(), 1);
        let remaining = block.iter().next().unwrap().1;
        assert!(matches!(remaining, Op::StoreFlags { mask, values: VarOrImm::Imm(v), .. }
            if *mask == (FLAG_Z | FLAG_C) && *v == FLAG_Z as u32));
    }

    #[test]
    fn overlapping_stores_are_left_to_pass_five() {
        let mut block = sample_block();
        let src = block.new_variable();
        let mid = block.new_variable();
        let tail = block.new_variable();
        block.push(Op::StoreFlags { mask: FLAG_Z, dst_cpsr: mid, src_cpsr: src, values: VarOrImm::Imm(0) });
        block.push(Op::StoreFlags { mask: FLAG_Z, dst_cpsr: tail, src_cpsr: mid, values: VarOrImm::Imm(FLAG_Z as u32) });
        assert!(!run(&mut block));
    }

    #[test]
    fn load_after_known_store_becomes_a_constant() {
        let mut block = sample_block();
        let dst = block.new_variable();
        block.push(Op::StoreCpsr { src: VarOrImm::Imm(0x1234_0000) });
        block.push(Op::LoadCpsr { dst });

        assert!(run(&mut block));
        let ops: Vec<_> = block.iter().map(|(_, op)| op.clone()).collect();
        assert!(matches!(ops[1], Op::Constant { value: 0x1234_0000, .. }));
    }

    #[test]
    fn load_after_unknown_store_is_untouched() {
        let mut block = sample_block();
        let dst = block.new_variable();
        let src = block.new_variable();
        block.push(Op::StoreCpsr { src: src.into() });
        block.push(Op::LoadCpsr { dst });

        assert!(!run(&mut block));
    }
}
