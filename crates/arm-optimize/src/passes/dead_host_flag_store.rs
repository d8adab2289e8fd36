use std::collections::HashSet;

use arm_ir::{BasicBlock, Op, OpRef};

/// Pass 4: removes `StoreFlags`/`UpdateFlags`/`UpdateStickyOverflow` ops
/// whose result is never read anywhere later in the block.
///
/// These three opcodes are deliberately excluded from
/// [`Op::is_pure_value_producer`] (see its doc comment) because they model
/// an explicit CPSR-value SSA chain rather than an ordinary value — the
/// generic dead-variable pass (pass 6) leaves them alone on purpose. This
/// pass fills that gap with the same backward-liveness shape: a set of
/// variable indices referenced by anything already visited (walking tail to
/// head, so "already visited" means "later in program order"); an op in
/// this trio whose destination isn't in that set yet is dead.
pub fn run(block: &mut BasicBlock) -> bool {
    let mut changed = false;
    let ops: Vec<(OpRef, Op)> = block.iter().map(|(op_ref, op)| (op_ref, op.clone())).collect();
    let mut used: HashSet<u32> = HashSet::new();

    for (op_ref, op) in ops.into_iter().rev() {
        let dst = match op {
            Op::StoreFlags { dst_cpsr, .. } => Some(dst_cpsr),
            Op::UpdateFlags { dst_cpsr, .. } => Some(dst_cpsr),
            Op::UpdateStickyOverflow { dst_cpsr, .. } => Some(dst_cpsr),
            _ => None,
        };

        if let Some(dst) = dst {
            if !used.contains(&dst.index()) {
                block.remove(op_ref);
                changed = true;
                continue;
            }
        }

        op.for_each_used_var(|v| {
            used.insert(v.index());
        });
    }

    changed
}

#[cfg(test)]
mod tests {
    use arm_ir::{VarOrImm, FLAG_C, FLAG_Z};
    use arm_state::{Condition, LocationRef, Mode};

    use super::*;

    fn sample_block() -> BasicBlock {
        BasicBlock::new(LocationRef::new(0, Mode::Supervisor, false), Condition::Al)
    }

    #[test]
    fn unread_store_flags_is_removed() {
        let mut block = sample_block();
        let src = block.new_variable();
        block.push(Op::StoreFlags { mask: FLAG_Z, dst_cpsr: block.new_variable(), src_cpsr: src, values: VarOrImm::Imm(0) });
        assert!(run(&mut block));
        assert!(block.is_empty());
    }

    #[test]
    fn store_flags_consumed_by_store_cpsr_survives() {
        let mut block = sample_block();
        let src = block.new_variable();
        let dst_cpsr = block.new_variable();
        block.push(Op::StoreFlags { mask: FLAG_Z | FLAG_C, dst_cpsr, src_cpsr: src, values: VarOrImm::Imm(0) });
        block.push(Op::StoreCpsr { src: dst_cpsr.into() });
        assert!(!run(&mut block));
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn chained_store_flags_keeps_the_middle_link() {
        let mut block = sample_block();
        let src = block.new_variable();
        let mid = block.new_variable();
        let tail = block.new_variable();
        block.push(Op::StoreFlags { mask: FLAG_Z, dst_cpsr: mid, src_cpsr: src, values: VarOrImm::Imm(0) });
        block.push(Op::UpdateFlags { mask: FLAG_C, dst_cpsr: tail, src_cpsr: mid });
        block.push(Op::StoreCpsr { src: tail.into() });
        assert!(!run(&mut block));
        assert_eq!(block.len(), 3);
    }
}
