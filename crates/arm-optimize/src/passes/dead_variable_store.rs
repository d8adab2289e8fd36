use std::collections::HashSet;

use arm_ir::{BasicBlock, Op, OpRef};

/// Pass 6: removes any op whose destination variable is never read and
/// which has no side effect beyond defining it.
///
/// `Op::is_pure_value_producer` is the side-effect test (memory writes,
/// branches, coprocessor stores, and the explicit-CPSR-chain ops handled by
/// pass 4 are all excluded, see its doc comment). A single backward scan,
/// same shape as the dead-store passes: a variable is live if something
/// already visited (later in program order) reads it.
pub fn run(block: &mut BasicBlock) -> bool {
    let mut changed = false;
    let ops: Vec<(OpRef, Op)> = block.iter().map(|(op_ref, op)| (op_ref, op.clone())).collect();
    let mut used: HashSet<u32> = HashSet::new();

    for (op_ref, op) in ops.into_iter().rev() {
        if op.is_pure_value_producer() {
            if let Some(dst) = op.defined_var() {
                if !used.contains(&dst.index()) {
                    block.remove(op_ref);
                    changed = true;
                    continue;
                }
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
    use arm_ir::{GprArg, VarOrImm};
    use arm_state::{Condition, Gpr, LocationRef, Mode};

    use super::*;

    fn sample_block() -> BasicBlock {
        BasicBlock::new(LocationRef::new(0, Mode::Supervisor, false), Condition::Al)
    }

    #[test]
    fn unused_constant_is_removed() {
        let mut block = sample_block();
        let v = block.new_variable();
        block.push(Op::Constant { dst: v, value: 42 });
        assert!(run(&mut block));
        assert!(block.is_empty());
    }

    #[test]
    fn value_used_by_a_store_survives() {
        let mut block = sample_block();
        let v = block.new_variable();
        block.push(Op::Constant { dst: v, value: 42 });
        block.push(Op::StoreGpr { dst: GprArg::new(Gpr(0)), src: v.into() });
        assert!(!run(&mut block));
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn comparison_form_with_no_dst_is_never_touched() {
        let mut block = sample_block();
        block.push(Op::And { dst: None, lhs: VarOrImm::Imm(1), rhs: VarOrImm::Imm(2), set_flags: true });
        assert!(!run(&mut block));
        assert_eq!(block.len(), 1);
    }

    #[test]
    fn memory_write_is_never_eliminated_even_if_unused_elsewhere() {
        let mut block = sample_block();
        block.push(Op::MemWrite { size: arm_ir::MemAccessSize::Word, src: VarOrImm::Imm(0), address: VarOrImm::Imm(0x1000) });
        assert!(!run(&mut block));
    }
}
