use std::collections::HashMap;

use arm_ir::{BasicBlock, Op, OpRef, VarOrImm, Variable};

/// Pass 5: when a `StoreFlags` is immediately followed by another
/// `StoreFlags` chained directly onto it (`b.src_cpsr == a.dst_cpsr`) that
/// rewrites some of the same bits with another known immediate value, the
/// earlier write of those bits is invisible — `b` recomputes them before
/// anything can observe `a`'s version. Narrows `a`'s mask to drop the
/// overlap (dropping the op entirely, and splicing `b` onto `a`'s own
/// source, if nothing is left).
///
/// Limited to the adjacent, single-use case (`a`'s result used nowhere but
/// as `b`'s input) so the rewrite never has to reason about a third
/// consumer observing the dropped bits; that is proven with one pass over
/// the remaining ops before committing any change.
pub fn run(block: &mut BasicBlock) -> bool {
    let mut changed = false;
    let ops: Vec<(OpRef, Op)> = block.iter().map(|(op_ref, op)| (op_ref, op.clone())).collect();
    let use_counts = count_uses(&ops);

    for window in 0..ops.len().saturating_sub(1) {
        let (a_ref, a_op) = &ops[window];
        let (b_ref, b_op) = &ops[window + 1];

        let Op::StoreFlags { mask: a_mask, dst_cpsr: a_dst, src_cpsr: a_src, values: a_values } = a_op else {
            continue;
        };
        let Op::StoreFlags { mask: b_mask, src_cpsr: b_src, values: b_values, .. } = b_op else { continue };
        if *b_src != *a_dst {
            continue;
        }
        if use_counts.get(&a_dst.index()).copied().unwrap_or(0) != 1 {
            continue; // a's result is observed by something besides b
        }
        let (VarOrImm::Imm(a_imm), VarOrImm::Imm(_)) = (*a_values, *b_values) else {
            continue; // only drop a write once we know both sides statically
        };

        let overlap = a_mask & b_mask;
        if overlap == 0 {
            continue;
        }

        let new_mask = a_mask & !overlap;
        if new_mask == 0 {
            // `a` no longer writes anything live; bypass it entirely.
            block.remove(*a_ref);
            rewrite_src(block, *b_ref, *a_src);
        } else {
            *block.get_mut(*a_ref) = Op::StoreFlags { mask: new_mask, dst_cpsr: *a_dst, src_cpsr: *a_src, values: (a_imm & new_mask as u32).into() };
        }
        changed = true;
    }

    changed
}

fn rewrite_src(block: &mut BasicBlock, op_ref: OpRef, new_src: Variable) {
    if let Op::StoreFlags { src_cpsr, .. } = block.get_mut(op_ref) {
        *src_cpsr = new_src;
    }
}

fn count_uses(ops: &[(OpRef, Op)]) -> HashMap<u32, u32> {
    let mut counts = HashMap::new();
    for (_, op) in ops {
        op.for_each_used_var(|v| *counts.entry(v.index()).or_insert(0) += 1);
    }
    counts
}

#[cfg(test)]
mod tests {
    use arm_ir::{FLAG_C, FLAG_N, FLAG_Z};
    use arm_state::{Condition, LocationRef, Mode};

    use super::*;

    fn sample_block() -> BasicBlock {
        BasicBlock::new(LocationRef::new(0, Mode::Supervisor, false), Condition::Al)
    }

    #[test]
    fn fully_overlapping_rewrite_is_bypassed() {
        let mut block = sample_block();
        let src = block.new_variable();
        let mid = block.new_variable();
        let tail = block.new_variable();
        block.push(Op::StoreFlags { mask: FLAG_Z, dst_cpsr: mid, src_cpsr: src, values: VarOrImm::Imm(0) });
        block.push(Op::StoreFlags { mask: FLAG_Z, dst_cpsr: tail, src_cpsr: mid, values: VarOrImm::Imm(FLAG_Z as u32) });

        assert!(run(&mut block));
        assert_eq!(block.len(), 1);
        let remaining = block.iter().next().unwrap().1;
        assert!(matches!(remaining, Op::StoreFlags { src_cpsr, .. } if *src_cpsr == src));
    }

    #[test]
    fn partial_overlap_narrows_the_mask() {
        let mut block = sample_block();
        let src = block.new_variable();
        let mid = block.new_variable();
        let tail = block.new_variable();
        block.push(Op::StoreFlags { mask: FLAG_N | FLAG_Z, dst_cpsr: mid, src_cpsr: src, values: VarOrImm::Imm(0) });
        block.push(Op::StoreFlags { mask: FLAG_Z | FLAG_C, dst_cpsr: tail, src_cpsr: mid, values: VarOrImm::Imm(0) });

        assert!(run(&mut block));
        let first = block.iter().next().unwrap().1;
        assert!(matches!(first, Op::StoreFlags { mask, .. } if *mask == FLAG_N));
    }

    #[test]
    fn observed_intermediate_value_is_left_alone() {
        let mut block = sample_block();
        let src = block.new_variable();
        let mid = block.new_variable();
        let tail = block.new_variable();
        block.push(Op::StoreFlags { mask: FLAG_Z, dst_cpsr: mid, src_cpsr: src, values: VarOrImm::Imm(0) });
        block.push(Op::StoreFlags { mask: FLAG_Z, dst_cpsr: tail, src_cpsr: mid, values: VarOrImm::Imm(FLAG_Z as u32) });
        block.push(Op::StoreCpsr { src: mid.into() }); // third consumer of `mid`

        assert!(!run(&mut block));
        assert_eq!(block.len(), 3);
    }
}
