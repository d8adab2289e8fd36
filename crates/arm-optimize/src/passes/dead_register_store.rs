use arm_ir::{BasicBlock, Op, OpRef};

/// Pass 2: removes `StoreGpr` ops whose value is guaranteed to be
/// overwritten by a later store to the same `(gpr, user_mode)` bank before
/// anything reads it.
///
/// A single backward scan tracks, per `(gpr, user_mode)` key, whether a
/// later op still needs the value currently held there. Every key starts
/// "needed" (bit set) — the block's last write to any register must survive
/// to whatever runs next, since nothing in this IR observes "the end of the
/// block" directly. A `LoadGpr` re-asserts that its key is needed by
/// whatever precedes it; a `StoreGpr` either satisfies that need (clearing
/// the bit) or, if nothing needed it, is dead and is unlinked.
pub fn run(block: &mut BasicBlock) -> bool {
    let mut changed = false;
    let ops: Vec<(OpRef, Op)> = block.iter().map(|(op_ref, op)| (op_ref, op.clone())).collect();
    let mut needed: u32 = u32::MAX;

    for (op_ref, op) in ops.into_iter().rev() {
        match op {
            Op::StoreGpr { dst, .. } => {
                let key = register_key(dst.gpr.0, dst.user_mode);
                if needed & (1 << key) == 0 {
                    block.remove(op_ref);
                    changed = true;
                    continue;
                }
                needed &= !(1 << key);
            }
            Op::LoadGpr { src, .. } => {
                needed |= 1 << register_key(src.gpr.0, src.user_mode);
            }
            _ => {}
        }
    }

    changed
}

fn register_key(gpr: u8, user_mode: bool) -> u32 {
    gpr as u32 * 2 + user_mode as u32
}

#[cfg(test)]
mod tests {
    use arm_ir::GprArg;
    use arm_state::{Condition, Gpr, LocationRef, Mode};

    use super::*;

    fn sample_block() -> BasicBlock {
        BasicBlock::new(LocationRef::new(0, Mode::Supervisor, false), Condition::Al)
    }

    #[test]
    fn shadowed_store_is_removed() {
        let mut block = sample_block();
        let v0 = block.new_variable();
        let v1 = block.new_variable();
        block.push(Op::StoreGpr { dst: GprArg::new(Gpr(0)), src: v0.into() });
        block.push(Op::StoreGpr { dst: GprArg::new(Gpr(0)), src: v1.into() });

        assert!(run(&mut block));
        assert_eq!(block.len(), 1);
        assert!(matches!(block.iter().next().unwrap().1, Op::StoreGpr { src, .. } if *src == v1.into()));
    }

    #[test]
    fn store_read_before_being_overwritten_survives() {
        let mut block = sample_block();
        let v0 = block.new_variable();
        let v1 = block.new_variable();
        block.push(Op::StoreGpr { dst: GprArg::new(Gpr(0)), src: v0.into() });
        block.push(Op::LoadGpr { dst: v1, src: GprArg::new(Gpr(0)) });
        block.push(Op::StoreGpr { dst: GprArg::new(Gpr(0)), src: v1.into() });

        assert!(!run(&mut block));
        assert_eq!(block.len(), 3);
    }

    #[test]
    fn different_banks_do_not_shadow_each_other() {
        let mut block = sample_block();
        let v0 = block.new_variable();
        let v1 = block.new_variable();
        block.push(Op::StoreGpr { dst: GprArg::user(Gpr(0)), src: v0.into() });
        block.push(Op::StoreGpr { dst: GprArg::new(Gpr(0)), src: v1.into() });

        assert!(!run(&mut block));
        assert_eq!(block.len(), 2);
    }
}
