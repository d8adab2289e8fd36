use arm_ir::{BasicBlock, Op, OpRef};
use arm_state::Mode;

/// Pass 3: removes `StoreCpsr`/`StoreSpsr` ops shadowed by a later store to
/// the same destination with no intervening read.
///
/// Same backward-scan shape as `dead_register_store` (pass 2), just against
/// CPSR and the per-mode SPSR banks instead of GPRs. CPSR and each SPSR bank
/// are tracked as independent "needed" bits, all starting set (the block's
/// last write to any of them must survive to whatever runs next).
pub fn run(block: &mut BasicBlock) -> bool {
    let mut changed = false;
    let ops: Vec<(OpRef, Op)> = block.iter().map(|(op_ref, op)| (op_ref, op.clone())).collect();
    let mut cpsr_needed = true;
    let mut spsr_needed: u8 = u8::MAX;

    for (op_ref, op) in ops.into_iter().rev() {
        match op {
            Op::StoreCpsr { .. } => {
                if !cpsr_needed {
                    block.remove(op_ref);
                    changed = true;
                    continue;
                }
                cpsr_needed = false;
            }
            Op::LoadCpsr { .. } => cpsr_needed = true,
            Op::StoreSpsr { mode, .. } => {
                let bit = spsr_bit(mode);
                if spsr_needed & bit == 0 {
                    block.remove(op_ref);
                    changed = true;
                    continue;
                }
                spsr_needed &= !bit;
            }
            Op::LoadSpsr { mode, .. } => spsr_needed |= spsr_bit(mode),
            // Branch/BranchExchange and exception-entry style sequences read
            // CPSR implicitly via `src_cpsr`; `for_each_used_var` doesn't
            // surface "reads CPSR register state" (it only tracks the SSA
            // chain), so conservatively treat any terminator as consuming
            // the live CPSR just like an explicit `LoadCpsr` would.
            Op::Branch { .. } | Op::BranchExchange { .. } => cpsr_needed = true,
            _ => {}
        }
    }

    changed
}

/// Local bit assignment for the five SPSR-bearing modes — independent of
/// `arm_state::Mode`'s internal bank numbering, which isn't part of its
/// public API.
fn spsr_bit(mode: Mode) -> u8 {
    match mode {
        Mode::Fiq => 1 << 0,
        Mode::Irq => 1 << 1,
        Mode::Supervisor => 1 << 2,
        Mode::Abort => 1 << 3,
        Mode::Undefined => 1 << 4,
        Mode::User | Mode::System => 0,
    }
}
