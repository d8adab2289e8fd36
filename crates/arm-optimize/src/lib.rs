//! Fixed-point optimizer over translated IR basic blocks.
//!
//! Nine independent passes (`passes::*`), each a single forward or backward
//! scan reporting whether it changed anything. The driver here just keeps
//! re-running the enabled set until a full round changes nothing, or a
//! safety cap on iterations is hit, then renumbers variables once via
//! `BasicBlock::compact`.

pub mod flags;
pub mod passes;
pub mod substitution;

use arm_ir::BasicBlock;
use log::{debug, warn};

use crate::substitution::Substitution;

/// Which passes to run, and the fixed-point iteration cap. All passes are on
/// by default; a backend or test harness that wants to isolate one pass's
/// effect can flip the others off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassConfig {
    pub constant_propagation: bool,
    pub dead_register_store: bool,
    pub dead_gpr_store: bool,
    pub dead_host_flag_store: bool,
    pub dead_flag_value_store: bool,
    pub dead_variable_store: bool,
    pub bitwise_coalescence: bool,
    pub arithmetic_coalescence: bool,
    pub host_flags_coalescence: bool,
    /// Safety cap: a block that's still changing after this many full
    /// rounds stops early rather than looping forever on a pass cycle that
    /// shouldn't exist.
    pub max_iterations: u32,
}

impl Default for PassConfig {
    fn default() -> PassConfig {
        PassConfig {
            constant_propagation: true,
            dead_register_store: true,
            dead_gpr_store: true,
            dead_host_flag_store: true,
            dead_flag_value_store: true,
            dead_variable_store: true,
            bitwise_coalescence: true,
            arithmetic_coalescence: true,
            host_flags_coalescence: true,
            max_iterations: 16,
        }
    }
}

/// Runs the enabled passes over `block` to a fixed point, then compacts it:
/// dropping unlinked ops and renumbering every surviving variable to a dense
/// 0-based range in first-use order, as `BasicBlock::compact` describes.
pub fn optimize(block: &mut BasicBlock, config: &PassConfig) {
    for round in 0..config.max_iterations {
        let mut changed = false;
        let mut subst = Substitution::new();

        if config.constant_propagation {
            changed |= passes::constant_propagation::run(block, &mut subst);
        }
        if config.dead_register_store {
            changed |= passes::dead_register_store::run(block);
        }
        if config.dead_gpr_store {
            changed |= passes::dead_gpr_store::run(block);
        }
        if config.dead_host_flag_store {
            changed |= passes::dead_host_flag_store::run(block);
        }
        if config.dead_flag_value_store {
            changed |= passes::dead_flag_value_store::run(block);
        }
        if config.dead_variable_store {
            changed |= passes::dead_variable_store::run(block);
        }
        if config.bitwise_coalescence {
            changed |= passes::bitwise_coalescence::run(block);
        }
        if config.arithmetic_coalescence {
            changed |= passes::arithmetic_coalescence::run(block);
        }
        if config.host_flags_coalescence {
            changed |= passes::host_flags_coalescence::run(block);
        }

        if !changed {
            debug!("optimizer reached a fixed point after {} round(s)", round + 1);
            break;
        }
        if round + 1 == config.max_iterations {
            warn!("optimizer hit its {}-round iteration cap without reaching a fixed point", config.max_iterations);
        }
    }

    block.compact(|op| op.clone());
}

#[cfg(test)]
mod tests {
    use arm_ir::{GprArg, Op, VarOrImm};
    use arm_state::{Condition, Gpr, LocationRef, Mode};

    use super::*;

    fn sample_block() -> BasicBlock {
        BasicBlock::new(LocationRef::new(0, Mode::Supervisor, false), Condition::Al)
    }

    #[test]
    fn chained_simplifications_collapse_across_rounds() {
        let mut block = sample_block();
        // r0 = (1 + 2) + 3, stored twice with the second shadowing the first.
        let a = block.new_variable();
        let b = block.new_variable();
        block.push(Op::Add { dst: Some(a), lhs: VarOrImm::Imm(1), rhs: VarOrImm::Imm(2), set_flags: false });
        block.push(Op::Add { dst: Some(b), lhs: a.into(), rhs: VarOrImm::Imm(3), set_flags: false });
        block.push(Op::StoreGpr { dst: GprArg::new(Gpr(0)), src: VarOrImm::Imm(0) });
        block.push(Op::StoreGpr { dst: GprArg::new(Gpr(0)), src: b.into() });

        optimize(&mut block, &PassConfig::default());

        let ops: Vec<_> = block.iter().map(|(_, op)| op.clone()).collect();
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], Op::StoreGpr { src: VarOrImm::Imm(6), .. }));
    }

    #[test]
    fn empty_block_optimizes_to_empty() {
        let mut block = sample_block();
        optimize(&mut block, &PassConfig::default());
        assert!(block.is_empty());
    }
}
