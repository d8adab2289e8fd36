//! The translator driver (§4.1): reads guest opcodes, decodes them, lowers
//! each to IR, and decides when a block ends.

use arm_decode::{decode_arm, decode_thumb};
use arm_ir::{BasicBlock, Emitter, Terminator};
use arm_state::{Condition, LocationRef, Memory};

use crate::arm_lower;
use crate::thumb_lower;

/// Which extensions are available to the guest core being translated for.
/// Gates ARMv5TE-only encodings (`BLX`, `CLZ`, saturating arithmetic,
/// exchange-on-load) that a real ARMv4T core would treat as undefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Armv4T,
    Armv5TE,
}

impl Architecture {
    pub fn is_v5te(self) -> bool {
        matches!(self, Architecture::Armv5TE)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TranslateConfig {
    pub architecture: Architecture,
    /// Whether CP15 is installed (ARM946E-S model) — gates coprocessor
    /// register transfers, which become `undefined` otherwise (§7).
    pub cp15_present: bool,
    /// `translator.max_block_size` (§6), upper bound on instructions per
    /// block.
    pub max_block_size: u32,
}

/// What one lowered instruction tells the translator about continuing.
pub(crate) struct LowerOutcome {
    /// Cost (in the core's simplified cycle model — see DESIGN.md) of
    /// executing this instruction.
    pub cycles: u32,
    /// Set when this instruction ends the block (rule (a): unconditional
    /// control flow).
    pub terminator: Option<Terminator>,
}

/// The target architectural PC of a branch, computed from the current
/// instruction's own architectural PC (`tracked_pc`, which already reads as
/// fetch address + one prefetch-pipeline's worth of bytes, per §3) and a
/// signed byte offset. `tracked_pc` already carries the pipeline lookahead,
/// so the target is a plain sum — matching how `lower_branch_link_exchange_
/// immediate`/`lower_bl_suffix` compute their own (exchanging) targets
/// without a second pipeline addition.
pub fn branch_target(tracked_pc: u32, offset: i32) -> u32 {
    tracked_pc.wrapping_add(offset as u32)
}

/// Translates one basic block starting at `location`, per §4.1: reads one
/// opcode at a time, decodes, lowers, and stops on an unconditional
/// control-flow instruction, a condition-code change, or `max_block_size`
/// instructions.
pub fn translate_block<M: Memory>(mem: &mut M, location: LocationRef, config: &TranslateConfig) -> BasicBlock {
    if location.is_thumb() {
        translate_thumb(mem, location, config)
    } else {
        translate_arm(mem, location, config)
    }
}

fn translate_arm<M: Memory>(mem: &mut M, location: LocationRef, config: &TranslateConfig) -> BasicBlock {
    let mut block_condition: Option<Condition> = None;
    let mut block = BasicBlock::new(location, Condition::Al);
    let mut tracked_pc = location.pc();
    let mut pending_flags_conditional_guard = false;

    for _ in 0..config.max_block_size {
        let fetch_addr = tracked_pc.wrapping_sub(8);
        let opcode = mem.read_word(fetch_addr);
        let instr = decode_arm(opcode);
        let cond = instr.condition();

        match block_condition {
            None => {
                block_condition = Some(cond);
                block.condition = cond;
            }
            Some(existing) if existing != cond => break, // rule (b)
            _ => {}
        }
        if pending_flags_conditional_guard && cond != Condition::Al {
            break; // rule (c)
        }

        let loc = LocationRef::new(tracked_pc, location.mode(), false);
        let mut emitter = Emitter::new(&mut block);
        let outcome = arm_lower::lower(&mut emitter, instr, tracked_pc, loc, config);
        block.instruction_count += 1;
        block.pass_cycles += outcome.cycles;
        block.fail_cycles += 1;
        pending_flags_conditional_guard = arm_lower::may_affect_flags(&instr);

        tracked_pc = tracked_pc.wrapping_add(4);

        if let Some(terminator) = outcome.terminator {
            block.terminator = terminator;
            return block;
        }
    }

    block.terminator = Terminator::DirectLink(LocationRef::new(tracked_pc, location.mode(), false));
    block
}

fn translate_thumb<M: Memory>(mem: &mut M, location: LocationRef, config: &TranslateConfig) -> BasicBlock {
    let mut block_condition: Option<Condition> = None;
    let mut block = BasicBlock::new(location, Condition::Al);
    let mut tracked_pc = location.pc();
    let mut bl_prefix_lr: Option<u32> = None;

    for _ in 0..config.max_block_size {
        let fetch_addr = tracked_pc.wrapping_sub(4);
        let opcode = mem.read_half(fetch_addr);
        let instr = decode_thumb(opcode);
        let cond = thumb_lower::condition_of(&instr);

        // Thumb has no per-instruction condition field outside
        // `ConditionalBranch`, which carries its own 4-bit condition. A
        // block's condition is fixed for its whole body (the backend gates
        // execution of the block once, not per op), so a `ConditionalBranch`
        // reuses the same rule (b) break ARM uses for a mid-block condition
        // change: it always becomes the sole instruction of its own block.
        match block_condition {
            None => {
                block_condition = Some(cond);
                block.condition = cond;
            }
            Some(existing) if existing != cond => break,
            _ => {}
        }

        let loc = LocationRef::new(tracked_pc, location.mode(), true);
        let mut emitter = Emitter::new(&mut block);
        let outcome = thumb_lower::lower(&mut emitter, instr, tracked_pc, loc, config, &mut bl_prefix_lr);
        block.instruction_count += 1;
        block.pass_cycles += outcome.cycles;
        block.fail_cycles += 1;

        tracked_pc = tracked_pc.wrapping_add(2);

        if let Some(terminator) = outcome.terminator {
            block.terminator = terminator;
            return block;
        }
    }

    block.terminator = Terminator::DirectLink(LocationRef::new(tracked_pc, location.mode(), true));
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_target_with_zero_offset_is_the_architectural_pc() {
        // B with offset 0 from an instruction at architectural PC 0x1008
        // (fetch address 0x1000) lands on fetch address 0x1008, i.e. two
        // instructions past the branch itself.
        assert_eq!(branch_target(0x1008, 0), 0x1008);
    }

    #[test]
    fn branch_target_with_self_loop_offset_lands_on_the_branch_itself() {
        // offset -8 (the common `B .` infinite-loop encoding) must land
        // back on the branch instruction's own fetch address.
        assert_eq!(branch_target(0x1008, -8), 0x1000);
    }
}
