//! The exception-entry helper (§4.1): the IR sequence shared by every
//! synchronous exception the translator can raise (undefined instruction,
//! software interrupt) and, in spirit, the backend's IRQ-entry stub
//! (§4.4), which performs the same steps directly in host code instead of
//! through IR.
//!
//! Sequence: save old CPSR to the target mode's SPSR, clear the Thumb bit,
//! set I (and F for FIQ), switch mode, set LR to the offset-adjusted
//! return address, and compute PC as the base vector plus the vector
//! offset.

use arm_ir::{Emitter, GprArg};
use arm_state::{Gpr, Mode};

/// Byte offset of each exception vector from the coprocessor's base vector
/// address (the standard ARM vector table layout).
pub mod vector {
    pub const UNDEFINED: u32 = 0x04;
    pub const SOFTWARE_INTERRUPT: u32 = 0x08;
    pub const IRQ: u32 = 0x18;
    pub const FIQ: u32 = 0x1C;
}

/// Every exception lands back in ARM state, so the new block's first fetch
/// sees PC = vector + this pipeline offset (§3's architectural-PC
/// convention: `ArmState::pc()` is always fetch-address + 2 instructions).
pub const ARM_PIPELINE_OFFSET: u32 = 8;

fn target_mode(offset: u32) -> Mode {
    match offset {
        vector::UNDEFINED => Mode::Undefined,
        vector::SOFTWARE_INTERRUPT => Mode::Supervisor,
        vector::IRQ => Mode::Irq,
        vector::FIQ => Mode::Fiq,
        _ => Mode::Supervisor,
    }
}

/// Emits the exception-entry IR sequence into the current block. `return_pc`
/// is the already offset-adjusted value to store into the target mode's LR
/// (the caller picks the right offset for the vector being entered — see
/// spec.md §9's note that LR offsets are architecture-defined per
/// exception, not part of this shared helper).
pub fn emit_exception_entry(emitter: &mut Emitter<'_>, vector_offset: u32, return_pc: u32) {
    let mode = target_mode(vector_offset);
    let is_fiq = vector_offset == vector::FIQ;

    let old_cpsr = emitter.load_cpsr();
    emitter.store_spsr(mode, old_cpsr);

    // new_cpsr = (old_cpsr & !(T | MODE)) | mode_bits | I | (F if FIQ)
    let clear_mask = !(thumb_bit() | Mode::MASK);
    let cleared = emitter.new_variable();
    emitter.and(Some(cleared), old_cpsr, clear_mask, false);
    let mut set_bits = mode.bits() | irq_disable_bit();
    if is_fiq {
        set_bits |= fiq_disable_bit();
    }
    let new_cpsr = emitter.orr(cleared, set_bits, false);
    emitter.store_cpsr(new_cpsr);

    emitter.store_gpr(GprArg::new(Gpr::LR), return_pc);

    let base = emitter.get_base_vector_address();
    let pc = emitter.new_variable();
    emitter.add(Some(pc), base, vector_offset.wrapping_add(ARM_PIPELINE_OFFSET), false);
    emitter.store_gpr(GprArg::new(Gpr::PC), pc);
}

fn thumb_bit() -> u32 {
    1 << 5
}

fn irq_disable_bit() -> u32 {
    1 << 7
}

fn fiq_disable_bit() -> u32 {
    1 << 6
}

/// Applies the same sequence directly to `ArmState`, for the backend's
/// IRQ-entry stub (§4.4), which performs exception entry "directly in host
/// code... without compiling an IR block".
pub fn apply_exception_entry(state: &mut arm_state::ArmState, base_vector: u32, vector_offset: u32, return_pc: u32) {
    let mode = target_mode(vector_offset);
    let is_fiq = vector_offset == vector::FIQ;

    let old_cpsr = state.cpsr();
    state.set_spsr_in(mode, old_cpsr);

    let mut new_cpsr = old_cpsr;
    new_cpsr.set_thumb(false);
    new_cpsr.set_mode(mode);
    new_cpsr.set_irq_disable(true);
    if is_fiq {
        new_cpsr.set_fiq_disable(true);
    }
    state.set_cpsr(new_cpsr);

    state.set_gpr(Gpr::LR, return_pc);
    state.set_pc(base_vector.wrapping_add(vector_offset).wrapping_add(ARM_PIPELINE_OFFSET));
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm_state::ArmState;

    #[test]
    fn irq_entry_matches_scenario_e_pc_and_lr() {
        let mut state = ArmState::new();
        state.set_pc(0x0800_1008);
        apply_exception_entry(&mut state, 0, vector::IRQ, 0x0800_1008);
        assert_eq!(state.pc(), 0x18 + ARM_PIPELINE_OFFSET);
        assert_eq!(state.gpr(Gpr::LR), 0x0800_1008);
        assert_eq!(state.mode(), Mode::Irq);
        assert!(state.cpsr().irq_disable());
        assert!(!state.cpsr().thumb());
    }

    #[test]
    fn irq_entry_preserves_old_cpsr_in_spsr() {
        let mut state = ArmState::new();
        let mut cpsr = state.cpsr();
        cpsr.set_zero(true);
        state.set_cpsr(cpsr);
        apply_exception_entry(&mut state, 0, vector::IRQ, 0x100);
        assert_eq!(state.spsr_in(Mode::Irq), cpsr);
    }
}
