//! Lowers one decoded 32-bit ARM instruction to IR (§4.1).
//!
//! Every function here assumes its instruction's condition has already been
//! accepted by the translator's block-condition tracking — lowering never
//! emits a conditional guard itself, since a whole block shares one
//! condition (rule (b)).

use arm_decode::{ArmInstr, CopTransfer, DpOp, ExchangeMode, HalfwordKind, HalfwordOffset, Operand2, SatOp};
use arm_ir::{Emitter, ExchangeSource, GprArg, MemAccessMode, MemAccessSize, Terminator, VarOrImm};
use arm_state::{Gpr, LocationRef};

use crate::exception::{emit_exception_entry, vector};
use crate::pipeline::read_shift_amount;
use crate::shifter::barrel_shift;
use crate::translator::{branch_target, Architecture, LowerOutcome, TranslateConfig};

const ARM_INSTRUCTION_SIZE: u32 = 4;

pub(crate) fn lower(
    emitter: &mut Emitter<'_>,
    instr: ArmInstr,
    tracked_pc: u32,
    loc: LocationRef,
    config: &TranslateConfig,
) -> LowerOutcome {
    match instr {
        ArmInstr::DataProcessing { op, set_flags, rn, rd, operand2, .. } => {
            lower_data_processing(emitter, op, set_flags, rn, rd, operand2, tracked_pc, loc)
        }
        ArmInstr::Multiply { accumulate, set_flags, rd, rn, rs, rm, .. } => {
            lower_multiply(emitter, accumulate, set_flags, rd, rn, rs, rm)
        }
        ArmInstr::MultiplyLong { signed, accumulate, set_flags, rd_hi, rd_lo, rs, rm, .. } => {
            lower_multiply_long(emitter, signed, accumulate, set_flags, rd_hi, rd_lo, rs, rm)
        }
        ArmInstr::SingleDataTransfer { load, byte, pre_index, add, writeback, rn, rd, offset, .. } => {
            lower_single_data_transfer(
                emitter,
                config.architecture,
                load,
                byte,
                pre_index,
                add,
                writeback,
                rn,
                rd,
                offset,
                tracked_pc,
            )
        }
        ArmInstr::HalfwordTransfer { load, kind, pre_index, add, writeback, rn, rd, offset, .. } => {
            lower_halfword_transfer(emitter, load, kind, pre_index, add, writeback, rn, rd, offset, tracked_pc)
        }
        ArmInstr::BlockDataTransfer { load, pre_index, add, user_bank, writeback, rn, register_list, .. } => {
            lower_block_data_transfer(
                emitter,
                config.architecture,
                load,
                pre_index,
                add,
                user_bank,
                writeback,
                rn,
                register_list,
                tracked_pc,
                loc,
            )
        }
        ArmInstr::Branch { link, offset, .. } => lower_branch(emitter, link, offset, tracked_pc, loc),
        ArmInstr::BranchLinkExchangeImmediate { offset } => {
            lower_branch_link_exchange_immediate(emitter, offset, tracked_pc, config.architecture)
        }
        ArmInstr::BranchExchange { mode, rm, .. } => lower_branch_exchange(emitter, mode, rm, tracked_pc),
        ArmInstr::SaturatingArithmetic { op, rd, rn, rm, .. } => lower_saturating_arithmetic(emitter, op, rd, rn, rm),
        ArmInstr::SoftwareInterrupt { .. } => lower_software_interrupt(emitter, tracked_pc),
        ArmInstr::MrsTransfer { spsr, rd, .. } => lower_mrs(emitter, spsr, rd, loc),
        ArmInstr::MsrTransfer { spsr, field_mask, operand, .. } => {
            lower_msr(emitter, spsr, field_mask, operand, loc, tracked_pc)
        }
        ArmInstr::CoprocessorRegisterTransfer { xfer, .. } => {
            lower_coprocessor(emitter, xfer, config.cp15_present, tracked_pc)
        }
        ArmInstr::Undefined { .. } => lower_undefined(emitter, tracked_pc),
        // Forward-compatible with decoder variants added later (`ArmInstr`
        // is `#[non_exhaustive]`): treat anything unrecognized the way real
        // hardware treats an unallocated encoding.
        _ => lower_undefined(emitter, tracked_pc),
    }
}

/// Whether this instruction writes the condition flags, for the
/// translator's rule (c) (a conditionally-executed instruction can't follow
/// one that just changed the flags within the same block).
pub(crate) fn may_affect_flags(instr: &ArmInstr) -> bool {
    match *instr {
        ArmInstr::DataProcessing { set_flags, .. }
        | ArmInstr::Multiply { set_flags, .. }
        | ArmInstr::MultiplyLong { set_flags, .. } => set_flags,
        // MSR touches the flags whenever its field mask includes the flags
        // byte (bit 3, `f`) or the control byte (bit 0, `c`) — the latter
        // carries T/I/F/mode, not NZCV, but the original still treats it as
        // flag-affecting for the purposes of this split.
        ArmInstr::MsrTransfer { field_mask, .. } => field_mask & 0b1001 != 0,
        // An MRC loading into R15 folds its value into CPSR's NZCV bits
        // instead of writing PC.
        ArmInstr::CoprocessorRegisterTransfer { xfer, .. } => xfer.load && xfer.rd == 15,
        _ => false,
    }
}

fn value_add(emitter: &mut Emitter<'_>, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>) -> VarOrImm {
    let dst = emitter.new_variable();
    emitter.add(Some(dst), lhs, rhs, false);
    dst.into()
}

fn value_sub(emitter: &mut Emitter<'_>, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>) -> VarOrImm {
    let dst = emitter.new_variable();
    emitter.sub(Some(dst), lhs, rhs, false);
    dst.into()
}

fn gpr_or_pc(emitter: &mut Emitter<'_>, reg: u8, tracked_pc: u32) -> VarOrImm {
    if reg == 15 {
        tracked_pc.into()
    } else {
        emitter.load_gpr(GprArg::new(Gpr(reg))).into()
    }
}

fn emit_store_flag_bit(emitter: &mut Emitter<'_>, mask: u8, bit_set: bool) {
    let src = emitter.load_cpsr();
    let position = arm_ir::flag_mask_to_psr_bits(mask);
    let values = if bit_set { position } else { 0 };
    emitter.store_flags(mask, src, values);
}

/// Resolves a data-processing/addressing `Operand2` to a value. `carry_matters`
/// requests the shifter (or, for a rotated immediate, a direct flag store)
/// update the live carry flag — only logical data-processing opcodes with S
/// set pass `true` (§4.1).
fn resolve_operand2(emitter: &mut Emitter<'_>, operand2: Operand2, carry_matters: bool, tracked_pc: u32) -> VarOrImm {
    match operand2 {
        Operand2::Immediate { value, rotate } => {
            if carry_matters && rotate != 0 {
                emit_store_flag_bit(emitter, arm_ir::FLAG_C, (value >> 31) & 1 != 0);
            }
            value.into()
        }
        Operand2::Register { rm, shift_op, amount } => {
            let rm_value = gpr_or_pc(emitter, rm, tracked_pc);
            let amount_value = read_shift_amount(emitter, amount, tracked_pc, ARM_INSTRUCTION_SIZE);
            barrel_shift(emitter, shift_op, amount, rm_value, amount_value, carry_matters)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn lower_data_processing(
    emitter: &mut Emitter<'_>,
    op: DpOp,
    set_flags: bool,
    rn: u8,
    rd: u8,
    operand2: Operand2,
    tracked_pc: u32,
    loc: LocationRef,
) -> LowerOutcome {
    let carry_matters =
        set_flags && matches!(op, DpOp::And | DpOp::Eor | DpOp::Orr | DpOp::Bic | DpOp::Mov | DpOp::Mvn | DpOp::Tst | DpOp::Teq);
    let rhs = resolve_operand2(emitter, operand2, carry_matters, tracked_pc);
    let lhs = if op.reads_rn() { gpr_or_pc(emitter, rn, tracked_pc) } else { 0u32.into() };

    let result: Option<VarOrImm> = match op {
        DpOp::And => {
            let dst = emitter.new_variable();
            emitter.and(Some(dst), lhs, rhs, set_flags);
            Some(dst.into())
        }
        DpOp::Tst => {
            emitter.and(None, lhs, rhs, true);
            None
        }
        DpOp::Eor => {
            let dst = emitter.new_variable();
            emitter.eor(Some(dst), lhs, rhs, set_flags);
            Some(dst.into())
        }
        DpOp::Teq => {
            emitter.eor(None, lhs, rhs, true);
            None
        }
        DpOp::Sub => {
            let dst = emitter.new_variable();
            emitter.sub(Some(dst), lhs, rhs, set_flags);
            Some(dst.into())
        }
        DpOp::Cmp => {
            emitter.sub(None, lhs, rhs, true);
            None
        }
        DpOp::Rsb => Some(emitter.rsb(lhs, rhs, set_flags).into()),
        DpOp::Add => {
            let dst = emitter.new_variable();
            emitter.add(Some(dst), lhs, rhs, set_flags);
            Some(dst.into())
        }
        DpOp::Cmn => {
            emitter.add(None, lhs, rhs, true);
            None
        }
        DpOp::Adc => Some(emitter.adc(lhs, rhs, set_flags).into()),
        DpOp::Sbc => Some(emitter.sbc(lhs, rhs, set_flags).into()),
        DpOp::Rsc => Some(emitter.rsc(lhs, rhs, set_flags).into()),
        DpOp::Orr => Some(emitter.orr(lhs, rhs, set_flags).into()),
        DpOp::Mov => Some(emitter.mov(rhs, set_flags).into()),
        DpOp::Bic => Some(emitter.bic(lhs, rhs, set_flags).into()),
        DpOp::Mvn => Some(emitter.mvn(rhs, set_flags).into()),
    };

    let Some(result) = result else {
        return LowerOutcome { cycles: 1, terminator: None };
    };

    if rd == 15 {
        emitter.store_gpr(GprArg::new(Gpr::PC), result);
        if set_flags {
            // `MOVS PC, Rn`-style exception return: CPSR is replaced by the
            // current mode's SPSR (§4.1).
            let spsr = emitter.load_spsr(loc.mode());
            emitter.store_cpsr(spsr);
        }
        LowerOutcome { cycles: 2, terminator: Some(Terminator::IndirectLink) }
    } else {
        emitter.store_gpr(GprArg::new(Gpr(rd)), result);
        LowerOutcome { cycles: 1, terminator: None }
    }
}

fn lower_multiply(
    emitter: &mut Emitter<'_>,
    accumulate: bool,
    set_flags: bool,
    rd: u8,
    rn: u8,
    rs: u8,
    rm: u8,
) -> LowerOutcome {
    let rm_val = emitter.load_gpr(GprArg::new(Gpr(rm)));
    let rs_val = emitter.load_gpr(GprArg::new(Gpr(rs)));
    let result = if accumulate {
        let (product, _) = emitter.multiply(false, rm_val, rs_val, false, false);
        let rn_val = emitter.load_gpr(GprArg::new(Gpr(rn)));
        let sum = value_add(emitter, product, rn_val);
        // MLA{S} leaves C and V unchanged — only N/Z are meaningful — so the
        // accumulate's own add must stay unflagged; a flag-setting `Mov` of
        // the sum commits exactly N/Z the way MULS's `Op::Multiply` already
        // does for the non-accumulate path below.
        emitter.mov(sum, set_flags)
    } else {
        let (product, _) = emitter.multiply(false, rm_val, rs_val, false, set_flags);
        product
    };
    emitter.store_gpr(GprArg::new(Gpr(rd)), result);
    LowerOutcome { cycles: 2, terminator: None }
}

#[allow(clippy::too_many_arguments)]
fn lower_multiply_long(
    emitter: &mut Emitter<'_>,
    signed: bool,
    accumulate: bool,
    set_flags: bool,
    rd_hi: u8,
    rd_lo: u8,
    rs: u8,
    rm: u8,
) -> LowerOutcome {
    let rm_val = emitter.load_gpr(GprArg::new(Gpr(rm)));
    let rs_val = emitter.load_gpr(GprArg::new(Gpr(rs)));
    let (lo, hi) = if accumulate {
        let (lo, hi) = emitter.multiply(true, rm_val, rs_val, signed, false);
        let rdlo_val = emitter.load_gpr(GprArg::new(Gpr(rd_lo)));
        let rdhi_val = emitter.load_gpr(GprArg::new(Gpr(rd_hi)));
        emitter.add_long(lo, hi.expect("wide multiply always produces a high half"), rdlo_val, rdhi_val, set_flags)
    } else {
        let (lo, hi) = emitter.multiply(true, rm_val, rs_val, signed, set_flags);
        (lo, hi.expect("wide multiply always produces a high half"))
    };
    emitter.store_gpr(GprArg::new(Gpr(rd_lo)), lo);
    emitter.store_gpr(GprArg::new(Gpr(rd_hi)), hi);
    LowerOutcome { cycles: 3, terminator: None }
}

#[allow(clippy::too_many_arguments)]
fn lower_single_data_transfer(
    emitter: &mut Emitter<'_>,
    architecture: Architecture,
    load: bool,
    byte: bool,
    pre_index: bool,
    add: bool,
    writeback: bool,
    rn: u8,
    rd: u8,
    offset: Operand2,
    tracked_pc: u32,
) -> LowerOutcome {
    let base = gpr_or_pc(emitter, rn, tracked_pc);
    let offset_value = resolve_operand2(emitter, offset, false, tracked_pc);
    let effective = if pre_index {
        if add { value_add(emitter, base, offset_value) } else { value_sub(emitter, base, offset_value) }
    } else {
        base
    };

    let mut terminator = None;
    if load {
        let (mode, size) =
            if byte { (MemAccessMode::Raw, MemAccessSize::Byte) } else { (MemAccessMode::Unaligned, MemAccessSize::Word) };
        let loaded = emitter.mem_read(mode, size, effective);
        if rd == 15 {
            if architecture.is_v5te() {
                let src_cpsr = emitter.load_cpsr();
                let (dst_pc, dst_cpsr) = emitter.branch_exchange(src_cpsr, loaded, ExchangeSource::MemoryLoad);
                emitter.store_gpr(GprArg::new(Gpr::PC), dst_pc);
                emitter.store_cpsr(dst_cpsr);
            } else {
                emitter.store_gpr(GprArg::new(Gpr::PC), loaded);
            }
            terminator = Some(Terminator::IndirectLink);
        } else {
            emitter.store_gpr(GprArg::new(Gpr(rd)), loaded);
        }
    } else {
        let value = gpr_or_pc(emitter, rd, tracked_pc);
        let size = if byte { MemAccessSize::Byte } else { MemAccessSize::Word };
        emitter.mem_write(size, value, effective);
    }

    if writeback && rn != 15 {
        let new_base = if pre_index {
            effective
        } else if add {
            value_add(emitter, base, offset_value)
        } else {
            value_sub(emitter, base, offset_value)
        };
        emitter.store_gpr(GprArg::new(Gpr(rn)), new_base);
    }

    LowerOutcome { cycles: if load { 2 } else { 1 }, terminator }
}

#[allow(clippy::too_many_arguments)]
fn lower_halfword_transfer(
    emitter: &mut Emitter<'_>,
    load: bool,
    kind: HalfwordKind,
    pre_index: bool,
    add: bool,
    writeback: bool,
    rn: u8,
    rd: u8,
    offset: HalfwordOffset,
    tracked_pc: u32,
) -> LowerOutcome {
    let base = gpr_or_pc(emitter, rn, tracked_pc);
    let offset_value: VarOrImm = match offset {
        HalfwordOffset::Immediate(v) => (v as u32).into(),
        HalfwordOffset::Register(r) => gpr_or_pc(emitter, r, tracked_pc),
    };
    let effective = if pre_index {
        if add { value_add(emitter, base, offset_value) } else { value_sub(emitter, base, offset_value) }
    } else {
        base
    };

    if load {
        let (mode, size) = match kind {
            HalfwordKind::UnsignedHalf => (MemAccessMode::Raw, MemAccessSize::Half),
            HalfwordKind::SignedByte => (MemAccessMode::Signed, MemAccessSize::Byte),
            HalfwordKind::SignedHalf => (MemAccessMode::Signed, MemAccessSize::Half),
        };
        let loaded = emitter.mem_read(mode, size, effective);
        emitter.store_gpr(GprArg::new(Gpr(rd)), loaded);
    } else {
        let value = gpr_or_pc(emitter, rd, tracked_pc);
        emitter.mem_write(MemAccessSize::Half, value, effective);
    }

    if writeback && rn != 15 {
        let new_base = if pre_index {
            effective
        } else if add {
            value_add(emitter, base, offset_value)
        } else {
            value_sub(emitter, base, offset_value)
        };
        emitter.store_gpr(GprArg::new(Gpr(rn)), new_base);
    }

    LowerOutcome { cycles: if load { 2 } else { 1 }, terminator: None }
}

#[allow(clippy::too_many_arguments)]
fn lower_block_data_transfer(
    emitter: &mut Emitter<'_>,
    architecture: Architecture,
    load: bool,
    pre_index: bool,
    add: bool,
    user_bank: bool,
    writeback: bool,
    rn: u8,
    register_list: u16,
    tracked_pc: u32,
    loc: LocationRef,
) -> LowerOutcome {
    let base = gpr_or_pc(emitter, rn, tracked_pc);
    let n = register_list.count_ones();

    let start = match (add, pre_index) {
        (true, false) => base,                                 // IA
        (true, true) => value_add(emitter, base, 4u32),         // IB
        (false, false) => value_sub(emitter, base, (4 * n).wrapping_sub(4)), // DA: base - 4n + 4
        (false, true) => value_sub(emitter, base, 4 * n),        // DB
    };
    let new_base = if add { value_add(emitter, base, 4 * n) } else { value_sub(emitter, base, 4 * n) };

    if writeback && rn != 15 && load {
        emitter.store_gpr(GprArg::new(Gpr(rn)), new_base);
    }

    let mut pc_written = false;
    let mut idx = 0u32;
    for reg in 0u8..16 {
        if register_list & (1 << reg) == 0 {
            continue;
        }
        let addr = if idx == 0 { start } else { value_add(emitter, start, 4 * idx) };
        idx += 1;

        let force_user_bank = user_bank && !(load && reg == 15);
        let gpr_arg = if force_user_bank { GprArg::user(Gpr(reg)) } else { GprArg::new(Gpr(reg)) };

        if load {
            let val = emitter.mem_read(MemAccessMode::Raw, MemAccessSize::Word, addr);
            if reg == 15 {
                pc_written = true;
                if architecture.is_v5te() {
                    let src_cpsr = emitter.load_cpsr();
                    let (dst_pc, dst_cpsr) = emitter.branch_exchange(src_cpsr, val, ExchangeSource::MemoryLoad);
                    emitter.store_gpr(GprArg::new(Gpr::PC), dst_pc);
                    emitter.store_cpsr(dst_cpsr);
                } else {
                    emitter.store_gpr(GprArg::new(Gpr::PC), val);
                }
                if user_bank {
                    // LDM{...}^ with R15 in the list: exception return, also
                    // restores CPSR from the executing mode's SPSR.
                    let spsr = emitter.load_spsr(loc.mode());
                    emitter.store_cpsr(spsr);
                }
            } else {
                emitter.store_gpr(gpr_arg, val);
            }
        } else {
            let value = if reg == 15 { tracked_pc.into() } else { emitter.load_gpr(gpr_arg).into() };
            emitter.mem_write(MemAccessSize::Word, value, addr);
        }
    }

    if writeback && rn != 15 && !load {
        emitter.store_gpr(GprArg::new(Gpr(rn)), new_base);
    }

    let terminator = if pc_written { Some(Terminator::IndirectLink) } else { None };
    LowerOutcome { cycles: n + 1, terminator }
}

fn lower_branch(emitter: &mut Emitter<'_>, link: bool, offset: i32, tracked_pc: u32, loc: LocationRef) -> LowerOutcome {
    if link {
        let return_pc = tracked_pc.wrapping_sub(ARM_INSTRUCTION_SIZE);
        emitter.store_gpr(GprArg::new(Gpr::LR), return_pc);
    }
    let target = branch_target(tracked_pc, offset);
    let src_cpsr = emitter.load_cpsr();
    let dst_pc = emitter.branch(src_cpsr, target);
    emitter.store_gpr(GprArg::new(Gpr::PC), dst_pc);
    let target_loc = LocationRef::new(target, loc.mode(), false);
    LowerOutcome { cycles: 3, terminator: Some(Terminator::DirectLink(target_loc)) }
}

fn lower_branch_link_exchange_immediate(
    emitter: &mut Emitter<'_>,
    offset: i32,
    tracked_pc: u32,
    architecture: Architecture,
) -> LowerOutcome {
    if !architecture.is_v5te() {
        // Real ARMv4T treats the whole NV condition space as unallocated.
        return lower_undefined(emitter, tracked_pc);
    }
    let return_pc = tracked_pc.wrapping_sub(ARM_INSTRUCTION_SIZE);
    emitter.store_gpr(GprArg::new(Gpr::LR), return_pc);
    let target = tracked_pc.wrapping_add(offset as u32);
    let address = target | 1; // forces Thumb state via BranchExchange's bit-0 rule
    let src_cpsr = emitter.load_cpsr();
    let (dst_pc, dst_cpsr) = emitter.branch_exchange(src_cpsr, address, ExchangeSource::Instruction);
    emitter.store_gpr(GprArg::new(Gpr::PC), dst_pc);
    emitter.store_cpsr(dst_cpsr);
    LowerOutcome { cycles: 3, terminator: Some(Terminator::IndirectLink) }
}

fn lower_branch_exchange(emitter: &mut Emitter<'_>, mode: ExchangeMode, rm: u8, tracked_pc: u32) -> LowerOutcome {
    if mode == ExchangeMode::BranchLink {
        let return_pc = tracked_pc.wrapping_sub(ARM_INSTRUCTION_SIZE);
        emitter.store_gpr(GprArg::new(Gpr::LR), return_pc);
    }
    let address = gpr_or_pc(emitter, rm, tracked_pc);
    let src_cpsr = emitter.load_cpsr();
    let (dst_pc, dst_cpsr) = emitter.branch_exchange(src_cpsr, address, ExchangeSource::Instruction);
    emitter.store_gpr(GprArg::new(Gpr::PC), dst_pc);
    emitter.store_cpsr(dst_cpsr);
    LowerOutcome { cycles: 3, terminator: Some(Terminator::IndirectLink) }
}

fn lower_software_interrupt(emitter: &mut Emitter<'_>, tracked_pc: u32) -> LowerOutcome {
    let return_pc = tracked_pc.wrapping_sub(ARM_INSTRUCTION_SIZE);
    emit_exception_entry(emitter, vector::SOFTWARE_INTERRUPT, return_pc);
    LowerOutcome { cycles: 3, terminator: Some(Terminator::ReturnToDispatcher) }
}

fn lower_undefined(emitter: &mut Emitter<'_>, tracked_pc: u32) -> LowerOutcome {
    let return_pc = tracked_pc.wrapping_sub(ARM_INSTRUCTION_SIZE);
    emit_exception_entry(emitter, vector::UNDEFINED, return_pc);
    LowerOutcome { cycles: 3, terminator: Some(Terminator::ReturnToDispatcher) }
}

fn lower_mrs(emitter: &mut Emitter<'_>, spsr: bool, rd: u8, loc: LocationRef) -> LowerOutcome {
    let value = if spsr { emitter.load_spsr(loc.mode()) } else { emitter.load_cpsr() };
    emitter.store_gpr(GprArg::new(Gpr(rd)), value);
    LowerOutcome { cycles: 1, terminator: None }
}

fn lower_msr(
    emitter: &mut Emitter<'_>,
    spsr: bool,
    field_mask: u8,
    operand: Operand2,
    loc: LocationRef,
    tracked_pc: u32,
) -> LowerOutcome {
    let operand_value = resolve_operand2(emitter, operand, false, tracked_pc);

    let mut byte_mask = 0u32;
    if field_mask & 0b0001 != 0 {
        byte_mask |= 0x0000_00FF;
    }
    if field_mask & 0b0010 != 0 {
        byte_mask |= 0x0000_FF00;
    }
    if field_mask & 0b0100 != 0 {
        byte_mask |= 0x00FF_0000;
    }
    if field_mask & 0b1000 != 0 {
        byte_mask |= 0xFF00_0000;
    }

    let old = if spsr { emitter.load_spsr(loc.mode()) } else { emitter.load_cpsr() };
    let kept = emitter.new_variable();
    emitter.and(Some(kept), old, !byte_mask, false);
    let masked = emitter.new_variable();
    emitter.and(Some(masked), operand_value, byte_mask, false);
    let new_value = emitter.orr(kept, masked, false);

    if spsr {
        emitter.store_spsr(loc.mode(), new_value);
    } else {
        emitter.store_cpsr(new_value);
    }
    LowerOutcome { cycles: 1, terminator: None }
}

/// QADD/QSUB/QDADD/QDSUB: `Rd = sat(Rm op Rn)`. Saturation commits the CPSR
/// Q bit as a side effect of the arithmetic op itself, the same way an ALU
/// op's `set_flags` commits NZCV directly — there's no `S` bit to gate it.
fn lower_saturating_arithmetic(emitter: &mut Emitter<'_>, op: SatOp, rd: u8, rn: u8, rm: u8) -> LowerOutcome {
    let lhs = emitter.load_gpr(GprArg::new(Gpr(rm)));
    let rhs = emitter.load_gpr(GprArg::new(Gpr(rn)));
    let dst = match op {
        SatOp::Add => emitter.saturating_add(lhs, rhs, false),
        SatOp::Sub => emitter.saturating_sub(lhs, rhs, false),
        SatOp::DoubleAdd => emitter.saturating_add(lhs, rhs, true),
        SatOp::DoubleSub => emitter.saturating_sub(lhs, rhs, true),
    };
    emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
    LowerOutcome { cycles: 1, terminator: None }
}

fn lower_coprocessor(emitter: &mut Emitter<'_>, xfer: CopTransfer, cp15_present: bool, tracked_pc: u32) -> LowerOutcome {
    if !cp15_present || xfer.cp_num != 15 {
        return lower_undefined(emitter, tracked_pc);
    }
    if xfer.load {
        let value = emitter.load_cop_register(xfer.cp_num, xfer.opcode1, xfer.crn, xfer.crm, xfer.opcode2, false);
        emitter.store_gpr(GprArg::new(Gpr(xfer.rd)), value);
    } else {
        let value = gpr_or_pc(emitter, xfer.rd, tracked_pc);
        emitter.store_cop_register(value, xfer.cp_num, xfer.opcode1, xfer.crn, xfer.crm, xfer.opcode2, false);
    }
    LowerOutcome { cycles: 2, terminator: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm_decode::{ShiftAmount, ShiftOp};
    use arm_ir::{BasicBlock, Op};
    use arm_state::{Condition, Mode};

    fn config(architecture: Architecture) -> TranslateConfig {
        TranslateConfig { architecture, cp15_present: true, max_block_size: 32 }
    }

    fn new_block() -> BasicBlock {
        BasicBlock::new(LocationRef::new(0x1000, Mode::Supervisor, false), Condition::Al)
    }

    #[test]
    fn ands_with_immediate_rotate_stores_carry() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        let operand2 = Operand2::Immediate { value: 0x8000_0000, rotate: 4 };
        lower_data_processing(&mut emitter, DpOp::And, true, 2, 1, operand2, 0x1008, block.location);
        let has_store_flags = block.iter().any(|(_, op)| matches!(op, Op::StoreFlags { mask, .. } if *mask == arm_ir::FLAG_C));
        assert!(has_store_flags);
    }

    #[test]
    fn mov_pc_with_s_bit_restores_cpsr_from_spsr() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        let operand2 = Operand2::Register { rm: 14, shift_op: ShiftOp::Lsl, amount: ShiftAmount::Immediate(0) };
        let outcome = lower_data_processing(&mut emitter, DpOp::Mov, true, 0, 15, operand2, 0x1008, block.location);
        assert_eq!(outcome.terminator, Some(Terminator::IndirectLink));
        assert!(block.iter().any(|(_, op)| matches!(op, Op::LoadSpsr { .. })));
        assert!(block.iter().any(|(_, op)| matches!(op, Op::StoreCpsr { .. })));
    }

    #[test]
    fn branch_with_link_sets_lr_and_direct_link_terminator() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        let outcome = lower_branch(&mut emitter, true, 8, 0x1008, block.location);
        match outcome.terminator {
            Some(Terminator::DirectLink(loc)) => assert_eq!(loc.pc(), 0x1008 + 8),
            other => panic!("unexpected terminator: {other:?}"),
        }
        assert!(block.iter().any(|(_, op)| matches!(op, Op::StoreGpr { dst, .. } if dst.gpr == Gpr::LR)));
    }

    #[test]
    fn bx_sets_indirect_link_and_writes_cpsr() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        let outcome = lower_branch_exchange(&mut emitter, ExchangeMode::Branch, 14, 0x1008);
        assert_eq!(outcome.terminator, Some(Terminator::IndirectLink));
        assert!(block.iter().any(|(_, op)| matches!(op, Op::BranchExchange { .. })));
    }

    #[test]
    fn undefined_blx_label_on_v4t_falls_back_to_undefined_entry() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        let outcome = lower_branch_link_exchange_immediate(&mut emitter, 8, 0x1008, Architecture::Armv4T);
        assert_eq!(outcome.terminator, Some(Terminator::ReturnToDispatcher));
    }

    #[test]
    fn coprocessor_transfer_without_cp15_becomes_undefined() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        let xfer = CopTransfer { load: true, cp_num: 15, crn: 1, rd: 0, crm: 0, opcode1: 0, opcode2: 0 };
        let outcome = lower_coprocessor(&mut emitter, xfer, false, 0x1008);
        assert_eq!(outcome.terminator, Some(Terminator::ReturnToDispatcher));
    }

    #[test]
    fn qdadd_doubles_rhs_before_saturating() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        let outcome = lower_saturating_arithmetic(&mut emitter, arm_decode::SatOp::DoubleAdd, 0, 1, 2);
        assert_eq!(outcome.terminator, None);
        assert!(block.iter().any(|(_, op)| matches!(op, Op::SaturatingAdd { double_rhs: true, .. })));
    }

    #[test]
    fn ldmia_with_four_registers_computes_ascending_addresses() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        let outcome = lower_block_data_transfer(
            &mut emitter,
            Architecture::Armv5TE,
            true,
            false,
            true,
            false,
            true,
            13,
            0b1_1110,
            0x1008,
            block.location,
        );
        assert_eq!(outcome.terminator, None);
        let reads = block.iter().filter(|(_, op)| matches!(op, Op::MemRead { .. })).count();
        assert_eq!(reads, 4);
    }
}
