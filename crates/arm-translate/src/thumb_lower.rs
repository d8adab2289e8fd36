//! Lowers one decoded 16-bit Thumb instruction to IR (§4.1).
//!
//! Mirrors `arm_lower`'s contract: the block's condition has already been
//! accepted by the translator before this function runs. Thumb has no
//! per-instruction condition field except `ConditionalBranch`; the
//! translator applies the same block-condition tracking used for ARM so
//! that a conditional branch always starts (and ends) its own
//! single-instruction block, letting the host backend's existing
//! condition-check/fail-tail machinery handle it without any IR-level
//! conditional select.

use arm_decode::{AluOp, DpOp, ExchangeMode, HiOp, ThumbInstr, ThumbShiftOp};
use arm_ir::{Emitter, ExchangeSource, GprArg, MemAccessMode, MemAccessSize, Terminator, VarOrImm};
use arm_state::{Gpr, LocationRef};

use crate::exception::{emit_exception_entry, vector};
use crate::translator::{branch_target, Architecture, LowerOutcome, TranslateConfig};

const THUMB_INSTRUCTION_SIZE: u32 = 2;

pub(crate) fn lower(
    emitter: &mut Emitter<'_>,
    instr: ThumbInstr,
    tracked_pc: u32,
    loc: LocationRef,
    config: &TranslateConfig,
    bl_prefix_lr: &mut Option<u32>,
) -> LowerOutcome {
    match instr {
        ThumbInstr::MoveShifted { op, amount, rs, rd } => lower_move_shifted(emitter, op, amount, rs, rd),
        ThumbInstr::AddSubtractRegister { subtract, rn, rs, rd } => {
            lower_add_subtract_register(emitter, subtract, rn, rs, rd)
        }
        ThumbInstr::AddSubtractImmediate { subtract, imm3, rs, rd } => {
            lower_add_subtract_immediate(emitter, subtract, imm3, rs, rd)
        }
        ThumbInstr::MovCmpAddSubImmediate { op, rd, imm8 } => lower_mov_cmp_add_sub_immediate(emitter, op, rd, imm8),
        ThumbInstr::AluOperation { op, rs, rd } => lower_alu_operation(emitter, op, rs, rd),
        ThumbInstr::HiRegisterOp { op, rs, rd } => lower_hi_register_op(emitter, op, rs, rd, tracked_pc),
        ThumbInstr::BranchExchange { mode, rs } => lower_branch_exchange(emitter, mode, rs, tracked_pc, config),
        ThumbInstr::PcRelativeLoad { rd, imm8 } => lower_pc_relative_load(emitter, rd, imm8, tracked_pc),
        ThumbInstr::LoadStoreRegisterOffset { load, byte, ro, rb, rd } => {
            lower_load_store_register_offset(emitter, load, byte, ro, rb, rd)
        }
        ThumbInstr::LoadStoreSignExtended { h, sign_extend, ro, rb, rd } => {
            lower_load_store_sign_extended(emitter, h, sign_extend, ro, rb, rd)
        }
        ThumbInstr::LoadStoreImmediateOffset { load, byte, imm5, rb, rd } => {
            lower_load_store_immediate_offset(emitter, load, byte, imm5, rb, rd)
        }
        ThumbInstr::LoadStoreHalfword { load, imm5, rb, rd } => lower_load_store_halfword(emitter, load, imm5, rb, rd),
        ThumbInstr::SpRelativeLoadStore { load, rd, imm8 } => lower_sp_relative_load_store(emitter, load, rd, imm8),
        ThumbInstr::LoadAddress { sp, rd, imm8 } => lower_load_address(emitter, sp, rd, imm8, tracked_pc),
        ThumbInstr::AddOffsetToSp { negative, imm7 } => lower_add_offset_to_sp(emitter, negative, imm7),
        ThumbInstr::PushPop { store, include_pc_lr, register_list } => {
            lower_push_pop(emitter, store, include_pc_lr, register_list, config.architecture)
        }
        ThumbInstr::MultipleLoadStore { load, rb, register_list } => {
            lower_multiple_load_store(emitter, load, rb, register_list)
        }
        ThumbInstr::ConditionalBranch { offset, .. } => lower_conditional_branch(emitter, offset, tracked_pc, loc),
        ThumbInstr::SoftwareInterrupt { .. } => lower_software_interrupt(emitter, tracked_pc),
        ThumbInstr::UnconditionalBranch { offset } => lower_unconditional_branch(emitter, offset, tracked_pc, loc),
        ThumbInstr::LongBranchWithLinkPrefix { offset_hi } => {
            lower_bl_prefix(tracked_pc, offset_hi, bl_prefix_lr)
        }
        ThumbInstr::LongBranchWithLinkSuffix { offset_lo, exchange } => {
            lower_bl_suffix(emitter, offset_lo, exchange, tracked_pc, loc, config.architecture, bl_prefix_lr)
        }
        ThumbInstr::Undefined => lower_undefined(emitter, tracked_pc),
        _ => lower_undefined(emitter, tracked_pc),
    }
}

/// Whether this instruction starts a new condition context, for the
/// translator's rule-(b) block-splitting logic (every Thumb instruction is
/// unconditional except `ConditionalBranch`, which takes on its own
/// 4-bit condition).
pub(crate) fn condition_of(instr: &ThumbInstr) -> arm_state::Condition {
    match *instr {
        ThumbInstr::ConditionalBranch { cond_bits, .. } => arm_state::Condition::from_bits(cond_bits as u32),
        _ => arm_state::Condition::Al,
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

fn to_shift_op(op: ThumbShiftOp) -> arm_decode::ShiftOp {
    match op {
        ThumbShiftOp::Lsl => arm_decode::ShiftOp::Lsl,
        ThumbShiftOp::Lsr => arm_decode::ShiftOp::Lsr,
        ThumbShiftOp::Asr => arm_decode::ShiftOp::Asr,
    }
}

fn lower_move_shifted(emitter: &mut Emitter<'_>, op: ThumbShiftOp, amount: u8, rs: u8, rd: u8) -> LowerOutcome {
    let rm_value = emitter.load_gpr(GprArg::new(Gpr(rs))).into();
    let shifted = crate::shifter::barrel_shift(
        emitter,
        to_shift_op(op),
        arm_decode::ShiftAmount::Immediate(amount),
        rm_value,
        None,
        true,
    );
    let dst = emitter.mov(shifted, true);
    emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
    LowerOutcome { cycles: 1, terminator: None }
}

fn lower_add_subtract_register(emitter: &mut Emitter<'_>, subtract: bool, rn: u8, rs: u8, rd: u8) -> LowerOutcome {
    let lhs = emitter.load_gpr(GprArg::new(Gpr(rs)));
    let rhs = emitter.load_gpr(GprArg::new(Gpr(rn)));
    let dst = emitter.new_variable();
    if subtract {
        emitter.sub(Some(dst), lhs, rhs, true);
    } else {
        emitter.add(Some(dst), lhs, rhs, true);
    }
    emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
    LowerOutcome { cycles: 1, terminator: None }
}

fn lower_add_subtract_immediate(emitter: &mut Emitter<'_>, subtract: bool, imm3: u8, rs: u8, rd: u8) -> LowerOutcome {
    let lhs = emitter.load_gpr(GprArg::new(Gpr(rs)));
    let dst = emitter.new_variable();
    if subtract {
        emitter.sub(Some(dst), lhs, imm3 as u32, true);
    } else {
        emitter.add(Some(dst), lhs, imm3 as u32, true);
    }
    emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
    LowerOutcome { cycles: 1, terminator: None }
}

fn lower_mov_cmp_add_sub_immediate(emitter: &mut Emitter<'_>, op: DpOp, rd: u8, imm8: u8) -> LowerOutcome {
    match op {
        DpOp::Mov => {
            let dst = emitter.mov(imm8 as u32, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        DpOp::Cmp => {
            let lhs = emitter.load_gpr(GprArg::new(Gpr(rd)));
            emitter.sub(None, lhs, imm8 as u32, true);
        }
        DpOp::Add => {
            let lhs = emitter.load_gpr(GprArg::new(Gpr(rd)));
            let dst = emitter.new_variable();
            emitter.add(Some(dst), lhs, imm8 as u32, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        DpOp::Sub => {
            let lhs = emitter.load_gpr(GprArg::new(Gpr(rd)));
            let dst = emitter.new_variable();
            emitter.sub(Some(dst), lhs, imm8 as u32, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        _ => unreachable!("decoder only produces Mov/Cmp/Add/Sub for this format"),
    }
    LowerOutcome { cycles: 1, terminator: None }
}

fn lower_alu_operation(emitter: &mut Emitter<'_>, op: AluOp, rs: u8, rd: u8) -> LowerOutcome {
    let rd_val = emitter.load_gpr(GprArg::new(Gpr(rd)));
    let rs_val = emitter.load_gpr(GprArg::new(Gpr(rs)));
    match op {
        AluOp::And => {
            let dst = emitter.new_variable();
            emitter.and(Some(dst), rd_val, rs_val, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        AluOp::Eor => {
            let dst = emitter.new_variable();
            emitter.eor(Some(dst), rd_val, rs_val, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        AluOp::Lsl => {
            let amount = mask_shift_amount(emitter, rs_val);
            let dst = emitter.lsl(rd_val, amount, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        AluOp::Lsr => {
            let amount = mask_shift_amount(emitter, rs_val);
            let dst = emitter.lsr(rd_val, amount, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        AluOp::Asr => {
            let amount = mask_shift_amount(emitter, rs_val);
            let dst = emitter.asr(rd_val, amount, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        AluOp::Ror => {
            let amount = mask_shift_amount(emitter, rs_val);
            let dst = emitter.ror(rd_val, amount, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        AluOp::Adc => {
            let dst = emitter.adc(rd_val, rs_val, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        AluOp::Sbc => {
            let dst = emitter.sbc(rd_val, rs_val, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        AluOp::Tst => {
            emitter.and(None, rd_val, rs_val, true);
        }
        AluOp::Neg => {
            let dst = emitter.rsb(rs_val, 0u32, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        AluOp::Cmp => {
            emitter.sub(None, rd_val, rs_val, true);
        }
        AluOp::Cmn => {
            emitter.add(None, rd_val, rs_val, true);
        }
        AluOp::Orr => {
            let dst = emitter.orr(rd_val, rs_val, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        AluOp::Mul => {
            let (lo, _) = emitter.multiply(false, rd_val, rs_val, false, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), lo);
        }
        AluOp::Bic => {
            let dst = emitter.bic(rd_val, rs_val, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
        AluOp::Mvn => {
            let dst = emitter.mvn(rs_val, true);
            emitter.store_gpr(GprArg::new(Gpr(rd)), dst);
        }
    }
    LowerOutcome { cycles: 1, terminator: None }
}

fn mask_shift_amount(emitter: &mut Emitter<'_>, amount: arm_ir::Variable) -> VarOrImm {
    let dst = emitter.new_variable();
    emitter.and(Some(dst), amount, 0xFFu32, false);
    dst.into()
}

fn lower_hi_register_op(emitter: &mut Emitter<'_>, op: HiOp, rs: u8, rd: u8, tracked_pc: u32) -> LowerOutcome {
    let rd_val = gpr_or_pc(emitter, rd, tracked_pc);
    let rs_val = gpr_or_pc(emitter, rs, tracked_pc);
    match op {
        HiOp::Cmp => {
            emitter.sub(None, rd_val, rs_val, true);
            LowerOutcome { cycles: 1, terminator: None }
        }
        HiOp::Add => {
            let dst = emitter.new_variable();
            emitter.add(Some(dst), rd_val, rs_val, false);
            store_result_or_branch(emitter, rd, dst)
        }
        HiOp::Mov => {
            let dst = emitter.mov(rs_val, false);
            store_result_or_branch(emitter, rd, dst)
        }
    }
}

fn store_result_or_branch(emitter: &mut Emitter<'_>, rd: u8, value: arm_ir::Variable) -> LowerOutcome {
    if rd == 15 {
        emitter.store_gpr(GprArg::new(Gpr::PC), value);
        LowerOutcome { cycles: 2, terminator: Some(Terminator::IndirectLink) }
    } else {
        emitter.store_gpr(GprArg::new(Gpr(rd)), value);
        LowerOutcome { cycles: 1, terminator: None }
    }
}

fn lower_branch_exchange(
    emitter: &mut Emitter<'_>,
    mode: ExchangeMode,
    rs: u8,
    tracked_pc: u32,
    config: &TranslateConfig,
) -> LowerOutcome {
    if mode == ExchangeMode::BranchLink && !config.architecture.is_v5te() {
        return lower_undefined(emitter, tracked_pc);
    }
    if mode == ExchangeMode::BranchLink {
        let return_pc = (tracked_pc.wrapping_sub(THUMB_INSTRUCTION_SIZE)) | 1;
        emitter.store_gpr(GprArg::new(Gpr::LR), return_pc);
    }
    let address = gpr_or_pc(emitter, rs, tracked_pc);
    let src_cpsr = emitter.load_cpsr();
    let (dst_pc, dst_cpsr) = emitter.branch_exchange(src_cpsr, address, ExchangeSource::Instruction);
    emitter.store_gpr(GprArg::new(Gpr::PC), dst_pc);
    emitter.store_cpsr(dst_cpsr);
    LowerOutcome { cycles: 3, terminator: Some(Terminator::IndirectLink) }
}

fn lower_pc_relative_load(emitter: &mut Emitter<'_>, rd: u8, imm8: u8, tracked_pc: u32) -> LowerOutcome {
    let base = tracked_pc & !0b11;
    let address = base.wrapping_add((imm8 as u32) * 4);
    let loaded = emitter.mem_read(MemAccessMode::Unaligned, MemAccessSize::Word, address);
    emitter.store_gpr(GprArg::new(Gpr(rd)), loaded);
    LowerOutcome { cycles: 2, terminator: None }
}

fn lower_load_store_register_offset(
    emitter: &mut Emitter<'_>,
    load: bool,
    byte: bool,
    ro: u8,
    rb: u8,
    rd: u8,
) -> LowerOutcome {
    let base = emitter.load_gpr(GprArg::new(Gpr(rb)));
    let offset = emitter.load_gpr(GprArg::new(Gpr(ro)));
    let address = value_add(emitter, base, offset);
    if load {
        let (mode, size) = if byte { (MemAccessMode::Raw, MemAccessSize::Byte) } else { (MemAccessMode::Unaligned, MemAccessSize::Word) };
        let loaded = emitter.mem_read(mode, size, address);
        emitter.store_gpr(GprArg::new(Gpr(rd)), loaded);
    } else {
        let value = emitter.load_gpr(GprArg::new(Gpr(rd)));
        let size = if byte { MemAccessSize::Byte } else { MemAccessSize::Word };
        emitter.mem_write(size, value, address);
    }
    LowerOutcome { cycles: if load { 2 } else { 1 }, terminator: None }
}

fn lower_load_store_sign_extended(
    emitter: &mut Emitter<'_>,
    h: bool,
    sign_extend: bool,
    ro: u8,
    rb: u8,
    rd: u8,
) -> LowerOutcome {
    let base = emitter.load_gpr(GprArg::new(Gpr(rb)));
    let offset = emitter.load_gpr(GprArg::new(Gpr(ro)));
    let address = value_add(emitter, base, offset);
    match (h, sign_extend) {
        (false, false) => {
            let value = emitter.load_gpr(GprArg::new(Gpr(rd)));
            emitter.mem_write(MemAccessSize::Half, value, address);
            LowerOutcome { cycles: 1, terminator: None }
        }
        (true, false) => {
            let loaded = emitter.mem_read(MemAccessMode::Raw, MemAccessSize::Half, address);
            emitter.store_gpr(GprArg::new(Gpr(rd)), loaded);
            LowerOutcome { cycles: 2, terminator: None }
        }
        (false, true) => {
            let loaded = emitter.mem_read(MemAccessMode::Signed, MemAccessSize::Byte, address);
            emitter.store_gpr(GprArg::new(Gpr(rd)), loaded);
            LowerOutcome { cycles: 2, terminator: None }
        }
        (true, true) => {
            let loaded = emitter.mem_read(MemAccessMode::Signed, MemAccessSize::Half, address);
            emitter.store_gpr(GprArg::new(Gpr(rd)), loaded);
            LowerOutcome { cycles: 2, terminator: None }
        }
    }
}

fn lower_load_store_immediate_offset(
    emitter: &mut Emitter<'_>,
    load: bool,
    byte: bool,
    imm5: u8,
    rb: u8,
    rd: u8,
) -> LowerOutcome {
    let base = emitter.load_gpr(GprArg::new(Gpr(rb)));
    let offset = if byte { imm5 as u32 } else { (imm5 as u32) * 4 };
    let address = value_add(emitter, base, offset);
    if load {
        let (mode, size) = if byte { (MemAccessMode::Raw, MemAccessSize::Byte) } else { (MemAccessMode::Unaligned, MemAccessSize::Word) };
        let loaded = emitter.mem_read(mode, size, address);
        emitter.store_gpr(GprArg::new(Gpr(rd)), loaded);
    } else {
        let value = emitter.load_gpr(GprArg::new(Gpr(rd)));
        let size = if byte { MemAccessSize::Byte } else { MemAccessSize::Word };
        emitter.mem_write(size, value, address);
    }
    LowerOutcome { cycles: if load { 2 } else { 1 }, terminator: None }
}

fn lower_load_store_halfword(emitter: &mut Emitter<'_>, load: bool, imm5: u8, rb: u8, rd: u8) -> LowerOutcome {
    let base = emitter.load_gpr(GprArg::new(Gpr(rb)));
    let address = value_add(emitter, base, (imm5 as u32) * 2);
    if load {
        let loaded = emitter.mem_read(MemAccessMode::Raw, MemAccessSize::Half, address);
        emitter.store_gpr(GprArg::new(Gpr(rd)), loaded);
    } else {
        let value = emitter.load_gpr(GprArg::new(Gpr(rd)));
        emitter.mem_write(MemAccessSize::Half, value, address);
    }
    LowerOutcome { cycles: if load { 2 } else { 1 }, terminator: None }
}

fn lower_sp_relative_load_store(emitter: &mut Emitter<'_>, load: bool, rd: u8, imm8: u8) -> LowerOutcome {
    let base = emitter.load_gpr(GprArg::new(Gpr::SP));
    let address = value_add(emitter, base, (imm8 as u32) * 4);
    if load {
        let loaded = emitter.mem_read(MemAccessMode::Unaligned, MemAccessSize::Word, address);
        emitter.store_gpr(GprArg::new(Gpr(rd)), loaded);
    } else {
        let value = emitter.load_gpr(GprArg::new(Gpr(rd)));
        emitter.mem_write(MemAccessSize::Word, value, address);
    }
    LowerOutcome { cycles: if load { 2 } else { 1 }, terminator: None }
}

fn lower_load_address(emitter: &mut Emitter<'_>, sp: bool, rd: u8, imm8: u8, tracked_pc: u32) -> LowerOutcome {
    let offset = (imm8 as u32) * 4;
    let value = if sp {
        let base = emitter.load_gpr(GprArg::new(Gpr::SP));
        value_add(emitter, base, offset)
    } else {
        ((tracked_pc & !0b11).wrapping_add(offset)).into()
    };
    emitter.store_gpr(GprArg::new(Gpr(rd)), value);
    LowerOutcome { cycles: 1, terminator: None }
}

fn lower_add_offset_to_sp(emitter: &mut Emitter<'_>, negative: bool, imm7: u8) -> LowerOutcome {
    let base = emitter.load_gpr(GprArg::new(Gpr::SP));
    let offset = (imm7 as u32) * 4;
    let new_sp = if negative { value_sub(emitter, base, offset) } else { value_add(emitter, base, offset) };
    emitter.store_gpr(GprArg::new(Gpr::SP), new_sp);
    LowerOutcome { cycles: 1, terminator: None }
}

fn lower_push_pop(
    emitter: &mut Emitter<'_>,
    store: bool,
    include_pc_lr: bool,
    register_list: u8,
    architecture: Architecture,
) -> LowerOutcome {
    let mut regs: smallvec::SmallVec<[Gpr; 9]> = smallvec::SmallVec::new();
    for reg in 0u8..8 {
        if register_list & (1 << reg) != 0 {
            regs.push(Gpr(reg));
        }
    }
    let n = regs.len() as u32 + include_pc_lr as u32;
    let base = emitter.load_gpr(GprArg::new(Gpr::SP));

    if store {
        // PUSH: STMDB SP!, {reglist [, LR]}
        if include_pc_lr {
            regs.push(Gpr::LR);
        }
        let new_sp = value_sub(emitter, base, 4 * n);
        for (idx, reg) in regs.iter().enumerate() {
            let addr = value_add(emitter, new_sp, 4 * idx as u32);
            let value = emitter.load_gpr(GprArg::new(*reg));
            emitter.mem_write(MemAccessSize::Word, value, addr);
        }
        emitter.store_gpr(GprArg::new(Gpr::SP), new_sp);
        LowerOutcome { cycles: n + 1, terminator: None }
    } else {
        // POP: LDMIA SP!, {reglist [, PC]}
        let new_sp = value_add(emitter, base, 4 * n);
        emitter.store_gpr(GprArg::new(Gpr::SP), new_sp);
        for (idx, reg) in regs.iter().enumerate() {
            let addr = value_add(emitter, base, 4 * idx as u32);
            let loaded = emitter.mem_read(MemAccessMode::Raw, MemAccessSize::Word, addr);
            emitter.store_gpr(GprArg::new(*reg), loaded);
        }
        if include_pc_lr {
            let addr = value_add(emitter, base, 4 * regs.len() as u32);
            let loaded = emitter.mem_read(MemAccessMode::Raw, MemAccessSize::Word, addr);
            if architecture.is_v5te() {
                let src_cpsr = emitter.load_cpsr();
                let (dst_pc, dst_cpsr) = emitter.branch_exchange(src_cpsr, loaded, ExchangeSource::MemoryLoad);
                emitter.store_gpr(GprArg::new(Gpr::PC), dst_pc);
                emitter.store_cpsr(dst_cpsr);
            } else {
                emitter.store_gpr(GprArg::new(Gpr::PC), loaded);
            }
            LowerOutcome { cycles: n + 1, terminator: Some(Terminator::IndirectLink) }
        } else {
            LowerOutcome { cycles: n + 1, terminator: None }
        }
    }
}

fn lower_multiple_load_store(emitter: &mut Emitter<'_>, load: bool, rb: u8, register_list: u8) -> LowerOutcome {
    let base = emitter.load_gpr(GprArg::new(Gpr(rb)));
    let n = register_list.count_ones();
    let new_base = value_add(emitter, base, 4 * n);

    if load {
        emitter.store_gpr(GprArg::new(Gpr(rb)), new_base);
        let mut idx = 0u32;
        for reg in 0u8..8 {
            if register_list & (1 << reg) == 0 {
                continue;
            }
            let addr = value_add(emitter, base, 4 * idx);
            idx += 1;
            let loaded = emitter.mem_read(MemAccessMode::Raw, MemAccessSize::Word, addr);
            emitter.store_gpr(GprArg::new(Gpr(reg)), loaded);
        }
    } else {
        let mut idx = 0u32;
        for reg in 0u8..8 {
            if register_list & (1 << reg) == 0 {
                continue;
            }
            let addr = value_add(emitter, base, 4 * idx);
            idx += 1;
            let value = emitter.load_gpr(GprArg::new(Gpr(reg)));
            emitter.mem_write(MemAccessSize::Word, value, addr);
        }
        emitter.store_gpr(GprArg::new(Gpr(rb)), new_base);
    }
    LowerOutcome { cycles: n + 1, terminator: None }
}

fn lower_conditional_branch(emitter: &mut Emitter<'_>, offset: i32, tracked_pc: u32, loc: LocationRef) -> LowerOutcome {
    let target = branch_target(tracked_pc, offset);
    let src_cpsr = emitter.load_cpsr();
    let dst_pc = emitter.branch(src_cpsr, target);
    emitter.store_gpr(GprArg::new(Gpr::PC), dst_pc);
    let target_loc = LocationRef::new(target, loc.mode(), true);
    LowerOutcome { cycles: 3, terminator: Some(Terminator::DirectLink(target_loc)) }
}

fn lower_software_interrupt(emitter: &mut Emitter<'_>, tracked_pc: u32) -> LowerOutcome {
    let return_pc = tracked_pc.wrapping_sub(THUMB_INSTRUCTION_SIZE);
    emit_exception_entry(emitter, vector::SOFTWARE_INTERRUPT, return_pc);
    LowerOutcome { cycles: 3, terminator: Some(Terminator::ReturnToDispatcher) }
}

fn lower_unconditional_branch(emitter: &mut Emitter<'_>, offset: i32, tracked_pc: u32, loc: LocationRef) -> LowerOutcome {
    let target = branch_target(tracked_pc, offset);
    let src_cpsr = emitter.load_cpsr();
    let dst_pc = emitter.branch(src_cpsr, target);
    emitter.store_gpr(GprArg::new(Gpr::PC), dst_pc);
    let target_loc = LocationRef::new(target, loc.mode(), true);
    LowerOutcome { cycles: 3, terminator: Some(Terminator::DirectLink(target_loc)) }
}

/// The prefix half only updates the translator's own intermediate LR
/// tracking; it does not touch guest state. This mirrors the common
/// recompiler simplification of treating the pair as one logical
/// instruction rather than exposing the architectural intermediate LR
/// write — see DESIGN.md.
fn lower_bl_prefix(tracked_pc: u32, offset_hi: i32, bl_prefix_lr: &mut Option<u32>) -> LowerOutcome {
    *bl_prefix_lr = Some(tracked_pc.wrapping_add(offset_hi as u32));
    LowerOutcome { cycles: 1, terminator: None }
}

fn lower_bl_suffix(
    emitter: &mut Emitter<'_>,
    offset_lo: u32,
    exchange: bool,
    tracked_pc: u32,
    loc: LocationRef,
    architecture: Architecture,
    bl_prefix_lr: &mut Option<u32>,
) -> LowerOutcome {
    let exchange = exchange && architecture.is_v5te();
    let base = bl_prefix_lr.take().unwrap_or(tracked_pc);
    let target = base.wrapping_add(offset_lo);
    let return_pc = tracked_pc.wrapping_sub(THUMB_INSTRUCTION_SIZE) | 1;
    emitter.store_gpr(GprArg::new(Gpr::LR), return_pc);

    if exchange {
        let address = target & !0b11;
        let src_cpsr = emitter.load_cpsr();
        let (dst_pc, dst_cpsr) = emitter.branch_exchange(src_cpsr, address, ExchangeSource::Instruction);
        emitter.store_gpr(GprArg::new(Gpr::PC), dst_pc);
        emitter.store_cpsr(dst_cpsr);
        LowerOutcome { cycles: 3, terminator: Some(Terminator::IndirectLink) }
    } else {
        let src_cpsr = emitter.load_cpsr();
        let dst_pc = emitter.branch(src_cpsr, target);
        emitter.store_gpr(GprArg::new(Gpr::PC), dst_pc);
        let target_loc = LocationRef::new(target, loc.mode(), true);
        LowerOutcome { cycles: 3, terminator: Some(Terminator::DirectLink(target_loc)) }
    }
}

fn lower_undefined(emitter: &mut Emitter<'_>, tracked_pc: u32) -> LowerOutcome {
    let return_pc = tracked_pc.wrapping_sub(THUMB_INSTRUCTION_SIZE);
    emit_exception_entry(emitter, vector::UNDEFINED, return_pc);
    LowerOutcome { cycles: 3, terminator: Some(Terminator::ReturnToDispatcher) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm_ir::{BasicBlock, Op};
    use arm_state::{Condition, Mode};

    fn config(architecture: Architecture) -> TranslateConfig {
        TranslateConfig { architecture, cp15_present: true, max_block_size: 32 }
    }

    fn new_block() -> BasicBlock {
        BasicBlock::new(LocationRef::new(0x1000, Mode::Supervisor, true), Condition::Al)
    }

    #[test]
    fn mov_immediate_sets_flags_and_stores_gpr() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        lower_mov_cmp_add_sub_immediate(&mut emitter, DpOp::Mov, 0, 0x55);
        assert!(block.iter().any(|(_, op)| matches!(op, Op::Mov { set_flags: true, .. })));
        assert!(block.iter().any(|(_, op)| matches!(op, Op::StoreGpr { dst, .. } if dst.gpr == Gpr(0))));
    }

    #[test]
    fn hi_register_mov_to_pc_terminates_with_indirect_link() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        let outcome = lower_hi_register_op(&mut emitter, HiOp::Mov, 1, 15, 0x1004);
        assert_eq!(outcome.terminator, Some(Terminator::IndirectLink));
    }

    #[test]
    fn push_with_lr_writes_nine_words_for_full_list() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        let outcome = lower_push_pop(&mut emitter, true, true, 0xFF, Architecture::Armv5TE);
        assert_eq!(outcome.cycles, 9);
        let writes = block.iter().filter(|(_, op)| matches!(op, Op::MemWrite { .. })).count();
        assert_eq!(writes, 9);
    }

    #[test]
    fn pop_with_pc_terminates_with_indirect_link() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        let outcome = lower_push_pop(&mut emitter, false, true, 0x01, Architecture::Armv5TE);
        assert_eq!(outcome.terminator, Some(Terminator::IndirectLink));
    }

    #[test]
    fn bl_prefix_then_suffix_computes_combined_target() {
        let mut block = new_block();
        let mut bl_prefix_lr = None;
        // Prefix: offset_hi already shifted by <<12 per the decoder.
        let prefix_outcome = lower_bl_prefix(0x1004, 0x1000, &mut bl_prefix_lr);
        assert_eq!(prefix_outcome.terminator, None);
        assert_eq!(bl_prefix_lr, Some(0x1004 + 0x1000));

        let mut emitter = Emitter::new(&mut block);
        let outcome = lower_bl_suffix(
            &mut emitter,
            4,
            false,
            0x1006,
            block.location,
            Architecture::Armv5TE,
            &mut bl_prefix_lr,
        );
        match outcome.terminator {
            Some(Terminator::DirectLink(loc)) => assert_eq!(loc.pc(), 0x1004 + 0x1000 + 4),
            other => panic!("unexpected terminator: {other:?}"),
        }
        assert_eq!(bl_prefix_lr, None);
    }

    #[test]
    fn conditional_branch_has_direct_link_terminator() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        let outcome = lower_conditional_branch(&mut emitter, 4, 0x1004, block.location);
        assert!(matches!(outcome.terminator, Some(Terminator::DirectLink(_))));
    }

    #[test]
    fn undefined_thumb_opcode_returns_to_dispatcher() {
        let mut block = new_block();
        let mut emitter = Emitter::new(&mut block);
        let outcome = lower_undefined(&mut emitter, 0x1004);
        assert_eq!(outcome.terminator, Some(Terminator::ReturnToDispatcher));
    }
}
