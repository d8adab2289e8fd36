//! 16-bit Thumb instruction decoder (ARMv4T baseline, plus the ARMv5TE
//! `BLX Rm` hi-register-operations encoding).

use crate::arm::{DpOp, ExchangeMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbShiftOp {
    Lsl,
    Lsr,
    Asr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    And,
    Eor,
    Lsl,
    Lsr,
    Asr,
    Adc,
    Sbc,
    Ror,
    Tst,
    Neg,
    Cmp,
    Cmn,
    Orr,
    Mul,
    Bic,
    Mvn,
}

impl AluOp {
    fn from_bits(bits: u16) -> AluOp {
        match bits & 0xF {
            0x0 => AluOp::And,
            0x1 => AluOp::Eor,
            0x2 => AluOp::Lsl,
            0x3 => AluOp::Lsr,
            0x4 => AluOp::Asr,
            0x5 => AluOp::Adc,
            0x6 => AluOp::Sbc,
            0x7 => AluOp::Ror,
            0x8 => AluOp::Tst,
            0x9 => AluOp::Neg,
            0xA => AluOp::Cmp,
            0xB => AluOp::Cmn,
            0xC => AluOp::Orr,
            0xD => AluOp::Mul,
            0xE => AluOp::Bic,
            _ => AluOp::Mvn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiOp {
    Add,
    Cmp,
    Mov,
}

/// A decoded 16-bit Thumb instruction. `LongBranchWithLinkPrefix`/`Suffix`
/// correspond to the two halves of a `BL`/`BLX` pair (§4.1's "BL/BLX
/// prefix-suffix instruction splicing") — the translator keeps the prefix's
/// intermediate LR value across the two-instruction sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ThumbInstr {
    MoveShifted { op: ThumbShiftOp, amount: u8, rs: u8, rd: u8 },
    AddSubtractRegister { subtract: bool, rn: u8, rs: u8, rd: u8 },
    AddSubtractImmediate { subtract: bool, imm3: u8, rs: u8, rd: u8 },
    MovCmpAddSubImmediate { op: DpOp, rd: u8, imm8: u8 },
    AluOperation { op: AluOp, rs: u8, rd: u8 },
    HiRegisterOp { op: HiOp, rs: u8, rd: u8 },
    BranchExchange { mode: ExchangeMode, rs: u8 },
    PcRelativeLoad { rd: u8, imm8: u8 },
    LoadStoreRegisterOffset { load: bool, byte: bool, ro: u8, rb: u8, rd: u8 },
    LoadStoreSignExtended { h: bool, sign_extend: bool, ro: u8, rb: u8, rd: u8 },
    LoadStoreImmediateOffset { load: bool, byte: bool, imm5: u8, rb: u8, rd: u8 },
    LoadStoreHalfword { load: bool, imm5: u8, rb: u8, rd: u8 },
    SpRelativeLoadStore { load: bool, rd: u8, imm8: u8 },
    LoadAddress { sp: bool, rd: u8, imm8: u8 },
    AddOffsetToSp { negative: bool, imm7: u8 },
    PushPop { store: bool, include_pc_lr: bool, register_list: u8 },
    MultipleLoadStore { load: bool, rb: u8, register_list: u8 },
    ConditionalBranch { cond_bits: u8, offset: i32 },
    SoftwareInterrupt { comment: u8 },
    UnconditionalBranch { offset: i32 },
    LongBranchWithLinkPrefix { offset_hi: i32 },
    LongBranchWithLinkSuffix { offset_lo: u32, exchange: bool },
    Undefined,
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Decodes one 16-bit Thumb opcode.
pub fn decode_thumb(opcode: u16) -> ThumbInstr {
    let rd = (opcode & 0x7) as u8;
    let rs = ((opcode >> 3) & 0x7) as u8;

    match opcode >> 13 {
        0b000 => {
            if (opcode >> 11) & 0b11 == 0b11 {
                let subtract = (opcode >> 9) & 1 != 0;
                let immediate = (opcode >> 10) & 1 != 0;
                let rn_or_imm = ((opcode >> 6) & 0x7) as u8;
                if immediate {
                    ThumbInstr::AddSubtractImmediate { subtract, imm3: rn_or_imm, rs, rd }
                } else {
                    ThumbInstr::AddSubtractRegister { subtract, rn: rn_or_imm, rs, rd }
                }
            } else {
                let op = match (opcode >> 11) & 0b11 {
                    0b00 => ThumbShiftOp::Lsl,
                    0b01 => ThumbShiftOp::Lsr,
                    _ => ThumbShiftOp::Asr,
                };
                let amount = ((opcode >> 6) & 0x1F) as u8;
                ThumbInstr::MoveShifted { op, amount, rs, rd }
            }
        }
        0b001 => {
            let op = match (opcode >> 11) & 0b11 {
                0b00 => DpOp::Mov,
                0b01 => DpOp::Cmp,
                0b10 => DpOp::Add,
                _ => DpOp::Sub,
            };
            let rd = ((opcode >> 8) & 0x7) as u8;
            ThumbInstr::MovCmpAddSubImmediate { op, rd, imm8: (opcode & 0xFF) as u8 }
        }
        0b010 => decode_format_010(opcode, rs, rd),
        0b011 => {
            let load = (opcode >> 11) & 1 != 0;
            let byte = (opcode >> 12) & 1 != 0;
            let imm5 = ((opcode >> 6) & 0x1F) as u8;
            let rb = rs;
            ThumbInstr::LoadStoreImmediateOffset { load, byte, imm5, rb, rd }
        }
        0b100 => {
            if (opcode >> 12) & 1 != 0 {
                let load = (opcode >> 11) & 1 != 0;
                let rd = ((opcode >> 8) & 0x7) as u8;
                ThumbInstr::SpRelativeLoadStore { load, rd, imm8: (opcode & 0xFF) as u8 }
            } else {
                let load = (opcode >> 11) & 1 != 0;
                let imm5 = ((opcode >> 6) & 0x1F) as u8;
                ThumbInstr::LoadStoreHalfword { load, imm5, rb: rs, rd }
            }
        }
        0b101 => decode_format_101(opcode, rd),
        0b110 => decode_format_110(opcode, rd),
        _ => decode_format_111(opcode),
    }
}

fn decode_format_010(opcode: u16, rs: u8, rd: u8) -> ThumbInstr {
    if (opcode >> 10) & 0b111 == 0b000 {
        ThumbInstr::AluOperation { op: AluOp::from_bits(opcode >> 6), rs, rd }
    } else if (opcode >> 10) & 0b111 == 0b001 {
        let op = match (opcode >> 8) & 0b11 {
            0b00 => HiOp::Add,
            0b01 => HiOp::Cmp,
            _ => HiOp::Mov,
        };
        let h1 = (opcode >> 7) & 1 != 0;
        let h2 = (opcode >> 6) & 1 != 0;
        let rs_full = rs | if h2 { 0x8 } else { 0 };
        let rd_full = rd | if h1 { 0x8 } else { 0 };
        if (opcode >> 8) & 0b11 == 0b11 {
            let mode = if h1 { ExchangeMode::BranchLink } else { ExchangeMode::Branch };
            ThumbInstr::BranchExchange { mode, rs: rs_full }
        } else {
            ThumbInstr::HiRegisterOp { op, rs: rs_full, rd: rd_full }
        }
    } else {
        let rd = ((opcode >> 8) & 0x7) as u8;
        ThumbInstr::PcRelativeLoad { rd, imm8: (opcode & 0xFF) as u8 }
    }
}

fn decode_format_101(opcode: u16, rd: u8) -> ThumbInstr {
    // Shared top-level bits with 0b100's SP-load/halfword already peeled off
    // by the caller via `opcode >> 13`; here 101xxx covers load-address,
    // add-offset-to-sp, and push/pop.
    match (opcode >> 8) & 0b11111 {
        bits if bits & 0b10000 == 0 && bits & 0b01000 == 0 => {
            let sp = (opcode >> 11) & 1 != 0;
            let rd_full = ((opcode >> 8) & 0x7) as u8;
            ThumbInstr::LoadAddress { sp, rd: rd_full, imm8: (opcode & 0xFF) as u8 }
        }
        0b10000 => {
            let negative = (opcode >> 7) & 1 != 0;
            ThumbInstr::AddOffsetToSp { negative, imm7: (opcode & 0x7F) as u8 }
        }
        _ => {
            if (opcode >> 9) & 0b11 == 0b10 {
                let store = (opcode >> 11) & 1 == 0;
                let include_pc_lr = (opcode >> 8) & 1 != 0;
                ThumbInstr::PushPop { store, include_pc_lr, register_list: (opcode & 0xFF) as u8 }
            } else {
                ThumbInstr::LoadAddress { sp: false, rd, imm8: (opcode & 0xFF) as u8 }
            }
        }
    }
}

fn decode_format_110(opcode: u16, _rd: u8) -> ThumbInstr {
    if (opcode >> 12) & 1 != 0 {
        let cond_bits = ((opcode >> 8) & 0xF) as u8;
        if cond_bits == 0xF {
            return ThumbInstr::SoftwareInterrupt { comment: (opcode & 0xFF) as u8 };
        }
        let imm8 = (opcode & 0xFF) as u32;
        let offset = sign_extend(imm8, 8) << 1;
        ThumbInstr::ConditionalBranch { cond_bits, offset }
    } else {
        let load = (opcode >> 11) & 1 != 0;
        let rb = ((opcode >> 8) & 0x7) as u8;
        ThumbInstr::MultipleLoadStore { load, rb, register_list: (opcode & 0xFF) as u8 }
    }
}

fn decode_format_111(opcode: u16) -> ThumbInstr {
    match (opcode >> 11) & 0b11 {
        0b00 => {
            let imm11 = (opcode & 0x7FF) as u32;
            ThumbInstr::UnconditionalBranch { offset: sign_extend(imm11, 11) << 1 }
        }
        0b10 => {
            let imm11 = (opcode & 0x7FF) as u32;
            ThumbInstr::LongBranchWithLinkPrefix { offset_hi: sign_extend(imm11, 11) << 12 }
        }
        0b11 => {
            ThumbInstr::LongBranchWithLinkSuffix { offset_lo: ((opcode & 0x7FF) as u32) << 1, exchange: false }
        }
        _ => {
            // ARMv5TE BLX suffix: same bit pattern as 0b01 with bit 0 of the
            // resulting target forced to word alignment.
            ThumbInstr::LongBranchWithLinkSuffix { offset_lo: ((opcode & 0x7FF) as u32) << 1, exchange: true }
        }
    }
}
