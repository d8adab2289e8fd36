//! Instruction decoders for 32-bit ARM and 16-bit Thumb opcodes.
//!
//! Decoding is a pure function from opcode bits to a typed description —
//! no memory access, no side effects. `arm-translate` drives these decoders
//! and lowers their output into IR.

pub mod arm;
pub mod shift;
pub mod thumb;

pub use arm::{decode_arm, ArmInstr, CopTransfer, DpOp, ExchangeMode, HalfwordKind, HalfwordOffset, SatOp};
pub use shift::{Operand2, ShiftAmount, ShiftOp};
pub use thumb::{decode_thumb, AluOp, HiOp, ThumbInstr, ThumbShiftOp};
