//! Lowers decoded ARM/Thumb instructions into IR basic blocks (§4.1).
//!
//! `translate_block` is the only entry point the host backend needs: given
//! a [`Memory`](arm_state::Memory) source and a starting [`LocationRef`],
//! it fetches, decodes, and lowers one instruction at a time until the
//! block ends (unconditional control flow, a condition-code change, or
//! `max_block_size`), returning the finished [`BasicBlock`](arm_ir::BasicBlock)
//! for the optimizer to run over.

mod arm_lower;
pub mod exception;
mod pipeline;
mod shifter;
mod thumb_lower;
mod translator;

pub use exception::{apply_exception_entry, ARM_PIPELINE_OFFSET};
pub use translator::{branch_target, translate_block, Architecture, TranslateConfig};
