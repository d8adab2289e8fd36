//! The intermediate representation translated basic blocks are built from:
//! a tagged-union `Op` type, an index-linked `BasicBlock` that owns a
//! sequence of them, and an `Emitter` that appends ops and hands out fresh
//! SSA variables.
//!
//! Ops carry no prev/next pointers themselves (see `block::OpRef`'s doc
//! comment) — the block's internal arena tracks links by stable index,
//! which lets the optimizer unlink dead ops without invalidating anything
//! another pass is holding onto.

pub mod args;
pub mod block;
pub mod emitter;
pub mod op;
pub mod variable;

pub use args::{ExchangeSource, GprArg, MemAccessMode, MemAccessSize, SpsrArg};
pub use block::{BasicBlock, OpRef, Terminator};
pub use emitter::Emitter;
pub use op::{flag_mask_to_psr_bits, Op, FLAG_C, FLAG_N, FLAG_V, FLAG_Z};
pub use variable::{VarOrImm, Variable};
