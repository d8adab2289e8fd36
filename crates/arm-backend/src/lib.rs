//! Block cache, patch lists, generation map, and the two host backends
//! (§4.4): an always-available interpreter and an optional Cranelift-based
//! native backend behind the `native-backend` feature.
//!
//! `Backend` is the seam: both implementations compile an optimized
//! [`arm_ir::BasicBlock`] into *something callable* and drive guest
//! execution for a cycle budget, sharing the cache/patch/generation
//! machinery in this crate. A caller only needs `dyn Backend` (or, for the
//! interpreter's hot path, the concrete type) plus a [`Memory`] and an
//! optional [`Coprocessor`].

pub mod cache;
pub mod generation;
pub mod interpreter;
pub mod patch;

#[cfg(feature = "native-backend")]
pub mod native;

use arm_cp15::Coprocessor;
use arm_optimize::PassConfig;
use arm_state::{LocationRef, Memory};
use arm_translate::TranslateConfig;

pub use cache::BlockCache;
pub use generation::GenerationMap;
pub use interpreter::InterpreterBackend;
pub use patch::PatchLists;

#[cfg(feature = "native-backend")]
pub use native::NativeBackend;

/// Everything a backend needs to translate and optimize a block, shared by
/// every implementation (§6's `translator.*`/`optimizer.*`/`compiler.*`
/// options).
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub translate: TranslateConfig,
    pub optimize: PassConfig,
    /// `compiler.initial_code_buffer_size` (§6). Ignored by the interpreter,
    /// which has no code buffer to size.
    pub initial_code_buffer_size: usize,
    /// `compiler.maximum_code_buffer_size` (§6).
    pub maximum_code_buffer_size: usize,
    /// `compiler.enable_block_linking` (§6). When false, every block
    /// returns to the dispatcher instead of being direct-linked.
    pub enable_block_linking: bool,
    /// Guest-address bits covered by one generation-map page (§9: "page
    /// granularity is a tunable knob"). Default 12 (4 KiB pages).
    pub generation_page_bits: u32,
}

impl Default for BackendConfig {
    fn default() -> BackendConfig {
        BackendConfig {
            translate: TranslateConfig {
                architecture: arm_translate::Architecture::Armv5TE,
                cp15_present: true,
                max_block_size: 32,
            },
            optimize: PassConfig::default(),
            initial_code_buffer_size: 1 << 20,
            maximum_code_buffer_size: 1 << 26,
            enable_block_linking: true,
            generation_page_bits: 12,
        }
    }
}

/// Internal failure modes a backend can hit while compiling or running a
/// block (§7: "code-buffer-exhausted ... the compiler catches this").
/// Never surfaced through `armjit`'s public API — every caller-visible
/// entry point absorbs these and retries or falls back.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("code buffer exhausted (limit {limit} bytes)")]
    CodeBufferExhausted { limit: usize },
    #[cfg(feature = "native-backend")]
    #[error("cranelift JIT module error: {0}")]
    JitModuleError(String),
}

/// The observable surface spec.md §4.4/§6 require of a host backend,
/// independent of whether blocks are interpreted or natively compiled
/// (§9: "any implementer must provide at least the interpreter backend;
/// a native backend ... must preserve identical guest-observable
/// behavior").
pub trait Backend<M: Memory> {
    /// Runs the guest for approximately `max_cycles`, compiling blocks on
    /// miss, and returns the number of cycles actually consumed (§6's
    /// `run`: "may overshoot by at most one block").
    fn call(
        &mut self,
        state: &mut arm_state::ArmState,
        mem: &mut M,
        cp: Option<&mut dyn Coprocessor>,
        max_cycles: u64,
    ) -> u64;

    /// Drops any compiled code and patch-list entries for `location`,
    /// reverting its applied patches to the dispatcher fallback (§4.4).
    fn invalidate(&mut self, location: LocationRef);

    /// Drops every cached block whose PC falls in `start..=end`, across
    /// every mode/thumb-bit combination (§4.4's `invalidate(start..end)`).
    fn invalidate_range(&mut self, start: u32, end: u32);

    fn invalidate_all(&mut self);

    /// Bumps the generation counter for every page touched by a guest
    /// write to `start..=end`, so the next entry to a block that observed
    /// the old generation self-invalidates (§4.4, §8 Scenario C).
    fn report_memory_write(&mut self, start: u32, end: u32);
}
