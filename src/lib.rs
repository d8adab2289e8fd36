//! Public facade for the ARMv4T/ARMv5TE dynamic binary translator (§6).
//!
//! An embedder depends on this crate alone: `arm-state`/`arm-cp15`/
//! `arm-backend` are re-exported only as far as the public API needs
//! (`Memory`, `Coprocessor`, `ArmState`), and `Recompiler` wires a chosen
//! [`Backend`] to the guest state and an optional coprocessor behind the
//! `run`/`invalidate*`/`report_memory_write`/`get_arm_state` surface
//! spec.md §6 names.
//!
//! Mirrors `wdc65816::Cpu<M: Mem>`'s generic-over-bus shape: `Recompiler<M>`
//! is generic over the embedder's `Memory` implementation so the
//! interpreter's hot loop monomorphizes rather than going through a vtable.

use std::cell::Cell;
use std::marker::PhantomData;

use arm_backend::{Backend, BackendConfig, InterpreterBackend};
use arm_cp15::{AbsentCoprocessor, Coprocessor, SystemControl};
use arm_optimize::PassConfig;
use arm_state::{ArmState, LocationRef};
use arm_translate::{Architecture, TranslateConfig};

#[cfg(feature = "native-backend")]
use arm_backend::NativeBackend;

pub use arm_backend::BackendError;
pub use arm_cp15::CopRegister;
pub use arm_state::{Condition, ExecState, Gpr, Memory, Mode, Psr};

/// Which guest CPU the recompiler is modeling (§6): gates CP15/TCM
/// availability and the ARMv4T-vs-ARMv5TE instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CpuModel {
    /// ARMv4T, no system-control coprocessor.
    Arm7Tdmi,
    /// ARMv5TE with CP15 (TCM, cache geometry).
    Arm946ES,
}

impl CpuModel {
    fn architecture(self) -> Architecture {
        match self {
            CpuModel::Arm7Tdmi => Architecture::Armv4T,
            CpuModel::Arm946ES => Architecture::Armv5TE,
        }
    }

    fn has_cp15(self) -> bool {
        matches!(self, CpuModel::Arm946ES)
    }
}

/// All tunables spec.md §6 lists, grouped as the embedder configures them.
/// Derives `serde::Serialize`/`Deserialize` (behind the `serde` feature) so
/// an embedder may load it from its own config file format; `armjit` itself
/// never parses one, matching the teacher's config-parsing-is-an-
/// application-concern split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Options {
    pub cpu_model: CpuModel,
    /// `translator.max_block_size` (§6), default 32.
    pub max_block_size: u32,
    /// `optimizer.passes.*` (§6), all on by default.
    pub optimizer_passes: OptimizerPasses,
    /// `optimizer.max_iterations` (§6), default 20.
    pub optimizer_max_iterations: u32,
    /// `compiler.initial_code_buffer_size` (§6).
    pub initial_code_buffer_size: usize,
    /// `compiler.maximum_code_buffer_size` (§6).
    pub maximum_code_buffer_size: usize,
    /// `compiler.enable_block_linking` (§6), default true.
    pub enable_block_linking: bool,
    /// Page granularity (bits) of the self-modifying-code generation map
    /// (§9: "page granularity is a tunable knob").
    pub generation_page_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OptimizerPasses {
    pub constant_propagation: bool,
    pub dead_register_store: bool,
    pub dead_gpr_store: bool,
    pub dead_host_flag_store: bool,
    pub dead_flag_value_store: bool,
    pub dead_variable_store: bool,
    pub bitwise_coalescence: bool,
    pub arithmetic_coalescence: bool,
    pub host_flags_coalescence: bool,
}

impl Default for OptimizerPasses {
    fn default() -> OptimizerPasses {
        let PassConfig {
            constant_propagation,
            dead_register_store,
            dead_gpr_store,
            dead_host_flag_store,
            dead_flag_value_store,
            dead_variable_store,
            bitwise_coalescence,
            arithmetic_coalescence,
            host_flags_coalescence,
            max_iterations: _,
        } = PassConfig::default();
        OptimizerPasses {
            constant_propagation,
            dead_register_store,
            dead_gpr_store,
            dead_host_flag_store,
            dead_flag_value_store,
            dead_variable_store,
            bitwise_coalescence,
            arithmetic_coalescence,
            host_flags_coalescence,
        }
    }
}

impl Default for Options {
    fn default() -> Options {
        Options {
            cpu_model: CpuModel::Arm946ES,
            max_block_size: 32,
            optimizer_passes: OptimizerPasses::default(),
            optimizer_max_iterations: 20,
            initial_code_buffer_size: 1 << 20,
            maximum_code_buffer_size: 1 << 26,
            enable_block_linking: true,
            generation_page_bits: 12,
        }
    }
}

impl Options {
    fn backend_config(&self) -> BackendConfig {
        let passes = self.optimizer_passes;
        BackendConfig {
            translate: TranslateConfig {
                architecture: self.cpu_model.architecture(),
                cp15_present: self.cpu_model.has_cp15(),
                max_block_size: self.max_block_size,
            },
            optimize: PassConfig {
                constant_propagation: passes.constant_propagation,
                dead_register_store: passes.dead_register_store,
                dead_gpr_store: passes.dead_gpr_store,
                dead_host_flag_store: passes.dead_host_flag_store,
                dead_flag_value_store: passes.dead_flag_value_store,
                dead_variable_store: passes.dead_variable_store,
                bitwise_coalescence: passes.bitwise_coalescence,
                arithmetic_coalescence: passes.arithmetic_coalescence,
                host_flags_coalescence: passes.host_flags_coalescence,
                max_iterations: self.optimizer_max_iterations,
            },
            initial_code_buffer_size: self.initial_code_buffer_size,
            maximum_code_buffer_size: self.maximum_code_buffer_size,
            enable_block_linking: self.enable_block_linking,
            generation_page_bits: self.generation_page_bits,
        }
    }

    fn default_coprocessor(&self) -> Box<dyn Coprocessor> {
        if self.cpu_model.has_cp15() {
            Box::new(SystemControl::new())
        } else {
            Box::new(AbsentCoprocessor)
        }
    }
}

/// The embeddable recompiler core (§6's public API).
///
/// Not `Sync`: every entry point (`run`, `invalidate*`, `report_memory_write`,
/// accessors) must be called from one thread (§5). It *is* `Send`, so an
/// embedder may hand one instance to a worker thread wholesale. The
/// `PhantomData<Cell<()>>` marker is what suppresses the auto-derived
/// `Sync` impl; it carries no state of its own.
pub struct Recompiler<M: Memory> {
    state: ArmState,
    coprocessor: Box<dyn Coprocessor>,
    backend: Box<dyn Backend<M>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<M: Memory> Recompiler<M> {
    pub fn new(options: Options) -> Recompiler<M> {
        let coprocessor = options.default_coprocessor();
        let backend: Box<dyn Backend<M>> = Box::new(InterpreterBackend::new(options.backend_config()));
        Recompiler { state: ArmState::new(), coprocessor, backend, _not_sync: PhantomData }
    }

    /// Same as [`Recompiler::new`] but with a caller-supplied coprocessor
    /// (e.g. a test double, or a CP15 model with non-default TCM geometry).
    pub fn with_coprocessor(options: Options, coprocessor: Box<dyn Coprocessor>) -> Recompiler<M> {
        let backend: Box<dyn Backend<M>> = Box::new(InterpreterBackend::new(options.backend_config()));
        Recompiler { state: ArmState::new(), coprocessor, backend, _not_sync: PhantomData }
    }

    /// Runs for approximately `max_cycles` (§6: "may overshoot by at most
    /// one block"), compiling blocks on cache miss and returning the
    /// number of cycles actually consumed.
    pub fn run(&mut self, mem: &mut M, max_cycles: u64) -> u64 {
        self.backend.call(&mut self.state, mem, Some(self.coprocessor.as_mut()), max_cycles)
    }

    pub fn invalidate(&mut self, pc: u32, mode: Mode, thumb: bool) {
        self.backend.invalidate(LocationRef::new(pc, mode, thumb));
    }

    pub fn invalidate_range(&mut self, start: u32, end: u32) {
        self.backend.invalidate_range(start, end);
    }

    pub fn invalidate_all(&mut self) {
        self.backend.invalidate_all();
    }

    pub fn report_memory_write(&mut self, start: u32, end: u32) {
        self.backend.report_memory_write(start, end);
    }

    pub fn get_arm_state(&mut self) -> &mut ArmState {
        &mut self.state
    }

    pub fn coprocessor(&mut self) -> &mut dyn Coprocessor {
        self.coprocessor.as_mut()
    }
}

/// Builds a [`Recompiler`] backed by the Cranelift JIT instead of the
/// interpreter (feature `native-backend`). Both preserve identical
/// guest-observable behavior (§9); this constructor exists purely for the
/// performance-sensitive embedder, the interpreter remaining the default
/// and the one every unit test targets.
#[cfg(feature = "native-backend")]
impl<M: Memory + 'static> Recompiler<M> {
    pub fn new_native(options: Options) -> Result<Recompiler<M>, BackendError> {
        let coprocessor = options.default_coprocessor();
        let backend: Box<dyn Backend<M>> = Box::new(NativeBackend::new(options.backend_config())?);
        Ok(Recompiler { state: ArmState::new(), coprocessor, backend, _not_sync: PhantomData })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatMemory {
        bytes: Vec<u8>,
    }

    impl FlatMemory {
        fn new(size: usize) -> FlatMemory {
            FlatMemory { bytes: vec![0; size] }
        }

        fn write_arm(&mut self, addr: u32, opcode: u32) {
            self.bytes[addr as usize..addr as usize + 4].copy_from_slice(&opcode.to_le_bytes());
        }
    }

    impl Memory for FlatMemory {
        fn read_byte(&mut self, addr: u32) -> u8 {
            self.bytes[addr as usize]
        }
        fn read_half(&mut self, addr: u32) -> u16 {
            u16::from_le_bytes([self.bytes[addr as usize], self.bytes[addr as usize + 1]])
        }
        fn read_word(&mut self, addr: u32) -> u32 {
            u32::from_le_bytes(self.bytes[addr as usize..addr as usize + 4].try_into().unwrap())
        }
        fn write_byte(&mut self, addr: u32, value: u8) {
            self.bytes[addr as usize] = value;
        }
        fn write_half(&mut self, addr: u32, value: u16) {
            self.bytes[addr as usize..addr as usize + 2].copy_from_slice(&value.to_le_bytes());
        }
        fn write_word(&mut self, addr: u32, value: u32) {
            self.bytes[addr as usize..addr as usize + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    #[test]
    fn run_executes_a_mov_and_reports_cycles_consumed() {
        let mut rec: Recompiler<FlatMemory> = Recompiler::new(Options::default());
        let mut mem = FlatMemory::new(0x1000);
        mem.write_arm(0, 0xE3A0_002A); // MOV R0, #42
        mem.write_arm(4, 0xEAFF_FFFE); // B .
        rec.get_arm_state().set_pc(8);

        let consumed = rec.run(&mut mem, 1);
        assert!(consumed >= 1);
        assert_eq!(rec.get_arm_state().gpr(Gpr(0)), 42);
    }

    #[test]
    fn invalidate_all_does_not_panic_on_an_empty_cache() {
        let mut rec: Recompiler<FlatMemory> = Recompiler::new(Options::default());
        rec.invalidate_all();
    }

    #[test]
    fn arm7tdmi_model_has_no_cp15() {
        let options = Options { cpu_model: CpuModel::Arm7Tdmi, ..Options::default() };
        let mut rec: Recompiler<FlatMemory> = Recompiler::new(options);
        assert!(!rec.coprocessor().is_present());
    }

    #[test]
    fn arm946_model_has_cp15_present() {
        let options = Options { cpu_model: CpuModel::Arm946ES, ..Options::default() };
        let mut rec: Recompiler<FlatMemory> = Recompiler::new(options);
        assert!(rec.coprocessor().is_present());
    }
}
