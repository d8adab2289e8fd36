//! Cranelift-based native backend (§4.4, feature `native-backend`).
//!
//! Compiles a block's IR straight to machine code through `cranelift-jit`
//! once, instead of walking its op list on every entry the way
//! [`crate::interpreter::InterpreterBackend`] does. See DESIGN.md's "Open
//! Questions resolved here" for how this module adapts spec.md's described
//! hand-written register allocator and in-place jump patching to a real
//! Cranelift-based JIT: Cranelift owns instruction selection, register
//! allocation, and spilling once IR reaches it, so this module's actual job
//! is narrower — translate one [`Op`] at a time into Cranelift IR, or hand
//! it to a shared fallback that calls back into the interpreter's own
//! per-op routine when compiling it twice isn't worth the trouble.
//!
//! A compiled function's ABI is a single pointer argument: a
//! [`HostContext`] bundling the real `ArmState`/`Memory`/`Coprocessor`
//! pointers, the block's per-call variable-spill buffer, and (for the
//! fallback path) the block's own op list. Every op, inline or not, reads
//! its operands from and writes its result to that spill buffer rather
//! than a Cranelift-managed SSA value, so the inline-codegen and fallback
//! paths can freely interleave within one block without needing to
//! reconcile two different homes for the same variable.

use std::collections::HashMap;

use cranelift_codegen::ir::{types, AbiParam, InstBuilder, MemFlags, Signature, Value};
use cranelift_codegen::isa::CallConv;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use smallvec::SmallVec;

use arm_cp15::{CopRegister, Coprocessor};
use arm_ir::{BasicBlock, ExchangeSource, MemAccessMode, MemAccessSize, Op, Terminator, VarOrImm, Variable};
use arm_optimize::optimize;
use arm_state::{ArmState, ExecState, LocationRef, Memory, Mode};
use arm_translate::exception::vector;
use arm_translate::{apply_exception_entry, translate_block};

use crate::interpreter::execute_op;
use crate::{Backend, BackendConfig, BackendError, BlockCache, GenerationMap, PatchLists};

/// §9's documented-but-unmotivated direct-link eagerness heuristic: a
/// direct-link target whose first instruction starts within this many
/// bytes of its owner's last one is compiled right away, alongside the
/// owner, instead of waiting for the dispatcher to hit it cold on a
/// separate entry. Kept as a named, tunable constant rather than derived
/// from anything architectural, since it isn't one (DESIGN.md).
const NOP_FALLTHROUGH_BYTES: u32 = 27;

type NativeFn = extern "C" fn(*mut HostContext);

/// Everything a compiled function can reach through a host call. Built
/// fresh on the stack for every [`NativeBackend::call`] invocation (or,
/// for a directly-linked successor, reused for the successor's own call);
/// never stored past the body of `call`.
struct HostContext {
    state: *mut ArmState,
    mem: *mut (),
    cp: *mut (),
    has_cp: bool,
    vars: *mut u32,
    vars_len: usize,
    ops: *const Op,
    ops_len: usize,
}

/// One compiled block: its native entry point (valid as long as `module`
/// hasn't been dropped/replaced), the IR it was built from (kept so the
/// fallback trampoline has something to re-interpret), and the same
/// per-page generation snapshot the interpreter records.
struct CompiledBlock {
    func: NativeFn,
    block: BasicBlock,
    ops: Box<[Op]>,
    generation_checks: SmallVec<[(u32, u32); 2]>,
}

fn is_stale(generations: &GenerationMap, compiled: &CompiledBlock) -> bool {
    compiled.generation_checks.iter().any(|&(addr, recorded)| generations.generation(addr) != recorded)
}

/// The Cranelift-imported host functions every compiled function may call
/// into, declared once per `JITModule` generation and redeclared into each
/// function body that uses them (`Module::declare_func_in_func`).
struct HostFuncIds {
    vars_ptr: FuncId,
    get_gpr: FuncId,
    set_gpr: FuncId,
    get_cpsr: FuncId,
    set_cpsr: FuncId,
    get_spsr: FuncId,
    set_spsr: FuncId,
    mem_read: FuncId,
    mem_write: FuncId,
    load_cop: FuncId,
    store_cop: FuncId,
    base_vector: FuncId,
    branch: FuncId,
    branch_exchange: FuncId,
    fallback: FuncId,
}

pub struct NativeBackend<M: Memory> {
    config: BackendConfig,
    module: JITModule,
    host: HostFuncIds,
    cache: BlockCache<CompiledBlock>,
    patches: PatchLists,
    generations: GenerationMap,
    bytes_compiled: usize,
    _memory: std::marker::PhantomData<fn(&mut M)>,
}

impl<M: Memory + 'static> NativeBackend<M> {
    pub fn new(config: BackendConfig) -> Result<NativeBackend<M>, BackendError> {
        let generations = GenerationMap::new(config.generation_page_bits);
        let (module, host) = new_module::<M>()?;
        Ok(NativeBackend {
            config,
            module,
            host,
            cache: BlockCache::new(),
            patches: PatchLists::new(),
            generations,
            bytes_compiled: 0,
            _memory: std::marker::PhantomData,
        })
    }

    /// Drops the current `JITModule` (which owns its own executable memory
    /// region) and builds a fresh one, clearing everything compiled against
    /// it — §4.4's "growth discards all compiled code and clears both the
    /// cache and the patch lists," modeled here as starting over rather
    /// than growing one buffer in place (DESIGN.md).
    fn regrow(&mut self) -> Result<(), BackendError> {
        let (module, host) = new_module::<M>()?;
        self.module = module;
        self.host = host;
        self.cache.clear();
        self.patches.clear();
        self.generations.clear();
        self.bytes_compiled = 0;
        Ok(())
    }

    fn compile_block(&mut self, mem: &mut M, location: LocationRef) -> Result<CompiledBlock, BackendError> {
        if self.bytes_compiled >= self.config.maximum_code_buffer_size {
            self.regrow()?;
        }

        let mut block = translate_block(mem, location, &self.config.translate);
        optimize(&mut block, &self.config.optimize);

        let ops: Box<[Op]> = block.iter().map(|(_, op)| op.clone()).collect();
        let func = compile_ops::<M>(&mut self.module, &self.host, &ops)?;
        self.bytes_compiled += ops.len() * 64; // coarse per-op size estimate, see DESIGN.md

        let page_bits = self.config.generation_page_bits;
        let start_page = location.pc() >> page_bits;
        let span = (block.instruction_count.max(1) * location.instruction_size()).saturating_sub(1);
        let end_page = location.pc().wrapping_add(span) >> page_bits;

        let mut generation_checks = SmallVec::new();
        for page in start_page..=end_page.max(start_page) {
            let addr = page << page_bits;
            generation_checks.push((addr, self.generations.generation(addr)));
        }

        Ok(CompiledBlock { func, block, ops, generation_checks })
    }

    /// If `owner`'s direct-link target starts within [`NOP_FALLTHROUGH_BYTES`]
    /// of `owner`'s own last instruction, compiles it eagerly too instead of
    /// waiting for the dispatcher to reach it cold.
    fn maybe_eager_compile_target(&mut self, mem: &mut M, owner_key: u64, owner_end: u32) {
        let Some(existing) = self.cache.get(owner_key) else { return };
        let Terminator::DirectLink(target) = existing.block.terminator else { return };
        if self.cache.get(target.to_u64()).is_some() {
            return;
        }
        if target.pc().saturating_sub(owner_end) > NOP_FALLTHROUGH_BYTES {
            return;
        }
        if let Ok(compiled) = self.compile_block(mem, target) {
            let target_key = target.to_u64();
            if self.config.enable_block_linking {
                if let Terminator::DirectLink(grandchild) = compiled.block.terminator {
                    self.patches.register_pending(grandchild.to_u64(), target_key);
                }
            }
            self.cache.insert(target_key, compiled);
            self.patches.apply(target_key);
        }
    }
}

fn new_module<M: Memory + 'static>() -> Result<(JITModule, HostFuncIds), BackendError> {
    let mut flag_builder = settings::builder();
    flag_builder.set("use_colocated_libcalls", "false").map_err(jit_err)?;
    flag_builder.set("is_pic", "false").map_err(jit_err)?;
    let isa_builder = cranelift_native::builder().map_err(|e| BackendError::JitModuleError(e.to_string()))?;
    let isa = isa_builder.finish(settings::Flags::new(flag_builder)).map_err(jit_err)?;

    let mut jit_builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    register_symbol::<M>(&mut jit_builder, "host_vars_ptr", host_vars_ptr as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_get_gpr", host_get_gpr as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_set_gpr", host_set_gpr as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_get_cpsr", host_get_cpsr as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_set_cpsr", host_set_cpsr as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_get_spsr", host_get_spsr as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_set_spsr", host_set_spsr as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_mem_read", host_mem_read::<M> as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_mem_write", host_mem_write::<M> as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_load_cop", host_load_cop as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_store_cop", host_store_cop as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_base_vector", host_base_vector as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_branch", host_branch as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_branch_exchange", host_branch_exchange as *const u8);
    register_symbol::<M>(&mut jit_builder, "host_fallback", host_fallback::<M> as *const u8);

    let mut module = JITModule::new(jit_builder);

    let host = HostFuncIds {
        vars_ptr: declare(&mut module, "host_vars_ptr", &sig_ptr_to_ptr(&module))?,
        get_gpr: declare(&mut module, "host_get_gpr", &sig_3in_1out(&module))?,
        set_gpr: declare(&mut module, "host_set_gpr", &sig_4in_0out(&module))?,
        get_cpsr: declare(&mut module, "host_get_cpsr", &sig_1in_1out(&module))?,
        set_cpsr: declare(&mut module, "host_set_cpsr", &sig_2in_0out(&module))?,
        get_spsr: declare(&mut module, "host_get_spsr", &sig_2in_1out(&module))?,
        set_spsr: declare(&mut module, "host_set_spsr", &sig_3in_0out(&module))?,
        mem_read: declare(&mut module, "host_mem_read", &sig_4in_1out(&module))?,
        mem_write: declare(&mut module, "host_mem_write", &sig_4in_0out(&module))?,
        load_cop: declare(&mut module, "host_load_cop", &sig_6in_1out(&module))?,
        store_cop: declare(&mut module, "host_store_cop", &sig_7in_0out(&module))?,
        base_vector: declare(&mut module, "host_base_vector", &sig_1in_1out(&module))?,
        branch: declare(&mut module, "host_branch", &sig_2in_0out(&module))?,
        branch_exchange: declare(&mut module, "host_branch_exchange", &sig_3in_0out(&module))?,
        fallback: declare(&mut module, "host_fallback", &sig_2in_0out(&module))?,
    };

    Ok((module, host))
}

fn register_symbol<M: Memory>(builder: &mut JITBuilder, name: &str, ptr: *const u8) {
    builder.symbol(name, ptr);
}

fn declare(module: &mut JITModule, name: &str, sig: &Signature) -> Result<FuncId, BackendError> {
    module.declare_function(name, Linkage::Import, sig).map_err(|e| BackendError::JitModuleError(e.to_string()))
}

fn jit_err(e: impl std::fmt::Display) -> BackendError {
    BackendError::JitModuleError(e.to_string())
}

// Every imported function takes the `HostContext*` as an opaque `i64`
// first argument; the shapes below are just "how many more i64s in, how
// many i64s out" for the small set of call signatures actually used.
fn sig_ptr_to_ptr(module: &JITModule) -> Signature {
    sig(module, 1, 1)
}
fn sig_1in_1out(module: &JITModule) -> Signature {
    sig(module, 1, 1)
}
fn sig_2in_0out(module: &JITModule) -> Signature {
    sig(module, 2, 0)
}
fn sig_2in_1out(module: &JITModule) -> Signature {
    sig(module, 2, 1)
}
fn sig_3in_0out(module: &JITModule) -> Signature {
    sig(module, 3, 0)
}
fn sig_3in_1out(module: &JITModule) -> Signature {
    sig(module, 3, 1)
}
fn sig_4in_0out(module: &JITModule) -> Signature {
    sig(module, 4, 0)
}
fn sig_4in_1out(module: &JITModule) -> Signature {
    sig(module, 4, 1)
}
fn sig_6in_1out(module: &JITModule) -> Signature {
    sig(module, 6, 1)
}
fn sig_7in_0out(module: &JITModule) -> Signature {
    sig(module, 7, 0)
}

fn sig(module: &JITModule, ins: usize, outs: usize) -> Signature {
    let mut s = Signature::new(module.target_config().default_call_conv);
    s.params.push(AbiParam::new(types::I64));
    for _ in 1..ins {
        s.params.push(AbiParam::new(types::I32));
    }
    for _ in 0..outs {
        s.returns.push(AbiParam::new(types::I32));
    }
    s
}

fn compile_ops<M: Memory + 'static>(module: &mut JITModule, host: &HostFuncIds, ops: &[Op]) -> Result<NativeFn, BackendError> {
    let mut ctx = module.make_context();
    ctx.func.signature = sig(module, 1, 0);

    let mut fbx = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fbx);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);

        let ctx_ptr = builder.block_params(entry)[0];
        let vars_ptr_ref = module.declare_func_in_func(host.vars_ptr, builder.func);
        let call = builder.ins().call(vars_ptr_ref, &[ctx_ptr]);
        let vars = builder.inst_results(call)[0];

        let refs = HostFuncRefs::declare(module, host, builder.func);
        for (index, op) in ops.iter().enumerate() {
            codegen_op(&mut builder, &refs, ctx_ptr, vars, index as u32, op);
        }
        builder.ins().return_(&[]);
        builder.finalize();
    }

    let name = format!("block_{:p}", ops.as_ptr());
    let id = module
        .declare_function(&name, Linkage::Export, &ctx.func.signature.clone())
        .map_err(jit_err)?;
    module.define_function(id, &mut ctx).map_err(jit_err)?;
    module.clear_context(&mut ctx);
    module.finalize_definitions().map_err(jit_err)?;

    let code = module.get_finalized_function(id);
    // SAFETY: `code` points at a function Cranelift just defined with the
    // exact `fn(*mut HostContext)` signature built above.
    Ok(unsafe { std::mem::transmute::<*const u8, NativeFn>(code) })
}

/// `FuncRef`s for one function body; declared fresh per function since a
/// `FuncRef` is scoped to the `Function` that imported it.
struct HostFuncRefs {
    get_gpr: cranelift_codegen::ir::FuncRef,
    set_gpr: cranelift_codegen::ir::FuncRef,
    get_cpsr: cranelift_codegen::ir::FuncRef,
    set_cpsr: cranelift_codegen::ir::FuncRef,
    get_spsr: cranelift_codegen::ir::FuncRef,
    set_spsr: cranelift_codegen::ir::FuncRef,
    mem_read: cranelift_codegen::ir::FuncRef,
    mem_write: cranelift_codegen::ir::FuncRef,
    load_cop: cranelift_codegen::ir::FuncRef,
    store_cop: cranelift_codegen::ir::FuncRef,
    base_vector: cranelift_codegen::ir::FuncRef,
    branch: cranelift_codegen::ir::FuncRef,
    branch_exchange: cranelift_codegen::ir::FuncRef,
    fallback: cranelift_codegen::ir::FuncRef,
}

impl HostFuncRefs {
    fn declare(module: &mut JITModule, host: &HostFuncIds, func: &mut cranelift_codegen::ir::Function) -> HostFuncRefs {
        HostFuncRefs {
            get_gpr: module.declare_func_in_func(host.get_gpr, func),
            set_gpr: module.declare_func_in_func(host.set_gpr, func),
            get_cpsr: module.declare_func_in_func(host.get_cpsr, func),
            set_cpsr: module.declare_func_in_func(host.set_cpsr, func),
            get_spsr: module.declare_func_in_func(host.get_spsr, func),
            set_spsr: module.declare_func_in_func(host.set_spsr, func),
            mem_read: module.declare_func_in_func(host.mem_read, func),
            mem_write: module.declare_func_in_func(host.mem_write, func),
            load_cop: module.declare_func_in_func(host.load_cop, func),
            store_cop: module.declare_func_in_func(host.store_cop, func),
            base_vector: module.declare_func_in_func(host.base_vector, func),
            branch: module.declare_func_in_func(host.branch, func),
            branch_exchange: module.declare_func_in_func(host.branch_exchange, func),
            fallback: module.declare_func_in_func(host.fallback, func),
        }
    }
}

fn var_addr(b: &mut FunctionBuilder, vars: Value, var: Variable) -> Value {
    b.ins().iadd_imm(vars, (var.index() as i64) * 4)
}

fn load_var(b: &mut FunctionBuilder, vars: Value, var: Variable) -> Value {
    let addr = var_addr(b, vars, var);
    b.ins().load(types::I32, MemFlags::trusted(), addr, 0)
}

fn store_var(b: &mut FunctionBuilder, vars: Value, var: Variable, value: Value) {
    let addr = var_addr(b, vars, var);
    b.ins().store(MemFlags::trusted(), value, addr, 0);
}

fn operand(b: &mut FunctionBuilder, vars: Value, v: VarOrImm) -> Value {
    match v {
        VarOrImm::Imm(x) => b.ins().iconst(types::I32, x as i64),
        VarOrImm::Var(var) => load_var(b, vars, var),
    }
}

fn imm(b: &mut FunctionBuilder, v: u32) -> Value {
    b.ins().iconst(types::I32, v as i64)
}

/// Translates one [`Op`] into Cranelift IR, or — for the opcodes this
/// backend doesn't codegen directly — a call through `host.fallback` that
/// re-interprets exactly this op (see DESIGN.md's "Per-op codegen scope").
fn codegen_op(b: &mut FunctionBuilder, host: &HostFuncRefs, ctx_ptr: Value, vars: Value, index: u32, op: &Op) {
    match *op {
        Op::Constant { dst, value } => {
            let v = imm(b, value);
            store_var(b, vars, dst, v);
        }
        Op::CopyVar { dst, src } => {
            let v = load_var(b, vars, src);
            store_var(b, vars, dst, v);
        }
        Op::Mov { dst, value, set_flags: false } => {
            let v = operand(b, vars, value);
            store_var(b, vars, dst, v);
        }
        Op::Mvn { dst, value, set_flags: false } => {
            let v = operand(b, vars, value);
            let r = b.ins().bnot(v);
            store_var(b, vars, dst, r);
        }
        Op::And { dst: Some(dst), lhs, rhs, set_flags: false } => {
            let (l, r) = (operand(b, vars, lhs), operand(b, vars, rhs));
            let v = b.ins().band(l, r);
            store_var(b, vars, dst, v);
        }
        Op::Eor { dst: Some(dst), lhs, rhs, set_flags: false } => {
            let (l, r) = (operand(b, vars, lhs), operand(b, vars, rhs));
            let v = b.ins().bxor(l, r);
            store_var(b, vars, dst, v);
        }
        Op::Orr { dst, lhs, rhs, set_flags: false } => {
            let (l, r) = (operand(b, vars, lhs), operand(b, vars, rhs));
            let v = b.ins().bor(l, r);
            store_var(b, vars, dst, v);
        }
        Op::Bic { dst, lhs, rhs, set_flags: false } => {
            let (l, r) = (operand(b, vars, lhs), operand(b, vars, rhs));
            let not_r = b.ins().bnot(r);
            let v = b.ins().band(l, not_r);
            store_var(b, vars, dst, v);
        }
        Op::Add { dst: Some(dst), lhs, rhs, set_flags: false } => {
            let (l, r) = (operand(b, vars, lhs), operand(b, vars, rhs));
            let v = b.ins().iadd(l, r);
            store_var(b, vars, dst, v);
        }
        Op::Sub { dst: Some(dst), lhs, rhs, set_flags: false } => {
            let (l, r) = (operand(b, vars, lhs), operand(b, vars, rhs));
            let v = b.ins().isub(l, r);
            store_var(b, vars, dst, v);
        }

        Op::LoadGpr { dst, src } => {
            let (gpr, user) = (imm(b, src.gpr.0 as u32), imm(b, src.user_mode as u32));
            let call = b.ins().call(host.get_gpr, &[ctx_ptr, gpr, user]);
            let v = b.inst_results(call)[0];
            store_var(b, vars, dst, v);
        }
        Op::StoreGpr { dst, src } => {
            let v = operand(b, vars, src);
            let (gpr, user) = (imm(b, dst.gpr.0 as u32), imm(b, dst.user_mode as u32));
            b.ins().call(host.set_gpr, &[ctx_ptr, gpr, user, v]);
        }
        Op::LoadCpsr { dst } => {
            let call = b.ins().call(host.get_cpsr, &[ctx_ptr]);
            let v = b.inst_results(call)[0];
            store_var(b, vars, dst, v);
        }
        Op::StoreCpsr { src } => {
            let v = operand(b, vars, src);
            b.ins().call(host.set_cpsr, &[ctx_ptr, v]);
        }
        Op::LoadSpsr { mode, dst } => {
            let m = imm(b, u8::from(mode) as u32);
            let call = b.ins().call(host.get_spsr, &[ctx_ptr, m]);
            let v = b.inst_results(call)[0];
            store_var(b, vars, dst, v);
        }
        Op::StoreSpsr { mode, src } => {
            let v = operand(b, vars, src);
            let m = imm(b, u8::from(mode) as u32);
            b.ins().call(host.set_spsr, &[ctx_ptr, m, v]);
        }

        Op::MemRead { mode, size, dst, address } => {
            let addr = operand(b, vars, address);
            let (m, s) = (imm(b, mode as u32), imm(b, size as u32));
            let call = b.ins().call(host.mem_read, &[ctx_ptr, m, s, addr]);
            let v = b.inst_results(call)[0];
            store_var(b, vars, dst, v);
        }
        Op::MemWrite { size, src, address } => {
            let v = operand(b, vars, src);
            let addr = operand(b, vars, address);
            let s = imm(b, size as u32);
            b.ins().call(host.mem_write, &[ctx_ptr, s, addr, v]);
        }
        Op::Preload { .. } => {}

        Op::LoadCopRegister { dst, cp_num, opcode1, crn, crm, opcode2, .. } => {
            let args =
                [imm(b, cp_num as u32), imm(b, opcode1 as u32), imm(b, crn as u32), imm(b, crm as u32), imm(b, opcode2 as u32)];
            let call = b.ins().call(host.load_cop, &[ctx_ptr, args[0], args[1], args[2], args[3], args[4]]);
            let v = b.inst_results(call)[0];
            store_var(b, vars, dst, v);
        }
        Op::StoreCopRegister { src, cp_num, opcode1, crn, crm, opcode2, .. } => {
            let v = operand(b, vars, src);
            let args =
                [imm(b, cp_num as u32), imm(b, opcode1 as u32), imm(b, crn as u32), imm(b, crm as u32), imm(b, opcode2 as u32)];
            b.ins().call(host.store_cop, &[ctx_ptr, args[0], args[1], args[2], args[3], args[4], v]);
        }
        Op::GetBaseVectorAddress { dst } => {
            let call = b.ins().call(host.base_vector, &[ctx_ptr]);
            let v = b.inst_results(call)[0];
            store_var(b, vars, dst, v);
        }

        Op::Branch { address, .. } => {
            let addr = operand(b, vars, address);
            b.ins().call(host.branch, &[ctx_ptr, addr]);
        }
        Op::BranchExchange { address, source, .. } => {
            let addr = operand(b, vars, address);
            let src = imm(b, source as u32);
            b.ins().call(host.branch_exchange, &[ctx_ptr, addr, src]);
        }

        // Every other opcode — flag-setting ALU forms, shifts, CLZ,
        // saturating/multiply/add-long, flag ops — re-interprets through
        // the shared fallback rather than re-deriving ARM's carry/overflow
        // rules a second time in Cranelift IR (DESIGN.md).
        _ => {
            let idx = imm(b, index);
            b.ins().call(host.fallback, &[ctx_ptr, idx]);
        }
    }
}

// -- Host trampolines ----------------------------------------------------
//
// Every trampoline takes `ctx: *mut HostContext` as its first argument.
// None of these retain `ctx` past their own call — it lives on the stack
// frame of `NativeBackend::call` for exactly the duration of one native
// invocation.

extern "C" fn host_vars_ptr(ctx: *mut HostContext) -> *mut u32 {
    unsafe { (*ctx).vars }
}

extern "C" fn host_get_gpr(ctx: *mut HostContext, gpr: u32, user_mode: u32) -> u32 {
    let state = unsafe { &mut *(*ctx).state };
    let reg = arm_state::Gpr(gpr as u8);
    if user_mode != 0 {
        state.gpr_in(Mode::User, reg)
    } else {
        state.gpr(reg)
    }
}

extern "C" fn host_set_gpr(ctx: *mut HostContext, gpr: u32, user_mode: u32, value: u32) {
    let state = unsafe { &mut *(*ctx).state };
    let reg = arm_state::Gpr(gpr as u8);
    if user_mode != 0 {
        state.set_gpr_in(Mode::User, reg, value);
    } else {
        state.set_gpr(reg, value);
    }
}

extern "C" fn host_get_cpsr(ctx: *mut HostContext) -> u32 {
    let state = unsafe { &mut *(*ctx).state };
    state.cpsr().0
}

extern "C" fn host_set_cpsr(ctx: *mut HostContext, value: u32) {
    let state = unsafe { &mut *(*ctx).state };
    state.set_cpsr(arm_state::Psr(value));
}

extern "C" fn host_get_spsr(ctx: *mut HostContext, mode: u32) -> u32 {
    let state = unsafe { &mut *(*ctx).state };
    let mode = Mode::from_bits(mode);
    if mode.has_spsr() {
        state.spsr_in(mode).0
    } else {
        0
    }
}

extern "C" fn host_set_spsr(ctx: *mut HostContext, mode: u32, value: u32) {
    let state = unsafe { &mut *(*ctx).state };
    let mode = Mode::from_bits(mode);
    if mode.has_spsr() {
        state.set_spsr_in(mode, arm_state::Psr(value));
    }
}

extern "C" fn host_mem_read<M: Memory>(ctx: *mut HostContext, mode: u32, size: u32, addr: u32) -> u32 {
    let mem = unsafe { &mut *((*ctx).mem as *mut M) };
    let mode = match mode {
        0 => MemAccessMode::Raw,
        1 => MemAccessMode::Signed,
        _ => MemAccessMode::Unaligned,
    };
    let size = match size {
        0 => MemAccessSize::Byte,
        1 => MemAccessSize::Half,
        _ => MemAccessSize::Word,
    };
    match size {
        MemAccessSize::Byte => {
            let byte = mem.read_byte(addr);
            match mode {
                MemAccessMode::Signed => byte as i8 as i32 as u32,
                _ => byte as u32,
            }
        }
        MemAccessSize::Half => {
            let half = mem.read_half(addr & !0b1);
            match mode {
                MemAccessMode::Signed => half as i16 as i32 as u32,
                _ => half as u32,
            }
        }
        MemAccessSize::Word => {
            let word = mem.read_word(addr & !0b11);
            match mode {
                MemAccessMode::Unaligned => word.rotate_right((addr & 0b11) * 8),
                _ => word,
            }
        }
    }
}

extern "C" fn host_mem_write<M: Memory>(ctx: *mut HostContext, size: u32, addr: u32, value: u32) {
    let mem = unsafe { &mut *((*ctx).mem as *mut M) };
    match size {
        0 => mem.write_byte(addr, value as u8),
        1 => mem.write_half(addr & !0b1, value as u16),
        _ => mem.write_word(addr & !0b11, value),
    }
}

fn with_coprocessor<R>(ctx: *mut HostContext, default: R, f: impl FnOnce(&mut dyn Coprocessor) -> R) -> R {
    unsafe {
        let ctx = &mut *ctx;
        if !ctx.has_cp {
            return default;
        }
        let cp = &mut *(ctx.cp as *mut &mut dyn Coprocessor);
        f(*cp)
    }
}

extern "C" fn host_load_cop(ctx: *mut HostContext, cp_num: u32, opcode1: u32, crn: u32, crm: u32, opcode2: u32) -> u32 {
    with_coprocessor(ctx, 0, |cp| {
        if cp.is_present() {
            cp.load_register(CopRegister::new(crn as u8, opcode1 as u8, crm as u8, opcode2 as u8))
        } else {
            let _ = cp_num;
            0
        }
    })
}

extern "C" fn host_store_cop(ctx: *mut HostContext, cp_num: u32, opcode1: u32, crn: u32, crm: u32, opcode2: u32, value: u32) {
    with_coprocessor(ctx, (), |cp| {
        if cp.is_present() {
            cp.store_register(CopRegister::new(crn as u8, opcode1 as u8, crm as u8, opcode2 as u8), value);
        }
        let _ = cp_num;
    });
}

extern "C" fn host_base_vector(ctx: *mut HostContext) -> u32 {
    with_coprocessor(ctx, 0, |cp| cp.base_vector_address())
}

extern "C" fn host_branch(ctx: *mut HostContext, target: u32) {
    let state = unsafe { &mut *(*ctx).state };
    state.set_pc(target);
}

extern "C" fn host_branch_exchange(ctx: *mut HostContext, addr: u32, source: u32) {
    let state = unsafe { &mut *(*ctx).state };
    let source = match source {
        0 => ExchangeSource::Instruction,
        1 => ExchangeSource::DataProcessing,
        _ => ExchangeSource::MemoryLoad,
    };
    let exchanges = matches!(source, ExchangeSource::Instruction | ExchangeSource::MemoryLoad);
    let (target, thumb) = if exchanges {
        let thumb = addr & 1 != 0;
        (if thumb { addr & !0b1 } else { addr & !0b11 }, thumb)
    } else {
        (addr & !0b11, state.cpsr().thumb())
    };
    let mut cpsr = state.cpsr();
    cpsr.set_thumb(thumb);
    state.set_cpsr(cpsr);
    state.set_pc(target);
}

/// Re-interprets exactly the op at `index` in the compiled block's own op
/// list, against the same `vars` buffer the surrounding native code reads
/// and writes — the escape hatch for everything `codegen_op` doesn't
/// translate directly (DESIGN.md's per-op codegen scope).
extern "C" fn host_fallback<M: Memory>(ctx: *mut HostContext, index: u32) {
    unsafe {
        let ctx = &mut *ctx;
        let op = &*ctx.ops.add(index as usize);
        let vars = std::slice::from_raw_parts_mut(ctx.vars, ctx.vars_len);
        let state = &mut *ctx.state;
        let mem = &mut *(ctx.mem as *mut M);
        let cp = if ctx.has_cp { Some(&mut *(ctx.cp as *mut &mut dyn Coprocessor) as &mut dyn Coprocessor) } else { None };
        execute_op(op, vars, state, mem, cp);
    }
}

impl<M: Memory + 'static> Backend<M> for NativeBackend<M> {
    fn call(&mut self, state: &mut ArmState, mem: &mut M, mut cp: Option<&mut dyn Coprocessor>, max_cycles: u64) -> u64 {
        let mut consumed = 0u64;
        while consumed < max_cycles {
            let pending_irq = state.irq_line && !state.cpsr().irq_disable();
            match state.exec_state {
                ExecState::Running => {}
                // §4.4 prolog: halted with a pending IRQ wakes into the
                // IRQ-entry stub; halted without one falls to the epilog.
                ExecState::Halted if pending_irq => state.exec_state = ExecState::Running,
                ExecState::Halted | ExecState::Stopped => break,
            }

            if pending_irq {
                let base = cp.as_deref().map_or(0, |c| c.base_vector_address());
                let return_pc = state.pc();
                apply_exception_entry(state, base, vector::IRQ, return_pc);
            }

            let location = state.location();
            let key = location.to_u64();

            let stale = match self.cache.get(key) {
                Some(existing) => is_stale(&self.generations, existing),
                None => false,
            };
            if stale {
                self.cache.remove(key);
                self.patches.revert(key);
                self.patches.forget_owner(key);
            }

            if self.cache.get(key).is_none() {
                match self.compile_block(mem, location) {
                    Ok(compiled) => {
                        if self.config.enable_block_linking {
                            if let Terminator::DirectLink(target) = compiled.block.terminator {
                                self.patches.register_pending(target.to_u64(), key);
                            }
                        }
                        let end = location.pc().wrapping_add(compiled.block.instruction_count * location.instruction_size());
                        self.cache.insert(key, compiled);
                        self.patches.apply(key);
                        if self.config.enable_block_linking {
                            self.maybe_eager_compile_target(mem, key, end);
                        }
                    }
                    Err(_) => {
                        // Code buffer exhausted even after regrowing; fail
                        // this entry's worth of cycles rather than panic.
                        consumed += 1;
                        continue;
                    }
                }
            }

            let (holds, fail_cycles, instruction_count) = {
                let compiled = self.cache.get(key).expect("just compiled or already present");
                (compiled.block.condition.holds(state.cpsr()), compiled.block.fail_cycles, compiled.block.instruction_count)
            };

            if holds {
                let compiled = self.cache.get(key).expect("just compiled or already present");
                let mut vars = vec![0u32; compiled.block.variable_count() as usize];
                let (mem_ptr, (cp_ptr, has_cp)) = (
                    mem as *mut M as *mut (),
                    match cp.as_deref_mut() {
                        Some(cp) => {
                            let fat: *mut &mut dyn Coprocessor = &mut (cp as &mut dyn Coprocessor);
                            (fat as *mut (), true)
                        }
                        None => (std::ptr::null_mut(), false),
                    },
                );
                let mut ctx = HostContext {
                    state: state as *mut ArmState,
                    mem: mem_ptr,
                    cp: cp_ptr,
                    has_cp,
                    vars: vars.as_mut_ptr(),
                    vars_len: vars.len(),
                    ops: compiled.ops.as_ptr(),
                    ops_len: compiled.ops.len(),
                };
                (compiled.func)(&mut ctx as *mut HostContext);
                consumed += compiled.block.pass_cycles as u64;
            } else {
                consumed += fail_cycles as u64;
                state.set_pc(location.advance(instruction_count).pc());
            }
        }
        consumed
    }

    fn invalidate(&mut self, location: LocationRef) {
        let key = location.to_u64();
        self.cache.remove(key);
        self.patches.revert(key);
        self.patches.forget_owner(key);
    }

    fn invalidate_range(&mut self, start: u32, end: u32) {
        let patches = &mut self.patches;
        self.cache.retain(
            |key, _| {
                let pc = LocationRef::from_u64(key).pc();
                !(start..=end).contains(&pc)
            },
            |key, _| {
                patches.revert(key);
                patches.forget_owner(key);
            },
        );
    }

    fn invalidate_all(&mut self) {
        self.cache.clear();
        self.patches.clear();
        self.generations.clear();
    }

    fn report_memory_write(&mut self, start: u32, end: u32) {
        self.generations.report_write(start, end);
    }
}

#[cfg(test)]
mod tests {
    use arm_state::Gpr;
    use arm_translate::Architecture;

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

    fn config() -> BackendConfig {
        BackendConfig {
            translate: arm_translate::TranslateConfig { architecture: Architecture::Armv5TE, cp15_present: false, max_block_size: 32 },
            ..BackendConfig::default()
        }
    }

    #[test]
    fn mov_immediate_through_the_inline_path_writes_destination_register() {
        let mut backend: NativeBackend<FlatMemory> = NativeBackend::new(config()).expect("jit module init");
        let mut mem = FlatMemory::new(0x1000);
        mem.write_arm(0, 0xE3A0_0005); // MOV R0, #5 ; B . (no flags set, the inline path)
        mem.write_arm(4, 0xEAFF_FFFE);
        let mut state = ArmState::new();
        state.set_pc(8);

        backend.call(&mut state, &mut mem, None, 1);
        assert_eq!(state.gpr(Gpr(0)), 5);
    }

    #[test]
    fn flag_setting_add_through_the_fallback_path_matches_the_interpreter() {
        let mut backend: NativeBackend<FlatMemory> = NativeBackend::new(config()).expect("jit module init");
        let mut mem = FlatMemory::new(0x1000);
        mem.write_arm(0, 0xE290_0001); // ADDS R0, R0, #1  (set_flags = true, routed to fallback)
        mem.write_arm(4, 0xEAFF_FFFE);
        let mut state = ArmState::new();
        state.set_pc(8);

        backend.call(&mut state, &mut mem, None, 1);
        assert_eq!(state.gpr(Gpr(0)), 1);
        assert!(!state.cpsr().zero());
    }

    #[test]
    fn self_modifying_code_is_recompiled_after_a_reported_write() {
        let mut backend: NativeBackend<FlatMemory> = NativeBackend::new(config()).expect("jit module init");
        let mut mem = FlatMemory::new(0x1000);
        mem.write_arm(0, 0xE3A0_0001); // MOV R0, #1
        mem.write_arm(4, 0xEAFF_FFFE); // B .
        let mut state = ArmState::new();
        state.set_pc(8);
        backend.call(&mut state, &mut mem, None, 1);
        assert_eq!(state.gpr(Gpr(0)), 1);

        mem.write_arm(0, 0xE3A0_0002); // MOV R0, #2
        Backend::<FlatMemory>::report_memory_write(&mut backend, 0, 3);
        state.set_pc(8);
        backend.call(&mut state, &mut mem, None, 1);
        assert_eq!(state.gpr(Gpr(0)), 2);
    }
}
