use arm_state::Mode;

use crate::args::{ExchangeSource, GprArg, MemAccessMode, MemAccessSize};
use crate::block::{BasicBlock, OpRef};
use crate::op::Op;
use crate::variable::{VarOrImm, Variable};

/// Builds IR into a `BasicBlock`: allocates variables and appends ops.
/// Performs no folding or simplification — per §4.2, that's entirely the
/// optimizer's job. Every method returns the `Variable` holding its result,
/// except for ops with no result (stores, branches, memory writes) which
/// return the `OpRef` instead, for passes that need to address the op
/// directly.
pub struct Emitter<'b> {
    block: &'b mut BasicBlock,
}

impl<'b> Emitter<'b> {
    pub fn new(block: &'b mut BasicBlock) -> Emitter<'b> {
        Emitter { block }
    }

    fn push(&mut self, op: Op) -> OpRef {
        self.block.push(op)
    }

    fn fresh(&mut self) -> Variable {
        self.block.new_variable()
    }

    /// Allocates a fresh SSA variable without emitting an op. Used by
    /// callers that need a destination ahead of time, such as when filling
    /// in a value-producing form of an op whose `dst` is normally optional
    /// (`And`/`Eor`/`Add`/`Sub`).
    pub fn new_variable(&mut self) -> Variable {
        self.fresh()
    }

    // -- Register access ----------------------------------------------------

    pub fn load_gpr(&mut self, src: GprArg) -> Variable {
        let dst = self.fresh();
        self.push(Op::LoadGpr { dst, src });
        dst
    }

    pub fn store_gpr(&mut self, dst: GprArg, src: impl Into<VarOrImm>) -> OpRef {
        self.push(Op::StoreGpr { dst, src: src.into() })
    }

    pub fn load_cpsr(&mut self) -> Variable {
        let dst = self.fresh();
        self.push(Op::LoadCpsr { dst });
        dst
    }

    pub fn store_cpsr(&mut self, src: impl Into<VarOrImm>) -> OpRef {
        self.push(Op::StoreCpsr { src: src.into() })
    }

    pub fn load_spsr(&mut self, mode: Mode) -> Variable {
        let dst = self.fresh();
        self.push(Op::LoadSpsr { mode, dst });
        dst
    }

    pub fn store_spsr(&mut self, mode: Mode, src: impl Into<VarOrImm>) -> OpRef {
        self.push(Op::StoreSpsr { mode, src: src.into() })
    }

    // -- Memory access ------------------------------------------------------

    pub fn mem_read(&mut self, mode: MemAccessMode, size: MemAccessSize, address: impl Into<VarOrImm>) -> Variable {
        let dst = self.fresh();
        self.push(Op::MemRead { mode, size, dst, address: address.into() });
        dst
    }

    pub fn mem_write(&mut self, size: MemAccessSize, src: impl Into<VarOrImm>, address: impl Into<VarOrImm>) -> OpRef {
        self.push(Op::MemWrite { size, src: src.into(), address: address.into() })
    }

    pub fn preload(&mut self, address: impl Into<VarOrImm>) -> OpRef {
        self.push(Op::Preload { address: address.into() })
    }

    // -- Shifts ---------------------------------------------------------

    pub fn lsl(&mut self, value: impl Into<VarOrImm>, amount: impl Into<VarOrImm>, set_flags: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::Lsl { dst, value: value.into(), amount: amount.into(), set_flags });
        dst
    }

    pub fn lsr(&mut self, value: impl Into<VarOrImm>, amount: impl Into<VarOrImm>, set_flags: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::Lsr { dst, value: value.into(), amount: amount.into(), set_flags });
        dst
    }

    pub fn asr(&mut self, value: impl Into<VarOrImm>, amount: impl Into<VarOrImm>, set_flags: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::Asr { dst, value: value.into(), amount: amount.into(), set_flags });
        dst
    }

    pub fn ror(&mut self, value: impl Into<VarOrImm>, amount: impl Into<VarOrImm>, set_flags: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::Ror { dst, value: value.into(), amount: amount.into(), set_flags });
        dst
    }

    pub fn rrx(&mut self, value: impl Into<VarOrImm>, set_flags: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::Rrx { dst, value: value.into(), set_flags });
        dst
    }

    // -- Bitwise / arithmetic -----------------------------------------------

    pub fn and(&mut self, dst: Option<Variable>, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>, set_flags: bool) -> OpRef {
        self.push(Op::And { dst, lhs: lhs.into(), rhs: rhs.into(), set_flags })
    }

    pub fn eor(&mut self, dst: Option<Variable>, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>, set_flags: bool) -> OpRef {
        self.push(Op::Eor { dst, lhs: lhs.into(), rhs: rhs.into(), set_flags })
    }

    pub fn orr(&mut self, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>, set_flags: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::Orr { dst, lhs: lhs.into(), rhs: rhs.into(), set_flags });
        dst
    }

    pub fn bic(&mut self, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>, set_flags: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::Bic { dst, lhs: lhs.into(), rhs: rhs.into(), set_flags });
        dst
    }

    pub fn add(&mut self, dst: Option<Variable>, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>, set_flags: bool) -> OpRef {
        self.push(Op::Add { dst, lhs: lhs.into(), rhs: rhs.into(), set_flags })
    }

    pub fn adc(&mut self, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>, set_flags: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::Adc { dst, lhs: lhs.into(), rhs: rhs.into(), set_flags });
        dst
    }

    pub fn sub(&mut self, dst: Option<Variable>, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>, set_flags: bool) -> OpRef {
        self.push(Op::Sub { dst, lhs: lhs.into(), rhs: rhs.into(), set_flags })
    }

    pub fn rsb(&mut self, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>, set_flags: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::Rsb { dst, lhs: lhs.into(), rhs: rhs.into(), set_flags });
        dst
    }

    pub fn sbc(&mut self, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>, set_flags: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::Sbc { dst, lhs: lhs.into(), rhs: rhs.into(), set_flags });
        dst
    }

    pub fn rsc(&mut self, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>, set_flags: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::Rsc { dst, lhs: lhs.into(), rhs: rhs.into(), set_flags });
        dst
    }

    pub fn mov(&mut self, value: impl Into<VarOrImm>, set_flags: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::Mov { dst, value: value.into(), set_flags });
        dst
    }

    pub fn mvn(&mut self, value: impl Into<VarOrImm>, set_flags: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::Mvn { dst, value: value.into(), set_flags });
        dst
    }

    pub fn clz(&mut self, value: impl Into<VarOrImm>) -> Variable {
        let dst = self.fresh();
        self.push(Op::Clz { dst, value: value.into() });
        dst
    }

    pub fn saturating_add(&mut self, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>, double_rhs: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::SaturatingAdd { dst, lhs: lhs.into(), rhs: rhs.into(), double_rhs });
        dst
    }

    pub fn saturating_sub(&mut self, lhs: impl Into<VarOrImm>, rhs: impl Into<VarOrImm>, double_rhs: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::SaturatingSub { dst, lhs: lhs.into(), rhs: rhs.into(), double_rhs });
        dst
    }

    pub fn multiply(
        &mut self,
        wide: bool,
        lhs: impl Into<VarOrImm>,
        rhs: impl Into<VarOrImm>,
        signed: bool,
        set_flags: bool,
    ) -> (Variable, Option<Variable>) {
        let dst_lo = self.fresh();
        let dst_hi = if wide { Some(self.fresh()) } else { None };
        self.push(Op::Multiply { dst_lo, dst_hi, lhs: lhs.into(), rhs: rhs.into(), signed, set_flags });
        (dst_lo, dst_hi)
    }

    pub fn add_long(
        &mut self,
        lhs_lo: impl Into<VarOrImm>,
        lhs_hi: impl Into<VarOrImm>,
        rhs_lo: impl Into<VarOrImm>,
        rhs_hi: impl Into<VarOrImm>,
        set_flags: bool,
    ) -> (Variable, Variable) {
        let dst_lo = self.fresh();
        let dst_hi = self.fresh();
        self.push(Op::AddLong {
            dst_lo,
            dst_hi,
            lhs_lo: lhs_lo.into(),
            lhs_hi: lhs_hi.into(),
            rhs_lo: rhs_lo.into(),
            rhs_hi: rhs_hi.into(),
            set_flags,
        });
        (dst_lo, dst_hi)
    }

    // -- Flags ------------------------------------------------------------

    pub fn store_flags(&mut self, mask: u8, src_cpsr: Variable, values: impl Into<VarOrImm>) -> Variable {
        let dst_cpsr = self.fresh();
        self.push(Op::StoreFlags { mask, dst_cpsr, src_cpsr, values: values.into() });
        dst_cpsr
    }

    pub fn update_flags(&mut self, mask: u8, src_cpsr: Variable) -> Variable {
        let dst_cpsr = self.fresh();
        self.push(Op::UpdateFlags { mask, dst_cpsr, src_cpsr });
        dst_cpsr
    }

    pub fn update_sticky_overflow(&mut self, src_cpsr: Variable) -> Variable {
        let dst_cpsr = self.fresh();
        self.push(Op::UpdateStickyOverflow { dst_cpsr, src_cpsr });
        dst_cpsr
    }

    // -- Branching ----------------------------------------------------------

    pub fn branch(&mut self, src_cpsr: impl Into<VarOrImm>, address: impl Into<VarOrImm>) -> Variable {
        let dst_pc = self.fresh();
        self.push(Op::Branch { dst_pc, src_cpsr: src_cpsr.into(), address: address.into() });
        dst_pc
    }

    pub fn branch_exchange(
        &mut self,
        src_cpsr: impl Into<VarOrImm>,
        address: impl Into<VarOrImm>,
        source: ExchangeSource,
    ) -> (Variable, Variable) {
        let dst_pc = self.fresh();
        let dst_cpsr = self.fresh();
        self.push(Op::BranchExchange { dst_pc, dst_cpsr, src_cpsr: src_cpsr.into(), address: address.into(), source });
        (dst_pc, dst_cpsr)
    }

    // -- Coprocessor --------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn load_cop_register(&mut self, cp_num: u8, opcode1: u8, crn: u8, crm: u8, opcode2: u8, ext: bool) -> Variable {
        let dst = self.fresh();
        self.push(Op::LoadCopRegister { dst, cp_num, opcode1, crn, crm, opcode2, ext });
        dst
    }

    #[allow(clippy::too_many_arguments)]
    pub fn store_cop_register(
        &mut self,
        src: impl Into<VarOrImm>,
        cp_num: u8,
        opcode1: u8,
        crn: u8,
        crm: u8,
        opcode2: u8,
        ext: bool,
    ) -> OpRef {
        self.push(Op::StoreCopRegister { src: src.into(), cp_num, opcode1, crn, crm, opcode2, ext })
    }

    // -- Misc ---------------------------------------------------------------

    pub fn constant(&mut self, value: u32) -> Variable {
        let dst = self.fresh();
        self.push(Op::Constant { dst, value });
        dst
    }

    pub fn copy_var(&mut self, src: Variable) -> Variable {
        let dst = self.fresh();
        self.push(Op::CopyVar { dst, src });
        dst
    }

    pub fn get_base_vector_address(&mut self) -> Variable {
        let dst = self.fresh();
        self.push(Op::GetBaseVectorAddress { dst });
        dst
    }
}
