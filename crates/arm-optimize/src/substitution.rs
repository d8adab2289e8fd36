use std::collections::HashMap;

use arm_ir::{Op, VarOrImm, Variable};

/// Maps variable indices to a replacement value, discovered by constant
/// propagation (variable -> known immediate) or copy/mov absorption
/// (variable -> the variable it was an identity copy of). Chains are
/// followed at resolve time, so `a -> b` then `b -> 5` resolves `a` straight
/// to `Imm(5)` without a second pass.
#[derive(Debug, Default)]
pub struct Substitution {
    map: HashMap<u32, VarOrImm>,
}

impl Substitution {
    pub fn new() -> Substitution {
        Substitution::default()
    }

    pub fn set(&mut self, var: Variable, replacement: VarOrImm) {
        self.map.insert(var.index(), replacement);
    }

    /// Follows the substitution chain for `value`, stopping at an immediate
    /// or a variable with no recorded replacement. Bounded by the map's own
    /// size so a (never expected, but SSA gives no hard guarantee a future
    /// pass won't introduce one) cycle can't loop forever.
    pub fn resolve(&self, value: VarOrImm) -> VarOrImm {
        let mut current = value;
        let mut steps = 0;
        while let VarOrImm::Var(var) = current {
            let Some(&next) = self.map.get(&var.index()) else { break };
            current = next;
            steps += 1;
            if steps > self.map.len() {
                break;
            }
        }
        current
    }

    /// Like `resolve`, but only follows variable-to-variable links — used
    /// for operand slots that are typed `Variable` rather than `VarOrImm`
    /// (flag-chain CPSR values, `CopyVar::src`) and so cannot accept an
    /// immediate replacement even if one is known.
    fn resolve_var(&self, var: Variable) -> Variable {
        match self.resolve(VarOrImm::Var(var)) {
            VarOrImm::Var(replacement) => replacement,
            VarOrImm::Imm(_) => var,
        }
    }
}

/// Rewrites every source `VarOrImm`/`Variable` operand of `op` through
/// `subst`, leaving destination slots untouched. Returns the rewritten op
/// and whether anything actually changed, so callers can fold this into a
/// single-scan "did this pass make progress" flag.
pub fn apply_to_op(op: &Op, subst: &Substitution) -> (Op, bool) {
    let rv = |v: VarOrImm| subst.resolve(v);
    let rvar = |v: Variable| subst.resolve_var(v);

    let new_op = match op.clone() {
        Op::StoreGpr { dst, src } => Op::StoreGpr { dst, src: rv(src) },
        Op::StoreCpsr { src } => Op::StoreCpsr { src: rv(src) },
        Op::StoreSpsr { mode, src } => Op::StoreSpsr { mode, src: rv(src) },
        Op::MemRead { mode, size, dst, address } => Op::MemRead { mode, size, dst, address: rv(address) },
        Op::MemWrite { size, src, address } => Op::MemWrite { size, src: rv(src), address: rv(address) },
        Op::Preload { address } => Op::Preload { address: rv(address) },
        Op::Lsl { dst, value, amount, set_flags } => Op::Lsl { dst, value: rv(value), amount: rv(amount), set_flags },
        Op::Lsr { dst, value, amount, set_flags } => Op::Lsr { dst, value: rv(value), amount: rv(amount), set_flags },
        Op::Asr { dst, value, amount, set_flags } => Op::Asr { dst, value: rv(value), amount: rv(amount), set_flags },
        Op::Ror { dst, value, amount, set_flags } => Op::Ror { dst, value: rv(value), amount: rv(amount), set_flags },
        Op::Rrx { dst, value, set_flags } => Op::Rrx { dst, value: rv(value), set_flags },
        Op::And { dst, lhs, rhs, set_flags } => Op::And { dst, lhs: rv(lhs), rhs: rv(rhs), set_flags },
        Op::Eor { dst, lhs, rhs, set_flags } => Op::Eor { dst, lhs: rv(lhs), rhs: rv(rhs), set_flags },
        Op::Orr { dst, lhs, rhs, set_flags } => Op::Orr { dst, lhs: rv(lhs), rhs: rv(rhs), set_flags },
        Op::Bic { dst, lhs, rhs, set_flags } => Op::Bic { dst, lhs: rv(lhs), rhs: rv(rhs), set_flags },
        Op::Add { dst, lhs, rhs, set_flags } => Op::Add { dst, lhs: rv(lhs), rhs: rv(rhs), set_flags },
        Op::Adc { dst, lhs, rhs, set_flags } => Op::Adc { dst, lhs: rv(lhs), rhs: rv(rhs), set_flags },
        Op::Sub { dst, lhs, rhs, set_flags } => Op::Sub { dst, lhs: rv(lhs), rhs: rv(rhs), set_flags },
        Op::Rsb { dst, lhs, rhs, set_flags } => Op::Rsb { dst, lhs: rv(lhs), rhs: rv(rhs), set_flags },
        Op::Sbc { dst, lhs, rhs, set_flags } => Op::Sbc { dst, lhs: rv(lhs), rhs: rv(rhs), set_flags },
        Op::Rsc { dst, lhs, rhs, set_flags } => Op::Rsc { dst, lhs: rv(lhs), rhs: rv(rhs), set_flags },
        Op::Mov { dst, value, set_flags } => Op::Mov { dst, value: rv(value), set_flags },
        Op::Mvn { dst, value, set_flags } => Op::Mvn { dst, value: rv(value), set_flags },
        Op::Clz { dst, value } => Op::Clz { dst, value: rv(value) },
        Op::SaturatingAdd { dst, lhs, rhs, double_rhs } => {
            Op::SaturatingAdd { dst, lhs: rv(lhs), rhs: rv(rhs), double_rhs }
        }
        Op::SaturatingSub { dst, lhs, rhs, double_rhs } => {
            Op::SaturatingSub { dst, lhs: rv(lhs), rhs: rv(rhs), double_rhs }
        }
        Op::Multiply { dst_lo, dst_hi, lhs, rhs, signed, set_flags } => {
            Op::Multiply { dst_lo, dst_hi, lhs: rv(lhs), rhs: rv(rhs), signed, set_flags }
        }
        Op::AddLong { dst_lo, dst_hi, lhs_lo, lhs_hi, rhs_lo, rhs_hi, set_flags } => Op::AddLong {
            dst_lo,
            dst_hi,
            lhs_lo: rv(lhs_lo),
            lhs_hi: rv(lhs_hi),
            rhs_lo: rv(rhs_lo),
            rhs_hi: rv(rhs_hi),
            set_flags,
        },
        Op::StoreFlags { mask, dst_cpsr, src_cpsr, values } => {
            Op::StoreFlags { mask, dst_cpsr, src_cpsr: rvar(src_cpsr), values: rv(values) }
        }
        Op::UpdateFlags { mask, dst_cpsr, src_cpsr } => Op::UpdateFlags { mask, dst_cpsr, src_cpsr: rvar(src_cpsr) },
        Op::UpdateStickyOverflow { dst_cpsr, src_cpsr } => {
            Op::UpdateStickyOverflow { dst_cpsr, src_cpsr: rvar(src_cpsr) }
        }
        Op::Branch { dst_pc, src_cpsr, address } => Op::Branch { dst_pc, src_cpsr: rv(src_cpsr), address: rv(address) },
        Op::BranchExchange { dst_pc, dst_cpsr, src_cpsr, address, source } => {
            Op::BranchExchange { dst_pc, dst_cpsr, src_cpsr: rv(src_cpsr), address: rv(address), source }
        }
        Op::StoreCopRegister { src, cp_num, opcode1, crn, crm, opcode2, ext } => {
            Op::StoreCopRegister { src: rv(src), cp_num, opcode1, crn, crm, opcode2, ext }
        }
        Op::CopyVar { dst, src } => Op::CopyVar { dst, src: rvar(src) },
        other => other,
    };

    let changed = new_op != *op;
    (new_op, changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_follows_chain_to_immediate() {
        let mut subst = Substitution::new();
        let a = Variable::new(0);
        let b = Variable::new(1);
        subst.set(a, VarOrImm::Var(b));
        subst.set(b, VarOrImm::Imm(7));
        assert_eq!(subst.resolve(VarOrImm::Var(a)), VarOrImm::Imm(7));
    }

    #[test]
    fn apply_to_op_rewrites_source_operand_only() {
        let dst = Variable::new(2);
        let src_var = Variable::new(0);
        let mut subst = Substitution::new();
        subst.set(src_var, VarOrImm::Imm(9));
        let mov = Op::Mov { dst, value: VarOrImm::Var(src_var), set_flags: false };
        let (rewritten, changed) = apply_to_op(&mov, &subst);
        assert!(changed);
        assert_eq!(rewritten, Op::Mov { dst, value: VarOrImm::Imm(9), set_flags: false });
    }

    #[test]
    fn variable_typed_slot_ignores_immediate_replacement() {
        let dst = Variable::new(3);
        let src = Variable::new(0);
        let mut subst = Substitution::new();
        subst.set(src, VarOrImm::Imm(1)); // src_cpsr can't become an immediate
        let op = Op::UpdateFlags { mask: 0b1111, dst_cpsr: dst, src_cpsr: src };
        let (rewritten, changed) = apply_to_op(&op, &subst);
        assert!(!changed);
        assert_eq!(rewritten, op);
    }
}
