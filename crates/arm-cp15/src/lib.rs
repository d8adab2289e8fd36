//! The coprocessor interface and the ARM946E-S system-control coprocessor
//! (CP15), to the extent the IR touches it: TCM base/size configuration and
//! the exception vector base address.

pub mod tcm;

use tcm::Tcm;

/// A coprocessor attached to the CPU's coprocessor bus (CP0-CP15). Queried
/// by MRC/MCR lowering in `arm-translate` and, for CP15 specifically, by the
/// backend's IRQ-entry stub (vector base address).
pub trait Coprocessor {
    fn is_present(&self) -> bool;

    /// ARMv5TE data-processing-style coprocessor register transfers
    /// (`MRC2`/`MCR2` and friends) vs. the ARMv4T-only encodings.
    fn supports_extended_reg_transfers(&self) -> bool;

    fn load_register(&self, reg: CopRegister) -> u32;

    fn store_register(&mut self, reg: CopRegister, value: u32);

    /// Some coprocessor registers (e.g. CP15's cache/TCM control registers)
    /// have side effects beyond storing the value — the translator must not
    /// let the optimizer eliminate a "dead" store to one of these.
    fn reg_store_has_side_effects(&self, reg: CopRegister) -> bool;

    /// Base address added to an exception vector offset (`Op::GetBaseVectorAddress`,
    /// §4.1's exception-entry helper). Cores without CP15 always use zero.
    fn base_vector_address(&self) -> u32 {
        0
    }
}

/// A coprocessor register reference: (CRn, opcode1, CRm, opcode2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CopRegister {
    pub cn: u8,
    pub opcode1: u8,
    pub cm: u8,
    pub opcode2: u8,
}

impl CopRegister {
    pub fn new(cn: u8, opcode1: u8, cm: u8, opcode2: u8) -> CopRegister {
        CopRegister { cn, opcode1, cm, opcode2 }
    }
}

/// CP15 control register bit for enabling the MPU/cache (bit 0), kept only
/// to the extent the translator's exception-entry helper needs to know
/// whether CP15 is installed at all; full MPU/cache emulation is out of
/// scope (§1).
const CONTROL_VECTOR_REMAP_BIT: u32 = 1 << 13;

/// The ARM946E-S system-control coprocessor.
pub struct SystemControl {
    control: u32,
    tcm: Tcm,
}

impl SystemControl {
    pub fn new() -> SystemControl {
        SystemControl { control: 0, tcm: Tcm::new() }
    }

    pub fn tcm(&self) -> &Tcm {
        &self.tcm
    }

    pub fn tcm_mut(&mut self) -> &mut Tcm {
        &mut self.tcm
    }

    /// Base address added to the exception vector offset (§4.1's exception
    /// entry helper: "compute PC as base vector plus vector index"). ARMv4T
    /// cores without CP15 always use a fixed base of zero.
    pub fn vector_base(&self) -> u32 {
        if self.control & CONTROL_VECTOR_REMAP_BIT != 0 {
            0xFFFF_0000
        } else {
            0x0000_0000
        }
    }
}

impl Default for SystemControl {
    fn default() -> SystemControl {
        SystemControl::new()
    }
}

impl Coprocessor for SystemControl {
    fn is_present(&self) -> bool {
        true
    }

    fn supports_extended_reg_transfers(&self) -> bool {
        true
    }

    fn load_register(&self, reg: CopRegister) -> u32 {
        match (reg.cn, reg.cm, reg.opcode2) {
            (1, 0, 0) => self.control,
            (9, 1, 0) => self.tcm.dtcm_control(),
            (9, 1, 1) => self.tcm.itcm_control(),
            _ => 0,
        }
    }

    fn store_register(&mut self, reg: CopRegister, value: u32) {
        match (reg.cn, reg.cm, reg.opcode2) {
            (1, 0, 0) => self.control = value,
            (9, 1, 0) => self.tcm.set_dtcm_control(value),
            (9, 1, 1) => self.tcm.set_itcm_control(value),
            _ => log::debug!("CP15: write to unmodeled register {reg:?}"),
        }
    }

    fn reg_store_has_side_effects(&self, reg: CopRegister) -> bool {
        matches!((reg.cn, reg.cm, reg.opcode2), (1, 0, 0) | (9, 1, 0) | (9, 1, 1))
    }

    fn base_vector_address(&self) -> u32 {
        self.vector_base()
    }
}

/// A coprocessor that is simply not installed — the ARM7TDMI CPU model
/// (§6) has no CP15. Every access lowers to the undefined-instruction
/// exception entry sequence (§7).
pub struct AbsentCoprocessor;

impl Coprocessor for AbsentCoprocessor {
    fn is_present(&self) -> bool {
        false
    }

    fn supports_extended_reg_transfers(&self) -> bool {
        false
    }

    fn load_register(&self, _reg: CopRegister) -> u32 {
        0
    }

    fn store_register(&mut self, _reg: CopRegister, _value: u32) {}

    fn reg_store_has_side_effects(&self, _reg: CopRegister) -> bool {
        false
    }
}
