use arm_state::{Gpr, Mode};

/// A reference to a GPR, qualified by whether the access goes through the
/// current mode's bank or is forced to the User-mode bank (the `^` suffix
/// on LDM/STM, and MRS/MSR's user-mode register class).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GprArg {
    pub gpr: Gpr,
    pub user_mode: bool,
}

impl GprArg {
    pub fn new(gpr: Gpr) -> GprArg {
        GprArg { gpr, user_mode: false }
    }

    pub fn user(gpr: Gpr) -> GprArg {
        GprArg { gpr, user_mode: true }
    }
}

/// A reference to a banked mode's SPSR (LoadSPSR/StoreSPSR only make sense
/// for modes that have one — see `Mode::has_spsr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsrArg {
    pub mode: Mode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccessSize {
    Byte,
    Half,
    Word,
}

/// How a memory read widens/interprets its loaded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccessMode {
    /// Zero-extend (or, for words, no extension needed).
    Raw,
    /// Sign-extend to 32 bits.
    Signed,
    /// Zero-extend, but the address may be misaligned — the caller rotates
    /// or force-aligns per the guest architecture's unaligned-access rule.
    Unaligned,
}

/// The three ways a branch can switch between ARM and Thumb state, beyond
/// a plain same-state branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeSource {
    /// `BX`/`BLX Rm` — explicit exchange instructions.
    Instruction,
    /// A data-processing instruction that writes directly to R15.
    DataProcessing,
    /// `LDR`/`LDM` loading a word into R15 (ARMv5TE exchanges on bit 0;
    /// ARMv4T always stays in ARM state here).
    MemoryLoad,
}
