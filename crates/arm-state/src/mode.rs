//! ARM processor modes and their CPSR mode-field encodings.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// One of the seven ARM processor modes. Each non-`User` mode (besides
/// `System`, which shares `User`'s registers) banks its own R13/R14 and,
/// except `System`, its own SPSR; `Fiq` additionally banks R8-R12.
#[derive(Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Mode {
    User = 0b10000,
    Fiq = 0b10001,
    Irq = 0b10010,
    Supervisor = 0b10011,
    Abort = 0b10111,
    Undefined = 0b11011,
    System = 0b11111,
}

impl Mode {
    pub const MASK: u32 = 0b0001_1111;

    /// Parses a CPSR mode field, defaulting to `System` for unrecognized
    /// patterns rather than failing — matching real hardware's "undefined
    /// mode" behavior, which this core never intentionally produces but must
    /// not panic on if a guest does something exotic.
    pub fn from_bits(bits: u32) -> Mode {
        Mode::try_from((bits & Self::MASK) as u8).unwrap_or(Mode::System)
    }

    pub fn bits(self) -> u32 {
        u8::from(self) as u32
    }

    /// Index into the banked-register tables in [`crate::registers::Registers`].
    /// `User` and `System` share a bank.
    pub(crate) fn bank_index(self) -> usize {
        match self {
            Mode::User | Mode::System => 0,
            Mode::Fiq => 1,
            Mode::Irq => 2,
            Mode::Supervisor => 3,
            Mode::Abort => 4,
            Mode::Undefined => 5,
        }
    }

    /// Whether this mode has its own SPSR (all modes except `User`/`System`).
    pub fn has_spsr(self) -> bool {
        !matches!(self, Mode::User | Mode::System)
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::User => "usr",
            Mode::Fiq => "fiq",
            Mode::Irq => "irq",
            Mode::Supervisor => "svc",
            Mode::Abort => "abt",
            Mode::Undefined => "und",
            Mode::System => "sys",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bits() {
        for mode in
            [Mode::User, Mode::Fiq, Mode::Irq, Mode::Supervisor, Mode::Abort, Mode::Undefined, Mode::System]
        {
            assert_eq!(Mode::from_bits(mode.bits()), mode);
        }
    }

    #[test]
    fn unknown_bits_fall_back_to_system() {
        assert_eq!(Mode::from_bits(0), Mode::System);
    }
}
