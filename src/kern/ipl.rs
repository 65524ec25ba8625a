/*!
 * Interrupt Priority Levels
 */

use std::fmt;

/// Priority level of a CPU
///
/// Ordered: a CPU at level `l` defers any work whose class is `<= l`.
/// Read sections run at `SoftSerial`, which holds off high-priority cross
/// calls on that CPU until the section exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Ipl {
    None = 0,
    SoftClock = 1,
    SoftBio = 2,
    SoftNet = 3,
    SoftSerial = 4,
    Vm = 5,
    Sched = 6,
    High = 7,
}

impl Ipl {
    /// Decode a raw level stored in a per-CPU atomic
    ///
    /// # Panics
    ///
    /// Panics on a value no `Ipl` encodes (corrupted CPU state).
    #[inline]
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Ipl::None,
            1 => Ipl::SoftClock,
            2 => Ipl::SoftBio,
            3 => Ipl::SoftNet,
            4 => Ipl::SoftSerial,
            5 => Ipl::Vm,
            6 => Ipl::Sched,
            7 => Ipl::High,
            _ => panic!("invalid ipl {raw}"),
        }
    }

    #[inline]
    pub(crate) const fn raw(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Ipl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Ipl::None => "IPL_NONE",
            Ipl::SoftClock => "IPL_SOFTCLOCK",
            Ipl::SoftBio => "IPL_SOFTBIO",
            Ipl::SoftNet => "IPL_SOFTNET",
            Ipl::SoftSerial => "IPL_SOFTSERIAL",
            Ipl::Vm => "IPL_VM",
            Ipl::Sched => "IPL_SCHED",
            Ipl::High => "IPL_HIGH",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Ipl::None < Ipl::SoftSerial);
        assert!(Ipl::SoftNet < Ipl::SoftSerial);
        assert!(Ipl::SoftSerial < Ipl::High);
    }

    #[test]
    fn test_raw_round_trip() {
        for ipl in [Ipl::None, Ipl::SoftSerial, Ipl::High] {
            assert_eq!(Ipl::from_raw(ipl.raw()), ipl);
        }
        assert_eq!(Ipl::SoftSerial.to_string(), "IPL_SOFTSERIAL");
    }

    #[test]
    #[should_panic(expected = "invalid ipl")]
    fn test_invalid_raw_panics() {
        Ipl::from_raw(42);
    }
}
