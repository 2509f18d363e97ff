//! Master clock configuration.

use crate::Ticks;

/// Master clock configuration for a system.
///
/// The serial hardware divides everything from this frequency. The BBC
/// Micro's peripheral bus runs at 2 MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterClock {
    /// Crystal frequency in Hz.
    pub frequency_hz: u64,
}

impl MasterClock {
    /// The BBC Micro's 2 MHz bus clock.
    pub const BBC_BUS: Self = Self::new(2_000_000);

    #[must_use]
    pub const fn new(frequency_hz: u64) -> Self {
        Self { frequency_hz }
    }

    /// Length of one master tick in nanoseconds (integer division).
    #[must_use]
    pub const fn nanos_per_tick(&self) -> u64 {
        1_000_000_000 / self.frequency_hz
    }

    /// Master ticks spanned by `nanos` nanoseconds, rounded down.
    #[must_use]
    pub const fn ticks_for_nanos(&self, nanos: u64) -> Ticks {
        Ticks::new(nanos / self.nanos_per_tick())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbc_bus_tick_is_500ns() {
        assert_eq!(MasterClock::BBC_BUS.nanos_per_tick(), 500);
    }

    #[test]
    fn one_1200th_is_1664_bus_cycles() {
        assert_eq!(MasterClock::BBC_BUS.ticks_for_nanos(832_000), Ticks::new(1664));
    }
}
