//! Counts of master clock ticks.

/// Bus cycles in one 1/1200 s tape tick (832 us at 2 MHz).
pub const BUS_CYCLES_PER_1200TH: u64 = 1664;

/// A count of master clock ticks.
///
/// The cassette hardware is polled in these units: the host hands the tape
/// system a number of elapsed 2 MHz bus cycles and everything downstream is
/// derived from that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ticks(pub u64);

impl Ticks {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(count: u64) -> Self {
        Self(count)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Bus cycles spanned by `n` whole tape ticks.
    #[must_use]
    pub const fn from_1200ths(n: u64) -> Self {
        Self(n * BUS_CYCLES_PER_1200TH)
    }

    /// Whole tape ticks contained in this many bus cycles.
    #[must_use]
    pub const fn whole_1200ths(self) -> u64 {
        self.0 / BUS_CYCLES_PER_1200TH
    }
}

impl core::ops::Add for Ticks {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl core::ops::AddAssign for Ticks {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl core::ops::Sub for Ticks {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tape_tick_conversions() {
        assert_eq!(Ticks::from_1200ths(3).get(), 4992);
        assert_eq!(Ticks::new(4991).whole_1200ths(), 2);
    }

    #[test]
    fn subtraction_saturates() {
        assert_eq!(Ticks::new(5) - Ticks::new(9), Ticks::ZERO);
    }
}
