//! The 1/1200 s tone symbol.
//!
//! Every back end translates its native encoding to and from a stream of
//! these. `One` and `Leader` are both 2400 Hz carrier; `Leader` marks carrier
//! that has gone on long enough to be treated as a block lead-in rather than
//! a run of stop bits.

/// One tick of tape signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tone {
    /// 1200 Hz: a zero bit.
    Zero,
    /// 2400 Hz: a one bit.
    One,
    /// 2400 Hz carrier known to be leader.
    Leader,
    /// No signal.
    Silence,
}

impl Tone {
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Zero => '0',
            Self::One => '1',
            Self::Leader => 'L',
            Self::Silence => 'S',
        }
    }

    #[must_use]
    pub const fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Zero),
            '1' => Some(Self::One),
            'L' => Some(Self::Leader),
            'S' => Some(Self::Silence),
            _ => None,
        }
    }

    #[must_use]
    pub const fn from_bit(bit: bool) -> Self {
        if bit { Self::One } else { Self::Zero }
    }

    /// Carrier present (a one bit or leader).
    #[must_use]
    pub const fn is_mark(self) -> bool {
        matches!(self, Self::One | Self::Leader)
    }

    /// `'0'` or silence: anything that breaks a carrier run.
    #[must_use]
    pub const fn breaks_carrier(self) -> bool {
        matches!(self, Self::Zero | Self::Silence)
    }

    /// Treat leader as an ordinary one bit.
    #[must_use]
    pub const fn as_bit_tone(self) -> Self {
        match self {
            Self::Leader => Self::One,
            t => t,
        }
    }
}

impl std::fmt::Display for Tone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}
