//! Serial word format decoded from the control register.

/// Parity mode of a serial frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Parity {
    /// The conventional letter used in framing labels (`N`, `E`, `O`).
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::None => 'N',
            Self::Even => 'E',
            Self::Odd => 'O',
        }
    }

    #[must_use]
    pub const fn from_char(c: char) -> Option<Self> {
        match c {
            'N' => Some(Self::None),
            'E' => Some(Self::Even),
            'O' => Some(Self::Odd),
            _ => None,
        }
    }
}

/// Word format of a serial frame.
///
/// `nominal_baud` is approximate (1200 rather than 1201.9) and is only filled
/// in by callers that know the clock rate; it is zero when derived purely
/// from the control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialFraming {
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub nominal_baud: i32,
}

impl SerialFraming {
    /// The 8N1 format used by the MOS cassette filing system.
    pub const MOS_8N1: Self = Self {
        data_bits: 8,
        parity: Parity::None,
        stop_bits: 1,
        nominal_baud: 1200,
    };

    /// Decode word select bits 4-2 of the ACIA control register.
    ///
    /// | Bits 4-2 | Format |
    /// |----------|--------|
    /// | 000      | 7E2    |
    /// | 001      | 7O2    |
    /// | 010      | 7E1    |
    /// | 011      | 7O1    |
    /// | 100      | 8N2    |
    /// | 101      | 8N1    |
    /// | 110      | 8E1    |
    /// | 111      | 8O1    |
    #[must_use]
    pub const fn from_control(control: u8) -> Self {
        let (data_bits, parity, stop_bits) = match (control >> 2) & 7 {
            0 => (7, Parity::Even, 2),
            1 => (7, Parity::Odd, 2),
            2 => (7, Parity::Even, 1),
            3 => (7, Parity::Odd, 1),
            4 => (8, Parity::None, 2),
            5 => (8, Parity::None, 1),
            6 => (8, Parity::Even, 1),
            _ => (8, Parity::Odd, 1),
        };
        Self {
            data_bits,
            parity,
            stop_bits,
            nominal_baud: 0,
        }
    }

    #[must_use]
    pub const fn with_baud(mut self, nominal_baud: i32) -> Self {
        self.nominal_baud = nominal_baud;
        self
    }

    /// Total bits in one frame, start bit included.
    #[must_use]
    pub const fn frame_bits(&self) -> u8 {
        1 + self.data_bits + self.parity_bits() + self.stop_bits
    }

    #[must_use]
    pub const fn parity_bits(&self) -> u8 {
        match self.parity {
            Parity::None => 0,
            _ => 1,
        }
    }

    #[must_use]
    pub const fn is_8n1(&self) -> bool {
        self.data_bits == 8 && matches!(self.parity, Parity::None) && self.stop_bits == 1
    }

    /// Label such as `8N1`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}{}{}", self.data_bits, self.parity.as_char(), self.stop_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_select_table() {
        let labels: Vec<String> = (0..8u8)
            .map(|ws| SerialFraming::from_control(ws << 2).label())
            .collect();
        assert_eq!(labels, ["7E2", "7O2", "7E1", "7O1", "8N2", "8N1", "8E1", "8O1"]);
    }

    #[test]
    fn mos_cassette_control_value_is_8n1() {
        assert!(SerialFraming::from_control(0x15).is_8n1());
        assert_eq!(SerialFraming::MOS_8N1.frame_bits(), 10);
        assert_eq!(SerialFraming::from_control(0x08).frame_bits(), 10);
    }
}
