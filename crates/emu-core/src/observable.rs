//! Observability trait for inspecting component state.
//!
//! The ACIA, the serial ULA and the tape deck all expose their registers and
//! counters through string paths so that the CLI and the tests can inspect
//! them without reaching into private fields. Queries never affect state.

use std::fmt;

/// A dynamically-typed value for state queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    /// Registers. Displayed as `0xNN`.
    U8(u8),
    /// Error codes.
    U16(u16),
    /// Dividers and counters.
    U32(u32),
    /// Tape positions in 1/1200 s ticks.
    I32(i32),
    /// State names, framing labels and tone characters.
    String(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v:#04X}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    i32 => I32,
    String => String,
}

impl From<char> for Value {
    fn from(v: char) -> Self {
        Value::String(v.to_string())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

/// A component whose state can be inspected.
///
/// Between polls any chip or the deck can be inspected.
pub trait Observable {
    /// Query a specific property by path.
    ///
    /// Paths are hierarchical, separated by dots:
    /// - `control` - Control register
    /// - `status.rdrf` - Receive data register full
    /// - `elapsed` - Tape position in 1/1200 s ticks
    ///
    /// Returns `None` if the path is not recognised.
    fn query(&self, path: &str) -> Option<Value>;

    /// Paths that can be passed to [`query`](Self::query).
    fn query_paths(&self) -> &'static [&'static str];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_display_as_hex() {
        assert_eq!(Value::U8(0x14).to_string(), "0x14");
        assert_eq!(Value::I32(-1).to_string(), "-1");
        assert_eq!(Value::U16(404).to_string(), "404");
        assert_eq!(Value::from('S').to_string(), "S");
    }
}
