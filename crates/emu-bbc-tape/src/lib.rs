//! BBC Micro cassette subsystem.
//!
//! Models the path from the 6850 ACIA through the serial ULA to a virtual
//! cassette deck holding UEF, CSW or TIBET images. The host drives
//! everything through [`EmulatorState::poll`] at the 2 MHz bus rate; the
//! ULA divides that into receive, transmit and carrier-detect clocks, and
//! each edge moves the deck's read or write machinery on by one bit.
//!
//! Time on tape is counted in 1/1200 s ticks. A tick carries one [`Tone`]:
//! 1200 Hz, 2400 Hz, leader carrier or silence.

pub mod backend;
pub mod catalogue;
pub mod codec;
pub mod config;
pub mod deck;
pub mod error;
pub mod format;
pub mod interval;
pub mod io;
pub mod machine;
pub mod noise;
mod read;
pub mod savestate;
mod seek;
pub mod tone;
pub mod transport;
pub mod wav;
mod write;

pub use backend::{FormatSet, TapeBackend, TapeFormat, Timespan, ToneRead, WriteOptions};
pub use catalogue::CatalogueEntry;
pub use config::TapeConfig;
pub use deck::TapeState;
pub use error::{Fault, Recoverable, Result, TapeError};
pub use interval::{Interval, IntervalKind, IntervalList};
pub use machine::{EmulatorState, QuitReason};
pub use noise::TapeNoise;
pub use read::Tones300;
pub use tone::Tone;

/// One tick in nanoseconds (1/1200 s at the ULA's 16/13 MHz clock).
pub const TICK_NS: i64 = 832_000;
/// One tick in seconds.
pub const TICK_S: f64 = 0.000_832;
/// Ticks per second.
pub const TAPE_1200_HZ: f64 = 1.0 / TICK_S;

/// Seeks land at least this many ticks before the end of the tape.
pub const SEEK_END_BACKOFF: i32 = 120;
