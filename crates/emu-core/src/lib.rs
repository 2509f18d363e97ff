//! Core traits and types shared by the cassette emulation crates.
//!
//! Everything is clocked from the host's 2 MHz bus. Tape time is measured in
//! 1/1200 s ticks, which is 1664 bus cycles; the conversions live here so
//! that the chip crates and the tape crate agree on them.

mod clock;
mod observable;
mod tickable;
mod ticks;

pub use clock::MasterClock;
pub use observable::{Observable, Value};
pub use tickable::Tickable;
pub use ticks::{BUS_CYCLES_PER_1200TH, Ticks};
