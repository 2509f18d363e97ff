//! The seam between the deck and the container formats.
//!
//! A deck may hold up to three copies of the same tape at once: whatever was
//! loaded, or (for a blank tape being recorded) all three formats in
//! parallel. Reading and seeking use a single authoritative copy, chosen by
//! [`TapeFormat::PRIORITY`]; writing fans out to every loaded copy.

use motorola_6850::SerialFraming;

use crate::error::Result;
use crate::tone::Tone;

/// One of the supported container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapeFormat {
    Uef,
    Csw,
    Tibet,
}

impl TapeFormat {
    /// Order in which copies are consulted for reading, seeking and
    /// duration.
    pub const PRIORITY: [Self; 3] = [Self::Uef, Self::Csw, Self::Tibet];

    #[must_use]
    pub const fn bit(self) -> u8 {
        match self {
            Self::Uef => 1,
            Self::Tibet => 2,
            Self::Csw => 4,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Uef => "UEF",
            Self::Csw => "CSW",
            Self::Tibet => "TIBET",
        }
    }
}

impl std::fmt::Display for TapeFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of formats currently holding the tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatSet(u8);

impl FormatSet {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(7);

    #[must_use]
    pub const fn only(format: TapeFormat) -> Self {
        Self(format.bit())
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, format: TapeFormat) -> bool {
        self.0 & format.bit() != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// A file was loaded (as opposed to no tape, or a blank tape recording
    /// into every format).
    #[must_use]
    pub const fn is_loaded_file(self) -> bool {
        self.0 != 0 && self.0 != Self::ALL.0
    }

    #[must_use]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Highest-priority member, if any.
    #[must_use]
    pub fn authoritative(self) -> Option<TapeFormat> {
        TapeFormat::PRIORITY.into_iter().find(|f| self.contains(*f))
    }

    pub fn iter(self) -> impl Iterator<Item = TapeFormat> {
        TapeFormat::PRIORITY
            .into_iter()
            .filter(move |f| self.contains(*f))
    }
}

/// Start tick and length of a piece (UEF chunk, CSW pulse or TIBET span).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespan {
    pub start: i32,
    pub len: i32,
}

impl Timespan {
    #[must_use]
    pub const fn new(start: i32, len: i32) -> Self {
        Self { start, len }
    }

    #[must_use]
    pub const fn end(&self) -> i32 {
        self.start + self.len
    }
}

/// A tick read from a back end. `elapsed` is set when the back end knows
/// exactly where on the tape the tick falls (usually at a piece boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToneRead {
    pub tone: Tone,
    pub elapsed: Option<i32>,
}

impl ToneRead {
    #[must_use]
    pub const fn new(tone: Tone, elapsed: Option<i32>) -> Self {
        Self { tone, elapsed }
    }
}

/// Knobs that only affect how UEF output is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOptions {
    /// Emit a &117 baud chunk before every data chunk.
    pub always_117: bool,
    /// Write silence as integer &112 rather than float &116.
    pub prefer_112: bool,
    /// Suppress the &0000 origin chunk.
    pub no_origin: bool,
}

/// Everything the deck needs from a container format.
///
/// Time is in 1/1200 s ticks throughout. `initial_scan` reads also fill in
/// each piece's [`Timespan`], which later makes seeking possible.
pub trait TapeBackend {
    fn format(&self) -> TapeFormat;

    // -- reading ------------------------------------------------------------

    /// Next tick, or `None` at end of tape.
    fn read_tone(&mut self, initial_scan: bool) -> Result<Option<ToneRead>>;

    fn peek_eof(&self) -> bool;

    /// Anything worth cataloguing on this copy.
    fn has_data(&self) -> bool;

    fn rewind(&mut self);

    /// Move the read position past the last piece.
    fn ffwd_to_end(&mut self) -> Result<()>;

    /// Length of the tape in ticks, taken from the final piece's span.
    fn duration(&self) -> i32;

    fn num_pieces(&self) -> usize;

    fn piece_span(&self, ix: usize) -> Result<Timespan>;

    /// Reposition the reader at the start of piece `ix`.
    fn seek_to_piece(&mut self, ix: usize) -> Result<()>;

    // -- writing ------------------------------------------------------------

    /// Open a data section starting at tick `start`.
    fn begin_data(&mut self, start: i32, framing: &SerialFraming, opts: &WriteOptions)
    -> Result<()>;

    /// One data tick. `at` is the tape duration before the tick.
    fn append_data_tone(&mut self, bit: bool, at: i32, framing: &SerialFraming) -> Result<()>;

    /// Close the data section; `tallied` is the deck's tick count.
    fn end_data(&mut self, tallied: i32) -> Result<()>;

    /// `ticks` of leader starting at `start` (`None` leaves the span to be
    /// filled in by a later scan).
    fn append_leader(&mut self, start: Option<i32>, ticks: u32) -> Result<()>;

    /// `secs` of silence occupying `span` on the tape.
    fn append_silence(&mut self, secs: f32, span: Timespan, opts: &WriteOptions) -> Result<()>;

    /// Serialise to the on-disk format. `compress` only matters for formats
    /// that compress their body internally (CSW); outer gzip is the
    /// caller's job.
    fn build_output(&self, compress: bool) -> Result<Vec<u8>>;

    /// Forget everything.
    fn clear(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authoritative_follows_priority() {
        assert_eq!(FormatSet::ALL.authoritative(), Some(TapeFormat::Uef));
        let set = FormatSet(TapeFormat::Csw.bit() | TapeFormat::Tibet.bit());
        assert_eq!(set.authoritative(), Some(TapeFormat::Csw));
        assert_eq!(FormatSet::EMPTY.authoritative(), None);
    }

    #[test]
    fn blank_tape_is_not_a_loaded_file() {
        assert!(!FormatSet::ALL.is_loaded_file());
        assert!(!FormatSet::EMPTY.is_loaded_file());
        assert!(FormatSet::only(TapeFormat::Tibet).is_loaded_file());
        assert_eq!(FormatSet::ALL.len(), 3);
        assert_eq!(FormatSet::ALL.iter().count(), 3);
    }
}
