//! The virtual cassette deck.
//!
//! [`TapeState`] holds up to three copies of the tape (one per container
//! format), the read position counters and the recorder's accumulators. A
//! loaded file lives in exactly one format; a blank tape records into all
//! three at once so that the user can save in whichever format they like.
//!
//! Everything that touches the ACIA or the ULA lives on
//! [`EmulatorState`](crate::EmulatorState); the deck only knows about tape.

use emu_core::{Observable, Value};

use crate::backend::{FormatSet, TapeBackend, TapeFormat, ToneRead};
use crate::error::{Result, TapeError};
use crate::format::{CswTape, TibetTape, UefTape};
use crate::interval::IntervalList;
use crate::read::ReadState;
use crate::tone::Tone;
use crate::write::WriteState;
use crate::TICK_S;

/// Leader runs shorter than this are read back as ordinary one bits.
pub const SHORT_LEADER_FOLD: u32 = 10;
/// Ticks of carrier while awaiting a start bit before a one is called leader.
pub const CRUDE_LEADER_DETECT: u32 = 100;
/// Ticks of tone required after silence before a start bit is believed.
pub const SQUAWK_PROTECT: u32 = 100;

/// Split a tick count into hours, minutes and seconds.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn to_hms(ticks: i32) -> (i32, i32, i32) {
    let secs = (f64::from(ticks) * TICK_S) as i32;
    let mins = secs / 60;
    (mins / 60, mins % 60, secs % 60)
}

/// Tape contents plus the deck's read and write bookkeeping.
#[derive(Debug, Clone)]
pub struct TapeState {
    pub(crate) formats: FormatSet,
    pub(crate) uef: UefTape,
    pub(crate) csw: CswTape,
    pub(crate) tibet: TibetTape,
    pub(crate) rx: ReadState,
    pub(crate) wr: WriteState,
    /// Seek index and scrub-bar stripes.
    pub(crate) intervals: IntervalList,
    /// Running tape position in ticks.
    pub(crate) tallied: i32,
    /// Sticky error; no tape I/O happens until the tape is ejected.
    pub(crate) prior_exception: Option<TapeError>,
    finished_warned: bool,
    desync_warned: bool,
}

impl TapeState {
    /// An empty deck with no tape in it.
    #[must_use]
    pub fn new() -> Self {
        Self {
            formats: FormatSet::EMPTY,
            uef: UefTape::new(),
            csw: CswTape::new(),
            tibet: TibetTape::new(),
            rx: ReadState::default(),
            wr: WriteState::default(),
            intervals: IntervalList::new(),
            tallied: 0,
            prior_exception: None,
            finished_warned: false,
            desync_warned: false,
        }
    }

    /// Replace the deck's contents with a freshly decoded file.
    pub fn insert_uef(&mut self, uef: UefTape) {
        self.finish();
        self.uef = uef;
        self.formats = FormatSet::only(TapeFormat::Uef);
    }

    pub fn insert_csw(&mut self, csw: CswTape) {
        self.finish();
        self.csw = csw;
        self.formats = FormatSet::only(TapeFormat::Csw);
    }

    pub fn insert_tibet(&mut self, tibet: TibetTape) {
        self.finish();
        self.tibet = tibet;
        self.formats = FormatSet::only(TapeFormat::Tibet);
    }

    #[must_use]
    pub fn formats(&self) -> FormatSet {
        self.formats
    }

    #[must_use]
    pub fn uef(&self) -> &UefTape {
        &self.uef
    }

    #[must_use]
    pub fn csw(&self) -> &CswTape {
        &self.csw
    }

    #[must_use]
    pub fn tibet(&self) -> &TibetTape {
        &self.tibet
    }

    #[must_use]
    pub fn intervals(&self) -> &IntervalList {
        &self.intervals
    }

    /// Current tape position in ticks.
    #[must_use]
    pub fn tallied(&self) -> i32 {
        self.tallied
    }

    #[must_use]
    pub fn prior_exception(&self) -> Option<&TapeError> {
        self.prior_exception.as_ref()
    }

    /// The tone most recently presented to the receiver.
    #[must_use]
    pub fn prevailing(&self) -> Option<Tone> {
        self.rx.prevailing
    }

    pub(crate) fn backend(&self, format: TapeFormat) -> &dyn TapeBackend {
        match format {
            TapeFormat::Uef => &self.uef,
            TapeFormat::Csw => &self.csw,
            TapeFormat::Tibet => &self.tibet,
        }
    }

    pub(crate) fn backend_mut(&mut self, format: TapeFormat) -> &mut dyn TapeBackend {
        match format {
            TapeFormat::Uef => &mut self.uef,
            TapeFormat::Csw => &mut self.csw,
            TapeFormat::Tibet => &mut self.tibet,
        }
    }

    /// Run `op` against every loaded copy, stopping at the first error.
    pub(crate) fn for_each_copy(
        &mut self,
        mut op: impl FnMut(&mut dyn TapeBackend) -> Result<()>,
    ) -> Result<()> {
        for format in self.formats.iter() {
            op(self.backend_mut(format))?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Position
    // -----------------------------------------------------------------------

    /// Tape length in ticks. UEF is preferred, then TIBET, then CSW.
    pub fn duration(&self) -> Result<i32> {
        if self.prior_exception.is_some() {
            return Err(TapeError::bug(
                "duration is called even though tape is disabled!",
            ));
        }
        let f = self.formats;
        Ok(if f.contains(TapeFormat::Uef) {
            self.uef.duration()
        } else if f.contains(TapeFormat::Tibet) {
            self.tibet.duration()
        } else if f.contains(TapeFormat::Csw) {
            self.csw.duration()
        } else {
            0
        })
    }

    /// Anything on any copy worth cataloguing.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.prior_exception.is_none()
            && self.formats.iter().any(|f| self.backend(f).has_data())
    }

    #[must_use]
    pub fn peek_eof(&self) -> bool {
        self.formats
            .authoritative()
            .is_none_or(|f| self.backend(f).peek_eof())
    }

    /// Return every copy to the start.
    pub fn rewind(&mut self) {
        for format in self.formats.iter() {
            self.backend_mut(format).rewind();
        }
        self.finished_warned = false;
        self.tallied = 0;
    }

    /// Park every copy past its last piece, ready for appending.
    pub fn ffwd_to_end(&mut self) -> Result<()> {
        self.for_each_copy(|b| b.ffwd_to_end())?;
        self.finished_warned = true;
        Ok(())
    }

    /// Drop the tape's contents, leaving a blank tape that can record into
    /// every format.
    pub fn finish(&mut self) {
        self.uef.clear();
        self.csw.clear();
        self.tibet.clear();
        self.formats = FormatSet::ALL;
        self.wr = WriteState::default();
        self.rx.tones300.clear();
        self.rx.prevailing = Some(Tone::Silence);
        self.tallied = 0;
        self.prior_exception = None;
    }

    /// Independent copy of the tape, rewound, for cataloguing and export.
    #[must_use]
    pub fn clone_and_rewind(&self) -> Self {
        let mut out = self.clone();
        out.wr = WriteState::default();
        out.rx = ReadState::default();
        out.rewind();
        // Scanning the copy shouldn't log end-of-tape.
        out.finished_warned = true;
        out
    }

    /// Log the first time a seek leaves secondary copies rewound.
    pub(crate) fn note_desync(&mut self) {
        if !self.desync_warned {
            log::warn!("tape: seek desyncs across parallel copies");
            self.desync_warned = true;
        }
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// One raw tick from the authoritative copy. `None` is end of tape.
    pub fn read_tone(&mut self, initial_scan: bool) -> Result<Option<ToneRead>> {
        let read = match self.formats.authoritative() {
            Some(format) => self.backend_mut(format).read_tone(initial_scan)?,
            None => None,
        };
        if read.is_some() {
            self.finished_warned = false;
        } else {
            if !self.finished_warned {
                if initial_scan {
                    let d = self.duration()?;
                    let (h, m, s) = to_hms(d);
                    log::info!("tape: duration {d} ({h}:{m:02}:{s:02})");
                } else {
                    log::warn!("tape: tape finished");
                }
            }
            self.finished_warned = true;
        }
        Ok(read)
    }

    /// One tick as the receiver should see it.
    ///
    /// Short leader runs are folded back to ones. While the receiver waits
    /// for a start bit, long carrier becomes leader and, if
    /// `phantom_protect` is set, tone arriving soon after silence is forced
    /// to leader so it can't start a frame. With `strip`, leader and
    /// silence are skipped entirely.
    pub fn tone_from_back_end(
        &mut self,
        strip: bool,
        awaiting_start: bool,
        phantom_protect: bool,
    ) -> Result<Option<ToneRead>> {
        let mut inhibit = false;
        loop {
            let Some(read) = self.read_tone(false)? else {
                self.rx.leader_skip = 0;
                return Ok(None);
            };
            let mut tone = read.tone;

            if tone.breaks_carrier() {
                self.rx.leader_skip = 0;
            } else if tone == Tone::Leader && self.rx.leader_skip < SHORT_LEADER_FOLD {
                self.rx.leader_skip += 1;
                tone = Tone::One;
            }

            if awaiting_start {
                if self.rx.start_bit_wait > CRUDE_LEADER_DETECT && tone == Tone::One {
                    tone = Tone::Leader;
                }
                if !strip {
                    if tone == Tone::Silence {
                        self.rx.since_silence = 0;
                    } else if self.rx.since_silence < SQUAWK_PROTECT {
                        self.rx.since_silence += 1;
                        inhibit = true;
                    }
                }
                self.rx.start_bit_wait += 1;
            } else {
                self.rx.start_bit_wait = 0;
            }
            if tone.breaks_carrier() {
                self.rx.start_bit_wait = 0;
            }

            let skip = strip && matches!(tone, Tone::Leader | Tone::Silence);
            if !skip {
                if inhibit && phantom_protect {
                    tone = Tone::Leader;
                }
                return Ok(Some(ToneRead::new(tone, read.elapsed)));
            }
        }
    }

    /// Advance the tally after a tick was read: jump to the back end's
    /// timestamp when it has one, otherwise count the tick.
    pub(crate) fn update_elapsed(&mut self, elapsed: Option<i32>) {
        match elapsed {
            Some(t) => self.tallied = t,
            None => self.tallied += 1,
        }
    }
}

impl Default for TapeState {
    fn default() -> Self {
        Self::new()
    }
}

impl Observable for TapeState {
    fn query(&self, path: &str) -> Option<Value> {
        match path {
            "elapsed" => Some(self.tallied.into()),
            "formats" => Some(self.formats.bits().into()),
            "prevailing" => Some(self.rx.prevailing.map_or('-', Tone::as_char).into()),
            "eof" => Some(self.peek_eof().into()),
            "error" => Some(self.prior_exception.as_ref().map_or(0, TapeError::code).into()),
            "intervals" => Some((self.intervals.len() as u32).into()),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &["elapsed", "formats", "prevailing", "eof", "error", "intervals"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Timespan, WriteOptions};

    fn tibet_tape(body: &str) -> TapeState {
        let text = format!("tibet 0.5\n{body}");
        let tibet = TibetTape::decode(text.as_bytes()).expect("valid TIBET");
        let mut deck = TapeState::new();
        deck.insert_tibet(tibet);
        deck
    }

    fn drain(deck: &mut TapeState, strip: bool, awaiting: bool, protect: bool) -> String {
        let mut out = String::new();
        while let Some(r) = deck
            .tone_from_back_end(strip, awaiting, protect)
            .expect("read")
        {
            out.push(r.tone.as_char());
        }
        out
    }

    #[test]
    fn hms_split() {
        assert_eq!(to_hms(0), (0, 0, 0));
        assert_eq!(to_hms(4_478_000), (1, 2, 5));
    }

    #[test]
    fn empty_deck_reads_eof_and_zero_duration() {
        let mut deck = TapeState::new();
        assert_eq!(deck.read_tone(false).expect("read"), None);
        assert_eq!(deck.duration().expect("duration"), 0);
        assert!(deck.peek_eof());
        assert!(!deck.has_data());
    }

    #[test]
    fn short_leader_reads_as_ones() {
        let mut deck = tibet_tape("leader 24\n");
        let tones = drain(&mut deck, false, false, false);
        assert_eq!(tones, "1111111111LL");
    }

    #[test]
    fn strip_skips_silence_and_leader() {
        let mut deck = tibet_tape("silence 0.01\nleader 24\n");
        let tones = drain(&mut deck, true, false, false);
        assert_eq!(tones, "1111111111");
    }

    fn squawk_after_silence(ones: usize) -> String {
        let body = format!("silence 0.01\ndata\n{}--\nend\n", "..".repeat(ones));
        let mut deck = tibet_tape(&body);
        drain(&mut deck, false, true, true)
            .trim_start_matches('S')
            .to_string()
    }

    #[test]
    fn start_bit_soon_after_silence_is_suppressed() {
        let tones = squawk_after_silence(49);
        assert_eq!(tones, "L".repeat(50));
    }

    #[test]
    fn start_bit_after_enough_carrier_is_eligible() {
        let tones = squawk_after_silence(100);
        assert_eq!(tones, format!("{}0", "L".repeat(100)));
        // Past the crude detector, carrier reads as leader too.
        let tones = squawk_after_silence(102);
        assert_eq!(tones, format!("{}1L0", "L".repeat(100)));
    }

    #[test]
    fn finish_leaves_blank_tape_in_every_format() {
        let mut deck = tibet_tape("leader 5\n");
        deck.finish();
        assert_eq!(deck.formats(), FormatSet::ALL);
        assert_eq!(deck.duration().expect("duration"), 0);
        assert_eq!(deck.prevailing(), Some(Tone::Silence));
    }

    #[test]
    fn duration_faults_when_disabled() {
        let mut deck = TapeState::new();
        deck.prior_exception = Some(TapeError::bug("test"));
        assert_eq!(deck.duration().map_err(|e| e.code()), Err(3));
    }

    #[test]
    fn clone_and_rewind_is_independent() {
        let mut deck = TapeState::new();
        deck.finish();
        deck.for_each_copy(|b| {
            b.append_leader(Some(0), 40)?;
            b.append_silence(0.1, Timespan::new(40, 120), &WriteOptions::default())
        })
        .expect("write");
        let mut copy = deck.clone_and_rewind();
        let tones = drain(&mut copy, false, false, false);
        assert_eq!(tones.len(), 160);
        assert_eq!(deck.duration().expect("duration"), 160);
    }

    #[test]
    fn deck_state_is_observable() {
        let mut deck = tibet_tape("leader 40\n");
        assert_eq!(deck.query("formats"), Some(Value::U8(TapeFormat::Tibet.bit())));
        assert_eq!(deck.query("elapsed"), Some(Value::I32(0)));
        assert_eq!(deck.query("error"), Some(Value::U16(0)));
        deck.prior_exception = Some(TapeError::bug("test"));
        assert_eq!(deck.query("error"), Some(Value::U16(3)));
        assert_eq!(deck.query("nonsense"), None);
        assert!(deck.query_paths().contains(&"prevailing"));
    }
}
