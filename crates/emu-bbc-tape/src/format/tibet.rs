//! TIBET: a plain-text tape format.
//!
//! # Format
//!
//! ```text
//! tibet 0.5
//!
//! leader 3000          # 2400 Hz cycles
//! /baud 1200           # hints apply to the next span
//! /framing 8N1
//! data
//! -........-
//! end
//!
//! silence 1.500000     # seconds
//! ```
//!
//! In a data span each `.` is half a tick of 2400 Hz, each `-` half a tick of
//! 1200 Hz and `P` a lone pulse, which readers skip. Two matching half-ticks
//! make one tick. `squawk` is a data span that does not carry a block.
//! TIBETZ is the same text, gzipped.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use std::fmt::Write as _;

use motorola_6850::SerialFraming;

use crate::TICK_S;
use crate::backend::{TapeBackend, TapeFormat, Timespan, ToneRead, WriteOptions};
use crate::error::{Result, TapeError, TibetError, TibetErrorKind as Kind};
use crate::tone::Tone;

pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 5;

const VERSION_MAX_LEN: usize = 11;
const VERSION_PORTION_MAX_LEN: usize = 5;
const MAX_SPANS: usize = 1_000_000;
const MAX_SPAN_TONES: usize = 17_000_000;
const MAX_LEADER_CYCLES: u32 = 100_000_000;
const MAX_OUTPUT_LEN: usize = 100 * 1024 * 1024;
const DECIMAL_MAX_CHARS: usize = 50;

const SILENCE_LEN_MIN: f32 = 0.0004;
const SILENCE_LEN_MAX: f32 = 36_000.0;
const TIME_HINT_MAX: f32 = 36_000.0;
const SPEED_HINT_MIN: f32 = 0.5;
const SPEED_HINT_MAX: f32 = 1.5;

const FRAMINGS: [&str; 8] = ["7E2", "7O2", "7E1", "7O1", "8N2", "8N1", "8E1", "8O1"];
const BAUDS: [u32; 5] = [75, 150, 300, 600, 1200];

// ---------------------------------------------------------------------------
// Spans
// ---------------------------------------------------------------------------

/// Optional `/xxx` lines attached to the following span.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpanHints {
    pub baud: Option<u32>,
    pub framing: Option<String>,
    pub time: Option<f32>,
    pub phase: Option<u32>,
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpanKind {
    Silence { secs: f32 },
    /// Count of 2400 Hz cycles.
    Leader { cycles: u32 },
    Data { squawk: bool, tones: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub kind: SpanKind,
    pub hints: SpanHints,
    pub timespan: Timespan,
    sub_pos_4800ths: u8,
}

impl Span {
    fn new(kind: SpanKind, hints: SpanHints) -> Self {
        Self {
            kind,
            hints,
            timespan: Timespan::default(),
            sub_pos_4800ths: 0,
        }
    }

    /// Half a tick has gone by.
    fn advance_elapsed(&mut self) {
        self.sub_pos_4800ths += 2;
        while self.sub_pos_4800ths >= 4 {
            self.sub_pos_4800ths -= 4;
            self.timespan.len += 1;
        }
    }
}

fn packet_len(framing: &str) -> usize {
    let b = framing.as_bytes();
    1 + if b[0] == b'7' { 7 } else { 8 } + usize::from(b[1] != b'N') + if b[2] == b'1' { 1 } else { 2 }
}

// ---------------------------------------------------------------------------
// Field parsers
// ---------------------------------------------------------------------------

fn parse_version(line: usize, word1: &str, word2: Option<&str>) -> std::result::Result<(u32, u32), TibetError> {
    let err = |kind| TibetError::new(line, kind);
    let Some(v) = word2 else {
        log::warn!("TIBET: line {line}: no space in version line: \"{word1}\"");
        return Err(err(Kind::VersionLineNoSpace));
    };
    if word1 != "tibet" {
        log::warn!("TIBET: line {line}: bad version word: \"{word1}\"");
        return Err(err(Kind::VersionLine));
    }
    let len = v.len();
    if !(3..=VERSION_MAX_LEN).contains(&len) {
        log::warn!("TIBET: line {line}: version has bad length: \"{v}\"");
        return Err(err(Kind::VersionBadLength));
    }
    let mut points = 0;
    let mut dp = 0;
    for (i, c) in v.bytes().enumerate() {
        if i > 0 && i < len - 1 && c == b'.' {
            dp = i;
            points += 1;
        } else if !c.is_ascii_digit() {
            log::warn!("TIBET: line {line}: version non-numeric: \"{v}\"");
            return Err(err(Kind::VersionNonNumeric));
        }
    }
    if points != 1 {
        log::warn!("TIBET: line {line}: version has bad decimal point: \"{v}\"");
        return Err(err(Kind::VersionNoDecimalPoint));
    }
    if dp > VERSION_PORTION_MAX_LEN || len - (dp + 1) > VERSION_PORTION_MAX_LEN {
        log::warn!("TIBET: line {line}: version portion is too long: \"{v}\"");
        return Err(err(Kind::VersionBadLength));
    }
    let major = v[..dp].parse().map_err(|_| err(Kind::VersionNonNumeric))?;
    let minor = v[dp + 1..].parse().map_err(|_| err(Kind::VersionNonNumeric))?;
    Ok((major, minor))
}

fn parse_int(line: usize, v: Option<&str>) -> std::result::Result<u32, TibetError> {
    let v = v.unwrap_or_default();
    if v.is_empty() {
        log::warn!("TIBET: line {line}: integer is void");
        return Err(TibetError::new(line, Kind::IntParse));
    }
    if v.len() > 10 {
        log::warn!("TIBET: line {line}: integer value is too long: \"{v}\"");
        return Err(TibetError::new(line, Kind::IntTooLong));
    }
    if !v.bytes().all(|c| c.is_ascii_digit()) {
        log::warn!("TIBET: line {line}: integer value has illegal char: \"{v}\"");
        return Err(TibetError::new(line, Kind::IntBadChar));
    }
    v.parse().map_err(|_| {
        log::warn!("TIBET: line {line}: bad integer: \"{v}\"");
        TibetError::new(line, Kind::IntParse)
    })
}

fn parse_float(line: usize, v: Option<&str>) -> std::result::Result<f32, TibetError> {
    let v = v.unwrap_or_default();
    if v.len() > DECIMAL_MAX_CHARS {
        log::warn!("TIBET: line {line}: decimal is too long (max. {DECIMAL_MAX_CHARS} chars): \"{v}\"");
        return Err(TibetError::new(line, Kind::DecimalTooLong));
    }
    let mut have_dp = false;
    for (n, c) in v.bytes().enumerate() {
        if c == b'.' {
            if have_dp {
                log::warn!("TIBET: line {line}: multiple decimal points in decimal: \"{v}\"");
                return Err(TibetError::new(line, Kind::MultipleDecimalPoints));
            }
            have_dp = true;
            if n == v.len() - 1 {
                log::warn!("TIBET: line {line}: decimal point at end of decimal: \"{v}\"");
                return Err(TibetError::new(line, Kind::PointEndsDecimal));
            }
        } else if !c.is_ascii_digit() {
            log::warn!("TIBET: line {line}: illegal character in decimal: \"{v}\"");
            return Err(TibetError::new(line, Kind::DecimalBadChar));
        }
    }
    v.parse().map_err(|_| {
        log::warn!("TIBET: line {line}: error parsing decimal: \"{v}\"");
        TibetError::new(line, Kind::DecimalParse)
    })
}

/// Split off the first word and trim trailing spaces.
fn tokenise(line: &str) -> (&str, Option<&str>) {
    let line = line.trim_end_matches(' ');
    match line.split_once(' ') {
        Some((w1, w2)) => (w1, Some(w2)),
        None => (line, None),
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Decoder {
    line: usize,
    version: Option<(u32, u32)>,
    hints: SpanHints,
    pending: Option<Span>,
    spans: Vec<Span>,
}

impl Decoder {
    fn err(&self, kind: Kind) -> TibetError {
        TibetError::new(self.line, kind)
    }

    fn push_span(&mut self, span: Span) -> std::result::Result<(), TibetError> {
        if self.spans.len() >= MAX_SPANS {
            log::warn!("TIBET: line {}: too many spans", self.line);
            return Err(self.err(Kind::TooManySpans));
        }
        self.spans.push(span);
        Ok(())
    }

    fn take_hints(&mut self) -> SpanHints {
        std::mem::take(&mut self.hints)
    }

    fn line(&mut self, raw: &str) -> std::result::Result<(), TibetError> {
        let text = raw.split('#').next().unwrap_or_default();
        if text.is_empty() {
            return Ok(());
        }
        let (word1, word2) = tokenise(text);

        let Some(version) = self.version else {
            let (major, minor) = parse_version(self.line, word1, word2)?;
            if major != VERSION_MAJOR {
                log::warn!("TIBET: line {}: file major version ({major}) incompatible with decoder ({VERSION_MAJOR})", self.line);
                return Err(self.err(Kind::VersionMajor));
            }
            if minor > VERSION_MINOR {
                log::warn!("TIBET: line {}: file minor version ({minor}) is newer than this decoder's ({VERSION_MINOR})", self.line);
                return Err(self.err(Kind::VersionMinor));
            }
            self.version = Some((major, minor));
            return Ok(());
        };

        if self.pending.is_some() {
            self.data_line(word1, word2)
        } else {
            self.metadata_line(version, word1, word2)
        }
    }

    fn metadata_line(
        &mut self,
        version: (u32, u32),
        word1: &str,
        word2: Option<&str>,
    ) -> std::result::Result<(), TibetError> {
        let line = self.line;
        match word1 {
            "tibet" => {
                // a concatenated file
                let again = parse_version(line, word1, word2)?;
                if again != version {
                    log::warn!(
                        "TIBET: line {line}: tibet mismatch: {}.{} vs. {}.{}",
                        again.0,
                        again.1,
                        version.0,
                        version.1
                    );
                    return Err(self.err(Kind::ConcatVersionMismatch));
                }
                self.hints.baud = None;
                self.hints.framing = None;
            }
            "silence" => {
                let clash = [
                    ("/baud", self.hints.baud.is_some()),
                    ("/framing", self.hints.framing.is_some()),
                    ("/speed", self.hints.speed.is_some()),
                    ("/phase", self.hints.phase.is_some()),
                ];
                if let Some((name, _)) = clash.iter().find(|(_, set)| *set) {
                    log::warn!("TIBET: line {line}: {name} hint illegally supplied for silent span");
                    return Err(self.err(Kind::FieldIncompatible));
                }
                let secs = parse_float(line, word2)?;
                // very short silences are legal but skipped
                if secs < SILENCE_LEN_MIN {
                    return Ok(());
                }
                if secs > SILENCE_LEN_MAX {
                    log::warn!("TIBET: line {line}: silence has excessive length: \"{secs}\"");
                    return Err(self.err(Kind::LongSilence));
                }
                let hints = self.take_hints();
                self.push_span(Span::new(SpanKind::Silence { secs }, hints))?;
            }
            "leader" => {
                if word2.is_none() {
                    log::warn!("TIBET: line {line}: leader has missing value field");
                    return Err(self.err(Kind::EmptyLeader));
                }
                let clash = [
                    ("/baud", self.hints.baud.is_some()),
                    ("/framing", self.hints.framing.is_some()),
                    ("/phase", self.hints.phase.is_some()),
                ];
                if let Some((name, _)) = clash.iter().find(|(_, set)| *set) {
                    log::warn!("TIBET: line {line}: {name} hint illegally supplied for leader span");
                    return Err(self.err(Kind::FieldIncompatible));
                }
                let cycles = parse_int(line, word2)?;
                if cycles > MAX_LEADER_CYCLES {
                    log::warn!("TIBET: line {line}: illegal leader length: {cycles}");
                    return Err(self.err(Kind::LongLeader));
                }
                let hints = self.take_hints();
                self.push_span(Span::new(SpanKind::Leader { cycles: cycles.max(2) }, hints))?;
            }
            "/baud" => {
                if self.hints.baud.is_some() {
                    return Err(self.duplicate("/baud", Kind::DuplicateBaud));
                }
                let baud = parse_int(line, word2)?;
                if !BAUDS.contains(&baud) {
                    log::warn!("TIBET: line {line}: illegal /baud: {baud}");
                    return Err(self.err(Kind::BadBaud));
                }
                self.hints.baud = Some(baud);
            }
            "/framing" => {
                if self.hints.framing.is_some() {
                    return Err(self.duplicate("/framing", Kind::DuplicateFraming));
                }
                let framing = word2.unwrap_or_default();
                if !FRAMINGS.contains(&framing) {
                    log::warn!("TIBET: line {line}: illegal /framing: \"{framing}\"");
                    return Err(self.err(Kind::BadFraming));
                }
                self.hints.framing = Some(framing.to_owned());
            }
            "/time" => {
                if self.hints.time.is_some() {
                    return Err(self.duplicate("/time", Kind::DuplicateTime));
                }
                let time = parse_float(line, word2)?;
                if time > TIME_HINT_MAX {
                    log::warn!("TIBET: line {line}: /time is too large: {time}");
                    return Err(self.err(Kind::TimeHintTooLarge));
                }
                self.hints.time = Some(time);
            }
            "/phase" => {
                if self.hints.phase.is_some() {
                    return Err(self.duplicate("/phase", Kind::DuplicatePhase));
                }
                let phase = parse_int(line, word2)?;
                if ![0, 90, 180, 270].contains(&phase) {
                    log::warn!("TIBET: line {line}: illegal /phase: {phase}");
                    return Err(self.err(Kind::BadPhase));
                }
                self.hints.phase = Some(phase);
            }
            "/speed" => {
                if self.hints.speed.is_some() {
                    return Err(self.duplicate("/speed", Kind::DuplicateSpeed));
                }
                let speed = parse_float(line, word2)?;
                if speed >= SPEED_HINT_MAX {
                    log::warn!("TIBET: line {line}: /speed is too large: {speed}");
                    return Err(self.err(Kind::SpeedHintHigh));
                }
                if speed <= SPEED_HINT_MIN {
                    log::warn!("TIBET: line {line}: /speed is too small: {speed}");
                    return Err(self.err(Kind::SpeedHintLow));
                }
                self.hints.speed = Some(speed);
            }
            "data" | "squawk" => {
                if let Some(junk) = word2 {
                    log::warn!("TIBET: line {line}: junk follows {word1} keyword: \"{junk}\"");
                    return Err(self.err(Kind::JunkFollowsStart));
                }
                let kind = SpanKind::Data {
                    squawk: word1 == "squawk",
                    tones: Vec::new(),
                };
                let hints = self.take_hints();
                self.pending = Some(Span::new(kind, hints));
            }
            _ => {
                log::warn!("TIBET: line {line}: unrecognised: \"{word1}\"");
                return Err(self.err(Kind::UnknownWord));
            }
        }
        Ok(())
    }

    fn duplicate(&self, name: &str, kind: Kind) -> TibetError {
        log::warn!("TIBET: line {}: {name} specified twice for same span", self.line);
        self.err(kind)
    }

    fn data_line(&mut self, word1: &str, word2: Option<&str>) -> std::result::Result<(), TibetError> {
        if word1 == "end" {
            if let Some(span) = self.pending.take() {
                self.push_span(span)?;
            }
            return Ok(());
        }
        let mut chars: Vec<u8> = word1.bytes().collect();
        for c in word2.unwrap_or_default().bytes().filter(|&c| c != b' ') {
            if !matches!(c, b'.' | b'-' | b'P') {
                log::warn!("TIBET: line {}: junk follows data; illegal tone character: \"{}\"", self.line, char::from(c));
                return Err(self.err(Kind::JunkFollowsLine));
            }
            chars.push(c);
        }
        let line = self.line;
        let Some(Span {
            kind: SpanKind::Data { tones, .. },
            ..
        }) = self.pending.as_mut()
        else {
            return Ok(());
        };
        for c in chars {
            append_tonechar(tones, c).map_err(|kind| TibetError::new(line, kind))?;
        }
        Ok(())
    }

    fn finish(self) -> std::result::Result<(u32, u32, Vec<Span>), TibetError> {
        let version = match self.version {
            Some(v) if v != (0, 0) => v,
            _ => {
                log::warn!("TIBET: version line not found; this is not a valid TIBET file");
                return Err(TibetError::new(0, Kind::AbsentVersion));
            }
        };
        let dangling = [
            ("/time", self.hints.time.is_some(), Kind::DanglingTime),
            ("/phase", self.hints.phase.is_some(), Kind::DanglingPhase),
            ("/speed", self.hints.speed.is_some(), Kind::DanglingSpeed),
            ("/baud", self.hints.baud.is_some(), Kind::DanglingBaud),
            ("/framing", self.hints.framing.is_some(), Kind::DanglingFraming),
        ];
        if let Some((name, _, kind)) = dangling.into_iter().find(|(_, set, _)| *set) {
            log::warn!("TIBET: {name} following final span");
            return Err(TibetError::new(self.line, kind));
        }
        if self.pending.is_some() {
            log::warn!("TIBET: final data span has no end; discarding it");
        }
        Ok((version.0, version.1, self.spans))
    }
}

fn append_tonechar(tones: &mut Vec<u8>, c: u8) -> std::result::Result<(), Kind> {
    if !matches!(c, b'.' | b'-' | b'P') {
        log::warn!("TIBET: illegal tone character: \"{}\"", char::from(c));
        return Err(Kind::IllegalChar);
    }
    if tones.len() >= MAX_SPAN_TONES {
        log::warn!("TIBET: too many tone characters in span");
        return Err(Kind::ExcessiveTones);
    }
    if c == b'P' && tones.last() == Some(&b'P') {
        log::warn!("TIBET: illegal double pulse PP");
        return Err(Kind::DoublePulse);
    }
    tones.push(c);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tape
// ---------------------------------------------------------------------------

/// A TIBET tape: span list, read cursor and the data span being recorded.
#[derive(Debug, Clone)]
pub struct TibetTape {
    version: (u32, u32),
    spans: Vec<Span>,
    cur_span: usize,
    tone_pos: usize,
    silence_pos_s: f64,
    recording: Option<Span>,
}

impl Default for TibetTape {
    fn default() -> Self {
        Self::new()
    }
}

impl TibetTape {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: (VERSION_MAJOR, VERSION_MINOR),
            spans: Vec::new(),
            cur_span: 0,
            tone_pos: 0,
            silence_pos_s: 0.0,
            recording: None,
        }
    }

    /// Parse TIBET text (already inflated, for TIBETZ).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut dec = Decoder::default();
        for (n, raw) in buf.split(|&b| b == b'\n').enumerate() {
            dec.line = n + 1;
            if let Some(&bad) = raw.iter().find(|&&c| !(0x20..=0x7e).contains(&c)) {
                log::warn!("TIBET: illegal character 0x{bad:x}");
                return Err(dec.err(Kind::BadChar).into());
            }
            // printable ASCII is valid UTF-8
            let text = std::str::from_utf8(raw).map_err(|_| dec.err(Kind::BadChar))?;
            dec.line(text)?;
        }
        let (major, minor, spans) = dec.finish()?;
        Ok(Self {
            version: (major, minor),
            spans,
            ..Self::new()
        })
    }

    #[must_use]
    pub fn version(&self) -> (u32, u32) {
        self.version
    }

    #[must_use]
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    fn exhausted(&self, ix: usize) -> bool {
        match &self.spans[ix].kind {
            SpanKind::Silence { secs } => self.silence_pos_s >= f64::from(*secs),
            SpanKind::Leader { cycles } => self.tone_pos >= *cycles as usize,
            SpanKind::Data { tones, .. } => self.tone_pos >= tones.len(),
        }
    }

    /// Index of the span to read from, stepping past finished ones.
    fn current_span(&mut self, populate: bool) -> Option<usize> {
        loop {
            let ix = self.cur_span;
            if ix >= self.spans.len() {
                return None;
            }
            if !self.exhausted(ix) {
                return Some(ix);
            }
            if let Some(next) = self.spans.get(ix + 1).map(|s| s.timespan.start) {
                let predicted = self.spans[ix].timespan.end();
                if populate {
                    let s = &mut self.spans[ix + 1];
                    s.timespan = Timespan::new(predicted, 0);
                    s.sub_pos_4800ths = 0;
                } else if next > 0 && next != predicted {
                    log::warn!(
                        "TIBET: expected {predicted} 1200ths on new span but found {next} existing (span ix {})",
                        ix + 1
                    );
                }
            }
            self.cur_span += 1;
            self.tone_pos = 0;
            self.silence_pos_s = 0.0;
        }
    }

    /// One half-tick.
    fn next_tonechar(&mut self, populate: bool) -> Option<Tone> {
        loop {
            let ix = self.current_span(populate)?;
            let span = &mut self.spans[ix];
            let tone = match &span.kind {
                SpanKind::Data { tones, .. } => {
                    let c = tones[self.tone_pos];
                    self.tone_pos += 1;
                    if c == b'P' {
                        if populate {
                            span.advance_elapsed();
                        }
                        continue;
                    }
                    Tone::from_bit(c == b'.')
                }
                SpanKind::Silence { .. } => {
                    self.silence_pos_s += TICK_S / 2.0;
                    Tone::Silence
                }
                SpanKind::Leader { .. } => {
                    self.tone_pos += 1;
                    Tone::Leader
                }
            };
            if populate {
                span.advance_elapsed();
            }
            self.current_span(populate);
            return Some(tone);
        }
    }
}

impl TapeBackend for TibetTape {
    fn format(&self) -> TapeFormat {
        TapeFormat::Tibet
    }

    fn read_tone(&mut self, initial_scan: bool) -> Result<Option<ToneRead>> {
        let Some(mut first) = self.next_tonechar(initial_scan) else {
            return Ok(None);
        };
        loop {
            let Some(second) = self.next_tonechar(initial_scan) else {
                return Ok(None);
            };
            if first == second {
                return Ok(Some(ToneRead::new(first, None)));
            }
            // out of step: drop a half-tick and resynchronise
            first = second;
        }
    }

    fn peek_eof(&self) -> bool {
        self.cur_span >= self.spans.len()
    }

    fn has_data(&self) -> bool {
        self.spans
            .iter()
            .any(|s| matches!(s.kind, SpanKind::Data { .. }))
    }

    fn rewind(&mut self) {
        self.cur_span = 0;
        self.tone_pos = 0;
        self.silence_pos_s = 0.0;
    }

    fn ffwd_to_end(&mut self) -> Result<()> {
        self.cur_span = self.spans.len();
        Ok(())
    }

    fn duration(&self) -> i32 {
        self.spans.last().map_or(0, |s| s.timespan.end())
    }

    fn num_pieces(&self) -> usize {
        self.spans.len()
    }

    fn piece_span(&self, ix: usize) -> Result<Timespan> {
        self.spans.get(ix).map(|s| s.timespan).ok_or_else(|| {
            TapeError::bug(format!(
                "TIBET: bad span ix ({ix}, have {} spans)",
                self.spans.len()
            ))
        })
    }

    fn seek_to_piece(&mut self, ix: usize) -> Result<()> {
        if ix >= self.spans.len() {
            return Err(TapeError::bug(format!(
                "TIBET: change current span: bad span ix ({ix}, total {})",
                self.spans.len()
            )));
        }
        self.cur_span = ix;
        self.tone_pos = 0;
        self.silence_pos_s = 0.0;
        Ok(())
    }

    fn begin_data(&mut self, start: i32, framing: &SerialFraming, _opts: &WriteOptions) -> Result<()> {
        if self.recording.is_some() {
            return Err(TapeError::bug("tape: write: TIBET: data span already pending"));
        }
        let hints = SpanHints {
            baud: u32::try_from(framing.nominal_baud).ok(),
            framing: Some(framing.label()),
            ..SpanHints::default()
        };
        let mut span = Span::new(
            SpanKind::Data {
                squawk: false,
                tones: Vec::new(),
            },
            hints,
        );
        span.timespan = Timespan::new(start.max(0), 0);
        self.recording = Some(span);
        Ok(())
    }

    fn append_data_tone(&mut self, bit: bool, _at: i32, _framing: &SerialFraming) -> Result<()> {
        let Some(Span {
            kind: SpanKind::Data { tones, .. },
            ..
        }) = self.recording.as_mut()
        else {
            return Err(TapeError::bug("tape: write: TIBET: no data span pending"));
        };
        let c = if bit { b'.' } else { b'-' };
        for _ in 0..2 {
            append_tonechar(tones, c).map_err(|kind| TibetError::new(0, kind))?;
        }
        Ok(())
    }

    fn end_data(&mut self, tallied: i32) -> Result<()> {
        let Some(mut span) = self.recording.take() else {
            log::warn!("tape: write: warning: TIBET: discarding partial data span");
            return Ok(());
        };
        span.timespan.len = tallied - span.timespan.start;
        if self.spans.len() >= MAX_SPANS {
            return Err(TibetError::new(0, Kind::TooManySpans).into());
        }
        self.spans.push(span);
        Ok(())
    }

    fn append_leader(&mut self, start: Option<i32>, ticks: u32) -> Result<()> {
        if self.recording.is_some() {
            return Err(TapeError::bug("tape: write: TIBET: leader while data span pending"));
        }
        let cycles = ticks.saturating_mul(2).max(2);
        let mut span = Span::new(SpanKind::Leader { cycles }, SpanHints::default());
        if let Some(start) = start {
            span.timespan = Timespan::new(start.max(0), (cycles / 2) as i32);
        }
        self.spans.push(span);
        Ok(())
    }

    fn append_silence(&mut self, secs: f32, span: Timespan, _opts: &WriteOptions) -> Result<()> {
        let mut s = Span::new(SpanKind::Silence { secs }, SpanHints::default());
        s.timespan = span;
        self.spans.push(s);
        Ok(())
    }

    fn build_output(&self, _compress: bool) -> Result<Vec<u8>> {
        let mut out = String::new();
        let (major, minor) = self.version;
        // fmt::Write into a String cannot fail
        let _ = write!(out, "tibet {major}.{minor}\n\n");
        for (n, span) in self.spans.iter().enumerate() {
            match &span.kind {
                SpanKind::Leader { cycles } => {
                    let _ = write!(out, "leader {cycles}\n\n");
                }
                SpanKind::Silence { secs } => {
                    let _ = write!(out, "silence {secs:.6}\n\n");
                }
                SpanKind::Data { squawk, tones } => {
                    let h = &span.hints;
                    if let Some(baud) = h.baud {
                        let _ = writeln!(out, "/baud {baud}");
                    }
                    let mut per_line = 20;
                    if let Some(framing) = &h.framing {
                        let _ = writeln!(out, "/framing {framing}");
                        per_line = packet_len(framing) * 2;
                    }
                    if let Some(speed) = h.speed {
                        let _ = writeln!(out, "/speed {speed:.6}");
                    }
                    if let Some(time) = h.time {
                        let _ = writeln!(out, "/time {time:.6}");
                    }
                    if let Some(phase) = h.phase {
                        let _ = writeln!(out, "/phase {phase}");
                    }
                    out.push_str(if *squawk { "squawk\n" } else { "data\n" });
                    for (tn, &c) in tones.iter().enumerate() {
                        out.push(char::from(c));
                        if tn % per_line == per_line - 1 && tn + 1 < tones.len() {
                            out.push('\n');
                        }
                    }
                    out.push_str("\nend\n\n");
                }
            }
            if out.len() >= MAX_OUTPUT_LEN {
                log::warn!("TIBET: maximum output length exceeded at span {n}");
                return Err(TibetError::new(0, Kind::OpLen).into());
            }
        }
        Ok(out.into_bytes())
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> Result<TibetTape> {
        TibetTape::decode(text.as_bytes())
    }

    fn kind_of(text: &str) -> (usize, Kind) {
        match decode(text).unwrap_err() {
            TapeError::Recoverable(crate::error::Recoverable::Tibet(e)) => (e.line, e.kind),
            other => panic!("unexpected error {other:?}"),
        }
    }

    fn drain(tape: &mut TibetTape) -> String {
        let mut s = String::new();
        while let Some(r) = tape.read_tone(true).unwrap() {
            s.push(r.tone.as_char());
        }
        s
    }

    #[test]
    fn reads_leader_data_and_silence() {
        let text = "tibet 0.5\n\nleader 4\n/baud 1200\ndata\n--..\nP..--\nend\nsilence 0.002\n";
        let mut tape = decode(text).unwrap();
        assert_eq!(tape.spans().len(), 3);
        assert_eq!(tape.spans()[1].hints.baud, Some(1200));
        // 0.002 s is five half-ticks; the odd one never pairs up
        assert_eq!(drain(&mut tape), "LL0110SS");
        assert!(tape.peek_eof());
        assert_eq!(tape.piece_span(1).unwrap(), Timespan::new(2, 4));
        assert_eq!(tape.duration(), 8);
    }

    #[test]
    fn comments_and_concatenation() {
        let text = "tibet 0.5 # header\n# nothing\nleader 2\ntibet 0.5\nleader 2\n";
        let tape = decode(text).unwrap();
        assert_eq!(tape.spans().len(), 2);
        assert!(!tape.has_data());
        assert_eq!(kind_of("tibet 0.5\ntibet 0.4\n"), (2, Kind::ConcatVersionMismatch));
    }

    #[test]
    fn version_line_errors() {
        assert_eq!(kind_of("").1, Kind::AbsentVersion);
        assert_eq!(kind_of("tibet\n"), (1, Kind::VersionLineNoSpace));
        assert_eq!(kind_of("tibbet 0.5\n"), (1, Kind::VersionLine));
        assert_eq!(kind_of("tibet 055\n"), (1, Kind::VersionNoDecimalPoint));
        assert_eq!(kind_of("tibet 0.x\n"), (1, Kind::VersionNonNumeric));
        assert_eq!(kind_of("tibet 1.0\n"), (1, Kind::VersionMajor));
        assert_eq!(kind_of("tibet 0.9\n"), (1, Kind::VersionMinor));
        assert_eq!(kind_of("tibet 0.123456\n"), (1, Kind::VersionBadLength));
    }

    #[test]
    fn hint_errors() {
        assert_eq!(kind_of("tibet 0.5\n/baud 1200\n/baud 300\n"), (3, Kind::DuplicateBaud));
        assert_eq!(kind_of("tibet 0.5\n/baud 110\n"), (2, Kind::BadBaud));
        assert_eq!(kind_of("tibet 0.5\n/framing 9N1\n"), (2, Kind::BadFraming));
        assert_eq!(kind_of("tibet 0.5\n/phase 45\n"), (2, Kind::BadPhase));
        assert_eq!(kind_of("tibet 0.5\n/speed 1.5\n"), (2, Kind::SpeedHintHigh));
        assert_eq!(kind_of("tibet 0.5\n/speed 0.5\n"), (2, Kind::SpeedHintLow));
        assert_eq!(kind_of("tibet 0.5\n/time 99999\n"), (2, Kind::TimeHintTooLarge));
        assert_eq!(kind_of("tibet 0.5\n/baud 300\nsilence 1\n"), (3, Kind::FieldIncompatible));
        assert_eq!(kind_of("tibet 0.5\n/phase 90\nleader 3\n"), (3, Kind::FieldIncompatible));
        assert_eq!(kind_of("tibet 0.5\nleader 2\n/time 3.5\n").1, Kind::DanglingTime);
        assert_eq!(kind_of("tibet 0.5\n/framing 8N1\n").1, Kind::DanglingFraming);
    }

    #[test]
    fn value_errors() {
        assert_eq!(kind_of("tibet 0.5\nleader\n"), (2, Kind::EmptyLeader));
        assert_eq!(kind_of("tibet 0.5\nleader 12a\n"), (2, Kind::IntBadChar));
        assert_eq!(kind_of("tibet 0.5\nleader 12345678901\n"), (2, Kind::IntTooLong));
        assert_eq!(kind_of("tibet 0.5\nleader 200000000\n"), (2, Kind::LongLeader));
        assert_eq!(kind_of("tibet 0.5\nsilence 1.2.3\n"), (2, Kind::MultipleDecimalPoints));
        assert_eq!(kind_of("tibet 0.5\nsilence 1.\n"), (2, Kind::PointEndsDecimal));
        assert_eq!(kind_of("tibet 0.5\nsilence -1\n"), (2, Kind::DecimalBadChar));
        assert_eq!(kind_of("tibet 0.5\nsilence 40000\n"), (2, Kind::LongSilence));
        assert_eq!(kind_of("tibet 0.5\nbogus\n"), (2, Kind::UnknownWord));
    }

    #[test]
    fn data_errors() {
        assert_eq!(kind_of("tibet 0.5\ndata now\n"), (2, Kind::JunkFollowsStart));
        assert_eq!(kind_of("tibet 0.5\ndata\n.. x\n"), (3, Kind::JunkFollowsLine));
        assert_eq!(kind_of("tibet 0.5\ndata\n..x\n"), (3, Kind::IllegalChar));
        assert_eq!(kind_of("tibet 0.5\ndata\n.PP.\n"), (3, Kind::DoublePulse));
        assert_eq!(kind_of("tibet 0.5\n\tleader 2\n"), (2, Kind::BadChar));
    }

    #[test]
    fn short_silence_is_skipped() {
        let tape = decode("tibet 0.5\nsilence 0.0001\nleader 2\n").unwrap();
        assert_eq!(tape.spans().len(), 1);
    }

    #[test]
    fn recorded_spans_round_trip() {
        let framing = SerialFraming::MOS_8N1;
        let opts = WriteOptions::default();
        let mut tape = TibetTape::new();
        tape.append_leader(Some(0), 3).unwrap();
        tape.begin_data(3, &framing, &opts).unwrap();
        for bit in [false, true, true] {
            tape.append_data_tone(bit, 0, &framing).unwrap();
        }
        tape.end_data(6).unwrap();
        tape.append_silence(0.5, Timespan::new(6, 601), &opts).unwrap();
        assert_eq!(tape.duration(), 607);

        let out = String::from_utf8(tape.build_output(false).unwrap()).unwrap();
        assert!(out.starts_with("tibet 0.5\n\nleader 6\n\n/baud 1200\n/framing 8N1\ndata\n--....\nend\n"));
        assert!(out.ends_with("silence 0.500000\n\n"));

        let mut back = decode(&out).unwrap();
        let s = drain(&mut back);
        assert!(s.starts_with("LLL011S"));
        assert_eq!(back.spans()[1].timespan, Timespan::new(3, 3));
    }

    #[test]
    fn seek_restarts_span() {
        let mut tape = decode("tibet 0.5\nleader 4\ndata\n--..\nend\n").unwrap();
        drain(&mut tape);
        tape.seek_to_piece(1).unwrap();
        assert_eq!(tape.read_tone(false).unwrap().unwrap().tone, Tone::Zero);
        assert!(tape.seek_to_piece(2).is_err());
        tape.rewind();
        assert_eq!(tape.read_tone(false).unwrap().unwrap().tone, Tone::Leader);
    }

    #[test]
    fn end_without_pending_is_tolerated() {
        let mut tape = TibetTape::new();
        tape.end_data(10).unwrap();
        assert_eq!(tape.num_pieces(), 0);
        assert!(tape.append_data_tone(true, 0, &SerialFraming::MOS_8N1).is_err());
    }
}
