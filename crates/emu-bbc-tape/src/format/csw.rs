//! CSW (Compressed Square Wave) tape images.
//!
//! # Format
//!
//! | Offset | Size | Content                                   |
//! |--------|------|-------------------------------------------|
//! | 0x00   | 23   | `"Compressed Square Wave\x1a"`            |
//! | 0x17   | 1    | Major version (2)                         |
//! | 0x18   | 1    | Minor version (0)                         |
//! | 0x19   | 4    | Sample rate                               |
//! | 0x1d   | 4    | Number of pulses                          |
//! | 0x21   | 1    | Compression: 1 = raw, 2 = zlib            |
//! | 0x22   | 1    | Flags (bit 0: initial polarity)           |
//! | 0x23   | 1    | Header extension length                   |
//! | 0x24   | 16   | Encoding application                      |
//! | 0x34   | ...  | Extension, then body                      |
//!
//! Each body byte is one half-wave in samples. A zero byte introduces a
//! `u32` for pulses longer than 255 samples.
//!
//! One tick of `'1'` is four short pulses, one tick of `'0'` two medium
//! pulses; anything a full tick or longer is silence.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use motorola_6850::SerialFraming;

use crate::backend::{TapeBackend, TapeFormat, Timespan, ToneRead, WriteOptions};
use crate::codec::{compress_zlib, decompress, push_u32, read_u32};
use crate::error::{CswError, Recoverable, Result, TapeError};
use crate::tone::Tone;
use crate::{TAPE_1200_HZ, TICK_S};

const MAGIC: &[u8; 23] = b"Compressed Square Wave\x1a";
const HEADER_LEN: usize = 0x34;
const MAJOR_VERSION: u8 = 2;

pub const RATE_MIN: u32 = 8_000;
pub const RATE_MAX: u32 = 192_000;
pub const RATE_DEFAULT: u32 = 44_100;

const MAX_BODY_LEN_RAW: usize = 8 * 1024 * 1024;
const MAX_PULSES: u32 = 8 * 1024 * 1024;

/// Parsed CSW header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CswHeader {
    pub version: (u8, u8),
    pub rate: u32,
    pub compressed: bool,
    pub flags: u8,
    pub ext_len: u8,
}

impl Default for CswHeader {
    fn default() -> Self {
        Self {
            version: (MAJOR_VERSION, 0),
            rate: RATE_DEFAULT,
            compressed: true,
            flags: 0,
            ext_len: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pulse {
    len_smps: u32,
    span: Timespan,
}

/// A CSW tape: pulse list and read cursor.
#[derive(Debug, Clone)]
pub struct CswTape {
    header: CswHeader,
    pulses: Vec<Pulse>,
    /// Rounding error carried between fractional pulses.
    accumulated_error: f64,
    thresh_smps: f64,
    len_1200th_smps: f64,
    cur: usize,
    silence_ticks: i32,
    silence_pos: i32,
}

impl Default for CswTape {
    fn default() -> Self {
        Self::new()
    }
}

impl CswTape {
    /// A blank tape at the default sample rate.
    #[must_use]
    pub fn new() -> Self {
        Self::with_header(CswHeader::default())
    }

    fn with_header(header: CswHeader) -> Self {
        let rate = f64::from(header.rate);
        Self {
            header,
            pulses: Vec::new(),
            accumulated_error: 0.0,
            // halfway between a '1' pulse and a '0' pulse
            thresh_smps: (rate / TAPE_1200_HZ + rate / (2.0 * TAPE_1200_HZ)) / 4.0,
            len_1200th_smps: rate / TAPE_1200_HZ,
            cur: 0,
            silence_ticks: 0,
            silence_pos: 0,
        }
    }

    /// Parse a complete CSW file.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            log::warn!("csw: header is truncated");
            return Err(CswError::HeaderTruncated.into());
        }
        if !buf.starts_with(MAGIC) {
            log::warn!("csw: bad magic");
            return Err(CswError::BadMagic.into());
        }
        let (major, minor) = (buf[0x17], buf[0x18]);
        if major != MAJOR_VERSION || minor > 1 {
            log::warn!("csw: unknown version {major}.{minor}");
            return Err(CswError::BadVersion(major, minor).into());
        }
        if minor == 1 {
            log::warn!("csw: minor version 1: file is nonstandard");
        }
        let rate = read_u32(&buf[0x19..]);
        if !(RATE_MIN..=RATE_MAX).contains(&rate) {
            log::warn!("csw: bad sample rate {rate}");
            return Err(CswError::BadRate(rate).into());
        }
        let header_pulses = read_u32(&buf[0x1d..]);
        if header_pulses > MAX_PULSES {
            log::warn!("csw: bad number of pulses in header ({header_pulses})");
            return Err(CswError::HeaderNumPulses(header_pulses).into());
        }
        let compressed = match buf[0x21] {
            1 => false,
            2 => true,
            other => {
                log::warn!("csw: bad compression value ({other})");
                return Err(CswError::CompValue(other).into());
            }
        };
        let flags = buf[0x22];
        if flags & 0xf8 != 0 {
            log::warn!("csw: bad flags value (&{flags:x})");
            return Err(CswError::BadFlags(flags).into());
        }
        if flags > 1 {
            log::warn!("csw: illegal flags (&{flags:x}): file is nonstandard");
        }
        let ext_len = buf[0x23];
        if ext_len != 0 {
            log::warn!("csw: hdr. ext. len. is nonzero (&{ext_len:x})");
        }
        let start = HEADER_LEN + usize::from(ext_len);
        if start > buf.len() {
            log::warn!("csw: file truncated during hdr. ext.");
            return Err(CswError::HeaderTruncated.into());
        }

        let raw_body = &buf[start..];
        let inflated;
        let body: &[u8] = if raw_body.is_empty() {
            log::warn!("csw: WARNING: CSW body is empty!");
            raw_body
        } else if compressed {
            inflated = decompress(raw_body)?;
            &inflated
        } else {
            if raw_body.len() >= MAX_BODY_LEN_RAW {
                log::warn!("csw: raw body is too large ({})", raw_body.len());
                return Err(CswError::BodyLarge.into());
            }
            raw_body
        };

        let mut tape = Self::with_header(CswHeader {
            version: (major, minor),
            rate,
            compressed,
            flags,
            ext_len,
        });
        let mut n = 0;
        while n < body.len() {
            let len = if body[n] == 0 {
                if n + 4 >= body.len() {
                    log::warn!("csw: truncated?");
                    break;
                }
                let long = read_u32(&body[n + 1..]);
                if long < 256 {
                    log::warn!("csw: 5-byte CSW pulse but duration < 256 ({long})");
                    return Err(CswError::LongPulseUnder256.into());
                }
                n += 5;
                long
            } else {
                n += 1;
                u32::from(body[n - 1])
            };
            tape.append_pulse(len, Timespan::default())?;
        }
        let found = tape.pulses.len() as u32;
        if found != header_pulses {
            log::warn!("csw: pulses in body ({found}) does not match value in header ({header_pulses})");
            return Err(CswError::PulsesMismatch {
                header: header_pulses,
                body: found,
            }
            .into());
        }
        Ok(tape)
    }

    #[must_use]
    pub fn header(&self) -> &CswHeader {
        &self.header
    }

    #[must_use]
    pub fn num_pulses(&self) -> usize {
        self.pulses.len()
    }

    /// Samples in one tick at this tape's rate.
    #[must_use]
    pub fn len_1200th_smps(&self) -> f64 {
        self.len_1200th_smps
    }

    pub fn append_pulse(&mut self, len_smps: u32, span: Timespan) -> Result<()> {
        if len_smps == 0 {
            log::warn!("csw: BUG: attempting to append zero-length pulse");
            return Err(CswError::WriteNullPulse.into());
        }
        self.pulses.try_reserve(1).map_err(|_| {
            log::warn!("csw: out of memory enlarging CSW");
            TapeError::from(Recoverable::OutOfMemory)
        })?;
        self.pulses.push(Pulse { len_smps, span });
        Ok(())
    }

    /// Append a pulse of non-integral length, dithering so the long-run
    /// total stays exact.
    pub fn append_pulse_fractional(&mut self, len_smps: f64, span: Timespan) -> Result<()> {
        let mut pulse = len_smps as u32;
        if self.accumulated_error > 0.5 {
            pulse += 1;
        }
        self.accumulated_error += len_smps - f64::from(pulse);
        self.append_pulse(pulse, span)
    }

    fn classify(&self, len_smps: u32) -> Tone {
        let len = f64::from(len_smps);
        if len <= self.thresh_smps {
            Tone::One
        } else if len < self.len_1200th_smps {
            Tone::Zero
        } else {
            Tone::Silence
        }
    }

    fn read_silence(&mut self, initial_scan: bool) -> ToneRead {
        let ix = self.cur;
        let elapsed = self.pulses[ix].span.start + self.silence_pos;
        if self.silence_pos < self.silence_ticks - 1 {
            self.silence_pos += 1;
        } else {
            if initial_scan {
                self.pulses[ix].span.len = self.silence_ticks;
            }
            self.cur += 1;
            self.silence_pos = 0;
            self.silence_ticks = 0;
        }
        ToneRead::new(Tone::Silence, Some(elapsed))
    }
}

impl TapeBackend for CswTape {
    fn format(&self) -> TapeFormat {
        TapeFormat::Csw
    }

    fn read_tone(&mut self, initial_scan: bool) -> Result<Option<ToneRead>> {
        if self.pulses.is_empty() {
            return Ok(None);
        }
        if self.silence_ticks > 0 {
            return Ok(Some(self.read_silence(initial_scan)));
        }
        if self.cur >= self.pulses.len() {
            return Ok(None);
        }
        if initial_scan && self.cur > 0 {
            self.pulses[self.cur].span.start = self.pulses[self.cur - 1].span.end();
        }
        let elapsed = self.pulses[self.cur].span.start;

        loop {
            let cur = self.cur;
            let mut v = [None; 4];
            for (k, slot) in v.iter_mut().enumerate() {
                let Some(p) = self.pulses.get(cur + k) else {
                    break;
                };
                *slot = Some(self.classify(p.len_smps));
                if initial_scan {
                    let start = (cur + k)
                        .checked_sub(1)
                        .map_or(0, |prev| self.pulses[prev].span.end());
                    self.pulses[cur + k].span = Timespan::new(start, 0);
                }
            }

            // four short pulses make a '1', two medium ones a '0'
            let wanted = match v[0] {
                Some(Tone::One) => Some((Tone::One, 4)),
                Some(Tone::Zero) => Some((Tone::Zero, 2)),
                _ => None,
            };
            if let Some((tone, lookahead)) = wanted {
                if v[..lookahead].iter().all(|t| *t == Some(tone)) {
                    if initial_scan {
                        self.pulses[cur + lookahead - 1].span.len = 1;
                    }
                    self.cur += lookahead;
                    return Ok(Some(ToneRead::new(tone, Some(elapsed))));
                }
            } else if v[0] == Some(Tone::Silence) {
                let len_smps = self.pulses[cur].len_smps;
                let ticks = (f64::from(len_smps) * TAPE_1200_HZ / f64::from(self.header.rate)) as i32;
                if ticks > 0 {
                    let p = &mut self.pulses[cur];
                    let at = p.span.end();
                    if initial_scan {
                        p.span.len += 1;
                    }
                    if ticks == 1 {
                        self.cur += 1;
                    } else {
                        self.silence_ticks = ticks;
                        self.silence_pos = 1;
                    }
                    return Ok(Some(ToneRead::new(Tone::Silence, Some(at))));
                }
                log::warn!("csw: WARNING: very short silence ({len_smps} smps); skipping!");
            }

            // ambiguous: skip a pulse and try again
            self.cur += 1;
            if self.cur >= self.pulses.len() {
                return Ok(None);
            }
        }
    }

    fn peek_eof(&self) -> bool {
        self.silence_ticks == 0 && self.cur >= self.pulses.len()
    }

    fn has_data(&self) -> bool {
        !self.pulses.is_empty()
    }

    fn rewind(&mut self) {
        self.cur = 0;
        self.silence_ticks = 0;
        self.silence_pos = 0;
    }

    fn ffwd_to_end(&mut self) -> Result<()> {
        self.cur = self.pulses.len();
        self.silence_ticks = 0;
        self.silence_pos = 0;
        Ok(())
    }

    fn duration(&self) -> i32 {
        self.pulses.last().map_or(0, |p| p.span.end())
    }

    fn num_pieces(&self) -> usize {
        self.pulses.len()
    }

    fn piece_span(&self, ix: usize) -> Result<Timespan> {
        self.pulses
            .get(ix)
            .map(|p| p.span)
            .ok_or_else(|| TapeError::bug(format!("csw: no pulse #{ix} ({} available)", self.pulses.len())))
    }

    fn seek_to_piece(&mut self, ix: usize) -> Result<()> {
        if ix >= self.pulses.len() {
            return Err(TapeError::bug(format!(
                "csw: seek: pulse_ix ({ix}) >= pulses ({})",
                self.pulses.len()
            )));
        }
        self.cur = ix;
        self.silence_ticks = 0;
        self.silence_pos = 0;
        Ok(())
    }

    fn begin_data(&mut self, _start: i32, _framing: &SerialFraming, _opts: &WriteOptions) -> Result<()> {
        Ok(())
    }

    fn append_data_tone(&mut self, bit: bool, at: i32, _framing: &SerialFraming) -> Result<()> {
        let (count, len) = if bit {
            (4, self.len_1200th_smps / 4.0)
        } else {
            (2, self.len_1200th_smps / 2.0)
        };
        for k in 0..count {
            self.append_pulse_fractional(len, Timespan::new(at, i32::from(k == count - 1)))?;
        }
        Ok(())
    }

    fn end_data(&mut self, _tallied: i32) -> Result<()> {
        Ok(())
    }

    fn append_leader(&mut self, start: Option<i32>, ticks: u32) -> Result<()> {
        let mut at = start.unwrap_or_else(|| self.duration());
        let quarter = self.len_1200th_smps / 4.0;
        for j in 0..ticks * 4 {
            let last = j & 3 == 3;
            self.append_pulse_fractional(quarter, Timespan::new(at, i32::from(last)))?;
            if last {
                at += 1;
            }
        }
        Ok(())
    }

    fn append_silence(&mut self, secs: f32, span: Timespan, _opts: &WriteOptions) -> Result<()> {
        let sane = (2.0 * TICK_S) as f32;
        let secs = if secs < sane {
            log::warn!("csw: very short silence ({secs} s); using {sane} s instead");
            sane
        } else {
            secs
        };
        // a pair of pulses keeps the polarity unchanged
        let first = Timespan::new(span.start, span.len / 2);
        let second = Timespan::new(first.end(), span.len - first.len);
        let smps = (f64::from(secs) / 2.0 * f64::from(self.header.rate)) as u32;
        self.append_pulse(smps, first)?;
        self.append_pulse(smps, second)
    }

    fn build_output(&self, compress: bool) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.pulses.len());
        for p in &self.pulses {
            if p.len_smps <= 255 {
                body.push(p.len_smps as u8);
            } else {
                body.push(0);
                push_u32(&mut body, p.len_smps);
            }
        }
        let (kind, body) = if body.is_empty() || !compress {
            (1, body)
        } else {
            (2, compress_zlib(&body)?)
        };

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(MAGIC);
        out.push(self.header.version.0);
        out.push(self.header.version.1);
        push_u32(&mut out, self.header.rate);
        push_u32(&mut out, self.pulses.len() as u32);
        out.push(kind);
        out.push(self.header.flags);
        out.push(0);
        let mut encoder = [b' '; 16];
        let name = format!("emu-bbc-tape {}", env!("CARGO_PKG_VERSION"));
        let n = name.len().min(15);
        encoder[..n].copy_from_slice(&name.as_bytes()[..n]);
        out.extend_from_slice(&encoder);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(rate: u32, pulses: u32, compression: u8) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&[2, 0]);
        push_u32(&mut out, rate);
        push_u32(&mut out, pulses);
        out.extend_from_slice(&[compression, 0, 0]);
        out.extend_from_slice(&[b' '; 16]);
        out
    }

    fn drain(tape: &mut CswTape) -> String {
        let mut s = String::new();
        while let Some(r) = tape.read_tone(true).unwrap() {
            s.push(r.tone.as_char());
        }
        s
    }

    #[test]
    fn raw_pulses_decode_to_ticks() {
        let mut buf = header(44_100, 7, 1);
        // '1', '0', then a 1/600 s silence
        buf.extend_from_slice(&[9, 9, 9, 9, 18, 18, 74]);
        let mut tape = CswTape::decode(&buf).unwrap();
        assert_eq!(drain(&mut tape), "10SS");
        assert_eq!(tape.duration(), 4);
        assert_eq!(tape.piece_span(3).unwrap(), Timespan::new(0, 1));
        assert_eq!(tape.piece_span(6).unwrap(), Timespan::new(2, 2));
    }

    #[test]
    fn ambiguous_pulses_are_skipped() {
        let mut buf = header(44_100, 6, 1);
        buf.extend_from_slice(&[18, 9, 9, 9, 9, 9]);
        let mut tape = CswTape::decode(&buf).unwrap();
        assert_eq!(drain(&mut tape), "1");
        assert!(tape.peek_eof());
    }

    #[test]
    fn header_validation() {
        assert_eq!(CswTape::decode(&[0; 10]).unwrap_err().code(), 110);
        let mut bad = header(44_100, 0, 1);
        bad[0] = b'c';
        assert_eq!(CswTape::decode(&bad).unwrap_err().code(), 101);
        let mut bad = header(44_100, 0, 1);
        bad[0x17] = 3;
        assert_eq!(CswTape::decode(&bad).unwrap_err().code(), 102);
        assert_eq!(CswTape::decode(&header(4_000, 0, 1)).unwrap_err().code(), 103);
        assert_eq!(CswTape::decode(&header(44_100, 0, 3)).unwrap_err().code(), 107);
        let mut bad = header(44_100, 0, 1);
        bad[0x22] = 0x10;
        assert_eq!(CswTape::decode(&bad).unwrap_err().code(), 108);
    }

    #[test]
    fn body_errors() {
        let mut mismatch = header(44_100, 3, 1);
        mismatch.extend_from_slice(&[9, 9]);
        assert_eq!(CswTape::decode(&mismatch).unwrap_err().code(), 109);

        let mut short_long = header(44_100, 1, 1);
        short_long.extend_from_slice(&[0, 100, 0, 0, 0]);
        assert_eq!(CswTape::decode(&short_long).unwrap_err().code(), 112);
    }

    #[test]
    fn blank_tape_round_trips() {
        let tape = CswTape::new();
        let out = tape.build_output(true).unwrap();
        assert_eq!(out.len(), HEADER_LEN);
        assert_eq!(out[0x21], 1);
        let back = CswTape::decode(&out).unwrap();
        assert!(!back.has_data());
        assert_eq!(back.duration(), 0);
    }

    #[test]
    fn recorded_tape_reads_back() {
        let opts = WriteOptions::default();
        let mut tape = CswTape::new();
        tape.append_leader(Some(0), 2).unwrap();
        tape.append_data_tone(false, 2, &SerialFraming::MOS_8N1).unwrap();
        tape.append_silence(0.5, Timespan::new(3, 600), &opts).unwrap();
        assert_eq!(tape.duration(), 603);
        assert_eq!(tape.num_pulses(), 8 + 2 + 2);

        let out = tape.build_output(true).unwrap();
        assert_eq!(out[0x21], 2);
        let mut back = CswTape::decode(&out).unwrap();
        assert_eq!(drain(&mut back), format!("110{}", "S".repeat(600)));
        assert_eq!(back.duration(), 603);

        back.seek_to_piece(8).unwrap();
        let r = back.read_tone(false).unwrap().unwrap();
        assert_eq!(r, ToneRead::new(Tone::Zero, Some(2)));
        assert!(back.seek_to_piece(12).is_err());
    }

    #[test]
    fn zero_pulse_is_refused() {
        let mut tape = CswTape::new();
        let err = tape.append_pulse(0, Timespan::default()).unwrap_err();
        assert_eq!(err.code(), 111);
    }
}
