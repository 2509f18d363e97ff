//! Receive path: ticks off the tape into bits for the ACIA.
//!
//! At 1200 baud every RX edge reads one tick. At 19200 (the /1 divider)
//! the same tick is presented for sixteen edges. At 300 baud each edge reads
//! four ticks, and a bit is delivered only when all four agree.

use crate::deck::CRUDE_LEADER_DETECT;
use crate::error::{Result, TapeError};
use crate::machine::EmulatorState;
use crate::tone::Tone;
use crate::transport::ToGui;
use crate::TICK_NS;

/// Ticks at 1200 baud before silence and leader stripping kicks in after the
/// motor starts.
const STRIP_HOLDOFF_TICKS: u32 = 800;

/// Ticks between tone updates sent to the transport panel.
const GUI_TONE_INTERVAL: u32 = 100;

const NS_1200: i64 = TICK_NS;
const NS_19200: i64 = TICK_NS / 16;
const NS_300: i64 = TICK_NS * 4;

/// Four-tick quorum buffer used at 300 baud.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tones300 {
    buf: [Option<Tone>; 4],
    fill: u8,
}

impl Tones300 {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Number of ticks held towards the next bit.
    #[must_use]
    pub fn fill(&self) -> u8 {
        self.fill
    }

    /// Add a tick. Returns the bit tone once four agreeing ticks are held;
    /// a disagreement restarts the quorum from the new tick.
    pub fn push(&mut self, tone: Tone) -> Option<Tone> {
        let slot = usize::from(self.fill);
        self.buf[slot] = Some(tone);
        let first = self.buf[0].map(Tone::as_bit_tone);
        if first != Some(tone.as_bit_tone()) {
            self.buf = [Some(tone), None, None, None];
            self.fill = 1;
            return None;
        }
        if self.fill == 3 {
            self.fill = 0;
            return self.buf[0];
        }
        self.fill += 1;
        None
    }

    /// Tone characters for the save-state block (0 for an empty slot).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 4] {
        self.buf.map(|t| t.map_or(0, |t| t.as_char() as u8))
    }

    /// Rebuild from save-state bytes; `None` if anything is out of range.
    #[must_use]
    pub fn from_bytes(chars: [u8; 4], fill: u8) -> Option<Self> {
        if fill > 3 {
            return None;
        }
        let mut buf = [None; 4];
        for (slot, c) in buf.iter_mut().zip(chars) {
            if c != 0 {
                *slot = Some(Tone::from_char(char::from(c))?);
            }
        }
        Some(Self { buf, fill })
    }
}

/// Read-side counters owned by the deck.
#[derive(Debug, Clone, Default)]
pub struct ReadState {
    pub(crate) tones300: Tones300,
    /// Leader ticks seen so far in the current run (capped at the fold limit).
    pub(crate) leader_skip: u32,
    /// Ticks spent waiting for a start bit.
    pub(crate) start_bit_wait: u32,
    /// Non-silent ticks since the last silence, capped.
    pub(crate) since_silence: u32,
    pub(crate) strip_holdoff: u32,
    /// 19200-baud edges served from the last tick.
    pub(crate) fast_consumed: u32,
    pub(crate) fast_last: Option<Tone>,
    pub(crate) prevailing: Option<Tone>,
    /// RS423 mode's stand-in for the leader fold.
    pub(crate) rs423_leader_detect: u32,
    pub(crate) previous_eof: bool,
    pub(crate) since_gui_tone: u32,
}

impl EmulatorState {
    /// One RX clock edge on the cassette path. `divider` is the ACIA's
    /// counter divide ratio. Returns true at end of tape.
    pub(crate) fn rxc_for_tape(&mut self, divider: u32) -> Result<bool> {
        let ns_per_bit = TICK_NS * i64::from(divider) / 16;
        let protect = !self.config.permit_phantoms;
        let cfg_strip = self.config.strip_silence_and_leader;

        let rx = &mut self.tape.rx;
        let strip = cfg_strip && rx.strip_holdoff >= STRIP_HOLDOFF_TICKS;
        if rx.strip_holdoff < STRIP_HOLDOFF_TICKS {
            rx.strip_holdoff += (ns_per_bit / TICK_NS) as u32;
        }

        let mut eof = false;
        let fire;
        let mut bit = None;

        match ns_per_bit {
            NS_1200 | NS_19200 => {
                fire = ns_per_bit == NS_1200 || self.tape.rx.fast_consumed >= 15;
                let tone = if fire {
                    self.tape.rx.fast_consumed = 0;
                    let awaiting = self.acia.rx_awaiting_start();
                    let tone = match self.tape.tone_from_back_end(strip, awaiting, protect)? {
                        Some(read) => {
                            self.tape.update_elapsed(read.elapsed);
                            read.tone
                        }
                        None => {
                            eof = true;
                            Tone::Silence
                        }
                    };
                    if !self.recording {
                        self.noise_tone(tone);
                    }
                    self.tape.rx.tones300.clear();
                    self.tape.rx.fast_last = Some(tone);
                    tone
                } else {
                    self.tape.rx.fast_consumed += 1;
                    self.tape.rx.fast_last.unwrap_or(Tone::Silence)
                };
                self.tape.rx.prevailing = Some(tone);
                bit = Some(tone);
            }
            NS_300 => {
                fire = true;
                for _ in 0..4 {
                    let awaiting = self.acia.rx_awaiting_start();
                    let tone = match self.tape.tone_from_back_end(cfg_strip, awaiting, protect)? {
                        Some(read) => {
                            self.tape.update_elapsed(read.elapsed);
                            read.tone
                        }
                        None => {
                            eof = true;
                            Tone::Silence
                        }
                    };
                    if !self.recording {
                        self.noise_tone(tone);
                    }
                    self.tape.rx.prevailing = Some(tone);
                    if let Some(quorum) = self.tape.rx.tones300.push(tone) {
                        bit = Some(quorum);
                    }
                }
            }
            _ => {
                return Err(TapeError::bug(format!("RX: bad ns_per_bit ({ns_per_bit})")));
            }
        }

        if let Some(tone) = bit {
            self.acia.receive_bit(tone != Tone::Zero)?;
        }

        // 19200-baud repeats carry no news for the panel.
        if fire {
            let tone = self.tape.rx.prevailing.unwrap_or(Tone::Silence);
            self.gui_tone_rate_limited(tone);
            if eof != self.tape.rx.previous_eof {
                self.send_to_gui(ToGui::Eof(eof));
            }
            self.tape.rx.previous_eof = eof;
        }
        Ok(eof)
    }

    /// One tick of tape roll with the ULA switched to RS423. The tape keeps
    /// moving (and recording silence) even though the ACIA can't hear it.
    pub(crate) fn rs423_eat_tick(&mut self) -> Result<bool> {
        if self.tape.prior_exception.is_some() {
            return Ok(false);
        }
        let total = self.tape.duration()?;
        let recording = self.recording;
        let mut eof = false;
        let mut tone = Tone::Silence;

        if !recording {
            match self.tape.tone_from_back_end(false, false, false)? {
                Some(read) => {
                    tone = read.tone;
                    self.tape.update_elapsed(read.elapsed);
                }
                None => eof = true,
            }
        }
        self.tape.rx.prevailing = Some(tone);

        let rx = &mut self.tape.rx;
        if tone == Tone::One {
            if rx.rs423_leader_detect > CRUDE_LEADER_DETECT {
                tone = Tone::Leader;
            } else {
                rx.rs423_leader_detect += 1;
            }
        } else {
            rx.rs423_leader_detect = 0;
        }

        if !recording {
            self.send_rapid_tone(tone);
            self.noise_tone(tone);
        }

        self.write_bitclk(true, NS_1200)?;

        if self.tape.tallied > total && !recording {
            return Err(TapeError::bug(format!(
                "RS423: tape position {} exceeds duration {total}",
                self.tape.tallied
            )));
        }
        if eof != self.tape.rx.previous_eof {
            self.send_to_gui(ToGui::Eof(eof));
            self.tape.rx.previous_eof = eof;
        }
        Ok(eof)
    }

    pub(crate) fn gui_tone_rate_limited(&mut self, tone: Tone) {
        let rx = &mut self.tape.rx;
        if rx.since_gui_tone > GUI_TONE_INTERVAL {
            rx.since_gui_tone = 0;
            self.send_rapid_tone(tone);
        } else {
            rx.since_gui_tone += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(t: &mut Tones300, s: &str) -> String {
        s.chars()
            .filter_map(Tone::from_char)
            .filter_map(|tone| t.push(tone))
            .map(Tone::as_char)
            .collect()
    }

    #[test]
    fn quorum_of_four_yields_a_bit() {
        let mut t = Tones300::new();
        assert_eq!(feed(&mut t, "11110000"), "10");
        assert_eq!(t.fill(), 0);
    }

    #[test]
    fn disagreement_resynchronises() {
        let mut t = Tones300::new();
        assert_eq!(feed(&mut t, "1110"), "");
        assert_eq!(t.fill(), 1);
        assert_eq!(t.to_bytes(), [b'0', 0, 0, 0]);
        assert_eq!(feed(&mut t, "000"), "0");
    }

    #[test]
    fn leader_counts_as_a_one() {
        let mut t = Tones300::new();
        assert_eq!(feed(&mut t, "L1L1"), "L");
    }

    #[test]
    fn bytes_round_trip_and_reject_bad_fill() {
        let mut t = Tones300::new();
        feed(&mut t, "11");
        let back = Tones300::from_bytes(t.to_bytes(), t.fill());
        assert_eq!(back, Some(t));
        assert_eq!(Tones300::from_bytes([0; 4], 4), None);
        assert_eq!(Tones300::from_bytes([b'x', 0, 0, 0], 1), None);
    }
}
