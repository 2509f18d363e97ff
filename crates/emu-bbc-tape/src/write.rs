//! Transmit path: bits from the ACIA onto every copy of the tape.
//!
//! Each transmit bit clock lands in one of three sections. Silence (the
//! ULA's RTS gate is shut) accumulates nanoseconds and is written out as a
//! single span when it ends. Leader (the shift register is empty) counts
//! whole ticks and is written as one leader span. Data follows the shift
//! register's position through start, data, parity and stop bits and hands
//! each tick to the back ends. Moving from one section to another closes the
//! one before.

use motorola_6850::{Parity, SerialFraming};

use crate::backend::{FormatSet, TapeBackend, TapeFormat, Timespan};
use crate::error::{Result, TapeError};
use crate::machine::EmulatorState;
use crate::tone::Tone;
use crate::{TICK_NS, TICK_S};

/// Write-side accumulators owned by the deck.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteState {
    pub(crate) silence_ns: i64,
    pub(crate) leader_ns: i64,
    /// Sub-tick remainder carried between bit clocks.
    pub(crate) bit_periods_ns: i64,
    /// A data section is open on every copy.
    pub(crate) must_end_data: bool,
    pub(crate) odd_ones: bool,
}

impl EmulatorState {
    /// One transmit bit clock with the motor running. `silent` is set while
    /// the ULA holds the cassette output quiet.
    pub(crate) fn write_bitclk(&mut self, silent: bool, ns_per_bit: i64) -> Result<()> {
        if ns_per_bit == 0 {
            return Err(TapeError::bug("ns_per_bit is zero!"));
        }
        let recording = self.recording;
        if recording {
            self.write_prelude()?;
        }

        if silent {
            if self.end_data_if_ongoing()? {
                self.acia.reset_tx_shift_register();
            }
            if recording {
                self.tape.wr.silence_ns += ns_per_bit;
            }
            let ticks = self.consume_ticks(ns_per_bit);
            for _ in 0..ticks {
                if recording {
                    self.noise_tone(Tone::Silence);
                    self.tape.tallied += 1;
                    self.tape.intervals.send_tone(Tone::Silence, false)?;
                }
            }
            if recording {
                self.send_rapid_tone(Tone::Silence);
            }
        } else if self.tape.wr.silence_ns > 0 {
            if recording {
                let secs = self.tape.wr.silence_ns as f64 / 1e9;
                self.write_silence(secs)?;
            }
            self.tape.wr.silence_ns = 0;
        }

        let have_leader = !self.acia.tx_shift_reg_loaded();
        if have_leader && !silent {
            if self.end_data_if_ongoing()? {
                self.acia.reset_tx_shift_register();
            }
            if recording {
                self.tape.wr.leader_ns += ns_per_bit;
            }
            let ticks = self.consume_ticks(ns_per_bit);
            if recording {
                for _ in 0..ticks {
                    self.noise_tone(Tone::Leader);
                    self.tape.intervals.send_tone(Tone::Leader, false)?;
                }
                self.tape.tallied += ticks;
                if ticks > 0 {
                    self.send_rapid_tone(Tone::Leader);
                }
            }
        }
        if silent || !have_leader {
            self.flush_leader()?;
        }

        if !silent && !have_leader {
            let baud = (TICK_NS * 1200 / ns_per_bit) as i32;
            let framing = SerialFraming::from_control(self.acia.control()).with_baud(baud);
            self.output_data(&framing, ns_per_bit)?;
        }
        Ok(())
    }

    /// Close whatever section is open so the copies agree with what has been
    /// heard so far. Used before saving and when record is released.
    pub(crate) fn flush_pending_piece(&mut self) -> Result<()> {
        if self.tape.prior_exception.is_some() {
            return Ok(());
        }
        let wr = self.tape.wr;
        if wr.leader_ns > 0 {
            self.write_leader(wr.leader_ns)?;
            self.tape.wr.leader_ns = 0;
        } else if wr.silence_ns > TICK_NS {
            self.write_silence(wr.silence_ns as f64 / 1e9)?;
            self.tape.wr.silence_ns = 0;
            if self.tape.formats.contains(TapeFormat::Uef) {
                self.tape.uef.ffwd_to_end()?;
            }
        } else {
            self.end_data_if_ongoing()?;
            self.acia.reset_tx_shift_register();
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sections
    // -----------------------------------------------------------------------

    fn write_prelude(&mut self) -> Result<()> {
        if self.tape.formats.is_empty() {
            self.tape.formats = FormatSet::ALL;
            log::info!("tape: initialised blank tape");
        }
        self.tape.ffwd_to_end()?;
        if self.tape.formats.contains(TapeFormat::Uef) {
            let at = self.tape.uef.duration();
            self.tape.uef.ensure_origin(at, self.config.save_no_origin)?;
        }
        Ok(())
    }

    /// Whole ticks covered by this bit clock plus any carried remainder.
    fn consume_ticks(&mut self, ns_per_bit: i64) -> i32 {
        let wr = &mut self.tape.wr;
        wr.bit_periods_ns += ns_per_bit;
        let ticks = wr.bit_periods_ns / TICK_NS;
        wr.bit_periods_ns -= ticks * TICK_NS;
        ticks as i32
    }

    /// Close an open data section. Returns true if one was open, in which
    /// case the transmitter's shift register must be abandoned too.
    fn end_data_if_ongoing(&mut self) -> Result<bool> {
        if !self.tape.wr.must_end_data {
            return Ok(false);
        }
        let recording = self.recording;
        if recording
            && self.tape.formats.contains(TapeFormat::Uef)
            && self.tape.uef.has_partial_frame()
        {
            let tallied = self.tape.tallied;
            self.tape.uef.flush_incomplete_frame(tallied)?;
        }
        if recording {
            let tallied = self.tape.tallied;
            self.tape.for_each_copy(|b| b.end_data(tallied))?;
        }
        self.tape.wr.must_end_data = false;
        Ok(true)
    }

    fn flush_leader(&mut self) -> Result<()> {
        let leader_ns = self.tape.wr.leader_ns;
        if leader_ns > 0 {
            if self.recording {
                self.write_leader(leader_ns)?;
            }
            self.tape.wr.leader_ns = 0;
        }
        Ok(())
    }

    fn write_leader(&mut self, leader_ns: i64) -> Result<()> {
        let ticks = (leader_ns / TICK_NS).max(1) as u32;
        let at = self.tape.duration()?;
        self.tape.for_each_copy(|b| b.append_leader(Some(at), ticks))
    }

    /// Append `secs` of silence at the end of every copy. The span is worked
    /// out once here so all formats agree on it.
    fn write_silence(&mut self, secs: f64) -> Result<()> {
        let mut secs = secs;
        if secs < TICK_S {
            log::warn!("tape: WARNING: zero-length silence on write, adjusting to one cycle");
            secs = TICK_S;
        }
        let start = self.tape.duration()?;
        let half_ticks = (0.5 + secs * crate::TAPE_1200_HZ * 2.0) as i32;
        let span = Timespan::new(start, half_ticks / 2);
        let opts = self.config.write_options();
        self.tape
            .for_each_copy(|b| b.append_silence(secs as f32, span, &opts))
    }

    fn output_data(&mut self, framing: &SerialFraming, ns_per_bit: i64) -> Result<()> {
        let recording = self.recording;
        if recording && !self.tape.wr.must_end_data {
            self.tape.wr.must_end_data = true;
            let start = self.tape.duration()?;
            let opts = self.config.write_options();
            self.tape
                .for_each_copy(|b| b.begin_data(start, framing, &opts))?;
            self.tape.tallied = self.tape.duration()?;
        }

        let ticks = self.consume_ticks(ns_per_bit);
        let pos = self.acia.tx_shift_pos();
        let value = self.acia.tx_shift_value();
        let data_bits = framing.data_bits;
        let stop_position = 1 + data_bits + framing.parity_bits();

        if pos == 0 {
            self.tape.wr.odd_ones = false;
        } else if pos < data_bits + 1 {
            // The start bit goes out late, alongside the first data bit.
            if pos == 1 {
                self.emit_data_ticks(false, ticks, framing)?;
            }
            let bit = value & 1 != 0;
            self.emit_data_ticks(bit, ticks, framing)?;
            if bit {
                self.tape.wr.odd_ones = !self.tape.wr.odd_ones;
            }
        } else if framing.parity != Parity::None && pos == data_bits + 1 {
            let odd = self.tape.wr.odd_ones;
            let p = match framing.parity {
                Parity::Even => odd,
                Parity::Odd => !odd,
                Parity::None => false,
            };
            self.emit_data_ticks(p, ticks, framing)?;
        } else if pos >= stop_position {
            self.emit_data_ticks(true, ticks, framing)?;
        }
        Ok(())
    }

    fn emit_data_ticks(&mut self, bit: bool, ticks: i32, framing: &SerialFraming) -> Result<()> {
        if !self.recording {
            return Ok(());
        }
        let tone = Tone::from_bit(bit);
        for _ in 0..ticks {
            let at = self.tape.duration()?;
            self.noise_tone(tone);
            self.gui_tone_rate_limited(tone);
            self.tape.intervals.send_tone(tone, false)?;
            self.tape
                .for_each_copy(|b| b.append_data_tone(bit, at, framing))?;
            self.tape.tallied += 1;
        }
        Ok(())
    }
}
