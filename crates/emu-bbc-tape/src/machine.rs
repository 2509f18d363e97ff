//! The emulator-side aggregate: ACIA, serial ULA, deck and settings.
//!
//! Everything the tape subsystem touches lives here and is passed around by
//! `&mut`. The host calls [`EmulatorState::poll`] with the number of 2 MHz
//! bus cycles that have elapsed and routes CPU accesses to &FE08-&FE0F
//! (ACIA) and &FE10-&FE17 (ULA) through the register methods.

use emu_core::Tickable;
use ferranti_serial_ula::SerialUla;
use motorola_6850::Acia6850;

use crate::backend::TapeFormat;
use crate::config::TapeConfig;
use crate::deck::TapeState;
use crate::error::{Recoverable, Result, TapeError};
use crate::noise::{self, TapeNoise};
use crate::tone::Tone;
use crate::transport::{ToGui, TransportPanel};

/// Why the emulator has been asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitReason {
    /// The tape ran out with quit-on-EOF set.
    Eof,
    /// A tape error with quit-on-error set.
    Error,
    /// The cycle limit was reached.
    Expired,
    /// A tape file could not be opened, with quit-on-error set.
    OpenFailed,
}

impl QuitReason {
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Eof => 0,
            Self::Error => 1,
            Self::Expired => 2,
            Self::OpenFailed => 3,
        }
    }
}

/// Audio kept for the host before the oldest samples are discarded.
const AUDIO_BACKLOG: usize = noise::SAMPLE_RATE as usize;

/// ACIA transmit control value that holds the cassette output silent
/// (RTS high, transmit interrupt off).
const TX_CONTROL_SILENT: u8 = 0x40;
const TX_CONTROL_MASK: u8 = 0x60;

pub struct EmulatorState {
    pub acia: Acia6850,
    pub ula: SerialUla,
    pub tape: TapeState,
    pub config: TapeConfig,
    pub noise: TapeNoise,
    pub transport: Option<TransportPanel>,
    pub(crate) recording: bool,
    cycles: u64,
    quit: Option<QuitReason>,
    /// Bus cycles' worth of noise owed to the audio output, in samples.
    noise_due: usize,
    audio: Vec<i16>,
}

impl EmulatorState {
    #[must_use]
    pub fn new(config: TapeConfig) -> Self {
        let mut ula = SerialUla::new();
        ula.set_overclock(config.overclock);
        let mut noise = TapeNoise::new();
        noise.set_enabled(config.sound);
        let mut emu = Self {
            acia: Acia6850::new(),
            ula,
            tape: TapeState::new(),
            config,
            noise,
            transport: None,
            recording: false,
            cycles: 0,
            quit: None,
            noise_due: 0,
            audio: Vec::new(),
        };
        emu.ula.push_lines(&mut emu.acia);
        emu
    }

    #[must_use]
    pub fn recording(&self) -> bool {
        self.recording
    }

    /// Bus cycles polled so far.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    #[must_use]
    pub fn quit_reason(&self) -> Option<QuitReason> {
        self.quit
    }

    /// Tape noise produced since the last call.
    pub fn take_audio(&mut self) -> Vec<i16> {
        std::mem::take(&mut self.audio)
    }

    /// Apply changed settings. Divider changes take effect on the next ULA
    /// write.
    pub fn set_config(&mut self, config: TapeConfig) {
        self.ula.set_overclock(config.overclock);
        self.noise.set_enabled(config.sound);
        self.config = config;
    }

    // -----------------------------------------------------------------------
    // Transport panel plumbing
    // -----------------------------------------------------------------------

    pub(crate) fn send_to_gui(&self, msg: ToGui) {
        if let Some(panel) = &self.transport {
            panel.send(msg);
        }
    }

    /// Publish the current tone and position.
    pub(crate) fn send_rapid_tone(&self, tone: Tone) {
        if let Some(panel) = &self.transport {
            panel.rapid().set_time(self.tape.tallied);
            panel.rapid().set_tone(tone);
        }
    }

    pub(crate) fn noise_tone(&mut self, tone: Tone) {
        if self.config.sound {
            self.noise.send_tone(tone);
        }
    }

    fn transport_inhibited(&self) -> bool {
        self.transport.as_ref().is_some_and(TransportPanel::inhibited)
    }

    // -----------------------------------------------------------------------
    // Registers
    // -----------------------------------------------------------------------

    pub fn read_acia(&mut self, addr: u16) -> u8 {
        self.acia.read(addr)
    }

    /// CPU write to the ACIA. A master reset abandons any frame being
    /// written, so what has gone out so far is flushed to the UEF copy.
    pub fn write_acia(&mut self, addr: u16, value: u8) {
        self.acia.write(addr, value);
        if addr & 1 == 0 && value & 3 == 3 {
            if let Err(e) = self.acia_master_reset() {
                self.handle_exception(e);
            }
        }
    }

    fn acia_master_reset(&mut self) -> Result<()> {
        if self.tape.formats.contains(TapeFormat::Uef) && self.tape.uef.has_partial_frame() {
            let tallied = self.tape.tallied;
            self.tape.uef.flush_incomplete_frame(tallied)?;
        }
        Ok(())
    }

    /// Reading the ULA has the effect of writing &FE to it.
    pub fn read_ula(&mut self) -> u8 {
        self.write_ula(0xFE);
        0
    }

    pub fn write_ula(&mut self, value: u8) {
        if let Some(on) = self.ula.write(value) {
            self.motor_changed(on);
        }
        self.ula.push_lines(&mut self.acia);
    }

    fn motor_changed(&mut self, on: bool) {
        self.noise.motorchange(on);
        if on {
            if self.config.strip_silence_and_leader {
                self.acia.set_dcd(true);
            }
            // Let another stretch of silence and leader play out unstripped.
            self.tape.rx.strip_holdoff = 0;
        } else {
            self.send_to_gui(ToGui::Record(self.recording));
            if let Some(panel) = &self.transport {
                panel.rapid().set_tone(Tone::Silence);
            }
        }
        self.send_to_gui(ToGui::Motor(on));
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// Run the tape subsystem for `cycles` bus cycles. Errors are handled
    /// internally; the return value says whether the emulator should stop.
    pub fn poll(&mut self, cycles: u32) -> Option<QuitReason> {
        if let Err(e) = self.poll_tape(cycles) {
            self.handle_exception(e);
        }
        self.quit
    }

    fn poll_tape(&mut self, cycles: u32) -> Result<()> {
        if self
            .config
            .expire_cycles
            .is_some_and(|limit| self.cycles >= limit)
        {
            return Err(Recoverable::Expiry.into());
        }
        self.cycles += u64::from(cycles);

        let mut eof = false;
        let outcome = if !self.ula.rs423_selected() {
            self.poll_cassette(cycles, &mut eof)
        } else if self.ula.motor() {
            self.poll_rs423_rolling(cycles, &mut eof)
        } else {
            self.poll_rs423_idle(cycles);
            Ok(())
        };

        // Noise playback carries on with the motor off so the tail of the
        // buffer is heard.
        if outcome.is_ok() {
            for _ in 0..cycles {
                if self.ula.clock_noise() && self.config.sound {
                    self.feed_audio();
                }
            }
        }
        outcome?;

        if eof && !self.recording && self.tape.formats.is_loaded_file() {
            return Err(Recoverable::Eof.into());
        }
        Ok(())
    }

    fn feed_audio(&mut self) {
        self.noise_due += noise::SLOW_SMPS;
        if self.noise_due < noise::PLAY_LEN {
            return;
        }
        self.noise_due -= noise::PLAY_LEN;
        self.noise.play(&mut self.audio);
        if self.audio.len() > AUDIO_BACKLOG {
            let excess = self.audio.len() - AUDIO_BACKLOG;
            self.audio.drain(..excess);
        }
    }

    /// Cassette selected: the ULA's divided clocks drive the ACIA, and the
    /// ACIA's bit clocks drive the deck.
    fn poll_cassette(&mut self, cycles: u32, eof: &mut bool) -> Result<()> {
        let fast_dcd = self.config.overclock || self.config.strip_silence_and_leader;
        for _ in 0..cycles {
            self.ula.tick();
            let edges = self.ula.last_edges();
            if edges.rxc && self.ula.motor() && !self.transport_inhibited() {
                if let Some(divider) = self.acia.poll_rxc()? {
                    *eof |= self.rxc_for_tape(divider)?;
                }
            }
            if edges.txc2 {
                self.txc2_for_tape()?;
            }
            if edges.dcd {
                let broken = self.tape.rx.prevailing.is_some_and(Tone::breaks_carrier);
                let was = self.ula.dcd_tape();
                self.ula.dcd_tick(broken, fast_dcd, &mut self.acia);
                if self.ula.dcd_tape() && !was {
                    self.send_to_gui(ToGui::Dcd(true));
                }
            }
        }
        Ok(())
    }

    /// One 2TXC edge. On a whole bit the shift register moves, and with the
    /// motor running the deck hears the bit.
    fn txc2_for_tape(&mut self) -> Result<()> {
        let clock = self.acia.poll_2txc();
        if !clock.bit_clock {
            return Ok(());
        }
        let framing = self.acia.framing();
        self.acia.run_tx_shift_register(&framing)?;
        if self.ula.motor() {
            let ns_per_bit =
                13 * i64::from(clock.divider) * i64::from(self.ula.tx_divider()) * 1000 / 16;
            let silent = self.acia.control() & TX_CONTROL_MASK == TX_CONTROL_SILENT;
            self.write_bitclk(silent, ns_per_bit)?;
        }
        Ok(())
    }

    /// RS423 selected with the motor on: the tape still rolls, a tick at a
    /// time, and the carrier detector keeps counting even though DCD never
    /// reaches the ACIA.
    fn poll_rs423_rolling(&mut self, cycles: u32, eof: &mut bool) -> Result<()> {
        let fast_dcd = self.config.strip_silence_and_leader;
        for _ in 0..cycles {
            if self.ula.taperoll_due() {
                *eof |= self.rs423_eat_tick()?;
            }
            if self.ula.take_rs423_dcd_tick() {
                let broken = self.tape.rx.prevailing.is_some_and(Tone::breaks_carrier);
                self.ula.poll_dcd_blipticks(broken, fast_dcd);
            }
            self.ula.advance_taperoll();
        }
        self.ula.push_lines(&mut self.acia);
        Ok(())
    }

    /// RS423 selected with the motor off: keep the noise buffer topped up
    /// with silence so it doesn't run dry.
    fn poll_rs423_idle(&mut self, cycles: u32) {
        for _ in 0..cycles {
            if self.ula.idle_taperoll() {
                self.noise_tone(Tone::Silence);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Session control
    // -----------------------------------------------------------------------

    /// Arm or disarm recording. Disarming closes the open piece, rewinds,
    /// and checks the copies still agree with the interval list.
    pub fn set_record(&mut self, on: bool) -> Result<()> {
        if !on && self.recording {
            self.flush_pending_piece()?;
            self.tape.rewind();
            self.send_to_gui(ToGui::Error(0));
            if let Some(panel) = &self.transport {
                panel.rapid().set_time(0);
            }
        } else if self.tape.formats.contains(TapeFormat::Uef) {
            self.tape.uef.resume_recording();
        }
        self.recording = on;

        let duration = if self.tape.prior_exception.is_none() {
            self.tape.duration()?
        } else {
            0
        };
        if let Some(panel) = &self.transport {
            panel.rapid().set_time(self.tape.tallied);
        }

        if on {
            self.tape.tallied = duration;
        } else {
            self.tape.tallied = 0;
            self.tape.intervals.commit_wip()?;
            self.send_to_gui(ToGui::Stripes(self.tape.intervals.clone()));
            self.tape.intervals.integrity_check()?;
            if self.tape.formats.contains(TapeFormat::Uef) {
                self.tape.uef.verify_timestamps()?;
            }
        }
        self.send_to_gui(ToGui::Record(on));
        log::info!("tape: record {}", if on { "activated" } else { "deactivated" });
        Ok(())
    }

    /// Take the tape out. Recording stops (flushing what it had), and the
    /// deck is left holding a blank tape ready to record onto. Clears any
    /// error that had disabled the tape.
    pub fn eject(&mut self) {
        if let Err(e) = self.set_record(false) {
            log::warn!("tape: eject: {e}");
        }
        self.tape.finish();
        self.tape.intervals.clear();
        self.send_to_gui(ToGui::Record(false));
        self.send_to_gui(ToGui::Error(0));
        self.send_to_gui(ToGui::Eof(false));
        self.send_to_gui(ToGui::Stripes(self.tape.intervals.clone()));
        self.send_to_gui(ToGui::Inlays(Vec::new()));
        if let Some(panel) = &self.transport {
            panel.rapid().set_time(0);
        }
        log::info!("tape: ejected");
    }

    /// Top-level error handler. Anything but end of tape disables the tape
    /// until it is ejected. Depending on settings the emulator may be asked
    /// to quit.
    pub fn handle_exception(&mut self, e: TapeError) {
        if matches!(e, TapeError::Recoverable(Recoverable::Expiry)) {
            // The tape stays intact so it can still be saved on the way out.
            self.quit = Some(QuitReason::Expired);
            return;
        }
        if self.tape.prior_exception.is_some() {
            log::warn!("tape: BUG: handling exception when tape is already disabled!");
            return;
        }
        if e.is_eof() {
            if self.config.quit_on_eof {
                self.quit = Some(QuitReason::Eof);
            }
            return;
        }

        let open_failed = matches!(e, TapeError::Recoverable(Recoverable::Open { .. }));
        if open_failed {
            log::warn!("tape: tape load failure: {e}");
        } else {
            log::warn!("tape: {e} (code {}); disabling tape! (Eject tape to clear.)", e.code());
        }
        self.tape.finish();
        self.recording = false;
        self.send_to_gui(ToGui::Record(false));
        self.send_to_gui(ToGui::Error(e.code()));
        if self.config.quit_on_error {
            self.quit = Some(if open_failed {
                QuitReason::OpenFailed
            } else {
                QuitReason::Error
            });
        }
        self.tape.prior_exception = Some(e);
    }
}

impl Default for EmulatorState {
    fn default() -> Self {
        Self::new(TapeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TibetTape;
    use emu_core::Ticks;

    /// Bus cycles in one tick.
    const TICK_CYCLES: u32 = 13 * 128;

    fn tibet_emu(body: &str, config: TapeConfig) -> EmulatorState {
        let mut emu = EmulatorState::new(config);
        let text = format!("tibet 0.5\n{body}");
        emu.tape
            .insert_tibet(TibetTape::decode(text.as_bytes()).expect("valid TIBET"));
        emu.tape.initial_scan().expect("scan");
        emu.tape.rewind();
        emu
    }

    #[test]
    fn motor_off_leaves_the_tape_still() {
        let mut emu = tibet_emu("leader 200\n", TapeConfig::default());
        emu.write_acia(0, 0x03);
        emu.write_acia(0, 0x15);
        emu.write_ula(0x05);
        assert_eq!(emu.poll(TICK_CYCLES * 50), None);
        assert_eq!(emu.tape.tallied(), 0);
    }

    #[test]
    fn motor_on_plays_ticks_at_1200_baud() {
        let mut emu = tibet_emu("leader 2000\n", TapeConfig::default());
        emu.write_acia(0, 0x03);
        emu.write_acia(0, 0x15);
        emu.write_ula(0x85);
        assert!(emu.ula.motor());
        emu.poll(TICK_CYCLES * 100);
        let t = emu.tape.tallied();
        assert!((98..=101).contains(&t), "tallied {t}");
        assert_eq!(emu.noise.take_motor_events(), vec![true]);
    }

    #[test]
    fn end_of_tape_quits_only_when_asked() {
        let config = TapeConfig {
            quit_on_eof: true,
            ..TapeConfig::default()
        };
        let mut emu = tibet_emu("leader 20\n", config);
        emu.write_acia(0, 0x03);
        emu.write_acia(0, 0x15);
        emu.write_ula(0x85);
        assert_eq!(emu.poll(TICK_CYCLES * 40), Some(QuitReason::Eof));
        assert!(emu.tape.prior_exception().is_none());

        let mut emu = tibet_emu("leader 20\n", TapeConfig::default());
        emu.write_acia(0, 0x03);
        emu.write_acia(0, 0x15);
        emu.write_ula(0x85);
        assert_eq!(emu.poll(TICK_CYCLES * 40), None);
    }

    #[test]
    fn blank_tape_never_reports_eof() {
        let config = TapeConfig {
            quit_on_eof: true,
            ..TapeConfig::default()
        };
        let mut emu = EmulatorState::new(config);
        emu.write_acia(0, 0x03);
        emu.write_acia(0, 0x15);
        emu.write_ula(0x85);
        assert_eq!(emu.poll(TICK_CYCLES * 10), None);
    }

    #[test]
    fn expiry_always_quits() {
        let config = TapeConfig {
            expire_cycles: Some(1000),
            ..TapeConfig::default()
        };
        let mut emu = EmulatorState::new(config);
        assert_eq!(emu.poll(1000), None);
        assert_eq!(emu.poll(1), Some(QuitReason::Expired));
    }

    #[test]
    fn faults_disable_the_tape_until_eject() {
        let mut emu = tibet_emu("leader 20\n", TapeConfig::default());
        emu.handle_exception(TapeError::bug("test"));
        assert_eq!(emu.tape.prior_exception().map(TapeError::code), Some(3));
        assert_eq!(emu.quit_reason(), None);
        emu.eject();
        assert!(emu.tape.prior_exception().is_none());
        assert!(!emu.tape.formats().is_loaded_file());
    }

    #[test]
    fn rs423_motor_on_still_rolls_tape() {
        let mut emu = tibet_emu("leader 2000\n", TapeConfig::default());
        emu.write_ula(0xC0 | 0x05);
        assert!(emu.ula.rs423_selected());
        emu.poll(TICK_CYCLES * 20 + 1);
        let t = emu.tape.tallied();
        assert!((19..=21).contains(&t), "tallied {t}");
        assert_eq!(emu.acia.peek_status() & motorola_6850::STATUS_DCD, 0);
    }

    #[test]
    fn reading_the_ula_writes_fe() {
        let mut emu = EmulatorState::default();
        assert_eq!(emu.read_ula(), 0);
        assert_eq!(emu.ula.control(), 0xFE);
        assert!(emu.ula.motor());
    }

    #[test]
    fn cassette_poll_clocks_the_ula_once_per_cycle() {
        let mut emu = EmulatorState::default();
        emu.write_ula(0x05);
        emu.poll(5000);

        let mut ula = SerialUla::new();
        ula.write(0x05);
        ula.tick_n(Ticks::new(5000));
        assert_eq!(emu.ula.snapshot(), ula.snapshot());
    }
}
