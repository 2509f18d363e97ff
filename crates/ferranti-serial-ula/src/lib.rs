//! BBC Micro serial ULA.
//!
//! The ULA sits between the 6850 ACIA and the outside world. It divides the
//! 16/13 MHz serial clock into the ACIA's receive and transmit clocks, switches
//! the ACIA between the cassette and RS423 ports, drives the cassette motor
//! relay, and derives a carrier-detect line from the tape signal.
//!
//! The model here is clocked at the 2 MHz bus rate. Each bus cycle adds
//! 500 ns to the receive and transmit accumulators; an edge fires whenever an
//! accumulator crosses the threshold for the selected divider.
//!
//! # Control register (write only, `&FE10`)
//!
//! | Bits | Meaning                                         |
//! |------|-------------------------------------------------|
//! | 2-0  | Transmit divider index                          |
//! | 5-3  | Receive divider index (RS423 only)              |
//! | 6    | 0 = cassette, 1 = RS423                         |
//! | 7    | Cassette motor relay                            |
//!
//! Reading the register address has the side effect of writing `&FE` to it.

#![allow(clippy::cast_possible_truncation)]

use emu_core::{BUS_CYCLES_PER_1200TH, MasterClock, Observable, Tickable, Value};
use motorola_6850::Acia6850;

/// Clock dividers selected by the three-bit divider fields.
pub const DIVIDERS: [u32; 8] = [1, 16, 4, 128, 2, 64, 8, 256];

/// Bus cycles between DCD sampling ticks (about 211 us).
pub const DCD_BLIP_PERIOD: u32 = 423;
/// DCD sampling ticks of carrier before DCD blips, overclocked.
pub const BLIPTICKS_FAST: u32 = 217;
/// DCD sampling ticks of carrier before DCD blips.
pub const BLIPTICKS_SLOW: u32 = 1083;
/// Bus cycles between tape-noise playback ticks.
pub const NOISE_PERIOD: u32 = 13 * 128;

const TAPEROLL_PERIOD: u32 = BUS_CYCLES_PER_1200TH as u32;
const CTRL_RS423: u8 = 0x40;
const CTRL_MOTOR: u8 = 0x80;
/// Register value assumed before the MOS first programs the ULA.
const BOOT_CONTROL: u8 = 0x64;

/// Errors reported by the ULA model.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UlaError {
    #[error("serial: load state: error @ {0}")]
    LoadState(&'static str),
}

/// Divided-clock edges produced by one bus cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UlaEdges {
    /// Receive clock edge for the ACIA.
    pub rxc: bool,
    /// Transmit clock edge at twice the bit rate.
    pub txc2: bool,
    /// DCD sampling tick.
    pub dcd: bool,
}

/// Dividers and accumulator thresholds derived from a control value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Timing {
    rx_divider: u32,
    tx_divider: u32,
    rx_thresh_ns: u32,
    tx_thresh_ns: u32,
}

impl Timing {
    fn compute(control: u8, overclock: bool) -> Self {
        let rx_divider = if control & CTRL_RS423 == 0 {
            // Cassette fixes the receive divider.
            if overclock { 6 } else { 64 }
        } else {
            DIVIDERS[usize::from((control >> 3) & 7)]
        };
        let tx_divider = DIVIDERS[usize::from(control & 7)];
        Self {
            rx_divider,
            tx_divider,
            rx_thresh_ns: 13 * rx_divider * 1000 / 16,
            // 2TXC, so half the period.
            tx_thresh_ns: 13 * tx_divider * 1000 / 32,
        }
    }
}

/// Counter state carried in save states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UlaSnapshot {
    pub control: u8,
    pub rx_ns: u32,
    pub tx_ns: u32,
    pub dcd: bool,
    pub dcd_counter: u32,
    pub blipticks: u32,
    pub taperoll: u32,
}

/// The serial ULA.
#[derive(Debug, Clone)]
pub struct SerialUla {
    control: u8,
    motor: bool,
    overclock: bool,
    /// An RS423 peer is attached (drives CTS low).
    have_serial_sink: bool,
    timing: Timing,
    rx_ns: u32,
    tx_ns: u32,
    /// Bus cycles since the last DCD sampling tick.
    dcd_counter: u32,
    /// Carrier-detect line as derived from the tape.
    dcd_tape: bool,
    /// DCD sampling ticks of continuous carrier.
    blipticks: u32,
    /// Bus cycles into the current 1/1200 s while RS423 is selected.
    taperoll: u32,
    noise_counter: u32,
    nanos_per_tick: u32,
    last_edges: UlaEdges,
}

impl SerialUla {
    #[must_use]
    pub fn new() -> Self {
        Self {
            control: 0,
            motor: false,
            overclock: false,
            have_serial_sink: false,
            timing: Timing::compute(BOOT_CONTROL, false),
            rx_ns: 0,
            tx_ns: 0,
            dcd_counter: 0,
            dcd_tape: false,
            blipticks: 0,
            taperoll: 0,
            noise_counter: 0,
            nanos_per_tick: MasterClock::BBC_BUS.nanos_per_tick() as u32,
            last_edges: UlaEdges::default(),
        }
    }

    /// Return to power-on state, stopping the motor. Returns `Some(false)`
    /// if the motor was running.
    pub fn reset(&mut self) -> Option<bool> {
        self.control = 0;
        self.dcd_tape = false;
        self.set_motor(false)
    }

    /// Write the control register. Returns the new motor state if the relay
    /// changed.
    pub fn write(&mut self, value: u8) -> Option<bool> {
        self.control = value;
        let change = self.set_motor(value & CTRL_MOTOR != 0);
        self.timing = Timing::compute(value, self.overclock);
        change
    }

    fn set_motor(&mut self, on: bool) -> Option<bool> {
        if on == self.motor {
            return None;
        }
        if on {
            log::debug!("serial: cassette motor on");
        } else {
            log::debug!("serial: cassette motor off");
            self.blipticks = 0;
        }
        self.motor = on;
        Some(on)
    }

    /// Select the overclocked cassette receive divider. Takes effect on the
    /// next control write.
    pub fn set_overclock(&mut self, overclock: bool) {
        self.overclock = overclock;
    }

    pub fn set_serial_sink(&mut self, present: bool) {
        self.have_serial_sink = present;
    }

    #[must_use]
    pub fn control(&self) -> u8 {
        self.control
    }

    #[must_use]
    pub fn motor(&self) -> bool {
        self.motor
    }

    /// True when the ACIA is routed to the RS423 port.
    #[must_use]
    pub fn rs423_selected(&self) -> bool {
        self.control & CTRL_RS423 != 0
    }

    #[must_use]
    pub fn rx_divider(&self) -> u32 {
        self.timing.rx_divider
    }

    #[must_use]
    pub fn tx_divider(&self) -> u32 {
        self.timing.tx_divider
    }

    #[must_use]
    pub fn dcd_tape(&self) -> bool {
        self.dcd_tape
    }

    /// Edges fired by the most recent bus cycle.
    #[must_use]
    pub fn last_edges(&self) -> UlaEdges {
        self.last_edges
    }

    // -----------------------------------------------------------------------
    // Clocks
    // -----------------------------------------------------------------------

    /// Advance one bus cycle and report which divided clocks fired.
    pub fn clock(&mut self) -> UlaEdges {
        let mut edges = UlaEdges::default();
        self.rx_ns += self.nanos_per_tick;
        self.tx_ns += self.nanos_per_tick;
        self.dcd_counter += 1;

        if self.dcd_counter >= DCD_BLIP_PERIOD {
            edges.dcd = true;
            self.dcd_counter = 0;
        }
        if self.rx_ns > self.timing.rx_thresh_ns {
            edges.rxc = true;
            self.rx_ns -= self.timing.rx_thresh_ns;
            // Never fire twice in one cycle; restored states may be out of range.
            if self.rx_ns > self.timing.rx_thresh_ns {
                self.rx_ns = 0;
            }
        }
        if self.tx_ns > self.timing.tx_thresh_ns {
            edges.txc2 = true;
            self.tx_ns -= self.timing.tx_thresh_ns;
            if self.tx_ns > self.timing.tx_thresh_ns {
                self.tx_ns = 0;
            }
        }
        self.last_edges = edges;
        edges
    }

    /// Advance the tape-noise playback clock (1201.9 Hz). Runs in every mode,
    /// motor on or off.
    pub fn clock_noise(&mut self) -> bool {
        self.noise_counter += 1;
        if self.noise_counter > NOISE_PERIOD {
            self.noise_counter = 0;
            return true;
        }
        false
    }

    // -----------------------------------------------------------------------
    // RS423 tape roll
    // -----------------------------------------------------------------------

    /// True when a whole 1/1200 s has rolled past while RS423 is selected.
    #[must_use]
    pub fn taperoll_due(&self) -> bool {
        self.taperoll >= TAPEROLL_PERIOD
    }

    /// Consume a pending DCD sampling tick on the RS423 path.
    pub fn take_rs423_dcd_tick(&mut self) -> bool {
        if self.dcd_counter >= DCD_BLIP_PERIOD {
            self.dcd_counter = 0;
            return true;
        }
        false
    }

    /// Finish one bus cycle of RS423 motor-on tape roll.
    pub fn advance_taperoll(&mut self) {
        if self.taperoll >= TAPEROLL_PERIOD {
            self.taperoll = 0;
        }
        self.taperoll += 1;
        self.dcd_counter += 1;
    }

    /// One bus cycle with RS423 selected and the motor off. Returns true on
    /// each 1/1200 s boundary so the caller can keep tape noise fed.
    pub fn idle_taperoll(&mut self) -> bool {
        let due = self.taperoll >= TAPEROLL_PERIOD;
        if due {
            self.taperoll = 0;
        }
        self.taperoll += 1;
        due
    }

    // -----------------------------------------------------------------------
    // Carrier detect
    // -----------------------------------------------------------------------

    /// Count one DCD sampling tick of the prevailing tape signal. A tick of
    /// `'0'` or silence restarts the count; after enough ticks of carrier the
    /// line blips high for exactly one sampling tick.
    pub fn poll_dcd_blipticks(&mut self, carrier_broken: bool, fast: bool) {
        let ticks_until_blip = if fast { BLIPTICKS_FAST } else { BLIPTICKS_SLOW };
        self.dcd_tape = false;
        if carrier_broken {
            self.blipticks = 0;
        }
        if self.blipticks < ticks_until_blip {
            self.blipticks += 1;
        } else if self.blipticks == ticks_until_blip {
            self.dcd_tape = true;
            self.blipticks += 1;
        }
    }

    /// DCD sampling tick on the cassette path.
    pub fn dcd_tick(&mut self, carrier_broken: bool, fast: bool, acia: &mut Acia6850) {
        if self.motor {
            self.poll_dcd_blipticks(carrier_broken, fast);
        } else {
            self.dcd_tape = false;
        }
        self.push_lines(acia);
    }

    /// Drive the ACIA's DCD and CTS inputs. In RS423 mode DCD is always low
    /// and CTS reflects whether a peer is attached; on cassette CTS is always
    /// asserted and DCD follows the tape.
    pub fn push_lines(&self, acia: &mut Acia6850) {
        let (dcd, cts) = if self.rs423_selected() {
            (false, !self.have_serial_sink)
        } else {
            (self.dcd_tape, false)
        };
        acia.set_dcd(dcd);
        acia.set_cts(cts);
    }

    // -----------------------------------------------------------------------
    // Save state
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn snapshot(&self) -> UlaSnapshot {
        UlaSnapshot {
            control: self.control,
            rx_ns: self.rx_ns,
            tx_ns: self.tx_ns,
            dcd: self.dcd_tape,
            dcd_counter: self.dcd_counter,
            blipticks: self.blipticks,
            taperoll: self.taperoll,
        }
    }

    /// Restore counters from a snapshot. Everything is validated before any
    /// field changes. Returns the motor change implied by the restored
    /// control register.
    pub fn restore(&mut self, snap: &UlaSnapshot) -> Result<Option<bool>, UlaError> {
        if snap.dcd_counter > DCD_BLIP_PERIOD {
            return Err(UlaError::LoadState("ula_dcd_2mhz_counter"));
        }
        if snap.blipticks > BLIPTICKS_SLOW + 1 {
            return Err(UlaError::LoadState("ula_dcd_blipticks"));
        }
        if snap.taperoll > TAPEROLL_PERIOD {
            return Err(UlaError::LoadState("ula_rs423_taperoll_2mhz_counter"));
        }
        let timing = Timing::compute(snap.control, self.overclock);
        if snap.rx_ns > timing.rx_thresh_ns {
            return Err(UlaError::LoadState("ula_rx_ns"));
        }
        if snap.tx_ns > timing.tx_thresh_ns {
            return Err(UlaError::LoadState("ula_tx_ns"));
        }

        let change = self.write(snap.control);
        self.rx_ns = snap.rx_ns;
        self.tx_ns = snap.tx_ns;
        self.dcd_tape = snap.dcd;
        self.dcd_counter = snap.dcd_counter;
        self.blipticks = snap.blipticks;
        self.taperoll = snap.taperoll;
        Ok(change)
    }
}

impl Default for SerialUla {
    fn default() -> Self {
        Self::new()
    }
}

impl Tickable for SerialUla {
    fn tick(&mut self) {
        self.clock();
    }
}

impl Observable for SerialUla {
    fn query(&self, path: &str) -> Option<Value> {
        match path {
            "control" => Some(self.control.into()),
            "motor" => Some(self.motor.into()),
            "rs423" => Some(self.rs423_selected().into()),
            "rx_divider" => Some(self.timing.rx_divider.into()),
            "tx_divider" => Some(self.timing.tx_divider.into()),
            "dcd" => Some(self.dcd_tape.into()),
            "blipticks" => Some(self.blipticks.into()),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "control",
            "motor",
            "rs423",
            "rx_divider",
            "tx_divider",
            "dcd",
            "blipticks",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_core::Ticks;

    /// Helper: count edges over `cycles` bus cycles.
    fn count_edges(ula: &mut SerialUla, cycles: u32) -> (u32, u32, u32) {
        let mut counts = (0, 0, 0);
        for _ in 0..cycles {
            let e = ula.clock();
            counts.0 += u32::from(e.rxc);
            counts.1 += u32::from(e.txc2);
            counts.2 += u32::from(e.dcd);
        }
        counts
    }

    #[test]
    fn cassette_receive_divider_is_fixed() {
        let mut ula = SerialUla::new();
        ula.write(0x05);
        assert_eq!(ula.rx_divider(), 64);
        ula.set_overclock(true);
        ula.write(0x05);
        assert_eq!(ula.rx_divider(), 6);
    }

    #[test]
    fn rs423_dividers_come_from_register_fields() {
        let mut ula = SerialUla::new();
        // RX bits 5-3 = 0b010 (/4), TX bits 2-0 = 0b111 (/256).
        ula.write(0x40 | (2 << 3) | 7);
        assert_eq!(ula.rx_divider(), 4);
        assert_eq!(ula.tx_divider(), 256);
        assert!(ula.rs423_selected());
    }

    #[test]
    fn transmit_divider_always_from_low_bits() {
        let mut ula = SerialUla::new();
        ula.write(0x05);
        assert_eq!(ula.tx_divider(), 64);
    }

    #[test]
    fn cassette_rxc_rate_is_19200_hz() {
        // 13 * 64 * 1000 / 16 = 52000 ns between edges.
        let mut ula = SerialUla::new();
        ula.write(0x85);
        let (rxc, _, _) = count_edges(&mut ula, 2_000_000);
        assert!((19_200..=19_240).contains(&rxc), "rxc = {rxc}");
    }

    #[test]
    fn txc2_is_twice_the_acia_clock() {
        let mut ula = SerialUla::new();
        ula.write(0x85); // TX /64: 19.2 kHz TXC, so 38.4 kHz 2TXC
        let (_, txc2, _) = count_edges(&mut ula, 2_000_000);
        assert!((38_400..=38_480).contains(&txc2), "txc2 = {txc2}");
    }

    #[test]
    fn dcd_tick_every_423_cycles() {
        let mut ula = SerialUla::new();
        let (_, _, dcd) = count_edges(&mut ula, 423 * 10);
        assert_eq!(dcd, 10);
    }

    #[test]
    fn dcd_blips_once_after_carrier() {
        let mut ula = SerialUla::new();
        let mut highs = 0;
        for _ in 0..(BLIPTICKS_FAST + 50) {
            ula.poll_dcd_blipticks(false, true);
            highs += u32::from(ula.dcd_tape());
        }
        assert_eq!(highs, 1);

        // A zero restarts the count.
        ula.poll_dcd_blipticks(true, true);
        assert!(!ula.dcd_tape());
    }

    #[test]
    fn motor_edge_reported_once() {
        let mut ula = SerialUla::new();
        assert_eq!(ula.write(0x85), Some(true));
        assert_eq!(ula.write(0x85), None);
        assert_eq!(ula.write(0x05), Some(false));
    }

    #[test]
    fn rs423_mode_holds_dcd_low() {
        let mut ula = SerialUla::new();
        let mut acia = Acia6850::new();
        ula.write(0x45);
        ula.dcd_tape = true;
        ula.push_lines(&mut acia);
        assert_eq!(acia.query("line.dcd"), Some(Value::Bool(false)));
        assert_eq!(acia.query("line.cts"), Some(Value::Bool(true)));
    }

    #[test]
    fn taperoll_fires_every_1664_cycles() {
        let mut ula = SerialUla::new();
        let fires = (0..1664 * 3 + 1).filter(|_| ula.idle_taperoll()).count();
        assert_eq!(fires, 3);
    }

    #[test]
    fn tick_n_matches_clock() {
        let mut a = SerialUla::new();
        let mut b = SerialUla::new();
        a.write(0x85);
        b.write(0x85);
        a.tick_n(Ticks::new(1000));
        for _ in 0..1000 {
            b.clock();
        }
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn restore_validates_before_mutating() {
        let mut ula = SerialUla::new();
        ula.write(0x05);
        let mut snap = ula.snapshot();
        snap.rx_ns = 1_000_000;
        assert_eq!(ula.restore(&snap), Err(UlaError::LoadState("ula_rx_ns")));
        assert_eq!(ula.control(), 0x05);

        let good = UlaSnapshot {
            control: 0x85,
            rx_ns: 100,
            tx_ns: 100,
            dcd: true,
            dcd_counter: 17,
            blipticks: 3,
            taperoll: 9,
        };
        assert_eq!(ula.restore(&good), Ok(Some(true)));
        assert_eq!(ula.snapshot(), good);
    }
}
