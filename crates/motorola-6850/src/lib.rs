//! Motorola MC6850 Asynchronous Communications Interface Adapter (ACIA).
//!
//! The BBC Micro routes both the cassette interface and the RS423 port
//! through a single 6850 sitting behind the serial ULA. The ULA supplies the
//! receive and transmit clocks; the ACIA divides them again, shifts bits in
//! and out, and raises an interrupt when a byte is ready.
//!
//! # Registers
//!
//! | Addr | Read            | Write            |
//! |------|-----------------|------------------|
//! | 0    | Status register | Control register |
//! | 1    | Receive data    | Transmit data    |
//!
//! # Control register
//!
//! | Bits | Meaning                                                  |
//! |------|----------------------------------------------------------|
//! | 1-0  | Counter divide: 00 /1, 01 /16, 10 /64, 11 master reset   |
//! | 4-2  | Word select (see [`SerialFraming::from_control`])        |
//! | 6-5  | Transmit control (RTS, TX interrupt enable, break)       |
//! | 7    | Receive interrupt enable                                 |
//!
//! Unlike a polled chip model the ACIA here is clock-driven: the caller
//! forwards every ULA RXC edge to [`Acia6850::poll_rxc`] and every 2TXC edge
//! to [`Acia6850::poll_2txc`], and feeds received bits in with
//! [`Acia6850::receive_bit`] whenever the divided receive clock fires.

#![allow(clippy::cast_possible_truncation)]

mod framing;

pub use framing::{Parity, SerialFraming};

use emu_core::{Observable, Value};

// ---------------------------------------------------------------------------
// Register bits
// ---------------------------------------------------------------------------

/// Status: receive data register full.
pub const STATUS_RDRF: u8 = 0x01;
/// Status: transmit data register empty.
pub const STATUS_TDRE: u8 = 0x02;
/// Status: data carrier detect (latched).
pub const STATUS_DCD: u8 = 0x04;
/// Status: clear to send.
pub const STATUS_CTS: u8 = 0x08;
/// Status: framing error.
pub const STATUS_FE: u8 = 0x10;
/// Status: receiver overrun.
pub const STATUS_OVRN: u8 = 0x20;
/// Status: parity error.
pub const STATUS_PE: u8 = 0x40;
/// Status: interrupt request.
pub const STATUS_IRQ: u8 = 0x80;

const CTRL_DIVIDE_MASK: u8 = 0x03;
const CTRL_8_BITS: u8 = 0x10;
const CTRL_PARITY_PRESENT_8: u8 = 0x08;
const CTRL_PARITY_ODD: u8 = 0x04;
const CTRL_TX_MASK: u8 = 0x60;
const CTRL_TX_RTS_AND_TIE: u8 = 0x20;
const CTRL_RIE: u8 = 0x80;

/// Size of the serialised ACIA state block.
pub const SAVESTATE_LEN: usize = 26;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors reported by the ACIA model.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AciaError {
    /// Internal inconsistency in the shift register or receive machine.
    #[error("acia: BUG: {0}")]
    Bug(String),
    /// A save-state block failed validation.
    #[error("acia: load state: state is corrupt @ {0}")]
    LoadState(&'static str),
}

pub type Result<T> = std::result::Result<T, AciaError>;

// ---------------------------------------------------------------------------
// Receive state machine
// ---------------------------------------------------------------------------

/// Position of the receiver within an incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Only reachable from a corrupted save state; never entered otherwise.
    Null,
    NeedStart,
    NeedData,
    NeedParity,
    NeedStop,
}

impl RxState {
    const fn to_byte(self) -> u8 {
        match self {
            Self::Null => 0,
            Self::NeedStart => 1,
            Self::NeedData => 2,
            Self::NeedParity => 3,
            Self::NeedStop => 4,
        }
    }

    const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Null),
            1 => Some(Self::NeedStart),
            2 => Some(Self::NeedData),
            3 => Some(Self::NeedParity),
            4 => Some(Self::NeedStop),
            _ => None,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::NeedStart => "need_start",
            Self::NeedData => "need_data",
            Self::NeedParity => "need_parity",
            Self::NeedStop => "need_stop",
        }
    }
}

/// Result of one 2TXC edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxClock {
    /// A whole bit period has elapsed; the shift register may be run.
    pub bit_clock: bool,
    /// The ACIA's current transmit divider (1, 16 or 64).
    pub divider: u32,
}

// ---------------------------------------------------------------------------
// Acia6850
// ---------------------------------------------------------------------------

/// Motorola MC6850 ACIA.
#[derive(Debug, Clone)]
pub struct Acia6850 {
    /// CTS input line (high = not clear to send).
    line_cts: bool,
    /// DCD input line.
    line_dcd: bool,
    control: u8,
    status: u8,
    /// Status as presented to the CPU (TDRE masked by CTS, DCD following the line).
    status_for_read: u8,
    rx_data: u8,
    tx_data: u8,

    rx_shift_count: u8,
    rx_shift: u8,
    rx_overflow: bool,
    rx_parity_error: bool,
    rx_framing_error: bool,
    rx_state: RxState,
    /// Odd number of ones seen so far in the incoming frame.
    parity_acc: bool,
    rxc_count: u32,
    txc_count: u32,

    tx_shift_value: u8,
    tx_shift_pos: u8,
    tx_shift_loaded: bool,
    tx_data_loaded: bool,
    /// TDRE is raised half a bit after the data register empties.
    tx_waiting_to_set_tdre: bool,

    warned_receive_full: bool,
    irq: bool,
}

impl Acia6850 {
    /// Create an ACIA in its power-on state.
    #[must_use]
    pub fn new() -> Self {
        let mut acia = Self {
            line_cts: false,
            line_dcd: false,
            control: 0,
            status: 0,
            status_for_read: 0,
            rx_data: 0,
            tx_data: 0,
            rx_shift_count: 0,
            rx_shift: 0,
            rx_overflow: false,
            rx_parity_error: false,
            rx_framing_error: false,
            rx_state: RxState::NeedStart,
            parity_acc: false,
            rxc_count: 0,
            txc_count: 0,
            tx_shift_value: 0,
            tx_shift_pos: 0,
            tx_shift_loaded: false,
            tx_data_loaded: false,
            tx_waiting_to_set_tdre: false,
            warned_receive_full: false,
            irq: false,
        };
        acia.master_reset();
        acia
    }

    // -----------------------------------------------------------------------
    // Bus interface
    // -----------------------------------------------------------------------

    /// CPU read. Reading the data register clears latched DCD and OVRN.
    pub fn read(&mut self, addr: u16) -> u8 {
        if addr & 1 == 0 {
            return self.status_for_read;
        }
        self.status &= !(STATUS_DCD | STATUS_OVRN);
        if self.rx_overflow {
            // Overrun only shows once the byte before it has been read.
            self.rx_overflow = false;
            self.status |= STATUS_OVRN;
        } else {
            self.status &= !STATUS_RDRF;
        }
        self.update_irq_and_status_read();
        self.rx_data
    }

    /// CPU write. Writing `xxxxxx11` to the control register is a master
    /// reset, which also clears the control register.
    pub fn write(&mut self, addr: u16, value: u8) {
        if addr & 1 == 0 {
            if value & CTRL_DIVIDE_MASK == CTRL_DIVIDE_MASK {
                self.master_reset();
            } else {
                self.control = value;
            }
        } else {
            if self.tx_data_loaded {
                log::warn!(
                    "acia: warning: data reg write: already loaded! (old {:x}, new {value:x})",
                    self.tx_data
                );
            }
            self.tx_data = value;
            self.tx_data_loaded = true;
            self.status &= !STATUS_TDRE;
        }
        self.update_irq_and_status_read();
    }

    /// Status register as the CPU would see it, without side effects.
    #[must_use]
    pub fn peek_status(&self) -> u8 {
        self.status_for_read
    }

    #[must_use]
    pub fn control(&self) -> u8 {
        self.control
    }

    /// Framing selected by the current control register.
    #[must_use]
    pub fn framing(&self) -> SerialFraming {
        SerialFraming::from_control(self.control)
    }

    /// Interrupt output (active high here; inverted on the real pin).
    #[must_use]
    pub fn irq(&self) -> bool {
        self.irq
    }

    // -----------------------------------------------------------------------
    // Modem lines
    // -----------------------------------------------------------------------

    /// Drive the DCD input. A rising edge latches the DCD status bit.
    pub fn set_dcd(&mut self, dcd: bool) {
        if dcd && !self.line_dcd {
            self.status |= STATUS_DCD;
            self.update_irq_and_status_read();
        }
        self.line_dcd = dcd;
    }

    /// Drive the CTS input. Dropping CTS also drops the DCD line.
    pub fn set_cts(&mut self, cts: bool) {
        self.status &= !STATUS_CTS;
        if cts {
            self.status |= STATUS_CTS;
        }
        self.line_cts = cts;
        if !cts {
            self.set_dcd(false);
        }
        self.update_irq_and_status_read();
    }

    // -----------------------------------------------------------------------
    // Receive side
    // -----------------------------------------------------------------------

    /// Clock the receive divider once. Returns the divider when the divided
    /// clock fires, meaning one bit must now be supplied via
    /// [`Self::receive_bit`].
    pub fn poll_rxc(&mut self) -> Result<Option<u32>> {
        let divider = match self.control & CTRL_DIVIDE_MASK {
            0 => 1,
            1 => 16,
            2 => 64,
            _ => {
                log::warn!("acia: BUG: poll_rxc: bad control_reg &{:x}", self.control);
                return Err(AciaError::Bug(format!(
                    "poll_rxc: bad control_reg &{:x}",
                    self.control
                )));
            }
        };
        let fire = self.rxc_count >= divider;
        if fire {
            self.rxc_count = 0;
        }
        self.rxc_count += 1;
        Ok(fire.then_some(divider))
    }

    /// Shift one received bit into the frame.
    pub fn receive_bit(&mut self, bit: bool) -> Result<()> {
        match self.rx_state {
            RxState::NeedStart => {
                if !bit {
                    let stale = if self.rx_shift != 0 {
                        Some(format!("start bit: rx_shift_reg != 0 ({:x})", self.rx_shift))
                    } else if self.rx_shift_count != 0 {
                        Some(format!(
                            "start bit: rx_shift_reg_count != 0 ({})",
                            self.rx_shift_count
                        ))
                    } else if self.parity_acc || self.rx_parity_error || self.rx_framing_error {
                        Some("start bit: stale receive state".to_string())
                    } else {
                        None
                    };
                    self.rx_state = RxState::NeedData;
                    if let Some(msg) = stale {
                        log::warn!("acia: BUG: {msg}");
                        return Err(AciaError::Bug(msg));
                    }
                }
            }
            RxState::NeedData => {
                if bit {
                    self.rx_shift |= 1 << self.rx_shift_count;
                    self.parity_acc = !self.parity_acc;
                }
                self.rx_shift_count += 1;
                if self.control & CTRL_8_BITS != 0 {
                    if self.rx_shift_count == 8 {
                        self.rx_state = if self.control & CTRL_PARITY_PRESENT_8 != 0 {
                            RxState::NeedParity
                        } else {
                            RxState::NeedStop
                        };
                    }
                } else if self.rx_shift_count == 7 {
                    self.rx_state = RxState::NeedParity;
                }
            }
            RxState::NeedParity => {
                if bit {
                    self.parity_acc = !self.parity_acc;
                }
                if self.parity_acc != (self.control & CTRL_PARITY_ODD != 0) {
                    self.rx_parity_error = true;
                }
                self.rx_state = RxState::NeedStop;
            }
            RxState::NeedStop => {
                if !bit {
                    self.rx_framing_error = true;
                }
                self.transfer_shift_to_data();
                self.rx_state = RxState::NeedStart;
            }
            RxState::Null => {
                log::warn!("acia: BUG: rx bad state");
                return Err(AciaError::Bug("rx bad state".to_string()));
            }
        }
        Ok(())
    }

    /// True while the receiver is idle, waiting for a start bit.
    #[must_use]
    pub fn rx_awaiting_start(&self) -> bool {
        self.rx_state == RxState::NeedStart
    }

    fn transfer_shift_to_data(&mut self) {
        if self.status & STATUS_RDRF != 0 {
            if !self.warned_receive_full {
                log::warn!("acia: receive buffer full");
                self.warned_receive_full = true;
            }
        } else {
            self.warned_receive_full = false;
        }
        self.status |= STATUS_RDRF;
        self.status &= !(STATUS_FE | STATUS_PE);
        self.rx_data = self.rx_shift;
        if self.warned_receive_full {
            self.rx_overflow = true;
        } else {
            if self.rx_parity_error {
                self.status |= STATUS_PE;
            }
            if self.rx_framing_error {
                self.status |= STATUS_FE;
            }
        }
        self.clear_receive_state();
        self.update_irq_and_status_read();
    }

    fn clear_receive_state(&mut self) {
        self.rx_shift = 0;
        self.rx_shift_count = 0;
        self.parity_acc = false;
        self.rxc_count = 0;
        self.rx_parity_error = false;
        self.rx_framing_error = false;
    }

    // -----------------------------------------------------------------------
    // Transmit side
    // -----------------------------------------------------------------------

    /// Clock the transmit side at twice the bit rate. Raises a pending TDRE on
    /// the half-bit and reports whether a full bit period has elapsed.
    pub fn poll_2txc(&mut self) -> TxClock {
        let divider = match self.control & CTRL_DIVIDE_MASK {
            0 => 1,
            1 => 16,
            _ => 64,
        };
        // A divider change can leave the counter out of range.
        while self.txc_count > 2 * divider {
            self.txc_count -= 2 * divider;
        }
        let mut half_bit = false;
        let mut full_bit = false;
        if self.txc_count == 2 * divider {
            full_bit = true;
            half_bit = true;
            self.txc_count = 0;
        } else if self.txc_count == divider {
            half_bit = true;
        }
        if half_bit && self.tx_waiting_to_set_tdre {
            self.tx_waiting_to_set_tdre = false;
            self.status |= STATUS_TDRE;
            self.update_irq_and_status_read();
        }
        self.txc_count += 1;
        TxClock {
            bit_clock: full_bit,
            divider,
        }
    }

    /// Advance the transmit shift register by one bit period and refill it
    /// from the data register when it has emptied. Returns the bit now at the
    /// output when the register was loaded.
    pub fn run_tx_shift_register(&mut self, framing: &SerialFraming) -> Result<Option<bool>> {
        let mut bit = None;
        if self.tx_shift_loaded {
            self.tx_shift(framing)?;
            bit = Some(self.tx_shift_value & 1 != 0);
        }
        if !self.tx_shift_loaded && self.tx_data_loaded {
            self.tx_shift_value = self.tx_data;
            self.tx_shift_loaded = true;
            self.tx_shift_pos = 0;
            self.tx_data_loaded = false;
            self.tx_waiting_to_set_tdre = true;
            self.update_irq_and_status_read();
        }
        Ok(bit)
    }

    fn tx_shift(&mut self, framing: &SerialFraming) -> Result<()> {
        if framing.data_bits != 7 && framing.data_bits != 8 {
            return Err(AciaError::Bug(format!(
                "framing illegal ({} data bits)",
                framing.data_bits
            )));
        }
        if self.tx_shift_pos > 0 {
            self.tx_shift_value >>= 1;
        }
        let last = 1 + framing.data_bits;
        if self.tx_shift_pos < last {
            self.tx_shift_pos += 1;
        } else if self.tx_shift_pos == last {
            self.tx_shift_loaded = false;
            self.tx_shift_pos = 0;
        } else {
            log::warn!("acia: illegal shift {}", self.tx_shift_pos);
            return Err(AciaError::Bug(format!("illegal shift {}", self.tx_shift_pos)));
        }
        Ok(())
    }

    #[must_use]
    pub fn tx_shift_reg_loaded(&self) -> bool {
        self.tx_shift_loaded
    }

    /// Bits shifted out of the current frame so far.
    #[must_use]
    pub fn tx_shift_pos(&self) -> u8 {
        self.tx_shift_pos
    }

    /// Remaining contents of the transmit shift register.
    #[must_use]
    pub fn tx_shift_value(&self) -> u8 {
        self.tx_shift_value
    }

    /// Abandon whatever is in the transmit shift register.
    pub fn reset_tx_shift_register(&mut self) {
        self.tx_shift_pos = 0;
        self.tx_shift_loaded = false;
        self.tx_shift_value = 0;
    }

    // -----------------------------------------------------------------------
    // Reset and interrupt
    // -----------------------------------------------------------------------

    fn master_reset(&mut self) {
        let cts = self.status & STATUS_CTS != 0;
        self.rx_data = 0;
        self.tx_data = 0;
        self.rx_state = RxState::NeedStart;
        self.clear_receive_state();
        self.rx_overflow = false;
        self.status = STATUS_TDRE;
        self.control = 0;
        // External line levels survive a reset.
        self.set_dcd(self.line_dcd);
        self.set_cts(cts);
        self.reset_tx_shift_register();
        self.tx_data_loaded = false;
    }

    fn update_irq_and_status_read(&mut self) {
        let mut fire_tx = false;
        if self.control & CTRL_TX_MASK == CTRL_TX_RTS_AND_TIE {
            fire_tx = self.status & STATUS_TDRE != 0 && self.status & STATUS_CTS == 0;
        }
        let mut fire_rx = false;
        if self.control & CTRL_RIE != 0 {
            fire_rx = self.status & (STATUS_RDRF | STATUS_DCD | STATUS_OVRN) != 0;
        }
        self.irq = fire_tx || fire_rx;
        self.status &= !STATUS_IRQ;
        if self.irq {
            self.status |= STATUS_IRQ;
        }

        let mut for_read = self.status;
        // CTS high inhibits TDRE.
        if self.status & STATUS_CTS != 0 {
            for_read &= !STATUS_TDRE;
        }
        if self.line_dcd && !self.line_cts {
            for_read |= STATUS_DCD;
        }
        self.status_for_read = for_read;
    }

    // -----------------------------------------------------------------------
    // Save state
    // -----------------------------------------------------------------------

    /// Serialise the chip into its 26-byte save-state block.
    #[must_use]
    pub fn save_state(&self) -> [u8; SAVESTATE_LEN] {
        let mut b = [0u8; SAVESTATE_LEN];
        b[0] = self.control;
        b[1] = self.status;
        b[2] = u8::from(self.line_cts);
        b[3] = u8::from(self.line_dcd);
        b[4] = self.rx_data;
        b[5] = self.tx_data;
        b[6] = self.rx_shift_count;
        b[7] = self.rx_shift;
        b[8] = u8::from(self.rx_overflow);
        b[9] = u8::from(self.rx_parity_error);
        b[10] = u8::from(self.rx_framing_error);
        b[11] = self.rx_state.to_byte();
        b[12] = u8::from(self.parity_acc);
        b[13..17].copy_from_slice(&self.rxc_count.to_le_bytes());
        b[17..21].copy_from_slice(&self.txc_count.to_le_bytes());
        b[21] = self.tx_shift_value;
        b[22] = self.tx_shift_pos;
        b[23] = u8::from(self.tx_shift_loaded);
        b[24] = u8::from(self.tx_data_loaded);
        b[25] = u8::from(self.tx_waiting_to_set_tdre);
        b
    }

    /// Restore from a save-state block. Nothing is modified if validation
    /// fails.
    pub fn load_state(&mut self, b: &[u8; SAVESTATE_LEN]) -> Result<()> {
        let checks: [(usize, &'static str); 5] = [
            (2, "line_cts"),
            (3, "line_dcd"),
            (8, "rx_sr_overflow"),
            (9, "rx_sr_parity_error"),
            (10, "rx_sr_framing_error"),
        ];
        for (ix, name) in checks {
            if b[ix] & 0xfe != 0 {
                log::warn!("acia: load state: state is corrupt @ {name}");
                return Err(AciaError::LoadState(name));
            }
        }
        let Some(rx_state) = RxState::from_byte(b[11]) else {
            log::warn!("acia: load state: state is corrupt @ state");
            return Err(AciaError::LoadState("state"));
        };
        if b[22] > 9 {
            log::warn!("acia: load state: state is corrupt @ tx_shift_reg_shift ({})", b[22]);
            return Err(AciaError::LoadState("tx_shift_reg_shift"));
        }

        self.control = b[0];
        self.status = b[1];
        self.line_cts = b[2] != 0;
        self.line_dcd = b[3] != 0;
        self.rx_data = b[4];
        self.tx_data = b[5];
        self.rx_shift_count = b[6];
        self.rx_shift = b[7];
        self.rx_overflow = b[8] != 0;
        self.rx_parity_error = b[9] != 0;
        self.rx_framing_error = b[10] != 0;
        self.rx_state = rx_state;
        self.parity_acc = b[12] != 0;
        self.rxc_count = u32::from_le_bytes([b[13], b[14], b[15], b[16]]);
        self.txc_count = u32::from_le_bytes([b[17], b[18], b[19], b[20]]);
        self.tx_shift_value = b[21];
        self.tx_shift_pos = b[22];
        self.tx_shift_loaded = b[23] != 0;
        self.tx_data_loaded = b[24] != 0;
        self.tx_waiting_to_set_tdre = b[25] != 0;
        self.update_irq_and_status_read();
        Ok(())
    }
}

impl Default for Acia6850 {
    fn default() -> Self {
        Self::new()
    }
}

impl Observable for Acia6850 {
    fn query(&self, path: &str) -> Option<Value> {
        match path {
            "control" => Some(self.control.into()),
            "status" => Some(self.status_for_read.into()),
            "status.rdrf" => Some((self.status & STATUS_RDRF != 0).into()),
            "status.tdre" => Some((self.status_for_read & STATUS_TDRE != 0).into()),
            "status.dcd" => Some((self.status_for_read & STATUS_DCD != 0).into()),
            "status.irq" => Some(self.irq.into()),
            "framing" => Some(self.framing().label().into()),
            "rx.state" => Some(self.rx_state.name().into()),
            "rx.data" => Some(self.rx_data.into()),
            "tx.loaded" => Some(self.tx_shift_loaded.into()),
            "tx.shift" => Some(self.tx_shift_pos.into()),
            "line.dcd" => Some(self.line_dcd.into()),
            "line.cts" => Some(self.line_cts.into()),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "control",
            "status",
            "status.rdrf",
            "status.tdre",
            "status.dcd",
            "status.irq",
            "framing",
            "rx.state",
            "rx.data",
            "tx.loaded",
            "tx.shift",
            "line.dcd",
            "line.cts",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: an ACIA set to 8N1 with the /16 divider, as the MOS uses for
    /// 1200 baud cassette.
    fn acia_8n1() -> Acia6850 {
        let mut acia = Acia6850::new();
        acia.write(0, 0x15);
        acia
    }

    /// Helper: clock a whole 8N1 frame into the receiver.
    fn feed_frame(acia: &mut Acia6850, byte: u8, stop: bool) {
        acia.receive_bit(false).expect("start");
        for i in 0..8 {
            acia.receive_bit(byte & (1 << i) != 0).expect("data");
        }
        acia.receive_bit(stop).expect("stop");
    }

    #[test]
    fn power_on_reports_tdre() {
        let acia = Acia6850::new();
        assert_eq!(acia.peek_status() & STATUS_TDRE, STATUS_TDRE);
        assert!(acia.rx_awaiting_start());
    }

    #[test]
    fn receives_8n1_byte() {
        let mut acia = acia_8n1();
        feed_frame(&mut acia, 0xA5, true);
        assert_eq!(acia.peek_status() & STATUS_RDRF, STATUS_RDRF);
        assert_eq!(acia.peek_status() & STATUS_FE, 0);
        assert_eq!(acia.read(1), 0xA5);
        assert_eq!(acia.peek_status() & STATUS_RDRF, 0);
    }

    #[test]
    fn idle_ones_do_not_start_frame() {
        let mut acia = acia_8n1();
        for _ in 0..20 {
            acia.receive_bit(true).expect("idle");
        }
        assert!(acia.rx_awaiting_start());
    }

    #[test]
    fn missing_stop_bit_is_framing_error() {
        let mut acia = acia_8n1();
        feed_frame(&mut acia, 0x00, false);
        assert_eq!(acia.peek_status() & STATUS_FE, STATUS_FE);
    }

    #[test]
    fn parity_error_on_7e1() {
        let mut acia = Acia6850::new();
        acia.write(0, 0x09); // 7E1, /16
        acia.receive_bit(false).expect("start");
        // 0x01 has one set bit, so even parity needs a 1.
        acia.receive_bit(true).expect("d0");
        for _ in 1..7 {
            acia.receive_bit(false).expect("data");
        }
        acia.receive_bit(false).expect("parity");
        acia.receive_bit(true).expect("stop");
        assert_eq!(acia.peek_status() & STATUS_PE, STATUS_PE);
        assert_eq!(acia.read(1), 0x01);
    }

    #[test]
    fn second_unread_byte_raises_overrun_after_read() {
        let mut acia = acia_8n1();
        feed_frame(&mut acia, 0x11, true);
        feed_frame(&mut acia, 0x22, true);
        let _ = acia.read(1);
        assert_eq!(acia.peek_status() & STATUS_OVRN, STATUS_OVRN);
    }

    #[test]
    fn dcd_latches_on_rising_edge_and_clears_on_data_read() {
        let mut acia = acia_8n1();
        acia.set_dcd(true);
        acia.set_dcd(false);
        assert_eq!(acia.peek_status() & STATUS_DCD, STATUS_DCD);
        let _ = acia.read(1);
        assert_eq!(acia.peek_status() & STATUS_DCD, 0);
    }

    #[test]
    fn cts_high_masks_tdre() {
        let mut acia = acia_8n1();
        acia.set_cts(true);
        assert_eq!(acia.peek_status() & STATUS_TDRE, 0);
        acia.set_cts(false);
        assert_eq!(acia.peek_status() & STATUS_TDRE, STATUS_TDRE);
    }

    #[test]
    fn rxc_divides_by_sixteen() {
        let mut acia = acia_8n1();
        let fires = (0..=64)
            .filter_map(|_| acia.poll_rxc().expect("poll"))
            .count();
        assert_eq!(fires, 4);
    }

    #[test]
    fn master_reset_divide_is_rejected_by_rxc() {
        let mut acia = acia_8n1();
        acia.control = 0x03;
        assert!(acia.poll_rxc().is_err());
    }

    #[test]
    fn transmit_shifts_lsb_first_and_sets_tdre_late() {
        let mut acia = acia_8n1();
        let framing = acia.framing();
        acia.write(1, 0b1000_0001);
        assert_eq!(acia.peek_status() & STATUS_TDRE, 0);

        // Load the shift register.
        assert_eq!(acia.run_tx_shift_register(&framing).expect("load"), None);
        assert!(acia.tx_shift_reg_loaded());
        assert_eq!(acia.peek_status() & STATUS_TDRE, 0);

        // TDRE arrives on the next half-bit edge.
        let mut ticks = 0;
        while acia.peek_status() & STATUS_TDRE == 0 {
            let _ = acia.poll_2txc();
            ticks += 1;
        }
        assert!(ticks <= 17);

        let mut bits = Vec::new();
        while acia.tx_shift_reg_loaded() {
            if let Some(b) = acia.run_tx_shift_register(&framing).expect("shift") {
                bits.push(b);
            }
        }
        assert_eq!(&bits[..8], &[true, false, false, false, false, false, false, true]);
    }

    #[test]
    fn two_txc_full_bit_every_two_dividers() {
        let mut acia = acia_8n1();
        let full = (0..=320).filter(|_| acia.poll_2txc().bit_clock).count();
        assert_eq!(full, 10);
    }

    #[test]
    fn master_reset_clears_control() {
        let mut acia = acia_8n1();
        acia.write(0, 0x03);
        assert_eq!(acia.control(), 0);
        assert_eq!(acia.peek_status() & STATUS_TDRE, STATUS_TDRE);
    }

    #[test]
    fn receive_interrupt_when_enabled() {
        let mut acia = Acia6850::new();
        acia.write(0, 0x95);
        feed_frame(&mut acia, 0x42, true);
        assert!(acia.irq());
        let _ = acia.read(1);
        assert!(!acia.irq());
    }

    #[test]
    fn savestate_round_trip() {
        let mut acia = acia_8n1();
        acia.write(1, 0x55);
        acia.receive_bit(false).expect("start");
        acia.receive_bit(true).expect("d0");
        let block = acia.save_state();

        let mut restored = Acia6850::new();
        restored.load_state(&block).expect("load");
        assert_eq!(restored.save_state(), block);
        assert_eq!(restored.query("rx.state"), Some(Value::from("need_data")));
    }

    #[test]
    fn savestate_rejects_bad_rx_state() {
        let mut block = acia_8n1().save_state();
        block[11] = 9;
        let mut acia = Acia6850::new();
        assert_eq!(acia.load_state(&block), Err(AciaError::LoadState("state")));
    }

    #[test]
    fn savestate_rejects_bad_shift() {
        let mut block = acia_8n1().save_state();
        block[22] = 10;
        let mut acia = Acia6850::new();
        assert!(acia.load_state(&block).is_err());
    }
}
