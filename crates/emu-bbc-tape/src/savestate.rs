//! Save-state blocks for the serial ULA and the ACIA.
//!
//! The ULA block is 28 bytes:
//!
//! | offset | field                                   |
//! |--------|-----------------------------------------|
//! | 0      | control register                        |
//! | 1      | prevailing RX tone (`0`, `1`, `L`, `S`) |
//! | 2..6   | 300-baud quorum buffer                  |
//! | 6      | quorum fill                             |
//! | 7      | RX accumulator (ns, u32 LE)             |
//! | 11     | TX accumulator (ns, u32 LE)             |
//! | 15     | DCD line                                |
//! | 16     | DCD 2 MHz counter (u32 LE)              |
//! | 20     | DCD blip ticks (u32 LE)                 |
//! | 24     | RS423 tape-roll counter (u32 LE)        |
//!
//! followed by the ACIA's own 26-byte block. Everything is validated before
//! anything is applied.

use ferranti_serial_ula::UlaSnapshot;
use motorola_6850::SAVESTATE_LEN as ACIA_LEN;

use crate::codec::{push_u32, read_u32};
use crate::error::{Recoverable, Result};
use crate::machine::EmulatorState;
use crate::read::Tones300;
use crate::tone::Tone;

pub const ULA_LEN: usize = 28;
/// Combined length of the ULA and ACIA blocks.
pub const STATE_LEN: usize = ULA_LEN + ACIA_LEN;

/// Serialised ULA block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UlaBlock {
    pub snapshot: UlaSnapshot,
    pub prevailing: Option<Tone>,
    pub tones300: Tones300,
}

impl UlaBlock {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; ULA_LEN] {
        let s = &self.snapshot;
        let mut v = Vec::with_capacity(ULA_LEN);
        v.push(s.control);
        v.push(self.prevailing.map_or(0, |t| t.as_char() as u8));
        v.extend_from_slice(&self.tones300.to_bytes());
        v.push(self.tones300.fill());
        push_u32(&mut v, s.rx_ns);
        push_u32(&mut v, s.tx_ns);
        v.push(u8::from(s.dcd));
        push_u32(&mut v, s.dcd_counter);
        push_u32(&mut v, s.blipticks);
        push_u32(&mut v, s.taperoll);
        let mut out = [0; ULA_LEN];
        out.copy_from_slice(&v);
        out
    }

    /// Parse and check the fields this crate owns. Counter ranges are
    /// checked by the ULA itself on restore.
    pub fn from_bytes(b: &[u8; ULA_LEN]) -> Result<Self> {
        let prevailing = match b[1] {
            0 => None,
            c => Some(
                Tone::from_char(char::from(c))
                    .ok_or(Recoverable::LoadState("ula_prevailing_rx_bit_value"))?,
            ),
        };
        let tones300 = Tones300::from_bytes([b[2], b[3], b[4], b[5]], b[6])
            .ok_or(Recoverable::LoadState("ula_rx_tones300"))?;
        if b[15] > 1 {
            return Err(Recoverable::LoadState("ula_dcd_tape").into());
        }
        Ok(Self {
            snapshot: UlaSnapshot {
                control: b[0],
                rx_ns: read_u32(&b[7..]),
                tx_ns: read_u32(&b[11..]),
                dcd: b[15] != 0,
                dcd_counter: read_u32(&b[16..]),
                blipticks: read_u32(&b[20..]),
                taperoll: read_u32(&b[24..]),
            },
            prevailing,
            tones300,
        })
    }
}

impl EmulatorState {
    /// ULA block followed by the ACIA block.
    #[must_use]
    pub fn save_state(&self) -> Vec<u8> {
        let ula = UlaBlock {
            snapshot: self.ula.snapshot(),
            prevailing: self.tape.rx.prevailing,
            tones300: self.tape.rx.tones300,
        };
        let mut out = Vec::with_capacity(STATE_LEN);
        out.extend_from_slice(&ula.to_bytes());
        out.extend_from_slice(&self.acia.save_state());
        out
    }

    /// Restore both blocks. On any error nothing changes.
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != STATE_LEN {
            log::warn!("serial: load state: expected {STATE_LEN} bytes, got {}", bytes.len());
            return Err(Recoverable::LoadState("length").into());
        }
        let (ula_bytes, acia_bytes) = bytes.split_at(ULA_LEN);
        let mut ula_block = [0; ULA_LEN];
        ula_block.copy_from_slice(ula_bytes);
        let mut acia_block = [0; ACIA_LEN];
        acia_block.copy_from_slice(acia_bytes);

        let block = UlaBlock::from_bytes(&ula_block)?;
        let mut ula = self.ula.clone();
        let motor_change = ula.restore(&block.snapshot)?;
        let mut acia = self.acia.clone();
        acia.load_state(&acia_block)?;

        self.ula = ula;
        self.acia = acia;
        self.tape.rx.prevailing = block.prevailing;
        self.tape.rx.tones300 = block.tones300;
        if let Some(on) = motor_change {
            self.noise.motorchange(on);
            self.send_to_gui(crate::transport::ToGui::Motor(on));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> EmulatorState {
        let mut emu = EmulatorState::default();
        emu.write_acia(0, 0x03);
        emu.write_acia(0, 0x15);
        emu.write_ula(0x85);
        emu.poll(5000);
        emu
    }

    #[test]
    fn save_then_load_restores_counters() {
        let emu = running();
        let bytes = emu.save_state();
        assert_eq!(bytes.len(), STATE_LEN);
        assert_eq!(bytes[0], 0x85);

        let mut other = EmulatorState::default();
        other.load_state(&bytes).expect("load");
        assert_eq!(other.ula.snapshot(), emu.ula.snapshot());
        assert!(other.ula.motor());
        assert_eq!(other.save_state(), bytes);
    }

    #[test]
    fn corrupt_blocks_are_rejected_without_change() {
        let emu = running();
        let good = emu.save_state();
        let mut other = EmulatorState::default();
        let before = other.save_state();

        let mut bad = good.clone();
        bad[1] = b'x';
        assert!(other.load_state(&bad).is_err());

        let mut bad = good.clone();
        bad[6] = 4;
        assert!(other.load_state(&bad).is_err());

        let mut bad = good.clone();
        bad[16..20].copy_from_slice(&100_000u32.to_le_bytes());
        let err = other.load_state(&bad).expect_err("dcd counter out of range");
        assert_eq!(err.code(), 12);

        assert!(other.load_state(&good[..10]).is_err());
        assert_eq!(other.save_state(), before);
    }
}
