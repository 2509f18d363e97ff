//! File listing for the tape in the deck.
//!
//! A copy of the tape is played through a private ACIA at 8N1, one bit per
//! tick, and the resulting byte stream is searched for MOS cassette block
//! headers:
//!
//! ```text
//! '*'  name (1-10 chars, NUL)  load(4)  exec(4)  block(2)  length(2)
//! flags(1)  next-file(4)  header CRC(2)  data(length)  data CRC(2)
//! ```
//!
//! Every block's length is added to the running file size; a block flagged
//! final (or shorter than 256 bytes) closes the file and emits an entry.

use std::fmt;

use motorola_6850::{Acia6850, STATUS_RDRF};

use crate::error::Result;
use crate::machine::EmulatorState;
use crate::tone::Tone;

/// 8N1, /1. The catalogue feeds the receiver one bit per tick.
const CATALOGUE_CONTROL: u8 = 0x14;

/// Header bytes up to and including the next-file address.
const HEADER_LEN: usize = 29;
const NAME_MAX: usize = 10;

const FLAG_FINAL: u8 = 0x80;
const FLAG_EMPTY: u8 = 0x40;

/// One file found on the tape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogueEntry {
    pub name: String,
    /// Sum of the block lengths.
    pub size: u32,
    pub load: u32,
    pub exec: u32,
    /// Tape position of the sync byte opening block zero's header, if seen.
    pub start: Option<i32>,
}

impl fmt::Display for CatalogueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<NAME_MAX$} Size {:04X} Load {:08X} Run {:08X}",
            self.name, self.size, self.load, self.exec
        )
    }
}

/// Byte-at-a-time MOS block parser.
#[derive(Debug, Default)]
struct BlockScanner {
    /// Index of the next byte within the current block.
    pos: usize,
    /// Bytes in the current block, once its length is known.
    limit: usize,
    name: Vec<u8>,
    load: u32,
    exec: u32,
    block_num: u16,
    block_len: u16,
    last: bool,
    empty: bool,
    file_len: u32,
    file_start: Option<i32>,
    /// Where the current block's sync byte arrived.
    header_start: i32,
}

impl BlockScanner {
    fn new() -> Self {
        Self {
            limit: HEADER_LEN,
            ..Self::default()
        }
    }

    fn next_block(&mut self) {
        self.pos = 0;
        self.limit = HEADER_LEN;
        self.name.clear();
        self.load = 0;
        self.exec = 0;
        self.block_num = 0;
        self.block_len = 0;
        self.last = false;
        self.empty = false;
    }

    /// Feed one received byte. `now` is the tape position it arrived at.
    fn push(&mut self, value: u8, now: i32) -> Option<CatalogueEntry> {
        let n = self.pos;
        self.pos += 1;
        let mut entry = None;
        match n {
            0 if value != b'*' => self.pos = 0,
            0 => self.header_start = now,
            1..=11 => {
                if value == 0 {
                    self.pos = 12;
                } else if n == 11 {
                    // No terminator; hunt for the next sync byte.
                    self.next_block();
                } else if value.is_ascii_graphic() || value == b' ' {
                    self.name.push(value);
                } else {
                    self.name.push(b'?');
                }
            }
            12..=15 => self.load = (self.load >> 8) | (u32::from(value) << 24),
            16..=19 => self.exec = (self.exec >> 8) | (u32::from(value) << 24),
            20 | 21 => {
                self.block_num = (self.block_num >> 8) | (u16::from(value) << 8);
                if n == 21 && self.block_num == 0 {
                    self.file_start = Some(self.header_start);
                }
            }
            22 | 23 => self.block_len = (self.block_len >> 8) | (u16::from(value) << 8),
            24 => {
                self.last = self.block_len < 0x100 || value & FLAG_FINAL != 0;
                self.empty = value & FLAG_EMPTY != 0;
            }
            25..=27 => {}
            28 => {
                self.file_len += u32::from(self.block_len);
                if self.last {
                    entry = Some(CatalogueEntry {
                        name: String::from_utf8_lossy(&self.name).into_owned(),
                        size: self.file_len,
                        load: self.load,
                        exec: self.exec,
                        start: self.file_start.take(),
                    });
                    self.file_len = 0;
                }
                // Header CRC, then the data and its CRC.
                self.limit += 2;
                if !self.empty {
                    self.limit += usize::from(self.block_len) + 2;
                }
            }
            _ => {}
        }
        if self.pos >= self.limit {
            self.next_block();
        }
        entry
    }
}

impl EmulatorState {
    /// List the files on the tape without disturbing playback.
    ///
    /// Assumes 1200 baud. Running off the end of the tape finishes the
    /// listing; any other tape error is returned.
    pub fn catalogue(&self) -> Result<Vec<CatalogueEntry>> {
        let mut entries = Vec::new();
        if !self.tape.has_data() {
            return Ok(entries);
        }
        let mut tape = self.tape.clone_and_rewind();
        let mut acia = Acia6850::new();
        acia.write(0, CATALOGUE_CONTROL);
        let mut scanner = BlockScanner::new();
        let protect = !self.config.permit_phantoms;
        let mut now = 0;

        while let Some(read) = tape.tone_from_back_end(false, acia.rx_awaiting_start(), protect)? {
            now = read.elapsed.unwrap_or(now + 1);
            acia.receive_bit(read.tone != Tone::Zero)?;
            if acia.peek_status() & STATUS_RDRF == 0 {
                continue;
            }
            acia.read(0);
            let value = acia.read(1);
            if let Some(entry) = scanner.push(value, now) {
                log::info!("tape: cat: {entry}");
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A MOS block: header, CRC placeholders and `len` bytes of data.
    fn mos_block(name: &str, load: u32, exec: u32, num: u16, len: u16, flags: u8) -> Vec<u8> {
        let mut b = vec![b'*'];
        b.extend_from_slice(name.as_bytes());
        b.push(0);
        b.extend_from_slice(&load.to_le_bytes());
        b.extend_from_slice(&exec.to_le_bytes());
        b.extend_from_slice(&num.to_le_bytes());
        b.extend_from_slice(&len.to_le_bytes());
        b.push(flags);
        b.extend_from_slice(&[0; 4]);
        b.extend_from_slice(&[0xAA, 0x55]);
        if flags & FLAG_EMPTY == 0 {
            b.extend(std::iter::repeat_n(0xE5, usize::from(len)));
            b.extend_from_slice(&[0xAA, 0x55]);
        }
        b
    }

    fn scan(bytes: &[u8]) -> Vec<CatalogueEntry> {
        let mut s = BlockScanner::new();
        bytes
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| s.push(b, i as i32))
            .collect()
    }

    #[test]
    fn multi_block_file_sums_lengths() {
        let mut bytes = vec![0xFF, 0x00];
        bytes.extend(mos_block("GAME", 0x1900, 0x8023, 0, 0x100, 0));
        bytes.extend(mos_block("GAME", 0x1900, 0x8023, 1, 0x40, FLAG_FINAL));
        let files = scan(&bytes);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 0x140);
        // The first block's sync byte follows two bytes of noise.
        assert_eq!(files[0].start, Some(2));
        assert_eq!(
            files[0].to_string(),
            "GAME       Size 0140 Load 00001900 Run 00008023"
        );
    }

    #[test]
    fn short_block_ends_the_file() {
        let mut bytes = mos_block("A", 0xFFFF_0E00, 0xFFFF_8023, 0, 0x20, 0);
        let second = bytes.len() as i32;
        bytes.extend(mos_block("B", 0, 0, 0, 0, FLAG_FINAL | FLAG_EMPTY));
        let files = scan(&bytes);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].start, Some(0));
        assert_eq!(files[1].start, Some(second));
        assert_eq!(files[0].load, 0xFFFF_0E00);
        assert_eq!(files[1].size, 0);
        assert_eq!(files[1].name, "B");
    }

    #[test]
    fn unprintable_names_are_masked_and_overlong_names_resync() {
        let mut bytes = b"*ABCDEFGHIJK".to_vec();
        bytes.extend(mos_block("X\x07Y", 0, 0, 0, 1, FLAG_FINAL));
        let files = scan(&bytes);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "X?Y");
    }

    #[test]
    fn empty_deck_lists_nothing() {
        let emu = EmulatorState::default();
        assert!(emu.catalogue().expect("catalogue").is_empty());
    }
}
