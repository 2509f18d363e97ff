//! UEF tape images.
//!
//! # Format
//!
//! | Offset | Size | Content           |
//! |--------|------|-------------------|
//! | 0      | 10   | `"UEF File!\0"`   |
//! | 10     | 1    | Minor version     |
//! | 11     | 1    | Major version     |
//! | 12     | ...  | Chunks            |
//!
//! Each chunk is a little-endian `u16` type and `u32` length, then the body.
//!
//! | Type          | Meaning                                     |
//! |---------------|---------------------------------------------|
//! | &0000-&000A   | Global: origin, instructions, inlay, ...    |
//! | &0100         | 8N1 data bytes                              |
//! | &0102         | Raw bits                                    |
//! | &0104         | Data bytes with explicit framing            |
//! | &0110         | Carrier tone, in 2400 Hz cycles             |
//! | &0111         | Carrier, dummy &AA byte, carrier            |
//! | &0112 / &0116 | Gap (integer 2400ths / float seconds)       |
//! | &0114         | Explicit cycles                             |
//! | &0115-&0131   | Metadata: phase, baud, markers, tape sets   |
//!
//! Reference: <http://electrem.emuunlim.com/UEFSpecs.html>

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use motorola_6850::{Parity, SerialFraming};

use crate::TAPE_1200_HZ;
use crate::backend::{TapeBackend, TapeFormat, Timespan, ToneRead, WriteOptions};
use crate::codec::{push_u16, push_u32, read_f32, read_u16, read_u24, read_u32};
use crate::error::{Result, TapeError, UefError};
use crate::tone::Tone;

pub const MAGIC: &[u8; 10] = b"UEF File!\0";
const HEADER_LEN: usize = 12;

const WRITE_VERSION_MINOR: u8 = 10;
const WRITE_VERSION_MAJOR: u8 = 0;

const MAX_CHUNK_LEN: usize = 0xff_ffff;
const MAX_VERIFIED_LEN: usize = 5_000_000;
const MAX_METADATA: usize = 128;
const MAX_GLOBAL_CHUNKS: usize = 128;
const MAX_FLOAT_GAP: f32 = 36_000.0;

/// Largest even cycle count that fits a &110 or &112 length field.
const MAX_CYCLES_PER_CHUNK: u32 = 65_534;

const KNOWN_TYPES: [u16; 24] = [
    0x0000, 0x0001, 0x0003, 0x0005, 0x0006, 0x0007, 0x0008, 0x0009, 0x000a, 0x0100, 0x0101,
    0x0102, 0x0104, 0x0110, 0x0111, 0x0112, 0x0113, 0x0114, 0x0115, 0x0116, 0x0117, 0x0120,
    0x0130, 0x0131,
];

/// True if `buf` starts with a complete UEF header.
#[must_use]
pub fn has_magic(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN && buf.starts_with(MAGIC)
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

/// A stored chunk plus the bookkeeping needed to seek within it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Chunk {
    pub kind: u16,
    pub data: Vec<u8>,
    pub elapsed: Timespan,
    nodata_pre: u32,
    nodata_post: u32,
    cycs_114: u32,
}

impl Chunk {
    #[must_use]
    pub fn new(kind: u16, data: Vec<u8>) -> Self {
        Self {
            kind,
            data,
            ..Self::default()
        }
    }
}

/// Chunks that carry no tape time but describe what follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    PhaseChange(u16),
    BaudRate(u16),
    PositionMarker(String),
    TapeSetInfo {
        vocabulary: u8,
        num_tapes: u8,
        num_channels: u8,
    },
    TapeSide {
        tape_id: u8,
        side_b: bool,
        channel_id: u8,
        description: String,
    },
}

/// An 8 bpp inlay scan from chunk &0003.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inlay {
    pub width: u16,
    pub height: u16,
    pub grey: bool,
    pub palette: Option<Vec<u8>>,
    pub pixels: Vec<u8>,
}

/// Whole-file properties from the &00xx chunks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Globals {
    pub origins: Vec<String>,
    pub instructions: Vec<String>,
    pub inlays: Vec<Inlay>,
    pub target_machines: Vec<u8>,
    pub bit_mux: Option<u8>,
    pub extra_palette: Option<Vec<u8>>,
    pub rom_hints: Vec<Vec<u8>>,
    pub short_title: Option<String>,
    pub visible_area: Option<Vec<u8>>,
    pub makeuef_version: Option<(u32, u32)>,
}

struct InlayHeader {
    width: u16,
    height: u16,
    bpp: u8,
    grey: bool,
    palette_pos: Option<usize>,
}

fn inlay_header(data: &[u8]) -> std::result::Result<InlayHeader, UefError> {
    if data.len() < 5 {
        log::warn!("uef: chunk type &3 has bad length ({}, need >=5)", data.len());
        return Err(UefError::ChunkLen(0x0003));
    }
    let width = read_u16(data);
    let height = read_u16(&data[2..]);
    let bpp = data[4] & 0x7f;
    let grey = data[4] & 0x80 != 0;
    let header = InlayHeader {
        width,
        height,
        bpp,
        grey,
        palette_pos: (bpp == 8 && !grey).then_some(5),
    };
    if bpp != 8 {
        log::warn!("uef: inlay scan: only 8 bpp supported, found {bpp}; ignoring this scan");
        return Err(UefError::InlayScanBpp);
    }
    let body = usize::from(width) * usize::from(height);
    if body == 0 {
        log::warn!("uef: chunk type &3 has a pixel size of 0");
        return Err(UefError::InlayScanZero);
    }
    let expected = 5 + header.palette_pos.map_or(0, |_| 768) + body;
    if data.len() != expected {
        log::warn!(
            "uef: chunk type &3 has bad length ({}, expected {expected})",
            data.len()
        );
        return Err(UefError::ChunkLen(0x0003));
    }
    Ok(header)
}

/// Bytes and bits of payload in a &0102 chunk of `len` bytes.
fn chunk_102_len(len: usize, data0: u8) -> std::result::Result<(usize, usize), UefError> {
    let skip = match data0 {
        0..=7 => data0 + 8,
        8..=15 => data0,
        _ => {
            log::warn!("uef: chunk &102: data[0] is weird (&{data0:x}, expect < &10)");
            return Err(UefError::Chunk102WeirdData0);
        }
    };
    let bits = (len * 8).saturating_sub(usize::from(skip));
    Ok((bits.div_ceil(8), bits))
}

fn verify_length(c: &Chunk) -> std::result::Result<(), UefError> {
    let len = c.data.len();
    if len > MAX_VERIFIED_LEN {
        log::warn!("uef: chunk &{:x} exceeds generic length limit ({len})", c.kind);
        return Err(UefError::LongChunk);
    }
    let ok = match c.kind {
        0x0000 | 0x0100 | 0x0120 => len >= 1,
        0x0003 => match inlay_header(&c.data) {
            Ok(_) | Err(UefError::InlayScanBpp) => true,
            Err(e) => return Err(e),
        },
        0x0005 | 0x0006 => len == 1,
        0x0007 | 0x0008 | 0x0104 => len >= 3,
        0x0009 => (1..=255).contains(&len),
        0x000a => len == 8,
        0x0102 => len >= 1 && chunk_102_len(len, c.data[0])?.0 + 1 == len,
        0x0110 | 0x0112 | 0x0115 | 0x0117 => len == 2,
        0x0111 | 0x0113 | 0x0116 => len == 4,
        0x0114 => len >= 6,
        0x0130 => len == 3,
        0x0131 => (3..=258).contains(&len),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        log::warn!("uef: chunk type &{:x} has bad length ({len})", c.kind);
        Err(UefError::ChunkLen(c.kind))
    }
}

fn decode_chunks(body: &[u8]) -> std::result::Result<Vec<Chunk>, UefError> {
    let mut chunks = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        if body.len() - pos < 6 {
            log::warn!("uef: truncated chunk header at offset {pos}");
            return Err(UefError::Truncated);
        }
        let kind = read_u16(&body[pos..]);
        let len = read_u32(&body[pos + 2..]) as usize;
        if !KNOWN_TYPES.contains(&kind) {
            log::warn!("uef: unknown chunk type &{kind:x}");
            return Err(UefError::UnknownChunk(kind));
        }
        if len > MAX_CHUNK_LEN {
            log::warn!("uef: oversized chunk #{}, at &{len:x} bytes", chunks.len());
            return Err(UefError::OversizedChunk);
        }
        let start = pos + 6;
        if body.len() - start < len {
            log::warn!("uef: chunk &{kind:x} is truncated");
            return Err(UefError::Truncated);
        }
        chunks.push(Chunk::new(kind, body[start..start + len].to_vec()));
        pos = start + len;
    }
    Ok(chunks)
}

// ---------------------------------------------------------------------------
// Globals and metadata
// ---------------------------------------------------------------------------

fn verify_utf8(data: &[u8]) -> std::result::Result<(), UefError> {
    match std::str::from_utf8(data) {
        Ok(_) => Ok(()),
        Err(e) => match data[e.valid_up_to()] {
            0xc2..=0xf4 => Err(UefError::Utf8Continuation),
            _ => Err(UefError::Utf8Lead),
        },
    }
}

/// Text up to the first NUL.
fn chunk_text(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn printable(s: &str) -> String {
    s.bytes()
        .map(|b| if (0x20..=0x7e).contains(&b) { b as char } else { '?' })
        .collect()
}

fn parse_makeuef_version(s: &str) -> Option<(u32, u32)> {
    if s.len() < 12 {
        return None;
    }
    let (major, minor) = s.strip_prefix("MakeUEF V")?.split_once('.')?;
    if major.is_empty() || !major.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let minor: String = minor.chars().take_while(char::is_ascii_digit).collect();
    if minor.is_empty() {
        return None;
    }
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn parse_globals(chunks: &[Chunk]) -> std::result::Result<Globals, UefError> {
    let count = |kind: u16| chunks.iter().filter(|c| c.kind == kind).count();
    let counts = [
        (0x0000, count(0x0000)),
        (0x0001, count(0x0001)),
        (0x0003, count(0x0003)),
        (0x0005, count(0x0005)),
        (0x0008, count(0x0008)),
    ];
    if let Some((kind, n)) = counts.iter().find(|(_, n)| *n > MAX_GLOBAL_CHUNKS) {
        log::warn!("uef: too many &{kind:x} chunks; found {n}, limit is {MAX_GLOBAL_CHUNKS}");
        return Err(UefError::GlobalChunkSpam);
    }
    log::info!(
        "uef: multichunk counts: &0/{}; &1/{}; &3/{}; &5/{}; &8/{}",
        counts[0].1,
        counts[1].1,
        counts[2].1,
        counts[3].1,
        counts[4].1
    );

    let mut g = Globals::default();
    for c in chunks {
        let logged = match c.kind {
            0x0000 => {
                verify_utf8(&c.data).inspect_err(|_| log::warn!("uef: bad UTF-8 in origin chunk"))?;
                g.origins.push(chunk_text(&c.data));
                true
            }
            0x0001 => {
                verify_utf8(&c.data)
                    .inspect_err(|_| log::warn!("uef: bad UTF-8 in instructions chunk"))?;
                g.instructions.push(chunk_text(&c.data));
                true
            }
            0x0003 => {
                match inlay_header(&c.data) {
                    Ok(h) => {
                        let pixels_at = 5 + h.palette_pos.map_or(0, |_| 768);
                        g.inlays.push(Inlay {
                            width: h.width,
                            height: h.height,
                            grey: h.grey,
                            palette: h.palette_pos.map(|p| c.data[p..p + 768].to_vec()),
                            pixels: c.data[pixels_at..].to_vec(),
                        });
                    }
                    Err(UefError::InlayScanBpp) => {}
                    Err(e) => return Err(e),
                }
                true
            }
            0x0005 => {
                let v = c.data[0];
                if v >> 4 > 4 || v & 0xf > 2 {
                    log::warn!("uef: invalid target machine chunk");
                    return Err(UefError::Chunk5Data);
                }
                g.target_machines.push(v);
                true
            }
            0x0006 if g.bit_mux.is_some() => {
                log::warn!("uef: multiple bit multiplexing information chunks; ignoring later ones");
                false
            }
            0x0006 => {
                let v = c.data[0];
                if !(1..=4).contains(&v) {
                    log::warn!("uef: invalid bit multiplexing information chunk");
                    return Err(UefError::Chunk6Data);
                }
                g.bit_mux = Some(v);
                true
            }
            0x0007 if g.extra_palette.is_some() => {
                log::warn!("uef: multiple extra palette chunks; ignoring later ones");
                false
            }
            0x0007 => {
                g.extra_palette = Some(c.data.clone());
                true
            }
            0x0008 => {
                g.rom_hints.push(c.data.clone());
                true
            }
            0x0009 if g.short_title.is_some() => {
                log::warn!("uef: multiple short title chunks; ignoring later ones");
                false
            }
            0x0009 => {
                g.short_title = Some(chunk_text(&c.data));
                true
            }
            0x000a if g.visible_area.is_some() => {
                log::warn!("uef: multiple visible area chunks; ignoring later ones");
                false
            }
            0x000a => {
                g.visible_area = Some(c.data.clone());
                true
            }
            _ => false,
        };
        if logged {
            log::info!("uef: \"global\" chunk type &{:x}, len {}", c.kind, c.data.len());
        }
    }

    for (n, origin) in g.origins.iter().enumerate() {
        log::info!("uef: origins[{n}]: \"{}\"", printable(origin));
        if let Some(version) = parse_makeuef_version(origin) {
            if g.makeuef_version.is_some() {
                log::warn!("uef: multiple MakeUEF version origin chunks; ignoring later ones");
            } else {
                log::info!("uef: MakeUEF detected: version {}.{}", version.0, version.1);
                g.makeuef_version = Some(version);
            }
        }
    }
    Ok(g)
}

/// Decode a metadata chunk. `limits` carries tape and channel counts from
/// the most recent &0130, zero when there was none.
fn parse_metadata(c: &Chunk, limits: (u8, u8)) -> std::result::Result<Option<Metadata>, UefError> {
    let d = &c.data;
    let meta = match c.kind {
        0x0115 => {
            let phase = read_u16(d);
            if phase > 360 {
                log::warn!("uef: phase change: illegal value {phase}");
                return Err(UefError::Chunk115Illegal);
            }
            Metadata::PhaseChange(phase)
        }
        0x0117 => {
            let baud = read_u16(d);
            if baud != 300 && baud != 1200 {
                log::warn!("uef: chunk &117: bad baud rate {baud}");
                return Err(UefError::Chunk117BadRate);
            }
            Metadata::BaudRate(baud)
        }
        0x0120 => Metadata::PositionMarker(chunk_text(d)),
        0x0130 => {
            if d[0] > 4 {
                log::warn!("uef: tape set info: illegal vocabulary (max. 4): {}", d[0]);
                return Err(UefError::Chunk130Vocab);
            }
            if d[1] == 0 || d[1] > 127 {
                log::warn!("uef: tape set info: illegal number of tapes (1<=nt<=127): {}", d[1]);
                return Err(UefError::Chunk130NumTapes);
            }
            if d[2] == 0 {
                log::warn!("uef: tape set info: illegal (zero) number of channels");
                return Err(UefError::Chunk130NumChannels);
            }
            Metadata::TapeSetInfo {
                vocabulary: d[0],
                num_tapes: d[1],
                num_channels: d[2],
            }
        }
        0x0131 => {
            let tape_id = d[0] & 0x7f;
            if tape_id == 127 {
                log::warn!("uef: start of tape side: bad tape ID {tape_id}");
                return Err(UefError::Chunk131TapeId);
            }
            if limits.0 > 0 && tape_id >= limits.0 {
                log::warn!("uef: start of tape side: tape ID {tape_id} exceeds prior max. {}", limits.0 - 1);
                return Err(UefError::Chunk131TapeIdLimit);
            }
            let channel_id = d[1];
            if channel_id == 0xff {
                log::warn!("uef: start of tape side: bad channel ID 255");
                return Err(UefError::Chunk131ChannelId);
            }
            if limits.1 > 0 && channel_id >= limits.1 {
                log::warn!("uef: start of tape side: channel ID {channel_id} exceeds prior max. {}", limits.1 - 1);
                return Err(UefError::Chunk131ChannelIdLimit);
            }
            let description = chunk_text(&d[2..]);
            if description.len() > 255 {
                log::warn!("uef: start of tape side: description exceeds 255 chars ({})", description.len());
                return Err(UefError::Chunk131DescriptionLong);
            }
            Metadata::TapeSide {
                tape_id,
                side_b: d[0] & 0x80 != 0,
                channel_id,
                description,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(meta))
}

fn verify_metadata(chunks: &[Chunk]) -> std::result::Result<(), UefError> {
    let mut limits = (0, 0);
    for c in chunks {
        if let Some(Metadata::TapeSetInfo {
            num_tapes,
            num_channels,
            ..
        }) = parse_metadata(c, limits)?
        {
            limits = (num_tapes, num_channels);
        }
    }
    Ok(())
}

/// &0117 payload for a baud rate the ACIA can be programmed to produce.
fn baud_payload(baud: i32) -> Option<[u8; 2]> {
    if baud != 300 && baud != 1200 {
        log::warn!("tape: uef: WARNING: nonstandard baud rate {baud} breaks UEF 0.10 standard");
    }
    match baud {
        75 | 150 | 300 | 600 | 1200 => Some((baud as u16).to_le_bytes()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Bit source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DummyBytePhase {
    Pre,
    Dummy,
    Post,
}

/// Read cursor within the current chunk. The reservoir holds up to one
/// frame's worth of ticks, LSB first.
#[derive(Debug, Clone)]
struct BitSource {
    framing: SerialFraming,
    silence: bool,
    reservoir: u64,
    len: u8,
    pos: u8,
    byte_pos: usize,
    consumed_pre: u32,
    consumed_post: u32,
    phase_111: DummyBytePhase,
    bit_pos_114: u32,
    consumed_cycs: u32,
    /// The current chunk is finished with; the next read moves on.
    done: bool,
}

impl BitSource {
    fn new(nominal_baud: i32) -> Self {
        Self {
            framing: SerialFraming::MOS_8N1.with_baud(nominal_baud),
            silence: false,
            reservoir: 0,
            len: 0,
            pos: 0,
            byte_pos: 0,
            consumed_pre: 0,
            consumed_post: 0,
            phase_111: DummyBytePhase::Pre,
            bit_pos_114: 0,
            consumed_cycs: 0,
            done: false,
        }
    }

    fn exhausted(&self) -> bool {
        self.pos >= self.len
    }

    /// Load `len` ticks of bit pattern; at 300 baud each bit lasts four.
    fn load(&mut self, bits: u64, len: u8, baud300: bool) {
        if baud300 {
            self.reservoir = (0..16)
                .filter(|&n| (bits >> n) & 1 != 0)
                .fold(0, |acc, n| acc | (0xf << (n * 4)));
            self.len = len * 4;
        } else {
            self.reservoir = bits;
            self.len = len;
        }
    }

    fn next_cycle(&mut self, chunk: &Chunk) -> Result<Option<bool>> {
        if self.consumed_cycs >= chunk.cycs_114 {
            return Ok(None);
        }
        let Some(&byte) = chunk.data.get(self.byte_pos) else {
            log::warn!(
                "uef: chunk &114 number-of-cycles field is wrong? (&{:x})",
                chunk.cycs_114
            );
            return Err(UefError::Chunk114NumCycles.into());
        };
        let cycle = (byte >> (7 - self.bit_pos_114)) & 1 != 0;
        self.consumed_cycs += 1;
        self.bit_pos_114 += 1;
        if self.bit_pos_114 >= 8 {
            self.byte_pos += 1;
            self.bit_pos_114 = 0;
        }
        Ok(Some(cycle))
    }
}

/// Frame a byte as start bit, data bits, optional parity and stop bits.
fn frame_byte(v: u8, framing: &SerialFraming) -> (u64, u8) {
    let data = u64::from(v) & ((1 << framing.data_bits) - 1);
    let mut frame = data << 1;
    let mut n = 1 + framing.data_bits;
    let odd_ones = data.count_ones() % 2 == 1;
    let parity_bit = match framing.parity {
        Parity::None => None,
        Parity::Even => Some(odd_ones),
        Parity::Odd => Some(!odd_ones),
    };
    if let Some(p) = parity_bit {
        frame |= u64::from(p) << n;
        n += 1;
    }
    for _ in 0..framing.stop_bits {
        frame |= 1 << n;
        n += 1;
    }
    (frame, n)
}

enum Refill {
    Filled,
    Spent,
    Eof,
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Reassembles bytes from the transmitted tick stream.
#[derive(Debug, Clone)]
struct Recorder {
    pending: Option<Chunk>,
    bytes_written: u32,
    shift_value: u16,
    shift_amount: u8,
    phase: u8,
    frame: u8,
    prevailing_baud: i32,
    origin_written: bool,
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            pending: None,
            bytes_written: 0,
            shift_value: 0,
            shift_amount: 0,
            phase: 0,
            frame: 0,
            prevailing_baud: 1200,
            origin_written: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tape
// ---------------------------------------------------------------------------

/// A UEF tape: chunk list, read cursor and recording state.
#[derive(Debug, Clone)]
pub struct UefTape {
    version: (u8, u8),
    chunks: Vec<Chunk>,
    globals: Globals,
    cur: Option<usize>,
    src: BitSource,
    swap_parity: bool,
    rec: Recorder,
}

impl Default for UefTape {
    fn default() -> Self {
        Self::new()
    }
}

impl UefTape {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: (WRITE_VERSION_MAJOR, WRITE_VERSION_MINOR),
            chunks: Vec::new(),
            globals: Globals::default(),
            cur: None,
            src: BitSource::new(1200),
            swap_parity: false,
            rec: Recorder::default(),
        }
    }

    /// Parse and validate a complete (already inflated) UEF file.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if !has_magic(buf) {
            log::warn!("uef: bad magic");
            return Err(UefError::BadMagic.into());
        }
        let (minor, major) = (buf[10], buf[11]);
        log::info!("uef: header OK: version {major}.{minor}");

        let chunks = decode_chunks(&buf[HEADER_LEN..])?;
        for c in &chunks {
            verify_length(c)?;
        }
        let globals = parse_globals(&chunks)?;
        verify_metadata(&chunks)?;

        let swap_parity = globals
            .makeuef_version
            .is_some_and(|(maj, min)| maj < 2 || (maj == 2 && min < 4));
        if let (true, Some((maj, min))) = (swap_parity, globals.makeuef_version) {
            log::warn!(
                "uef: work around MakeUEF < 2.4 ({maj}.{min}) parity bug: swap chunk &104 even and odd"
            );
        }

        let mut tape = Self {
            version: (major, minor),
            chunks,
            globals,
            swap_parity,
            ..Self::new()
        };
        tape.rec.prevailing_baud = tape.scan_back_117(tape.chunks.len().saturating_sub(1));
        Ok(tape)
    }

    #[must_use]
    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    #[must_use]
    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    /// Baud rate in force at chunk `from`: the last &0117 at or before it,
    /// or 1200.
    #[must_use]
    pub fn scan_back_117(&self, from: usize) -> i32 {
        let end = (from + 1).min(self.chunks.len());
        self.chunks[..end]
            .iter()
            .rev()
            .find(|c| c.kind == 0x0117 && c.data.len() >= 2)
            .map_or(1200, |c| match read_u16(&c.data) {
                0 => 1200,
                b => i32::from(b),
            })
    }

    /// Take the recorder's baud from the last &0117 on the tape, so that
    /// appended data only gets a baud chunk when the rate changes.
    pub fn resume_recording(&mut self) {
        self.rec.prevailing_baud = self.scan_back_117(self.chunks.len().saturating_sub(1));
    }

    /// Check that every chunk starts where the previous one ended.
    pub fn verify_timestamps(&self) -> Result<()> {
        for (i, pair) in self.chunks.windows(2).enumerate() {
            if pair[0].elapsed.end() != pair[1].elapsed.start {
                return Err(TapeError::bug(format!(
                    "uef: timestamp integrity failure: chunks[{i}]/t&{:x} = ({} + {}) but [{}]/t&{:x}'s start is {}",
                    pair[0].kind,
                    pair[0].elapsed.start,
                    pair[0].elapsed.len,
                    i + 1,
                    pair[1].kind,
                    pair[1].elapsed.start
                )));
            }
        }
        Ok(())
    }

    fn store_chunk(
        &mut self,
        mut chunk: Chunk,
        nodata_pre: u32,
        nodata_post: u32,
    ) -> Result<()> {
        if chunk.data.len() > MAX_CHUNK_LEN {
            log::warn!(
                "uef: oversized chunk #{}, at &{:x} bytes",
                self.chunks.len(),
                chunk.data.len()
            );
            return Err(UefError::OversizedChunk.into());
        }
        if chunk.elapsed.len < 0 {
            return Err(TapeError::bug(format!(
                "uef: store chunk (type &{:x}): elapsed length is duff ({})",
                chunk.kind, chunk.elapsed.len
            )));
        }
        chunk.elapsed.start = chunk.elapsed.start.max(0);
        chunk.nodata_pre = nodata_pre;
        chunk.nodata_post = nodata_post;
        self.chunks.try_reserve(1).map_err(|_| {
            log::warn!("uef: could not reallocate chunks");
            TapeError::from(crate::error::Recoverable::OutOfMemory)
        })?;
        self.chunks.push(chunk);
        Ok(())
    }

    /// Write the origin chunk ahead of the first recorded data, once.
    pub fn ensure_origin(&mut self, at: i32, suppress: bool) -> Result<()> {
        if self.rec.origin_written {
            return Ok(());
        }
        if !suppress {
            let mut text = format!("emu-bbc-tape {}", env!("CARGO_PKG_VERSION")).into_bytes();
            text.push(0);
            let mut chunk = Chunk::new(0x0000, text);
            chunk.elapsed = Timespan::new(at, 0);
            self.store_chunk(chunk, 0, 0)?;
        }
        self.rec.origin_written = true;
        Ok(())
    }

    /// A byte is part-way through being reassembled.
    #[must_use]
    pub fn has_partial_frame(&self) -> bool {
        self.rec.phase != 0
    }

    /// Store whatever part of a frame has been received, then close the
    /// data chunk. Used when the transmitter is reset mid-byte.
    pub fn flush_incomplete_frame(&mut self, tallied: i32) -> Result<()> {
        let rec = &mut self.rec;
        if rec.phase == 0 {
            return Ok(());
        }
        log::warn!("tape: WARNING: partial frame (phase={}, expected 0)", rec.phase);
        if (2..=8).contains(&rec.phase) {
            rec.frame >>= 9 - rec.phase;
        }
        let frame = rec.frame;
        rec.phase = 0;
        rec.frame = 0;
        rec.bytes_written = 0;
        let Some(mut chunk) = rec.pending.take() else {
            return Err(TapeError::bug("uef: partial frame with no data chunk open"));
        };
        chunk.data.push(frame);
        chunk.elapsed.len = tallied - chunk.elapsed.start;
        self.store_chunk(chunk, 0, 0)
    }

    fn past_end(&self) -> bool {
        self.cur.is_some_and(|c| c >= self.chunks.len())
    }

    fn is_spent(&self, ix: usize) -> bool {
        let c = &self.chunks[ix];
        let s = &self.src;
        if s.done {
            return true;
        }
        match c.kind {
            0x0100 | 0x0104 => s.byte_pos >= c.data.len(),
            0x0102 => chunk_102_len(c.data.len(), c.data[0])
                .map_or(true, |(bytes, _)| s.byte_pos.saturating_sub(1) >= bytes),
            0x0114 => s.consumed_cycs >= c.cycs_114,
            0x0111 => s.phase_111 == DummyBytePhase::Post && s.consumed_post >= c.nodata_post,
            0x0110 | 0x0112 | 0x0116 => s.consumed_pre >= c.nodata_pre,
            _ => true,
        }
    }

    /// Prepare to read chunk `ix`. Returns whether it holds any tape time.
    fn consider_chunk(&mut self, ix: usize) -> Result<bool> {
        self.src = BitSource::new(self.src.framing.nominal_baud);
        let c = &mut self.chunks[ix];
        let d = &c.data;
        let carries = match c.kind {
            0x0100 | 0x0102 | 0x0104 => !d.is_empty(),
            0x0110 | 0x0112 => read_u16(d) != 0,
            0x0111 => true,
            0x0116 => read_f32(d) > 1.0 / 1200.0,
            0x0114 => read_u24(d) != 0,
            _ => false,
        };
        match c.kind {
            0x0102 => self.src.byte_pos = 1,
            0x0104 => {
                if d[0] != 7 && d[0] != 8 {
                    log::warn!("uef: chunk &104: illegal number of data bits ({}, should be 7 or 8)", d[0]);
                    return Err(UefError::Chunk104NumBits.into());
                }
                let Some(mut parity) = Parity::from_char(char::from(d[1])) else {
                    log::warn!("uef: chunk &104: illegal parity (&{:x}, should be &45, &4e or &4f)", d[1]);
                    return Err(UefError::Chunk104NumBits.into());
                };
                if d[2] != 1 && d[2] != 2 {
                    log::warn!("uef: chunk &104: illegal number of stop bits ({}, should be 1 or 2)", d[2]);
                    return Err(UefError::Chunk104NumStops.into());
                }
                if self.swap_parity {
                    parity = match parity {
                        Parity::Even => Parity::Odd,
                        Parity::Odd => Parity::Even,
                        Parity::None => Parity::None,
                    };
                }
                self.src.framing.data_bits = d[0];
                self.src.framing.parity = parity;
                self.src.framing.stop_bits = d[2];
                self.src.byte_pos = 3;
            }
            0x0114 => {
                for (n, &pw) in d[3..5].iter().enumerate() {
                    if pw != b'P' && pw != b'W' {
                        log::warn!("uef: chunk &114: illegal pulse/wave char (&{pw:x}): wanted P or W");
                        return Err(if n == 0 {
                            UefError::Chunk114Pulsewave1
                        } else {
                            UefError::Chunk114Pulsewave2
                        }
                        .into());
                    }
                }
                if d[3] == b'P' && d[4] == b'P' {
                    log::warn!("uef: chunk &114: unusual pulse/wave combination P, P");
                }
                c.cycs_114 = read_u24(d);
                self.src.byte_pos = 5;
            }
            0x0110 | 0x0112 => c.nodata_pre = u32::from(read_u16(d)),
            0x0111 => {
                c.nodata_pre = u32::from(read_u16(d));
                c.nodata_post = u32::from(read_u16(&d[2..]));
            }
            0x0116 => {
                let gap = read_f32(d);
                if gap < 0.0 {
                    log::warn!("uef: chunk &116 contains negative float gap");
                    return Err(UefError::Chunk116NegativeGap.into());
                }
                if gap > MAX_FLOAT_GAP {
                    log::warn!("uef: chunk &116 contains excessive float gap");
                    return Err(UefError::Chunk116HugeGap.into());
                }
                c.nodata_pre = (0.5 + f64::from(gap) * TAPE_1200_HZ * 2.0) as u32;
            }
            _ => {}
        }
        if carries && self.is_spent(ix) {
            log::warn!(
                "uef: chunk &{:x} that should have contained tapetime is somehow empty; skipping",
                self.chunks[ix].kind
            );
            return Ok(false);
        }
        Ok(carries)
    }

    fn refill(&mut self) -> Result<Refill> {
        let Some(ix) = self.cur else {
            return Ok(Refill::Spent);
        };
        if ix >= self.chunks.len() {
            return Ok(Refill::Eof);
        }
        self.src.pos = 0;
        self.src.len = 0;
        if self.is_spent(ix) {
            return Ok(Refill::Spent);
        }
        let baud300 = self.src.framing.nominal_baud == 300;
        let chunk = &self.chunks[ix];
        let src = &mut self.src;
        match chunk.kind {
            0x0100 | 0x0104 => {
                let (frame, n) = frame_byte(chunk.data[src.byte_pos], &src.framing);
                src.byte_pos += 1;
                src.load(frame, n, baud300);
            }
            0x0102 => {
                let (bytes, bits) = chunk_102_len(chunk.data.len(), chunk.data[0])?;
                let done = src.byte_pos - 1;
                let n = if done + 1 == bytes { bits - done * 8 } else { 8 };
                let v = chunk.data[src.byte_pos];
                src.byte_pos += 1;
                src.load(u64::from(v), n as u8, baud300);
            }
            0x0114 => {
                // A lone 2400 Hz cycle followed by a 1200 Hz one is ambiguous;
                // drop it and resynchronise on the next cycle.
                let bit = loop {
                    let Some(first) = src.next_cycle(chunk)? else {
                        return Ok(Refill::Spent);
                    };
                    if !first {
                        break false;
                    }
                    let saved = (src.consumed_cycs, src.bit_pos_114, src.byte_pos);
                    let Some(second) = src.next_cycle(chunk)? else {
                        return Ok(Refill::Spent);
                    };
                    if second {
                        break true;
                    }
                    (src.consumed_cycs, src.bit_pos_114, src.byte_pos) = saved;
                };
                src.reservoir = u64::from(bit);
                src.len = 1;
            }
            0x0110 => {
                src.reservoir = 1;
                src.len = 1;
                src.consumed_pre += 2;
            }
            0x0111 => {
                if src.phase_111 == DummyBytePhase::Pre && src.consumed_pre >= chunk.nodata_pre {
                    src.phase_111 = DummyBytePhase::Dummy;
                }
                match src.phase_111 {
                    DummyBytePhase::Pre => {
                        src.reservoir = 1;
                        src.len = 1;
                        src.consumed_pre += 2;
                    }
                    DummyBytePhase::Dummy => {
                        // &AA framed 8N1, always at 1200 baud
                        src.reservoir = 0x354;
                        src.len = 10;
                        src.phase_111 = DummyBytePhase::Post;
                    }
                    DummyBytePhase::Post => {
                        src.reservoir = 1;
                        src.len = 1;
                        src.consumed_post += 2;
                    }
                }
            }
            0x0112 | 0x0116 => {
                src.silence = true;
                src.len = 1;
                src.consumed_pre += 2;
            }
            _ => return Ok(Refill::Spent),
        }
        Ok(Refill::Filled)
    }

    /// Advance to the next chunk holding tape time, applying any baud
    /// changes on the way. Returns the tape position of that chunk.
    fn accrue(&mut self, initial_scan: bool) -> Result<Option<i32>> {
        let mut metadata = 0;
        loop {
            let ix = self.cur.map_or(0, |c| c + 1);
            self.cur = Some(ix);
            if ix >= self.chunks.len() {
                return Ok(None);
            }
            if initial_scan {
                self.chunks[ix].elapsed.len = 0;
            }
            let now = match ix.checked_sub(1) {
                None => 0,
                Some(prev) => {
                    let now = self.chunks[prev].elapsed.end();
                    let start = self.chunks[ix].elapsed.start;
                    if start != 0 && start != now {
                        return Err(TapeError::bug(format!(
                            "uef: read: chunk #{ix} (type &{:x}): old start time ({start}) does not match new ({now})",
                            self.chunks[ix].kind
                        )));
                    }
                    now
                }
            };
            if initial_scan {
                self.chunks[ix].elapsed.start = now;
            }

            match parse_metadata(&self.chunks[ix], (0, 0))? {
                Some(meta) => {
                    if let Metadata::BaudRate(baud) = meta {
                        self.src.framing.nominal_baud = i32::from(baud);
                        if !initial_scan {
                            log::info!("uef: &117: baud change on tape: {baud}");
                        }
                    } else if !initial_scan {
                        log::info!("uef: unused metadata, chunk &{:x}", self.chunks[ix].kind);
                    }
                    metadata += 1;
                    if metadata > MAX_METADATA {
                        log::warn!("uef: too many metadata chunks between data chunks");
                        return Err(UefError::TooManyMetadata.into());
                    }
                }
                None => {
                    if self.consider_chunk(ix)? {
                        return Ok(Some(now));
                    }
                }
            }
        }
    }
}

impl TapeBackend for UefTape {
    fn format(&self) -> TapeFormat {
        TapeFormat::Uef
    }

    fn read_tone(&mut self, initial_scan: bool) -> Result<Option<ToneRead>> {
        if self.past_end() {
            return Ok(None);
        }
        let mut elapsed = None;
        if self.src.exhausted() {
            match self.refill()? {
                Refill::Filled => {}
                Refill::Eof => return Ok(None),
                Refill::Spent => {
                    let Some(now) = self.accrue(initial_scan)? else {
                        return Ok(None);
                    };
                    elapsed = Some(now);
                    match self.refill()? {
                        Refill::Filled => {}
                        Refill::Eof => return Ok(None),
                        Refill::Spent => return Err(UefError::ChunkSpent.into()),
                    }
                }
            }
        }
        let tone = if self.src.silence {
            Tone::Silence
        } else {
            Tone::from_bit((self.src.reservoir >> self.src.pos) & 1 != 0)
        };
        self.src.pos += 1;
        if initial_scan {
            if let Some(c) = self.cur.and_then(|ix| self.chunks.get_mut(ix)) {
                c.elapsed.len += 1;
            }
        }
        Ok(Some(ToneRead::new(tone, elapsed)))
    }

    fn peek_eof(&self) -> bool {
        self.past_end()
    }

    fn has_data(&self) -> bool {
        !self.chunks.is_empty()
    }

    fn rewind(&mut self) {
        self.cur = None;
        self.src = BitSource::new(1200);
    }

    fn ffwd_to_end(&mut self) -> Result<()> {
        self.cur = Some(self.chunks.len());
        self.src = BitSource::new(self.src.framing.nominal_baud);
        Ok(())
    }

    fn duration(&self) -> i32 {
        self.chunks.last().map_or(0, |c| c.elapsed.end())
    }

    fn num_pieces(&self) -> usize {
        self.chunks.len()
    }

    fn piece_span(&self, ix: usize) -> Result<Timespan> {
        self.chunks
            .get(ix)
            .map(|c| c.elapsed)
            .ok_or_else(|| TapeError::bug(format!("uef: no chunk #{ix} ({} available)", self.chunks.len())))
    }

    fn seek_to_piece(&mut self, ix: usize) -> Result<()> {
        if ix >= self.chunks.len() {
            return Err(TapeError::bug(format!(
                "uef: change to illegal chunk {ix} ({} available)",
                self.chunks.len()
            )));
        }
        self.src = BitSource::new(self.scan_back_117(ix));
        self.src.done = true;
        self.cur = ix.checked_sub(1);
        Ok(())
    }

    fn begin_data(&mut self, start: i32, framing: &SerialFraming, opts: &WriteOptions) -> Result<()> {
        if self.rec.pending.is_some() {
            return Err(TapeError::bug("uef: data chunk already open"));
        }
        let elapsed = Timespan::new(start, 0);
        if opts.always_117 {
            if let Some(payload) = baud_payload(framing.nominal_baud) {
                let mut chunk = Chunk::new(0x0117, payload.to_vec());
                chunk.elapsed = elapsed;
                self.store_chunk(chunk, 0, 0)?;
            }
            self.rec.prevailing_baud = framing.nominal_baud;
        }
        let mut chunk = if framing.is_8n1() {
            Chunk::new(0x0100, Vec::new())
        } else {
            Chunk::new(
                0x0104,
                vec![framing.data_bits, framing.parity.as_char() as u8, framing.stop_bits],
            )
        };
        chunk.elapsed = elapsed;
        self.rec.pending = Some(chunk);
        self.rec.bytes_written = 0;
        Ok(())
    }

    fn append_data_tone(&mut self, bit: bool, at: i32, framing: &SerialFraming) -> Result<()> {
        let (mask, ticks_per_bit) = match framing.nominal_baud {
            1200 => (0x1, 1),
            600 => (0x3, 2),
            300 => (0xf, 4),
            150 => (0xff, 8),
            75 => (0xffff, 16),
            other => {
                log::warn!("tape: WARNING: illegal tx baud rate {other}");
                if let Some(p) = self.rec.pending.as_mut() {
                    let header = if p.kind == 0x0104 { 3 } else { 0 };
                    p.data.truncate(header);
                }
                return Ok(());
            }
        };

        let rec = &mut self.rec;
        rec.shift_value = ((rec.shift_value << 1) | u16::from(bit)) & mask;
        rec.shift_amount += 1;
        let newest = rec.shift_value & 1;
        if (0..rec.shift_amount).any(|i| (rec.shift_value >> i) & 1 != newest) {
            log::warn!("tape: UEF chunk &100/&104 bit-assembly shift register desync");
            rec.shift_amount = 1;
            rec.shift_value = newest;
        }
        if rec.shift_amount < ticks_per_bit {
            return Ok(());
        }
        rec.shift_amount = 0;
        let bit_value = newest != 0;

        if rec.phase == 0 {
            if !bit_value {
                rec.frame = 0;
                rec.phase = 1;
            }
            return Ok(());
        }
        if rec.phase <= framing.data_bits {
            rec.frame = (rec.frame >> 1) | if bit_value { 0x80 } else { 0 };
            rec.phase += 1;
            return Ok(());
        }
        if rec.phase != framing.frame_bits() - 1 {
            rec.phase += 1;
            return Ok(());
        }

        // final stop bit: the byte is complete
        if framing.data_bits == 7 {
            rec.frame >>= 1;
        }
        rec.phase = 0;
        let byte = rec.frame;
        if rec.prevailing_baud != framing.nominal_baud {
            rec.prevailing_baud = framing.nominal_baud;
            if rec.bytes_written == 0 {
                if let Some(payload) = baud_payload(framing.nominal_baud) {
                    let mut chunk = Chunk::new(0x0117, payload.to_vec());
                    chunk.elapsed = Timespan::new(at, 0);
                    self.store_chunk(chunk, 0, 0)?;
                }
                if let Some(p) = self.rec.pending.as_mut() {
                    p.elapsed.start = at;
                }
            } else {
                log::warn!(
                    "uef: baud change ({}) mid-chunk is not supported",
                    framing.nominal_baud
                );
            }
        }
        let Some(pending) = self.rec.pending.as_mut() else {
            return Err(TapeError::bug("uef: byte assembled with no data chunk open"));
        };
        pending.data.push(byte);
        self.rec.bytes_written += 1;
        Ok(())
    }

    fn end_data(&mut self, tallied: i32) -> Result<()> {
        let written = std::mem::take(&mut self.rec.bytes_written);
        if let Some(mut chunk) = self.rec.pending.take() {
            if written > 0 {
                chunk.elapsed.len = tallied - chunk.elapsed.start;
                self.store_chunk(chunk, 0, 0)?;
            }
        }
        Ok(())
    }

    fn append_leader(&mut self, start: Option<i32>, ticks: u32) -> Result<()> {
        let mut remaining = ticks;
        let mut at = start;
        while remaining > 0 {
            let n = remaining.min(MAX_CYCLES_PER_CHUNK / 2);
            let cycles = n * 2;
            let mut data = Vec::with_capacity(2);
            push_u16(&mut data, cycles as u16);
            let mut chunk = Chunk::new(0x0110, data);
            chunk.elapsed = Timespan::new(at.unwrap_or(0), n as i32);
            self.store_chunk(chunk, cycles, 0)?;
            at = at.map(|a| a + n as i32);
            remaining -= n;
        }
        Ok(())
    }

    fn append_silence(&mut self, secs: f32, span: Timespan, opts: &WriteOptions) -> Result<()> {
        let mut cycles = (0.5 + f64::from(secs) * TAPE_1200_HZ * 2.0) as u32;
        if !opts.prefer_112 {
            let mut data = Vec::with_capacity(4);
            data.extend_from_slice(&secs.to_le_bytes());
            let mut chunk = Chunk::new(0x0116, data);
            chunk.elapsed = span;
            return self.store_chunk(chunk, cycles, 0);
        }
        if cycles == 0 {
            log::warn!("tape: WARNING: silence as &112: gap is tiny ({secs} s); round up to 1/2400");
            cycles = 1;
        }
        let mut start = span.start;
        let mut ticks_left = span.len;
        while cycles > 0 {
            let n = cycles.min(MAX_CYCLES_PER_CHUNK);
            cycles -= n;
            let ticks = if cycles == 0 { ticks_left } else { (n / 2) as i32 };
            let mut data = Vec::with_capacity(2);
            push_u16(&mut data, n as u16);
            let mut chunk = Chunk::new(0x0112, data);
            chunk.elapsed = Timespan::new(start, ticks.max(0));
            self.store_chunk(chunk, n, 0)?;
            start += ticks.max(0);
            ticks_left -= ticks;
        }
        Ok(())
    }

    fn build_output(&self, _compress: bool) -> Result<Vec<u8>> {
        let body: usize = self.chunks.iter().map(|c| 6 + c.data.len()).sum();
        let mut out = Vec::with_capacity(HEADER_LEN + body);
        out.extend_from_slice(MAGIC);
        out.push(WRITE_VERSION_MINOR);
        out.push(WRITE_VERSION_MAJOR);
        for (n, c) in self.chunks.iter().enumerate() {
            if c.data.len() > MAX_CHUNK_LEN {
                return Err(TapeError::bug(format!(
                    "uef: write: chunk #{n} has illegal length {}",
                    c.data.len()
                )));
            }
            if c.kind == 0 && c.data.is_empty() {
                return Err(TapeError::bug(format!(
                    "uef: write: refusing to save chunk #{n} type &0 with length 0"
                )));
            }
            push_u16(&mut out, c.kind);
            push_u32(&mut out, c.data.len() as u32);
            out.extend_from_slice(&c.data);
        }
        Ok(out)
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uef(chunks: &[(u16, &[u8])]) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&[10, 0]);
        for (kind, data) in chunks {
            push_u16(&mut out, *kind);
            push_u32(&mut out, data.len() as u32);
            out.extend_from_slice(data);
        }
        out
    }

    fn drain(tape: &mut UefTape, initial_scan: bool) -> String {
        let mut s = String::new();
        while let Some(r) = tape.read_tone(initial_scan).unwrap() {
            s.push(r.tone.as_char());
        }
        s
    }

    #[test]
    fn magic_needs_full_header() {
        assert!(has_magic(&uef(&[])));
        assert!(!has_magic(b"UEF File!\0\x0a"));
        assert!(!has_magic(b"UEF File?\0\x0a\x00"));
    }

    #[test]
    fn leader_then_8n1_byte() {
        let buf = uef(&[(0x0110, &[4, 0]), (0x0100, &[0x55])]);
        let mut tape = UefTape::decode(&buf).unwrap();
        let first = tape.read_tone(true).unwrap().unwrap();
        assert_eq!(first, ToneRead::new(Tone::One, Some(0)));
        let second = tape.read_tone(true).unwrap().unwrap();
        assert_eq!(second.elapsed, None);
        let data = tape.read_tone(true).unwrap().unwrap();
        assert_eq!(data, ToneRead::new(Tone::Zero, Some(2)));
        assert_eq!(drain(&mut tape, true), "101010101");
        assert!(tape.peek_eof());
        assert_eq!(tape.duration(), 12);
        assert_eq!(tape.piece_span(1).unwrap(), Timespan::new(2, 10));
        tape.verify_timestamps().unwrap();
    }

    #[test]
    fn baud_chunk_stretches_bits_to_four_ticks() {
        let buf = uef(&[(0x0117, &[0x2c, 0x01]), (0x0100, &[0xff])]);
        let mut tape = UefTape::decode(&buf).unwrap();
        let s = drain(&mut tape, true);
        assert_eq!(s.len(), 40);
        assert!(s.starts_with("00001111"));
        assert_eq!(tape.scan_back_117(1), 300);
    }

    #[test]
    fn float_gap_is_silence() {
        let buf = uef(&[(0x0116, &0.01f32.to_le_bytes())]);
        let mut tape = UefTape::decode(&buf).unwrap();
        assert_eq!(drain(&mut tape, true), "S".repeat(12));
    }

    #[test]
    fn dummy_byte_chunk() {
        let buf = uef(&[(0x0111, &[4, 0, 4, 0])]);
        let mut tape = UefTape::decode(&buf).unwrap();
        assert_eq!(drain(&mut tape, true), "11001010101111");
    }

    #[test]
    fn raw_bits_chunk_honours_partial_last_byte() {
        // data[0] = 4: twelve of the 24 bits are unused, leaving 8 + 4
        let buf = uef(&[(0x0102, &[4, 0xff, 0x05])]);
        let mut tape = UefTape::decode(&buf).unwrap();
        assert_eq!(drain(&mut tape, false), "111111111010");
    }

    #[test]
    fn explicit_cycles_resynchronise() {
        // cycles 1,1 | 0 | 1 (dropped) | 0 | 0
        let buf = uef(&[(0x0114, &[6, 0, 0, b'P', b'W', 0b1101_0000])]);
        let mut tape = UefTape::decode(&buf).unwrap();
        assert_eq!(drain(&mut tape, false), "1000");
    }

    #[test]
    fn framed_chunk_with_parity() {
        let buf = uef(&[(0x0104, &[7, b'E', 1, 0x01])]);
        let mut tape = UefTape::decode(&buf).unwrap();
        // start, 1000000, even parity 1, stop
        assert_eq!(drain(&mut tape, false), "0100000011");
    }

    #[test]
    fn old_makeuef_swaps_parity() {
        let buf = uef(&[(0x0000, b"MakeUEF V2.3.\0"), (0x0104, &[7, b'E', 1, 0x01])]);
        let mut tape = UefTape::decode(&buf).unwrap();
        assert_eq!(tape.globals().makeuef_version, Some((2, 3)));
        assert_eq!(drain(&mut tape, false), "0100000001");
    }

    #[test]
    fn structural_errors() {
        let err = UefTape::decode(b"not a uef at all").unwrap_err();
        assert_eq!(err.code(), 301);

        let mut truncated = uef(&[(0x0100, &[1, 2, 3])]);
        truncated.pop();
        assert_eq!(UefTape::decode(&truncated).unwrap_err().code(), 303);

        let unknown = uef(&[(0x0999, &[1])]);
        assert_eq!(UefTape::decode(&unknown).unwrap_err().code(), 304);

        let bad_len = uef(&[(0x0110, &[1, 2, 3])]);
        let err = UefTape::decode(&bad_len).unwrap_err();
        assert_eq!(err, TapeError::from(UefError::ChunkLen(0x0110)));

        let bad_utf8 = uef(&[(0x0000, &[0x80, 0])]);
        assert_eq!(UefTape::decode(&bad_utf8).unwrap_err().code(), 360);

        let bad_side = uef(&[(0x0130, &[0, 2, 1]), (0x0131, &[3, 0, 0])]);
        assert_eq!(UefTape::decode(&bad_side).unwrap_err().code(), 352);
    }

    #[test]
    fn seek_to_piece_replays_chunk() {
        let buf = uef(&[(0x0117, &[0x2c, 0x01]), (0x0110, &[2, 0]), (0x0100, &[0x00])]);
        let mut tape = UefTape::decode(&buf).unwrap();
        let total = drain(&mut tape, true).len();
        assert_eq!(total as i32, tape.duration());
        tape.seek_to_piece(2).unwrap();
        let first = tape.read_tone(false).unwrap().unwrap();
        assert_eq!(first, ToneRead::new(Tone::Zero, Some(1)));
        assert_eq!(drain(&mut tape, false).len(), 39);
        assert!(tape.seek_to_piece(3).is_err());
    }

    #[test]
    fn recorded_byte_reads_back() {
        let framing = SerialFraming::MOS_8N1;
        let opts = WriteOptions::default();
        let mut tape = UefTape::new();
        tape.ensure_origin(0, false).unwrap();
        tape.append_leader(Some(0), 5).unwrap();
        tape.begin_data(5, &framing, &opts).unwrap();
        let bits = "0100000101";
        for (i, c) in bits.chars().enumerate() {
            tape.append_data_tone(c == '1', 5 + i as i32, &framing).unwrap();
        }
        assert!(!tape.has_partial_frame());
        tape.end_data(15).unwrap();
        tape.verify_timestamps().unwrap();
        assert_eq!(tape.duration(), 15);

        let out = tape.build_output(false).unwrap();
        let mut back = UefTape::decode(&out).unwrap();
        assert_eq!(back.chunks()[2].data, [0x41]);
        assert!(back.globals().origins[0].starts_with("emu-bbc-tape"));
        assert_eq!(drain(&mut back, true), format!("11111{bits}"));
    }

    #[test]
    fn baud_change_before_first_byte_inserts_117() {
        let framing = SerialFraming::MOS_8N1.with_baud(300);
        let mut tape = UefTape::new();
        tape.begin_data(0, &framing, &WriteOptions::default()).unwrap();
        for c in "0000111111111111111111111111111111111111".chars() {
            tape.append_data_tone(c == '1', 0, &framing).unwrap();
        }
        tape.end_data(40).unwrap();
        let kinds: Vec<u16> = tape.chunks().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, [0x0117, 0x0100]);
        assert_eq!(tape.chunks()[0].data, [0x2c, 0x01]);
        assert_eq!(tape.chunks()[1].data, [0xff]);
    }

    #[test]
    fn integer_silence_splits_long_gaps() {
        let mut tape = UefTape::new();
        let opts = WriteOptions {
            prefer_112: true,
            ..WriteOptions::default()
        };
        tape.append_silence(30.0, Timespan::new(0, 36_058), &opts).unwrap();
        assert_eq!(tape.chunks().len(), 2);
        assert!(tape.chunks().iter().all(|c| c.kind == 0x0112));
        assert_eq!(tape.duration(), 36_058);
        tape.verify_timestamps().unwrap();
    }

    #[test]
    fn partial_frame_is_flushed() {
        let framing = SerialFraming::MOS_8N1;
        let mut tape = UefTape::new();
        tape.begin_data(0, &framing, &WriteOptions::default()).unwrap();
        for c in "0111".chars() {
            tape.append_data_tone(c == '1', 0, &framing).unwrap();
        }
        assert!(tape.has_partial_frame());
        tape.flush_incomplete_frame(4).unwrap();
        assert!(!tape.has_partial_frame());
        assert_eq!(tape.chunks()[0].data, [0x07]);
        tape.end_data(4).unwrap();
        assert_eq!(tape.chunks().len(), 1);
    }
}
