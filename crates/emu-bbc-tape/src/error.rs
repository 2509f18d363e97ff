//! Tape error types.
//!
//! Two families: [`Recoverable`] covers anything a user can cause (a bad
//! file, end of tape, a corrupt save state) and [`Fault`] is an internal
//! invariant violation. Every error maps to a stable numeric code, which is
//! what the transport panel shows in its error readout.

use ferranti_serial_ula::UlaError;
use motorola_6850::AciaError;

// ---------------------------------------------------------------------------
// UEF
// ---------------------------------------------------------------------------

/// UEF decode and encode errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UefError {
    #[error("bad magic")]
    BadMagic,
    #[error("bad header")]
    BadHeader,
    #[error("file is truncated")]
    Truncated,
    #[error("unknown chunk type &{0:x}")]
    UnknownChunk(u16),
    #[error("chunk too large to store")]
    OversizedChunk,
    #[error("too many metadata chunks between data chunks")]
    TooManyMetadata,
    #[error("chunk &104: illegal number of data bits or parity")]
    Chunk104NumBits,
    #[error("chunk &104: illegal number of stop bits")]
    Chunk104NumStops,
    #[error("chunk &{0:x} has an illegal length")]
    ChunkLen(u16),
    #[error("chunk &5: bad target machine")]
    Chunk5Data,
    #[error("chunk &6: bad bit multiplexing value")]
    Chunk6Data,
    #[error("chunk &114: first pulse/wave char is illegal")]
    Chunk114Pulsewave1,
    #[error("chunk &114: second pulse/wave char is illegal")]
    Chunk114Pulsewave2,
    #[error("chunk &114: illegal pulse/wave combination")]
    Chunk114PulsewaveCombo,
    #[error("chunk is spent")]
    ChunkSpent,
    #[error("chunk &114: number-of-cycles field is wrong")]
    Chunk114NumCycles,
    #[error("chunk &116: negative gap")]
    Chunk116NegativeGap,
    #[error("chunk &116: excessive gap")]
    Chunk116HugeGap,
    #[error("chunk &102: first byte is weird")]
    Chunk102WeirdData0,
    #[error("excessive number of chunks &{0:x}")]
    Excess(u16),
    #[error("chunk &130: illegal vocabulary")]
    Chunk130Vocab,
    #[error("chunk &130: illegal number of tapes")]
    Chunk130NumTapes,
    #[error("chunk &130: illegal number of channels")]
    Chunk130NumChannels,
    #[error("chunk &131: bad tape ID")]
    Chunk131TapeId,
    #[error("chunk &131: bad channel ID")]
    Chunk131ChannelId,
    #[error("chunk &131: tape ID exceeds chunk &130 limit")]
    Chunk131TapeIdLimit,
    #[error("chunk &131: channel ID exceeds chunk &130 limit")]
    Chunk131ChannelIdLimit,
    #[error("chunk &131: description too long")]
    Chunk131DescriptionLong,
    #[error("chunk exceeds generic length limit")]
    LongChunk,
    #[error("chunk &3: bad inlay scan depth")]
    InlayScanBpp,
    #[error("chunk &3: zero inlay dimensions")]
    InlayScanZero,
    #[error("chunk &115: illegal phase")]
    Chunk115Illegal,
    #[error("chunk &117: bad baud rate")]
    Chunk117BadRate,
    #[error("bad UTF-8 lead byte")]
    Utf8Lead,
    #[error("bad UTF-8 continuation")]
    Utf8Continuation,
    #[error("excessive number of global chunks")]
    GlobalChunkSpam,
    #[error("nonstandard baud rate {0}")]
    SaveNonstandardBaud(i32),
}

/// Chunk types whose length errors have their own codes, in code order.
const CHUNKLEN_CODES: [u16; 23] = [
    0x0000, 0x0001, 0x0003, 0x0005, 0x0006, 0x0007, 0x0008, 0x0009, 0x000a, 0x0100, 0x0102,
    0x0104, 0x0110, 0x0111, 0x0112, 0x0115, 0x0116, 0x0113, 0x0114, 0x0117, 0x0120, 0x0130,
    0x0131,
];

impl UefError {
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::BadMagic => 301,
            Self::BadHeader => 302,
            Self::Truncated => 303,
            Self::UnknownChunk(_) => 304,
            Self::OversizedChunk => 305,
            Self::TooManyMetadata => 306,
            Self::Chunk104NumBits => 307,
            Self::Chunk104NumStops => 308,
            Self::ChunkLen(t) => CHUNKLEN_CODES
                .iter()
                .position(|c| c == t)
                .map_or(302, |i| 309 + i as u16),
            Self::Chunk5Data => 332,
            Self::Chunk6Data => 333,
            Self::Chunk114Pulsewave1 => 334,
            Self::Chunk114Pulsewave2 => 335,
            Self::Chunk114PulsewaveCombo => 336,
            Self::ChunkSpent => 337,
            Self::Chunk114NumCycles => 338,
            Self::Chunk116NegativeGap => 339,
            Self::Chunk116HugeGap => 340,
            Self::Chunk102WeirdData0 => 341,
            Self::Excess(t) => match t {
                0x0000 => 342,
                0x0001 => 343,
                0x0003 => 344,
                0x0005 => 345,
                _ => 346,
            },
            Self::Chunk130Vocab => 347,
            Self::Chunk130NumTapes => 348,
            Self::Chunk130NumChannels => 349,
            Self::Chunk131TapeId => 350,
            Self::Chunk131ChannelId => 351,
            Self::Chunk131TapeIdLimit => 352,
            Self::Chunk131ChannelIdLimit => 353,
            Self::Chunk131DescriptionLong => 354,
            Self::LongChunk => 355,
            Self::InlayScanBpp => 356,
            Self::InlayScanZero => 357,
            Self::Chunk115Illegal => 358,
            Self::Chunk117BadRate => 359,
            Self::Utf8Lead => 360,
            Self::Utf8Continuation => 361,
            Self::GlobalChunkSpam => 362,
            Self::SaveNonstandardBaud(_) => 363,
        }
    }
}

// ---------------------------------------------------------------------------
// CSW
// ---------------------------------------------------------------------------

/// CSW decode and encode errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CswError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}.{1}")]
    BadVersion(u8, u8),
    #[error("bad sample rate {0}")]
    BadRate(u32),
    #[error("header pulse count is too large ({0})")]
    HeaderNumPulses(u32),
    #[error("body is too large")]
    BodyLarge,
    #[error("bad compression value {0}")]
    CompValue(u8),
    #[error("bad flags &{0:x}")]
    BadFlags(u8),
    #[error("pulse count mismatch (header {header}, body {body})")]
    PulsesMismatch { header: u32, body: u32 },
    #[error("header is truncated")]
    HeaderTruncated,
    #[error("refusing to write zero-length pulse")]
    WriteNullPulse,
    #[error("long pulse shorter than 256 samples")]
    LongPulseUnder256,
}

impl CswError {
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::BadMagic => 101,
            Self::BadVersion(..) => 102,
            Self::BadRate(_) => 103,
            Self::HeaderNumPulses(_) => 104,
            Self::BodyLarge => 106,
            Self::CompValue(_) => 107,
            Self::BadFlags(_) => 108,
            Self::PulsesMismatch { .. } => 109,
            Self::HeaderTruncated => 110,
            Self::WriteNullPulse => 111,
            Self::LongPulseUnder256 => 112,
        }
    }
}

// ---------------------------------------------------------------------------
// TIBET
// ---------------------------------------------------------------------------

/// What went wrong in a TIBET file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TibetErrorKind {
    BadChar,
    Version,
    VersionLine,
    VersionLineNoSpace,
    UnknownWord,
    VersionMajor,
    TooManySpans,
    FieldIncompatible,
    MultipleDecimalPoints,
    PointEndsDecimal,
    DecimalBadChar,
    DecimalTooLong,
    DecimalParse,
    LongSilence,
    IntTooLong,
    IntParse,
    IntBadChar,
    LongLeader,
    DuplicateBaud,
    BadFraming,
    DuplicateFraming,
    DuplicateTime,
    TimeHintTooLarge,
    BadBaud,
    DuplicatePhase,
    BadPhase,
    DuplicateSpeed,
    SpeedHintHigh,
    SpeedHintLow,
    JunkFollowsStart,
    JunkFollowsLine,
    IllegalChar,
    DoublePulse,
    ExcessiveTones,
    DanglingTime,
    DanglingPhase,
    DanglingSpeed,
    DanglingBaud,
    DanglingFraming,
    NoDecode,
    EmptyLeader,
    OpLen,
    AbsentVersion,
    VersionNoDecimalPoint,
    VersionNonNumeric,
    VersionBadLength,
    VersionMinor,
    ConcatVersionMismatch,
}

impl TibetErrorKind {
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::BadChar => 200,
            Self::Version => 201,
            Self::VersionLine => 202,
            Self::VersionLineNoSpace => 203,
            Self::UnknownWord => 204,
            Self::VersionMajor => 205,
            Self::TooManySpans => 206,
            Self::FieldIncompatible => 207,
            Self::MultipleDecimalPoints => 208,
            Self::PointEndsDecimal => 209,
            Self::DecimalBadChar => 210,
            Self::DecimalTooLong => 211,
            Self::DecimalParse => 212,
            Self::LongSilence => 214,
            Self::IntTooLong => 215,
            Self::IntParse => 217,
            Self::IntBadChar => 218,
            Self::LongLeader => 219,
            Self::DuplicateBaud => 220,
            Self::BadFraming => 221,
            Self::DuplicateFraming => 222,
            Self::DuplicateTime => 223,
            Self::TimeHintTooLarge => 224,
            Self::BadBaud => 225,
            Self::DuplicatePhase => 226,
            Self::BadPhase => 227,
            Self::DuplicateSpeed => 228,
            Self::SpeedHintHigh => 229,
            Self::SpeedHintLow => 230,
            Self::JunkFollowsStart => 231,
            Self::JunkFollowsLine => 232,
            Self::IllegalChar => 233,
            Self::DoublePulse => 234,
            Self::ExcessiveTones => 235,
            Self::DanglingTime => 236,
            Self::DanglingPhase => 237,
            Self::DanglingSpeed => 238,
            Self::DanglingBaud => 239,
            Self::DanglingFraming => 240,
            Self::NoDecode => 241,
            Self::EmptyLeader => 242,
            Self::OpLen => 243,
            Self::AbsentVersion => 244,
            Self::VersionNoDecimalPoint => 245,
            Self::VersionNonNumeric => 246,
            Self::VersionBadLength => 247,
            Self::VersionMinor => 248,
            Self::ConcatVersionMismatch => 249,
        }
    }
}

/// A TIBET error with the (1-based) line it was found on. Line 0 means the
/// error was not tied to a line.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?} (code {}) at line {line}", kind.code())]
pub struct TibetError {
    pub line: usize,
    pub kind: TibetErrorKind,
}

impl TibetError {
    #[must_use]
    pub fn new(line: usize, kind: TibetErrorKind) -> Self {
        Self { line, kind }
    }

    #[must_use]
    pub fn code(&self) -> u16 {
        self.kind.code()
    }
}

// ---------------------------------------------------------------------------
// Tape-level
// ---------------------------------------------------------------------------

/// Errors a user or a file can cause. The tape freezes until cleared, but
/// the emulator carries on.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Recoverable {
    #[error("end of tape")]
    Eof,
    #[error("out of memory")]
    OutOfMemory,
    #[error("could not open {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("could not read file: {0}")]
    Read(String),
    #[error("file is too large")]
    FileTooLarge,
    #[error("could not initialise decompressor")]
    ZlibInit,
    #[error("decompression failed: {0}")]
    ZlibDecompress(String),
    #[error("decompressed data is too large")]
    DecompressedTooLarge,
    #[error("save state: {0}")]
    SaveState(String),
    #[error("load state: state is corrupt @ {0}")]
    LoadState(&'static str),
    #[error("uef: {0}")]
    Uef(#[from] UefError),
    #[error("csw: {0}")]
    Csw(#[from] CswError),
    #[error("tibet: {0}")]
    Tibet(#[from] TibetError),
    #[error("could not create {path}: {reason}")]
    SaveOpen { path: String, reason: String },
    #[error("could not write output: {0}")]
    SaveWrite(String),
    #[error("compression failed: {0}")]
    SaveCompress(String),
    #[error("could not initialise compressor")]
    SaveZlibInit,
    #[error("emulation time limit reached")]
    Expiry,
    #[error("rendered audio would be too large")]
    WavTooLarge,
    #[error("filename has no extension")]
    BlankExtension,
    #[error("unrecognised tape extension: {0}")]
    UnknownExtension(String),
}

impl Recoverable {
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::Eof => 2,
            Self::OutOfMemory => 1,
            Self::Open { .. } => 4,
            Self::Read(_) => 6,
            Self::FileTooLarge => 7,
            Self::ZlibInit => 8,
            Self::ZlibDecompress(_) => 9,
            Self::DecompressedTooLarge => 10,
            Self::SaveState(_) => 11,
            Self::LoadState(_) => 12,
            Self::Uef(e) => e.code(),
            Self::Csw(e) => e.code(),
            Self::Tibet(e) => e.code(),
            Self::SaveOpen { .. } => 400,
            Self::SaveWrite(_) => 401,
            Self::SaveCompress(_) => 402,
            Self::SaveZlibInit => 403,
            Self::Expiry => 404,
            Self::WavTooLarge => 405,
            Self::BlankExtension => 406,
            Self::UnknownExtension(_) => 407,
        }
    }
}

/// Internal invariant violation. After one of these the tape subsystem
/// stops doing I/O.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("BUG: {0}")]
pub struct Fault(pub String);

/// Anything the tape subsystem can return.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TapeError {
    #[error(transparent)]
    Recoverable(#[from] Recoverable),
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl TapeError {
    /// Build a [`Fault`], logging it on the way.
    pub fn bug(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::warn!("tape: BUG: {msg}");
        Self::Fault(Fault(msg))
    }

    /// Numeric code shown on the transport panel. Faults are 3.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::Recoverable(r) => r.code(),
            Self::Fault(_) => 3,
        }
    }

    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Recoverable(Recoverable::Eof))
    }
}

impl From<UefError> for TapeError {
    fn from(e: UefError) -> Self {
        Self::Recoverable(Recoverable::Uef(e))
    }
}

impl From<CswError> for TapeError {
    fn from(e: CswError) -> Self {
        Self::Recoverable(Recoverable::Csw(e))
    }
}

impl From<TibetError> for TapeError {
    fn from(e: TibetError) -> Self {
        Self::Recoverable(Recoverable::Tibet(e))
    }
}

impl From<AciaError> for TapeError {
    fn from(e: AciaError) -> Self {
        match e {
            AciaError::Bug(msg) => Self::Fault(Fault(format!("acia: {msg}"))),
            AciaError::LoadState(field) => Self::Recoverable(Recoverable::LoadState(field)),
        }
    }
}

impl From<UlaError> for TapeError {
    fn from(e: UlaError) -> Self {
        match e {
            UlaError::LoadState(field) => Self::Recoverable(Recoverable::LoadState(field)),
        }
    }
}

pub type Result<T> = std::result::Result<T, TapeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_length_codes_follow_table_order() {
        assert_eq!(UefError::ChunkLen(0x0000).code(), 309);
        assert_eq!(UefError::ChunkLen(0x0115).code(), 324);
        assert_eq!(UefError::ChunkLen(0x0113).code(), 326);
        assert_eq!(UefError::ChunkLen(0x0131).code(), 331);
    }

    #[test]
    fn faults_report_code_three() {
        let e = TapeError::bug("test");
        assert_eq!(e.code(), 3);
        assert!(!e.is_eof());
    }

    #[test]
    fn nested_codes_pass_through() {
        let e: TapeError = TibetError::new(4, TibetErrorKind::BadBaud).into();
        assert_eq!(e.code(), 225);
        let e: TapeError = CswError::BadRate(5).into();
        assert_eq!(e.code(), 103);
        let e: TapeError = Recoverable::Eof.into();
        assert!(e.is_eof());
    }
}
