//! Byte-level helpers shared by the container formats: little-endian field
//! access and zlib/gzip in both directions.

use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};

use crate::error::{Recoverable, Result, TapeError};

/// Largest tape file accepted from disk.
pub const MAX_FILE_LEN: usize = 32 * 1024 * 1024;

/// Largest decompressed body accepted.
pub const MAX_DECOMPRESSED_LEN: usize = 64 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// ---------------------------------------------------------------------------
// Little-endian fields
// ---------------------------------------------------------------------------

#[must_use]
pub fn read_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

#[must_use]
pub fn read_u24(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], 0])
}

#[must_use]
pub fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[must_use]
pub fn read_f32(b: &[u8]) -> f32 {
    f32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

pub fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// Inflate a gzip (UEF, TIBETZ) or zlib (CSW body) stream. The wrapper is
/// detected from the first two bytes.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let limit = MAX_DECOMPRESSED_LEN as u64 + 1;
    let read = if data.starts_with(&GZIP_MAGIC) {
        GzDecoder::new(data).take(limit).read_to_end(&mut out)
    } else {
        ZlibDecoder::new(data).take(limit).read_to_end(&mut out)
    };
    read.map_err(|e| {
        log::warn!("tape: could not decompress data: {e}");
        TapeError::from(Recoverable::ZlibDecompress(e.to_string()))
    })?;
    if out.len() > MAX_DECOMPRESSED_LEN {
        log::warn!("tape: decompressed size is too large");
        return Err(Recoverable::DecompressedTooLarge.into());
    }
    log::info!("tape: decompress: {} -> {}", data.len(), out.len());
    Ok(out)
}

/// Deflate with gzip framing, as used for UEF and TIBETZ output.
pub fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(TapeError::bug("compress: refusing to compress empty buffer"));
    }
    let mut enc = GzEncoder::new(Vec::new(), Compression::best());
    enc.write_all(data)
        .and_then(|()| enc.finish())
        .map_err(|e| compress_failed(&e))
}

/// Deflate with zlib framing, as used for CSW bodies.
pub fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(TapeError::bug("compress: refusing to compress empty buffer"));
    }
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::best());
    enc.write_all(data)
        .and_then(|()| enc.finish())
        .map_err(|e| compress_failed(&e))
}

fn compress_failed(e: &std::io::Error) -> TapeError {
    log::warn!("tape: write: compress: zlib compression failed: {e}");
    Recoverable::SaveCompress(e.to_string()).into()
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Read a whole tape file, inflating it when `decompress` is set. An
/// uncompressed UEF is passed through even when decompression was asked for.
pub fn load_file(path: &Path, decompress_body: bool) -> Result<Vec<u8>> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        log::warn!("tape: Unable to open file '{}': {e}", path.display());
        TapeError::from(Recoverable::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    })?;
    let mut buf = Vec::new();
    (&mut file)
        .take(MAX_FILE_LEN as u64)
        .read_to_end(&mut buf)
        .map_err(|e| {
            log::warn!("tape: Stream error reading file '{}': {e}", path.display());
            TapeError::from(Recoverable::Read(e.to_string()))
        })?;
    if buf.len() >= MAX_FILE_LEN {
        log::warn!(
            "tape: File is too large: '{}' (max. {MAX_FILE_LEN})",
            path.display()
        );
        return Err(Recoverable::FileTooLarge.into());
    }
    if decompress_body && !crate::format::uef::has_magic(&buf) {
        return decompress(&buf);
    }
    Ok(buf)
}

/// Write a finished output buffer to disk.
pub fn save_file(path: &Path, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Err(TapeError::bug("write: generated tape output has zero length"));
    }
    let mut file = std::fs::File::create(path).map_err(|e| {
        log::warn!("tape: could not open file for saving: {}", path.display());
        TapeError::from(Recoverable::SaveOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    })?;
    file.write_all(data).map_err(|e| {
        log::warn!("tape: write failed saving to file: {}", path.display());
        TapeError::from(Recoverable::SaveWrite(e.to_string()))
    })?;
    log::info!("tape: saved: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_fields() {
        let b = [0x34, 0x12, 0x78, 0x56];
        assert_eq!(read_u16(&b), 0x1234);
        assert_eq!(read_u24(&b), 0x78_1234);
        assert_eq!(read_u32(&b), 0x5678_1234);
        let mut out = Vec::new();
        push_u16(&mut out, 0xabcd);
        push_u32(&mut out, 1);
        assert_eq!(out, [0xcd, 0xab, 1, 0, 0, 0]);
    }

    #[test]
    fn gzip_and_zlib_are_both_detected() {
        let text = b"tibet 0.5\nleader 100\n".repeat(20);
        let gz = compress_gzip(&text).unwrap();
        assert_eq!(&gz[..2], &GZIP_MAGIC);
        assert_eq!(decompress(&gz).unwrap(), text);
        let z = compress_zlib(&text).unwrap();
        assert_eq!(decompress(&z).unwrap(), text);
    }

    #[test]
    fn garbage_fails_to_inflate() {
        let err = decompress(b"\x78\x9cnot really zlib").unwrap_err();
        assert_eq!(err.code(), 9);
    }

    #[test]
    fn missing_file_is_fopen() {
        let err = load_file(Path::new("/nonexistent/tape.uef"), true).unwrap_err();
        assert_eq!(err.code(), 4);
    }
}
