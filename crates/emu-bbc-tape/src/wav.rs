//! WAV export: the tape rendered as 44.1 kHz mono 16-bit audio.
//!
//! Each tick becomes one [`SLOW_SMPS`]-sample packet. The tape is read
//! twice from a rewound copy, once to count ticks against the size ceiling
//! and once to write.

use std::io::{Seek, Write};
use std::path::Path;

use crate::deck::TapeState;
use crate::error::{Recoverable, Result, TapeError};
use crate::machine::EmulatorState;
use crate::noise::{wav_packet, SAMPLE_RATE, SLOW_SMPS};
use crate::tone::Tone;

/// Largest permitted sample data, in bytes.
pub const WAV_BODY_LIMIT: usize = 1_000_000_000;

fn spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Refuse tapes whose rendering would pass [`WAV_BODY_LIMIT`].
pub fn check_wav_size(ticks: usize) -> Result<()> {
    if ticks > WAV_BODY_LIMIT / (SLOW_SMPS * 2) {
        log::warn!("tapenoise: save WAV: WAV would exceed body size limit: {WAV_BODY_LIMIT}");
        return Err(Recoverable::WavTooLarge.into());
    }
    Ok(())
}

fn next_tone(tape: &mut TapeState) -> Result<Option<Tone>> {
    Ok(tape.tone_from_back_end(false, false, false)?.map(|r| r.tone))
}

fn write_err(e: &hound::Error) -> TapeError {
    log::warn!("tapenoise: save WAV: write failure: {e}");
    Recoverable::SaveWrite(e.to_string()).into()
}

impl EmulatorState {
    fn wav_source(&self) -> Result<(TapeState, usize)> {
        if self.tape.formats().is_empty() {
            return Err(TapeError::bug("tapenoise: save WAV: no viable tone source!"));
        }
        let mut tape = self.tape.clone_and_rewind();
        let mut ticks = 0;
        while next_tone(&mut tape)?.is_some() {
            ticks += 1;
        }
        check_wav_size(ticks)?;
        tape.rewind();
        log::info!("tapenoise: save WAV: {ticks} tonepackets");
        Ok((tape, ticks))
    }

    /// Render the tape into `out`. Returns the number of ticks written.
    pub fn render_wav<W: Write + Seek>(&self, out: W, cosine: bool) -> Result<usize> {
        let (mut tape, ticks) = self.wav_source()?;
        let mut writer = hound::WavWriter::new(out, spec()).map_err(|e| write_err(&e))?;
        let one = wav_packet(Tone::One, cosine);
        let zero = wav_packet(Tone::Zero, cosine);
        let silence = [0i16; SLOW_SMPS];
        for _ in 0..ticks {
            let Some(tone) = next_tone(&mut tape)? else {
                return Err(TapeError::bug("tapenoise: save WAV: pass 2 ran short"));
            };
            let packet = match tone {
                Tone::Zero => &zero,
                Tone::Silence => &silence,
                Tone::One | Tone::Leader => &one,
            };
            for &s in packet {
                writer.write_sample(s).map_err(|e| write_err(&e))?;
            }
        }
        writer.finalize().map_err(|e| write_err(&e))?;
        Ok(ticks)
    }

    /// Render the tape to a WAV file at `path`.
    pub fn save_wav(&self, path: &Path, cosine: bool) -> Result<usize> {
        let file = std::fs::File::create(path).map_err(|e| {
            log::warn!("tapenoise: save WAV: failed to open file for saving: {}", path.display());
            Recoverable::SaveOpen {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        self.render_wav(std::io::BufWriter::new(file), cosine)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::format::tibet::TibetTape;

    fn emu_with(text: &str) -> EmulatorState {
        let mut emu = EmulatorState::default();
        let tape = TibetTape::decode(text.as_bytes()).expect("tibet");
        emu.tape.insert_tibet(tape);
        emu
    }

    #[test]
    fn one_packet_per_tick() {
        let emu = emu_with("tibet 0.5\nleader 8\nsilence 0.01\ndata\n--....\nend\n");
        let mut buf = Cursor::new(Vec::new());
        let ticks = emu.render_wav(&mut buf, false).expect("render");
        buf.set_position(0);
        let reader = hound::WavReader::new(buf).expect("read back");
        assert_eq!(reader.spec(), spec());
        let samples: Vec<i16> = reader.into_samples().map(|s| s.expect("sample")).collect();
        assert_eq!(samples.len(), ticks * SLOW_SMPS);
        let last = &samples[samples.len() - SLOW_SMPS..];
        assert_eq!(last, &wav_packet(Tone::One, false)[..]);
    }

    #[test]
    fn rendering_leaves_the_deck_alone() {
        let mut emu = emu_with("tibet 0.5\nleader 40\n");
        emu.tape.tallied = 7;
        emu.render_wav(Cursor::new(Vec::new()), true).expect("render");
        assert_eq!(emu.tape.tallied(), 7);
    }

    #[test]
    fn size_ceiling() {
        let max = WAV_BODY_LIMIT / (SLOW_SMPS * 2);
        assert!(check_wav_size(max).is_ok());
        let err = check_wav_size(max + 1).expect_err("too large");
        assert_eq!(err.code(), 405);
    }

    #[test]
    fn no_tape_is_a_fault() {
        let mut emu = EmulatorState::default();
        emu.tape = TapeState::new();
        let err = emu.render_wav(Cursor::new(Vec::new()), false).expect_err("no source");
        assert_eq!(err.code(), 3);
    }
}
