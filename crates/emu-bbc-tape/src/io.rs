//! Loading tape files into the deck and saving its contents.
//!
//! The file type is taken from the extension, case-insensitively.

use std::path::{Path, PathBuf};

use crate::backend::{FormatSet, TapeFormat};
use crate::codec;
use crate::error::{Recoverable, Result};
use crate::format::{CswTape, TibetTape, UefTape};
use crate::machine::EmulatorState;
use crate::TAPE_1200_HZ;

/// What a save writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Tape(TapeFormat),
    Wav,
}

/// A save destination resolved from its file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTarget {
    pub path: PathBuf,
    pub kind: OutputKind,
    /// gzip for UEF and TIBET, zlib body for CSW.
    pub compress: bool,
}

fn extension(path: &Path) -> Result<String> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => Ok(ext.to_ascii_lowercase()),
        _ => {
            log::warn!("tape: filename has no extension: {}", path.display());
            Err(Recoverable::BlankExtension.into())
        }
    }
}

impl SaveTarget {
    /// Resolve `path`. `compress` applies to `.uef` and `.csw`; the other
    /// extensions fix compression themselves.
    pub fn from_path(path: &Path, compress: bool) -> Result<Self> {
        let ext = extension(path)?;
        let (kind, compress) = match ext.as_str() {
            "uef" => (OutputKind::Tape(TapeFormat::Uef), compress),
            "csw" => (OutputKind::Tape(TapeFormat::Csw), compress),
            "unzuef" => (OutputKind::Tape(TapeFormat::Uef), false),
            "unzcsw" => (OutputKind::Tape(TapeFormat::Csw), false),
            "tibet" => (OutputKind::Tape(TapeFormat::Tibet), false),
            "tibetz" => (OutputKind::Tape(TapeFormat::Tibet), true),
            "wav" => (OutputKind::Wav, false),
            _ => {
                log::warn!("tape: save: unrecognised filetype: {}", path.display());
                return Err(Recoverable::UnknownExtension(ext).into());
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            kind,
            compress,
        })
    }
}

impl EmulatorState {
    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Replace the tape with the file at `path`.
    ///
    /// A bad extension is returned without touching the deck. Anything that
    /// goes wrong after that is also passed to
    /// [`handle_exception`](Self::handle_exception), leaving the deck
    /// disabled until the next eject or load.
    pub fn load_tape(&mut self, path: &Path) -> Result<()> {
        let ext = extension(path)?;
        let (format, decompress) = match ext.as_str() {
            "uef" => (TapeFormat::Uef, true),
            "csw" => (TapeFormat::Csw, false),
            "tibet" => (TapeFormat::Tibet, false),
            "tibetz" => (TapeFormat::Tibet, true),
            _ => {
                log::warn!("tape: load: no loader found for file extension: {ext}");
                return Err(Recoverable::UnknownExtension(ext).into());
            }
        };
        log::info!("tape: Loading {} {ext}", path.display());

        self.tape.finish();
        self.tape.intervals.clear();
        if let Err(e) = self.insert_file(path, format, decompress) {
            log::warn!("tape: could not load {format} file (code {}): '{}'", e.code(), path.display());
            self.handle_exception(e.clone());
            return Err(e);
        }
        Ok(())
    }

    fn insert_file(&mut self, path: &Path, format: TapeFormat, decompress: bool) -> Result<()> {
        let buf = codec::load_file(path, decompress)?;
        match format {
            TapeFormat::Uef => self.tape.insert_uef(UefTape::decode(&buf)?),
            TapeFormat::Csw => self.tape.insert_csw(CswTape::decode(&buf)?),
            TapeFormat::Tibet => self.tape.insert_tibet(TibetTape::decode(&buf)?),
        }
        self.tape.initial_scan()?;

        let duration = self.tape.duration()?;
        if duration > 0 {
            log::info!(
                "Tape scan complete ({:.1} minutes, {} intervals); rewinding ...",
                f64::from(duration) / (60.0 * TAPE_1200_HZ),
                self.tape.intervals.len()
            );
        } else {
            log::warn!("tape: scan found nothing on the tape");
        }
        self.tape.rewind();
        if self.recording {
            self.tape.ffwd_to_end()?;
        }
        self.transport_resync(duration);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Saving
    // -----------------------------------------------------------------------

    /// Write the tape to `target`. Any section still being recorded is
    /// closed first.
    ///
    /// Returns `false`, having logged why, when the deck holds no copy in
    /// the requested format.
    pub fn save_tape(&mut self, target: &SaveTarget) -> Result<bool> {
        if self.tape.formats.is_empty() {
            self.tape.formats = FormatSet::ALL;
            log::info!("tape: initialised blank tape");
        }
        let format = match target.kind {
            OutputKind::Wav => {
                self.save_wav(&target.path, self.config.wav_phase_shift)?;
                return Ok(true);
            }
            OutputKind::Tape(format) => format,
        };
        if !self.tape.formats.contains(format) {
            log::warn!(
                "tape: save: data does not exist in desired format (have &{:x}, want &{:x})",
                self.tape.formats.bits(),
                format.bit()
            );
            return Ok(false);
        }

        self.tape.duration()?;
        self.flush_pending_piece()?;

        let backend = self.tape.backend(format);
        let out = backend.build_output(target.compress && format == TapeFormat::Csw)?;
        let out = if target.compress && format != TapeFormat::Csw {
            codec::compress_gzip(&out)?
        } else {
            out
        };
        codec::save_file(&target.path, &out)?;
        Ok(true)
    }

    /// Save to the configured path, if there is one. A UEF that never got
    /// any chunks still receives an origin chunk when record is down.
    pub fn save_on_shutdown(&mut self) -> Result<()> {
        let Some(path) = self.config.save_path.clone() else {
            return Ok(());
        };
        let target = SaveTarget::from_path(&path, self.config.save_compress)?;
        if self.tape.formats.is_empty() {
            self.tape.formats = FormatSet::ALL;
        }
        if target.kind == OutputKind::Tape(TapeFormat::Uef)
            && self.recording
            && self.tape.uef.chunks().is_empty()
        {
            self.tape.uef.ensure_origin(0, self.config.save_no_origin)?;
        }
        match self.save_tape(&target) {
            Ok(true) => {
                log::info!("tape: save on shutdown: saved file: {}", path.display());
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                log::warn!("tape: save on shutdown: error saving file: {}", path.display());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TapeConfig;
    use crate::machine::QuitReason;

    #[test]
    fn save_targets_follow_the_extension() {
        let t = SaveTarget::from_path(Path::new("a/b.UEF"), true).expect("uef");
        assert_eq!(t.kind, OutputKind::Tape(TapeFormat::Uef));
        assert!(t.compress);
        let t = SaveTarget::from_path(Path::new("b.unzcsw"), true).expect("unzcsw");
        assert_eq!(t.kind, OutputKind::Tape(TapeFormat::Csw));
        assert!(!t.compress);
        let t = SaveTarget::from_path(Path::new("b.tibetz"), false).expect("tibetz");
        assert!(t.compress);
        assert_eq!(
            SaveTarget::from_path(Path::new("b.wav"), true).expect("wav").kind,
            OutputKind::Wav
        );

        let blank = SaveTarget::from_path(Path::new("noext"), true).expect_err("blank");
        assert_eq!(blank.code(), 406);
        let unknown = SaveTarget::from_path(Path::new("x.tap"), true).expect_err("unknown");
        assert_eq!(unknown.code(), 407);
    }

    #[test]
    fn unknown_extension_leaves_the_deck_alone() {
        let mut emu = EmulatorState::default();
        let err = emu.load_tape(Path::new("game.ssd")).expect_err("ssd");
        assert_eq!(err.code(), 407);
        assert!(emu.tape.prior_exception().is_none());
    }

    #[test]
    fn missing_file_disables_the_tape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut emu = EmulatorState::default();
        let err = emu.load_tape(&dir.path().join("absent.uef")).expect_err("missing");
        assert_eq!(err.code(), 4);
        assert_eq!(emu.tape.prior_exception().map(|e| e.code()), Some(4));
        assert_eq!(emu.quit_reason(), None);
    }

    #[test]
    fn missing_file_has_its_own_quit_reason() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = TapeConfig {
            quit_on_error: true,
            ..TapeConfig::default()
        };

        let mut emu = EmulatorState::new(config.clone());
        emu.load_tape(&dir.path().join("absent.uef")).expect_err("missing");
        assert_eq!(emu.quit_reason(), Some(QuitReason::OpenFailed));
        assert_eq!(QuitReason::OpenFailed.exit_code(), 3);

        // A file that opens but will not decode is a plain tape error.
        let junk = dir.path().join("junk.uef");
        std::fs::write(&junk, b"not a tape at all").expect("write");
        let mut emu = EmulatorState::new(config);
        let err = emu.load_tape(&junk).expect_err("junk");
        assert_ne!(err.code(), 4);
        assert_eq!(emu.quit_reason(), Some(QuitReason::Error));
        assert_eq!(QuitReason::Error.exit_code(), 1);
    }

    #[test]
    fn tibet_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("in.tibet");
        std::fs::write(&src, "tibet 0.5\nleader 40\nsilence 0.5\nleader 20\n").expect("write");

        let mut emu = EmulatorState::default();
        emu.load_tape(&src).expect("load");
        assert_eq!(emu.tape.formats(), FormatSet::only(TapeFormat::Tibet));
        let duration = emu.tape.duration().expect("duration");
        assert!((emu.tape.intervals().end() - duration).abs() <= 4);
        assert_eq!(emu.tape.tallied(), 0);

        let out = dir.path().join("out.tibetz");
        let target = SaveTarget::from_path(&out, false).expect("target");
        assert!(emu.save_tape(&target).expect("save"));

        let mut back = EmulatorState::default();
        back.load_tape(&out).expect("reload");
        assert!((back.tape.duration().expect("duration") - duration).abs() <= 4);
    }

    #[test]
    fn saving_a_missing_format_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("in.tibet");
        std::fs::write(&src, "tibet 0.5\nleader 40\n").expect("write");
        let mut emu = EmulatorState::default();
        emu.load_tape(&src).expect("load");
        let target = SaveTarget::from_path(&dir.path().join("out.csw"), true).expect("target");
        assert!(!emu.save_tape(&target).expect("save"));
        assert!(!target.path.exists());
    }
}
