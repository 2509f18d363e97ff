//! Persistent tape settings.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::WriteOptions;
use crate::error::{Recoverable, Result};

/// User-facing tape options, stored as JSON. Unknown or missing fields
/// take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapeConfig {
    /// Use the fast receive divider on the cassette path.
    pub overclock: bool,
    /// Skip leader and silence while loading.
    pub strip_silence_and_leader: bool,
    /// Let start bits through straight after silence.
    pub permit_phantoms: bool,
    /// UEF output: precede every data chunk with a &117 baud chunk.
    pub save_always_117: bool,
    /// UEF output: integer &112 silence instead of float &116.
    pub save_prefer_112: bool,
    /// UEF output: no origin chunk when appending.
    pub save_no_origin: bool,
    /// WAV output: cosine rather than sine phase.
    pub wav_phase_shift: bool,
    /// Tape noise.
    pub sound: bool,
    /// Tape to insert at startup.
    pub load_path: Option<PathBuf>,
    /// Where to save the tape at shutdown.
    pub save_path: Option<PathBuf>,
    /// Compress `.uef` and `.csw` output. `.tibetz` is always compressed;
    /// `.tibet`, `.unzuef` and `.unzcsw` never are.
    pub save_compress: bool,
    /// Stop the emulator when the tape runs out.
    pub quit_on_eof: bool,
    /// Stop the emulator on any tape error.
    pub quit_on_error: bool,
    /// Stop the emulator after this many bus cycles.
    pub expire_cycles: Option<u64>,
}

impl Default for TapeConfig {
    fn default() -> Self {
        Self {
            overclock: false,
            strip_silence_and_leader: false,
            permit_phantoms: false,
            save_always_117: false,
            save_prefer_112: false,
            save_no_origin: false,
            wav_phase_shift: false,
            sound: false,
            load_path: None,
            save_path: None,
            save_compress: true,
            quit_on_eof: false,
            quit_on_error: false,
            expire_cycles: None,
        }
    }
}

impl TapeConfig {
    /// Read settings from `path`. A missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("config: {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(Recoverable::Read(e.to_string()).into()),
        };
        serde_json::from_str(&text).map_err(|e| {
            log::warn!("config: {}: {e}", path.display());
            Recoverable::Read(e.to_string()).into()
        })
    }

    /// Write settings to `path` as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Recoverable::SaveWrite(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| Recoverable::SaveWrite(e.to_string()))?;
        Ok(())
    }

    #[must_use]
    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            always_117: self.save_always_117,
            prefer_112: self.save_prefer_112,
            no_origin: self.save_no_origin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = TapeConfig::load(&dir.path().join("absent.json")).expect("load");
        assert_eq!(cfg, TapeConfig::default());
        assert!(!cfg.permit_phantoms);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tape.json");
        let cfg = TapeConfig {
            overclock: true,
            save_prefer_112: true,
            expire_cycles: Some(2_000_000),
            save_path: Some(PathBuf::from("out.uef")),
            ..TapeConfig::default()
        };
        cfg.save(&path).expect("save");
        assert_eq!(TapeConfig::load(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg: TapeConfig = serde_json::from_str(r#"{ "sound": true }"#).expect("parse");
        assert!(cfg.sound);
        assert!(!cfg.quit_on_eof);
        assert!(cfg.save_compress);
        assert_eq!(cfg.write_options(), WriteOptions::default());
    }
}
