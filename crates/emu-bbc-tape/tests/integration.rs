//! End-to-end runs of the deck through its public surface: registers in,
//! files out, files back in.

use std::path::Path;

use emu_bbc_tape::io::SaveTarget;
use emu_bbc_tape::noise::SLOW_SMPS;
use emu_bbc_tape::{EmulatorState, QuitReason, SEEK_END_BACKOFF, TapeConfig};
use motorola_6850::{STATUS_RDRF, STATUS_TDRE};

/// Bus cycles in one 1200 Hz tick.
const TICK_CYCLES: u32 = 13 * 128;

fn cassette_on(emu: &mut EmulatorState) {
    emu.write_acia(0, 0x03);
    emu.write_acia(0, 0x15);
    emu.write_ula(0x85);
}

/// Record `bytes` at 1200 baud after a stretch of leader.
fn record(emu: &mut EmulatorState, bytes: &[u8]) {
    cassette_on(emu);
    emu.set_record(true).expect("record on");
    assert!(emu.recording());
    assert!(emu.poll(TICK_CYCLES * 300).is_none());
    for &b in bytes {
        while emu.read_acia(0) & STATUS_TDRE == 0 {
            assert!(emu.poll(TICK_CYCLES).is_none());
        }
        emu.write_acia(1, b);
    }
    assert!(emu.poll(TICK_CYCLES * 40).is_none());
    emu.set_record(false).expect("record off");
}

/// Play from the current position, collecting received bytes.
fn play(emu: &mut EmulatorState, ticks: u32) -> Vec<u8> {
    let mut out = Vec::new();
    for _ in 0..ticks {
        if emu.poll(TICK_CYCLES).is_some() {
            break;
        }
        if emu.read_acia(0) & STATUS_RDRF != 0 {
            out.push(emu.read_acia(1));
        }
    }
    out
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn write_tibet(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("tibet 0.5\n{body}")).expect("write TIBET");
    path
}

/// A single-block MOS file.
fn mos_file(name: &str, load: u32, exec: u32, data: &[u8]) -> Vec<u8> {
    let mut b = vec![0x2A];
    b.extend_from_slice(name.as_bytes());
    b.push(0);
    b.extend_from_slice(&load.to_le_bytes());
    b.extend_from_slice(&exec.to_le_bytes());
    b.extend_from_slice(&0u16.to_le_bytes());
    b.extend_from_slice(&(data.len() as u16).to_le_bytes());
    b.push(0x80);
    b.extend_from_slice(&[0; 4]);
    b.extend_from_slice(&[0x12, 0x34]);
    b.extend_from_slice(data);
    b.extend_from_slice(&[0x56, 0x78]);
    b
}

#[test]
fn recorded_bytes_play_back() {
    let bytes = [0x2A, 0x00, 0xFF, 0x55, 0xAA, 0x81];
    let mut emu = EmulatorState::default();
    record(&mut emu, &bytes);
    assert_eq!(emu.tape.tallied(), 0);
    assert!(emu.tape.duration().expect("duration") > 300);

    let heard = play(&mut emu, 500);
    assert!(contains(&heard, &bytes), "heard {heard:02X?}");
}

#[test]
fn saved_uef_reloads_and_catalogues() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut emu = EmulatorState::default();
    record(&mut emu, &mos_file("TEST", 0x1900, 0x8023, b"\x01\x02\x03\x04"));

    let path = dir.path().join("rec.uef");
    let target = SaveTarget::from_path(&path, true).expect("target");
    assert!(emu.save_tape(&target).expect("save"));
    let raw = std::fs::read(&path).expect("read back");
    assert_eq!(&raw[..2], &[0x1F, 0x8B], "gzip wrapper");

    let mut back = EmulatorState::default();
    back.load_tape(&path).expect("reload");
    let files = back.catalogue().expect("catalogue");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "TEST");
    assert_eq!(files[0].size, 4);
    assert_eq!(files[0].load, 0x1900);
    assert_eq!(files[0].exec, 0x8023);
    assert_eq!(back.tape.tallied(), 0);
}

#[test]
fn seek_to_the_end_backs_off() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_tibet(dir.path(), "long.tibet", "leader 1000\nsilence 1.0\nleader 200\n");
    let mut emu = EmulatorState::default();
    emu.load_tape(&path).expect("load");
    let d = emu.tape.duration().expect("duration");
    assert!(d > SEEK_END_BACKOFF);

    let (at, eof) = emu.seek_to(d, d).expect("seek");
    assert_eq!(at, d - SEEK_END_BACKOFF);
    assert!(!eof);
    assert_eq!(emu.tape.tallied(), at);

    let (at, eof) = emu.seek_to(0, d).expect("seek home");
    assert_eq!((at, eof), (0, false));
}

#[test]
fn wav_file_has_one_packet_per_tick() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = write_tibet(dir.path(), "in.tibet", "leader 60\nsilence 0.1\nleader 40\n");
    let mut emu = EmulatorState::default();
    emu.load_tape(&src).expect("load");

    let wav = dir.path().join("out.wav");
    let ticks = emu.save_wav(&wav, false).expect("wav");
    let reader = hound::WavReader::open(&wav).expect("open wav");
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.spec().sample_rate, 44_100);
    assert_eq!(reader.len() as usize, ticks * SLOW_SMPS);
    assert!((ticks as i32 - emu.tape.duration().expect("duration")).abs() <= 4);
}

#[test]
fn running_off_the_end_quits_when_asked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_tibet(dir.path(), "short.tibet", "leader 80\n");
    let config = TapeConfig {
        quit_on_eof: true,
        ..TapeConfig::default()
    };
    let mut emu = EmulatorState::new(config);
    emu.load_tape(&path).expect("load");
    cassette_on(&mut emu);

    let mut quit = None;
    for _ in 0..400 {
        quit = emu.poll(TICK_CYCLES);
        if quit.is_some() {
            break;
        }
    }
    assert_eq!(quit, Some(QuitReason::Eof));
    assert_eq!(QuitReason::Eof.exit_code(), 0);
    assert!(emu.tape.prior_exception().is_none());
}

#[test]
fn cycle_limit_expires_but_keeps_the_tape() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_tibet(
        dir.path(),
        "t.tibet",
        "leader 400\ndata\n--....\nend\nleader 40\n",
    );
    let config = TapeConfig {
        expire_cycles: Some(u64::from(TICK_CYCLES) * 20),
        ..TapeConfig::default()
    };
    let mut emu = EmulatorState::new(config);
    emu.load_tape(&path).expect("load");
    cassette_on(&mut emu);

    assert!(emu.poll(TICK_CYCLES * 20).is_none());
    assert_eq!(emu.poll(TICK_CYCLES), Some(QuitReason::Expired));
    assert!(emu.tape.prior_exception().is_none());
    assert!(emu.tape.has_data());
    assert!(emu.tape.duration().expect("duration") > 200);
}
