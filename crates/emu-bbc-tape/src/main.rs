//! BBC Micro cassette deck, headless.
//!
//! Loads a tape, lists or renders it, optionally records bytes through the
//! ACIA, runs the deck for a number of bus cycles and saves the result.

use std::path::PathBuf;
use std::process;

use emu_bbc_tape::deck::to_hms;
use emu_bbc_tape::transport::TransportPanel;
use emu_bbc_tape::{EmulatorState, QuitReason, TapeConfig};
use emu_core::Observable;
use motorola_6850::STATUS_TDRE;

/// Bus cycles per call to `poll`.
const POLL_CHUNK: u32 = 2000;

/// ACIA master reset, then /16 8N1.
const ACIA_RESET: u8 = 0x03;
const ACIA_8N1_DIV16: u8 = 0x15;
/// ULA: motor on, cassette, 1200 baud.
const ULA_CASSETTE_MOTOR: u8 = 0x85;

/// Cycles to wait for the last frame to leave the shift register.
const TX_DRAIN_CYCLES: u32 = 13 * 128 * 24;

// ---------------------------------------------------------------------------
// CLI argument parsing
// ---------------------------------------------------------------------------

struct CliArgs {
    tape: Option<PathBuf>,
    config: Option<PathBuf>,
    catalogue: bool,
    seek: Option<f32>,
    save: Option<PathBuf>,
    no_compress: bool,
    wav: Option<PathBuf>,
    wav_cosine: bool,
    info: bool,
    run: Option<u64>,
    record_bytes: Option<Vec<u8>>,
    overclock: bool,
    strip: bool,
    permit_phantoms: bool,
    panel: bool,
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',' && *c != ':')
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<_>>()?;
    if digits.len() % 2 != 0 {
        return None;
    }
    Some(digits.chunks(2).map(|p| (p[0] << 4) | p[1]).collect())
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        tape: None,
        config: None,
        catalogue: false,
        seek: None,
        save: None,
        no_compress: false,
        wav: None,
        wav_cosine: false,
        info: false,
        run: None,
        record_bytes: None,
        overclock: false,
        strip: false,
        permit_phantoms: false,
        panel: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--tape" => {
                i += 1;
                cli.tape = args.get(i).map(PathBuf::from);
            }
            "--config" => {
                i += 1;
                cli.config = args.get(i).map(PathBuf::from);
            }
            "--catalogue" => {
                cli.catalogue = true;
            }
            "--seek" => {
                i += 1;
                cli.seek = args
                    .get(i)
                    .and_then(|s| s.parse::<f32>().ok())
                    .map(|f| f.clamp(0.0, 1.0));
            }
            "--save" => {
                i += 1;
                cli.save = args.get(i).map(PathBuf::from);
            }
            "--no-compress" => {
                cli.no_compress = true;
            }
            "--wav" => {
                i += 1;
                cli.wav = args.get(i).map(PathBuf::from);
            }
            "--wav-cosine" => {
                cli.wav_cosine = true;
            }
            "--info" => {
                cli.info = true;
            }
            "--run" => {
                i += 1;
                cli.run = args.get(i).and_then(|s| s.parse().ok());
            }
            "--record-bytes" => {
                i += 1;
                let Some(bytes) = args.get(i).and_then(|s| parse_hex(s)) else {
                    eprintln!("--record-bytes needs an even number of hex digits");
                    process::exit(1);
                };
                cli.record_bytes = Some(bytes);
            }
            "--overclock" => {
                cli.overclock = true;
            }
            "--strip" => {
                cli.strip = true;
            }
            "--permit-phantoms" => {
                cli.permit_phantoms = true;
            }
            "--panel" => {
                cli.panel = true;
            }
            "--help" | "-h" => {
                eprintln!("Usage: emu-bbc-tape [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --tape <file>          Insert a .uef, .csw, .tibet or .tibetz tape");
                eprintln!("  --config <file>        JSON settings file");
                eprintln!("  --catalogue            List the files on the tape");
                eprintln!("  --seek <fraction>      Wind the tape to a fraction of its length");
                eprintln!("  --save <file>          Save the tape on exit (type from extension)");
                eprintln!("  --no-compress          Don't compress .uef or .csw output");
                eprintln!("  --wav <file>           Render the tape as a WAV file");
                eprintln!("  --wav-cosine           Start WAV tones at their peak");
                eprintln!("  --info                 Describe the tape and its intervals");
                eprintln!("  --run <cycles>         Play the tape for this many 2 MHz cycles");
                eprintln!("  --record-bytes <hex>   Record bytes at 1200 baud 8N1");
                eprintln!("  --overclock            Fast receive clock on the cassette path");
                eprintln!("  --strip                Skip silence and leader while loading");
                eprintln!("  --permit-phantoms      Let start bits through straight after silence");
                eprintln!("  --panel                Show the transport panel after running");
                process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

fn build_config(cli: &CliArgs) -> TapeConfig {
    let mut config = match &cli.config {
        Some(path) => TapeConfig::load(path).unwrap_or_else(|e| {
            eprintln!("Failed to read config: {e}");
            process::exit(1);
        }),
        None => TapeConfig::default(),
    };
    config.overclock |= cli.overclock;
    config.strip_silence_and_leader |= cli.strip;
    config.permit_phantoms |= cli.permit_phantoms;
    config.wav_phase_shift |= cli.wav_cosine;
    if cli.no_compress {
        config.save_compress = false;
    }
    if cli.tape.is_some() {
        config.load_path.clone_from(&cli.tape);
    }
    if cli.save.is_some() {
        config.save_path.clone_from(&cli.save);
    }
    if let Some(limit) = cli.run {
        config.expire_cycles = Some(limit);
    }
    config
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

fn print_info(emu: &EmulatorState) {
    let tape = &emu.tape;
    let formats: Vec<&str> = tape.formats().iter().map(|f| f.name()).collect();
    println!("Formats:   {}", formats.join(", "));
    match tape.duration() {
        Ok(d) => {
            let (h, m, s) = to_hms(d);
            println!("Duration:  {d} ticks ({h}:{m:02}:{s:02})");
        }
        Err(e) => println!("Duration:  unavailable ({e})"),
    }
    let uef = tape.uef().globals();
    for origin in &uef.origins {
        println!("Origin:    {origin}");
    }
    if let Some(title) = &uef.short_title {
        println!("Title:     {title}");
    }
    if !uef.inlays.is_empty() {
        println!("Inlays:    {}", uef.inlays.len());
    }
    println!("Deck:");
    for path in tape.query_paths() {
        if let Some(value) = tape.query(path) {
            println!("  {path:<11}{value}");
        }
    }
    println!("Intervals: {}", tape.intervals().len());
    for iv in tape.intervals().intervals() {
        let (h, m, s) = to_hms(iv.start);
        println!(
            "  {h}:{m:02}:{s:02}  {}  {:>8} +{}",
            iv.kind.name(),
            iv.start,
            iv.len
        );
    }
}

fn seek(emu: &mut EmulatorState, fraction: f32) {
    let duration = match emu.tape.duration() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Seek failed: {e}");
            return;
        }
    };
    let wanted = (duration as f32 * fraction) as i32;
    match emu.seek_to(wanted, duration) {
        Ok((at, eof)) => {
            let (h, m, s) = to_hms(at);
            println!("Seek: {at} ticks ({h}:{m:02}:{s:02}){}", if eof { ", EOF" } else { "" });
        }
        Err(e) => emu.handle_exception(e),
    }
}

/// Run `cycles` bus cycles, servicing the panel between chunks.
fn run_for(emu: &mut EmulatorState, mut cycles: u64) -> Option<QuitReason> {
    while cycles > 0 {
        let chunk = cycles.min(u64::from(POLL_CHUNK)) as u32;
        cycles -= u64::from(chunk);
        if let Some(reason) = emu.poll(chunk) {
            return Some(reason);
        }
        if let Err(e) = emu.handle_transport_messages() {
            emu.handle_exception(e);
        }
        emu.take_audio();
    }
    None
}

fn record_bytes(emu: &mut EmulatorState, bytes: &[u8]) -> Option<QuitReason> {
    emu.write_acia(0, ACIA_RESET);
    emu.write_acia(0, ACIA_8N1_DIV16);
    emu.write_ula(ULA_CASSETTE_MOTOR);
    if let Err(e) = emu.set_record(true) {
        emu.handle_exception(e);
        return emu.quit_reason();
    }
    for &b in bytes {
        while emu.read_acia(0) & STATUS_TDRE == 0 {
            if let Some(reason) = emu.poll(POLL_CHUNK) {
                return Some(reason);
            }
        }
        emu.write_acia(1, b);
    }
    if let Some(reason) = run_for(emu, u64::from(TX_DRAIN_CYCLES)) {
        return Some(reason);
    }
    if let Err(e) = emu.set_record(false) {
        emu.handle_exception(e);
    }
    log::info!("tape: recorded {} bytes", bytes.len());
    emu.quit_reason()
}

fn main() {
    let cli = parse_args();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let config = build_config(&cli);
    let mut emu = EmulatorState::new(config.clone());

    if cli.panel {
        match TransportPanel::open() {
            Ok(panel) => emu.transport = Some(panel),
            Err(e) => eprintln!("Failed to start transport panel: {e}"),
        }
    }

    if let Some(path) = &config.load_path {
        if let Err(e) = emu.load_tape(path) {
            eprintln!("Failed to load tape: {e}");
            process::exit(emu.quit_reason().map_or(1, QuitReason::exit_code));
        }
    }

    if cli.info {
        print_info(&emu);
    }
    if cli.catalogue {
        match emu.catalogue() {
            Ok(files) => {
                for f in &files {
                    println!("{f}");
                }
            }
            Err(e) => eprintln!("Catalogue failed: {e}"),
        }
    }
    if let Some(path) = &cli.wav {
        match emu.save_wav(path, config.wav_phase_shift) {
            Ok(ticks) => println!("Wrote {ticks} ticks to {}", path.display()),
            Err(e) => eprintln!("WAV export failed: {e}"),
        }
    }
    if let Some(fraction) = cli.seek {
        seek(&mut emu, fraction);
    }

    let mut quit = None;
    if let Some(bytes) = &cli.record_bytes {
        quit = record_bytes(&mut emu, bytes);
    }
    if quit.is_none() && cli.run.is_some() {
        // The expiry limit ends the run.
        quit = run_for(&mut emu, u64::MAX);
    }

    if let Some(panel) = emu.transport.as_ref() {
        println!("{}", panel.controls().frame());
    }
    if let Err(e) = emu.save_on_shutdown() {
        eprintln!("Failed to save tape: {e}");
    }
    if let Some(panel) = emu.transport.as_mut() {
        panel.close();
    }

    let code = quit.map_or(0, QuitReason::exit_code);
    if let Some(reason) = quit {
        log::info!("tape: quitting: {reason:?}");
    }
    process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::parse_hex;

    #[test]
    fn hex_bytes() {
        assert_eq!(parse_hex("2a 41:00,ff"), Some(vec![0x2A, 0x41, 0x00, 0xFF]));
        assert_eq!(parse_hex("abc"), None);
        assert_eq!(parse_hex("zz"), None);
    }
}
