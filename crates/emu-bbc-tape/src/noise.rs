//! Tape noise: the tones on the tape rendered as audio.
//!
//! Every tick becomes one packet of samples: one 1200 Hz cycle for a zero,
//! two 2400 Hz cycles for a one or leader, or zeros for silence. Packets go
//! into a ring buffer that the host drains at its own pace. Two packet
//! lengths (36 and 37 samples) let the producer run slightly fast or slow
//! to keep the buffer near half full; during leader, running fast simply
//! drops packets.

#![allow(clippy::cast_precision_loss)]

use crate::tone::Tone;

/// Output sample rate.
pub const SAMPLE_RATE: u32 = 44_100;

const BASE_FREQ: u32 = 1208;
/// Samples in a packet when catching up.
pub const FAST_SMPS: usize = (SAMPLE_RATE / BASE_FREQ) as usize;
/// Samples in a packet normally, and always in WAV output.
pub const SLOW_SMPS: usize = FAST_SMPS + 1;

/// Live noise amplitude, as a fraction of full scale.
const LIVE_VOLUME: f64 = 0.20;
/// WAV export amplitude.
const WAV_VOLUME: f64 = 0.75;

/// Ring buffer capacity: half a second.
pub const RINGBUF_LEN: usize = (SAMPLE_RATE as usize * 50) / 100;
/// Largest block handed to the host per playback call.
pub const PLAY_LEN: usize = 1280;

fn sine_packet<const N: usize>(cycles: f64, volume: f64, cosine: bool) -> [i16; N] {
    let step = 2.0 * std::f64::consts::PI * cycles / N as f64;
    std::array::from_fn(|n| {
        let d = step * n as f64;
        let v = if cosine { d.cos() } else { d.sin() };
        (v * volume * 32767.0).round() as i16
    })
}

/// One tick of audio at WAV volume, [`SLOW_SMPS`] samples long.
#[must_use]
pub fn wav_packet(tone: Tone, cosine: bool) -> [i16; SLOW_SMPS] {
    match tone {
        Tone::Zero => sine_packet(1.0, WAV_VOLUME, cosine),
        Tone::One | Tone::Leader => sine_packet(2.0, WAV_VOLUME, cosine),
        Tone::Silence => [0; SLOW_SMPS],
    }
}

#[derive(Debug, Clone)]
struct Ring {
    buf: Vec<i16>,
    start: usize,
    fill: usize,
    overflow_warned: bool,
}

impl Ring {
    /// Append a packet, or `len` zeros when `src` is `None`. A packet that
    /// doesn't fit is dropped.
    fn append(&mut self, src: Option<&[i16]>, len: usize) {
        if self.fill + len >= RINGBUF_LEN {
            if !self.overflow_warned {
                log::warn!("tapenoise: audio ring buffer is full");
                self.overflow_warned = true;
            }
            return;
        }
        self.overflow_warned = false;
        let mut pos = (self.start + self.fill) % RINGBUF_LEN;
        for n in 0..len {
            self.buf[pos] = src.map_or(0, |s| s[n]);
            pos = (pos + 1) % RINGBUF_LEN;
        }
        self.fill += len;
    }
}

/// Tone-to-PCM producer feeding a bounded ring buffer.
#[derive(Debug, Clone)]
pub struct TapeNoise {
    ring: Ring,
    fast: bool,
    enabled: bool,
    motor_events: Vec<bool>,
    zero_slow: [i16; SLOW_SMPS],
    one_slow: [i16; SLOW_SMPS],
    zero_fast: [i16; FAST_SMPS],
    one_fast: [i16; FAST_SMPS],
}

impl TapeNoise {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ring: Ring {
                buf: vec![0; RINGBUF_LEN],
                start: 0,
                fill: 0,
                overflow_warned: false,
            },
            fast: false,
            enabled: false,
            motor_events: Vec::new(),
            zero_slow: sine_packet(1.0, LIVE_VOLUME, false),
            one_slow: sine_packet(2.0, LIVE_VOLUME, false),
            zero_fast: sine_packet(1.0, LIVE_VOLUME, false),
            one_fast: sine_packet(2.0, LIVE_VOLUME, false),
        }
    }

    /// Switch noise on or off. Switching on primes the buffer half full of
    /// silence so playback starts without an underrun.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.ring.buf.fill(0);
            self.ring.start = 0;
            self.ring.fill = RINGBUF_LEN / 2;
        }
        self.enabled = enabled;
        if !enabled {
            self.ring.fill = 0;
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Samples waiting to be played.
    #[must_use]
    pub fn fill(&self) -> usize {
        self.ring.fill
    }

    /// Queue one tick's worth of audio.
    pub fn send_tone(&mut self, tone: Tone) {
        self.fast = self.ring.fill >= RINGBUF_LEN / 2;
        if tone == Tone::Leader && self.fast {
            return;
        }
        if !self.enabled {
            self.ring.fill = 0;
            return;
        }
        let (zero, one, len): (&[i16], &[i16], usize) = if self.fast {
            (&self.zero_fast, &self.one_fast, FAST_SMPS)
        } else {
            (&self.zero_slow, &self.one_slow, SLOW_SMPS)
        };
        let src = match tone {
            Tone::Zero => Some(zero),
            Tone::One | Tone::Leader => Some(one),
            Tone::Silence => None,
        };
        self.ring.append(src, len);
    }

    /// Drain up to [`PLAY_LEN`] samples into `out`, padding with silence.
    /// Returns the number of real samples.
    pub fn play(&mut self, out: &mut Vec<i16>) -> usize {
        let ring = &mut self.ring;
        if ring.fill == 0 {
            return 0;
        }
        let n = ring.fill.min(PLAY_LEN);
        out.reserve(PLAY_LEN);
        for _ in 0..n {
            out.push(ring.buf[ring.start]);
            ring.start = (ring.start + 1) % RINGBUF_LEN;
        }
        ring.fill -= n;
        out.resize(out.len() + (PLAY_LEN - n), 0);
        n
    }

    /// Note a motor relay click for the host to play.
    pub fn motorchange(&mut self, on: bool) {
        log::debug!("tapenoise: motorchange, stat={}", u8::from(on));
        self.motor_events.push(on);
    }

    /// Relay clicks since the last call.
    pub fn take_motor_events(&mut self) -> Vec<bool> {
        std::mem::take(&mut self.motor_events)
    }
}

impl Default for TapeNoise {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_sizes_straddle_base_frequency() {
        assert_eq!(FAST_SMPS, 36);
        assert_eq!(SLOW_SMPS, 37);
        assert_eq!(RINGBUF_LEN, 22_050);
    }

    #[test]
    fn disabled_noise_stays_empty() {
        let mut noise = TapeNoise::new();
        noise.send_tone(Tone::One);
        assert_eq!(noise.fill(), 0);
    }

    #[test]
    fn primed_buffer_runs_fast_and_drops_leader() {
        let mut noise = TapeNoise::new();
        noise.set_enabled(true);
        let primed = noise.fill();
        noise.send_tone(Tone::Leader);
        assert_eq!(noise.fill(), primed);
        noise.send_tone(Tone::Zero);
        assert_eq!(noise.fill(), primed + FAST_SMPS);
    }

    #[test]
    fn draining_below_half_switches_to_slow_packets() {
        let mut noise = TapeNoise::new();
        noise.set_enabled(true);
        let mut out = Vec::new();
        assert_eq!(noise.play(&mut out), PLAY_LEN);
        assert_eq!(out.len(), PLAY_LEN);
        let before = noise.fill();
        noise.send_tone(Tone::Leader);
        assert_eq!(noise.fill(), before + SLOW_SMPS);
    }

    #[test]
    fn wav_packets_are_silent_or_full_scale() {
        assert!(wav_packet(Tone::Silence, false).iter().all(|&s| s == 0));
        let zero = wav_packet(Tone::Zero, false);
        assert_eq!(zero[0], 0);
        let peak = zero.iter().copied().max().unwrap_or(0);
        assert!(peak > 24_000);
        assert_eq!(wav_packet(Tone::Zero, true)[0], 24_575);
    }
}
