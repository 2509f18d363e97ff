//! Transport panel: a headless tape-deck front panel on its own thread.
//!
//! The emulation thread and the panel talk through two bounded queues and a
//! latest-value cell. Neither side ever blocks on the other: a full queue
//! loses its oldest message. The panel thread never sees the deck itself,
//! only what is sent to it (lamp states, the interval list, inlay scans) and
//! the rapid values (elapsed time and current tone), which change too often
//! to be worth queueing.
//!
//! Input arrives through [`PanelControls`]: scrubbing the seek bar, the
//! record button and the arrow keys. The main thread acts on it in
//! [`EmulatorState::handle_transport_messages`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::deck::to_hms;
use crate::error::Result;
use crate::format::uef::Inlay;
use crate::interval::{IntervalKind, IntervalList};
use crate::machine::EmulatorState;
use crate::tone::Tone;
use crate::SEEK_END_BACKOFF;

/// Capacity of each message queue.
pub const QUEUE_CAPACITY: usize = 16;

const IDLE_SLEEP: Duration = Duration::from_millis(10);
const KEY_REPEAT_ONSET: Duration = Duration::from_millis(500);
/// Ticks moved per repeat while an arrow key is held.
const KEY_HOLD_SEEK_TICKS: i32 = 20_000;
/// Ticks moved by a single arrow key press (about five seconds).
const KEY_PRESS_SEEK_TICKS: i32 = 6010;
/// The DCD lamp is a blip; keep it lit long enough to see.
const DCD_FLASH: Duration = Duration::from_millis(60);
/// Characters in the rendered seek bar.
pub const STRIPE_COLUMNS: usize = 64;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Emulation thread to panel.
#[derive(Debug, Clone)]
pub enum ToGui {
    Motor(bool),
    Record(bool),
    Dcd(bool),
    /// The ACIA is on its /64 divider with the motor running.
    Baud300(bool),
    Eof(bool),
    /// Error code for the readout; 0 clears it.
    Error(u16),
    Inlays(Vec<Inlay>),
    Stripes(IntervalList),
}

/// Panel to emulation thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FromGui {
    Seek {
        fraction: f32,
        held: bool,
        left_held: bool,
        right_held: bool,
    },
    SeekAndSetRecord {
        record: bool,
        fraction: f32,
    },
    SeekReleased,
    LeftReleased,
    RightReleased,
    ThreadStarted,
}

/// Send without blocking. A full queue loses its oldest message.
fn send_dropping_oldest<T>(tx: &Sender<T>, rx: &Receiver<T>, msg: T, queue: &str) {
    match tx.try_send(msg) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
        Err(TrySendError::Full(msg)) => {
            log::warn!("tapectrl: {queue} queue is full; dropping oldest message");
            let _ = rx.try_recv();
            if tx.try_send(msg).is_err() {
                log::warn!("tapectrl: {queue} queue: message lost");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rapid values
// ---------------------------------------------------------------------------

/// Latest elapsed time and tone. Each value carries a ready flag so the
/// reader only acts on fresh writes.
#[derive(Debug, Default)]
pub struct RapidValues {
    elapsed: AtomicI32,
    time_ready: AtomicBool,
    tone: AtomicU8,
    tone_ready: AtomicBool,
}

impl RapidValues {
    pub fn set_time(&self, elapsed: i32) {
        self.elapsed.store(elapsed, Ordering::Relaxed);
        self.time_ready.store(true, Ordering::Release);
    }

    pub fn set_tone(&self, tone: Tone) {
        self.tone.store(tone.as_char() as u8, Ordering::Relaxed);
        self.tone_ready.store(true, Ordering::Release);
    }

    pub fn take_time(&self) -> Option<i32> {
        self.time_ready
            .swap(false, Ordering::Acquire)
            .then(|| self.elapsed.load(Ordering::Relaxed))
    }

    pub fn take_tone(&self) -> Option<Tone> {
        if !self.tone_ready.swap(false, Ordering::Acquire) {
            return None;
        }
        Tone::from_char(char::from(self.tone.load(Ordering::Relaxed)))
    }
}

// ---------------------------------------------------------------------------
// Panel state
// ---------------------------------------------------------------------------

/// Everything the panel displays.
#[derive(Debug, Clone, Default)]
pub struct PanelState {
    pub elapsed: i32,
    pub motor: bool,
    pub record: bool,
    pub dcd: bool,
    dcd_since: Option<Instant>,
    pub baud300: bool,
    pub eof: bool,
    pub error: u16,
    /// Anything but silence under the head.
    pub have_signal: bool,
    /// Signal that isn't leader.
    pub have_data: bool,
    pub inlays: Vec<Inlay>,
    pub stripes: IntervalList,
    /// Seek bar held down by the mouse.
    pub scrubbing: bool,
    /// Last rendered frame.
    pub frame: String,
}

impl PanelState {
    /// Tape length as the panel knows it, from the interval list.
    #[must_use]
    pub fn duration(&self) -> i32 {
        self.stripes.end()
    }

    fn apply(&mut self, msg: ToGui, now: Instant) {
        match msg {
            ToGui::Motor(on) => self.motor = on,
            ToGui::Record(on) => self.record = on,
            ToGui::Dcd(on) => {
                self.dcd = on;
                if on {
                    self.dcd_since = Some(now);
                }
            }
            ToGui::Baud300(on) => self.baud300 = on,
            ToGui::Eof(eof) => self.eof = eof,
            ToGui::Error(code) => self.error = code,
            ToGui::Inlays(inlays) => self.inlays = inlays,
            ToGui::Stripes(list) => self.stripes = list,
        }
    }

    /// Produce the text frame: clock, lamp row, then the seek bar.
    #[must_use]
    pub fn render(&self) -> String {
        let clock = if self.error != 0 {
            format!("E{}", self.error)
        } else {
            let (h, m, s) = to_hms(self.elapsed);
            format!("{h}:{m:02}:{s:02}")
        };
        let lamp = |on: bool, label: &str| {
            if on {
                format!("[{label}]")
            } else {
                format!("[{}]", " ".repeat(label.len()))
            }
        };
        let lamps = [
            lamp(self.motor, "MOTOR"),
            lamp(self.have_signal, "SIGNAL"),
            lamp(self.have_data, "DATA"),
            lamp(self.dcd, "DCD"),
            lamp(self.baud300, "300"),
            lamp(self.eof, "EOF"),
            lamp(self.record, "REC"),
        ]
        .join(" ");
        format!("{clock:<8}  {lamps}\n|{}|\n", self.stripe_bar())
    }

    fn stripe_bar(&self) -> String {
        let duration = self.duration();
        if duration <= 0 {
            return " ".repeat(STRIPE_COLUMNS);
        }
        let cols = STRIPE_COLUMNS as i64;
        let cursor = (i64::from(self.elapsed) * cols / i64::from(duration)).clamp(0, cols - 1);
        let list = self.stripes.intervals();
        (0..cols)
            .map(|col| {
                if col == cursor {
                    return '^';
                }
                let tick = (col * i64::from(duration) / cols) as i32;
                let ix = list.partition_point(|iv| iv.end() <= tick);
                match list.get(ix).map(|iv| iv.kind) {
                    Some(IntervalKind::Data) => '#',
                    Some(IntervalKind::Leader) => '-',
                    Some(IntervalKind::Silence) | None => ' ',
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Shared between both sides
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Shared {
    rapid: RapidValues,
    state: Mutex<PanelState>,
    shutdown: AtomicBool,
}

/// The panel's input surface. Cheap to clone; safe to use from any thread.
#[derive(Debug, Clone)]
pub struct PanelControls {
    tx: Sender<FromGui>,
    rx: Receiver<FromGui>,
    shared: Arc<Shared>,
}

impl PanelControls {
    fn send(&self, msg: FromGui) {
        send_dropping_oldest(&self.tx, &self.rx, msg, "from_gui");
    }

    /// Click or drag on the seek bar. Ignored while recording.
    pub fn scrub(&self, fraction: f32, held: bool) {
        let fraction = fraction.clamp(0.0, 1.0);
        {
            let mut state = self.shared.state.lock();
            if state.record {
                return;
            }
            state.scrubbing = held;
            // Move the readout now rather than wait for the round trip.
            state.elapsed = (fraction * state.duration() as f32) as i32;
        }
        self.send(FromGui::Seek {
            fraction,
            held,
            left_held: false,
            right_held: false,
        });
    }

    pub fn release_scrub(&self) {
        self.shared.state.lock().scrubbing = false;
        self.send(FromGui::SeekReleased);
    }

    /// Toggle record. Arming winds to the end of the tape; disarming winds
    /// back to the start.
    pub fn press_record(&self) {
        let record = {
            let mut state = self.shared.state.lock();
            state.record = !state.record;
            state.record
        };
        self.send(FromGui::SeekAndSetRecord {
            record,
            fraction: if record { 1.0 } else { 0.0 },
        });
    }

    /// Left or right arrow pressed: jump a few seconds, then keep going while
    /// the key stays down.
    pub fn press_arrow(&self, left: bool) {
        let fraction = {
            let state = self.shared.state.lock();
            let duration = state.duration();
            if state.record || duration <= 0 {
                return;
            }
            let step = if left { -KEY_PRESS_SEEK_TICKS } else { KEY_PRESS_SEEK_TICKS };
            ((state.elapsed + step) as f32 / duration as f32).clamp(0.0, 1.0)
        };
        self.send(FromGui::Seek {
            fraction,
            held: false,
            left_held: left,
            right_held: !left,
        });
    }

    pub fn release_arrow(&self, left: bool) {
        self.send(if left {
            FromGui::LeftReleased
        } else {
            FromGui::RightReleased
        });
    }

    /// Copy of the panel as last updated.
    #[must_use]
    pub fn state(&self) -> PanelState {
        self.shared.state.lock().clone()
    }

    /// Last rendered frame.
    #[must_use]
    pub fn frame(&self) -> String {
        self.shared.state.lock().frame.clone()
    }
}

// ---------------------------------------------------------------------------
// Panel side
// ---------------------------------------------------------------------------

/// The panel thread's end of the link.
#[derive(Debug)]
pub struct PanelGui {
    rx: Receiver<ToGui>,
    controls: PanelControls,
    started: bool,
}

impl PanelGui {
    /// One pass of the panel loop. Returns true if the frame was redrawn.
    pub fn step(&mut self, now: Instant) -> bool {
        if !self.started {
            self.started = true;
            self.controls.send(FromGui::ThreadStarted);
        }
        let shared = &self.controls.shared;
        let mut changed = false;
        let mut state = shared.state.lock();
        while let Ok(msg) = self.rx.try_recv() {
            state.apply(msg, now);
            changed = true;
        }
        if let Some(elapsed) = shared.rapid.take_time() {
            if !state.scrubbing {
                state.elapsed = elapsed;
            }
            changed = true;
        }
        if let Some(tone) = shared.rapid.take_tone() {
            state.have_signal = tone != Tone::Silence;
            state.have_data = state.have_signal && tone != Tone::Leader;
            changed = true;
        }
        if state.dcd && state.dcd_since.is_some_and(|t| now.duration_since(t) > DCD_FLASH) {
            state.dcd = false;
            changed = true;
        }
        if changed || state.frame.is_empty() {
            state.frame = state.render();
        }
        changed
    }

    fn run(mut self) {
        log::debug!("tapectrl: panel thread started");
        while !self.controls.shared.shutdown.load(Ordering::Acquire) {
            if !self.step(Instant::now()) {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        log::debug!("tapectrl: panel thread finished");
    }
}

// ---------------------------------------------------------------------------
// Emulation side
// ---------------------------------------------------------------------------

/// Arrow-key and scrub state kept by the emulation thread.
#[derive(Debug, Clone, Copy, Default)]
struct SeekKeys {
    last_position: i32,
    left_held: bool,
    right_held: bool,
    repeat_start: Option<Instant>,
    /// A seek control is being held; the tape doesn't play meanwhile.
    inhibited: bool,
}

/// The emulation thread's end of the link, owning the panel thread.
#[derive(Debug)]
pub struct TransportPanel {
    tx: Sender<ToGui>,
    tx_drain: Receiver<ToGui>,
    rx: Receiver<FromGui>,
    controls: PanelControls,
    thread: Option<JoinHandle<()>>,
    keys: SeekKeys,
}

impl TransportPanel {
    /// Build both ends of the link without starting a thread. The caller
    /// drives the panel with [`PanelGui::step`].
    #[must_use]
    pub fn unthreaded() -> (Self, PanelGui) {
        let (to_tx, to_rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
        let (from_tx, from_rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            rapid: RapidValues::default(),
            state: Mutex::new(PanelState::default()),
            shutdown: AtomicBool::new(false),
        });
        let controls = PanelControls {
            tx: from_tx,
            rx: from_rx.clone(),
            shared,
        };
        let panel = Self {
            tx: to_tx,
            tx_drain: to_rx.clone(),
            rx: from_rx,
            controls: controls.clone(),
            thread: None,
            keys: SeekKeys::default(),
        };
        let gui = PanelGui {
            rx: to_rx,
            controls,
            started: false,
        };
        (panel, gui)
    }

    /// Start the panel on its own thread.
    pub fn open() -> std::io::Result<Self> {
        let (mut panel, gui) = Self::unthreaded();
        let handle = std::thread::Builder::new()
            .name("tapectrl".into())
            .spawn(move || gui.run())?;
        panel.thread = Some(handle);
        Ok(panel)
    }

    #[must_use]
    pub fn controls(&self) -> PanelControls {
        self.controls.clone()
    }

    pub fn send(&self, msg: ToGui) {
        send_dropping_oldest(&self.tx, &self.tx_drain, msg, "to_gui");
    }

    #[must_use]
    pub fn rapid(&self) -> &RapidValues {
        &self.controls.shared.rapid
    }

    /// True while a seek control is held down.
    #[must_use]
    pub fn inhibited(&self) -> bool {
        self.keys.inhibited
    }

    /// Drain the input queue. Consecutive scrubs collapse into the first
    /// one's slot, carrying the latest position.
    fn take_messages(&self) -> Vec<FromGui> {
        let mut out: Vec<FromGui> = Vec::with_capacity(QUEUE_CAPACITY);
        while let Ok(msg) = self.rx.try_recv() {
            if let FromGui::Seek { fraction: new, .. } = msg {
                let queued = out
                    .iter_mut()
                    .find(|m| matches!(m, FromGui::Seek { .. }));
                if let Some(FromGui::Seek { fraction, .. }) = queued {
                    *fraction = new;
                    continue;
                }
            }
            out.push(msg);
        }
        out
    }

    /// Stop the panel thread and wait for it.
    pub fn close(&mut self) {
        self.controls.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::warn!("tapectrl: panel thread panicked");
            }
        }
    }
}

impl Drop for TransportPanel {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Main-thread message handling
// ---------------------------------------------------------------------------

impl EmulatorState {
    /// Act on panel input. Call once per host frame.
    pub fn handle_transport_messages(&mut self) -> Result<()> {
        self.handle_transport_messages_at(Instant::now())
    }

    pub(crate) fn handle_transport_messages_at(&mut self, now: Instant) -> Result<()> {
        let Some(panel) = self.transport.as_ref() else {
            return Ok(());
        };
        let div64 = self.acia.control() & 3 == 2;
        panel.send(ToGui::Baud300(div64 && self.ula.motor()));
        let msgs = panel.take_messages();
        let mut keys = panel.keys;

        let duration = if self.tape.prior_exception.is_none() {
            self.tape.duration()?
        } else {
            0
        };

        let mut outcome = Ok(());
        for msg in msgs {
            outcome = self.transport_message(msg, duration, &mut keys, now);
            if outcome.is_err() {
                break;
            }
        }
        if outcome.is_ok() {
            outcome = self.transport_key_repeat(duration, &mut keys, now);
        }
        if let Some(panel) = self.transport.as_mut() {
            panel.keys = keys;
        }
        outcome
    }

    fn transport_message(
        &mut self,
        msg: FromGui,
        duration: i32,
        keys: &mut SeekKeys,
        now: Instant,
    ) -> Result<()> {
        match msg {
            FromGui::Seek {
                fraction,
                held,
                left_held,
                right_held,
            } => {
                if duration > 0 {
                    self.transport_seek(fraction, duration, keys)?;
                    keys.inhibited |= held || left_held || right_held;
                    if left_held {
                        keys.left_held = true;
                        keys.repeat_start = Some(now);
                    }
                    if right_held {
                        keys.right_held = true;
                        keys.repeat_start = Some(now);
                    }
                }
            }
            FromGui::SeekAndSetRecord { record, fraction } => {
                // Record works even on a tape with nothing on it yet.
                if self.tape.prior_exception.is_none() {
                    self.set_record(record)?;
                }
                if duration > 0 {
                    self.transport_seek(fraction, duration, keys)?;
                }
            }
            FromGui::SeekReleased => {
                if duration > 0 {
                    keys.inhibited = false;
                }
            }
            FromGui::LeftReleased => {
                if duration > 0 {
                    keys.inhibited = false;
                    keys.left_held = false;
                }
            }
            FromGui::RightReleased => {
                if duration > 0 {
                    keys.inhibited = false;
                    keys.right_held = false;
                }
            }
            FromGui::ThreadStarted => self.transport_resync(duration),
        }
        Ok(())
    }

    fn transport_seek(&mut self, fraction: f32, duration: i32, keys: &mut SeekKeys) -> Result<()> {
        keys.last_position = (duration as f32 * fraction) as i32;
        self.seek_to(keys.last_position, duration)?;
        Ok(())
    }

    /// Wind the tape to tick `wanted` (clamped as for
    /// [`TapeState::seek_absolute`](crate::deck::TapeState::seek_absolute))
    /// and move the counter with it.
    pub fn seek_to(&mut self, wanted: i32, duration: i32) -> Result<(i32, bool)> {
        let (actual, eof) = self.tape.seek_absolute(wanted, duration)?;
        if let Some(panel) = &self.transport {
            panel.rapid().set_time(actual);
            panel.send(ToGui::Eof(eof));
        }
        self.tape.rx.previous_eof = eof;
        self.tape.tallied = actual;
        Ok((actual, eof))
    }

    fn transport_key_repeat(
        &mut self,
        duration: i32,
        keys: &mut SeekKeys,
        now: Instant,
    ) -> Result<()> {
        if duration <= 0 || !(keys.left_held || keys.right_held) {
            return Ok(());
        }
        let due = keys
            .repeat_start
            .is_some_and(|t| now.duration_since(t) > KEY_REPEAT_ONSET);
        if !due || self.tape.prior_exception.is_some() {
            return Ok(());
        }
        if keys.left_held {
            keys.last_position -= KEY_HOLD_SEEK_TICKS;
        } else {
            keys.last_position += KEY_HOLD_SEEK_TICKS;
        }
        if keys.last_position >= duration {
            keys.last_position = duration - SEEK_END_BACKOFF;
        }
        keys.last_position = keys.last_position.max(0);

        let (actual, eof) = self.tape.seek_absolute(keys.last_position, duration)?;
        self.tape.tallied = actual;
        if let Some(panel) = &self.transport {
            panel.rapid().set_time(actual);
            if eof != self.tape.rx.previous_eof {
                panel.send(ToGui::Eof(eof));
            }
        }
        self.tape.rx.previous_eof = eof;
        Ok(())
    }

    /// Everything a freshly started panel needs to catch up.
    pub(crate) fn transport_resync(&self, duration: i32) {
        let Some(panel) = &self.transport else {
            return;
        };
        let tallied = if self.recording {
            duration
        } else {
            self.tape.tallied
        };
        panel.send(ToGui::Motor(self.ula.motor()));
        panel.rapid().set_time(tallied);
        panel.send(ToGui::Eof(false));
        panel.send(ToGui::Error(
            self.tape.prior_exception.as_ref().map_or(0, |e| e.code()),
        ));
        panel.send(ToGui::Record(self.recording));
        panel.send(ToGui::Stripes(self.tape.intervals.clone()));
        panel.send(ToGui::Inlays(self.tape.uef.globals().inlays.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TibetTape;

    fn panel_with_tape() -> (EmulatorState, PanelGui) {
        let mut emu = EmulatorState::new(crate::TapeConfig::default());
        let text = "tibet 0.5\nleader 30000\nsilence 20.0\nleader 9000\n";
        emu.tape
            .insert_tibet(TibetTape::decode(text.as_bytes()).expect("valid TIBET"));
        emu.tape.initial_scan().expect("scan");
        emu.tape.rewind();
        let (panel, gui) = TransportPanel::unthreaded();
        emu.transport = Some(panel);
        (emu, gui)
    }

    #[test]
    fn full_queue_drops_oldest() {
        let (tx, rx) = crossbeam_channel::bounded(2);
        for n in 0..3 {
            send_dropping_oldest(&tx, &rx, n, "test");
        }
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn rapid_values_are_taken_once() {
        let rapid = RapidValues::default();
        assert_eq!(rapid.take_time(), None);
        rapid.set_time(5);
        rapid.set_time(9);
        rapid.set_tone(Tone::Leader);
        assert_eq!(rapid.take_time(), Some(9));
        assert_eq!(rapid.take_time(), None);
        assert_eq!(rapid.take_tone(), Some(Tone::Leader));
    }

    #[test]
    fn queued_scrubs_collapse() {
        let (panel, _gui) = TransportPanel::unthreaded();
        let controls = panel.controls();
        controls.release_arrow(true);
        controls.scrub(0.25, true);
        controls.scrub(0.5, true);
        let msgs = panel.take_messages();
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[1], FromGui::Seek { fraction, held: true, .. } if fraction == 0.5));
    }

    #[test]
    fn startup_burst_reaches_the_panel() {
        let (mut emu, mut gui) = panel_with_tape();
        let now = Instant::now();
        gui.step(now);
        emu.handle_transport_messages_at(now).expect("handle");
        gui.step(now);
        let controls = emu.transport.as_ref().expect("panel").controls();
        let state = controls.state();
        assert_eq!(state.duration(), emu.tape.duration().expect("duration"));
        assert!(!state.motor);
        assert_eq!(state.error, 0);
        assert!(controls.frame().starts_with("0:00:00 "));
    }

    #[test]
    fn scrub_moves_the_tape() {
        let (mut emu, mut gui) = panel_with_tape();
        let now = Instant::now();
        gui.step(now);
        let controls = emu.transport.as_ref().expect("panel").controls();
        controls.scrub(0.5, true);
        emu.handle_transport_messages_at(now).expect("handle");
        let d = emu.tape.duration().expect("duration");
        assert_eq!(emu.tape.tallied(), d / 2);
        assert!(emu.transport.as_ref().expect("panel").inhibited());
        controls.release_scrub();
        emu.handle_transport_messages_at(now).expect("handle");
        assert!(!emu.transport.as_ref().expect("panel").inhibited());
    }

    #[test]
    fn held_arrow_repeats_after_onset() {
        let (mut emu, mut gui) = panel_with_tape();
        let now = Instant::now();
        gui.step(now);
        emu.handle_transport_messages_at(now).expect("handle");
        gui.step(now);
        let controls = emu.transport.as_ref().expect("panel").controls();
        controls.press_arrow(false);
        emu.handle_transport_messages_at(now).expect("handle");
        let first = emu.tape.tallied();
        assert!((first - KEY_PRESS_SEEK_TICKS).abs() <= 1);
        emu.handle_transport_messages_at(now + Duration::from_millis(100))
            .expect("handle");
        assert_eq!(emu.tape.tallied(), first);
        emu.handle_transport_messages_at(now + Duration::from_millis(600))
            .expect("handle");
        assert_eq!(emu.tape.tallied(), first + KEY_HOLD_SEEK_TICKS);
    }

    #[test]
    fn render_shows_error_code_instead_of_clock() {
        let state = PanelState {
            error: 303,
            motor: true,
            ..PanelState::default()
        };
        let frame = state.render();
        assert!(frame.starts_with("E303      [MOTOR]"), "{frame}");
        assert!(frame.contains("[   ]"));

        let running = PanelState {
            elapsed: 90_200,
            ..PanelState::default()
        };
        assert!(running.render().starts_with("0:01:15   [     ]"));
    }

    #[test]
    fn threaded_panel_shuts_down() {
        let mut panel = TransportPanel::open().expect("spawn");
        panel.send(ToGui::Motor(true));
        panel.close();
        assert!(panel.thread.is_none());
    }
}
