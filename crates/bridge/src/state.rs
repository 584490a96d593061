//! Shared metrics aggregate and the two mode timers that feed it.
//!
//! Everything the serial dispatcher writes and the telemetry uploader drains
//! lives in one [`BridgeState`] behind a single lock, so a take-and-reset
//! always observes a consistent set of counters and timer positions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<BridgeState>>;

/// State for a freshly started bridge: automatic lighting counts from boot.
pub fn shared() -> SharedState {
    Arc::new(RwLock::new(BridgeState::at_boot(Instant::now())))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Secure,
    AutoLight,
}

/// Start/stop interval tracker. `active_since` is `Some` exactly while the
/// mode is on.
#[derive(Debug, Default, Clone)]
pub struct ModeTimer {
    active_since: Option<Instant>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MetricsAggregate {
    pub temperature: i64,
    pub illumination: i64,
    pub detection_count: u64,
    pub secure_mode_secs: f64,
    pub auto_light_secs: f64,
}

/// Values handed to the telemetry sink for one upload cycle. Durations are
/// whole seconds; the fraction stays in the aggregate for the next cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadBatch {
    pub temperature: i64,
    pub illumination: i64,
    pub detections: u64,
    pub secure_mode_secs: u64,
    pub auto_light_secs: u64,
}

pub struct BridgeState {
    metrics: MetricsAggregate,
    secure: ModeTimer,
    auto_light: ModeTimer,
}

// ---------------------------------------------------------------------------
// ModeTimer
// ---------------------------------------------------------------------------

impl ModeTimer {
    pub fn is_active(&self) -> bool {
        self.active_since.is_some()
    }

    /// Start the window. A repeated "on" keeps the original start.
    pub fn start(&mut self, now: Instant) {
        if self.active_since.is_none() {
            self.active_since = Some(now);
        }
    }

    /// Close the window and return the time it was open since the last fold.
    pub fn stop(&mut self, now: Instant) -> Duration {
        match self.active_since.take() {
            Some(since) => now.saturating_duration_since(since),
            None => Duration::ZERO,
        }
    }

    /// Fold the elapsed time and restart the window at `now`.
    pub fn tick(&mut self, now: Instant) -> Duration {
        match self.active_since {
            Some(since) => {
                let elapsed = now.saturating_duration_since(since);
                // Never move the window backwards.
                if now > since {
                    self.active_since = Some(now);
                }
                elapsed
            }
            None => Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for BridgeState {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeState {
    pub fn new() -> Self {
        Self {
            metrics: MetricsAggregate::default(),
            secure: ModeTimer::default(),
            auto_light: ModeTimer::default(),
        }
    }

    /// The controller comes up in automatic lighting and only reports the
    /// mode when it changes, so the auto-light window opens at `now`.
    pub fn at_boot(now: Instant) -> Self {
        let mut state = Self::new();
        state.mode_on(Mode::AutoLight, now);
        state
    }

    pub fn record_temperature(&mut self, value: i64) {
        self.metrics.temperature = value;
    }

    pub fn record_illumination(&mut self, value: i64) {
        self.metrics.illumination = value;
    }

    pub fn record_detection(&mut self) {
        self.metrics.detection_count += 1;
    }

    pub fn is_active(&self, mode: Mode) -> bool {
        match mode {
            Mode::Secure => self.secure.is_active(),
            Mode::AutoLight => self.auto_light.is_active(),
        }
    }

    pub fn mode_on(&mut self, mode: Mode, now: Instant) {
        self.timer_mut(mode).start(now);
    }

    pub fn mode_off(&mut self, mode: Mode, now: Instant) {
        let elapsed = self.timer_mut(mode).stop(now);
        self.fold(mode, elapsed);
    }

    /// Fold the running time of both active modes into the aggregate.
    pub fn tick(&mut self, now: Instant) {
        for mode in [Mode::Secure, Mode::AutoLight] {
            let elapsed = self.timer_mut(mode).tick(now);
            self.fold(mode, elapsed);
        }
    }

    /// Bring the durations up to `now`, then take the reset-eligible fields.
    /// The detection counter is zeroed; durations give up their whole
    /// seconds and keep the rounding remainder. Last-value readings are
    /// copied, not reset.
    pub fn take_upload(&mut self, now: Instant) -> UploadBatch {
        self.tick(now);

        let batch = UploadBatch {
            temperature: self.metrics.temperature,
            illumination: self.metrics.illumination,
            detections: self.metrics.detection_count,
            secure_mode_secs: take_whole_secs(&mut self.metrics.secure_mode_secs),
            auto_light_secs: take_whole_secs(&mut self.metrics.auto_light_secs),
        };
        self.metrics.detection_count = 0;

        batch
    }

    /// Put the deltas of a batch that could not be submitted back, so the
    /// next cycle reports them together with whatever accrued meanwhile.
    pub fn restore(&mut self, batch: &UploadBatch) {
        self.metrics.detection_count += batch.detections;
        self.metrics.secure_mode_secs += batch.secure_mode_secs as f64;
        self.metrics.auto_light_secs += batch.auto_light_secs as f64;
    }

    pub fn snapshot(&self) -> MetricsAggregate {
        self.metrics.clone()
    }

    fn timer_mut(&mut self, mode: Mode) -> &mut ModeTimer {
        match mode {
            Mode::Secure => &mut self.secure,
            Mode::AutoLight => &mut self.auto_light,
        }
    }

    fn fold(&mut self, mode: Mode, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        match mode {
            Mode::Secure => self.metrics.secure_mode_secs += secs,
            Mode::AutoLight => self.metrics.auto_light_secs += secs,
        }
    }
}

/// Round `secs` to whole seconds, leaving the remainder (within ±0.5 s) in
/// place. A negative remainder never produces a negative upload.
fn take_whole_secs(secs: &mut f64) -> u64 {
    let whole = secs.round().max(0.0);
    *secs -= whole;
    whole as u64
}

// ===========================================================================
// Tests
// ===========================================================================
