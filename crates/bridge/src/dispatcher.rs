//! Serial message dispatcher: applies each device status line to the shared
//! aggregate and raises alerts.
//!
//! ## Locking
//!
//! Line handling and the periodic timer tick both take the state write lock
//! for the duration of one mutation only. Alerts are mailed from a spawned
//! task after the lock is released, so a slow SMTP server never delays
//! ingestion.

use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::notify::{Alert, Notifier};
use crate::protocol::{parse_line, InboundEvent};
use crate::state::{BridgeState, Mode, SharedState};

/// How often running mode timers are folded into the aggregate when the
/// device is quiet.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Apply one event's side effect to the aggregate and timers.
pub(crate) fn apply(state: &mut BridgeState, event: &InboundEvent, now: Instant) {
    match event {
        InboundEvent::TemperatureReading(v) => state.record_temperature(*v),
        InboundEvent::IlluminationReading(v) => state.record_illumination(*v),
        InboundEvent::MotionDetected => state.record_detection(),
        InboundEvent::SecurityOn => state.mode_on(Mode::Secure, now),
        InboundEvent::SecurityOff => state.mode_off(Mode::Secure, now),
        InboundEvent::LightsAuto => state.mode_on(Mode::AutoLight, now),
        InboundEvent::LightsManual => state.mode_off(Mode::AutoLight, now),
        InboundEvent::MotionNotify | InboundEvent::EmergencyOn | InboundEvent::Unrecognized(_) => {}
    }
}

pub(crate) fn alert_for(event: &InboundEvent) -> Option<Alert> {
    match event {
        InboundEvent::MotionNotify => Some(Alert::Motion),
        InboundEvent::EmergencyOn => Some(Alert::Emergency),
        _ => None,
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    state: SharedState,
    notifier: Notifier,
}

impl Dispatcher {
    pub fn new(state: SharedState, notifier: Notifier) -> Self {
        Self { state, notifier }
    }

    /// Parse and apply one raw device line.
    pub async fn handle_line(&self, raw: &str) -> InboundEvent {
        let event = parse_line(raw);

        {
            let mut st = self.state.write().await;
            apply(&mut st, &event, Instant::now());
        }

        match &event {
            InboundEvent::Unrecognized(line) => debug!(line = %line, "device: ignoring line"),
            other => debug!(event = ?other, "device event"),
        }

        if let Some(alert) = alert_for(&event) {
            info!(?alert, "raising alert");
            let notifier = self.notifier.clone();
            let raised_at = OffsetDateTime::now_utc();
            tokio::spawn(async move {
                notifier.send_alert(alert, raised_at).await;
            });
        }

        event
    }

    async fn tick(&self) {
        self.state.write().await.tick(Instant::now());
    }
}

/// Run the dispatcher until cancelled or the line source closes. Intended
/// to be `tokio::spawn`-ed from main.
pub async fn run(dispatcher: Dispatcher, mut lines: mpsc::Receiver<String>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("dispatcher started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("dispatcher shutting down");
                break;
            }
            line = lines.recv() => {
                let Some(line) = line else {
                    info!("device line source closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                dispatcher.handle_line(&line).await;
                dispatcher.tick().await;
            }
            _ = ticker.tick() => dispatcher.tick().await,
        }
    }

    // Fold whatever ran up to shutdown.
    let (metrics, secure_active, auto_light_active) = {
        let mut st = dispatcher.state.write().await;
        st.tick(Instant::now());
        (st.snapshot(), st.is_active(Mode::Secure), st.is_active(Mode::AutoLight))
    };
    info!(?metrics, secure_active, auto_light_active, "dispatcher stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
