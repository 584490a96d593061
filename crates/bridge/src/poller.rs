//! Email command poller: turns unread command mails into device writes and
//! report requests.
//!
//! Each pass searches every command category independently. For a category
//! with matches, all matched messages are marked read first and the
//! category's action runs once, no matter how many messages matched. An
//! action that fails is logged and not retried; the mails are already
//! consumed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::DeviceLink;
use crate::mail::Inbox;
use crate::protocol::OutboundCommand;
use crate::report::ReportTrigger;

pub struct CommandPoller {
    inbox: Arc<dyn Inbox>,
    device: Arc<dyn DeviceLink>,
    reports: mpsc::Sender<ReportTrigger>,
}

impl CommandPoller {
    pub fn new(
        inbox: Arc<dyn Inbox>,
        device: Arc<dyn DeviceLink>,
        reports: mpsc::Sender<ReportTrigger>,
    ) -> Self {
        Self {
            inbox,
            device,
            reports,
        }
    }

    /// One poll pass. Returns the commands whose messages were consumed.
    pub async fn poll_once(&self) -> Vec<OutboundCommand> {
        if let Err(e) = self.inbox.refresh().await {
            warn!("inbox refresh failed: {e:#}");
            return Vec::new();
        }

        let mut consumed = Vec::new();
        for cmd in OutboundCommand::ALL {
            let ids = match self.inbox.search_unread(cmd.subject()).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(subject = cmd.subject(), "inbox search failed: {e:#}");
                    continue;
                }
            };
            if ids.is_empty() {
                continue;
            }

            // Not marked means not consumed: leave the action for the next pass.
            if let Err(e) = self.inbox.mark_read(&ids).await {
                warn!(subject = cmd.subject(), count = ids.len(), "mark read failed: {e:#}");
                continue;
            }

            info!(subject = cmd.subject(), count = ids.len(), "email command received");
            consumed.push(cmd);

            if let Err(e) = self.execute(cmd).await {
                error!(command = ?cmd, "email command failed: {e:#}");
            }
        }
        consumed
    }

    async fn execute(&self, cmd: OutboundCommand) -> Result<()> {
        match cmd.device_token() {
            Some(token) => self.device.send(token).await,
            None => self
                .reports
                .try_send(ReportTrigger::EmailCommand)
                .map_err(|e| anyhow!("report request not queued: {e}")),
        }
    }
}

/// Run the poll loop until cancelled. Intended to be `tokio::spawn`-ed from main.
pub async fn run(poller: CommandPoller, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_sec = interval.as_secs(), "command poller started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let consumed = poller.poll_once().await;
                if !consumed.is_empty() {
                    debug!(?consumed, "poll pass done");
                }
            }
            _ = cancel.cancelled() => {
                info!("command poller shutting down");
                break;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
