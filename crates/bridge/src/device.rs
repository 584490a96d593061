//! Serial link to the home-automation controller.
//!
//! Inbound status lines are read on a dedicated blocking thread and handed to
//! the dispatcher through a bounded channel in arrival order. Outbound command
//! tokens go through [`DeviceLink`], which the command poller holds.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serialport::SerialPort;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Partial lines longer than this are dropped.
const MAX_LINE_LEN: usize = 1024;

const LINE_CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Write one command token as a single line.
    async fn send(&self, token: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Serial implementation
// ---------------------------------------------------------------------------

pub struct SerialDevice {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl SerialDevice {
    /// Open the port and start the reader thread. Returns the writer handle
    /// and the receiving end of the line channel.
    pub fn open(
        cfg: &DeviceConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<String>)> {
        let port = serialport::new(&cfg.port, cfg.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .with_context(|| format!("failed to open serial port {}", cfg.port))?;

        let reader = port
            .try_clone()
            .with_context(|| format!("failed to clone serial port {}", cfg.port))?;

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let name = cfg.port.clone();
        thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || read_lines(reader, tx, cancel))
            .context("failed to spawn serial reader thread")?;

        info!(port = %name, baud = cfg.baud_rate, "serial port open");

        Ok((
            Self {
                port: Arc::new(Mutex::new(port)),
            },
            rx,
        ))
    }
}

#[async_trait]
impl DeviceLink for SerialDevice {
    async fn send(&self, token: &str) -> Result<()> {
        let mut port = self.port.lock().await;
        port.write_all(format!("{token}\n").as_bytes())
            .with_context(|| format!("serial write failed for '{token}'"))?;
        port.flush().context("serial flush failed")?;
        debug!(token, "device command written");
        Ok(())
    }
}

fn read_lines(
    mut port: Box<dyn SerialPort>,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 256];
    let mut lines = LineBuffer::default();

    while !cancel.is_cancelled() {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                for line in lines.push(&buf[..n]) {
                    if tx.blocking_send(line).is_err() {
                        debug!("serial reader: dispatcher gone, stopping");
                        return;
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("serial read failed: {e}");
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
    debug!("serial reader stopped");
}

// ---------------------------------------------------------------------------
// Line framing
// ---------------------------------------------------------------------------

/// Accumulates raw bytes and yields complete `\n`-terminated lines.
#[derive(Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                let line = String::from_utf8_lossy(&self.pending)
                    .trim_end_matches('\r')
                    .to_string();
                self.pending.clear();
                out.push(line);
            } else if self.pending.len() < MAX_LINE_LEN {
                self.pending.push(b);
            } else {
                warn!(len = self.pending.len(), "serial line too long, discarding");
                self.pending.clear();
            }
        }
        out
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_complete_line() {
        let mut lb = LineBuffer::default();
        assert_eq!(lb.push(b"temperature:21\n"), vec!["temperature:21"]);
    }

    #[test]
    fn line_split_across_reads() {
        let mut lb = LineBuffer::default();
        assert!(lb.push(b"illumi").is_empty());
        assert!(lb.push(b"nation:3").is_empty());
        assert_eq!(lb.push(b"00\r\n"), vec!["illumination:300"]);
    }

    #[test]
    fn several_lines_in_one_read_keep_order() {
        let mut lb = LineBuffer::default();
        assert_eq!(
            lb.push(b"security:on\nmotion:detected\nsecurity:off\n"),
            vec!["security:on", "motion:detected", "security:off"]
        );
    }

    #[test]
    fn trailing_partial_line_is_held() {
        let mut lb = LineBuffer::default();
        assert_eq!(lb.push(b"lights:auto\nlights:o"), vec!["lights:auto"]);
        assert_eq!(lb.push(b"n\n"), vec!["lights:on"]);
    }

    #[test]
    fn overlong_garbage_is_discarded() {
        let mut lb = LineBuffer::default();
        let junk = vec![b'x'; MAX_LINE_LEN + 10];
        lb.push(&junk);
        let lines = lb.push(b"\nmotion:notify\n");
        assert_eq!(lines.last().map(String::as_str), Some("motion:notify"));
        assert!(lines[0].len() < MAX_LINE_LEN);
    }
}
