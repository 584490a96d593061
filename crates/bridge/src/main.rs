mod chart;
mod config;
mod device;
mod dispatcher;
mod mail;
mod notify;
mod poller;
mod protocol;
mod report;
mod schedule;
mod state;
mod telemetry;
mod uploader;

use std::env;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chart::SvgChartRenderer;
use device::SerialDevice;
use dispatcher::Dispatcher;
use mail::{ImapInbox, SmtpMailer};
use notify::Notifier;
use poller::CommandPoller;
use report::{ReportGenerator, ReportSchedule};
use telemetry::{TelemetrySink, ThingSpeak};

/// Queued report requests beyond this are dropped by the poller.
const REPORT_QUEUE: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let report_at = cfg.report.time_of_day()?;
    let offset = cfg.report.offset()?;

    let cancel = CancellationToken::new();

    // ── External links ──────────────────────────────────────────────
    let (device, lines) = SerialDevice::open(&cfg.device, cancel.clone())?;
    let device = Arc::new(device);

    let inbox = Arc::new(ImapInbox::connect(&cfg.email).await?);
    let mailer = Arc::new(SmtpMailer::new(&cfg.email)?);
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(ThingSpeak::new(&cfg.telemetry)?);

    // ── Shared state ────────────────────────────────────────────────
    let shared = state::shared();
    let notifier = Notifier::new(mailer, cfg.email.recipient());
    let (report_tx, report_rx) = mpsc::channel(REPORT_QUEUE);

    // ── Tasks ───────────────────────────────────────────────────────
    let dispatcher_task = tokio::spawn(dispatcher::run(
        Dispatcher::new(Arc::clone(&shared), notifier.clone()),
        lines,
        cancel.clone(),
    ));

    let uploader_task = tokio::spawn(uploader::run(
        Arc::clone(&shared),
        Arc::clone(&telemetry),
        cfg.telemetry.upload_interval(),
        cancel.clone(),
    ));

    let poller_task = tokio::spawn(poller::run(
        CommandPoller::new(inbox, device, report_tx),
        cfg.email.poll_interval(),
        cancel.clone(),
    ));

    let report_task = tokio::spawn(report::run(
        ReportGenerator::new(telemetry, Arc::new(SvgChartRenderer), offset),
        notifier,
        ReportSchedule {
            at: report_at,
            offset,
            window: cfg.report.window,
        },
        report_rx,
        cancel.clone(),
    ));

    info!(
        port = %cfg.device.port,
        channel = %cfg.telemetry.channel_id,
        inbox = %cfg.email.address,
        "bridge running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    cancel.cancel();

    for (name, task) in [
        ("dispatcher", dispatcher_task),
        ("uploader", uploader_task),
        ("poller", poller_task),
        ("report", report_task),
    ] {
        if let Err(e) = task.await {
            error!(task = name, "task ended abnormally: {e}");
        }
    }

    info!("bridge stopped");
    Ok(())
}
