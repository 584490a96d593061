//! Daily report: statistics over one day of channel history, rendered as an
//! HTML mail with three charts attached.
//!
//! Reports are produced by a worker task that owns the daily timer and also
//! serves on-demand requests from the command poller, so a slow feed download
//! never holds up inbox polling.

use std::sync::Arc;

use thiserror::Error;
use time::{Date, OffsetDateTime, Time, UtcOffset};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chart::ChartRenderer;
use crate::config::ReportWindow;
use crate::mail::MailAttachment;
use crate::notify::Notifier;
use crate::schedule;
use crate::telemetry::{FeedEntry, TelemetrySink};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no telemetry entries for {date}")]
    EmptyDataset { date: Date },
    #[error("failed to read telemetry feed: {0:#}")]
    Feed(anyhow::Error),
    #[error("failed to render chart: {0:#}")]
    Chart(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub min: i64,
    pub max: i64,
    pub avg: f64,
}

impl Stats {
    fn over(values: &[i64]) -> Option<Self> {
        let min = *values.iter().min()?;
        let max = *values.iter().max()?;
        let avg = values.iter().sum::<i64>() as f64 / values.len() as f64;
        Some(Self { min, max, avg })
    }
}

pub type Series = Vec<(OffsetDateTime, i64)>;

#[derive(Debug, Clone, PartialEq)]
pub struct ReportSummary {
    pub date: Date,
    pub temperature: Stats,
    pub illumination: Stats,
    pub total_detections: i64,
    pub secure_mode_minutes: f64,
    pub auto_light_minutes: f64,
    pub temperature_series: Series,
    pub illumination_series: Series,
    pub detection_series: Series,
}

/// A composed report, ready for the notifier.
pub struct ReportMail {
    pub subject: String,
    pub html: String,
    pub attachments: Vec<MailAttachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportTrigger {
    EmailCommand,
    Daily,
}

// ---------------------------------------------------------------------------
// Summary math
// ---------------------------------------------------------------------------

/// Summarise the entries created on `date` (calendar day in `offset`).
pub fn summarize(
    entries: &[FeedEntry],
    date: Date,
    offset: UtcOffset,
) -> Result<ReportSummary, ReportError> {
    let day: Vec<(OffsetDateTime, &FeedEntry)> = entries
        .iter()
        .map(|e| (e.created_at.to_offset(offset), e))
        .filter(|(local, _)| local.date() == date)
        .collect();

    let temperature_series = series(&day, |e| e.temperature);
    let illumination_series = series(&day, |e| e.illumination);
    let detection_series = series(&day, |e| e.detections);

    let empty = || ReportError::EmptyDataset { date };
    let temperature = Stats::over(&values(&temperature_series)).ok_or_else(empty)?;
    let illumination = Stats::over(&values(&illumination_series)).ok_or_else(empty)?;

    Ok(ReportSummary {
        date,
        temperature,
        illumination,
        total_detections: total(&day, |e| e.detections),
        secure_mode_minutes: total(&day, |e| e.secure_mode_secs) as f64 / 60.0,
        auto_light_minutes: total(&day, |e| e.auto_light_secs) as f64 / 60.0,
        temperature_series,
        illumination_series,
        detection_series,
    })
}

type DayEntries<'a> = [(OffsetDateTime, &'a FeedEntry)];

fn series(day: &DayEntries<'_>, field: impl Fn(&FeedEntry) -> Option<i64>) -> Series {
    day.iter()
        .filter_map(|(ts, e)| field(e).map(|v| (*ts, v)))
        .collect()
}

fn values(series: &Series) -> Vec<i64> {
    series.iter().map(|(_, v)| *v).collect()
}

fn total(day: &DayEntries<'_>, field: impl Fn(&FeedEntry) -> Option<i64>) -> i64 {
    day.iter().filter_map(|(_, e)| field(e)).sum()
}

pub fn render_html(s: &ReportSummary) -> String {
    format!(
        r#"<html>
  <body>
    <h1>Report for {date}</h1>
    <h2>Temperature</h2>
    <p>Minimum: {t_min} &deg;C</p>
    <p>Maximum: {t_max} &deg;C</p>
    <p>Average: {t_avg:.1} &deg;C</p>
    <h2>Illumination</h2>
    <p>Minimum: {i_min} lux</p>
    <p>Maximum: {i_max} lux</p>
    <p>Average: {i_avg:.1} lux</p>
    <h2>Detections</h2>
    <p>Total: {detections}</p>
    <h2>Home Secure Mode Duration</h2>
    <p>Total: {secure:.1} minutes</p>
    <h2>Light Auto Mode Duration</h2>
    <p>Total: {auto_light:.1} minutes</p>
  </body>
</html>
"#,
        date = s.date,
        t_min = s.temperature.min,
        t_max = s.temperature.max,
        t_avg = s.temperature.avg,
        i_min = s.illumination.min,
        i_max = s.illumination.max,
        i_avg = s.illumination.avg,
        detections = s.total_detections,
        secure = s.secure_mode_minutes,
        auto_light = s.auto_light_minutes,
    )
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

pub struct ReportGenerator {
    telemetry: Arc<dyn TelemetrySink>,
    charts: Arc<dyn ChartRenderer>,
    offset: UtcOffset,
}

impl ReportGenerator {
    pub fn new(
        telemetry: Arc<dyn TelemetrySink>,
        charts: Arc<dyn ChartRenderer>,
        offset: UtcOffset,
    ) -> Self {
        Self {
            telemetry,
            charts,
            offset,
        }
    }

    pub async fn generate_report(&self, date: Date) -> Result<ReportMail, ReportError> {
        let entries = self.telemetry.feed().await.map_err(ReportError::Feed)?;
        let summary = summarize(&entries, date, self.offset)?;

        let title = summary.date.to_string();
        let mut attachments = Vec::with_capacity(3);
        for (label, series) in [
            ("Temperature", &summary.temperature_series),
            ("Illumination", &summary.illumination_series),
            ("Detections", &summary.detection_series),
        ] {
            let chart = self
                .charts
                .render(&title, label, series)
                .map_err(ReportError::Chart)?;
            attachments.push(MailAttachment {
                filename: chart.filename,
                content_type: chart.content_type,
                data: chart.data,
            });
        }

        info!(
            %date,
            samples = summary.temperature_series.len(),
            detections = summary.total_detections,
            "report generated"
        );

        Ok(ReportMail {
            subject: format!("Report for {date}"),
            html: render_html(&summary),
            attachments,
        })
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct ReportSchedule {
    pub at: Time,
    pub offset: UtcOffset,
    pub window: ReportWindow,
}

/// Produce and mail the report for the window's date. An email-requested
/// report that cannot be produced is answered with an "unavailable" mail.
pub async fn produce(
    generator: &ReportGenerator,
    notifier: &Notifier,
    trigger: ReportTrigger,
    date: Date,
) -> Result<(), ReportError> {
    match generator.generate_report(date).await {
        Ok(mail) => {
            notifier.send_report(mail).await;
            Ok(())
        }
        Err(e) => {
            warn!(?trigger, %date, "report failed: {e}");
            if trigger == ReportTrigger::EmailCommand {
                notifier.send_report_unavailable(date, &e.to_string()).await;
            }
            Err(e)
        }
    }
}

/// Run the report worker until cancelled. Intended to be `tokio::spawn`-ed from main.
pub async fn run(
    generator: ReportGenerator,
    notifier: Notifier,
    schedule: ReportSchedule,
    mut requests: mpsc::Receiver<ReportTrigger>,
    cancel: CancellationToken,
) {
    info!(at = %schedule.at, window = ?schedule.window, "report worker started");

    loop {
        let now = schedule::now_in(schedule.offset);
        let next = schedule::next_run(now, schedule.at);
        let delay = schedule::delay_until(now, next);

        let trigger = tokio::select! {
            _ = tokio::time::sleep(delay) => ReportTrigger::Daily,
            req = requests.recv() => match req {
                Some(t) => t,
                None => {
                    info!("report request channel closed");
                    break;
                }
            },
            _ = cancel.cancelled() => {
                info!("report worker shutting down");
                break;
            }
        };

        let today = schedule::now_in(schedule.offset).date();
        let date = schedule.window.resolve(today);
        if let Err(e) = produce(&generator, &notifier, trigger, date).await {
            debug!(?trigger, %date, "report cycle ended without a report: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::Chart;
    use crate::mail::MailBody;
    use crate::notify::tests::RecordingMailer;
    use crate::state::UploadBatch;
    use anyhow::Result;
    use async_trait::async_trait;
    use time::macros::{date, datetime, offset};

    fn entry(ts: OffsetDateTime, t: i64, i: i64, d: i64, sec: i64, auto: i64) -> FeedEntry {
        FeedEntry {
            created_at: ts,
            temperature: Some(t),
            illumination: Some(i),
            detections: Some(d),
            secure_mode_secs: Some(sec),
            auto_light_secs: Some(auto),
        }
    }

    fn sample_feed() -> Vec<FeedEntry> {
        vec![
            entry(datetime!(2026-10-17 23:59 UTC), 40, 900, 9, 600, 600),
            entry(datetime!(2026-10-18 08:00 UTC), 20, 100, 1, 60, 0),
            entry(datetime!(2026-10-18 12:00 UTC), 24, 500, 2, 60, 30),
            entry(datetime!(2026-10-18 18:00 UTC), 22, 300, 0, 0, 90),
            entry(datetime!(2026-10-19 00:01 UTC), -5, 0, 7, 600, 600),
        ]
    }

    struct FixedFeed(Vec<FeedEntry>);

    #[async_trait]
    impl TelemetrySink for FixedFeed {
        async fn submit(&self, _batch: &UploadBatch) -> Result<()> {
            Ok(())
        }

        async fn feed(&self) -> Result<Vec<FeedEntry>> {
            Ok(self.0.clone())
        }
    }

    struct StubCharts;

    impl ChartRenderer for StubCharts {
        fn render(&self, _title: &str, y_label: &str, series: &[(OffsetDateTime, i64)]) -> Result<Chart> {
            Ok(Chart {
                filename: format!("{}.svg", y_label.to_lowercase()),
                content_type: "image/svg+xml",
                data: format!("<svg>{}</svg>", series.len()).into_bytes(),
            })
        }
    }

    fn generator(feed: Vec<FeedEntry>) -> ReportGenerator {
        ReportGenerator::new(Arc::new(FixedFeed(feed)), Arc::new(StubCharts), UtcOffset::UTC)
    }

    fn worker_schedule() -> ReportSchedule {
        // An hour behind the clock, so the daily run is a day away.
        let at = schedule::now_in(UtcOffset::UTC).time() - time::Duration::hours(1);
        ReportSchedule {
            at,
            offset: UtcOffset::UTC,
            window: ReportWindow::Today,
        }
    }

    fn todays_feed() -> Vec<FeedEntry> {
        let now = OffsetDateTime::now_utc();
        vec![entry(now, 21, 300, 1, 60, 0), entry(now, 23, 500, 2, 0, 60)]
    }

    async fn wait_for_mail(mailer: &RecordingMailer) {
        for _ in 0..200 {
            if !mailer.sent.lock().unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("no mail sent");
    }

    // -- summarize ----------------------------------------------------------

    #[test]
    fn summarize_filters_to_date() {
        let s = summarize(&sample_feed(), date!(2026 - 10 - 18), UtcOffset::UTC).unwrap();
        assert_eq!(s.temperature_series.len(), 3);
        assert_eq!(s.temperature, Stats { min: 20, max: 24, avg: 22.0 });
        assert_eq!(s.illumination.min, 100);
        assert_eq!(s.illumination.max, 500);
        assert!((s.illumination.avg - 300.0).abs() < 1e-9);
    }

    #[test]
    fn summarize_totals_counters_and_minutes() {
        let s = summarize(&sample_feed(), date!(2026 - 10 - 18), UtcOffset::UTC).unwrap();
        assert_eq!(s.total_detections, 3);
        assert!((s.secure_mode_minutes - 2.0).abs() < 1e-9);
        assert!((s.auto_light_minutes - 2.0).abs() < 1e-9);
    }

    #[test]
    fn summarize_uses_local_calendar_day() {
        // At +2 the 23:59 UTC entry of the 17th falls on the 18th, the
        // 00:01 UTC entry of the 19th does not.
        let s = summarize(&sample_feed(), date!(2026 - 10 - 18), offset!(+2)).unwrap();
        assert_eq!(s.temperature.max, 40);
        assert_eq!(s.temperature.min, 20);
        assert_eq!(s.temperature_series.len(), 4);
    }

    #[test]
    fn summarize_skips_null_samples() {
        let mut feed = sample_feed();
        feed[2].temperature = None;
        let s = summarize(&feed, date!(2026 - 10 - 18), UtcOffset::UTC).unwrap();
        assert_eq!(s.temperature_series.len(), 2);
        assert_eq!(s.temperature.max, 22);
    }

    #[test]
    fn summarize_empty_day_is_explicit_error() {
        let err = summarize(&sample_feed(), date!(2026 - 10 - 20), UtcOffset::UTC).unwrap_err();
        assert!(matches!(err, ReportError::EmptyDataset { date } if date == date!(2026 - 10 - 20)));
    }

    #[test]
    fn summarize_no_entries_at_all_is_explicit_error() {
        assert!(matches!(
            summarize(&[], date!(2026 - 10 - 18), UtcOffset::UTC),
            Err(ReportError::EmptyDataset { .. })
        ));
    }

    // -- render_html ----------------------------------------------------------

    #[test]
    fn html_contains_statistics() {
        let s = summarize(&sample_feed(), date!(2026 - 10 - 18), UtcOffset::UTC).unwrap();
        let html = render_html(&s);
        assert!(html.contains("Report for 2026-10-18"));
        assert!(html.contains("Minimum: 20 &deg;C"));
        assert!(html.contains("Average: 22.0 &deg;C"));
        assert!(html.contains("Maximum: 500 lux"));
        assert!(html.contains("Total: 3"));
        assert!(html.contains("Total: 2.0 minutes"));
    }

    // -- generate_report / produce ---------------------------------------------

    #[tokio::test]
    async fn generate_report_attaches_three_charts() {
        let mail = generator(sample_feed())
            .generate_report(date!(2026 - 10 - 18))
            .await
            .unwrap();
        assert_eq!(mail.subject, "Report for 2026-10-18");
        let names: Vec<_> = mail.attachments.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, ["temperature.svg", "illumination.svg", "detections.svg"]);
    }

    #[tokio::test]
    async fn generate_report_empty_day_fails() {
        let result = generator(Vec::new())
            .generate_report(date!(2026 - 10 - 18))
            .await;
        assert!(matches!(result, Err(ReportError::EmptyDataset { .. })));
    }

    #[tokio::test]
    async fn produce_mails_the_report() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(mailer.clone(), "owner@example.com");

        produce(&generator(sample_feed()), &notifier, ReportTrigger::Daily, date!(2026 - 10 - 18))
            .await
            .unwrap();

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.attachments.len(), 3);
        assert!(matches!(sent[0].1.body, MailBody::Html(_)));
    }

    #[tokio::test]
    async fn requested_report_failure_is_answered() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(mailer.clone(), "owner@example.com");

        let result = produce(
            &generator(Vec::new()),
            &notifier,
            ReportTrigger::EmailCommand,
            date!(2026 - 10 - 18),
        )
        .await;

        assert!(matches!(result, Err(ReportError::EmptyDataset { .. })));
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.subject, "Report unavailable for 2026-10-18");
    }

    // -- run ----------------------------------------------------------------

    #[tokio::test]
    async fn run_mails_report_on_email_request() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(mailer.clone(), "owner@example.com");
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            generator(todays_feed()),
            notifier,
            worker_schedule(),
            rx,
            cancel.clone(),
        ));

        tx.send(ReportTrigger::EmailCommand).await.unwrap();
        wait_for_mail(&mailer).await;

        {
            let sent = mailer.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert!(sent[0].1.subject.starts_with("Report for "));
            assert_eq!(sent[0].1.attachments.len(), 3);
        }

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("report worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn run_answers_failed_email_request() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(mailer.clone(), "owner@example.com");
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(run(
            generator(Vec::new()),
            notifier,
            worker_schedule(),
            rx,
            CancellationToken::new(),
        ));

        tx.send(ReportTrigger::EmailCommand).await.unwrap();
        wait_for_mail(&mailer).await;
        assert!(mailer.sent.lock().unwrap()[0]
            .1
            .subject
            .starts_with("Report unavailable for "));

        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("report worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn run_stops_when_requests_close() {
        let mailer = Arc::new(RecordingMailer::default());
        let (tx, rx) = mpsc::channel::<ReportTrigger>(4);
        let task = tokio::spawn(run(
            generator(todays_feed()),
            Notifier::new(mailer.clone(), "owner@example.com"),
            worker_schedule(),
            rx,
            CancellationToken::new(),
        ));

        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("report worker did not stop")
            .unwrap();
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let mailer = Arc::new(RecordingMailer::default());
        let (_tx, rx) = mpsc::channel::<ReportTrigger>(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            generator(todays_feed()),
            Notifier::new(mailer.clone(), "owner@example.com"),
            worker_schedule(),
            rx,
            cancel.clone(),
        ));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("report worker did not stop")
            .unwrap();
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduled_report_failure_sends_nothing() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(mailer.clone(), "owner@example.com");

        let result = produce(
            &generator(Vec::new()),
            &notifier,
            ReportTrigger::Daily,
            date!(2026 - 10 - 18),
        )
        .await;

        assert!(result.is_err());
        assert!(mailer.sent.lock().unwrap().is_empty());
    }
}
