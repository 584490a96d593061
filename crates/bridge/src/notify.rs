//! Alert and report mail composition. Delivery failures are logged here and
//! never returned, so a broken mail server cannot stall a caller's loop.

use std::sync::Arc;

use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::{error, info};

use crate::mail::{MailBody, Mailer, OutgoingMail};
use crate::report::ReportMail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    Motion,
    Emergency,
}

impl Alert {
    pub fn subject(self) -> &'static str {
        match self {
            Alert::Motion => "Motion Detected",
            Alert::Emergency => "Emergency Mode Activated",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Alert::Motion => "Motion was detected while home security is on.",
            Alert::Emergency => "The controller switched to emergency mode.",
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    recipient: String,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, recipient: impl Into<String>) -> Self {
        Self {
            mailer,
            recipient: recipient.into(),
        }
    }

    pub async fn send_alert(&self, alert: Alert, raised_at: OffsetDateTime) {
        let when = raised_at
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second] [offset_hour sign:mandatory]:[offset_minute]"
            ))
            .unwrap_or_else(|_| raised_at.to_string());
        let mail = OutgoingMail {
            subject: alert.subject().to_string(),
            body: MailBody::Text(format!("{}\nRaised at {when}.", alert.describe())),
            attachments: Vec::new(),
        };
        self.deliver(mail).await;
    }

    pub async fn send_report(&self, report: ReportMail) {
        let mail = OutgoingMail {
            subject: report.subject,
            body: MailBody::Html(report.html),
            attachments: report.attachments,
        };
        self.deliver(mail).await;
    }

    /// Tell the requester a report could not be produced.
    pub async fn send_report_unavailable(&self, date: Date, reason: &str) {
        let mail = OutgoingMail {
            subject: format!("Report unavailable for {date}"),
            body: MailBody::Text(format!("No report could be produced for {date}: {reason}")),
            attachments: Vec::new(),
        };
        self.deliver(mail).await;
    }

    async fn deliver(&self, mail: OutgoingMail) {
        let subject = mail.subject.clone();
        match self.mailer.send(&self.recipient, mail).await {
            Ok(()) => info!(subject = %subject, to = %self.recipient, "notification sent"),
            Err(e) => error!(subject = %subject, "notification failed: {e:#}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use time::macros::{date, datetime};

    /// Mailer that records what it was asked to send, or fails every send.
    #[derive(Default)]
    pub(crate) struct RecordingMailer {
        pub(crate) fail: bool,
        pub(crate) sent: Mutex<Vec<(String, OutgoingMail)>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, to: &str, mail: OutgoingMail) -> Result<()> {
            if self.fail {
                bail!("smtp unavailable");
            }
            self.sent.lock().unwrap().push((to.to_string(), mail));
            Ok(())
        }
    }

    #[tokio::test]
    async fn motion_alert_subject_and_recipient() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(mailer.clone(), "owner@example.com");

        notifier
            .send_alert(Alert::Motion, datetime!(2026-10-18 12:00 UTC))
            .await;

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "owner@example.com");
        assert_eq!(sent[0].1.subject, "Motion Detected");
        assert!(sent[0].1.attachments.is_empty());
        match &sent[0].1.body {
            MailBody::Text(t) => assert!(t.contains("2026-10-18 12:00:00 +00:00"), "body: {t}"),
            other => panic!("expected text body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn emergency_alert_subject() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(mailer.clone(), "owner@example.com");

        notifier
            .send_alert(Alert::Emergency, datetime!(2026-10-18 12:00 UTC))
            .await;

        assert_eq!(
            mailer.sent.lock().unwrap()[0].1.subject,
            "Emergency Mode Activated"
        );
    }

    #[tokio::test]
    async fn failed_delivery_does_not_propagate() {
        let mailer = Arc::new(RecordingMailer {
            fail: true,
            ..Default::default()
        });
        let notifier = Notifier::new(mailer.clone(), "owner@example.com");

        // Must simply return.
        notifier
            .send_alert(Alert::Motion, datetime!(2026-10-18 12:00 UTC))
            .await;
        notifier
            .send_report_unavailable(date!(2026 - 10 - 18), "no telemetry")
            .await;

        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn report_unavailable_names_the_date() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(mailer.clone(), "owner@example.com");

        notifier
            .send_report_unavailable(date!(2026 - 10 - 18), "no telemetry entries")
            .await;

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent[0].1.subject, "Report unavailable for 2026-10-18");
        match &sent[0].1.body {
            MailBody::Text(t) => assert!(t.contains("no telemetry entries")),
            other => panic!("expected text body, got {other:?}"),
        }
    }
}
