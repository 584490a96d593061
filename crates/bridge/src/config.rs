//! TOML config file loading and validation for the device, telemetry, email
//! and report settings.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use time::macros::format_description;
use time::{Time, UtcOffset};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub telemetry: TelemetryConfig,
    pub email: EmailConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub channel_id: String,
    #[serde(default)]
    pub write_key: String,
    #[serde(default)]
    pub read_key: String,
    #[serde(default = "default_upload_interval_sec")]
    pub upload_interval_sec: u64,
    #[serde(default = "default_feed_results")]
    pub feed_results: u32,
    #[serde(default = "default_http_timeout_sec")]
    pub request_timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub address: String,
    #[serde(default)]
    pub password: String,
    /// Where alerts and reports go. Defaults to `address`.
    pub recipient: Option<String>,
    #[serde(default = "default_imap_host")]
    pub imap_host: String,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_poll_interval_sec")]
    pub poll_interval_sec: u64,
    #[serde(default = "default_mail_timeout_sec")]
    pub request_timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Daily send time, "HH:MM" in `utc_offset_hours`.
    #[serde(default = "default_report_at")]
    pub at: String,
    #[serde(default)]
    pub utc_offset_hours: i8,
    #[serde(default)]
    pub window: ReportWindow,
}

/// Which calendar day a report covers, relative to the day it is produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportWindow {
    #[default]
    Today,
    Yesterday,
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_base_url() -> String {
    "https://api.thingspeak.com".to_string()
}
fn default_upload_interval_sec() -> u64 {
    15
}
fn default_feed_results() -> u32 {
    8000
}
fn default_http_timeout_sec() -> u64 {
    10
}
fn default_imap_host() -> String {
    "imap.gmail.com".to_string()
}
fn default_smtp_host() -> String {
    "smtp.gmail.com".to_string()
}
fn default_poll_interval_sec() -> u64 {
    5
}
fn default_mail_timeout_sec() -> u64 {
    30
}
fn default_report_at() -> String {
    "23:59".to_string()
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            at: default_report_at(),
            utc_offset_hours: 0,
            window: ReportWindow::Today,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl TelemetryConfig {
    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_sec)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }
}

impl EmailConfig {
    pub fn recipient(&self) -> &str {
        self.recipient.as_deref().unwrap_or(&self.address)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }
}

impl ReportConfig {
    pub fn time_of_day(&self) -> Result<Time> {
        Time::parse(self.at.trim(), format_description!("[hour]:[minute]"))
            .with_context(|| format!("report time '{}' is not HH:MM", self.at))
    }

    pub fn offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_hms(self.utc_offset_hours, 0, 0)
            .with_context(|| format!("utc_offset_hours {} out of range", self.utc_offset_hours))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_telemetry(&mut errors);
        self.validate_email(&mut errors);
        self.validate_report(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        if self.device.port.trim().is_empty() {
            errors.push("device: port is empty".into());
        }
        if self.device.baud_rate == 0 {
            errors.push("device: baud_rate must be positive".into());
        }
    }

    fn validate_telemetry(&self, errors: &mut Vec<String>) {
        let t = &self.telemetry;
        if !t.base_url.starts_with("http://") && !t.base_url.starts_with("https://") {
            errors.push(format!("telemetry: base_url '{}' is not an http(s) URL", t.base_url));
        }
        if t.channel_id.trim().is_empty() {
            errors.push("telemetry: channel_id is empty".into());
        }
        if t.write_key.trim().is_empty() {
            errors.push("telemetry: write_key is empty".into());
        }
        if t.read_key.trim().is_empty() {
            errors.push("telemetry: read_key is empty".into());
        }
        if t.upload_interval_sec == 0 {
            errors.push("telemetry: upload_interval_sec must be positive".into());
        }
        if t.feed_results == 0 {
            errors.push("telemetry: feed_results must be positive".into());
        }
        if t.request_timeout_sec == 0 {
            errors.push("telemetry: request_timeout_sec must be positive".into());
        }
    }

    fn validate_email(&self, errors: &mut Vec<String>) {
        let e = &self.email;
        if !e.address.contains('@') {
            errors.push(format!("email: address '{}' is not an email address", e.address));
        }
        if let Some(r) = &e.recipient {
            if !r.contains('@') {
                errors.push(format!("email: recipient '{r}' is not an email address"));
            }
        }
        if e.password.is_empty() {
            errors.push("email: password is empty".into());
        }
        if e.imap_host.trim().is_empty() {
            errors.push("email: imap_host is empty".into());
        }
        if e.smtp_host.trim().is_empty() {
            errors.push("email: smtp_host is empty".into());
        }
        if e.poll_interval_sec == 0 {
            errors.push("email: poll_interval_sec must be positive".into());
        }
        if e.request_timeout_sec == 0 {
            errors.push("email: request_timeout_sec must be positive".into());
        }
    }

    fn validate_report(&self, errors: &mut Vec<String>) {
        if let Err(e) = self.report.time_of_day() {
            errors.push(format!("report: {e}"));
        }
        if !(-23..=23).contains(&self.report.utc_offset_hours) {
            errors.push(format!(
                "report: utc_offset_hours {} out of range [-23, 23]",
                self.report.utc_offset_hours
            ));
        }
    }

    /// Secrets may come from the environment instead of the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("BRIDGE_EMAIL_PASSWORD") {
            self.email.password = v;
        }
        if let Ok(v) = env::var("BRIDGE_THINGSPEAK_WRITE_KEY") {
            self.telemetry.write_key = v;
        }
        if let Ok(v) = env::var("BRIDGE_THINGSPEAK_READ_KEY") {
            self.telemetry.read_key = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env_overrides();
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        port = %config.device.port,
        channel = %config.telemetry.channel_id,
        upload_sec = config.telemetry.upload_interval_sec,
        poll_sec = config.email.poll_interval_sec,
        report_at = %config.report.at,
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[device]
port = "/dev/ttyACM0"

[telemetry]
channel_id = "2312725"
write_key = "WKEY"
read_key = "RKEY"

[email]
address = "home@example.com"
password = "secret"
"#;

    fn valid_config() -> Config {
        toml::from_str(MINIMAL).unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_config_applies_defaults() {
        let cfg = valid_config();
        assert_eq!(cfg.device.baud_rate, 9600);
        assert_eq!(cfg.telemetry.base_url, "https://api.thingspeak.com");
        assert_eq!(cfg.telemetry.upload_interval_sec, 15);
        assert_eq!(cfg.email.poll_interval_sec, 5);
        assert_eq!(cfg.email.imap_host, "imap.gmail.com");
        assert_eq!(cfg.report.at, "23:59");
        assert_eq!(cfg.report.window, ReportWindow::Today);
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[device]
port = "COM4"
baud_rate = 115200

[telemetry]
base_url = "http://localhost:3000"
channel_id = "42"
write_key = "w"
read_key = "r"
upload_interval_sec = 30
feed_results = 500

[email]
address = "home@example.com"
password = "pw"
recipient = "owner@example.com"
poll_interval_sec = 10

[report]
at = "00:05"
utc_offset_hours = 2
window = "yesterday"
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.device.baud_rate, 115200);
        assert_eq!(cfg.email.recipient(), "owner@example.com");
        assert_eq!(cfg.report.window, ReportWindow::Yesterday);
        assert_eq!(cfg.report.time_of_day().unwrap(), Time::from_hms(0, 5, 0).unwrap());
        assert_eq!(cfg.report.offset().unwrap(), time::macros::offset!(+2));
    }

    #[test]
    fn recipient_defaults_to_address() {
        assert_eq!(valid_config().email.recipient(), "home@example.com");
    }

    #[test]
    fn missing_section_fails_to_parse() {
        assert!(toml::from_str::<Config>("[device]\nport = \"x\"\n").is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn empty_port_rejected() {
        let mut cfg = valid_config();
        cfg.device.port = " ".into();
        assert_validation_err(&cfg, "port is empty");
    }

    #[test]
    fn zero_baud_rejected() {
        let mut cfg = valid_config();
        cfg.device.baud_rate = 0;
        assert_validation_err(&cfg, "baud_rate must be positive");
    }

    #[test]
    fn non_http_base_url_rejected() {
        let mut cfg = valid_config();
        cfg.telemetry.base_url = "ftp://example.com".into();
        assert_validation_err(&cfg, "not an http(s) URL");
    }

    #[test]
    fn missing_write_key_rejected() {
        let mut cfg = valid_config();
        cfg.telemetry.write_key = String::new();
        assert_validation_err(&cfg, "write_key is empty");
    }

    #[test]
    fn zero_upload_interval_rejected() {
        let mut cfg = valid_config();
        cfg.telemetry.upload_interval_sec = 0;
        assert_validation_err(&cfg, "upload_interval_sec must be positive");
    }

    #[test]
    fn bad_address_rejected() {
        let mut cfg = valid_config();
        cfg.email.address = "not-an-address".into();
        assert_validation_err(&cfg, "is not an email address");
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let mut cfg = valid_config();
        cfg.email.poll_interval_sec = 0;
        assert_validation_err(&cfg, "poll_interval_sec must be positive");
    }

    #[test]
    fn malformed_report_time_rejected() {
        let mut cfg = valid_config();
        cfg.report.at = "25:99".into();
        assert_validation_err(&cfg, "is not HH:MM");
    }

    #[test]
    fn offset_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.report.utc_offset_hours = 24;
        assert_validation_err(&cfg, "utc_offset_hours 24 out of range");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.device.port = String::new();
        cfg.telemetry.channel_id = String::new();
        cfg.email.password = String::new();
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "unexpected message: {msg}");
        assert!(msg.contains("port is empty"));
        assert!(msg.contains("channel_id is empty"));
        assert!(msg.contains("password is empty"));
    }
}
