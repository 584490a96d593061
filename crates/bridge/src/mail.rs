//! Email transport: an IMAP inbox the command poller searches, and an SMTP
//! mailer for alerts and reports.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use native_tls::TlsStream;
use tracing::{debug, info, warn};

use crate::config::EmailConfig;

const IMAP_PORT: u16 = 993;

pub type MessageId = u32;

#[async_trait]
pub trait Inbox: Send + Sync {
    /// Called once at the start of every poll pass.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    /// Ids of unread messages whose subject contains `subject`.
    async fn search_unread(&self, subject: &str) -> Result<Vec<MessageId>>;

    async fn mark_read(&self, ids: &[MessageId]) -> Result<()>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, mail: OutgoingMail) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMail {
    pub subject: String,
    pub body: MailBody,
    pub attachments: Vec<MailAttachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MailBody {
    Text(String),
    Html(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MailAttachment {
    pub filename: String,
    pub content_type: &'static str,
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// IMAP inbox
// ---------------------------------------------------------------------------

type ImapSession = imap::Session<TlsStream<TcpStream>>;

#[derive(Clone)]
struct ImapLogin {
    host: String,
    port: u16,
    user: String,
    password: String,
    /// Bound on connect and on every socket read/write.
    io_timeout: Duration,
}

pub struct ImapInbox {
    login: ImapLogin,
    session: Arc<Mutex<Option<ImapSession>>>,
    timeout: Duration,
}

impl ImapInbox {
    /// Log in now; a bad login is a startup failure.
    pub async fn connect(cfg: &EmailConfig) -> Result<Self> {
        let login = ImapLogin {
            host: cfg.imap_host.clone(),
            port: IMAP_PORT,
            user: cfg.address.clone(),
            password: cfg.password.clone(),
            io_timeout: cfg.request_timeout(),
        };

        let l = login.clone();
        let session = tokio::time::timeout(
            cfg.request_timeout(),
            tokio::task::spawn_blocking(move || open_session(&l)),
        )
        .await
        .context("imap login timed out")?
        .context("imap login task failed")??;

        info!(host = %cfg.imap_host, user = %cfg.address, "imap session open");

        Ok(Self {
            login,
            session: Arc::new(Mutex::new(Some(session))),
            timeout: cfg.request_timeout(),
        })
    }

    /// Run `op` against the session on a blocking thread. A failed call drops
    /// the session; the next call logs in again. Socket timeouts bound every
    /// call, and a call still holding the session makes the next one fail
    /// instead of queueing behind it.
    async fn with_session<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let login = self.login.clone();

        let task = tokio::task::spawn_blocking(move || {
            let mut guard = lock_session(&*session)?;
            if guard.is_none() {
                debug!(host = %login.host, "imap: reconnecting");
                *guard = Some(open_session(&login)?);
            }
            let Some(s) = guard.as_mut() else {
                return Err(anyhow!("imap session unavailable"));
            };
            let result = op(s);
            if result.is_err() {
                *guard = None;
            }
            result
        });

        tokio::time::timeout(self.timeout, task)
            .await
            .context("imap call timed out")?
            .context("imap task failed")?
    }
}

impl Drop for ImapInbox {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.session.try_lock() {
            if let Some(mut s) = guard.take() {
                if let Err(e) = s.logout() {
                    warn!("imap logout failed: {e}");
                }
            }
        }
    }
}

fn lock_session<T>(session: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    match session.try_lock() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::WouldBlock) => Err(anyhow!("imap session busy with a previous call")),
        Err(TryLockError::Poisoned(_)) => Err(anyhow!("imap session lock poisoned")),
    }
}

fn connect_stream(login: &ImapLogin) -> Result<TcpStream> {
    let addrs = (login.host.as_str(), login.port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {}", login.host))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, login.io_timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(login.io_timeout))?;
                stream.set_write_timeout(Some(login.io_timeout))?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(anyhow!("imap connect to {}:{} failed: {e}", login.host, login.port)),
        None => Err(anyhow!("{} resolved to no addresses", login.host)),
    }
}

fn open_session(login: &ImapLogin) -> Result<ImapSession> {
    let stream = connect_stream(login)?;
    let tls = native_tls::TlsConnector::builder()
        .build()
        .context("failed to build tls connector")?;
    let stream = tls
        .connect(login.host.as_str(), stream)
        .map_err(|e| anyhow!("tls handshake with {} failed: {e}", login.host))?;

    let mut client = imap::Client::new(stream);
    client
        .read_greeting()
        .map_err(|e| anyhow!("imap greeting from {} failed: {e}", login.host))?;
    client
        .login(&login.user, &login.password)
        .map_err(|(e, _)| anyhow!("imap login for {} failed: {e}", login.user))
}

/// `SUBJECT "<s>" UNSEEN` with quotes and backslashes escaped.
pub(crate) fn unread_subject_query(subject: &str) -> String {
    let escaped = subject.replace('\\', "\\\\").replace('"', "\\\"");
    format!("SUBJECT \"{escaped}\" UNSEEN")
}

pub(crate) fn uid_set(ids: &[MessageId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl Inbox for ImapInbox {
    async fn refresh(&self) -> Result<()> {
        self.with_session(|s| {
            s.select("INBOX")
                .map_err(|e| anyhow!("imap select failed: {e}"))?;
            Ok(())
        })
        .await
    }

    async fn search_unread(&self, subject: &str) -> Result<Vec<MessageId>> {
        let query = unread_subject_query(subject);
        self.with_session(move |s| {
            let uids = s
                .uid_search(&query)
                .map_err(|e| anyhow!("imap search '{query}' failed: {e}"))?;
            let mut ids: Vec<MessageId> = uids.into_iter().collect();
            ids.sort_unstable();
            Ok(ids)
        })
        .await
    }

    async fn mark_read(&self, ids: &[MessageId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let set = uid_set(ids);
        self.with_session(move |s| {
            s.uid_store(&set, "+FLAGS (\\Seen)")
                .map_err(|e| anyhow!("imap store for {set} failed: {e}"))?;
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// SMTP mailer
// ---------------------------------------------------------------------------

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(cfg: &EmailConfig) -> Result<Self> {
        let from: Mailbox = cfg
            .address
            .parse()
            .with_context(|| format!("invalid sender address {}", cfg.address))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.smtp_host)
            .with_context(|| format!("invalid smtp relay {}", cfg.smtp_host))?
            .credentials(Credentials::new(cfg.address.clone(), cfg.password.clone()))
            .timeout(Some(cfg.request_timeout()))
            .build();

        Ok(Self { transport, from })
    }
}

pub(crate) fn build_message(from: Mailbox, to: &str, mail: OutgoingMail) -> Result<Message> {
    let to: Mailbox = to
        .parse()
        .with_context(|| format!("invalid recipient address {to}"))?;
    let builder = Message::builder().from(from).to(to).subject(mail.subject);

    let message = match (mail.body, mail.attachments.is_empty()) {
        (MailBody::Text(text), true) => builder
            .header(ContentType::TEXT_PLAIN)
            .body(text)
            .context("failed to build text mail")?,
        (body, _) => {
            let first = match body {
                MailBody::Text(text) => SinglePart::plain(text),
                MailBody::Html(html) => SinglePart::html(html),
            };
            let mut parts = MultiPart::mixed().singlepart(first);
            for a in mail.attachments {
                let content_type = ContentType::parse(a.content_type)
                    .map_err(|e| anyhow!("bad content type {}: {e}", a.content_type))?;
                parts = parts.singlepart(Attachment::new(a.filename).body(a.data, content_type));
            }
            builder
                .multipart(parts)
                .context("failed to build multipart mail")?
        }
    };
    Ok(message)
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, mail: OutgoingMail) -> Result<()> {
        let subject = mail.subject.clone();
        let message = build_message(self.from.clone(), to, mail)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| anyhow!("smtp send '{subject}' failed: {e}"))?;
        debug!(to, subject = %subject, "mail sent");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
