//! Delivery of compile error reports.
//!
//! [`SmtpMailer`] is used when both `MailError` and `MailServer` are set;
//! otherwise reports go to the log through [`LogMailer`]. Mailers block and
//! are driven from `spawn_blocking` by the maintenance task.

use lettre::address::AddressError;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::{Message, SmtpTransport, Transport};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error_log::MailGroup;

const DEFAULT_SMTP_PORT: u16 = 25;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid mail address '{address}': {source}")]
    Address {
        address: String,
        #[source]
        source: AddressError,
    },

    #[error("failed to read attachment {path}: {source}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// One mail worth of errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailReport {
    pub subject: String,
    pub body: String,
    pub ccs: Vec<String>,
    pub attachments: Vec<PathBuf>,
}

impl MailReport {
    pub fn from_group(group: &MailGroup<'_>) -> Self {
        Self {
            subject: group.subject(),
            body: group.body(),
            ccs: group.ccs.to_vec(),
            attachments: group
                .attachments()
                .into_iter()
                .map(|p| p.to_path_buf())
                .collect(),
        }
    }
}

pub trait ErrorMailer: Send + Sync {
    fn send(&self, report: &MailReport) -> Result<(), MailError>;
}

/// Pick the mailer for `config`.
pub fn from_config(config: &ServerConfig) -> Box<dyn ErrorMailer> {
    match (&config.mail_error, &config.mail_server) {
        (Some(to), Some(server)) => Box::new(SmtpMailer::new(server, &config.mail_from, to)),
        _ => Box::new(LogMailer),
    }
}

fn mailbox(address: &str) -> Result<Mailbox, MailError> {
    address.trim().parse().map_err(|source| MailError::Address {
        address: address.to_string(),
        source,
    })
}

/// Plain SMTP relay delivery.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    host: String,
    port: u16,
    from: String,
    to: String,
}

impl SmtpMailer {
    /// `server` is `host` or `host:port`.
    pub fn new(server: &str, from: &str, to: &str) -> Self {
        let (host, port) = match server.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (server.to_string(), DEFAULT_SMTP_PORT),
            },
            None => (server.to_string(), DEFAULT_SMTP_PORT),
        };
        Self {
            host,
            port,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn build_message(&self, report: &MailReport) -> Result<Message, MailError> {
        let mut builder = Message::builder()
            .from(mailbox(&self.from)?)
            .to(mailbox(&self.to)?)
            .subject(report.subject.clone());
        for cc in &report.ccs {
            builder = builder.cc(mailbox(cc)?);
        }

        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(report.body.clone()));
        for path in &report.attachments {
            let content = fs::read(path).map_err(|source| MailError::Attachment {
                path: path.clone(),
                source,
            })?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "shader.fx".to_string());
            parts = parts.singlepart(Attachment::new(filename).body(content, ContentType::TEXT_PLAIN));
        }
        Ok(builder.multipart(parts)?)
    }
}

impl ErrorMailer for SmtpMailer {
    fn send(&self, report: &MailReport) -> Result<(), MailError> {
        let message = self.build_message(report)?;
        let transport = SmtpTransport::builder_dangerous(&self.host)
            .port(self.port)
            .build();
        transport.send(&message)?;
        info!(
            server = %self.host,
            to = %self.to,
            subject = %report.subject,
            "error report mailed"
        );
        Ok(())
    }
}

/// Writes reports to the log when no mail server is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

impl ErrorMailer for LogMailer {
    fn send(&self, report: &MailReport) -> Result<(), MailError> {
        warn!(
            subject = %report.subject,
            ccs = ?report.ccs,
            attachments = report.attachments.len(),
            "compile error report:\n{}",
            report.body
        );
        Ok(())
    }
}

/// Keeps every report in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingMailer {
    pub sent: std::sync::Mutex<Vec<MailReport>>,
}

#[cfg(test)]
impl ErrorMailer for RecordingMailer {
    fn send(&self, report: &MailReport) -> Result<(), MailError> {
        self.sent.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// Rejects every report, like an unreachable relay.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct FailingMailer;

#[cfg(test)]
impl ErrorMailer for FailingMailer {
    fn send(&self, report: &MailReport) -> Result<(), MailError> {
        Err(MailError::Attachment {
            path: report.attachments.first().cloned().unwrap_or_default(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        })
    }
}
