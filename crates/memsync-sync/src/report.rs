//! Failure reporter: one rate-limited operator notification per fatal run.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use memsync_core::{format_timestamp, RunLog};
use memsync_storage::TimestampStore;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const NOTIFY_SUBJECT: &str = "Member Database Synchronization Error";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Hands a plain-text message to a local `sendmail`-compatible binary.
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    program: PathBuf,
    from: String,
    recipients: Vec<String>,
}

impl SendmailNotifier {
    pub fn new(program: impl Into<PathBuf>, from: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            program: program.into(),
            from: from.into(),
            recipients,
        }
    }
}

pub fn render_message(from: &str, recipients: &[String], subject: &str, body: &str) -> String {
    format!(
        "From: {from}\r\nTo: {}\r\nSubject: {subject}\r\nContent-Type: text/plain; charset=UTF-8\r\n\r\n{body}\r\n",
        recipients.join(", ")
    )
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn send(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        if self.recipients.is_empty() {
            bail!("no notification recipients configured");
        }
        let mut child = Command::new(&self.program)
            .arg("-i")
            .args(&self.recipients)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {}", self.program.display()))?;

        let message = render_message(&self.from, &self.recipients, subject, body);
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .await
                .context("writing message to sendmail")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("waiting for sendmail")?;
        if !output.status.success() {
            bail!(
                "sendmail exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NotifySettings {
    pub enabled: bool,
    pub cooldown: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NotifyOutcome {
    Sent { next_allowed_after: NaiveDateTime },
    Suppressed { until: NaiveDateTime },
    Disabled,
    Failed,
}

pub struct FailureReporter {
    gate: Arc<dyn TimestampStore>,
    notifier: Arc<dyn Notifier>,
    settings: NotifySettings,
}

impl FailureReporter {
    pub fn new(
        gate: Arc<dyn TimestampStore>,
        notifier: Arc<dyn Notifier>,
        settings: NotifySettings,
    ) -> Self {
        Self {
            gate,
            notifier,
            settings,
        }
    }

    /// Sends the whole run log unless the "do not notify until" gate is still closed.
    pub async fn report(&self, log: &mut RunLog, now: NaiveDateTime) -> NotifyOutcome {
        log.error("A FATAL ERROR OCCURRED");

        if !self.settings.enabled {
            return NotifyOutcome::Disabled;
        }

        let gate = match self.gate.load().await {
            Ok(gate) => gate,
            Err(err) => {
                log.warn(format!("ignoring unreadable notification gate: {err}"));
                None
            }
        };
        if let Some(until) = gate {
            if now <= until {
                log.info(format!(
                    "notification suppressed until {}",
                    format_timestamp(until)
                ));
                return NotifyOutcome::Suppressed { until };
            }
        }

        if let Err(err) = self.notifier.send(NOTIFY_SUBJECT, &log.joined()).await {
            log.error(format!("notification delivery failed: {err:#}"));
            return NotifyOutcome::Failed;
        }

        let next_allowed_after = now
            .checked_add_signed(self.settings.cooldown)
            .unwrap_or_else(|| {
                log.warn("notification cooldown overflows the calendar; gate closed indefinitely");
                NaiveDateTime::MAX
            });
        log.info("Sending out notification email");
        if let Err(err) = self.gate.store(next_allowed_after).await {
            log.error(format!("could not record notification gate: {err}"));
        }
        NotifyOutcome::Sent { next_allowed_after }
    }
}
