//! Email channel: hands a plain-text message to a sendmail-compatible binary.

use async_trait::async_trait;
use keel_core::notifier::require_setting;
use keel_core::{NotificationPayload, Notifier, NotifierKind, NotifierSettings, NotifyError};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::DELIVERY_TIMEOUT;

const DEFAULT_SENDMAIL: &str = "/usr/sbin/sendmail";
const DEFAULT_FROM: &str = "keel@localhost";

/// Settings: `to` (required), `from`, `sendmail` (command line of the
/// binary, extra arguments allowed).
#[derive(Default)]
pub struct EmailNotifier;

impl EmailNotifier {
    pub fn new() -> Self {
        Self
    }
}

/// Render the RFC 5322 message handed to sendmail.
pub(crate) fn render_message(from: &str, to: &str, payload: &NotificationPayload) -> String {
    let mut message = format!(
        "From: {}\r\nTo: {}\r\nSubject: [{}] {} {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n",
        header_value(from),
        header_value(to),
        header_value(&payload.project),
        payload.short_sha,
        payload.status
    );
    message.push_str(&format!("{}\r\n\r\n", payload.summary()));
    message.push_str(&format!("Commit:   {}\r\n", payload.sha));
    message.push_str(&format!("Branch:   {}\r\n", payload.branch));
    message.push_str(&format!("Author:   {}\r\n", payload.author));
    if let Some(secs) = payload.duration_secs {
        message.push_str(&format!("Duration: {}s\r\n", secs));
    }
    message.push_str(&format!("Build:    {}\r\n\r\n", payload.build_url));
    for line in payload.message.lines() {
        message.push_str(&format!("    {}\r\n", line));
    }
    if !payload.output_excerpt.is_empty() {
        message.push_str("\r\nOutput (tail):\r\n\r\n");
        for line in payload.output_excerpt.lines() {
            message.push_str(line);
            message.push_str("\r\n");
        }
    }
    message
}

fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn kind(&self) -> NotifierKind {
        NotifierKind::Email
    }

    async fn send(
        &self,
        settings: &NotifierSettings,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        let to = require_setting(settings, "to")?;
        let from = settings.get("from").map(String::as_str).unwrap_or(DEFAULT_FROM);
        let sendmail = settings
            .get("sendmail")
            .map(String::as_str)
            .unwrap_or(DEFAULT_SENDMAIL);
        let message = render_message(from, to, payload);

        debug!(project = %payload.project, build_id = %payload.build_id, to, "Sending email");
        let mut argv = sendmail.split_whitespace();
        let program = argv
            .next()
            .ok_or_else(|| NotifyError::MissingSetting("sendmail".to_string()))?;
        let mut child = Command::new(program)
            .args(argv)
            .args(["-t", "-i"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| NotifyError::Transport("sendmail stdin unavailable".to_string()))?;
        stdin.write_all(message.as_bytes()).await?;
        drop(stdin);

        let output = tokio::time::timeout(DELIVERY_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| NotifyError::Transport("sendmail timed out".to_string()))??;
        if !output.status.success() {
            return Err(NotifyError::Transport(format!(
                "{} exited with {}: {}",
                sendmail,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
