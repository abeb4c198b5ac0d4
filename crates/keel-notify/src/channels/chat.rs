//! Chat channel: posts the summary to an incoming-webhook URL.

use async_trait::async_trait;
use keel_core::notifier::require_setting;
use keel_core::{NotificationPayload, Notifier, NotifierKind, NotifierSettings, NotifyError};
use serde_json::json;
use tracing::debug;

use super::{DELIVERY_TIMEOUT, check_response, transport};

/// Sends `{"text": ...}` to a Slack-style incoming webhook.
///
/// Settings: `url` (required), `channel` (optional override).
pub struct ChatNotifier {
    client: reqwest::Client,
}

impl ChatNotifier {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ChatNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    fn kind(&self) -> NotifierKind {
        NotifierKind::Chat
    }

    async fn send(
        &self,
        settings: &NotifierSettings,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        let url = require_setting(settings, "url")?;

        let mut body = json!({ "text": payload.summary() });
        if let Some(channel) = settings.get("channel") {
            body["channel"] = json!(channel);
        }

        debug!(project = %payload.project, build_id = %payload.build_id, "Posting chat message");
        let response = self
            .client
            .post(url)
            .timeout(DELIVERY_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        check_response(response).await
    }
}
