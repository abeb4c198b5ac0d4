//! Generic webhook channel: posts the full payload as JSON.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use keel_core::notifier::require_setting;
use keel_core::{NotificationPayload, Notifier, NotifierKind, NotifierSettings, NotifyError};
use sha2::Sha256;
use tracing::debug;

use super::{DELIVERY_TIMEOUT, check_response, transport};

/// Header carrying `sha256=<hex hmac of the body>` when a secret is set.
pub const SIGNATURE_HEADER: &str = "X-Keel-Signature";

/// Posts the [`NotificationPayload`] to `url`.
///
/// Settings: `url` (required), `secret` (optional, signs the body).
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the signature header value for `body`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, NotifyError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| NotifyError::Transport(format!("invalid secret: {}", e)))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn kind(&self) -> NotifierKind {
        NotifierKind::Webhook
    }

    async fn send(
        &self,
        settings: &NotifierSettings,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        let url = require_setting(settings, "url")?;
        let body = serde_json::to_vec(payload)
            .map_err(|e| NotifyError::Transport(format!("encoding payload: {}", e)))?;

        let mut request = self
            .client
            .post(url)
            .timeout(DELIVERY_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = settings.get("secret").filter(|s| !s.is_empty()) {
            request = request.header(SIGNATURE_HEADER, sign(secret, &body)?);
        }

        debug!(project = %payload.project, build_id = %payload.build_id, "Posting build webhook");
        let response = request.body(body).send().await.map_err(transport)?;
        check_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::test_support::{capture_server, client, payload};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_posts_signed_payload() {
        let (url, mut requests) = capture_server(StatusCode::NO_CONTENT).await;
        let mut settings = NotifierSettings::new();
        settings.insert("url".to_string(), url);
        settings.insert("secret".to_string(), "hook-secret".to_string());

        WebhookNotifier::with_client(client())
            .send(&settings, &payload())
            .await
            .unwrap();

        let request = requests.recv().await.unwrap();
        let received: NotificationPayload = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(received, payload());

        let signature = request.headers[SIGNATURE_HEADER].to_str().unwrap();
        assert_eq!(signature, sign("hook-secret", &request.body).unwrap());
    }

    #[tokio::test]
    async fn test_unsigned_without_secret() {
        let (url, mut requests) = capture_server(StatusCode::OK).await;
        let mut settings = NotifierSettings::new();
        settings.insert("url".to_string(), url);

        WebhookNotifier::with_client(client())
            .send(&settings, &payload())
            .await
            .unwrap();
        let request = requests.recv().await.unwrap();
        assert!(!request.headers.contains_key(SIGNATURE_HEADER));
    }

    #[test]
    fn test_signature_format() {
        let signature = sign("secret", b"{}").unwrap();
        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), "sha256=".len() + 64);
    }
}
