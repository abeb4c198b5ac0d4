//! Notification channel implementations.

mod chat;
mod email;
mod irc;
mod webhook;

pub use chat::ChatNotifier;
pub use email::EmailNotifier;
pub use irc::IrcNotifier;
pub use webhook::WebhookNotifier;

use keel_core::NotifyError;
use std::time::Duration;

/// Upper bound for a single delivery attempt.
pub(crate) const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Turn a non-success HTTP response into a [`NotifyError::Rejected`].
pub(crate) async fn check_response(response: reqwest::Response) -> Result<(), NotifyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(NotifyError::Rejected {
        status: status.as_u16(),
        body,
    })
}

pub(crate) fn transport(e: reqwest::Error) -> NotifyError {
    NotifyError::Transport(e.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::Router;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use keel_core::{BuildStatus, NotificationPayload};
    use tokio::sync::mpsc;

    pub struct Captured {
        pub headers: HeaderMap,
        pub body: Vec<u8>,
    }

    /// Serve `POST /hook`, answering `status` and forwarding each request.
    pub async fn capture_server(status: StatusCode) -> (String, mpsc::UnboundedReceiver<Captured>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new().route(
            "/hook",
            post(move |headers: HeaderMap, body: Bytes| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(Captured {
                        headers,
                        body: body.to_vec(),
                    });
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/hook", addr), rx)
    }

    pub fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    pub fn payload() -> NotificationPayload {
        NotificationPayload {
            project: "sample".to_string(),
            build_id: "0190b5e0-0000-7000-8000-000000000000".to_string(),
            sha: "c2c2c2c2c2c2".to_string(),
            short_sha: "c2c2c2c".to_string(),
            branch: "main".to_string(),
            author: "Ada".to_string(),
            message: "Second commit".to_string(),
            status: BuildStatus::Failed,
            duration_secs: Some(12),
            output_excerpt: "test result: FAILED\n".to_string(),
            build_url: "http://ci.example.org/sample/builds/0190b5e0-0000-7000-8000-000000000000"
                .to_string(),
        }
    }
}
