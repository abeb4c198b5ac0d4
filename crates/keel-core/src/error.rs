//! Error types for Keel.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error("build queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },

    #[error("{project}@{sha} is already queued or running")]
    DuplicateInFlight { project: String, sha: String },

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("checkout failed: {0}")]
    CheckoutFailed(String),

    #[error("build timed out after {}s", .0.as_secs())]
    BuildTimeout(Duration),

    #[error("builder crashed: {0}")]
    BuilderCrashed(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("notifier {channel} failed: {message}")]
    NotifyFailed { channel: String, message: String },

    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
