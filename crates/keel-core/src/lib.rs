//! Core domain types and traits for the Keel CI server.
//!
//! This crate contains:
//! - Resource identifiers and the error taxonomy
//! - Projects, commits and build jobs
//! - Push event parsing for the supported Git providers
//! - The `Checkout`, `Builder`, `BuildStore` and `Notifier` seams

pub mod build;
pub mod builder;
pub mod checkout;
pub mod error;
pub mod id;
pub mod notifier;
pub mod project;
pub mod repository;
pub mod store;

pub use build::{BuildJob, BuildStatus};
pub use builder::{BuildResult, Builder};
pub use checkout::{Checkout, WorkingDirectory};
pub use error::{Error, Result};
pub use id::ResourceId;
pub use notifier::{NotificationPayload, Notifier, NotifierKind, NotifierSettings, NotifyError};
pub use project::{BuildPolicy, Commit, NotifierConfig, Project, is_commit_sha};
pub use repository::{GitProvider, PushEvent};
pub use store::BuildStore;
