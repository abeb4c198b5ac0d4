//! HTTP server for the Keel CI server.
//!
//! Hosts the webhook endpoints, the manual trigger and build lookup API, and
//! the [`Server`] that wires store, scheduler and dispatcher together.

pub mod error;
pub mod ingest;
pub mod routes;
pub mod server;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use ingest::{Ingested, PushRequest, WebhookIngestor};
pub use server::Server;
pub use state::AppState;
