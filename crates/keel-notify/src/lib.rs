//! Build notifications for the Keel CI server.
//!
//! The [`Dispatcher`] fans every completed build out to the channels a
//! project configured. Channels are looked up in a fixed
//! [`NotifierRegistry`] built at startup.

pub mod channels;
pub mod dispatcher;
pub mod registry;

pub use channels::{ChatNotifier, EmailNotifier, IrcNotifier, WebhookNotifier};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use registry::NotifierRegistry;
