//! Checkout and build execution for the Keel CI server.
//!
//! Provides:
//! - [`GitCheckout`]: per-build clones through the `git` CLI
//! - [`ShellBuilder`]: runs a project's command with a timeout and an output ceiling

pub mod git;
mod output;
pub mod shell;

pub use git::GitCheckout;
pub use keel_core::{BuildResult, Builder, Checkout, WorkingDirectory};
pub use shell::{BuildSettings, ShellBuilder};
