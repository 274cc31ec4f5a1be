//! Reftest Web Transport
//!
//! Serves the browser-facing harness assets and receives result callbacks
//! from the in-browser runner. Session state lives elsewhere: every POST is
//! handed to an injected [`HarnessSink`].

pub mod server;
pub mod sink;
pub mod static_files;

pub use server::{Protocol, RunningServer, WebServer, WebServerConfig};
pub use sink::{HarnessMessage, HarnessSink};
