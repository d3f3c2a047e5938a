//! The `llm-service` daemon: a long-running process that keeps language
//! models resident and serves streaming completions.
//!
//! Clients find the service on a shared bus socket, call `OpenSession`, and
//! get a private pipe-pair endpoint back. On that endpoint each client owns a
//! session object that can create completion cursors; cursors execute on
//! worker threads and stream chunk signals back through the session's main
//! loop. A process-wide [registry::ModelRegistry] deduplicates loaded models
//! and tracks how many cursors use each one.
#![deny(missing_docs)]

pub mod registry;
pub mod service;
pub mod session;

pub use registry::ModelRegistry;
pub use service::{Service, ServiceConfig};
