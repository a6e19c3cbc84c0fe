#![deny(missing_docs)]

//! Shared configuration, error types, IDs, and observability primitives for PDQ crates.
//!
//! Architecture role:
//! - defines runtime configuration passed across layers
//! - provides common [`PdqError`] / [`Result`] contracts
//! - hosts typed identifier wrappers for handles, sessions, and calls
//! - hosts metrics and logging utilities
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - [`logging`]

/// Shared runtime configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Idempotent tracing initialization.
pub mod logging;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::{env_or_default, RuntimeConfig};
pub use error::{ErrorReport, PdqError, Result};
pub use ids::{CallId, ObjectId, SessionId};
pub use logging::init_logging;
pub use metrics::{global_metrics, MetricsRegistry};
