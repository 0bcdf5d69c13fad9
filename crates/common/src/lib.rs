#![deny(missing_docs)]

//! Shared configuration, error types, IDs, and observability primitives for
//! Meld crates.
//!
//! Architecture role:
//! - defines arbitrator/merge configuration passed across layers
//! - provides common [`MeldError`] / [`Result`] contracts
//! - hosts the metrics registry shared by the memory and exec crates
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

/// Arbitrator and merge configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::{ArbitratorConfig, CompressionKind, MergeConfig, SerdeKind};
pub use error::{AbortCause, MeldError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
