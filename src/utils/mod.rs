//! # Utility Modules
//!
//! Supporting utilities for observability and timing.
//!
//! ## Components
//! - **Logging**: optional `tracing-subscriber` setup from [`crate::config::LoggingConfig`]
//! - **Metrics**: per-node atomic counters
//! - **Timeout**: default durations and async timeout wrappers

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
