//! Shared helpers for the steward crates: tracing setup and cron expressions.

pub mod cron;
pub mod tracing;

pub use cron::{CronError, CronExpr};
pub use tracing::{init_tracing, parse_level, TracingConfig, TracingError, TracingOutputFormat};
