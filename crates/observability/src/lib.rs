//! Tracing/logging setup shared by the pipeline binaries.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use crate::tracing::{init_with, LogFormat, UnknownLogFormat, LOG_FORMAT_VAR};
