//! Tracing and logging setup shared by worker processes.

/// Initialize process-wide tracing with defaults (JSON, `RUST_LOG`, `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&TracingConfig::default());
}

/// Initialize process-wide tracing with an explicit configuration.
pub fn init_with(config: &TracingConfig) {
    tracing::init(config);
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, TracingConfig};
