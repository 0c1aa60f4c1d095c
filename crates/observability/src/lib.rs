//! Tracing/logging setup shared by processes embedding the job storage.

/// Initialize process-wide logging with the default settings.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::LogConfig::default());
}

/// Subscriber configuration (filters, output format).
pub mod tracing;
