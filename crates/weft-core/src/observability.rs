//! Observability infrastructure for weft.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors used by the server so that
//! every log line carries the connection it belongs to.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times; subsequent
/// calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `weft_state=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one client event stream.
///
/// # Example
///
/// ```rust
/// use weft_core::observability::session_span;
///
/// let span = session_span(1, "127.0.0.1:54321");
/// let _guard = span.enter();
/// // ... handle events for this stream
/// ```
#[must_use]
pub fn session_span(machine_id: u64, peer: &str) -> Span {
    tracing::info_span!("session", machine_id = machine_id, peer = peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn session_span_carries_fields() {
        let span = session_span(7, "10.0.0.2:9000");
        let _guard = span.enter();
        tracing::info!("test message in span");
    }
}
