// log_sink.rs
// Purpose: Install the process-wide tracing subscriber for runtime events

use std::sync::Once;

use tracing::Level;

static INIT: Once = Once::new();

/// Parse a configured level name (`trace`, `debug`, `info`, `warn`, `error`).
pub fn parse_level(level: &str) -> Result<Level, String> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" | "critical" => Ok(Level::ERROR),
        other => Err(format!("unknown log level '{other}'")),
    }
}

/// Install a fmt subscriber at `level`.
///
/// Only the first call has an effect, so binaries and tests may both call it.
pub fn init_tracing(level: Level) {
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(true)
            .finish();
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("tracing subscriber already installed; keeping the existing one");
        }
    });
}
