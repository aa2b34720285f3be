//! Shared logging initialization for coordinator binaries.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

fn parse_level(default: tracing::Level) -> tracing::Level {
    match std::env::var("APM_LOG")
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => default,
    }
}

/// Initialize process-level tracing output.
///
/// The level comes from `APM_LOG` when set, otherwise from `default`
/// (binaries map their `--verbose` flag onto it). Safe to call multiple
/// times; only the first call installs the subscriber.
pub fn init(default: tracing::Level) {
    if INIT.get().is_some() {
        return;
    }
    let level = parse_level(default);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
    let _ = INIT.set(());
}
