/// Install the global fmt subscriber, filtering at `level`. Unknown level
/// names fall back to `info`. Calling it again after a subscriber is set is
/// a no-op.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_target(false)
        .try_init();
}

pub(crate) fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}
