//! Tracing setup
//!
//! Structured logging for the engine and its embedders:
//! - `EnvFilter` driven by `RUST_LOG`, falling back to the given level
//! - Pretty output for development, JSON when `JSON_LOGS=true`

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn json_logs() -> bool {
    std::env::var("JSON_LOGS")
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Initialize the global tracing subscriber
pub fn init(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = tracing_subscriber::registry().with(filter);

    if json_logs() {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    tracing::debug!(level = log_level, "Tracing initialized");
    Ok(())
}

/// Like [`init`], but a subscriber already installed by the host is not an error
pub fn try_init(log_level: &str) -> bool {
    init(log_level).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_reported() {
        let _ = try_init("debug");
        assert!(!try_init("debug"));
    }
}
