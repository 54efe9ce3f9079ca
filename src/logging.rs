//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level.

use crate::config::LogConfig;
use crate::error::{DbError, DbResult};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global subscriber. Panics if one is already set.
pub fn init_tracing(config: &LogConfig) {
    let subscriber = tracing_subscriber::registry().with(env_filter(config));

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

/// Like [`init_tracing`], but reports an already installed subscriber as an
/// error instead of panicking.
pub fn try_init_tracing(config: &LogConfig) -> DbResult<()> {
    let subscriber = tracing_subscriber::registry().with(env_filter(config));

    let result = if config.json {
        subscriber.with(fmt::layer().json()).try_init()
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()
    };
    result.map_err(|e| DbError::internal(format!("Failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_error() {
        let config = LogConfig {
            level: "debug".into(),
            json: false,
        };
        let first = try_init_tracing(&config);
        let second = try_init_tracing(&config);
        // Another test may have installed a subscriber first.
        assert!(first.is_err() || second.is_err());
        assert!(matches!(second, Err(DbError::Internal { .. })));
    }
}
