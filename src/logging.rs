//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over `application.log_level` when set. Output goes to
//! stderr, pretty or JSON per `application.log_format`, and every event is
//! also copied into the shared [`LogBuffer`].

use crate::config::ApplicationConfig;
use crate::error::{AppResult, DaqError};
use crate::log_capture::LogBuffer;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// Filter from `RUST_LOG`, else from the configured level.
pub fn env_filter(config: &ApplicationConfig) -> AppResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| {
            DaqError::Configuration(format!("Invalid log_level '{}': {}", config.log_level, e))
        }),
    }
}

/// Install the global subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init(config: &ApplicationConfig, buffer: &LogBuffer) -> AppResult<()> {
    let filter = env_filter(config)?;

    let fmt_layer = match config.log_format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        _ => fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(buffer.layer())
        .try_init()
        .map_err(|e| DaqError::Configuration(format!("Logging already initialized: {}", e)))?;

    tracing::debug!(
        app = %config.name,
        format = %config.log_format,
        "Logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_builds_filter() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = ApplicationConfig {
            log_level: "debug".to_string(),
            ..ApplicationConfig::default()
        };
        assert!(env_filter(&config).is_ok());
    }
}
