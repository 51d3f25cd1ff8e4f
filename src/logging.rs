//! Tracing subscriber setup

use crate::config::LoggingConfig;
use crate::error::{ContextError, Result};
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `config.level`. A second call leaves the
/// existing subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ContextError::Configuration(format!("invalid log level: {}", e)))?;

    let json = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let plain = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init()
    {
        debug!("Tracing subscriber already installed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }

    #[test]
    fn test_rejects_bad_level() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "context_engine=loudest".to_string(),
            json: true,
        };
        assert!(init_logging(&config).is_err());
    }
}
