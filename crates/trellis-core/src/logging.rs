//! # Logging
//!
//! Subscriber initialization plus a small namespaced logger. Every event
//! emitted through [`Logger`] carries a `namespace` field so request,
//! service and loader logs can be filtered independently.

use std::str::FromStr;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::ConfigError;

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::Invalid {
                key: "LOG_FORMAT".to_string(),
                value: s.to_string(),
                reason: "expected pretty or json".to_string(),
            }),
        }
    }
}

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Calling this
/// more than once is harmless; later calls leave the first subscriber in
/// place.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let _ = match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer()).try_init(),
    };
}

/// A logger bound to a fixed namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Logger {
    namespace: &'static str,
}

impl Logger {
    pub const fn new(namespace: &'static str) -> Self {
        Self { namespace }
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    pub fn debug(&self, message: impl std::fmt::Display) {
        tracing::debug!(namespace = self.namespace, "{message}");
    }

    pub fn info(&self, message: impl std::fmt::Display) {
        tracing::info!(namespace = self.namespace, "{message}");
    }

    pub fn warn(&self, message: impl std::fmt::Display) {
        tracing::warn!(namespace = self.namespace, "{message}");
    }

    pub fn error(&self, message: impl std::fmt::Display) {
        tracing::error!(namespace = self.namespace, "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn logger_keeps_namespace() {
        const LOG: Logger = Logger::new("registry");
        assert_eq!(LOG.namespace(), "registry");
        LOG.info("no subscriber installed, event is dropped");
    }

    #[test]
    fn init_twice_does_not_panic() {
        init(LogFormat::Pretty);
        init(LogFormat::Json);
    }
}
