//! Logging configuration using tracing
//!
//! Structured logging to stderr, filtered by the RUST_LOG environment
//! variable, in a human-readable or JSON format.

use serde::{Deserialize, Serialize};
use std::fmt as stdfmt;
use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when RUST_LOG is unset
const DEFAULT_FILTER: &str = "info";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human-readable output
    #[default]
    Pretty,
    /// One JSON object per line, for log collectors
    Json,
}

impl stdfmt::Display for LogFormat {
    fn fmt(&self, f: &mut stdfmt::Formatter<'_>) -> stdfmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}', expected 'pretty' or 'json'", other)),
        }
    }
}

/// Initialize the tracing subscriber
///
/// # Example RUST_LOG values
/// - `RUST_LOG=debug` - Show debug and above
/// - `RUST_LOG=nextdns_operator=trace` - Trace level for this crate only
/// - `RUST_LOG=nextdns_operator::reconcile=debug,info` - Per-module levels
///
/// # Errors
/// Returns an error if the subscriber has already been initialized
pub fn init(format: LogFormat) -> crate::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .pretty(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().with_target(true).json().flatten_event(true))
            .try_init(),
    };

    result.map_err(|e| crate::OperatorError::Other(format!("Failed to initialize tracing: {}", e)))
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init(LogFormat::Pretty);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_helper() {
        init_test();
        init_test();
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_logging_macros() {
        init_test();

        tracing::debug!("This is a debug message");
        tracing::info!(
            profile = "home/kids",
            collection = "denylist",
            "Testing structured logging"
        );
    }
}
