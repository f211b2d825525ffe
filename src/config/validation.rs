//! Configuration validation
//!
//! Validates operator configuration for correctness:
//! - Worker count and intervals are non-zero
//! - The API base URL is an http(s) URL
//! - The backoff curve grows and has a sane ceiling
//! - The metrics address parses as a socket address

use super::operator_config::OperatorConfig;
use crate::OperatorError;
use std::net::SocketAddr;

/// Validation error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub context: Option<String>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref ctx) = self.context {
            write!(f, "[{}] {}: {}", ctx, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate an operator configuration, reporting every problem at once
pub fn validate_config(config: &OperatorConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.workers == 0 {
        errors.push(ValidationError::new("workers", "Must be at least 1"));
    }

    for (field, value) in [
        ("resyncIntervalSecs", config.resync_interval_secs),
        ("reconcileTimeoutSecs", config.reconcile_timeout_secs),
        ("referenceRetryMaxSecs", config.reference_retry_max_secs),
        ("authRetryIntervalSecs", config.auth_retry_interval_secs),
        ("manifestPollIntervalSecs", config.manifest_poll_interval_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "Must be greater than 0"));
        }
    }

    if !config.api_base_url.starts_with("http://") && !config.api_base_url.starts_with("https://") {
        errors.push(ValidationError::new(
            "apiBaseUrl",
            format!("Invalid API URL: {}", config.api_base_url),
        ));
    }

    let backoff = &config.backoff;
    if backoff.initial_ms == 0 {
        errors.push(ValidationError::new("initialMs", "Must be greater than 0").with_context("backoff"));
    }
    if backoff.multiplier < 1.0 {
        errors.push(
            ValidationError::new(
                "multiplier",
                format!("Must be at least 1.0, got {}", backoff.multiplier),
            )
            .with_context("backoff"),
        );
    }
    if backoff.max_secs.saturating_mul(1000) < backoff.initial_ms {
        errors.push(
            ValidationError::new("maxSecs", "Ceiling must not be below the initial delay")
                .with_context("backoff"),
        );
    }

    if let Some(ref namespace) = config.namespace {
        if namespace.trim().is_empty() {
            errors.push(ValidationError::new("namespace", "Must not be empty when set"));
        }
    }

    if let Some(ref addr) = config.metrics_addr {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "metricsAddr",
                format!("Invalid socket address: {}", addr),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and fold every problem into one configuration error
pub fn validate_config_result(config: &OperatorConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        OperatorError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&OperatorConfig::new()).is_ok());
    }

    #[test]
    fn test_reports_all_errors() {
        let mut config = OperatorConfig::new();
        config.workers = 0;
        config.api_base_url = "api.nextdns.io".into();
        config.backoff.multiplier = 0.5;
        config.metrics_addr = Some("localhost".into());

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["workers", "apiBaseUrl", "multiplier", "metricsAddr"]);
        assert_eq!(errors[2].to_string(), "[backoff] multiplier: Must be at least 1.0, got 0.5");
    }

    #[test]
    fn test_zero_interval() {
        let mut config = OperatorConfig::new();
        config.reconcile_timeout_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "reconcileTimeoutSecs");
    }

    #[test]
    fn test_validate_config_result_message() {
        let mut config = OperatorConfig::new();
        config.workers = 0;

        let err = validate_config_result(&config).unwrap_err();
        assert!(err.to_string().contains("workers: Must be at least 1"));
    }
}
