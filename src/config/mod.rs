//! Configuration system
//!
//! Loads ~/.config/nextdns-operator/config.yaml. Every field has a default,
//! so an empty or missing file yields a working configuration.

mod operator_config;
pub mod validation;

pub use operator_config::OperatorConfig;
pub use validation::{validate_config, validate_config_result, ValidationError};
