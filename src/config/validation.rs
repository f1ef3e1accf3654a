//! Configuration validation.
//!
//! Serde handles syntax; this pass checks value ranges and addresses and
//! reports every problem at once rather than stopping at the first.

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{ProxyConfig, MAX_PERIOD_SECS};

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn is_valid_period(secs: f64) -> bool {
    secs > 0.0 && secs <= MAX_PERIOD_SECS
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    let upstream = config.upstream.address.trim();
    if upstream.is_empty() || upstream.contains('/') {
        errors.push(ValidationError::new(
            "upstream.address",
            format!("'{}' is not a host:port authority", config.upstream.address),
        ));
    }

    let admission = &config.admission;
    if !is_valid_period(admission.hard_timeout_secs) {
        errors.push(ValidationError::new(
            "admission.hard_timeout_secs",
            format!("must be > 0 and <= {MAX_PERIOD_SECS}"),
        ));
    }
    if !is_valid_period(admission.window_secs) {
        errors.push(ValidationError::new(
            "admission.window_secs",
            format!("must be > 0 and <= {MAX_PERIOD_SECS}"),
        ));
    }
    if !(admission.concurrency_target > 0.0 && admission.concurrency_target.is_finite()) {
        errors.push(ValidationError::new("admission.concurrency_target", "must be > 0"));
    }
    if admission.concurrency_limit == 0 {
        errors.push(ValidationError::new("admission.concurrency_limit", "must be >= 1"));
    }
    if admission.max_body_bytes == 0 {
        errors.push(ValidationError::new("admission.max_body_bytes", "must be >= 1"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
