//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the admission proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// The single upstream origin every admitted request goes to.
    pub upstream: UpstreamConfig,

    /// Per-client admission and delay shaping.
    pub admission: AdmissionConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Upstream origin configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Upstream `host:port`. Also written into the forwarded `Host` header.
    pub address: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:80".to_string(),
        }
    }
}

/// Admission queue and rate estimator tuning.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum seconds a request may wait in queue, and the upstream call timeout.
    pub hard_timeout_secs: f64,

    /// Decay window in seconds. Also the reaper period.
    pub window_secs: f64,

    /// Concurrent in-flight requests per client tolerated before delaying.
    pub concurrency_target: f64,

    /// Maximum queued requests per client before answering 429.
    pub concurrency_limit: usize,

    /// Cap on request body bytes held while a request waits in queue.
    pub max_body_bytes: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            hard_timeout_secs: 12.0,
            window_secs: 12.0,
            concurrency_target: 4.0,
            concurrency_limit: 64,
            max_body_bytes: 1_048_576,
        }
    }
}

/// Upper bound for `hard_timeout_secs` and `window_secs` (one day).
pub const MAX_PERIOD_SECS: f64 = 86_400.0;

/// Seconds to `Duration`, clamped to `MAX_PERIOD_SECS`; negative or NaN gives zero.
fn bounded_period(secs: f64) -> Duration {
    if secs.is_nan() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs.min(MAX_PERIOD_SECS)).unwrap_or(Duration::ZERO)
}

impl AdmissionConfig {
    pub fn hard_timeout(&self) -> Duration {
        bounded_period(self.hard_timeout_secs)
    }

    pub fn window(&self) -> Duration {
        bounded_period(self.window_secs)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Verbose per-dispatch logging. Also switches POST bodies to eager buffering.
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            debug: false,
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
