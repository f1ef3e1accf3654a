//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! admission, upstream, http:
//!     → logging.rs (tracing subscriber, env filter)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout
//!     → Prometheus scrape endpoint (optional)
//! ```

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::init_metrics;
