//! Per-client admission control.
//!
//! # Data Flow
//! ```text
//! boundary adapter
//!     → queue.rs admit(): 429 if the client's queue is full, else append
//!     → first unit on an empty queue starts the client's dispatch driver
//!     → estimator.rs computes the delay for the head unit
//!     → after the delay, body.rs connects the body, upstream forwards
//!     → result settles the unit's handle (unit.rs), estimator books the
//!       consumed time, queue advances to the next unit
//!
//! reaper.rs, every window:
//!     drop clients with an empty queue idle for longer than the window
//! ```
//!
//! # Design Decisions
//! - One driver task per client with a non-empty queue; strict FIFO per client
//! - Client state lives in a sharded map and is only touched under its entry
//!   guard, never across an await
//! - Every outcome becomes a response; nothing escapes to the boundary

pub mod body;
pub mod estimator;
pub mod queue;
pub mod reaper;
pub mod unit;

use axum::http::StatusCode;

use crate::config::AdmissionConfig;
use crate::http::response::client_closed_request;

pub use body::{BodyError, RequestBody, StreamingBody};
pub use estimator::{DecayParams, DecayState, DelayEstimate};
pub use queue::{Admission, AdmissionQueue, ClientSnapshot};
pub use reaper::ClientReaper;
pub use unit::{PendingRequest, PendingResponse, RequestContext, RequestUnit, ResultHandle};

impl From<&AdmissionConfig> for DecayParams {
    fn from(config: &AdmissionConfig) -> Self {
        Self {
            window: config.window_secs,
            concurrency_target: config.concurrency_target,
        }
    }
}

/// How a request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Upstream answered; its response was passed through.
    Forwarded,
    /// Client already had `concurrency_limit` requests queued.
    Rejected,
    /// Body outgrew the buffer cap while queued.
    BodyOverflow,
    /// Upstream answered with this error status.
    UpstreamError(StatusCode),
    /// No usable answer from upstream.
    UpstreamUnavailable,
    /// Waited in queue past the hard timeout.
    QueueTimeout,
    /// Client went away before its turn.
    Cancelled,
    /// Method other than GET, POST or OPTIONS; never queued.
    NotAllowed,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Forwarded => "forwarded",
            Outcome::Rejected => "rejected",
            Outcome::BodyOverflow => "body_overflow",
            Outcome::UpstreamError(_) => "upstream_error",
            Outcome::UpstreamUnavailable => "upstream_unavailable",
            Outcome::QueueTimeout => "queue_timeout",
            Outcome::Cancelled => "cancelled",
            Outcome::NotAllowed => "not_allowed",
        }
    }

    /// Status of the locally generated response, if this outcome produces one.
    pub fn local_status(&self) -> Option<StatusCode> {
        match self {
            Outcome::Forwarded => None,
            Outcome::Rejected => Some(StatusCode::TOO_MANY_REQUESTS),
            Outcome::BodyOverflow => Some(StatusCode::PAYLOAD_TOO_LARGE),
            Outcome::UpstreamError(code) => Some(*code),
            Outcome::UpstreamUnavailable => Some(StatusCode::SERVICE_UNAVAILABLE),
            Outcome::QueueTimeout => Some(StatusCode::REQUEST_TIMEOUT),
            Outcome::Cancelled => Some(client_closed_request()),
            Outcome::NotAllowed => Some(StatusCode::METHOD_NOT_ALLOWED),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_statuses() {
        assert_eq!(Outcome::Forwarded.local_status(), None);
        assert_eq!(Outcome::Rejected.local_status(), Some(StatusCode::TOO_MANY_REQUESTS));
        assert_eq!(Outcome::BodyOverflow.local_status(), Some(StatusCode::PAYLOAD_TOO_LARGE));
        assert_eq!(
            Outcome::UpstreamError(StatusCode::BAD_GATEWAY).local_status(),
            Some(StatusCode::BAD_GATEWAY)
        );
        assert_eq!(
            Outcome::UpstreamUnavailable.local_status(),
            Some(StatusCode::SERVICE_UNAVAILABLE)
        );
        assert_eq!(Outcome::QueueTimeout.local_status(), Some(StatusCode::REQUEST_TIMEOUT));
        assert_eq!(Outcome::Cancelled.local_status().map(|s| s.as_u16()), Some(499));
        assert_eq!(Outcome::NotAllowed.local_status(), Some(StatusCode::METHOD_NOT_ALLOWED));
    }

    #[test]
    fn decay_params_from_config() {
        let params = DecayParams::from(&AdmissionConfig::default());
        assert_eq!(params.window, 12.0);
        assert_eq!(params.quant(), 3.0);
    }
}
