//! Upstream forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! dispatched unit
//!     → UpstreamRequest (absolute URI, rewritten Host, connected body)
//!     → Forward impl (forwarder.rs: hyper client, hard timeout, no redirects)
//!     → Ok(response) passed through, Err(ForwardError) mapped to a status
//! ```
//!
//! # Design Decisions
//! - No retries: a failed call is surfaced once
//! - Failures are logged where they are detected, with method and path
//! - Upstream 4xx/5xx are surfaced as their status with an empty body

pub mod forwarder;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::Response;
use futures_util::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

use crate::admission::unit::RequestContext;
use crate::http::response::local_response;

pub use forwarder::HyperForwarder;

/// Request issued to the upstream when a unit is dispatched.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub context: RequestContext,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Body,
    /// Wall-clock budget for the whole exchange.
    pub timeout: Duration,
}

/// Why an upstream call produced no usable response.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Upstream answered with an error status.
    #[error("upstream responded {0}")]
    Status(StatusCode),

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),

    /// Connection refused, DNS failure, reset, malformed response.
    #[error("upstream transport error: {0}")]
    Transport(String),
}

impl ForwardError {
    /// Status returned to the inbound client.
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::Status(code) if (400..600).contains(&code.as_u16()) => *code,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.status() == StatusCode::SERVICE_UNAVAILABLE && !matches!(self, ForwardError::Status(_))
    }

    pub fn into_response(self) -> Response {
        local_response(self.status())
    }
}

/// Something that can carry a dispatched request to the upstream.
pub trait Forward: Send + Sync + 'static {
    fn forward(&self, request: UpstreamRequest) -> BoxFuture<'_, Result<Response, ForwardError>>;
}
