//! Request units and their single-resolution result handles.

use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::admission::body::RequestBody;
use crate::http::response::local_response;

/// What the dispatch log line needs to know about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub method: Method,
    /// Inbound path plus query string.
    pub path: String,
    /// `"method"` field of a buffered JSON-RPC style POST body, when debug logging.
    pub rpc_method: Option<String>,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            rpc_method: None,
        }
    }

    /// Attach the JSON `"method"` field of a fully buffered body.
    pub fn with_rpc_method_from(mut self, body: &[u8]) -> Self {
        let method = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|value| value.get("method")?.as_str().map(str::to_owned));
        self.rpc_method = Some(method.unwrap_or_else(|| "(no method)".to_string()));
        self
    }

    /// Path as shown in logs.
    pub fn log_path(&self) -> String {
        match &self.rpc_method {
            Some(rpc) => format!("{} {}", self.path, rpc),
            None => self.path.clone(),
        }
    }
}

/// An inbound request ready to be queued. Everything but the body is fixed.
#[derive(Debug)]
pub struct PendingRequest {
    pub context: RequestContext,
    /// Absolute upstream URI.
    pub uri: Uri,
    /// Headers to send upstream, `Host` already rewritten.
    pub headers: HeaderMap,
    pub body: RequestBody,
}

/// Settlement side of a unit. Resolves the waiting connection at most once.
///
/// The waiting side going away (client hang-up) marks the handle inactive.
#[derive(Debug)]
pub struct ResultHandle {
    tx: Option<oneshot::Sender<Response>>,
}

impl ResultHandle {
    pub fn channel() -> (Self, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, PendingResponse { rx })
    }

    /// Whether someone is still waiting for this result.
    pub fn is_active(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    #[cfg(test)]
    fn is_settled(&self) -> bool {
        self.tx.is_none()
    }

    /// Deliver `response`. Returns false if the handle was already settled.
    pub fn settle(&mut self, response: Response) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // A dropped receiver is a cancelled client; nothing left to tell.
                let _ = tx.send(response);
                true
            }
            None => false,
        }
    }
}

/// The waiting side of a unit, held by the inbound connection.
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<Response>,
}

impl PendingResponse {
    /// Wait for the unit to settle.
    pub async fn wait(self) -> Response {
        match self.rx.await {
            Ok(response) => response,
            Err(_) => {
                tracing::error!("Request unit dropped without a response");
                local_response(StatusCode::SERVICE_UNAVAILABLE)
            }
        }
    }
}

/// One admitted request, owned by its client's queue until it settles.
#[derive(Debug)]
pub struct RequestUnit {
    pub request: PendingRequest,
    pub handle: ResultHandle,
    pub admitted_at: Instant,
}

impl RequestUnit {
    pub fn new(request: PendingRequest, handle: ResultHandle, admitted_at: Instant) -> Self {
        Self {
            request,
            handle,
            admitted_at,
        }
    }
}
