//! Locally generated responses.
//!
//! Everything the proxy answers by itself (405, 408, 413, 429, 503, the
//! cancelled marker, mapped upstream errors) has an empty body and carries the
//! proxy's `Server` header. Upstream responses are passed through untouched.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;

/// Value of the `Server` header on locally generated responses.
pub const SERVER_NAME: &str = "stretch-proxy";

/// Status recorded for units whose client hung up before dispatch.
pub fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
}

/// Empty-bodied response with the proxy's `Server` header.
pub fn local_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_responses_are_empty_and_tagged() {
        let response = local_response(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::SERVER], SERVER_NAME);

        let body = axum::body::to_bytes(response.into_body(), 16).await.unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn cancelled_marker_is_499() {
        assert_eq!(client_closed_request().as_u16(), 499);
    }
}
