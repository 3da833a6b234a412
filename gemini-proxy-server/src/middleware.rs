//! Request logging: one line in, one line out, and the JSON body at DEBUG.

use crate::error::ProxyError;
use crate::handlers::MAX_BODY_BYTES;
use axum::{
    body::{self, Body},
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::time::Instant;
use tracing::{debug, info, Level};

pub async fn log_requests(request: Request, next: Next) -> Response {
    info!("--> {} {}", request.method(), request.uri().path());

    let request = if tracing::enabled!(Level::DEBUG) {
        match log_body(request).await {
            Ok(request) => request,
            Err(e) => return e.into_response(),
        }
    } else {
        request
    };

    let started = Instant::now();
    let response = next.run(request).await;
    info!(
        "<-- {} (in {}ms)",
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

/// Buffers the body to log it, then hands an identical request on.
async fn log_body(request: Request) -> Result<Request, ProxyError> {
    let (parts, body) = request.into_parts();
    let bytes = body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::InvalidRequest(format!("failed to read request body: {e}")))?;

    if !bytes.is_empty() {
        debug!("Request body:\n{}", render_body(&bytes));
    }
    Ok(Request::from_parts(parts, Body::from(bytes)))
}

fn render_body(bytes: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logged_body_is_handed_on_intact() {
        let request = axum::http::Request::post("/api/chat")
            .body(Body::from("{\"model\":\"m\"}"))
            .unwrap();
        let request = log_body(request).await.unwrap();
        let bytes = body::to_bytes(request.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"{\"model\":\"m\"}");
    }

    #[tokio::test]
    async fn logged_body_respects_size_limit() {
        let request = axum::http::Request::post("/api/chat")
            .body(Body::from(vec![b'x'; MAX_BODY_BYTES + 1]))
            .unwrap();
        let err = log_body(request).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
    }

    #[test]
    fn json_bodies_are_pretty_printed() {
        assert_eq!(render_body(br#"{"model":"m"}"#), "{\n  \"model\": \"m\"\n}");
    }

    #[test]
    fn other_bodies_are_logged_lossily() {
        assert_eq!(render_body(b"not json"), "not json");
        assert_eq!(render_body(&[b'a', 0xff]), "a\u{fffd}");
    }
}
