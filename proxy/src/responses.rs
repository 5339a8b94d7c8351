use crate::reasons::REASON_HOST_PORT_NOT_ALLOWED;
use crate::reasons::REASON_NOT_IN_ALLOWLIST;
use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::Empty;
use http_body_util::Full;
use http_body_util::combinators::BoxBody;
use hyper::Response;
use hyper::StatusCode;
use hyper::header::HeaderValue;
use serde::Serialize;
use tracing::error;

/// Body type shared by every HTTP surface of the proxy. Synthesized bodies
/// are infallible; upstream bodies carry `hyper::Error`, so everything is
/// boxed over that.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(full_body(body.to_string()))
        .unwrap_or_else(|_| Response::new(full_body(body.to_string())))
}

pub fn json_response<T: Serialize>(value: &T) -> Response<ProxyBody> {
    let body = match serde_json::to_string(value) {
        Ok(body) => body,
        Err(err) => {
            error!("failed to serialize JSON response: {err}");
            "{}".to_string()
        }
    };
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap_or_else(|err| {
            error!("failed to build JSON response: {err}");
            Response::new(full_body("{}"))
        })
}

pub fn blocked_header_value(reason: &str) -> &'static str {
    if reason == REASON_NOT_IN_ALLOWLIST {
        "blocked-by-allowlist"
    } else if reason == REASON_HOST_PORT_NOT_ALLOWED {
        "blocked-by-host-port-policy"
    } else if reason.contains("blocked CIDR range") {
        "blocked-by-cidr"
    } else {
        "blocked-by-policy"
    }
}

/// Human-readable block text. The typical reader is a developer triaging
/// their own allowlist, so the message names the host and points at the
/// control API.
pub fn blocked_message(host: &str, port: &str, reason: &str) -> String {
    format!(
        "vibepit blocked this request: {reason} (host={host}, port={port}).\n\
         To permit it, add an allow rule through the control API:\n\
         POST /allow-http {{\"entries\": [\"{host}:{port}\"]}}\n"
    )
}

/// 403 sent for blocked plain-HTTP requests and CONNECT attempts. For
/// CONNECT the response arrives before any tunnel bytes, so the client's
/// TLS stack sees a clean proxy-level rejection rather than a broken
/// handshake.
pub fn blocked_response(host: &str, port: &str, reason: &str) -> Response<ProxyBody> {
    let body = blocked_message(host, port, reason);
    let mut response = Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header("content-type", "text/plain")
        .body(full_body(body.clone()))
        .unwrap_or_else(|_| Response::new(full_body(body)));
    response.headers_mut().insert(
        "x-proxy-error",
        HeaderValue::from_static(blocked_header_value(reason)),
    );
    response
}
