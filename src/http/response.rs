//! Response construction helpers.
//!
//! Every synthetic response the edge produces (404, policy rejections,
//! challenges, gateway errors) is built here so framing headers are
//! consistent.

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use bytes::Bytes;

/// The response type flowing through the pipeline.
pub type ProxyResponse = Response<Body>;

pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
pub const TEXT_HTML: &str = "text/html; charset=utf-8";

/// Response with an in-memory body and explicit `Content-Length`.
pub fn bytes(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> ProxyResponse {
    let body = body.into();
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    *resp.body_mut() = Body::from(body);
    resp
}

pub fn text(status: StatusCode, body: impl Into<Bytes>) -> ProxyResponse {
    bytes(status, TEXT_PLAIN, body)
}

pub fn html(status: StatusCode, body: impl Into<Bytes>) -> ProxyResponse {
    bytes(status, TEXT_HTML, body)
}

pub fn not_found() -> ProxyResponse {
    html(StatusCode::NOT_FOUND, "<h1>Not found</h1>\n")
}

pub fn bad_gateway() -> ProxyResponse {
    text(StatusCode::BAD_GATEWAY, "Bad Gateway\n")
}

pub fn gateway_timeout() -> ProxyResponse {
    text(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout\n")
}

pub fn payload_too_large() -> ProxyResponse {
    text(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large\n")
}

/// `302 Found` to `location`. Falls back to 502 if the location is not a
/// valid header value.
pub fn redirect(location: &str) -> ProxyResponse {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut resp = bytes(StatusCode::FOUND, TEXT_HTML, Bytes::new());
            resp.headers_mut().insert(header::LOCATION, value);
            resp
        }
        Err(_) => bad_gateway(),
    }
}
