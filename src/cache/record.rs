//! Serialized form of a cached response.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::store::CacheError;

/// Headers never stored; framing is recomputed when serving.
static UNSTORED_HEADERS: [HeaderName; 3] = [
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status_code: u16,
    pub content_length: i64,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn from_parts(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Self {
        let mut stored: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            if UNSTORED_HEADERS.contains(name) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                stored
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }

        // A bodiless reply (HEAD) keeps the length the origin announced.
        let announced = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        let content_length = match announced {
            Some(length) if body.is_empty() => length,
            _ => body.len() as i64,
        };

        Self {
            status_code: status.as_u16(),
            content_length,
            headers: stored,
            body: body.to_vec(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        bincode::serialize(self).map_err(CacheError::Encode)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CacheError> {
        bincode::deserialize(data).map_err(CacheError::Decode)
    }

    /// First value of a stored header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    /// Rebuild a response with an exact `Content-Length`. For `head` the
    /// body is dropped and the recorded length is announced instead.
    pub fn into_response(self, head: bool) -> Response<Body> {
        let mut resp = Response::new(Body::empty());
        *resp.status_mut() = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK);

        let headers = resp.headers_mut();
        for (name, values) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.append(name.clone(), value);
                }
            }
        }
        if head {
            let length = u64::try_from(self.content_length).unwrap_or(self.body.len() as u64);
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            return resp;
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));

        *resp.body_mut() = Body::from(Bytes::from(self.body));
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn survives_encoding_with_multi_value_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));
        headers.insert(header::ETAG, HeaderValue::from_static("\"v1\""));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let record = CachedResponse::from_parts(StatusCode::OK, &headers, b"{\"a\":1}");
        assert!(!record.headers.contains_key("transfer-encoding"));
        assert_eq!(record.header("ETag"), Some("\"v1\""));

        let decoded = CachedResponse::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);

        let resp = decoded.into_response(false);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get_all(header::SET_COOKIE).iter().count(), 2);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "7");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"{\"a\":1}");
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(CachedResponse::decode(b"\x01").is_err());
    }

    #[test]
    fn head_reply_keeps_announced_length() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("7"));
        let record = CachedResponse::from_parts(StatusCode::OK, &headers, b"");
        assert_eq!(record.content_length, 7);

        let resp = record.into_response(true);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "7");
    }
}
