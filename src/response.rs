use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::trace;

use crate::ReqpoolResult;
use crate::blocking_client::codec::{BodyFraming, read_body};
use crate::blocking_client::transport::{ErrorContext, HttpConnection};
use crate::error::{HttpClientError, TimeoutPhase};
use crate::pool::PooledConnection;
use crate::util::{decode_text, encoding_for_label, response_encoding, truncate_body};

/// Body still sitting on the leased connection.
pub(crate) struct PendingBody {
    pub(crate) connection: PooledConnection<HttpConnection>,
    pub(crate) framing: BodyFraming,
    /// Server allows reuse and the body is length-delimited.
    pub(crate) reusable: bool,
    pub(crate) keep_alive: Duration,
    /// Socket timeout reported when a body read times out.
    pub(crate) io_timeout: Duration,
    pub(crate) limit_bytes: usize,
}

impl PendingBody {
    /// Reads are bounded by the deadline armed on the connection when the
    /// request was sent.
    fn read_to_end(mut self, context: ErrorContext<'_>) -> ReqpoolResult<Bytes> {
        let timeout = self.io_timeout;
        let body = read_body(self.connection.reader(), self.framing, self.limit_bytes)
            .map_err(|error| context.wire(error, TimeoutPhase::Read, timeout, self.limit_bytes))?;

        if self.reusable {
            self.connection.set_valid_for(self.keep_alive);
        }
        trace!(
            id = self.connection.id(),
            reusable = self.reusable,
            body_len = body.len(),
            "response body consumed"
        );
        self.connection.release(self.reusable);
        Ok(body)
    }
}

enum BodyState {
    Pending(Box<PendingBody>),
    Buffered(Bytes),
    Released,
}

/// Status, headers and body of one exchange.
///
/// The body stays on the pooled connection until it is first read; reading
/// it (or calling [`release`](Self::release)) hands the connection back to
/// the pool. Dropping an unread envelope closes the connection instead.
pub struct ResponseEnvelope {
    status: StatusCode,
    headers: HeaderMap,
    method: Method,
    uri: String,
    body: BodyState,
}

impl ResponseEnvelope {
    pub(crate) fn pending(
        status: StatusCode,
        headers: HeaderMap,
        method: Method,
        uri: String,
        pending: PendingBody,
    ) -> Self {
        Self {
            status,
            headers,
            method,
            uri,
            body: BodyState::Pending(Box::new(pending)),
        }
    }

    pub(crate) fn buffered(
        status: StatusCode,
        headers: HeaderMap,
        method: Method,
        uri: String,
        body: Bytes,
    ) -> Self {
        Self {
            status,
            headers,
            method,
            uri,
            body: BodyState::Buffered(body),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URI with credentials and query removed.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_released(&self) -> bool {
        matches!(self.body, BodyState::Released)
    }

    /// The raw body. Repeated calls return the same buffered bytes.
    pub fn bytes(&mut self) -> ReqpoolResult<Bytes> {
        match std::mem::replace(&mut self.body, BodyState::Released) {
            BodyState::Buffered(body) => {
                self.body = BodyState::Buffered(body.clone());
                Ok(body)
            }
            BodyState::Pending(pending) => {
                let context = ErrorContext {
                    method: &self.method,
                    uri: &self.uri,
                };
                let body = (*pending).read_to_end(context)?;
                self.body = BodyState::Buffered(body.clone());
                Ok(body)
            }
            BodyState::Released => Err(HttpClientError::ResponseReleased),
        }
    }

    /// Decodes the body with the `Content-Type` charset, UTF-8 by default.
    pub fn text(&mut self) -> ReqpoolResult<String> {
        let encoding = response_encoding(&self.headers);
        let body = self.bytes()?;
        decode_text(&body, encoding)
    }

    /// Decodes the body with an explicit charset label such as `"GBK"`.
    pub fn text_with_charset(&mut self, charset: &str) -> ReqpoolResult<String> {
        let encoding = encoding_for_label(charset)?;
        let body = self.bytes()?;
        decode_text(&body, encoding)
    }

    pub fn json<T>(&mut self) -> ReqpoolResult<T>
    where
        T: DeserializeOwned,
    {
        let body = self.bytes()?;
        serde_json::from_slice(&body).map_err(|source| HttpClientError::Deserialize {
            source,
            body: truncate_body(&body),
        })
    }

    /// Parses JSON out of text decoded with an explicit charset.
    pub fn json_with_charset<T>(&mut self, charset: &str) -> ReqpoolResult<T>
    where
        T: DeserializeOwned,
    {
        let text = self.text_with_charset(charset)?;
        serde_json::from_str(&text).map_err(|source| HttpClientError::Deserialize {
            source,
            body: truncate_body(text.as_bytes()),
        })
    }

    pub fn json_object(&mut self) -> ReqpoolResult<Map<String, Value>> {
        expect_object(self.json()?)
    }

    pub fn json_array(&mut self) -> ReqpoolResult<Vec<Value>> {
        expect_array(self.json()?)
    }

    /// Fails with [`HttpClientError::HttpStatus`] for status codes of 400 and
    /// above, carrying a truncated copy of the body.
    pub fn error_for_status(mut self) -> ReqpoolResult<Self> {
        if self.status.as_u16() < 400 {
            return Ok(self);
        }
        let body = self
            .bytes()
            .map(|body| truncate_body(&body))
            .unwrap_or_default();
        Err(HttpClientError::HttpStatus {
            status: self.status.as_u16(),
            method: self.method.clone(),
            uri: self.uri.clone(),
            body,
        })
    }

    /// Frees the underlying connection. An unread body is drained first so
    /// the connection can be reused; if draining fails it is closed. Later
    /// body access fails with [`HttpClientError::ResponseReleased`].
    pub fn release(&mut self) {
        let body = std::mem::replace(&mut self.body, BodyState::Released);
        if let BodyState::Pending(pending) = body {
            let context = ErrorContext {
                method: &self.method,
                uri: &self.uri,
            };
            if let Err(error) = (*pending).read_to_end(context) {
                trace!(error = %error, "discarding connection after failed drain");
            }
        }
    }
}

pub(crate) fn expect_object(value: Value) -> ReqpoolResult<Map<String, Value>> {
    match value {
        Value::Object(object) => Ok(object),
        other => Err(unexpected_shape("object", &other)),
    }
}

pub(crate) fn expect_array(value: Value) -> ReqpoolResult<Vec<Value>> {
    match value {
        Value::Array(array) => Ok(array),
        other => Err(unexpected_shape("array", &other)),
    }
}

fn unexpected_shape(expected: &'static str, value: &Value) -> HttpClientError {
    HttpClientError::UnexpectedJsonShape {
        expected,
        body: truncate_body(value.to_string().as_bytes()),
    }
}

impl std::fmt::Debug for ResponseEnvelope {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = match &self.body {
            BodyState::Pending(_) => "pending",
            BodyState::Buffered(_) => "buffered",
            BodyState::Released => "released",
        };
        formatter
            .debug_struct("ResponseEnvelope")
            .field("status", &self.status)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("body", &body)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::header::CONTENT_TYPE;
    use http::{HeaderMap, HeaderValue, Method, StatusCode};

    use super::ResponseEnvelope;
    use crate::error::HttpClientErrorCode;

    fn envelope(status: u16, content_type: Option<&'static str>, body: &[u8]) -> ResponseEnvelope {
        let mut headers = HeaderMap::new();
        if let Some(content_type) = content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        ResponseEnvelope::buffered(
            StatusCode::from_u16(status).expect("valid status"),
            headers,
            Method::GET,
            "http://example.com/a".to_owned(),
            Bytes::copy_from_slice(body),
        )
    }

    #[test]
    fn json_shapes_are_checked() {
        let mut response = envelope(200, Some("application/json"), br#"{"a":1}"#);
        let object = response.json_object().expect("object");
        assert_eq!(object.get("a"), Some(&serde_json::json!(1)));
        let error = response.json_array().expect_err("not an array");
        assert_eq!(error.code(), HttpClientErrorCode::UnexpectedJsonShape);
        assert!(error.is_decode_error());
    }

    #[test]
    fn invalid_json_is_a_decode_error() {
        let mut response = envelope(200, None, b"not json");
        let error = response.json::<serde_json::Value>().expect_err("invalid json");
        assert_eq!(error.code(), HttpClientErrorCode::Deserialize);
        assert!(error.is_decode_error());
    }

    #[test]
    fn text_follows_content_type_charset() {
        let (encoded, _, _) = encoding_rs::GBK.encode("你好");
        let mut response = envelope(200, Some("text/plain; charset=gbk"), &encoded);
        assert_eq!(response.text().expect("gbk text"), "你好");
        assert_eq!(response.text_with_charset("GBK").expect("explicit gbk"), "你好");
    }

    #[test]
    fn error_for_status_rejects_client_and_server_errors() {
        assert!(envelope(204, None, b"").error_for_status().is_ok());
        let error = envelope(404, None, b"missing")
            .error_for_status()
            .expect_err("404 must fail");
        match error {
            crate::HttpClientError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 404);
                assert_eq!(body, "missing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn released_body_is_no_longer_readable() {
        let mut response = envelope(200, None, b"abc");
        assert_eq!(&response.bytes().expect("body")[..], b"abc");
        response.release();
        assert!(response.is_released());
        let error = response.bytes().expect_err("released");
        assert_eq!(error.code(), HttpClientErrorCode::ResponseReleased);
    }
}
