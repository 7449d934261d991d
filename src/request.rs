use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;

use crate::ReqpoolResult;
use crate::error::HttpClientError;
use crate::util::{parse_header_name, parse_header_value};

/// A fully described request, independent of any client.
///
/// Headers keep insertion order and compare names case-insensitively.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl RequestSpec {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn post(uri: impl Into<String>) -> Self {
        Self::new(Method::POST, uri)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> ReqpoolResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn body_with_content_type(self, body: impl Into<Bytes>, content_type: HeaderValue) -> Self {
        self.body(body).header(CONTENT_TYPE, content_type)
    }

    pub fn json<T>(self, value: &T) -> ReqpoolResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value)
            .map_err(|source| HttpClientError::SerializeJson { source })?;
        Ok(self.body_with_content_type(body, HeaderValue::from_static("application/json")))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn header_map(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Whether the request carries, or by its method is meant to carry, an
    /// entity. Such requests are not resent after generic I/O failures.
    pub fn encloses_entity(&self) -> bool {
        self.body.is_some() || matches!(self.method, Method::POST | Method::PUT | Method::PATCH)
    }
}
