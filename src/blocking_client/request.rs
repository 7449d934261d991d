use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::ReqpoolResult;
use crate::request::RequestSpec;
use crate::response::{ResponseEnvelope, expect_array, expect_object};

use super::HttpClient;

pub struct RequestBuilder<'a> {
    client: &'a HttpClient,
    spec: RequestSpec,
    timeout: Option<Duration>,
    response_charset: Option<String>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a HttpClient, method: Method, uri: String) -> Self {
        Self {
            client,
            spec: RequestSpec::new(method, uri),
            timeout: None,
            response_charset: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.spec = self.spec.header(name, value);
        self
    }

    pub fn try_header(mut self, name: &str, value: &str) -> ReqpoolResult<Self> {
        self.spec = self.spec.try_header(name, value)?;
        Ok(self)
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.spec = self.spec.headers(headers);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.spec = self.spec.body(body);
        self
    }

    pub fn json<T>(mut self, value: &T) -> ReqpoolResult<Self>
    where
        T: Serialize + ?Sized,
    {
        self.spec = self.spec.json(value)?;
        Ok(self)
    }

    /// Sends already serialized JSON as-is.
    pub fn json_text(mut self, json: impl Into<String>) -> Self {
        self.spec = self.spec.body_with_content_type(
            json.into(),
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        self
    }

    /// Overall budget for this call, pool wait and retries included.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    /// Charset used by the text and JSON helpers instead of the one the
    /// response announces.
    pub fn response_charset(mut self, charset: impl Into<String>) -> Self {
        self.response_charset = Some(charset.into());
        self
    }

    /// Returns the response whatever its status; the caller owns release.
    pub fn send(self) -> ReqpoolResult<ResponseEnvelope> {
        self.client.execute(self.spec, self.timeout)
    }

    fn send_checked(self) -> ReqpoolResult<(ResponseEnvelope, Option<String>)> {
        let charset = self.response_charset.clone();
        let response = self.send()?.error_for_status()?;
        Ok((response, charset))
    }

    pub fn send_bytes(self) -> ReqpoolResult<Bytes> {
        let (mut response, _) = self.send_checked()?;
        response.bytes()
    }

    pub fn send_text(self) -> ReqpoolResult<String> {
        let (mut response, charset) = self.send_checked()?;
        match charset {
            Some(charset) => response.text_with_charset(&charset),
            None => response.text(),
        }
    }

    pub fn send_json<T>(self) -> ReqpoolResult<T>
    where
        T: DeserializeOwned,
    {
        let (mut response, charset) = self.send_checked()?;
        match charset {
            Some(charset) => response.json_with_charset(&charset),
            None => response.json(),
        }
    }

    pub fn send_json_object(self) -> ReqpoolResult<Map<String, Value>> {
        expect_object(self.send_json()?)
    }

    pub fn send_json_array(self) -> ReqpoolResult<Vec<Value>> {
        expect_array(self.send_json()?)
    }
}

impl std::fmt::Debug for RequestBuilder<'_> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestBuilder")
            .field("method", self.spec.method())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

