use std::thread::sleep;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, PROXY_AUTHORIZATION, TRANSFER_ENCODING, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, Uri};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::ReqpoolResult;
use crate::config::ClientConfig;
use crate::error::{HttpClientError, TimeoutPhase};
use crate::metrics::HttpClientMetricsSnapshot;
use crate::pool::{PoolStats, RouteStats};
use crate::request::RequestSpec;
use crate::response::{PendingBody, ResponseEnvelope};
use crate::retry::{FailureKind, RetryDecision};
use crate::route::Route;
use crate::util::{
    bounded_retry_delay, deadline_exceeded_error, lock_unpoisoned, phase_timeout,
    redact_uri_for_logs, resolve_uri,
};

use super::codec::{BodyFraming, encode_request, read_response_head};
use super::transport::{ConnectOptions, ErrorContext, HttpConnection};
use super::{HttpClient, HttpClientBuilder, HttpConnectionPool, RequestBuilder};

struct PreparedRequest {
    method: Method,
    redacted_uri: String,
    route: Route,
    encoded: Vec<u8>,
    encloses_entity: bool,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Builds every component from one configuration snapshot.
    pub fn from_config(config: ClientConfig) -> ReqpoolResult<Self> {
        HttpClientBuilder::new(config).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &HttpConnectionPool {
        &self.pool
    }

    pub fn request(&self, method: Method, uri: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, uri.into())
    }

    pub fn get(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, uri)
    }

    pub fn post(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, uri)
    }

    pub fn put(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, uri)
    }

    pub fn delete(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, uri)
    }

    pub fn get_bytes(&self, uri: impl Into<String>) -> ReqpoolResult<Bytes> {
        self.get(uri).send_bytes()
    }

    pub fn get_text(&self, uri: impl Into<String>) -> ReqpoolResult<String> {
        self.get(uri).send_text()
    }

    pub fn get_text_with_charset(
        &self,
        uri: impl Into<String>,
        charset: &str,
    ) -> ReqpoolResult<String> {
        self.get(uri).response_charset(charset).send_text()
    }

    pub fn get_json_object(&self, uri: impl Into<String>) -> ReqpoolResult<Map<String, Value>> {
        self.get(uri).send_json_object()
    }

    pub fn get_json_object_with_charset(
        &self,
        uri: impl Into<String>,
        charset: &str,
    ) -> ReqpoolResult<Map<String, Value>> {
        self.get(uri).response_charset(charset).send_json_object()
    }

    pub fn get_json_array(&self, uri: impl Into<String>) -> ReqpoolResult<Vec<Value>> {
        self.get(uri).send_json_array()
    }

    pub fn get_json_array_with_charset(
        &self,
        uri: impl Into<String>,
        charset: &str,
    ) -> ReqpoolResult<Vec<Value>> {
        self.get(uri).response_charset(charset).send_json_array()
    }

    pub fn get_json<T>(&self, uri: impl Into<String>) -> ReqpoolResult<T>
    where
        T: DeserializeOwned,
    {
        self.get(uri).send_json()
    }

    pub fn get_json_with_charset<T>(
        &self,
        uri: impl Into<String>,
        charset: &str,
    ) -> ReqpoolResult<T>
    where
        T: DeserializeOwned,
    {
        self.get(uri).response_charset(charset).send_json()
    }

    pub fn post_bytes(
        &self,
        uri: impl Into<String>,
        body: impl Into<Bytes>,
        headers: HeaderMap,
    ) -> ReqpoolResult<Bytes> {
        self.post(uri).headers(headers).body(body).send_bytes()
    }

    /// Posts a JSON document given as text and returns the response text.
    pub fn post_json_text(
        &self,
        uri: impl Into<String>,
        json: impl Into<String>,
    ) -> ReqpoolResult<String> {
        self.post(uri).json_text(json).send_text()
    }

    pub fn post_json<B, T>(&self, uri: impl Into<String>, body: &B) -> ReqpoolResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.post(uri).json(body)?.send_json()
    }

    pub fn metrics_snapshot(&self) -> HttpClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn route_stats(&self, route: &Route) -> RouteStats {
        self.pool.route_stats(route)
    }

    /// Stops the eviction sweep and closes pooled connections. Calls made
    /// afterwards fail with [`HttpClientError::PoolShutDown`].
    pub fn shutdown(&self) {
        if let Some(mut evictor) = lock_unpoisoned(&self.evictor).take() {
            evictor.stop();
        }
        self.pool.shutdown();
        debug!("http client shut down");
    }

    /// Runs `request` with retries. `timeout_budget` bounds the whole call,
    /// pool wait and backoff included; `None` falls back to the configured
    /// request timeout.
    pub fn execute(
        &self,
        request: RequestSpec,
        timeout_budget: Option<Duration>,
    ) -> ReqpoolResult<ResponseEnvelope> {
        let total_timeout = timeout_budget.or(self.config.request_timeout);
        let started_at = Instant::now();
        self.metrics.record_request_started();
        let _in_flight = self.metrics.enter_in_flight();

        let result = self.execute_with_retries(&request, total_timeout, started_at);
        match &result {
            Ok(response) => self
                .metrics
                .record_request_succeeded(response.status().as_u16(), started_at.elapsed()),
            Err(error) => self.metrics.record_request_failed(error, started_at.elapsed()),
        }
        result
    }

    fn execute_with_retries(
        &self,
        request: &RequestSpec,
        total_timeout: Option<Duration>,
        started_at: Instant,
    ) -> ReqpoolResult<ResponseEnvelope> {
        let prepared = self.prepare(request)?;
        let retry_limit = self.retry_policy.configured_retry_limit();
        let mut attempt = 1_usize;

        loop {
            debug!(
                method = %prepared.method,
                uri = %prepared.redacted_uri,
                route = %prepared.route,
                attempt,
                "sending http request"
            );
            let error = match self.run_once(&prepared, total_timeout, started_at) {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            let Some(failure) = FailureKind::classify(&error) else {
                return Err(error);
            };
            let decision = RetryDecision {
                attempt,
                retry_limit,
                method: prepared.method.clone(),
                uri: prepared.redacted_uri.clone(),
                failure,
                request_has_body: prepared.encloses_entity,
            };
            if !self.retry_policy.should_retry_decision(&decision) {
                debug!(
                    method = %prepared.method,
                    uri = %prepared.redacted_uri,
                    attempt,
                    failure = ?failure,
                    "not retrying http request"
                );
                return Err(error);
            }

            let backoff = self.retry_policy.backoff_for_retry(attempt);
            let Some(backoff) = bounded_retry_delay(backoff, total_timeout, started_at) else {
                return Err(deadline_exceeded_error(
                    total_timeout,
                    &prepared.method,
                    &prepared.redacted_uri,
                ));
            };
            warn!(
                method = %prepared.method,
                uri = %prepared.redacted_uri,
                attempt,
                retry_limit,
                delay_ms = backoff.as_millis() as u64,
                error = %error,
                "retrying http request"
            );
            self.metrics.record_retry();
            if !backoff.is_zero() {
                sleep(backoff);
            }
            attempt += 1;
        }
    }

    fn prepare(&self, request: &RequestSpec) -> ReqpoolResult<PreparedRequest> {
        let (uri_text, uri) = resolve_uri(request.uri(), self.config.infer_missing_scheme)?;
        let redacted_uri = redact_uri_for_logs(&uri_text);
        let target = Route::from_uri(&uri)?;
        let route = self.proxy_planner.plan_route(&target);

        let request_target = if route.is_forwarded() {
            absolute_form(&uri)
        } else {
            origin_form(&uri)
        };
        let headers = self.request_headers(request, &route);
        let encoded = encode_request(
            request.method(),
            &request_target,
            &headers,
            request.body_bytes().map(|body| body.as_ref()),
        );

        Ok(PreparedRequest {
            method: request.method().clone(),
            redacted_uri,
            route,
            encoded,
            encloses_entity: request.encloses_entity(),
        })
    }

    fn request_headers(&self, request: &RequestSpec, route: &Route) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(host) = HeaderValue::from_str(&route.host_header()) {
            headers.insert(HOST, host);
        }
        headers.insert(USER_AGENT, self.user_agent.clone());
        for (name, value) in &self.default_headers {
            headers.insert(name.clone(), value.clone());
        }
        for name in request.header_map().keys() {
            headers.remove(name);
        }
        for (name, value) in request.header_map() {
            headers.append(name.clone(), value.clone());
        }
        headers.remove(TRANSFER_ENCODING);
        headers.remove(CONTENT_LENGTH);

        match request.body_bytes() {
            Some(body) => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            }
            None if request.encloses_entity() => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            }
            None => {}
        }
        if route.is_forwarded()
            && let Some(authorization) = self.proxy_planner.proxy_authorization()
        {
            headers.insert(PROXY_AUTHORIZATION, authorization.clone());
        }
        headers
    }

    fn run_once(
        &self,
        prepared: &PreparedRequest,
        total_timeout: Option<Duration>,
        started_at: Instant,
    ) -> ReqpoolResult<ResponseEnvelope> {
        let method = &prepared.method;
        let context = ErrorContext {
            method,
            uri: &prepared.redacted_uri,
        };
        let deadline_error =
            || deadline_exceeded_error(total_timeout, method, &prepared.redacted_uri);
        let socket_timeout = self.config.socket_timeout;
        let body_limit = self.config.max_response_body_bytes;

        let acquire_timeout = phase_timeout(
            self.config.connection_request_timeout,
            total_timeout,
            started_at,
        )
        .ok_or_else(deadline_error)?;
        let mut connection = self.pool.acquire(&prepared.route, acquire_timeout, |route| {
            let connect_timeout =
                phase_timeout(self.config.connect_timeout, total_timeout, started_at)
                    .ok_or_else(deadline_error)?;
            let options = ConnectOptions {
                connect_timeout,
                user_agent: &self.config.user_agent,
                proxy_authorization: self.proxy_planner.proxy_authorization(),
                tls: &self.tls,
            };
            HttpConnection::connect(route, &options, context)
        })?;
        self.metrics.record_attempt(connection.is_reused());

        let io_timeout =
            phase_timeout(socket_timeout, total_timeout, started_at).ok_or_else(deadline_error)?;
        let deadline = total_timeout.and_then(|timeout| started_at.checked_add(timeout));
        connection.set_deadline(socket_timeout, deadline);
        connection
            .send(&prepared.encoded)
            .map_err(|error| context.io(error, TimeoutPhase::Write, io_timeout))?;

        let head = read_response_head(connection.reader())
            .map_err(|error| context.wire(error, TimeoutPhase::Read, io_timeout, body_limit))?;
        let framing = BodyFraming::for_response(method, &head)
            .map_err(|error| context.wire(error, TimeoutPhase::Read, io_timeout, body_limit))?;

        let reusable = head.keeps_connection_open() && framing.is_delimited();
        let keep_alive = self.keep_alive_policy.evaluate(&head.headers);
        debug!(
            method = %method,
            uri = %prepared.redacted_uri,
            status = head.status.as_u16(),
            reused_connection = connection.is_reused(),
            reusable,
            keep_alive_ms = keep_alive.as_millis() as u64,
            "received http response"
        );

        if framing == BodyFraming::Empty {
            if reusable {
                connection.set_valid_for(keep_alive);
            }
            connection.release(reusable);
            return Ok(ResponseEnvelope::buffered(
                head.status,
                head.headers,
                method.clone(),
                prepared.redacted_uri.clone(),
                Bytes::new(),
            ));
        }

        Ok(ResponseEnvelope::pending(
            head.status,
            head.headers,
            method.clone(),
            prepared.redacted_uri.clone(),
            PendingBody {
                connection,
                framing,
                reusable,
                keep_alive,
                io_timeout,
                limit_bytes: body_limit,
            },
        ))
    }
}

fn origin_form(uri: &Uri) -> String {
    match uri.query() {
        Some(query) => format!("{}?{query}", uri.path()),
        None => uri.path().to_owned(),
    }
}

fn absolute_form(uri: &Uri) -> String {
    let scheme = uri.scheme_str().unwrap_or("http");
    let authority = uri.authority().map(|authority| authority.as_str()).unwrap_or_default();
    format!("{scheme}://{authority}{}", origin_form(uri))
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        if let Some(mut evictor) = lock_unpoisoned(&self.evictor).take() {
            evictor.stop();
        }
    }
}
