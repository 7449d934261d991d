use std::path::Path;
use std::time::Duration;

use http::HeaderValue;
use tracing::debug;

use crate::error::HttpClientError;

const PROPERTY_PREFIX: &str = "httpclient.config.";
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Startup snapshot shared by every client component.
///
/// Build it with the `with_*` setters (or load it from a properties file),
/// then hand it to [`HttpClient::from_config`](crate::HttpClient::from_config).
/// The client freezes it behind an `Arc`; pool, retry, keep-alive and proxy
/// policies are all derived from the same snapshot.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub keep_alive_time: Duration,
    pub retry_limit: usize,
    pub max_total_connections: usize,
    pub max_per_route: usize,
    pub idle_time_to_live: Duration,
    pub proxy_enabled: bool,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub proxy_authorization: Option<HeaderValue>,
    pub connect_timeout: Duration,
    pub connection_request_timeout: Duration,
    pub socket_timeout: Duration,
    pub request_timeout: Option<Duration>,
    pub max_response_body_bytes: usize,
    pub user_agent: String,
    pub idle_eviction_interval: Option<Duration>,
    pub infer_missing_scheme: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keep_alive_time: Duration::from_secs(30),
            retry_limit: 3,
            max_total_connections: 100,
            max_per_route: 20,
            idle_time_to_live: Duration::from_secs(60),
            proxy_enabled: false,
            proxy_host: "127.0.0.1".to_owned(),
            proxy_port: 8080,
            proxy_authorization: None,
            connect_timeout: Duration::from_millis(2000),
            connection_request_timeout: Duration::from_millis(2000),
            socket_timeout: Duration::from_millis(2000),
            request_timeout: None,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            user_agent: concat!("reqpool/", env!("CARGO_PKG_VERSION")).to_owned(),
            idle_eviction_interval: None,
            infer_missing_scheme: false,
        }
    }
}

impl ClientConfig {
    pub fn with_keep_alive_time(mut self, keep_alive_time: Duration) -> Self {
        self.keep_alive_time = keep_alive_time.max(Duration::from_secs(1));
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: usize) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_max_total_connections(mut self, max_total_connections: usize) -> Self {
        self.max_total_connections = max_total_connections.max(1);
        self
    }

    pub fn with_max_per_route(mut self, max_per_route: usize) -> Self {
        self.max_per_route = max_per_route.max(1);
        self
    }

    pub fn with_idle_time_to_live(mut self, idle_time_to_live: Duration) -> Self {
        self.idle_time_to_live = idle_time_to_live.max(Duration::from_millis(1));
        self
    }

    pub fn with_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy_enabled = true;
        self.proxy_host = host.into();
        self.proxy_port = port;
        self
    }

    pub fn with_proxy_enabled(mut self, proxy_enabled: bool) -> Self {
        self.proxy_enabled = proxy_enabled;
        self
    }

    pub fn with_proxy_authorization(mut self, mut proxy_authorization: HeaderValue) -> Self {
        proxy_authorization.set_sensitive(true);
        self.proxy_authorization = Some(proxy_authorization);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_connection_request_timeout(mut self, connection_request_timeout: Duration) -> Self {
        self.connection_request_timeout = connection_request_timeout;
        self
    }

    pub fn with_socket_timeout(mut self, socket_timeout: Duration) -> Self {
        self.socket_timeout = socket_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn with_max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_idle_eviction_interval(mut self, interval: Duration) -> Self {
        self.idle_eviction_interval = Some(interval.max(Duration::from_millis(10)));
        self
    }

    pub fn with_infer_missing_scheme(mut self, infer_missing_scheme: bool) -> Self {
        self.infer_missing_scheme = infer_missing_scheme;
        self
    }

    pub fn from_properties_file(path: impl AsRef<Path>) -> crate::ReqpoolResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| HttpClientError::ReadConfig {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_properties(&text)
    }

    /// Reads `httpclient.config.*` entries in Java properties syntax
    /// (`key=value` or `key: value`, `#`/`!` comments). Keys that are absent
    /// keep their defaults.
    pub fn from_properties(text: &str) -> crate::ReqpoolResult<Self> {
        let mut config = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some((key, value)) = line.split_once(['=', ':']) else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            let Some(name) = key.strip_prefix(PROPERTY_PREFIX) else {
                debug!(key, "ignoring property outside httpclient.config namespace");
                continue;
            };
            config = config.apply_property(key, name, value)?;
        }
        Ok(config)
    }

    fn apply_property(self, key: &str, name: &str, value: &str) -> crate::ReqpoolResult<Self> {
        let config = match name {
            "keepAliveTime" => self.with_keep_alive_time(secs(key, value)?),
            "retryTime" => self.with_retry_limit(number(key, value)?),
            "connMaxTotal" => self.with_max_total_connections(number(key, value)?),
            "maxPerRoute" => self.with_max_per_route(number(key, value)?),
            "timeToLive" => self.with_idle_time_to_live(secs(key, value)?),
            "proxy" => self.with_proxy_enabled(flag(key, value)?),
            "proxyHost" => Self {
                proxy_host: value.to_owned(),
                ..self
            },
            "proxyPort" => Self {
                proxy_port: number(key, value)?,
                ..self
            },
            "proxyAuthorization" => {
                let header = HeaderValue::from_str(value)
                    .map_err(|source| invalid(key, value, source.to_string()))?;
                self.with_proxy_authorization(header)
            }
            "connectTimeout" => self.with_connect_timeout(millis(key, value)?),
            "connectRequestTimeout" => self.with_connection_request_timeout(millis(key, value)?),
            "socketTimeout" => self.with_socket_timeout(millis(key, value)?),
            "requestTimeout" => self.with_request_timeout(millis(key, value)?),
            "maxResponseBodyBytes" => self.with_max_response_body_bytes(number(key, value)?),
            "userAgent" => self.with_user_agent(value),
            "idleEvictionInterval" => self.with_idle_eviction_interval(millis(key, value)?),
            "inferMissingScheme" => self.with_infer_missing_scheme(flag(key, value)?),
            _ => {
                debug!(key, "ignoring unknown client property");
                self
            }
        };
        Ok(config)
    }
}

fn invalid(key: &str, value: &str, message: impl Into<String>) -> HttpClientError {
    HttpClientError::InvalidConfig {
        key: key.to_owned(),
        value: value.to_owned(),
        message: message.into(),
    }
}

fn number<T>(key: &str, value: &str) -> crate::ReqpoolResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|source| invalid(key, value, source.to_string()))
}

fn secs(key: &str, value: &str) -> crate::ReqpoolResult<Duration> {
    number::<u64>(key, value).map(Duration::from_secs)
}

fn millis(key: &str, value: &str) -> crate::ReqpoolResult<Duration> {
    number::<u64>(key, value).map(Duration::from_millis)
}

fn flag(key: &str, value: &str) -> crate::ReqpoolResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}
