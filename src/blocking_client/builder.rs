use std::sync::{Arc, Mutex};

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use tracing::debug;

use crate::ReqpoolResult;
use crate::config::ClientConfig;
use crate::keep_alive::KeepAlivePolicy;
use crate::metrics::HttpClientMetrics;
use crate::pool::IdleConnectionEvictor;
use crate::proxy::ProxyRoutePlanner;
use crate::retry::RetryPolicy;
use crate::util::{parse_header_name, parse_header_value};

use super::transport::TlsConnector;
use super::{HttpClient, HttpClientBuilder, HttpConnectionPool};

impl HttpClientBuilder {
    pub(crate) fn new(config: ClientConfig) -> Self {
        Self {
            config,
            pool: None,
            retry_policy: None,
            keep_alive_policy: None,
            proxy_planner: None,
            default_headers: HeaderMap::new(),
            tls: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares an existing pool, e.g. between clients with different retry
    /// policies. Its caps win over the config's.
    pub fn pool(mut self, pool: HttpConnectionPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn keep_alive_policy(mut self, keep_alive_policy: KeepAlivePolicy) -> Self {
        self.keep_alive_policy = Some(keep_alive_policy);
        self
    }

    pub fn proxy_planner(mut self, proxy_planner: ProxyRoutePlanner) -> Self {
        self.proxy_planner = Some(proxy_planner);
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> ReqpoolResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    /// Replaces the built-in webpki trust roots.
    #[cfg(feature = "tls-rustls-ring")]
    pub fn tls_config(mut self, tls_config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(TlsConnector::from_rustls(tls_config));
        self
    }

    pub fn build(self) -> ReqpoolResult<HttpClient> {
        let config = Arc::new(self.config);
        let user_agent = parse_header_value("user-agent", &config.user_agent)?;
        let tls = match self.tls {
            Some(tls) => tls,
            None => TlsConnector::webpki_roots()?,
        };

        let pool = self
            .pool
            .unwrap_or_else(|| HttpConnectionPool::from_config(&config));
        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| RetryPolicy::from_config(&config));
        let keep_alive_policy = self
            .keep_alive_policy
            .unwrap_or_else(|| KeepAlivePolicy::from_config(&config));
        let proxy_planner = self
            .proxy_planner
            .unwrap_or_else(|| ProxyRoutePlanner::from_config(&config));
        let evictor = config
            .idle_eviction_interval
            .map(|interval| IdleConnectionEvictor::start(&pool, interval));

        let settings = pool.settings();
        debug!(
            max_total = settings.max_total,
            max_per_route = settings.max_per_route,
            retry_limit = retry_policy.configured_retry_limit(),
            keep_alive_ms = keep_alive_policy.default_duration().as_millis() as u64,
            proxy = ?proxy_planner.proxy().map(|proxy| proxy.authority()),
            idle_eviction = evictor.is_some(),
            "http client initialized"
        );

        Ok(HttpClient {
            config,
            pool,
            retry_policy,
            keep_alive_policy,
            proxy_planner,
            default_headers: self.default_headers,
            user_agent,
            tls,
            metrics: HttpClientMetrics::default(),
            evictor: Mutex::new(evictor),
        })
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}
