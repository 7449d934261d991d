use std::sync::{Arc, Mutex};

use http::{HeaderMap, HeaderValue};

use crate::config::ClientConfig;
use crate::keep_alive::KeepAlivePolicy;
use crate::metrics::HttpClientMetrics;
use crate::pool::{ConnectionPoolManager, IdleConnectionEvictor};
use crate::proxy::ProxyRoutePlanner;
use crate::retry::RetryPolicy;

mod builder;
pub(crate) mod codec;
mod execute;
mod request;
pub(crate) mod transport;

pub use request::RequestBuilder;
pub use transport::HttpConnection;

use transport::TlsConnector;

/// Pool type the blocking client leases its sockets from.
pub type HttpConnectionPool = ConnectionPoolManager<HttpConnection>;

pub struct HttpClientBuilder {
    config: ClientConfig,
    pool: Option<HttpConnectionPool>,
    retry_policy: Option<RetryPolicy>,
    keep_alive_policy: Option<KeepAlivePolicy>,
    proxy_planner: Option<ProxyRoutePlanner>,
    default_headers: HeaderMap,
    tls: Option<TlsConnector>,
}

impl std::fmt::Debug for HttpClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClientBuilder")
            .field("config", &self.config)
            .field("retry_policy", &self.retry_policy)
            .field("keep_alive_policy", &self.keep_alive_policy)
            .field("proxy_planner", &self.proxy_planner)
            .finish_non_exhaustive()
    }
}

/// Blocking HTTP/1.1 client over a shared connection pool.
///
/// Safe to share between threads; every call leases its own connection.
pub struct HttpClient {
    config: Arc<ClientConfig>,
    pool: HttpConnectionPool,
    retry_policy: RetryPolicy,
    keep_alive_policy: KeepAlivePolicy,
    proxy_planner: ProxyRoutePlanner,
    default_headers: HeaderMap,
    user_agent: HeaderValue,
    tls: TlsConnector,
    metrics: HttpClientMetrics,
    evictor: Mutex<Option<IdleConnectionEvictor>>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClient")
            .field("config", &self.config)
            .field("retry_policy", &self.retry_policy)
            .field("keep_alive_policy", &self.keep_alive_policy)
            .field("proxy_planner", &self.proxy_planner)
            .finish_non_exhaustive()
    }
}
