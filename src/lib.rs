//! `reqpool` is a blocking HTTP/1.1 client facade built around a bounded,
//! per-route connection pool.
//!
//! One [`ClientConfig`] snapshot drives every component: the
//! [`ConnectionPoolManager`] (global and per-route caps, idle TTL), the
//! [`KeepAlivePolicy`] (how long a released connection may be reused), the
//! [`RetryPolicy`] (an ordered decision table over transport failures) and
//! the [`ProxyRoutePlanner`] (one fixed forward proxy for every route).
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqpool::prelude::{ClientConfig, HttpClient};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::default()
//!         .with_retry_limit(3)
//!         .with_max_per_route(8)
//!         .with_keep_alive_time(Duration::from_secs(20));
//!     let client = HttpClient::from_config(config)?;
//!
//!     let item = client.get_json_object("http://api.example.com/v1/items/7")?;
//!     println!("name={:?}", item.get("name"));
//!
//!     let echoed = client.post_json_text("http://api.example.com/v1/echo", r#"{"a":1}"#)?;
//!     println!("{echoed}");
//!     Ok(())
//! }
//! ```
//!
//! # Retries
//!
//! A request is resent only for transport failures, never for HTTP status
//! errors, pool exhaustion or decode failures. The standard table retries a
//! closed connection or a timeout, gives up on DNS and TLS failures, and
//! retries other I/O failures only when the request carries no entity.
//!
//! # Releasing connections
//!
//! The convenience helpers read the whole body and hand the connection back
//! to the pool. When using [`RequestBuilder::send`] directly, read the body or
//! call [`ResponseEnvelope::release`]; dropping an unread envelope closes the
//! connection instead of reusing it.

mod blocking_client;
mod config;
mod error;
mod keep_alive;
mod metrics;
mod pool;
mod proxy;
mod request;
mod response;
mod retry;
mod route;
mod util;

pub use crate::blocking_client::{
    HttpClient, HttpClientBuilder, HttpConnection, HttpConnectionPool, RequestBuilder,
};
pub use crate::config::ClientConfig;
pub use crate::error::{HttpClientError, HttpClientErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::keep_alive::KeepAlivePolicy;
pub use crate::metrics::HttpClientMetricsSnapshot;
pub use crate::pool::{
    ConnectionPoolManager, IdleConnectionEvictor, PoolSettings, PoolStats, Poolable,
    PooledConnection, RouteStats,
};
pub use crate::proxy::ProxyRoutePlanner;
pub use crate::request::RequestSpec;
pub use crate::response::ResponseEnvelope;
pub use crate::retry::{FailureKind, RetryClassifier, RetryDecision, RetryPolicy};
pub use crate::route::{ProxyEndpoint, Route, Scheme};

pub type ReqpoolResult<T> = std::result::Result<T, HttpClientError>;

pub mod prelude {
    pub use crate::{
        ClientConfig, FailureKind, HttpClient, HttpClientError, HttpClientErrorCode,
        HttpClientMetricsSnapshot, KeepAlivePolicy, ProxyRoutePlanner, ReqpoolResult,
        RequestSpec, ResponseEnvelope, RetryClassifier, RetryDecision, RetryPolicy, Route,
        TimeoutPhase, TransportErrorKind,
    };
}
