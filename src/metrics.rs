use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{HttpClientError, TimeoutPhase};
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug)]
pub struct HttpClientMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub connections_opened: u64,
    pub connections_reused: u64,
    pub timeout_connect: u64,
    pub timeout_write: u64,
    pub timeout_read: u64,
    pub deadline_exceeded: u64,
    pub transport_errors: u64,
    pub protocol_errors: u64,
    pub pool_exhausted: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct HttpClientMetrics {
    inner: Arc<HttpClientMetricsInner>,
}

#[derive(Debug, Default)]
struct HttpClientMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    connections_opened: AtomicU64,
    connections_reused: AtomicU64,
    timeout_connect: AtomicU64,
    timeout_write: AtomicU64,
    timeout_read: AtomicU64,
    deadline_exceeded: AtomicU64,
    transport_errors: AtomicU64,
    protocol_errors: AtomicU64,
    pool_exhausted: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    metrics: HttpClientMetrics,
}

impl HttpClientMetrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_attempt(&self, reused_connection: bool) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
        if reused_connection {
            self.inner.connections_reused.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.connections_opened.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_succeeded(&self, status: u16, latency: Duration) {
        self.inner
            .requests_succeeded
            .fetch_add(1, Ordering::Relaxed);
        self.add_status_count(status);
        self.record_latency(latency);
    }

    pub(crate) fn record_request_failed(&self, error: &HttpClientError, latency: Duration) {
        self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
        match error {
            HttpClientError::Timeout { phase, .. } => {
                let counter = match phase {
                    TimeoutPhase::Connect => &self.inner.timeout_connect,
                    TimeoutPhase::Write => &self.inner.timeout_write,
                    TimeoutPhase::Read => &self.inner.timeout_read,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(format!("timeout:{phase}"));
            }
            HttpClientError::DeadlineExceeded { .. } => {
                self.inner.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
                self.add_error_count("deadline_exceeded".to_owned());
            }
            HttpClientError::Transport { kind, .. } => {
                self.inner.transport_errors.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(format!("transport:{kind}"));
            }
            HttpClientError::Protocol { .. } => {
                self.inner.protocol_errors.fetch_add(1, Ordering::Relaxed);
                self.add_error_count("protocol".to_owned());
            }
            HttpClientError::PoolExhausted { .. } => {
                self.inner.pool_exhausted.fetch_add(1, Ordering::Relaxed);
                self.add_error_count("pool_exhausted".to_owned());
            }
            other => {
                self.add_error_count(other.code().as_str().to_owned());
            }
        }
    }

    pub(crate) fn snapshot(&self) -> HttpClientMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let inner = &self.inner;
        let latency_samples = load(&inner.latency_samples);
        let latency_total_ms = load(&inner.latency_total_ms);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        HttpClientMetricsSnapshot {
            requests_started: load(&inner.requests_started),
            requests_succeeded: load(&inner.requests_succeeded),
            requests_failed: load(&inner.requests_failed),
            attempts: load(&inner.attempts),
            retries: load(&inner.retries),
            connections_opened: load(&inner.connections_opened),
            connections_reused: load(&inner.connections_reused),
            timeout_connect: load(&inner.timeout_connect),
            timeout_write: load(&inner.timeout_write),
            timeout_read: load(&inner.timeout_read),
            deadline_exceeded: load(&inner.deadline_exceeded),
            transport_errors: load(&inner.transport_errors),
            protocol_errors: load(&inner.protocol_errors),
            pool_exhausted: load(&inner.pool_exhausted),
            in_flight: load(&inner.in_flight),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }

    fn add_status_count(&self, status: u16) {
        let mut status_counts = lock_unpoisoned(&self.inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, error_key: String) {
        let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
