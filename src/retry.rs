use std::sync::Arc;
use std::time::Duration;

use http::Method;
use rand::Rng;

use crate::config::ClientConfig;
use crate::error::{HttpClientError, TransportErrorKind};

/// Failure classes the retry table distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The peer closed the connection before sending a response.
    ConnectionClosed,
    /// Connect, read or write timed out.
    Timeout,
    UnresolvedHost,
    TlsHandshake,
    /// Any other transport or framing failure.
    Io,
}

impl FailureKind {
    /// `None` for failures that are not transport-level (pool exhaustion,
    /// status or decode errors, invalid input); those are never resent.
    pub fn classify(error: &HttpClientError) -> Option<Self> {
        match error {
            HttpClientError::Transport { kind, .. } => Some(match kind {
                TransportErrorKind::ConnectionClosed => Self::ConnectionClosed,
                TransportErrorKind::Dns => Self::UnresolvedHost,
                TransportErrorKind::Tls => Self::TlsHandshake,
                TransportErrorKind::Connect
                | TransportErrorKind::Read
                | TransportErrorKind::Write
                | TransportErrorKind::Other => Self::Io,
            }),
            HttpClientError::Timeout { .. } => Some(Self::Timeout),
            HttpClientError::Protocol { .. } => Some(Self::Io),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub attempt: usize,
    pub retry_limit: usize,
    pub method: Method,
    pub uri: String,
    pub failure: FailureKind,
    pub request_has_body: bool,
}

pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

#[derive(Clone)]
pub struct RetryPolicy {
    retry_limit: usize,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("retry_limit", &self.retry_limit)
            .field("base_backoff", &self.base_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("custom_classifier", &self.retry_classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self::with_limit(1)
    }

    pub fn standard() -> Self {
        Self::with_limit(3)
    }

    /// `retry_limit` counts total attempts, the first one included.
    pub fn with_limit(retry_limit: usize) -> Self {
        Self {
            retry_limit,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter_ratio: 0.0,
            retry_classifier: None,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::with_limit(config.retry_limit)
    }

    pub fn retry_limit(mut self, retry_limit: usize) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub fn configured_retry_limit(&self) -> usize {
        self.retry_limit
    }

    /// The default decision table. First matching rule wins:
    ///
    /// 1. `attempt_count >= retry_limit` never retries.
    /// 2. A connection closed by the peer is retried.
    /// 3. A timeout is retried.
    /// 4. An unresolved host is not retried.
    /// 5. A TLS handshake failure is not retried.
    /// 6. Anything else is retried only for requests without a body.
    pub fn should_retry(
        &self,
        failure: FailureKind,
        attempt_count: usize,
        request_has_body: bool,
    ) -> bool {
        if attempt_count >= self.retry_limit {
            return false;
        }
        match failure {
            FailureKind::ConnectionClosed => true,
            FailureKind::Timeout => true,
            FailureKind::UnresolvedHost => false,
            FailureKind::TlsHandshake => false,
            FailureKind::Io => !request_has_body,
        }
    }

    pub(crate) fn should_retry_decision(&self, decision: &RetryDecision) -> bool {
        if decision.attempt >= self.retry_limit {
            return false;
        }
        if let Some(retry_classifier) = &self.retry_classifier {
            return retry_classifier.should_retry(decision);
        }
        self.should_retry(
            decision.failure,
            decision.attempt,
            decision.request_has_body,
        )
    }

    pub(crate) fn backoff_for_retry(&self, retry_index: usize) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let capped_exponent = retry_index.saturating_sub(1).min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base_backoff.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }
        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let sampled_ms = rand::rng()
            .random_range(low..=high)
            .min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
