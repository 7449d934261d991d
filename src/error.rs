use http::Method;
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    ConnectionClosed,
    Read,
    Write,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::ConnectionClosed => "connection_closed",
            Self::Read => "read",
            Self::Write => "write",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Connect,
    Write,
    Read,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Write => "write",
            Self::Read => "read",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HttpClientErrorCode {
    InvalidUri,
    InvalidConfig,
    ReadConfig,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    Transport,
    Timeout,
    DeadlineExceeded,
    Protocol,
    PoolExhausted,
    PoolShutDown,
    ResponseReleased,
    ResponseBodyTooLarge,
    HttpStatus,
    Deserialize,
    UnexpectedJsonShape,
    DecodeText,
    UnknownCharset,
    TlsBackendUnavailable,
    TlsConfig,
}

impl HttpClientErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidConfig => "invalid_config",
            Self::ReadConfig => "read_config",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Protocol => "protocol",
            Self::PoolExhausted => "pool_exhausted",
            Self::PoolShutDown => "pool_shut_down",
            Self::ResponseReleased => "response_released",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::HttpStatus => "http_status",
            Self::Deserialize => "deserialize",
            Self::UnexpectedJsonShape => "unexpected_json_shape",
            Self::DecodeText => "decode_text",
            Self::UnknownCharset => "unknown_charset",
            Self::TlsBackendUnavailable => "tls_backend_unavailable",
            Self::TlsConfig => "tls_config",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HttpClientError {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid client configuration {key}={value}: {message}")]
    InvalidConfig {
        key: String,
        value: String,
        message: String,
    },
    #[error("failed to read client configuration from {path}: {source}")]
    ReadConfig {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out in {phase} after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("http request deadline exceeded after {timeout_ms}ms for {method} {uri}")]
    DeadlineExceeded {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("malformed http response for {method} {uri}: {message}")]
    Protocol {
        method: Method,
        uri: String,
        message: String,
    },
    #[error("no pooled connection available for {route} within {waited_ms}ms")]
    PoolExhausted { route: String, waited_ms: u128 },
    #[error("connection pool has been shut down")]
    PoolShutDown,
    #[error("response body was already released")]
    ResponseReleased,
    #[error(
        "response body too large ({actual_bytes} bytes > {limit_bytes} bytes) for {method} {uri}"
    )]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("response json is not an {expected}; body={body}")]
    UnexpectedJsonShape { expected: &'static str, body: String },
    #[error("response body is not valid {encoding}")]
    DecodeText { encoding: &'static str },
    #[error("unknown response charset: {label}")]
    UnknownCharset { label: String },
    #[error("https requested but no tls backend is enabled in this build for {uri}")]
    TlsBackendUnavailable { uri: String },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
}

impl HttpClientError {
    pub const fn code(&self) -> HttpClientErrorCode {
        match self {
            Self::InvalidUri { .. } => HttpClientErrorCode::InvalidUri,
            Self::InvalidConfig { .. } => HttpClientErrorCode::InvalidConfig,
            Self::ReadConfig { .. } => HttpClientErrorCode::ReadConfig,
            Self::InvalidHeaderName { .. } => HttpClientErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => HttpClientErrorCode::InvalidHeaderValue,
            Self::SerializeJson { .. } => HttpClientErrorCode::SerializeJson,
            Self::Transport { .. } => HttpClientErrorCode::Transport,
            Self::Timeout { .. } => HttpClientErrorCode::Timeout,
            Self::DeadlineExceeded { .. } => HttpClientErrorCode::DeadlineExceeded,
            Self::Protocol { .. } => HttpClientErrorCode::Protocol,
            Self::PoolExhausted { .. } => HttpClientErrorCode::PoolExhausted,
            Self::PoolShutDown => HttpClientErrorCode::PoolShutDown,
            Self::ResponseReleased => HttpClientErrorCode::ResponseReleased,
            Self::ResponseBodyTooLarge { .. } => HttpClientErrorCode::ResponseBodyTooLarge,
            Self::HttpStatus { .. } => HttpClientErrorCode::HttpStatus,
            Self::Deserialize { .. } => HttpClientErrorCode::Deserialize,
            Self::UnexpectedJsonShape { .. } => HttpClientErrorCode::UnexpectedJsonShape,
            Self::DecodeText { .. } => HttpClientErrorCode::DecodeText,
            Self::UnknownCharset { .. } => HttpClientErrorCode::UnknownCharset,
            Self::TlsBackendUnavailable { .. } => HttpClientErrorCode::TlsBackendUnavailable,
            Self::TlsConfig { .. } => HttpClientErrorCode::TlsConfig,
        }
    }

    /// Conversion failures raised after the exchange completed. These never
    /// cause a request to be sent again.
    pub const fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::Deserialize { .. }
                | Self::UnexpectedJsonShape { .. }
                | Self::DecodeText { .. }
                | Self::UnknownCharset { .. }
        )
    }

    pub const fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub const fn timeout_phase(&self) -> Option<TimeoutPhase> {
        match self {
            Self::Timeout { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}
