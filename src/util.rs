use std::borrow::Cow;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use encoding_rs::{Encoding, UTF_8};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};

use crate::error::HttpClientError;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Strips credentials, query and fragment so URIs can be logged or carried
/// in error messages.
pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        return uri_text
            .split(['?', '#'])
            .next()
            .unwrap_or(uri_text)
            .to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

/// Parses an absolute `http`/`https` URL. With `infer_missing_scheme`, input
/// without a scheme is retried once as `http://{input}`.
pub(crate) fn resolve_uri(
    raw: &str,
    infer_missing_scheme: bool,
) -> Result<(String, Uri), HttpClientError> {
    let trimmed = raw.trim();
    let uri_text = if infer_missing_scheme && !trimmed.contains("://") {
        format!("http://{trimmed}")
    } else {
        trimmed.to_owned()
    };
    let invalid = || HttpClientError::InvalidUri {
        uri: redact_uri_for_logs(raw),
    };
    let uri: Uri = uri_text.parse().map_err(|_| invalid())?;
    if uri.scheme().is_none() || uri.host().is_none_or(str::is_empty) {
        return Err(invalid());
    }
    Ok((uri_text, uri))
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, HttpClientError> {
    name.parse()
        .map_err(|source| HttpClientError::InvalidHeaderName {
            name: name.to_owned(),
            source,
        })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, HttpClientError> {
    value
        .parse()
        .map_err(|source| HttpClientError::InvalidHeaderValue {
            name: name.to_owned(),
            source,
        })
}

/// Per-phase timeout capped by what is left of the overall budget. `None`
/// once the budget is spent.
pub(crate) fn phase_timeout(
    per_phase_timeout: Duration,
    total_timeout: Option<Duration>,
    request_started_at: Instant,
) -> Option<Duration> {
    let Some(total_timeout) = total_timeout else {
        return Some(per_phase_timeout);
    };

    let elapsed = request_started_at.elapsed();
    if elapsed >= total_timeout {
        return None;
    }

    let remaining = total_timeout - elapsed;
    Some(per_phase_timeout.min(remaining))
}

/// `None` when sleeping for `retry_delay` would run past the budget.
pub(crate) fn bounded_retry_delay(
    retry_delay: Duration,
    total_timeout: Option<Duration>,
    request_started_at: Instant,
) -> Option<Duration> {
    let Some(total_timeout) = total_timeout else {
        return Some(retry_delay);
    };

    let elapsed = request_started_at.elapsed();
    if elapsed >= total_timeout {
        return None;
    }

    let remaining = total_timeout - elapsed;
    if retry_delay >= remaining {
        return None;
    }
    Some(retry_delay)
}

pub(crate) fn deadline_exceeded_error(
    total_timeout: Option<Duration>,
    method: &Method,
    uri: &str,
) -> HttpClientError {
    let timeout_ms = total_timeout.map(|item| item.as_millis()).unwrap_or(0);
    HttpClientError::DeadlineExceeded {
        timeout_ms,
        method: method.clone(),
        uri: uri.to_owned(),
    }
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}

pub(crate) fn encoding_for_label(label: &str) -> Result<&'static Encoding, HttpClientError> {
    Encoding::for_label(label.trim().as_bytes()).ok_or_else(|| HttpClientError::UnknownCharset {
        label: label.to_owned(),
    })
}

/// The `charset` parameter of `Content-Type`, if any.
pub(crate) fn content_type_charset(headers: &HeaderMap) -> Option<&str> {
    let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// Decodes `body`, dropping a leading BOM. Malformed input is an error
/// rather than silently replaced.
pub(crate) fn decode_text(
    body: &[u8],
    encoding: &'static Encoding,
) -> Result<String, HttpClientError> {
    let (text, had_errors) = encoding.decode_with_bom_removal(body);
    if had_errors {
        return Err(HttpClientError::DecodeText {
            encoding: encoding.name(),
        });
    }
    Ok(match text {
        Cow::Borrowed(text) => text.to_owned(),
        Cow::Owned(text) => text,
    })
}

/// Encoding announced by the response, UTF-8 when absent. An unknown label
/// also falls back to UTF-8.
pub(crate) fn response_encoding(headers: &HeaderMap) -> &'static Encoding {
    content_type_charset(headers)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8)
}
