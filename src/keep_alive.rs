use std::time::Duration;

use http::HeaderMap;

use crate::config::ClientConfig;

pub(crate) const KEEP_ALIVE_HEADER: &str = "keep-alive";
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Decides how long an idle connection may stay pooled after a response.
///
/// The `timeout` parameter of the `Keep-Alive` response header wins when it
/// is a positive integer number of seconds; anything else falls back to the
/// configured default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAlivePolicy {
    default_duration: Duration,
}

impl KeepAlivePolicy {
    pub fn new(default_duration: Duration) -> Self {
        Self {
            default_duration: default_duration.max(Duration::from_secs(1)),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.keep_alive_time)
    }

    pub fn default_duration(&self) -> Duration {
        self.default_duration
    }

    /// Only the first `timeout` parameter counts; if it is invalid the
    /// default applies even when a later one would parse.
    pub fn evaluate(&self, headers: &HeaderMap) -> Duration {
        headers
            .get_all(KEEP_ALIVE_HEADER)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .find_map(timeout_param)
            .and_then(parse_seconds)
            .map(Duration::from_secs)
            .unwrap_or(self.default_duration)
    }
}

impl Default for KeepAlivePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_KEEP_ALIVE)
    }
}

fn timeout_param(element: &str) -> Option<&str> {
    let (name, value) = element.split_once('=')?;
    name.trim()
        .eq_ignore_ascii_case("timeout")
        .then(|| value.trim().trim_matches('"'))
}

fn parse_seconds(value: &str) -> Option<u64> {
    value.parse::<u64>().ok().filter(|seconds| *seconds > 0)
}
