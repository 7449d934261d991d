use std::fmt;

use http::Uri;

use crate::error::HttpClientError;
use crate::util::redact_uri_for_logs;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        if text.eq_ignore_ascii_case("http") {
            Some(Self::Http)
        } else if text.eq_ignore_ascii_case("https") {
            Some(Self::Https)
        } else {
            None
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Plain-HTTP forward proxy hop.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    host: String,
    port: u16,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn authority(&self) -> String {
        format_authority(&self.host, self.port)
    }
}

/// Pool partition key: the target origin plus the proxy hop, if any.
///
/// Two requests share pooled connections only when both the target and the
/// proxy match, so tunnelled HTTPS connections are never handed to a
/// different origin.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    scheme: Scheme,
    host: String,
    port: u16,
    proxy: Option<ProxyEndpoint>,
}

impl Route {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into().to_ascii_lowercase(),
            port,
            proxy: None,
        }
    }

    pub fn from_uri(uri: &Uri) -> Result<Self, HttpClientError> {
        let invalid = || HttpClientError::InvalidUri {
            uri: redact_uri_for_logs(&uri.to_string()),
        };
        let scheme = uri
            .scheme_str()
            .and_then(Scheme::parse)
            .ok_or_else(invalid)?;
        let host = uri
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = uri.port_u16().unwrap_or(scheme.default_port());
        Ok(Self::new(scheme, host, port))
    }

    pub fn with_proxy(mut self, proxy: ProxyEndpoint) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn without_proxy(mut self) -> Self {
        self.proxy = None;
        self
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        self.proxy.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// HTTPS through a proxy needs a `CONNECT` tunnel.
    pub fn is_tunnelled(&self) -> bool {
        self.proxy.is_some() && self.is_secure()
    }

    /// Plain HTTP through a proxy is forwarded with absolute-form targets.
    pub fn is_forwarded(&self) -> bool {
        self.proxy.is_some() && !self.is_secure()
    }

    /// Host and port of the first socket hop.
    pub fn connect_address(&self) -> (&str, u16) {
        match &self.proxy {
            Some(proxy) => (proxy.host(), proxy.port()),
            None => (&self.host, self.port),
        }
    }

    pub fn authority(&self) -> String {
        format_authority(&self.host, self.port)
    }

    /// Value for the `Host` header; the default port is omitted.
    pub fn host_header(&self) -> String {
        if self.port != self.scheme.default_port() {
            return self.authority();
        }
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}://{}", self.scheme, self.authority())?;
        if let Some(proxy) = &self.proxy {
            write!(formatter, " via {}", proxy.authority())?;
        }
        Ok(())
    }
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
