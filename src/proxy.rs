use http::HeaderValue;

use crate::config::ClientConfig;
use crate::route::{ProxyEndpoint, Route};

/// Chooses the effective route for a target.
///
/// There is no per-destination selection: when enabled, every request goes
/// through the one configured proxy.
#[derive(Clone, Debug, Default)]
pub struct ProxyRoutePlanner {
    proxy: Option<ProxyEndpoint>,
    authorization: Option<HeaderValue>,
}

impl ProxyRoutePlanner {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn fixed(host: impl Into<String>, port: u16) -> Self {
        Self {
            proxy: Some(ProxyEndpoint::new(host, port)),
            authorization: None,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        if !config.proxy_enabled {
            return Self::direct();
        }
        let planner = Self::fixed(config.proxy_host.clone(), config.proxy_port);
        match &config.proxy_authorization {
            Some(authorization) => planner.authorization(authorization.clone()),
            None => planner,
        }
    }

    pub fn authorization(mut self, mut authorization: HeaderValue) -> Self {
        authorization.set_sensitive(true);
        self.authorization = Some(authorization);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.proxy.is_some()
    }

    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        self.proxy.as_ref()
    }

    pub(crate) fn proxy_authorization(&self) -> Option<&HeaderValue> {
        self.authorization.as_ref()
    }

    pub fn plan_route(&self, target: &Route) -> Route {
        match &self.proxy {
            Some(proxy) => target.clone().with_proxy(proxy.clone()),
            None => target.clone(),
        }
    }
}
