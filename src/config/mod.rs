//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! CLI flags and environment
//!     → ProxyConfig (immutable once built)
//!     → proxy_options() / chained_proxy_uri() (parsed, validated)
//!     → shared with the listener and the upstream connector
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Header maps are validated here so the connector never sees bad input

use std::collections::HashMap;

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::Uri;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proxy::ProxyOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid chained proxy url {url:?}: {source}")]
    InvalidProxyUrl {
        url: String,
        #[source]
        source: hyper::http::uri::InvalidUri,
    },
    #[error("invalid header name {0:?}")]
    InvalidHeaderName(String),
    #[error("invalid value for header {0:?}")]
    InvalidHeaderValue(String),
}

/// Root configuration for the forward proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Next proxy in the chain; absent means origins are contacted directly.
    pub chained_proxy: Option<String>,

    /// Headers always set on the chained-proxy hop.
    pub proxy_headers: HashMap<String, String>,

    /// Headers set on the chained-proxy hop only when the request lacks them.
    pub default_headers: HashMap<String, String>,

    /// Upstream agent behavior.
    pub agent: AgentConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8081").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8081".to_string(),
            max_connections: 1024,
        }
    }
}

/// Upstream agent configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Keep origin connections pooled between requests.
    pub keep_alive: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { keep_alive: true }
    }
}

impl ProxyConfig {
    /// The chained proxy endpoint, parsed. `None` when no chain is set.
    pub fn chained_proxy_uri(&self) -> Result<Option<Uri>, ConfigError> {
        match &self.chained_proxy {
            Some(url) => {
                let uri = url
                    .parse()
                    .map_err(|source| ConfigError::InvalidProxyUrl {
                        url: url.clone(),
                        source,
                    })?;
                Ok(Some(uri))
            }
            None => Ok(None),
        }
    }

    /// Connector options with the header maps validated.
    pub fn proxy_options(&self) -> Result<ProxyOptions, ConfigError> {
        let mut options = ProxyOptions::new();
        options.keep_alive = self.agent.keep_alive;
        options.proxy_headers = build_headers(&self.proxy_headers)?;
        options.default_headers = build_headers(&self.default_headers)?;
        Ok(options)
    }
}

fn build_headers(raw: &HashMap<String, String>) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for (name, value) in raw {
        let name: HeaderName = name
            .parse()
            .map_err(|_| ConfigError::InvalidHeaderName(name.clone()))?;
        let value: HeaderValue = value
            .parse()
            .map_err(|_| ConfigError::InvalidHeaderValue(name.to_string()))?;
        headers.insert(name, value);
    }
    Ok(headers)
}
