//! Proxy middleware provider.
//!
//! # Responsibilities
//! - Build the request-forwarding and CONNECT-tunneling middlewares over a
//!   shared upstream connector
//! - Select the direct or chained connector from configuration

pub mod chained;
pub mod forward;
pub mod tunnel;
pub mod upstream;

use std::sync::Arc;

use hyper::header::HeaderMap;
use hyper::Uri;
use thiserror::Error;

use crate::engine::Middleware;

pub use chained::ChainedUpstream;
pub use forward::RequestForwarder;
pub use tunnel::ConnectTunneler;
pub use upstream::{DirectUpstream, Upstream};

/// Options for the upstream connector. Immutable after construction.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Headers applied on the chained-proxy hop, unconditionally.
    pub proxy_headers: HeaderMap,
    /// Headers added on the chained-proxy hop when the request lacks them.
    pub default_headers: HeaderMap,
    /// Whether the direct client keeps origin connections pooled.
    pub keep_alive: bool,
}

impl ProxyOptions {
    pub fn new() -> Self {
        Self {
            proxy_headers: HeaderMap::new(),
            default_headers: HeaderMap::new(),
            keep_alive: true,
        }
    }
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
#[error("chained proxy URL has no host: {0}")]
pub struct InvalidProxyUrl(pub Uri);

/// Builds the proxy middlewares, parameterized by an upstream connector.
pub struct Proxy {
    upstream: Arc<dyn Upstream>,
}

impl Proxy {
    /// With a chained endpoint both capabilities go through the chained
    /// proxy; without one the origin is contacted directly.
    pub fn new(chained: Option<Uri>, options: ProxyOptions) -> Result<Self, InvalidProxyUrl> {
        let upstream: Arc<dyn Upstream> = match chained {
            Some(endpoint) => {
                let upstream = ChainedUpstream::new(
                    &endpoint,
                    options.proxy_headers,
                    options.default_headers,
                )
                .ok_or(InvalidProxyUrl(endpoint))?;
                Arc::new(upstream)
            }
            None => Arc::new(DirectUpstream::new(options.keep_alive)),
        };
        Ok(Self { upstream })
    }

    /// Build over a caller-supplied connector.
    pub fn with_upstream(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }

    /// The proxy middlewares, in composition order: request forwarding, then
    /// CONNECT tunneling. Both pass through on events they do not handle, so
    /// callers may reorder them freely among other middlewares.
    pub fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        vec![
            Arc::new(RequestForwarder::new(self.upstream.clone())),
            Arc::new(ConnectTunneler::new(self.upstream.clone())),
        ]
    }
}
