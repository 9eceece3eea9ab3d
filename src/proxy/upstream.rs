//! Upstream connector capability.
//!
//! # Responsibilities
//! - Define the capability interface the proxy middlewares depend on:
//!   `request` for plain forwarding, `connect` for tunnel sockets
//! - Provide the direct variant that talks straight to the origin

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpStream;

use crate::engine::context::ProxyBody;
use crate::engine::error::UpstreamError;
use crate::relay::Link;

/// Capability provider for reaching the origin: an HTTP request channel and
/// a raw socket channel. The direct variant contacts the origin itself; the
/// chained variant delegates both to an upstream proxy.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    /// Send a request towards the origin and stream back its response.
    async fn request(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, UpstreamError>;

    /// Open a raw byte channel to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Link>, UpstreamError>;
}

/// Direct origin access: a pooled HTTP client plus plain TCP connects.
pub struct DirectUpstream {
    client: Client<HttpConnector, ProxyBody>,
}

impl DirectUpstream {
    pub fn new(keep_alive: bool) -> Self {
        let mut builder = Client::builder(TokioExecutor::new());
        if !keep_alive {
            builder.pool_max_idle_per_host(0);
        }
        Self {
            client: builder.build(HttpConnector::new()),
        }
    }
}

#[async_trait]
impl Upstream for DirectUpstream {
    async fn request(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, UpstreamError> {
        let response = self
            .client
            .request(req)
            .await
            .map_err(|err| UpstreamError::from_error(&err))?;
        Ok(response.map(|body| body.boxed()))
    }

    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Link>, UpstreamError> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }
}
