//! Plain request forwarding middleware.
//!
//! # Responsibilities
//! - Strip proxy-control headers before the request leaves this hop
//! - Validate the request target as an absolute URI
//! - Forward the request upstream and mirror the response back verbatim

use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::header::HeaderMap;
use hyper::http::uri::InvalidUri;
use hyper::{Request, Uri};

use crate::engine::{Context, Event, Middleware, Next, ProxyError};
use crate::proxy::Upstream;

/// Forwards request events to the upstream connector. A pass-through for
/// any other event kind.
pub struct RequestForwarder {
    upstream: Arc<dyn Upstream>,
}

impl RequestForwarder {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl Middleware for RequestForwarder {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), ProxyError> {
        if ctx.event() != Event::Request {
            return next.run(ctx).await;
        }

        // proxy-* headers are hop-by-hop proxy controls; they must not leak
        // to the origin. Header names are already lowercase in the map.
        let mut headers = HeaderMap::new();
        for (name, value) in ctx.request.headers.iter() {
            if name.as_str().starts_with("proxy-") {
                continue;
            }
            headers.append(name, value.clone());
        }

        let uri: Uri = ctx
            .state
            .url
            .parse()
            .map_err(|err: InvalidUri| ProxyError::bad_request(err.to_string()))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(ProxyError::bad_request(format!(
                "request target is not an absolute URI: {}",
                ctx.state.url
            )));
        }
        ctx.state.uri = Some(uri.clone());

        let body = ctx
            .take_body()
            .ok_or_else(|| ProxyError::internal("request body already consumed"))?;
        let mut outbound = Request::new(body.boxed());
        *outbound.method_mut() = ctx.request.method.clone();
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = headers;

        let response = self.upstream.request(outbound).await?;
        tracing::debug!(
            status = response.status().as_u16(),
            url = %ctx.state.url,
            "forwarded request"
        );
        ctx.respond(response)
    }
}
