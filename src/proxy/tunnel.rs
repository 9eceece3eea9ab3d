//! CONNECT tunnel middleware.
//!
//! # Responsibilities
//! - Parse the tunnel target (IPv6-safe last-colon split, default port 80)
//! - Negotiate the upstream socket and acknowledge the client with the
//!   literal 200 status line
//! - Replay head bytes and hand both sockets to the relay

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::engine::error::UpstreamError;
use crate::engine::{Context, Event, Middleware, Next, ProxyError};
use crate::proxy::Upstream;
use crate::relay;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Establishes opaque byte tunnels for connect events. A pass-through for
/// any other event kind.
pub struct ConnectTunneler {
    upstream: Arc<dyn Upstream>,
}

impl ConnectTunneler {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl Middleware for ConnectTunneler {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), ProxyError> {
        if ctx.event() != Event::Connect {
            return next.run(ctx).await;
        }

        let (host, port) = split_target(&ctx.state.url).ok_or_else(|| {
            ProxyError::bad_request(format!("invalid CONNECT target: {}", ctx.state.url))
        })?;
        ctx.state.hostname = Some(host.clone());
        ctx.state.port = Some(port);

        let mut upstream = self.upstream.connect(&host, port).await?;

        let head = ctx.state.head.clone();
        let socket = ctx
            .socket_mut()
            .ok_or_else(|| ProxyError::internal("connect event without a raw socket"))?;
        socket.write_all(ESTABLISHED).await?;
        ctx.state.status = Some(200);

        let client = ctx
            .socket_mut()
            .and_then(|socket| socket.take())
            .ok_or_else(|| ProxyError::internal("client socket already taken"))?;

        if !head.is_empty() {
            upstream
                .write_all(&head)
                .await
                .map_err(|err| ProxyError::from(UpstreamError::from(err)))?;
        }

        let (sent, received) = relay::join(client, upstream)
            .await
            .map_err(|err| ProxyError::from(UpstreamError::from(err)))?;
        tracing::debug!(host = %host, port, sent, received, "tunnel closed");
        Ok(())
    }
}

/// Split a CONNECT target into host and port.
///
/// The split happens at the last colon that is followed only by digits, so
/// IPv6 literals keep their internal colons; brackets around a literal are
/// stripped. The port defaults to 80 when absent.
fn split_target(target: &str) -> Option<(String, u16)> {
    let (host, port) = match target.rfind(':') {
        Some(idx) if target[idx + 1..].bytes().all(|b| b.is_ascii_digit()) => {
            let digits = &target[idx + 1..];
            if digits.is_empty() {
                (&target[..idx], 80)
            } else {
                (&target[..idx], digits.parse().ok()?)
            }
        }
        _ => (target, 80),
    };

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
