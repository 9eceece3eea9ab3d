//! Access logging middleware.
//!
//! # Responsibilities
//! - Log one line per unit of work after the rest of the chain completes
//! - Record the peer address, method, target and final status

use async_trait::async_trait;

use crate::engine::{Context, Middleware, Next, ProxyError};

/// Logs each completed unit of work. Intended to sit first in the chain so
/// it observes the final status the client saw.
pub struct AccessLog;

#[async_trait]
impl Middleware for AccessLog {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), ProxyError> {
        next.run(ctx).await?;

        tracing::info!(
            peer = %ctx.ip,
            method = %ctx.request.method,
            target = %ctx.state.url,
            status = ctx.response_status(),
            "handled"
        );
        Ok(())
    }
}
