//! Middleware trait and chain cursor.
//!
//! # Responsibilities
//! - Define the onion-model middleware interface
//! - Drive the chain with a per-dispatch cursor
//!
//! # Design Decisions
//! - `Next` is consumed by value, so a middleware can run the remainder of
//!   the chain at most once; "double next" is unrepresentable
//! - The cursor is a slice over the chain, local to each dispatch; concurrent
//!   dispatches never share it

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::context::Context;
use crate::engine::error::ProxyError;

/// A composable unit of request-processing logic.
///
/// A middleware that never runs `next` halts the chain for that unit of
/// work; later middlewares do not observe the context.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), ProxyError>;
}

/// Continuation over the remainder of the middleware chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>]) -> Self {
        Self { chain }
    }

    /// Run the rest of the chain. A no-op when the chain is exhausted.
    pub async fn run(self, ctx: &mut Context) -> Result<(), ProxyError> {
        match self.chain.split_first() {
            Some((middleware, rest)) => middleware.handle(ctx, Next { chain: rest }).await,
            None => Ok(()),
        }
    }
}
