//! Middleware dispatch engine.
//!
//! # Responsibilities
//! - Own the ordered middleware chain and drive it per unit of work
//! - Convert raw connection events into contexts
//! - Apply the error policy (exposed vs opaque) exactly once per dispatch
//! - Finalize every transport: default 204 completion, single terminal write
//! - Emit error events on the observability channel
//!
//! # Data Flow
//! ```text
//! raw event -> Context -> chain (onion model) -> error policy -> finalize
//! ```

pub mod context;
pub mod error;
pub mod middleware;

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::header::{CACHE_CONTROL, CONNECTION};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub use context::{Context, Event, ProxyBody, Transport};
pub use error::{ErrorEvent, ProxyError};
pub use middleware::{Middleware, Next};

use context::{empty, full};

/// The dispatch engine: an ordered middleware chain plus error and
/// finalization policy.
///
/// The chain is mutable during setup and treated as immutable once the
/// engine is shared behind an `Arc`, so concurrent dispatches need no
/// locking.
pub struct App {
    middlewares: Vec<Arc<dyn Middleware>>,
    error_tx: Option<mpsc::UnboundedSender<ErrorEvent>>,
    fallback_notice: std::sync::Once,
}

impl App {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
            error_tx: None,
            fallback_notice: std::sync::Once::new(),
        }
    }

    /// Append a middleware to the end of the chain.
    pub fn use_middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    /// Insert a middleware at the front of the chain.
    pub fn prepend(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middlewares.insert(0, middleware);
        self
    }

    /// Subscribe to error events. Without a subscriber, errors are forwarded
    /// to the log with a one-time notice.
    pub fn on_error(&mut self) -> mpsc::UnboundedReceiver<ErrorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.error_tx = Some(tx);
        rx
    }

    /// Dispatch a plain HTTP request event and produce its response.
    pub async fn dispatch_request(&self, req: Request<Incoming>, ip: IpAddr) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        let mut ctx = Context::for_request(parts, body, ip);
        let result = self.run_chain(&mut ctx).await;
        self.finalize_request(ctx, result)
    }

    /// Dispatch a CONNECT upgrade event carrying any already-buffered bytes.
    pub async fn dispatch_connect(
        &self,
        request: Parts,
        target: String,
        socket: TcpStream,
        head: Bytes,
        ip: IpAddr,
    ) {
        let mut ctx = Context::for_connect(request, target, socket, head, ip);
        let result = self.run_chain(&mut ctx).await;
        self.finalize_connect(ctx, result).await;
    }

    pub(crate) async fn run_chain(&self, ctx: &mut Context) -> Result<(), ProxyError> {
        Next::new(&self.middlewares).run(ctx).await
    }

    fn finalize_request(
        &self,
        mut ctx: Context,
        result: Result<(), ProxyError>,
    ) -> Response<ProxyBody> {
        if let Err(err) = &result {
            let status = err.status();
            let exposed = err.exposed();
            let message = err.to_string();
            if let Transport::Http(slot) = &mut ctx.transport {
                if !slot.is_set() {
                    let body = if exposed { full(message.clone()) } else { empty() };
                    let mut response = Response::new(body);
                    *response.status_mut() = status;
                    let _ = slot.set(response);
                }
            }
            ctx.state.status = Some(status.as_u16());
            self.emit_error(ErrorEvent {
                status: status.as_u16(),
                exposed,
                message,
                state: ctx.state.clone(),
            });
        }

        // Unconsumed request bodies drop here; hyper reclaims the connection.
        match ctx.transport {
            Transport::Http(mut slot) => slot.take().unwrap_or_else(default_completion),
            Transport::Socket(_) => default_completion(),
        }
    }

    async fn finalize_connect(&self, mut ctx: Context, result: Result<(), ProxyError>) {
        if let Err(err) = &result {
            let status = err.status();
            let exposed = err.exposed();
            let message = err.to_string();
            if let Some(socket) = ctx.socket_mut() {
                if socket.has_written() {
                    // Headers are already on the wire; the only valid
                    // recovery is hard destruction.
                    socket.destroy();
                } else {
                    let phrase = if exposed {
                        message.as_str()
                    } else {
                        status.canonical_reason().unwrap_or("Error")
                    };
                    let body = if exposed { message.as_str() } else { "" };
                    let line = format!("HTTP/1.1 {} {}\r\n\r\n{}", status.as_u16(), phrase, body);
                    if socket.write_all(line.as_bytes()).await.is_ok() {
                        ctx.state.status = Some(status.as_u16());
                    }
                }
            }
            self.emit_error(ErrorEvent {
                status: status.as_u16(),
                exposed,
                message,
                state: ctx.state.clone(),
            });
        }

        let mut wrote_no_content = false;
        if let Some(socket) = ctx.socket_mut() {
            if !socket.has_written() {
                let block = format!(
                    "HTTP/1.1 {} No Content\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
                    StatusCode::NO_CONTENT.as_u16()
                );
                wrote_no_content = socket.write_all(block.as_bytes()).await.is_ok();
            }
        }
        if wrote_no_content {
            ctx.state.status = Some(StatusCode::NO_CONTENT.as_u16());
        }
        if let Some(socket) = ctx.socket_mut() {
            socket.end().await;
        }
    }

    fn emit_error(&self, event: ErrorEvent) {
        let event = match &self.error_tx {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        self.fallback_notice.call_once(|| {
            tracing::info!("no error subscriber attached, forwarding errors to the log");
        });
        tracing::error!(
            status = event.status,
            exposed = event.exposed,
            state = ?event.state,
            "{}",
            event.message
        );
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

/// The default terminal response when no middleware wrote one.
fn default_completion() -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
        .headers_mut()
        .insert(CACHE_CONTROL, hyper::header::HeaderValue::from_static("no-cache"));
    response
        .headers_mut()
        .insert(CONNECTION, hyper::header::HeaderValue::from_static("close"));
    response
}
