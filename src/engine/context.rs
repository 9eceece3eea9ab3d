//! Per-unit-of-work context threaded through the middleware chain.
//!
//! # Responsibilities
//! - Hold the inbound request head, body, and client transport
//! - Track mutable dispatch state (event kind, target, status, parsed parts)
//! - Enforce the single-terminal-write invariant on the transport
//!
//! # Design Decisions
//! - The transport is an enum rather than "socket plus optional response":
//!   hyper owns the socket while serving plain requests, so the two event
//!   kinds genuinely carry different transports
//! - `State.event` is set at construction and never mutated

use std::net::IpAddr;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::http::request::Parts;
use hyper::{Response, Uri};
use tokio::io::{AsyncWriteExt, Error as IoError, ErrorKind};
use tokio::net::TcpStream;

use crate::engine::error::ProxyError;

/// Unified response body type: locally built bodies and streamed upstream
/// bodies boxed behind one error type.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// An empty response body.
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// A response body holding one chunk.
pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// The two raw event kinds delivered by the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A plain HTTP request to forward to the origin.
    Request,
    /// A CONNECT upgrade asking for an opaque byte tunnel.
    Connect,
}

/// Mutable dispatch state, snapshotted onto error events.
#[derive(Debug, Clone)]
pub struct State {
    pub event: Event,
    /// Raw request target: an absolute URI for request events, a host:port
    /// authority for connect events.
    pub url: String,
    /// Final client-visible status, where one was written on a raw socket.
    pub status: Option<u16>,
    /// Parsed absolute URI (request events, set by the forwarder).
    pub uri: Option<Uri>,
    /// Parsed tunnel target (connect events, set by the tunneler).
    pub hostname: Option<String>,
    pub port: Option<u16>,
    /// Bytes that arrived buffered behind the CONNECT head.
    pub head: Bytes,
}

impl State {
    fn new(event: Event, url: String, head: Bytes) -> Self {
        Self {
            event,
            url,
            status: None,
            uri: None,
            hostname: None,
            port: None,
            head,
        }
    }
}

/// Set-once slot for the response to a plain HTTP request.
#[derive(Default)]
pub struct ResponseSlot {
    response: Option<Response<ProxyBody>>,
}

impl ResponseSlot {
    pub fn is_set(&self) -> bool {
        self.response.is_some()
    }

    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|resp| resp.status().as_u16())
    }

    pub(crate) fn set(&mut self, response: Response<ProxyBody>) -> Result<(), ProxyError> {
        if self.response.is_some() {
            return Err(ProxyError::internal("response already written"));
        }
        self.response = Some(response);
        Ok(())
    }

    pub(crate) fn take(&mut self) -> Option<Response<ProxyBody>> {
        self.response.take()
    }
}

/// Raw client socket for connect events.
///
/// Tracks whether bytes have been written and whether the stream was ended,
/// so terminal operations can be checked before they run. A taken or
/// destroyed socket cannot be written or ended again.
pub struct ClientSocket {
    stream: Option<TcpStream>,
    bytes_written: bool,
    ended: bool,
}

impl ClientSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            bytes_written: false,
            ended: false,
        }
    }

    pub fn has_written(&self) -> bool {
        self.bytes_written
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| IoError::new(ErrorKind::NotConnected, "socket already taken"))?;
        stream.write_all(data).await?;
        stream.flush().await?;
        self.bytes_written = true;
        Ok(())
    }

    /// Take the underlying stream, e.g. to hand it to the relay. The socket
    /// is considered terminal afterwards.
    pub fn take(&mut self) -> Option<TcpStream> {
        self.ended = true;
        self.stream.take()
    }

    /// Gracefully end the stream. Safe to call on an ended or destroyed
    /// socket; only the first call shuts the stream down.
    pub(crate) async fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.shutdown().await;
        }
    }

    /// Forcibly close the stream without a graceful shutdown.
    pub(crate) fn destroy(&mut self) {
        self.ended = true;
        self.stream = None;
    }
}

/// Client-side transport for one unit of work.
pub enum Transport {
    /// Plain HTTP request: the response travels back through hyper.
    Http(ResponseSlot),
    /// CONNECT upgrade: the raw socket, owned by this unit of work.
    Socket(ClientSocket),
}

/// Per-connection state bag threaded through the chain.
///
/// Created once per inbound unit of work and owned exclusively by it; never
/// shared across units.
pub struct Context {
    /// Inbound request head (method, URI, headers).
    pub request: Parts,
    /// Inbound request body; present only for request events, consumed by
    /// the forwarder.
    pub body: Option<Incoming>,
    pub transport: Transport,
    pub state: State,
    pub ip: IpAddr,
}

impl Context {
    pub(crate) fn for_request(request: Parts, body: Incoming, ip: IpAddr) -> Self {
        let url = request.uri.to_string();
        Self {
            request,
            body: Some(body),
            transport: Transport::Http(ResponseSlot::default()),
            state: State::new(Event::Request, url, Bytes::new()),
            ip,
        }
    }

    pub(crate) fn for_connect(
        request: Parts,
        target: String,
        socket: TcpStream,
        head: Bytes,
        ip: IpAddr,
    ) -> Self {
        Self {
            request,
            body: None,
            transport: Transport::Socket(ClientSocket::new(socket)),
            state: State::new(Event::Connect, target, head),
            ip,
        }
    }

    pub fn event(&self) -> Event {
        self.state.event
    }

    /// Consume the inbound request body.
    pub fn take_body(&mut self) -> Option<Incoming> {
        self.body.take()
    }

    /// Write the terminal response for a plain HTTP request. Fails on a
    /// second write or on a connect event.
    pub fn respond(&mut self, response: Response<ProxyBody>) -> Result<(), ProxyError> {
        match &mut self.transport {
            Transport::Http(slot) => slot.set(response),
            Transport::Socket(_) => Err(ProxyError::internal(
                "cannot write an HTTP response on a tunnel transport",
            )),
        }
    }

    /// The raw client socket, for connect events.
    pub fn socket_mut(&mut self) -> Option<&mut ClientSocket> {
        match &mut self.transport {
            Transport::Socket(socket) => Some(socket),
            Transport::Http(_) => None,
        }
    }

    /// Client-visible status, once one is known.
    pub fn response_status(&self) -> Option<u16> {
        self.state.status.or(match &self.transport {
            Transport::Http(slot) => slot.status(),
            Transport::Socket(_) => None,
        })
    }
}
