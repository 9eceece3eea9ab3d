//! Connection classification and per-connection serving.
//!
//! # Responsibilities
//! - Read the raw request head off a fresh connection
//! - Classify it: CONNECT upgrades stay on the raw socket, everything else
//!   is rewound and served through hyper's HTTP/1.1 connection
//! - Deliver each unit of work to the dispatch engine as the matching raw
//!   event kind

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use bytes::{Bytes, BytesMut};
use hyper::http::request::Parts;
use hyper::service::service_fn;
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::engine::App;

/// Upper bound on a request head read off the raw socket.
pub(crate) const MAX_HEAD_BYTES: usize = 16 * 1024;
/// Header slots for httparse.
pub(crate) const MAX_HEADERS: usize = 64;

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("connection closed before a full request head")]
    UnexpectedEof,
    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("malformed request head: {0}")]
    Parse(#[from] httparse::Error),
    #[error("malformed request head: {0}")]
    Http(#[from] hyper::http::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read from the stream until a full `\r\n\r\n`-terminated head is buffered.
/// Returns the buffer and the index one past the head terminator; any bytes
/// beyond it were read ahead and belong to what follows the head.
pub(crate) async fn read_head<S>(
    stream: &mut S,
    limit: usize,
) -> Result<(BytesMut, usize), AcceptError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            return Ok((buf, end));
        }
        if buf.len() >= limit {
            return Err(AcceptError::HeadTooLarge(limit));
        }
        let read = stream.read_buf(&mut buf).await?;
        if read == 0 {
            return Err(AcceptError::UnexpectedEof);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|idx| idx + 4)
}

/// Parse a raw CONNECT head into request parts plus the raw target string.
fn parse_connect_head(head: &[u8]) -> Result<(Parts, String), AcceptError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(head)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(AcceptError::UnexpectedEof),
    }

    let target = parsed.path.unwrap_or_default().to_string();
    let mut builder = Request::builder().method(Method::CONNECT);
    // The authority-form target may be unparseable; the raw string still
    // reaches the middlewares through the context state.
    if let Ok(uri) = target.parse::<Uri>() {
        builder = builder.uri(uri);
    }
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    let (parts, ()) = builder.body(())?.into_parts();
    Ok((parts, target))
}

/// Serve one accepted connection until it closes.
pub(crate) async fn serve(app: Arc<App>, mut stream: TcpStream, peer: SocketAddr) {
    let (buf, head_end) = match read_head(&mut stream, MAX_HEAD_BYTES).await {
        Ok(head) => head,
        Err(err @ (AcceptError::UnexpectedEof | AcceptError::Io(_))) => {
            tracing::debug!(peer = %peer, error = %err, "connection ended before a request");
            return;
        }
        Err(err) => {
            tracing::debug!(peer = %peer, error = %err, "rejecting malformed request head");
            let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            return;
        }
    };

    if buf.starts_with(b"CONNECT ") {
        match parse_connect_head(&buf[..head_end]) {
            Ok((parts, target)) => {
                let head = Bytes::copy_from_slice(&buf[head_end..]);
                app.dispatch_connect(parts, target, stream, head, peer.ip()).await;
            }
            Err(err) => {
                tracing::debug!(peer = %peer, error = %err, "rejecting malformed CONNECT head");
                let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            }
        }
        return;
    }

    // Plain HTTP: replay the consumed bytes and let hyper handle framing
    // and keep-alive for the rest of the connection's lifetime.
    let io = TokioIo::new(Rewind::new(buf.freeze(), stream));
    let ip = peer.ip();
    let service = service_fn(move |req| {
        let app = app.clone();
        async move { Ok::<_, Infallible>(app.dispatch_request(req, ip).await) }
    });
    if let Err(err) = hyper::server::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .await
    {
        tracing::debug!(peer = %peer, error = %err, "connection ended with error");
    }
}

/// Stream adapter that replays already-consumed bytes before reading from
/// the inner transport. Writes go straight through.
pub(crate) struct Rewind<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> Rewind<T> {
    pub(crate) fn new(prefix: Bytes, inner: T) -> Self {
        Self { prefix, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let len = this.prefix.len().min(buf.remaining());
            let chunk = this.prefix.split_to(len);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_end_is_found_past_the_blank_line() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nrest"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn connect_head_parses_target_and_headers() {
        let head = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let (parts, target) = parse_connect_head(head).unwrap();
        assert_eq!(target, "example.com:443");
        assert_eq!(parts.method, Method::CONNECT);
        assert_eq!(parts.headers["host"], "example.com:443");
    }

    #[tokio::test]
    async fn rewind_replays_the_prefix_before_the_stream() {
        let (near, mut far) = tokio::io::duplex(64);
        far.write_all(b" world").await.unwrap();
        far.shutdown().await.unwrap();

        let mut rewind = Rewind::new(Bytes::from_static(b"hello"), near);
        let mut out = Vec::new();
        rewind.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn read_head_returns_buffered_tail() {
        let (mut near, mut far) = tokio::io::duplex(256);
        far.write_all(b"CONNECT a:1 HTTP/1.1\r\n\r\nearly bytes")
            .await
            .unwrap();

        let (buf, end) = read_head(&mut near, MAX_HEAD_BYTES).await.unwrap();
        assert_eq!(&buf[end..], b"early bytes");
    }
}
