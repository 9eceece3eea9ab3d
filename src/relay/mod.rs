//! Stream coordination: flow-controlled pipes with one failure domain.
//!
//! # Responsibilities
//! - Wire one transport's output into another's input under backpressure
//! - Run a full-duplex tunnel as two directional copies sharing one
//!   error/cleanup domain
//! - Tear the whole group down on the first error, each participant closed
//!   exactly once
//!
//! # Design Decisions
//! - Cleanup is ownership-based: when a coordinator future returns, every
//!   split half drops and the underlying transports close; a double destroy
//!   cannot be expressed
//! - The tunnel's outcome is keyed to the client-bound direction finishing
//!   its terminal write; a clean client-side EOF only half-closes the
//!   upstream and keeps the group running

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

/// A duplex byte transport usable as a tunnel endpoint.
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Link for T {}

/// One directional copy: reader output into writer input, flow-controlled.
/// Finishes the writer's output on clean EOF and returns the byte count;
/// bubbles the first error without touching the writer further.
pub async fn pipe<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await?;
    Ok(copied)
}

/// Full-duplex tunnel between the client transport and the upstream
/// transport.
///
/// Resolves with (bytes sent upstream, bytes sent to the client) when the
/// client-bound direction finishes cleanly. Rejects on the first error from
/// either direction; both transports are closed on return either way.
pub async fn join<A, B>(client: A, upstream: B) -> io::Result<(u64, u64)>
where
    A: Link,
    B: Link,
{
    let (mut client_rd, mut client_wr) = io::split(client);
    let (mut upstream_rd, mut upstream_wr) = io::split(upstream);

    let send = pipe(&mut client_rd, &mut upstream_wr);
    let receive = pipe(&mut upstream_rd, &mut client_wr);
    tokio::pin!(send, receive);

    let mut sent = None;
    loop {
        tokio::select! {
            received = &mut receive => {
                let received = received?;
                return Ok((sent.unwrap_or(0), received));
            }
            copied = &mut send, if sent.is_none() => {
                // Client-side EOF half-closes the upstream; keep relaying
                // the upstream's remaining output.
                sent = Some(copied?);
            }
        }
    }
}
