//! Chained upstream proxy connector.
//!
//! # Responsibilities
//! - Delegate plain request forwarding to a chained proxy (absolute-form
//!   requests over HTTP/1.1)
//! - Negotiate CONNECT tunnels with the chained proxy
//! - Apply configured proxy headers and default headers on the chained hop

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::HeaderMap;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::engine::context::ProxyBody;
use crate::engine::error::UpstreamError;
use crate::net::connection::{read_head, Rewind, MAX_HEADERS, MAX_HEAD_BYTES};
use crate::proxy::Upstream;
use crate::relay::Link;

/// Upstream variant that routes everything through a chained proxy instead
/// of contacting origins directly.
pub struct ChainedUpstream {
    host: String,
    port: u16,
    proxy_headers: HeaderMap,
    default_headers: HeaderMap,
}

impl ChainedUpstream {
    /// Build from the chained proxy endpoint URL. The URL must carry a host;
    /// the port defaults to 80.
    pub fn new(
        endpoint: &Uri,
        proxy_headers: HeaderMap,
        default_headers: HeaderMap,
    ) -> Option<Self> {
        let host = endpoint.host()?.to_string();
        let port = endpoint.port_u16().unwrap_or(80);
        Some(Self {
            host,
            port,
            proxy_headers,
            default_headers,
        })
    }

    async fn open(&self) -> Result<TcpStream, UpstreamError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        Ok(stream)
    }
}

#[async_trait]
impl Upstream for ChainedUpstream {
    async fn request(
        &self,
        mut req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, UpstreamError> {
        let stream = self.open().await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await
            .map_err(|err| UpstreamError::from_error(&err))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(error = %err, "chained proxy connection ended");
            }
        });

        for (name, value) in self.default_headers.iter() {
            if !req.headers().contains_key(name) {
                req.headers_mut().insert(name, value.clone());
            }
        }
        for (name, value) in self.proxy_headers.iter() {
            req.headers_mut().insert(name, value.clone());
        }

        let response = sender
            .send_request(req)
            .await
            .map_err(|err| UpstreamError::from_error(&err))?;
        Ok(response.map(|body| body.boxed()))
    }

    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Link>, UpstreamError> {
        // Bracket IPv6 literals in the authority we send to the proxy.
        let target = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };

        let mut stream = self.open().await?;
        let mut handshake = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        for (name, value) in self.proxy_headers.iter() {
            if let Ok(value) = value.to_str() {
                handshake.push_str(name.as_str());
                handshake.push_str(": ");
                handshake.push_str(value);
                handshake.push_str("\r\n");
            }
        }
        handshake.push_str("\r\n");
        stream.write_all(handshake.as_bytes()).await?;

        let (buf, head_end) = read_head(&mut stream, MAX_HEAD_BYTES)
            .await
            .map_err(|err| UpstreamError::new(format!("chained proxy CONNECT failed: {err}")))?;

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        response
            .parse(&buf[..head_end])
            .map_err(|err| UpstreamError::new(format!("chained proxy CONNECT failed: {err}")))?;
        let code = response.code.unwrap_or(0);
        if !(200..300).contains(&code) {
            return Err(UpstreamError::new(format!(
                "chained proxy refused CONNECT: {code}"
            )));
        }

        // Bytes the proxy sent past its response head belong to the tunnel.
        let mut head: Bytes = buf.freeze();
        let leftover = head.split_off(head_end);
        if leftover.is_empty() {
            Ok(Box::new(stream))
        } else {
            Ok(Box::new(Rewind::new(leftover, stream)))
        }
    }
}
