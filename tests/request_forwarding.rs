//! End-to-end tests for plain HTTP request forwarding.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hyper::{Request, Response};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use forward_proxy::engine::context::ProxyBody;
use forward_proxy::engine::error::UpstreamError;
use forward_proxy::proxy::{Proxy, ProxyOptions, Upstream};
use forward_proxy::relay::Link;
use forward_proxy::App;

fn direct_proxy_app() -> App {
    let proxy = Proxy::new(None, ProxyOptions::new()).unwrap();
    let mut app = App::new();
    for middleware in proxy.middlewares() {
        app.use_middleware(middleware);
    }
    app
}

/// Upstream that counts invocations and never reaches a network.
struct CountingUpstream {
    requests: AtomicUsize,
    connects: AtomicUsize,
}

impl CountingUpstream {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Upstream for CountingUpstream {
    async fn request(&self, _req: Request<ProxyBody>) -> Result<Response<ProxyBody>, UpstreamError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Err(UpstreamError::new("not reachable in this test"))
    }

    async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn Link>, UpstreamError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Err(UpstreamError::new("not reachable in this test"))
    }
}

#[tokio::test]
async fn forwards_get_requests_through_the_proxy() {
    let origin = common::start_origin("hello from origin").await;
    let (proxy_addr, _shutdown) = common::start_proxy(direct_proxy_app()).await;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).unwrap())
        .build()
        .unwrap();

    let response = client
        .get(format!("http://{origin}/hello"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello from origin");
}

#[tokio::test]
async fn strips_proxy_headers_before_the_origin() {
    let (origin, mut recorded) = common::start_recording_origin().await;
    let (proxy_addr, _shutdown) = common::start_proxy(direct_proxy_app()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET http://{origin}/ HTTP/1.1\r\n\
         Host: {origin}\r\n\
         Proxy-Authorization: Basic Zm9vOmJhcg==\r\n\
         Proxy-Connection: keep-alive\r\n\
         X-Forward-Me: yes\r\n\
         Connection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = common::read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");

    let seen = recorded.recv().await.unwrap().to_lowercase();
    assert!(seen.contains("x-forward-me: yes"));
    assert!(!seen.contains("proxy-authorization"));
    assert!(!seen.contains("proxy-connection"));
}

#[tokio::test]
async fn rejects_origin_form_targets_without_touching_the_upstream() {
    let upstream = CountingUpstream::new();
    let proxy = Proxy::with_upstream(upstream.clone());
    let mut app = App::new();
    for middleware in proxy.middlewares() {
        app.use_middleware(middleware);
    }
    let (proxy_addr, _shutdown) = common::start_proxy(app).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET /no-authority HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let response = common::read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 400"), "got: {response}");
    assert_eq!(upstream.requests.load(Ordering::SeqCst), 0);
    assert_eq!(upstream.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn completes_unhandled_requests_with_204() {
    // No middlewares at all: the engine supplies the default completion.
    let (proxy_addr, _shutdown) = common::start_proxy(App::new()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let response = common::read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 204"), "got: {response}");
    assert!(response.contains("Cache-Control: no-cache"));
    assert!(response.contains("Connection: close"));
}

#[tokio::test]
async fn unreachable_origin_yields_500() {
    // Bind and drop to get a port with nothing listening.
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = closed.local_addr().unwrap();
    drop(closed);

    let (proxy_addr, _shutdown) = common::start_proxy(direct_proxy_app()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = common::read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 500"), "got: {response}");
}
