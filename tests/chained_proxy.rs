//! Tests for delegation to a chained upstream proxy.

mod common;

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use forward_proxy::proxy::{Proxy, ProxyOptions};
use forward_proxy::App;

fn chained_proxy_app(chained: SocketAddr, options: ProxyOptions) -> App {
    let endpoint = format!("http://{chained}").parse().unwrap();
    let proxy = Proxy::new(Some(endpoint), options).unwrap();
    let mut app = App::new();
    for middleware in proxy.middlewares() {
        app.use_middleware(middleware);
    }
    app
}

/// Stub chained proxy: records each request head, answers CONNECT with the
/// given status line and then echoes, answers anything else with 200.
async fn start_stub_proxy(
    connect_status: &'static str,
) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let head = match common::read_head(&mut socket).await {
                            Some(head) => head,
                            None => return,
                        };
                        let is_connect = head.starts_with("CONNECT ");
                        let _ = tx.send(head);

                        if is_connect {
                            let response = format!("HTTP/1.1 {connect_status}\r\n\r\n");
                            if socket.write_all(response.as_bytes()).await.is_err() {
                                return;
                            }
                            let mut buf = [0u8; 1024];
                            loop {
                                match socket.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        if socket.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        } else {
                            let _ = socket
                                .write_all(
                                    b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nchained",
                                )
                                .await;
                            let _ = socket.shutdown().await;
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });

    (addr, rx)
}

#[tokio::test]
async fn connect_is_negotiated_with_the_chained_proxy() {
    let (stub, mut recorded) = start_stub_proxy("200 OK").await;

    let mut options = ProxyOptions::new();
    options
        .proxy_headers
        .insert("proxy-authorization", "Basic Zm9vOmJhcg==".parse().unwrap());
    let (proxy_addr, _shutdown) = common::start_proxy(chained_proxy_app(stub, options)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let head = common::read_head(&mut client).await.unwrap();
    assert_eq!(head, "HTTP/1.1 200 Connection Established\r\n\r\n");

    // The stub echoes, so the tunnel is transparent end to end.
    client.write_all(b"through the chain").await.unwrap();
    let mut buf = [0u8; 17];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through the chain");

    let seen = recorded.recv().await.unwrap();
    assert!(seen.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
    assert!(seen.contains("proxy-authorization: Basic Zm9vOmJhcg=="));
}

#[tokio::test]
async fn chained_refusal_surfaces_as_500() {
    let (stub, _recorded) = start_stub_proxy("407 Proxy Authentication Required").await;
    let (proxy_addr, _shutdown) =
        common::start_proxy(chained_proxy_app(stub, ProxyOptions::new())).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let response = common::read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 500"), "got: {response}");
    assert!(!response.contains("Connection Established"));
}

#[tokio::test]
async fn request_path_merges_default_and_proxy_headers() {
    let (stub, mut recorded) = start_stub_proxy("200 OK").await;

    let mut options = ProxyOptions::new();
    options
        .default_headers
        .insert("x-session", "fallback".parse().unwrap());
    options
        .default_headers
        .insert("x-trace", "on".parse().unwrap());
    options
        .proxy_headers
        .insert("proxy-authorization", "Basic Zm9vOmJhcg==".parse().unwrap());
    let (proxy_addr, _shutdown) = common::start_proxy(chained_proxy_app(stub, options)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"GET http://origin.example/ HTTP/1.1\r\n\
              Host: origin.example\r\n\
              X-Session: mine\r\n\
              Connection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let response = common::read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("chained"));

    let seen = recorded.recv().await.unwrap().to_lowercase();
    // The request keeps its own value for a default header it already set.
    assert!(seen.contains("x-session: mine"));
    assert!(!seen.contains("x-session: fallback"));
    // Defaults fill gaps; proxy headers always win.
    assert!(seen.contains("x-trace: on"));
    assert!(seen.contains("proxy-authorization: basic zm9vomjhcg=="));
    // The chained hop receives the absolute-form target.
    assert!(seen.starts_with("get http://origin.example/ http/1.1\r\n"));
}
