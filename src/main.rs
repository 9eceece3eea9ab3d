//! Forward HTTP/HTTPS proxy daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌──────────────────────────────────────────────┐
//!                         │                FORWARD PROXY                  │
//!                         │                                               │
//!   Client Request        │  ┌─────────┐   ┌────────────┐   ┌─────────┐  │
//!   ──────────────────────┼─▶│   net   │──▶│   engine   │──▶│  proxy  │──┼──▶ Origin /
//!                         │  │listener │   │ middleware │   │ forward │  │    chained
//!                         │  └─────────┘   │   chain    │   │ tunnel  │  │    proxy
//!                         │                └────────────┘   └────┬────┘  │
//!                         │                                      │       │
//!   Client Response       │                                 ┌────▼────┐  │
//!   ◀─────────────────────┼─────────────────────────────────│  relay  │  │
//!                         │                                 └─────────┘  │
//!                         │  ┌─────────────────────────────────────────┐ │
//!                         │  │  config   lifecycle   observability     │ │
//!                         │  └─────────────────────────────────────────┘ │
//!                         └──────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use clap::Parser;

use forward_proxy::config::ProxyConfig;
use forward_proxy::engine::App;
use forward_proxy::lifecycle::{self, Shutdown};
use forward_proxy::net::{Listener, Server};
use forward_proxy::observability::{logging, AccessLog};
use forward_proxy::proxy::Proxy;

/// Environment variables consulted for a chained proxy, in order.
const PROXY_ENV_VARS: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "http_proxy",
    "https_proxy",
    "proxy",
];

#[derive(Parser, Debug)]
#[command(name = "forward-proxy", about = "Forward HTTP/HTTPS proxy")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8081)]
    port: u16,

    /// Chained proxy URL; falls back to the proxy environment variables.
    #[arg(long)]
    proxy: Option<String>,
}

fn chained_proxy_from_env() -> Option<String> {
    PROXY_ENV_VARS
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|value| !value.is_empty()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let cli = Cli::parse();

    let config = ProxyConfig {
        listener: forward_proxy::config::ListenerConfig {
            bind_address: format!("{}:{}", cli.host, cli.port),
            ..Default::default()
        },
        chained_proxy: cli.proxy.or_else(chained_proxy_from_env),
        ..Default::default()
    };

    tracing::info!(
        bind_address = %config.listener.bind_address,
        chained_proxy = config.chained_proxy.as_deref(),
        "configuration loaded"
    );

    let proxy = Proxy::new(config.chained_proxy_uri()?, config.proxy_options()?)?;

    let mut app = App::new();
    for middleware in proxy.middlewares() {
        app.use_middleware(middleware);
    }
    app.prepend(Arc::new(AccessLog));

    let mut errors = app.on_error();
    tokio::spawn(async move {
        while let Some(event) = errors.recv().await {
            tracing::warn!(
                status = event.status,
                target = %event.state.url,
                "{}",
                event.message
            );
        }
    });

    let listener = Listener::bind(&config.listener).await?;
    tracing::info!(address = %listener.local_addr()?, "listening for connections");

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(async move {
        if lifecycle::wait_for_termination().await.is_ok() {
            shutdown.trigger();
        }
    });

    Server::new(Arc::new(app), listener).run(receiver).await?;

    tracing::info!("shutdown complete");
    Ok(())
}
