//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bounded accept, connection limit)
//!     → connection.rs (head read, CONNECT vs plain HTTP classification)
//!     → Hand off to the dispatch engine
//! ```

pub(crate) mod connection;
pub mod listener;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::engine::App;

pub use listener::{Listener, ListenerError};

/// Accept loop tying the listener to the dispatch engine.
///
/// Each accepted connection is served on its own task while its permit is
/// held; on shutdown the remaining tasks are aborted.
pub struct Server {
    app: Arc<App>,
    listener: Listener,
}

impl Server {
    pub fn new(app: Arc<App>, listener: Listener) -> Self {
        Self { app, listener }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub async fn run(
        self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer, permit) = accepted?;
                    let app = self.app.clone();
                    connections.spawn(async move {
                        connection::serve(app, stream, peer).await;
                        drop(permit);
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        tracing::info!(
            open_connections = connections.len(),
            "listener stopped, closing connections"
        );
        connections.shutdown().await;
        Ok(())
    }
}
