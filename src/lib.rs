//! Forward HTTP/HTTPS Proxy Library
//!
//! A forward proxy built around a middleware dispatch engine: every inbound
//! unit of work (a plain HTTP request or a CONNECT tunnel request) becomes an
//! [`engine::Context`] driven through an ordered middleware chain. The
//! bundled proxy middlewares forward plain requests to the origin (optionally
//! via a chained upstream proxy) and negotiate opaque byte tunnels for
//! CONNECT.

pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod relay;

pub use config::ProxyConfig;
pub use engine::App;
pub use lifecycle::Shutdown;
pub use net::Server;
pub use proxy::Proxy;
