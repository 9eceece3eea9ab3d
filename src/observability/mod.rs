//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → access.rs (one line per completed unit of work)
//!
//! Consumers:
//!     → Log aggregation (stdout, file, remote)
//! ```

pub mod access;
pub mod logging;

pub use access::AccessLog;
