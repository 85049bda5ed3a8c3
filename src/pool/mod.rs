//! Connection pooling module
//!
//! This module provides:
//! - A bounded pool of reusable connections to one backend
//! - Leases that hand connections back exactly once
//! - Background revalidation of released connections (validated mode)
//! - A TCP/TLS connector usable as the backend collaborator

pub mod backend;
pub mod connection;
pub mod error;
pub mod lease;
mod queue;
mod repair;
pub mod tcp;

pub use backend::{Connection, Connector};
pub use connection::{ConnectionPool, PoolStats};
pub use error::{BoxError, ConfigError, PoolError};
pub use lease::Lease;
pub use tcp::{BackendStream, TcpConnection, TcpConnector};
