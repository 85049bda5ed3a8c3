//! dbpool - bounded connection pool for a single database backend

pub mod cli;
pub mod config;
pub mod pool;

pub use config::{ConnectionInfo, PoolConfig, ReleaseMode, TlsOptions};
pub use pool::{Connection, ConnectionPool, Connector, Lease, PoolError, PoolStats};
