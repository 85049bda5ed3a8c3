//! The backend collaborator consumed by the pool
//!
//! The pool never looks inside a connection. It only needs a way to open one
//! and a way to re-confirm that an existing one is still alive. Both calls may
//! be slow and are always made outside the pool's bookkeeping locks.

use async_trait::async_trait;

use super::error::BoxError;
use crate::config::ConnectionInfo;

/// A live session handle to the backend
#[async_trait]
pub trait Connection: Send + 'static {
    /// Re-confirm (or re-establish) liveness without changing identity
    async fn revalidate(&mut self) -> Result<(), BoxError>;

    /// Close the session. Called when the pool drops a connection for good.
    async fn close(&mut self) {}
}

/// Opens new backend connections
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    async fn open(&self, info: &ConnectionInfo) -> Result<Self::Connection, BoxError>;
}
