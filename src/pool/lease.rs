//! Leased connections
//!
//! A [`Lease`] owns exactly one connection until it is released. `release`
//! consumes the lease, so the connection can only be handed back once and can
//! not be touched afterwards. Dropping an unreleased lease releases it too,
//! which keeps early returns and `?` from leaking capacity.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::debug;

use super::backend::Connection;
use super::connection::Shared;

/// A connection borrowed from a [`ConnectionPool`](super::ConnectionPool)
pub struct Lease<C: Connection> {
    conn: Option<C>,
    pool: Arc<Shared<C>>,
}

impl<C: Connection> Lease<C> {
    pub(crate) fn new(conn: C, pool: Arc<Shared<C>>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// The leased connection
    pub fn connection(&self) -> &C {
        // Only `release`/`discard`/`Drop` empty the slot, and all consume the lease.
        self.conn.as_ref().expect("lease holds a connection until released")
    }

    pub fn connection_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("lease holds a connection until released")
    }

    /// Hand the connection back to the pool
    pub fn release(mut self) {
        self.give_back();
    }

    /// Close the connection instead of returning it, freeing its capacity slot.
    ///
    /// Use this when the connection is known to be broken. The slot is freed
    /// before the close is awaited, so dropping this future mid-close still
    /// returns the capacity.
    pub async fn discard(mut self) {
        if let Some(mut conn) = self.conn.take() {
            self.pool.forget();
            debug!(parent: &self.pool.span, "Discarded leased connection");
            conn.close().await;
        }
    }

    fn give_back(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl<C: Connection> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.connection()
    }
}

impl<C: Connection> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.connection_mut()
    }
}

impl<C: Connection> Drop for Lease<C> {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl<C: Connection> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.pool.config.name)
            .field("held", &self.conn.is_some())
            .finish()
    }
}
