//! Bounded connection pool for a single backend
//!
//! This module provides the pool itself:
//! - Eager creation of `initial_conns` connections at construction
//! - Lazy creation on demand, up to `capacity`
//! - Timeout-bounded waiting when the pool is saturated
//! - Optional revalidation of released connections by a background repair loop
//!
//! `live` counts every connection that exists: ready, pending repair or leased.
//! A slot is reserved before the connector is called and handed back if the
//! connect fails or the caller gives up, so the count never exceeds capacity
//! and never leaks.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument, Span};

use super::backend::{Connection, Connector};
use super::error::{BoxError, PoolError};
use super::lease::Lease;
use super::queue::ReadyQueue;
use super::repair::{self, PendingRepair};
use crate::config::{PoolConfig, ReleaseMode};

/// Snapshot of pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum number of connections
    pub capacity: usize,

    /// Connections that currently exist (ready + pending repair + leased)
    pub live: usize,

    /// Connections waiting in the ready queue
    pub idle: usize,

    /// Connections waiting for, or undergoing, revalidation
    pub pending_repair: usize,

    /// Total connections opened
    pub created: u64,

    /// Total leases served from the ready queue
    pub reused: u64,

    /// Failed connection attempts
    pub connect_failures: u64,

    /// Acquires that timed out on a saturated pool
    pub exhausted: u64,

    /// Successful background revalidations
    pub repaired: u64,

    /// Failed background revalidations
    pub repair_failures: u64,

    /// Connections dropped for good (discarded, retired or given up on)
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    connect_failures: AtomicU64,
    exhausted: AtomicU64,
    repaired: AtomicU64,
    repair_failures: AtomicU64,
    discarded: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared by pool handles, leases and the repair loop
pub(crate) struct Shared<C> {
    pub(crate) config: PoolConfig,
    pub(crate) ready: ReadyQueue<C>,
    repair_tx: Option<mpsc::UnboundedSender<PendingRepair<C>>>,
    live: AtomicUsize,
    pending: AtomicUsize,
    closed: AtomicBool,
    slot_freed: Notify,
    counters: Counters,
    pub(crate) span: Span,
}

impl<C: Connection> Shared<C> {
    /// Reserve room for one new connection, if below capacity
    fn reserve_slot(self: &Arc<Self>) -> Option<SlotReservation<C>> {
        let capacity = self.config.capacity;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < capacity).then_some(live + 1)
            })
            .ok()
            .map(|_| SlotReservation {
                shared: Arc::clone(self),
                committed: false,
            })
    }

    fn free_slot(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.slot_freed.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hand a connection back after use. Synchronous so it can run from `Drop`.
    pub(crate) fn release(&self, conn: C) {
        let _enter = self.span.enter();

        if self.is_closed() {
            self.retire(conn);
            return;
        }

        match (&self.config.release_mode, &self.repair_tx) {
            (ReleaseMode::Validated, Some(tx)) => {
                self.pending.fetch_add(1, Ordering::AcqRel);
                if let Err(mpsc::error::SendError(item)) = tx.send(PendingRepair::new(conn)) {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    self.retire(item.conn);
                    return;
                }
                debug!(pending_repair = self.pending_count(), "Released connection for repair");
            }
            _ => {
                if let Err(conn) = self.ready.push(conn) {
                    self.retire(conn);
                    return;
                }
                debug!(idle = self.ready.len(), "Released connection");
            }
        }
    }

    /// Move a revalidated connection to the ready queue
    pub(crate) fn repaired(&self, conn: C) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        bump(&self.counters.repaired);
        if let Err(conn) = self.ready.push(conn) {
            self.retire(conn);
        }
    }

    pub(crate) fn record_repair_failure(&self) {
        bump(&self.counters.repair_failures);
    }

    /// Account for a connection that left the repair path for good.
    /// The caller has already closed it.
    pub(crate) fn abandon_pending(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.forget();
    }

    /// Account for a connection that was closed and will not come back
    pub(crate) fn forget(&self) {
        bump(&self.counters.discarded);
        self.free_slot();
    }

    /// Drop a connection for good, closing it in the background when possible
    fn retire(&self, mut conn: C) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { conn.close().await });
        }
        self.forget();
    }

    /// Reject new work and take every idle connection out of circulation
    fn shut_down(&self) -> Vec<C> {
        self.closed.store(true, Ordering::Release);
        let idle = self.ready.close();
        // Wake waiters so they observe the closed flag instead of a free slot.
        self.slot_freed.notify_waiters();
        idle
    }

    fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            capacity: self.config.capacity,
            live: self.live.load(Ordering::Acquire),
            idle: self.ready.len(),
            pending_repair: self.pending_count(),
            created: c.created.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            connect_failures: c.connect_failures.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
            repaired: c.repaired.load(Ordering::Relaxed),
            repair_failures: c.repair_failures.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }
}

/// A reserved capacity slot. Gives the slot back on drop unless committed,
/// which covers both connect failures and callers abandoning `acquire`.
struct SlotReservation<C: Connection> {
    shared: Arc<Shared<C>>,
    committed: bool,
}

impl<C: Connection> SlotReservation<C> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl<C: Connection> Drop for SlotReservation<C> {
    fn drop(&mut self) {
        if !self.committed {
            self.shared.free_slot();
        }
    }
}

/// Handle to the background repair loop
struct RepairTask {
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

struct PoolInner<K: Connector> {
    shared: Arc<Shared<K::Connection>>,
    connector: K,
    repair: Mutex<Option<RepairTask>>,
}

impl<K: Connector> PoolInner<K> {
    fn take_repair_task(&self) -> Option<RepairTask> {
        self.repair
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl<K: Connector> Drop for PoolInner<K> {
    fn drop(&mut self) {
        for conn in self.shared.shut_down() {
            self.shared.retire(conn);
        }
        if let Some(task) = self.take_repair_task() {
            let _ = task.shutdown.send(true);
        }
    }
}

/// Bounded pool of reusable connections to a single backend.
///
/// Cloning is cheap; clones share the same connections. The pool is torn down
/// by [`ConnectionPool::close`] or when the last clone is dropped.
pub struct ConnectionPool<K: Connector> {
    inner: Arc<PoolInner<K>>,
}

impl<K: Connector> Clone for ConnectionPool<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Connector> ConnectionPool<K> {
    /// Create a pool and open `initial_conns` connections up front.
    ///
    /// The first connect failure is returned and the connections opened so far
    /// are closed. Must be called from within a tokio runtime.
    pub async fn new(config: PoolConfig, connector: K) -> Result<Self, PoolError> {
        config.validate()?;

        let span = tracing::info_span!("pool", pool = %config.name);
        let validated = config.release_mode == ReleaseMode::Validated;

        let mut initial = Vec::with_capacity(config.initial_conns);
        for _ in 0..config.initial_conns.min(config.capacity) {
            match open_with_timeout(&connector, &config).instrument(span.clone()).await {
                Ok(conn) => initial.push(conn),
                Err(source) => {
                    for mut conn in initial {
                        conn.close().await;
                    }
                    return Err(PoolError::Connect {
                        address: config.connection.address(),
                        source,
                    });
                }
            }
        }

        let (repair_tx, repair_rx) = if validated {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let shared = Arc::new(Shared {
            ready: ReadyQueue::new(config.capacity),
            repair_tx,
            live: AtomicUsize::new(initial.len()),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            slot_freed: Notify::new(),
            counters: Counters::default(),
            span,
            config,
        });
        shared
            .counters
            .created
            .store(initial.len() as u64, Ordering::Relaxed);
        for conn in initial {
            // Freshly created queue: cannot be closed yet.
            let _ = shared.ready.push(conn);
        }

        let repair = repair_rx.map(|rx| {
            let (shutdown, shutdown_rx) = watch::channel(false);
            let supervisor = repair::spawn(Arc::clone(&shared), rx, shutdown_rx);
            RepairTask {
                shutdown,
                supervisor,
            }
        });

        info!(
            parent: &shared.span,
            capacity = shared.config.capacity,
            live = shared.live.load(Ordering::Acquire),
            release_mode = ?shared.config.release_mode,
            backend = %shared.config.connection.address(),
            "Created connection pool"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                shared,
                connector,
                repair: Mutex::new(repair),
            }),
        })
    }

    /// Lease a connection.
    ///
    /// Takes an idle connection when one is ready, otherwise opens a new one
    /// while below capacity, otherwise waits up to `acquire_timeout` for a
    /// connection to be released or a slot to be freed.
    pub async fn acquire(&self) -> Result<Lease<K::Connection>, PoolError> {
        let span = self.inner.shared.span.clone();
        self.acquire_inner().instrument(span).await
    }

    async fn acquire_inner(&self) -> Result<Lease<K::Connection>, PoolError> {
        let shared = &self.inner.shared;
        let timeout = shared.config.acquire_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            if shared.is_closed() {
                return Err(PoolError::Closed);
            }

            // Registered before checking so a slot freed in between is not missed.
            let slot_freed = shared.slot_freed.notified();
            tokio::pin!(slot_freed);
            slot_freed.as_mut().enable();

            if let Some(conn) = shared.ready.try_pop() {
                bump(&shared.counters.reused);
                debug!(idle = shared.ready.len(), "Reusing connection");
                return Ok(Lease::new(conn, Arc::clone(shared)));
            }

            if let Some(slot) = shared.reserve_slot() {
                return self.open_into_slot(slot).await;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.exhausted(timeout));
            }

            debug!(
                live = shared.live.load(Ordering::Acquire),
                capacity = shared.config.capacity,
                "Pool saturated, waiting for a connection"
            );

            tokio::select! {
                conn = shared.ready.pop_timeout(remaining) => {
                    return match conn {
                        Some(conn) => {
                            bump(&shared.counters.reused);
                            debug!("Reusing released connection");
                            Ok(Lease::new(conn, Arc::clone(shared)))
                        }
                        None if shared.is_closed() => Err(PoolError::Closed),
                        None => Err(self.exhausted(timeout)),
                    };
                }
                _ = &mut slot_freed => continue,
            }
        }
    }

    async fn open_into_slot(
        &self,
        slot: SlotReservation<K::Connection>,
    ) -> Result<Lease<K::Connection>, PoolError> {
        let shared = &self.inner.shared;

        match open_with_timeout(&self.inner.connector, &shared.config).await {
            Ok(conn) => {
                slot.commit();
                bump(&shared.counters.created);
                info!(
                    live = shared.live.load(Ordering::Acquire),
                    capacity = shared.config.capacity,
                    "Created new connection"
                );
                Ok(Lease::new(conn, Arc::clone(shared)))
            }
            Err(source) => {
                drop(slot);
                bump(&shared.counters.connect_failures);
                warn!(
                    backend = %shared.config.connection.address(),
                    error = %source,
                    "Failed to create connection"
                );
                Err(PoolError::Connect {
                    address: shared.config.connection.address(),
                    source,
                })
            }
        }
    }

    fn exhausted(&self, timeout: Duration) -> PoolError {
        let shared = &self.inner.shared;
        bump(&shared.counters.exhausted);
        warn!(
            timeout_ms = timeout.as_millis() as u64,
            capacity = shared.config.capacity,
            "Pool exhausted"
        );
        PoolError::Exhausted { timeout }
    }

    /// Number of connections that currently exist
    pub fn live_connection_count(&self) -> usize {
        self.inner.shared.live.load(Ordering::Acquire)
    }

    /// Number of connections waiting in the ready queue
    pub fn idle_count(&self) -> usize {
        self.inner.shared.ready.len()
    }

    /// Number of released connections not yet revalidated
    pub fn pending_repair_count(&self) -> usize {
        self.inner.shared.pending_count()
    }

    pub fn capacity(&self) -> usize {
        self.inner.shared.config.capacity
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.shared.config
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.shared.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// Shut the pool down.
    ///
    /// New acquires fail with [`PoolError::Closed`], waiting acquires are woken,
    /// the repair loop is stopped and every idle or pending connection is
    /// closed. Leases still out are closed when they are released.
    pub async fn close(&self) {
        let shared = &self.inner.shared;
        if shared.is_closed() {
            return;
        }

        // All accounting happens before the first await, so a caller that
        // stops polling `close` leaves no slot or repair loop behind.
        let idle = shared.shut_down();
        let count = idle.len();
        for _ in 0..count {
            shared.forget();
        }
        let repair = self.inner.take_repair_task();
        if let Some(task) = &repair {
            let _ = task.shutdown.send(true);
        }

        for mut conn in idle {
            conn.close().await;
        }
        if let Some(task) = repair {
            let _ = task.supervisor.await;
        }

        info!(
            parent: &shared.span,
            closed_idle = count,
            live = shared.live.load(Ordering::Acquire),
            "Closed connection pool"
        );
    }
}

async fn open_with_timeout<K: Connector>(
    connector: &K,
    config: &PoolConfig,
) -> Result<K::Connection, BoxError> {
    let info = &config.connection;
    match tokio::time::timeout(info.connect_timeout, connector.open(info)).await {
        Ok(result) => result,
        Err(_) => Err(format!("connect timed out after {:?}", info.connect_timeout).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::config::ConnectionInfo;
    use std::sync::atomic::AtomicU32;

    struct Dummy;

    #[async_trait]
    impl Connection for Dummy {
        async fn revalidate(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        opened: AtomicU32,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Connection = Dummy;

        async fn open(&self, _info: &ConnectionInfo) -> Result<Dummy, BoxError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err("backend down".into());
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Dummy)
        }
    }

    fn config(capacity: usize, initial_conns: usize) -> PoolConfig {
        PoolConfig {
            capacity,
            initial_conns,
            acquire_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reservation_rolls_back_when_dropped() {
        let pool = ConnectionPool::new(config(2, 0), CountingConnector::default())
            .await
            .unwrap();
        let shared = &pool.inner.shared;

        let slot = shared.reserve_slot().unwrap();
        assert_eq!(pool.live_connection_count(), 1);
        drop(slot);
        assert_eq!(pool.live_connection_count(), 0);

        let a = shared.reserve_slot().unwrap();
        let b = shared.reserve_slot().unwrap();
        assert!(shared.reserve_slot().is_none());
        a.commit();
        b.commit();
        assert_eq!(pool.live_connection_count(), 2);
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let result = ConnectionPool::new(config(0, 0), CountingConnector::default()).await;
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[tokio::test]
    async fn test_stats_track_lifecycle() {
        let pool = ConnectionPool::new(config(2, 1), CountingConnector::default())
            .await
            .unwrap();

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert!(pool.acquire().await.unwrap_err().is_exhausted());
        first.release();
        second.release();

        let stats = pool.stats();
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.live, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.pending_repair, 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let pool = ConnectionPool::new(config(2, 2), CountingConnector::default())
            .await
            .unwrap();
        pool.close().await;

        assert!(pool.is_closed());
        assert_eq!(pool.live_connection_count(), 0);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn test_failed_eager_creation_propagates() {
        let connector = CountingConnector::default();
        connector.fail.store(true, Ordering::SeqCst);
        let result = ConnectionPool::new(config(4, 2), connector).await;
        assert!(matches!(result, Err(PoolError::Connect { .. })));
    }
}
