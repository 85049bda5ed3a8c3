//! Background repair loop for the validated release mode
//!
//! Released connections wait in the pending-repair queue until this loop
//! revalidates them. Each connection cycles
//! `pending -> revalidating -> ready`, or on failure
//! `pending -> revalidating -> retry wait -> pending`.
//! The retry wait belongs to the failed connection alone: it is parked with a
//! `retry_at` deadline while freshly released connections keep being served.
//! A failed revalidation never stops the loop. A panic does, and since the pool
//! could then never replenish itself the supervisor aborts the process.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use super::backend::Connection;
use super::connection::Shared;

/// A released connection waiting for revalidation
pub(crate) struct PendingRepair<C> {
    pub(crate) conn: C,
    /// Consecutive failed revalidations
    pub(crate) failures: u32,
    /// Earliest time of the next attempt, set after a failure
    retry_at: Option<Instant>,
}

impl<C> PendingRepair<C> {
    pub(crate) fn new(conn: C) -> Self {
        Self {
            conn,
            failures: 0,
            retry_at: None,
        }
    }
}

/// Start the repair loop and its supervisor. Returns the supervisor handle,
/// which completes once the loop has drained after shutdown.
pub(crate) fn spawn<C: Connection>(
    shared: Arc<Shared<C>>,
    rx: mpsc::UnboundedReceiver<PendingRepair<C>>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let span = shared.span.clone();
    let worker = tokio::spawn(run(shared, rx, shutdown).instrument(span.clone()));
    tokio::spawn(supervise(worker).instrument(span))
}

async fn supervise(worker: JoinHandle<()>) {
    match worker.await {
        Ok(()) => debug!("Repair loop stopped"),
        Err(e) if e.is_cancelled() => debug!("Repair loop cancelled"),
        Err(e) => {
            error!(error = %e, "Repair loop panicked; pool can no longer replenish connections");
            std::process::abort();
        }
    }
}

async fn run<C: Connection>(
    shared: Arc<Shared<C>>,
    mut rx: mpsc::UnboundedReceiver<PendingRepair<C>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        reconnect_interval_ms = shared.config.reconnect_interval.as_millis() as u64,
        max_attempts = ?shared.config.max_repair_attempts,
        "Repair loop started"
    );

    // Every entry gets the same interval, so deadlines are in FIFO order.
    let mut waiting: VecDeque<PendingRepair<C>> = VecDeque::new();

    loop {
        let next_retry = waiting.front().and_then(|item| item.retry_at);

        let mut item = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = sleep_until(next_retry) => match waiting.pop_front() {
                Some(item) => item,
                None => continue,
            },
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match item.conn.revalidate().await {
            Ok(()) => {
                if item.failures > 0 {
                    info!(attempts = item.failures + 1, "Connection repaired");
                } else {
                    debug!("Connection revalidated");
                }
                shared.repaired(item.conn);
            }
            Err(e) => {
                item.failures += 1;
                shared.record_repair_failure();
                warn!(attempt = item.failures, error = %e, "Connection revalidation failed");

                if shared
                    .config
                    .max_repair_attempts
                    .is_some_and(|max| item.failures >= max)
                {
                    warn!(attempts = item.failures, "Giving up on connection, freeing its slot");
                    shared.abandon_pending();
                    item.conn.close().await;
                    continue;
                }

                item.retry_at = Some(Instant::now() + shared.config.reconnect_interval);
                waiting.push_back(item);
            }
        }
    }

    // Nothing can be queued once the receiver is closed; close what is left.
    rx.close();
    let mut leftovers: Vec<_> = waiting.into_iter().collect();
    while let Ok(item) = rx.try_recv() {
        leftovers.push(item);
    }
    for _ in &leftovers {
        shared.abandon_pending();
    }
    let drained = leftovers.len();
    for mut item in leftovers {
        item.conn.close().await;
    }
    info!(drained, "Repair loop shut down");
}

/// Resolves at `deadline`, or never when nothing is waiting for a retry
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::super::{BoxError, ConnectionPool, Connector};
    use crate::config::{ConnectionInfo, PoolConfig, ReleaseMode};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Revalidation fails until `heal_after` attempts have been made
    struct Flaky {
        attempts: Arc<AtomicU32>,
        heal_after: u32,
    }

    #[async_trait]
    impl super::Connection for Flaky {
        async fn revalidate(&mut self) -> Result<(), BoxError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.heal_after {
                Ok(())
            } else {
                Err(format!("attempt {} refused", n).into())
            }
        }
    }

    struct FlakyConnector {
        attempts: Arc<AtomicU32>,
        heal_after: u32,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        type Connection = Flaky;

        async fn open(&self, _info: &ConnectionInfo) -> Result<Flaky, BoxError> {
            Ok(Flaky {
                attempts: Arc::clone(&self.attempts),
                heal_after: self.heal_after,
            })
        }
    }

    fn validated(max_repair_attempts: Option<u32>) -> PoolConfig {
        PoolConfig {
            capacity: 1,
            release_mode: ReleaseMode::Validated,
            reconnect_interval: Duration::from_millis(20),
            acquire_timeout: Duration::from_secs(2),
            max_repair_attempts,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retries_until_revalidation_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let connector = FlakyConnector {
            attempts: Arc::clone(&attempts),
            heal_after: 3,
        };
        let pool = ConnectionPool::new(validated(None), connector).await.unwrap();

        pool.acquire().await.unwrap().release();
        let lease = pool.acquire().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(pool.stats().repair_failures, 3);
        assert_eq!(pool.stats().repaired, 1);
        assert_eq!(pool.live_connection_count(), 1);
        drop(lease);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let connector = FlakyConnector {
            attempts: Arc::clone(&attempts),
            heal_after: u32::MAX,
        };
        let pool = ConnectionPool::new(validated(Some(2)), connector).await.unwrap();

        pool.acquire().await.unwrap().release();

        // The slot comes back once the connection is given up on, so a fresh
        // connection is opened instead of waiting forever.
        let lease = pool.acquire().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.stats().created, 2);
        assert_eq!(pool.pending_repair_count(), 0);
        drop(lease);
    }

    /// Connection 0 never revalidates, every other one always does
    struct OneBad(u32);

    #[async_trait]
    impl super::Connection for OneBad {
        async fn revalidate(&mut self) -> Result<(), BoxError> {
            if self.0 == 0 {
                Err("stuck".into())
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct OneBadConnector(AtomicU32);

    #[async_trait]
    impl Connector for OneBadConnector {
        type Connection = OneBad;

        async fn open(&self, _info: &ConnectionInfo) -> Result<OneBad, BoxError> {
            Ok(OneBad(self.0.fetch_add(1, Ordering::SeqCst)))
        }
    }

    #[tokio::test]
    async fn test_failed_connection_does_not_delay_others() {
        let config = PoolConfig {
            capacity: 2,
            initial_conns: 2,
            reconnect_interval: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(1),
            ..validated(None)
        };
        let pool = ConnectionPool::new(config, OneBadConnector::default())
            .await
            .unwrap();

        let bad = pool.acquire().await.unwrap();
        let good = pool.acquire().await.unwrap();
        assert_eq!((bad.0, good.0), (0, 1));

        bad.release();
        tokio::time::sleep(Duration::from_millis(50)).await;
        good.release();

        // Connection 0 is parked for 30s; connection 1 is served meanwhile.
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.0, 1);
        assert_eq!(pool.pending_repair_count(), 1);
    }

    #[tokio::test]
    async fn test_close_drains_pending_connections() {
        let attempts = Arc::new(AtomicU32::new(0));
        let connector = FlakyConnector {
            attempts,
            heal_after: u32::MAX,
        };
        let mut config = validated(None);
        config.reconnect_interval = Duration::from_secs(60);
        let pool = ConnectionPool::new(config, connector).await.unwrap();

        pool.acquire().await.unwrap().release();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.pending_repair_count(), 1);

        pool.close().await;
        assert_eq!(pool.pending_repair_count(), 0);
        assert_eq!(pool.live_connection_count(), 0);
    }
}
