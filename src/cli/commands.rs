use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::pool::{ConnectionPool, Connector, PoolError, PoolStats};

/// Outcome of a bench run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BenchReport {
    pub succeeded: u64,
    pub exhausted: u64,
    pub connect_errors: u64,
    pub elapsed: Duration,
}

/// Lease one connection and hand it straight back
pub async fn cmd_check<K: Connector>(pool: &ConnectionPool<K>) -> Result<PoolStats> {
    let lease = pool
        .acquire()
        .await
        .context("Failed to lease a connection")?;
    info!(live = pool.live_connection_count(), "Leased a connection");
    lease.release();

    let stats = pool.stats();
    print_stats(&stats);
    Ok(stats)
}

/// Run `workers` tasks, each acquiring and releasing `iterations` times
pub async fn cmd_bench<K: Connector>(
    pool: &ConnectionPool<K>,
    workers: usize,
    iterations: usize,
    hold: Duration,
) -> Result<BenchReport> {
    let start = Instant::now();
    let mut handles = Vec::with_capacity(workers);

    for worker in 0..workers {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let mut report = BenchReport::default();
            for _ in 0..iterations {
                match pool.acquire().await {
                    Ok(lease) => {
                        if !hold.is_zero() {
                            tokio::time::sleep(hold).await;
                        }
                        lease.release();
                        report.succeeded += 1;
                    }
                    Err(PoolError::Exhausted { .. }) => report.exhausted += 1,
                    Err(PoolError::Connect { .. }) => report.connect_errors += 1,
                    Err(e) => return Err(e),
                }
            }
            debug!(worker, succeeded = report.succeeded, "Worker finished");
            Ok(report)
        }));
    }

    let mut total = BenchReport::default();
    for handle in handles {
        let report = handle.await.context("Bench worker panicked")??;
        total.succeeded += report.succeeded;
        total.exhausted += report.exhausted;
        total.connect_errors += report.connect_errors;
    }
    total.elapsed = start.elapsed();

    println!(
        "{} leases in {:.2}s ({} exhausted, {} connect errors)",
        total.succeeded,
        total.elapsed.as_secs_f64(),
        total.exhausted,
        total.connect_errors
    );
    print_stats(&pool.stats());
    Ok(total)
}

fn print_stats(stats: &PoolStats) {
    println!("capacity:         {}", stats.capacity);
    println!("live:             {}", stats.live);
    println!("idle:             {}", stats.idle);
    println!("pending repair:   {}", stats.pending_repair);
    println!("created:          {}", stats.created);
    println!("reused:           {}", stats.reused);
    println!("connect failures: {}", stats.connect_failures);
    println!("exhausted:        {}", stats.exhausted);
    println!("repaired:         {}", stats.repaired);
    println!("repair failures:  {}", stats.repair_failures);
    println!("discarded:        {}", stats.discarded);
}
