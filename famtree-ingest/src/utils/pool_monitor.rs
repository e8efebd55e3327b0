//! Connection pool monitoring utilities
//!
//! Instrumented transactions that log how long a pooled connection was
//! waited for and held. A commit holds its transaction for the whole import,
//! so these timings are the first thing to look at when polling stalls.

use famtree_common::{Error, Result};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::time::Instant;

/// Transaction wrapper that logs acquisition and release timing
pub struct MonitoredTransaction {
    tx: Option<Transaction<'static, Sqlite>>,
    caller: &'static str,
    acquired_at: Instant,
}

impl MonitoredTransaction {
    fn finished() -> Error {
        Error::Internal("transaction already finished".to_string())
    }

    /// Commit and log how long the connection was held
    pub async fn commit(mut self) -> Result<()> {
        let tx = self.tx.take().ok_or_else(Self::finished)?;
        tx.commit().await?;
        self.log_release("commit");
        Ok(())
    }

    /// Roll back and log how long the connection was held
    pub async fn rollback(mut self) -> Result<()> {
        let tx = self.tx.take().ok_or_else(Self::finished)?;
        tx.rollback().await?;
        self.log_release("rollback");
        Ok(())
    }

    /// Inner transaction, for executing queries
    pub fn inner_mut(&mut self) -> Result<&mut Transaction<'static, Sqlite>> {
        self.tx.as_mut().ok_or_else(Self::finished)
    }

    fn log_release(&self, how: &'static str) {
        let held_ms = self.acquired_at.elapsed().as_millis();
        if held_ms > 2000 {
            tracing::warn!(caller = self.caller, held_ms, how, "LONG TRANSACTION - connection held for extended period");
        } else {
            tracing::debug!(caller = self.caller, held_ms, how, "Connection released");
        }
    }
}

impl Drop for MonitoredTransaction {
    fn drop(&mut self) {
        if self.tx.is_some() {
            // sqlx rolls back on drop
            tracing::warn!(
                caller = self.caller,
                held_ms = self.acquired_at.elapsed().as_millis(),
                "Transaction dropped without commit or rollback"
            );
        }
    }
}

/// Begin a transaction with pool timing logs
pub async fn begin_monitored(pool: &SqlitePool, caller: &'static str) -> Result<MonitoredTransaction> {
    let start = Instant::now();
    tracing::debug!(caller, "Connection acquisition requested");

    let tx = pool.begin().await?;

    let wait_ms = start.elapsed().as_millis();
    if wait_ms > 1000 {
        tracing::warn!(caller, wait_ms, "SLOW CONNECTION ACQUISITION - pool may be saturated");
    } else {
        tracing::debug!(caller, wait_ms, "Connection acquired");
    }

    Ok(MonitoredTransaction {
        tx: Some(tx),
        caller,
        acquired_at: Instant::now(),
    })
}
