//! In-memory store implementation.
//!
//! [`MemoryStore`] keeps the tables in a process-local [`Snapshot`]. Besides
//! backing tests and ephemeral deployments, it can inject write failures and
//! write latency so that the coordinator's storage-error and timeout handling
//! can be exercised.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::{Snapshot, Store, WriteBatch};
use crate::error::{CoordinatorError, Result};

fn poison_err<T>(_: PoisonError<T>) -> CoordinatorError {
    CoordinatorError::storage("lock poisoned")
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Snapshot>,
    failures_pending: AtomicUsize,
    write_delay_ms: AtomicU64,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing tables, e.g. to simulate a restart.
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            tables: RwLock::new(snapshot),
            ..Self::default()
        }
    }

    /// Make the next `count` calls to [`Store::apply`] fail without writing.
    pub fn fail_next_writes(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Delay every write by `delay` before it is applied. A caller that gives
    /// up before the delay elapses drops the write, so it never lands.
    pub fn set_write_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.write_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of batches successfully applied.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.clone())
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load(&self) -> Result<Snapshot> {
        self.snapshot()
    }

    async fn apply(&self, batch: &WriteBatch) -> Result<()> {
        if self.take_injected_failure() {
            return Err(CoordinatorError::storage("injected write failure"));
        }

        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        {
            let mut tables = self.tables.write().map_err(poison_err)?;
            tables.apply(batch);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
