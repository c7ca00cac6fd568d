//! Durable record store behind the coordinator.
//!
//! The coordinator keeps its working state in memory and uses a [`Store`]
//! as the source of truth for restart recovery. Every mutation is expressed
//! as a [`WriteBatch`] which the store must apply atomically: either every
//! record in the batch lands or none does.
//!
//! - [`memory::MemoryStore`]: in-process store for tests, with failure and
//!   latency injection
//! - [`file::FileStore`]: JSON snapshot plus an append-only batch log on
//!   disk, compacted into a fresh snapshot periodically

pub mod file;
pub mod memory;

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::ledger::{Account, LedgerEntry};
use crate::scheduler::{Job, JobTransition};
use crate::worker::Worker;

pub use file::FileStore;
pub use memory::MemoryStore;

/// A single change to the workers table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerWrite {
    Upsert(Worker),
    Remove(String),
}

impl WorkerWrite {
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerWrite::Upsert(worker) => &worker.id,
            WorkerWrite::Remove(id) => id,
        }
    }
}

/// Set of record changes persisted as one atomic unit.
///
/// Staging helpers return the most recent staged version of a record so that
/// an operation touching the same record twice sees its own earlier writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub accounts: Vec<Account>,
    pub ledger_entries: Vec<LedgerEntry>,
    pub workers: Vec<WorkerWrite>,
    pub jobs: Vec<Job>,
    pub transitions: Vec<JobTransition>,
    /// Finished jobs to drop, together with their transitions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evicted_jobs: Vec<Uuid>,
    /// Ledger entries recorded before this instant are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries_cutoff: Option<DateTime<Utc>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.ledger_entries.is_empty()
            && self.workers.is_empty()
            && self.jobs.is_empty()
            && self.transitions.is_empty()
            && self.evicted_jobs.is_empty()
            && self.entries_cutoff.is_none()
    }

    pub fn put_account(&mut self, account: Account) {
        self.accounts.push(account);
    }

    pub fn record_entry(&mut self, entry: LedgerEntry) {
        self.ledger_entries.push(entry);
    }

    pub fn put_worker(&mut self, worker: Worker) {
        self.workers.push(WorkerWrite::Upsert(worker));
    }

    pub fn remove_worker(&mut self, worker_id: &str) {
        self.workers.push(WorkerWrite::Remove(worker_id.to_string()));
    }

    pub fn put_job(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn record_transition(&mut self, transition: JobTransition) {
        self.transitions.push(transition);
    }

    pub fn evict_job(&mut self, job_id: Uuid) {
        self.evicted_jobs.push(job_id);
    }

    pub fn prune_entries_before(&mut self, cutoff: DateTime<Utc>) {
        self.entries_cutoff = Some(cutoff);
    }

    /// Job ids this batch evicts, for retain-style filtering.
    pub fn evicted_set(&self) -> HashSet<Uuid> {
        self.evicted_jobs.iter().copied().collect()
    }

    pub fn staged_account(&self, id: &str) -> Option<&Account> {
        self.accounts.iter().rev().find(|a| a.id == id)
    }

    pub fn staged_worker(&self, id: &str) -> Option<&WorkerWrite> {
        self.workers.iter().rev().find(|w| w.worker_id() == id)
    }

    pub fn staged_job(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.iter().rev().find(|j| j.id == *id)
    }
}

/// Full persisted state, used both as the store's table layout and as the
/// restart-recovery image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub accounts: BTreeMap<String, Account>,
    pub ledger_entries: Vec<LedgerEntry>,
    pub workers: BTreeMap<String, Worker>,
    pub jobs: BTreeMap<Uuid, Job>,
    pub transitions: Vec<JobTransition>,
}

impl Snapshot {
    /// Apply a batch in order. Later writes to the same record win.
    pub fn apply(&mut self, batch: &WriteBatch) {
        for account in &batch.accounts {
            self.accounts.insert(account.id.clone(), account.clone());
        }
        self.ledger_entries
            .extend(batch.ledger_entries.iter().cloned());
        for write in &batch.workers {
            match write {
                WorkerWrite::Upsert(worker) => {
                    self.workers.insert(worker.id.clone(), worker.clone());
                }
                WorkerWrite::Remove(id) => {
                    self.workers.remove(id);
                }
            }
        }
        for job in &batch.jobs {
            self.jobs.insert(job.id, job.clone());
        }
        self.transitions.extend(batch.transitions.iter().cloned());

        if !batch.evicted_jobs.is_empty() {
            let evicted = batch.evicted_set();
            self.jobs.retain(|id, _| !evicted.contains(id));
            self.transitions.retain(|t| !evicted.contains(&t.job_id));
        }
        if let Some(cutoff) = batch.entries_cutoff {
            self.ledger_entries.retain(|e| e.at >= cutoff);
        }
    }
}

/// Durable storage contract.
///
/// Implementations must make [`Store::apply`] atomic. A returned error means
/// the batch was not applied; the coordinator relies on that to keep its
/// in-memory view consistent.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Load everything persisted so far.
    async fn load(&self) -> Result<Snapshot>;

    /// Atomically persist a batch of record changes.
    async fn apply(&self, batch: &WriteBatch) -> Result<()>;
}
