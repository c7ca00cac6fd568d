use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CoordinatorError, Result};
use crate::store::{Snapshot, WorkerWrite, WriteBatch};
use crate::worker::{Worker, WorkerStatus};

/// Known workers, keyed by id.
///
/// Mutations are staged into a [`WriteBatch`] and only take effect through
/// [`WorkerRegistry::apply`] once the batch has been persisted.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: HashMap<String, Worker>,
    max_workers: usize,
}

impl WorkerRegistry {
    pub fn new(max_workers: usize) -> Self {
        Self {
            workers: HashMap::new(),
            max_workers,
        }
    }

    pub fn from_snapshot(snapshot: &Snapshot, max_workers: usize) -> Self {
        Self {
            workers: snapshot
                .workers
                .values()
                .map(|w| (w.id.clone(), w.clone()))
                .collect(),
            max_workers,
        }
    }

    pub fn get(&self, worker_id: &str) -> Option<&Worker> {
        self.workers.get(worker_id)
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.workers.contains_key(worker_id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// All workers, oldest registration first.
    pub fn list(&self) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self.workers.values().cloned().collect();
        workers.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        workers
    }

    pub fn count_by_status(&self, status: WorkerStatus) -> usize {
        self.workers.values().filter(|w| w.status == status).count()
    }

    /// Workers whose last heartbeat is older than `timeout`.
    pub fn stale_workers(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<String> {
        let mut stale: Vec<String> = self
            .workers
            .values()
            .filter(|w| w.is_stale(now, timeout))
            .map(|w| w.id.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Current view of a worker including writes already staged in `batch`.
    pub fn current(&self, batch: &WriteBatch, worker_id: &str) -> Option<Worker> {
        match batch.staged_worker(worker_id) {
            Some(WorkerWrite::Upsert(worker)) => Some(worker.clone()),
            Some(WorkerWrite::Remove(_)) => None,
            None => self.workers.get(worker_id).cloned(),
        }
    }

    fn require(&self, batch: &WriteBatch, worker_id: &str) -> Result<Worker> {
        self.current(batch, worker_id)
            .ok_or_else(|| CoordinatorError::WorkerNotFound(worker_id.to_string()))
    }

    /// Stage an upsert of the worker record.
    ///
    /// A new worker starts idle. Re-registering an existing id refreshes its
    /// capacity and heartbeat; a busy worker stays busy so the job bound to it
    /// is left alone.
    pub fn register(
        &self,
        batch: &mut WriteBatch,
        worker_id: Option<String>,
        cpu_cores: u32,
        ram_mb: u64,
        now: DateTime<Utc>,
    ) -> Result<Worker> {
        if cpu_cores == 0 {
            return Err(CoordinatorError::Validation(
                "Worker must declare at least one CPU core".to_string(),
            ));
        }
        if ram_mb == 0 {
            return Err(CoordinatorError::Validation(
                "Worker must declare a positive amount of RAM".to_string(),
            ));
        }

        let worker_id = match worker_id.map(|id| id.trim().to_string()) {
            Some(id) if !id.is_empty() => id,
            _ => format!("worker-{}", Uuid::new_v4().simple()),
        };

        let worker = match self.current(batch, &worker_id) {
            Some(mut existing) => {
                existing.cpu_cores = cpu_cores;
                existing.ram_mb = ram_mb;
                existing.last_heartbeat = now;
                if existing.status != WorkerStatus::Busy {
                    existing.status = WorkerStatus::Idle;
                }
                tracing::info!(worker_id = %worker_id, cpu_cores, ram_mb, status = %existing.status, "Worker re-registered");
                existing
            }
            None => {
                if self.workers.len() >= self.max_workers {
                    return Err(CoordinatorError::Validation(format!(
                        "Worker limit reached ({} workers)",
                        self.max_workers
                    )));
                }
                tracing::info!(worker_id = %worker_id, cpu_cores, ram_mb, "Worker registered");
                Worker::new(worker_id, cpu_cores, ram_mb, now)
            }
        };

        batch.put_worker(worker.clone());
        Ok(worker)
    }

    /// Stage a heartbeat. Unknown workers must re-register; an offline
    /// worker is back and becomes idle.
    pub fn heartbeat(
        &self,
        batch: &mut WriteBatch,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Worker> {
        let mut worker = self.require(batch, worker_id)?;
        worker.last_heartbeat = now;
        if worker.status == WorkerStatus::Offline {
            tracing::info!(worker_id, "Offline worker is back");
            worker.status = WorkerStatus::Idle;
        }
        batch.put_worker(worker.clone());
        Ok(worker)
    }

    /// Stage every idle worker as offline. Used on restart: restored workers
    /// are not offered jobs until they have been heard from again. Busy
    /// workers keep their binding. Returns the affected ids.
    pub fn mark_idle_offline(&self, batch: &mut WriteBatch) -> Vec<String> {
        let mut ids: Vec<String> = self
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Idle)
            .map(|w| w.id.clone())
            .collect();
        ids.sort();
        for id in &ids {
            if let Some(mut worker) = self.current(batch, id) {
                worker.status = WorkerStatus::Offline;
                batch.put_worker(worker);
            }
        }
        ids
    }

    /// Stage removal of the worker. Jobs bound to it are not touched here.
    pub fn unregister(&self, batch: &mut WriteBatch, worker_id: &str) -> Result<Worker> {
        let worker = self.require(batch, worker_id)?;
        batch.remove_worker(worker_id);
        tracing::info!(worker_id, "Worker unregistered");
        Ok(worker)
    }

    pub fn set_status(
        &self,
        batch: &mut WriteBatch,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<Worker> {
        let mut worker = self.require(batch, worker_id)?;
        if worker.status != status {
            tracing::debug!(worker_id, from = %worker.status, to = %status, "Worker status changed");
            worker.status = status;
        }
        batch.put_worker(worker.clone());
        Ok(worker)
    }

    /// Stage a load sample; also counts as a liveness signal.
    pub fn record_load(
        &self,
        batch: &mut WriteBatch,
        worker_id: &str,
        cpu_load: f64,
        now: DateTime<Utc>,
    ) -> Result<Worker> {
        let mut worker = self.require(batch, worker_id)?;
        worker.last_cpu_load = Some(cpu_load);
        worker.last_heartbeat = now;
        batch.put_worker(worker.clone());
        Ok(worker)
    }

    /// Install the worker writes of a persisted batch.
    pub fn apply(&mut self, batch: &WriteBatch) {
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
    }
}
