use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::ledger::{Credits, Ledger, LedgerEntry};
use crate::scheduler::{
    Job, JobAssigner, JobQueue, JobSpec, JobStatus, JobTransition, ScoringPolicy, StatusReport,
};
use crate::store::{MemoryStore, Snapshot, Store, WriteBatch};
use crate::worker::{Worker, WorkerRegistry, WorkerStatus};

/// In-memory view of the engine. Only mutated through [`EngineState::apply`]
/// after the matching batch has been persisted.
#[derive(Debug)]
struct EngineState {
    ledger: Ledger,
    workers: WorkerRegistry,
    jobs: JobQueue,
}

impl EngineState {
    fn from_snapshot(snapshot: &Snapshot, config: &CoordinatorConfig) -> Self {
        Self {
            ledger: Ledger::from_snapshot(snapshot, config.starting_credits),
            workers: WorkerRegistry::from_snapshot(snapshot, config.max_workers),
            jobs: JobQueue::from_snapshot(snapshot, config.max_queue_size),
        }
    }

    fn apply(&mut self, batch: &WriteBatch) {
        self.ledger.apply(batch);
        self.workers.apply(batch);
        self.jobs.apply(batch);
    }
}

/// Outcome of one liveness sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReapReport {
    pub removed_workers: Vec<String>,
    pub requeued_jobs: Vec<Uuid>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.removed_workers.is_empty() && self.requeued_jobs.is_empty()
    }
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionReport {
    pub evicted_jobs: Vec<Uuid>,
    pub pruned_entries: usize,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.evicted_jobs.is_empty() && self.pruned_entries == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub degraded: bool,
    pub total_workers: usize,
    pub worker_counts: BTreeMap<String, usize>,
    pub total_jobs: usize,
    pub job_counts: BTreeMap<String, usize>,
    pub total_credits: Credits,
    pub active_accounts: usize,
}

/// Entry point for every engine operation.
///
/// Composes the ledger, worker registry, job store and assignment engine
/// behind one mutual-exclusion scope. Each mutating call:
///
/// 1. Stages its writes into a [`WriteBatch`] against the current view
/// 2. Persists the batch through the [`Store`] under `storage_timeout`
/// 3. Applies the batch to the in-memory view only if the write succeeded
///
/// A store error leaves both sides untouched. A timeout leaves the durable
/// outcome unknown, so the coordinator turns **degraded** and refuses
/// mutations until [`Coordinator::reconcile`] reloads from the store.
#[derive(Debug)]
pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<dyn Store>,
    assigner: JobAssigner,
    state: Mutex<EngineState>,
    degraded: AtomicBool,
}

impl Coordinator {
    /// Restore state from `store` and build the coordinator around it.
    ///
    /// Idle workers restored from the store are marked offline; they are
    /// offered jobs again once they heartbeat, poll or re-register.
    pub async fn open(store: Arc<dyn Store>, config: CoordinatorConfig) -> Result<Self> {
        let snapshot = match tokio::time::timeout(config.storage_timeout, store.load()).await {
            Ok(result) => result?,
            Err(_) => return Err(CoordinatorError::StorageTimeout(config.storage_timeout)),
        };
        let coordinator = Self::new(store, config, &snapshot);

        let offline = coordinator
            .mutate(|state, _, batch| Ok(state.workers.mark_idle_offline(batch)))
            .await?;
        if !offline.is_empty() {
            tracing::info!(count = offline.len(), "Restored workers marked offline");
        }
        Ok(coordinator)
    }

    /// Coordinator backed by a fresh [`MemoryStore`].
    pub fn in_memory(config: CoordinatorConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config, &Snapshot::default())
    }

    fn new(store: Arc<dyn Store>, config: CoordinatorConfig, snapshot: &Snapshot) -> Self {
        let state = EngineState::from_snapshot(snapshot, &config);
        tracing::info!(
            accounts = state.ledger.account_count(),
            workers = state.workers.len(),
            jobs = state.jobs.len(),
            "Coordinator state loaded"
        );

        Self {
            assigner: JobAssigner::new(ScoringPolicy::new(
                config.limits.min_priority,
                config.scheduling_epoch,
            )),
            config,
            store,
            state: Mutex::new(state),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_degraded() {
            return Err(CoordinatorError::Degraded);
        }
        Ok(())
    }

    /// Persist `batch`, then apply it to the in-memory view.
    async fn commit(&self, state: &mut EngineState, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let timeout = self.config.storage_timeout;
        match tokio::time::timeout(timeout, self.store.apply(&batch)).await {
            Ok(Ok(())) => {
                state.apply(&batch);
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Durable write failed, in-memory state unchanged");
                Err(e)
            }
            Err(_) => {
                self.degraded.store(true, Ordering::SeqCst);
                tracing::error!(
                    timeout = ?timeout,
                    "Durable write timed out, coordinator degraded until reconciled"
                );
                Err(CoordinatorError::StorageTimeout(timeout))
            }
        }
    }

    /// Run one staged mutation inside the engine's critical section.
    async fn mutate<T, F>(&self, stage: F) -> Result<T>
    where
        F: FnOnce(&EngineState, &JobAssigner, &mut WriteBatch) -> Result<T>,
    {
        self.ensure_writable()?;
        let mut state = self.state.lock().await;
        // A concurrent timeout may have degraded the engine while we waited.
        self.ensure_writable()?;

        let mut batch = WriteBatch::new();
        let out = stage(&*state, &self.assigner, &mut batch)?;
        self.commit(&mut state, batch).await?;
        Ok(out)
    }

    /// Reload the in-memory view from the durable store and leave degraded
    /// mode.
    pub async fn reconcile(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let timeout = self.config.storage_timeout;
        let snapshot = match tokio::time::timeout(timeout, self.store.load()).await {
            Ok(result) => result?,
            Err(_) => return Err(CoordinatorError::StorageTimeout(timeout)),
        };
        *state = EngineState::from_snapshot(&snapshot, &self.config);
        let was_degraded = self.degraded.swap(false, Ordering::SeqCst);
        tracing::info!(was_degraded, "Coordinator reconciled with durable store");
        Ok(())
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Register a worker, or refresh an existing registration.
    pub async fn register_worker(
        &self,
        worker_id: Option<String>,
        cpu_cores: u32,
        ram_mb: u64,
    ) -> Result<Worker> {
        let now = Utc::now();
        self.mutate(|state, _, batch| {
            state
                .workers
                .register(batch, worker_id, cpu_cores, ram_mb, now)
        })
        .await
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<Worker> {
        let now = Utc::now();
        self.mutate(|state, _, batch| state.workers.heartbeat(batch, worker_id, now))
            .await
    }

    /// Remove a worker and requeue the job it was running, in one write.
    /// Returns the ids of the requeued jobs.
    pub async fn unregister_worker(&self, worker_id: &str) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        self.mutate(|state, assigner, batch| {
            state.workers.unregister(batch, worker_id)?;
            assigner.reclaim(batch, &state.jobs, worker_id, now)
        })
        .await
    }

    pub async fn list_workers(&self) -> Vec<Worker> {
        self.state.lock().await.workers.list()
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Worker> {
        self.state
            .lock()
            .await
            .workers
            .get(worker_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::WorkerNotFound(worker_id.to_string()))
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Charge the job's cost and queue it, as a single durable write.
    ///
    /// Validation happens before anything is staged. If the account cannot
    /// cover the cost the job is not created and nothing is debited.
    pub async fn submit_job(&self, account_id: &str, spec: JobSpec) -> Result<Job> {
        validate_account_id(account_id)?;
        spec.validate(&self.config.limits)?;
        let cost = self
            .config
            .pricing
            .job_cost(spec.required_cores, spec.required_ram_mb);
        let now = Utc::now();
        let limits = &self.config.limits;
        let timeout = self.config.job_timeout_chrono();

        let job = self
            .mutate(|state, _, batch| {
                let job = state
                    .jobs
                    .create(batch, spec, account_id, cost, limits, now, timeout)?;
                if cost.is_zero() {
                    state.ledger.open(batch, account_id, now);
                } else {
                    let available = state.ledger.effective_balance(batch, account_id);
                    if !state
                        .ledger
                        .debit(batch, account_id, cost, Some(job.id.to_string()), now)
                    {
                        return Err(CoordinatorError::InsufficientCredits {
                            required: cost,
                            available,
                        });
                    }
                }
                Ok(job)
            })
            .await;

        match &job {
            Ok(job) => {
                tracing::info!(job_id = %job.id, account_id, cost = %job.cost, "Job submitted")
            }
            Err(e) => tracing::warn!(account_id, error = %e, "Job submission rejected"),
        }
        job
    }

    /// Select and bind the next job for a polling worker.
    pub async fn next_job(&self, worker_id: &str) -> Result<Option<Job>> {
        self.next_job_at(worker_id, Utc::now()).await
    }

    /// [`Coordinator::next_job`] evaluated at an explicit instant.
    pub async fn next_job_at(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        self.mutate(|state, assigner, batch| {
            assigner.next_job(batch, &state.workers, &state.jobs, worker_id, now)
        })
        .await
    }

    pub async fn report_status(&self, report: StatusReport) -> Result<Job> {
        let now = Utc::now();
        self.mutate(|state, assigner, batch| {
            assigner.report_status(batch, &state.workers, &state.jobs, &report, now)
        })
        .await
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        self.state
            .lock()
            .await
            .jobs
            .all_jobs()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn get_job(&self, job_id: &Uuid) -> Result<Job> {
        self.state
            .lock()
            .await
            .jobs
            .get_job(job_id)
            .cloned()
            .ok_or(CoordinatorError::JobNotFound(*job_id))
    }

    pub async fn job_history(&self, job_id: &Uuid) -> Result<Vec<JobTransition>> {
        let state = self.state.lock().await;
        if state.jobs.get_job(job_id).is_none() {
            return Err(CoordinatorError::JobNotFound(*job_id));
        }
        Ok(state.jobs.history(job_id).into_iter().cloned().collect())
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    /// Current balance; the account is created with the starting balance on
    /// first reference.
    pub async fn get_balance(&self, account_id: &str) -> Result<Credits> {
        validate_account_id(account_id)?;
        if let Some(balance) = self.state.lock().await.ledger.balance(account_id) {
            return Ok(balance);
        }
        let now = Utc::now();
        self.mutate(|state, _, batch| Ok(state.ledger.open(batch, account_id, now).balance))
            .await
    }

    /// Returns `Ok(false)` without any state change for a zero amount or an
    /// insufficient balance.
    pub async fn debit(&self, account_id: &str, amount: Credits) -> Result<bool> {
        validate_account_id(account_id)?;
        let now = Utc::now();
        self.mutate(|state, _, batch| Ok(state.ledger.debit(batch, account_id, amount, None, now)))
            .await
    }

    /// Returns `Ok(false)` without any state change for a zero amount.
    pub async fn credit(&self, account_id: &str, amount: Credits) -> Result<bool> {
        validate_account_id(account_id)?;
        let now = Utc::now();
        self.mutate(|state, _, batch| {
            Ok(state.ledger.credit(batch, account_id, amount, None, now))
        })
        .await
    }

    /// Move credits between accounts; both sides change or neither does.
    pub async fn transfer(&self, from: &str, to: &str, amount: Credits) -> Result<bool> {
        validate_account_id(from)?;
        validate_account_id(to)?;
        let now = Utc::now();
        self.mutate(|state, _, batch| Ok(state.ledger.transfer(batch, from, to, amount, now)))
            .await
    }

    pub async fn all_balances(&self) -> BTreeMap<String, Credits> {
        self.state.lock().await.ledger.balances()
    }

    /// Audit trail of one account, oldest first.
    pub async fn ledger_entries(&self, account_id: &str) -> Result<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        if state.ledger.account(account_id).is_none() {
            return Err(CoordinatorError::AccountNotFound(account_id.to_string()));
        }
        Ok(state
            .ledger
            .entries_for(account_id)
            .into_iter()
            .cloned()
            .collect())
    }

    // =========================================================================
    // Liveness & health
    // =========================================================================

    pub async fn reap_stale_workers(&self) -> Result<ReapReport> {
        self.reap_stale_workers_at(Utc::now()).await
    }

    /// Remove every worker silent for longer than `worker_timeout` and
    /// requeue the jobs they were running, as one durable write.
    pub async fn reap_stale_workers_at(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let timeout = self.config.worker_timeout_chrono();
        let report = self
            .mutate(|state, assigner, batch| {
                let mut report = ReapReport::default();
                for worker_id in state.workers.stale_workers(now, timeout) {
                    tracing::warn!(worker_id = %worker_id, "Removing stale worker");
                    state.workers.unregister(batch, &worker_id)?;
                    let requeued = assigner.reclaim(batch, &state.jobs, &worker_id, now)?;
                    report.requeued_jobs.extend(requeued);
                    report.removed_workers.push(worker_id);
                }
                Ok(report)
            })
            .await?;

        if !report.is_empty() {
            tracing::info!(
                removed = report.removed_workers.len(),
                requeued = report.requeued_jobs.len(),
                "Reaped stale workers"
            );
        }
        Ok(report)
    }

    pub async fn evict_expired(&self) -> Result<EvictionReport> {
        self.evict_expired_at(Utc::now()).await
    }

    /// Drop finished jobs (with their history) and ledger entries older than
    /// `history_retention`, as one durable write. Balances are kept.
    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> Result<EvictionReport> {
        let cutoff = now
            .checked_sub_signed(self.config.history_retention_chrono())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let report = self
            .mutate(|state, _, batch| {
                let evicted_jobs = state.jobs.evict_finished_before(batch, cutoff);
                let pruned_entries = state.ledger.entries_before(cutoff);
                if pruned_entries > 0 {
                    batch.prune_entries_before(cutoff);
                }
                Ok(EvictionReport {
                    evicted_jobs,
                    pruned_entries,
                })
            })
            .await?;

        if !report.is_empty() {
            tracing::info!(
                jobs = report.evicted_jobs.len(),
                ledger_entries = report.pruned_entries,
                cutoff = %cutoff,
                "Evicted expired history"
            );
        }
        Ok(report)
    }

    pub async fn health(&self) -> HealthSummary {
        let state = self.state.lock().await;
        let worker_counts = [WorkerStatus::Idle, WorkerStatus::Busy, WorkerStatus::Offline]
            .into_iter()
            .map(|s| (s.to_string(), state.workers.count_by_status(s)))
            .collect();
        let job_counts = [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ]
        .into_iter()
        .map(|s| (s.to_string(), state.jobs.count_by_status(s)))
        .collect();

        HealthSummary {
            degraded: self.is_degraded(),
            total_workers: state.workers.len(),
            worker_counts,
            total_jobs: state.jobs.len(),
            job_counts,
            total_credits: state.ledger.total(),
            active_accounts: state.ledger.account_count(),
        }
    }
}

fn validate_account_id(account_id: &str) -> Result<()> {
    if account_id.trim().is_empty() {
        return Err(CoordinatorError::Validation(
            "Account ID is required".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_counts_everything() {
        let coordinator = Coordinator::in_memory(CoordinatorConfig::default());
        coordinator
            .register_worker(Some("w1".into()), 4, 8192)
            .await
            .unwrap();
        coordinator
            .submit_job("alice", JobSpec::new("t", "echo", 1, 512))
            .await
            .unwrap();

        let health = coordinator.health().await;
        assert!(!health.degraded);
        assert_eq!(health.total_workers, 1);
        assert_eq!(health.worker_counts["idle"], 1);
        assert_eq!(health.total_jobs, 1);
        assert_eq!(health.job_counts["pending"], 1);
        assert_eq!(health.active_accounts, 1);
    }

    #[tokio::test]
    async fn blank_account_is_rejected() {
        let coordinator = Coordinator::in_memory(CoordinatorConfig::default());
        assert!(matches!(
            coordinator.get_balance("  ").await,
            Err(CoordinatorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn job_history_for_unknown_job() {
        let coordinator = Coordinator::in_memory(CoordinatorConfig::default());
        assert!(coordinator
            .job_history(&Uuid::new_v4())
            .await
            .unwrap_err()
            .is_not_found());
    }
}
