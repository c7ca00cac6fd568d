use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::JobLimits;
use crate::error::{CoordinatorError, Result};
use crate::ledger::Credits;
use crate::scheduler::job::{Job, JobSpec, JobStatus, JobTransition};
use crate::store::{Snapshot, WriteBatch};

const DEFAULT_MAX_JOBS: usize = 1_000;

/// Job records, their status transitions and the transition history.
///
/// The queue bound counts only non-terminal jobs; finished jobs stay
/// readable.
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<Uuid, Job>,
    history: Vec<JobTransition>,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            history: Vec::new(),
            max_jobs,
        }
    }

    pub fn from_snapshot(snapshot: &Snapshot, max_jobs: usize) -> Self {
        Self {
            jobs: snapshot.jobs.iter().map(|(id, j)| (*id, j.clone())).collect(),
            history: snapshot.transitions.clone(),
            max_jobs,
        }
    }

    /// Get a job by ID
    pub fn get_job(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Current view of a job including writes already staged in `batch`.
    pub fn current(&self, batch: &WriteBatch, id: &Uuid) -> Option<Job> {
        batch
            .staged_job(id)
            .or_else(|| self.jobs.get(id))
            .cloned()
    }

    /// Stage insertion of a new PENDING job carrying a precomputed cost.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        batch: &mut WriteBatch,
        spec: JobSpec,
        account_id: &str,
        cost: Credits,
        limits: &JobLimits,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Result<Job> {
        spec.validate(limits)?;
        let active = self.active_count();
        if active >= self.max_jobs {
            return Err(CoordinatorError::QueueFull(active));
        }

        let job = Job::new(spec, account_id, cost, now, timeout);
        batch.record_transition(JobTransition {
            job_id: job.id,
            from: None,
            to: JobStatus::Pending,
            worker_id: None,
            at: now,
        });
        batch.put_job(job.clone());
        Ok(job)
    }

    /// Stage a status change, enforcing the state machine.
    ///
    /// - `Pending -> Running` requires `worker_id` and records the start time
    /// - `Running -> Completed` stores `output` as the result
    /// - `Running -> Failed` stores `output` as the error
    /// - `Running -> Pending` clears the assignment so the job is queued again
    pub fn transition(
        &self,
        batch: &mut WriteBatch,
        id: &Uuid,
        to: JobStatus,
        worker_id: Option<&str>,
        output: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut job = self
            .current(batch, id)
            .ok_or(CoordinatorError::JobNotFound(*id))?;
        let from = job.status;
        if !from.can_transition_to(to) {
            return Err(CoordinatorError::InvalidTransition {
                job_id: *id,
                from,
                to,
            });
        }

        match to {
            JobStatus::Running => {
                let Some(worker_id) = worker_id else {
                    return Err(CoordinatorError::Validation(
                        "Binding a job requires a worker".to_string(),
                    ));
                };
                job.assigned_worker = Some(worker_id.to_string());
                job.started_at = Some(now);
            }
            JobStatus::Completed => {
                job.completed_at = Some(now);
                job.result = output;
            }
            JobStatus::Failed => {
                job.completed_at = Some(now);
                job.error = output;
            }
            JobStatus::Pending => {
                job.assigned_worker = None;
                job.started_at = None;
            }
        }
        job.status = to;

        batch.record_transition(JobTransition {
            job_id: *id,
            from: Some(from),
            to,
            worker_id: worker_id.map(str::to_string),
            at: now,
        });
        batch.put_job(job.clone());
        tracing::debug!(job_id = %id, from = %from, to = %to, "Job transition staged");
        Ok(job)
    }

    /// Get all pending jobs
    pub fn pending_jobs(&self) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .collect()
    }

    /// Get all jobs sorted chronologically by creation time
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// RUNNING jobs bound to a specific worker
    pub fn running_jobs_for(&self, worker_id: &str) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.is_assigned_to(worker_id))
            .collect()
    }

    /// Status history of one job, oldest first.
    pub fn history(&self, id: &Uuid) -> Vec<&JobTransition> {
        self.history.iter().filter(|t| t.job_id == *id).collect()
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs.values().filter(|j| j.status == status).count()
    }

    /// Jobs that still occupy a queue slot (pending or running).
    pub fn active_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .count()
    }

    /// Returns the current number of jobs in the store
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if the store is empty
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Returns true if no further job can be queued
    pub fn is_full(&self) -> bool {
        self.active_count() >= self.max_jobs
    }

    /// Stage eviction of every finished job that completed before `cutoff`.
    /// Returns the evicted ids. Pending and running jobs are never evicted.
    pub fn evict_finished_before(
        &self,
        batch: &mut WriteBatch,
        cutoff: DateTime<Utc>,
    ) -> Vec<Uuid> {
        let mut expired: Vec<Uuid> = self
            .jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .filter(|j| j.completed_at.is_some_and(|at| at < cutoff))
            .map(|j| j.id)
            .collect();
        expired.sort();
        for id in &expired {
            batch.evict_job(*id);
        }
        expired
    }

    /// Install the job and history writes of a persisted batch.
    pub fn apply(&mut self, batch: &WriteBatch) {
        for job in &batch.jobs {
            self.jobs.insert(job.id, job.clone());
        }
        self.history.extend(batch.transitions.iter().cloned());

        if !batch.evicted_jobs.is_empty() {
            let evicted = batch.evicted_set();
            self.jobs.retain(|id, _| !evicted.contains(id));
            self.history.retain(|t| !evicted.contains(&t.job_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hour() -> chrono::Duration {
        chrono::Duration::hours(1)
    }

    fn create(queue: &mut JobQueue, cores: u32) -> Job {
        let mut batch = WriteBatch::new();
        let job = queue
            .create(
                &mut batch,
                JobSpec::new("job", "echo", cores, 512),
                "alice",
                Credits::from_micros(10),
                &JobLimits::default(),
                Utc::now(),
                hour(),
            )
            .unwrap();
        queue.apply(&batch);
        job
    }

    fn transition(
        queue: &mut JobQueue,
        id: &Uuid,
        to: JobStatus,
        worker: Option<&str>,
        output: Option<&str>,
    ) -> Result<Job> {
        let mut batch = WriteBatch::new();
        let job = queue.transition(
            &mut batch,
            id,
            to,
            worker,
            output.map(str::to_string),
            Utc::now(),
        )?;
        queue.apply(&batch);
        Ok(job)
    }

    #[test]
    fn create_inserts_pending_job() {
        let mut queue = JobQueue::new();
        let job = create(&mut queue, 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending_jobs().len(), 1);
        assert_eq!(queue.get_job(&job.id).unwrap().cost, Credits::from_micros(10));
        assert_eq!(queue.history(&job.id).len(), 1);
    }

    #[test]
    fn create_validates_spec() {
        let queue = JobQueue::new();
        let mut batch = WriteBatch::new();
        let err = queue
            .create(
                &mut batch,
                JobSpec::new("job", "echo", 128, 512),
                "alice",
                Credits::ZERO,
                &JobLimits::default(),
                Utc::now(),
                hour(),
            )
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));
        assert!(batch.is_empty());
    }

    #[test]
    fn queue_bound_counts_active_jobs_only() {
        let mut queue = JobQueue::with_capacity(1);
        let job = create(&mut queue, 1);
        assert!(queue.is_full());

        let mut batch = WriteBatch::new();
        let err = queue
            .create(
                &mut batch,
                JobSpec::new("job", "echo", 1, 512),
                "alice",
                Credits::ZERO,
                &JobLimits::default(),
                Utc::now(),
                hour(),
            )
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::QueueFull(1)));

        transition(&mut queue, &job.id, JobStatus::Running, Some("w1"), None).unwrap();
        transition(&mut queue, &job.id, JobStatus::Completed, None, Some("ok")).unwrap();
        assert!(!queue.is_full());
    }

    #[test]
    fn full_lifecycle_records_history() {
        let mut queue = JobQueue::new();
        let job = create(&mut queue, 1);

        let running = transition(&mut queue, &job.id, JobStatus::Running, Some("w1"), None).unwrap();
        assert_eq!(running.assigned_worker.as_deref(), Some("w1"));
        assert!(running.started_at.is_some());
        assert_eq!(queue.running_jobs_for("w1").len(), 1);

        let done =
            transition(&mut queue, &job.id, JobStatus::Completed, Some("w1"), Some("42")).unwrap();
        assert_eq!(done.result.as_deref(), Some("42"));
        assert!(done.completed_at.is_some());

        let statuses: Vec<JobStatus> = queue.history(&job.id).iter().map(|t| t.to).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Pending, JobStatus::Running, JobStatus::Completed]
        );
    }

    #[test]
    fn failed_report_stores_error() {
        let mut queue = JobQueue::new();
        let job = create(&mut queue, 1);
        transition(&mut queue, &job.id, JobStatus::Running, Some("w1"), None).unwrap();
        let failed =
            transition(&mut queue, &job.id, JobStatus::Failed, Some("w1"), Some("oom")).unwrap();
        assert_eq!(failed.error.as_deref(), Some("oom"));
        assert!(failed.result.is_none());
    }

    #[test]
    fn reclaim_clears_assignment() {
        let mut queue = JobQueue::new();
        let job = create(&mut queue, 1);
        transition(&mut queue, &job.id, JobStatus::Running, Some("w1"), None).unwrap();
        let reclaimed = transition(&mut queue, &job.id, JobStatus::Pending, None, None).unwrap();

        assert!(reclaimed.assigned_worker.is_none());
        assert!(reclaimed.started_at.is_none());
        assert_eq!(queue.pending_jobs().len(), 1);
        assert!(queue.running_jobs_for("w1").is_empty());
    }

    #[test]
    fn terminal_jobs_reject_transitions() {
        let mut queue = JobQueue::new();
        let job = create(&mut queue, 1);
        transition(&mut queue, &job.id, JobStatus::Running, Some("w1"), None).unwrap();
        transition(&mut queue, &job.id, JobStatus::Completed, None, None).unwrap();

        for to in [JobStatus::Pending, JobStatus::Running, JobStatus::Failed] {
            let err = transition(&mut queue, &job.id, to, Some("w2"), None).unwrap_err();
            assert!(matches!(
                err,
                CoordinatorError::InvalidTransition {
                    from: JobStatus::Completed,
                    ..
                }
            ));
        }
    }

    #[test]
    fn pending_cannot_complete_directly() {
        let mut queue = JobQueue::new();
        let job = create(&mut queue, 1);
        assert!(transition(&mut queue, &job.id, JobStatus::Completed, None, None).is_err());
    }

    #[test]
    fn bind_requires_worker() {
        let mut queue = JobQueue::new();
        let job = create(&mut queue, 1);
        assert!(matches!(
            transition(&mut queue, &job.id, JobStatus::Running, None, None),
            Err(CoordinatorError::Validation(_))
        ));
    }

    #[test]
    fn unknown_job_is_not_found() {
        let mut queue = JobQueue::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            transition(&mut queue, &id, JobStatus::Running, Some("w"), None),
            Err(CoordinatorError::JobNotFound(_))
        ));
    }

    #[test]
    fn all_jobs_sorted_by_creation() {
        let mut queue = JobQueue::new();
        let first = create(&mut queue, 1);
        let second = create(&mut queue, 1);
        let ids: Vec<Uuid> = queue.all_jobs().iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), 2);
        if first.created_at < second.created_at {
            assert_eq!(ids, vec![first.id, second.id]);
        }
    }

    #[test]
    fn eviction_drops_only_old_finished_jobs() {
        let mut queue = JobQueue::new();
        let done = create(&mut queue, 1);
        let running = create(&mut queue, 1);
        let pending = create(&mut queue, 1);
        transition(&mut queue, &done.id, JobStatus::Running, Some("w1"), None).unwrap();
        transition(&mut queue, &done.id, JobStatus::Completed, None, Some("ok")).unwrap();
        transition(&mut queue, &running.id, JobStatus::Running, Some("w2"), None).unwrap();

        // Nothing finished before an instant in the past.
        let mut batch = WriteBatch::new();
        let none = queue.evict_finished_before(&mut batch, Utc::now() - hour());
        assert!(none.is_empty());
        assert!(batch.is_empty());

        let mut batch = WriteBatch::new();
        let evicted = queue.evict_finished_before(&mut batch, Utc::now() + hour());
        assert_eq!(evicted, vec![done.id]);
        queue.apply(&batch);

        assert!(queue.get_job(&done.id).is_none());
        assert!(queue.history(&done.id).is_empty());
        assert_eq!(queue.get_job(&running.id).unwrap().status, JobStatus::Running);
        assert_eq!(queue.get_job(&pending.id).unwrap().status, JobStatus::Pending);
        assert_eq!(queue.len(), 2);
    }
}
