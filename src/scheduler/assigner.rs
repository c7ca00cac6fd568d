use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoordinatorError, Result};
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::queue::JobQueue;
use crate::store::WriteBatch;
use crate::worker::{Worker, WorkerRegistry, WorkerStatus};

/// Score used to order candidate jobs. Lower wins.
///
/// `score = priority_weight(priority) - age_minutes`, where
/// `priority_weight(p) = (p - min_priority) * epoch_minutes`.
///
/// One step of priority is worth exactly one scheduling epoch of waiting, so
/// a more urgent job beats any less urgent job that has waited less than an
/// epoch longer, while a job that keeps waiting eventually overtakes newly
/// submitted urgent work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringPolicy {
    min_priority: u8,
    epoch_minutes: f64,
}

impl ScoringPolicy {
    pub fn new(min_priority: u8, epoch: Duration) -> Self {
        Self {
            min_priority,
            epoch_minutes: epoch.as_secs_f64() / 60.0,
        }
    }

    pub fn priority_weight(&self, priority: u8) -> f64 {
        f64::from(priority.saturating_sub(self.min_priority)) * self.epoch_minutes
    }

    /// Wall-clock minutes since creation. Clock skew never yields a negative age.
    pub fn age_minutes(job: &Job, now: DateTime<Utc>) -> f64 {
        let millis = now
            .signed_duration_since(job.created_at)
            .num_milliseconds()
            .max(0);
        millis as f64 / 60_000.0
    }

    pub fn score(&self, job: &Job, now: DateTime<Utc>) -> f64 {
        self.priority_weight(job.priority) - Self::age_minutes(job, now)
    }

    /// Total order over candidates: score, then earliest creation, then id.
    pub fn compare(&self, a: &Job, b: &Job, now: DateTime<Utc>) -> Ordering {
        self.score(a, now)
            .total_cmp(&self.score(b, now))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// True if the worker's declared capacity covers the job's requirement.
pub fn fits(job: &Job, worker: &Worker) -> bool {
    job.required_cores <= worker.cpu_cores && job.required_ram_mb <= worker.ram_mb
}

/// Pick the best PENDING job the worker can run.
pub fn select_candidate<'a, I>(
    policy: &ScoringPolicy,
    jobs: I,
    worker: &Worker,
    now: DateTime<Utc>,
) -> Option<&'a Job>
where
    I: IntoIterator<Item = &'a Job>,
{
    jobs.into_iter()
        .filter(|job| job.status == JobStatus::Pending && fits(job, worker))
        .min_by(|a, b| policy.compare(a, b, now))
}

/// Status update sent by a worker for the job it is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub job_id: Uuid,
    pub worker_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub cpu_load: f64,
    #[serde(default)]
    pub output: Option<String>,
}

/// Binds pending jobs to idle workers and applies their status reports.
///
/// Every method stages its writes into the caller's [`WriteBatch`]; the
/// caller holds the engine lock for the whole select-and-bind so no two
/// workers can bind the same job.
#[derive(Debug, Clone)]
pub struct JobAssigner {
    policy: ScoringPolicy,
}

impl JobAssigner {
    pub fn new(policy: ScoringPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Select and bind the next job for `worker_id`.
    ///
    /// Polling counts as a liveness signal, so the worker's heartbeat is
    /// refreshed whether or not a job is bound. Returns `Ok(None)` when the
    /// worker is not idle or nothing it can run is pending.
    pub fn next_job(
        &self,
        batch: &mut WriteBatch,
        workers: &WorkerRegistry,
        queue: &JobQueue,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let worker = workers.heartbeat(batch, worker_id, now)?;
        if !worker.is_idle() {
            tracing::debug!(worker_id, status = %worker.status, "Worker not idle, no job assigned");
            return Ok(None);
        }

        let Some(candidate) = select_candidate(&self.policy, queue.pending_jobs(), &worker, now)
        else {
            return Ok(None);
        };
        let score = self.policy.score(candidate, now);
        let job_id = candidate.id;

        let job = queue.transition(
            batch,
            &job_id,
            JobStatus::Running,
            Some(worker_id),
            None,
            now,
        )?;
        workers.set_status(batch, worker_id, WorkerStatus::Busy)?;

        tracing::info!(job_id = %job_id, worker_id, priority = job.priority, score, "Job assigned");
        Ok(Some(job))
    }

    /// Apply a worker's status report for its bound job.
    ///
    /// `Running` is accepted as a progress report and only records the load
    /// sample. `Completed`/`Failed` finish the job and free the worker.
    pub fn report_status(
        &self,
        batch: &mut WriteBatch,
        workers: &WorkerRegistry,
        queue: &JobQueue,
        report: &StatusReport,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        if !report.cpu_load.is_finite() || report.cpu_load < 0.0 {
            return Err(CoordinatorError::Validation(format!(
                "Invalid CPU load sample: {}",
                report.cpu_load
            )));
        }

        let job = queue
            .current(batch, &report.job_id)
            .ok_or(CoordinatorError::JobNotFound(report.job_id))?;
        if !job.is_assigned_to(&report.worker_id) {
            return Err(CoordinatorError::Conflict(format!(
                "Job {} is not assigned to worker {}",
                report.job_id, report.worker_id
            )));
        }

        let job = match report.status {
            JobStatus::Running if job.status == JobStatus::Running => job,
            JobStatus::Pending => {
                return Err(CoordinatorError::Validation(
                    "Workers may report running, completed or failed only".to_string(),
                ))
            }
            status => queue.transition(
                batch,
                &report.job_id,
                status,
                Some(&report.worker_id),
                report.output.clone(),
                now,
            )?,
        };

        if workers.current(batch, &report.worker_id).is_some() {
            workers.record_load(batch, &report.worker_id, report.cpu_load, now)?;
            if job.status.is_terminal() {
                workers.set_status(batch, &report.worker_id, WorkerStatus::Idle)?;
            }
        }

        tracing::info!(
            job_id = %report.job_id,
            worker_id = %report.worker_id,
            status = %job.status,
            cpu_load = report.cpu_load,
            "Job status reported"
        );
        Ok(job)
    }

    /// Return every RUNNING job bound to `worker_id` to PENDING.
    pub fn reclaim(
        &self,
        batch: &mut WriteBatch,
        queue: &JobQueue,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let job_ids: Vec<Uuid> = queue
            .running_jobs_for(worker_id)
            .iter()
            .map(|j| j.id)
            .collect();
        for job_id in &job_ids {
            queue.transition(batch, job_id, JobStatus::Pending, None, None, now)?;
            tracing::warn!(job_id = %job_id, worker_id, "Job reclaimed and requeued");
        }
        Ok(job_ids)
    }
}
