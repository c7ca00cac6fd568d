use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JobLimits;
use crate::error::{CoordinatorError, Result};
use crate::ledger::Credits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Legal edges of the job state machine:
    ///
    /// ```text
    /// PENDING --bind-->      RUNNING
    /// RUNNING --completed--> COMPLETED
    /// RUNNING --failed-->    FAILED
    /// RUNNING --reclaim-->   PENDING
    /// ```
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Pending)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

fn default_cores() -> u32 {
    1
}

fn default_ram_mb() -> u64 {
    512
}

fn default_priority() -> u8 {
    1
}

/// What a buyer asks for when submitting a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub title: String,
    pub description: String,
    /// Script body. Opaque to the coordinator.
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub parameters: Option<String>,
    #[serde(default = "default_cores")]
    pub required_cores: u32,
    #[serde(default = "default_ram_mb")]
    pub required_ram_mb: u64,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

impl JobSpec {
    pub fn new(title: &str, command: &str, required_cores: u32, required_ram_mb: u64) -> Self {
        Self {
            title: title.to_string(),
            description: title.to_string(),
            code: String::new(),
            command: command.to_string(),
            parameters: None,
            required_cores,
            required_ram_mb,
            priority: default_priority(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Reject malformed or out-of-range submissions.
    pub fn validate(&self, limits: &JobLimits) -> Result<()> {
        fn invalid(msg: String) -> Result<()> {
            Err(CoordinatorError::Validation(msg))
        }

        if self.title.trim().is_empty() {
            return invalid("Job title is required".to_string());
        }
        if self.title.chars().count() > limits.max_title_len {
            return invalid(format!(
                "Job title too long (max {} characters)",
                limits.max_title_len
            ));
        }
        if self.description.trim().is_empty() {
            return invalid("Job description is required".to_string());
        }
        if self.description.chars().count() > limits.max_description_len {
            return invalid(format!(
                "Job description too long (max {} characters)",
                limits.max_description_len
            ));
        }
        if self.command.trim().is_empty() && self.code.trim().is_empty() {
            return invalid("Job command or code is required".to_string());
        }
        if self.command.chars().count() > limits.max_command_len
            || self.code.chars().count() > limits.max_command_len
        {
            return invalid(format!(
                "Job command too long (max {} characters)",
                limits.max_command_len
            ));
        }
        if !(limits.min_cores..=limits.max_cores).contains(&self.required_cores) {
            return invalid(format!(
                "Required cores must be between {} and {}",
                limits.min_cores, limits.max_cores
            ));
        }
        if !(limits.min_ram_mb..=limits.max_ram_mb).contains(&self.required_ram_mb) {
            return invalid(format!(
                "Required RAM must be between {}MB and {}MB",
                limits.min_ram_mb, limits.max_ram_mb
            ));
        }
        if !(limits.min_priority..=limits.max_priority).contains(&self.priority) {
            return invalid(format!(
                "Priority must be between {} and {}",
                limits.min_priority, limits.max_priority
            ));
        }
        if let Some(pattern) = dangerous_pattern(&self.command) {
            return invalid(format!(
                "Command contains potentially dangerous pattern: {}",
                pattern
            ));
        }
        Ok(())
    }
}

fn dangerous_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\b(rm\s+-rf|del\s+/s|format|mkfs|dd\s+if=/dev/zero)\b",
            r"(?i)\b(sudo|su|doas)\b",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn dangerous_pattern(command: &str) -> Option<&'static str> {
    dangerous_patterns()
        .iter()
        .find(|re| re.is_match(command))
        .map(|re| re.as_str())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub account_id: String,
    pub title: String,
    pub description: String,
    pub code: String,
    pub command: String,
    pub parameters: Option<String>,
    pub required_cores: u32,
    pub required_ram_mb: u64,
    pub priority: u8,
    pub status: JobStatus,
    /// Charged once at submission.
    pub cost: Credits,
    pub assigned_worker: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: DateTime<Utc>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(
        spec: JobSpec,
        account_id: &str,
        cost: Credits,
        created_at: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), spec, account_id, cost, created_at, timeout)
    }

    pub fn with_id(
        id: Uuid,
        spec: JobSpec,
        account_id: &str,
        cost: Credits,
        created_at: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Self {
        Self {
            id,
            account_id: account_id.to_string(),
            title: spec.title,
            description: spec.description,
            code: spec.code,
            command: spec.command,
            parameters: spec.parameters,
            required_cores: spec.required_cores,
            required_ram_mb: spec.required_ram_mb,
            priority: spec.priority,
            status: JobStatus::Pending,
            cost,
            assigned_worker: None,
            created_at,
            started_at: None,
            completed_at: None,
            deadline: created_at
                .checked_add_signed(timeout)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            result: None,
            error: None,
        }
    }

    pub fn is_assigned_to(&self, worker_id: &str) -> bool {
        self.assigned_worker.as_deref() == Some(worker_id)
    }
}

/// Append-only history record of one status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTransition {
    pub job_id: Uuid,
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    pub worker_id: Option<String>,
    pub at: DateTime<Utc>,
}
