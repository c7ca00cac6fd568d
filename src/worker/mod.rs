//! Worker registry.
//!
//! Tracks the compute agents that sell capacity to the marketplace:
//! - **Registration**: declared CPU cores and RAM, upserted by id
//! - **Liveness**: last heartbeat, refreshed by heartbeats, polls and reports
//! - **Status**: `idle` workers may be bound to a job, `busy` ones may not.
//!   Workers restored after a restart are `offline` until they heartbeat or
//!   poll again
//!
//! # Components
//!
//! - [`Worker`]: one registered agent
//! - [`WorkerRegistry`]: the set of known workers, see [`registry`]

pub mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use registry::WorkerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub cpu_cores: u32,
    pub ram_mb: u64,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Most recent CPU load sample reported with a job status update.
    pub last_cpu_load: Option<f64>,
}

impl Worker {
    pub fn new(id: String, cpu_cores: u32, ram_mb: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            cpu_cores,
            ram_mb,
            status: WorkerStatus::Idle,
            last_heartbeat: now,
            registered_at: now,
            last_cpu_load: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    /// True once `now - last_heartbeat` exceeds `timeout`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat) > timeout
    }
}
