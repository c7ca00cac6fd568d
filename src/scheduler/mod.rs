pub mod assigner;
pub mod job;
pub mod queue;

pub use assigner::{JobAssigner, ScoringPolicy, StatusReport};
pub use job::{Job, JobSpec, JobStatus, JobTransition};
pub use queue::JobQueue;
