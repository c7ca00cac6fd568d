pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod reaper;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use coordinator::Coordinator;
pub use error::{CoordinatorError, Result};
