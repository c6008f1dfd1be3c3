pub mod error;
pub mod job;
pub mod pool;
pub mod stats;

pub use error::{JobError, PoolError};
pub use job::{Job, JobId, JobOutcome};
pub use pool::BoundedTaskPool;
pub use stats::PoolStats;
