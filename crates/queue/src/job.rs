//! Jobs: an async operation, its arguments, and a completion callback.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Unique identifier assigned to every [`Job`] at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a job settled. Passed by reference to the job's completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(JobError),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn error(&self) -> Option<&JobError> {
        match self {
            Self::Succeeded => None,
            Self::Failed(e) => Some(e),
        }
    }
}

pub(crate) type Task = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;
pub(crate) type Callback = Box<dyn FnOnce(&JobOutcome) + Send>;

/// An opaque unit of work for a [`BoundedTaskPool`](crate::BoundedTaskPool).
///
/// The callable is not invoked until the pool starts the job, so building a
/// `Job` is cheap and side-effect free.
///
/// # Example
/// ```ignore
/// let job = Job::with_args("upload", upload_object, (bucket, key))
///     .on_complete(|outcome| info!(?outcome, "upload settled"));
/// pool.enqueue(job)?;
/// ```
pub struct Job {
    id: JobId,
    name: String,
    task: Task,
    on_complete: Option<Callback>,
}

impl Job {
    /// Create a job from a closure that produces the operation's future.
    pub fn new<F, Fut>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: JobId::new(),
            name: name.into(),
            task: Box::new(move || task().boxed()),
            on_complete: None,
        }
    }

    /// Create a job that calls `func(args)` when started.
    pub fn with_args<A, F, Fut>(name: impl Into<String>, func: F, args: A) -> Self
    where
        A: Send + 'static,
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(name, move || func(args))
    }

    /// Set the callback invoked once the operation settles, success or failure.
    pub fn on_complete<C>(mut self, callback: C) -> Self
    where
        C: FnOnce(&JobOutcome) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_parts(self) -> (JobId, String, Task, Option<Callback>) {
        (self.id, self.name, self.task, self.on_complete)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("has_callback", &self.on_complete.is_some())
            .finish()
    }
}

/// Invoke the task and wait for it, turning errors and panics into an outcome.
pub(crate) async fn execute(task: Task) -> JobOutcome {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(future) => future,
        Err(payload) => return JobOutcome::Failed(JobError::from_panic(payload.as_ref())),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => JobOutcome::Succeeded,
        Ok(Err(e)) => JobOutcome::Failed(JobError::Failed(format!("{e:#}"))),
        Err(payload) => JobOutcome::Failed(JobError::from_panic(payload.as_ref())),
    }
}
