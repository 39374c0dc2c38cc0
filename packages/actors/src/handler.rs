//! Job handler trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use jobs_core::{HandlerError, JobId, JobPayload, JobType};
use tokio_util::sync::CancellationToken;

use crate::queue::JobQueue;

/// Result type for job handlers.
pub type HandlerResult = Result<serde_json::Value, HandlerError>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Trait for job handlers.
///
/// Implement this trait to define how jobs of a specific type are processed.
/// Handlers may run more than once for the same job after a lease expires,
/// so they must tolerate re-execution.
pub trait JobHandler: Send + Sync + 'static {
    /// The job type this handler processes.
    fn job_type(&self) -> JobType;

    /// Process a job and return the result.
    fn handle(&self, ctx: JobContext) -> HandlerFuture;
}

/// Everything a handler gets to see about the job it runs.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: JobType,
    /// 1-based attempt number.
    pub attempt: u32,
    pub correlation_id: Option<String>,
    pub payload: JobPayload,
    pub progress: ProgressReporter,
    /// Fires on cancellation, timeout or worker shutdown.
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Return `HandlerError::cancelled()` if the token has fired.
    pub fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            Err(HandlerError::cancelled())
        } else {
            Ok(())
        }
    }

    /// Shorthand for `self.progress.report(progress)`.
    pub async fn report_progress(&self, progress: u8) {
        self.progress.report(progress).await;
    }
}

/// Reports handler progress for one job. Values are clamped to 100 and
/// never go backwards.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    sink: Option<(JobQueue, String)>,
    last: Arc<AtomicU8>,
}

impl ProgressReporter {
    pub(crate) fn new(job_id: JobId, queue: JobQueue, worker_id: String) -> Self {
        Self {
            job_id,
            sink: Some((queue, worker_id)),
            last: Arc::new(AtomicU8::new(0)),
        }
    }

    /// A reporter that only tracks the value, for running handlers directly.
    pub fn detached(job_id: JobId) -> Self {
        Self {
            job_id,
            sink: None,
            last: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Last reported value.
    pub fn current(&self) -> u8 {
        self.last.load(Ordering::SeqCst)
    }

    /// Persist `progress` if it is higher than the last stored value. The
    /// high-water mark only moves once the store accepted the write.
    pub async fn report(&self, progress: u8) {
        let progress = progress.min(100);
        if self.current() >= progress {
            return;
        }
        if let Some((queue, worker_id)) = &self.sink
            && let Err(e) = queue.report_progress(self.job_id, worker_id, progress).await
        {
            tracing::debug!("Dropped progress {} for job {}: {}", progress, self.job_id, e);
            return;
        }
        self.last.fetch_max(progress, Ordering::SeqCst);
    }
}

/// Registry for job handlers.
///
/// Maps job types to their handlers for dynamic dispatch.
#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for its type.
    pub fn register<H: JobHandler>(&mut self, handler: H) {
        let job_type = handler.job_type();
        if self.handlers.insert(job_type.clone(), Arc::new(handler)).is_some() {
            tracing::warn!("Replaced handler for job type {}", job_type);
        }
    }

    /// Get a handler for a job type.
    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Check if a handler exists for a job type.
    pub fn has_handler(&self, job_type: &JobType) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// List all registered job types.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// A simple function-based job handler.
pub struct FnHandler<F>
where
    F: Fn(JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    job_type: JobType,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    /// Create a new function-based handler.
    pub fn new(job_type: JobType, handler: F) -> Self {
        Self { job_type, handler }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    fn job_type(&self) -> JobType {
        self.job_type.clone()
    }

    fn handle(&self, ctx: JobContext) -> HandlerFuture {
        (self.handler)(ctx)
    }
}

/// Helper macro for creating job handlers from async blocks.
///
/// The body runs inside `async move` with the context bound to the given name.
#[macro_export]
macro_rules! job_handler {
    ($job_type:expr, |$ctx:ident| $body:expr) => {
        $crate::FnHandler::new($job_type, |$ctx: $crate::JobContext| -> $crate::HandlerFuture {
            Box::pin(async move {
                let result: $crate::HandlerResult = { $body };
                result
            })
        })
    };
}
