//! Task execution keyed by download job id.
//!
//! A [`TaskRunner`] runs at most one task per job id. Submitting a job that
//! is already running keeps the existing task and reports
//! [`SubmitOutcome::AlreadyActive`]. Every task receives a
//! [`CancellationToken`], and its completion callback runs after the task is
//! deregistered, whether it finished, was cancelled or panicked.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::job::JobId;

/// The work submitted for a job.
pub type TaskFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// Runs once a submitted task has ended and been deregistered.
///
/// Dropped without being called when the submission is rejected.
pub type CompletionFn = Box<dyn FnOnce() + Send>;

/// Result of [`TaskRunner::submit_unique`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The task was registered and will run.
    Started,
    /// A task for this job id is already running; the new one was dropped.
    AlreadyActive,
}

/// Runs download tasks, at most one per job id.
pub trait TaskRunner: Send + Sync {
    /// Submit `task` under `job_id`, keeping any task already running for it.
    fn submit_unique(&self, job_id: JobId, task: TaskFn, on_complete: CompletionFn)
    -> SubmitOutcome;

    /// Signal cancellation to the task running for `job_id`.
    ///
    /// Returns `false` if no task is registered for it.
    fn cancel(&self, job_id: JobId) -> bool;

    /// Whether a task is registered for `job_id`.
    fn is_active(&self, job_id: JobId) -> bool;

    /// Ids of every registered task.
    fn active_tasks(&self) -> Vec<JobId>;
}

struct TaskEntry {
    token: CancellationToken,
    generation: u64,
    started_at: Instant,
}

type TaskTable = Arc<Mutex<HashMap<JobId, TaskEntry>>>;

/// Deregisters a task and runs its completion callback when dropped.
///
/// Living inside the spawned future, it also fires when the task panics.
struct Finisher {
    tasks: TaskTable,
    job_id: JobId,
    generation: u64,
    on_complete: Option<CompletionFn>,
}

impl Drop for Finisher {
    fn drop(&mut self) {
        {
            let mut tasks = self.tasks.lock();
            if tasks
                .get(&self.job_id)
                .is_some_and(|entry| entry.generation == self.generation)
                && let Some(entry) = tasks.remove(&self.job_id)
            {
                debug!(
                    job_id = %self.job_id,
                    elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
                    "Task finished"
                );
            }
        }
        if let Some(on_complete) = self.on_complete.take() {
            on_complete();
        }
    }
}

/// [`TaskRunner`] that spawns each task on a Tokio runtime.
pub struct TokioTaskRunner {
    handle: Handle,
    tasks: TaskTable,
    generation: AtomicU64,
}

impl TokioTaskRunner {
    /// Create a runner on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a Tokio runtime.
    pub fn new() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Configuration(format!("No Tokio runtime available: {e}")))?;
        Ok(Self::with_handle(handle))
    }

    /// Create a runner spawning onto `handle`.
    #[must_use]
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// How long the task for `job_id` has been running.
    pub fn running_for(&self, job_id: JobId) -> Option<Duration> {
        self.tasks
            .lock()
            .get(&job_id)
            .map(|entry| entry.started_at.elapsed())
    }

    /// Cancel every registered task. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let tasks = self.tasks.lock();
        for entry in tasks.values() {
            entry.token.cancel();
        }
        if !tasks.is_empty() {
            info!(count = tasks.len(), "Cancelled all running tasks");
        }
        tasks.len()
    }
}

impl TaskRunner for TokioTaskRunner {
    fn submit_unique(
        &self,
        job_id: JobId,
        task: TaskFn,
        on_complete: CompletionFn,
    ) -> SubmitOutcome {
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(&job_id) {
                debug!(%job_id, "Task already running, keeping existing");
                return SubmitOutcome::AlreadyActive;
            }
            tasks.insert(
                job_id,
                TaskEntry {
                    token: token.clone(),
                    generation,
                    started_at: Instant::now(),
                },
            );
        }

        let finisher = Finisher {
            tasks: Arc::clone(&self.tasks),
            job_id,
            generation,
            on_complete: Some(on_complete),
        };
        debug!(%job_id, "Spawning task");
        self.handle.spawn(async move {
            let _finisher = finisher;
            task(token).await;
        });
        SubmitOutcome::Started
    }

    fn cancel(&self, job_id: JobId) -> bool {
        if let Some(entry) = self.tasks.lock().get(&job_id) {
            entry.token.cancel();
            info!(%job_id, "Task cancelled");
            return true;
        }
        warn!(%job_id, "Failed to cancel task - not found or already completed");
        false
    }

    fn is_active(&self, job_id: JobId) -> bool {
        self.tasks.lock().contains_key(&job_id)
    }

    fn active_tasks(&self) -> Vec<JobId> {
        self.tasks.lock().keys().copied().collect()
    }
}

impl std::fmt::Debug for TokioTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioTaskRunner")
            .field("active", &self.tasks.lock().len())
            .finish_non_exhaustive()
    }
}

struct ManualTask {
    job_id: JobId,
    token: CancellationToken,
    task: TaskFn,
    on_complete: CompletionFn,
}

#[derive(Default)]
struct ManualState {
    registered: HashMap<JobId, CancellationToken>,
    ready: VecDeque<ManualTask>,
}

/// [`TaskRunner`] that only registers tasks; the caller drives them with
/// [`ManualTaskRunner::run_next`] on its own task.
///
/// Lets tests observe which jobs were admitted before any of them runs.
#[derive(Default)]
pub struct ManualTaskRunner {
    state: Mutex<ManualState>,
}

impl ManualTaskRunner {
    /// Create an empty runner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of registered tasks that have not run yet, in submission order.
    pub fn waiting(&self) -> Vec<JobId> {
        self.state.lock().ready.iter().map(|t| t.job_id).collect()
    }

    /// Run the oldest registered task to completion, then its callback.
    pub async fn run_next(&self) -> Option<JobId> {
        let next = self.state.lock().ready.pop_front()?;
        (next.task)(next.token).await;
        self.state.lock().registered.remove(&next.job_id);
        (next.on_complete)();
        Some(next.job_id)
    }

    /// Run tasks until none are left, including ones submitted meanwhile.
    pub async fn run_all(&self) -> usize {
        let mut count = 0;
        while self.run_next().await.is_some() {
            count += 1;
        }
        count
    }
}

impl TaskRunner for ManualTaskRunner {
    fn submit_unique(
        &self,
        job_id: JobId,
        task: TaskFn,
        on_complete: CompletionFn,
    ) -> SubmitOutcome {
        let mut state = self.state.lock();
        if state.registered.contains_key(&job_id) {
            return SubmitOutcome::AlreadyActive;
        }
        let token = CancellationToken::new();
        state.registered.insert(job_id, token.clone());
        state.ready.push_back(ManualTask {
            job_id,
            token,
            task,
            on_complete,
        });
        SubmitOutcome::Started
    }

    fn cancel(&self, job_id: JobId) -> bool {
        self.state
            .lock()
            .registered
            .get(&job_id)
            .map(CancellationToken::cancel)
            .is_some()
    }

    fn is_active(&self, job_id: JobId) -> bool {
        self.state.lock().registered.contains_key(&job_id)
    }

    fn active_tasks(&self) -> Vec<JobId> {
        self.state.lock().registered.keys().copied().collect()
    }
}

impl std::fmt::Debug for ManualTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualTaskRunner")
            .field("registered", &state.registered.len())
            .field("waiting", &state.ready.len())
            .finish()
    }
}
