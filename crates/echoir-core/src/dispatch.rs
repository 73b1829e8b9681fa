//! Glue between the queue manager, the task runner and the pipeline.
//!
//! [`Dispatcher::pump`] drains the pending buffer while slots are free. Each
//! admitted job owns an [`ActiveSlot`] that is released by the runner's
//! completion callback, which then pumps again. A job that ends in any way
//! therefore frees its slot and lets the next buffered job start.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::job::{DownloadJob, DownloadStatus, JobId, QueuedPlan};
use crate::pipeline::JobExecutor;
use crate::queue::{ActiveSlot, QueueManager, QueueStats};
use crate::runner::{CompletionFn, SubmitOutcome, TaskFn, TaskRunner};
use crate::storage::StoragePlacement;
use crate::store::{DownloadStore, JobFilter};

/// What happened to a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was free and the job started.
    Started,
    /// The job is buffered until a slot frees up.
    Queued,
    /// The job was already buffered or running; nothing changed.
    Duplicate,
}

/// Admits jobs into execution and handles user actions on them.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<QueueManager>,
    runner: Arc<dyn TaskRunner>,
    executor: Arc<dyn JobExecutor>,
    store: Arc<dyn DownloadStore>,
    storage: Arc<dyn StoragePlacement>,
}

impl Dispatcher {
    /// Wire a dispatcher.
    pub fn new(
        queue: Arc<QueueManager>,
        runner: Arc<dyn TaskRunner>,
        executor: Arc<dyn JobExecutor>,
        store: Arc<dyn DownloadStore>,
        storage: Arc<dyn StoragePlacement>,
    ) -> Self {
        Self {
            queue,
            runner,
            executor,
            store,
            storage,
        }
    }

    /// The queue manager this dispatcher admits from.
    #[must_use]
    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    /// Queue counters.
    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Whether the job is buffered or running.
    pub fn is_tracked(&self, job_id: JobId) -> bool {
        self.queue.contains_pending(job_id)
            || self.queue.is_handing_over(job_id)
            || self.runner.is_active(job_id)
    }

    /// Buffer a job without starting anything. Returns `false` for duplicates.
    pub fn enqueue(&self, plan: QueuedPlan) -> bool {
        let job_id = plan.job_id();
        let runner = &self.runner;
        if !self
            .queue
            .enqueue_unique(plan, |id| runner.is_active(id))
        {
            debug!(%job_id, "Ignoring duplicate submission");
            return false;
        }
        true
    }

    /// Buffer a job and start whatever capacity allows.
    pub fn submit(&self, plan: QueuedPlan) -> Admission {
        let job_id = plan.job_id();
        if !self.enqueue(plan) {
            return Admission::Duplicate;
        }
        if self.pump().contains(&job_id) {
            Admission::Started
        } else {
            Admission::Queued
        }
    }

    /// Start buffered jobs while slots are free. Returns the ids started.
    pub fn pump(&self) -> Vec<JobId> {
        let mut started = Vec::new();
        while let Some(plan) = self.queue.claim_next() {
            let slot = ActiveSlot::adopt(Arc::clone(&self.queue));
            let job_id = plan.job_id();

            match self
                .runner
                .submit_unique(job_id, self.task_for(plan), self.completion(slot))
            {
                SubmitOutcome::Started => started.push(job_id),
                // The rejected completion callback drops its slot.
                SubmitOutcome::AlreadyActive => {
                    warn!(%job_id, "Job already running, dropped duplicate admission");
                }
            }
            self.queue.finish_handover(job_id);
        }
        if !started.is_empty() {
            debug!(count = started.len(), pending = self.queue.pending_len(), "Pumped queue");
        }
        started
    }

    fn task_for(&self, plan: QueuedPlan) -> TaskFn {
        let executor = Arc::clone(&self.executor);
        Box::new(move |cancel| {
            Box::pin(async move {
                match executor.execute(&plan, cancel).await {
                    Ok(outcome) => {
                        debug!(job_id = %outcome.job_id, "Job finished");
                    }
                    Err(e) if e.is_cancelled() => {
                        debug!(job_id = %plan.job_id(), "Job cancelled");
                    }
                    Err(e) => {
                        debug!(job_id = %plan.job_id(), error = %e, "Job failed");
                    }
                }
            })
        })
    }

    fn completion(&self, slot: ActiveSlot) -> CompletionFn {
        let dispatcher = self.clone();
        Box::new(move || {
            drop(slot);
            dispatcher.pump();
        })
    }

    /// Cancel a buffered or running job.
    ///
    /// A buffered job leaves the queue and keeps its `Queued` row. A running
    /// job is signalled; the pipeline resets it to `Queued` once it stops.
    pub fn cancel(&self, job_id: JobId) -> bool {
        if self.queue.remove_pending(job_id).is_some() {
            info!(%job_id, "Cancelled buffered job");
            return true;
        }
        self.runner.cancel(job_id)
    }

    /// Put a failed (or cancelled and idle) job back into the queue.
    pub fn retry(&self, job_id: JobId) -> Result<Admission> {
        let job = self.load(job_id)?;
        let idle_queued = job.status == DownloadStatus::Queued && !self.is_tracked(job_id);
        if job.status != DownloadStatus::Failed && !idle_queued {
            return Err(invalid(&job, "retry"));
        }

        self.store.reset_to_queued(job_id)?;
        info!(%job_id, name = %job.display_name(), "Retrying download");
        Ok(self.submit(QueuedPlan::new(DownloadJob {
            status: DownloadStatus::Queued,
            progress: 0,
            file_path: None,
            error: None,
            ..job
        })))
    }

    /// Delete a completed job's file and mark the row `Deleted`.
    pub async fn delete_file(&self, job_id: JobId) -> Result<()> {
        let job = self.load(job_id)?;
        let Some(path) = job.file_path.as_deref().filter(|_| job.status == DownloadStatus::Completed)
        else {
            return Err(invalid(&job, "delete file"));
        };

        self.storage.delete_file(path).await?;
        self.store.update_status(job_id, DownloadStatus::Deleted)?;
        info!(%job_id, path = %path.display(), "Deleted downloaded file");
        Ok(())
    }

    /// Remove a job's row. A buffered or running job is cancelled first.
    pub fn delete_from_history(&self, job_id: JobId) -> Result<bool> {
        if self.is_tracked(job_id) {
            self.cancel(job_id);
        }
        let removed = self.store.delete(job_id)?;
        if removed {
            info!(%job_id, "Removed job from history");
        }
        Ok(removed)
    }

    /// Requeue work left over from a previous run, oldest first.
    ///
    /// Interrupted rows are reset to `Queued` first. Returns how many jobs
    /// were buffered.
    pub fn recover(&self) -> Result<usize> {
        let interrupted = self.store.reset_interrupted()?;
        let mut queued = self.store.query(&JobFilter::Status(DownloadStatus::Queued))?;
        queued.reverse();

        let mut requeued = 0;
        for job in queued {
            if self.enqueue(QueuedPlan::new(job)) {
                requeued += 1;
            }
        }
        if requeued > 0 {
            info!(interrupted, requeued, "Recovered unfinished downloads");
        }
        self.pump();
        Ok(requeued)
    }

    fn load(&self, job_id: JobId) -> Result<DownloadJob> {
        self.store
            .get(job_id)?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }
}

fn invalid(job: &DownloadJob, action: &'static str) -> Error {
    Error::InvalidTransition {
        job_id: job.id.to_string(),
        action,
        status: job.status.to_string(),
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
