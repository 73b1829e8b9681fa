//! Bounded-concurrency queue manager for download jobs.
//!
//! This module tracks how many download jobs are executing and buffers the
//! rest in FIFO order:
//! - Configurable concurrent download limit (clamped to a safe range)
//! - Atomic admission (capacity check and slot claim in one critical section)
//! - An [`ActiveSlot`] guard that releases its slot on every exit path
//! - Event emission for queue state changes

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::job::{JobId, QueuedPlan};

/// Default maximum number of concurrent downloads.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 2;

/// Minimum allowed concurrent downloads.
pub const MIN_CONCURRENT_DOWNLOADS: usize = 1;

/// Maximum allowed concurrent downloads.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 4;

/// Capacity of the queue event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for the download queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of concurrent downloads.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,
}

const fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_DOWNLOADS
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
        }
    }
}

impl QueueConfig {
    /// Validate and clamp the `max_concurrent_downloads` value.
    pub fn validate(&mut self) {
        self.max_concurrent_downloads = self
            .max_concurrent_downloads
            .clamp(MIN_CONCURRENT_DOWNLOADS, MAX_CONCURRENT_DOWNLOADS);
    }
}

/// Event types emitted by the queue manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum QueueEvent {
    /// A job was buffered.
    Queued {
        /// The buffered job.
        job_id: JobId,
    },
    /// A buffered job was admitted and claimed a slot.
    Started {
        /// The admitted job.
        job_id: JobId,
    },
    /// A slot was released.
    SlotReleased {
        /// Active count after the release.
        active: usize,
    },
    /// A buffered job was removed before it started.
    Removed {
        /// The removed job.
        job_id: JobId,
    },
    /// Queue configuration was updated.
    ConfigUpdated(QueueConfig),
}

/// Snapshot of the queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueueStats {
    /// Jobs currently holding a slot.
    pub active_count: usize,
    /// Jobs waiting in the buffer.
    pub pending_count: usize,
    /// Configured concurrency limit.
    pub max_concurrent: usize,
}

/// Internal state for the queue manager.
struct QueueState {
    /// Jobs currently holding a slot.
    active: usize,
    /// Buffered jobs in arrival order.
    pending: VecDeque<QueuedPlan>,
    /// Jobs popped by [`QueueManager::claim_next`] and not yet registered
    /// with a runner.
    handing_over: HashSet<JobId>,
    /// Current configuration.
    config: QueueConfig,
}

impl QueueState {
    fn new(config: QueueConfig) -> Self {
        Self {
            active: 0,
            pending: VecDeque::new(),
            handing_over: HashSet::new(),
            config,
        }
    }

    const fn has_capacity(&self) -> bool {
        self.active < self.config.max_concurrent_downloads
    }
}

/// Tracks active downloads and buffers the overflow.
///
/// All state lives behind a single mutex, so every check-then-act sequence is
/// one critical section.
pub struct QueueManager {
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueManager {
    /// Create a queue manager with the default limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Create a queue manager with a custom configuration.
    #[must_use]
    pub fn with_config(mut config: QueueConfig) -> Self {
        config.validate();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(QueueState::new(config)),
            events,
        }
    }

    /// Whether a new job may start right now.
    pub fn can_start_new(&self) -> bool {
        self.state.lock().has_capacity()
    }

    /// Append a plan to the pending buffer. Never blocks on capacity.
    pub fn enqueue(&self, plan: QueuedPlan) {
        let job_id = plan.job_id();
        let pending = {
            let mut state = self.state.lock();
            state.pending.push_back(plan);
            state.pending.len()
        };
        debug!(%job_id, pending, "Buffered download job");
        self.emit(QueueEvent::Queued { job_id });
    }

    /// Append a plan unless it is already buffered, being handed over, or
    /// `is_running` reports it. The check and the append share one critical
    /// section.
    pub fn enqueue_unique(&self, plan: QueuedPlan, is_running: impl Fn(JobId) -> bool) -> bool {
        let job_id = plan.job_id();
        let pending = {
            let mut state = self.state.lock();
            if state.handing_over.contains(&job_id)
                || state.pending.iter().any(|p| p.job_id() == job_id)
                || is_running(job_id)
            {
                return false;
            }
            state.pending.push_back(plan);
            state.pending.len()
        };
        debug!(%job_id, pending, "Buffered download job");
        self.emit(QueueEvent::Queued { job_id });
        true
    }

    /// Pop the oldest pending plan.
    pub fn dequeue(&self) -> Option<QueuedPlan> {
        self.state.lock().pending.pop_front()
    }

    /// Claim a slot unconditionally.
    pub fn increment_active(&self) {
        let mut state = self.state.lock();
        state.active += 1;
    }

    /// Release a slot. The count never goes below zero.
    pub fn decrement_active(&self) {
        let active = {
            let mut state = self.state.lock();
            if state.active == 0 {
                warn!("Released a download slot while none were active");
            }
            state.active = state.active.saturating_sub(1);
            state.active
        };
        debug!(active, "Released download slot");
        self.emit(QueueEvent::SlotReleased { active });
    }

    /// Claim a slot if one is free.
    pub fn try_start(&self) -> bool {
        let mut state = self.state.lock();
        if state.has_capacity() {
            state.active += 1;
            true
        } else {
            false
        }
    }

    /// Claim a slot and pop the oldest pending plan, or do nothing.
    ///
    /// Either both happen or neither does.
    pub fn next_ready(&self) -> Option<QueuedPlan> {
        self.admit(false)
    }

    /// Like [`next_ready`](Self::next_ready), but the job stays marked as
    /// handing over until [`finish_handover`](Self::finish_handover), so
    /// [`enqueue_unique`](Self::enqueue_unique) keeps rejecting it meanwhile.
    pub fn claim_next(&self) -> Option<QueuedPlan> {
        self.admit(true)
    }

    /// The claimed job is now tracked by its runner (or was dropped).
    pub fn finish_handover(&self, job_id: JobId) {
        self.state.lock().handing_over.remove(&job_id);
    }

    /// Whether a claimed job has not been handed to a runner yet.
    pub fn is_handing_over(&self, job_id: JobId) -> bool {
        self.state.lock().handing_over.contains(&job_id)
    }

    fn admit(&self, mark_handover: bool) -> Option<QueuedPlan> {
        let plan = {
            let mut state = self.state.lock();
            if !state.has_capacity() {
                return None;
            }
            let plan = state.pending.pop_front()?;
            state.active += 1;
            if mark_handover {
                state.handing_over.insert(plan.job_id());
            }
            plan
        };
        info!(job_id = %plan.job_id(), "Admitted download job");
        self.emit(QueueEvent::Started {
            job_id: plan.job_id(),
        });
        Some(plan)
    }

    /// Number of jobs holding a slot.
    pub fn active_count(&self) -> usize {
        self.state.lock().active
    }

    /// Number of buffered jobs.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether a job is buffered.
    pub fn contains_pending(&self, job_id: JobId) -> bool {
        self.state
            .lock()
            .pending
            .iter()
            .any(|plan| plan.job_id() == job_id)
    }

    /// Remove a buffered job before it starts.
    pub fn remove_pending(&self, job_id: JobId) -> Option<QueuedPlan> {
        let removed = {
            let mut state = self.state.lock();
            let pos = state
                .pending
                .iter()
                .position(|plan| plan.job_id() == job_id)?;
            state.pending.remove(pos)
        };
        if removed.is_some() {
            info!(%job_id, "Removed buffered download job");
            self.emit(QueueEvent::Removed { job_id });
        }
        removed
    }

    /// Snapshot of the queue counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            active_count: state.active,
            pending_count: state.pending.len(),
            max_concurrent: state.config.max_concurrent_downloads,
        }
    }

    /// Current configuration.
    pub fn config(&self) -> QueueConfig {
        self.state.lock().config.clone()
    }

    /// Change the concurrency limit. Running jobs are not interrupted.
    pub fn set_max_concurrent(&self, max: usize) {
        let config = {
            let mut state = self.state.lock();
            state.config.max_concurrent_downloads = max;
            state.config.validate();
            state.config.clone()
        };
        info!(
            max_concurrent = config.max_concurrent_downloads,
            "Updated download concurrency limit"
        );
        self.emit(QueueEvent::ConfigUpdated(config));
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("QueueManager")
            .field("active", &stats.active_count)
            .field("pending", &stats.pending_count)
            .finish_non_exhaustive()
    }
}

/// A claimed execution slot, released when dropped.
#[must_use = "dropping the slot releases it immediately"]
pub struct ActiveSlot {
    queue: Arc<QueueManager>,
}

impl ActiveSlot {
    /// Take ownership of a slot already claimed through
    /// [`QueueManager::next_ready`], [`QueueManager::try_start`] or
    /// [`QueueManager::increment_active`].
    pub const fn adopt(queue: Arc<QueueManager>) -> Self {
        Self { queue }
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.queue.decrement_active();
    }
}

impl std::fmt::Debug for ActiveSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSlot").finish_non_exhaustive()
    }
}
