//! The job queue aggregate: an ordered, persistent mapping of job id → job,
//! guarded by a single lock, with a condvar for worker wake-ups and a
//! bounded-channel event fan-out. Workers never touch jobs directly; every
//! mutation goes through an operation here.

mod ops;
mod persist;
mod skip;
mod subscribers;

pub use ops::{FailureDetails, FileInfo};
pub use subscribers::{EventSubscription, SUBSCRIBER_BUFFER, SubscriberId};

pub(crate) use skip::check_skip_reason;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::config::{Config, Features};
use crate::domain::{JobId, JobState, Preset, TranscodeJob};
use crate::sync_ext::{CondvarExt, MutexExt};

use persist::PersistScheduler;
use subscribers::SubscriberSet;

/// Sliding-window cap for automatic software-fallback creation.
pub(crate) const FALLBACK_WINDOW: Duration = Duration::from_secs(5 * 60);
pub(crate) const FALLBACK_WINDOW_LIMIT: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unknown job id {0}")]
    UnknownJob(JobId),
    #[error("unknown preset `{0}`")]
    UnknownPreset(String),
    #[error("job {id} is {actual:?}, expected {expected}")]
    WrongState {
        id: JobId,
        actual: JobState,
        expected: &'static str,
    },
    #[error("invalid direction `{0}`, expected `up` or `down`")]
    InvalidDirection(String),
    #[error("pause/resume is not supported on this platform")]
    Unsupported,
}

/// Direction for single-step reordering of workable jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
}

impl FromStr for MoveDirection {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            other => Err(QueueError::InvalidDirection(other.to_string())),
        }
    }
}

/// Everything behind the queue lock. The job map and the order sequence
/// move together: a job is in both or in neither.
pub(crate) struct QueueCore {
    pub(crate) jobs: HashMap<JobId, TranscodeJob>,
    /// Job ids in creation order.
    pub(crate) order: Vec<JobId>,
    /// Absolute input/output path → completion time (epoch ms) for every
    /// job that reached `complete`.
    pub(crate) processed_paths: BTreeMap<String, i64>,
    pub(crate) total_saved: i64,
    /// Creation timestamps (epoch ms) of recent software fallbacks.
    pub(crate) fallback_times: VecDeque<i64>,
    /// Jobs a worker has acquired but not yet driven to a terminal state.
    /// Claims make acquisition at-most-once while a job is still workable
    /// (probing happens between acquisition and `start_job`).
    pub(crate) claimed: HashSet<JobId>,
}

impl QueueCore {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            order: Vec::new(),
            processed_paths: BTreeMap::new(),
            total_saved: 0,
            fallback_times: VecDeque::new(),
            claimed: HashSet::new(),
        }
    }

    pub(crate) fn first_workable_unclaimed(&self) -> Option<JobId> {
        self.order.iter().copied().find(|id| {
            !self.claimed.contains(id)
                && self.jobs.get(id).is_some_and(|j| j.state.is_workable())
        })
    }
}

pub(crate) struct Inner {
    pub(crate) state: Mutex<QueueCore>,
    /// Wakes idle workers when workable jobs (re)appear.
    pub(crate) cv: Condvar,
    pub(crate) next_job_id: AtomicU64,
    pub(crate) presets: Arc<Vec<Preset>>,
    pub(crate) features: Features,
    pub(crate) subscribers: SubscriberSet,
    pub(crate) persist: PersistScheduler,
    pub(crate) queue_file: PathBuf,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.persist.shutdown();
    }
}

/// Cheap cloneable handle to the queue aggregate.
#[derive(Clone)]
pub struct Queue {
    pub(crate) inner: Arc<Inner>,
}

impl Queue {
    /// Construct the queue, restoring the persisted snapshot when the
    /// configured queue file exists. Any job that was `running` at snapshot
    /// time is re-classified to `pending` with its progress cleared; this is
    /// the sole crash-recovery primitive.
    pub fn new(config: &Config) -> Self {
        let mut core = QueueCore::new();
        let mut max_id = 0;

        if let Some(snapshot) = persist::load_queue_file(&config.queue_file) {
            let mut jobs: HashMap<JobId, TranscodeJob> = HashMap::new();
            for mut job in snapshot.jobs {
                if job.state == JobState::Running {
                    tracing::info!(job = job.id, "re-classifying interrupted running job to pending");
                    job.state = JobState::Pending;
                    job.progress = 0.0;
                    job.speed = 0.0;
                    job.eta.clear();
                }
                max_id = max_id.max(job.id);
                jobs.insert(job.id, job);
            }

            // Repair the order sequence so map and order agree: drop ids
            // without a job, de-duplicate, and append jobs the persisted
            // order missed.
            let mut seen: HashSet<JobId> = HashSet::with_capacity(jobs.len());
            let mut order: Vec<JobId> = snapshot
                .order
                .into_iter()
                .filter(|id| jobs.contains_key(id) && seen.insert(*id))
                .collect();
            let mut missing: Vec<JobId> = jobs
                .keys()
                .copied()
                .filter(|id| !seen.contains(id))
                .collect();
            missing.sort_unstable();
            order.extend(missing);

            core.jobs = jobs;
            core.order = order;
            core.processed_paths = snapshot.processed_paths;
            core.total_saved = snapshot.total_saved;
        }

        let inner = Arc::new(Inner {
            state: Mutex::new(core),
            cv: Condvar::new(),
            next_job_id: AtomicU64::new(max_id + 1),
            presets: Arc::new(config.presets.clone()),
            features: config.features,
            subscribers: SubscriberSet::new(),
            persist: PersistScheduler::new(),
            queue_file: config.queue_file.clone(),
        });

        persist::spawn_saver(Arc::downgrade(&inner), &inner.persist);

        Self { inner }
    }

    pub fn preset(&self, preset_id: &str) -> Option<Preset> {
        self.inner.presets.iter().find(|p| p.id == preset_id).cloned()
    }

    /// Register a new event consumer with a bounded delivery buffer.
    pub fn subscribe(&self) -> EventSubscription {
        self.inner.subscribers.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.subscribers.unsubscribe(id)
    }

    /// Write the current snapshot immediately, bypassing the debounce. For
    /// graceful-shutdown paths.
    pub fn flush_persist_now(&self) {
        let snapshot = {
            let state = self.inner.state.lock_unpoisoned();
            persist::snapshot_locked(&state)
        };
        persist::write_queue_file(&self.inner.queue_file, &snapshot);
        self.inner.persist.clear_pending();
    }

    /// Block until a workable, unclaimed job may be available or the
    /// timeout elapses. Spurious wake-ups are fine; callers re-check by
    /// claiming.
    pub(crate) fn wait_for_work(&self, timeout: Duration) {
        let state = self.inner.state.lock_unpoisoned();
        if state.first_workable_unclaimed().is_some() {
            return;
        }
        drop(self.inner.cv.wait_timeout_unpoisoned(state, timeout));
    }

    /// Wake every thread blocked in [`Self::wait_for_work`]. Used by the
    /// worker pool on shutdown and resize.
    pub(crate) fn notify_workers(&self) {
        self.inner.cv.notify_all();
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests;
