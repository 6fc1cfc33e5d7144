//! The worker pool: N cooperative worker threads, each looping acquire →
//! probe → encode → finalize against the queue. The pool owns the only
//! process handles, so subprocess-level cancel/pause/resume route through
//! here; everything else is a queue operation.

mod classify;
mod finalize;
mod runner;

pub(crate) use classify::{EncoderFailure, classify_encoder_failure};
pub(crate) use finalize::{finalize_output, plan_paths};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{Config, MAX_WORKERS, OriginalHandling};
use crate::domain::JobId;
use crate::queue::{Queue, QueueError};
use crate::sync_ext::MutexExt;

/// How long a worker probe may run before it is killed.
const PROBE_DEADLINE: Duration = Duration::from_secs(30);

pub(crate) struct WorkerConfig {
    pub(crate) encoder_path: String,
    pub(crate) probe_path: String,
    pub(crate) probe_deadline: Duration,
    pub(crate) temp_dir: Option<PathBuf>,
    pub(crate) original_handling: OriginalHandling,
    pub(crate) allow_software_fallback: bool,
}

pub(crate) struct PoolState {
    desired: usize,
    live: usize,
    next_worker_id: usize,
    /// Job id → encoder pid for jobs currently owned by a worker.
    active: HashMap<JobId, u32>,
    /// Paused (SIGSTOP'd) running jobs.
    paused: HashSet<JobId>,
    /// Jobs whose subprocess should be treated as cancelled on exit.
    cancel_requested: HashSet<JobId>,
    shutdown: bool,
    handles: Vec<JoinHandle<()>>,
}

pub(crate) struct PoolInner {
    pub(crate) cfg: WorkerConfig,
    pub(crate) state: Mutex<PoolState>,
}

/// Handle to the pool. Cloning shares the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    queue: Queue,
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(queue: Queue, config: &Config) -> Self {
        let inner = Arc::new(PoolInner {
            cfg: WorkerConfig {
                encoder_path: config.encoder_path.clone(),
                probe_path: config.probe_path.clone(),
                probe_deadline: PROBE_DEADLINE,
                temp_dir: config.temp_path.clone(),
                original_handling: config.original_handling,
                allow_software_fallback: config.allow_software_fallback,
            },
            state: Mutex::new(PoolState {
                desired: config.effective_workers(),
                live: 0,
                next_worker_id: 0,
                active: HashMap::new(),
                paused: HashSet::new(),
                cancel_requested: HashSet::new(),
                shutdown: false,
                handles: Vec::new(),
            }),
        });
        Self { queue, inner }
    }

    /// Spawn workers up to the configured size.
    pub fn start(&self) {
        self.spawn_missing_workers();
    }

    /// Grow or shrink the pool. Excess workers exit after finishing their
    /// current job; they are never interrupted mid-encode.
    pub fn resize(&self, workers: usize) {
        let workers = workers.clamp(1, MAX_WORKERS);
        {
            let mut state = self.inner.state.lock_unpoisoned();
            if state.shutdown {
                return;
            }
            state.desired = workers;
        }
        self.spawn_missing_workers();
        // Shrinking: wake idle workers so they notice the lower target.
        self.queue.notify_workers();
    }

    pub fn worker_count(&self) -> usize {
        self.inner.state.lock_unpoisoned().desired
    }

    fn spawn_missing_workers(&self) {
        let to_spawn = {
            let mut state = self.inner.state.lock_unpoisoned();
            if state.shutdown {
                return;
            }
            let missing = state.desired.saturating_sub(state.live);
            state.live += missing;
            let first_id = state.next_worker_id;
            state.next_worker_id += missing;
            (first_id..first_id + missing).collect::<Vec<_>>()
        };

        for worker_id in to_spawn {
            let queue = self.queue.clone();
            let inner = self.inner.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("recodeq-worker-{worker_id}"))
                .spawn(move || runner::worker_loop(&queue, &inner));
            match spawned {
                Ok(handle) => {
                    self.inner.state.lock_unpoisoned().handles.push(handle);
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to spawn worker thread");
                    self.inner.state.lock_unpoisoned().live -= 1;
                }
            }
        }
    }

    /// Signal shutdown and join every worker after its current job.
    pub fn shutdown(&self) {
        let handles = {
            let mut state = self.inner.state.lock_unpoisoned();
            state.shutdown = true;
            std::mem::take(&mut state.handles)
        };
        self.queue.notify_workers();
        for handle in handles {
            drop(handle.join());
        }
    }

    /// If the job is owned by a worker, request cancellation of its
    /// subprocess and return true. Otherwise return false; the caller
    /// applies the queue-level cancel for non-running jobs.
    pub fn cancel_job(&self, id: JobId) -> bool {
        let pid = {
            let mut state = self.inner.state.lock_unpoisoned();
            let Some(pid) = state.active.get(&id).copied() else {
                return false;
            };
            state.cancel_requested.insert(id);
            // A stopped process cannot act on termination; continue it first.
            if state.paused.remove(&id) {
                signal_continue(pid);
            }
            pid
        };
        signal_terminate(pid);
        true
    }

    /// Pause the encoder subprocess of a running job via SIGSTOP. Errors
    /// with `Unsupported` on platforms without stop/continue signals.
    pub fn pause_job(&self, id: JobId) -> Result<(), QueueError> {
        if !cfg!(unix) {
            return Err(QueueError::Unsupported);
        }
        let pid = {
            let mut state = self.inner.state.lock_unpoisoned();
            let Some(pid) = state.active.get(&id).copied() else {
                return Err(self.not_running_error(id));
            };
            state.paused.insert(id);
            pid
        };
        signal_stop(pid);
        Ok(())
    }

    pub fn resume_job(&self, id: JobId) -> Result<(), QueueError> {
        if !cfg!(unix) {
            return Err(QueueError::Unsupported);
        }
        let pid = {
            let mut state = self.inner.state.lock_unpoisoned();
            if !state.paused.remove(&id) {
                return Err(self.not_running_error(id));
            }
            match state.active.get(&id).copied() {
                Some(pid) => pid,
                None => return Err(self.not_running_error(id)),
            }
        };
        signal_continue(pid);
        Ok(())
    }

    fn not_running_error(&self, id: JobId) -> QueueError {
        match self.queue.get(id) {
            Some(job) => QueueError::WrongState {
                id,
                actual: job.state,
                expected: "running",
            },
            None => QueueError::UnknownJob(id),
        }
    }

    /// Whether any worker currently owns a running job. Test/introspection
    /// helper.
    pub fn has_active_jobs(&self) -> bool {
        !self.inner.state.lock_unpoisoned().active.is_empty()
    }

    /// The probe program workers invoke for deferred probing.
    pub fn probe_program(&self) -> &str {
        &self.inner.cfg.probe_path
    }
}

impl PoolInner {
    pub(crate) fn register_active(&self, id: JobId, pid: u32) {
        self.state.lock_unpoisoned().active.insert(id, pid);
    }

    /// Drop the process handle for a job so pause/resume against a stale id
    /// become no-ops. Returns whether cancellation was requested.
    pub(crate) fn clear_active(&self, id: JobId) -> bool {
        let mut state = self.state.lock_unpoisoned();
        state.active.remove(&id);
        state.paused.remove(&id);
        state.cancel_requested.remove(&id)
    }

    pub(crate) fn cancel_pending(&self, id: JobId) -> bool {
        self.state.lock_unpoisoned().cancel_requested.contains(&id)
    }

    /// Worker-side exit check: true when this worker should wind down,
    /// either for shutdown or because the pool shrank.
    pub(crate) fn should_exit(&self) -> bool {
        let mut state = self.state.lock_unpoisoned();
        if state.shutdown || state.live > state.desired {
            state.live -= 1;
            true
        } else {
            false
        }
    }
}

// Queue-level cancellation is a state transition; these signals are the
// subprocess side, best-effort by design.

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        tracing::debug!(pid, signal, error = %err, "signal delivery failed");
    }
}

#[cfg(unix)]
fn signal_stop(pid: u32) {
    send_signal(pid, libc::SIGSTOP);
}

#[cfg(unix)]
fn signal_continue(pid: u32) {
    send_signal(pid, libc::SIGCONT);
}

#[cfg(unix)]
fn signal_terminate(pid: u32) {
    send_signal(pid, libc::SIGTERM);
}

#[cfg(not(unix))]
fn signal_stop(_pid: u32) {}

#[cfg(not(unix))]
fn signal_continue(_pid: u32) {}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) {
    // The worker loop observes the cancel flag and kills the child through
    // its own handle, so cancellation still works without kill(2).
}
