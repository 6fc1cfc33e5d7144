use std::collections::BTreeMap;
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::domain::{JobId, TranscodeJob};
use crate::sync_ext::{CondvarExt, MutexExt};

use super::{Inner, QueueCore};

/// Coalescing window for snapshot writes. Bursts of mutations inside the
/// window produce a single write shortly after the last trigger.
pub(super) const SAVE_DEBOUNCE: Duration = Duration::from_millis(100);

/// Idle tick for the saver thread; bounds how long the thread lingers after
/// the queue is dropped.
const SAVER_IDLE_TICK: Duration = Duration::from_millis(250);

/// On-disk snapshot of the queue. `order` carries creation order;
/// `processed_paths` maps absolute input/output paths of completed jobs to
/// their completion time (epoch ms). A `BTreeMap` keeps serialization
/// stable so persist → load → persist reproduces the same bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PersistedQueue {
    pub(crate) jobs: Vec<TranscodeJob>,
    pub(crate) order: Vec<JobId>,
    #[serde(default)]
    pub(crate) processed_paths: BTreeMap<String, i64>,
    #[serde(default)]
    pub(crate) total_saved: i64,
}

pub(super) fn snapshot_locked(state: &QueueCore) -> PersistedQueue {
    let jobs = state
        .order
        .iter()
        .filter_map(|id| state.jobs.get(id).cloned())
        .collect();
    PersistedQueue {
        jobs,
        order: state.order.clone(),
        processed_paths: state.processed_paths.clone(),
        total_saved: state.total_saved,
    }
}

pub(super) fn load_queue_file(path: &Path) -> Option<PersistedQueue> {
    if !path.exists() {
        return None;
    }
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "failed to open queue file");
            return None;
        }
    };
    match serde_json::from_reader(BufReader::new(file)) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "failed to parse queue file");
            None
        }
    }
}

/// Serialize, write a sibling temp file, then rename over the target so a
/// crash mid-write never truncates the snapshot.
pub(super) fn write_queue_file(path: &Path, snapshot: &PersistedQueue) {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(err) = fs::create_dir_all(parent)
    {
        tracing::error!(path = %parent.display(), error = %err, "failed to create queue file directory");
        return;
    }

    let tmp_path = path.with_extension("tmp");
    let file = match fs::File::create(&tmp_path) {
        Ok(f) => f,
        Err(err) => {
            tracing::error!(path = %tmp_path.display(), error = %err, "failed to create temp queue file");
            return;
        }
    };
    if let Err(err) = serde_json::to_writer(&file, snapshot) {
        tracing::error!(path = %tmp_path.display(), error = %err, "failed to write queue snapshot");
        drop(fs::remove_file(&tmp_path));
        return;
    }
    drop(file);
    if let Err(err) = fs::rename(&tmp_path, path) {
        tracing::error!(
            from = %tmp_path.display(),
            to = %path.display(),
            error = %err,
            "failed to atomically rename queue snapshot"
        );
        drop(fs::remove_file(&tmp_path));
    }
}

struct SaverState {
    dirty: bool,
    first_dirty_at: Option<Instant>,
    shutdown: bool,
}

/// Mutator-facing handle for the debounced saver thread. `schedule` is a
/// flag flip plus a notify; the write itself happens on the saver thread,
/// outside the queue lock.
pub(crate) struct PersistScheduler {
    shared: Arc<(Mutex<SaverState>, Condvar)>,
}

impl PersistScheduler {
    pub(super) fn new() -> Self {
        Self {
            shared: Arc::new((
                Mutex::new(SaverState {
                    dirty: false,
                    first_dirty_at: None,
                    shutdown: false,
                }),
                Condvar::new(),
            )),
        }
    }

    pub(super) fn schedule(&self) {
        let (lock, cv) = &*self.shared;
        let mut state = lock.lock_unpoisoned();
        if !state.dirty {
            state.dirty = true;
            state.first_dirty_at = Some(Instant::now());
        }
        cv.notify_one();
    }

    pub(super) fn shutdown(&self) {
        let (lock, cv) = &*self.shared;
        lock.lock_unpoisoned().shutdown = true;
        cv.notify_one();
    }

    /// Clear any pending schedule; used by the flush-now path so the saver
    /// does not redundantly rewrite what was just written.
    pub(super) fn clear_pending(&self) {
        let (lock, _) = &*self.shared;
        let mut state = lock.lock_unpoisoned();
        state.dirty = false;
        state.first_dirty_at = None;
    }
}

/// Spawn the saver thread. It holds only a `Weak` reference so dropping the
/// queue lets it exit on its next tick.
pub(super) fn spawn_saver(inner: Weak<Inner>, scheduler: &PersistScheduler) {
    let shared = scheduler.shared.clone();
    let spawn_result = std::thread::Builder::new()
        .name("recodeq-queue-persist".to_string())
        .spawn(move || saver_loop(&inner, &shared));
    if let Err(err) = spawn_result {
        tracing::error!(error = %err, "failed to spawn queue persist thread");
    }
}

fn saver_loop(inner: &Weak<Inner>, shared: &Arc<(Mutex<SaverState>, Condvar)>) {
    let (lock, cv) = &**shared;
    loop {
        let should_write = {
            let mut state = lock.lock_unpoisoned();
            if state.shutdown {
                return;
            }
            if !state.dirty {
                let (next, _) = cv.wait_timeout_unpoisoned(state, SAVER_IDLE_TICK);
                state = next;
            }
            // Coalesce: hold off until the debounce window since the first
            // dirty mark has elapsed, absorbing any further triggers.
            while state.dirty && !state.shutdown {
                let elapsed = state
                    .first_dirty_at
                    .map(|t| t.elapsed())
                    .unwrap_or(SAVE_DEBOUNCE);
                if elapsed >= SAVE_DEBOUNCE {
                    break;
                }
                let (next, _) = cv.wait_timeout_unpoisoned(state, SAVE_DEBOUNCE - elapsed);
                state = next;
            }
            if state.shutdown {
                return;
            }
            let write = state.dirty;
            if write {
                state.dirty = false;
                state.first_dirty_at = None;
            }
            write
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if should_write {
            let snapshot = {
                let state = inner.state.lock_unpoisoned();
                snapshot_locked(&state)
            };
            write_queue_file(&inner.queue_file, &snapshot);
        }
    }
}
