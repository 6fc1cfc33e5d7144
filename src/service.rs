use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::config::{Config, Features};
use crate::domain::{JobId, MediaProbe, QueueStats, TranscodeJob};
use crate::queue::{
    EventSubscription, FailureDetails, FileInfo, MoveDirection, Queue, QueueError, SubscriberId,
};
use crate::worker::WorkerPool;

/// Deadline for probes the service runs on the admission path (deferred
/// probing disabled).
const ADMISSION_PROBE_DEADLINE: Duration = Duration::from_secs(30);

/// The operations surface the HTTP/event adapter consumes: one queue, one
/// worker pool, and the routing glue between them. Every method is a thin
/// delegation; the adapter stays a shim.
#[derive(Clone)]
pub struct TranscodeService {
    queue: Queue,
    pool: WorkerPool,
    features: Features,
}

impl TranscodeService {
    /// Build the queue (restoring any persisted snapshot) and the worker
    /// pool. Workers do not run until [`TranscodeService::start`].
    pub fn new(config: &Config) -> Self {
        let queue = Queue::new(config);
        let pool = WorkerPool::new(queue.clone(), config);
        Self {
            queue,
            pool,
            features: config.features,
        }
    }

    pub fn start(&self) {
        self.pool.start();
    }

    /// Stop workers after their current jobs and flush the queue snapshot.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.queue.flush_persist_now();
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    pub fn add(
        &self,
        input_path: &str,
        preset_id: &str,
        probe: &MediaProbe,
    ) -> Result<TranscodeJob, QueueError> {
        self.queue.add(input_path, preset_id, probe)
    }

    pub fn add_multiple(
        &self,
        probes: &[MediaProbe],
        preset_id: &str,
    ) -> Result<Vec<TranscodeJob>, QueueError> {
        self.queue.add_multiple(probes, preset_id)
    }

    /// Admit a file without waiting for its metadata. With deferred probing
    /// enabled (the default) the job enters `pending_probe` and the worker
    /// probes later; with it disabled, the probe runs here so the skip
    /// check applies at admission, falling back to deferred admission when
    /// the probe itself fails.
    pub fn add_without_probe(
        &self,
        input_path: &str,
        preset_id: &str,
        size: u64,
    ) -> Result<TranscodeJob, QueueError> {
        if !self.features.deferred_probing {
            match self.run_admission_probe(input_path) {
                Ok(probe) => return self.queue.add(input_path, preset_id, &probe),
                Err(err) => {
                    tracing::warn!(
                        input = input_path,
                        error = %err,
                        "admission probe failed, deferring to the worker"
                    );
                }
            }
        }
        self.queue.add_without_probe(input_path, preset_id, size)
    }

    pub fn add_multiple_without_probe(
        &self,
        files: &[FileInfo],
        preset_id: &str,
    ) -> Result<Vec<TranscodeJob>, QueueError> {
        if !self.features.deferred_probing {
            let probes: Result<Vec<MediaProbe>, _> = files
                .iter()
                .map(|f| self.run_admission_probe(&f.path))
                .collect();
            match probes {
                Ok(probes) => return self.queue.add_multiple(&probes, preset_id),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "admission probe failed for a batch, deferring to the workers"
                    );
                }
            }
        }
        self.queue.add_multiple_without_probe(files, preset_id)
    }

    fn run_admission_probe(&self, input_path: &str) -> anyhow::Result<MediaProbe> {
        crate::probe::run_probe(
            self.pool.probe_program(),
            Path::new(input_path),
            ADMISSION_PROBE_DEADLINE,
        )
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn get_all(&self) -> Vec<TranscodeJob> {
        self.queue.get_all()
    }

    pub fn get(&self, id: JobId) -> Result<TranscodeJob, QueueError> {
        self.queue.get(id).ok_or(QueueError::UnknownJob(id))
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn processed_paths(&self) -> BTreeMap<String, i64> {
        self.queue.processed_paths()
    }

    pub fn pending_paths(&self) -> Vec<String> {
        self.queue.pending_paths()
    }

    pub fn enqueued_paths(&self) -> Vec<String> {
        self.queue.enqueued_paths()
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.queue.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.queue.unsubscribe(id)
    }

    // ------------------------------------------------------------------
    // Job control
    // ------------------------------------------------------------------

    /// Cancel a job wherever it lives: a worker-owned job gets its
    /// subprocess signalled (the worker settles the state on exit), any
    /// other non-terminal job transitions directly.
    pub fn cancel_job(&self, id: JobId) -> Result<(), QueueError> {
        if self.pool.cancel_job(id) {
            return Ok(());
        }
        self.queue.cancel_job(id)
    }

    pub fn pause_job(&self, id: JobId) -> Result<(), QueueError> {
        self.pool.pause_job(id)
    }

    pub fn resume_job(&self, id: JobId) -> Result<(), QueueError> {
        self.pool.resume_job(id)
    }

    pub fn reorder_pending(&self, id: JobId, direction: MoveDirection) -> Result<(), QueueError> {
        self.queue.reorder_pending(id, direction)
    }

    pub fn move_pending(&self, id: JobId, before_id: JobId) -> Result<(), QueueError> {
        self.queue.move_pending(id, before_id)
    }

    pub fn remove(&self, id: JobId) -> Result<TranscodeJob, QueueError> {
        self.queue.remove(id)
    }

    pub fn retry_job(&self, id: JobId) -> Result<TranscodeJob, QueueError> {
        self.queue.retry_job(id)
    }

    pub fn force_retry_job(&self, id: JobId) -> Result<TranscodeJob, QueueError> {
        self.queue.force_retry_job(id)
    }

    pub fn retry_with_preset(&self, id: JobId, preset_id: &str) -> Result<TranscodeJob, QueueError> {
        self.queue.retry_with_preset(id, preset_id)
    }

    pub fn fail_job_with_details(
        &self,
        id: JobId,
        message: &str,
        details: FailureDetails,
    ) -> Result<(), QueueError> {
        self.queue.fail_job_with_details(id, message, details)
    }

    // ------------------------------------------------------------------
    // Bulk + history
    // ------------------------------------------------------------------

    pub fn clear(&self, include_completed: bool) -> usize {
        self.queue.clear(include_completed)
    }

    pub fn clear_processed_history(&self) {
        self.queue.clear_processed_history();
    }

    pub fn mark_processed_paths(&self, paths: &[String]) {
        self.queue.mark_processed_paths(paths);
    }

    pub fn resize_workers(&self, workers: usize) {
        self.pool.resize(workers);
    }

    /// Probe a file through the configured probe binary. Convenience for
    /// adapters that admit with metadata up front.
    pub fn probe_file(&self, path: &Path) -> anyhow::Result<MediaProbe> {
        crate::probe::run_probe(self.pool.probe_program(), path, ADMISSION_PROBE_DEADLINE)
    }
}
