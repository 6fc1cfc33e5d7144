use std::path::Path;
use std::sync::atomic::Ordering;

use crate::domain::{
    EncoderDescriptor, EncoderKind, EventKind, JobId, JobState, MediaProbe, Preset,
    ProgressUpdate, QueueEvent, QueueStats, TranscodeJob,
};
use crate::sync_ext::MutexExt;

use super::{
    FALLBACK_WINDOW, FALLBACK_WINDOW_LIMIT, MoveDirection, Queue, QueueCore, QueueError,
    check_skip_reason, now_ms,
};

/// Diagnostics attached to a failed job beyond the headline message.
#[derive(Debug, Clone, Default)]
pub struct FailureDetails {
    pub stderr_tail: String,
    pub exit_code: Option<i32>,
    pub args: Vec<String>,
    pub fallback_reason: String,
}

/// A path + size pair for bulk deferred-probe admission.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
}

impl Queue {
    fn alloc_id(&self) -> JobId {
        self.inner.next_job_id.fetch_add(1, Ordering::SeqCst)
    }

    fn resolve_preset(&self, preset_id: &str) -> Result<Preset, QueueError> {
        self.preset(preset_id)
            .ok_or_else(|| QueueError::UnknownPreset(preset_id.to_string()))
    }

    /// Flush scheduled work after a mutation: arm the debounced saver (when
    /// asked) and deliver any events enqueued under the lock.
    fn finish_mutation(&self, persist: bool) {
        if persist {
            self.inner.persist.schedule();
        }
        self.inner.subscribers.drain();
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Add a single probed file. The skip check runs immediately; jobs that
    /// cannot pay off are admitted directly in `skipped`.
    pub fn add(
        &self,
        input_path: &str,
        preset_id: &str,
        probe: &MediaProbe,
    ) -> Result<TranscodeJob, QueueError> {
        let preset = self.resolve_preset(preset_id)?;
        let job = build_probed_job(self.alloc_id(), input_path, &preset, probe);
        let workable = job.state.is_workable();

        let snapshot = {
            let mut state = self.inner.state.lock_unpoisoned();
            let kind = if job.state == JobState::Skipped {
                EventKind::Skipped
            } else {
                EventKind::Added
            };
            state.order.push(job.id);
            state.jobs.insert(job.id, job.clone());
            self.inner
                .subscribers
                .enqueue(QueueEvent::for_job(kind, &job));
            job
        };
        if workable {
            self.inner.cv.notify_one();
        }
        self.finish_mutation(true);
        Ok(snapshot)
    }

    /// Batched admission. After the batch commit a single `batch_added`
    /// event carries every non-skipped job, followed by one `skipped` event
    /// per skipped job, so a 10^4-file import is one broadcast, not 10^4.
    pub fn add_multiple(
        &self,
        probes: &[MediaProbe],
        preset_id: &str,
    ) -> Result<Vec<TranscodeJob>, QueueError> {
        let preset = self.resolve_preset(preset_id)?;
        let jobs: Vec<TranscodeJob> = probes
            .iter()
            .map(|probe| build_probed_job(self.alloc_id(), &probe.path, &preset, probe))
            .collect();

        let any_workable = jobs.iter().any(|j| j.state.is_workable());
        {
            let mut state = self.inner.state.lock_unpoisoned();
            for job in &jobs {
                state.order.push(job.id);
                state.jobs.insert(job.id, job.clone());
            }
            self.enqueue_batch_events(&jobs);
        }
        if any_workable {
            self.inner.cv.notify_all();
        }
        self.finish_mutation(true);
        Ok(jobs)
    }

    /// Admit a file whose metadata is not yet known. The worker that
    /// eventually acquires it runs the probe and re-evaluates the skip
    /// check via [`Queue::update_job_after_probe`].
    pub fn add_without_probe(
        &self,
        input_path: &str,
        preset_id: &str,
        size: u64,
    ) -> Result<TranscodeJob, QueueError> {
        let preset = self.resolve_preset(preset_id)?;
        let job = build_unprobed_job(self.alloc_id(), input_path, &preset, size);

        {
            let mut state = self.inner.state.lock_unpoisoned();
            state.order.push(job.id);
            state.jobs.insert(job.id, job.clone());
            self.inner
                .subscribers
                .enqueue(QueueEvent::for_job(EventKind::Added, &job));
        }
        self.inner.cv.notify_one();
        self.finish_mutation(true);
        Ok(job)
    }

    pub fn add_multiple_without_probe(
        &self,
        files: &[FileInfo],
        preset_id: &str,
    ) -> Result<Vec<TranscodeJob>, QueueError> {
        let preset = self.resolve_preset(preset_id)?;
        let jobs: Vec<TranscodeJob> = files
            .iter()
            .map(|f| build_unprobed_job(self.alloc_id(), &f.path, &preset, f.size))
            .collect();

        {
            let mut state = self.inner.state.lock_unpoisoned();
            for job in &jobs {
                state.order.push(job.id);
                state.jobs.insert(job.id, job.clone());
            }
            self.enqueue_batch_events(&jobs);
        }
        self.inner.cv.notify_all();
        self.finish_mutation(true);
        Ok(jobs)
    }

    fn enqueue_batch_events(&self, jobs: &[TranscodeJob]) {
        if self.inner.features.batched_sse {
            let batch: Vec<TranscodeJob> = jobs
                .iter()
                .filter(|j| j.state != JobState::Skipped)
                .cloned()
                .collect();
            if !batch.is_empty() {
                self.inner.subscribers.enqueue(QueueEvent::batch_added(batch));
            }
        } else {
            for job in jobs.iter().filter(|j| j.state != JobState::Skipped) {
                self.inner
                    .subscribers
                    .enqueue(QueueEvent::for_job(EventKind::Added, job));
            }
        }
        for job in jobs.iter().filter(|j| j.state == JobState::Skipped) {
            self.inner
                .subscribers
                .enqueue(QueueEvent::for_job(EventKind::Skipped, job));
        }
    }

    /// Record probe results for a `pending_probe` job and re-evaluate the
    /// skip check. Transitions to `skipped` (emitting `skipped`) or
    /// `pending` (emitting `probed`).
    pub fn update_job_after_probe(
        &self,
        id: JobId,
        probe: &MediaProbe,
    ) -> Result<TranscodeJob, QueueError> {
        let still_workable;
        let snapshot = {
            let mut state = self.inner.state.lock_unpoisoned();
            let job = state.jobs.get_mut(&id).ok_or(QueueError::UnknownJob(id))?;
            if !job.state.needs_probe() {
                return Err(QueueError::WrongState {
                    id,
                    actual: job.state,
                    expected: "pending_probe",
                });
            }
            let preset = self.resolve_preset(&job.preset_id)?;
            job.duration_ms = probe.duration_ms;
            job.bitrate = probe.bitrate;
            if probe.size > 0 {
                job.input_size = probe.size;
            }
            job.subtitle_codecs = probe.subtitle_codecs.clone();
            job.bit_depth = probe.bit_depth;
            job.pix_fmt = probe.pix_fmt.clone();
            job.video_codec = probe.video_codec.clone();

            let skip = if job.force {
                None
            } else {
                check_skip_reason(probe, &preset)
            };
            let kind = match skip {
                Some(reason) => {
                    job.state = JobState::Skipped;
                    job.skip_reason = reason;
                    state.claimed.remove(&id);
                    EventKind::Skipped
                }
                None => {
                    job.state = JobState::Pending;
                    EventKind::Probed
                }
            };
            still_workable = kind == EventKind::Probed;
            let snapshot = state.jobs.get(&id).cloned().expect("job present");
            self.inner
                .subscribers
                .enqueue(QueueEvent::for_job(kind, &snapshot));
            snapshot
        };
        if still_workable {
            self.inner.cv.notify_one();
        }
        self.finish_mutation(true);
        Ok(snapshot)
    }

    // ------------------------------------------------------------------
    // Acquisition and the running lifecycle
    // ------------------------------------------------------------------

    /// The earliest workable job by creation order, without claiming it.
    pub fn get_next(&self) -> Option<TranscodeJob> {
        let state = self.inner.state.lock_unpoisoned();
        state
            .order
            .iter()
            .find(|id| state.jobs.get(*id).is_some_and(|j| j.state.is_workable()))
            .and_then(|id| state.jobs.get(id).cloned())
    }

    /// Acquire the earliest workable job for exclusive processing. The find
    /// and the claim happen in one critical section, so two workers racing
    /// here observe distinct jobs or `None`.
    pub(crate) fn claim_next_workable(&self) -> Option<TranscodeJob> {
        let mut state = self.inner.state.lock_unpoisoned();
        let id = state.first_workable_unclaimed()?;
        state.claimed.insert(id);
        state.jobs.get(&id).cloned()
    }

    /// Give up a claim without a terminal transition (e.g. the job became
    /// `skipped` after its deferred probe).
    pub(crate) fn release_claim(&self, id: JobId) {
        let mut state = self.inner.state.lock_unpoisoned();
        state.claimed.remove(&id);
        drop(state);
        self.inner.cv.notify_all();
    }

    /// Transition a workable job to `running`, recording its start time,
    /// temp output, and decode→encode pipeline label.
    pub fn start_job(
        &self,
        id: JobId,
        temp_path: &Path,
        pipeline: &str,
    ) -> Result<TranscodeJob, QueueError> {
        let snapshot = {
            let mut state = self.inner.state.lock_unpoisoned();
            let job = state.jobs.get_mut(&id).ok_or(QueueError::UnknownJob(id))?;
            if !job.state.is_workable() {
                return Err(QueueError::WrongState {
                    id,
                    actual: job.state,
                    expected: "workable",
                });
            }
            job.state = JobState::Running;
            job.started_at = Some(now_ms());
            job.temp_path = Some(temp_path.to_string_lossy().into_owned());
            job.encoder.pipeline = pipeline.to_string();
            job.progress = 0.0;
            job.speed = 0.0;
            job.eta.clear();
            let snapshot = job.clone();
            self.inner
                .subscribers
                .enqueue(QueueEvent::for_job(EventKind::Started, &snapshot));
            snapshot
        };
        self.finish_mutation(true);
        Ok(snapshot)
    }

    /// Record a progress tick for a running job. Emits a `progress` event
    /// whose payload is exactly the delta, and never schedules a snapshot
    /// write: a crash loses recent progress, never the job record.
    pub fn update_progress(
        &self,
        id: JobId,
        progress: f64,
        speed: f64,
        eta: &str,
    ) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            let job = state.jobs.get_mut(&id).ok_or(QueueError::UnknownJob(id))?;
            if job.state != JobState::Running {
                return Err(QueueError::WrongState {
                    id,
                    actual: job.state,
                    expected: "running",
                });
            }
            job.progress = progress.clamp(0.0, 100.0);
            job.speed = speed;
            job.eta = eta.to_string();
            let event = if self.inner.features.delta_progress {
                QueueEvent::progress(ProgressUpdate {
                    id,
                    progress: job.progress,
                    speed: job.speed,
                    eta: job.eta.clone(),
                })
            } else {
                QueueEvent::for_job(EventKind::Progress, job)
            };
            self.inner.subscribers.enqueue(event);
        }
        self.finish_mutation(false);
        Ok(())
    }

    /// Finalize a successful transcode: record sizes and timestamps, update
    /// lifetime savings, and remember both paths in processed history.
    pub fn complete_job(
        &self,
        id: JobId,
        output_path: &Path,
        output_size: u64,
    ) -> Result<TranscodeJob, QueueError> {
        let snapshot = {
            let mut state = self.inner.state.lock_unpoisoned();
            let job = state.jobs.get_mut(&id).ok_or(QueueError::UnknownJob(id))?;
            if job.state != JobState::Running {
                return Err(QueueError::WrongState {
                    id,
                    actual: job.state,
                    expected: "running",
                });
            }
            let completed_at = now_ms();
            job.state = JobState::Complete;
            job.progress = 100.0;
            job.speed = 0.0;
            job.eta.clear();
            job.output_path = Some(output_path.to_string_lossy().into_owned());
            job.output_size = output_size;
            job.space_saved = job.input_size as i64 - output_size as i64;
            job.completed_at = Some(completed_at);
            job.transcode_secs = job
                .started_at
                .map(|started| ((completed_at - started) as f64 / 1000.0).max(0.0))
                .unwrap_or(0.0);
            job.temp_path = None;

            let snapshot = job.clone();
            state.total_saved += snapshot.space_saved;
            state
                .processed_paths
                .insert(snapshot.input_path.clone(), completed_at);
            if let Some(out) = snapshot.output_path.clone() {
                state.processed_paths.insert(out, completed_at);
            }
            state.claimed.remove(&id);
            self.inner
                .subscribers
                .enqueue(QueueEvent::for_job(EventKind::Complete, &snapshot));
            snapshot
        };
        self.finish_mutation(true);
        Ok(snapshot)
    }

    pub fn fail_job(&self, id: JobId, message: &str) -> Result<(), QueueError> {
        self.fail_job_with_details(id, message, FailureDetails::default())
    }

    pub fn fail_job_with_details(
        &self,
        id: JobId,
        message: &str,
        details: FailureDetails,
    ) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            let job = state.jobs.get_mut(&id).ok_or(QueueError::UnknownJob(id))?;
            if job.state.is_terminal() {
                return Err(QueueError::WrongState {
                    id,
                    actual: job.state,
                    expected: "non-terminal",
                });
            }
            job.state = JobState::Failed;
            job.error = message.to_string();
            job.stderr_tail = details.stderr_tail;
            job.exit_code = details.exit_code;
            if !details.args.is_empty() {
                job.encoder_args = details.args;
            }
            if !details.fallback_reason.is_empty() {
                job.fallback_reason = details.fallback_reason;
            }
            job.temp_path = None;
            job.speed = 0.0;
            job.eta.clear();
            let snapshot = job.clone();
            state.claimed.remove(&id);
            self.inner
                .subscribers
                .enqueue(QueueEvent::for_job(EventKind::Failed, &snapshot));
        }
        self.finish_mutation(true);
        Ok(())
    }

    /// Terminal, non-fatal pre-transcode outcome.
    pub fn skip_job(&self, id: JobId, reason: &str) -> Result<(), QueueError> {
        self.settle_job(id, JobState::Skipped, EventKind::Skipped, reason, "workable")
    }

    /// Terminal, non-fatal post-transcode outcome: the encode worked but
    /// the output was not smaller. No processed-history entry is made.
    pub fn no_gain_job(&self, id: JobId, reason: &str) -> Result<(), QueueError> {
        self.settle_job(id, JobState::NoGain, EventKind::NoGain, reason, "running")
    }

    fn settle_job(
        &self,
        id: JobId,
        target: JobState,
        kind: EventKind,
        reason: &str,
        expected: &'static str,
    ) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            let job = state.jobs.get_mut(&id).ok_or(QueueError::UnknownJob(id))?;
            let admissible = match target {
                JobState::Skipped => job.state.is_workable(),
                _ => job.state == JobState::Running,
            };
            if !admissible {
                return Err(QueueError::WrongState {
                    id,
                    actual: job.state,
                    expected,
                });
            }
            job.state = target;
            job.skip_reason = reason.to_string();
            job.temp_path = None;
            job.speed = 0.0;
            job.eta.clear();
            if target == JobState::NoGain {
                job.progress = 100.0;
            }
            let snapshot = job.clone();
            state.claimed.remove(&id);
            self.inner
                .subscribers
                .enqueue(QueueEvent::for_job(kind, &snapshot));
        }
        self.finish_mutation(true);
        Ok(())
    }

    /// Mark a job cancelled. Fails (benignly) when already terminal. This
    /// never signals the encoder subprocess; routing a cancellation to a
    /// live subprocess is the worker pool's job.
    pub fn cancel_job(&self, id: JobId) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            let job = state.jobs.get_mut(&id).ok_or(QueueError::UnknownJob(id))?;
            if job.state.is_terminal() {
                return Err(QueueError::WrongState {
                    id,
                    actual: job.state,
                    expected: "non-terminal",
                });
            }
            job.state = JobState::Cancelled;
            job.temp_path = None;
            job.speed = 0.0;
            job.eta.clear();
            let snapshot = job.clone();
            state.claimed.remove(&id);
            self.inner
                .subscribers
                .enqueue(QueueEvent::for_job(EventKind::Cancelled, &snapshot));
        }
        self.finish_mutation(true);
        Ok(())
    }

    /// Remove a job from the map and the order sequence. Running jobs are
    /// protected; cancel first.
    pub fn remove(&self, id: JobId) -> Result<TranscodeJob, QueueError> {
        let job = {
            let mut state = self.inner.state.lock_unpoisoned();
            let current = state.jobs.get(&id).ok_or(QueueError::UnknownJob(id))?;
            if current.state == JobState::Running {
                return Err(QueueError::WrongState {
                    id,
                    actual: current.state,
                    expected: "not running",
                });
            }
            let job = state.jobs.remove(&id).expect("checked above");
            state.order.retain(|o| *o != id);
            state.claimed.remove(&id);
            self.inner
                .subscribers
                .enqueue(QueueEvent::for_job(EventKind::Removed, &job));
            job
        };
        self.finish_mutation(true);
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Reordering
    // ------------------------------------------------------------------

    /// Move a workable job one step among the workable jobs. Non-workable
    /// entries keep their positions and relative order.
    pub fn reorder_pending(&self, id: JobId, direction: MoveDirection) -> Result<(), QueueError> {
        let moved = {
            let mut state = self.inner.state.lock_unpoisoned();
            self.require_workable(&state, id)?;
            let workable_positions: Vec<usize> = state
                .order
                .iter()
                .enumerate()
                .filter(|(_, jid)| {
                    state.jobs.get(*jid).is_some_and(|j| j.state.is_workable())
                })
                .map(|(pos, _)| pos)
                .collect();
            let here = workable_positions
                .iter()
                .position(|pos| state.order[*pos] == id)
                .expect("workable job must appear in order");
            let target = match direction {
                MoveDirection::Up => here.checked_sub(1),
                MoveDirection::Down => (here + 1 < workable_positions.len()).then_some(here + 1),
            };
            match target {
                Some(target) => {
                    state
                        .order
                        .swap(workable_positions[here], workable_positions[target]);
                    self.inner
                        .subscribers
                        .enqueue(QueueEvent::marker(EventKind::Reordered));
                    true
                }
                None => false,
            }
        };
        if moved {
            self.finish_mutation(true);
        }
        Ok(())
    }

    /// Move a workable job immediately before another workable job.
    pub fn move_pending(&self, id: JobId, before_id: JobId) -> Result<(), QueueError> {
        if id == before_id {
            return Ok(());
        }
        {
            let mut state = self.inner.state.lock_unpoisoned();
            self.require_workable(&state, id)?;
            self.require_workable(&state, before_id)?;
            state.order.retain(|o| *o != id);
            let at = state
                .order
                .iter()
                .position(|o| *o == before_id)
                .expect("target job must appear in order");
            state.order.insert(at, id);
            self.inner
                .subscribers
                .enqueue(QueueEvent::marker(EventKind::Reordered));
        }
        self.finish_mutation(true);
        Ok(())
    }

    fn require_workable(&self, state: &QueueCore, id: JobId) -> Result<(), QueueError> {
        let job = state.jobs.get(&id).ok_or(QueueError::UnknownJob(id))?;
        if !job.state.is_workable() {
            return Err(QueueError::WrongState {
                id,
                actual: job.state,
                expected: "workable",
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retries and fallback
    // ------------------------------------------------------------------

    /// Reset a `skipped` or `no_gain` job to `pending` with the force flag
    /// set, so the worker bypasses both the skip and no-gain checks.
    pub fn force_retry_job(&self, id: JobId) -> Result<TranscodeJob, QueueError> {
        let snapshot = {
            let mut state = self.inner.state.lock_unpoisoned();
            let job = state.jobs.get_mut(&id).ok_or(QueueError::UnknownJob(id))?;
            if !matches!(job.state, JobState::Skipped | JobState::NoGain) {
                return Err(QueueError::WrongState {
                    id,
                    actual: job.state,
                    expected: "skipped or no_gain",
                });
            }
            job.state = JobState::Pending;
            job.force = true;
            job.progress = 0.0;
            job.speed = 0.0;
            job.eta.clear();
            job.skip_reason.clear();
            job.error.clear();
            job.output_size = 0;
            job.space_saved = 0;
            job.completed_at = None;
            job.transcode_secs = 0.0;
            let snapshot = job.clone();
            self.inner
                .subscribers
                .enqueue(QueueEvent::for_job(EventKind::Added, &snapshot));
            snapshot
        };
        self.inner.cv.notify_one();
        self.finish_mutation(true);
        Ok(snapshot)
    }

    /// Replace a failed job with a fresh `pending_probe` twin so the worker
    /// re-probes from scratch.
    pub fn retry_job(&self, id: JobId) -> Result<TranscodeJob, QueueError> {
        let (input_path, preset_id, input_size) = {
            let state = self.inner.state.lock_unpoisoned();
            let job = state.jobs.get(&id).ok_or(QueueError::UnknownJob(id))?;
            if job.state != JobState::Failed {
                return Err(QueueError::WrongState {
                    id,
                    actual: job.state,
                    expected: "failed",
                });
            }
            (job.input_path.clone(), job.preset_id.clone(), job.input_size)
        };
        self.remove(id)?;
        self.add_without_probe(&input_path, &preset_id, input_size)
    }

    /// Re-queue a `skipped` or `no_gain` job under a different preset. The
    /// old record is removed; a fresh `pending_probe` job takes its place.
    pub fn retry_with_preset(
        &self,
        id: JobId,
        preset_id: &str,
    ) -> Result<TranscodeJob, QueueError> {
        let _ = self.resolve_preset(preset_id)?;
        let (input_path, input_size) = {
            let state = self.inner.state.lock_unpoisoned();
            let job = state.jobs.get(&id).ok_or(QueueError::UnknownJob(id))?;
            if !matches!(job.state, JobState::Skipped | JobState::NoGain) {
                return Err(QueueError::WrongState {
                    id,
                    actual: job.state,
                    expected: "skipped or no_gain",
                });
            }
            (job.input_path.clone(), job.input_size)
        };
        self.remove(id)?;
        self.add_without_probe(&input_path, preset_id, input_size)
    }

    /// Create a software-encoder twin of a hardware-failed job, subject to
    /// a sliding rate limit: at most 5 fallback creations per 5 minutes.
    /// Returns `None` (and creates nothing) when the window is full. The
    /// window check and the creation share one critical section.
    pub fn add_software_fallback(
        &self,
        original: &TranscodeJob,
        reason: &str,
    ) -> Option<TranscodeJob> {
        let Some(preset) = self.preset(&original.preset_id) else {
            tracing::warn!(
                job = original.id,
                preset = %original.preset_id,
                "cannot create software fallback: preset no longer exists"
            );
            return None;
        };

        let job = {
            let mut state = self.inner.state.lock_unpoisoned();
            let now = now_ms();
            let cutoff = now - FALLBACK_WINDOW.as_millis() as i64;
            while state.fallback_times.front().is_some_and(|t| *t < cutoff) {
                state.fallback_times.pop_front();
            }
            if state.fallback_times.len() >= FALLBACK_WINDOW_LIMIT {
                tracing::warn!(
                    job = original.id,
                    "software fallback denied: rate limit of {FALLBACK_WINDOW_LIMIT} per {}s reached",
                    FALLBACK_WINDOW.as_secs()
                );
                return None;
            }
            state.fallback_times.push_back(now);

            let mut job = original.clone();
            job.id = self.alloc_id();
            job.state = JobState::Pending;
            job.encoder = EncoderDescriptor {
                kind: EncoderKind::Software,
                codec: preset.codec.software_encoder().to_string(),
                pipeline: "cpu→cpu".to_string(),
            };
            job.is_software_fallback = true;
            job.original_job_id = Some(original.id);
            job.fallback_reason = reason.to_string();
            job.progress = 0.0;
            job.speed = 0.0;
            job.eta.clear();
            job.output_path = None;
            job.temp_path = None;
            job.output_size = 0;
            job.space_saved = 0;
            job.created_at = now;
            job.started_at = None;
            job.completed_at = None;
            job.transcode_secs = 0.0;
            job.error.clear();
            job.stderr_tail.clear();
            job.exit_code = None;
            job.encoder_args.clear();

            state.order.push(job.id);
            state.jobs.insert(job.id, job.clone());
            self.inner
                .subscribers
                .enqueue(QueueEvent::for_job(EventKind::Added, &job));
            job
        };
        self.inner.cv.notify_one();
        self.finish_mutation(true);
        Some(job)
    }

    // ------------------------------------------------------------------
    // History, purge, introspection
    // ------------------------------------------------------------------

    /// Bulk purge. Removes failed/cancelled/skipped/no-gain jobs always,
    /// completed jobs only when `include_completed`. Running and workable
    /// jobs are never touched. Returns the removed count.
    pub fn clear(&self, include_completed: bool) -> usize {
        let removed = {
            let mut state = self.inner.state.lock_unpoisoned();
            let victims: Vec<JobId> = state
                .order
                .iter()
                .copied()
                .filter(|id| {
                    state.jobs.get(id).is_some_and(|j| match j.state {
                        JobState::Complete => include_completed,
                        state => state.is_terminal(),
                    })
                })
                .collect();
            if victims.is_empty() {
                return 0;
            }
            let mut removed_jobs = Vec::with_capacity(victims.len());
            for id in &victims {
                if let Some(job) = state.jobs.remove(id) {
                    removed_jobs.push(job);
                }
            }
            let victim_set: std::collections::HashSet<JobId> =
                victims.iter().copied().collect();
            state.order.retain(|id| !victim_set.contains(id));
            let mut event = QueueEvent::marker(EventKind::Removed);
            event.jobs = Some(removed_jobs);
            self.inner.subscribers.enqueue(event);
            victims.len()
        };
        self.finish_mutation(true);
        removed
    }

    pub fn clear_processed_history(&self) {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            state.processed_paths.clear();
        }
        self.finish_mutation(true);
    }

    /// Absolute path → completion time for everything that ever completed.
    pub fn processed_paths(&self) -> std::collections::BTreeMap<String, i64> {
        self.inner.state.lock_unpoisoned().processed_paths.clone()
    }

    /// Seed processed history from outside (e.g. a discovery re-scan that
    /// found previous outputs on disk).
    pub fn mark_processed_paths(&self, paths: &[String]) {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            let now = now_ms();
            for path in paths {
                state.processed_paths.insert(path.clone(), now);
            }
        }
        self.finish_mutation(true);
    }

    /// Input paths of workable jobs, in queue order.
    pub fn pending_paths(&self) -> Vec<String> {
        let state = self.inner.state.lock_unpoisoned();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|j| j.state.is_workable())
            .map(|j| j.input_path.clone())
            .collect()
    }

    /// Input paths of every non-terminal job (workable or running), used by
    /// the discovery layer to avoid duplicate admission.
    pub fn enqueued_paths(&self) -> Vec<String> {
        let state = self.inner.state.lock_unpoisoned();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|j| !j.state.is_terminal())
            .map(|j| j.input_path.clone())
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock_unpoisoned();
        let mut stats = QueueStats {
            total_saved: state.total_saved,
            ..QueueStats::default()
        };
        for job in state.jobs.values() {
            stats.record(job.state);
        }
        stats
    }

    /// All jobs in creation (order-sequence) order.
    pub fn get_all(&self) -> Vec<TranscodeJob> {
        let state = self.inner.state.lock_unpoisoned();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    pub fn get(&self, id: JobId) -> Option<TranscodeJob> {
        self.inner.state.lock_unpoisoned().jobs.get(&id).cloned()
    }
}

fn base_job(id: JobId, input_path: &str, preset: &Preset) -> TranscodeJob {
    TranscodeJob {
        id,
        input_path: input_path.to_string(),
        preset_id: preset.id.clone(),
        encoder: default_encoder(preset),
        output_path: None,
        temp_path: None,
        state: JobState::Pending,
        progress: 0.0,
        speed: 0.0,
        eta: String::new(),
        input_size: 0,
        output_size: 0,
        space_saved: 0,
        duration_ms: 0,
        bitrate: 0,
        bit_depth: 0,
        pix_fmt: String::new(),
        video_codec: String::new(),
        subtitle_codecs: Vec::new(),
        created_at: now_ms(),
        started_at: None,
        completed_at: None,
        transcode_secs: 0.0,
        error: String::new(),
        stderr_tail: String::new(),
        exit_code: None,
        encoder_args: Vec::new(),
        is_software_fallback: false,
        original_job_id: None,
        fallback_reason: String::new(),
        force: false,
        skip_reason: String::new(),
    }
}

fn default_encoder(preset: &Preset) -> EncoderDescriptor {
    match &preset.hardware_encoder {
        Some(codec) => EncoderDescriptor {
            kind: EncoderKind::Hardware,
            codec: codec.clone(),
            pipeline: String::new(),
        },
        None => EncoderDescriptor {
            kind: EncoderKind::Software,
            codec: preset.codec.software_encoder().to_string(),
            pipeline: String::new(),
        },
    }
}

fn build_probed_job(
    id: JobId,
    input_path: &str,
    preset: &Preset,
    probe: &MediaProbe,
) -> TranscodeJob {
    let mut job = base_job(id, input_path, preset);
    job.input_size = probe.size;
    job.duration_ms = probe.duration_ms;
    job.bitrate = probe.bitrate;
    job.bit_depth = probe.bit_depth;
    job.pix_fmt = probe.pix_fmt.clone();
    job.video_codec = probe.video_codec.clone();
    job.subtitle_codecs = probe.subtitle_codecs.clone();

    if let Some(reason) = check_skip_reason(probe, preset) {
        job.state = JobState::Skipped;
        job.skip_reason = reason;
    }
    job
}

fn build_unprobed_job(id: JobId, input_path: &str, preset: &Preset, size: u64) -> TranscodeJob {
    let mut job = base_job(id, input_path, preset);
    job.state = JobState::PendingProbe;
    job.input_size = size;
    job
}
