use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::domain::{JobId, TranscodeJob};
use crate::encoder::{
    EncoderProcess, ProgressTick, build_encoder_args, compute_progress_percent, format_eta,
    pipeline_label,
};
use crate::probe::run_probe;
use crate::queue::{FailureDetails, Queue};

use super::{EncoderFailure, PoolInner, classify_encoder_failure, finalize_output, plan_paths};

/// Idle wait between acquisition attempts when the queue has no workable
/// jobs; enqueue operations wake workers earlier through the queue condvar.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Tick poll interval while a subprocess is running.
const TICK_POLL: Duration = Duration::from_millis(50);

/// Progress updates are throttled to at most one per this interval (2 Hz)
/// even when the encoder reports faster.
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(500);

pub(super) fn worker_loop(queue: &Queue, pool: &Arc<PoolInner>) {
    loop {
        if pool.should_exit() {
            return;
        }

        let Some(job) = queue.claim_next_workable() else {
            queue.wait_for_work(IDLE_WAIT);
            continue;
        };

        let job_id = job.id;
        let result = guarded_runner(|| process_claimed_job(queue, pool, job));
        // The driver contract: no process handle may outlive the run.
        pool.clear_active(job_id);

        if let Err(reason) = result {
            if queue.fail_job(job_id, &reason).is_err() {
                // Already terminal (e.g. cancelled mid-failure); just make
                // sure the claim is not leaked.
                queue.release_claim(job_id);
            }
            tracing::error!(job = job_id, reason = %reason, "worker run failed");
        }
    }
}

/// Convert panics from the job body into job failures so a poisoned run
/// never takes the worker thread down with it.
fn guarded_runner<F>(f: F) -> Result<(), String>
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("transcode failed: {err:#}")),
        Err(payload) => Err(format!(
            "transcode panicked: {}",
            panic_payload_to_string(payload.as_ref())
        )),
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

fn process_claimed_job(queue: &Queue, pool: &Arc<PoolInner>, job: TranscodeJob) -> Result<()> {
    let mut job = job;

    // Deferred probe: fill in metadata, then re-check workability; the
    // probe may have revealed a skip condition.
    if job.state.needs_probe() {
        let probe = match run_probe(
            &pool.cfg.probe_path,
            Path::new(&job.input_path),
            pool.cfg.probe_deadline,
        ) {
            Ok(probe) => probe,
            Err(err) => {
                queue
                    .fail_job(job.id, &format!("probe failed: {err:#}"))
                    .ok();
                return Ok(());
            }
        };
        match queue.update_job_after_probe(job.id, &probe) {
            Ok(updated) if updated.state.is_workable() => job = updated,
            Ok(_) => {
                // Skipped by the post-probe check; the claim is already gone.
                return Ok(());
            }
            Err(err) => {
                tracing::debug!(job = job.id, error = %err, "job changed state during probe");
                queue.release_claim(job.id);
                return Ok(());
            }
        }
    }

    let Some(preset) = queue.preset(&job.preset_id) else {
        queue
            .fail_job(job.id, &format!("preset `{}` no longer exists", job.preset_id))
            .ok();
        return Ok(());
    };

    let pipeline = pipeline_label(&job.encoder, &job.pix_fmt);
    let (temp_path, output_path) = plan_paths(Path::new(&job.input_path), pool.cfg.temp_dir.as_deref());

    let job = match queue.start_job(job.id, &temp_path, &pipeline) {
        Ok(job) => job,
        Err(err) => {
            // Cancelled or removed between claim and start.
            tracing::debug!(job = job.id, error = %err, "job not startable, releasing claim");
            queue.release_claim(job.id);
            return Ok(());
        }
    };

    let args = build_encoder_args(&preset, &job.encoder, &job, &temp_path);
    let mut process = match EncoderProcess::spawn(&pool.cfg.encoder_path, &args) {
        Ok(process) => process,
        Err(err) => {
            queue
                .fail_job_with_details(
                    job.id,
                    &format!("failed to spawn encoder: {err:#}"),
                    FailureDetails {
                        args,
                        ..FailureDetails::default()
                    },
                )
                .ok();
            return Ok(());
        }
    };
    pool.register_active(job.id, process.pid());
    tracing::info!(
        job = job.id,
        input = %job.input_path,
        pipeline = %job.encoder.pipeline,
        "encoder started"
    );

    // Progress loop: forward throttled ticks until the subprocess exits.
    let mut progress = ProgressForwarder::new(queue, &job);
    loop {
        // The pool flags cancellations it routed itself; a queue-level
        // cancel that raced past the pool shows up as a terminal state.
        let cancelled = pool.cancel_pending(job.id)
            || queue.get(job.id).is_none_or(|j| j.state.is_terminal());
        if cancelled {
            process.kill();
        }
        if let Some(tick) = process.recv_tick(TICK_POLL) {
            progress.observe(tick);
        }
        match process.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(job = job.id, error = %err, "wait on encoder failed");
                break;
            }
        }
    }
    let (status, stderr_tail) = process.finish(|tick| progress.observe(tick));
    let status = status.with_context(|| "failed to collect encoder exit status")?;

    // Clear the handle before any outcome transition so pause/resume
    // against this id are no-ops from here on.
    let was_cancelled = pool.clear_active(job.id);

    // Either the pool flagged a cancellation, or the queue-level cancel ran
    // directly while we were encoding; both end the same way.
    let externally_cancelled = queue
        .get(job.id)
        .is_none_or(|j| j.state.is_terminal());
    if was_cancelled || externally_cancelled {
        queue.cancel_job(job.id).ok();
        drop(fs::remove_file(&temp_path));
        tracing::info!(job = job.id, "encode cancelled");
        return Ok(());
    }

    if !status.success() {
        handle_encoder_failure(queue, pool, &job, &args, status.code(), stderr_tail);
        drop(fs::remove_file(&temp_path));
        return Ok(());
    }

    // Success: size check, then promote the temp file.
    let output_size = fs::metadata(&temp_path)
        .with_context(|| format!("encoder reported success but left no output at {}", temp_path.display()))?
        .len();

    if !job.force && job.input_size > 0 && output_size >= job.input_size {
        drop(fs::remove_file(&temp_path));
        queue
            .no_gain_job(
                job.id,
                &format!(
                    "output ({output_size} bytes) is not smaller than input ({} bytes)",
                    job.input_size
                ),
            )
            .ok();
        return Ok(());
    }

    match finalize_output(
        Path::new(&job.input_path),
        &temp_path,
        &output_path,
        pool.cfg.original_handling,
    ) {
        Ok(final_size) => {
            queue.complete_job(job.id, &output_path, final_size).ok();
            tracing::info!(job = job.id, output = %output_path.display(), "encode complete");
        }
        Err(err) => {
            queue
                .fail_job(job.id, &format!("finalization failed: {err:#}"))
                .ok();
        }
    }
    Ok(())
}

fn handle_encoder_failure(
    queue: &Queue,
    pool: &Arc<PoolInner>,
    job: &TranscodeJob,
    args: &[String],
    exit_code: Option<i32>,
    stderr_tail: String,
) {
    let code_desc = exit_code.map_or_else(
        || "terminated by signal".to_string(),
        |code| format!("exit code {code}"),
    );
    let kind = classify_encoder_failure(&stderr_tail, exit_code);

    let (message, fallback_reason) = match kind {
        EncoderFailure::Hardware if job.encoder.is_hardware() => {
            if pool.cfg.allow_software_fallback {
                match queue.add_software_fallback(job, "hardware encoder failed to initialize") {
                    Some(fallback) => (
                        format!("hardware encoder failed ({code_desc})"),
                        format!("software fallback queued as job {}", fallback.id),
                    ),
                    None => (
                        format!("hardware encoder failed ({code_desc})"),
                        "software fallback denied: rate limit of 5 per 5 minutes reached"
                            .to_string(),
                    ),
                }
            } else {
                (
                    format!("hardware encoder failed ({code_desc})"),
                    "hardware encoder failure; enable allow_software_fallback to retry \
                     automatically with the software encoder"
                        .to_string(),
                )
            }
        }
        EncoderFailure::Hardware | EncoderFailure::Generic => {
            (format!("encoder failed ({code_desc})"), String::new())
        }
        EncoderFailure::Format => (
            format!("encoder failed ({code_desc}): pixel format is incompatible with this pipeline"),
            String::new(),
        ),
    };

    queue
        .fail_job_with_details(
            job.id,
            &message,
            FailureDetails {
                stderr_tail,
                exit_code,
                args: args.to_vec(),
                fallback_reason,
            },
        )
        .ok();
}

/// Throttles and translates raw ticks into queue progress updates.
struct ProgressForwarder<'a> {
    queue: &'a Queue,
    job_id: JobId,
    duration_ms: u64,
    last_sent: Option<Instant>,
    zero_duration_logged: bool,
}

impl<'a> ProgressForwarder<'a> {
    fn new(queue: &'a Queue, job: &TranscodeJob) -> Self {
        Self {
            queue,
            job_id: job.id,
            duration_ms: job.duration_ms,
            last_sent: None,
            zero_duration_logged: false,
        }
    }

    fn observe(&mut self, tick: ProgressTick) {
        let Some(elapsed_ms) = tick.elapsed_ms else {
            return;
        };
        if self.duration_ms == 0 && !self.zero_duration_logged {
            self.zero_duration_logged = true;
            tracing::warn!(
                job = self.job_id,
                "source duration unknown; progress will stay at 0%"
            );
        }
        if let Some(last) = self.last_sent
            && last.elapsed() < PROGRESS_MIN_INTERVAL
            && !tick.end
        {
            return;
        }

        let percent = compute_progress_percent(self.duration_ms, elapsed_ms);
        let speed = tick.speed.unwrap_or(0.0);
        let eta = format_eta(self.duration_ms, elapsed_ms, speed);
        // A racing cancel can make this a wrong-state call; that is fine.
        if self
            .queue
            .update_progress(self.job_id, percent, speed, &eta)
            .is_ok()
        {
            self.last_sent = Some(Instant::now());
        }
    }
}
