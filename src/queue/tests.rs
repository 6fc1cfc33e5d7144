use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use tempfile::TempDir;

use super::*;
use crate::config::Config;
use crate::domain::{EventKind, MediaProbe, Preset, QueueEvent, TargetCodec};
use crate::queue::ops::FileInfo;

fn test_preset() -> Preset {
    Preset {
        id: "hevc-1080".to_string(),
        name: "HEVC 1080p".to_string(),
        codec: TargetCodec::Hevc,
        max_height: Some(1080),
        quality: Some(24),
        hardware_encoder: Some("hevc_vaapi".to_string()),
        extra_args: Vec::new(),
    }
}

fn make_config(dir: &TempDir) -> Config {
    Config {
        queue_file: dir.path().join("queue.json"),
        presets: vec![test_preset()],
        ..Config::default()
    }
}

fn make_queue() -> (Queue, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = Queue::new(&make_config(&dir));
    (queue, dir)
}

fn probe_for(path: &str, height: u32, codec: &str) -> MediaProbe {
    MediaProbe {
        path: path.to_string(),
        size: 1_000_000,
        duration_ms: 120_000,
        video_codec: codec.to_string(),
        height,
        width: height * 16 / 9,
        bitrate: 5_000_000,
        pix_fmt: "yuv420p".to_string(),
        bit_depth: 8,
        ..MediaProbe::default()
    }
}

fn event_kinds(sub: &EventSubscription) -> Vec<EventKind> {
    sub.events.try_iter().map(|e| e.kind).collect()
}

/// The debounced saver writes within ~100 ms of the last mutation; give it
/// comfortable slack.
fn wait_for_persist() {
    std::thread::sleep(Duration::from_millis(400));
}

#[test]
fn add_emits_added_and_lands_in_map_and_order() {
    let (queue, _dir) = make_queue();
    let sub = queue.subscribe();

    let probe = probe_for("/media/a.mkv", 2160, "h264");
    let job = queue.add("/media/a.mkv", "hevc-1080", &probe).unwrap();

    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.input_size, 1_000_000);
    assert_eq!(job.duration_ms, 120_000);
    assert_eq!(event_kinds(&sub), vec![EventKind::Added]);

    let all = queue.get_all();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, job.id);
}

#[test]
fn add_with_unknown_preset_is_a_validation_error() {
    let (queue, _dir) = make_queue();
    let probe = probe_for("/media/a.mkv", 2160, "h264");
    match queue.add("/media/a.mkv", "nope", &probe) {
        Err(QueueError::UnknownPreset(p)) => assert_eq!(p, "nope"),
        other => panic!("expected UnknownPreset, got {other:?}"),
    }
    assert!(queue.get_all().is_empty(), "no state change on validation error");
}

#[test]
fn add_admits_low_sources_directly_as_skipped() {
    let (queue, _dir) = make_queue();
    let sub = queue.subscribe();

    let probe = probe_for("/media/low.mkv", 720, "h264");
    let job = queue.add("/media/low.mkv", "hevc-1080", &probe).unwrap();

    assert_eq!(job.state, JobState::Skipped);
    assert_eq!(job.skip_reason, "already at or below 1080p");
    assert_eq!(event_kinds(&sub), vec![EventKind::Skipped]);
    assert!(queue.get_next().is_none(), "skipped jobs are not workable");
}

#[test]
fn bulk_add_without_probe_emits_one_batch_event() {
    // Scenario: a 10^4-file import must produce a single batch_added.
    let (queue, _dir) = make_queue();
    let sub = queue.subscribe();

    let files: Vec<FileInfo> = (0..10_000)
        .map(|i| FileInfo {
            path: format!("/media/bulk/{i}.mkv"),
            size: 1000 + i as u64,
        })
        .collect();
    let jobs = queue.add_multiple_without_probe(&files, "hevc-1080").unwrap();
    assert_eq!(jobs.len(), 10_000);

    let events: Vec<QueueEvent> = sub.events.try_iter().collect();
    assert_eq!(events.len(), 1, "exactly one event for the whole batch");
    assert_eq!(events[0].kind, EventKind::BatchAdded);
    assert_eq!(events[0].jobs.as_ref().map(Vec::len), Some(10_000));

    let stats = queue.stats();
    assert_eq!(stats.pending_probe, 10_000);
    assert_eq!(stats.total, 10_000);

    wait_for_persist();
    let persisted = persist::load_queue_file(&queue.inner.queue_file)
        .expect("a persistence write must happen shortly after the batch");
    assert_eq!(persisted.jobs.len(), 10_000);
}

#[test]
fn bulk_add_with_batching_disabled_falls_back_to_per_job_events() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = make_config(&dir);
    config.features.batched_sse = false;
    let queue = Queue::new(&config);
    let sub = queue.subscribe();

    let files: Vec<FileInfo> = (0..3)
        .map(|i| FileInfo {
            path: format!("/media/{i}.mkv"),
            size: 1,
        })
        .collect();
    queue.add_multiple_without_probe(&files, "hevc-1080").unwrap();

    assert_eq!(
        event_kinds(&sub),
        vec![EventKind::Added, EventKind::Added, EventKind::Added]
    );
}

#[test]
fn batch_add_with_probes_reports_skips_individually() {
    let (queue, _dir) = make_queue();
    let sub = queue.subscribe();

    let probes = vec![
        probe_for("/media/big.mkv", 2160, "h264"),
        probe_for("/media/small.mkv", 480, "h264"),
        probe_for("/media/done.mkv", 2160, "hevc"),
    ];
    let jobs = queue.add_multiple(&probes, "hevc-1080").unwrap();
    assert_eq!(jobs[0].state, JobState::Pending);
    assert_eq!(jobs[1].state, JobState::Skipped);
    assert_eq!(jobs[2].state, JobState::Skipped);
    assert_eq!(jobs[2].skip_reason, "already encoded in HEVC");

    let events: Vec<QueueEvent> = sub.events.try_iter().collect();
    assert_eq!(events[0].kind, EventKind::BatchAdded);
    assert_eq!(events[0].jobs.as_ref().map(Vec::len), Some(1));
    assert_eq!(events[1].kind, EventKind::Skipped);
    assert_eq!(events[2].kind, EventKind::Skipped);
}

#[test]
fn deferred_probe_can_settle_a_job_as_skipped() {
    // Scenario: pending_probe + a 720p probe under a 1080p preset.
    let (queue, _dir) = make_queue();
    let job = queue
        .add_without_probe("/media/defer.mkv", "hevc-1080", 0)
        .unwrap();
    assert_eq!(job.state, JobState::PendingProbe);

    let claimed = queue.claim_next_workable().expect("job is claimable");
    assert_eq!(claimed.id, job.id);

    let sub = queue.subscribe();
    let updated = queue
        .update_job_after_probe(job.id, &probe_for("/media/defer.mkv", 720, "h264"))
        .unwrap();

    assert_eq!(updated.state, JobState::Skipped);
    assert_eq!(updated.skip_reason, "already at or below 1080p");
    assert_eq!(event_kinds(&sub), vec![EventKind::Skipped]);
    assert!(
        queue.claim_next_workable().is_none(),
        "the settled job must not be claimable again"
    );
}

#[test]
fn successful_probe_transitions_to_pending_with_metadata() {
    let (queue, _dir) = make_queue();
    let job = queue
        .add_without_probe("/media/defer.mkv", "hevc-1080", 0)
        .unwrap();

    let sub = queue.subscribe();
    let updated = queue
        .update_job_after_probe(job.id, &probe_for("/media/defer.mkv", 2160, "h264"))
        .unwrap();

    assert_eq!(updated.state, JobState::Pending);
    assert_eq!(updated.duration_ms, 120_000);
    assert_eq!(updated.bitrate, 5_000_000);
    assert_eq!(updated.video_codec, "h264");
    assert_eq!(updated.pix_fmt, "yuv420p");
    assert_eq!(event_kinds(&sub), vec![EventKind::Probed]);
}

#[test]
fn probe_update_requires_pending_probe_state() {
    let (queue, _dir) = make_queue();
    let probe = probe_for("/media/a.mkv", 2160, "h264");
    let job = queue.add("/media/a.mkv", "hevc-1080", &probe).unwrap();

    match queue.update_job_after_probe(job.id, &probe) {
        Err(QueueError::WrongState { actual, .. }) => assert_eq!(actual, JobState::Pending),
        other => panic!("expected WrongState, got {other:?}"),
    }
}

#[test]
fn progress_updates_emit_deltas_and_skip_persistence() {
    // Scenario: two updates → exactly two delta events, no snapshot write.
    let (queue, _dir) = make_queue();
    let probe = probe_for("/media/a.mkv", 2160, "h264");
    let job = queue.add("/media/a.mkv", "hevc-1080", &probe).unwrap();
    queue.claim_next_workable().unwrap();
    queue
        .start_job(job.id, Path::new("/tmp/a.tmp.mkv"), "vaapi→vaapi")
        .unwrap();

    wait_for_persist();
    let bytes_before = fs::read(&queue.inner.queue_file).unwrap();

    let sub = queue.subscribe();
    queue.update_progress(job.id, 12.5, 1.7, "3m").unwrap();
    queue.update_progress(job.id, 24.0, 1.8, "2m30s").unwrap();

    let events: Vec<QueueEvent> = sub.events.try_iter().collect();
    assert_eq!(events.len(), 2);
    for (event, (progress, speed, eta)) in
        events.iter().zip([(12.5, 1.7, "3m"), (24.0, 1.8, "2m30s")])
    {
        assert_eq!(event.kind, EventKind::Progress);
        assert!(event.job.is_none(), "delta events must not carry the job");
        assert!(event.jobs.is_none());
        let update = event.progress_update.as_ref().expect("delta payload");
        assert_eq!(update.id, job.id);
        assert!((update.progress - progress).abs() < f64::EPSILON);
        assert!((update.speed - speed).abs() < f64::EPSILON);
        assert_eq!(update.eta, eta);
    }

    wait_for_persist();
    let bytes_after = fs::read(&queue.inner.queue_file).unwrap();
    assert_eq!(
        bytes_before, bytes_after,
        "progress updates must not schedule snapshot writes"
    );
}

#[test]
fn progress_with_delta_disabled_carries_the_full_job() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = make_config(&dir);
    config.features.delta_progress = false;
    let queue = Queue::new(&config);

    let probe = probe_for("/media/a.mkv", 2160, "h264");
    let job = queue.add("/media/a.mkv", "hevc-1080", &probe).unwrap();
    queue.claim_next_workable().unwrap();
    queue
        .start_job(job.id, Path::new("/tmp/a.tmp.mkv"), "cpu→cpu")
        .unwrap();

    let sub = queue.subscribe();
    queue.update_progress(job.id, 50.0, 1.0, "1m").unwrap();
    let events: Vec<QueueEvent> = sub.events.try_iter().collect();
    assert_eq!(events.len(), 1);
    assert!(events[0].progress_update.is_none());
    let full = events[0].job.as_ref().expect("full job payload");
    assert!((full.progress - 50.0).abs() < f64::EPSILON);
}

#[test]
fn progress_requires_running_state() {
    let (queue, _dir) = make_queue();
    let probe = probe_for("/media/a.mkv", 2160, "h264");
    let job = queue.add("/media/a.mkv", "hevc-1080", &probe).unwrap();
    assert!(matches!(
        queue.update_progress(job.id, 10.0, 1.0, ""),
        Err(QueueError::WrongState { .. })
    ));
}

#[test]
fn crash_recovery_reclassifies_running_jobs_to_pending() {
    // Scenario: persist with one running job, reload, observe pending.
    let dir = tempfile::tempdir().unwrap();
    let config = make_config(&dir);
    let queue = Queue::new(&config);

    let probe = probe_for("/media/crash.mkv", 2160, "h264");
    let job = queue.add("/media/crash.mkv", "hevc-1080", &probe).unwrap();
    queue.claim_next_workable().unwrap();
    queue
        .start_job(job.id, Path::new("/tmp/crash.tmp.mkv"), "vaapi→vaapi")
        .unwrap();
    queue.update_progress(job.id, 42.0, 1.5, "1m").unwrap();
    queue.flush_persist_now();
    drop(queue);

    let revived = Queue::new(&config);
    let restored = revived.get(job.id).expect("job must survive the restart");
    assert_eq!(restored.state, JobState::Pending);
    assert_eq!(restored.progress, 0.0);
    assert_eq!(restored.speed, 0.0);
    assert_eq!(restored.eta, "");
    assert_eq!(restored.duration_ms, 120_000, "probe metadata is retained");

    let next = revived.get_next().expect("recovered job is workable again");
    assert_eq!(next.id, job.id);
}

#[test]
fn persist_load_persist_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let config = make_config(&dir);
    let queue = Queue::new(&config);

    for i in 0..5 {
        let probe = probe_for(&format!("/media/{i}.mkv"), 2160, "h264");
        queue
            .add(&format!("/media/{i}.mkv"), "hevc-1080", &probe)
            .unwrap();
    }
    queue.flush_persist_now();
    let first = fs::read(&config.queue_file).unwrap();
    drop(queue);

    let revived = Queue::new(&config);
    revived.flush_persist_now();
    let second = fs::read(&config.queue_file).unwrap();
    assert_eq!(first, second);
}

#[test]
fn concurrent_claims_hand_out_distinct_jobs() {
    // Scenario: one workable job, two workers acquire concurrently.
    let (queue, _dir) = make_queue();
    let probe = probe_for("/media/solo.mkv", 2160, "h264");
    queue.add("/media/solo.mkv", "hevc-1080", &probe).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                queue.claim_next_workable()
            })
        })
        .collect();
    let results: Vec<Option<crate::domain::TranscodeJob>> = handles
        .into_iter()
        .map(|h| h.join().expect("claim thread"))
        .collect();

    let claimed: Vec<_> = results.iter().flatten().collect();
    assert_eq!(claimed.len(), 1, "exactly one worker wins the claim");
}

#[test]
fn complete_job_updates_savings_and_processed_history() {
    let (queue, _dir) = make_queue();
    let probe = probe_for("/media/a.mkv", 2160, "h264");
    let job = queue.add("/media/a.mkv", "hevc-1080", &probe).unwrap();
    queue.claim_next_workable().unwrap();
    queue
        .start_job(job.id, Path::new("/tmp/a.tmp.mkv"), "vaapi→vaapi")
        .unwrap();

    let sub = queue.subscribe();
    let done = queue
        .complete_job(job.id, Path::new("/media/a.recoded.mkv"), 400_000)
        .unwrap();

    assert_eq!(done.state, JobState::Complete);
    assert_eq!(done.progress, 100.0);
    assert_eq!(done.output_size, 400_000);
    assert_eq!(done.space_saved, 600_000);
    assert!(done.completed_at.is_some());
    assert!(done.temp_path.is_none());
    assert_eq!(event_kinds(&sub), vec![EventKind::Complete]);

    let stats = queue.stats();
    assert_eq!(stats.complete, 1);
    assert_eq!(stats.total_saved, 600_000);

    let history = queue.processed_paths();
    assert!(history.contains_key("/media/a.mkv"));
    assert!(history.contains_key("/media/a.recoded.mkv"));
}

#[test]
fn no_gain_jobs_stay_out_of_processed_history() {
    let (queue, _dir) = make_queue();
    let probe = probe_for("/media/a.mkv", 2160, "h264");
    let job = queue.add("/media/a.mkv", "hevc-1080", &probe).unwrap();
    queue.claim_next_workable().unwrap();
    queue
        .start_job(job.id, Path::new("/tmp/a.tmp.mkv"), "vaapi→vaapi")
        .unwrap();

    queue.no_gain_job(job.id, "output not smaller").unwrap();

    assert!(queue.processed_paths().is_empty());
    let stats = queue.stats();
    assert_eq!(stats.no_gain, 1);
    assert_eq!(stats.total_saved, 0);
}

#[test]
fn cancel_is_single_shot_with_a_benign_second_error() {
    let (queue, _dir) = make_queue();
    let probe = probe_for("/media/a.mkv", 2160, "h264");
    let job = queue.add("/media/a.mkv", "hevc-1080", &probe).unwrap();

    queue.cancel_job(job.id).unwrap();
    assert_eq!(queue.get(job.id).unwrap().state, JobState::Cancelled);

    match queue.cancel_job(job.id) {
        Err(QueueError::WrongState { actual, .. }) => {
            assert_eq!(actual, JobState::Cancelled);
        }
        other => panic!("second cancel must be a benign error, got {other:?}"),
    }
}

#[test]
fn remove_deletes_from_both_map_and_order() {
    let (queue, _dir) = make_queue();
    let probe = probe_for("/media/a.mkv", 2160, "h264");
    let job = queue.add("/media/a.mkv", "hevc-1080", &probe).unwrap();

    let sub = queue.subscribe();
    let removed = queue.remove(job.id).unwrap();
    assert_eq!(removed.id, job.id);
    assert!(queue.get(job.id).is_none());
    assert!(queue.get_all().is_empty());
    assert_eq!(event_kinds(&sub), vec![EventKind::Removed]);

    assert!(matches!(
        queue.remove(job.id),
        Err(QueueError::UnknownJob(_))
    ));
}

#[test]
fn running_jobs_cannot_be_removed() {
    let (queue, _dir) = make_queue();
    let probe = probe_for("/media/a.mkv", 2160, "h264");
    let job = queue.add("/media/a.mkv", "hevc-1080", &probe).unwrap();
    queue.claim_next_workable().unwrap();
    queue
        .start_job(job.id, Path::new("/tmp/a.tmp.mkv"), "vaapi→vaapi")
        .unwrap();

    assert!(matches!(
        queue.remove(job.id),
        Err(QueueError::WrongState { .. })
    ));
}

#[test]
fn reorder_up_then_down_restores_the_original_order() {
    let (queue, _dir) = make_queue();
    let ids: Vec<_> = (0..3)
        .map(|i| {
            let probe = probe_for(&format!("/media/{i}.mkv"), 2160, "h264");
            queue
                .add(&format!("/media/{i}.mkv"), "hevc-1080", &probe)
                .unwrap()
                .id
        })
        .collect();

    let order_of = |queue: &Queue| -> Vec<JobId> { queue.get_all().iter().map(|j| j.id).collect() };
    let before = order_of(&queue);

    queue.reorder_pending(ids[1], MoveDirection::Up).unwrap();
    assert_eq!(order_of(&queue), vec![ids[1], ids[0], ids[2]]);

    queue.reorder_pending(ids[1], MoveDirection::Down).unwrap();
    assert_eq!(order_of(&queue), before);
}

#[test]
fn reordering_leaves_non_workable_jobs_in_place() {
    let (queue, _dir) = make_queue();
    // terminal, workable, workable, terminal layout.
    let skipped = queue
        .add("/media/low1.mkv", "hevc-1080", &probe_for("/media/low1.mkv", 480, "h264"))
        .unwrap();
    let a = queue
        .add("/media/a.mkv", "hevc-1080", &probe_for("/media/a.mkv", 2160, "h264"))
        .unwrap();
    let b = queue
        .add("/media/b.mkv", "hevc-1080", &probe_for("/media/b.mkv", 2160, "h264"))
        .unwrap();
    let skipped2 = queue
        .add("/media/low2.mkv", "hevc-1080", &probe_for("/media/low2.mkv", 480, "h264"))
        .unwrap();

    queue.reorder_pending(b.id, MoveDirection::Up).unwrap();

    let order: Vec<JobId> = queue.get_all().iter().map(|j| j.id).collect();
    assert_eq!(order, vec![skipped.id, b.id, a.id, skipped2.id]);
}

#[test]
fn reorder_rejects_non_workable_targets() {
    let (queue, _dir) = make_queue();
    let skipped = queue
        .add("/media/low.mkv", "hevc-1080", &probe_for("/media/low.mkv", 480, "h264"))
        .unwrap();
    assert!(matches!(
        queue.reorder_pending(skipped.id, MoveDirection::Up),
        Err(QueueError::WrongState { .. })
    ));
}

#[test]
fn move_pending_places_a_job_before_another() {
    let (queue, _dir) = make_queue();
    let ids: Vec<_> = (0..3)
        .map(|i| {
            let probe = probe_for(&format!("/media/{i}.mkv"), 2160, "h264");
            queue
                .add(&format!("/media/{i}.mkv"), "hevc-1080", &probe)
                .unwrap()
                .id
        })
        .collect();

    queue.move_pending(ids[2], ids[0]).unwrap();
    let order: Vec<JobId> = queue.get_all().iter().map(|j| j.id).collect();
    assert_eq!(order, vec![ids[2], ids[0], ids[1]]);
}

#[test]
fn force_retry_resets_skipped_jobs_with_the_force_flag() {
    let (queue, _dir) = make_queue();
    let job = queue
        .add("/media/low.mkv", "hevc-1080", &probe_for("/media/low.mkv", 480, "h264"))
        .unwrap();
    assert_eq!(job.state, JobState::Skipped);

    let retried = queue.force_retry_job(job.id).unwrap();
    assert_eq!(retried.state, JobState::Pending);
    assert!(retried.force);
    assert!(retried.skip_reason.is_empty());

    let claimed = queue.claim_next_workable().expect("forced job is workable");
    assert_eq!(claimed.id, job.id);
    assert!(claimed.force);
}

#[test]
fn force_retry_rejects_other_states() {
    let (queue, _dir) = make_queue();
    let job = queue
        .add("/media/a.mkv", "hevc-1080", &probe_for("/media/a.mkv", 2160, "h264"))
        .unwrap();
    assert!(matches!(
        queue.force_retry_job(job.id),
        Err(QueueError::WrongState { .. })
    ));
}

#[test]
fn retry_job_replaces_a_failed_job_with_a_fresh_probe_twin() {
    let (queue, _dir) = make_queue();
    let job = queue
        .add("/media/a.mkv", "hevc-1080", &probe_for("/media/a.mkv", 2160, "h264"))
        .unwrap();
    queue.claim_next_workable().unwrap();
    queue
        .start_job(job.id, Path::new("/tmp/a.tmp.mkv"), "vaapi→vaapi")
        .unwrap();
    queue.fail_job(job.id, "encoder exploded").unwrap();

    let twin = queue.retry_job(job.id).unwrap();
    assert_ne!(twin.id, job.id);
    assert_eq!(twin.state, JobState::PendingProbe);
    assert_eq!(twin.input_path, "/media/a.mkv");
    assert!(queue.get(job.id).is_none(), "the failed record is removed");
}

#[test]
fn retry_with_preset_requires_a_known_preset() {
    let (queue, _dir) = make_queue();
    let job = queue
        .add("/media/low.mkv", "hevc-1080", &probe_for("/media/low.mkv", 480, "h264"))
        .unwrap();
    assert!(matches!(
        queue.retry_with_preset(job.id, "nope"),
        Err(QueueError::UnknownPreset(_))
    ));

    let twin = queue.retry_with_preset(job.id, "hevc-1080").unwrap();
    assert_eq!(twin.state, JobState::PendingProbe);
    assert!(queue.get(job.id).is_none());
}

#[test]
fn software_fallback_is_rate_limited_to_five_per_window() {
    // Scenario: six hardware failures inside the window → five fallbacks.
    let (queue, _dir) = make_queue();
    let job = queue
        .add("/media/a.mkv", "hevc-1080", &probe_for("/media/a.mkv", 2160, "h264"))
        .unwrap();

    let mut created = Vec::new();
    for _ in 0..5 {
        let fallback = queue
            .add_software_fallback(&job, "hardware encoder failed to initialize")
            .expect("fallback inside the window must be created");
        created.push(fallback);
    }

    let stats_before = queue.stats();
    let denied = queue.add_software_fallback(&job, "hardware encoder failed to initialize");
    assert!(denied.is_none(), "the sixth fallback must be denied");
    let stats_after = queue.stats();
    assert_eq!(
        stats_before, stats_after,
        "a denied fallback must not change any counts"
    );

    for fallback in &created {
        assert_eq!(fallback.state, JobState::Pending);
        assert!(fallback.is_software_fallback);
        assert_eq!(fallback.original_job_id, Some(job.id));
        assert_eq!(fallback.encoder.kind, crate::domain::EncoderKind::Software);
        assert_eq!(fallback.encoder.codec, "libx265");
        assert_eq!(fallback.encoder.pipeline, "cpu→cpu");
        assert_eq!(fallback.fallback_reason, "hardware encoder failed to initialize");
    }
}

#[test]
fn job_lifetime_events_arrive_in_transition_order() {
    let (queue, _dir) = make_queue();
    let sub = queue.subscribe();

    let job = queue
        .add("/media/a.mkv", "hevc-1080", &probe_for("/media/a.mkv", 2160, "h264"))
        .unwrap();
    queue.claim_next_workable().unwrap();
    queue
        .start_job(job.id, Path::new("/tmp/a.tmp.mkv"), "vaapi→vaapi")
        .unwrap();
    queue.update_progress(job.id, 50.0, 1.0, "1m").unwrap();
    queue
        .complete_job(job.id, Path::new("/media/a.recoded.mkv"), 1)
        .unwrap();

    // A post-terminal progress attempt is rejected and emits nothing.
    assert!(queue.update_progress(job.id, 99.0, 1.0, "").is_err());

    assert_eq!(
        event_kinds(&sub),
        vec![
            EventKind::Added,
            EventKind::Started,
            EventKind::Progress,
            EventKind::Complete,
        ]
    );
}

#[test]
fn clear_purges_terminal_jobs_and_spares_completed_unless_asked() {
    let (queue, _dir) = make_queue();

    let skipped = queue
        .add("/media/low.mkv", "hevc-1080", &probe_for("/media/low.mkv", 480, "h264"))
        .unwrap();
    let pending = queue
        .add("/media/keep.mkv", "hevc-1080", &probe_for("/media/keep.mkv", 2160, "h264"))
        .unwrap();
    let done = queue
        .add("/media/done.mkv", "hevc-1080", &probe_for("/media/done.mkv", 2160, "h264"))
        .unwrap();
    queue.claim_next_workable().unwrap();
    // claim_next_workable picks `pending` (earliest); release and drive
    // `done` through explicitly instead.
    queue.release_claim(pending.id);
    queue
        .start_job(done.id, Path::new("/tmp/done.tmp.mkv"), "vaapi→vaapi")
        .unwrap();
    queue
        .complete_job(done.id, Path::new("/media/done.recoded.mkv"), 1)
        .unwrap();

    let removed = queue.clear(false);
    assert_eq!(removed, 1, "only the skipped job goes");
    assert!(queue.get(skipped.id).is_none());
    assert!(queue.get(pending.id).is_some());
    assert!(queue.get(done.id).is_some());

    let removed = queue.clear(true);
    assert_eq!(removed, 1, "now the completed job goes too");
    assert!(queue.get(done.id).is_none());
    assert!(queue.get(pending.id).is_some(), "workable jobs are never purged");
}

#[test]
fn processed_path_helpers_cover_marking_and_clearing() {
    let (queue, _dir) = make_queue();
    queue.mark_processed_paths(&[
        "/media/old1.mkv".to_string(),
        "/media/old2.mkv".to_string(),
    ]);
    assert_eq!(queue.processed_paths().len(), 2);

    queue.clear_processed_history();
    assert!(queue.processed_paths().is_empty());
}

#[test]
fn pending_and_enqueued_paths_reflect_job_states() {
    let (queue, _dir) = make_queue();
    let a = queue
        .add("/media/a.mkv", "hevc-1080", &probe_for("/media/a.mkv", 2160, "h264"))
        .unwrap();
    queue
        .add("/media/low.mkv", "hevc-1080", &probe_for("/media/low.mkv", 480, "h264"))
        .unwrap();
    queue
        .add_without_probe("/media/b.mkv", "hevc-1080", 1)
        .unwrap();

    assert_eq!(queue.pending_paths(), vec!["/media/a.mkv", "/media/b.mkv"]);

    queue.claim_next_workable().unwrap();
    queue
        .start_job(a.id, Path::new("/tmp/a.tmp.mkv"), "vaapi→vaapi")
        .unwrap();

    assert_eq!(queue.pending_paths(), vec!["/media/b.mkv"]);
    assert_eq!(queue.enqueued_paths(), vec!["/media/a.mkv", "/media/b.mkv"]);
}

#[test]
fn start_job_requires_a_workable_state() {
    let (queue, _dir) = make_queue();
    let job = queue
        .add("/media/low.mkv", "hevc-1080", &probe_for("/media/low.mkv", 480, "h264"))
        .unwrap();
    assert!(matches!(
        queue.start_job(job.id, Path::new("/tmp/x"), "cpu→cpu"),
        Err(QueueError::WrongState { .. })
    ));
}

#[test]
fn direction_labels_parse_case_insensitively() {
    assert_eq!("up".parse::<MoveDirection>().unwrap(), MoveDirection::Up);
    assert_eq!("Down".parse::<MoveDirection>().unwrap(), MoveDirection::Down);
    assert!(matches!(
        "sideways".parse::<MoveDirection>(),
        Err(QueueError::InvalidDirection(_))
    ));
}

#[test]
fn corrupt_queue_files_fall_back_to_an_empty_queue() {
    let dir = tempfile::tempdir().unwrap();
    let config = make_config(&dir);
    fs::write(&config.queue_file, b"{ definitely not json").unwrap();

    let queue = Queue::new(&config);
    assert!(queue.get_all().is_empty());
    assert_eq!(queue.stats().total, 0);
}

#[test]
fn recovered_queues_allocate_fresh_ids_above_persisted_ones() {
    let dir = tempfile::tempdir().unwrap();
    let config = make_config(&dir);
    let queue = Queue::new(&config);
    let old = queue
        .add("/media/a.mkv", "hevc-1080", &probe_for("/media/a.mkv", 2160, "h264"))
        .unwrap();
    queue.flush_persist_now();
    drop(queue);

    let revived = Queue::new(&config);
    let fresh = revived
        .add("/media/b.mkv", "hevc-1080", &probe_for("/media/b.mkv", 2160, "h264"))
        .unwrap();
    assert!(
        fresh.id > old.id,
        "fresh id {} must not collide with persisted id {}",
        fresh.id,
        old.id
    );
}
