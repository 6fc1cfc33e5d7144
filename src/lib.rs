//! Core engine for a video-transcoding service: a durable, concurrent job
//! queue coupled to a worker pool that drives an external encoder
//! subprocess, plus a bounded live event fan-out for the operator UI.
//!
//! The HTTP/SSE surface, file discovery, and notification delivery are thin
//! adapters elsewhere; everything stateful lives here. Construct a
//! [`TranscodeService`] from a [`Config`], call `start()`, and feed it work:
//!
//! ```no_run
//! use recodeq::{Config, TranscodeService};
//!
//! let config = Config::load(std::path::Path::new("config.json")).unwrap();
//! let service = TranscodeService::new(&config);
//! service.start();
//! let subscription = service.subscribe();
//! let job = service.add_without_probe("/media/input.mkv", "hevc-1080", 0).unwrap();
//! println!("queued {} as job {}", job.input_path, job.id);
//! for event in subscription.events.iter() {
//!     println!("event: {:?}", event.kind);
//! }
//! ```

mod config;
mod domain;
mod encoder;
mod probe;
mod process_ext;
mod queue;
mod service;
mod sync_ext;
mod worker;

pub use config::{Config, Features, MAX_WORKERS, OriginalHandling};
pub use domain::{
    EncoderDescriptor, EncoderKind, EventKind, JobId, JobState, MediaProbe, Preset,
    ProgressUpdate, QueueEvent, QueueStats, TargetCodec, TranscodeJob,
};
pub use probe::run_probe;
pub use queue::{
    EventSubscription, FailureDetails, FileInfo, MoveDirection, Queue, QueueError,
    SUBSCRIBER_BUFFER, SubscriberId,
};
pub use service::TranscodeService;
pub use worker::WorkerPool;
