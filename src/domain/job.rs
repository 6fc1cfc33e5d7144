use serde::{Deserialize, Serialize};

pub type JobId = u64;

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(v: &bool) -> bool {
    !*v
}

/// Lifecycle state of a transcode job. This is a closed set; every state
/// check in the engine goes through [`JobState::is_terminal`],
/// [`JobState::is_workable`], or [`JobState::needs_probe`] rather than
/// matching on serialized labels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Admitted without media metadata; a worker will probe it first.
    PendingProbe,
    /// Ready for a worker to pick up.
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
    Skipped,
    /// The encode succeeded but the output was not smaller than the input.
    NoGain,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::Cancelled | Self::Skipped | Self::NoGain
        )
    }

    /// Whether a worker may acquire this job.
    pub fn is_workable(self) -> bool {
        matches!(self, Self::PendingProbe | Self::Pending)
    }

    pub fn needs_probe(self) -> bool {
        matches!(self, Self::PendingProbe)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    Hardware,
    Software,
}

/// Which encoder implementation a job is bound to, plus the human-readable
/// decode→encode pipeline label shown in the operator UI. The label is
/// observability-only; nothing in the engine interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncoderDescriptor {
    pub kind: EncoderKind,
    /// Encoder implementation name, e.g. `hevc_vaapi` or `libx265`.
    pub codec: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pipeline: String,
}

impl EncoderDescriptor {
    pub fn is_hardware(&self) -> bool {
        self.kind == EncoderKind::Hardware
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeJob {
    pub id: JobId,
    /// Absolute input path.
    pub input_path: String,
    pub preset_id: String,
    pub encoder: EncoderDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// In-flight temp output. Populated while running, cleared on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_path: Option<String>,
    pub state: JobState,
    /// Percent in [0, 100].
    #[serde(default)]
    pub progress: f64,
    /// Encoding speed multiplier (1.0 = realtime).
    #[serde(default)]
    pub speed: f64,
    /// Human-readable remaining-time estimate; empty when unknown.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub eta: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub input_size: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub output_size: u64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub space_saved: i64,
    /// Source media duration in milliseconds; 0 until probed.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub duration_ms: u64,
    /// Source bitrate in bits per second; 0 until probed.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub bitrate: u64,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub bit_depth: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pix_fmt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub video_codec: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtitle_codecs: Vec<String>,
    /// Epoch milliseconds.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Wall-clock seconds the encode took. Populated only on completion.
    #[serde(default)]
    pub transcode_secs: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Bounded tail of the encoder's stderr, for diagnostics.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr_tail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Argument vector the encoder subprocess was launched with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encoder_args: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_software_fallback: bool,
    /// Id of the hardware-failed job this fallback was cloned from. The
    /// referenced job may have been purged since.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_job_id: Option<JobId>,
    /// User-visible explanation of why (or why not) a software fallback was
    /// created for this job.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fallback_reason: String,
    /// Set on operator-initiated retry; bypasses skip and no-gain checks.
    #[serde(default, skip_serializing_if = "is_false")]
    pub force: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub skip_reason: String,
}

/// Per-state counts plus lifetime totals, as returned by `Queue::stats`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending_probe: usize,
    pub pending: usize,
    pub running: usize,
    pub complete: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub no_gain: usize,
    pub total: usize,
    /// Sum of `space_saved` across every job that ever completed, in bytes.
    pub total_saved: i64,
}

impl QueueStats {
    pub(crate) fn record(&mut self, state: JobState) {
        match state {
            JobState::PendingProbe => self.pending_probe += 1,
            JobState::Pending => self.pending += 1,
            JobState::Running => self.running += 1,
            JobState::Complete => self.complete += 1,
            JobState::Failed => self.failed += 1,
            JobState::Cancelled => self.cancelled += 1,
            JobState::Skipped => self.skipped += 1,
            JobState::NoGain => self.no_gain += 1,
        }
        self.total += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_workable_partition_the_state_space() {
        let all = [
            JobState::PendingProbe,
            JobState::Pending,
            JobState::Running,
            JobState::Complete,
            JobState::Failed,
            JobState::Cancelled,
            JobState::Skipped,
            JobState::NoGain,
        ];
        for state in all {
            let classes =
                usize::from(state.is_terminal()) + usize::from(state.is_workable());
            let is_running = state == JobState::Running;
            assert_eq!(
                classes,
                usize::from(!is_running),
                "state {state:?} must be exactly one of terminal/workable, or running"
            );
        }
    }

    #[test]
    fn only_pending_probe_needs_probe() {
        assert!(JobState::PendingProbe.needs_probe());
        assert!(!JobState::Pending.needs_probe());
        assert!(!JobState::Running.needs_probe());
    }

    #[test]
    fn job_state_serializes_as_snake_case_labels() {
        assert_eq!(
            serde_json::to_string(&JobState::PendingProbe).unwrap(),
            "\"pending_probe\""
        );
        assert_eq!(
            serde_json::to_string(&JobState::NoGain).unwrap(),
            "\"no_gain\""
        );
        let parsed: JobState = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, JobState::Cancelled);
    }
}
