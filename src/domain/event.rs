use serde::{Deserialize, Serialize};

use super::job::{JobId, TranscodeJob};

/// Event discriminator. Consumers must treat unknown kinds as no-ops, so
/// deserialization maps unrecognized labels onto [`EventKind::Unknown`]
/// instead of failing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    BatchAdded,
    Probed,
    Started,
    Progress,
    Complete,
    Failed,
    Cancelled,
    Skipped,
    NoGain,
    Removed,
    Reordered,
    #[serde(other)]
    Unknown,
}

/// Minimal progress payload. Deliberately tiny (≤80 bytes encoded) so a
/// large queue with one running job broadcasts a trickle, not snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub id: JobId,
    pub progress: f64,
    pub speed: f64,
    #[serde(default)]
    pub eta: String,
}

/// One event on the subscriber stream. The payload fields are mutually
/// exclusive: `job` xor `jobs` xor `progress_update`, selected by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<TranscodeJob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<TranscodeJob>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_update: Option<ProgressUpdate>,
}

impl QueueEvent {
    pub(crate) fn for_job(kind: EventKind, job: &TranscodeJob) -> Self {
        Self {
            kind,
            job: Some(job.clone()),
            jobs: None,
            progress_update: None,
        }
    }

    pub(crate) fn batch_added(jobs: Vec<TranscodeJob>) -> Self {
        Self {
            kind: EventKind::BatchAdded,
            job: None,
            jobs: Some(jobs),
            progress_update: None,
        }
    }

    pub(crate) fn progress(update: ProgressUpdate) -> Self {
        Self {
            kind: EventKind::Progress,
            job: None,
            jobs: None,
            progress_update: Some(update),
        }
    }

    /// Payload-free marker event (`removed` carries a job; `reordered` does not).
    pub(crate) fn marker(kind: EventKind) -> Self {
        Self {
            kind,
            job: None,
            jobs: None,
            progress_update: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_event_kinds_deserialize_as_unknown() {
        let parsed: EventKind = serde_json::from_str("\"shiny_new_thing\"").unwrap();
        assert_eq!(parsed, EventKind::Unknown);
    }

    #[test]
    fn progress_event_payload_stays_minimal() {
        let event = QueueEvent::progress(ProgressUpdate {
            id: 42,
            progress: 12.5,
            speed: 1.7,
            eta: "3m".to_string(),
        });
        let encoded = serde_json::to_string(&event).unwrap();
        assert!(
            encoded.len() <= 80,
            "encoded progress event must stay tiny, got {} bytes: {encoded}",
            encoded.len()
        );
        assert!(!encoded.contains("\"job\""));
        assert!(!encoded.contains("\"jobs\""));
    }

    #[test]
    fn event_kind_field_is_named_type_on_the_wire() {
        let event = QueueEvent::marker(EventKind::Reordered);
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(value.get("type").and_then(|v| v.as_str()), Some("reordered"));
    }
}
