use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::Preset;

/// Hard ceiling on the worker pool size. More parallel encodes than this
/// thrash the encoder hardware without improving throughput.
pub const MAX_WORKERS: usize = 6;

/// What happens to the original file after a successful transcode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OriginalHandling {
    /// Delete the original once the new output is in place.
    Replace,
    /// Rename the original to `{name}.old` alongside the new output.
    #[default]
    Keep,
}

/// Runtime feature toggles. `virtual_scroll` and `paginated_init` are UI
/// hints carried through configuration verbatim; the engine never reads them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Features {
    /// Coalesce bulk additions into a single `batch_added` event.
    pub batched_sse: bool,
    /// Emit minimal `{id, progress, speed, eta}` progress payloads instead
    /// of full job snapshots.
    pub delta_progress: bool,
    pub virtual_scroll: bool,
    /// Admit jobs as `pending_probe` and defer the probe to the worker.
    pub deferred_probing: bool,
    pub paginated_init: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            batched_sse: true,
            delta_progress: true,
            virtual_scroll: true,
            deferred_probing: true,
            paginated_init: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Root directory the discovery layer browses. Opaque to the engine
    /// beyond being the default parent for relative inputs.
    pub media_path: PathBuf,
    /// Scratch directory for in-flight temp outputs. When unset, temp files
    /// are written next to their inputs.
    pub temp_path: Option<PathBuf>,
    pub original_handling: OriginalHandling,
    /// Worker pool size, clamped to 1..=6.
    pub workers: usize,
    /// Queue snapshot file.
    pub queue_file: PathBuf,
    pub features: Features,
    pub allow_software_fallback: bool,
    /// External encoder program.
    pub encoder_path: String,
    /// External probe program.
    pub probe_path: String,
    pub presets: Vec<Preset>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            media_path: PathBuf::from("."),
            temp_path: None,
            original_handling: OriginalHandling::default(),
            workers: 1,
            queue_file: PathBuf::from("queue.json"),
            features: Features::default(),
            allow_software_fallback: false,
            encoder_path: "transcode".to_string(),
            probe_path: "probe".to_string(),
            presets: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, then apply environment
    /// overrides. A missing file yields the defaults (still overridable).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let file = fs::File::open(path)
                .with_context(|| format!("failed to open config file {}", path.display()))?;
            let reader = BufReader::new(file);
            serde_json::from_reader(reader)
                .with_context(|| format!("failed to parse JSON from {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.clamp();
        Ok(config)
    }

    /// Apply `RECODEQ_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_string("RECODEQ_MEDIA_PATH") {
            self.media_path = PathBuf::from(v);
        }
        if let Some(v) = env_string("RECODEQ_TEMP_PATH") {
            self.temp_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_string("RECODEQ_ORIGINAL_HANDLING") {
            match v.trim().to_ascii_lowercase().as_str() {
                "replace" => self.original_handling = OriginalHandling::Replace,
                "keep" => self.original_handling = OriginalHandling::Keep,
                other => {
                    tracing::warn!(value = other, "ignoring unrecognized RECODEQ_ORIGINAL_HANDLING");
                }
            }
        }
        if let Some(v) = env_string("RECODEQ_WORKERS")
            && let Ok(n) = v.trim().parse::<usize>()
        {
            self.workers = n;
        }
        if let Some(v) = env_string("RECODEQ_QUEUE_FILE") {
            self.queue_file = PathBuf::from(v);
        }
        if let Some(v) = env_string("RECODEQ_ENCODER_PATH") {
            self.encoder_path = v;
        }
        if let Some(v) = env_string("RECODEQ_PROBE_PATH") {
            self.probe_path = v;
        }
        self.allow_software_fallback = parse_bool_env(
            env_string("RECODEQ_ALLOW_SOFTWARE_FALLBACK").as_deref(),
            self.allow_software_fallback,
        );
        self.features.batched_sse = parse_bool_env(
            env_string("RECODEQ_FEATURES_BATCHED_SSE").as_deref(),
            self.features.batched_sse,
        );
        self.features.delta_progress = parse_bool_env(
            env_string("RECODEQ_FEATURES_DELTA_PROGRESS").as_deref(),
            self.features.delta_progress,
        );
        self.features.virtual_scroll = parse_bool_env(
            env_string("RECODEQ_FEATURES_VIRTUAL_SCROLL").as_deref(),
            self.features.virtual_scroll,
        );
        self.features.deferred_probing = parse_bool_env(
            env_string("RECODEQ_FEATURES_DEFERRED_PROBING").as_deref(),
            self.features.deferred_probing,
        );
        self.features.paginated_init = parse_bool_env(
            env_string("RECODEQ_FEATURES_PAGINATED_INIT").as_deref(),
            self.features.paginated_init,
        );
    }

    fn clamp(&mut self) {
        self.workers = self.workers.clamp(1, MAX_WORKERS);
    }

    /// Clamped worker count, usable even on a hand-built config.
    pub fn effective_workers(&self) -> usize {
        self.workers.clamp(1, MAX_WORKERS)
    }

    pub fn preset(&self, preset_id: &str) -> Option<&Preset> {
        self.presets.iter().find(|p| p.id == preset_id)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub(crate) fn parse_bool_env(value: Option<&str>, default: bool) -> bool {
    value.map_or(default, |raw| {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        }
    })
}
