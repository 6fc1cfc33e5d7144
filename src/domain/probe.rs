use serde::{Deserialize, Serialize};

/// Structured media metadata produced by the external probe program.
///
/// The engine treats this as an opaque fact sheet: it never re-derives any
/// of these fields from the media itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaProbe {
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub video_codec: String,
    #[serde(default)]
    pub audio_codec: String,
    #[serde(default)]
    pub subtitle_codecs: Vec<String>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// Bits per second.
    #[serde(default)]
    pub bitrate: u64,
    #[serde(default)]
    pub frame_rate: f64,
    #[serde(default)]
    pub pix_fmt: String,
    /// 8, 10, or 12; 0 when unknown.
    #[serde(default)]
    pub bit_depth: u32,
    #[serde(default)]
    pub color_range: String,
}

impl MediaProbe {
    pub fn is_hevc(&self) -> bool {
        let codec = self.video_codec.trim().to_ascii_lowercase();
        matches!(codec.as_str(), "hevc" | "h265" | "h.265")
    }

    pub fn is_av1(&self) -> bool {
        self.video_codec.trim().eq_ignore_ascii_case("av1")
    }
}
