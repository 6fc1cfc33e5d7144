use serde::{Deserialize, Serialize};

/// Target video codec family for a preset. Family membership drives the
/// "already encoded in X" skip rule: re-encoding HEVC to HEVC (or AV1 to
/// AV1) is pointless for space savings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetCodec {
    Hevc,
    Av1,
}

impl TargetCodec {
    /// Whether a probed source codec belongs to the same family.
    pub fn matches_source(self, source_codec: &str) -> bool {
        let codec = source_codec.trim().to_ascii_lowercase();
        match self {
            Self::Hevc => matches!(codec.as_str(), "hevc" | "h265" | "h.265" | "x265"),
            Self::Av1 => codec == "av1",
        }
    }

    /// Software encoder implementation for this family.
    pub fn software_encoder(self) -> &'static str {
        match self {
            Self::Hevc => "libx265",
            Self::Av1 => "libsvtav1",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Hevc => "HEVC",
            Self::Av1 => "AV1",
        }
    }
}

/// An encoding preset. Presets are plain data loaded from configuration;
/// the engine never synthesizes encoder parameters beyond what is here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: String,
    pub name: String,
    pub codec: TargetCodec,
    /// Skip sources whose height is already at or below this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u32>,
    /// Constant-quality value handed to the encoder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u32>,
    /// Hardware encoder implementation (e.g. `hevc_vaapi`). When absent the
    /// preset encodes in software from the start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_encoder: Option<String>,
    /// Extra argument tail appended verbatim to the encoder command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}
