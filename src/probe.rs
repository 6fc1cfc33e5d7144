//! Invocation of the external probe program and translation of its JSON
//! report into a [`MediaProbe`]. The probe runs under a caller-supplied
//! deadline and is killed when it exceeds it.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::domain::MediaProbe;
use crate::process_ext::run_with_deadline;

/// Generous cap on captured probe output; reports are a few KiB.
const PROBE_CAPTURE_LIMIT: usize = 1024 * 1024;

pub fn run_probe(probe_path: &str, media: &Path, deadline: Duration) -> Result<MediaProbe> {
    let mut cmd = Command::new(probe_path);
    cmd.arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(media.as_os_str());

    let run = run_with_deadline(cmd, deadline, PROBE_CAPTURE_LIMIT)
        .with_context(|| format!("failed to run probe on {}", media.display()))?;

    if run.timed_out {
        bail!(
            "probe timed out after {}s on {}",
            deadline.as_secs(),
            media.display()
        );
    }
    if !run.status.success() {
        bail!(
            "probe failed on {}: {}",
            media.display(),
            String::from_utf8_lossy(&run.stderr).trim()
        );
    }

    let report: RawReport = serde_json::from_slice(&run.stdout)
        .with_context(|| format!("probe produced unparsable JSON for {}", media.display()))?;
    Ok(media_probe_from_report(media, &report))
}

// The probe report mirrors ffprobe's JSON shape: numbers arrive as strings.

#[derive(Debug, Default, Deserialize)]
struct RawReport {
    #[serde(default)]
    format: RawFormat,
    #[serde(default)]
    streams: Vec<RawStream>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFormat {
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
    #[serde(default)]
    format_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    pix_fmt: Option<String>,
    #[serde(default)]
    bits_per_raw_sample: Option<String>,
    #[serde(default)]
    color_range: Option<String>,
    #[serde(default)]
    avg_frame_rate: Option<String>,
}

fn media_probe_from_report(media: &Path, report: &RawReport) -> MediaProbe {
    let mut probe = MediaProbe {
        path: media.to_string_lossy().into_owned(),
        ..MediaProbe::default()
    };

    probe.size = report
        .format
        .size
        .as_deref()
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| std::fs::metadata(media).ok().map(|m| m.len()))
        .unwrap_or(0);
    probe.duration_ms = report
        .format
        .duration
        .as_deref()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(|secs| (secs * 1000.0) as u64)
        .unwrap_or(0);
    probe.bitrate = report
        .format
        .bit_rate
        .as_deref()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    probe.format = report.format.format_name.clone().unwrap_or_default();

    for stream in &report.streams {
        match stream.codec_type.as_deref() {
            Some("video") if probe.video_codec.is_empty() => {
                probe.video_codec = stream.codec_name.clone().unwrap_or_default();
                probe.width = stream.width.unwrap_or(0);
                probe.height = stream.height.unwrap_or(0);
                probe.pix_fmt = stream.pix_fmt.clone().unwrap_or_default();
                probe.color_range = stream.color_range.clone().unwrap_or_default();
                probe.frame_rate = stream
                    .avg_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .unwrap_or(0.0);
                probe.bit_depth = bit_depth_for(stream);
            }
            Some("audio") if probe.audio_codec.is_empty() => {
                probe.audio_codec = stream.codec_name.clone().unwrap_or_default();
            }
            Some("subtitle") => {
                if let Some(codec) = &stream.codec_name {
                    probe.subtitle_codecs.push(codec.clone());
                }
            }
            _ => {}
        }
    }

    probe
}

/// `avg_frame_rate` is a rational like `30000/1001`; `0/0` means unknown.
fn parse_frame_rate(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Some((num, den)) = raw.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        return Some(num / den);
    }
    raw.parse().ok()
}

fn bit_depth_for(stream: &RawStream) -> u32 {
    if let Some(bits) = stream
        .bits_per_raw_sample
        .as_deref()
        .and_then(|s| s.trim().parse::<u32>().ok())
        && bits > 0
    {
        return bits;
    }
    match &stream.pix_fmt {
        Some(pix_fmt) if pix_fmt.contains("p12") => 12,
        Some(pix_fmt) if pix_fmt.contains("p10") => 10,
        Some(_) => 8,
        None => 0,
    }
}
