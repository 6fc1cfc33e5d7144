//! Encoder subprocess driver: command construction, spawn, stdout progress
//! pump, stderr tail capture, and exit handling. The driver is agnostic to
//! which encoder binary it runs; the contract is the machine progress
//! protocol on stdout and free text on stderr.

mod progress;
mod stderr_ring;

pub(crate) use progress::{ProgressParser, ProgressTick, compute_progress_percent, format_eta};
pub(crate) use stderr_ring::StderrRing;

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::domain::{EncoderDescriptor, Preset, TranscodeJob};
use crate::sync_ext::MutexExt;

/// Stderr retention for diagnostics; only the tail survives.
pub(crate) const STDERR_RING_CAPACITY: usize = 64 * 1024;

/// Build the encoder argument vector from the preset, the job's probed
/// metadata, and the chosen encoder implementation. The final argument
/// requests the machine progress stream on stdout.
pub(crate) fn build_encoder_args(
    preset: &Preset,
    encoder: &EncoderDescriptor,
    job: &TranscodeJob,
    temp_output: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-i".to_string(), job.input_path.clone()];
    args.push("-c:v".to_string());
    args.push(encoder.codec.clone());
    if let Some(quality) = preset.quality {
        args.push("-crf".to_string());
        args.push(quality.to_string());
    }
    if let Some(max_height) = preset.max_height {
        args.push("-vf".to_string());
        args.push(format!("scale=-2:min({max_height}\\,ih)"));
    }
    args.extend(preset.extra_args.iter().cloned());
    args.push("-progress".to_string());
    args.push("pipe:1".to_string());
    args.push("-y".to_string());
    args.push(temp_output.to_string_lossy().into_owned());
    args
}

/// Human-readable decode→encode label for a running job. Hardware decode is
/// assumed only for the 8-bit 4:2:0 formats every hardware block handles;
/// anything else decodes on the CPU and uploads. Observability only.
pub(crate) fn pipeline_label(encoder: &EncoderDescriptor, pix_fmt: &str) -> String {
    if !encoder.is_hardware() {
        return "cpu→cpu".to_string();
    }
    let family = hardware_family(&encoder.codec);
    let hw_decodable = matches!(
        pix_fmt.trim().to_ascii_lowercase().as_str(),
        "yuv420p" | "yuvj420p" | "nv12"
    );
    if hw_decodable {
        format!("{family}→{family}")
    } else {
        format!("cpu→{family}")
    }
}

fn hardware_family(codec: &str) -> &str {
    let lowered = codec.trim();
    for family in ["vaapi", "nvenc", "qsv", "videotoolbox", "amf"] {
        if lowered.to_ascii_lowercase().contains(family) {
            return family;
        }
    }
    "hw"
}

/// A spawned encoder with both output streams pumped by dedicated threads:
/// stdout through the progress parser into a channel, stderr into a bounded
/// tail ring.
pub(crate) struct EncoderProcess {
    child: Child,
    pid: u32,
    ticks: Receiver<ProgressTick>,
    stderr_ring: Arc<Mutex<StderrRing>>,
    pumps: Vec<JoinHandle<()>>,
}

impl EncoderProcess {
    pub(crate) fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn encoder {program}"))?;

        let pid = child.id();
        let (tick_tx, ticks) = mpsc::channel();
        let stderr_ring = Arc::new(Mutex::new(StderrRing::new(STDERR_RING_CAPACITY)));

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(std::thread::spawn(move || pump_stdout(stdout, &tick_tx)));
        }
        if let Some(stderr) = child.stderr.take() {
            let ring = stderr_ring.clone();
            pumps.push(std::thread::spawn(move || pump_stderr(stderr, &ring)));
        }

        Ok(Self {
            child,
            pid,
            ticks,
            stderr_ring,
            pumps,
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Receive the next progress tick, waiting at most `timeout`. Returns
    /// `None` on timeout or once the stdout pump has finished.
    pub(crate) fn recv_tick(&self, timeout: Duration) -> Option<ProgressTick> {
        match self.ticks.recv_timeout(timeout) {
            Ok(tick) => Some(tick),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub(crate) fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    pub(crate) fn kill(&mut self) {
        drop(self.child.kill());
    }

    pub(crate) fn stderr_tail(&self) -> String {
        self.stderr_ring.lock_unpoisoned().tail_string()
    }

    /// Wait for the child and both pumps, then drain any ticks that raced
    /// with exit through `on_tick`. Consumes the driver so no process
    /// handle outlives the run.
    pub(crate) fn finish<F: FnMut(ProgressTick)>(
        mut self,
        mut on_tick: F,
    ) -> (std::io::Result<ExitStatus>, String) {
        let status = self.child.wait();
        for pump in self.pumps.drain(..) {
            drop(pump.join());
        }
        while let Ok(tick) = self.ticks.try_recv() {
            on_tick(tick);
        }
        let tail = self.stderr_ring.lock_unpoisoned().tail_string();
        (status, tail)
    }
}

fn pump_stdout(stdout: impl Read, tick_tx: &Sender<ProgressTick>) {
    let reader = BufReader::new(stdout);
    let mut parser = ProgressParser::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if let Some(tick) = parser.feed(&line)
            && tick_tx.send(tick).is_err()
        {
            break;
        }
    }
}

fn pump_stderr(stderr: impl Read, ring: &Arc<Mutex<StderrRing>>) {
    let mut stderr = stderr;
    let mut buf = [0u8; 8192];
    loop {
        let n = match stderr.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        ring.lock_unpoisoned().write(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EncoderKind, JobState, TargetCodec};

    fn descriptor(kind: EncoderKind, codec: &str) -> EncoderDescriptor {
        EncoderDescriptor {
            kind,
            codec: codec.to_string(),
            pipeline: String::new(),
        }
    }

    fn sample_job() -> TranscodeJob {
        TranscodeJob {
            id: 1,
            input_path: "/media/in.mkv".to_string(),
            preset_id: "p".to_string(),
            encoder: descriptor(EncoderKind::Software, "libx265"),
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
            created_at: 0,
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

    #[test]
    fn args_carry_input_codec_and_machine_progress_flag() {
        let preset = Preset {
            id: "p".to_string(),
            name: "p".to_string(),
            codec: TargetCodec::Hevc,
            max_height: Some(1080),
            quality: Some(24),
            hardware_encoder: None,
            extra_args: vec!["-preset".to_string(), "slow".to_string()],
        };
        let job = sample_job();
        let args = build_encoder_args(
            &preset,
            &job.encoder,
            &job,
            Path::new("/tmp/in.tmp.mkv"),
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("-i /media/in.mkv -c:v libx265 -crf 24"));
        assert!(joined.contains("-progress pipe:1"));
        assert!(joined.contains("-preset slow"));
        assert!(joined.ends_with("-y /tmp/in.tmp.mkv"));
    }

    #[test]
    fn pipeline_label_is_cpu_cpu_for_software() {
        let enc = descriptor(EncoderKind::Software, "libx265");
        assert_eq!(pipeline_label(&enc, "yuv420p10le"), "cpu→cpu");
    }

    #[test]
    fn pipeline_label_uses_hardware_family_for_both_sides_on_8bit_420() {
        let enc = descriptor(EncoderKind::Hardware, "hevc_vaapi");
        assert_eq!(pipeline_label(&enc, "yuv420p"), "vaapi→vaapi");
    }

    #[test]
    fn pipeline_label_falls_back_to_cpu_decode_for_10bit_sources() {
        let enc = descriptor(EncoderKind::Hardware, "hevc_nvenc");
        assert_eq!(pipeline_label(&enc, "yuv420p10le"), "cpu→nvenc");
    }

    #[cfg(unix)]
    #[test]
    fn driver_streams_ticks_and_captures_stderr_from_a_scripted_encoder() {
        let script = "echo 'out_time_us=1000000'; \
                      echo 'speed=2x'; \
                      echo 'progress=continue'; \
                      echo 'progress=end'; \
                      echo 'oops' >&2";
        let args: Vec<String> = vec!["-c".to_string(), script.to_string()];
        let process = EncoderProcess::spawn("sh", &args).expect("sh must spawn");

        let mut ticks = Vec::new();
        let (status, tail) = process.finish(|tick| ticks.push(tick));
        assert!(status.expect("wait must succeed").success());
        // The pump may deliver ticks before finish(); collect the rest here.
        assert!(
            ticks.iter().any(|t| t.end),
            "the end marker must surface as a tick"
        );
        assert!(tail.contains("oops"));
    }
}
