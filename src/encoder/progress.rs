use once_cell::sync::Lazy;
use regex::Regex;

/// One progress observation parsed from the encoder's stdout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ProgressTick {
    /// Media time encoded so far, when the update carried one.
    pub(crate) elapsed_ms: Option<u64>,
    pub(crate) speed: Option<f64>,
    /// True for the `progress=end` marker that closes the stream.
    pub(crate) end: bool,
}

/// Precedence order for the elapsed-time keys inside one machine block.
/// `out_time_us` is authoritative; `out_time_ms` actually carries
/// microseconds too (a historical quirk of the machine format); the
/// `HH:MM:SS` form is the least precise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ElapsedSource {
    None,
    OutTime,
    OutTimeMs,
    OutTimeUs,
}

/// Incremental parser for the encoder's machine progress protocol: one
/// `key=value` pair per line, with `progress=continue` closing each update
/// block and `progress=end` closing the stream. Plain stats lines
/// (`... time=HH:MM:SS.cc ... speed=1.2x ...`) are accepted as a fallback
/// for encoders that do not emit the machine format.
#[derive(Debug)]
pub(crate) struct ProgressParser {
    block_elapsed_ms: Option<u64>,
    block_source: ElapsedSource,
    block_speed: Option<f64>,
}

/// Keys the machine progress protocol is known to emit, one per line.
const MACHINE_KEYS: &[&str] = &[
    "frame",
    "fps",
    "stream_0_0_q",
    "bitrate",
    "total_size",
    "out_time_us",
    "out_time_ms",
    "out_time",
    "dup_frames",
    "drop_frames",
    "speed",
    "progress",
];

static STATS_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\btime=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("stats time regex"));
static STATS_SPEED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bspeed=\s*(\d+(?:\.\d+)?)x").expect("stats speed regex"));

impl ProgressParser {
    pub(crate) fn new() -> Self {
        Self {
            block_elapsed_ms: None,
            block_source: ElapsedSource::None,
            block_speed: None,
        }
    }

    /// Feed one stdout line; returns a tick when the line completes an
    /// update (a block boundary or a parseable stats line).
    pub(crate) fn feed(&mut self, line: &str) -> Option<ProgressTick> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        // A stats line also starts with `frame=`, so a machine pair is only
        // recognized when the key is known AND the value is a single token.
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            if MACHINE_KEYS.contains(&key) && !value.contains(' ') {
                match key {
                    "out_time_us" => {
                        if let Ok(us) = value.parse::<i64>() {
                            self.record_elapsed(us_to_ms(us), ElapsedSource::OutTimeUs);
                        }
                    }
                    "out_time_ms" => {
                        // Microseconds, despite the name.
                        if let Ok(us) = value.parse::<i64>() {
                            self.record_elapsed(us_to_ms(us), ElapsedSource::OutTimeMs);
                        }
                    }
                    "out_time" => {
                        if let Some(seconds) = parse_clock_time(value) {
                            self.record_elapsed(
                                (seconds * 1000.0) as u64,
                                ElapsedSource::OutTime,
                            );
                        }
                    }
                    "speed" => {
                        let trimmed = value.trim_end_matches('x');
                        if let Ok(v) = trimmed.parse::<f64>()
                            && v.is_finite()
                        {
                            self.block_speed = Some(v);
                        }
                    }
                    "progress" => {
                        let end = value.eq_ignore_ascii_case("end");
                        return Some(self.take_block(end));
                    }
                    // frame, fps, total_size, bitrate, ...: recognized but
                    // not used for progress.
                    _ => {}
                }
                return None;
            }
        }

        self.parse_stats_line(line)
    }

    fn record_elapsed(&mut self, elapsed_ms: u64, source: ElapsedSource) {
        if source > self.block_source {
            self.block_source = source;
            self.block_elapsed_ms = Some(elapsed_ms);
        }
    }

    fn take_block(&mut self, end: bool) -> ProgressTick {
        let tick = ProgressTick {
            elapsed_ms: self.block_elapsed_ms.take(),
            speed: self.block_speed.take(),
            end,
        };
        self.block_source = ElapsedSource::None;
        tick
    }

    fn parse_stats_line(&self, line: &str) -> Option<ProgressTick> {
        let caps = STATS_TIME.captures(line)?;
        let hours: f64 = caps[1].parse().ok()?;
        let minutes: f64 = caps[2].parse().ok()?;
        let seconds: f64 = caps[3].parse().ok()?;
        let elapsed_ms = ((hours * 3600.0 + minutes * 60.0 + seconds) * 1000.0) as u64;

        let speed = STATS_SPEED
            .captures(line)
            .and_then(|c| c[1].parse::<f64>().ok())
            .filter(|v| v.is_finite());

        Some(ProgressTick {
            elapsed_ms: Some(elapsed_ms),
            speed,
            end: false,
        })
    }
}

fn us_to_ms(us: i64) -> u64 {
    if us <= 0 { 0 } else { (us / 1000) as u64 }
}

fn parse_clock_time(value: &str) -> Option<f64> {
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.trim().parse().ok()?;
    let minutes: f64 = parts.next()?.trim().parse().ok()?;
    let seconds: f64 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Percent complete, clamped to [0, 100]. A zero or unknown duration pins
/// the percentage at 0; callers log that condition once per job.
pub(crate) fn compute_progress_percent(duration_ms: u64, elapsed_ms: u64) -> f64 {
    if duration_ms == 0 {
        return 0.0;
    }
    let ratio = elapsed_ms as f64 / duration_ms as f64;
    (ratio * 100.0).clamp(0.0, 100.0)
}

/// Human-readable remaining time, or the empty string when speed is
/// unknown or non-positive.
pub(crate) fn format_eta(duration_ms: u64, elapsed_ms: u64, speed: f64) -> String {
    if !(speed.is_finite() && speed > 0.0) || duration_ms == 0 {
        return String::new();
    }
    let remaining_ms = duration_ms.saturating_sub(elapsed_ms);
    let secs = (remaining_ms as f64 / 1000.0 / speed).round() as u64;
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_block_emits_one_tick_at_the_continue_marker() {
        let mut parser = ProgressParser::new();
        assert_eq!(parser.feed("frame=250"), None);
        assert_eq!(parser.feed("fps=25.0"), None);
        assert_eq!(parser.feed("out_time_us=10000000"), None);
        assert_eq!(parser.feed("speed=1.25x"), None);
        let tick = parser.feed("progress=continue").expect("boundary tick");
        assert_eq!(tick.elapsed_ms, Some(10_000));
        assert_eq!(tick.speed, Some(1.25));
        assert!(!tick.end);
    }

    #[test]
    fn out_time_us_wins_over_the_other_elapsed_keys() {
        let mut parser = ProgressParser::new();
        parser.feed("out_time=00:00:05.000000");
        parser.feed("out_time_ms=7000000");
        parser.feed("out_time_us=9000000");
        let tick = parser.feed("progress=continue").unwrap();
        assert_eq!(tick.elapsed_ms, Some(9_000));
    }

    #[test]
    fn out_time_ms_is_treated_as_microseconds() {
        let mut parser = ProgressParser::new();
        parser.feed("out_time_ms=2500000");
        let tick = parser.feed("progress=continue").unwrap();
        assert_eq!(tick.elapsed_ms, Some(2_500));
    }

    #[test]
    fn end_marker_closes_the_stream() {
        let mut parser = ProgressParser::new();
        parser.feed("out_time_us=1000000");
        let tick = parser.feed("progress=end").unwrap();
        assert!(tick.end);
        assert_eq!(tick.elapsed_ms, Some(1_000));
    }

    #[test]
    fn stats_line_fallback_parses_time_and_speed() {
        let mut parser = ProgressParser::new();
        let line = "frame=  100 fps= 25 q=28.0 size=    1024KiB time=00:01:30.50 bitrate= 798.0kbits/s speed=1.05x";
        let tick = parser.feed(line).expect("stats line must parse");
        assert_eq!(tick.elapsed_ms, Some(90_500));
        assert_eq!(tick.speed, Some(1.05));
    }

    #[test]
    fn stats_line_without_time_is_ignored() {
        let mut parser = ProgressParser::new();
        assert_eq!(parser.feed("Press [q] to stop, [?] for help"), None);
        assert_eq!(parser.feed("speed is of the essence"), None);
    }

    #[test]
    fn blocks_do_not_leak_values_into_the_next_block() {
        let mut parser = ProgressParser::new();
        parser.feed("out_time_us=5000000");
        parser.feed("speed=2x");
        let _ = parser.feed("progress=continue");
        let tick = parser.feed("progress=continue").unwrap();
        assert_eq!(tick.elapsed_ms, None);
        assert_eq!(tick.speed, None);
    }

    #[test]
    fn percent_is_zero_when_duration_is_unknown() {
        assert_eq!(compute_progress_percent(0, 60_000), 0.0);
    }

    #[test]
    fn percent_is_capped_at_one_hundred() {
        assert_eq!(compute_progress_percent(10_000, 20_000), 100.0);
        let halfway = compute_progress_percent(10_000, 5_000);
        assert!((halfway - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn eta_formats_by_magnitude_and_scales_with_speed() {
        assert_eq!(format_eta(120_000, 0, 1.0), "2m0s");
        assert_eq!(format_eta(120_000, 0, 2.0), "1m0s");
        assert_eq!(format_eta(30_000, 0, 1.0), "30s");
        assert_eq!(format_eta(7_200_000, 0, 1.0), "2h0m");
        assert_eq!(format_eta(120_000, 0, 0.0), "");
        assert_eq!(format_eta(0, 0, 1.0), "");
    }
}
