/// Failure family for a non-zero encoder exit, derived from the stderr
/// tail. Only hardware-initialization failures are eligible for automatic
/// software fallback; format failures need a different pipeline, and
/// generic failures are surfaced as-is.
///
/// The indicator tables are tunables, not contracts: extend them as new
/// encoder stacks produce new messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EncoderFailure {
    Hardware,
    Format,
    Generic,
}

/// Messages that identify a hardware-encoder initialization failure on
/// their own.
const STRONG_HARDWARE_INDICATORS: &[&str] = &[
    "openencodesessionex failed",
    "cannot load cuda",
    "failed to initialise vaapi",
    "vainitialize failed",
    "cannot open drm render node",
    "mfxsession could not be created",
    "vt compression session",
    "hardware encoder init failed",
    "no encode device",
    "no capable devices found",
];

/// Vendor/tech keywords that only indicate a hardware failure when a
/// failure word appears alongside them.
const WEAK_HARDWARE_INDICATORS: &[&str] = &[
    "nvenc",
    "cuda",
    "nvidia",
    "vaapi",
    "va-api",
    "qsv",
    "quick sync",
    "videotoolbox",
    "hwaccel",
    "hardware",
];

const FAILURE_WORDS: &[&str] = &[
    "failed",
    "error",
    "cannot",
    "unable",
    "no device",
    "not found",
    "could not",
    "initialization",
    "unavailable",
];

/// Pixel-format / filter-graph mismatches. These fail identically on the
/// software encoder, so they never trigger fallback.
const FORMAT_INDICATORS: &[&str] = &[
    "impossible to convert between the formats",
    "error reinitializing filters",
    "failed to inject frame into filter network",
    "incompatible pixel format",
];

/// Exit code most encoders use for filter-graph negotiation failures.
const FORMAT_EXIT_CODE: i32 = 218;

pub(crate) fn classify_encoder_failure(stderr: &str, exit_code: Option<i32>) -> EncoderFailure {
    let haystack = stderr.to_ascii_lowercase();

    if exit_code == Some(FORMAT_EXIT_CODE)
        || FORMAT_INDICATORS.iter().any(|s| haystack.contains(s))
    {
        return EncoderFailure::Format;
    }

    if STRONG_HARDWARE_INDICATORS.iter().any(|s| haystack.contains(s)) {
        return EncoderFailure::Hardware;
    }

    let has_weak = WEAK_HARDWARE_INDICATORS.iter().any(|s| haystack.contains(s));
    let has_failure_word = FAILURE_WORDS.iter().any(|s| haystack.contains(s));
    if has_weak && has_failure_word {
        return EncoderFailure::Hardware;
    }

    EncoderFailure::Generic
}
