use crate::domain::{MediaProbe, Preset};

/// Decide, from probe metadata alone, whether transcoding this source under
/// the given preset can pay off. Returns the user-visible reason when it
/// cannot. The force flag on a job bypasses this check entirely; callers
/// enforce that.
pub(crate) fn check_skip_reason(probe: &MediaProbe, preset: &Preset) -> Option<String> {
    if let Some(max_height) = preset.max_height
        && probe.height > 0
        && probe.height <= max_height
    {
        return Some(format!("already at or below {max_height}p"));
    }

    if preset.codec.matches_source(&probe.video_codec) {
        return Some(format!(
            "already encoded in {}",
            preset.codec.display_name()
        ));
    }

    None
}
