use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::OriginalHandling;

/// Container extension for finished outputs.
const OUTPUT_EXTENSION: &str = "mkv";

/// Suffix distinguishing the final output from the original next to it.
const OUTPUT_SUFFIX: &str = "recoded";

/// Derive the stable temp and final output paths for an input. The temp
/// file lives in the configured scratch directory when one is set,
/// otherwise next to the input; the final output always lands next to the
/// input.
pub(crate) fn plan_paths(input: &Path, temp_dir: Option<&Path>) -> (PathBuf, PathBuf) {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let parent = input.parent().unwrap_or_else(|| Path::new("."));

    let temp_parent = temp_dir.unwrap_or(parent);
    let temp = temp_parent.join(format!("{stem}.tmp.{OUTPUT_EXTENSION}"));
    let output = parent.join(format!("{stem}.{OUTPUT_SUFFIX}.{OUTPUT_EXTENSION}"));
    (temp, output)
}

/// Promote a finished temp file to its final output path.
///
/// The original is first moved aside (`{name}.old` in keep mode) or deleted
/// (replace mode), then the temp is *copied* to the output and deleted,
/// never renamed: the temp directory may be a different filesystem.
/// On any error the original is restored best-effort and the partial output
/// removed. Returns the output size in bytes.
pub(crate) fn finalize_output(
    input: &Path,
    temp: &Path,
    output: &Path,
    handling: OriginalHandling,
) -> Result<u64> {
    let backup = match handling {
        OriginalHandling::Keep => {
            let backup = backup_path(input);
            fs::rename(input, &backup).with_context(|| {
                format!("failed to set aside original {} -> {}", input.display(), backup.display())
            })?;
            Some(backup)
        }
        OriginalHandling::Replace => {
            fs::remove_file(input)
                .with_context(|| format!("failed to remove original {}", input.display()))?;
            None
        }
    };

    let copied = fs::copy(temp, output)
        .with_context(|| format!("failed to copy {} -> {}", temp.display(), output.display()));
    let size = match copied {
        Ok(size) => size,
        Err(err) => {
            drop(fs::remove_file(output));
            if let Some(backup) = backup {
                drop(fs::rename(&backup, input));
            }
            return Err(err);
        }
    };

    if let Err(err) = fs::remove_file(temp) {
        tracing::warn!(path = %temp.display(), error = %err, "failed to delete temp output");
    }
    Ok(size)
}

fn backup_path(input: &Path) -> PathBuf {
    let mut name = input
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "original".to_string());
    name.push_str(".old");
    input.with_file_name(name)
}
