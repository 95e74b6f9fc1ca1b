use std::{path::Path, time::Duration};

use semver::Version;
use tracing::debug;

use crate::{process, CaptureError};

/// tshark releases before this one only understand `-R` for display filters.
pub const DISPLAY_FILTER_FLAG_THRESHOLD: Version = Version::new(1, 10, 0);

/// First tshark release with `-T json`.
pub const JSON_SUPPORT_THRESHOLD: Version = Version::new(2, 2, 0);

/// How long `tshark -v` may take before the probe gives up.
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Flag tshark expects in front of a display filter.
pub fn display_filter_flag(version: &Version) -> &'static str {
    if *version >= DISPLAY_FILTER_FLAG_THRESHOLD {
        "-Y"
    } else {
        "-R"
    }
}

pub fn supports_json(version: &Version) -> bool {
    *version >= JSON_SUPPORT_THRESHOLD
}

/// Pulls the first version-looking token out of `tshark -v` output.
///
/// Accepts full semver (`3.6.2`) as well as the two-component form older builds print
/// (`1.8`).
pub fn parse_version_output(output: &str) -> Option<Version> {
    let tokens = || {
        output.split_whitespace().map(|token| {
            token
                .trim_matches(|c: char| matches!(c, '(' | ')' | ',' | ';'))
                .trim_start_matches('v')
        })
    };

    if let Some(version) = tokens().find_map(|candidate| Version::parse(candidate).ok()) {
        return Some(version);
    }
    tokens().find_map(parse_major_minor)
}

fn parse_major_minor(candidate: &str) -> Option<Version> {
    let (major, minor) = candidate.split_once('.')?;
    let major = major.parse().ok()?;
    let minor = minor.parse().ok()?;
    Some(Version::new(major, minor, 0))
}

/// Runs `<binary> -v` and parses the reported version.
pub(crate) async fn probe_version(binary: &Path) -> Result<Version, CaptureError> {
    let output = process::run_command(binary, &["-v"], VERSION_PROBE_TIMEOUT).await?;
    let text = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        return Err(CaptureError::VersionProbe {
            binary: binary.to_path_buf(),
            reason: format!("`-v` exited with {}", output.status),
        });
    }

    let version = parse_version_output(&text).ok_or_else(|| CaptureError::VersionProbe {
        binary: binary.to_path_buf(),
        reason: format!("no version in output: {}", text.trim()),
    })?;
    debug!(binary = ?binary, %version, "detected tshark version");
    Ok(version)
}
