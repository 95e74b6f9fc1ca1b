use std::{path::PathBuf, time::Duration};

use semver::Version;
use thiserror::Error;

use crate::process::Invocation;

/// Boxed error raised by a [`crate::RecordDecoder`] implementation.
pub type DecodeError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that may occur while configuring or driving a capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture source `{path}` does not exist")]
    SourceNotFound { path: PathBuf },
    #[error("invalid capture configuration: {0}")]
    InvalidConfiguration(String),
    #[error("unknown encryption standard `{given}` (supported: wep, wpa-pwk, wpa-pwd, wpa-psk)")]
    UnknownEncryptionStandard { given: String },
    #[error("include_raw requires use_json")]
    RawRequiresJson,
    #[error("JSON output requires tshark >= 2.2.0 (found {version})")]
    JsonUnsupported { version: Version },
    #[error("tshark binary `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tshark seems to have crashed (exit code {code}); command ran: `{invocation}`")]
    ExternalProcessCrashed { code: i32, invocation: Invocation },
    #[error("tshark stdout unavailable")]
    StdoutUnavailable,
    #[error("failed reading tshark stdout: {0}")]
    StdoutRead(#[source] std::io::Error),
    #[error("failed to terminate tshark process: {0}")]
    Kill(#[source] std::io::Error),
    #[error("failed to determine tshark version from `{binary}`: {reason}")]
    VersionProbe { binary: PathBuf, reason: String },
    #[error("failed to decode packet record: {0}")]
    Decode(#[source] DecodeError),
    #[error("capture did not finish within {timeout:?} ({delivered} packets delivered)")]
    TimedOut { timeout: Duration, delivered: usize },
    #[error("indexed access requires keep_packets(true)")]
    HistoryDisabled,
    #[error("packet of index {index} does not exist in capture")]
    IndexNotFound { index: usize },
}

/// Errors raised while loading a [`crate::CaptureProfile`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse capture profile: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },
}
