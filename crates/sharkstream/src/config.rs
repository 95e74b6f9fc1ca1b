use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use semver::Version;
use serde::Deserialize;
use toml::Value as TomlValue;

use crate::{error::ConfigError, CaptureError, CustomParameters};

/// Reusable capture settings stored as TOML.
///
/// ```toml
/// use_json = true
/// display_filter = "dns"
/// tshark_version = "3.6.2"
///
/// [decryption]
/// key = "secret"
/// standard = "wpa-pwd"
///
/// [override_prefs]
/// "tcp.desegment_tcp_streams" = "TRUE"
///
/// [decode_as]
/// "tcp.port==8888" = "http"
/// ```
///
/// Apply with [`crate::CaptureBuilder::profile`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureProfile {
    pub binary: Option<PathBuf>,
    pub keep_packets: Option<bool>,
    pub use_json: Option<bool>,
    pub include_raw: Option<bool>,
    pub only_summaries: Option<bool>,
    pub debug: Option<bool>,
    pub display_filter: Option<String>,
    pub capture_filter: Option<String>,
    pub decryption: Option<DecryptionProfile>,
    pub override_prefs: BTreeMap<String, String>,
    pub decode_as: BTreeMap<String, String>,
    pub disable_protocol: Option<String>,
    pub output_file: Option<PathBuf>,
    pub tshark_version: Option<Version>,
    /// Kept untyped so that an unsupported shape is reported as a configuration error
    /// rather than a parse failure of the whole file.
    pub custom_parameters: Option<TomlValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecryptionProfile {
    pub key: String,
    pub standard: String,
}

impl CaptureProfile {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse { source })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Interprets `custom_parameters`: a list of strings, a list of `[flag, value]`
    /// pairs, or a table of flag = value.
    pub fn custom_parameters(&self) -> Result<Option<CustomParameters>, CaptureError> {
        let Some(value) = self.custom_parameters.as_ref() else {
            return Ok(None);
        };
        if let TomlValue::Table(table) = value {
            let mut pairs = Vec::with_capacity(table.len());
            for (flag, value) in table {
                let TomlValue::String(value) = value else {
                    return Err(unsupported_custom_parameters());
                };
                pairs.push((flag.clone(), value.clone()));
            }
            return Ok(Some(CustomParameters::Pairs(pairs)));
        }
        value
            .clone()
            .try_into::<CustomParameters>()
            .map(Some)
            .map_err(|_| unsupported_custom_parameters())
    }
}

fn unsupported_custom_parameters() -> CaptureError {
    CaptureError::InvalidConfiguration(
        "custom_parameters must be a list of strings, a list of [flag, value] pairs, or a table of strings"
            .to_string(),
    )
}
