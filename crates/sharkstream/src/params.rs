use std::{fmt, path::PathBuf, str::FromStr};

use semver::Version;
use serde::Deserialize;

use crate::{version::display_filter_flag, CaptureError};

/// Preference keys that the explicit decryption settings own.
const RESERVED_DECRYPTION_PREFS: [&str; 2] = ["wlan.enable_decryption", "uat:80211_keys"];

/// 802.11 key standards understood by tshark's `uat:80211_keys` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionStandard {
    Wep,
    WpaPwk,
    WpaPwd,
    WpaPsk,
}

impl EncryptionStandard {
    pub const ALL: [EncryptionStandard; 4] = [
        EncryptionStandard::Wep,
        EncryptionStandard::WpaPwk,
        EncryptionStandard::WpaPwd,
        EncryptionStandard::WpaPsk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionStandard::Wep => "wep",
            EncryptionStandard::WpaPwk => "wpa-pwk",
            EncryptionStandard::WpaPwd => "wpa-pwd",
            EncryptionStandard::WpaPsk => "wpa-psk",
        }
    }
}

impl fmt::Display for EncryptionStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionStandard {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|standard| standard.as_str() == lowered)
            .ok_or_else(|| CaptureError::UnknownEncryptionStandard {
                given: s.to_string(),
            })
    }
}

/// Extra arguments appended verbatim, either as a flat list or as flag/value pairs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CustomParameters {
    List(Vec<String>),
    Pairs(Vec<(String, String)>),
}

impl CustomParameters {
    fn extend_argv(&self, out: &mut Vec<String>) {
        match self {
            CustomParameters::List(args) => out.extend(args.iter().cloned()),
            CustomParameters::Pairs(pairs) => {
                for (flag, value) in pairs {
                    out.push(flag.clone());
                    out.push(value.clone());
                }
            }
        }
    }
}

/// Shape of tshark's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Full packet details as XML.
    Pdml,
    /// One summary line per packet as XML, preceded by a `<structure>` element.
    Psml,
    Json,
}

impl OutputFormat {
    pub(crate) fn as_arg_value(&self) -> &'static str {
        match self {
            OutputFormat::Pdml => "pdml",
            OutputFormat::Psml => "psml",
            OutputFormat::Json => "json",
        }
    }
}

/// Where tshark reads packets from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    /// A capture file (pcap, pcapng, ...). Must exist when the session is built.
    File(PathBuf),
    /// A live interface name, passed through to `-i`.
    Interface(String),
}

impl CaptureSource {
    fn extend_argv(&self, out: &mut Vec<String>) {
        match self {
            CaptureSource::File(path) => {
                out.push("-r".to_string());
                out.push(path.display().to_string());
            }
            CaptureSource::Interface(name) => {
                out.push("-i".to_string());
                out.push(name.clone());
            }
        }
    }
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureSource::File(path) => write!(f, "{}", path.display()),
            CaptureSource::Interface(name) => write!(f, "interface {name}"),
        }
    }
}

/// Everything that ends up on tshark's command line, validated at build time.
#[derive(Debug, Clone)]
pub struct CaptureParameters {
    pub(crate) source: CaptureSource,
    pub(crate) use_json: bool,
    pub(crate) include_raw: bool,
    pub(crate) only_summaries: bool,
    pub(crate) display_filter: Option<String>,
    pub(crate) capture_filter: Option<String>,
    pub(crate) encryption: Option<(String, EncryptionStandard)>,
    pub(crate) override_prefs: Vec<(String, String)>,
    pub(crate) output_file: Option<PathBuf>,
    pub(crate) decode_as: Vec<(String, String)>,
    pub(crate) disable_protocol: Option<String>,
    pub(crate) custom_parameters: Option<CustomParameters>,
}

impl CaptureParameters {
    #[cfg(test)]
    pub(crate) fn new(source: CaptureSource) -> Self {
        Self {
            source,
            use_json: false,
            include_raw: false,
            only_summaries: false,
            display_filter: None,
            capture_filter: None,
            encryption: None,
            override_prefs: Vec::new(),
            output_file: None,
            decode_as: Vec::new(),
            disable_protocol: None,
            custom_parameters: None,
        }
    }

    pub fn source(&self) -> &CaptureSource {
        &self.source
    }

    pub fn output_format(&self) -> OutputFormat {
        if self.use_json {
            OutputFormat::Json
        } else if self.only_summaries {
            OutputFormat::Psml
        } else {
            OutputFormat::Pdml
        }
    }

    /// Whether building the argument list depends on the tshark version.
    pub(crate) fn needs_version(&self) -> bool {
        self.use_json || self.display_filter.is_some()
    }

    /// Full tshark argument list (without the binary).
    ///
    /// `version` selects the display filter flag; `-Y` is assumed when it is unknown.
    pub fn argv(&self, version: Option<&Version>, packet_count: Option<usize>) -> Vec<String> {
        let mut out: Vec<String> = vec![
            "-l".to_string(),
            "-n".to_string(),
            "-T".to_string(),
            self.output_format().as_arg_value().to_string(),
        ];

        if let Some(filter) = self.capture_filter.as_ref() {
            out.push("-f".to_string());
            out.push(filter.clone());
        }

        if let Some(filter) = self.display_filter.as_ref() {
            out.push(version.map(display_filter_flag).unwrap_or("-Y").to_string());
            out.push(filter.clone());
        }

        if self.include_raw {
            out.push("-x".to_string());
        }

        if let Some(count) = packet_count.filter(|count| *count > 0) {
            out.push("-c".to_string());
            out.push(count.to_string());
        }

        if let Some(custom) = self.custom_parameters.as_ref() {
            custom.extend_argv(&mut out);
        }

        if let Some((key, standard)) = self.encryption.as_ref() {
            out.push("-o".to_string());
            out.push("wlan.enable_decryption:TRUE".to_string());
            out.push("-o".to_string());
            out.push(format!("uat:80211_keys:\"{standard}\",\"{key}\""));
        }

        for (name, value) in &self.override_prefs {
            if self.encryption.is_some() && RESERVED_DECRYPTION_PREFS.contains(&name.as_str()) {
                continue;
            }
            out.push("-o".to_string());
            out.push(format!("{name}:{value}"));
        }

        if let Some(path) = self.output_file.as_ref() {
            out.push("-w".to_string());
            out.push(path.display().to_string());
        }

        for (criterion, protocol) in &self.decode_as {
            out.push("-d".to_string());
            out.push(format!("{},{}", criterion.trim(), protocol.trim()));
        }

        if let Some(protocol) = self.disable_protocol.as_ref() {
            out.push("--disable-protocol".to_string());
            out.push(protocol.trim().to_string());
        }

        self.source.extend_argv(&mut out);
        out
    }
}
