use std::path::PathBuf;

use semver::Version;

use crate::{
    config::CaptureProfile,
    params::{CaptureParameters, CaptureSource, CustomParameters, EncryptionStandard},
    session::CaptureSession,
    CaptureError, RecordDecoder,
};

/// Environment variable consulted when no binary is configured explicitly.
pub const TSHARK_BINARY_ENV: &str = "TSHARK_BINARY";

#[derive(Debug, Clone)]
pub struct CaptureBuilder {
    pub(crate) source: CaptureSource,
    pub(crate) binary: Option<PathBuf>,
    pub(crate) keep_packets: bool,
    pub(crate) use_json: bool,
    pub(crate) include_raw: bool,
    pub(crate) only_summaries: bool,
    pub(crate) display_filter: Option<String>,
    pub(crate) capture_filter: Option<String>,
    pub(crate) decryption: Option<(String, String)>,
    pub(crate) override_prefs: Vec<(String, String)>,
    pub(crate) output_file: Option<PathBuf>,
    pub(crate) decode_as: Vec<(String, String)>,
    pub(crate) disable_protocol: Option<String>,
    pub(crate) custom_parameters: Option<CustomParameters>,
    pub(crate) debug: bool,
    pub(crate) tshark_version: Option<Version>,
}

impl CaptureBuilder {
    pub fn new(source: CaptureSource) -> Self {
        Self {
            source,
            binary: None,
            keep_packets: true,
            use_json: false,
            include_raw: false,
            only_summaries: false,
            display_filter: None,
            capture_filter: None,
            decryption: None,
            override_prefs: Vec::new(),
            output_file: None,
            decode_as: Vec::new(),
            disable_protocol: None,
            custom_parameters: None,
            debug: false,
            tshark_version: None,
        }
    }

    /// Reads packets from a capture file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(CaptureSource::File(path.into()))
    }

    /// Captures live from a network interface.
    pub fn interface(name: impl Into<String>) -> Self {
        Self::new(CaptureSource::Interface(name.into()))
    }

    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    /// Keep delivered packets for replay and indexed access (default: true).
    pub fn keep_packets(mut self, enabled: bool) -> Self {
        self.keep_packets = enabled;
        self
    }

    pub fn use_json(mut self, enabled: bool) -> Self {
        self.use_json = enabled;
        self
    }

    /// Adds raw packet bytes (`-x`) to JSON output. Requires [`CaptureBuilder::use_json`].
    pub fn include_raw(mut self, enabled: bool) -> Self {
        self.include_raw = enabled;
        self
    }

    /// Produce PSML summaries instead of full PDML dissections.
    pub fn only_summaries(mut self, enabled: bool) -> Self {
        self.only_summaries = enabled;
        self
    }

    pub fn display_filter(mut self, filter: impl Into<String>) -> Self {
        self.display_filter = Some(filter.into());
        self
    }

    pub fn capture_filter(mut self, filter: impl Into<String>) -> Self {
        self.capture_filter = Some(filter.into());
        self
    }

    /// 802.11 decryption key and its standard (`wep`, `wpa-pwk`, `wpa-pwd` or `wpa-psk`,
    /// case-insensitive). The standard is validated by [`CaptureBuilder::build`].
    pub fn decryption_key(mut self, key: impl Into<String>, standard: impl Into<String>) -> Self {
        self.decryption = Some((key.into(), standard.into()));
        self
    }

    pub fn override_pref(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.override_prefs.push((name.into(), value.into()));
        self
    }

    /// Writes every read packet to `path` (`-w`).
    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    /// Decode traffic matching `criterion` (e.g. `tcp.port==8888`) as `protocol`.
    pub fn decode_as(mut self, criterion: impl Into<String>, protocol: impl Into<String>) -> Self {
        self.decode_as.push((criterion.into(), protocol.into()));
        self
    }

    pub fn disable_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.disable_protocol = Some(protocol.into());
        self
    }

    pub fn custom_parameters(mut self, parameters: CustomParameters) -> Self {
        self.custom_parameters = Some(parameters);
        self
    }

    /// Inherit tshark's stderr instead of discarding it.
    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Skips the `tshark -v` probe by declaring the version up front.
    pub fn tshark_version(mut self, version: Version) -> Self {
        self.tshark_version = Some(version);
        self
    }

    /// Applies every setting present in `profile`, leaving the others untouched.
    pub fn profile(mut self, profile: CaptureProfile) -> Result<Self, CaptureError> {
        let custom_parameters = profile.custom_parameters()?;
        let CaptureProfile {
            binary,
            keep_packets,
            use_json,
            include_raw,
            only_summaries,
            debug,
            display_filter,
            capture_filter,
            decryption,
            override_prefs,
            decode_as,
            disable_protocol,
            output_file,
            tshark_version,
            ..
        } = profile;

        if let Some(binary) = binary {
            self.binary = Some(binary);
        }
        if let Some(enabled) = keep_packets {
            self.keep_packets = enabled;
        }
        if let Some(enabled) = use_json {
            self.use_json = enabled;
        }
        if let Some(enabled) = include_raw {
            self.include_raw = enabled;
        }
        if let Some(enabled) = only_summaries {
            self.only_summaries = enabled;
        }
        if let Some(enabled) = debug {
            self.debug = enabled;
        }
        if display_filter.is_some() {
            self.display_filter = display_filter;
        }
        if capture_filter.is_some() {
            self.capture_filter = capture_filter;
        }
        if let Some(decryption) = decryption {
            self.decryption = Some((decryption.key, decryption.standard));
        }
        self.override_prefs.extend(override_prefs);
        self.decode_as.extend(decode_as);
        if disable_protocol.is_some() {
            self.disable_protocol = disable_protocol;
        }
        if output_file.is_some() {
            self.output_file = output_file;
        }
        if custom_parameters.is_some() {
            self.custom_parameters = custom_parameters;
        }
        if tshark_version.is_some() {
            self.tshark_version = tshark_version;
        }
        Ok(self)
    }

    /// Validates the configuration and creates a session. No process is spawned yet.
    pub fn build<D: RecordDecoder>(self, decoder: D) -> Result<CaptureSession<D>, CaptureError>
    where
        D::Packet: 'static,
    {
        if let CaptureSource::File(path) = &self.source {
            if !path.exists() {
                return Err(CaptureError::SourceNotFound { path: path.clone() });
            }
        }
        if self.include_raw && !self.use_json {
            return Err(CaptureError::RawRequiresJson);
        }
        let encryption = match self.decryption {
            Some((key, standard)) => Some((key, standard.parse::<EncryptionStandard>()?)),
            None => None,
        };

        let binary = self.binary.unwrap_or_else(resolve_binary);
        let parameters = CaptureParameters {
            source: self.source,
            use_json: self.use_json,
            include_raw: self.include_raw,
            only_summaries: self.only_summaries,
            display_filter: self.display_filter,
            capture_filter: self.capture_filter,
            encryption,
            override_prefs: self.override_prefs,
            output_file: self.output_file,
            decode_as: self.decode_as,
            disable_protocol: self.disable_protocol,
            custom_parameters: self.custom_parameters,
        };

        Ok(CaptureSession::new(
            binary,
            parameters,
            decoder,
            self.keep_packets,
            self.debug,
            self.tshark_version,
        ))
    }
}

fn resolve_binary() -> PathBuf {
    if let Ok(v) = std::env::var(TSHARK_BINARY_ENV) {
        if !v.trim().is_empty() {
            return PathBuf::from(v);
        }
    }
    PathBuf::from("tshark")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawRecordDecoder;

    #[test]
    fn missing_file_fails_before_anything_else() {
        let err = CaptureBuilder::file("/definitely/not/here.pcap")
            .include_raw(true)
            .build(RawRecordDecoder)
            .unwrap_err();
        assert!(matches!(err, CaptureError::SourceNotFound { .. }), "{err:?}");
    }

    #[test]
    fn raw_requires_json() {
        let err = CaptureBuilder::interface("lo")
            .include_raw(true)
            .build(RawRecordDecoder)
            .unwrap_err();
        assert!(matches!(err, CaptureError::RawRequiresJson), "{err:?}");
    }

    #[test]
    fn unknown_encryption_standard_is_rejected() {
        let err = CaptureBuilder::interface("wlan0")
            .decryption_key("secret", "WPA3")
            .build(RawRecordDecoder)
            .unwrap_err();
        assert!(
            matches!(err, CaptureError::UnknownEncryptionStandard { ref given } if given == "WPA3"),
            "{err:?}"
        );
    }

    #[test]
    fn interface_sources_are_not_checked_on_disk() {
        let session = CaptureBuilder::interface("any")
            .binary("/usr/bin/tshark")
            .decryption_key("secret", "WPA-PSK")
            .build(RawRecordDecoder)
            .unwrap();
        assert_eq!(session.binary(), std::path::Path::new("/usr/bin/tshark"));
    }
}
