use serde_json::Value;

use crate::{error::DecodeError, scanner::Record};

/// Turns carved records into packet objects.
///
/// The capture engine only guarantees that `record` is one complete element (valid
/// UTF-8) and that `structure` is the summary structure when summaries are enabled.
/// Errors are passed to the caller unchanged, wrapped in [`crate::CaptureError::Decode`].
pub trait RecordDecoder: Send + Sync {
    type Packet: Clone + Send + Sync;
    type Structure: Send + Sync;

    fn decode(
        &self,
        record: &Record,
        structure: Option<&Self::Structure>,
    ) -> Result<Self::Packet, DecodeError>;

    /// Parses the PSML `<structure>` prologue. Called at most once per capture round.
    fn decode_summary_structure(&self, record: &Record) -> Result<Self::Structure, DecodeError>;
}

/// Record text as produced by tshark, without further parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub text: String,
    /// Raw text of the summary structure this packet belongs to, if any.
    pub structure: Option<String>,
}

/// Passes record text through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawRecordDecoder;

impl RecordDecoder for RawRecordDecoder {
    type Packet = RawPacket;
    type Structure = String;

    fn decode(
        &self,
        record: &Record,
        structure: Option<&String>,
    ) -> Result<RawPacket, DecodeError> {
        Ok(RawPacket {
            text: record.as_str().to_string(),
            structure: structure.cloned(),
        })
    }

    fn decode_summary_structure(&self, record: &Record) -> Result<String, DecodeError> {
        Ok(record.as_str().to_string())
    }
}

/// Parses each element of `-T json` output into a [`serde_json::Value`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordDecoder;

impl RecordDecoder for JsonRecordDecoder {
    type Packet = Value;
    type Structure = Value;

    fn decode(&self, record: &Record, _structure: Option<&Value>) -> Result<Value, DecodeError> {
        Ok(serde_json::from_str(record.as_str())?)
    }

    fn decode_summary_structure(&self, record: &Record) -> Result<Value, DecodeError> {
        Ok(serde_json::from_str(record.as_str())?)
    }
}
