#![forbid(unsafe_code)]
//! Streams packets out of a `tshark` child process.
//!
//! A [`CaptureSession`] spawns tshark with `-T pdml`, `-T psml` or `-T json`, carves its
//! stdout into one record per packet as bytes arrive, and hands each record to a
//! [`RecordDecoder`]. Packets are consumed one at a time ([`CaptureSession::next`]), pushed
//! through a callback ([`CaptureSession::apply_on_packets`]) or looked up by index when
//! they are kept in memory. Every tshark process the session starts is tracked and
//! reaped; a non-zero exit surfaces as [`CaptureError::ExternalProcessCrashed`].
//!
//! ```no_run
//! # async fn demo() -> Result<(), sharkstream::CaptureError> {
//! use sharkstream::{CaptureBuilder, RawRecordDecoder};
//!
//! let mut capture = CaptureBuilder::file("trace.pcapng")
//!     .display_filter("dns")
//!     .build(RawRecordDecoder)?;
//! while let Some(packet) = capture.next().await? {
//!     println!("{}", packet.text.len());
//! }
//! capture.close().await?;
//! # Ok(())
//! # }
//! ```

mod blocking;
mod builder;
mod config;
mod decoder;
mod error;
mod history;
mod params;
mod process;
mod scanner;
mod session;
mod version;

pub use blocking::{capture_runtime, BlockingCapture};
pub use builder::{CaptureBuilder, TSHARK_BINARY_ENV};
pub use config::{CaptureProfile, DecryptionProfile};
pub use decoder::{JsonRecordDecoder, RawPacket, RawRecordDecoder, RecordDecoder};
pub use error::{CaptureError, ConfigError, DecodeError};
pub use params::{
    CaptureParameters, CaptureSource, CustomParameters, EncryptionStandard, OutputFormat,
};
pub use process::{Invocation, ProcessHandle, ProcessId, ProcessSupervisor, REAP_TIMEOUT};
pub use scanner::{
    Boundary, BoundaryScanner, JsonSeparators, Record, StreamBuffer, TagScanner,
    DEFAULT_BATCH_SIZE, JSON_SEPARATOR_THRESHOLD, PACKET_TAG, STRUCTURE_TAG, SUMMARIES_BATCH_SIZE,
};
pub use session::{CaptureSession, RunLimits, RunOutcome, RunSummary};
pub use version::{
    display_filter_flag, parse_version_output, supports_json, DISPLAY_FILTER_FLAG_THRESHOLD,
    JSON_SUPPORT_THRESHOLD, VERSION_PROBE_TIMEOUT,
};
