//! Record boundary detection over tshark's streamed stdout.
//!
//! tshark writes either a sequence of XML elements (PDML/PSML) or one large JSON array.
//! Neither format is line-delimited, so records are carved out of a growing byte buffer by
//! looking for the exact delimiters tshark emits. Braces and tags are never counted; field
//! values may contain either.

use std::ops::Range;

use memchr::memmem;
use semver::Version;
use tracing::warn;

/// Read size used while streaming packet records.
pub const DEFAULT_BATCH_SIZE: usize = 1 << 16;

/// Read size used while looking for the PSML `<structure>` prologue.
pub const SUMMARIES_BATCH_SIZE: usize = 64;

/// First tshark release whose JSON output uses the compact `},` separator layout.
pub const JSON_SEPARATOR_THRESHOLD: Version = Version::new(3, 0, 0);

/// Element name of one packet in PDML and PSML output.
pub const PACKET_TAG: &str = "packet";

/// Element name of the PSML summary structure prologue.
pub const STRUCTURE_TAG: &str = "structure";

const LINE_SEPARATOR: &str = if cfg!(windows) { "\r\n" } else { "\n" };

/// Append-only byte accumulator with a read offset.
///
/// Bytes before the offset belong to records that were already handed out; they are
/// dropped lazily once they make up at least half of the allocation.
#[derive(Debug, Default, Clone)]
pub struct StreamBuffer {
    data: Vec<u8>,
    start: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes that have not been consumed by a record yet.
    pub fn unconsumed(&self) -> &[u8] {
        &self.data[self.start..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.compact();
        self.data.extend_from_slice(bytes);
    }

    /// Tail of the buffer for readers that append directly into it.
    pub(crate) fn tail(&mut self) -> &mut Vec<u8> {
        self.compact();
        &mut self.data
    }

    /// Copies `span` out of the unconsumed bytes and moves the read offset to `resume`.
    fn take(&mut self, span: Range<usize>, resume: usize) -> Vec<u8> {
        let base = self.start;
        let bytes = self.data[base + span.start..base + span.end].to_vec();
        self.start = (base + resume).min(self.data.len());
        bytes
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        } else if self.start * 2 >= self.data.len() {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }
}

/// One complete record carved out of the stream, guaranteed to be valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    text: String,
    lossy: bool,
}

impl Record {
    /// Invalid UTF-8 sequences are replaced with U+FFFD rather than failing the stream.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self { text, lossy: false },
            Err(err) => Self {
                text: String::from_utf8_lossy(err.as_bytes()).into_owned(),
                lossy: true,
            },
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    /// Whether undecodable bytes had to be replaced.
    pub fn was_lossy(&self) -> bool {
        self.lossy
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Location of the next record inside a byte slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// `start..end` is the record; scanning continues at `resume`.
    Found {
        start: usize,
        end: usize,
        resume: usize,
    },
    /// No complete record yet; more bytes are needed.
    Incomplete,
}

/// Version-dependent delimiters between elements of tshark's JSON array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonSeparators {
    packet: Vec<u8>,
    end_of_array: Vec<u8>,
    strip: usize,
}

impl JsonSeparators {
    pub fn for_version(version: &Version) -> Self {
        let nl = LINE_SEPARATOR;
        if *version >= JSON_SEPARATOR_THRESHOLD {
            Self {
                packet: format!("{nl}  }},{nl}").into_bytes(),
                end_of_array: format!("}}{nl}]").into_bytes(),
                strip: 1 + nl.len(),
            }
        } else {
            Self {
                packet: format!("}}{nl}{nl}  ,").into_bytes(),
                end_of_array: format!("}}{nl}{nl}]").into_bytes(),
                strip: 1,
            }
        }
    }

    pub fn packet(&self) -> &[u8] {
        &self.packet
    }

    pub fn end_of_array(&self) -> &[u8] {
        &self.end_of_array
    }

    /// Bytes at the tail of a matched separator that do not belong to the record.
    pub fn strip(&self) -> usize {
        self.strip
    }
}

/// Finds matched `<name>` ... `</name>` elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagScanner {
    open: Vec<u8>,
    close: Vec<u8>,
}

impl TagScanner {
    pub fn new(name: &str) -> Self {
        Self {
            open: format!("<{name}>").into_bytes(),
            close: format!("</{name}>").into_bytes(),
        }
    }

    fn find(&self, data: &[u8]) -> Boundary {
        let Some(close_at) = memmem::find(data, &self.close) else {
            return Boundary::Incomplete;
        };
        let end = close_at + self.close.len();
        let start = match memmem::find(&data[..close_at], &self.open) {
            Some(start) => start,
            None => {
                warn!(
                    tag = %String::from_utf8_lossy(&self.close),
                    "closing tag without opening tag; keeping the whole prefix"
                );
                0
            }
        };
        Boundary::Found {
            start,
            end,
            resume: end,
        }
    }
}

/// Extracts one record at a time from a [`StreamBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryScanner {
    Tagged(TagScanner),
    Json(JsonSeparators),
}

impl BoundaryScanner {
    pub fn tagged(name: &str) -> Self {
        Self::Tagged(TagScanner::new(name))
    }

    pub fn json(separators: JsonSeparators) -> Self {
        Self::Json(separators)
    }

    /// Locates the next record in `data` without consuming anything.
    ///
    /// `first_record` matters only for JSON, where the array envelope precedes the first
    /// element and must be skipped.
    pub fn find(&self, data: &[u8], first_record: bool) -> Boundary {
        match self {
            Self::Tagged(tags) => tags.find(data),
            Self::Json(separators) => find_json(separators, data, first_record),
        }
    }

    /// Removes the next complete record from `buffer`, or leaves it untouched and returns
    /// `None` when the record is not complete yet.
    pub fn extract(&self, buffer: &mut StreamBuffer, first_record: bool) -> Option<Record> {
        match self.find(buffer.unconsumed(), first_record) {
            Boundary::Found { start, end, resume } => {
                let record = Record::from_bytes(buffer.take(start..end, resume));
                if record.was_lossy() {
                    warn!(bytes = record.len(), "replaced invalid UTF-8 in packet record");
                }
                Some(record)
            }
            Boundary::Incomplete => None,
        }
    }
}

fn find_json(separators: &JsonSeparators, data: &[u8], first_record: bool) -> Boundary {
    let start = if first_record {
        match memchr::memchr(b'{', data) {
            Some(start) => start,
            None => return Boundary::Incomplete,
        }
    } else {
        0
    };

    let haystack = &data[start..];
    let (hit, separator) = match memmem::find(haystack, &separators.packet) {
        Some(hit) => (hit, &separators.packet),
        None => match memmem::find(haystack, &separators.end_of_array) {
            Some(hit) => (hit, &separators.end_of_array),
            None => return Boundary::Incomplete,
        },
    };

    let end = start + hit + separator.len() - separators.strip;
    Boundary::Found {
        start,
        end,
        resume: end + 1,
    }
}
