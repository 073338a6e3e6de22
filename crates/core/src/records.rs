//! Shared data model for archive records.
//!
//! Everything here is produced by the client crate (index responses,
//! decoded container members) and stored by the cache tiers, so the
//! types are plain data: serializable, cloneable, and immutable once
//! built.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exact byte range of one record inside an immutable container file.
///
/// Immutable once produced by the index client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    /// Container file identifier, e.g. a path under the archive bucket.
    pub container_id: String,
    /// Byte offset of the record's compressed member.
    pub offset: u64,
    /// Length of the compressed member in bytes.
    pub length: u64,
}

impl Locator {
    pub fn new(container_id: impl Into<String>, offset: u64, length: u64) -> Self {
        Self { container_id: container_id.into(), offset, length }
    }

    /// Inclusive end offset, as used in an HTTP Range header.
    pub fn end_inclusive(&self) -> u64 {
        self.offset + self.length.saturating_sub(1)
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}+{}", self.container_id, self.offset, self.length)
    }
}

/// One named, immutable point-in-time collection of archived pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Snapshot identifier, e.g. `CC-MAIN-2024-10`.
    pub id: String,
    /// Human-readable snapshot name.
    pub name: String,
    /// Approximate snapshot date, derived from the identifier.
    pub date: DateTime<Utc>,
    /// Fields the index service returned that we don't model.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One entry from the archive index, pointing at a container record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    pub url: String,
    pub capture_timestamp: DateTime<Utc>,
    /// HTTP status at capture time; absent for e.g. revisit entries.
    pub status_code: Option<u16>,
    pub mime_type: String,
    /// Content digest reported by the index, for downstream dedup.
    pub digest: Option<String>,
    pub locator: Locator,
    /// Unmodeled index fields, preserved for forward compatibility.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Container record type, from the record's type header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Info,
    Request,
    Response,
    Metadata,
}

impl RecordType {
    /// Map a wire-format type string. Unknown types normalize to
    /// `Metadata`; the verbatim value stays readable from the record's
    /// header list.
    pub fn from_wire(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "warcinfo" | "info" => RecordType::Info,
            "request" => RecordType::Request,
            "response" => RecordType::Response,
            _ => RecordType::Metadata,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Info => "info",
            RecordType::Request => "request",
            RecordType::Response => "response",
            RecordType::Metadata => "metadata",
        }
    }
}

/// One self-contained unit (headers + payload) decoded from a container
/// member. Never partially constructed: decoding yields a complete
/// record or reports a decode error for that member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub record_type: RecordType,
    /// Header fields in wire order.
    pub headers: Vec<(String, String)>,
    pub payload: Bytes,
    pub payload_length: u64,
}

impl ContainerRecord {
    /// Case-insensitive header lookup, first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The archived URL this record describes, if any.
    pub fn target_uri(&self) -> Option<&str> {
        self.header("WARC-Target-URI")
    }

    /// Capture date from the record headers.
    pub fn warc_date(&self) -> Option<DateTime<Utc>> {
        self.header("WARC-Date")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }
}

/// Snapshot of the governor's rolling admission window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateBudget {
    pub requests_in_window: u64,
    pub bytes_in_window: u64,
    pub window_start: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_display() {
        let loc = Locator::new("crawl-data/seg/warc/c1.warc.gz", 1000, 500);
        assert_eq!(loc.to_string(), "crawl-data/seg/warc/c1.warc.gz@1000+500");
        assert_eq!(loc.end_inclusive(), 1499);
    }

    #[test]
    fn test_record_type_from_wire() {
        assert_eq!(RecordType::from_wire("warcinfo"), RecordType::Info);
        assert_eq!(RecordType::from_wire("Response"), RecordType::Response);
        assert_eq!(RecordType::from_wire("request"), RecordType::Request);
        assert_eq!(RecordType::from_wire("metadata"), RecordType::Metadata);
        assert_eq!(RecordType::from_wire("conversion"), RecordType::Metadata);
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let record = ContainerRecord {
            record_type: RecordType::Response,
            headers: vec![
                ("WARC-Target-URI".to_string(), "http://example.com/".to_string()),
                ("Content-Type".to_string(), "application/http".to_string()),
            ],
            payload: Bytes::from_static(b"hello"),
            payload_length: 5,
        };
        assert_eq!(record.header("warc-target-uri"), Some("http://example.com/"));
        assert_eq!(record.target_uri(), Some("http://example.com/"));
        assert_eq!(record.content_type(), Some("application/http"));
        assert_eq!(record.header("X-Missing"), None);
    }

    #[test]
    fn test_container_record_roundtrip() {
        let record = ContainerRecord {
            record_type: RecordType::Info,
            headers: vec![("WARC-Date".to_string(), "2024-02-10T12:34:56Z".to_string())],
            payload: Bytes::from_static(&[0u8, 1, 2, 3]),
            payload_length: 4,
        };
        let json = serde_json::to_vec(&record).unwrap();
        let back: ContainerRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.record_type, RecordType::Info);
        assert_eq!(back.payload, record.payload);
        assert!(back.warc_date().is_some());
    }
}
