//! Index service response types and normalization.
//!
//! The index answers with newline-delimited JSON objects whose values
//! are all strings. Required and optional fields are explicit here;
//! anything else the service sends is preserved in an open side-map so
//! new remote fields don't require a schema change.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;

use warchive_core::records::{IndexRecord, Locator, SnapshotInfo};

/// One raw line from an index query response.
#[derive(Debug, Deserialize)]
pub struct RawIndexLine {
    pub url: String,
    /// Capture timestamp in `YYYYMMDDhhmmss` form.
    pub timestamp: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    pub length: String,
    pub offset: String,
    pub filename: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RawIndexLine {
    /// Convert a raw index line into the normalized record form.
    pub fn normalize(self) -> Result<IndexRecord, String> {
        let offset: u64 = self.offset.parse().map_err(|_| format!("bad offset {:?}", self.offset))?;
        let length: u64 = self.length.parse().map_err(|_| format!("bad length {:?}", self.length))?;

        let capture_timestamp = parse_capture_timestamp(&self.timestamp)
            .ok_or_else(|| format!("bad timestamp {:?}", self.timestamp))?;

        // non-numeric status (e.g. "-" on revisit entries) maps to None
        let status_code = self.status.as_deref().and_then(|s| s.parse().ok());

        Ok(IndexRecord {
            url: self.url,
            capture_timestamp,
            status_code,
            mime_type: self.mime.unwrap_or_else(|| "unk".to_string()),
            digest: self.digest,
            locator: Locator { container_id: self.filename, offset, length },
            extra: self.extra,
        })
    }
}

/// One entry from the snapshot collection listing.
#[derive(Debug, Deserialize)]
pub struct RawCollection {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl From<RawCollection> for SnapshotInfo {
    fn from(raw: RawCollection) -> Self {
        let date = parse_snapshot_date(&raw.id).unwrap_or_else(Utc::now);
        SnapshotInfo {
            name: raw.name.unwrap_or_else(|| raw.id.clone()),
            id: raw.id,
            date,
            extra: raw.extra,
        }
    }
}

/// Parse an index capture timestamp (`YYYYMMDDhhmmss`).
pub fn parse_capture_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Approximate a snapshot date from an id like `CC-MAIN-2024-10`
/// (year and ISO week number).
pub fn parse_snapshot_date(id: &str) -> Option<DateTime<Utc>> {
    let mut parts = id.split('-').filter_map(|p| p.parse::<u32>().ok());
    let year = parts.next()?;
    let week = parts.next().unwrap_or(1).clamp(1, 53);

    let jan1 = NaiveDate::from_ymd_opt(year as i32, 1, 1)?;
    let date = jan1 + chrono::Duration::weeks(i64::from(week) - 1);
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}
