//! On-disk archive layout.
//!
//! ```text
//! {root}/{feed}/{YYYY-MM-DD}/{kind}_{HHMMSS}_{idx}.jsonl.gz
//! {root}/{feed}/{YYYY-MM-DD}/manifest.json
//! ```
//!
//! Open segments carry a `.partial` suffix; the rename to the final name is
//! the seal and the only synchronization point between the writer and the
//! uploader. The filename encodes the open timestamp and a per-(date, kind)
//! rotation index, so names never collide within a feed/date prefix.

use std::fmt;
use std::path::{Path, PathBuf};

use time::{Duration as TimeDuration, OffsetDateTime, UtcOffset};

use crate::frame::Kind;

pub const PARTIAL_SUFFIX: &str = ".partial";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const SEGMENT_SUFFIX: &str = ".jsonl.gz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    EmptyComponent { field: &'static str },
    InvalidComponent { field: &'static str, value: String },
    TimestampOutOfRange(u64),
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::EmptyComponent { field } => {
                write!(f, "empty path component: {field}")
            }
            LayoutError::InvalidComponent { field, value } => {
                write!(f, "invalid path component for {field}: {value}")
            }
            LayoutError::TimestampOutOfRange(ts) => {
                write!(f, "timestamp out of range: {ts}")
            }
        }
    }
}

impl std::error::Error for LayoutError {}

type Result<T> = std::result::Result<T, LayoutError>;

fn validate_component(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(LayoutError::EmptyComponent { field });
    }
    if value.contains('/') || value.contains("..") || value.contains('\0') {
        return Err(LayoutError::InvalidComponent {
            field,
            value: value.to_owned(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    root: PathBuf,
    offset: UtcOffset,
}

impl ArchiveLayout {
    pub fn new(root: impl Into<PathBuf>, utc_offset_mins: i32) -> Self {
        Self {
            root: root.into(),
            offset: UtcOffset::from_whole_seconds(utc_offset_mins * 60)
                .unwrap_or(UtcOffset::UTC),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn local(&self, ts_ns: u64) -> Result<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(ts_ns as i128)
            .map(|dt| dt.to_offset(self.offset))
            .map_err(|_| LayoutError::TimestampOutOfRange(ts_ns))
    }

    /// Archival date (`YYYY-MM-DD`) for a capture timestamp.
    pub fn date_for(&self, ts_ns: u64) -> Result<String> {
        let dt = self.local(ts_ns)?;
        let date = dt.date();
        Ok(format!(
            "{:04}-{:02}-{:02}",
            date.year(),
            date.month() as u8,
            date.day()
        ))
    }

    /// `HHMMSS` in the archival zone, for segment names.
    pub fn clock_time_for(&self, ts_ns: u64) -> Result<String> {
        let dt = self.local(ts_ns)?;
        Ok(format!(
            "{:02}{:02}{:02}",
            dt.hour(),
            dt.minute(),
            dt.second()
        ))
    }

    /// End of the archival day containing `ts_ns`, as nanoseconds since the
    /// epoch. A frame stamped one nanosecond past this belongs to the next
    /// date directory.
    pub fn day_end_ns(&self, ts_ns: u64) -> Result<u64> {
        let dt = self.local(ts_ns)?;
        let next_midnight = dt
            .date()
            .midnight()
            .assume_offset(self.offset)
            .checked_add(TimeDuration::days(1))
            .ok_or(LayoutError::TimestampOutOfRange(ts_ns))?;
        Ok(next_midnight.unix_timestamp_nanos() as u64)
    }

    pub fn feed_dir(&self, feed: &str) -> Result<PathBuf> {
        validate_component("feed", feed)?;
        Ok(self.root.join(feed))
    }

    pub fn date_dir(&self, feed: &str, date: &str) -> Result<PathBuf> {
        validate_component("date", date)?;
        Ok(self.feed_dir(feed)?.join(date))
    }

    pub fn manifest_path(&self, feed: &str, date: &str) -> Result<PathBuf> {
        Ok(self.date_dir(feed, date)?.join(MANIFEST_FILE))
    }

    pub fn segment_name(kind: Kind, hhmmss: &str, idx: u32) -> String {
        format!("{}_{hhmmss}_{idx:04}{SEGMENT_SUFFIX}", kind.as_str())
    }

    pub fn segment_path(&self, feed: &str, date: &str, name: &str) -> Result<PathBuf> {
        validate_component("segment", name)?;
        Ok(self.date_dir(feed, date)?.join(name))
    }

    pub fn partial_path(&self, feed: &str, date: &str, name: &str) -> Result<PathBuf> {
        Ok(self
            .segment_path(feed, date, name)?
            .with_file_name(format!("{name}{PARTIAL_SUFFIX}")))
    }
}

/// Parses `{kind}_{HHMMSS}_{idx}.jsonl.gz` back into its parts. Returns
/// `None` for anything else in the directory (manifest, temp files).
pub fn parse_segment_name(name: &str) -> Option<(Kind, String, u32)> {
    let stem = name.strip_suffix(SEGMENT_SUFFIX)?;
    let mut parts = stem.rsplitn(3, '_');
    let idx: u32 = parts.next()?.parse().ok()?;
    let hhmmss = parts.next()?.to_owned();
    let kind_str = parts.next()?;
    if hhmmss.len() != 6 || !hhmmss.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((Kind::parse(kind_str), hhmmss, idx))
}
