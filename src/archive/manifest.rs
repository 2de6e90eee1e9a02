//! The per-(feed, date) manifest.
//!
//! Append-updated on every segment close and finalized at day end. The
//! write is atomic: serialize to a sibling temp file, fsync, rename over
//! `manifest.json`, fsync the directory. An entry exists if and only if its
//! segment has been fully flushed and renamed; entries are never added
//! speculatively.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Result};

use super::segment::SealedSegment;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentEntry {
    pub name: String,
    pub kind: String,
    pub opened_at: String,
    pub closed_at: String,
    pub row_count: u64,
    pub bytes_compressed: u64,
    pub bytes_uncompressed: u64,
    pub sequence_min: u64,
    pub sequence_max: u64,
    pub sha256: String,
    /// Error flag for segments closed abnormally or repaired by recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Totals {
    pub rows_by_kind: BTreeMap<String, u64>,
    pub bytes_total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapEntry {
    pub after_seq: u64,
    pub missing_count: u64,
    pub detected_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub feed: String,
    pub date: String,
    pub segments: Vec<SegmentEntry>,
    pub totals: Totals,
    pub gaps: Vec<GapEntry>,
    pub has_gaps: bool,
    /// Highest bus sequence this consumer has archived, the gap-detection
    /// cursor persisted alongside the segment inventory.
    #[serde(default)]
    pub last_sequence: u64,
    /// Set at day end or shutdown; no further segments join this manifest.
    #[serde(default)]
    pub finalized: bool,
}

/// `2024-06-01T12:00:05.123456789Z`, always UTC.
pub fn format_iso_ns(ts_ns: u64) -> String {
    match OffsetDateTime::from_unix_timestamp_nanos(ts_ns as i128) {
        Ok(dt) => format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}Z",
            dt.year(),
            dt.month() as u8,
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second(),
            dt.nanosecond()
        ),
        Err(_) => format!("invalid:{ts_ns}"),
    }
}

impl Manifest {
    pub fn new(feed: &str, date: &str) -> Self {
        Self {
            feed: feed.to_owned(),
            date: date.to_owned(),
            segments: Vec::new(),
            totals: Totals::default(),
            gaps: Vec::new(),
            has_gaps: false,
            last_sequence: 0,
            finalized: false,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|_| Error::Corrupt("manifest does not parse"))
    }

    pub fn load_or_new(path: &Path, feed: &str, date: &str) -> Self {
        match Self::load(path) {
            Ok(manifest) => manifest,
            Err(_) => Self::new(feed, date),
        }
    }

    /// Adds a sealed segment and folds it into the totals.
    pub fn record_segment(&mut self, sealed: &SealedSegment) {
        let entry = SegmentEntry {
            name: sealed.name.clone(),
            kind: sealed.kind.as_str().to_owned(),
            opened_at: format_iso_ns(sealed.opened_at_ns),
            closed_at: format_iso_ns(sealed.closed_at_ns),
            row_count: sealed.rows,
            bytes_compressed: sealed.bytes_compressed,
            bytes_uncompressed: sealed.bytes_uncompressed,
            sequence_min: sealed.seq_min,
            sequence_max: sealed.seq_max,
            sha256: sealed.sha256.clone(),
            error: sealed.error.clone(),
        };
        *self
            .totals
            .rows_by_kind
            .entry(entry.kind.clone())
            .or_default() += entry.row_count;
        self.totals.bytes_total += entry.bytes_compressed;
        self.segments.push(entry);
    }

    /// Records a sequence gap. Gaps never stop the writer; they are
    /// data-quality signals for downstream.
    pub fn record_gap(&mut self, after_seq: u64, missing_count: u64, detected_at_ns: u64) {
        self.gaps.push(GapEntry {
            after_seq,
            missing_count,
            detected_at: format_iso_ns(detected_at_ns),
        });
        self.has_gaps = true;
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// True when an entry with this segment name already exists (recovery
    /// cross-check).
    pub fn contains_segment(&self, name: &str) -> bool {
        self.segments.iter().any(|entry| entry.name == name)
    }

    /// Recomputes totals from the entries, for recovery repair.
    pub fn recompute_totals(&mut self) {
        let mut totals = Totals::default();
        for entry in &self.segments {
            *totals.rows_by_kind.entry(entry.kind.clone()).or_default() += entry.row_count;
            totals.bytes_total += entry.bytes_compressed;
        }
        self.totals = totals;
    }

    /// Atomic write: temp file, fsync, rename, directory fsync.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or(Error::Corrupt("manifest path has no parent"))?;
        std::fs::create_dir_all(parent)?;

        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(self)
            .map_err(|_| Error::Corrupt("manifest does not serialize"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, path)?;
        File::open(parent)?.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Kind;
    use tempfile::TempDir;

    fn sealed(name: &str, kind: Kind, rows: u64, seq_min: u64, seq_max: u64) -> SealedSegment {
        SealedSegment {
            name: name.to_owned(),
            kind,
            opened_at_ns: 1_000,
            closed_at_ns: 2_000,
            rows,
            bytes_compressed: 100,
            bytes_uncompressed: 400,
            seq_min,
            seq_max,
            sha256: "ab".repeat(32),
            error: None,
        }
    }

    #[test]
    fn totals_accumulate_by_kind() {
        let mut manifest = Manifest::new("kalshi", "2024-06-01");
        manifest.record_segment(&sealed("trade_120000_0000.jsonl.gz", Kind::Trade, 10, 1, 10));
        manifest.record_segment(&sealed("trade_120500_0001.jsonl.gz", Kind::Trade, 5, 11, 15));
        manifest.record_segment(&sealed("ticker_120000_0000.jsonl.gz", Kind::Ticker, 7, 2, 14));

        assert_eq!(manifest.totals.rows_by_kind["trade"], 15);
        assert_eq!(manifest.totals.rows_by_kind["ticker"], 7);
        assert_eq!(manifest.totals.bytes_total, 300);
        assert!(!manifest.has_gaps);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");

        let mut manifest = Manifest::new("kalshi", "2024-06-01");
        manifest.record_segment(&sealed("trade_120000_0000.jsonl.gz", Kind::Trade, 10, 1, 10));
        manifest.record_gap(10, 3, 3_000);
        manifest.last_sequence = 14;
        manifest.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded.feed, "kalshi");
        assert_eq!(loaded.segments.len(), 1);
        assert_eq!(loaded.gaps.len(), 1);
        assert_eq!(loaded.gaps[0].after_seq, 10);
        assert_eq!(loaded.gaps[0].missing_count, 3);
        assert!(loaded.has_gaps);
        assert_eq!(loaded.last_sequence, 14);
        assert!(!loaded.finalized);
    }

    #[test]
    fn iso_formatting() {
        // 2024-06-01T00:00:00Z plus 1.5ms.
        assert_eq!(
            format_iso_ns(1_717_200_000_000_000_000 + 1_500_000),
            "2024-06-01T00:00:00.001500000Z"
        );
    }

    #[test]
    fn recompute_totals_matches_incremental() {
        let mut manifest = Manifest::new("kalshi", "2024-06-01");
        manifest.record_segment(&sealed("trade_120000_0000.jsonl.gz", Kind::Trade, 10, 1, 10));
        manifest.record_segment(&sealed("ticker_120000_0000.jsonl.gz", Kind::Ticker, 4, 11, 14));
        let incremental = manifest.totals.clone();
        manifest.recompute_totals();
        assert_eq!(manifest.totals.rows_by_kind, incremental.rows_by_kind);
        assert_eq!(manifest.totals.bytes_total, incremental.bytes_total);
    }
}
