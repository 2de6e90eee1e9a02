//! Rotation, manifest agreement, and archive round-trips.

mod common;

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use tempfile::TempDir;

use common::{FakeClock, JUNE_1, SECOND};
use tapeline::archive::writer::WriteFrame;
use tapeline::archive::{ArchiveWriter, Manifest, WriterConfig};
use tapeline::config::RotationConfig;
use tapeline::frame::Kind;

fn writer_config(root: &TempDir, rotation: RotationConfig) -> WriterConfig {
    WriterConfig {
        root: root.path().to_path_buf(),
        feed: "sim".into(),
        rotation,
        pause_free_bytes: 0,
    }
}

fn frame<'a>(kind: Kind, seq: u64, ts_ns: u64, payload: &'a [u8]) -> WriteFrame<'a> {
    WriteFrame {
        subject: match kind {
            Kind::Trade => "test.sim.json.trade.MKT-A",
            _ => "test.sim.json.ticker.MKT-A",
        },
        kind,
        instrument: "MKT-A",
        ts_ns,
        stream_seq: seq,
        payload,
    }
}

fn read_rows(path: &std::path::Path) -> Vec<serde_json::Value> {
    let file = std::fs::File::open(path).unwrap();
    BufReader::new(MultiGzDecoder::new(file))
        .lines()
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
        .collect()
}

#[test]
fn interval_rotation_produces_segments_and_matching_manifest() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FakeClock::at(JUNE_1));
    let mut writer = ArchiveWriter::open(
        writer_config(
            &dir,
            RotationConfig {
                interval_secs: 5,
                ..RotationConfig::default()
            },
        ),
        Arc::clone(&clock),
    )
    .unwrap();

    // Ten seconds of trades and tickers with a 5-second rotation interval:
    // two segments per kind.
    let mut seq = 0;
    for tenth in 0..100u64 {
        let ts = JUNE_1 + tenth * SECOND / 10;
        clock.set(ts);
        seq += 1;
        writer
            .append(&frame(Kind::Trade, seq, ts, br#"{"px":52,"qty":1}"#))
            .unwrap();
        seq += 1;
        writer
            .append(&frame(Kind::Ticker, seq, ts, br#"{"bid":51,"ask":53}"#))
            .unwrap();
        writer.tick().unwrap();
    }
    writer.close().unwrap();

    let date_dir = dir.path().join("sim/2024-06-01");
    let manifest = Manifest::load(&date_dir.join("manifest.json")).unwrap();
    assert!(manifest.finalized);
    assert!(!manifest.has_gaps);
    assert_eq!(manifest.totals.rows_by_kind["trade"], 100);
    assert_eq!(manifest.totals.rows_by_kind["ticker"], 100);
    assert_eq!(manifest.last_sequence, 200);

    let trade_entries: Vec<_> = manifest
        .segments
        .iter()
        .filter(|entry| entry.kind == "trade")
        .collect();
    assert_eq!(trade_entries.len(), 2, "5s interval over 10s gives two segments");

    // Manifest entries describe real files, byte for byte.
    let mut total_bytes = 0;
    for entry in &manifest.segments {
        let path = date_dir.join(&entry.name);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, entry.bytes_compressed, "{}", entry.name);
        assert!(entry.row_count > 0);
        assert!(entry.sequence_max >= entry.sequence_min);
        total_bytes += bytes.len() as u64;
    }
    assert_eq!(manifest.totals.bytes_total, total_bytes);

    // Consecutive entries of one kind never overlap in sequence.
    for kind in ["trade", "ticker"] {
        let mut entries: Vec<_> = manifest
            .segments
            .iter()
            .filter(|entry| entry.kind == kind)
            .collect();
        entries.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        for pair in entries.windows(2) {
            assert!(pair[1].sequence_min > pair[0].sequence_max);
        }
    }

    // No partials survive a clean shutdown.
    for entry in std::fs::read_dir(&date_dir).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().into_owned();
        assert!(!name.ends_with(".partial"), "leftover partial {name}");
    }

    // Round-trip: reading every line, sorting by seq, counting by kind
    // reproduces the totals exactly.
    let mut rows: Vec<serde_json::Value> = Vec::new();
    for entry in &manifest.segments {
        rows.extend(read_rows(&date_dir.join(&entry.name)));
    }
    rows.sort_by_key(|row| row["seq"].as_u64().unwrap());
    let mut by_kind: BTreeMap<String, u64> = BTreeMap::new();
    let mut last_seq = 0;
    for row in &rows {
        let seq = row["seq"].as_u64().unwrap();
        assert!(seq > last_seq, "duplicate or unordered seq {seq}");
        last_seq = seq;
        *by_kind
            .entry(row["kind"].as_str().unwrap().to_owned())
            .or_default() += 1;
        // The payload survives as an object, bit-exact fields included.
        assert!(row["payload"].is_object());
    }
    assert_eq!(by_kind, manifest.totals.rows_by_kind);
}

#[test]
fn size_rotation_is_upper_inclusive() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FakeClock::at(JUNE_1));
    let mut writer = ArchiveWriter::open(
        writer_config(
            &dir,
            RotationConfig {
                interval_secs: 3600,
                // Any single line exceeds this, so a segment that has
                // reached the cap closes right after the append and the
                // next line opens a fresh one.
                max_uncompressed_bytes: 10,
                ..RotationConfig::default()
            },
        ),
        Arc::clone(&clock),
    )
    .unwrap();

    for seq in 1..=3u64 {
        clock.set(JUNE_1 + seq * SECOND);
        writer
            .append(&frame(Kind::Trade, seq, JUNE_1 + seq * SECOND, br#"{"px":1}"#))
            .unwrap();
    }
    writer.close().unwrap();

    let manifest =
        Manifest::load(&dir.path().join("sim/2024-06-01/manifest.json")).unwrap();
    assert_eq!(manifest.segments.len(), 3, "one row per segment at this cap");
    for (i, entry) in manifest.segments.iter().enumerate() {
        assert_eq!(entry.row_count, 1);
        assert!(entry.name.contains(&format!("_{i:04}")), "{}", entry.name);
    }
}

#[test]
fn unarchivable_payload_is_skipped_not_fatal() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FakeClock::at(JUNE_1));
    let mut writer =
        ArchiveWriter::open(writer_config(&dir, RotationConfig::default()), Arc::clone(&clock))
            .unwrap();

    use tapeline::archive::Appended;
    assert_eq!(
        writer
            .append(&frame(Kind::Trade, 1, JUNE_1, br#"{"ok":true}"#))
            .unwrap(),
        Appended::Written
    );
    assert_eq!(
        writer
            .append(&frame(Kind::Trade, 2, JUNE_1 + 1, b"not json{"))
            .unwrap(),
        Appended::Skipped
    );
    assert_eq!(
        writer
            .append(&frame(Kind::Trade, 3, JUNE_1 + 2, br#"{"ok":true}"#))
            .unwrap(),
        Appended::Written
    );
    writer.close().unwrap();

    let manifest =
        Manifest::load(&dir.path().join("sim/2024-06-01/manifest.json")).unwrap();
    // The skip consumed sequence 2, so no gap is recorded.
    assert!(!manifest.has_gaps);
    assert_eq!(manifest.totals.rows_by_kind["trade"], 2);
    assert_eq!(manifest.last_sequence, 3);
}
