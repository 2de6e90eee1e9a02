//! Sequence-gap accounting in the manifest.

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use common::{FakeClock, JUNE_1};
use tapeline::archive::writer::WriteFrame;
use tapeline::archive::{Appended, ArchiveWriter, Manifest, WriterConfig};
use tapeline::config::RotationConfig;
use tapeline::frame::Kind;

fn trade<'a>(seq: u64) -> WriteFrame<'a> {
    WriteFrame {
        subject: "test.sim.json.trade.MKT-A",
        kind: Kind::Trade,
        instrument: "MKT-A",
        ts_ns: JUNE_1 + seq,
        stream_seq: seq,
        payload: br#"{"px":52}"#,
    }
}

fn open(dir: &TempDir, clock: &Arc<FakeClock>) -> ArchiveWriter<FakeClock> {
    ArchiveWriter::open(
        WriterConfig {
            root: dir.path().to_path_buf(),
            feed: "sim".into(),
            rotation: RotationConfig::default(),
            pause_free_bytes: 0,
        },
        Arc::clone(clock),
    )
    .unwrap()
}

#[test]
fn missing_sequences_produce_one_gap_entry_with_exact_range() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FakeClock::at(JUNE_1));
    let mut writer = open(&dir, &clock);

    for seq in [1u64, 2, 3] {
        assert_eq!(writer.append(&trade(seq)).unwrap(), Appended::Written);
    }
    // Retention dropped 4..=6 before we consumed them.
    assert_eq!(writer.append(&trade(7)).unwrap(), Appended::Written);
    writer.append(&trade(8)).unwrap();
    writer.close().unwrap();

    let manifest = Manifest::load(&dir.path().join("sim/2024-06-01/manifest.json")).unwrap();
    assert!(manifest.has_gaps);
    assert_eq!(manifest.gaps.len(), 1);
    assert_eq!(manifest.gaps[0].after_seq, 3);
    assert_eq!(manifest.gaps[0].missing_count, 3);
    assert!(!manifest.gaps[0].detected_at.is_empty());
    // The writer kept running; all consumed rows archived.
    assert_eq!(manifest.totals.rows_by_kind["trade"], 5);
}

#[test]
fn duplicates_are_dropped_without_gap_noise() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FakeClock::at(JUNE_1));
    let mut writer = open(&dir, &clock);

    writer.append(&trade(1)).unwrap();
    writer.append(&trade(2)).unwrap();
    // Bus redelivery.
    assert_eq!(writer.append(&trade(2)).unwrap(), Appended::Duplicate);
    assert_eq!(writer.append(&trade(1)).unwrap(), Appended::Duplicate);
    writer.append(&trade(3)).unwrap();
    writer.close().unwrap();

    let manifest = Manifest::load(&dir.path().join("sim/2024-06-01/manifest.json")).unwrap();
    assert!(!manifest.has_gaps);
    assert_eq!(manifest.totals.rows_by_kind["trade"], 3);
    assert_eq!(manifest.last_sequence, 3);
}

#[test]
fn first_sequence_after_cold_start_is_not_a_gap() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FakeClock::at(JUNE_1));
    let mut writer = open(&dir, &clock);

    // A fresh consumer may start mid-stream; that is a cursor baseline, not
    // a gap.
    writer.append(&trade(500)).unwrap();
    writer.append(&trade(501)).unwrap();
    writer.close().unwrap();

    let manifest = Manifest::load(&dir.path().join("sim/2024-06-01/manifest.json")).unwrap();
    assert!(!manifest.has_gaps);
    assert_eq!(manifest.last_sequence, 501);
}

#[test]
fn gap_spanning_restart_is_detected() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FakeClock::at(JUNE_1));

    let mut writer = open(&dir, &clock);
    writer.append(&trade(1)).unwrap();
    writer.append(&trade(2)).unwrap();
    writer.close().unwrap();

    // While the archiver was down, retention aged out 3..=9.
    let mut writer = open(&dir, &clock);
    writer.append(&trade(10)).unwrap();
    writer.close().unwrap();

    let manifest = Manifest::load(&dir.path().join("sim/2024-06-01/manifest.json")).unwrap();
    assert!(manifest.has_gaps);
    assert_eq!(manifest.gaps[0].after_seq, 2);
    assert_eq!(manifest.gaps[0].missing_count, 7);
}
