//! Day-boundary behavior in the archival zone.

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use common::{FakeClock, JUNE_1, SECOND};
use tapeline::archive::writer::WriteFrame;
use tapeline::archive::{ArchiveWriter, Manifest, WriterConfig};
use tapeline::config::RotationConfig;
use tapeline::frame::Kind;

const DAY: u64 = 24 * 3600 * SECOND;

fn trade<'a>(seq: u64, ts_ns: u64) -> WriteFrame<'a> {
    WriteFrame {
        subject: "test.sim.json.trade.MKT-A",
        kind: Kind::Trade,
        instrument: "MKT-A",
        ts_ns,
        stream_seq: seq,
        payload: br#"{"px":52}"#,
    }
}

#[test]
fn frames_cross_midnight_into_a_new_date_directory() {
    let dir = TempDir::new().unwrap();
    // Start ten seconds before midnight UTC.
    let start = JUNE_1 + DAY - 10 * SECOND;
    let clock = Arc::new(FakeClock::at(start));
    let mut writer = ArchiveWriter::open(
        WriterConfig {
            root: dir.path().to_path_buf(),
            feed: "sim".into(),
            rotation: RotationConfig::default(),
            pause_free_bytes: 0,
        },
        Arc::clone(&clock),
    )
    .unwrap();
    assert_eq!(writer.date(), "2024-06-01");

    // Steady frames across the boundary; the capture timestamp decides the
    // directory, down to the nanosecond.
    let midnight = JUNE_1 + DAY;
    let mut seq = 0;
    for ts in [
        midnight - 2 * SECOND,
        midnight - SECOND,
        midnight - 1, // last nanosecond of June 1st
        midnight,     // first of June 2nd
        midnight + 1,
        midnight + SECOND,
    ] {
        clock.set(ts);
        seq += 1;
        writer.append(&trade(seq, ts)).unwrap();
    }
    assert_eq!(writer.date(), "2024-06-02");
    writer.close().unwrap();

    let june1 = dir.path().join("sim/2024-06-01");
    let june2 = dir.path().join("sim/2024-06-02");
    assert!(june1.join("manifest.json").exists());
    assert!(june2.join("manifest.json").exists());

    // The prior date finalized at rollover with exactly the pre-midnight
    // rows; no segment under the new date predates the boundary.
    let first = Manifest::load(&june1.join("manifest.json")).unwrap();
    assert!(first.finalized);
    assert!(!first.has_gaps);
    assert_eq!(first.totals.rows_by_kind["trade"], 3);
    assert_eq!(first.segments.len(), 1);
    assert_eq!(first.segments[0].sequence_max, 3);

    let second = Manifest::load(&june2.join("manifest.json")).unwrap();
    assert!(second.finalized, "finalized by shutdown");
    assert_eq!(second.totals.rows_by_kind["trade"], 3);
    assert_eq!(second.segments[0].sequence_min, 4);
    // Cursor carried across the boundary: no spurious gap on June 2nd.
    assert!(!second.has_gaps);
    assert_eq!(second.last_sequence, 6);
}

#[test]
fn offset_zone_rolls_on_its_own_midnight() {
    let dir = TempDir::new().unwrap();
    // Zone is UTC+1: local midnight is 23:00 UTC.
    let utc_2300 = JUNE_1 + 23 * 3600 * SECOND;
    let clock = Arc::new(FakeClock::at(utc_2300 - SECOND));
    let mut writer = ArchiveWriter::open(
        WriterConfig {
            root: dir.path().to_path_buf(),
            feed: "sim".into(),
            rotation: RotationConfig {
                utc_offset_mins: 60,
                ..RotationConfig::default()
            },
            pause_free_bytes: 0,
        },
        Arc::clone(&clock),
    )
    .unwrap();
    assert_eq!(writer.date(), "2024-06-01");

    writer.append(&trade(1, utc_2300 - SECOND)).unwrap();
    clock.set(utc_2300);
    writer.append(&trade(2, utc_2300)).unwrap();
    assert_eq!(writer.date(), "2024-06-02");
    writer.close().unwrap();

    assert!(dir.path().join("sim/2024-06-01/manifest.json").exists());
    assert!(dir.path().join("sim/2024-06-02/manifest.json").exists());
}
