//! The per-line JSON envelope.
//!
//! One line per bus message: capture timestamp, bus sequence, subject, kind,
//! instrument, and the original exchange payload embedded as-is (not escaped
//! into a string), so archives stay bit-exact while carrying enough metadata
//! to reconstruct ordering and coverage.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::frame::Kind;

/// Borrowed form used on the write path.
#[derive(Serialize)]
pub struct ArchiveRecord<'a> {
    pub ts_ns: u64,
    pub seq: u64,
    pub subject: &'a str,
    pub kind: Kind,
    pub instrument: &'a str,
    pub payload: &'a RawValue,
}

/// Owned form used by recovery scans and readers.
#[derive(Deserialize)]
pub struct OwnedArchiveRecord {
    pub ts_ns: u64,
    pub seq: u64,
    pub subject: String,
    pub kind: Kind,
    pub instrument: String,
    pub payload: Box<RawValue>,
}

impl<'a> ArchiveRecord<'a> {
    /// Serializes to one newline-terminated JSON line. Fails when the
    /// payload is not valid JSON; the writer counts those and skips them.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}
