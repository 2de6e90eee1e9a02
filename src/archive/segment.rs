//! One open gzip JSONL segment.
//!
//! The segment writes through a hashing counter, so the running SHA-256 and
//! compressed byte count always describe exactly what has reached the file.
//! Sealing finishes the gzip stream, fsyncs, and renames `.partial` to the
//! final name; the rename is atomic within the directory and is the signal
//! the uploader watches for.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::frame::Kind;

/// Counts and hashes compressed bytes on their way to the file.
struct HashingFile {
    file: File,
    hasher: Sha256,
    bytes: u64,
}

impl Write for HashingFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.file.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Statistics for a sealed segment, consumed by the manifest.
#[derive(Debug, Clone)]
pub struct SealedSegment {
    pub name: String,
    pub kind: Kind,
    pub opened_at_ns: u64,
    pub closed_at_ns: u64,
    pub rows: u64,
    pub bytes_compressed: u64,
    pub bytes_uncompressed: u64,
    pub seq_min: u64,
    pub seq_max: u64,
    pub sha256: String,
    /// Set when the segment was closed due to an I/O error; rows up to the
    /// failure are still archived.
    pub error: Option<String>,
}

pub struct OpenSegment {
    name: String,
    kind: Kind,
    partial_path: PathBuf,
    final_path: PathBuf,
    encoder: GzEncoder<HashingFile>,
    opened_at_ns: u64,
    rows: u64,
    bytes_uncompressed: u64,
    seq_min: u64,
    seq_max: u64,
}

impl OpenSegment {
    pub fn create(
        name: String,
        kind: Kind,
        partial_path: PathBuf,
        final_path: PathBuf,
        opened_at_ns: u64,
    ) -> Result<Self> {
        if let Some(parent) = partial_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&partial_path)?;
        Ok(Self {
            name,
            kind,
            partial_path,
            final_path,
            encoder: GzEncoder::new(
                HashingFile {
                    file,
                    hasher: Sha256::new(),
                    bytes: 0,
                },
                Compression::default(),
            ),
            opened_at_ns,
            rows: 0,
            bytes_uncompressed: 0,
            seq_min: u64::MAX,
            seq_max: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn opened_at_ns(&self) -> u64 {
        self.opened_at_ns
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Compressed bytes flushed to the file so far. Lags the uncompressed
    /// count by the encoder's internal buffer.
    pub fn bytes_compressed(&self) -> u64 {
        self.encoder.get_ref().bytes
    }

    pub fn bytes_uncompressed(&self) -> u64 {
        self.bytes_uncompressed
    }

    /// Appends one already-serialized line carrying bus sequence `seq`.
    pub fn append(&mut self, line: &[u8], seq: u64) -> Result<()> {
        self.encoder.write_all(line)?;
        self.rows += 1;
        self.bytes_uncompressed += line.len() as u64;
        self.seq_min = self.seq_min.min(seq);
        self.seq_max = self.seq_max.max(seq);
        Ok(())
    }

    /// Sync-flushes the gzip stream and pushes bytes to disk, so everything
    /// appended so far survives a crash (and a later recovery decode).
    /// Called before the consumer acknowledges a batch.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.encoder.flush()?;
        self.encoder.get_mut().file.sync_data()?;
        Ok(())
    }

    /// Finishes the gzip stream, fsyncs, and renames to the final name.
    pub fn seal(self, closed_at_ns: u64, error: Option<String>) -> Result<SealedSegment> {
        let rows = self.rows;
        let bytes_uncompressed = self.bytes_uncompressed;
        let seq_min = self.seq_min;
        let seq_max = self.seq_max;

        let hashing = self.encoder.finish()?;
        let bytes_compressed = hashing.bytes;
        let sha256 = hex::encode(hashing.hasher.finalize());
        hashing.file.sync_all()?;
        drop(hashing.file);

        std::fs::rename(&self.partial_path, &self.final_path)?;
        fsync_dir(&self.final_path)?;

        Ok(SealedSegment {
            name: self.name,
            kind: self.kind,
            opened_at_ns: self.opened_at_ns,
            closed_at_ns,
            rows,
            bytes_compressed,
            bytes_uncompressed,
            seq_min,
            seq_max,
            sha256,
            error,
        })
    }

    /// Abandons the segment, deleting the partial file. Used when a fresh
    /// segment fails before its first row.
    pub fn discard(self) {
        let path = self.partial_path.clone();
        drop(self);
        let _ = std::fs::remove_file(path);
    }
}

fn fsync_dir(path: &std::path::Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or(Error::Corrupt("segment path has no parent"))?;
    File::open(parent)?.sync_all()?;
    Ok(())
}
