//! Segment writing, manifest maintenance, and crash recovery.

pub mod layout;
pub mod manifest;
pub mod record;
pub mod segment;
pub mod writer;

pub use layout::ArchiveLayout;
pub use manifest::{GapEntry, Manifest, SegmentEntry};
pub use record::ArchiveRecord;
pub use writer::{Appended, ArchiveWriter, WriterConfig};
