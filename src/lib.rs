//! Market-data capture and archival pipeline.
//!
//! Two long-lived processes share this crate:
//!
//! - `tapeline-connector` holds authenticated WebSocket sessions to an
//!   exchange, stamps every received frame with a monotonic capture
//!   timestamp and a per-connector sequence, and publishes it to a durable
//!   JetStream bus through a lock-free SPSC ring.
//! - `tapeline-archiver` consumes the bus, writes rotated gzip JSONL
//!   segments with a per-(feed, date) manifest, and uploads sealed segments
//!   to object storage.
//!
//! The ring buffer is the only shared memory between the socket reader and
//! the bus drainer; local storage is shared between the segment writer and
//! the uploader with the `.partial` -> final rename as the synchronization
//! point.

pub mod clock;
pub mod config;
pub mod error;
pub mod frame;
pub mod intern;
pub mod ring;
pub mod submgr;

#[cfg(feature = "bus")]
pub mod bus;

#[cfg(feature = "connector")]
pub mod feed;

#[cfg(feature = "archiver")]
pub mod archive;
#[cfg(feature = "archiver")]
pub mod upload;

#[cfg(feature = "admin")]
pub mod admin;

pub use clock::{Clock, SystemClock, TscClock};
pub use error::{Error, Result};
pub use frame::{Frame, Kind, SubjectCache};
pub use intern::{Interner, Token};
pub use ring::{ring, Consumer, Producer, RingStats};
