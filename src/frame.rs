//! The in-memory unit handed from adapter to publisher.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::intern::{Interner, Token};

/// Message classification. This is the adapter's only decode output besides
/// the routing instrument key; the payload bytes pass through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Trade,
    Ticker,
    Orderbook,
    Lifecycle,
    Unknown,
}

impl Kind {
    pub const ALL: [Kind; 5] = [
        Kind::Trade,
        Kind::Ticker,
        Kind::Orderbook,
        Kind::Lifecycle,
        Kind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Trade => "trade",
            Kind::Ticker => "ticker",
            Kind::Orderbook => "orderbook",
            Kind::Lifecycle => "lifecycle",
            Kind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Kind {
        match s {
            "trade" => Kind::Trade,
            "ticker" => Kind::Ticker,
            "orderbook" => Kind::Orderbook,
            "lifecycle" => Kind::Lifecycle,
            _ => Kind::Unknown,
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured exchange message.
///
/// Owned by the adapter until pushed into the ring; by the ring until
/// drained; released after publish. The payload `Vec` moves through the
/// whole pipeline without being copied.
#[derive(Debug)]
pub struct Frame {
    /// Full bus routing key, interned once per (instrument, kind).
    pub subject: &'static str,
    pub kind: Kind,
    pub instrument: Token,
    /// Capture timestamp, nanoseconds since the UNIX epoch.
    pub ts_ns: u64,
    /// Per-connector sequence, strictly monotonic per session.
    pub seq: u64,
    /// Original exchange bytes (one logical update; batched exchange frames
    /// are expanded upstream).
    pub payload: Vec<u8>,
}

/// Builds and memoizes full bus subjects `{env}.{feed}.json.{kind}.{instrument}`.
///
/// One cache per adapter session. After the instrument set is warm, subject
/// lookup is a small hash probe and framing allocates nothing.
pub struct SubjectCache {
    prefix: String,
    memo: HashMap<(Token, Kind), &'static str>,
}

impl SubjectCache {
    pub fn new(env: &str, feed: &str) -> Self {
        Self {
            prefix: format!("{env}.{feed}.json"),
            memo: HashMap::new(),
        }
    }

    /// Interns `instrument` and returns `(token, subject)` for the pair.
    pub fn subject(
        &mut self,
        interner: &Interner,
        instrument: &str,
        kind: Kind,
    ) -> Result<(Token, &'static str)> {
        let token = interner.intern(instrument)?;
        if let Some(subject) = self.memo.get(&(token, kind)) {
            return Ok((token, subject));
        }
        let name = interner.resolve(token);
        let subject: &'static str =
            Box::leak(format!("{}.{}.{}", self.prefix, kind.as_str(), name).into_boxed_str());
        self.memo.insert((token, kind), subject);
        Ok((token, subject))
    }
}
