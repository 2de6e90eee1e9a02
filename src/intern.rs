//! Process-wide string interner for hot-path identifiers.
//!
//! Instrument tickers repeat in every frame; interning them once removes the
//! per-frame allocation and turns comparisons into integer compares. The
//! table is immortal: interned strings are leaked exactly once and handed out
//! as `&'static str`.
//!
//! Reads are lock-free. The lookup map lives in an [`ArcSwap`] snapshot;
//! inserting takes a mutex, rebuilds the map, and republishes it. After the
//! first few seconds of a session the instrument set is warm and every
//! lookup hits the snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use crate::error::{Error, Result};

/// Small integer handle for an interned string.
///
/// Equal strings always map to equal tokens within a process. Tokens index
/// into the interner's table and are not meaningful across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u32);

#[derive(Clone)]
struct Snapshot {
    by_name: HashMap<&'static str, Token>,
    by_token: Vec<&'static str>,
}

pub struct Interner {
    snapshot: ArcSwap<Snapshot>,
    write: Mutex<()>,
    capacity: u32,
}

impl Interner {
    /// Creates an interner bounded to `capacity` distinct strings.
    ///
    /// The bound is a startup sizing decision: exhausting it mid-session is
    /// fatal, so size it well above the instrument-set cardinality (the
    /// default configs use 1 << 20).
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot {
                by_name: HashMap::new(),
                by_token: Vec::new(),
            }),
            write: Mutex::new(()),
            capacity,
        }
    }

    /// Interns `name`, returning its token.
    ///
    /// Lock-free for strings already seen. Returns `Error::InternerFull` when
    /// the configured token space is exhausted.
    pub fn intern(&self, name: &str) -> Result<Token> {
        if let Some(token) = self.snapshot.load().by_name.get(name) {
            return Ok(*token);
        }
        self.intern_slow(name)
    }

    fn intern_slow(&self, name: &str) -> Result<Token> {
        let _guard = self.write.lock().expect("interner write lock poisoned");

        // Another writer may have inserted while we waited.
        let current = self.snapshot.load_full();
        if let Some(token) = current.by_name.get(name) {
            return Ok(*token);
        }

        if current.by_token.len() as u32 >= self.capacity {
            return Err(Error::InternerFull);
        }

        let leaked: &'static str = Box::leak(name.to_owned().into_boxed_str());
        let token = Token(current.by_token.len() as u32);

        let mut next = Snapshot {
            by_name: current.by_name.clone(),
            by_token: current.by_token.clone(),
        };
        next.by_name.insert(leaked, token);
        next.by_token.push(leaked);
        self.snapshot.store(Arc::new(next));

        Ok(token)
    }

    /// Resolves a token back to its string. Panics on a token from another
    /// interner; tokens are only ever produced by `intern`.
    pub fn resolve(&self, token: Token) -> &'static str {
        self.snapshot.load().by_token[token.0 as usize]
    }

    /// Number of distinct strings interned so far.
    pub fn len(&self) -> usize {
        self.snapshot.load().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
