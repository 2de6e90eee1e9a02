//! Exchange adapters: one WebSocket session per (feed, shard).
//!
//! A session owns the socket, authenticates, keeps the active subscription
//! set, classifies incoming frames into the internal envelope, and pushes
//! them to the ring. Everything exchange-specific lives behind
//! [`ExchangeWire`]; the session loop in [`session`] is shared by every
//! wire.
//!
//! Wire particulars are a closed enumeration: subscription framing (single
//! dict, array-wrapped, per-instrument), auth scheme (signed headers, static
//! key, none), heartbeat convention (ws ping/pong, app-level text PING,
//! server-initiated), and per-connection caps.

pub mod auth;
pub mod kalshi;
pub mod polymarket;
pub mod session;
pub mod sim;

use thiserror::Error;

use crate::config::{FeedConfig, WireKind};
use crate::frame::Kind;

use self::auth::Signer;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Credential rejected or signing material unusable. Fatal after the
    /// first successful connect: the process exits so the orchestrator can
    /// inject a fresh secret.
    #[error("auth error: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    /// Malformed or unexpected exchange message. Frame-level: counted and
    /// discarded without tearing down the session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Exchange rejected a subscription due to per-connection caps.
    #[error("limit error: {0}")]
    Limit(String),

    #[error("config error: {0}")]
    Config(String),
}

impl FeedError {
    /// Transient errors are retried by reconnecting; the rest escalate.
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::Network(_) | FeedError::Protocol(_))
    }
}

/// Session lifecycle. `Closed` is terminal; the supervising process exits so
/// the orchestrator restarts it with fresh state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribing,
    Streaming,
    Reconnecting,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Subscribing => "subscribing",
            SessionState::Streaming => "streaming",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        }
    }
}

/// One logical update extracted from an exchange frame. Batched exchange
/// frames expand into several of these; the payload bytes are the original
/// wire bytes of that update, never re-serialized.
#[derive(Debug)]
pub struct WireUpdate {
    pub kind: Kind,
    pub instrument: String,
    pub payload: Vec<u8>,
}

/// Classification result for one incoming socket frame.
#[derive(Debug)]
pub enum Classified {
    /// Market data: one frame per logical update.
    Updates(Vec<WireUpdate>),
    /// Subscription confirmation carrying the confirmed instruments.
    SubscribeAck(Vec<String>),
    /// App-level heartbeat; resets the liveness window.
    Heartbeat,
    /// Anything else the session should ignore (status frames etc.).
    Ignore,
}

/// Exchange-specific wire behavior. Implementations are stateless apart from
/// parse scratch space; session state (subscribed set, sequence, backoff)
/// lives in the shared session loop.
pub trait ExchangeWire: Send {
    fn name(&self) -> &'static str;

    /// Subscription frames for a set of instruments. The framing shape is
    /// the wire's own: one dict, an array-wrapped dict, or one message per
    /// instrument.
    fn subscribe_frames(&mut self, instruments: &[String], channels: &[Kind]) -> Vec<String>;

    fn unsubscribe_frames(&mut self, instruments: &[String], channels: &[Kind]) -> Vec<String>;

    /// Whether the protocol defines a subscription confirmation. When false
    /// the session treats a successful send as confirmation.
    fn confirms_subscriptions(&self) -> bool {
        false
    }

    /// Classifies one text frame. `raw` is the original bytes; wires clone
    /// into scratch space when their parser mutates input.
    fn classify(&mut self, raw: &[u8]) -> Result<Classified, FeedError>;

    /// Handshake headers (auth), built from the signer.
    fn handshake_headers(&self, signer: &Signer) -> Result<Vec<(String, String)>, FeedError> {
        let _ = signer;
        Ok(Vec::new())
    }

    /// App-level heartbeat text, for wires with a text PING convention.
    fn heartbeat_text(&self) -> Option<String> {
        None
    }

    /// REST URL for an initial book snapshot, for wires that need one
    /// before streaming diffs.
    fn snapshot_url(&self, instrument: &str) -> Option<String> {
        let _ = instrument;
        None
    }

    /// Wraps a fetched snapshot body as an orderbook update.
    fn snapshot_update(&self, instrument: &str, body: Vec<u8>) -> Option<WireUpdate> {
        Some(WireUpdate {
            kind: Kind::Orderbook,
            instrument: instrument.to_owned(),
            payload: body,
        })
    }
}

/// Builds the wire implementation named by the feed config.
pub fn build_wire(config: &FeedConfig) -> Box<dyn ExchangeWire> {
    match config.wire {
        WireKind::Kalshi => Box::new(kalshi::KalshiWire::new(config)),
        WireKind::Polymarket => Box::new(polymarket::PolymarketWire::new(config)),
        WireKind::Sim => Box::new(sim::SimWire::new()),
    }
}
