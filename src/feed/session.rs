//! The long-lived WebSocket session loop shared by every wire.
//!
//! One session per (feed, shard). The loop owns the socket and the ring
//! producer; classification happens inline on the reader task and the
//! resulting frames are pushed with a non-blocking ring write, so a slow
//! bus never stalls the socket.
//!
//! Lifecycle: `Disconnected -> Connecting -> Authenticating -> Subscribing
//! -> Streaming`, with any I/O or protocol error from `Streaming` bouncing
//! through `Reconnecting` under bounded exponential backoff with jitter.
//! Auth rejection after the first successful connect means the credential
//! was rotated or revoked; that is fatal so the orchestrator can inject a
//! fresh secret. An explicit close lands in `Closed`, which is terminal.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use metrics::{register_counter, Counter};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::clock::Clock;
use crate::config::{FeedConfig, HeartbeatKind};
use crate::frame::{Frame, SubjectCache};
use crate::intern::Interner;
use crate::ring::Producer;

use super::auth::Signer;
use super::{Classified, ExchangeWire, FeedError, SessionState};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Streaming at least this long counts as a healthy connect and resets the
/// backoff ladder.
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Control operations accepted while the session runs.
#[derive(Debug)]
pub enum SessionCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Close,
}

/// Notifications back to the subscription manager.
#[derive(Debug)]
pub enum SessionEvent {
    Subscribed(Vec<String>),
    SubscribeFailed { instruments: Vec<String>, reason: String },
}

/// Cheap handle for talking to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    pub commands: mpsc::Sender<SessionCommand>,
    pub state: watch::Receiver<SessionState>,
}

enum LoopExit {
    Closed,
    Reconnect(FeedError),
}

pub struct Session<C: Clock> {
    config: FeedConfig,
    env: String,
    shard_index: u32,
    wire: Box<dyn ExchangeWire>,
    signer: Signer,
    clock: Arc<C>,
    interner: Arc<Interner>,
    subjects: SubjectCache,
    producer: Producer,
    seq: u64,
    /// Instruments this session believes it holds exchange-side. Replayed
    /// on every reconnect.
    subscribed: BTreeSet<String>,
    /// Sent but unconfirmed, for wires with protocol confirmations.
    pending: Vec<String>,
    commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
    http: reqwest::Client,
    authenticated_once: bool,
    frames_out: Counter,
    parse_errors: Counter,
    reconnects: Counter,
}

impl<C: Clock> Session<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FeedConfig,
        env: String,
        shard_index: u32,
        wire: Box<dyn ExchangeWire>,
        signer: Signer,
        clock: Arc<C>,
        interner: Arc<Interner>,
        producer: Producer,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let subjects = SubjectCache::new(&env, &config.feed);
        let feed = config.feed.clone();
        let shard = shard_index.to_string();

        let session = Self {
            config,
            env,
            shard_index,
            wire,
            signer,
            clock,
            interner,
            subjects,
            producer,
            seq: 0,
            subscribed: BTreeSet::new(),
            pending: Vec::new(),
            commands: command_rx,
            events,
            state_tx,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            authenticated_once: false,
            frames_out: register_counter!("tapeline_frames_captured_total", "feed" => feed.clone(), "shard" => shard.clone()),
            parse_errors: register_counter!("tapeline_frame_parse_errors_total", "feed" => feed.clone(), "shard" => shard.clone()),
            reconnects: register_counter!("tapeline_session_reconnects_total", "feed" => feed, "shard" => shard),
        };
        let handle = SessionHandle {
            commands: command_tx,
            state: state_rx,
        };
        (session, handle)
    }

    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }

    /// Runs until closed or a fatal error. Transient failures reconnect
    /// internally and never surface here.
    pub async fn run(mut self) -> Result<(), FeedError> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let connected_at = tokio::time::Instant::now();
            match self.connect_and_stream().await {
                Ok(LoopExit::Closed) => {
                    info!(
                        "[{}:{}] session closed, {} frames captured",
                        self.config.feed, self.shard_index, self.seq
                    );
                    self.set_state(SessionState::Closed);
                    self.producer.close();
                    return Ok(());
                }
                Ok(LoopExit::Reconnect(reason)) | Err(reason) => {
                    if matches!(reason, FeedError::Auth(_) | FeedError::Config(_)) {
                        // Credential rotation, revocation, or a broken
                        // endpoint; reconnecting cannot fix either, so exit
                        // and let the orchestrator restart with fresh state.
                        error!(
                            "[{}:{}] fatal session error: {reason}",
                            self.config.feed, self.shard_index
                        );
                        self.set_state(SessionState::Closed);
                        self.producer.close();
                        return Err(reason);
                    }
                    if connected_at.elapsed() >= BACKOFF_RESET_AFTER {
                        backoff = INITIAL_BACKOFF;
                    }
                    self.reconnects.increment(1);
                    self.set_state(SessionState::Reconnecting);
                    let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                    let delay = backoff + Duration::from_millis(jitter);
                    warn!(
                        "[{}:{}] session error: {reason}; reconnecting in {delay:?}",
                        self.config.feed, self.shard_index
                    );
                    tokio::time::sleep(delay).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_and_stream(&mut self) -> Result<LoopExit, FeedError> {
        self.set_state(SessionState::Connecting);

        let mut request = self
            .config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| FeedError::Config(format!("bad endpoint: {e}")))?;

        self.set_state(SessionState::Authenticating);
        for (name, value) in self.wire.handshake_headers(&self.signer)? {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FeedError::Config(format!("bad auth header name: {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| FeedError::Config(format!("bad auth header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (mut ws, _response) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(WsError::Http(response)) if response.status().as_u16() == 401 || response.status().as_u16() == 403 => {
                return Err(FeedError::Auth(format!(
                    "handshake rejected with {}",
                    response.status()
                )));
            }
            Err(e) => return Err(FeedError::Network(format!("connect: {e}"))),
        };
        self.authenticated_once = true;
        info!(
            "[{}:{}] connected to {}",
            self.config.feed, self.shard_index, self.config.endpoint
        );

        self.set_state(SessionState::Subscribing);
        let (snapshot_tx, mut snapshot_rx) = mpsc::channel::<(String, reqwest::Result<Vec<u8>>)>(64);
        if !self.subscribed.is_empty() {
            let instruments: Vec<String> = self.subscribed.iter().cloned().collect();
            self.send_subscribe(&mut ws, &instruments, &snapshot_tx).await?;
        }
        self.set_state(SessionState::Streaming);

        let heartbeat = Duration::from_secs(self.config.heartbeat.interval_secs.max(1));
        let idle_window = heartbeat * 2;
        let mut heartbeat_tick = tokio::time::interval(heartbeat);
        heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_activity = tokio::time::Instant::now();

        loop {
            let idle_deadline = last_activity + idle_window;
            tokio::select! {
                message = ws.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            last_activity = tokio::time::Instant::now();
                            self.handle_payload(text.as_bytes());
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            last_activity = tokio::time::Instant::now();
                            self.handle_payload(&bytes);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            last_activity = tokio::time::Instant::now();
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_activity = tokio::time::Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Ok(LoopExit::Reconnect(FeedError::Network(format!(
                                "server closed: {frame:?}"
                            ))));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Ok(LoopExit::Reconnect(FeedError::Network(format!(
                                "socket: {e}"
                            ))));
                        }
                        None => {
                            return Ok(LoopExit::Reconnect(FeedError::Network(
                                "stream ended".into(),
                            )));
                        }
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(SessionCommand::Subscribe(instruments)) => {
                            if self.subscribed.len() + instruments.len()
                                > self.config.max_instruments_per_connection
                            {
                                let reason = FeedError::Limit(format!(
                                    "{} + {} exceeds per-connection cap {}",
                                    self.subscribed.len(),
                                    instruments.len(),
                                    self.config.max_instruments_per_connection
                                ));
                                warn!("[{}:{}] {reason}", self.config.feed, self.shard_index);
                                let _ = self.events.send(SessionEvent::SubscribeFailed {
                                    instruments,
                                    reason: reason.to_string(),
                                });
                                continue;
                            }
                            self.send_subscribe(&mut ws, &instruments, &snapshot_tx).await?;
                        }
                        Some(SessionCommand::Unsubscribe(instruments)) => {
                            for frame in self.wire.unsubscribe_frames(&instruments, &self.config.channels) {
                                ws.send(Message::Text(frame)).await.map_err(|e| {
                                    FeedError::Network(format!("unsubscribe send: {e}"))
                                })?;
                            }
                            for instrument in &instruments {
                                self.subscribed.remove(instrument);
                            }
                        }
                        Some(SessionCommand::Close) | None => {
                            // Drain politely; the drainer owns the bounded
                            // shutdown deadline for queued frames.
                            let _ = ws.send(Message::Close(None)).await;
                            return Ok(LoopExit::Closed);
                        }
                    }
                }
                Some((instrument, body)) = snapshot_rx.recv() => {
                    match body {
                        Ok(bytes) => {
                            if let Some(update) = self.wire.snapshot_update(&instrument, bytes) {
                                self.emit(update);
                            }
                        }
                        Err(e) => {
                            warn!(
                                "[{}:{}] snapshot fetch failed for {instrument}: {e}",
                                self.config.feed, self.shard_index
                            );
                        }
                    }
                }
                _ = heartbeat_tick.tick() => {
                    match self.config.heartbeat.kind {
                        HeartbeatKind::WsPing => {
                            ws.send(Message::Ping(Vec::new())).await.map_err(|e| {
                                FeedError::Network(format!("ping send: {e}"))
                            })?;
                        }
                        HeartbeatKind::TextPing => {
                            if let Some(text) = self.wire.heartbeat_text() {
                                ws.send(Message::Text(text)).await.map_err(|e| {
                                    FeedError::Network(format!("heartbeat send: {e}"))
                                })?;
                            }
                        }
                        HeartbeatKind::Server => {}
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    return Ok(LoopExit::Reconnect(FeedError::Network(format!(
                        "no activity for {idle_window:?}"
                    ))));
                }
            }
        }
    }

    async fn send_subscribe(
        &mut self,
        ws: &mut WsStream,
        instruments: &[String],
        snapshot_tx: &mpsc::Sender<(String, reqwest::Result<Vec<u8>>)>,
    ) -> Result<(), FeedError> {
        for frame in self.wire.subscribe_frames(instruments, &self.config.channels) {
            ws.send(Message::Text(frame))
                .await
                .map_err(|e| FeedError::Network(format!("subscribe send: {e}")))?;
        }

        for instrument in instruments {
            self.subscribed.insert(instrument.clone());
            if let Some(url) = self.wire.snapshot_url(instrument) {
                let client = self.http.clone();
                let tx = snapshot_tx.clone();
                let instrument = instrument.clone();
                tokio::spawn(async move {
                    let result = match client.get(&url).send().await {
                        Ok(response) => response.bytes().await.map(|b| b.to_vec()),
                        Err(e) => Err(e),
                    };
                    let _ = tx.send((instrument, result)).await;
                });
            }
        }

        if self.wire.confirms_subscriptions() {
            self.pending.extend(instruments.iter().cloned());
        } else {
            let _ = self
                .events
                .send(SessionEvent::Subscribed(instruments.to_vec()));
        }
        Ok(())
    }

    fn handle_payload(&mut self, raw: &[u8]) {
        match self.wire.classify(raw) {
            Ok(Classified::Updates(updates)) => {
                for update in updates {
                    self.emit(update);
                }
            }
            Ok(Classified::SubscribeAck(confirmed)) => {
                let confirmed = if confirmed.is_empty() {
                    std::mem::take(&mut self.pending)
                } else {
                    self.pending.retain(|p| !confirmed.contains(p));
                    confirmed
                };
                if !confirmed.is_empty() {
                    debug!(
                        "[{}:{}] subscription confirmed for {} instruments",
                        self.config.feed,
                        self.shard_index,
                        confirmed.len()
                    );
                    let _ = self.events.send(SessionEvent::Subscribed(confirmed));
                }
            }
            Ok(Classified::Heartbeat) | Ok(Classified::Ignore) => {}
            Err(e) => {
                // Frame-level: count and move on, the session survives.
                self.parse_errors.increment(1);
                debug!("[{}:{}] discarded frame: {e}", self.config.feed, self.shard_index);
            }
        }
    }

    fn emit(&mut self, update: super::WireUpdate) {
        let (token, subject) =
            match self
                .subjects
                .subject(&self.interner, &update.instrument, update.kind)
            {
                Ok(ok) => ok,
                Err(e) => {
                    // Interner exhaustion is a sizing fault; surfaced loudly
                    // but an individual frame is not worth the session.
                    error!("[{}] intern failed: {e}", self.config.feed);
                    self.parse_errors.increment(1);
                    return;
                }
            };

        self.seq += 1;
        let frame = Frame {
            subject,
            kind: update.kind,
            instrument: token,
            ts_ns: self.clock.now_ns(),
            seq: self.seq,
            payload: update.payload,
        };
        if self.producer.push(frame).is_err() {
            // Ring full: shed the newest. The drop counter lives in the
            // ring stats and feeds the readiness probe.
            debug!("[{}:{}] ring full, frame dropped", self.config.feed, self.shard_index);
        } else {
            self.frames_out.increment(1);
        }
    }

    /// Environment label this session stamps into subjects.
    pub fn env(&self) -> &str {
        &self.env
    }
}
