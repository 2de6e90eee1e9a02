//! Frame publishing and the ring drain loop.
//!
//! Publishing is fire-and-forget with an asynchronous acknowledgement: the
//! drain loop awaits each ack with a per-message timeout, retries NAKs and
//! timeouts with exponential backoff up to a ceiling, and dead-letters the
//! frame when the ceiling is hit. Per subject, bus order equals drain order
//! equals adapter receipt order, because the drain loop publishes frames
//! one at a time in ring order.

use std::time::Duration;

use async_nats::HeaderMap;
use log::{debug, error, info, warn};
use metrics::{register_counter, Counter};
use rand::Rng;

use crate::frame::Frame;
use crate::ring::{Backoff, Consumer};

use super::{Bus, BusError, HDR_CAPTURE_TS, HDR_CONNECTOR_SEQ, HDR_SHARD};

const ACK_TIMEOUT: Duration = Duration::from_secs(3);
const RETRY_BASE: Duration = Duration::from_millis(100);
const MAX_PUBLISH_ATTEMPTS: u32 = 5;

pub struct FramePublisher {
    bus: Bus,
    feed: String,
    shard: String,
    dlq_subject: String,
    published: Counter,
    dead_lettered: Counter,
}

impl FramePublisher {
    pub fn new(bus: Bus, feed: &str, shard_index: u32) -> Self {
        let dlq_subject = bus.dlq_subject("connector", feed);
        Self {
            bus,
            feed: feed.to_owned(),
            shard: shard_index.to_string(),
            dlq_subject,
            published: register_counter!("tapeline_bus_published_total", "feed" => feed.to_owned()),
            dead_lettered: register_counter!("tapeline_bus_dead_lettered_total", "feed" => feed.to_owned()),
        }
    }

    fn headers(&self, frame: &Frame) -> HeaderMap {
        let mut headers = HeaderMap::new();
        // The duplicate window keys on this id, so a republish after a
        // reconnect collapses inside the bus.
        headers.insert(
            "Nats-Msg-Id",
            format!("{}.{}.{}", self.feed, self.shard, frame.seq).as_str(),
        );
        headers.insert(HDR_CAPTURE_TS, frame.ts_ns.to_string().as_str());
        headers.insert(HDR_CONNECTOR_SEQ, frame.seq.to_string().as_str());
        headers.insert(HDR_SHARD, self.shard.as_str());
        headers
    }

    /// Publishes one frame and awaits the stream acknowledgement. Returns
    /// the bus sequence assigned to the message.
    pub async fn publish(&self, frame: &Frame) -> Result<u64, BusError> {
        let ack_future = self
            .bus
            .context()
            .publish_with_headers(
                frame.subject.to_string(),
                self.headers(frame),
                frame.payload.clone().into(),
            )
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        let ack = tokio::time::timeout(ACK_TIMEOUT, ack_future)
            .await
            .map_err(|_| BusError::AckTimeout(ACK_TIMEOUT))?
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(ack.sequence)
    }

    /// Publishes with bounded retries; dead-letters on exhaustion.
    pub async fn publish_with_retry(&self, frame: &Frame) -> Result<u64, BusError> {
        let mut attempt = 0;
        loop {
            match self.publish(frame).await {
                Ok(sequence) => {
                    self.published.increment(1);
                    return Ok(sequence);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_PUBLISH_ATTEMPTS {
                        warn!(
                            "[{}] publish failed after {attempt} attempts, dead-lettering seq {}: {e}",
                            self.feed, frame.seq
                        );
                        self.dead_letter(frame).await;
                        return Err(e);
                    }
                    let backoff = RETRY_BASE * 2u32.saturating_pow(attempt - 1);
                    let jitter =
                        rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                    debug!("[{}] publish attempt {attempt} failed: {e}", self.feed);
                    tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                }
            }
        }
    }

    async fn dead_letter(&self, frame: &Frame) {
        self.dead_lettered.increment(1);
        let publish = self
            .bus
            .context()
            .publish_with_headers(
                self.dlq_subject.clone(),
                self.headers(frame),
                frame.payload.clone().into(),
            )
            .await;
        if let Err(e) = publish {
            // Both the stream and the DLQ are refusing writes; nothing left
            // to do with this frame but count it.
            error!("[{}] dead-letter publish failed: {e}", self.feed);
        }
    }

    /// Drains the ring until the producer closes it and it runs empty, then
    /// returns. On shutdown the caller bounds this with `drain_deadline`.
    pub async fn run_drain(&self, mut ring: Consumer, drain_deadline: Duration) {
        let mut backoff = Backoff::default();
        let mut closing_deadline: Option<tokio::time::Instant> = None;

        loop {
            if closing_deadline.is_none() && ring.is_closing() {
                closing_deadline = Some(tokio::time::Instant::now() + drain_deadline);
            }
            if let Some(deadline) = closing_deadline {
                if tokio::time::Instant::now() >= deadline {
                    warn!(
                        "[{}] drain deadline hit with frames still queued, abandoning",
                        self.feed
                    );
                    return;
                }
            }

            if let Some(frame) = ring.pop() {
                backoff.reset();
                // Errors are already counted and dead-lettered; ordering for
                // the subject is preserved because we only move on once the
                // frame is resolved one way or the other.
                let _ = self.publish_with_retry(&frame).await;
                continue;
            }

            if ring.is_disconnected() {
                info!("[{}] ring drained and closed, drainer exiting", self.feed);
                return;
            }

            backoff.idle().await;
        }
    }
}
