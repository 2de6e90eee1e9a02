//! Durable pull consumers: the archiver's frame feed and the subscription
//! manager's catalog change feed.
//!
//! Both are durable with explicit acks, so a restarted process resumes from
//! its last acknowledged sequence and loses nothing the stream retention
//! still holds. The archiver deliberately stops fetching (and therefore
//! acking) when storage is under pressure; the stream absorbs the backlog.

use std::time::Duration;

use async_nats::jetstream::consumer::{pull, AckPolicy, Consumer as JsConsumer};
use futures_util::StreamExt;
use log::warn;

use crate::frame::Kind;
use crate::submgr::ChangeEvent;

use super::{Bus, BusError, HDR_CAPTURE_TS, HDR_CONNECTOR_SEQ};

/// One frame pulled off the bus, with enough metadata to archive it and an
/// ack handle to advance the cursor.
pub struct ConsumedFrame {
    pub subject: String,
    pub kind: Kind,
    pub instrument: String,
    /// Stream sequence assigned at publish time.
    pub stream_seq: u64,
    /// Capture timestamp header, when the publisher stamped one.
    pub ts_ns: u64,
    /// Per-connector sequence header.
    pub connector_seq: u64,
    pub payload: Vec<u8>,
    message: async_nats::jetstream::Message,
}

impl ConsumedFrame {
    pub async fn ack(&self) -> Result<(), BusError> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Consume(format!("ack: {e}")))
    }
}

/// Splits `{env}.{feed}.json.{kind}.{instrument}` into (kind, instrument).
fn parse_subject(subject: &str) -> Option<(Kind, String)> {
    let mut parts = subject.splitn(5, '.');
    let _env = parts.next()?;
    let _feed = parts.next()?;
    let _format = parts.next()?;
    let kind = Kind::parse(parts.next()?);
    let instrument = parts.next()?.to_owned();
    Some((kind, instrument))
}

fn header_u64(message: &async_nats::jetstream::Message, name: &str) -> u64 {
    message
        .headers
        .as_ref()
        .and_then(|headers| headers.get(name))
        .and_then(|value| value.as_str().parse().ok())
        .unwrap_or(0)
}

/// The archiver's durable view of one feed's subjects.
pub struct FrameConsumer {
    consumer: JsConsumer<pull::Config>,
}

impl FrameConsumer {
    /// Binds (or creates) the durable consumer `archiver-{feed}` on the
    /// feed's stream.
    pub async fn durable(bus: &Bus, feed: &str) -> Result<Self, BusError> {
        let stream_name = bus.feed_stream_name(feed);
        let stream = bus
            .context()
            .get_stream(&stream_name)
            .await
            .map_err(|e| BusError::Consume(format!("get stream {stream_name}: {e}")))?;

        let durable_name = format!("archiver-{feed}");
        let consumer = stream
            .get_or_create_consumer(
                &durable_name,
                pull::Config {
                    durable_name: Some(durable_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    filter_subject: bus.feed_subjects(feed),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Consume(format!("consumer {durable_name}: {e}")))?;

        Ok(Self { consumer })
    }

    /// Fetches up to `max` frames, waiting at most `wait` for the first.
    /// Frames whose subject does not parse are acked and skipped with a
    /// warning; they cannot be archived into a (kind, instrument) slot.
    pub async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<ConsumedFrame>, BusError> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| BusError::Consume(format!("fetch: {e}")))?;

        let mut frames = Vec::new();
        while let Some(message) = batch.next().await {
            let message = message.map_err(|e| BusError::Consume(format!("receive: {e}")))?;
            let stream_seq = message
                .info()
                .map(|info| info.stream_sequence)
                .map_err(|e| BusError::Consume(format!("message info: {e}")))?;

            let subject = message.subject.to_string();
            let Some((kind, instrument)) = parse_subject(&subject) else {
                warn!("unroutable subject {subject}, acking and skipping");
                let _ = message.ack().await;
                continue;
            };

            frames.push(ConsumedFrame {
                ts_ns: header_u64(&message, HDR_CAPTURE_TS),
                connector_seq: header_u64(&message, HDR_CONNECTOR_SEQ),
                stream_seq,
                kind,
                instrument,
                payload: message.payload.to_vec(),
                subject,
                message,
            });
        }
        Ok(frames)
    }
}

/// The subscription manager's durable view of the catalog change feed.
pub struct ChangeFeedConsumer {
    consumer: JsConsumer<pull::Config>,
}

impl ChangeFeedConsumer {
    pub async fn durable(bus: &Bus, feed: &str, shard_index: u32) -> Result<Self, BusError> {
        let stream_name = bus.cdc_stream_name();
        let stream = bus
            .context()
            .get_stream(&stream_name)
            .await
            .map_err(|e| BusError::Consume(format!("get stream {stream_name}: {e}")))?;

        let durable_name = format!("submgr-{feed}-{shard_index}");
        let consumer = stream
            .get_or_create_consumer(
                &durable_name,
                pull::Config {
                    durable_name: Some(durable_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Consume(format!("consumer {durable_name}: {e}")))?;

        Ok(Self { consumer })
    }

    /// Fetches pending change events. Malformed events are acked and
    /// dropped; the level-triggered reconcile tick corrects for anything a
    /// single lost event would have changed.
    pub async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<ChangeEvent>, BusError> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| BusError::Consume(format!("fetch: {e}")))?;

        let mut events = Vec::new();
        while let Some(message) = batch.next().await {
            let message = message.map_err(|e| BusError::Consume(format!("receive: {e}")))?;
            match serde_json::from_slice::<ChangeEvent>(&message.payload) {
                Ok(event) => events.push(event),
                Err(e) => warn!("malformed change event on {}: {e}", message.subject),
            }
            let _ = message.ack().await;
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_parses_into_kind_and_instrument() {
        let (kind, instrument) =
            parse_subject("prod.kalshi.json.trade.PRES-2028-DEM").unwrap();
        assert_eq!(kind, Kind::Trade);
        assert_eq!(instrument, "PRES-2028-DEM");

        // Unknown kinds still route.
        let (kind, _) = parse_subject("prod.kalshi.json.whatever.X").unwrap();
        assert_eq!(kind, Kind::Unknown);

        assert!(parse_subject("too.short").is_none());
    }
}
