//! Durable JetStream bus plumbing shared by the connector and the archiver.
//!
//! Streams are pre-declared idempotently at startup:
//!
//! | stream               | subjects                  | retention            |
//! |----------------------|---------------------------|----------------------|
//! | `{env}_{feed}`       | `{env}.{feed}.json.>`     | bytes cap + age cap  |
//! | `{env}_cdc`          | `{env}.cdc.>`             | 24h                  |
//! | `{env}_dlq_{comp}`   | `{env}.dlq.{comp}.>`      | 7d                   |
//!
//! The market-data stream discards old data when full, so space pressure
//! sheds history rather than live frames. The duplicate-detection window
//! plus `Nats-Msg-Id` headers make republish-after-reconnect a no-op.

pub mod consumer;
pub mod publisher;

use std::time::Duration;

use async_nats::jetstream::{self, stream};
use log::info;
use thiserror::Error;

use crate::config::BusSettings;

/// Header carrying the capture timestamp in nanoseconds.
pub const HDR_CAPTURE_TS: &str = "X-Capture-Ts-Ns";
/// Header carrying the per-connector sequence.
pub const HDR_CONNECTOR_SEQ: &str = "X-Connector-Seq";
/// Header carrying the shard identity.
pub const HDR_SHARD: &str = "X-Shard";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connect: {0}")]
    Connect(String),
    #[error("stream setup: {0}")]
    Stream(String),
    #[error("publish: {0}")]
    Publish(String),
    #[error("publish ack timed out after {0:?}")]
    AckTimeout(Duration),
    #[error("consume: {0}")]
    Consume(String),
}

/// A connected bus handle. Cheap to clone; the underlying client multiplexes.
#[derive(Clone)]
pub struct Bus {
    jetstream: jetstream::Context,
    env: String,
}

impl Bus {
    pub async fn connect(env: &str, url: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connect(format!("{url}: {e}")))?;
        info!("connected to bus at {url}");
        Ok(Self {
            jetstream: jetstream::new(client),
            env: env.to_owned(),
        })
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    pub(crate) fn context(&self) -> &jetstream::Context {
        &self.jetstream
    }

    pub fn feed_stream_name(&self, feed: &str) -> String {
        format!("{}_{}", self.env, feed)
    }

    pub fn feed_subjects(&self, feed: &str) -> String {
        format!("{}.{}.json.>", self.env, feed)
    }

    pub fn cdc_stream_name(&self) -> String {
        format!("{}_cdc", self.env)
    }

    pub fn dlq_stream_name(&self, component: &str) -> String {
        format!("{}_dlq_{}", self.env, component)
    }

    pub fn dlq_subject(&self, component: &str, feed: &str) -> String {
        format!("{}.dlq.{}.{}", self.env, component, feed)
    }

    /// Declares the market-data stream for a feed. Idempotent.
    pub async fn ensure_feed_stream(
        &self,
        feed: &str,
        settings: &BusSettings,
    ) -> Result<(), BusError> {
        self.ensure_stream(stream::Config {
            name: self.feed_stream_name(feed),
            subjects: vec![self.feed_subjects(feed)],
            max_bytes: settings.max_bytes,
            max_age: Duration::from_secs(settings.max_age_hours * 3600),
            duplicate_window: Duration::from_secs(settings.dedup_window_secs),
            discard: stream::DiscardPolicy::Old,
            retention: stream::RetentionPolicy::Limits,
            ..Default::default()
        })
        .await
    }

    /// Declares the catalog change-feed stream. Idempotent.
    pub async fn ensure_cdc_stream(&self) -> Result<(), BusError> {
        self.ensure_stream(stream::Config {
            name: self.cdc_stream_name(),
            subjects: vec![format!("{}.cdc.>", self.env)],
            max_age: Duration::from_secs(24 * 3600),
            discard: stream::DiscardPolicy::Old,
            retention: stream::RetentionPolicy::Limits,
            ..Default::default()
        })
        .await
    }

    /// Declares a component's dead-letter stream. Idempotent.
    pub async fn ensure_dlq_stream(&self, component: &str) -> Result<(), BusError> {
        self.ensure_stream(stream::Config {
            name: self.dlq_stream_name(component),
            subjects: vec![format!("{}.dlq.{}.>", self.env, component)],
            max_age: Duration::from_secs(7 * 24 * 3600),
            discard: stream::DiscardPolicy::Old,
            retention: stream::RetentionPolicy::Limits,
            ..Default::default()
        })
        .await
    }

    async fn ensure_stream(&self, config: stream::Config) -> Result<(), BusError> {
        let name = config.name.clone();
        self.jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| BusError::Stream(format!("{name}: {e}")))?;
        info!("stream {name} ready");
        Ok(())
    }
}
