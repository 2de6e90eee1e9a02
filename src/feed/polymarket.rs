//! Polymarket CLOB wire: array-wrapped subscription framing, no auth on the
//! market channel, app-level text PING.
//!
//! Incoming frames batch several events into one JSON array; the wire
//! expands them into one update per logical event, slicing each event's
//! original bytes out of the frame so payloads pass through bit-exact.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::config::FeedConfig;
use crate::frame::Kind;

use super::{Classified, ExchangeWire, FeedError, WireUpdate};

pub struct PolymarketWire {
    snapshot_endpoint: Option<String>,
}

impl PolymarketWire {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            snapshot_endpoint: config.snapshot_endpoint.clone(),
        }
    }

    fn kind_for_event(event_type: &str) -> Kind {
        match event_type {
            "last_trade_price" | "trade" => Kind::Trade,
            "price_change" | "book" => Kind::Orderbook,
            "best_bid_ask" => Kind::Ticker,
            "tick_size_change" | "market_resolved" => Kind::Lifecycle,
            _ => Kind::Unknown,
        }
    }

    fn expand(&self, raw: &[u8]) -> Result<Vec<WireUpdate>, FeedError> {
        #[derive(Deserialize)]
        struct EventPeek {
            #[serde(default)]
            event_type: Option<String>,
            #[serde(default)]
            asset_id: Option<String>,
            #[serde(default)]
            market: Option<String>,
        }

        let events: Vec<&RawValue> = serde_json::from_slice(raw)
            .map_err(|e| FeedError::Protocol(format!("polymarket batch: {e}")))?;

        let mut updates = Vec::with_capacity(events.len());
        for event in events {
            let bytes = event.get().as_bytes();
            let peek: EventPeek = serde_json::from_slice(bytes)
                .map_err(|e| FeedError::Protocol(format!("polymarket event: {e}")))?;
            let Some(event_type) = peek.event_type else {
                continue;
            };
            let Some(instrument) = peek.asset_id.or(peek.market) else {
                continue;
            };
            updates.push(WireUpdate {
                kind: Self::kind_for_event(&event_type),
                instrument,
                payload: bytes.to_vec(),
            });
        }
        Ok(updates)
    }
}

#[derive(Serialize)]
struct MarketCommand<'a> {
    assets_ids: &'a [String],
    #[serde(rename = "type")]
    channel: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'a str>,
}

impl ExchangeWire for PolymarketWire {
    fn name(&self) -> &'static str {
        "polymarket"
    }

    fn subscribe_frames(&mut self, instruments: &[String], _channels: &[Kind]) -> Vec<String> {
        // The market channel carries every event kind; channel selection is
        // a downstream concern.
        vec![serde_json::to_string(&MarketCommand {
            assets_ids: instruments,
            channel: "market",
            action: None,
        })
        .expect("command serialization")]
    }

    fn unsubscribe_frames(&mut self, instruments: &[String], _channels: &[Kind]) -> Vec<String> {
        vec![serde_json::to_string(&MarketCommand {
            assets_ids: instruments,
            channel: "market",
            action: Some("unsubscribe"),
        })
        .expect("command serialization")]
    }

    fn classify(&mut self, raw: &[u8]) -> Result<Classified, FeedError> {
        if raw == b"PONG" {
            return Ok(Classified::Heartbeat);
        }
        let trimmed = raw.iter().position(|b| !b.is_ascii_whitespace());
        match trimmed.map(|i| raw[i]) {
            Some(b'[') => Ok(Classified::Updates(self.expand(raw)?)),
            // Single-object frames (connection status etc.) carry no data.
            Some(b'{') => Ok(Classified::Ignore),
            _ => Err(FeedError::Protocol("unrecognized frame shape".into())),
        }
    }

    fn heartbeat_text(&self) -> Option<String> {
        Some("PING".to_owned())
    }

    fn snapshot_url(&self, instrument: &str) -> Option<String> {
        self.snapshot_endpoint
            .as_ref()
            .map(|base| format!("{}/book?token_id={}", base.trim_end_matches('/'), instrument))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire() -> PolymarketWire {
        PolymarketWire {
            snapshot_endpoint: Some("https://clob.example.com".into()),
        }
    }

    #[test]
    fn batched_frame_expands_per_event() {
        let mut wire = wire();
        let raw = br#"[
            {"event_type":"book","asset_id":"0xabc","bids":[],"asks":[]},
            {"event_type":"last_trade_price","asset_id":"0xabc","price":"0.52"},
            {"event_type":"tick_size_change","market":"0xfeed","new_tick":"0.001"}
        ]"#;
        match wire.classify(raw).unwrap() {
            Classified::Updates(updates) => {
                assert_eq!(updates.len(), 3);
                assert_eq!(updates[0].kind, Kind::Orderbook);
                assert_eq!(updates[1].kind, Kind::Trade);
                assert_eq!(updates[2].kind, Kind::Lifecycle);
                assert_eq!(updates[2].instrument, "0xfeed");
                // Each payload is the event's own original bytes.
                let value: serde_json::Value =
                    serde_json::from_slice(&updates[1].payload).unwrap();
                assert_eq!(value["price"], "0.52");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn pong_is_heartbeat() {
        let mut wire = wire();
        assert!(matches!(
            wire.classify(b"PONG").unwrap(),
            Classified::Heartbeat
        ));
        assert_eq!(wire.heartbeat_text().as_deref(), Some("PING"));
    }

    #[test]
    fn array_wrapped_subscription() {
        let mut wire = wire();
        let frames =
            wire.subscribe_frames(&["0xabc".into(), "0xdef".into()], &[Kind::Trade]);
        assert_eq!(frames.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(value["type"], "market");
        assert_eq!(value["assets_ids"].as_array().unwrap().len(), 2);
        assert!(value.get("action").is_none());
    }

    #[test]
    fn snapshot_url_per_instrument() {
        let wire = wire();
        assert_eq!(
            wire.snapshot_url("0xabc").as_deref(),
            Some("https://clob.example.com/book?token_id=0xabc")
        );
    }
}
