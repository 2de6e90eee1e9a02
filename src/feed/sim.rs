//! Synthetic wire for tests and soak runs: per-instrument subscription
//! framing, no auth, ws-level ping.
//!
//! Speaks a minimal JSON protocol that the test harness (or any local
//! WebSocket echo) can produce: `{"kind": "...", "instrument": "...", ...}`
//! per update, `{"op":"subscribed","instrument":"..."}` as confirmation.

use serde::Deserialize;

use crate::frame::Kind;

use super::{Classified, ExchangeWire, FeedError, WireUpdate};

#[derive(Default)]
pub struct SimWire;

impl SimWire {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Deserialize)]
struct SimMessage {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    kind: Option<Kind>,
    #[serde(default)]
    instrument: Option<String>,
}

impl ExchangeWire for SimWire {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn subscribe_frames(&mut self, instruments: &[String], channels: &[Kind]) -> Vec<String> {
        let channels: Vec<&str> = channels.iter().map(Kind::as_str).collect();
        instruments
            .iter()
            .map(|instrument| {
                serde_json::json!({
                    "op": "subscribe",
                    "instrument": instrument,
                    "channels": channels,
                })
                .to_string()
            })
            .collect()
    }

    fn unsubscribe_frames(&mut self, instruments: &[String], _channels: &[Kind]) -> Vec<String> {
        instruments
            .iter()
            .map(|instrument| {
                serde_json::json!({"op": "unsubscribe", "instrument": instrument}).to_string()
            })
            .collect()
    }

    fn confirms_subscriptions(&self) -> bool {
        true
    }

    fn classify(&mut self, raw: &[u8]) -> Result<Classified, FeedError> {
        let message: SimMessage = serde_json::from_slice(raw)
            .map_err(|e| FeedError::Protocol(format!("sim frame: {e}")))?;

        if let Some(op) = message.op.as_deref() {
            return match op {
                "subscribed" => Ok(Classified::SubscribeAck(
                    message.instrument.into_iter().collect(),
                )),
                "heartbeat" => Ok(Classified::Heartbeat),
                _ => Ok(Classified::Ignore),
            };
        }

        let instrument = message
            .instrument
            .ok_or_else(|| FeedError::Protocol("sim update without instrument".into()))?;
        Ok(Classified::Updates(vec![WireUpdate {
            kind: message.kind.unwrap_or(Kind::Unknown),
            instrument,
            payload: raw.to_vec(),
        }]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_instrument_framing() {
        let mut wire = SimWire::new();
        let frames = wire.subscribe_frames(
            &["A".into(), "B".into(), "C".into()],
            &[Kind::Trade],
        );
        assert_eq!(frames.len(), 3);
        let value: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(value["instrument"], "B");
    }

    #[test]
    fn classify_update_and_ack() {
        let mut wire = SimWire::new();
        match wire
            .classify(br#"{"kind":"trade","instrument":"A","px":10}"#)
            .unwrap()
        {
            Classified::Updates(updates) => {
                assert_eq!(updates[0].kind, Kind::Trade);
                assert_eq!(updates[0].instrument, "A");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
        match wire.classify(br#"{"op":"subscribed","instrument":"A"}"#).unwrap() {
            Classified::SubscribeAck(instruments) => assert_eq!(instruments, vec!["A"]),
            other => panic!("unexpected classification: {other:?}"),
        }
    }
}
