//! Kalshi wire: signed handshake, single-dict subscription framing.
//!
//! Every command is one JSON dict with an incrementing `id`; the server
//! confirms subscriptions with a `subscribed` message. Market data arrives
//! as `{"type": ..., "msg": {"market_ticker": ...}}` envelopes. The
//! handshake carries access headers signed over `timestamp + method + path`.

use serde::Deserialize;
use serde::Serialize;

use crate::config::FeedConfig;
use crate::frame::Kind;

use super::auth::{now_ms, Signer};
use super::{Classified, ExchangeWire, FeedError, WireUpdate};

pub struct KalshiWire {
    /// URL path of the WS endpoint, the signed component of the handshake.
    ws_path: String,
    next_cmd_id: u64,
}

impl KalshiWire {
    pub fn new(config: &FeedConfig) -> Self {
        let ws_path = url::Url::parse(&config.endpoint)
            .map(|u| u.path().to_owned())
            .unwrap_or_else(|_| "/".to_owned());
        Self {
            ws_path,
            next_cmd_id: 1,
        }
    }

    fn channel_name(kind: Kind) -> Option<&'static str> {
        match kind {
            Kind::Trade => Some("trade"),
            Kind::Ticker => Some("ticker"),
            Kind::Orderbook => Some("orderbook_delta"),
            Kind::Lifecycle => Some("market_lifecycle"),
            Kind::Unknown => None,
        }
    }

    fn kind_for_type(message_type: &str) -> Kind {
        match message_type {
            "trade" => Kind::Trade,
            "ticker" | "ticker_v2" => Kind::Ticker,
            "orderbook_snapshot" | "orderbook_delta" => Kind::Orderbook,
            "market_lifecycle" | "event_lifecycle" => Kind::Lifecycle,
            _ => Kind::Unknown,
        }
    }

    fn command(&mut self, cmd: &str, instruments: &[String], channels: &[Kind]) -> String {
        #[derive(Serialize)]
        struct Params<'a> {
            channels: Vec<&'static str>,
            market_tickers: &'a [String],
        }
        #[derive(Serialize)]
        struct Command<'a> {
            id: u64,
            cmd: &'a str,
            params: Params<'a>,
        }

        let id = self.next_cmd_id;
        self.next_cmd_id += 1;
        let command = Command {
            id,
            cmd,
            params: Params {
                channels: channels.iter().copied().filter_map(Self::channel_name).collect(),
                market_tickers: instruments,
            },
        };
        serde_json::to_string(&command).expect("command serialization")
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    msg: Option<EnvelopeBody>,
}

#[derive(Deserialize)]
struct EnvelopeBody {
    #[serde(default)]
    market_ticker: Option<String>,
    #[serde(default)]
    market_tickers: Option<Vec<String>>,
}

impl ExchangeWire for KalshiWire {
    fn name(&self) -> &'static str {
        "kalshi"
    }

    fn subscribe_frames(&mut self, instruments: &[String], channels: &[Kind]) -> Vec<String> {
        vec![self.command("subscribe", instruments, channels)]
    }

    fn unsubscribe_frames(&mut self, instruments: &[String], channels: &[Kind]) -> Vec<String> {
        vec![self.command("unsubscribe", instruments, channels)]
    }

    fn confirms_subscriptions(&self) -> bool {
        true
    }

    fn classify(&mut self, raw: &[u8]) -> Result<Classified, FeedError> {
        // simd-json mutates its input; parse a scratch copy and keep `raw`
        // as the pass-through payload.
        let mut scratch = raw.to_vec();
        let envelope: Envelope = simd_json::from_slice(&mut scratch)
            .map_err(|e| FeedError::Protocol(format!("kalshi envelope: {e}")))?;

        match envelope.message_type.as_str() {
            "subscribed" => {
                let confirmed = envelope
                    .msg
                    .and_then(|m| m.market_tickers)
                    .unwrap_or_default();
                Ok(Classified::SubscribeAck(confirmed))
            }
            "error" => Err(FeedError::Protocol(
                String::from_utf8_lossy(raw).into_owned(),
            )),
            "ok" | "unsubscribed" => Ok(Classified::Ignore),
            message_type => {
                let instrument = envelope
                    .msg
                    .and_then(|m| m.market_ticker)
                    .ok_or_else(|| {
                        FeedError::Protocol(format!("{message_type} frame without market_ticker"))
                    })?;
                Ok(Classified::Updates(vec![WireUpdate {
                    kind: Self::kind_for_type(message_type),
                    instrument,
                    payload: raw.to_vec(),
                }]))
            }
        }
    }

    fn handshake_headers(&self, signer: &Signer) -> Result<Vec<(String, String)>, FeedError> {
        let key_id = signer
            .key_id()
            .ok_or_else(|| FeedError::Auth("kalshi requires signed credentials".into()))?
            .to_owned();
        let timestamp = now_ms();
        let signature = signer.sign(timestamp, "GET", &self.ws_path)?;
        Ok(vec![
            ("KALSHI-ACCESS-KEY".into(), key_id),
            ("KALSHI-ACCESS-SIGNATURE".into(), signature),
            ("KALSHI-ACCESS-TIMESTAMP".into(), timestamp.to_string()),
        ])
    }
}
