//! TopstepX market hub transport.
//!
//! The hub speaks the SignalR JSON protocol over a plain WebSocket: every
//! message is a JSON object terminated by the ASCII record separator (0x1E),
//! and several may share one WebSocket text frame. We only need the
//! handshake, one non-blocking invocation (`SubscribeContractTrades`), the
//! `GatewayTrade` event and the ping/close control messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::{InstrumentKey, Tick};
use crate::error::{Result, TrailgateError};
use crate::services::{HubConnection, HubEvent, MarketHub};

const RECORD_SEPARATOR: char = '\u{1e}';

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One decoded hub message
#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    /// Handshake response; `error` set when the server refused the protocol
    Handshake { error: Option<String> },
    Trades { contract_id: String, ticks: Vec<Tick> },
    Ping,
    Close { error: Option<String> },
    /// Result of a blocking invocation, or an unrelated event
    Other,
}

/// Split a text frame on the record separator and decode each message.
pub fn parse_hub_frames(text: &str) -> Vec<HubFrame> {
    text.split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| match serde_json::from_str::<Value>(chunk) {
            Ok(value) => Some(decode_message(&value)),
            Err(e) => {
                warn!("Undecodable hub message ({}): {}", e, preview(chunk, 200));
                None
            }
        })
        .collect()
}

/// First `max_chars` characters of `text`, cut on a char boundary.
fn preview(text: &str, max_chars: usize) -> &str {
    text.char_indices()
        .nth(max_chars)
        .map_or(text, |(i, _)| &text[..i])
}

fn decode_message(value: &Value) -> HubFrame {
    let error = value.get("error").and_then(Value::as_str).map(str::to_string);
    match value.get("type").and_then(Value::as_i64) {
        None => HubFrame::Handshake { error },
        Some(1) if value.get("target").and_then(Value::as_str) == Some("GatewayTrade") => {
            decode_trades(value.get("arguments"))
        }
        Some(6) => HubFrame::Ping,
        Some(7) => HubFrame::Close { error },
        Some(_) => HubFrame::Other,
    }
}

/// `arguments: [contractId, trades]` where trades is an array or a single object.
fn decode_trades(arguments: Option<&Value>) -> HubFrame {
    let Some(args) = arguments.and_then(Value::as_array) else {
        return HubFrame::Other;
    };
    let contract_id = match args.first() {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return HubFrame::Other,
    };
    let rows: Vec<&Value> = match args.get(1) {
        Some(Value::Array(rows)) => rows.iter().collect(),
        Some(row @ Value::Object(_)) => vec![row],
        _ => Vec::new(),
    };
    let ticks = rows.into_iter().filter_map(decode_trade).collect();
    HubFrame::Trades { contract_id, ticks }
}

/// Trades without a price or a timestamp are dropped.
fn decode_trade(row: &Value) -> Option<Tick> {
    let price = match row.get("price")? {
        Value::Number(n) => Decimal::from_str_exact(&n.to_string())
            .ok()
            .or_else(|| n.as_f64().and_then(Decimal::from_f64_retain))?,
        Value::String(s) => Decimal::from_str_exact(s.trim()).ok()?,
        _ => return None,
    };
    let raw_ts = row
        .get("timestamp")
        .filter(|v| !v.is_null())
        .or_else(|| row.get("tradeTime").filter(|v| !v.is_null()))?;
    let timestamp = raw_ts
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Some(Tick::new(price, timestamp))
}

fn encode(message: Value) -> Message {
    Message::Text(format!("{}{}", message, RECORD_SEPARATOR))
}

pub struct TopstepMarketHub {
    hub_url: String,
    handshake_timeout: Duration,
    ping_interval: Duration,
}

impl TopstepMarketHub {
    pub fn new(hub_url: impl Into<String>) -> Self {
        Self {
            hub_url: hub_url.into(),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
        }
    }

    fn connect_url(&self, token: &str) -> Result<Url> {
        let mut url = Url::parse(&self.hub_url)
            .map_err(|e| TrailgateError::Internal(format!("Invalid hub URL: {}", e)))?;
        url.query_pairs_mut().append_pair("access_token", token);
        Ok(url)
    }

    async fn open(&self, instrument: &InstrumentKey, token: &str) -> Result<WsStream> {
        let url = self.connect_url(token)?;
        debug!("Connecting to market hub {}", self.hub_url);
        let (mut ws, _) = connect_async(url.as_str()).await?;

        ws.send(encode(json!({ "protocol": "json", "version": 1 })))
            .await?;
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let handshake = parse_hub_frames(&text).into_iter().find_map(|f| match f {
                        HubFrame::Handshake { error } => Some(error),
                        _ => None,
                    });
                    match handshake {
                        Some(None) => break,
                        Some(Some(err)) => {
                            return Err(TrailgateError::MarketDataUnavailable(format!(
                                "hub handshake refused: {}",
                                err
                            )))
                        }
                        None => continue,
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(TrailgateError::MarketDataUnavailable(
                        "hub closed during handshake".into(),
                    ))
                }
            }
        }

        ws.send(encode(json!({
            "type": 1,
            "target": "SubscribeContractTrades",
            "arguments": [instrument.as_str()],
        })))
        .await?;
        Ok(ws)
    }

    async fn run_session(
        instrument: InstrumentKey,
        ws: WsStream,
        events: mpsc::UnboundedSender<HubEvent>,
        mut close_rx: oneshot::Receiver<()>,
        ping_every: Duration,
    ) {
        let (mut write, mut read) = ws.split();
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);

        let ended = loop {
            tokio::select! {
                _ = &mut close_rx => {
                    let _ = write.send(Message::Close(None)).await;
                    debug!("Hub session for {} closed locally", instrument);
                    return;
                }
                _ = ping.tick() => {
                    if let Err(e) = write.send(encode(json!({ "type": 6 }))).await {
                        break HubEvent::Error(format!("ping failed: {}", e));
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let mut closed = None;
                        for frame in parse_hub_frames(&text) {
                            match frame {
                                HubFrame::Trades { contract_id, ticks } => {
                                    if contract_id != instrument.as_str() || ticks.is_empty() {
                                        continue;
                                    }
                                    if events.send(HubEvent::Trades(ticks)).is_err() {
                                        return;
                                    }
                                }
                                HubFrame::Close { error } => closed = Some(error),
                                HubFrame::Handshake { error: Some(err) } => {
                                    warn!("Hub error for {}: {}", instrument, err)
                                }
                                _ => {}
                            }
                        }
                        if let Some(error) = closed {
                            break HubEvent::Closed(error);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            break HubEvent::Error(format!("pong failed: {}", e));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break HubEvent::Closed(frame.map(|f| f.reason.to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break HubEvent::Error(e.to_string()),
                    None => break HubEvent::Closed(None),
                },
            }
        };

        info!("Hub session for {} ended: {:?}", instrument, ended);
        let _ = events.send(ended);
    }
}

#[async_trait]
impl MarketHub for TopstepMarketHub {
    async fn connect(&self, instrument: &InstrumentKey, token: &str) -> Result<HubConnection> {
        let ws = tokio::time::timeout(self.handshake_timeout, self.open(instrument, token))
            .await
            .map_err(|_| {
                TrailgateError::MarketDataUnavailable(format!(
                    "hub connect for {} timed out after {:?}",
                    instrument, self.handshake_timeout
                ))
            })??;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        tokio::spawn(Self::run_session(
            instrument.clone(),
            ws,
            events_tx,
            close_rx,
            self.ping_interval,
        ));
        info!("Market hub subscribed to trades for {}", instrument);
        Ok(HubConnection::new(events_rx, Some(close_tx)))
    }
}
