use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::api::alert::{parse_alert, AlertIntent, ParsedAlert};
use crate::api::state::AppState;
use crate::coordination::GateRejection;
use crate::domain::{make_tag, round_ticks_half_up, CloseSignal, EntrySignal, InstrumentKey};
use crate::error::TrailgateError;
use crate::services::{CloseOutcome, EntryOutcome};

pub type Reply = (StatusCode, Json<Value>);

fn reply(status: StatusCode, body: Value) -> Reply {
    (status, Json(body))
}

fn error_reply(status: StatusCode, message: impl Into<String>) -> Reply {
    reply(status, json!({ "error": message.into() }))
}

/// Decimal as a JSON number, falling back to its string form.
fn num(value: Decimal) -> Value {
    value
        .to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(value.to_string()))
}

fn skipped(rejection: &GateRejection, instrument: Option<&InstrumentKey>) -> Reply {
    let mut body = json!({
        "status": "skipped",
        "reason": rejection.reason(),
    });
    if let Some(instrument) = instrument {
        body["contractId"] = json!(instrument.as_str());
    }
    match rejection {
        GateRejection::StaleVsClose {
            entry_ts_ms,
            last_close_ts_ms,
        } => {
            body["entryTs"] = json!(entry_ts_ms);
            body["lastCloseTs"] = json!(last_close_ts_ms);
        }
        GateRejection::InCloseHoldoff { remaining } => {
            body["remainingMs"] = json!(remaining.as_millis() as u64);
        }
        GateRejection::NoTradeWindow => {}
    }
    reply(StatusCode::OK, body)
}

/// Alert text from a raw body or a `{"message": "..."}` envelope.
pub fn alert_text(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => match map.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => body.to_string(),
        },
        _ => body.to_string(),
    }
}

fn status_for(err: &TrailgateError) -> StatusCode {
    match err {
        TrailgateError::Parse(_)
        | TrailgateError::Validation(_)
        | TrailgateError::ContractResolution(_) => StatusCode::BAD_REQUEST,
        TrailgateError::SubmissionUnconfirmed(_) => StatusCode::GATEWAY_TIMEOUT,
        e if e.is_ambiguous_timeout() => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /webhook
pub async fn webhook_handler(State(state): State<AppState>, body: String) -> Reply {
    let now = Utc::now();
    if let Err(rejection) = state.orchestrator.gate().check_session(now) {
        info!("Webhook ignored: {}", rejection);
        return skipped(&rejection, None);
    }

    let text = alert_text(&body);
    let alert = match parse_alert(&text) {
        Ok(alert) => alert,
        Err(e) => {
            warn!("Unparseable alert {:?}: {}", text, e);
            return error_reply(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    let instrument = match state
        .contracts
        .resolve_ticker(&alert.ticker, state.lookup.as_ref(), now)
        .await
    {
        Ok(key) => key,
        Err(e) => {
            error!("Contract lookup failed for {}: {}", alert.ticker, e);
            return error_reply(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    match alert.intent() {
        AlertIntent::Close => close(&state, &alert, instrument).await,
        AlertIntent::Exit => {
            info!("Exit alert for {} ignored", alert.ticker);
            reply(
                StatusCode::OK,
                json!({ "status": "skipped", "reason": "exit signal" }),
            )
        }
        AlertIntent::Entry => entry(&state, &alert, instrument).await,
    }
}

async fn close(state: &AppState, alert: &ParsedAlert, instrument: InstrumentKey) -> Reply {
    let signal = CloseSignal {
        instrument: instrument.clone(),
        signal_ts_ms: alert.ts_ms,
        tag: make_tag(&alert.ticker, "close"),
    };

    match state.orchestrator.handle_close_signal(signal).await {
        Ok(CloseOutcome::Closed(report)) => {
            let ids: Vec<&str> = report.canceled_orders.iter().map(|id| id.as_str()).collect();
            reply(
                StatusCode::OK,
                json!({
                    "status": "close_done",
                    "tag": report.tag,
                    "contractId": report.instrument.as_str(),
                    "flat": report.flat,
                    "netAfter": report.net_after,
                    "canceledWatchers": report.canceled_watchers,
                    "canceledOrders": ids.len(),
                    "canceledOrderIds": ids,
                }),
            )
        }
        Ok(CloseOutcome::Skipped(rejection)) => skipped(&rejection, Some(&instrument)),
        Err(e) => {
            error!("Close on {} failed: {}", instrument, e);
            error_reply(status_for(&e), e.to_string())
        }
    }
}

async fn entry(state: &AppState, alert: &ParsedAlert, instrument: InstrumentKey) -> Reply {
    let Some(atr_ticks) = alert.atr_ticks else {
        return error_reply(
            StatusCode::BAD_REQUEST,
            "ATR not found; expected 'entry|atr=7' (ticks)",
        );
    };
    let tick = state.tick_size();
    let atr_points = atr_ticks * tick;

    let signal = EntrySignal {
        instrument: instrument.clone(),
        side: alert.side,
        size: alert.size,
        entry_price: alert.entry_price,
        trigger_offset: atr_points,
        stop_loss: alert.stop_loss,
        signal_ts_ms: alert.ts_ms,
        tag: make_tag(&alert.ticker, alert.side.as_str()),
    };

    match state.orchestrator.handle_entry_signal(signal).await {
        Ok(EntryOutcome::Placed(placed)) => reply(
            StatusCode::OK,
            json!({
                "status": "ok",
                "tag": placed.tag,
                "contractId": placed.instrument.as_str(),
                "limitOrderId": placed.entry_order_id.as_str(),
                "marketOrderId": placed.market_order_id.as_ref().map(|id| id.as_str()),
                "size": placed.plan.limit_size(),
                "entryPrice": num(placed.entry_price),
                "trigger": num(placed.trigger_price),
                "stopLoss": placed.stop_loss.map(num),
                "atr": {
                    "ticksRaw": num(atr_ticks),
                    "ticksRounded": num(round_ticks_half_up(atr_ticks)),
                    "points": num(atr_points),
                },
                "parsed": {
                    "direction": alert.side.as_str(),
                    "size": alert.size,
                    "ticker": alert.ticker,
                    "comment": alert.comment,
                    "ts_ms": alert.ts_ms,
                },
            }),
        ),
        Ok(EntryOutcome::Skipped(rejection)) => skipped(&rejection, Some(&instrument)),
        Err(e) => {
            let status = status_for(&e);
            if status == StatusCode::GATEWAY_TIMEOUT {
                reply(
                    status,
                    json!({ "error": "timeout_unconfirmed", "detail": e.to_string() }),
                )
            } else {
                error!("Entry on {} failed: {}", instrument, e);
                error_reply(status, e.to_string())
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StreamHealth {
    pub contract_id: String,
    pub connected: bool,
    pub last_tick_age_ms: Option<u64>,
    pub listeners: usize,
    pub watchers: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: i64,
    pub trading_paused: bool,
    pub cached_contracts: usize,
    pub active_watchers: usize,
    pub streams: Vec<StreamHealth>,
}

/// GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let orchestrator = &state.orchestrator;
    let mut streams = Vec::new();
    for stream in orchestrator.streams().all() {
        streams.push(StreamHealth {
            contract_id: stream.instrument().to_string(),
            connected: stream.is_connected(),
            last_tick_age_ms: stream
                .last_tick_age()
                .await
                .map(|age| age.as_millis() as u64),
            listeners: stream.listener_count().await,
            watchers: orchestrator.watchers().active_count(stream.instrument()),
        });
    }

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.uptime_seconds(),
        trading_paused: orchestrator.gate().check_session(Utc::now()).is_err(),
        cached_contracts: state.contracts.cached(),
        active_watchers: orchestrator.watchers().total_active(),
        streams,
    })
}
