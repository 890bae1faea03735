//! TopstepX REST adapter.
//!
//! Every endpoint is a JSON `POST` under `/api/...` authenticated with the
//! bearer token held in the shared [`CredentialStore`]. Idempotent reads are
//! retried with exponential backoff on connect errors and 5xx; order
//! placement is never retried here because a timed-out placement may already
//! be live (the reconciliation resolver decides).

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::BrokerConfig;
use crate::domain::{
    InstrumentKey, OpenOrder, OrderId, OrderKind, OrderRequest, PlacedOrder, PositionSnapshot,
    Side,
};
use crate::error::{Result, TrailgateError};
use crate::exchange::{BrokerClient, ContractLookup};
use crate::supervisor::{Authenticator, CredentialStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Safe to repeat: searches, cancels, login
    Idempotent,
    /// Single attempt: anything that can create exposure
    Once,
}

pub struct TopstepClient {
    http: Client,
    base_url: String,
    username: String,
    api_key: Zeroizing<String>,
    account_name: Option<String>,
    credentials: Arc<CredentialStore>,
    account_id: OnceLock<i64>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl TopstepClient {
    pub fn new(cfg: &BrokerConfig, credentials: Arc<CredentialStore>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("trailgate/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(cfg.connect_timeout())
            .timeout(cfg.request_timeout())
            .build()
            .map_err(|e| {
                TrailgateError::Internal(format!("failed to build TopstepX HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            base_url: cfg.api_base.trim_end_matches('/').to_string(),
            username: cfg.username.clone(),
            api_key: Zeroizing::new(cfg.api_key.clone()),
            account_name: cfg.account_name.clone(),
            credentials,
            account_id: OnceLock::new(),
            max_retries: cfg.max_retries,
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
        })
    }

    /// Build, log in and select the trading account.
    pub async fn connect(cfg: &BrokerConfig, credentials: Arc<CredentialStore>) -> Result<Self> {
        let client = Self::new(cfg, credentials)?;
        let token = client.login().await?;
        client.credentials.set_token(token).await;
        info!("Authenticated with TopstepX as {}", client.username);

        let account_id = client.select_account().await?;
        // first and only initialization
        let _ = client.account_id.set(account_id);
        Ok(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn account_id(&self) -> Result<i64> {
        self.account_id
            .get()
            .copied()
            .ok_or_else(|| TrailgateError::Auth("no trading account selected".into()))
    }

    async fn request_json(&self, path: &str, body: &Value, require_auth: bool) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .post(&url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .json(body);

        if require_auth {
            let token = self.credentials.token().await;
            if token.is_empty() {
                return Err(TrailgateError::Auth(format!(
                    "no session token for {}",
                    path
                )));
            }
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status.as_u16() == 429 {
            return Err(TrailgateError::RateLimited(format!(
                "TopstepX rate limited POST {}",
                path
            )));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(TrailgateError::Auth(format!(
                "TopstepX POST {} rejected credentials: status={}",
                path, status
            )));
        }

        let status_err = resp.error_for_status_ref().err();
        let text = resp.text().await?;
        if let Some(err) = status_err {
            warn!("TopstepX POST {} failed: status={} body={}", path, status, text);
            return Err(err.into());
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            TrailgateError::Broker(format!("invalid TopstepX JSON from {}: {}", path, e))
        })
    }

    async fn post(&self, path: &str, body: Value, retry: Retry) -> Result<Value> {
        self.post_with_auth(path, body, retry, true).await
    }

    async fn post_with_auth(
        &self,
        path: &str,
        body: Value,
        retry: Retry,
        require_auth: bool,
    ) -> Result<Value> {
        let mut attempt = 0;
        loop {
            match self.request_json(path, &body, require_auth).await {
                Err(e) if retry == Retry::Idempotent
                    && attempt < self.max_retries
                    && Self::is_retryable(&e) =>
                {
                    let wait = self.retry_backoff * 2u32.saturating_pow(attempt);
                    debug!(
                        "POST {} attempt {} failed ({}); retrying in {:?}",
                        path,
                        attempt + 1,
                        e,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn is_retryable(err: &TrailgateError) -> bool {
        match err {
            TrailgateError::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.status().map_or(false, |s| s.is_server_error())
            }
            _ => false,
        }
    }

    /// Body-level failure flag: `{"success": false, "errorMessage": ...}`.
    fn body_error(root: &Value) -> Option<String> {
        match root.get("success").and_then(Value::as_bool) {
            Some(false) => Some(
                Self::pick_str(root, &["errorMessage", "message"])
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        format!(
                            "errorCode={}",
                            root.get("errorCode").cloned().unwrap_or(Value::Null)
                        )
                    }),
            ),
            _ => None,
        }
    }

    fn ensure_success(root: Value, what: &str) -> Result<Value> {
        match Self::body_error(&root) {
            Some(msg) => Err(TrailgateError::Broker(format!("{} failed: {}", what, msg))),
            None => Ok(root),
        }
    }

    async fn select_account(&self) -> Result<i64> {
        let resp = self
            .post(
                "/api/Account/search",
                json!({ "onlyActiveAccounts": true }),
                Retry::Idempotent,
            )
            .await?;
        let resp = Self::ensure_success(resp, "account search")?;
        let accounts = Self::pick_array(&resp, &["accounts"]).unwrap_or(&[]);

        let chosen = match &self.account_name {
            Some(name) => accounts.iter().find(|a| {
                Self::pick_str(a, &["name"]).map_or(false, |n| n.eq_ignore_ascii_case(name))
            }),
            None => accounts.first(),
        };
        let account = chosen.ok_or_else(|| {
            TrailgateError::Auth(match &self.account_name {
                Some(name) => format!("account '{}' not found among active accounts", name),
                None => "no active accounts".to_string(),
            })
        })?;
        let id = account
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| TrailgateError::Broker("account without numeric id".into()))?;

        info!(
            "Using account {} ({})",
            id,
            Self::pick_str(account, &["name"]).unwrap_or("unnamed")
        );
        Ok(id)
    }

    fn order_payload(&self, request: &OrderRequest) -> Result<Value> {
        let mut payload = json!({
            "accountId": self.account_id()?,
            "contractId": request.instrument.as_str(),
            "type": request.kind.wire(),
            "side": request.side.wire(),
            "size": request.size,
        });
        let prices = [
            ("limitPrice", request.limit_price),
            ("stopPrice", request.stop_price),
            ("trailPrice", request.trail_price),
        ];
        for (key, price) in prices {
            if let Some(price) = price {
                payload[key] = Self::price_value(price)?;
            }
        }
        Ok(payload)
    }

    fn price_value(price: Decimal) -> Result<Value> {
        price
            .to_f64()
            .map(Value::from)
            .ok_or_else(|| TrailgateError::Validation(format!("price {} not representable", price)))
    }

    fn pick_array<'a>(root: &'a Value, keys: &[&str]) -> Option<&'a [Value]> {
        keys.iter()
            .find_map(|key| root.get(*key).and_then(|v| v.as_array()).map(Vec::as_slice))
    }

    fn pick_obj<'a>(root: &'a Value, keys: &[&str]) -> Option<&'a Value> {
        keys.iter()
            .find_map(|key| root.get(*key).filter(|v| !v.is_null()))
    }

    fn pick_str<'a>(root: &'a Value, keys: &[&str]) -> Option<&'a str> {
        Self::pick_obj(root, keys).and_then(|v| v.as_str())
    }

    /// Ids arrive as numbers or strings depending on the endpoint.
    fn pick_id(root: &Value, keys: &[&str]) -> Option<String> {
        Self::pick_obj(root, keys).and_then(|v| match v {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
    }

    fn pick_contract_id(root: &Value) -> Option<String> {
        Self::pick_id(root, &["contractId"])
            .or_else(|| root.get("contract").and_then(|c| Self::pick_id(c, &["id"])))
    }

    fn parse_decimalish(value: &Value) -> Option<Decimal> {
        match value {
            Value::Null => None,
            Value::String(s) => Decimal::from_str_exact(s.trim()).ok(),
            Value::Number(n) => Decimal::from_str_exact(&n.to_string())
                .ok()
                .or_else(|| n.as_f64().and_then(Decimal::from_f64_retain)),
            _ => None,
        }
    }

    fn pick_int(root: &Value, keys: &[&str]) -> Option<i64> {
        Self::pick_obj(root, keys).and_then(|v| match v {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub(crate) fn parse_open_order(raw: &Value) -> Option<OpenOrder> {
        let order_id = Self::pick_id(raw, &["id", "orderId"])?;
        let instrument = Self::pick_contract_id(raw)?;
        let kind = Self::pick_int(raw, &["type", "orderType"]).and_then(OrderKind::from_wire);
        let side = Self::pick_int(raw, &["side"]).and_then(Side::from_wire);
        let size = Self::pick_int(raw, &["size"])
            .and_then(|s| u32::try_from(s).ok())
            .unwrap_or(0);
        let limit_price = Self::pick_obj(raw, &["limitPrice", "price"])
            .and_then(Self::parse_decimalish)
            .filter(|p| !p.is_zero());
        let stop_price = Self::pick_obj(raw, &["stopPrice"])
            .and_then(Self::parse_decimalish)
            .filter(|p| !p.is_zero());

        Some(OpenOrder {
            order_id: OrderId::new(order_id),
            instrument: InstrumentKey::new(instrument),
            kind,
            side,
            size,
            limit_price,
            stop_price,
        })
    }

    /// Signed net quantity from whichever field the payload carries.
    pub(crate) fn extract_net_qty(raw: &Value) -> i64 {
        for key in ["net", "netQty", "size", "quantityNet", "qtyNet"] {
            if let Some(n) = raw.get(key).and_then(Value::as_f64) {
                return n as i64;
            }
        }
        let long = Self::pick_int(raw, &["longQty"]).unwrap_or(0);
        let short = Self::pick_int(raw, &["shortQty"]).unwrap_or(0);
        long - short
    }

    pub(crate) fn parse_position(raw: &Value) -> Option<PositionSnapshot> {
        Some(PositionSnapshot {
            instrument: InstrumentKey::new(Self::pick_contract_id(raw)?),
            net_quantity: Self::extract_net_qty(raw),
        })
    }
}

#[async_trait]
impl Authenticator for TopstepClient {
    async fn login(&self) -> Result<String> {
        let resp = self
            .post_with_auth(
                "/api/Auth/loginKey",
                json!({ "userName": self.username, "apiKey": self.api_key.as_str() }),
                Retry::Idempotent,
                false,
            )
            .await?;
        if let Some(msg) = Self::body_error(&resp) {
            return Err(TrailgateError::Auth(format!("login rejected: {}", msg)));
        }
        Self::pick_str(&resp, &["token"])
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or_else(|| TrailgateError::Auth("login response without token".into()))
    }
}

#[async_trait]
impl ContractLookup for TopstepClient {
    async fn search_contract(&self, symbol: &str) -> Result<InstrumentKey> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let resp = self
            .post(
                "/api/Contract/search",
                json!({ "searchText": symbol, "live": false }),
                Retry::Idempotent,
            )
            .await?;
        let resp = Self::ensure_success(resp, "contract search")?;

        Self::pick_array(&resp, &["contracts"])
            .unwrap_or(&[])
            .iter()
            .find(|c| {
                Self::pick_str(c, &["name"])
                    .map_or(false, |n| n.to_ascii_uppercase().starts_with(&symbol))
            })
            .and_then(|c| Self::pick_id(c, &["id"]))
            .map(InstrumentKey::new)
            .ok_or_else(|| {
                TrailgateError::ContractResolution(format!("no contract found for {}", symbol))
            })
    }
}

#[async_trait]
impl BrokerClient for TopstepClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder> {
        let payload = self.order_payload(request)?;
        let resp = match self.post("/api/Order/place", payload, Retry::Once).await {
            Ok(resp) => resp,
            Err(TrailgateError::Http(e)) if e.is_timeout() => {
                return Err(TrailgateError::SubmissionTimeout(format!(
                    "{} {} x{} on {}: {}",
                    request.kind, request.side, request.size, request.instrument, e
                )))
            }
            Err(e) => return Err(e),
        };
        if let Some(msg) = Self::body_error(&resp) {
            return Err(TrailgateError::OrderRejected(format!(
                "{} {} x{} on {}: {}",
                request.kind, request.side, request.size, request.instrument, msg
            )));
        }

        let order_id = Self::pick_id(&resp, &["orderId", "id"]).ok_or_else(|| {
            TrailgateError::Broker(format!("order placed without id: {}", resp))
        })?;
        info!(
            "{} placed: {} x{} on {} (id={})",
            request.kind, request.side, request.size, request.instrument, order_id
        );
        Ok(PlacedOrder {
            order_id: OrderId::new(order_id),
            raw: resp,
        })
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<()> {
        let id = order_id
            .as_str()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(order_id.as_str()));
        let resp = self
            .post(
                "/api/Order/cancel",
                json!({ "accountId": self.account_id()?, "orderId": id }),
                Retry::Idempotent,
            )
            .await?;
        Self::ensure_success(resp, "order cancel")?;
        Ok(())
    }

    async fn search_open_orders(&self) -> Result<Vec<OpenOrder>> {
        let resp = self
            .post(
                "/api/Order/searchOpen",
                json!({ "accountId": self.account_id()? }),
                Retry::Idempotent,
            )
            .await?;
        let resp = Self::ensure_success(resp, "open order search")?;
        Ok(Self::pick_array(&resp, &["orders"])
            .unwrap_or(&[])
            .iter()
            .filter_map(Self::parse_open_order)
            .collect())
    }

    async fn search_open_positions(&self) -> Result<Vec<PositionSnapshot>> {
        let resp = self
            .post(
                "/api/Position/searchOpen",
                json!({ "accountId": self.account_id()? }),
                Retry::Idempotent,
            )
            .await?;
        let resp = Self::ensure_success(resp, "position search")?;
        let rows = match &resp {
            Value::Array(rows) => rows.as_slice(),
            other => Self::pick_array(other, &["positions"]).unwrap_or(&[]),
        };
        Ok(rows.iter().filter_map(Self::parse_position).collect())
    }

    async fn close_position(&self, instrument: &InstrumentKey) -> Result<()> {
        let result = self
            .post(
                "/api/Position/closeContract",
                json!({ "accountId": self.account_id()?, "contractId": instrument.as_str() }),
                Retry::Once,
            )
            .await;
        match result {
            Ok(resp) => {
                match Self::body_error(&resp) {
                    Some(msg) => info!("closeContract for {} declined ({}); likely flat", instrument, msg),
                    None => info!("closeContract accepted for {}", instrument),
                }
                Ok(())
            }
            Err(TrailgateError::Http(e)) if e.status().map_or(false, |s| s.is_client_error()) => {
                info!(
                    "closeContract returned {:?} for {}; tolerated (likely already flat)",
                    e.status(),
                    instrument
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn client() -> TopstepClient {
        let cfg = crate::config::BrokerConfig {
            api_base: "https://api.example.test/".into(),
            hub_url: "wss://rtc.example.test/hubs/market".into(),
            username: "trader".into(),
            api_key: "key".into(),
            account_name: None,
            connect_timeout_ms: 1_000,
            request_timeout_ms: 1_000,
            max_retries: 0,
            retry_backoff_ms: 10,
        };
        TopstepClient::new(&cfg, Arc::new(CredentialStore::default())).unwrap()
    }

    #[test]
    fn test_parse_open_order_handles_nested_contract_and_string_ids() {
        let raw = json!({
            "orderId": "9001",
            "contract": { "id": "CON.F.US.MNQ.Z25" },
            "type": 1,
            "side": 0,
            "size": 2,
            "price": 21000.0
        });
        let order = TopstepClient::parse_open_order(&raw).unwrap();
        assert_eq!(order.order_id, OrderId::from(9001));
        assert_eq!(order.instrument, InstrumentKey::from("CON.F.US.MNQ.Z25"));
        assert_eq!(order.kind, Some(OrderKind::Limit));
        assert_eq!(order.side, Some(Side::Buy));
        assert_eq!(order.size, 2);
        assert_eq!(order.limit_price, Some(dec!(21000)));
        assert_eq!(order.stop_price, None);
    }

    #[test]
    fn test_parse_open_order_stop_kinds() {
        let raw = json!({
            "id": 17, "contractId": "X", "type": 4, "side": 1, "size": 1,
            "limitPrice": null, "stopPrice": 20990.25
        });
        let order = TopstepClient::parse_open_order(&raw).unwrap();
        assert_eq!(order.kind, Some(OrderKind::Stop));
        assert_eq!(order.reference_price(), Some(dec!(20990.25)));

        assert!(TopstepClient::parse_open_order(&json!({ "contractId": "X" })).is_none());
    }

    #[test]
    fn test_extract_net_qty_shapes() {
        assert_eq!(TopstepClient::extract_net_qty(&json!({ "net": -3 })), -3);
        assert_eq!(TopstepClient::extract_net_qty(&json!({ "netQty": 2.0 })), 2);
        assert_eq!(TopstepClient::extract_net_qty(&json!({ "size": 4 })), 4);
        assert_eq!(TopstepClient::extract_net_qty(&json!({ "qtyNet": 1 })), 1);
        assert_eq!(
            TopstepClient::extract_net_qty(&json!({ "longQty": 1, "shortQty": "3" })),
            -2
        );
        assert_eq!(TopstepClient::extract_net_qty(&json!({})), 0);
    }

    #[test]
    fn test_body_error_reads_message_or_code() {
        assert_eq!(
            TopstepClient::body_error(&json!({ "success": false, "errorMessage": "margin" })),
            Some("margin".to_string())
        );
        assert_eq!(
            TopstepClient::body_error(&json!({ "success": false, "errorCode": 2 })),
            Some("errorCode=2".to_string())
        );
        assert_eq!(TopstepClient::body_error(&json!({ "success": true })), None);
    }

    #[test]
    fn test_order_payload_requires_account_and_carries_price_fields() {
        let c = client();
        let req = OrderRequest::trailing_stop(InstrumentKey::from("X"), Side::Sell, 4, dec!(21040.25));
        assert!(matches!(c.order_payload(&req), Err(TrailgateError::Auth(_))));

        c.account_id.set(42).unwrap();
        let payload = c.order_payload(&req).unwrap();
        assert_eq!(payload["accountId"], 42);
        assert_eq!(payload["type"], 5);
        assert_eq!(payload["side"], 1);
        assert_eq!(payload["size"], 4);
        assert_eq!(payload["trailPrice"], 21040.25);
        assert!(payload.get("limitPrice").is_none());
        assert_eq!(c.base_url(), "https://api.example.test");
    }
}
