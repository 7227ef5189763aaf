//! MEXC spot v3 REST client
//!
//! Private endpoints are signed with HMAC-SHA256 over the query string
//! (`timestamp` and `recvWindow` included) and authenticated with the
//! `X-MEXC-APIKEY` header. Numeric fields arrive as strings.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use sha2::Sha256;

use super::{ExchangeClient, MarketData};
use crate::error::ExchangeError;
use crate::models::{
    Order, OrderRequest, OrderSide, OrderStatus, OrderType, SymbolInfo, Ticker,
};

pub const MEXC_API_BASE: &str = "https://api.mexc.com";
pub const API_KEY_HEADER: &str = "X-MEXC-APIKEY";
const DEFAULT_RECV_WINDOW_MS: u64 = 5000;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// MEXC error codes with a dedicated meaning
const CODE_ORDER_NOT_FOUND: i64 = -2013;
const CODE_INVALID_SYMBOL: i64 = -1121;

type HmacSha256 = Hmac<Sha256>;

/// API key pair
#[derive(Clone)]
pub struct MexcCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for MexcCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MexcCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Hex encoded HMAC-SHA256 of `message`
pub fn sign(secret: &str, message: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Other(format!("invalid signing key: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// URL-encode `params` and append `&signature=<hex>`
pub fn build_signed_query(params: &[(&str, String)], secret: &str) -> Result<String, ExchangeError> {
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let signature = sign(secret, &query)?;
    Ok(format!("{query}&signature={signature}"))
}

/// `BTC_USDT`, `btc-usdt` and `BTC/USDT` all become `BTCUSDT`
pub fn exchange_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | '/'))
        .collect::<String>()
        .to_uppercase()
}

/// MEXC REST client implementing both exchange contracts
#[derive(Clone)]
pub struct MexcClient {
    client: Client,
    base_url: String,
    credentials: MexcCredentials,
    recv_window_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<i64>,
    msg: Option<String>,
}

/// Order payload shared by place / query responses
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: serde_json::Value,
    client_order_id: Option<String>,
    price: Option<String>,
    orig_qty: Option<String>,
    executed_qty: Option<String>,
    cummulative_quote_qty: Option<String>,
    status: Option<String>,
    #[serde(rename = "type")]
    order_type: Option<String>,
    side: Option<String>,
    transact_time: Option<i64>,
    time: Option<i64>,
    update_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerResponse {
    last_price: String,
    volume: Option<String>,
    price_change_percent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolEntry {
    symbol: String,
    status: serde_json::Value,
    base_size_precision: Option<String>,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

impl MexcClient {
    pub fn new(credentials: MexcCredentials) -> Result<Self, ExchangeError> {
        Self::with_options(MEXC_API_BASE, credentials, DEFAULT_TIMEOUT, DEFAULT_RECV_WINDOW_MS)
    }

    pub fn with_options(
        base_url: impl Into<String>,
        credentials: MexcCredentials,
        timeout: Duration,
        recv_window_ms: u64,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Other(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            recv_window_ms,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a signed request and return the response body
    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<String, ExchangeError> {
        params.push(("recvWindow", self.recv_window_ms.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = build_signed_query(&params, &self.credentials.api_secret)?;
        let url = format!("{}{}?{}", self.base_url, path, query);

        tracing::debug!(method = %method, path, "Sending signed MEXC request");

        let response = self
            .client
            .request(method, &url)
            .header(API_KEY_HEADER, &self.credentials.api_key)
            .send()
            .await
            .map_err(map_transport_error)?;

        read_body(response).await
    }

    async fn public_request(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<String, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(map_transport_error)?;

        read_body(response).await
    }

    fn order_id_param(order_id: &str) -> (&'static str, String) {
        // Exchange ids are numeric; anything else is our client order id
        if order_id.chars().all(|c| c.is_ascii_digit()) && !order_id.is_empty() {
            ("orderId", order_id.to_string())
        } else {
            ("origClientOrderId", order_id.to_string())
        }
    }
}

#[async_trait]
impl ExchangeClient for MexcClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        if request.order_type == OrderType::StopLoss {
            return Err(ExchangeError::InvalidOrderRequest(
                "MEXC spot does not accept stop-loss orders".to_string(),
            ));
        }

        let client_order_id = format!("snipebot_{}", uuid::Uuid::new_v4().simple());
        let mut params = vec![
            ("symbol", exchange_symbol(&request.symbol)),
            ("side", request.side.as_str().to_string()),
            ("type", request.order_type.as_str().to_string()),
            ("quantity", format_decimal(request.quantity)),
            ("newClientOrderId", client_order_id.clone()),
        ];
        if request.order_type == OrderType::Limit {
            params.push(("price", format_decimal(request.price)));
            params.push(("timeInForce", request.time_in_force.as_str().to_string()));
        }

        let body = self.signed_request(Method::POST, "/api/v3/order", params).await?;
        let response: OrderResponse = decode(&body)?;

        let mut order = parse_order(response, &request.symbol)?;
        if order.client_order_id.is_none() {
            order.client_order_id = Some(client_order_id);
        }
        // Placement acks may omit these
        if order.quantity == 0.0 {
            order.quantity = request.quantity;
        }
        if order.price == 0.0 && request.order_type == OrderType::Limit {
            order.price = request.price;
        }
        order.side = request.side;
        order.order_type = request.order_type;
        Ok(order)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let params = vec![("symbol", exchange_symbol(symbol)), Self::order_id_param(order_id)];
        self.signed_request(Method::DELETE, "/api/v3/order", params)
            .await
            .map(|_| ())
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<Order, ExchangeError> {
        let params = vec![("symbol", exchange_symbol(symbol)), Self::order_id_param(order_id)];
        let body = self.signed_request(Method::GET, "/api/v3/order", params).await?;
        let response: OrderResponse = decode(&body)?;
        parse_order(response, symbol)
    }
}

#[async_trait]
impl MarketData for MexcClient {
    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let body = self
            .public_request("/api/v3/ticker/24hr", &[("symbol", exchange_symbol(symbol))])
            .await?;
        let response: TickerResponse = decode(&body)?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            price: parse_f64("lastPrice", &response.last_price)?,
            volume: parse_optional_f64("volume", response.volume.as_deref())?,
            percent_change: parse_optional_f64(
                "priceChangePercent",
                response.price_change_percent.as_deref(),
            )?,
        })
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError> {
        let wanted = exchange_symbol(symbol);
        let body = self
            .public_request("/api/v3/exchangeInfo", &[("symbol", wanted.clone())])
            .await?;
        let response: ExchangeInfoResponse = decode(&body)?;

        let entry = response
            .symbols
            .into_iter()
            .find(|entry| entry.symbol.eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| ExchangeError::SymbolNotSupported(symbol.to_string()))?;

        let min_qty = match entry.base_size_precision.as_deref() {
            Some(raw) => parse_f64("baseSizePrecision", raw)?,
            None => lot_size_min_qty(&entry.filters)?,
        };

        Ok(SymbolInfo {
            symbol: symbol.to_string(),
            status: normalize_symbol_status(&entry.status),
            min_qty,
        })
    }
}

/// `"1"`, `1` and `"ENABLED"` mean the symbol trades
fn normalize_symbol_status(raw: &serde_json::Value) -> String {
    let status = match raw {
        serde_json::Value::String(s) => s.trim().to_uppercase(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    };
    match status.as_str() {
        "1" | "ENABLED" | "TRADING" => SymbolInfo::TRADING.to_string(),
        _ => status,
    }
}

fn lot_size_min_qty(filters: &[serde_json::Value]) -> Result<f64, ExchangeError> {
    let min_qty = filters
        .iter()
        .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some("LOT_SIZE"))
        .and_then(|f| f.get("minQty"))
        .and_then(|q| q.as_str());
    match min_qty {
        Some(raw) => parse_f64("minQty", raw),
        None => Ok(0.0),
    }
}

async fn read_body(response: Response) -> Result<String, ExchangeError> {
    let status = response.status();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    let body = response.text().await.map_err(map_transport_error)?;

    if status.as_u16() >= 400 {
        return Err(map_http_error(status.as_u16(), headers, &body));
    }
    Ok(body)
}

fn map_http_error(status: u16, headers: HashMap<String, String>, body: &str) -> ExchangeError {
    let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|b| b.msg.clone())
        .unwrap_or_else(|| body.to_string());

    // Transient statuses stay HTTP errors so that they are retried
    if status != 429 && status < 500 {
        match parsed.as_ref().and_then(|b| b.code) {
            Some(CODE_ORDER_NOT_FOUND) => return ExchangeError::OrderNotFound,
            Some(CODE_INVALID_SYMBOL) => return ExchangeError::SymbolNotSupported(message),
            _ => {}
        }
    }

    ExchangeError::Http {
        status,
        message,
        headers,
    }
}

fn map_transport_error(err: reqwest::Error) -> ExchangeError {
    if err.is_timeout() {
        return ExchangeError::Timeout;
    }
    if is_connection_reset(&err) {
        return ExchangeError::ConnectionReset;
    }
    if err.is_connect() || err.is_request() {
        return ExchangeError::NetworkFailure(err.to_string());
    }
    if err.is_decode() || err.is_body() {
        return ExchangeError::Decode(err.to_string());
    }
    ExchangeError::Other(err.to_string())
}

fn is_connection_reset(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionReset {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, ExchangeError> {
    serde_json::from_str(body).map_err(|e| ExchangeError::Decode(e.to_string()))
}

fn parse_f64(field: &str, raw: &str) -> Result<f64, ExchangeError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| ExchangeError::Decode(format!("invalid {}: {:?}", field, raw)))
}

fn parse_optional_f64(field: &str, raw: Option<&str>) -> Result<f64, ExchangeError> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => parse_f64(field, raw),
        _ => Ok(0.0),
    }
}

fn format_decimal(value: f64) -> String {
    let formatted = format!("{:.8}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn millis_to_datetime(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn parse_order(response: OrderResponse, symbol: &str) -> Result<Order, ExchangeError> {
    let id = match &response.order_id {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        other => return Err(ExchangeError::Decode(format!("invalid orderId: {}", other))),
    };

    let side = match response.side.as_deref().map(str::to_ascii_uppercase).as_deref() {
        Some("BUY") | None => OrderSide::Buy,
        Some("SELL") => OrderSide::Sell,
        Some(other) => return Err(ExchangeError::Decode(format!("invalid side: {}", other))),
    };
    let order_type = match response.order_type.as_deref().map(str::to_ascii_uppercase).as_deref() {
        Some("MARKET") | None => OrderType::Market,
        Some("LIMIT") | Some("LIMIT_MAKER") | Some("IMMEDIATE_OR_CANCEL") | Some("FILL_OR_KILL") => {
            OrderType::Limit
        }
        Some("STOP_LOSS") | Some("STOP_LOSS_LIMIT") => OrderType::StopLoss,
        Some(other) => return Err(ExchangeError::Decode(format!("invalid type: {}", other))),
    };
    let status = match response.status.as_deref() {
        Some(raw) => OrderStatus::parse(raw)
            .ok_or_else(|| ExchangeError::Decode(format!("invalid status: {}", raw)))?,
        None => OrderStatus::New,
    };

    let quantity = parse_optional_f64("origQty", response.orig_qty.as_deref())?;
    let executed_qty = parse_optional_f64("executedQty", response.executed_qty.as_deref())?;
    let quote_qty = parse_optional_f64(
        "cummulativeQuoteQty",
        response.cummulative_quote_qty.as_deref(),
    )?;
    let limit_price = parse_optional_f64("price", response.price.as_deref())?;

    // Market orders report price 0; use the average fill price instead
    let price = if executed_qty > 0.0 && quote_qty > 0.0 {
        quote_qty / executed_qty
    } else {
        limit_price
    };

    let now = Utc::now();
    let created_at = millis_to_datetime(response.time.or(response.transact_time)).unwrap_or(now);
    let updated_at = millis_to_datetime(response.update_time).unwrap_or(created_at);

    Ok(Order {
        id,
        client_order_id: response.client_order_id,
        symbol: symbol.to_string(),
        side,
        order_type,
        quantity,
        executed_qty,
        price,
        status,
        created_at,
        updated_at,
    })
}
