use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::types::{
    parse_kline_row, Envelope, ListResult, RawClosedPnl, RawOrder, RawOrderAck, RawOrderBook,
    RawPosition, RawTicker, RawTrade, RawWallet, LEVERAGE_NOT_MODIFIED, RATE_LIMIT_CODE,
    SERVER_TIMEOUT_CODES,
};
use super::Exchange;
use crate::config::ExchangeConfig;
use crate::error::BotError;
use crate::models::{
    AccountSnapshot, Candle, ClosedTrade, Execution, OrderAck, OrderBook, OrderDetail, OrderRequest,
    OrderType, Side, VenuePosition,
};
use crate::risk::precision::format_decimal;

const CATEGORY: &str = "linear";

// Type alias for the rate limiter to simplify signatures
type VenueRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

type HmacSha256 = Hmac<Sha256>;

/// API key pair, read from `BYBIT_API_KEY` / `BYBIT_API_SECRET`
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let key = std::env::var("BYBIT_API_KEY").ok().filter(|k| !k.is_empty())?;
        let secret = std::env::var("BYBIT_API_SECRET").ok().filter(|s| !s.is_empty())?;
        Some(Self::new(key, secret))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub recv_window_ms: u64,
    pub min_request_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl From<&ExchangeConfig> for ClientSettings {
    fn from(config: &ExchangeConfig) -> Self {
        Self {
            base_url: config.base_url(),
            recv_window_ms: config.recv_window_ms,
            min_request_interval: Duration::from_millis(config.min_request_interval_ms),
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

/// HMAC-SHA256 over `timestamp + api_key + recv_window + payload`, hex encoded
pub fn sign(secret: &str, timestamp: i64, api_key: &str, recv_window_ms: u64, payload: &str) -> Result<String, BotError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BotError::Configuration(format!("invalid API secret: {}", e)))?;
    mac.update(format!("{}{}{}{}", timestamp, api_key, recv_window_ms, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

enum Payload {
    Query(Vec<(&'static str, String)>),
    Body(Value),
}

/// Bybit v5 linear-perpetuals client
///
/// Every call waits on a shared governor limiter so consecutive requests are at
/// least `min_request_interval` apart, then retries rate-limit and transient
/// failures a bounded number of times with a fixed delay. Clones share the limiter.
#[derive(Clone)]
pub struct BybitClient {
    http: Client,
    settings: Arc<ClientSettings>,
    credentials: Option<Credentials>,
    rate_limiter: Option<Arc<VenueRateLimiter>>,
}

impl BybitClient {
    pub fn new(settings: ClientSettings, credentials: Option<Credentials>) -> Result<Self, BotError> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| BotError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        // A zero interval disables throttling (used by tests)
        let rate_limiter = Quota::with_period(settings.min_request_interval)
            .map(|quota| Arc::new(RateLimiter::direct(quota)));

        Ok(Self {
            http,
            settings: Arc::new(settings),
            credentials,
            rate_limiter,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: Vec<(&'static str, String)>,
        signed: bool,
    ) -> Result<T, BotError> {
        let value = self.make_request(Method::GET, path, Payload::Query(query), signed).await?;
        decode(path, value)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, BotError> {
        let value = self.make_request(Method::POST, path, Payload::Body(body), true).await?;
        decode(path, value)
    }

    /// Throttled request with bounded retries on rate limits and transient failures
    async fn make_request(
        &self,
        method: Method,
        path: &str,
        payload: Payload,
        signed: bool,
    ) -> Result<Value, BotError> {
        let max_retries = self.settings.max_retries;

        for attempt in 1..=max_retries {
            if let Some(limiter) = &self.rate_limiter {
                limiter.until_ready().await;
            }

            let err = match self.send_once(&method, path, &payload, signed, attempt).await {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt == max_retries {
                if let BotError::ExchangeRejected { code, message } = &err {
                    tracing::warn!("❌ {} {} rejected ({}): {}", method, path, code, message);
                }
                return Err(err);
            }

            tracing::warn!(
                "⚠️  {} {} failed ({}), retrying in {:?} (attempt {}/{})",
                method,
                path,
                err,
                self.settings.retry_delay,
                attempt,
                max_retries
            );
            tokio::time::sleep(self.settings.retry_delay).await;
        }

        Err(BotError::TransientNetwork {
            attempts: max_retries,
            reason: "no attempt made".to_string(),
        })
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        payload: &Payload,
        signed: bool,
        attempt: u32,
    ) -> Result<Value, BotError> {
        let (url, signed_payload, body) = match payload {
            Payload::Query(params) => {
                let query = params
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join("&");
                let url = if query.is_empty() {
                    format!("{}{}", self.settings.base_url, path)
                } else {
                    format!("{}{}?{}", self.settings.base_url, path, query)
                };
                (url, query, None)
            }
            Payload::Body(value) => {
                let body = serde_json::to_string(value)?;
                (format!("{}{}", self.settings.base_url, path), body.clone(), Some(body))
            }
        };

        let mut request = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.header("Content-Type", "application/json").body(body);
        }

        if signed {
            let credentials = self.credentials.as_ref().ok_or_else(|| {
                BotError::Configuration(format!("{} requires API credentials", path))
            })?;
            let timestamp = Utc::now().timestamp_millis();
            let signature = sign(
                &credentials.api_secret,
                timestamp,
                &credentials.api_key,
                self.settings.recv_window_ms,
                &signed_payload,
            )?;
            request = request
                .header("X-BAPI-API-KEY", &credentials.api_key)
                .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                .header("X-BAPI-RECV-WINDOW", self.settings.recv_window_ms.to_string())
                .header("X-BAPI-SIGN", signature);
        }

        let response = request.send().await.map_err(|e| BotError::TransientNetwork {
            attempts: attempt,
            reason: e.to_string(),
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| BotError::TransientNetwork {
            attempts: attempt,
            reason: e.to_string(),
        })?;

        if status.as_u16() == 429 {
            return Err(BotError::RateLimited { attempts: attempt });
        }
        if status.is_server_error() {
            return Err(BotError::TransientNetwork {
                attempts: attempt,
                reason: format!("HTTP {}", status),
            });
        }
        if !status.is_success() {
            return Err(BotError::ExchangeRejected {
                code: i64::from(status.as_u16()),
                message: text,
            });
        }

        let envelope: Envelope = serde_json::from_str(&text)
            .map_err(|e| BotError::Decode(format!("{}: {}", path, e)))?;

        classify(envelope, attempt)
    }
}

/// Map a Bybit envelope onto the error taxonomy
fn classify(envelope: Envelope, attempt: u32) -> Result<Value, BotError> {
    match envelope.ret_code {
        0 => Ok(envelope.result),
        RATE_LIMIT_CODE => Err(BotError::RateLimited { attempts: attempt }),
        code if SERVER_TIMEOUT_CODES.contains(&code) => Err(BotError::TransientNetwork {
            attempts: attempt,
            reason: format!("{} ({})", envelope.ret_msg, code),
        }),
        code => Err(BotError::ExchangeRejected {
            code,
            message: envelope.ret_msg,
        }),
    }
}

fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, BotError> {
    serde_json::from_value(value).map_err(|e| BotError::Decode(format!("{}: {}", path, e)))
}

fn linear(symbol: &str) -> Vec<(&'static str, String)> {
    vec![("category", CATEGORY.to_string()), ("symbol", symbol.to_string())]
}

#[derive(serde::Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<String>>,
}

#[async_trait]
impl Exchange for BybitClient {
    async fn positions(&self, symbol: &str) -> Result<Vec<VenuePosition>, BotError> {
        let result: ListResult<RawPosition> = self.get("/v5/position/list", linear(symbol), true).await?;
        result.list.into_iter().map(VenuePosition::try_from).collect()
    }

    async fn candles(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, BotError> {
        let mut query = linear(symbol);
        query.push(("interval", interval.to_string()));
        query.push(("limit", limit.to_string()));

        let result: KlineResult = self.get("/v5/market/kline", query, false).await?;
        // Bybit returns newest first
        let mut candles = result
            .list
            .iter()
            .map(|row| parse_kline_row(row))
            .collect::<Result<Vec<_>, _>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, BotError> {
        let mut query = linear(symbol);
        query.push(("limit", depth.to_string()));
        let raw: RawOrderBook = self.get("/v5/market/orderbook", query, false).await?;
        OrderBook::try_from(raw)
    }

    async fn recent_executions(&self, symbol: &str, limit: usize) -> Result<Vec<Execution>, BotError> {
        let mut query = linear(symbol);
        query.push(("limit", limit.to_string()));
        let result: ListResult<RawTrade> = self.get("/v5/market/recent-trade", query, false).await?;
        result.list.into_iter().map(Execution::try_from).collect()
    }

    async fn wallet_balance(&self, account_type: &str) -> Result<AccountSnapshot, BotError> {
        let query = vec![("accountType", account_type.to_string())];
        let result: ListResult<RawWallet> = self.get("/v5/account/wallet-balance", query, true).await?;
        let wallet = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| BotError::Decode(format!("no {} wallet in balance response", account_type)))?;
        AccountSnapshot::try_from(wallet)
    }

    async fn latest_price(&self, symbol: &str) -> Result<f64, BotError> {
        let result: ListResult<RawTicker> = self.get("/v5/market/tickers", linear(symbol), false).await?;
        let ticker = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| BotError::Decode(format!("no ticker for {}", symbol)))?;
        super::types::num("ticker.lastPrice", &ticker.last_price)
    }

    async fn set_leverage(&self, symbol: &str, buy: u32, sell: u32) -> Result<(), BotError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": buy.to_string(),
            "sellLeverage": sell.to_string(),
        });

        match self.post::<Value>("/v5/position/set-leverage", body).await {
            Ok(_) => Ok(()),
            Err(BotError::ExchangeRejected { code, .. }) if code == LEVERAGE_NOT_MODIFIED => {
                tracing::debug!("Leverage for {} already {}x/{}x", symbol, buy, sell);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, BotError> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "orderType": match request.order_type {
                OrderType::Market => "Market",
                OrderType::Limit => "Limit",
            },
            "qty": format_decimal(request.qty),
            "timeInForce": request.time_in_force.as_str(),
            "reduceOnly": request.reduce_only,
            "orderLinkId": request.order_link_id,
            "positionIdx": 0,
        });
        if let (Some(price), Some(map)) = (request.price, body.as_object_mut()) {
            map.insert("price".to_string(), Value::String(format_decimal(price)));
        }

        let ack: RawOrderAck = self.post("/v5/order/create", body).await?;
        Ok(ack.into())
    }

    async fn set_trading_stop(
        &self,
        symbol: &str,
        side: Side,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<(), BotError> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "positionIdx": 0,
            "tpslMode": "Full",
        });
        if let Some(map) = body.as_object_mut() {
            if let Some(sl) = stop_loss {
                map.insert("stopLoss".to_string(), Value::String(format_decimal(sl)));
            }
            if let Some(tp) = take_profit {
                map.insert("takeProfit".to_string(), Value::String(format_decimal(tp)));
            }
        }

        tracing::debug!("Setting trading stop on {} {}: SL {:?} TP {:?}", side, symbol, stop_loss, take_profit);
        self.post::<Value>("/v5/position/trading-stop", body).await?;
        Ok(())
    }

    async fn closed_pnl(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClosedTrade>, BotError> {
        let mut query = linear(symbol);
        query.push(("startTime", start.timestamp_millis().to_string()));
        query.push(("endTime", end.timestamp_millis().to_string()));
        query.push(("limit", limit.to_string()));

        let result: ListResult<RawClosedPnl> = self.get("/v5/position/closed-pnl", query, true).await?;
        result.list.into_iter().map(ClosedTrade::try_from).collect()
    }

    async fn order_detail(&self, symbol: &str, order_id: &str) -> Result<OrderDetail, BotError> {
        // Open orders live under realtime, filled/cancelled ones move to history
        for path in ["/v5/order/realtime", "/v5/order/history"] {
            let mut query = linear(symbol);
            query.push(("orderId", order_id.to_string()));
            let result: ListResult<RawOrder> = self.get(path, query, true).await?;
            if let Some(order) = result.list.into_iter().next() {
                return OrderDetail::try_from(order);
            }
        }

        Err(BotError::InsufficientData(format!("order {} not found", order_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_matches_reference_vector() {
        let signature = sign("secret", 1_700_000_000_000, "key", 5000, "category=linear&symbol=BTCUSDT").unwrap();
        assert_eq!(signature, "3906b813750309cce9879a975510651953382a28592d69104d0b599e3d201f40");
    }

    #[test]
    fn test_classify_codes() {
        let envelope = |code: i64| Envelope {
            ret_code: code,
            ret_msg: "msg".to_string(),
            result: json!({}),
        };

        assert!(classify(envelope(0), 1).is_ok());
        assert_eq!(classify(envelope(10006), 2), Err(BotError::RateLimited { attempts: 2 }));
        assert!(matches!(classify(envelope(10016), 1), Err(BotError::TransientNetwork { .. })));
        assert_eq!(
            classify(envelope(110007), 1),
            Err(BotError::ExchangeRejected {
                code: 110007,
                message: "msg".to_string()
            })
        );
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let debug = format!("{:?}", Credentials::new("key", "hunter2"));
        assert!(debug.contains("key"));
        assert!(!debug.contains("hunter2"));
    }
}
