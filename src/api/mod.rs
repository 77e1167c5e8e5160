pub mod bybit;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BotError;
use crate::models::{
    AccountSnapshot, Candle, ClosedTrade, Execution, OrderAck, OrderBook, OrderDetail, OrderRequest,
    Side, VenuePosition,
};

pub use bybit::{BybitClient, ClientSettings, Credentials};

/// Operations the engine needs from a linear-perpetuals venue.
///
/// Every call either returns its payload or a typed `BotError`; a business
/// rejection always surfaces as `BotError::ExchangeRejected`.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn positions(&self, symbol: &str) -> Result<Vec<VenuePosition>, BotError>;

    /// Candles oldest first
    async fn candles(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, BotError>;

    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, BotError>;

    /// Most recent public trades, newest first
    async fn recent_executions(&self, symbol: &str, limit: usize) -> Result<Vec<Execution>, BotError>;

    async fn wallet_balance(&self, account_type: &str) -> Result<AccountSnapshot, BotError>;

    async fn latest_price(&self, symbol: &str) -> Result<f64, BotError>;

    async fn set_leverage(&self, symbol: &str, buy: u32, sell: u32) -> Result<(), BotError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, BotError>;

    /// Attach (or move) stop-loss / take-profit on the position held on `side`
    async fn set_trading_stop(
        &self,
        symbol: &str,
        side: Side,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<(), BotError>;

    async fn closed_pnl(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClosedTrade>, BotError>;

    async fn order_detail(&self, symbol: &str, order_id: &str) -> Result<OrderDetail, BotError>;
}
