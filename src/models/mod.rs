use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order / position side. `Buy` is a long position, `Sell` a short one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for long, -1 for short: multiplies a price delta into a PnL delta
    pub fn direction(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    pub fn parse(raw: &str) -> Option<Side> {
        match raw {
            "Buy" | "buy" | "BUY" | "Long" | "long" => Some(Side::Buy),
            "Sell" | "sell" | "SELL" | "Short" | "short" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Order book, best levels first on both sides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// A public trade print
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub timestamp: DateTime<Utc>,
}

/// Wallet state, fetched once per sizing decision
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AccountSnapshot {
    pub available_balance: f64,
    pub equity: f64,
    pub used_margin: f64,
    pub free_margin: f64,
}

/// A realized trade as reported by the venue. Immutable once observed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClosedTrade {
    pub order_id: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    pub fn is_loss(&self) -> bool {
        self.realized_pnl < 0.0
    }
}

/// Position as the venue reports it
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: Option<Side>, // None when the venue reports a flat slot
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: f64,
    pub unrealised_pnl: f64,
}

impl VenuePosition {
    pub fn is_open(&self) -> bool {
        self.side.is_some() && self.size > 0.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimeInForce {
    GoodTillCancel,
    ImmediateOrCancel,
    PostOnly,
}

impl TimeInForce {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeInForce::GoodTillCancel => "GTC",
            TimeInForce::ImmediateOrCancel => "IOC",
            TimeInForce::PostOnly => "PostOnly",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub order_link_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub order_link_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Other,
}

impl OrderStatus {
    pub fn parse(raw: &str) -> OrderStatus {
        match raw {
            "New" | "Created" | "Untriggered" => OrderStatus::New,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Filled" => OrderStatus::Filled,
            "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderStatus::Cancelled,
            "Rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Other,
        }
    }

    pub fn is_dead(self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Rejected)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderDetail {
    pub order_id: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub avg_price: f64,
    pub cum_exec_qty: f64,
    pub status: OrderStatus,
}

/// Everything one evaluation cycle needs, fetched up front
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: f64,
    pub candles: Vec<Candle>, // oldest first
    pub order_book: OrderBook,
    pub executions: Vec<Execution>,
    pub taken_at: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

/// Entry decision plus the sub-signals that produced it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub side: Side,
    pub trend: Trend,
    pub volume: bool,
    pub order_book: bool,
    pub liquidity: bool,
}
