//! Bybit v5 wire formats and their conversion into domain models.
//!
//! Bybit encodes every number as a string and uses "" for absent values.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::error::BotError;
use crate::models::{
    AccountSnapshot, BookLevel, Candle, ClosedTrade, Execution, OrderAck, OrderBook, OrderDetail,
    OrderStatus, Side, VenuePosition,
};

/// `retCode` for "too many visits"
pub const RATE_LIMIT_CODE: i64 = 10006;
/// `retCode` values that mean the venue itself failed or timed out
pub const SERVER_TIMEOUT_CODES: &[i64] = &[10000, 10016];
/// `retCode` for "leverage not modified"
pub const LEVERAGE_NOT_MODIFIED: i64 = 110043;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub ret_code: i64,
    #[serde(default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

pub(crate) fn num(field: &str, raw: &str) -> Result<f64, BotError> {
    if raw.is_empty() {
        return Ok(0.0);
    }
    raw.parse::<f64>()
        .map_err(|_| BotError::Decode(format!("{} is not a number: {:?}", field, raw)))
}

pub(crate) fn millis(field: &str, raw: &str) -> Result<DateTime<Utc>, BotError> {
    let ms = raw
        .parse::<i64>()
        .map_err(|_| BotError::Decode(format!("{} is not a timestamp: {:?}", field, raw)))?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| BotError::Decode(format!("{} out of range: {}", field, ms)))
}

fn side(field: &str, raw: &str) -> Result<Side, BotError> {
    Side::parse(raw).ok_or_else(|| BotError::Decode(format!("{} is not a side: {:?}", field, raw)))
}

/// One kline row: [start, open, high, low, close, volume, turnover]
pub fn parse_kline_row(row: &[String]) -> Result<Candle, BotError> {
    if row.len() < 6 {
        return Err(BotError::Decode(format!("kline row has {} fields", row.len())));
    }
    Ok(Candle {
        timestamp: millis("kline.start", &row[0])?,
        open: num("kline.open", &row[1])?,
        high: num("kline.high", &row[2])?,
        low: num("kline.low", &row[3])?,
        close: num("kline.close", &row[4])?,
        volume: num("kline.volume", &row[5])?,
    })
}

#[derive(Debug, Deserialize)]
pub struct RawOrderBook {
    #[serde(default)]
    pub b: Vec<[String; 2]>,
    #[serde(default)]
    pub a: Vec<[String; 2]>,
}

impl TryFrom<RawOrderBook> for OrderBook {
    type Error = BotError;

    fn try_from(raw: RawOrderBook) -> Result<Self, Self::Error> {
        let levels = |rows: &[[String; 2]]| -> Result<Vec<BookLevel>, BotError> {
            rows.iter()
                .map(|[price, size]| {
                    Ok(BookLevel {
                        price: num("orderbook.price", price)?,
                        size: num("orderbook.size", size)?,
                    })
                })
                .collect()
        };
        Ok(OrderBook {
            bids: levels(&raw.b)?,
            asks: levels(&raw.a)?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct RawTrade {
    pub price: String,
    pub size: String,
    pub side: String,
    pub time: String,
}

impl TryFrom<RawTrade> for Execution {
    type Error = BotError;

    fn try_from(raw: RawTrade) -> Result<Self, Self::Error> {
        Ok(Execution {
            side: side("trade.side", &raw.side)?,
            price: num("trade.price", &raw.price)?,
            size: num("trade.size", &raw.size)?,
            timestamp: millis("trade.time", &raw.time)?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub mark_price: String,
    #[serde(default)]
    pub leverage: String,
    #[serde(default)]
    pub unrealised_pnl: String,
}

impl TryFrom<RawPosition> for VenuePosition {
    type Error = BotError;

    fn try_from(raw: RawPosition) -> Result<Self, Self::Error> {
        Ok(VenuePosition {
            side: Side::parse(&raw.side),
            size: num("position.size", &raw.size)?,
            entry_price: num("position.avgPrice", &raw.avg_price)?,
            mark_price: num("position.markPrice", &raw.mark_price)?,
            leverage: num("position.leverage", &raw.leverage)?,
            unrealised_pnl: num("position.unrealisedPnl", &raw.unrealised_pnl)?,
            symbol: raw.symbol,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawWallet {
    #[serde(default)]
    pub total_equity: String,
    #[serde(default)]
    pub total_available_balance: String,
    #[serde(default)]
    pub total_initial_margin: String,
}

impl TryFrom<RawWallet> for AccountSnapshot {
    type Error = BotError;

    fn try_from(raw: RawWallet) -> Result<Self, Self::Error> {
        let available = num("wallet.totalAvailableBalance", &raw.total_available_balance)?;
        Ok(AccountSnapshot {
            available_balance: available,
            equity: num("wallet.totalEquity", &raw.total_equity)?,
            used_margin: num("wallet.totalInitialMargin", &raw.total_initial_margin)?,
            free_margin: available,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrderAck {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

impl From<RawOrderAck> for OrderAck {
    fn from(raw: RawOrderAck) -> Self {
        OrderAck {
            order_id: raw.order_id,
            order_link_id: raw.order_link_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawClosedPnl {
    pub order_id: String,
    pub side: String,
    #[serde(default)]
    pub qty: String,
    #[serde(default)]
    pub avg_entry_price: String,
    #[serde(default)]
    pub avg_exit_price: String,
    #[serde(default)]
    pub closed_pnl: String,
    pub updated_time: String,
}

impl TryFrom<RawClosedPnl> for ClosedTrade {
    type Error = BotError;

    fn try_from(raw: RawClosedPnl) -> Result<Self, Self::Error> {
        Ok(ClosedTrade {
            side: side("closedPnl.side", &raw.side)?,
            quantity: num("closedPnl.qty", &raw.qty)?,
            entry_price: num("closedPnl.avgEntryPrice", &raw.avg_entry_price)?,
            exit_price: num("closedPnl.avgExitPrice", &raw.avg_exit_price)?,
            realized_pnl: num("closedPnl.closedPnl", &raw.closed_pnl)?,
            closed_at: millis("closedPnl.updatedTime", &raw.updated_time)?,
            order_id: raw.order_id,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrder {
    pub order_id: String,
    pub side: String,
    #[serde(default)]
    pub qty: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub cum_exec_qty: String,
    #[serde(default)]
    pub order_status: String,
}

impl TryFrom<RawOrder> for OrderDetail {
    type Error = BotError;

    fn try_from(raw: RawOrder) -> Result<Self, Self::Error> {
        Ok(OrderDetail {
            side: side("order.side", &raw.side)?,
            qty: num("order.qty", &raw.qty)?,
            price: num("order.price", &raw.price)?,
            avg_price: num("order.avgPrice", &raw.avg_price)?,
            cum_exec_qty: num("order.cumExecQty", &raw.cum_exec_qty)?,
            status: OrderStatus::parse(&raw.order_status),
            order_id: raw.order_id,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTicker {
    pub last_price: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kline_row() {
        let row: Vec<String> = ["1700000000000", "100", "110", "95", "105", "12.5", "1300"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let candle = parse_kline_row(&row).unwrap();
        assert_eq!(candle.close, 105.0);
        assert_eq!(candle.volume, 12.5);
        assert_eq!(candle.timestamp.timestamp_millis(), 1_700_000_000_000);

        assert!(parse_kline_row(&row[..3]).is_err());
    }

    #[test]
    fn test_empty_strings_are_zero() {
        assert_eq!(num("x", "").unwrap(), 0.0);
        assert!(matches!(num("x", "abc"), Err(BotError::Decode(_))));
    }

    #[test]
    fn test_flat_position_slot() {
        let raw: RawPosition = serde_json::from_str(
            r#"{"symbol":"BTCUSDT","side":"","size":"0","avgPrice":"0","markPrice":"30000","leverage":"3","unrealisedPnl":""}"#,
        )
        .unwrap();

        let position = VenuePosition::try_from(raw).unwrap();
        assert!(!position.is_open());
        assert_eq!(position.leverage, 3.0);
    }
}
