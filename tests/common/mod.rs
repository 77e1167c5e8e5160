#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::sync::Mutex;

use perpbot::api::Exchange;
use perpbot::config::BotConfig;
use perpbot::models::{
    AccountSnapshot, BookLevel, Candle, ClosedTrade, Execution, OrderAck, OrderBook, OrderDetail,
    OrderRequest, OrderStatus, Side, VenuePosition,
};
use perpbot::notify::Notifier;
use perpbot::BotError;

/// Venue state a test scripts up front and inspects afterwards
#[derive(Debug, Default)]
pub struct MockState {
    pub price: f64,
    pub candles: Vec<Candle>,
    pub order_book: OrderBook,
    pub executions: Vec<Execution>,
    pub account: AccountSnapshot,
    pub venue_leverage: f64,
    pub position: Option<VenuePosition>,
    pub closed_trades: Vec<ClosedTrade>,
    pub orders: Vec<OrderRequest>,
    pub trading_stops: Vec<(Option<f64>, Option<f64>)>,
    pub leverage_calls: Vec<u32>,
    pub entry_status: Option<OrderStatus>,
    pub fail_place_order: Option<BotError>,
    pub fail_trading_stop: Option<BotError>,
    pub fail_positions: Option<BotError>,
    pub market_fetches: usize,
}

/// In-memory venue: entries fill immediately at their limit price
pub struct MockExchange {
    pub state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new(state: MockState) -> Self {
        Self { state: Mutex::new(state) }
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.state.lock().unwrap().orders.clone()
    }

    pub fn entry_orders(&self) -> Vec<OrderRequest> {
        self.orders().into_iter().filter(|o| !o.reduce_only).collect()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn positions(&self, symbol: &str) -> Result<Vec<VenuePosition>, BotError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = state.fail_positions.clone() {
            return Err(err);
        }
        let mut positions: Vec<VenuePosition> = state.position.clone().into_iter().collect();
        if positions.is_empty() {
            positions.push(VenuePosition {
                symbol: symbol.to_string(),
                leverage: state.venue_leverage,
                ..Default::default()
            });
        }
        Ok(positions)
    }

    async fn candles(&self, _symbol: &str, _interval: &str, _limit: usize) -> Result<Vec<Candle>, BotError> {
        let mut state = self.state.lock().unwrap();
        state.market_fetches += 1;
        Ok(state.candles.clone())
    }

    async fn order_book(&self, _symbol: &str, _depth: usize) -> Result<OrderBook, BotError> {
        Ok(self.state.lock().unwrap().order_book.clone())
    }

    async fn recent_executions(&self, _symbol: &str, _limit: usize) -> Result<Vec<Execution>, BotError> {
        Ok(self.state.lock().unwrap().executions.clone())
    }

    async fn wallet_balance(&self, _account_type: &str) -> Result<AccountSnapshot, BotError> {
        Ok(self.state.lock().unwrap().account.clone())
    }

    async fn latest_price(&self, _symbol: &str) -> Result<f64, BotError> {
        Ok(self.state.lock().unwrap().price)
    }

    async fn set_leverage(&self, _symbol: &str, buy: u32, _sell: u32) -> Result<(), BotError> {
        let mut state = self.state.lock().unwrap();
        state.leverage_calls.push(buy);
        state.venue_leverage = f64::from(buy);
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, BotError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_place_order.clone() {
            return Err(err);
        }
        state.orders.push(request.clone());
        let order_id = format!("order-{}", state.orders.len());

        let fill_price = request.price.unwrap_or(state.price);
        let leverage = state.venue_leverage;
        if request.reduce_only {
            // Resting take-profit limits do not fill here
            if request.price.is_none() {
                if let Some(position) = state.position.as_mut() {
                    position.size = (position.size - request.qty).max(0.0);
                }
                if state.position.as_ref().map_or(false, |p| p.size <= 1e-12) {
                    state.position = None;
                }
            }
        } else if state.entry_status.map_or(true, |s| !s.is_dead()) {
            state.position = Some(VenuePosition {
                symbol: request.symbol.clone(),
                side: Some(request.side),
                size: request.qty,
                entry_price: fill_price,
                mark_price: fill_price,
                leverage,
                unrealised_pnl: 0.0,
            });
        }

        Ok(OrderAck {
            order_id,
            order_link_id: request.order_link_id.clone(),
        })
    }

    async fn set_trading_stop(
        &self,
        _symbol: &str,
        _side: Side,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<(), BotError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_trading_stop.clone() {
            return Err(err);
        }
        state.trading_stops.push((stop_loss, take_profit));
        Ok(())
    }

    async fn closed_pnl(
        &self,
        _symbol: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<ClosedTrade>, BotError> {
        // Newest first, like the venue; the caller de-duplicates by order id
        let mut trades = self.state.lock().unwrap().closed_trades.clone();
        trades.reverse();
        Ok(trades)
    }

    async fn order_detail(&self, _symbol: &str, order_id: &str) -> Result<OrderDetail, BotError> {
        let state = self.state.lock().unwrap();
        let index: usize = order_id
            .trim_start_matches("order-")
            .parse()
            .map_err(|_| BotError::InsufficientData(format!("order {} not found", order_id)))?;
        let request = state
            .orders
            .get(index - 1)
            .ok_or_else(|| BotError::InsufficientData(format!("order {} not found", order_id)))?;

        let status = state.entry_status.unwrap_or(OrderStatus::Filled);
        let price = request.price.unwrap_or(state.price);
        Ok(OrderDetail {
            order_id: order_id.to_string(),
            side: request.side,
            qty: request.qty,
            price,
            avg_price: if status.is_dead() { 0.0 } else { price },
            cum_exec_qty: if status.is_dead() { 0.0 } else { request.qty },
            status,
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.messages().iter().filter(|m| m.contains(needle)).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

pub fn candles_from(closes: &[f64]) -> Vec<Candle> {
    let start = Utc::now() - Duration::minutes(5 * closes.len() as i64);
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Candle {
            timestamp: start + Duration::minutes(5 * i as i64),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        })
        .collect()
}

/// Market where the order-flow evaluator signals Buy at 206
pub fn buy_signal_market() -> MockState {
    let mut closes = vec![100.0; 35];
    closes.extend((0..15).map(|i| 220.0 - i as f64));

    let level = |size: f64| BookLevel { price: 206.0, size };
    let now = Utc::now();

    MockState {
        price: 206.0,
        candles: candles_from(&closes),
        order_book: OrderBook {
            bids: [3.0, 3.0, 2.0, 2.0, 1.0].map(level).to_vec(),
            asks: [1.0; 5].map(level).to_vec(),
        },
        executions: vec![
            Execution { side: Side::Buy, price: 206.0, size: 10.0, timestamp: now },
            Execution { side: Side::Sell, price: 206.0, size: 2.0, timestamp: now },
        ],
        account: account(10_000.0),
        venue_leverage: 3.0,
        ..MockState::default()
    }
}

/// Nothing to evaluate: the evaluator reports insufficient history
pub fn quiet_market() -> MockState {
    MockState {
        price: 30_000.0,
        account: account(10_000.0),
        venue_leverage: 3.0,
        ..MockState::default()
    }
}

pub fn account(balance: f64) -> AccountSnapshot {
    AccountSnapshot {
        available_balance: balance,
        equity: balance,
        used_margin: 0.0,
        free_margin: balance,
    }
}

pub fn closed_trade(order_id: &str, pnl: f64, minutes_ago: i64) -> ClosedTrade {
    ClosedTrade {
        order_id: order_id.to_string(),
        side: Side::Buy,
        quantity: 0.01,
        entry_price: 30_000.0,
        exit_price: 30_000.0 + pnl * 100.0,
        realized_pnl: pnl,
        closed_at: Utc::now() - Duration::minutes(minutes_ago),
    }
}

/// Default config with control and snapshot files in a fresh temp directory
pub fn test_config() -> (BotConfig, PathBuf) {
    let dir = std::env::temp_dir().join(format!("perpbot-it-{}", uuid::Uuid::new_v4().simple()));
    let mut config = BotConfig::default();
    config.paths.control_file = dir.join("signals.json");
    config.paths.snapshot_dir = dir.clone();
    (config, dir)
}
