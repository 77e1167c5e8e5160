use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::models::ClosedTrade;

const PROCESSED_ORDERS_CAPACITY: usize = 50;

/// Circuit breakers to stop new entries after a bad day
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakers {
    pub max_daily_loss: f64, // absolute quote currency (USDT)
    pub max_consecutive_losses: u32,
    pub max_daily_trades: u32,
    pub reset_streak_on_rollover: bool,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self {
            max_daily_loss: 100.0,         // -100 USDT per day
            max_consecutive_losses: 3,     // 3 losses in a row
            max_daily_trades: 12,          // 12 closed trades per day
            reset_streak_on_rollover: false, // loss streak carries over midnight
        }
    }
}

/// Most recent closed-order ids, oldest evicted first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessedOrders {
    ids: VecDeque<String>,
}

impl ProcessedOrders {
    pub fn contains(&self, order_id: &str) -> bool {
        self.ids.iter().any(|id| id == order_id)
    }

    /// Returns false if the id was already present
    pub fn insert(&mut self, order_id: &str) -> bool {
        if self.contains(order_id) {
            return false;
        }
        if self.ids.len() == PROCESSED_ORDERS_CAPACITY {
            self.ids.pop_front();
        }
        self.ids.push_back(order_id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingState {
    pub daily_pnl: f64,
    pub consecutive_losses: u32,
    pub daily_trades: u32,
    pub last_reset: NaiveDate,
    pub processed_orders: ProcessedOrders,
}

impl TradingState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            daily_pnl: 0.0,
            consecutive_losses: 0,
            daily_trades: 0,
            last_reset: today,
            processed_orders: ProcessedOrders::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerTrip {
    DailyLoss,
    ConsecutiveLosses,
    DailyTradeLimit,
}

impl fmt::Display for CircuitBreakerTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CircuitBreakerTrip::DailyLoss => "daily loss limit reached",
            CircuitBreakerTrip::ConsecutiveLosses => "consecutive loss limit reached",
            CircuitBreakerTrip::DailyTradeLimit => "daily trade limit reached",
        };
        f.write_str(text)
    }
}

impl CircuitBreakers {
    pub fn check(&self, state: &TradingState) -> Result<(), CircuitBreakerTrip> {
        if state.daily_pnl <= -self.max_daily_loss {
            return Err(CircuitBreakerTrip::DailyLoss);
        }

        if state.consecutive_losses >= self.max_consecutive_losses {
            return Err(CircuitBreakerTrip::ConsecutiveLosses);
        }

        if state.daily_trades >= self.max_daily_trades {
            return Err(CircuitBreakerTrip::DailyTradeLimit);
        }

        Ok(())
    }
}

/// Tracks closed trades and gates new entries.
///
/// Only `record_closed_trade` and `roll_over_at` mutate the counters.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    limits: CircuitBreakers,
    state: TradingState,
    announced_trip: Option<CircuitBreakerTrip>,
}

impl CircuitBreaker {
    pub fn new(limits: CircuitBreakers, today: NaiveDate) -> Self {
        Self {
            limits,
            state: TradingState::new(today),
            announced_trip: None,
        }
    }

    pub fn limits(&self) -> &CircuitBreakers {
        &self.limits
    }

    pub fn state(&self) -> &TradingState {
        &self.state
    }

    pub fn check(&self) -> Result<(), CircuitBreakerTrip> {
        self.limits.check(&self.state)
    }

    pub fn can_enter(&self) -> bool {
        self.check().is_ok()
    }

    /// Apply a closed trade once. Returns false for an already-processed order id.
    pub fn record_closed_trade(&mut self, trade: &ClosedTrade) -> bool {
        if !self.state.processed_orders.insert(&trade.order_id) {
            tracing::debug!("Closed order {} already processed", trade.order_id);
            return false;
        }

        self.state.daily_pnl += trade.realized_pnl;
        self.state.daily_trades += 1;

        if trade.is_loss() {
            self.state.consecutive_losses += 1;
        } else {
            self.state.consecutive_losses = 0;
        }

        tracing::info!(
            "Closed trade {} ({}): PnL {:.2}, daily {:.2}, loss streak {}",
            trade.order_id,
            trade.side,
            trade.realized_pnl,
            self.state.daily_pnl,
            self.state.consecutive_losses
        );

        true
    }

    /// Reset daily counters when the local date changes.
    pub fn roll_over(&mut self) -> bool {
        self.roll_over_at(Local::now().date_naive())
    }

    /// Reset daily counters if `today` differs from the last reset date
    pub fn roll_over_at(&mut self, today: NaiveDate) -> bool {
        if today == self.state.last_reset {
            return false;
        }

        self.state.daily_pnl = 0.0;
        self.state.daily_trades = 0;
        if self.limits.reset_streak_on_rollover {
            self.state.consecutive_losses = 0;
        }
        self.state.last_reset = today;
        self.announced_trip = None;

        tracing::info!("📅 Daily statistics reset for {}", today);
        true
    }

    /// The current trip, only the first time it is observed
    pub fn take_new_trip(&mut self) -> Option<CircuitBreakerTrip> {
        match self.check() {
            Ok(()) => {
                self.announced_trip = None;
                None
            }
            Err(trip) if self.announced_trip == Some(trip) => None,
            Err(trip) => {
                self.announced_trip = Some(trip);
                Some(trip)
            }
        }
    }
}
