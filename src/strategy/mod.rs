// Entry signal evaluation
pub mod atr_staged;
pub mod order_flow;
pub mod signals;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{MarketSnapshot, Side, Signal, Trend};
use crate::risk::Ladder;

pub use atr_staged::AtrStagedStrategy;
pub use order_flow::OrderFlowStrategy;
pub use signals::SignalConfig;

/// Why a cycle produced no entry. Informational only.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NoEntry {
    #[error("insufficient history: {have} candles, need {need}")]
    InsufficientHistory { have: usize, need: usize },

    #[error("{0} could not be computed")]
    Indicator(&'static str),

    #[error("no clear volume direction")]
    NoVolumeSide,

    #[error("{side} conditions not met: {detail}")]
    ConditionsNotMet { side: Side, detail: String },

    #[error("order book does not confirm {0}")]
    OrderBookNotConfirmed(Side),

    #[error("not enough liquidity for {0}")]
    LiquidityTooThin(Side),

    #[error("{side} against {trend:?} trend")]
    TrendOpposes { side: Side, trend: Trend },
}

/// Base trait for entry strategies. Implementations are pure over the snapshot.
pub trait Strategy: Send + Sync {
    /// Evaluate the snapshot, explaining a missing entry
    fn evaluate(&self, snapshot: &MarketSnapshot) -> Result<Signal, NoEntry>;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum candles required for this strategy
    fn min_candles_required(&self) -> usize;

    /// Stop / take-profit layout that goes with this strategy
    fn ladder(&self) -> Ladder;

    /// Entry side, or None with the reason logged
    fn generate_signal(&self, snapshot: &MarketSnapshot) -> Option<Signal> {
        match self.evaluate(snapshot) {
            Ok(signal) => Some(signal),
            Err(reason) => {
                tracing::info!("⏸️  [{}] No entry: {}", self.name(), reason);
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    OrderFlow,
    AtrStaged,
}

pub fn build_strategy(kind: StrategyKind, config: SignalConfig) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::OrderFlow => Box::new(OrderFlowStrategy::new(config)),
        StrategyKind::AtrStaged => Box::new(AtrStagedStrategy::new(config)),
    }
}

pub(crate) fn trend_opposes(side: Side, trend: Trend) -> bool {
    matches!(
        (side, trend),
        (Side::Buy, Trend::Bearish) | (Side::Sell, Trend::Bullish)
    )
}
