use serde::{Deserialize, Serialize};

use crate::indicators::{calculate_ema, calculate_rsi, calculate_sma};
use crate::models::{Execution, OrderBook, Side, Trend};

/// Configuration for signal generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub rsi_neutral_band: (f64, f64), // RSI range treated as "mid" for the trend band
    pub sma_period: usize,           // SMA50
    pub slow_sma_period: usize,      // SMA200, used when enough history exists
    pub ema_period: usize,           // EMA21
    pub trend_tolerance_pct: f64,    // SMA50 within this % of SMA200 counts as flat
    pub require_trend_alignment: bool,
    pub vwap_period: usize,
    pub atr_period: usize,
    pub orderbook_depth: usize,
    pub liquidity_depth: usize,
    pub volume_threshold: f64, // level size that counts as a "large" order
    pub min_volume_ratio: f64,
    pub large_order_ratio: f64,
    pub volume_lookback: usize, // number of recent executions to weigh
    // ATR-staged entries
    pub staged_sma_period: usize, // SMA20
    pub staged_rsi_long_max: f64,
    pub staged_rsi_short_min: f64,
    pub levels_lookback: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            rsi_neutral_band: (40.0, 60.0),
            sma_period: 50,
            slow_sma_period: 200,
            ema_period: 21,
            trend_tolerance_pct: 0.1,
            require_trend_alignment: false,
            vwap_period: 20,
            atr_period: 14,
            orderbook_depth: 10,
            liquidity_depth: 5,
            volume_threshold: 1.5,
            min_volume_ratio: 1.2,
            large_order_ratio: 1.5,
            volume_lookback: 50,
            staged_sma_period: 20,
            staged_rsi_long_max: 65.0,
            staged_rsi_short_min: 35.0,
            levels_lookback: 100,
        }
    }
}

fn pct_gap(a: f64, b: f64) -> f64 {
    ((a - b) / b).abs() * 100.0
}

/// Trend from SMA50 / SMA200 / EMA21, with RSI deciding the flat band.
///
/// Without enough history for SMA200 the EMA21 vs SMA50 relation alone decides.
/// None only when SMA50, EMA21 or RSI cannot be computed.
pub fn classify_trend(closes: &[f64], config: &SignalConfig) -> Option<Trend> {
    let sma = calculate_sma(closes, config.sma_period)?;
    let ema = calculate_ema(closes, config.ema_period)?;
    let rsi = calculate_rsi(closes, config.rsi_period)?;
    let slow = calculate_sma(closes, config.slow_sma_period);

    let (rsi_low, rsi_high) = config.rsi_neutral_band;
    let rsi_mid = rsi >= rsi_low && rsi <= rsi_high;

    let flat = match slow {
        Some(slow) => pct_gap(sma, slow) <= config.trend_tolerance_pct,
        None => pct_gap(ema, sma) <= config.trend_tolerance_pct,
    };
    if flat && rsi_mid {
        return Some(Trend::Neutral);
    }

    let (fast_above, fast_below) = match slow {
        Some(slow) => (sma > slow, sma < slow),
        None => (true, true),
    };

    let trend = if fast_above && ema > sma {
        Trend::Bullish
    } else if fast_below && ema < sma {
        Trend::Bearish
    } else {
        Trend::Neutral
    };

    Some(trend)
}

/// Buy / Sell when one side's executed quantity beats the other by `ratio`
pub fn volume_imbalance(executions: &[Execution], lookback: usize, ratio: f64) -> Option<Side> {
    let (buy, sell) = executions
        .iter()
        .take(lookback)
        .fold((0.0, 0.0), |(buy, sell), exec| match exec.side {
            Side::Buy => (buy + exec.size, sell),
            Side::Sell => (buy, sell + exec.size),
        });

    tracing::debug!("Volume imbalance: buy {:.4} / sell {:.4}", buy, sell);

    if buy > sell * ratio {
        Some(Side::Buy)
    } else if sell > buy * ratio {
        Some(Side::Sell)
    } else {
        None
    }
}

/// Both the total-size ratio and the large-order ratio must favor `side`
pub fn order_book_confirms(book: &OrderBook, side: Side, config: &SignalConfig) -> bool {
    let depth = config.orderbook_depth;
    let sum = |levels: &[crate::models::BookLevel], min_size: f64| -> f64 {
        levels
            .iter()
            .take(depth)
            .filter(|l| l.size > min_size)
            .map(|l| l.size)
            .sum()
    };

    let total_bids = sum(&book.bids, f64::NEG_INFINITY);
    let total_asks = sum(&book.asks, f64::NEG_INFINITY);
    let large_bids = sum(&book.bids, config.volume_threshold);
    let large_asks = sum(&book.asks, config.volume_threshold);

    let (ours, theirs, large_ours, large_theirs) = match side {
        Side::Buy => (total_bids, total_asks, large_bids, large_asks),
        Side::Sell => (total_asks, total_bids, large_asks, large_bids),
    };

    ours > theirs * config.min_volume_ratio && large_ours > large_theirs * config.large_order_ratio
}

/// Top-of-book depth on our side must outweigh the other side
pub fn liquidity_ok(book: &OrderBook, side: Side, config: &SignalConfig) -> bool {
    let top = |levels: &[crate::models::BookLevel]| -> f64 {
        levels.iter().take(config.liquidity_depth).map(|l| l.size).sum()
    };

    let (bids, asks) = (top(&book.bids), top(&book.asks));
    match side {
        Side::Buy => bids > asks * config.min_volume_ratio,
        Side::Sell => asks > bids * config.min_volume_ratio,
    }
}
