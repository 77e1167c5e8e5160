use super::signals::{classify_trend, liquidity_ok, order_book_confirms, volume_imbalance, SignalConfig};
use super::{trend_opposes, NoEntry, Strategy};
use crate::indicators::{calculate_atr, calculate_rsi, calculate_sma, calculate_vwap, support_resistance};
use crate::models::{MarketSnapshot, Side, Signal, Trend};
use crate::risk::Ladder;

/// Trend-following entries sized and laddered in ATR units
///
/// Buy when price is above VWAP and SMA20, SMA20 is above SMA50, RSI is not
/// stretched (below 65) and there is at least one ATR of room to the recent
/// resistance. Sell mirrors it against support.
#[derive(Debug, Clone, Default)]
pub struct AtrStagedStrategy {
    config: SignalConfig,
}

impl AtrStagedStrategy {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }
}

impl Strategy for AtrStagedStrategy {
    fn evaluate(&self, snapshot: &MarketSnapshot) -> Result<Signal, NoEntry> {
        let cfg = &self.config;
        let need = self.min_candles_required();
        if snapshot.candles.len() < need {
            return Err(NoEntry::InsufficientHistory {
                have: snapshot.candles.len(),
                need,
            });
        }

        let side = volume_imbalance(&snapshot.executions, cfg.volume_lookback, cfg.min_volume_ratio)
            .ok_or(NoEntry::NoVolumeSide)?;

        let closes = snapshot.closes();
        let sma_short =
            calculate_sma(&closes, cfg.staged_sma_period).ok_or(NoEntry::Indicator("SMA20"))?;
        let sma_long = calculate_sma(&closes, cfg.sma_period).ok_or(NoEntry::Indicator("SMA50"))?;
        let rsi = calculate_rsi(&closes, cfg.rsi_period).ok_or(NoEntry::Indicator("RSI"))?;
        let atr = calculate_atr(&snapshot.candles, cfg.atr_period).ok_or(NoEntry::Indicator("ATR"))?;
        let vwap = calculate_vwap(&snapshot.candles, cfg.vwap_period)
            .ok_or(NoEntry::Indicator("VWAP"))?;
        let levels = support_resistance(&closes, cfg.levels_lookback)
            .ok_or(NoEntry::Indicator("support/resistance"))?;
        let price = snapshot.price;

        let (trend_ok, room) = match side {
            Side::Buy => (
                price > vwap && rsi < cfg.staged_rsi_long_max && price > sma_short && sma_short > sma_long,
                price < levels.resistance - atr,
            ),
            Side::Sell => (
                price < vwap && rsi > cfg.staged_rsi_short_min && price < sma_short && sma_short < sma_long,
                price > levels.support + atr,
            ),
        };

        if !(trend_ok && room) {
            return Err(NoEntry::ConditionsNotMet {
                side,
                detail: format!(
                    "price {:.4}, VWAP {:.4}, SMA20 {:.4}, SMA50 {:.4}, RSI {:.1}, ATR {:.4}, levels {:.4}/{:.4}",
                    price, vwap, sma_short, sma_long, rsi, atr, levels.support, levels.resistance
                ),
            });
        }

        let trend = classify_trend(&closes, cfg).unwrap_or(Trend::Neutral);
        if cfg.require_trend_alignment && trend_opposes(side, trend) {
            return Err(NoEntry::TrendOpposes { side, trend });
        }

        Ok(Signal {
            side,
            trend,
            volume: true,
            order_book: order_book_confirms(&snapshot.order_book, side, cfg),
            liquidity: liquidity_ok(&snapshot.order_book, side, cfg),
        })
    }

    fn name(&self) -> &str {
        "AtrStaged"
    }

    fn min_candles_required(&self) -> usize {
        let cfg = &self.config;
        cfg.sma_period
            .max(cfg.staged_sma_period)
            .max(cfg.rsi_period + 1)
            .max(cfg.atr_period + 1)
            .max(cfg.vwap_period)
    }

    fn ladder(&self) -> Ladder {
        Ladder::Atr
    }
}
