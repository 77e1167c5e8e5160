use super::signals::{classify_trend, liquidity_ok, order_book_confirms, volume_imbalance, SignalConfig};
use super::{trend_opposes, NoEntry, Strategy};
use crate::indicators::{calculate_rsi, calculate_sma, calculate_vwap};
use crate::models::{MarketSnapshot, Side, Signal, Trend};
use crate::risk::Ladder;

/// Scalping entries on order flow
///
/// Buy when:
/// - executed volume leans to the buy side
/// - price is above SMA50 and VWAP while RSI is oversold
/// - the order book (totals and large orders) confirms the bid
/// - top-of-book liquidity supports the side
///
/// Sell mirrors every condition.
#[derive(Debug, Clone, Default)]
pub struct OrderFlowStrategy {
    config: SignalConfig,
}

impl OrderFlowStrategy {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }
}

impl Strategy for OrderFlowStrategy {
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
        let trend = classify_trend(&closes, cfg).unwrap_or(Trend::Neutral);
        let sma = calculate_sma(&closes, cfg.sma_period).ok_or(NoEntry::Indicator("SMA"))?;
        let rsi = calculate_rsi(&closes, cfg.rsi_period).ok_or(NoEntry::Indicator("RSI"))?;
        let vwap = calculate_vwap(&snapshot.candles, cfg.vwap_period)
            .ok_or(NoEntry::Indicator("VWAP"))?;
        let price = snapshot.price;

        tracing::debug!(
            "Order flow {}: price {:.4}, SMA {:.4}, VWAP {:.4}, RSI {:.1}, trend {:?}",
            side,
            price,
            sma,
            vwap,
            rsi,
            trend
        );

        let conditions = match side {
            Side::Buy => price > sma && price > vwap && rsi < cfg.rsi_oversold,
            Side::Sell => price < sma && price < vwap && rsi > cfg.rsi_overbought,
        };
        if !conditions {
            return Err(NoEntry::ConditionsNotMet {
                side,
                detail: format!(
                    "price {:.4}, SMA {:.4}, VWAP {:.4}, RSI {:.1}",
                    price, sma, vwap, rsi
                ),
            });
        }

        if !order_book_confirms(&snapshot.order_book, side, cfg) {
            return Err(NoEntry::OrderBookNotConfirmed(side));
        }

        if cfg.require_trend_alignment && trend_opposes(side, trend) {
            return Err(NoEntry::TrendOpposes { side, trend });
        }

        if !liquidity_ok(&snapshot.order_book, side, cfg) {
            return Err(NoEntry::LiquidityTooThin(side));
        }

        Ok(Signal {
            side,
            trend,
            volume: true,
            order_book: true,
            liquidity: true,
        })
    }

    fn name(&self) -> &str {
        "OrderFlow"
    }

    fn min_candles_required(&self) -> usize {
        let cfg = &self.config;
        cfg.sma_period
            .max(cfg.ema_period)
            .max(cfg.rsi_period + 1)
            .max(cfg.vwap_period)
    }

    fn ladder(&self) -> Ladder {
        Ladder::Percent
    }
}
