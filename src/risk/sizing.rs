use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SymbolSpec;
use crate::error::BotError;
use crate::models::{AccountSnapshot, Side};
use crate::risk::precision::{floor_to_step, round_to_tick};

// Tolerance for percentage comparisons on prices that went through float arithmetic
const PCT_EPSILON: f64 = 1e-9;

/// How stop-loss and take-profit prices are laid out around the entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Ladder {
    /// Stop from ATR × multiplier, take-profits at fixed percentage offsets
    Percent,
    /// Stop at a fraction of ATR, take-profits at 1/2/3 ATR
    Atr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub risk_percent: f64,                 // % of balance risked per trade
    pub atr_multiplier: f64,               // stop distance in ATRs (percent ladder)
    pub atr_stop_fraction: f64,            // stop distance in ATRs used for sizing and the ATR ladder
    pub stop_loss_percent: Option<f64>,    // fallback when ATR is unavailable
    pub take_profit_percents: [f64; 3],    // percent ladder offsets
    pub take_profit_atr_multiples: [f64; 3], // ATR ladder offsets
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_percent: 1.0,
            atr_multiplier: 2.0,
            atr_stop_fraction: 0.5,
            stop_loss_percent: Some(0.3),
            take_profit_percents: [0.3, 0.6, 1.0],
            take_profit_atr_multiples: [1.0, 2.0, 3.0],
        }
    }
}

/// Why a candidate entry was skipped. Not fatal: the cycle just does nothing.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RiskRejection {
    #[error("stop distance {distance_pct:.3}% below minimum {min_pct}%")]
    StopTooClose { distance_pct: f64, min_pct: f64 },

    #[error("required margin {required:.2} exceeds available balance {available:.2}")]
    InsufficientMargin { required: f64, available: f64 },

    #[error("position size below symbol minimum {min_qty}")]
    SizeBelowMinimum { min_qty: f64 },

    #[error("{0}")]
    Data(BotError),
}

/// A fully sized and priced entry, ready for the state machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryPlan {
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profits: [f64; 3],
    pub atr: Option<f64>,
}

/// Stop-loss, position size and take-profit ladder from balance, entry and volatility.
///
/// Pure: holds configuration only.
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
    symbol: SymbolSpec,
    ladder: Ladder,
}

impl RiskManager {
    pub fn new(config: RiskConfig, symbol: SymbolSpec, ladder: Ladder) -> Self {
        Self {
            config,
            symbol,
            ladder,
        }
    }

    pub fn symbol(&self) -> &SymbolSpec {
        &self.symbol
    }

    pub fn ladder(&self) -> Ladder {
        self.ladder
    }

    fn min_stop_distance(&self, entry_price: f64) -> f64 {
        entry_price * self.symbol.min_stop_distance_pct / 100.0
    }

    /// Stop-loss price, strictly on the losing side of `entry_price`
    pub fn stop_loss(&self, side: Side, entry_price: f64, atr: Option<f64>) -> Result<f64, BotError> {
        let min_distance = self.min_stop_distance(entry_price);
        let atr = atr.filter(|a| a.is_finite() && *a > 0.0);

        let distance = match (atr, self.config.stop_loss_percent) {
            (Some(atr), _) => {
                let multiple = match self.ladder {
                    Ladder::Percent => self.config.atr_multiplier,
                    Ladder::Atr => self.config.atr_stop_fraction,
                };
                (atr * multiple).max(min_distance)
            }
            (None, Some(pct)) => {
                entry_price * pct.max(self.symbol.min_stop_distance_pct) / 100.0
            }
            (None, None) => {
                return Err(BotError::InsufficientData(
                    "ATR unavailable and no percentage stop configured".to_string(),
                ))
            }
        };

        let stop = entry_price - side.direction() * distance;
        tracing::debug!(
            "Stop-loss for {} @ {:.4}: {:.4} (distance {:.3}%)",
            side,
            entry_price,
            stop,
            distance / entry_price * 100.0
        );

        Ok(stop)
    }

    /// Reject stops closer than the symbol's minimum distance
    pub fn validate_stop_distance(&self, entry_price: f64, stop_price: f64) -> Result<(), RiskRejection> {
        let distance_pct = (entry_price - stop_price).abs() / entry_price * 100.0;
        let min_pct = self.symbol.min_stop_distance_pct;

        if distance_pct + PCT_EPSILON < min_pct {
            return Err(RiskRejection::StopTooClose {
                distance_pct,
                min_pct,
            });
        }

        Ok(())
    }

    /// Size from risk budget and ATR, floored to the quantity step.
    ///
    /// None if the result is below the symbol minimum or the ATR is unusable.
    pub fn position_size(&self, balance: f64, entry_price: f64, atr: f64) -> Option<f64> {
        let stop_distance = atr * self.config.atr_stop_fraction;
        if !stop_distance.is_finite() || stop_distance <= 0.0 || entry_price <= 0.0 {
            return None;
        }

        self.size_for_distance(balance, stop_distance)
    }

    fn size_for_distance(&self, balance: f64, stop_distance: f64) -> Option<f64> {
        let risk_amount = balance * self.config.risk_percent / 100.0;
        let raw = risk_amount / stop_distance;
        let size = floor_to_step(raw, self.symbol.qty_step);

        if size < self.symbol.min_qty {
            tracing::warn!(
                "Position size {:.6} below minimum {} for {}",
                raw,
                self.symbol.min_qty,
                self.symbol.symbol
            );
            return None;
        }

        Some(size)
    }

    /// TP1 < TP2 < TP3 in the favorable direction
    pub fn take_profits(&self, side: Side, entry_price: f64, atr: Option<f64>) -> [f64; 3] {
        let offsets = match (self.ladder, atr.filter(|a| a.is_finite() && *a > 0.0)) {
            (Ladder::Atr, Some(atr)) => self.config.take_profit_atr_multiples.map(|m| atr * m),
            _ => self
                .config
                .take_profit_percents
                .map(|pct| entry_price * pct / 100.0),
        };

        offsets.map(|offset| entry_price + side.direction() * offset)
    }

    pub fn validate_margin(
        &self,
        balance: f64,
        entry_price: f64,
        qty: f64,
        leverage: f64,
    ) -> Result<(), RiskRejection> {
        let required = entry_price * qty / leverage.max(1.0);
        if required > balance {
            return Err(RiskRejection::InsufficientMargin {
                required,
                available: balance,
            });
        }
        Ok(())
    }

    /// Run every check for a candidate entry and price it
    pub fn plan_entry(
        &self,
        side: Side,
        entry_price: f64,
        atr: Option<f64>,
        account: &AccountSnapshot,
        leverage: f64,
    ) -> Result<EntryPlan, RiskRejection> {
        let tick = self.symbol.tick_size;

        let raw_stop = self
            .stop_loss(side, entry_price, atr)
            .map_err(RiskRejection::Data)?;
        let stop_loss = round_to_tick(raw_stop, tick);
        self.validate_stop_distance(entry_price, stop_loss)?;

        let take_profits = self
            .take_profits(side, entry_price, atr)
            .map(|tp| round_to_tick(tp, tick));

        let balance = account.available_balance;
        let quantity = match atr.filter(|a| a.is_finite() && *a > 0.0) {
            Some(atr) => self.position_size(balance, entry_price, atr),
            None => self.size_for_distance(balance, (entry_price - stop_loss).abs()),
        }
        .ok_or(RiskRejection::SizeBelowMinimum {
            min_qty: self.symbol.min_qty,
        })?;

        self.validate_margin(balance, entry_price, quantity, leverage)?;

        Ok(EntryPlan {
            side,
            entry_price,
            quantity,
            stop_loss,
            take_profits,
            atr,
        })
    }
}
