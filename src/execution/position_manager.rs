use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::config::SymbolSpec;
use crate::error::BotError;
use crate::models::{Side, VenuePosition};
use crate::risk::precision::{floor_to_step, round_to_tick};
use crate::risk::EntryPlan;

// Sizes below this are treated as fully closed
const SIZE_EPSILON: f64 = 1e-12;

/// How the entry order is sent
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrderKind {
    /// Limit at the current price that only rests on the book
    #[default]
    PostOnlyLimit,
    Market,
}

/// Close `fraction` of the remaining size once profit reaches `atr_multiple` ATRs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PartialStage {
    pub atr_multiple: f64,
    pub fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    pub trailing_percent: f64,          // stop trails price by this %
    pub min_trailing_step_percent: f64, // smallest stop move worth an order
    pub break_even_atr: f64,            // profit in ATRs that moves the stop to entry
    pub partial_close_stages: Vec<PartialStage>,
    pub tp2_fraction: f64, // of the original size
    pub tp3_fraction: f64,
    pub entry_order: EntryOrderKind,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            trailing_percent: 0.2,
            min_trailing_step_percent: 0.1,
            break_even_atr: 0.75,
            partial_close_stages: vec![
                PartialStage { atr_multiple: 1.0, fraction: 0.5 },
                PartialStage { atr_multiple: 2.0, fraction: 0.25 },
                PartialStage { atr_multiple: 3.0, fraction: 1.0 },
            ],
            tp2_fraction: 0.3,
            tp3_fraction: 0.4,
            entry_order: EntryOrderKind::PostOnlyLimit,
        }
    }
}

impl ManagementConfig {
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        if self.trailing_percent <= 0.0 {
            errors.push(format!("trailing_percent must be > 0 (got {})", self.trailing_percent));
        }
        if self.min_trailing_step_percent < 0.0 {
            errors.push("min_trailing_step_percent must be >= 0".to_string());
        }
        if self.break_even_atr <= 0.0 {
            errors.push("break_even_atr must be > 0".to_string());
        }
        if self
            .partial_close_stages
            .windows(2)
            .any(|w| w[1].atr_multiple <= w[0].atr_multiple)
        {
            errors.push("partial close ATR multiples must be strictly increasing".to_string());
        }
        if self
            .partial_close_stages
            .iter()
            .any(|s| s.atr_multiple <= 0.0 || s.fraction <= 0.0 || s.fraction > 1.0)
        {
            errors.push("partial close stages need atr_multiple > 0 and fraction in (0, 1]".to_string());
        }
        let ladder = self.tp2_fraction + self.tp3_fraction;
        if self.tp2_fraction < 0.0 || self.tp3_fraction < 0.0 || ladder > 1.0 {
            errors.push(format!("tp2_fraction + tp3_fraction must be within [0, 1] (got {})", ladder));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PositionState {
    Flat,
    Opening,
    Open,
    PartiallyClosed { remaining_fraction: f64 },
    Closed,
    Rejected { reason: String },
}

impl PositionState {
    pub fn is_active(&self) -> bool {
        matches!(self, PositionState::Open | PositionState::PartiallyClosed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            PositionState::Flat => "Flat",
            PositionState::Opening => "Opening",
            PositionState::Open => "Open",
            PositionState::PartiallyClosed { .. } => "PartiallyClosed",
            PositionState::Closed => "Closed",
            PositionState::Rejected { .. } => "Rejected",
        }
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionState::PartiallyClosed { remaining_fraction } => {
                write!(f, "PartiallyClosed({:.0}% left)", remaining_fraction * 100.0)
            }
            PositionState::Rejected { reason } => write!(f, "Rejected({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("cannot {action} while {state}")]
    Invalid { state: &'static str, action: &'static str },

    #[error("stop {proposed} does not improve on {current}")]
    StopNotImproved { current: f64, proposed: f64 },

    #[error("close of {requested} exceeds remaining size {remaining}")]
    Oversized { requested: f64, remaining: f64 },
}

impl From<TransitionError> for BotError {
    fn from(err: TransitionError) -> Self {
        BotError::InvalidState(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialClose {
    pub stage: usize,
    pub size: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub original_size: f64,
    pub size: f64, // remaining
    pub stop_loss: f64,
    pub take_profits: [f64; 3],
    pub atr: Option<f64>,
    pub partial_closes: Vec<PartialClose>,
    pub stages_done: usize,
    pub opened_at: DateTime<Utc>,
    pub entry_order_id: Option<String>,
}

impl Position {
    /// Favorable price move from entry (negative when losing)
    pub fn favorable_move(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.side.direction()
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.favorable_move(price) * self.size
    }

    /// Return on margin in percent
    pub fn pnl_percent(&self, price: f64, leverage: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.favorable_move(price) / self.entry_price * 100.0 * leverage
    }

    /// Profit in ATR units, None without an ATR
    pub fn profit_in_atr(&self, price: f64) -> Option<f64> {
        self.atr
            .filter(|atr| *atr > 0.0)
            .map(|atr| self.favorable_move(price) / atr)
    }

    pub fn closed_size(&self) -> f64 {
        self.partial_closes.iter().map(|c| c.size).sum()
    }
}

/// What the ATR ladder wants done at the current price
#[derive(Debug, Clone, PartialEq)]
pub enum PartialCloseAction {
    Close { stage: usize, qty: f64, closes_all: bool },
    /// Stage reached but the slice is below the symbol minimum
    SkipStage { stage: usize, qty: f64 },
}

/// Result of comparing local state with the venue's position list
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Flat,
    Unchanged,
    Reduced { from: f64, to: f64 },
    ClosedExternally(Position),
    /// The venue holds a position this process did not open
    Untracked(VenuePosition),
}

/// Lifecycle of the single position on one symbol.
///
/// Every transition is synchronous and is applied only after the venue
/// confirmed the corresponding order, so a failed call never leaves a
/// half-updated position behind.
#[derive(Debug, Clone)]
pub struct PositionStateMachine {
    state: PositionState,
    position: Option<Position>,
    config: ManagementConfig,
    symbol: SymbolSpec,
}

impl PositionStateMachine {
    pub fn new(config: ManagementConfig, symbol: SymbolSpec) -> Self {
        Self {
            state: PositionState::Flat,
            position: None,
            config,
            symbol,
        }
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn config(&self) -> &ManagementConfig {
        &self.config
    }

    pub fn symbol(&self) -> &SymbolSpec {
        &self.symbol
    }

    fn invalid(&self, action: &'static str) -> TransitionError {
        TransitionError::Invalid {
            state: self.state.label(),
            action,
        }
    }

    /// Flat, or the previous position ended (Closed / Rejected)
    pub fn can_open(&self) -> bool {
        matches!(
            self.state,
            PositionState::Flat | PositionState::Closed | PositionState::Rejected { .. }
        )
    }

    /// Flat → Opening with the planned entry
    pub fn begin_open(&mut self, plan: &EntryPlan, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.can_open() {
            return Err(self.invalid("open"));
        }

        self.position = Some(Position {
            id: Uuid::new_v4(),
            symbol: self.symbol.symbol.clone(),
            side: plan.side,
            entry_price: plan.entry_price,
            original_size: plan.quantity,
            size: plan.quantity,
            stop_loss: plan.stop_loss,
            take_profits: plan.take_profits,
            atr: plan.atr,
            partial_closes: Vec::new(),
            stages_done: 0,
            opened_at: now,
            entry_order_id: None,
        });
        self.state = PositionState::Opening;
        Ok(())
    }

    /// Opening → Open once the venue accepted the entry
    pub fn confirm_open(&mut self, order_id: &str, fill_price: Option<f64>) -> Result<&Position, TransitionError> {
        if self.state != PositionState::Opening {
            return Err(self.invalid("confirm entry"));
        }
        let position = self.position.as_mut().ok_or(TransitionError::Invalid {
            state: "Opening",
            action: "confirm entry without a position",
        })?;

        if let Some(price) = fill_price.filter(|p| *p > 0.0) {
            position.entry_price = price;
        }
        position.entry_order_id = Some(order_id.to_string());
        self.state = PositionState::Open;

        Ok(position)
    }

    /// Opening → Rejected; the planned position is dropped
    pub fn reject_open(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        if self.state != PositionState::Opening {
            return Err(self.invalid("reject entry"));
        }
        self.position = None;
        self.state = PositionState::Rejected { reason: reason.into() };
        Ok(())
    }

    /// Next ATR stage reached at `price`, if any.
    ///
    /// Stage fractions apply to the size remaining when the stage fires. A
    /// slice that would leave less than the symbol minimum closes everything.
    pub fn evaluate_partial_close(&self, price: f64) -> Option<PartialCloseAction> {
        if !self.state.is_active() {
            return None;
        }
        let position = self.position.as_ref()?;
        let stage = position.stages_done;
        let spec = self.config.partial_close_stages.get(stage)?;

        if position.profit_in_atr(price)? < spec.atr_multiple {
            return None;
        }

        let remaining = position.size;
        let mut qty = floor_to_step(remaining * spec.fraction, self.symbol.qty_step).min(remaining);
        let is_last = stage + 1 == self.config.partial_close_stages.len();

        if spec.fraction >= 1.0 || remaining - qty < self.symbol.min_qty - SIZE_EPSILON {
            qty = remaining;
        } else if qty < self.symbol.min_qty - SIZE_EPSILON && !is_last {
            return Some(PartialCloseAction::SkipStage { stage, qty });
        }

        Some(PartialCloseAction::Close {
            stage,
            qty,
            closes_all: (remaining - qty).abs() <= SIZE_EPSILON,
        })
    }

    /// Mark a stage as handled without an order
    pub fn skip_stage(&mut self, stage: usize) -> Result<(), TransitionError> {
        if !self.state.is_active() {
            return Err(self.invalid("skip a partial close"));
        }
        if let Some(position) = self.position.as_mut() {
            position.stages_done = position.stages_done.max(stage + 1);
        }
        Ok(())
    }

    /// Record a filled partial close. Returns the finished position when nothing is left.
    pub fn apply_partial_close(
        &mut self,
        stage: usize,
        qty: f64,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<Position>, TransitionError> {
        if !self.state.is_active() {
            return Err(self.invalid("partially close"));
        }
        let step = self.symbol.qty_step;
        let position = self.position.as_mut().ok_or(TransitionError::Invalid {
            state: "Open",
            action: "partially close without a position",
        })?;

        if qty > position.size + SIZE_EPSILON {
            return Err(TransitionError::Oversized {
                requested: qty,
                remaining: position.size,
            });
        }

        position.size = round_to_tick(position.size - qty, step).max(0.0);
        position.stages_done = position.stages_done.max(stage + 1);
        position.partial_closes.push(PartialClose {
            stage,
            size: qty,
            price,
            timestamp: now,
        });

        if position.size <= SIZE_EPSILON {
            return Ok(self.finish());
        }

        self.state = PositionState::PartiallyClosed {
            remaining_fraction: position.size / position.original_size,
        };
        Ok(None)
    }

    /// Candidate stop at `price`, if moving is worth it.
    ///
    /// The trailing stop is adopted when it beats the current stop by at
    /// least the minimum step; break-even applies once profit reaches
    /// `break_even_atr` ATRs. The more favorable of the two wins.
    pub fn evaluate_trailing_stop(&self, price: f64) -> Option<f64> {
        if !self.state.is_active() {
            return None;
        }
        let position = self.position.as_ref()?;
        let dir = position.side.direction();
        let current = position.stop_loss;
        let improves = |candidate: f64| (candidate - current) * dir > 0.0;

        let mut best = None;

        let trailing = round_to_tick(
            price * (1.0 - dir * self.config.trailing_percent / 100.0),
            self.symbol.tick_size,
        );
        let step_pct = if current > 0.0 {
            (trailing - current) * dir / current * 100.0
        } else {
            f64::INFINITY
        };
        if improves(trailing) && step_pct + 1e-9 >= self.config.min_trailing_step_percent {
            best = Some(trailing);
        }

        if let Some(atr) = position.atr.filter(|a| *a > 0.0) {
            let break_even = position.entry_price;
            let reached = position.favorable_move(price) >= self.config.break_even_atr * atr;
            let beats_best = best.map_or(true, |b: f64| (break_even - b) * dir > 0.0);
            if reached && improves(break_even) && beats_best {
                best = Some(break_even);
            }
        }

        best
    }

    /// Adopt a stop the venue confirmed. Stops only ever tighten.
    pub fn apply_stop(&mut self, stop: f64) -> Result<(), TransitionError> {
        if !self.state.is_active() {
            return Err(self.invalid("move the stop"));
        }
        let position = self.position.as_mut().ok_or(TransitionError::Invalid {
            state: "Open",
            action: "move the stop without a position",
        })?;

        let current = position.stop_loss;
        if (stop - current) * position.side.direction() <= 0.0 {
            return Err(TransitionError::StopNotImproved { current, proposed: stop });
        }
        position.stop_loss = stop;
        Ok(())
    }

    /// Reconcile with the venue's view of the symbol
    pub fn sync_with_venue(&mut self, venue: Option<&VenuePosition>) -> SyncOutcome {
        let venue = venue.filter(|v| v.is_open());

        if !self.state.is_active() {
            return match venue {
                Some(v) if self.state != PositionState::Opening => SyncOutcome::Untracked(v.clone()),
                _ => SyncOutcome::Flat,
            };
        }

        let Some(position) = self.position.as_mut() else {
            return SyncOutcome::Flat;
        };

        match venue {
            None => match self.finish() {
                Some(position) => SyncOutcome::ClosedExternally(position),
                None => SyncOutcome::Flat,
            },
            Some(v) if v.size + SIZE_EPSILON < position.size => {
                let from = position.size;
                position.size = v.size;
                self.state = PositionState::PartiallyClosed {
                    remaining_fraction: v.size / position.original_size,
                };
                SyncOutcome::Reduced { from, to: v.size }
            }
            Some(_) => SyncOutcome::Unchanged,
        }
    }

    /// Explicit close after the venue filled the closing order
    pub fn close(&mut self) -> Result<Position, TransitionError> {
        if !self.state.is_active() {
            return Err(self.invalid("close"));
        }
        self.finish().ok_or(TransitionError::Invalid {
            state: "Open",
            action: "close without a position",
        })
    }

    fn finish(&mut self) -> Option<Position> {
        self.state = PositionState::Closed;
        self.position.take()
    }

    /// Closed / Rejected → Flat
    pub fn reset(&mut self) {
        if matches!(self.state, PositionState::Closed | PositionState::Rejected { .. }) {
            self.state = PositionState::Flat;
        }
    }
}
