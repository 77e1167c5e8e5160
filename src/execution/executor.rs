use chrono::Utc;
use std::sync::{Arc, Mutex};

use crate::api::Exchange;
use crate::error::BotError;
use crate::execution::position_manager::{
    EntryOrderKind, PartialCloseAction, Position, PositionStateMachine, SyncOutcome,
};
use crate::models::{AccountSnapshot, OrderRequest, OrderType, Side, TimeInForce, VenuePosition};
use crate::notify::Notifier;
use crate::risk::precision::{floor_to_step, round_to_tick};
use crate::risk::{CircuitBreaker, EntryPlan, RiskManager};

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    Enter(EntryPlan),
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

impl ExecutionDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: ExecutionAction::Skip,
            reason: reason.into(),
        }
    }
}

/// What happened to an accepted entry
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOutcome {
    pub position: Position,
    pub protection_attached: bool,
    pub ladder_orders: usize,
}

/// What one management pass did to the open position
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManageOutcome {
    pub partial_close: Option<(usize, f64)>,
    pub skipped_stage: Option<usize>,
    pub new_stop: Option<f64>,
    pub closed: Option<Position>,
}

fn order_link_id(tag: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("pb-{}-{}", tag, &id[..24])
}

/// Sends orders for the state machine and applies their confirmed results.
///
/// Local state changes only after the venue answered; every failure inside a
/// transition is logged, notified and leaves the position as it was.
pub struct Executor {
    exchange: Arc<dyn Exchange>,
    notifier: Arc<dyn Notifier>,
    risk: RiskManager,
    // Last stop-update failure already alerted, as "position id: error"
    stop_failure: Mutex<Option<String>>,
}

impl Executor {
    pub fn new(exchange: Arc<dyn Exchange>, notifier: Arc<dyn Notifier>, risk: RiskManager) -> Self {
        Self {
            exchange,
            notifier,
            risk,
            stop_failure: Mutex::new(None),
        }
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    /// Decide whether a signalled side becomes an entry
    pub fn process_signal(
        &self,
        side: Side,
        price: f64,
        atr: Option<f64>,
        account: &AccountSnapshot,
        leverage: f64,
        machine: &PositionStateMachine,
        breaker: &CircuitBreaker,
    ) -> ExecutionDecision {
        // Check 1: one position at a time
        if !machine.can_open() {
            return ExecutionDecision::skip(format!("Position already {}", machine.state()));
        }

        // Check 2: Circuit breakers
        if let Err(trip) = breaker.check() {
            return ExecutionDecision::skip(format!("Circuit breaker: {}", trip));
        }

        // Check 3: stop, size, ladder and margin
        match self.risk.plan_entry(side, price, atr, account, leverage) {
            Ok(plan) => ExecutionDecision {
                reason: format!(
                    "{} {} @ {:.4}, SL {:.4}, TP {:.4}/{:.4}/{:.4}",
                    plan.side,
                    plan.quantity,
                    plan.entry_price,
                    plan.stop_loss,
                    plan.take_profits[0],
                    plan.take_profits[1],
                    plan.take_profits[2]
                ),
                action: ExecutionAction::Enter(plan),
            },
            Err(rejection) => ExecutionDecision::skip(format!("Risk check: {}", rejection)),
        }
    }

    /// Place the entry, then protect it.
    ///
    /// Opening is entered and left in the same synchronous step once the
    /// venue answered, so no await point ever observes it.
    pub async fn open_position(
        &self,
        machine: &mut PositionStateMachine,
        plan: &EntryPlan,
    ) -> Result<OpenOutcome, BotError> {
        if !machine.can_open() {
            return Err(BotError::InvalidState(format!("cannot open while {}", machine.state())));
        }
        let symbol = self.risk.symbol().symbol.clone();
        let tick = self.risk.symbol().tick_size;

        let (order_type, price, tif) = match machine.config().entry_order {
            EntryOrderKind::PostOnlyLimit => (
                OrderType::Limit,
                Some(round_to_tick(plan.entry_price, tick)),
                TimeInForce::PostOnly,
            ),
            EntryOrderKind::Market => (OrderType::Market, None, TimeInForce::ImmediateOrCancel),
        };

        let request = OrderRequest {
            symbol: symbol.clone(),
            side: plan.side,
            order_type,
            qty: plan.quantity,
            price,
            time_in_force: tif,
            reduce_only: false,
            order_link_id: order_link_id("entry"),
        };

        tracing::info!(
            "🟢 Placing {} {} {} @ {:?} ({:?})",
            plan.side,
            plan.quantity,
            symbol,
            price,
            tif
        );

        let placed = self.exchange.place_order(&request).await;

        // Fill check: a dead order means the entry never happened
        let detail = match &placed {
            Ok(ack) => match self.exchange.order_detail(&symbol, &ack.order_id).await {
                Ok(detail) => Some(detail),
                Err(e) => {
                    tracing::warn!("⚠️  Could not fetch entry order {}: {}", ack.order_id, e);
                    None
                }
            },
            Err(_) => None,
        };

        machine.begin_open(plan, Utc::now())?;

        let ack = match placed {
            Ok(ack) => ack,
            Err(e) => {
                let _ = machine.reject_open(e.to_string());
                tracing::error!("❌ Entry rejected: {}", e);
                self.notifier
                    .notify(&format!("❌ Entry {} {} {} rejected: {}", plan.side, plan.quantity, symbol, e))
                    .await;
                return Err(e);
            }
        };

        if let Some(detail) = detail.as_ref().filter(|d| d.status.is_dead()) {
            let reason = format!("entry order {} ended {:?}", detail.order_id, detail.status);
            let _ = machine.reject_open(reason.clone());
            tracing::warn!("❌ {}", reason);
            self.notifier.notify(&format!("❌ {} {}: {}", plan.side, symbol, reason)).await;
            return Err(BotError::ExchangeRejected {
                code: 0,
                message: reason,
            });
        }

        let fill_price = detail.as_ref().map(|d| d.avg_price);
        let position = machine.confirm_open(&ack.order_id, fill_price)?.clone();

        tracing::info!(
            "✅ Opened {} {} {} @ {:.4} (order {})",
            position.side,
            position.size,
            symbol,
            position.entry_price,
            ack.order_id
        );
        self.notifier
            .notify(&format!(
                "✅ Opened {} {} {} @ {:.4}\nSL {:.4} | TP {:.4} / {:.4} / {:.4}",
                position.side,
                position.size,
                symbol,
                position.entry_price,
                position.stop_loss,
                position.take_profits[0],
                position.take_profits[1],
                position.take_profits[2]
            ))
            .await;

        // SL + TP1 together; a failure keeps the position open and raises an alert
        let protection_attached = match self
            .exchange
            .set_trading_stop(&symbol, position.side, Some(position.stop_loss), Some(position.take_profits[0]))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("🚨 Failed to attach SL/TP to {} {}: {}", position.side, symbol, e);
                self.notifier
                    .notify(&format!(
                        "🚨 {} {} is OPEN WITHOUT PROTECTION: SL/TP attach failed: {}",
                        position.side, symbol, e
                    ))
                    .await;
                false
            }
        };

        let ladder_orders = self.place_take_profit_ladder(machine, &position).await;

        Ok(OpenOutcome {
            position,
            protection_attached,
            ladder_orders,
        })
    }

    /// TP2 / TP3 as reduce-only limits sized on the original quantity
    async fn place_take_profit_ladder(&self, machine: &PositionStateMachine, position: &Position) -> usize {
        let spec = self.risk.symbol();
        let config = machine.config();
        let mut placed = 0;

        let rungs = [
            (2, config.tp2_fraction, position.take_profits[1]),
            (3, config.tp3_fraction, position.take_profits[2]),
        ];

        for (rung, fraction, price) in rungs {
            let qty = floor_to_step(position.original_size * fraction, spec.qty_step);
            if qty < spec.min_qty {
                tracing::debug!("TP{} size {} below minimum {}, not placed", rung, qty, spec.min_qty);
                continue;
            }

            let request = OrderRequest {
                symbol: spec.symbol.clone(),
                side: position.side.opposite(),
                order_type: OrderType::Limit,
                qty,
                price: Some(price),
                time_in_force: TimeInForce::GoodTillCancel,
                reduce_only: true,
                order_link_id: order_link_id(&format!("tp{}", rung)),
            };

            match self.exchange.place_order(&request).await {
                Ok(ack) => {
                    tracing::info!("🎯 TP{} placed: {} @ {:.4} (order {})", rung, qty, price, ack.order_id);
                    placed += 1;
                }
                Err(e) => {
                    tracing::error!("❌ TP{} order failed: {}", rung, e);
                    self.notifier
                        .notify(&format!("⚠️ TP{} for {} not placed: {}", rung, spec.symbol, e))
                        .await;
                }
            }
        }

        placed
    }

    /// Partial closes first, then the trailing / break-even stop
    pub async fn manage_position(
        &self,
        machine: &mut PositionStateMachine,
        price: f64,
    ) -> Result<ManageOutcome, BotError> {
        let mut outcome = ManageOutcome::default();

        match machine.evaluate_partial_close(price) {
            Some(PartialCloseAction::Close { stage, qty, closes_all }) => {
                let side = match machine.position() {
                    Some(p) => p.side,
                    None => return Ok(outcome),
                };
                self.send_reduce_only(side, qty, &format!("stage{}", stage + 1)).await?;

                let finished = machine.apply_partial_close(stage, qty, price, Utc::now())?;

                tracing::info!(
                    "✂️  Stage {} partial close: {} @ {:.4}{}",
                    stage + 1,
                    qty,
                    price,
                    if closes_all { " (position flat)" } else { "" }
                );
                self.notifier
                    .notify(&format!("✂️ Stage {} close {} {} @ {:.4}", stage + 1, side, qty, price))
                    .await;

                outcome.partial_close = Some((stage, qty));
                if finished.is_some() {
                    outcome.closed = finished;
                    return Ok(outcome);
                }
            }
            Some(PartialCloseAction::SkipStage { stage, qty }) => {
                tracing::info!("⏭️  Stage {} slice {} below minimum, skipped", stage + 1, qty);
                machine.skip_stage(stage)?;
                outcome.skipped_stage = Some(stage);
            }
            None => {}
        }

        if let Some(stop) = machine.evaluate_trailing_stop(price) {
            let (id, side, symbol, old) = match machine.position() {
                Some(p) => (p.id, p.side, p.symbol.clone(), p.stop_loss),
                None => return Ok(outcome),
            };

            if let Err(e) = self.exchange.set_trading_stop(&symbol, side, Some(stop), None).await {
                tracing::error!("❌ Stop move {:.4} → {:.4} on {} failed: {}", old, stop, symbol, e);
                if self.mark_stop_failure(format!("{}: {}", id, e)) {
                    self.notifier
                        .notify(&format!(
                            "🚨 Stop update for {} {} failed ({:.4} → {:.4}), still at {:.4}: {}",
                            side, symbol, old, stop, old, e
                        ))
                        .await;
                }
                return Err(e);
            }
            self.clear_stop_failure();
            machine.apply_stop(stop)?;

            tracing::info!("🔒 Stop moved {:.4} → {:.4} (price {:.4})", old, stop, price);
            outcome.new_stop = Some(stop);
        }

        Ok(outcome)
    }

    /// True the first time a given failure is seen
    fn mark_stop_failure(&self, key: String) -> bool {
        match self.stop_failure.lock() {
            Ok(last) if last.as_deref() == Some(key.as_str()) => false,
            Ok(mut last) => {
                *last = Some(key);
                true
            }
            Err(_) => true,
        }
    }

    fn clear_stop_failure(&self) {
        if let Ok(mut last) = self.stop_failure.lock() {
            *last = None;
        }
    }

    /// Close whatever is left with a reduce-only market order
    pub async fn close_position(
        &self,
        machine: &mut PositionStateMachine,
        reason: &str,
    ) -> Result<Option<Position>, BotError> {
        let (side, size) = match machine.position() {
            Some(p) if machine.state().is_active() => (p.side, p.size),
            _ => return Ok(None),
        };

        self.send_reduce_only(side, size, "close").await?;
        let position = machine.close()?;

        tracing::info!("🔴 Closed {} {} ({})", side, size, reason);
        self.notifier
            .notify(&format!("🔴 Closed {} {} {} ({})", side, size, position.symbol, reason))
            .await;
        Ok(Some(position))
    }

    async fn send_reduce_only(&self, position_side: Side, qty: f64, tag: &str) -> Result<(), BotError> {
        let request = OrderRequest {
            symbol: self.risk.symbol().symbol.clone(),
            side: position_side.opposite(),
            order_type: OrderType::Market,
            qty,
            price: None,
            time_in_force: TimeInForce::ImmediateOrCancel,
            reduce_only: true,
            order_link_id: order_link_id(tag),
        };

        match self.exchange.place_order(&request).await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!("❌ Reduce-only {} order failed: {}", tag, e);
                self.notifier
                    .notify(&format!("❌ Reduce-only {} {} {} failed: {}", tag, request.side, qty, e))
                    .await;
                Err(e)
            }
        }
    }

    /// Compare local state with the venue and apply what it reports
    pub async fn sync_with_venue(
        &self,
        machine: &mut PositionStateMachine,
    ) -> Result<(SyncOutcome, Option<VenuePosition>), BotError> {
        let symbol = &self.risk.symbol().symbol;
        let positions = self.exchange.positions(symbol).await?;
        let venue = positions.into_iter().find(|p| &p.symbol == symbol && p.is_open());

        let outcome = machine.sync_with_venue(venue.as_ref());
        match &outcome {
            SyncOutcome::Reduced { from, to } => {
                tracing::info!("📉 Venue size {} → {} (take-profit fill)", from, to);
            }
            SyncOutcome::ClosedExternally(position) => {
                tracing::info!("🏁 {} {} closed on the venue", position.side, position.symbol);
                self.notifier
                    .notify(&format!("🏁 {} {} position closed on the exchange", position.side, position.symbol))
                    .await;
            }
            SyncOutcome::Untracked(v) => {
                tracing::warn!("⚠️  Venue holds an untracked {:?} {} {}, entries paused", v.side, v.size, v.symbol);
            }
            SyncOutcome::Flat | SyncOutcome::Unchanged => {}
        }

        Ok((outcome, venue))
    }
}
