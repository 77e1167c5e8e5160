use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use crate::api::Exchange;
use crate::config::BotConfig;
use crate::control::{ControlInbox, ForcedTrade};
use crate::error::BotError;
use crate::execution::{
    ExecutionAction, Executor, ManageOutcome, Position, PositionState, PositionStateMachine,
    SyncOutcome,
};
use crate::indicators::calculate_atr;
use crate::models::{AccountSnapshot, ClosedTrade, MarketSnapshot, Side, VenuePosition};
use crate::notify::Notifier;
use crate::persistence::{BotSnapshot, SnapshotStore, TradingStateView};
use crate::risk::precision::floor_to_step;
use crate::risk::{CircuitBreaker, EntryPlan, RiskManager};
use crate::strategy::{build_strategy, Strategy};

const RECENT_TRADES_CAPACITY: usize = 50;
const CLOSED_PNL_LIMIT: usize = 50;
// Re-read a little of the previous window; duplicates are filtered by order id
const CLOSED_PNL_OVERLAP_SECS: i64 = 60;

/// Read-only view published to the monitor loop after every cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorView {
    pub state: String,
    pub position: Option<Position>,
    pub venue: Option<VenuePosition>,
    pub price: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// How the entry step of a cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Opened { side: Side, quantity: f64 },
    Skipped(String),
    Failed(String),
}

/// Summary of one trading cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub rolled_over: bool,
    pub refreshed: bool,
    pub forced: bool,
    pub signal: Option<Side>,
    pub entry: Option<EntryOutcome>,
    pub managed: Option<ManageOutcome>,
    pub closed_trades: usize,
    pub snapshot_written: bool,
}

/// Owns every piece of mutable trading state and drives one cycle at a time.
///
/// Decision code (strategy, risk) only ever sees snapshots; the position
/// machine and the breaker are mutated here and nowhere else.
pub struct Orchestrator {
    config: BotConfig,
    exchange: Arc<dyn Exchange>,
    notifier: Arc<dyn Notifier>,
    strategy: Box<dyn Strategy>,
    executor: Executor,
    machine: PositionStateMachine,
    breaker: CircuitBreaker,
    control: ControlInbox,
    store: SnapshotStore,
    recent_trades: VecDeque<ClosedTrade>,
    last_pnl_check: DateTime<Utc>,
    last_price: Option<f64>,
    last_account: Option<AccountSnapshot>,
    last_venue: Option<VenuePosition>,
    untracked_venue_position: bool,
    last_entry_at: Option<DateTime<Utc>>,
    last_failure: Option<String>,
    cycles: u64,
    view_tx: watch::Sender<MonitorView>,
}

impl Orchestrator {
    pub fn new(
        config: BotConfig,
        exchange: Arc<dyn Exchange>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, BotError> {
        config.validate()?;

        let spec = config.symbol_spec();
        let strategy = build_strategy(config.trading.strategy, config.signal.clone());
        let risk = RiskManager::new(config.risk.clone(), spec.clone(), strategy.ladder());
        let executor = Executor::new(exchange.clone(), notifier.clone(), risk);
        let machine = PositionStateMachine::new(config.position.clone(), spec);
        let breaker = CircuitBreaker::new(config.breaker.clone(), Local::now().date_naive());
        let control = ControlInbox::new(config.paths.control_file.clone());
        let store = SnapshotStore::new(config.paths.snapshot_dir.clone());
        let last_pnl_check = Utc::now() - ChronoDuration::seconds(config.trading.closed_pnl_lookback_secs);
        let (view_tx, _) = watch::channel(MonitorView::default());

        Ok(Self {
            config,
            exchange,
            notifier,
            strategy,
            executor,
            machine,
            breaker,
            control,
            store,
            recent_trades: VecDeque::with_capacity(RECENT_TRADES_CAPACITY),
            last_pnl_check,
            last_price: None,
            last_account: None,
            last_venue: None,
            untracked_venue_position: false,
            last_entry_at: None,
            last_failure: None,
            cycles: 0,
            view_tx,
        })
    }

    pub fn machine(&self) -> &PositionStateMachine {
        &self.machine
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn recent_trades(&self) -> impl Iterator<Item = &ClosedTrade> {
        self.recent_trades.iter()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorView> {
        self.view_tx.subscribe()
    }

    fn symbol(&self) -> &str {
        &self.config.trading.symbol
    }

    /// Leverage setup and the startup notification
    pub async fn initialize(&mut self) -> Result<(), BotError> {
        let symbol = self.symbol().to_string();
        let leverage = self.config.trading.leverage;

        let positions = self.exchange.positions(&symbol).await?;
        let current = positions.iter().find(|p| p.symbol == symbol).map(|p| p.leverage);

        match current {
            Some(lev) if (lev - f64::from(leverage)).abs() < 1e-9 => {
                tracing::info!("⚙️  Leverage already {}x on {}", leverage, symbol);
            }
            _ => {
                self.exchange.set_leverage(&symbol, leverage, leverage).await?;
                tracing::info!("⚙️  Leverage set to {}x on {}", leverage, symbol);
            }
        }

        self.notifier
            .notify(&format!(
                "🤖 Trading bot started\n📊 Pair: {}\n📈 Leverage: {}x\n💰 Risk per trade: {}%\n🧠 Strategy: {}",
                symbol,
                leverage,
                self.config.risk.risk_percent,
                self.strategy.name()
            ))
            .await;
        Ok(())
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport, BotError> {
        self.run_cycle_at(Utc::now(), Local::now().date_naive()).await
    }

    /// One full cycle: rollover, venue sync, control input, manage or enter,
    /// closed trades, snapshot.
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>, today: NaiveDate) -> Result<CycleReport, BotError> {
        let mut report = CycleReport::default();

        // 1. Daily rollover, before anything reads the breaker
        if self.breaker.roll_over_at(today) {
            report.rolled_over = true;
            self.notifier
                .notify(&format!("📅 Daily statistics reset for {}", today))
                .await;
        }

        // 2. Venue reconciliation
        if matches!(self.machine.state(), PositionState::Closed | PositionState::Rejected { .. }) {
            self.machine.reset();
        }
        let (sync, venue) = self.executor.sync_with_venue(&mut self.machine).await?;
        self.untracked_venue_position = matches!(sync, SyncOutcome::Untracked(_));
        self.last_venue = venue;
        if let SyncOutcome::ClosedExternally(_) = sync {
            self.machine.reset();
        }

        let price = self.exchange.latest_price(self.symbol()).await?;
        self.last_price = Some(price);

        // 3. Control input, only once the venue reads succeeded: flags are
        // cleared on disk when this returns
        let mut forced = None;
        match self.control.poll().await {
            Ok(requests) => {
                report.refreshed = requests.refresh;
                forced = requests.forced_trade;
            }
            Err(e) => tracing::warn!("⚠️  Control file unreadable: {}", e),
        }

        // 4. Manage the open position, or look for an entry
        if self.machine.state().is_active() {
            if forced.is_some() {
                tracing::warn!("⚠️  Forced trade ignored: a position is already open");
                self.notifier
                    .notify("⚠️ Forced trade ignored: a position is already open")
                    .await;
            }
            match self.executor.manage_position(&mut self.machine, price).await {
                Ok(outcome) => report.managed = Some(outcome),
                Err(e) => tracing::error!("❌ Position management failed: {}", e),
            }
        } else if let Some(request) = forced {
            report.forced = true;
            report.entry = Some(self.forced_entry(request, now).await);
        } else {
            let (signal, entry) = self.signal_entry(price, now).await?;
            report.signal = signal;
            report.entry = Some(entry);
        }

        // 5. Closed trades feed the breaker
        report.closed_trades = self.process_closed_trades(now).await?;
        if let Some(trip) = self.breaker.take_new_trip() {
            tracing::warn!("🛑 Circuit breaker tripped: {}", trip);
            self.notifier
                .notify(&format!(
                    "🛑 Circuit breaker: {}. New entries paused until the daily reset.\nDaily PnL {:.2} | Loss streak {} | Trades {}",
                    trip,
                    self.breaker.state().daily_pnl,
                    self.breaker.state().consecutive_losses,
                    self.breaker.state().daily_trades
                ))
                .await;
        }

        // 6. Snapshot
        self.cycles += 1;
        let every = self.config.trading.snapshot_every_cycles.max(1);
        if report.refreshed || self.cycles % every == 0 {
            report.snapshot_written = self.write_snapshot(now).await;
        }

        self.publish(now);
        Ok(report)
    }

    async fn forced_entry(&mut self, request: Result<ForcedTrade, String>, now: DateTime<Utc>) -> EntryOutcome {
        let trade = match request {
            Ok(trade) => trade,
            Err(reason) => {
                tracing::warn!("⚠️  Forced trade rejected: {}", reason);
                self.notifier
                    .notify(&format!("❌ Forced trade rejected: {}", reason))
                    .await;
                return EntryOutcome::Skipped(reason);
            }
        };

        if let Some(reason) = self.entry_blocker() {
            self.notifier
                .notify(&format!("⛔ Forced {} not placed: {}", trade.side, reason))
                .await;
            return EntryOutcome::Skipped(reason);
        }

        let spec = self.machine.symbol().clone();
        let qty = floor_to_step(trade.qty, spec.qty_step);
        if qty < spec.min_qty {
            let reason = format!("quantity {} below minimum {}", trade.qty, spec.min_qty);
            self.notifier
                .notify(&format!("❌ Forced trade rejected: {}", reason))
                .await;
            return EntryOutcome::Skipped(reason);
        }

        let mut plan = trade.into_plan();
        plan.quantity = qty;

        let account = match self.exchange.wallet_balance(&self.config.exchange.account_type).await {
            Ok(account) => account,
            Err(e) => {
                tracing::error!("❌ Forced trade dropped, no balance: {}", e);
                self.notifier
                    .notify(&format!("❌ Forced trade dropped: {}", e))
                    .await;
                return EntryOutcome::Failed(e.to_string());
            }
        };
        self.last_account = Some(account.clone());

        let risk = self.executor.risk();
        let checked = risk
            .validate_stop_distance(plan.entry_price, plan.stop_loss)
            .and_then(|_| {
                risk.validate_margin(
                    account.available_balance,
                    plan.entry_price,
                    plan.quantity,
                    f64::from(self.config.trading.leverage),
                )
            });
        if let Err(rejection) = checked {
            let reason = rejection.to_string();
            tracing::warn!("⛔ Forced trade rejected: {}", reason);
            self.notifier
                .notify(&format!("❌ Forced trade rejected: {}", reason))
                .await;
            return EntryOutcome::Skipped(reason);
        }

        tracing::info!("🎮 Forced {} {} @ {:.4}", plan.side, plan.quantity, plan.entry_price);
        self.open_entry(&plan, now).await
    }

    async fn open_entry(&mut self, plan: &EntryPlan, now: DateTime<Utc>) -> EntryOutcome {
        match self.executor.open_position(&mut self.machine, plan).await {
            Ok(outcome) => {
                self.last_entry_at = Some(now);
                EntryOutcome::Opened {
                    side: outcome.position.side,
                    quantity: outcome.position.size,
                }
            }
            Err(e) => EntryOutcome::Failed(e.to_string()),
        }
    }

    /// Remaining wait before another signal entry, given the required interval
    fn entry_cooldown(&self, now: DateTime<Utc>, interval_secs: u64) -> Option<String> {
        let last = self.last_entry_at?;
        let elapsed = (now - last).num_seconds();
        let interval = i64::try_from(interval_secs).unwrap_or(i64::MAX);
        if elapsed < interval {
            return Some(format!("entry cooldown: {}s of {}s left", interval - elapsed, interval));
        }
        None
    }

    /// Why no entry may be attempted right now, if anything
    fn entry_blocker(&self) -> Option<String> {
        if self.untracked_venue_position {
            return Some("venue holds a position this bot does not track".to_string());
        }
        if !self.machine.can_open() {
            return Some(format!("position state {}", self.machine.state()));
        }
        if let Err(trip) = self.breaker.check() {
            return Some(format!("Circuit breaker: {}", trip));
        }
        None
    }

    async fn signal_entry(&mut self, price: f64, now: DateTime<Utc>) -> Result<(Option<Side>, EntryOutcome), BotError> {
        let blocked = self
            .entry_blocker()
            .or_else(|| self.entry_cooldown(now, self.config.trading.min_entry_interval_secs));
        if let Some(reason) = blocked {
            tracing::info!("⛔ Entry blocked: {}", reason);
            return Ok((None, EntryOutcome::Skipped(reason)));
        }

        let snapshot = self.market_snapshot(price, now).await?;

        // Volatile markets wait longer between entries
        let atr = calculate_atr(&snapshot.candles, self.config.signal.atr_period);
        if let Some(atr) = atr.filter(|a| *a / price * 100.0 > self.config.trading.high_volatility_atr_pct) {
            let interval = self.config.trading.high_volatility_entry_interval_secs;
            if let Some(reason) = self.entry_cooldown(now, interval) {
                tracing::info!("🌪️  High volatility (ATR {:.4}), {}", atr, reason);
                return Ok((None, EntryOutcome::Skipped(reason)));
            }
        }

        let Some(signal) = self.strategy.generate_signal(&snapshot) else {
            return Ok((None, EntryOutcome::Skipped("no signal".to_string())));
        };

        tracing::info!(
            "📡 [{}] {} signal (trend {:?}, book {}, liquidity {})",
            self.strategy.name(),
            signal.side,
            signal.trend,
            signal.order_book,
            signal.liquidity
        );

        let account = self.exchange.wallet_balance(&self.config.exchange.account_type).await?;
        self.last_account = Some(account.clone());

        let decision = self.executor.process_signal(
            signal.side,
            price,
            atr,
            &account,
            f64::from(self.config.trading.leverage),
            &self.machine,
            &self.breaker,
        );

        let plan = match decision.action {
            ExecutionAction::Enter(plan) => plan,
            ExecutionAction::Skip => {
                tracing::info!("⏭️  {} signal skipped: {}", signal.side, decision.reason);
                return Ok((Some(signal.side), EntryOutcome::Skipped(decision.reason)));
            }
        };

        tracing::info!("💹 Entry: {}", decision.reason);
        let outcome = self.open_entry(&plan, now).await;
        Ok((Some(signal.side), outcome))
    }

    async fn market_snapshot(&self, price: f64, now: DateTime<Utc>) -> Result<MarketSnapshot, BotError> {
        let symbol = self.symbol();
        let trading = &self.config.trading;
        let signal = &self.config.signal;

        let candles = self
            .exchange
            .candles(symbol, &trading.candle_interval, trading.candle_limit)
            .await?;
        let order_book = self.exchange.order_book(symbol, signal.orderbook_depth).await?;
        let executions = self
            .exchange
            .recent_executions(symbol, signal.volume_lookback)
            .await?;

        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            price,
            candles,
            order_book,
            executions,
            taken_at: now,
        })
    }

    /// Feed newly closed trades to the breaker, oldest first
    async fn process_closed_trades(&mut self, now: DateTime<Utc>) -> Result<usize, BotError> {
        let start = self.last_pnl_check - ChronoDuration::seconds(CLOSED_PNL_OVERLAP_SECS);
        let symbol = self.symbol().to_string();

        let mut trades = self.exchange.closed_pnl(&symbol, start, now, CLOSED_PNL_LIMIT).await?;
        self.last_pnl_check = now;
        trades.sort_by_key(|t| t.closed_at);

        let mut recorded = 0;
        for mut trade in trades {
            if self.breaker.state().processed_orders.contains(&trade.order_id) {
                continue;
            }

            if trade.exit_price <= 0.0 {
                match self.exchange.order_detail(&symbol, &trade.order_id).await {
                    Ok(detail) if detail.avg_price > 0.0 => trade.exit_price = detail.avg_price,
                    Ok(_) => {}
                    Err(e) => tracing::warn!("⚠️  No detail for closed order {}: {}", trade.order_id, e),
                }
            }

            if !self.breaker.record_closed_trade(&trade) {
                continue;
            }
            recorded += 1;

            let icon = if trade.is_loss() { "🔻" } else { "💰" };
            self.notifier
                .notify(&format!(
                    "{} Closed {} {} {} @ {:.4} → {:.4}\nPnL {:.2} | Daily {:.2} | Loss streak {}",
                    icon,
                    trade.side,
                    trade.quantity,
                    symbol,
                    trade.entry_price,
                    trade.exit_price,
                    trade.realized_pnl,
                    self.breaker.state().daily_pnl,
                    self.breaker.state().consecutive_losses
                ))
                .await;

            if self.recent_trades.len() == RECENT_TRADES_CAPACITY {
                self.recent_trades.pop_front();
            }
            self.recent_trades.push_back(trade);
        }

        Ok(recorded)
    }

    fn snapshot(&self, now: DateTime<Utc>) -> BotSnapshot {
        BotSnapshot {
            taken_at: now,
            symbol: self.symbol().to_string(),
            latest_price: self.last_price,
            account: self.last_account.clone(),
            position_state: self.machine.state().to_string(),
            position: self.machine.position().cloned(),
            breaker: TradingStateView::new(self.breaker.state(), self.breaker.can_enter()),
            recent_trades: self.recent_trades.iter().cloned().collect(),
            cycles: self.cycles,
        }
    }

    async fn write_snapshot(&mut self, now: DateTime<Utc>) -> bool {
        if self.last_account.is_none() || self.cycles % 10 == 0 {
            match self.exchange.wallet_balance(&self.config.exchange.account_type).await {
                Ok(account) => self.last_account = Some(account),
                Err(e) => tracing::warn!("⚠️  Balance unavailable for snapshot: {}", e),
            }
        }

        match self.store.save(&self.snapshot(now)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("❌ Snapshot write failed: {}", e);
                false
            }
        }
    }

    fn publish(&self, now: DateTime<Utc>) {
        self.view_tx.send_replace(MonitorView {
            state: self.machine.state().to_string(),
            position: self.machine.position().cloned(),
            venue: self.last_venue.clone(),
            price: self.last_price,
            updated_at: Some(now),
        });
    }

    /// Log and notify a cycle result; each distinct failure is notified once
    pub async fn record_cycle_result(&mut self, result: Result<CycleReport, BotError>) {
        match result {
            Ok(report) => {
                if self.last_failure.take().is_some() {
                    tracing::info!("✅ Cycle recovered");
                }
                tracing::debug!("Cycle {} done: {:?}", self.cycles, report);
            }
            Err(e) => {
                let key = e.to_string();
                tracing::error!("❌ Cycle failed ({}): {}", e.kind(), key);
                if self.last_failure.as_deref() != Some(key.as_str()) {
                    self.notifier.notify(&format!("⚠️ Trading cycle failed: {}", key)).await;
                    self.last_failure = Some(key);
                }
            }
        }
    }

    /// Trading loop until `shutdown` flips to true.
    ///
    /// A cycle in flight when shutdown arrives is dropped at its current
    /// await point; state is only ever changed after a confirmed response.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), BotError> {
        self.initialize().await?;

        let monitor = tokio::spawn(monitor_loop(
            self.subscribe(),
            Duration::from_secs(self.config.trading.monitor_interval_secs),
            f64::from(self.config.trading.leverage),
            shutdown.clone(),
        ));

        let period = Duration::from_secs(self.config.trading.check_interval_secs);
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("💹 Trading loop every {:?} on {}", period, self.symbol());

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let result = tokio::select! {
                result = self.run_cycle() => Some(result),
                _ = shutdown.changed() => None,
            };

            match result {
                Some(result) => self.record_cycle_result(result).await,
                None => {
                    tracing::warn!("⚠️  Cycle abandoned on shutdown");
                    break;
                }
            }
        }

        monitor.abort();
        let now = Utc::now();
        self.write_snapshot(now).await;
        self.notifier.notify("👋 Trading bot stopped").await;
        Ok(())
    }
}

/// Position report from the latest published view. Never touches trading state.
pub async fn monitor_loop(
    view: watch::Receiver<MonitorView>,
    period: Duration,
    leverage: f64,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("👀 Position monitor every {:?}", period);

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let current = view.borrow().clone();
        tracing::info!("👀 {}", describe_position(&current, leverage));
    }
}

/// One-line position summary for the monitor
pub fn describe_position(view: &MonitorView, leverage: f64) -> String {
    match (&view.venue, &view.position) {
        (Some(venue), _) if venue.is_open() => {
            let side = venue.side.map(|s| s.to_string()).unwrap_or_else(|| "?".to_string());
            let dir = venue.side.map(|s| s.direction()).unwrap_or(0.0);
            let pnl_pct = if venue.entry_price > 0.0 {
                (venue.mark_price - venue.entry_price) / venue.entry_price * 100.0 * dir * leverage
            } else {
                0.0
            };
            format!(
                "{} {} {} entry {:.4} mark {:.4} PnL {:+.2}% ({})",
                venue.symbol, side, venue.size, venue.entry_price, venue.mark_price, pnl_pct, view.state
            )
        }
        (_, Some(position)) => {
            let price = view.price.unwrap_or(position.entry_price);
            format!(
                "{} {} {} entry {:.4} price {:.4} PnL {:+.2}% ({}, not on venue yet)",
                position.symbol,
                position.side,
                position.size,
                position.entry_price,
                price,
                position.pnl_percent(price, leverage),
                view.state
            )
        }
        _ => format!("No open position ({})", if view.state.is_empty() { "Flat" } else { &view.state }),
    }
}
