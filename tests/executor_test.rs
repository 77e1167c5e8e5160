mod common;

use chrono::Local;
use std::sync::Arc;

use common::*;
use perpbot::config::SymbolSpec;
use perpbot::execution::{
    ExecutionAction, Executor, ManagementConfig, PositionState, PositionStateMachine,
};
use perpbot::models::{OrderStatus, OrderType, Side};
use perpbot::risk::{CircuitBreaker, CircuitBreakers, EntryPlan, Ladder, RiskConfig, RiskManager};
use perpbot::BotError;

fn btc() -> SymbolSpec {
    SymbolSpec::lookup("BTCUSDT")
}

fn executor(state: MockState) -> (Executor, Arc<MockExchange>, Arc<RecordingNotifier>) {
    let exchange = Arc::new(MockExchange::new(state));
    let notifier = Arc::new(RecordingNotifier::default());
    let risk = RiskManager::new(RiskConfig::default(), btc(), Ladder::Percent);
    (Executor::new(exchange.clone(), notifier.clone(), risk), exchange, notifier)
}

fn machine() -> PositionStateMachine {
    PositionStateMachine::new(ManagementConfig::default(), btc())
}

fn long_plan(quantity: f64) -> EntryPlan {
    EntryPlan {
        side: Side::Buy,
        entry_price: 30_000.0,
        quantity,
        stop_loss: 29_850.0,
        take_profits: [30_150.0, 30_300.0, 30_450.0],
        atr: None,
    }
}

#[tokio::test]
async fn test_attach_failure_keeps_position_open_and_alerts() {
    let mut state = quiet_market();
    state.fail_trading_stop = Some(BotError::ExchangeRejected {
        code: 10001,
        message: "params error".to_string(),
    });
    let (executor, _exchange, notifier) = executor(state);
    let mut machine = machine();

    let outcome = executor.open_position(&mut machine, &long_plan(0.1)).await.unwrap();

    assert!(!outcome.protection_attached);
    assert_eq!(machine.state(), &PositionState::Open);
    assert_eq!(notifier.count_containing("🚨"), 1);
    assert_eq!(notifier.count_containing("OPEN WITHOUT PROTECTION"), 1);
}

#[tokio::test]
async fn test_dead_entry_order_is_rejected() {
    let mut state = quiet_market();
    state.entry_status = Some(OrderStatus::Cancelled);
    let (executor, exchange, _notifier) = executor(state);
    let mut machine = machine();

    let err = executor.open_position(&mut machine, &long_plan(0.1)).await.unwrap_err();

    assert!(matches!(err, BotError::ExchangeRejected { code: 0, .. }));
    assert!(matches!(machine.state(), PositionState::Rejected { .. }));
    assert!(machine.position().is_none());
    // No protection or ladder for an entry that never happened
    assert!(exchange.with(|s| s.trading_stops.is_empty()));
    assert_eq!(exchange.orders().len(), 1);
}

#[tokio::test]
async fn test_take_profit_ladder_sizes() {
    let (executor, exchange, _notifier) = executor(quiet_market());
    let mut machine = machine();

    let outcome = executor.open_position(&mut machine, &long_plan(0.1)).await.unwrap();
    assert!(outcome.protection_attached);
    assert_eq!(outcome.ladder_orders, 2);

    let ladder: Vec<_> = exchange.orders().into_iter().filter(|o| o.reduce_only).collect();
    assert_eq!(ladder.len(), 2);
    assert_eq!(ladder[0].side, Side::Sell);
    assert_eq!(ladder[0].order_type, OrderType::Limit);
    assert_eq!((ladder[0].qty, ladder[0].price), (0.03, Some(30_300.0)));
    assert_eq!((ladder[1].qty, ladder[1].price), (0.04, Some(30_450.0)));
}

#[tokio::test]
async fn test_small_position_skips_ladder() {
    let (executor, exchange, _notifier) = executor(quiet_market());
    let mut machine = machine();

    // 30% and 40% of 0.002 round down to zero
    let outcome = executor.open_position(&mut machine, &long_plan(0.002)).await.unwrap();
    assert_eq!(outcome.ladder_orders, 0);
    assert_eq!(exchange.orders().len(), 1);
}

#[tokio::test]
async fn test_trailing_stop_moves_on_venue_first() {
    let (executor, exchange, _notifier) = executor(quiet_market());
    let mut machine = machine();
    executor.open_position(&mut machine, &long_plan(0.1)).await.unwrap();

    let outcome = executor.manage_position(&mut machine, 30_200.0).await.unwrap();

    let stop = outcome.new_stop.expect("stop should trail");
    assert!((stop - 30_139.6).abs() < 1e-6);
    assert_eq!(machine.position().unwrap().stop_loss, stop);
    let last = exchange.with(|s| s.trading_stops.last().cloned());
    assert_eq!(last, Some((Some(stop), None)));

    // Venue refuses the next move: the local stop stays put
    exchange.with(|s| {
        s.fail_trading_stop = Some(BotError::TransientNetwork {
            attempts: 3,
            reason: "timeout".to_string(),
        })
    });
    assert!(executor.manage_position(&mut machine, 30_400.0).await.is_err());
    assert_eq!(machine.position().unwrap().stop_loss, stop);
}

#[tokio::test]
async fn test_failed_stop_update_alerts_once() {
    let (executor, exchange, notifier) = executor(quiet_market());
    let mut machine = machine();
    executor.open_position(&mut machine, &long_plan(0.1)).await.unwrap();
    let original = machine.position().unwrap().stop_loss;

    exchange.with(|s| {
        s.fail_trading_stop = Some(BotError::TransientNetwork {
            attempts: 3,
            reason: "timeout".to_string(),
        })
    });
    assert!(executor.manage_position(&mut machine, 30_200.0).await.is_err());
    assert_eq!(notifier.count_containing("🚨 Stop update"), 1);
    assert_eq!(machine.position().unwrap().stop_loss, original);

    // Same failure on the next cycle: logged, not alerted again
    assert!(executor.manage_position(&mut machine, 30_300.0).await.is_err());
    assert_eq!(notifier.count_containing("🚨 Stop update"), 1);

    // The venue recovers and the stop catches up
    exchange.with(|s| s.fail_trading_stop = None);
    let outcome = executor.manage_position(&mut machine, 30_400.0).await.unwrap();
    assert!(outcome.new_stop.is_some());
    assert!(machine.position().unwrap().stop_loss > original);

    // A new failure after recovery is a new alert
    exchange.with(|s| {
        s.fail_trading_stop = Some(BotError::TransientNetwork {
            attempts: 3,
            reason: "timeout".to_string(),
        })
    });
    assert!(executor.manage_position(&mut machine, 30_600.0).await.is_err());
    assert_eq!(notifier.count_containing("🚨 Stop update"), 2);
}

#[tokio::test]
async fn test_close_position_sends_reduce_only_market() {
    let (executor, exchange, notifier) = executor(quiet_market());
    let mut machine = machine();
    executor.open_position(&mut machine, &long_plan(0.1)).await.unwrap();

    let closed = executor.close_position(&mut machine, "manual").await.unwrap().unwrap();

    assert_eq!(closed.size, 0.1);
    assert_eq!(machine.state(), &PositionState::Closed);
    let last = exchange.orders().pop().unwrap();
    assert!(last.reduce_only);
    assert_eq!(last.order_type, OrderType::Market);
    assert_eq!((last.side, last.qty), (Side::Sell, 0.1));
    assert_eq!(notifier.count_containing("🔴 Closed"), 1);

    // Nothing left to close
    assert!(executor.close_position(&mut machine, "again").await.unwrap().is_none());
}

#[test]
fn test_process_signal_gates() {
    let (executor, _exchange, _notifier) = executor(quiet_market());
    let machine = machine();
    let mut breaker = CircuitBreaker::new(CircuitBreakers::default(), Local::now().date_naive());
    // Scenario A: 1% of 1000 over 0.5 ATR of 50
    assert_eq!(executor.risk().position_size(1_000.0, 30_000.0, 50.0), Some(0.4));

    // Margin for 0.4 at 3x fits a 10k account when the ATR is 500
    let account = account(10_000.0);
    let decision = executor.process_signal(Side::Buy, 30_000.0, Some(500.0), &account, 3.0, &machine, &breaker);
    match decision.action {
        ExecutionAction::Enter(plan) => {
            assert_eq!(plan.quantity, 0.4);
            assert_eq!(plan.stop_loss, 29_000.0);
        }
        ExecutionAction::Skip => panic!("expected an entry: {}", decision.reason),
    }

    for i in 0..3 {
        breaker.record_closed_trade(&closed_trade(&format!("loss-{}", i), -1.0, 10 - i));
    }
    let decision = executor.process_signal(Side::Buy, 30_000.0, Some(500.0), &account, 3.0, &machine, &breaker);
    assert_eq!(decision.action, ExecutionAction::Skip);
    assert!(decision.reason.contains("Circuit breaker"));
}
