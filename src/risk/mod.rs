pub mod circuit_breakers;
pub mod precision;
pub mod sizing;

pub use circuit_breakers::{CircuitBreaker, CircuitBreakerTrip, CircuitBreakers, TradingState};
pub use sizing::{EntryPlan, Ladder, RiskConfig, RiskManager, RiskRejection};
