// Technical indicators: pure functions over OHLCV data, oldest sample first.
// Every function returns None when there is not enough history.

pub mod atr;
pub mod levels;
pub mod moving_average;
pub mod rsi;
pub mod vwap;

pub use atr::calculate_atr;
pub use levels::{support_resistance, Levels};
pub use moving_average::{calculate_ema, calculate_sma};
pub use rsi::calculate_rsi;
pub use vwap::calculate_vwap;
