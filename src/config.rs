use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::api::Credentials;
use crate::error::BotError;
use crate::execution::ManagementConfig;
use crate::notify::TelegramConfig;
use crate::risk::{CircuitBreakers, RiskConfig};
use crate::strategy::{SignalConfig, StrategyKind};

pub const DEFAULT_CONFIG_FILE: &str = "perpbot.toml";
const ENV_PREFIX: &str = "PERPBOT";

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";

// Minimum order size per contract; also used as the quantity step
const MIN_POSITION_SIZES: &[(&str, f64)] = &[
    ("BTCUSDT", 0.001),
    ("ETHUSDT", 0.01),
    ("SOLUSDT", 1.0),
    ("XRPUSDT", 10.0),
    ("ADAUSDT", 10.0),
    ("DOGEUSDT", 100.0),
    ("MATICUSDT", 10.0),
    ("LINKUSDT", 1.0),
    ("UNIUSDT", 0.1),
    ("AVAXUSDT", 0.1),
];

// Price tick per contract
const TICK_SIZES: &[(&str, f64)] = &[
    ("BTCUSDT", 0.1),
    ("ETHUSDT", 0.01),
    ("SOLUSDT", 0.01),
    ("XRPUSDT", 0.0001),
    ("ADAUSDT", 0.0001),
    ("DOGEUSDT", 0.00001),
    ("MATICUSDT", 0.0001),
    ("LINKUSDT", 0.001),
    ("UNIUSDT", 0.001),
    ("AVAXUSDT", 0.001),
];

// Minimum stop-loss distance from entry, in percent
const MIN_STOP_DISTANCES: &[(&str, f64)] = &[
    ("BTCUSDT", 0.1),
    ("ETHUSDT", 0.1),
    ("SOLUSDT", 0.2),
    ("XRPUSDT", 0.2),
    ("ADAUSDT", 0.2),
    ("DOGEUSDT", 0.3),
    ("MATICUSDT", 0.2),
    ("LINKUSDT", 0.2),
    ("UNIUSDT", 0.2),
    ("AVAXUSDT", 0.2),
];

/// Exchange constraints for one contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub min_qty: f64,
    pub qty_step: f64,
    pub tick_size: f64,
    pub min_stop_distance_pct: f64,
}

impl SymbolSpec {
    pub fn lookup(symbol: &str) -> Self {
        let find = |table: &[(&str, f64)], default: f64| {
            table
                .iter()
                .find(|(s, _)| *s == symbol)
                .map(|(_, v)| *v)
                .unwrap_or(default)
        };

        let min_qty = find(MIN_POSITION_SIZES, 0.001);
        Self {
            symbol: symbol.to_string(),
            min_qty,
            qty_step: min_qty,
            tick_size: find(TICK_SIZES, 0.01),
            min_stop_distance_pct: find(MIN_STOP_DISTANCES, 0.1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub base_url: Option<String>,
    pub testnet: bool,
    pub recv_window_ms: u64,
    pub min_request_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub account_type: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            testnet: true,
            recv_window_ms: 5000,
            min_request_interval_ms: 1000,
            max_retries: 3,
            retry_delay_ms: 5000,
            request_timeout_secs: 10,
            account_type: "UNIFIED".to_string(),
        }
    }
}

impl ExchangeConfig {
    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if self.testnet => TESTNET_URL.to_string(),
            None => MAINNET_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub symbol: String,
    pub strategy: StrategyKind,
    pub leverage: u32,
    pub min_leverage: u32,
    pub max_leverage: u32,
    pub check_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub candle_interval: String,
    pub candle_limit: usize,
    pub closed_pnl_lookback_secs: i64, // first closed-PnL window after startup
    pub snapshot_every_cycles: u64,
    // Minimum wait between signal entries; longer while ATR exceeds the given share of price
    pub min_entry_interval_secs: u64,
    pub high_volatility_entry_interval_secs: u64,
    pub high_volatility_atr_pct: f64,
    // Overrides for the built-in symbol table
    pub min_order_size: Option<f64>,
    pub qty_step: Option<f64>,
    pub tick_size: Option<f64>,
    pub min_stop_distance_pct: Option<f64>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            strategy: StrategyKind::OrderFlow,
            leverage: 3,
            min_leverage: 1,
            max_leverage: 5,
            check_interval_secs: 5,
            monitor_interval_secs: 60,
            candle_interval: "5".to_string(),
            candle_limit: 200,
            closed_pnl_lookback_secs: 300,
            snapshot_every_cycles: 12,
            min_entry_interval_secs: 300,
            high_volatility_entry_interval_secs: 600,
            high_volatility_atr_pct: 1.0,
            min_order_size: None,
            qty_step: None,
            tick_size: None,
            min_stop_distance_pct: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub control_file: PathBuf,
    pub snapshot_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            control_file: PathBuf::from("signals.json"),
            snapshot_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    pub signal: SignalConfig,
    pub risk: RiskConfig,
    pub position: ManagementConfig,
    pub breaker: CircuitBreakers,
    pub paths: PathsConfig,
    pub log_filter: Option<String>,
    #[serde(skip)]
    pub credentials: Option<Credentials>,
    #[serde(skip)]
    pub telegram: Option<TelegramConfig>,
}

impl BotConfig {
    /// Load from an optional TOML file, then `PERPBOT_*` environment overrides
    /// (`PERPBOT_TRADING__SYMBOL=ETHUSDT`), then secrets from the plain environment.
    ///
    /// A missing file is only an error when the path was given explicitly.
    pub fn load(path: Option<&Path>) -> Result<Self, BotError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let settings = Config::builder()
            .add_source(File::from(path.as_path()).required(required))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BotError::Configuration(e.to_string()))?;

        let mut config: BotConfig = settings
            .try_deserialize()
            .map_err(|e| BotError::Configuration(e.to_string()))?;

        config.trading.symbol = config.trading.symbol.to_uppercase();
        config.credentials = Credentials::from_env();
        config.telegram = TelegramConfig::from_env();

        config.validate()?;
        Ok(config)
    }

    /// Exchange constraints for the configured symbol, with overrides applied
    pub fn symbol_spec(&self) -> SymbolSpec {
        let t = &self.trading;
        let mut spec = SymbolSpec::lookup(&t.symbol);
        if let Some(min) = t.min_order_size {
            spec.min_qty = min;
            spec.qty_step = min;
        }
        if let Some(step) = t.qty_step {
            spec.qty_step = step;
        }
        if let Some(tick) = t.tick_size {
            spec.tick_size = tick;
        }
        if let Some(pct) = t.min_stop_distance_pct {
            spec.min_stop_distance_pct = pct;
        }
        spec
    }

    pub fn require_credentials(&self) -> Result<&Credentials, BotError> {
        self.credentials.as_ref().ok_or_else(|| {
            BotError::Configuration("BYBIT_API_KEY / BYBIT_API_SECRET not set".to_string())
        })
    }

    /// Check every bound; all problems are reported together
    pub fn validate(&self) -> Result<(), BotError> {
        let mut errors = Vec::new();
        let t = &self.trading;

        if !t.symbol.ends_with("USDT") {
            errors.push(format!(
                "unsupported symbol {}: only USDT-margined contracts are traded",
                t.symbol
            ));
        }
        if t.min_leverage == 0 || t.min_leverage > t.max_leverage {
            errors.push(format!(
                "invalid leverage bounds [{}, {}]",
                t.min_leverage, t.max_leverage
            ));
        }
        if t.leverage < t.min_leverage || t.leverage > t.max_leverage {
            errors.push(format!(
                "leverage {} outside allowed range [{}, {}]",
                t.leverage, t.min_leverage, t.max_leverage
            ));
        }
        if t.check_interval_secs == 0 || t.monitor_interval_secs == 0 {
            errors.push("loop intervals must be positive".to_string());
        }
        if t.high_volatility_entry_interval_secs < t.min_entry_interval_secs {
            errors.push(format!(
                "high-volatility entry interval {}s shorter than the normal {}s",
                t.high_volatility_entry_interval_secs, t.min_entry_interval_secs
            ));
        }
        if t.high_volatility_atr_pct <= 0.0 {
            errors.push("high-volatility ATR percent must be positive".to_string());
        }

        let spec = self.symbol_spec();
        if spec.tick_size <= 0.0 || spec.qty_step <= 0.0 || spec.min_qty <= 0.0 {
            errors.push(format!(
                "tick size, quantity step and minimum size must be positive for {}",
                spec.symbol
            ));
        }

        let r = &self.risk;
        if r.risk_percent <= 0.0 || r.risk_percent > 5.0 {
            errors.push(format!(
                "risk percent {} outside allowed range (0, 5]",
                r.risk_percent
            ));
        }
        if !strictly_increasing(&r.take_profit_percents) {
            errors.push("take-profit percentages must be positive and increasing".to_string());
        }
        if !strictly_increasing(&r.take_profit_atr_multiples) {
            errors.push("take-profit ATR multiples must be positive and increasing".to_string());
        }
        if r.atr_multiplier <= 0.0 || r.atr_stop_fraction <= 0.0 {
            errors.push("ATR stop multipliers must be positive".to_string());
        }
        if matches!(r.stop_loss_percent, Some(p) if p <= 0.0) {
            errors.push("stop-loss percent must be positive".to_string());
        }

        let b = &self.breaker;
        if !(1..=20).contains(&b.max_daily_trades) {
            errors.push(format!(
                "max daily trades {} outside allowed range [1, 20]",
                b.max_daily_trades
            ));
        }
        if b.max_daily_loss <= 0.0 || b.max_consecutive_losses == 0 {
            errors.push("circuit breaker limits must be positive".to_string());
        }

        if let Err(e) = self.position.validate() {
            errors.push(e);
        }

        if self.exchange.max_retries == 0 {
            errors.push("max_retries must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BotError::Configuration(errors.join("; ")))
        }
    }
}

fn strictly_increasing(values: &[f64]) -> bool {
    values.first().map_or(false, |first| *first > 0.0)
        && values.windows(2).all(|pair| pair[0] < pair[1])
}
