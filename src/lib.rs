// Core modules
pub mod api;
pub mod config;
pub mod control;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod persistence;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use api::{BybitClient, Exchange};
pub use config::BotConfig;
pub use error::BotError;
pub use models::*;
pub use orchestrator::{CycleReport, EntryOutcome, MonitorView, Orchestrator};
pub use strategy::Strategy;
