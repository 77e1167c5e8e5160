use anyhow::Context;
use clap::Parser;
use perpbot::api::{BybitClient, ClientSettings};
use perpbot::config::BotConfig;
use perpbot::notify::{build_notifier, TelegramConfig};
use perpbot::Orchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Parser)]
#[command(name = "perpbot", about = "Order-flow trading bot for USDT perpetuals")]
struct Cli {
    /// TOML config file (defaults to ./perpbot.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single trading cycle and exit
    #[arg(long)]
    once: bool,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match BotConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            setup_logging(None);
            tracing::error!("❌ {}", e);
            build_notifier(TelegramConfig::from_env())
                .notify(&format!("❌ Bot failed to start: {}", e))
                .await;
            return Err(e.into());
        }
    };
    setup_logging(config.log_filter.as_deref());

    if cli.check_config {
        tracing::info!("✅ Configuration valid for {}", config.trading.symbol);
        return Ok(());
    }

    tracing::info!("🚀 perpbot starting on {}", config.trading.symbol);
    tracing::info!("  Exchange: {}", config.exchange.base_url());
    tracing::info!("  Strategy: {:?}", config.trading.strategy);
    tracing::info!("  Leverage: {}x", config.trading.leverage);
    tracing::info!("  Risk per trade: {}%", config.risk.risk_percent);
    tracing::info!(
        "  Breaker: max loss {} / {} losses in a row / {} trades a day",
        config.breaker.max_daily_loss,
        config.breaker.max_consecutive_losses,
        config.breaker.max_daily_trades
    );

    let notifier = build_notifier(config.telegram.clone());
    let credentials = config
        .require_credentials()
        .context("trading requires API credentials")?
        .clone();
    let client = BybitClient::new(ClientSettings::from(&config.exchange), Some(credentials))?;

    let mut orchestrator = Orchestrator::new(config, Arc::new(client), notifier)?;

    if cli.once {
        orchestrator.initialize().await?;
        let report = orchestrator.run_cycle().await?;
        tracing::info!("📋 {:?}", report);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        let _ = shutdown_tx.send(true);
    });

    orchestrator.run(shutdown_rx).await?;

    tracing::info!("👋 perpbot stopped");
    Ok(())
}

fn setup_logging(filter: Option<&str>) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| filter.map(str::to_string))
        .unwrap_or_else(|| "perpbot=info".to_string());

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
