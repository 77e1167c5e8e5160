//! Operator alerts. Delivery problems are logged and never reach trading logic.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Writes alerts to the log only (no chat configured)
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) {
        tracing::info!("📣 {}", message);
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramConfig {
    /// `TELEGRAM_BOT_TOKEN` and `TELEGRAM_CHAT_ID`, both required
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok().filter(|t| !t.is_empty())?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok().filter(|c| !c.is_empty())?;
        Some(Self { bot_token, chat_id })
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Telegram Bot API `sendMessage`
#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    config: TelegramConfig,
    base_url: String,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Self {
        Self::with_base_url(config, TELEGRAM_API_BASE)
    }

    pub fn with_base_url(config: TelegramConfig, base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) {
        tracing::info!("📣 {}", message);

        let url = format!("{}/bot{}/sendMessage", self.base_url, self.config.bot_token);
        let body = SendMessage {
            chat_id: &self.config.chat_id,
            text: message,
        };

        match self.client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!("Telegram delivery failed: HTTP {}", response.status());
            }
            Err(e) => {
                tracing::warn!("Telegram delivery failed: {}", e);
            }
        }
    }
}

/// Telegram when configured, otherwise log-only
pub fn build_notifier(telegram: Option<TelegramConfig>) -> Arc<dyn Notifier> {
    match telegram {
        Some(config) => {
            tracing::info!("📣 Telegram notifications enabled");
            Arc::new(TelegramNotifier::new(config))
        }
        None => {
            tracing::info!("📣 Telegram not configured, alerts go to the log only");
            Arc::new(LogNotifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_telegram_posts_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "chat_id": "42",
                "text": "hello"
            })))
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let notifier = TelegramNotifier::with_base_url(
            TelegramConfig {
                bot_token: "TOKEN".to_string(),
                chat_id: "42".to_string(),
            },
            &server.url(),
        );
        notifier.notify("hello").await;

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let notifier = TelegramNotifier::with_base_url(
            TelegramConfig {
                bot_token: "T".to_string(),
                chat_id: "1".to_string(),
            },
            &server.url(),
        );
        // Must not panic or propagate
        notifier.notify("boom").await;
    }
}
