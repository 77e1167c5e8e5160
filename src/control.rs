//! Manual control through a small JSON file (`signals.json`).
//!
//! An operator (or a chat bot) sets `force_trade` or `refresh_data`; the
//! trading loop clears the flag on disk before acting, so every request is
//! consumed at most once even if acting on it fails.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::error::BotError;
use crate::models::Side;
use crate::persistence::write_then_rename;
use crate::risk::EntryPlan;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControlFile {
    #[serde(default)]
    pub force_trade: bool,
    #[serde(default)]
    pub refresh_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_3: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qty: Option<f64>,
    /// Anything else the writer keeps in the file is preserved
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A fully specified manual entry
#[derive(Debug, Clone, PartialEq)]
pub struct ForcedTrade {
    pub side: Side,
    pub price: f64,
    pub stop_loss: f64,
    pub take_profits: [f64; 3],
    pub qty: f64,
}

impl ForcedTrade {
    pub fn into_plan(self) -> EntryPlan {
        EntryPlan {
            side: self.side,
            entry_price: self.price,
            quantity: self.qty,
            stop_loss: self.stop_loss,
            take_profits: self.take_profits,
            atr: None,
        }
    }
}

impl ControlFile {
    /// Validate the forced-trade fields
    pub fn forced_trade(&self) -> Result<ForcedTrade, String> {
        let side = self
            .side
            .as_deref()
            .and_then(Side::parse)
            .ok_or_else(|| format!("invalid side {:?}", self.side))?;

        let field = |name: &str, value: Option<f64>| -> Result<f64, String> {
            match value {
                Some(v) if v.is_finite() && v > 0.0 => Ok(v),
                other => Err(format!("{} must be a positive number (got {:?})", name, other)),
            }
        };

        let price = field("price", self.price)?;
        let stop_loss = field("stop_loss", self.stop_loss)?;
        let take_profits = [
            field("take_profit_1", self.take_profit_1)?,
            field("take_profit_2", self.take_profit_2)?,
            field("take_profit_3", self.take_profit_3)?,
        ];
        let qty = field("qty", self.qty)?;

        let dir = side.direction();
        if (price - stop_loss) * dir <= 0.0 {
            return Err(format!("stop {} is not on the losing side of {} for {}", stop_loss, price, side));
        }
        let distances = take_profits.map(|tp| (tp - price) * dir);
        if distances[0] <= 0.0 || distances[1] <= distances[0] || distances[2] <= distances[1] {
            return Err(format!("take-profits {:?} are not strictly increasing away from {}", take_profits, price));
        }

        Ok(ForcedTrade {
            side,
            price,
            stop_loss,
            take_profits,
            qty,
        })
    }
}

/// Requests picked up in one poll
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlRequests {
    pub refresh: bool,
    /// Present when `force_trade` was set; Err carries why it cannot run
    pub forced_trade: Option<Result<ForcedTrade, String>>,
}

impl ControlRequests {
    pub fn is_empty(&self) -> bool {
        !self.refresh && self.forced_trade.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ControlInbox {
    path: PathBuf,
}

impl ControlInbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Read pending requests and clear their flags on disk.
    ///
    /// A missing or empty file means no requests. Flags are cleared before
    /// anything is returned; if clearing fails nothing is returned.
    pub async fn poll(&self) -> Result<ControlRequests, BotError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ControlRequests::default()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(ControlRequests::default());
        }

        let mut file: ControlFile = serde_json::from_slice(&bytes)
            .map_err(|e| BotError::Decode(format!("{}: {}", self.path.display(), e)))?;

        if !file.force_trade && !file.refresh_data {
            return Ok(ControlRequests::default());
        }

        let requests = ControlRequests {
            refresh: file.refresh_data,
            forced_trade: file.force_trade.then(|| file.forced_trade()),
        };

        file.force_trade = false;
        file.refresh_data = false;
        self.write(&file).await?;

        tracing::info!(
            "📨 Control request: refresh={} force_trade={}",
            requests.refresh,
            requests.forced_trade.is_some()
        );
        Ok(requests)
    }

    pub async fn write(&self, file: &ControlFile) -> Result<(), BotError> {
        let json = serde_json::to_vec_pretty(file)?;
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "signals.json".to_string());
        let tmp = dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()));

        write_then_rename(&tmp, &self.path, &json).await
    }
}
