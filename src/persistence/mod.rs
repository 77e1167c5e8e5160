use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::BotError;
use crate::execution::Position;
use crate::models::{AccountSnapshot, ClosedTrade};
use crate::risk::TradingState;

pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// Point-in-time export for dashboards and operators
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotSnapshot {
    pub taken_at: DateTime<Utc>,
    pub symbol: String,
    pub latest_price: Option<f64>,
    pub account: Option<AccountSnapshot>,
    pub position_state: String,
    pub position: Option<Position>,
    pub breaker: TradingStateView,
    pub recent_trades: Vec<ClosedTrade>, // newest last
    pub cycles: u64,
}

/// Breaker counters without the processed-order bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradingStateView {
    pub daily_pnl: f64,
    pub consecutive_losses: u32,
    pub daily_trades: u32,
    pub last_reset: chrono::NaiveDate,
    pub can_enter: bool,
}

impl TradingStateView {
    pub fn new(state: &TradingState, can_enter: bool) -> Self {
        Self {
            daily_pnl: state.daily_pnl,
            consecutive_losses: state.consecutive_losses,
            daily_trades: state.daily_trades,
            last_reset: state.last_reset,
            can_enter,
        }
    }
}

/// Writes `snapshot.json` atomically: temp file in the same directory, then rename
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub async fn save(&self, snapshot: &BotSnapshot) -> Result<(), BotError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_vec_pretty(snapshot)?;
        let target = self.path();
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", SNAPSHOT_FILE, uuid::Uuid::new_v4().simple()));

        write_then_rename(&tmp, &target, &json).await?;

        tracing::debug!("💾 Snapshot written to {}", target.display());
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<BotSnapshot>, BotError> {
        match tokio::fs::read(self.path()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Readers see either the old file or the new one, never a partial write
pub(crate) async fn write_then_rename(tmp: &Path, target: &Path, bytes: &[u8]) -> Result<(), BotError> {
    if let Err(e) = tokio::fs::write(tmp, bytes).await {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(tmp, target).await {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("perpbot-snap-{}", uuid::Uuid::new_v4().simple()))
    }

    fn snapshot() -> BotSnapshot {
        let state = TradingState::new(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        BotSnapshot {
            taken_at: Utc::now(),
            symbol: "BTCUSDT".to_string(),
            latest_price: Some(30000.0),
            account: Some(AccountSnapshot {
                available_balance: 1000.0,
                equity: 1000.0,
                used_margin: 0.0,
                free_margin: 1000.0,
            }),
            position_state: "Flat".to_string(),
            position: None,
            breaker: TradingStateView::new(&state, true),
            recent_trades: Vec::new(),
            cycles: 12,
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = temp_dir();
        let store = SnapshotStore::new(&dir);

        assert_eq!(store.load().await.unwrap(), None);

        let snap = snapshot();
        store.save(&snap).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(snap));

        // Only the final file remains, no temp leftovers
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec![SNAPSHOT_FILE.to_string()]);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_overwrite_replaces_whole_file() {
        let dir = temp_dir();
        let store = SnapshotStore::new(&dir);

        let mut snap = snapshot();
        store.save(&snap).await.unwrap();
        snap.cycles = 24;
        snap.latest_price = None;
        store.save(&snap).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.cycles, 24);
        assert_eq!(loaded.latest_price, None);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
