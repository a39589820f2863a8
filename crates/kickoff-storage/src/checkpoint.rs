use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use kickoff_core::{CheckpointPayload, Progress};
use serde_json::Value;
use tracing::warn;

use crate::DataStore;

/// Durable key to JSON mapping; last write wins.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()>;
}

#[async_trait]
impl CheckpointStore for DataStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.read(|t| t.checkpoints.get(key).cloned()).await)
    }

    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.write(|t| t.checkpoints.insert(key.to_string(), value))
            .await;
        self.save().await
    }
}

/// Season/date progress view over a [`CheckpointStore`].
#[derive(Clone)]
pub struct Checkpoints {
    store: Arc<dyn CheckpointStore>,
}

impl Checkpoints {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Missing or unreadable payloads count as no progress.
    pub async fn progress(&self, key: &str) -> anyhow::Result<Option<Progress>> {
        let Some(value) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_value::<CheckpointPayload>(value) {
            Ok(payload) => Ok(payload.progress()),
            Err(err) => {
                warn!(key, error = %err, "ignoring malformed checkpoint payload");
                Ok(None)
            }
        }
    }

    pub async fn last_season(&self, key: &str) -> anyhow::Result<Option<i32>> {
        Ok(match self.progress(key).await? {
            Some(Progress::Season(season)) => Some(season),
            _ => None,
        })
    }

    pub async fn last_date(&self, key: &str) -> anyhow::Result<Option<NaiveDate>> {
        Ok(match self.progress(key).await? {
            Some(Progress::Date(date)) => Some(date),
            _ => None,
        })
    }

    pub async fn save_season(&self, key: &str, season: i32) -> anyhow::Result<()> {
        self.save(key, Progress::Season(season)).await
    }

    pub async fn save_date(&self, key: &str, date: NaiveDate) -> anyhow::Result<()> {
        self.save(key, Progress::Date(date)).await
    }

    async fn save(&self, key: &str, progress: Progress) -> anyhow::Result<()> {
        let value = serde_json::to_value(CheckpointPayload::from(progress))?;
        self.store.set(key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kickoff_core::checkpoint_key;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_and_malformed_payloads_read_as_no_progress() {
        let store = Arc::new(DataStore::in_memory());
        let checkpoints = Checkpoints::new(store.clone());
        let key = checkpoint_key("Understat", "PL");
        assert_eq!(checkpoints.last_season(&key).await.unwrap(), None);

        store.set(&key, json!("not a payload")).await.unwrap();
        assert_eq!(checkpoints.last_season(&key).await.unwrap(), None);

        store
            .set(&key, json!({"lastCompletedSeason": "twenty"}))
            .await
            .unwrap();
        assert_eq!(checkpoints.progress(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn saving_a_date_nulls_the_season() {
        let store = Arc::new(DataStore::in_memory());
        let checkpoints = Checkpoints::new(store.clone());
        let key = checkpoint_key("Elo", "Global");

        checkpoints.save_season(&key, 2023).await.unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        checkpoints.save_date(&key, date).await.unwrap();

        assert_eq!(checkpoints.last_season(&key).await.unwrap(), None);
        assert_eq!(checkpoints.last_date(&key).await.unwrap(), Some(date));
        assert_eq!(
            store.get(&key).await.unwrap(),
            Some(json!({"lastCompletedSeason": null, "lastCompletedDateUtc": "2024-01-07"}))
        );
    }

    #[tokio::test]
    async fn checkpoints_are_durable() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        let key = checkpoint_key("FootballDataUk", "PL");

        let first = Arc::new(DataStore::open(&path).await.unwrap());
        Checkpoints::new(first).save_season(&key, 2022).await.unwrap();

        let reopened = Arc::new(DataStore::open(&path).await.unwrap());
        assert_eq!(
            Checkpoints::new(reopened).last_season(&key).await.unwrap(),
            Some(2022)
        );
    }
}
