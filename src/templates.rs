use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::errors::{KaminoError, KaminoResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateRecord {
    pub name: String,
    pub description: String,
    pub visible: bool,
    pub deployments: u64,
    pub updated_at: DateTime<Utc>,
}

impl TemplateRecord {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            visible: true,
            deployments: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Template metadata lives outside the engine; this is the seam to it.
#[async_trait]
pub trait TemplateRegistry: Send + Sync {
    async fn list_visible(&self) -> KaminoResult<Vec<TemplateRecord>>;
    async fn list_all(&self) -> KaminoResult<Vec<TemplateRecord>>;
    async fn list_names(&self) -> KaminoResult<Vec<String>>;
    async fn upsert(&self, record: TemplateRecord) -> KaminoResult<()>;
    /// Flips visibility and returns the new value.
    async fn toggle_visibility(&self, name: &str) -> KaminoResult<bool>;
    async fn delete(&self, name: &str) -> KaminoResult<()>;
    async fn record_deployment(&self, name: &str) -> KaminoResult<()>;
}

#[derive(Default)]
pub struct InMemoryTemplateRegistry {
    records: RwLock<BTreeMap<String, TemplateRecord>>,
}

impl InMemoryTemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<TemplateRecord> {
        self.records.read().await.get(name).cloned()
    }
}

#[async_trait]
impl TemplateRegistry for InMemoryTemplateRegistry {
    async fn list_visible(&self) -> KaminoResult<Vec<TemplateRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.visible)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> KaminoResult<Vec<TemplateRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn list_names(&self) -> KaminoResult<Vec<String>> {
        Ok(self.records.read().await.keys().cloned().collect())
    }

    async fn upsert(&self, mut record: TemplateRecord) -> KaminoResult<()> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&record.name) {
            record.deployments = existing.deployments;
        }
        record.updated_at = Utc::now();
        records.insert(record.name.clone(), record);
        Ok(())
    }

    async fn toggle_visibility(&self, name: &str) -> KaminoResult<bool> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(name)
            .ok_or_else(|| KaminoError::NotFound(format!("template {}", name)))?;
        record.visible = !record.visible;
        record.updated_at = Utc::now();
        Ok(record.visible)
    }

    async fn delete(&self, name: &str) -> KaminoResult<()> {
        self.records
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KaminoError::NotFound(format!("template {}", name)))
    }

    /// Templates deployed without a registry entry get one on first use.
    async fn record_deployment(&self, name: &str) -> KaminoResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .entry(name.to_string())
            .or_insert_with(|| TemplateRecord::new(name, ""));
        record.deployments += 1;
        Ok(())
    }
}
