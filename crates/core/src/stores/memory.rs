use crate::error::IngestError;
use crate::models::{IndexRecord, RecordOutcome};
use crate::traits::IndexStore;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// In-process store with the same merge-or-upload semantics as a real index.
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    records: RwLock<BTreeMap<String, IndexRecord>>,
    dimensions: RwLock<Option<usize>>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<IndexRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// All records ordered by id.
    pub async fn snapshot(&self) -> Vec<IndexRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn ensure_schema(&self, dimensions: usize) -> Result<(), IngestError> {
        let mut current = self.dimensions.write().await;
        match *current {
            Some(existing) if existing != dimensions => Err(IngestError::index(
                false,
                format!("index exists with {existing} dimensions, requested {dimensions}"),
            )),
            _ => {
                *current = Some(dimensions);
                Ok(())
            }
        }
    }

    async fn delete_schema(&self) -> Result<bool, IngestError> {
        let mut dimensions = self.dimensions.write().await;
        let mut records = self.records.write().await;
        let existed = dimensions.is_some() || !records.is_empty();
        *dimensions = None;
        records.clear();
        Ok(existed)
    }

    async fn merge_or_upload(
        &self,
        records: &[IndexRecord],
    ) -> Result<Vec<RecordOutcome>, IngestError> {
        let dimensions = *self.dimensions.read().await;
        let mut stored = self.records.write().await;

        Ok(records
            .iter()
            .map(|record| match dimensions {
                Some(expected) if record.content_vector.len() != expected => RecordOutcome::failed(
                    &record.id,
                    format!(
                        "vector has {} dimensions, index expects {expected}",
                        record.content_vector.len()
                    ),
                    false,
                ),
                _ => {
                    stored.insert(record.id.clone(), record.clone());
                    RecordOutcome::succeeded(&record.id)
                }
            })
            .collect())
    }
}
