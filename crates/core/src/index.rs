use crate::error::IngestError;
use crate::models::{IndexRecord, RecordOutcome, RecordStatus};
use crate::retry::{pause, RetryPolicy};
use crate::traits::IndexStore;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Writes records to an [`IndexStore`] in bulk batches and reports one outcome per record.
pub struct IndexWriter<S> {
    store: S,
    batch_size: usize,
    retry: RetryPolicy,
    timeout: Duration,
}

impl<S: IndexStore> IndexWriter<S> {
    pub fn new(
        store: S,
        batch_size: usize,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self, IngestError> {
        if batch_size == 0 {
            return Err(IngestError::Configuration(
                "upload batch size must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            store,
            batch_size,
            retry,
            timeout,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns outcomes in the same order as `records`.
    pub async fn upsert(
        &self,
        records: &[IndexRecord],
        cancel: &CancellationToken,
    ) -> Vec<RecordOutcome> {
        let mut outcomes = Vec::with_capacity(records.len());
        for (batch_index, batch) in records.chunks(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                outcomes.extend(
                    records[outcomes.len()..]
                        .iter()
                        .map(|record| RecordOutcome::cancelled(&record.id)),
                );
                break;
            }
            outcomes.extend(self.upsert_batch(batch, cancel).await);
            debug!(batch = batch_index + 1, records = batch.len(), "upload batch finished");
        }
        outcomes
    }

    async fn upsert_batch(
        &self,
        batch: &[IndexRecord],
        cancel: &CancellationToken,
    ) -> Vec<RecordOutcome> {
        let mut settled: HashMap<String, RecordOutcome> = HashMap::with_capacity(batch.len());
        let mut pending: Vec<IndexRecord> = batch.to_vec();
        let mut last_error = String::from("no attempt made");
        let mut cancelled = false;
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let result =
                match tokio::time::timeout(self.timeout, self.store.merge_or_upload(&pending))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(IngestError::Timeout {
                        operation: "upsert",
                        after: self.timeout,
                    }),
                };

            match result {
                Ok(reported) => {
                    let mut by_id: HashMap<String, RecordOutcome> = reported
                        .into_iter()
                        .map(|outcome| (outcome.id.clone(), outcome))
                        .collect();

                    let mut retry_next = Vec::new();
                    for record in pending {
                        let outcome = by_id.remove(&record.id).unwrap_or_else(|| {
                            RecordOutcome::failed(&record.id, "store reported no outcome", true)
                        });
                        match &outcome.status {
                            RecordStatus::Failed {
                                reason,
                                retryable: true,
                            } => {
                                last_error = reason.clone();
                                retry_next.push(record);
                            }
                            _ => {
                                settled.insert(record.id.clone(), outcome);
                            }
                        }
                    }
                    pending = retry_next;
                }
                Err(error) if error.is_retryable() => {
                    last_error = error.to_string();
                }
                Err(error) => {
                    last_error = error.to_string();
                    break;
                }
            }

            if pending.is_empty() || attempt == max_attempts {
                break;
            }

            let delay = self.retry.delay_for(attempt);
            warn!(
                attempt,
                max_attempts,
                pending = pending.len(),
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "retrying upload batch"
            );
            if !pause(delay, cancel).await {
                cancelled = true;
                break;
            }
        }

        for record in &pending {
            let outcome = if cancelled {
                RecordOutcome::cancelled(&record.id)
            } else {
                RecordOutcome::failed(&record.id, last_error.clone(), false)
            };
            settled.insert(record.id.clone(), outcome);
        }

        batch
            .iter()
            .map(|record| {
                settled.remove(&record.id).unwrap_or_else(|| {
                    RecordOutcome::failed(&record.id, "duplicate record id in batch", false)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordMetadata;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn record(id: &str) -> IndexRecord {
        IndexRecord {
            id: id.to_string(),
            content: format!("content of {id}"),
            title: "doc".to_string(),
            source: "doc.pdf".to_string(),
            page_numbers: vec![1],
            chunk_index: 0,
            content_vector: vec![0.5, 0.5],
            metadata: RecordMetadata {
                total_pages: 1,
                chunk_size: 10,
                content_checksum: "abc".to_string(),
                processed_at: Utc::now(),
            },
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(2),
        }
    }

    /// Scripted store: fails whole calls up to `failing_calls`, rejects `bad_ids`
    /// permanently, and throttles `flaky_ids` on their first attempt only.
    #[derive(Default)]
    struct ScriptedStore {
        calls: Mutex<Vec<Vec<String>>>,
        failing_calls: usize,
        bad_ids: HashSet<String>,
        flaky_ids: HashSet<String>,
    }

    #[async_trait]
    impl IndexStore for ScriptedStore {
        async fn ensure_schema(&self, _dimensions: usize) -> Result<(), IngestError> {
            Ok(())
        }

        async fn delete_schema(&self) -> Result<bool, IngestError> {
            Ok(false)
        }

        async fn merge_or_upload(
            &self,
            records: &[IndexRecord],
        ) -> Result<Vec<RecordOutcome>, IngestError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(records.iter().map(|record| record.id.clone()).collect());
                calls.len()
            };
            if call <= self.failing_calls {
                return Err(IngestError::index(true, "service unavailable"));
            }
            Ok(records
                .iter()
                .map(|record| {
                    if self.bad_ids.contains(&record.id) {
                        RecordOutcome::failed(&record.id, "invalid document", false)
                    } else if self.flaky_ids.contains(&record.id) && call == self.failing_calls + 1
                    {
                        RecordOutcome::failed(&record.id, "throttled", true)
                    } else {
                        RecordOutcome::succeeded(&record.id)
                    }
                })
                .collect())
        }
    }

    fn ids(outcomes: &[RecordOutcome]) -> Vec<(String, bool)> {
        outcomes
            .iter()
            .map(|outcome| (outcome.id.clone(), outcome.is_success()))
            .collect()
    }

    #[tokio::test]
    async fn one_bad_record_does_not_fail_the_batch() {
        let store = ScriptedStore {
            bad_ids: ["b".to_string()].into_iter().collect(),
            ..ScriptedStore::default()
        };
        let writer = IndexWriter::new(store, 10, fast_retry(3), Duration::from_secs(1)).unwrap();
        let records = vec![record("a"), record("b"), record("c")];

        let outcomes = writer.upsert(&records, &CancellationToken::new()).await;

        assert_eq!(
            ids(&outcomes),
            vec![
                ("a".to_string(), true),
                ("b".to_string(), false),
                ("c".to_string(), true)
            ]
        );
        assert_eq!(writer.store().calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn service_errors_are_retried_per_batch() {
        let store = ScriptedStore {
            failing_calls: 2,
            ..ScriptedStore::default()
        };
        let writer = IndexWriter::new(store, 10, fast_retry(3), Duration::from_secs(1)).unwrap();
        let outcomes = writer
            .upsert(&[record("a"), record("b")], &CancellationToken::new())
            .await;

        assert!(outcomes.iter().all(RecordOutcome::is_success));
        assert_eq!(writer.store().calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_only_that_batch() {
        let store = ScriptedStore {
            failing_calls: 3,
            ..ScriptedStore::default()
        };
        let writer = IndexWriter::new(store, 2, fast_retry(3), Duration::from_secs(1)).unwrap();
        let records = vec![record("a"), record("b"), record("c")];

        let outcomes = writer.upsert(&records, &CancellationToken::new()).await;

        assert_eq!(
            ids(&outcomes),
            vec![
                ("a".to_string(), false),
                ("b".to_string(), false),
                ("c".to_string(), true)
            ]
        );
        assert!(matches!(
            &outcomes[0].status,
            RecordStatus::Failed { reason, .. } if reason.contains("service unavailable")
        ));
    }

    #[tokio::test]
    async fn only_throttled_records_are_resent() {
        let store = ScriptedStore {
            flaky_ids: ["b".to_string()].into_iter().collect(),
            ..ScriptedStore::default()
        };
        let writer = IndexWriter::new(store, 10, fast_retry(3), Duration::from_secs(1)).unwrap();
        let outcomes = writer
            .upsert(&[record("a"), record("b")], &CancellationToken::new())
            .await;

        assert!(outcomes.iter().all(RecordOutcome::is_success));
        let calls = writer.store().calls.lock().unwrap().clone();
        assert_eq!(calls, vec![vec!["a".to_string(), "b".to_string()], vec!["b".to_string()]]);
    }

    #[tokio::test]
    async fn batches_respect_configured_size() {
        let writer = IndexWriter::new(
            ScriptedStore::default(),
            2,
            fast_retry(1),
            Duration::from_secs(1),
        )
        .unwrap();
        let records: Vec<_> = ["a", "b", "c", "d", "e"].into_iter().map(record).collect();

        let outcomes = writer.upsert(&records, &CancellationToken::new()).await;

        assert_eq!(outcomes.len(), 5);
        let sizes: Vec<usize> = writer
            .store()
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn cancelled_writer_sends_nothing() {
        let writer = IndexWriter::new(
            ScriptedStore::default(),
            1,
            fast_retry(1),
            Duration::from_secs(1),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcomes = writer.upsert(&[record("a"), record("b")], &cancel).await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|outcome| outcome.status == RecordStatus::Cancelled));
        assert!(writer.store().calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_during_backoff_cancels_pending_records() {
        let store = ScriptedStore {
            flaky_ids: ["b".to_string()].into_iter().collect(),
            ..ScriptedStore::default()
        };
        let slow_retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        };
        let writer = IndexWriter::new(store, 10, slow_retry, Duration::from_secs(1)).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcomes = writer.upsert(&[record("a"), record("b")], &cancel).await;

        assert_eq!(outcomes[0].status, RecordStatus::Succeeded);
        assert_eq!(outcomes[1].status, RecordStatus::Cancelled);
        assert_eq!(writer.store().calls.lock().unwrap().len(), 1);
    }
}
