use crate::error::{EmbeddingErrorKind, IngestError};
use crate::models::{Chunk, EmbeddingVector};
use crate::retry::{pause, retry_with_backoff, RetryPolicy};
use crate::traits::EmbeddingService;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub batch_index: usize,
    /// Positions of the affected chunks in the input slice.
    pub range: Range<usize>,
    pub reason: String,
    /// Stopped by cancellation rather than a service failure.
    pub cancelled: bool,
}

/// Result of embedding a chunk sequence; `vectors[i]` belongs to `chunks[i]`.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingRun {
    pub vectors: Vec<Option<EmbeddingVector>>,
    pub failures: Vec<BatchFailure>,
}

impl EmbeddingRun {
    pub fn succeeded(&self) -> usize {
        self.vectors.iter().filter(|vector| vector.is_some()).count()
    }

    pub fn failed_chunks(&self) -> usize {
        self.failures
            .iter()
            .filter(|failure| !failure.cancelled)
            .map(|failure| failure.range.len())
            .sum()
    }

    fn stop_at(&mut self, batch_index: usize, start: usize, total: usize) {
        info!(
            batch = batch_index + 1,
            skipped_chunks = total - start,
            "embedding stopped by cancellation"
        );
        self.failures.push(BatchFailure {
            batch_index,
            range: start..total,
            reason: IngestError::Cancelled.to_string(),
            cancelled: true,
        });
    }

    pub fn cancelled_chunks(&self) -> usize {
        self.failures
            .iter()
            .filter(|failure| failure.cancelled)
            .map(|failure| failure.range.len())
            .sum()
    }
}

/// Sends chunks to an [`EmbeddingService`] in paced, individually retried batches.
pub struct EmbeddingBatcher<E> {
    service: E,
    batch_size: usize,
    inter_batch_delay: Duration,
    retry: RetryPolicy,
    timeout: Duration,
}

impl<E: EmbeddingService> EmbeddingBatcher<E> {
    pub fn new(
        service: E,
        batch_size: usize,
        inter_batch_delay: Duration,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self, IngestError> {
        if batch_size == 0 {
            return Err(IngestError::Configuration(
                "embedding batch size must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            service,
            batch_size,
            inter_batch_delay,
            retry,
            timeout,
        })
    }

    pub fn service(&self) -> &E {
        &self.service
    }

    pub async fn embed(&self, chunks: &[Chunk], cancel: &CancellationToken) -> EmbeddingRun {
        let mut run = EmbeddingRun {
            vectors: vec![None; chunks.len()],
            failures: Vec::new(),
        };
        let batch_count = chunks.len().div_ceil(self.batch_size);

        for (batch_index, batch) in chunks.chunks(self.batch_size).enumerate() {
            let start = batch_index * self.batch_size;
            let range = start..start + batch.len();

            let may_start = batch_index == 0 || pause(self.inter_batch_delay, cancel).await;
            if !may_start || cancel.is_cancelled() {
                run.stop_at(batch_index, start, chunks.len());
                break;
            }

            match self.embed_one(batch, cancel).await {
                Err(IngestError::Cancelled) => {
                    run.stop_at(batch_index, start, chunks.len());
                    break;
                }
                Ok(vectors) => {
                    let generated_at = Utc::now();
                    for (slot, values) in run.vectors[range.clone()].iter_mut().zip(vectors) {
                        *slot = Some(EmbeddingVector {
                            values,
                            generated_at,
                        });
                    }
                    debug!(batch = batch_index + 1, batch_count, "embedding batch complete");
                }
                Err(error) => {
                    warn!(
                        batch = batch_index + 1,
                        batch_count,
                        chunks = batch.len(),
                        error = %error,
                        "embedding batch failed"
                    );
                    run.failures.push(BatchFailure {
                        batch_index,
                        range,
                        reason: error.to_string(),
                        cancelled: false,
                    });
                }
            }
        }

        run
    }

    async fn embed_one(
        &self,
        batch: &[Chunk],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, IngestError> {
        let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = retry_with_backoff(&self.retry, self.timeout, "embed", cancel, || {
            self.service.embed_batch(&texts)
        })
        .await?;

        if vectors.len() != batch.len() {
            return Err(IngestError::embedding(
                EmbeddingErrorKind::Permanent,
                format!(
                    "received {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                ),
            ));
        }

        let expected = self.service.dimensions();
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != expected) {
            return Err(IngestError::embedding(
                EmbeddingErrorKind::Permanent,
                format!("vector has {} dimensions, expected {expected}", bad.len()),
            ));
        }

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Encodes each text's position marker into the vector so order can be checked.
    struct RecordingService {
        calls: Mutex<Vec<(Instant, usize)>>,
        failing_calls: HashSet<usize>,
        dimensions: usize,
    }

    impl RecordingService {
        fn new(failing_calls: &[usize]) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failing_calls: failing_calls.iter().copied().collect(),
                dimensions: 2,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EmbeddingService for RecordingService {
        fn dimensions(&self) -> usize {
            self.dimensions
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((Instant::now(), texts.len()));
                calls.len()
            };
            if self.failing_calls.contains(&call) {
                return Err(IngestError::embedding(
                    EmbeddingErrorKind::Permanent,
                    "simulated failure",
                ));
            }
            Ok(texts
                .iter()
                .map(|text| vec![text.parse::<f32>().unwrap_or(-1.0), 0.0])
                .collect())
        }
    }

    fn chunks(count: usize) -> Vec<Chunk> {
        (0..count)
            .map(|index| Chunk {
                document_id: "doc.pdf".to_string(),
                sequence_index: index as u64,
                page_numbers: vec![1],
                start_char: 0,
                end_char: 0,
                text: index.to_string(),
                char_len: 1,
            })
            .collect()
    }

    fn batcher<E: EmbeddingService>(
        service: E,
        batch_size: usize,
        delay: Duration,
    ) -> EmbeddingBatcher<E> {
        let retry = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        EmbeddingBatcher::new(service, batch_size, delay, retry, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn vectors_align_with_input_for_any_batch_size() {
        let input = chunks(23);
        for batch_size in [1, 4, 5, 22, 23, 50] {
            let batcher = batcher(RecordingService::new(&[]), batch_size, Duration::ZERO);
            let run = batcher.embed(&input, &CancellationToken::new()).await;

            assert_eq!(run.vectors.len(), 23);
            assert!(run.failures.is_empty());
            for (position, vector) in run.vectors.iter().enumerate() {
                let vector = vector.as_ref().expect("every chunk embedded");
                assert_eq!(vector.values[0], position as f32);
            }
            assert_eq!(
                batcher.service().call_count(),
                23usize.div_ceil(batch_size)
            );
        }
    }

    #[tokio::test]
    async fn failed_middle_batch_does_not_affect_siblings() {
        let batcher = batcher(RecordingService::new(&[2]), 4, Duration::ZERO);
        let run = batcher.embed(&chunks(12), &CancellationToken::new()).await;

        assert_eq!(run.failures.len(), 1);
        assert_eq!(run.failures[0].batch_index, 1);
        assert_eq!(run.failures[0].range, 4..8);
        assert!(!run.failures[0].cancelled);
        assert_eq!(run.succeeded(), 8);
        assert_eq!(run.failed_chunks(), 4);
        assert!(run.vectors[..4].iter().all(Option::is_some));
        assert!(run.vectors[4..8].iter().all(Option::is_none));
        assert!(run.vectors[8..].iter().all(Option::is_some));
    }

    #[tokio::test]
    async fn delay_only_between_batches() {
        let delay = Duration::from_millis(30);
        let batcher = batcher(RecordingService::new(&[]), 2, delay);
        let started = Instant::now();
        batcher.embed(&chunks(6), &CancellationToken::new()).await;

        let calls = batcher.service().calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].0.duration_since(started) < delay);
        for pair in calls.windows(2) {
            assert!(pair[1].0.duration_since(pair[0].0) >= delay);
        }
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let batcher = batcher(RecordingService::new(&[]), 3, Duration::from_secs(10));
        let run = batcher.embed(&[], &CancellationToken::new()).await;
        assert!(run.vectors.is_empty());
        assert_eq!(batcher.service().call_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_new_batches() {
        let batcher = batcher(RecordingService::new(&[]), 2, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let run = batcher.embed(&chunks(6), &cancel).await;

        assert_eq!(batcher.service().call_count(), 1);
        assert_eq!(run.succeeded(), 2);
        assert_eq!(run.cancelled_chunks(), 4);
        assert_eq!(run.failed_chunks(), 0);
        assert_eq!(run.failures[0].range, 2..6);
    }

    #[tokio::test]
    async fn wrong_dimension_fails_the_batch() {
        let mut service = RecordingService::new(&[]);
        service.dimensions = 3;
        let batcher = batcher(service, 10, Duration::ZERO);
        let run = batcher.embed(&chunks(2), &CancellationToken::new()).await;
        assert_eq!(run.failed_chunks(), 2);
        assert!(run.failures[0].reason.contains("dimensions"));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let result = EmbeddingBatcher::new(
            RecordingService::new(&[]),
            0,
            Duration::ZERO,
            RetryPolicy::default(),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(IngestError::Configuration(_))));
    }
}
