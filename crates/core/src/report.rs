use crate::models::DocumentRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStage {
    Discovered,
    Parsing,
    Chunking,
    Embedding,
    Uploading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentOutcome {
    Succeeded,
    PartiallySucceeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: DocumentStage,
    /// Chunks or records affected; 1 for a document-fatal failure.
    pub count: usize,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub record_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentReport {
    pub document: DocumentRef,
    pub stage: DocumentStage,
    pub outcome: DocumentOutcome,
    pub pages_parsed: usize,
    pub chunks_created: usize,
    pub embeddings_generated: usize,
    pub records_upserted: usize,
    /// Chunks that failed to embed plus records the store rejected.
    pub records_failed: usize,
    pub chunks_cancelled: usize,
    pub failures: Vec<StageFailure>,
}

impl DocumentReport {
    /// A report that is never finished reads as cancelled at `Discovered`.
    pub fn new(document: DocumentRef) -> Self {
        Self {
            document,
            stage: DocumentStage::Discovered,
            outcome: DocumentOutcome::Cancelled,
            pages_parsed: 0,
            chunks_created: 0,
            embeddings_generated: 0,
            records_upserted: 0,
            records_failed: 0,
            chunks_cancelled: 0,
            failures: Vec::new(),
        }
    }

    pub fn enter(&mut self, stage: DocumentStage) {
        self.stage = stage;
    }

    /// Records a failure that ends the document at its current stage.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failures.push(StageFailure {
            stage: self.stage,
            count: 1,
            reason: reason.into(),
            record_ids: Vec::new(),
        });
        self.stage = DocumentStage::Failed;
        self.outcome = DocumentOutcome::Failed;
    }

    /// Records failed chunks or records without ending the document.
    pub fn record_failures(&mut self, reason: impl Into<String>, record_ids: Vec<String>) {
        self.records_failed += record_ids.len();
        self.failures.push(StageFailure {
            stage: self.stage,
            count: record_ids.len(),
            reason: reason.into(),
            record_ids,
        });
    }

    /// Settles the outcome once every stage has run or been skipped.
    pub fn finish(&mut self) {
        if self.stage == DocumentStage::Failed {
            self.outcome = DocumentOutcome::Failed;
            return;
        }

        let attempted = self.records_upserted + self.records_failed;
        self.outcome = if self.records_failed == 0 && self.chunks_cancelled == 0 {
            DocumentOutcome::Succeeded
        } else if self.records_upserted > 0 {
            DocumentOutcome::PartiallySucceeded
        } else if attempted == 0 {
            DocumentOutcome::Cancelled
        } else {
            DocumentOutcome::Failed
        };

        self.stage = match self.outcome {
            DocumentOutcome::Failed => DocumentStage::Failed,
            DocumentOutcome::Cancelled => self.stage,
            _ => DocumentStage::Completed,
        };
    }

    pub fn is_success(&self) -> bool {
        self.outcome == DocumentOutcome::Succeeded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    FullySucceeded,
    PartiallySucceeded,
    FullyFailed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub documents: usize,
    pub documents_succeeded: usize,
    pub documents_failed: usize,
    pub documents_cancelled: usize,
    pub pages_parsed: usize,
    pub chunks_created: usize,
    pub embeddings_generated: usize,
    pub records_upserted: usize,
    pub records_failed: usize,
    pub chunks_cancelled: usize,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub elapsed: Duration,
    pub cancelled: bool,
    pub status: RunStatus,
    pub totals: RunTotals,
    pub documents: Vec<DocumentReport>,
}

impl RunReport {
    pub fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            elapsed: Duration::ZERO,
            cancelled: false,
            status: RunStatus::FullySucceeded,
            totals: RunTotals::default(),
            documents: Vec::new(),
        }
    }

    pub fn record(&mut self, document: DocumentReport) {
        self.documents.push(document);
    }

    pub fn finish(&mut self, cancelled: bool) {
        let finished_at = Utc::now();
        self.elapsed = (finished_at - self.started_at)
            .to_std()
            .unwrap_or_default();
        self.finished_at = Some(finished_at);
        self.cancelled = cancelled;
        self.documents
            .sort_by(|left, right| left.document.identity.cmp(&right.document.identity));
        self.totals = self.compute_totals();
        self.status = self.compute_status();
    }

    fn compute_totals(&self) -> RunTotals {
        self.documents
            .iter()
            .fold(RunTotals::default(), |mut totals, document| {
                totals.documents += 1;
                match document.outcome {
                    DocumentOutcome::Succeeded => totals.documents_succeeded += 1,
                    DocumentOutcome::Cancelled => totals.documents_cancelled += 1,
                    DocumentOutcome::Failed | DocumentOutcome::PartiallySucceeded => {
                        totals.documents_failed += 1
                    }
                }
                totals.pages_parsed += document.pages_parsed;
                totals.chunks_created += document.chunks_created;
                totals.embeddings_generated += document.embeddings_generated;
                totals.records_upserted += document.records_upserted;
                totals.records_failed += document.records_failed;
                totals.chunks_cancelled += document.chunks_cancelled;
                totals
            })
    }

    fn compute_status(&self) -> RunStatus {
        if !self.cancelled && self.documents.iter().all(DocumentReport::is_success) {
            return RunStatus::FullySucceeded;
        }

        let anything_landed = self.documents.iter().any(|document| {
            document.is_success() || document.outcome == DocumentOutcome::PartiallySucceeded
        });
        if anything_landed {
            RunStatus::PartiallySucceeded
        } else {
            RunStatus::FullyFailed
        }
    }

    /// 0 only when every document and every chunk succeeded.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::FullySucceeded => 0,
            RunStatus::PartiallySucceeded | RunStatus::FullyFailed => 1,
        }
    }

    /// Documents that need another run: anything not fully succeeded.
    pub fn failed_documents(&self) -> Vec<&DocumentReport> {
        self.documents
            .iter()
            .filter(|document| !document.is_success())
            .collect()
    }
}
