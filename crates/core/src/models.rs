use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A document discovered on disk but not yet read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Stable identity: the path relative to the ingestion root, `/`-separated.
    pub identity: String,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub identity: String,
    pub name: String,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub checksum: String,
}

impl SourceDocument {
    /// File name without its extension, used as the record title.
    pub fn title(&self) -> String {
        Path::new(&self.name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.name)
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub document_id: String,
    pub sequence_index: u64,
    pub page_numbers: Vec<u32>,
    pub start_char: usize,
    pub end_char: usize,
    pub text: String,
    pub char_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub values: Vec<f32>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub total_pages: usize,
    pub chunk_size: usize,
    pub content_checksum: String,
    pub processed_at: DateTime<Utc>,
}

/// The unit written to the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub id: String,
    pub content: String,
    pub title: String,
    pub source: String,
    pub page_numbers: Vec<u32>,
    pub chunk_index: u64,
    pub content_vector: Vec<f32>,
    pub metadata: RecordMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    Succeeded,
    Failed { reason: String, retryable: bool },
    /// Not sent because the run was cancelled first.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub id: String,
    #[serde(flatten)]
    pub status: RecordStatus,
}

impl RecordOutcome {
    pub fn succeeded(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: RecordStatus::Succeeded,
        }
    }

    pub fn failed(id: impl Into<String>, reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            id: id.into(),
            status: RecordStatus::Failed {
                reason: reason.into(),
                retryable,
            },
        }
    }

    pub fn cancelled(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: RecordStatus::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, RecordStatus::Succeeded)
    }
}
