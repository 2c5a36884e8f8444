pub mod batcher;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod ingest;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod stores;
pub mod traits;

pub use batcher::{BatchFailure, EmbeddingBatcher, EmbeddingRun};
pub use chunking::{chunk_pages, normalize_page_text, ChunkingConfig, PreparedText};
pub use config::{EmptyDocumentPolicy, PipelineConfig};
pub use embeddings::{
    CharacterNgramEmbedder, OpenAiEmbeddingConfig, OpenAiEmbeddingService,
    DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_EMBEDDING_MODEL,
};
pub use error::{EmbeddingErrorKind, IngestError};
pub use fingerprint::{content_checksum, record_id};
pub use index::IndexWriter;
pub use ingest::{discover_documents, discover_pdf_files, document_identity};
pub use models::{
    Chunk, DocumentRef, EmbeddingVector, IndexRecord, RecordMetadata, RecordOutcome,
    RecordStatus, SourceDocument,
};
pub use parser::{FallbackParser, LopdfParser, PageText, RemoteLayoutParser};
pub use pipeline::Pipeline;
pub use report::{
    DocumentOutcome, DocumentReport, DocumentStage, RunReport, RunStatus, RunTotals,
    StageFailure,
};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use stores::{MemoryIndexStore, OpenSearchStore};
pub use traits::{EmbeddingService, IndexStore, PdfParser};
