use crate::error::IngestError;
use crate::models::{IndexRecord, RecordOutcome};
use crate::parser::PageText;
use async_trait::async_trait;

/// Turns raw PDF bytes into ordered page texts.
#[async_trait]
pub trait PdfParser: Send + Sync {
    async fn parse(&self, pdf: &[u8]) -> Result<Vec<PageText>, IngestError>;
}

/// Produces one vector per input text, in input order.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError>;
}

/// A search store accepting merge-or-upload writes.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Creates the index when it does not exist yet. Never called by the pipeline itself.
    async fn ensure_schema(&self, dimensions: usize) -> Result<(), IngestError>;

    /// Drops the index and every record in it. Returns `false` when there was nothing to drop.
    async fn delete_schema(&self) -> Result<bool, IngestError>;

    /// Inserts records or replaces existing ones with the same id, reporting per record.
    async fn merge_or_upload(
        &self,
        records: &[IndexRecord],
    ) -> Result<Vec<RecordOutcome>, IngestError>;
}

#[async_trait]
impl<T: PdfParser + ?Sized> PdfParser for Box<T> {
    async fn parse(&self, pdf: &[u8]) -> Result<Vec<PageText>, IngestError> {
        (**self).parse(pdf).await
    }
}

#[async_trait]
impl<T: EmbeddingService + ?Sized> EmbeddingService for Box<T> {
    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        (**self).embed_batch(texts).await
    }
}

#[async_trait]
impl<T: IndexStore + ?Sized> IndexStore for Box<T> {
    async fn ensure_schema(&self, dimensions: usize) -> Result<(), IngestError> {
        (**self).ensure_schema(dimensions).await
    }

    async fn delete_schema(&self) -> Result<bool, IngestError> {
        (**self).delete_schema().await
    }

    async fn merge_or_upload(
        &self,
        records: &[IndexRecord],
    ) -> Result<Vec<RecordOutcome>, IngestError> {
        (**self).merge_or_upload(records).await
    }
}
