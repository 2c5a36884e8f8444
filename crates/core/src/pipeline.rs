use crate::batcher::EmbeddingBatcher;
use crate::chunking::{chunk_pages, ChunkingConfig};
use crate::config::{EmptyDocumentPolicy, PipelineConfig};
use crate::error::IngestError;
use crate::fingerprint::record_id;
use crate::index::IndexWriter;
use crate::ingest::discover_documents;
use crate::models::{
    Chunk, DocumentRef, EmbeddingVector, IndexRecord, RecordMetadata, RecordStatus,
    SourceDocument,
};
use crate::parser::PageText;
use crate::report::{DocumentReport, DocumentStage, RunReport};
use crate::traits::{EmbeddingService, IndexStore, PdfParser};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives documents through parse, chunk, embed and upload, one report per run.
pub struct Pipeline<P, E, S> {
    config: PipelineConfig,
    parser: P,
    batcher: EmbeddingBatcher<E>,
    writer: IndexWriter<S>,
}

impl<P, E, S> Pipeline<P, E, S>
where
    P: PdfParser,
    E: EmbeddingService,
    S: IndexStore,
{
    pub fn new(
        config: PipelineConfig,
        parser: P,
        embedder: E,
        store: S,
    ) -> Result<Self, IngestError> {
        config.validate()?;
        let batcher = EmbeddingBatcher::new(
            embedder,
            config.embedding_batch_size,
            config.embedding_batch_delay,
            config.embedding_retry,
            config.embed_timeout,
        )?;
        let writer = IndexWriter::new(
            store,
            config.upload_batch_size,
            config.upload_retry,
            config.upsert_timeout,
        )?;

        Ok(Self {
            config,
            parser,
            batcher,
            writer,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn embedder(&self) -> &E {
        self.batcher.service()
    }

    pub fn store(&self) -> &S {
        self.writer.store()
    }

    pub async fn run_folder(
        &self,
        folder: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunReport, IngestError> {
        let documents = discover_documents(folder)?;
        Ok(self.run(documents, cancel).await)
    }

    /// Processes every document; failures are captured in the report, never returned.
    pub async fn run(&self, documents: Vec<DocumentRef>, cancel: &CancellationToken) -> RunReport {
        let mut report = RunReport::start();
        info!(
            run_id = %report.run_id,
            documents = documents.len(),
            concurrency = self.config.max_concurrent_documents,
            "ingestion run started"
        );

        let mut finished = stream::iter(documents)
            .map(|document| self.process_unless_cancelled(document, cancel))
            .buffer_unordered(self.config.max_concurrent_documents);

        while let Some(document) = finished.next().await {
            report.record(document);
        }

        report.finish(cancel.is_cancelled());
        info!(
            run_id = %report.run_id,
            status = ?report.status,
            documents = report.totals.documents,
            failed_documents = report.totals.documents_failed,
            records_upserted = report.totals.records_upserted,
            records_failed = report.totals.records_failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "ingestion run finished"
        );
        report
    }

    async fn process_unless_cancelled(
        &self,
        document: DocumentRef,
        cancel: &CancellationToken,
    ) -> DocumentReport {
        if cancel.is_cancelled() {
            debug!(document = %document.identity, "skipped after cancellation");
            return DocumentReport::new(document);
        }
        self.process_document(document, cancel).await
    }

    pub async fn process_document(
        &self,
        document: DocumentRef,
        cancel: &CancellationToken,
    ) -> DocumentReport {
        let mut report = DocumentReport::new(document);

        if let Err(error) = self.drive(&mut report, cancel).await {
            warn!(
                document = %report.document.identity,
                stage = ?report.stage,
                error = %error,
                "document failed"
            );
            report.fail(error.to_string());
        }
        report.finish();

        info!(
            document = %report.document.identity,
            outcome = ?report.outcome,
            pages = report.pages_parsed,
            chunks = report.chunks_created,
            upserted = report.records_upserted,
            failed = report.records_failed,
            cancelled = report.chunks_cancelled,
            "document finished"
        );
        report
    }

    async fn drive(
        &self,
        report: &mut DocumentReport,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        report.enter(DocumentStage::Parsing);
        let source = SourceDocument::load(&report.document).await?;
        let pages = self.parse(&source).await?;
        report.pages_parsed = pages.len();
        debug!(document = %source.identity, pages = pages.len(), "parsed");

        report.enter(DocumentStage::Chunking);
        let chunks = chunk_pages(&source.identity, &pages, ChunkingConfig::from(&self.config))?;
        report.chunks_created = chunks.len();
        debug!(document = %source.identity, chunks = chunks.len(), "chunked");

        if chunks.is_empty() {
            return match self.config.empty_documents {
                EmptyDocumentPolicy::Succeed => {
                    warn!(document = %source.identity, "document has no extractable text");
                    Ok(())
                }
                EmptyDocumentPolicy::Fail => Err(IngestError::EmptyDocument),
            };
        }

        report.enter(DocumentStage::Embedding);
        let run = self.batcher.embed(&chunks, cancel).await;
        report.embeddings_generated = run.succeeded();
        report.chunks_cancelled += run.cancelled_chunks();
        for failure in run.failures.iter().filter(|failure| !failure.cancelled) {
            let ids = chunks[failure.range.clone()]
                .iter()
                .map(|chunk| record_id(&chunk.document_id, chunk.sequence_index))
                .collect();
            report.record_failures(&failure.reason, ids);
        }

        let records: Vec<IndexRecord> = chunks
            .iter()
            .zip(run.vectors)
            .filter_map(|(chunk, vector)| {
                vector.map(|vector| build_record(&source, pages.len(), chunk, vector))
            })
            .collect();
        if records.is_empty() {
            return Ok(());
        }

        report.enter(DocumentStage::Uploading);
        let mut rejected: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for outcome in self.writer.upsert(&records, cancel).await {
            match outcome.status {
                RecordStatus::Succeeded => report.records_upserted += 1,
                RecordStatus::Cancelled => report.chunks_cancelled += 1,
                RecordStatus::Failed { reason, .. } => {
                    rejected.entry(reason).or_default().push(outcome.id)
                }
            }
        }
        for (reason, ids) in rejected {
            report.record_failures(reason, ids);
        }

        Ok(())
    }

    /// Parsing is not retried: a parse failure is final for the document.
    async fn parse(&self, source: &SourceDocument) -> Result<Vec<PageText>, IngestError> {
        let timeout = self.config.parse_timeout;
        match tokio::time::timeout(timeout, self.parser.parse(&source.bytes)).await {
            Ok(result) => result,
            Err(_) => Err(IngestError::Timeout {
                operation: "parse",
                after: timeout,
            }),
        }
    }
}

fn build_record(
    source: &SourceDocument,
    total_pages: usize,
    chunk: &Chunk,
    vector: EmbeddingVector,
) -> IndexRecord {
    IndexRecord {
        id: record_id(&chunk.document_id, chunk.sequence_index),
        content: chunk.text.clone(),
        title: source.title(),
        source: source.name.clone(),
        page_numbers: chunk.page_numbers.clone(),
        chunk_index: chunk.sequence_index,
        content_vector: vector.values,
        metadata: RecordMetadata {
            total_pages,
            chunk_size: chunk.char_len,
            content_checksum: source.checksum.clone(),
            processed_at: vector.generated_at,
        },
    }
}
