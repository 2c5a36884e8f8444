use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use pdf_ingest_core::{
    CharacterNgramEmbedder, EmbeddingService, EmptyDocumentPolicy, FallbackParser, IndexStore,
    IngestError, LopdfParser, MemoryIndexStore, OpenAiEmbeddingConfig, OpenAiEmbeddingService,
    OpenSearchStore, PdfParser, Pipeline, PipelineConfig, RemoteLayoutParser, RetryPolicy,
    RunReport, DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_EMBEDDING_MODEL,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Ingest a folder of PDFs into a hybrid keyword and vector search index.
#[derive(Parser)]
#[command(name = "pdf-ingest", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    embeddings: EmbeddingArgs,

    #[command(flatten)]
    index: IndexArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Parse, chunk, embed and upsert every PDF under a folder.
    Ingest(IngestArgs),
    /// Create the search index when it does not exist yet.
    EnsureSchema(SchemaArgs),
}

#[derive(Args)]
struct SchemaArgs {
    /// Delete the index and all of its records before creating it again.
    #[arg(long, short = 'd')]
    recreate: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmbedderKind {
    /// OpenAI-compatible or Azure OpenAI embeddings endpoint.
    Openai,
    /// Offline hashed character trigrams.
    Ngram,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Opensearch,
    Memory,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmptyDocuments {
    Succeed,
    Fail,
}

#[derive(Args)]
struct EmbeddingArgs {
    #[arg(long, value_enum, env = "EMBEDDER", default_value_t = EmbedderKind::Openai)]
    embedder: EmbedderKind,

    /// Base URL of the embeddings API
    #[arg(long, env = "EMBEDDINGS_ENDPOINT", default_value = "https://api.openai.com/v1")]
    embeddings_endpoint: String,

    #[arg(long, env = "EMBEDDINGS_API_KEY", hide_env_values = true)]
    embeddings_api_key: Option<String>,

    /// Model name, or deployment name for Azure OpenAI
    #[arg(long, env = "EMBEDDINGS_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    embeddings_model: String,

    /// Azure OpenAI api-version; switches to the deployment URL layout
    #[arg(long, env = "EMBEDDINGS_API_VERSION")]
    embeddings_api_version: Option<String>,

    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,
}

impl EmbeddingArgs {
    fn build(&self, timeout: Duration) -> Result<Box<dyn EmbeddingService>, IngestError> {
        match self.embedder {
            EmbedderKind::Ngram => Ok(Box::new(CharacterNgramEmbedder {
                dimensions: self.embedding_dimensions,
            })),
            EmbedderKind::Openai => {
                let api_key = self.embeddings_api_key.clone().ok_or_else(|| {
                    IngestError::Configuration(
                        "EMBEDDINGS_API_KEY is required for the openai embedder".to_string(),
                    )
                })?;
                let service = OpenAiEmbeddingService::new(OpenAiEmbeddingConfig {
                    endpoint: self.embeddings_endpoint.clone(),
                    api_key,
                    model: self.embeddings_model.clone(),
                    api_version: self.embeddings_api_version.clone(),
                    dimensions: self.embedding_dimensions,
                    timeout,
                })?;
                info!(url = %service.url(), model = %self.embeddings_model, "embedding service");
                Ok(Box::new(service))
            }
        }
    }
}

#[derive(Args)]
struct IndexArgs {
    #[arg(long, value_enum, env = "INDEX_STORE", default_value_t = StoreKind::Opensearch)]
    store: StoreKind,

    /// OpenSearch base URL
    #[arg(long, env = "OPENSEARCH_URL", default_value = "http://localhost:9200")]
    opensearch_url: String,

    #[arg(long, env = "SEARCH_INDEX_NAME", default_value = "documents-index")]
    index_name: String,

    #[arg(long, env = "OPENSEARCH_USERNAME")]
    opensearch_username: Option<String>,

    #[arg(long, env = "OPENSEARCH_PASSWORD", hide_env_values = true)]
    opensearch_password: Option<String>,
}

impl IndexArgs {
    fn build(&self, kind: StoreKind) -> Box<dyn IndexStore> {
        match kind {
            StoreKind::Memory => Box::new(MemoryIndexStore::new()),
            StoreKind::Opensearch => {
                let store = OpenSearchStore::new(&self.opensearch_url, &self.index_name);
                match (&self.opensearch_username, &self.opensearch_password) {
                    (Some(user), Some(password)) => Box::new(store.with_basic_auth(user, password)),
                    _ => Box::new(store),
                }
            }
        }
    }
}

#[derive(Args)]
struct IngestArgs {
    /// Folder scanned recursively for PDFs
    #[arg(long, env = "DATA_FOLDER", default_value = "data")]
    folder: PathBuf,

    #[arg(long, env = "CHUNK_SIZE", default_value_t = 1_000)]
    chunk_size: usize,

    #[arg(long, env = "CHUNK_OVERLAP", default_value_t = 200)]
    chunk_overlap: usize,

    #[arg(long, env = "EMBEDDING_BATCH_SIZE", default_value_t = 50)]
    embedding_batch_size: usize,

    /// Seconds to wait between embedding batches
    #[arg(long, env = "EMBEDDING_BATCH_DELAY", default_value_t = 2.0)]
    embedding_batch_delay: f64,

    #[arg(long, env = "UPLOAD_BATCH_SIZE", default_value_t = 500)]
    upload_batch_size: usize,

    #[arg(long, env = "MAX_CONCURRENT_DOCUMENTS", default_value_t = 1)]
    max_concurrent_documents: usize,

    #[arg(long, env = "PARSE_TIMEOUT", default_value_t = 120.0)]
    parse_timeout: f64,

    #[arg(long, env = "EMBED_TIMEOUT", default_value_t = 60.0)]
    embed_timeout: f64,

    #[arg(long, env = "UPSERT_TIMEOUT", default_value_t = 60.0)]
    upsert_timeout: f64,

    /// Attempts per embedding or upload batch, first call included
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    retry_max_attempts: u32,

    #[arg(long, env = "RETRY_BASE_DELAY", default_value_t = 1.0)]
    retry_base_delay: f64,

    #[arg(long, value_enum, env = "EMPTY_DOCUMENTS", default_value_t = EmptyDocuments::Succeed)]
    empty_documents: EmptyDocuments,

    /// Layout/OCR service used when a PDF has no text layer
    #[arg(long, env = "LAYOUT_ENDPOINT")]
    layout_endpoint: Option<String>,

    #[arg(long, env = "LAYOUT_API_KEY", hide_env_values = true)]
    layout_api_key: Option<String>,

    /// Write to an in-memory index instead of the configured store
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Print the run report as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl IngestArgs {
    fn pipeline_config(&self) -> Result<PipelineConfig, IngestError> {
        let retry = RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: PipelineConfig::delay_from_secs(self.retry_base_delay)?,
            ..RetryPolicy::default()
        };

        let config = PipelineConfig {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            embedding_batch_size: self.embedding_batch_size,
            embedding_batch_delay: PipelineConfig::delay_from_secs(self.embedding_batch_delay)?,
            upload_batch_size: self.upload_batch_size,
            max_concurrent_documents: self.max_concurrent_documents,
            parse_timeout: PipelineConfig::delay_from_secs(self.parse_timeout)?,
            embed_timeout: PipelineConfig::delay_from_secs(self.embed_timeout)?,
            upsert_timeout: PipelineConfig::delay_from_secs(self.upsert_timeout)?,
            embedding_retry: retry,
            upload_retry: retry,
            empty_documents: match self.empty_documents {
                EmptyDocuments::Succeed => EmptyDocumentPolicy::Succeed,
                EmptyDocuments::Fail => EmptyDocumentPolicy::Fail,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn parser(&self, timeout: Duration) -> Result<Box<dyn PdfParser>, IngestError> {
        match &self.layout_endpoint {
            Some(endpoint) => {
                let remote =
                    RemoteLayoutParser::new(endpoint, self.layout_api_key.clone(), timeout)?;
                Ok(Box::new(FallbackParser::new(LopdfParser, remote)))
            }
            None => Ok(Box::new(LopdfParser)),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "pdf-ingest boot"
    );

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            error!(error = %format!("{error:#}"), "pdf-ingest failed");
            ExitCode::from(exit_code_for(&error))
        }
    }
}

/// 2 for bad configuration or arguments, 1 for anything else.
fn exit_code_for(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<IngestError>() {
        Some(IngestError::Configuration(_) | IngestError::InvalidArgument(_)) => 2,
        _ => 1,
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    match cli.command {
        Command::EnsureSchema(args) => {
            let store = cli.index.build(cli.index.store);
            if args.recreate {
                let deleted = store
                    .delete_schema()
                    .await
                    .context("deleting search index")?;
                if deleted {
                    warn!(index = %cli.index.index_name, "deleted existing index and its records");
                }
            }
            store
                .ensure_schema(cli.embeddings.embedding_dimensions)
                .await
                .context("creating search index")?;
            println!("index {} ready", cli.index.index_name);
            Ok(0)
        }
        Command::Ingest(args) => ingest(args, &cli.embeddings, &cli.index).await,
    }
}

async fn ingest(
    args: IngestArgs,
    embeddings: &EmbeddingArgs,
    index: &IndexArgs,
) -> anyhow::Result<u8> {
    let config = args.pipeline_config()?;
    let parser = args.parser(config.parse_timeout)?;
    let embedder = embeddings.build(config.embed_timeout)?;
    let store = index.build(if args.dry_run {
        StoreKind::Memory
    } else {
        index.store
    });

    let pipeline = Pipeline::new(config, parser, embedder, store)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting in-flight calls finish");
            on_interrupt.cancel();
        }
    });

    let report = pipeline.run_folder(&args.folder, &cancel).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(report.exit_code())
}

fn print_summary(report: &RunReport) {
    for document in &report.documents {
        println!(
            "{} [{:?}] pages={} chunks={} upserted={} failed={} cancelled={}",
            document.document.identity,
            document.outcome,
            document.pages_parsed,
            document.chunks_created,
            document.records_upserted,
            document.records_failed,
            document.chunks_cancelled
        );
        for failure in &document.failures {
            println!(
                "  {:?}: {} ({} affected)",
                failure.stage, failure.reason, failure.count
            );
        }
    }

    println!(
        "run {} {:?}: {} documents, {} records upserted, {} failed in {:.1}s",
        report.run_id,
        report.status,
        report.totals.documents,
        report.totals.records_upserted,
        report.totals.records_failed,
        report.elapsed.as_secs_f64()
    );

    let failed = report.failed_documents();
    if !failed.is_empty() {
        println!("re-run needed for:");
        for document in failed {
            println!("  {}", document.document.identity);
        }
    }
}
