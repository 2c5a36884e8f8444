use crate::error::IngestError;
use crate::models::{IndexRecord, RecordOutcome};
use crate::traits::IndexStore;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// Hybrid keyword + `knn_vector` index on OpenSearch.
pub struct OpenSearchStore {
    client: Arc<Client>,
    endpoint: String,
    index_name: String,
    credentials: Option<(String, String)>,
}

impl OpenSearchStore {
    pub fn new(endpoint: impl Into<String>, index_name: impl Into<String>) -> Self {
        Self {
            client: Arc::new(Client::new()),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            index_name: index_name.into(),
            credentials: None,
        }
    }

    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.endpoint, path));
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }

    fn bulk_payload(&self, records: &[IndexRecord]) -> Result<String, IngestError> {
        let mut lines = Vec::with_capacity(records.len() * 2);
        for record in records {
            lines.push(serde_json::to_string(&json!({
                "update": { "_index": self.index_name, "_id": record.id }
            }))?);
            let doc = serde_json::to_value(record)?;
            lines.push(serde_json::to_string(&json!({
                "doc": doc,
                "doc_as_upsert": true,
            }))?);
        }
        Ok(lines.join("\n") + "\n")
    }
}

pub(crate) fn index_mapping(dimensions: usize) -> Value {
    json!({
        "settings": {
            "index": { "knn": true },
            "number_of_shards": 1,
            "number_of_replicas": 0
        },
        "mappings": {
            "properties": {
                "id": {"type": "keyword"},
                "content": {"type": "text", "analyzer": "standard"},
                "title": {
                    "type": "text",
                    "fields": {"raw": {"type": "keyword"}}
                },
                "source": {"type": "keyword"},
                "page_numbers": {"type": "integer"},
                "chunk_index": {"type": "long"},
                "content_vector": {
                    "type": "knn_vector",
                    "dimension": dimensions,
                    "method": {
                        "name": "hnsw",
                        "space_type": "cosinesimil",
                        "engine": "lucene",
                        "parameters": {"m": 4, "ef_construction": 400}
                    }
                },
                "metadata": {
                    "properties": {
                        "total_pages": {"type": "integer"},
                        "chunk_size": {"type": "integer"},
                        "content_checksum": {"type": "keyword"},
                        "processed_at": {"type": "date"}
                    }
                }
            }
        }
    })
}

fn status_is_retryable(status: u64) -> bool {
    status == 429 || status >= 500
}

/// Maps a `_bulk` response onto one outcome per submitted record.
pub(crate) fn parse_bulk_response(
    response: &Value,
    records: &[IndexRecord],
) -> Vec<RecordOutcome> {
    let items = response
        .pointer("/items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    records
        .iter()
        .enumerate()
        .map(|(position, record)| {
            let Some(item) = items.get(position).and_then(|item| item.get("update")) else {
                return RecordOutcome::failed(&record.id, "missing bulk item", true);
            };

            let status = item.pointer("/status").and_then(Value::as_u64).unwrap_or(0);
            if (200..300).contains(&status) && item.get("error").is_none() {
                return RecordOutcome::succeeded(&record.id);
            }

            let reason = item
                .pointer("/error/reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("bulk item status {status}"));
            RecordOutcome::failed(&record.id, reason, status_is_retryable(status))
        })
        .collect()
}

#[async_trait]
impl IndexStore for OpenSearchStore {
    async fn ensure_schema(&self, dimensions: usize) -> Result<(), IngestError> {
        let response = self
            .request(reqwest::Method::HEAD, &self.index_name)
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            info!(index = %self.index_name, "index already exists");
            return Ok(());
        }

        if response.status() != StatusCode::NOT_FOUND {
            return Err(IngestError::index(
                response.status().is_server_error(),
                format!("index lookup returned {}", response.status()),
            ));
        }

        let response = self
            .request(reqwest::Method::PUT, &self.index_name)
            .json(&index_mapping(dimensions))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IngestError::index(
                false,
                format!("index creation failed with {}", response.status()),
            ));
        }

        info!(index = %self.index_name, dimensions, "index created");
        Ok(())
    }

    async fn delete_schema(&self) -> Result<bool, IngestError> {
        let response = self
            .request(reqwest::Method::DELETE, &self.index_name)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                info!(index = %self.index_name, "index does not exist, nothing to delete");
                Ok(false)
            }
            status if status.is_success() => {
                info!(index = %self.index_name, "index deleted");
                Ok(true)
            }
            status => Err(IngestError::index(
                status.is_server_error(),
                format!("index deletion failed with {status}"),
            )),
        }
    }

    async fn merge_or_upload(
        &self,
        records: &[IndexRecord],
    ) -> Result<Vec<RecordOutcome>, IngestError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .request(reqwest::Method::POST, "_bulk")
            .header("Content-Type", "application/x-ndjson")
            .body(self.bulk_payload(records)?)
            .send()
            .await
            .map_err(|error| IngestError::index(true, error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::index(
                status_is_retryable(u64::from(status.as_u16())),
                format!("bulk request returned {status}"),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| IngestError::index(true, format!("invalid bulk response: {error}")))?;
        Ok(parse_bulk_response(&body, records))
    }
}
