//! Elasticsearch search-index job backend.
//!
//! One document per job keyed by id, addressed through the ES REST API.
//! Hosts are tried in order; the first that answers serves the request.
//! Bootstrap creates the index and tolerates one that already exists.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::backend::{JobBackend, StoreError};

const DEFAULT_HOST: &str = "http://localhost:9200";

/// Search result page size. One index holds at most a few thousand jobs, so
/// a single page covers a full load.
const LOAD_ALL_SIZE: u32 = 10_000;

pub struct ElasticsearchBackend {
    client: reqwest::Client,
    hosts: Vec<String>,
    index: String,
}

impl ElasticsearchBackend {
    pub fn new(index: &str, hosts: &[String]) -> Self {
        let hosts = if hosts.is_empty() {
            vec![DEFAULT_HOST.to_string()]
        } else {
            hosts
                .iter()
                .map(|h| h.trim_end_matches('/').to_string())
                .collect()
        };
        info!(
            "job store: elasticsearch backend index {} ({})",
            index,
            hosts.join(", ")
        );
        Self {
            client: reqwest::Client::new(),
            hosts,
            index: index.to_string(),
        }
    }

    /// Issue a request against the first reachable host.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response, StoreError> {
        let mut last_error = String::new();
        for host in &self.hosts {
            let url = format!("{}{}", host, path);
            let mut request = self.client.request(method.clone(), &url);
            if let Some(ref payload) = body {
                request = request.json(payload);
            }
            match request.send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    debug!(host = %host, error = %e, "elasticsearch host unreachable");
                    last_error = e.to_string();
                }
            }
        }
        Err(StoreError::Unavailable(format!(
            "no elasticsearch host reachable: {last_error}"
        )))
    }

    async fn json_body(resp: reqwest::Response) -> Result<Value, StoreError> {
        resp.json()
            .await
            .map_err(|e| StoreError::Other(format!("elasticsearch response: {e}")))
    }
}

#[async_trait]
impl JobBackend for ElasticsearchBackend {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        let path = format!("/{}", self.index);
        let resp = self.request(Method::PUT, &path, Some(json!({}))).await?;
        if resp.status().is_success() {
            info!(index = %self.index, "created job store index");
            return Ok(());
        }
        let status = resp.status();
        let body = Self::json_body(resp).await.unwrap_or(Value::Null);
        let already_exists = body
            .pointer("/error/type")
            .and_then(Value::as_str)
            .map_or(false, |t| t == "resource_already_exists_exception");
        if already_exists {
            debug!(index = %self.index, "job store index already exists");
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "elasticsearch create index failed ({status}): {body}"
            )))
        }
    }

    async fn load_all(&self) -> Result<Vec<(String, String)>, StoreError> {
        let path = format!("/{}/_search?size={}", self.index, LOAD_ALL_SIZE);
        let resp = self
            .request(
                Method::POST,
                &path,
                Some(json!({"query": {"match_all": {}}})),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(StoreError::Unavailable(format!(
                "elasticsearch search failed: {}",
                resp.status()
            )));
        }
        let body = Self::json_body(resp).await?;
        let hits = body
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut records = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(id) = hit.get("_id").and_then(Value::as_str) else {
                continue;
            };
            let Some(source) = hit.get("_source") else {
                continue;
            };
            records.push((id.to_string(), source.to_string()));
        }
        Ok(records)
    }

    async fn get(&self, id: &str) -> Result<Option<String>, StoreError> {
        let path = format!("/{}/_doc/{}", self.index, id);
        let resp = self.request(Method::GET, &path, None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(StoreError::Unavailable(format!(
                "elasticsearch get failed: {}",
                resp.status()
            )));
        }
        let body = Self::json_body(resp).await?;
        Ok(body.get("_source").map(Value::to_string))
    }

    async fn put(&self, id: &str, body: &str) -> Result<(), StoreError> {
        let document: Value = serde_json::from_str(body)
            .map_err(|e| StoreError::Other(format!("job body is not JSON: {e}")))?;
        let path = format!("/{}/_doc/{}?refresh=true", self.index, id);
        let resp = self.request(Method::PUT, &path, Some(document)).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "elasticsearch put failed: {}",
                resp.status()
            )))
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = format!("/{}/_doc/{}?refresh=true", self.index, id);
        let resp = self.request(Method::DELETE, &path, None).await?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "elasticsearch delete failed: {}",
                resp.status()
            )))
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
