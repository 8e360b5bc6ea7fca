//! Detection sources
//!
//! The extraction collaborator is read through a paged interface: offset and
//! limit in, a JSON array out, an empty page at the end of data.

use std::path::Path;

use async_trait::async_trait;
use reqwest::Client;

use nko_core::{DatabaseConfig, Detection, DetectionSource, NkoError, Result};

use crate::http::{build_client, classify_status, transport_error, with_service_key};

// ============================================================================
// REST Source
// ============================================================================

/// Reads detections from a PostgREST-style table
pub struct RestDetectionSource {
    client: Client,
    base_url: String,
    table: String,
    api_key: Option<String>,
}

impl RestDetectionSource {
    /// Create a new REST source
    pub fn new(
        base_url: impl Into<String>,
        table: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            table: table.into(),
            api_key,
        }
    }

    /// Create from config
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            base_url: config.url.trim_end_matches('/').to_string(),
            table: config.detections_table.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn page_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }
}

#[async_trait]
impl DetectionSource for RestDetectionSource {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Detection>> {
        let request = self.client.get(self.page_url()).query(&[
            ("select", "*".to_string()),
            ("order", "id.asc".to_string()),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ]);

        let response = with_service_key(request, self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| transport_error("Detection page request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, NkoError::Database));
        }

        response
            .json::<Vec<Detection>>()
            .await
            .map_err(|e| NkoError::Database(format!("Failed to parse detection page: {e}")))
    }

    fn name(&self) -> &str {
        "rest"
    }
}

// ============================================================================
// In-memory / File Source
// ============================================================================

/// Serves detections held in memory, typically loaded from a JSON file
pub struct FileDetectionSource {
    detections: Vec<Detection>,
}

impl FileDetectionSource {
    /// Wrap detections already in memory
    pub fn from_detections(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    /// Load a JSON array of detections
    pub fn from_file(path: &Path) -> Result<Self> {
        let detections: Vec<Detection> = nko_dedup::read_json(path)?;
        tracing::info!(path = %path.display(), count = detections.len(), "Loaded detections");
        Ok(Self { detections })
    }

    /// Number of detections available
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    /// Check if the source is empty
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

#[async_trait]
impl DetectionSource for FileDetectionSource {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Detection>> {
        Ok(self
            .detections
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "file"
    }
}
