//! Trajectory persistence over the hosted database REST API

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use nko_core::{CanonicalPhrase, DatabaseConfig, NkoError, Result, TrajectoryStore, World};

use crate::http::{build_client, classify_status, transport_error, with_service_key};

/// Row written per generated world
#[derive(Debug, Serialize)]
struct TrajectoryRow<'a> {
    phrase: &'a str,
    latin_transliteration: Option<&'a str>,
    english_translation: Option<&'a str>,
    variant: &'a str,
    scenario: &'a str,
    nko_sentence: &'a str,
    translation: &'a str,
    created_at: String,
}

/// Upserts generated worlds into a PostgREST-style table
pub struct RestTrajectoryStore {
    client: Client,
    base_url: String,
    table: String,
    api_key: Option<String>,
}

impl RestTrajectoryStore {
    /// Create a new store
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
            table: config.trajectories_table.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn rows<'a>(phrase: &'a CanonicalPhrase, worlds: &'a [World]) -> Vec<TrajectoryRow<'a>> {
        let created_at = Utc::now().to_rfc3339();
        worlds
            .iter()
            .map(|world| TrajectoryRow {
                phrase: &phrase.nko_text,
                latin_transliteration: phrase.latin_transliteration.as_deref(),
                english_translation: phrase.english_translation.as_deref(),
                variant: &world.variant,
                scenario: &world.scenario,
                nko_sentence: &world.nko_sentence,
                translation: &world.translation,
                created_at: created_at.clone(),
            })
            .collect()
    }
}

/// Only 200 and 201 count as a successful write
pub fn is_write_success(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::CREATED
}

#[async_trait]
impl TrajectoryStore for RestTrajectoryStore {
    async fn save_worlds(&self, phrase: &CanonicalPhrase, worlds: &[World]) -> Result<()> {
        let rows = Self::rows(phrase, worlds);
        let request = self
            .client
            .post(format!("{}/rest/v1/{}", self.base_url, self.table))
            .header("Content-Type", "application/json")
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&rows);

        let response = with_service_key(request, self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| transport_error("Trajectory insert failed", e))?;

        let status = response.status();
        if !is_write_success(status) {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, NkoError::Database));
        }

        tracing::debug!(phrase = %phrase.nko_text, rows = rows.len(), "Stored worlds");
        Ok(())
    }
}
