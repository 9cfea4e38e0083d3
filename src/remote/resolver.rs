// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metadata lookup over HTTP.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{MovieResolver, RemoteMap};
use crate::error::{EngineError, EngineResult};

const RESOLVE_TIMEOUT_SECS: u64 = 15;

/// [`MovieResolver`] that fetches `metadata_url` with `{id}` substituted.
///
/// Without a URL every lookup is `NotFound`, which makes renames after a
/// transfer a logged no-op.
pub struct HttpMovieResolver {
    url_template: Option<String>,
    client: reqwest::Client,
}

impl HttpMovieResolver {
    pub fn new(url_template: Option<String>) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(RESOLVE_TIMEOUT_SECS))
            .build()
            .map_err(|e| EngineError::Unrecoverable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { url_template, client })
    }

    fn url_for(&self, id: &str) -> Option<String> {
        self.url_template.as_ref().map(|t| t.replace("{id}", id))
    }
}

#[async_trait]
impl MovieResolver for HttpMovieResolver {
    async fn resolve_imdb(&self, id: &str) -> EngineResult<RemoteMap> {
        let url = self
            .url_for(id)
            .ok_or_else(|| EngineError::NotFound(format!("no metadata source for {}", id)))?;

        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound(id.to_string()));
        }
        let value: Value = response.error_for_status()?.json().await?;

        match value {
            Value::Object(map) if map.get("title").and_then(Value::as_str).is_some() => Ok(map),
            _ => Err(EngineError::NotFound(format!("metadata for {} has no title", id))),
        }
    }
}
