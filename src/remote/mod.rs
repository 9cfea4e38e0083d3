// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Remote transfer service integration.
//!
//! The engine only consumes two contracts from the outside world:
//!
//! - [`OAuthApi`]: authenticated `query` / `api_call` against the transfer
//!   service. [`oauth::HttpOAuthClient`] is the production implementation.
//! - [`MovieResolver`]: metadata lookup used to rename finished transfers.
//!
//! Everything else in this module is built on top of those two: parsing the
//! job listing, deleting jobs, and watching a submitted job to completion.

pub mod oauth;
pub mod resolver;
pub mod watcher;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};

/// JSON object returned by the remote service.
pub type RemoteMap = Map<String, Value>;

/// Query contract of the transfer service.
#[async_trait]
pub trait OAuthApi: Send + Sync {
    /// Call a named API function. Refreshes the credential first if needed.
    /// A response carrying an `"error"` field is returned as an error.
    async fn query(&self, function: &str, params: &BTreeMap<String, String>) -> EngineResult<RemoteMap>;

    /// Authenticated REST-style call.
    async fn api_call(
        &self,
        path: &str,
        method: &str,
        params: &BTreeMap<String, String>,
    ) -> EngineResult<RemoteMap>;
}

/// Metadata lookup for an association id.
#[async_trait]
pub trait MovieResolver: Send + Sync {
    /// Returns a metadata object with at least a `"title"` string.
    async fn resolve_imdb(&self, id: &str) -> EngineResult<RemoteMap>;
}

/// One job record from the remote listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteJob {
    pub id: String,
    pub name: String,
    /// Present while the remote side is still assembling the job.
    pub progress: Option<f64>,
    pub size: i64,
    /// Set on records that live under the downloading path.
    pub progress_url: Option<String>,
}

impl RemoteJob {
    pub fn is_assembling(&self) -> bool {
        self.progress.is_some()
    }

    /// Parse one listing entry. Entries without an id are skipped.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let id = value_to_id(obj.get("id")?)?;
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let progress = obj.get("progress").map(|p| match p {
            Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        });
        let size = obj.get("size").and_then(value_to_i64).unwrap_or(-1);
        let progress_url = obj
            .get("progress_url")
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(Self {
            id,
            name,
            progress,
            size,
            progress_url,
        })
    }
}

/// Markers the remote uses to say it has no room.
pub const CAPACITY_MARKERS: [&str; 2] = ["not_enough_space", "queue_full"];

/// True when a remote message reports exhausted capacity.
pub fn is_capacity_text(text: &str) -> bool {
    CAPACITY_MARKERS.iter().any(|m| text.contains(m))
}

/// Job ids arrive as numbers or strings; normalize to the integer string.
pub fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => n
            .as_i64()
            .map(|i| i.to_string())
            .or_else(|| n.as_f64().map(|f| format!("{:.0}", f))),
        _ => None,
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extract every job from a folder listing: the downloading path first,
/// then finished folders.
pub fn parse_listing(response: &RemoteMap, downloading_key: &str) -> EngineResult<Vec<RemoteJob>> {
    let mut jobs = Vec::new();
    for key in [downloading_key, "folders"] {
        let list = response.get(key).and_then(Value::as_array).ok_or_else(|| {
            EngineError::TransientRemote(format!("listing is missing the `{}` array", key))
        })?;
        jobs.extend(list.iter().filter_map(RemoteJob::from_value));
    }
    Ok(jobs)
}

/// Fetch the job listing, retrying in place up to `attempts` times.
pub async fn fetch_listing(
    api: &dyn OAuthApi,
    downloading_key: &str,
    attempts: u32,
    delay: Duration,
    cancel: &CancellationToken,
) -> EngineResult<Vec<RemoteJob>> {
    let mut last_error = None;

    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            tracing::debug!("Listing retry {} after {:?}", attempt + 1, delay);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(EngineError::TransientRemote("listing cancelled".to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match api.api_call("folder", "GET", &BTreeMap::new()).await {
            Ok(response) => return parse_listing(&response, downloading_key),
            Err(e) => {
                tracing::warn!("Listing request failed (attempt {}): {}", attempt + 1, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| EngineError::TransientRemote("listing failed".to_string())))
}

/// Delete a remote job. `kind` is `folder` for finished jobs, or the singular
/// of the downloading-path key for jobs still in progress.
pub async fn delete_job(api: &dyn OAuthApi, id: &str, kind: &str) -> EngineResult<()> {
    let delete_arr = serde_json::json!([{ "type": kind, "id": id }]).to_string();
    let mut params = BTreeMap::new();
    params.insert("delete_arr".to_string(), delete_arr);
    api.query("delete", &params).await?;
    tracing::debug!(cloud_id = %id, kind, "Deleted remote job");
    Ok(())
}

/// Deletion kind for a listing record.
pub fn delete_kind(job: &RemoteJob, downloading_key: &str) -> String {
    if job.progress_url.is_some() {
        downloading_key.trim_end_matches('s').to_string()
    } else {
        "folder".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> RemoteMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_listing_reads_both_arrays() {
        let response = as_map(json!({
            "transfers": [
                {"id": 12, "name": "a", "progress": "42.5", "size": 100, "progress_url": "/p"}
            ],
            "folders": [
                {"id": "13", "name": "b", "size": 200.0},
                {"name": "no id"}
            ]
        }));

        let jobs = parse_listing(&response, "transfers").unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "12");
        assert_eq!(jobs[0].progress, Some(42.5));
        assert!(jobs[0].is_assembling());
        assert_eq!(jobs[1].id, "13");
        assert_eq!(jobs[1].progress, None);
        assert_eq!(jobs[1].size, 200);
    }

    #[test]
    fn test_parse_listing_requires_arrays() {
        let response = as_map(json!({"folders": []}));
        assert!(parse_listing(&response, "transfers").is_err());
    }

    #[test]
    fn test_float_ids_normalized() {
        assert_eq!(value_to_id(&json!(4.0)).as_deref(), Some("4"));
        assert_eq!(value_to_id(&json!("")), None);
    }

    #[test]
    fn test_delete_kind() {
        let mut job = RemoteJob {
            id: "1".into(),
            name: "x".into(),
            progress: None,
            size: 0,
            progress_url: None,
        };
        assert_eq!(delete_kind(&job, "transfers"), "folder");
        job.progress_url = Some("/p".into());
        assert_eq!(delete_kind(&job, "transfers"), "transfer");
    }
}
