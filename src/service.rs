// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed command dispatch.
//!
//! Requests arrive as `{"type": "...", "data": {...}}` and always produce a
//! [`Response`] envelope. Failures, including a panic inside a handler, are
//! reported in `err` rather than tearing down the process.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::download::DownloadManager;
use crate::error::{EngineError, EngineResult};

/// A decoded command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Request {
    GetDownloads {},
    GetCollections {},
    GetAssociatedDownloads {},
    AddToCollection {
        cloud_id: String,
        collection_id: String,
    },
    AssociateDownload {
        cloud_id: String,
        imdb_id: String,
    },
    FetchUri {
        uri: String,
        #[serde(default)]
        imdb_id: String,
        /// Any non-false value enables autoclear.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        autoclear_enabled: Option<Value>,
    },
    StartBackgroundDownload {
        id: String,
        uri: String,
        filename: String,
    },
    EvictLocalItem {
        id: String,
    },
    IntelligentRenameItem {
        id: String,
        title: String,
    },
    #[serde(rename = "getiCloudStreamUrl")]
    GetStreamUrl {
        id: String,
    },
    CancelDownload {
        id: String,
    },
    OauthQuery {
        function: String,
        #[serde(default)]
        data: BTreeMap<String, String>,
    },
    OauthApiCall {
        path: String,
        method: String,
    },
}

impl Request {
    /// Decode a request object. A missing or null `data` is read as `{}`.
    pub fn from_value(value: Value) -> EngineResult<Self> {
        let Value::Object(mut obj) = value else {
            return Err(EngineError::PreconditionFailed("request must be an object".to_string()));
        };
        if matches!(obj.get("data"), None | Some(Value::Null)) {
            obj.insert("data".to_string(), Value::Object(Map::new()));
        }
        serde_json::from_value(Value::Object(obj))
            .map_err(|e| EngineError::PreconditionFailed(format!("cannot handle request: {}", e)))
    }

    /// Wire name of the command.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::GetDownloads {} => "getDownloads",
            Request::GetCollections {} => "getCollections",
            Request::GetAssociatedDownloads {} => "getAssociatedDownloads",
            Request::AddToCollection { .. } => "addToCollection",
            Request::AssociateDownload { .. } => "associateDownload",
            Request::FetchUri { .. } => "fetchUri",
            Request::StartBackgroundDownload { .. } => "startBackgroundDownload",
            Request::EvictLocalItem { .. } => "evictLocalItem",
            Request::IntelligentRenameItem { .. } => "intelligentRenameItem",
            Request::GetStreamUrl { .. } => "getiCloudStreamUrl",
            Request::CancelDownload { .. } => "cancelDownload",
            Request::OauthQuery { .. } => "oauthQuery",
            Request::OauthApiCall { .. } => "oauthApiCall",
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Request::GetDownloads {}
                | Request::GetCollections {}
                | Request::GetAssociatedDownloads {}
                | Request::GetStreamUrl { .. }
        )
    }
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub v: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Response {
    pub fn ok(v: Value) -> Self {
        Self { v: Some(v), err: None }
    }

    pub fn error(err: impl std::fmt::Display) -> Self {
        Self {
            v: None,
            err: Some(err.to_string()),
        }
    }
}

/// `{"result": true, ...extra}` or `{"result": false, "err": ...}`.
fn outcome(result: EngineResult<Map<String, Value>>) -> Value {
    match result {
        Ok(mut extra) => {
            extra.insert("result".to_string(), Value::Bool(true));
            Value::Object(extra)
        }
        Err(e) => json!({"result": false, "err": e.to_string()}),
    }
}

fn single(key: &str, value: impl Into<Value>) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), value.into());
    map
}

/// Dispatches requests to the engine.
#[derive(Clone)]
pub struct Service {
    manager: DownloadManager,
}

impl Service {
    pub fn new(manager: DownloadManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &DownloadManager {
        &self.manager
    }

    /// Decode and handle a raw request object.
    pub async fn handle_value(&self, value: Value) -> Response {
        match Request::from_value(value) {
            Ok(request) => self.handle(request).await,
            Err(e) => Response::error(e),
        }
    }

    /// Handle a request on its own task so a panic becomes an error
    /// response.
    pub async fn handle(&self, request: Request) -> Response {
        let service = self.clone();
        let kind = request.kind();
        match tokio::spawn(async move { service.dispatch(request).await }).await {
            Ok(Ok(v)) => Response::ok(v),
            Ok(Err(e)) => Response::error(e),
            Err(join) => {
                tracing::error!("Handler {} failed: {}", kind, join);
                Response::error(format!("service was panicking: {}", join))
            }
        }
    }

    async fn dispatch(&self, request: Request) -> EngineResult<Value> {
        tracing::debug!(kind = request.kind(), mutating = request.is_mutating(), "Dispatching request");
        let manager = &self.manager;

        let v = match request {
            Request::GetDownloads {} => {
                let downloads = manager.get_downloads().await?;
                json!({ "downloads": downloads })
            }
            Request::GetCollections {} => json!({ "collections": manager.collections() }),
            Request::GetAssociatedDownloads {} => json!({ "downloads": manager.associated_ids() }),
            Request::AddToCollection { cloud_id, collection_id } => outcome(
                manager
                    .add_to_collection(&cloud_id, &collection_id)
                    .await
                    .map(|new_id| single("id", new_id)),
            ),
            Request::AssociateDownload { cloud_id, imdb_id } => {
                let associated = manager.associate(&cloud_id, &imdb_id).await;
                if let Err(e) = &associated {
                    tracing::warn!(cloud_id = %cloud_id, "Association failed: {}", e);
                }
                json!({ "result": associated.is_ok() })
            }
            Request::FetchUri { uri, imdb_id, autoclear_enabled } => {
                let autoclear = !matches!(autoclear_enabled, None | Some(Value::Bool(false)));
                let admission = manager.submit(&uri, &imdb_id, autoclear).await?;
                let mut v = admission.response().clone();
                v.insert("enqueued".to_string(), Value::Bool(admission.is_enqueued()));
                v.insert("not_enough_space".to_string(), Value::Bool(admission.is_enqueued()));
                Value::Object(v)
            }
            Request::StartBackgroundDownload { id, uri, filename } => outcome(
                manager
                    .start_background_download(&id, &uri, &filename)
                    .await
                    .map(|()| Map::new()),
            ),
            Request::EvictLocalItem { id } => {
                outcome(manager.evict(&id).await.map(|()| Map::new()))
            }
            Request::IntelligentRenameItem { id, title } => outcome(
                manager
                    .rename(&id, &title)
                    .await
                    .map(|name| single("new_name", name)),
            ),
            Request::GetStreamUrl { id } => {
                outcome(manager.stream_url(&id).await.map(|url| single("url", url)))
            }
            Request::CancelDownload { id } => outcome(manager.cancel_job(&id).map(|()| Map::new())),
            Request::OauthQuery { function, data } => {
                Value::Object(manager.api().query(&function, &data).await?)
            }
            Request::OauthApiCall { path, method } => {
                Value::Object(manager.api().api_call(&path, &method, &BTreeMap::new()).await?)
            }
        };
        Ok(v)
    }
}
