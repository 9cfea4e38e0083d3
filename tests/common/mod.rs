// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use mediafetch::commands::ExternalCommands;
use mediafetch::config::Config;
use mediafetch::download::{Collaborators, DownloadManager};
use mediafetch::error::{EngineError, EngineResult};
use mediafetch::remote::{MovieResolver, OAuthApi, RemoteMap};
use mediafetch::scan::status::StatusMap;
use mediafetch::scan::{parse_status_report, StatusReader};

pub const STATUS_REPORT: &str = r#"
<c:1 n:"Inception.mp4" sz:10 B (10) evictable sync-up:done>
<c:2 n:"Alien.mp4" sz:5 B (5) non-evictable uploading>
<c:3 n:".Heat.mkv.icloud" sz:700 MB (700000000) evictable>
"#;

fn as_map(value: Value) -> RemoteMap {
    value.as_object().cloned().unwrap_or_default()
}

/// Remote service fake. Rejects the first `rejections` submissions as full.
pub struct FakeRemote {
    pub listing: Mutex<Value>,
    /// Files of every finished job.
    pub files: Mutex<Value>,
    /// Returned by `fetch_file`.
    pub file_url: Mutex<String>,
    rejections: AtomicUsize,
    next_id: AtomicUsize,
    pub submissions: AtomicUsize,
    pub listings: AtomicUsize,
    pub deletes: Mutex<Vec<String>>,
}

impl FakeRemote {
    pub fn new(rejections: usize) -> Self {
        Self {
            listing: Mutex::new(json!({
                "transfers": [{"id": 100, "name": "Big Movie", "progress": "5", "progress_url": "p"}],
                "folders": []
            })),
            files: Mutex::new(json!([])),
            file_url: Mutex::new(String::new()),
            rejections: AtomicUsize::new(rejections),
            next_id: AtomicUsize::new(500),
            submissions: AtomicUsize::new(0),
            listings: AtomicUsize::new(0),
            deletes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OAuthApi for FakeRemote {
    async fn query(&self, function: &str, params: &BTreeMap<String, String>) -> EngineResult<RemoteMap> {
        match function {
            "add_transfer" => {
                self.submissions.fetch_add(1, Ordering::SeqCst);
                let full = self
                    .rejections
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if full {
                    return Ok(as_map(json!({"result": "queue_full"})));
                }
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                Ok(as_map(json!({"result": "ok", "id": id, "title": "Submitted", "hash": "abc"})))
            }
            "delete" => {
                let arr = params.get("delete_arr").cloned().unwrap_or_default();
                self.deletes.lock().unwrap().push(arr);
                Ok(as_map(json!({"result": "ok"})))
            }
            "fetch_file" => Ok(as_map(json!({"url": self.file_url.lock().unwrap().clone()}))),
            other => Ok(as_map(json!({"function": other}))),
        }
    }

    async fn api_call(
        &self,
        path: &str,
        _method: &str,
        _params: &BTreeMap<String, String>,
    ) -> EngineResult<RemoteMap> {
        if path == "folder" {
            self.listings.fetch_add(1, Ordering::SeqCst);
            return Ok(as_map(self.listing.lock().unwrap().clone()));
        }
        if path.starts_with("folder/") {
            return Ok(as_map(json!({"files": self.files.lock().unwrap().clone()})));
        }
        Ok(as_map(json!({"path": path, "files": []})))
    }
}

pub struct FakeResolver;

#[async_trait]
impl MovieResolver for FakeResolver {
    async fn resolve_imdb(&self, id: &str) -> EngineResult<RemoteMap> {
        if id.is_empty() {
            return Err(EngineError::NotFound("empty id".to_string()));
        }
        Ok(as_map(json!({"title": "The Matrix (1999)"})))
    }
}

/// Records every command instead of running it.
#[derive(Default)]
pub struct FakeCommands {
    pub evicted: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl ExternalCommands for FakeCommands {
    async fn status_dump(&self) -> EngineResult<String> {
        Ok(STATUS_REPORT.to_string())
    }

    async fn evict(&self, path: &Path) -> EngineResult<()> {
        self.evicted.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    async fn stream_link(&self, path: &Path) -> EngineResult<String> {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        Ok(format!("http://stream/{}", name))
    }
}

pub struct FakeStatus;

#[async_trait]
impl StatusReader for FakeStatus {
    async fn read_status(&self) -> EngineResult<StatusMap> {
        Ok(parse_status_report(STATUS_REPORT, ".icloud"))
    }
}

/// A synced root with three media files and one non-media file.
pub struct Fixture {
    pub dir: TempDir,
    pub remote: Arc<FakeRemote>,
    pub commands: Arc<FakeCommands>,
    pub config: Config,
}

impl Fixture {
    pub fn new(rejections: usize) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let root = dir.path().join("synced");
        std::fs::create_dir_all(root.join("Horror")).unwrap();
        std::fs::write(root.join("Inception.mp4"), vec![0u8; 10]).unwrap();
        std::fs::write(root.join("Horror").join("Alien.mp4"), vec![0u8; 5]).unwrap();
        std::fs::write(root.join(".Heat.mkv.icloud"), b"stub").unwrap();
        std::fs::write(root.join("notes.txt"), b"not media").unwrap();

        let mut config = Config::default();
        config.synced_root = root;
        config.snapshot_path = dir.path().join("state").join("downloads.json");
        config.temp_dir = dir.path().join("tmp");
        config.remote.poll_interval_ms = 60_000;
        config.remote.poll_retries = 1;
        config.queue.retry_delay_ms = 5;

        Self {
            dir,
            remote: Arc::new(FakeRemote::new(rejections)),
            commands: Arc::new(FakeCommands::default()),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.synced_root
    }

    pub fn id_of(&self, relative: &str) -> String {
        format!("icloud_{}", self.root().join(relative).display())
    }

    pub fn manager(&self) -> DownloadManager {
        let collaborators = Collaborators {
            api: self.remote.clone(),
            resolver: Arc::new(FakeResolver),
            commands: self.commands.clone(),
            status: Arc::new(FakeStatus),
        };
        DownloadManager::new(self.config.clone(), collaborators).expect("manager")
    }
}

/// Serve `body` at `/<name>` on an ephemeral port; returns its URL.
pub async fn serve_file(name: &str, body: Vec<u8>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = axum::Router::new().route(
        &format!("/{}", name),
        axum::routing::get(move || {
            let body = body.clone();
            async move { body }
        }),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/{}", addr, name)
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
