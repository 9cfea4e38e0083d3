// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pool item types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Progress value marking a finished client transfer.
pub const PROGRESS_DONE: f64 = 101.0;

/// Where a pool item came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Found by scanning synced storage; replaced wholesale on every scan.
    Disk,
    /// Submitted to the remote transfer service; updated by polling.
    #[serde(rename = "oauth")]
    OAuth,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Disk => write!(f, "disk"),
            SourceKind::OAuth => write!(f, "oauth"),
        }
    }
}

/// One entity the pool tracks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadItem {
    pub source: SourceKind,
    /// Unique key; remote job id for oauth items, path-derived for disk items.
    #[serde(rename = "id")]
    pub cloud_id: String,
    /// External association (IMDb id). Empty when unassociated.
    #[serde(rename = "imdb_id")]
    pub association_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    /// Bytes, or -1 when unknown.
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_hash: Option<String>,

    pub progress: f64,
    #[serde(rename = "progressVelocity")]
    pub progress_velocity: f64,
    #[serde(rename = "avgProgressVelocity")]
    pub avg_progress_velocity: f64,
    #[serde(rename = "velocitySampleCount")]
    pub velocity_sample_count: u64,
    /// Unix seconds, 0 when never started.
    pub time_started: i64,

    #[serde(rename = "isDownloadingCloud")]
    pub is_downloading_cloud: bool,
    #[serde(rename = "hasDownloadedCloud")]
    pub has_downloaded_cloud: bool,
    #[serde(rename = "isDownloadingClient")]
    pub is_downloading_client: bool,
    #[serde(rename = "hasDownloadedClient")]
    pub has_downloaded_client: bool,
    #[serde(rename = "isUploadingClient")]
    pub is_uploading_client: bool,
    #[serde(rename = "hasUploadedClient")]
    pub has_uploaded_client: bool,
    #[serde(rename = "isLocalToClient")]
    pub is_local_to_client: bool,
}

impl DownloadItem {
    fn blank(source: SourceKind, cloud_id: String, name: String) -> Self {
        Self {
            source,
            cloud_id,
            association_id: String::new(),
            name,
            local_path: None,
            size: -1,
            collection: None,
            remote_hash: None,
            progress: 0.0,
            progress_velocity: 0.0,
            avg_progress_velocity: 0.0,
            velocity_sample_count: 0,
            time_started: 0,
            is_downloading_cloud: false,
            has_downloaded_cloud: false,
            is_downloading_client: false,
            has_downloaded_client: false,
            is_uploading_client: false,
            has_uploaded_client: false,
            is_local_to_client: false,
        }
    }

    /// A freshly submitted remote job.
    pub fn oauth_started(job: &SubmittedJob, association_id: impl Into<String>) -> Self {
        let mut item = Self::blank(SourceKind::OAuth, job.cloud_id.clone(), job.name.clone());
        item.association_id = association_id.into();
        item.remote_hash = job.hash.clone();
        item.progress = -1.0;
        item.time_started = Utc::now().timestamp();
        item.is_downloading_cloud = true;
        item
    }

    /// An oauth job first seen in a listing poll.
    pub fn oauth_discovered(cloud_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::blank(SourceKind::OAuth, cloud_id.into(), name.into())
    }

    /// An oauth job restored from the snapshot: the remote finished it, the
    /// client has not fetched it.
    pub fn oauth_restored(record: &PersistedRecord) -> Self {
        let mut item = Self::blank(SourceKind::OAuth, record.id.clone(), record.filename.clone());
        item.association_id = record.imdb_id.clone();
        item.size = record.size;
        item.has_downloaded_cloud = true;
        item
    }

    /// A disk entry. Classification flags are filled in by the scanner.
    pub fn disk(cloud_id: impl Into<String>, name: impl Into<String>, path: PathBuf) -> Self {
        let mut item = Self::blank(SourceKind::Disk, cloud_id.into(), name.into());
        item.local_path = Some(path);
        item.has_downloaded_client = true;
        item
    }

    /// Entry standing in for `self` after its file moved to `new_path`.
    ///
    /// Keeps the association and lifecycle flags; the next scan replaces it
    /// with the real classification and inherits the association by id.
    pub fn filler(&self, cloud_id: impl Into<String>, name: impl Into<String>, new_path: PathBuf) -> Self {
        let mut item = self.clone();
        item.source = SourceKind::Disk;
        item.cloud_id = cloud_id.into();
        item.name = name.into();
        item.local_path = Some(new_path);
        item
    }

    pub fn is_associated(&self) -> bool {
        !self.association_id.is_empty()
    }

    pub fn is_oauth(&self) -> bool {
        self.source == SourceKind::OAuth
    }

    pub fn is_disk(&self) -> bool {
        self.source == SourceKind::Disk
    }

    /// Durable projection of this item.
    pub fn to_record(&self) -> PersistedRecord {
        PersistedRecord {
            imdb_id: self.association_id.clone(),
            filename: self.name.clone(),
            source: self.source,
            size: self.size,
            id: self.cloud_id.clone(),
        }
    }
}

/// One snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedRecord {
    #[serde(default)]
    pub imdb_id: String,
    #[serde(default)]
    pub filename: String,
    pub source: SourceKind,
    #[serde(default = "unknown_size")]
    pub size: i64,
    pub id: String,
}

fn unknown_size() -> i64 {
    -1
}

/// A job accepted by the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedJob {
    pub cloud_id: String,
    pub name: String,
    pub hash: Option<String>,
}

/// A submission waiting for remote capacity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingSubmission {
    pub association_id: String,
    pub uri: String,
    pub queued_at: DateTime<Utc>,
}

impl PendingSubmission {
    pub fn new(association_id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            association_id: association_id.into(),
            uri: uri.into(),
            queued_at: Utc::now(),
        }
    }
}

/// Progress update produced by the transfer monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub bytes: u64,
    /// Percent of the expected total; 0 when the total is unknown.
    pub progress: f64,
    /// Bytes per second since the previous sample; `None` on the first one.
    pub velocity: Option<f64>,
    pub avg_velocity: f64,
    pub sample_count: u64,
}
