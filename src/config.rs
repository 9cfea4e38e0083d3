// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Engine configuration.
//!
//! Loaded from `~/.mediafetch/config.json` unless a path is given. Every field
//! has a default so a partial file (or none at all) is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the synced (cloud-backed) storage directory.
    #[serde(default = "default_synced_root")]
    pub synced_root: PathBuf,
    /// Where the pool snapshot is written.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    /// Scratch directory for in-flight transfers.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// File name suffix marking a not-yet-materialized file.
    #[serde(default = "default_placeholder_suffix")]
    pub placeholder_suffix: String,
    /// Extensions (without dot) considered media.
    #[serde(default = "default_media_extensions")]
    pub media_extensions: Vec<String>,
    /// HTTP listen address for `serve`.
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    /// Metadata lookup URL template; `{id}` is replaced by the association id.
    #[serde(default)]
    pub metadata_url: Option<String>,
}

/// Credentials and endpoints of the remote transfer service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OAuthConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_grant_type")]
    pub grant_type: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub access_token_url: String,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub rest_api_url: String,
}

/// Keys and function names of the remote job API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Listing key holding jobs still being assembled remotely.
    #[serde(default = "default_downloading_path_key")]
    pub downloading_path_key: String,
    /// Query function that submits a new job.
    #[serde(default = "default_download_uri_function")]
    pub download_uri_function: String,
    /// Parameter name carrying the submitted URI.
    #[serde(default = "default_download_uri_param")]
    pub download_uri_param: String,
    /// Response key holding the new job id.
    #[serde(default = "default_cloud_item_id_key")]
    pub cloud_item_id_key: String,
    /// Response key holding the new job hash.
    #[serde(default = "default_cloud_hash_key")]
    pub cloud_hash_key: String,
    /// File listing flag marking playable files.
    #[serde(default = "default_playable_key")]
    pub playable_key: String,
    /// Query function resolving a file id to a direct URL.
    #[serde(default = "default_fetch_file_function")]
    pub fetch_file_function: String,
    #[serde(default = "default_fetch_file_param")]
    pub fetch_file_param: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Attempts per listing poll before the failure is surfaced.
    #[serde(default = "default_poll_retries")]
    pub poll_retries: u32,
}

/// Admission control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Consecutive capacity failures before clearing the remote.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
}

/// Transfer worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Connect timeout; the body stream itself is unbounded.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// External commands, as argv vectors. The target path is appended last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_status_dump")]
    pub status_dump: Vec<String>,
    #[serde(default = "default_evict")]
    pub evict: Vec<String>,
    #[serde(default = "default_stream_link")]
    pub stream_link: Vec<String>,
}

fn default_synced_root() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join("Library").join("Mobile Documents").join("com~apple~CloudDocs"))
        .unwrap_or_else(|| PathBuf::from("synced"))
}

fn default_snapshot_path() -> PathBuf {
    config_dir().join("downloads.json")
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("mediafetch")
}

fn default_placeholder_suffix() -> String {
    ".icloud".to_string()
}

fn default_media_extensions() -> Vec<String> {
    ["mp4", "mkv", "m4v", "avi", "mov"].iter().map(|s| s.to_string()).collect()
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_grant_type() -> String {
    "password".to_string()
}

fn default_downloading_path_key() -> String {
    "transfers".to_string()
}

fn default_download_uri_function() -> String {
    "add_transfer".to_string()
}

fn default_download_uri_param() -> String {
    "url".to_string()
}

fn default_cloud_item_id_key() -> String {
    "id".to_string()
}

fn default_cloud_hash_key() -> String {
    "hash".to_string()
}

fn default_playable_key() -> String {
    "play_video".to_string()
}

fn default_fetch_file_function() -> String {
    "fetch_file".to_string()
}

fn default_fetch_file_param() -> String {
    "folder_file_id".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2500
}

fn default_poll_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_escalation_threshold() -> u32 {
    4
}

fn default_sample_interval_ms() -> u64 {
    200
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_status_dump() -> Vec<String> {
    vec!["brctl".to_string(), "status".to_string()]
}

fn default_evict() -> Vec<String> {
    vec!["brctl".to_string(), "evict".to_string()]
}

fn default_stream_link() -> Vec<String> {
    vec!["stream_link".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            synced_root: default_synced_root(),
            snapshot_path: default_snapshot_path(),
            temp_dir: default_temp_dir(),
            placeholder_suffix: default_placeholder_suffix(),
            media_extensions: default_media_extensions(),
            listen: default_listen(),
            oauth: OAuthConfig::default(),
            remote: RemoteConfig::default(),
            queue: QueueConfig::default(),
            transfer: TransferConfig::default(),
            commands: CommandsConfig::default(),
            metadata_url: None,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            downloading_path_key: default_downloading_path_key(),
            download_uri_function: default_download_uri_function(),
            download_uri_param: default_download_uri_param(),
            cloud_item_id_key: default_cloud_item_id_key(),
            cloud_hash_key: default_cloud_hash_key(),
            playable_key: default_playable_key(),
            fetch_file_function: default_fetch_file_function(),
            fetch_file_param: default_fetch_file_param(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_retries: default_poll_retries(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            status_dump: default_status_dump(),
            evict: default_evict(),
            stream_link: default_stream_link(),
        }
    }
}

impl RemoteConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl TransferConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// `~/.mediafetch`, or a relative fallback when there is no home directory.
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".mediafetch"))
        .unwrap_or_else(|| PathBuf::from(".mediafetch"))
}

impl Config {
    /// Load from `path`, or from the default location. A missing default file
    /// yields the default config; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (config_dir().join("config.json"), false),
        };

        if !config_path.exists() {
            if explicit {
                anyhow::bail!("Config file not found: {:?}", config_path);
            }
            tracing::debug!("No config at {:?}, using defaults", config_path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

        if config.oauth.api_url.is_empty() {
            tracing::warn!("oauth.api_url is not set; remote operations will fail");
        }

        Ok(config)
    }
}
