// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! mediafetch - Download orchestration library
//!
//! Moves media from a remote transfer service into synced local storage
//! and keeps one consistent view of every item along the way.
//!
//! **Submit** -> **Remote assembly** -> **Client transfer** -> **Synced storage**
//!
//! # Core Modules
//!
//! - [`download`] - The pool, its snapshot and the engine that drives both
//! - [`scan`] - Synced storage scan and sync status parsing
//! - [`remote`] - OAuth client, job listing, watcher and metadata lookup
//! - [`transfer`] - Streaming client download with progress sampling
//! - [`queue`] - Deferred submissions and capacity escalation
//! - [`commands`] - External tools for eviction and stream links
//! - [`service`] - Typed command dispatch
//! - [`server`] - HTTP endpoint for the command service
//! - [`error`] - Engine error kinds

pub mod commands;
pub mod config;
pub mod download;
pub mod error;
pub mod locks;
pub mod queue;
pub mod remote;
pub mod scan;
pub mod server;
pub mod service;
pub mod transfer;
pub mod utils;

pub use config::Config;
pub use download::{DownloadItem, DownloadManager, DownloadPool, SourceKind};
pub use error::{EngineError, EngineResult};
pub use queue::Admission;
pub use service::{Request, Response, Service};
