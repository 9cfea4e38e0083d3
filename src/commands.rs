// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! External commands the engine shells out to.
//!
//! The sync client's status dump, its eviction command and the stream link
//! helper are all configured as argv vectors; the target path is appended as
//! the last argument.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

use crate::config::CommandsConfig;
use crate::error::{EngineError, EngineResult};

/// Commands the engine needs from the host.
#[async_trait]
pub trait ExternalCommands: Send + Sync {
    /// Raw status report of the sync client.
    async fn status_dump(&self) -> EngineResult<String>;

    /// Drop the local copy of a synced file, keeping it in the cloud.
    async fn evict(&self, path: &Path) -> EngineResult<()>;

    /// A streamable URL for a synced file.
    async fn stream_link(&self, path: &Path) -> EngineResult<String>;
}

/// [`ExternalCommands`] backed by real processes.
#[derive(Debug, Clone)]
pub struct ProcessCommands {
    config: CommandsConfig,
}

impl ProcessCommands {
    pub fn new(config: CommandsConfig) -> Self {
        Self { config }
    }

    async fn run(argv: &[String], path: Option<&Path>) -> EngineResult<String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EngineError::Unrecoverable("empty command line".to_string()))?;

        let mut command = Command::new(program);
        command.args(args);
        if let Some(path) = path {
            command.arg(path);
        }

        tracing::debug!("Running {} {:?}", program, args);
        let output = command
            .output()
            .await
            .map_err(|e| EngineError::Unrecoverable(format!("failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Unrecoverable(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ExternalCommands for ProcessCommands {
    async fn status_dump(&self) -> EngineResult<String> {
        Self::run(&self.config.status_dump, None).await
    }

    async fn evict(&self, path: &Path) -> EngineResult<()> {
        Self::run(&self.config.evict, Some(path)).await?;
        tracing::info!("Evicted {:?}", path);
        Ok(())
    }

    async fn stream_link(&self, path: &Path) -> EngineResult<String> {
        let out = Self::run(&self.config.stream_link, Some(path)).await?;
        Ok(out.trim().to_string())
    }
}
