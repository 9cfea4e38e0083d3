// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sync client status: which files are evictable and how big they really are.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::commands::ExternalCommands;
use crate::error::EngineResult;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"n:"([^"]+)""#).expect("name regex is valid")
});

static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sz:[^(\n]*\((\d+)\)").expect("size regex is valid")
});

/// What the sync client knows about one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStatus {
    pub evictable: bool,
    /// True size in bytes, when reported.
    pub size: Option<i64>,
}

/// File name (placeholder decoration removed) to status.
pub type StatusMap = HashMap<String, FileStatus>;

/// Source of [`StatusMap`]s.
#[async_trait]
pub trait StatusReader: Send + Sync {
    async fn read_status(&self) -> EngineResult<StatusMap>;
}

/// Reads status by running the sync client's status dump.
pub struct CommandStatusReader {
    commands: Arc<dyn ExternalCommands>,
    placeholder_suffix: String,
}

impl CommandStatusReader {
    pub fn new(commands: Arc<dyn ExternalCommands>, placeholder_suffix: impl Into<String>) -> Self {
        Self {
            commands,
            placeholder_suffix: placeholder_suffix.into(),
        }
    }
}

#[async_trait]
impl StatusReader for CommandStatusReader {
    async fn read_status(&self) -> EngineResult<StatusMap> {
        let report = self.commands.status_dump().await?;
        let map = parse_status_report(&report, &self.placeholder_suffix);
        tracing::debug!(entries = map.len(), "Parsed sync status report");
        Ok(map)
    }
}

/// Strip the placeholder decoration (`.Name.ext<suffix>` to `Name.ext`).
pub fn materialized_name<'a>(name: &'a str, placeholder_suffix: &str) -> (&'a str, bool) {
    match name.strip_suffix(placeholder_suffix) {
        Some(stem) if !placeholder_suffix.is_empty() => {
            (stem.strip_prefix('.').unwrap_or(stem), true)
        }
        _ => (name, false),
    }
}

/// On-disk name of the placeholder standing in for `name`.
pub fn placeholder_name(name: &str, placeholder_suffix: &str) -> String {
    format!(".{}{}", name, placeholder_suffix)
}

/// Parse a status dump, one item per line.
pub fn parse_status_report(report: &str, placeholder_suffix: &str) -> StatusMap {
    let mut map = StatusMap::new();

    for line in report.lines() {
        let Some(name) = NAME_RE.captures(line).and_then(|c| c.get(1)) else {
            continue;
        };
        let (name, _) = materialized_name(name.as_str(), placeholder_suffix);

        let size = SIZE_RE
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<i64>().ok());

        let evictable = line
            .split(|c: char| c.is_whitespace() || matches!(c, ',' | '{' | '}' | '[' | ']' | ';'))
            .any(|token| token == "evictable");

        map.insert(name.to_string(), FileStatus { evictable, size });
    }

    map
}
