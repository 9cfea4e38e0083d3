// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Utility functions for mediafetch.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static REPEATED_SPACES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r" {2,}").expect("space regex is valid")
});

/// Turn a display title into a file stem.
///
/// Strips `:/()`, folds `" - "` into a single space, collapses repeated
/// spaces and joins words with dots.
///
/// # Examples
///
/// ```
/// use mediafetch::utils::sanitize_title;
///
/// assert_eq!(sanitize_title("Mission: Impossible - Fallout (2018)"), "Mission.Impossible.Fallout.2018");
/// ```
pub fn sanitize_title(title: &str) -> String {
    let stripped: String = title
        .chars()
        .filter(|c| !matches!(c, ':' | '/' | '(' | ')'))
        .collect();
    let folded = stripped.replace(" - ", " ");
    let collapsed = REPEATED_SPACES.replace_all(folded.trim(), " ");
    collapsed.replace(' ', ".")
}

/// Sanitized title with `original`'s extension appended.
pub fn renamed_file_name(title: &str, original: &Path) -> String {
    let stem = sanitize_title(title);
    match original.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem,
    }
}
