//! Service name shortcut resolution.
//!
//! Users refer to services by directory name or by a shortcut such as `db`,
//! which expands to a glob evaluated inside the services (or log) root.
//! Results are deduplicated and sorted so generated `sv` invocations are
//! deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobBuilder};
use thiserror::Error;

use crate::layout::Layout;

const BUILTIN_SHORTCUTS: &[(&str, &str)] = &[
    ("rails", "rails-*"),
    ("praefect", "praefect*"),
    ("gitaly", "{gitaly,praefect*}"),
    ("db", "{redis,redis-cluster,postgresql,postgresql-geo,clickhouse}"),
    ("workhorse", "gitlab-workhorse"),
];

#[derive(Debug, Error)]
pub enum ShortcutError {
    #[error("shortcut '{alias}' maps to '{pattern}', which must not contain a path separator")]
    PathSeparator { alias: String, pattern: String },
    #[error("shortcut '{alias}' has an invalid glob '{pattern}': {source}")]
    InvalidGlob {
        alias: String,
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("failed to list {path:?}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Immutable alias to glob-pattern map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortcutTable {
    entries: BTreeMap<String, String>,
}

impl Default for ShortcutTable {
    fn default() -> Self {
        Self::new(
            BUILTIN_SHORTCUTS
                .iter()
                .map(|(alias, pattern)| (alias.to_string(), pattern.to_string())),
        )
    }
}

impl ShortcutTable {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Built-in table with `overrides` layered on top.
    pub fn with_overrides(overrides: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut table = Self::default();
        table.entries.extend(overrides);
        table
    }

    pub fn get(&self, alias: &str) -> Option<&str> {
        self.entries.get(alias).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(alias, pattern)| (alias.as_str(), pattern.as_str()))
    }
}

/// Expands name tokens into service or log directories.
pub struct Resolver<'a> {
    layout: &'a Layout,
    shortcuts: &'a ShortcutTable,
}

impl<'a> Resolver<'a> {
    pub fn new(layout: &'a Layout, shortcuts: &'a ShortcutTable) -> Self {
        Self { layout, shortcuts }
    }

    /// Resolves `names` to directories under the services root.
    pub fn expand(&self, names: &[String]) -> Result<Vec<PathBuf>, ShortcutError> {
        expand_in(&self.layout.services_dir(), names, self.shortcuts)
    }

    /// Resolves `names` to directories under the log root.
    pub fn expand_logs(&self, names: &[String]) -> Result<Vec<PathBuf>, ShortcutError> {
        expand_in(&self.layout.log_dir(), names, self.shortcuts)
    }
}

fn expand_in(
    root: &Path,
    names: &[String],
    shortcuts: &ShortcutTable,
) -> Result<Vec<PathBuf>, ShortcutError> {
    // Reject malformed shortcuts before touching the filesystem.
    let mut matchers = BTreeMap::new();
    for name in names {
        if let Some(pattern) = shortcuts.get(name) {
            matchers.insert(name.as_str(), compile(name, pattern)?);
        }
    }

    if names.is_empty() {
        return Ok(list_dirs(root)?.into_iter().collect());
    }

    let mut resolved = BTreeSet::new();
    for name in names {
        if let Some(matcher) = matchers.get(name.as_str()) {
            for dir in list_dirs(root)? {
                let file_name = dir.file_name().unwrap_or_default();
                if matcher.is_match(file_name) {
                    resolved.insert(dir);
                }
            }
        } else {
            resolved.insert(root.join(name));
        }
    }
    Ok(resolved.into_iter().collect())
}

fn compile(alias: &str, pattern: &str) -> Result<globset::GlobMatcher, ShortcutError> {
    if pattern.contains(std::path::MAIN_SEPARATOR) || pattern.contains('/') {
        return Err(ShortcutError::PathSeparator {
            alias: alias.to_string(),
            pattern: pattern.to_string(),
        });
    }
    let glob: Glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|source| ShortcutError::InvalidGlob {
            alias: alias.to_string(),
            pattern: pattern.to_string(),
            source,
        })?;
    Ok(glob.compile_matcher())
}

// Directories (or links to directories) directly under `root`. A missing root
// has no services yet.
fn list_dirs(root: &Path) -> Result<BTreeSet<PathBuf>, ShortcutError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(source) => {
            return Err(ShortcutError::ReadDir {
                path: root.to_path_buf(),
                source,
            })
        }
    };
    let mut dirs = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|source| ShortcutError::ReadDir {
            path: root.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            dirs.insert(path);
        }
    }
    Ok(dirs)
}
