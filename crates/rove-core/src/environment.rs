//! Named environments and `$RoveEnv` substitution.
//!
//! Script paths, arguments and working directories may contain the
//! [`ENV_MARKER`] token. At run time it is replaced by the value of the
//! currently selected environment; at configuration time every environment
//! is tried so a path only has to exist under one of them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Token replaced by the selected environment's value.
pub const ENV_MARKER: &str = "$RoveEnv";

/// One `name → value` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentEntry {
    pub name: String,
    pub value: String,
}

impl EnvironmentEntry {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered `name → value` table. The first entry for a name wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentMapping {
    entries: Vec<EnvironmentEntry>,
}

impl EnvironmentMapping {
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = EnvironmentEntry>) -> Self {
        let mut mapping = Self::default();
        mapping.extend(entries);
        mapping
    }

    /// Append entries, skipping names that are already mapped.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = EnvironmentEntry>) {
        for entry in entries {
            if self.value_of(&entry.name).is_none() {
                self.entries.push(entry);
            }
        }
    }

    #[must_use]
    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|e| e.name.as_str())
    }

    #[must_use]
    pub fn entries(&self) -> &[EnvironmentEntry] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.value_of(name).is_some()
    }

    /// Substitute the marker with the value of `selection`.
    ///
    /// Text without the marker, and any selection that is not a known
    /// environment, come back unchanged.
    #[must_use]
    pub fn resolve_for_selection(&self, text: &str, selection: Option<&str>) -> String {
        if text.is_empty() {
            return String::new();
        }
        match selection.and_then(|name| self.value_of(name)) {
            Some(value) => text.replace(ENV_MARKER, value),
            None => text.to_string(),
        }
    }

    /// One substitution per known environment, or `text` alone when there
    /// is nothing to substitute.
    #[must_use]
    pub fn all_candidates(&self, text: &str) -> Vec<String> {
        if self.entries.is_empty() || !text.contains(ENV_MARKER) {
            return vec![text.to_string()];
        }
        self.entries
            .iter()
            .map(|e| text.replace(ENV_MARKER, &e.value))
            .collect()
    }
}

/// Directory scan rule: every immediate subdirectory of `base_dir` whose
/// `.git/config` matches `repository` becomes an environment named after the
/// directory, valued with its full path.
#[derive(Debug, Clone)]
pub struct EnvironmentScan {
    pub base_dir: PathBuf,
    pub repository: Regex,
}

impl EnvironmentScan {
    /// Entries ordered by directory name.
    pub fn scan(&self) -> Result<Vec<EnvironmentEntry>, ConfigError> {
        if !self.base_dir.is_dir() {
            return Err(ConfigError::ScanBaseMissing(self.base_dir.clone()));
        }
        let read_dir = fs::read_dir(&self.base_dir).map_err(|e| {
            ConfigError::ReadFailed(self.base_dir.display().to_string(), e.to_string())
        })?;

        let mut found = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if self.is_match(&path) {
                found.push(EnvironmentEntry::new(name, path.display().to_string()));
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!(
            base_dir = %self.base_dir.display(),
            count = found.len(),
            "scanned environments"
        );
        Ok(found)
    }

    fn is_match(&self, dir: &Path) -> bool {
        fs::read_to_string(dir.join(".git").join("config"))
            .is_ok_and(|remote| self.repository.is_match(&remote))
    }
}

/// The mapping plus the operator's current selection.
///
/// Only known, non-empty names can be selected. Without an explicit
/// default the first environment is selected.
#[derive(Debug)]
pub struct CurrentEnvironment {
    mapping: EnvironmentMapping,
    selection: RwLock<Option<String>>,
}

impl CurrentEnvironment {
    #[must_use]
    pub fn new(mapping: EnvironmentMapping, default: Option<&str>) -> Self {
        let selection = default
            .filter(|name| !name.is_empty() && mapping.contains(name))
            .or_else(|| mapping.names().next())
            .map(str::to_string);
        Self {
            mapping,
            selection: RwLock::new(selection),
        }
    }

    #[must_use]
    pub fn mapping(&self) -> &EnvironmentMapping {
        &self.mapping
    }

    #[must_use]
    pub fn selection(&self) -> Option<String> {
        self.selection
            .read()
            .expect("environment lock poisoned")
            .clone()
    }

    /// Returns false, leaving the selection untouched, for unknown names.
    pub fn select(&self, name: &str) -> bool {
        if name.is_empty() || !self.mapping.contains(name) {
            return false;
        }
        *self.selection.write().expect("environment lock poisoned") = Some(name.to_string());
        true
    }

    #[must_use]
    pub fn resolve(&self, text: &str) -> String {
        let selection = self.selection();
        self.mapping.resolve_for_selection(text, selection.as_deref())
    }
}
