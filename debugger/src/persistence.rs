//! Saving and restoring breakpoints between sessions.
//!
//! Each script gets its own store file, a JSON map from breakpoint id to
//! record. A missing file loads as an empty table; scripts that were never
//! debugged before should not produce errors.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::proxy::MirroredBreakpoint;

fn default_scope() -> String {
    "<module>".to_owned()
}

fn default_encoding() -> String {
    "utf-8".to_owned()
}

/// One persisted breakpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointRecord {
    pub filename: String,
    /// Name of the enclosing definition, `<module>` at top level.
    #[serde(default = "default_scope")]
    pub scope: String,
    pub line: u32,
    pub enabled: bool,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

impl From<&MirroredBreakpoint> for BreakpointRecord {
    fn from(bp: &MirroredBreakpoint) -> Self {
        Self {
            filename: bp.filename.clone(),
            scope: default_scope(),
            line: bp.line,
            enabled: bp.enabled,
            condition: bp.condition.clone(),
            encoding: default_encoding(),
        }
    }
}

/// Directory of per-script breakpoint files.
#[derive(Debug, Clone)]
pub struct BreakpointStore {
    base: PathBuf,
}

impl BreakpointStore {
    /// The store under the platform data directory, or `None` when the
    /// platform has no such notion.
    pub fn open_default() -> Option<Self> {
        let base = dirs::data_dir()?
            .join("script-debugger")
            .join("breakpoints");
        Some(Self { base })
    }

    pub fn at(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// The store file for a script, derived from its absolute path so two
    /// scripts with the same stem in different directories stay apart.
    pub fn path_for(&self, script: &Path) -> PathBuf {
        self.base.join(format!("{}.json", sanitize(script)))
    }

    pub fn load(&self, script: &Path) -> Result<BTreeMap<u64, BreakpointRecord>, SessionError> {
        let path = self.path_for(script);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no saved breakpoints");
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(SessionError::Io(e)),
        };
        serde_json::from_str(&raw).map_err(|source| SessionError::Persistence { path, source })
    }

    pub fn save(
        &self,
        script: &Path,
        records: &BTreeMap<u64, BreakpointRecord>,
    ) -> Result<(), SessionError> {
        std::fs::create_dir_all(&self.base)?;
        let path = self.path_for(script);
        let raw = serde_json::to_string_pretty(records)
            .map_err(|source| SessionError::Persistence {
                path: path.clone(),
                source,
            })?;
        std::fs::write(&path, raw)?;
        tracing::debug!(path = %path.display(), count = records.len(), "saved breakpoints");
        Ok(())
    }
}

/// Flatten a script path into a single file name, keeping it readable.
fn sanitize(script: &Path) -> String {
    script
        .to_string_lossy()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(line: u32) -> BreakpointRecord {
        BreakpointRecord {
            filename: "/tmp/job.scr".to_owned(),
            scope: "<module>".to_owned(),
            line,
            enabled: true,
            condition: None,
            encoding: "utf-8".to_owned(),
        }
    }

    #[test]
    fn saved_breakpoints_load_back() {
        let dir = tempfile::tempdir().expect("creating tempdir");
        let store = BreakpointStore::at(dir.path());
        let script = Path::new("/tmp/job.scr");

        let mut records = BTreeMap::new();
        records.insert(1, record(3));
        records.insert(
            2,
            BreakpointRecord {
                condition: Some("x > 5".to_owned()),
                enabled: false,
                ..record(7)
            },
        );

        store.save(script, &records).expect("saving");
        let loaded = store.load(script).expect("loading");
        assert_eq!(loaded, records);
    }

    #[test]
    fn a_missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().expect("creating tempdir");
        let store = BreakpointStore::at(dir.path());
        let loaded = store
            .load(Path::new("/nowhere/never-debugged.scr"))
            .expect("loading");
        assert!(loaded.is_empty());
    }

    #[test]
    fn a_corrupt_file_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().expect("creating tempdir");
        let store = BreakpointStore::at(dir.path());
        let script = Path::new("/tmp/job.scr");
        std::fs::write(store.path_for(script), "not json").expect("writing corrupt file");

        assert!(matches!(
            store.load(script),
            Err(SessionError::Persistence { .. })
        ));
    }

    #[test]
    fn store_paths_differ_per_script_directory() {
        let store = BreakpointStore::at("/data");
        let a = store.path_for(Path::new("/home/alpha/job.scr"));
        let b = store.path_for(Path::new("/home/beta/job.scr"));
        assert_ne!(a, b);
        assert!(a.file_name().is_some_and(|n| n.to_string_lossy().ends_with(".json")));
    }
}
