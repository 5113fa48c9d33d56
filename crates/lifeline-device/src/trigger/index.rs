//! Check-in id to trigger id bookkeeping.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{TriggerError, TriggerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub trigger_id: TriggerId,
    pub at: i64,
}

/// Which trigger belongs to which check-in. At most one trigger per
/// check-in. Optionally backed by a JSON file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TriggerIndex {
    entries: BTreeMap<String, IndexEntry>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl TriggerIndex {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing file is an empty index.
    pub async fn load(path: &Path) -> Result<Self, TriggerError> {
        let mut index = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str::<Self>(&content)
                .map_err(|e| TriggerError::Index(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(TriggerError::Index(format!("{}: {e}", path.display()))),
        };
        index.path = Some(path.to_path_buf());
        debug!(path = %path.display(), entries = index.entries.len(), "Trigger index loaded");
        Ok(index)
    }

    /// Write back to the backing file, if any.
    pub async fn save(&self) -> Result<(), TriggerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TriggerError::Index(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| TriggerError::Index(e.to_string()))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| TriggerError::Index(format!("{}: {e}", path.display())))
    }

    pub fn get(&self, check_in_id: &str) -> Option<&IndexEntry> {
        self.entries.get(check_in_id)
    }

    pub fn insert(&mut self, check_in_id: &str, entry: IndexEntry) -> Option<IndexEntry> {
        self.entries.insert(check_in_id.to_string(), entry)
    }

    pub fn remove(&mut self, check_in_id: &str) -> Option<IndexEntry> {
        self.entries.remove(check_in_id)
    }

    /// Reverse lookup. Removes the entry so a fired trigger is forgotten.
    pub fn take_by_trigger(&mut self, trigger_id: &TriggerId) -> Option<String> {
        let check_in_id = self
            .entries
            .iter()
            .find(|(_, e)| &e.trigger_id == trigger_id)
            .map(|(id, _)| id.clone())?;
        self.entries.remove(&check_in_id);
        Some(check_in_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(id: &str, at: i64) -> IndexEntry {
        IndexEntry {
            trigger_id: TriggerId(id.into()),
            at,
        }
    }

    #[tokio::test]
    async fn survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("triggers.json");

        let mut index = TriggerIndex::load(&path).await.unwrap();
        assert!(index.is_empty());
        index.insert("k1", entry("t1", 100));
        index.save().await.unwrap();

        let reloaded = TriggerIndex::load(&path).await.unwrap();
        assert_eq!(reloaded.get("k1"), Some(&entry("t1", 100)));
    }

    #[tokio::test]
    async fn garbage_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triggers.json");
        tokio::fs::write(&path, "[1,2").await.unwrap();
        assert!(matches!(
            TriggerIndex::load(&path).await,
            Err(TriggerError::Index(_))
        ));
    }

    #[test]
    fn reverse_lookup_removes_entry() {
        let mut index = TriggerIndex::in_memory();
        index.insert("k1", entry("t1", 100));
        index.insert("k2", entry("t2", 200));
        assert_eq!(index.take_by_trigger(&TriggerId("t2".into())), Some("k2".into()));
        assert_eq!(index.take_by_trigger(&TriggerId("t2".into())), None);
        assert_eq!(index.len(), 1);
    }
}
