//! Durable per-exporter positions.
//!
//! The store maps exporter ids to the highest log position the exporter has
//! finished with, plus an optional opaque metadata blob. Updates land in
//! memory and are persisted as one JSON document by [`flush`](ExporterPositionStore::flush),
//! using the temp-then-rename pattern so a crash never leaves a torn file.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

const POSITIONS_FILE: &str = "exporter-positions.json";

/// What the store keeps per exporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterPosition {
    /// Highest acknowledged log position.
    pub position: i64,
    /// Opaque data the exporter wants back after a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Positions {
    entries: BTreeMap<String, ExporterPosition>,
    dirty: bool,
}

/// Exporter id to position map, shared between the director and the
/// exporter controllers.
///
/// `Clone` is cheap: all clones share the same entries.
#[derive(Debug, Clone)]
pub struct ExporterPositionStore {
    inner: Arc<RwLock<Positions>>,
    path: Option<Arc<PathBuf>>,
}

impl ExporterPositionStore {
    /// A store that is never persisted. `flush` is a no-op.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Positions::default())),
            path: None,
        }
    }

    /// Open the store persisted in `dir`, loading existing positions.
    ///
    /// A missing file yields an empty store. So does a corrupt one: every
    /// exporter then starts from the beginning of the log, which re-delivers
    /// records but never skips any.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` for I/O failures other than file-not-found.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let path = dir.as_ref().join(POSITIONS_FILE);
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "corrupt exporter positions, exporters restart from the beginning"
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            inner: Arc::new(RwLock::new(Positions {
                entries,
                dirty: false,
            })),
            path: Some(Arc::new(path)),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Positions> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Positions> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The stored position of `exporter_id`.
    pub fn get(&self, exporter_id: &str) -> Option<i64> {
        self.read().entries.get(exporter_id).map(|p| p.position)
    }

    /// The stored metadata of `exporter_id`.
    pub fn metadata(&self, exporter_id: &str) -> Option<Vec<u8>> {
        self.read()
            .entries
            .get(exporter_id)
            .and_then(|p| p.metadata.clone())
    }

    /// Store `position` unconditionally, keeping any metadata.
    pub fn set(&self, exporter_id: &str, position: i64) {
        let mut positions = self.write();
        positions
            .entries
            .entry(exporter_id.to_string())
            .and_modify(|p| p.position = position)
            .or_insert(ExporterPosition {
                position,
                metadata: None,
            });
        positions.dirty = true;
    }

    /// Store `position` only if it is greater than the stored one (or
    /// nothing is stored yet).
    ///
    /// # Returns
    ///
    /// `true` if the stored position changed.
    pub fn set_if_greater(&self, exporter_id: &str, position: i64) -> bool {
        let mut positions = self.write();
        match positions.entries.get_mut(exporter_id) {
            Some(current) if current.position >= position => return false,
            Some(current) => current.position = position,
            None => {
                positions.entries.insert(
                    exporter_id.to_string(),
                    ExporterPosition {
                        position,
                        metadata: None,
                    },
                );
            }
        }
        positions.dirty = true;
        true
    }

    /// Store `position` and `metadata` together, unless `position` is below
    /// the stored position.
    ///
    /// # Returns
    ///
    /// `true` if the entry changed.
    pub fn set_with_metadata(&self, exporter_id: &str, position: i64, metadata: Vec<u8>) -> bool {
        let mut positions = self.write();
        if let Some(current) = positions.entries.get(exporter_id)
            && current.position > position
        {
            return false;
        }
        positions.entries.insert(
            exporter_id.to_string(),
            ExporterPosition {
                position,
                metadata: Some(metadata),
            },
        );
        positions.dirty = true;
        true
    }

    /// Forget `exporter_id`.
    ///
    /// # Returns
    ///
    /// The position that was stored, if any.
    pub fn remove(&self, exporter_id: &str) -> Option<i64> {
        let mut positions = self.write();
        let removed = positions.entries.remove(exporter_id)?;
        positions.dirty = true;
        Some(removed.position)
    }

    /// Call `visitor` with every `(exporter id, position)`, ordered by id.
    pub fn visit_all(&self, mut visitor: impl FnMut(&str, i64)) {
        for (id, entry) in &self.read().entries {
            visitor(id, entry.position);
        }
    }

    /// Ids with a stored position, ordered.
    pub fn ids(&self) -> Vec<String> {
        self.read().entries.keys().cloned().collect()
    }

    /// The smallest stored position: records up to it have been handled by
    /// every exporter and may be compacted away.
    ///
    /// Returns `None` if no position is stored.
    pub fn lowest_position(&self) -> Option<i64> {
        self.read().entries.values().map(|p| p.position).min()
    }

    /// `true` if there are changes `flush` has not persisted yet.
    pub fn is_dirty(&self) -> bool {
        self.read().dirty
    }

    /// Persist the current positions if anything changed since the last
    /// flush.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if directory creation, writing, or renaming fails.
    /// The store stays dirty and the next flush tries again.
    pub fn flush(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            self.write().dirty = false;
            return Ok(());
        };
        let json = {
            let positions = self.read();
            if !positions.dirty {
                return Ok(());
            }
            serde_json::to_string_pretty(&positions.entries).map_err(io::Error::other)?
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path.as_path())?;
        self.write().dirty = false;
        tracing::debug!(path = %path.display(), "exporter positions flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn set_if_greater_only_moves_forward() {
        let store = ExporterPositionStore::in_memory();
        assert!(store.set_if_greater("es", 10));
        assert!(!store.set_if_greater("es", 5));
        assert!(!store.set_if_greater("es", 10));
        assert_eq!(store.get("es"), Some(10));
        assert!(store.set_if_greater("es", 11));
        assert_eq!(store.get("es"), Some(11));
    }

    #[test]
    fn set_overwrites_and_keeps_metadata() {
        let store = ExporterPositionStore::in_memory();
        store.set_with_metadata("es", 10, b"cursor".to_vec());
        store.set("es", 3);
        assert_eq!(store.get("es"), Some(3));
        assert_eq!(store.metadata("es").as_deref(), Some(&b"cursor"[..]));
    }

    #[test]
    fn metadata_is_not_stored_with_an_older_position() {
        let store = ExporterPositionStore::in_memory();
        assert!(store.set_with_metadata("es", 10, vec![1]));
        assert!(!store.set_with_metadata("es", 9, vec![2]));
        assert!(store.set_with_metadata("es", 10, vec![3]));
        assert_eq!(store.metadata("es"), Some(vec![3]));
    }

    #[test]
    fn lowest_position_and_visit_all() {
        let store = ExporterPositionStore::in_memory();
        assert_eq!(store.lowest_position(), None);
        store.set("b", 30);
        store.set("a", 20);
        assert_eq!(store.lowest_position(), Some(20));

        let mut seen = Vec::new();
        store.visit_all(|id, pos| seen.push((id.to_string(), pos)));
        assert_eq!(seen, vec![("a".to_string(), 20), ("b".to_string(), 30)]);

        assert_eq!(store.remove("a"), Some(20));
        assert_eq!(store.remove("a"), None);
        assert_eq!(store.lowest_position(), Some(30));
    }

    #[test]
    fn flush_then_open_restores_positions() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let store = ExporterPositionStore::open(dir.path()).expect("open");
        store.set("es", 42);
        store.set_with_metadata("kafka", 7, vec![0xca, 0xfe]);
        assert!(store.is_dirty());
        store.flush().expect("flush");
        assert!(!store.is_dirty());

        let reopened = ExporterPositionStore::open(dir.path()).expect("reopen");
        assert_eq!(reopened.get("es"), Some(42));
        assert_eq!(reopened.metadata("kafka"), Some(vec![0xca, 0xfe]));
    }

    #[test]
    fn corrupt_file_opens_empty() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        std::fs::write(dir.path().join(POSITIONS_FILE), "not json").expect("write");
        let store = ExporterPositionStore::open(dir.path()).expect("open");
        assert_eq!(store.lowest_position(), None);
    }

    #[test]
    fn unflushed_changes_are_not_persisted() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let store = ExporterPositionStore::open(dir.path()).expect("open");
        store.set("es", 1);
        store.flush().expect("flush");
        store.set("es", 2);

        let reopened = ExporterPositionStore::open(dir.path()).expect("reopen");
        assert_eq!(reopened.get("es"), Some(1));
    }

    proptest! {
        #[test]
        fn stored_position_is_the_running_maximum(updates in proptest::collection::vec(-5i64..1_000, 1..50)) {
            let store = ExporterPositionStore::in_memory();
            let mut max = None::<i64>;
            for position in updates {
                let changed = store.set_if_greater("es", position);
                prop_assert_eq!(changed, max.is_none_or(|m| position > m));
                max = Some(max.map_or(position, |m| m.max(position)));
                prop_assert_eq!(store.get("es"), max);
            }
        }
    }
}
