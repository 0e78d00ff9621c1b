//! Snapshot serialization and local file-based snapshot persistence.
//!
//! State participates in snapshots through [`SnapshotSupport`]. Two
//! strategies are provided: [`LongIndex`] writes a flat binary table and
//! [`JsonSnapshot`] serializes small objects with `serde_json`. A processor
//! state made of several parts composes them into one blob with
//! [`ComposedSnapshot`].
//!
//! Blobs are wrapped in a [`Snapshot`] artifact that records the log position
//! it was taken at and a SHA-256 checksum, and are stored by
//! [`SnapshotStore`] as `<dir>/snapshot-<position>.bin`. Writes are atomic
//! via a temp-rename pattern. Unlike a cache, a snapshot that fails to load
//! is an error: silently skipping it would replay from the wrong state.

use std::collections::BTreeMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};

use crate::error::SnapshotError;

/// Format version written into every artifact header.
pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

const MAGIC: &[u8; 4] = b"LFSN";
const HEADER_LEN: usize = 4 + 2 + 8 + 8 + 4;
const CHECKSUM_LEN: usize = 32;

/// State that can be written to and restored from a snapshot.
///
/// `recover_from_snapshot(write_snapshot(s))` must restore a value equal to
/// `s` in every observable way.
pub trait SnapshotSupport {
    /// Append this value's snapshot bytes to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the value cannot be serialized.
    fn write_snapshot(&self, out: &mut BytesMut) -> Result<(), SnapshotError>;

    /// Replace this value with the one encoded in `input`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Corrupt`] (or another variant) if `input` is
    /// not a valid snapshot of this type.
    fn recover_from_snapshot(&mut self, input: &[u8]) -> Result<(), SnapshotError>;
}

/// A sorted `i64 -> i64` table with a fixed-width binary snapshot format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LongIndex {
    entries: BTreeMap<i64, i64>,
}

impl LongIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: i64) -> Option<i64> {
        self.entries.get(&key).copied()
    }

    pub fn insert(&mut self, key: i64, value: i64) -> Option<i64> {
        self.entries.insert(key, value)
    }

    pub fn remove(&mut self, key: i64) -> Option<i64> {
        self.entries.remove(&key)
    }

    pub fn contains(&self, key: i64) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, *v))
    }
}

impl SnapshotSupport for LongIndex {
    fn write_snapshot(&self, out: &mut BytesMut) -> Result<(), SnapshotError> {
        out.reserve(4 + self.entries.len() * 16);
        out.put_u32(checked_len("index entry count", self.entries.len())?);
        for (key, value) in &self.entries {
            out.put_i64(*key);
            out.put_i64(*value);
        }
        Ok(())
    }

    fn recover_from_snapshot(&mut self, mut input: &[u8]) -> Result<(), SnapshotError> {
        if input.len() < 4 {
            return Err(SnapshotError::Corrupt("index snapshot has no length".into()));
        }
        let count = input.get_u32() as usize;
        if input.len() != count * 16 {
            return Err(SnapshotError::Corrupt(format!(
                "index snapshot declares {count} entries but carries {} bytes",
                input.len()
            )));
        }
        self.entries.clear();
        for _ in 0..count {
            let key = input.get_i64();
            let value = input.get_i64();
            self.entries.insert(key, value);
        }
        Ok(())
    }
}

/// Wraps a serde type so it is snapshotted as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsonSnapshot<T>(pub T);

impl<T> Deref for JsonSnapshot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for JsonSnapshot<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: Serialize + DeserializeOwned> SnapshotSupport for JsonSnapshot<T> {
    fn write_snapshot(&self, out: &mut BytesMut) -> Result<(), SnapshotError> {
        serde_json::to_writer(out.writer(), &self.0)?;
        Ok(())
    }

    fn recover_from_snapshot(&mut self, input: &[u8]) -> Result<(), SnapshotError> {
        self.0 = serde_json::from_slice(input)?;
        Ok(())
    }
}

/// Several named snapshot resources packed into one blob.
///
/// Layout: `count u16`, then per resource `name len u16 | name | data len
/// u32 | data`.
#[derive(Debug)]
pub struct ComposedSnapshot<'a> {
    resources: Vec<(&'a str, &'a [u8])>,
}

impl<'a> ComposedSnapshot<'a> {
    /// Write `resources` in order into `out`.
    ///
    /// # Errors
    ///
    /// Propagates the first resource's [`SnapshotError`], or returns
    /// [`SnapshotError::TooLarge`] if a name, a resource or the resource
    /// count does not fit the layout.
    pub fn write(
        out: &mut BytesMut,
        resources: &[(&str, &dyn SnapshotSupport)],
    ) -> Result<(), SnapshotError> {
        out.put_u16(checked_len("resource count", resources.len())?);
        for (name, resource) in resources {
            let mut data = BytesMut::new();
            resource.write_snapshot(&mut data)?;
            out.put_u16(checked_len("resource name", name.len())?);
            out.put_slice(name.as_bytes());
            out.put_u32(checked_len("resource", data.len())?);
            out.put_slice(&data);
        }
        Ok(())
    }

    /// Split a blob written by [`write`](ComposedSnapshot::write) into its
    /// resources.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Corrupt`] if the blob is malformed.
    pub fn parse(mut input: &'a [u8]) -> Result<Self, SnapshotError> {
        let count = take(&mut input, 2)?.get_u16();
        let mut resources = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let name_len = usize::from(take(&mut input, 2)?.get_u16());
            let name = std::str::from_utf8(take(&mut input, name_len)?)
                .map_err(|e| SnapshotError::Corrupt(format!("resource name: {e}")))?;
            let data_len = take(&mut input, 4)?.get_u32() as usize;
            let data = take(&mut input, data_len)?;
            resources.push((name, data));
        }
        if !input.is_empty() {
            return Err(SnapshotError::Corrupt(format!(
                "{} trailing bytes after composed snapshot",
                input.len()
            )));
        }
        Ok(Self { resources })
    }

    /// Restore `target` from the resource called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::MissingResource`] if no such resource exists,
    /// or the error raised by `target`.
    pub fn recover(
        &self,
        name: &str,
        target: &mut dyn SnapshotSupport,
    ) -> Result<(), SnapshotError> {
        let (_, data) = self
            .resources
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| SnapshotError::MissingResource(name.to_string()))?;
        target.recover_from_snapshot(data)
    }

    /// Names of the contained resources, in write order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.resources.iter().map(|(n, _)| *n)
    }
}

/// Convert a length for a fixed-width length field.
fn checked_len<T: TryFrom<usize>>(what: &'static str, len: usize) -> Result<T, SnapshotError> {
    T::try_from(len).map_err(|_| SnapshotError::TooLarge { what, len })
}

fn take<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], SnapshotError> {
    if input.len() < len {
        return Err(SnapshotError::Corrupt(format!(
            "needed {len} bytes, {} remaining",
            input.len()
        )));
    }
    let all: &'a [u8] = *input;
    let (head, rest) = all.split_at(len);
    *input = rest;
    Ok(head)
}

/// Where and when a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// Position of the last record folded into the state.
    pub position: i64,
    /// Wall clock at creation, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A snapshot artifact: processor state as of a log position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    /// The state blob written by [`SnapshotSupport::write_snapshot`].
    pub data: Bytes,
}

impl Snapshot {
    /// Snapshot `state` as of `position`.
    ///
    /// # Errors
    ///
    /// Propagates the state's [`SnapshotError`].
    pub fn take(state: &dyn SnapshotSupport, position: i64) -> Result<Self, SnapshotError> {
        let mut data = BytesMut::new();
        state.write_snapshot(&mut data)?;
        Ok(Self {
            metadata: SnapshotMetadata {
                position,
                timestamp: crate::writer::now_millis(),
            },
            data: data.freeze(),
        })
    }

    /// Serialize the artifact with header and trailing checksum.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::TooLarge`] if the state blob exceeds 4 GiB.
    pub fn encode(&self) -> Result<Bytes, SnapshotError> {
        let data_len: u32 = checked_len("state", self.data.len())?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.data.len() + CHECKSUM_LEN);
        buf.put_slice(MAGIC);
        buf.put_u16(SNAPSHOT_FORMAT_VERSION);
        buf.put_i64(self.metadata.position);
        buf.put_i64(self.metadata.timestamp);
        buf.put_u32(data_len);
        buf.put_slice(&self.data);
        let checksum = Sha256::digest(&buf);
        buf.put_slice(&checksum);
        Ok(buf.freeze())
    }

    /// Parse and verify an artifact produced by [`encode`](Snapshot::encode).
    ///
    /// # Errors
    ///
    /// * [`SnapshotError::Corrupt`] for a wrong magic or a malformed body.
    /// * [`SnapshotError::UnsupportedVersion`] for a newer format.
    /// * [`SnapshotError::ChecksumMismatch`] if the content was altered.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(SnapshotError::Corrupt(format!(
                "artifact is only {} bytes",
                bytes.len()
            )));
        }
        let mut header = &bytes[..HEADER_LEN];
        if &header[..4] != MAGIC {
            return Err(SnapshotError::Corrupt("not a snapshot artifact".into()));
        }
        header.advance(4);
        let version = header.get_u16();
        if version > SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: version,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }
        let position = header.get_i64();
        let timestamp = header.get_i64();
        let data_len = header.get_u32() as usize;
        if bytes.len() != HEADER_LEN + data_len + CHECKSUM_LEN {
            return Err(SnapshotError::Corrupt(format!(
                "artifact declares {data_len} data bytes but is {} bytes long",
                bytes.len()
            )));
        }
        let (content, checksum) = bytes.split_at(HEADER_LEN + data_len);
        if Sha256::digest(content).as_slice() != checksum {
            return Err(SnapshotError::ChecksumMismatch { position });
        }
        Ok(Self {
            metadata: SnapshotMetadata {
                position,
                timestamp,
            },
            data: Bytes::copy_from_slice(&content[HEADER_LEN..]),
        })
    }
}

/// Directory of snapshot artifacts, one file per snapshot position.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Create a store rooted at `dir`. The directory is created lazily on
    /// the first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Compute the file path for the snapshot taken at `position`.
    ///
    /// # Returns
    ///
    /// `<dir>/snapshot-<position, zero padded to 20 digits>.bin`
    pub fn snapshot_path(&self, position: i64) -> PathBuf {
        self.dir.join(format!("snapshot-{position:020}.bin"))
    }

    /// Save a snapshot atomically.
    ///
    /// Writes `<file>.tmp` first and renames it into place, so readers never
    /// see a partially written artifact.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] if directory creation, writing, or
    /// renaming fails, and [`SnapshotError::TooLarge`] for an oversized
    /// state blob.
    pub fn save(&self, snapshot: &Snapshot) -> Result<PathBuf, SnapshotError> {
        let bytes = snapshot.encode()?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.snapshot_path(snapshot.metadata.position);
        let tmp_path = path.with_extension("bin.tmp");
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, &path)?;
        tracing::debug!(
            path = %path.display(),
            position = snapshot.metadata.position,
            "snapshot saved"
        );
        Ok(path)
    }

    /// Positions of all stored snapshots, ascending.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` for failures other than a missing directory.
    pub fn positions(&self) -> io::Result<Vec<i64>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut positions = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            if let Some(name) = name.to_str()
                && let Some(digits) = name
                    .strip_prefix("snapshot-")
                    .and_then(|rest| rest.strip_suffix(".bin"))
                && let Ok(position) = digits.parse::<i64>()
            {
                positions.push(position);
            }
        }
        positions.sort_unstable();
        Ok(positions)
    }

    /// Load the snapshot taken at `position`.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if no snapshot exists at that position.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the file cannot be read or fails
    /// verification.
    pub fn load(&self, position: i64) -> Result<Option<Snapshot>, SnapshotError> {
        let path = self.snapshot_path(position);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = Snapshot::decode(&bytes).inspect_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "snapshot failed verification");
        })?;
        if snapshot.metadata.position != position {
            return Err(SnapshotError::Corrupt(format!(
                "file for position {position} holds a snapshot at {}",
                snapshot.metadata.position
            )));
        }
        Ok(Some(snapshot))
    }

    /// Load the snapshot with the highest position.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the newest snapshot is unreadable. Older
    /// snapshots are not tried instead.
    pub fn latest(&self) -> Result<Option<Snapshot>, SnapshotError> {
        match self.positions()?.last() {
            Some(position) => self.load(*position),
            None => Ok(None),
        }
    }

    /// Delete all but the `keep` newest snapshots.
    ///
    /// # Returns
    ///
    /// The number of deleted snapshots.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if listing or deleting fails.
    pub fn retain_latest(&self, keep: usize) -> io::Result<usize> {
        let positions = self.positions()?;
        let excess = positions.len().saturating_sub(keep);
        for position in &positions[..excess] {
            std::fs::remove_file(self.snapshot_path(*position))?;
        }
        Ok(excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyGenerator;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Settings {
        name: String,
        retries: u32,
    }

    fn sample_state() -> (KeyGenerator, LongIndex, JsonSnapshot<Settings>) {
        let mut keys = KeyGenerator::new(100, 2);
        keys.next_key();
        let mut index = LongIndex::new();
        index.insert(1, 10);
        index.insert(-5, 50);
        let settings = JsonSnapshot(Settings {
            name: "payments".into(),
            retries: 3,
        });
        (keys, index, settings)
    }

    #[test]
    fn long_index_restores_entries() {
        let (_, index, _) = sample_state();
        let mut buf = BytesMut::new();
        index.write_snapshot(&mut buf).expect("write");

        let mut restored = LongIndex::new();
        restored.insert(99, 99);
        restored.recover_from_snapshot(&buf).expect("recover");
        assert_eq!(restored, index);
    }

    #[test]
    fn long_index_with_wrong_length_is_corrupt() {
        let mut restored = LongIndex::new();
        let err = restored
            .recover_from_snapshot(&[0, 0, 0, 2, 1, 2, 3])
            .expect_err("recover should fail");
        assert!(matches!(err, SnapshotError::Corrupt(_)));
    }

    #[test]
    fn composed_snapshot_restores_each_resource() {
        let (keys, index, settings) = sample_state();
        let mut buf = BytesMut::new();
        ComposedSnapshot::write(
            &mut buf,
            &[("keys", &keys), ("index", &index), ("settings", &settings)],
        )
        .expect("write");

        let parsed = ComposedSnapshot::parse(&buf).expect("parse");
        assert_eq!(
            parsed.names().collect::<Vec<_>>(),
            vec!["keys", "index", "settings"]
        );

        let mut keys2 = KeyGenerator::new(0, 1);
        let mut index2 = LongIndex::new();
        let mut settings2 = JsonSnapshot(Settings::default());
        parsed.recover("keys", &mut keys2).expect("keys");
        parsed.recover("index", &mut index2).expect("index");
        parsed.recover("settings", &mut settings2).expect("settings");
        assert_eq!(keys2, keys);
        assert_eq!(index2, index);
        assert_eq!(settings2, settings);
    }

    #[test]
    fn oversized_resource_name_is_rejected() {
        let name = "n".repeat(usize::from(u16::MAX) + 1);
        let mut buf = BytesMut::new();
        let err = ComposedSnapshot::write(&mut buf, &[(name.as_str(), &LongIndex::new())])
            .expect_err("name does not fit a u16 length");
        assert!(matches!(
            err,
            SnapshotError::TooLarge { what: "resource name", len } if len == name.len()
        ));
    }

    #[test]
    fn missing_resource_is_an_error() {
        let mut buf = BytesMut::new();
        ComposedSnapshot::write(&mut buf, &[]).expect("write");
        let parsed = ComposedSnapshot::parse(&buf).expect("parse");
        let err = parsed
            .recover("keys", &mut LongIndex::new())
            .expect_err("recover should fail");
        assert!(matches!(err, SnapshotError::MissingResource(name) if name == "keys"));
    }

    #[test]
    fn save_then_latest_returns_newest() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = SnapshotStore::new(dir.path().join("snapshots"));
        let (_, index, _) = sample_state();

        store.save(&Snapshot::take(&index, 5).expect("take")).expect("save");
        store.save(&Snapshot::take(&index, 12).expect("take")).expect("save");

        assert_eq!(store.positions().expect("list"), vec![5, 12]);
        let latest = store.latest().expect("load").expect("snapshot should exist");
        assert_eq!(latest.metadata.position, 12);

        let mut restored = LongIndex::new();
        restored.recover_from_snapshot(&latest.data).expect("recover");
        assert_eq!(restored, index);
    }

    #[test]
    fn latest_on_missing_directory_is_none() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = SnapshotStore::new(dir.path().join("absent"));
        assert!(store.latest().expect("load").is_none());
    }

    #[test]
    fn flipped_byte_fails_the_checksum() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = SnapshotStore::new(dir.path());
        let (_, index, _) = sample_state();
        let path = store
            .save(&Snapshot::take(&index, 3).expect("take"))
            .expect("save");

        let mut bytes = std::fs::read(&path).expect("read");
        bytes[HEADER_LEN + 2] ^= 0xff;
        std::fs::write(&path, bytes).expect("write");

        let err = store.latest().expect_err("corrupt snapshot must not load");
        assert!(matches!(err, SnapshotError::ChecksumMismatch { position: 3 }));
    }

    #[test]
    fn garbage_file_is_corrupt_not_missing() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = SnapshotStore::new(dir.path());
        std::fs::write(store.snapshot_path(8), b"this is not a snapshot at all, promise")
            .expect("write");
        let err = store.latest().expect_err("garbage must not load");
        assert!(matches!(err, SnapshotError::Corrupt(_)));
    }

    #[test]
    fn save_uses_atomic_temp_rename() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = SnapshotStore::new(dir.path());
        let path = store
            .save(&Snapshot::take(&LongIndex::new(), 1).expect("take"))
            .expect("save");
        assert!(path.exists());
        assert!(!path.with_extension("bin.tmp").exists());
    }

    #[test]
    fn retain_latest_deletes_older_snapshots() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = SnapshotStore::new(dir.path());
        for position in [1, 4, 9] {
            store
                .save(&Snapshot::take(&LongIndex::new(), position).expect("take"))
                .expect("save");
        }
        assert_eq!(store.retain_latest(1).expect("retain"), 2);
        assert_eq!(store.positions().expect("list"), vec![9]);
    }
}
