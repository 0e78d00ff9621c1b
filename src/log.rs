//! In-memory partition log.
//!
//! [`LogStream`] is the boundary between the engine and replicated storage:
//! it hands out dense positions starting at 1, treats every successful
//! append as committed, and publishes the commit position on a `watch`
//! channel so readers can wait for new records. An optional capacity limit
//! makes appends fail the way a full dispatcher buffer does.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::watch;

use crate::codec;
use crate::error::{EngineError, WriteError};
use crate::record::{Record, UNSET_POSITION};

const UNLIMITED: usize = usize::MAX;

struct LogInner {
    partition_id: i32,
    entries: RwLock<Vec<Bytes>>,
    capacity: AtomicUsize,
    commit_tx: watch::Sender<i64>,
}

/// Shared handle to one partition's log.
///
/// `Clone` is cheap: all clones point at the same log.
#[derive(Clone)]
pub struct LogStream {
    inner: Arc<LogInner>,
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("partition_id", &self.inner.partition_id)
            .field("last_position", &self.last_position())
            .finish()
    }
}

impl LogStream {
    /// Create an empty, unbounded log for `partition_id`.
    pub fn new(partition_id: i32) -> Self {
        let (commit_tx, _) = watch::channel(UNSET_POSITION);
        Self {
            inner: Arc::new(LogInner {
                partition_id,
                entries: RwLock::new(Vec::new()),
                capacity: AtomicUsize::new(UNLIMITED),
                commit_tx,
            }),
        }
    }

    /// Create an empty log that refuses appends beyond `limit` entries.
    pub fn with_capacity_limit(partition_id: i32, limit: usize) -> Self {
        let log = Self::new(partition_id);
        log.set_capacity_limit(Some(limit));
        log
    }

    /// Change the capacity limit. `None` removes it.
    pub fn set_capacity_limit(&self, limit: Option<usize>) {
        self.inner
            .capacity
            .store(limit.unwrap_or(UNLIMITED), Ordering::Release);
    }

    pub fn partition_id(&self) -> i32 {
        self.inner.partition_id
    }

    /// Append encoded entries as one atomic unit.
    ///
    /// Either every entry becomes visible (with consecutive positions) or
    /// none does.
    ///
    /// # Returns
    ///
    /// The position of the last appended entry.
    ///
    /// # Errors
    ///
    /// * [`WriteError::EmptyBatch`] if `entries` is empty.
    /// * [`WriteError::Backpressure`] if the batch does not fit the capacity
    ///   limit. The log is unchanged.
    pub fn append(&self, entries: Vec<Bytes>) -> Result<i64, WriteError> {
        if entries.is_empty() {
            return Err(WriteError::EmptyBatch);
        }
        let last = {
            let mut log = self
                .inner
                .entries
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let capacity = self.inner.capacity.load(Ordering::Acquire);
            let available = capacity.saturating_sub(log.len());
            if entries.len() > available {
                return Err(WriteError::Backpressure {
                    requested: entries.len(),
                    available,
                });
            }
            log.extend(entries);
            log.len() as i64
        };
        self.inner.commit_tx.send_replace(last);
        Ok(last)
    }

    /// Position of the newest entry, or [`UNSET_POSITION`] for an empty log.
    pub fn last_position(&self) -> i64 {
        let len = self
            .inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        if len == 0 { UNSET_POSITION } else { len as i64 }
    }

    /// Read and decode the entry at `position`.
    ///
    /// Returns `None` if nothing is stored at that position yet.
    pub fn read(&self, position: i64) -> Option<Result<Record, EngineError>> {
        let idx = usize::try_from(position.checked_sub(1)?).ok()?;
        let bytes = self
            .inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(idx)
            .cloned()?;
        Some(
            codec::decode(position, &bytes)
                .map_err(|source| EngineError::Decode { position, source }),
        )
    }

    /// Read the first entry strictly after `position`.
    pub fn read_after(&self, position: i64) -> Option<Result<Record, EngineError>> {
        self.read(position.max(0) + 1)
    }

    /// Subscribe to commit position updates.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.inner.commit_tx.subscribe()
    }

    /// Create a reader positioned at the start of the log.
    pub fn new_reader(&self) -> LogReader {
        LogReader {
            log: self.clone(),
            next_position: 1,
        }
    }
}

/// Sequential cursor over a [`LogStream`].
///
/// Iterating yields every committed record from the cursor onwards and
/// stops at the current end of the log; iterating again later picks up
/// records appended in the meantime.
#[derive(Debug, Clone)]
pub struct LogReader {
    log: LogStream,
    next_position: i64,
}

impl LogReader {
    /// Position the cursor so the next record returned is the first with a
    /// position of at least `position`.
    pub fn seek(&mut self, position: i64) {
        self.next_position = position.max(1);
    }

    /// Position the cursor after the newest committed record.
    pub fn seek_to_end(&mut self) {
        self.next_position = self.log.last_position().max(0) + 1;
    }

    /// Position of the record the next call to `next` would return.
    pub fn next_position(&self) -> i64 {
        self.next_position
    }

    /// `true` if a committed record is waiting at the cursor.
    pub fn has_next(&self) -> bool {
        self.log.last_position() >= self.next_position
    }
}

impl Iterator for LogReader {
    type Item = Result<Record, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.log.read(self.next_position)?;
        self.next_position += 1;
        Some(item)
    }
}
