//! Exporters: independently checkpointed consumers of the committed log.
//!
//! An [`Exporter`] is configured once, opened with an
//! [`ExporterController`], and then handed every committed record its
//! [`RecordFilter`] accepts, in log order. The exporter acknowledges
//! progress through the controller whenever it likes (per record or per
//! batch); the [`ExporterDirector`] only persists what was acknowledged, so
//! after a restart delivery resumes at the first unacknowledged record.

mod director;
mod positions;

pub use director::{ExportPhase, ExporterDirector, ExporterDirectorBuilder, ExporterDirectorHandle};
pub use positions::{ExporterPosition, ExporterPositionStore};

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::ExporterError;
use crate::record::{Intent, Record, RecordKind, UNSET_POSITION, ValueType};

/// A consumer of committed records.
///
/// All hooks run on the director task, one at a time. An `export` error
/// makes the director hand the same record to this exporter again after the
/// retry interval; other exporters are not affected.
pub trait Exporter: Send {
    /// Read arguments and narrow the record filter. Called once, before
    /// `open`.
    ///
    /// # Errors
    ///
    /// A failure here is a wiring error: the director does not start.
    fn configure(&mut self, _context: &mut ExporterContext) -> Result<(), ExporterError> {
        Ok(())
    }

    /// Acquire resources. Retried at the retry interval until it succeeds;
    /// no records are exported before that.
    fn open(&mut self, controller: ExporterController) -> Result<(), ExporterError>;

    /// Export one record.
    fn export(&mut self, record: &Record) -> Result<(), ExporterError>;

    /// Release resources. Called exactly once, on director shutdown, if
    /// `open` succeeded. Positions acknowledged from here are still
    /// persisted.
    fn close(&mut self) {}
}

/// Which records an exporter wants to see.
///
/// Empty sets accept everything. Records of value type
/// [`ValueType::Exporter`] are never exported, whatever the filter says.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    kinds: HashSet<RecordKind>,
    value_types: HashSet<ValueType>,
    intents: HashSet<Intent>,
}

impl RecordFilter {
    /// Accept every record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kinds.insert(kind);
        self
    }

    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_types.insert(value_type);
        self
    }

    pub fn with_intent(mut self, intent: impl Into<Intent>) -> Self {
        self.intents.insert(intent.into());
        self
    }

    /// `true` if `record` should be handed to the exporter.
    pub fn accepts(&self, record: &Record) -> bool {
        record.value_type() != ValueType::Exporter
            && (self.kinds.is_empty() || self.kinds.contains(&record.kind()))
            && (self.value_types.is_empty() || self.value_types.contains(&record.value_type()))
            && (self.intents.is_empty() || self.intents.contains(&record.intent()))
    }
}

/// What an exporter sees during [`Exporter::configure`].
#[derive(Debug)]
pub struct ExporterContext {
    id: String,
    partition_id: i32,
    arguments: Value,
    filter: RecordFilter,
}

impl ExporterContext {
    pub(crate) fn new(id: impl Into<String>, partition_id: i32, arguments: Value) -> Self {
        Self {
            id: id.into(),
            partition_id,
            arguments,
            filter: RecordFilter::all(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    /// The raw configuration arguments.
    pub fn arguments(&self) -> &Value {
        &self.arguments
    }

    /// Deserialize the configuration arguments into `T`.
    ///
    /// `null` arguments deserialize like an empty object, so a `T` whose
    /// fields all have serde defaults works without any arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError`] if the arguments do not match `T`.
    pub fn configuration<T: DeserializeOwned>(&self) -> Result<T, ExporterError> {
        let arguments = match &self.arguments {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(arguments).map_err(|e| {
            ExporterError::with_source(format!("invalid configuration for exporter `{}`", self.id), e)
        })
    }

    /// Restrict which records the exporter receives.
    pub fn set_filter(&mut self, filter: RecordFilter) {
        self.filter = filter;
    }

    pub fn filter(&self) -> &RecordFilter {
        &self.filter
    }

    pub(crate) fn into_filter(self) -> RecordFilter {
        self.filter
    }
}

type TaskFn = Box<dyn FnOnce(&ExporterController) + Send>;

struct PendingTask {
    due: Instant,
    cancelled: Arc<AtomicBool>,
    run: TaskFn,
}

/// Handle to a callback registered with [`ExporterController::schedule_task`].
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    /// Prevent the callback from running. Has no effect once it ran.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// An exporter's view of the director: position acknowledgement and timers.
///
/// `Clone` is cheap; clones may be moved into other tasks.
#[derive(Clone)]
pub struct ExporterController {
    id: Arc<str>,
    positions: ExporterPositionStore,
    tasks: Arc<Mutex<Vec<PendingTask>>>,
    wake: Arc<Notify>,
    /// Set while the director is soft-paused.
    acks_suspended: Arc<AtomicBool>,
}

impl fmt::Debug for ExporterController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterController")
            .field("id", &self.id)
            .field("position", &self.last_exported_position())
            .finish()
    }
}

impl ExporterController {
    pub(crate) fn new(
        id: &str,
        positions: ExporterPositionStore,
        wake: Arc<Notify>,
        acks_suspended: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id: Arc::from(id),
            positions,
            tasks: Arc::new(Mutex::new(Vec::new())),
            wake,
            acks_suspended,
        }
    }

    pub fn exporter_id(&self) -> &str {
        &self.id
    }

    /// Acknowledge every record up to and including `position`.
    ///
    /// Lower positions than the one already acknowledged are ignored, and
    /// so is everything while the director is soft-paused.
    pub fn update_last_exported_record_position(&self, position: i64) {
        if self.dropping_ack(position) {
            return;
        }
        if self.positions.set_if_greater(&self.id, position) {
            tracing::trace!(exporter_id = %self.id, position, "position acknowledged");
        }
    }

    /// Acknowledge `position` and store `metadata` with it.
    ///
    /// Ignored if `position` is lower than the acknowledged position, or
    /// while the director is soft-paused.
    pub fn update_last_exported_record_position_with_metadata(
        &self,
        position: i64,
        metadata: impl Into<Vec<u8>>,
    ) {
        if self.dropping_ack(position) {
            return;
        }
        self.positions
            .set_with_metadata(&self.id, position, metadata.into());
    }

    fn dropping_ack(&self, position: i64) -> bool {
        let suspended = self.acks_suspended.load(Ordering::Acquire);
        if suspended {
            tracing::trace!(exporter_id = %self.id, position, "acknowledgement dropped, soft-paused");
        }
        suspended
    }

    /// Metadata stored with the acknowledged position, if any.
    pub fn read_metadata(&self) -> Option<Vec<u8>> {
        self.positions.metadata(&self.id)
    }

    /// The acknowledged position, or [`UNSET_POSITION`] if nothing was
    /// acknowledged yet.
    pub fn last_exported_position(&self) -> i64 {
        self.positions.get(&self.id).unwrap_or(UNSET_POSITION)
    }

    /// Run `task` on the director task once `delay` has passed.
    ///
    /// Timers follow `tokio::time`, so a paused test clock drives them.
    pub fn schedule_task<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce(&ExporterController) + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.lock_tasks().push(PendingTask {
            due: Instant::now() + delay,
            cancelled: Arc::clone(&cancelled),
            run: Box::new(task),
        });
        self.wake.notify_one();
        ScheduledTask { cancelled }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<PendingTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Earliest due time among tasks that are not cancelled.
    pub(crate) fn next_due(&self) -> Option<Instant> {
        let mut tasks = self.lock_tasks();
        tasks.retain(|t| !t.cancelled.load(Ordering::Acquire));
        tasks.iter().map(|t| t.due).min()
    }

    /// Run every task due at `now`, in due order.
    ///
    /// # Returns
    ///
    /// The number of callbacks run.
    pub(crate) fn run_due_tasks(&self, now: Instant) -> usize {
        let mut due = {
            let mut tasks = self.lock_tasks();
            let (due, pending): (Vec<_>, Vec<_>) =
                tasks.drain(..).partition(|t| t.due <= now);
            *tasks = pending;
            due
        };
        due.sort_by_key(|t| t.due);
        let mut ran = 0;
        for task in due {
            if task.cancelled.load(Ordering::Acquire) {
                continue;
            }
            (task.run)(self);
            ran += 1;
        }
        ran
    }

    pub(crate) fn clear_tasks(&self) {
        self.lock_tasks().clear();
    }
}
