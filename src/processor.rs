//! The record-processor lifecycle and the context processors run in.

use std::future::Future;
use std::pin::Pin;

use crate::command::CommandResponseWriter;
use crate::config::EngineConfig;
use crate::error::{EngineError, WriteError};
use crate::record::Record;
use crate::writer::TypedStreamWriter;

/// An asynchronous sub-operation started while processing a record.
pub type SubTask = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'static>>;

/// Whether records are being rebuilt into state or handled live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Restoring state from records already in the log: no side effects, no
    /// writes.
    Replay,
    /// Handling new records with the full pipeline.
    Processing,
}

/// Per-processor environment handed to every hook that needs it.
///
/// Carries partition-wide settings (replacing process-global flags) and
/// collects asynchronous sub-tasks. The stream processor awaits every
/// deferred sub-task after the record's pipeline and before it dispatches
/// the next record.
pub struct ProcessingContext {
    partition_id: i32,
    multi_tenancy_enabled: bool,
    mode: ProcessingMode,
    pending: Vec<SubTask>,
}

impl std::fmt::Debug for ProcessingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingContext")
            .field("partition_id", &self.partition_id)
            .field("multi_tenancy_enabled", &self.multi_tenancy_enabled)
            .field("mode", &self.mode)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl ProcessingContext {
    /// Create a context in replay mode for the given configuration.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            partition_id: config.partition_id,
            multi_tenancy_enabled: config.multi_tenancy_enabled,
            mode: ProcessingMode::Replay,
            pending: Vec::new(),
        }
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    pub fn multi_tenancy_enabled(&self) -> bool {
        self.multi_tenancy_enabled
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    pub fn is_replay(&self) -> bool {
        self.mode == ProcessingMode::Replay
    }

    /// Register an asynchronous sub-task. Its failure is treated like a
    /// failure of the record that started it.
    pub fn defer<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        self.pending.push(Box::pin(task));
    }

    /// Number of sub-tasks registered and not yet collected.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn set_mode(&mut self, mode: ProcessingMode) {
        self.mode = mode;
    }

    pub(crate) fn take_pending(&mut self) -> Vec<SubTask> {
        std::mem::take(&mut self.pending)
    }
}

/// Handles records of one `(kind, value type, intent)` triple.
///
/// For each record the stream processor calls the hooks in this order:
/// [`process`](Self::process), [`execute_side_effects`](Self::execute_side_effects),
/// [`write_records`](Self::write_records), [`update_state`](Self::update_state).
/// During replay only `process` and `update_state` run. A processor may keep
/// per-record data between the hooks of one record; the next record only
/// arrives after `update_state`.
///
/// # Type Parameters
///
/// * `S` - The partition state the processors share.
pub trait TypedRecordProcessor<S>: Send {
    /// Called once when the stream processor opens, before replay.
    fn on_open(&mut self, _ctx: &ProcessingContext) {}

    /// Decide what the record leads to.
    ///
    /// # Errors
    ///
    /// Any error is fatal: the stream processor stops.
    fn process(
        &mut self,
        record: &Record,
        state: &mut S,
        ctx: &mut ProcessingContext,
    ) -> Result<(), EngineError>;

    /// Perform effects outside the log, such as client responses.
    ///
    /// # Returns
    ///
    /// `false` to have the hook retried after the configured retry delay.
    fn execute_side_effects(&mut self, _responses: &mut dyn CommandResponseWriter) -> bool {
        true
    }

    /// Append follow-up records.
    ///
    /// # Errors
    ///
    /// A [`WriteError::Backpressure`] is retried by the stream processor;
    /// the hook must then write the same records again.
    fn write_records(&mut self, _writer: &mut TypedStreamWriter) -> Result<(), WriteError> {
        Ok(())
    }

    /// Apply the record's outcome to the state.
    fn update_state(&mut self, _state: &mut S) {}

    /// Called when processing is paused; no record arrives until
    /// [`on_resumed`](Self::on_resumed).
    fn on_paused(&mut self) {}

    fn on_resumed(&mut self) {}

    /// Called once when the stream processor closes.
    fn on_close(&mut self) {}
}

impl<S, P: TypedRecordProcessor<S> + ?Sized> TypedRecordProcessor<S> for Box<P> {
    fn on_open(&mut self, ctx: &ProcessingContext) {
        (**self).on_open(ctx)
    }

    fn process(
        &mut self,
        record: &Record,
        state: &mut S,
        ctx: &mut ProcessingContext,
    ) -> Result<(), EngineError> {
        (**self).process(record, state, ctx)
    }

    fn execute_side_effects(&mut self, responses: &mut dyn CommandResponseWriter) -> bool {
        (**self).execute_side_effects(responses)
    }

    fn write_records(&mut self, writer: &mut TypedStreamWriter) -> Result<(), WriteError> {
        (**self).write_records(writer)
    }

    fn update_state(&mut self, state: &mut S) {
        (**self).update_state(state)
    }

    fn on_paused(&mut self) {
        (**self).on_paused()
    }

    fn on_resumed(&mut self) {
        (**self).on_resumed()
    }

    fn on_close(&mut self) {
        (**self).on_close()
    }
}

/// Folds event records into state with a closure.
///
/// Useful for events whose only effect is a state change; nothing is
/// written and there are no side effects.
pub struct EventApplier<F> {
    apply: F,
    pending: Option<Record>,
}

impl<F> EventApplier<F> {
    pub fn new(apply: F) -> Self {
        Self {
            apply,
            pending: None,
        }
    }
}

impl<S, F> TypedRecordProcessor<S> for EventApplier<F>
where
    F: FnMut(&Record, &mut S) + Send,
{
    fn process(
        &mut self,
        record: &Record,
        _state: &mut S,
        _ctx: &mut ProcessingContext,
    ) -> Result<(), EngineError> {
        self.pending = Some(record.clone());
        Ok(())
    }

    fn update_state(&mut self, state: &mut S) {
        if let Some(record) = self.pending.take() {
            (self.apply)(&record, state);
        }
    }
}
