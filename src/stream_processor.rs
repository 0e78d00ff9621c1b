//! The per-partition stream processor.
//!
//! A [`TypedStreamProcessor`] runs as a single tokio task that exclusively
//! owns the partition state, the processor registry and the log reader. It
//! moves through [`Phase`]s: it recovers the latest snapshot (`Opening`),
//! rebuilds state from the records written after it (`Replaying`), then
//! handles new records as they are committed (`Processing`). Processing can
//! be held and picked up again from the handle (`Paused`).
//!
//! Public API: [`TypedStreamProcessor::builder`] to wire a processor up and
//! [`StreamProcessorHandle`] to observe and control it.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::Instrument;

use crate::command::{CommandResponseWriter, NoopResponseWriter};
use crate::config::EngineConfig;
use crate::error::{EngineError, WriteError};
use crate::log::{LogReader, LogStream};
use crate::processor::{ProcessingContext, ProcessingMode};
use crate::record::{Record, UNSET_POSITION};
use crate::registry::{ProcessorRegistry, RecordTriple};
use crate::snapshot::{Snapshot, SnapshotStore, SnapshotSupport};
use crate::writer::TypedStreamWriter;

const TASK_NAME: &str = "stream processor";

/// Lifecycle phase of a stream processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Closed,
    /// Recovering the latest snapshot.
    Opening,
    /// Rebuilding state from records already in the log.
    Replaying,
    /// Handling new records.
    Processing,
    /// Holding new records until resumed.
    Paused,
    /// Draining in-flight work and releasing resources.
    Closing,
}

/// Messages sent from [`StreamProcessorHandle`] to the processor task.
enum ProcessorMessage<S> {
    /// Run a closure against the current state.
    Inspect(Box<dyn FnOnce(&S) + Send>),
    /// Take a snapshot now.
    Snapshot {
        reply: oneshot::Sender<Result<Option<i64>, EngineError>>,
    },
}

/// Wires up a [`TypedStreamProcessor`].
///
/// # Examples
///
/// ```no_run
/// # async fn demo() -> Result<(), logfold::EngineError> {
/// use logfold::{LogStream, LongIndex, ProcessorRegistry, TypedStreamProcessor};
///
/// let log = LogStream::new(1);
/// let registry = ProcessorRegistry::<LongIndex>::new();
/// let handle = TypedStreamProcessor::builder(log, LongIndex::new(), registry).open();
/// handle.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct StreamProcessorBuilder<S> {
    log: LogStream,
    state: S,
    registry: ProcessorRegistry<S>,
    config: EngineConfig,
    responses: Box<dyn CommandResponseWriter>,
}

impl<S> StreamProcessorBuilder<S>
where
    S: SnapshotSupport + Send + 'static,
{
    /// Replace the default [`EngineConfig`].
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Where command responses go. Defaults to discarding them.
    pub fn responses(mut self, responses: impl CommandResponseWriter + 'static) -> Self {
        self.responses = Box::new(responses);
        self
    }

    /// Spawn the processor task on the current tokio runtime.
    ///
    /// The task starts in [`Phase::Opening`] right away; use
    /// [`StreamProcessorHandle::wait_for_phase`] to wait for it to reach
    /// [`Phase::Processing`].
    pub fn open(self) -> StreamProcessorHandle<S> {
        let (sender, rx) = mpsc::channel(32);
        let (phase_tx, phase) = watch::channel(Phase::Opening);
        let (processed_tx, processed) = watch::channel(UNSET_POSITION);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);

        let span = tracing::info_span!(
            "stream_processor",
            partition_id = self.config.partition_id
        );
        let mut ctx = ProcessingContext::new(&self.config);
        ctx.set_mode(ProcessingMode::Replay);
        let processor = TypedStreamProcessor {
            reader: self.log.new_reader(),
            writer: TypedStreamWriter::new(self.log.clone(), self.config.producer_id),
            snapshots: self.config.snapshot_dir.clone().map(SnapshotStore::new),
            log: self.log,
            state: self.state,
            registry: self.registry,
            responses: self.responses,
            ctx,
            config: self.config,
            phase_tx,
            processed_tx,
            last_processed: UNSET_POSITION,
            last_snapshot: UNSET_POSITION,
            interrupted: false,
        };
        let task = tokio::spawn(processor.run(rx, shutdown_rx, pause_rx).instrument(span));

        StreamProcessorHandle {
            sender,
            phase,
            processed,
            shutdown_tx,
            pause_tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }
}

/// Owns one partition's state and drives records through its processors.
pub struct TypedStreamProcessor<S> {
    log: LogStream,
    reader: LogReader,
    writer: TypedStreamWriter,
    state: S,
    registry: ProcessorRegistry<S>,
    responses: Box<dyn CommandResponseWriter>,
    ctx: ProcessingContext,
    config: EngineConfig,
    snapshots: Option<SnapshotStore>,
    phase_tx: watch::Sender<Phase>,
    processed_tx: watch::Sender<i64>,
    last_processed: i64,
    last_snapshot: i64,
    /// A record's pipeline was cut short by shutdown, so the state may hold
    /// changes past `last_processed`.
    interrupted: bool,
}

impl<S> TypedStreamProcessor<S>
where
    S: SnapshotSupport + Send + 'static,
{
    /// Start wiring a processor for `log`.
    ///
    /// # Arguments
    ///
    /// * `log` - The partition log to read from and write to.
    /// * `state` - Initial (empty) state; replaced by the latest snapshot if
    ///   one exists.
    /// * `registry` - The processors, keyed by record triple.
    pub fn builder(
        log: LogStream,
        state: S,
        registry: ProcessorRegistry<S>,
    ) -> StreamProcessorBuilder<S> {
        StreamProcessorBuilder {
            log,
            state,
            registry,
            config: EngineConfig::default(),
            responses: Box::new(NoopResponseWriter),
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ProcessorMessage<S>>,
        mut shutdown: watch::Receiver<bool>,
        mut paused: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let result = self.open_and_process(&mut rx, &mut shutdown, &mut paused).await;
        if let Err(e) = &result {
            tracing::error!(
                position = self.last_processed,
                error = %e,
                "stream processor failed, closing"
            );
        }
        self.close(result.is_ok() && !self.interrupted).await;
        result
    }

    async fn open_and_process(
        &mut self,
        rx: &mut mpsc::Receiver<ProcessorMessage<S>>,
        shutdown: &mut watch::Receiver<bool>,
        paused: &mut watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        self.set_phase(Phase::Opening);
        let snapshot_position = self.recover()?;
        for processor in self.registry.processors_mut() {
            processor.on_open(&self.ctx);
        }

        self.set_phase(Phase::Replaying);
        self.replay(snapshot_position).await?;

        self.ctx.set_mode(ProcessingMode::Processing);
        self.set_phase(Phase::Processing);
        self.process_loop(rx, shutdown, paused).await
    }

    /// Restore the latest snapshot, if any.
    ///
    /// # Returns
    ///
    /// The snapshot position, or [`UNSET_POSITION`] without a snapshot.
    fn recover(&mut self) -> Result<i64, EngineError> {
        let Some(store) = &self.snapshots else {
            return Ok(UNSET_POSITION);
        };
        let Some(snapshot) = store.latest()? else {
            tracing::info!("no snapshot found, replaying from the start of the log");
            return Ok(UNSET_POSITION);
        };
        self.state.recover_from_snapshot(&snapshot.data)?;
        let position = snapshot.metadata.position;
        tracing::info!(position, "recovered state from snapshot");
        self.last_snapshot = position;
        self.mark_processed(position);
        Ok(position)
    }

    /// Rebuild state from the records the previous run already handled.
    ///
    /// Every record written while handling a record points back at it, so
    /// the highest source position in the log marks how far the previous
    /// run got. Records up to there are replayed; the ones after it are
    /// left to the processing loop.
    async fn replay(&mut self, snapshot_position: i64) -> Result<(), EngineError> {
        let end = self.log.last_position();
        self.reader.seek(snapshot_position + 1);

        let mut last_source = snapshot_position;
        let mut scan = self.reader.clone();
        while scan.next_position() <= end {
            let Some(record) = scan.next() else { break };
            last_source = last_source.max(record?.source_record_position);
        }

        let mut replayed = 0usize;
        while self.reader.next_position() <= last_source {
            let Some(record) = self.reader.next() else { break };
            let record = record?;
            self.replay_record(&record).await?;
            self.mark_processed(record.position);
            replayed += 1;
        }
        tracing::info!(replayed, last_source, end, "replay finished");
        Ok(())
    }

    async fn process_loop(
        &mut self,
        rx: &mut mpsc::Receiver<ProcessorMessage<S>>,
        shutdown: &mut watch::Receiver<bool>,
        paused: &mut watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let mut commits = self.log.subscribe();
        let mut snapshot_timer = self.config.snapshot_period.map(|period| {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer
        });

        loop {
            if *paused.borrow()
                && !self
                    .hold_while_paused(rx, shutdown, paused, &mut snapshot_timer)
                    .await
            {
                return Ok(());
            }

            commits.borrow_and_update();
            while self.reader.has_next() {
                if *shutdown.borrow() {
                    return Ok(());
                }
                if *paused.borrow() {
                    break;
                }
                let Some(record) = self.reader.next() else { break };
                let record = record?;
                if !self.process_record(&record, shutdown).await? {
                    self.interrupted = true;
                    tracing::info!(position = record.position, "shutdown interrupted a record");
                    return Ok(());
                }
                self.mark_processed(record.position);
                while let Ok(msg) = rx.try_recv() {
                    self.handle_message(msg);
                }
            }
            if *paused.borrow() {
                continue;
            }

            tokio::select! {
                _ = wait_for_shutdown(shutdown) => return Ok(()),
                _ = wait_for_flag(paused, true) => {}
                _ = commits.changed() => {}
                Some(msg) = rx.recv() => self.handle_message(msg),
                _ = tick(&mut snapshot_timer) => self.periodic_snapshot(),
            }
        }
    }

    /// Hold new records until resumed. Handle requests and periodic
    /// snapshots are still served.
    ///
    /// # Returns
    ///
    /// `false` if shutdown was requested while paused.
    async fn hold_while_paused(
        &mut self,
        rx: &mut mpsc::Receiver<ProcessorMessage<S>>,
        shutdown: &mut watch::Receiver<bool>,
        paused: &mut watch::Receiver<bool>,
        snapshot_timer: &mut Option<Interval>,
    ) -> bool {
        self.set_phase(Phase::Paused);
        for processor in self.registry.processors_mut() {
            processor.on_paused();
        }
        tracing::info!(position = self.last_processed, "processing paused");

        loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown) => return false,
                _ = wait_for_flag(paused, false) => break,
                Some(msg) = rx.recv() => self.handle_message(msg),
                _ = tick(snapshot_timer) => self.periodic_snapshot(),
            }
        }

        for processor in self.registry.processors_mut() {
            processor.on_resumed();
        }
        self.set_phase(Phase::Processing);
        tracing::info!(position = self.last_processed, "processing resumed");
        true
    }

    fn periodic_snapshot(&mut self) {
        if let Err(e) = self.take_snapshot() {
            tracing::error!(error = %e, "periodic snapshot failed");
        }
    }

    /// Run the full pipeline for one record: process, side effects, write,
    /// update state, then await deferred sub-tasks.
    ///
    /// # Returns
    ///
    /// `false` if shutdown was requested while a step was being retried.
    /// The record then counts as not processed, although `process` may
    /// already have changed the state.
    async fn process_record(
        &mut self,
        record: &Record,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, EngineError> {
        let triple = RecordTriple::of(record);
        let Some(processor) = self.registry.get_mut(&triple) else {
            tracing::trace!(position = record.position, %triple, "no processor registered");
            return Ok(true);
        };
        tracing::debug!(position = record.position, %triple, "processing record");

        processor.process(record, &mut self.state, &mut self.ctx)?;

        while !processor.execute_side_effects(self.responses.as_mut()) {
            tracing::warn!(position = record.position, "side effects failed, retrying");
            if !retry_pause(self.config.retry_delay, shutdown).await {
                return Ok(false);
            }
        }

        self.writer.set_source_position(record.position);
        loop {
            match processor.write_records(&mut self.writer) {
                Ok(()) => break,
                Err(e @ WriteError::Backpressure { .. }) => {
                    tracing::warn!(
                        position = record.position,
                        error = %e,
                        "follow-up write rejected, retrying"
                    );
                    if !retry_pause(self.config.retry_delay, shutdown).await {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        processor.update_state(&mut self.state);
        self.await_sub_tasks().await?;
        Ok(true)
    }

    /// Replay one record: process and update state, nothing else.
    async fn replay_record(&mut self, record: &Record) -> Result<(), EngineError> {
        let triple = RecordTriple::of(record);
        let Some(processor) = self.registry.get_mut(&triple) else {
            return Ok(());
        };
        processor.process(record, &mut self.state, &mut self.ctx)?;
        processor.update_state(&mut self.state);
        self.await_sub_tasks().await
    }

    async fn await_sub_tasks(&mut self) -> Result<(), EngineError> {
        for task in self.ctx.take_pending() {
            task.await?;
        }
        Ok(())
    }

    fn handle_message(&mut self, msg: ProcessorMessage<S>) {
        match msg {
            ProcessorMessage::Inspect(f) => f(&self.state),
            ProcessorMessage::Snapshot { reply } => {
                let _ = reply.send(self.take_snapshot());
            }
        }
    }

    /// Snapshot the state as of the last processed record.
    ///
    /// # Returns
    ///
    /// The snapshot position, or `None` if snapshots are disabled or nothing
    /// has been processed yet.
    fn take_snapshot(&mut self) -> Result<Option<i64>, EngineError> {
        let Some(store) = &self.snapshots else {
            return Ok(None);
        };
        let position = self.last_processed;
        if position < 1 {
            return Ok(None);
        }
        if position == self.last_snapshot {
            return Ok(Some(position));
        }

        let snapshot = Snapshot::take(&self.state, position)?;
        store.save(&snapshot)?;
        self.last_snapshot = position;
        tracing::info!(position, "snapshot taken");

        if let Err(e) = store.retain_latest(self.config.snapshots_to_keep.max(1)) {
            tracing::warn!(error = %e, "failed to delete old snapshots");
        }
        Ok(Some(position))
    }

    async fn close(&mut self, clean: bool) {
        self.set_phase(Phase::Closing);

        let pending = self.ctx.take_pending();
        if !pending.is_empty() {
            let drain = async {
                for task in pending {
                    if let Err(e) = task.await {
                        tracing::warn!(error = %e, "sub-task failed during close");
                    }
                }
            };
            if tokio::time::timeout(self.config.close_timeout, drain).await.is_err() {
                tracing::warn!("timed out draining sub-tasks on close");
            }
        }

        if clean && let Err(e) = self.take_snapshot() {
            tracing::warn!(error = %e, "failed to take snapshot on close");
        }
        for processor in self.registry.processors_mut() {
            processor.on_close();
        }
        self.set_phase(Phase::Closed);
        tracing::info!(position = self.last_processed, "stream processor closed");
    }

    fn set_phase(&self, phase: Phase) {
        tracing::debug!(?phase, "phase changed");
        self.phase_tx.send_replace(phase);
    }

    fn mark_processed(&mut self, position: i64) {
        self.last_processed = position;
        self.processed_tx.send_replace(position);
    }
}

/// Completes once `flag` holds `value`; never completes if every sender
/// was dropped first.
pub(crate) async fn wait_for_flag(flag: &mut watch::Receiver<bool>, value: bool) {
    if flag.wait_for(|v| *v == value).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Completes once shutdown is requested.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    wait_for_flag(shutdown, true).await
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Sleep for `delay` unless shutdown is requested first.
///
/// # Returns
///
/// `false` if shutdown was requested.
async fn retry_pause(delay: std::time::Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = wait_for_shutdown(shutdown) => false,
    }
}

/// Async handle to a running [`TypedStreamProcessor`].
///
/// `Clone` is cheap. Dropping every handle does **not** stop the processor;
/// call [`close`](StreamProcessorHandle::close).
pub struct StreamProcessorHandle<S> {
    sender: mpsc::Sender<ProcessorMessage<S>>,
    phase: watch::Receiver<Phase>,
    processed: watch::Receiver<i64>,
    shutdown_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<Result<(), EngineError>>>>>,
}

// Manual `Clone`: `S` itself need not be `Clone`.
impl<S> Clone for StreamProcessorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            phase: self.phase.clone(),
            processed: self.processed.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            pause_tx: self.pause_tx.clone(),
            task: Arc::clone(&self.task),
        }
    }
}

impl<S: Send + 'static> StreamProcessorHandle<S> {
    /// The current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Wait until the processor is in `phase`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskGone`] if the processor stopped without
    /// reaching `phase`.
    pub async fn wait_for_phase(&self, phase: Phase) -> Result<(), EngineError> {
        let mut rx = self.phase.clone();
        rx.wait_for(|p| *p == phase)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::TaskGone(TASK_NAME))
    }

    /// Position of the last record whose pipeline completed, or of the
    /// recovered snapshot.
    pub fn last_processed_position(&self) -> i64 {
        *self.processed.borrow()
    }

    /// Wait until the record at `position` has been processed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskGone`] if the processor stopped first.
    pub async fn wait_for_position(&self, position: i64) -> Result<(), EngineError> {
        let mut rx = self.processed.clone();
        rx.wait_for(|p| *p >= position)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::TaskGone(TASK_NAME))
    }

    /// Run `f` against the current state on the processor task.
    ///
    /// The closure runs between records, never while one is in flight.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskGone`] if the processor has stopped.
    pub async fn with_state<R, F>(&self, f: F) -> Result<R, EngineError>
    where
        R: Send + 'static,
        F: FnOnce(&S) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let inspect = Box::new(move |state: &S| {
            let _ = tx.send(f(state));
        });
        self.sender
            .send(ProcessorMessage::Inspect(inspect))
            .await
            .map_err(|_| EngineError::TaskGone(TASK_NAME))?;
        rx.await.map_err(|_| EngineError::TaskGone(TASK_NAME))
    }

    /// Take a snapshot as of the last processed record.
    ///
    /// # Returns
    ///
    /// The snapshot position, or `None` if snapshots are disabled or nothing
    /// was processed yet.
    ///
    /// # Errors
    ///
    /// * [`EngineError::Snapshot`] / [`EngineError::Io`] if writing failed.
    /// * [`EngineError::TaskGone`] if the processor has stopped.
    pub async fn take_snapshot(&self) -> Result<Option<i64>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(ProcessorMessage::Snapshot { reply })
            .await
            .map_err(|_| EngineError::TaskGone(TASK_NAME))?;
        rx.await.map_err(|_| EngineError::TaskGone(TASK_NAME))?
    }

    /// Stop handling new records until [`resume`](Self::resume) is called.
    ///
    /// Replay is never paused; a processor paused while opening finishes
    /// replay first. State can still be inspected and snapshots taken.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskGone`] if the processor stopped before it
    /// paused.
    pub async fn pause(&self) -> Result<(), EngineError> {
        self.pause_tx.send_replace(true);
        self.wait_for_phase(Phase::Paused).await
    }

    /// Continue handling records after [`pause`](Self::pause).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskGone`] if the processor stopped first.
    pub async fn resume(&self) -> Result<(), EngineError> {
        self.pause_tx.send_replace(false);
        self.wait_for_phase(Phase::Processing).await
    }

    /// Stop the processor and wait for it to close.
    ///
    /// In-flight sub-tasks get up to
    /// [`EngineConfig::close_timeout`] to finish, and a final snapshot is
    /// taken if snapshots are enabled and no record was cut short.
    /// Calling `close` more than once is safe; later calls return `Ok(())`
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the processor, if any.
    pub async fn close(&self) -> Result<(), EngineError> {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle.await.map_err(|e| EngineError::TaskPanicked {
                task: TASK_NAME,
                message: e.to_string(),
            })?,
            None => Ok(()),
        }
    }
}
