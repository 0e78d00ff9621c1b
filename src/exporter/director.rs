//! Delivery of committed records to every configured exporter.
//!
//! The director runs as one tokio task per partition. Each exporter has its
//! own cursor into the log, starting after its acknowledged position, so a
//! failing exporter only holds back itself: the director keeps handing it
//! the same record after every retry interval while the others move on.
//! Acknowledged positions are flushed to the [`ExporterPositionStore`]
//! periodically and on shutdown. Delivery can be paused, or soft-paused so
//! records still flow but acknowledgements are dropped.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use super::{Exporter, ExporterContext, ExporterController, ExporterPositionStore, RecordFilter};
use crate::config::ExporterDirectorConfig;
use crate::error::{EngineError, ExporterError};
use crate::log::LogStream;
use crate::record::{Record, UNSET_POSITION};
use crate::stream_processor::wait_for_shutdown;

const TASK_NAME: &str = "exporter director";

/// Entry point for wiring up exporters.
///
/// # Examples
///
/// ```no_run
/// # async fn demo(sink: impl logfold::Exporter + 'static) -> Result<(), logfold::EngineError> {
/// use logfold::{ExporterDirector, ExporterPositionStore, LogStream};
///
/// let log = LogStream::new(1);
/// let handle = ExporterDirector::builder(log, ExporterPositionStore::in_memory())
///     .exporter("sink", sink)
///     .start()?;
/// handle.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct ExporterDirector;

impl ExporterDirector {
    /// Start wiring a director that reads `log` and keeps positions in
    /// `positions`.
    pub fn builder(log: LogStream, positions: ExporterPositionStore) -> ExporterDirectorBuilder {
        ExporterDirectorBuilder {
            log,
            positions,
            config: ExporterDirectorConfig::default(),
            exporters: Vec::new(),
            phase: ExportPhase::Exporting,
        }
    }
}

/// Whether the director hands records to its exporters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportPhase {
    /// Records are delivered and acknowledgements are kept.
    #[default]
    Exporting,
    /// No record is delivered. Exporters are still opened and their
    /// scheduled tasks still run.
    Paused,
    /// Records are delivered but acknowledgements are dropped, so after a
    /// restart delivery starts again from the last kept position.
    SoftPaused,
}

/// Collects exporters and settings for an [`ExporterDirector`].
pub struct ExporterDirectorBuilder {
    log: LogStream,
    positions: ExporterPositionStore,
    config: ExporterDirectorConfig,
    exporters: Vec<(String, Value, Box<dyn Exporter>)>,
    phase: ExportPhase,
}

impl ExporterDirectorBuilder {
    /// Replace the default [`ExporterDirectorConfig`].
    pub fn config(mut self, config: ExporterDirectorConfig) -> Self {
        self.config = config;
        self
    }

    /// The phase the director starts in. Defaults to
    /// [`ExportPhase::Exporting`].
    pub fn phase(mut self, phase: ExportPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Add an exporter without configuration arguments.
    pub fn exporter(self, id: impl Into<String>, exporter: impl Exporter + 'static) -> Self {
        self.exporter_with_args(id, Value::Null, exporter)
    }

    /// Add an exporter; `arguments` are available from
    /// [`ExporterContext::configuration`] during `configure`.
    pub fn exporter_with_args(
        mut self,
        id: impl Into<String>,
        arguments: Value,
        exporter: impl Exporter + 'static,
    ) -> Self {
        self.exporters.push((id.into(), arguments, Box::new(exporter)));
        self
    }

    /// Configure every exporter and spawn the director task.
    ///
    /// Positions stored for exporter ids that are not configured any more
    /// are removed, so they stop holding back [`lowest_position`].
    /// Configured exporters without a stored position are registered at
    /// [`UNSET_POSITION`], so they hold it back until they acknowledge.
    ///
    /// [`lowest_position`]: ExporterPositionStore::lowest_position
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ExporterConfiguration`] if an id is used twice
    /// or an exporter's `configure` fails. Nothing is spawned then.
    pub fn start(self) -> Result<ExporterDirectorHandle, EngineError> {
        let partition_id = self.log.partition_id();
        let wake = Arc::new(Notify::new());
        let acks_suspended = Arc::new(AtomicBool::new(self.phase == ExportPhase::SoftPaused));
        let mut ids = HashSet::new();
        let mut containers = Vec::with_capacity(self.exporters.len());

        for (id, arguments, mut exporter) in self.exporters {
            if !ids.insert(id.clone()) {
                return Err(EngineError::ExporterConfiguration {
                    id,
                    source: ExporterError::new("exporter id is already in use"),
                });
            }
            let mut context = ExporterContext::new(id.clone(), partition_id, arguments);
            if let Err(source) = exporter.configure(&mut context) {
                return Err(EngineError::ExporterConfiguration { id, source });
            }
            let controller = ExporterController::new(
                &id,
                self.positions.clone(),
                Arc::clone(&wake),
                Arc::clone(&acks_suspended),
            );
            containers.push(ExporterContainer {
                last_delivered: controller.last_exported_position(),
                id,
                exporter,
                filter: context.into_filter(),
                controller,
                status: Status::Opening,
                retry_at: None,
            });
        }

        for stale in self.positions.ids() {
            if !ids.contains(&stale) {
                tracing::info!(exporter_id = %stale, "removing position of unconfigured exporter");
                self.positions.remove(&stale);
            }
        }
        for id in &ids {
            if self.positions.get(id).is_none() {
                self.positions.set(id, UNSET_POSITION);
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (phase_tx, phase_rx) = watch::channel(self.phase);
        let director = DirectorTask {
            commits: self.log.subscribe(),
            phase: phase_rx,
            log: self.log,
            positions: self.positions.clone(),
            config: self.config,
            containers,
            wake,
        };
        let span = tracing::info_span!("exporter_director", partition_id);
        let task = tokio::spawn(director.run(shutdown_rx).instrument(span));

        Ok(ExporterDirectorHandle {
            positions: self.positions,
            shutdown_tx,
            phase_tx,
            acks_suspended,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Opening,
    Open,
    Closed,
}

/// Outcome of one delivery round for one exporter.
#[derive(Debug, PartialEq, Eq)]
enum Pump {
    /// The batch was used up; more records may be waiting.
    More,
    /// Nothing to do until new records arrive or a retry is due.
    Idle,
}

/// Records decoded during one delivery round, shared by every exporter
/// whose cursor reaches them.
struct RoundReads<'a> {
    log: &'a LogStream,
    decoded: HashMap<i64, Record>,
}

impl<'a> RoundReads<'a> {
    fn new(log: &'a LogStream) -> Self {
        Self {
            log,
            decoded: HashMap::new(),
        }
    }

    /// The first record after `position`, decoded at most once per round.
    fn after(&mut self, position: i64) -> Option<Result<&Record, EngineError>> {
        let next = position.max(0) + 1;
        let record = match self.decoded.entry(next) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => match self.log.read(next)? {
                Ok(record) => slot.insert(record),
                Err(e) => return Some(Err(e)),
            },
        };
        Some(Ok(&*record))
    }
}

struct ExporterContainer {
    id: String,
    exporter: Box<dyn Exporter>,
    filter: RecordFilter,
    controller: ExporterController,
    status: Status,
    /// Position of the last record handed to (or skipped for) the exporter.
    last_delivered: i64,
    retry_at: Option<Instant>,
}

impl ExporterContainer {
    fn waiting(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|at| at > now)
    }

    fn try_open(&mut self, now: Instant, config: &ExporterDirectorConfig) {
        if self.status != Status::Opening || self.waiting(now) {
            return;
        }
        match self.exporter.open(self.controller.clone()) {
            Ok(()) => {
                tracing::info!(
                    exporter_id = %self.id,
                    position = self.last_delivered,
                    "exporter opened"
                );
                self.status = Status::Open;
                self.retry_at = None;
            }
            Err(e) => {
                tracing::warn!(exporter_id = %self.id, error = %e, "failed to open exporter, retrying");
                self.retry_at = Some(now + config.retry_interval);
            }
        }
    }

    /// Hand up to `batch_size` records to the exporter.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Decode`] for a record that cannot be decoded.
    fn pump(
        &mut self,
        reads: &mut RoundReads<'_>,
        now: Instant,
        config: &ExporterDirectorConfig,
    ) -> Result<Pump, EngineError> {
        if self.status != Status::Open || self.waiting(now) {
            return Ok(Pump::Idle);
        }
        self.retry_at = None;

        for _ in 0..config.batch_size.max(1) {
            let Some(next) = reads.after(self.last_delivered) else {
                return Ok(Pump::Idle);
            };
            let record = next?;

            if !self.filter.accepts(record) {
                // Nothing is outstanding, so the skipped record counts as handled.
                if self.controller.last_exported_position() == self.last_delivered {
                    self.controller
                        .update_last_exported_record_position(record.position);
                }
                self.last_delivered = record.position;
                continue;
            }

            match self.exporter.export(record) {
                Ok(()) => {
                    tracing::debug!(exporter_id = %self.id, position = record.position, "record exported");
                    self.last_delivered = record.position;
                }
                Err(e) => {
                    tracing::warn!(
                        exporter_id = %self.id,
                        position = record.position,
                        error = %e,
                        "export failed, retrying"
                    );
                    self.retry_at = Some(now + config.retry_interval);
                    return Ok(Pump::Idle);
                }
            }
        }
        Ok(Pump::More)
    }

    fn close(&mut self) {
        self.controller.clear_tasks();
        if self.status == Status::Open {
            self.exporter.close();
            tracing::info!(
                exporter_id = %self.id,
                position = self.controller.last_exported_position(),
                "exporter closed"
            );
        }
        self.status = Status::Closed;
    }
}

struct DirectorTask {
    log: LogStream,
    commits: watch::Receiver<i64>,
    phase: watch::Receiver<ExportPhase>,
    positions: ExporterPositionStore,
    config: ExporterDirectorConfig,
    containers: Vec<ExporterContainer>,
    wake: Arc<Notify>,
}

impl DirectorTask {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        tracing::info!(exporters = self.containers.len(), "exporter director started");
        let result = self.deliver(&mut shutdown).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "exporter director failed, closing exporters");
        }

        for container in &mut self.containers {
            container.close();
        }
        let flushed = self.positions.flush();
        tracing::info!(lowest_position = ?self.positions.lowest_position(), "exporter director closed");
        result?;
        Ok(flushed?)
    }

    async fn deliver(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), EngineError> {
        let mut next_flush = Instant::now() + self.config.flush_interval;
        let mut phase = *self.phase.borrow();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            self.commits.borrow_and_update();
            let now = Instant::now();
            let current = *self.phase.borrow_and_update();
            if current != phase {
                tracing::info!(from = ?phase, to = ?current, "export phase changed");
                phase = current;
            }

            for container in &mut self.containers {
                container.try_open(now, &self.config);
                if container.status == Status::Open {
                    container.controller.run_due_tasks(now);
                }
            }

            while phase != ExportPhase::Paused {
                let more = {
                    let mut reads = RoundReads::new(&self.log);
                    let mut more = false;
                    for container in &mut self.containers {
                        more |= container.pump(&mut reads, now, &self.config)? == Pump::More;
                    }
                    more
                };
                if !more || *shutdown.borrow() {
                    break;
                }
                tokio::task::yield_now().await;
            }

            if now >= next_flush {
                if let Err(e) = self.positions.flush() {
                    tracing::warn!(error = %e, "failed to flush exporter positions");
                }
                next_flush = now + self.config.flush_interval;
            }

            let deadline = self
                .containers
                .iter()
                .filter_map(|c| {
                    let task_due = (c.status == Status::Open)
                        .then(|| c.controller.next_due())
                        .flatten();
                    // Export retries wait for the resume while paused.
                    let retry_at = c
                        .retry_at
                        .filter(|_| phase != ExportPhase::Paused || c.status == Status::Opening);
                    match (retry_at, task_due) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    }
                })
                .fold(next_flush, Instant::min);

            tokio::select! {
                _ = wait_for_shutdown(shutdown) => {}
                _ = self.commits.changed() => {}
                _ = phase_changed(&mut self.phase) => {}
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}

/// Completes on the next phase change; never completes once every handle is
/// gone.
async fn phase_changed(phase: &mut watch::Receiver<ExportPhase>) {
    if phase.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Handle to a running exporter director.
///
/// `Clone` is cheap. Dropping every handle does **not** stop the director;
/// call [`shutdown`](ExporterDirectorHandle::shutdown).
#[derive(Clone)]
pub struct ExporterDirectorHandle {
    positions: ExporterPositionStore,
    shutdown_tx: watch::Sender<bool>,
    phase_tx: watch::Sender<ExportPhase>,
    acks_suspended: Arc<AtomicBool>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<Result<(), EngineError>>>>>,
}

impl ExporterDirectorHandle {
    /// The position store the director acknowledges into.
    pub fn positions(&self) -> &ExporterPositionStore {
        &self.positions
    }

    pub fn export_phase(&self) -> ExportPhase {
        *self.phase_tx.borrow()
    }

    /// Stop handing records to exporters until
    /// [`resume_exporting`](Self::resume_exporting).
    pub fn pause_exporting(&self) {
        self.set_phase(ExportPhase::Paused);
    }

    /// Keep delivering records but drop every acknowledgement until
    /// [`resume_exporting`](Self::resume_exporting).
    pub fn soft_pause_exporting(&self) {
        self.set_phase(ExportPhase::SoftPaused);
    }

    /// Deliver and acknowledge again. Exporters that are still opening
    /// get records once `open` succeeds.
    pub fn resume_exporting(&self) {
        self.set_phase(ExportPhase::Exporting);
    }

    fn set_phase(&self, phase: ExportPhase) {
        self.acks_suspended
            .store(phase == ExportPhase::SoftPaused, Ordering::Release);
        self.phase_tx.send_replace(phase);
    }

    /// Close every exporter, flush positions, and wait for the task to end.
    ///
    /// Calling `shutdown` more than once is safe; later calls return
    /// `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the director, if any, or the final
    /// flush failure.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
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

    /// `true` once the director task has stopped, on shutdown or failure.
    pub async fn is_finished(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_none_or(|task| task.is_finished())
    }
}
