#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::BytesMut;
use logfold::{
    AcceptedCommand, CommandControl, CommandProcessor, ComposedSnapshot, EngineError,
    EntityCategory, Exporter, ExporterController, ExporterError, ExporterIntent, JobIntent,
    KeyGenerator, LogStream, LongIndex, ProcessorRegistry, Record, RejectionType,
    RequestMetadata, SnapshotError, SnapshotSupport, TypedStreamWriter, UnwrittenRecord,
};
use serde_json::json;
use tokio::sync::mpsc;

/// Jobs by key, valued with their remaining retries.
#[derive(Debug, Clone, PartialEq)]
pub struct Jobs {
    pub keys: KeyGenerator,
    pub retries: LongIndex,
}

impl Default for Jobs {
    fn default() -> Self {
        Self {
            keys: KeyGenerator::for_category(1, EntityCategory::Job),
            retries: LongIndex::new(),
        }
    }
}

impl Jobs {
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.write_snapshot(&mut buf).expect("snapshot");
        buf.to_vec()
    }
}

impl SnapshotSupport for Jobs {
    fn write_snapshot(&self, out: &mut BytesMut) -> Result<(), SnapshotError> {
        ComposedSnapshot::write(out, &[("keys", &self.keys), ("retries", &self.retries)])
    }

    fn recover_from_snapshot(&mut self, input: &[u8]) -> Result<(), SnapshotError> {
        let composed = ComposedSnapshot::parse(input)?;
        composed.recover("keys", &mut self.keys)?;
        composed.recover("retries", &mut self.retries)
    }
}

fn job_keys(jobs: &mut Jobs) -> &mut KeyGenerator {
    &mut jobs.keys
}

struct CreateJob;

impl CommandProcessor<Jobs> for CreateJob {
    fn on_command(
        &mut self,
        command: &Record,
        control: &mut CommandControl<'_, Jobs>,
    ) -> Result<(), EngineError> {
        match command.value.get("retries").and_then(|r| r.as_i64()) {
            Some(retries) if retries >= 0 => {
                control.accept(JobIntent::Created);
            }
            _ => control.reject(RejectionType::InvalidArgument, "retries must be >= 0"),
        }
        Ok(())
    }

    fn on_accepted(&mut self, accepted: &AcceptedCommand, state: &mut Jobs) {
        let retries = accepted.value["retries"].as_i64().unwrap_or_default();
        state.retries.insert(accepted.key, retries);
    }
}

struct FailJob;

impl CommandProcessor<Jobs> for FailJob {
    fn on_command(
        &mut self,
        command: &Record,
        control: &mut CommandControl<'_, Jobs>,
    ) -> Result<(), EngineError> {
        match control.state().retries.get(command.key) {
            Some(retries) if retries > 0 => {
                control.accept(JobIntent::Failed);
            }
            Some(_) => control.reject(RejectionType::InvalidState, "no retries left"),
            None => control.reject(RejectionType::NotFound, format!("no job {}", command.key)),
        }
        Ok(())
    }

    fn on_accepted(&mut self, accepted: &AcceptedCommand, state: &mut Jobs) {
        if let Some(retries) = state.retries.get(accepted.key) {
            state.retries.insert(accepted.key, retries - 1);
        }
    }
}

pub fn job_registry() -> ProcessorRegistry<Jobs> {
    ProcessorRegistry::new()
        .on_command(JobIntent::Create, CreateJob, job_keys)
        .and_then(|r| r.on_command(JobIntent::Fail, FailJob, job_keys))
        .expect("job processors register once")
}

pub fn create_job(client: &mut TypedStreamWriter, retries: i64, request_id: i64) -> i64 {
    client
        .write_new_command(
            JobIntent::Create,
            json!({ "retries": retries }),
            Some(RequestMetadata {
                request_id,
                request_stream_id: 1,
            }),
        )
        .expect("client write")
}

pub fn fail_job(client: &mut TypedStreamWriter, key: i64) -> i64 {
    client
        .write(UnwrittenRecord::command(key, JobIntent::Fail, json!({})))
        .expect("client write")
}

/// Append `n` job events.
pub fn append_events(log: &LogStream, n: usize) -> Vec<i64> {
    let mut writer = TypedStreamWriter::new(log.clone(), 7);
    (0..n)
        .map(|i| {
            writer
                .write(UnwrittenRecord::event(i as i64, JobIntent::Created, json!({ "n": i })))
                .expect("write")
        })
        .collect()
}

/// Append `n` bookkeeping records no exporter ever sees.
pub fn append_bookkeeping(log: &LogStream, n: usize) {
    let mut writer = TypedStreamWriter::new(log.clone(), 7);
    for _ in 0..n {
        writer
            .write(UnwrittenRecord::event(-1, ExporterIntent::PositionUpdated, json!({})))
            .expect("write");
    }
}

/// Observes and steers a [`Recorder`] from the test.
pub struct Deliveries {
    pub delivered: mpsc::UnboundedReceiver<i64>,
    pub failing: Arc<AtomicBool>,
    pub attempts: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
}

impl Deliveries {
    pub async fn next(&mut self) -> i64 {
        self.delivered.recv().await.expect("exporter dropped")
    }

    pub fn drain(&mut self) -> Vec<i64> {
        let mut positions = Vec::new();
        while let Ok(p) = self.delivered.try_recv() {
            positions.push(p);
        }
        positions
    }
}

/// Records every exported position and acknowledges up to a cap.
pub struct Recorder {
    tx: mpsc::UnboundedSender<i64>,
    failing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    ack_up_to: i64,
    ack_on_close: Option<i64>,
    controller: Option<ExporterController>,
}

impl Recorder {
    pub fn new() -> (Self, Deliveries) {
        let (tx, delivered) = mpsc::unbounded_channel();
        let failing = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                failing: Arc::clone(&failing),
                attempts: Arc::clone(&attempts),
                closes: Arc::clone(&closes),
                ack_up_to: i64::MAX,
                ack_on_close: None,
                controller: None,
            },
            Deliveries {
                delivered,
                failing,
                attempts,
                closes,
            },
        )
    }

    /// Never acknowledge positions above `position`.
    pub fn ack_up_to(mut self, position: i64) -> Self {
        self.ack_up_to = position;
        self
    }

    /// Acknowledge `position` from the close hook.
    pub fn ack_on_close(mut self, position: i64) -> Self {
        self.ack_on_close = Some(position);
        self
    }
}

impl Exporter for Recorder {
    fn open(&mut self, controller: ExporterController) -> Result<(), ExporterError> {
        self.controller = Some(controller);
        Ok(())
    }

    fn export(&mut self, record: &Record) -> Result<(), ExporterError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ExporterError::new("sink unavailable"));
        }
        let _ = self.tx.send(record.position);
        if record.position <= self.ack_up_to
            && let Some(controller) = &self.controller
        {
            controller.update_last_exported_record_position(record.position);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if let (Some(position), Some(controller)) = (self.ack_on_close, &self.controller) {
            controller.update_last_exported_record_position(position);
        }
    }
}
