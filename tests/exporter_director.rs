mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use common::{Recorder, append_bookkeeping, append_events};
use logfold::{
    DecodeError, EngineError, ExportPhase, Exporter, ExporterContext, ExporterController,
    ExporterDirector, ExporterDirectorConfig, ExporterError, ExporterPositionStore, JobIntent,
    LogStream, Record, RecordFilter, RecordKind, ScheduledTask, UNSET_POSITION, UnwrittenRecord,
    encode,
};
use serde::Deserialize;
use serde_json::json;

fn fast_retries() -> ExporterDirectorConfig {
    ExporterDirectorConfig {
        retry_interval: Duration::from_millis(50),
        ..ExporterDirectorConfig::default()
    }
}

/// Job events at 10, 20 and 30; bookkeeping records everywhere else.
fn three_records_at_tens(log: &LogStream) -> Vec<i64> {
    let mut positions = Vec::new();
    for _ in 0..3 {
        append_bookkeeping(log, 9);
        positions.extend(append_events(log, 1));
    }
    positions
}

#[tokio::test]
async fn restart_resumes_each_exporter_after_its_own_checkpoint() {
    let dir = tempfile::tempdir().expect("failed to create tmpdir");
    let log = LogStream::new(1);
    let positions = three_records_at_tens(&log);
    assert_eq!(positions, vec![10, 20, 30]);

    let (e1, mut p1) = Recorder::new();
    let (e2, mut p2) = Recorder::new();
    let store = ExporterPositionStore::open(dir.path()).expect("open store");
    let director = ExporterDirector::builder(log.clone(), store)
        .exporter("e1", e1.ack_up_to(20))
        .exporter("e2", e2.ack_up_to(UNSET_POSITION))
        .start()
        .expect("start");
    for expected in [10, 20, 30] {
        assert_eq!(p1.next().await, expected);
        assert_eq!(p2.next().await, expected);
    }
    director.shutdown().await.expect("shutdown");

    let (e1, mut p1) = Recorder::new();
    let (e2, mut p2) = Recorder::new();
    let store = ExporterPositionStore::open(dir.path()).expect("reopen store");
    assert!(store.get("e1").is_some_and(|p| (20..30).contains(&p)));
    assert!(store.get("e2").is_none_or(|p| p < 10));
    let director = ExporterDirector::builder(log.clone(), store)
        .exporter("e1", e1)
        .exporter("e2", e2)
        .start()
        .expect("restart");

    assert_eq!(p1.next().await, 30);
    for expected in [10, 20, 30] {
        assert_eq!(p2.next().await, expected);
    }
    director.shutdown().await.expect("shutdown");
    assert!(p1.drain().is_empty(), "e1 must not see records it acknowledged");
    assert_eq!(director.positions().get("e1"), Some(30));
    assert_eq!(director.positions().get("e2"), Some(30));
}

#[tokio::test(start_paused = true)]
async fn failing_exporter_does_not_hold_back_the_others() {
    let log = LogStream::new(1);
    let first = append_events(&log, 3);

    let (broken, broken_deliveries) = Recorder::new();
    broken_deliveries.failing.store(true, Ordering::SeqCst);
    let (healthy, mut healthy_deliveries) = Recorder::new();
    let director = ExporterDirector::builder(log.clone(), ExporterPositionStore::in_memory())
        .config(fast_retries())
        .exporter("broken", broken)
        .exporter("healthy", healthy)
        .start()
        .expect("start");

    for expected in &first {
        assert_eq!(healthy_deliveries.next().await, *expected);
    }
    // The log keeps growing while one exporter is stuck.
    let more = append_events(&log, 2);
    for expected in &more {
        assert_eq!(healthy_deliveries.next().await, *expected);
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(broken_deliveries.attempts.load(Ordering::SeqCst) >= 5);
    assert_eq!(director.positions().get("broken"), Some(UNSET_POSITION));
    assert_eq!(director.positions().get("healthy"), Some(more[1]));
    // The stuck exporter still holds back what may be compacted.
    assert_eq!(director.positions().lowest_position(), Some(UNSET_POSITION));
    director.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn failed_record_is_retried_without_skipping() {
    let log = LogStream::new(1);
    let positions = append_events(&log, 3);

    let (exporter, mut deliveries) = Recorder::new();
    deliveries.failing.store(true, Ordering::SeqCst);
    let director = ExporterDirector::builder(log.clone(), ExporterPositionStore::in_memory())
        .config(fast_retries())
        .exporter("sink", exporter)
        .start()
        .expect("start");

    tokio::time::sleep(Duration::from_millis(175)).await;
    let attempts = deliveries.attempts.load(Ordering::SeqCst);
    assert!(attempts >= 3, "expected retries, saw {attempts} attempts");
    assert!(deliveries.drain().is_empty());

    deliveries.failing.store(false, Ordering::SeqCst);
    for expected in &positions {
        assert_eq!(deliveries.next().await, *expected);
    }
    director.shutdown().await.expect("shutdown");
    assert_eq!(deliveries.closes.load(Ordering::SeqCst), 1);
}

/// Only takes events.
struct EventsOnly {
    inner: Recorder,
}

impl Exporter for EventsOnly {
    fn configure(&mut self, context: &mut ExporterContext) -> Result<(), ExporterError> {
        context.set_filter(RecordFilter::all().with_kind(RecordKind::Event));
        Ok(())
    }

    fn open(&mut self, controller: ExporterController) -> Result<(), ExporterError> {
        self.inner.open(controller)
    }

    fn export(&mut self, record: &Record) -> Result<(), ExporterError> {
        self.inner.export(record)
    }
}

#[tokio::test]
async fn filtered_records_advance_an_up_to_date_position() {
    let log = LogStream::new(1);
    let events = append_events(&log, 1);
    let mut client = logfold::TypedStreamWriter::new(log.clone(), 1);
    let mut commands = Vec::new();
    for _ in 0..3 {
        commands.push(
            client
                .write(UnwrittenRecord::command(-1, JobIntent::Create, json!({})))
                .expect("write"),
        );
    }

    let (inner, mut deliveries) = Recorder::new();
    let director = ExporterDirector::builder(log.clone(), ExporterPositionStore::in_memory())
        .exporter("events", EventsOnly { inner })
        .start()
        .expect("start");
    assert_eq!(deliveries.next().await, events[0]);

    let last_command = commands[2];
    while director.positions().get("events") != Some(last_command) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    director.shutdown().await.expect("shutdown");
    assert!(deliveries.drain().is_empty(), "commands are filtered out");
}

#[derive(Debug, Deserialize)]
struct BatchingConfig {
    flush_after_ms: u64,
}

/// Acknowledges in batches from a scheduled task, and keeps the batch
/// count in metadata.
struct Batching {
    flush_after: Duration,
    pending: Arc<std::sync::Mutex<Option<i64>>>,
    scheduled: Option<ScheduledTask>,
    flushes: Arc<AtomicUsize>,
    restored_metadata: Arc<std::sync::Mutex<Option<Vec<u8>>>>,
    controller: Option<ExporterController>,
}

impl Batching {
    fn new() -> Self {
        Self {
            flush_after: Duration::ZERO,
            pending: Arc::default(),
            scheduled: None,
            flushes: Arc::default(),
            restored_metadata: Arc::default(),
            controller: None,
        }
    }
}

impl Exporter for Batching {
    fn configure(&mut self, context: &mut ExporterContext) -> Result<(), ExporterError> {
        let config: BatchingConfig = context.configuration()?;
        self.flush_after = Duration::from_millis(config.flush_after_ms);
        Ok(())
    }

    fn open(&mut self, controller: ExporterController) -> Result<(), ExporterError> {
        *self.restored_metadata.lock().expect("lock") = controller.read_metadata();
        self.controller = Some(controller);
        Ok(())
    }

    fn export(&mut self, record: &Record) -> Result<(), ExporterError> {
        let Some(controller) = &self.controller else {
            return Err(ExporterError::new("not open"));
        };
        let batch_started = self
            .pending
            .lock()
            .expect("lock")
            .replace(record.position)
            .is_none();
        if batch_started {
            let pending = Arc::clone(&self.pending);
            let flushes = Arc::clone(&self.flushes);
            let task = controller.schedule_task(self.flush_after, move |controller| {
                if let Some(position) = pending.lock().expect("lock").take() {
                    let n = flushes.fetch_add(1, Ordering::SeqCst) + 1;
                    controller.update_last_exported_record_position_with_metadata(
                        position,
                        format!("flushes={n}").into_bytes(),
                    );
                }
            });
            self.scheduled = Some(task);
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(task) = self.scheduled.take() {
            task.cancel();
        }
    }
}

#[tokio::test(start_paused = true)]
async fn scheduled_tasks_batch_acknowledgements_and_keep_metadata() {
    let dir = tempfile::tempdir().expect("failed to create tmpdir");
    let log = LogStream::new(1);
    let positions = append_events(&log, 3);

    let exporter = Batching::new();
    let flushes = Arc::clone(&exporter.flushes);
    let store = ExporterPositionStore::open(dir.path()).expect("open store");
    let director = ExporterDirector::builder(log.clone(), store.clone())
        .exporter_with_args("batch", json!({ "flush_after_ms": 1000 }), exporter)
        .start()
        .expect("start");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        store.get("batch"),
        Some(UNSET_POSITION),
        "nothing acknowledged before the timer"
    );
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    assert_eq!(store.get("batch"), Some(positions[2]));
    director.shutdown().await.expect("shutdown");

    let restarted = Batching::new();
    let restored = Arc::clone(&restarted.restored_metadata);
    let store = ExporterPositionStore::open(dir.path()).expect("reopen store");
    let director = ExporterDirector::builder(log, store)
        .exporter_with_args("batch", json!({ "flush_after_ms": 1000 }), restarted)
        .start()
        .expect("restart");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        restored.lock().expect("lock").as_deref(),
        Some(&b"flushes=1"[..])
    );
    director.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn invalid_arguments_fail_start() {
    let err = ExporterDirector::builder(LogStream::new(1), ExporterPositionStore::in_memory())
        .exporter_with_args("batch", json!({ "flush_after_ms": "soon" }), Batching::new())
        .start()
        .err()
        .expect("configuration must be rejected");
    assert!(matches!(err, EngineError::ExporterConfiguration { id, .. } if id == "batch"));
}

#[tokio::test]
async fn position_acknowledged_on_close_is_persisted() {
    let dir = tempfile::tempdir().expect("failed to create tmpdir");
    let log = LogStream::new(1);
    let positions = append_events(&log, 2);

    let (exporter, mut deliveries) = Recorder::new();
    let director = ExporterDirector::builder(
        log.clone(),
        ExporterPositionStore::open(dir.path()).expect("open store"),
    )
    .config(ExporterDirectorConfig {
        flush_interval: Duration::from_secs(3600),
        ..ExporterDirectorConfig::default()
    })
    .exporter("sink", exporter.ack_up_to(UNSET_POSITION).ack_on_close(positions[1]))
    .start()
    .expect("start");
    assert_eq!(deliveries.next().await, positions[0]);
    assert_eq!(deliveries.next().await, positions[1]);
    director.shutdown().await.expect("shutdown");
    assert_eq!(deliveries.closes.load(Ordering::SeqCst), 1);

    let reopened = ExporterPositionStore::open(dir.path()).expect("reopen store");
    assert_eq!(reopened.get("sink"), Some(positions[1]));
}

#[tokio::test]
async fn undecodable_record_stops_the_director() {
    let log = LogStream::new(1);
    let good = append_events(&log, 1);
    let encoded = encode(&UnwrittenRecord::event(1, JobIntent::Created, json!({}))).expect("encode");
    let mut future = BytesMut::from(&encoded[..]);
    future[..2].copy_from_slice(&7u16.to_be_bytes());
    let bad = log.append(vec![future.freeze()]).expect("append");

    let (exporter, mut deliveries) = Recorder::new();
    let director = ExporterDirector::builder(log.clone(), ExporterPositionStore::in_memory())
        .exporter("sink", exporter)
        .start()
        .expect("start");
    assert_eq!(deliveries.next().await, good[0]);

    while !director.is_finished().await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let err = director.shutdown().await.expect_err("decode failure is fatal");
    assert!(matches!(
        err,
        EngineError::Decode {
            position,
            source: DecodeError::UnsupportedVersion { found: 7, .. },
        } if position == bad
    ));
    assert_eq!(deliveries.closes.load(Ordering::SeqCst), 1);
    assert_eq!(director.positions().get("sink"), Some(good[0]));
}

#[tokio::test]
async fn exporter_that_never_acknowledges_holds_the_lowest_position() {
    let log = LogStream::new(1);
    let positions = append_events(&log, 2);

    let (silent, mut silent_deliveries) = Recorder::new();
    let (acking, mut acking_deliveries) = Recorder::new();
    let director = ExporterDirector::builder(log.clone(), ExporterPositionStore::in_memory())
        .exporter("silent", silent.ack_up_to(UNSET_POSITION))
        .exporter("acking", acking)
        .start()
        .expect("start");

    for expected in &positions {
        assert_eq!(silent_deliveries.next().await, *expected);
        assert_eq!(acking_deliveries.next().await, *expected);
    }
    assert_eq!(director.positions().get("acking"), Some(positions[1]));
    assert_eq!(director.positions().lowest_position(), Some(UNSET_POSITION));
    director.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn records_exported_while_soft_paused_are_delivered_again_after_restart() {
    let dir = tempfile::tempdir().expect("failed to create tmpdir");
    let log = LogStream::new(1);
    let acked = append_events(&log, 1);

    let (exporter, mut deliveries) = Recorder::new();
    let director = ExporterDirector::builder(
        log.clone(),
        ExporterPositionStore::open(dir.path()).expect("open store"),
    )
    .exporter("sink", exporter)
    .start()
    .expect("start");
    assert_eq!(deliveries.next().await, acked[0]);

    director.soft_pause_exporting();
    let unacked = append_events(&log, 2);
    for expected in &unacked {
        assert_eq!(deliveries.next().await, *expected);
    }
    director.shutdown().await.expect("shutdown");
    assert_eq!(director.export_phase(), ExportPhase::SoftPaused);

    let (exporter, mut deliveries) = Recorder::new();
    let director = ExporterDirector::builder(
        log.clone(),
        ExporterPositionStore::open(dir.path()).expect("reopen store"),
    )
    .exporter("sink", exporter)
    .start()
    .expect("restart");
    for expected in &unacked {
        assert_eq!(deliveries.next().await, *expected);
    }
    director.shutdown().await.expect("shutdown");
    assert_eq!(director.positions().get("sink"), Some(unacked[1]));
}
