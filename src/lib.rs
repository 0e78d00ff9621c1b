//! Log-driven command and event processing for partitioned state machines.
//!
//! Commands are appended to a partition [`LogStream`]; a
//! [`TypedStreamProcessor`] reads them in order, routes each one through a
//! [`ProcessorRegistry`] to the processor for its kind and intent, and writes
//! the resulting events or rejections back to the log. State is rebuilt on
//! restart from the latest snapshot plus a replay of the records after it.
//! An [`ExporterDirector`] hands every committed record to the configured
//! [`Exporter`]s with at-least-once delivery.

mod codec;
mod command;
mod config;
mod error;
mod exporter;
mod key;
mod log;
mod processor;
mod record;
mod registry;
mod snapshot;
mod stream_processor;
mod writer;

pub use codec::{PROTOCOL_VERSION, UnwrittenRecord, decode, encode};
pub use command::{
    AcceptedCommand, CommandControl, CommandProcessor, CommandProcessorAdapter, CommandResponse,
    CommandResponseWriter, NoopResponseWriter,
};
pub use config::{EngineConfig, ExporterDirectorConfig};
pub use error::{DecodeError, EngineError, ExporterError, SnapshotError, WriteError};
pub use exporter::{
    ExportPhase, Exporter, ExporterContext, ExporterController, ExporterDirector,
    ExporterDirectorBuilder, ExporterDirectorHandle, ExporterPosition, ExporterPositionStore,
    RecordFilter, ScheduledTask,
};
pub use key::{EntityCategory, KeyGenerator, PARTITION_BIT_OFFSET, decode_partition_id, partition_key_space};
pub use log::{LogReader, LogStream};
pub use processor::{EventApplier, ProcessingContext, ProcessingMode, SubTask, TypedRecordProcessor};
pub use record::{
    DeploymentIntent, ExporterIntent, IncidentIntent, Intent, JobIntent, ProcessInstanceIntent,
    Record, RecordKind, RecordMetadata, Rejection, RejectionType, RequestMetadata, UNSET_KEY,
    UNSET_POSITION, ValueType,
};
pub use registry::{ProcessorRegistry, RecordTriple};
pub use snapshot::{
    ComposedSnapshot, JsonSnapshot, LongIndex, SNAPSHOT_FORMAT_VERSION, Snapshot, SnapshotMetadata,
    SnapshotStore, SnapshotSupport,
};
pub use stream_processor::{Phase, StreamProcessorBuilder, StreamProcessorHandle, TypedStreamProcessor};
pub use writer::{TypedBatchWriter, TypedStreamWriter};
