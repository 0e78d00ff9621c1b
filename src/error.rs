//! Crate-level error types for decoding, writing, snapshotting, processing
//! and exporting records.

use crate::registry::RecordTriple;

/// Error returned when a log entry cannot be turned into a [`Record`](crate::Record).
///
/// Decoding errors are never retried: the same bytes will fail the same way.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The entry was written by a newer protocol than this build understands.
    #[error("protocol version {found} is newer than the supported version {supported}")]
    UnsupportedVersion {
        /// Version found in the envelope.
        found: u16,
        /// Highest version this build can read.
        supported: u16,
    },

    /// The entry ended before a field could be read.
    #[error("entry truncated: needed {needed} more bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the next field needs.
        needed: usize,
        /// Bytes left in the entry.
        remaining: usize,
    },

    /// Unknown record kind code.
    #[error("unknown record kind code {0}")]
    UnknownRecordKind(u8),

    /// Unknown value type code.
    #[error("unknown value type code {0}")]
    UnknownValueType(u8),

    /// Intent code not defined for the value type.
    #[error("unknown intent code {code} for value type code {value_type}")]
    UnknownIntent {
        /// Raw value type code.
        value_type: u8,
        /// Raw intent code.
        code: u8,
    },

    /// Unknown rejection type code.
    #[error("unknown rejection type code {0}")]
    UnknownRejectionType(u8),

    /// The rejection reason was not valid UTF-8.
    #[error("rejection reason is not valid UTF-8: {0}")]
    InvalidReason(#[from] std::string::FromUtf8Error),

    /// The payload was not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Error returned when records could not be appended to the log.
///
/// A failed write leaves the log untouched: batches are all-or-nothing.
/// Writers never retry on their own.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The log refused the append because it is at capacity.
    #[error("log is full: {requested} records requested, {available} available")]
    Backpressure {
        /// Records in the rejected append.
        requested: usize,
        /// Free capacity at the time of the append.
        available: usize,
    },

    /// An empty batch was submitted.
    #[error("cannot append an empty batch")]
    EmptyBatch,

    /// A payload could not be serialized.
    #[error("failed to encode record payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// A variable-length field does not fit its length prefix.
    #[error("record {field} is {len} bytes, more than the envelope can hold")]
    FieldTooLong {
        /// Which field.
        field: &'static str,
        /// Its length in bytes.
        len: usize,
    },

    /// The source position points past the end of the log, so the record
    /// would claim to be caused by a record that does not exist yet.
    #[error("source position {source_position} is beyond the last written position {last_position}")]
    SourceNotWritten {
        /// Source position the writer was given.
        source_position: i64,
        /// Last position in the log at the time of the append.
        last_position: i64,
    },
}

/// Error returned when writing or recovering a snapshot fails.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The artifact or one of its resources does not have the expected
    /// shape. Recovery from a corrupt snapshot is always fatal.
    #[error("snapshot is corrupt: {0}")]
    Corrupt(String),

    /// The stored checksum does not match the content.
    #[error("snapshot checksum mismatch at position {position}")]
    ChecksumMismatch {
        /// Position of the affected snapshot.
        position: i64,
    },

    /// The artifact was written by a newer format version.
    #[error("snapshot format version {found} is newer than the supported version {supported}")]
    UnsupportedVersion {
        /// Version found in the header.
        found: u16,
        /// Highest version this build can read.
        supported: u16,
    },

    /// A named resource expected during recovery is absent.
    #[error("snapshot has no resource named `{0}`")]
    MissingResource(String),

    /// A length does not fit the field it is written into.
    #[error("snapshot {what} is too large: {len}")]
    TooLarge {
        /// What was being written.
        what: &'static str,
        /// The length that did not fit.
        len: usize,
    },

    /// A JSON resource could not be (de)serialized.
    #[error("JSON snapshot resource is invalid: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error returned by an [`Exporter`](crate::Exporter) hook.
///
/// Export failures are retried by the director; they never stop other
/// exporters.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ExporterError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ExporterError {
    /// Create an error from a plain message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error.
    ///
    /// # Arguments
    ///
    /// * `message` - Context describing what the exporter was doing.
    /// * `source` - The error that caused the failure.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Error that stops a stream processor or exporter director, or that is
/// raised while wiring one up.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A log entry could not be decoded.
    #[error("failed to decode record at position {position}: {source}")]
    Decode {
        /// Position of the undecodable entry.
        position: i64,
        /// Underlying decode failure.
        #[source]
        source: DecodeError,
    },

    /// Two processors were registered for the same record triple.
    #[error("a processor is already registered for {0}")]
    DuplicateProcessor(RecordTriple),

    /// A command handler returned without accepting or rejecting.
    #[error("command at position {position} was neither accepted nor rejected")]
    MissingCommandOutcome {
        /// Position of the command.
        position: i64,
    },

    /// A command handler both accepted and rejected, or decided twice.
    #[error("command at position {position} received more than one outcome")]
    ConflictingCommandOutcome {
        /// Position of the command.
        position: i64,
    },

    /// A processor failed on a record.
    #[error("processing failed for record at position {position}: {reason}")]
    Processing {
        /// Position of the record being processed.
        position: i64,
        /// Description of the failure.
        reason: String,
    },

    /// An exporter rejected its configuration, or its id is already taken.
    #[error("failed to configure exporter `{id}`: {source}")]
    ExporterConfiguration {
        /// Id of the exporter.
        id: String,
        /// What went wrong.
        #[source]
        source: ExporterError,
    },

    /// Snapshot persistence or recovery failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// An append failed where no retry is possible.
    #[error(transparent)]
    Write(#[from] WriteError),

    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The background task behind a handle has exited.
    #[error("{0} is no longer running")]
    TaskGone(&'static str),

    /// The background task panicked.
    #[error("{task} task panicked: {message}")]
    TaskPanicked {
        /// Which task.
        task: &'static str,
        /// Join error description.
        message: String,
    },
}
