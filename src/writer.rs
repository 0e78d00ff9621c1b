//! Typed writers that append follow-up records to the log.
//!
//! Records written while handling a record carry that record's position as
//! their source position. Replay relies on that link to find where the
//! previous run stopped. A write either fully succeeds or leaves the log
//! untouched; writers never retry.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::codec::{self, PROTOCOL_VERSION, UnwrittenRecord};
use crate::error::WriteError;
use crate::log::LogStream;
use crate::record::{
    Intent, Record, RecordKind, RecordMetadata, Rejection, RejectionType, RequestMetadata,
    UNSET_KEY, UNSET_POSITION,
};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl UnwrittenRecord {
    /// Start a record of the given kind. Producer id and timestamp are
    /// filled in by the writer.
    pub fn new(kind: RecordKind, key: i64, intent: impl Into<Intent>, value: Value) -> Self {
        Self {
            key,
            source_record_position: UNSET_POSITION,
            metadata: RecordMetadata {
                kind,
                intent: intent.into(),
                rejection: None,
                request: None,
                producer_id: 0,
                timestamp: 0,
                protocol_version: PROTOCOL_VERSION,
            },
            value,
        }
    }

    /// A command, keyed by `key` or unkeyed if [`UNSET_KEY`].
    pub fn command(key: i64, intent: impl Into<Intent>, value: Value) -> Self {
        Self::new(RecordKind::Command, key, intent, value)
    }

    /// An event about the entity `key`.
    pub fn event(key: i64, intent: impl Into<Intent>, value: Value) -> Self {
        Self::new(RecordKind::Event, key, intent, value)
    }

    /// The rejection of `command`, echoing its key, intent, payload and
    /// request.
    pub fn rejection(command: &Record, rejection_type: RejectionType, reason: impl Into<String>) -> Self {
        let mut record = Self::new(
            RecordKind::CommandRejection,
            command.key,
            command.intent(),
            command.value.clone(),
        );
        record.metadata.rejection = Some(Rejection {
            rejection_type,
            reason: reason.into(),
        });
        record.metadata.request = command.metadata.request;
        record
    }

    /// Attach the client request this record answers.
    pub fn with_request(mut self, request: Option<RequestMetadata>) -> Self {
        self.metadata.request = request;
        self
    }
}

/// Writes records on behalf of one producer.
///
/// While a record is being handled, the stream processor sets the writer's
/// source position to that record's position; every record written through
/// the writer then points back to it.
#[derive(Debug, Clone)]
pub struct TypedStreamWriter {
    log: LogStream,
    producer_id: i32,
    source_position: i64,
}

impl TypedStreamWriter {
    /// Create a writer with no source context.
    ///
    /// # Arguments
    ///
    /// * `log` - Log to append to.
    /// * `producer_id` - Written into every record's metadata.
    pub fn new(log: LogStream, producer_id: i32) -> Self {
        Self {
            log,
            producer_id,
            source_position: UNSET_POSITION,
        }
    }

    /// Set the position of the record being handled. Records written
    /// afterwards use it as their source position.
    pub fn set_source_position(&mut self, position: i64) {
        self.source_position = position;
    }

    pub fn source_position(&self) -> i64 {
        self.source_position
    }

    /// Append an external command with no key and no source record.
    ///
    /// # Returns
    ///
    /// The position of the new command.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] if the log refuses the append.
    pub fn write_new_command(
        &mut self,
        intent: impl Into<Intent>,
        value: Value,
        request: Option<RequestMetadata>,
    ) -> Result<i64, WriteError> {
        let record = UnwrittenRecord::command(UNSET_KEY, intent, value).with_request(request);
        self.append(vec![self.stamp(record, UNSET_POSITION)])
    }

    /// Append a follow-up command caused by the current source record.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] if the log refuses the append.
    pub fn write_follow_up_command(
        &mut self,
        key: i64,
        intent: impl Into<Intent>,
        value: Value,
    ) -> Result<i64, WriteError> {
        self.write(UnwrittenRecord::command(key, intent, value))
    }

    /// Append a follow-up event caused by the current source record.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] if the log refuses the append.
    pub fn write_follow_up_event(
        &mut self,
        key: i64,
        intent: impl Into<Intent>,
        value: Value,
    ) -> Result<i64, WriteError> {
        self.write(UnwrittenRecord::event(key, intent, value))
    }

    /// Append the rejection of `command`.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] if the log refuses the append.
    pub fn write_rejection(
        &mut self,
        command: &Record,
        rejection_type: RejectionType,
        reason: impl Into<String>,
    ) -> Result<i64, WriteError> {
        self.write(UnwrittenRecord::rejection(command, rejection_type, reason))
    }

    /// Append a prepared record in the current source context.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] if the log refuses the append.
    pub fn write(&mut self, record: UnwrittenRecord) -> Result<i64, WriteError> {
        self.append(vec![self.stamp(record, self.source_position)])
    }

    /// Start a batch that is appended atomically by
    /// [`TypedBatchWriter::write`].
    pub fn batch(&self) -> TypedBatchWriter<'_> {
        TypedBatchWriter {
            writer: self,
            records: Vec::new(),
        }
    }

    fn stamp(&self, mut record: UnwrittenRecord, source_position: i64) -> UnwrittenRecord {
        record.source_record_position = source_position;
        record.metadata.producer_id = self.producer_id;
        record.metadata.timestamp = now_millis();
        record
    }

    fn append(&self, records: Vec<UnwrittenRecord>) -> Result<i64, WriteError> {
        // Positions only grow, so a source at or below the current end stays
        // below every position this append can get.
        let last_position = self.log.last_position();
        if let Some(source_position) = records
            .iter()
            .map(|r| r.source_record_position)
            .find(|p| *p > last_position)
        {
            return Err(WriteError::SourceNotWritten {
                source_position,
                last_position,
            });
        }
        let entries = records
            .iter()
            .map(codec::encode)
            .collect::<Result<Vec<_>, _>>()?;
        let count = entries.len();
        let position = self.log.append(entries)?;
        tracing::trace!(
            partition_id = self.log.partition_id(),
            position,
            count,
            "records appended"
        );
        Ok(position)
    }
}

/// Collects records and appends them all at once.
#[derive(Debug)]
pub struct TypedBatchWriter<'a> {
    writer: &'a TypedStreamWriter,
    records: Vec<UnwrittenRecord>,
}

impl TypedBatchWriter<'_> {
    /// Add a follow-up command.
    pub fn add_command(&mut self, key: i64, intent: impl Into<Intent>, value: Value) -> &mut Self {
        self.add(UnwrittenRecord::command(key, intent, value))
    }

    /// Add a follow-up event.
    pub fn add_event(&mut self, key: i64, intent: impl Into<Intent>, value: Value) -> &mut Self {
        self.add(UnwrittenRecord::event(key, intent, value))
    }

    /// Add the rejection of `command`.
    pub fn add_rejection(
        &mut self,
        command: &Record,
        rejection_type: RejectionType,
        reason: impl Into<String>,
    ) -> &mut Self {
        self.add(UnwrittenRecord::rejection(command, rejection_type, reason))
    }

    /// Add a prepared record.
    pub fn add(&mut self, record: UnwrittenRecord) -> &mut Self {
        let stamped = self.writer.stamp(record, self.writer.source_position);
        self.records.push(stamped);
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append every collected record, or none of them.
    ///
    /// # Returns
    ///
    /// The position of the last record in the batch.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] if the batch is empty or the log refuses it.
    pub fn write(self) -> Result<i64, WriteError> {
        self.writer.append(self.records)
    }
}
