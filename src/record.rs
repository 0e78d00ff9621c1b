//! The record model shared by the log, the processors and the exporters.
//!
//! Every entry in a partition's log is a [`Record`]: an immutable envelope
//! around an opaque JSON payload. The envelope carries the record kind
//! (command, event or rejection), the closed [`Intent`] describing what the
//! record means, and the causal link back to the record that triggered it.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Sentinel for "no position": used for external commands without a source
/// record and for exporters that have not exported anything yet.
pub const UNSET_POSITION: i64 = -1;

/// Sentinel for "no key assigned yet".
pub const UNSET_KEY: i64 = -1;

/// Whether a record asks for something, records that it happened, or
/// records that a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// A request to change state.
    Command,
    /// A fact produced by accepting a command.
    Event,
    /// The refusal of a command.
    CommandRejection,
}

impl RecordKind {
    /// Wire code of this kind.
    pub fn code(self) -> u8 {
        match self {
            RecordKind::Command => 0,
            RecordKind::Event => 1,
            RecordKind::CommandRejection => 2,
        }
    }

    /// Inverse of [`code`](RecordKind::code).
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RecordKind::Command),
            1 => Some(RecordKind::Event),
            2 => Some(RecordKind::CommandRejection),
            _ => None,
        }
    }
}

/// The family of entity a record's payload describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueType {
    Job,
    Incident,
    Deployment,
    ProcessInstance,
    /// Internal bookkeeping written on behalf of exporters. Never handed to
    /// an exporter.
    Exporter,
}

impl ValueType {
    /// All value types, in wire-code order.
    pub const ALL: [ValueType; 5] = [
        ValueType::Job,
        ValueType::Incident,
        ValueType::Deployment,
        ValueType::ProcessInstance,
        ValueType::Exporter,
    ];

    /// Wire code of this value type.
    pub fn code(self) -> u8 {
        match self {
            ValueType::Job => 0,
            ValueType::Incident => 1,
            ValueType::Deployment => 2,
            ValueType::ProcessInstance => 3,
            ValueType::Exporter => 4,
        }
    }

    /// Inverse of [`code`](ValueType::code).
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }
}

/// Declares one intent family: the enum, its wire codes and its name table.
macro_rules! intent_family {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Wire code of this intent within its value type.
            pub fn code(self) -> u8 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            /// Inverse of [`code`](Self::code).
            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }

            /// Variant name, as used in logs.
            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),+
                }
            }
        }
    };
}

intent_family!(
    /// Job lifecycle.
    JobIntent {
        Create = 0,
        Created = 1,
        Activate = 2,
        Activated = 3,
        Complete = 4,
        Completed = 5,
        Fail = 6,
        Failed = 7,
        TimeOut = 8,
        TimedOut = 9,
    }
);

intent_family!(
    /// Incident lifecycle.
    IncidentIntent {
        Create = 0,
        Created = 1,
        Resolve = 2,
        Resolved = 3,
    }
);

intent_family!(
    /// Deployment lifecycle.
    DeploymentIntent {
        Create = 0,
        Created = 1,
    }
);

intent_family!(
    /// Process instance lifecycle.
    ProcessInstanceIntent {
        Create = 0,
        Created = 1,
        Cancel = 2,
        Canceled = 3,
        Complete = 4,
        Completed = 5,
    }
);

intent_family!(
    /// Exporter bookkeeping.
    ExporterIntent {
        PositionUpdated = 0,
    }
);

/// What a record means, as a closed sum over the intent families.
///
/// Each variant pins the value type of the record, so an intent can never
/// be paired with the payload of another family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    Job(JobIntent),
    Incident(IncidentIntent),
    Deployment(DeploymentIntent),
    ProcessInstance(ProcessInstanceIntent),
    Exporter(ExporterIntent),
}

impl Intent {
    /// The value type this intent belongs to.
    pub fn value_type(self) -> ValueType {
        match self {
            Intent::Job(_) => ValueType::Job,
            Intent::Incident(_) => ValueType::Incident,
            Intent::Deployment(_) => ValueType::Deployment,
            Intent::ProcessInstance(_) => ValueType::ProcessInstance,
            Intent::Exporter(_) => ValueType::Exporter,
        }
    }

    /// Wire code of the intent within its value type.
    pub fn code(self) -> u8 {
        match self {
            Intent::Job(i) => i.code(),
            Intent::Incident(i) => i.code(),
            Intent::Deployment(i) => i.code(),
            Intent::ProcessInstance(i) => i.code(),
            Intent::Exporter(i) => i.code(),
        }
    }

    /// Resolve an intent from its value type and code.
    ///
    /// Returns `None` when the code is unknown for that value type.
    pub fn from_parts(value_type: ValueType, code: u8) -> Option<Self> {
        match value_type {
            ValueType::Job => JobIntent::from_code(code).map(Intent::Job),
            ValueType::Incident => IncidentIntent::from_code(code).map(Intent::Incident),
            ValueType::Deployment => DeploymentIntent::from_code(code).map(Intent::Deployment),
            ValueType::ProcessInstance => {
                ProcessInstanceIntent::from_code(code).map(Intent::ProcessInstance)
            }
            ValueType::Exporter => ExporterIntent::from_code(code).map(Intent::Exporter),
        }
    }

    /// Name of the intent without its family.
    pub fn name(self) -> &'static str {
        match self {
            Intent::Job(i) => i.name(),
            Intent::Incident(i) => i.name(),
            Intent::Deployment(i) => i.name(),
            Intent::ProcessInstance(i) => i.name(),
            Intent::Exporter(i) => i.name(),
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}", self.value_type(), self.name())
    }
}

impl From<JobIntent> for Intent {
    fn from(i: JobIntent) -> Self {
        Intent::Job(i)
    }
}

impl From<IncidentIntent> for Intent {
    fn from(i: IncidentIntent) -> Self {
        Intent::Incident(i)
    }
}

impl From<DeploymentIntent> for Intent {
    fn from(i: DeploymentIntent) -> Self {
        Intent::Deployment(i)
    }
}

impl From<ProcessInstanceIntent> for Intent {
    fn from(i: ProcessInstanceIntent) -> Self {
        Intent::ProcessInstance(i)
    }
}

impl From<ExporterIntent> for Intent {
    fn from(i: ExporterIntent) -> Self {
        Intent::Exporter(i)
    }
}

/// Why a command was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionType {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    InvalidState,
    ProcessingError,
}

impl RejectionType {
    const ALL: [RejectionType; 5] = [
        RejectionType::InvalidArgument,
        RejectionType::NotFound,
        RejectionType::AlreadyExists,
        RejectionType::InvalidState,
        RejectionType::ProcessingError,
    ];

    /// Wire code, starting at 1 (0 encodes "not rejected").
    pub fn code(self) -> u8 {
        match self {
            RejectionType::InvalidArgument => 1,
            RejectionType::NotFound => 2,
            RejectionType::AlreadyExists => 3,
            RejectionType::InvalidState => 4,
            RejectionType::ProcessingError => 5,
        }
    }

    /// Inverse of [`code`](RejectionType::code). Code 0 yields `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        let idx = usize::from(code).checked_sub(1)?;
        Self::ALL.get(idx).copied()
    }
}

/// The refusal attached to a `CommandRejection` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Category of the refusal.
    pub rejection_type: RejectionType,
    /// Human readable reason.
    pub reason: String,
}

/// Identifies the client request a command came from, so the outcome can
/// be routed back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Request id chosen by the client gateway.
    pub request_id: i64,
    /// Stream the response must be sent on.
    pub request_stream_id: i32,
}

/// Envelope fields besides position, key and source position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Command, event or rejection.
    pub kind: RecordKind,
    /// Meaning of the record; also fixes its value type.
    pub intent: Intent,
    /// Present iff `kind` is [`RecordKind::CommandRejection`].
    pub rejection: Option<Rejection>,
    /// Present iff the record answers or is a client request.
    pub request: Option<RequestMetadata>,
    /// Id of the stream processor (or client) that wrote the record.
    pub producer_id: i32,
    /// Wall clock at write time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Envelope version the record was written with.
    pub protocol_version: u16,
}

/// A committed log entry.
///
/// Records are immutable once read; processors receive `&Record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Log position, strictly increasing per partition.
    pub position: i64,
    /// Entity key the record is about, or [`UNSET_KEY`].
    pub key: i64,
    /// Position of the record that caused this one, or [`UNSET_POSITION`]
    /// for external commands.
    pub source_record_position: i64,
    /// Envelope metadata.
    pub metadata: RecordMetadata,
    /// Opaque payload.
    pub value: Value,
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        self.metadata.kind
    }

    pub fn intent(&self) -> Intent {
        self.metadata.intent
    }

    pub fn value_type(&self) -> ValueType {
        self.metadata.intent.value_type()
    }

    /// `true` for command records.
    pub fn is_command(&self) -> bool {
        self.metadata.kind == RecordKind::Command
    }

    /// `true` if this record was produced in reaction to another record.
    pub fn has_source(&self) -> bool {
        self.source_record_position >= 0
    }

    /// Deserialize the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the payload does not match `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.value)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} @{} (key {}, source {})",
            self.metadata.kind,
            self.metadata.intent,
            self.position,
            self.key,
            self.source_record_position
        )
    }
}
