//! Command handling: the accept/reject contract and client responses.
//!
//! A [`CommandProcessor`] only decides. [`CommandProcessorAdapter`] turns
//! that decision into the record-processor lifecycle: it answers the client
//! (if the command carried a request), writes exactly one follow-up record
//! (the accepted event or the rejection), and applies the outcome to state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{EngineError, WriteError};
use crate::key::KeyGenerator;
use crate::processor::{ProcessingContext, TypedRecordProcessor};
use crate::record::{Intent, Record, RecordKind, Rejection, RejectionType, RequestMetadata};
use crate::writer::TypedStreamWriter;

/// The answer sent back to the client that submitted a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Partition that processed the command.
    pub partition_id: i32,
    /// The request this answers.
    pub request: RequestMetadata,
    /// [`RecordKind::Event`] if accepted, [`RecordKind::CommandRejection`]
    /// otherwise.
    pub kind: RecordKind,
    /// Key of the affected entity.
    pub key: i64,
    /// Intent of the follow-up event, or of the rejected command.
    pub intent: Intent,
    /// Present for rejections.
    pub rejection: Option<Rejection>,
    /// Payload of the follow-up record.
    pub value: Value,
}

/// Destination for command responses.
pub trait CommandResponseWriter: Send {
    /// Hand over a response.
    ///
    /// # Returns
    ///
    /// `false` if the response could not be taken right now and should be
    /// offered again.
    fn send(&mut self, response: CommandResponse) -> bool;
}

impl CommandResponseWriter for mpsc::UnboundedSender<CommandResponse> {
    fn send(&mut self, response: CommandResponse) -> bool {
        if mpsc::UnboundedSender::send(self, response).is_err() {
            // Nobody is waiting for the answer any more.
            tracing::debug!("command response receiver dropped");
        }
        true
    }
}

impl CommandResponseWriter for Vec<CommandResponse> {
    fn send(&mut self, response: CommandResponse) -> bool {
        self.push(response);
        true
    }
}

/// Discards every response.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResponseWriter;

impl CommandResponseWriter for NoopResponseWriter {
    fn send(&mut self, _response: CommandResponse) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
enum Decision {
    Accepted {
        key: i64,
        intent: Intent,
        value: Value,
    },
    Rejected(Rejection),
}

/// The outcome of an accepted command, handed to
/// [`CommandProcessor::on_accepted`].
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedCommand {
    /// Key of the entity, allocated on accept if the command had none.
    pub key: i64,
    /// Intent of the follow-up event.
    pub intent: Intent,
    /// Payload of the follow-up event.
    pub value: Value,
    /// Position of the command.
    pub command_position: i64,
}

/// The decision interface handed to a [`CommandProcessor`].
///
/// Exactly one of [`accept`](Self::accept) or [`reject`](Self::reject) must
/// be called exactly once per command. Anything else makes the command fail
/// with [`EngineError::MissingCommandOutcome`] or
/// [`EngineError::ConflictingCommandOutcome`].
pub struct CommandControl<'a, S> {
    command: &'a Record,
    state: &'a mut S,
    keys: fn(&mut S) -> &mut KeyGenerator,
    decision: Option<Decision>,
    conflicting: bool,
}

impl<'a, S> CommandControl<'a, S> {
    fn new(command: &'a Record, state: &'a mut S, keys: fn(&mut S) -> &mut KeyGenerator) -> Self {
        Self {
            command,
            state,
            keys,
            decision: None,
            conflicting: false,
        }
    }

    /// Read access to the partition state.
    pub fn state(&self) -> &S {
        &*self.state
    }

    /// Accept the command; the follow-up event echoes the command payload.
    ///
    /// # Returns
    ///
    /// The entity key: the command's own key, or a newly allocated one if the
    /// command carried none. Returns [`UNSET_KEY`](crate::record::UNSET_KEY)
    /// if an outcome was already chosen.
    pub fn accept(&mut self, intent: impl Into<Intent>) -> i64 {
        let value = self.command.value.clone();
        self.accept_with_value(intent, value)
    }

    /// Accept the command with a custom follow-up event payload.
    pub fn accept_with_value(&mut self, intent: impl Into<Intent>, value: Value) -> i64 {
        if self.decision.is_some() {
            self.conflicting = true;
            return crate::record::UNSET_KEY;
        }
        let key = if self.command.key >= 0 {
            self.command.key
        } else {
            (self.keys)(self.state).next_key()
        };
        self.decision = Some(Decision::Accepted {
            key,
            intent: intent.into(),
            value,
        });
        key
    }

    /// Reject the command.
    pub fn reject(&mut self, rejection_type: RejectionType, reason: impl Into<String>) {
        if self.decision.is_some() {
            self.conflicting = true;
            return;
        }
        self.decision = Some(Decision::Rejected(Rejection {
            rejection_type,
            reason: reason.into(),
        }));
    }

    fn finish(self) -> Result<Decision, EngineError> {
        let position = self.command.position;
        if self.conflicting {
            return Err(EngineError::ConflictingCommandOutcome { position });
        }
        self.decision
            .ok_or(EngineError::MissingCommandOutcome { position })
    }
}

/// Decides whether a command is accepted or rejected.
pub trait CommandProcessor<S>: Send {
    /// Inspect the command and call `accept` or `reject` on `control`.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the stream processor. Use `reject` for
    /// commands that are merely invalid.
    fn on_command(
        &mut self,
        command: &Record,
        control: &mut CommandControl<'_, S>,
    ) -> Result<(), EngineError>;

    /// Apply an accepted command to the state. Runs after the follow-up
    /// event was written, and during replay.
    fn on_accepted(&mut self, _accepted: &AcceptedCommand, _state: &mut S) {}
}

struct PendingCommand {
    command: Record,
    decision: Decision,
}

/// Adapts a [`CommandProcessor`] to the [`TypedRecordProcessor`] lifecycle.
pub struct CommandProcessorAdapter<S, P> {
    handler: P,
    keys: fn(&mut S) -> &mut KeyGenerator,
    partition_id: i32,
    pending: Option<PendingCommand>,
}

impl<S, P: CommandProcessor<S>> CommandProcessorAdapter<S, P> {
    /// Wrap `handler`.
    ///
    /// # Arguments
    ///
    /// * `handler` - The accept/reject decision logic.
    /// * `keys` - Locates the key generator inside the state.
    pub fn new(handler: P, keys: fn(&mut S) -> &mut KeyGenerator) -> Self {
        Self {
            handler,
            keys,
            partition_id: 0,
            pending: None,
        }
    }

    fn response(&self, pending: &PendingCommand) -> Option<CommandResponse> {
        let request = pending.command.metadata.request?;
        let (kind, key, intent, rejection, value) = match &pending.decision {
            Decision::Accepted { key, intent, value } => {
                (RecordKind::Event, *key, *intent, None, value.clone())
            }
            Decision::Rejected(rejection) => (
                RecordKind::CommandRejection,
                pending.command.key,
                pending.command.intent(),
                Some(rejection.clone()),
                pending.command.value.clone(),
            ),
        };
        Some(CommandResponse {
            partition_id: self.partition_id,
            request,
            kind,
            key,
            intent,
            rejection,
            value,
        })
    }
}

impl<S, P> TypedRecordProcessor<S> for CommandProcessorAdapter<S, P>
where
    S: 'static,
    P: CommandProcessor<S>,
{
    fn on_open(&mut self, ctx: &ProcessingContext) {
        self.partition_id = ctx.partition_id();
    }

    fn process(
        &mut self,
        record: &Record,
        state: &mut S,
        _ctx: &mut ProcessingContext,
    ) -> Result<(), EngineError> {
        let mut control = CommandControl::new(record, state, self.keys);
        self.handler.on_command(record, &mut control)?;
        let decision = control.finish()?;
        self.pending = Some(PendingCommand {
            command: record.clone(),
            decision,
        });
        Ok(())
    }

    fn execute_side_effects(&mut self, responses: &mut dyn CommandResponseWriter) -> bool {
        match self.pending.as_ref().and_then(|p| self.response(p)) {
            Some(response) => responses.send(response),
            None => true,
        }
    }

    fn write_records(&mut self, writer: &mut TypedStreamWriter) -> Result<(), WriteError> {
        let Some(pending) = &self.pending else {
            return Ok(());
        };
        match &pending.decision {
            Decision::Accepted { key, intent, value } => {
                let event = crate::codec::UnwrittenRecord::event(*key, *intent, value.clone())
                    .with_request(pending.command.metadata.request);
                writer.write(event)?;
            }
            Decision::Rejected(rejection) => {
                writer.write_rejection(
                    &pending.command,
                    rejection.rejection_type,
                    rejection.reason.clone(),
                )?;
            }
        }
        Ok(())
    }

    fn update_state(&mut self, state: &mut S) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if let Decision::Accepted { key, intent, value } = pending.decision {
            let accepted = AcceptedCommand {
                key,
                intent,
                value,
                command_position: pending.command.position,
            };
            self.handler.on_accepted(&accepted, state);
        }
    }
}
