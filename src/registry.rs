//! Routing of records to processors by `(kind, value type, intent)`.
//!
//! Registration happens once, while wiring up a stream processor, and
//! fails fast on duplicates. After that the registry only answers lookups.

use std::collections::HashMap;
use std::fmt;

use crate::command::{CommandProcessor, CommandProcessorAdapter};
use crate::error::EngineError;
use crate::key::KeyGenerator;
use crate::processor::{EventApplier, TypedRecordProcessor};
use crate::record::{Intent, Record, RecordKind, ValueType};

/// The routing key of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordTriple {
    pub kind: RecordKind,
    pub value_type: ValueType,
    pub intent: Intent,
}

impl RecordTriple {
    /// The value type is implied by the intent.
    pub fn new(kind: RecordKind, intent: impl Into<Intent>) -> Self {
        let intent = intent.into();
        Self {
            kind,
            value_type: intent.value_type(),
            intent,
        }
    }

    /// The triple a record is routed by.
    pub fn of(record: &Record) -> Self {
        Self::new(record.kind(), record.intent())
    }
}

impl fmt::Display for RecordTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.kind, self.intent)
    }
}

/// Processors of one partition, keyed by [`RecordTriple`].
///
/// # Examples
///
/// ```
/// use logfold::{JobIntent, ProcessorRegistry, Record};
///
/// #[derive(Default)]
/// struct Jobs { created: u32 }
///
/// let registry = ProcessorRegistry::<Jobs>::new()
///     .on_event(JobIntent::Created, |_: &Record, jobs: &mut Jobs| jobs.created += 1)
///     .expect("first registration succeeds");
///
/// let duplicate = registry.on_event(JobIntent::Created, |_: &Record, _: &mut Jobs| {});
/// assert!(duplicate.is_err());
/// ```
pub struct ProcessorRegistry<S> {
    processors: HashMap<RecordTriple, Box<dyn TypedRecordProcessor<S>>>,
}

impl<S> Default for ProcessorRegistry<S> {
    fn default() -> Self {
        Self {
            processors: HashMap::new(),
        }
    }
}

impl<S> fmt::Debug for ProcessorRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("triples", &self.processors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<S: 'static> ProcessorRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` for records of `kind` with `intent`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateProcessor`] if the triple already has
    /// a processor. The registry is consumed either way, so a miswired
    /// registry can never be used.
    pub fn register(
        mut self,
        kind: RecordKind,
        intent: impl Into<Intent>,
        processor: impl TypedRecordProcessor<S> + 'static,
    ) -> Result<Self, EngineError> {
        let triple = RecordTriple::new(kind, intent);
        if self.processors.contains_key(&triple) {
            return Err(EngineError::DuplicateProcessor(triple));
        }
        self.processors.insert(triple, Box::new(processor));
        Ok(self)
    }

    /// Register a command handler behind a [`CommandProcessorAdapter`].
    ///
    /// # Arguments
    ///
    /// * `intent` - Command intent the handler accepts.
    /// * `handler` - Decides between accepting and rejecting.
    /// * `keys` - Locates the key generator inside the state; used when an
    ///   accepted command carries no key.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateProcessor`] on a duplicate.
    pub fn on_command(
        self,
        intent: impl Into<Intent>,
        handler: impl CommandProcessor<S> + 'static,
        keys: fn(&mut S) -> &mut KeyGenerator,
    ) -> Result<Self, EngineError> {
        self.register(
            RecordKind::Command,
            intent,
            CommandProcessorAdapter::new(handler, keys),
        )
    }

    /// Register a closure that folds events with `intent` into the state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateProcessor`] on a duplicate.
    pub fn on_event<F>(self, intent: impl Into<Intent>, apply: F) -> Result<Self, EngineError>
    where
        F: FnMut(&Record, &mut S) + Send + 'static,
    {
        self.register(RecordKind::Event, intent, EventApplier::new(apply))
    }

    /// The processor for `triple`, if any.
    pub fn get_mut(&mut self, triple: &RecordTriple) -> Option<&mut (dyn TypedRecordProcessor<S> + 'static)> {
        self.processors.get_mut(triple).map(|p| p.as_mut())
    }

    pub fn contains(&self, triple: &RecordTriple) -> bool {
        self.processors.contains_key(triple)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub(crate) fn processors_mut(
        &mut self,
    ) -> impl Iterator<Item = &mut Box<dyn TypedRecordProcessor<S>>> + '_ {
        self.processors.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandControl;
    use crate::record::JobIntent;

    #[derive(Default)]
    struct Jobs {
        keys: KeyGenerator,
    }

    fn keys(jobs: &mut Jobs) -> &mut KeyGenerator {
        &mut jobs.keys
    }

    struct AcceptAll;

    impl CommandProcessor<Jobs> for AcceptAll {
        fn on_command(
            &mut self,
            _command: &Record,
            control: &mut CommandControl<'_, Jobs>,
        ) -> Result<(), EngineError> {
            control.accept(JobIntent::Created);
            Ok(())
        }
    }

    #[test]
    fn double_registration_fails_fast() {
        let registry = ProcessorRegistry::<Jobs>::new()
            .on_command(JobIntent::Create, AcceptAll, keys)
            .expect("first registration");
        let err = registry
            .on_command(JobIntent::Create, AcceptAll, keys)
            .expect_err("duplicate must fail");
        assert!(matches!(
            err,
            EngineError::DuplicateProcessor(t) if t == RecordTriple::new(RecordKind::Command, JobIntent::Create)
        ));
    }

    #[test]
    fn same_intent_with_different_kinds_are_distinct() {
        let mut registry = ProcessorRegistry::<Jobs>::new()
            .on_command(JobIntent::Create, AcceptAll, keys)
            .expect("command")
            .register(
                RecordKind::CommandRejection,
                JobIntent::Create,
                EventApplier::new(|_: &Record, _: &mut Jobs| {}),
            )
            .expect("rejection")
            .on_event(JobIntent::Created, |_: &Record, _: &mut Jobs| {})
            .expect("event");

        assert_eq!(registry.len(), 3);
        let missing = RecordTriple::new(RecordKind::Event, JobIntent::Completed);
        assert!(registry.get_mut(&missing).is_none());
        assert!(registry.contains(&RecordTriple::new(RecordKind::Event, JobIntent::Created)));
    }

    #[test]
    fn triple_display() {
        let triple = RecordTriple::new(RecordKind::Event, JobIntent::Failed);
        assert_eq!(triple.to_string(), "Event Job.Failed");
        assert_eq!(triple.value_type, ValueType::Job);
    }
}
