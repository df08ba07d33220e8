//! Message handlers.
//!
//! One [`MessageHandler`] per message type, held in a [`HandlerSet`] that is built explicitly
//! and passed to the dispatcher. Handlers run on the dispatcher's task, one at a time, and
//! get exclusive access to the run's [`HandlerContext`].
//!
//! # Handler Table
//!
//! | Message                  | Handler                      | Response            |
//! |--------------------------|------------------------------|---------------------|
//! | `RequestConfiguration`   | [`ConfigurationHandler`]     | `ConfigurationData` |
//! | `ObtainPriorInformation` | [`PriorInformationHandler`]  | `PriorInformation`  |
//! | `PrepareForCentring`     | [`PrepareCentringHandler`]   | `ReadyForCentring`  |
//! | `RequestCentring`        | [`CentringHandler`]          | `CentringDone`      |
//! | `ChooseLattice`          | [`LatticeHandler`]           | `SelectedLattice`   |
//! | `CollectionProposal`     | [`CollectionHandler`]        | `CollectionDone`    |
//! | `SubprocessStarted`      | [`SubprocessStartedHandler`] | none                |
//! | `SubprocessStopped`      | [`SubprocessStoppedHandler`] | none                |
//! | `Info`                   | [`InfoHandler`]              | none                |
//!
//! Terminal messages are not handled here; the dispatcher ends the run on them.

mod centring;
mod collection;
mod configuration;
mod lattice;
mod notification;

pub use centring::{CentringHandler, PrepareCentringHandler};
pub use collection::CollectionHandler;
pub use configuration::{ConfigurationHandler, PriorInformationHandler};
pub use lattice::LatticeHandler;
pub use notification::{InfoHandler, SubprocessStartedHandler, SubprocessStoppedHandler};

use crate::config::WorkflowConfig;
use crate::error::{ProtocolViolation, WorkflowResult};
use crate::geometry::PositionBook;
use crate::operator::OperatorPrompt;
use crate::protocol::{CorrelationId, EnactmentId, MessageType, Payload, PriorInformation, Response};
use crate::queue::QueueController;
use crate::recentring::RecentringCalculator;
use crate::store::CollectionSink;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Turns one inbound payload into a response.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle `payload`. Notifications return `Ok(None)`.
    async fn handle(&self, payload: Payload, ctx: &mut HandlerContext) -> WorkflowResult<Response>;
}

/// Closed map from message type to handler.
#[derive(Default)]
pub struct HandlerSet {
    handlers: HashMap<MessageType, Box<dyn MessageHandler>>,
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<String> = self.handlers.keys().map(ToString::to_string).collect();
        types.sort();
        f.debug_struct("HandlerSet").field("types", &types).finish()
    }
}

impl HandlerSet {
    /// Empty set; every message is unhandled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers for every request and notification type.
    pub fn standard() -> Self {
        Self::new()
            .with(MessageType::RequestConfiguration, ConfigurationHandler)
            .with(MessageType::ObtainPriorInformation, PriorInformationHandler)
            .with(MessageType::PrepareForCentring, PrepareCentringHandler)
            .with(MessageType::RequestCentring, CentringHandler)
            .with(MessageType::ChooseLattice, LatticeHandler)
            .with(MessageType::CollectionProposal, CollectionHandler)
            .with(MessageType::SubprocessStarted, SubprocessStartedHandler)
            .with(MessageType::SubprocessStopped, SubprocessStoppedHandler)
            .with(MessageType::Info, InfoHandler)
    }

    /// Builder form of [`HandlerSet::register`].
    pub fn with(mut self, message_type: MessageType, handler: impl MessageHandler + 'static) -> Self {
        self.register(message_type, Box::new(handler));
        self
    }

    /// Install `handler`, returning the one it replaces.
    pub fn register(
        &mut self,
        message_type: MessageType,
        handler: Box<dyn MessageHandler>,
    ) -> Option<Box<dyn MessageHandler>> {
        self.handlers.insert(message_type, handler)
    }

    /// Remove the handler for `message_type`.
    pub fn remove(&mut self, message_type: MessageType) -> Option<Box<dyn MessageHandler>> {
        self.handlers.remove(&message_type)
    }

    /// Handler for `message_type`, if installed.
    pub fn get(&self, message_type: MessageType) -> Option<&dyn MessageHandler> {
        self.handlers.get(&message_type).map(|handler| &**handler)
    }

    /// Whether a handler is installed for `message_type`.
    pub fn contains(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Number of installed handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is installed.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Everything handlers may read or change during a run.
///
/// Owned by the dispatcher; only one handler holds it at a time.
pub struct HandlerContext {
    pub config: Arc<WorkflowConfig>,
    pub queue: QueueController,
    pub positions: PositionBook,
    /// Engine subprocesses announced by `SubprocessStarted`, keyed by correlation id
    pub subprocesses: HashMap<CorrelationId, String>,
    pub prior_information: PriorInformation,
    pub recentring: Option<RecentringCalculator>,
    pub operator: Arc<dyn OperatorPrompt>,
    pub sink: Arc<dyn CollectionSink>,
    correlation_id: Option<CorrelationId>,
    enactment_id: Option<EnactmentId>,
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("positions", &self.positions)
            .field("subprocesses", &self.subprocesses)
            .field("recentring", &self.recentring.is_some())
            .field("correlation_id", &self.correlation_id)
            .field("enactment_id", &self.enactment_id)
            .finish_non_exhaustive()
    }
}

impl HandlerContext {
    /// Context for `config`; the recentring calculator is enabled when a tool is configured.
    pub fn new(
        config: Arc<WorkflowConfig>,
        queue: QueueController,
        operator: Arc<dyn OperatorPrompt>,
        sink: Arc<dyn CollectionSink>,
    ) -> Self {
        let prior_information = PriorInformation {
            sample_name: config.connection.sample_name.clone(),
            image_root: config.connection.image_root.clone(),
            space_group: None,
            cell: None,
        };
        Self {
            recentring: RecentringCalculator::from_config(&config.recentring),
            config,
            queue,
            positions: PositionBook::new(),
            subprocesses: HashMap::new(),
            prior_information,
            operator,
            sink,
            correlation_id: None,
            enactment_id: None,
        }
    }

    /// Correlation id of the message being handled.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    /// Enactment id of the active run.
    pub fn enactment_id(&self) -> Option<&EnactmentId> {
        self.enactment_id.as_ref()
    }

    pub(crate) fn begin_message(
        &mut self,
        enactment_id: &EnactmentId,
        correlation_id: Option<CorrelationId>,
    ) {
        self.enactment_id = Some(enactment_id.clone());
        self.correlation_id = correlation_id;
    }

    pub(crate) fn end_message(&mut self) {
        self.correlation_id = None;
    }

    /// Start a run on an empty task tree.
    pub(crate) fn begin_run(&mut self) {
        self.queue.clear();
    }

    /// Forget per-run bookkeeping. The task tree is kept for inspection until the next run.
    pub(crate) fn reset_run(&mut self) {
        self.positions.clear();
        self.subprocesses.clear();
        self.correlation_id = None;
        self.enactment_id = None;
    }
}

/// Error for a payload that does not belong to the handler it was routed to.
pub(crate) fn mismatch(expected: MessageType) -> crate::error::WorkflowError {
    ProtocolViolation::PayloadMismatch(expected.to_string()).into()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::operator::ScriptedOperator;
    use crate::queue::{SiblingFailurePolicy, TaskExecutor};
    use crate::store::InMemorySink;

    /// Context with the default configuration, a scripted operator, and an in-memory sink.
    pub fn context(executor: Arc<dyn TaskExecutor>) -> (HandlerContext, Arc<InMemorySink>) {
        let config = Arc::new(WorkflowConfig::default());
        let sink = Arc::new(InMemorySink::new());
        let queue = QueueController::new("workflow", executor, SiblingFailurePolicy::StopOnFailure);
        let ctx = HandlerContext::new(config, queue, Arc::new(ScriptedOperator::new()), sink.clone());
        (ctx, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_set_covers_requests_and_notifications() {
        let handlers = HandlerSet::standard();
        assert_eq!(handlers.len(), 9);
        assert!(handlers.contains(MessageType::RequestCentring));
        assert!(handlers.contains(MessageType::Info));
        assert!(!handlers.contains(MessageType::WorkflowCompleted));
    }

    #[test]
    fn handlers_can_be_replaced_and_removed() {
        let mut handlers = HandlerSet::standard();
        assert!(handlers
            .register(MessageType::Info, Box::new(SubprocessStoppedHandler))
            .is_some());
        assert!(handlers.remove(MessageType::ChooseLattice).is_some());
        assert!(handlers.get(MessageType::ChooseLattice).is_none());
    }
}
