//! Dispatch loop.
//!
//! The [`Dispatcher`] consumes envelopes from the FIFO one at a time and runs the matching
//! handler to completion before taking the next one. It is the only code that mutates
//! connection state, the task queue, or the position book during a run.
//!
//! # Per-Message Checks
//!
//! ```text
//! enactment id empty ───────────────> Abort (handler not run)
//! first message ────────────────────> fixes the enactment id
//! enactment id differs ─────────────> Abort (handler not run)
//! payload missing / wrong type ─────> Abort (handler not run)
//! terminal sentinel ────────────────> answer, end the run
//! no handler ───────────────────────> Abort
//! notification ─────────────────────> handler, empty answer, state unchanged
//! request ──────────────────────────> RUNNING→OPEN, handler, OPEN→RUNNING, answer
//! ```
//!
//! Protocol violations never reach the caller of [`Dispatcher::run`]; the engine is expected
//! to follow the abort with its terminal message.

use super::channel::{Envelope, PendingRequests, ResponseSink};
use super::state::StateMachine;
use crate::engine::{EngineExit, EngineProcess};
use crate::error::{ProtocolViolation, WorkflowError, WorkflowResult};
use crate::handlers::{HandlerContext, HandlerSet};
use crate::protocol::{EnactmentId, Message, MessageCategory, Payload, Response};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The engine sent `WorkflowCompleted`
    Completed,
    /// The engine sent `WorkflowAborted`, or the run was aborted locally
    Aborted(String),
    /// The engine sent `WorkflowFailed`
    Failed(String),
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Aborted(reason) => write!(f, "aborted: {reason}"),
            RunOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Result of dispatching one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Keep receiving
    Continue,
    /// A terminal message ended the run
    Finished(RunOutcome),
    /// The run was aborted while a handler was running
    Cancelled,
}

enum Event {
    Cancelled,
    Message(Envelope),
    ChannelClosed,
    EngineExited(WorkflowResult<EngineExit>),
}

enum HandlerOutcome {
    Done(WorkflowResult<Response>),
    TimedOut,
    Cancelled,
}

/// Reason given to the engine when the run is aborted locally.
pub const LOCAL_ABORT_REASON: &str = "workflow run aborted";

/// Dispatch loop state for one connection.
#[derive(Debug)]
pub struct Dispatcher {
    handlers: HandlerSet,
    context: HandlerContext,
    pending: PendingRequests,
    enactment_id: Option<EnactmentId>,
    request_timeout: Duration,
}

impl Dispatcher {
    /// Dispatcher over an explicit handler set.
    pub fn new(handlers: HandlerSet, context: HandlerContext, request_timeout: Duration) -> Self {
        Self {
            handlers,
            context,
            pending: PendingRequests::new(),
            enactment_id: None,
            request_timeout,
        }
    }

    /// Installed handlers; may be changed between runs.
    pub fn handlers_mut(&mut self) -> &mut HandlerSet {
        &mut self.handlers
    }

    /// Shared state handed to every handler.
    pub fn context(&self) -> &HandlerContext {
        &self.context
    }

    /// Mutable access to the handler context.
    pub fn context_mut(&mut self) -> &mut HandlerContext {
        &mut self.context
    }

    /// Enactment id fixed by the first message of the run.
    pub fn enactment_id(&self) -> Option<&EnactmentId> {
        self.enactment_id.as_ref()
    }

    /// Requests waiting for their answer.
    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Serve the engine until a terminal message, an abort, or an unhandled error.
    ///
    /// Every exit path leaves the state machine OFF, the engine stopped or killed, and every
    /// queued envelope answered.
    pub async fn run(
        &mut self,
        rx: &mut mpsc::Receiver<Envelope>,
        state: &mut StateMachine,
        engine: &mut dyn EngineProcess,
        cancel: &CancellationToken,
    ) -> WorkflowResult<RunOutcome> {
        info!("Workflow dispatch loop started");
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => Event::Message(envelope),
                    None => Event::ChannelClosed,
                },
                exit = engine.wait() => Event::EngineExited(exit),
            };

            let flow = match event {
                Event::Message(envelope) => self.dispatch(envelope, state, cancel).await,
                Event::Cancelled => Ok(Flow::Cancelled),
                Event::ChannelClosed => Err(WorkflowError::ChannelClosed),
                Event::EngineExited(exit) => Err(match exit {
                    Ok(exit) => WorkflowError::EngineProcess(format!(
                        "engine exited during the run ({exit})"
                    )),
                    Err(e) => e,
                }),
            };

            match flow {
                Ok(Flow::Continue) => continue,
                Ok(Flow::Finished(outcome)) => {
                    info!(%outcome, "Workflow run finished");
                    self.finish(rx, state, LOCAL_ABORT_REASON);
                    if let Err(e) = engine.stop().await {
                        warn!(error = %e, "Failed to stop workflow engine");
                    }
                    return Ok(outcome);
                }
                Ok(Flow::Cancelled) => {
                    warn!("Workflow run aborted");
                    self.finish(rx, state, LOCAL_ABORT_REASON);
                    if let Err(e) = engine.abort().await {
                        warn!(error = %e, "Failed to kill workflow engine");
                    }
                    return Ok(RunOutcome::Aborted(LOCAL_ABORT_REASON.to_string()));
                }
                Err(e) => {
                    error!(error = %e, "Unhandled error in dispatch loop; ending workflow run");
                    self.finish(rx, state, &e.to_string());
                    if let Err(kill_error) = engine.abort().await {
                        warn!(error = %kill_error, "Failed to kill workflow engine");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Handle one envelope.
    ///
    /// Protocol violations are answered with an abort and reported as [`Flow::Continue`].
    /// Errors returned from here are unhandled and end the run.
    pub async fn dispatch(
        &mut self,
        envelope: Envelope,
        state: &mut StateMachine,
        cancel: &CancellationToken,
    ) -> WorkflowResult<Flow> {
        let Envelope { message, sink } = envelope;
        let Message {
            message_type,
            payload,
            correlation_id,
            enactment_id,
        } = message;
        debug!(
            %message_type,
            correlation_id = ?correlation_id.as_ref().map(|id| id.as_str()),
            "Message received"
        );

        let Some(enactment_id) = enactment_id.filter(|id| !id.is_empty()) else {
            reject(sink, ProtocolViolation::MissingEnactmentId);
            return Ok(Flow::Continue);
        };
        match &self.enactment_id {
            None => {
                info!(%enactment_id, "Workflow enactment started");
                self.enactment_id = Some(enactment_id.clone());
            }
            Some(expected) if *expected != enactment_id => {
                reject(
                    sink,
                    ProtocolViolation::EnactmentMismatch {
                        expected: expected.to_string(),
                        received: enactment_id.to_string(),
                    },
                );
                return Ok(Flow::Continue);
            }
            Some(_) => {}
        }

        let Some(payload) = payload else {
            reject(sink, ProtocolViolation::MissingPayload(message_type.to_string()));
            return Ok(Flow::Continue);
        };
        if payload.message_type() != Some(message_type) {
            reject(sink, ProtocolViolation::PayloadMismatch(message_type.to_string()));
            return Ok(Flow::Continue);
        }

        let category = message_type.category();
        if category == MessageCategory::Terminal {
            sink.send(None);
            let outcome = match payload {
                Payload::WorkflowAborted => RunOutcome::Aborted("aborted by the engine".into()),
                Payload::WorkflowFailed { reason } => RunOutcome::Failed(reason),
                _ => RunOutcome::Completed,
            };
            return Ok(Flow::Finished(outcome));
        }

        let Some(handler) = self.handlers.get(message_type) else {
            reject(
                sink,
                ProtocolViolation::UnhandledMessageType(message_type.to_string()),
            );
            return Ok(Flow::Continue);
        };

        if category == MessageCategory::Notification {
            self.context.begin_message(&enactment_id, correlation_id);
            let result = handler
                .handle(payload, &mut self.context)
                .instrument(info_span!("notification", %message_type))
                .await;
            self.context.end_message();
            return match result {
                Ok(response) => {
                    sink.send(response);
                    Ok(Flow::Continue)
                }
                Err(e) if e.aborts_run() => {
                    warn!(%message_type, error = %e, "Notification handler failed; answering abort");
                    sink.send(Some(Payload::abort(e.to_string())));
                    Ok(Flow::Continue)
                }
                Err(e) => {
                    sink.send(Some(Payload::abort(e.to_string())));
                    Err(e)
                }
            };
        }

        // Requests: register the sink, then hold the connection OPEN while handling.
        let Some(correlation_id) = correlation_id else {
            reject(
                sink,
                ProtocolViolation::MissingCorrelationId(message_type.to_string()),
            );
            return Ok(Flow::Continue);
        };
        if let Err((e, sink)) = self.pending.register(correlation_id.clone(), sink) {
            warn!(%correlation_id, error = %e, "Answering abort");
            sink.send(Some(Payload::abort(e.to_string())));
            return Ok(Flow::Continue);
        }
        state.open()?;

        self.context
            .begin_message(&enactment_id, Some(correlation_id.clone()));
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => HandlerOutcome::Cancelled,
            result = tokio::time::timeout(
                self.request_timeout,
                handler
                    .handle(payload, &mut self.context)
                    .instrument(info_span!("request", %message_type, %correlation_id)),
            ) => match result {
                Ok(result) => HandlerOutcome::Done(result),
                Err(_) => HandlerOutcome::TimedOut,
            },
        };
        self.context.end_message();

        match outcome {
            HandlerOutcome::Done(Ok(response)) => {
                if let Some(abort) = response.as_ref().filter(|payload| payload.is_abort()) {
                    warn!(%correlation_id, %message_type, ?abort, "Handler answered abort");
                }
                state.close()?;
                self.pending.answer(&correlation_id, response)?;
                Ok(Flow::Continue)
            }
            HandlerOutcome::Done(Err(e)) if e.aborts_run() => {
                error!(%correlation_id, %message_type, error = %e, "Request failed; aborting workflow run");
                self.context.queue.interrupt();
                state.close()?;
                self.pending
                    .answer(&correlation_id, Some(Payload::abort(e.to_string())))?;
                Ok(Flow::Continue)
            }
            HandlerOutcome::Done(Err(e)) => {
                self.pending
                    .answer(&correlation_id, Some(Payload::abort(e.to_string())))?;
                Err(e)
            }
            HandlerOutcome::TimedOut => {
                let e = WorkflowError::RequestTimeout(self.request_timeout);
                error!(%correlation_id, %message_type, "Request not answered in time; forcing abort");
                self.context.queue.interrupt();
                self.pending
                    .answer(&correlation_id, Some(Payload::abort(e.to_string())))?;
                Err(e)
            }
            HandlerOutcome::Cancelled => {
                self.context.queue.interrupt();
                // Answered by `finish`, together with everything still queued.
                Ok(Flow::Cancelled)
            }
        }
    }

    /// End-of-run cleanup: answer everything outstanding, go OFF, forget run state.
    fn finish(&mut self, rx: &mut mpsc::Receiver<Envelope>, state: &mut StateMachine, reason: &str) {
        let pending = self.pending.abort_all(reason);
        rx.close();
        let mut queued = 0;
        while let Ok(envelope) = rx.try_recv() {
            envelope.sink.send(Some(Payload::abort(reason)));
            queued += 1;
        }
        if pending + queued > 0 {
            warn!(pending, queued, reason, "Answered outstanding engine calls with abort");
        }

        state.end();
        self.pending.reset();
        self.enactment_id = None;
        self.context.reset_run();
    }
}

fn reject(sink: ResponseSink, violation: ProtocolViolation) {
    warn!(%violation, "Rejecting engine message; answering abort");
    sink.send(Some(Payload::abort(violation.to_string())));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::channel::MessageChannel;
    use crate::connection::state::ConnectionState;
    use crate::handlers::{test_support::context, MessageHandler};
    use crate::protocol::{CorrelationId, MessageType, RequestConfiguration};
    use crate::queue::{TaskExecutor, TaskNode, TaskOutput};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;
    use tracing_test::traced_test;

    struct Idle;

    #[async_trait]
    impl TaskExecutor for Idle {
        async fn execute(&self, _node: &TaskNode) -> WorkflowResult<TaskOutput> {
            Ok(TaskOutput::None)
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _payload: Payload, _ctx: &mut HandlerContext) -> WorkflowResult<Response> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Payload::ReadyForCentring))
        }
    }

    fn dispatcher(handlers: HandlerSet) -> Dispatcher {
        let (ctx, _) = context(Arc::new(Idle));
        Dispatcher::new(handlers, ctx, Duration::from_secs(5))
    }

    fn running() -> StateMachine {
        let mut state = StateMachine::new();
        state.connect().unwrap();
        state.start().unwrap();
        state
    }

    fn envelope(
        payload: Option<Payload>,
        message_type: MessageType,
        enactment: Option<&str>,
        correlation: Option<&str>,
    ) -> (Envelope, oneshot::Receiver<Response>) {
        Envelope::new(Message {
            message_type,
            payload,
            correlation_id: correlation.map(CorrelationId::new),
            enactment_id: enactment.map(EnactmentId::new),
        })
    }

    fn configuration_request(enactment: &str, correlation: &str) -> (Envelope, oneshot::Receiver<Response>) {
        envelope(
            Some(Payload::RequestConfiguration(RequestConfiguration)),
            MessageType::RequestConfiguration,
            Some(enactment),
            Some(correlation),
        )
    }

    #[tokio::test]
    async fn request_round_trip_returns_to_running() {
        let mut dispatcher = dispatcher(HandlerSet::standard());
        let mut state = running();
        let states = state.subscribe();
        let cancel = CancellationToken::new();

        let (env, mut rx) = configuration_request("e1", "c1");
        let flow = dispatcher.dispatch(env, &mut state, &cancel).await.unwrap();

        assert_eq!(flow, Flow::Continue);
        assert_eq!(state.state(), ConnectionState::Running);
        assert!(states.has_changed().unwrap());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Some(Payload::ConfigurationData(_))
        ));
        assert_eq!(dispatcher.enactment_id().map(EnactmentId::as_str), Some("e1"));
    }

    #[tokio::test]
    #[traced_test]
    async fn foreign_enactment_is_rejected_without_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handlers =
            HandlerSet::standard().with(MessageType::RequestConfiguration, Counting(calls.clone()));
        let mut dispatcher = dispatcher(handlers);
        let mut state = running();
        let cancel = CancellationToken::new();

        let (first, _rx1) = configuration_request("e1", "c1");
        dispatcher.dispatch(first, &mut state, &cancel).await.unwrap();
        let (second, mut rx2) = configuration_request("e2", "c2");
        dispatcher.dispatch(second, &mut state, &cancel).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(rx2.try_recv().unwrap().unwrap().is_abort());
        assert_eq!(state.state(), ConnectionState::Running);
        assert!(logs_contain("does not match active run 'e1'"));
    }

    #[tokio::test]
    async fn missing_enactment_and_payload_are_aborted() {
        let mut dispatcher = dispatcher(HandlerSet::standard());
        let mut state = running();
        let cancel = CancellationToken::new();

        let (env, mut rx) = envelope(
            Some(Payload::RequestConfiguration(RequestConfiguration)),
            MessageType::RequestConfiguration,
            Some("  "),
            Some("c1"),
        );
        dispatcher.dispatch(env, &mut state, &cancel).await.unwrap();
        assert!(rx.try_recv().unwrap().unwrap().is_abort());
        assert!(dispatcher.enactment_id().is_none());

        let (env, mut rx) = envelope(None, MessageType::RequestConfiguration, Some("e1"), Some("c2"));
        dispatcher.dispatch(env, &mut state, &cancel).await.unwrap();
        assert!(rx.try_recv().unwrap().unwrap().is_abort());

        let (env, mut rx) = envelope(
            Some(Payload::SubprocessStopped),
            MessageType::RequestCentring,
            Some("e1"),
            Some("c3"),
        );
        dispatcher.dispatch(env, &mut state, &cancel).await.unwrap();
        assert!(rx.try_recv().unwrap().unwrap().is_abort());
        assert_eq!(state.state(), ConnectionState::Running);
    }

    #[tokio::test]
    async fn unhandled_type_is_aborted() {
        let mut dispatcher = dispatcher(HandlerSet::new());
        let mut state = running();
        let cancel = CancellationToken::new();

        let (env, mut rx) = configuration_request("e1", "c1");
        let flow = dispatcher.dispatch(env, &mut state, &cancel).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(rx.try_recv().unwrap().unwrap().is_abort());
    }

    #[tokio::test]
    async fn reused_correlation_id_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handlers =
            HandlerSet::new().with(MessageType::RequestConfiguration, Counting(calls.clone()));
        let mut dispatcher = dispatcher(handlers);
        let mut state = running();
        let cancel = CancellationToken::new();

        let (first, _rx1) = configuration_request("e1", "c1");
        dispatcher.dispatch(first, &mut state, &cancel).await.unwrap();
        let (again, mut rx2) = configuration_request("e1", "c1");
        dispatcher.dispatch(again, &mut state, &cancel).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(rx2.try_recv().unwrap().unwrap().is_abort());
    }

    #[tokio::test]
    async fn terminal_message_finishes() {
        let mut dispatcher = dispatcher(HandlerSet::standard());
        let mut state = running();
        let cancel = CancellationToken::new();

        let (env, mut rx) = envelope(
            Some(Payload::WorkflowFailed {
                reason: "no strategy".into(),
            }),
            MessageType::WorkflowFailed,
            Some("e1"),
            None,
        );
        let flow = dispatcher.dispatch(env, &mut state, &cancel).await.unwrap();
        assert_eq!(flow, Flow::Finished(RunOutcome::Failed("no strategy".into())));
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[tokio::test]
    async fn dispatch_outside_running_is_unhandled() {
        let mut dispatcher = dispatcher(HandlerSet::standard());
        let mut state = StateMachine::new();
        let cancel = CancellationToken::new();

        let (env, mut rx) = configuration_request("e1", "c1");
        let err = dispatcher.dispatch(env, &mut state, &cancel).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
        // The sink is still pending; cleanup answers it.
        assert_eq!(dispatcher.pending().len(), 1);
        let (_channel, mut queue_rx) = MessageChannel::new(1);
        dispatcher.finish(&mut queue_rx, &mut state, "cleanup");
        assert!(rx.try_recv().unwrap().unwrap().is_abort());
    }
}
