//! Workflow connection: lifecycle, message channel, and dispatch loop.
//!
//! [`WorkflowConnection`] owns one run at a time. A run goes through
//!
//! ```text
//! connect()  ─> MessageChannel handed to the engine side      OFF → ON
//! start()    ─> engine process launched                       ON  → RUNNING
//! run()      ─> dispatch loop until terminal / abort / error  ... → OFF
//! ```
//!
//! [`AbortHandle`] may be cloned out of the connection and used from any task to stop the
//! run; the dispatch loop answers every outstanding call with an abort and kills the engine.

pub mod channel;
pub mod dispatch;
pub mod state;

pub use channel::{Envelope, MessageChannel, PendingRequests, ResponseSink};
pub use dispatch::{Dispatcher, RunOutcome};
pub use state::{ConnectionState, StateMachine};

use crate::config::ConnectionConfig;
use crate::engine::EngineProcess;
use crate::error::{WorkflowError, WorkflowResult};
use crate::handlers::{HandlerContext, HandlerSet};
use crate::protocol::Payload;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cloneable switch that aborts the active run.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    /// Abort the run. Idempotent.
    pub fn abort(&self) {
        if !self.token.is_cancelled() {
            warn!("Workflow abort requested");
        }
        self.token.cancel();
    }

    /// Whether an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// One engine connection and the state it drives.
pub struct WorkflowConnection {
    state: StateMachine,
    dispatcher: Dispatcher,
    receiver: Option<mpsc::Receiver<Envelope>>,
    engine: Option<Box<dyn EngineProcess>>,
    cancel: CancellationToken,
    channel_capacity: usize,
}

impl std::fmt::Debug for WorkflowConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowConnection")
            .field("state", &self.state.state())
            .field("dispatcher", &self.dispatcher)
            .field("engine", &self.engine.is_some())
            .field("aborted", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WorkflowConnection {
    /// Connection in the OFF state.
    pub fn new(config: &ConnectionConfig, handlers: HandlerSet, context: HandlerContext) -> Self {
        Self {
            state: StateMachine::new(),
            dispatcher: Dispatcher::new(handlers, context, config.request_timeout),
            receiver: None,
            engine: None,
            cancel: CancellationToken::new(),
            channel_capacity: config.channel_capacity,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// OFF → ON. Returns the channel the engine side calls into.
    pub fn connect(&mut self) -> WorkflowResult<MessageChannel> {
        self.state.connect()?;
        self.dispatcher.context_mut().begin_run();
        let (channel, receiver) = MessageChannel::new(self.channel_capacity);
        self.receiver = Some(receiver);
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        info!("Workflow connection open");
        Ok(channel)
    }

    /// ON → RUNNING. Launches `engine`; on failure the connection goes back to OFF.
    pub async fn start(&mut self, mut engine: Box<dyn EngineProcess>) -> WorkflowResult<()> {
        if self.state.state() != ConnectionState::On {
            return Err(WorkflowError::InvalidTransition {
                from: self.state.state(),
                to: ConnectionState::Running,
            });
        }
        if let Err(e) = engine.start().await {
            warn!(error = %e, "Workflow engine failed to start");
            self.end().await;
            return Err(e);
        }
        self.state.start()?;
        self.engine = Some(engine);
        Ok(())
    }

    /// Serve the engine until the run ends. The connection is OFF afterwards.
    pub async fn run(&mut self) -> WorkflowResult<RunOutcome> {
        if !self.state.state().is_active() {
            return Err(WorkflowError::InvalidTransition {
                from: self.state.state(),
                to: ConnectionState::Running,
            });
        }
        let (Some(mut receiver), Some(mut engine)) = (self.receiver.take(), self.engine.take())
        else {
            return Err(WorkflowError::ChannelClosed);
        };

        let cancel = self.cancel.clone();
        self.dispatcher
            .run(&mut receiver, &mut self.state, engine.as_mut(), &cancel)
            .await
    }

    /// Handle for aborting the current or next run. Handles taken before an abort go stale
    /// once the next run connects.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.cancel.clone(),
        }
    }

    /// Abort without a running dispatch loop: kill the engine and go OFF.
    pub async fn abort(&mut self) {
        self.cancel.cancel();
        if let Some(mut engine) = self.engine.take() {
            if let Err(e) = engine.abort().await {
                warn!(error = %e, "Failed to kill workflow engine");
            }
        }
        self.close_channel();
    }

    /// Stop the engine and go OFF from any state.
    pub async fn end(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            if let Err(e) = engine.stop().await {
                warn!(error = %e, "Failed to stop workflow engine");
            }
        }
        self.close_channel();
    }

    /// Installed handlers; may be changed between runs.
    pub fn handlers_mut(&mut self) -> &mut HandlerSet {
        self.dispatcher.handlers_mut()
    }

    /// Handler context, including the task tree of the last run.
    pub fn context(&self) -> &HandlerContext {
        self.dispatcher.context()
    }

    /// Mutable access to the handler context.
    pub fn context_mut(&mut self) -> &mut HandlerContext {
        self.dispatcher.context_mut()
    }

    fn close_channel(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            while let Ok(envelope) = receiver.try_recv() {
                envelope
                    .sink
                    .send(Some(Payload::abort("workflow connection closed")));
            }
        }
        self.state.end();
    }
}
