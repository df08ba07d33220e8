//! Error types for the workflow broker.
//!
//! `WorkflowError` is the single error enum used across the crate. It follows the
//! taxonomy of failures a workflow run can meet:
//!
//! - **Protocol**: unknown message type, missing payload, enactment-id mismatch. The
//!   dispatcher answers these with a synthetic abort and never raises them to its caller.
//! - **EngineProcess**: the external engine or geometry tool exited badly or produced
//!   output that could not be parsed. Callers degrade to an empty result.
//! - **TaskExecution**: a hardware sub-procedure failed inside the task queue. The entry is
//!   marked failed and the error is re-raised to the handler that started it.
//! - Everything else (I/O, configuration, closed channels) is treated as unhandled by the
//!   dispatch loop: the run is cleaned up and the error is returned to the top level.
//!
//! By using `#[from]`, underlying errors convert with `?`.

use crate::connection::state::ConnectionState;
use crate::protocol::CorrelationId;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;

/// Why an inbound engine message was refused without running a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("message carries no enactment id")]
    MissingEnactmentId,

    #[error("enactment id '{received}' does not match active run '{expected}'")]
    EnactmentMismatch { expected: String, received: String },

    #[error("message '{0}' carries no payload")]
    MissingPayload(String),

    #[error("request '{0}' carries no correlation id")]
    MissingCorrelationId(String),

    #[error("no handler registered for message type '{0}'")]
    UnhandledMessageType(String),

    #[error("payload does not match message type '{0}'")]
    PayloadMismatch(String),
}

/// Every failure the broker reports.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("Engine process error: {0}")]
    EngineProcess(String),

    #[error("Task '{task}' failed: {message}")]
    TaskExecution { task: String, message: String },

    #[error("Illegal connection transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Request '{0}' has already been answered")]
    AlreadyAnswered(CorrelationId),

    #[error("No pending request '{0}'")]
    UnknownRequest(CorrelationId),

    #[error("Request '{0}' is already pending")]
    DuplicateRequest(CorrelationId),

    #[error("Request was not answered within {0:?}")]
    RequestTimeout(std::time::Duration),

    #[error("Operator aborted: {0}")]
    OperatorAbort(String),

    #[error("Message channel closed")]
    ChannelClosed,

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Task queue error: {0}")]
    Queue(String),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<figment::Error> for WorkflowError {
    fn from(value: figment::Error) -> Self {
        WorkflowError::Config(Box::new(value))
    }
}

impl WorkflowError {
    /// Build a task failure for the named task.
    pub fn task(task: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::TaskExecution {
            task: task.into(),
            message: message.into(),
        }
    }

    /// Errors a handler may raise that abort the current run while the dispatch loop
    /// keeps serving the engine until it sends its terminal message.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            WorkflowError::TaskExecution { .. }
                | WorkflowError::OperatorAbort(_)
                | WorkflowError::Hardware(_)
                | WorkflowError::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_failures_abort_the_run() {
        assert!(WorkflowError::task("centring", "motor stalled").aborts_run());
        assert!(WorkflowError::OperatorAbort("cancelled".into()).aborts_run());
        assert!(!WorkflowError::ChannelClosed.aborts_run());
        assert!(!WorkflowError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).aborts_run());
    }

    #[test]
    fn messages_name_the_cause() {
        let err = WorkflowError::from(ProtocolViolation::EnactmentMismatch {
            expected: "e1".into(),
            received: "e2".into(),
        });
        assert_eq!(
            err.to_string(),
            "Protocol error: enactment id 'e2' does not match active run 'e1'"
        );

        let err = WorkflowError::InvalidTransition {
            from: ConnectionState::Off,
            to: ConnectionState::Running,
        };
        assert_eq!(err.to_string(), "Illegal connection transition OFF -> RUNNING");
    }
}
