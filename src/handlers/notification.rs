use super::{mismatch, HandlerContext, MessageHandler};
use crate::error::WorkflowResult;
use crate::protocol::{MessageType, Payload, Response};
use async_trait::async_trait;
use tracing::{info, warn};

/// Records the name of a started engine subprocess under the message's correlation id.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubprocessStartedHandler;

#[async_trait]
impl MessageHandler for SubprocessStartedHandler {
    async fn handle(&self, payload: Payload, ctx: &mut HandlerContext) -> WorkflowResult<Response> {
        let Payload::SubprocessStarted { name } = payload else {
            return Err(mismatch(MessageType::SubprocessStarted));
        };
        info!(subprocess = %name, "Engine subprocess started");
        match ctx.correlation_id().cloned() {
            Some(id) => {
                ctx.subprocesses.insert(id, name);
            }
            None => warn!(subprocess = %name, "Subprocess notification without correlation id"),
        }
        Ok(None)
    }
}

/// Logs the end of an engine subprocess.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubprocessStoppedHandler;

#[async_trait]
impl MessageHandler for SubprocessStoppedHandler {
    async fn handle(&self, payload: Payload, _ctx: &mut HandlerContext) -> WorkflowResult<Response> {
        let Payload::SubprocessStopped = payload else {
            return Err(mismatch(MessageType::SubprocessStopped));
        };
        info!("Engine subprocess stopped");
        Ok(None)
    }
}

/// Logs engine text messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct InfoHandler;

#[async_trait]
impl MessageHandler for InfoHandler {
    async fn handle(&self, payload: Payload, _ctx: &mut HandlerContext) -> WorkflowResult<Response> {
        let Payload::Info { text } = payload else {
            return Err(mismatch(MessageType::Info));
        };
        info!(target: "workflow_engine", "{}", text);
        Ok(None)
    }
}
