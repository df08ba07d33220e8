use super::{mismatch, HandlerContext, MessageHandler};
use crate::error::WorkflowResult;
use crate::protocol::{MessageType, Payload, Response};
use async_trait::async_trait;
use tracing::info;

/// Asks the operator to pick a lattice.
///
/// The task queue is paused while the operator decides and resumed afterwards, whatever
/// the answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatticeHandler;

#[async_trait]
impl MessageHandler for LatticeHandler {
    async fn handle(&self, payload: Payload, ctx: &mut HandlerContext) -> WorkflowResult<Response> {
        let Payload::ChooseLattice(request) = payload else {
            return Err(mismatch(MessageType::ChooseLattice));
        };
        info!(
            format = %request.lattice_format,
            solutions = request.solutions.len(),
            "Operator input required: choose lattice"
        );

        ctx.queue.pause();
        let selected = ctx.operator.choose_lattice(&request).await;
        ctx.queue.resume();

        Ok(Some(Payload::SelectedLattice(selected?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkflowError;
    use crate::handlers::test_support::context;
    use crate::operator::{OperatorChoice, OperatorPrompt, ScriptedOperator};
    use crate::protocol::{ChooseLattice, SelectedLattice};
    use crate::queue::{PauseHandle, TaskExecutor, TaskNode, TaskOutput};
    use std::sync::{Arc, Mutex};

    struct Idle;

    #[async_trait]
    impl TaskExecutor for Idle {
        async fn execute(&self, _node: &TaskNode) -> WorkflowResult<TaskOutput> {
            Ok(TaskOutput::None)
        }
    }

    /// Operator that records whether the queue was paused while it was asked.
    struct Observer {
        pause: Mutex<Option<PauseHandle>>,
        saw_pause: Mutex<bool>,
    }

    #[async_trait]
    impl OperatorPrompt for Observer {
        async fn choose_lattice(&self, request: &ChooseLattice) -> WorkflowResult<SelectedLattice> {
            let paused = self
                .pause
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(PauseHandle::is_paused);
            *self.saw_pause.lock().unwrap() = paused;
            Ok(SelectedLattice {
                lattice_format: request.lattice_format.clone(),
                solution: request.solutions[0].clone(),
            })
        }
    }

    fn request() -> Payload {
        Payload::ChooseLattice(ChooseLattice {
            lattice_format: "IDXREF".into(),
            solutions: vec!["P 4 2 2".into(), "P 2 2 2".into()],
        })
    }

    #[tokio::test]
    async fn queue_is_paused_while_operator_decides() {
        let (mut ctx, _) = context(Arc::new(Idle));
        let observer = Arc::new(Observer {
            pause: Mutex::new(Some(ctx.queue.pause_handle())),
            saw_pause: Mutex::new(false),
        });
        ctx.operator = observer.clone();

        let response = LatticeHandler.handle(request(), &mut ctx).await.unwrap();
        assert!(matches!(response, Some(Payload::SelectedLattice(_))));
        assert!(*observer.saw_pause.lock().unwrap());
        assert!(!ctx.queue.pause_handle().is_paused());
    }

    #[tokio::test]
    async fn cancellation_resumes_queue_and_aborts() {
        let (mut ctx, _) = context(Arc::new(Idle));
        ctx.operator = Arc::new(ScriptedOperator::with_choices([OperatorChoice::Cancel]));

        let err = LatticeHandler.handle(request(), &mut ctx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::OperatorAbort(_)));
        assert!(err.aborts_run());
        assert!(!ctx.queue.pause_handle().is_paused());
    }
}
