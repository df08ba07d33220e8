use super::{mismatch, HandlerContext, MessageHandler};
use crate::error::{WorkflowError, WorkflowResult};
use crate::protocol::{CollectionDone, MessageType, Payload, Response};
use crate::queue::{EntryStatus, NodeId, TaskKind, TaskOutput};
use crate::store::CollectionRecord;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

/// Acquires a collection proposal.
///
/// Builds a `data_collection` group with one leaf per sweep, executes it under the queue's
/// sibling-failure policy, and reports every sweep that ran to the collection sink. A failed
/// sweep fails the request, which the dispatcher answers with an abort.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionHandler;

#[async_trait]
impl MessageHandler for CollectionHandler {
    async fn handle(&self, payload: Payload, ctx: &mut HandlerContext) -> WorkflowResult<Response> {
        let Payload::CollectionProposal(proposal) = payload else {
            return Err(mismatch(MessageType::CollectionProposal));
        };
        let images = proposal
            .validate()
            .and_then(|()| proposal.image_count())
            .map_err(|e| WorkflowError::task(&proposal.strategy_label, e.to_string()))?;

        let image_dir = join_image_dir(
            &ctx.config.connection.image_root,
            &proposal.relative_image_dir,
        );
        info!(
            strategy = %proposal.strategy_label,
            sweeps = proposal.sweeps.len(),
            images,
            %image_dir,
            "Collection proposal received"
        );

        let group = ctx.queue.create("data_collection", TaskKind::Group);
        let root = ctx.queue.root();
        ctx.queue.enqueue(root, group)?;

        let mut leaves: Vec<(NodeId, Uuid)> = Vec::with_capacity(proposal.sweeps.len());
        for sweep in &proposal.sweeps {
            let leaf = ctx.queue.create(
                sweep.base_name.clone(),
                TaskKind::DataCollection {
                    sweep: sweep.clone(),
                    image_root: image_dir.clone(),
                },
            );
            ctx.queue.enqueue(group, leaf)?;
            leaves.push((leaf, sweep.id));
        }

        let entry = ctx.queue.get_entry(group)?;
        let result = ctx.queue.execute(entry).await;

        for (leaf, sweep_id) in leaves {
            let status = ctx.queue.status(leaf);
            if !matches!(status, EntryStatus::Success | EntryStatus::Failed) {
                continue;
            }
            let leaf_entry = ctx.queue.get_entry(leaf)?;
            let images = match ctx.queue.entry(leaf_entry).and_then(|e| e.output()) {
                Some(TaskOutput::Collected { images }) => *images,
                _ => 0,
            };
            let record = CollectionRecord {
                proposal_id: proposal.id,
                sweep_id,
                sweep_name: ctx.queue.tree().get(leaf)?.display_name(),
                image_dir: image_dir.clone(),
                images,
                status,
                timestamp: Utc::now(),
            };
            if let Err(e) = ctx.sink.record(record).await {
                warn!(error = %e, "Cannot record collection metadata");
            }
        }

        result?;
        info!(strategy = %proposal.strategy_label, "Collection done");
        Ok(Some(Payload::CollectionDone(CollectionDone {
            proposal_id: proposal.id,
            image_root: image_dir,
            status: 0,
        })))
    }
}

fn join_image_dir(root: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        root.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), relative)
    }
}
