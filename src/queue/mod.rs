//! Task queue and execution tree.
//!
//! Handlers use the queue to run hardware sub-procedures (centring, data collection)
//! synchronously and learn their outcome.
//!
//! # Execution
//!
//! ```text
//! execute(entry)
//!   ├─ wait while paused            (node boundary)
//!   ├─ disabled? → Skipped, done
//!   ├─ pre_execute → execute        (TaskExecutor)
//!   ├─ children, in insertion order (recursive)
//!   └─ post_execute
//! ```
//!
//! A task failure marks the failing entry and every ancestor up to the executed entry as
//! `Failed` and is returned to the caller. Whether later siblings still run is set by
//! [`SiblingFailurePolicy`].
//!
//! The tree is only mutated from the control task; [`PauseHandle`] is the one piece that
//! may be shared.

pub mod entry;
pub mod node;

pub use entry::{EntryId, EntryStatus, QueueEntry, TaskExecutor, TaskOutput};
pub use node::{NodeId, TaskKind, TaskNode, TaskTree};

use crate::error::{WorkflowError, WorkflowResult};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What happens to the remaining children of a group once one child failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiblingFailurePolicy {
    /// Stop the group; later siblings stay `Pending`
    #[default]
    StopOnFailure,
    /// Run the remaining siblings; the group still reports failure
    ContinueSiblings,
}

/// Shared switch that suspends execution between nodes.
#[derive(Debug, Clone)]
pub struct PauseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseHandle {
    /// Suspend before the next node starts. A running node is never interrupted.
    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    /// Let execution continue.
    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    /// Whether execution is suspended.
    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Owner of the task tree and its entries.
pub struct QueueController {
    root_name: String,
    tree: TaskTree,
    entries: HashMap<NodeId, QueueEntry>,
    executor: Arc<dyn TaskExecutor>,
    policy: SiblingFailurePolicy,
    pause: PauseHandle,
}

impl QueueController {
    /// Controller with an empty tree rooted at `root_name`.
    pub fn new(
        root_name: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
        policy: SiblingFailurePolicy,
    ) -> Self {
        let (tx, _) = watch::channel(false);
        let root_name = root_name.into();
        Self {
            tree: TaskTree::new(root_name.clone()),
            root_name,
            entries: HashMap::new(),
            executor,
            policy,
            pause: PauseHandle { tx: Arc::new(tx) },
        }
    }

    /// The task tree.
    pub fn tree(&self) -> &TaskTree {
        &self.tree
    }

    /// Root group of the tree.
    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    /// Sibling failure policy in force.
    pub fn policy(&self) -> SiblingFailurePolicy {
        self.policy
    }

    /// Create a detached node.
    pub fn create(&mut self, name: impl Into<String>, kind: TaskKind) -> NodeId {
        self.tree.create(name, kind)
    }

    /// Append `child` under `parent`. See [`TaskTree::enqueue`].
    pub fn enqueue(&mut self, parent: NodeId, child: NodeId) -> WorkflowResult<()> {
        self.tree.enqueue(parent, child)?;
        debug!(parent = %parent, child = %child, "Task enqueued");
        Ok(())
    }

    /// Enable or disable a node.
    pub fn set_enabled(&mut self, node: NodeId, enabled: bool) -> WorkflowResult<()> {
        self.tree.get_mut(node)?.enabled = enabled;
        Ok(())
    }

    /// Entry for `node`, created on first use.
    pub fn get_entry(&mut self, node: NodeId) -> WorkflowResult<EntryId> {
        self.tree.get(node)?;
        self.entries
            .entry(node)
            .or_insert_with(|| QueueEntry::new(node));
        Ok(EntryId(node))
    }

    /// Entry state, if one was created.
    pub fn entry(&self, id: EntryId) -> Option<&QueueEntry> {
        self.entries.get(&id.0)
    }

    /// Status of a node's entry; `Pending` when no entry exists yet.
    pub fn status(&self, node: NodeId) -> EntryStatus {
        self.entries
            .get(&node)
            .map_or(EntryStatus::Pending, QueueEntry::status)
    }

    /// Handle for suspending execution from elsewhere.
    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    /// Suspend execution at the next node boundary.
    pub fn pause(&self) {
        self.pause.pause();
    }

    /// Resume suspended execution.
    pub fn resume(&self) {
        self.pause.resume();
    }

    /// Run `entry` and its subtree to completion.
    pub async fn execute(&mut self, entry: EntryId) -> WorkflowResult<TaskOutput> {
        self.tree.get(entry.0)?;
        let name = self.tree.get(entry.0)?.display_name();
        info!(task = %name, "Executing task");
        let result = self.execute_node(entry.0).await;
        match &result {
            Ok(_) => info!(task = %name, "Task finished"),
            Err(e) => warn!(task = %name, "Task failed: {}", e),
        }
        result
    }

    /// Drop every node and entry, leaving a fresh root. Run numbers start again at 1.
    pub fn clear(&mut self) {
        if self.tree.len() > 1 {
            debug!(nodes = self.tree.len(), "Discarding previous task tree");
        }
        self.tree = TaskTree::new(self.root_name.clone());
        self.entries.clear();
        self.pause.resume();
    }

    /// Clear `running` flags left behind by an execution that was dropped mid-node.
    ///
    /// Entries still marked running are set to failed.
    pub fn interrupt(&mut self) {
        for node in self.tree.nodes_mut() {
            if node.running {
                node.running = false;
                if let Some(entry) = self.entries.get_mut(&node.id()) {
                    entry.mark_failed("interrupted".into());
                }
            }
        }
        self.pause.resume();
    }

    fn execute_node(&mut self, id: NodeId) -> BoxFuture<'_, WorkflowResult<TaskOutput>> {
        async move {
            self.wait_until_resumed().await;

            self.get_entry(id)?;
            if !self.tree.get(id)?.enabled {
                debug!(task = %self.tree.get(id)?.display_name(), "Task disabled, skipping");
                self.entry_mut(id)?.mark_skipped();
                return Ok(TaskOutput::None);
            }

            self.entry_mut(id)?.mark_running();
            self.tree.get_mut(id)?.running = true;
            let node = self.tree.get(id)?.clone();

            let result = self.run_node(&node).await;

            self.tree.get_mut(id)?.running = false;
            match result {
                Ok(output) => {
                    self.tree.get_mut(id)?.executed = true;
                    self.entry_mut(id)?.mark_success(output.clone());
                    Ok(output)
                }
                Err(e) => {
                    self.entry_mut(id)?.mark_failed(e.to_string());
                    Err(e)
                }
            }
        }
        .boxed()
    }

    async fn run_node(&mut self, node: &TaskNode) -> WorkflowResult<TaskOutput> {
        let executor = Arc::clone(&self.executor);
        let task = node.display_name();

        executor
            .pre_execute(node)
            .await
            .map_err(|e| as_task_failure(&task, e))?;
        let output = executor
            .execute(node)
            .await
            .map_err(|e| as_task_failure(&task, e))?;

        let mut first_failure = None;
        for child in node.children() {
            if let Err(e) = self.execute_node(*child).await {
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
                if self.policy == SiblingFailurePolicy::StopOnFailure {
                    break;
                }
            }
        }
        if let Some(e) = first_failure {
            return Err(e);
        }

        executor
            .post_execute(node, &output)
            .await
            .map_err(|e| as_task_failure(&task, e))?;
        Ok(output)
    }

    async fn wait_until_resumed(&self) {
        let mut rx = self.pause.tx.subscribe();
        if *rx.borrow() {
            debug!("Task queue paused");
            // The sender lives in `self`, so the channel cannot close while we wait.
            let _ = rx.wait_for(|paused| !*paused).await;
            debug!("Task queue resumed");
        }
    }

    fn entry_mut(&mut self, id: NodeId) -> WorkflowResult<&mut QueueEntry> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::Queue(format!("no entry for task node {id}")))
    }
}

fn as_task_failure(task: &str, error: WorkflowError) -> WorkflowError {
    match error {
        e @ (WorkflowError::TaskExecution { .. } | WorkflowError::OperatorAbort(_)) => e,
        other => WorkflowError::task(task, other.to_string()),
    }
}
