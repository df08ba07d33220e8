//! Queue entries - runtime wrappers around task nodes.
//!
//! A [`QueueEntry`] tracks the execution status of one node; the work itself is done by a
//! [`TaskExecutor`], which follows a pre_execute → execute → post_execute pattern.

use super::node::{NodeId, TaskNode};
use crate::error::WorkflowResult;
use crate::geometry::AxisSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Execution status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Not executed yet
    Pending,
    /// Executing now
    Running,
    /// Completed normally
    Success,
    /// Raised a task failure (itself or in its subtree)
    Failed,
    /// Disabled; not executed
    Skipped,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Pending => write!(f, "pending"),
            EntryStatus::Running => write!(f, "running"),
            EntryStatus::Success => write!(f, "success"),
            EntryStatus::Failed => write!(f, "failed"),
            EntryStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// What a task produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TaskOutput {
    /// Nothing to report (groups, skipped nodes)
    #[default]
    None,
    /// Centred sample translation
    Centred(AxisSettings),
    /// Images acquired for a sweep
    Collected { images: u32 },
}

/// Handle to the entry of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub(crate) NodeId);

impl EntryId {
    /// Node this entry wraps.
    pub fn node(&self) -> NodeId {
        self.0
    }
}

/// Runtime state of one node.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    node: NodeId,
    status: EntryStatus,
    output: Option<TaskOutput>,
    error: Option<String>,
}

impl QueueEntry {
    pub(crate) fn new(node: NodeId) -> Self {
        Self {
            node,
            status: EntryStatus::Pending,
            output: None,
            error: None,
        }
    }

    /// Wrapped node.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Current status.
    pub fn status(&self) -> EntryStatus {
        self.status
    }

    /// Output of the last successful execution.
    pub fn output(&self) -> Option<&TaskOutput> {
        self.output.as_ref()
    }

    /// Failure message of the last execution.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = EntryStatus::Running;
        self.error = None;
    }

    pub(crate) fn mark_success(&mut self, output: TaskOutput) {
        self.status = EntryStatus::Success;
        self.output = Some(output);
    }

    pub(crate) fn mark_failed(&mut self, error: String) {
        self.status = EntryStatus::Failed;
        self.error = Some(error);
    }

    pub(crate) fn mark_skipped(&mut self) {
        self.status = EntryStatus::Skipped;
    }
}

/// Does the work behind task nodes.
///
/// Implementations talk to hardware; they are opaque, blocking calls from the control
/// task's point of view.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Prepare for the node (move to start positions, check devices).
    async fn pre_execute(&self, _node: &TaskNode) -> WorkflowResult<()> {
        Ok(())
    }

    /// Perform the node's own work. Children are executed afterwards by the controller.
    async fn execute(&self, node: &TaskNode) -> WorkflowResult<TaskOutput>;

    /// Finish the node after its children completed.
    async fn post_execute(&self, _node: &TaskNode, _output: &TaskOutput) -> WorkflowResult<()> {
        Ok(())
    }
}
