//! Task tree: schedulable units with strict parent/child ownership.
//!
//! Nodes live in an arena owned by [`TaskTree`] and refer to each other by [`NodeId`].
//! A node has at most one parent; moving it under another parent needs an explicit
//! [`TaskTree::reparent`].

use crate::acquisition::Sweep;
use crate::error::{WorkflowError, WorkflowResult};
use crate::geometry::{AxisSettings, GoniostatRotation};
use std::fmt;

/// Index of a node in its [`TaskTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a node does when executed.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Container; only its children do work
    Group,
    /// Centre the sample at a goniostat rotation
    Centring {
        rotation: GoniostatRotation,
        /// Translation predicted by recentring, if available
        hint: Option<AxisSettings>,
    },
    /// Acquire one sweep
    DataCollection { sweep: Sweep, image_root: String },
}

impl TaskKind {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Group => "group",
            TaskKind::Centring { .. } => "centring",
            TaskKind::DataCollection { .. } => "data_collection",
        }
    }
}

/// One node of the task tree.
#[derive(Debug, Clone)]
pub struct TaskNode {
    id: NodeId,
    name: String,
    number: u32,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: TaskKind,
    /// Disabled nodes are skipped, together with their subtree
    pub enabled: bool,
    pub(crate) executed: bool,
    pub(crate) running: bool,
}

impl TaskNode {
    /// Node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Base name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run number among siblings sharing the base name (0 until enqueued).
    pub fn number(&self) -> u32 {
        self.number
    }

    /// `name_number` label, e.g. `sweep_2`.
    pub fn display_name(&self) -> String {
        if self.number == 0 {
            self.name.clone()
        } else {
            format!("{}_{}", self.name, self.number)
        }
    }

    /// Parent, if enqueued.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in insertion order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Task kind.
    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// Whether the node completed normally at least once.
    pub fn executed(&self) -> bool {
        self.executed
    }

    /// Whether the node is executing now.
    pub fn running(&self) -> bool {
        self.running
    }
}

/// Arena holding every node of one run.
#[derive(Debug, Clone)]
pub struct TaskTree {
    nodes: Vec<TaskNode>,
    root: NodeId,
}

impl TaskTree {
    /// Tree with a single root group.
    pub fn new(root_name: impl Into<String>) -> Self {
        let root = NodeId(0);
        Self {
            nodes: vec![TaskNode {
                id: root,
                name: root_name.into(),
                number: 0,
                parent: None,
                children: Vec::new(),
                kind: TaskKind::Group,
                enabled: true,
                executed: false,
                running: false,
            }],
            root,
        }
    }

    /// Root group.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Create a detached node.
    pub fn create(&mut self, name: impl Into<String>, kind: TaskKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(TaskNode {
            id,
            name: name.into(),
            number: 0,
            parent: None,
            children: Vec::new(),
            kind,
            enabled: true,
            executed: false,
            running: false,
        });
        id
    }

    /// Node by id.
    pub fn get(&self, id: NodeId) -> WorkflowResult<&TaskNode> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| WorkflowError::Queue(format!("unknown task node {id}")))
    }

    /// Mutable node by id.
    pub fn get_mut(&mut self, id: NodeId) -> WorkflowResult<&mut TaskNode> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| WorkflowError::Queue(format!("unknown task node {id}")))
    }

    /// Append `child` under `parent`.
    ///
    /// Fails if the child already has a parent (use [`TaskTree::reparent`]), is the root, or
    /// is an ancestor of `parent`.
    pub fn enqueue(&mut self, parent: NodeId, child: NodeId) -> WorkflowResult<()> {
        self.get(parent)?;
        let node = self.get(child)?;
        if child == self.root {
            return Err(WorkflowError::Queue("the root group cannot be enqueued".into()));
        }
        if let Some(current) = node.parent {
            return Err(WorkflowError::Queue(format!(
                "task {} already belongs to {current}; reparent it explicitly",
                node.display_name()
            )));
        }
        if self.is_ancestor(child, parent)? {
            return Err(WorkflowError::Queue(format!(
                "enqueuing {child} under {parent} would create a cycle"
            )));
        }

        let name = node.name.clone();
        let number = self
            .get(parent)?
            .children
            .iter()
            .filter_map(|id| self.nodes.get(id.0))
            .filter(|sibling| sibling.name == name)
            .map(|sibling| sibling.number)
            .max()
            .unwrap_or(0)
            + 1;

        let node = self.get_mut(child)?;
        node.parent = Some(parent);
        node.number = number;
        self.get_mut(parent)?.children.push(child);
        Ok(())
    }

    /// Detach `child` from its current parent and append it under `new_parent`.
    pub fn reparent(&mut self, child: NodeId, new_parent: NodeId) -> WorkflowResult<()> {
        if self.is_ancestor(child, new_parent)? {
            return Err(WorkflowError::Queue(format!(
                "moving {child} under {new_parent} would create a cycle"
            )));
        }
        self.detach(child)?;
        self.enqueue(new_parent, child)
    }

    /// Remove `child` from its parent, leaving it detached.
    pub fn detach(&mut self, child: NodeId) -> WorkflowResult<()> {
        let Some(parent) = self.get(child)?.parent else {
            return Ok(());
        };
        self.get_mut(parent)?.children.retain(|id| *id != child);
        let node = self.get_mut(child)?;
        node.parent = None;
        node.number = 0;
        Ok(())
    }

    /// Whether `ancestor` is `node` or lies on its path to the root.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> WorkflowResult<bool> {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return Ok(true);
            }
            current = self.get(id)?.parent;
        }
        Ok(false)
    }

    /// Number of nodes, detached ones included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: the root exists.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut TaskNode> {
        self.nodes.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn siblings_with_the_same_name_are_numbered() {
        let mut tree = TaskTree::new("workflow");
        let group = tree.create("collect", TaskKind::Group);
        tree.enqueue(tree.root(), group).unwrap();

        let names = ["sweep", "sweep", "other", "sweep"];
        let ids: Vec<NodeId> = names
            .iter()
            .map(|name| {
                let id = tree.create(*name, TaskKind::Group);
                tree.enqueue(group, id).unwrap();
                id
            })
            .collect();

        let numbers: Vec<u32> = ids.iter().map(|id| tree.get(*id).unwrap().number()).collect();
        assert_eq!(numbers, vec![1, 2, 1, 3]);
        assert_eq!(tree.get(ids[3]).unwrap().display_name(), "sweep_3");
        assert_eq!(tree.get(group).unwrap().children(), ids.as_slice());
    }

    #[test]
    fn enqueue_refuses_a_second_parent() {
        let mut tree = TaskTree::new("workflow");
        let a = tree.create("a", TaskKind::Group);
        let b = tree.create("b", TaskKind::Group);
        let leaf = tree.create("leaf", TaskKind::Group);
        tree.enqueue(tree.root(), a).unwrap();
        tree.enqueue(tree.root(), b).unwrap();
        tree.enqueue(a, leaf).unwrap();

        let err = tree.enqueue(b, leaf).unwrap_err();
        assert!(err.to_string().contains("reparent it explicitly"));
        assert!(tree.enqueue(a, leaf).is_err());

        tree.reparent(leaf, b).unwrap();
        assert_eq!(tree.get(leaf).unwrap().parent(), Some(b));
        assert!(tree.get(a).unwrap().children().is_empty());
    }

    #[test]
    fn cycles_are_rejected() {
        let mut tree = TaskTree::new("workflow");
        let a = tree.create("a", TaskKind::Group);
        let b = tree.create("b", TaskKind::Group);
        tree.enqueue(tree.root(), a).unwrap();
        tree.enqueue(a, b).unwrap();

        assert!(tree.reparent(a, b).is_err());
        assert!(tree.enqueue(b, tree.root()).is_err());
        let loose = tree.create("loose", TaskKind::Group);
        assert!(tree.enqueue(loose, loose).is_err());
    }
}
