use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::domain::dag::workflow_dag::WorkflowDag;
use crate::domain::model::definition::{EdgePolicy, Priority};
use crate::domain::utils::id::NodeCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// Some upstream node is not terminal yet.
    Waiting,
    Ready,
    /// A task instance exists for the node.
    Running,
    Succeeded,
    Failed,
    Killed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Killed | NodeStatus::Skipped)
    }
}

/// Terminal outcome of a node, as fed back into the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeOutcome {
    Succeeded,
    Failed,
    Killed,
    Skipped,
}

impl From<NodeOutcome> for NodeStatus {
    fn from(outcome: NodeOutcome) -> Self {
        match outcome {
            NodeOutcome::Succeeded => NodeStatus::Succeeded,
            NodeOutcome::Failed => NodeStatus::Failed,
            NodeOutcome::Killed => NodeStatus::Killed,
            NodeOutcome::Skipped => NodeStatus::Skipped,
        }
    }
}

/// Nodes resolved by one DAG step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DagStep {
    pub ready: Vec<NodeCode>,
    pub skipped: Vec<NodeCode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DagSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub killed: usize,
    pub skipped: usize,
    pub unfinished: usize,
}

#[derive(Debug, Clone)]
struct NodeRuntime {
    status: NodeStatus,
    /// Upstream edges whose source is not terminal yet.
    remaining: usize,
    /// At least one resolved upstream edge was not activated.
    blocked: bool,
}

/// Max-heap entry: higher priority first, then FIFO.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyEntry(Priority, Reverse<u64>, usize);

/// Dependency-counter walker for one workflow instance.
///
/// Pure state, no I/O. The owning workflow runnable is its single writer.
#[derive(Debug, Clone)]
pub struct DagEngine {
    dag: Arc<WorkflowDag>,
    nodes: Vec<NodeRuntime>,
    ready: BinaryHeap<ReadyEntry>,
    sequence: u64,
}

fn edge_activated(policy: EdgePolicy, upstream: NodeOutcome) -> bool {
    match policy {
        EdgePolicy::OnSuccess => upstream == NodeOutcome::Succeeded,
        EdgePolicy::OnFailure => matches!(upstream, NodeOutcome::Failed | NodeOutcome::Killed),
        EdgePolicy::Always => true,
    }
}

impl DagEngine {
    pub fn new(dag: Arc<WorkflowDag>) -> Self {
        let nodes = (0..dag.len()).map(|i| NodeRuntime { status: NodeStatus::Waiting, remaining: dag.in_degree(i), blocked: false }).collect();
        Self { dag, nodes, ready: BinaryHeap::new(), sequence: 0 }
    }

    pub fn dag(&self) -> &Arc<WorkflowDag> {
        &self.dag
    }

    /// Enqueues every zero-dependency node that is still waiting.
    pub fn start(&mut self) -> DagStep {
        let mut step = DagStep::default();
        for root in self.dag.roots() {
            if self.nodes[root].status == NodeStatus::Waiting {
                self.enqueue(root);
                step.ready.push(self.dag.node_code(root).clone());
            }
        }
        step
    }

    fn enqueue(&mut self, index: usize) {
        self.nodes[index].status = NodeStatus::Ready;
        self.sequence += 1;
        self.ready.push(ReadyEntry(self.dag.task(index).priority, Reverse(self.sequence), index));
    }

    /// Takes the next ready node and marks it running.
    pub fn pop_ready(&mut self) -> Option<NodeCode> {
        while let Some(ReadyEntry(_, _, index)) = self.ready.pop() {
            if self.nodes[index].status == NodeStatus::Ready {
                self.nodes[index].status = NodeStatus::Running;
                return Some(self.dag.node_code(index).clone());
            }
        }
        None
    }

    pub fn status(&self, code: &NodeCode) -> Option<NodeStatus> {
        self.dag.node_index(code).map(|i| self.nodes[i].status)
    }

    /// True once every upstream node is terminal and every incoming edge
    /// was activated by its upstream outcome.
    pub fn dependencies_satisfied(&self, code: &NodeCode) -> bool {
        match self.dag.node_index(code) {
            Some(i) => self.nodes[i].remaining == 0 && !self.nodes[i].blocked,
            None => false,
        }
    }

    /// Records a terminal node outcome and walks its dependents.
    ///
    /// A dependent whose counter reaches zero becomes ready if all of its
    /// incoming edges were activated, otherwise it is skipped and the skip is
    /// propagated further down. Skipped nodes satisfy downstream counters.
    pub fn on_node_terminal(&mut self, code: &NodeCode, outcome: NodeOutcome) -> DagStep {
        let mut step = DagStep::default();
        let Some(index) = self.dag.node_index(code) else {
            return step;
        };
        if self.nodes[index].status.is_terminal() {
            return step;
        }

        self.nodes[index].status = outcome.into();
        let mut worklist = vec![(index, outcome)];

        while let Some((upstream, upstream_outcome)) = worklist.pop() {
            let edges: Vec<_> = self.dag.outgoing_edges(upstream).copied().collect();
            for edge in edges {
                let node = &mut self.nodes[edge.to];
                node.remaining = node.remaining.saturating_sub(1);
                if !edge_activated(edge.policy, upstream_outcome) {
                    node.blocked = true;
                }

                if node.status != NodeStatus::Waiting || node.remaining > 0 {
                    continue;
                }

                if node.blocked {
                    node.status = NodeStatus::Skipped;
                    step.skipped.push(self.dag.node_code(edge.to).clone());
                    worklist.push((edge.to, NodeOutcome::Skipped));
                } else {
                    self.enqueue(edge.to);
                    step.ready.push(self.dag.node_code(edge.to).clone());
                }
            }
        }

        step
    }

    /// Marks a node as already owning a task instance (recovery), so that it
    /// is never enqueued again when its upstream outcomes are replayed.
    pub fn restore_running(&mut self, code: &NodeCode) {
        if let Some(index) = self.dag.node_index(code) {
            if !self.nodes[index].status.is_terminal() {
                self.nodes[index].status = NodeStatus::Running;
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.nodes.iter().all(|n| n.status.is_terminal())
    }

    /// True if the node failed (or was killed) and no failure branch handles it.
    pub fn is_required_failure(&self, code: &NodeCode) -> bool {
        match self.dag.node_index(code) {
            Some(i) => matches!(self.nodes[i].status, NodeStatus::Failed | NodeStatus::Killed) && !self.dag.has_failure_branch(i),
            None => false,
        }
    }

    pub fn has_required_failure(&self) -> bool {
        (0..self.nodes.len()).any(|i| self.is_required_failure(self.dag.node_code(i)))
    }

    pub fn summary(&self) -> DagSummary {
        let mut summary = DagSummary { total: self.nodes.len(), ..Default::default() };
        for node in &self.nodes {
            match node.status {
                NodeStatus::Succeeded => summary.succeeded += 1,
                NodeStatus::Failed => summary.failed += 1,
                NodeStatus::Killed => summary.killed += 1,
                NodeStatus::Skipped => summary.skipped += 1,
                NodeStatus::Waiting | NodeStatus::Ready | NodeStatus::Running => summary.unfinished += 1,
            }
        }
        summary
    }
}
