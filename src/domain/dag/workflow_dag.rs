use std::collections::{HashSet, VecDeque};

use bimap::BiMap;

use crate::domain::model::definition::{EdgePolicy, TaskDefinition, WorkflowDefinition};
use crate::domain::utils::id::NodeCode;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DagEdge {
    pub from: usize,
    pub to: usize,
    pub policy: EdgePolicy,
}

/// Immutable graph of one workflow definition. Nodes are addressed by a
/// dense index; `index` maps node codes to those indices and back.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    tasks: Vec<TaskDefinition>,
    index: BiMap<NodeCode, usize>,
    edges: Vec<DagEdge>,

    /// Edge indices per node.
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,

    topo_order: Vec<usize>,
}

impl WorkflowDag {
    /// Builds and validates the graph: known endpoints, no self loops, no
    /// duplicate edges and no cycles.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, EngineError> {
        if definition.tasks.is_empty() {
            return Err(EngineError::InvalidDag(format!("workflow '{}' has no tasks", definition.code)));
        }

        let mut index = BiMap::new();
        for (i, task) in definition.tasks.iter().enumerate() {
            if index.insert_no_overwrite(task.code.clone(), i).is_err() {
                return Err(EngineError::InvalidDag(format!("duplicate node code '{}'", task.code)));
            }
        }

        let node_count = definition.tasks.len();
        let mut edges = Vec::with_capacity(definition.relations.len());
        let mut incoming = vec![Vec::new(); node_count];
        let mut outgoing = vec![Vec::new(); node_count];
        let mut seen = HashSet::new();

        for relation in &definition.relations {
            let from = *index
                .get_by_left(&relation.pre)
                .ok_or_else(|| EngineError::InvalidDag(format!("relation references unknown node '{}'", relation.pre)))?;
            let to = *index
                .get_by_left(&relation.post)
                .ok_or_else(|| EngineError::InvalidDag(format!("relation references unknown node '{}'", relation.post)))?;

            if from == to {
                return Err(EngineError::InvalidDag(format!("node '{}' depends on itself", relation.pre)));
            }
            if !seen.insert((from, to)) {
                return Err(EngineError::InvalidDag(format!("duplicate relation '{}' -> '{}'", relation.pre, relation.post)));
            }

            let edge_index = edges.len();
            edges.push(DagEdge { from, to, policy: relation.policy });
            outgoing[from].push(edge_index);
            incoming[to].push(edge_index);
        }

        let topo_order = Self::topological_sort(node_count, &edges, &incoming, &outgoing).ok_or_else(|| {
            EngineError::InvalidDag(format!("workflow '{}' contains a dependency cycle", definition.code))
        })?;

        Ok(WorkflowDag { tasks: definition.tasks.clone(), index, edges, incoming, outgoing, topo_order })
    }

    /// Kahn's algorithm; `None` if the graph has a cycle.
    fn topological_sort(node_count: usize, edges: &[DagEdge], incoming: &[Vec<usize>], outgoing: &[Vec<usize>]) -> Option<Vec<usize>> {
        let mut in_degree: Vec<usize> = incoming.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..node_count).filter(|&n| in_degree[n] == 0).collect();
        let mut order = Vec::with_capacity(node_count);

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &edge_index in &outgoing[node] {
                let to = edges[edge_index].to;
                in_degree[to] -= 1;
                if in_degree[to] == 0 {
                    queue.push_back(to);
                }
            }
        }

        if order.len() == node_count { Some(order) } else { None }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn node_index(&self, code: &NodeCode) -> Option<usize> {
        self.index.get_by_left(code).copied()
    }

    pub fn node_code(&self, index: usize) -> &NodeCode {
        &self.tasks[index].code
    }

    pub fn task(&self, index: usize) -> &TaskDefinition {
        &self.tasks[index]
    }

    pub fn in_degree(&self, index: usize) -> usize {
        self.incoming[index].len()
    }

    pub fn outgoing_edges(&self, index: usize) -> impl Iterator<Item = &DagEdge> {
        self.outgoing[index].iter().map(move |&e| &self.edges[e])
    }

    pub fn roots(&self) -> Vec<usize> {
        (0..self.len()).filter(|&n| self.incoming[n].is_empty()).collect()
    }

    pub fn topological_order(&self) -> Vec<NodeCode> {
        self.topo_order.iter().map(|&i| self.node_code(i).clone()).collect()
    }

    /// A node whose failure is routed into an `on_failure`/`always` branch
    /// is not a required node: its failure does not fail the workflow.
    pub fn has_failure_branch(&self, index: usize) -> bool {
        self.outgoing_edges(index).any(|edge| matches!(edge.policy, EdgePolicy::OnFailure | EdgePolicy::Always))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::definition::{TaskKind, TaskRelation};

    fn definition(codes: &[&str], relations: Vec<TaskRelation>) -> WorkflowDefinition {
        let tasks = codes.iter().map(|c| TaskDefinition::new(*c, TaskKind::Noop)).collect();
        WorkflowDefinition::new("wf", tasks, relations)
    }

    #[test]
    fn builds_diamond_in_topological_order() {
        let def = definition(
            &["a", "b", "c", "d"],
            vec![TaskRelation::new("a", "b"), TaskRelation::new("a", "c"), TaskRelation::new("b", "d"), TaskRelation::new("c", "d")],
        );

        let dag = WorkflowDag::build(&def).unwrap();
        let order: Vec<String> = dag.topological_order().into_iter().map(String::from).collect();

        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));
        assert_eq!(dag.roots(), vec![0]);
        assert_eq!(dag.in_degree(3), 2);
    }

    #[test]
    fn rejects_cycles() {
        let def = definition(&["a", "b", "c"], vec![TaskRelation::new("a", "b"), TaskRelation::new("b", "c"), TaskRelation::new("c", "a")]);

        let err = WorkflowDag::build(&def).unwrap_err();
        assert!(matches!(err, EngineError::InvalidDag(msg) if msg.contains("cycle")));
    }

    #[test]
    fn rejects_unknown_nodes_and_self_loops() {
        let unknown = definition(&["a"], vec![TaskRelation::new("a", "x")]);
        assert!(WorkflowDag::build(&unknown).is_err());

        let self_loop = definition(&["a"], vec![TaskRelation::new("a", "a")]);
        assert!(WorkflowDag::build(&self_loop).is_err());
    }

    #[test]
    fn failure_branch_detection() {
        let def = definition(
            &["a", "b", "alert"],
            vec![TaskRelation::new("a", "b"), TaskRelation::with_policy("a", "alert", EdgePolicy::OnFailure)],
        );
        let dag = WorkflowDag::build(&def).unwrap();

        assert!(dag.has_failure_branch(0));
        assert!(!dag.has_failure_branch(1));
    }
}
