//! Task graph and batch scheduling.
//!
//! `TaskGraph` stores task definitions as a petgraph `DiGraph` whose edges run
//! from a dependency to the task that waits on it. `TaskGraph::batches` turns
//! the graph into an `ExecutionPlan`: an ordered list of batches where every
//! dependency of a task sits in a strictly earlier batch.

use crate::core::task::TaskDefinition;
use crate::error::{Error, Result};
use crate::olog_warn;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// The validated dependency graph of a plan.
pub struct TaskGraph {
    /// Nodes are tasks; an edge `a -> b` means `b` depends on `a`.
    graph: DiGraph<TaskDefinition, ()>,
    /// Index mapping from task id to node for fast lookups.
    task_index: HashMap<String, NodeIndex>,
}

impl TaskGraph {
    /// Build a graph from task definitions.
    ///
    /// Dependencies are deduplicated and self-references are dropped with a
    /// warning. Cycles are not rejected here; they surface from
    /// [`TaskGraph::batches`] so the error can name every stuck task.
    ///
    /// # Errors
    /// Returns an error if two tasks share an id or a dependency names a task
    /// that is not in the plan.
    pub fn new(tasks: Vec<TaskDefinition>) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut task_index = HashMap::with_capacity(tasks.len());

        for mut task in tasks {
            if task.id.trim().is_empty() {
                return Err(Error::Validation("Task with empty id".to_string()));
            }
            if task.normalize() {
                olog_warn!("Task {} depends on itself; dropping the edge", task.id);
            }
            if task_index.contains_key(&task.id) {
                return Err(Error::DuplicateTask(task.id));
            }
            let id = task.id.clone();
            let index = graph.add_node(task);
            task_index.insert(id, index);
        }

        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let task = &graph[index];
            for dep in &task.dependencies {
                let dep_index = task_index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
                edges.push((*dep_index, index));
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        Ok(Self { graph, task_index })
    }

    /// Get a task by id.
    pub fn get_task(&self, id: &str) -> Option<&TaskDefinition> {
        self.task_index.get(id).map(|&index| &self.graph[index])
    }

    /// Check if the graph contains a task.
    pub fn contains_task(&self, id: &str) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All tasks in definition order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.graph.node_weights()
    }

    /// Tasks the given task depends on.
    pub fn dependencies(&self, id: &str) -> Vec<&TaskDefinition> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend on the given task.
    pub fn dependents(&self, id: &str) -> Vec<&TaskDefinition> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<&TaskDefinition> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .map(|n| &self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task that transitively depends on the given task (excluding it).
    pub fn downstream_of(&self, id: &str) -> HashSet<String> {
        let mut found = HashSet::new();
        if let Some(&start) = self.task_index.get(id) {
            let mut bfs = Bfs::new(&self.graph, start);
            while let Some(node) = bfs.next(&self.graph) {
                if node != start {
                    found.insert(self.graph[node].id.clone());
                }
            }
        }
        found
    }

    /// Every task the given task transitively depends on (excluding it).
    pub fn upstream_of(&self, id: &str) -> HashSet<String> {
        let mut found = HashSet::new();
        if let Some(&start) = self.task_index.get(id) {
            let reversed = Reversed(&self.graph);
            let mut bfs = Bfs::new(reversed, start);
            while let Some(node) = bfs.next(reversed) {
                if node != start {
                    found.insert(self.graph[node].id.clone());
                }
            }
        }
        found
    }

    /// Tasks in a valid topological order.
    ///
    /// # Errors
    /// Returns `CycleDetected` if the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<&TaskDefinition>> {
        match toposort(&self.graph, None) {
            Ok(sorted) => Ok(sorted.into_iter().map(|n| &self.graph[n]).collect()),
            Err(_) => Err(Error::CycleDetected {
                task_ids: self.stuck_ids(&HashSet::new()),
            }),
        }
    }

    /// Resolve the graph into execution batches.
    ///
    /// Each round selects every unscheduled task whose dependencies are all
    /// scheduled. The eligible tasks are split by parallel-group tag: each tag
    /// becomes one batch, and untagged tasks share a batch. Batches from one
    /// round keep the order in which their first task was defined.
    ///
    /// # Errors
    /// Returns `CycleDetected` naming every task that can never become
    /// eligible. No partial order is produced.
    pub fn batches(&self) -> Result<ExecutionPlan> {
        let mut scheduled: HashSet<NodeIndex> = HashSet::with_capacity(self.task_count());
        let mut remaining: Vec<NodeIndex> = self.graph.node_indices().collect();
        let mut batches: Vec<Vec<String>> = Vec::new();

        while !remaining.is_empty() {
            let eligible: Vec<NodeIndex> = remaining
                .iter()
                .copied()
                .filter(|&index| {
                    self.graph
                        .neighbors_directed(index, Direction::Incoming)
                        .all(|dep| scheduled.contains(&dep))
                })
                .collect();

            if eligible.is_empty() {
                return Err(Error::CycleDetected {
                    task_ids: remaining
                        .iter()
                        .map(|&n| self.graph[n].id.clone())
                        .collect(),
                });
            }

            let mut groups: Vec<(Option<&str>, Vec<String>)> = Vec::new();
            for &index in &eligible {
                let task = &self.graph[index];
                let tag = task.parallel_group.as_deref();
                match groups.iter_mut().find(|(t, _)| *t == tag) {
                    Some((_, ids)) => ids.push(task.id.clone()),
                    None => groups.push((tag, vec![task.id.clone()])),
                }
            }
            batches.extend(groups.into_iter().map(|(_, ids)| ids));

            scheduled.extend(eligible.iter().copied());
            remaining.retain(|index| !scheduled.contains(index));
        }

        Ok(ExecutionPlan { batches })
    }

    fn stuck_ids(&self, scheduled: &HashSet<NodeIndex>) -> Vec<String> {
        self.graph
            .node_indices()
            .filter(|n| !scheduled.contains(n))
            .map(|n| self.graph[n].id.clone())
            .collect()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

/// Ordered batches of task ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    batches: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn batches(&self) -> &[Vec<String>] {
        &self.batches
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Batch index holding the given task.
    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|t| t == id))
    }

    /// Concatenation of all batches.
    pub fn flatten(&self) -> Vec<&str> {
        self.batches
            .iter()
            .flat_map(|b| b.iter().map(String::as_str))
            .collect()
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, batch) in self.batches.iter().enumerate() {
            writeln!(f, "Batch {}: {}", i + 1, batch.join(", "))?;
        }
        Ok(())
    }
}
