use crate::error::ConfigError;
use crate::step::Step;
use crate::types::StepId;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

/// Dependency graph of provisioning steps
///
/// Node indices follow declaration order, which is what makes the
/// topological order stable across runs.
pub struct StepGraph {
    graph: DiGraph<Step, ()>,
    step_indices: HashMap<StepId, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl StepGraph {
    /// Build a graph, rejecting duplicate ids, unknown dependencies and cycles
    pub fn build(steps: Vec<Step>) -> Result<Self, ConfigError> {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        for step in steps {
            let id = step.id.clone();
            if step_indices.contains_key(&id) {
                return Err(ConfigError::DuplicateStep(id));
            }
            let node = graph.add_node(step);
            step_indices.insert(id, node);
        }

        // Edge from dependency to dependent (dep -> step)
        let mut edges = Vec::new();
        for node in graph.node_indices() {
            let step = &graph[node];
            for dep_id in &step.depends_on {
                let dep_idx = step_indices.get(dep_id).ok_or_else(|| {
                    ConfigError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep_id.clone(),
                    }
                })?;
                edges.push((*dep_idx, node));
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(ConfigError::Cycle {
                steps: cycle.into_iter().map(|n| graph[n].id.clone()).collect(),
            });
        }

        let order = stable_topological_order(&graph);

        Ok(Self {
            graph,
            step_indices,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, step_id: &StepId) -> bool {
        self.step_indices.contains_key(step_id)
    }

    pub fn get(&self, step_id: &StepId) -> Option<&Step> {
        self.step_indices.get(step_id).map(|idx| &self.graph[*idx])
    }

    /// Steps in declaration order
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.graph.node_indices().map(move |n| &self.graph[n])
    }

    /// Steps in execution order: dependencies first, ties broken by declaration order
    pub fn topological_order(&self) -> Vec<&Step> {
        self.order.iter().map(|n| &self.graph[*n]).collect()
    }

    pub fn topological_ids(&self) -> Vec<StepId> {
        self.order
            .iter()
            .map(|n| self.graph[*n].id.clone())
            .collect()
    }

    /// Direct dependencies of a step, in declaration order
    pub fn dependencies(&self, step_id: &StepId) -> Vec<StepId> {
        self.neighbors(step_id, Direction::Incoming)
    }

    /// Steps that directly depend on the given step, in declaration order
    pub fn dependents(&self, step_id: &StepId) -> Vec<StepId> {
        self.neighbors(step_id, Direction::Outgoing)
    }

    /// Every step that depends on the given step, directly or not, in execution order
    pub fn transitive_dependents(&self, step_id: &StepId) -> Vec<StepId> {
        let Some(start) = self.step_indices.get(step_id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([*start]);
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        self.order
            .iter()
            .filter(|n| seen.contains(*n))
            .map(|n| self.graph[*n].id.clone())
            .collect()
    }

    /// Steps with no dependencies
    pub fn entry_steps(&self) -> Vec<&Step> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| &self.graph[n])
            .collect()
    }

    fn neighbors(&self, step_id: &StepId, direction: Direction) -> Vec<StepId> {
        let Some(node) = self.step_indices.get(step_id) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(*node, direction).collect();
        nodes.sort();
        nodes.dedup();
        nodes.into_iter().map(|n| self.graph[n].id.clone()).collect()
    }
}

/// Kahn's algorithm with a min-heap on node index
fn stable_topological_order(graph: &DiGraph<Step, ()>) -> Vec<NodeIndex> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|n| in_degree[n.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    order
}

/// Returns one cycle as a closed path (first node repeated at the end)
fn find_cycle(graph: &DiGraph<Step, ()>) -> Option<Vec<NodeIndex>> {
    let mut components = petgraph::algo::tarjan_scc(graph);
    components.iter_mut().for_each(|c| c.sort());
    components.sort();

    for component in components {
        let first = component[0];
        let is_cycle = component.len() > 1 || graph.contains_edge(first, first);
        if !is_cycle {
            continue;
        }

        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let mut path = vec![first];
        let mut current = first;
        loop {
            let next = graph
                .neighbors_directed(current, Direction::Outgoing)
                .filter(|n| members.contains(n))
                .min()?;
            if let Some(pos) = path.iter().position(|n| *n == next) {
                let mut cycle = path.split_off(pos);
                cycle.push(next);
                return Some(cycle);
            }
            path.push(next);
            current = next;
        }
    }
    None
}
