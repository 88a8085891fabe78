//! Dependency graph over an exertion tree.
//!
//! Every exertion in the tree becomes a node. Edges point from the unit
//! that must finish first to the unit that waits for it:
//! - structural: child → parent (a composite finishes after its children)
//! - data: source → dependent, from each context input binding
//!
//! A stable topological sort over the whole tree is then filtered per
//! composite to order its direct children, data edges are lifted to the
//! sibling level to fix up that order, and `Flow::Auto` is resolved from
//! whether any data edges connect those children.

use crate::core::context::ContextId;
use crate::core::exertion::{Exertion, ExertionId, Flow};
use crate::elog_debug;
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Why one exertion waits on another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeKind {
    /// Containment: the parent completes after the child.
    Structural,
    /// The dependent reads `path` from the source's context.
    Data { path: String },
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Structural => write!(f, "structural"),
            EdgeKind::Data { path } => write!(f, "data: {}", path),
        }
    }
}

#[derive(Debug, Clone)]
struct GraphNode {
    id: ExertionId,
    name: String,
    parent: Option<ExertionId>,
}

pub struct DependencyGraph {
    graph: DiGraph<GraphNode, EdgeKind>,
    index: HashMap<ExertionId, NodeIndex>,
    /// Which exertion owns each context id.
    contexts: HashMap<ContextId, ExertionId>,
}

impl DependencyGraph {
    /// Build the graph for `root` and everything below it.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateId`] if two exertions in the tree share an id.
    pub fn build(root: &Exertion) -> Result<Self> {
        let mut dag = Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            contexts: HashMap::new(),
        };
        dag.add_nodes(root, None)?;
        dag.add_data_edges(root);
        dag.add_structural_edges(root);
        Ok(dag)
    }

    /// Sort `root` in place: order every composite's children and resolve
    /// `Flow::Auto`. The master child, if any, is moved last.
    ///
    /// # Errors
    /// [`Error::DuplicateId`] or [`Error::Cycle`]; both are fatal.
    pub fn order(root: &mut Exertion) -> Result<()> {
        let dag = Self::build(root)?;
        let sorted = dag.topological_order()?;
        let position: HashMap<ExertionId, usize> = sorted
            .into_iter()
            .enumerate()
            .map(|(pos, id)| (id, pos))
            .collect();
        dag.apply(root, &position)
    }

    fn add_nodes(&mut self, exertion: &Exertion, parent: Option<ExertionId>) -> Result<()> {
        if self.index.contains_key(&exertion.id) {
            return Err(Error::DuplicateId(exertion.id));
        }
        let index = self.graph.add_node(GraphNode {
            id: exertion.id,
            name: exertion.name.clone(),
            parent,
        });
        self.index.insert(exertion.id, index);
        self.contexts.insert(exertion.context.id, exertion.id);

        for child in &exertion.children {
            self.add_nodes(child, Some(exertion.id))?;
        }
        Ok(())
    }

    fn add_data_edges(&mut self, exertion: &Exertion) {
        let target = self.index[&exertion.id];
        for binding in &exertion.context.bindings {
            let Some(context_id) = binding.from_context else {
                continue;
            };
            let Some(source) = self.contexts.get(&context_id).copied() else {
                elog_debug!(
                    "dag: {} binds {} from context {} outside the tree",
                    exertion.describe(),
                    binding.path,
                    context_id.short()
                );
                continue;
            };
            if source == exertion.id {
                continue;
            }
            let source = self.index[&source];
            self.graph.add_edge(
                source,
                target,
                EdgeKind::Data {
                    path: binding.path.clone(),
                },
            );
        }

        for child in &exertion.children {
            self.add_data_edges(child);
        }
    }

    fn add_structural_edges(&mut self, exertion: &Exertion) {
        let parent = self.index[&exertion.id];
        for child in &exertion.children {
            let child_index = self.index[&child.id];

            // A descendant reading from this parent's context would close a
            // cycle with the containment edges; containment wins.
            let mut subtree = HashSet::new();
            child.visit(&mut |e| {
                subtree.insert(self.index[&e.id]);
            });
            let mut conflicting: Vec<_> = self
                .graph
                .edges_directed(parent, Direction::Outgoing)
                .filter(|e| subtree.contains(&e.target()))
                .map(|e| e.id())
                .collect();
            // removal swaps the last edge into the hole, so go high to low
            conflicting.sort();
            for edge in conflicting.into_iter().rev() {
                self.graph.remove_edge(edge);
            }

            while let Some(edge) = self.graph.find_edge(child_index, parent) {
                self.graph.remove_edge(edge);
            }
            self.graph
                .add_edge(child_index, parent, EdgeKind::Structural);

            self.add_structural_edges(child);
        }
    }

    /// All exertion ids in dependency order.
    ///
    /// Kahn's algorithm, always releasing the earliest-inserted ready node,
    /// so independent units keep their declared (pre-order) position.
    ///
    /// # Errors
    /// Returns [`Error::Cycle`] naming one exertion on the cycle.
    pub fn topological_order(&self) -> Result<Vec<ExertionId>> {
        let mut indegree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.edges_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut sorted = Vec::with_capacity(indegree.len());
        while let Some(Reverse(i)) = ready.pop() {
            let node = NodeIndex::new(i);
            sorted.push(self.graph[node].id);
            for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                let t = edge.target().index();
                indegree[t] -= 1;
                if indegree[t] == 0 {
                    ready.push(Reverse(t));
                }
            }
        }

        if sorted.len() != self.graph.node_count() {
            let name = match toposort(&self.graph, None) {
                Err(cycle) => self.graph[cycle.node_id()].name.clone(),
                Ok(_) => "unknown".to_string(),
            };
            return Err(Error::Cycle { name });
        }
        Ok(sorted)
    }

    fn apply(&self, exertion: &mut Exertion, position: &HashMap<ExertionId, usize>) -> Result<()> {
        if exertion.is_composite() {
            exertion
                .children
                .sort_by_key(|c| position.get(&c.id).copied().unwrap_or(usize::MAX));
            self.order_siblings(exertion)?;

            if let Some(master) = exertion.control.master {
                if let Some(i) = exertion.children.iter().position(|c| c.id == master) {
                    let master = exertion.children.remove(i);
                    exertion.children.push(master);
                }
            }

            if exertion.control.flow == Flow::Auto {
                let edges = self.sibling_edge_count(exertion);
                exertion.control.flow = if edges == 0 { Flow::Par } else { Flow::Seq };
                elog_debug!(
                    "dag: {} flow auto -> {} ({} sibling edges)",
                    exertion.describe(),
                    exertion.control.flow,
                    edges
                );
            }
        }

        for child in &mut exertion.children {
            self.apply(child, position)?;
        }
        Ok(())
    }

    /// Reorder the direct children of `exertion` so that every child runs
    /// after the siblings whose subtrees it reads from. The global order
    /// alone misses this when the source sits deeper than the dependent.
    fn order_siblings(&self, exertion: &mut Exertion) -> Result<()> {
        let rank: HashMap<ExertionId, usize> = exertion
            .children
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id, i))
            .collect();
        let all: HashSet<ExertionId> = rank.keys().copied().collect();

        let mut waits_on: Vec<HashSet<usize>> = vec![HashSet::new(); rank.len()];
        for edge in self.graph.edge_references() {
            if !matches!(edge.weight(), EdgeKind::Data { .. }) {
                continue;
            }
            let from = self.lift(self.graph[edge.source()].id, exertion.id, &all);
            let to = self.lift(self.graph[edge.target()].id, exertion.id, &all);
            if let (Some(a), Some(b)) = (from, to) {
                if a != b {
                    waits_on[rank[&b]].insert(rank[&a]);
                }
            }
        }

        // The master always runs last, so no sibling can read from it.
        if let Some(master) = exertion.control.master.and_then(|m| rank.get(&m).copied()) {
            if let Some(reader) = waits_on.iter().position(|sources| sources.contains(&master)) {
                return Err(Error::Validation(format!(
                    "{} reads from {}, the master of {}, which runs last",
                    exertion.children[reader].describe(),
                    exertion.children[master].describe(),
                    exertion.describe()
                )));
            }
        }

        let mut indegree: Vec<usize> = waits_on.iter().map(HashSet::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut sorted = Vec::with_capacity(indegree.len());
        while let Some(Reverse(i)) = ready.pop() {
            sorted.push(i);
            for (j, sources) in waits_on.iter().enumerate() {
                if sources.contains(&i) {
                    indegree[j] -= 1;
                    if indegree[j] == 0 {
                        ready.push(Reverse(j));
                    }
                }
            }
        }
        if sorted.len() != indegree.len() {
            return Err(Error::Cycle {
                name: exertion.name.clone(),
            });
        }

        let mut slots: Vec<Option<Exertion>> =
            std::mem::take(&mut exertion.children).into_iter().map(Some).collect();
        exertion.children = sorted.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(())
    }

    /// Number of data edges between distinct regular children of
    /// `exertion`. Edges between descendants count for the children they
    /// sit under.
    pub fn sibling_edge_count(&self, exertion: &Exertion) -> usize {
        let children: HashSet<ExertionId> = exertion
            .children
            .iter()
            .filter(|c| !exertion.is_master(c))
            .map(|c| c.id)
            .collect();

        self.graph
            .edge_references()
            .filter(|e| matches!(e.weight(), EdgeKind::Data { .. }))
            .filter(|e| {
                let from = self.lift(self.graph[e.source()].id, exertion.id, &children);
                let to = self.lift(self.graph[e.target()].id, exertion.id, &children);
                matches!((from, to), (Some(a), Some(b)) if a != b)
            })
            .count()
    }

    /// Walk up from `id` to the direct child of `parent` containing it.
    fn lift(
        &self,
        id: ExertionId,
        parent: ExertionId,
        children: &HashSet<ExertionId>,
    ) -> Option<ExertionId> {
        let mut current = id;
        loop {
            if children.contains(&current) {
                return Some(current);
            }
            match self.graph[self.index[&current]].parent {
                Some(p) if p != parent => current = p,
                _ => return None,
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Whether `dependent` waits directly on `source`.
    pub fn has_dependency(&self, source: &ExertionId, dependent: &ExertionId) -> bool {
        match (self.index.get(source), self.index.get(dependent)) {
            (Some(&s), Some(&d)) => self.graph.find_edge(s, d).is_some(),
            _ => false,
        }
    }

    pub fn dependency_kind(&self, source: &ExertionId, dependent: &ExertionId) -> Option<&EdgeKind> {
        let s = self.index.get(source)?;
        let d = self.index.get(dependent)?;
        let edge = self.graph.find_edge(*s, *d)?;
        self.graph.edge_weight(edge)
    }

    /// Exertions `id` waits on directly.
    pub fn dependencies_of(&self, id: &ExertionId) -> Vec<ExertionId> {
        match self.index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .map(|n| self.graph[n].id)
                .collect(),
            None => Vec::new(),
        }
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("exertions", &self.node_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
