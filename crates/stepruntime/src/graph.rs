//! Workflow graph structure: adjacency, ordering and dependency chains.
//!
//! A [`GraphManager`] is built once per execution request from the persisted
//! node and connection records. Connections whose endpoints are missing from
//! the node set are dropped (and logged) rather than rejected, so stale
//! references left behind by editors do not block a run. The topological
//! order is computed once at construction with Kahn's algorithm; a graph it
//! cannot fully order is structurally invalid.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef, Reversed};
use petgraph::Direction;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use stepcore::{ConnectionRecord, GraphError, NodeId, NodeRecord, WorkflowGraph};

/// One (source_port → target_port) mapping between a pair of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub source_port: String,
    pub target_port: String,
}

/// Read-only, graph-derived view of a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeContext {
    pub node_id: NodeId,
    pub predecessors: Vec<NodeId>,
    pub successors: Vec<NodeId>,
    /// `None` when no root reaches the node.
    pub depth: Option<usize>,
    pub execution_order: usize,
    /// Port mappings keyed by predecessor id.
    pub inbound: BTreeMap<NodeId, Vec<PortMapping>>,
    /// Port mappings keyed by successor id.
    pub outbound: BTreeMap<NodeId, Vec<PortMapping>>,
}

pub struct GraphManager {
    /// Edge weights index into `connections`.
    graph: DiGraph<NodeId, usize>,
    indices: HashMap<NodeId, NodeIndex>,
    connections: Vec<ConnectionRecord>,
    dropped: Vec<ConnectionRecord>,
    predecessors: HashMap<NodeId, Vec<NodeId>>,
    successors: HashMap<NodeId, Vec<NodeId>>,
    order: Result<Vec<NodeId>, GraphError>,
    positions: HashMap<NodeId, usize>,
    depths: HashMap<NodeId, usize>,
}

impl GraphManager {
    pub fn new<'a>(
        nodes: impl IntoIterator<Item = &'a NodeRecord>,
        connections: impl IntoIterator<Item = &'a ConnectionRecord>,
    ) -> Self {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for node in nodes {
            if indices.contains_key(&node.id) {
                tracing::warn!("Ignoring duplicate node record: {}", node.id);
                continue;
            }
            let idx = graph.add_node(node.id.clone());
            indices.insert(node.id.clone(), idx);
        }

        let mut kept = Vec::new();
        let mut dropped = Vec::new();
        let mut predecessors: HashMap<NodeId, Vec<NodeId>> = indices
            .keys()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        let mut successors = predecessors.clone();

        for conn in connections {
            let (Some(&from), Some(&to)) = (
                indices.get(&conn.source_node_id),
                indices.get(&conn.target_node_id),
            ) else {
                tracing::warn!(
                    "Dropping connection {} ({} -> {}): endpoint not in graph",
                    conn.id,
                    conn.source_node_id,
                    conn.target_node_id
                );
                dropped.push(conn.clone());
                continue;
            };

            graph.add_edge(from, to, kept.len());
            kept.push(conn.clone());

            let preds = predecessors.entry(conn.target_node_id.clone()).or_default();
            if !preds.contains(&conn.source_node_id) {
                preds.push(conn.source_node_id.clone());
            }
            let succs = successors.entry(conn.source_node_id.clone()).or_default();
            if !succs.contains(&conn.target_node_id) {
                succs.push(conn.target_node_id.clone());
            }
        }

        let mut manager = Self {
            graph,
            indices,
            connections: kept,
            dropped,
            predecessors,
            successors,
            order: Ok(Vec::new()),
            positions: HashMap::new(),
            depths: HashMap::new(),
        };

        manager.order = manager.kahn_order();
        if let Ok(order) = &manager.order {
            manager.positions = order
                .iter()
                .enumerate()
                .map(|(i, id)| (id.clone(), i))
                .collect();
        }
        manager.depths = manager.layer_depths();
        manager
    }

    pub fn from_workflow(workflow: &WorkflowGraph) -> Self {
        Self::new(&workflow.nodes, &workflow.connections)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.indices.contains_key(id)
    }

    /// Node ids in record order.
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.graph.node_weights()
    }

    pub fn connections(&self) -> &[ConnectionRecord] {
        &self.connections
    }

    /// Connections discarded at construction because an endpoint was missing.
    pub fn dropped_connections(&self) -> &[ConnectionRecord] {
        &self.dropped
    }

    pub fn predecessors(&self, id: &str) -> &[NodeId] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn successors(&self, id: &str) -> &[NodeId] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn connections_to(&self, id: &str) -> Vec<&ConnectionRecord> {
        self.connections
            .iter()
            .filter(|c| c.target_node_id == id)
            .collect()
    }

    pub fn connections_from(&self, id: &str) -> Vec<&ConnectionRecord> {
        self.connections
            .iter()
            .filter(|c| c.source_node_id == id)
            .collect()
    }

    /// Nodes without predecessors, in record order.
    pub fn roots(&self) -> Vec<&NodeId> {
        self.node_ids()
            .filter(|id| self.predecessors(id).is_empty())
            .collect()
    }

    /// Nodes without successors, in record order.
    pub fn leaves(&self) -> Vec<&NodeId> {
        self.node_ids()
            .filter(|id| self.successors(id).is_empty())
            .collect()
    }

    /// Breadth-first distance from the nearest root.
    ///
    /// Returns `None` for unknown nodes and for nodes no root reaches, which
    /// in a graph with a cycle are the cycle members and their descendants.
    pub fn depth(&self, id: &str) -> Option<usize> {
        self.depths.get(id).copied()
    }

    /// The full topological order, or the structural error that prevented it.
    pub fn topological_order(&self) -> Result<&[NodeId], GraphError> {
        self.order.as_deref().map_err(Clone::clone)
    }

    /// Position of `id` within the topological order.
    pub fn execution_order(&self, id: &str) -> Result<usize, GraphError> {
        self.topological_order()?;
        self.positions
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))
    }

    pub fn node_context(&self, id: &str) -> Result<NodeContext, GraphError> {
        if !self.contains(id) {
            return Err(GraphError::NodeNotFound(id.to_string()));
        }

        let mut inbound: BTreeMap<NodeId, Vec<PortMapping>> = BTreeMap::new();
        for conn in self.connections_to(id) {
            inbound
                .entry(conn.source_node_id.clone())
                .or_default()
                .push(PortMapping {
                    source_port: conn.source_port.clone(),
                    target_port: conn.target_port.clone(),
                });
        }

        let mut outbound: BTreeMap<NodeId, Vec<PortMapping>> = BTreeMap::new();
        for conn in self.connections_from(id) {
            outbound
                .entry(conn.target_node_id.clone())
                .or_default()
                .push(PortMapping {
                    source_port: conn.source_port.clone(),
                    target_port: conn.target_port.clone(),
                });
        }

        Ok(NodeContext {
            node_id: id.to_string(),
            predecessors: self.predecessors(id).to_vec(),
            successors: self.successors(id).to_vec(),
            depth: self.depth(id),
            execution_order: self.execution_order(id)?,
            inbound,
            outbound,
        })
    }

    /// All transitive ancestors of `id`, nearest first, each once.
    pub fn upstream_chain(&self, id: &str) -> Vec<NodeId> {
        let Some(&start) = self.indices.get(id) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, start);
        let mut chain = Vec::new();
        while let Some(idx) = bfs.next(reversed) {
            if idx != start {
                chain.push(self.graph[idx].clone());
            }
        }
        chain
    }

    /// All transitive descendants of `id`, nearest first, each once.
    pub fn downstream_chain(&self, id: &str) -> Vec<NodeId> {
        let Some(&start) = self.indices.get(id) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut chain = Vec::new();
        while let Some(idx) = bfs.next(&self.graph) {
            if idx != start {
                chain.push(self.graph[idx].clone());
            }
        }
        chain
    }

    /// Outgoing edges of `idx`, in connection order.
    fn outgoing(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut edges: Vec<(usize, NodeIndex)> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| (*e.weight(), e.target()))
            .collect();
        edges.sort_by_key(|(conn, _)| *conn);
        edges.into_iter().map(|(_, target)| target).collect()
    }

    fn kahn_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let degree = self.graph.edges_directed(idx, Direction::Incoming).count();
                (idx, degree)
            })
            .collect();

        // Seed with every zero in-degree node, in record order.
        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| in_degree[idx] == 0)
            .collect();

        let mut sorted = Vec::with_capacity(self.graph.node_count());
        while let Some(idx) = queue.pop_front() {
            sorted.push(self.graph[idx].clone());
            for target in self.outgoing(idx) {
                if let Some(degree) = in_degree.get_mut(&target) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(target);
                    }
                }
            }
        }

        if sorted.len() < self.graph.node_count() {
            let unresolved = self
                .graph
                .node_indices()
                .filter(|idx| in_degree[idx] > 0)
                .map(|idx| self.graph[idx].clone())
                .collect();
            return Err(GraphError::Cycle { unresolved });
        }

        Ok(sorted)
    }

    /// Multi-source BFS layering outward from every root at once.
    fn layer_depths(&self) -> HashMap<NodeId, usize> {
        let mut depths: HashMap<NodeIndex, usize> = HashMap::new();
        let mut queue = VecDeque::new();

        for idx in self.graph.node_indices() {
            if self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .next()
                .is_none()
            {
                depths.insert(idx, 0);
                queue.push_back(idx);
            }
        }

        while let Some(idx) = queue.pop_front() {
            let next = depths[&idx] + 1;
            for target in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if !depths.contains_key(&target) {
                    depths.insert(target, next);
                    queue.push_back(target);
                }
            }
        }

        depths
            .into_iter()
            .map(|(idx, depth)| (self.graph[idx].clone(), depth))
            .collect()
    }
}
