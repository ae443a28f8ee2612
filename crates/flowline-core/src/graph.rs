use crate::error::{ParamError, SimError, TopologyError};
use crate::id::*;
use crate::node::{NodeKind, SplitPolicy};
use crate::registry::ItemTypeRegistry;
use crate::sync::SyncMode;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::{HashMap, VecDeque};

// ---------------------------------------------------------------------------
// Core data structures
// ---------------------------------------------------------------------------

/// Adjacency lists for a single node, tracking incoming and outgoing edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NodeAdjacency {
    /// Edges whose destination is this node, in connection order.
    inputs: Vec<EdgeId>,
    /// Edges whose source is this node, in connection order.
    outputs: Vec<EdgeId>,
}

/// Per-node data stored in the flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    /// Stable key used by model files.
    pub key: String,
    pub name: String,
    pub kind: NodeKind,
}

/// Per-edge data stored in the flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeData {
    pub key: String,
    pub from: NodeId,
    pub to: NodeId,
    /// Buffer capacity; `None` is unbounded.
    pub capacity: Option<u32>,
}

// ---------------------------------------------------------------------------
// FlowGraph
// ---------------------------------------------------------------------------

/// The production line: stations (nodes) joined by buffered links (edges).
///
/// Adjacency is stored in a `SecondaryMap` keyed by `NodeId`, which keeps it
/// in step with the primary `nodes` SlotMap. Input and output lists keep
/// connection order; that order is the tie-break for synchronization and
/// the order sinks drain their inputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowGraph {
    nodes: SlotMap<NodeId, NodeData>,
    edges: SlotMap<EdgeId, EdgeData>,
    adjacency: SecondaryMap<NodeId, NodeAdjacency>,
    node_keys: HashMap<String, NodeId>,
    edge_keys: HashMap<String, EdgeId>,
}

impl FlowGraph {
    /// Create a new, empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Add a station. Keys must be unique.
    pub fn add_node(
        &mut self,
        key: &str,
        name: &str,
        kind: NodeKind,
    ) -> Result<NodeId, TopologyError> {
        if self.node_keys.contains_key(key) {
            return Err(TopologyError::DuplicateNode(key.to_string()));
        }
        let id = self.nodes.insert(NodeData {
            key: key.to_string(),
            name: name.to_string(),
            kind,
        });
        self.adjacency.insert(id, NodeAdjacency::default());
        self.node_keys.insert(key.to_string(), id);
        Ok(id)
    }

    /// Connect two stations with an auto-generated edge key.
    pub fn connect(
        &mut self,
        from: NodeId,
        to: NodeId,
        capacity: Option<u32>,
    ) -> Result<EdgeId, TopologyError> {
        let key = format!("e{}", self.edges.len());
        self.connect_keyed(&key, from, to, capacity)
    }

    /// Connect two stations. Returns the new edge.
    pub fn connect_keyed(
        &mut self,
        key: &str,
        from: NodeId,
        to: NodeId,
        capacity: Option<u32>,
    ) -> Result<EdgeId, TopologyError> {
        if self.edge_keys.contains_key(key) {
            return Err(TopologyError::DuplicateEdge(key.to_string()));
        }
        for node in [from, to] {
            if !self.nodes.contains_key(node) {
                return Err(TopologyError::NodeNotFound(node));
            }
        }
        let id = self.edges.insert(EdgeData {
            key: key.to_string(),
            from,
            to,
            capacity,
        });
        if let Some(adj) = self.adjacency.get_mut(from) {
            adj.outputs.push(id);
        }
        if let Some(adj) = self.adjacency.get_mut(to) {
            adj.inputs.push(id);
        }
        self.edge_keys.insert(key.to_string(), id);
        Ok(id)
    }

    /// Replace a node's parameters, e.g. to add per-edge weights once the
    /// edges exist.
    pub fn set_kind(&mut self, node: NodeId, kind: NodeKind) -> Result<(), TopologyError> {
        let data = self
            .nodes
            .get_mut(node)
            .ok_or(TopologyError::NodeNotFound(node))?;
        data.kind = kind;
        Ok(())
    }

    /// Remove a station and every edge touching it.
    pub fn remove_node(&mut self, node: NodeId) -> Result<(), TopologyError> {
        let adj = self
            .adjacency
            .remove(node)
            .ok_or(TopologyError::NodeNotFound(node))?;
        for edge in adj.inputs.into_iter().chain(adj.outputs) {
            // Self-loops appear in both lists.
            let _ = self.disconnect(edge);
        }
        if let Some(data) = self.nodes.remove(node) {
            self.node_keys.remove(&data.key);
        }
        Ok(())
    }

    /// Remove an edge.
    pub fn disconnect(&mut self, edge: EdgeId) -> Result<(), TopologyError> {
        let data = self
            .edges
            .remove(edge)
            .ok_or(TopologyError::EdgeNotFound(edge))?;
        if let Some(adj) = self.adjacency.get_mut(data.from) {
            adj.outputs.retain(|&e| e != edge);
        }
        if let Some(adj) = self.adjacency.get_mut(data.to) {
            adj.inputs.retain(|&e| e != edge);
        }
        self.edge_keys.remove(&data.key);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn node(&self, node: NodeId) -> Option<&NodeData> {
        self.nodes.get(node)
    }

    pub fn edge(&self, edge: EdgeId) -> Option<&EdgeData> {
        self.edges.get(edge)
    }

    pub fn node_id(&self, key: &str) -> Option<NodeId> {
        self.node_keys.get(key).copied()
    }

    pub fn edge_id(&self, key: &str) -> Option<EdgeId> {
        self.edge_keys.get(key).copied()
    }

    /// Display key of a node, or `"?"` if it is gone.
    pub fn node_key(&self, node: NodeId) -> &str {
        self.nodes.get(node).map(|n| n.key.as_str()).unwrap_or("?")
    }

    pub fn edge_key(&self, edge: EdgeId) -> &str {
        self.edges.get(edge).map(|e| e.key.as_str()).unwrap_or("?")
    }

    /// Edges feeding into a node, in connection order.
    pub fn inputs(&self, node: NodeId) -> &[EdgeId] {
        self.adjacency
            .get(node)
            .map(|adj| adj.inputs.as_slice())
            .unwrap_or(&[])
    }

    /// Edges leaving a node, in connection order.
    pub fn outputs(&self, node: NodeId) -> &[EdgeId] {
        self.adjacency
            .get(node)
            .map(|adj| adj.outputs.as_slice())
            .unwrap_or(&[])
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Iterate nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &NodeData)> {
        self.nodes.iter()
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &EdgeData)> {
        self.edges.iter()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Check the graph can be simulated: structure first, then every
    /// station's parameters.
    pub fn validate(&self) -> Result<(), SimError> {
        self.check(|_| false)
    }

    /// [`validate`](Self::validate), with the registry's per-type processing
    /// times taken into account: a station that some item type passes
    /// through in zero time counts as instant when looking for cycles.
    pub fn validate_for(&self, registry: &ItemTypeRegistry) -> Result<(), SimError> {
        self.check(|node| registry.has_zero_override(node))
    }

    fn check(&self, zero_override: impl Fn(NodeId) -> bool) -> Result<(), SimError> {
        self.check_structure()?;
        self.find_zero_delay_cycle(&zero_override)?;
        for (id, data) in &self.nodes {
            self.check_params(id, data)?;
        }
        for (_, edge) in &self.edges {
            if edge.capacity == Some(0) {
                return Err(SimError::param(edge.key.clone(), ParamError::ZeroCapacity));
            }
        }
        Ok(())
    }

    fn check_structure(&self) -> Result<(), TopologyError> {
        if self.nodes.is_empty() {
            return Err(TopologyError::Empty);
        }
        for (id, data) in &self.nodes {
            let inputs = self.inputs(id).len();
            let outputs = self.outputs(id).len();
            if inputs + outputs == 0 {
                return Err(TopologyError::OrphanNode(data.key.clone()));
            }
            let (ok, expected) = match data.kind {
                NodeKind::Source(_) => (inputs == 0 && outputs == 1, "0 inputs and 1 output"),
                NodeKind::Sink => (inputs >= 1 && outputs == 0, "at least 1 input and 0 outputs"),
                NodeKind::Processing(_) | NodeKind::Merger(_) => {
                    (inputs >= 1 && outputs == 1, "at least 1 input and 1 output")
                }
                NodeKind::Splitter(_) => {
                    (inputs == 1 && outputs >= 1, "1 input and at least 1 output")
                }
            };
            if !ok {
                return Err(TopologyError::Arity {
                    node: data.key.clone(),
                    kind: data.kind.label(),
                    inputs,
                    outputs,
                    expected,
                });
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over the subgraph of instant stations. Anything left
    /// with a non-zero in-degree sits on a cycle items could loop around
    /// without time advancing.
    fn find_zero_delay_cycle(
        &self,
        zero_override: &impl Fn(NodeId) -> bool,
    ) -> Result<(), TopologyError> {
        let instant = |n: NodeId| {
            self.nodes.get(n).is_some_and(|d| match &d.kind {
                NodeKind::Processing(_) => d.kind.is_instant() || zero_override(n),
                kind => kind.is_instant(),
            })
        };

        let mut in_degree: SecondaryMap<NodeId, usize> = SecondaryMap::new();
        for (nid, _) in &self.nodes {
            if instant(nid) {
                in_degree.insert(nid, 0);
            }
        }
        for (_, edge) in &self.edges {
            if instant(edge.from) && instant(edge.to) {
                if let Some(deg) = in_degree.get_mut(edge.to) {
                    *deg += 1;
                }
            }
        }

        let mut queue: VecDeque<NodeId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(nid, _)| nid)
            .collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for &eid in self.outputs(node) {
                let Some(to) = self.edges.get(eid).map(|e| e.to) else {
                    continue;
                };
                if !instant(to) {
                    continue;
                }
                if let Some(deg) = in_degree.get_mut(to) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(to);
                    }
                }
            }
        }

        if visited < in_degree.len() {
            let mut stuck: Vec<String> = in_degree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(nid, _)| self.node_key(nid).to_string())
                .collect();
            stuck.sort();
            return Err(TopologyError::ZeroDelayCycle(stuck));
        }
        Ok(())
    }

    fn check_params(&self, id: NodeId, data: &NodeData) -> Result<(), SimError> {
        let fail = |reason| Err(SimError::param(data.key.clone(), reason));
        match &data.kind {
            NodeKind::Source(p) => {
                p.interval.validate().or_else(fail)?;
                p.assignment.validate().or_else(fail)?;
                if p.batch_size == 0 {
                    return fail(ParamError::ZeroBatch);
                }
                if p.limit == 0 && p.interval.is_zero() {
                    return fail(ParamError::UnboundedZeroInterval);
                }
                let capacity = self
                    .outputs(id)
                    .first()
                    .and_then(|&e| self.edges.get(e))
                    .and_then(|e| e.capacity);
                if let Some(capacity) = capacity {
                    if p.batch_size > capacity {
                        return fail(ParamError::BatchExceedsCapacity {
                            batch: p.batch_size,
                            capacity,
                        });
                    }
                }
            }
            NodeKind::Processing(p) => {
                p.time.validate().or_else(fail)?;
                p.validate_combinations().or_else(fail)?;
                if let SyncMode::WaitNPerBranch(quota) = &p.sync {
                    for &edge in self.inputs(id) {
                        match quota.get(&edge) {
                            None => return fail(ParamError::MissingBranchCount(edge)),
                            Some(0) => return fail(ParamError::ZeroBranchCount(edge)),
                            Some(_) => {}
                        }
                    }
                    if let Some(&extra) = quota.keys().find(|e| !self.inputs(id).contains(e)) {
                        return fail(ParamError::UnknownBranch(extra));
                    }
                }
            }
            NodeKind::Splitter(SplitPolicy::Weighted(weights)) => {
                let outputs = self.outputs(id);
                if let Some(&extra) = weights.keys().find(|e| !outputs.contains(e)) {
                    return fail(ParamError::UnknownBranch(extra));
                }
                if let Some(&missing) = outputs.iter().find(|e| !weights.contains_key(e)) {
                    return fail(ParamError::MissingWeight(missing));
                }
                let ok = weights.values().all(|w| w.is_finite() && *w >= 0.0)
                    && weights.values().any(|w| *w > 0.0);
                if !ok {
                    return fail(ParamError::BadWeights);
                }
            }
            NodeKind::Splitter(SplitPolicy::RoundRobin) | NodeKind::Sink | NodeKind::Merger(_) => {}
        }
        Ok(())
    }
}
