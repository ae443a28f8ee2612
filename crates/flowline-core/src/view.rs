//! Read-only views of a running simulation.
//!
//! Everything here is an owned copy, so a presentation layer can hold a
//! [`RunView`] across further dispatches. The core never pushes these
//! anywhere; callers pull them with [`Simulation::view`].

use crate::engine::{Conservation, Simulation};
use crate::id::{EdgeId, NodeId};
use crate::node::{NodeState, ProcessingPhase};
use crate::time::{SimTime, TimeUnit, to_f64};
use serde::Serialize;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Node view
// ---------------------------------------------------------------------------

/// One station as the presentation layer sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub key: String,
    pub name: String,
    pub kind: &'static str,
    pub status: &'static str,
    pub items_in: u64,
    pub items_out: u64,
    /// Items the station holds itself (in process, blocked, or a batch).
    pub held: usize,
    /// Job progress as a 0..1 fraction while busy.
    pub progress: Option<f64>,
    /// Seconds.
    pub busy_time: f64,
    /// Seconds.
    pub blocked_time: f64,
    /// Sinks only.
    pub received: Option<u64>,
    /// Sinks only: received count per item type key.
    pub per_type: BTreeMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Buffer view
// ---------------------------------------------------------------------------

/// One edge's queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferView {
    pub key: String,
    pub from: String,
    pub to: String,
    pub len: usize,
    pub capacity: Option<u32>,
    pub total_passed: u64,
    /// Fill level as a 0..1 fraction; `None` when unbounded.
    pub utilization: Option<f64>,
}

// ---------------------------------------------------------------------------
// Operator view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorView {
    pub key: String,
    pub name: String,
    /// `idle`, `traveling` or `busy`.
    pub status: &'static str,
    /// Key of the station the operator is at or walking to.
    pub position: String,
    pub jobs: u64,
    /// Seconds.
    pub busy_time: f64,
    /// Seconds.
    pub travel_time: f64,
}

// ---------------------------------------------------------------------------
// Run view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    /// Seconds.
    pub now: f64,
    pub pending_events: usize,
    pub dispatched: u64,
    pub nodes: Vec<NodeView>,
    pub buffers: Vec<BufferView>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub operators: Vec<OperatorView>,
    pub conservation: Conservation,
}

impl Simulation {
    /// Snapshot of the clock, every station and every buffer.
    pub fn view(&self) -> RunView {
        RunView {
            now: secs(self.now()),
            pending_events: self.pending_events(),
            dispatched: self.dispatched(),
            nodes: self
                .graph
                .nodes()
                .filter_map(|(id, _)| self.node_view(id))
                .collect(),
            buffers: self
                .graph
                .edges()
                .filter_map(|(id, _)| self.buffer_view(id))
                .collect(),
            operators: self
                .crew()
                .iter()
                .map(|(id, def, state)| OperatorView {
                    key: def.key.clone(),
                    name: def.name.clone(),
                    status: state.status(self.now()),
                    position: self.graph.node_key(state.position).to_string(),
                    jobs: state.jobs,
                    busy_time: secs(self.operator_busy_time(id)),
                    travel_time: secs(self.operator_travel_time(id)),
                })
                .collect(),
            conservation: self.conservation(),
        }
    }

    pub fn node_view(&self, node: NodeId) -> Option<NodeView> {
        let data = self.graph.node(node)?;
        let state = self.states.get(node)?;
        let flags = self.flags.get(node).copied().unwrap_or_default();
        let now = self.now();

        let progress = match state {
            NodeState::Processing(p) => match &p.phase {
                ProcessingPhase::Busy {
                    started, finish, ..
                } if *finish > *started => {
                    Some(((now - *started) / (*finish - *started)).to_num::<f64>().clamp(0.0, 1.0))
                }
                ProcessingPhase::Busy { .. } => Some(1.0),
                _ => None,
            },
            _ => None,
        };
        let (received, per_type) = match state {
            NodeState::Sink(s) => (
                Some(s.received),
                s.per_type
                    .iter()
                    .map(|(t, n)| (self.registry.key(*t).to_string(), *n))
                    .collect(),
            ),
            _ => (None, BTreeMap::new()),
        };

        Some(NodeView {
            key: data.key.clone(),
            name: data.name.clone(),
            kind: data.kind.label(),
            status: state.status(),
            items_in: flags.items_in,
            items_out: flags.items_out,
            held: state.items_held(),
            progress,
            busy_time: secs(self.busy_time(node)),
            blocked_time: secs(self.blocked_time(node)),
            received,
            per_type,
        })
    }

    pub fn buffer_view(&self, edge: EdgeId) -> Option<BufferView> {
        let data = self.graph.edge(edge)?;
        let buffer = self.buffers.get(edge)?;
        Some(BufferView {
            key: data.key.clone(),
            from: self.graph.node_key(data.from).to_string(),
            to: self.graph.node_key(data.to).to_string(),
            len: buffer.len(),
            capacity: buffer.capacity(),
            total_passed: buffer.total_passed(),
            utilization: buffer
                .capacity()
                .map(|cap| buffer.len() as f64 / f64::from(cap.max(1))),
        })
    }
}

fn secs(t: SimTime) -> f64 {
    to_f64(t, TimeUnit::Seconds)
}
