//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::distribution::Distribution;
use crate::engine::{SimConfig, Simulation};
use crate::graph::FlowGraph;
use crate::id::*;
use crate::node::*;
use crate::registry::{ItemTypeRegistry, RegistryBuilder};
use crate::scheduler::{RunLimit, RunOutcome};
use crate::sync::SyncMode;
use crate::time::{SimTime, seconds};
use std::collections::BTreeMap;

// ===========================================================================
// Time helper
// ===========================================================================

pub fn secs(v: f64) -> SimTime {
    seconds(v)
}

// ===========================================================================
// Item types
// ===========================================================================

pub fn part() -> ItemTypeId {
    ItemTypeId(0)
}
pub fn bolt() -> ItemTypeId {
    ItemTypeId(1)
}
pub fn kit() -> ItemTypeId {
    ItemTypeId(2)
}

/// Registry holding `part`, `bolt` and `kit`, in that order.
pub fn registry() -> ItemTypeRegistry {
    let mut b = RegistryBuilder::new();
    b.register("part", "Part", "#1f77b4").unwrap();
    b.register("bolt", "Bolt", "#ff7f0e").unwrap();
    b.register("kit", "Kit", "#2ca02c").unwrap();
    b.build().unwrap()
}

// ===========================================================================
// Node kinds
// ===========================================================================

pub fn constant(v: f64) -> Distribution {
    Distribution::Constant(seconds(v))
}

/// Source of `part` items, one per `interval` seconds.
pub fn source(interval: f64, limit: u64) -> NodeKind {
    typed_source(interval, limit, part())
}

pub fn typed_source(interval: f64, limit: u64, item_type: ItemTypeId) -> NodeKind {
    NodeKind::Source(SourceParams {
        interval: constant(interval),
        batch_size: 1,
        limit,
        assignment: TypeAssignment::Single(item_type),
    })
}

pub fn dist_source(interval: Distribution, limit: u64) -> NodeKind {
    NodeKind::Source(SourceParams {
        interval,
        batch_size: 1,
        limit,
        assignment: TypeAssignment::Single(part()),
    })
}

pub fn station(time: f64) -> NodeKind {
    NodeKind::Processing(ProcessingParams::new(constant(time)))
}

pub fn synced_station(time: f64, sync: SyncMode) -> NodeKind {
    NodeKind::Processing(ProcessingParams::new(constant(time)).with_sync(sync))
}

// ===========================================================================
// Graph setup helpers
// ===========================================================================

/// Source -> station -> sink.
pub struct Line {
    pub source: NodeId,
    pub station: NodeId,
    pub sink: NodeId,
    pub inbound: EdgeId,
    pub outbound: EdgeId,
}

pub fn line_graph(
    interval: f64,
    processing: f64,
    limit: u64,
    capacity: Option<u32>,
) -> (FlowGraph, Line) {
    let mut g = FlowGraph::new();
    let source = g.add_node("source", "Source", self::source(interval, limit)).unwrap();
    let station = g.add_node("station", "Station", self::station(processing)).unwrap();
    let sink = g.add_node("sink", "Sink", NodeKind::Sink).unwrap();
    let inbound = g.connect_keyed("inbound", source, station, capacity).unwrap();
    let outbound = g.connect_keyed("outbound", station, sink, None).unwrap();
    (
        g,
        Line {
            source,
            station,
            sink,
            inbound,
            outbound,
        },
    )
}

/// A ready-to-run line with unbounded buffers and the default config.
pub fn simple_line(interval: f64, processing: f64, limit: u64) -> (Simulation, Line) {
    let (g, line) = line_graph(interval, processing, limit, None);
    let sim = Simulation::new(g, registry(), SimConfig::default()).unwrap();
    (sim, line)
}

/// Two sources feeding one station, then a sink.
pub struct Assembly {
    pub left: NodeId,
    pub right: NodeId,
    pub station: NodeId,
    pub sink: NodeId,
    pub left_in: EdgeId,
    pub right_in: EdgeId,
}

/// `left` makes `part`, `right` makes `bolt`. `sync` is built from the two
/// input edges once they exist.
pub fn assembly_graph(
    left: NodeKind,
    right: NodeKind,
    processing: f64,
    sync: impl FnOnce(EdgeId, EdgeId) -> SyncMode,
) -> (FlowGraph, Assembly) {
    let mut g = FlowGraph::new();
    let l = g.add_node("left", "Left", left).unwrap();
    let r = g.add_node("right", "Right", right).unwrap();
    let st = g.add_node("assembly", "Assembly", station(processing)).unwrap();
    let k = g.add_node("sink", "Sink", NodeKind::Sink).unwrap();
    let left_in = g.connect_keyed("left_in", l, st, None).unwrap();
    let right_in = g.connect_keyed("right_in", r, st, None).unwrap();
    g.connect_keyed("out", st, k, None).unwrap();
    g.set_kind(st, synced_station(processing, sync(left_in, right_in)))
        .unwrap();
    (
        g,
        Assembly {
            left: l,
            right: r,
            station: st,
            sink: k,
            left_in,
            right_in,
        },
    )
}

/// Source -> weighted splitter -> one sink per weight.
pub fn splitter_graph(interval: f64, limit: u64, weights: &[f64]) -> (FlowGraph, Vec<NodeId>) {
    let mut g = FlowGraph::new();
    let s = g.add_node("source", "Source", source(interval, limit)).unwrap();
    let sp = g
        .add_node("split", "Split", NodeKind::Splitter(SplitPolicy::RoundRobin))
        .unwrap();
    g.connect(s, sp, None).unwrap();
    let mut table = BTreeMap::new();
    let mut sinks = Vec::new();
    for (i, &w) in weights.iter().enumerate() {
        let k = g
            .add_node(&format!("sink{i}"), &format!("Sink {i}"), NodeKind::Sink)
            .unwrap();
        let e = g.connect(sp, k, None).unwrap();
        table.insert(e, w);
        sinks.push(k);
    }
    g.set_kind(sp, NodeKind::Splitter(SplitPolicy::Weighted(table)))
        .unwrap();
    (g, sinks)
}

// ===========================================================================
// Run helpers
// ===========================================================================

pub fn run_to_end(sim: &mut Simulation) -> RunOutcome {
    sim.run(RunLimit::unbounded()).unwrap()
}

pub fn sink_received(sim: &Simulation, sink: NodeId) -> u64 {
    match sim.node_state(sink) {
        Some(NodeState::Sink(s)) => s.received,
        _ => 0,
    }
}

pub fn station_state(sim: &Simulation, node: NodeId) -> &ProcessingState {
    match sim.node_state(node) {
        Some(NodeState::Processing(p)) => p,
        other => panic!("expected a processing station, got {other:?}"),
    }
}
