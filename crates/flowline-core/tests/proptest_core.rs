//! Property-based tests for the Flowline core engine.
//!
//! Uses proptest to generate random lines and seeds, then verify that items
//! are conserved, buffers respect their capacity and runs are reproducible.

use flowline_core::distribution::Distribution;
use flowline_core::engine::{SimConfig, Simulation};
use flowline_core::graph::FlowGraph;
use flowline_core::node::*;
use flowline_core::test_utils::*;
use proptest::prelude::*;

// ===========================================================================
// Generators
// ===========================================================================

/// Whole centiseconds between 0.01 s and `max` seconds.
fn arb_secs(max: u32) -> impl Strategy<Value = f64> {
    (1..=max * 100).prop_map(|cs| f64::from(cs) / 100.0)
}

fn arb_capacity() -> impl Strategy<Value = Option<u32>> {
    prop_oneof![Just(None), (1u32..=5).prop_map(Some)]
}

/// A line of one source, `stations` processing stations and a sink, with
/// every link sharing the same capacity.
#[derive(Debug, Clone)]
struct LineSpec {
    interval: f64,
    times: Vec<f64>,
    capacity: Option<u32>,
    limit: u64,
    seed: u64,
}

fn arb_line() -> impl Strategy<Value = LineSpec> {
    (
        arb_secs(3),
        proptest::collection::vec(arb_secs(4), 1..=4),
        arb_capacity(),
        1u64..=40,
        any::<u64>(),
    )
        .prop_map(|(interval, times, capacity, limit, seed)| LineSpec {
            interval,
            times,
            capacity,
            limit,
            seed,
        })
}

fn build(spec: &LineSpec) -> Simulation {
    let mut g = FlowGraph::new();
    let mut prev = g
        .add_node("source", "Source", source(spec.interval, spec.limit))
        .unwrap();
    for (i, &t) in spec.times.iter().enumerate() {
        let st = g
            .add_node(&format!("station{i}"), &format!("Station {i}"), station(t))
            .unwrap();
        g.connect(prev, st, spec.capacity).unwrap();
        prev = st;
    }
    let sink = g.add_node("sink", "Sink", NodeKind::Sink).unwrap();
    g.connect(prev, sink, spec.capacity).unwrap();
    Simulation::new(g, registry(), SimConfig::default().with_seed(spec.seed)).unwrap()
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Every created item is always buffered, held, or sunk.
    #[test]
    fn items_are_conserved_at_every_event(spec in arb_line()) {
        let mut sim = build(&spec);
        while sim.step().unwrap().is_some() {
            let c = sim.conservation();
            prop_assert!(c.is_balanced(), "unbalanced: {c:?}");
        }
        prop_assert_eq!(sim.sunk(), spec.limit);
        prop_assert_eq!(sim.created(), spec.limit);
    }

    /// No buffer ever holds more than its capacity.
    #[test]
    fn buffers_never_exceed_capacity(spec in arb_line()) {
        let mut sim = build(&spec);
        let edges: Vec<_> = sim.graph().edges().map(|(id, e)| (id, e.capacity)).collect();
        while sim.step().unwrap().is_some() {
            for &(edge, cap) in &edges {
                if let Some(cap) = cap {
                    prop_assert!(sim.buffer(edge).unwrap().len() <= cap as usize);
                }
            }
        }
    }

    /// The same seed replays the same event sequence.
    #[test]
    fn seeded_runs_are_reproducible(seed in any::<u64>(), rate in 0.2f64..5.0) {
        let run = || {
            let mut g = FlowGraph::new();
            let s = g
                .add_node("source", "Source", dist_source(Distribution::Exponential { rate }, 30))
                .unwrap();
            let st = g.add_node("station", "Station", station(0.5)).unwrap();
            let k = g.add_node("sink", "Sink", NodeKind::Sink).unwrap();
            g.connect(s, st, Some(2)).unwrap();
            g.connect(st, k, None).unwrap();
            let mut sim =
                Simulation::new(g, registry(), SimConfig::default().with_seed(seed)).unwrap();
            run_to_end(&mut sim);
            (sim.digest(), sim.now(), sim.sunk())
        };
        prop_assert_eq!(run(), run());
    }

    /// A splitter loses nothing, whatever its weights.
    #[test]
    fn splitter_routes_every_item(
        weights in proptest::collection::vec(0.1f64..10.0, 1..=4),
        limit in 1u64..=100,
        seed in any::<u64>(),
    ) {
        let (g, sinks) = splitter_graph(0.5, limit, &weights);
        let mut sim =
            Simulation::new(g, registry(), SimConfig::default().with_seed(seed)).unwrap();
        run_to_end(&mut sim);
        let total: u64 = sinks.iter().map(|&k| sink_received(&sim, k)).sum();
        prop_assert_eq!(total, limit);
    }
}
