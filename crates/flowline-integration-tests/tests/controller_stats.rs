//! Cross-crate tests: a snapshot driven through the run controller, with
//! statistics collected by `flowline-stats` along the way.

use flowline_core::control::{ControlError, RunController, RunStatus};
use flowline_core::engine::{SimConfig, Simulation};
use flowline_core::scheduler::{RunLimit, RunOutcome};
use flowline_core::snapshot::GraphSnapshot;
use flowline_core::time::seconds;
use flowline_stats::{CSV_HEADER, StatsAggregator, StatsConfig, StatsReport};

// ===========================================================================
// Models
// ===========================================================================

/// Source every second (20 items) -> press (0.5 s) -> sink.
const LINE: &str = r##"{
    "nodes": [
        {"id": "src", "kind": "source",
         "params": {"interval": {"type": "constant", "value": 1.0}, "limit": 20}},
        {"id": "press", "kind": "processing",
         "params": {"processingTime": {"type": "constant", "value": 0.5}}},
        {"id": "sink", "kind": "sink"}
    ],
    "edges": [
        {"id": "in", "from": "src", "to": "press"},
        {"id": "out", "from": "press", "to": "sink"}
    ],
    "itemTypes": [{"id": "part", "color": "#1f77b4"}],
    "probes": [{"label": "out", "edge": "out"}],
    "timeProbes": [{"label": "cycle", "start": {"edge": "in"}, "end": {"node": "sink"}}]
}"##;

/// Parts and bolts assembled into kits, then split 90/10 into shipped and
/// rework. Bolt arrivals and assembly times are random.
const PLANT: &str = r##"{
    "nodes": [
        {"id": "parts", "kind": "source",
         "params": {"interval": {"type": "constant", "value": 1.0}, "limit": 30,
                    "itemTypes": {"mode": "single", "type": "part"}}},
        {"id": "bolts", "kind": "source",
         "params": {"interval": {"type": "exponential", "rate": 1.2}, "limit": 30,
                    "itemTypes": {"mode": "single", "type": "bolt"}}},
        {"id": "asm", "kind": "processing",
         "params": {"processingTime": {"type": "normal", "mean": 0.6, "stddev": 0.1},
                    "sync": {"mode": "wait_all"},
                    "combinations": [{"name": "kit", "ingredients": {"part": 1, "bolt": 1},
                                      "output": "kit"}]}},
        {"id": "qc", "kind": "splitter",
         "params": {"split": {"policy": "weighted", "weights": {"good": 0.9, "bad": 0.1}}}},
        {"id": "shipped", "kind": "sink"},
        {"id": "rework", "kind": "sink"}
    ],
    "edges": [
        {"id": "p_in", "from": "parts", "to": "asm", "capacity": 5},
        {"id": "b_in", "from": "bolts", "to": "asm", "capacity": 5},
        {"id": "asm_out", "from": "asm", "to": "qc"},
        {"id": "good", "from": "qc", "to": "shipped"},
        {"id": "bad", "from": "qc", "to": "rework"}
    ],
    "itemTypes": [
        {"id": "part", "color": "#1f77b4"},
        {"id": "bolt", "color": "#ff7f0e"},
        {"id": "kit", "color": "#2ca02c"}
    ],
    "probes": [{"label": "kits", "edge": "asm_out"}],
    "timeProbes": [{"label": "dispatch", "start": {"edge": "asm_out"}, "end": {"node": "shipped"}}]
}"##;

/// Alternating lathe and mill worked by one operator who walks between them.
/// Lathe times are right-skewed.
const CELL: &str = r##"{
    "nodes": [
        {"id": "src", "kind": "source", "interval": {"type": "constant", "value": 1.0}, "limit": 10},
        {"id": "split", "kind": "splitter", "split": {"policy": "round_robin"}},
        {"id": "lathe", "kind": "processing",
         "processingTime": {"type": "skew_normal", "location": 1.0, "scale": 0.3, "shape": 4.0}},
        {"id": "mill", "kind": "processing", "processingTime": {"type": "constant", "value": 1.0}},
        {"id": "sink", "kind": "sink"}
    ],
    "edges": [
        {"id": "in", "from": "src", "to": "split"},
        {"id": "to_lathe", "from": "split", "to": "lathe"},
        {"id": "to_mill", "from": "split", "to": "mill"},
        {"id": "lathe_out", "from": "lathe", "to": "sink"},
        {"id": "mill_out", "from": "mill", "to": "sink"}
    ],
    "itemTypes": [{"id": "part", "color": "#1f77b4"}],
    "operators": [
        {"id": "ann", "name": "Ann", "machines": ["lathe", "mill"],
         "travel": [
            {"from": "lathe", "to": "mill", "time": {"type": "constant", "value": 0.5}},
            {"from": "mill", "to": "lathe", "time": {"type": "normal", "mean": 0.5, "stddev": 0.1}}
         ]}
    ]
}"##;

fn snapshot(json: &str) -> GraphSnapshot {
    GraphSnapshot::from_json(json).unwrap()
}

fn config(window: f64) -> SimConfig {
    SimConfig {
        probe_window: seconds(window),
        ..SimConfig::default()
    }
}

fn stats_for(sim: &Simulation) -> StatsAggregator {
    StatsAggregator::new(StatsConfig::from_sim(sim.config()))
}

/// Sum of one metric over every window.
fn total(report: &StatsReport, probe: &str, metric: &str) -> f64 {
    report.series(probe, metric).map(|r| r.value).sum()
}

// ===========================================================================
// Controller + stats
// ===========================================================================

#[test]
fn controller_run_produces_windowed_report() {
    let mut ctl = RunController::new(config(10.0));
    ctl.start(&snapshot(LINE), 1).unwrap();

    let mut stats = None;
    while *ctl.status() == RunStatus::Running {
        ctl.advance_by(seconds(5.0)).unwrap();
        let sim = ctl.simulation().unwrap();
        stats.get_or_insert_with(|| stats_for(sim)).update(sim);
    }
    assert_eq!(*ctl.status(), RunStatus::Finished);

    let sim = ctl.simulation().unwrap();
    assert_eq!(sim.now(), seconds(20.5));
    let report = stats.unwrap().finish(sim);

    // Outbound crossings at 1.5, 2.5, ..., 20.5 in windows [0,10) [10,20) [20,20.5).
    let crossings: Vec<f64> = report.series("out", "crossings").map(|r| r.value).collect();
    assert_eq!(crossings, vec![9.0, 10.0, 1.0]);
    let last = report.series("out", "crossings").last().unwrap();
    assert_eq!((last.window_start, last.window_end), (20.0, 20.5));

    assert_eq!(report.value("cycle", "transit_count"), Some(20.0));
    assert!((report.value("cycle", "transit_mean").unwrap() - 0.5).abs() < 1e-9);
    assert!((report.value("cycle", "processing_mean").unwrap() - 0.5).abs() < 1e-9);
    assert!(report.value("cycle", "waiting_mean").unwrap().abs() < 1e-9);

    let press = report.node("press").unwrap();
    assert_eq!((press.items_in, press.items_out), (20, 20));
    assert!((press.utilization - 10.0 / 20.5).abs() < 1e-9);
}

#[test]
fn incremental_stats_match_single_pass() {
    let mut ctl = RunController::new(config(10.0));
    ctl.start(&snapshot(PLANT), 7).unwrap();
    let mut incremental = stats_for(ctl.simulation().unwrap());
    while *ctl.status() == RunStatus::Running {
        ctl.advance(RunLimit::events(25)).unwrap();
        incremental.update(ctl.simulation().unwrap());
    }
    let stepped = incremental.finish(ctl.simulation().unwrap());

    let model = snapshot(PLANT).build().unwrap();
    let mut sim = Simulation::from_model(model, SimConfig { seed: 7, ..config(10.0) }).unwrap();
    assert_eq!(sim.run_configured().unwrap(), RunOutcome::Drained);
    let whole = stats_for(&sim).finish(&sim);

    assert_eq!(stepped, whole);
    assert_eq!(stepped.to_csv(), whole.to_csv());
}

#[test]
fn plant_conserves_items_and_reports_per_type() {
    let mut ctl = RunController::new(config(60.0));
    ctl.start(&snapshot(PLANT), 3).unwrap();
    assert_eq!(ctl.advance(RunLimit::unbounded()).unwrap(), RunOutcome::Drained);

    let sim = ctl.simulation().unwrap();
    assert!(sim.conservation().is_balanced());
    let report = stats_for(sim).finish(sim);

    let shipped = report.node("shipped").unwrap();
    let rework = report.node("rework").unwrap();
    assert_eq!(shipped.items_in + rework.items_in, 30);
    assert_eq!(shipped.per_type.get("kit").copied(), Some(shipped.items_in));
    assert_eq!(total(&report, "kits", "crossings"), 30.0);
    assert_eq!(
        report.value("dispatch", "transit_count"),
        Some(shipped.items_in as f64)
    );
}

#[test]
fn stopped_run_keeps_statistics_readable() {
    let mut ctl = RunController::new(config(10.0));
    ctl.start(&snapshot(LINE), 1).unwrap();
    ctl.advance_by(seconds(3.0)).unwrap();
    ctl.stop().unwrap();
    assert_eq!(*ctl.status(), RunStatus::Stopped);
    assert!(matches!(
        ctl.advance(RunLimit::unbounded()),
        Err(ControlError::NotRunning(RunStatus::Stopped))
    ));

    let sim = ctl.simulation().unwrap();
    assert_eq!(sim.pending_events(), 0);
    let report = stats_for(sim).finish(sim);
    assert_eq!(report.end, 3.0);
    assert_eq!(total(&report, "out", "crossings"), 2.0);
}

#[test]
fn pause_freezes_the_run_until_resumed() {
    let mut ctl = RunController::new(config(10.0));
    ctl.start(&snapshot(LINE), 1).unwrap();
    ctl.advance_by(seconds(4.0)).unwrap();
    ctl.pause().unwrap();

    let before = ctl.view().unwrap();
    assert!(ctl.advance_by(seconds(4.0)).is_err());
    assert_eq!(ctl.view().unwrap(), before);

    ctl.resume().unwrap();
    ctl.advance(RunLimit::unbounded()).unwrap();
    assert_eq!(*ctl.status(), RunStatus::Finished);
    assert_eq!(ctl.simulation().unwrap().sunk(), 20);
}

#[test]
fn speed_changes_pacing_but_not_results() {
    let run = |speed: f64| {
        let mut ctl = RunController::new(config(10.0));
        ctl.set_speed(speed).unwrap();
        ctl.start(&snapshot(PLANT), 11).unwrap();
        while *ctl.status() == RunStatus::Running {
            ctl.advance_by(seconds(2.0)).unwrap();
        }
        let sim = ctl.simulation().unwrap();
        (sim.digest(), stats_for(sim).finish(sim).to_csv())
    };
    assert_eq!(run(0.5), run(8.0));
}

#[test]
fn operator_cell_reports_work_and_walking() {
    let run = |seed: u64| {
        let mut ctl = RunController::new(config(10.0));
        ctl.start(&snapshot(CELL), seed).unwrap();
        assert_eq!(ctl.advance(RunLimit::unbounded()).unwrap(), RunOutcome::Drained);
        let sim = ctl.simulation().unwrap();
        assert!(sim.conservation().is_balanced());
        (sim.digest(), stats_for(sim).finish(sim))
    };
    let (digest, report) = run(4);

    let ann = report.operator("ann").unwrap();
    assert_eq!(ann.jobs, 10);
    assert!(ann.utilization > 0.0 && ann.utilization < 1.0);
    // Ann starts at the lathe and the second item goes to the mill.
    assert!(ann.travel_fraction > 0.0);
    assert!(ann.utilization + ann.travel_fraction <= 1.0 + 1e-9);
    assert_eq!(report.node("sink").unwrap().items_in, 10);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["operators"][0]["key"], "ann");
    assert_eq!(run(4).0, digest);
}

// ===========================================================================
// Reproducibility
// ===========================================================================

#[test]
fn seed_decides_the_run() {
    let run = |seed: u64| {
        let mut ctl = RunController::new(config(10.0));
        ctl.start(&snapshot(PLANT), seed).unwrap();
        ctl.advance(RunLimit::unbounded()).unwrap();
        ctl.simulation().unwrap().digest()
    };
    assert_eq!(run(21), run(21));
    assert_ne!(run(21), run(22));
}

#[test]
fn snapshot_round_trip_preserves_model_and_run() {
    let model = snapshot(PLANT).build().unwrap();
    let mut first = Simulation::from_model(model, config(10.0)).unwrap();
    let captured = first.snapshot();

    let json = captured.to_json().unwrap();
    let rebuilt = GraphSnapshot::from_json(&json).unwrap();
    assert_eq!(rebuilt, captured);

    let mut second = Simulation::from_model(rebuilt.build().unwrap(), config(10.0)).unwrap();
    assert_eq!(second.snapshot(), captured);

    first.run_configured().unwrap();
    second.run_configured().unwrap();
    assert_eq!(first.digest(), second.digest());
}

// ===========================================================================
// Export
// ===========================================================================

#[test]
fn csv_export_and_view_serialize() {
    let mut ctl = RunController::new(config(10.0));
    ctl.start(&snapshot(LINE), 1).unwrap();
    ctl.advance(RunLimit::unbounded()).unwrap();
    let sim = ctl.simulation().unwrap();
    let report = stats_for(sim).finish(sim);

    let mut buf = Vec::new();
    report.write_csv(&mut buf).unwrap();
    let csv = String::from_utf8(buf).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some(CSV_HEADER));
    assert_eq!(lines.count(), report.rows.len());
    assert!(csv.contains("\nout,crossings,0,10,9\n"));

    let view = serde_json::to_value(ctl.view().unwrap()).unwrap();
    assert_eq!(view["pendingEvents"], 0);
    assert_eq!(view["conservation"]["sunk"], 20);
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["displayUnit"], "seconds");
}
