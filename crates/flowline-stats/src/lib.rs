//! Windowed statistics for Flowline runs.
//!
//! Measurement probes only record raw crossings and queue-length steps. This
//! crate folds those series into contiguous windows `[k*w, (k+1)*w)` and adds
//! whole-run summaries for time probes and stations. The last window is
//! closed at the run end, so it may be shorter than `w`.
//!
//! # Usage
//!
//! ```ignore
//! let mut stats = StatsAggregator::new(StatsConfig::from_sim(sim.config()));
//! while sim.run(RunLimit::until(next)).is_ok() {
//!     stats.update(&sim);
//!     // ...
//! }
//! let report = stats.finish(&sim);
//! std::fs::write("stats.csv", report.to_csv())?;
//! ```
//!
//! Each [`StatsAggregator::update`] consumes only what the probes recorded
//! since the previous call, so feeding after every slice of a run costs the
//! same as one pass at the end.

use std::collections::BTreeMap;
use std::io;

use flowline_core::engine::{SimConfig, Simulation};
use flowline_core::id::ProbeId;
use flowline_core::node::NodeState;
use flowline_core::probe::{MeasurementProbe, RunningStats};
use flowline_core::time::{SimTime, TimeUnit, seconds, to_f64};
use serde::Serialize;

/// Exact CSV header written by [`StatsReport::to_csv`].
pub const CSV_HEADER: &str = "probe_id,metric,window_start,window_end,value";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the statistics aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsConfig {
    /// Window length. Values below one centisecond are raised to it.
    pub window: SimTime,
    /// Closed windows kept per probe for trend display.
    pub history_capacity: usize,
    /// Unit for every time value in the report.
    pub display_unit: TimeUnit,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window: seconds(60.0),
            history_capacity: 256,
            display_unit: TimeUnit::Seconds,
        }
    }
}

impl StatsConfig {
    /// Window and display unit taken from the run configuration.
    pub fn from_sim(config: &SimConfig) -> Self {
        Self {
            window: config.probe_window,
            display_unit: config.display_unit,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Ring buffer history
// ---------------------------------------------------------------------------

/// A fixed-capacity ring buffer of `f64` samples for trend analysis.
///
/// When full, the oldest entry is overwritten. Iterates oldest-to-newest.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<f64>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity.max(1)],
            head: 0,
            len: 0,
        }
    }

    /// Push a value, overwriting the oldest entry if at capacity.
    pub fn push(&mut self, value: f64) {
        self.data[self.head] = value;
        self.head = (self.head + 1) % self.capacity();
        if self.len < self.capacity() {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The most recently pushed value, if any.
    pub fn latest(&self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        let idx = if self.head == 0 {
            self.capacity() - 1
        } else {
            self.head - 1
        };
        Some(self.data[idx])
    }

    /// Values from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        let start = if self.len < self.capacity() {
            0
        } else {
            self.head
        };
        (0..self.len).map(move |i| self.data[(start + i) % self.capacity()])
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.iter().collect()
    }

    pub fn clear(&mut self) {
        self.data.fill(0.0);
        self.head = 0;
        self.len = 0;
    }
}

// ---------------------------------------------------------------------------
// Per-window accumulation
// ---------------------------------------------------------------------------

/// Raw sums for one window of one probe. Times are canonical centiseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct WindowAcc {
    crossings: u64,
    /// Integral of queue length over time.
    wip_area: f64,
    wip_max: u32,
    interval_sum: f64,
    intervals: u64,
}

fn window_index(t: f64, w: f64) -> u64 {
    (t / w).floor().max(0.0) as u64
}

// ---------------------------------------------------------------------------
// Per-probe statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ProbeStats {
    label: String,
    /// First WIP sample of the series this accumulator started from; a
    /// different one means the probe was reset.
    origin: Option<(SimTime, u32)>,
    seen_crossings: usize,
    seen_wip: usize,
    last_crossing: SimTime,
    /// Queue length in force since `since`.
    level: u32,
    since: SimTime,
    windows: BTreeMap<u64, WindowAcc>,
    /// Throughput of closed windows, items per second.
    history: RingBuffer,
    closed: u64,
}

impl ProbeStats {
    fn new(probe: &MeasurementProbe, history_capacity: usize) -> Self {
        Self {
            label: probe.label.clone(),
            origin: probe.wip_series().first().copied(),
            seen_crossings: 0,
            seen_wip: 0,
            last_crossing: SimTime::ZERO,
            level: 0,
            since: SimTime::ZERO,
            windows: BTreeMap::new(),
            history: RingBuffer::new(history_capacity),
            closed: 0,
        }
    }

    fn is_stale(&self, probe: &MeasurementProbe) -> bool {
        probe.crossings().len() < self.seen_crossings
            || probe.wip_series().len() < self.seen_wip
            || probe.wip_series().first().copied() != self.origin
    }

    /// Fold in everything recorded since the last call. The final WIP sample
    /// is left alone unless `settle` is set: the probe may still overwrite
    /// it at the same instant.
    fn consume(&mut self, probe: &MeasurementProbe, w: f64, settle: bool) {
        for &t in &probe.crossings()[self.seen_crossings..] {
            let interval = (t - self.last_crossing).to_num::<f64>();
            let acc = self.window_mut(t, w);
            acc.crossings += 1;
            acc.interval_sum += interval;
            acc.intervals += 1;
            self.last_crossing = t;
        }
        self.seen_crossings = probe.crossings().len();

        let series = probe.wip_series();
        let settled = if settle {
            series.len()
        } else {
            series.len().saturating_sub(1)
        };
        for &(t, level) in &series[self.seen_wip.min(settled)..settled] {
            self.integrate(t, w);
            let acc = self.window_mut(t, w);
            acc.wip_max = acc.wip_max.max(level);
            self.level = level;
            self.since = self.since.max(t);
        }
        self.seen_wip = self.seen_wip.max(settled);
    }

    fn window_mut(&mut self, t: SimTime, w: f64) -> &mut WindowAcc {
        self.windows
            .entry(window_index(t.to_num::<f64>(), w))
            .or_default()
    }

    /// Spread the current level over `[since, to)`.
    fn integrate(&mut self, to: SimTime, w: f64) {
        let from = self.since.to_num::<f64>();
        let to = to.to_num::<f64>();
        if to <= from {
            return;
        }
        let level = self.level;
        let mut k = window_index(from, w);
        loop {
            let start = k as f64 * w;
            if start >= to {
                break;
            }
            let overlap = to.min(start + w) - from.max(start);
            if overlap > 0.0 {
                let acc = self.windows.entry(k).or_default();
                acc.wip_area += f64::from(level) * overlap;
                acc.wip_max = acc.wip_max.max(level);
            }
            k += 1;
        }
    }

    /// Push throughput of every window that ended before `now`.
    fn close_windows(&mut self, now: SimTime, w: f64) {
        let current = window_index(now.to_num::<f64>(), w);
        while self.closed < current {
            let crossings = self
                .windows
                .get(&self.closed)
                .map(|acc| acc.crossings)
                .unwrap_or(0);
            self.history.push(crossings as f64 / (w / 100.0));
            self.closed += 1;
        }
    }

    fn rows(&self, end: f64, w: f64, unit: TimeUnit, out: &mut Vec<StatRow>) {
        if end <= 0.0 {
            return;
        }
        let last = (end / w).ceil().max(1.0) as u64 - 1;
        let mut windows = self.windows.clone();
        // Anything stamped exactly at the run end joins the last window.
        let overflow: Vec<u64> = windows.range(last + 1..).map(|(k, _)| *k).collect();
        for k in overflow {
            if let Some(extra) = windows.remove(&k) {
                let acc = windows.entry(last).or_default();
                acc.crossings += extra.crossings;
                acc.interval_sum += extra.interval_sum;
                acc.intervals += extra.intervals;
                acc.wip_max = acc.wip_max.max(extra.wip_max);
            }
        }

        let scale = unit.factor() as f64;
        for k in 0..=last {
            let start = k as f64 * w;
            let stop = (start + w).min(end);
            let span = stop - start;
            if span <= 0.0 {
                continue;
            }
            let acc = windows.get(&k).copied().unwrap_or_default();
            let row = |metric: &str, value: f64| StatRow {
                probe_id: self.label.clone(),
                metric: metric.to_string(),
                window_start: start / scale,
                window_end: stop / scale,
                value,
            };
            out.push(row("crossings", acc.crossings as f64));
            out.push(row("throughput", acc.crossings as f64 / (span / 100.0)));
            out.push(row("wip_mean", acc.wip_area / span));
            out.push(row("wip_max", f64::from(acc.wip_max)));
            if acc.intervals > 0 {
                out.push(row(
                    "cycle_time_mean",
                    acc.interval_sum / acc.intervals as f64 / scale,
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// One line of the statistics export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatRow {
    pub probe_id: String,
    pub metric: String,
    pub window_start: f64,
    pub window_end: f64,
    pub value: f64,
}

/// Whole-run figures for one station.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub key: String,
    pub kind: &'static str,
    /// Busy fraction of the run.
    pub utilization: f64,
    /// Fraction of the run spent unable to hand output on.
    pub blocked_fraction: f64,
    pub items_in: u64,
    pub items_out: u64,
    /// Sinks only: received count per item type key.
    pub per_type: BTreeMap<String, u64>,
}

/// Whole-run figures for one operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSummary {
    pub key: String,
    pub jobs: u64,
    /// Working fraction of the run, walking excluded.
    pub utilization: f64,
    /// Walking fraction of the run.
    pub travel_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub display_unit: TimeUnit,
    /// Run end in the display unit.
    pub end: f64,
    pub rows: Vec<StatRow>,
    pub nodes: Vec<NodeSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub operators: Vec<OperatorSummary>,
}

impl StatsReport {
    /// Rows of one probe and metric, in window order.
    pub fn series<'a>(
        &'a self,
        probe_id: &'a str,
        metric: &'a str,
    ) -> impl Iterator<Item = &'a StatRow> + 'a {
        self.rows
            .iter()
            .filter(move |r| r.probe_id == probe_id && r.metric == metric)
    }

    /// The single value of a whole-run metric, if present.
    pub fn value(&self, probe_id: &str, metric: &str) -> Option<f64> {
        self.series(probe_id, metric).next().map(|r| r.value)
    }

    pub fn node(&self, key: &str) -> Option<&NodeSummary> {
        self.nodes.iter().find(|n| n.key == key)
    }

    pub fn operator(&self, key: &str) -> Option<&OperatorSummary> {
        self.operators.iter().find(|o| o.key == key)
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::with_capacity(64 * (self.rows.len() + 1));
        out.push_str(CSV_HEADER);
        out.push('\n');
        for row in &self.rows {
            out.push_str(&csv_field(&row.probe_id));
            out.push(',');
            out.push_str(&csv_field(&row.metric));
            out.push_str(&format!(
                ",{},{},{}\n",
                row.window_start, row.window_end, row.value
            ));
        }
        out
    }

    pub fn write_csv<W: io::Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(self.to_csv().as_bytes())
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

// ---------------------------------------------------------------------------
// StatsAggregator
// ---------------------------------------------------------------------------

/// Folds probe series from a [`Simulation`] into windowed statistics.
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    config: StatsConfig,
    /// Window length in centiseconds.
    window: f64,
    /// Indexed like `Simulation::probes`.
    probes: Vec<ProbeStats>,
}

impl StatsAggregator {
    pub fn new(config: StatsConfig) -> Self {
        let window = config.window.to_num::<f64>().max(1.0);
        Self {
            config,
            window,
            probes: Vec::new(),
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Consume everything the probes recorded since the last call.
    pub fn update(&mut self, sim: &Simulation) {
        self.feed(sim, false);
    }

    fn feed(&mut self, sim: &Simulation, settle: bool) {
        let w = self.window;
        for (i, probe) in sim.probes().iter().enumerate() {
            if i == self.probes.len() {
                self.probes
                    .push(ProbeStats::new(probe, self.config.history_capacity));
            }
            let stats = &mut self.probes[i];
            if stats.is_stale(probe) {
                *stats = ProbeStats::new(probe, self.config.history_capacity);
            }
            stats.consume(probe, w, settle);
            stats.close_windows(sim.now(), w);
        }
    }

    /// Throughput (items per second) of the most recent closed windows.
    pub fn throughput_history(&self, probe: ProbeId) -> Option<Vec<f64>> {
        self.probes
            .get(probe.0 as usize)
            .map(|p| p.history.to_vec())
    }

    /// Close every open series at the simulation's current time and build
    /// the report.
    pub fn finish(mut self, sim: &Simulation) -> StatsReport {
        self.feed(sim, true);
        let now = sim.now();
        let end = now.to_num::<f64>();
        let unit = self.config.display_unit;

        let mut rows = Vec::new();
        for stats in &mut self.probes {
            stats.integrate(now, self.window);
            stats.since = now;
            stats.rows(end, self.window, unit, &mut rows);
        }

        let end_display = to_f64(now, unit);
        for probe in sim.time_probes() {
            for (prefix, stats) in [
                ("transit", probe.total()),
                ("processing", probe.processing()),
                ("waiting", probe.waiting()),
            ] {
                summary_rows(&probe.label, prefix, stats, end_display, unit, &mut rows);
            }
        }

        StatsReport {
            display_unit: unit,
            end: end_display,
            rows,
            nodes: node_summaries(sim),
            operators: operator_summaries(sim),
        }
    }

    /// Report for the run so far, leaving the aggregator untouched.
    pub fn report(&self, sim: &Simulation) -> StatsReport {
        self.clone().finish(sim)
    }
}

fn summary_rows(
    label: &str,
    prefix: &str,
    stats: &RunningStats,
    end: f64,
    unit: TimeUnit,
    out: &mut Vec<StatRow>,
) {
    let scale = unit.factor() as f64;
    let row = |suffix: &str, value: f64| StatRow {
        probe_id: label.to_string(),
        metric: format!("{prefix}_{suffix}"),
        window_start: 0.0,
        window_end: end,
        value,
    };
    out.push(row("count", stats.count() as f64));
    let timed = [
        ("mean", stats.mean()),
        ("min", stats.min()),
        ("max", stats.max()),
        ("stddev", stats.stddev()),
    ];
    for (suffix, value) in timed {
        if let Some(v) = value {
            out.push(row(suffix, v / scale));
        }
    }
}

/// Share of the run so far taken by `t`.
fn run_fraction(sim: &Simulation, t: SimTime) -> f64 {
    let run = sim.now().to_num::<f64>();
    if run > 0.0 {
        t.to_num::<f64>() / run
    } else {
        0.0
    }
}

fn operator_summaries(sim: &Simulation) -> Vec<OperatorSummary> {
    sim.crew()
        .iter()
        .map(|(id, def, state)| OperatorSummary {
            key: def.key.clone(),
            jobs: state.jobs,
            utilization: run_fraction(sim, sim.operator_busy_time(id)),
            travel_fraction: run_fraction(sim, sim.operator_travel_time(id)),
        })
        .collect()
}

fn node_summaries(sim: &Simulation) -> Vec<NodeSummary> {
    let fraction = |t: SimTime| run_fraction(sim, t);
    sim.graph()
        .nodes()
        .map(|(id, data)| {
            let (items_in, items_out) = sim.node_flow(id).unwrap_or_default();
            let per_type = match sim.node_state(id) {
                Some(NodeState::Sink(sink)) => sink
                    .per_type
                    .iter()
                    .map(|(t, n)| (sim.registry().key(*t).to_string(), *n))
                    .collect(),
                _ => BTreeMap::new(),
            };
            NodeSummary {
                key: data.key.clone(),
                kind: data.kind.label(),
                utilization: fraction(sim.busy_time(id)),
                blocked_fraction: fraction(sim.blocked_time(id)),
                items_in,
                items_out,
                per_type,
            }
        })
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
