//! Measurement and time probes.
//!
//! A [`MeasurementProbe`] sits on one edge and records every item crossing
//! into it plus the queue length after every change. A [`TimeProbe`] watches
//! items leave its end point and measures how long they took since entering
//! its start point. Both only record; windowing and summaries happen in the
//! statistics crate.

use crate::id::{EdgeId, ItemId, ItemTypeId, ProbeId, TimeProbeId};
use crate::item::{Location, Transit};
use crate::time::SimTime;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Running statistics
// ---------------------------------------------------------------------------

/// Online count/mean/variance/min/max (Welford's algorithm).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, x: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Population standard deviation.
    pub fn stddev(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.m2 / self.count as f64).sqrt())
    }
}

// ---------------------------------------------------------------------------
// Measurement probe
// ---------------------------------------------------------------------------

/// Samples throughput, inter-crossing time and WIP on one edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementProbe {
    pub id: ProbeId,
    pub label: String,
    pub edge: EdgeId,
    /// Aggregation window for throughput.
    pub window: SimTime,
    crossings: Vec<SimTime>,
    wip: Vec<(SimTime, u32)>,
    intervals: RunningStats,
    last_crossing: SimTime,
}

impl MeasurementProbe {
    pub fn new(id: ProbeId, label: &str, edge: EdgeId, window: SimTime) -> Self {
        Self {
            id,
            label: label.to_string(),
            edge,
            window,
            crossings: Vec::new(),
            wip: vec![(SimTime::ZERO, 0)],
            intervals: RunningStats::new(),
            last_crossing: SimTime::ZERO,
        }
    }

    /// An item entered the edge. The first interval counts from run start.
    pub fn record_crossing(&mut self, now: SimTime) {
        self.crossings.push(now);
        self.intervals.push((now - self.last_crossing).to_num::<f64>());
        self.last_crossing = now;
    }

    /// The edge's queue length after a change.
    pub fn record_wip(&mut self, now: SimTime, len: usize) {
        let len = len as u32;
        match self.wip.last_mut() {
            Some(last) if last.0 == now => last.1 = len,
            _ => self.wip.push((now, len)),
        }
    }

    pub fn crossings(&self) -> &[SimTime] {
        &self.crossings
    }

    /// `(time, queue length)` steps; each value holds until the next sample.
    pub fn wip_series(&self) -> &[(SimTime, u32)] {
        &self.wip
    }

    /// Gaps between successive crossings, in canonical units.
    pub fn intervals(&self) -> &RunningStats {
        &self.intervals
    }

    /// Crossings per second over `[0, end]`.
    pub fn throughput(&self, end: SimTime) -> f64 {
        let secs = crate::time::to_f64(end, crate::time::TimeUnit::Seconds);
        if secs <= 0.0 {
            return 0.0;
        }
        self.crossings.len() as f64 / secs
    }

    pub fn reset(&mut self) {
        self.crossings.clear();
        self.wip = vec![(SimTime::ZERO, 0)];
        self.intervals = RunningStats::new();
        self.last_crossing = SimTime::ZERO;
    }
}

// ---------------------------------------------------------------------------
// Time probe
// ---------------------------------------------------------------------------

/// One item's trip between a time probe's two points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitSample {
    pub item: ItemId,
    pub item_type: ItemTypeId,
    pub completed_at: SimTime,
    pub transit: Transit,
}

/// Measures total, processing and waiting time between two points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeProbe {
    pub id: TimeProbeId,
    pub label: String,
    pub start: Location,
    pub end: Location,
    samples: Vec<TransitSample>,
    total: RunningStats,
    processing: RunningStats,
    waiting: RunningStats,
}

impl TimeProbe {
    pub fn new(id: TimeProbeId, label: &str, start: Location, end: Location) -> Self {
        Self {
            id,
            label: label.to_string(),
            start,
            end,
            samples: Vec::new(),
            total: RunningStats::new(),
            processing: RunningStats::new(),
            waiting: RunningStats::new(),
        }
    }

    pub fn record(&mut self, sample: TransitSample) {
        self.total.push(sample.transit.total.to_num::<f64>());
        self.processing.push(sample.transit.processing.to_num::<f64>());
        self.waiting.push(sample.transit.waiting.to_num::<f64>());
        self.samples.push(sample);
    }

    pub fn samples(&self) -> &[TransitSample] {
        &self.samples
    }

    pub fn total(&self) -> &RunningStats {
        &self.total
    }

    pub fn processing(&self) -> &RunningStats {
        &self.processing
    }

    pub fn waiting(&self) -> &RunningStats {
        &self.waiting
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.total = RunningStats::new();
        self.processing = RunningStats::new();
        self.waiting = RunningStats::new();
    }
}
