//! Flowline Core -- discrete-event simulation of production lines.
//!
//! A line is a directed graph of stations (sources, processing stations,
//! splitters, mergers, sinks) joined by buffered links. A time-ordered event
//! queue drives it forward; probes on links and between points record
//! throughput, WIP and transit times as the run unfolds.
//!
//! # Event Loop
//!
//! Each call to [`engine::Simulation::run`] repeatedly:
//!
//! 1. **Pop** -- take the earliest event; ties go to the one scheduled first.
//! 2. **Advance** -- move the clock to the event's time.
//! 3. **Dispatch** -- the target station consumes and produces buffer items
//!    and schedules follow-up events.
//! 4. **Observe** -- every buffer mutation is reported to attached probes
//!    and wakes the station on the other side.
//!
//! until the queue drains, the horizon is reached, or the event budget runs
//! out.
//!
//! # Key Types
//!
//! - [`engine::Simulation`] -- One run: graph, scheduler, RNG, buffers,
//!   station state and probes.
//! - [`graph::FlowGraph`] -- Stations and links, validated before a run.
//! - [`node::NodeKind`] -- The closed set of station kinds and parameters.
//! - [`sync::SyncMode`] -- How multi-input stations decide to fire.
//! - [`operator::Crew`] -- Operators shared between processing stations.
//! - [`probe::MeasurementProbe`] / [`probe::TimeProbe`] -- Run observers.
//! - [`snapshot::GraphSnapshot`] -- Serializable model description.
//! - [`control::RunController`] -- Start/pause/resume/stop and pacing.
//! - [`time::SimTime`] -- Q32.32 fixed-point centiseconds.

pub mod buffer;
pub mod control;
pub mod digest;
pub mod distribution;
pub mod engine;
pub mod error;
pub mod graph;
pub mod id;
pub mod item;
pub mod node;
pub mod operator;
pub mod probe;
pub mod registry;
pub mod rng;
pub mod scheduler;
pub mod snapshot;
pub mod sync;
pub mod time;
pub mod view;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
