//! The simulation run context.
//!
//! # Architecture
//!
//! A [`Simulation`] owns everything one run touches:
//! - the validated [`FlowGraph`] and [`ItemTypeRegistry`] (shared, read-only)
//! - the [`Scheduler`], the only thing that moves simulated time
//! - one [`SimRng`]; every random draw consumes from it in dispatch order
//! - per-edge [`Buffer`]s and per-node [`NodeState`] (SoA, keyed by slotmap id)
//! - the operator [`Crew`] gating staffed stations
//! - the measurement and time probes attached before the run
//!
//! # Dispatch
//!
//! Each event targets one node and runs to completion:
//! 1. **SourceFire** -- create a batch and try to place it whole
//! 2. **Complete** -- a station finishes; push the output or block
//! 3. **Evaluate** -- an adjacent buffer changed; unblock, then re-check inputs
//! 4. **Retry** -- periodic re-check for a station stuck on a full output
//!
//! Every buffer mutation wakes the node on the other side with a zero-delay
//! `Evaluate`, deduplicated per node, so idle stations hold no events. A
//! freed operator wakes the other stations it is assigned to.

use crate::buffer::Buffer;
use crate::digest::RunDigest;
use crate::error::{ParamError, SimError, TopologyError};
use crate::graph::FlowGraph;
use crate::id::{EdgeId, EventId, ItemId, ItemTypeId, NodeId, OperatorId, ProbeId, TimeProbeId};
use crate::item::{Item, Location};
use crate::node::{
    NodeKind, NodeState, ProcessingParams, ProcessingPhase, ProcessingState, SinkState,
    SourceParams, SourcePhase, SourceState, SplitPolicy, SplitterState,
};
use crate::operator::{Crew, OperatorDef, OperatorState};
use crate::probe::{MeasurementProbe, TimeProbe, TransitSample};
use crate::registry::ItemTypeRegistry;
use crate::rng::SimRng;
use crate::scheduler::{EventKind, RunLimit, RunOutcome, ScheduledEvent, Scheduler};
use crate::sync::{self, InputPriority, SyncMode};
use crate::time::{SimTime, TimeUnit, seconds};
use serde::Serialize;
use slotmap::SecondaryMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-run settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    pub seed: u64,
    /// Stop once the next event lies beyond this instant.
    pub horizon: Option<SimTime>,
    pub max_events: Option<u64>,
    /// Window length for windowed probe statistics.
    pub probe_window: SimTime,
    /// When set, blocked stations also re-check at this interval.
    pub retry_interval: Option<SimTime>,
    /// Unit used when reporting times.
    pub display_unit: TimeUnit,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            horizon: None,
            max_events: None,
            probe_window: seconds(60.0),
            retry_interval: None,
            display_unit: TimeUnit::Seconds,
        }
    }
}

impl SimConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_horizon(mut self, horizon: SimTime) -> Self {
        self.horizon = Some(horizon);
        self
    }

    /// The stop condition described by `horizon` and `max_events`.
    pub fn limit(&self) -> RunLimit {
        RunLimit {
            until: self.horizon,
            max_events: self.max_events,
        }
    }

    fn validate(&self) -> Result<(), SimError> {
        if self.probe_window <= SimTime::ZERO {
            return Err(SimError::param("config", ParamError::ZeroWindow));
        }
        if let Some(t) = self.retry_interval {
            if t <= SimTime::ZERO {
                return Err(SimError::param("config", ParamError::NonPositiveInterval(t)));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bookkeeping
// ---------------------------------------------------------------------------

/// Where every item created so far currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Conservation {
    pub created: u64,
    pub buffered: u64,
    /// Held by a station: being processed, blocked, or a source's batch.
    pub in_process: u64,
    pub sunk: u64,
    /// Absorbed into another item by a multi-input firing.
    pub assembled: u64,
}

impl Conservation {
    pub fn is_balanced(&self) -> bool {
        self.created == self.buffered + self.in_process + self.sunk + self.assembled
    }
}

/// Per-node scheduling flags and flow counters.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NodeFlags {
    pub(crate) evaluate_pending: bool,
    pub(crate) retry: Option<EventId>,
    pub(crate) items_in: u64,
    pub(crate) items_out: u64,
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// One run: a graph, a seed and the state evolving between them.
#[derive(Debug)]
pub struct Simulation {
    pub(crate) graph: Arc<FlowGraph>,
    pub(crate) registry: Arc<ItemTypeRegistry>,
    /// Processing parameters for processing stations and mergers.
    stations: Arc<SecondaryMap<NodeId, ProcessingParams>>,
    pub(crate) config: SimConfig,
    pub(crate) scheduler: Scheduler,
    rng: SimRng,

    // -- Per-edge state --
    pub(crate) buffers: SecondaryMap<EdgeId, Buffer>,

    // -- Per-node state --
    pub(crate) states: SecondaryMap<NodeId, NodeState>,
    pub(crate) flags: SecondaryMap<NodeId, NodeFlags>,
    crew: Crew,

    // -- Probes --
    probes: Vec<MeasurementProbe>,
    edge_probes: SecondaryMap<EdgeId, Vec<usize>>,
    time_probes: Vec<TimeProbe>,

    next_item: u64,
    created: u64,
    sunk: u64,
    assembled: u64,
    digest: RunDigest,
    started: bool,
    /// Event being dispatched, for error reports.
    current: Option<EventId>,
}

impl Simulation {
    /// Validate the model and set up initial state. Nothing is scheduled
    /// until [`start`](Self::start).
    pub fn new(
        graph: FlowGraph,
        registry: ItemTypeRegistry,
        config: SimConfig,
    ) -> Result<Self, SimError> {
        graph.validate_for(&registry)?;
        check_item_types(&graph, &registry)?;
        config.validate()?;

        let mut buffers = SecondaryMap::new();
        for (id, edge) in graph.edges() {
            buffers.insert(id, Buffer::new(edge.capacity));
        }
        let mut states = SecondaryMap::new();
        let mut flags = SecondaryMap::new();
        let mut stations = SecondaryMap::new();
        for (id, node) in graph.nodes() {
            states.insert(id, NodeState::initial(&node.kind));
            flags.insert(id, NodeFlags::default());
            if let Some(params) = node.kind.processing() {
                stations.insert(id, params);
            }
        }

        Ok(Self {
            graph: Arc::new(graph),
            registry: Arc::new(registry),
            stations: Arc::new(stations),
            rng: SimRng::new(config.seed),
            config,
            scheduler: Scheduler::new(),
            buffers,
            states,
            flags,
            crew: Crew::new(),
            probes: Vec::new(),
            edge_probes: SecondaryMap::new(),
            time_probes: Vec::new(),
            next_item: 0,
            created: 0,
            sunk: 0,
            assembled: 0,
            digest: RunDigest::new(),
            started: false,
            current: None,
        })
    }

    // -----------------------------------------------------------------------
    // Probes
    // -----------------------------------------------------------------------

    /// Attach a measurement probe to `edge`.
    pub fn add_probe(&mut self, label: &str, edge: EdgeId) -> Result<ProbeId, SimError> {
        let len = self
            .buffers
            .get(edge)
            .map(Buffer::len)
            .ok_or(TopologyError::EdgeNotFound(edge))?;
        let id = ProbeId(self.probes.len() as u32);
        let mut probe = MeasurementProbe::new(id, label, edge, self.config.probe_window);
        probe.record_wip(self.scheduler.now(), len);
        self.probes.push(probe);
        match self.edge_probes.get_mut(edge) {
            Some(list) => list.push(id.0 as usize),
            None => {
                self.edge_probes.insert(edge, vec![id.0 as usize]);
            }
        }
        Ok(id)
    }

    /// Attach a time probe measuring from entry at `start` to exit at `end`.
    pub fn add_time_probe(
        &mut self,
        label: &str,
        start: Location,
        end: Location,
    ) -> Result<TimeProbeId, SimError> {
        for point in [start, end] {
            self.check_location(point)?;
        }
        let id = TimeProbeId(self.time_probes.len() as u32);
        self.time_probes.push(TimeProbe::new(id, label, start, end));
        Ok(id)
    }

    fn check_location(&self, location: Location) -> Result<(), TopologyError> {
        match location {
            Location::Node(n) if self.graph.node(n).is_none() => Err(TopologyError::NodeNotFound(n)),
            Location::Edge(e) if self.graph.edge(e).is_none() => Err(TopologyError::EdgeNotFound(e)),
            _ => Ok(()),
        }
    }

    /// Clear every probe series. Probe definitions stay attached.
    pub fn reset_probes(&mut self) {
        let now = self.scheduler.now();
        for probe in &mut self.probes {
            probe.reset();
            if let Some(len) = self.buffers.get(probe.edge).map(Buffer::len) {
                probe.record_wip(now, len);
            }
        }
        for probe in &mut self.time_probes {
            probe.reset();
        }
    }

    // -----------------------------------------------------------------------
    // Operators
    // -----------------------------------------------------------------------

    /// Staff processing stations with an operator. From now on each of
    /// `def.machines` fires only while some operator assigned to it is free.
    pub fn add_operator(&mut self, def: OperatorDef) -> Result<OperatorId, SimError> {
        let id = self.crew.add(def, &self.graph)?;
        debug!(operator = id.0, "operator added");
        Ok(id)
    }

    pub fn crew(&self) -> &Crew {
        &self.crew
    }

    pub fn operator(&self, id: OperatorId) -> Option<&OperatorState> {
        self.crew.state(id)
    }

    /// Time `id` has spent working, including the current job so far.
    pub fn operator_busy_time(&self, id: OperatorId) -> SimTime {
        self.crew
            .state(id)
            .map_or(SimTime::ZERO, |s| s.busy_at(self.now()))
    }

    /// Time `id` has spent walking between stations.
    pub fn operator_travel_time(&self, id: OperatorId) -> SimTime {
        self.crew
            .state(id)
            .map_or(SimTime::ZERO, |s| s.travel_at(self.now()))
    }

    // -----------------------------------------------------------------------
    // Run control
    // -----------------------------------------------------------------------

    /// Schedule each source's first firing. Idempotent.
    pub fn start(&mut self) -> Result<(), SimError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        let graph = Arc::clone(&self.graph);
        for (node, data) in graph.nodes() {
            let NodeKind::Source(params) = &data.kind else {
                continue;
            };
            let delay = params.interval.sample(&mut self.rng);
            let event = self.scheduler.schedule(delay, node, EventKind::SourceFire)?;
            if let Some(NodeState::Source(src)) = self.states.get_mut(node) {
                src.phase = SourcePhase::Waiting { event };
            }
        }
        debug!(
            seed = self.config.seed,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "simulation started"
        );
        Ok(())
    }

    /// Dispatch events until the queue drains or `limit` stops the run.
    ///
    /// An error aborts the run at the failing event. Everything recorded up
    /// to that point stays readable.
    pub fn run(&mut self, limit: RunLimit) -> Result<RunOutcome, SimError> {
        self.start()?;
        let mut fired = 0u64;
        loop {
            match self.scheduler.next_within(&limit, fired) {
                Ok(event) => {
                    fired += 1;
                    self.dispatch(event)?;
                }
                Err(outcome) => {
                    debug!(
                        now = %self.scheduler.now(),
                        fired,
                        outcome = ?outcome,
                        "run returned"
                    );
                    return Ok(outcome);
                }
            }
        }
    }

    /// Run with the horizon and event budget from the configuration.
    pub fn run_configured(&mut self) -> Result<RunOutcome, SimError> {
        let limit = self.config.limit();
        self.run(limit)
    }

    /// Dispatch exactly one event. `None` once the queue is empty.
    pub fn step(&mut self) -> Result<Option<ScheduledEvent>, SimError> {
        self.start()?;
        let Some(event) = self.scheduler.pop() else {
            return Ok(None);
        };
        self.dispatch(event)?;
        Ok(Some(event))
    }

    /// Discard all pending events. State and statistics are kept.
    pub fn stop(&mut self) {
        let dropped = self.scheduler.pending();
        self.scheduler.clear();
        for (_, flags) in self.flags.iter_mut() {
            flags.evaluate_pending = false;
            flags.retry = None;
        }
        debug!(now = %self.scheduler.now(), dropped, "simulation stopped");
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn registry(&self) -> &ItemTypeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn buffer(&self, edge: EdgeId) -> Option<&Buffer> {
        self.buffers.get(edge)
    }

    pub fn node_state(&self, node: NodeId) -> Option<&NodeState> {
        self.states.get(node)
    }

    /// Items that entered and left `node`.
    pub fn node_flow(&self, node: NodeId) -> Option<(u64, u64)> {
        self.flags.get(node).map(|f| (f.items_in, f.items_out))
    }

    pub fn probes(&self) -> &[MeasurementProbe] {
        &self.probes
    }

    pub fn probe(&self, id: ProbeId) -> Option<&MeasurementProbe> {
        self.probes.get(id.0 as usize)
    }

    pub fn time_probes(&self) -> &[TimeProbe] {
        &self.time_probes
    }

    pub fn time_probe(&self, id: TimeProbeId) -> Option<&TimeProbe> {
        self.time_probes.get(id.0 as usize)
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn sunk(&self) -> u64 {
        self.sunk
    }

    pub fn assembled(&self) -> u64 {
        self.assembled
    }

    pub fn pending_events(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn dispatched(&self) -> u64 {
        self.scheduler.dispatched()
    }

    /// True once nothing is left to dispatch.
    pub fn is_drained(&self) -> bool {
        self.started && self.scheduler.is_empty()
    }

    /// Fingerprint of every event dispatched so far.
    pub fn digest(&self) -> u64 {
        self.digest.value()
    }

    /// Time `node` has spent processing, including the current job so far.
    pub fn busy_time(&self, node: NodeId) -> SimTime {
        let now = self.now();
        match self.states.get(node) {
            Some(NodeState::Processing(p)) => match &p.phase {
                ProcessingPhase::Busy {
                    started, finish, ..
                } => p.busy_time + (now.min(*finish) - *started).max(SimTime::ZERO),
                _ => p.busy_time,
            },
            _ => SimTime::ZERO,
        }
    }

    /// Time `node` has spent unable to hand its output on, including the
    /// current stretch.
    pub fn blocked_time(&self, node: NodeId) -> SimTime {
        let now = self.now();
        match self.states.get(node) {
            Some(NodeState::Processing(p)) => match &p.phase {
                ProcessingPhase::Blocked { since, .. } => p.blocked_time + (now - *since),
                _ => p.blocked_time,
            },
            Some(NodeState::Source(s)) => match &s.phase {
                SourcePhase::Holding { since, .. } => s.held_time + (now - *since),
                _ => s.held_time,
            },
            _ => SimTime::ZERO,
        }
    }

    pub fn conservation(&self) -> Conservation {
        Conservation {
            created: self.created,
            buffered: self.buffers.values().map(|b| b.len() as u64).sum(),
            in_process: self.states.values().map(|s| s.items_held() as u64).sum(),
            sunk: self.sunk,
            assembled: self.assembled,
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn dispatch(&mut self, event: ScheduledEvent) -> Result<(), SimError> {
        trace!(
            time = %event.time,
            node = self.graph.node_key(event.node),
            kind = ?event.kind,
            "dispatch"
        );
        self.digest.write_event(&event);
        self.current = Some(event.id);
        let result = match event.kind {
            EventKind::SourceFire => self.fire_source(event.node, event.id),
            EventKind::Complete => self.complete(event.node, event.id),
            EventKind::Evaluate => {
                if let Some(flags) = self.flags.get_mut(event.node) {
                    flags.evaluate_pending = false;
                }
                self.evaluate(event.node)
            }
            EventKind::Retry => {
                if let Some(flags) = self.flags.get_mut(event.node) {
                    flags.retry = None;
                }
                self.evaluate(event.node)
            }
        };
        self.current = None;
        if let Err(err) = &result {
            warn!(
                time = %event.time,
                node = self.graph.node_key(event.node),
                error = %err,
                "run aborted"
            );
        }
        result
    }

    fn internal(&self, node: NodeId, detail: impl Into<String>) -> SimError {
        SimError::Internal {
            node: self.graph.node_key(node).to_string(),
            event: self.current,
            detail: detail.into(),
        }
    }

    /// Run `f` on a node's state with the state lifted out of the map, so
    /// `f` can mutate the rest of the simulation freely.
    fn with_state<R>(
        &mut self,
        node: NodeId,
        f: impl FnOnce(&mut Self, &mut NodeState) -> Result<R, SimError>,
    ) -> Result<R, SimError> {
        let mut state = self
            .states
            .remove(node)
            .ok_or_else(|| self.internal(node, "no runtime state"))?;
        let result = f(self, &mut state);
        self.states.insert(node, state);
        result
    }

    fn evaluate(&mut self, node: NodeId) -> Result<(), SimError> {
        let graph = Arc::clone(&self.graph);
        let stations = Arc::clone(&self.stations);
        let kind = &graph
            .node(node)
            .ok_or_else(|| self.internal(node, "unknown node"))?
            .kind;
        self.with_state(node, |sim, state| match (kind, state) {
            (NodeKind::Source(params), NodeState::Source(src)) => sim.place_batch(node, params, src),
            (NodeKind::Processing(_) | NodeKind::Merger(_), NodeState::Processing(ps)) => {
                let params = stations
                    .get(node)
                    .ok_or_else(|| sim.internal(node, "no processing parameters"))?;
                sim.unblock(node, ps)?;
                sim.try_fire(node, params, ps)
            }
            (NodeKind::Splitter(policy), NodeState::Splitter(st)) => sim.route(node, policy, st),
            (NodeKind::Sink, NodeState::Sink(st)) => sim.drain_sink(node, st),
            _ => Err(sim.internal(node, "runtime state does not match node kind")),
        })
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    fn fire_source(&mut self, node: NodeId, event: EventId) -> Result<(), SimError> {
        let graph = Arc::clone(&self.graph);
        let Some(NodeKind::Source(params)) = graph.node(node).map(|d| &d.kind) else {
            return Err(self.internal(node, "source event on a non-source node"));
        };
        self.with_state(node, |sim, state| {
            let NodeState::Source(src) = state else {
                return Err(sim.internal(node, "source without source state"));
            };
            if src.phase != (SourcePhase::Waiting { event }) {
                return Ok(());
            }
            let remaining = match params.limit {
                0 => u64::MAX,
                limit => limit.saturating_sub(src.generated),
            };
            let wanted = u64::from(params.batch_size).min(remaining);
            let now = sim.now();
            let mut batch = Vec::with_capacity(wanted as usize);
            for _ in 0..wanted {
                let Some(item_type) = params.assignment.next(&mut src.cursor, &mut sim.rng)
                else {
                    break;
                };
                batch.push(sim.create_item(node, item_type));
            }
            if batch.is_empty() {
                src.phase = SourcePhase::Exhausted;
                debug!(node = graph.node_key(node), generated = src.generated, "source exhausted");
                return Ok(());
            }
            src.phase = SourcePhase::Holding { batch, since: now };
            sim.place_batch(node, params, src)
        })
    }

    fn create_item(&mut self, node: NodeId, item_type: ItemTypeId) -> Item {
        let now = self.now();
        let mut item = Item::new(ItemId(self.next_item), item_type, now);
        self.next_item += 1;
        self.created += 1;
        item.enter(Location::Node(node), now);
        item
    }

    /// Place a held batch whole, or keep holding it.
    fn place_batch(
        &mut self,
        node: NodeId,
        params: &SourceParams,
        src: &mut SourceState,
    ) -> Result<(), SimError> {
        let phase = std::mem::replace(&mut src.phase, SourcePhase::Idle);
        let SourcePhase::Holding { batch, since } = phase else {
            src.phase = phase;
            return Ok(());
        };
        let edge = self.single_output(node)?;
        let fits = self
            .buffers
            .get(edge)
            .is_some_and(|b| b.has_space_for(batch.len()));
        if !fits {
            src.phase = SourcePhase::Holding { batch, since };
            return self.arm_retry(node);
        }
        self.disarm_retry(node);

        let now = self.now();
        src.held_time += now - since;
        let placed = batch.len() as u64;
        for item in batch {
            self.push_edge(node, edge, item)?;
        }
        src.generated += placed;
        if let Some(flags) = self.flags.get_mut(node) {
            flags.items_out += placed;
        }

        if params.limit != 0 && src.generated >= params.limit {
            src.phase = SourcePhase::Exhausted;
            debug!(
                node = self.graph.node_key(node),
                generated = src.generated,
                "source reached its limit"
            );
            return Ok(());
        }
        let delay = params.interval.sample(&mut self.rng);
        let event = self.scheduler.schedule(delay, node, EventKind::SourceFire)?;
        src.phase = SourcePhase::Waiting { event };
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Processing stations and mergers
    // -----------------------------------------------------------------------

    fn complete(&mut self, node: NodeId, event: EventId) -> Result<(), SimError> {
        let stations = Arc::clone(&self.stations);
        let params = stations
            .get(node)
            .ok_or_else(|| self.internal(node, "completion on a node that does not process"))?;
        self.with_state(node, |sim, state| {
            let NodeState::Processing(ps) = state else {
                return Err(sim.internal(node, "station without processing state"));
            };
            let ProcessingPhase::Busy {
                event: pending, ..
            } = &ps.phase
            else {
                return Ok(());
            };
            if *pending != event {
                return Ok(());
            }
            let ProcessingPhase::Busy {
                mut item,
                output,
                started,
                finish,
                ..
            } = std::mem::take(&mut ps.phase)
            else {
                return Ok(());
            };
            let worked = finish - started;
            if let Some(op) = sim.crew.release(node) {
                sim.wake_crewmates(node, op)?;
            }
            item.add_busy(node, worked);
            item.item_type = output;
            ps.busy_time += worked;
            ps.completed += 1;
            ps.phase = ProcessingPhase::Blocked {
                item,
                since: sim.now(),
            };
            sim.unblock(node, ps)?;
            sim.try_fire(node, params, ps)
        })
    }

    /// Hand a finished item downstream if there is room.
    fn unblock(&mut self, node: NodeId, ps: &mut ProcessingState) -> Result<(), SimError> {
        if !matches!(ps.phase, ProcessingPhase::Blocked { .. }) {
            return Ok(());
        }
        let edge = self.single_output(node)?;
        if !self.buffers.get(edge).is_some_and(|b| b.has_space_for(1)) {
            return self.arm_retry(node);
        }
        let ProcessingPhase::Blocked { item, since } = std::mem::take(&mut ps.phase) else {
            return Ok(());
        };
        self.disarm_retry(node);
        ps.blocked_time += self.now() - since;
        self.push_edge(node, edge, item)?;
        if let Some(flags) = self.flags.get_mut(node) {
            flags.items_out += 1;
        }
        Ok(())
    }

    /// Start a job if the station is idle and its inputs satisfy the sync mode.
    fn try_fire(
        &mut self,
        node: NodeId,
        params: &ProcessingParams,
        ps: &mut ProcessingState,
    ) -> Result<(), SimError> {
        if !matches!(ps.phase, ProcessingPhase::Idle) {
            return Ok(());
        }
        let graph = Arc::clone(&self.graph);
        let inputs = graph.inputs(node);
        let Some(plan) = sync::plan(&params.sync, inputs, &self.buffers, ps.cursor) else {
            return Ok(());
        };
        let operator = if self.crew.staffs(node) {
            let Some(op) = self.crew.available(node) else {
                trace!(node = graph.node_key(node), "waiting for an operator");
                return Ok(());
            };
            Some(op)
        } else {
            None
        };
        let taken = sync::take(&plan, &mut self.buffers)
            .map_err(|stale| self.internal(node, stale.to_string()))?;
        if let (SyncMode::FirstAvailable(InputPriority::RoundRobin), Some(chosen)) =
            (&params.sync, plan.chosen)
        {
            ps.cursor = chosen + 1;
        }

        let now = self.now();
        let mut consumed = Vec::with_capacity(plan.item_count());
        for (edge, items) in taken {
            for mut item in items {
                item.exit(Location::Edge(edge), now);
                self.observe_exit(&item, Location::Edge(edge));
                item.enter(Location::Node(node), now);
                consumed.push(item);
            }
            self.record_wip(edge);
            self.wake_upstream(edge)?;
        }
        if let Some(flags) = self.flags.get_mut(node) {
            flags.items_in += consumed.len() as u64;
        }

        let types: Vec<ItemTypeId> = consumed.iter().map(|i| i.item_type).collect();
        let mut parts = consumed.into_iter();
        let Some(primary) = parts.next() else {
            return Err(self.internal(node, "firing consumed no items"));
        };
        let absorbed = parts.count() as u64;
        ps.assembled += absorbed;
        self.assembled += absorbed;

        let output = params.resolve_output(&types).unwrap_or(primary.item_type);
        let duration = match self.registry.processing_override(primary.item_type, node) {
            Some(t) => t,
            None => params.time.sample(&mut self.rng),
        };
        let walk = match operator {
            Some(op) => self
                .crew
                .dispatch(op, node, now, duration, &mut self.rng)
                .ok_or_else(|| self.internal(node, "unknown operator"))?,
            None => SimTime::ZERO,
        };
        let event = self
            .scheduler
            .schedule(walk.saturating_add(duration), node, EventKind::Complete)?;
        ps.fired += 1;
        trace!(
            node = graph.node_key(node),
            item = primary.id.0,
            absorbed,
            walk = %walk,
            duration = %duration,
            "station fired"
        );
        let started = now.saturating_add(walk);
        ps.phase = ProcessingPhase::Busy {
            item: primary,
            output,
            started,
            finish: started.saturating_add(duration),
            event,
        };
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Splitters and sinks
    // -----------------------------------------------------------------------

    fn route(
        &mut self,
        node: NodeId,
        policy: &SplitPolicy,
        st: &mut SplitterState,
    ) -> Result<(), SimError> {
        let graph = Arc::clone(&self.graph);
        let outputs = graph.outputs(node);
        let input = graph
            .inputs(node)
            .first()
            .copied()
            .ok_or_else(|| self.internal(node, "splitter without input"))?;
        let now = self.now();
        loop {
            if st.held.is_none() {
                let Some(mut item) = self.buffers.get_mut(input).and_then(Buffer::pop) else {
                    break;
                };
                self.record_wip(input);
                self.wake_upstream(input)?;
                item.exit(Location::Edge(input), now);
                self.observe_exit(&item, Location::Edge(input));
                item.enter(Location::Node(node), now);
                if let Some(flags) = self.flags.get_mut(node) {
                    flags.items_in += 1;
                }
                let target = match policy {
                    SplitPolicy::Weighted(weights) => {
                        let w: Vec<f64> = outputs
                            .iter()
                            .map(|e| weights.get(e).copied().unwrap_or(0.0))
                            .collect();
                        let i = self
                            .rng
                            .pick_weighted(&w)
                            .ok_or_else(|| self.internal(node, "no positive split weight"))?;
                        outputs[i]
                    }
                    SplitPolicy::RoundRobin => {
                        let e = outputs
                            .get(st.cursor % outputs.len().max(1))
                            .copied()
                            .ok_or_else(|| self.internal(node, "splitter without outputs"))?;
                        st.cursor += 1;
                        e
                    }
                };
                st.held = Some((item, target));
            }

            let Some((_, target)) = &st.held else {
                break;
            };
            let target = *target;
            if !self.buffers.get(target).is_some_and(|b| b.has_space_for(1)) {
                return self.arm_retry(node);
            }
            if let Some((item, _)) = st.held.take() {
                self.push_edge(node, target, item)?;
                *st.routed.entry(target).or_default() += 1;
                if let Some(flags) = self.flags.get_mut(node) {
                    flags.items_out += 1;
                }
            }
        }
        self.disarm_retry(node);
        Ok(())
    }

    fn drain_sink(&mut self, node: NodeId, st: &mut SinkState) -> Result<(), SimError> {
        let graph = Arc::clone(&self.graph);
        let now = self.now();
        for &edge in graph.inputs(node) {
            let mut drained = 0u64;
            while let Some(mut item) = self.buffers.get_mut(edge).and_then(Buffer::pop) {
                item.exit(Location::Edge(edge), now);
                self.observe_exit(&item, Location::Edge(edge));
                item.enter(Location::Node(node), now);
                item.exit(Location::Node(node), now);
                self.observe_exit(&item, Location::Node(node));
                st.received += 1;
                *st.per_type.entry(item.item_type).or_default() += 1;
                st.last_arrival = Some(now);
                drained += 1;
            }
            if drained > 0 {
                self.sunk += drained;
                if let Some(flags) = self.flags.get_mut(node) {
                    flags.items_in += drained;
                }
                self.record_wip(edge);
                self.wake_upstream(edge)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Buffers, wakes and probes
    // -----------------------------------------------------------------------

    fn single_output(&self, node: NodeId) -> Result<EdgeId, SimError> {
        self.graph
            .outputs(node)
            .first()
            .copied()
            .ok_or_else(|| self.internal(node, "no output edge"))
    }

    /// Move an item out of `from` onto `edge`. The caller has checked space.
    fn push_edge(&mut self, from: NodeId, edge: EdgeId, mut item: Item) -> Result<(), SimError> {
        let now = self.now();
        item.exit(Location::Node(from), now);
        self.observe_exit(&item, Location::Node(from));
        item.enter(Location::Edge(edge), now);

        let pushed = match self.buffers.get_mut(edge) {
            Some(buffer) => buffer.try_push(item).map(|()| buffer.len()).ok(),
            None => None,
        };
        let Some(len) = pushed else {
            return Err(self.internal(from, "pushed into a missing or full buffer"));
        };
        if let Some(indices) = self.edge_probes.get(edge) {
            for &i in indices {
                if let Some(probe) = self.probes.get_mut(i) {
                    probe.record_crossing(now);
                    probe.record_wip(now, len);
                }
            }
        }
        let to = self
            .graph
            .edge(edge)
            .map(|e| e.to)
            .ok_or_else(|| self.internal(from, "unknown output edge"))?;
        self.wake(to)
    }

    fn record_wip(&mut self, edge: EdgeId) {
        let now = self.now();
        let len = self.buffers.get(edge).map(Buffer::len).unwrap_or(0);
        if let Some(indices) = self.edge_probes.get(edge) {
            for &i in indices {
                if let Some(probe) = self.probes.get_mut(i) {
                    probe.record_wip(now, len);
                }
            }
        }
    }

    fn observe_exit(&mut self, item: &Item, at: Location) {
        let now = self.now();
        for probe in self.time_probes.iter_mut().filter(|p| p.end == at) {
            if let Some(transit) = item.transit(probe.start, at) {
                probe.record(TransitSample {
                    item: item.id,
                    item_type: item.item_type,
                    completed_at: now,
                    transit,
                });
            }
        }
    }

    fn wake_upstream(&mut self, edge: EdgeId) -> Result<(), SimError> {
        match self.graph.edge(edge).map(|e| e.from) {
            Some(from) => self.wake(from),
            None => Ok(()),
        }
    }

    /// Schedule a zero-delay evaluation of `node` unless one is pending.
    fn wake(&mut self, node: NodeId) -> Result<(), SimError> {
        if let Some(NodeState::Source(src)) = self.states.get(node) {
            if !matches!(src.phase, SourcePhase::Holding { .. }) {
                return Ok(());
            }
        }
        let Some(flags) = self.flags.get_mut(node) else {
            return Ok(());
        };
        if flags.evaluate_pending {
            return Ok(());
        }
        flags.evaluate_pending = true;
        self.scheduler
            .schedule(SimTime::ZERO, node, EventKind::Evaluate)?;
        Ok(())
    }

    /// Let the other stations `op` works check whether they can start now.
    fn wake_crewmates(&mut self, node: NodeId, op: OperatorId) -> Result<(), SimError> {
        let machines = self
            .crew
            .def(op)
            .map(|d| d.machines.clone())
            .unwrap_or_default();
        trace!(node = self.graph.node_key(node), operator = op.0, "operator released");
        for machine in machines.into_iter().filter(|m| *m != node) {
            self.wake(machine)?;
        }
        Ok(())
    }

    fn arm_retry(&mut self, node: NodeId) -> Result<(), SimError> {
        let Some(interval) = self.config.retry_interval else {
            return Ok(());
        };
        if self.flags.get(node).is_none_or(|f| f.retry.is_some()) {
            return Ok(());
        }
        let event = self.scheduler.schedule(interval, node, EventKind::Retry)?;
        if let Some(flags) = self.flags.get_mut(node) {
            flags.retry = Some(event);
        }
        Ok(())
    }

    fn disarm_retry(&mut self, node: NodeId) {
        if let Some(event) = self.flags.get_mut(node).and_then(|f| f.retry.take()) {
            self.scheduler.cancel(event);
        }
    }
}

/// Every item type a station refers to must be registered.
fn check_item_types(graph: &FlowGraph, registry: &ItemTypeRegistry) -> Result<(), SimError> {
    for (_, data) in graph.nodes() {
        let referenced: Vec<ItemTypeId> = match &data.kind {
            NodeKind::Source(p) => p.assignment.types(),
            NodeKind::Processing(p) => p
                .output_types
                .iter()
                .flat_map(|(from, to)| [*from, *to])
                .chain(
                    p.combinations
                        .iter()
                        .flat_map(|c| c.ingredients.keys().copied().chain([c.output])),
                )
                .collect(),
            _ => Vec::new(),
        };
        if let Some(&unknown) = referenced.iter().find(|t| !registry.contains(**t)) {
            return Err(SimError::param(
                data.key.clone(),
                ParamError::UnknownItemType(unknown),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::Distribution;
    use crate::node::TypeAssignment;
    use crate::registry::RegistryBuilder;

    fn registry() -> ItemTypeRegistry {
        let mut b = RegistryBuilder::new();
        b.register("widget", "Widget", "#3366ff").unwrap();
        b.build().unwrap()
    }

    fn source(interval: f64, limit: u64) -> NodeKind {
        NodeKind::Source(SourceParams {
            interval: Distribution::Constant(seconds(interval)),
            batch_size: 1,
            limit,
            assignment: TypeAssignment::Single(ItemTypeId(0)),
        })
    }

    fn station(secs: f64) -> NodeKind {
        NodeKind::Processing(ProcessingParams::new(Distribution::Constant(seconds(secs))))
    }

    #[test]
    fn first_firing_waits_one_interval() {
        let mut g = FlowGraph::new();
        let s = g.add_node("src", "Source", source(2.0, 1)).unwrap();
        let k = g.add_node("sink", "Sink", NodeKind::Sink).unwrap();
        g.connect(s, k, None).unwrap();
        let mut sim = Simulation::new(g, registry(), SimConfig::default()).unwrap();
        let first = sim.step().unwrap().unwrap();
        assert_eq!(first.kind, EventKind::SourceFire);
        assert_eq!(first.time, seconds(2.0));
    }

    #[test]
    fn unknown_item_type_rejected() {
        let mut g = FlowGraph::new();
        let mut kind = source(1.0, 0);
        if let NodeKind::Source(p) = &mut kind {
            p.assignment = TypeAssignment::Single(ItemTypeId(7));
        }
        let s = g.add_node("src", "Source", kind).unwrap();
        let k = g.add_node("sink", "Sink", NodeKind::Sink).unwrap();
        g.connect(s, k, None).unwrap();
        assert_eq!(
            Simulation::new(g, registry(), SimConfig::default()).unwrap_err(),
            SimError::param("src", ParamError::UnknownItemType(ItemTypeId(7)))
        );
    }

    #[test]
    fn zero_probe_window_rejected() {
        let mut g = FlowGraph::new();
        let s = g.add_node("src", "Source", source(1.0, 0)).unwrap();
        let k = g.add_node("sink", "Sink", NodeKind::Sink).unwrap();
        g.connect(s, k, None).unwrap();
        let config = SimConfig {
            probe_window: SimTime::ZERO,
            ..SimConfig::default()
        };
        assert!(matches!(
            Simulation::new(g, registry(), config),
            Err(SimError::InvalidParameter {
                reason: ParamError::ZeroWindow,
                ..
            })
        ));
    }

    #[test]
    fn blocked_station_holds_output_until_room() {
        let mut g = FlowGraph::new();
        let s = g.add_node("src", "Source", source(1.0, 3)).unwrap();
        let p = g.add_node("press", "Press", station(1.0)).unwrap();
        let q = g.add_node("slow", "Slow", station(10.0)).unwrap();
        let k = g.add_node("sink", "Sink", NodeKind::Sink).unwrap();
        g.connect(s, p, None).unwrap();
        let mid = g.connect(p, q, Some(1)).unwrap();
        g.connect(q, k, None).unwrap();
        let mut sim = Simulation::new(g, registry(), SimConfig::default()).unwrap();

        sim.run(RunLimit::until(seconds(5.0))).unwrap();
        assert_eq!(sim.buffer(mid).unwrap().len(), 1);
        assert_eq!(sim.node_state(p).unwrap().status(), "blocked");
        assert!(sim.blocked_time(p) > SimTime::ZERO);
        assert!(sim.conservation().is_balanced());

        sim.run(RunLimit::unbounded()).unwrap();
        assert_eq!(sim.sunk(), 3);
        assert!(sim.conservation().is_balanced());
    }

    #[test]
    fn retry_interval_schedules_retries_while_blocked() {
        let mut g = FlowGraph::new();
        let s = g.add_node("src", "Source", source(1.0, 3)).unwrap();
        let p = g.add_node("slow", "Slow", station(10.0)).unwrap();
        let k = g.add_node("sink", "Sink", NodeKind::Sink).unwrap();
        g.connect(s, p, Some(1)).unwrap();
        g.connect(p, k, None).unwrap();
        let config = SimConfig {
            retry_interval: Some(seconds(0.5)),
            ..SimConfig::default()
        };
        let mut sim = Simulation::new(g, registry(), config).unwrap();

        // The third item finds the buffer full at t = 3.
        sim.run(RunLimit::until(seconds(3.0))).unwrap();
        assert!(sim.flags[s].retry.is_some());
        assert_eq!(sim.node_state(s).unwrap().status(), "blocked");

        sim.run(RunLimit::unbounded()).unwrap();
        assert_eq!(sim.sunk(), 3);
        assert!(sim.flags.values().all(|f| f.retry.is_none()));
        assert!(sim.conservation().is_balanced());
    }

    #[test]
    fn stop_discards_queue_and_keeps_counts() {
        let mut g = FlowGraph::new();
        let s = g.add_node("src", "Source", source(1.0, 0)).unwrap();
        let k = g.add_node("sink", "Sink", NodeKind::Sink).unwrap();
        g.connect(s, k, None).unwrap();
        let mut sim = Simulation::new(g, registry(), SimConfig::default()).unwrap();
        sim.run(RunLimit::until(seconds(4.5))).unwrap();
        assert_eq!(sim.sunk(), 4);
        sim.stop();
        assert_eq!(sim.pending_events(), 0);
        assert_eq!(sim.run(RunLimit::unbounded()).unwrap(), RunOutcome::Drained);
        assert_eq!(sim.sunk(), 4);
    }

    #[test]
    fn zero_time_overrides_on_a_cycle_rejected() {
        let mut g = FlowGraph::new();
        let s = g.add_node("src", "Source", source(1.0, 0)).unwrap();
        let a = g.add_node("a", "A", station(1.0)).unwrap();
        let b = g.add_node("b", "B", station(1.0)).unwrap();
        g.connect(s, a, None).unwrap();
        g.connect(a, b, None).unwrap();
        g.connect(b, a, None).unwrap();
        let mut types = RegistryBuilder::new();
        let widget = types.register("widget", "Widget", "#3366ff").unwrap();
        types.set_override(widget, a, SimTime::ZERO).unwrap();
        types.set_override(widget, b, SimTime::ZERO).unwrap();
        assert!(matches!(
            Simulation::new(g, types.build().unwrap(), SimConfig::default()),
            Err(SimError::InvalidTopology(TopologyError::ZeroDelayCycle(_)))
        ));
    }

    #[test]
    fn item_type_override_sets_processing_time() {
        let mut g = FlowGraph::new();
        let s = g.add_node("src", "Source", source(1.0, 1)).unwrap();
        let p = g.add_node("press", "Press", station(5.0)).unwrap();
        let k = g.add_node("sink", "Sink", NodeKind::Sink).unwrap();
        g.connect(s, p, None).unwrap();
        g.connect(p, k, None).unwrap();
        let mut b = RegistryBuilder::new();
        let widget = b.register("widget", "Widget", "#3366ff").unwrap();
        b.set_override(widget, p, seconds(2.0)).unwrap();
        let mut sim = Simulation::new(g, b.build().unwrap(), SimConfig::default()).unwrap();
        sim.run(RunLimit::unbounded()).unwrap();
        assert_eq!(sim.now(), seconds(3.0));
        assert_eq!(sim.busy_time(p), seconds(2.0));
    }
}
