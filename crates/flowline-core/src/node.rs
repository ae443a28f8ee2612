//! Station kinds, their parameters, and their runtime state.
//!
//! Dispatch is by enum match over a closed set of kinds; there are no trait
//! objects. Parameters are fixed when the graph is built; state lives in the
//! [`Simulation`](crate::engine::Simulation) and is reset per run.

use crate::distribution::Distribution;
use crate::error::ParamError;
use crate::id::{EdgeId, EventId, ItemTypeId};
use crate::item::Item;
use crate::rng::SimRng;
use crate::sync::{InputPriority, SyncMode};
use crate::time::SimTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Item type assignment
// ---------------------------------------------------------------------------

/// How a source decides the type of each item it creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeAssignment {
    /// Every item has the same type.
    Single(ItemTypeId),
    /// Types follow a fixed list; `looping` restarts it at the end,
    /// otherwise the source is exhausted once the list is used up.
    Sequence { types: Vec<ItemTypeId>, looping: bool },
    /// A fixed multiset drawn without replacement in random order.
    Finite { counts: Vec<(ItemTypeId, u32)> },
    /// Independent draws with the given relative weights.
    Categorical { weights: Vec<(ItemTypeId, f64)> },
}

impl TypeAssignment {
    pub fn validate(&self) -> Result<(), ParamError> {
        match self {
            TypeAssignment::Single(_) => Ok(()),
            TypeAssignment::Sequence { types, .. } if types.is_empty() => {
                Err(ParamError::NoItemTypes)
            }
            TypeAssignment::Sequence { .. } => Ok(()),
            TypeAssignment::Finite { counts } if counts.iter().all(|(_, n)| *n == 0) => {
                Err(ParamError::NoItemTypes)
            }
            TypeAssignment::Finite { .. } => Ok(()),
            TypeAssignment::Categorical { weights } => {
                let ok = !weights.is_empty()
                    && weights.iter().all(|(_, w)| w.is_finite() && *w >= 0.0)
                    && weights.iter().any(|(_, w)| *w > 0.0);
                if ok { Ok(()) } else { Err(ParamError::BadWeights) }
            }
        }
    }

    /// Every type this assignment can produce.
    pub fn types(&self) -> Vec<ItemTypeId> {
        match self {
            TypeAssignment::Single(t) => vec![*t],
            TypeAssignment::Sequence { types, .. } => types.clone(),
            TypeAssignment::Finite { counts } => counts.iter().map(|(t, _)| *t).collect(),
            TypeAssignment::Categorical { weights } => weights.iter().map(|(t, _)| *t).collect(),
        }
    }

    /// Fresh per-run cursor.
    pub fn cursor(&self) -> TypeCursor {
        match self {
            TypeAssignment::Finite { counts } => TypeCursor::Remaining(counts.clone()),
            _ => TypeCursor::Position(0),
        }
    }

    /// Next item type, or `None` once the assignment is used up.
    pub fn next(&self, cursor: &mut TypeCursor, rng: &mut SimRng) -> Option<ItemTypeId> {
        match (self, cursor) {
            (TypeAssignment::Single(t), _) => Some(*t),
            (TypeAssignment::Sequence { types, looping }, TypeCursor::Position(pos)) => {
                if *pos >= types.len() {
                    if !*looping || types.is_empty() {
                        return None;
                    }
                    *pos = 0;
                }
                let t = types[*pos];
                *pos += 1;
                Some(t)
            }
            (TypeAssignment::Finite { .. }, TypeCursor::Remaining(left)) => {
                let weights: Vec<f64> = left.iter().map(|(_, n)| *n as f64).collect();
                let i = rng.pick_weighted(&weights)?;
                left[i].1 -= 1;
                Some(left[i].0)
            }
            (TypeAssignment::Categorical { weights }, _) => {
                let w: Vec<f64> = weights.iter().map(|(_, w)| *w).collect();
                rng.pick_weighted(&w).map(|i| weights[i].0)
            }
            _ => None,
        }
    }
}

/// Per-run progress through a [`TypeAssignment`].
#[derive(Debug, Clone, PartialEq)]
pub enum TypeCursor {
    Position(usize),
    Remaining(Vec<(ItemTypeId, u32)>),
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Creates items on a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceParams {
    /// Time between firings.
    pub interval: Distribution,
    /// Items created per firing.
    pub batch_size: u32,
    /// Total items to create; 0 means unlimited.
    pub limit: u64,
    pub assignment: TypeAssignment,
}

/// An assembly rule: when one firing consumes exactly these types in
/// these counts, the output item becomes `output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combination {
    pub name: String,
    pub ingredients: BTreeMap<ItemTypeId, u32>,
    pub output: ItemTypeId,
}

/// Consumes input items and emits one item after a delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingParams {
    /// Default processing time; item-type overrides take precedence.
    pub time: Distribution,
    pub sync: SyncMode,
    /// Input type to output type. Types not listed pass through unchanged.
    pub output_types: BTreeMap<ItemTypeId, ItemTypeId>,
    /// Checked before `output_types`; the first exact match wins.
    pub combinations: Vec<Combination>,
}

impl ProcessingParams {
    pub fn new(time: Distribution) -> Self {
        Self {
            time,
            sync: SyncMode::default(),
            output_types: BTreeMap::new(),
            combinations: Vec::new(),
        }
    }

    pub fn with_sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }

    pub fn output_type(&self, input: ItemTypeId) -> ItemTypeId {
        self.output_types.get(&input).copied().unwrap_or(input)
    }

    /// Type of the item produced from `consumed`; `consumed[0]` is the
    /// primary item.
    pub fn resolve_output(&self, consumed: &[ItemTypeId]) -> Option<ItemTypeId> {
        let primary = *consumed.first()?;
        if !self.combinations.is_empty() {
            let mut counts: BTreeMap<ItemTypeId, u32> = BTreeMap::new();
            for &t in consumed {
                *counts.entry(t).or_default() += 1;
            }
            if let Some(c) = self.combinations.iter().find(|c| c.ingredients == counts) {
                return Some(c.output);
            }
        }
        Some(self.output_type(primary))
    }

    pub fn validate_combinations(&self) -> Result<(), ParamError> {
        for (i, c) in self.combinations.iter().enumerate() {
            if c.ingredients.values().all(|&n| n == 0) {
                return Err(ParamError::NoItemTypes);
            }
            if self.combinations[..i]
                .iter()
                .any(|other| other.ingredients == c.ingredients)
            {
                return Err(ParamError::AmbiguousCombination(c.name.clone()));
            }
        }
        Ok(())
    }
}

/// How a splitter picks an output for each item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SplitPolicy {
    /// Random choice with these relative weights, one per output edge.
    Weighted(BTreeMap<EdgeId, f64>),
    /// Outputs in turn, in connection order.
    RoundRobin,
}

/// The closed set of station kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Source(SourceParams),
    Sink,
    Processing(ProcessingParams),
    Splitter(SplitPolicy),
    /// Joins several inputs into one output with no delay.
    Merger(InputPriority),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Source(_) => "source",
            NodeKind::Sink => "sink",
            NodeKind::Processing(_) => "processing",
            NodeKind::Splitter(_) => "splitter",
            NodeKind::Merger(_) => "merger",
        }
    }

    /// Whether an item can pass through without simulated time elapsing.
    pub fn is_instant(&self) -> bool {
        match self {
            NodeKind::Splitter(_) | NodeKind::Merger(_) => true,
            NodeKind::Processing(p) => p.time.is_zero(),
            NodeKind::Source(_) | NodeKind::Sink => false,
        }
    }

    /// Processing parameters, with a merger viewed as a zero-time station.
    pub fn processing(&self) -> Option<ProcessingParams> {
        match self {
            NodeKind::Processing(p) => Some(p.clone()),
            NodeKind::Merger(priority) => Some(
                ProcessingParams::new(Distribution::Constant(SimTime::ZERO))
                    .with_sync(SyncMode::FirstAvailable(*priority)),
            ),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

/// Where a source is in its cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePhase {
    /// Not yet started.
    Idle,
    /// Next firing is scheduled.
    Waiting { event: EventId },
    /// A created batch is waiting for room downstream.
    Holding { batch: Vec<Item>, since: SimTime },
    /// Limit reached or type assignment used up.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceState {
    pub phase: SourcePhase,
    pub generated: u64,
    pub cursor: TypeCursor,
    pub held_time: SimTime,
}

/// Where a processing station (or merger) is in its cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ProcessingPhase {
    #[default]
    Idle,
    Busy {
        item: Item,
        /// Type the item will have when it leaves.
        output: ItemTypeId,
        started: SimTime,
        finish: SimTime,
        event: EventId,
    },
    /// Finished but the output buffer is full.
    Blocked { item: Item, since: SimTime },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingState {
    pub phase: ProcessingPhase,
    pub fired: u64,
    pub completed: u64,
    /// Secondary inputs merged into an output item.
    pub assembled: u64,
    pub busy_time: SimTime,
    pub blocked_time: SimTime,
    /// Round-robin start position over the inputs.
    pub cursor: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitterState {
    /// An item whose chosen output is full.
    pub held: Option<(Item, EdgeId)>,
    pub routed: BTreeMap<EdgeId, u64>,
    pub cursor: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkState {
    pub received: u64,
    pub per_type: BTreeMap<ItemTypeId, u64>,
    pub last_arrival: Option<SimTime>,
}

/// Runtime state, one variant per kind (mergers use `Processing`).
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    Source(SourceState),
    Sink(SinkState),
    Processing(ProcessingState),
    Splitter(SplitterState),
}

impl NodeState {
    pub fn initial(kind: &NodeKind) -> Self {
        match kind {
            NodeKind::Source(p) => NodeState::Source(SourceState {
                phase: SourcePhase::Idle,
                generated: 0,
                cursor: p.assignment.cursor(),
                held_time: SimTime::ZERO,
            }),
            NodeKind::Sink => NodeState::Sink(SinkState::default()),
            NodeKind::Processing(_) | NodeKind::Merger(_) => {
                NodeState::Processing(ProcessingState::default())
            }
            NodeKind::Splitter(_) => NodeState::Splitter(SplitterState::default()),
        }
    }

    /// Items owned by the station itself rather than by a buffer.
    pub fn items_held(&self) -> usize {
        match self {
            NodeState::Source(s) => match &s.phase {
                SourcePhase::Holding { batch, .. } => batch.len(),
                _ => 0,
            },
            NodeState::Processing(p) => match p.phase {
                ProcessingPhase::Idle => 0,
                ProcessingPhase::Busy { .. } | ProcessingPhase::Blocked { .. } => 1,
            },
            NodeState::Splitter(s) => usize::from(s.held.is_some()),
            NodeState::Sink(_) => 0,
        }
    }

    /// Short status word for views and logs.
    pub fn status(&self) -> &'static str {
        match self {
            NodeState::Source(s) => match s.phase {
                SourcePhase::Idle => "idle",
                SourcePhase::Waiting { .. } => "waiting",
                SourcePhase::Holding { .. } => "blocked",
                SourcePhase::Exhausted => "exhausted",
            },
            NodeState::Processing(p) => match p.phase {
                ProcessingPhase::Idle => "idle",
                ProcessingPhase::Busy { .. } => "busy",
                ProcessingPhase::Blocked { .. } => "blocked",
            },
            NodeState::Splitter(s) => {
                if s.held.is_some() {
                    "blocked"
                } else {
                    "idle"
                }
            }
            NodeState::Sink(_) => "idle",
        }
    }
}
