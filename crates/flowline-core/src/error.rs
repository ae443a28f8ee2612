use crate::id::{EdgeId, EventId, NodeId};
use crate::time::SimTime;

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Structural problems with a flow graph. Fatal to starting a run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TopologyError {
    #[error("graph has no nodes")]
    Empty,
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),
    #[error("duplicate edge id '{0}'")]
    DuplicateEdge(String),
    #[error("node not found: {0:?}")]
    NodeNotFound(NodeId),
    #[error("edge not found: {0:?}")]
    EdgeNotFound(EdgeId),
    #[error("edge '{edge}' references unknown node '{node}'")]
    DanglingEdge { edge: String, node: String },
    #[error("node '{0}' is not connected to anything")]
    OrphanNode(String),
    #[error("cycle without processing delay through {0:?}")]
    ZeroDelayCycle(Vec<String>),
    #[error("{kind} node '{node}' has {inputs} input(s) and {outputs} output(s); expected {expected}")]
    Arity {
        node: String,
        kind: &'static str,
        inputs: usize,
        outputs: usize,
        expected: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Why a node, edge, or probe parameter was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamError {
    #[error("time must not be negative (got {0})")]
    NegativeTime(SimTime),
    #[error("rate must be positive and finite (got {0})")]
    NonPositiveRate(f64),
    #[error("standard deviation must be positive (got {0})")]
    NonPositiveStddev(SimTime),
    #[error("shape must be finite (got {0})")]
    NonFiniteShape(f64),
    #[error("buffer capacity must be at least 1")]
    ZeroCapacity,
    #[error("batch size must be at least 1")]
    ZeroBatch,
    #[error("batch of {batch} can never fit an output buffer of capacity {capacity}")]
    BatchExceedsCapacity { batch: u32, capacity: u32 },
    #[error("item type list is empty")]
    NoItemTypes,
    #[error("weights must be finite, non-negative and not all zero")]
    BadWeights,
    #[error("weight given for {0:?}, which is not an output of this node")]
    UnknownBranch(EdgeId),
    #[error("no weight given for output {0:?}")]
    MissingWeight(EdgeId),
    #[error("no per-branch count given for input {0:?}")]
    MissingBranchCount(EdgeId),
    #[error("per-branch count for input {0:?} must be at least 1")]
    ZeroBranchCount(EdgeId),
    #[error("combination '{0}' has the same ingredients as an earlier one")]
    AmbiguousCombination(String),
    #[error("unknown item type {0:?}")]
    UnknownItemType(crate::id::ItemTypeId),
    #[error("interval must be positive (got {0})")]
    NonPositiveInterval(SimTime),
    #[error("a zero interval needs an item limit")]
    UnboundedZeroInterval,
    #[error("operator has no stations assigned")]
    NoMachines,
    #[error("{0:?} is not a processing station")]
    NotAMachine(NodeId),
    #[error("duplicate operator id")]
    DuplicateOperator,
    #[error("probe window must be positive")]
    ZeroWindow,
    #[error("speed multiplier must be positive and finite (got {0})")]
    InvalidSpeed(f64),
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Errors raised while building or running a simulation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimError {
    #[error("invalid topology: {0}")]
    InvalidTopology(#[from] TopologyError),
    #[error("invalid parameter on '{node}': {reason}")]
    InvalidParameter {
        node: String,
        #[source]
        reason: ParamError,
    },
    #[error("cannot schedule with negative delay {0}")]
    InvalidDelay(SimTime),
    #[error("internal error at node '{node}' handling {event:?}: {detail}")]
    Internal {
        node: String,
        event: Option<EventId>,
        detail: String,
    },
}

impl SimError {
    pub(crate) fn param(node: impl Into<String>, reason: ParamError) -> Self {
        SimError::InvalidParameter {
            node: node.into(),
            reason,
        }
    }
}
