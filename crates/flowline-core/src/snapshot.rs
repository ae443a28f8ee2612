//! The model snapshot: a serializable description of a line.
//!
//! A [`GraphSnapshot`] names everything by string key and expresses times as
//! floats in its `timeUnit` (seconds by default). [`GraphSnapshot::build`]
//! resolves it into a [`FlowGraph`], an [`ItemTypeRegistry`] and probe
//! definitions; [`GraphSnapshot::capture`] goes the other way.
//!
//! Building runs in four phases:
//! 1. register item types
//! 2. add nodes with placeholder kinds, then connect edges
//! 3. resolve node parameters (they may name edges) and set each kind
//! 4. attach per-node processing-time overrides and freeze the registry
//! 5. resolve operators' stations and travel routes
//!
//! Structural and parameter validation happens later, in
//! [`Simulation::new`](crate::engine::Simulation::new).

use crate::distribution::Distribution;
use crate::engine::{SimConfig, Simulation};
use crate::error::{SimError, TopologyError};
use crate::graph::FlowGraph;
use crate::id::{EdgeId, ItemTypeId, NodeId};
use crate::item::Location;
use crate::node::{Combination, NodeKind, ProcessingParams, SourceParams, SplitPolicy, TypeAssignment};
use crate::operator::OperatorDef;
use crate::registry::{ItemTypeRegistry, RegistryBuilder, RegistryError};
use crate::sync::{InputPriority, SyncMode};
use crate::time::{SimTime, TimeUnit, from_f64, to_f64};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Sim(#[from] SimError),
    #[error("node '{node}' is missing parameter '{param}'")]
    MissingParam { node: String, param: &'static str },
    #[error("time {value} on '{owner}' is not representable")]
    BadTime { owner: String, value: f64 },
    #[error("'{owner}' refers to unknown item type '{key}'")]
    UnknownItemType { owner: String, key: String },
    #[error("'{owner}' refers to unknown node '{key}'")]
    UnknownNode { owner: String, key: String },
    #[error("'{owner}' refers to unknown edge '{key}'")]
    UnknownEdge { owner: String, key: String },
    #[error("probe '{probe}' refers to unknown node or edge '{key}'")]
    UnknownPoint { probe: String, key: String },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    #[serde(default)]
    pub time_unit: TimeUnit,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub item_types: Vec<ItemTypeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub probes: Vec<ProbeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_probes: Vec<TimeProbeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operators: Vec<OperatorSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKindTag {
    Source,
    Sink,
    Processing,
    Splitter,
    Merger,
}

/// A node entry. Kind parameters sit inline next to `id` and `kind`; a
/// nested `params` object is also accepted and wins when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawNodeSpec")]
pub struct NodeSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: NodeKindTag,
    #[serde(flatten)]
    pub params: NodeParams,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNodeSpec {
    id: String,
    #[serde(default)]
    name: String,
    kind: NodeKindTag,
    #[serde(default)]
    params: Option<NodeParams>,
    #[serde(flatten)]
    inline: NodeParams,
}

impl From<RawNodeSpec> for NodeSpec {
    fn from(raw: RawNodeSpec) -> Self {
        Self {
            id: raw.id,
            name: raw.name,
            kind: raw.kind,
            params: raw.params.unwrap_or(raw.inline),
        }
    }
}

/// Kind-specific parameters. Fields that do not apply to a kind are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<DistributionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_types: Option<AssignmentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<DistributionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_types: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub combinations: Vec<CombinationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<SplitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<InputPriority>,
}

/// Times in the snapshot's unit; rates per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DistributionSpec {
    Constant { value: f64 },
    Normal { mean: f64, stddev: f64 },
    SkewNormal { location: f64, scale: f64, shape: f64 },
    Poisson { rate: f64 },
    Exponential { rate: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AssignmentSpec {
    Single {
        #[serde(rename = "type")]
        item_type: String,
    },
    Sequence {
        types: Vec<String>,
        #[serde(default)]
        looping: bool,
    },
    Finite {
        counts: BTreeMap<String, u32>,
    },
    Categorical {
        weights: BTreeMap<String, f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncSpec {
    FirstAvailable {
        #[serde(default)]
        priority: InputPriority,
    },
    WaitAll,
    /// Input edge key to item count.
    WaitNPerBranch { counts: BTreeMap<String, u32> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SplitSpec {
    /// Output edge key to relative weight.
    Weighted { weights: BTreeMap<String, f64> },
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationSpec {
    pub name: String,
    pub ingredients: BTreeMap<String, u32>,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemTypeSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub color: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<OverrideSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideSpec {
    pub node_id: String,
    pub processing_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub label: String,
    pub edge: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointSpec {
    Node(String),
    Edge(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeProbeSpec {
    pub label: String,
    pub start: PointSpec,
    pub end: PointSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Node keys, first one is the starting position.
    pub machines: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub travel: Vec<TravelSpec>,
}

/// Walking time from one node to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TravelSpec {
    pub from: String,
    pub to: String,
    pub time: DistributionSpec,
}

// ---------------------------------------------------------------------------
// Resolved model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeDef {
    pub label: String,
    pub edge: EdgeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeProbeDef {
    pub label: String,
    pub start: Location,
    pub end: Location,
}

/// A snapshot resolved into engine types, ready for [`Simulation::from_model`].
#[derive(Debug, Clone)]
pub struct Model {
    pub graph: FlowGraph,
    pub registry: ItemTypeRegistry,
    pub probes: Vec<ProbeDef>,
    pub time_probes: Vec<TimeProbeDef>,
    pub operators: Vec<OperatorDef>,
}

// ---------------------------------------------------------------------------
// Building
// ---------------------------------------------------------------------------

/// Name lookups shared by the parameter resolvers.
struct Resolver<'a> {
    unit: TimeUnit,
    graph: &'a FlowGraph,
    types: &'a RegistryBuilder,
    owner: &'a str,
}

impl Resolver<'_> {
    fn time(&self, value: f64) -> Result<SimTime, SnapshotError> {
        from_f64(value, self.unit).ok_or_else(|| SnapshotError::BadTime {
            owner: self.owner.to_string(),
            value,
        })
    }

    fn distribution(&self, spec: &DistributionSpec) -> Result<Distribution, SnapshotError> {
        Ok(match *spec {
            DistributionSpec::Constant { value } => Distribution::Constant(self.time(value)?),
            DistributionSpec::Normal { mean, stddev } => Distribution::Normal {
                mean: self.time(mean)?,
                stddev: self.time(stddev)?,
            },
            DistributionSpec::SkewNormal {
                location,
                scale,
                shape,
            } => Distribution::SkewNormal {
                location: self.time(location)?,
                scale: self.time(scale)?,
                shape,
            },
            DistributionSpec::Poisson { rate } => Distribution::Poisson { rate },
            DistributionSpec::Exponential { rate } => Distribution::Exponential { rate },
        })
    }

    fn item_type(&self, key: &str) -> Result<ItemTypeId, SnapshotError> {
        self.types.id(key).ok_or_else(|| SnapshotError::UnknownItemType {
            owner: self.owner.to_string(),
            key: key.to_string(),
        })
    }

    fn node(&self, key: &str) -> Result<NodeId, SnapshotError> {
        self.graph.node_id(key).ok_or_else(|| SnapshotError::UnknownNode {
            owner: self.owner.to_string(),
            key: key.to_string(),
        })
    }

    fn operator(&self, spec: &OperatorSpec) -> Result<OperatorDef, SnapshotError> {
        let machines = spec
            .machines
            .iter()
            .map(|k| self.node(k))
            .collect::<Result<_, _>>()?;
        let name = spec.name.as_deref().unwrap_or(&spec.id);
        let mut def = OperatorDef::new(&spec.id, name, machines);
        for route in &spec.travel {
            def = def.with_travel(
                self.node(&route.from)?,
                self.node(&route.to)?,
                self.distribution(&route.time)?,
            );
        }
        Ok(def)
    }

    fn edge(&self, key: &str) -> Result<EdgeId, SnapshotError> {
        self.graph.edge_id(key).ok_or_else(|| SnapshotError::UnknownEdge {
            owner: self.owner.to_string(),
            key: key.to_string(),
        })
    }

    fn missing(&self, param: &'static str) -> SnapshotError {
        SnapshotError::MissingParam {
            node: self.owner.to_string(),
            param,
        }
    }

    fn assignment(&self, spec: &AssignmentSpec) -> Result<TypeAssignment, SnapshotError> {
        Ok(match spec {
            AssignmentSpec::Single { item_type } => TypeAssignment::Single(self.item_type(item_type)?),
            AssignmentSpec::Sequence { types, looping } => TypeAssignment::Sequence {
                types: types
                    .iter()
                    .map(|k| self.item_type(k))
                    .collect::<Result<_, _>>()?,
                looping: *looping,
            },
            AssignmentSpec::Finite { counts } => TypeAssignment::Finite {
                counts: counts
                    .iter()
                    .map(|(k, n)| Ok((self.item_type(k)?, *n)))
                    .collect::<Result<_, SnapshotError>>()?,
            },
            AssignmentSpec::Categorical { weights } => TypeAssignment::Categorical {
                weights: weights
                    .iter()
                    .map(|(k, w)| Ok((self.item_type(k)?, *w)))
                    .collect::<Result<_, SnapshotError>>()?,
            },
        })
    }

    fn kind(&self, node: NodeId, tag: NodeKindTag, p: &NodeParams) -> Result<NodeKind, SnapshotError> {
        Ok(match tag {
            NodeKindTag::Source => {
                let interval = p.interval.as_ref().ok_or_else(|| self.missing("interval"))?;
                let assignment = match &p.item_types {
                    Some(spec) => self.assignment(spec)?,
                    None => TypeAssignment::Single(
                        self.types.first().ok_or_else(|| self.missing("itemTypes"))?,
                    ),
                };
                NodeKind::Source(SourceParams {
                    interval: self.distribution(interval)?,
                    batch_size: p.batch_size.unwrap_or(1),
                    limit: p.limit.unwrap_or(0),
                    assignment,
                })
            }
            NodeKindTag::Sink => NodeKind::Sink,
            NodeKindTag::Processing => {
                let time = p
                    .processing_time
                    .as_ref()
                    .ok_or_else(|| self.missing("processingTime"))?;
                let mut params = ProcessingParams::new(self.distribution(time)?);
                params.sync = match &p.sync {
                    None => SyncMode::default(),
                    Some(SyncSpec::FirstAvailable { priority }) => SyncMode::FirstAvailable(*priority),
                    Some(SyncSpec::WaitAll) => SyncMode::WaitAll,
                    Some(SyncSpec::WaitNPerBranch { counts }) => SyncMode::WaitNPerBranch(
                        counts
                            .iter()
                            .map(|(k, n)| Ok((self.edge(k)?, *n)))
                            .collect::<Result<_, SnapshotError>>()?,
                    ),
                };
                for (from, to) in &p.output_types {
                    params
                        .output_types
                        .insert(self.item_type(from)?, self.item_type(to)?);
                }
                for c in &p.combinations {
                    params.combinations.push(Combination {
                        name: c.name.clone(),
                        ingredients: c
                            .ingredients
                            .iter()
                            .map(|(k, n)| Ok((self.item_type(k)?, *n)))
                            .collect::<Result<_, SnapshotError>>()?,
                        output: self.item_type(&c.output)?,
                    });
                }
                NodeKind::Processing(params)
            }
            NodeKindTag::Splitter => NodeKind::Splitter(match &p.split {
                Some(SplitSpec::RoundRobin) => SplitPolicy::RoundRobin,
                Some(SplitSpec::Weighted { weights }) => SplitPolicy::Weighted(
                    weights
                        .iter()
                        .map(|(k, w)| Ok((self.edge(k)?, *w)))
                        .collect::<Result<_, SnapshotError>>()?,
                ),
                // Equal weights.
                None => SplitPolicy::Weighted(
                    self.graph.outputs(node).iter().map(|&e| (e, 1.0)).collect(),
                ),
            }),
            NodeKindTag::Merger => NodeKind::Merger(p.priority.unwrap_or_default()),
        })
    }
}

impl GraphSnapshot {
    /// Resolve keys and units into engine types.
    pub fn build(&self) -> Result<Model, SnapshotError> {
        // Phase 1: item types.
        let mut types = RegistryBuilder::new();
        for spec in &self.item_types {
            let name = spec.name.as_deref().unwrap_or(&spec.id);
            types.register(&spec.id, name, &spec.color)?;
        }

        // Phase 2: topology.
        let mut graph = FlowGraph::new();
        let mut ids = Vec::with_capacity(self.nodes.len());
        for spec in &self.nodes {
            let name = if spec.name.is_empty() { &spec.id } else { &spec.name };
            ids.push(graph.add_node(&spec.id, name, NodeKind::Sink)?);
        }
        for spec in &self.edges {
            let endpoint = |key: &str| {
                graph.node_id(key).ok_or_else(|| TopologyError::DanglingEdge {
                    edge: spec.id.clone(),
                    node: key.to_string(),
                })
            };
            let from = endpoint(&spec.from)?;
            let to = endpoint(&spec.to)?;
            graph.connect_keyed(&spec.id, from, to, spec.capacity)?;
        }

        // Phase 3: parameters.
        let mut kinds = Vec::with_capacity(self.nodes.len());
        for (spec, &node) in self.nodes.iter().zip(&ids) {
            let resolver = Resolver {
                unit: self.time_unit,
                graph: &graph,
                types: &types,
                owner: &spec.id,
            };
            kinds.push((node, resolver.kind(node, spec.kind, &spec.params)?));
        }
        for (node, kind) in kinds {
            graph.set_kind(node, kind)?;
        }

        // Phase 4: overrides. Resolved first, applied once the resolver
        // no longer borrows the builder.
        let mut overrides = Vec::new();
        for spec in &self.item_types {
            let resolver = Resolver {
                unit: self.time_unit,
                graph: &graph,
                types: &types,
                owner: &spec.id,
            };
            let id = resolver.item_type(&spec.id)?;
            for o in &spec.overrides {
                let node = graph.node_id(&o.node_id).ok_or_else(|| SnapshotError::UnknownNode {
                    owner: spec.id.clone(),
                    key: o.node_id.clone(),
                })?;
                overrides.push((id, node, resolver.time(o.processing_time)?));
            }
        }
        for (id, node, time) in overrides {
            types.set_override(id, node, time)?;
        }

        // Phase 5: operators.
        let operators = self
            .operators
            .iter()
            .map(|spec| {
                Resolver {
                    unit: self.time_unit,
                    graph: &graph,
                    types: &types,
                    owner: &spec.id,
                }
                .operator(spec)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let registry = types.build()?;

        let point = |probe: &str, p: &PointSpec| match p {
            PointSpec::Node(k) => graph.node_id(k).map(Location::Node),
            PointSpec::Edge(k) => graph.edge_id(k).map(Location::Edge),
        }
        .ok_or_else(|| SnapshotError::UnknownPoint {
            probe: probe.to_string(),
            key: match p {
                PointSpec::Node(k) | PointSpec::Edge(k) => k.clone(),
            },
        });
        let probes = self
            .probes
            .iter()
            .map(|p| {
                let edge = graph.edge_id(&p.edge).ok_or_else(|| SnapshotError::UnknownPoint {
                    probe: p.label.clone(),
                    key: p.edge.clone(),
                })?;
                Ok(ProbeDef {
                    label: p.label.clone(),
                    edge,
                })
            })
            .collect::<Result<_, SnapshotError>>()?;
        let time_probes = self
            .time_probes
            .iter()
            .map(|p| {
                Ok(TimeProbeDef {
                    label: p.label.clone(),
                    start: point(&p.label, &p.start)?,
                    end: point(&p.label, &p.end)?,
                })
            })
            .collect::<Result<_, SnapshotError>>()?;

        Ok(Model {
            graph,
            registry,
            probes,
            time_probes,
            operators,
        })
    }

    // -----------------------------------------------------------------------
    // Capture
    // -----------------------------------------------------------------------

    /// Describe an existing graph and registry, with times in seconds.
    pub fn capture(graph: &FlowGraph, registry: &ItemTypeRegistry) -> Self {
        let unit = TimeUnit::Seconds;
        let secs = |t: SimTime| to_f64(t, unit);
        let dist = |d: &Distribution| distribution_spec(d, unit);
        let type_key = |t: ItemTypeId| registry.key(t).to_string();
        let edge_key = |e: EdgeId| graph.edge_key(e).to_string();

        let nodes = graph
            .nodes()
            .map(|(_, data)| {
                let mut params = NodeParams::default();
                let kind = match &data.kind {
                    NodeKind::Source(p) => {
                        params.interval = Some(dist(&p.interval));
                        params.batch_size = Some(p.batch_size);
                        params.limit = Some(p.limit);
                        params.item_types = Some(match &p.assignment {
                            TypeAssignment::Single(t) => AssignmentSpec::Single {
                                item_type: type_key(*t),
                            },
                            TypeAssignment::Sequence { types, looping } => AssignmentSpec::Sequence {
                                types: types.iter().map(|t| type_key(*t)).collect(),
                                looping: *looping,
                            },
                            TypeAssignment::Finite { counts } => AssignmentSpec::Finite {
                                counts: counts.iter().map(|(t, n)| (type_key(*t), *n)).collect(),
                            },
                            TypeAssignment::Categorical { weights } => AssignmentSpec::Categorical {
                                weights: weights.iter().map(|(t, w)| (type_key(*t), *w)).collect(),
                            },
                        });
                        NodeKindTag::Source
                    }
                    NodeKind::Sink => NodeKindTag::Sink,
                    NodeKind::Processing(p) => {
                        params.processing_time = Some(dist(&p.time));
                        params.sync = Some(match &p.sync {
                            SyncMode::FirstAvailable(priority) => SyncSpec::FirstAvailable {
                                priority: *priority,
                            },
                            SyncMode::WaitAll => SyncSpec::WaitAll,
                            SyncMode::WaitNPerBranch(counts) => SyncSpec::WaitNPerBranch {
                                counts: counts.iter().map(|(e, n)| (edge_key(*e), *n)).collect(),
                            },
                        });
                        params.output_types = p
                            .output_types
                            .iter()
                            .map(|(from, to)| (type_key(*from), type_key(*to)))
                            .collect();
                        params.combinations = p
                            .combinations
                            .iter()
                            .map(|c| CombinationSpec {
                                name: c.name.clone(),
                                ingredients: c
                                    .ingredients
                                    .iter()
                                    .map(|(t, n)| (type_key(*t), *n))
                                    .collect(),
                                output: type_key(c.output),
                            })
                            .collect();
                        NodeKindTag::Processing
                    }
                    NodeKind::Splitter(policy) => {
                        params.split = Some(match policy {
                            SplitPolicy::Weighted(weights) => SplitSpec::Weighted {
                                weights: weights.iter().map(|(e, w)| (edge_key(*e), *w)).collect(),
                            },
                            SplitPolicy::RoundRobin => SplitSpec::RoundRobin,
                        });
                        NodeKindTag::Splitter
                    }
                    NodeKind::Merger(priority) => {
                        params.priority = Some(*priority);
                        NodeKindTag::Merger
                    }
                };
                NodeSpec {
                    id: data.key.clone(),
                    name: data.name.clone(),
                    kind,
                    params,
                }
            })
            .collect();

        let edges = graph
            .edges()
            .map(|(_, e)| EdgeSpec {
                id: e.key.clone(),
                from: graph.node_key(e.from).to_string(),
                to: graph.node_key(e.to).to_string(),
                capacity: e.capacity,
            })
            .collect();

        let item_types = registry
            .iter()
            .map(|(_, def)| ItemTypeSpec {
                id: def.key.clone(),
                name: Some(def.name.clone()),
                color: def.color.clone(),
                overrides: def
                    .overrides
                    .iter()
                    .map(|(node, t)| OverrideSpec {
                        node_id: graph.node_key(*node).to_string(),
                        processing_time: secs(*t),
                    })
                    .collect(),
            })
            .collect();

        Self {
            time_unit: unit,
            nodes,
            edges,
            item_types,
            probes: Vec::new(),
            time_probes: Vec::new(),
            operators: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(json)?)
    }
}

fn distribution_spec(d: &Distribution, unit: TimeUnit) -> DistributionSpec {
    let time = |t: SimTime| to_f64(t, unit);
    match *d {
        Distribution::Constant(t) => DistributionSpec::Constant { value: time(t) },
        Distribution::Normal { mean, stddev } => DistributionSpec::Normal {
            mean: time(mean),
            stddev: time(stddev),
        },
        Distribution::SkewNormal {
            location,
            scale,
            shape,
        } => DistributionSpec::SkewNormal {
            location: time(location),
            scale: time(scale),
            shape,
        },
        Distribution::Poisson { rate } => DistributionSpec::Poisson { rate },
        Distribution::Exponential { rate } => DistributionSpec::Exponential { rate },
    }
}

impl Simulation {
    /// Build a run from a resolved model and attach its probes.
    pub fn from_model(model: Model, config: SimConfig) -> Result<Self, SimError> {
        let mut sim = Simulation::new(model.graph, model.registry, config)?;
        for p in model.probes {
            sim.add_probe(&p.label, p.edge)?;
        }
        for p in model.time_probes {
            sim.add_time_probe(&p.label, p.start, p.end)?;
        }
        for def in model.operators {
            sim.add_operator(def)?;
        }
        Ok(sim)
    }

    /// Describe this run's model, probes and operators included.
    pub fn snapshot(&self) -> GraphSnapshot {
        let mut snap = GraphSnapshot::capture(&self.graph, &self.registry);
        let point = |l: Location| match l {
            Location::Node(n) => PointSpec::Node(self.graph.node_key(n).to_string()),
            Location::Edge(e) => PointSpec::Edge(self.graph.edge_key(e).to_string()),
        };
        snap.probes = self
            .probes()
            .iter()
            .map(|p| ProbeSpec {
                label: p.label.clone(),
                edge: self.graph.edge_key(p.edge).to_string(),
            })
            .collect();
        snap.time_probes = self
            .time_probes()
            .iter()
            .map(|p| TimeProbeSpec {
                label: p.label.clone(),
                start: point(p.start),
                end: point(p.end),
            })
            .collect();
        let key = |n: NodeId| self.graph.node_key(n).to_string();
        let unit = snap.time_unit;
        snap.operators = self
            .crew()
            .iter()
            .map(|(_, def, _)| OperatorSpec {
                id: def.key.clone(),
                name: Some(def.name.clone()),
                machines: def.machines.iter().map(|n| key(*n)).collect(),
                travel: def
                    .travel
                    .iter()
                    .map(|(&(from, to), time)| TravelSpec {
                        from: key(from),
                        to: key(to),
                        time: distribution_spec(time, unit),
                    })
                    .collect(),
            })
            .collect();
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = r##"{
        "nodes": [
            {"id": "src", "kind": "source", "name": "Source",
             "params": {"interval": {"type": "constant", "value": 1.0}, "limit": 5,
                        "itemTypes": {"mode": "single", "type": "part"}}},
            {"id": "press", "kind": "processing",
             "params": {"processingTime": {"type": "normal", "mean": 2.0, "stddev": 0.5},
                        "outputTypes": {"part": "pressed"}}},
            {"id": "sink", "kind": "sink"}
        ],
        "edges": [
            {"id": "a", "from": "src", "to": "press", "capacity": 3},
            {"id": "b", "from": "press", "to": "sink"}
        ],
        "itemTypes": [
            {"id": "part", "color": "#888888",
             "overrides": [{"nodeId": "press", "processingTime": 1.5}]},
            {"id": "pressed", "name": "Pressed part", "color": "#222222"}
        ],
        "probes": [{"label": "into press", "edge": "a"}],
        "timeProbes": [{"label": "door to door", "start": {"node": "src"}, "end": {"node": "sink"}}]
    }"##;

    #[test]
    fn builds_line_from_json() {
        let model = GraphSnapshot::from_json(LINE).unwrap().build().unwrap();
        let g = &model.graph;
        assert_eq!(g.node_count(), 3);
        let press = g.node_id("press").unwrap();
        assert_eq!(g.node(press).unwrap().name, "press");
        assert_eq!(g.edge(g.edge_id("a").unwrap()).unwrap().capacity, Some(3));

        let part = model.registry.id("part").unwrap();
        let pressed = model.registry.id("pressed").unwrap();
        assert_eq!(model.registry.processing_override(part, press), Some(crate::time::seconds(1.5)));
        match &g.node(press).unwrap().kind {
            NodeKind::Processing(p) => assert_eq!(p.output_type(part), pressed),
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(model.probes.len(), 1);
        assert_eq!(model.time_probes[0].end, Location::Node(g.node_id("sink").unwrap()));
    }

    #[test]
    fn dangling_edge_rejected() {
        let snap = GraphSnapshot::from_json(
            r#"{"nodes": [{"id": "sink", "kind": "sink"}],
                "edges": [{"id": "x", "from": "ghost", "to": "sink"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            snap.build(),
            Err(SnapshotError::Topology(TopologyError::DanglingEdge { .. }))
        ));
    }

    #[test]
    fn missing_interval_reported() {
        let snap = GraphSnapshot::from_json(
            r#"{"nodes": [{"id": "src", "kind": "source"}, {"id": "sink", "kind": "sink"}],
                "edges": [{"id": "x", "from": "src", "to": "sink"}],
                "itemTypes": [{"id": "part"}]}"#,
        )
        .unwrap();
        match snap.build() {
            Err(SnapshotError::MissingParam { node, param }) => {
                assert_eq!(node, "src");
                assert_eq!(param, "interval");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_weight_edge_reported() {
        let snap = GraphSnapshot::from_json(
            r#"{"nodes": [
                    {"id": "src", "kind": "source", "params": {"interval": {"type": "constant", "value": 1}}},
                    {"id": "split", "kind": "splitter", "params": {"split": {"policy": "weighted", "weights": {"nope": 1}}}},
                    {"id": "sink", "kind": "sink"}],
                "edges": [{"id": "a", "from": "src", "to": "split"}, {"id": "b", "from": "split", "to": "sink"}],
                "itemTypes": [{"id": "part"}]}"#,
        )
        .unwrap();
        assert!(matches!(snap.build(), Err(SnapshotError::UnknownEdge { .. })));
    }

    #[test]
    fn inline_and_nested_params_build_the_same_node() {
        let inline = GraphSnapshot::from_json(
            r#"{"nodes": [{"id": "src", "kind": "source", "interval": {"type": "constant", "value": 2},
                           "limit": 4, "batchSize": 2},
                          {"id": "sink", "kind": "sink"}],
                "edges": [{"id": "a", "from": "src", "to": "sink"}],
                "itemTypes": [{"id": "part"}]}"#,
        )
        .unwrap();
        let nested = GraphSnapshot::from_json(
            r#"{"nodes": [{"id": "src", "kind": "source",
                           "params": {"interval": {"type": "constant", "value": 2},
                                      "limit": 4, "batchSize": 2}},
                          {"id": "sink", "kind": "sink"}],
                "edges": [{"id": "a", "from": "src", "to": "sink"}],
                "itemTypes": [{"id": "part"}]}"#,
        )
        .unwrap();
        assert_eq!(inline, nested);
        assert_eq!(inline.nodes[0].params.limit, Some(4));

        let model = inline.build().unwrap();
        let src = model.graph.node_id("src").unwrap();
        match &model.graph.node(src).unwrap().kind {
            NodeKind::Source(p) => {
                assert_eq!(p.interval, Distribution::Constant(crate::time::seconds(2.0)));
                assert_eq!((p.batch_size, p.limit), (2, 4));
            }
            other => panic!("unexpected kind {other:?}"),
        }

        // Captured snapshots write parameters inline.
        let json = serde_json::to_value(&inline).unwrap();
        assert_eq!(json["nodes"][0]["limit"], 4);
        assert!(json["nodes"][0].get("params").is_none());
    }

    const CELL: &str = r##"{
        "nodes": [
            {"id": "src", "kind": "source", "interval": {"type": "constant", "value": 1.0}, "limit": 2},
            {"id": "split", "kind": "splitter", "split": {"policy": "round_robin"}},
            {"id": "lathe", "kind": "processing",
             "processingTime": {"type": "skew_normal", "location": 2.0, "scale": 0.5, "shape": 3.0}},
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
        "itemTypes": [{"id": "part"}],
        "operators": [
            {"id": "ann", "machines": ["lathe", "mill"],
             "travel": [{"from": "lathe", "to": "mill", "time": {"type": "constant", "value": 0.5}}]}
        ]
    }"##;

    #[test]
    fn operators_and_skew_normal_build_and_capture() {
        let snap = GraphSnapshot::from_json(CELL).unwrap();
        let model = snap.build().unwrap();
        let lathe = model.graph.node_id("lathe").unwrap();
        let mill = model.graph.node_id("mill").unwrap();
        match &model.graph.node(lathe).unwrap().kind {
            NodeKind::Processing(p) => assert_eq!(
                p.time,
                Distribution::SkewNormal {
                    location: crate::time::seconds(2.0),
                    scale: crate::time::seconds(0.5),
                    shape: 3.0,
                }
            ),
            other => panic!("unexpected kind {other:?}"),
        }
        let ann = &model.operators[0];
        assert_eq!((ann.key.as_str(), ann.name.as_str()), ("ann", "ann"));
        assert_eq!(ann.machines, vec![lathe, mill]);
        assert_eq!(
            ann.travel.get(&(lathe, mill)),
            Some(&Distribution::Constant(crate::time::seconds(0.5)))
        );

        let sim = Simulation::from_model(model, SimConfig::default()).unwrap();
        assert_eq!(sim.crew().len(), 1);
        let captured = sim.snapshot();
        assert_eq!(captured.operators[0].machines, vec!["lathe", "mill"]);
        assert_eq!(captured.operators[0].travel, snap.operators[0].travel);
        let rebuilt = GraphSnapshot::from_json(&captured.to_json().unwrap()).unwrap();
        assert_eq!(rebuilt, captured);
    }

    #[test]
    fn operator_on_unknown_node_reported() {
        let json = CELL.replace(r#""machines": ["lathe", "mill"]"#, r#""machines": ["lathe", "drill"]"#);
        match GraphSnapshot::from_json(&json).unwrap().build() {
            Err(SnapshotError::UnknownNode { owner, key }) => {
                assert_eq!((owner.as_str(), key.as_str()), ("ann", "drill"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn centisecond_unit_scales_times() {
        let snap = GraphSnapshot::from_json(
            r#"{"timeUnit": "centiseconds",
                "nodes": [{"id": "src", "kind": "source", "params": {"interval": {"type": "constant", "value": 50}}},
                          {"id": "sink", "kind": "sink"}],
                "edges": [{"id": "a", "from": "src", "to": "sink"}],
                "itemTypes": [{"id": "part"}]}"#,
        )
        .unwrap();
        let model = snap.build().unwrap();
        let src = model.graph.node_id("src").unwrap();
        match &model.graph.node(src).unwrap().kind {
            NodeKind::Source(p) => {
                assert_eq!(p.interval, Distribution::Constant(crate::time::seconds(0.5)))
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn capture_round_trips_through_json() {
        let original = GraphSnapshot::from_json(LINE).unwrap();
        let model = original.build().unwrap();
        let sim = Simulation::from_model(model, SimConfig::default()).unwrap();
        let captured = sim.snapshot();
        let json = captured.to_json().unwrap();
        let reparsed = GraphSnapshot::from_json(&json).unwrap();
        assert_eq!(reparsed, captured);

        let rebuilt = reparsed.build().unwrap();
        assert_eq!(rebuilt.graph.node_count(), 3);
        assert_eq!(rebuilt.graph.edge_count(), 2);
        assert_eq!(GraphSnapshot::capture(&rebuilt.graph, &rebuilt.registry).nodes, captured.nodes);
        assert_eq!(captured.probes[0].edge, "a");
        assert_eq!(captured.time_probes[0].start, PointSpec::Node("src".into()));
    }
}
