//! Operators: workers shared between processing stations.
//!
//! A station with assigned operators fires only when one of them is free.
//! The first free operator in the order they were added takes the job,
//! walks over if it last worked elsewhere, and stays with the station until
//! the job completes. Travel between two stations follows the operator's
//! route table; routes it does not list take no time.

use crate::distribution::Distribution;
use crate::error::{ParamError, SimError, TopologyError};
use crate::graph::FlowGraph;
use crate::id::{NodeId, OperatorId};
use crate::node::NodeKind;
use crate::rng::SimRng;
use crate::time::SimTime;
use slotmap::SecondaryMap;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorDef {
    pub key: String,
    pub name: String,
    /// Stations this operator may work, in preference order. The first one
    /// is where the operator starts.
    pub machines: Vec<NodeId>,
    /// Walking time from one station to another.
    pub travel: BTreeMap<(NodeId, NodeId), Distribution>,
}

impl OperatorDef {
    pub fn new(key: &str, name: &str, machines: Vec<NodeId>) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            machines,
            travel: BTreeMap::new(),
        }
    }

    pub fn with_travel(mut self, from: NodeId, to: NodeId, time: Distribution) -> Self {
        self.travel.insert((from, to), time);
        self
    }

    fn validate(&self, graph: &FlowGraph) -> Result<(), SimError> {
        let fail = |reason| Err(SimError::param(self.key.clone(), reason));
        if self.machines.is_empty() {
            return fail(ParamError::NoMachines);
        }
        for &machine in &self.machines {
            match graph.node(machine).map(|d| &d.kind) {
                None => return Err(TopologyError::NodeNotFound(machine).into()),
                Some(NodeKind::Processing(_)) => {}
                Some(_) => return fail(ParamError::NotAMachine(machine)),
            }
        }
        for (&(from, to), time) in &self.travel {
            for end in [from, to] {
                if graph.node(end).is_none() {
                    return Err(TopologyError::NodeNotFound(end).into());
                }
            }
            time.validate().or_else(fail)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

/// A job an operator is on: walking to `node` until `arrives`, then working
/// until `finish`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assignment {
    pub node: NodeId,
    pub departed: SimTime,
    pub arrives: SimTime,
    pub finish: SimTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorState {
    /// Station the operator is at, or walking to.
    pub position: NodeId,
    pub current: Option<Assignment>,
    pub jobs: u64,
    /// Completed work, excluding walking.
    pub busy_time: SimTime,
    /// Completed walking.
    pub travel_time: SimTime,
}

impl OperatorState {
    /// Busy time including the current job up to `now`.
    pub fn busy_at(&self, now: SimTime) -> SimTime {
        match self.current {
            Some(a) => self.busy_time + (now.min(a.finish) - a.arrives).max(SimTime::ZERO),
            None => self.busy_time,
        }
    }

    /// Travel time including the current walk up to `now`.
    pub fn travel_at(&self, now: SimTime) -> SimTime {
        match self.current {
            Some(a) => self.travel_time + (now.min(a.arrives) - a.departed).max(SimTime::ZERO),
            None => self.travel_time,
        }
    }

    pub fn status(&self, now: SimTime) -> &'static str {
        match self.current {
            None => "idle",
            Some(a) if now < a.arrives => "traveling",
            Some(_) => "busy",
        }
    }
}

/// Every operator of one run, with a station-to-operators index.
#[derive(Debug, Clone, Default)]
pub struct Crew {
    defs: Vec<OperatorDef>,
    states: Vec<OperatorState>,
    by_machine: SecondaryMap<NodeId, Vec<OperatorId>>,
}

impl Crew {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, def: OperatorDef, graph: &FlowGraph) -> Result<OperatorId, SimError> {
        def.validate(graph)?;
        if self.defs.iter().any(|d| d.key == def.key) {
            return Err(SimError::param(def.key.clone(), ParamError::DuplicateOperator));
        }
        let id = OperatorId(self.defs.len() as u32);
        for &machine in &def.machines {
            match self.by_machine.get_mut(machine) {
                Some(list) => list.push(id),
                None => {
                    self.by_machine.insert(machine, vec![id]);
                }
            }
        }
        self.states.push(OperatorState {
            position: def.machines[0],
            current: None,
            jobs: 0,
            busy_time: SimTime::ZERO,
            travel_time: SimTime::ZERO,
        });
        self.defs.push(def);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn def(&self, id: OperatorId) -> Option<&OperatorDef> {
        self.defs.get(id.0 as usize)
    }

    pub fn state(&self, id: OperatorId) -> Option<&OperatorState> {
        self.states.get(id.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (OperatorId, &OperatorDef, &OperatorState)> {
        self.defs
            .iter()
            .zip(&self.states)
            .enumerate()
            .map(|(i, (def, state))| (OperatorId(i as u32), def, state))
    }

    /// True if `node` needs an operator to fire.
    pub fn staffs(&self, node: NodeId) -> bool {
        self.by_machine.get(node).is_some_and(|list| !list.is_empty())
    }

    /// The first idle operator assigned to `node`.
    pub fn available(&self, node: NodeId) -> Option<OperatorId> {
        self.by_machine
            .get(node)?
            .iter()
            .copied()
            .find(|id| self.state(*id).is_some_and(|s| s.current.is_none()))
    }

    /// The operator currently assigned to `node`.
    pub fn serving(&self, node: NodeId) -> Option<OperatorId> {
        self.by_machine.get(node)?.iter().copied().find(|id| {
            self.state(*id)
                .and_then(|s| s.current)
                .is_some_and(|a| a.node == node)
        })
    }

    /// Send `id` to `node` for a job of length `work`. Returns the walking
    /// time, zero when the operator is already there.
    pub(crate) fn dispatch(
        &mut self,
        id: OperatorId,
        node: NodeId,
        now: SimTime,
        work: SimTime,
        rng: &mut SimRng,
    ) -> Option<SimTime> {
        let def = self.defs.get(id.0 as usize)?;
        let state = self.states.get_mut(id.0 as usize)?;
        let walk = if state.position == node {
            SimTime::ZERO
        } else {
            def.travel
                .get(&(state.position, node))
                .map_or(SimTime::ZERO, |d| d.sample(rng))
        };
        let arrives = now.saturating_add(walk);
        state.position = node;
        state.jobs += 1;
        state.current = Some(Assignment {
            node,
            departed: now,
            arrives,
            finish: arrives.saturating_add(work),
        });
        Some(walk)
    }

    /// End the job at `node`. Returns the freed operator.
    pub(crate) fn release(&mut self, node: NodeId) -> Option<OperatorId> {
        let id = self.serving(node)?;
        let state = self.states.get_mut(id.0 as usize)?;
        let a = state.current.take()?;
        state.travel_time += a.arrives - a.departed;
        state.busy_time += a.finish - a.arrives;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ProcessingParams;
    use crate::time::seconds;

    fn two_machines() -> (FlowGraph, NodeId, NodeId, NodeId) {
        let mut g = FlowGraph::new();
        let station =
            || NodeKind::Processing(ProcessingParams::new(Distribution::Constant(seconds(1.0))));
        let a = g.add_node("a", "A", station()).unwrap();
        let b = g.add_node("b", "B", station()).unwrap();
        let k = g.add_node("sink", "Sink", NodeKind::Sink).unwrap();
        (g, a, b, k)
    }

    #[test]
    fn first_free_operator_takes_the_job() {
        let (g, a, b, _) = two_machines();
        let mut crew = Crew::new();
        let ann = crew.add(OperatorDef::new("ann", "Ann", vec![a, b]), &g).unwrap();
        let bob = crew.add(OperatorDef::new("bob", "Bob", vec![b]), &g).unwrap();
        let mut rng = SimRng::new(1);

        assert_eq!(crew.available(b), Some(ann));
        crew.dispatch(ann, a, SimTime::ZERO, seconds(1.0), &mut rng).unwrap();
        assert_eq!(crew.available(a), None);
        assert_eq!(crew.available(b), Some(bob));
        assert_eq!(crew.serving(a), Some(ann));

        assert_eq!(crew.release(a), Some(ann));
        assert_eq!(crew.available(a), Some(ann));
        assert_eq!(crew.release(a), None);
    }

    #[test]
    fn walking_is_tracked_apart_from_work() {
        let (g, a, b, _) = two_machines();
        let mut crew = Crew::new();
        let def = OperatorDef::new("ann", "Ann", vec![a, b])
            .with_travel(a, b, Distribution::Constant(seconds(2.0)));
        let ann = crew.add(def, &g).unwrap();
        let mut rng = SimRng::new(1);

        let walk = crew.dispatch(ann, b, seconds(1.0), seconds(3.0), &mut rng).unwrap();
        assert_eq!(walk, seconds(2.0));
        let st = crew.state(ann).unwrap();
        assert_eq!(st.status(seconds(2.0)), "traveling");
        assert_eq!(st.travel_at(seconds(2.0)), seconds(1.0));
        assert_eq!(st.busy_at(seconds(2.0)), SimTime::ZERO);
        assert_eq!(st.status(seconds(4.0)), "busy");
        assert_eq!(st.busy_at(seconds(4.0)), seconds(1.0));

        crew.release(b).unwrap();
        let st = crew.state(ann).unwrap();
        assert_eq!((st.travel_time, st.busy_time), (seconds(2.0), seconds(3.0)));
        assert_eq!(st.position, b);

        // Back to a: no route listed, so no walking.
        let walk = crew.dispatch(ann, a, seconds(6.0), seconds(1.0), &mut rng).unwrap();
        assert_eq!(walk, SimTime::ZERO);
    }

    #[test]
    fn machines_must_be_processing_stations() {
        let (g, a, _, k) = two_machines();
        let mut crew = Crew::new();
        assert_eq!(
            crew.add(OperatorDef::new("ann", "Ann", vec![]), &g),
            Err(SimError::param("ann", ParamError::NoMachines))
        );
        assert_eq!(
            crew.add(OperatorDef::new("ann", "Ann", vec![a, k]), &g),
            Err(SimError::param("ann", ParamError::NotAMachine(k)))
        );
        crew.add(OperatorDef::new("ann", "Ann", vec![a]), &g).unwrap();
        assert_eq!(
            crew.add(OperatorDef::new("ann", "Other", vec![a]), &g),
            Err(SimError::param("ann", ParamError::DuplicateOperator))
        );
        assert!(!crew.staffs(k));
    }
}
