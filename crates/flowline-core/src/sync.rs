//! Input synchronization for multi-input stations.
//!
//! Planning inspects only the head counts of the input buffers and is
//! O(inputs). A [`ConsumptionPlan`] is then executed with [`take`], which
//! re-checks every branch before removing anything, so a plan that went
//! stale in between never consumes part of its inputs.

use crate::buffer::{Buffer, Shortfall};
use crate::id::EdgeId;
use crate::item::Item;
use serde::{Deserialize, Serialize};
use slotmap::SecondaryMap;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Tie-break between several non-empty inputs under `FirstAvailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputPriority {
    /// The earliest-connected non-empty input wins.
    #[default]
    Order,
    /// Rotate the starting input after each firing.
    RoundRobin,
}

/// When a station with several inputs may fire, and what it consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Fire on any non-empty input; take one item from it.
    FirstAvailable(InputPriority),
    /// Fire when every input holds an item; take one from each.
    WaitAll,
    /// Fire when every input holds its quota; take exactly that many.
    WaitNPerBranch(BTreeMap<EdgeId, u32>),
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::FirstAvailable(InputPriority::Order)
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// How many items to remove from which input, in connection order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionPlan {
    pub takes: Vec<(EdgeId, usize)>,
    /// Index (into the input list) of the input that triggered a
    /// `FirstAvailable` firing.
    pub chosen: Option<usize>,
}

impl ConsumptionPlan {
    pub fn item_count(&self) -> usize {
        self.takes.iter().map(|(_, n)| n).sum()
    }
}

fn queued(buffers: &SecondaryMap<EdgeId, Buffer>, edge: EdgeId) -> usize {
    buffers.get(edge).map(Buffer::len).unwrap_or(0)
}

/// Decide whether the inputs satisfy `mode`. `cursor` is the round-robin
/// start position; ignored for other policies.
pub fn plan(
    mode: &SyncMode,
    inputs: &[EdgeId],
    buffers: &SecondaryMap<EdgeId, Buffer>,
    cursor: usize,
) -> Option<ConsumptionPlan> {
    if inputs.is_empty() {
        return None;
    }
    match mode {
        SyncMode::FirstAvailable(priority) => {
            let start = match priority {
                InputPriority::Order => 0,
                InputPriority::RoundRobin => cursor % inputs.len(),
            };
            (0..inputs.len())
                .map(|offset| (start + offset) % inputs.len())
                .find(|&i| queued(buffers, inputs[i]) > 0)
                .map(|i| ConsumptionPlan {
                    takes: vec![(inputs[i], 1)],
                    chosen: Some(i),
                })
        }
        SyncMode::WaitAll => inputs
            .iter()
            .all(|&e| queued(buffers, e) >= 1)
            .then(|| ConsumptionPlan {
                takes: inputs.iter().map(|&e| (e, 1)).collect(),
                chosen: None,
            }),
        SyncMode::WaitNPerBranch(quota) => {
            let mut takes = Vec::with_capacity(inputs.len());
            for &edge in inputs {
                let need = quota.get(&edge).copied().unwrap_or(1) as usize;
                if queued(buffers, edge) < need {
                    return None;
                }
                takes.push((edge, need));
            }
            Some(ConsumptionPlan {
                takes,
                chosen: None,
            })
        }
    }
}

/// A plan whose preconditions no longer hold.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stale plan on {edge:?}: {shortfall}")]
pub struct StalePlan {
    pub edge: EdgeId,
    pub shortfall: Shortfall,
}

/// Execute a plan. Verifies every branch first; on failure nothing is taken.
pub fn take(
    plan: &ConsumptionPlan,
    buffers: &mut SecondaryMap<EdgeId, Buffer>,
) -> Result<Vec<(EdgeId, Vec<Item>)>, StalePlan> {
    for &(edge, need) in &plan.takes {
        let available = queued(buffers, edge);
        if available < need {
            return Err(StalePlan {
                edge,
                shortfall: Shortfall {
                    needed: need,
                    available,
                },
            });
        }
    }
    let mut taken = Vec::with_capacity(plan.takes.len());
    for &(edge, need) in &plan.takes {
        let buffer = buffers.get_mut(edge).ok_or(StalePlan {
            edge,
            shortfall: Shortfall {
                needed: need,
                available: 0,
            },
        })?;
        let items = buffer.take(need).map_err(|shortfall| StalePlan { edge, shortfall })?;
        taken.push((edge, items));
    }
    Ok(taken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{ItemId, ItemTypeId};
    use crate::time::SimTime;
    use slotmap::SlotMap;

    fn setup(n: usize) -> (Vec<EdgeId>, SecondaryMap<EdgeId, Buffer>) {
        let mut keys: SlotMap<EdgeId, ()> = SlotMap::with_key();
        let edges: Vec<EdgeId> = (0..n).map(|_| keys.insert(())).collect();
        let mut buffers = SecondaryMap::new();
        for &e in &edges {
            buffers.insert(e, Buffer::new(None));
        }
        (edges, buffers)
    }

    fn fill(buffers: &mut SecondaryMap<EdgeId, Buffer>, edge: EdgeId, n: u64) {
        for i in 0..n {
            buffers[edge]
                .try_push(Item::new(ItemId(i), ItemTypeId(0), SimTime::ZERO))
                .unwrap();
        }
    }

    #[test]
    fn first_available_prefers_connection_order() {
        let (edges, mut buffers) = setup(3);
        fill(&mut buffers, edges[1], 1);
        fill(&mut buffers, edges[2], 1);
        let p = plan(&SyncMode::default(), &edges, &buffers, 0).unwrap();
        assert_eq!(p.takes, vec![(edges[1], 1)]);
        assert_eq!(p.chosen, Some(1));
    }

    #[test]
    fn first_available_round_robin_rotates() {
        let (edges, mut buffers) = setup(3);
        for &e in &edges {
            fill(&mut buffers, e, 1);
        }
        let mode = SyncMode::FirstAvailable(InputPriority::RoundRobin);
        let p = plan(&mode, &edges, &buffers, 2).unwrap();
        assert_eq!(p.takes, vec![(edges[2], 1)]);
        let p = plan(&mode, &edges, &buffers, 3).unwrap();
        assert_eq!(p.takes, vec![(edges[0], 1)]);
    }

    #[test]
    fn wait_all_needs_every_input() {
        let (edges, mut buffers) = setup(2);
        fill(&mut buffers, edges[0], 3);
        assert!(plan(&SyncMode::WaitAll, &edges, &buffers, 0).is_none());
        fill(&mut buffers, edges[1], 1);
        let p = plan(&SyncMode::WaitAll, &edges, &buffers, 0).unwrap();
        assert_eq!(p.item_count(), 2);
    }

    #[test]
    fn wait_n_uses_quotas() {
        let (edges, mut buffers) = setup(2);
        let quota = BTreeMap::from([(edges[0], 2), (edges[1], 3)]);
        let mode = SyncMode::WaitNPerBranch(quota);
        fill(&mut buffers, edges[0], 2);
        fill(&mut buffers, edges[1], 2);
        assert!(plan(&mode, &edges, &buffers, 0).is_none());
        fill(&mut buffers, edges[1], 1);
        let p = plan(&mode, &edges, &buffers, 0).unwrap();
        assert_eq!(p.takes, vec![(edges[0], 2), (edges[1], 3)]);
    }

    #[test]
    fn stale_plan_takes_nothing() {
        let (edges, mut buffers) = setup(2);
        let mode = SyncMode::WaitNPerBranch(BTreeMap::from([(edges[0], 2), (edges[1], 2)]));
        fill(&mut buffers, edges[0], 2);
        fill(&mut buffers, edges[1], 2);
        let p = plan(&mode, &edges, &buffers, 0).unwrap();

        // Another consumer drains one item from the second branch.
        buffers[edges[1]].pop();

        let err = take(&p, &mut buffers).unwrap_err();
        assert_eq!(err.edge, edges[1]);
        assert_eq!(buffers[edges[0]].len(), 2);
        assert_eq!(buffers[edges[1]].len(), 1);
    }

    #[test]
    fn take_preserves_fifo() {
        let (edges, mut buffers) = setup(1);
        fill(&mut buffers, edges[0], 3);
        let p = plan(
            &SyncMode::WaitNPerBranch(BTreeMap::from([(edges[0], 2)])),
            &edges,
            &buffers,
            0,
        )
        .unwrap();
        let taken = take(&p, &mut buffers).unwrap();
        let ids: Vec<u64> = taken[0].1.iter().map(|i| i.id.0).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(buffers[edges[0]].front().unwrap().id, ItemId(2));
    }
}
