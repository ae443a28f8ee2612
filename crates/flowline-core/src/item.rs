//! Items in flight and the per-location log they carry.
//!
//! Every time an item enters or leaves a node or a buffer it records a
//! [`Stamp`]. Time probes read that log to split an item's transit time into
//! the part spent being worked on and the part spent waiting.

use crate::id::{EdgeId, ItemId, ItemTypeId, NodeId};
use crate::time::SimTime;
use serde::{Deserialize, Serialize};

/// A place an item can be: inside a station or queued on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    Node(NodeId),
    Edge(EdgeId),
}

/// One visit of an item to a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamp {
    pub location: Location,
    pub entered: SimTime,
    pub exited: Option<SimTime>,
    /// Time spent actively processed during this visit.
    pub busy: SimTime,
}

/// The durations a time probe records for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transit {
    pub total: SimTime,
    pub processing: SimTime,
    pub waiting: SimTime,
}

/// A discrete unit of work flowing through the line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub item_type: ItemTypeId,
    pub created_at: SimTime,
    trace: Vec<Stamp>,
}

impl Item {
    pub fn new(id: ItemId, item_type: ItemTypeId, created_at: SimTime) -> Self {
        Self {
            id,
            item_type,
            created_at,
            trace: Vec::new(),
        }
    }

    /// Record arrival at `location`.
    pub fn enter(&mut self, location: Location, now: SimTime) {
        self.trace.push(Stamp {
            location,
            entered: now,
            exited: None,
            busy: SimTime::ZERO,
        });
    }

    /// Close the open visit to `location`. Returns false if none is open.
    pub fn exit(&mut self, location: Location, now: SimTime) -> bool {
        match self.open_stamp_mut(location) {
            Some(stamp) => {
                stamp.exited = Some(now);
                true
            }
            None => false,
        }
    }

    /// Add processing time to the open visit at `node`.
    pub fn add_busy(&mut self, node: NodeId, duration: SimTime) {
        if let Some(stamp) = self.open_stamp_mut(Location::Node(node)) {
            stamp.busy += duration;
        }
    }

    fn open_stamp_mut(&mut self, location: Location) -> Option<&mut Stamp> {
        self.trace
            .iter_mut()
            .rev()
            .find(|s| s.location == location && s.exited.is_none())
    }

    pub fn trace(&self) -> &[Stamp] {
        &self.trace
    }

    /// Durations from the latest entry into `start` to the most recent exit
    /// from `end`. `None` if the item never passed `start` before `end`.
    pub fn transit(&self, start: Location, end: Location) -> Option<Transit> {
        let end_idx = self
            .trace
            .iter()
            .rposition(|s| s.location == end && s.exited.is_some())?;
        let start_idx = self.trace[..=end_idx]
            .iter()
            .rposition(|s| s.location == start)?;
        let finished = self.trace[end_idx].exited?;
        let total = finished - self.trace[start_idx].entered;
        let processing: SimTime = self.trace[start_idx..=end_idx]
            .iter()
            .map(|s| s.busy)
            .sum();
        Some(Transit {
            total,
            processing,
            waiting: total - processing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::seconds;
    use slotmap::SlotMap;

    fn ids() -> (NodeId, NodeId, EdgeId) {
        let mut nodes: SlotMap<NodeId, ()> = SlotMap::with_key();
        let mut edges: SlotMap<EdgeId, ()> = SlotMap::with_key();
        (nodes.insert(()), nodes.insert(()), edges.insert(()))
    }

    #[test]
    fn transit_splits_busy_and_waiting() {
        let (src, press, link) = ids();
        let mut item = Item::new(ItemId(0), ItemTypeId(0), SimTime::ZERO);
        item.enter(Location::Node(src), SimTime::ZERO);
        item.exit(Location::Node(src), SimTime::ZERO);
        item.enter(Location::Edge(link), SimTime::ZERO);
        item.exit(Location::Edge(link), seconds(3.0));
        item.enter(Location::Node(press), seconds(3.0));
        item.add_busy(press, seconds(2.0));
        // Blocked for one second after finishing.
        item.exit(Location::Node(press), seconds(6.0));

        let t = item
            .transit(Location::Node(src), Location::Node(press))
            .unwrap();
        assert_eq!(t.total, seconds(6.0));
        assert_eq!(t.processing, seconds(2.0));
        assert_eq!(t.waiting, seconds(4.0));
    }

    #[test]
    fn transit_needs_both_points() {
        let (src, press, link) = ids();
        let mut item = Item::new(ItemId(1), ItemTypeId(0), SimTime::ZERO);
        item.enter(Location::Edge(link), SimTime::ZERO);
        item.exit(Location::Edge(link), seconds(1.0));
        assert!(item.transit(Location::Node(src), Location::Edge(link)).is_none());
        assert!(item.transit(Location::Edge(link), Location::Node(press)).is_none());
        assert!(item.transit(Location::Edge(link), Location::Edge(link)).is_some());
    }

    #[test]
    fn exit_without_entry_is_reported() {
        let (src, _, _) = ids();
        let mut item = Item::new(ItemId(2), ItemTypeId(0), SimTime::ZERO);
        assert!(!item.exit(Location::Node(src), SimTime::ZERO));
    }
}
