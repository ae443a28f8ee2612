//! Run fingerprint for determinism checks.
//!
//! Every dispatched event is folded into an FNV-1a hash in dispatch order.
//! Two runs of the same model with the same seed must end with the same
//! digest; any divergence in event order, timing or target shows up here.

use crate::id::NodeId;
use crate::scheduler::{EventKind, ScheduledEvent};
use crate::time::SimTime;
use slotmap::Key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunDigest(pub u64);

impl RunDigest {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_time(&mut self, t: SimTime) {
        self.write(&t.to_bits().to_le_bytes());
    }

    pub fn write_node(&mut self, node: NodeId) {
        self.write_u64(node.data().as_ffi());
    }

    /// Fold one dispatched event.
    pub fn write_event(&mut self, event: &ScheduledEvent) {
        self.write_time(event.time);
        self.write_node(event.node);
        self.write(&[match event.kind {
            EventKind::SourceFire => 0,
            EventKind::Complete => 1,
            EventKind::Evaluate => 2,
            EventKind::Retry => 3,
        }]);
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for RunDigest {
    fn default() -> Self {
        Self::new()
    }
}
