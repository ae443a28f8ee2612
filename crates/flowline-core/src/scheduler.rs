//! Time-ordered event queue: the only thing that moves simulated time.
//!
//! Events are ordered by fire time, then by insertion sequence, so two
//! events due at the same instant fire in the order they were scheduled.
//! The queue is a `BTreeMap` keyed by that pair; cancellation looks the key
//! up through a side index and removes the entry outright.

use crate::error::SimError;
use crate::id::{EventId, NodeId};
use crate::time::SimTime;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What a node should do when its event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum EventKind {
    /// A source creates its next batch.
    SourceFire,
    /// A processing station finishes its current item.
    Complete,
    /// An adjacent buffer changed; re-check inputs and outputs.
    Evaluate,
    /// Periodic retry for a station stuck on a full output.
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledEvent {
    pub id: EventId,
    pub time: SimTime,
    pub node: NodeId,
    pub kind: EventKind,
}

/// Key for ordering events in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EventKey {
    time: SimTime,
    sequence: u64,
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.time.cmp(&other.time) {
            Ordering::Equal => {}
            ord => return ord,
        }
        self.sequence.cmp(&other.sequence)
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Run limits
// ---------------------------------------------------------------------------

/// When [`Scheduler::run`] should stop short of draining the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLimit {
    /// Do not fire events later than this instant.
    pub until: Option<SimTime>,
    /// Fire at most this many events.
    pub max_events: Option<u64>,
}

impl RunLimit {
    pub fn until(time: SimTime) -> Self {
        Self {
            until: Some(time),
            max_events: None,
        }
    }

    pub fn events(n: u64) -> Self {
        Self {
            until: None,
            max_events: Some(n),
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }
}

/// Why a run returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The queue is empty.
    Drained,
    /// The next event lies beyond the time horizon.
    HorizonReached,
    /// The event budget is used up.
    EventLimit,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    now: SimTime,
    next_sequence: u64,
    queue: BTreeMap<EventKey, ScheduledEvent>,
    index: HashMap<EventId, EventKey>,
    dispatched: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulated time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Events still queued.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Events popped since creation.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn peek_time(&self) -> Option<SimTime> {
        self.queue.keys().next().map(|k| k.time)
    }

    /// Queue an event `delay` after now.
    pub fn schedule(
        &mut self,
        delay: SimTime,
        node: NodeId,
        kind: EventKind,
    ) -> Result<EventId, SimError> {
        if delay < SimTime::ZERO {
            return Err(SimError::InvalidDelay(delay));
        }
        let time = self.now.saturating_add(delay);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let id = EventId(sequence);
        let key = EventKey { time, sequence };
        self.queue.insert(
            key,
            ScheduledEvent {
                id,
                time,
                node,
                kind,
            },
        );
        self.index.insert(id, key);
        Ok(id)
    }

    /// Drop a queued event. Returns false if it already fired or never existed.
    pub fn cancel(&mut self, id: EventId) -> bool {
        match self.index.remove(&id) {
            Some(key) => self.queue.remove(&key).is_some(),
            None => false,
        }
    }

    /// Pop the earliest event and move the clock to its time.
    pub fn pop(&mut self) -> Option<ScheduledEvent> {
        let (key, event) = self.queue.pop_first()?;
        self.index.remove(&event.id);
        self.now = key.time;
        self.dispatched += 1;
        Some(event)
    }

    /// Pop the next event if `limit` allows it. `fired` is how many events
    /// this run has already dispatched.
    pub fn next_within(
        &mut self,
        limit: &RunLimit,
        fired: u64,
    ) -> Result<ScheduledEvent, RunOutcome> {
        if limit.max_events.is_some_and(|max| fired >= max) {
            return Err(RunOutcome::EventLimit);
        }
        let Some(next) = self.peek_time() else {
            return Err(RunOutcome::Drained);
        };
        if let Some(until) = limit.until {
            if next > until {
                self.now = self.now.max(until);
                return Err(RunOutcome::HorizonReached);
            }
        }
        self.pop().ok_or(RunOutcome::Drained)
    }

    /// Dispatch events until the queue drains or `limit` stops the run.
    /// The callback may schedule or cancel further events.
    pub fn run<E, F>(&mut self, limit: RunLimit, mut dispatch: F) -> Result<RunOutcome, E>
    where
        F: FnMut(&mut Scheduler, ScheduledEvent) -> Result<(), E>,
    {
        let mut fired = 0u64;
        loop {
            match self.next_within(&limit, fired) {
                Ok(event) => {
                    fired += 1;
                    dispatch(self, event)?;
                }
                Err(outcome) => return Ok(outcome),
            }
        }
    }

    /// Discard every queued event. The clock stays where it is.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.index.clear();
    }
}
