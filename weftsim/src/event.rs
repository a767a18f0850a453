//! Scheduled events and their ordering.

use std::cmp::Ordering;

use weftmesh::node::IngressDatagram;
use weftmesh::{ExtAddress, Timestamp};

/// Sequence number disambiguating events at equal times.
pub type SequenceNumber = u64;

/// Something the simulator will do at a point in time.
#[derive(Clone, Debug)]
pub enum Event {
    /// Deliver an MLE datagram to a node.
    Deliver {
        to: ExtAddress,
        datagram: IngressDatagram,
    },
    /// Run a node's timer handler.
    Timer { node: ExtAddress },
}

/// An event with its firing time and tie-breaking sequence number.
#[derive(Clone, Debug)]
pub struct ScheduledEvent {
    pub time: Timestamp,
    pub seq: SequenceNumber,
    pub event: Event,
}

// BinaryHeap is a max-heap; invert the ordering for earliest-first.
impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}
