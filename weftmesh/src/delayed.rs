//! Timed outbound message scheduling.
//!
//! Responses to received MLE messages are never sent synchronously:
//! they are recorded here with a send time and executed from the timer
//! tick, so response TLVs can be batched and due work interleaved.
//!
//! Records are held unordered; the next-fire time is the minimum
//! outstanding send time. Execution is pulled by the node via
//! [`DelayedSender::take_due`] and dispatched on the record variant.

use alloc::vec::Vec;

use crate::time::{Duration, Timestamp};
use crate::types::{ExtAddress, Ip6Address, Rloc16, CHALLENGE_LEN};

/// Message types the delayed sender can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleType {
    DataRequest,
    ChildUpdateRequestAsChild,
    ParentResponse,
    Advertisement,
    DataResponse,
    LinkRequest,
    LinkAccept,
    DiscoveryResponse,
}

impl ScheduleType {
    /// Whether a second `schedule` call with a matching record already
    /// outstanding is a no-op (vs. replacing the record).
    fn coalesces(self) -> bool {
        matches!(
            self,
            ScheduleType::DataRequest
                | ScheduleType::ChildUpdateRequestAsChild
                | ScheduleType::Advertisement
                | ScheduleType::LinkRequest
        )
    }
}

/// Variant payload carried by a schedule record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduleInfo {
    None,
    ParentResponse {
        child_ext: ExtAddress,
        challenge: [u8; CHALLENGE_LEN],
    },
    LinkAccept {
        child_ext: ExtAddress,
    },
    RouterRloc(Rloc16),
}

/// One pending delayed transmission.
#[derive(Clone, Debug)]
pub struct Schedule {
    pub send_time: Timestamp,
    pub destination: Ip6Address,
    pub schedule_type: ScheduleType,
    pub info: ScheduleInfo,
}

/// The delayed-sender queue.
#[derive(Default)]
pub struct DelayedSender {
    schedules: Vec<Schedule>,
    capacity: usize,
}

impl DelayedSender {
    pub fn new(capacity: usize) -> Self {
        DelayedSender {
            schedules: Vec::new(),
            capacity,
        }
    }

    /// Drop every record and quiesce.
    pub fn stop(&mut self) {
        self.schedules.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    /// Schedule `schedule_type` toward `destination` after `delay`.
    ///
    /// Types with coalescing semantics are a no-op when a matching
    /// record exists; the others replace any matching record. A full
    /// queue silently drops the request (retry tracks re-attempt).
    pub fn schedule(
        &mut self,
        schedule_type: ScheduleType,
        destination: Ip6Address,
        delay: Duration,
        info: ScheduleInfo,
        now: Timestamp,
    ) {
        if schedule_type.coalesces() {
            if self.has_matching(schedule_type, &destination) {
                return;
            }
        } else {
            self.remove_matching(schedule_type, &destination);
        }

        if self.schedules.len() >= self.capacity {
            return;
        }

        self.schedules.push(Schedule {
            send_time: now + delay,
            destination,
            schedule_type,
            info,
        });
    }

    /// Whether a record of `schedule_type` toward `destination` exists.
    pub fn has_matching(&self, schedule_type: ScheduleType, destination: &Ip6Address) -> bool {
        self.schedules
            .iter()
            .any(|s| s.schedule_type == schedule_type && s.destination == *destination)
    }

    /// Remove every record of `schedule_type` toward `destination`.
    pub fn remove_matching(&mut self, schedule_type: ScheduleType, destination: &Ip6Address) {
        self.schedules
            .retain(|s| !(s.schedule_type == schedule_type && s.destination == *destination));
    }

    /// The earliest outstanding send time.
    pub fn next_fire_time(&self) -> Option<Timestamp> {
        self.schedules.iter().map(|s| s.send_time).min()
    }

    /// Dequeue every record whose send time has passed.
    ///
    /// Order within a tick is unspecified; callers dispatch on
    /// `schedule_type` and `info`.
    pub fn take_due(&mut self, now: Timestamp) -> Vec<Schedule> {
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.schedules.len() {
            if self.schedules[i].send_time <= now {
                due.push(self.schedules.swap_remove(i));
            } else {
                i += 1;
            }
        }
        due
    }
}
