//! Debug events for protocol tracing.
//!
//! Enabled in test builds. These events help trace protocol flow
//! during simulation and testing.

use crate::codec::Command;
use crate::time::Timestamp;
use crate::types::{
    AttachState, DeviceRole, Error, ExtAddress, Ip6Address, Rloc16,
};

/// Trait for receiving debug events from a node.
/// Implemented by test harnesses to collect/print events.
pub trait DebugEmitter: Send {
    /// Called when a debug event is emitted.
    fn emit(&mut self, event: DebugEvent);
}

/// Debug events emitted by the node for protocol tracing.
#[derive(Debug, Clone)]
pub enum DebugEvent {
    /// An MLE message was received and passed security checks.
    MessageReceived {
        command: Command,
        from: Ip6Address,
        key_sequence: u32,
        frame_counter: u32,
    },
    /// An incoming MLE message was discarded.
    MessageDropped { error: Error, data_len: usize },
    /// An MLE message was handed to the transmit path.
    MessageSent { command: Command, to: Ip6Address },
    /// A message execution was deferred through the delayed sender.
    MessageDelayed { command: Command, to: Ip6Address },
    /// The attach state machine moved.
    AttachStateChanged {
        timestamp: Timestamp,
        old: AttachState,
        new: AttachState,
    },
    /// The device role moved.
    RoleChanged {
        timestamp: Timestamp,
        old: DeviceRole,
        new: DeviceRole,
    },
    /// A larger key sequence was adopted.
    KeySequenceAdopted { key_sequence: u32 },
    /// Link re-establishment with a neighbor was triggered.
    LinkReestablish { rloc16: Rloc16 },
    /// A parent candidate was recorded or replaced.
    ParentCandidateRanked {
        rloc16: Rloc16,
        link_margin: u8,
        accepted: bool,
    },
    /// A Child Update / Data Request retry fired.
    RetryFired { child_update_attempts: u8, data_request_attempts: u8 },
    /// A CSL transmission window was scheduled.
    CslTxScheduled {
        rloc16: Rloc16,
        request_delay_us: u64,
    },
    /// A CSL peer fell out of synchronization.
    CslDesynchronized { rloc16: Rloc16 },
    /// A child entered or left the table.
    ChildTableChanged { ext: ExtAddress, added: bool },
    /// A message was forwarded toward a second-tier child or parent.
    SubChildForwarded { dest_rloc16: Rloc16, next_hop: ExtAddress },
}

#[cfg(any(test, feature = "std"))]
pub mod emitters {
    //! Ready-made emitters for tests and simulation.

    use super::*;
    use alloc::vec::Vec;

    /// Emitter that collects events into a vector.
    #[derive(Default)]
    pub struct VecEmitter {
        pub events: Vec<DebugEvent>,
    }

    impl DebugEmitter for VecEmitter {
        fn emit(&mut self, event: DebugEvent) {
            self.events.push(event);
        }
    }

    /// Emitter that drops everything.
    #[derive(Default)]
    pub struct NullEmitter;

    impl DebugEmitter for NullEmitter {
        fn emit(&mut self, _event: DebugEvent) {}
    }
}
