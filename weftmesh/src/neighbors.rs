//! Neighbor and child tables: typed storage of peers and per-link state.
//!
//! A `Peer` is any discovered device on the link. A `Child` extends a
//! peer with attach state and registered addresses; `Parent` with the
//! fields needed for upward routing and CSL timing. The `ChildTable`
//! stores children in fixed slots whose index doubles as the child's
//! bit position in send-queue child masks.

use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::config::NodeConfig;
use crate::queue::MessageId;
use crate::time::{Timestamp, TimestampUs};
use crate::types::{
    CslAccuracy, DeviceMode, ExtAddress, Ip6Address, LeaderData, LinkQuality, LinkState, Rloc16,
    StateFilter, CHALLENGE_LEN, MAX_REQUEST_TLVS,
};

/// Radio link statistics for a peer.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinkInfo {
    /// Exponentially averaged RSS in dBm; `None` until the first frame.
    pub average_rss: Option<i8>,
    /// Link margin of the last received frame, dB.
    pub link_margin: u8,
    pub quality_in: LinkQuality,
    pub quality_out: LinkQuality,
}

impl LinkInfo {
    /// Fold a received frame's RSS into the average and update margin.
    pub fn update_on_rx(&mut self, rss: i8, noise_floor: i8) {
        self.average_rss = Some(match self.average_rss {
            None => rss,
            // 1/8 weight to the new sample.
            Some(avg) => ((avg as i16 * 7 + rss as i16) / 8) as i8,
        });
        self.link_margin = (rss as i16 - noise_floor as i16).clamp(0, u8::MAX as i16) as u8;
        self.quality_in = LinkQuality::from_link_margin(self.link_margin);
    }

    pub fn clear(&mut self) {
        *self = LinkInfo::default();
    }
}

/// Per-peer CSL synchronization state.
#[derive(Clone, Copy, Debug)]
pub struct CslPeerState {
    /// CSL period in ten-symbol units; zero while unsynchronized.
    pub period: u16,
    /// CSL channel; zero means the PAN channel.
    pub channel: u8,
    /// Phase offset in ten-symbol units, relative to `last_rx_timestamp`.
    pub phase: u16,
    /// Peer-requested CSL timeout, seconds.
    pub timeout_secs: u32,
    pub synchronized: bool,
    /// Radio timestamp anchoring the phase.
    pub last_rx_timestamp: TimestampUs,
    /// Last time the peer provably heard us (for window growth).
    pub last_sync_timestamp: TimestampUs,
    pub accuracy: CslAccuracy,
    /// Consecutive failed CSL-triggered transmissions.
    pub tx_attempts: u8,
}

impl Default for CslPeerState {
    fn default() -> Self {
        CslPeerState {
            period: 0,
            channel: 0,
            phase: 0,
            timeout_secs: 0,
            synchronized: false,
            last_rx_timestamp: TimestampUs::ZERO,
            last_sync_timestamp: TimestampUs::ZERO,
            accuracy: CslAccuracy::default(),
            tx_attempts: 0,
        }
    }
}

/// Per-peer indirect transmission state.
///
/// `queued_count` mirrors the number of send-queue messages whose child
/// mask includes this peer; the indirect sender is its only writer.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndirectState {
    /// Message currently being delivered, if any.
    pub message: Option<MessageId>,
    /// Next fragment offset within the current message (< 2^14).
    pub fragment_offset: u16,
    pub queued_count: u16,
    /// Delivery status of the current message across its fragments.
    pub tx_success: bool,
    pub use_short_address: bool,
    pub source_match_pending: bool,
    pub waiting_for_message_update: bool,
    /// Consecutive failed poll-triggered transmissions.
    pub tx_attempts: u8,
    // Retained header fields for retransmission continuity.
    pub data_sequence_number: u8,
    pub frame_counter: u32,
    pub key_id: u8,
}

/// A discovered device on the link.
#[derive(Clone, Debug)]
pub struct Peer {
    pub ext_address: ExtAddress,
    pub rloc16: Rloc16,
    pub state: LinkState,
    pub last_heard: Timestamp,
    pub link_frame_counter: u32,
    pub mle_frame_counter: u32,
    pub key_sequence: u32,
    pub version: u16,
    pub device_mode: DeviceMode,
    pub link: LinkInfo,
    pub csl: CslPeerState,
    pub indirect: IndirectState,
}

impl Default for Peer {
    fn default() -> Self {
        Peer {
            ext_address: ExtAddress::default(),
            rloc16: Rloc16::INVALID,
            state: LinkState::Invalid,
            last_heard: Timestamp::ZERO,
            link_frame_counter: 0,
            mle_frame_counter: 0,
            key_sequence: 0,
            version: 0,
            device_mode: DeviceMode::default(),
            link: LinkInfo::default(),
            csl: CslPeerState::default(),
            indirect: IndirectState::default(),
        }
    }
}

impl Peer {
    /// Initialize a fresh entry for `ext_address` heard at `now`.
    pub fn init(&mut self, ext_address: ExtAddress, key_sequence: u32, now: Timestamp) {
        *self = Peer::default();
        self.ext_address = ext_address;
        self.key_sequence = key_sequence;
        self.last_heard = now;
    }

    pub fn is_state_valid(&self) -> bool {
        self.state == LinkState::Valid
    }

    pub fn is_state_invalid(&self) -> bool {
        self.state == LinkState::Invalid
    }

    pub fn matches(&self, filter: StateFilter) -> bool {
        filter.matches(self.state)
    }

    pub fn is_rx_on_when_idle(&self) -> bool {
        self.device_mode.rx_on_when_idle()
    }

    pub fn is_csl_synchronized(&self) -> bool {
        self.csl.synchronized && self.csl.period > 0
    }

    /// Adopt a newer key sequence, resetting link counters.
    pub fn adopt_key_sequence(&mut self, key_sequence: u32) {
        self.key_sequence = key_sequence;
        self.link_frame_counter = 0;
    }

    /// Reset both retransmission attempt counters.
    pub fn reset_tx_attempts(&mut self) {
        self.indirect.tx_attempts = 0;
        self.csl.tx_attempts = 0;
    }
}

/// Bounded list of TLV types a child asked for during attach.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestTlvs {
    types: [u8; MAX_REQUEST_TLVS],
    len: u8,
}

impl RequestTlvs {
    pub fn push(&mut self, tlv_type: u8) {
        if (self.len as usize) < MAX_REQUEST_TLVS && !self.contains(tlv_type) {
            self.types[self.len as usize] = tlv_type;
            self.len += 1;
        }
    }

    pub fn contains(&self, tlv_type: u8) -> bool {
        self.types[..self.len as usize].contains(&tlv_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.types[..self.len as usize].iter().copied()
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Attach-phase storage of a child entry.
///
/// The challenge only matters while the child is attaching and the
/// requested-TLV list only afterwards, so they share a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildAuxState {
    Attaching { challenge: [u8; CHALLENGE_LEN] },
    Attached { request_tlvs: RequestTlvs },
}

impl Default for ChildAuxState {
    fn default() -> Self {
        ChildAuxState::Attaching {
            challenge: [0; CHALLENGE_LEN],
        }
    }
}

/// A peer attached (or attaching) as our child.
#[derive(Clone, Debug, Default)]
pub struct Child {
    pub peer: Peer,
    /// Desired keep-alive timeout reported by the child, seconds.
    pub timeout_secs: u32,
    pub supervision_interval_secs: u16,
    /// Registered IPv6 addresses. Never contains the mesh-local EID.
    pub addresses: Vec<Ip6Address>,
    pub aux: ChildAuxState,
    /// Length of the RLOC prefix delegated to this child's own subtree.
    pub rloc_prefix_len: u8,
}

impl Child {
    /// Issue a fresh attach challenge, entering the attaching aux state.
    pub fn generate_challenge<R: crate::traits::Random>(&mut self, rng: &mut R) -> [u8; CHALLENGE_LEN] {
        let mut challenge = [0u8; CHALLENGE_LEN];
        rng.fill_bytes(&mut challenge);
        self.aux = ChildAuxState::Attaching { challenge };
        challenge
    }

    /// Current attach challenge, if attaching.
    pub fn challenge(&self) -> Option<&[u8; CHALLENGE_LEN]> {
        match &self.aux {
            ChildAuxState::Attaching { challenge } => Some(challenge),
            ChildAuxState::Attached { .. } => None,
        }
    }

    /// Record the requested-TLV list, entering the attached aux state.
    pub fn set_request_tlvs(&mut self, request_tlvs: RequestTlvs) {
        self.aux = ChildAuxState::Attached { request_tlvs };
    }

    /// Register an address; `false` when the bounded list is full.
    pub fn register_address(&mut self, addr: Ip6Address, max: usize) -> bool {
        if self.addresses.contains(&addr) {
            return true;
        }
        if self.addresses.len() >= max {
            return false;
        }
        self.addresses.push(addr);
        true
    }

    pub fn clear(&mut self) {
        *self = Child::default();
    }
}

/// The device's parent (or parent candidate) in the mesh.
#[derive(Clone, Debug, Default)]
pub struct Parent {
    pub peer: Peer,
    pub leader_cost: u8,
    /// Estimated CSL round trip to this parent, microseconds.
    pub csl_round_trip_us: u32,
    /// Whether the parent is itself a second-tier (sub-child) parent.
    pub is_sub_child: bool,
    /// Hop count up to the nearest full-device parent.
    pub hops_to_ftd: u8,
}

impl Parent {
    pub fn clear(&mut self) {
        *self = Parent::default();
    }
}

/// Parent candidate: a parent plus the ranking data from its response.
#[derive(Clone, Debug, Default)]
pub struct ParentCandidate {
    pub parent: Parent,
    /// Challenge received in the Parent Response, echoed in the Child
    /// ID Request.
    pub rx_challenge: Vec<u8>,
    pub priority: i8,
    pub link_quality_3: u8,
    pub link_quality_2: u8,
    pub link_quality_1: u8,
    pub sed_buffer_size: u16,
    pub sed_datagram_count: u8,
    pub leader_data: LeaderData,
    pub is_singleton: bool,
    /// Two-way link margin used for ranking.
    pub link_margin: u8,
}

impl ParentCandidate {
    pub fn clear(&mut self) {
        *self = ParentCandidate::default();
    }

    pub fn is_state_parent_response(&self) -> bool {
        self.parent.peer.state == LinkState::ParentResponse
    }

    /// Two-way link quality class for candidate comparison.
    pub fn two_way_link_quality(&self) -> LinkQuality {
        LinkQuality::from_link_margin(self.link_margin)
    }
}

/// Table events surfaced through the Notifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableEvent {
    ChildAdded,
    ChildRemoved,
    RouterAdded,
    RouterRemoved,
}

/// Fixed-slot child table. Slot index is the child index used in
/// send-queue child masks.
pub struct ChildTable<Cfg> {
    slots: Vec<Child>,
    _config: PhantomData<Cfg>,
}

impl<Cfg: NodeConfig> Default for ChildTable<Cfg> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Cfg: NodeConfig> ChildTable<Cfg> {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(Cfg::MAX_CHILDREN);
        slots.resize_with(Cfg::MAX_CHILDREN, Child::default);
        ChildTable {
            slots,
            _config: PhantomData,
        }
    }

    /// Capacity of the table.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot, reset to defaults. `None` when the table is
    /// full (callers map this to `NoBufs`).
    pub fn new_child(&mut self) -> Option<(usize, &mut Child)> {
        let index = self
            .slots
            .iter()
            .position(|c| c.peer.is_state_invalid())?;
        self.slots[index].clear();
        Some((index, &mut self.slots[index]))
    }

    /// Find a child by extended address under a state filter.
    pub fn find_by_ext_address(
        &mut self,
        ext: ExtAddress,
        filter: StateFilter,
    ) -> Option<&mut Child> {
        self.slots
            .iter_mut()
            .find(|c| c.peer.ext_address == ext && c.peer.matches(filter))
    }

    /// Find a child by short address under a state filter.
    pub fn find_by_rloc16(&mut self, rloc16: Rloc16, filter: StateFilter) -> Option<&mut Child> {
        self.slots
            .iter_mut()
            .find(|c| c.peer.rloc16 == rloc16 && c.peer.matches(filter))
    }

    /// Index of the child holding `ext`, regardless of state.
    pub fn index_of(&self, ext: ExtAddress) -> Option<usize> {
        self.slots
            .iter()
            .position(|c| !c.peer.is_state_invalid() && c.peer.ext_address == ext)
    }

    pub fn at(&self, index: usize) -> Option<&Child> {
        self.slots.get(index)
    }

    pub fn at_mut(&mut self, index: usize) -> Option<&mut Child> {
        self.slots.get_mut(index)
    }

    /// Iterate children matching a state filter, with indices.
    pub fn iterate(&self, filter: StateFilter) -> impl Iterator<Item = (usize, &Child)> {
        self.slots
            .iter()
            .enumerate()
            .filter(move |(_, c)| c.peer.matches(filter))
    }

    /// Mutable iteration under a state filter, with indices.
    pub fn iterate_mut(
        &mut self,
        filter: StateFilter,
    ) -> impl Iterator<Item = (usize, &mut Child)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter(move |(_, c)| c.peer.matches(filter))
    }

    /// Number of children matching a filter.
    pub fn count(&self, filter: StateFilter) -> usize {
        self.iterate(filter).count()
    }

    /// Whether no free slot remains.
    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|c| !c.peer.is_state_invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultConfig;
    use crate::traits::test_impls::MockRandom;

    fn ext(n: u8) -> ExtAddress {
        ExtAddress([n, 0, 0, 0, 0, 0, 0, n])
    }

    #[test]
    fn test_new_child_and_find() {
        let mut table = ChildTable::<DefaultConfig>::new();

        let (index, child) = table.new_child().unwrap();
        child.peer.init(ext(1), 0, Timestamp::ZERO);
        child.peer.state = LinkState::ParentRequest;
        assert_eq!(index, 0);

        assert!(table
            .find_by_ext_address(ext(1), StateFilter::AnyExceptInvalid)
            .is_some());
        assert!(table
            .find_by_ext_address(ext(1), StateFilter::Valid)
            .is_none());
        assert!(table
            .find_by_ext_address(ext(2), StateFilter::AnyExceptInvalid)
            .is_none());
        assert_eq!(table.index_of(ext(1)), Some(0));
    }

    #[test]
    fn test_table_full_returns_none() {
        let mut table = ChildTable::<DefaultConfig>::new();
        for i in 0..table.capacity() {
            let (_, child) = table.new_child().unwrap();
            child.peer.init(ext(i as u8 + 1), 0, Timestamp::ZERO);
            child.peer.state = LinkState::Valid;
            child.peer.rloc16 = Rloc16(0x6c01 + i as u16);
            child.timeout_secs = 240;
        }
        assert!(table.is_full());
        assert!(table.new_child().is_none());
    }

    #[test]
    fn test_one_child_per_ext_address() {
        let mut table = ChildTable::<DefaultConfig>::new();
        let (_, child) = table.new_child().unwrap();
        child.peer.init(ext(7), 0, Timestamp::ZERO);
        child.peer.state = LinkState::Valid;

        // Re-attach finds the same entry instead of claiming a new one.
        assert_eq!(table.index_of(ext(7)), Some(0));
        let found = table
            .find_by_ext_address(ext(7), StateFilter::AnyExceptInvalid)
            .unwrap();
        found.peer.state = LinkState::ChildIdRequest;
        assert_eq!(table.count(StateFilter::AnyExceptInvalid), 1);
    }

    #[test]
    fn test_iterate_filters() {
        let mut table = ChildTable::<DefaultConfig>::new();
        for (i, state) in [LinkState::Valid, LinkState::Restored, LinkState::ParentRequest]
            .iter()
            .enumerate()
        {
            let (_, child) = table.new_child().unwrap();
            child.peer.init(ext(i as u8 + 1), 0, Timestamp::ZERO);
            child.peer.state = *state;
        }

        assert_eq!(table.count(StateFilter::Valid), 1);
        assert_eq!(table.count(StateFilter::ValidOrRestoring), 2);
        assert_eq!(table.count(StateFilter::AnyExceptInvalid), 3);
        assert_eq!(table.count(StateFilter::AnyExceptValidOrRestoring), 1);
    }

    #[test]
    fn test_child_aux_state_transitions() {
        let mut child = Child::default();
        let mut rng = MockRandom::new();

        let challenge = child.generate_challenge(&mut rng);
        assert_eq!(child.challenge(), Some(&challenge));

        let mut tlvs = RequestTlvs::default();
        tlvs.push(10);
        tlvs.push(12);
        tlvs.push(10); // duplicate ignored
        child.set_request_tlvs(tlvs);
        assert_eq!(child.challenge(), None);
        match child.aux {
            ChildAuxState::Attached { request_tlvs } => {
                assert_eq!(request_tlvs.len(), 2);
                assert!(request_tlvs.contains(12));
            }
            _ => panic!("expected attached aux state"),
        }
    }

    #[test]
    fn test_request_tlvs_bounded() {
        let mut tlvs = RequestTlvs::default();
        for t in 0..10u8 {
            tlvs.push(t);
        }
        assert_eq!(tlvs.len(), MAX_REQUEST_TLVS);
    }

    #[test]
    fn test_register_address_bounds() {
        let mut child = Child::default();
        let max = 2;
        assert!(child.register_address(Ip6Address([1; 16]), max));
        assert!(child.register_address(Ip6Address([1; 16]), max)); // dup ok
        assert!(child.register_address(Ip6Address([2; 16]), max));
        assert!(!child.register_address(Ip6Address([3; 16]), max));
        assert_eq!(child.addresses.len(), 2);
    }

    #[test]
    fn test_link_info_averaging() {
        let mut link = LinkInfo::default();
        link.update_on_rx(-60, -100);
        assert_eq!(link.average_rss, Some(-60));
        assert_eq!(link.link_margin, 40);
        assert_eq!(link.quality_in, LinkQuality::Three);

        link.update_on_rx(-90, -100);
        // Weighted average moves slowly toward the new sample.
        assert!(link.average_rss.unwrap() < -60);
        assert!(link.average_rss.unwrap() > -90);
    }

    #[test]
    fn test_peer_key_sequence_adoption_resets_counters() {
        let mut peer = Peer::default();
        peer.link_frame_counter = 55;
        peer.adopt_key_sequence(9);
        assert_eq!(peer.key_sequence, 9);
        assert_eq!(peer.link_frame_counter, 0);
    }
}
