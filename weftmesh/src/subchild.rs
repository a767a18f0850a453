//! Second-tier attach: an MTD child accepting further children.
//!
//! A child holding unused locator prefix bits may answer Parent
//! Requests that carry the sub-child scan-mask flag. The mini attach
//! runs Parent Request, Parent Response, Link Request, Link Accept,
//! then the Child ID exchange, with the Child ID messages
//! forwarded up and down the tree: each hop picks the child whose
//! locator prefix covers the addressed locator and re-frames the
//! message toward it.

use alloc::vec::Vec;

use crate::codec::{self, Command, MleMessage, RxMle};
use crate::config::NodeConfig;
use crate::delayed::{ScheduleInfo, ScheduleType};
use crate::mle::{Mle, MleDeps, NeighborRef, RxClass};
use crate::time::{Duration, Timestamp};
use crate::traits::{Crypto, NetworkDataStore, Random, SettingsStore};
use crate::types::{
    Error, Event, ExtAddress, Ip6Address, LinkState, Rloc16, StateFilter, CHALLENGE_LEN,
    CHILD_ID_RESPONSE_TIMEOUT, DETACH_PENDING_RETX_FACTOR, DETACH_PENDING_RETX_PAD,
    MAX_RLOC_PREFIX_LEN, MIN_PEER_VERSION, PARENT_REQUEST_ROUTER_TIMEOUT,
    SUBCHILD_ATTACH_TIMEOUT_SECS, SUBCHILD_PARENT_RESPONSE_MAX_DELAY, US_PER_TEN_SYMBOLS,
};
use crate::wire::{self, TlvType, SCAN_MASK_SUB_CHILD};

/// True iff the high `via_prefix_len` bits of `dst` equal those of
/// `via`: `dst` lives in the subtree delegated to `via`.
pub fn is_sub_child_of(dst: Rloc16, via: Rloc16, via_prefix_len: u8) -> bool {
    if via_prefix_len == 0 {
        return true;
    }
    if via_prefix_len >= 16 {
        return dst == via;
    }
    (dst.0 ^ via.0) >> (16 - via_prefix_len as u16) == 0
}

impl<Cfg: NodeConfig> Mle<Cfg> {
    /// Whether this device may currently parent sub-children.
    pub fn has_sub_child_address_space(&self) -> bool {
        self.is_child() && self.rloc_prefix_len < MAX_RLOC_PREFIX_LEN
    }

    /// Estimated round trip of a message through our CSL link chain.
    pub fn csl_round_trip(&self) -> Duration {
        if !self.parent.peer.is_state_valid() {
            return Duration::ZERO;
        }
        let own_period_ms = self.csl_period as u64 * US_PER_TEN_SYMBOLS / 1000;
        Duration::from_millis(self.parent.csl_round_trip_us as u64 / 1000 + own_period_ms)
    }

    pub(crate) fn set_own_rloc_prefix_len(&mut self, prefix_len: u8) {
        self.rloc_prefix_len = prefix_len;
    }

    fn detach_pending_retx_deadline(&self, now: Timestamp) -> Timestamp {
        now + self.csl_round_trip() * DETACH_PENDING_RETX_FACTOR + DETACH_PENDING_RETX_PAD
    }

    // --- Mini attach, parent side --------------------------------------

    /// A Parent Request carrying the sub-child scan-mask flag.
    pub(crate) fn handle_parent_request_as_sub_parent<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        source: Ip6Address,
    ) -> Result<RxClass, Error> {
        if self.is_detached() || self.is_attaching() {
            return Err(Error::Drop);
        }
        if !self.has_sub_child_address_space() {
            return Err(Error::InvalidState);
        }

        let ext = source.ext_address();
        let version = wire::read_u16_tlv(&msg.tlvs, TlvType::Version)?;
        if version < MIN_PEER_VERSION {
            return Err(Error::Parse);
        }

        let scan_mask = wire::read_u8_tlv(&msg.tlvs, TlvType::ScanMask)?;
        if scan_mask & SCAN_MASK_SUB_CHILD == 0 {
            return Err(Error::Drop);
        }

        let csl_channel = match wire::read_channel_tlv(&msg.tlvs, TlvType::CslChannel) {
            Ok(channel) => channel,
            Err(Error::NotFound) => 0,
            Err(e) => return Err(e),
        };
        let mode = wire::read_u8_tlv(&msg.tlvs, TlvType::Mode)?;
        let challenge = wire::read_challenge(&msg.tlvs, TlvType::Challenge)?;

        let child_index = match self.child_table.index_of(ext) {
            Some(index) => index,
            None => {
                let (index, _) = self.child_table.new_child().ok_or(Error::NoBufs)?;
                index
            }
        };

        {
            let key_sequence = msg.key_sequence;
            let now = deps.now;
            let child = self.child_table.at_mut(child_index).ok_or(Error::NotFound)?;

            // A fully attached child may just be scanning for a better
            // parent; leave its state alone but still respond.
            if !child.peer.is_state_valid() {
                child.peer.init(ext, key_sequence, now);
                child.peer.state = LinkState::ParentRequest;
                child.peer.rloc16 = Rloc16::INVALID;
                child.peer.version = version;
                child.peer.csl.channel = csl_channel;
                child.peer.device_mode = crate::types::DeviceMode::from_bits(mode);
            }

            if !child.peer.matches(StateFilter::ValidOrRestoring) {
                child.peer.last_heard = now;
                // Transient attach timeout; replaced by the Timeout TLV
                // of the Child ID Request.
                child.timeout_secs = SUBCHILD_ATTACH_TIMEOUT_SECS;
                child.supervision_interval_secs = 0;
            }
        }

        // Jittered response so simultaneously scanning children spread
        // their windows.
        let mut challenge_bytes = [0u8; CHALLENGE_LEN];
        challenge_bytes[..challenge.len().min(CHALLENGE_LEN)]
            .copy_from_slice(&challenge[..challenge.len().min(CHALLENGE_LEN)]);
        let delay = deps.rng.random_delay(SUBCHILD_PARENT_RESPONSE_MAX_DELAY);
        self.delayed.schedule(
            ScheduleType::ParentResponse,
            source,
            delay,
            ScheduleInfo::ParentResponse {
                child_ext: ext,
                challenge: challenge_bytes,
            },
            deps.now,
        );

        Ok(RxClass::Peer)
    }

    /// Delayed-sender executor for the scheduled Parent Response.
    pub(crate) fn send_sub_child_parent_response<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        child_ext: ExtAddress,
        challenge: &[u8; CHALLENGE_LEN],
    ) {
        let Some(index) = self.child_table.index_of(child_ext) else {
            return;
        };

        let (child_challenge, csl_channel, link_margin) = {
            let child = match self.child_table.at_mut(index) {
                Some(c) => c,
                None => return,
            };
            let child_challenge = child.generate_challenge(deps.rng);
            (child_challenge, child.peer.csl.channel, child.peer.link.link_margin)
        };

        let leader_data = *self.leader_data();
        let mut message = MleMessage::new(Command::ParentResponse);
        message
            .append_source_address(self.rloc16)
            .append_mode(self.device_mode.bits())
            .append_link_frame_counter(self.link_frame_counter)
            .append_mle_frame_counter(self.mle_frame_counter)
            .append_response(challenge)
            .append_csl_accuracy(&self.own_csl_accuracy)
            .append_sub_child_link(self.rloc16, self.rloc_prefix_len, self.parent.hops_to_ftd)
            .append_challenge(&child_challenge)
            .append_link_margin(link_margin)
            .append_version()
            .append_leader_data(&leader_data);

        let destination = Ip6Address::link_local(&child_ext);
        let channel = (csl_channel != 0).then_some(csl_channel);
        self.finalize(deps.crypto, message, destination, channel);

        if let Some(child) = self.child_table.at_mut(index) {
            if child.peer.state == LinkState::ParentRequest {
                child.peer.state = LinkState::ParentResponse;
            }
        }
    }

    /// Link Request from an attaching sub-child: challenge echo plus
    /// frame-counter and CSL-accuracy exchange.
    pub(crate) fn handle_link_request_as_sub_parent<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        source: Ip6Address,
    ) -> Result<RxClass, Error> {
        if self.is_detached() || self.is_attaching() {
            return Err(Error::Drop);
        }
        if !self.has_sub_child_address_space() {
            return Err(Error::InvalidState);
        }

        let ext = source.ext_address();
        let index = self.child_table.index_of(ext).ok_or(Error::NotFound)?;

        let response = wire::read_challenge(&msg.tlvs, TlvType::Response)?;
        let link_frame_counter = wire::read_u32_tlv(&msg.tlvs, TlvType::LinkFrameCounter)?;
        let mle_frame_counter = match wire::read_u32_tlv(&msg.tlvs, TlvType::MleFrameCounter) {
            Ok(c) => c,
            Err(Error::NotFound) => link_frame_counter,
            Err(e) => return Err(e),
        };
        let csl_accuracy = wire::read_csl_accuracy(&msg.tlvs)?;

        let was_valid = {
            let child = self.child_table.at_mut(index).ok_or(Error::NotFound)?;
            if !matches!(
                child.peer.state,
                LinkState::Valid | LinkState::ParentResponse
            ) {
                return Err(Error::InvalidState);
            }
            match child.challenge() {
                Some(challenge) if response == challenge => {}
                _ => return Err(Error::Security),
            }
            child.peer.is_state_valid()
        };

        if !was_valid {
            // Drop leftovers from any previous attach attempt.
            self.pending_child_purges.push(index);
        }

        {
            let now = deps.now;
            let child = self.child_table.at_mut(index).ok_or(Error::NotFound)?;
            if child.peer.state == LinkState::ParentResponse {
                child.peer.state = LinkState::LinkAccept;
            }
            child.peer.csl.accuracy = csl_accuracy;
            child.peer.link_frame_counter = link_frame_counter;
            child.peer.mle_frame_counter = mle_frame_counter;
            child.timeout_secs = SUBCHILD_ATTACH_TIMEOUT_SECS;
            child.peer.last_heard = now;
        }

        self.csl_entries_dirty = true;

        let message = MleMessage::new(Command::LinkAccept);
        let csl_channel = self
            .child_table
            .at(index)
            .map(|c| c.peer.csl.channel)
            .unwrap_or(0);
        self.finalize(
            deps.crypto,
            message,
            source,
            (csl_channel != 0).then_some(csl_channel),
        );

        Ok(RxClass::Peer)
    }

    // --- Mini attach, child side ---------------------------------------

    /// Next step of the mini attach toward a second-tier parent, run
    /// from the attach timer. Returns the delay to the next step, or
    /// `None` when the regular attach flow should proceed.
    pub(crate) fn sub_child_attach_step<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) -> Option<Duration> {
        if !self.parent_candidate.parent.is_sub_child {
            return None;
        }

        match self.parent_candidate.parent.peer.state {
            LinkState::ParentResponse if self.has_acceptable_sub_child_candidate() => {
                self.send_sub_child_link_request(deps);
                Some(PARENT_REQUEST_ROUTER_TIMEOUT)
            }
            LinkState::LinkAccept => {
                if self.send_child_id_request_to_candidate(deps).is_ok() {
                    Some(CHILD_ID_RESPONSE_TIMEOUT)
                } else {
                    None
                }
            }
            // Link Request timed out without an accept; fall back to
            // the regular flow (which reattaches).
            _ => None,
        }
    }

    fn has_acceptable_sub_child_candidate(&self) -> bool {
        self.attach_state() == crate::types::AttachState::ParentRequest
            && self.parent_candidate.is_state_parent_response()
    }

    fn send_sub_child_link_request<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) {
        let rx_challenge = self.parent_candidate.rx_challenge.clone();
        let mut message = MleMessage::new(Command::LinkRequest);
        message
            .append_response(&rx_challenge)
            .append_link_frame_counter(self.link_frame_counter)
            .append_mle_frame_counter(self.mle_frame_counter)
            .append_csl_accuracy(&self.own_csl_accuracy);

        let destination = Ip6Address::link_local(&self.parent_candidate.parent.peer.ext_address);
        let channel = self.parent_candidate.parent.peer.csl.channel;
        self.finalize(
            deps.crypto,
            message,
            destination,
            (channel != 0).then_some(channel),
        );
        self.parent_candidate.parent.peer.state = LinkState::LinkRequest;
    }

    fn send_child_id_request_to_candidate<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) -> Result<(), Error> {
        // Restore the state the shared builder expects.
        self.parent_candidate.parent.peer.state = LinkState::ParentResponse;
        let result = self.send_child_id_request(deps);
        if result.is_ok() {
            self.set_attach_state(crate::types::AttachState::ChildIdRequest);
        }
        result
    }

    /// Link Accept from the second-tier parent candidate.
    pub(crate) fn handle_link_accept_as_sub_child<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        _msg: &RxMle,
        source: Ip6Address,
    ) -> Result<RxClass, Error> {
        let ext = source.ext_address();
        if self.parent_candidate.parent.peer.ext_address != ext {
            return Err(Error::NotFound);
        }
        if self.parent_candidate.parent.peer.state != LinkState::LinkRequest {
            return Err(Error::InvalidState);
        }

        // The Child ID Request goes out on the next attach-timer step.
        self.parent_candidate.parent.peer.state = LinkState::LinkAccept;
        let _ = deps;
        Ok(RxClass::Peer)
    }

    // --- Child ID forwarding -------------------------------------------

    /// Child ID Request seen by a device in the chain: validate when it
    /// concerns one of our attaching children, then relay upward.
    pub(crate) fn handle_child_id_request_forward<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        _source: Ip6Address,
    ) -> Result<RxClass, Error> {
        if !self.is_child() {
            return Err(Error::InvalidState);
        }

        let (addressed_rloc, child_ext) = codec::read_from_sub_child(&msg.tlvs)?;
        let child_ext = child_ext.ok_or(Error::Parse)?;

        if addressed_rloc == self.rloc16 {
            // The device is attaching over us; stage its entry.
            let timeout = wire::read_u32_tlv(&msg.tlvs, TlvType::Timeout)?;
            let now = deps.now;
            let child = self
                .child_table
                .find_by_ext_address(child_ext, StateFilter::AnyExceptInvalid)
                .ok_or(Error::InvalidState)?;

            if !child.peer.is_rx_on_when_idle() && !child.peer.is_csl_synchronized() {
                // Without CSL synchronization the response cannot be
                // delivered; abort rather than stage a dead entry.
                return Err(Error::InvalidState);
            }

            child.peer.state = LinkState::ChildIdRequest;
            child.timeout_secs = timeout;
            child.supervision_interval_secs = 0;
            child.peer.last_heard = now;
        }

        self.forward_up(deps, Command::ChildIdRequest, &msg.tlvs)?;
        Ok(RxClass::Peer)
    }

    /// Child ID Response concerning a second-tier device: finalize the
    /// child when addressed to us, otherwise relay down the prefix
    /// chain.
    pub(crate) fn handle_sub_child_id_response<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        addressed_rloc: Rloc16,
        child_ext: ExtAddress,
    ) -> Result<RxClass, Error> {
        if !self.is_child() {
            return Err(Error::InvalidState);
        }

        if addressed_rloc == self.rloc16 {
            let child_rloc = Rloc16(wire::read_u16_tlv(&msg.tlvs, TlvType::Address16)?);
            let prefix_len = wire::read_u8_tlv(&msg.tlvs, TlvType::RlocPrefixLength)?;

            let now = deps.now;
            let synchronized = {
                let child = self
                    .child_table
                    .find_by_ext_address(child_ext, StateFilter::SecurityReady)
                    .ok_or(Error::NotFound)?;
                child.peer.is_rx_on_when_idle() || child.peer.is_csl_synchronized()
            };

            if !synchronized {
                if let Some(index) = self.child_table.index_of(child_ext) {
                    self.remove_sub_child(deps, index);
                }
                return Err(Error::InvalidState);
            }

            {
                let child = self
                    .child_table
                    .find_by_ext_address(child_ext, StateFilter::SecurityReady)
                    .ok_or(Error::NotFound)?;
                child.peer.state = LinkState::Valid;
                child.peer.rloc16 = child_rloc;
                child.rloc_prefix_len = prefix_len;
                child.supervision_interval_secs =
                    (child.timeout_secs / 2).min(u16::MAX as u32) as u16;
                // The link may idle until the child's own keep-alive.
                child.peer.last_heard = now;
            }

            self.csl_entries_dirty = true;
            self.push_table_event(Event::ChildAdded { rloc16: child_rloc });

            // Last hop: hand the response to the attaching child.
            let destination = Ip6Address::link_local(&child_ext);
            let mut message = MleMessage::new(Command::ChildIdResponse);
            message.append_raw_tlvs(&msg.tlvs);
            self.finalize(deps.crypto, message, destination, None);
            return Ok(RxClass::Peer);
        }

        self.forward_down(deps, Command::ChildIdResponse, &msg.tlvs, addressed_rloc)?;
        Ok(RxClass::Peer)
    }

    // --- Child Update forwarding ---------------------------------------

    /// Intercept Child Update Requests that concern the second tier.
    /// `Ok(None)` hands the message back to the regular child handler.
    pub(crate) fn try_handle_sub_child_update_request<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        _neighbor: Option<NeighborRef>,
        _source: Ip6Address,
    ) -> Result<Option<RxClass>, Error> {
        let Ok((addressed_rloc, child_ext)) = codec::read_from_sub_child(&msg.tlvs) else {
            return Ok(None);
        };

        if addressed_rloc == self.rloc16 || child_ext == Some(self.ext_address) {
            // Addressed to us: a zero timeout tells us our parent is
            // dropping the link.
            if wire::read_u32_tlv(&msg.tlvs, TlvType::Timeout) == Ok(0) {
                let destination = Ip6Address::link_local(&self.parent.peer.ext_address);
                let mut message = MleMessage::new(Command::ChildUpdateResponse);
                message
                    .append_source_address(self.rloc16)
                    .append_mode(self.device_mode.bits())
                    .append_from_sub_child(addressed_rloc, Some(&self.ext_address))
                    .append_timeout(0);
                self.finalize(deps.crypto, message, destination, None);
                let _ = self.become_detached(deps);
                return Ok(Some(RxClass::Peer));
            }
            return Ok(None);
        }

        self.forward_down(deps, Command::ChildUpdateRequest, &msg.tlvs, addressed_rloc)?;
        Ok(Some(RxClass::Peer))
    }

    /// Intercept Child Update Responses from or toward the second tier.
    pub(crate) fn try_handle_sub_child_update_response<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        neighbor: Option<NeighborRef>,
        _source: Ip6Address,
    ) -> Result<Option<RxClass>, Error> {
        // A detach-pending child confirming its removal.
        if let Some(NeighborRef::Child(index)) = neighbor {
            let is_detach_pending = self
                .child_table
                .at(index)
                .map(|c| c.peer.state == LinkState::DetachPending)
                .unwrap_or(false);
            if is_detach_pending {
                if let Some(child) = self.child_table.at_mut(index) {
                    child.peer.state = LinkState::Invalid;
                }
                self.csl_entries_dirty = true;
                return Ok(Some(RxClass::Peer));
            }
        }

        if let Ok((addressed_rloc, _)) = codec::read_from_sub_child(&msg.tlvs) {
            if addressed_rloc != self.rloc16 {
                self.forward_down(deps, Command::ChildUpdateResponse, &msg.tlvs, addressed_rloc)?;
                return Ok(Some(RxClass::Peer));
            }
        }

        Ok(None)
    }

    // --- Removal / detach pending --------------------------------------

    /// Remove a sub-child: purge its traffic, send the zero-timeout
    /// update toward it, and hold the entry in `DetachPending` until a
    /// response or the retransmission budget expires.
    pub fn remove_sub_child<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        index: usize,
    ) {
        let Some(child) = self.child_table.at(index) else {
            return;
        };
        if child.peer.is_state_invalid() {
            return;
        }

        let was_tracked = child.peer.matches(StateFilter::ValidOrRestoring);
        let rloc16 = child.peer.rloc16;

        self.pending_child_purges.push(index);

        if was_tracked {
            self.csl_entries_dirty = true;
            self.push_table_event(Event::ChildRemoved { rloc16 });
        }

        if let Some(child) = self.child_table.at_mut(index) {
            child.peer.link.clear();
            child.peer.state = LinkState::DetachPending;
        }
        self.send_sub_child_detach(deps, index);
    }

    fn send_sub_child_detach<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        index: usize,
    ) {
        let Some(child) = self.child_table.at(index) else {
            return;
        };
        let child_ext = child.peer.ext_address;
        let child_rloc = child.peer.rloc16;

        let mut message = MleMessage::new(Command::ChildUpdateRequest);
        message
            .append_source_address(self.rloc16)
            .append_timeout(0)
            .append_from_sub_child(child_rloc, Some(&child_ext));

        let destination = Ip6Address::link_local(&child_ext);
        self.finalize(deps.crypto, message, destination, None);

        // `last_heard` doubles as the next detach retransmission time
        // while the entry is in `DetachPending`.
        let deadline = self.detach_pending_retx_deadline(deps.now);
        if let Some(child) = self.child_table.at_mut(index) {
            child.peer.last_heard = deadline;
        }
    }

    /// Periodic tick: retransmit detach messages whose deadline passed.
    pub(crate) fn handle_sub_child_tick<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) {
        let due: Vec<usize> = self
            .child_table
            .iterate(StateFilter::DetachPending)
            .filter(|(_, c)| c.peer.last_heard < deps.now)
            .map(|(i, _)| i)
            .collect();
        for index in due {
            self.send_sub_child_detach(deps, index);
        }
    }

    /// A valid sub-child needs its link refreshed (key-sequence jump).
    pub(crate) fn mark_sub_child_for_update(&mut self, index: usize, now: Timestamp) {
        if let Some(child) = self.child_table.at_mut(index) {
            if child.peer.is_state_valid() {
                // Nudge the detach-style retransmit machinery to ping
                // the child; it re-attaches if its state is stale.
                child.peer.last_heard = now;
            }
        }
    }

    // --- Forwarding primitives -----------------------------------------

    fn forward_up<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        command: Command,
        tlvs: &[u8],
    ) -> Result<(), Error> {
        if !self.parent.peer.matches(StateFilter::ValidOrRestoring) {
            return Err(Error::NoRoute);
        }
        let destination = Ip6Address::link_local(&self.parent.peer.ext_address);
        let mut message = MleMessage::new(command);
        message.append_raw_tlvs(tlvs);
        self.finalize(deps.crypto, message, destination, None);
        Ok(())
    }

    fn forward_down<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        command: Command,
        tlvs: &[u8],
        dest_rloc: Rloc16,
    ) -> Result<(), Error> {
        let next_hop = self
            .child_table
            .iterate(StateFilter::Valid)
            .find(|(_, c)| is_sub_child_of(dest_rloc, c.peer.rloc16, c.rloc_prefix_len))
            .map(|(_, c)| c.peer.ext_address)
            .ok_or(Error::NoRoute)?;

        #[cfg(feature = "debug")]
        self.emit_debug(crate::debug::DebugEvent::SubChildForwarded {
            dest_rloc16: dest_rloc,
            next_hop,
        });

        let destination = Ip6Address::link_local(&next_hop);
        let mut message = MleMessage::new(command);
        message.append_raw_tlvs(tlvs);
        self.finalize(deps.crypto, message, destination, None);
        Ok(())
    }

    fn push_table_event(&mut self, event: Event) {
        // Routed through the shared pending-event queue.
        self.push_event(event);
    }
}
