//! Mesh link establishment core state machine.
//!
//! Owns the device role, the attach cycle, the parent and parent
//! candidate, key-sequence adoption, and the graceful-detach flow.
//! Incoming UDP datagrams enter through [`Mle::handle_udp`]; timers
//! through [`Mle::handle_timer`]. Outgoing messages are collected in a
//! transmit list the node drains after every handler, keeping all
//! radio interaction outside this module.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::codec::{self, Command, MleMessage, RxMle};
use crate::config::NodeConfig;
use crate::delayed::{DelayedSender, ScheduleInfo, ScheduleType};
use crate::neighbors::{ChildTable, Parent, ParentCandidate, Peer};
use crate::retx::{RetxAction, RetxTracker};
use crate::time::{Duration, Timestamp};
use crate::traits::{Crypto, NetworkDataStore, Random, SettingsStore};
use crate::types::{
    AttachMode, AttachState, Counters, CslAccuracy, DeviceMode, DeviceRole, Error, Event,
    ExtAddress, Ip6Address, LeaderData, LinkQuality, LinkState, ReattachState, Rloc16,
    StateFilter, ANNOUNCE_PROCESS_TIMEOUT, ANNOUNCE_TIMEOUT, ATTACH_BACKOFF_JITTER,
    ATTACH_BACKOFF_MAX_INTERVAL, ATTACH_BACKOFF_MIN_INTERVAL, ATTACH_BACKOFF_RESET_DELAY,
    ATTACH_START_JITTER, CHALLENGE_LEN, CHILD_ID_RESPONSE_TIMEOUT, DETACH_GRACEFULLY_TIMEOUT,
    FIRST_CYCLE_PARENT_REQUESTS_TO_ROUTERS, FIRST_CYCLE_TOTAL_PARENT_REQUESTS, MAX_RESPONSE_DELAY,
    MIN_ANNOUNCE_DELAY, MIN_RESPONSE_DELAY, MLE_HOP_LIMIT,
    NEXT_CYCLE_PARENT_REQUESTS_TO_ROUTERS, NEXT_CYCLE_TOTAL_PARENT_REQUESTS,
    PARENT_REQUEST_REED_TIMEOUT, PARENT_REQUEST_ROUTER_TIMEOUT, US_PER_TEN_SYMBOLS,
};
use crate::wire::{
    self, AddressRegistrationEntry, Connectivity, TlvType, SCAN_MASK_END_DEVICE, SCAN_MASK_ROUTER,
    STATUS_ERROR,
};

/// Minimum own CSL period assumed when estimating a parent's CSL cost.
const CSL_MIN_PERIOD_US: u64 = 1000 * US_PER_TEN_SYMBOLS;
/// Default CSL timeout advertised to the parent, seconds.
pub const CSL_DEFAULT_TIMEOUT_SECS: u32 = 100;

/// External collaborators an MLE operation may need.
pub struct MleDeps<'a, C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore> {
    pub crypto: &'a C,
    pub rng: &'a mut R,
    pub net_data: &'a mut N,
    pub settings: &'a mut S,
    pub now: Timestamp,
}

/// A finalized MLE message awaiting transmission.
#[derive(Clone, Debug)]
pub struct MleTransmit {
    pub destination: Ip6Address,
    pub command: Command,
    pub bytes: Vec<u8>,
    /// Transmit on this channel instead of the PAN channel.
    pub channel: Option<u8>,
}

/// Which table entry an incoming message maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeighborRef {
    Parent,
    ParentCandidate,
    Child(usize),
}

/// Security classification of a received message, driving key-sequence
/// adoption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RxClass {
    #[default]
    Unknown,
    Peer,
    Authoritative,
}

/// Child Update Request flavors toward the parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildUpdateMode {
    Normal,
    /// Include a fresh challenge (link re-establishment).
    AppendChallenge,
    /// Zero timeout: graceful detach.
    ZeroTimeout,
    /// Restoring the previous child role after reset; not retx-tracked.
    RestoreChildRole,
}

/// Start flavors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMode {
    Normal,
    AnnounceAttach,
}

/// Stop flavors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopMode {
    KeepDatasets,
    UpdateDatasets,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
enum DetachState {
    #[default]
    Idle,
    Detaching,
}

#[derive(Default)]
struct Detacher {
    state: DetachState,
    deadline: Option<Timestamp>,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
enum AnnounceAttachState {
    #[default]
    Idle,
    /// A newer-timestamp announce was heard; attach after the process
    /// timeout unless something better shows up.
    ToAnnounceAttach,
    /// Attaching on the announced channel/PAN.
    AnnounceAttaching,
}

#[derive(Default)]
struct AnnounceHandler {
    state: AnnounceAttachState,
    alternate_channel: u8,
    alternate_pan_id: u16,
    alternate_timestamp: u64,
    process_deadline: Option<Timestamp>,
}

/// Type of Parent Request within an attach cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParentRequestType {
    ToRouters,
    ToRoutersAndReeds,
    ToSelectedRouter,
}

/// The MLE core.
pub struct Mle<Cfg: NodeConfig> {
    // Identity and configuration.
    pub ext_address: ExtAddress,
    pub device_mode: DeviceMode,
    pub timeout_secs: u32,
    pub rloc16: Rloc16,
    pub pan_channel: u8,
    pub pan_id: u16,
    /// Host-registered addresses echoed in address-registration TLVs.
    pub registered_addresses: Vec<AddressRegistrationEntry>,

    // Own CSL receiver parameters (advertised to the parent).
    pub csl_enabled: bool,
    pub csl_period: u16,
    pub csl_channel: u8,
    pub csl_timeout_secs: u32,

    /// Also solicit second-tier parents during the attach cycle.
    pub accept_sub_parent: bool,

    // Role and attach state.
    enabled: bool,
    role: DeviceRole,
    attach_state: AttachState,
    attach_mode: AttachMode,
    reattach_state: ReattachState,
    attach_counter: u16,
    parent_request_counter: u8,
    attach_timer: Option<Timestamp>,
    received_response_from_parent: bool,
    parent_request_challenge: [u8; CHALLENGE_LEN],
    retrieve_new_network_data: bool,
    previous_parent_rloc: Rloc16,

    // Announce cycling while orphaned.
    announce: AnnounceHandler,
    announce_channel: Option<u8>,
    announce_delay: Duration,

    // Security.
    pub key_sequence: u32,
    pub mle_frame_counter: u32,
    pub link_frame_counter: u32,

    // Partition.
    leader_data: LeaderData,

    // Tables.
    pub parent: Parent,
    pub parent_candidate: ParentCandidate,
    pub child_table: ChildTable<Cfg>,

    // Timed machinery.
    pub delayed: DelayedSender,
    pub retx: RetxTracker,
    detacher: Detacher,

    // Outputs drained by the node.
    pending_tx: Vec<MleTransmit>,
    pending_events: Vec<Event>,
    #[cfg(feature = "debug")]
    debug_events: Vec<crate::debug::DebugEvent>,

    pub counters: Counters,

    /// Length of the locator prefix delegated to this device. Values
    /// below `MAX_RLOC_PREFIX_LEN` leave address space for parenting
    /// second-tier children.
    pub rloc_prefix_len: u8,
    /// Local CSL accuracy advertised in responses (set from the radio).
    pub own_csl_accuracy: CslAccuracy,
    /// Children whose queued indirect traffic must be purged; drained
    /// by the owner after every handler.
    pub pending_child_purges: Vec<usize>,
    /// The CSL peer set changed; the radio entry tables need a rewrite.
    pub csl_entries_dirty: bool,
}

impl<Cfg: NodeConfig> Mle<Cfg> {
    pub fn new(ext_address: ExtAddress) -> Self {
        Mle {
            ext_address,
            device_mode: DeviceMode::new(true, false, true),
            timeout_secs: 240,
            rloc16: Rloc16::INVALID,
            pan_channel: 11,
            pan_id: 0xffff,
            registered_addresses: Vec::new(),
            csl_enabled: false,
            csl_period: 0,
            csl_channel: 0,
            csl_timeout_secs: CSL_DEFAULT_TIMEOUT_SECS,
            accept_sub_parent: false,
            enabled: false,
            role: DeviceRole::Disabled,
            attach_state: AttachState::Idle,
            attach_mode: AttachMode::AnyPartition,
            reattach_state: ReattachState::Stop,
            attach_counter: 0,
            parent_request_counter: 0,
            attach_timer: None,
            received_response_from_parent: false,
            parent_request_challenge: [0; CHALLENGE_LEN],
            retrieve_new_network_data: false,
            previous_parent_rloc: Rloc16::INVALID,
            announce: AnnounceHandler::default(),
            announce_channel: None,
            announce_delay: MIN_ANNOUNCE_DELAY,
            key_sequence: 0,
            mle_frame_counter: 0,
            link_frame_counter: 0,
            leader_data: LeaderData::default(),
            parent: Parent::default(),
            parent_candidate: ParentCandidate::default(),
            child_table: ChildTable::new(),
            delayed: DelayedSender::new(Cfg::MAX_DELAYED_SCHEDULES),
            retx: RetxTracker::new(),
            detacher: Detacher::default(),
            pending_tx: Vec::new(),
            pending_events: Vec::new(),
            #[cfg(feature = "debug")]
            debug_events: Vec::new(),
            counters: Counters::default(),
            rloc_prefix_len: crate::types::MAX_RLOC_PREFIX_LEN,
            own_csl_accuracy: CslAccuracy::default(),
            pending_child_purges: Vec::new(),
            csl_entries_dirty: false,
        }
    }

    // --- Accessors -----------------------------------------------------

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn attach_state(&self) -> AttachState {
        self.attach_state
    }

    pub fn is_disabled(&self) -> bool {
        self.role == DeviceRole::Disabled
    }

    pub fn is_detached(&self) -> bool {
        self.role == DeviceRole::Detached
    }

    pub fn is_child(&self) -> bool {
        self.role == DeviceRole::Child
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.role, DeviceRole::Child | DeviceRole::Router | DeviceRole::Leader)
    }

    pub fn is_attaching(&self) -> bool {
        self.attach_state != AttachState::Idle
    }

    pub fn is_rx_on_when_idle(&self) -> bool {
        self.device_mode.rx_on_when_idle()
    }

    pub fn leader_data(&self) -> &LeaderData {
        &self.leader_data
    }

    /// Parent RLOC16 while attached.
    pub fn parent_rloc16(&self) -> Rloc16 {
        if self.parent.peer.is_state_valid() {
            self.parent.peer.rloc16
        } else {
            Rloc16::INVALID
        }
    }

    /// Parent info for the host: (rloc16, ext address, link quality in).
    pub fn parent_info(&self) -> Result<(Rloc16, ExtAddress, LinkQuality), Error> {
        if !self.parent.peer.is_state_valid() {
            return Err(Error::InvalidState);
        }
        Ok((
            self.parent.peer.rloc16,
            self.parent.peer.ext_address,
            self.parent.peer.link.quality_in,
        ))
    }

    /// Drain messages awaiting transmission.
    pub fn take_pending_tx(&mut self) -> Vec<MleTransmit> {
        core::mem::take(&mut self.pending_tx)
    }

    /// Drain events for the Notifier.
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        core::mem::take(&mut self.pending_events)
    }

    #[cfg(feature = "debug")]
    pub fn take_debug_events(&mut self) -> Vec<crate::debug::DebugEvent> {
        core::mem::take(&mut self.debug_events)
    }

    #[cfg(feature = "debug")]
    pub(crate) fn emit_debug(&mut self, event: crate::debug::DebugEvent) {
        self.debug_events.push(event);
    }

    pub(crate) fn push_event(&mut self, event: Event) {
        self.pending_events.push(event);
    }

    pub fn link_local_source(&self) -> Ip6Address {
        Ip6Address::link_local(&self.ext_address)
    }

    // --- Public operations ---------------------------------------------

    /// Bring up the MLE service (socket open, multicast subscription is
    /// the node's job). Idempotent errors per the public contract.
    pub fn enable(&mut self) -> Result<(), Error> {
        if self.enabled {
            return Err(Error::Already);
        }
        self.enabled = true;
        Ok(())
    }

    /// Tear down: every schedule, retry track, and the socket state is
    /// dropped so a subsequent `enable` starts clean.
    pub fn disable<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) -> Result<(), Error> {
        if !self.enabled {
            return Err(Error::Already);
        }
        self.stop(deps, StopMode::KeepDatasets);
        self.enabled = false;
        Ok(())
    }

    /// Start MLE operation and begin attaching.
    pub fn start<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        mode: StartMode,
    ) -> Result<(), Error> {
        if !self.enabled {
            return Err(Error::InvalidState);
        }
        if !self.is_disabled() {
            return Err(Error::Already);
        }

        self.set_state_detached(deps.now);
        self.attach_counter = 0;

        if mode == StartMode::Normal {
            self.reattach_state = if deps.net_data.active_timestamp().is_some() {
                ReattachState::Active
            } else {
                ReattachState::Stop
            };

            if self.try_restore_child_role(deps) {
                return Ok(());
            }
        }

        self.attach(AttachMode::AnyPartition, deps.rng, deps.now);
        Ok(())
    }

    /// Stop MLE operation.
    pub fn stop<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        mode: StopMode,
    ) {
        if mode == StopMode::UpdateDatasets {
            let _ = deps.net_data.restore_active();
            let _ = deps.net_data.restore_pending();
        }

        if !self.is_disabled() {
            self.delayed.stop();
            self.announce.state = AnnounceAttachState::Idle;
            self.announce.process_deadline = None;
            self.set_state_detached(deps.now);
            self.set_role(DeviceRole::Disabled, deps.now);
        }

        // Graceful detach completes exactly once, here.
        if self.detacher.state == DetachState::Detaching {
            self.detacher.state = DetachState::Idle;
            self.detacher.deadline = None;
            if let Some(callback) = self.detacher.callback.take() {
                callback();
            }
        }
    }

    /// Detach and restart the attach cycle.
    pub fn become_detached<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) -> Result<(), Error> {
        if self.is_disabled() {
            return Err(Error::InvalidState);
        }

        // Already detached and waiting to start an attach attempt.
        if self.is_detached() && self.attach_state == AttachState::Start {
            return Ok(());
        }

        if self.reattach_state == ReattachState::Stop {
            let _ = deps.net_data.restore_pending();
        }

        self.set_state_detached(deps.now);
        self.parent.peer.state = LinkState::Invalid;
        self.set_rloc16(Rloc16::INVALID);
        self.attach(AttachMode::AnyPartition, deps.rng, deps.now);
        Ok(())
    }

    /// Attach as a child of any available parent.
    pub fn become_child<R: Random>(&mut self, rng: &mut R, now: Timestamp) -> Result<(), Error> {
        if self.is_disabled() {
            return Err(Error::InvalidState);
        }
        if self.is_attaching() {
            return Err(Error::Busy);
        }
        self.attach(AttachMode::AnyPartition, rng, now);
        Ok(())
    }

    /// Look for a better parent while staying attached.
    pub fn search_for_better_parent<R: Random>(
        &mut self,
        rng: &mut R,
        now: Timestamp,
    ) -> Result<(), Error> {
        if !self.is_child() {
            return Err(Error::InvalidState);
        }
        if self.is_attaching() {
            return Err(Error::Busy);
        }
        self.attach(AttachMode::BetterParent, rng, now);
        Ok(())
    }

    /// Change the device mode; informs the parent when attached.
    pub fn set_device_mode<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        mode: DeviceMode,
    ) -> Result<(), Error> {
        if mode.bits() == self.device_mode.bits() {
            return Err(Error::Already);
        }
        self.device_mode = mode;

        match self.role {
            DeviceRole::Disabled => {}
            DeviceRole::Detached => {
                // Restart the attach with the new mode.
                self.attach_state = AttachState::Idle;
                self.attach(AttachMode::AnyPartition, deps.rng, deps.now);
            }
            _ => {
                self.send_child_update_request(deps, ChildUpdateMode::Normal);
            }
        }
        Ok(())
    }

    /// Update the keep-alive timeout; optionally inform the parent.
    pub fn set_timeout<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        timeout_secs: u32,
        notify_parent: bool,
    ) {
        if self.timeout_secs == timeout_secs {
            return;
        }
        self.timeout_secs = timeout_secs.max(1);
        if notify_parent && self.is_child() {
            self.send_child_update_request(deps, ChildUpdateMode::Normal);
        }
    }

    /// Gracefully detach: zero-timeout Child Update toward the parent,
    /// then stop. `callback` runs exactly once, on response or timeout.
    pub fn detach_gracefully<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Result<(), Error> {
        if self.detacher.state != DetachState::Idle {
            return Err(Error::Busy);
        }

        self.detacher.callback = Some(callback);
        self.detacher.state = DetachState::Detaching;

        let timeout = match self.role {
            DeviceRole::Child => {
                self.send_child_update_request(deps, ChildUpdateMode::ZeroTimeout);
                DETACH_GRACEFULLY_TIMEOUT
            }
            // Finish immediately (but still asynchronously) when there
            // is no parent to inform.
            _ => Duration::ZERO,
        };
        self.detacher.deadline = Some(deps.now + timeout);
        Ok(())
    }

    // --- Role / state plumbing -----------------------------------------

    fn set_role(&mut self, role: DeviceRole, _now: Timestamp) {
        if self.role == role {
            return;
        }
        #[cfg(feature = "debug")]
        self.emit_debug(crate::debug::DebugEvent::RoleChanged {
            timestamp: _now,
            old: self.role,
            new: role,
        });
        self.role = role;
        self.counters.role_changes += 1;
        self.push_event(Event::RoleChanged { role });
    }

    pub(crate) fn set_attach_state(&mut self, state: AttachState) {
        if self.attach_state == state {
            return;
        }
        self.attach_state = state;
    }

    fn set_rloc16(&mut self, rloc16: Rloc16) {
        self.rloc16 = rloc16;
    }

    pub(crate) fn set_state_detached(&mut self, now: Timestamp) {
        self.set_role(DeviceRole::Detached, now);
        self.set_attach_state(AttachState::Idle);
        self.attach_timer = None;
        let parent_ll = Ip6Address::link_local(&self.parent.peer.ext_address);
        self.delayed
            .remove_matching(ScheduleType::ChildUpdateRequestAsChild, &parent_ll);
        self.retx.stop();
    }

    fn set_state_child<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        rloc16: Rloc16,
    ) {
        self.set_rloc16(rloc16);
        self.set_role(DeviceRole::Child, deps.now);
        self.set_attach_state(AttachState::Idle);
        // Reset the backoff counter once the attachment proves stable.
        self.attach_timer = Some(deps.now + ATTACH_BACKOFF_RESET_DELAY);
        self.reattach_state = ReattachState::Stop;
        self.retx.on_role_change_to_child(
            self.timeout_secs,
            self.is_rx_on_when_idle(),
            deps.rng,
            deps.now,
        );

        if self.announce.state == AnnounceAttachState::AnnounceAttaching {
            self.announce.state = AnnounceAttachState::Idle;
        }

        if self.previous_parent_rloc != Rloc16::INVALID
            && self.previous_parent_rloc != self.parent.peer.rloc16
        {
            self.counters.parent_changes += 1;
        }
        self.previous_parent_rloc = self.parent.peer.rloc16;
        self.push_event(Event::ParentChanged {
            rloc16: self.parent.peer.rloc16,
        });

        self.store(deps);
    }

    // --- Persistence ---------------------------------------------------

    /// Persist role and parent for post-reset recovery.
    pub fn store<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) {
        if !self.is_attached() {
            return;
        }

        let network_info = crate::settings::NetworkInfo {
            role: self.role,
            device_mode: self.device_mode,
            rloc16: self.rloc16,
            key_sequence: self.key_sequence,
            // Stored ahead so a reboot can never reuse counters.
            mle_frame_counter: self.mle_frame_counter + 1000,
            ext_address: self.ext_address,
        };
        let parent_info = crate::settings::ParentInfo {
            ext_address: self.parent.peer.ext_address,
            version: self.parent.peer.version,
        };
        crate::settings::store(
            deps.settings,
            &network_info,
            self.is_child().then_some(&parent_info),
        );
    }

    /// Attempt a quick re-attach to the stored parent. Returns `true`
    /// when a restore exchange was started.
    fn try_restore_child_role<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) -> bool {
        let restored = crate::settings::restore(deps.settings);

        let Some(network_info) = restored.network_info else {
            return false;
        };
        if network_info.role != DeviceRole::Child || network_info.rloc16 == Rloc16::INVALID {
            return false;
        }
        let Some(parent_info) = restored.parent_info else {
            return false;
        };

        self.key_sequence = network_info.key_sequence;
        self.mle_frame_counter = network_info.mle_frame_counter;
        self.device_mode = network_info.device_mode;
        self.set_rloc16(network_info.rloc16);

        self.parent.clear();
        self.parent.peer.ext_address = parent_info.ext_address;
        self.parent.peer.version = parent_info.version;
        self.parent.peer.device_mode = DeviceMode::new(true, true, true);
        self.parent.peer.state = LinkState::Restored;
        self.previous_parent_rloc = self.parent.peer.rloc16;

        // Challenge the stored parent; the retry track recovers into a
        // full attach when it stays silent.
        self.send_child_update_request(deps, ChildUpdateMode::AppendChallenge);
        true
    }

    pub(crate) fn csl_retry_period(&self) -> Option<Duration> {
        (self.csl_enabled && self.csl_period > 0).then(|| {
            Duration::from_millis(self.csl_period as u64 * US_PER_TEN_SYMBOLS / 1000)
        })
    }

    // --- Attach cycle --------------------------------------------------

    pub(crate) fn attach<R: Random>(&mut self, mode: AttachMode, rng: &mut R, now: Timestamp) {
        if self.is_disabled() || self.is_attaching() {
            return;
        }

        if !self.is_detached() {
            self.attach_counter = 0;
        }

        self.parent_candidate.clear();
        self.set_attach_state(AttachState::Start);
        self.attach_mode = mode;
        self.attach_timer = Some(now + self.attach_start_delay(rng));

        if self.is_detached() {
            self.attach_counter = self.attach_counter.saturating_add(1);
            self.counters.attach_attempts += 1;
        }
    }

    fn attach_start_delay<R: Random>(&mut self, rng: &mut R) -> Duration {
        if !self.is_detached() {
            return Duration::from_millis(1);
        }

        let delay = if self.attach_counter == 0 {
            rng.random_delay(PARENT_REQUEST_ROUTER_TIMEOUT)
        } else {
            // Exponential backoff between attach attempt cycles.
            let exponent = (self.attach_counter - 1).min(20) as u32;
            let backoff = ATTACH_BACKOFF_MIN_INTERVAL
                .saturating_mul(1u64 << exponent)
                .min(ATTACH_BACKOFF_MAX_INTERVAL);
            rng.add_jitter(backoff, ATTACH_BACKOFF_JITTER)
        };

        delay.saturating_add(Duration::from_millis(rng.gen_range(0, ATTACH_START_JITTER.as_millis())))
    }

    /// Which Parent Request to send next, or `None` when the cycle has
    /// sent its full quota.
    fn determine_parent_request_type(&self) -> Option<ParentRequestType> {
        debug_assert_eq!(self.attach_state, AttachState::ParentRequest);

        if self.attach_mode == AttachMode::SelectedParent {
            return (self.parent_request_counter <= 1).then_some(ParentRequestType::ToSelectedRouter);
        }

        if self.attach_counter <= 1 && self.attach_mode != AttachMode::BetterParent {
            if self.parent_request_counter > FIRST_CYCLE_TOTAL_PARENT_REQUESTS {
                return None;
            }
            // During reattach to the same partition all requests go to
            // routers and REEDs alike.
            if self.attach_mode != AttachMode::SamePartition
                && self.parent_request_counter <= FIRST_CYCLE_PARENT_REQUESTS_TO_ROUTERS
            {
                return Some(ParentRequestType::ToRouters);
            }
        } else {
            if self.parent_request_counter > NEXT_CYCLE_TOTAL_PARENT_REQUESTS {
                return None;
            }
            if self.parent_request_counter <= NEXT_CYCLE_PARENT_REQUESTS_TO_ROUTERS {
                return Some(ParentRequestType::ToRouters);
            }
        }

        Some(ParentRequestType::ToRoutersAndReeds)
    }

    fn has_acceptable_parent_candidate(&self) -> bool {
        if !self.parent_candidate.is_state_parent_response() {
            return false;
        }

        match self.attach_state {
            AttachState::Announce => {
                if self.has_more_channels_to_announce() {
                    return false;
                }
            }
            AttachState::ParentRequest => {
                let Some(req_type) = self.determine_parent_request_type() else {
                    return false;
                };
                if req_type == ParentRequestType::ToRouters
                    && self.parent_candidate.two_way_link_quality() != LinkQuality::Three
                {
                    // Keep looking; the REED stage may surface a
                    // better-linked parent.
                    return false;
                }
            }
            _ => return false,
        }

        if self.is_child() && self.attach_mode != AttachMode::BetterPartition {
            // A response from the current parent is needed so the
            // candidate is provably preferred over it.
            if !self.received_response_from_parent {
                return false;
            }
        }

        true
    }

    /// The attach timer fired.
    fn handle_attach_timer<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) {
        let mut delay = Duration::ZERO;

        // A second-tier candidate runs the link request/accept exchange
        // before the Child ID Request.
        #[cfg(feature = "sub-child")]
        if let Some(step_delay) = self.sub_child_attach_step(deps) {
            self.attach_timer = Some(deps.now + step_delay);
            return;
        }

        if self.has_acceptable_parent_candidate() {
            if self.send_child_id_request(deps) == Ok(()) {
                self.set_attach_state(AttachState::ChildIdRequest);
                self.attach_timer = Some(deps.now + CHILD_ID_RESPONSE_TIMEOUT);
                return;
            }
        }

        match self.attach_state {
            AttachState::Idle => {
                self.attach_counter = 0;
            }
            AttachState::Start | AttachState::ParentRequest => {
                if self.attach_state == AttachState::Start {
                    self.set_attach_state(AttachState::ParentRequest);
                    self.parent_candidate.parent.peer.state = LinkState::Invalid;
                    self.received_response_from_parent = false;
                    self.parent_request_counter = 0;
                }

                self.parent_request_counter += 1;
                if let Some(req_type) = self.determine_parent_request_type() {
                    self.send_parent_request(deps, req_type);
                    delay = match req_type {
                        ParentRequestType::ToRouters | ParentRequestType::ToSelectedRouter => {
                            PARENT_REQUEST_ROUTER_TIMEOUT
                        }
                        ParentRequestType::ToRoutersAndReeds => PARENT_REQUEST_REED_TIMEOUT,
                    };
                } else if self.prepare_announce_state(deps) {
                    // One extra Parent Request while announcing gives a
                    // final chance to find a parent.
                    self.set_attach_state(AttachState::Announce);
                    self.send_parent_request(deps, ParentRequestType::ToRoutersAndReeds);
                    self.announce_channel = None;
                    delay = self.announce_delay;
                } else {
                    self.set_attach_state(AttachState::Idle);
                    self.parent_candidate.clear();
                    delay = self.reattach(deps);
                }
            }
            AttachState::Announce => {
                if let Some(channel) = self.next_announce_channel(deps) {
                    self.send_announce(deps, channel, true);
                    delay = self.announce_delay;
                } else {
                    self.set_attach_state(AttachState::Idle);
                    self.parent_candidate.clear();
                    delay = self.reattach(deps);
                }
            }
            AttachState::ChildIdRequest => {
                self.set_attach_state(AttachState::Idle);
                self.parent_candidate.clear();
                delay = self.reattach(deps);
            }
        }

        if delay != Duration::ZERO {
            self.attach_timer = Some(deps.now + delay);
        } else {
            self.attach_timer = None;
        }
    }

    fn prepare_announce_state<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) -> bool {
        if self.is_child() || self.reattach_state != ReattachState::Stop {
            return false;
        }
        // A device with a complete dataset and full routing role would
        // not announce; an end device or one with a partial dataset
        // cycles the channels.
        if !deps.net_data.is_active_partial() && self.device_mode.full_thread_device() {
            return false;
        }

        let channels = deps.net_data.channel_mask().count_ones().max(1) as u64;
        self.announce_delay = Duration::from_millis(
            (ANNOUNCE_TIMEOUT.as_millis() / (channels + 1)).max(MIN_ANNOUNCE_DELAY.as_millis()),
        );
        true
    }

    fn has_more_channels_to_announce(&self) -> bool {
        self.announce_channel.is_some()
    }

    fn next_announce_channel<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) -> Option<u8> {
        if self.attach_state != AttachState::Announce {
            return None;
        }
        let mask = deps.net_data.channel_mask();
        let start = self.announce_channel.map(|c| c + 1).unwrap_or(0);
        for channel in start..32 {
            if mask & (1 << channel) != 0 {
                self.announce_channel = Some(channel);
                return Some(channel);
            }
        }
        self.announce_channel = None;
        None
    }

    /// Attach attempt failed: decide whether to retry on the Active
    /// dataset, fall back to the Pending one, or detach. Returns the
    /// delay before the next cycle (zero = no timer).
    fn reattach<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) -> Duration {
        match self.reattach_state {
            ReattachState::Active => {
                if deps.net_data.restore_pending().is_ok() {
                    self.reattach_state = ReattachState::Pending;
                    self.set_attach_state(AttachState::Start);
                    return deps.rng.random_delay(ATTACH_START_JITTER);
                }
                self.reattach_state = ReattachState::Stop;
            }
            ReattachState::Pending => {
                let _ = deps.net_data.restore_active();
                self.reattach_state = ReattachState::Stop;
            }
            ReattachState::Stop => {}
        }

        match self.attach_mode {
            AttachMode::AnyPartition | AttachMode::BetterParent | AttachMode::SelectedParent => {
                if self.is_child() {
                    // Already attached; abandon the search and return
                    // to normal (possibly sleepy) operation.
                    return Duration::ZERO;
                }
                if self.announce.state == AnnounceAttachState::AnnounceAttaching {
                    self.handle_announce_attach_failure();
                }
                let _ = self.become_detached(deps);
            }
            AttachMode::SamePartition | AttachMode::DowngradeToReed => {
                self.attach(AttachMode::AnyPartition, deps.rng, deps.now);
            }
            AttachMode::BetterPartition => {}
        }

        Duration::ZERO
    }

    // --- Message construction ------------------------------------------

    /// Secure and queue a message. The MLE frame counter advances by
    /// one per finalized message.
    pub(crate) fn finalize<C: Crypto>(
        &mut self,
        crypto: &C,
        message: MleMessage,
        destination: Ip6Address,
        channel: Option<u8>,
    ) {
        let command = message.command();
        let counter = self.mle_frame_counter;
        self.mle_frame_counter += 1;

        let bytes = message.secure(
            crypto,
            self.key_sequence,
            counter,
            &self.link_local_source(),
            &destination,
        );

        #[cfg(feature = "debug")]
        self.emit_debug(crate::debug::DebugEvent::MessageSent {
            command,
            to: destination,
        });

        self.pending_tx.push(MleTransmit {
            destination,
            command,
            bytes,
            channel,
        });
    }

    fn send_parent_request<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        req_type: ParentRequestType,
    ) {
        deps.rng.fill_bytes(&mut self.parent_request_challenge);

        let mut scan_mask = match req_type {
            ParentRequestType::ToRouters | ParentRequestType::ToSelectedRouter => SCAN_MASK_ROUTER,
            ParentRequestType::ToRoutersAndReeds => SCAN_MASK_ROUTER | SCAN_MASK_END_DEVICE,
        };
        if self.accept_sub_parent {
            scan_mask |= crate::wire::SCAN_MASK_SUB_CHILD;
        }

        let mut message = MleMessage::new(Command::ParentRequest);
        message
            .append_mode(self.device_mode.bits())
            .append_challenge(&self.parent_request_challenge)
            .append_scan_mask(scan_mask)
            .append_version();
        if self.csl_enabled || self.accept_sub_parent {
            message.append_csl_channel(self.csl_channel);
        }

        self.finalize(
            deps.crypto,
            message,
            Ip6Address::LINK_LOCAL_ALL_ROUTERS,
            None,
        );
    }

    pub(crate) fn send_child_id_request<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) -> Result<(), Error> {
        if self.parent.peer.ext_address == self.parent_candidate.parent.peer.ext_address {
            if self.is_child() {
                return Err(Error::Already);
            }
            // Invalidate stale parent state so the Child ID Response
            // resolves to the candidate.
            self.parent.peer.state = LinkState::Invalid;
        }

        let rx_challenge = self.parent_candidate.rx_challenge.clone();
        let mut message = MleMessage::new(Command::ChildIdRequest);
        message
            .append_response(&rx_challenge)
            .append_link_frame_counter(self.link_frame_counter)
            .append_mle_frame_counter(self.mle_frame_counter)
            .append_mode(self.device_mode.bits())
            .append_timeout(self.timeout_secs)
            .append_version();
        if !self.is_rx_on_when_idle() {
            message.append_supervision_interval((self.timeout_secs / 2).min(u16::MAX as u32) as u16);
        }
        let addresses = self.registered_addresses.clone();
        if !addresses.is_empty() {
            message.append_address_registration(&addresses);
        }
        message.append_tlv_request(&[TlvType::Address16, TlvType::NetworkData]);
        if let Some(ts) = deps.net_data.active_timestamp() {
            message.append_active_timestamp(ts);
        }
        if let Some(ts) = deps.net_data.pending_timestamp() {
            message.append_pending_timestamp(ts);
        }
        #[cfg(feature = "sub-child")]
        if self.parent_candidate.parent.is_sub_child {
            // Routes the request (and its response) through the
            // second-tier parent chain.
            message.append_from_sub_child(
                self.parent_candidate.parent.peer.rloc16,
                Some(&self.ext_address),
            );
        }

        self.parent_candidate.parent.peer.state = LinkState::Valid;

        let destination =
            Ip6Address::link_local(&self.parent_candidate.parent.peer.ext_address);
        let channel = self
            .parent_candidate
            .parent
            .is_sub_child
            .then_some(self.parent_candidate.parent.peer.csl.channel)
            .filter(|c| *c != 0);
        self.finalize(deps.crypto, message, destination, channel);
        Ok(())
    }

    pub(crate) fn send_data_request<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        destination: Ip6Address,
    ) {
        if !self.is_attached() {
            return;
        }

        let mut message = MleMessage::new(Command::DataRequest);
        message.append_tlv_request(&[TlvType::NetworkData]);
        if let Some(ts) = deps.net_data.active_timestamp() {
            message.append_active_timestamp(ts);
        }
        if let Some(ts) = deps.net_data.pending_timestamp() {
            message.append_pending_timestamp(ts);
        }
        self.finalize(deps.crypto, message, destination, None);

        let sleepy_child = self.is_child() && !self.is_rx_on_when_idle();
        self.retx.on_data_request_tx(sleepy_child, deps.rng, deps.now);
    }

    pub(crate) fn send_data_request_to_parent<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) {
        let destination = Ip6Address::link_local(&self.parent.peer.ext_address);
        self.send_data_request(deps, destination);
    }

    pub(crate) fn send_child_update_request<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        mode: ChildUpdateMode,
    ) {
        if !self
            .parent
            .peer
            .matches(StateFilter::ValidOrRestoring)
        {
            let _ = self.become_detached(deps);
            return;
        }

        let parent_ll = Ip6Address::link_local(&self.parent.peer.ext_address);
        self.delayed
            .remove_matching(ScheduleType::ChildUpdateRequestAsChild, &parent_ll);

        // Track retries except when gracefully detaching or restoring
        // the previous role.
        match mode {
            ChildUpdateMode::Normal | ChildUpdateMode::AppendChallenge => {
                self.retx
                    .on_child_update_request_tx(self.csl_retry_period(), deps.rng, deps.now);
            }
            ChildUpdateMode::ZeroTimeout | ChildUpdateMode::RestoreChildRole => {}
        }

        let mut message = MleMessage::new(Command::ChildUpdateRequest);
        message.append_mode(self.device_mode.bits());

        if mode == ChildUpdateMode::AppendChallenge || self.is_detached() {
            deps.rng.fill_bytes(&mut self.parent_request_challenge);
            message.append_challenge(&self.parent_request_challenge);
        }

        match self.role {
            DeviceRole::Detached => {
                // Mesh-local registration only; the parent revalidates
                // everything else during the restore exchange.
            }
            DeviceRole::Child => {
                message
                    .append_source_address(self.rloc16)
                    .append_leader_data(&self.leader_data)
                    .append_timeout(if mode == ChildUpdateMode::ZeroTimeout {
                        0
                    } else {
                        self.timeout_secs
                    });
                if !self.is_rx_on_when_idle() {
                    message.append_supervision_interval(
                        (self.timeout_secs / 2).min(u16::MAX as u32) as u16,
                    );
                    if self.csl_enabled {
                        message.append_csl_channel(self.csl_channel);
                        message.append_csl_timeout(self.csl_timeout_secs);
                    }
                }
            }
            _ => return,
        }

        let addresses = self.registered_addresses.clone();
        if !addresses.is_empty() {
            message.append_address_registration(&addresses);
        }

        self.finalize(deps.crypto, message, parent_ll, None);
    }

    fn send_child_update_response<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        tlv_list: &[TlvType],
        challenge: Option<&[u8]>,
        destination: Ip6Address,
    ) {
        let mut message = MleMessage::new(Command::ChildUpdateResponse);
        message.append_source_address(self.rloc16);
        message.append_mode(self.device_mode.bits());

        for tlv in tlv_list {
            match tlv {
                TlvType::Response => {
                    if let Some(challenge) = challenge {
                        message.append_response(challenge);
                    }
                }
                TlvType::LinkFrameCounter => {
                    message.append_link_frame_counter(self.link_frame_counter);
                }
                TlvType::MleFrameCounter => {
                    message.append_mle_frame_counter(self.mle_frame_counter);
                }
                TlvType::Timeout => {
                    message.append_timeout(self.timeout_secs);
                }
                TlvType::Status => {
                    message.append_status(STATUS_ERROR);
                }
                TlvType::LeaderData => {
                    message.append_leader_data(&self.leader_data);
                }
                TlvType::CslTimeout => {
                    message.append_csl_timeout(self.csl_timeout_secs);
                }
                TlvType::AddressRegistration => {
                    let addresses = self.registered_addresses.clone();
                    if !addresses.is_empty() {
                        message.append_address_registration(&addresses);
                    }
                }
                _ => {}
            }
        }

        self.finalize(deps.crypto, message, destination, None);
    }

    /// Send an Announce on `channel`. Orphan announces carry a zero
    /// active timestamp.
    fn send_announce<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        channel: u8,
        orphan: bool,
    ) {
        let timestamp = if orphan {
            0
        } else {
            deps.net_data.active_timestamp().unwrap_or(0)
        };

        let mut message = MleMessage::new(Command::Announce);
        message
            .append_channel(self.pan_channel)
            .append_active_timestamp(timestamp)
            .append_pan_id(self.pan_id);

        self.finalize(
            deps.crypto,
            message,
            Ip6Address::LINK_LOCAL_ALL_NODES,
            Some(channel),
        );
    }

    // --- Ingress -------------------------------------------------------

    /// Find which table entry `ext` corresponds to.
    pub(crate) fn find_neighbor(&self, ext: ExtAddress) -> Option<NeighborRef> {
        if self.parent.peer.ext_address == ext
            && self.parent.peer.matches(StateFilter::AnyExceptInvalid)
        {
            return Some(NeighborRef::Parent);
        }
        if self.parent_candidate.parent.peer.ext_address == ext
            && self
                .parent_candidate
                .parent
                .peer
                .matches(StateFilter::AnyExceptInvalid)
        {
            return Some(NeighborRef::ParentCandidate);
        }
        self.child_table.index_of(ext).map(NeighborRef::Child)
    }

    pub(crate) fn peer(&self, neighbor: NeighborRef) -> &Peer {
        match neighbor {
            NeighborRef::Parent => &self.parent.peer,
            NeighborRef::ParentCandidate => &self.parent_candidate.parent.peer,
            NeighborRef::Child(i) => &self.child_table.at(i).expect("child index").peer,
        }
    }

    pub(crate) fn peer_mut(&mut self, neighbor: NeighborRef) -> &mut Peer {
        match neighbor {
            NeighborRef::Parent => &mut self.parent.peer,
            NeighborRef::ParentCandidate => &mut self.parent_candidate.parent.peer,
            NeighborRef::Child(i) => {
                &mut self.child_table.at_mut(i).expect("child index").peer
            }
        }
    }

    /// Process one MLE UDP datagram.
    pub fn handle_udp<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        source: Ip6Address,
        destination: Ip6Address,
        hop_limit: u8,
        bytes: &[u8],
        rss: Option<i8>,
    ) -> Result<(), Error> {
        let result =
            self.handle_udp_inner(deps, source, destination, hop_limit, bytes, rss);
        if let Err(_error) = result {
            self.counters.rx_dropped += 1;
            #[cfg(feature = "debug")]
            self.emit_debug(crate::debug::DebugEvent::MessageDropped {
                error: _error,
                data_len: bytes.len(),
            });
        }
        result
    }

    fn handle_udp_inner<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        source: Ip6Address,
        destination: Ip6Address,
        hop_limit: u8,
        bytes: &[u8],
        rss: Option<i8>,
    ) -> Result<(), Error> {
        if hop_limit != MLE_HOP_LIMIT {
            return Err(Error::Parse);
        }

        let msg = codec::parse(deps.crypto, bytes, &source, &destination)?;

        if !msg.secured {
            // Discovery handling lives outside the core; nothing to do.
            return Ok(());
        }

        if self.is_disabled() {
            return Err(Error::InvalidState);
        }
        self.counters.rx_secured += 1;

        let ext = source.ext_address();
        let neighbor = if msg.command == Command::ChildIdResponse {
            (self.parent_candidate.parent.peer.ext_address == ext
                && !self.parent_candidate.parent.peer.is_state_invalid())
            .then_some(NeighborRef::ParentCandidate)
            .or_else(|| self.find_neighbor(ext))
        } else {
            self.find_neighbor(ext)
        };

        if let Some(nref) = neighbor {
            let peer = self.peer_mut(nref);
            if peer.is_state_valid() {
                if msg.key_sequence == peer.key_sequence {
                    // One-off counters are common duplicates of
                    // broadcast messages; refresh the radio link info
                    // but drop the payload.
                    if msg.frame_counter.wrapping_add(1) == peer.mle_frame_counter {
                        if let Some(rss) = rss {
                            peer.link.update_on_rx(rss, -100);
                        }
                        return Ok(());
                    }
                    if msg.frame_counter < peer.mle_frame_counter {
                        return Err(Error::Duplicated);
                    }
                } else {
                    if msg.key_sequence < peer.key_sequence {
                        return Err(Error::Duplicated);
                    }
                    peer.adopt_key_sequence(msg.key_sequence);
                }
                peer.mle_frame_counter = msg.frame_counter + 1;
            } else {
                peer.mle_frame_counter = msg.frame_counter + 1;
            }
            if let Some(rss) = rss {
                self.peer_mut(nref).link.update_on_rx(rss, -100);
            }
        }

        #[cfg(feature = "debug")]
        self.emit_debug(crate::debug::DebugEvent::MessageReceived {
            command: msg.command,
            from: source,
            key_sequence: msg.key_sequence,
            frame_counter: msg.frame_counter,
        });

        let class = self.dispatch(deps, &msg, neighbor, source, rss)?;
        self.process_key_sequence(deps, class, msg.key_sequence, neighbor);
        Ok(())
    }

    fn dispatch<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        neighbor: Option<NeighborRef>,
        source: Ip6Address,
        rss: Option<i8>,
    ) -> Result<RxClass, Error> {
        match msg.command {
            Command::Advertisement => self.handle_advertisement(deps, msg, neighbor, source),
            Command::DataResponse => self.handle_data_response(deps, msg, neighbor, source),
            Command::ParentResponse => self.handle_parent_response(deps, msg, source, rss),
            Command::ChildIdResponse => self.handle_child_id_response(deps, msg, neighbor, source),
            Command::ChildUpdateRequest => {
                self.handle_child_update_request_on_child(deps, msg, neighbor, source)
            }
            Command::ChildUpdateResponse => {
                self.handle_child_update_response_on_child(deps, msg, neighbor, source)
            }
            Command::Announce => self.handle_announce(deps, msg, source),
            Command::DataRequest => Err(Error::Drop),
            #[cfg(feature = "sub-child")]
            Command::ParentRequest => self.handle_parent_request_as_sub_parent(deps, msg, source),
            #[cfg(feature = "sub-child")]
            Command::LinkRequest => self.handle_link_request_as_sub_parent(deps, msg, source),
            #[cfg(feature = "sub-child")]
            Command::LinkAccept => self.handle_link_accept_as_sub_child(deps, msg, source),
            #[cfg(feature = "sub-child")]
            Command::ChildIdRequest => self.handle_child_id_request_forward(deps, msg, source),
            _ => Err(Error::Drop),
        }
    }

    /// Adoption policy for larger key sequences.
    fn process_key_sequence<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        class: RxClass,
        msg_key_sequence: u32,
        neighbor: Option<NeighborRef>,
    ) {
        if msg_key_sequence <= self.key_sequence {
            return;
        }

        let is_next = msg_key_sequence - self.key_sequence == 1;

        match class {
            RxClass::Authoritative => {}
            RxClass::Peer => {
                let Some(nref) = neighbor else {
                    return;
                };
                if !self.peer(nref).is_state_valid() {
                    return;
                }
                if !is_next {
                    self.reestablish_link_with_neighbor(deps, nref);
                    return;
                }
            }
            RxClass::Unknown => return,
        }

        self.key_sequence = msg_key_sequence;
        #[cfg(feature = "debug")]
        self.emit_debug(crate::debug::DebugEvent::KeySequenceAdopted {
            key_sequence: msg_key_sequence,
        });
        self.push_event(Event::KeySequenceChanged {
            key_sequence: msg_key_sequence,
        });
    }

    /// Security errors or key-sequence jumps suggest the neighbor lost
    /// our link state; challenge it afresh.
    pub(crate) fn reestablish_link_with_neighbor<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        neighbor: NeighborRef,
    ) {
        if !self.is_attached() || !self.peer(neighbor).is_state_valid() {
            return;
        }

        #[cfg(feature = "debug")]
        {
            let rloc16 = self.peer(neighbor).rloc16;
            self.emit_debug(crate::debug::DebugEvent::LinkReestablish { rloc16 });
        }

        match neighbor {
            NeighborRef::Parent if self.is_child() => {
                self.send_child_update_request(deps, ChildUpdateMode::AppendChallenge);
            }
            #[cfg(feature = "sub-child")]
            NeighborRef::Child(index) => {
                self.mark_sub_child_for_update(index, deps.now);
            }
            _ => {}
        }
    }

    // --- Handlers ------------------------------------------------------

    fn handle_advertisement<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        neighbor: Option<NeighborRef>,
        source: Ip6Address,
    ) -> Result<RxClass, Error> {
        if !self.is_attached() {
            return Err(Error::Drop);
        }

        let source_address = wire::read_source_address(&msg.tlvs)?;
        let leader_data = wire::read_leader_data(&msg.tlvs)?;

        if self.is_child() {
            if neighbor != Some(NeighborRef::Parent) {
                return Ok(RxClass::Peer);
            }

            if self.parent.peer.rloc16 != source_address {
                // Stale parent.
                let _ = self.become_detached(deps);
                return Ok(RxClass::Peer);
            }

            if leader_data.partition_id != self.leader_data.partition_id
                || leader_data.leader_router_id != self.leader_data.leader_router_id
            {
                self.set_leader_data(leader_data);
                self.retrieve_new_network_data = true;
            }

            self.parent.peer.last_heard = deps.now;
        }

        if self.retrieve_new_network_data || self.is_network_data_newer(deps, &leader_data) {
            let delay = deps.rng.random_delay(MAX_RESPONSE_DELAY);
            self.delayed.schedule(
                ScheduleType::DataRequest,
                source,
                delay,
                ScheduleInfo::None,
                deps.now,
            );
        }

        Ok(RxClass::Peer)
    }

    fn handle_data_response<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        neighbor: Option<NeighborRef>,
        source: Ip6Address,
    ) -> Result<RxClass, Error> {
        match neighbor {
            Some(nref) if self.peer(nref).is_state_valid() => {}
            _ => return Err(Error::Drop),
        }

        self.handle_leader_data(deps, msg, source)?;
        Ok(RxClass::Peer)
    }

    fn is_network_data_newer<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &self,
        deps: &MleDeps<'_, C, R, N, S>,
        leader_data: &LeaderData,
    ) -> bool {
        let local = deps.net_data.version(!self.device_mode.full_network_data());
        let remote = if self.device_mode.full_network_data() {
            leader_data.data_version
        } else {
            leader_data.stable_data_version
        };
        // Serial number comparison over the u8 version space.
        remote.wrapping_sub(local) as i8 > 0
    }

    fn set_leader_data(&mut self, leader_data: LeaderData) {
        if self.leader_data.partition_id != leader_data.partition_id {
            self.push_event(Event::PartitionIdChanged {
                partition_id: leader_data.partition_id,
            });
        }
        self.leader_data = leader_data;
    }

    /// Shared Leader Data / dataset processing for Data Responses and
    /// Child Update exchanges.
    fn handle_leader_data<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        source: Ip6Address,
    ) -> Result<(), Error> {
        let leader_data = wire::read_leader_data(&msg.tlvs)?;
        let mut data_request = false;
        let mut save_active = None;
        let mut save_pending = None;

        if leader_data.partition_id != self.leader_data.partition_id
            || leader_data.weighting != self.leader_data.weighting
            || leader_data.leader_router_id != self.leader_data.leader_router_id
        {
            if !self.is_child() {
                return Err(Error::Drop);
            }
            self.set_leader_data(leader_data);
            self.retrieve_new_network_data = true;
        } else if !self.retrieve_new_network_data && !self.is_network_data_newer(deps, &leader_data)
        {
            return Ok(());
        }

        match wire::read_u64_tlv(&msg.tlvs, TlvType::ActiveTimestamp) {
            Ok(timestamp) => {
                if Some(timestamp) != deps.net_data.active_timestamp() {
                    if wire::contains_tlv(&msg.tlvs, TlvType::ActiveDataset) {
                        save_active = Some(timestamp);
                    } else {
                        data_request = true;
                    }
                }
            }
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        match wire::read_u64_tlv(&msg.tlvs, TlvType::PendingTimestamp) {
            Ok(timestamp) => {
                if Some(timestamp) != deps.net_data.pending_timestamp() {
                    if wire::contains_tlv(&msg.tlvs, TlvType::PendingDataset) {
                        save_pending = Some(timestamp);
                    } else {
                        data_request = true;
                    }
                }
            }
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        if !data_request {
            match wire::find_tlv(&msg.tlvs, TlvType::NetworkData) {
                Ok(network_data) => {
                    deps.net_data.set_network_data(&leader_data, network_data);

                    if let Some(ts) = save_active {
                        if let Ok(dataset) = wire::find_tlv(&msg.tlvs, TlvType::ActiveDataset) {
                            deps.net_data.save_active_dataset(ts, dataset);
                        }
                    }
                    if let Some(ts) = save_pending {
                        if let Ok(dataset) = wire::find_tlv(&msg.tlvs, TlvType::PendingDataset) {
                            deps.net_data.save_pending_dataset(ts, dataset);
                        }
                    }
                    self.retrieve_new_network_data = false;
                }
                Err(Error::NotFound) => data_request = true,
                Err(e) => return Err(e),
            }
        }

        if data_request {
            let delay = if source.is_multicast() {
                deps.rng.random_delay(MAX_RESPONSE_DELAY)
            } else {
                // Give any response being built a head start so it is
                // enqueued before this Data Request.
                MIN_RESPONSE_DELAY
            };
            self.delayed.schedule(
                ScheduleType::DataRequest,
                source,
                delay,
                ScheduleInfo::None,
                deps.now,
            );
        } else {
            self.retx.on_data_response_rx();
        }

        Ok(())
    }

    /// Candidate ranking cascade: returns whether the advertised parent
    /// is preferable to the current candidate.
    fn is_better_parent(
        &self,
        rloc16: Rloc16,
        two_way_margin: u8,
        connectivity: &Connectivity,
        version: u16,
        csl_accuracy: &CslAccuracy,
    ) -> bool {
        let candidate = &self.parent_candidate;

        let cmp = (LinkQuality::from_link_margin(two_way_margin) as u8)
            .cmp(&(candidate.two_way_link_quality() as u8))
            .then_with(|| rloc16.is_router().cmp(&candidate.parent.peer.rloc16.is_router()))
            .then_with(|| connectivity.parent_priority.cmp(&candidate.priority))
            .then_with(|| connectivity.link_quality_3.cmp(&candidate.link_quality_3))
            .then_with(|| version.cmp(&candidate.parent.peer.version))
            .then_with(|| connectivity.sed_buffer_size.cmp(&candidate.sed_buffer_size))
            .then_with(|| {
                connectivity
                    .sed_datagram_count
                    .cmp(&candidate.sed_datagram_count)
            })
            .then_with(|| connectivity.link_quality_2.cmp(&candidate.link_quality_2))
            .then_with(|| connectivity.link_quality_1.cmp(&candidate.link_quality_1))
            .then_with(|| {
                if self.is_rx_on_when_idle() {
                    core::cmp::Ordering::Equal
                } else {
                    // Smaller CSL cost is better.
                    let new = self.calc_parent_csl_metric(csl_accuracy);
                    let old = self.calc_parent_csl_metric(&candidate.parent.peer.csl.accuracy);
                    old.cmp(&new)
                }
            })
            .then_with(|| two_way_margin.cmp(&candidate.link_margin));

        cmp == core::cmp::Ordering::Greater
    }

    /// Battery cost of following this parent's CSL timing: drift to be
    /// absorbed per resync interval grows quadratically with the
    /// timeout, weighted by the parent's accuracy.
    fn calc_parent_csl_metric(&self, accuracy: &CslAccuracy) -> u64 {
        let period_us = CSL_MIN_PERIOD_US;
        let timeout_us = self.csl_timeout_secs as u64 * 1_000_000;
        let k = timeout_us / period_us;

        k * (k + 1) * period_us / 1_000_000 * accuracy.clock_accuracy_ppm as u64
            + accuracy.uncertainty_us() * k
    }

    fn handle_parent_response<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        source: Ip6Address,
        rss: Option<i8>,
    ) -> Result<RxClass, Error> {
        let source_address = wire::read_source_address(&msg.tlvs)?;
        let version = wire::read_u16_tlv(&msg.tlvs, TlvType::Version)?;

        let response = wire::read_challenge(&msg.tlvs, TlvType::Response)?;
        if response != self.parent_request_challenge {
            return Err(Error::Security);
        }

        let ext = source.ext_address();
        if self.is_child() && self.parent.peer.ext_address == ext {
            self.received_response_from_parent = true;
        }

        let leader_data = wire::read_leader_data(&msg.tlvs)?;
        let link_margin_out = wire::read_u8_tlv(&msg.tlvs, TlvType::LinkMargin)?;
        let own_margin = rss.map(|r| (r as i16 + 100).clamp(0, 255) as u8).unwrap_or(link_margin_out);
        let two_way_margin = own_margin.min(link_margin_out);

        #[cfg(feature = "sub-child")]
        let sub_child_link = codec::read_sub_child_link(&msg.tlvs).ok();
        #[cfg(not(feature = "sub-child"))]
        let sub_child_link: Option<(Rloc16, u8, u8)> = None;

        // Second-tier parents advertise no router connectivity.
        let connectivity = match Connectivity::read(&msg.tlvs) {
            Ok(c) => c,
            Err(Error::NotFound) if sub_child_link.is_some() => Connectivity::default(),
            Err(e) => return Err(e),
        };

        let csl_accuracy = match wire::read_csl_accuracy(&msg.tlvs) {
            Ok(acc) => acc,
            Err(Error::NotFound) => CslAccuracy::default(),
            Err(e) => return Err(e),
        };

        // Keep processing responses from the existing candidate to
        // refresh its challenge and counters; otherwise only better
        // candidates replace it.
        if self.parent_candidate.is_state_parent_response()
            && self.parent_candidate.parent.peer.ext_address != ext
        {
            let better =
                self.is_better_parent(source_address, two_way_margin, &connectivity, version, &csl_accuracy);
            #[cfg(feature = "debug")]
            self.emit_debug(crate::debug::DebugEvent::ParentCandidateRanked {
                rloc16: source_address,
                link_margin: two_way_margin,
                accepted: better,
            });
            if !better {
                return Ok(RxClass::Authoritative);
            }
        }

        let link_frame_counter = wire::read_u32_tlv(&msg.tlvs, TlvType::LinkFrameCounter)?;
        let mle_frame_counter = match wire::read_u32_tlv(&msg.tlvs, TlvType::MleFrameCounter) {
            Ok(c) => c,
            Err(Error::NotFound) => link_frame_counter,
            Err(e) => return Err(e),
        };
        let challenge = wire::read_challenge(&msg.tlvs, TlvType::Challenge)?;

        let candidate = &mut self.parent_candidate;
        candidate.parent.clear();
        candidate.parent.peer.init(ext, msg.key_sequence, deps.now);
        candidate.parent.peer.rloc16 = source_address;
        candidate.parent.peer.link_frame_counter = link_frame_counter;
        candidate.parent.peer.mle_frame_counter = mle_frame_counter;
        candidate.parent.peer.version = version;
        candidate.parent.peer.device_mode = DeviceMode::new(true, true, true);
        candidate.parent.peer.link.quality_out =
            LinkQuality::from_link_margin(link_margin_out);
        if let Some(rss) = rss {
            candidate.parent.peer.link.update_on_rx(rss, -100);
        }
        candidate.parent.peer.state = LinkState::ParentResponse;
        candidate.parent.peer.csl.accuracy = csl_accuracy;
        candidate.parent.leader_cost = connectivity.leader_cost;
        if let Some((_, _, hops)) = sub_child_link {
            candidate.parent.is_sub_child = true;
            candidate.parent.hops_to_ftd = hops + 1;
        }

        candidate.rx_challenge = challenge;
        candidate.priority = connectivity.parent_priority;
        candidate.link_quality_3 = connectivity.link_quality_3;
        candidate.link_quality_2 = connectivity.link_quality_2;
        candidate.link_quality_1 = connectivity.link_quality_1;
        candidate.sed_buffer_size = connectivity.sed_buffer_size;
        candidate.sed_datagram_count = connectivity.sed_datagram_count;
        candidate.leader_data = leader_data;
        candidate.is_singleton = connectivity.is_singleton();
        candidate.link_margin = two_way_margin;

        Ok(RxClass::Authoritative)
    }

    fn handle_child_id_response<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        neighbor: Option<NeighborRef>,
        _source: Ip6Address,
    ) -> Result<RxClass, Error> {
        // A response concerning another device rides the second-tier
        // forwarding chain instead of the local attach machinery.
        #[cfg(feature = "sub-child")]
        if let Ok((addressed_rloc, Some(child_ext))) = codec::read_from_sub_child(&msg.tlvs) {
            if child_ext != self.ext_address {
                return self.handle_sub_child_id_response(deps, msg, addressed_rloc, child_ext);
            }
        }

        let source_address = wire::read_source_address(&msg.tlvs)?;

        let valid_candidate = matches!(neighbor, Some(NeighborRef::ParentCandidate))
            && self.parent_candidate.parent.peer.is_state_valid();
        if !valid_candidate {
            return Err(Error::Security);
        }
        if self.attach_state != AttachState::ChildIdRequest {
            return Err(Error::Drop);
        }

        let short_address = Rloc16(wire::read_u16_tlv(&msg.tlvs, TlvType::Address16)?);
        if !short_address.matches_router_of(source_address) {
            return Err(Error::Rejected);
        }

        let leader_data = wire::read_leader_data(&msg.tlvs)?;
        if !wire::contains_tlv(&msg.tlvs, TlvType::NetworkData) {
            return Err(Error::Parse);
        }

        match wire::read_u64_tlv(&msg.tlvs, TlvType::ActiveTimestamp) {
            Ok(timestamp) => {
                if let Ok(dataset) = wire::find_tlv(&msg.tlvs, TlvType::ActiveDataset) {
                    deps.net_data.save_active_dataset(timestamp, dataset);
                }
            }
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        // A successful reattach on the Pending dataset commits it.
        if self.reattach_state == ReattachState::Pending {
            deps.net_data.clear_pending_dataset();
        }

        match wire::read_u64_tlv(&msg.tlvs, TlvType::PendingTimestamp) {
            Ok(timestamp) => {
                if let Ok(dataset) = wire::find_tlv(&msg.tlvs, TlvType::PendingDataset) {
                    deps.net_data.save_pending_dataset(timestamp, dataset);
                }
            }
            Err(Error::NotFound) => deps.net_data.clear_pending_dataset(),
            Err(e) => return Err(e),
        }

        // Parent attach success.
        self.set_state_detached(deps.now);
        self.set_leader_data(leader_data);

        #[cfg(feature = "sub-child")]
        let prefix_len = wire::read_u8_tlv(&msg.tlvs, TlvType::RlocPrefixLength).ok();

        self.parent = self.parent_candidate.parent.clone();
        self.parent_candidate.clear();
        if !self.parent.is_sub_child {
            // For a second-tier parent the source address is the
            // assigning device further up; keep the candidate's own
            // locator for next-hop routing.
            self.parent.peer.rloc16 = source_address;
        }
        self.parent.peer.state = LinkState::Valid;

        #[cfg(feature = "sub-child")]
        if let Some(prefix_len) = prefix_len {
            self.set_own_rloc_prefix_len(prefix_len);
        }

        if let Ok(network_data) = wire::find_tlv(&msg.tlvs, TlvType::NetworkData) {
            deps.net_data.set_network_data(&leader_data, network_data);
        }

        self.set_state_child(deps, short_address);

        Ok(RxClass::Peer)
    }

    fn handle_child_update_request_on_child<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        neighbor: Option<NeighborRef>,
        source: Ip6Address,
    ) -> Result<RxClass, Error> {
        if !self.is_attached() {
            return Err(Error::Drop);
        }

        #[cfg(feature = "sub-child")]
        if let Some(class) = self.try_handle_sub_child_update_request(deps, msg, neighbor, source)? {
            return Ok(class);
        }

        let source_address = wire::read_source_address(&msg.tlvs)?;

        let mut tlv_list: Vec<TlvType> = Vec::new();
        let challenge = match wire::read_challenge(&msg.tlvs, TlvType::Challenge) {
            Ok(challenge) => {
                tlv_list.push(TlvType::Response);
                tlv_list.push(TlvType::MleFrameCounter);
                tlv_list.push(TlvType::LinkFrameCounter);
                Some(challenge)
            }
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        };

        if neighbor == Some(NeighborRef::Parent) {
            match wire::read_u8_tlv(&msg.tlvs, TlvType::Status) {
                Ok(status) if status == STATUS_ERROR => {
                    let _ = self.become_detached(deps);
                    return Ok(RxClass::Peer);
                }
                Ok(_) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }

            if self.parent.peer.rloc16 != source_address {
                let _ = self.become_detached(deps);
                return Ok(RxClass::Peer);
            }

            self.handle_leader_data(deps, msg, source)?;

            if let Ok(margin) = wire::read_u8_tlv(&msg.tlvs, TlvType::LinkMargin) {
                self.parent.peer.link.quality_out = LinkQuality::from_link_margin(margin);
            }

            // A request carrying CSL accuracy obliges us to echo our
            // CSL timeout.
            if wire::read_csl_accuracy(&msg.tlvs).is_ok() {
                tlv_list.push(TlvType::CslTimeout);
            }

            self.parent.peer.last_heard = deps.now;
        } else {
            // Not our parent: answer with an error status so it drops
            // its stale child entry.
            tlv_list.push(TlvType::Status);
        }

        match wire::find_tlv(&msg.tlvs, TlvType::TlvRequest) {
            Ok(requested) => {
                for t in requested {
                    match *t {
                        t if t == TlvType::Timeout as u8 => tlv_list.push(TlvType::Timeout),
                        t if t == TlvType::AddressRegistration as u8 => {
                            tlv_list.push(TlvType::AddressRegistration)
                        }
                        t if t == TlvType::LeaderData as u8 => tlv_list.push(TlvType::LeaderData),
                        _ => {}
                    }
                }
            }
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        self.send_child_update_response(deps, &tlv_list, challenge.as_deref(), source);
        Ok(RxClass::Peer)
    }

    fn handle_child_update_response_on_child<
        C: Crypto,
        R: Random,
        N: NetworkDataStore,
        S: SettingsStore,
    >(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        neighbor: Option<NeighborRef>,
        source: Ip6Address,
    ) -> Result<RxClass, Error> {
        #[cfg(feature = "sub-child")]
        if let Some(class) = self.try_handle_sub_child_update_response(deps, msg, neighbor, source)? {
            return Ok(class);
        }

        let response = match wire::read_challenge(&msg.tlvs, TlvType::Response) {
            Ok(r) => Some(r),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        };

        match self.role {
            DeviceRole::Detached => {
                if response.as_deref() != Some(&self.parent_request_challenge[..]) {
                    return Err(Error::Security);
                }
            }
            DeviceRole::Child => {
                if neighbor != Some(NeighborRef::Parent) || !self.parent.peer.is_state_valid() {
                    return Err(Error::Security);
                }
            }
            _ => return Err(Error::Drop),
        }

        if wire::read_u8_tlv(&msg.tlvs, TlvType::Status).is_ok() {
            let _ = self.become_detached(deps);
            return Ok(RxClass::Peer);
        }

        let mode = wire::read_u8_tlv(&msg.tlvs, TlvType::Mode)?;
        if mode != self.device_mode.bits() {
            return Err(Error::Drop);
        }

        if self.role == DeviceRole::Detached {
            let link_frame_counter = wire::read_u32_tlv(&msg.tlvs, TlvType::LinkFrameCounter)?;
            let mle_frame_counter = match wire::read_u32_tlv(&msg.tlvs, TlvType::MleFrameCounter) {
                Ok(c) => c,
                Err(Error::NotFound) => link_frame_counter,
                Err(e) => return Err(e),
            };
            self.parent.peer.link_frame_counter = link_frame_counter;
            self.parent.peer.mle_frame_counter = mle_frame_counter;
            self.parent.peer.state = LinkState::Valid;
            let rloc16 = self.rloc16;
            self.set_state_child(deps, rloc16);
            self.retrieve_new_network_data = true;
        }

        let source_address = wire::read_source_address(&msg.tlvs)?;
        if !self.rloc16.matches_router_of(source_address) {
            let _ = self.become_detached(deps);
            return Ok(RxClass::Peer);
        }

        self.handle_leader_data(deps, msg, source)?;

        match wire::read_u32_tlv(&msg.tlvs, TlvType::Timeout) {
            Ok(timeout) => {
                // Zero-timeout response completes a graceful detach.
                if self.detacher.state == DetachState::Detaching && timeout == 0 {
                    self.stop(deps, StopMode::KeepDatasets);
                    return Ok(RxClass::Peer);
                }
                self.timeout_secs = timeout.max(1);
            }
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        if let Ok(accuracy) = wire::read_csl_accuracy(&msg.tlvs) {
            self.parent.peer.csl.accuracy = accuracy;
        }

        if let Ok(margin) = wire::read_u8_tlv(&msg.tlvs, TlvType::LinkMargin) {
            self.parent.peer.link.quality_out = LinkQuality::from_link_margin(margin);
        }

        self.parent.peer.last_heard = deps.now;
        self.retx.on_child_update_response_rx(
            self.timeout_secs,
            self.is_rx_on_when_idle(),
            deps.rng,
            deps.now,
        );

        Ok(if response.is_some() {
            RxClass::Authoritative
        } else {
            RxClass::Peer
        })
    }

    fn handle_announce<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        msg: &RxMle,
        _source: Ip6Address,
    ) -> Result<RxClass, Error> {
        let channel = wire::read_channel_tlv(&msg.tlvs, TlvType::Channel)?;
        let timestamp = wire::read_u64_tlv(&msg.tlvs, TlvType::ActiveTimestamp)?;
        let pan_id = wire::read_u16_tlv(&msg.tlvs, TlvType::PanId)?;

        let local_timestamp = deps.net_data.active_timestamp().unwrap_or(0);
        let is_from_orphan = timestamp == 0;
        let channel_and_pan_match = channel == self.pan_channel && pan_id == self.pan_id;

        if is_from_orphan || timestamp < local_timestamp {
            if is_from_orphan && channel_and_pan_match {
                return Ok(RxClass::Peer);
            }
            // Answer with our own configuration on their channel.
            self.send_announce(deps, channel, false);
        } else if timestamp > local_timestamp {
            if self.is_detached() && channel_and_pan_match {
                return Ok(RxClass::Peer);
            }

            if self.announce.state == AnnounceAttachState::ToAnnounceAttach
                && self.announce.alternate_timestamp >= timestamp
            {
                return Ok(RxClass::Peer);
            }

            self.announce.alternate_timestamp = timestamp;
            self.announce.alternate_channel = channel;
            self.announce.alternate_pan_id = pan_id;
            self.announce.state = AnnounceAttachState::ToAnnounceAttach;
            self.announce.process_deadline = Some(deps.now + ANNOUNCE_PROCESS_TIMEOUT);
        }

        Ok(RxClass::Peer)
    }

    fn start_announce_attach<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) {
        if self.announce.state != AnnounceAttachState::ToAnnounceAttach {
            return;
        }

        let new_channel = self.announce.alternate_channel;
        let new_pan_id = self.announce.alternate_pan_id;

        self.stop(deps, StopMode::KeepDatasets);

        // Remember where we came from for the failure path.
        self.announce.alternate_channel = self.pan_channel;
        self.announce.alternate_pan_id = self.pan_id;
        self.announce.alternate_timestamp = 0;

        self.pan_channel = new_channel;
        self.pan_id = new_pan_id;
        self.announce.state = AnnounceAttachState::AnnounceAttaching;
        let _ = self.start(deps, StartMode::AnnounceAttach);
    }

    fn handle_announce_attach_failure(&mut self) {
        if self.announce.state != AnnounceAttachState::AnnounceAttaching {
            return;
        }
        self.announce.state = AnnounceAttachState::Idle;
        self.pan_channel = self.announce.alternate_channel;
        self.pan_id = self.announce.alternate_pan_id;
    }

    // --- Timers --------------------------------------------------------

    /// Earliest time any owned timer needs a tick.
    pub fn next_fire_time(&self) -> Option<Timestamp> {
        let candidates = [
            self.attach_timer,
            self.delayed.next_fire_time(),
            self.retx.next_fire_time(),
            self.detacher.deadline,
            self.announce.process_deadline,
        ];
        candidates.into_iter().flatten().min()
    }

    /// Drive every owned timer. Call on each millisecond tick (or at
    /// the deadline returned by [`Self::next_fire_time`]).
    pub fn handle_timer<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) {
        if let Some(deadline) = self.attach_timer {
            if deps.now >= deadline {
                self.attach_timer = None;
                if self.attach_state == AttachState::Idle && self.is_attached() {
                    // Settled: reset the backoff counter.
                    self.attach_counter = 0;
                } else {
                    self.handle_attach_timer(deps);
                }
            }
        }

        // Delayed schedules execute after any incoming-frame handler of
        // the same tick, in unspecified order.
        let due = self.delayed.take_due(deps.now);
        for schedule in due {
            self.execute_schedule(deps, schedule);
        }

        if !self.is_disabled() {
            match self.retx.on_timer(deps.now) {
                RetxAction::None => {}
                RetxAction::SendChildUpdateRequest => {
                    self.send_child_update_request(deps, ChildUpdateMode::Normal);
                }
                RetxAction::SendDataRequest => {
                    self.send_data_request_to_parent(deps);
                }
                RetxAction::Detach => {
                    self.retx.stop();
                    let _ = self.become_detached(deps);
                }
            }
        }

        if let Some(deadline) = self.detacher.deadline {
            if deps.now >= deadline && self.detacher.state == DetachState::Detaching {
                self.detacher.deadline = None;
                self.stop(deps, StopMode::KeepDatasets);
            }
        }

        if let Some(deadline) = self.announce.process_deadline {
            if deps.now >= deadline {
                self.announce.process_deadline = None;
                self.start_announce_attach(deps);
            }
        }

        #[cfg(feature = "sub-child")]
        self.handle_sub_child_tick(deps);
    }

    fn execute_schedule<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
        schedule: crate::delayed::Schedule,
    ) {
        match schedule.schedule_type {
            ScheduleType::DataRequest => {
                self.send_data_request(deps, schedule.destination);
            }
            ScheduleType::ChildUpdateRequestAsChild => {
                self.send_child_update_request(deps, ChildUpdateMode::Normal);
            }
            ScheduleType::DataResponse => {
                self.send_multicast_data_response(deps);
            }
            #[cfg(feature = "sub-child")]
            ScheduleType::ParentResponse => {
                if let ScheduleInfo::ParentResponse { child_ext, challenge } = schedule.info {
                    self.send_sub_child_parent_response(deps, child_ext, &challenge);
                }
            }
            _ => {}
        }
    }

    /// Multicast Data Response carrying the current leader data and
    /// network data to neighbors that asked.
    fn send_multicast_data_response<C: Crypto, R: Random, N: NetworkDataStore, S: SettingsStore>(
        &mut self,
        deps: &mut MleDeps<'_, C, R, N, S>,
    ) {
        if !self.is_attached() {
            return;
        }

        let network_data = deps.net_data.network_data(!self.device_mode.full_network_data());
        let mut message = MleMessage::new(Command::DataResponse);
        message
            .append_source_address(self.rloc16)
            .append_leader_data(&self.leader_data)
            .append_network_data(&network_data);
        if let Some(ts) = deps.net_data.active_timestamp() {
            message.append_active_timestamp(ts);
        }
        if let Some(ts) = deps.net_data.pending_timestamp() {
            message.append_pending_timestamp(ts);
        }

        self.finalize(deps.crypto, message, Ip6Address::LINK_LOCAL_ALL_NODES, None);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DefaultConfig;
    use crate::traits::test_impls::{MockCrypto, MockNetworkData, MockRandom, MockSettings};

    pub(crate) struct TestEnv {
        pub crypto: MockCrypto,
        pub rng: MockRandom,
        pub net_data: MockNetworkData,
        pub settings: MockSettings,
        pub now: Timestamp,
    }

    impl TestEnv {
        pub fn new() -> Self {
            TestEnv {
                crypto: MockCrypto::new(),
                rng: MockRandom::with_seed(7),
                net_data: MockNetworkData::new(),
                settings: MockSettings::new(),
                now: Timestamp::from_secs(10),
            }
        }

        pub fn deps(&mut self) -> MleDeps<'_, MockCrypto, MockRandom, MockNetworkData, MockSettings> {
            MleDeps {
                crypto: &self.crypto,
                rng: &mut self.rng,
                net_data: &mut self.net_data,
                settings: &mut self.settings,
                now: self.now,
            }
        }

        pub fn advance(&mut self, d: Duration) {
            self.now = self.now + d;
        }
    }

    pub(crate) const PARENT_EXT: ExtAddress = ExtAddress([0xa0, 1, 2, 3, 4, 5, 6, 7]);
    pub(crate) const OWN_EXT: ExtAddress = ExtAddress([0xb0, 1, 2, 3, 4, 5, 6, 8]);

    pub(crate) fn new_mle() -> Mle<DefaultConfig> {
        let mut mle = Mle::new(OWN_EXT);
        mle.device_mode = DeviceMode::new(false, false, true);
        mle.enable().unwrap();
        mle
    }

    fn parent_source() -> Ip6Address {
        Ip6Address::link_local(&PARENT_EXT)
    }

    pub(crate) fn run_until_parent_request(mle: &mut Mle<DefaultConfig>, env: &mut TestEnv) {
        let mut deps = env.deps();
        mle.start(&mut deps, StartMode::Normal).unwrap();
        // Drive the attach timer through Start into ParentRequest.
        for _ in 0..4 {
            if mle.attach_state() == AttachState::ParentRequest {
                break;
            }
            let fire = mle.next_fire_time().expect("attach timer armed");
            env.now = fire;
            let mut deps = env.deps();
            mle.handle_timer(&mut deps);
        }
        assert_eq!(mle.attach_state(), AttachState::ParentRequest);
    }

    /// Build a secured Parent Response from the scripted parent.
    pub(crate) fn build_parent_response(
        env: &mut TestEnv,
        mle: &Mle<DefaultConfig>,
        rloc16: Rloc16,
        connectivity: Connectivity,
        frame_counter: u32,
    ) -> Vec<u8> {
        let mut msg = MleMessage::new(Command::ParentResponse);
        msg.append_source_address(rloc16)
            .append_version()
            .append_response(&mle.parent_request_challenge)
            .append_leader_data(&LeaderData {
                partition_id: 0x11223344,
                weighting: 64,
                data_version: 10,
                stable_data_version: 10,
                leader_router_id: 27,
            })
            .append_link_margin(40)
            .append_connectivity(&connectivity)
            .append_link_frame_counter(0)
            .append_mle_frame_counter(0)
            .append_challenge(&[0xc1; 8])
            .append_csl_accuracy(&CslAccuracy {
                clock_accuracy_ppm: 20,
                uncertainty: 10,
            });
        msg.secure(
            &env.crypto,
            0,
            frame_counter,
            &parent_source(),
            &mle.link_local_source(),
        )
    }

    pub(crate) fn build_child_id_response(
        env: &mut TestEnv,
        mle: &Mle<DefaultConfig>,
        source_rloc: Rloc16,
        child_rloc: Rloc16,
        frame_counter: u32,
    ) -> Vec<u8> {
        let mut msg = MleMessage::new(Command::ChildIdResponse);
        msg.append_source_address(source_rloc)
            .append_address16(child_rloc)
            .append_leader_data(&LeaderData {
                partition_id: 0x11223344,
                weighting: 64,
                data_version: 10,
                stable_data_version: 10,
                leader_router_id: 27,
            })
            .append_network_data(&[0xde, 0xad]);
        msg.secure(
            &env.crypto,
            0,
            frame_counter,
            &parent_source(),
            &mle.link_local_source(),
        )
    }

    pub(crate) fn attach_as_child(mle: &mut Mle<DefaultConfig>, env: &mut TestEnv) {
        run_until_parent_request(mle, env);

        let response = build_parent_response(
            env,
            mle,
            Rloc16(0x6c00),
            Connectivity {
                link_quality_3: 1,
                ..Default::default()
            },
            1,
        );
        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            parent_source(),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &response,
            Some(-60),
        )
        .unwrap();

        // Wait out the parent-request window; candidate gets accepted.
        let fire = mle.next_fire_time().unwrap();
        env.now = fire;
        let mut deps = env.deps();
        mle.handle_timer(&mut deps);
        assert_eq!(mle.attach_state(), AttachState::ChildIdRequest);

        let response = build_child_id_response(env, mle, Rloc16(0x6c00), Rloc16(0x6c01), 2);
        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            parent_source(),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &response,
            Some(-60),
        )
        .unwrap();
    }

    #[test]
    fn test_fresh_attach_reaches_child_role() {
        let mut env = TestEnv::new();
        let mut mle = new_mle();

        run_until_parent_request(&mut mle, &mut env);

        // First Parent Request goes router-only.
        let tx = mle.take_pending_tx();
        let request = tx
            .iter()
            .find(|t| t.command == Command::ParentRequest)
            .expect("parent request sent");
        assert_eq!(request.destination, Ip6Address::LINK_LOCAL_ALL_ROUTERS);
        let parsed = codec::parse(
            &env.crypto,
            &request.bytes,
            &mle.link_local_source(),
            &Ip6Address::LINK_LOCAL_ALL_ROUTERS,
        )
        .unwrap();
        assert_eq!(
            wire::read_u8_tlv(&parsed.tlvs, TlvType::ScanMask).unwrap(),
            SCAN_MASK_ROUTER
        );

        attach_as_child(&mut mle, &mut env);

        assert_eq!(mle.role(), DeviceRole::Child);
        assert_eq!(mle.rloc16, Rloc16(0x6c01));
        assert_eq!(mle.parent_rloc16(), Rloc16(0x6c00));
        assert!(mle
            .take_pending_events()
            .iter()
            .any(|e| matches!(e, Event::RoleChanged { role: DeviceRole::Child })));
    }

    #[test]
    fn test_parent_response_with_wrong_challenge_rejected() {
        let mut env = TestEnv::new();
        let mut mle = new_mle();
        run_until_parent_request(&mut mle, &mut env);

        let mut msg = MleMessage::new(Command::ParentResponse);
        msg.append_source_address(Rloc16(0x6c00))
            .append_version()
            .append_response(&[0u8; 8]); // not our challenge
        let bytes = msg.secure(&env.crypto, 0, 1, &parent_source(), &mle.link_local_source());

        let mut deps = env.deps();
        let err = mle
            .handle_udp(
                &mut deps,
                parent_source(),
                mle.link_local_source(),
                MLE_HOP_LIMIT,
                &bytes,
                None,
            )
            .unwrap_err();
        assert_eq!(err, Error::Security);
        assert!(!mle.parent_candidate.is_state_parent_response());
    }

    #[test]
    fn test_wrong_hop_limit_dropped() {
        let mut env = TestEnv::new();
        let mut mle = new_mle();
        let mut deps = env.deps();
        let err = mle
            .handle_udp(
                &mut deps,
                parent_source(),
                mle.link_local_source(),
                64,
                &[0u8; 8],
                None,
            )
            .unwrap_err();
        assert_eq!(err, Error::Parse);
    }

    #[test]
    fn test_candidate_ranking_prefers_better_link() {
        let mut env = TestEnv::new();
        let mut mle = new_mle();
        run_until_parent_request(&mut mle, &mut env);

        // First response: weak margin parent.
        let weak = build_parent_response(
            &mut env,
            &mle,
            Rloc16(0x5000),
            Connectivity {
                link_quality_3: 1,
                ..Default::default()
            },
            1,
        );
        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            Ip6Address::link_local(&ExtAddress([0x50; 8])),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &weak,
            Some(-95), // margin 5: quality one
        )
        .unwrap();
        assert_eq!(mle.parent_candidate.parent.peer.rloc16, Rloc16(0x5000));

        // Second response: strong margin parent replaces it.
        let strong = build_parent_response(
            &mut env,
            &mle,
            Rloc16(0x6c00),
            Connectivity {
                link_quality_3: 2,
                ..Default::default()
            },
            1,
        );
        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            parent_source(),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &strong,
            Some(-60),
        )
        .unwrap();
        assert_eq!(mle.parent_candidate.parent.peer.rloc16, Rloc16(0x6c00));

        // A worse one afterwards does not replace it.
        let worse = build_parent_response(
            &mut env,
            &mle,
            Rloc16(0x7000),
            Connectivity::default(),
            1,
        );
        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            Ip6Address::link_local(&ExtAddress([0x70; 8])),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &worse,
            Some(-95),
        )
        .unwrap();
        assert_eq!(mle.parent_candidate.parent.peer.rloc16, Rloc16(0x6c00));
    }

    #[test]
    fn test_frame_counter_monotonicity() {
        let mut env = TestEnv::new();
        let mut mle = new_mle();
        attach_as_child(&mut mle, &mut env);
        mle.take_pending_tx();

        let make_advertisement = |env: &mut TestEnv, mle: &Mle<DefaultConfig>, counter: u32| {
            let mut msg = MleMessage::new(Command::Advertisement);
            msg.append_source_address(Rloc16(0x6c00))
                .append_leader_data(&LeaderData {
                    partition_id: 0x11223344,
                    weighting: 64,
                    data_version: 10,
                    stable_data_version: 10,
                    leader_router_id: 27,
                });
            msg.secure(&env.crypto, 0, counter, &parent_source(), &mle.link_local_source())
        };

        // Counter 10 accepted.
        let bytes = make_advertisement(&mut env, &mle, 10);
        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            parent_source(),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &bytes,
            Some(-60),
        )
        .unwrap();
        assert_eq!(mle.parent.peer.mle_frame_counter, 11);

        // Replay of 10 is dropped as a duplicate.
        let bytes = make_advertisement(&mut env, &mle, 10);
        let mut deps = env.deps();
        let result = mle.handle_udp(
            &mut deps,
            parent_source(),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &bytes,
            Some(-60),
        );
        // One-off duplicate: dropped silently with link info update.
        assert_eq!(result, Ok(()));
        assert_eq!(mle.parent.peer.mle_frame_counter, 11);

        // An older counter is a duplicate error.
        let bytes = make_advertisement(&mut env, &mle, 5);
        let mut deps = env.deps();
        assert_eq!(
            mle.handle_udp(
                &mut deps,
                parent_source(),
                mle.link_local_source(),
                MLE_HOP_LIMIT,
                &bytes,
                Some(-60),
            ),
            Err(Error::Duplicated)
        );

        // A newer counter advances the window.
        let bytes = make_advertisement(&mut env, &mle, 12);
        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            parent_source(),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &bytes,
            Some(-60),
        )
        .unwrap();
        assert_eq!(mle.parent.peer.mle_frame_counter, 13);
    }

    #[test]
    fn test_key_sequence_jump_triggers_link_reestablish() {
        let mut env = TestEnv::new();
        let mut mle = new_mle();
        attach_as_child(&mut mle, &mut env);
        mle.take_pending_tx();

        // Advertisement from parent with key sequence current+5.
        let mut msg = MleMessage::new(Command::Advertisement);
        msg.append_source_address(Rloc16(0x6c00))
            .append_leader_data(&LeaderData {
                partition_id: 0x11223344,
                weighting: 64,
                data_version: 10,
                stable_data_version: 10,
                leader_router_id: 27,
            });
        let bytes = msg.secure(
            &env.crypto,
            mle.key_sequence + 5,
            0,
            &parent_source(),
            &mle.link_local_source(),
        );

        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            parent_source(),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &bytes,
            Some(-60),
        )
        .unwrap();

        // Key sequence NOT adopted (peer class, jump > 1), but a fresh
        // challenge goes to the parent.
        assert_eq!(mle.key_sequence, 0);
        let tx = mle.take_pending_tx();
        let cur = tx
            .iter()
            .find(|t| t.command == Command::ChildUpdateRequest)
            .expect("child update request emitted");
        let parsed = codec::parse(
            &env.crypto,
            &cur.bytes,
            &mle.link_local_source(),
            &parent_source(),
        )
        .unwrap();
        assert!(wire::contains_tlv(&parsed.tlvs, TlvType::Challenge));
    }

    #[test]
    fn test_key_sequence_plus_one_adopted_from_valid_peer() {
        let mut env = TestEnv::new();
        let mut mle = new_mle();
        attach_as_child(&mut mle, &mut env);

        let mut msg = MleMessage::new(Command::Advertisement);
        msg.append_source_address(Rloc16(0x6c00))
            .append_leader_data(&LeaderData {
                partition_id: 0x11223344,
                weighting: 64,
                data_version: 10,
                stable_data_version: 10,
                leader_router_id: 27,
            });
        let bytes = msg.secure(
            &env.crypto,
            1,
            0,
            &parent_source(),
            &mle.link_local_source(),
        );

        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            parent_source(),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &bytes,
            Some(-60),
        )
        .unwrap();
        assert_eq!(mle.key_sequence, 1);
        assert!(mle
            .take_pending_events()
            .iter()
            .any(|e| matches!(e, Event::KeySequenceChanged { key_sequence: 1 })));
    }

    #[test]
    fn test_graceful_detach_on_response() {
        let mut env = TestEnv::new();
        let mut mle = new_mle();
        attach_as_child(&mut mle, &mut env);
        mle.take_pending_tx();

        use core::sync::atomic::{AtomicUsize, Ordering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        CALLS.store(0, Ordering::SeqCst);

        let mut deps = env.deps();
        mle.detach_gracefully(
            &mut deps,
            Box::new(|| {
                CALLS.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        // Zero-timeout Child Update Request was sent.
        let tx = mle.take_pending_tx();
        let cur = tx
            .iter()
            .find(|t| t.command == Command::ChildUpdateRequest)
            .unwrap();
        let parsed = codec::parse(
            &env.crypto,
            &cur.bytes,
            &mle.link_local_source(),
            &parent_source(),
        )
        .unwrap();
        assert_eq!(wire::read_u32_tlv(&parsed.tlvs, TlvType::Timeout).unwrap(), 0);

        // Parent answers 120 ms later with a matching response.
        env.advance(Duration::from_millis(120));
        let mut msg = MleMessage::new(Command::ChildUpdateResponse);
        msg.append_source_address(Rloc16(0x6c00))
            .append_mode(mle.device_mode.bits())
            .append_leader_data(&LeaderData {
                partition_id: 0x11223344,
                weighting: 64,
                data_version: 10,
                stable_data_version: 10,
                leader_router_id: 27,
            })
            .append_timeout(0);
        let bytes = msg.secure(&env.crypto, 0, 3, &parent_source(), &mle.link_local_source());

        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            parent_source(),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &bytes,
            Some(-60),
        )
        .unwrap();

        assert_eq!(mle.role(), DeviceRole::Disabled);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        // Later timer ticks never re-run the callback.
        env.advance(DETACH_GRACEFULLY_TIMEOUT * 2);
        let mut deps = env.deps();
        mle.handle_timer(&mut deps);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_graceful_detach_on_timeout() {
        let mut env = TestEnv::new();
        let mut mle = new_mle();
        attach_as_child(&mut mle, &mut env);

        use core::sync::atomic::{AtomicUsize, Ordering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        CALLS.store(0, Ordering::SeqCst);

        let mut deps = env.deps();
        mle.detach_gracefully(
            &mut deps,
            Box::new(|| {
                CALLS.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        // Second request while detaching is refused.
        let mut deps = env.deps();
        assert_eq!(
            mle.detach_gracefully(&mut deps, Box::new(|| {})),
            Err(Error::Busy)
        );

        env.advance(DETACH_GRACEFULLY_TIMEOUT);
        let mut deps = env.deps();
        mle.handle_timer(&mut deps);

        assert_eq!(mle.role(), DeviceRole::Disabled);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retx_exhaustion_detaches() {
        let mut env = TestEnv::new();
        let mut mle = new_mle();
        mle.device_mode = DeviceMode::new(true, false, true); // rx-on: keep-alive runs
        attach_as_child(&mut mle, &mut env);
        mle.take_pending_tx();

        // Fire keep-alive then exhaust every retry.
        for _ in 0..16 {
            if mle.role() != DeviceRole::Child {
                break;
            }
            let Some(fire) = mle.retx.next_fire_time() else {
                break;
            };
            env.now = fire;
            let mut deps = env.deps();
            mle.handle_timer(&mut deps);
        }

        assert_eq!(mle.role(), DeviceRole::Detached);
    }

    #[test]
    fn test_advertisement_with_newer_data_schedules_request() {
        let mut env = TestEnv::new();
        let mut mle = new_mle();
        attach_as_child(&mut mle, &mut env);
        mle.take_pending_tx();

        let mut msg = MleMessage::new(Command::Advertisement);
        msg.append_source_address(Rloc16(0x6c00))
            .append_leader_data(&LeaderData {
                partition_id: 0x11223344,
                weighting: 64,
                data_version: 11, // newer than the stored 10
                stable_data_version: 11,
                leader_router_id: 27,
            });
        let bytes = msg.secure(&env.crypto, 0, 40, &parent_source(), &mle.link_local_source());

        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            parent_source(),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &bytes,
            Some(-60),
        )
        .unwrap();

        assert!(mle
            .delayed
            .has_matching(ScheduleType::DataRequest, &parent_source()));

        // Executing it emits a Data Request with a TLV Request TLV.
        env.advance(MAX_RESPONSE_DELAY * 2);
        let mut deps = env.deps();
        mle.handle_timer(&mut deps);
        let tx = mle.take_pending_tx();
        assert!(tx.iter().any(|t| t.command == Command::DataRequest));
    }

    #[test]
    fn test_stale_parent_advertisement_detaches() {
        let mut env = TestEnv::new();
        let mut mle = new_mle();
        attach_as_child(&mut mle, &mut env);

        // Parent advertises under a different RLOC16.
        let mut msg = MleMessage::new(Command::Advertisement);
        msg.append_source_address(Rloc16(0x7000))
            .append_leader_data(&LeaderData {
                partition_id: 0x11223344,
                weighting: 64,
                data_version: 10,
                stable_data_version: 10,
                leader_router_id: 27,
            });
        let bytes = msg.secure(&env.crypto, 0, 50, &parent_source(), &mle.link_local_source());

        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            parent_source(),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &bytes,
            Some(-60),
        )
        .unwrap();

        assert_eq!(mle.role(), DeviceRole::Detached);
    }

    #[test]
    fn test_attach_cycle_falls_back_to_pending_dataset() {
        let mut env = TestEnv::new();
        env.net_data.active_timestamp = Some(100);
        env.net_data.pending_timestamp = Some(200);

        let mut mle = new_mle();
        run_until_parent_request(&mut mle, &mut env);
        assert_eq!(mle.reattach_state, ReattachState::Active);

        // Let every parent request time out with no response.
        for _ in 0..8 {
            let Some(fire) = mle.next_fire_time() else {
                break;
            };
            env.now = fire;
            let mut deps = env.deps();
            mle.handle_timer(&mut deps);
            if mle.reattach_state == ReattachState::Pending {
                break;
            }
        }

        assert_eq!(mle.reattach_state, ReattachState::Pending);
        assert!(env.net_data.restore_log.contains(&"pending"));
    }

    #[test]
    fn test_become_child_busy_while_attaching() {
        let mut env = TestEnv::new();
        let mut mle = new_mle();
        run_until_parent_request(&mut mle, &mut env);
        assert_eq!(
            mle.become_child(&mut env.rng, env.now),
            Err(Error::Busy)
        );
    }

    #[test]
    fn test_disabled_rejects_operations() {
        let mut env = TestEnv::new();
        let mut mle: Mle<DefaultConfig> = Mle::new(OWN_EXT);
        assert_eq!(mle.become_child(&mut env.rng, env.now), Err(Error::InvalidState));
        let mut deps = env.deps();
        assert_eq!(mle.start(&mut deps, StartMode::Normal), Err(Error::InvalidState));
        assert_eq!(mle.parent_info(), Err(Error::InvalidState));
    }

    #[test]
    fn test_restore_attempts_child_update_to_stored_parent() {
        let mut env = TestEnv::new();

        // Persist a previous child role.
        crate::settings::store(
            &mut env.settings,
            &crate::settings::NetworkInfo {
                role: DeviceRole::Child,
                device_mode: DeviceMode::new(false, false, true),
                rloc16: Rloc16(0x6c01),
                key_sequence: 3,
                mle_frame_counter: 5000,
                ext_address: OWN_EXT,
            },
            Some(&crate::settings::ParentInfo {
                ext_address: PARENT_EXT,
                version: 4,
            }),
        );

        let mut mle = new_mle();
        let mut deps = env.deps();
        mle.start(&mut deps, StartMode::Normal).unwrap();

        assert_eq!(mle.key_sequence, 3);
        assert_eq!(mle.parent.peer.state, LinkState::Restored);
        let tx = mle.take_pending_tx();
        let cur = tx
            .iter()
            .find(|t| t.command == Command::ChildUpdateRequest)
            .expect("restore sends child update request");
        // Secured with the restored (advanced) frame counter.
        let parsed = codec::parse(
            &env.crypto,
            &cur.bytes,
            &mle.link_local_source(),
            &parent_source(),
        )
        .unwrap();
        assert!(parsed.frame_counter >= 5000);
        assert!(wire::contains_tlv(&parsed.tlvs, TlvType::Challenge));
    }

    #[test]
    fn test_announce_with_newer_timestamp_defers_attach() {
        let mut env = TestEnv::new();
        env.net_data.active_timestamp = Some(100);
        let mut mle = new_mle();
        attach_as_child(&mut mle, &mut env);
        mle.take_pending_tx();

        let mut msg = MleMessage::new(Command::Announce);
        msg.append_channel(17)
            .append_active_timestamp(500)
            .append_pan_id(0xbeef);
        let bytes = msg.secure(&env.crypto, 0, 60, &parent_source(), &mle.link_local_source());

        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            parent_source(),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &bytes,
            Some(-60),
        )
        .unwrap();

        assert_eq!(mle.announce.state, AnnounceAttachState::ToAnnounceAttach);

        env.advance(ANNOUNCE_PROCESS_TIMEOUT);
        let mut deps = env.deps();
        mle.handle_timer(&mut deps);

        // Device switched to the announced channel/PAN and is attaching.
        assert_eq!(mle.pan_channel, 17);
        assert_eq!(mle.pan_id, 0xbeef);
        assert_eq!(mle.announce.state, AnnounceAttachState::AnnounceAttaching);
        assert!(mle.is_attaching() || mle.attach_timer.is_some());
    }

    #[test]
    fn test_announce_with_older_timestamp_answered() {
        let mut env = TestEnv::new();
        env.net_data.active_timestamp = Some(100);
        let mut mle = new_mle();
        attach_as_child(&mut mle, &mut env);
        mle.take_pending_tx();

        let mut msg = MleMessage::new(Command::Announce);
        msg.append_channel(17)
            .append_active_timestamp(50)
            .append_pan_id(0xbeef);
        let bytes = msg.secure(&env.crypto, 0, 61, &parent_source(), &mle.link_local_source());

        let mut deps = env.deps();
        mle.handle_udp(
            &mut deps,
            parent_source(),
            mle.link_local_source(),
            MLE_HOP_LIMIT,
            &bytes,
            Some(-60),
        )
        .unwrap();

        let tx = mle.take_pending_tx();
        let announce = tx.iter().find(|t| t.command == Command::Announce).unwrap();
        assert_eq!(announce.channel, Some(17));
    }
}
