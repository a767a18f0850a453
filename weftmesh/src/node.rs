//! Node: the single owner of all protocol state.
//!
//! The node wires the MLE core, the neighbor tables, the send queue,
//! and the indirect/CSL machinery to the platform traits. It is fully
//! poll-driven: radio events and timer ticks enter through `handle_*`
//! methods that run to completion; the async [`Node::run`] loop is a
//! thin driver over the same handlers.
//!
//! Simulation and tests call the handlers directly.

use alloc::vec::Vec;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;

use crate::config::{DefaultConfig, NodeConfig};
use crate::csl_rx::{CslPeerKind, CslReceiver, WindowEdges};
use crate::csl_tx::{CslSentOutcome, CslTarget, CslTxScheduler};
use crate::indirect::{FrameChange, FrameComposer, IndirectSender, PreparedFrame};
use crate::mle::{Mle, MleDeps, MleTransmit, NeighborRef};
use crate::queue::{Ip6Info, MessageKind, SendQueue};
use crate::time::{Duration, Timestamp, TimestampUs};
use crate::traits::{Clock, Crypto, MacAddress, NetworkDataStore, Radio, Random, SettingsStore, TxFrame, TxStatus};
use crate::types::{Error, Event, ExtAddress, Ip6Address, StateFilter};

/// Depth of the application event channel.
const EVENT_QUEUE_DEPTH: usize = 16;
/// Depth of the ingress channel feeding the async driver loop.
const INGRESS_QUEUE_DEPTH: usize = 8;

/// One received MLE datagram, as queued for the async driver.
#[derive(Clone, Debug)]
pub struct IngressDatagram {
    pub source: Ip6Address,
    pub destination: Ip6Address,
    pub hop_limit: u8,
    pub bytes: Vec<u8>,
    pub rss: Option<i8>,
}

/// Event channel type exposed to the application.
pub type EventChannel = Channel<NoopRawMutex, Event, EVENT_QUEUE_DEPTH>;
/// Ingress channel type feeding [`Node::run`].
pub type IngressChannel = Channel<NoopRawMutex, IngressDatagram, INGRESS_QUEUE_DEPTH>;

/// Millisecond clock with an async wait, for the driver loop.
pub trait AsyncClock: Clock {
    /// Resolve at (or after) `deadline`.
    fn sleep_until(&self, deadline: Timestamp) -> impl core::future::Future<Output = ()>;
}

/// The protocol node.
///
/// Generic over the platform:
/// - `R`: radio driver
/// - `C`: crypto (AES-CCM + key schedule)
/// - `Rn`: random source
/// - `Clk`: millisecond clock
/// - `N`: network data / dataset store
/// - `S`: non-volatile settings
/// - `F`: frame composer (6LoWPAN seam)
/// - `Cfg`: memory configuration
pub struct Node<R, C, Rn, Clk, N, S, F, Cfg: NodeConfig = DefaultConfig> {
    radio: R,
    crypto: C,
    random: Rn,
    clock: Clk,
    net_data: N,
    settings: S,
    composer: F,

    pub mle: Mle<Cfg>,
    pub send_queue: SendQueue,
    pub indirect: IndirectSender,
    pub csl_tx: CslTxScheduler,
    pub csl_rx: CslReceiver,

    events: EventChannel,
    ingress: IngressChannel,

    /// Child currently served a poll-triggered transmission.
    active_poll_child: Option<(usize, u16)>,
    /// CSL transmission handed to the radio, with its frame context.
    active_csl_tx: Option<(CslTarget, u16)>,
    /// Next firing of the CSL receive timer, radio clock.
    csl_rx_next_fire: Option<TimestampUs>,
}

/// Builds the dependency bundle without borrowing all of `self`.
macro_rules! mle_deps {
    ($self:ident, $now:expr) => {
        MleDeps {
            crypto: &$self.crypto,
            rng: &mut $self.random,
            net_data: &mut $self.net_data,
            settings: &mut $self.settings,
            now: $now,
        }
    };
}

impl<R, C, Rn, Clk, N, S, F, Cfg> Node<R, C, Rn, Clk, N, S, F, Cfg>
where
    R: Radio,
    C: Crypto,
    Rn: Random,
    Clk: Clock,
    N: NetworkDataStore,
    S: SettingsStore,
    F: FrameComposer,
    Cfg: NodeConfig,
{
    pub fn new(
        radio: R,
        crypto: C,
        random: Rn,
        clock: Clk,
        net_data: N,
        settings: S,
        composer: F,
        ext_address: ExtAddress,
    ) -> Self {
        let mut mle = Mle::new(ext_address);
        mle.own_csl_accuracy = crate::types::CslAccuracy {
            clock_accuracy_ppm: radio.csl_accuracy_ppm(),
            uncertainty: radio.csl_uncertainty(),
        };

        let mut csl_tx = CslTxScheduler::new();
        csl_tx.init_frame_request_ahead(radio.bus_speed_hz(), radio.bus_latency_us());

        Node {
            radio,
            crypto,
            random,
            clock,
            net_data,
            settings,
            composer,
            mle,
            send_queue: SendQueue::new(Cfg::MAX_SEND_QUEUE_MESSAGES),
            indirect: IndirectSender::new(),
            csl_tx,
            csl_rx: CslReceiver::new(),
            events: Channel::new(),
            ingress: Channel::new(),
            active_poll_child: None,
            active_csl_tx: None,
            csl_rx_next_fire: None,
        }
    }

    /// Application event channel (pull model).
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Ingress channel for the async driver loop.
    pub fn ingress(&self) -> &IngressChannel {
        &self.ingress
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn clock(&self) -> &Clk {
        &self.clock
    }

    /// Current time from the owned clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Bring the node up and start attaching.
    pub fn start(&mut self) -> Result<(), Error> {
        let now = self.clock.now();
        match self.mle.enable() {
            Ok(()) | Err(Error::Already) => {}
            Err(e) => return Err(e),
        }
        self.indirect.start();
        let result = {
            let mut deps = mle_deps!(self, now);
            self.mle.start(&mut deps, crate::mle::StartMode::Normal)
        };
        self.flush(now);
        result
    }

    /// Gracefully detach; `callback` runs exactly once, on the parent's
    /// response or on timeout.
    pub fn detach_gracefully(
        &mut self,
        callback: alloc::boxed::Box<dyn FnOnce() + Send>,
    ) -> Result<(), Error> {
        let now = self.clock.now();
        let result = {
            let mut deps = mle_deps!(self, now);
            self.mle.detach_gracefully(&mut deps, callback)
        };
        self.flush(now);
        result
    }

    /// Stop the node and release every queue and schedule.
    pub fn stop(&mut self) {
        let now = self.clock.now();
        {
            let mut deps = mle_deps!(self, now);
            self.mle.stop(&mut deps, crate::mle::StopMode::KeepDatasets);
        }
        self.indirect.stop(&mut self.mle.child_table, &mut self.send_queue);
        self.active_poll_child = None;
        self.active_csl_tx = None;
        self.flush(now);
    }

    // --- Ingress -------------------------------------------------------

    /// Process one received MLE UDP datagram.
    pub fn handle_mle_rx(
        &mut self,
        source: Ip6Address,
        destination: Ip6Address,
        hop_limit: u8,
        bytes: &[u8],
        rss: Option<i8>,
        now: Timestamp,
    ) -> Result<(), Error> {
        let result = {
            let mut deps = mle_deps!(self, now);
            self.mle
                .handle_udp(&mut deps, source, destination, hop_limit, bytes, rss)
        };
        self.flush(now);
        result
    }

    /// Millisecond timer tick.
    pub fn handle_timer(&mut self, now: Timestamp) {
        {
            let mut deps = mle_deps!(self, now);
            self.mle.handle_timer(&mut deps);
        }
        self.flush(now);
    }

    /// Earliest deadline any owned timer needs a tick for.
    pub fn next_fire_time(&self) -> Option<Timestamp> {
        self.mle.next_fire_time()
    }

    /// A data poll arrived from a sleepy child: answer it.
    pub fn handle_data_poll(&mut self, src: ExtAddress, timestamp_us: TimestampUs, now: Timestamp) {
        let Some(index) = self.mle.child_table.index_of(src) else {
            return;
        };

        {
            let child = self.mle.child_table.at_mut(index).unwrap();
            child.peer.last_heard = now;
            // The poll timestamp re-anchors the child's CSL phase.
            child.peer.csl.last_rx_timestamp = timestamp_us;
        }

        let own_mac = MacAddress::Short(self.mle.rloc16);
        match self.indirect.prepare_frame_for_child(
            &mut self.mle.child_table,
            &self.send_queue,
            &mut self.composer,
            index,
            own_mac,
        ) {
            Ok(PreparedFrame {
                frame,
                message_next_offset,
            }) => {
                let _ = self.radio.send(&frame);
                self.active_poll_child = Some((index, message_next_offset));
            }
            Err(_) => {}
        }
    }

    /// The radio finished a transmission.
    pub fn handle_tx_done(&mut self, frame: &TxFrame, status: TxStatus, now: Timestamp) {
        // CSL sync points come from acked frames carrying a CSL IE.
        if let TxStatus::Ok {
            acked_with_csl_ie,
            timestamp_us,
        } = status
        {
            if let Some(nref) = self.frame_neighbor(frame) {
                let peer = self.mle.peer_mut(nref);
                crate::csl_rx::update_last_sync_on_tx(peer, acked_with_csl_ie, timestamp_us);
            }
        }

        if let Some((index, next_offset)) = self.active_poll_child.take() {
            self.indirect.handle_poll_sent_frame(
                &mut self.mle.child_table,
                &mut self.send_queue,
                index,
                frame,
                status,
                next_offset,
            );
            self.reschedule_csl_tx();
            self.flush(now);
            return;
        }

        if let Some((target, next_offset)) = self.active_csl_tx.take() {
            self.finish_csl_tx(target, frame, status, next_offset);
            self.flush(now);
            return;
        }

        self.flush(now);
    }

    /// A frame was received and acknowledged by us; update CSL sync.
    pub fn handle_frame_rx(
        &mut self,
        src: ExtAddress,
        acked_with_sec_enh_ack: bool,
        timestamp_us: TimestampUs,
        now: Timestamp,
    ) {
        if let Some(nref) = self.mle.find_neighbor(src) {
            let peer = self.mle.peer_mut(nref);
            crate::csl_rx::update_last_sync_on_rx(peer, acked_with_sec_enh_ack, timestamp_us);
            peer.last_heard = now;
        }
    }

    /// The CSL receive timer fired.
    pub fn handle_csl_rx_timer(&mut self) {
        if !self.csl_rx.is_enabled() {
            self.csl_rx_next_fire = None;
            return;
        }
        let edges = self.rx_window_edges();
        let next = self.csl_rx.handle_timer(&mut self.radio, edges);
        self.csl_rx_next_fire = Some(next);
    }

    /// Next firing of the CSL receive timer, radio clock.
    pub fn csl_rx_next_fire(&self) -> Option<TimestampUs> {
        self.csl_rx_next_fire
    }

    /// Reconfigure own CSL sampling (period in ten-symbol units).
    pub fn configure_csl(&mut self, period: u16, channel: u8) {
        self.mle.csl_enabled = period > 0;
        self.mle.csl_period = period;
        self.mle.csl_channel = channel;
        if self.csl_rx.configure(&mut self.radio, period, channel) {
            self.handle_csl_rx_timer();
        }
    }

    // --- Outbound ------------------------------------------------------

    /// Queue an IPv6 datagram from the forwarding path.
    ///
    /// Messages to a sleepy child go indirect; everything else is sent
    /// directly.
    pub fn enqueue_ip6(&mut self, bytes: Vec<u8>, ip6: Ip6Info, now: Timestamp) -> Result<(), Error> {
        let dest_ext = ip6
            .destination
            .is_link_local()
            .then(|| ip6.destination.ext_address());

        let sleepy_child = dest_ext.and_then(|ext| {
            self.mle.child_table.index_of(ext).filter(|&i| {
                let child = self.mle.child_table.at(i).unwrap();
                child.peer.matches(StateFilter::ValidOrRestoring) && !child.peer.is_rx_on_when_idle()
            })
        });

        let id = self
            .send_queue
            .enqueue(MessageKind::Ip6, bytes, ip6, sleepy_child.is_none())
            .ok_or(Error::NoBufs)?;
        if let Some(ext) = dest_ext {
            if let Some(message) = self.send_queue.get_mut(id) {
                message.dest_ext = Some(ext);
            }
        }

        match sleepy_child {
            Some(index) => {
                let change = self.indirect.add_message(
                    &mut self.mle.child_table,
                    &mut self.send_queue,
                    index,
                    id,
                )?;
                self.apply_frame_change(index, change);
                self.reschedule_csl_tx();
            }
            None => {
                self.transmit_direct(id);
            }
        }
        let _ = now;
        Ok(())
    }

    fn transmit_direct(&mut self, id: crate::queue::MessageId) {
        let Some(message) = self.send_queue.get(id) else {
            return;
        };

        let dst = match message.dest_ext {
            Some(ext) => MacAddress::Extended(ext),
            None => MacAddress::Extended(message.ip6.destination.ext_address()),
        };
        let src = MacAddress::Extended(self.mle.ext_address);

        let mut frame = TxFrame::default();
        let mut offset = 0;
        loop {
            let Some(message) = self.send_queue.get(id) else {
                break;
            };
            let next = self
                .composer
                .prepare_data_frame(&mut frame, message, src, dst, offset);
            let _ = self.radio.send(&frame);
            if next as usize >= message.len() {
                break;
            }
            offset = next;
        }

        if let Some(message) = self.send_queue.get_mut(id) {
            message.direct_tx = false;
        }
        self.send_queue.free_if_idle(id);
    }

    // --- Internal plumbing ---------------------------------------------

    /// Drain every output the MLE core produced during a handler.
    fn flush(&mut self, now: Timestamp) {
        // Pending transmissions.
        let transmits = self.mle.take_pending_tx();
        for transmit in transmits {
            self.route_mle_transmit(transmit, now);
        }

        // Notifier events.
        for event in self.mle.take_pending_events() {
            let _ = self.events.try_send(event);
        }

        // Requested indirect purges.
        let purges = core::mem::take(&mut self.mle.pending_child_purges);
        for index in purges {
            self.indirect
                .clear_all(&mut self.mle.child_table, &mut self.send_queue, index);
        }

        // CSL peer set changes.
        if core::mem::take(&mut self.mle.csl_entries_dirty) {
            self.update_csl_entries();
            self.reschedule_csl_tx();
        }
    }

    /// Send one finalized MLE message: direct for rx-on destinations,
    /// indirect for sleepy children.
    fn route_mle_transmit(&mut self, transmit: MleTransmit, now: Timestamp) {
        let MleTransmit {
            destination,
            bytes,
            channel,
            ..
        } = transmit;

        let sleepy_child = destination
            .is_link_local()
            .then(|| destination.ext_address())
            .and_then(|ext| self.mle.child_table.index_of(ext))
            .filter(|&i| {
                let child = self.mle.child_table.at(i).unwrap();
                !child.peer.is_rx_on_when_idle()
                    && child.peer.matches(StateFilter::AnyExceptInvalid)
            });

        let ip6 = Ip6Info {
            source: self.mle.link_local_source(),
            destination,
        };

        match sleepy_child {
            Some(index) => {
                if let Some(id) =
                    self.send_queue
                        .enqueue(MessageKind::Ip6, bytes, ip6, false)
                {
                    if let Ok(change) = self.indirect.add_message(
                        &mut self.mle.child_table,
                        &mut self.send_queue,
                        index,
                        id,
                    ) {
                        self.apply_frame_change(index, change);
                    }
                    self.reschedule_csl_tx();
                }
            }
            None => {
                // Direct transmission through the composer.
                let dst = if destination.is_multicast() {
                    MacAddress::None
                } else {
                    MacAddress::Extended(destination.ext_address())
                };
                if let Some(id) = self.send_queue.enqueue(MessageKind::Ip6, bytes, ip6, true) {
                    if let Some(message) = self.send_queue.get_mut(id) {
                        if let MacAddress::Extended(ext) = dst {
                            message.dest_ext = Some(ext);
                        }
                    }
                    if let Some(channel) = channel {
                        // Cross-channel attach traffic goes out as one
                        // frame on the override channel.
                        if let Some(message) = self.send_queue.get(id) {
                            let mut frame = TxFrame::default();
                            let src = MacAddress::Extended(self.mle.ext_address);
                            self.composer
                                .prepare_data_frame(&mut frame, message, src, dst, 0);
                            frame.channel = channel;
                            frame.rx_channel_after_tx = Some(self.mle.pan_channel);
                            let _ = self.radio.send(&frame);
                        }
                        if let Some(message) = self.send_queue.get_mut(id) {
                            message.direct_tx = false;
                        }
                        self.send_queue.free_if_idle(id);
                    } else {
                        self.transmit_direct(id);
                    }
                }
            }
        }
        let _ = now;
    }

    fn apply_frame_change(&mut self, index: usize, change: Option<FrameChange>) {
        // The poll handler has no hardware frame queue in this model;
        // a requested purge or replace completes immediately unless the
        // frame is in flight right now.
        if change.is_some() && self.active_poll_child.map(|(i, _)| i) != Some(index) {
            self.indirect
                .frame_change_done(&mut self.mle.child_table, &mut self.send_queue, index);
        }
    }

    fn frame_neighbor(&self, frame: &TxFrame) -> Option<NeighborRef> {
        match frame.dst {
            MacAddress::Extended(ext) => self.mle.find_neighbor(ext),
            MacAddress::Short(rloc) => {
                if self.mle.parent.peer.rloc16 == rloc {
                    Some(NeighborRef::Parent)
                } else {
                    self.mle
                        .child_table
                        .iterate(StateFilter::AnyExceptInvalid)
                        .find(|(_, c)| c.peer.rloc16 == rloc)
                        .map(|(i, _)| NeighborRef::Child(i))
                }
            }
            MacAddress::None => None,
        }
    }

    /// Rewrite the radio CSL entry tables from the current peer set.
    fn update_csl_entries(&mut self) {
        let mut peers: Vec<&crate::neighbors::Peer> = Vec::new();
        if self.mle.parent.peer.is_state_valid() {
            peers.push(&self.mle.parent.peer);
        }
        if self.mle.parent_candidate.parent.peer.is_state_valid() {
            peers.push(&self.mle.parent_candidate.parent.peer);
        }
        for (_, child) in self.mle.child_table.iterate(StateFilter::SecurityReady) {
            peers.push(&child.peer);
        }
        self.csl_rx.update_radio_entries(&mut self.radio, peers.into_iter());
    }

    fn rx_window_edges(&self) -> WindowEdges {
        let mut peers: Vec<(CslPeerKind, &crate::neighbors::Peer)> = Vec::new();
        if self.mle.parent.peer.is_state_valid() {
            peers.push((CslPeerKind::Parent, &self.mle.parent.peer));
        }
        if self.mle.parent_candidate.parent.peer.is_state_valid() {
            peers.push((CslPeerKind::ParentCandidate, &self.mle.parent_candidate.parent.peer));
        }
        for (_, child) in self.mle.child_table.iterate(StateFilter::Valid) {
            peers.push((CslPeerKind::Child, &child.peer));
        }
        self.csl_rx.window_edges(&self.radio, peers.into_iter())
    }

    /// Re-evaluate the next CSL transmission across all candidates.
    fn reschedule_csl_tx(&mut self) {
        let current_message = self.csl_tx.current_target.and_then(|target| {
            let peer = self.target_peer(target)?;
            peer.indirect.message
        });
        if !self.csl_tx.update(current_message) {
            return;
        }

        let now = self.radio.now_us();
        let timing = {
            let mut candidates: Vec<(CslTarget, &crate::neighbors::Peer)> = Vec::new();
            for (i, child) in self.mle.child_table.iterate(StateFilter::AnyExceptInvalid) {
                candidates.push((CslTarget::Child(i), &child.peer));
            }
            if !self.mle.parent.peer.is_state_invalid() {
                candidates.push((CslTarget::Parent, &self.mle.parent.peer));
            }
            if !self.mle.parent_candidate.parent.peer.is_state_invalid() {
                candidates.push((CslTarget::ParentCandidate, &self.mle.parent_candidate.parent.peer));
            }
            self.csl_tx.reschedule(candidates.into_iter(), now)
        };

        let Some(timing) = timing else {
            return;
        };
        let Some(target) = self.csl_tx.current_target else {
            return;
        };

        // Prepare the frame and hand it to the radio for the window.
        let prepared = match target {
            CslTarget::Child(index) => {
                let own_mac = MacAddress::Short(self.mle.rloc16);
                self.indirect
                    .prepare_frame_for_child(
                        &mut self.mle.child_table,
                        &self.send_queue,
                        &mut self.composer,
                        index,
                        own_mac,
                    )
                    .ok()
            }
            CslTarget::Parent | CslTarget::ParentCandidate => self.prepare_frame_for_parent(target),
        };

        let Some(prepared) = prepared else {
            self.csl_tx.current_target = None;
            return;
        };

        let mut frame = prepared.frame;
        let channel = self
            .target_peer(target)
            .map(|p| p.csl.channel)
            .filter(|c| *c != 0)
            .unwrap_or(self.mle.pan_channel);
        frame.channel = channel;
        frame.csma_enabled = false;

        let message = self.target_peer(target).and_then(|p| p.indirect.message);
        self.csl_tx.frame_started(message);
        self.active_csl_tx = Some((target, prepared.message_next_offset));
        let _ = self.radio.send_at(&frame, timing.window_start);
    }

    /// Frames toward the (sleepy, CSL-synchronized) parent are built
    /// from the direct queue: the sub-child bridge path.
    fn prepare_frame_for_parent(&mut self, target: CslTarget) -> Option<PreparedFrame> {
        let peer = self.target_peer(target)?;
        let ext = peer.ext_address;
        let message_id = peer.indirect.message?;
        let offset = peer.indirect.fragment_offset;

        let message = self.send_queue.get(message_id)?;
        let mut frame = TxFrame::default();
        let src = MacAddress::Extended(self.mle.ext_address);
        let next = self.composer.prepare_data_frame(
            &mut frame,
            message,
            src,
            MacAddress::Extended(ext),
            offset,
        );

        // Retransmission continuity mirrors the child path.
        let peer = self.target_peer(target)?;
        if peer.indirect.tx_attempts > 0 || peer.csl.tx_attempts > 0 {
            frame.is_retransmission = true;
            frame.sequence = peer.indirect.data_sequence_number;
            if frame.security.is_some() {
                frame.security = Some(crate::traits::FrameSecurity {
                    frame_counter: peer.indirect.frame_counter,
                    key_id: peer.indirect.key_id,
                });
            }
        }

        Some(PreparedFrame {
            frame,
            message_next_offset: next,
        })
    }

    fn target_peer(&self, target: CslTarget) -> Option<&crate::neighbors::Peer> {
        match target {
            CslTarget::Child(i) => self.mle.child_table.at(i).map(|c| &c.peer),
            CslTarget::Parent => Some(&self.mle.parent.peer),
            CslTarget::ParentCandidate => Some(&self.mle.parent_candidate.parent.peer),
        }
    }

    fn finish_csl_tx(
        &mut self,
        target: CslTarget,
        frame: &TxFrame,
        status: TxStatus,
        next_offset: u16,
    ) {
        let outcome = match target {
            CslTarget::Child(index) => {
                let Some(child) = self.mle.child_table.at_mut(index) else {
                    return;
                };
                let outcome = self.csl_tx.handle_sent_frame(&mut child.peer, frame, status);
                if outcome == CslSentOutcome::Delivered {
                    self.indirect.handle_sent_frame_to_child(
                        &mut self.mle.child_table,
                        &mut self.send_queue,
                        index,
                        frame,
                        status,
                        next_offset,
                    );
                }
                outcome
            }
            CslTarget::Parent => {
                let outcome =
                    self.csl_tx
                        .handle_sent_frame(&mut self.mle.parent.peer, frame, status);
                if outcome == CslSentOutcome::Delivered {
                    self.complete_parent_message(CslTarget::Parent, next_offset);
                }
                outcome
            }
            CslTarget::ParentCandidate => {
                let outcome = self.csl_tx.handle_sent_frame(
                    &mut self.mle.parent_candidate.parent.peer,
                    frame,
                    status,
                );
                if outcome == CslSentOutcome::Delivered {
                    self.complete_parent_message(CslTarget::ParentCandidate, next_offset);
                }
                outcome
            }
        };

        #[cfg(feature = "debug")]
        if outcome == CslSentOutcome::Desynchronized {
            if let Some(peer) = self.target_peer(target) {
                let rloc16 = peer.rloc16;
                self.mle
                    .emit_debug(crate::debug::DebugEvent::CslDesynchronized { rloc16 });
            }
        }
        #[cfg(not(feature = "debug"))]
        let _ = outcome;

        self.reschedule_csl_tx();
    }

    fn complete_parent_message(&mut self, target: CslTarget, next_offset: u16) {
        let peer = match target {
            CslTarget::Parent => &mut self.mle.parent.peer,
            CslTarget::ParentCandidate => &mut self.mle.parent_candidate.parent.peer,
            CslTarget::Child(_) => return,
        };
        let Some(id) = peer.indirect.message else {
            return;
        };
        let len = self.send_queue.get(id).map(|m| m.len()).unwrap_or(0);
        if (next_offset as usize) < len {
            peer.indirect.fragment_offset = next_offset;
            return;
        }
        peer.indirect.message = None;
        peer.indirect.fragment_offset = 0;
        peer.indirect.queued_count = peer.indirect.queued_count.saturating_sub(1);
        if let Some(m) = self.send_queue.get_mut(id) {
            m.direct_tx = false;
        }
        self.send_queue.free_if_idle(id);
    }
}

impl<R, C, Rn, Clk, N, S, F, Cfg> Node<R, C, Rn, Clk, N, S, F, Cfg>
where
    R: Radio,
    C: Crypto,
    Rn: Random,
    Clk: AsyncClock,
    N: NetworkDataStore,
    S: SettingsStore,
    F: FrameComposer,
    Cfg: NodeConfig,
{
    /// Async driver loop over the poll handlers.
    ///
    /// Waits for either an ingress datagram or the earliest timer
    /// deadline, then runs the matching handler to completion.
    pub async fn run(&mut self) -> ! {
        use embassy_futures::select::{select, Either};

        loop {
            let deadline = self
                .next_fire_time()
                .unwrap_or_else(|| self.clock.now() + Duration::from_secs(60));

            let ingress = &self.ingress;
            let result = select(ingress.receive(), self.clock.sleep_until(deadline)).await;

            match result {
                Either::First(datagram) => {
                    let now = self.clock.now();
                    let _ = self.handle_mle_rx(
                        datagram.source,
                        datagram.destination,
                        datagram.hop_limit,
                        &datagram.bytes,
                        datagram.rss,
                        now,
                    );
                }
                Either::Second(()) => {
                    let now = self.clock.now();
                    self.handle_timer(now);
                }
            }
        }
    }
}

#[cfg(any(test, feature = "std"))]
pub mod test_support {
    //! A minimal frame composer for tests and simulation.

    use super::*;
    use crate::queue::QueuedMessage;

    /// Frames up to `frame_size` payload bytes per call.
    pub struct SimpleComposer {
        pub frame_size: u16,
        next_sequence: u8,
    }

    impl Default for SimpleComposer {
        fn default() -> Self {
            SimpleComposer {
                frame_size: 96,
                next_sequence: 0,
            }
        }
    }

    impl FrameComposer for SimpleComposer {
        fn prepare_data_frame(
            &mut self,
            frame: &mut TxFrame,
            message: &QueuedMessage,
            src: MacAddress,
            dst: MacAddress,
            offset: u16,
        ) -> u16 {
            let end = (offset + self.frame_size).min(message.len() as u16);
            frame.payload = message.bytes[offset as usize..end as usize].to_vec();
            frame.src = src;
            frame.dst = dst;
            frame.ack_requested = !matches!(dst, MacAddress::None);
            frame.sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            end
        }

        fn prepare_empty_frame(&mut self, frame: &mut TxFrame, dst: MacAddress, ack_request: bool) {
            frame.payload = Vec::new();
            frame.dst = dst;
            frame.ack_requested = ack_request;
            frame.sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
        }
    }
}
