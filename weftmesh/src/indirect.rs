//! Indirect transmission to sleepy peers.
//!
//! Frames destined to a peer that sleeps between polls (or CSL windows)
//! are held in the send queue with that peer's child-mask bit set. The
//! indirect sender owns those bits, tracks per-peer delivery state, and
//! prepares frames when a data poll or CSL window opens.
//!
//! The replace/purge protocol: while a transmission is in flight the
//! current indirect message may only change through
//! [`IndirectSender::frame_change_done`], which installs the next
//! queued message. Everything else just flags
//! `waiting_for_message_update`.

use crate::config::NodeConfig;
use crate::neighbors::ChildTable;
use crate::queue::{MessageId, MessageKind, SendQueue};
use crate::traits::{FrameSecurity, MacAddress, TxFrame, TxStatus};
use crate::types::{DeviceMode, Error, Rloc16, MAX_POLL_TRIGGERED_TX_ATTEMPTS};

/// How a pending frame for a peer should be changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameChange {
    /// Drop the pending frame.
    Purge,
    /// Replace the pending frame with one for the new current message.
    Replace,
}

/// Composes link-layer frames from queued messages.
///
/// This is the seam to the mesh forwarder's 6LoWPAN machinery: given a
/// message and a fragment offset it emits the next data frame (no mesh
/// header) and reports the offset the next fragment starts at.
pub trait FrameComposer {
    /// Build the next data frame of `message` starting at `offset`.
    ///
    /// Returns the offset of the first byte not covered by the frame;
    /// a value `>= message.len()` means the message fits completely.
    fn prepare_data_frame(
        &mut self,
        frame: &mut TxFrame,
        message: &crate::queue::QueuedMessage,
        src: MacAddress,
        dst: MacAddress,
        offset: u16,
    ) -> u16;

    /// Build a valid empty frame so a poll always gets an answer.
    fn prepare_empty_frame(&mut self, frame: &mut TxFrame, dst: MacAddress, ack_request: bool);
}

/// A frame prepared for a sleepy peer plus its bookkeeping context.
#[derive(Debug)]
pub struct PreparedFrame {
    pub frame: TxFrame,
    /// Offset the next fragment starts at; zero marks an empty frame.
    pub message_next_offset: u16,
}

/// The indirect sender.
#[derive(Default)]
pub struct IndirectSender {
    enabled: bool,
}

impl IndirectSender {
    pub fn new() -> Self {
        IndirectSender { enabled: false }
    }

    pub fn start(&mut self) {
        self.enabled = true;
    }

    /// Stop and drop all per-child indirect state.
    pub fn stop<Cfg: NodeConfig>(&mut self, table: &mut ChildTable<Cfg>, queue: &mut SendQueue) {
        if !self.enabled {
            return;
        }

        for (index, child) in
            table.iterate_mut(crate::types::StateFilter::AnyExceptInvalid)
        {
            child.peer.indirect.message = None;
            child.peer.indirect.fragment_offset = 0;
            child.peer.indirect.queued_count = 0;
            child.peer.indirect.waiting_for_message_update = false;

            let ids: alloc::vec::Vec<MessageId> =
                queue.iter().filter(|(_, m)| m.has_child(index)).map(|(id, _)| id).collect();
            for id in ids {
                queue.clear_child_bit(id, index);
                queue.free_if_idle(id);
            }
        }

        self.enabled = false;
    }

    /// MAC address the peer is reached at, honoring source-match mode.
    pub fn mac_address_for(child: &crate::neighbors::Child) -> MacAddress {
        if child.peer.indirect.use_short_address && child.peer.rloc16 != Rloc16::INVALID {
            MacAddress::Short(child.peer.rloc16)
        } else {
            MacAddress::Extended(child.peer.ext_address)
        }
    }

    /// Queue `message` for indirect delivery to the child at
    /// `child_index`. Requests a message update so the new message can
    /// become current if nothing is in flight.
    pub fn add_message<Cfg: NodeConfig>(
        &mut self,
        table: &mut ChildTable<Cfg>,
        queue: &mut SendQueue,
        child_index: usize,
        message_id: MessageId,
    ) -> Result<Option<FrameChange>, Error> {
        let child = table.at_mut(child_index).ok_or(Error::NotFound)?;
        debug_assert!(!child.peer.is_rx_on_when_idle());

        if !queue.set_child_bit(message_id, child_index) {
            return Err(Error::Already);
        }
        child.peer.indirect.queued_count = child.peer.indirect.queued_count.saturating_add(1);

        // A queued supervision placeholder is obsolete once real
        // traffic is waiting.
        let kind = queue.get(message_id).map(|m| m.kind);
        if kind != Some(MessageKind::Supervision) && child.peer.indirect.queued_count > 1 {
            if let Some(supervision) =
                queue.find_for_child(child_index, |m| m.kind == MessageKind::Supervision)
            {
                if supervision != message_id {
                    let _ = self.remove_message(table, queue, child_index, supervision);
                    queue.free_if_idle(supervision);
                }
            }
        }

        Ok(self.request_message_update(table, queue, child_index))
    }

    /// Remove `message` from the child's indirect queue.
    pub fn remove_message<Cfg: NodeConfig>(
        &mut self,
        table: &mut ChildTable<Cfg>,
        queue: &mut SendQueue,
        child_index: usize,
        message_id: MessageId,
    ) -> Result<Option<FrameChange>, Error> {
        if !queue.clear_child_bit(message_id, child_index) {
            return Err(Error::NotFound);
        }

        let child = table.at_mut(child_index).ok_or(Error::NotFound)?;
        child.peer.indirect.queued_count = child.peer.indirect.queued_count.saturating_sub(1);

        Ok(self.request_message_update(table, queue, child_index))
    }

    /// Drop every queued indirect message for the child.
    pub fn clear_all<Cfg: NodeConfig>(
        &mut self,
        table: &mut ChildTable<Cfg>,
        queue: &mut SendQueue,
        child_index: usize,
    ) -> Option<FrameChange> {
        let child = table.at_mut(child_index)?;
        if child.peer.indirect.queued_count == 0 && child.peer.indirect.message.is_none() {
            return None;
        }

        let ids: alloc::vec::Vec<MessageId> =
            queue.iter().filter(|(_, m)| m.has_child(child_index)).map(|(id, _)| id).collect();
        for id in ids {
            queue.clear_child_bit(id, child_index);
            queue.free_if_idle(id);
        }

        let child = table.at_mut(child_index)?;
        child.peer.indirect.message = None;
        child.peer.indirect.queued_count = 0;
        child.peer.indirect.fragment_offset = 0;
        child.peer.indirect.waiting_for_message_update = false;

        Some(FrameChange::Purge)
    }

    /// First queued message for the child satisfying `accept`.
    pub fn find_queued(
        &self,
        queue: &SendQueue,
        child_index: usize,
        accept: impl Fn(&crate::queue::QueuedMessage) -> bool,
    ) -> Option<MessageId> {
        queue.find_for_child(child_index, accept)
    }

    /// Switch between short and extended source-match addressing.
    pub fn set_use_short_address<Cfg: NodeConfig>(
        &mut self,
        table: &mut ChildTable<Cfg>,
        child_index: usize,
        use_short: bool,
    ) {
        if let Some(child) = table.at_mut(child_index) {
            child.peer.indirect.use_short_address = use_short;
        }
    }

    /// Child mode changed. When a sleepy child turns rx-on, its queued
    /// indirect messages convert to direct and pending frames are
    /// purged. On the reverse change already-queued direct messages
    /// stay direct.
    pub fn on_child_mode_change<Cfg: NodeConfig>(
        &mut self,
        table: &mut ChildTable<Cfg>,
        queue: &mut SendQueue,
        child_index: usize,
        old_mode: DeviceMode,
    ) -> Option<FrameChange> {
        let child = table.at_mut(child_index)?;

        if !child.peer.is_rx_on_when_idle() && child.peer.is_state_valid() {
            child.peer.indirect.use_short_address = true;
        }

        if old_mode.rx_on_when_idle()
            || !child.peer.is_rx_on_when_idle()
            || child.peer.indirect.queued_count == 0
        {
            return None;
        }

        let ids: alloc::vec::Vec<MessageId> =
            queue.iter().filter(|(_, m)| m.has_child(child_index)).map(|(id, _)| id).collect();
        for id in ids {
            queue.clear_child_bit(id, child_index);
            if let Some(m) = queue.get_mut(id) {
                m.direct_tx = true;
            }
        }

        let child = table.at_mut(child_index)?;
        child.peer.indirect.message = None;
        child.peer.indirect.queued_count = 0;
        child.peer.indirect.fragment_offset = 0;

        Some(FrameChange::Purge)
    }

    /// Reconcile the child's current indirect message with the queue.
    ///
    /// Returns a frame-change request for the MAC when one is needed;
    /// the caller must route it back through [`Self::frame_change_done`]
    /// once the pending frame is disposed of.
    pub fn request_message_update<Cfg: NodeConfig>(
        &mut self,
        table: &mut ChildTable<Cfg>,
        queue: &mut SendQueue,
        child_index: usize,
    ) -> Option<FrameChange> {
        let child = table.at_mut(child_index)?;
        let current = child.peer.indirect.message;

        // Purge first if the current message no longer targets the
        // child. This covers a pending replace whose message got
        // removed while waiting for the callback.
        if let Some(id) = current {
            let still_targeted = queue.get(id).map(|m| m.has_child(child_index)).unwrap_or(false);
            if !still_targeted {
                child.peer.indirect.message = None;
                child.peer.indirect.waiting_for_message_update = true;
                return Some(FrameChange::Purge);
            }
        }

        if child.peer.indirect.waiting_for_message_update {
            return None;
        }

        let new = queue.find_for_child(child_index, |_| true);
        if current == new {
            return None;
        }

        if current.is_none() {
            // Nothing in flight; install the new message directly.
            self.update_indirect_message(table, queue, child_index);
            return None;
        }

        // Both differ and are non-empty: replace, but only while the
        // first fragment has not gone out yet. Mid-message we let the
        // whole message finish.
        let child = table.at_mut(child_index)?;
        if child.peer.indirect.fragment_offset != 0 {
            return None;
        }

        child.peer.indirect.waiting_for_message_update = true;
        Some(FrameChange::Replace)
    }

    /// MAC finished purging/replacing the pending frame. This is the
    /// only path that installs a new current indirect message.
    pub fn frame_change_done<Cfg: NodeConfig>(
        &mut self,
        table: &mut ChildTable<Cfg>,
        queue: &mut SendQueue,
        child_index: usize,
    ) {
        let Some(child) = table.at_mut(child_index) else {
            return;
        };
        if !child.peer.indirect.waiting_for_message_update {
            return;
        }
        self.update_indirect_message(table, queue, child_index);
    }

    fn update_indirect_message<Cfg: NodeConfig>(
        &mut self,
        table: &mut ChildTable<Cfg>,
        queue: &mut SendQueue,
        child_index: usize,
    ) {
        let Some(child) = table.at_mut(child_index) else {
            return;
        };
        let message = queue.find_for_child(child_index, |_| true);

        child.peer.indirect.waiting_for_message_update = false;
        child.peer.indirect.message = message;
        child.peer.indirect.fragment_offset = 0;
        child.peer.indirect.tx_success = true;
    }

    /// Produce the frame answering a poll or filling a CSL window.
    ///
    /// When nothing is queued a valid empty ack-requested frame is
    /// produced so the poll response is always delivered
    /// (`message_next_offset` zero marks that case).
    pub fn prepare_frame_for_child<Cfg: NodeConfig, F: FrameComposer>(
        &mut self,
        table: &mut ChildTable<Cfg>,
        queue: &SendQueue,
        composer: &mut F,
        child_index: usize,
        own_mac: MacAddress,
    ) -> Result<PreparedFrame, Error> {
        if !self.enabled {
            return Err(Error::InvalidState);
        }

        let child = table.at_mut(child_index).ok_or(Error::NotFound)?;
        let dst = Self::mac_address_for(child);
        let mut frame = TxFrame::default();
        let message_next_offset;

        match child.peer.indirect.message.and_then(|id| queue.get(id)) {
            None => {
                composer.prepare_empty_frame(&mut frame, dst, true);
                message_next_offset = 0;
            }
            Some(message) => match message.kind {
                MessageKind::Ip6 => {
                    // Link-local destinations resolve from the IPv6
                    // header; everything else uses the child's address.
                    let mac_dst = if message.ip6.destination.is_link_local() {
                        MacAddress::Extended(message.ip6.destination.ext_address())
                    } else {
                        dst
                    };
                    message_next_offset = composer.prepare_data_frame(
                        &mut frame,
                        message,
                        own_mac,
                        mac_dst,
                        child.peer.indirect.fragment_offset,
                    );

                    // More queued messages beyond the current one.
                    if child.peer.indirect.queued_count > 1 {
                        frame.frame_pending = true;
                    }
                }
                MessageKind::Supervision => {
                    composer.prepare_empty_frame(&mut frame, dst, true);
                    message_next_offset = message.len() as u16;
                }
            },
        }

        // Retransmission continuity: reuse the previous attempt's
        // sequence number, frame counter, and key id.
        if child.peer.indirect.tx_attempts > 0 || child.peer.csl.tx_attempts > 0 {
            frame.is_retransmission = true;
            frame.sequence = child.peer.indirect.data_sequence_number;
            if frame.security.is_some() {
                frame.security = Some(FrameSecurity {
                    frame_counter: child.peer.indirect.frame_counter,
                    key_id: child.peer.indirect.key_id,
                });
            }
        }

        Ok(PreparedFrame {
            frame,
            message_next_offset,
        })
    }

    /// Poll-triggered transmission completed.
    ///
    /// On failure the attempt counter decides between holding the
    /// message for the child's next poll (retransmission) and marking
    /// the delivery failed. Returns `true` when the caller should
    /// reconcile schedulers (current message finished or changed).
    pub fn handle_poll_sent_frame<Cfg: NodeConfig>(
        &mut self,
        table: &mut ChildTable<Cfg>,
        queue: &mut SendQueue,
        child_index: usize,
        frame: &TxFrame,
        status: TxStatus,
        message_next_offset: u16,
    ) -> bool {
        let Some(child) = table.at_mut(child_index) else {
            return false;
        };

        match status {
            TxStatus::Ok { .. } => {
                child.peer.reset_tx_attempts();
            }
            TxStatus::NoAck | TxStatus::ChannelAccessFailure | TxStatus::Abort => {
                if !frame.is_empty() {
                    child.peer.indirect.tx_attempts =
                        child.peer.indirect.tx_attempts.saturating_add(1);
                    // Retain the attempted frame's header fields for
                    // the retransmission.
                    child.peer.indirect.data_sequence_number = frame.sequence;
                    if let Some(sec) = frame.security {
                        child.peer.indirect.frame_counter = sec.frame_counter;
                        child.peer.indirect.key_id = sec.key_id;
                    }

                    if child.peer.indirect.tx_attempts < MAX_POLL_TRIGGERED_TX_ATTEMPTS {
                        // Await the next poll; same frame goes out again.
                        return false;
                    }
                }
            }
        }

        self.handle_sent_frame_to_child(table, queue, child_index, frame, status, message_next_offset)
    }

    /// Account a completed (or abandoned) transmission against the
    /// current indirect message. Returns `true` when the current
    /// message finished or changed.
    pub fn handle_sent_frame_to_child<Cfg: NodeConfig>(
        &mut self,
        table: &mut ChildTable<Cfg>,
        queue: &mut SendQueue,
        child_index: usize,
        frame: &TxFrame,
        status: TxStatus,
        mut message_next_offset: u16,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(child) = table.at_mut(child_index) else {
            return false;
        };
        let message = child.peer.indirect.message;

        // Zero marks the empty poll-response frame; nothing to account.
        if message_next_offset == 0 {
            if matches!(status, TxStatus::Ok { .. }) {
                child.peer.reset_tx_attempts();
            }
            return false;
        }

        match status {
            TxStatus::Ok { .. } => {}
            TxStatus::NoAck | TxStatus::ChannelAccessFailure | TxStatus::Abort => {
                child.peer.indirect.tx_success = false;
                // All attempts of this fragment failed; no point in
                // sending the remaining fragments.
                if let Some(len) = message.and_then(|id| queue.get(id)).map(|m| m.len()) {
                    message_next_offset = len as u16;
                }
            }
        }

        if let Some(id) = message {
            if let Some(len) = queue.get(id).map(|m| m.len()) {
                if (message_next_offset as usize) < len {
                    // More fragments to go at the next opportunity.
                    child.peer.indirect.fragment_offset = message_next_offset;
                    child.peer.reset_tx_attempts();
                    return true;
                }
            }

            // Delivery of this message is done (succeeded or failed).
            child.peer.indirect.message = None;
            child.peer.reset_tx_attempts();

            // Switch to short source matching after the first full
            // attempt; a missed ack must not leave us on the long
            // address while the child already attached.
            child.peer.indirect.use_short_address = true;

            let _ = frame;
            if queue.clear_child_bit(id, child_index) {
                let child = table.at_mut(child_index).unwrap();
                child.peer.indirect.queued_count =
                    child.peer.indirect.queued_count.saturating_sub(1);
            }
            queue.free_if_idle(id);
        }

        self.update_indirect_message(table, queue, child_index);
        self.clear_messages_for_removed_children(table, queue);
        true
    }

    /// Drop queued indirect traffic of children that left the table.
    fn clear_messages_for_removed_children<Cfg: NodeConfig>(
        &mut self,
        table: &mut ChildTable<Cfg>,
        queue: &mut SendQueue,
    ) {
        let stale: alloc::vec::Vec<usize> = table
            .iterate(crate::types::StateFilter::AnyExceptValidOrRestoring)
            .filter(|(_, c)| c.peer.indirect.queued_count > 0)
            .map(|(i, _)| i)
            .collect();
        for index in stale {
            self.clear_all(table, queue, index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultConfig;
    use crate::neighbors::Child;
    use crate::queue::Ip6Info;
    use crate::time::{Timestamp, TimestampUs};
    use crate::types::{ExtAddress, LinkState, StateFilter};
    use alloc::vec;
    use alloc::vec::Vec;

    /// Composer that frames `FRAME_SIZE` bytes of the message per call.
    struct TestComposer;

    const FRAME_SIZE: u16 = 64;

    impl FrameComposer for TestComposer {
        fn prepare_data_frame(
            &mut self,
            frame: &mut TxFrame,
            message: &crate::queue::QueuedMessage,
            src: MacAddress,
            dst: MacAddress,
            offset: u16,
        ) -> u16 {
            let end = (offset + FRAME_SIZE).min(message.len() as u16);
            frame.payload = message.bytes[offset as usize..end as usize].to_vec();
            frame.src = src;
            frame.dst = dst;
            frame.ack_requested = true;
            frame.sequence = 42;
            frame.security = Some(FrameSecurity {
                frame_counter: 1000,
                key_id: 1,
            });
            end
        }

        fn prepare_empty_frame(&mut self, frame: &mut TxFrame, dst: MacAddress, ack_request: bool) {
            frame.payload = Vec::new();
            frame.dst = dst;
            frame.ack_requested = ack_request;
        }
    }

    struct Fixture {
        sender: IndirectSender,
        table: ChildTable<DefaultConfig>,
        queue: SendQueue,
        composer: TestComposer,
    }

    fn fixture() -> Fixture {
        let mut sender = IndirectSender::new();
        sender.start();
        let mut table = ChildTable::<DefaultConfig>::new();
        let (_, child) = table.new_child().unwrap();
        init_sleepy_child(child, 1);

        Fixture {
            sender,
            table,
            queue: SendQueue::new(16),
            composer: TestComposer,
        }
    }

    fn init_sleepy_child(child: &mut Child, n: u8) {
        child.peer.init(ExtAddress([n; 8]), 0, Timestamp::ZERO);
        child.peer.state = LinkState::Valid;
        child.peer.rloc16 = crate::types::Rloc16(0x6c00 + n as u16);
        child.peer.device_mode = DeviceMode::new(false, false, false);
        child.timeout_secs = 240;
    }

    fn enqueue_ip6(f: &mut Fixture, len: usize) -> MessageId {
        let id = f
            .queue
            .enqueue(MessageKind::Ip6, vec![0xab; len], Ip6Info::default(), false)
            .unwrap();
        f.sender.add_message(&mut f.table, &mut f.queue, 0, id).unwrap();
        id
    }

    fn ok_status() -> TxStatus {
        TxStatus::Ok {
            acked_with_csl_ie: false,
            timestamp_us: TimestampUs::ZERO,
        }
    }

    #[test]
    fn test_add_message_installs_current_and_counts() {
        let mut f = fixture();
        let id = enqueue_ip6(&mut f, 10);

        let child = f.table.at(0).unwrap();
        assert_eq!(child.peer.indirect.message, Some(id));
        assert_eq!(child.peer.indirect.queued_count, 1);
        assert_eq!(f.queue.count_for_child(0), 1);
    }

    #[test]
    fn test_queued_count_matches_queue_bits() {
        let mut f = fixture();
        enqueue_ip6(&mut f, 10);
        enqueue_ip6(&mut f, 10);
        enqueue_ip6(&mut f, 10);

        let child = f.table.at(0).unwrap();
        assert_eq!(
            child.peer.indirect.queued_count as usize,
            f.queue.count_for_child(0)
        );
    }

    #[test]
    fn test_empty_frame_when_nothing_queued() {
        let mut f = fixture();
        let prepared = f
            .sender
            .prepare_frame_for_child(
                &mut f.table,
                &f.queue,
                &mut f.composer,
                0,
                MacAddress::Short(Rloc16(0x6c00)),
            )
            .unwrap();
        assert!(prepared.frame.is_empty());
        assert!(prepared.frame.ack_requested);
        assert_eq!(prepared.message_next_offset, 0);
    }

    #[test]
    fn test_frame_pending_set_when_more_messages() {
        let mut f = fixture();
        enqueue_ip6(&mut f, 10);
        enqueue_ip6(&mut f, 10);

        let prepared = f
            .sender
            .prepare_frame_for_child(
                &mut f.table,
                &f.queue,
                &mut f.composer,
                0,
                MacAddress::Short(Rloc16(0x6c00)),
            )
            .unwrap();
        assert!(prepared.frame.frame_pending);
    }

    #[test]
    fn test_successful_delivery_frees_message() {
        let mut f = fixture();
        let id = enqueue_ip6(&mut f, 10);

        let prepared = f
            .sender
            .prepare_frame_for_child(
                &mut f.table,
                &f.queue,
                &mut f.composer,
                0,
                MacAddress::Short(Rloc16(0x6c00)),
            )
            .unwrap();

        f.sender.handle_poll_sent_frame(
            &mut f.table,
            &mut f.queue,
            0,
            &prepared.frame,
            ok_status(),
            prepared.message_next_offset,
        );

        assert!(f.queue.get(id).is_none());
        let child = f.table.at(0).unwrap();
        assert_eq!(child.peer.indirect.message, None);
        assert_eq!(child.peer.indirect.queued_count, 0);
        assert!(child.peer.indirect.use_short_address);
    }

    #[test]
    fn test_fragmented_message_advances_offset() {
        let mut f = fixture();
        enqueue_ip6(&mut f, 150); // three frames of 64/64/22

        let prepared = f
            .sender
            .prepare_frame_for_child(
                &mut f.table,
                &f.queue,
                &mut f.composer,
                0,
                MacAddress::Short(Rloc16(0x6c00)),
            )
            .unwrap();
        assert_eq!(prepared.message_next_offset, 64);

        f.sender.handle_poll_sent_frame(
            &mut f.table,
            &mut f.queue,
            0,
            &prepared.frame,
            ok_status(),
            prepared.message_next_offset,
        );
        assert_eq!(f.table.at(0).unwrap().peer.indirect.fragment_offset, 64);

        let prepared = f
            .sender
            .prepare_frame_for_child(
                &mut f.table,
                &f.queue,
                &mut f.composer,
                0,
                MacAddress::Short(Rloc16(0x6c00)),
            )
            .unwrap();
        assert_eq!(prepared.message_next_offset, 128);
    }

    #[test]
    fn test_retry_reuses_frame_header_fields() {
        let mut f = fixture();
        enqueue_ip6(&mut f, 10);

        let first = f
            .sender
            .prepare_frame_for_child(
                &mut f.table,
                &f.queue,
                &mut f.composer,
                0,
                MacAddress::Short(Rloc16(0x6c00)),
            )
            .unwrap();
        assert!(!first.frame.is_retransmission);

        // First NoAck: message held for the next poll.
        let done = f.sender.handle_poll_sent_frame(
            &mut f.table,
            &mut f.queue,
            0,
            &first.frame,
            TxStatus::NoAck,
            first.message_next_offset,
        );
        assert!(!done);
        assert_eq!(f.table.at(0).unwrap().peer.indirect.tx_attempts, 1);

        let retry = f
            .sender
            .prepare_frame_for_child(
                &mut f.table,
                &f.queue,
                &mut f.composer,
                0,
                MacAddress::Short(Rloc16(0x6c00)),
            )
            .unwrap();
        assert!(retry.frame.is_retransmission);
        assert_eq!(retry.frame.sequence, first.frame.sequence);
        assert_eq!(retry.frame.security, first.frame.security);
    }

    #[test]
    fn test_max_attempts_fails_message_and_moves_on() {
        let mut f = fixture();
        let first_id = enqueue_ip6(&mut f, 10);
        let second_id = enqueue_ip6(&mut f, 10);

        for attempt in 1..=MAX_POLL_TRIGGERED_TX_ATTEMPTS {
            let prepared = f
                .sender
                .prepare_frame_for_child(
                    &mut f.table,
                    &f.queue,
                    &mut f.composer,
                    0,
                    MacAddress::Short(Rloc16(0x6c00)),
                )
                .unwrap();
            let done = f.sender.handle_poll_sent_frame(
                &mut f.table,
                &mut f.queue,
                0,
                &prepared.frame,
                TxStatus::NoAck,
                prepared.message_next_offset,
            );
            if attempt < MAX_POLL_TRIGGERED_TX_ATTEMPTS {
                assert!(!done);
                assert_eq!(f.table.at(0).unwrap().peer.indirect.tx_attempts, attempt);
            } else {
                assert!(done);
            }
        }

        // First message failed and was removed; the second is current.
        assert!(f.queue.get(first_id).is_none());
        let child = f.table.at(0).unwrap();
        assert_eq!(child.peer.indirect.message, Some(second_id));
        assert_eq!(child.peer.indirect.tx_attempts, 0);
    }

    #[test]
    fn test_replace_requires_frame_change_roundtrip() {
        let mut f = fixture();
        let first = enqueue_ip6(&mut f, 10);

        // Removing the current message while "in flight" purges.
        let change = f
            .sender
            .remove_message(&mut f.table, &mut f.queue, 0, first)
            .unwrap();
        assert_eq!(change, Some(FrameChange::Purge));
        assert!(f.table.at(0).unwrap().peer.indirect.waiting_for_message_update);

        // New message queued while waiting does not install itself.
        let second = f
            .queue
            .enqueue(MessageKind::Ip6, vec![1; 10], Ip6Info::default(), false)
            .unwrap();
        let change = f
            .sender
            .add_message(&mut f.table, &mut f.queue, 0, second)
            .unwrap();
        assert_eq!(change, None);
        assert_eq!(f.table.at(0).unwrap().peer.indirect.message, None);

        // Only the done callback installs it.
        f.sender.frame_change_done(&mut f.table, &mut f.queue, 0);
        let child = f.table.at(0).unwrap();
        assert!(!child.peer.indirect.waiting_for_message_update);
        assert_eq!(child.peer.indirect.message, Some(second));
    }

    #[test]
    fn test_mode_change_to_rx_on_converts_to_direct() {
        let mut f = fixture();
        let id = enqueue_ip6(&mut f, 10);

        let old_mode = f.table.at(0).unwrap().peer.device_mode;
        f.table.at_mut(0).unwrap().peer.device_mode = DeviceMode::new(true, false, true);

        let change = f.sender.on_child_mode_change(&mut f.table, &mut f.queue, 0, old_mode);
        assert_eq!(change, Some(FrameChange::Purge));

        let m = f.queue.get(id).unwrap();
        assert!(m.direct_tx);
        assert_eq!(m.child_mask, 0);
        let child = f.table.at(0).unwrap();
        assert_eq!(child.peer.indirect.message, None);
        assert_eq!(child.peer.indirect.queued_count, 0);
    }

    #[test]
    fn test_supervision_dropped_when_real_traffic_queues() {
        let mut f = fixture();
        let sup = f
            .queue
            .enqueue(MessageKind::Supervision, vec![], Ip6Info::default(), false)
            .unwrap();
        f.sender.add_message(&mut f.table, &mut f.queue, 0, sup).unwrap();

        let ip6 = f
            .queue
            .enqueue(MessageKind::Ip6, vec![1; 10], Ip6Info::default(), false)
            .unwrap();
        f.sender.add_message(&mut f.table, &mut f.queue, 0, ip6).unwrap();

        assert!(f.queue.get(sup).is_none());
        assert_eq!(f.table.at(0).unwrap().peer.indirect.queued_count, 1);
    }

    #[test]
    fn test_clear_all_purges() {
        let mut f = fixture();
        enqueue_ip6(&mut f, 10);
        enqueue_ip6(&mut f, 10);

        let change = f.sender.clear_all(&mut f.table, &mut f.queue, 0);
        assert_eq!(change, Some(FrameChange::Purge));
        assert_eq!(f.queue.len(), 0);
        let child = f.table.at(0).unwrap();
        assert_eq!(child.peer.indirect.queued_count, 0);
        assert_eq!(child.peer.indirect.message, None);
    }

    #[test]
    fn test_stale_children_cleared_after_tx() {
        let mut f = fixture();
        enqueue_ip6(&mut f, 10);

        // A second child with queued traffic falls out of Valid.
        let (second_index, child) = f.table.new_child().unwrap();
        init_sleepy_child(child, 2);
        let id = f
            .queue
            .enqueue(MessageKind::Ip6, vec![2; 4], Ip6Info::default(), false)
            .unwrap();
        f.sender
            .add_message(&mut f.table, &mut f.queue, second_index, id)
            .unwrap();
        f.table.at_mut(second_index).unwrap().peer.state = LinkState::ParentRequest;

        let prepared = f
            .sender
            .prepare_frame_for_child(
                &mut f.table,
                &f.queue,
                &mut f.composer,
                0,
                MacAddress::Short(Rloc16(0x6c00)),
            )
            .unwrap();
        f.sender.handle_poll_sent_frame(
            &mut f.table,
            &mut f.queue,
            0,
            &prepared.frame,
            ok_status(),
            prepared.message_next_offset,
        );

        assert_eq!(f.queue.count_for_child(second_index), 0);
        assert_eq!(
            f.table
                .at(second_index)
                .unwrap()
                .peer
                .indirect
                .queued_count,
            0
        );
        assert_eq!(f.table.count(StateFilter::AnyExceptInvalid), 2);
    }

    #[test]
    fn test_stop_clears_everything() {
        let mut f = fixture();
        enqueue_ip6(&mut f, 10);
        f.sender.stop(&mut f.table, &mut f.queue);
        assert_eq!(f.queue.len(), 0);
        assert!(f
            .sender
            .prepare_frame_for_child(
                &mut f.table,
                &f.queue,
                &mut TestComposer,
                0,
                MacAddress::None
            )
            .is_err());
    }
}
