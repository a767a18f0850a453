//! Simulated nodes: platform wiring and the scripted full-device parent.

use weftmesh::codec::{self, Command, MleMessage};
use weftmesh::indirect::FrameComposer;
use weftmesh::node::IngressDatagram;
use weftmesh::queue::QueuedMessage;
use weftmesh::traits::test_impls::{
    MockClock, MockCrypto, MockNetworkData, MockRadio, MockRandom, MockSettings, RadioOp,
};
use weftmesh::traits::{MacAddress, TxFrame};
use weftmesh::wire::{self, Connectivity, TlvType};
use weftmesh::{
    DefaultConfig, ExtAddress, Ip6Address, LeaderData, Node, Rloc16, Timestamp,
    MLE_HOP_LIMIT,
};

/// Bytes of simulation framing ahead of the MLE payload: source and
/// destination addresses plus the hop limit, standing in for the
/// 6LoWPAN/IPv6 headers the composer would normally emit.
pub const SIM_FRAME_HEADER_LEN: usize = 16 + 16 + 1;

/// Composer that frames whole messages with the simulation header.
#[derive(Default)]
pub struct SimComposer {
    next_sequence: u8,
}

impl FrameComposer for SimComposer {
    fn prepare_data_frame(
        &mut self,
        frame: &mut TxFrame,
        message: &QueuedMessage,
        src: MacAddress,
        dst: MacAddress,
        offset: u16,
    ) -> u16 {
        let mut payload = Vec::with_capacity(SIM_FRAME_HEADER_LEN + message.len());
        payload.extend_from_slice(&message.ip6.source.0);
        payload.extend_from_slice(&message.ip6.destination.0);
        payload.push(MLE_HOP_LIMIT);
        payload.extend_from_slice(&message.bytes[offset as usize..]);

        frame.payload = payload;
        frame.src = src;
        frame.dst = dst;
        frame.ack_requested = !matches!(dst, MacAddress::None);
        frame.sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        message.len() as u16
    }

    fn prepare_empty_frame(&mut self, frame: &mut TxFrame, dst: MacAddress, ack_request: bool) {
        frame.payload = Vec::new();
        frame.dst = dst;
        frame.ack_requested = ack_request;
        frame.sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
    }
}

/// Recover the datagram carried by a simulated frame.
pub fn decode_sim_frame(frame: &TxFrame) -> Option<IngressDatagram> {
    if frame.payload.len() < SIM_FRAME_HEADER_LEN {
        return None;
    }
    let source = Ip6Address(frame.payload[..16].try_into().ok()?);
    let destination = Ip6Address(frame.payload[16..32].try_into().ok()?);
    let hop_limit = frame.payload[32];
    Some(IngressDatagram {
        source,
        destination,
        hop_limit,
        bytes: frame.payload[SIM_FRAME_HEADER_LEN..].to_vec(),
        rss: None,
    })
}

/// The platform instantiation used by every simulated node.
pub type SimPlatform = Node<
    MockRadio,
    MockCrypto,
    MockRandom,
    MockClock,
    MockNetworkData,
    MockSettings,
    SimComposer,
    DefaultConfig,
>;

/// One simulated weftmesh node.
pub struct SimNode {
    pub ext: ExtAddress,
    pub inner: SimPlatform,
    drained_ops: usize,
}

impl SimNode {
    pub fn new(ext: ExtAddress, seed: u64) -> Self {
        let inner = Node::new(
            MockRadio::new(),
            MockCrypto::new(),
            MockRandom::with_seed(seed),
            MockClock::new(),
            MockNetworkData::new(),
            MockSettings::new(),
            SimComposer::default(),
            ext,
        );
        SimNode {
            ext,
            inner,
            drained_ops: 0,
        }
    }

    /// Move both clock domains to `now`.
    pub fn set_time(&mut self, now: Timestamp) {
        self.inner.clock().set(now);
        self.inner.radio_mut().now_us = now.as_millis() * 1000;
    }

    /// Frames handed to the radio since the last drain, with the
    /// requested transmit time for timed sends.
    pub fn drain_frames(&mut self) -> Vec<(TxFrame, Option<u64>)> {
        let ops = &self.inner.radio().ops;
        let mut out = Vec::new();
        for op in &ops[self.drained_ops.min(ops.len())..] {
            match op {
                RadioOp::Send(frame) => out.push((frame.clone(), None)),
                RadioOp::SendAt(frame, at) => out.push((frame.clone(), Some(*at))),
                _ => {}
            }
        }
        self.drained_ops = ops.len();
        out
    }
}

/// A canned full-device parent: answers the attach exchange without a
/// full routing implementation.
pub struct ScriptedParent {
    pub ext: ExtAddress,
    pub rloc16: Rloc16,
    /// Locator handed out in the next Child ID Response.
    pub assign_rloc16: Rloc16,
    /// Locator prefix length granted to attaching children.
    pub grant_prefix_len: Option<u8>,
    pub connectivity: Connectivity,
    pub leader_data: LeaderData,
    pub key_sequence: u32,
    frame_counter: u32,
    crypto: MockCrypto,
    /// Transcript of received messages: command, source, TLV bytes.
    pub received: Vec<(Command, Ip6Address, Vec<u8>)>,
}

impl ScriptedParent {
    pub fn new(ext: ExtAddress, rloc16: Rloc16, assign_rloc16: Rloc16) -> Self {
        ScriptedParent {
            ext,
            rloc16,
            assign_rloc16,
            grant_prefix_len: None,
            connectivity: Connectivity {
                link_quality_3: 1,
                ..Default::default()
            },
            leader_data: LeaderData {
                partition_id: 0x11223344,
                weighting: 64,
                data_version: 10,
                stable_data_version: 10,
                leader_router_id: 27,
            },
            key_sequence: 0,
            frame_counter: 1,
            crypto: MockCrypto::new(),
            received: Vec::new(),
        }
    }

    fn link_local(&self) -> Ip6Address {
        Ip6Address::link_local(&self.ext)
    }

    fn finalize(&mut self, message: MleMessage, destination: Ip6Address) -> IngressDatagram {
        let counter = self.frame_counter;
        self.frame_counter += 1;
        let bytes = message.secure(
            &self.crypto,
            self.key_sequence,
            counter,
            &self.link_local(),
            &destination,
        );
        IngressDatagram {
            source: self.link_local(),
            destination,
            hop_limit: MLE_HOP_LIMIT,
            bytes,
            rss: Some(-60),
        }
    }

    /// React to a received datagram, producing any responses.
    pub fn handle(&mut self, datagram: &IngressDatagram) -> Vec<IngressDatagram> {
        let Ok(msg) = codec::parse(
            &self.crypto,
            &datagram.bytes,
            &datagram.source,
            &datagram.destination,
        ) else {
            return Vec::new();
        };

        self.received
            .push((msg.command, datagram.source, msg.tlvs.clone()));
        let requester = datagram.source;

        match msg.command {
            Command::ParentRequest => {
                let Ok(challenge) = wire::read_challenge(&msg.tlvs, TlvType::Challenge) else {
                    return Vec::new();
                };
                let mut response = MleMessage::new(Command::ParentResponse);
                response
                    .append_source_address(self.rloc16)
                    .append_version()
                    .append_response(&challenge)
                    .append_leader_data(&self.leader_data)
                    .append_link_margin(40)
                    .append_connectivity(&self.connectivity)
                    .append_link_frame_counter(0)
                    .append_mle_frame_counter(0)
                    .append_challenge(&[0xc2; 8])
                    .append_csl_accuracy(&weftmesh::types::CslAccuracy {
                        clock_accuracy_ppm: 20,
                        uncertainty: 10,
                    });
                vec![self.finalize(response, requester)]
            }

            Command::ChildIdRequest => {
                let mut response = MleMessage::new(Command::ChildIdResponse);
                response
                    .append_source_address(self.rloc16)
                    .append_address16(self.assign_rloc16)
                    .append_leader_data(&self.leader_data)
                    .append_network_data(&[0xde, 0xad, 0xbe, 0xef]);
                if let Some(prefix_len) = self.grant_prefix_len {
                    response.append_rloc_prefix_length(prefix_len);
                }
                // Echo second-tier routing info so the response finds
                // its way back down the chain.
                if let Ok((rloc, Some(ext))) = codec::read_from_sub_child(&msg.tlvs) {
                    response.append_from_sub_child(rloc, Some(&ext));
                }
                vec![self.finalize(response, requester)]
            }

            Command::ChildUpdateRequest => {
                let mut response = MleMessage::new(Command::ChildUpdateResponse);
                response
                    .append_source_address(self.rloc16)
                    .append_leader_data(&self.leader_data);
                if let Ok(mode) = wire::read_u8_tlv(&msg.tlvs, TlvType::Mode) {
                    response.append_mode(mode);
                }
                if let Ok(timeout) = wire::read_u32_tlv(&msg.tlvs, TlvType::Timeout) {
                    response.append_timeout(timeout);
                }
                if let Ok(challenge) = wire::read_challenge(&msg.tlvs, TlvType::Challenge) {
                    response.append_response(&challenge);
                    response.append_link_frame_counter(0);
                    response.append_mle_frame_counter(0);
                }
                vec![self.finalize(response, requester)]
            }

            Command::DataRequest => {
                let mut response = MleMessage::new(Command::DataResponse);
                response
                    .append_source_address(self.rloc16)
                    .append_leader_data(&self.leader_data)
                    .append_network_data(&[0xde, 0xad, 0xbe, 0xef]);
                vec![self.finalize(response, requester)]
            }

            _ => Vec::new(),
        }
    }

    /// Originate a message toward a device (used for update requests
    /// that travel down a sub-child chain).
    pub fn originate(&mut self, message: MleMessage, destination: Ip6Address) -> IngressDatagram {
        self.finalize(message, destination)
    }
}
