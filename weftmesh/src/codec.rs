//! MLE message codec: secured framing and message build/parse.
//!
//! Every MLE message is:
//!
//! ```text
//! security_suite:u8                      0 = 802.15.4 security, 255 = none
//! control:u8 (=1)                        secured only
//! frame_counter:u32_le                   secured only
//! key_id:u32_le                          secured only, encodes key sequence
//! command:u8
//! TLV stream                             encrypted together with command
//! tag:[u8; 4]                            AES-CCM-32, secured only
//! ```
//!
//! Nonce is `ext_addr(8) || frame_counter(4) || security_level(1)`; AAD
//! is `sender_ipv6(16) || receiver_ipv6(16) || security_header(9)`.

use alloc::vec::Vec;

use crate::traits::{Crypto, CCM_NONCE_LEN};
use crate::types::{
    CslAccuracy, Error, ExtAddress, Ip6Address, LeaderData, Rloc16, MLE_TAG_LEN, PROTOCOL_VERSION,
};
use crate::wire::{
    write_channel_tlv, write_csl_accuracy, write_leader_data, AddressRegistrationEntry,
    Connectivity, Reader, TlvType, Writer,
};

/// Security suite selector: 802.15.4-style AES-CCM.
pub const SECURITY_SUITE_154: u8 = 0;
/// Security suite selector: no security (discovery only).
pub const SECURITY_SUITE_NONE: u8 = 255;

/// The only accepted value of the security control byte.
pub const SECURITY_CONTROL: u8 = 1;
/// ENC-MIC-32 security level, last byte of the CCM nonce.
pub const SECURITY_LEVEL: u8 = 5;

/// Bytes of security header following the suite byte.
pub const SECURITY_HEADER_LEN: usize = 1 + 4 + 4;

/// Full auxiliary framing length of a secured message: suite byte,
/// security header, and command byte. The TLV stream starts here.
/// Forwarding code derives clone offsets from this, never a literal.
pub const fn aux_header_len() -> usize {
    1 + SECURITY_HEADER_LEN + 1
}

/// MLE command byte (closed set).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    LinkRequest = 0,
    LinkAccept = 1,
    LinkAcceptAndRequest = 2,
    LinkReject = 3,
    Advertisement = 4,
    DataRequest = 7,
    DataResponse = 8,
    ParentRequest = 9,
    ParentResponse = 10,
    ChildIdRequest = 11,
    ChildIdResponse = 12,
    ChildUpdateRequest = 13,
    ChildUpdateResponse = 14,
    Announce = 15,
    DiscoveryRequest = 16,
    DiscoveryResponse = 17,
}

impl Command {
    /// Decode a command byte; `None` for bytes outside the known set.
    pub fn from_u8(v: u8) -> Option<Command> {
        Some(match v {
            0 => Command::LinkRequest,
            1 => Command::LinkAccept,
            2 => Command::LinkAcceptAndRequest,
            3 => Command::LinkReject,
            4 => Command::Advertisement,
            7 => Command::DataRequest,
            8 => Command::DataResponse,
            9 => Command::ParentRequest,
            10 => Command::ParentResponse,
            11 => Command::ChildIdRequest,
            12 => Command::ChildIdResponse,
            13 => Command::ChildUpdateRequest,
            14 => Command::ChildUpdateResponse,
            15 => Command::Announce,
            16 => Command::DiscoveryRequest,
            17 => Command::DiscoveryResponse,
            _ => return None,
        })
    }

    /// Whether this command is permitted without message security.
    pub fn allowed_unsecured(self) -> bool {
        matches!(self, Command::DiscoveryRequest | Command::DiscoveryResponse)
    }
}

/// Parsed security header of a secured MLE message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecurityHeader {
    pub frame_counter: u32,
    /// Encodes the key sequence.
    pub key_id: u32,
}

impl SecurityHeader {
    fn write(&self, w: &mut Writer) {
        w.write_u8(SECURITY_CONTROL);
        w.write_u32_le(self.frame_counter);
        w.write_u32_le(self.key_id);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, Error> {
        let control = r.read_u8()?;
        if control != SECURITY_CONTROL {
            return Err(Error::Parse);
        }
        Ok(SecurityHeader {
            frame_counter: r.read_u32_le()?,
            key_id: r.read_u32_le()?,
        })
    }

    fn to_bytes(self) -> [u8; SECURITY_HEADER_LEN] {
        let mut out = [0u8; SECURITY_HEADER_LEN];
        out[0] = SECURITY_CONTROL;
        out[1..5].copy_from_slice(&self.frame_counter.to_le_bytes());
        out[5..9].copy_from_slice(&self.key_id.to_le_bytes());
        out
    }
}

fn build_nonce(sender_ext: &ExtAddress, frame_counter: u32) -> [u8; CCM_NONCE_LEN] {
    let mut nonce = [0u8; CCM_NONCE_LEN];
    nonce[..8].copy_from_slice(&sender_ext.0);
    nonce[8..12].copy_from_slice(&frame_counter.to_be_bytes());
    nonce[12] = SECURITY_LEVEL;
    nonce
}

fn build_aad(sender: &Ip6Address, receiver: &Ip6Address, header: &SecurityHeader) -> [u8; 41] {
    let mut aad = [0u8; 41];
    aad[..16].copy_from_slice(&sender.0);
    aad[16..32].copy_from_slice(&receiver.0);
    aad[32..].copy_from_slice(&header.to_bytes());
    aad
}

/// A fully parsed (and, when secured, decrypted and verified) MLE message.
#[derive(Clone, Debug, PartialEq)]
pub struct RxMle {
    pub command: Command,
    /// Decrypted TLV stream.
    pub tlvs: Vec<u8>,
    /// Key sequence from the security header; zero for unsecured.
    pub key_sequence: u32,
    /// Frame counter from the security header; zero for unsecured.
    pub frame_counter: u32,
    pub secured: bool,
}

/// Parse an incoming MLE UDP payload, decrypting secured messages.
///
/// `sender`/`receiver` are the datagram source and destination
/// addresses; the sender's extended address is derived from its
/// link-local interface id for the nonce.
pub fn parse<C: Crypto>(
    crypto: &C,
    bytes: &[u8],
    sender: &Ip6Address,
    receiver: &Ip6Address,
) -> Result<RxMle, Error> {
    let mut r = Reader::new(bytes);
    let suite = r.read_u8()?;

    if suite == SECURITY_SUITE_NONE {
        let command = Command::from_u8(r.read_u8()?).ok_or(Error::Drop)?;
        if !command.allowed_unsecured() {
            return Err(Error::Drop);
        }
        return Ok(RxMle {
            command,
            tlvs: bytes[r.position()..].to_vec(),
            key_sequence: 0,
            frame_counter: 0,
            secured: false,
        });
    }

    if suite != SECURITY_SUITE_154 {
        return Err(Error::Parse);
    }

    let header = SecurityHeader::read(&mut r)?;
    let body_start = r.position();

    // Command byte plus tag must be present.
    if bytes.len() < body_start + 1 + MLE_TAG_LEN {
        return Err(Error::Parse);
    }

    let tag_start = bytes.len() - MLE_TAG_LEN;
    let mut payload = bytes[body_start..tag_start].to_vec();
    let tag: [u8; MLE_TAG_LEN] = bytes[tag_start..].try_into().map_err(|_| Error::Parse)?;

    let key = crypto.mle_key(header.key_id);
    let nonce = build_nonce(&sender.ext_address(), header.frame_counter);
    let aad = build_aad(sender, receiver, &header);

    if !crypto.ccm_decrypt(&key, &nonce, &aad, &mut payload, &tag) {
        return Err(Error::Security);
    }

    let command = Command::from_u8(payload[0]).ok_or(Error::Drop)?;

    Ok(RxMle {
        command,
        tlvs: payload[1..].to_vec(),
        key_sequence: header.key_id,
        frame_counter: header.frame_counter,
        secured: true,
    })
}

/// Builder for outgoing MLE messages.
///
/// Mirrors the TLV append surface of the protocol; `secure()` or
/// `unsecured()` finalizes into the UDP payload.
pub struct MleMessage {
    command: Command,
    tlvs: Writer,
}

impl MleMessage {
    /// Start a message for `command`.
    pub fn new(command: Command) -> Self {
        MleMessage {
            command,
            tlvs: Writer::new(),
        }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    /// Raw TLV bytes appended so far.
    pub fn tlv_bytes(&self) -> &[u8] {
        self.tlvs.as_slice()
    }

    /// Append a pre-encoded TLV stream (used when forwarding).
    pub fn append_raw_tlvs(&mut self, tlvs: &[u8]) -> &mut Self {
        self.tlvs.write_bytes(tlvs);
        self
    }

    pub fn append_source_address(&mut self, rloc16: Rloc16) -> &mut Self {
        let mut v = Writer::new();
        v.write_u16_be(rloc16.0);
        self.tlvs.append_tlv(TlvType::SourceAddress, v.as_slice());
        self
    }

    pub fn append_mode(&mut self, mode_bits: u8) -> &mut Self {
        self.tlvs.append_tlv(TlvType::Mode, &[mode_bits]);
        self
    }

    pub fn append_timeout(&mut self, timeout_secs: u32) -> &mut Self {
        let mut v = Writer::new();
        v.write_u32_be(timeout_secs);
        self.tlvs.append_tlv(TlvType::Timeout, v.as_slice());
        self
    }

    pub fn append_challenge(&mut self, challenge: &[u8]) -> &mut Self {
        self.tlvs.append_tlv(TlvType::Challenge, challenge);
        self
    }

    pub fn append_response(&mut self, response: &[u8]) -> &mut Self {
        self.tlvs.append_tlv(TlvType::Response, response);
        self
    }

    pub fn append_link_frame_counter(&mut self, counter: u32) -> &mut Self {
        let mut v = Writer::new();
        v.write_u32_be(counter);
        self.tlvs.append_tlv(TlvType::LinkFrameCounter, v.as_slice());
        self
    }

    pub fn append_mle_frame_counter(&mut self, counter: u32) -> &mut Self {
        let mut v = Writer::new();
        v.write_u32_be(counter);
        self.tlvs.append_tlv(TlvType::MleFrameCounter, v.as_slice());
        self
    }

    pub fn append_address16(&mut self, rloc16: Rloc16) -> &mut Self {
        let mut v = Writer::new();
        v.write_u16_be(rloc16.0);
        self.tlvs.append_tlv(TlvType::Address16, v.as_slice());
        self
    }

    pub fn append_leader_data(&mut self, leader_data: &LeaderData) -> &mut Self {
        write_leader_data(&mut self.tlvs, leader_data);
        self
    }

    pub fn append_network_data(&mut self, data: &[u8]) -> &mut Self {
        self.tlvs.append_tlv(TlvType::NetworkData, data);
        self
    }

    pub fn append_tlv_request(&mut self, requested: &[TlvType]) -> &mut Self {
        let mut v = Writer::new();
        for t in requested {
            v.write_u8(*t as u8);
        }
        self.tlvs.append_tlv(TlvType::TlvRequest, v.as_slice());
        self
    }

    pub fn append_scan_mask(&mut self, mask: u8) -> &mut Self {
        self.tlvs.append_tlv(TlvType::ScanMask, &[mask]);
        self
    }

    pub fn append_connectivity(&mut self, connectivity: &Connectivity) -> &mut Self {
        connectivity.write(&mut self.tlvs);
        self
    }

    pub fn append_link_margin(&mut self, margin: u8) -> &mut Self {
        self.tlvs.append_tlv(TlvType::LinkMargin, &[margin]);
        self
    }

    pub fn append_status(&mut self, status: u8) -> &mut Self {
        self.tlvs.append_tlv(TlvType::Status, &[status]);
        self
    }

    pub fn append_version(&mut self) -> &mut Self {
        let mut v = Writer::new();
        v.write_u16_be(PROTOCOL_VERSION);
        self.tlvs.append_tlv(TlvType::Version, v.as_slice());
        self
    }

    pub fn append_supervision_interval(&mut self, interval_secs: u16) -> &mut Self {
        let mut v = Writer::new();
        v.write_u16_be(interval_secs);
        self.tlvs.append_tlv(TlvType::SupervisionInterval, v.as_slice());
        self
    }

    pub fn append_address_registration(
        &mut self,
        entries: &[AddressRegistrationEntry],
    ) -> &mut Self {
        let mut v = Writer::new();
        for entry in entries {
            entry.write(&mut v);
        }
        self.tlvs.append_tlv(TlvType::AddressRegistration, v.as_slice());
        self
    }

    pub fn append_channel(&mut self, channel: u8) -> &mut Self {
        write_channel_tlv(&mut self.tlvs, TlvType::Channel, channel);
        self
    }

    pub fn append_pan_id(&mut self, pan_id: u16) -> &mut Self {
        let mut v = Writer::new();
        v.write_u16_be(pan_id);
        self.tlvs.append_tlv(TlvType::PanId, v.as_slice());
        self
    }

    pub fn append_active_timestamp(&mut self, timestamp: u64) -> &mut Self {
        let mut v = Writer::new();
        v.write_u64_be(timestamp);
        self.tlvs.append_tlv(TlvType::ActiveTimestamp, v.as_slice());
        self
    }

    pub fn append_pending_timestamp(&mut self, timestamp: u64) -> &mut Self {
        let mut v = Writer::new();
        v.write_u64_be(timestamp);
        self.tlvs.append_tlv(TlvType::PendingTimestamp, v.as_slice());
        self
    }

    pub fn append_csl_channel(&mut self, channel: u8) -> &mut Self {
        write_channel_tlv(&mut self.tlvs, TlvType::CslChannel, channel);
        self
    }

    pub fn append_csl_timeout(&mut self, timeout_secs: u32) -> &mut Self {
        let mut v = Writer::new();
        v.write_u32_be(timeout_secs);
        self.tlvs.append_tlv(TlvType::CslTimeout, v.as_slice());
        self
    }

    pub fn append_csl_accuracy(&mut self, accuracy: &CslAccuracy) -> &mut Self {
        write_csl_accuracy(&mut self.tlvs, accuracy);
        self
    }

    /// Advertise second-tier parenting capability: own locator, prefix
    /// length, and hop count to the full-device parent.
    pub fn append_sub_child_link(&mut self, rloc16: Rloc16, prefix_len: u8, hops: u8) -> &mut Self {
        let mut v = Writer::new();
        v.write_u16_be(rloc16.0);
        v.write_u8(prefix_len);
        v.write_u8(hops);
        self.tlvs.append_tlv(TlvType::SubChildLink, v.as_slice());
        self
    }

    /// Identify the second-tier device a forwarded message concerns.
    pub fn append_from_sub_child(&mut self, rloc16: Rloc16, ext: Option<&ExtAddress>) -> &mut Self {
        let mut v = Writer::new();
        v.write_u16_be(rloc16.0);
        if let Some(ext) = ext {
            v.write_bytes(&ext.0);
        }
        self.tlvs.append_tlv(TlvType::FromSubChild, v.as_slice());
        self
    }

    pub fn append_rloc_prefix_length(&mut self, prefix_len: u8) -> &mut Self {
        self.tlvs.append_tlv(TlvType::RlocPrefixLength, &[prefix_len]);
        self
    }

    /// Finalize as a secured UDP payload.
    pub fn secure<C: Crypto>(
        self,
        crypto: &C,
        key_sequence: u32,
        frame_counter: u32,
        sender: &Ip6Address,
        receiver: &Ip6Address,
    ) -> Vec<u8> {
        let header = SecurityHeader {
            frame_counter,
            key_id: key_sequence,
        };

        let mut payload = Vec::with_capacity(1 + self.tlvs.len());
        payload.push(self.command as u8);
        payload.extend_from_slice(self.tlvs.as_slice());

        let key = crypto.mle_key(key_sequence);
        let nonce = build_nonce(&sender.ext_address(), frame_counter);
        let aad = build_aad(sender, receiver, &header);
        let tag = crypto.ccm_encrypt(&key, &nonce, &aad, &mut payload);

        let mut out = Writer::new();
        out.write_u8(SECURITY_SUITE_154);
        header.write(&mut out);
        out.write_bytes(&payload);
        out.write_bytes(&tag);
        out.into_vec()
    }

    /// Finalize without security (discovery messages only).
    pub fn unsecured(self) -> Vec<u8> {
        debug_assert!(self.command.allowed_unsecured());
        let mut out = Writer::new();
        out.write_u8(SECURITY_SUITE_NONE);
        out.write_u8(self.command as u8);
        out.write_bytes(self.tlvs.as_slice());
        out.into_vec()
    }
}

/// Read a FromSubChild TLV: addressed locator plus optional extended
/// address of the second-tier device.
pub fn read_from_sub_child(tlvs: &[u8]) -> Result<(Rloc16, Option<ExtAddress>), Error> {
    let v = crate::wire::find_tlv(tlvs, TlvType::FromSubChild)?;
    let mut r = Reader::new(v);
    let rloc = Rloc16(r.read_u16_be()?);
    let ext = if r.remaining() >= 8 {
        let bytes: [u8; 8] = r.read_bytes(8)?.try_into().map_err(|_| Error::Parse)?;
        Some(ExtAddress(bytes))
    } else {
        None
    };
    Ok((rloc, ext))
}

/// Read a SubChildLink TLV.
pub fn read_sub_child_link(tlvs: &[u8]) -> Result<(Rloc16, u8, u8), Error> {
    let v = crate::wire::find_tlv(tlvs, TlvType::SubChildLink)?;
    let mut r = Reader::new(v);
    Ok((Rloc16(r.read_u16_be()?), r.read_u8()?, r.read_u8()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::test_impls::MockCrypto;
    use crate::wire::{find_tlv, read_source_address};

    fn addr_pair() -> (Ip6Address, Ip6Address) {
        let a = Ip6Address::link_local(&ExtAddress([1, 2, 3, 4, 5, 6, 7, 8]));
        let b = Ip6Address::link_local(&ExtAddress([8, 7, 6, 5, 4, 3, 2, 1]));
        (a, b)
    }

    #[test]
    fn test_secured_roundtrip() {
        let crypto = MockCrypto::new();
        let (src, dst) = addr_pair();

        let mut msg = MleMessage::new(Command::Advertisement);
        msg.append_source_address(Rloc16(0x6c00))
            .append_leader_data(&LeaderData {
                partition_id: 1,
                weighting: 64,
                data_version: 2,
                stable_data_version: 2,
                leader_router_id: 27,
            });
        let bytes = msg.secure(&crypto, 3, 42, &src, &dst);

        assert_eq!(bytes[0], SECURITY_SUITE_154);

        let rx = parse(&crypto, &bytes, &src, &dst).unwrap();
        assert!(rx.secured);
        assert_eq!(rx.command, Command::Advertisement);
        assert_eq!(rx.key_sequence, 3);
        assert_eq!(rx.frame_counter, 42);
        assert_eq!(read_source_address(&rx.tlvs).unwrap(), Rloc16(0x6c00));
    }

    #[test]
    fn test_secured_rejects_wrong_receiver() {
        let crypto = MockCrypto::new();
        let (src, dst) = addr_pair();
        let other = Ip6Address::link_local(&ExtAddress([9; 8]));

        let bytes = MleMessage::new(Command::Advertisement).secure(&crypto, 0, 1, &src, &dst);

        // AAD covers the receiver address.
        assert_eq!(parse(&crypto, &bytes, &src, &other), Err(Error::Security));
    }

    #[test]
    fn test_secured_rejects_bit_flip() {
        let crypto = MockCrypto::new();
        let (src, dst) = addr_pair();
        let mut bytes = MleMessage::new(Command::DataRequest).secure(&crypto, 0, 1, &src, &dst);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert_eq!(parse(&crypto, &bytes, &src, &dst), Err(Error::Security));
    }

    #[test]
    fn test_unsecured_only_discovery() {
        let crypto = MockCrypto::new();
        let (src, dst) = addr_pair();

        let bytes = MleMessage::new(Command::DiscoveryResponse).unsecured();
        let rx = parse(&crypto, &bytes, &src, &dst).unwrap();
        assert!(!rx.secured);
        assert_eq!(rx.command, Command::DiscoveryResponse);

        // Hand-craft an unsecured Advertisement; must be dropped.
        let bad = [SECURITY_SUITE_NONE, Command::Advertisement as u8];
        assert_eq!(parse(&crypto, &bad, &src, &dst), Err(Error::Drop));
    }

    #[test]
    fn test_unknown_command_is_drop() {
        let crypto = MockCrypto::new();
        let (src, dst) = addr_pair();

        // Secure a payload with an out-of-set command byte by hand.
        let header = SecurityHeader {
            frame_counter: 1,
            key_id: 0,
        };
        let mut payload = alloc::vec![200u8];
        let key = crypto.mle_key(0);
        let nonce = build_nonce(&src.ext_address(), 1);
        let aad = build_aad(&src, &dst, &header);
        let tag = crypto.ccm_encrypt(&key, &nonce, &aad, &mut payload);

        let mut w = Writer::new();
        w.write_u8(SECURITY_SUITE_154);
        header.write(&mut w);
        w.write_bytes(&payload);
        w.write_bytes(&tag);

        assert_eq!(parse(&crypto, &w.into_vec(), &src, &dst), Err(Error::Drop));
    }

    #[test]
    fn test_aux_header_len_matches_layout() {
        let crypto = MockCrypto::new();
        let (src, dst) = addr_pair();
        let bytes = MleMessage::new(Command::DataRequest).secure(&crypto, 0, 1, &src, &dst);
        // suite + control + counter + key id + command + tag and no TLVs
        assert_eq!(bytes.len(), aux_header_len() + MLE_TAG_LEN);
    }

    #[test]
    fn test_short_message_is_parse_error() {
        let crypto = MockCrypto::new();
        let (src, dst) = addr_pair();
        assert_eq!(parse(&crypto, &[], &src, &dst), Err(Error::Parse));
        assert_eq!(
            parse(&crypto, &[SECURITY_SUITE_154, 1, 0, 0], &src, &dst),
            Err(Error::Parse)
        );
    }

    #[test]
    fn test_sub_child_tlvs() {
        let mut msg = MleMessage::new(Command::ChildUpdateRequest);
        msg.append_from_sub_child(Rloc16(0x2811), Some(&ExtAddress([5; 8])))
            .append_sub_child_link(Rloc16(0x2810), 4, 1)
            .append_rloc_prefix_length(8);

        let tlvs = msg.tlv_bytes().to_vec();
        let (rloc, ext) = read_from_sub_child(&tlvs).unwrap();
        assert_eq!(rloc, Rloc16(0x2811));
        assert_eq!(ext, Some(ExtAddress([5; 8])));

        let (link_rloc, prefix, hops) = read_sub_child_link(&tlvs).unwrap();
        assert_eq!(link_rloc, Rloc16(0x2810));
        assert_eq!(prefix, 4);
        assert_eq!(hops, 1);
        assert_eq!(
            crate::wire::read_u8_tlv(&tlvs, TlvType::RlocPrefixLength).unwrap(),
            8
        );
        assert!(find_tlv(&tlvs, TlvType::Status).is_err());
    }
}
