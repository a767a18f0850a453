//! Core types and constants for the weftmesh protocol.

use core::fmt;

use crate::time::{Duration, DurationUs};

// Protocol limits (not configurable via NodeConfig)
/// UDP port for mesh link establishment messages.
pub const MLE_UDP_PORT: u16 = 19788;
/// Required hop limit on all secured MLE datagrams.
pub const MLE_HOP_LIMIT: u8 = 255;
/// Length of the AES-CCM authentication tag on secured messages.
pub const MLE_TAG_LEN: usize = 4;
/// Length of an attach challenge.
pub const CHALLENGE_LEN: usize = 8;
/// Maximum TLV types a peer may request in a single message.
pub const MAX_REQUEST_TLVS: usize = 6;
/// Minimum protocol version accepted from attaching peers.
pub const MIN_PEER_VERSION: u16 = 4;
/// Version advertised in outgoing messages.
pub const PROTOCOL_VERSION: u16 = 4;

// CSL period and phase are carried in ten-symbol units (10 us at the
// 1 us symbol time of the underlying PHY).
pub const US_PER_TEN_SYMBOLS: u64 = 10;

// Attach cycle timing
pub const PARENT_REQUEST_ROUTER_TIMEOUT: Duration = Duration::from_millis(750);
pub const PARENT_REQUEST_REED_TIMEOUT: Duration = Duration::from_millis(1250);
pub const CHILD_ID_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1250);
pub const ATTACH_START_JITTER: Duration = Duration::from_millis(50);
pub const ATTACH_BACKOFF_MIN_INTERVAL: Duration = Duration::from_millis(251);
pub const ATTACH_BACKOFF_MAX_INTERVAL: Duration = Duration::from_millis(1_200_000);
pub const ATTACH_BACKOFF_JITTER: Duration = Duration::from_millis(115);
/// Successful attach resets the backoff counter after this settle time.
pub const ATTACH_BACKOFF_RESET_DELAY: Duration = Duration::from_millis(1_200_000);

/// Parent Requests sent to routers only during the first attach cycle.
pub const FIRST_CYCLE_PARENT_REQUESTS_TO_ROUTERS: u8 = 1;
/// Total Parent Requests during the first attach cycle.
pub const FIRST_CYCLE_TOTAL_PARENT_REQUESTS: u8 = 2;
/// Parent Requests sent to routers only on subsequent cycles.
pub const NEXT_CYCLE_PARENT_REQUESTS_TO_ROUTERS: u8 = 0;
/// Total Parent Requests on subsequent cycles.
pub const NEXT_CYCLE_TOTAL_PARENT_REQUESTS: u8 = 1;

// Retransmission tracking
pub const RETX_DELAY: Duration = Duration::from_millis(1600);
pub const RETX_JITTER: Duration = Duration::from_millis(100);
pub const MAX_CHILD_KEEP_ALIVE_ATTEMPTS: u8 = 3;
pub const MAX_TRANSMISSION_ATTEMPTS: u8 = 3;

// Delayed responses
pub const MAX_RESPONSE_DELAY: Duration = Duration::from_millis(1000);
/// Minimum spacing so a response is enqueued before a follow-up Data Request.
pub const MIN_RESPONSE_DELAY: Duration = Duration::from_millis(10);

// Announce handling
pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_millis(1_440_000);
pub const MIN_ANNOUNCE_DELAY: Duration = Duration::from_millis(80);
pub const ANNOUNCE_PROCESS_TIMEOUT: Duration = Duration::from_millis(250);

// Graceful detach
pub const DETACH_GRACEFULLY_TIMEOUT: Duration = Duration::from_millis(1000);

// CSL transmitter
pub const MAX_CSL_TRIGGERED_TX_ATTEMPTS: u8 = 4;
pub const MAX_POLL_TRIGGERED_TX_ATTEMPTS: u8 = 3;
/// Configured lead time for handing a frame to the radio before its CSL window.
pub const CSL_REQUEST_AHEAD: DurationUs = DurationUs::from_us(2000);
/// Guard added when verifying a late frame request can still hit its window.
pub const CSL_FRAME_PREPARATION_GUARD: DurationUs = DurationUs::from_us(1500);
/// Fallback period when a neighbor reports zero (malformed but recoverable).
pub const CSL_FALLBACK_PERIOD_US: DurationUs = DurationUs::from_us(10_000);

// CSL receiver
pub const CSL_RECEIVE_TIME_AHEAD: DurationUs = DurationUs::from_us(320);
pub const CSL_MIN_RECEIVE_ON_AHEAD: DurationUs = DurationUs::from_us(192);
pub const CSL_MIN_RECEIVE_ON_AFTER: DurationUs = DurationUs::from_us(64);
/// Extra guard on the parent-candidate window while its link settles.
pub const CSL_CANDIDATE_WINDOW_GUARD: DurationUs = DurationUs::from_us(5000);
/// Duration of one wakeup-listen receive window.
pub const WAKEUP_LISTEN_LENGTH: DurationUs = DurationUs::from_us(8000);

// Sub-child attach (see DESIGN.md for the transient-timeout decision)
pub const SUBCHILD_ATTACH_TIMEOUT_SECS: u32 = 100;
pub const SUBCHILD_PARENT_RESPONSE_MAX_DELAY: Duration = Duration::from_millis(50);
pub const DETACH_PENDING_RETX_FACTOR: u64 = 4;
pub const DETACH_PENDING_RETX_PAD: Duration = Duration::from_millis(1000);
/// A child may parent sub-children while its RLOC prefix is shorter than this.
pub const MAX_RLOC_PREFIX_LEN: u8 = 9;

/// 8-byte IEEE extended (EUI-64 derived) address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ExtAddress(pub [u8; 8]);

impl ExtAddress {
    /// Derive the extended address from a link-local IPv6 interface id.
    ///
    /// The universal/local bit is inverted per RFC 4291 appendix A.
    pub fn from_iid(iid: &[u8; 8]) -> Self {
        let mut bytes = *iid;
        bytes[0] ^= 0x02;
        ExtAddress(bytes)
    }

    /// Produce the link-local interface id for this address.
    pub fn to_iid(&self) -> [u8; 8] {
        let mut iid = self.0;
        iid[0] ^= 0x02;
        iid
    }
}

impl fmt::Debug for ExtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// 16-bit mesh-routing locator.
///
/// Top bits identify the parent router, bottom bits a child within it.
/// Sub-child parenting subdivides the child bits further.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Rloc16(pub u16);

impl Rloc16 {
    /// Sentinel for an unassigned locator.
    pub const INVALID: Rloc16 = Rloc16(0xfffe);

    const ROUTER_ID_OFFSET: u16 = 10;
    const CHILD_MASK: u16 = (1 << Self::ROUTER_ID_OFFSET) - 1;

    /// Whether this locator belongs to a router (child bits all zero).
    pub fn is_router(self) -> bool {
        self != Self::INVALID && (self.0 & Self::CHILD_MASK) == 0
    }

    /// Router id portion of the locator.
    pub fn router_id(self) -> u8 {
        (self.0 >> Self::ROUTER_ID_OFFSET) as u8
    }

    /// Whether both locators live under the same router.
    pub fn matches_router_of(self, other: Rloc16) -> bool {
        self.router_id() == other.router_id()
    }
}

impl fmt::Debug for Rloc16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// IPv6 address, carried opaque; the core only constructs link-local
/// and well-known multicast forms.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Ip6Address(pub [u8; 16]);

impl Ip6Address {
    /// Link-local all-routers multicast (ff02::2).
    pub const LINK_LOCAL_ALL_ROUTERS: Ip6Address = {
        let mut a = [0u8; 16];
        a[0] = 0xff;
        a[1] = 0x02;
        a[15] = 0x02;
        Ip6Address(a)
    };

    /// Link-local all-nodes multicast (ff02::1).
    pub const LINK_LOCAL_ALL_NODES: Ip6Address = {
        let mut a = [0u8; 16];
        a[0] = 0xff;
        a[1] = 0x02;
        a[15] = 0x01;
        Ip6Address(a)
    };

    /// Build the link-local unicast address for an extended address.
    pub fn link_local(ext: &ExtAddress) -> Self {
        let mut a = [0u8; 16];
        a[0] = 0xfe;
        a[1] = 0x80;
        a[8..].copy_from_slice(&ext.to_iid());
        Ip6Address(a)
    }

    /// Whether the address is any multicast address.
    pub fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }

    /// Whether the address is link-local unicast (fe80::/10).
    pub fn is_link_local(&self) -> bool {
        self.0[0] == 0xfe && (self.0[1] & 0xc0) == 0x80
    }

    /// Interface id portion (last 8 bytes).
    pub fn iid(&self) -> [u8; 8] {
        let mut iid = [0u8; 8];
        iid.copy_from_slice(&self.0[8..]);
        iid
    }

    /// Extended address implied by the interface id.
    pub fn ext_address(&self) -> ExtAddress {
        let iid = self.iid();
        ExtAddress::from_iid(&iid)
    }
}

impl fmt::Debug for Ip6Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.0.chunks(2).enumerate() {
            if i != 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}{:02x}", chunk[0], chunk[1])?;
        }
        Ok(())
    }
}

// Device mode flags byte layout (Mode TLV value):
// - bit 3: rx on when idle
// - bit 1: full thread device
// - bit 0: full network data
// - bit 2: secure data requests (reserved, always set by 1.2+ devices)
pub(crate) const MODE_RX_ON_WHEN_IDLE: u8 = 0x08;
pub(crate) const MODE_SECURE_DATA_REQUESTS: u8 = 0x04;
pub(crate) const MODE_FULL_THREAD_DEVICE: u8 = 0x02;
pub(crate) const MODE_FULL_NETWORK_DATA: u8 = 0x01;

/// Device mode advertised in the Mode TLV.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceMode(u8);

impl DeviceMode {
    /// Build a mode byte from components.
    pub fn new(rx_on_when_idle: bool, full_thread_device: bool, full_network_data: bool) -> Self {
        let mut bits = MODE_SECURE_DATA_REQUESTS;
        if rx_on_when_idle {
            bits |= MODE_RX_ON_WHEN_IDLE;
        }
        if full_thread_device {
            bits |= MODE_FULL_THREAD_DEVICE;
        }
        if full_network_data {
            bits |= MODE_FULL_NETWORK_DATA;
        }
        DeviceMode(bits)
    }

    /// Raw mode byte as carried in the Mode TLV.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Reconstruct from a received Mode TLV byte.
    pub fn from_bits(bits: u8) -> Self {
        DeviceMode(bits)
    }

    pub fn rx_on_when_idle(self) -> bool {
        self.0 & MODE_RX_ON_WHEN_IDLE != 0
    }

    pub fn full_thread_device(self) -> bool {
        self.0 & MODE_FULL_THREAD_DEVICE != 0
    }

    pub fn full_network_data(self) -> bool {
        self.0 & MODE_FULL_NETWORK_DATA != 0
    }
}

impl fmt::Debug for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mode({}{}{})",
            if self.rx_on_when_idle() { "r" } else { "-" },
            if self.full_thread_device() { "d" } else { "-" },
            if self.full_network_data() { "n" } else { "-" },
        )
    }
}

/// Device role within the mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeviceRole {
    #[default]
    Disabled,
    Detached,
    Child,
    Router,
    Leader,
}

/// Stage of the attach cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AttachState {
    #[default]
    Idle,
    Start,
    ParentRequest,
    Announce,
    ChildIdRequest,
}

/// Dataset fallback state across attach cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReattachState {
    #[default]
    Stop,
    Active,
    Pending,
}

/// What kind of parent/partition the attach cycle is looking for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AttachMode {
    #[default]
    AnyPartition,
    SamePartition,
    BetterPartition,
    DowngradeToReed,
    BetterParent,
    SelectedParent,
}

/// Link state of a peer entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Invalid,
    Restored,
    ParentRequest,
    ParentResponse,
    LinkRequest,
    LinkAccept,
    ChildIdRequest,
    Valid,
    DetachPending,
}

/// State filters used when searching or iterating peer tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateFilter {
    AnyExceptInvalid,
    Valid,
    ValidOrRestoring,
    AnyExceptValidOrRestoring,
    /// States in which link security material has been exchanged.
    SecurityReady,
    DetachPending,
}

impl StateFilter {
    /// Whether `state` passes this filter.
    pub fn matches(self, state: LinkState) -> bool {
        match self {
            StateFilter::AnyExceptInvalid => state != LinkState::Invalid,
            StateFilter::Valid => state == LinkState::Valid,
            StateFilter::ValidOrRestoring => {
                matches!(state, LinkState::Valid | LinkState::Restored)
            }
            StateFilter::AnyExceptValidOrRestoring => {
                !matches!(state, LinkState::Valid | LinkState::Restored)
            }
            StateFilter::SecurityReady => matches!(
                state,
                LinkState::Valid
                    | LinkState::LinkAccept
                    | LinkState::ChildIdRequest
                    | LinkState::DetachPending
            ),
            StateFilter::DetachPending => state == LinkState::DetachPending,
        }
    }
}

/// Link quality derived from link margin, 0 (unusable) to 3 (best).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LinkQuality {
    #[default]
    Zero,
    One,
    Two,
    Three,
}

impl LinkQuality {
    /// Map a link margin in dB to a quality class.
    pub fn from_link_margin(margin: u8) -> Self {
        match margin {
            0..=2 => LinkQuality::Zero,
            3..=9 => LinkQuality::One,
            10..=20 => LinkQuality::Two,
            _ => LinkQuality::Three,
        }
    }
}

/// Partition leader information distributed in the Leader Data TLV.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct LeaderData {
    pub partition_id: u32,
    pub weighting: u8,
    pub data_version: u8,
    pub stable_data_version: u8,
    pub leader_router_id: u8,
}

/// CSL clock accuracy advertised by a peer.
///
/// `uncertainty` is in units of 10 microseconds, as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CslAccuracy {
    pub clock_accuracy_ppm: u8,
    pub uncertainty: u8,
}

impl CslAccuracy {
    /// Uncertainty in microseconds.
    pub fn uncertainty_us(&self) -> u64 {
        self.uncertainty as u64 * 10
    }
}

impl Default for CslAccuracy {
    fn default() -> Self {
        // Worst case until the peer reports real values.
        CslAccuracy {
            clock_accuracy_ppm: u8::MAX,
            uncertainty: u8::MAX,
        }
    }
}

/// Error type shared by all protocol operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Malformed TLV or short message.
    Parse,
    /// Tag mismatch, replayed counter, or unknown key sequence.
    Security,
    /// Message dropped without state change.
    Drop,
    /// Duplicate of an already-accepted message.
    Duplicated,
    /// Requested entity absent.
    NotFound,
    /// Buffer or table exhausted.
    NoBufs,
    /// Invalid argument.
    InvalidArgs,
    /// Operation not permitted in the current state.
    InvalidState,
    /// Another operation is in progress.
    Busy,
    /// Operation already done or in effect.
    Already,
    /// Peer rejected the operation.
    Rejected,
    /// No next hop toward the destination.
    NoRoute,
    /// Device transitioned to detached as part of this operation.
    Detached,
    /// Transmission or delivery failed.
    Failed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Parse => "parse failure",
            Error::Security => "security check failed",
            Error::Drop => "message dropped",
            Error::Duplicated => "duplicate message",
            Error::NotFound => "not found",
            Error::NoBufs => "no buffers",
            Error::InvalidArgs => "invalid arguments",
            Error::InvalidState => "invalid state",
            Error::Busy => "busy",
            Error::Already => "already",
            Error::Rejected => "rejected",
            Error::NoRoute => "no route",
            Error::Detached => "detached",
            Error::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Events surfaced to the application (pull model).
///
/// Role, partition, parent, and key-sequence changes are reported here,
/// never through error returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    RoleChanged { role: DeviceRole },
    PartitionIdChanged { partition_id: u32 },
    ParentChanged { rloc16: Rloc16 },
    KeySequenceChanged { key_sequence: u32 },
    ChildAdded { rloc16: Rloc16 },
    ChildRemoved { rloc16: Rloc16 },
}

/// Counters for attach and role activity, exposed for monitoring.
#[derive(Clone, Copy, Debug, Default)]
pub struct Counters {
    pub attach_attempts: u64,
    pub parent_changes: u64,
    pub role_changes: u64,
    pub rx_secured: u64,
    pub rx_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rloc16_router() {
        assert!(Rloc16(0x6c00).is_router());
        assert!(!Rloc16(0x6c01).is_router());
        assert!(!Rloc16::INVALID.is_router());
        assert_eq!(Rloc16(0x6c01).router_id(), 0x1b);
        assert!(Rloc16(0x6c01).matches_router_of(Rloc16(0x6c00)));
        assert!(!Rloc16(0x7001).matches_router_of(Rloc16(0x6c00)));
    }

    #[test]
    fn test_ext_address_iid_roundtrip() {
        let ext = ExtAddress([0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0]);
        let iid = ext.to_iid();
        assert_eq!(iid[0], 0x10);
        assert_eq!(ExtAddress::from_iid(&iid), ext);
    }

    #[test]
    fn test_link_local_address() {
        let ext = ExtAddress([2, 0, 0, 0, 0, 0, 0, 1]);
        let addr = Ip6Address::link_local(&ext);
        assert!(addr.is_link_local());
        assert!(!addr.is_multicast());
        assert_eq!(addr.ext_address(), ext);
    }

    #[test]
    fn test_multicast_addresses() {
        assert!(Ip6Address::LINK_LOCAL_ALL_ROUTERS.is_multicast());
        assert!(Ip6Address::LINK_LOCAL_ALL_NODES.is_multicast());
    }

    #[test]
    fn test_device_mode_bits() {
        let mode = DeviceMode::new(false, false, true);
        assert!(!mode.rx_on_when_idle());
        assert!(!mode.full_thread_device());
        assert!(mode.full_network_data());
        assert_eq!(DeviceMode::from_bits(mode.bits()), mode);

        let rx_on = DeviceMode::new(true, true, true);
        assert!(rx_on.rx_on_when_idle());
    }

    #[test]
    fn test_link_quality_classes() {
        assert_eq!(LinkQuality::from_link_margin(0), LinkQuality::Zero);
        assert_eq!(LinkQuality::from_link_margin(5), LinkQuality::One);
        assert_eq!(LinkQuality::from_link_margin(15), LinkQuality::Two);
        assert_eq!(LinkQuality::from_link_margin(30), LinkQuality::Three);
        assert!(LinkQuality::Three > LinkQuality::One);
    }

    #[test]
    fn test_state_filters() {
        assert!(StateFilter::AnyExceptInvalid.matches(LinkState::ParentRequest));
        assert!(!StateFilter::AnyExceptInvalid.matches(LinkState::Invalid));
        assert!(StateFilter::ValidOrRestoring.matches(LinkState::Restored));
        assert!(!StateFilter::Valid.matches(LinkState::Restored));
        assert!(StateFilter::SecurityReady.matches(LinkState::ChildIdRequest));
        assert!(!StateFilter::SecurityReady.matches(LinkState::ParentRequest));
    }
}
