//! Platform traits for radio, crypto, randomness, time, and stores.
//!
//! These traits keep the protocol portable across:
//! - Radio drivers (SPI transceivers, SoC radios, simulation)
//! - Cryptographic implementations (software, hardware AES-CCM)
//! - Non-volatile settings backends
//! - Network-data providers
//!
//! All operations are non-blocking; handlers run to completion.

use alloc::vec::Vec;
use core::fmt::Debug;

use crate::time::{Timestamp, TimestampUs};
use crate::types::{ExtAddress, LeaderData, Rloc16, MLE_TAG_LEN};

/// MAC-layer addressing for an outbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MacAddress {
    #[default]
    None,
    Short(Rloc16),
    Extended(ExtAddress),
}

/// Security material applied to a link-layer frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSecurity {
    pub frame_counter: u32,
    pub key_id: u8,
}

/// An outbound 802.15.4 frame as handed to the radio.
///
/// The MAC header details are owned by the frame composer; this carries
/// the fields the schedulers must control for retransmission continuity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TxFrame {
    pub payload: Vec<u8>,
    pub channel: u8,
    pub sequence: u8,
    pub src: MacAddress,
    pub dst: MacAddress,
    pub ack_requested: bool,
    pub frame_pending: bool,
    pub is_retransmission: bool,
    pub security: Option<FrameSecurity>,
    /// Switch back to this channel once the transmission completes.
    pub rx_channel_after_tx: Option<u8>,
    pub csma_enabled: bool,
}

impl TxFrame {
    /// Whether the frame carries no payload (poll-response placeholder).
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Outcome of a link-layer transmission, as reported by the radio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    /// Acknowledged (or no ack requested).
    Ok {
        /// The ack carried a CSL information element.
        acked_with_csl_ie: bool,
        /// Radio timestamp of the transmitted frame.
        timestamp_us: TimestampUs,
    },
    NoAck,
    ChannelAccessFailure,
    Abort,
}

/// Radio port: frame send/receive, timed receive, CSL configuration,
/// and the microsecond monotonic clock.
pub trait Radio {
    type Error: Debug;

    /// Enter receive state on `channel`.
    fn receive(&mut self, channel: u8) -> Result<(), Self::Error>;

    /// Arm a timed receive window.
    fn receive_at(
        &mut self,
        channel: u8,
        start_us: TimestampUs,
        duration_us: u64,
    ) -> Result<(), Self::Error>;

    /// Enter sleep state.
    fn sleep(&mut self) -> Result<(), Self::Error>;

    /// Transmit a frame as soon as possible.
    fn send(&mut self, frame: &TxFrame) -> Result<(), Self::Error>;

    /// Transmit a frame at a radio-clock time.
    fn send_at(&mut self, frame: &TxFrame, start_us: TimestampUs) -> Result<(), Self::Error>;

    /// Enable CSL operation with the given period (ten-symbol units).
    fn enable_csl(&mut self, period: u16) -> Result<(), Self::Error>;

    /// Report the next CSL sample time to the radio (for enh-ack IEs).
    fn update_csl_sample_time(&mut self, sample_time_us: TimestampUs);

    /// Register a short address in the radio CSL peer table.
    fn add_csl_short_entry(&mut self, rloc16: Rloc16) -> Result<(), Self::Error>;

    /// Register an extended address in the radio CSL peer table.
    fn add_csl_ext_entry(&mut self, ext: ExtAddress) -> Result<(), Self::Error>;

    /// Clear the short-address CSL peer table.
    fn clear_csl_short_entries(&mut self);

    /// Clear the extended-address CSL peer table.
    fn clear_csl_ext_entries(&mut self);

    /// Monotonic radio clock in microseconds.
    fn now_us(&self) -> TimestampUs;

    /// Bus speed between host and radio, Hz. Zero when unknown.
    fn bus_speed_hz(&self) -> u32;

    /// Bus latency between host and radio, microseconds.
    fn bus_latency_us(&self) -> u32;

    /// Local clock accuracy in parts per million.
    fn csl_accuracy_ppm(&self) -> u8;

    /// Local scheduling uncertainty, in units of 10 microseconds.
    fn csl_uncertainty(&self) -> u8;

    /// Whether the radio supports `receive_at` natively.
    fn supports_receive_timing(&self) -> bool;
}

/// Length of the AES-CCM nonce used by MLE message security.
pub const CCM_NONCE_LEN: usize = 13;

/// 128-bit key as used by MLE message security.
pub type Key = [u8; 16];

/// Cryptographic operations.
///
/// The key schedule lives behind this trait: `mle_key` derives the MLE
/// key for any key sequence number, so the core never holds key
/// material beyond the call. Implementations may be software AES or a
/// secure element.
pub trait Crypto {
    /// Derive the MLE key for a key sequence number.
    fn mle_key(&self, key_sequence: u32) -> Key;

    /// Encrypt `payload` in place and return the 4-byte tag.
    fn ccm_encrypt(
        &self,
        key: &Key,
        nonce: &[u8; CCM_NONCE_LEN],
        aad: &[u8],
        payload: &mut [u8],
    ) -> [u8; MLE_TAG_LEN];

    /// Decrypt `payload` in place and verify `tag`.
    fn ccm_decrypt(
        &self,
        key: &Key,
        nonce: &[u8; CCM_NONCE_LEN],
        aad: &[u8],
        payload: &mut [u8],
        tag: &[u8; MLE_TAG_LEN],
    ) -> bool;
}

/// Random number generator.
pub trait Random {
    /// Generate a random u64 in the range [min, max).
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    /// Generate a random u32.
    fn gen_u32(&mut self) -> u32 {
        self.gen_range(0, u32::MAX as u64 + 1) as u32
    }

    /// Fill a buffer with random bytes.
    fn fill_bytes(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.gen_range(0, 256) as u8;
        }
    }

    /// A random delay within [1, max] milliseconds, inclusive.
    fn random_delay(&mut self, max: crate::time::Duration) -> crate::time::Duration {
        crate::time::Duration::from_millis(1 + self.gen_range(0, max.as_millis()))
    }

    /// `value` offset by a random amount within ±`jitter`.
    fn add_jitter(
        &mut self,
        value: crate::time::Duration,
        jitter: crate::time::Duration,
    ) -> crate::time::Duration {
        let j = jitter.as_millis();
        if j == 0 {
            return value;
        }
        let offset = self.gen_range(0, 2 * j + 1);
        crate::time::Duration::from_millis(value.as_millis().saturating_sub(j).saturating_add(offset))
    }
}

/// Millisecond time source.
///
/// Handlers receive `now` explicitly; the trait exists for the async
/// driver loop and for priming timers at startup.
pub trait Clock {
    /// Current time in milliseconds since an arbitrary epoch.
    fn now(&self) -> Timestamp;
}

/// Keys recognized by the settings store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SettingsKey {
    ActiveDataset,
    PendingDataset,
    NetworkInfo,
    ParentInfo,
    ChildInfo,
    SlaacIidSecretKey,
    DadInfo,
    SrpEcdsaKey,
    SrpClientInfo,
    SrpServerInfo,
    BrUlaPrefix,
    BrOnLinkPrefixes,
    BorderAgentId,
    TcatCommrCert,
}

impl SettingsKey {
    /// Whether the key MUST be held in a secure storage region.
    pub fn is_sensitive(self) -> bool {
        matches!(
            self,
            SettingsKey::ActiveDataset | SettingsKey::PendingDataset | SettingsKey::SrpEcdsaKey
        )
    }
}

/// Non-volatile settings: opaque keyed blobs, some list-valued.
pub trait SettingsStore {
    /// Read the blob at `key`, entry `index` (0 for scalar keys).
    fn get(&self, key: SettingsKey, index: usize) -> Option<Vec<u8>>;

    /// Write the blob at `key`, replacing all entries.
    fn set(&mut self, key: SettingsKey, value: &[u8]);

    /// Append an entry to a list-valued key.
    fn add(&mut self, key: SettingsKey, value: &[u8]);

    /// Delete a key, or a single entry of a list-valued key.
    fn delete(&mut self, key: SettingsKey, index: Option<usize>);

    /// Erase everything.
    fn wipe(&mut self);
}

/// Network Data / dataset provider (leader data versions, dataset
/// timestamps, stored operational datasets).
pub trait NetworkDataStore {
    /// Current network data version (stable subset if `stable`).
    fn version(&self, stable: bool) -> u8;

    /// Current network data blob (stable subset if `stable`).
    fn network_data(&self, stable: bool) -> Vec<u8>;

    /// Install a network data blob received from the leader.
    fn set_network_data(&mut self, leader_data: &LeaderData, data: &[u8]);

    /// Timestamp of the committed active dataset, if any.
    fn active_timestamp(&self) -> Option<u64>;

    /// Timestamp of the stored pending dataset, if any.
    fn pending_timestamp(&self) -> Option<u64>;

    /// Save a received active dataset.
    fn save_active_dataset(&mut self, timestamp: u64, tlvs: &[u8]);

    /// Save a received pending dataset.
    fn save_pending_dataset(&mut self, timestamp: u64, tlvs: &[u8]);

    /// Clear the stored pending dataset.
    fn clear_pending_dataset(&mut self);

    /// Apply the stored pending dataset. Errors when none is stored.
    fn restore_pending(&mut self) -> Result<(), crate::types::Error>;

    /// Re-apply the stored active dataset.
    fn restore_active(&mut self) -> Result<(), crate::types::Error>;

    /// Whether the active dataset is missing fields needed to attach.
    fn is_active_partial(&self) -> bool;

    /// Supported channel mask (bit n = channel n) for announce cycling.
    fn channel_mask(&self) -> u32;
}

#[cfg(any(test, feature = "std"))]
pub mod test_impls {
    //! Deterministic implementations of the platform traits for unit
    //! tests and the simulator. Not cryptographically secure.

    use super::*;
    use crate::time::Duration;
    use crate::types::Error;
    use alloc::collections::VecDeque;
    use alloc::vec;
    use core::cell::{Cell, RefCell};
    use hashbrown::HashMap;

    /// Operations recorded by [`MockRadio`].
    #[derive(Clone, Debug, PartialEq)]
    pub enum RadioOp {
        Receive { channel: u8 },
        ReceiveAt { channel: u8, start_us: u64, duration_us: u64 },
        Sleep,
        Send(TxFrame),
        SendAt(TxFrame, u64),
        EnableCsl { period: u16 },
        AddShortEntry(Rloc16),
        AddExtEntry(ExtAddress),
        ClearShortEntries,
        ClearExtEntries,
    }

    /// Mock radio that records every operation and serves a settable clock.
    #[derive(Default)]
    pub struct MockRadio {
        pub ops: Vec<RadioOp>,
        pub now_us: u64,
        pub bus_speed_hz: u32,
        pub bus_latency_us: u32,
        pub accuracy_ppm: u8,
        pub uncertainty: u8,
        pub receive_timing: bool,
    }

    impl MockRadio {
        pub fn new() -> Self {
            MockRadio {
                bus_speed_hz: 8_000_000,
                accuracy_ppm: 20,
                uncertainty: 10,
                receive_timing: true,
                ..Default::default()
            }
        }

        /// Frames handed to `send`/`send_at`, in order.
        pub fn sent_frames(&self) -> Vec<&TxFrame> {
            self.ops
                .iter()
                .filter_map(|op| match op {
                    RadioOp::Send(f) => Some(f),
                    RadioOp::SendAt(f, _) => Some(f),
                    _ => None,
                })
                .collect()
        }
    }

    #[derive(Debug)]
    pub struct MockRadioError;

    impl Radio for MockRadio {
        type Error = MockRadioError;

        fn receive(&mut self, channel: u8) -> Result<(), Self::Error> {
            self.ops.push(RadioOp::Receive { channel });
            Ok(())
        }

        fn receive_at(
            &mut self,
            channel: u8,
            start_us: TimestampUs,
            duration_us: u64,
        ) -> Result<(), Self::Error> {
            self.ops.push(RadioOp::ReceiveAt {
                channel,
                start_us: start_us.as_us(),
                duration_us,
            });
            Ok(())
        }

        fn sleep(&mut self) -> Result<(), Self::Error> {
            self.ops.push(RadioOp::Sleep);
            Ok(())
        }

        fn send(&mut self, frame: &TxFrame) -> Result<(), Self::Error> {
            self.ops.push(RadioOp::Send(frame.clone()));
            Ok(())
        }

        fn send_at(&mut self, frame: &TxFrame, start_us: TimestampUs) -> Result<(), Self::Error> {
            self.ops.push(RadioOp::SendAt(frame.clone(), start_us.as_us()));
            Ok(())
        }

        fn enable_csl(&mut self, period: u16) -> Result<(), Self::Error> {
            self.ops.push(RadioOp::EnableCsl { period });
            Ok(())
        }

        fn update_csl_sample_time(&mut self, _sample_time_us: TimestampUs) {}

        fn add_csl_short_entry(&mut self, rloc16: Rloc16) -> Result<(), Self::Error> {
            self.ops.push(RadioOp::AddShortEntry(rloc16));
            Ok(())
        }

        fn add_csl_ext_entry(&mut self, ext: ExtAddress) -> Result<(), Self::Error> {
            self.ops.push(RadioOp::AddExtEntry(ext));
            Ok(())
        }

        fn clear_csl_short_entries(&mut self) {
            self.ops.push(RadioOp::ClearShortEntries);
        }

        fn clear_csl_ext_entries(&mut self) {
            self.ops.push(RadioOp::ClearExtEntries);
        }

        fn now_us(&self) -> TimestampUs {
            TimestampUs::from_us(self.now_us)
        }

        fn bus_speed_hz(&self) -> u32 {
            self.bus_speed_hz
        }

        fn bus_latency_us(&self) -> u32 {
            self.bus_latency_us
        }

        fn csl_accuracy_ppm(&self) -> u8 {
            self.accuracy_ppm
        }

        fn csl_uncertainty(&self) -> u8 {
            self.uncertainty
        }

        fn supports_receive_timing(&self) -> bool {
            self.receive_timing
        }
    }

    /// Deterministic mock crypto.
    ///
    /// The "cipher" XORs payload bytes with a keystream derived from
    /// (key, nonce) and the "tag" folds key, nonce, AAD and ciphertext.
    /// Symmetric, so encrypt/decrypt round-trip and any corruption of
    /// payload, AAD, key, or nonce breaks tag verification.
    #[derive(Clone, Default)]
    pub struct MockCrypto {
        pub network_key: Key,
    }

    impl MockCrypto {
        pub fn new() -> Self {
            MockCrypto {
                network_key: *b"weftmesh-netkey!",
            }
        }

        fn keystream_seed(key: &Key, nonce: &[u8; CCM_NONCE_LEN]) -> u64 {
            let mut seed = 0xcbf29ce484222325u64;
            for &b in key.iter().chain(nonce.iter()) {
                seed ^= b as u64;
                seed = seed.wrapping_mul(0x100000001b3);
            }
            seed
        }

        fn apply_keystream(key: &Key, nonce: &[u8; CCM_NONCE_LEN], payload: &mut [u8]) {
            let mut state = Self::keystream_seed(key, nonce);
            for b in payload.iter_mut() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                *b ^= (state >> 33) as u8;
            }
        }

        fn compute_tag(
            key: &Key,
            nonce: &[u8; CCM_NONCE_LEN],
            aad: &[u8],
            ciphertext: &[u8],
        ) -> [u8; MLE_TAG_LEN] {
            let mut acc = Self::keystream_seed(key, nonce);
            for &b in aad.iter().chain(ciphertext.iter()) {
                acc ^= b as u64;
                acc = acc.wrapping_mul(0x100000001b3);
            }
            acc.to_le_bytes()[..MLE_TAG_LEN].try_into().unwrap()
        }
    }

    impl Crypto for MockCrypto {
        fn mle_key(&self, key_sequence: u32) -> Key {
            let mut key = self.network_key;
            let seq = key_sequence.to_le_bytes();
            for (i, b) in key.iter_mut().enumerate() {
                *b ^= seq[i % 4].wrapping_add(i as u8);
            }
            key
        }

        fn ccm_encrypt(
            &self,
            key: &Key,
            nonce: &[u8; CCM_NONCE_LEN],
            aad: &[u8],
            payload: &mut [u8],
        ) -> [u8; MLE_TAG_LEN] {
            Self::apply_keystream(key, nonce, payload);
            Self::compute_tag(key, nonce, aad, payload)
        }

        fn ccm_decrypt(
            &self,
            key: &Key,
            nonce: &[u8; CCM_NONCE_LEN],
            aad: &[u8],
            payload: &mut [u8],
            tag: &[u8; MLE_TAG_LEN],
        ) -> bool {
            if Self::compute_tag(key, nonce, aad, payload) != *tag {
                return false;
            }
            Self::apply_keystream(key, nonce, payload);
            true
        }
    }

    /// Deterministic LCG random source.
    pub struct MockRandom {
        pub state: u64,
    }

    impl Default for MockRandom {
        fn default() -> Self {
            Self { state: 12345 }
        }
    }

    impl MockRandom {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_seed(seed: u64) -> Self {
            Self { state: seed }
        }
    }

    impl Random for MockRandom {
        fn gen_range(&mut self, min: u64, max: u64) -> u64 {
            self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let range = max - min;
            if range == 0 {
                return min;
            }
            min + (self.state % range)
        }
    }

    /// Settable mock clock.
    #[derive(Default)]
    pub struct MockClock {
        pub now_ms: Cell<u64>,
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn advance(&self, d: Duration) {
            self.now_ms.set(self.now_ms.get() + d.as_millis());
        }

        pub fn set(&self, t: Timestamp) {
            self.now_ms.set(t.as_millis());
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Timestamp {
            Timestamp::from_millis(self.now_ms.get())
        }
    }

    /// In-memory settings store.
    #[derive(Default)]
    pub struct MockSettings {
        entries: RefCell<HashMap<SettingsKey, Vec<Vec<u8>>>>,
    }

    impl MockSettings {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl SettingsStore for MockSettings {
        fn get(&self, key: SettingsKey, index: usize) -> Option<Vec<u8>> {
            self.entries.borrow().get(&key).and_then(|v| v.get(index)).cloned()
        }

        fn set(&mut self, key: SettingsKey, value: &[u8]) {
            self.entries.borrow_mut().insert(key, vec![value.to_vec()]);
        }

        fn add(&mut self, key: SettingsKey, value: &[u8]) {
            self.entries
                .borrow_mut()
                .entry(key)
                .or_default()
                .push(value.to_vec());
        }

        fn delete(&mut self, key: SettingsKey, index: Option<usize>) {
            let mut entries = self.entries.borrow_mut();
            match index {
                None => {
                    entries.remove(&key);
                }
                Some(i) => {
                    if let Some(list) = entries.get_mut(&key) {
                        if i < list.len() {
                            list.remove(i);
                        }
                    }
                }
            }
        }

        fn wipe(&mut self) {
            self.entries.borrow_mut().clear();
        }
    }

    /// In-memory network data store.
    pub struct MockNetworkData {
        pub version: u8,
        pub stable_version: u8,
        pub network_data: Vec<u8>,
        pub active_timestamp: Option<u64>,
        pub pending_timestamp: Option<u64>,
        pub active_dataset: Vec<u8>,
        pub pending_dataset: Vec<u8>,
        pub active_partial: bool,
        pub channel_mask: u32,
        pub restore_log: VecDeque<&'static str>,
    }

    impl Default for MockNetworkData {
        fn default() -> Self {
            MockNetworkData {
                version: 0,
                stable_version: 0,
                network_data: Vec::new(),
                active_timestamp: None,
                pending_timestamp: None,
                active_dataset: Vec::new(),
                pending_dataset: Vec::new(),
                active_partial: false,
                channel_mask: 1 << 11,
                restore_log: VecDeque::new(),
            }
        }
    }

    impl MockNetworkData {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl NetworkDataStore for MockNetworkData {
        fn version(&self, stable: bool) -> u8 {
            if stable {
                self.stable_version
            } else {
                self.version
            }
        }

        fn network_data(&self, _stable: bool) -> Vec<u8> {
            self.network_data.clone()
        }

        fn set_network_data(&mut self, leader_data: &LeaderData, data: &[u8]) {
            self.version = leader_data.data_version;
            self.stable_version = leader_data.stable_data_version;
            self.network_data = data.to_vec();
        }

        fn active_timestamp(&self) -> Option<u64> {
            self.active_timestamp
        }

        fn pending_timestamp(&self) -> Option<u64> {
            self.pending_timestamp
        }

        fn save_active_dataset(&mut self, timestamp: u64, tlvs: &[u8]) {
            self.active_timestamp = Some(timestamp);
            self.active_dataset = tlvs.to_vec();
        }

        fn save_pending_dataset(&mut self, timestamp: u64, tlvs: &[u8]) {
            self.pending_timestamp = Some(timestamp);
            self.pending_dataset = tlvs.to_vec();
        }

        fn clear_pending_dataset(&mut self) {
            self.pending_timestamp = None;
            self.pending_dataset.clear();
        }

        fn restore_pending(&mut self) -> Result<(), Error> {
            self.restore_log.push_back("pending");
            if self.pending_timestamp.is_some() {
                Ok(())
            } else {
                Err(Error::NotFound)
            }
        }

        fn restore_active(&mut self) -> Result<(), Error> {
            self.restore_log.push_back("active");
            Ok(())
        }

        fn is_active_partial(&self) -> bool {
            self.active_partial
        }

        fn channel_mask(&self) -> u32 {
            self.channel_mask
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_impls::*;
    use super::*;

    #[test]
    fn test_mock_ccm_roundtrip() {
        let crypto = MockCrypto::new();
        let key = crypto.mle_key(7);
        let nonce = [0x11u8; CCM_NONCE_LEN];
        let aad = b"aad bytes";
        let plain = b"attach payload".to_vec();

        let mut buf = plain.clone();
        let tag = crypto.ccm_encrypt(&key, &nonce, aad, &mut buf);
        assert_ne!(buf, plain);

        let mut rx = buf.clone();
        assert!(crypto.ccm_decrypt(&key, &nonce, aad, &mut rx, &tag));
        assert_eq!(rx, plain);
    }

    #[test]
    fn test_mock_ccm_rejects_tampering() {
        let crypto = MockCrypto::new();
        let key = crypto.mle_key(7);
        let nonce = [0x11u8; CCM_NONCE_LEN];
        let mut buf = b"payload".to_vec();
        let tag = crypto.ccm_encrypt(&key, &nonce, b"aad", &mut buf);

        let mut tampered = buf.clone();
        tampered[0] ^= 1;
        assert!(!crypto.ccm_decrypt(&key, &nonce, b"aad", &mut tampered, &tag));

        let mut wrong_aad = buf.clone();
        assert!(!crypto.ccm_decrypt(&key, &nonce, b"bad", &mut wrong_aad, &tag));

        let other_key = crypto.mle_key(8);
        let mut wrong_key = buf.clone();
        assert!(!crypto.ccm_decrypt(&other_key, &nonce, b"aad", &mut wrong_key, &tag));
    }

    #[test]
    fn test_key_schedule_differs_by_sequence() {
        let crypto = MockCrypto::new();
        assert_ne!(crypto.mle_key(0), crypto.mle_key(1));
        assert_eq!(crypto.mle_key(5), crypto.mle_key(5));
    }

    #[test]
    fn test_random_jitter_bounds() {
        use crate::time::Duration;
        let mut rng = MockRandom::with_seed(99);
        for _ in 0..50 {
            let v = rng.add_jitter(Duration::from_millis(1000), Duration::from_millis(100));
            assert!(v >= Duration::from_millis(900));
            assert!(v <= Duration::from_millis(1100));
        }
        for _ in 0..50 {
            let d = rng.random_delay(Duration::from_millis(50));
            assert!(d >= Duration::from_millis(1) && d <= Duration::from_millis(50));
        }
    }

    #[test]
    fn test_mock_settings_lists() {
        let mut s = MockSettings::new();
        s.add(SettingsKey::ChildInfo, b"a");
        s.add(SettingsKey::ChildInfo, b"b");
        assert_eq!(s.get(SettingsKey::ChildInfo, 1).unwrap(), b"b");
        s.delete(SettingsKey::ChildInfo, Some(0));
        assert_eq!(s.get(SettingsKey::ChildInfo, 0).unwrap(), b"b");
        s.wipe();
        assert!(s.get(SettingsKey::ChildInfo, 0).is_none());
    }

    #[test]
    fn test_sensitive_keys() {
        assert!(SettingsKey::ActiveDataset.is_sensitive());
        assert!(SettingsKey::SrpEcdsaKey.is_sensitive());
        assert!(!SettingsKey::NetworkInfo.is_sensitive());
    }
}
