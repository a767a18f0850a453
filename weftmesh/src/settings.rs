//! Persisted-state blob layouts.
//!
//! Every blob is version-tagged (`version:u16` first) and little-endian
//! throughout. A version mismatch on restore is treated as no stored
//! state, which forces a fresh attach.
//!
//! `NetworkInfo` and `ParentInfo` drive role recovery after reset;
//! `ChildInfo` entries restore the child table of a sub-child parent.

use alloc::vec::Vec;

use crate::traits::{SettingsKey, SettingsStore};
use crate::types::{DeviceMode, DeviceRole, ExtAddress, Rloc16};
use crate::wire::{Reader, Writer};

/// Layout version of all blobs written by this implementation.
pub const SETTINGS_VERSION: u16 = 1;

/// Role and security state persisted across resets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkInfo {
    pub role: DeviceRole,
    pub device_mode: DeviceMode,
    pub rloc16: Rloc16,
    pub key_sequence: u32,
    pub mle_frame_counter: u32,
    pub ext_address: ExtAddress,
}

impl NetworkInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u16_le(SETTINGS_VERSION);
        w.write_u8(match self.role {
            DeviceRole::Disabled => 0,
            DeviceRole::Detached => 1,
            DeviceRole::Child => 2,
            DeviceRole::Router => 3,
            DeviceRole::Leader => 4,
        });
        w.write_u8(self.device_mode.bits());
        w.write_u16_le(self.rloc16.0);
        w.write_u32_le(self.key_sequence);
        w.write_u32_le(self.mle_frame_counter);
        w.write_bytes(&self.ext_address.0);
        w.into_vec()
    }

    pub fn decode(bytes: &[u8]) -> Option<NetworkInfo> {
        let mut r = Reader::new(bytes);
        if r.read_u16_le().ok()? != SETTINGS_VERSION {
            return None;
        }
        let role = match r.read_u8().ok()? {
            0 => DeviceRole::Disabled,
            1 => DeviceRole::Detached,
            2 => DeviceRole::Child,
            3 => DeviceRole::Router,
            4 => DeviceRole::Leader,
            _ => return None,
        };
        let device_mode = DeviceMode::from_bits(r.read_u8().ok()?);
        let rloc16 = Rloc16(r.read_u16_le().ok()?);
        let key_sequence = r.read_u32_le().ok()?;
        let mle_frame_counter = r.read_u32_le().ok()?;
        let ext: [u8; 8] = r.read_bytes(8).ok()?.try_into().ok()?;
        Some(NetworkInfo {
            role,
            device_mode,
            rloc16,
            key_sequence,
            mle_frame_counter,
            ext_address: ExtAddress(ext),
        })
    }
}

/// Parent identity persisted for role recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParentInfo {
    pub ext_address: ExtAddress,
    pub version: u16,
}

impl ParentInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u16_le(SETTINGS_VERSION);
        w.write_bytes(&self.ext_address.0);
        w.write_u16_le(self.version);
        w.into_vec()
    }

    pub fn decode(bytes: &[u8]) -> Option<ParentInfo> {
        let mut r = Reader::new(bytes);
        if r.read_u16_le().ok()? != SETTINGS_VERSION {
            return None;
        }
        let ext: [u8; 8] = r.read_bytes(8).ok()?.try_into().ok()?;
        Some(ParentInfo {
            ext_address: ExtAddress(ext),
            version: r.read_u16_le().ok()?,
        })
    }
}

/// One persisted child-table entry (list-valued key).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildInfo {
    pub ext_address: ExtAddress,
    pub rloc16: Rloc16,
    pub timeout_secs: u32,
    pub device_mode: DeviceMode,
}

impl ChildInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u16_le(SETTINGS_VERSION);
        w.write_bytes(&self.ext_address.0);
        w.write_u16_le(self.rloc16.0);
        w.write_u32_le(self.timeout_secs);
        w.write_u8(self.device_mode.bits());
        w.into_vec()
    }

    pub fn decode(bytes: &[u8]) -> Option<ChildInfo> {
        let mut r = Reader::new(bytes);
        if r.read_u16_le().ok()? != SETTINGS_VERSION {
            return None;
        }
        let ext: [u8; 8] = r.read_bytes(8).ok()?.try_into().ok()?;
        Some(ChildInfo {
            ext_address: ExtAddress(ext),
            rloc16: Rloc16(r.read_u16_le().ok()?),
            timeout_secs: r.read_u32_le().ok()?,
            device_mode: DeviceMode::from_bits(r.read_u8().ok()?),
        })
    }
}

/// Everything recovered from the settings store at startup.
#[derive(Clone, Debug, Default)]
pub struct RestoredState {
    pub network_info: Option<NetworkInfo>,
    pub parent_info: Option<ParentInfo>,
    pub children: Vec<ChildInfo>,
}

/// Read the persisted state. Undecodable blobs (wrong version or
/// truncated) read as absent.
pub fn restore<S: SettingsStore>(settings: &S) -> RestoredState {
    let network_info = settings
        .get(SettingsKey::NetworkInfo, 0)
        .and_then(|b| NetworkInfo::decode(&b));
    let parent_info = settings
        .get(SettingsKey::ParentInfo, 0)
        .and_then(|b| ParentInfo::decode(&b));

    let mut children = Vec::new();
    let mut index = 0;
    while let Some(bytes) = settings.get(SettingsKey::ChildInfo, index) {
        if let Some(info) = ChildInfo::decode(&bytes) {
            children.push(info);
        }
        index += 1;
    }

    RestoredState {
        network_info,
        parent_info,
        children,
    }
}

/// Persist the current role and parent.
pub fn store<S: SettingsStore>(
    settings: &mut S,
    network_info: &NetworkInfo,
    parent_info: Option<&ParentInfo>,
) {
    settings.set(SettingsKey::NetworkInfo, &network_info.encode());
    match parent_info {
        Some(info) => settings.set(SettingsKey::ParentInfo, &info.encode()),
        None => settings.delete(SettingsKey::ParentInfo, None),
    }
}

/// Replace the persisted child list.
pub fn store_children<S: SettingsStore>(settings: &mut S, children: &[ChildInfo]) {
    settings.delete(SettingsKey::ChildInfo, None);
    for child in children {
        settings.add(SettingsKey::ChildInfo, &child.encode());
    }
}
