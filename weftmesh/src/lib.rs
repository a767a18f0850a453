//! weftmesh - Mesh link establishment for low-power 802.15.4 meshes.
//!
//! A poll-driven implementation of the MLE attach protocol, indirect
//! transmission to sleepy peers, and coordinated sampled listening
//! (CSL) scheduling, for minimal (non-routing) devices. A minimal
//! device holding spare locator prefix bits can itself parent further
//! minimal devices, forming a second-tier mesh (`sub-child` feature).
//!
//! # Key properties
//!
//! - Single-threaded cooperative: every handler runs to completion
//! - Platform access through traits (radio, crypto, settings, clock)
//! - All time passed explicitly, enabling deterministic simulation
//! - Secured messaging with AES-CCM, frame-counter and key-sequence
//!   replay protection
//!
//! # Example
//!
//! ```no_run
//! // Implement Radio, Crypto, Random, Clock, SettingsStore,
//! // NetworkDataStore and FrameComposer for your platform, then:
//! //
//! // let mut node = Node::new(radio, crypto, random, clock,
//! //                          net_data, settings, composer, ext_addr);
//! // node.start()?;
//! //
//! // loop {
//! //     node.handle_mle_rx(src, dst, hop_limit, &bytes, rss, now)?;
//! //     node.handle_timer(now);
//! // }
//! ```
//!
//! # Module structure
//!
//! - [`types`] - Core types (roles, addresses, errors, events)
//! - [`wire`] - TLV wire format
//! - [`codec`] - Secured MLE message build/parse
//! - [`traits`] - Platform traits
//! - [`neighbors`] - Peer, child and parent tables
//! - [`queue`] - Outbound send-queue arena
//! - [`delayed`] - Timed outbound scheduling
//! - [`retx`] - Retransmission tracking
//! - [`indirect`] - Indirect transmission to sleepy peers
//! - [`csl_tx`] - CSL transmission scheduling
//! - [`csl_rx`] - CSL sampled listening
//! - [`mle`] - The MLE core state machine
//! - [`settings`] - Persisted-state layouts
//! - [`node`] - The Node owning all of the above

#![no_std]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod codec;
pub mod config;
pub mod csl_rx;
pub mod csl_tx;
pub mod debug;
pub mod delayed;
pub mod indirect;
pub mod mle;
pub mod neighbors;
pub mod node;
pub mod queue;
pub mod retx;
pub mod settings;
pub mod time;
pub mod traits;
pub mod types;
pub mod wire;

#[cfg(feature = "sub-child")]
pub mod subchild;

// Re-export main types at crate root
pub use config::{DefaultConfig, NodeConfig, SmallConfig};
pub use mle::{Mle, MleDeps, MleTransmit, StartMode, StopMode};
pub use node::{IngressDatagram, Node};
pub use time::{Duration, DurationUs, Timestamp, TimestampUs};
pub use traits::{Clock, Crypto, NetworkDataStore, Radio, Random, SettingsStore};
pub use types::{
    DeviceMode, DeviceRole, Error, Event, ExtAddress, Ip6Address, LeaderData, Rloc16,
};

// Re-export constants
pub use types::{MLE_HOP_LIMIT, MLE_UDP_PORT};
