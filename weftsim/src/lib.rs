//! weftsim - Discrete event network simulator for weftmesh testing.
//!
//! Deterministic, discrete-event simulation of weftmesh networks
//! without real-time delays.
//!
//! # Features
//!
//! - **Discrete event simulation**: no real-time delays, deterministic
//!   ordering by (time, sequence number)
//! - **Multiple nodes in one process**
//! - **Configurable topology**: per-link delay, loss and RSS
//! - **Scripted parent**: a canned full-device parent answers the
//!   attach exchange so MTD scenarios run without a router stack
//! - **Metrics**: delivery counts, loss counts, timer fires
//!
//! # Architecture
//!
//! The simulator keeps a priority queue of events ordered by
//! (time, sequence_number). The main loop:
//! 1. Pop the next event and advance simulation time
//! 2. Process it (call node handlers directly)
//! 3. Collect outgoing frames from the node's radio
//! 4. Route them through the topology, scheduling deliveries
//!
//! Key insight: handlers (`handle_mle_rx`, `handle_timer`) are called
//! directly instead of using the async `Node::run` loop.

pub mod event;
pub mod metrics;
pub mod node;
pub mod scenario;
pub mod sim;
pub mod topology;

// Re-export main types
pub use event::{Event, ScheduledEvent};
pub use metrics::SimMetrics;
pub use node::{decode_sim_frame, ScriptedParent, SimComposer, SimNode, SimPlatform};
pub use scenario::ScenarioBuilder;
pub use sim::Simulator;
pub use topology::{Link, Topology};
pub use weftmesh::{Duration, ExtAddress, Rloc16, Timestamp};
