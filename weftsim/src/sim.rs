//! Discrete event simulator for weftmesh networks.
//!
//! A priority queue of events ordered by (time, sequence). The loop
//! pops the next event, advances simulation time, runs the node
//! handlers directly, collects outgoing frames, and routes them
//! through the topology.

use std::collections::BinaryHeap;

use hashbrown::HashMap;

use weftmesh::node::IngressDatagram;
use weftmesh::traits::{MacAddress, TxFrame};
use weftmesh::{Duration, ExtAddress, Rloc16, Timestamp};

use crate::event::{Event, ScheduledEvent};
use crate::metrics::SimMetrics;
use crate::node::{decode_sim_frame, ScriptedParent, SimNode, SimPlatform};
use crate::topology::{Link, Topology};

/// Extra per-hop processing delay applied to every delivery.
const PROCESSING_DELAY: Duration = Duration::from_millis(1);

/// The simulator.
pub struct Simulator {
    nodes: HashMap<ExtAddress, SimNode>,
    scripted: HashMap<ExtAddress, ScriptedParent>,
    pub topology: Topology,
    time: Timestamp,
    heap: BinaryHeap<ScheduledEvent>,
    seq: u64,
    rng_state: u64,
    pub metrics: SimMetrics,
    /// Transcript of deliveries to weftmesh nodes.
    pub trace: Vec<(ExtAddress, IngressDatagram)>,
}

impl Simulator {
    pub fn new(seed: u64) -> Self {
        Simulator {
            nodes: HashMap::new(),
            scripted: HashMap::new(),
            topology: Topology::new(),
            time: Timestamp::ZERO,
            heap: BinaryHeap::new(),
            seq: 0,
            rng_state: seed | 1,
            metrics: SimMetrics::new(),
            trace: Vec::new(),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.time
    }

    /// Add a weftmesh node.
    pub fn add_node(&mut self, ext: ExtAddress, seed: u64) {
        self.add_node_with(ext, seed, |_| {});
    }

    /// Add a weftmesh node with pre-start configuration.
    pub fn add_node_with(
        &mut self,
        ext: ExtAddress,
        seed: u64,
        configure: impl FnOnce(&mut SimPlatform),
    ) {
        let mut node = SimNode::new(ext, seed);
        configure(&mut node.inner);
        self.nodes.insert(ext, node);
    }

    /// Add a scripted full-device parent.
    pub fn add_scripted(&mut self, parent: ScriptedParent) {
        self.scripted.insert(parent.ext, parent);
    }

    /// Connect two devices with a default link.
    pub fn connect(&mut self, a: ExtAddress, b: ExtAddress) {
        self.topology.connect(a, b, Link::default());
    }

    pub fn node(&self, ext: &ExtAddress) -> &SimNode {
        &self.nodes[ext]
    }

    pub fn node_mut(&mut self, ext: &ExtAddress) -> &mut SimNode {
        self.nodes.get_mut(ext).expect("unknown node")
    }

    pub fn scripted_mut(&mut self, ext: &ExtAddress) -> &mut ScriptedParent {
        self.scripted.get_mut(ext).expect("unknown scripted parent")
    }

    /// Start a node's protocol operation.
    pub fn start_node(&mut self, ext: ExtAddress) {
        let time = self.time;
        {
            let node = self.nodes.get_mut(&ext).expect("unknown node");
            node.set_time(time);
            let _ = node.inner.start();
        }
        self.after_node_activity(ext);
    }

    /// Inject a datagram toward a device at `delay` from now.
    pub fn inject(&mut self, to: ExtAddress, datagram: IngressDatagram, delay: Duration) {
        let time = self.time + delay;
        self.schedule(time, Event::Deliver { to, datagram });
    }

    /// Collect a node's output after it was driven outside the event
    /// loop (for example, a public operation called from a test).
    pub fn poke(&mut self, ext: ExtAddress) {
        self.after_node_activity(ext);
    }

    fn schedule(&mut self, time: Timestamp, event: Event) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(ScheduledEvent { time, seq, event });
    }

    fn next_random(&mut self) -> u64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.rng_state >> 33
    }

    /// Run until `end` (inclusive) or until the event queue drains.
    pub fn run_until(&mut self, end: Timestamp) {
        while let Some(next) = self.heap.peek() {
            if next.time > end {
                break;
            }
            let event = self.heap.pop().unwrap();
            if event.time > self.time {
                self.time = event.time;
            }
            self.dispatch(event);
        }
        self.time = end.max(self.time);
    }

    /// Run for a span from the current time.
    pub fn run_for(&mut self, span: Duration) {
        let end = self.time + span;
        self.run_until(end);
    }

    fn dispatch(&mut self, event: ScheduledEvent) {
        match event.event {
            Event::Deliver { to, datagram } => self.deliver(to, datagram),
            Event::Timer { node } => {
                self.metrics.timer_fires += 1;
                let time = self.time;
                if let Some(sim_node) = self.nodes.get_mut(&node) {
                    sim_node.set_time(time);
                    sim_node.inner.handle_timer(time);
                }
                self.after_node_activity(node);
            }
        }
    }

    fn deliver(&mut self, to: ExtAddress, datagram: IngressDatagram) {
        let time = self.time;

        if let Some(node) = self.nodes.get_mut(&to) {
            node.set_time(time);
            let _ = node.inner.handle_mle_rx(
                datagram.source,
                datagram.destination,
                datagram.hop_limit,
                &datagram.bytes,
                datagram.rss,
                time,
            );
            self.metrics.delivered += 1;
            self.trace.push((to, datagram));
            self.after_node_activity(to);
            return;
        }

        if self.scripted.contains_key(&to) {
            self.metrics.delivered += 1;
            let responses = {
                let parent = self.scripted.get_mut(&to).unwrap();
                parent.handle(&datagram)
            };
            for response in responses {
                let target = response.destination.ext_address();
                let delay = self
                    .topology
                    .link(to, target)
                    .map(|l| l.delay)
                    .unwrap_or(Duration::from_millis(2));
                let fire = self.time + delay + PROCESSING_DELAY;
                self.schedule(
                    fire,
                    Event::Deliver {
                        to: target,
                        datagram: response,
                    },
                );
            }
            return;
        }

        self.metrics.undeliverable += 1;
    }

    /// Collect a node's new frames and (re)arm its timer.
    fn after_node_activity(&mut self, ext: ExtAddress) {
        let (frames, next_fire) = {
            let Some(node) = self.nodes.get_mut(&ext) else {
                return;
            };
            (node.drain_frames(), node.inner.next_fire_time())
        };

        for (frame, at) in frames {
            self.route_frame(ext, frame, at);
        }

        if let Some(fire) = next_fire {
            let fire = fire.max(self.time);
            self.schedule(fire, Event::Timer { node: ext });
        }
    }

    /// Route a transmitted frame through the topology.
    fn route_frame(&mut self, from: ExtAddress, frame: TxFrame, at_us: Option<u64>) {
        self.metrics.frames_sent += 1;

        let Some(datagram) = decode_sim_frame(&frame) else {
            // Empty poll-response frames carry no datagram.
            return;
        };

        let tx_time = at_us
            .map(|us| Timestamp::from_millis(us / 1000))
            .unwrap_or(self.time)
            .max(self.time);

        let targets: Vec<(ExtAddress, Link)> = match frame.dst {
            MacAddress::Extended(ext) => self
                .topology
                .link(from, ext)
                .map(|l| vec![(ext, l)])
                .unwrap_or_default(),
            MacAddress::Short(rloc) => self
                .resolve_rloc(rloc)
                .and_then(|ext| self.topology.link(from, ext).map(|l| vec![(ext, l)]))
                .unwrap_or_default(),
            MacAddress::None => self.topology.neighbors(from),
        };

        if targets.is_empty() {
            self.metrics.undeliverable += 1;
            return;
        }

        for (target, link) in targets {
            if link.loss_permille > 0 && (self.next_random() % 1000) < link.loss_permille as u64 {
                self.metrics.lost += 1;
                continue;
            }
            let mut delivered = datagram.clone();
            delivered.rss = Some(link.rss);
            let fire = tx_time + link.delay + PROCESSING_DELAY;
            self.schedule(
                fire,
                Event::Deliver {
                    to: target,
                    datagram: delivered,
                },
            );
        }
    }

    fn resolve_rloc(&self, rloc: Rloc16) -> Option<ExtAddress> {
        if let Some(parent) = self.scripted.values().find(|p| p.rloc16 == rloc) {
            return Some(parent.ext);
        }
        self.nodes
            .values()
            .find(|n| n.inner.mle.rloc16 == rloc)
            .map(|n| n.ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(n: u8) -> ExtAddress {
        ExtAddress([n, 0, 0, 0, 0, 0, 0, n])
    }

    #[test]
    fn test_empty_sim_runs_to_end() {
        let mut sim = Simulator::new(1);
        sim.run_until(Timestamp::from_secs(5));
        assert_eq!(sim.now(), Timestamp::from_secs(5));
    }

    #[test]
    fn test_node_attaches_to_scripted_parent() {
        let mut sim = Simulator::new(42);
        let parent_ext = ext(0xa0);
        let child_ext = ext(0xb0);

        sim.add_scripted(ScriptedParent::new(
            parent_ext,
            Rloc16(0x6c00),
            Rloc16(0x6c01),
        ));
        sim.add_node(child_ext, 7);
        sim.connect(parent_ext, child_ext);

        sim.start_node(child_ext);
        sim.run_for(Duration::from_secs(10));

        let node = sim.node(&child_ext);
        assert_eq!(node.inner.mle.role(), weftmesh::DeviceRole::Child);
        assert_eq!(node.inner.mle.rloc16, Rloc16(0x6c01));
    }

    #[test]
    fn test_lossy_link_counts_losses() {
        let mut sim = Simulator::new(9);
        let a = ext(1);
        let b = ext(2);
        sim.add_node(a, 1);
        sim.add_node(b, 2);
        sim.topology.connect(
            a,
            b,
            Link {
                loss_permille: 1000,
                ..Link::default()
            },
        );

        sim.start_node(a);
        sim.run_for(Duration::from_secs(5));
        assert_eq!(sim.metrics.delivered, 0);
        assert!(sim.metrics.lost > 0 || sim.metrics.frames_sent == 0);
    }
}
