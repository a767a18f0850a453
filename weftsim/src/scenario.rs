//! Scenario builder: canned network setups for tests.

use weftmesh::{Duration, ExtAddress, Rloc16};

use crate::node::ScriptedParent;
use crate::sim::Simulator;

/// Extended address used for the scripted parent in simple scenarios.
pub const PARENT_EXT: ExtAddress = ExtAddress([0xa0, 0, 0, 0, 0, 0, 0, 0x01]);

/// Builder for a star of weftmesh nodes under one scripted parent.
pub struct ScenarioBuilder {
    seed: u64,
    node_count: usize,
    parent_rloc: Rloc16,
    first_child_rloc: Rloc16,
}

impl ScenarioBuilder {
    pub fn new(node_count: usize) -> Self {
        ScenarioBuilder {
            seed: 1,
            node_count,
            parent_rloc: Rloc16(0x6c00),
            first_child_rloc: Rloc16(0x6c01),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Seed from the thread RNG for soak-style, non-reproducible runs.
    /// The chosen seed is printed so failures can be replayed.
    pub fn with_random_seed(mut self) -> Self {
        self.seed = rand::random();
        println!("scenario seed: {}", self.seed);
        self
    }

    /// Extended address of the n-th node.
    pub fn node_ext(n: usize) -> ExtAddress {
        ExtAddress([0xb0, 0, 0, 0, 0, 0, 0, n as u8 + 1])
    }

    /// Build the simulator with every node connected to the parent.
    pub fn build(self) -> Simulator {
        let mut sim = Simulator::new(self.seed);
        sim.add_scripted(ScriptedParent::new(
            PARENT_EXT,
            self.parent_rloc,
            self.first_child_rloc,
        ));

        for n in 0..self.node_count {
            let ext = Self::node_ext(n);
            sim.add_node(ext, self.seed.wrapping_add(n as u64 + 1));
            sim.connect(PARENT_EXT, ext);
        }
        sim
    }

    /// Build, start every node, and run for `span`.
    pub fn run_for(self, span: Duration) -> Simulator {
        let count = self.node_count;
        let mut sim = self.build();
        for n in 0..count {
            sim.start_node(Self::node_ext(n));
        }
        sim.run_for(span);
        sim
    }
}
