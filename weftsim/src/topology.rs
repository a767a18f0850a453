//! Network topology: which nodes hear each other, and how well.

use hashbrown::HashMap;

use weftmesh::{Duration, ExtAddress};

/// Properties of one directed link.
#[derive(Clone, Copy, Debug)]
pub struct Link {
    /// Propagation plus processing delay.
    pub delay: Duration,
    /// Packet loss in permille (0 = lossless, 1000 = blackhole).
    pub loss_permille: u16,
    /// Received signal strength at the far end, dBm.
    pub rss: i8,
}

impl Default for Link {
    fn default() -> Self {
        Link {
            delay: Duration::from_millis(2),
            loss_permille: 0,
            rss: -60,
        }
    }
}

/// Directed link map.
#[derive(Default)]
pub struct Topology {
    links: HashMap<(ExtAddress, ExtAddress), Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a symmetric link between two nodes.
    pub fn connect(&mut self, a: ExtAddress, b: ExtAddress, link: Link) {
        self.links.insert((a, b), link);
        self.links.insert((b, a), link);
    }

    /// Remove both directions of a link (partition).
    pub fn disconnect(&mut self, a: ExtAddress, b: ExtAddress) {
        self.links.remove(&(a, b));
        self.links.remove(&(b, a));
    }

    /// The link from `from` to `to`, if any.
    pub fn link(&self, from: ExtAddress, to: ExtAddress) -> Option<Link> {
        self.links.get(&(from, to)).copied()
    }

    /// Every node reachable from `from`.
    pub fn neighbors(&self, from: ExtAddress) -> Vec<(ExtAddress, Link)> {
        self.links
            .iter()
            .filter(|((src, _), _)| *src == from)
            .map(|((_, dst), link)| (*dst, *link))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(n: u8) -> ExtAddress {
        ExtAddress([n; 8])
    }

    #[test]
    fn test_connect_is_symmetric() {
        let mut topo = Topology::new();
        topo.connect(ext(1), ext(2), Link::default());
        assert!(topo.link(ext(1), ext(2)).is_some());
        assert!(topo.link(ext(2), ext(1)).is_some());
        assert!(topo.link(ext(1), ext(3)).is_none());
    }

    #[test]
    fn test_disconnect_partitions() {
        let mut topo = Topology::new();
        topo.connect(ext(1), ext(2), Link::default());
        topo.disconnect(ext(1), ext(2));
        assert!(topo.link(ext(1), ext(2)).is_none());
        assert!(topo.neighbors(ext(1)).is_empty());
    }

    #[test]
    fn test_neighbors() {
        let mut topo = Topology::new();
        topo.connect(ext(1), ext(2), Link::default());
        topo.connect(ext(1), ext(3), Link::default());
        let mut ns: Vec<u8> = topo.neighbors(ext(1)).iter().map(|(e, _)| e.0[0]).collect();
        ns.sort();
        assert_eq!(ns, vec![2, 3]);
    }
}
