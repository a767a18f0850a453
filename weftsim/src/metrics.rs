//! Simulation metrics.

/// Counters collected while the simulation runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimMetrics {
    /// Frames handed to the simulated medium.
    pub frames_sent: u64,
    /// Datagrams delivered to a receiver.
    pub delivered: u64,
    /// Frames lost on a lossy link.
    pub lost: u64,
    /// Frames with no reachable destination.
    pub undeliverable: u64,
    /// Timer events dispatched.
    pub timer_fires: u64,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivery ratio over everything sent, in [0, 1].
    pub fn delivery_ratio(&self) -> f64 {
        if self.frames_sent == 0 {
            return 1.0;
        }
        self.delivered as f64 / self.frames_sent as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_ratio() {
        let mut m = SimMetrics::new();
        assert_eq!(m.delivery_ratio(), 1.0);
        m.frames_sent = 10;
        m.delivered = 5;
        assert_eq!(m.delivery_ratio(), 0.5);
    }
}
