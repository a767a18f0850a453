//! Compile-time configuration for memory bounds.
//!
//! The `NodeConfig` trait allows tuning memory usage for different MCU
//! sizes. Use `DefaultConfig` for 256KB+ RAM, `SmallConfig` for 64KB RAM.

/// Configuration trait for compile-time memory tuning.
///
/// Implement this trait to define custom bounds for your target
/// platform. All bounds must be non-zero; `MAX_CHILDREN` must be at
/// most 32 (the send-queue child mask is a `u32`).
pub trait NodeConfig {
    /// Maximum children in the child table.
    const MAX_CHILDREN: usize;

    /// Maximum registered IPv6 addresses tracked per child.
    const MAX_IP_ADDRS_PER_CHILD: usize;

    /// Maximum messages held in the send-queue arena.
    const MAX_SEND_QUEUE_MESSAGES: usize;

    /// Maximum outstanding delayed-sender schedule records.
    const MAX_DELAYED_SCHEDULES: usize;

    /// Capacity of the application event channel.
    const EVENT_CHANNEL_DEPTH: usize;
}

/// Default configuration for 256KB+ RAM devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfig;

impl NodeConfig for DefaultConfig {
    const MAX_CHILDREN: usize = 16;
    const MAX_IP_ADDRS_PER_CHILD: usize = 6;
    const MAX_SEND_QUEUE_MESSAGES: usize = 32;
    const MAX_DELAYED_SCHEDULES: usize = 16;
    const EVENT_CHANNEL_DEPTH: usize = 16;
}

/// Small configuration for 64KB RAM devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmallConfig;

impl NodeConfig for SmallConfig {
    const MAX_CHILDREN: usize = 4;
    const MAX_IP_ADDRS_PER_CHILD: usize = 4;
    const MAX_SEND_QUEUE_MESSAGES: usize = 8;
    const MAX_DELAYED_SCHEDULES: usize = 8;
    const EVENT_CHANNEL_DEPTH: usize = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        assert_eq!(DefaultConfig::MAX_CHILDREN, 16);
        assert_eq!(DefaultConfig::MAX_IP_ADDRS_PER_CHILD, 6);
        assert_eq!(DefaultConfig::MAX_SEND_QUEUE_MESSAGES, 32);
        assert_eq!(DefaultConfig::MAX_DELAYED_SCHEDULES, 16);
    }

    #[test]
    fn test_small_config_smaller_than_default() {
        assert!(SmallConfig::MAX_CHILDREN < DefaultConfig::MAX_CHILDREN);
        assert!(SmallConfig::MAX_SEND_QUEUE_MESSAGES < DefaultConfig::MAX_SEND_QUEUE_MESSAGES);
        assert!(SmallConfig::MAX_DELAYED_SCHEDULES <= DefaultConfig::MAX_DELAYED_SCHEDULES);
    }

    #[test]
    fn test_child_mask_fits() {
        assert!(DefaultConfig::MAX_CHILDREN <= 32);
        assert!(SmallConfig::MAX_CHILDREN <= 32);
    }
}
