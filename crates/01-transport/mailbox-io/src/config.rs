//! Build-time layout and runtime policy for a mailbox subsystem.
//!
//! The defaults describe the reference system: a 64 KiB co-processor window
//! whose top 4 KiB holds four equally sized channels (console-in,
//! console-out, rpc-in, rpc-out) of `0x400` bytes each.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::layout::{
    Direction, RingLayout, WellKnown, CURSOR_BYTES, HEADER_BYTES, MIN_CAPACITY,
};
use crate::{MailboxError, MailboxResult};

/// Which processor this end of the mailbox runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Side {
    CoProcessor,
    Host,
}

impl Side {
    /// Direction this side uses on a well-known channel.
    pub fn direction_of(self, channel: WellKnown) -> Direction {
        match self {
            Side::CoProcessor => channel.coprocessor_direction(),
            Side::Host => channel.coprocessor_direction().reversed(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Give up on a blocked transfer after this many milliseconds. `None`
    /// blocks until the peer makes progress.
    pub timeout_ms: Option<u64>,
}

impl WaitConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Size of the shared window in bytes.
    pub window_len: usize,
    /// Offset of the first well-known channel.
    pub io_base: usize,
    /// Distance between well-known channels; each holds `stride - 8` payload bytes.
    pub channel_stride: usize,
    /// Descriptor table size, well-known slots included.
    pub max_descriptors: usize,
    /// Payload capacity of channels opened by address.
    pub dynamic_capacity: usize,
    /// Peer cursor comparisons before a read is declared glitched.
    pub glitch_retry_budget: u32,
    /// Pulse the peer-wake line after co-processor console writes.
    pub notify_console: bool,
    pub wait: WaitConfig,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            window_len: 0x1_0000,
            io_base: 0xF000,
            channel_stride: 0x400,
            max_descriptors: 10,
            dynamic_capacity: 0x7F8,
            glitch_retry_budget: 64,
            notify_console: true,
            wait: WaitConfig::default(),
        }
    }
}

impl MailboxConfig {
    /// Tightly packed layout with four channels of `capacity` payload bytes
    /// starting at offset zero and no room for dynamic channels. The capacity
    /// is rounded up to a whole word so every cursor stays aligned.
    pub fn compact(capacity: usize) -> Self {
        let capacity = (capacity + CURSOR_BYTES - 1) / CURSOR_BYTES * CURSOR_BYTES;
        let stride = HEADER_BYTES + capacity;
        Self {
            window_len: WellKnown::COUNT * stride,
            io_base: 0,
            channel_stride: stride,
            dynamic_capacity: capacity,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.wait.timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    /// Layout of a well-known channel.
    pub fn well_known_ring(&self, channel: WellKnown) -> MailboxResult<RingLayout> {
        let base = channel
            .index()
            .checked_mul(self.channel_stride)
            .and_then(|offset| offset.checked_add(self.io_base))
            .ok_or(MailboxError::InvalidConfig("well-known channel offset overflows"))?;
        let capacity = self
            .channel_stride
            .checked_sub(HEADER_BYTES)
            .ok_or(MailboxError::InvalidConfig("channel stride smaller than header"))?;
        RingLayout::new(base, capacity, self.window_len)
    }

    pub fn validate(&self) -> MailboxResult<()> {
        if self.max_descriptors < WellKnown::COUNT {
            return Err(MailboxError::InvalidConfig(
                "descriptor table cannot hold the well-known channels",
            ));
        }
        if self.glitch_retry_budget == 0 {
            return Err(MailboxError::InvalidConfig(
                "glitch retry budget must allow at least one comparison",
            ));
        }
        if self.dynamic_capacity < MIN_CAPACITY {
            return Err(MailboxError::InvalidConfig(
                "dynamic channel capacity must be at least two bytes",
            ));
        }
        if self.channel_stride < HEADER_BYTES + MIN_CAPACITY {
            return Err(MailboxError::InvalidConfig(
                "channel stride leaves no payload",
            ));
        }
        for channel in WellKnown::ALL {
            self.well_known_ring(channel)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The reference layout places the four channels at 0xF000..0xFC00.
    #[test]
    fn default_matches_reference_system() {
        let config = MailboxConfig::default();
        config.validate().unwrap();
        let bases: Vec<_> = WellKnown::ALL
            .iter()
            .map(|ch| config.well_known_ring(*ch).unwrap().base())
            .collect();
        assert_eq!(bases, vec![0xF000, 0xF400, 0xF800, 0xFC00]);
        assert_eq!(
            config.well_known_ring(WellKnown::RpcOut).unwrap().capacity(),
            0x3F8
        );
        assert_eq!(config.wait.timeout(), None);
    }

    #[test]
    fn compact_layout_fills_window() {
        let config = MailboxConfig::compact(8);
        config.validate().unwrap();
        assert_eq!(config.window_len, 64);
        let last = config.well_known_ring(WellKnown::RpcOut).unwrap();
        assert_eq!(last.base() + last.span(), config.window_len);

        let odd = MailboxConfig::compact(13);
        odd.validate().unwrap();
        assert_eq!(odd.well_known_ring(WellKnown::RpcIn).unwrap().capacity(), 16);
    }

    #[test]
    fn sides_mirror_each_other() {
        for channel in WellKnown::ALL {
            assert_eq!(
                Side::Host.direction_of(channel),
                Side::CoProcessor.direction_of(channel).reversed()
            );
        }
        assert_eq!(
            Side::CoProcessor.direction_of(WellKnown::ConsoleOut),
            Direction::Producer
        );
        assert_eq!(Side::Host.direction_of(WellKnown::RpcIn), Direction::Producer);
    }

    #[test]
    fn validate_rejects_small_tables() {
        let config = MailboxConfig {
            max_descriptors: 3,
            ..MailboxConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MailboxError::InvalidConfig(_))
        ));
        let config = MailboxConfig {
            glitch_retry_budget: 0,
            ..MailboxConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
