//! Availability sampling over cursors the peer may be rewriting.
//!
//! Dual-ported block RAM can return garbage when a read collides with the
//! other port's write. The peer cursor is therefore re-read until two
//! consecutive loads agree on a value inside the ring; the local cursor has
//! no concurrent writer and is read once.

use tracing::warn;

use crate::layout::{Direction, RingLayout};
use crate::memory::SharedMemory;
use crate::{MailboxError, MailboxResult};

/// Bytes transferable on a ring given both cursors.
///
/// Consumers see `(w - r) mod C`; producers see `(r - w - 1) mod C`, keeping
/// one slot empty so a full ring is distinguishable from an empty one.
pub fn ring_available(direction: Direction, own: usize, peer: usize, capacity: usize) -> usize {
    debug_assert!(own < capacity && peer < capacity);
    match direction {
        Direction::Consumer => (peer + capacity - own) % capacity,
        Direction::Producer => (peer + capacity - own - 1) % capacity,
    }
}

/// One consistent view of a ring from the local side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Sample {
    /// Local cursor position.
    pub own: usize,
    /// Bytes that may be transferred right now, in `[0, C - 1]`.
    pub available: usize,
}

pub(crate) struct AvailabilitySampler<'a, M: ?Sized> {
    memory: &'a M,
    retry_budget: u32,
}

impl<'a, M: SharedMemory + ?Sized> AvailabilitySampler<'a, M> {
    pub fn new(memory: &'a M, retry_budget: u32) -> Self {
        Self {
            memory,
            retry_budget,
        }
    }

    pub fn sample(&self, ring: &RingLayout, direction: Direction) -> MailboxResult<Sample> {
        let capacity = ring.capacity();
        let own = self.local_cursor(ring.own_cursor_offset(direction), capacity)?;
        let peer = self.peer_cursor(ring.peer_cursor_offset(direction), capacity)?;
        Ok(Sample {
            own,
            available: ring_available(direction, own, peer, capacity),
        })
    }

    fn local_cursor(&self, offset: usize, capacity: usize) -> MailboxResult<usize> {
        let value = self.memory.load_word(offset) as usize;
        if value >= capacity {
            warn!(offset, value, capacity, "local cursor outside ring");
            return Err(MailboxError::HardwareGlitch {
                offset,
                attempts: 1,
            });
        }
        Ok(value)
    }

    /// Re-reads the peer cursor until two consecutive loads agree on an
    /// in-range value, giving up after `retry_budget` comparisons.
    fn peer_cursor(&self, offset: usize, capacity: usize) -> MailboxResult<usize> {
        let mut last = self.memory.load_word(offset);
        for _ in 0..self.retry_budget {
            let current = self.memory.load_word(offset);
            if current == last && (current as usize) < capacity {
                return Ok(current as usize);
            }
            last = current;
        }
        warn!(
            offset,
            last,
            attempts = self.retry_budget,
            "peer cursor failed to stabilise"
        );
        Err(MailboxError::HardwareGlitch {
            offset,
            attempts: self.retry_budget,
        })
    }
}
