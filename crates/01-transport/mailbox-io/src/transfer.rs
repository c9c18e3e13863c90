//! Byte copies between caller buffers and one ring.
//!
//! A transfer samples availability, copies at most that many bytes in up to
//! two contiguous chunks (split where the payload wraps), and only then
//! publishes the advanced cursor. The peer therefore never observes a cursor
//! that exposes bytes it cannot yet see.

use std::time::Duration;

use tracing::trace;

use crate::layout::{Direction, RingLayout};
use crate::memory::SharedMemory;
use crate::notify::{notify_peer, PeerSignal};
use crate::registry::{ChannelDescriptor, Fd};
use crate::sampler::{AvailabilitySampler, Sample};
use crate::wait::{BlockingWait, ServiceHook};
use crate::MailboxResult;

/// A single open channel bound to the memory it lives in.
pub(crate) struct StreamTransfer<'a, M: ?Sized, S: ?Sized> {
    memory: &'a M,
    fd: Fd,
    descriptor: ChannelDescriptor,
    wait: BlockingWait<'a, M>,
    signal: Option<&'a S>,
}

impl<'a, M, S> StreamTransfer<'a, M, S>
where
    M: SharedMemory + ?Sized,
    S: PeerSignal + ?Sized,
{
    pub fn new(
        memory: &'a M,
        fd: Fd,
        descriptor: ChannelDescriptor,
        retry_budget: u32,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            memory,
            fd,
            descriptor,
            wait: BlockingWait::new(AvailabilitySampler::new(memory, retry_budget), timeout),
            signal: None,
        }
    }

    /// Pulses `signal` after every write that moves at least one byte.
    pub fn with_signal(mut self, signal: &'a S) -> Self {
        self.signal = Some(signal);
        self
    }

    fn ring(&self) -> &RingLayout {
        &self.descriptor.ring
    }

    fn direction(&self) -> Direction {
        self.descriptor.direction
    }

    pub fn available(&self) -> MailboxResult<usize> {
        Ok(self.sample()?.available)
    }

    fn sample(&self) -> MailboxResult<Sample> {
        self.wait.sampler().sample(self.ring(), self.direction())
    }

    fn wait_for_any<H: ServiceHook + ?Sized>(&self, hook: &mut H) -> MailboxResult<Sample> {
        self.wait
            .wait_until_available(self.fd, self.ring(), self.direction(), |n| n > 0, hook)
    }

    /// Blocks until there is room, then writes as much of `src` as fits.
    pub fn write<H: ServiceHook + ?Sized>(&self, src: &[u8], hook: &mut H) -> MailboxResult<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let sample = self.wait_for_any(hook)?;
        Ok(self.push(sample, src))
    }

    /// Writes what fits right now, possibly nothing.
    pub fn try_write(&self, src: &[u8]) -> MailboxResult<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let sample = self.sample()?;
        if sample.available == 0 {
            return Ok(0);
        }
        Ok(self.push(sample, src))
    }

    /// Blocks until data arrives, then reads up to `dst.len()` bytes.
    pub fn read<H: ServiceHook + ?Sized>(&self, dst: &mut [u8], hook: &mut H) -> MailboxResult<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let sample = self.wait_for_any(hook)?;
        Ok(self.pull(sample, dst))
    }

    /// Reads whatever is buffered right now, possibly nothing.
    pub fn try_read(&self, dst: &mut [u8]) -> MailboxResult<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let sample = self.sample()?;
        if sample.available == 0 {
            return Ok(0);
        }
        Ok(self.pull(sample, dst))
    }

    fn push(&self, sample: Sample, src: &[u8]) -> usize {
        let ring = self.ring();
        let actual = src.len().min(sample.available);
        let (first, second) = split_at_wrap(sample.own, actual, ring.capacity());
        let payload = ring.payload_offset();

        self.memory.write_bytes(payload + sample.own, &src[..first]);
        if second > 0 {
            self.memory.write_bytes(payload, &src[first..actual]);
        }
        let next = self.publish(sample.own, actual);
        trace!(fd = %self.fd, actual, requested = src.len(), cursor = next, "wrote");

        if self.descriptor.notify {
            if let Some(signal) = self.signal {
                notify_peer(signal);
            }
        }
        actual
    }

    fn pull(&self, sample: Sample, dst: &mut [u8]) -> usize {
        let ring = self.ring();
        let actual = dst.len().min(sample.available);
        let (first, second) = split_at_wrap(sample.own, actual, ring.capacity());
        let payload = ring.payload_offset();

        self.memory.read_bytes(payload + sample.own, &mut dst[..first]);
        if second > 0 {
            self.memory.read_bytes(payload, &mut dst[first..actual]);
        }
        let next = self.publish(sample.own, actual);
        trace!(fd = %self.fd, actual, requested = dst.len(), cursor = next, "read");
        actual
    }

    /// Advances the local cursor past `count` bytes. Must follow the payload copy.
    fn publish(&self, own: usize, count: usize) -> usize {
        let ring = self.ring();
        let next = (own + count) % ring.capacity();
        // `next < capacity <= u32::MAX` is guaranteed by `RingLayout::new`.
        self.memory
            .store_word(ring.own_cursor_offset(self.direction()), next as u32);
        next
    }
}

/// Splits a transfer of `count` bytes starting at `cursor` into the part
/// before the end of the payload and the part that wraps to offset zero.
pub(crate) fn split_at_wrap(cursor: usize, count: usize, capacity: usize) -> (usize, usize) {
    let first = count.min(capacity - cursor);
    (first, count - first)
}
