//! Cooperative waiting for ring space or data.
//!
//! A blocked transfer spins on the [`AvailabilitySampler`](crate::sampler)
//! and hands control to a [`ServiceHook`] between samples, so an event loop on
//! the host (or interrupt bookkeeping on the co-processor) keeps running while
//! the call is logically suspended. Blocking is indefinite unless the
//! configuration opts into a timeout.
//!
//! The atomic wait/notify shims at the bottom back [`WakeLine`](crate::WakeLine)
//! and are futex-based where the platform offers it.

use std::sync::atomic::AtomicU32;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::layout::{Direction, RingLayout};
use crate::memory::SharedMemory;
use crate::registry::Fd;
use crate::sampler::{AvailabilitySampler, Sample};
use crate::{MailboxError, MailboxResult};

/// Work to run while a transfer waits for its peer.
pub trait ServiceHook {
    fn service(&mut self);
}

impl<F: FnMut()> ServiceHook for F {
    fn service(&mut self) {
        self()
    }
}

/// Default hook: a bare spin with a CPU relax hint.
#[derive(Clone, Copy, Debug, Default)]
pub struct Spin;

impl ServiceHook for Spin {
    fn service(&mut self) {
        std::hint::spin_loop();
    }
}

/// Gives the rest of the time slice to other threads between samples.
#[derive(Clone, Copy, Debug, Default)]
pub struct Yield;

impl ServiceHook for Yield {
    fn service(&mut self) {
        std::thread::yield_now();
    }
}

/// Spin loop that re-samples one channel until a predicate holds.
pub(crate) struct BlockingWait<'a, M: ?Sized> {
    sampler: AvailabilitySampler<'a, M>,
    timeout: Option<Duration>,
}

impl<'a, M: SharedMemory + ?Sized> BlockingWait<'a, M> {
    pub fn new(sampler: AvailabilitySampler<'a, M>, timeout: Option<Duration>) -> Self {
        Self { sampler, timeout }
    }

    pub fn sampler(&self) -> &AvailabilitySampler<'a, M> {
        &self.sampler
    }

    /// Returns the first sample whose availability satisfies `ready`.
    pub fn wait_until_available<H, P>(
        &self,
        fd: Fd,
        ring: &RingLayout,
        direction: Direction,
        mut ready: P,
        hook: &mut H,
    ) -> MailboxResult<Sample>
    where
        H: ServiceHook + ?Sized,
        P: FnMut(usize) -> bool,
    {
        let started = self.timeout.map(|_| Instant::now());
        loop {
            let sample = self.sampler.sample(ring, direction)?;
            if ready(sample.available) {
                return Ok(sample);
            }
            if let (Some(limit), Some(started)) = (self.timeout, started) {
                let waited = started.elapsed();
                if waited >= limit {
                    warn!(%fd, ?waited, "peer made no progress before timeout");
                    return Err(MailboxError::TimedOut { fd, waited });
                }
            }
            hook.service();
        }
    }
}

/// Result of attempting to wait on an atomic location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The caller was woken by a notify (or spuriously).
    Ok,
    /// The value no longer matched when the wait was attempted.
    NotEqual,
}

/// Blocks the current caller until the atomic differs from `expected` or a wakeup occurs.
#[inline]
pub fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
    if atomic.load(std::sync::atomic::Ordering::Acquire) != expected {
        return WaitResult::NotEqual;
    }
    atomic_wait::wait(atomic, expected);
    WaitResult::Ok
}

/// Wakes all waiters parked on `atomic`.
#[inline]
pub fn wake_all(atomic: &AtomicU32) {
    atomic_wait::wake_all(atomic as *const AtomicU32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RegionMemory;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    fn ring() -> RingLayout {
        RingLayout::new(0, 8, 64).expect("layout")
    }

    /// The hook runs once per empty sample and the wait ends when data shows up.
    #[test]
    fn hook_runs_until_peer_publishes() {
        let memory = RegionMemory::new(64).unwrap();
        let wait = BlockingWait::new(AvailabilitySampler::new(&memory, 8), None);
        let mut calls = 0;
        let mut hook = || {
            calls += 1;
            if calls == 3 {
                memory.store_word(0, 2);
            }
        };
        let sample = wait
            .wait_until_available(Fd::RPC_IN, &ring(), Direction::Consumer, |n| n > 0, &mut hook)
            .unwrap();
        assert_eq!(sample.available, 2);
        assert_eq!(calls, 3);
    }

    #[test]
    fn predicate_is_checked_before_hook() {
        let memory = RegionMemory::new(64).unwrap();
        let wait = BlockingWait::new(AvailabilitySampler::new(&memory, 8), None);
        let mut hook = || panic!("space is already available");
        let sample = wait
            .wait_until_available(Fd::RPC_IN, &ring(), Direction::Producer, |n| n > 0, &mut hook)
            .unwrap();
        assert_eq!(sample.available, 7);
    }

    /// With a configured timeout an idle peer produces `TimedOut`.
    #[test]
    fn timeout_is_opt_in() {
        let memory = RegionMemory::new(64).unwrap();
        let wait = BlockingWait::new(
            AvailabilitySampler::new(&memory, 8),
            Some(Duration::from_millis(5)),
        );
        let err = wait
            .wait_until_available(Fd::RPC_OUT, &ring(), Direction::Consumer, |n| n > 0, &mut Yield)
            .unwrap_err();
        assert!(matches!(err, MailboxError::TimedOut { fd: Fd::RPC_OUT, .. }));
    }

    #[test]
    fn wait_returns_when_value_already_changed() {
        let atomic = AtomicU32::new(1);
        assert_eq!(wait_u32(&atomic, 0), WaitResult::NotEqual);
    }

    #[test]
    fn wake_all_releases_parked_waiter() {
        let atomic = Arc::new(AtomicU32::new(0));
        let waiter = {
            let atomic = Arc::clone(&atomic);
            thread::spawn(move || {
                while atomic.load(Ordering::Acquire) == 0 {
                    wait_u32(&atomic, 0);
                }
            })
        };
        atomic.store(1, Ordering::Release);
        wake_all(&atomic);
        waiter.join().unwrap();
    }
}
