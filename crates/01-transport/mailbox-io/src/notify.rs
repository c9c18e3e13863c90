//! Best-effort peer wake-up.
//!
//! After a write on the designated channel the writer pulses a one-shot
//! signal line (set, then clear). The pulse only shortens the peer's wait; a
//! peer that never sees it still finds the data by polling.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::wait::{self, ServiceHook};

/// Downstream "raise peer signal" primitive.
pub trait PeerSignal: Send + Sync {
    /// Drives the signal line high (`true`) or low (`false`).
    fn set(&self, asserted: bool);
}

impl<T: PeerSignal + ?Sized> PeerSignal for Arc<T> {
    fn set(&self, asserted: bool) {
        (**self).set(asserted)
    }
}

impl<T: PeerSignal + ?Sized> PeerSignal for &T {
    fn set(&self, asserted: bool) {
        (**self).set(asserted)
    }
}

/// No signal line wired; the peer relies on polling alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSignal;

impl PeerSignal for NoSignal {
    fn set(&self, _asserted: bool) {}
}

/// Pulses the line: set then clear.
pub fn notify_peer<S: PeerSignal + ?Sized>(signal: &S) {
    signal.set(true);
    signal.set(false);
}

/// In-process signal line that counts rising edges.
///
/// Each rising edge bumps an epoch and wakes everyone parked on it, so a
/// waiter that remembers the last epoch it saw can never miss a pulse.
#[derive(Debug, Default)]
pub struct WakeLine {
    epoch: AtomicU32,
    level: AtomicBool,
}

impl WakeLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rising edges seen so far (wrapping).
    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Current level of the line.
    pub fn is_asserted(&self) -> bool {
        self.level.load(Ordering::Acquire)
    }

    /// Parks until the epoch moves past `seen`, returning the new epoch.
    pub fn wait_past(&self, seen: u32) -> u32 {
        loop {
            let current = self.epoch();
            if current != seen {
                return current;
            }
            wait::wait_u32(&self.epoch, seen);
        }
    }
}

impl PeerSignal for WakeLine {
    fn set(&self, asserted: bool) {
        let was = self.level.swap(asserted, Ordering::AcqRel);
        if asserted && !was {
            self.epoch.fetch_add(1, Ordering::AcqRel);
            wait::wake_all(&self.epoch);
        }
    }
}

/// [`ServiceHook`] that sleeps on a [`WakeLine`] instead of spinning.
///
/// The first call only records the current epoch; later calls park until a
/// pulse newer than the recorded one arrives. Because the epoch is recorded
/// before the next availability sample, a pulse that lands between the sample
/// and the park is still observed.
#[derive(Debug)]
pub struct WakeHook<L = Arc<WakeLine>> {
    line: L,
    seen: Option<u32>,
}

impl<L: AsRef<WakeLine>> WakeHook<L> {
    pub fn new(line: L) -> Self {
        Self { line, seen: None }
    }
}

impl<L: AsRef<WakeLine>> ServiceHook for WakeHook<L> {
    fn service(&mut self) {
        let line = self.line.as_ref();
        self.seen = Some(match self.seen {
            None => line.epoch(),
            Some(seen) => line.wait_past(seen),
        });
    }
}

impl AsRef<WakeLine> for WakeLine {
    fn as_ref(&self) -> &WakeLine {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// A pulse is one rising edge and leaves the line low.
    #[test]
    fn pulse_bumps_epoch_once() {
        let line = WakeLine::new();
        notify_peer(&line);
        notify_peer(&line);
        assert_eq!(line.epoch(), 2);
        assert!(!line.is_asserted());
    }

    #[test]
    fn holding_the_line_high_does_not_recount() {
        let line = WakeLine::new();
        line.set(true);
        line.set(true);
        line.set(false);
        assert_eq!(line.epoch(), 1);
    }

    /// A hook parked on a stale epoch is released by the next pulse.
    #[test]
    fn wake_hook_releases_on_pulse() {
        let line = Arc::new(WakeLine::new());
        let mut hook = WakeHook::new(Arc::clone(&line));
        hook.service();
        assert_eq!(hook.seen, Some(0));

        let pulser = {
            let line = Arc::clone(&line);
            thread::spawn(move || notify_peer(&*line))
        };
        hook.service();
        pulser.join().unwrap();
        assert_eq!(hook.seen, Some(1));
    }

    /// A pulse that already happened is not waited for again.
    #[test]
    fn wake_hook_does_not_miss_earlier_pulse() {
        let line = WakeLine::new();
        let mut hook = WakeHook::new(&line);
        hook.service();
        notify_peer(&line);
        hook.service();
        assert_eq!(hook.seen, Some(1));
    }
}
