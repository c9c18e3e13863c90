//! Fixed-capacity descriptor table.
//!
//! Slot index is the handle. The first [`WellKnown::COUNT`] slots belong to
//! the well-known channels so their handles never move; dynamic channels are
//! placed in the first free slot after them.

use std::fmt;

use tracing::debug;

use crate::layout::{Direction, RingLayout, WellKnown};
use crate::{MailboxError, MailboxResult};

/// POSIX-style stream handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fd(usize);

impl Fd {
    pub const CONSOLE_IN: Fd = Fd(0);
    pub const CONSOLE_OUT: Fd = Fd(1);
    pub const RPC_IN: Fd = Fd(2);
    pub const RPC_OUT: Fd = Fd(3);

    pub const fn new(raw: usize) -> Self {
        Fd(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    /// Handle of a well-known channel.
    pub const fn well_known(channel: WellKnown) -> Self {
        match channel {
            WellKnown::ConsoleIn => Fd::CONSOLE_IN,
            WellKnown::ConsoleOut => Fd::CONSOLE_OUT,
            WellKnown::RpcIn => Fd::RPC_IN,
            WellKnown::RpcOut => Fd::RPC_OUT,
        }
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// Everything needed to move bytes on one open channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub ring: RingLayout,
    pub direction: Direction,
    /// Pulse the peer-wake line after each write.
    pub notify: bool,
}

impl ChannelDescriptor {
    pub fn new(ring: RingLayout, direction: Direction) -> Self {
        Self {
            ring,
            direction,
            notify: false,
        }
    }

    pub fn with_notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }
}

#[derive(Debug)]
pub struct MailboxRegistry {
    slots: Box<[Option<ChannelDescriptor>]>,
}

impl MailboxRegistry {
    /// Creates an empty table with `limit` slots.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: vec![None; limit].into_boxed_slice(),
        }
    }

    pub fn limit(&self) -> usize {
        self.slots.len()
    }

    /// Places a descriptor in a specific slot, replacing whatever was there.
    pub(crate) fn install(&mut self, fd: Fd, descriptor: ChannelDescriptor) -> MailboxResult<()> {
        let slot = self
            .slots
            .get_mut(fd.raw())
            .ok_or_else(|| MailboxError::bad_descriptor(fd, "out of range"))?;
        *slot = Some(descriptor);
        debug!(%fd, base = descriptor.ring.base(), capacity = descriptor.ring.capacity(), "installed channel");
        Ok(())
    }

    /// Allocates the first free dynamic slot.
    pub fn open(&mut self, descriptor: ChannelDescriptor) -> MailboxResult<Fd> {
        let limit = self.limit();
        let idx = self
            .slots
            .iter()
            .enumerate()
            .skip(WellKnown::COUNT)
            .find_map(|(idx, slot)| slot.is_none().then_some(idx))
            .ok_or(MailboxError::TooManyOpenStreams { limit })?;
        let fd = Fd::new(idx);
        self.slots[idx] = Some(descriptor);
        debug!(%fd, base = descriptor.ring.base(), capacity = descriptor.ring.capacity(), direction = ?descriptor.direction, "opened channel");
        Ok(fd)
    }

    /// Frees the slot. Shared memory is left untouched, so a channel
    /// re-opened at the same base resumes from the cursors in the window.
    pub fn close(&mut self, fd: Fd) -> MailboxResult<ChannelDescriptor> {
        let slot = self
            .slots
            .get_mut(fd.raw())
            .ok_or_else(|| MailboxError::bad_descriptor(fd, "out of range"))?;
        let descriptor = slot
            .take()
            .ok_or_else(|| MailboxError::bad_descriptor(fd, "not open"))?;
        debug!(%fd, "closed channel");
        Ok(descriptor)
    }

    pub fn get(&self, fd: Fd) -> MailboxResult<&ChannelDescriptor> {
        match self.slots.get(fd.raw()) {
            Some(Some(descriptor)) => Ok(descriptor),
            Some(None) => Err(MailboxError::bad_descriptor(fd, "not open")),
            None => Err(MailboxError::bad_descriptor(fd, "out of range")),
        }
    }

    /// Looks up `fd` and checks it was opened for `direction`.
    pub fn lookup(&self, fd: Fd, direction: Direction) -> MailboxResult<&ChannelDescriptor> {
        let descriptor = self.get(fd)?;
        if descriptor.direction != direction {
            let reason = match direction {
                Direction::Producer => "not open for writing",
                Direction::Consumer => "not open for reading",
            };
            return Err(MailboxError::bad_descriptor(fd, reason));
        }
        Ok(descriptor)
    }

    pub fn is_open(&self, fd: Fd) -> bool {
        self.get(fd).is_ok()
    }

    /// Open handles with their descriptors, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Fd, &ChannelDescriptor)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|descriptor| (Fd::new(idx), descriptor)))
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(base: usize) -> ChannelDescriptor {
        ChannelDescriptor::new(
            RingLayout::new(base, 8, 0x1000).expect("layout"),
            Direction::Producer,
        )
    }

    /// Dynamic channels never land in the slots reserved for well-known ones.
    #[test]
    fn dynamic_open_skips_reserved_slots() {
        let mut registry = MailboxRegistry::with_limit(6);
        assert_eq!(registry.open(descriptor(0x100)).unwrap(), Fd::new(4));
        assert_eq!(registry.open(descriptor(0x200)).unwrap(), Fd::new(5));
        assert!(matches!(
            registry.open(descriptor(0x300)),
            Err(MailboxError::TooManyOpenStreams { limit: 6 })
        ));
    }

    /// A freed slot is handed out again by the next open.
    #[test]
    fn close_frees_slot_for_reuse() {
        let mut registry = MailboxRegistry::with_limit(8);
        let a = registry.open(descriptor(0x100)).unwrap();
        let b = registry.open(descriptor(0x200)).unwrap();
        registry.close(a).unwrap();
        assert!(!registry.is_open(a));
        assert!(registry.is_open(b));
        assert_eq!(registry.open(descriptor(0x300)).unwrap(), a);
    }

    /// Closing an unknown handle fails and leaves the rest of the table alone.
    #[test]
    fn close_invalid_handle_is_bad_descriptor() {
        let mut registry = MailboxRegistry::with_limit(8);
        registry
            .install(Fd::CONSOLE_OUT, descriptor(0x000))
            .unwrap();
        let dynamic = registry.open(descriptor(0x100)).unwrap();
        let before: Vec<_> = registry.iter().map(|(fd, d)| (fd, *d)).collect();

        for fd in [Fd::new(0), Fd::new(6), Fd::new(99)] {
            assert!(matches!(
                registry.close(fd),
                Err(MailboxError::BadDescriptor { .. })
            ));
        }

        let after: Vec<_> = registry.iter().map(|(fd, d)| (fd, *d)).collect();
        assert_eq!(before, after);
        assert!(registry.is_open(dynamic));
    }

    #[test]
    fn lookup_enforces_direction() {
        let mut registry = MailboxRegistry::with_limit(8);
        let fd = registry.open(descriptor(0x100)).unwrap();
        assert!(registry.lookup(fd, Direction::Producer).is_ok());
        match registry.lookup(fd, Direction::Consumer) {
            Err(MailboxError::BadDescriptor { reason, .. }) => {
                assert_eq!(reason, "not open for reading")
            }
            other => panic!("unexpected lookup result: {other:?}"),
        }
    }
}
