//! File-descriptor style surface over the shared window.
//!
//! A [`Mailbox`] is one side's view of the subsystem: the memory window, the
//! descriptor table, and the optional peer-wake line. The host and the
//! co-processor each build their own over the same window.

use std::io::{self, SeekFrom};

use tracing::{debug, warn};

use crate::config::{MailboxConfig, Side};
use crate::layout::{parse_base, Direction, RingLayout, WellKnown};
use crate::memory::SharedMemory;
use crate::notify::{NoSignal, PeerSignal};
use crate::registry::{ChannelDescriptor, Fd, MailboxRegistry};
use crate::transfer::StreamTransfer;
use crate::wait::{ServiceHook, Spin};
use crate::{MailboxError, MailboxResult};

/// What to open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelSpec {
    /// One of the pre-registered channels, in the direction this side uses.
    WellKnown(WellKnown),
    /// An arbitrary ring inside the window.
    At {
        base: usize,
        capacity: usize,
        direction: Direction,
    },
}

pub struct Mailbox<M, S = NoSignal> {
    memory: M,
    signal: S,
    side: Side,
    config: MailboxConfig,
    registry: MailboxRegistry,
}

impl<M: SharedMemory> Mailbox<M> {
    /// Builds a mailbox without a peer-wake line.
    pub fn new(memory: M, side: Side, config: MailboxConfig) -> MailboxResult<Self> {
        Self::with_signal(memory, side, config, NoSignal)
    }
}

impl<M: SharedMemory, S: PeerSignal> Mailbox<M, S> {
    /// Builds a mailbox and pre-registers the well-known channels.
    ///
    /// The window is not cleared; a side that starts later picks up the
    /// cursors its peer left behind.
    pub fn with_signal(
        memory: M,
        side: Side,
        config: MailboxConfig,
        signal: S,
    ) -> MailboxResult<Self> {
        config.validate()?;
        if memory.window_len() < config.window_len {
            return Err(MailboxError::InvalidConfig(
                "shared window is smaller than the configured layout",
            ));
        }
        let mut mailbox = Self {
            memory,
            signal,
            side,
            registry: MailboxRegistry::with_limit(config.max_descriptors),
            config,
        };
        for channel in WellKnown::ALL {
            mailbox.install_well_known(channel)?;
        }
        debug!(side = ?side, window = mailbox.config.window_len, "mailbox ready");
        Ok(mailbox)
    }

    fn well_known_descriptor(&self, channel: WellKnown) -> MailboxResult<ChannelDescriptor> {
        let ring = self.config.well_known_ring(channel)?;
        let notify = self.config.notify_console
            && self.side == Side::CoProcessor
            && channel == WellKnown::ConsoleOut;
        Ok(ChannelDescriptor::new(ring, self.side.direction_of(channel)).with_notify(notify))
    }

    fn install_well_known(&mut self, channel: WellKnown) -> MailboxResult<Fd> {
        let fd = Fd::well_known(channel);
        let descriptor = self.well_known_descriptor(channel)?;
        self.check_overlap(&descriptor.ring, Some(fd))?;
        self.registry.install(fd, descriptor)?;
        Ok(fd)
    }

    /// Refuses a ring that shares window bytes with an open channel other
    /// than `except`.
    fn check_overlap(&self, ring: &RingLayout, except: Option<Fd>) -> MailboxResult<()> {
        match self
            .registry
            .iter()
            .find(|(fd, open)| Some(*fd) != except && open.ring.overlaps(ring))
        {
            Some((fd, _)) => Err(MailboxError::ChannelOverlap {
                base: ring.base(),
                fd,
            }),
            None => Ok(()),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn signal(&self) -> &S {
        &self.signal
    }

    pub fn registry(&self) -> &MailboxRegistry {
        &self.registry
    }

    pub fn descriptor(&self, fd: Fd) -> MailboxResult<&ChannelDescriptor> {
        self.registry.get(fd)
    }

    /// Opens a channel. Well-known channels always come back on their fixed
    /// handle, reinstalled if they had been closed. A ring at an explicit
    /// base must not overlap any channel this side already has open.
    pub fn open(&mut self, spec: ChannelSpec) -> MailboxResult<Fd> {
        match spec {
            ChannelSpec::WellKnown(channel) => self.install_well_known(channel),
            ChannelSpec::At {
                base,
                capacity,
                direction,
            } => {
                let ring = RingLayout::new(base, capacity, self.config.window_len)?;
                self.check_overlap(&ring, None)?;
                self.registry
                    .open(ChannelDescriptor::new(ring, direction))
            }
        }
    }

    /// Opens a channel by name: a well-known name (`rpc-in`, `stdout`, ...)
    /// or a base offset such as `0x1000`, which gets the configured dynamic
    /// capacity.
    pub fn open_named(&mut self, name: &str, direction: Direction) -> MailboxResult<Fd> {
        if let Some(channel) = WellKnown::from_name(name) {
            if self.side.direction_of(channel) != direction {
                return Err(MailboxError::bad_descriptor(
                    Fd::well_known(channel),
                    "well-known channel has the other direction on this side",
                ));
            }
            return self.open(ChannelSpec::WellKnown(channel));
        }
        let base = parse_base(name).ok_or_else(|| MailboxError::UnknownChannel(name.to_owned()))?;
        self.open(ChannelSpec::At {
            base,
            capacity: self.config.dynamic_capacity,
            direction,
        })
    }

    /// Frees the handle. Cursors and payload stay in the window.
    pub fn close(&mut self, fd: Fd) -> MailboxResult<()> {
        match self.registry.close(fd) {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(%fd, %err, "close rejected");
                Err(err)
            }
        }
    }

    fn transfer(&self, fd: Fd, direction: Direction) -> MailboxResult<StreamTransfer<'_, M, S>> {
        let descriptor = *self.registry.lookup(fd, direction)?;
        Ok(self.bind(fd, descriptor))
    }

    fn bind(&self, fd: Fd, descriptor: ChannelDescriptor) -> StreamTransfer<'_, M, S> {
        StreamTransfer::new(
            &self.memory,
            fd,
            descriptor,
            self.config.glitch_retry_budget,
            self.config.wait.timeout(),
        )
        .with_signal(&self.signal)
    }

    /// Bytes readable (consumer) or writable (producer) on `fd` right now.
    pub fn available(&self, fd: Fd) -> MailboxResult<usize> {
        let descriptor = *self.registry.get(fd)?;
        self.bind(fd, descriptor).available()
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> MailboxResult<usize> {
        self.read_with(fd, buf, &mut Spin)
    }

    /// Blocking read that runs `hook` between empty samples.
    pub fn read_with<H: ServiceHook + ?Sized>(
        &self,
        fd: Fd,
        buf: &mut [u8],
        hook: &mut H,
    ) -> MailboxResult<usize> {
        self.transfer(fd, Direction::Consumer)?.read(buf, hook)
    }

    pub fn write(&self, fd: Fd, buf: &[u8]) -> MailboxResult<usize> {
        self.write_with(fd, buf, &mut Spin)
    }

    /// Blocking write that runs `hook` between full samples.
    pub fn write_with<H: ServiceHook + ?Sized>(
        &self,
        fd: Fd,
        buf: &[u8],
        hook: &mut H,
    ) -> MailboxResult<usize> {
        self.transfer(fd, Direction::Producer)?.write(buf, hook)
    }

    pub fn try_read(&self, fd: Fd, buf: &mut [u8]) -> MailboxResult<usize> {
        self.transfer(fd, Direction::Consumer)?.try_read(buf)
    }

    pub fn try_write(&self, fd: Fd, buf: &[u8]) -> MailboxResult<usize> {
        self.transfer(fd, Direction::Producer)?.try_write(buf)
    }

    pub fn read_exact(&self, fd: Fd, buf: &mut [u8]) -> MailboxResult<()> {
        self.read_exact_with(fd, buf, &mut Spin)
    }

    /// Loops over short reads until `buf` is full.
    pub fn read_exact_with<H: ServiceHook + ?Sized>(
        &self,
        fd: Fd,
        buf: &mut [u8],
        hook: &mut H,
    ) -> MailboxResult<()> {
        let transfer = self.transfer(fd, Direction::Consumer)?;
        let mut filled = 0;
        while filled < buf.len() {
            filled += transfer.read(&mut buf[filled..], hook)?;
        }
        Ok(())
    }

    pub fn write_all(&self, fd: Fd, buf: &[u8]) -> MailboxResult<()> {
        self.write_all_with(fd, buf, &mut Spin)
    }

    /// Loops over short writes until all of `buf` is in the ring.
    pub fn write_all_with<H: ServiceHook + ?Sized>(
        &self,
        fd: Fd,
        buf: &[u8],
        hook: &mut H,
    ) -> MailboxResult<()> {
        let transfer = self.transfer(fd, Direction::Producer)?;
        let mut sent = 0;
        while sent < buf.len() {
            sent += transfer.write(&buf[sent..], hook)?;
        }
        Ok(())
    }

    /// Streams have no position. An open handle still reports `NotSeekable`
    /// rather than success; an invalid one reports `BadDescriptor`.
    pub fn seek(&self, fd: Fd, _pos: SeekFrom) -> MailboxResult<u64> {
        self.registry.get(fd)?;
        Err(MailboxError::NotSeekable)
    }

    /// Console channel this side writes to.
    pub fn console_writer(&self) -> Fd {
        match self.side {
            Side::CoProcessor => Fd::CONSOLE_OUT,
            Side::Host => Fd::CONSOLE_IN,
        }
    }

    /// Console channel this side reads from.
    pub fn console_reader(&self) -> Fd {
        match self.side {
            Side::CoProcessor => Fd::CONSOLE_IN,
            Side::Host => Fd::CONSOLE_OUT,
        }
    }

    /// Writes one byte to the console, waiting for room.
    pub fn outbyte(&self, byte: u8) -> MailboxResult<()> {
        self.write_all(self.console_writer(), &[byte])
    }

    /// Reads one byte from the console, waiting for it.
    pub fn inbyte(&self) -> MailboxResult<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(self.console_reader(), &mut byte)?;
        Ok(byte[0])
    }

    /// Borrows `fd` as a `std::io` stream.
    pub fn stream(&self, fd: Fd) -> MailboxResult<Stream<'_, M, S>> {
        self.registry.get(fd)?;
        Ok(Stream { mailbox: self, fd })
    }
}

/// [`io::Read`] / [`io::Write`] view of one descriptor.
pub struct Stream<'a, M, S = NoSignal> {
    mailbox: &'a Mailbox<M, S>,
    fd: Fd,
}

impl<M, S> Stream<'_, M, S> {
    pub fn fd(&self) -> Fd {
        self.fd
    }
}

impl<M: SharedMemory, S: PeerSignal> io::Read for Stream<'_, M, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.mailbox.read(self.fd, buf)?)
    }
}

impl<M: SharedMemory, S: PeerSignal> io::Write for Stream<'_, M, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.mailbox.write(self.fd, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
