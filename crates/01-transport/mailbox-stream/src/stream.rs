use mailbox_io::{
    Direction, Fd, Mailbox, NoSignal, PeerSignal, ServiceHook, SharedMemory, Side, Spin,
};
use smallvec::SmallVec;
use tracing::trace;

use crate::{StreamError, StreamResult};

/// Frames written in one go up to this size avoid a heap allocation.
const INLINE_FRAME: usize = 64;

/// Where a Zynq-7000 co-processor sees the host's DDR.
pub const ZYNQ_PTR_OFFSET: u32 = 0x2000_0000;
/// Where a Zynq UltraScale+ co-processor sees the host's DDR.
pub const ZYNQ_US_PTR_OFFSET: u32 = 0x8000_0000;

/// Typed little-endian reads and writes over a pair of channels.
///
/// Reads come from `read_fd`, writes go to `write_fd`. Every `write_*` and
/// `read_*` call blocks until the whole value has crossed, running the hook
/// while the ring is full or empty.
pub struct MailboxStream<'a, M, S = NoSignal, H = Spin> {
    mailbox: &'a Mailbox<M, S>,
    read_fd: Fd,
    write_fd: Fd,
    ptr_offset: u32,
    hook: H,
}

impl<'a, M: SharedMemory, S: PeerSignal> MailboxStream<'a, M, S> {
    /// Pairs two open descriptors, checking each faces the right way.
    pub fn new(mailbox: &'a Mailbox<M, S>, read_fd: Fd, write_fd: Fd) -> StreamResult<Self> {
        mailbox.registry().lookup(read_fd, Direction::Consumer)?;
        mailbox.registry().lookup(write_fd, Direction::Producer)?;
        Ok(Self {
            mailbox,
            read_fd,
            write_fd,
            ptr_offset: 0,
            hook: Spin,
        })
    }

    /// The RPC channel pair as seen from the mailbox's side.
    pub fn rpc(mailbox: &'a Mailbox<M, S>) -> StreamResult<Self> {
        let (read_fd, write_fd) = match mailbox.side() {
            Side::Host => (Fd::RPC_OUT, Fd::RPC_IN),
            Side::CoProcessor => (Fd::RPC_IN, Fd::RPC_OUT),
        };
        Self::new(mailbox, read_fd, write_fd)
    }

    /// The console channel pair as seen from the mailbox's side.
    pub fn console(mailbox: &'a Mailbox<M, S>) -> StreamResult<Self> {
        Self::new(mailbox, mailbox.console_reader(), mailbox.console_writer())
    }
}

impl<'a, M: SharedMemory, S: PeerSignal, H: ServiceHook> MailboxStream<'a, M, S, H> {
    /// Replaces the hook run while blocked.
    pub fn with_hook<H2: ServiceHook>(self, hook: H2) -> MailboxStream<'a, M, S, H2> {
        MailboxStream {
            mailbox: self.mailbox,
            read_fd: self.read_fd,
            write_fd: self.write_fd,
            ptr_offset: self.ptr_offset,
            hook,
        }
    }

    /// Sets the bits `write_address` ORs into adjusted pointers.
    pub fn with_ptr_offset(mut self, offset: u32) -> Self {
        self.ptr_offset = offset;
        self
    }

    pub fn read_fd(&self) -> Fd {
        self.read_fd
    }

    pub fn write_fd(&self) -> Fd {
        self.write_fd
    }

    /// Bytes waiting to be read.
    pub fn bytes_available(&self) -> StreamResult<usize> {
        Ok(self.mailbox.available(self.read_fd)?)
    }

    /// Bytes that can be written without blocking.
    pub fn buffer_space(&self) -> StreamResult<usize> {
        Ok(self.mailbox.available(self.write_fd)?)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> StreamResult<()> {
        self.mailbox
            .write_all_with(self.write_fd, bytes, &mut self.hook)?;
        trace!(fd = %self.write_fd, len = bytes.len(), "stream write");
        Ok(())
    }

    pub fn write_byte(&mut self, value: u8) -> StreamResult<()> {
        self.write_bytes(&[value])
    }

    pub fn write_i16(&mut self, value: i16) -> StreamResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u16(&mut self, value: u16) -> StreamResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> StreamResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> StreamResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_f32(&mut self, value: f32) -> StreamResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Sends a host buffer address as a `u32`. With `adjust` the pointer
    /// offset is ORed in so the co-processor can dereference it.
    pub fn write_address(&mut self, addr: u32, adjust: bool) -> StreamResult<()> {
        let addr = if adjust { addr | self.ptr_offset } else { addr };
        self.write_u32(addr)
    }

    /// Writes a `u16` byte length followed by the UTF-8 bytes.
    pub fn write_string(&mut self, value: &str) -> StreamResult<()> {
        let len = u16::try_from(value.len()).map_err(|_| StreamError::StringTooLong {
            len: value.len(),
            max: u16::MAX as usize,
        })?;
        let mut frame: SmallVec<[u8; INLINE_FRAME]> = SmallVec::with_capacity(2 + value.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(value.as_bytes());
        self.write_bytes(&frame)
    }

    /// Fills `buf` completely, blocking as needed.
    pub fn read_into(&mut self, buf: &mut [u8]) -> StreamResult<()> {
        self.mailbox
            .read_exact_with(self.read_fd, buf, &mut self.hook)?;
        trace!(fd = %self.read_fd, len = buf.len(), "stream read");
        Ok(())
    }

    /// Reads exactly `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> StreamResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    /// Reads whatever is buffered, at most `max` bytes, without blocking.
    pub fn read_upto(&mut self, max: usize) -> StreamResult<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = self.mailbox.try_read(self.read_fd, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn read_array<const N: usize>(&mut self) -> StreamResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    pub fn read_byte(&mut self) -> StreamResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i16(&mut self) -> StreamResult<i16> {
        self.read_array().map(i16::from_le_bytes)
    }

    pub fn read_u16(&mut self) -> StreamResult<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_i32(&mut self) -> StreamResult<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> StreamResult<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_f32(&mut self) -> StreamResult<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    pub fn read_string(&mut self) -> StreamResult<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailbox_io::{MailboxConfig, RegionMemory};

    /// Host and co-processor see the same RPC pair from opposite ends.
    #[test]
    fn rpc_pairs_mirror_across_sides() {
        let config = MailboxConfig::compact(32);
        let memory = RegionMemory::new(config.window_len).unwrap();
        let host = Mailbox::new(&memory, Side::Host, config.clone()).unwrap();
        let coproc = Mailbox::new(&memory, Side::CoProcessor, config).unwrap();

        let host_stream = MailboxStream::rpc(&host).unwrap();
        let coproc_stream = MailboxStream::rpc(&coproc).unwrap();
        assert_eq!(host_stream.write_fd(), coproc_stream.read_fd());
        assert_eq!(host_stream.read_fd(), coproc_stream.write_fd());
    }

    #[test]
    fn pairing_checks_directions() {
        let config = MailboxConfig::compact(32);
        let memory = RegionMemory::new(config.window_len).unwrap();
        let host = Mailbox::new(&memory, Side::Host, config).unwrap();
        assert!(matches!(
            MailboxStream::new(&host, Fd::RPC_IN, Fd::RPC_OUT),
            Err(StreamError::Mailbox(_))
        ));
    }

    /// Oversized strings are refused before anything reaches the ring.
    #[test]
    fn oversized_string_is_rejected() {
        let config = MailboxConfig::compact(32);
        let memory = RegionMemory::new(config.window_len).unwrap();
        let host = Mailbox::new(&memory, Side::Host, config).unwrap();
        let mut stream = MailboxStream::rpc(&host).unwrap();
        let huge = "x".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            stream.write_string(&huge),
            Err(StreamError::StringTooLong { len, .. }) if len == huge.len()
        ));
        assert_eq!(stream.buffer_space().unwrap(), 31);
    }

    #[test]
    fn addresses_take_the_offset_only_when_adjusted() {
        let config = MailboxConfig::compact(32);
        let memory = RegionMemory::new(config.window_len).unwrap();
        let host = Mailbox::new(&memory, Side::Host, config.clone()).unwrap();
        let coproc = Mailbox::new(&memory, Side::CoProcessor, config).unwrap();
        let mut tx = MailboxStream::rpc(&host)
            .unwrap()
            .with_ptr_offset(ZYNQ_PTR_OFFSET)
            .with_hook(mailbox_io::Yield);
        let mut rx = MailboxStream::rpc(&coproc).unwrap();

        tx.write_address(0x0180_0000, true).unwrap();
        tx.write_address(0x0180_0000, false).unwrap();
        assert_eq!(rx.read_u32().unwrap(), 0x2180_0000);
        assert_eq!(rx.read_u32().unwrap(), 0x0180_0000);

        let mut plain = MailboxStream::rpc(&host).unwrap();
        plain.write_address(0xDEAD_BEE0, true).unwrap();
        assert_eq!(rx.read_u32().unwrap(), 0xDEAD_BEE0);
    }
}
