//! Error surface for mailbox streams.
//!
//! Every failure is returned to the immediate caller; nothing in the crate
//! retries on the caller's behalf except the bounded cursor re-reads in the
//! sampler. Errors map onto the POSIX codes the co-processor C library
//! reports so higher layers can keep their `errno` expectations.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::registry::Fd;

/// Convenience result alias for fallible mailbox operations.
pub type MailboxResult<T, E = MailboxError> = Result<T, E>;

/// `errno` values reported for each error kind.
///
/// Values follow newlib's `<sys/errno.h>`, which agrees with Linux for every
/// code below except `ETIMEDOUT`.
pub mod errno {
    /// No such channel name.
    pub const ENOENT: i32 = 2;
    /// Cursor words never settled.
    pub const EIO: i32 = 5;
    /// Handle not open for this use.
    pub const EBADF: i32 = 9;
    /// Window memory could not be allocated.
    pub const ENOMEM: i32 = 12;
    /// Rejected layout or configuration.
    pub const EINVAL: i32 = 22;
    /// Descriptor table is full.
    pub const ENFILE: i32 = 23;
    /// Seek on a stream.
    pub const ESPIPE: i32 = 29;
    /// Opt-in wait timeout elapsed.
    pub const ETIMEDOUT: i32 = 116;
}

#[derive(Debug, Error)]
pub enum MailboxError {
    /// Handle is out of range, closed, or used against its direction.
    #[error("bad descriptor {fd}: {reason}")]
    BadDescriptor { fd: Fd, reason: &'static str },

    /// Every dynamic slot of the registry is in use.
    #[error("too many open streams (limit {limit})")]
    TooManyOpenStreams { limit: usize },

    /// Mailbox streams are pipes; positioning is meaningless.
    #[error("mailbox streams are not seekable")]
    NotSeekable,

    /// A cursor word never settled on a plausible value.
    #[error("cursor at {offset:#06x} failed to stabilise after {attempts} reads")]
    HardwareGlitch { offset: usize, attempts: u32 },

    /// The opt-in wait timeout elapsed before the peer made progress.
    #[error("{fd} made no progress within {waited:?}")]
    TimedOut { fd: Fd, waited: Duration },

    /// Name is neither a well-known channel nor a parsable base offset.
    #[error("unknown channel name {0:?}")]
    UnknownChannel(String),

    /// Channel would not fit inside the shared window.
    #[error("channel at {base:#06x} with capacity {capacity} does not fit a {window}-byte window")]
    InvalidLayout {
        base: usize,
        capacity: usize,
        window: usize,
    },

    /// Dynamic ring would share window bytes with a channel already open.
    #[error("channel at {base:#06x} overlaps the ring open as {fd}")]
    ChannelOverlap { base: usize, fd: Fd },

    /// Configuration rejected by `MailboxConfig::validate`.
    #[error("invalid mailbox configuration: {0}")]
    InvalidConfig(&'static str),

    /// Backing memory for the shared window could not be created.
    #[error("failed to allocate shared window of {size} bytes aligned to {alignment}")]
    AllocationFailed { size: usize, alignment: usize },

    /// The file behind a shared window could not be mapped.
    #[error("failed to map shared window: {0}")]
    MapFailed(#[source] io::Error),
}

impl MailboxError {
    pub(crate) fn bad_descriptor(fd: Fd, reason: &'static str) -> Self {
        MailboxError::BadDescriptor { fd, reason }
    }

    /// POSIX error number matching this failure.
    pub fn errno(&self) -> i32 {
        match self {
            MailboxError::BadDescriptor { .. } => errno::EBADF,
            MailboxError::TooManyOpenStreams { .. } => errno::ENFILE,
            MailboxError::NotSeekable => errno::ESPIPE,
            MailboxError::HardwareGlitch { .. } => errno::EIO,
            MailboxError::TimedOut { .. } => errno::ETIMEDOUT,
            MailboxError::UnknownChannel(_) => errno::ENOENT,
            MailboxError::InvalidLayout { .. }
            | MailboxError::ChannelOverlap { .. }
            | MailboxError::InvalidConfig(_) => errno::EINVAL,
            MailboxError::AllocationFailed { .. } => errno::ENOMEM,
            MailboxError::MapFailed(err) => err.raw_os_error().unwrap_or(errno::EIO),
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            MailboxError::BadDescriptor { .. }
            | MailboxError::InvalidLayout { .. }
            | MailboxError::ChannelOverlap { .. }
            | MailboxError::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            MailboxError::TooManyOpenStreams { .. } | MailboxError::AllocationFailed { .. } => {
                io::ErrorKind::OutOfMemory
            }
            MailboxError::NotSeekable => io::ErrorKind::Unsupported,
            MailboxError::HardwareGlitch { .. } => io::ErrorKind::InvalidData,
            MailboxError::TimedOut { .. } => io::ErrorKind::TimedOut,
            MailboxError::UnknownChannel(_) => io::ErrorKind::NotFound,
            MailboxError::MapFailed(err) => err.kind(),
        }
    }
}

impl From<MailboxError> for io::Error {
    fn from(err: MailboxError) -> Self {
        match err {
            MailboxError::MapFailed(inner) => inner,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Each stream error kind carries the errno the co-processor libc uses.
    #[test]
    fn errno_mapping_matches_libc() {
        let fd = Fd::new(3);
        assert_eq!(
            MailboxError::bad_descriptor(fd, "not open").errno(),
            errno::EBADF
        );
        assert_eq!(
            MailboxError::TooManyOpenStreams { limit: 10 }.errno(),
            errno::ENFILE
        );
        assert_eq!(MailboxError::NotSeekable.errno(), errno::ESPIPE);
        assert_eq!(
            MailboxError::HardwareGlitch {
                offset: 0xF000,
                attempts: 4
            }
            .errno(),
            errno::EIO
        );
        assert_eq!(
            MailboxError::InvalidConfig("window too small").errno(),
            errno::EINVAL
        );
        let missing = io::Error::from_raw_os_error(errno::ENOENT);
        assert_eq!(MailboxError::MapFailed(missing).errno(), errno::ENOENT);
    }

    /// Conversion into `io::Error` keeps the mailbox error as the source.
    #[test]
    fn io_error_conversion_preserves_kind() {
        let err: io::Error = MailboxError::NotSeekable.into();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        assert!(err.to_string().contains("not seekable"));

        let err: io::Error = MailboxError::bad_descriptor(Fd::new(7), "not open").into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
