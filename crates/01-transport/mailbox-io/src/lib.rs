//! Byte-stream channels between a host and a co-processor over shared memory.
//!
//! Each channel is a single-producer, single-consumer ring laid out as two
//! cursor words followed by the payload. Neither processor has atomic
//! read-modify-write access to the window, so the only synchronisation is
//! cursor ownership: each cursor has exactly one writer, and payload bytes are
//! published before the cursor that exposes them.
//!
//! The public surface mirrors POSIX descriptors: [`Mailbox::open`],
//! [`Mailbox::close`], [`Mailbox::read`], [`Mailbox::write`] and
//! [`Mailbox::available`], with short transfers and blocking waits that yield
//! to a caller-supplied [`ServiceHook`].

mod config;
mod error;
mod layout;
mod mailbox;
mod memory;
mod notify;
mod region;
mod registry;
mod sampler;
mod transfer;
pub mod wait;

pub use config::{MailboxConfig, Side, WaitConfig};
pub use error::{errno, MailboxError, MailboxResult};
pub use layout::{
    parse_base, Direction, RingLayout, WellKnown, CURSOR_BYTES, HEADER_BYTES, MIN_CAPACITY,
};
pub use mailbox::{ChannelSpec, Mailbox, Stream};
pub use memory::{RegionMemory, SharedMemory};
pub use notify::{notify_peer, NoSignal, PeerSignal, WakeHook, WakeLine};
pub use region::SharedRegion;
pub use registry::{ChannelDescriptor, Fd, MailboxRegistry};
pub use sampler::ring_available;
pub use wait::{ServiceHook, Spin, Yield};
