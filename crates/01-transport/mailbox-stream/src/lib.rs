//! Typed framing over mailbox channel pairs.
//!
//! Scalars are little-endian; strings carry a `u16` length prefix. The RPC
//! layer on both processors speaks this encoding.

mod error;
mod stream;

pub use error::{StreamError, StreamResult};
pub use stream::{MailboxStream, ZYNQ_PTR_OFFSET, ZYNQ_US_PTR_OFFSET};
