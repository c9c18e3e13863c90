use std::string::FromUtf8Error;

use mailbox_io::MailboxError;
use thiserror::Error;

pub type StreamResult<T, E = StreamError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    /// Strings travel with a `u16` length prefix.
    #[error("string of {len} bytes exceeds the {max}-byte frame limit")]
    StringTooLong { len: usize, max: usize },

    #[error("received string is not valid UTF-8")]
    Utf8(#[from] FromUtf8Error),
}
