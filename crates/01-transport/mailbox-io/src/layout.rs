//! Channel layout inside the shared window.
//!
//! ```text
//! base + 0  base + 4  base + 8                        base + 8 + C
//! +---------+---------+-------------------------------+
//! | write   | read    | payload (C bytes, circular)   |
//! | cursor  | cursor  |                               |
//! +---------+---------+-------------------------------+
//! ```
//!
//! The write cursor is owned by the producer, the read cursor by the
//! consumer. Both are byte offsets into the payload in `[0, C)`.

use serde::{Deserialize, Serialize};

use crate::{MailboxError, MailboxResult};

/// Size of one cursor word.
pub const CURSOR_BYTES: usize = 4;
/// Bytes preceding the payload: write cursor then read cursor.
pub const HEADER_BYTES: usize = 2 * CURSOR_BYTES;
/// Smallest payload that can hold a byte while keeping one slot reserved.
pub const MIN_CAPACITY: usize = 2;

/// Which cursor a side of a channel owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// Writes payload and advances the write cursor.
    Producer,
    /// Reads payload and advances the read cursor.
    Consumer,
}

impl Direction {
    /// The direction the other processor uses on the same channel.
    pub fn reversed(self) -> Self {
        match self {
            Direction::Producer => Direction::Consumer,
            Direction::Consumer => Direction::Producer,
        }
    }
}

/// Location of one ring inside the shared window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RingLayout {
    base: usize,
    capacity: usize,
}

impl RingLayout {
    /// Validates that a ring of `capacity` payload bytes at `base` fits a
    /// window of `window_len` bytes with word-aligned cursors.
    pub fn new(base: usize, capacity: usize, window_len: usize) -> MailboxResult<Self> {
        let invalid = MailboxError::InvalidLayout {
            base,
            capacity,
            window: window_len,
        };
        if capacity < MIN_CAPACITY
            || capacity > u32::MAX as usize
            || base % CURSOR_BYTES != 0
        {
            return Err(invalid);
        }
        let end = base
            .checked_add(HEADER_BYTES)
            .and_then(|payload| payload.checked_add(capacity));
        match end {
            Some(end) if end <= window_len => Ok(Self { base, capacity }),
            _ => Err(invalid),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Payload size `C`; at most `C - 1` bytes are ever in flight.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn write_cursor_offset(&self) -> usize {
        self.base
    }

    pub fn read_cursor_offset(&self) -> usize {
        self.base + CURSOR_BYTES
    }

    pub fn payload_offset(&self) -> usize {
        self.base + HEADER_BYTES
    }

    /// Total bytes the ring occupies, header included.
    pub fn span(&self) -> usize {
        HEADER_BYTES + self.capacity
    }

    /// Offset of the cursor owned by `direction`.
    pub fn own_cursor_offset(&self, direction: Direction) -> usize {
        match direction {
            Direction::Producer => self.write_cursor_offset(),
            Direction::Consumer => self.read_cursor_offset(),
        }
    }

    /// Offset of the cursor the peer of `direction` owns.
    pub fn peer_cursor_offset(&self, direction: Direction) -> usize {
        self.own_cursor_offset(direction.reversed())
    }

    /// Whether two rings share any byte of the window.
    pub fn overlaps(&self, other: &RingLayout) -> bool {
        self.base < other.base + other.span() && other.base < self.base + self.span()
    }
}

/// Channels pre-registered at subsystem init, in descriptor order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WellKnown {
    ConsoleIn,
    ConsoleOut,
    RpcIn,
    RpcOut,
}

impl WellKnown {
    pub const ALL: [WellKnown; 4] = [
        WellKnown::ConsoleIn,
        WellKnown::ConsoleOut,
        WellKnown::RpcIn,
        WellKnown::RpcOut,
    ];

    /// Number of descriptor slots reserved for well-known channels.
    pub const COUNT: usize = Self::ALL.len();

    /// Descriptor slot, and position of the channel in the I/O area.
    pub fn index(self) -> usize {
        match self {
            WellKnown::ConsoleIn => 0,
            WellKnown::ConsoleOut => 1,
            WellKnown::RpcIn => 2,
            WellKnown::RpcOut => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WellKnown::ConsoleIn => "console-in",
            WellKnown::ConsoleOut => "console-out",
            WellKnown::RpcIn => "rpc-in",
            WellKnown::RpcOut => "rpc-out",
        }
    }

    /// Resolves a channel name, accepting the POSIX stream aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "console-in" | "stdin" => Some(WellKnown::ConsoleIn),
            "console-out" | "stdout" => Some(WellKnown::ConsoleOut),
            "rpc-in" => Some(WellKnown::RpcIn),
            "rpc-out" => Some(WellKnown::RpcOut),
            _ => None,
        }
    }

    /// Direction of the channel as seen from the co-processor. Channels named
    /// `-in` flow towards the co-processor.
    pub fn coprocessor_direction(self) -> Direction {
        match self {
            WellKnown::ConsoleIn | WellKnown::RpcIn => Direction::Consumer,
            WellKnown::ConsoleOut | WellKnown::RpcOut => Direction::Producer,
        }
    }
}

/// Parses a dynamic channel name as a base offset (`0x1000` or `4096`).
pub fn parse_base(name: &str) -> Option<usize> {
    let name = name.trim();
    match name
        .strip_prefix("0x")
        .or_else(|| name.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => name.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cursor and payload offsets follow the documented header order.
    #[test]
    fn offsets_follow_header_order() {
        let ring = RingLayout::new(0xF400, 0x3F8, 0x10000).expect("layout");
        assert_eq!(ring.write_cursor_offset(), 0xF400);
        assert_eq!(ring.read_cursor_offset(), 0xF404);
        assert_eq!(ring.payload_offset(), 0xF408);
        assert_eq!(ring.span(), 0x400);
        assert_eq!(ring.own_cursor_offset(Direction::Consumer), 0xF404);
        assert_eq!(ring.peer_cursor_offset(Direction::Consumer), 0xF400);
    }

    /// Rings that spill past the window, are misaligned, or are too small are rejected.
    #[test]
    fn rejects_rings_outside_window() {
        assert!(RingLayout::new(0xFC00, 0x3F8, 0x10000).is_ok());
        assert!(RingLayout::new(0xFC00, 0x3F9, 0x10000).is_err());
        assert!(RingLayout::new(0x0002, 16, 0x10000).is_err());
        assert!(RingLayout::new(0, 1, 0x10000).is_err());
        assert!(RingLayout::new(usize::MAX - 3, 16, usize::MAX).is_err());
    }

    #[test]
    fn overlap_detection() {
        let a = RingLayout::new(0, 8, 64).unwrap();
        let b = RingLayout::new(16, 8, 64).unwrap();
        let c = RingLayout::new(12, 8, 64).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
    }

    #[test]
    fn names_and_bases_parse() {
        assert_eq!(WellKnown::from_name("stdout"), Some(WellKnown::ConsoleOut));
        assert_eq!(WellKnown::from_name("rpc-in"), Some(WellKnown::RpcIn));
        assert_eq!(WellKnown::from_name("uart"), None);
        assert_eq!(parse_base("0x1000"), Some(0x1000));
        assert_eq!(parse_base("512"), Some(512));
        assert_eq!(parse_base("not-a-channel"), None);
    }
}
