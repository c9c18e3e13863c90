//! Ordered access to the shared window.
//!
//! [`SharedMemory`] is the only way the rest of the crate touches the window.
//! Cursor words are loaded with acquire and stored with release semantics so
//! payload bytes written before a cursor store are visible to a peer that
//! observes the new cursor. Payload bytes themselves are plain volatile
//! copies; the cursors decide who may touch which byte.

use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::layout::CURSOR_BYTES;
use crate::region::SharedRegion;
use crate::{MailboxError, MailboxResult};

const WINDOW_ALIGNMENT: usize = 64;

/// Ordered direct-memory primitive over the shared window.
///
/// Implementations must make every store that precedes a
/// [`store_word`](SharedMemory::store_word) visible to a peer whose
/// [`load_word`](SharedMemory::load_word) observes that word.
pub trait SharedMemory: Send + Sync {
    /// Size of the addressable window in bytes.
    fn window_len(&self) -> usize;

    /// Acquire-loads the 32-bit word at `offset`.
    fn load_word(&self, offset: usize) -> u32;

    /// Release-stores `value` into the 32-bit word at `offset`.
    fn store_word(&self, offset: usize, value: u32);

    /// Copies `dst.len()` bytes starting at `offset` out of the window.
    fn read_bytes(&self, offset: usize, dst: &mut [u8]);

    /// Copies `src` into the window starting at `offset`.
    fn write_bytes(&self, offset: usize, src: &[u8]);
}

impl<T: SharedMemory + ?Sized> SharedMemory for Arc<T> {
    fn window_len(&self) -> usize {
        (**self).window_len()
    }

    fn load_word(&self, offset: usize) -> u32 {
        (**self).load_word(offset)
    }

    fn store_word(&self, offset: usize, value: u32) {
        (**self).store_word(offset, value)
    }

    fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        (**self).read_bytes(offset, dst)
    }

    fn write_bytes(&self, offset: usize, src: &[u8]) {
        (**self).write_bytes(offset, src)
    }
}

impl<T: SharedMemory + ?Sized> SharedMemory for &T {
    fn window_len(&self) -> usize {
        (**self).window_len()
    }

    fn load_word(&self, offset: usize) -> u32 {
        (**self).load_word(offset)
    }

    fn store_word(&self, offset: usize, value: u32) {
        (**self).store_word(offset, value)
    }

    fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        (**self).read_bytes(offset, dst)
    }

    fn write_bytes(&self, offset: usize, src: &[u8]) {
        (**self).write_bytes(offset, src)
    }
}

/// [`SharedMemory`] over a raw window pointer.
///
/// This is the single unsafe boundary of the crate: every access is bounds
/// checked against the window length before the pointer is dereferenced.
#[derive(Debug)]
pub struct RegionMemory {
    base: NonNull<u8>,
    len: usize,
    _region: Option<SharedRegion>,
}

// SAFETY: the window is designed for concurrent access from two agents. Cursor
// words go through `AtomicU32`; payload ranges are partitioned by the cursors so
// the producer and consumer never touch the same byte concurrently.
unsafe impl Send for RegionMemory {}
// SAFETY: see `Send`; all methods take `&self` and perform only ordered or
// cursor-partitioned accesses.
unsafe impl Sync for RegionMemory {}

impl RegionMemory {
    /// Allocates a zeroed private window of `len` bytes.
    pub fn new(len: usize) -> MailboxResult<Self> {
        let region = SharedRegion::new_aligned(len, WINDOW_ALIGNMENT)?;
        Self::from_region(region)
    }

    /// Maps a file-backed window that other processes may map as well.
    pub fn map_file(path: &Path, len: usize) -> MailboxResult<Self> {
        let region = SharedRegion::map_file(path, len)?;
        Self::from_region(region)
    }

    /// Wraps a window mapped elsewhere (for example a `/dev/mem` mapping of
    /// the co-processor's block RAM).
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes, aligned to
    /// four bytes, and remain mapped for the lifetime of the returned value.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Option<Self> {
        let base = NonNull::new(ptr)?;
        if base.as_ptr() as usize % CURSOR_BYTES != 0 {
            return None;
        }
        Some(Self {
            base,
            len,
            _region: None,
        })
    }

    fn from_region(mut region: SharedRegion) -> MailboxResult<Self> {
        let len = region.len();
        let base = NonNull::new(region.as_mut_ptr()).ok_or(MailboxError::AllocationFailed {
            size: len,
            alignment: region.alignment(),
        })?;
        Ok(Self {
            base,
            len,
            _region: Some(region),
        })
    }

    fn check_range(&self, offset: usize, len: usize) {
        let in_bounds = offset.checked_add(len).is_some_and(|end| end <= self.len);
        assert!(
            in_bounds,
            "access of {len} bytes at {offset:#x} exceeds {}-byte window",
            self.len
        );
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        self.check_range(offset, CURSOR_BYTES);
        assert!(
            offset % CURSOR_BYTES == 0,
            "cursor offset {offset:#x} is not word aligned"
        );
        // SAFETY: bounds and alignment checked above; the window outlives
        // `&self` and cursor words are only ever accessed atomically.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU32) }
    }
}

impl SharedMemory for RegionMemory {
    fn window_len(&self) -> usize {
        self.len
    }

    fn load_word(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::Acquire)
    }

    fn store_word(&self, offset: usize, value: u32) {
        self.word(offset).store(value, Ordering::Release)
    }

    fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.check_range(offset, dst.len());
        let src = self.base.as_ptr().wrapping_add(offset);
        for (idx, byte) in dst.iter_mut().enumerate() {
            // SAFETY: `offset + idx` is inside the window (checked above).
            *byte = unsafe { ptr::read_volatile(src.add(idx)) };
        }
    }

    fn write_bytes(&self, offset: usize, src: &[u8]) {
        self.check_range(offset, src.len());
        let dst = self.base.as_ptr().wrapping_add(offset);
        for (idx, byte) in src.iter().enumerate() {
            // SAFETY: `offset + idx` is inside the window (checked above).
            unsafe { ptr::write_volatile(dst.add(idx), *byte) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_and_bytes_round_trip() {
        let memory = RegionMemory::new(64).expect("window");
        memory.store_word(8, 0xDEAD_BEEF);
        assert_eq!(memory.load_word(8), 0xDEAD_BEEF);

        memory.write_bytes(16, b"mailbox");
        let mut out = [0u8; 7];
        memory.read_bytes(16, &mut out);
        assert_eq!(&out, b"mailbox");
    }

    /// Out-of-window accesses are refused before any pointer arithmetic.
    #[test]
    #[should_panic(expected = "exceeds 64-byte window")]
    fn out_of_window_access_panics() {
        let memory = RegionMemory::new(64).expect("window");
        memory.write_bytes(60, b"too long");
    }

    #[test]
    #[should_panic(expected = "not word aligned")]
    fn misaligned_cursor_panics() {
        let memory = RegionMemory::new(64).expect("window");
        memory.load_word(2);
    }

    #[test]
    fn from_raw_rejects_null() {
        // SAFETY: a null pointer is rejected before use.
        assert!(unsafe { RegionMemory::from_raw(ptr::null_mut(), 16) }.is_none());
    }
}
