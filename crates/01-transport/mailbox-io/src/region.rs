//! Backing memory for the shared mailbox window.
//!
//! On real hardware the window is a dual-ported block RAM that the host maps
//! and the co-processor addresses directly. Off-target we stand it up as an
//! anonymous `mmap` (heap fallback), or as a file mapping so two processes can
//! attach to the same window.

use crate::{MailboxError, MailboxResult};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::OpenOptions;
use std::path::Path;
use std::ptr::NonNull;

#[derive(Debug)]
enum Backing {
    Mapped(memmap2::MmapMut),
    Owned { ptr: NonNull<u8>, layout: Layout },
}

impl Backing {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Backing::Mapped(map) => map.as_mut_ptr(),
            Backing::Owned { ptr, .. } => ptr.as_ptr(),
        }
    }
}

/// Owned, contiguous memory standing in for the shared window.
#[derive(Debug)]
pub struct SharedRegion {
    len: usize,
    alignment: usize,
    backing: Backing,
}

impl SharedRegion {
    /// Allocates a zeroed region of `len` bytes aligned to `alignment`, so
    /// every cursor starts at offset zero.
    ///
    /// An anonymous mapping is tried first; if its address does not satisfy
    /// the alignment the region falls back to the heap.
    pub fn new_aligned(len: usize, alignment: usize) -> MailboxResult<Self> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(MailboxError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        if let Some(backing) = Self::mmap_backed(len, alignment)? {
            return Ok(Self {
                len,
                alignment,
                backing,
            });
        }

        Self::heap_backed(len, alignment)
    }

    /// Maps `len` bytes of the file at `path`, creating and growing it as
    /// needed. Existing contents (including cursors) are preserved.
    pub fn map_file(path: &Path, len: usize) -> MailboxResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(MailboxError::MapFailed)?;
        let current = file.metadata().map_err(MailboxError::MapFailed)?.len();
        if current < len as u64 {
            file.set_len(len as u64).map_err(MailboxError::MapFailed)?;
        }

        // SAFETY: the mapping is only accessed through `RegionMemory`, which
        // treats every byte as concurrently mutable by the peer.
        let map = unsafe { memmap2::MmapOptions::new().len(len).map_mut(&file) }
            .map_err(MailboxError::MapFailed)?;
        Ok(Self {
            len,
            alignment: page_alignment(map.as_ptr()),
            backing: Backing::Mapped(map),
        })
    }

    fn heap_backed(len: usize, alignment: usize) -> MailboxResult<Self> {
        let layout = Layout::from_size_align(len, alignment).map_err(|_| {
            MailboxError::AllocationFailed {
                size: len,
                alignment,
            }
        })?;

        // SAFETY: `layout` has a non-zero size, checked in `new_aligned`.
        let ptr = unsafe { alloc_zeroed(layout) };

        let ptr = NonNull::new(ptr).ok_or(MailboxError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Self {
            len,
            alignment,
            backing: Backing::Owned { ptr, layout },
        })
    }

    fn mmap_backed(len: usize, alignment: usize) -> MailboxResult<Option<Backing>> {
        // Anonymous mappings come back zero-filled.
        let mut map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| MailboxError::AllocationFailed {
                size: len,
                alignment,
            })?;

        if map.as_mut_ptr() as usize % alignment != 0 {
            return Ok(None);
        }

        Ok(Some(Backing::Mapped(map)))
    }

    /// Total number of bytes managed by this region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the alignment the region was allocated with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Borrow the region as a mut pointer.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.backing.as_mut_ptr()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Owned { ptr, layout } = &self.backing {
            // SAFETY: `ptr` was returned by `alloc_zeroed` with `layout`.
            unsafe {
                dealloc(ptr.as_ptr(), *layout);
            }
        }
    }
}

fn page_alignment(ptr: *const u8) -> usize {
    let addr = ptr as usize;
    if addr == 0 {
        1
    } else {
        1 << addr.trailing_zeros().min(12)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Zeroed regions start with all cursors at offset zero.
    #[test]
    fn zeroed_region_is_zero() {
        let mut region = SharedRegion::new_aligned(0x400, 64).expect("region");
        assert_eq!(region.len(), 0x400);
        assert_eq!(region.as_mut_ptr() as usize % 64, 0);
        // SAFETY: the region owns 0x400 readable bytes.
        let bytes = unsafe { std::slice::from_raw_parts(region.as_mut_ptr(), region.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn rejects_bad_alignment() {
        assert!(matches!(
            SharedRegion::new_aligned(64, 3),
            Err(MailboxError::AllocationFailed { alignment: 3, .. })
        ));
        assert!(SharedRegion::new_aligned(0, 8).is_err());
    }

    /// File mappings keep their contents across re-mapping.
    #[test]
    fn file_mapping_persists_contents() {
        let path = std::env::temp_dir().join(format!(
            "mailbox-region-{}-{:?}.bin",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_file(&path);
        {
            let mut region = SharedRegion::map_file(&path, 64).expect("map file");
            // SAFETY: 64 bytes are mapped.
            unsafe { region.as_mut_ptr().add(10).write(0x5A) };
        }
        let mut region = SharedRegion::map_file(&path, 64).expect("remap file");
        // SAFETY: 64 bytes are mapped.
        let byte = unsafe { region.as_mut_ptr().add(10).read() };
        assert_eq!(byte, 0x5A);
        drop(region);
        let _ = std::fs::remove_file(&path);
    }
}
