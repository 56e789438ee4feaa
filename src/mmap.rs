use std::io;

use memmap2::MmapMut;

use crate::utils::{align_down, align_up, page_size};

/// Anonymous, zero-initialized memory mapping used as backing store for bitmaps, the card table
/// and object stacks.
pub struct MemMap {
    name: &'static str,
    map: MmapMut,
}

impl MemMap {
    pub fn map_anonymous(name: &'static str, size: usize) -> io::Result<Self> {
        // memmap2 refuses empty mappings.
        let map = MmapMut::map_anon(size.max(1))?;
        Ok(Self { name, map })
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        unsafe { self.begin().add(self.size()) }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.map.len()
    }

    /// Zeroes `[begin, end)` of this mapping. Whole pages are handed back to the kernel, which
    /// gives us zero pages on the next touch.
    pub fn zero_and_release_pages(&self, begin: *mut u8, end: *mut u8) {
        debug_assert!(begin >= self.begin() && end <= self.end());
        if begin >= end {
            return;
        }
        let page = page_size();
        let page_begin = align_up(begin as usize, page);
        let page_end = align_down(end as usize, page);
        if page_begin >= page_end {
            unsafe {
                std::ptr::write_bytes(begin, 0, end as usize - begin as usize);
            }
            return;
        }
        unsafe {
            std::ptr::write_bytes(begin, 0, page_begin - begin as usize);
            std::ptr::write_bytes(page_end as *mut u8, 0, end as usize - page_end);
            release_pages(page_begin as *mut u8, page_end - page_begin);
        }
    }
}

#[cfg(unix)]
unsafe fn release_pages(page: *mut u8, size: usize) {
    // Private anonymous mappings read back as zero after MADV_DONTNEED.
    if libc::madvise(page.cast(), size, libc::MADV_DONTNEED) != 0 {
        std::ptr::write_bytes(page, 0, size);
    }
}

#[cfg(not(unix))]
unsafe fn release_pages(page: *mut u8, size: usize) {
    std::ptr::write_bytes(page, 0, size);
}

impl std::fmt::Debug for MemMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MemMap[\"{}\" {:p}-{:p}]",
            self.name,
            self.begin(),
            self.end()
        )
    }
}
