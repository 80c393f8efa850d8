use std::os::raw::{c_int, c_void};

use errno::errno;
use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_HUGETLB, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use thiserror::Error;

/// An anonymous memory mapping backing one UMEM region. Packets move between
/// the kernel and userspace through this area; frames are referred to by byte
/// offset into it.
#[derive(Debug)]
pub struct MmapArea {
    len: usize,
    ptr: *mut c_void,
}

// MmapArea is not Send/Sync by default because of the raw pointer, which the
// Rustonomicon describes as a lint rather than a real constraint. The fields
// are private and never change after creation, and the worker that owns the
// region is the only writer of its frames.
unsafe impl Send for MmapArea {}
unsafe impl Sync for MmapArea {}

#[derive(Debug, Error)]
pub enum MmapError {
    #[error("mmap failed: {0}")]
    Failed(std::io::Error),
}

/// Configuration options for MmapArea
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapAreaOptions {
    /// If set to true, the mmap call is passed MAP_HUGETLB
    pub huge_tlb: bool,
}

impl MmapArea {
    /// Map `len` bytes of anonymous memory.
    pub fn new(len: usize, options: MmapAreaOptions) -> Result<MmapArea, MmapError> {
        let mut flags: c_int = MAP_PRIVATE | MAP_ANONYMOUS;

        if options.huge_tlb {
            flags |= MAP_HUGETLB;
        }

        let ptr: *mut c_void;
        unsafe {
            ptr = mmap(std::ptr::null_mut(), len, PROT_READ | PROT_WRITE, flags, -1, 0);
        }

        if ptr == MAP_FAILED {
            return Err(MmapError::Failed(std::io::Error::from_raw_os_error(
                errno().0,
            )));
        }

        Ok(MmapArea { len, ptr })
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MmapArea {
    fn drop(&mut self) {
        let r: c_int;

        // Nothing to unmap if the original map failed
        if self.ptr == MAP_FAILED {
            return;
        }

        unsafe {
            r = munmap(self.ptr, self.len);
        }

        if r != 0 {
            log::error!("munmap failed errno: {}", errno().0);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::{MmapArea, MmapAreaOptions};

    #[test]
    fn frame_writes_are_visible() {
        const FRAME_SIZE: usize = 2048;
        const FRAMES: usize = 64;

        let area = MmapArea::new(FRAMES * FRAME_SIZE, MmapAreaOptions::default()).unwrap();
        assert_eq!(area.len(), FRAMES * FRAME_SIZE);

        // Stamp the first bytes of every frame and read them back.
        let base: u64 = rand::thread_rng().gen();
        let buffer = area.as_ptr() as *mut u8;

        for i in 0..FRAMES {
            let val = base.wrapping_add(i as u64);
            unsafe {
                (buffer.add(i * FRAME_SIZE) as *mut u64).write_unaligned(val);
            }
        }

        for i in 0..FRAMES {
            let expect = base.wrapping_add(i as u64);
            let got =
                unsafe { (buffer.add(i * FRAME_SIZE) as *const u64).read_unaligned() };
            assert_eq!(got, expect);
        }
    }

    #[test]
    fn zero_initialized() {
        let area = MmapArea::new(4096, MmapAreaOptions::default()).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(area.as_ptr() as *const u8, 4096) };
        assert!(bytes.iter().all(|b| *b == 0));
    }
}
