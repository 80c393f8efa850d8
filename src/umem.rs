use std::os::raw::c_int;

use libbpf_sys::{
    xsk_ring_cons, xsk_ring_prod, xsk_umem, xsk_umem__create, xsk_umem__delete, xsk_umem_config,
    XDP_UMEM_UNALIGNED_CHUNK_FLAG, XSK_RING_CONS__DEFAULT_NUM_DESCS,
    XSK_RING_PROD__DEFAULT_NUM_DESCS, XSK_UMEM__DEFAULT_FRAME_HEADROOM,
};
use thiserror::Error;

use crate::config::Config;
use crate::frame::FRAMES_PER_SOCKET;
use crate::mmap_area::{MmapArea, MmapAreaOptions, MmapError};

/// One UMEM region shared by all same-mode sockets of a worker.
///
/// The region is partitioned so that the socket of interface `i` owns the
/// frame slots `[i * FRAMES_PER_SOCKET, (i + 1) * FRAMES_PER_SOCKET)`.
/// Zero-copy and copy-mode sockets cannot share a UMEM, so a worker holds up
/// to two of these.
#[derive(Debug)]
pub struct UmemRegion {
    area: MmapArea,
    umem: *mut xsk_umem,
}

unsafe impl Send for UmemRegion {}

#[derive(Debug, Error)]
pub enum UmemError {
    #[error("umem buffer mmap: {0}")]
    Mmap(#[from] MmapError),
    #[error("umem create failed: {0}")]
    Create(std::io::Error),
}

impl UmemRegion {
    /// Map the backing buffer and register it with the kernel. The fill and
    /// completion rings of the first socket sharing this UMEM are set up as
    /// part of registration; later sockets attach their own pairs.
    pub(crate) fn create(
        config: &Config,
        num_interfaces: usize,
        fq: *mut xsk_ring_prod,
        cq: *mut xsk_ring_cons,
    ) -> Result<UmemRegion, UmemError> {
        let size = FRAMES_PER_SOCKET * num_interfaces * config.frame_size as usize;
        let options = MmapAreaOptions {
            huge_tlb: config.unaligned_chunks,
        };
        let area = MmapArea::new(size, options)?;

        // The fill ring is double-sized so a full socket's worth of frames
        // (4096) can sit in it while batches are being recycled.
        let umem_cfg = xsk_umem_config {
            fill_size: XSK_RING_PROD__DEFAULT_NUM_DESCS * 2,
            comp_size: XSK_RING_CONS__DEFAULT_NUM_DESCS,
            frame_size: config.frame_size,
            frame_headroom: XSK_UMEM__DEFAULT_FRAME_HEADROOM,
            flags: if config.unaligned_chunks {
                XDP_UMEM_UNALIGNED_CHUNK_FLAG
            } else {
                0
            },
        };

        let mut umem: *mut xsk_umem = std::ptr::null_mut();

        let ret: c_int;
        unsafe {
            ret = xsk_umem__create(
                &mut umem,
                area.as_ptr(),
                size as u64,
                fq,
                cq,
                &umem_cfg,
            );
        }

        if ret != 0 {
            return Err(UmemError::Create(std::io::Error::from_raw_os_error(-ret)));
        }

        Ok(UmemRegion { area, umem })
    }

    pub(crate) fn umem(&self) -> *mut xsk_umem {
        self.umem
    }

    /// Base of the packet buffer.
    pub(crate) fn buffer(&self) -> *mut u8 {
        self.area.as_ptr() as *mut u8
    }
}

impl Drop for UmemRegion {
    fn drop(&mut self) {
        // The sockets sharing this UMEM are deleted first; the worker stores
        // them in a field declared before its regions.
        unsafe {
            xsk_umem__delete(self.umem);
        }
    }
}
