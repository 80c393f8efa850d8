use std::cmp::min;
use std::ffi::CString;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use errno::errno;
use libbpf_sys::{
    _xsk_ring_cons__comp_addr, _xsk_ring_cons__peek, _xsk_ring_cons__release,
    _xsk_ring_cons__rx_desc, _xsk_ring_prod__fill_addr, _xsk_ring_prod__needs_wakeup,
    _xsk_ring_prod__reserve, _xsk_ring_prod__submit, _xsk_ring_prod__tx_desc, xsk_ring_cons,
    xsk_ring_prod, xsk_socket, xsk_socket__create_shared, xsk_socket__delete, xsk_socket__fd,
    xsk_socket_config, XDP_COPY, XSK_LIBBPF_FLAGS__INHIBIT_PROG_LOAD,
    XSK_RING_CONS__DEFAULT_NUM_DESCS, XSK_RING_PROD__DEFAULT_NUM_DESCS,
};
use libc::{
    sendto, setsockopt, EAGAIN, EBUSY, ENETDOWN, ENOBUFS, MSG_DONTWAIT, SOL_SOCKET, SO_BUSY_POLL,
    SO_BUSY_POLL_BUDGET, SO_PREFER_BUSY_POLL,
};
use thiserror::Error;

use crate::config::Config;
use crate::frame::FRAMES_PER_SOCKET;
use crate::stats::SocketCounters;
use crate::umem::{UmemError, UmemRegion};

const BUSY_POLL_USECS: c_int = 20;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("umem setup: {0}")]
    Umem(#[from] UmemError),
    #[error("invalid interface name")]
    InvalidName,
    #[error("socket create failed: {0}")]
    Create(std::io::Error),
    #[error("setting {opt}: {err}")]
    SockOpt { opt: &'static str, err: std::io::Error },
    #[error("fill ring priming reserved {got} of {want} slots")]
    FillPrime { want: usize, got: usize },
}

/// An AF_XDP socket bound to one (interface, queue) pair, together with its
/// four rings. Fill and completion rings are attached per socket even though
/// the UMEM is shared across the worker's sockets.
#[derive(Debug)]
pub struct XskSocket {
    xsk: *mut xsk_socket,
    rx: Box<xsk_ring_cons>,
    tx: Box<xsk_ring_prod>,
    fq: Box<xsk_ring_prod>,
    cq: Box<xsk_ring_cons>,
    fd: RawFd,
    bind_flags: u16,
    buffer: *mut u8,
    pub(crate) outstanding_tx: u32,
    pub(crate) counters: Arc<SocketCounters>,
}

// The raw ring and socket pointers keep XskSocket from being Send by default.
// Each socket is owned and driven by exactly one worker thread after init.
unsafe impl Send for XskSocket {}

impl XskSocket {
    /// Create the socket for `iface` on queue `queue`, lazily creating the
    /// worker's UMEM region of the matching mode on first use, and prime the
    /// fill ring with this socket's whole frame range.
    pub(crate) fn create(
        iface: &str,
        queue: u32,
        config: &Config,
        bind_flags: u16,
        region: &mut Option<UmemRegion>,
        if_idx: usize,
        num_interfaces: usize,
    ) -> Result<XskSocket, SocketError> {
        // Ring structs are heap allocated since the C library stores pointers
        // to them.
        let mut rx: Box<xsk_ring_cons> = Default::default();
        let mut tx: Box<xsk_ring_prod> = Default::default();
        let mut fq: Box<xsk_ring_prod> = Default::default();
        let mut cq: Box<xsk_ring_cons> = Default::default();

        // First socket of this mode in the worker: build the region around
        // our fq/cq pair.
        if region.is_none() {
            *region = Some(UmemRegion::create(
                config,
                num_interfaces,
                fq.as_mut(),
                cq.as_mut(),
            )?);
        }
        let region = region.as_mut().expect("umem region just created");

        let cfg = xsk_socket_config {
            rx_size: XSK_RING_CONS__DEFAULT_NUM_DESCS,
            tx_size: XSK_RING_PROD__DEFAULT_NUM_DESCS,
            xdp_flags: config.xdp_flags(),
            bind_flags,
            libbpf_flags: if config.working_mode.uses_xdp() {
                // The companion XDP program is loaded by the control plane.
                XSK_LIBBPF_FLAGS__INHIBIT_PROG_LOAD
            } else {
                0
            },
        };

        let if_name_c = CString::new(iface).map_err(|_| SocketError::InvalidName)?;

        let mut xsk: *mut xsk_socket = std::ptr::null_mut();
        let ret: c_int;
        unsafe {
            ret = xsk_socket__create_shared(
                &mut xsk,
                if_name_c.as_ptr(),
                queue,
                region.umem(),
                rx.as_mut(),
                tx.as_mut(),
                fq.as_mut(),
                cq.as_mut(),
                &cfg,
            );
        }

        if ret != 0 {
            return Err(SocketError::Create(std::io::Error::from_raw_os_error(-ret)));
        }

        let fd = unsafe { xsk_socket__fd(xsk) };

        let mut socket = XskSocket {
            xsk,
            rx,
            tx,
            fq,
            cq,
            fd,
            bind_flags,
            buffer: region.buffer(),
            outstanding_tx: 0,
            counters: Arc::new(SocketCounters::default()),
        };

        // Busy polling only helps zero-copy sockets; copy mode already pays
        // a syscall per batch for the tx kick.
        if config.busy_poll && !socket.is_copy_mode() {
            socket.set_busy_poll(config.batch_size)?;
        }

        socket.prime_fill_ring(if_idx, config.frame_size)?;

        Ok(socket)
    }

    fn set_busy_poll(&mut self, batch_size: usize) -> Result<(), SocketError> {
        self.set_sockopt("SO_PREFER_BUSY_POLL", SO_PREFER_BUSY_POLL, 1)?;
        self.set_sockopt("SO_BUSY_POLL", SO_BUSY_POLL, BUSY_POLL_USECS)?;
        self.set_sockopt("SO_BUSY_POLL_BUDGET", SO_BUSY_POLL_BUDGET, batch_size as c_int)
    }

    fn set_sockopt(
        &mut self,
        name: &'static str,
        opt: c_int,
        val: c_int,
    ) -> Result<(), SocketError> {
        let ret = unsafe {
            setsockopt(
                self.fd,
                SOL_SOCKET,
                opt,
                &val as *const c_int as *const libc::c_void,
                std::mem::size_of::<c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(SocketError::SockOpt {
                opt: name,
                err: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Hand the socket's whole slot range `[if_idx * 4096, (if_idx+1) * 4096)`
    /// to the driver. A short reservation here can only mean a ring smaller
    /// than the frame count, which is a setup bug.
    fn prime_fill_ring(&mut self, if_idx: usize, frame_size: u32) -> Result<(), SocketError> {
        let umem_offset = if_idx * FRAMES_PER_SOCKET;
        let mut idx: u32 = 0;

        let got = unsafe {
            _xsk_ring_prod__reserve(self.fq.as_mut(), FRAMES_PER_SOCKET as u64, &mut idx) as usize
        };
        if got != FRAMES_PER_SOCKET {
            return Err(SocketError::FillPrime {
                want: FRAMES_PER_SOCKET,
                got,
            });
        }

        for k in 0..FRAMES_PER_SOCKET {
            unsafe {
                *_xsk_ring_prod__fill_addr(self.fq.as_mut(), idx) =
                    ((umem_offset + k) * frame_size as usize) as u64;
            }
            idx += 1;
        }

        unsafe {
            _xsk_ring_prod__submit(self.fq.as_mut(), FRAMES_PER_SOCKET as u64);
        }

        Ok(())
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub(crate) fn is_copy_mode(&self) -> bool {
        self.bind_flags & XDP_COPY as u16 != 0
    }

    /// Base of the UMEM buffer backing this socket.
    #[inline]
    pub(crate) fn buffer(&self) -> *mut u8 {
        self.buffer
    }

    //
    // Rx ring
    //

    #[inline]
    pub(crate) fn rx_peek(&mut self, nb: usize) -> (usize, u32) {
        let mut idx: u32 = 0;
        let rcvd = unsafe { _xsk_ring_cons__peek(self.rx.as_mut(), nb as u64, &mut idx) as usize };
        (rcvd, idx)
    }

    #[inline]
    pub(crate) fn rx_desc(&mut self, idx: u32) -> (u64, u32) {
        unsafe {
            let desc = _xsk_ring_cons__rx_desc(self.rx.as_mut(), idx);
            ((*desc).addr, (*desc).len)
        }
    }

    #[inline]
    pub(crate) fn rx_release(&mut self, nb: usize) {
        unsafe {
            _xsk_ring_cons__release(self.rx.as_mut(), nb as u64);
        }
    }

    //
    // Completion ring
    //

    #[inline]
    pub(crate) fn cq_peek(&mut self, nb: usize) -> (usize, u32) {
        let mut idx: u32 = 0;
        let sent = unsafe { _xsk_ring_cons__peek(self.cq.as_mut(), nb as u64, &mut idx) as usize };
        (sent, idx)
    }

    #[inline]
    pub(crate) fn cq_addr(&mut self, idx: u32) -> u64 {
        unsafe { *_xsk_ring_cons__comp_addr(self.cq.as_mut(), idx) }
    }

    #[inline]
    pub(crate) fn cq_release(&mut self, nb: usize) {
        unsafe {
            _xsk_ring_cons__release(self.cq.as_mut(), nb as u64);
        }
    }

    //
    // Fill ring
    //

    /// Reserve `nb` fill slots. The ring helpers reserve all or nothing.
    #[inline]
    pub(crate) fn fq_reserve(&mut self, nb: usize) -> Option<u32> {
        let mut idx: u32 = 0;
        let got = unsafe { _xsk_ring_prod__reserve(self.fq.as_mut(), nb as u64, &mut idx) as usize };
        if got == nb {
            Some(idx)
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn fq_write(&mut self, idx: u32, addr: u64) {
        unsafe {
            *_xsk_ring_prod__fill_addr(self.fq.as_mut(), idx) = addr;
        }
    }

    #[inline]
    pub(crate) fn fq_submit(&mut self, nb: usize) {
        unsafe {
            _xsk_ring_prod__submit(self.fq.as_mut(), nb as u64);
        }
    }

    #[inline]
    pub(crate) fn fq_needs_wakeup(&mut self) -> bool {
        unsafe { _xsk_ring_prod__needs_wakeup(self.fq.as_mut()) != 0 }
    }

    //
    // Tx ring
    //

    #[inline]
    pub(crate) fn tx_reserve(&mut self, nb: usize) -> Option<u32> {
        let mut idx: u32 = 0;
        let got = unsafe { _xsk_ring_prod__reserve(self.tx.as_mut(), nb as u64, &mut idx) as usize };
        if got == nb {
            Some(idx)
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn tx_write(&mut self, idx: u32, addr: u64, len: u32) {
        unsafe {
            let desc = _xsk_ring_prod__tx_desc(self.tx.as_mut(), idx);
            (*desc).addr = addr;
            (*desc).len = len;
        }
    }

    #[inline]
    pub(crate) fn tx_submit(&mut self, nb: usize) {
        unsafe {
            _xsk_ring_prod__submit(self.tx.as_mut(), nb as u64);
        }
    }

    #[inline]
    pub(crate) fn tx_needs_wakeup(&mut self) -> bool {
        unsafe { _xsk_ring_prod__needs_wakeup(self.tx.as_mut()) != 0 }
    }

    /// Nudge the driver to transmit with a zero-length sendto. ENOBUFS,
    /// EAGAIN, EBUSY and ENETDOWN mean the kernel will pick the work up on a
    /// later kick; anything else is a broken socket.
    #[inline]
    pub(crate) fn kick_tx(&mut self) {
        let ret = unsafe {
            sendto(
                self.fd,
                std::ptr::null(),
                0,
                MSG_DONTWAIT,
                std::ptr::null(),
                0,
            )
        };
        if ret >= 0 {
            return;
        }

        let errno = errno().0;
        match errno {
            ENOBUFS | EAGAIN | EBUSY | ENETDOWN => {}
            _ => panic!("tx kick sendto failed: errno {}", errno),
        }
    }

    /// Nudge the driver to refill rx with a zero-length recvfrom.
    #[inline]
    pub(crate) fn kick_rx(&mut self) {
        unsafe {
            libc::recvfrom(
                self.fd,
                std::ptr::null_mut(),
                0,
                MSG_DONTWAIT,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            );
        }
    }

    /// Completion-ring drain budget for one pass.
    #[inline]
    pub(crate) fn completion_budget(&self, batch_size: usize) -> usize {
        min(self.outstanding_tx as usize, batch_size)
    }
}

impl Drop for XskSocket {
    fn drop(&mut self) {
        unsafe {
            xsk_socket__delete(self.xsk);
        }
    }
}
