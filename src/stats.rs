use std::os::raw::{c_int, c_void};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

// XDP_STATISTICS getsockopt on SOL_XDP (<linux/if_xdp.h>).
const XDP_STATISTICS: c_int = 7;

/// Snapshot of one socket's counters: packet counts and framework syscall
/// counters maintained by the worker, plus the driver-side counters reported
/// through the XDP_STATISTICS socket option.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SocketStats {
    pub rx_npkts: u64,
    pub tx_npkts: u64,

    pub rx_dropped_npkts: u64,
    pub rx_invalid_npkts: u64,
    pub tx_invalid_npkts: u64,
    pub rx_full_npkts: u64,
    pub rx_fill_empty_npkts: u64,
    pub tx_empty_npkts: u64,

    pub rx_empty_polls: u64,
    pub tx_trigger_sendtos: u64,
    pub tx_wakeup_sendtos: u64,
    pub opt_polls: u64,
}

/// Live per-socket counters. Written only by the owning worker (relaxed
/// stores are enough); snapshotted by whichever thread asks for stats.
#[derive(Debug, Default)]
pub(crate) struct SocketCounters {
    pub rx_npkts: AtomicU64,
    pub tx_npkts: AtomicU64,
    pub rx_empty_polls: AtomicU64,
    pub tx_trigger_sendtos: AtomicU64,
    pub tx_wakeup_sendtos: AtomicU64,
    pub opt_polls: AtomicU64,
}

impl SocketCounters {
    pub(crate) fn snapshot(&self) -> SocketStats {
        SocketStats {
            rx_npkts: self.rx_npkts.load(Ordering::Relaxed),
            tx_npkts: self.tx_npkts.load(Ordering::Relaxed),
            rx_empty_polls: self.rx_empty_polls.load(Ordering::Relaxed),
            tx_trigger_sendtos: self.tx_trigger_sendtos.load(Ordering::Relaxed),
            tx_wakeup_sendtos: self.tx_wakeup_sendtos.load(Ordering::Relaxed),
            opt_polls: self.opt_polls.load(Ordering::Relaxed),
            ..Default::default()
        }
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

// struct xdp_statistics from <linux/if_xdp.h>.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct XdpStatistics {
    rx_dropped: u64,
    rx_invalid_descs: u64,
    tx_invalid_descs: u64,
    rx_ring_full: u64,
    rx_fill_ring_empty_descs: u64,
    tx_ring_empty_descs: u64,
}

/// Merge the driver-reported counters for `fd` into `stats`.
pub(crate) fn fill_kernel_stats(fd: RawFd, stats: &mut SocketStats) -> std::io::Result<()> {
    let mut xdp_stats = XdpStatistics::default();
    let mut optlen = std::mem::size_of::<XdpStatistics>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_XDP,
            XDP_STATISTICS,
            &mut xdp_stats as *mut XdpStatistics as *mut c_void,
            &mut optlen,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if optlen as usize != std::mem::size_of::<XdpStatistics>() {
        return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
    }

    stats.rx_dropped_npkts = xdp_stats.rx_dropped;
    stats.rx_invalid_npkts = xdp_stats.rx_invalid_descs;
    stats.tx_invalid_npkts = xdp_stats.tx_invalid_descs;
    stats.rx_full_npkts = xdp_stats.rx_ring_full;
    stats.rx_fill_empty_npkts = xdp_stats.rx_fill_ring_empty_descs;
    stats.tx_empty_npkts = xdp_stats.tx_ring_empty_descs;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_carries_worker_counters() {
        let counters = SocketCounters::default();
        SocketCounters::add(&counters.rx_npkts, 10);
        SocketCounters::add(&counters.rx_npkts, 5);
        SocketCounters::add(&counters.tx_trigger_sendtos, 2);

        let stats = counters.snapshot();
        assert_eq!(stats.rx_npkts, 15);
        assert_eq!(stats.tx_trigger_sendtos, 2);
        // Driver-side counters stay zero until a kernel read fills them in.
        assert_eq!(stats.rx_dropped_npkts, 0);
    }

    #[test]
    fn kernel_read_on_non_xdp_socket_fails_cleanly() {
        // Stats read failures must surface as errors, not panics.
        let mut stats = SocketStats::default();
        assert!(fill_kernel_stats(-1, &mut stats).is_err());
        assert_eq!(stats, SocketStats::default());
    }
}
