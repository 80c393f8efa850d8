//! Per-worker run-loop.
//!
//! Each worker is an OS thread pinned to one CPU, owning one socket per
//! configured interface and driving all four rings of each. Per iteration and
//! per interface the pipeline is: drain completions, receive a batch, classify
//! every packet, recycle drops into the ingress fill ring, and push forwards
//! onto the target tx rings. Completed transmits are routed back to the fill
//! ring of the interface that owns the frame, decoded from the address.

use std::sync::atomic::{AtomicBool, Ordering};

use libc::{nfds_t, poll, pollfd, POLLIN};

use crate::config::Config;
use crate::frame::{self, FrameLayout};
use crate::socket::XskSocket;
use crate::stats::SocketCounters;
use crate::umem::UmemRegion;

pub(crate) const POLL_TIMEOUT_MS: libc::c_int = 1000;

/// What to do with a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Return the frame to the ingress fill ring without transmitting.
    Drop,
    /// Transmit out of the interface with this index.
    Forward(usize),
}

/// User-supplied packet classifier.
///
/// Called from every worker thread concurrently. The packet slice is only
/// valid for the duration of the call; implementations may rewrite the packet
/// in place but must not retain the reference.
pub trait PacketProcessor: Send + Sync + 'static {
    fn process(&self, pkt: &mut [u8], ingress: usize) -> Verdict;
}

/// A packet queued for transmission, by original descriptor address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TxFrame {
    pub addr: u64,
    pub len: u32,
}

/// Reusable per-worker routing buffers, bounded by batch size and interface
/// count.
#[derive(Debug)]
pub(crate) struct Scratch {
    to_drop: Vec<u64>,
    to_tx: Vec<Vec<TxFrame>>,
    to_fill: Vec<Vec<u64>>,
}

impl Scratch {
    pub(crate) fn new(num_interfaces: usize, batch_size: usize) -> Scratch {
        Scratch {
            to_drop: Vec::with_capacity(batch_size),
            to_tx: (0..num_interfaces)
                .map(|_| Vec::with_capacity(batch_size))
                .collect(),
            to_fill: (0..num_interfaces)
                .map(|_| Vec::with_capacity(batch_size))
                .collect(),
        }
    }
}

/// Loop parameters shared by every phase; a plain copy of the relevant config
/// fields so the hot path never chases the full Config.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunFlags {
    pub poll: bool,
    pub busy_poll: bool,
    pub batch_size: usize,
    pub num_interfaces: usize,
}

impl RunFlags {
    pub(crate) fn from_config(config: &Config) -> RunFlags {
        RunFlags {
            poll: config.poll,
            busy_poll: config.busy_poll,
            batch_size: config.batch_size,
            num_interfaces: config.interfaces.len(),
        }
    }
}

/// One packet-processing worker: a socket per interface plus the UMEM
/// region(s) they share. Only the owning thread touches any of this while the
/// worker runs.
#[derive(Debug)]
pub(crate) struct Worker {
    pub(crate) id: usize,
    // Declared before the regions so sockets are deleted first on drop.
    pub(crate) sockets: Vec<XskSocket>,
    pub(crate) umem: Option<UmemRegion>,
    pub(crate) copy_umem: Option<UmemRegion>,
    pub(crate) layout: FrameLayout,
    pub(crate) flags: RunFlags,
    pub(crate) scratch: Scratch,
}

/// Sort a received packet into the drop or per-target tx buckets, preserving
/// the original descriptor address. A forward target outside the configured
/// interfaces is a classifier contract violation.
#[inline]
pub(crate) fn route(
    verdict: Verdict,
    num_interfaces: usize,
    addr: u64,
    len: u32,
    to_drop: &mut Vec<u64>,
    to_tx: &mut [Vec<TxFrame>],
) {
    match verdict {
        Verdict::Drop => to_drop.push(addr),
        Verdict::Forward(target) => {
            if target >= num_interfaces {
                panic!(
                    "classifier returned interface {} but only {} are configured",
                    target, num_interfaces
                );
            }
            to_tx[target].push(TxFrame { addr, len });
        }
    }
}

/// Drain up to a batch of completed transmits on socket `i` and return every
/// frame to the fill ring of its owning interface.
pub(crate) fn complete_tx(
    sockets: &mut [XskSocket],
    i: usize,
    layout: FrameLayout,
    scratch: &mut Scratch,
    flags: &RunFlags,
) {
    if sockets[i].outstanding_tx == 0 {
        return;
    }

    // Tx must be manually triggered for copy-mode sockets, and when busy
    // polling is disabled and the tx ring asks for a wakeup.
    if sockets[i].is_copy_mode()
        || (!flags.poll && !flags.busy_poll && sockets[i].tx_needs_wakeup())
    {
        SocketCounters::add(&sockets[i].counters.tx_trigger_sendtos, 1);
        sockets[i].kick_tx();
    }

    let budget = sockets[i].completion_budget(flags.batch_size);
    let (sent, mut idx) = sockets[i].cq_peek(budget);
    if sent == 0 {
        return;
    }

    // Map every frame to its owner.
    for _ in 0..sent {
        let addr = sockets[i].cq_addr(idx);
        idx += 1;

        let owner = layout.owner(addr);
        if owner >= flags.num_interfaces {
            panic!(
                "completion address {:#x} decodes to interface {} of {}",
                addr, owner, flags.num_interfaces
            );
        }
        scratch.to_fill[owner].push(addr);
    }

    sockets[i].cq_release(sent);
    SocketCounters::add(&sockets[i].counters.tx_npkts, sent as u64);

    // Put the frames back in their owner's fill ring.
    for owner in 0..flags.num_interfaces {
        if scratch.to_fill[owner].is_empty() {
            continue;
        }

        let n = scratch.to_fill[owner].len();
        let mut idx = match sockets[owner].fq_reserve(n) {
            Some(idx) => idx,
            // Cannot happen: the fill ring holds 2x the default descriptor
            // count and n is bounded by the batch size.
            None => panic!("fill ring reservation fell short on interface {}", owner),
        };

        for &addr in &scratch.to_fill[owner] {
            sockets[owner].fq_write(idx, addr);
            idx += 1;
        }
        sockets[owner].fq_submit(n);
        scratch.to_fill[owner].clear();
    }

    sockets[i].outstanding_tx -= sent as u32;
}

/// Receive, classify and redispatch one batch on interface `i`.
pub(crate) fn process_batch<P: PacketProcessor>(
    sockets: &mut [XskSocket],
    i: usize,
    layout: FrameLayout,
    scratch: &mut Scratch,
    flags: &RunFlags,
    processor: &P,
) {
    complete_tx(sockets, i, layout, scratch, flags);

    let (rcvd, mut idx) = sockets[i].rx_peek(flags.batch_size);
    if rcvd == 0 {
        if !sockets[i].is_copy_mode() && (flags.busy_poll || sockets[i].fq_needs_wakeup()) {
            SocketCounters::add(&sockets[i].counters.rx_empty_polls, 1);
            sockets[i].kick_rx();
        }
        return;
    }

    let src_base = sockets[i].buffer();

    for _ in 0..rcvd {
        let (orig, len) = sockets[i].rx_desc(idx);
        idx += 1;

        // The descriptor address is preserved end to end; only the data
        // pointer has the in-frame offset applied.
        let data = frame::add_offset_to_addr(orig);
        let pkt = unsafe { std::slice::from_raw_parts_mut(src_base.add(data as usize), len as usize) };

        let verdict = processor.process(pkt, i);
        route(
            verdict,
            flags.num_interfaces,
            orig,
            len,
            &mut scratch.to_drop,
            &mut scratch.to_tx,
        );
    }

    sockets[i].rx_release(rcvd);
    SocketCounters::add(&sockets[i].counters.rx_npkts, rcvd as u64);

    // Dropped frames go straight back to the receiving interface's fill ring.
    if !scratch.to_drop.is_empty() {
        let n = scratch.to_drop.len();
        let mut fq_idx = match sockets[i].fq_reserve(n) {
            Some(idx) => idx,
            None => panic!("fill ring reservation fell short on interface {}", i),
        };

        for &addr in &scratch.to_drop {
            sockets[i].fq_write(fq_idx, addr);
            fq_idx += 1;
        }
        sockets[i].fq_submit(n);
        scratch.to_drop.clear();
    }

    // Forwarded frames go to the tx ring of the target interface.
    for target in 0..flags.num_interfaces {
        if scratch.to_tx[target].is_empty() {
            continue;
        }

        let n = scratch.to_tx[target].len();
        let mut tx_idx = loop {
            if let Some(idx) = sockets[target].tx_reserve(n) {
                break idx;
            }
            // No space: recycle completions on the target and keep kicking
            // until the ring drains.
            complete_tx(sockets, target, layout, scratch, flags);
            if flags.busy_poll || sockets[target].tx_needs_wakeup() {
                SocketCounters::add(&sockets[target].counters.tx_wakeup_sendtos, 1);
                sockets[target].kick_tx();
            }
        };

        let dst_base = sockets[target].buffer();
        if src_base != dst_base {
            // Copy-mode and zero-copy sockets live in different UMEM regions;
            // move the payload to the same offset in the target region.
            for f in &scratch.to_tx[target] {
                let data = frame::add_offset_to_addr(f.addr) as usize;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src_base.add(data),
                        dst_base.add(data),
                        f.len as usize,
                    );
                }
            }
        }
        for f in &scratch.to_tx[target] {
            sockets[target].tx_write(tx_idx, f.addr, f.len);
            tx_idx += 1;
        }

        sockets[target].tx_submit(n);
        sockets[target].outstanding_tx += n as u32;
        scratch.to_tx[target].clear();
    }
}

/// Single-interface completion drain: every completed frame belongs to this
/// socket, so the owner decode is skipped and frames go straight from the
/// completion ring to the fill ring.
pub(crate) fn complete_tx_1if(socket: &mut XskSocket, flags: &RunFlags) {
    if socket.outstanding_tx == 0 {
        return;
    }

    if socket.is_copy_mode() || (!flags.poll && !flags.busy_poll && socket.tx_needs_wakeup()) {
        SocketCounters::add(&socket.counters.tx_trigger_sendtos, 1);
        socket.kick_tx();
    }

    let budget = socket.completion_budget(flags.batch_size);
    let (sent, mut cq_idx) = socket.cq_peek(budget);
    if sent == 0 {
        return;
    }

    let mut fq_idx = match socket.fq_reserve(sent) {
        Some(idx) => idx,
        None => panic!("fill ring reservation fell short"),
    };

    for _ in 0..sent {
        let addr = socket.cq_addr(cq_idx);
        cq_idx += 1;
        socket.fq_write(fq_idx, addr);
        fq_idx += 1;
    }

    socket.fq_submit(sent);
    socket.cq_release(sent);
    SocketCounters::add(&socket.counters.tx_npkts, sent as u64);
    socket.outstanding_tx -= sent as u32;
}

/// Single-interface fast path: no owner decoding and no cross-region copies.
pub(crate) fn process_batch_1if<P: PacketProcessor>(
    socket: &mut XskSocket,
    scratch: &mut Scratch,
    flags: &RunFlags,
    processor: &P,
) {
    complete_tx_1if(socket, flags);

    let (rcvd, mut idx) = socket.rx_peek(flags.batch_size);
    if rcvd == 0 {
        if !socket.is_copy_mode() && (flags.busy_poll || socket.fq_needs_wakeup()) {
            SocketCounters::add(&socket.counters.rx_empty_polls, 1);
            socket.kick_rx();
        }
        return;
    }

    let base = socket.buffer();

    for _ in 0..rcvd {
        let (orig, len) = socket.rx_desc(idx);
        idx += 1;

        let data = frame::add_offset_to_addr(orig);
        let pkt = unsafe { std::slice::from_raw_parts_mut(base.add(data as usize), len as usize) };

        let verdict = processor.process(pkt, 0);
        route(
            verdict,
            flags.num_interfaces,
            orig,
            len,
            &mut scratch.to_drop,
            &mut scratch.to_tx,
        );
    }

    socket.rx_release(rcvd);
    SocketCounters::add(&socket.counters.rx_npkts, rcvd as u64);

    if !scratch.to_drop.is_empty() {
        let n = scratch.to_drop.len();
        let mut fq_idx = match socket.fq_reserve(n) {
            Some(idx) => idx,
            None => panic!("fill ring reservation fell short"),
        };

        for &addr in &scratch.to_drop {
            socket.fq_write(fq_idx, addr);
            fq_idx += 1;
        }
        socket.fq_submit(n);
        scratch.to_drop.clear();
    }

    if !scratch.to_tx[0].is_empty() {
        let n = scratch.to_tx[0].len();
        let mut tx_idx = loop {
            if let Some(idx) = socket.tx_reserve(n) {
                break idx;
            }
            complete_tx_1if(socket, flags);
            if flags.busy_poll || socket.tx_needs_wakeup() {
                SocketCounters::add(&socket.counters.tx_wakeup_sendtos, 1);
                socket.kick_tx();
            }
        };

        for f in &scratch.to_tx[0] {
            socket.tx_write(tx_idx, f.addr, f.len);
            tx_idx += 1;
        }

        socket.tx_submit(n);
        socket.outstanding_tx += n as u32;
        scratch.to_tx[0].clear();
    }
}

/// Main worker dispatch, running until the stop flag is raised. Checked once
/// per iteration; with poll mode enabled the response to a stop request can
/// lag by up to the poll timeout.
pub(crate) fn worker_loop<P: PacketProcessor>(
    worker: &mut Worker,
    stop: &AtomicBool,
    processor: &P,
) {
    let Worker {
        sockets,
        layout,
        flags,
        scratch,
        ..
    } = worker;

    let num_sockets = sockets.len();
    let mut fds: Vec<pollfd> = sockets
        .iter()
        .map(|s| pollfd {
            fd: s.fd(),
            events: POLLIN,
            revents: 0,
        })
        .collect();

    while !stop.load(Ordering::Relaxed) {
        if flags.poll {
            for socket in sockets.iter() {
                SocketCounters::add(&socket.counters.opt_polls, 1);
            }
            let ret = unsafe { poll(fds.as_mut_ptr(), num_sockets as nfds_t, POLL_TIMEOUT_MS) };
            if ret <= 0 {
                continue;
            }
        }

        if num_sockets > 1 {
            for i in 0..num_sockets {
                process_batch(sockets, i, *layout, scratch, flags, processor);
            }
        } else {
            process_batch_1if(&mut sockets[0], scratch, flags, processor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameLayout, FRAMES_PER_SOCKET};

    #[test]
    fn route_buckets_drops_and_forwards() {
        let mut to_drop = Vec::new();
        let mut to_tx = vec![Vec::new(), Vec::new()];

        // Drop keeps the exact original address, offset bits included.
        let addr = (3 << 12) | 256;
        route(Verdict::Drop, 2, addr, 64, &mut to_drop, &mut to_tx);
        assert_eq!(to_drop, vec![addr]);

        route(Verdict::Forward(1), 2, 0x2000, 128, &mut to_drop, &mut to_tx);
        assert!(to_tx[0].is_empty());
        assert_eq!(
            to_tx[1],
            vec![TxFrame {
                addr: 0x2000,
                len: 128
            }]
        );
    }

    #[test]
    #[should_panic(expected = "classifier returned interface")]
    fn route_rejects_out_of_range_target() {
        let mut to_drop = Vec::new();
        let mut to_tx = vec![Vec::new(), Vec::new()];
        route(Verdict::Forward(2), 2, 0, 64, &mut to_drop, &mut to_tx);
    }

    #[test]
    fn completion_owner_bucketing() {
        // The owner decoded from a completion address picks the fill ring the
        // frame returns to, regardless of which socket completed it.
        let layout = FrameLayout::new(2048);
        let mut buckets = vec![Vec::new(), Vec::new(), Vec::new()];

        let addrs = [
            layout.encode(0, 1, 0),
            layout.encode(2, 7, 0),
            layout.encode(0, FRAMES_PER_SOCKET as u64 - 1, 12),
            layout.encode(1, 0, 0),
        ];
        for &addr in &addrs {
            buckets[layout.owner(addr)].push(addr);
        }

        assert_eq!(buckets[0].len(), 2);
        assert_eq!(buckets[1], vec![layout.encode(1, 0, 0)]);
        assert_eq!(buckets[2], vec![layout.encode(2, 7, 0)]);
    }

    #[test]
    fn scratch_buckets_match_interface_count() {
        let scratch = Scratch::new(3, 64);
        assert_eq!(scratch.to_tx.len(), 3);
        assert_eq!(scratch.to_fill.len(), 3);
        assert!(scratch.to_drop.capacity() >= 64);
    }
}
