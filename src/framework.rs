//! One-shot init and teardown, worker lifecycle, and stats access.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;

use crate::bpf::{self, BpfError, BpfHandle};
use crate::config::{Config, ConfigError};
use crate::frame::FrameLayout;
use crate::socket::{SocketError, XskSocket};
use crate::stats::{self, SocketCounters, SocketStats};
use crate::tc::{NetlinkSocket, TcError};
use crate::worker::{worker_loop, PacketProcessor, RunFlags, Scratch, Worker};

#[derive(Debug, Error)]
pub enum FrameworkError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("interface \"{0}\" does not exist")]
    UnknownInterface(String),
    #[error("socket setup on {iface} (worker {worker}): {err}")]
    Socket {
        iface: String,
        worker: usize,
        err: SocketError,
    },
    #[error("eBPF: {0}")]
    Bpf(#[from] BpfError),
    #[error("tc egress setup: {0}")]
    Tc(#[from] TcError),
    #[error("could not enumerate CPUs")]
    CpuEnumeration,
    #[error("not enough CPUs to host all workers ({workers} workers, {cpus} CPUs)")]
    NotEnoughCpus { workers: usize, cpus: usize },
    #[error("spawning worker thread: {0}")]
    Spawn(std::io::Error),
    #[error("no such socket (worker {0}, interface {1})")]
    NoSuchSocket(usize, usize),
    #[error("reading XDP statistics: {0}")]
    Stats(std::io::Error),
}

/// The assembled framework: workers, their sockets, and the kernel-side
/// attachments. Everything is created by `init` and torn down in reverse by
/// `cleanup` (or drop).
pub struct Framework<P: PacketProcessor> {
    config: Config,
    ifindexes: Vec<u32>,
    workers: Vec<Worker>,
    threads: Vec<JoinHandle<Worker>>,
    // (fd, counters) per worker per interface, kept aside so stats stay
    // readable while the workers own their sockets.
    stats_handles: Vec<Vec<(RawFd, Arc<SocketCounters>)>>,
    stop: Arc<AtomicBool>,
    processor: Arc<P>,
    bpf: Option<BpfHandle>,
    tc_installed: bool,
    cleaned_up: bool,
}

impl<P: PacketProcessor> Framework<P> {
    /// Build every worker's UMEM region(s) and sockets, load and attach the
    /// eBPF programs when the working mode asks for them, and leave the
    /// system one `start_workers` call away from forwarding.
    pub fn init(config: Config, processor: P) -> Result<Framework<P>, FrameworkError> {
        config.validate()?;

        let mut ifindexes = Vec::with_capacity(config.interfaces.len());
        for iface in &config.interfaces {
            ifindexes.push(resolve_ifindex(&iface.name)?);
        }

        let layout = FrameLayout::new(config.frame_size);
        let num_interfaces = config.interfaces.len();

        let mut workers = Vec::new();
        if config.working_mode.uses_af_xdp() {
            for worker_id in 0..config.workers {
                let mut umem = None;
                let mut copy_umem = None;
                let mut sockets = Vec::with_capacity(num_interfaces);

                for (if_idx, iface) in config.interfaces.iter().enumerate() {
                    let bind_flags = config.bind_flags(iface);
                    let socket = XskSocket::create(
                        &iface.name,
                        worker_id as u32,
                        &config,
                        bind_flags,
                        if bind_flags & libbpf_sys::XDP_COPY as u16 != 0 {
                            &mut copy_umem
                        } else {
                            &mut umem
                        },
                        if_idx,
                        num_interfaces,
                    )
                    .map_err(|err| FrameworkError::Socket {
                        iface: iface.name.clone(),
                        worker: worker_id,
                        err,
                    })?;
                    sockets.push(socket);
                }

                workers.push(Worker {
                    id: worker_id,
                    sockets,
                    umem,
                    copy_umem,
                    layout,
                    flags: RunFlags::from_config(&config),
                    scratch: Scratch::new(num_interfaces, config.batch_size),
                });
            }
        }

        let stats_handles = workers
            .iter()
            .map(|w| {
                w.sockets
                    .iter()
                    .map(|s| (s.fd(), s.counters.clone()))
                    .collect()
            })
            .collect();

        let mut framework = Framework {
            config,
            ifindexes,
            workers,
            threads: Vec::new(),
            stats_handles,
            stop: Arc::new(AtomicBool::new(false)),
            processor: Arc::new(processor),
            bpf: None,
            tc_installed: false,
            cleaned_up: false,
        };

        if framework.config.working_mode.uses_xdp() {
            if let Err(err) = framework.setup_ebpf() {
                framework.cleanup();
                return Err(err);
            }
        }

        Ok(framework)
    }

    fn setup_ebpf(&mut self) -> Result<(), FrameworkError> {
        log::info!("loading eBPF programs from {:?}", self.config.ebpf_path());

        let handle = BpfHandle::load(
            &self.config.ebpf_path(),
            &self.config.xdp_progname,
            self.config.tc_progname.as_deref(),
        )?;

        for &ifindex in &self.ifindexes {
            bpf::attach_xdp(ifindex, handle.xdp_prog_fd(), self.config.xdp_flags())?;
        }

        if let Some(tc_fd) = handle.tc_prog_fd() {
            let mut nl = NetlinkSocket::open()?;
            for &ifindex in &self.ifindexes {
                nl.install_clsact(ifindex as i32)?;
                self.tc_installed = true;
                nl.attach_egress_bpf(ifindex as i32, tc_fd)?;
            }
        }

        self.bpf = Some(handle);

        if self.config.working_mode.uses_af_xdp() {
            self.populate_xsks_map()?;
        }

        Ok(())
    }

    /// Hand the socket fds to the XDP program through the `xsks` map so it
    /// can `bpf_redirect_map` into AF_XDP. Keyed by worker index.
    fn populate_xsks_map(&mut self) -> Result<(), FrameworkError> {
        let handle = match &self.bpf {
            Some(h) => h,
            None => return Ok(()),
        };

        if handle.map_fd("xsks").is_err() {
            log::warn!("no xsks map found in eBPF object");
            return Ok(());
        }

        // TODO: key by (worker, interface) so multi-interface workers get all
        // of their sockets into the map instead of the last one.
        for (if_idx, _) in self.config.interfaces.iter().enumerate() {
            for (worker_idx, worker) in self.workers.iter().enumerate() {
                let fd = worker.sockets[if_idx].fd();
                handle.update_map("xsks", worker_idx as u32, fd)?;
            }
        }

        Ok(())
    }

    /// Loaded eBPF object, for populating host-owned maps. None in pure
    /// AF_XDP mode.
    pub fn bpf(&self) -> Option<&BpfHandle> {
        self.bpf.as_ref()
    }

    /// Spawn the worker threads, pinning worker k to the k-th CPU of the
    /// process affinity mask. Steering the NIC queue interrupts to the same
    /// CPUs is the user's responsibility (queue N -> Nth CPU -> worker N).
    pub fn start_workers(&mut self) -> Result<(), FrameworkError> {
        if !self.config.working_mode.uses_af_xdp() {
            return Ok(());
        }

        let core_ids = core_affinity::get_core_ids().ok_or(FrameworkError::CpuEnumeration)?;
        if core_ids.len() < self.config.workers {
            return Err(FrameworkError::NotEnoughCpus {
                workers: self.config.workers,
                cpus: core_ids.len(),
            });
        }

        self.stop.store(false, Ordering::Relaxed);

        for (k, mut worker) in self.workers.drain(..).enumerate() {
            let core = core_ids[k];
            let stop = self.stop.clone();
            let processor = self.processor.clone();

            let handle = std::thread::Builder::new()
                .name(format!("xskfwd-worker-{}", k))
                .spawn(move || {
                    core_affinity::set_for_current(core);
                    worker_loop(&mut worker, &stop, &*processor);
                    worker
                })
                .map_err(FrameworkError::Spawn)?;

            self.threads.push(handle);
        }

        Ok(())
    }

    /// Raise the stop flag and join every worker, taking their sockets and
    /// regions back for teardown.
    pub fn stop_workers(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        for handle in self.threads.drain(..) {
            match handle.join() {
                Ok(worker) => self.workers.push(worker),
                Err(_) => log::error!("worker thread panicked"),
            }
        }
    }

    /// Snapshot of the counters of one socket, merged with the
    /// driver-reported XDP statistics.
    pub fn socket_stats(
        &self,
        worker_idx: usize,
        iface_idx: usize,
    ) -> Result<SocketStats, FrameworkError> {
        let (fd, counters) = self
            .stats_handles
            .get(worker_idx)
            .and_then(|w| w.get(iface_idx))
            .ok_or(FrameworkError::NoSuchSocket(worker_idx, iface_idx))?;

        let mut snapshot = counters.snapshot();
        stats::fill_kernel_stats(*fd, &mut snapshot).map_err(FrameworkError::Stats)?;

        Ok(snapshot)
    }

    pub fn num_interfaces(&self) -> usize {
        self.config.interfaces.len()
    }

    pub fn num_workers(&self) -> usize {
        self.config.workers
    }

    /// Tear everything down in reverse creation order: workers, sockets and
    /// UMEM regions, then the XDP programs and clsact qdiscs. Idempotent and
    /// safe to call from error paths.
    pub fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        self.stop_workers();
        self.workers.clear();
        self.stats_handles.clear();

        if self.config.working_mode.uses_af_xdp() || self.bpf.is_some() {
            for &ifindex in &self.ifindexes {
                bpf::detach_xdp(ifindex, self.config.xdp_flags());
            }
        }

        if self.tc_installed {
            match NetlinkSocket::open() {
                Ok(mut nl) => {
                    for &ifindex in &self.ifindexes {
                        if let Err(err) = nl.remove_clsact(ifindex as i32) {
                            log::warn!("removing clsact qdisc on ifindex {}: {}", ifindex, err);
                        }
                    }
                }
                Err(err) => log::warn!("netlink socket for qdisc removal: {}", err),
            }
            self.tc_installed = false;
        }

        self.bpf = None;
    }
}

impl<P: PacketProcessor> Drop for Framework<P> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn resolve_ifindex(name: &str) -> Result<u32, FrameworkError> {
    let c_name =
        CString::new(name).map_err(|_| FrameworkError::UnknownInterface(name.to_string()))?;
    let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if ifindex == 0 {
        return Err(FrameworkError::UnknownInterface(name.to_string()));
    }
    Ok(ifindex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_is_rejected() {
        assert!(matches!(
            resolve_ifindex("definitely-not-a-real-interface"),
            Err(FrameworkError::UnknownInterface(_))
        ));
    }

    #[test]
    fn loopback_resolves() {
        assert!(resolve_ifindex("lo").unwrap() > 0);
    }
}
