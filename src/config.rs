use std::path::PathBuf;
use std::str::FromStr;

use libbpf_sys::{
    XDP_COPY, XDP_FLAGS_DRV_MODE, XDP_FLAGS_SKB_MODE, XDP_FLAGS_UPDATE_IF_NOEXIST,
    XDP_USE_NEED_WAKEUP, XDP_ZEROCOPY,
};
use structopt::StructOpt;
use thiserror::Error;

/// Maximum batch size supported by the run-loop.
pub const MAX_BATCH_SIZE: usize = 511;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one interface is required")]
    NoInterfaces,
    #[error("empty interface name")]
    EmptyInterfaceName,
    #[error("unknown copy mode '{0}' (expected 'c' or 'z')")]
    UnknownCopyMode(String),
    #[error("unknown working mode '{0}' (expected AF_XDP, XDP or COMBINED)")]
    UnknownWorkingMode(String),
    #[error("frame size {0} is not a power of two (required in aligned mode)")]
    FrameSizeNotPowerOfTwo(u32),
    #[error("batch size {0} out of range (1..={})", MAX_BATCH_SIZE)]
    BatchSizeOutOfRange(usize),
    #[error("invalid number of workers {0}")]
    InvalidWorkers(usize),
}

/// Copy-mode requested for one interface on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// No explicit request; the framework picks zero-copy.
    Auto,
    /// Force XDP_COPY.
    Copy,
    /// Force XDP_ZEROCOPY.
    ZeroCopy,
}

/// One interface to bind, as given with `-i name[:c|z]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub bind: BindMode,
}

impl FromStr for Interface {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Interface, ConfigError> {
        let (name, bind) = match s.find(':') {
            Some(pos) => {
                let bind = match &s[pos + 1..] {
                    "c" => BindMode::Copy,
                    "z" => BindMode::ZeroCopy,
                    other => return Err(ConfigError::UnknownCopyMode(other.to_string())),
                };
                (&s[..pos], bind)
            }
            None => (s, BindMode::Auto),
        };

        if name.is_empty() {
            return Err(ConfigError::EmptyInterfaceName);
        }

        Ok(Interface {
            name: name.to_string(),
            bind,
        })
    }
}

/// Where packets are processed: in user space over AF_XDP sockets, entirely in
/// the kernel eBPF program, or both combined with `bpf_redirect_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingMode {
    AfXdp,
    Xdp,
    Combined,
}

impl WorkingMode {
    pub fn uses_af_xdp(self) -> bool {
        matches!(self, WorkingMode::AfXdp | WorkingMode::Combined)
    }

    pub fn uses_xdp(self) -> bool {
        matches!(self, WorkingMode::Xdp | WorkingMode::Combined)
    }
}

impl FromStr for WorkingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<WorkingMode, ConfigError> {
        match s {
            "AF_XDP" => Ok(WorkingMode::AfXdp),
            "XDP" => Ok(WorkingMode::Xdp),
            "COMBINED" => Ok(WorkingMode::Combined),
            other => Err(ConfigError::UnknownWorkingMode(other.to_string())),
        }
    }
}

/// Framework configuration. Immutable once handed to `Framework::init`.
#[derive(StructOpt, Debug, Clone)]
pub struct Config {
    /// Interface to operate on (a copy mode between copy (c) or zero-copy (z)
    /// can optionally be specified after a colon). Can be repeated
    #[structopt(short = "i", long = "iface", required = true, number_of_values = 1)]
    pub interfaces: Vec<Interface>,

    /// Use the poll() syscall between batches
    #[structopt(short = "p", long = "poll")]
    pub poll: bool,

    /// Attach the XDP program in SKB (generic) mode; forces copy mode
    #[structopt(short = "S", long = "xdp-skb")]
    pub xdp_skb: bool,

    /// UMEM frame size (must be a power of two in aligned mode)
    #[structopt(short = "f", long = "frame-size", default_value = "4096")]
    pub frame_size: u32,

    /// Enable unaligned chunk placement (huge-page backed)
    #[structopt(short = "u", long = "unaligned")]
    pub unaligned_chunks: bool,

    /// Batch size for sending or receiving packets
    #[structopt(short = "b", long = "batch-size", default_value = "64")]
    pub batch_size: usize,

    /// Enable socket busy-poll
    #[structopt(short = "B", long = "busy-poll")]
    pub busy_poll: bool,

    /// Working mode (AF_XDP, XDP, COMBINED)
    #[structopt(short = "M", long = "mode", default_value = "AF_XDP")]
    pub working_mode: WorkingMode,

    /// Number of packet processing workers
    #[structopt(short = "w", long = "workers", default_value = "1")]
    pub workers: usize,

    /// eBPF object file to load (defaults to "<argv0>_kern.o")
    #[structopt(long = "ebpf-file", parse(from_os_str))]
    pub ebpf_file: Option<PathBuf>,

    /// Name of the XDP program inside the eBPF object
    #[structopt(long = "xdp-prog", default_value = "handle_xdp")]
    pub xdp_progname: String,

    /// Name of the TC egress program inside the eBPF object
    #[structopt(long = "tc-prog")]
    pub tc_progname: Option<String>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interfaces.is_empty() {
            return Err(ConfigError::NoInterfaces);
        }
        if !self.unaligned_chunks && !self.frame_size.is_power_of_two() {
            return Err(ConfigError::FrameSizeNotPowerOfTwo(self.frame_size));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::BatchSizeOutOfRange(self.batch_size));
        }
        if self.workers < 1 {
            return Err(ConfigError::InvalidWorkers(self.workers));
        }

        Ok(())
    }

    /// Flags for XDP program attachment: driver mode unless SKB mode was
    /// requested.
    pub(crate) fn xdp_flags(&self) -> u32 {
        let mode = if self.xdp_skb {
            XDP_FLAGS_SKB_MODE
        } else {
            XDP_FLAGS_DRV_MODE
        };
        XDP_FLAGS_UPDATE_IF_NOEXIST | mode
    }

    /// Bind flags for the socket of `iface`. SKB mode forces copy for every
    /// socket; with no explicit request zero-copy is forced, since the UMEM
    /// split requires knowing the mode up front.
    pub(crate) fn bind_flags(&self, iface: &Interface) -> u16 {
        let mut flags = XDP_USE_NEED_WAKEUP as u16;

        match iface.bind {
            BindMode::Copy => flags |= XDP_COPY as u16,
            BindMode::ZeroCopy => flags |= XDP_ZEROCOPY as u16,
            BindMode::Auto => {}
        }

        if self.xdp_skb {
            flags &= !(XDP_ZEROCOPY as u16);
            flags |= XDP_COPY as u16;
        }

        if flags & (XDP_COPY | XDP_ZEROCOPY) as u16 == 0 {
            flags |= XDP_ZEROCOPY as u16;
        }

        flags
    }

    /// Path of the eBPF object file; defaults to the binary name with a
    /// `_kern.o` suffix.
    pub fn ebpf_path(&self) -> PathBuf {
        match &self.ebpf_file {
            Some(path) => path.clone(),
            None => {
                let argv0 = std::env::args().next().unwrap_or_else(|| "xskfwd".to_string());
                PathBuf::from(format!("{}_kern.o", argv0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::from_iter(std::iter::once("xskfwd").chain(args.iter().copied()))
    }

    #[test]
    fn iface_suffix_parsing() {
        assert_eq!(
            "eth0".parse::<Interface>().unwrap(),
            Interface {
                name: "eth0".to_string(),
                bind: BindMode::Auto
            }
        );
        assert_eq!("eth0:c".parse::<Interface>().unwrap().bind, BindMode::Copy);
        assert_eq!("eth0:z".parse::<Interface>().unwrap().bind, BindMode::ZeroCopy);
        assert!("eth0:x".parse::<Interface>().is_err());
        assert!(":c".parse::<Interface>().is_err());
    }

    #[test]
    fn defaults() {
        let config = parse(&["-i", "eth0"]);

        assert_eq!(config.interfaces.len(), 1);
        assert_eq!(config.frame_size, 4096);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.workers, 1);
        assert_eq!(config.working_mode, WorkingMode::AfXdp);
        assert!(!config.poll && !config.busy_poll && !config.xdp_skb);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_flag_surface() {
        let config = parse(&[
            "-i", "eth0:z", "-i", "eth1:c", "-p", "-S", "-f", "2048", "-u", "-b", "32", "-B",
            "-M", "COMBINED", "-w", "2",
        ]);

        assert_eq!(config.interfaces.len(), 2);
        assert_eq!(config.interfaces[1].bind, BindMode::Copy);
        assert!(config.poll && config.xdp_skb && config.unaligned_chunks && config.busy_poll);
        assert_eq!(config.frame_size, 2048);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.working_mode, WorkingMode::Combined);
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = parse(&["-i", "eth0", "-f", "4100"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FrameSizeNotPowerOfTwo(4100))
        ));

        // Any frame size goes once unaligned chunks are enabled.
        config.unaligned_chunks = true;
        assert!(config.validate().is_ok());

        let config = parse(&["-i", "eth0", "-b", "512"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BatchSizeOutOfRange(512))
        ));

        let mut config = parse(&["-i", "eth0"]);
        config.interfaces.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoInterfaces)));
    }

    #[test]
    fn bind_flags_resolution() {
        let copy = XDP_COPY as u16;
        let zerocopy = XDP_ZEROCOPY as u16;
        let wakeup = XDP_USE_NEED_WAKEUP as u16;

        let config = parse(&["-i", "eth0", "-i", "eth1:c"]);

        // Unspecified defaults to zero-copy.
        let flags = config.bind_flags(&config.interfaces[0]);
        assert_eq!(flags, wakeup | zerocopy);

        let flags = config.bind_flags(&config.interfaces[1]);
        assert_eq!(flags, wakeup | copy);

        // SKB mode forces copy even when zero-copy was asked for.
        let config = parse(&["-i", "eth0:z", "-S"]);
        let flags = config.bind_flags(&config.interfaces[0]);
        assert_eq!(flags & copy, copy);
        assert_eq!(flags & zerocopy, 0);
    }

    #[test]
    fn xdp_flags_mode() {
        let config = parse(&["-i", "eth0"]);
        assert_eq!(
            config.xdp_flags(),
            XDP_FLAGS_UPDATE_IF_NOEXIST | XDP_FLAGS_DRV_MODE
        );

        let config = parse(&["-i", "eth0", "-S"]);
        assert_eq!(
            config.xdp_flags(),
            XDP_FLAGS_UPDATE_IF_NOEXIST | XDP_FLAGS_SKB_MODE
        );
    }

    #[test]
    fn working_mode_parsing() {
        assert_eq!("AF_XDP".parse::<WorkingMode>().unwrap(), WorkingMode::AfXdp);
        assert_eq!("XDP".parse::<WorkingMode>().unwrap(), WorkingMode::Xdp);
        assert_eq!(
            "COMBINED".parse::<WorkingMode>().unwrap(),
            WorkingMode::Combined
        );
        assert!("af_xdp".parse::<WorkingMode>().is_err());
    }
}
