//! xskfwd is a kernel-bypass packet-processing framework built on AF_XDP.
//!
//! It binds a set of network interfaces to user-space rings, gives every
//! worker thread a shared UMEM frame pool, and runs each received packet
//! through a user-supplied [`PacketProcessor`]. The classifier decides per
//! packet whether to drop it or transmit it out of any configured interface;
//! frames forwarded across interfaces find their way back to the originating
//! fill ring through the owner id encoded in every UMEM address. Working
//! modes optionally load a companion eBPF object and attach it at the XDP
//! hook and the TC egress hook.
//!
//! Typical embedding:
//!
//! ```no_run
//! use xskfwd::{Config, Framework, PacketProcessor, Verdict};
//! use structopt::StructOpt;
//!
//! struct Reflect;
//!
//! impl PacketProcessor for Reflect {
//!     fn process(&self, _pkt: &mut [u8], ingress: usize) -> Verdict {
//!         Verdict::Forward(ingress)
//!     }
//! }
//!
//! let config = Config::from_args();
//! let mut framework = Framework::init(config, Reflect).unwrap();
//! framework.start_workers().unwrap();
//! // ... run until told otherwise ...
//! framework.stop_workers();
//! ```

pub mod config;
pub mod frame;
pub mod framework;
pub mod mmap_area;
pub mod socket;
pub mod stats;
pub mod umem;
pub mod worker;

pub mod bpf;
mod tc;

pub use config::{BindMode, Config, ConfigError, Interface, WorkingMode};
pub use frame::{FrameLayout, FRAMES_PER_SOCKET, FRAMES_PER_SOCKET_SHIFT};
pub use framework::{Framework, FrameworkError};
pub use stats::SocketStats;
pub use tc::TcError;
pub use worker::{PacketProcessor, Verdict};
