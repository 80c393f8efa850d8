//
// MAC-swap layer-2 forwarder on top of the xskfwd framework.
//
// With a single interface every packet is reflected back out the way it came;
// with two or more, packets cross between interface pairs (0 <-> 1, 2 <-> 3,
// ...). Source and destination MAC addresses are swapped in place either way.
//
// Make sure all traffic of an interface lands on the queues the workers
// service, e.g. with ethtool -X.
//
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cli_table::{format::Justify, print_stdout, Table, WithTitle};
use rlimit::{setrlimit, Resource};
use structopt::StructOpt;

use xskfwd::{Config, Framework, PacketProcessor, Verdict};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

#[derive(StructOpt, Debug)]
#[structopt(name = "l2fwd")]
struct Opt {
    #[structopt(flatten)]
    config: Config,

    /// Seconds between statistics reports (0 disables them)
    #[structopt(long = "stats-interval", default_value = "1")]
    stats_interval: u64,
}

#[derive(Table, Default)]
struct StatsRow {
    #[table(name = "Worker", justify = "Justify::Right")]
    worker: usize,
    #[table(name = "Interface")]
    iface: String,
    #[table(name = "Rx Packets")]
    rx_npkts: u64,
    #[table(name = "Tx Packets")]
    tx_npkts: u64,
    #[table(name = "Rx Dropped")]
    rx_dropped: u64,
    #[table(name = "Rx Empty Polls")]
    rx_empty_polls: u64,
    #[table(name = "Tx Kicks")]
    tx_kicks: u64,
}

struct MacSwap {
    num_interfaces: usize,
}

impl PacketProcessor for MacSwap {
    fn process(&self, pkt: &mut [u8], ingress: usize) -> Verdict {
        if pkt.len() < 12 {
            return Verdict::Drop;
        }

        // Swap Ethernet source and destination.
        for i in 0..6 {
            pkt.swap(i, i + 6);
        }

        if self.num_interfaces > 1 {
            Verdict::Forward(ingress ^ 1)
        } else {
            Verdict::Forward(ingress)
        }
    }
}

fn print_stats(framework: &Framework<MacSwap>, interfaces: &[String]) {
    let mut rows = Vec::new();

    for worker in 0..framework.num_workers() {
        for (iface_idx, iface) in interfaces.iter().enumerate() {
            match framework.socket_stats(worker, iface_idx) {
                Ok(stats) => rows.push(StatsRow {
                    worker,
                    iface: iface.clone(),
                    rx_npkts: stats.rx_npkts,
                    tx_npkts: stats.tx_npkts,
                    rx_dropped: stats.rx_dropped_npkts,
                    rx_empty_polls: stats.rx_empty_polls,
                    tx_kicks: stats.tx_trigger_sendtos + stats.tx_wakeup_sendtos,
                }),
                Err(err) => log::warn!(
                    "stats for worker {} interface {}: {}",
                    worker,
                    iface,
                    err
                ),
            }
        }
    }

    if let Err(err) = print_stdout(rows.with_title()) {
        log::warn!("printing stats: {}", err);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    setrlimit(Resource::MEMLOCK, rlimit::INFINITY, rlimit::INFINITY)?;

    // An odd interface count above one leaves the last interface unpaired.
    let num_interfaces = opt.config.interfaces.len();
    if num_interfaces > 1 && num_interfaces % 2 != 0 {
        return Err("an even number of interfaces is required for pair forwarding".into());
    }

    let interfaces: Vec<String> = opt
        .config
        .interfaces
        .iter()
        .map(|i| i.name.clone())
        .collect();

    let mut framework = Framework::init(opt.config, MacSwap { num_interfaces })?;
    framework.start_workers()?;

    let handler: extern "C" fn(libc::c_int) = on_sigint;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    log::info!("forwarding on {:?}, ^C to stop", interfaces);

    let interval = Duration::from_secs(opt.stats_interval.max(1));
    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(interval);
        if opt.stats_interval > 0 {
            print_stats(&framework, &interfaces);
        }
    }

    framework.stop_workers();
    framework.cleanup();

    Ok(())
}

fn main() {
    env_logger::init();

    if let Err(err) = run() {
        eprintln!("l2fwd: {}", err);
        exit(1);
    }
}
