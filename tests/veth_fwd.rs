//
// End-to-end forwarding over a veth pair.
//
// The test drives a one-worker framework bound to veth-xfwd0 in copy mode
// (veth has no zero-copy support), injects frames through the peer end with a
// raw AF_PACKET socket, and checks the classifier and counters saw them.
//
// It needs root, CAP_NET_ADMIN and an AF_XDP-capable kernel, so it only runs
// when explicitly requested:
//
//   sudo XSKFWD_VETH_TEST=1 cargo test --test veth_fwd
//
// Setup and teardown of the veth pair happen here:
//   ip link add veth-xfwd0 type veth peer name veth-xfwd1
//
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rlimit::{setrlimit, Resource};

use xskfwd::{BindMode, Config, Framework, Interface, PacketProcessor, Verdict, WorkingMode};

const IFACE: &str = "veth-xfwd0";
const PEER: &str = "veth-xfwd1";
const PACKETS: u64 = 1000;

struct CountAndDrop {
    seen: Arc<AtomicU64>,
}

impl PacketProcessor for CountAndDrop {
    fn process(&self, pkt: &mut [u8], _ingress: usize) -> Verdict {
        if pkt.len() >= 14 && pkt[12] == 0x88 && pkt[13] == 0xb5 {
            self.seen.fetch_add(1, Ordering::Relaxed);
        }
        Verdict::Drop
    }
}

fn ip(args: &[&str]) -> bool {
    Command::new("ip")
        .args(args)
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn test_config() -> Config {
    Config {
        interfaces: vec![Interface {
            name: IFACE.to_string(),
            bind: BindMode::Copy,
        }],
        poll: false,
        xdp_skb: true,
        frame_size: 4096,
        unaligned_chunks: false,
        batch_size: 64,
        busy_poll: false,
        working_mode: WorkingMode::AfXdp,
        workers: 1,
        ebpf_file: None,
        xdp_progname: "handle_xdp".to_string(),
        tc_progname: None,
    }
}

fn send_frames(iface: &str, count: u64) {
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW,
            (0x88b5u16.to_be()) as libc::c_int,
        )
    };
    assert!(fd >= 0, "AF_PACKET socket failed");

    let ifindex =
        unsafe { libc::if_nametoindex(std::ffi::CString::new(iface).unwrap().as_ptr()) };
    assert!(ifindex > 0);

    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = 0x88b5u16.to_be();
    addr.sll_ifindex = ifindex as i32;
    addr.sll_halen = 6;

    // Broadcast destination, locally administered source, 0x88b5 ethertype
    // (local experimental), then payload.
    let mut frame = [0u8; 64];
    frame[0..6].copy_from_slice(&[0xff; 6]);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
    frame[12] = 0x88;
    frame[13] = 0xb5;

    for seq in 0..count {
        frame[14..22].copy_from_slice(&seq.to_be_bytes());
        let sent = unsafe {
            libc::sendto(
                fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        assert!(sent >= 0, "sendto failed");
    }

    unsafe { libc::close(fd) };
}

#[test]
fn drop_path_over_veth() {
    if std::env::var("XSKFWD_VETH_TEST").is_err() {
        println!("Test skipped; set XSKFWD_VETH_TEST=1 and run as root to enable");
        return;
    }

    setrlimit(Resource::MEMLOCK, rlimit::INFINITY, rlimit::INFINITY)
        .expect("raising RLIMIT_MEMLOCK requires root");

    // Fresh veth pair; ignore a leftover from an aborted run.
    ip(&["link", "del", IFACE]);
    assert!(
        ip(&["link", "add", IFACE, "type", "veth", "peer", "name", PEER]),
        "creating veth pair"
    );
    assert!(ip(&["link", "set", IFACE, "up"]));
    assert!(ip(&["link", "set", PEER, "up"]));
    assert!(ip(&["link", "set", IFACE, "promisc", "on"]));

    let seen = Arc::new(AtomicU64::new(0));
    let processor = CountAndDrop { seen: seen.clone() };

    let result = (|| -> Result<(), Box<dyn std::error::Error>> {
        let mut framework = Framework::init(test_config(), processor)?;
        framework.start_workers()?;

        // Give the socket a moment to be wired up before injecting.
        std::thread::sleep(Duration::from_millis(200));
        send_frames(PEER, PACKETS);

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::Relaxed) < PACKETS && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }

        let got = seen.load(Ordering::Relaxed);
        let stats = framework.socket_stats(0, 0)?;

        framework.stop_workers();
        framework.cleanup();

        // veth may shed a few frames under load; the bulk must arrive and
        // every received packet was dropped, not transmitted.
        assert!(got > PACKETS / 2, "only {} of {} frames seen", got, PACKETS);
        assert!(stats.rx_npkts >= got);
        assert_eq!(stats.tx_npkts, 0);

        Ok(())
    })();

    ip(&["link", "del", IFACE]);

    result.expect("veth forwarding test failed");
}
