//! TC egress attachment over rtnetlink.
//!
//! Installs a `clsact` qdisc on each interface and hangs the eBPF program off
//! its egress hook as a direct-action filter, messages built by hand on a raw
//! NETLINK_ROUTE socket.

use std::mem;
use std::os::raw::{c_int, c_void};
use std::os::unix::io::RawFd;

use libc::{
    bind, close, nlmsghdr, recv, send, sockaddr_nl, socket, AF_NETLINK, AF_UNSPEC, NETLINK_ROUTE,
    NLMSG_ERROR, NLM_F_ACK, NLM_F_CREATE, NLM_F_REPLACE, NLM_F_REQUEST, RTM_DELQDISC,
    RTM_NEWQDISC, RTM_NEWTFILTER, SOCK_RAW,
};
use thiserror::Error;

// <linux/pkt_sched.h> / <linux/pkt_cls.h>
const TC_H_CLSACT: u32 = 0xffff_fff1;
const TC_H_MIN_EGRESS: u32 = 0x0000_fff3;
const TC_H_MAJ_MASK: u32 = 0xffff_0000;
const TC_H_MIN_MASK: u32 = 0x0000_ffff;

const TCA_KIND: u16 = 1;
const TCA_OPTIONS: u16 = 2;

const TCA_BPF_FD: u16 = 6;
const TCA_BPF_FLAGS: u16 = 8;
const TCA_BPF_FLAG_ACT_DIRECT: u32 = 1;

const ETH_P_ALL: u16 = 0x0003;
const FILTER_PRIO: u32 = 1;

const NLA_F_NESTED: u16 = 0x8000;
const ALIGNTO: usize = 4;

fn tc_h_make(maj: u32, min: u32) -> u32 {
    (maj & TC_H_MAJ_MASK) | (min & TC_H_MIN_MASK)
}

#[derive(Debug, Error)]
pub enum TcError {
    #[error("netlink socket: {0}")]
    Socket(std::io::Error),
    #[error("netlink send: {0}")]
    Send(std::io::Error),
    #[error("netlink recv: {0}")]
    Recv(std::io::Error),
    #[error("truncated netlink response")]
    Truncated,
    #[error("netlink request refused: {0}")]
    Refused(std::io::Error),
}

// struct tcmsg from <linux/rtnetlink.h>.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct Tcmsg {
    tcm_family: u8,
    tcm_pad1: u8,
    tcm_pad2: u16,
    tcm_ifindex: i32,
    tcm_handle: u32,
    tcm_parent: u32,
    tcm_info: u32,
}

fn align(len: usize) -> usize {
    (len + ALIGNTO - 1) & !(ALIGNTO - 1)
}

/// One outgoing rtnetlink message, header patched on `finish`.
struct NlRequest {
    buf: Vec<u8>,
}

impl NlRequest {
    fn new(msg_type: u16, flags: u16, seq: u32) -> NlRequest {
        let hdr = nlmsghdr {
            nlmsg_len: 0,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: seq,
            nlmsg_pid: 0,
        };

        let mut req = NlRequest {
            buf: Vec::with_capacity(256),
        };
        req.push_raw(&hdr);
        req
    }

    fn push_raw<T: Copy>(&mut self, val: &T) {
        let bytes = unsafe {
            std::slice::from_raw_parts(val as *const T as *const u8, mem::size_of::<T>())
        };
        self.buf.extend_from_slice(bytes);
        self.pad();
    }

    fn pad(&mut self) {
        while self.buf.len() % ALIGNTO != 0 {
            self.buf.push(0);
        }
    }

    fn put_tcmsg(&mut self, ifindex: i32, handle: u32, parent: u32, info: u32) {
        let tcm = Tcmsg {
            tcm_family: AF_UNSPEC as u8,
            tcm_ifindex: ifindex,
            tcm_handle: handle,
            tcm_parent: parent,
            tcm_info: info,
            ..Default::default()
        };
        self.push_raw(&tcm);
    }

    fn put_attr(&mut self, kind: u16, payload: &[u8]) {
        let len = (mem::size_of::<u32>() + payload.len()) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.pad();
    }

    fn put_attr_str(&mut self, kind: u16, val: &str) {
        let mut bytes = val.as_bytes().to_vec();
        bytes.push(0);
        self.put_attr(kind, &bytes);
    }

    fn put_attr_u32(&mut self, kind: u16, val: u32) {
        self.put_attr(kind, &val.to_ne_bytes());
    }

    /// Open a nested attribute; returns the offset to pass to `end_nest`.
    fn begin_nest(&mut self, kind: u16) -> usize {
        let offset = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(kind | NLA_F_NESTED).to_ne_bytes());
        offset
    }

    fn end_nest(&mut self, offset: usize) {
        let len = (self.buf.len() - offset) as u16;
        self.buf[offset..offset + 2].copy_from_slice(&len.to_ne_bytes());
    }

    fn finish(&mut self) -> &[u8] {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        &self.buf
    }
}

/// A bound NETLINK_ROUTE socket issuing acknowledged requests.
pub(crate) struct NetlinkSocket {
    fd: RawFd,
    seq: u32,
}

impl NetlinkSocket {
    pub(crate) fn open() -> Result<NetlinkSocket, TcError> {
        let fd = unsafe { socket(AF_NETLINK, SOCK_RAW, NETLINK_ROUTE) };
        if fd < 0 {
            return Err(TcError::Socket(std::io::Error::last_os_error()));
        }

        let mut addr: sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = AF_NETLINK as u16;

        let ret = unsafe {
            bind(
                fd,
                &addr as *const sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { close(fd) };
            return Err(TcError::Socket(err));
        }

        Ok(NetlinkSocket { fd, seq: 1 })
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    /// Send one request and wait for its ack.
    fn request(&mut self, msg: &[u8]) -> Result<(), TcError> {
        let ret = unsafe { send(self.fd, msg.as_ptr() as *const c_void, msg.len(), 0) };
        if ret < 0 {
            return Err(TcError::Send(std::io::Error::last_os_error()));
        }

        let mut buf = [0u8; 4096];
        let got = unsafe { recv(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if got < 0 {
            return Err(TcError::Recv(std::io::Error::last_os_error()));
        }
        if (got as usize) < mem::size_of::<nlmsghdr>() {
            return Err(TcError::Truncated);
        }

        let hdr = unsafe { &*(buf.as_ptr() as *const nlmsghdr) };
        if hdr.nlmsg_type == NLMSG_ERROR as u16 {
            if (got as usize) < mem::size_of::<nlmsghdr>() + mem::size_of::<c_int>() {
                return Err(TcError::Truncated);
            }
            let errcode = unsafe {
                (buf.as_ptr().add(mem::size_of::<nlmsghdr>()) as *const c_int).read_unaligned()
            };
            if errcode != 0 {
                return Err(TcError::Refused(std::io::Error::from_raw_os_error(-errcode)));
            }
        }

        Ok(())
    }

    /// Add (or replace) a clsact qdisc on the interface.
    pub(crate) fn install_clsact(&mut self, ifindex: i32) -> Result<(), TcError> {
        let seq = self.next_seq();
        let mut req = clsact_request(RTM_NEWQDISC, ifindex, seq, true);
        self.request(req.finish())
    }

    /// Attach the eBPF program as a direct-action filter on the egress hook.
    pub(crate) fn attach_egress_bpf(&mut self, ifindex: i32, prog_fd: c_int) -> Result<(), TcError> {
        let seq = self.next_seq();
        let mut req = egress_bpf_request(ifindex, prog_fd, seq);
        self.request(req.finish())
    }

    /// Remove the clsact qdisc, dropping the filters attached to it.
    pub(crate) fn remove_clsact(&mut self, ifindex: i32) -> Result<(), TcError> {
        let seq = self.next_seq();
        let mut req = clsact_request(RTM_DELQDISC, ifindex, seq, false);
        self.request(req.finish())
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        unsafe {
            close(self.fd);
        }
    }
}

fn clsact_request(msg_type: u16, ifindex: i32, seq: u32, create: bool) -> NlRequest {
    let mut flags = (NLM_F_REQUEST | NLM_F_ACK) as u16;
    if create {
        flags |= (NLM_F_CREATE | NLM_F_REPLACE) as u16;
    }

    let mut req = NlRequest::new(msg_type, flags, seq);
    req.put_tcmsg(ifindex, tc_h_make(TC_H_CLSACT, 0), TC_H_CLSACT, 0);
    req.put_attr_str(TCA_KIND, "clsact");
    req
}

fn egress_bpf_request(ifindex: i32, prog_fd: c_int, seq: u32) -> NlRequest {
    let flags = (NLM_F_REQUEST | NLM_F_CREATE | NLM_F_REPLACE | NLM_F_ACK) as u16;
    let info = tc_h_make(FILTER_PRIO << 16, u32::from(ETH_P_ALL.to_be()));

    let mut req = NlRequest::new(RTM_NEWTFILTER, flags, seq);
    req.put_tcmsg(
        ifindex,
        1,
        tc_h_make(TC_H_CLSACT, TC_H_MIN_EGRESS),
        info,
    );
    req.put_attr_str(TCA_KIND, "bpf");
    let nest = req.begin_nest(TCA_OPTIONS);
    req.put_attr_u32(TCA_BPF_FD, prog_fd as u32);
    req.put_attr_u32(TCA_BPF_FLAGS, TCA_BPF_FLAG_ACT_DIRECT);
    req.end_nest(nest);
    req
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(buf: &[u8]) -> nlmsghdr {
        unsafe { (buf.as_ptr() as *const nlmsghdr).read_unaligned() }
    }

    fn tcmsg_of(buf: &[u8]) -> Tcmsg {
        unsafe {
            (buf.as_ptr().add(mem::size_of::<nlmsghdr>()) as *const Tcmsg).read_unaligned()
        }
    }

    #[test]
    fn clsact_add_message_layout() {
        let mut req = clsact_request(RTM_NEWQDISC, 7, 42, true);
        let msg = req.finish().to_vec();

        let hdr = header(&msg);
        assert_eq!(hdr.nlmsg_len as usize, msg.len());
        assert_eq!(hdr.nlmsg_type, RTM_NEWQDISC);
        assert_eq!(hdr.nlmsg_seq, 42);
        assert_ne!(hdr.nlmsg_flags & NLM_F_CREATE as u16, 0);

        let tcm = tcmsg_of(&msg);
        assert_eq!(tcm.tcm_ifindex, 7);
        assert_eq!(tcm.tcm_parent, TC_H_CLSACT);
        assert_eq!(tcm.tcm_handle, 0xffff_0000);

        // First attribute is TCA_KIND "clsact\0".
        let attrs = &msg[mem::size_of::<nlmsghdr>() + align(mem::size_of::<Tcmsg>())..];
        let attr_len = u16::from_ne_bytes([attrs[0], attrs[1]]);
        let attr_kind = u16::from_ne_bytes([attrs[2], attrs[3]]);
        assert_eq!(attr_kind, TCA_KIND);
        assert_eq!(attr_len as usize, 4 + "clsact".len() + 1);
        assert_eq!(&attrs[4..10], b"clsact");
    }

    #[test]
    fn clsact_del_has_no_create_flag() {
        let mut req = clsact_request(RTM_DELQDISC, 3, 1, false);
        let msg = req.finish().to_vec();
        let hdr = header(&msg);

        assert_eq!(hdr.nlmsg_type, RTM_DELQDISC);
        assert_eq!(hdr.nlmsg_flags & NLM_F_CREATE as u16, 0);
    }

    #[test]
    fn egress_filter_targets_clsact_egress() {
        let mut req = egress_bpf_request(9, 33, 5);
        let msg = req.finish().to_vec();

        let hdr = header(&msg);
        assert_eq!(hdr.nlmsg_type, RTM_NEWTFILTER);

        let tcm = tcmsg_of(&msg);
        assert_eq!(tcm.tcm_ifindex, 9);
        assert_eq!(tcm.tcm_parent, 0xffff_fff3);
        assert_eq!(tcm.tcm_handle, 1);
        // prio 1, protocol ETH_P_ALL in network byte order
        assert_eq!(tcm.tcm_info, (1 << 16) | u32::from(ETH_P_ALL.to_be()));

        // The nested TCA_OPTIONS attribute carries the program fd.
        let mut offset = mem::size_of::<nlmsghdr>() + align(mem::size_of::<Tcmsg>());
        // skip TCA_KIND
        let kind_len = u16::from_ne_bytes([msg[offset], msg[offset + 1]]) as usize;
        offset += align(kind_len);

        let opt_kind = u16::from_ne_bytes([msg[offset + 2], msg[offset + 3]]);
        assert_eq!(opt_kind & !NLA_F_NESTED, TCA_OPTIONS);

        let fd_attr = &msg[offset + 4..];
        let fd_kind = u16::from_ne_bytes([fd_attr[2], fd_attr[3]]);
        let fd_val = u32::from_ne_bytes([fd_attr[4], fd_attr[5], fd_attr[6], fd_attr[7]]);
        assert_eq!(fd_kind, TCA_BPF_FD);
        assert_eq!(fd_val, 33);
    }
}
