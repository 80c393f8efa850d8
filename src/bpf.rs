use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use libbpf_sys::{
    bpf_map__fd, bpf_map_update_elem, bpf_object, bpf_object__close, bpf_object__find_map_by_name,
    bpf_object__find_program_by_name, bpf_object__load, bpf_object__open_file, bpf_program__fd,
    bpf_program__next, bpf_program__set_type, bpf_set_link_xdp_fd, libbpf_get_error,
    BPF_PROG_TYPE_XDP,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BpfError {
    #[error("invalid eBPF object path")]
    InvalidPath,
    #[error("unable to parse eBPF object file: {0}")]
    Open(std::io::Error),
    #[error("no '{0}' program found in eBPF object")]
    NoSuchProgram(String),
    #[error("unable to load eBPF object: {0}")]
    Load(std::io::Error),
    #[error("no '{0}' map found in eBPF object")]
    NoSuchMap(String),
    #[error("updating map '{map}' key {key}: {err}")]
    MapUpdate {
        map: String,
        key: u32,
        err: std::io::Error,
    },
    #[error("attaching XDP program to ifindex {ifindex}: {err}")]
    Attach { ifindex: u32, err: std::io::Error },
}

/// A loaded eBPF object with its XDP program and (optionally) a TC egress
/// program resolved. Exposed to the embedding application so it can populate
/// its own maps before the workers start.
#[derive(Debug)]
pub struct BpfHandle {
    obj: *mut bpf_object,
    xdp_prog_fd: c_int,
    tc_prog_fd: Option<c_int>,
}

unsafe impl Send for BpfHandle {}

impl BpfHandle {
    /// Open and load the object file. The first program in the object is
    /// taken as the XDP entry point and forced to the XDP program type; the
    /// TC program, when named, is looked up and left for netlink attachment.
    pub(crate) fn load(
        path: &Path,
        xdp_progname: &str,
        tc_progname: Option<&str>,
    ) -> Result<BpfHandle, BpfError> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| BpfError::InvalidPath)?;

        let obj = unsafe { bpf_object__open_file(c_path.as_ptr(), std::ptr::null()) };
        if obj.is_null() {
            return Err(BpfError::Open(std::io::Error::from_raw_os_error(libc::EINVAL)));
        }
        let err = unsafe { libbpf_get_error(obj as *const c_void) };
        if err != 0 {
            return Err(BpfError::Open(std::io::Error::from_raw_os_error(
                -err as c_int,
            )));
        }

        // The first program in the object is the XDP entry point.
        let xdp_prog = unsafe { bpf_program__next(std::ptr::null_mut(), obj) };
        if xdp_prog.is_null() {
            unsafe { bpf_object__close(obj) };
            return Err(BpfError::NoSuchProgram(xdp_progname.to_string()));
        }
        unsafe { bpf_program__set_type(xdp_prog, BPF_PROG_TYPE_XDP) };

        let ret = unsafe { bpf_object__load(obj) };
        if ret != 0 {
            unsafe { bpf_object__close(obj) };
            return Err(BpfError::Load(std::io::Error::from_raw_os_error(-ret)));
        }

        let xdp_prog_fd = unsafe { bpf_program__fd(xdp_prog) };

        let tc_prog_fd = match tc_progname {
            Some(name) => {
                let c_name = CString::new(name).map_err(|_| BpfError::InvalidPath)?;
                let prog = unsafe { bpf_object__find_program_by_name(obj, c_name.as_ptr()) };
                if prog.is_null() {
                    unsafe { bpf_object__close(obj) };
                    return Err(BpfError::NoSuchProgram(name.to_string()));
                }
                Some(unsafe { bpf_program__fd(prog) })
            }
            None => None,
        };

        Ok(BpfHandle {
            obj,
            xdp_prog_fd,
            tc_prog_fd,
        })
    }

    pub(crate) fn xdp_prog_fd(&self) -> c_int {
        self.xdp_prog_fd
    }

    pub(crate) fn tc_prog_fd(&self) -> Option<c_int> {
        self.tc_prog_fd
    }

    /// File descriptor of the map called `name`, for host-side population.
    pub fn map_fd(&self, name: &str) -> Result<c_int, BpfError> {
        let c_name = CString::new(name).map_err(|_| BpfError::NoSuchMap(name.to_string()))?;
        let map = unsafe { bpf_object__find_map_by_name(self.obj, c_name.as_ptr()) };
        if map.is_null() {
            return Err(BpfError::NoSuchMap(name.to_string()));
        }
        let fd = unsafe { bpf_map__fd(map) };
        if fd < 0 {
            return Err(BpfError::NoSuchMap(name.to_string()));
        }
        Ok(fd)
    }

    /// Insert `value` at `key` into the map called `name`.
    pub fn update_map(&self, name: &str, key: u32, value: c_int) -> Result<(), BpfError> {
        let fd = self.map_fd(name)?;
        let ret = unsafe {
            bpf_map_update_elem(
                fd,
                &key as *const u32 as *const c_void,
                &value as *const c_int as *const c_void,
                0,
            )
        };
        if ret != 0 {
            return Err(BpfError::MapUpdate {
                map: name.to_string(),
                key,
                err: std::io::Error::from_raw_os_error(-ret),
            });
        }
        Ok(())
    }
}

impl Drop for BpfHandle {
    fn drop(&mut self) {
        unsafe {
            bpf_object__close(self.obj);
        }
    }
}

/// Attach the program to the interface through the netlink XDP family.
pub(crate) fn attach_xdp(ifindex: u32, prog_fd: c_int, flags: u32) -> Result<(), BpfError> {
    let ret = unsafe { bpf_set_link_xdp_fd(ifindex as c_int, prog_fd, flags) };
    if ret < 0 {
        return Err(BpfError::Attach {
            ifindex,
            err: std::io::Error::from_raw_os_error(-ret),
        });
    }
    Ok(())
}

/// Remove whatever XDP program is attached to the interface. Failures are
/// logged; teardown keeps going.
pub(crate) fn detach_xdp(ifindex: u32, flags: u32) {
    let ret = unsafe { bpf_set_link_xdp_fd(ifindex as c_int, -1, flags) };
    if ret < 0 {
        log::warn!("detaching XDP program from ifindex {}: {}", ifindex, ret);
    }
}
