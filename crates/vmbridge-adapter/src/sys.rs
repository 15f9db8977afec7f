//! Thin libc wrappers. All of the crate's `unsafe` lives here.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

use crate::AdapterError;

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const PACKET_OUTGOING: u8 = 4;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 24 - mem::size_of::<libc::c_short>()],
}

/// Validate an interface name and turn it into the C form the kernel wants.
pub(crate) fn ifname(name: &str) -> Result<CString, AdapterError> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ || name.contains('/') {
        return Err(AdapterError::InvalidName(name.to_string()));
    }
    CString::new(name).map_err(|_| AdapterError::InvalidName(name.to_string()))
}

fn last_error(name: &str) -> AdapterError {
    AdapterError::io(name, io::Error::last_os_error())
}

/// An `AF_PACKET` socket bound to `name`, in promiscuous mode, non-blocking.
pub(crate) fn open_packet_socket(name: &str) -> Result<OwnedFd, AdapterError> {
    let c_name = ifname(name)?;
    // SAFETY: `c_name` is a NUL-terminated string that outlives the call.
    let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if ifindex == 0 {
        return Err(AdapterError::InterfaceNotFound(name.to_string()));
    }

    let protocol = (libc::ETH_P_ALL as u16).to_be();
    // SAFETY: socket(2) takes no pointers.
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::c_int::from(protocol),
        )
    };
    if fd < 0 {
        return Err(last_error(name));
    }
    // SAFETY: `fd` was just returned by socket(2) and is owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = protocol;
    addr.sll_ifindex = ifindex as libc::c_int;
    // SAFETY: `addr` is a sockaddr_ll on the stack and the length passed is its size.
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(last_error(name));
    }

    // SAFETY: packet_mreq is plain old data; all-zero is a valid value.
    let mut mreq: libc::packet_mreq = unsafe { mem::zeroed() };
    mreq.mr_ifindex = ifindex as libc::c_int;
    mreq.mr_type = libc::PACKET_MR_PROMISC as libc::c_ushort;
    // SAFETY: `mreq` outlives the call and the length passed is its size.
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_PACKET,
            libc::PACKET_ADD_MEMBERSHIP,
            &mreq as *const libc::packet_mreq as *const libc::c_void,
            mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(last_error(name));
    }

    Ok(fd)
}

pub(crate) enum Received {
    Frame(usize),
    /// A frame this host transmitted, looped back by the kernel.
    Outgoing,
    /// A frame longer than the buffer; its real length is reported.
    Oversized(usize),
}

pub(crate) fn recv_packet(fd: RawFd, buf: &mut [u8]) -> io::Result<Received> {
    // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value.
    let mut from: libc::sockaddr_ll = unsafe { mem::zeroed() };
    let mut from_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    // SAFETY: the kernel writes at most `buf.len()` bytes into `buf` and at most `from_len`
    // bytes into `from`; both are exclusively borrowed for the call.
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_TRUNC,
            &mut from as *mut libc::sockaddr_ll as *mut libc::sockaddr,
            &mut from_len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let len = n as usize;
    if from.sll_pkttype == PACKET_OUTGOING {
        Ok(Received::Outgoing)
    } else if len > buf.len() {
        Ok(Received::Oversized(len))
    } else {
        Ok(Received::Frame(len))
    }
}

pub(crate) fn send_packet(fd: RawFd, frame: &[u8]) -> io::Result<()> {
    // SAFETY: the pointer and length describe `frame`, which is borrowed for the call.
    let n = unsafe { libc::send(fd, frame.as_ptr() as *const libc::c_void, frame.len(), 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n as usize != frame.len() {
        return Err(io::Error::new(io::ErrorKind::WriteZero, "short packet write"));
    }
    Ok(())
}

/// Attach to (or create) the TAP device `name`. Returns the device and the name the kernel
/// assigned.
pub(crate) fn open_tap(name: &str) -> Result<(File, String), AdapterError> {
    let c_name = ifname(name)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open("/dev/net/tun")
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => AdapterError::InterfaceNotFound("/dev/net/tun".to_string()),
            _ => AdapterError::io(name, e),
        })?;

    let mut ifr = IfReqFlags {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: IFF_TAP | IFF_NO_PI,
        _pad: [0; 24 - mem::size_of::<libc::c_short>()],
    };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(c_name.as_bytes()) {
        *dst = *src as libc::c_char;
    }

    // SAFETY: `ifr` is a live, initialised ifreq-sized struct, which is what TUNSETIFF reads
    // and writes; the fd stays open for the call.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifr) };
    if ret < 0 {
        return Err(last_error(name));
    }

    let assigned: Vec<u8> = ifr
        .ifr_name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    Ok((file, String::from_utf8_lossy(&assigned).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_names_are_validated() {
        assert!(ifname("eth0").is_ok());
        assert!(matches!(ifname(""), Err(AdapterError::InvalidName(_))));
        assert!(matches!(
            ifname("a-name-far-too-long"),
            Err(AdapterError::InvalidName(_))
        ));
        assert!(matches!(ifname("a\0b"), Err(AdapterError::InvalidName(_))));
        assert!(matches!(ifname("../x"), Err(AdapterError::InvalidName(_))));
    }

    #[test]
    fn missing_interface_is_reported_before_any_privilege_check() {
        let err = open_packet_socket("vmbr-absent0").unwrap_err();
        assert!(matches!(err, AdapterError::InterfaceNotFound(ref n) if n == "vmbr-absent0"));
    }
}
