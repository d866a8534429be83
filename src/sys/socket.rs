use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;

use libc::{c_int, c_void, sockaddr, sockaddr_in, sockaddr_in6, socklen_t};

/// `socket(2)` with `SOCK_NONBLOCK | SOCK_CLOEXEC` set atomically, falling
/// back to a plain `socket()` plus manual flag-setting on kernels that
/// reject the combined flags (mirrors the `accept4`-then-`accept` fallback
/// used below for the same reason).
pub fn new_nonblocking_socket(domain: c_int, ty: c_int) -> io::Result<RawFd> {
    match syscall!(socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0)) {
        Ok(fd) => return Ok(fd),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {}
        Err(e) => return Err(e),
    }

    let fd = syscall!(socket(domain, ty, 0))?;
    set_nonblocking(fd, true)?;
    set_cloexec(fd)?;
    Ok(fd)
}

pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let mut flag = nonblocking as c_int;
    syscall!(ioctl(fd, libc::FIONBIO, &mut flag)).map(|_| ())
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC)).map(|_| ())
}

pub fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1i32)
}

pub fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (raw, len) = socket_addr_to_raw(addr);
    syscall!(bind(fd, &raw as *const _ as *const sockaddr, len)).map(|_| ())
}

pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (raw, len) = socket_addr_to_raw(addr);
    syscall!(connect(fd, &raw as *const _ as *const sockaddr, len)).map(|_| ())
}

pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    syscall!(listen(fd, backlog)).map(|_| ())
}

/// `accept4` with `SOCK_NONBLOCK | SOCK_CLOEXEC`, falling back to `accept`
/// plus manual flag-setting on kernels lacking `accept4` (`ENOSYS`).
pub fn accept4(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;

    let res = loop {
        match syscall!(accept4(
            fd,
            &mut storage as *mut _ as *mut sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        )) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => break other,
        }
    };

    let client = match res {
        Ok(fd) => fd,
        Err(e) if e.raw_os_error() == Some(libc::ENOSYS) => {
            let fd = loop {
                match syscall!(accept(fd, &mut storage as *mut _ as *mut sockaddr, &mut len)) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    other => break other?,
                }
            };
            set_nonblocking(fd, true)?;
            set_cloexec(fd)?;
            fd
        }
        Err(e) => return Err(e),
    };

    let addr = raw_to_socket_addr(&storage, len as usize)?;
    Ok((client, addr))
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    syscall!(getsockname(fd, &mut storage as *mut _ as *mut sockaddr, &mut len))?;
    raw_to_socket_addr(&storage, len as usize)
}

pub fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;

    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut c_void,
        buf.len(),
        0,
        &mut storage as *mut _ as *mut sockaddr,
        &mut len
    ))?;

    Ok((n as usize, raw_to_socket_addr(&storage, len as usize)?))
}

pub fn send_to(fd: RawFd, buf: &[u8], to: &SocketAddr) -> io::Result<usize> {
    let (raw, len) = socket_addr_to_raw(to);
    let n = syscall!(sendto(
        fd,
        buf.as_ptr() as *const c_void,
        buf.len(),
        0,
        &raw as *const _ as *const sockaddr,
        len
    ))?;
    Ok(n as usize)
}

/// Plain stream `recv`/`send`, used by `TcpStream`'s async read/write path
/// instead of `std::net::TcpStream`'s `&mut self` methods, since the
/// retry continuation only captures the raw fd (`Copy`), not the stream.
pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0))?;
    Ok(n as usize)
}

/// `MSG_NOSIGNAL` turns a write to a peer that reset the connection into
/// `EPIPE` instead of raising `SIGPIPE` on the process.
pub fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(send(fd, buf.as_ptr() as *const c_void, buf.len(), libc::MSG_NOSIGNAL))?;
    Ok(n as usize)
}

pub fn close(fd: RawFd) -> io::Result<()> {
    syscall!(close(fd)).map(|_| ())
}

pub fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let raw: c_int = getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if raw == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(raw)))
    }
}

pub fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, value: T) -> io::Result<()> {
    let payload = &value as *const T as *const c_void;
    syscall!(setsockopt(fd, level, name, payload, mem::size_of::<T>() as socklen_t))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(fd: RawFd, level: c_int, name: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(fd, level, name, &mut slot as *mut _ as *mut c_void, &mut len))?;
    Ok(slot)
}

/// `IP_ADD_MEMBERSHIP`/`IP_DROP_MEMBERSHIP` for IPv4 multicast groups.
pub fn ip_membership(fd: RawFd, group: Ipv4Addr, iface: Ipv4Addr, join: bool) -> io::Result<()> {
    let mreq = libc::ip_mreq {
        imr_multiaddr: libc::in_addr { s_addr: u32::from_ne_bytes(group.octets()) },
        imr_interface: libc::in_addr { s_addr: u32::from_ne_bytes(iface.octets()) },
    };
    let name = if join { libc::IP_ADD_MEMBERSHIP } else { libc::IP_DROP_MEMBERSHIP };
    setsockopt(fd, libc::IPPROTO_IP, name, mreq)
}

/// `IPV6_JOIN_GROUP`/`IPV6_LEAVE_GROUP` for IPv6 multicast groups.
pub fn ipv6_membership(fd: RawFd, group: Ipv6Addr, iface_index: u32, join: bool) -> io::Result<()> {
    let mreq = libc::ipv6_mreq {
        ipv6mr_multiaddr: libc::in6_addr { s6_addr: group.octets() },
        ipv6mr_interface: iface_index,
    };
    let name = if join { libc::IPV6_ADD_MEMBERSHIP } else { libc::IPV6_DROP_MEMBERSHIP };
    setsockopt(fd, libc::IPPROTO_IPV6, name, mreq)
}

pub fn set_multicast_if_v4(fd: RawFd, iface: Ipv4Addr) -> io::Result<()> {
    let addr = libc::in_addr { s_addr: u32::from_ne_bytes(iface.octets()) };
    setsockopt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_IF, addr)
}

pub fn set_multicast_if_v6(fd: RawFd, iface_index: u32) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_IF, iface_index as c_int)
}

pub fn set_multicast_loop_v4(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, on as u8)
}

pub fn set_multicast_loop_v6(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, on as c_int)
}

pub fn set_multicast_ttl_v4(fd: RawFd, ttl: u8) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, ttl as c_int)
}

pub fn multicast_ttl_v4(fd: RawFd) -> io::Result<u8> {
    let v: c_int = getsockopt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL)?;
    Ok(v as u8)
}

pub fn set_multicast_hops_v6(fd: RawFd, hops: u8) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, hops as c_int)
}

pub fn multicast_hops_v6(fd: RawFd) -> io::Result<u8> {
    let v: c_int = getsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS)?;
    Ok(v as u8)
}

/// Resolves a network interface name (e.g. `"eth0"`) to its first IPv4
/// address, for `UdpPeer::set_outbound_ipv4`.
pub fn interface_ipv4(name: &str) -> io::Result<Ipv4Addr> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    syscall!(getifaddrs(&mut head))?;
    let _guard = IfAddrsGuard(head);

    let mut cursor = head;
    while !cursor.is_null() {
        let ifa = unsafe { &*cursor };
        cursor = ifa.ifa_next;

        if ifa.ifa_addr.is_null() {
            continue;
        }
        let ifa_name = unsafe { std::ffi::CStr::from_ptr(ifa.ifa_name) };
        if ifa_name.to_string_lossy() != name {
            continue;
        }
        let family = unsafe { (*ifa.ifa_addr).sa_family as c_int };
        if family != libc::AF_INET {
            continue;
        }
        let raw: sockaddr_in = unsafe { *(ifa.ifa_addr as *const sockaddr_in) };
        return Ok(Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes()));
    }

    Err(io::Error::new(io::ErrorKind::NotFound, format!("no IPv4 address for interface {name:?}")))
}

struct IfAddrsGuard(*mut libc::ifaddrs);

impl Drop for IfAddrsGuard {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { libc::freeifaddrs(self.0) };
        }
    }
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len;
    match addr {
        SocketAddr::V4(a) => {
            let raw = sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut sockaddr_in, raw);
            }
            len = mem::size_of::<sockaddr_in>() as socklen_t;
        }
        SocketAddr::V6(a) => {
            let raw = sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: a.ip().octets() },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut sockaddr_in6, raw);
            }
            len = mem::size_of::<sockaddr_in6>() as socklen_t;
        }
    }
    (storage, len)
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            if len < mem::size_of::<sockaddr_in>() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "short sockaddr_in"));
            }
            let raw: sockaddr_in = unsafe { *(storage as *const _ as *const sockaddr_in) };
            let ip = Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::new(IpAddr::V4(ip), u16::from_be(raw.sin_port)))
        }
        libc::AF_INET6 => {
            if len < mem::size_of::<sockaddr_in6>() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "short sockaddr_in6"));
            }
            let raw: sockaddr_in6 = unsafe { *(storage as *const _ as *const sockaddr_in6) };
            let ip = Ipv6Addr::from(raw.sin6_addr.s6_addr);
            Ok(SocketAddr::new(IpAddr::V6(ip), u16::from_be(raw.sin6_port)))
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "unsupported address family")),
    }
}
