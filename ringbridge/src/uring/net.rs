//! Socket setup helpers: address resolution, listeners, non-blocking connect.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const LISTEN_ALL: &str = "0.0.0.0";
const CONNECT_DEFAULT: &str = "127.0.0.1";

/// Where a socket lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// Resolve listen arguments. A missing, empty or `"0"` port selects a Unix
/// socket at `address`; no address binds all interfaces.
pub fn listen_endpoint(port: Option<&str>, address: Option<&str>) -> io::Result<Endpoint> {
    match tcp_port(port) {
        None => unix_endpoint(address),
        Some(port) => resolve(address.unwrap_or(LISTEN_ALL), port).map(Endpoint::Tcp),
    }
}

/// Resolve connect arguments. A missing, empty or `"0"` port selects a Unix
/// socket at `address`; no address targets the loopback interface.
pub fn connect_endpoint(port: Option<&str>, address: Option<&str>) -> io::Result<Endpoint> {
    match tcp_port(port) {
        None => unix_endpoint(address),
        Some(port) => resolve(address.unwrap_or(CONNECT_DEFAULT), port).map(Endpoint::Tcp),
    }
}

/// Port 0 means "Unix socket", not "any TCP port".
fn tcp_port(port: Option<&str>) -> Option<&str> {
    port.filter(|p| !p.is_empty() && *p != "0")
}

fn unix_endpoint(address: Option<&str>) -> io::Result<Endpoint> {
    match address {
        Some(path) if !path.is_empty() => Ok(Endpoint::Unix(PathBuf::from(path))),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "a Unix socket path is required when no port is given",
        )),
    }
}

fn resolve(host: &str, port: &str) -> io::Result<SocketAddr> {
    let port: u16 = port
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid port"))?;
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))
}

/// Create a bound, listening, non-blocking socket.
pub fn listen(endpoint: &Endpoint, backlog: i32) -> io::Result<OwnedFd> {
    let fd = match endpoint {
        Endpoint::Tcp(addr) => {
            let fd = socket(domain_of(addr))?;
            set_reuseaddr(fd.as_raw_fd());
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let len = socket_addr_to_sockaddr(*addr, &mut storage);
            cvt(unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &storage as *const _ as *const libc::sockaddr,
                    len,
                )
            })?;
            fd
        }
        Endpoint::Unix(path) => {
            let fd = socket(libc::AF_UNIX)?;
            // A stale socket file from a previous run blocks bind.
            let _ = std::fs::remove_file(path);
            let (addr, len) = unix_sockaddr(path)?;
            cvt(unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &addr as *const _ as *const libc::sockaddr,
                    len,
                )
            })?;
            fd
        }
    };
    cvt(unsafe { libc::listen(fd.as_raw_fd(), backlog) })?;
    Ok(fd)
}

/// Start a non-blocking connect. The socket is returned while the connect
/// is still in progress.
pub fn connect(endpoint: &Endpoint) -> io::Result<OwnedFd> {
    let (fd, ret) = match endpoint {
        Endpoint::Tcp(addr) => {
            let fd = socket(domain_of(addr))?;
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let len = socket_addr_to_sockaddr(*addr, &mut storage);
            let ret = unsafe {
                libc::connect(
                    fd.as_raw_fd(),
                    &storage as *const _ as *const libc::sockaddr,
                    len,
                )
            };
            (fd, ret)
        }
        Endpoint::Unix(path) => {
            let fd = socket(libc::AF_UNIX)?;
            let (addr, len) = unix_sockaddr(path)?;
            let ret = unsafe {
                libc::connect(
                    fd.as_raw_fd(),
                    &addr as *const _ as *const libc::sockaddr,
                    len,
                )
            };
            (fd, ret)
        }
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
    }
    Ok(fd)
}

/// Pending error on a socket (`SO_ERROR`), used to finish a connect.
pub fn take_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK == 0 {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    }
    Ok(())
}

/// Best effort: fails silently on non-TCP sockets.
pub fn set_nodelay(fd: RawFd) {
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn set_reuseaddr(fd: RawFd) {
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn socket(domain: libc::c_int) -> io::Result<OwnedFd> {
    let fd = cvt(unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn domain_of(addr: &SocketAddr) -> libc::c_int {
    if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn unix_sockaddr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    // Leave room for the trailing NUL.
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Unix socket path too long",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

/// Write a SocketAddr into a sockaddr_storage, return the address length.
pub(crate) fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    // Zero the storage to avoid uninitialised padding bytes.
    unsafe {
        std::ptr::write_bytes(
            storage as *mut _ as *mut u8,
            0,
            std::mem::size_of::<libc::sockaddr_storage>(),
        );
    }
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}
