//! Listening socket factory.
//!
//! Engines take ownership of already-listening sockets; this is the only
//! place they are created. Binding port 0 lets the kernel pick, and the
//! chosen port is reported back for the sender and the result labels.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{IntoRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

/// Create a bound, listening TCP socket and return `(fd, actual_port)`.
pub fn mk_listen_sock(
    port: u16,
    v6: bool,
    backlog: i32,
    nonblocking: bool,
) -> io::Result<(RawFd, u16)> {
    let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if nonblocking {
        socket.set_nonblocking(true)?;
    }

    let addr: SocketAddr = if v6 {
        (Ipv6Addr::UNSPECIFIED, port).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, port).into()
    };
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    let port = socket
        .local_addr()?
        .as_socket()
        .map(|a| a.port())
        .unwrap_or(port);
    let fd = socket.into_raw_fd();
    tracing::debug!("made listen sock fd={fd} v6={v6} port={port}");
    Ok((fd, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_port_assigned() {
        let (fd, port) = mk_listen_sock(0, false, 16, true).unwrap();
        assert!(port != 0);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn two_socks_get_distinct_ports() {
        let (fd1, p1) = mk_listen_sock(0, false, 16, false).unwrap();
        let (fd2, p2) = mk_listen_sock(0, false, 16, false).unwrap();
        assert_ne!(p1, p2);
        unsafe {
            libc::close(fd1);
            libc::close(fd2);
        }
    }
}
