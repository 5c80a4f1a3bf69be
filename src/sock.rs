//! Non-blocking TCP plumbing under the connection state machine.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Socket, Type};

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("`{}` resolved to nothing", addr),
        )
    })
}

/// Resolves `host:port`, then binds a non-blocking listening socket with
/// SO_REUSEADDR and the configured backlog.
pub fn listen_stream(addr: &str, backlog: i32) -> io::Result<TcpListener> {
    let addr = resolve(addr)?;
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let sock = Socket::new(domain, Type::STREAM, None)?;
    sock.set_reuse_address(true)?;
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    sock.listen(backlog)?;
    TcpListener::from_std(sock.into())
}

/// Resolves and starts a non-blocking connect. Success covers both the
/// in-progress case and an immediately completed connect; anything else is a
/// hard failure.
pub fn connect_stream(addr: &str) -> io::Result<TcpStream> {
    let addr = resolve(addr)?;
    TcpStream::connect(&addr)
}

/// Zero-cost writability probe for a connect in flight: the poller may wake
/// us before the kernel has finalized the handshake, in which case the
/// socket has no peer address yet and we keep waiting.
pub fn finished_connecting(sock: &TcpStream) -> bool {
    sock.peer_addr().is_ok()
}
