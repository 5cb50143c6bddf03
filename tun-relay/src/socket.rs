//! Outbound sockets with optional protection
//!
//! On platforms where the tunnel captures all traffic (Android `VpnService`,
//! policy-routed Linux), sockets to the proxy must be exempted before they
//! connect or their packets loop back into the TUN device. A
//! [`ProtectSocket`] hook receives the raw descriptor after creation and
//! before `connect`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{trace, warn};

use crate::addr;
use crate::error::RelayError;

/// IP type-of-service set on protected IPv4 TCP sockets
pub const PROTECTED_TOS: u32 = 128;

/// Hook that exempts a descriptor from tunnel capture. Returns 0 on success.
pub trait ProtectSocket: Send + Sync {
    fn protect(&self, fd: i32) -> i32;
}

impl<F> ProtectSocket for F
where
    F: Fn(i32) -> i32 + Send + Sync,
{
    fn protect(&self, fd: i32) -> i32 {
        self(fd)
    }
}

/// Shared protect hook
pub type Protector = Arc<dyn ProtectSocket>;

#[cfg(unix)]
fn apply_protect(socket: &Socket, protect: &dyn ProtectSocket) -> Result<(), RelayError> {
    use std::os::fd::AsRawFd;

    let fd = socket.as_raw_fd();
    let code = protect.protect(fd);
    if code != 0 {
        return Err(RelayError::ProtectionFailed { fd, code });
    }
    trace!(fd, "socket protected");
    Ok(())
}

#[cfg(not(unix))]
fn apply_protect(_socket: &Socket, _protect: &dyn ProtectSocket) -> Result<(), RelayError> {
    warn!("socket protection is not supported on this platform");
    Err(RelayError::ProtectionFailed { fd: -1, code: -1 })
}

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

fn dial_err(addr: &SocketAddr, what: &str, e: impl std::fmt::Display) -> RelayError {
    RelayError::dial_failure(addr, format!("{what}: {e}"))
}

/// Open a TCP connection to `addr`, protecting the socket first when a hook
/// is supplied. The whole connect is bounded by `connect_timeout`.
pub async fn dial_tcp(
    addr: SocketAddr,
    protect: Option<&dyn ProtectSocket>,
    connect_timeout: Duration,
) -> Result<TcpStream, RelayError> {
    if !addr::is_routable(&addr) {
        return Err(RelayError::invalid_address(addr.to_string()));
    }

    let Some(protect) = protect else {
        return match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(dial_err(&addr, "connect failed", e)),
            Err(_) => Err(RelayError::timeout(format!("connect to {addr}"))),
        };
    };

    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| dial_err(&addr, "socket creation failed", e))?;
    apply_protect(&socket, protect)?;

    if addr.is_ipv4() {
        if let Err(e) = socket.set_tos(PROTECTED_TOS) {
            warn!(error = %e, "failed to set IP_TOS on protected socket");
        }
    }
    socket
        .set_nonblocking(true)
        .map_err(|e| dial_err(&addr, "set nonblocking failed", e))?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        #[cfg(unix)]
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(dial_err(&addr, "connect failed", e)),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)
        .map_err(|e| dial_err(&addr, "stream conversion failed", e))?;

    let connected = timeout(connect_timeout, async {
        stream.writable().await?;
        match stream.take_error()? {
            None => Ok(()),
            Some(e) => Err(e),
        }
    })
    .await;

    match connected {
        Ok(Ok(())) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(dial_err(&addr, "connect failed", e)),
        Err(_) => Err(RelayError::timeout(format!("connect to {addr}"))),
    }
}

/// Create a UDP socket connected to `addr`, protecting it first when a hook
/// is supplied.
pub async fn dial_udp(
    addr: SocketAddr,
    protect: Option<&dyn ProtectSocket>,
) -> Result<UdpSocket, RelayError> {
    if !addr::is_routable(&addr) {
        return Err(RelayError::invalid_address(addr.to_string()));
    }

    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| dial_err(&addr, "socket creation failed", e))?;
    if let Some(protect) = protect {
        apply_protect(&socket, protect)?;
    }
    socket
        .set_nonblocking(true)
        .map_err(|e| dial_err(&addr, "set nonblocking failed", e))?;

    let std_socket: std::net::UdpSocket = socket.into();
    let socket =
        UdpSocket::from_std(std_socket).map_err(|e| dial_err(&addr, "socket conversion failed", e))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| dial_err(&addr, "connect failed", e))?;
    Ok(socket)
}

/// [`dial_tcp`] for a textual `"ip:port"` target.
pub async fn dial_tcp_str(
    address: &str,
    protect: Option<&dyn ProtectSocket>,
    connect_timeout: Duration,
) -> Result<TcpStream, RelayError> {
    let addr = addr::parse_addr_str(address).ok_or_else(|| RelayError::invalid_address(address))?;
    dial_tcp(addr, protect, connect_timeout).await
}

/// [`dial_udp`] for a textual `"ip:port"` target.
pub async fn dial_udp_str(
    address: &str,
    protect: Option<&dyn ProtectSocket>,
) -> Result<UdpSocket, RelayError> {
    let addr = addr::parse_addr_str(address).ok_or_else(|| RelayError::invalid_address(address))?;
    dial_udp(addr, protect).await
}
