//! TCP socket setup with browser-like options.
//!
//! Sockets are created through socket2 so buffer sizes, TTL and the local
//! bind address can be set before the SYN goes out (p0f-style fingerprints
//! are visible before TLS).

use std::io;
use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};

use crate::error::{classify_io, Error, Result, TransportPhase};

/// TCP/IP fingerprint configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFingerprint {
    /// Socket buffer size; influences the advertised receive window.
    pub window_size: u32,
    /// Initial TTL for IPv4 packets (hop limit for IPv6).
    /// macOS/Linux: 64, Windows: 128
    pub ttl: u8,
    pub nodelay: bool,
}

impl TcpFingerprint {
    pub const MACOS: TcpFingerprint = TcpFingerprint {
        window_size: 65_535,
        ttl: 64,
        nodelay: true,
    };

    pub const WINDOWS: TcpFingerprint = TcpFingerprint {
        window_size: 65_535,
        ttl: 128,
        nodelay: true,
    };
}

impl Default for TcpFingerprint {
    fn default() -> Self {
        Self::MACOS
    }
}

/// Apply fingerprint options to an unconnected socket.
pub fn configure_tcp_socket(socket: &Socket, fp: &TcpFingerprint, ipv6: bool) -> io::Result<()> {
    socket.set_recv_buffer_size(fp.window_size as usize)?;
    socket.set_send_buffer_size(fp.window_size as usize)?;
    if ipv6 {
        socket.set_unicast_hops_v6(fp.ttl as u32)?;
    } else {
        socket.set_ttl_v4(fp.ttl as u32)?;
    }
    socket.set_tcp_nodelay(fp.nodelay)?;
    Ok(())
}

/// Resolve `host:port` and connect to the first address that accepts.
///
/// With `local` set, only addresses of the same family are tried and the
/// socket is bound to it before connecting.
pub async fn connect(
    host: &str,
    port: u16,
    local: Option<IpAddr>,
    fp: Option<&TcpFingerprint>,
) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| classify_io(e, TransportPhase::Connect))?
        .filter(|a| local.map_or(true, |l| l.is_ipv4() == a.is_ipv4()))
        .collect();

    if addrs.is_empty() {
        return Err(Error::connect(format!(
            "no usable address for {}:{}",
            host, port
        )));
    }

    let mut last_err = None;
    for addr in addrs {
        match connect_addr(addr, local, fp).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(%addr, error = %e, "TCP connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::connect("no address attempted")))
}

async fn connect_addr(
    addr: SocketAddr,
    local: Option<IpAddr>,
    fp: Option<&TcpFingerprint>,
) -> Result<TcpStream> {
    let socket = build_socket(addr, local, fp).map_err(|e| classify_io(e, TransportPhase::Connect))?;
    let socket = TcpSocket::from_std_stream(socket.into());
    socket
        .connect(addr)
        .await
        .map_err(|e| classify_io(e, TransportPhase::Connect))
}

fn build_socket(addr: SocketAddr, local: Option<IpAddr>, fp: Option<&TcpFingerprint>) -> io::Result<Socket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if let Some(fp) = fp {
        configure_tcp_socket(&socket, fp, addr.is_ipv6())?;
    }
    if let Some(ip) = local {
        socket.bind(&SocketAddr::new(ip, 0).into())?;
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_presets() {
        assert_eq!(TcpFingerprint::default(), TcpFingerprint::MACOS);
        assert_eq!(TcpFingerprint::WINDOWS.ttl, 128);
        assert_eq!(TcpFingerprint::MACOS.window_size, TcpFingerprint::WINDOWS.window_size);
    }

    #[tokio::test]
    async fn test_connect_with_local_bind() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let local: IpAddr = "127.0.0.1".parse().unwrap();
        let stream = connect("127.0.0.1", port, Some(local), Some(&TcpFingerprint::MACOS))
            .await
            .unwrap();
        assert_eq!(stream.local_addr().unwrap().ip(), local);
    }

    #[tokio::test]
    async fn test_refused_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect("127.0.0.1", port, None, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConnectError);
    }

    #[tokio::test]
    async fn test_family_mismatch_has_no_address() {
        let local: IpAddr = "::1".parse().unwrap();
        let err = connect("127.0.0.1", 80, Some(local), None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConnectError);
    }
}
