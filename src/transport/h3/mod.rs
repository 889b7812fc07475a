//! HTTP/3 over QUIC (quiche).
//!
//! The handshake is driven inline so setup failures surface from
//! [`connect`]; afterwards a driver task owns the connection and
//! [`H3Handle`] multiplexes requests over it.

mod driver;
mod handle;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub use handle::{H3Handle, H3Stream};

use crate::error::{classify_io, Error, Result, TransportPhase};
use crate::fingerprint::BrowserProfile;
use crate::timeouts::within;
use crate::transport::Origin;
use driver::{flush_egress, H3Driver};

/// Largest datagram we emit; matches common path MTU minus headers.
pub(crate) const MAX_DATAGRAM_SIZE: usize = 1350;

/// Open a QUIC connection to `origin` and complete the handshake within
/// `connect_timeout`.
///
/// Failures are transport errors; nothing here falls back to TCP.
pub async fn connect(
    origin: &Origin,
    mut config: quiche::Config,
    local: Option<IpAddr>,
    profile: &'static BrowserProfile,
    connect_timeout: Option<Duration>,
) -> Result<H3Handle> {
    within(
        connect_timeout,
        Error::connect_timeout,
        establish(origin, &mut config, local, profile),
    )
    .await
    .map_err(|e| e.with_origin(origin))
}

async fn establish(
    origin: &Origin,
    config: &mut quiche::Config,
    local: Option<IpAddr>,
    profile: &'static BrowserProfile,
) -> Result<H3Handle> {
    let connect_err = |e| classify_io(e, TransportPhase::Connect);

    let peer = tokio::net::lookup_host((origin.host(), origin.port()))
        .await
        .map_err(connect_err)?
        .find(|a| local.map_or(true, |l| l.is_ipv4() == a.is_ipv4()))
        .ok_or_else(|| Error::connect(format!("no usable address for {}", origin.host_port())))?;

    let bind_ip = local.unwrap_or(if peer.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    });
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))
        .await
        .map_err(connect_err)?;
    // connected so ICMP unreachable comes back as an error on recv
    socket.connect(peer).await.map_err(connect_err)?;
    let local_addr = socket.local_addr().map_err(connect_err)?;

    let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
    getrandom::fill(&mut scid)
        .map_err(|e| Error::connect(format!("failed to generate connection id: {}", e)))?;
    let scid = quiche::ConnectionId::from_ref(&scid);

    let server_name = match origin.host().parse::<IpAddr>() {
        Ok(_) => None,
        Err(_) => Some(origin.host()),
    };
    let mut conn = quiche::connect(server_name, &scid, local_addr, peer, config)
        .map_err(|e| Error::connect(format!("QUIC setup failed: {}", e)))?;

    handshake(&mut conn, &socket, local_addr, peer).await?;

    if conn.application_proto() != b"h3" {
        return Err(Error::connect("peer did not negotiate h3"));
    }
    let h3_config = quiche::h3::Config::new()
        .map_err(|e| Error::configuration(format!("HTTP/3 config: {}", e)))?;
    let h3 = quiche::h3::Connection::with_transport(&mut conn, &h3_config)
        .map_err(|e| Error::remote_protocol(format!("HTTP/3 setup failed: {}", e)))?;

    let max_streams = u32::try_from(conn.peer_streams_left_bidi()).unwrap_or(u32::MAX);
    tracing::debug!(%peer, max_streams, "QUIC handshake complete");

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(handle::Shared::new(max_streams));
    let driver = H3Driver::new(
        socket,
        local_addr,
        peer,
        conn,
        h3,
        profile.http2.pseudo_order,
        usize::try_from(profile.quic.initial_max_stream_data).unwrap_or(usize::MAX),
        command_rx,
        shared.clone(),
    );
    tokio::spawn(driver.drive());
    Ok(H3Handle::new(command_tx, shared))
}

async fn handshake(
    conn: &mut quiche::Connection,
    socket: &UdpSocket,
    local: SocketAddr,
    peer: SocketAddr,
) -> Result<()> {
    let mut buf = vec![0u8; 65_535];
    let mut out = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        flush_egress(conn, socket, &mut out)
            .await
            .map_err(|e| Error::connect(e.message().to_string()))?;

        if conn.is_established() {
            return Ok(());
        }
        if conn.is_closed() {
            let reason = match conn.peer_error().or(conn.local_error()) {
                Some(e) => format!(
                    "code {:#x}: {}",
                    e.error_code,
                    String::from_utf8_lossy(&e.reason)
                ),
                None if conn.is_timed_out() => "idle timeout".to_string(),
                None => "closed".to_string(),
            };
            return Err(Error::connect(format!("QUIC handshake failed ({})", reason))
                .with_phase(TransportPhase::TlsHandshake));
        }

        let wait = conn.timeout().unwrap_or(Duration::from_millis(100));
        match tokio::time::timeout(wait, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                let info = quiche::RecvInfo { from: peer, to: local };
                if let Err(e) = conn.recv(&mut buf[..len], info) {
                    tracing::trace!(error = %e, "dropping undecodable QUIC packet");
                }
            }
            Ok(Err(e)) => return Err(classify_io(e, TransportPhase::Connect)),
            Err(_) => conn.on_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{build_quic_config, Browser};
    use crate::ErrorKind;

    fn quic_config() -> quiche::Config {
        build_quic_config(Browser::Chrome131.profile(), false, &[]).unwrap()
    }

    fn profile() -> &'static BrowserProfile {
        Browser::Chrome131.profile()
    }

    #[tokio::test]
    async fn test_silent_peer_hits_connect_timeout() {
        // bound but never answers
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sink.local_addr().unwrap().port();
        let origin = Origin::new("https", "127.0.0.1", port);

        let err = connect(
            &origin,
            quic_config(),
            None,
            profile(),
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectTimeout);
        assert!(err.origin().is_some());
    }

    #[tokio::test]
    async fn test_closed_port_is_transport_error() {
        let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = sink.local_addr().unwrap().port();
        drop(sink);
        let origin = Origin::new("https", "127.0.0.1", port);

        let err = connect(&origin, quic_config(), None, profile(), Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        // ICMP refusal where the platform reports it, otherwise the budget
        assert!(matches!(
            err.kind(),
            ErrorKind::ConnectError | ErrorKind::ConnectTimeout
        ));
    }
}
