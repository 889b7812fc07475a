use std::sync::atomic::Ordering;
use std::time::Duration;

use guise::{Browser, Client, ErrorKind, HttpVersion};

mod helpers;
use helpers::mock_h2_server::{MockH2Connection, MockH2Server, DATA, FLAG_ACK, HEADERS, SETTINGS};
use helpers::mock_server::{MockHttpServer, MockResponse};
use helpers::tls::acceptor_with_alpn;

/// HPACK static-table index for `:status: 200`.
const STATUS_200: &[u8] = &[0x88];
const INTERNAL_ERROR: u32 = 0x2;

/// Preface and server SETTINGS. `None` once the client is gone.
async fn open(conn: &MockH2Connection) -> Option<()> {
    conn.read_preface().await.ok()?;
    conn.send_settings(&[(0x3, 100)]).await.ok()
}

/// Read frames until the next request HEADERS, acking SETTINGS on the way.
async fn next_request(conn: &MockH2Connection) -> Option<u32> {
    loop {
        let frame = conn.read_frame().await.ok()?;
        match frame.kind {
            SETTINGS if frame.flags & FLAG_ACK == 0 => conn.send_settings_ack().await.ok()?,
            HEADERS => return Some(frame.stream_id),
            // WINDOW_UPDATE, PRIORITY, SETTINGS ack
            _ => {}
        }
    }
}

async fn respond(conn: &MockH2Connection, stream_id: u32, body: &[u8]) -> Option<()> {
    conn.send_headers(stream_id, STATUS_200, false).await.ok()?;
    conn.send_data(stream_id, body, true).await.ok()
}

/// Answer `streams` requests on one connection, each with a body naming
/// the stream.
async fn serve_streams(conn: MockH2Connection, streams: usize) {
    if open(&conn).await.is_none() {
        return;
    }
    let mut pending = Vec::new();
    while pending.len() < streams {
        let Some(id) = next_request(&conn).await else {
            return;
        };
        pending.push(id);
    }
    for id in pending {
        let _ = respond(&conn, id, format!("stream {}", id).as_bytes()).await;
    }
    // keep the connection open until the client goes away
    let _ = conn.read_frame().await;
}

#[tokio::test]
async fn test_concurrent_requests_share_one_connection() {
    helpers::init_tracing();
    let (acceptor, ca) = acceptor_with_alpn(b"\x02h2");
    let server = MockH2Server::new().await.unwrap();
    let url = server.url();
    let connections = server.connection_counter();
    server.start(acceptor, |conn| serve_streams(conn, 2));

    let client = Client::builder().root_certificate(ca).build().unwrap();
    let (a, b) = tokio::join!(
        client.get(&format!("{}/a", url)).send(),
        client.get(&format!("{}/b", url)).send(),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    for resp in [&a, &b] {
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.version(), HttpVersion::Http2);
        assert_eq!(resp.http_version(), "HTTP/2");
        assert!(resp.text().unwrap().starts_with("stream "));
    }
    assert_ne!(a.text().unwrap(), b.text().unwrap());
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    let pool = client.pool_stats();
    assert_eq!(pool.http2_connections, 1);
    assert_eq!(pool.active_streams, 0);
}

#[tokio::test]
async fn test_untrusted_certificate_is_connect_error() {
    let (acceptor, _) = acceptor_with_alpn(b"\x02h2");
    let server = MockH2Server::new().await.unwrap();
    let url = server.url();
    server.start(acceptor, |conn| serve_streams(conn, 1));

    let client = Client::new().unwrap();
    let err = client.get(&url).send().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectError);
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_verify_disabled_accepts_self_signed() {
    let (acceptor, _) = acceptor_with_alpn(b"\x02h2");
    let server = MockH2Server::new().await.unwrap();
    let url = server.url();
    server.start(acceptor, |conn| serve_streams(conn, 1));

    let client = Client::builder().verify(false).build().unwrap();
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.text().unwrap(), "stream 1");
}

#[tokio::test]
async fn test_alpn_http1_uses_profile_header_order() {
    let (acceptor, ca) = acceptor_with_alpn(b"\x08http/1.1");
    let server = MockHttpServer::new().await.unwrap();
    let url = server.url_tls();
    let stats = server.stats();
    server.start_tls(acceptor, |_| MockResponse::ok("over tls"));

    let client = Client::builder()
        .browser(Browser::Chrome131)
        .root_certificate(ca)
        .build()
        .unwrap();
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.http_version(), "HTTP/1.1");
    assert_eq!(resp.text().unwrap(), "over tls");

    let requests = stats.requests();
    let sent = &requests[0];
    assert_eq!(sent.header("user-agent"), Some(client.profile().user_agent));

    // every header the profile orders appears in that order
    let order = client.profile().header_order;
    let positions: Vec<usize> = sent
        .header_names()
        .iter()
        .filter_map(|name| {
            order
                .iter()
                .position(|o| o.eq_ignore_ascii_case(name))
        })
        .collect();
    assert!(!positions.is_empty());
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", sent.header_names());
    assert_eq!(sent.header_names()[0].to_ascii_lowercase(), "host");
}

#[tokio::test]
async fn test_rst_stream_mid_body_is_remote_protocol_error() {
    let (acceptor, ca) = acceptor_with_alpn(b"\x02h2");
    let server = MockH2Server::new().await.unwrap();
    let url = server.url();
    server.start(acceptor, |conn| async move {
        if open(&conn).await.is_none() {
            return;
        }
        let Some(id) = next_request(&conn).await else {
            return;
        };
        let _ = conn.send_headers(id, STATUS_200, false).await;
        let _ = conn.send_data(id, b"partial", false).await;
        let _ = conn.send_rst_stream(id, INTERNAL_ERROR).await;
        let _ = conn.read_frame().await;
    });

    let client = Client::builder().root_certificate(ca).build().unwrap();
    let mut resp = client.get(&url).send_streaming().await.unwrap();
    assert_eq!(client.pool_stats().active_streams, 1);

    let mut received = Vec::new();
    let mut chunks = resp.iter_chunks().unwrap();
    let err = loop {
        match chunks.next().await {
            Some(Ok(chunk)) => received.extend_from_slice(&chunk),
            Some(Err(e)) => break e,
            None => panic!("body ended without the reset"),
        }
    };
    assert_eq!(received, b"partial");
    assert_eq!(err.kind(), ErrorKind::RemoteProtocolError);
    assert!(err.to_string().contains("INTERNAL_ERROR"), "{}", err);
    assert!(resp.is_closed());

    let pool = client.pool_stats();
    assert_eq!(pool.active_streams, 0);
    // a reset stream leaves the connection usable
    assert_eq!(pool.http2_connections, 1);
}

#[tokio::test]
async fn test_connection_closed_mid_body_retires_connection() {
    let (acceptor, ca) = acceptor_with_alpn(b"\x02h2");
    let server = MockH2Server::new().await.unwrap();
    let url = server.url();
    server.start(acceptor, |conn| async move {
        if open(&conn).await.is_none() {
            return;
        }
        let Some(id) = next_request(&conn).await else {
            return;
        };
        let _ = conn.send_headers(id, STATUS_200, false).await;
        let _ = conn.send_data(id, b"partial", false).await;
        // dropping the connection hangs up
    });

    let client = Client::builder().root_certificate(ca).build().unwrap();
    let err = client.get(&url).send().await.unwrap_err();
    // an EOF inside TLS is a truncated message, a TLS-level failure a read error
    assert!(
        matches!(err.kind(), ErrorKind::RemoteProtocolError | ErrorKind::ReadError),
        "{:?}",
        err
    );
    assert!(err.is_transport());

    let pool = client.pool_stats();
    assert_eq!(pool.active_streams, 0);
    assert_eq!(pool.http2_connections, 0);
}

#[tokio::test]
async fn test_goaway_fails_unprocessed_stream_and_next_request_reconnects() {
    let (acceptor, ca) = acceptor_with_alpn(b"\x02h2");
    let server = MockH2Server::new().await.unwrap();
    let url = server.url();
    let connections = server.connection_counter();
    server.start(acceptor, |conn| async move {
        if open(&conn).await.is_none() {
            return;
        }
        let Some(first) = next_request(&conn).await else {
            return;
        };
        let _ = respond(&conn, first, b"served").await;
        if next_request(&conn).await.is_none() {
            return;
        }
        let _ = conn.send_goaway(first, 0).await;
        let _ = conn.read_frame().await;
    });

    let client = Client::builder().root_certificate(ca).build().unwrap();
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.text().unwrap(), "served");

    let err = client.get(&url).send().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteProtocolError);
    assert!(err.to_string().contains("GOAWAY"), "{}", err);
    assert_eq!(client.pool_stats().active_streams, 0);

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.text().unwrap(), "served");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_upload_larger_than_window_waits_for_window_update() {
    const INITIAL_WINDOW: usize = 65_535;
    let (acceptor, ca) = acceptor_with_alpn(b"\x02h2");
    let server = MockH2Server::new().await.unwrap();
    // the certificate also covers localhost
    let url = format!("https://localhost:{}/upload", server.port());
    server.start(acceptor, |conn| async move {
        if open(&conn).await.is_none() {
            return;
        }
        let Some(id) = next_request(&conn).await else {
            return;
        };
        let mut received = 0;
        let mut credited = false;
        loop {
            let Ok(frame) = conn.read_frame().await else {
                return;
            };
            if frame.kind == SETTINGS && frame.flags & FLAG_ACK == 0 {
                let _ = conn.send_settings_ack().await;
            }
            if frame.kind != DATA || frame.stream_id != id {
                continue;
            }
            received += frame.payload.len();
            // both windows are exhausted at this point
            if !credited && received >= INITIAL_WINDOW {
                credited = true;
                let _ = conn.send_window_update(0, INITIAL_WINDOW as u32).await;
                let _ = conn.send_window_update(id, INITIAL_WINDOW as u32).await;
            }
            if frame.end_stream() {
                break;
            }
        }
        let _ = respond(&conn, id, format!("{} bytes", received).as_bytes()).await;
        let _ = conn.read_frame().await;
    });

    let client = Client::builder().root_certificate(ca).build().unwrap();
    let upload = client.post(&url).content(vec![b'x'; 100_000]).send();
    let resp = tokio::time::timeout(Duration::from_secs(10), upload)
        .await
        .expect("upload stalled on flow control")
        .unwrap();
    assert_eq!(resp.version(), HttpVersion::Http2);
    assert_eq!(resp.text().unwrap(), "100000 bytes");
}
