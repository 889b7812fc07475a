use std::time::{Duration, Instant};

use guise::{Client, ErrorKind, Timeouts};

mod helpers;
use helpers::mock_server::{MockHttpServer, MockResponse};
use helpers::tls::acceptor_with_alpn;

fn quick_connect() -> Timeouts {
    Timeouts::api_defaults().connect(Duration::from_millis(500))
}

#[tokio::test]
async fn test_forced_http3_never_falls_back_to_tcp() {
    helpers::init_tracing();
    let (acceptor, ca) = acceptor_with_alpn(b"\x08http/1.1");
    let server = MockHttpServer::new().await.unwrap();
    let url = server.url_tls();
    let stats = server.stats();
    server.start_tls(acceptor, |_| MockResponse::ok("tcp"));

    let client = Client::builder()
        .root_certificate(ca)
        .timeouts(quick_connect())
        .build()
        .unwrap();

    let started = Instant::now();
    let err = client.get(&url).force_http3(true).send().await.unwrap_err();

    assert!(
        matches!(err.kind(), ErrorKind::ConnectError | ErrorKind::ConnectTimeout),
        "{:?}",
        err
    );
    assert!(err.is_transport());
    assert!(err.origin().is_some());
    assert!(started.elapsed() < Duration::from_secs(3));
    // the TCP listener never saw the request
    assert_eq!(stats.connections(), 0);
    assert_eq!(stats.request_count(), 0);
}

#[tokio::test]
async fn test_forced_http3_requires_https() {
    let client = Client::new().unwrap();
    let err = client
        .get("http://127.0.0.1:9/")
        .force_http3(true)
        .send()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedProtocol);
}

#[tokio::test]
async fn test_opt_in_fallback_reaches_tcp() {
    let (acceptor, ca) = acceptor_with_alpn(b"\x08http/1.1");
    let server = MockHttpServer::new().await.unwrap();
    let url = server.url_tls();
    let stats = server.stats();
    server.start_tls(acceptor, |_| MockResponse::ok("tcp"));

    let client = Client::builder()
        .root_certificate(ca)
        .timeouts(quick_connect())
        .http3(true)
        .http3_fallback(true)
        .build()
        .unwrap();

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.http_version(), "HTTP/1.1");
    assert_eq!(resp.text().unwrap(), "tcp");
    assert_eq!(stats.request_count(), 1);
}

#[tokio::test]
async fn test_http3_without_fallback_fails() {
    let (acceptor, ca) = acceptor_with_alpn(b"\x08http/1.1");
    let server = MockHttpServer::new().await.unwrap();
    let url = server.url_tls();
    let stats = server.stats();
    server.start_tls(acceptor, |_| MockResponse::ok("tcp"));

    let client = Client::builder()
        .root_certificate(ca)
        .timeouts(quick_connect())
        .http3(true)
        .build()
        .unwrap();

    let err = client.get(&url).send().await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(stats.request_count(), 0);
}
