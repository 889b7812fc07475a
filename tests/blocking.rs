use std::thread;

use guise::blocking::Client;
use guise::ErrorKind;
use tokio::runtime::Runtime;

mod helpers;
use helpers::mock_server::{MockHttpServer, MockResponse, ServerStats};

/// The mock server needs its own runtime; the blocking client brings one.
fn spawn_server<F>(handler: F) -> (Runtime, String, ServerStats)
where
    F: Fn(&helpers::mock_server::MockRequest) -> MockResponse + Send + Sync + 'static,
{
    let rt = Runtime::new().unwrap();
    let (url, stats) = rt.block_on(async {
        let server = MockHttpServer::new().await.unwrap();
        let url = server.url();
        let stats = server.stats();
        server.start(handler);
        (url, stats)
    });
    (rt, url, stats)
}

#[test]
fn test_blocking_get() {
    let (_rt, url, stats) = spawn_server(|req| MockResponse::ok(format!("you asked for {}", req.path)));

    let client = Client::new().unwrap();
    let resp = client.get(&format!("{}/thing", url)).send().unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().unwrap(), "you asked for /thing");
    assert_eq!(stats.request_count(), 1);
}

#[test]
fn test_blocking_chunks_iterate() {
    let (_rt, url, _) = spawn_server(|_| {
        MockResponse::new(200).chunked(vec![b"one ".to_vec(), b"two ".to_vec(), b"three".to_vec()])
    });

    let client = Client::new().unwrap();
    let mut resp = client.get(&url).send_streaming().unwrap();
    let body: Vec<u8> = resp
        .iter_chunks()
        .unwrap()
        .collect::<guise::Result<Vec<_>>>()
        .unwrap()
        .concat();
    assert_eq!(body, b"one two three");
    assert_eq!(resp.iter_chunks().unwrap_err().kind(), ErrorKind::StreamConsumed);
}

#[test]
fn test_blocking_client_shared_across_threads() {
    let (_rt, url, stats) = spawn_server(|_| MockResponse::ok("ok"));
    let client = Client::builder().pool_max_per_host(2).build().unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            let url = url.clone();
            thread::spawn(move || client.get(&url).send().map(|r| r.status()))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), 200);
    }

    assert_eq!(stats.request_count(), 8);
    assert!(stats.connections() <= 2);
    assert_eq!(client.pool_stats().active_streams, 0);
}

#[test]
fn test_blocking_errors_match_async_kinds() {
    let client = Client::new().unwrap();
    let err = client.get("ftp://example.com/").send().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedProtocol);

    let err = client.get("not a url").send().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidUrl);
}
