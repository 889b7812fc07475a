use std::io::Write;
use std::time::Duration;

use guise::{BodyState, Client, ErrorKind, Timeouts};

mod helpers;
use helpers::mock_server::{MockHttpServer, MockResponse};

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn split(data: &[u8], parts: usize) -> Vec<Vec<u8>> {
    data.chunks(data.len().div_ceil(parts)).map(<[u8]>::to_vec).collect()
}

async fn server_with<F>(handler: F) -> (String, helpers::mock_server::ServerStats)
where
    F: Fn(&helpers::mock_server::MockRequest) -> MockResponse + Send + Sync + 'static,
{
    let server = MockHttpServer::new().await.unwrap();
    let url = server.url();
    let stats = server.stats();
    server.start(handler);
    (url, stats)
}

#[tokio::test]
async fn test_read_and_iteration_yield_identical_content() {
    helpers::init_tracing();
    let plain: Vec<u8> = (0..20_000u32).flat_map(|i| i.to_le_bytes()).collect();
    let wire = gzip(&plain);
    let (url, _) = server_with(move |_| {
        MockResponse::new(200)
            .header("Content-Encoding", "gzip")
            .chunked(split(&wire, 7))
    })
    .await;
    let client = Client::new().unwrap();

    let mut first = client.get(&url).send_streaming().await.unwrap();
    let materialized = first.read().await.unwrap();

    let mut second = client.get(&url).send_streaming().await.unwrap();
    let mut iterated = Vec::new();
    let mut chunks = second.iter_chunks().unwrap();
    while let Some(chunk) = chunks.next().await {
        iterated.extend_from_slice(&chunk.unwrap());
    }

    assert_eq!(&materialized[..], &plain[..]);
    assert_eq!(iterated, plain);
    assert_eq!(second.body_state(), BodyState::FullyRead);
}

#[tokio::test]
async fn test_iter_raw_skips_decoding() {
    let wire = gzip(b"compressed body");
    let expected = wire.clone();
    let (url, _) = server_with(move |_| {
        MockResponse::ok(wire.clone()).header("Content-Encoding", "gzip")
    })
    .await;
    let client = Client::new().unwrap();

    let mut resp = client.get(&url).send_streaming().await.unwrap();
    let mut raw = Vec::new();
    let mut chunks = resp.iter_raw().unwrap();
    while let Some(chunk) = chunks.next().await {
        raw.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(raw, expected);
}

#[tokio::test]
async fn test_text_before_read_is_response_not_read() {
    let (url, _) = server_with(|_| MockResponse::ok("body")).await;
    let client = Client::new().unwrap();

    let mut resp = client.get(&url).send_streaming().await.unwrap();
    assert_eq!(resp.body_state(), BodyState::NotStarted);
    assert_eq!(resp.text().unwrap_err().kind(), ErrorKind::ResponseNotRead);
    assert_eq!(resp.content().unwrap_err().kind(), ErrorKind::ResponseNotRead);

    resp.read().await.unwrap();
    assert_eq!(resp.text().unwrap(), "body");
    // cached
    assert_eq!(&resp.read().await.unwrap()[..], b"body");
}

#[tokio::test]
async fn test_second_iteration_is_stream_consumed_every_time() {
    let (url, _) = server_with(|_| MockResponse::new(200).chunked(vec![b"a".to_vec(), b"b".to_vec()])).await;
    let client = Client::new().unwrap();

    let mut resp = client.get(&url).send_streaming().await.unwrap();
    {
        let mut chunks = resp.iter_chunks().unwrap();
        while let Some(chunk) = chunks.next().await {
            chunk.unwrap();
        }
    }
    assert!(resp.is_stream_consumed());

    for _ in 0..2 {
        let err = resp.iter_chunks().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StreamConsumed);
        assert!(err.is_stream_error());
    }
    assert_eq!(resp.read().await.unwrap_err().kind(), ErrorKind::StreamConsumed);
}

#[tokio::test]
async fn test_iteration_after_read_is_stream_consumed() {
    let (url, _) = server_with(|_| MockResponse::ok("x")).await;
    let client = Client::new().unwrap();

    let mut resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.body_state(), BodyState::FullyRead);
    assert_eq!(resp.iter_chunks().unwrap_err().kind(), ErrorKind::StreamConsumed);
}

#[tokio::test]
async fn test_close_is_idempotent_and_tears_down_unread_connection() {
    let (url, stats) = server_with(|_| {
        MockResponse::new(200).chunked(vec![b"first".to_vec(), b"second".to_vec()])
    })
    .await;
    let client = Client::new().unwrap();

    let mut resp = client.get(&url).send_streaming().await.unwrap();
    assert_eq!(client.pool_stats().active_streams, 1);

    resp.close();
    resp.close();
    assert!(resp.is_closed());
    let pool = client.pool_stats();
    assert_eq!(pool.active_streams, 0);
    assert_eq!(pool.http1_connections, 0);

    assert_eq!(resp.read().await.unwrap_err().kind(), ErrorKind::StreamClosed);
    assert_eq!(resp.iter_chunks().unwrap_err().kind(), ErrorKind::StreamClosed);

    // the next request needs a fresh connection
    client.get(&url).send().await.unwrap();
    assert_eq!(stats.connections(), 2);
}

#[tokio::test]
async fn test_abandoned_read_leaves_response_closed() {
    let (url, stats) = server_with(|_| MockResponse::ok("late").stall_body(Duration::from_millis(500))).await;
    let client = Client::new().unwrap();

    let mut resp = client.get(&url).send_streaming().await.unwrap();
    let abandoned = tokio::time::timeout(Duration::from_millis(100), resp.read()).await;
    assert!(abandoned.is_err());

    assert!(resp.is_closed());
    assert!(!resp.is_stream_consumed());
    assert_eq!(resp.read().await.unwrap_err().kind(), ErrorKind::StreamClosed);
    assert_eq!(resp.iter_chunks().unwrap_err().kind(), ErrorKind::StreamClosed);
    assert_eq!(client.pool_stats().active_streams, 0);

    client.get(&url).send().await.unwrap();
    assert_eq!(stats.connections(), 2);
}

#[tokio::test]
async fn test_close_after_read_keeps_content() {
    let (url, _) = server_with(|_| MockResponse::ok("kept")).await;
    let client = Client::new().unwrap();

    let mut resp = client.get(&url).send().await.unwrap();
    resp.close();
    resp.close();
    assert_eq!(resp.text().unwrap(), "kept");
    assert_eq!(client.pool_stats().idle_connections, 1);
}

#[tokio::test]
async fn test_fully_read_stream_returns_connection() {
    let (url, stats) = server_with(|_| MockResponse::ok("reuse me")).await;
    let client = Client::new().unwrap();

    let mut resp = client.get(&url).send_streaming().await.unwrap();
    let mut chunks = resp.iter_chunks().unwrap();
    while chunks.next().await.is_some() {}
    drop(resp);

    assert_eq!(client.pool_stats().idle_connections, 1);
    client.get(&url).send().await.unwrap();
    assert_eq!(stats.connections(), 1);
}

#[tokio::test]
async fn test_read_timeout_tears_connection_down() {
    let (url, stats) = server_with(|req| match req.path.as_str() {
        "/slow" => MockResponse::ok("late").stall_body(Duration::from_secs(2)),
        _ => MockResponse::ok("fast"),
    })
    .await;
    let client = Client::builder()
        .timeouts(Timeouts::api_defaults().read(Duration::from_millis(200)))
        .build()
        .unwrap();

    let err = client.get(&format!("{}/slow", url)).send().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadTimeout);
    assert!(err.is_timeout());
    assert!(err.origin().is_some_and(|o| o.starts_with("http://127.0.0.1:")));

    let pool = client.pool_stats();
    assert_eq!(pool.http1_connections, 0);
    assert_eq!(pool.active_streams, 0);

    let resp = client.get(&format!("{}/fast", url)).send().await.unwrap();
    assert_eq!(resp.text().unwrap(), "fast");
    assert_eq!(stats.connections(), 2);
}

#[tokio::test]
async fn test_per_request_read_timeout_override() {
    let (url, _) = server_with(|_| MockResponse::ok("late").stall_body(Duration::from_millis(500))).await;
    let client = Client::builder().timeout(Duration::from_secs(5)).build().unwrap();

    let err = client
        .get(&url)
        .timeouts(Timeouts::new().read(Duration::from_millis(100)))
        .send()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadTimeout);
}

#[tokio::test]
async fn test_per_request_override_can_disable_read_timeout() {
    let (url, _) = server_with(|_| MockResponse::ok("late").stall_body(Duration::from_millis(400))).await;
    let client = Client::builder()
        .timeouts(Timeouts::api_defaults().read(Duration::from_millis(100)))
        .build()
        .unwrap();

    let err = client.get(&url).send().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadTimeout);

    let resp = client
        .get(&url)
        .timeouts(Timeouts::new().no_read_timeout())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().unwrap(), "late");
}

#[tokio::test]
async fn test_held_stream_exhausts_single_slot_pool() {
    let (url, _) = server_with(|_| MockResponse::new(200).chunked(vec![b"data".to_vec()])).await;
    let client = Client::builder()
        .pool_max_per_host(1)
        .timeouts(Timeouts::api_defaults().pool(Duration::from_millis(100)))
        .build()
        .unwrap();

    let held = client.get(&url).send_streaming().await.unwrap();
    let err = client.get(&url).send().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolTimeout);
    assert!(err.is_timeout());

    // dropping the unread response frees the slot
    drop(held);
    client.get(&url).send().await.unwrap();
}

#[tokio::test]
async fn test_status_and_json_helpers() {
    let (url, _) = server_with(|req| match req.path.as_str() {
        "/missing" => MockResponse::new(404).body("nope"),
        _ => MockResponse::ok(r#"{"name":"guise","tags":["a","b"]}"#)
            .header("Content-Type", "application/json"),
    })
    .await;
    let client = Client::new().unwrap();

    let resp = client.get(&format!("{}/missing", url)).send().await.unwrap();
    let err = resp.raise_for_status().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HttpStatusError);
    assert_eq!(err.status(), Some(404));
    assert!(resp.error_for_status().is_err());

    let resp = client.get(&format!("{}/doc", url)).send().await.unwrap();
    let value: serde_json::Value = resp.json().unwrap();
    assert_eq!(value["name"], "guise");
    assert_eq!(value["tags"][1], "b");
}

#[tokio::test]
async fn test_charset_from_content_type_and_override() {
    let (url, _) = server_with(|_| {
        MockResponse::ok(b"caf\xe9".to_vec()).header("Content-Type", "text/plain; charset=iso-8859-1")
    })
    .await;

    let client = Client::new().unwrap();
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.text().unwrap(), "café");

    let client = Client::builder().default_encoding("utf-8").build().unwrap();
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.text().unwrap(), "caf\u{fffd}");
}

#[tokio::test]
async fn test_head_request_has_no_body() {
    let (url, _) = server_with(|_| MockResponse::ok("ignored body")).await;
    let client = Client::new().unwrap();
    let resp = client.head(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.content().unwrap().is_empty());
    assert_eq!(client.pool_stats().idle_connections, 1);
}
