use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use boring::ssl::SslAcceptor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

/// One request as the mock server received it.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MockRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Header names in the order they arrived.
    pub fn header_names(&self) -> Vec<&str> {
        self.headers.iter().map(|(n, _)| n.as_str()).collect()
    }
}

/// Scripted reply.
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    chunks: Option<Vec<Vec<u8>>>,
    stall: Option<Duration>,
}

impl MockResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            chunks: None,
            stall: None,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200).body(body)
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Self::new(status).header("Location", location)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Send the body with chunked transfer coding, one chunk per part.
    pub fn chunked(mut self, parts: Vec<Vec<u8>>) -> Self {
        self.chunks = Some(parts);
        self
    }

    /// Wait this long between the head and the body.
    pub fn stall_body(mut self, delay: Duration) -> Self {
        self.stall = Some(delay);
        self
    }
}

/// What the server saw, shared with the test.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<MockRequest>>>,
}

impl ServerStats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// HTTP/1.1 mock server with keep-alive; replies come from a handler.
pub struct MockHttpServer {
    listener: TcpListener,
    port: u16,
    stats: ServerStats,
}

impl MockHttpServer {
    /// Bind to a random local port.
    pub async fn new() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            port,
            stats: ServerStats::default(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn url_tls(&self) -> String {
        format!("https://127.0.0.1:{}", self.port)
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.clone()
    }

    /// Serve plain HTTP in a background task.
    pub fn start<F>(self, handler: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&MockRequest) -> MockResponse + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            while let Ok((stream, _)) = self.listener.accept().await {
                self.stats.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, handler.clone(), self.stats.clone()));
            }
        })
    }

    /// Serve HTTPS in a background task.
    pub fn start_tls<F>(self, acceptor: SslAcceptor, handler: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&MockRequest) -> MockResponse + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let acceptor = Arc::new(acceptor);
        tokio::spawn(async move {
            while let Ok((stream, _)) = self.listener.accept().await {
                self.stats.connections.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                let handler = handler.clone();
                let stats = self.stats.clone();
                tokio::spawn(async move {
                    match tokio_boring::accept(&acceptor, stream).await {
                        Ok(tls) => serve(tls, handler, stats).await,
                        Err(e) => tracing::debug!("TLS accept failed: {}", e),
                    }
                });
            }
        })
    }
}

async fn serve<S, F>(mut stream: S, handler: Arc<F>, stats: ServerStats)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&MockRequest) -> MockResponse,
{
    let mut buf = Vec::new();
    while let Some(request) = read_request(&mut stream, &mut buf).await {
        stats.requests.lock().unwrap().push(request.clone());
        let response = handler(&request);
        if write_response(&mut stream, &request, &response).await.is_err() {
            return;
        }
        if request
            .header("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
        {
            return;
        }
    }
}

async fn read_request<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>) -> Option<MockRequest> {
    let mut chunk = [0u8; 4096];
    loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        if let Ok(httparse::Status::Complete(head_len)) = req.parse(&buf[..]) {
            let mut request = MockRequest {
                method: req.method?.to_string(),
                path: req.path?.to_string(),
                headers: req
                    .headers
                    .iter()
                    .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                    .collect(),
                body: Vec::new(),
            };
            let length: usize = request
                .header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            buf.drain(..head_len);
            while buf.len() < length {
                let n = stream.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            request.body = buf.drain(..length).collect();
            return Some(request);
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn write_response<S: AsyncWrite + Unpin>(
    stream: &mut S,
    request: &MockRequest,
    response: &MockResponse,
) -> std::io::Result<()> {
    let mut head = format!("HTTP/1.1 {} Mock\r\n", response.status);
    for (name, value) in &response.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    let bodiless = request.method == "HEAD" || response.status == 204 || response.status == 304;
    match &response.chunks {
        Some(_) => head.push_str("Transfer-Encoding: chunked\r\n"),
        None if response.status == 204 || response.status == 304 => {}
        None => head.push_str(&format!("Content-Length: {}\r\n", response.body.len())),
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;

    if bodiless {
        return Ok(());
    }
    if let Some(delay) = response.stall {
        tokio::time::sleep(delay).await;
    }
    match &response.chunks {
        Some(parts) => {
            for part in parts {
                stream
                    .write_all(format!("{:x}\r\n", part.len()).as_bytes())
                    .await?;
                stream.write_all(part).await?;
                stream.write_all(b"\r\n").await?;
                stream.flush().await?;
            }
            stream.write_all(b"0\r\n\r\n").await?;
        }
        None => stream.write_all(&response.body).await?,
    }
    stream.flush().await
}
