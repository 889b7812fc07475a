use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use boring::ssl::SslAcceptor;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_boring::SslStream;

pub const DATA: u8 = 0x0;
pub const HEADERS: u8 = 0x1;
pub const SETTINGS: u8 = 0x4;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// TLS listener (ALPN `h2`) whose connections are driven frame by frame
/// from the test.
pub struct MockH2Server {
    listener: TcpListener,
    port: u16,
    connections: Arc<AtomicUsize>,
}

impl MockH2Server {
    pub async fn new() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            port,
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn url(&self) -> String {
        format!("https://127.0.0.1:{}", self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connection_counter(&self) -> Arc<AtomicUsize> {
        self.connections.clone()
    }

    /// Run `script` on every accepted connection once TLS is up.
    pub fn start<F, Fut>(self, acceptor: SslAcceptor, script: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(MockH2Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let script = Arc::new(script);
        let acceptor = Arc::new(acceptor);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = self.listener.accept().await {
                self.connections.fetch_add(1, Ordering::SeqCst);
                let script = Arc::clone(&script);
                let acceptor = Arc::clone(&acceptor);
                tokio::spawn(async move {
                    if let Ok(tls) = tokio_boring::accept(&acceptor, tcp).await {
                        script(MockH2Connection {
                            stream: Arc::new(Mutex::new(tls)),
                        })
                        .await;
                    }
                });
            }
        })
    }
}

/// A frame as the client sent it.
#[derive(Debug)]
pub struct Frame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn end_stream(&self) -> bool {
        matches!(self.kind, DATA | HEADERS) && self.flags & FLAG_END_STREAM != 0
    }
}

/// Server side of one HTTP/2 connection.
pub struct MockH2Connection {
    stream: Arc<Mutex<SslStream<TcpStream>>>,
}

impl MockH2Connection {
    pub async fn read_preface(&self) -> std::io::Result<()> {
        let mut got = [0u8; 24];
        self.stream.lock().await.read_exact(&mut got).await?;
        if &got[..] != PREFACE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad HTTP/2 preface",
            ));
        }
        Ok(())
    }

    pub async fn read_frame(&self) -> std::io::Result<Frame> {
        let mut stream = self.stream.lock().await;
        let mut head = [0u8; 9];
        stream.read_exact(&mut head).await?;
        let len = u32::from_be_bytes([0, head[0], head[1], head[2]]) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok(Frame {
            kind: head[3],
            flags: head[4],
            stream_id: u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff,
            payload: payload.into(),
        })
    }

    pub async fn send_frame(&self, kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> std::io::Result<()> {
        let mut out = BytesMut::with_capacity(9 + payload.len());
        out.put_uint(payload.len() as u64, 3);
        out.put_u8(kind);
        out.put_u8(flags);
        out.put_u32(stream_id & 0x7fff_ffff);
        out.put_slice(payload);
        let mut stream = self.stream.lock().await;
        stream.write_all(&out).await?;
        stream.flush().await
    }

    pub async fn send_settings(&self, settings: &[(u16, u32)]) -> std::io::Result<()> {
        let mut payload = BytesMut::new();
        for &(id, value) in settings {
            payload.put_u16(id);
            payload.put_u32(value);
        }
        self.send_frame(SETTINGS, 0, 0, &payload).await
    }

    pub async fn send_settings_ack(&self) -> std::io::Result<()> {
        self.send_frame(SETTINGS, FLAG_ACK, 0, &[]).await
    }

    /// `block` is an already HPACK-encoded header block.
    pub async fn send_headers(&self, stream_id: u32, block: &[u8], end_stream: bool) -> std::io::Result<()> {
        let flags = FLAG_END_HEADERS | if end_stream { FLAG_END_STREAM } else { 0 };
        self.send_frame(HEADERS, flags, stream_id, block).await
    }

    pub async fn send_data(&self, stream_id: u32, data: &[u8], end_stream: bool) -> std::io::Result<()> {
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        self.send_frame(DATA, flags, stream_id, data).await
    }

    pub async fn send_window_update(&self, stream_id: u32, increment: u32) -> std::io::Result<()> {
        self.send_frame(0x8, 0, stream_id, &(increment & 0x7fff_ffff).to_be_bytes())
            .await
    }

    pub async fn send_rst_stream(&self, stream_id: u32, error_code: u32) -> std::io::Result<()> {
        self.send_frame(0x3, 0, stream_id, &error_code.to_be_bytes()).await
    }

    pub async fn send_goaway(&self, last_stream_id: u32, error_code: u32) -> std::io::Result<()> {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(last_stream_id & 0x7fff_ffff);
        payload.put_u32(error_code);
        self.send_frame(0x7, 0, 0, &payload).await
    }
}
