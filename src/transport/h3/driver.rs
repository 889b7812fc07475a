//! Task that owns one QUIC connection and its HTTP/3 state.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quiche::h3::NameValue;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use super::handle::Shared;
use crate::error::{classify_io, Error, Result, TransportPhase};
use crate::fingerprint::PseudoHeader;
use crate::transport::{BodyEvent, ResponseHead, WireRequest};
use crate::version::HttpVersion;

const H3_NO_ERROR: u64 = 0x100;
const H3_REQUEST_CANCELLED: u64 = 0x10c;

/// Upper bound on the next wakeup when quiche has no timer armed.
const IDLE_POLL: Duration = Duration::from_secs(60);

pub(crate) enum DriverCommand {
    Open {
        key: u64,
        request: WireRequest,
        head_tx: oneshot::Sender<Result<ResponseHead>>,
        body_tx: mpsc::UnboundedSender<BodyEvent>,
    },
    /// The consumer took `len` body bytes off the stream.
    Consumed {
        key: u64,
        len: usize,
    },
    Reset {
        key: u64,
    },
}

impl std::fmt::Debug for DriverCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { key, .. } => f.debug_struct("Open").field("key", key).finish(),
            Self::Consumed { key, len } => f
                .debug_struct("Consumed")
                .field("key", key)
                .field("len", len)
                .finish(),
            Self::Reset { key } => f.debug_struct("Reset").field("key", key).finish(),
        }
    }
}

/// Request waiting for stream credit or header capacity.
struct Queued {
    key: u64,
    request: WireRequest,
    head_tx: oneshot::Sender<Result<ResponseHead>>,
    body_tx: mpsc::UnboundedSender<BodyEvent>,
}

/// Caps the body bytes a stream holds in its channel.
///
/// quiche returns flow-control credit as the body is read out of it, so
/// reading only while the consumer keeps up leaves the rest of the body
/// with the peer.
#[derive(Debug)]
pub(crate) struct RecvBudget {
    limit: usize,
    buffered: usize,
    stalled: bool,
}

impl RecvBudget {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            buffered: 0,
            stalled: false,
        }
    }

    /// Bytes that may be read from quiche right now.
    pub(crate) fn room(&self) -> usize {
        self.limit.saturating_sub(self.buffered)
    }

    pub(crate) fn delivered(&mut self, len: usize) {
        self.buffered += len;
    }

    /// Reading stopped with body bytes possibly left in quiche.
    pub(crate) fn stall(&mut self) {
        self.stalled = true;
    }

    /// Record consumed bytes; true when a stalled stream may read again.
    pub(crate) fn consumed(&mut self, len: usize) -> bool {
        self.buffered = self.buffered.saturating_sub(len);
        if self.stalled && self.room() > 0 {
            self.stalled = false;
            return true;
        }
        false
    }
}

struct StreamState {
    key: u64,
    budget: RecvBudget,
    head_tx: Option<oneshot::Sender<Result<ResponseHead>>>,
    body_tx: mpsc::UnboundedSender<BodyEvent>,
    /// Request body not yet accepted by quiche.
    pending_body: Bytes,
}

impl StreamState {
    fn fail(self, err: Error) {
        match self.head_tx {
            Some(tx) => {
                let _ = tx.send(Err(err));
            }
            None => {
                let _ = self.body_tx.send(BodyEvent::Error(err));
            }
        }
    }
}

enum Wake {
    Command(Option<DriverCommand>),
    Datagram(io::Result<usize>),
    Timer,
}

pub(crate) struct H3Driver {
    socket: UdpSocket,
    local: SocketAddr,
    peer: SocketAddr,
    conn: quiche::Connection,
    h3: quiche::h3::Connection,
    pseudo_order: [PseudoHeader; 4],
    stream_buffer: usize,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    shared: Arc<Shared>,
    streams: HashMap<u64, StreamState>,
    keys: HashMap<u64, u64>,
    queued: VecDeque<Queued>,
    recv_buf: Vec<u8>,
}

impl H3Driver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        socket: UdpSocket,
        local: SocketAddr,
        peer: SocketAddr,
        conn: quiche::Connection,
        h3: quiche::h3::Connection,
        pseudo_order: [PseudoHeader; 4],
        stream_buffer: usize,
        commands: mpsc::UnboundedReceiver<DriverCommand>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            socket,
            local,
            peer,
            conn,
            h3,
            pseudo_order,
            stream_buffer,
            commands,
            shared,
            streams: HashMap::new(),
            keys: HashMap::new(),
            queued: VecDeque::new(),
            recv_buf: vec![0u8; 65_535],
        }
    }

    pub(crate) async fn drive(mut self) {
        let mut datagram = vec![0u8; 65_535];
        let mut out = vec![0u8; super::MAX_DATAGRAM_SIZE];
        let mut accepting = true;

        loop {
            self.open_queued();
            self.send_pending_bodies();
            if let Err(e) = flush_egress(&mut self.conn, &self.socket, &mut out).await {
                self.fail_all(&e);
                break;
            }
            if self.conn.is_closed() {
                let err = self.close_error();
                tracing::debug!(peer = %self.peer, error = %err, "QUIC connection closed");
                self.fail_all(&err);
                break;
            }
            if !accepting && self.streams.is_empty() && self.queued.is_empty() {
                let _ = self.conn.close(true, H3_NO_ERROR, b"");
                let _ = flush_egress(&mut self.conn, &self.socket, &mut out).await;
                break;
            }

            let wait = self.conn.timeout().unwrap_or(IDLE_POLL);
            let wake = tokio::select! {
                cmd = self.commands.recv(), if accepting => Wake::Command(cmd),
                res = self.socket.recv(&mut datagram) => Wake::Datagram(res),
                _ = tokio::time::sleep(wait) => Wake::Timer,
            };

            match wake {
                Wake::Command(Some(cmd)) => self.handle_command(cmd),
                Wake::Command(None) => accepting = false,
                Wake::Datagram(Ok(len)) => {
                    let info = quiche::RecvInfo {
                        from: self.peer,
                        to: self.local,
                    };
                    if let Err(e) = self.conn.recv(&mut datagram[..len], info) {
                        tracing::trace!(error = %e, "dropping undecodable QUIC packet");
                    }
                    self.poll_events();
                }
                Wake::Datagram(Err(e)) => {
                    let err = classify_io(e, TransportPhase::Read);
                    self.fail_all(&err);
                    break;
                }
                Wake::Timer => self.conn.on_timeout(),
            }
        }

        self.shared.closed.store(true, Ordering::Release);
    }

    fn handle_command(&mut self, cmd: DriverCommand) {
        match cmd {
            DriverCommand::Open {
                key,
                request,
                head_tx,
                body_tx,
            } => self.queued.push_back(Queued {
                key,
                request,
                head_tx,
                body_tx,
            }),
            DriverCommand::Consumed { key, len } => {
                let Some(&stream_id) = self.keys.get(&key) else {
                    return;
                };
                let resume = self
                    .streams
                    .get_mut(&stream_id)
                    .is_some_and(|state| state.budget.consumed(len));
                if resume {
                    self.on_data(stream_id);
                    // reading to the end may have surfaced Finished
                    self.poll_events();
                }
            }
            DriverCommand::Reset { key } => {
                if let Some(stream_id) = self.keys.remove(&key) {
                    self.streams.remove(&stream_id);
                    let _ = self
                        .conn
                        .stream_shutdown(stream_id, quiche::Shutdown::Read, H3_REQUEST_CANCELLED);
                    let _ = self
                        .conn
                        .stream_shutdown(stream_id, quiche::Shutdown::Write, H3_REQUEST_CANCELLED);
                    tracing::trace!(stream_id, "HTTP/3 stream cancelled");
                } else {
                    self.queued.retain(|q| q.key != key);
                }
            }
        }
    }

    /// Open queued requests in order until the peer runs out of credit.
    fn open_queued(&mut self) {
        while let Some(next) = self.queued.pop_front() {
            let fields = next.request.multiplexed_fields(&self.pseudo_order);
            let headers: Vec<quiche::h3::Header> = fields
                .iter()
                .map(|(n, v)| quiche::h3::Header::new(n.as_bytes(), v.as_bytes()))
                .collect();
            let fin = next.request.body.is_empty();

            match self.h3.send_request(&mut self.conn, &headers, fin) {
                Ok(stream_id) => {
                    tracing::trace!(stream_id, path = %next.request.path, "HTTP/3 request sent");
                    self.keys.insert(next.key, stream_id);
                    self.streams.insert(
                        stream_id,
                        StreamState {
                            key: next.key,
                            budget: RecvBudget::new(self.stream_buffer),
                            head_tx: Some(next.head_tx),
                            body_tx: next.body_tx,
                            pending_body: next.request.body.clone(),
                        },
                    );
                }
                Err(quiche::h3::Error::StreamBlocked)
                | Err(quiche::h3::Error::TransportError(quiche::Error::StreamLimit)) => {
                    self.queued.push_front(next);
                    break;
                }
                Err(e) => {
                    let _ = next
                        .head_tx
                        .send(Err(Error::local_protocol(format!("HTTP/3 request rejected: {}", e))));
                }
            }
        }
    }

    fn send_pending_bodies(&mut self) {
        let mut failed = Vec::new();
        for (&stream_id, state) in self.streams.iter_mut() {
            if state.pending_body.is_empty() {
                continue;
            }
            match self
                .h3
                .send_body(&mut self.conn, stream_id, &state.pending_body, true)
            {
                Ok(written) => {
                    let _ = state.pending_body.split_to(written);
                }
                Err(quiche::h3::Error::Done) | Err(quiche::h3::Error::StreamBlocked) => {}
                Err(e) => failed.push((stream_id, e)),
            }
        }
        for (stream_id, e) in failed {
            if let Some(state) = self.remove_stream(stream_id) {
                state.fail(Error::write(format!("HTTP/3 body write failed: {}", e)));
            }
        }
    }

    fn poll_events(&mut self) {
        loop {
            match self.h3.poll(&mut self.conn) {
                Ok((stream_id, quiche::h3::Event::Headers { list, .. })) => {
                    self.on_headers(stream_id, list)
                }
                Ok((stream_id, quiche::h3::Event::Data)) => self.on_data(stream_id),
                Ok((stream_id, quiche::h3::Event::Finished)) => {
                    if let Some(state) = self.remove_stream(stream_id) {
                        match state.head_tx {
                            Some(tx) => {
                                let _ = tx.send(Err(Error::remote_protocol(
                                    "HTTP/3 stream finished without response headers",
                                )));
                            }
                            None => {
                                let _ = state.body_tx.send(BodyEvent::End);
                            }
                        }
                    }
                }
                Ok((stream_id, quiche::h3::Event::Reset(code))) => {
                    if let Some(state) = self.remove_stream(stream_id) {
                        state.fail(Error::remote_protocol(format!(
                            "HTTP/3 stream {} reset by peer (code {:#x})",
                            stream_id, code
                        )));
                    }
                }
                Ok((_, quiche::h3::Event::GoAway)) => {
                    tracing::debug!(peer = %self.peer, "HTTP/3 GOAWAY received");
                    self.shared.closed.store(true, Ordering::Release);
                }
                Ok(_) => {}
                Err(quiche::h3::Error::Done) => break,
                Err(e) => {
                    let err = Error::remote_protocol(format!("HTTP/3 connection error: {}", e));
                    self.fail_all(&err);
                    let _ = self.conn.close(true, e.to_wire(), b"");
                    break;
                }
            }
        }
    }

    fn on_headers(&mut self, stream_id: u64, list: Vec<quiche::h3::Header>) {
        let Some(state) = self.streams.get_mut(&stream_id) else {
            return;
        };
        // a second HEADERS after the response head is trailers
        let Some(head_tx) = state.head_tx.take() else {
            return;
        };
        let key = state.key;
        let fields = list
            .iter()
            .map(|h| {
                (
                    String::from_utf8_lossy(h.name()).into_owned(),
                    String::from_utf8_lossy(h.value()).into_owned(),
                )
            })
            .collect();
        match ResponseHead::from_fields(fields, HttpVersion::Http3) {
            Ok(head) if head.is_informational() => state.head_tx = Some(head_tx),
            Ok(head) => {
                let _ = head_tx.send(Ok(head));
            }
            Err(e) => {
                let _ = head_tx.send(Err(e));
                self.handle_command(DriverCommand::Reset { key });
            }
        }
    }

    fn on_data(&mut self, stream_id: u64) {
        loop {
            let Some(state) = self.streams.get_mut(&stream_id) else {
                return;
            };
            let room = state.budget.room().min(self.recv_buf.len());
            if room == 0 {
                state.budget.stall();
                break;
            }
            match self
                .h3
                .recv_body(&mut self.conn, stream_id, &mut self.recv_buf[..room])
            {
                Ok(read) => {
                    let chunk = Bytes::copy_from_slice(&self.recv_buf[..read]);
                    state.budget.delivered(read);
                    let _ = state.body_tx.send(BodyEvent::Data(chunk));
                }
                Err(quiche::h3::Error::Done) => break,
                Err(e) => {
                    if let Some(state) = self.remove_stream(stream_id) {
                        state.fail(Error::read(format!("HTTP/3 body read failed: {}", e)));
                    }
                    break;
                }
            }
        }
    }

    fn remove_stream(&mut self, stream_id: u64) -> Option<StreamState> {
        let state = self.streams.remove(&stream_id)?;
        self.keys.remove(&state.key);
        Some(state)
    }

    fn fail_all(&mut self, err: &Error) {
        self.shared.closed.store(true, Ordering::Release);
        for (_, state) in self.streams.drain() {
            state.fail(err.replicate());
        }
        self.keys.clear();
        for queued in self.queued.drain(..) {
            let _ = queued.head_tx.send(Err(err.replicate()));
        }
    }

    fn close_error(&self) -> Error {
        if let Some(e) = self.conn.peer_error() {
            Error::read(format!(
                "QUIC connection closed by peer (code {:#x}): {}",
                e.error_code,
                String::from_utf8_lossy(&e.reason)
            ))
        } else if self.conn.is_timed_out() {
            Error::read("QUIC connection idle timeout")
        } else {
            Error::read("QUIC connection closed")
        }
    }
}

/// Write every packet quiche has ready.
pub(super) async fn flush_egress(
    conn: &mut quiche::Connection,
    socket: &UdpSocket,
    out: &mut [u8],
) -> Result<()> {
    loop {
        match conn.send(out) {
            Ok((len, _)) => {
                socket
                    .send(&out[..len])
                    .await
                    .map_err(|e| classify_io(e, TransportPhase::Write))?;
            }
            Err(quiche::Error::Done) => return Ok(()),
            Err(e) => return Err(Error::local_protocol(format!("QUIC send failed: {}", e))),
        }
    }
}
