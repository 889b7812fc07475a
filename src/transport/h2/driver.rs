//! HTTP/2 connection driver: a background task that owns the write half of
//! the socket, routes incoming frames to streams and enforces flow control
//! in both directions.
//!
//! A separate reader task parses frames off the read half and forwards them,
//! so the driver can react to commands while a frame is still arriving.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};

use super::frame::{self, error_code, Frame, MAX_WINDOW_SIZE};
use super::handle::Shared;
use super::hpack::{Decoder, Encoder};
use crate::error::{classify_io, Error, Result, TransportPhase};
use crate::fingerprint::http2::{
    SETTINGS_INITIAL_WINDOW_SIZE, SETTINGS_MAX_CONCURRENT_STREAMS, SETTINGS_MAX_FRAME_SIZE,
};
use crate::fingerprint::{Http2Profile, PseudoHeader};
use crate::timeouts::within;
use crate::transport::{BodyEvent, ResponseHead, WireRequest};
use crate::version::HttpVersion;

/// Bound on the best-effort GOAWAY written at shutdown.
const GOAWAY_WRITE_LIMIT: Duration = Duration::from_secs(1);

/// Command sent from a handle or stream to the driver.
#[derive(Debug)]
pub(crate) enum DriverCommand {
    Open {
        stream_id: u32,
        request: WireRequest,
        head_tx: oneshot::Sender<Result<ResponseHead>>,
        body_tx: mpsc::UnboundedSender<BodyEvent>,
    },
    /// The consumer took `len` body bytes off the stream.
    Consumed { stream_id: u32, len: u32 },
    /// The consumer gave up on the stream. `buffered` body bytes were
    /// delivered but never read; they go back to the connection window.
    Reset { stream_id: u32, buffered: u32 },
}

/// Per-stream state tracked by the driver.
struct StreamState {
    head_tx: Option<oneshot::Sender<Result<ResponseHead>>>,
    body_tx: mpsc::UnboundedSender<BodyEvent>,
    send_window: i64,
    recv_window: i64,
    recv_unacked: u32,
    /// Request body bytes not yet allowed out by flow control.
    pending: Bytes,
    remote_closed: bool,
}

impl StreamState {
    fn fail(&mut self, err: Error) {
        match self.head_tx.take() {
            Some(tx) => {
                let _ = tx.send(Err(err));
            }
            None => {
                let _ = self.body_tx.send(BodyEvent::Error(err));
            }
        }
    }
}

/// Header block split across HEADERS + CONTINUATION.
struct PartialBlock {
    stream_id: u32,
    end_stream: bool,
    block: BytesMut,
}

pub(crate) struct DriverConfig {
    pub(crate) pseudo_order: [PseudoHeader; 4],
    pub(crate) local_initial_window: u32,
    pub(crate) local_connection_window: u32,
    pub(crate) local_max_frame_size: u32,
    pub(crate) header_table_size: u32,
    pub(crate) write_timeout: Option<Duration>,
}

impl DriverConfig {
    pub(crate) fn from_profile(profile: &Http2Profile, write_timeout: Option<Duration>) -> Self {
        Self {
            pseudo_order: profile.pseudo_order,
            local_initial_window: profile.initial_window_size(),
            local_connection_window: profile.connection_window(),
            local_max_frame_size: profile.max_frame_size(),
            header_table_size: profile.header_table_size(),
            write_timeout,
        }
    }
}

pub(crate) struct H2Driver<S> {
    config: DriverConfig,
    writer: WriteHalf<S>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    frames: mpsc::Receiver<Result<Frame>>,
    reader: tokio::task::JoinHandle<()>,
    shared: Arc<Shared>,
    streams: HashMap<u32, StreamState>,
    encoder: Encoder,
    decoder: Decoder,
    partial: Option<PartialBlock>,
    out: BytesMut,
    peer_initial_window: i64,
    peer_max_frame_size: usize,
    conn_send_window: i64,
    conn_recv_window: i64,
    conn_recv_unacked: u32,
    going_away: bool,
}

impl<S> H2Driver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub(crate) fn new(
        read: ReadHalf<S>,
        writer: WriteHalf<S>,
        config: DriverConfig,
        commands: mpsc::UnboundedReceiver<DriverCommand>,
        shared: Arc<Shared>,
    ) -> Self {
        let (frame_tx, frames) = mpsc::channel(64);
        let max_frame = config.local_max_frame_size;
        let reader = tokio::spawn(read_loop(read, max_frame, frame_tx));
        Self {
            decoder: Decoder::new(config.header_table_size as usize),
            conn_recv_window: config.local_connection_window as i64,
            config,
            writer,
            commands,
            frames,
            reader,
            shared,
            streams: HashMap::new(),
            encoder: Encoder::new(),
            partial: None,
            out: BytesMut::with_capacity(16 * 1024),
            peer_initial_window: 65_535,
            peer_max_frame_size: 16_384,
            conn_send_window: 65_535,
            conn_recv_unacked: 0,
            going_away: false,
        }
    }

    /// Run until the connection fails or every handle and stream is gone.
    pub(crate) async fn drive(mut self) {
        let mut commands_open = true;
        loop {
            let step = tokio::select! {
                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        commands_open = false;
                        Ok(())
                    }
                },
                frame = self.frames.recv() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame),
                    Some(Err(e)) => Err(e),
                    None => Err(Error::read("HTTP/2 connection closed by peer")),
                },
            };
            let step = match step {
                Ok(()) => self.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = step {
                tracing::debug!(error = %e, streams = self.streams.len(), "HTTP/2 connection failed");
                self.fail_all(&e);
                break;
            }
            if (!commands_open || self.going_away) && self.streams.is_empty() {
                tracing::trace!("HTTP/2 driver idle with no handles, shutting down");
                break;
            }
        }
        self.shared.closed.store(true, Ordering::Release);
        frame::encode_goaway(0, error_code::NO_ERROR, &mut self.out);
        let writer = &mut self.writer;
        let out = &self.out;
        let _ = tokio::time::timeout(GOAWAY_WRITE_LIMIT, async {
            writer.write_all(out).await?;
            writer.shutdown().await
        })
        .await;
        self.reader.abort();
    }

    fn fail_all(&mut self, err: &Error) {
        self.shared.closed.store(true, Ordering::Release);
        for (_, mut stream) in self.streams.drain() {
            stream.fail(err.replicate());
        }
    }

    async fn flush(&mut self) -> Result<()> {
        if self.conn_recv_unacked >= self.config.local_connection_window / 2 {
            frame::encode_window_update(0, self.conn_recv_unacked, &mut self.out);
            self.conn_recv_window += self.conn_recv_unacked as i64;
            self.conn_recv_unacked = 0;
        }
        self.send_pending_data();
        if self.out.is_empty() {
            return Ok(());
        }
        let buf = self.out.split().freeze();
        let writer = &mut self.writer;
        within(self.config.write_timeout, Error::write_timeout, async {
            writer
                .write_all(&buf)
                .await
                .map_err(|e| classify_io(e, TransportPhase::Write))?;
            writer
                .flush()
                .await
                .map_err(|e| classify_io(e, TransportPhase::Write))
        })
        .await
    }

    fn handle_command(&mut self, cmd: DriverCommand) -> Result<()> {
        match cmd {
            DriverCommand::Open {
                stream_id,
                request,
                head_tx,
                body_tx,
            } => {
                if self.going_away {
                    let _ = head_tx.send(Err(Error::read(
                        "HTTP/2 connection is going away (GOAWAY received)",
                    )));
                    return Ok(());
                }
                let fields = request.multiplexed_fields(&self.config.pseudo_order);
                let block = self
                    .encoder
                    .encode(fields.iter().map(|(n, v)| (n.as_str(), v.as_str())));
                let end_stream = request.body.is_empty();
                frame::encode_headers(
                    stream_id,
                    &block,
                    end_stream,
                    self.peer_max_frame_size,
                    &mut self.out,
                );
                tracing::trace!(stream_id, method = %request.method, path = %request.path, "HTTP/2 stream opened");
                self.streams.insert(
                    stream_id,
                    StreamState {
                        head_tx: Some(head_tx),
                        body_tx,
                        send_window: self.peer_initial_window,
                        recv_window: self.config.local_initial_window as i64,
                        recv_unacked: 0,
                        pending: request.body,
                        remote_closed: false,
                    },
                );
            }
            DriverCommand::Consumed { stream_id, len } => {
                self.conn_recv_unacked += len;
                let threshold = self.config.local_initial_window / 2;
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.recv_unacked += len;
                    if !stream.remote_closed && stream.recv_unacked >= threshold {
                        frame::encode_window_update(stream_id, stream.recv_unacked, &mut self.out);
                        stream.recv_window += stream.recv_unacked as i64;
                        stream.recv_unacked = 0;
                    }
                }
            }
            DriverCommand::Reset {
                stream_id,
                buffered,
            } => {
                self.conn_recv_unacked += buffered;
                if self.streams.remove(&stream_id).is_some() {
                    tracing::trace!(stream_id, "HTTP/2 stream cancelled");
                    frame::encode_rst_stream(stream_id, error_code::CANCEL, &mut self.out);
                }
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        if let Some(partial) = &self.partial {
            let expected = partial.stream_id;
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == expected => {}
                _ => {
                    return Err(Error::remote_protocol(
                        "expected CONTINUATION frame (PROTOCOL_ERROR)",
                    ))
                }
            }
        }

        match frame {
            Frame::Settings { ack: true, .. } => {}
            Frame::Settings { ack: false, settings } => {
                self.apply_settings(&settings)?;
                frame::encode_settings_ack(&mut self.out);
            }
            Frame::Ping { ack: false, payload } => frame::encode_ping_ack(payload, &mut self.out),
            Frame::Ping { ack: true, .. } => {}
            Frame::Headers {
                stream_id,
                end_stream,
                end_headers,
                block,
            } => {
                if end_headers {
                    self.on_header_block(stream_id, &block, end_stream)?;
                } else {
                    self.partial = Some(PartialBlock {
                        stream_id,
                        end_stream,
                        block: BytesMut::from(&block[..]),
                    });
                }
            }
            Frame::Continuation {
                stream_id,
                end_headers,
                block,
            } => {
                let mut partial = self
                    .partial
                    .take()
                    .ok_or_else(|| Error::remote_protocol("unexpected CONTINUATION frame"))?;
                partial.block.extend_from_slice(&block);
                if end_headers {
                    self.on_header_block(stream_id, &partial.block, partial.end_stream)?;
                } else {
                    self.partial = Some(partial);
                }
            }
            Frame::Data {
                stream_id,
                end_stream,
                data,
                flow_len,
            } => self.on_data(stream_id, end_stream, data, flow_len)?,
            Frame::RstStream {
                stream_id,
                error_code: code,
            } => {
                if let Some(mut stream) = self.streams.remove(&stream_id) {
                    tracing::debug!(stream_id, code = error_code::name(code), "HTTP/2 stream reset by peer");
                    stream.fail(Error::remote_protocol(format!(
                        "stream {} reset by peer: {}",
                        stream_id,
                        error_code::name(code)
                    )));
                }
            }
            Frame::GoAway {
                last_stream_id,
                error_code: code,
                debug_data,
            } => {
                tracing::debug!(
                    last_stream_id,
                    code = error_code::name(code),
                    debug = %String::from_utf8_lossy(&debug_data),
                    "HTTP/2 GOAWAY received"
                );
                self.going_away = true;
                self.shared.closed.store(true, Ordering::Release);
                let refused: Vec<u32> = self
                    .streams
                    .keys()
                    .copied()
                    .filter(|id| *id > last_stream_id)
                    .collect();
                for id in refused {
                    if let Some(mut stream) = self.streams.remove(&id) {
                        stream.fail(Error::remote_protocol(format!(
                            "stream {} not processed before GOAWAY ({})",
                            id,
                            error_code::name(code)
                        )));
                    }
                }
            }
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            } => {
                self.conn_send_window += increment as i64;
                if self.conn_send_window > MAX_WINDOW_SIZE {
                    return Err(Error::remote_protocol(
                        "connection window overflow (FLOW_CONTROL_ERROR)",
                    ));
                }
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                let overflow = match self.streams.get_mut(&stream_id) {
                    Some(stream) => {
                        stream.send_window += increment as i64;
                        stream.send_window > MAX_WINDOW_SIZE
                    }
                    None => false,
                };
                if overflow {
                    self.reset_stream(
                        stream_id,
                        error_code::FLOW_CONTROL_ERROR,
                        Error::remote_protocol("stream window overflow (FLOW_CONTROL_ERROR)"),
                    );
                }
            }
            Frame::PushPromise { .. } => {
                return Err(Error::remote_protocol(
                    "PUSH_PROMISE received with push disabled (PROTOCOL_ERROR)",
                ));
            }
            Frame::Priority { .. } | Frame::Unknown { .. } => {}
        }
        Ok(())
    }

    fn apply_settings(&mut self, settings: &[(u16, u32)]) -> Result<()> {
        for &(id, value) in settings {
            match id {
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value as i64 > MAX_WINDOW_SIZE {
                        return Err(Error::remote_protocol(
                            "SETTINGS_INITIAL_WINDOW_SIZE above 2^31-1 (FLOW_CONTROL_ERROR)",
                        ));
                    }
                    let delta = value as i64 - self.peer_initial_window;
                    self.peer_initial_window = value as i64;
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(16_384..=16_777_215).contains(&value) {
                        return Err(Error::remote_protocol(format!(
                            "invalid SETTINGS_MAX_FRAME_SIZE {} (PROTOCOL_ERROR)",
                            value
                        )));
                    }
                    self.peer_max_frame_size = value as usize;
                }
                SETTINGS_MAX_CONCURRENT_STREAMS => {
                    self.shared
                        .max_concurrent_streams
                        .store(value, Ordering::Release);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn on_header_block(&mut self, stream_id: u32, block: &[u8], end_stream: bool) -> Result<()> {
        // always decode so the dynamic table stays in sync
        let fields = self.decoder.decode(block)?;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        if stream.head_tx.is_none() {
            // trailers
            if !end_stream {
                self.reset_stream(
                    stream_id,
                    error_code::PROTOCOL_ERROR,
                    Error::remote_protocol("trailers without END_STREAM"),
                );
                return Ok(());
            }
            let _ = stream.body_tx.send(BodyEvent::End);
            self.streams.remove(&stream_id);
            return Ok(());
        }

        let head = match ResponseHead::from_fields(fields, HttpVersion::Http2) {
            Ok(head) => head,
            Err(e) => {
                self.reset_stream(stream_id, error_code::PROTOCOL_ERROR, e);
                return Ok(());
            }
        };
        if head.is_informational() {
            return Ok(());
        }
        if let Some(tx) = stream.head_tx.take() {
            let _ = tx.send(Ok(head));
        }
        if end_stream {
            let _ = stream.body_tx.send(BodyEvent::End);
            self.streams.remove(&stream_id);
        }
        Ok(())
    }

    fn on_data(&mut self, stream_id: u32, end_stream: bool, data: Bytes, flow_len: u32) -> Result<()> {
        self.conn_recv_window -= flow_len as i64;
        if self.conn_recv_window < 0 {
            return Err(Error::remote_protocol(
                "peer exceeded connection window (FLOW_CONTROL_ERROR)",
            ));
        }
        // padding never reaches the consumer, credit it right away
        let padding = flow_len - data.len() as u32;

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            // stream we already reset; its bytes still count against the connection
            self.conn_recv_unacked += flow_len;
            return Ok(());
        };
        self.conn_recv_unacked += padding;
        stream.recv_window -= flow_len as i64;
        stream.recv_unacked += padding;
        if stream.recv_window < 0 {
            self.reset_stream(
                stream_id,
                error_code::FLOW_CONTROL_ERROR,
                Error::remote_protocol("peer exceeded stream window (FLOW_CONTROL_ERROR)"),
            );
            return Ok(());
        }
        if stream.head_tx.is_some() {
            self.reset_stream(
                stream_id,
                error_code::PROTOCOL_ERROR,
                Error::remote_protocol("DATA before response headers"),
            );
            return Ok(());
        }
        if !data.is_empty() {
            let len = data.len() as u32;
            // receiver closed: the consumer will never read or credit these
            if stream.body_tx.send(BodyEvent::Data(data)).is_err() {
                self.conn_recv_unacked += len;
            }
        }
        if end_stream {
            stream.remote_closed = true;
            let _ = stream.body_tx.send(BodyEvent::End);
            self.streams.remove(&stream_id);
        }
        Ok(())
    }

    fn reset_stream(&mut self, stream_id: u32, code: u32, err: Error) {
        if let Some(mut stream) = self.streams.remove(&stream_id) {
            tracing::debug!(stream_id, error = %err, "resetting HTTP/2 stream");
            frame::encode_rst_stream(stream_id, code, &mut self.out);
            stream.fail(err);
        }
    }

    /// Move queued request body bytes out as far as the windows allow.
    fn send_pending_data(&mut self) {
        let mut ids: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| !s.pending.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        for id in ids {
            let Some(stream) = self.streams.get_mut(&id) else {
                continue;
            };
            while !stream.pending.is_empty() {
                let allowed = stream
                    .send_window
                    .min(self.conn_send_window)
                    .min(self.peer_max_frame_size as i64);
                if allowed <= 0 {
                    break;
                }
                let n = (allowed as usize).min(stream.pending.len());
                let chunk = stream.pending.split_to(n);
                let end_stream = stream.pending.is_empty();
                frame::encode_data(id, &chunk, end_stream, &mut self.out);
                stream.send_window -= n as i64;
                self.conn_send_window -= n as i64;
            }
        }
    }
}

async fn read_loop<S>(mut read: ReadHalf<S>, max_frame_size: u32, tx: mpsc::Sender<Result<Frame>>)
where
    S: AsyncRead,
{
    loop {
        let res = frame::read_frame(&mut read, max_frame_size).await;
        let failed = res.is_err();
        if tx.send(res).await.is_err() || failed {
            break;
        }
    }
}
