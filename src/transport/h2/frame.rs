//! HTTP/2 frame types and binary serialization (RFC 9113 section 4 and 6).
//!
//! Frames are encoded by hand so that the order and content of everything
//! the client writes (preface SETTINGS, WINDOW_UPDATE, HEADERS) is exactly
//! what the browser profile dictates.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{classify_io, Error, Result, TransportPhase};

/// Frame header size (9 bytes per RFC 9113).
pub const FRAME_HEADER_SIZE: usize = 9;

/// HTTP/2 connection preface (client must send this first).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Largest legal window size (2^31 - 1).
pub const MAX_WINDOW_SIZE: i64 = 0x7fff_ffff;

/// Frame type identifiers per RFC 9113.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        match ft {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(v) => v,
        }
    }
}

/// Frame flags.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1; // same bit, SETTINGS/PING context
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// HTTP/2 error codes per RFC 9113 section 7.
pub mod error_code {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const INTERNAL_ERROR: u32 = 0x2;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const STREAM_CLOSED: u32 = 0x5;
    pub const FRAME_SIZE_ERROR: u32 = 0x6;
    pub const REFUSED_STREAM: u32 = 0x7;
    pub const CANCEL: u32 = 0x8;
    pub const COMPRESSION_ERROR: u32 = 0x9;

    pub fn name(code: u32) -> &'static str {
        match code {
            0x0 => "NO_ERROR",
            0x1 => "PROTOCOL_ERROR",
            0x2 => "INTERNAL_ERROR",
            0x3 => "FLOW_CONTROL_ERROR",
            0x4 => "SETTINGS_TIMEOUT",
            0x5 => "STREAM_CLOSED",
            0x6 => "FRAME_SIZE_ERROR",
            0x7 => "REFUSED_STREAM",
            0x8 => "CANCEL",
            0x9 => "COMPRESSION_ERROR",
            0xa => "CONNECT_ERROR",
            0xb => "ENHANCE_YOUR_CALM",
            0xc => "INADEQUATE_SECURITY",
            0xd => "HTTP_1_1_REQUIRED",
            _ => "UNKNOWN",
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32);
        // high bit of the stream id is reserved and ignored on receipt
        let stream_id = u32::from_be_bytes([buf[5] & 0x7f, buf[6], buf[7], buf[8]]);
        Self {
            length,
            frame_type: FrameType::from(buf[3]),
            flags: buf[4],
            stream_id,
        }
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u8((self.length >> 8) as u8);
        buf.put_u8(self.length as u8);
        buf.put_u8(self.frame_type.into());
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id & 0x7fff_ffff);
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        end_stream: bool,
        data: Bytes,
        /// Full payload length including padding; this is what counts
        /// against flow-control windows.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        block: Bytes,
    },
    Continuation {
        stream_id: u32,
        end_headers: bool,
        block: Bytes,
    },
    RstStream {
        stream_id: u32,
        error_code: u32,
    },
    Settings {
        ack: bool,
        settings: Vec<(u16, u32)>,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: u32,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    PushPromise {
        stream_id: u32,
    },
    Priority {
        stream_id: u32,
    },
    Unknown {
        frame_type: u8,
    },
}

impl Frame {
    /// Decode one frame payload. Violations are the peer's fault.
    pub fn parse(header: FrameHeader, mut payload: Bytes) -> Result<Frame> {
        let FrameHeader {
            frame_type,
            flags: frame_flags,
            stream_id,
            ..
        } = header;
        let frame = match frame_type {
            FrameType::Data => {
                require_stream(stream_id, "DATA")?;
                let flow_len = payload.len() as u32;
                let data = strip_padding(frame_flags, payload)?;
                Frame::Data {
                    stream_id,
                    end_stream: frame_flags & flags::END_STREAM != 0,
                    data,
                    flow_len,
                }
            }
            FrameType::Headers => {
                require_stream(stream_id, "HEADERS")?;
                let mut block = strip_padding(frame_flags, payload)?;
                if frame_flags & flags::PRIORITY != 0 {
                    if block.len() < 5 {
                        return Err(frame_size("HEADERS priority block"));
                    }
                    block.advance(5);
                }
                Frame::Headers {
                    stream_id,
                    end_stream: frame_flags & flags::END_STREAM != 0,
                    end_headers: frame_flags & flags::END_HEADERS != 0,
                    block,
                }
            }
            FrameType::Continuation => {
                require_stream(stream_id, "CONTINUATION")?;
                Frame::Continuation {
                    stream_id,
                    end_headers: frame_flags & flags::END_HEADERS != 0,
                    block: payload,
                }
            }
            FrameType::RstStream => {
                require_stream(stream_id, "RST_STREAM")?;
                if payload.len() != 4 {
                    return Err(frame_size("RST_STREAM"));
                }
                Frame::RstStream {
                    stream_id,
                    error_code: payload.get_u32(),
                }
            }
            FrameType::Settings => {
                if stream_id != 0 {
                    return Err(Error::remote_protocol("SETTINGS frame on a stream"));
                }
                let ack = frame_flags & flags::ACK != 0;
                if payload.len() % 6 != 0 || (ack && !payload.is_empty()) {
                    return Err(frame_size("SETTINGS"));
                }
                let mut settings = Vec::with_capacity(payload.len() / 6);
                while payload.remaining() >= 6 {
                    settings.push((payload.get_u16(), payload.get_u32()));
                }
                Frame::Settings { ack, settings }
            }
            FrameType::Ping => {
                if payload.len() != 8 {
                    return Err(frame_size("PING"));
                }
                let mut data = [0u8; 8];
                payload.copy_to_slice(&mut data);
                Frame::Ping {
                    ack: frame_flags & flags::ACK != 0,
                    payload: data,
                }
            }
            FrameType::GoAway => {
                if payload.len() < 8 {
                    return Err(frame_size("GOAWAY"));
                }
                let last_stream_id = payload.get_u32() & 0x7fff_ffff;
                let error_code = payload.get_u32();
                Frame::GoAway {
                    last_stream_id,
                    error_code,
                    debug_data: payload,
                }
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(frame_size("WINDOW_UPDATE"));
                }
                let increment = payload.get_u32() & 0x7fff_ffff;
                if increment == 0 {
                    return Err(Error::remote_protocol("WINDOW_UPDATE with zero increment"));
                }
                Frame::WindowUpdate {
                    stream_id,
                    increment,
                }
            }
            FrameType::PushPromise => Frame::PushPromise { stream_id },
            FrameType::Priority => Frame::Priority { stream_id },
            FrameType::Unknown(t) => Frame::Unknown { frame_type: t },
        };
        Ok(frame)
    }
}

fn require_stream(stream_id: u32, what: &str) -> Result<()> {
    if stream_id == 0 {
        return Err(Error::remote_protocol(format!("{} frame on stream 0", what)));
    }
    Ok(())
}

fn frame_size(what: &str) -> Error {
    Error::remote_protocol(format!("malformed {} frame (FRAME_SIZE_ERROR)", what))
}

fn strip_padding(frame_flags: u8, mut payload: Bytes) -> Result<Bytes> {
    if frame_flags & flags::PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(frame_size("padded"));
    }
    let pad = payload.get_u8() as usize;
    if pad > payload.len() {
        return Err(Error::remote_protocol("padding exceeds frame payload"));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

/// Read one frame, rejecting payloads above `max_frame_size`.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: u32) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; FRAME_HEADER_SIZE];
    reader
        .read_exact(&mut head)
        .await
        .map_err(|e| classify_io(e, TransportPhase::Read))?;
    let header = FrameHeader::parse(&head);
    if header.length > max_frame_size {
        return Err(Error::remote_protocol(format!(
            "frame of {} bytes exceeds SETTINGS_MAX_FRAME_SIZE {}",
            header.length, max_frame_size
        )));
    }
    let mut payload = BytesMut::zeroed(header.length as usize);
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| classify_io(e, TransportPhase::Read))?;
    Frame::parse(header, payload.freeze())
}

fn put_header(buf: &mut BytesMut, length: usize, frame_type: FrameType, frame_flags: u8, stream_id: u32) {
    FrameHeader {
        length: length as u32,
        frame_type,
        flags: frame_flags,
        stream_id,
    }
    .serialize(buf);
}

/// SETTINGS in the given order.
pub fn encode_settings(settings: &[(u16, u32)], buf: &mut BytesMut) {
    put_header(buf, settings.len() * 6, FrameType::Settings, 0, 0);
    for (id, value) in settings {
        buf.put_u16(*id);
        buf.put_u32(*value);
    }
}

pub fn encode_settings_ack(buf: &mut BytesMut) {
    put_header(buf, 0, FrameType::Settings, flags::ACK, 0);
}

pub fn encode_window_update(stream_id: u32, increment: u32, buf: &mut BytesMut) {
    put_header(buf, 4, FrameType::WindowUpdate, 0, stream_id);
    buf.put_u32(increment & 0x7fff_ffff);
}

pub fn encode_ping_ack(payload: [u8; 8], buf: &mut BytesMut) {
    put_header(buf, 8, FrameType::Ping, flags::ACK, 0);
    buf.put_slice(&payload);
}

pub fn encode_rst_stream(stream_id: u32, error_code: u32, buf: &mut BytesMut) {
    put_header(buf, 4, FrameType::RstStream, 0, stream_id);
    buf.put_u32(error_code);
}

pub fn encode_goaway(last_stream_id: u32, error_code: u32, buf: &mut BytesMut) {
    put_header(buf, 8, FrameType::GoAway, 0, 0);
    buf.put_u32(last_stream_id & 0x7fff_ffff);
    buf.put_u32(error_code);
}

pub fn encode_data(stream_id: u32, data: &[u8], end_stream: bool, buf: &mut BytesMut) {
    let frame_flags = if end_stream { flags::END_STREAM } else { 0 };
    put_header(buf, data.len(), FrameType::Data, frame_flags, stream_id);
    buf.put_slice(data);
}

/// HEADERS followed by as many CONTINUATION frames as `max_frame_size`
/// requires. END_STREAM goes on the HEADERS frame, END_HEADERS on the last.
pub fn encode_headers(
    stream_id: u32,
    block: &[u8],
    end_stream: bool,
    max_frame_size: usize,
    buf: &mut BytesMut,
) {
    let max = max_frame_size.max(1);
    let mut chunks = block.chunks(max).peekable();
    let first = chunks.next().unwrap_or(&[]);
    let mut frame_flags = if end_stream { flags::END_STREAM } else { 0 };
    if chunks.peek().is_none() {
        frame_flags |= flags::END_HEADERS;
    }
    put_header(buf, first.len(), FrameType::Headers, frame_flags, stream_id);
    buf.put_slice(first);
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        let frame_flags = if last { flags::END_HEADERS } else { 0 };
        put_header(buf, chunk.len(), FrameType::Continuation, frame_flags, stream_id);
        buf.put_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reparse(buf: &[u8]) -> Frame {
        let head: [u8; FRAME_HEADER_SIZE] = buf[..FRAME_HEADER_SIZE].try_into().unwrap();
        let header = FrameHeader::parse(&head);
        assert_eq!(header.length as usize, buf.len() - FRAME_HEADER_SIZE);
        Frame::parse(header, Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..])).unwrap()
    }

    #[test]
    fn test_settings_keep_order() {
        let mut buf = BytesMut::new();
        encode_settings(&[(1, 65536), (2, 0), (4, 6291456), (6, 262144)], &mut buf);
        assert_eq!(&buf[..9], &[0, 0, 24, 4, 0, 0, 0, 0, 0]);
        assert_eq!(
            reparse(&buf),
            Frame::Settings {
                ack: false,
                settings: vec![(1, 65536), (2, 0), (4, 6291456), (6, 262144)],
            }
        );
    }

    #[test]
    fn test_window_update_bytes() {
        let mut buf = BytesMut::new();
        encode_window_update(0, 15663105, &mut buf);
        assert_eq!(&buf[..], &[0, 0, 4, 8, 0, 0, 0, 0, 0, 0x00, 0xef, 0x00, 0x01]);
    }

    #[test]
    fn test_headers_split_into_continuation() {
        let block = vec![0xaa; 25];
        let mut buf = BytesMut::new();
        encode_headers(1, &block, true, 10, &mut buf);

        // HEADERS(10, END_STREAM) + CONTINUATION(10) + CONTINUATION(5, END_HEADERS)
        assert_eq!(buf.len(), 3 * FRAME_HEADER_SIZE + 25);
        assert_eq!(buf[3], 0x1);
        assert_eq!(buf[4], flags::END_STREAM);
        let second = FRAME_HEADER_SIZE + 10;
        assert_eq!(buf[second + 3], 0x9);
        assert_eq!(buf[second + 4], 0);
        let third = second + FRAME_HEADER_SIZE + 10;
        assert_eq!(buf[third + 4], flags::END_HEADERS);
    }

    #[test]
    fn test_padded_data_counts_full_length() {
        // PADDED with pad length 2: [2, 'h', 'i', 0, 0]
        let header = FrameHeader {
            length: 5,
            frame_type: FrameType::Data,
            flags: flags::PADDED | flags::END_STREAM,
            stream_id: 3,
        };
        let frame = Frame::parse(header, Bytes::from_static(&[2, b'h', b'i', 0, 0])).unwrap();
        assert_eq!(
            frame,
            Frame::Data {
                stream_id: 3,
                end_stream: true,
                data: Bytes::from_static(b"hi"),
                flow_len: 5,
            }
        );
    }

    #[test]
    fn test_zero_window_increment_rejected() {
        let header = FrameHeader {
            length: 4,
            frame_type: FrameType::WindowUpdate,
            flags: 0,
            stream_id: 0,
        };
        let err = Frame::parse(header, Bytes::from_static(&[0, 0, 0, 0])).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RemoteProtocolError);
    }

    #[tokio::test]
    async fn test_read_frame_enforces_max_size() {
        let mut wire: &[u8] = &[0, 0x40, 0x01, 0, 0, 0, 0, 0, 1];
        let err = read_frame(&mut wire, 16384).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RemoteProtocolError);
    }
}
