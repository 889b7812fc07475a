//! HTTP/2 connection handle and per-request stream.
//!
//! The handle sends commands to the driver task; every request gets its own
//! [`H2Stream`] fed through channels, so many requests share one connection
//! without blocking each other.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::driver::DriverCommand;
use crate::error::{Error, Result};
use crate::timeouts::within;
use crate::transport::{BodyEvent, ResponseHead, WireRequest};

/// Largest client-initiated stream id.
const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// State shared between the handles and the driver.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) closed: AtomicBool,
    pub(crate) max_concurrent_streams: AtomicU32,
    next_stream_id: Mutex<u32>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            // unlimited until the peer says otherwise; browsers start at 100
            max_concurrent_streams: AtomicU32::new(100),
            next_stream_id: Mutex::new(1),
        }
    }
}

/// Cloneable handle to one HTTP/2 connection.
#[derive(Debug, Clone)]
pub struct H2Handle {
    commands: mpsc::UnboundedSender<DriverCommand>,
    shared: Arc<Shared>,
}

impl H2Handle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<DriverCommand>, shared: Arc<Shared>) -> Self {
        Self { commands, shared }
    }

    /// Open a stream and queue the request on it.
    pub fn send(&self, request: &WireRequest) -> Result<H2Stream> {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();

        // ids must hit the wire in increasing order, so allocate and enqueue
        // under the same lock
        let mut next = self
            .shared
            .next_stream_id
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let stream_id = *next;
        if stream_id > MAX_STREAM_ID {
            self.shared.closed.store(true, Ordering::Release);
            return Err(Error::local_protocol("HTTP/2 stream ids exhausted"));
        }
        self.commands
            .send(DriverCommand::Open {
                stream_id,
                request: request.clone(),
                head_tx,
                body_tx,
            })
            .map_err(|_| Error::read("HTTP/2 connection is closed"))?;
        *next += 2;
        drop(next);

        Ok(H2Stream {
            stream_id,
            commands: self.commands.clone(),
            head_rx: Some(head_rx),
            body_rx,
            done: false,
        })
    }

    /// GOAWAY received or the driver is gone; no new streams.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.commands.is_closed()
    }

    /// Peer's SETTINGS_MAX_CONCURRENT_STREAMS.
    pub fn max_concurrent_streams(&self) -> u32 {
        self.shared.max_concurrent_streams.load(Ordering::Acquire)
    }
}

/// One request/response stream.
#[derive(Debug)]
pub struct H2Stream {
    stream_id: u32,
    commands: mpsc::UnboundedSender<DriverCommand>,
    head_rx: Option<oneshot::Receiver<Result<ResponseHead>>>,
    body_rx: mpsc::UnboundedReceiver<BodyEvent>,
    done: bool,
}

impl H2Stream {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub async fn receive_headers(&mut self, read_timeout: Option<Duration>) -> Result<ResponseHead> {
        let rx = self
            .head_rx
            .take()
            .ok_or_else(|| Error::local_protocol("response headers already received"))?;
        within(read_timeout, Error::read_timeout, async {
            rx.await
                .map_err(|_| Error::read("HTTP/2 connection closed before response headers"))?
        })
        .await
    }

    pub async fn receive_chunk(&mut self, read_timeout: Option<Duration>) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let event = within(read_timeout, Error::read_timeout, async {
            Ok(self.body_rx.recv().await)
        })
        .await?;
        match event {
            Some(BodyEvent::Data(data)) => {
                // hand the window back once the caller has the bytes
                let _ = self.commands.send(DriverCommand::Consumed {
                    stream_id: self.stream_id,
                    len: data.len() as u32,
                });
                Ok(Some(data))
            }
            Some(BodyEvent::End) => {
                self.done = true;
                Ok(None)
            }
            Some(BodyEvent::Error(e)) => {
                self.done = true;
                Err(e)
            }
            None => {
                self.done = true;
                Err(Error::read("HTTP/2 connection closed mid-body"))
            }
        }
    }

    /// Reset the stream if the response has not completed. Idempotent.
    ///
    /// Body bytes already queued for this stream are handed back to the
    /// connection window, so a shared connection does not shrink each time a
    /// caller abandons a body.
    pub fn close(&mut self) {
        // later DATA fails to send and is credited by the driver instead
        self.body_rx.close();
        let mut buffered = 0u32;
        while let Ok(event) = self.body_rx.try_recv() {
            if let BodyEvent::Data(data) = event {
                buffered = buffered.saturating_add(data.len() as u32);
            }
        }
        if !self.done || buffered > 0 {
            self.done = true;
            let _ = self.commands.send(DriverCommand::Reset {
                stream_id: self.stream_id,
                buffered,
            });
        }
    }
}

impl Drop for H2Stream {
    fn drop(&mut self) {
        self.close();
    }
}
