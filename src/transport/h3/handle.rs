//! HTTP/3 connection handle and per-request stream.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::driver::DriverCommand;
use crate::error::{Error, Result};
use crate::timeouts::within;
use crate::transport::{BodyEvent, ResponseHead, WireRequest};

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) closed: AtomicBool,
    pub(crate) max_concurrent_streams: AtomicU32,
    next_key: AtomicU64,
}

impl Shared {
    pub(crate) fn new(max_concurrent_streams: u32) -> Self {
        Self {
            closed: AtomicBool::new(false),
            max_concurrent_streams: AtomicU32::new(max_concurrent_streams),
            next_key: AtomicU64::new(0),
        }
    }
}

/// Cloneable handle to one QUIC connection.
#[derive(Debug, Clone)]
pub struct H3Handle {
    commands: mpsc::UnboundedSender<DriverCommand>,
    shared: Arc<Shared>,
}

impl H3Handle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<DriverCommand>, shared: Arc<Shared>) -> Self {
        Self { commands, shared }
    }

    /// Queue a request on a new stream. QUIC stream ids are assigned by the
    /// driver; the stream is addressed by a local key until then.
    pub fn send(&self, request: &WireRequest) -> Result<H3Stream> {
        let key = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        self.commands
            .send(DriverCommand::Open {
                key,
                request: request.clone(),
                head_tx,
                body_tx,
            })
            .map_err(|_| Error::read("QUIC connection is closed"))?;
        Ok(H3Stream {
            key,
            commands: self.commands.clone(),
            head_rx: Some(head_rx),
            body_rx,
            done: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.commands.is_closed()
    }

    pub fn max_concurrent_streams(&self) -> u32 {
        self.shared.max_concurrent_streams.load(Ordering::Acquire)
    }
}

/// One HTTP/3 request stream.
#[derive(Debug)]
pub struct H3Stream {
    key: u64,
    commands: mpsc::UnboundedSender<DriverCommand>,
    head_rx: Option<oneshot::Receiver<Result<ResponseHead>>>,
    body_rx: mpsc::UnboundedReceiver<BodyEvent>,
    done: bool,
}

impl H3Stream {
    pub async fn receive_headers(&mut self, read_timeout: Option<Duration>) -> Result<ResponseHead> {
        let rx = self
            .head_rx
            .take()
            .ok_or_else(|| Error::local_protocol("response headers already received"))?;
        within(read_timeout, Error::read_timeout, async {
            rx.await
                .map_err(|_| Error::read("QUIC connection closed before response headers"))?
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
                // lets the driver read further once the channel drains
                let _ = self.commands.send(DriverCommand::Consumed {
                    key: self.key,
                    len: data.len(),
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
                Err(Error::read("QUIC connection closed mid-body"))
            }
        }
    }

    /// Cancel the stream unless it completed. Idempotent.
    pub fn close(&mut self) {
        if !self.done {
            self.done = true;
            let _ = self.commands.send(DriverCommand::Reset { key: self.key });
        }
    }
}

impl Drop for H3Stream {
    fn drop(&mut self) {
        self.close();
    }
}
