//! HTTP/2 with full control over what the client puts on the wire.
//!
//! The h2 crate fixes its own SETTINGS order, initial WINDOW_UPDATE and
//! pseudo-header order, all of which feed the Akamai HTTP/2 fingerprint.
//! This implementation takes them from the browser profile instead:
//!
//! - preface, then SETTINGS in profile order, then the connection
//!   WINDOW_UPDATE, all in one write
//! - request pseudo-headers in the profile's order
//! - HPACK without dynamic-table insertions
//!
//! A driver task owns the connection; [`H2Handle`] is cheap to clone and
//! opens streams on it.

mod driver;
pub mod frame;
mod handle;
pub mod hpack;
mod huffman;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

pub use handle::{H2Handle, H2Stream};

use crate::error::{classify_io, Error, Result, TransportPhase};
use crate::fingerprint::Http2Profile;
use crate::timeouts::within;
use driver::{DriverConfig, H2Driver};

/// Write the client preface and spawn the connection driver.
///
/// The server's SETTINGS are not awaited; like browsers, the first request
/// can follow the preface immediately.
pub async fn handshake<S>(
    mut stream: S,
    profile: &Http2Profile,
    write_timeout: Option<Duration>,
) -> Result<H2Handle>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut preface = BytesMut::with_capacity(128);
    preface.extend_from_slice(frame::CONNECTION_PREFACE);
    frame::encode_settings(profile.settings, &mut preface);
    if profile.window_update > 0 {
        frame::encode_window_update(0, profile.window_update, &mut preface);
    }
    within(write_timeout, Error::write_timeout, async {
        stream
            .write_all(&preface)
            .await
            .map_err(|e| classify_io(e, TransportPhase::Write))?;
        stream
            .flush()
            .await
            .map_err(|e| classify_io(e, TransportPhase::Write))
    })
    .await?;
    tracing::debug!(akamai = %profile.akamai_string(), "HTTP/2 preface sent");

    let (read, write) = tokio::io::split(stream);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(handle::Shared::new());
    let config = DriverConfig::from_profile(profile, write_timeout);
    let driver = H2Driver::new(read, write, config, command_rx, shared.clone());
    tokio::spawn(driver.drive());
    Ok(H2Handle::new(command_tx, shared))
}
