//! Incremental `Content-Encoding` and charset decoding.
//!
//! Each coding runs as a write-side decoder over a `Vec<u8>` sink so body
//! chunks are decoded as they arrive, whether the caller materializes the
//! body or iterates it.

use std::io::Write;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::headers::Headers;

enum Stage {
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Zlib(flate2::write::ZlibDecoder<Vec<u8>>),
    RawDeflate(flate2::write::DeflateDecoder<Vec<u8>>),
    /// `deflate` is sent both zlib-wrapped and raw; decided on the first bytes.
    Deflate(Vec<u8>),
    Brotli(Box<brotli::DecompressorWriter<Vec<u8>>>),
    Zstd(zstd::stream::write::Decoder<'static, Vec<u8>>),
}

impl Stage {
    fn for_coding(coding: &str) -> Result<Option<Stage>> {
        let stage = match coding {
            "gzip" | "x-gzip" => Stage::Gzip(flate2::write::GzDecoder::new(Vec::new())),
            "deflate" => Stage::Deflate(Vec::new()),
            "br" => Stage::Brotli(Box::new(brotli::DecompressorWriter::new(Vec::new(), 4096))),
            "zstd" => Stage::Zstd(
                zstd::stream::write::Decoder::new(Vec::new())
                    .map_err(|e| Error::decoding(format!("zstd: {}", e)))?,
            ),
            "identity" | "" => return Ok(None),
            other => {
                tracing::debug!(coding = other, "unknown content-coding passed through");
                return Ok(None);
            }
        };
        Ok(Some(stage))
    }

    fn name(&self) -> &'static str {
        match self {
            Stage::Gzip(_) => "gzip",
            Stage::Zlib(_) | Stage::RawDeflate(_) | Stage::Deflate(_) => "deflate",
            Stage::Brotli(_) => "br",
            Stage::Zstd(_) => "zstd",
        }
    }

    fn write(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let name = self.name();
        let fail = |e: std::io::Error| Error::decoding(format!("{}: {}", name, e)).with_source(e);
        match self {
            Stage::Gzip(d) => {
                d.write_all(input).map_err(fail)?;
                Ok(std::mem::take(d.get_mut()))
            }
            Stage::Zlib(d) => {
                d.write_all(input).map_err(fail)?;
                Ok(std::mem::take(d.get_mut()))
            }
            Stage::RawDeflate(d) => {
                d.write_all(input).map_err(fail)?;
                Ok(std::mem::take(d.get_mut()))
            }
            Stage::Brotli(d) => {
                d.write_all(input).map_err(fail)?;
                Ok(std::mem::take(d.get_mut()))
            }
            Stage::Zstd(d) => {
                d.write_all(input).map_err(fail)?;
                Ok(std::mem::take(d.get_mut()))
            }
            Stage::Deflate(pending) => {
                pending.extend_from_slice(input);
                if pending.len() < 2 {
                    return Ok(Vec::new());
                }
                let head = std::mem::take(pending);
                *self = if is_zlib_header(head[0], head[1]) {
                    Stage::Zlib(flate2::write::ZlibDecoder::new(Vec::new()))
                } else {
                    Stage::RawDeflate(flate2::write::DeflateDecoder::new(Vec::new()))
                };
                self.write(&head)
            }
        }
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        let name = self.name();
        let fail = |e: std::io::Error| Error::decoding(format!("{}: {}", name, e)).with_source(e);
        match self {
            Stage::Gzip(d) => {
                d.try_finish().map_err(fail)?;
                Ok(std::mem::take(d.get_mut()))
            }
            Stage::Zlib(d) => {
                d.try_finish().map_err(fail)?;
                Ok(std::mem::take(d.get_mut()))
            }
            Stage::RawDeflate(d) => {
                d.try_finish().map_err(fail)?;
                Ok(std::mem::take(d.get_mut()))
            }
            Stage::Brotli(d) => {
                d.close().map_err(fail)?;
                Ok(std::mem::take(d.get_mut()))
            }
            Stage::Zstd(d) => {
                d.flush().map_err(fail)?;
                Ok(std::mem::take(d.get_mut()))
            }
            Stage::Deflate(pending) if pending.is_empty() => Ok(Vec::new()),
            Stage::Deflate(_) => Err(Error::decoding("deflate: truncated stream")),
        }
    }
}

fn is_zlib_header(cmf: u8, flg: u8) -> bool {
    cmf & 0x0f == 8 && (u16::from(cmf) << 8 | u16::from(flg)) % 31 == 0
}

/// Decoder for one response body.
pub(crate) struct ContentDecoder {
    /// In decoding order: the last listed coding is undone first.
    stages: Vec<Stage>,
}

impl std::fmt::Debug for ContentDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(Stage::name).collect();
        f.debug_struct("ContentDecoder").field("stages", &names).finish()
    }
}

impl ContentDecoder {
    pub(crate) fn from_headers(headers: &Headers) -> Result<Self> {
        let mut stages = Vec::new();
        for value in headers.get_all("content-encoding") {
            for coding in value.split(',') {
                if let Some(stage) = Stage::for_coding(&coding.trim().to_ascii_lowercase())? {
                    stages.push(stage);
                }
            }
        }
        stages.reverse();
        Ok(Self { stages })
    }

    pub(crate) fn is_identity(&self) -> bool {
        self.stages.is_empty()
    }

    /// Decode one wire chunk; may return nothing while a decoder buffers.
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> Result<Bytes> {
        if self.stages.is_empty() {
            return Ok(Bytes::copy_from_slice(chunk));
        }
        let mut data = chunk.to_vec();
        for stage in &mut self.stages {
            if data.is_empty() {
                break;
            }
            data = stage.write(&data)?;
        }
        Ok(Bytes::from(data))
    }

    /// Flush every stage at the end of the body.
    pub(crate) fn finish(&mut self) -> Result<Bytes> {
        let mut carry = Vec::new();
        for stage in &mut self.stages {
            let mut out = if carry.is_empty() {
                Vec::new()
            } else {
                stage.write(&carry)?
            };
            out.extend(stage.finish()?);
            carry = out;
        }
        Ok(Bytes::from(carry))
    }
}

/// `charset` parameter of a `Content-Type` value.
pub(crate) fn charset_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// Pick the text encoding for a body: explicit override, then the
/// `Content-Type` charset, then a BOM or valid UTF-8, then `fallback`.
pub(crate) fn resolve_encoding(
    explicit: Option<&str>,
    content_type: Option<&str>,
    body: &[u8],
    fallback: &str,
) -> Result<&'static encoding_rs::Encoding> {
    if let Some(label) = explicit {
        return encoding_rs::Encoding::for_label(label.as_bytes())
            .ok_or_else(|| Error::decoding(format!("unknown encoding {:?}", label)));
    }
    if let Some(enc) = content_type
        .and_then(charset_param)
        .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()))
    {
        return Ok(enc);
    }
    if let Some((enc, _)) = encoding_rs::Encoding::for_bom(body) {
        return Ok(enc);
    }
    if std::str::from_utf8(body).is_ok() {
        return Ok(encoding_rs::UTF_8);
    }
    Ok(encoding_rs::Encoding::for_label(fallback.as_bytes()).unwrap_or(encoding_rs::UTF_8))
}
