//! TLS ClientHello fingerprint configuration (JA3).
//!
//! Profiles store IANA code points so the JA3 string can be reproduced from
//! the table alone. [`build_tls_config`] turns a profile into a BoringSSL
//! connector; [`build_quic_config`] does the same for QUIC.
//!
//! BoringSSL does not allow reordering TLS 1.3 suites, so only the TLS 1.2
//! part of the cipher list is handed to `set_cipher_list`. Extension order is
//! whatever BoringSSL emits with permutation turned off, which keeps the
//! ClientHello identical across connections.

use std::io::Read;
use std::os::raw::c_int;

use boring::ssl::{
    SslConnector, SslContextBuilder, SslMethod, SslSessionCacheMode, SslVerifyMode, SslVersion,
};
use boring::x509::X509;
use boring_sys::{CRYPTO_BUFFER, SSL, SSL_CTX};

use super::profiles::{BrowserProfile, QuicProfile};
use crate::error::{Error, Result};

extern "C" {
    fn SSL_CTX_set_grease_enabled(ctx: *mut SSL_CTX, enabled: c_int);
    fn SSL_CTX_set_permute_extensions(ctx: *mut SSL_CTX, enabled: c_int);
}

/// Certificate compression algorithm advertised in `compress_certificate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertCompression {
    None,
    Brotli,
    Zlib,
}

/// ClientHello shape for one browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsProfile {
    /// Cipher suites in offer order (IANA ids, TLS 1.3 first).
    pub cipher_suites: &'static [u16],
    /// Extensions in ClientHello order (IANA ids, GREASE excluded).
    pub extensions: &'static [u16],
    /// Supported groups in order (IANA ids).
    pub curves: &'static [u16],
    pub point_formats: &'static [u8],
    /// Signature algorithms in BoringSSL naming.
    pub sigalgs: &'static [&'static str],
    pub grease: bool,
    pub cert_compression: CertCompression,
    /// ALPN offer for TCP connections, in preference order.
    pub alpn: &'static [&'static str],
}

const TLS_VERSION_12: u16 = 771;

impl TlsProfile {
    /// BoringSSL cipher string for the TLS 1.2 suites of this profile.
    pub fn cipher_string(&self) -> String {
        let names: Vec<&str> = self.cipher_suites.iter().filter_map(|&id| cipher_name(id)).collect();
        names.join(":")
    }

    /// BoringSSL group list; groups BoringSSL does not implement are skipped.
    pub fn curves_string(&self) -> String {
        let names: Vec<&str> = self.curves.iter().filter_map(|&id| curve_name(id)).collect();
        names.join(":")
    }

    /// JA3 string: `version,ciphers,extensions,curves,point_formats`.
    pub fn ja3_string(&self) -> String {
        fn join<T: ToString>(items: &[T]) -> String {
            items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("-")
        }
        format!(
            "{},{},{},{},{}",
            TLS_VERSION_12,
            join(self.cipher_suites),
            join(self.extensions),
            join(self.curves),
            join(self.point_formats)
        )
    }
}

/// Encode an ALPN list in wire format (length-prefixed).
pub fn alpn_wire(protocols: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in protocols {
        out.push(p.len() as u8);
        out.extend_from_slice(p.as_bytes());
    }
    out
}

/// OpenSSL-style name of a TLS 1.2 suite. TLS 1.3 suites return `None`.
pub fn cipher_name(id: u16) -> Option<&'static str> {
    Some(match id {
        0xc02b => "ECDHE-ECDSA-AES128-GCM-SHA256",
        0xc02f => "ECDHE-RSA-AES128-GCM-SHA256",
        0xc02c => "ECDHE-ECDSA-AES256-GCM-SHA384",
        0xc030 => "ECDHE-RSA-AES256-GCM-SHA384",
        0xcca9 => "ECDHE-ECDSA-CHACHA20-POLY1305",
        0xcca8 => "ECDHE-RSA-CHACHA20-POLY1305",
        0xc009 => "ECDHE-ECDSA-AES128-SHA",
        0xc00a => "ECDHE-ECDSA-AES256-SHA",
        0xc013 => "ECDHE-RSA-AES128-SHA",
        0xc014 => "ECDHE-RSA-AES256-SHA",
        0xc008 => "ECDHE-ECDSA-DES-CBC3-SHA",
        0xc012 => "ECDHE-RSA-DES-CBC3-SHA",
        0x009c => "AES128-GCM-SHA256",
        0x009d => "AES256-GCM-SHA384",
        0x002f => "AES128-SHA",
        0x0035 => "AES256-SHA",
        0x000a => "DES-CBC3-SHA",
        _ => return None,
    })
}

/// BoringSSL name of a supported group.
pub fn curve_name(id: u16) -> Option<&'static str> {
    Some(match id {
        29 => "X25519",
        23 => "P-256",
        24 => "P-384",
        25 => "P-521",
        _ => return None,
    })
}

/// Immutable TLS client configuration for one profile.
#[derive(Clone)]
pub struct TlsConfig {
    connector: SslConnector,
    alpn_wire: Vec<u8>,
    cipher_string: String,
    verify: bool,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("cipher_string", &self.cipher_string)
            .field("verify", &self.verify)
            .finish()
    }
}

impl TlsConfig {
    pub fn connector(&self) -> &SslConnector {
        &self.connector
    }

    /// ALPN offer in wire format.
    pub fn alpn_wire(&self) -> &[u8] {
        &self.alpn_wire
    }

    pub fn cipher_string(&self) -> &str {
        &self.cipher_string
    }

    pub fn verify(&self) -> bool {
        self.verify
    }
}

/// Build the TCP TLS configuration for `profile`.
///
/// `verify = false` only changes certificate validation; cipher, group and
/// extension configuration is identical either way.
pub fn build_tls_config(profile: &BrowserProfile, verify: bool, roots: &[Vec<u8>]) -> Result<TlsConfig> {
    let tls = &profile.tls;
    let mut builder = SslConnector::builder(SslMethod::tls_client())
        .map_err(|e| Error::configuration(format!("failed to create SSL connector: {}", e)))?;

    apply_fingerprint(&mut builder, tls)?;
    add_roots(&mut builder, roots)?;
    if !verify {
        builder.set_verify(SslVerifyMode::NONE);
    }

    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .map_err(|e| Error::configuration(format!("failed to set min TLS version: {}", e)))?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_3))
        .map_err(|e| Error::configuration(format!("failed to set max TLS version: {}", e)))?;

    // Browsers resume sessions; the cache only affects later handshakes.
    builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);

    let alpn_wire = alpn_wire(tls.alpn);
    builder
        .set_alpn_protos(&alpn_wire)
        .map_err(|e| Error::configuration(format!("failed to set ALPN: {}", e)))?;

    Ok(TlsConfig {
        connector: builder.build(),
        alpn_wire,
        cipher_string: tls.cipher_string(),
        verify,
    })
}

/// Build a QUIC configuration offering only `h3`.
pub fn build_quic_config(profile: &BrowserProfile, verify: bool, roots: &[Vec<u8>]) -> Result<quiche::Config> {
    let mut ctx = SslContextBuilder::new(SslMethod::tls_client())
        .map_err(|e| Error::configuration(format!("failed to create SSL context: {}", e)))?;
    apply_fingerprint(&mut ctx, &profile.tls)?;
    ctx.set_default_verify_paths()
        .map_err(|e| Error::configuration(format!("failed to load system roots: {}", e)))?;
    add_roots(&mut ctx, roots)?;

    let mut config = quiche::Config::with_boring_ssl_ctx_builder(quiche::PROTOCOL_VERSION, ctx)
        .map_err(|e| Error::configuration(format!("failed to create QUIC config: {}", e)))?;
    config
        .set_application_protos(quiche::h3::APPLICATION_PROTOCOL)
        .map_err(|e| Error::configuration(format!("failed to set ALPN: {}", e)))?;
    config.verify_peer(verify);
    apply_quic_params(&mut config, &profile.quic);
    Ok(config)
}

fn apply_quic_params(config: &mut quiche::Config, q: &QuicProfile) {
    config.set_max_idle_timeout(q.max_idle_timeout_ms);
    config.set_max_recv_udp_payload_size(65_535);
    config.set_max_send_udp_payload_size(q.max_udp_payload_size);
    config.set_initial_max_data(q.initial_max_data);
    config.set_initial_max_stream_data_bidi_local(q.initial_max_stream_data);
    config.set_initial_max_stream_data_bidi_remote(q.initial_max_stream_data);
    config.set_initial_max_stream_data_uni(q.initial_max_stream_data);
    config.set_initial_max_streams_bidi(q.initial_max_streams_bidi);
    config.set_initial_max_streams_uni(q.initial_max_streams_uni);
    config.set_disable_active_migration(true);
}

fn apply_fingerprint(builder: &mut SslContextBuilder, tls: &TlsProfile) -> Result<()> {
    let ciphers = tls.cipher_string();
    if !ciphers.is_empty() {
        builder
            .set_cipher_list(&ciphers)
            .map_err(|e| Error::configuration(format!("failed to set cipher list: {}", e)))?;
    }

    let curves = tls.curves_string();
    if !curves.is_empty() {
        builder
            .set_curves_list(&curves)
            .map_err(|e| Error::configuration(format!("failed to set curves: {}", e)))?;
    }

    if !tls.sigalgs.is_empty() {
        builder
            .set_sigalgs_list(&tls.sigalgs.join(":"))
            .map_err(|e| Error::configuration(format!("failed to set signature algorithms: {}", e)))?;
    }

    unsafe {
        let ctx = builder.as_ptr() as *mut SSL_CTX;
        SSL_CTX_set_grease_enabled(ctx, tls.grease as c_int);
        SSL_CTX_set_permute_extensions(ctx, 0);

        // Only decompression is registered: the client never sends certificates.
        match tls.cert_compression {
            CertCompression::Brotli => {
                boring_sys::SSL_CTX_add_cert_compression_alg(
                    ctx,
                    boring_sys::TLSEXT_cert_compression_brotli as u16,
                    None,
                    Some(decompress_brotli_cert),
                );
            }
            CertCompression::Zlib => {
                boring_sys::SSL_CTX_add_cert_compression_alg(
                    ctx,
                    boring_sys::TLSEXT_cert_compression_zlib as u16,
                    None,
                    Some(decompress_zlib_cert),
                );
            }
            CertCompression::None => {}
        }
    }
    Ok(())
}

fn add_roots(builder: &mut SslContextBuilder, roots: &[Vec<u8>]) -> Result<()> {
    for bytes in roots {
        let cert = X509::from_der(bytes)
            .or_else(|_| X509::from_pem(bytes))
            .map_err(|e| Error::configuration(format!("invalid root certificate: {}", e)))?;
        builder
            .cert_store_mut()
            .add_cert(cert)
            .map_err(|e| Error::configuration(format!("failed to add root certificate: {}", e)))?;
    }
    Ok(())
}

unsafe fn finish_decompressed(out: *mut *mut CRYPTO_BUFFER, data: &[u8], expected: usize) -> c_int {
    if data.len() != expected {
        return 0;
    }
    let buffer = boring_sys::CRYPTO_BUFFER_new(data.as_ptr(), data.len(), std::ptr::null_mut());
    if buffer.is_null() {
        return 0;
    }
    *out = buffer;
    1
}

unsafe extern "C" fn decompress_brotli_cert(
    _ssl: *mut SSL,
    out: *mut *mut CRYPTO_BUFFER,
    uncompressed_len: usize,
    in_: *const u8,
    in_len: usize,
) -> c_int {
    let compressed = std::slice::from_raw_parts(in_, in_len);
    let mut decompressed = Vec::with_capacity(uncompressed_len);
    match brotli::Decompressor::new(compressed, 4096).read_to_end(&mut decompressed) {
        Ok(_) => finish_decompressed(out, &decompressed, uncompressed_len),
        Err(_) => 0,
    }
}

unsafe extern "C" fn decompress_zlib_cert(
    _ssl: *mut SSL,
    out: *mut *mut CRYPTO_BUFFER,
    uncompressed_len: usize,
    in_: *const u8,
    in_len: usize,
) -> c_int {
    let compressed = std::slice::from_raw_parts(in_, in_len);
    let mut decompressed = Vec::with_capacity(uncompressed_len);
    match flate2::read::ZlibDecoder::new(compressed).read_to_end(&mut decompressed) {
        Ok(_) => finish_decompressed(out, &decompressed, uncompressed_len),
        Err(_) => 0,
    }
}
