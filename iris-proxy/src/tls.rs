//! TLS interception: peek the SNI from the raw ClientHello, terminate the
//! client side with a synthesized leaf, re-originate to the real server,
//! and pump decrypted bytes through the capture pipeline.
//!
//! Both rustls connections are driven sans-I/O from one task per flow: two
//! byte queues per connection, ciphertext toward the sockets, plaintext
//! across the capture pipeline. Close is idempotent; once a session is
//! closed every subsequent operation observes it.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use iris_core::ca::IssuedLeaf;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::ring as ring_provider;
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, ServerConfig,
    ServerConnection, SignatureScheme,
};
use rustls_pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::capture::{HttpPipeline, PipelineError};
use crate::source::BoxedStream;

const IO_CHUNK: usize = 16 * 1024;
/// A stalled kernel-flow write past this closes the session rather than
/// blocking the worker indefinitely.
const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("tls setup: {0}")]
    Setup(String),

    #[error("tls session: {0}")]
    Session(#[from] rustls::Error),
}

/// Result of inspecting buffered client bytes for a ClientHello.
#[derive(Debug, PartialEq, Eq)]
pub enum SniPeek {
    /// Not enough bytes buffered yet.
    NeedMore,
    /// The flow does not open with a TLS handshake record.
    NotTls,
    /// ClientHello parsed; SNI present or legitimately absent.
    Hello { sni: Option<String> },
}

/// Inspect raw bytes for a TLS ClientHello and extract the server_name
/// extension without driving a handshake. Every advance is bounds-checked;
/// a truncated buffer reports `NeedMore`, a non-TLS prefix `NotTls`.
pub fn peek_client_hello_sni(buf: &[u8]) -> SniPeek {
    // TLS record header: type, legacy version, length.
    if buf.len() < 5 {
        return if buf.is_empty() || buf[0] == 0x16 {
            SniPeek::NeedMore
        } else {
            SniPeek::NotTls
        };
    }
    if buf[0] != 0x16 {
        return SniPeek::NotTls;
    }
    let record_len = usize::from(u16::from_be_bytes([buf[3], buf[4]]));
    if buf.len() < 5 + record_len {
        return SniPeek::NeedMore;
    }
    let record = &buf[5..5 + record_len];

    // Handshake header: msg_type, 24-bit length.
    if record.len() < 4 || record[0] != 0x01 {
        return SniPeek::NotTls;
    }
    let hello = &record[4..];

    let mut pos = 0usize;
    let take = |pos: &mut usize, n: usize| -> Option<&[u8]> {
        let end = pos.checked_add(n)?;
        if end > hello.len() {
            return None;
        }
        let slice = &hello[*pos..end];
        *pos = end;
        Some(slice)
    };

    // client_version + random.
    if take(&mut pos, 2 + 32).is_none() {
        return SniPeek::NeedMore;
    }
    // session_id, cipher_suites, compression_methods.
    let Some(sid_len) = take(&mut pos, 1).map(|b| usize::from(b[0])) else {
        return SniPeek::NeedMore;
    };
    if take(&mut pos, sid_len).is_none() {
        return SniPeek::NeedMore;
    }
    let Some(cs_len) = take(&mut pos, 2)
        .map(|b| usize::from(u16::from_be_bytes([b[0], b[1]])))
    else {
        return SniPeek::NeedMore;
    };
    if take(&mut pos, cs_len).is_none() {
        return SniPeek::NeedMore;
    }
    let Some(cm_len) = take(&mut pos, 1).map(|b| usize::from(b[0])) else {
        return SniPeek::NeedMore;
    };
    if take(&mut pos, cm_len).is_none() {
        return SniPeek::NeedMore;
    }

    // Extensions are optional; a hello without them has no SNI.
    let Some(ext_len) = take(&mut pos, 2)
        .map(|b| usize::from(u16::from_be_bytes([b[0], b[1]])))
    else {
        return SniPeek::Hello { sni: None };
    };
    let Some(mut extensions) = take(&mut pos, ext_len) else {
        return SniPeek::NeedMore;
    };

    while extensions.len() >= 4 {
        let ext_type = u16::from_be_bytes([extensions[0], extensions[1]]);
        let len =
            usize::from(u16::from_be_bytes([extensions[2], extensions[3]]));
        if extensions.len() < 4 + len {
            break;
        }
        let body = &extensions[4..4 + len];
        extensions = &extensions[4 + len..];

        if ext_type != 0 {
            continue;
        }
        // server_name list: u16 list length, then (type, u16 length, name).
        if body.len() < 5 || body[2] != 0 {
            return SniPeek::Hello { sni: None };
        }
        let name_len = usize::from(u16::from_be_bytes([body[3], body[4]]));
        if body.len() < 5 + name_len {
            return SniPeek::Hello { sni: None };
        }
        let name = &body[5..5 + name_len];
        return match std::str::from_utf8(name) {
            Ok(name) if name.is_ascii() => SniPeek::Hello {
                sni: Some(name.to_ascii_lowercase()),
            },
            _ => SniPeek::Hello { sni: None },
        };
    }
    SniPeek::Hello { sni: None }
}

/// Server config presenting the synthesized leaf. http/1.1 only, so the
/// inner client never negotiates a framing the capture parser cannot read.
pub fn server_config_for_leaf(
    leaf: &IssuedLeaf,
) -> Result<Arc<ServerConfig>, TlsError> {
    let cert = CertificateDer::from(leaf.cert_der.clone());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        leaf.key_pkcs8_der.to_vec(),
    ));
    let mut config =
        ServerConfig::builder_with_provider(Arc::new(
            ring_provider::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Setup(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| TlsError::Setup(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Upstream config that accepts any server certificate. The interception
/// point is the trust decision here; the user authorized it when they
/// installed the root.
pub fn upstream_client_config() -> Arc<ClientConfig> {
    static CONFIG: std::sync::OnceLock<Arc<ClientConfig>> =
        std::sync::OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let provider = Arc::new(ring_provider::default_provider());
            let mut config = ClientConfig::builder_with_provider(
                Arc::clone(&provider),
            )
            .with_safe_default_protocol_versions()
            .expect("default protocol versions are valid")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(
                AcceptAnyServerCert { provider },
            ))
            .with_no_client_auth();
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
            Arc::new(config)
        })
        .clone()
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build the server-facing connection with the observed SNI.
pub fn upstream_connection(
    sni: &str,
) -> Result<ClientConnection, TlsError> {
    let name = ServerName::try_from(sni.to_string())
        .map_err(|e| TlsError::Setup(e.to_string()))?;
    ClientConnection::new(upstream_client_config(), name)
        .map_err(TlsError::Session)
}

/// Byte totals for a finished relay: (from client, from server).
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayTotals {
    pub client_bytes: u64,
    pub server_bytes: u64,
}

/// Drive both TLS sessions and the capture pipeline until either side
/// closes, errors, or the close signal fires. `initial_client_bytes`
/// carries whatever was read while peeking the SNI.
#[allow(clippy::too_many_arguments)]
pub async fn relay_mitm(
    mut client_io: BoxedStream,
    mut server_io: BoxedStream,
    mut client_side: ServerConnection,
    mut server_side: ClientConnection,
    initial_client_bytes: &[u8],
    pipeline: &mut HttpPipeline,
    handshake_timeout: Duration,
    closer: CancellationToken,
) -> Result<RelayTotals, PipelineError> {
    let mut totals = RelayTotals::default();
    let handshake_deadline = tokio::time::Instant::now() + handshake_timeout;

    if !initial_client_bytes.is_empty() {
        feed_ciphertext(&mut client_side, initial_client_bytes)?;
    }

    let mut client_open = true;
    let mut server_open = true;
    let mut client_chunk = vec![0u8; IO_CHUNK];
    let mut server_chunk = vec![0u8; IO_CHUNK];

    loop {
        // Decrypted client bytes cross the pipeline toward the server.
        let (plain, client_tls_closed) =
            drain_plaintext(&mut client_side.reader())?;
        if !plain.is_empty() {
            totals.client_bytes += plain.len() as u64;
            pipeline.on_client_bytes(&plain)?;
            server_side
                .writer()
                .write_all(&plain)
                .map_err(PipelineError::Io)?;
        }
        let (plain, server_tls_closed) =
            drain_plaintext(&mut server_side.reader())?;
        if !plain.is_empty() {
            totals.server_bytes += plain.len() as u64;
            pipeline.on_server_bytes(&plain)?;
            client_side
                .writer()
                .write_all(&plain)
                .map_err(PipelineError::Io)?;
        }

        // Push pending ciphertext at the sockets, bounded so one stalled
        // peer cannot wedge the worker.
        flush_tls(&mut client_side, &mut client_io).await?;
        flush_tls(&mut server_side, &mut server_io).await?;

        if client_tls_closed || server_tls_closed {
            pipeline.on_close(None);
            break;
        }
        if !client_open && !server_open {
            pipeline.on_close(Some("both peers closed"));
            break;
        }

        let handshaking =
            client_side.is_handshaking() || server_side.is_handshaking();

        let read_step = async {
            tokio::select! {
                _ = closer.cancelled() => ReadEvent::Closed,
                n = client_io.read(&mut client_chunk), if client_open => {
                    ReadEvent::Client(n)
                }
                n = server_io.read(&mut server_chunk), if server_open => {
                    ReadEvent::Server(n)
                }
            }
        };

        let event = if handshaking {
            match timeout_at_deadline(handshake_deadline, read_step).await {
                Some(event) => event,
                None => {
                    pipeline.on_close(Some("tls handshake timeout"));
                    return Err(PipelineError::HandshakeTimeout);
                }
            }
        } else {
            read_step.await
        };

        match event {
            ReadEvent::Closed => {
                pipeline.on_close(Some("closed by eviction"));
                break;
            }
            ReadEvent::Client(Ok(0)) => {
                trace!(target: "tls::mitm", "client half closed");
                client_open = false;
                server_side.send_close_notify();
            }
            ReadEvent::Client(Ok(n)) => {
                feed_ciphertext(&mut client_side, &client_chunk[..n])?;
            }
            ReadEvent::Client(Err(e)) => {
                pipeline.on_close(Some("client read error"));
                return Err(PipelineError::Io(e));
            }
            ReadEvent::Server(Ok(0)) => {
                trace!(target: "tls::mitm", "server half closed");
                server_open = false;
                client_side.send_close_notify();
            }
            ReadEvent::Server(Ok(n)) => {
                feed_ciphertext(&mut server_side, &server_chunk[..n])?;
            }
            ReadEvent::Server(Err(e)) => {
                pipeline.on_close(Some("server read error"));
                return Err(PipelineError::Io(e));
            }
        }
    }

    // Final ciphertext flush so close_notify reaches the peers.
    let _ = flush_tls(&mut client_side, &mut client_io).await;
    let _ = flush_tls(&mut server_side, &mut server_io).await;

    debug!(
        target: "tls::mitm",
        client_bytes = totals.client_bytes,
        server_bytes = totals.server_bytes,
        "mitm relay finished"
    );
    Ok(totals)
}

enum ReadEvent {
    Client(std::io::Result<usize>),
    Server(std::io::Result<usize>),
    Closed,
}

async fn timeout_at_deadline<F: std::future::Future>(
    deadline: tokio::time::Instant,
    future: F,
) -> Option<F::Output> {
    tokio::time::timeout_at(deadline, future).await.ok()
}

/// Feed socket bytes into a TLS session and process them.
fn feed_ciphertext<T>(
    conn: &mut rustls::ConnectionCommon<T>,
    mut bytes: &[u8],
) -> Result<(), PipelineError> {
    while !bytes.is_empty() {
        let n = conn
            .read_tls(&mut bytes)
            .map_err(PipelineError::Io)?;
        if n == 0 {
            break;
        }
        conn.process_new_packets().map_err(|e| {
            warn!(target: "tls::mitm", error = %e, "tls protocol error");
            PipelineError::Tls(e.to_string())
        })?;
    }
    Ok(())
}

/// Pull every decrypted byte currently available. The boolean reports a
/// clean TLS-level close from the peer.
fn drain_plaintext(
    reader: &mut rustls::Reader<'_>,
) -> Result<(Vec<u8>, bool), PipelineError> {
    let mut out = Vec::new();
    let mut buf = [0u8; IO_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok((out, true)),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Ok((out, false));
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                // Peer vanished without close_notify; surfaced as a close.
                return Ok((out, true));
            }
            Err(e) => return Err(PipelineError::Io(e)),
        }
    }
}

/// Write pending TLS records to the socket, bounded by the stall timeout.
async fn flush_tls<T>(
    conn: &mut rustls::ConnectionCommon<T>,
    io: &mut BoxedStream,
) -> Result<(), PipelineError> {
    while conn.wants_write() {
        let mut out = Vec::with_capacity(IO_CHUNK);
        conn.write_tls(&mut out).map_err(PipelineError::Io)?;
        if out.is_empty() {
            break;
        }
        match timeout(WRITE_STALL_TIMEOUT, io.write_all(&out)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(PipelineError::Io(e)),
            Err(_) => return Err(PipelineError::WriteStalled),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ClientHello bytes with the given SNI.
    fn client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]); // client_version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // session_id
        hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one suite
        hello.extend_from_slice(&[0x01, 0x00]); // null compression

        let mut extensions = Vec::new();
        if let Some(name) = sni {
            let name = name.as_bytes();
            let mut body = Vec::new();
            body.extend_from_slice(
                &((name.len() + 3) as u16).to_be_bytes(),
            );
            body.push(0); // host_name
            body.extend_from_slice(&(name.len() as u16).to_be_bytes());
            body.extend_from_slice(name);
            extensions.extend_from_slice(&[0x00, 0x00]);
            extensions
                .extend_from_slice(&(body.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&body);
        }
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        let len = hello.len();
        handshake.push((len >> 16) as u8);
        handshake.push((len >> 8) as u8);
        handshake.push(len as u8);
        handshake.extend_from_slice(&hello);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn sni_is_peeked_from_client_hello() {
        let wire = client_hello(Some("internal.example.com"));
        assert_eq!(
            peek_client_hello_sni(&wire),
            SniPeek::Hello {
                sni: Some("internal.example.com".into())
            }
        );
    }

    #[test]
    fn hello_without_sni_reports_none() {
        let wire = client_hello(None);
        assert_eq!(
            peek_client_hello_sni(&wire),
            SniPeek::Hello { sni: None }
        );
    }

    #[test]
    fn partial_hello_wants_more_bytes() {
        let wire = client_hello(Some("example.com"));
        assert_eq!(peek_client_hello_sni(&wire[..3]), SniPeek::NeedMore);
        assert_eq!(
            peek_client_hello_sni(&wire[..wire.len() - 1]),
            SniPeek::NeedMore
        );
    }

    #[test]
    fn http_bytes_are_not_tls() {
        assert_eq!(
            peek_client_hello_sni(b"GET / HTTP/1.1\r\n"),
            SniPeek::NotTls
        );
    }
}
