//! End-to-end TLS interception: a TLS client connects through the router,
//! the router terminates with a synthesized leaf and re-originates to a
//! real TLS server, and the decrypted exchange lands on the capture ring.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use iris_config::IrisConfig;
use iris_core::ca::CertAuthority;
use iris_model::flow::{Endpoint, FlowAttribution, Transport};
use iris_proxy::daemon::DaemonState;
use iris_proxy::dns::{DnsProxy, DnsUpstream, QuerySink};
use iris_proxy::doh::DohError;
use iris_proxy::router::FlowRouter;
use iris_proxy::source::{ClaimedFlow, ClientIo};
use iris_proxy::tls::upstream_client_config;
use rustls::{ClientConnection, ServerConnection};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

struct UnusedUpstream;

#[async_trait::async_trait]
impl DnsUpstream for UnusedUpstream {
    fn label(&self) -> String {
        "https://unused/dns-query".into()
    }

    async fn query(&self, _wire: &[u8]) -> Result<Vec<u8>, DohError> {
        Err(DohError::Request("not under test".into()))
    }
}

/// Pump a sans-I/O rustls client over an async stream: send `payload`
/// once the handshake allows, collect plaintext until the peer closes.
async fn drive_client<S>(
    mut conn: ClientConnection,
    mut io: S,
    payload: &[u8],
) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut received = Vec::new();
    let mut sent = false;
    let mut chunk = vec![0u8; 16 * 1024];

    loop {
        if !conn.is_handshaking() && !sent {
            conn.writer().write_all(payload).unwrap();
            sent = true;
        }
        while conn.wants_write() {
            let mut out = Vec::new();
            conn.write_tls(&mut out).unwrap();
            if out.is_empty() {
                break;
            }
            io.write_all(&out).await.unwrap();
        }

        let n = match io.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut slice = &chunk[..n];
        while !slice.is_empty() {
            if conn.read_tls(&mut slice).unwrap() == 0 {
                break;
            }
            if conn.process_new_packets().is_err() {
                return received;
            }
        }
        loop {
            match conn.reader().read(&mut chunk) {
                Ok(0) => return received,
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    break;
                }
                Err(_) => return received,
            }
        }
    }
    received
}

async fn drive_server<S>(
    mut conn: ServerConnection,
    mut io: S,
    response: &[u8],
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; 16 * 1024];
    let mut request = Vec::new();
    let mut responded = false;

    loop {
        while conn.wants_write() {
            let mut out = Vec::new();
            conn.write_tls(&mut out).unwrap();
            if out.is_empty() {
                break;
            }
            if io.write_all(&out).await.is_err() {
                return;
            }
        }
        if responded && !conn.wants_write() {
            let _ = io.shutdown().await;
            return;
        }

        let n = match io.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let mut slice = &chunk[..n];
        while !slice.is_empty() {
            if conn.read_tls(&mut slice).unwrap() == 0 {
                break;
            }
            if conn.process_new_packets().is_err() {
                return;
            }
        }
        loop {
            match conn.reader().read(&mut chunk) {
                Ok(0) => return,
                Ok(n) => request.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    break;
                }
                Err(_) => return,
            }
        }
        if !responded
            && request.windows(4).any(|w| w == b"\r\n\r\n")
        {
            conn.writer().write_all(response).unwrap();
            conn.send_close_notify();
            responded = true;
        }
    }
}

/// A real TLS origin answering one request with a canned response.
async fn tls_origin(response: &'static [u8]) -> Endpoint {
    // Self-signed origin identity; the MITM accepts any server cert.
    let identity = rcgen::generate_simple_self_signed(vec![
        "origin.test".to_string(),
    ])
    .unwrap();
    let cert_der = rustls_pki_types::CertificateDer::from(
        identity.cert.der().to_vec(),
    );
    let key_der = rustls_pki_types::PrivateKeyDer::Pkcs8(
        rustls_pki_types::PrivatePkcs8KeyDer::from(
            identity.key_pair.serialize_der(),
        ),
    );
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert_der], key_der)
    .unwrap();
    let config = Arc::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let conn = ServerConnection::new(Arc::clone(&config)).unwrap();
            tokio::spawn(drive_server(conn, socket, response));
        }
    });
    Endpoint::new("127.0.0.1", port)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn https_flow_is_intercepted_and_captured() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = IrisConfig::default();
    config.proxy.firewall_rules_path = dir.path().join("rules.json");
    let state = DaemonState::init(config).unwrap();

    // Root installed as the supervisor would over IPC.
    let ca = tokio::task::spawn_blocking(|| {
        CertAuthority::generate("Iris Test Root").unwrap()
    })
    .await
    .unwrap();
    *state.ca.write().await = Some(Arc::new(ca));

    let dns = Arc::new(DnsProxy::new(
        Arc::new(UnusedUpstream),
        Arc::clone(&state) as Arc<dyn QuerySink>,
        Duration::from_secs(300),
    ));
    let router = Arc::new(FlowRouter::new(Arc::clone(&state), dns));

    let remote = tls_origin(
        b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecret",
    )
    .await;

    let (app, flow_side) = tokio::io::duplex(256 * 1024);
    let claimed = ClaimedFlow {
        transport: Transport::Tcp,
        attribution: FlowAttribution {
            pid: 7777,
            process_path: "/usr/bin/curl".into(),
            signing_id: None,
        },
        local: Endpoint::new("127.0.0.1", 50001),
        remote,
        client: ClientIo::Stream(Box::new(flow_side)),
    };

    let flow_task = {
        let router = Arc::clone(&router);
        tokio::spawn(async move { router.handle_flow(claimed).await })
    };

    // The app dials "example.com" and trusts anything, standing in for a
    // client that trusts the installed root.
    let client_conn = ClientConnection::new(
        upstream_client_config(),
        ServerName::try_from("example.com").unwrap(),
    )
    .unwrap();
    let received = drive_client(
        client_conn,
        app,
        b"GET /secret HTTP/1.1\r\nHost: example.com\r\n\r\n",
    )
    .await;

    let body_at = received
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("http head in decrypted bytes");
    assert!(received.starts_with(b"HTTP/1.1 200"));
    assert_eq!(&received[body_at + 4..], b"secret");

    flow_task.await.unwrap();

    // The exchange was captured in clear, with the SNI on the flow.
    let (exchanges, _) = state.exchanges.since(0);
    assert_eq!(exchanges.len(), 1);
    let exchange = &exchanges[0].value;
    assert_eq!(exchange.request.method, "GET");
    assert_eq!(exchange.request.path, "/secret");
    assert_eq!(exchange.response.as_ref().unwrap().status, 200);
    assert_eq!(exchange.response.as_ref().unwrap().body_preview, b"secret");

    let (flows, _) = state.flows.since(0);
    assert_eq!(flows.len(), 1);
    assert_eq!(
        flows[0].value.sni_host.as_deref(),
        Some("example.com")
    );
}
