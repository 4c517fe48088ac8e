//! Flow routing: claim, attribute, firewall-check, classify, and hand each
//! flow to its pipeline. Each flow is owned by exactly one pipeline task
//! from claim to close; the table holds metadata snapshots only, and close
//! signals travel through the owning task's cancellation token.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use iris_core::ca::LeafIdentity;
use iris_core::codec::http::ParserLimits;
use iris_core::firewall::FlowDescriptor;
use iris_model::firewall::FirewallAction;
use iris_model::flow::{Endpoint, FlowRecord, Transport};
use iris_model::ids::FlowId;
use rustls::ServerConnection;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{HttpPipeline, PipelineError, TunnelDirective};
use crate::daemon::{DaemonState, monotonic_now_ns};
use crate::dns::DnsProxy;
use crate::source::{BoxedStream, ClaimedFlow, ClientIo};
use crate::tls::{
    SniPeek, peek_client_hello_sni, relay_mitm, server_config_for_leaf,
    upstream_connection,
};

/// Bytes to buffer while sniffing a flow's protocol before giving up.
const CLASSIFY_BUFFER_CAP: usize = 16 * 1024;
const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection Established\r\n\r\n";

pub struct FlowRouter {
    state: Arc<DaemonState>,
    dns: Arc<DnsProxy>,
}

impl FlowRouter {
    pub fn new(state: Arc<DaemonState>, dns: Arc<DnsProxy>) -> Self {
        Self { state, dns }
    }

    /// Accept loop: one pipeline task per claimed flow, until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut flows: mpsc::Receiver<ClaimedFlow>,
    ) {
        loop {
            let claimed = tokio::select! {
                _ = self.state.shutdown.cancelled() => break,
                claimed = flows.recv() => match claimed {
                    Some(claimed) => claimed,
                    None => break,
                },
            };
            let router = Arc::clone(&self);
            tokio::spawn(async move {
                router.handle_flow(claimed).await;
            });
        }
        info!(target: "flow::router", "router stopped");
    }

    pub async fn handle_flow(&self, claimed: ClaimedFlow) {
        if !self
            .state
            .interception
            .load(Ordering::Relaxed)
        {
            debug!(
                target: "flow::router",
                "interception disabled, refusing flow"
            );
            return;
        }

        let descriptor = FlowDescriptor {
            process_path: &claimed.attribution.process_path,
            signing_id: claimed.attribution.signing_id.as_deref(),
            remote_host: &claimed.remote.host,
            remote_port: claimed.remote.port,
        };
        if self.state.firewall.evaluate(&descriptor) == FirewallAction::Block
        {
            info!(
                target: "flow::router",
                process = %claimed.attribution.process_path,
                remote = %claimed.remote,
                "flow blocked by firewall"
            );
            return;
        }

        let record = FlowRecord::new(
            claimed.transport,
            claimed.attribution.clone(),
            claimed.local.clone(),
            claimed.remote.clone(),
        );
        let flow_id = record.id;
        self.state.flows_seen.fetch_add(1, Ordering::Relaxed);

        for evicted in self.state.table.insert(record.clone()) {
            self.state.signal_close(&evicted.id);
            self.state.flows.append(evicted);
        }
        let closer = self.state.register_closer(flow_id);

        self.state.publish_event(
            self.state
                .normalizer
                .connection_event(&record, monotonic_now_ns()),
        );

        let counters = FlowCounters::default();
        let result = match (claimed.transport, claimed.client) {
            (Transport::Udp, ClientIo::Datagram(io)) => {
                if claimed.remote.port == 53 {
                    self.dns
                        .run_udp(io, Some(claimed.attribution.clone()))
                        .await;
                    Ok(())
                } else {
                    self.relay_udp_passthrough(io, &claimed.remote, &counters)
                        .await
                }
            }
            (Transport::Tcp, ClientIo::Stream(stream)) => {
                let stream = counters.wrap(stream);
                if claimed.remote.port == 53 {
                    self.dns
                        .run_tcp(
                            Box::new(stream),
                            Some(claimed.attribution.clone()),
                        )
                        .await;
                    Ok(())
                } else {
                    self.route_tcp(
                        flow_id,
                        Box::new(stream),
                        &claimed.remote,
                        closer.clone(),
                    )
                    .await
                }
            }
            (transport, client) => {
                warn!(
                    target: "flow::router",
                    transport = transport.as_str(),
                    client = ?client,
                    "transport and client io shape disagree"
                );
                Ok(())
            }
        };

        if let Err(err) = &result {
            debug!(
                target: "flow::router",
                flow = %flow_id,
                error = %err,
                "pipeline ended with error"
            );
        }

        self.finish_flow(flow_id, &counters);
    }

    /// Classify a TCP stream by peeking its first bytes, then run the
    /// matching pipeline.
    async fn route_tcp(
        &self,
        flow_id: FlowId,
        mut client: BoxedStream,
        remote: &Endpoint,
        closer: CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut sniffed = Vec::new();
        let verdict = tokio::select! {
            _ = closer.cancelled() => return Ok(()),
            verdict = tokio::time::timeout(
                CLASSIFY_TIMEOUT,
                sniff_protocol(&mut client, &mut sniffed),
            ) => verdict.unwrap_or(Ok(Sniffed::Opaque)),
        }?;

        match verdict {
            Sniffed::Tls { sni } => {
                self.run_mitm(flow_id, client, &sniffed, sni, remote, closer)
                    .await
            }
            Sniffed::Http => {
                self.run_clear_http(flow_id, client, sniffed, remote, closer)
                    .await
            }
            Sniffed::Opaque => {
                self.relay_tcp_passthrough(client, &sniffed, remote, closer)
                    .await
            }
        }
    }

    async fn run_mitm(
        &self,
        flow_id: FlowId,
        client: BoxedStream,
        buffered: &[u8],
        sni: Option<String>,
        remote: &Endpoint,
        closer: CancellationToken,
    ) -> Result<(), PipelineError> {
        let Some(ca) = self.state.ca.read().await.clone() else {
            // No root installed: pass the flow through untouched rather
            // than break connectivity.
            debug!(
                target: "flow::router",
                flow = %flow_id,
                "no CA installed, passing tls flow through"
            );
            return self
                .relay_tcp_passthrough(client, buffered, remote, closer)
                .await;
        };

        let server_name =
            sni.clone().unwrap_or_else(|| remote.host.clone());
        self.state.table.update(&flow_id, |r| {
            r.sni_host = Some(server_name.clone());
        });

        let identity = LeafIdentity::parse(&server_name);
        let leaf = ca
            .issue(&identity)
            .await
            .map_err(|e| PipelineError::Tls(e.to_string()))?;
        let server_config = server_config_for_leaf(&leaf)
            .map_err(|e| PipelineError::Tls(e.to_string()))?;
        let client_side = ServerConnection::new(server_config)
            .map_err(|e| PipelineError::Tls(e.to_string()))?;
        let server_side = upstream_connection(&server_name)
            .map_err(|e| PipelineError::Tls(e.to_string()))?;

        let remote_io = self.dial(remote).await?;
        let mut pipeline = HttpPipeline::new(
            flow_id,
            self.parser_limits(),
            Arc::clone(&self.state.exchanges),
        );

        relay_mitm(
            client,
            Box::new(remote_io),
            client_side,
            server_side,
            buffered,
            &mut pipeline,
            self.state.config.proxy.handshake_timeout(),
            closer,
        )
        .await
        .map(|_| ())
    }

    /// Clear-text HTTP capture. A CONNECT upgrades the flow to TLS
    /// interception of the tunneled target.
    async fn run_clear_http(
        &self,
        flow_id: FlowId,
        mut client: BoxedStream,
        buffered: Vec<u8>,
        remote: &Endpoint,
        closer: CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut pipeline = HttpPipeline::new(
            flow_id,
            self.parser_limits(),
            Arc::clone(&self.state.exchanges),
        );

        // CONNECT decides before we dial: the tunnel target, not the
        // original remote, is the real peer.
        if let Some(directive) = pipeline.on_client_bytes(&buffered)? {
            return self
                .upgrade_connect_tunnel(
                    flow_id, client, directive, &mut pipeline, closer,
                )
                .await;
        }

        let mut remote_io: BoxedStream = Box::new(self.dial(remote).await?);
        remote_io
            .write_all(&buffered)
            .await
            .map_err(PipelineError::Io)?;

        let mut client_buf = vec![0u8; 16 * 1024];
        let mut server_buf = vec![0u8; 16 * 1024];
        let mut client_open = true;
        let mut server_open = true;
        let mut upgrade: Option<TunnelDirective> = None;

        while client_open || server_open {
            tokio::select! {
                _ = closer.cancelled() => {
                    pipeline.on_close(Some("closed by eviction"));
                    return Ok(());
                }
                n = client.read(&mut client_buf), if client_open => {
                    match n.map_err(PipelineError::Io)? {
                        0 => {
                            client_open = false;
                            let _ = remote_io.shutdown().await;
                        }
                        n => {
                            let directive = pipeline
                                .on_client_bytes(&client_buf[..n])?;
                            if let Some(directive) = directive {
                                upgrade = Some(directive);
                                break;
                            }
                            remote_io
                                .write_all(&client_buf[..n])
                                .await
                                .map_err(PipelineError::Io)?;
                        }
                    }
                }
                n = remote_io.read(&mut server_buf), if server_open => {
                    match n.map_err(PipelineError::Io)? {
                        0 => {
                            server_open = false;
                            pipeline.on_close(None);
                            let _ = client.shutdown().await;
                            break;
                        }
                        n => {
                            pipeline.on_server_bytes(&server_buf[..n])?;
                            client
                                .write_all(&server_buf[..n])
                                .await
                                .map_err(PipelineError::Io)?;
                        }
                    }
                }
            }
        }

        if let Some(directive) = upgrade {
            // The original remote was an inner proxy; the tunnel target is
            // the real peer from here on.
            drop(remote_io);
            return self
                .upgrade_connect_tunnel(
                    flow_id, client, directive, &mut pipeline, closer,
                )
                .await;
        }
        Ok(())
    }

    async fn upgrade_connect_tunnel(
        &self,
        flow_id: FlowId,
        mut client: BoxedStream,
        directive: TunnelDirective,
        pipeline: &mut HttpPipeline,
        closer: CancellationToken,
    ) -> Result<(), PipelineError> {
        info!(
            target: "flow::router",
            flow = %flow_id,
            target = %directive.host,
            port = directive.port,
            "upgrading connect tunnel to tls interception"
        );
        client
            .write_all(CONNECT_ESTABLISHED)
            .await
            .map_err(PipelineError::Io)?;

        let tunnel_remote =
            Endpoint::new(directive.host.clone(), directive.port);
        self.state.table.update(&flow_id, |r| {
            r.remote = tunnel_remote.clone();
        });

        // The tunneled bytes start with their own ClientHello; anything
        // read past the CONNECT head already belongs to them.
        let mut sniffed = pipeline.drain_client_buffer();
        let verdict = tokio::time::timeout(
            CLASSIFY_TIMEOUT,
            sniff_protocol(&mut client, &mut sniffed),
        )
        .await
        .unwrap_or(Ok(Sniffed::Opaque))?;

        match verdict {
            Sniffed::Tls { sni } => {
                self.run_mitm(
                    flow_id,
                    client,
                    &sniffed,
                    sni.or(Some(directive.host)),
                    &tunnel_remote,
                    closer,
                )
                .await
            }
            _ => {
                self.relay_tcp_passthrough(
                    client,
                    &sniffed,
                    &tunnel_remote,
                    closer,
                )
                .await
            }
        }
    }

    async fn relay_tcp_passthrough(
        &self,
        mut client: BoxedStream,
        buffered: &[u8],
        remote: &Endpoint,
        closer: CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut remote_io = self.dial(remote).await?;
        remote_io
            .write_all(buffered)
            .await
            .map_err(PipelineError::Io)?;

        tokio::select! {
            _ = closer.cancelled() => Ok(()),
            result = tokio::io::copy_bidirectional(
                &mut client,
                &mut remote_io,
            ) => {
                result.map(|_| ()).map_err(PipelineError::Io)
            }
        }
    }

    async fn relay_udp_passthrough(
        &self,
        mut io: crate::source::DatagramChannel,
        remote: &Endpoint,
        counters: &FlowCounters,
    ) -> Result<(), PipelineError> {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(PipelineError::Io)?;
        socket
            .connect((remote.host.as_str(), remote.port))
            .await
            .map_err(PipelineError::Io)?;

        let idle = self.state.config.dns.udp_idle_timeout();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                outbound = tokio::time::timeout(idle, io.rx.recv()) => {
                    match outbound {
                        Ok(Some(datagram)) => {
                            counters
                                .client_bytes
                                .fetch_add(datagram.len() as u64, Ordering::Relaxed);
                            socket
                                .send(&datagram)
                                .await
                                .map_err(PipelineError::Io)?;
                        }
                        Ok(None) | Err(_) => return Ok(()),
                    }
                }
                inbound = socket.recv(&mut buf) => {
                    let n = inbound.map_err(PipelineError::Io)?;
                    counters
                        .server_bytes
                        .fetch_add(n as u64, Ordering::Relaxed);
                    if io.tx.send(buf[..n].to_vec()).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn dial(
        &self,
        remote: &Endpoint,
    ) -> Result<TcpStream, PipelineError> {
        TcpStream::connect((remote.host.as_str(), remote.port))
            .await
            .map_err(PipelineError::Io)
    }

    fn parser_limits(&self) -> ParserLimits {
        ParserLimits {
            body_cap: self.state.config.capture.body_cap_bytes,
            preview: self.state.config.capture.preview_bytes,
            ..ParserLimits::default()
        }
    }

    /// Terminal bookkeeping: counters into the record, state to closed,
    /// table entry out, final record onto the flow ring.
    fn finish_flow(&self, flow_id: FlowId, counters: &FlowCounters) {
        self.state.remove_closer(&flow_id);
        let bytes_out = counters.client_bytes.load(Ordering::Relaxed);
        let bytes_in = counters.server_bytes.load(Ordering::Relaxed);
        self.state.table.update(&flow_id, |r| {
            r.bytes_out = bytes_out;
            r.bytes_in = bytes_in;
        });
        if let Some(record) = self.state.table.mark_closed(&flow_id) {
            self.state.flows.append(record);
        }
    }
}

/// Shared byte counters for one flow, fed by the counting stream wrapper.
#[derive(Debug, Default)]
struct FlowCounters {
    client_bytes: Arc<AtomicU64>,
    server_bytes: Arc<AtomicU64>,
}

impl FlowCounters {
    fn wrap(&self, inner: BoxedStream) -> CountingStream {
        CountingStream {
            inner,
            read_bytes: Arc::clone(&self.client_bytes),
            write_bytes: Arc::clone(&self.server_bytes),
        }
    }
}

/// Counts bytes crossing the client side of a flow: reads are
/// client-to-proxy, writes proxy-to-client.
struct CountingStream {
    inner: BoxedStream,
    read_bytes: Arc<AtomicU64>,
    write_bytes: Arc<AtomicU64>,
}

impl AsyncRead for CountingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            self.read_bytes.fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }
}

impl AsyncWrite for CountingStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            self.write_bytes.fetch_add(*n as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[derive(Debug)]
enum Sniffed {
    Tls { sni: Option<String> },
    Http,
    Opaque,
}

/// Read from the client until the opening bytes identify the protocol.
async fn sniff_protocol(
    client: &mut BoxedStream,
    buffered: &mut Vec<u8>,
) -> Result<Sniffed, PipelineError> {
    let mut chunk = [0u8; 4096];
    loop {
        match peek_client_hello_sni(buffered) {
            SniPeek::Hello { sni } => return Ok(Sniffed::Tls { sni }),
            SniPeek::NotTls => {
                if looks_like_http_request(buffered) {
                    return Ok(Sniffed::Http);
                }
                // A short buffer may still be a partial method token.
                if !could_be_http_prefix(buffered) {
                    return Ok(Sniffed::Opaque);
                }
            }
            SniPeek::NeedMore => {}
        }
        if buffered.len() >= CLASSIFY_BUFFER_CAP {
            return Ok(Sniffed::Opaque);
        }
        let n = client
            .read(&mut chunk)
            .await
            .map_err(PipelineError::Io)?;
        if n == 0 {
            return Ok(Sniffed::Opaque);
        }
        buffered.extend_from_slice(&chunk[..n]);
    }
}

const HTTP_METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ",
    b"PATCH ", b"TRACE ", b"CONNECT ",
];

fn looks_like_http_request(buf: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|m| buf.starts_with(m))
}

fn could_be_http_prefix(buf: &[u8]) -> bool {
    HTTP_METHODS
        .iter()
        .any(|m| m.len() > buf.len() && m.starts_with(buf))
}
