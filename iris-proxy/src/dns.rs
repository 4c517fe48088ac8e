//! DNS proxy pipelines: UDP datagrams and length-prefixed TCP streams in,
//! DoH exchanges out, query records and synthetic telemetry to the sink.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use iris_core::codec::dns::{
    self, HEADER_LEN, MAX_TCP_MESSAGE, MAX_UDP_RESPONSE,
};
use iris_model::dns::{DnsAnswer, DnsQueryRecord};
use iris_model::flow::FlowAttribution;
use iris_model::ids::QueryId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::doh::{DohClient, DohError};
use crate::source::{BoxedStream, DatagramChannel};

/// A TCP flow buffers at most one maximal message plus its prefix. Growth
/// past this closes the flow without allocating further.
const TCP_BUFFER_CAP: usize = 2 + MAX_TCP_MESSAGE;
const TCP_READ_CHUNK: usize = 4096;

/// Upstream resolver seam; production uses the DoH client.
#[async_trait]
pub trait DnsUpstream: Send + Sync {
    fn label(&self) -> String;
    async fn query(&self, wire: &[u8]) -> Result<Vec<u8>, DohError>;
}

#[async_trait]
impl DnsUpstream for DohClient {
    fn label(&self) -> String {
        self.upstream()
    }

    async fn query(&self, wire: &[u8]) -> Result<Vec<u8>, DohError> {
        DohClient::query(self, wire).await
    }
}

/// Where completed query records go: the DNS ring plus synthetic event
/// minting, both owned by the daemon.
pub trait QuerySink: Send + Sync {
    fn record(&self, record: DnsQueryRecord);
}

pub struct DnsProxy {
    upstream: Arc<dyn DnsUpstream>,
    sink: Arc<dyn QuerySink>,
    udp_idle: Duration,
}

impl std::fmt::Debug for DnsProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsProxy")
            .field("upstream", &self.upstream.label())
            .finish()
    }
}

impl DnsProxy {
    pub fn new(
        upstream: Arc<dyn DnsUpstream>,
        sink: Arc<dyn QuerySink>,
        udp_idle: Duration,
    ) -> Self {
        Self {
            upstream,
            sink,
            udp_idle,
        }
    }

    /// UDP variant: every datagram is a complete message. The flow ends on
    /// idle timeout, channel close, or a malformed datagram.
    pub async fn run_udp(
        &self,
        mut io: DatagramChannel,
        attribution: Option<FlowAttribution>,
    ) {
        loop {
            let datagram = match timeout(self.udp_idle, io.rx.recv()).await {
                Ok(Some(datagram)) => datagram,
                Ok(None) => break,
                Err(_) => {
                    debug!(target: "dns::proxy", "udp flow idle, closing");
                    break;
                }
            };
            if datagram.len() < HEADER_LEN {
                warn!(
                    target: "dns::proxy",
                    len = datagram.len(),
                    "datagram below header size, closing flow"
                );
                break;
            }
            let Some(response) =
                self.resolve(&datagram, attribution.clone(), true).await
            else {
                break;
            };
            if io.tx.send(response).await.is_err() {
                break;
            }
        }
    }

    /// TCP variant: 2-byte big-endian length prefix per message, pipelining
    /// allowed. Any framing violation discards the buffer and closes.
    pub async fn run_tcp(
        &self,
        mut stream: BoxedStream,
        attribution: Option<FlowAttribution>,
    ) {
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; TCP_READ_CHUNK];

        'flow: loop {
            let n = match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            buf.extend_from_slice(&chunk[..n]);

            loop {
                let (message, consumed) = match dns::take_tcp_frame(&buf) {
                    Ok(Some((message, consumed))) => {
                        (message.to_vec(), consumed)
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(
                            target: "dns::proxy",
                            error = %err,
                            "tcp framing violation, closing"
                        );
                        break 'flow;
                    }
                };
                buf.drain(..consumed);

                if message.len() < HEADER_LEN {
                    warn!(
                        target: "dns::proxy",
                        len = message.len(),
                        "tcp message below header size, closing"
                    );
                    break 'flow;
                }
                let Some(response) =
                    self.resolve(&message, attribution.clone(), false).await
                else {
                    break 'flow;
                };
                let framed = match dns::tcp_frame(&response) {
                    Ok(framed) => framed,
                    Err(_) => break 'flow,
                };
                if stream.write_all(&framed).await.is_err() {
                    break 'flow;
                }
            }

            // Whatever remains is an incomplete frame; one maximal message
            // plus its prefix is the budget.
            if buf.len() > TCP_BUFFER_CAP {
                warn!(
                    target: "dns::proxy",
                    buffered = buf.len(),
                    "tcp flow exceeded frame budget, closing"
                );
                break;
            }
        }
    }

    /// Forward one query. Returns the wire response to relay, or `None`
    /// when the query itself is malformed and the flow must close. Upstream
    /// failure or an oversized UDP answer resolves to SERVFAIL, built from
    /// the transaction id with zeroed counts.
    async fn resolve(
        &self,
        wire_query: &[u8],
        attribution: Option<FlowAttribution>,
        udp: bool,
    ) -> Option<Vec<u8>> {
        let query = match dns::parse(wire_query) {
            Ok(query) => query,
            Err(err) => {
                warn!(target: "dns::proxy", error = %err, "malformed query");
                return None;
            }
        };
        let question = query.first_question().cloned();
        let clock = Instant::now();

        let outcome = self.upstream.query(wire_query).await;
        let latency_ms = clock.elapsed().as_millis() as u64;

        let (response_wire, parsed) = match outcome {
            Ok(wire) if udp && wire.len() > MAX_UDP_RESPONSE => {
                warn!(
                    target: "dns::proxy",
                    len = wire.len(),
                    "udp response over size cap, answering servfail"
                );
                servfail(query.id)
            }
            Ok(wire) => match dns::parse(&wire) {
                Ok(parsed) => (wire, parsed),
                Err(err) => {
                    warn!(
                        target: "dns::proxy",
                        error = %err,
                        "unparseable upstream response, answering servfail"
                    );
                    servfail(query.id)
                }
            },
            Err(err) => {
                warn!(target: "dns::proxy", error = %err, "upstream failed");
                servfail(query.id)
            }
        };

        self.sink.record(DnsQueryRecord {
            id: QueryId::new(),
            timestamp: Utc::now(),
            attribution,
            domain: question
                .as_ref()
                .map(|q| q.name.clone())
                .unwrap_or_default(),
            qtype: question.map(|q| q.qtype).unwrap_or(0),
            rcode: parsed.rcode(),
            answers: parsed
                .answers
                .iter()
                .map(|r| DnsAnswer {
                    name: r.name.clone(),
                    record_type: r.rtype,
                    ttl: r.ttl,
                    rdata: r.rdata_display(),
                })
                .collect(),
            latency_ms,
            upstream: self.upstream.label(),
        });

        Some(response_wire)
    }
}

fn servfail(txid: u16) -> (Vec<u8>, dns::Message) {
    let message = dns::Message::servfail(txid);
    let wire = dns::encode(&message)
        .expect("servfail has no names and always encodes");
    (wire, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    struct FakeUpstream {
        responses: Mutex<Vec<Result<Vec<u8>, DohError>>>,
    }

    impl FakeUpstream {
        fn with(responses: Vec<Result<Vec<u8>, DohError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl DnsUpstream for FakeUpstream {
        fn label(&self) -> String {
            "https://fake/dns-query".into()
        }

        async fn query(&self, _wire: &[u8]) -> Result<Vec<u8>, DohError> {
            self.responses
                .lock()
                .pop()
                .unwrap_or_else(|| Err(DohError::Request("exhausted".into())))
        }
    }

    #[derive(Default)]
    struct VecSink {
        records: Mutex<Vec<DnsQueryRecord>>,
    }

    impl QuerySink for VecSink {
        fn record(&self, record: DnsQueryRecord) {
            self.records.lock().push(record);
        }
    }

    fn proxy(
        upstream: Arc<dyn DnsUpstream>,
    ) -> (DnsProxy, Arc<VecSink>) {
        let sink = Arc::new(VecSink::default());
        (
            DnsProxy::new(
                upstream,
                Arc::clone(&sink) as Arc<dyn QuerySink>,
                Duration::from_secs(300),
            ),
            sink,
        )
    }

    fn sample_query() -> Vec<u8> {
        dns::encode_query(0x4141, "www.example.com", 1).unwrap()
    }

    fn sample_answer(txid: u16) -> Vec<u8> {
        dns::encode(&dns::Message {
            id: txid,
            flags: 0x8180,
            questions: vec![dns::Question {
                name: "www.example.com".into(),
                qtype: 1,
                qclass: 1,
            }],
            answers: vec![dns::Record {
                name: "www.example.com".into(),
                rtype: 1,
                rclass: 1,
                ttl: 60,
                rdata: vec![93, 184, 216, 34],
            }],
            authorities: vec![],
            additionals: vec![],
        })
        .unwrap()
    }

    #[tokio::test]
    async fn udp_resolves_and_records() {
        let upstream = FakeUpstream::with(vec![Ok(sample_answer(0x4141))]);
        let (proxy, sink) = proxy(upstream);

        let (client_tx, rx) = mpsc::channel(4);
        let (tx, mut client_rx) = mpsc::channel(4);
        let io = DatagramChannel { rx, tx };

        client_tx.send(sample_query()).await.unwrap();
        drop(client_tx);
        proxy.run_udp(io, None).await;

        let response = client_rx.recv().await.expect("answer relayed");
        let parsed = dns::parse(&response).unwrap();
        assert_eq!(parsed.id, 0x4141);
        assert_eq!(parsed.answers.len(), 1);

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].domain, "www.example.com");
        assert_eq!(records[0].rcode, 0);
        assert_eq!(records[0].answers[0].rdata, "93.184.216.34");
    }

    #[tokio::test]
    async fn udp_short_datagram_closes_without_recording() {
        let upstream = FakeUpstream::with(vec![]);
        let (proxy, sink) = proxy(upstream);

        let (client_tx, rx) = mpsc::channel(4);
        let (tx, _client_rx) = mpsc::channel(4);
        client_tx.send(vec![0u8; 11]).await.unwrap();
        proxy
            .run_udp(DatagramChannel { rx, tx }, None)
            .await;
        assert!(sink.records.lock().is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_answers_servfail_from_txid() {
        let upstream =
            FakeUpstream::with(vec![Err(DohError::Request("down".into()))]);
        let (proxy, sink) = proxy(upstream);

        let (client_tx, rx) = mpsc::channel(4);
        let (tx, mut client_rx) = mpsc::channel(4);
        client_tx.send(sample_query()).await.unwrap();
        drop(client_tx);
        proxy
            .run_udp(DatagramChannel { rx, tx }, None)
            .await;

        let response = client_rx.recv().await.expect("servfail relayed");
        let parsed = dns::parse(&response).unwrap();
        assert_eq!(parsed.id, 0x4141);
        assert_eq!(parsed.rcode(), dns::RCODE_SERVFAIL);
        assert!(parsed.questions.is_empty(), "built from txid, not query");
        assert_eq!(sink.records.lock().len(), 1);
    }

    #[tokio::test]
    async fn oversized_udp_response_becomes_servfail() {
        let mut big = sample_answer(0x4141);
        big.resize(MAX_UDP_RESPONSE + 1, 0);
        let upstream = FakeUpstream::with(vec![Ok(big)]);
        let (proxy, _sink) = proxy(upstream);

        let (client_tx, rx) = mpsc::channel(4);
        let (tx, mut client_rx) = mpsc::channel(4);
        client_tx.send(sample_query()).await.unwrap();
        drop(client_tx);
        proxy
            .run_udp(DatagramChannel { rx, tx }, None)
            .await;

        let parsed =
            dns::parse(&client_rx.recv().await.unwrap()).unwrap();
        assert_eq!(parsed.rcode(), dns::RCODE_SERVFAIL);
    }

    #[tokio::test]
    async fn tcp_waits_for_declared_length_then_answers() {
        let query = sample_query();
        let upstream = FakeUpstream::with(vec![Ok(sample_answer(0x4141))]);
        let (proxy, sink) = proxy(upstream);

        let (mut client, server) = tokio::io::duplex(256 * 1024);
        let task = tokio::spawn(async move {
            proxy.run_tcp(Box::new(server), None).await;
            sink.records.lock().len()
        });

        // Partial frame first: declared length not yet satisfied.
        let framed = dns::tcp_frame(&query).unwrap();
        client.write_all(&framed[..5]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.write_all(&framed[5..]).await.unwrap();

        let mut prefix = [0u8; 2];
        client.read_exact(&mut prefix).await.unwrap();
        let len = u16::from_be_bytes(prefix) as usize;
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(dns::parse(&body).unwrap().id, 0x4141);

        drop(client);
        assert_eq!(task.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tcp_incomplete_frame_records_nothing_on_close() {
        let upstream = FakeUpstream::with(vec![]);
        let (proxy, sink) = proxy(upstream);

        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move {
            proxy.run_tcp(Box::new(server), None).await;
        });

        // Declared 5 bytes, only 3 sent, then the client goes away.
        client.write_all(&[0x00, 0x05, b'A', b'A', b'A']).await.unwrap();
        drop(client);
        task.await.unwrap();
        assert!(sink.records.lock().is_empty());
    }

    #[tokio::test]
    async fn tcp_zero_length_prefix_closes_flow() {
        let upstream = FakeUpstream::with(vec![]);
        let (proxy, sink) = proxy(upstream);

        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move {
            proxy.run_tcp(Box::new(server), None).await;
        });

        client.write_all(&[0x00, 0x00, 0xFF]).await.unwrap();
        task.await.unwrap();
        assert!(sink.records.lock().is_empty());
    }

    #[tokio::test]
    async fn tcp_maximal_frame_is_accepted_and_pipelining_continues() {
        // A 65535-byte declared frame is legal. The upstream answers it,
        // then a zero-length prefix on the same flow closes it.
        let mut maximal = vec![0u8; MAX_TCP_MESSAGE];
        maximal[..2].copy_from_slice(&0xBEEFu16.to_be_bytes());
        // qd/an/ns/ar counts stay zero so the padding bytes are ignored.

        let upstream = FakeUpstream::with(vec![Ok(sample_answer(0xBEEF))]);
        let (proxy, sink) = proxy(upstream);

        let (mut client, server) = tokio::io::duplex(512 * 1024);
        let task = tokio::spawn(async move {
            proxy.run_tcp(Box::new(server), None).await;
        });

        let mut blob = vec![0xFF, 0xFF];
        blob.extend_from_slice(&maximal);
        blob.extend_from_slice(&[0x00, 0x00]);
        client.write_all(&blob).await.unwrap();

        let mut prefix = [0u8; 2];
        client.read_exact(&mut prefix).await.unwrap();
        let len = u16::from_be_bytes(prefix) as usize;
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(dns::parse(&body).unwrap().id, 0xBEEF);

        // The trailing zero-length prefix closed the flow.
        task.await.unwrap();
        assert_eq!(sink.records.lock().len(), 1);
    }
}
