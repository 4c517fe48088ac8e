//! HTTP exchange capture. Paired request/response parsers driven by the
//! decrypted (or clear) byte streams; a completed pair becomes one
//! `CapturedExchange` on the capture ring. Pipelined requests queue until
//! their responses arrive; a flow that dies mid-exchange emits the
//! in-flight work with an explicit error tag.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use iris_core::codec::CodecError;
use iris_core::codec::http::{
    CompleteMessage, MessageParser, ParserLimits, connect_target,
};
use iris_core::ring::RingStore;
use iris_model::http::{CapturedExchange, CapturedMessage, Header};
use iris_model::ids::FlowId;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("io: {0}")]
    Io(std::io::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("tls handshake timed out")]
    HandshakeTimeout,

    #[error("write stalled past the backpressure budget")]
    WriteStalled,

    #[error("response arrived with no request outstanding")]
    UnpairedResponse,
}

/// A CONNECT request observed on a clear pipeline; the router re-routes
/// the flow to TLS interception for the tunneled target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDirective {
    pub host: String,
    pub port: u16,
}

#[derive(Debug)]
struct PendingRequest {
    message: CompleteMessage,
    started_at: DateTime<Utc>,
}

pub struct HttpPipeline {
    flow_id: FlowId,
    requests: MessageParser,
    responses: MessageParser,
    pending: VecDeque<PendingRequest>,
    ring: Arc<RingStore<CapturedExchange>>,
    exchanges_emitted: u64,
}

impl std::fmt::Debug for HttpPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPipeline")
            .field("flow", &self.flow_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl HttpPipeline {
    pub fn new(
        flow_id: FlowId,
        limits: ParserLimits,
        ring: Arc<RingStore<CapturedExchange>>,
    ) -> Self {
        Self {
            flow_id,
            requests: MessageParser::request(limits),
            responses: MessageParser::response(limits),
            pending: VecDeque::new(),
            ring,
            exchanges_emitted: 0,
        }
    }

    pub fn exchanges_emitted(&self) -> u64 {
        self.exchanges_emitted
    }

    /// Feed decrypted client-to-server bytes. Returns a tunnel directive
    /// when a CONNECT request completes.
    pub fn on_client_bytes(
        &mut self,
        bytes: &[u8],
    ) -> Result<Option<TunnelDirective>, PipelineError> {
        self.requests.push(bytes);
        let mut directive = None;
        while let Some(message) = self.requests.poll_message()? {
            if message.head.method == "CONNECT" {
                let (host, port) = connect_target(&message.head.target)?;
                debug!(
                    target: "flow::capture",
                    flow = %self.flow_id,
                    host = %host,
                    port,
                    "connect tunnel requested"
                );
                // The proxy itself answers a CONNECT, so the exchange is
                // recorded here with the synthesized response.
                let started_at = Utc::now();
                self.push_exchange(CapturedExchange {
                    flow_id: self.flow_id,
                    request: to_captured_request(&message),
                    response: Some(connect_established_response()),
                    started_at,
                    completed_at: Some(Utc::now()),
                    error: None,
                });
                directive = Some(TunnelDirective { host, port });
                // Anything already buffered belongs to the tunnel; stop
                // parsing it as HTTP.
                break;
            }
            self.sync_response_hint(&message);
            self.pending.push_back(PendingRequest {
                message,
                started_at: Utc::now(),
            });
        }
        Ok(directive)
    }

    /// Hand back bytes already read past the last parsed request. After a
    /// CONNECT upgrade these belong to the tunneled protocol.
    pub fn drain_client_buffer(&mut self) -> Vec<u8> {
        self.requests.take_buffered()
    }

    /// Feed decrypted server-to-client bytes; completed responses pair
    /// with queued requests in order.
    pub fn on_server_bytes(
        &mut self,
        bytes: &[u8],
    ) -> Result<(), PipelineError> {
        self.responses.push(bytes);
        while let Some(message) = self.responses.poll_message()? {
            self.emit(Some(message), None)?;
        }
        Ok(())
    }

    /// The flow ended. An until-close response body completes now; any
    /// other in-flight work is emitted with the error tag.
    pub fn on_close(&mut self, error: Option<&str>) {
        match self.responses.finish() {
            Ok(Some(message)) => {
                let _ = self.emit(Some(message), error);
            }
            Ok(None) => {}
            Err(codec_err) => {
                let tag = error.map(str::to_string).unwrap_or_else(|| {
                    format!("response truncated: {codec_err}")
                });
                let _ = self.emit(None, Some(&tag));
            }
        }
        // Requests that never saw any response at all.
        while let Some(pending) = self.pending.pop_front() {
            self.push_exchange(CapturedExchange {
                flow_id: self.flow_id,
                request: to_captured_request(&pending.message),
                response: None,
                started_at: pending.started_at,
                completed_at: None,
                error: Some(
                    error.unwrap_or("flow closed before response").to_string(),
                ),
            });
        }
        if let Err(codec_err) = self.requests.finish() {
            debug!(
                target: "flow::capture",
                flow = %self.flow_id,
                error = %codec_err,
                "request stream ended mid-message"
            );
        }
    }

    /// Match the response parser's framing hint to the request its next
    /// response will answer.
    fn sync_response_hint(&mut self, newest: &CompleteMessage) {
        let head_like = self
            .pending
            .front()
            .map(|p| &p.message)
            .unwrap_or(newest);
        let method = head_like.head.method.as_str();
        self.responses
            .set_no_body_response(method == "HEAD" || method == "CONNECT");
    }

    fn emit(
        &mut self,
        response: Option<CompleteMessage>,
        error: Option<&str>,
    ) -> Result<(), PipelineError> {
        let Some(pending) = self.pending.pop_front() else {
            if response.is_some() && error.is_none() {
                warn!(
                    target: "flow::capture",
                    flow = %self.flow_id,
                    "response with no outstanding request"
                );
                return Err(PipelineError::UnpairedResponse);
            }
            return Ok(());
        };

        if let Some(next) = self.pending.front() {
            let method = next.message.head.method.as_str();
            self.responses
                .set_no_body_response(method == "HEAD" || method == "CONNECT");
        }

        self.push_exchange(CapturedExchange {
            flow_id: self.flow_id,
            request: to_captured_request(&pending.message),
            response: response.as_ref().map(to_captured_response),
            started_at: pending.started_at,
            completed_at: Some(Utc::now()),
            error: error.map(str::to_string),
        });
        Ok(())
    }

    fn push_exchange(&mut self, exchange: CapturedExchange) {
        debug!(
            target: "flow::capture",
            flow = %self.flow_id,
            method = %exchange.request.method,
            path = %exchange.request.path,
            status = exchange
                .response
                .as_ref()
                .map(|r| r.status)
                .unwrap_or(0),
            error = exchange.error.as_deref().unwrap_or(""),
            "exchange captured"
        );
        self.exchanges_emitted += 1;
        self.ring.append(exchange);
    }
}

fn headers_of(message: &CompleteMessage) -> Vec<Header> {
    message.head.headers.clone()
}

fn to_captured_request(message: &CompleteMessage) -> CapturedMessage {
    CapturedMessage {
        method: message.head.method.clone(),
        path: message.head.target.clone(),
        status: 0,
        reason: String::new(),
        version: message.head.version.clone(),
        headers: headers_of(message),
        body_preview: message.body_preview.clone(),
        body_size: message.body_size,
    }
}

fn connect_established_response() -> CapturedMessage {
    CapturedMessage {
        method: String::new(),
        path: String::new(),
        status: 200,
        reason: "Connection Established".into(),
        version: "HTTP/1.1".into(),
        headers: Vec::new(),
        body_preview: Vec::new(),
        body_size: 0,
    }
}

fn to_captured_response(message: &CompleteMessage) -> CapturedMessage {
    CapturedMessage {
        method: String::new(),
        path: String::new(),
        status: message.head.status,
        reason: message.head.reason.clone(),
        version: message.head.version.clone(),
        headers: headers_of(message),
        body_preview: message.body_preview.clone(),
        body_size: message.body_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> (HttpPipeline, Arc<RingStore<CapturedExchange>>) {
        let ring = Arc::new(RingStore::new(64));
        (
            HttpPipeline::new(
                FlowId::new(),
                ParserLimits::default(),
                Arc::clone(&ring),
            ),
            ring,
        )
    }

    #[test]
    fn get_exchange_is_captured_with_preview() {
        let (mut p, ring) = pipeline();
        p.on_client_bytes(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap();
        p.on_server_bytes(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
        )
        .unwrap();

        let (items, _) = ring.since(0);
        assert_eq!(items.len(), 1);
        let exchange = &items[0].value;
        assert_eq!(exchange.request.method, "GET");
        assert_eq!(exchange.request.path, "/");
        let response = exchange.response.as_ref().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body_size, 5);
        assert_eq!(response.body_preview, b"hello");
        assert!(exchange.error.is_none());
    }

    #[test]
    fn pipelined_requests_pair_in_order() {
        let (mut p, ring) = pipeline();
        // Two GETs sent back to back before any response.
        p.on_client_bytes(
            b"GET /first HTTP/1.1\r\nHost: h\r\n\r\nGET /second HTTP/1.1\r\nHost: h\r\n\r\n",
        )
        .unwrap();
        p.on_server_bytes(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nA",
        )
        .unwrap();
        p.on_server_bytes(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 1\r\n\r\nB",
        )
        .unwrap();

        let (items, _) = ring.since(0);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].value.request.path, "/first");
        assert_eq!(items[0].value.response.as_ref().unwrap().status, 200);
        assert_eq!(items[1].value.request.path, "/second");
        assert_eq!(items[1].value.response.as_ref().unwrap().status, 404);
    }

    #[test]
    fn head_response_does_not_consume_body_framing() {
        let (mut p, ring) = pipeline();
        p.on_client_bytes(b"HEAD /x HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        // Content-Length describes what a GET would have returned; a HEAD
        // response still ends at the header block.
        p.on_server_bytes(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5000\r\n\r\n",
        )
        .unwrap();

        let (items, _) = ring.since(0);
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].value.response.as_ref().unwrap().body_size,
            0
        );
    }

    #[test]
    fn connect_yields_tunnel_directive_and_records_exchange() {
        let (mut p, ring) = pipeline();
        let directive = p
            .on_client_bytes(
                b"CONNECT inner.example.com:443 HTTP/1.1\r\nHost: inner.example.com:443\r\n\r\n",
            )
            .unwrap();
        assert_eq!(
            directive,
            Some(TunnelDirective {
                host: "inner.example.com".into(),
                port: 443
            })
        );

        // The proxy answers the CONNECT itself; the exchange records the
        // synthesized response.
        let (items, _) = ring.since(0);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].value.request.method, "CONNECT");
        assert_eq!(items[0].value.response.as_ref().unwrap().status, 200);
    }

    #[test]
    fn tunneled_bytes_survive_the_connect_upgrade() {
        let (mut p, _ring) = pipeline();
        let mut wire =
            b"CONNECT h:443 HTTP/1.1\r\nHost: h:443\r\n\r\n".to_vec();
        wire.extend_from_slice(&[0x16, 0x03, 0x01, 0x00, 0x05]);
        let directive = p.on_client_bytes(&wire).unwrap();
        assert!(directive.is_some());
        assert_eq!(
            p.drain_client_buffer(),
            vec![0x16, 0x03, 0x01, 0x00, 0x05]
        );
    }

    #[test]
    fn close_mid_response_emits_error_tagged_exchange() {
        let (mut p, ring) = pipeline();
        p.on_client_bytes(b"GET /big HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        p.on_server_bytes(
            b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial",
        )
        .unwrap();
        p.on_close(Some("peer closed"));

        let (items, _) = ring.since(0);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].value.error.as_deref(), Some("peer closed"));
    }

    #[test]
    fn close_with_unanswered_request_tags_it() {
        let (mut p, ring) = pipeline();
        p.on_client_bytes(b"GET /never HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        p.on_close(None);

        let (items, _) = ring.since(0);
        assert_eq!(items.len(), 1);
        assert!(items[0].value.response.is_none());
        assert_eq!(
            items[0].value.error.as_deref(),
            Some("flow closed before response")
        );
    }

    #[test]
    fn until_close_response_completes_on_close() {
        let (mut p, ring) = pipeline();
        p.on_client_bytes(b"GET /stream HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        p.on_server_bytes(b"HTTP/1.1 200 OK\r\n\r\nstreaming data")
            .unwrap();
        p.on_close(None);

        let (items, _) = ring.since(0);
        assert_eq!(items.len(), 1);
        let response = items[0].value.response.as_ref().unwrap();
        assert_eq!(response.body_size, 14);
        assert!(items[0].value.error.is_none());
    }
}
