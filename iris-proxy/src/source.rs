//! Flow claiming. The kernel interface that intercepts outbound traffic is
//! an external collaborator; it hands the daemon `ClaimedFlow`s through a
//! `FlowInjector`. Tests inject flows backed by in-memory duplex streams,
//! the production extension glue injects real sockets.

use iris_model::flow::{Endpoint, FlowAttribution, Transport};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Byte stream to and from the claiming process.
pub trait FlowByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> FlowByteStream for T {}

pub type BoxedStream = Box<dyn FlowByteStream>;

/// Datagram channel for UDP flows: one `Vec<u8>` per datagram, either
/// direction.
#[derive(Debug)]
pub struct DatagramChannel {
    pub rx: mpsc::Receiver<Vec<u8>>,
    pub tx: mpsc::Sender<Vec<u8>>,
}

pub enum ClientIo {
    Stream(BoxedStream),
    Datagram(DatagramChannel),
}

impl std::fmt::Debug for ClientIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientIo::Stream(_) => f.write_str("ClientIo::Stream"),
            ClientIo::Datagram(_) => f.write_str("ClientIo::Datagram"),
        }
    }
}

/// One outbound flow as offered by the kernel, with source-process
/// attribution already extracted from the audit token.
#[derive(Debug)]
pub struct ClaimedFlow {
    pub transport: Transport,
    pub attribution: FlowAttribution,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub client: ClientIo,
}

/// Producer handle the extension glue uses to offer flows to the router.
#[derive(Debug, Clone)]
pub struct FlowInjector {
    tx: mpsc::Sender<ClaimedFlow>,
}

impl FlowInjector {
    pub async fn offer(
        &self,
        flow: ClaimedFlow,
    ) -> Result<(), mpsc::error::SendError<ClaimedFlow>> {
        self.tx.send(flow).await
    }
}

/// The router's receiving end.
pub fn flow_channel(capacity: usize) -> (FlowInjector, mpsc::Receiver<ClaimedFlow>) {
    let (tx, rx) = mpsc::channel(capacity);
    (FlowInjector { tx }, rx)
}
