//! IPC framing and peer policy for the supervisor <-> extension channel.
//!
//! Frames are length-delimited JSON over a local stream socket. The
//! message shapes live in `iris_model::ipc`; the daemon owns the listener
//! and the supervisor owns reconnection. Both sides speak through
//! `send`/`recv` here so framing stays in one place.

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::warn;

/// Poll replies carry ring contents; generous but bounded.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding: {0}")]
    Encoding(String),

    #[error("peer closed the channel")]
    Closed,

    #[error("peer rejected: {0}")]
    Unauthorized(String),

    #[error("call timed out")]
    Timeout,
}

pub type IpcFramed<T> = Framed<T, LengthDelimitedCodec>;

/// Wrap a stream with the wire framing both sides use.
pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> IpcFramed<T> {
    let mut codec = LengthDelimitedCodec::new();
    codec.set_max_frame_length(MAX_FRAME_BYTES);
    Framed::new(io, codec)
}

pub async fn send<T, M>(
    framed: &mut IpcFramed<T>,
    message: &M,
) -> Result<(), IpcError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    let payload = serde_json::to_vec(message)
        .map_err(|e| IpcError::Encoding(e.to_string()))?;
    framed.send(Bytes::from(payload)).await?;
    Ok(())
}

/// Receive the next frame, `Ok(None)` on clean close.
pub async fn recv<T, M>(
    framed: &mut IpcFramed<T>,
) -> Result<Option<M>, IpcError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: DeserializeOwned,
{
    match framed.next().await {
        Some(Ok(frame)) => serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| IpcError::Encoding(e.to_string())),
        Some(Err(e)) => Err(IpcError::Io(e)),
        None => Ok(None),
    }
}

/// What the daemon learns about a connecting peer from the socket and the
/// process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub uid: u32,
    pub pid: Option<u32>,
    pub exe: Option<PathBuf>,
}

/// Acceptance policy: the peer must run as one of the expected uids and,
/// when its executable is resolvable, match one of the expected images.
/// The compiled-in defaults pin the supervisor binary, the moral
/// equivalent of the original's team-identifier equality check.
#[derive(Debug, Clone)]
pub struct PeerPolicy {
    pub allowed_uids: Vec<u32>,
    pub allowed_exe_names: Vec<String>,
}

impl PeerPolicy {
    pub fn supervisor_default(daemon_uid: u32) -> Self {
        Self {
            // The daemon's own uid and root.
            allowed_uids: vec![daemon_uid, 0],
            allowed_exe_names: vec!["irisctl".into()],
        }
    }

    pub fn verify(&self, peer: &PeerIdentity) -> Result<(), IpcError> {
        if !self.allowed_uids.contains(&peer.uid) {
            warn!(
                target: "ipc",
                uid = peer.uid,
                "rejected connection from unexpected uid"
            );
            return Err(IpcError::Unauthorized(format!(
                "uid {} not permitted",
                peer.uid
            )));
        }
        if let Some(exe) = &peer.exe {
            let name = exe
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if !self.allowed_exe_names.iter().any(|n| n == &name) {
                warn!(
                    target: "ipc",
                    exe = %exe.display(),
                    "rejected connection from unexpected executable"
                );
                return Err(IpcError::Unauthorized(format!(
                    "executable {name:?} not permitted"
                )));
            }
        }
        // An unreadable executable link (already-exited peer, hardened
        // procfs) falls back to the uid check alone.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_model::ipc::{IpcRequest, IpcResponse};

    #[tokio::test]
    async fn request_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let mut client = framed(client);
        let mut server = framed(server);

        send(&mut client, &IpcRequest::GetStatus).await.unwrap();
        let got: IpcRequest = recv(&mut server).await.unwrap().unwrap();
        assert!(matches!(got, IpcRequest::GetStatus));

        send(&mut server, &IpcResponse::Ok).await.unwrap();
        let got: IpcResponse = recv(&mut client).await.unwrap().unwrap();
        assert!(matches!(got, IpcResponse::Ok));
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (client, server) = tokio::io::duplex(1024);
        drop(client);
        let mut server = framed(server);
        let got: Option<IpcRequest> = recv(&mut server).await.unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn policy_rejects_wrong_uid_and_exe() {
        let policy = PeerPolicy::supervisor_default(501);

        assert!(policy
            .verify(&PeerIdentity {
                uid: 501,
                pid: Some(100),
                exe: Some(PathBuf::from("/usr/local/bin/irisctl")),
            })
            .is_ok());

        assert!(matches!(
            policy.verify(&PeerIdentity {
                uid: 502,
                pid: None,
                exe: None,
            }),
            Err(IpcError::Unauthorized(_))
        ));

        assert!(matches!(
            policy.verify(&PeerIdentity {
                uid: 501,
                pid: Some(100),
                exe: Some(PathBuf::from("/tmp/impostor")),
            }),
            Err(IpcError::Unauthorized(_))
        ));
    }
}
