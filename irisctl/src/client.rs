//! IPC client for the extension daemons. Connections are established
//! fresh on demand; an interrupted channel is torn down completely and
//! redialed with bounded backoff rather than reused.

use std::path::{Path, PathBuf};
use std::time::Duration;

use iris_core::ipc::{self, IpcError, IpcFramed};
use iris_model::ipc::{IpcRequest, IpcResponse};
use tokio::net::UnixStream;
use tracing::{debug, warn};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_millis(250);

pub struct IpcClient {
    framed: IpcFramed<UnixStream>,
    path: PathBuf,
    call_timeout: Duration,
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("socket", &self.path)
            .finish()
    }
}

impl IpcClient {
    /// Dial the extension socket, retrying with bounded backoff.
    pub async fn connect(
        path: &Path,
        call_timeout: Duration,
    ) -> Result<Self, IpcError> {
        let mut attempt = 0;
        let stream = loop {
            match UnixStream::connect(path).await {
                Ok(stream) => break stream,
                Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                    attempt += 1;
                    let backoff = CONNECT_BACKOFF * 2u32.pow(attempt);
                    warn!(
                        target: "ipc::client",
                        socket = %path.display(),
                        error = %e,
                        attempt,
                        "connect failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(IpcError::Io(e)),
            }
        };
        debug!(
            target: "ipc::client",
            socket = %path.display(),
            "connected"
        );
        Ok(Self {
            framed: ipc::framed(stream),
            path: path.to_path_buf(),
            call_timeout,
        })
    }

    /// One request/reply exchange. A timeout or channel error poisons the
    /// client; callers reconnect rather than retry on the same handle.
    pub async fn call(
        &mut self,
        request: IpcRequest,
    ) -> Result<IpcResponse, IpcError> {
        let exchange = async {
            ipc::send(&mut self.framed, &request).await?;
            match ipc::recv::<_, IpcResponse>(&mut self.framed).await? {
                Some(response) => Ok(response),
                None => Err(IpcError::Closed),
            }
        };
        match tokio::time::timeout(self.call_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(IpcError::Timeout),
        }
    }
}
