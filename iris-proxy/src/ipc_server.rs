//! IPC service: a Unix socket the supervisor connects to. Connection
//! acceptance authenticates the peer before any request is served;
//! request handling itself is a pure function over daemon state, so tests
//! drive it directly.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use iris_core::ca::CertAuthority;
use iris_core::firewall::FirewallError;
use iris_core::ipc::{self, PeerIdentity, PeerPolicy};
use iris_model::ids::FlowId;
use iris_model::ipc::{
    ConversationSegment, IpcErrorKind, IpcRequest, IpcResponse, RawFlowData,
};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::daemon::DaemonState;

/// Bind the socket and serve until shutdown. The stale socket file from a
/// previous run is removed first; binding is exclusive thereafter.
pub async fn run(state: Arc<DaemonState>) -> anyhow::Result<()> {
    let path = state.config.ipc.socket_path.clone();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    let policy = PeerPolicy::supervisor_default(process_uid());
    info!(
        target: "ipc",
        socket = %path.display(),
        "ipc service listening"
    );

    loop {
        let stream = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(target: "ipc", error = %e, "accept failed");
                    continue;
                }
            },
        };

        match authenticate(&stream, &policy) {
            Ok(peer) => {
                debug!(
                    target: "ipc",
                    uid = peer.uid,
                    pid = peer.pid,
                    "peer accepted"
                );
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    serve_connection(state, stream).await;
                });
            }
            Err(e) => {
                // Refused: logged, connection dropped, nothing served.
                warn!(target: "ipc", error = %e, "peer refused");
            }
        }
    }
    Ok(())
}

fn process_uid() -> u32 {
    // The daemon's own uid, via procfs rather than a libc binding.
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self")
        .map(|m| m.uid())
        .unwrap_or(0)
}

fn authenticate(
    stream: &UnixStream,
    policy: &PeerPolicy,
) -> Result<PeerIdentity, ipc::IpcError> {
    let cred = stream.peer_cred().map_err(ipc::IpcError::Io)?;
    let pid = cred.pid().map(|p| p as u32);
    let exe = pid.and_then(|pid| {
        std::fs::read_link(format!("/proc/{pid}/exe")).ok()
    });
    let peer = PeerIdentity {
        uid: cred.uid(),
        pid,
        exe,
    };
    policy.verify(&peer)?;
    Ok(peer)
}

async fn serve_connection(state: Arc<DaemonState>, stream: UnixStream) {
    let mut framed = ipc::framed(stream);
    loop {
        let request: IpcRequest = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            request = ipc::recv(&mut framed) => match request {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "ipc", error = %e, "receive failed");
                    break;
                }
            },
        };

        let response = handle_request(&state, request).await;
        if let Err(e) = ipc::send(&mut framed, &response).await {
            warn!(target: "ipc", error = %e, "send failed");
            break;
        }
    }
}

/// One request, one reply. Every failure is a typed error response; no
/// request aborts the connection.
pub async fn handle_request(
    state: &Arc<DaemonState>,
    request: IpcRequest,
) -> IpcResponse {
    match request {
        IpcRequest::GetStatus => IpcResponse::Status(state.status()),
        IpcRequest::SetInterceptionEnabled(enabled) => {
            state.interception.store(enabled, Ordering::Relaxed);
            info!(target: "ipc", enabled, "interception toggled");
            IpcResponse::Ok
        }
        IpcRequest::SetCaptureMemoryBudget(bytes) => {
            state.capture_budget.store(bytes, Ordering::Relaxed);
            state.exchanges.set_byte_budget(bytes);
            info!(target: "ipc", bytes, "capture budget adjusted");
            IpcResponse::Ok
        }
        IpcRequest::AddFirewallRule(rule) => {
            match state.firewall.add_rule(rule) {
                Ok(()) => IpcResponse::Ok,
                Err(e) => firewall_error(e),
            }
        }
        IpcRequest::RemoveFirewallRule(id) => {
            match state.firewall.remove_rule(&id) {
                Ok(()) => IpcResponse::Ok,
                Err(e) => firewall_error(e),
            }
        }
        IpcRequest::ToggleFirewallRule(id) => {
            match state.firewall.toggle_rule(&id) {
                Ok(_) => IpcResponse::Ok,
                Err(e) => firewall_error(e),
            }
        }
        IpcRequest::ListFirewallRules => {
            IpcResponse::FirewallRules(state.firewall.list())
        }
        IpcRequest::CleanupExpiredRules => {
            match state.firewall.cleanup_expired() {
                Ok(count) => IpcResponse::CleanedUp { count },
                Err(e) => firewall_error(e),
            }
        }
        IpcRequest::GetRawData(flow_id) => raw_data(state, flow_id),
        IpcRequest::GetConversation(flow_id) => conversation(state, flow_id),
        IpcRequest::InstallCa { pem } => {
            match CertAuthority::from_pem(&pem) {
                Ok(ca) => {
                    *state.ca.write().await = Some(Arc::new(ca));
                    info!(target: "ipc", "root ca installed");
                    IpcResponse::Ok
                }
                Err(e) => IpcResponse::error(
                    IpcErrorKind::InvalidArgument,
                    e.to_string(),
                ),
            }
        }
        IpcRequest::PollFlows { cursor } => {
            let (items, cursor) = state.flows.since(cursor);
            IpcResponse::Flows {
                items: items.into_iter().map(|s| s.value).collect(),
                cursor,
            }
        }
        IpcRequest::PollExchanges { cursor } => {
            let (items, cursor) = state.exchanges.since(cursor);
            IpcResponse::Exchanges {
                items: items.into_iter().map(|s| s.value).collect(),
                cursor,
            }
        }
        IpcRequest::PollDns { cursor } => {
            let (items, cursor) = state.dns_queries.since(cursor);
            IpcResponse::Dns {
                items: items.into_iter().map(|s| s.value).collect(),
                cursor,
            }
        }
        IpcRequest::PollEvents { cursor } => {
            let (items, cursor) = state.events.since(cursor);
            IpcResponse::Events {
                items: items.into_iter().map(|s| s.value).collect(),
                cursor,
            }
        }
        IpcRequest::PollAlerts { cursor } => {
            let (items, cursor) = state.alerts.since(cursor);
            IpcResponse::Alerts {
                items: items.into_iter().map(|s| s.value).collect(),
                cursor,
            }
        }
    }
}

fn firewall_error(error: FirewallError) -> IpcResponse {
    let kind = match &error {
        FirewallError::RuleNotFound(_) => IpcErrorKind::NotFound,
        FirewallError::DuplicateRule(_)
        | FirewallError::NonNumericPort(_) => IpcErrorKind::InvalidArgument,
        FirewallError::Persist(_) | FirewallError::Load(_) => {
            IpcErrorKind::Internal
        }
    };
    IpcResponse::error(kind, error.to_string())
}

fn raw_data(state: &Arc<DaemonState>, flow_id: FlowId) -> IpcResponse {
    if let Some(record) = state.table.get(&flow_id) {
        return IpcResponse::RawData(RawFlowData {
            out_bytes: record.bytes_out,
            in_bytes: record.bytes_in,
        });
    }
    // Closed flows live on the ring until evicted.
    let (records, _) = state.flows.since(0);
    match records.iter().rev().find(|r| r.value.id == flow_id) {
        Some(record) => IpcResponse::RawData(RawFlowData {
            out_bytes: record.value.bytes_out,
            in_bytes: record.value.bytes_in,
        }),
        None => IpcResponse::error(
            IpcErrorKind::NotFound,
            format!("flow {flow_id} unknown"),
        ),
    }
}

fn conversation(state: &Arc<DaemonState>, flow_id: FlowId) -> IpcResponse {
    let (exchanges, _) = state.exchanges.since(0);
    let mut segments = Vec::new();
    for exchange in exchanges
        .iter()
        .map(|s| &s.value)
        .filter(|e| e.flow_id == flow_id)
    {
        segments.push(ConversationSegment {
            outbound: true,
            summary: format!(
                "{} {}",
                exchange.request.method, exchange.request.path
            ),
            bytes: exchange.request.body_size,
            at: exchange.started_at,
        });
        if let Some(response) = &exchange.response {
            segments.push(ConversationSegment {
                outbound: false,
                summary: format!("{} {}", response.status, response.reason),
                bytes: response.body_size,
                at: exchange.completed_at.unwrap_or(exchange.started_at),
            });
        }
    }
    if segments.is_empty() {
        return IpcResponse::error(
            IpcErrorKind::NotFound,
            format!("no conversation for flow {flow_id}"),
        );
    }
    IpcResponse::Conversation(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_config::IrisConfig;
    use iris_model::firewall::FirewallRule;

    async fn test_state() -> (Arc<DaemonState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = IrisConfig::default();
        config.proxy.firewall_rules_path = dir.path().join("rules.json");
        (DaemonState::init(config).unwrap(), dir)
    }

    #[tokio::test]
    async fn status_round_trips() {
        let (state, _dir) = test_state().await;
        let response =
            handle_request(&state, IpcRequest::GetStatus).await;
        let IpcResponse::Status(status) = response else {
            panic!("expected status");
        };
        assert_eq!(status.extension, "iris-proxy");
    }

    #[tokio::test]
    async fn firewall_rules_round_trip_over_ipc() {
        let (state, _dir) = test_state().await;

        let rule =
            FirewallRule::block("no-curl").with_process_path("/usr/bin/curl");
        assert!(matches!(
            handle_request(
                &state,
                IpcRequest::AddFirewallRule(rule.clone())
            )
            .await,
            IpcResponse::Ok
        ));

        // A duplicate id is a typed error, not a dropped connection.
        assert!(matches!(
            handle_request(&state, IpcRequest::AddFirewallRule(rule)).await,
            IpcResponse::Error {
                kind: IpcErrorKind::InvalidArgument,
                ..
            }
        ));

        let IpcResponse::FirewallRules(rules) =
            handle_request(&state, IpcRequest::ListFirewallRules).await
        else {
            panic!("expected rules");
        };
        assert_eq!(rules.len(), 1);

        assert!(matches!(
            handle_request(
                &state,
                IpcRequest::RemoveFirewallRule("no-curl".into())
            )
            .await,
            IpcResponse::Ok
        ));
        assert!(matches!(
            handle_request(
                &state,
                IpcRequest::RemoveFirewallRule("no-curl".into())
            )
            .await,
            IpcResponse::Error {
                kind: IpcErrorKind::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn capture_budget_is_adjustable() {
        let (state, _dir) = test_state().await;
        handle_request(
            &state,
            IpcRequest::SetCaptureMemoryBudget(1024 * 1024),
        )
        .await;
        let IpcResponse::Status(status) =
            handle_request(&state, IpcRequest::GetStatus).await
        else {
            panic!("expected status");
        };
        assert_eq!(status.capture_budget_bytes, 1024 * 1024);
    }

    #[tokio::test]
    async fn poll_cursors_advance() {
        let (state, _dir) = test_state().await;

        let IpcResponse::Alerts { items, cursor } =
            handle_request(&state, IpcRequest::PollAlerts { cursor: 0 })
                .await
        else {
            panic!("expected alerts");
        };
        assert!(items.is_empty());
        assert_eq!(cursor, 0);
    }

    #[tokio::test]
    async fn unknown_flow_raw_data_is_not_found() {
        let (state, _dir) = test_state().await;
        assert!(matches!(
            handle_request(&state, IpcRequest::GetRawData(FlowId::new()))
                .await,
            IpcResponse::Error {
                kind: IpcErrorKind::NotFound,
                ..
            }
        ));
    }
}
