use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::FlowId;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

/// Lifecycle of a claimed flow. Directional close moves to the matching
/// half-closed state; both halves closed (or a fatal pipeline error) is
/// terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Active,
    HalfClosedIn,
    HalfClosedOut,
    Closed,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Active => "active",
            FlowState::HalfClosedIn => "half_closed_in",
            FlowState::HalfClosedOut => "half_closed_out",
            FlowState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Source-process identity extracted from the flow's audit token at claim
/// time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowAttribution {
    pub pid: u32,
    pub process_path: String,
    pub signing_id: Option<String>,
}

impl FlowAttribution {
    pub fn process_name(&self) -> &str {
        self.process_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.process_path)
    }
}

/// Snapshot of a flow's metadata as held by the connection table. The live
/// pipeline owns the flow handle; this record never references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: FlowId,
    pub transport: Transport,
    pub attribution: FlowAttribution,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub sni_host: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub state: FlowState,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl FlowRecord {
    pub fn new(
        transport: Transport,
        attribution: FlowAttribution,
        local: Endpoint,
        remote: Endpoint,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: FlowId::new(),
            transport,
            attribution,
            local,
            remote,
            sni_host: None,
            bytes_in: 0,
            bytes_out: 0,
            state: FlowState::Active,
            first_seen: now,
            last_activity: now,
        }
    }
}
