//! Wire shapes for the supervisor <-> extension control channel.
//!
//! Two message families: request/reply commands and cursor-based delta
//! polls. Poll replies carry `(items, new_cursor)`; the consumer stores the
//! cursor and only ever receives entries appended after it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::Alert;
use crate::dns::DnsQueryRecord;
use crate::event::SecurityEvent;
use crate::firewall::FirewallRule;
use crate::flow::FlowRecord;
use crate::http::CapturedExchange;
use crate::ids::{FlowId, RuleId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "body")]
pub enum IpcRequest {
    GetStatus,
    SetInterceptionEnabled(bool),
    SetCaptureMemoryBudget(u64),
    AddFirewallRule(FirewallRule),
    RemoveFirewallRule(RuleId),
    ToggleFirewallRule(RuleId),
    ListFirewallRules,
    CleanupExpiredRules,
    GetRawData(FlowId),
    GetConversation(FlowId),
    InstallCa {
        /// Root certificate plus private key, PEM-armored.
        pem: String,
    },
    PollFlows {
        cursor: u64,
    },
    PollExchanges {
        cursor: u64,
    },
    PollDns {
        cursor: u64,
    },
    PollEvents {
        cursor: u64,
    },
    PollAlerts {
        cursor: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "body")]
pub enum IpcResponse {
    Ok,
    Status(ExtensionStatus),
    FirewallRules(Vec<FirewallRule>),
    CleanedUp { count: usize },
    RawData(RawFlowData),
    Conversation(Vec<ConversationSegment>),
    Flows { items: Vec<FlowRecord>, cursor: u64 },
    Exchanges {
        items: Vec<CapturedExchange>,
        cursor: u64,
    },
    Dns {
        items: Vec<DnsQueryRecord>,
        cursor: u64,
    },
    Events {
        items: Vec<SecurityEvent>,
        cursor: u64,
    },
    Alerts { items: Vec<Alert>, cursor: u64 },
    Error { kind: IpcErrorKind, message: String },
}

impl IpcResponse {
    pub fn error(kind: IpcErrorKind, message: impl Into<String>) -> Self {
        IpcResponse::Error {
            kind,
            message: message.into(),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IpcErrorKind {
    NotFound,
    InvalidArgument,
    Unauthorized,
    Internal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawFlowData {
    pub out_bytes: u64,
    pub in_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSegment {
    pub outbound: bool,
    pub summary: String,
    pub bytes: u64,
    pub at: DateTime<Utc>,
}

/// Point-in-time health of one extension, as reported over `GetStatus` and
/// folded into the supervisor's JSON snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionStatus {
    pub extension: String,
    pub version: String,
    pub interception_enabled: bool,
    pub ca_installed: bool,
    pub active_flows: usize,
    pub flows_seen: u64,
    pub exchanges_captured: u64,
    pub dns_queries: u64,
    pub events_normalized: u64,
    pub alerts_fired: u64,
    pub capture_budget_bytes: u64,
    pub capture_used_bytes: u64,
    pub started_at: DateTime<Utc>,
}
