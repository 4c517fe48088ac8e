//! Core data model definitions shared across Iris crates.
#![allow(missing_docs)]

pub mod alert;
pub mod dns;
pub mod event;
pub mod firewall;
pub mod flow;
pub mod fusion;
pub mod http;
pub mod ids;
pub mod ipc;
pub mod scan;

// Intentionally curated re-exports for downstream consumers.
pub use alert::{Alert, Severity};
pub use dns::{DnsAnswer, DnsQueryRecord};
pub use event::{
    EventActor, EventKind, EventTarget, RawEsEvent, SecurityEvent,
    SigningStatus,
};
pub use firewall::{FirewallAction, FirewallRule};
pub use flow::{
    Endpoint, FlowAttribution, FlowRecord, FlowState, Transport,
};
pub use fusion::{
    Campaign, CampaignClass, EntityKey, EntityKind, EntitySummary, Evidence,
    EvidenceOrigin, KillChainStage,
};
pub use http::{CapturedExchange, CapturedMessage, Header};
pub use ids::{AlertId, CampaignId, FlowId, QueryId, RuleId};
pub use ipc::{ExtensionStatus, IpcRequest, IpcResponse, RawFlowData};
pub use scan::{
    ProcessAnomaly, ProcessInfo, ProcessSnapshot, ScanReport, ScannerOutcome,
    ScannerTier,
};
