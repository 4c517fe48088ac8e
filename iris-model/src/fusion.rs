use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::Severity;
use crate::ids::CampaignId;

/// The 14 ordered kill-chain phases findings are mapped onto.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum KillChainStage {
    Reconnaissance,
    ResourceDevelopment,
    InitialAccess,
    Execution,
    Persistence,
    PrivilegeEscalation,
    DefenseEvasion,
    CredentialAccess,
    Discovery,
    LateralMovement,
    Collection,
    CommandAndControl,
    Exfiltration,
    Impact,
}

impl KillChainStage {
    pub const ALL: [KillChainStage; 14] = [
        KillChainStage::Reconnaissance,
        KillChainStage::ResourceDevelopment,
        KillChainStage::InitialAccess,
        KillChainStage::Execution,
        KillChainStage::Persistence,
        KillChainStage::PrivilegeEscalation,
        KillChainStage::DefenseEvasion,
        KillChainStage::CredentialAccess,
        KillChainStage::Discovery,
        KillChainStage::LateralMovement,
        KillChainStage::Collection,
        KillChainStage::CommandAndControl,
        KillChainStage::Exfiltration,
        KillChainStage::Impact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KillChainStage::Reconnaissance => "reconnaissance",
            KillChainStage::ResourceDevelopment => "resource-development",
            KillChainStage::InitialAccess => "initial-access",
            KillChainStage::Execution => "execution",
            KillChainStage::Persistence => "persistence",
            KillChainStage::PrivilegeEscalation => "privilege-escalation",
            KillChainStage::DefenseEvasion => "defense-evasion",
            KillChainStage::CredentialAccess => "credential-access",
            KillChainStage::Discovery => "discovery",
            KillChainStage::LateralMovement => "lateral-movement",
            KillChainStage::Collection => "collection",
            KillChainStage::CommandAndControl => "command-and-control",
            KillChainStage::Exfiltration => "exfiltration",
            KillChainStage::Impact => "impact",
        }
    }
}

/// Deduplication key for accumulated evidence.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case", tag = "kind", content = "key")]
pub enum EntityKey {
    /// A live process, keyed by pid.
    Process(u32),
    /// A code-signing identity shared by any number of processes.
    SigningIdentity(String),
    /// A remote peer address.
    NetworkPeer(String),
}

impl EntityKey {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityKey::Process(_) => EntityKind::Process,
            EntityKey::SigningIdentity(_) => EntityKind::SigningIdentity,
            EntityKey::NetworkPeer(_) => EntityKind::NetworkPeer,
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKey::Process(pid) => write!(f, "process:{pid}"),
            EntityKey::SigningIdentity(id) => write!(f, "signing:{id}"),
            EntityKey::NetworkPeer(addr) => write!(f, "peer:{addr}"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Process,
    SigningIdentity,
    NetworkPeer,
}

/// Where a piece of evidence came from: a detection rule or a batch scanner.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case", tag = "origin", content = "id")]
pub enum EvidenceOrigin {
    Rule(String),
    Scanner(String),
}

impl EvidenceOrigin {
    pub fn id(&self) -> &str {
        match self {
            EvidenceOrigin::Rule(id) | EvidenceOrigin::Scanner(id) => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub origin: EvidenceOrigin,
    pub summary: String,
    pub severity: Severity,
    /// MITRE technique id when known ("T1059.002").
    pub mitre_id: Option<String>,
    /// Contribution weight in [0, 1].
    pub weight: f64,
    /// Set when the finding matches an allowlisted baseline; labelled but
    /// never discounts the score.
    pub baseline: bool,
    pub observed_at: DateTime<Utc>,
}

/// Read model of an entity's accumulated state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySummary {
    pub key: EntityKey,
    pub evidence: Vec<Evidence>,
    pub stages: Vec<KillChainStage>,
    pub score: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum CampaignClass {
    DataTheft,
    Implant,
    Destructive,
    Evasion,
    Apt,
    Uncategorized,
}

impl CampaignClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignClass::DataTheft => "dataTheft",
            CampaignClass::Implant => "implant",
            CampaignClass::Destructive => "destructive",
            CampaignClass::Evasion => "evasion",
            CampaignClass::Apt => "APT",
            CampaignClass::Uncategorized => "uncategorized",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub members: Vec<EntityKey>,
    pub stages: Vec<KillChainStage>,
    pub class: CampaignClass,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}
