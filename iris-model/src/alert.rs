use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{EventActor, SecurityEvent};
use crate::ids::{AlertId, RuleId};

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
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// A fired detection. Duplicate fires within the dedup window collapse onto
/// the first row with `count` incremented; the evidence of the first fire is
/// retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub rule_id: RuleId,
    pub rule_name: String,
    pub severity: Severity,
    pub mitre_id: String,
    pub mitre_name: String,
    pub actor: EventActor,
    /// Contributing events, in the order they completed the rule.
    pub evidence: Vec<SecurityEvent>,
    pub timestamp: DateTime<Utc>,
    /// Repeat fires collapsed into this row within the dedup window.
    pub count: u64,
}

impl Alert {
    /// Dedup identity: rule plus the actor's most stable handle.
    pub fn dedup_key(&self) -> (RuleId, String) {
        let actor = if self.actor.path.is_empty() {
            self.actor.pid.to_string()
        } else {
            self.actor.path.clone()
        };
        (self.rule_id.clone(), actor)
    }
}
