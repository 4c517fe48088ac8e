use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::RuleId;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FirewallAction {
    Allow,
    Block,
}

impl FirewallAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallAction::Allow => "allow",
            FirewallAction::Block => "block",
        }
    }
}

/// One ordered firewall rule. An absent predicate is a wildcard; evaluation
/// is first-match-wins over the active, unexpired list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub id: RuleId,
    pub action: FirewallAction,
    /// Glob over the source process path ("/usr/bin/*").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_id: Option<String>,
    /// Glob over the remote host ("*.example.com").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl FirewallRule {
    pub fn allow(id: impl Into<RuleId>) -> Self {
        Self::new(id, FirewallAction::Allow)
    }

    pub fn block(id: impl Into<RuleId>) -> Self {
        Self::new(id, FirewallAction::Block)
    }

    fn new(id: impl Into<RuleId>, action: FirewallAction) -> Self {
        Self {
            id: id.into(),
            action,
            process_path: None,
            signing_id: None,
            remote_host: None,
            remote_port: None,
            active: true,
            expires_at: None,
        }
    }

    pub fn with_process_path(mut self, glob: impl Into<String>) -> Self {
        self.process_path = Some(glob.into());
        self
    }

    pub fn with_remote_host(mut self, glob: impl Into<String>) -> Self {
        self.remote_host = Some(glob.into());
        self
    }

    pub fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = Some(port);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl From<String> for RuleId {
    fn from(id: String) -> Self {
        RuleId(id)
    }
}
