//! Ordered first-match firewall. Evaluation is a pure function of
//! (rules, flow); mutations persist to disk before they are visible.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use iris_model::firewall::{FirewallAction, FirewallRule};
use iris_model::ids::RuleId;
use parking_lot::Mutex;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("rule {0} already exists")]
    DuplicateRule(RuleId),

    #[error("rule {0} not found")]
    RuleNotFound(RuleId),

    #[error("port {0:?} is not numeric")]
    NonNumericPort(String),

    #[error("persisting rules: {0}")]
    Persist(#[from] std::io::Error),

    #[error("loading rules: {0}")]
    Load(String),
}

/// The flow attributes a rule can predicate on.
#[derive(Debug, Clone, Copy)]
pub struct FlowDescriptor<'a> {
    pub process_path: &'a str,
    pub signing_id: Option<&'a str>,
    pub remote_host: &'a str,
    pub remote_port: u16,
}

/// Parse a user-supplied port string. Non-numeric input is an error at
/// insert time, never coerced.
pub fn parse_port(raw: &str) -> Result<u16, FirewallError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FirewallError::NonNumericPort(raw.to_string()));
    }
    trimmed
        .parse()
        .map_err(|_| FirewallError::NonNumericPort(raw.to_string()))
}

/// Pure evaluation over an ordered rule snapshot: first rule whose declared
/// predicates all match wins; absent predicates are wildcards; inactive and
/// expired rules are skipped; the default is allow.
pub fn evaluate(
    rules: &[FirewallRule],
    flow: &FlowDescriptor<'_>,
) -> FirewallAction {
    let now = Utc::now();
    for rule in rules {
        if !rule.active || rule.is_expired(now) {
            continue;
        }
        if rule_matches(rule, flow) {
            return rule.action;
        }
    }
    FirewallAction::Allow
}

fn rule_matches(rule: &FirewallRule, flow: &FlowDescriptor<'_>) -> bool {
    if let Some(glob) = &rule.process_path {
        if !glob_match(glob, flow.process_path) {
            return false;
        }
    }
    if let Some(expected) = &rule.signing_id {
        match flow.signing_id {
            Some(actual) if actual == expected => {}
            _ => return false,
        }
    }
    if let Some(glob) = &rule.remote_host {
        if !glob_match(glob, flow.remote_host) {
            return false;
        }
    }
    if let Some(port) = rule.remote_port {
        if port != flow.remote_port {
            return false;
        }
    }
    true
}

/// Glob with `*` (any run) and `?` (any one byte), case-sensitive.
/// Iterative with single-star backtracking.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<u8> = pattern.bytes().collect();
    let t: Vec<u8> = text.bytes().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// In-memory ordered rule list with synchronous on-disk persistence.
#[derive(Debug)]
pub struct Firewall {
    rules: Mutex<Vec<FirewallRule>>,
    store_path: Option<PathBuf>,
}

impl Firewall {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            store_path: None,
        }
    }

    /// Load persisted rules from `path`, creating an empty list when the
    /// file does not exist yet.
    pub fn with_store(path: impl Into<PathBuf>) -> Result<Self, FirewallError> {
        let path = path.into();
        let rules = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| FirewallError::Load(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(FirewallError::Persist(e)),
        };
        info!(
            target: "firewall",
            path = %path.display(),
            rules = rules.len(),
            "loaded firewall rules"
        );
        Ok(Self {
            rules: Mutex::new(rules),
            store_path: Some(path),
        })
    }

    pub fn evaluate(&self, flow: &FlowDescriptor<'_>) -> FirewallAction {
        let rules = self.rules.lock();
        let action = evaluate(&rules, flow);
        debug!(
            target: "firewall",
            process = flow.process_path,
            remote = flow.remote_host,
            port = flow.remote_port,
            action = action.as_str(),
            "evaluated flow"
        );
        action
    }

    pub fn add_rule(&self, rule: FirewallRule) -> Result<(), FirewallError> {
        let mut rules = self.rules.lock();
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(FirewallError::DuplicateRule(rule.id));
        }
        let mut next = rules.clone();
        next.push(rule);
        self.persist(&next)?;
        *rules = next;
        Ok(())
    }

    pub fn remove_rule(&self, id: &RuleId) -> Result<(), FirewallError> {
        let mut rules = self.rules.lock();
        if !rules.iter().any(|r| &r.id == id) {
            return Err(FirewallError::RuleNotFound(id.clone()));
        }
        let next: Vec<FirewallRule> =
            rules.iter().filter(|r| &r.id != id).cloned().collect();
        self.persist(&next)?;
        *rules = next;
        Ok(())
    }

    pub fn toggle_rule(&self, id: &RuleId) -> Result<bool, FirewallError> {
        let mut rules = self.rules.lock();
        let mut next = rules.clone();
        let rule = next
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| FirewallError::RuleNotFound(id.clone()))?;
        rule.active = !rule.active;
        let active = rule.active;
        self.persist(&next)?;
        *rules = next;
        Ok(active)
    }

    pub fn list(&self) -> Vec<FirewallRule> {
        self.rules.lock().clone()
    }

    /// Drop expired rules; runs on the daemon's 60 s sweep timer.
    pub fn cleanup_expired(&self) -> Result<usize, FirewallError> {
        let now = Utc::now();
        let mut rules = self.rules.lock();
        let before = rules.len();
        let next: Vec<FirewallRule> = rules
            .iter()
            .filter(|r| !r.is_expired(now))
            .cloned()
            .collect();
        let removed = before - next.len();
        if removed > 0 {
            self.persist(&next)?;
            *rules = next;
            info!(target: "firewall", removed, "swept expired rules");
        }
        Ok(removed)
    }

    /// Atomic rewrite: temp file in the same directory, then rename.
    fn persist(&self, rules: &[FirewallRule]) -> Result<(), FirewallError> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_vec_pretty(rules)
            .expect("firewall rules always serialize");
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| FirewallError::Persist(e.error))?;
        Ok(())
    }
}

impl Default for Firewall {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn flow<'a>(process: &'a str, host: &'a str, port: u16) -> FlowDescriptor<'a> {
        FlowDescriptor {
            process_path: process,
            signing_id: None,
            remote_host: host,
            remote_port: port,
        }
    }

    #[test]
    fn first_match_wins_block_then_allow() {
        let rules = vec![
            FirewallRule::block("no-curl").with_process_path("/usr/bin/curl"),
            FirewallRule::allow("default"),
        ];
        assert_eq!(
            evaluate(&rules, &flow("/usr/bin/curl", "example.com", 443)),
            FirewallAction::Block
        );
        assert_eq!(
            evaluate(&rules, &flow("/usr/bin/wget", "example.com", 443)),
            FirewallAction::Allow
        );
    }

    #[test]
    fn allowlist_then_block_everything_else() {
        let rules = vec![
            FirewallRule::allow("api").with_remote_host("api.example.com"),
            FirewallRule::block("deny-rest"),
        ];
        assert_eq!(
            evaluate(&rules, &flow("/bin/a", "api.example.com", 443)),
            FirewallAction::Allow
        );
        assert_eq!(
            evaluate(&rules, &flow("/bin/a", "other.example.com", 443)),
            FirewallAction::Block
        );
    }

    #[test]
    fn default_is_allow() {
        assert_eq!(
            evaluate(&[], &flow("/bin/x", "example.com", 80)),
            FirewallAction::Allow
        );
    }

    #[test]
    fn expired_and_inactive_rules_are_skipped() {
        let mut expired = FirewallRule::block("old");
        expired.expires_at = Some(Utc::now() - ChronoDuration::minutes(1));
        let mut inactive = FirewallRule::block("off");
        inactive.active = false;
        let rules = vec![expired, inactive];
        assert_eq!(
            evaluate(&rules, &flow("/bin/x", "example.com", 80)),
            FirewallAction::Allow
        );
    }

    #[test]
    fn globs() {
        assert!(glob_match("/usr/bin/*", "/usr/bin/curl"));
        assert!(glob_match("*.example.com", "api.example.com"));
        assert!(!glob_match("*.example.com", "example.com"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("/opt/?pp", "/opt/app"));
        assert!(!glob_match("/usr/bin/curl", "/usr/bin/curlx"));
    }

    #[test]
    fn non_numeric_port_is_rejected() {
        assert!(matches!(
            parse_port("https"),
            Err(FirewallError::NonNumericPort(_))
        ));
        assert!(matches!(
            parse_port("44a3"),
            Err(FirewallError::NonNumericPort(_))
        ));
        assert_eq!(parse_port(" 443 ").unwrap(), 443);
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let firewall = Firewall::with_store(&path).unwrap();
        firewall
            .add_rule(
                FirewallRule::block("no-curl")
                    .with_process_path("/usr/bin/curl"),
            )
            .unwrap();
        firewall
            .add_rule(FirewallRule::allow("api").with_remote_port(443))
            .unwrap();

        let reloaded = Firewall::with_store(&path).unwrap();
        let rules = reloaded.list();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id.as_str(), "no-curl");
        assert_eq!(rules[1].remote_port, Some(443));
    }

    #[test]
    fn duplicate_rule_rejected_and_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let firewall = Firewall::with_store(&path).unwrap();
        firewall.add_rule(FirewallRule::block("x")).unwrap();
        assert!(matches!(
            firewall.add_rule(FirewallRule::allow("x")),
            Err(FirewallError::DuplicateRule(_))
        ));
        assert_eq!(Firewall::with_store(&path).unwrap().list().len(), 1);
    }

    #[test]
    fn cleanup_reports_removed_count() {
        let firewall = Firewall::new();
        let mut expiring = FirewallRule::block("soon");
        expiring.expires_at = Some(Utc::now() - ChronoDuration::seconds(1));
        firewall.add_rule(expiring).unwrap();
        firewall.add_rule(FirewallRule::allow("keep")).unwrap();

        assert_eq!(firewall.cleanup_expired().unwrap(), 1);
        assert_eq!(firewall.list().len(), 1);
        assert_eq!(firewall.cleanup_expired().unwrap(), 0);
    }
}
