//! Detection rule model: single-event rules over field predicates, and
//! ordered multi-stage correlation rules with a temporal window. Rules are
//! immutable once compiled; regex patterns are validated at load so
//! evaluation is infallible.

use std::time::Duration;

use iris_model::alert::Severity;
use iris_model::event::{EventKind, SecurityEvent, SigningStatus};
use iris_model::ids::RuleId;
use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("rule {rule}: invalid regex {pattern:?}: {source}")]
    InvalidRegex {
        rule: String,
        pattern: String,
        source: regex::Error,
    },

    #[error("rule {0}: correlation rule needs at least two stages")]
    TooFewStages(String),

    #[error("duplicate rule id {0}")]
    DuplicateId(String),
}

/// Event fields a predicate can inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKey {
    TargetPath,
    RemoteHost,
    RemotePort,
    RecordType,
    Args,
    ParentPath,
    ProcessName,
    Detail(String),
}

impl FieldKey {
    fn extract(&self, event: &SecurityEvent) -> Option<String> {
        use iris_model::event::EventTarget;
        match self {
            FieldKey::TargetPath => match &event.target {
                EventTarget::Path(p) => Some(p.clone()),
                _ => event.detail_field("target_path").map(str::to_string),
            },
            FieldKey::RemoteHost => match &event.target {
                EventTarget::Endpoint { host, .. } => Some(host.clone()),
                _ => event.detail_field("remote_host").map(str::to_string),
            },
            FieldKey::RemotePort => match &event.target {
                EventTarget::Endpoint { port, .. } => Some(port.to_string()),
                _ => event.detail_field("remote_port").map(str::to_string),
            },
            FieldKey::RecordType => {
                event.detail_field("record_type").map(str::to_string)
            }
            FieldKey::Args => event.detail_field("args").map(str::to_string),
            FieldKey::ParentPath => event.actor.parent_path.clone(),
            FieldKey::ProcessName => {
                Some(event.actor.process_name().to_string())
            }
            FieldKey::Detail(key) => {
                event.detail_field(key).map(str::to_string)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Equals { field: FieldKey, value: String },
    Contains { field: FieldKey, value: String },
    HasPrefix { field: FieldKey, value: String },
    Matches { field: FieldKey, regex: Regex },
    ProcessNameIn(Vec<String>),
    ProcessNameNotIn(Vec<String>),
    ParentNameIn(Vec<String>),
    NotAppleSigned,
}

impl Predicate {
    /// Compile a regex predicate, surfacing bad patterns at load time.
    pub fn matches(
        rule: &str,
        field: FieldKey,
        pattern: &str,
    ) -> Result<Self, RuleError> {
        let regex =
            Regex::new(pattern).map_err(|source| RuleError::InvalidRegex {
                rule: rule.to_string(),
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Predicate::Matches { field, regex })
    }

    /// A predicate over an absent field does not hold; evaluation never
    /// fails.
    pub fn holds(&self, event: &SecurityEvent) -> bool {
        match self {
            Predicate::Equals { field, value } => {
                field.extract(event).is_some_and(|v| v == *value)
            }
            Predicate::Contains { field, value } => field
                .extract(event)
                .is_some_and(|v| v.contains(value.as_str())),
            Predicate::HasPrefix { field, value } => field
                .extract(event)
                .is_some_and(|v| v.starts_with(value.as_str())),
            Predicate::Matches { field, regex } => {
                field.extract(event).is_some_and(|v| regex.is_match(&v))
            }
            Predicate::ProcessNameIn(names) => {
                let name = event.actor.process_name();
                names.iter().any(|n| n == name)
            }
            Predicate::ProcessNameNotIn(names) => {
                let name = event.actor.process_name();
                names.iter().all(|n| n != name)
            }
            Predicate::ParentNameIn(names) => event
                .actor
                .parent_name()
                .is_some_and(|name| names.iter().any(|n| n == name)),
            Predicate::NotAppleSigned => {
                event.actor.signing != SigningStatus::AppleSigned
            }
        }
    }
}

/// Single-event rule: fires when the kind matches and every predicate
/// holds.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    pub kind: EventKind,
    pub predicates: Vec<Predicate>,
    pub severity: Severity,
    pub mitre_id: String,
    pub mitre_name: String,
}

impl Rule {
    pub fn matches(&self, event: &SecurityEvent) -> bool {
        self.kind == event.kind
            && self.predicates.iter().all(|p| p.holds(event))
    }
}

/// How a correlation rule groups events into one in-progress chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationKey {
    Pid,
    ProcessPath,
}

impl CorrelationKey {
    pub fn of(&self, event: &SecurityEvent) -> String {
        match self {
            CorrelationKey::Pid => event.actor.pid.to_string(),
            CorrelationKey::ProcessPath => event.actor.path.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub kind: EventKind,
    pub predicates: Vec<Predicate>,
}

impl Stage {
    pub fn matches(&self, event: &SecurityEvent) -> bool {
        self.kind == event.kind
            && self.predicates.iter().all(|p| p.holds(event))
    }
}

/// Ordered multi-stage rule: all stages must complete, in order, within
/// the window, correlated by key.
#[derive(Debug, Clone)]
pub struct CorrelationRule {
    pub id: RuleId,
    pub name: String,
    pub stages: Vec<Stage>,
    pub window: Duration,
    pub key: CorrelationKey,
    pub severity: Severity,
    pub mitre_id: String,
    pub mitre_name: String,
}

/// The compiled, validated rule inventory the engine runs.
#[derive(Debug, Default)]
pub struct RuleSet {
    pub simple: Vec<Rule>,
    pub correlations: Vec<CorrelationRule>,
}

impl RuleSet {
    pub fn new(
        simple: Vec<Rule>,
        correlations: Vec<CorrelationRule>,
    ) -> Result<Self, RuleError> {
        let mut seen = std::collections::HashSet::new();
        for id in simple
            .iter()
            .map(|r| r.id.as_str())
            .chain(correlations.iter().map(|r| r.id.as_str()))
        {
            if !seen.insert(id.to_string()) {
                return Err(RuleError::DuplicateId(id.to_string()));
            }
        }
        for rule in &correlations {
            if rule.stages.len() < 2 {
                return Err(RuleError::TooFewStages(
                    rule.id.as_str().to_string(),
                ));
            }
        }
        Ok(Self {
            simple,
            correlations,
        })
    }

    pub fn len(&self) -> usize {
        self.simple.len() + self.correlations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::builtin::test_support::event;

    #[test]
    fn bad_regex_fails_at_load() {
        let err =
            Predicate::matches("r1", FieldKey::TargetPath, "([unclosed")
                .unwrap_err();
        assert!(matches!(err, RuleError::InvalidRegex { .. }));
    }

    #[test]
    fn absent_field_means_predicate_does_not_hold() {
        let e = event(EventKind::Exec, 100, "/usr/bin/true", &[]);
        let p = Predicate::Equals {
            field: FieldKey::RecordType,
            value: "TXT".into(),
        };
        assert!(!p.holds(&e));
    }

    #[test]
    fn process_name_predicates() {
        let e = event(EventKind::Exec, 100, "/usr/bin/osascript", &[]);
        assert!(
            Predicate::ProcessNameIn(vec!["osascript".into()]).holds(&e)
        );
        assert!(
            !Predicate::ProcessNameNotIn(vec!["osascript".into()]).holds(&e)
        );
    }

    #[test]
    fn duplicate_rule_ids_rejected() {
        let rule = Rule {
            id: "dup".into(),
            name: "first".into(),
            kind: EventKind::Exec,
            predicates: vec![],
            severity: Severity::Low,
            mitre_id: "T0000".into(),
            mitre_name: "None".into(),
        };
        let err = RuleSet::new(vec![rule.clone(), rule], vec![]).unwrap_err();
        assert!(matches!(err, RuleError::DuplicateId(_)));
    }
}
