//! Cross-domain threat fusion: alerts and scanner findings accumulate onto
//! entities, entities map onto kill-chain stages, and stage-diverse groups
//! of entities cluster into campaigns.
//!
//! Runs as a single-threaded cooperative actor; scores are a deterministic
//! function of the evidence set, and no evidence ever lowers a score.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use iris_model::alert::{Alert, Severity};
use iris_model::fusion::{
    Campaign, CampaignClass, EntityKey, EntitySummary, Evidence,
    EvidenceOrigin, KillChainStage,
};
use iris_model::ids::CampaignId;
use iris_model::scan::ProcessAnomaly;
use tracing::{debug, info};

/// Entities idle past this window are pruned.
const ENTITY_IDLE_WINDOW_SECS: i64 = 3600;
/// Campaign clustering looks at entities active within this rolling window.
const CAMPAIGN_WINDOW_SECS: i64 = 3600;
const CAMPAIGN_MIN_ENTITIES: usize = 2;
const CAMPAIGN_MIN_STAGES: usize = 3;

#[derive(Debug)]
struct EntityState {
    evidence: Vec<Evidence>,
    stages: BTreeSet<KillChainStage>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct FusionEngine {
    entities: HashMap<EntityKey, EntityState>,
    /// Live campaigns keyed by their sorted member set.
    campaigns: HashMap<Vec<EntityKey>, Campaign>,
}

impl FusionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one fired alert into the entity map. Up to three entity keys
    /// are extracted: the process, its signing identity, and the remote
    /// peer when the evidence names one.
    pub fn ingest_alert(&mut self, alert: &Alert) {
        let weight = severity_weight(alert.severity);
        let stage = stage_for_mitre(&alert.mitre_id);
        let evidence = Evidence {
            origin: EvidenceOrigin::Rule(alert.rule_id.as_str().to_string()),
            summary: alert.rule_name.clone(),
            severity: alert.severity,
            mitre_id: Some(alert.mitre_id.clone()),
            weight,
            baseline: false,
            observed_at: alert.timestamp,
        };

        for key in alert_entity_keys(alert) {
            self.attach(key, evidence.clone(), stage, alert.timestamp);
        }
    }

    pub fn ingest_anomaly(&mut self, anomaly: &ProcessAnomaly) {
        let observed_at = Utc::now();
        let stage = stage_for_scanner(&anomaly.scanner_id);
        let evidence = Evidence {
            origin: EvidenceOrigin::Scanner(anomaly.scanner_id.clone()),
            summary: anomaly.summary.clone(),
            severity: anomaly.severity,
            mitre_id: None,
            weight: severity_weight(anomaly.severity),
            baseline: anomaly.baseline,
            observed_at,
        };

        self.attach(
            EntityKey::Process(anomaly.pid),
            evidence.clone(),
            stage,
            observed_at,
        );
        if let Some(signing_id) = &anomaly.signing_id {
            self.attach(
                EntityKey::SigningIdentity(signing_id.clone()),
                evidence,
                stage,
                observed_at,
            );
        }
    }

    fn attach(
        &mut self,
        key: EntityKey,
        evidence: Evidence,
        stage: Option<KillChainStage>,
        at: DateTime<Utc>,
    ) {
        let state = self.entities.entry(key.clone()).or_insert_with(|| {
            debug!(target: "fusion", entity = %key, "entity created");
            EntityState {
                evidence: Vec::new(),
                stages: BTreeSet::new(),
                first_seen: at,
                last_seen: at,
            }
        });
        state.evidence.push(evidence);
        if let Some(stage) = stage {
            state.stages.insert(stage);
        }
        state.last_seen = state.last_seen.max(at);
    }

    /// Composite score for one entity. Deterministic over the evidence
    /// set; monotone in every input. Baseline-labelled items contribute
    /// like any other evidence, they are only labelled.
    fn score(state: &EntityState) -> f64 {
        let base = state
            .evidence
            .iter()
            .map(|e| e.weight)
            .fold(0.0f64, f64::max);
        let sources: BTreeSet<&str> = state
            .evidence
            .iter()
            .map(|e| e.origin.id())
            .collect();
        let distinct_sources = sources.len().max(1) as f64;
        let distinct_stages = state.stages.len().max(1) as f64;
        base * (1.0 + 0.3 * (distinct_sources - 1.0))
            * (1.0 + 0.2 * (distinct_stages - 1.0))
    }

    pub fn entity(&self, key: &EntityKey) -> Option<EntitySummary> {
        self.entities.get(key).map(|state| EntitySummary {
            key: key.clone(),
            evidence: state.evidence.clone(),
            stages: state.stages.iter().copied().collect(),
            score: Self::score(state),
            first_seen: state.first_seen,
            last_seen: state.last_seen,
        })
    }

    pub fn entities(&self) -> Vec<EntitySummary> {
        let mut all: Vec<EntitySummary> = self
            .entities
            .keys()
            .filter_map(|key| self.entity(key))
            .collect();
        all.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all
    }

    /// Drop entities idle past the window. Campaigns whose members all
    /// vanish go with them.
    pub fn prune_idle(&mut self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::seconds(ENTITY_IDLE_WINDOW_SECS);
        let before = self.entities.len();
        self.entities.retain(|_, state| state.last_seen >= cutoff);
        if self.entities.len() != before {
            debug!(
                target: "fusion",
                pruned = before - self.entities.len(),
                "pruned idle entities"
            );
        }
        let keys: Vec<Vec<EntityKey>> = self
            .campaigns
            .keys()
            .filter(|members| {
                !members.iter().any(|m| self.entities.contains_key(m))
            })
            .cloned()
            .collect();
        for key in keys {
            self.campaigns.remove(&key);
        }
    }

    /// Cluster recently active entities into campaigns: at least two
    /// entities whose stages jointly span at least three kill-chain
    /// phases within the rolling window.
    pub fn recluster(&mut self, now: DateTime<Utc>) -> Vec<Campaign> {
        let cutoff = now - ChronoDuration::seconds(CAMPAIGN_WINDOW_SECS);
        let active: Vec<(&EntityKey, &EntityState)> = self
            .entities
            .iter()
            .filter(|(_, state)| {
                state.last_seen >= cutoff && !state.stages.is_empty()
            })
            .collect();

        if active.len() < CAMPAIGN_MIN_ENTITIES {
            return self.campaigns.values().cloned().collect();
        }

        let mut stages: BTreeSet<KillChainStage> = BTreeSet::new();
        let mut stage_counts: HashMap<KillChainStage, usize> = HashMap::new();
        let mut first_seen = now;
        let mut last_seen = cutoff;
        for (_, state) in &active {
            for stage in &state.stages {
                stages.insert(*stage);
                *stage_counts.entry(*stage).or_default() +=
                    state.evidence.len();
            }
            first_seen = first_seen.min(state.first_seen);
            last_seen = last_seen.max(state.last_seen);
        }

        if stages.len() < CAMPAIGN_MIN_STAGES {
            return self.campaigns.values().cloned().collect();
        }

        let mut members: Vec<EntityKey> =
            active.iter().map(|(key, _)| (*key).clone()).collect();
        members.sort();

        let class = classify(&stages, &stage_counts);
        let entry = self
            .campaigns
            .entry(members.clone())
            .or_insert_with(|| {
                info!(
                    target: "fusion",
                    members = members.len(),
                    stages = stages.len(),
                    class = class.as_str(),
                    "campaign detected"
                );
                Campaign {
                    id: CampaignId::new(),
                    members: members.clone(),
                    stages: Vec::new(),
                    class,
                    first_seen,
                    last_seen,
                }
            });
        entry.stages = stages.iter().copied().collect();
        entry.class = class;
        entry.last_seen = last_seen;

        self.campaigns.values().cloned().collect()
    }

    pub fn campaigns(&self) -> Vec<Campaign> {
        self.campaigns.values().cloned().collect()
    }
}

/// First classification whose condition holds, in fixed order.
fn classify(
    stages: &BTreeSet<KillChainStage>,
    stage_counts: &HashMap<KillChainStage, usize>,
) -> CampaignClass {
    use KillChainStage::*;
    if stages.contains(&CredentialAccess) && stages.contains(&Exfiltration) {
        return CampaignClass::DataTheft;
    }
    if stages.contains(&Persistence)
        && stages.contains(&Execution)
        && stages.contains(&CommandAndControl)
    {
        return CampaignClass::Implant;
    }
    if stages.contains(&Impact) {
        return CampaignClass::Destructive;
    }
    let total: usize = stage_counts.values().sum();
    let evasion = stage_counts.get(&DefenseEvasion).copied().unwrap_or(0);
    if total > 0 && evasion * 2 > total {
        return CampaignClass::Evasion;
    }
    if stages.len() >= 5 {
        return CampaignClass::Apt;
    }
    CampaignClass::Uncategorized
}

fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 0.3,
        Severity::Medium => 0.5,
        Severity::High => 0.75,
        Severity::Critical => 0.95,
    }
}

fn alert_entity_keys(alert: &Alert) -> Vec<EntityKey> {
    let mut keys = vec![EntityKey::Process(alert.actor.pid)];
    if let Some(signing_id) = alert
        .evidence
        .iter()
        .find_map(|e| e.detail_field("signing_id"))
    {
        keys.push(EntityKey::SigningIdentity(signing_id.to_string()));
    }
    if let Some(peer) = alert.evidence.iter().find_map(|e| match &e.target {
        iris_model::event::EventTarget::Endpoint { host, .. } => {
            Some(host.clone())
        }
        _ => e.detail_field("remote_host").map(str::to_string),
    }) {
        keys.push(EntityKey::NetworkPeer(peer));
    }
    keys
}

/// Kill-chain stage from a MITRE technique id prefix.
fn stage_for_mitre(mitre_id: &str) -> Option<KillChainStage> {
    use KillChainStage::*;
    let technique = mitre_id.split('.').next().unwrap_or(mitre_id);
    let stage = match technique {
        "T1595" | "T1592" | "T1589" => Reconnaissance,
        "T1583" | "T1587" | "T1588" => ResourceDevelopment,
        "T1566" | "T1190" | "T1078" => InitialAccess,
        "T1059" | "T1204" | "T1569" => Execution,
        "T1543" | "T1547" | "T1053" => Persistence,
        "T1548" | "T1068" | "T1055" => PrivilegeEscalation,
        "T1562" | "T1070" | "T1027" | "T1036" => DefenseEvasion,
        "T1555" | "T1003" | "T1110" | "T1539" => CredentialAccess,
        "T1057" | "T1082" | "T1083" | "T1018" => Discovery,
        "T1021" | "T1570" => LateralMovement,
        "T1005" | "T1113" | "T1560" => Collection,
        "T1071" | "T1095" | "T1568" | "T1573" => CommandAndControl,
        "T1048" | "T1041" | "T1567" => Exfiltration,
        "T1485" | "T1486" | "T1489" | "T1490" => Impact,
        _ => return None,
    };
    Some(stage)
}

/// Kill-chain stage from a scanner id.
fn stage_for_scanner(scanner_id: &str) -> Option<KillChainStage> {
    use KillChainStage::*;
    let stage = match scanner_id {
        "env-injection" => DefenseEvasion,
        "tmp-exec" => Execution,
        "unsigned-binary" => DefenseEvasion,
        "macho-header" => DefenseEvasion,
        _ => return None,
    };
    Some(stage)
}
