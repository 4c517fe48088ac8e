//! The detection engine: a single-threaded state machine consuming
//! normalized events and appending alerts to the alert ring. The daemon
//! wraps it in a message loop; tests drive it directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use iris_model::alert::Alert;
use iris_model::event::SecurityEvent;
use iris_model::ids::{AlertId, RuleId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::detect::rules::{CorrelationRule, RuleSet};
use crate::ring::RingStore;

/// Per-(rule, key) chain progress. Only the earliest completing event per
/// stage is retained.
#[derive(Debug, Default)]
struct StageProgress {
    completed: Vec<SecurityEvent>,
}

#[derive(Debug)]
struct DedupState {
    ring_seq: u64,
    fired_mono_ns: u64,
}

#[derive(Debug)]
pub struct DetectionEngine {
    rules: Arc<RuleSet>,
    alerts: Arc<RingStore<Alert>>,
    dedup_window: Duration,
    progress: HashMap<(usize, String), StageProgress>,
    dedup: HashMap<(RuleId, String), DedupState>,
    events_seen: u64,
}

impl DetectionEngine {
    pub fn new(
        rules: Arc<RuleSet>,
        alerts: Arc<RingStore<Alert>>,
        dedup_window: Duration,
    ) -> Self {
        info!(
            target: "detect::engine",
            simple = rules.simple.len(),
            correlations = rules.correlations.len(),
            "detection engine ready"
        );
        Self {
            rules,
            alerts,
            dedup_window,
            progress: HashMap::new(),
            dedup: HashMap::new(),
            events_seen: 0,
        }
    }

    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    /// Evaluate one event against every rule. Events must arrive in append
    /// order; fires are deterministic for a given sequence.
    pub fn handle_event(&mut self, event: &SecurityEvent) {
        self.events_seen += 1;
        let rules = Arc::clone(&self.rules);

        for rule in &rules.simple {
            if rule.matches(event) {
                let alert = Alert {
                    id: AlertId::new(),
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    severity: rule.severity,
                    mitre_id: rule.mitre_id.clone(),
                    mitre_name: rule.mitre_name.clone(),
                    actor: event.actor.clone(),
                    evidence: vec![event.clone()],
                    timestamp: event.wall_time,
                    count: 1,
                };
                self.fire(alert, event.monotonic_ns);
            }
        }

        for index in 0..rules.correlations.len() {
            self.advance_correlation(&rules.correlations[index], index, event);
        }
    }

    fn advance_correlation(
        &mut self,
        rule: &CorrelationRule,
        index: usize,
        event: &SecurityEvent,
    ) {
        let key = rule.key.of(event);
        let window_ns = rule.window.as_nanos() as u64;
        let slot = (index, key.clone());

        // Progress whose chain start has aged out of the window is dropped
        // on every touch.
        if let Some(progress) = self.progress.get(&slot) {
            let expired = progress.completed.first().is_some_and(|first| {
                event.monotonic_ns.saturating_sub(first.monotonic_ns)
                    > window_ns
            });
            if expired {
                self.progress.remove(&slot);
            }
        }

        let next_stage =
            self.progress.get(&slot).map_or(0, |p| p.completed.len());
        let Some(stage) = rule.stages.get(next_stage) else {
            return;
        };
        if !stage.matches(event) {
            return;
        }

        let progress = self.progress.entry(slot.clone()).or_default();
        progress.completed.push(event.clone());
        debug!(
            target: "detect::engine",
            rule = rule.id.as_str(),
            key = %key,
            stage = next_stage,
            of = rule.stages.len(),
            "correlation stage complete"
        );

        if progress.completed.len() == rule.stages.len() {
            let progress = self
                .progress
                .remove(&slot)
                .expect("progress present at completion");
            let alert = correlation_alert(rule, &key, progress.completed);
            self.fire(alert, event.monotonic_ns);
        }
    }

    /// Append or coalesce. A repeat fire for the same dedup key within the
    /// window increments the stored row's counter instead of adding a row.
    fn fire(&mut self, alert: Alert, now_mono_ns: u64) {
        let key = alert.dedup_key();
        let window_ns = self.dedup_window.as_nanos() as u64;

        if let Some(state) = self.dedup.get(&key) {
            let within =
                now_mono_ns.saturating_sub(state.fired_mono_ns) <= window_ns;
            if within {
                let bumped = self
                    .alerts
                    .mutate(state.ring_seq, |stored| stored.count += 1);
                if bumped {
                    debug!(
                        target: "detect::engine",
                        rule = key.0.as_str(),
                        "duplicate alert coalesced"
                    );
                    return;
                }
                // The row was evicted under pressure; fall through and
                // store the fire as a fresh alert.
            }
        }

        warn!(
            target: "detect::engine",
            rule = alert.rule_id.as_str(),
            severity = alert.severity.as_str(),
            actor = %alert.actor.path,
            "alert fired"
        );
        let seq = self.alerts.append(alert);
        self.dedup.insert(
            key,
            DedupState {
                ring_seq: seq,
                fired_mono_ns: now_mono_ns,
            },
        );
    }

    /// Run as a cooperative actor over an event channel. Returns when the
    /// sender side closes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<SecurityEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(&event);
        }
        info!(
            target: "detect::engine",
            events = self.events_seen,
            "detection engine stopped"
        );
    }
}

fn correlation_alert(
    rule: &CorrelationRule,
    key: &str,
    evidence: Vec<SecurityEvent>,
) -> Alert {
    let actor = evidence
        .first()
        .map(|e| e.actor.clone())
        .expect("correlation fires carry evidence");
    let timestamp = evidence
        .last()
        .map(|e| e.wall_time)
        .unwrap_or_else(chrono::Utc::now);
    debug!(
        target: "detect::engine",
        rule = rule.id.as_str(),
        key = %key,
        stages = evidence.len(),
        "correlation complete"
    );
    Alert {
        id: AlertId::new(),
        rule_id: rule.id.clone(),
        rule_name: rule.name.clone(),
        severity: rule.severity,
        mitre_id: rule.mitre_id.clone(),
        mitre_name: rule.mitre_name.clone(),
        actor,
        evidence,
        timestamp,
        count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::builtin::{self, test_support::*};
    use iris_model::event::EventKind;

    fn engine_with_builtin() -> (DetectionEngine, Arc<RingStore<Alert>>) {
        let alerts = Arc::new(RingStore::new(1024));
        let rules = Arc::new(builtin::ruleset().expect("builtin rules valid"));
        (
            DetectionEngine::new(
                rules,
                Arc::clone(&alerts),
                Duration::from_secs(60),
            ),
            alerts,
        )
    }

    #[test]
    fn fake_prompt_chain_fires_once_and_dedups() {
        let (mut engine, alerts) = engine_with_builtin();

        // Three chained stages sharing a pid, inside the 30 s window.
        let chain = [
            exec_event(4242, "/usr/bin/osascript", "-e 'do shell script'", 0),
            file_write_event(4242, "/usr/bin/osascript", "/tmp/x", 5),
            connection_event(4242, "/usr/bin/osascript", "1.2.3.4", 443, 10),
        ];
        for event in &chain {
            engine.handle_event(event);
        }

        let (items, _) = alerts.since(0);
        let fired: Vec<_> = items
            .iter()
            .filter(|a| a.value.rule_id.as_str() == "fake-prompt-chain")
            .collect();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].value.evidence.len(), 3);
        assert_eq!(fired[0].value.count, 1);

        // Two repeat chains inside the dedup window: counter increments,
        // no new rows.
        for offset in [12, 20] {
            engine.handle_event(&exec_event(
                4242,
                "/usr/bin/osascript",
                "-e 'do shell script'",
                offset,
            ));
            engine.handle_event(&file_write_event(
                4242,
                "/usr/bin/osascript",
                "/tmp/x",
                offset + 1,
            ));
            engine.handle_event(&connection_event(
                4242,
                "/usr/bin/osascript",
                "1.2.3.4",
                443,
                offset + 2,
            ));
        }

        let (items, _) = alerts.since(0);
        let fired: Vec<_> = items
            .iter()
            .filter(|a| a.value.rule_id.as_str() == "fake-prompt-chain")
            .collect();
        assert_eq!(fired.len(), 1, "dupes must not add rows");
        assert_eq!(fired[0].value.count, 3);
    }

    #[test]
    fn chain_does_not_fire_across_pids() {
        let (mut engine, alerts) = engine_with_builtin();
        engine.handle_event(&exec_event(
            1,
            "/usr/bin/osascript",
            "-e 'do shell script'",
            0,
        ));
        engine.handle_event(&file_write_event(
            2,
            "/usr/bin/osascript",
            "/tmp/x",
            1,
        ));
        engine.handle_event(&connection_event(
            3,
            "/usr/bin/osascript",
            "1.2.3.4",
            443,
            2,
        ));

        let (items, _) = alerts.since(0);
        assert!(
            items
                .iter()
                .all(|a| a.value.rule_id.as_str() != "fake-prompt-chain")
        );
    }

    #[test]
    fn window_expiry_resets_progress() {
        let (mut engine, alerts) = engine_with_builtin();
        engine.handle_event(&exec_event(
            7,
            "/usr/bin/osascript",
            "-e 'do shell script'",
            0,
        ));
        // 31 s later the chain start is stale; these two cannot complete it.
        engine.handle_event(&file_write_event(
            7,
            "/usr/bin/osascript",
            "/tmp/x",
            31,
        ));
        engine.handle_event(&connection_event(
            7,
            "/usr/bin/osascript",
            "1.2.3.4",
            443,
            32,
        ));

        let (items, _) = alerts.since(0);
        assert!(
            items
                .iter()
                .all(|a| a.value.rule_id.as_str() != "fake-prompt-chain")
        );
    }

    #[test]
    fn engine_is_deterministic() {
        let events = [
            exec_event(9, "/usr/bin/osascript", "-e 'do shell script'", 0),
            event(EventKind::TccModify, 9, "/usr/bin/osascript", &[]),
            file_write_event(9, "/usr/bin/osascript", "/tmp/x", 3),
            connection_event(9, "/usr/bin/osascript", "8.8.8.8", 443, 6),
        ];

        let run = || {
            let (mut engine, alerts) = engine_with_builtin();
            for e in &events {
                engine.handle_event(e);
            }
            let (items, _) = alerts.since(0);
            items
                .into_iter()
                .map(|a| (a.seq, a.value.rule_id, a.value.count))
                .collect::<Vec<_>>()
        };

        let first = run();
        let second = run();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn simple_rule_fires_on_matching_kind_only() {
        let (mut engine, alerts) = engine_with_builtin();
        engine
            .handle_event(&event(EventKind::KextLoad, 1, "/usr/bin/kmutil", &[]));
        engine.handle_event(&event(EventKind::Fork, 1, "/usr/bin/kmutil", &[]));

        let (items, _) = alerts.since(0);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].value.rule_id.as_str(), "kext-load");
    }
}
