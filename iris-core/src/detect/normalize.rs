//! Kernel event normalization and synthetic event minting.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use iris_model::dns::DnsQueryRecord;
use iris_model::event::{
    EventActor, EventKind, EventTarget, RawEsEvent, SecurityEvent,
    SigningStatus,
};
use iris_model::flow::FlowRecord;
use parking_lot::Mutex;
use tracing::debug;

/// What the code-signing oracle reports for a binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningInfo {
    pub status: SigningStatus,
    pub signing_id: Option<String>,
    pub team_id: Option<String>,
}

/// Seam to the platform code-signing API. Implementations must be cheap to
/// call repeatedly; the normalizer caches per pid on top.
pub trait SigningOracle: Send + Sync {
    fn signing_info(&self, pid: u32, path: &str) -> SigningInfo;
}

/// Path-heuristic oracle used when the platform API is unavailable:
/// system paths report platform-signed, everything else unsigned. The
/// production daemons install the real oracle at startup.
#[derive(Debug, Default)]
pub struct PathHeuristicOracle;

impl SigningOracle for PathHeuristicOracle {
    fn signing_info(&self, _pid: u32, path: &str) -> SigningInfo {
        let system = ["/usr/", "/bin/", "/sbin/", "/System/"]
            .iter()
            .any(|prefix| path.starts_with(prefix));
        SigningInfo {
            status: if system {
                SigningStatus::AppleSigned
            } else {
                SigningStatus::Unsigned
            },
            signing_id: None,
            team_id: None,
        }
    }
}

/// Maps raw kernel callbacks onto `SecurityEvent` and mints synthetic
/// events for proxy and DNS telemetry. Sequence numbers establish the
/// total order rule evaluation relies on.
pub struct EventNormalizer {
    oracle: Box<dyn SigningOracle>,
    cache: Mutex<HashMap<u32, SigningInfo>>,
    seq: Mutex<u64>,
}

impl std::fmt::Debug for EventNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNormalizer")
            .field("cached_pids", &self.cache.lock().len())
            .finish()
    }
}

impl EventNormalizer {
    pub fn new(oracle: Box<dyn SigningOracle>) -> Self {
        Self {
            oracle,
            cache: Mutex::new(HashMap::new()),
            seq: Mutex::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        let mut seq = self.seq.lock();
        *seq += 1;
        *seq
    }

    fn signing_for(&self, pid: u32, path: &str) -> SigningInfo {
        if let Some(info) = self.cache.lock().get(&pid) {
            return info.clone();
        }
        let info = self.oracle.signing_info(pid, path);
        self.cache.lock().insert(pid, info.clone());
        info
    }

    /// Drop cached signing results for pids no longer alive, so pid reuse
    /// cannot resurrect a stale verdict.
    pub fn prune_signing_cache(&self, active_pids: &HashSet<u32>) {
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|pid, _| active_pids.contains(pid));
        let dropped = before - cache.len();
        if dropped > 0 {
            debug!(
                target: "detect::normalize",
                dropped,
                "pruned signing cache"
            );
        }
    }

    pub fn normalize(&self, raw: RawEsEvent) -> SecurityEvent {
        let signing = self.signing_for(raw.pid, &raw.process_path);
        let target = match (&raw.target_path, &raw.remote_host) {
            (Some(path), _) => EventTarget::Path(path.clone()),
            (None, Some(host)) => EventTarget::Endpoint {
                host: host.clone(),
                port: raw.remote_port.unwrap_or(0),
            },
            (None, None) => EventTarget::None,
        };

        let mut detail = raw.detail;
        if !raw.args.is_empty() {
            detail.insert("args".into(), raw.args.join(" "));
        }
        if let Some(id) = &signing.signing_id {
            detail.insert("signing_id".into(), id.clone());
        }

        SecurityEvent {
            kind: raw.kind,
            actor: EventActor {
                pid: raw.pid,
                path: raw.process_path,
                parent_pid: raw.parent_pid,
                parent_path: raw.parent_path,
                signing: signing.status,
            },
            target,
            detail,
            monotonic_ns: raw.monotonic_ns,
            seq: self.next_seq(),
            wall_time: Utc::now(),
        }
    }

    /// Synthetic `connection` event for an outbound flow observed by the
    /// router.
    pub fn connection_event(
        &self,
        flow: &FlowRecord,
        monotonic_ns: u64,
    ) -> SecurityEvent {
        let signing =
            self.signing_for(flow.attribution.pid, &flow.attribution.process_path);
        let mut detail = BTreeMap::new();
        detail.insert("transport".into(), flow.transport.as_str().into());
        detail
            .insert("remote_host".into(), flow.remote.host.clone());
        detail.insert("remote_port".into(), flow.remote.port.to_string());
        if let Some(sni) = &flow.sni_host {
            detail.insert("sni".into(), sni.clone());
        }

        SecurityEvent {
            kind: EventKind::Connection,
            actor: EventActor {
                pid: flow.attribution.pid,
                path: flow.attribution.process_path.clone(),
                parent_pid: None,
                parent_path: None,
                signing: signing.status,
            },
            target: EventTarget::Endpoint {
                host: flow.remote.host.clone(),
                port: flow.remote.port,
            },
            detail,
            monotonic_ns,
            seq: self.next_seq(),
            wall_time: Utc::now(),
        }
    }

    /// Synthetic DNS telemetry event (`dns_query`, `dns_exfil`, `dns_dga`).
    pub fn dns_event(
        &self,
        kind: EventKind,
        record: &DnsQueryRecord,
        monotonic_ns: u64,
    ) -> SecurityEvent {
        let (pid, path, signing) = match &record.attribution {
            Some(attr) => {
                let info = self.signing_for(attr.pid, &attr.process_path);
                (attr.pid, attr.process_path.clone(), info.status)
            }
            None => (0, String::new(), SigningStatus::Unsigned),
        };

        let mut detail = BTreeMap::new();
        detail.insert("domain".into(), record.domain.clone());
        detail.insert("record_type".into(), record.qtype_str());
        detail.insert("rcode".into(), record.rcode.to_string());

        SecurityEvent {
            kind,
            actor: EventActor {
                pid,
                path,
                parent_pid: None,
                parent_path: None,
                signing,
            },
            target: EventTarget::Descriptor(record.domain.clone()),
            detail,
            monotonic_ns,
            seq: self.next_seq(),
            wall_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticOracle;

    impl SigningOracle for StaticOracle {
        fn signing_info(&self, _pid: u32, _path: &str) -> SigningInfo {
            SigningInfo {
                status: SigningStatus::ThirdPartySigned,
                signing_id: Some("com.example.tool".into()),
                team_id: Some("TEAM1234".into()),
            }
        }
    }

    fn raw(pid: u32) -> RawEsEvent {
        RawEsEvent {
            kind: EventKind::Exec,
            pid,
            process_path: "/opt/tool/bin/tool".into(),
            parent_pid: Some(1),
            parent_path: Some("/sbin/launchd".into()),
            target_path: Some("/opt/tool/bin/tool".into()),
            remote_host: None,
            remote_port: None,
            args: vec!["tool".into(), "--flag".into()],
            detail: BTreeMap::new(),
            monotonic_ns: 1,
        }
    }

    #[test]
    fn sequence_numbers_are_strictly_increasing() {
        let normalizer =
            EventNormalizer::new(Box::new(PathHeuristicOracle));
        let a = normalizer.normalize(raw(1));
        let b = normalizer.normalize(raw(2));
        assert!(b.seq > a.seq);
    }

    #[test]
    fn signing_lookups_are_cached_per_pid_and_pruned() {
        let normalizer = EventNormalizer::new(Box::new(StaticOracle));
        normalizer.normalize(raw(10));
        normalizer.normalize(raw(10));
        assert_eq!(normalizer.cache.lock().len(), 1);

        // Pid 10 dies; the cache entry goes with it.
        normalizer.prune_signing_cache(&HashSet::from([11u32]));
        assert!(normalizer.cache.lock().is_empty());
    }

    #[test]
    fn args_are_joined_into_detail() {
        let normalizer =
            EventNormalizer::new(Box::new(PathHeuristicOracle));
        let event = normalizer.normalize(raw(1));
        assert_eq!(event.detail_field("args"), Some("tool --flag"));
    }
}
