//! Daemon-wide state: ring stores, connection table, firewall, the
//! certificate authority slot, and the detection actor. Singletons live
//! here with explicit init and teardown; tests construct them fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use iris_config::IrisConfig;
use iris_core::ca::CertAuthority;
use iris_core::conn::ConnectionTable;
use iris_core::detect::normalize::PathHeuristicOracle;
use iris_core::detect::{DetectionEngine, EventNormalizer, builtin, heuristics};
use iris_core::firewall::Firewall;
use iris_core::ring::RingStore;
use iris_model::alert::Alert;
use iris_model::dns::DnsQueryRecord;
use iris_model::event::{EventKind, SecurityEvent};
use iris_model::flow::FlowRecord;
use iris_model::http::CapturedExchange;
use iris_model::ids::FlowId;
use iris_model::ipc::ExtensionStatus;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dns::QuerySink;

const FLOW_RING_CAPACITY: usize = 4096;
const EXCHANGE_RING_CAPACITY: usize = 8192;
const DNS_RING_CAPACITY: usize = 8192;
const EVENT_RING_CAPACITY: usize = 16384;
const ALERT_RING_CAPACITY: usize = 4096;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub const DAEMON_NAME: &str = "iris-proxy";
pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct DaemonState {
    pub config: IrisConfig,
    pub started_at: DateTime<Utc>,
    pub interception: AtomicBool,
    /// Installed over IPC before interception can begin.
    pub ca: tokio::sync::RwLock<Option<Arc<CertAuthority>>>,
    pub firewall: Firewall,
    pub table: ConnectionTable,
    /// Final flow records, appended at close for delta polling.
    pub flows: Arc<RingStore<FlowRecord>>,
    pub exchanges: Arc<RingStore<CapturedExchange>>,
    pub dns_queries: Arc<RingStore<DnsQueryRecord>>,
    pub events: Arc<RingStore<SecurityEvent>>,
    pub alerts: Arc<RingStore<Alert>>,
    pub normalizer: EventNormalizer,
    events_tx: mpsc::Sender<SecurityEvent>,
    pub flows_seen: AtomicU64,
    /// Live capture budget; starts from config, adjustable over IPC.
    pub capture_budget: AtomicU64,
    pub shutdown: CancellationToken,
    closers: Mutex<HashMap<FlowId, CancellationToken>>,
}

impl std::fmt::Debug for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonState")
            .field("active_flows", &self.table.count())
            .field(
                "interception",
                &self.interception.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl DaemonState {
    /// Build every singleton and start the detection actor. The returned
    /// state is the process-wide instance; `shutdown` tears it down.
    pub fn init(config: IrisConfig) -> anyhow::Result<Arc<Self>> {
        let firewall =
            Firewall::with_store(&config.proxy.firewall_rules_path)?;
        let table = ConnectionTable::new(
            config.proxy.max_connections,
            config.proxy.stale_timeout(),
        );
        let exchanges = Arc::new(RingStore::with_byte_budget(
            EXCHANGE_RING_CAPACITY,
            config.capture.memory_budget_bytes,
            |e: &CapturedExchange| e.retained_bytes(),
        ));
        let alerts = Arc::new(RingStore::new(ALERT_RING_CAPACITY));

        let rules = Arc::new(builtin::ruleset()?);
        let (events_tx, events_rx) =
            mpsc::channel::<SecurityEvent>(EVENT_CHANNEL_CAPACITY);
        let engine = DetectionEngine::new(
            rules,
            Arc::clone(&alerts),
            config.detection.alert_dedup_window(),
        );
        tokio::spawn(engine.run(events_rx));

        let state = Arc::new(Self {
            started_at: Utc::now(),
            interception: AtomicBool::new(true),
            ca: tokio::sync::RwLock::new(None),
            firewall,
            table,
            flows: Arc::new(RingStore::new(FLOW_RING_CAPACITY)),
            exchanges,
            dns_queries: Arc::new(RingStore::new(DNS_RING_CAPACITY)),
            events: Arc::new(RingStore::new(EVENT_RING_CAPACITY)),
            alerts,
            normalizer: EventNormalizer::new(Box::new(PathHeuristicOracle)),
            events_tx,
            flows_seen: AtomicU64::new(0),
            capture_budget: AtomicU64::new(
                config.capture.memory_budget_bytes,
            ),
            shutdown: CancellationToken::new(),
            closers: Mutex::new(HashMap::new()),
            config,
        });

        info!(
            target: "daemon",
            version = DAEMON_VERSION,
            max_connections = state.config.proxy.max_connections,
            "daemon state initialized"
        );
        Ok(state)
    }

    /// Append to the event ring and hand the event to the detection
    /// actor. A full channel drops for detection but never for the ring;
    /// the delta-poll consumer still sees the event.
    pub fn publish_event(&self, event: SecurityEvent) {
        self.events.append(event.clone());
        if let Err(e) = self.events_tx.try_send(event) {
            warn!(target: "daemon", error = %e, "detection channel full");
        }
    }

    pub fn status(&self) -> ExtensionStatus {
        ExtensionStatus {
            extension: DAEMON_NAME.to_string(),
            version: DAEMON_VERSION.to_string(),
            interception_enabled: self.interception.load(Ordering::Relaxed),
            ca_installed: self
                .ca
                .try_read()
                .map(|ca| ca.is_some())
                .unwrap_or(false),
            active_flows: self.table.count(),
            flows_seen: self.flows_seen.load(Ordering::Relaxed),
            exchanges_captured: self.exchanges.appended(),
            dns_queries: self.dns_queries.appended(),
            events_normalized: self.events.appended(),
            alerts_fired: self.alerts.appended(),
            capture_budget_bytes: self.capture_budget.load(Ordering::Relaxed),
            capture_used_bytes: self.exchanges.retained_bytes(),
            started_at: self.started_at,
        }
    }

    /// Per-flow close signal. Eviction and shutdown close flows through
    /// their owning pipeline, never by touching the flow directly.
    pub fn register_closer(&self, id: FlowId) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.closers.lock().insert(id, token.clone());
        token
    }

    pub fn remove_closer(&self, id: &FlowId) {
        self.closers.lock().remove(id);
    }

    pub fn signal_close(&self, id: &FlowId) {
        if let Some(token) = self.closers.lock().get(id) {
            token.cancel();
        }
    }

    /// Background sweeps: firewall expiry (60 s), idle flow eviction, and
    /// signing cache pruning. All stop at shutdown.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut firewall_sweep =
                tokio::time::interval(Duration::from_secs(60));
            let mut idle_sweep =
                tokio::time::interval(Duration::from_secs(15));
            loop {
                tokio::select! {
                    _ = state.shutdown.cancelled() => break,
                    _ = firewall_sweep.tick() => {
                        if let Err(e) = state.firewall.cleanup_expired() {
                            warn!(
                                target: "daemon",
                                error = %e,
                                "firewall sweep failed"
                            );
                        }
                        state
                            .normalizer
                            .prune_signing_cache(&state.table.active_pids());
                    }
                    _ = idle_sweep.tick() => {
                        for record in state.table.evict_idle(Utc::now()) {
                            state.signal_close(&record.id);
                            state.flows.append(record);
                        }
                    }
                }
            }
        });
    }

    /// Stop accepting new flows, wait out a bounded grace period, then
    /// force-close whatever is left.
    pub async fn shutdown_gracefully(&self, grace: Duration) {
        info!(target: "daemon", "shutdown requested, draining flows");
        self.interception.store(false, Ordering::Relaxed);

        let deadline = tokio::time::Instant::now() + grace;
        while self.table.count() > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.table.count();
        if remaining > 0 {
            warn!(target: "daemon", remaining, "force-closing flows");
        }
        self.shutdown.cancel();
    }
}

/// DNS record sink: the ring plus synthetic telemetry into detection.
impl QuerySink for DaemonState {
    fn record(&self, record: DnsQueryRecord) {
        let monotonic_ns = monotonic_now_ns();
        self.dns_queries.append(record.clone());

        self.publish_event(self.normalizer.dns_event(
            EventKind::DnsQuery,
            &record,
            monotonic_ns,
        ));
        if heuristics::looks_like_exfil(&record.domain) {
            self.publish_event(self.normalizer.dns_event(
                EventKind::DnsExfil,
                &record,
                monotonic_ns,
            ));
        }
        if heuristics::looks_like_dga(&record.domain) {
            self.publish_event(self.normalizer.dns_event(
                EventKind::DnsDga,
                &record,
                monotonic_ns,
            ));
        }
    }
}

/// Monotonic nanoseconds since daemon start, the clock rule windows run
/// on.
pub fn monotonic_now_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_nanos() as u64
}
