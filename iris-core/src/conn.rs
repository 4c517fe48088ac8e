//! Active flow registry. Holds metadata snapshots only; the live pipeline
//! owns the flow handle, and eviction here returns the evicted ids so the
//! router can send close signals through the owning pipelines.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use iris_model::flow::{FlowRecord, FlowState};
use iris_model::ids::FlowId;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Tables {
    flows: HashMap<FlowId, FlowRecord>,
    by_pid: HashMap<u32, HashSet<FlowId>>,
}

impl Tables {
    /// Removal keeps the per-pid index consistent in the same critical
    /// section, so no dangling references survive an eviction.
    fn remove(&mut self, id: &FlowId) -> Option<FlowRecord> {
        let record = self.flows.remove(id)?;
        let pid = record.attribution.pid;
        if let Some(set) = self.by_pid.get_mut(&pid) {
            set.remove(id);
            if set.is_empty() {
                self.by_pid.remove(&pid);
            }
        }
        Some(record)
    }
}

#[derive(Debug)]
pub struct ConnectionTable {
    inner: Mutex<Tables>,
    max_connections: usize,
    stale_after: ChronoDuration,
}

impl ConnectionTable {
    pub fn new(max_connections: usize, stale_after: std::time::Duration) -> Self {
        assert!(max_connections > 0);
        Self {
            inner: Mutex::new(Tables::default()),
            max_connections,
            stale_after: ChronoDuration::from_std(stale_after)
                .unwrap_or_else(|_| ChronoDuration::seconds(120)),
        }
    }

    /// Register a flow. If the table is full, the oldest 10% by
    /// last-activity are evicted first; their records are returned so the
    /// owning pipelines can be told to close.
    pub fn insert(&self, record: FlowRecord) -> Vec<FlowRecord> {
        let mut tables = self.inner.lock();
        let mut evicted = Vec::new();

        if tables.flows.len() >= self.max_connections {
            let batch = (self.max_connections / 10).max(1);
            let mut by_age: Vec<(FlowId, DateTime<Utc>)> = tables
                .flows
                .iter()
                .map(|(id, r)| (*id, r.last_activity))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);
            for (id, _) in by_age.into_iter().take(batch) {
                if let Some(mut record) = tables.remove(&id) {
                    record.state = FlowState::Closed;
                    evicted.push(record);
                }
            }
        }

        let id = record.id;
        let pid = record.attribution.pid;
        tables.flows.insert(id, record);
        tables.by_pid.entry(pid).or_default().insert(id);
        evicted
    }

    pub fn get(&self, id: &FlowId) -> Option<FlowRecord> {
        self.inner.lock().flows.get(id).cloned()
    }

    /// Apply an update to a flow's metadata snapshot and refresh its
    /// activity timestamp.
    pub fn update(
        &self,
        id: &FlowId,
        f: impl FnOnce(&mut FlowRecord),
    ) -> bool {
        let mut tables = self.inner.lock();
        match tables.flows.get_mut(id) {
            Some(record) => {
                f(record);
                record.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &FlowId) -> Option<FlowRecord> {
        self.inner.lock().remove(id)
    }

    /// Evict flows idle past the staleness threshold. Returns the evicted
    /// records for close signaling and final bookkeeping.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> Vec<FlowRecord> {
        let mut tables = self.inner.lock();
        let stale: Vec<FlowId> = tables
            .flows
            .iter()
            .filter(|(_, r)| {
                !r.state.is_terminal()
                    && now - r.last_activity > self.stale_after
            })
            .map(|(id, _)| *id)
            .collect();
        stale
            .iter()
            .filter_map(|id| {
                tables.remove(id).map(|mut record| {
                    record.state = FlowState::Closed;
                    record
                })
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().flows.len()
    }

    pub fn flows_for_pid(&self, pid: u32) -> Vec<FlowRecord> {
        let tables = self.inner.lock();
        tables
            .by_pid
            .get(&pid)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.flows.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<FlowRecord> {
        self.inner.lock().flows.values().cloned().collect()
    }

    /// Pids with at least one registered flow, for signing-cache pruning.
    pub fn active_pids(&self) -> HashSet<u32> {
        self.inner.lock().by_pid.keys().copied().collect()
    }

    pub fn mark_closed(&self, id: &FlowId) -> Option<FlowRecord> {
        let mut tables = self.inner.lock();
        if let Some(record) = tables.flows.get_mut(id) {
            record.state = FlowState::Closed;
        }
        tables.remove(id)
    }
}
