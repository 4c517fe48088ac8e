use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::Severity;
use crate::event::SigningStatus;

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
pub enum ScannerTier {
    Fast,
    Medium,
    Slow,
}

impl ScannerTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScannerTier::Fast => "fast",
            ScannerTier::Medium => "medium",
            ScannerTier::Slow => "slow",
        }
    }
}

/// One process as enumerated for a scan. The snapshot is caller-provided;
/// scanners never enumerate on their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub path: String,
    pub parent_pid: Option<u32>,
    pub signing: SigningStatus,
    pub signing_id: Option<String>,
    /// Environment variables, when readable.
    pub env: BTreeMap<String, String>,
    /// First bytes of the executable image, when readable. Enough for
    /// header analysis without re-reading the binary per scanner.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_head: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub processes: Vec<ProcessInfo>,
}

impl ProcessSnapshot {
    pub fn new(processes: Vec<ProcessInfo>) -> Self {
        Self {
            taken_at: Some(Utc::now()),
            processes,
        }
    }
}

/// A finding reported by a batch scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessAnomaly {
    pub scanner_id: String,
    pub pid: u32,
    pub process_path: String,
    pub signing_id: Option<String>,
    pub summary: String,
    pub severity: Severity,
    /// Set when the finding matches a known-good baseline entry.
    pub baseline: bool,
}

/// Per-scanner result, failure included. A failed scanner still produces a
/// row so a scan never reports silent partial success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerOutcome {
    pub scanner_id: String,
    pub tier: ScannerTier,
    pub anomalies: Vec<ProcessAnomaly>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcomes: Vec<ScannerOutcome>,
}

impl ScanReport {
    pub fn anomalies(&self) -> impl Iterator<Item = &ProcessAnomaly> {
        self.outcomes.iter().flat_map(|o| o.anomalies.iter())
    }

    pub fn failed_scanners(&self) -> impl Iterator<Item = &ScannerOutcome> {
        self.outcomes.iter().filter(|o| o.error.is_some())
    }
}
