//! Three-tier batch scanner runtime.
//!
//! Scanners are pluggable: `run(snapshot)` against a caller-provided
//! process snapshot, returning anomalies. Within a tier all scanners run
//! concurrently; tiers run in sequence so fast findings surface before the
//! slow tier finishes. A scanner failure is captured as that scanner's
//! outcome and never aborts the session.

pub mod builtin;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use iris_model::scan::{
    ProcessAnomaly, ProcessSnapshot, ScanReport, ScannerOutcome, ScannerTier,
};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ScanError(pub String);

#[async_trait]
pub trait Scanner: Send + Sync {
    fn id(&self) -> &'static str;
    fn tier(&self) -> ScannerTier;
    async fn run(
        &self,
        snapshot: &ProcessSnapshot,
    ) -> Result<Vec<ProcessAnomaly>, ScanError>;
}

#[derive(Default)]
pub struct ScannerRuntime {
    scanners: Vec<Arc<dyn Scanner>>,
}

impl std::fmt::Debug for ScannerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScannerRuntime")
            .field("scanners", &self.scanners.len())
            .finish()
    }
}

impl ScannerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default scanner complement.
    pub fn with_builtin() -> Self {
        let mut runtime = Self::new();
        for scanner in builtin::all() {
            runtime.register(scanner);
        }
        runtime
    }

    pub fn register(&mut self, scanner: Arc<dyn Scanner>) {
        self.scanners.push(scanner);
    }

    pub fn len(&self) -> usize {
        self.scanners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scanners.is_empty()
    }

    /// Run every scanner tier by tier and collect per-scanner outcomes,
    /// failures included.
    pub async fn run(&self, snapshot: &ProcessSnapshot) -> ScanReport {
        let started_at = Utc::now();
        let mut outcomes = Vec::with_capacity(self.scanners.len());

        for tier in [ScannerTier::Fast, ScannerTier::Medium, ScannerTier::Slow]
        {
            let tier_scanners: Vec<Arc<dyn Scanner>> = self
                .scanners
                .iter()
                .filter(|s| s.tier() == tier)
                .cloned()
                .collect();
            if tier_scanners.is_empty() {
                continue;
            }
            debug!(
                target: "scan::runtime",
                tier = tier.as_str(),
                scanners = tier_scanners.len(),
                "tier started"
            );

            let runs = tier_scanners.iter().map(|scanner| {
                let scanner = Arc::clone(scanner);
                async move {
                    let clock = Instant::now();
                    let result = scanner.run(snapshot).await;
                    (scanner, clock.elapsed(), result)
                }
            });

            for (scanner, elapsed, result) in join_all(runs).await {
                let outcome = match result {
                    Ok(anomalies) => ScannerOutcome {
                        scanner_id: scanner.id().to_string(),
                        tier,
                        anomalies,
                        error: None,
                        elapsed,
                    },
                    Err(err) => {
                        warn!(
                            target: "scan::runtime",
                            scanner = scanner.id(),
                            error = %err,
                            "scanner failed"
                        );
                        ScannerOutcome {
                            scanner_id: scanner.id().to_string(),
                            tier,
                            anomalies: Vec::new(),
                            error: Some(err.to_string()),
                            elapsed,
                        }
                    }
                };
                outcomes.push(outcome);
            }
        }

        let report = ScanReport {
            started_at,
            completed_at: Utc::now(),
            outcomes,
        };
        info!(
            target: "scan::runtime",
            scanners = report.outcomes.len(),
            anomalies = report.anomalies().count(),
            failed = report.failed_scanners().count(),
            "scan session complete"
        );
        report
    }
}
