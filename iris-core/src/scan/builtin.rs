//! Built-in scanners. Each one is pure over the snapshot it is handed:
//! process enumeration and image reads happen upstream, when the snapshot
//! is taken.

use std::sync::Arc;

use async_trait::async_trait;
use iris_model::alert::Severity;
use iris_model::event::SigningStatus;
use iris_model::scan::{ProcessAnomaly, ProcessSnapshot, ScannerTier};

use super::{ScanError, Scanner};
use crate::codec::macho::{self, MachImage};

pub fn all() -> Vec<Arc<dyn Scanner>> {
    vec![
        Arc::new(EnvInjectionScanner),
        Arc::new(TmpExecScanner),
        Arc::new(UnsignedBinaryScanner),
        Arc::new(MachHeaderScanner),
    ]
}

/// Library-injection environment variables in a live process.
pub struct EnvInjectionScanner;

const INJECTION_VARS: &[&str] = &[
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
];

#[async_trait]
impl Scanner for EnvInjectionScanner {
    fn id(&self) -> &'static str {
        "env-injection"
    }

    fn tier(&self) -> ScannerTier {
        ScannerTier::Fast
    }

    async fn run(
        &self,
        snapshot: &ProcessSnapshot,
    ) -> Result<Vec<ProcessAnomaly>, ScanError> {
        let mut findings = Vec::new();
        for process in &snapshot.processes {
            for var in INJECTION_VARS {
                if let Some(value) = process.env.get(*var) {
                    findings.push(ProcessAnomaly {
                        scanner_id: self.id().to_string(),
                        pid: process.pid,
                        process_path: process.path.clone(),
                        signing_id: process.signing_id.clone(),
                        summary: format!("{var}={value}"),
                        severity: Severity::High,
                        baseline: false,
                    });
                }
            }
        }
        Ok(findings)
    }
}

/// Executables running out of world-writable temporary directories.
pub struct TmpExecScanner;

#[async_trait]
impl Scanner for TmpExecScanner {
    fn id(&self) -> &'static str {
        "tmp-exec"
    }

    fn tier(&self) -> ScannerTier {
        ScannerTier::Fast
    }

    async fn run(
        &self,
        snapshot: &ProcessSnapshot,
    ) -> Result<Vec<ProcessAnomaly>, ScanError> {
        let findings = snapshot
            .processes
            .iter()
            .filter(|p| {
                ["/tmp/", "/private/tmp/", "/var/tmp/", "/private/var/tmp/"]
                    .iter()
                    .any(|prefix| p.path.starts_with(prefix))
            })
            .map(|p| ProcessAnomaly {
                scanner_id: self.id().to_string(),
                pid: p.pid,
                process_path: p.path.clone(),
                signing_id: p.signing_id.clone(),
                summary: format!("executing from {}", p.path),
                severity: Severity::High,
                baseline: false,
            })
            .collect();
        Ok(findings)
    }
}

/// Unsigned or ad-hoc binaries outside the platform directories.
pub struct UnsignedBinaryScanner;

#[async_trait]
impl Scanner for UnsignedBinaryScanner {
    fn id(&self) -> &'static str {
        "unsigned-binary"
    }

    fn tier(&self) -> ScannerTier {
        ScannerTier::Medium
    }

    async fn run(
        &self,
        snapshot: &ProcessSnapshot,
    ) -> Result<Vec<ProcessAnomaly>, ScanError> {
        let findings = snapshot
            .processes
            .iter()
            .filter(|p| {
                matches!(
                    p.signing,
                    SigningStatus::Unsigned | SigningStatus::AdHoc
                )
            })
            .map(|p| {
                // Home-built tooling is common; label rather than shout.
                let baseline = p.path.starts_with("/usr/local/")
                    || p.path.starts_with("/opt/homebrew/");
                ProcessAnomaly {
                    scanner_id: self.id().to_string(),
                    pid: p.pid,
                    process_path: p.path.clone(),
                    signing_id: p.signing_id.clone(),
                    summary: format!(
                        "{} binary: {}",
                        p.signing.as_str(),
                        p.path
                    ),
                    severity: if baseline {
                        Severity::Low
                    } else {
                        Severity::Medium
                    },
                    baseline,
                }
            })
            .collect();
        Ok(findings)
    }
}

/// Header anomalies in executable images: stack-executable flags, absent
/// PIE on executables, implausible load-command counts.
pub struct MachHeaderScanner;

const PLAUSIBLE_MAX_NCMDS: u32 = 4096;

#[async_trait]
impl Scanner for MachHeaderScanner {
    fn id(&self) -> &'static str {
        "macho-header"
    }

    fn tier(&self) -> ScannerTier {
        ScannerTier::Slow
    }

    async fn run(
        &self,
        snapshot: &ProcessSnapshot,
    ) -> Result<Vec<ProcessAnomaly>, ScanError> {
        let mut findings = Vec::new();
        for process in &snapshot.processes {
            if process.image_head.is_empty() {
                continue;
            }
            let header = match macho::parse(&process.image_head) {
                Ok(MachImage::Thin(header)) => header,
                // Fat images would need the per-arch slice; the snapshot
                // only carries the leading bytes.
                Ok(MachImage::Fat(_)) => continue,
                Err(_) => continue,
            };

            let mut problems = Vec::new();
            if header.allows_stack_execution() {
                problems.push("stack execution enabled");
            }
            if header.filetype == macho::MH_EXECUTE && !header.is_pie() {
                problems.push("executable without PIE");
            }
            if header.ncmds == 0 || header.ncmds > PLAUSIBLE_MAX_NCMDS {
                problems.push("implausible load command count");
            }
            if problems.is_empty() {
                continue;
            }

            findings.push(ProcessAnomaly {
                scanner_id: self.id().to_string(),
                pid: process.pid,
                process_path: process.path.clone(),
                signing_id: process.signing_id.clone(),
                summary: problems.join(", "),
                severity: Severity::Medium,
                baseline: false,
            });
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_model::scan::ProcessInfo;
    use std::collections::BTreeMap;

    fn process(pid: u32, path: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            path: path.to_string(),
            parent_pid: Some(1),
            signing: SigningStatus::AppleSigned,
            signing_id: None,
            env: BTreeMap::new(),
            image_head: Vec::new(),
        }
    }

    #[tokio::test]
    async fn env_injection_flags_preload_vars() {
        let mut p = process(5, "/opt/app/bin/app");
        p.env
            .insert("LD_PRELOAD".into(), "/tmp/evil.so".into());
        let snapshot = ProcessSnapshot::new(vec![
            p,
            process(6, "/usr/bin/clean"),
        ]);

        let findings =
            EnvInjectionScanner.run(&snapshot).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].pid, 5);
        assert!(findings[0].summary.contains("LD_PRELOAD"));
    }

    #[tokio::test]
    async fn tmp_exec_catches_private_prefix() {
        let snapshot = ProcessSnapshot::new(vec![
            process(7, "/private/tmp/dropper"),
            process(8, "/usr/bin/true"),
        ]);
        let findings = TmpExecScanner.run(&snapshot).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].pid, 7);
    }

    #[tokio::test]
    async fn unsigned_binary_labels_homebrew_as_baseline() {
        let mut brew = process(9, "/opt/homebrew/bin/jq");
        brew.signing = SigningStatus::Unsigned;
        let mut rogue = process(10, "/Users/a/Downloads/payload");
        rogue.signing = SigningStatus::AdHoc;
        let snapshot = ProcessSnapshot::new(vec![brew, rogue]);

        let findings =
            UnsignedBinaryScanner.run(&snapshot).await.unwrap();
        assert_eq!(findings.len(), 2);
        let brew_finding =
            findings.iter().find(|f| f.pid == 9).unwrap();
        assert!(brew_finding.baseline);
        let rogue_finding =
            findings.iter().find(|f| f.pid == 10).unwrap();
        assert!(!rogue_finding.baseline);
    }

    #[tokio::test]
    async fn macho_header_flags_stack_execution() {
        let mut image = Vec::new();
        image.extend_from_slice(&macho::MH_MAGIC_64.to_le_bytes());
        image.extend_from_slice(&0x0100_0007u32.to_le_bytes());
        image.extend_from_slice(&3u32.to_le_bytes());
        image.extend_from_slice(&macho::MH_EXECUTE.to_le_bytes());
        image.extend_from_slice(&20u32.to_le_bytes());
        image.extend_from_slice(&2048u32.to_le_bytes());
        let flags = macho::MH_PIE | macho::MH_ALLOW_STACK_EXECUTION;
        image.extend_from_slice(&flags.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());

        let mut p = process(11, "/opt/legacy/daemon");
        p.image_head = image;
        let snapshot = ProcessSnapshot::new(vec![p]);

        let findings = MachHeaderScanner.run(&snapshot).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].summary.contains("stack execution"));
    }
}
