//! The compiled-in detection ruleset.

use std::time::Duration;

use iris_model::alert::Severity;
use iris_model::event::EventKind;

use super::rules::{
    CorrelationKey, CorrelationRule, FieldKey, Predicate, Rule, RuleError,
    RuleSet, Stage,
};

/// Build the default ruleset. Regex patterns are validated here, at load.
pub fn ruleset() -> Result<RuleSet, RuleError> {
    let simple = vec![
        Rule {
            id: "exec-from-tmp".into(),
            name: "Execution from temporary directory".into(),
            kind: EventKind::Exec,
            predicates: vec![Predicate::matches(
                "exec-from-tmp",
                FieldKey::TargetPath,
                r"^(/private)?/(tmp|var/tmp)/",
            )?],
            severity: Severity::High,
            mitre_id: "T1204.002".into(),
            mitre_name: "User Execution: Malicious File".into(),
        },
        Rule {
            id: "curl-pipe-shell".into(),
            name: "Remote script piped into shell".into(),
            kind: EventKind::Exec,
            predicates: vec![
                Predicate::ProcessNameIn(vec![
                    "sh".into(),
                    "bash".into(),
                    "zsh".into(),
                ]),
                Predicate::Contains {
                    field: FieldKey::Args,
                    value: "curl".into(),
                },
            ],
            severity: Severity::High,
            mitre_id: "T1059.004".into(),
            mitre_name: "Command and Scripting Interpreter: Unix Shell"
                .into(),
        },
        Rule {
            id: "shell-from-office".into(),
            name: "Shell spawned by document application".into(),
            kind: EventKind::Exec,
            predicates: vec![
                Predicate::ProcessNameIn(vec![
                    "sh".into(),
                    "bash".into(),
                    "zsh".into(),
                    "osascript".into(),
                ]),
                Predicate::ParentNameIn(vec![
                    "Microsoft Word".into(),
                    "Microsoft Excel".into(),
                    "Preview".into(),
                    "Acrobat Reader".into(),
                ]),
            ],
            severity: Severity::Critical,
            mitre_id: "T1566.001".into(),
            mitre_name: "Phishing: Spearphishing Attachment".into(),
        },
        Rule {
            id: "tcc-tamper".into(),
            name: "Privacy permission database modified".into(),
            kind: EventKind::TccModify,
            predicates: vec![],
            severity: Severity::Critical,
            mitre_id: "T1562.001".into(),
            mitre_name: "Impair Defenses: Disable or Modify Tools".into(),
        },
        Rule {
            id: "launch-item-persistence".into(),
            name: "Background launch item registered".into(),
            kind: EventKind::BtmLaunchItemAdd,
            predicates: vec![],
            severity: Severity::Medium,
            mitre_id: "T1543.001".into(),
            mitre_name: "Create or Modify System Process: Launch Agent"
                .into(),
        },
        Rule {
            id: "unsigned-task-access".into(),
            name: "Unsigned process inspecting another task".into(),
            kind: EventKind::GetTask,
            predicates: vec![Predicate::NotAppleSigned],
            severity: Severity::High,
            mitre_id: "T1055".into(),
            mitre_name: "Process Injection".into(),
        },
        Rule {
            id: "remote-thread-create".into(),
            name: "Thread created in a foreign process".into(),
            kind: EventKind::RemoteThreadCreate,
            predicates: vec![],
            severity: Severity::Critical,
            mitre_id: "T1055.002".into(),
            mitre_name: "Process Injection: Portable Executable Injection"
                .into(),
        },
        Rule {
            id: "kext-load".into(),
            name: "Kernel extension loaded".into(),
            kind: EventKind::KextLoad,
            predicates: vec![],
            severity: Severity::High,
            mitre_id: "T1547.006".into(),
            mitre_name: "Boot or Logon Autostart Execution: Kernel Modules"
                .into(),
        },
        Rule {
            id: "ssh-login".into(),
            name: "Inbound SSH session".into(),
            kind: EventKind::SshLogin,
            predicates: vec![],
            severity: Severity::Low,
            mitre_id: "T1021.004".into(),
            mitre_name: "Remote Services: SSH".into(),
        },
        Rule {
            id: "dns-exfil".into(),
            name: "High-entropy DNS labels".into(),
            kind: EventKind::DnsExfil,
            predicates: vec![],
            severity: Severity::High,
            mitre_id: "T1048.003".into(),
            mitre_name:
                "Exfiltration Over Alternative Protocol: DNS".into(),
        },
        Rule {
            id: "dns-dga".into(),
            name: "Algorithmically generated domain".into(),
            kind: EventKind::DnsDga,
            predicates: vec![],
            severity: Severity::Medium,
            mitre_id: "T1568.002".into(),
            mitre_name: "Dynamic Resolution: Domain Generation Algorithms"
                .into(),
        },
        Rule {
            id: "xprotect-malware".into(),
            name: "Platform anti-malware detection".into(),
            kind: EventKind::XprotectMalware,
            predicates: vec![],
            severity: Severity::Critical,
            mitre_id: "T1204".into(),
            mitre_name: "User Execution".into(),
        },
    ];

    let correlations = vec![
        CorrelationRule {
            id: "fake-prompt-chain".into(),
            name: "Script prompt, drop, and beacon chain".into(),
            stages: vec![
                Stage {
                    kind: EventKind::Exec,
                    predicates: vec![
                        Predicate::ProcessNameIn(vec!["osascript".into()]),
                        Predicate::Contains {
                            field: FieldKey::Args,
                            value: "shell script".into(),
                        },
                    ],
                },
                Stage {
                    kind: EventKind::FileWrite,
                    predicates: vec![Predicate::ProcessNameIn(vec![
                        "osascript".into(),
                    ])],
                },
                Stage {
                    kind: EventKind::Connection,
                    predicates: vec![Predicate::ProcessNameIn(vec![
                        "osascript".into(),
                    ])],
                },
            ],
            window: Duration::from_secs(30),
            key: CorrelationKey::Pid,
            severity: Severity::Critical,
            mitre_id: "T1059.002".into(),
            mitre_name:
                "Command and Scripting Interpreter: AppleScript".into(),
        },
        CorrelationRule {
            id: "persist-then-beacon".into(),
            name: "Persistence item followed by outbound beacon".into(),
            stages: vec![
                Stage {
                    kind: EventKind::BtmLaunchItemAdd,
                    predicates: vec![],
                },
                Stage {
                    kind: EventKind::Connection,
                    predicates: vec![],
                },
            ],
            window: Duration::from_secs(300),
            key: CorrelationKey::ProcessPath,
            severity: Severity::High,
            mitre_id: "T1543.001".into(),
            mitre_name: "Create or Modify System Process: Launch Agent"
                .into(),
        },
        CorrelationRule {
            id: "escalate-then-tamper".into(),
            name: "Privilege change followed by privacy tamper".into(),
            stages: vec![
                Stage {
                    kind: EventKind::Setuid,
                    predicates: vec![],
                },
                Stage {
                    kind: EventKind::TccModify,
                    predicates: vec![],
                },
            ],
            window: Duration::from_secs(120),
            key: CorrelationKey::Pid,
            severity: Severity::Critical,
            mitre_id: "T1548.001".into(),
            mitre_name:
                "Abuse Elevation Control Mechanism: Setuid and Setgid".into(),
        },
    ];

    RuleSet::new(simple, correlations)
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    //! Event constructors shared by the detection tests.

    use std::collections::BTreeMap;

    use iris_model::event::{
        EventActor, EventKind, EventTarget, SecurityEvent, SigningStatus,
    };

    pub fn event(
        kind: EventKind,
        pid: u32,
        path: &str,
        detail: &[(&str, &str)],
    ) -> SecurityEvent {
        SecurityEvent {
            kind,
            actor: EventActor {
                pid,
                path: path.to_string(),
                parent_pid: Some(1),
                parent_path: Some("/sbin/launchd".into()),
                signing: SigningStatus::AppleSigned,
            },
            target: EventTarget::None,
            detail: detail
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            monotonic_ns: 0,
            seq: 0,
            wall_time: chrono::Utc::now(),
        }
    }

    pub fn exec_event(
        pid: u32,
        path: &str,
        args: &str,
        at_secs: u64,
    ) -> SecurityEvent {
        let mut e = event(EventKind::Exec, pid, path, &[("args", args)]);
        e.target = EventTarget::Path(path.to_string());
        e.monotonic_ns = at_secs * 1_000_000_000;
        e
    }

    pub fn file_write_event(
        pid: u32,
        path: &str,
        target: &str,
        at_secs: u64,
    ) -> SecurityEvent {
        let mut e = event(EventKind::FileWrite, pid, path, &[]);
        e.target = EventTarget::Path(target.to_string());
        e.monotonic_ns = at_secs * 1_000_000_000;
        e
    }

    pub fn connection_event(
        pid: u32,
        path: &str,
        host: &str,
        port: u16,
        at_secs: u64,
    ) -> SecurityEvent {
        let mut e = event(EventKind::Connection, pid, path, &[]);
        e.target = EventTarget::Endpoint {
            host: host.to_string(),
            port,
        };
        e.monotonic_ns = at_secs * 1_000_000_000;
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_ruleset_compiles() {
        let rules = ruleset().expect("builtin rules are valid");
        assert!(rules.simple.len() >= 10);
        assert!(rules.correlations.len() >= 3);
    }

    #[test]
    fn exec_from_tmp_matches_private_prefix() {
        use test_support::*;
        let rules = ruleset().unwrap();
        let rule = rules
            .simple
            .iter()
            .find(|r| r.id.as_str() == "exec-from-tmp")
            .unwrap();

        let mut hit = event(EventKind::Exec, 1, "/private/tmp/payload", &[]);
        hit.target =
            iris_model::event::EventTarget::Path("/private/tmp/payload".into());
        assert!(rule.matches(&hit));

        let mut miss = event(EventKind::Exec, 1, "/usr/bin/true", &[]);
        miss.target =
            iris_model::event::EventTarget::Path("/usr/bin/true".into());
        assert!(!rule.matches(&miss));
    }
}
