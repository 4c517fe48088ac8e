use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The finite set of normalized security event kinds. Kernel callbacks map
/// onto the first group; the proxy and DNS tiers mint the synthetic kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Exec,
    Fork,
    FileOpen,
    FileWrite,
    FileRename,
    FileUnlink,
    SetExtAttr,
    Setuid,
    Setgid,
    Sudo,
    Mmap,
    Mprotect,
    GetTask,
    RemoteThreadCreate,
    TccModify,
    BtmLaunchItemAdd,
    SshLogin,
    XpcConnect,
    ProcSuspendResume,
    KextLoad,
    Ptrace,
    Mount,
    AuthOpen,
    XprotectMalware,
    // Synthetic kinds minted from proxy and DNS telemetry.
    Connection,
    DnsQuery,
    DnsExfil,
    DnsDga,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Exec => "exec",
            EventKind::Fork => "fork",
            EventKind::FileOpen => "file_open",
            EventKind::FileWrite => "file_write",
            EventKind::FileRename => "file_rename",
            EventKind::FileUnlink => "file_unlink",
            EventKind::SetExtAttr => "set_ext_attr",
            EventKind::Setuid => "setuid",
            EventKind::Setgid => "setgid",
            EventKind::Sudo => "sudo",
            EventKind::Mmap => "mmap",
            EventKind::Mprotect => "mprotect",
            EventKind::GetTask => "get_task",
            EventKind::RemoteThreadCreate => "remote_thread_create",
            EventKind::TccModify => "tcc_modify",
            EventKind::BtmLaunchItemAdd => "btm_launch_item_add",
            EventKind::SshLogin => "ssh_login",
            EventKind::XpcConnect => "xpc_connect",
            EventKind::ProcSuspendResume => "proc_suspend_resume",
            EventKind::KextLoad => "kext_load",
            EventKind::Ptrace => "ptrace",
            EventKind::Mount => "mount",
            EventKind::AuthOpen => "auth_open",
            EventKind::XprotectMalware => "xprotect_malware",
            EventKind::Connection => "connection",
            EventKind::DnsQuery => "dns_query",
            EventKind::DnsExfil => "dns_exfil",
            EventKind::DnsDga => "dns_dga",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SigningStatus {
    AppleSigned,
    ThirdPartySigned,
    AdHoc,
    Unsigned,
}

impl SigningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningStatus::AppleSigned => "apple_signed",
            SigningStatus::ThirdPartySigned => "third_party_signed",
            SigningStatus::AdHoc => "ad_hoc",
            SigningStatus::Unsigned => "unsigned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventActor {
    pub pid: u32,
    pub path: String,
    pub parent_pid: Option<u32>,
    pub parent_path: Option<String>,
    pub signing: SigningStatus,
}

impl EventActor {
    pub fn process_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.parent_path
            .as_deref()
            .map(|p| p.rsplit('/').next().unwrap_or(p))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTarget {
    Path(String),
    Endpoint { host: String, port: u16 },
    Descriptor(String),
    None,
}

impl EventTarget {
    pub fn path(&self) -> Option<&str> {
        match self {
            EventTarget::Path(p) => Some(p),
            _ => None,
        }
    }
}

/// A normalized kernel or synthetic security event. Sequence numbers
/// establish a total order within the producing normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub kind: EventKind,
    pub actor: EventActor,
    pub target: EventTarget,
    /// Free-form detail fields (args, record_type, remote_host, ...).
    pub detail: BTreeMap<String, String>,
    /// Monotonic timestamp in nanoseconds from the producer's clock.
    pub monotonic_ns: u64,
    pub seq: u64,
    pub wall_time: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn detail_field(&self, key: &str) -> Option<&str> {
        self.detail.get(key).map(String::as_str)
    }
}

/// Raw payload delivered by the kernel security-event subscription, before
/// normalization. The subscription itself is an external collaborator; this
/// is the shape it hands us.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEsEvent {
    pub kind: EventKind,
    pub pid: u32,
    pub process_path: String,
    pub parent_pid: Option<u32>,
    pub parent_path: Option<String>,
    pub target_path: Option<String>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub args: Vec<String>,
    pub detail: BTreeMap<String, String>,
    pub monotonic_ns: u64,
}
