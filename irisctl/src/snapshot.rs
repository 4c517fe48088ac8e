//! Process snapshot collection for the batch scanner tier. Reads procfs
//! once; scanners stay pure over the result.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use iris_core::detect::normalize::{PathHeuristicOracle, SigningOracle};
use iris_model::scan::{ProcessInfo, ProcessSnapshot};
use tracing::debug;

/// Leading bytes of each executable image retained for header analysis.
const IMAGE_HEAD_BYTES: usize = 4096;

pub fn take() -> ProcessSnapshot {
    take_from(Path::new("/proc"))
}

/// Enumerate processes under a procfs root. Unreadable entries are
/// skipped; a truncated enumeration is reported as-is, never padded.
pub fn take_from(proc_root: &Path) -> ProcessSnapshot {
    let oracle = PathHeuristicOracle;
    let mut processes = Vec::new();

    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return ProcessSnapshot::new(processes);
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let dir = entry.path();

        let Ok(exe) = std::fs::read_link(dir.join("exe")) else {
            // Kernel threads and exited processes have no image.
            continue;
        };
        let path = exe.to_string_lossy().to_string();

        let parent_pid = std::fs::read_to_string(dir.join("stat"))
            .ok()
            .and_then(|stat| parse_ppid(&stat));
        let env = std::fs::read(dir.join("environ"))
            .map(|raw| parse_environ(&raw))
            .unwrap_or_default();
        let image_head = read_image_head(&exe);
        let signing = oracle.signing_info(pid, &path);

        processes.push(ProcessInfo {
            pid,
            path,
            parent_pid,
            signing: signing.status,
            signing_id: signing.signing_id,
            env,
            image_head,
        });
    }

    debug!(
        target: "scan::snapshot",
        processes = processes.len(),
        "process snapshot taken"
    );
    ProcessSnapshot::new(processes)
}

fn parse_ppid(stat: &str) -> Option<u32> {
    // Field 4, after the parenthesized command which may contain spaces.
    let after_comm = stat.rsplit_once(')')?.1;
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

fn parse_environ(raw: &[u8]) -> BTreeMap<String, String> {
    raw.split(|&b| b == 0)
        .filter_map(|entry| {
            let entry = std::str::from_utf8(entry).ok()?;
            let (key, value) = entry.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn read_image_head(exe: &Path) -> Vec<u8> {
    let Ok(file) = std::fs::File::open(exe) else {
        return Vec::new();
    };
    let mut head = vec![0u8; IMAGE_HEAD_BYTES];
    let mut taken = 0;
    let mut reader = file.take(IMAGE_HEAD_BYTES as u64);
    while let Ok(n) = reader.read(&mut head[taken..]) {
        if n == 0 {
            break;
        }
        taken += n;
    }
    head.truncate(taken);
    head
}
