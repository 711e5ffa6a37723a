//! Serde model of the OCI runtime `config.json`, limited to the fields the
//! engine invocation needs.

use serde::Serialize;

pub const OCI_VERSION: &str = "1.0.2";

/// Capabilities granted inside the sandbox. Builds only need to write audit
/// records, signal their own tree, and bind low ports for test servers.
pub const CAPABILITIES: [&str; 3] = ["CAP_AUDIT_WRITE", "CAP_KILL", "CAP_NET_BIND_SERVICE"];
pub const AMBIENT_CAPABILITIES: [&str; 1] = ["CAP_NET_BIND_SERVICE"];

pub const NOFILE_LIMIT: u64 = 8192;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciConfig {
    pub oci_version: String,
    pub process: OciProcess,
    pub root: OciRoot,
    pub hostname: String,
    pub mounts: Vec<OciMount>,
    pub linux: OciLinux,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciProcess {
    pub terminal: bool,
    pub user: OciUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub capabilities: OciCapabilities,
    pub rlimits: Vec<OciRlimit>,
    pub no_new_privileges: bool,
}

#[derive(Debug, Serialize)]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Serialize)]
pub struct OciCapabilities {
    pub bounding: Vec<String>,
    pub effective: Vec<String>,
    pub permitted: Vec<String>,
    pub ambient: Vec<String>,
}

impl Default for OciCapabilities {
    fn default() -> Self {
        let granted: Vec<String> = CAPABILITIES.iter().map(ToString::to_string).collect();
        Self {
            bounding: granted.clone(),
            effective: granted.clone(),
            permitted: granted,
            ambient: AMBIENT_CAPABILITIES.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OciRlimit {
    #[serde(rename = "type")]
    pub kind: String,
    pub hard: u64,
    pub soft: u64,
}

impl OciRlimit {
    #[must_use]
    pub fn nofile() -> Self {
        Self {
            kind: "RLIMIT_NOFILE".to_string(),
            hard: NOFILE_LIMIT,
            soft: NOFILE_LIMIT,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OciRoot {
    pub path: String,
    pub readonly: bool,
}

#[derive(Debug, Serialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub fstype: String,
    pub source: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLinux {
    pub uid_mappings: Vec<OciIdMapping>,
    pub gid_mappings: Vec<OciIdMapping>,
    pub namespaces: Vec<OciNamespace>,
}

#[derive(Debug, Serialize)]
pub struct OciIdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

#[derive(Debug, Serialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub kind: String,
}

/// The unshared namespaces. Network stays shared so builds can fetch
/// source dependencies through the host.
#[must_use]
pub fn namespaces() -> Vec<OciNamespace> {
    ["pid", "ipc", "uts", "mount", "user"]
        .iter()
        .map(|kind| OciNamespace {
            kind: (*kind).to_string(),
        })
        .collect()
}

/// The fixed system mounts every bundle carries, in mount order.
#[must_use]
pub fn system_mounts() -> Vec<OciMount> {
    let mount = |destination: &str, fstype: &str, source: &str, options: &[&str]| OciMount {
        destination: destination.to_string(),
        fstype: fstype.to_string(),
        source: source.to_string(),
        options: options.iter().map(ToString::to_string).collect(),
    };
    vec![
        mount("/proc", "proc", "proc", &[]),
        mount(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
        ),
        mount(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        mount("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        mount("/sys", "none", "/sys", &["rbind", "nosuid", "noexec", "nodev", "ro"]),
        mount(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        ),
    ]
}
