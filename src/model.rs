//! Normalized cluster data model (`spec.md` §3).
//!
//! Entities are plain records with runtime metrics, configuration, and
//! provenance kept in separate fields. VM runtime fields sit behind a
//! per-VM lock (`Arc<RwLock<Vm>>`) rather than a Go-style mutex field, so
//! enrichment workers can hold a write guard exactly for the duration of
//! an update (`spec.md` §5 "VM runtime fields — per-VM mutex").

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub type VmId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    Qemu,
    Lxc,
}

impl VmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmType::Qemu => "qemu",
            VmType::Lxc => "lxc",
        }
    }
}

impl std::fmt::Display for VmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, published view of one cluster. Rebuilt wholesale on every
/// `Client::get_cluster_status`; never mutated in place once published —
/// readers hold an `Arc` to the version current when they asked.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub name: String,
    pub version: String,
    pub quorate: bool,
    pub total_nodes: u32,
    pub online_nodes: u32,
    pub cpu_usage: f64,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
    pub nodes: Vec<Node>,
}

impl ClusterSnapshot {
    /// All VMs across all nodes, flattened, for callers that want a cluster
    /// wide guest list without walking `nodes` themselves.
    pub fn all_vms(&self) -> Vec<Arc<RwLock<Vm>>> {
        self.nodes.iter().flat_map(|n| n.vms.iter().cloned()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CpuInfo {
    pub cores: u32,
    pub sockets: u32,
    pub model: String,
    pub cpus: u32,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub online: bool,
    pub cpu_count: u32,
    pub cpu_usage: f64,
    pub memory_total_gb: f64,
    pub memory_used_gb: f64,
    pub total_storage_bytes: u64,
    pub used_storage_bytes: u64,
    pub uptime_secs: u64,
    pub version: String,
    pub kernel_version: String,
    pub load_avg: [String; 3],
    pub cpu_info: CpuInfo,
    pub storage: Vec<Storage>,
    pub vms: Vec<Arc<RwLock<Vm>>>,
    /// Which cluster connection (group-mode profile name) this node was
    /// read from. Empty outside group mode.
    pub source_profile: String,
}

impl Node {
    /// A placeholder entry for a profile that produced no real node data
    /// (`spec.md` §4.6/§8). `version` carries a short human reason:
    /// `"Offline"`, `"Connection Failed"`, or `"No Data"`.
    pub fn placeholder(profile: &str, reason: &str) -> Self {
        Node {
            id: format!("offline-{profile}"),
            name: profile.to_string(),
            ip: String::new(),
            online: false,
            cpu_count: 0,
            cpu_usage: 0.0,
            memory_total_gb: 0.0,
            memory_used_gb: 0.0,
            total_storage_bytes: 0,
            used_storage_bytes: 0,
            uptime_secs: 0,
            version: reason.to_string(),
            kernel_version: String::new(),
            load_avg: [String::new(), String::new(), String::new()],
            cpu_info: CpuInfo::default(),
            storage: Vec::new(),
            vms: Vec::new(),
            source_profile: profile.to_string(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.id.starts_with("offline-")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfiguredNetwork {
    pub interface: String,
    pub model: Option<String>,
    pub mac: Option<String>,
    pub bridge: Option<String>,
    pub tag: Option<u32>,
    pub rate: Option<f64>,
    pub firewall: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageDevice {
    pub interface: String,
    pub pool: Option<String>,
    pub volume: String,
    pub size: Option<String>,
    pub format: Option<String>,
    pub cache: Option<String>,
    pub iothread: bool,
    pub ssd: bool,
    pub discard: Option<String>,
    pub serial: Option<String>,
    pub backup: bool,
    pub replicate: bool,
    pub media: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GuestNetInterface {
    pub name: String,
    pub mac: String,
    pub ip_addresses: Vec<std::net::IpAddr>,
}

#[derive(Debug, Clone, Default)]
pub struct GuestFilesystem {
    pub mountpoint: String,
    pub fs_type: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// A VM or container. Runtime metric fields are only ever updated from a
/// status fetch (`Client::get_vm_status`); config fields come from a
/// separate `config` fetch during enrichment.
#[derive(Debug, Clone)]
pub struct Vm {
    pub id: VmId,
    pub name: String,
    pub node: String,
    pub kind: VmType,
    pub status: String,
    pub ip: Option<String>,
    pub template: bool,
    pub tags: Vec<String>,
    pub pool: Option<String>,
    pub ha_state: Option<String>,
    pub lock: Option<String>,

    pub cpu: f64,
    pub mem: u64,
    pub max_mem: u64,
    pub disk: u64,
    pub max_disk: u64,
    pub uptime_secs: u64,
    pub disk_read: u64,
    pub disk_write: u64,
    pub net_in: u64,
    pub net_out: u64,

    pub agent_enabled: bool,
    pub agent_running: bool,
    pub net_interfaces: Vec<GuestNetInterface>,
    pub filesystems: Vec<GuestFilesystem>,

    pub configured_networks: Vec<ConfiguredNetwork>,
    pub storage_devices: Vec<StorageDevice>,
    pub cpu_cores: u32,
    pub cpu_sockets: u32,
    pub architecture: Option<String>,
    pub os_type: Option<String>,
    pub description: Option<String>,
    pub on_boot: bool,
    pub boot_order: Option<String>,
    pub configured_macs: HashSet<String>,

    pub source_profile: String,

    /// Config + status fetched this cycle.
    pub enriched: bool,
    /// Guest-agent probe already attempted this cycle (`spec.md` §4.5.1
    /// "not yet probed this cycle").
    pub guest_agent_checked: bool,
}

impl Vm {
    pub fn new(id: VmId, name: impl Into<String>, node: impl Into<String>, kind: VmType) -> Self {
        Vm {
            id,
            name: name.into(),
            node: node.into(),
            kind,
            status: String::new(),
            ip: None,
            template: false,
            tags: Vec::new(),
            pool: None,
            ha_state: None,
            lock: None,
            cpu: 0.0,
            mem: 0,
            max_mem: 0,
            disk: 0,
            max_disk: 0,
            uptime_secs: 0,
            disk_read: 0,
            disk_write: 0,
            net_in: 0,
            net_out: 0,
            agent_enabled: false,
            agent_running: false,
            net_interfaces: Vec::new(),
            filesystems: Vec::new(),
            configured_networks: Vec::new(),
            storage_devices: Vec::new(),
            cpu_cores: 0,
            cpu_sockets: 0,
            architecture: None,
            os_type: None,
            description: None,
            on_boot: false,
            boot_order: None,
            configured_macs: HashSet::new(),
            source_profile: String::new(),
            enriched: false,
            guest_agent_checked: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// Applies a fresh status read, preserving `disk`/`max_disk` when the
    /// response reports zero and a prior non-zero value is already known
    /// (`spec.md` §3/§8 invariant).
    pub fn apply_status(&mut self, status: VmStatusUpdate) {
        self.status = status.status;
        self.cpu = status.cpu;
        self.mem = status.mem;
        self.max_mem = status.max_mem;
        if status.disk != 0 || self.disk == 0 {
            self.disk = status.disk;
        }
        if status.max_disk != 0 || self.max_disk == 0 {
            self.max_disk = status.max_disk;
        }
        self.uptime_secs = status.uptime_secs;
        self.disk_read = status.disk_read;
        self.disk_write = status.disk_write;
        self.net_in = status.net_in;
        self.net_out = status.net_out;
        self.ha_state = status.ha_state;
        self.lock = status.lock;
    }
}

/// The subset of fields a `/status/current` fetch can report, kept
/// separate from `Vm` so `apply_status` can implement the
/// preserve-non-zero invariant explicitly.
#[derive(Debug, Clone, Default)]
pub struct VmStatusUpdate {
    pub status: String,
    pub cpu: f64,
    pub mem: u64,
    pub max_mem: u64,
    pub disk: u64,
    pub max_disk: u64,
    pub uptime_secs: u64,
    pub disk_read: u64,
    pub disk_write: u64,
    pub net_in: u64,
    pub net_out: u64,
    pub ha_state: Option<String>,
    pub lock: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Storage {
    pub id: String,
    pub name: String,
    pub content: String,
    pub disk_bytes: u64,
    pub max_disk_bytes: u64,
    pub node: String,
    pub plugin_type: String,
    pub status: String,
    pub shared: bool,
}

impl Storage {
    pub fn usage_percent(&self) -> f64 {
        if self.max_disk_bytes == 0 {
            0.0
        } else {
            self.disk_bytes as f64 / self.max_disk_bytes as f64 * 100.0
        }
    }

    pub fn disk_gb(&self) -> f64 {
        self.disk_bytes as f64 / 1024.0 / 1024.0 / 1024.0
    }

    pub fn max_disk_gb(&self) -> f64 {
        self.max_disk_bytes as f64 / 1024.0 / 1024.0 / 1024.0
    }

    pub fn supports_backup(&self) -> bool {
        self.content.split(',').any(|c| c.trim() == "backup")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub upid: String,
    pub node: String,
    pub vmid: Option<VmId>,
    pub status: TaskStatus,
    pub exit_status: Option<String>,
    pub start_time: Instant,
    /// Set by `GroupManager::get_group_tasks`; empty for tasks tracked
    /// directly through `TaskPoller` (`spec.md` §4.6).
    pub source_profile: String,
}

/// Parses the colon-delimited `UPID:<node>:<pid>:<pstart>:<starttime>:<type>:<id>:<user>:` format
/// far enough to pull the node name out without treating the rest as
/// anything but opaque, per `spec.md` §6 "treat as opaque".
pub fn upid_node(upid: &str) -> Option<&str> {
    upid.strip_prefix("UPID:")?.split(':').next()
}

#[derive(Debug, Clone)]
pub struct AuthToken {
    pub ticket: String,
    pub csrf_token: String,
    pub username: String,
    pub expires_at: Instant,
}

impl AuthToken {
    pub fn password(ticket: String, csrf_token: String, username: String) -> Self {
        AuthToken {
            ticket,
            csrf_token,
            username,
            expires_at: Instant::now() + Duration::from_secs(2 * 3600),
        }
    }

    /// Synthetic record for API-token mode: always 24h valid, `ticket`
    /// holds the full `PVEAPIToken=...` header value (`spec.md` §4.3).
    pub fn synthetic(header_value: String, username: String) -> Self {
        AuthToken {
            ticket: header_value,
            csrf_token: String::new(),
            username,
            expires_at: Instant::now() + Duration::from_secs(24 * 3600),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.ticket.is_empty() && Instant::now() < self.expires_at
    }
}

/// Tagged sum for heterogeneous `/cluster/resources` rows (`spec.md` §9
/// design note): node, storage, qemu, and lxc rows share one endpoint,
/// discriminated by the `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClusterResourceEntry {
    Node(NodeResource),
    Storage(StorageResource),
    Qemu(GuestResource),
    Lxc(GuestResource),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeResource {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub maxcpu: Option<u32>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub mem: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageResource {
    pub storage: String,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub plugintype: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub maxdisk: Option<u64>,
    #[serde(default)]
    pub disk: Option<u64>,
    #[serde(default)]
    pub shared: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuestResource {
    pub vmid: VmId,
    pub node: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub template: Option<u8>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub mem: Option<u64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub disk: Option<u64>,
    #[serde(default)]
    pub maxdisk: Option<u64>,
    #[serde(default)]
    pub uptime: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_valid_iff_nonempty_and_unexpired() {
        let valid = AuthToken::password("t".into(), "c".into(), "u".into());
        assert!(valid.is_valid());

        let mut expired = valid.clone();
        expired.expires_at = Instant::now() - Duration::from_secs(1);
        assert!(!expired.is_valid());

        let mut empty = valid;
        empty.ticket.clear();
        assert!(!empty.is_valid());
    }

    #[test]
    fn apply_status_preserves_nonzero_disk_on_zero_report() {
        let mut vm = Vm::new(100, "test", "pve1", VmType::Qemu);
        vm.disk = 1024;
        vm.max_disk = 2048;
        vm.apply_status(VmStatusUpdate {
            status: "running".into(),
            disk: 0,
            max_disk: 0,
            ..Default::default()
        });
        assert_eq!(vm.disk, 1024);
        assert_eq!(vm.max_disk, 2048);
    }

    #[test]
    fn apply_status_accepts_nonzero_disk() {
        let mut vm = Vm::new(100, "test", "pve1", VmType::Qemu);
        vm.disk = 1024;
        vm.apply_status(VmStatusUpdate {
            status: "running".into(),
            disk: 4096,
            ..Default::default()
        });
        assert_eq!(vm.disk, 4096);
    }

    #[test]
    fn placeholder_node_has_synthetic_id() {
        let node = Node::placeholder("backup", "Connection Failed");
        assert_eq!(node.id, "offline-backup");
        assert!(!node.online);
        assert!(node.is_placeholder());
    }

    #[test]
    fn upid_node_extracts_node_name() {
        assert_eq!(
            upid_node("UPID:pve1:0000C530:001C9BEC:00000000:qmstart:100:root@pam:"),
            Some("pve1")
        );
        assert_eq!(upid_node("not-a-upid"), None);
    }

    #[test]
    fn storage_supports_backup_checks_content_list() {
        let storage = Storage {
            content: "iso,backup,images".into(),
            ..Default::default()
        };
        assert!(storage.supports_backup());
        let storage = Storage {
            content: "iso,images".into(),
            ..Default::default()
        };
        assert!(!storage.supports_backup());
    }
}
