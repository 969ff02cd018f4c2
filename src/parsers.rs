//! Config-string mini-grammars (`spec.md` §6/§8/§9).
//!
//! Each grammar is implemented as a small, pure, test-covered function
//! rather than threaded through the generic enrichment code, matching the
//! teacher's habit (`pve-client/src/verifiers.rs`) of isolating wire-format
//! parsing from request plumbing.

use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{ConfiguredNetwork, GuestFilesystem, GuestNetInterface, StorageDevice, VmType};

static MAC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("valid regex"));

fn is_mac(s: &str) -> bool {
    MAC_RE.is_match(s)
}

/// Parses a QEMU `netN=...` value: the MAC appears either as `model=MAC`
/// (e.g. `virtio=AA:BB:CC:DD:EE:FF`) or as a bare 17-char MAC; remaining
/// tokens are `key=value` pairs (`bridge`, `tag`, `rate`, `firewall`).
pub fn parse_qemu_net_config(interface: &str, raw: &str) -> ConfiguredNetwork {
    let mut net = ConfiguredNetwork {
        interface: interface.to_string(),
        ..Default::default()
    };

    for (i, token) in raw.split(',').enumerate() {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if i == 0 && !token.contains('=') {
            if is_mac(token) {
                net.mac = Some(token.to_uppercase());
            }
            continue;
        }
        match token.split_once('=') {
            Some((key, value)) if i == 0 && is_mac(value) => {
                net.model = Some(key.to_string());
                net.mac = Some(value.to_uppercase());
            }
            Some(("bridge", value)) => net.bridge = Some(value.to_string()),
            Some(("tag", value)) => net.tag = value.parse().ok(),
            Some(("rate", value)) => net.rate = value.parse().ok(),
            Some(("firewall", value)) => net.firewall = parse_onboot(value),
            Some((key, _)) if i == 0 => net.model = Some(key.to_string()),
            _ => {}
        }
    }
    net
}

/// Inverse of `parse_qemu_net_config`: renders `model=MAC` (or a bare MAC if
/// no model was recorded) followed by the known `key=value` tokens, in the
/// order PVE itself writes them.
pub fn build_qemu_net_config(net: &ConfiguredNetwork) -> String {
    let mut parts = Vec::new();
    match (&net.model, &net.mac) {
        (Some(model), Some(mac)) => parts.push(format!("{model}={mac}")),
        (None, Some(mac)) => parts.push(mac.clone()),
        (Some(model), None) => parts.push(model.clone()),
        (None, None) => {}
    }
    if let Some(bridge) = &net.bridge {
        parts.push(format!("bridge={bridge}"));
    }
    if let Some(tag) = net.tag {
        parts.push(format!("tag={tag}"));
    }
    if let Some(rate) = net.rate {
        parts.push(format!("rate={rate}"));
    }
    if net.firewall {
        parts.push("firewall=1".to_string());
    }
    parts.join(",")
}

/// Parses an LXC `netN=...` value: all tokens are `key=value`
/// (`name`, `hwaddr`, `bridge`, `ip`, `gw`, ...).
pub fn parse_lxc_net_config(interface: &str, raw: &str) -> ConfiguredNetwork {
    let mut net = ConfiguredNetwork {
        interface: interface.to_string(),
        ..Default::default()
    };
    for token in raw.split(',') {
        let Some((key, value)) = token.trim().split_once('=') else {
            continue;
        };
        match key {
            "hwaddr" => net.mac = Some(value.to_uppercase()),
            "bridge" => net.bridge = Some(value.to_string()),
            "tag" => net.tag = value.parse().ok(),
            "rate" => net.rate = value.parse().ok(),
            "firewall" => net.firewall = parse_onboot(value),
            "name" => net.model = Some(value.to_string()),
            _ => {}
        }
    }
    net
}

/// Inverse of `parse_lxc_net_config`.
pub fn build_lxc_net_config(net: &ConfiguredNetwork) -> String {
    let mut parts = Vec::new();
    if let Some(model) = &net.model {
        parts.push(format!("name={model}"));
    }
    if let Some(mac) = &net.mac {
        parts.push(format!("hwaddr={mac}"));
    }
    if let Some(bridge) = &net.bridge {
        parts.push(format!("bridge={bridge}"));
    }
    if let Some(tag) = net.tag {
        parts.push(format!("tag={tag}"));
    }
    if let Some(rate) = net.rate {
        parts.push(format!("rate={rate}"));
    }
    if net.firewall {
        parts.push("firewall=1".to_string());
    }
    parts.join(",")
}

/// Parses a storage device value (`scsiN`, `ideN`, `virtioN`, `sataN`,
/// `efidiskN`): first token is either `pool:volume` or a `/dev/...` path;
/// the rest are `key=value`.
pub fn parse_storage_device(interface: &str, raw: &str) -> StorageDevice {
    let mut device = StorageDevice {
        interface: interface.to_string(),
        ..Default::default()
    };

    let mut parts = raw.split(',');
    if let Some(first) = parts.next() {
        if first.starts_with("/dev/") {
            device.volume = first.to_string();
        } else if let Some((pool, volume)) = first.split_once(':') {
            device.pool = Some(pool.to_string());
            device.volume = volume.to_string();
        } else {
            device.volume = first.to_string();
        }
    }

    for token in parts {
        let Some((key, value)) = token.trim().split_once('=') else {
            continue;
        };
        match key {
            "size" => device.size = Some(value.to_string()),
            "format" => device.format = Some(value.to_string()),
            "cache" => device.cache = Some(value.to_string()),
            "iothread" => device.iothread = parse_onboot(value),
            "ssd" => device.ssd = parse_onboot(value),
            "discard" => device.discard = Some(value.to_string()),
            "serial" => device.serial = Some(value.to_string()),
            "backup" => device.backup = parse_onboot(value),
            "replicate" => device.replicate = parse_onboot(value),
            "media" => device.media = Some(value.to_string()),
            _ => {}
        }
    }
    device
}

/// Inverse of `parse_storage_device`.
pub fn build_storage_device(device: &StorageDevice) -> String {
    let mut parts = Vec::new();
    let first = match &device.pool {
        Some(pool) => format!("{pool}:{}", device.volume),
        None => device.volume.clone(),
    };
    parts.push(first);
    if let Some(size) = &device.size {
        parts.push(format!("size={size}"));
    }
    if let Some(format) = &device.format {
        parts.push(format!("format={format}"));
    }
    if let Some(cache) = &device.cache {
        parts.push(format!("cache={cache}"));
    }
    if device.iothread {
        parts.push("iothread=1".to_string());
    }
    if device.ssd {
        parts.push("ssd=1".to_string());
    }
    if let Some(discard) = &device.discard {
        parts.push(format!("discard={discard}"));
    }
    if let Some(serial) = &device.serial {
        parts.push(format!("serial={serial}"));
    }
    if device.backup {
        parts.push("backup=1".to_string());
    }
    if device.replicate {
        parts.push("replicate=1".to_string());
    }
    if let Some(media) = &device.media {
        parts.push(format!("media={media}"));
    }
    parts.join(",")
}

/// Accepts `bool`, `0/1` int/float, or `"1"`/`"yes"`/`"true"`
/// (case-insensitive) as true. Anything else is false.
pub fn parse_onboot(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Splits a tag string on `,` or `;`, trims, drops empties, dedups, and
/// sorts — so repeated application is idempotent (`spec.md` §8
/// `normalizeTags(normalizeTags(s)) = normalizeTags(s)`).
pub fn normalize_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = raw
        .split([',', ';'])
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

/// Collapses a list of IP addresses to at most one, per `spec.md` §8:
/// prefer the first IPv4; else the first IPv6; else the first of any kind;
/// empty input yields empty output.
pub fn collapse_ips(ips: &[IpAddr]) -> Vec<IpAddr> {
    if let Some(v4) = ips.iter().find(|ip| ip.is_ipv4()) {
        return vec![*v4];
    }
    if let Some(v6) = ips.iter().find(|ip| ip.is_ipv6()) {
        return vec![*v6];
    }
    ips.first().copied().into_iter().collect()
}

/// Drops loopback and `veth*` interfaces, then — if `configured_macs` is
/// non-empty — keeps only interfaces whose MAC is a known configured one
/// (`spec.md` §4.5.1).
pub fn filter_guest_interfaces(
    interfaces: Vec<GuestNetInterface>,
    configured_macs: &std::collections::HashSet<String>,
) -> Vec<GuestNetInterface> {
    interfaces
        .into_iter()
        .filter(|i| i.name != "lo" && !i.name.starts_with("veth"))
        .filter(|i| configured_macs.is_empty() || configured_macs.contains(&i.mac.to_uppercase()))
        .map(|mut i| {
            i.ip_addresses = collapse_ips(&i.ip_addresses);
            i
        })
        .collect()
}

/// Below this a mount is treated as a bind mount, tmpfs remnant, or other
/// non-disk artifact rather than real storage, regardless of reported type
/// or mountpoint (`spec.md` §8 scenario 5: a `TotalBytes=10MB` entry must be
/// dropped even though its type and mountpoint pass both other filters).
const MIN_FILESYSTEM_BYTES: u64 = 100 * 1024 * 1024;

/// Filters guest-agent filesystem reports down to real, sized, top-level
/// mounts: drops pseudo/virtual filesystem types (`squashfs`, `tmpfs`,
/// `proc`, `sysfs`, `devtmpfs`, `overlay`), mountpoints under `/snap`,
/// `/run`, `/proc`, `/sys`, `/dev`, and anything under `MIN_FILESYSTEM_BYTES`
/// (`spec.md` §8 scenario 5).
pub fn filter_guest_filesystems(filesystems: Vec<GuestFilesystem>) -> Vec<GuestFilesystem> {
    const IGNORED_TYPES: &[&str] = &["squashfs", "tmpfs", "proc", "sysfs", "devtmpfs", "overlay"];
    const IGNORED_PREFIXES: &[&str] = &["/snap", "/run", "/proc", "/sys", "/dev"];

    filesystems
        .into_iter()
        .filter(|fs| !IGNORED_TYPES.contains(&fs.fs_type.as_str()))
        .filter(|fs| !IGNORED_PREFIXES.iter().any(|p| fs.mountpoint.starts_with(p)))
        .filter(|fs| fs.total_bytes >= MIN_FILESYSTEM_BYTES)
        .collect()
}

/// The "parsed config" fields a `Vm` carries after enrichment (`spec.md`
/// §3). `parse_config_payload`/`build_config_payload` are exact inverses of
/// each other over these fields, satisfying the round-trip law in §8.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuestConfigFields {
    pub agent_enabled: bool,
    pub configured_networks: Vec<ConfiguredNetwork>,
    pub storage_devices: Vec<StorageDevice>,
    pub cpu_cores: u32,
    pub cpu_sockets: u32,
    pub architecture: Option<String>,
    pub os_type: Option<String>,
    pub description: Option<String>,
    pub on_boot: bool,
    pub boot_order: Option<String>,
}

const STORAGE_PREFIXES: &[&str] = &["scsi", "ide", "virtio", "sata", "efidisk"];

fn is_indexed_key(key: &str, prefix: &str) -> bool {
    key.starts_with(prefix) && key[prefix.len()..].chars().all(|c| c.is_ascii_digit())
}

/// Extracts `GuestConfigFields` out of a raw `/config` response map. Grounds
/// the enrichment pipeline's own config parsing (`client.rs::parse_guest_config`)
/// in one place so the round-trip law has a single implementation to hold.
pub fn parse_config_payload(config: &serde_json::Value, kind: VmType) -> GuestConfigFields {
    let Some(map) = config.as_object() else {
        return GuestConfigFields::default();
    };

    let mut fields = GuestConfigFields {
        cpu_cores: map.get("cores").and_then(|v| v.as_u64()).unwrap_or(1) as u32,
        cpu_sockets: map.get("sockets").and_then(|v| v.as_u64()).unwrap_or(1) as u32,
        architecture: map.get("arch").and_then(|v| v.as_str()).map(str::to_string),
        os_type: map.get("ostype").and_then(|v| v.as_str()).map(str::to_string),
        description: map.get("description").and_then(|v| v.as_str()).map(str::to_string),
        boot_order: map.get("boot").and_then(|v| v.as_str()).map(str::to_string),
        agent_enabled: map
            .get("agent")
            .and_then(|v| v.as_str())
            .map(|s| s.split(',').next().map(parse_onboot).unwrap_or(false))
            .unwrap_or(false),
        on_boot: map
            .get("onboot")
            .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_i64().map(|n| n.to_string())))
            .map(|s| parse_onboot(&s))
            .unwrap_or(false),
        ..Default::default()
    };

    for (key, value) in map {
        let Some(raw) = value.as_str() else { continue };
        if is_indexed_key(key, "net") {
            fields.configured_networks.push(match kind {
                VmType::Qemu => parse_qemu_net_config(key, raw),
                VmType::Lxc => parse_lxc_net_config(key, raw),
            });
        } else if STORAGE_PREFIXES.iter().any(|p| is_indexed_key(key, p)) {
            fields.storage_devices.push(parse_storage_device(key, raw));
        }
    }

    fields
}

/// Inverse of `parse_config_payload`: serializes `fields` back into the
/// `{key: configString}` shape PVE's `/config` endpoint accepts on write
/// (`spec.md` §8 `parseVMConfig(buildConfigPayload(cfg)) ≡ cfg`).
pub fn build_config_payload(kind: VmType, fields: &GuestConfigFields) -> serde_json::Value {
    let mut map = serde_json::Map::new();

    for net in &fields.configured_networks {
        let raw = match kind {
            VmType::Qemu => build_qemu_net_config(net),
            VmType::Lxc => build_lxc_net_config(net),
        };
        map.insert(net.interface.clone(), serde_json::Value::String(raw));
    }
    for device in &fields.storage_devices {
        map.insert(device.interface.clone(), serde_json::Value::String(build_storage_device(device)));
    }

    map.insert("cores".to_string(), serde_json::Value::from(fields.cpu_cores));
    map.insert("sockets".to_string(), serde_json::Value::from(fields.cpu_sockets));
    if let Some(arch) = &fields.architecture {
        map.insert("arch".to_string(), serde_json::Value::String(arch.clone()));
    }
    if let Some(os_type) = &fields.os_type {
        map.insert("ostype".to_string(), serde_json::Value::String(os_type.clone()));
    }
    if let Some(description) = &fields.description {
        map.insert("description".to_string(), serde_json::Value::String(description.clone()));
    }
    if let Some(boot_order) = &fields.boot_order {
        map.insert("boot".to_string(), serde_json::Value::String(boot_order.clone()));
    }
    map.insert(
        "onboot".to_string(),
        serde_json::Value::String(if fields.on_boot { "1" } else { "0" }.to_string()),
    );
    map.insert(
        "agent".to_string(),
        serde_json::Value::String(if fields.agent_enabled { "1" } else { "0" }.to_string()),
    );

    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::net::Ipv6Addr;

    #[test]
    fn qemu_net_parses_model_mac_form() {
        let net = parse_qemu_net_config(
            "net0",
            "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0,tag=100,rate=10,firewall=1",
        );
        assert_eq!(net.model.as_deref(), Some("virtio"));
        assert_eq!(net.mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(net.bridge.as_deref(), Some("vmbr0"));
        assert_eq!(net.tag, Some(100));
        assert_eq!(net.rate, Some(10.0));
        assert!(net.firewall);
    }

    #[test]
    fn qemu_net_parses_bare_mac_form() {
        let net = parse_qemu_net_config("net0", "aa:bb:cc:dd:ee:ff,bridge=vmbr1");
        assert_eq!(net.mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(net.bridge.as_deref(), Some("vmbr1"));
    }

    #[test]
    fn lxc_net_parses_hwaddr() {
        let net = parse_lxc_net_config("net0", "name=eth0,hwaddr=AA:BB:CC:DD:EE:FF,bridge=vmbr0");
        assert_eq!(net.mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(net.bridge.as_deref(), Some("vmbr0"));
    }

    #[test]
    fn storage_device_parses_pool_volume_form() {
        let dev = parse_storage_device(
            "scsi0",
            "local-lvm:vm-100-disk-0,size=32G,format=raw,ssd=1,backup=1",
        );
        assert_eq!(dev.pool.as_deref(), Some("local-lvm"));
        assert_eq!(dev.volume, "vm-100-disk-0");
        assert_eq!(dev.size.as_deref(), Some("32G"));
        assert!(dev.ssd);
        assert!(dev.backup);
    }

    #[test]
    fn storage_device_parses_dev_path_form() {
        let dev = parse_storage_device("virtio0", "/dev/sdb,size=1T");
        assert_eq!(dev.pool, None);
        assert_eq!(dev.volume, "/dev/sdb");
    }

    #[test]
    fn onboot_accepts_known_true_forms() {
        for v in ["1", "true", "TRUE", "Yes", "yes"] {
            assert!(parse_onboot(v), "{v} should be true");
        }
        for v in ["0", "false", "no", "", "2"] {
            assert!(!parse_onboot(v), "{v} should be false");
        }
    }

    #[test]
    fn normalize_tags_is_idempotent_and_splits_both_separators() {
        let once = normalize_tags("prod; web,db ,, prod");
        let twice = normalize_tags(&once.join(","));
        assert_eq!(once, vec!["db", "prod", "web"]);
        assert_eq!(once, twice);
    }

    #[test]
    fn collapse_ips_prefers_ipv4_then_ipv6_then_any() {
        let v4 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let v6 = IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
        assert_eq!(collapse_ips(&[v6, v4]), vec![v4]);
        assert_eq!(collapse_ips(&[v6]), vec![v6]);
        assert_eq!(collapse_ips(&[]), Vec::<IpAddr>::new());
    }

    #[test]
    fn filter_guest_interfaces_drops_loopback_and_veth_and_unknown_macs() {
        let mut configured = HashSet::new();
        configured.insert("AA:BB:CC:DD:EE:FF".to_string());
        let interfaces = vec![
            GuestNetInterface {
                name: "lo".into(),
                mac: "00:00:00:00:00:00".into(),
                ip_addresses: vec![],
            },
            GuestNetInterface {
                name: "veth123".into(),
                mac: "11:22:33:44:55:66".into(),
                ip_addresses: vec![],
            },
            GuestNetInterface {
                name: "eth0".into(),
                mac: "AA:BB:CC:DD:EE:FF".into(),
                ip_addresses: vec![],
            },
            GuestNetInterface {
                name: "eth1".into(),
                mac: "99:88:77:66:55:44".into(),
                ip_addresses: vec![],
            },
        ];
        let filtered = filter_guest_interfaces(interfaces, &configured);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "eth0");
    }

    #[test]
    fn filter_guest_filesystems_keeps_only_real_mounts() {
        // Mirrors `spec.md` §8 scenario 5 literally: a fourth, unlisted
        // mountpoint reporting exactly 10MB survives both the type and
        // prefix filters but must still be dropped by the size floor.
        let filesystems = vec![
            GuestFilesystem {
                mountpoint: "/".into(),
                fs_type: "ext4".into(),
                total_bytes: 50 * 1024 * 1024 * 1024,
                used_bytes: 10 * 1024 * 1024 * 1024,
            },
            GuestFilesystem {
                mountpoint: "/snap/core".into(),
                fs_type: "squashfs".into(),
                total_bytes: 10,
                used_bytes: 10,
            },
            GuestFilesystem {
                mountpoint: "/run/lock".into(),
                fs_type: "tmpfs".into(),
                total_bytes: 10,
                used_bytes: 0,
            },
            GuestFilesystem {
                mountpoint: "/data".into(),
                fs_type: "ext4".into(),
                total_bytes: 10 * 1024 * 1024,
                used_bytes: 0,
            },
        ];
        let filtered = filter_guest_filesystems(filesystems);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].mountpoint, "/");
    }

    #[test]
    fn qemu_net_config_round_trips() {
        let net = parse_qemu_net_config("net0", "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0,tag=100,rate=10,firewall=1");
        let rebuilt = parse_qemu_net_config("net0", &build_qemu_net_config(&net));
        assert_eq!(net, rebuilt);
    }

    #[test]
    fn lxc_net_config_round_trips() {
        let net = parse_lxc_net_config("net0", "name=eth0,hwaddr=AA:BB:CC:DD:EE:FF,bridge=vmbr0,tag=5");
        let rebuilt = parse_lxc_net_config("net0", &build_lxc_net_config(&net));
        assert_eq!(net, rebuilt);
    }

    #[test]
    fn storage_device_round_trips() {
        let dev = parse_storage_device("scsi0", "local-lvm:vm-100-disk-0,size=32G,format=raw,ssd=1,backup=1");
        let rebuilt = parse_storage_device("scsi0", &build_storage_device(&dev));
        assert_eq!(dev, rebuilt);
    }

    #[test]
    fn config_payload_round_trips_for_qemu() {
        let fields = GuestConfigFields {
            agent_enabled: true,
            configured_networks: vec![parse_qemu_net_config("net0", "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0,tag=10")],
            storage_devices: vec![parse_storage_device("scsi0", "local-lvm:vm-100-disk-0,size=32G,ssd=1")],
            cpu_cores: 4,
            cpu_sockets: 2,
            architecture: Some("x86_64".to_string()),
            os_type: Some("l26".to_string()),
            description: Some("managed by pve".to_string()),
            on_boot: true,
            boot_order: Some("order=scsi0;net0".to_string()),
        };

        let payload = build_config_payload(VmType::Qemu, &fields);
        let rebuilt = parse_config_payload(&payload, VmType::Qemu);
        assert_eq!(fields, rebuilt);
    }

    #[test]
    fn filter_guest_filesystems_drops_entries_below_the_size_floor() {
        let filesystems = vec![GuestFilesystem {
            mountpoint: "/data".into(),
            fs_type: "ext4".into(),
            total_bytes: MIN_FILESYSTEM_BYTES - 1,
            used_bytes: 0,
        }];
        assert!(filter_guest_filesystems(filesystems).is_empty());
    }
}
