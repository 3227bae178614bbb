//! Declarative resource specs as supplied by the user.
//!
//! All wire types use lowerCamelCase field names. Optional sections are
//! plain `Option`s so an omitted block and an empty block behave the
//! same way on the provider side.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The three resource kinds this system manages.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    #[default]
    Key,
    Network,
    Vm,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Key, ResourceKind::Network, ResourceKind::Vm];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Key => "key",
            ResourceKind::Network => "network",
            ResourceKind::Vm => "vm",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SSH key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    #[default]
    Ed25519,
    Ecdsa,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Rsa => "rsa",
            KeyType::Ed25519 => "ed25519",
            KeyType::Ecdsa => "ecdsa",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeySpec {
    #[serde(rename = "type")]
    pub key_type: KeyType,
    /// RSA only. Defaults to 4096 when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bits: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
}

fn default_network_kind() -> String {
    "nat".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSpec {
    /// Provider-specific network kind, e.g. `bridge`, `nat`, `isolated`.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<DhcpSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tftp: Option<TftpSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Spec>,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            kind: default_network_kind(),
            cidr: None,
            gateway: None,
            mtu: None,
            dhcp: None,
            dns: None,
            tftp: None,
            ipv6: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DhcpSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_end: Option<String>,
    /// Lease time, e.g. `1h`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_time: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub static_leases: Vec<StaticLease>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,
    /// PXE next-server address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_server: Option<String>,
}

impl Default for DhcpSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            range_start: None,
            range_end: None,
            lease_time: None,
            static_leases: Vec::new(),
            dns_servers: Vec::new(),
            next_server: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticLease {
    pub mac: String,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsSpec {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub forwarders: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<DnsHost>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsHost {
    pub ip: String,
    pub hostnames: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TftpSpec {
    pub root: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub efi_boot_file: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Ipv6Spec {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmSpec {
    /// Defaults to 2048 MB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// Defaults to 2.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u32>,
    /// Defaults to `x86_64`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuSpec>,
    pub disk: DiskSpec,
    /// Name of the network this VM attaches to. May be a template
    /// reference resolved by the orchestrator before dispatch.
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInitSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot: Option<BootSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console: Option<ConsoleSpec>,
    /// e.g. `hugepages`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_backing: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub virtio_fs: Vec<VirtioFsSpec>,
    #[serde(default)]
    pub guest_agent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ReadinessSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sockets: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskSpec {
    /// Path to the backing image on the host.
    pub base_image: String,
    /// Logical size, e.g. `20G`. Defaults to `20G`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudInitSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub write_files: Vec<WriteFileSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub run_commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_config: Option<NetworkConfigSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSpec {
    pub name: String,
    /// sudoers entry, e.g. `ALL=(ALL) NOPASSWD:ALL`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sudo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteFileSpec {
    pub path: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Netplan-shaped guest network configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfigSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub ethernets: BTreeMap<String, EthernetSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EthernetSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhcp4: Option<bool>,
    /// Static addresses in CIDR notation.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway4: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BootSpec {
    /// Boot device order, entries from `disk`, `cdrom`, `network`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,
    /// `bios` (default) or `uefi`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(default)]
    pub secure_boot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nvram_template_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsoleSpec {
    #[serde(default = "default_true")]
    pub serial: bool,
    #[serde(default)]
    pub vnc: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
}

impl Default for ConsoleSpec {
    fn default() -> Self {
        Self {
            serial: true,
            vnc: false,
            vnc_port: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtioFsSpec {
    pub source: String,
    pub tag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadinessSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshReadinessSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpReadinessSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInitReadinessSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SshReadinessSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to 180 seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Path to the private key to authenticate with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl Default for SshReadinessSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: None,
            user: None,
            private_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpReadinessSpec {
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudInitReadinessSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for CloudInitReadinessSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_spec_defaults() {
        let spec: KeySpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.key_type, KeyType::Ed25519);
        assert_eq!(spec.bits, None);
    }

    #[test]
    fn vm_spec_round_trip() {
        let json = serde_json::json!({
            "memoryMb": 4096,
            "vcpus": 4,
            "disk": {"baseImage": "/images/jammy.qcow2", "size": "40G"},
            "network": "pxe-net",
            "cloudInit": {
                "hostname": "node-0",
                "users": [{
                    "name": "ubuntu",
                    "sudo": "ALL=(ALL) NOPASSWD:ALL",
                    "sshAuthorizedKeys": ["ssh-ed25519 AAAA test"]
                }]
            },
            "boot": {"order": ["network", "disk"], "firmware": "uefi"},
            "readiness": {"ssh": {"enabled": true, "timeoutSecs": 120, "user": "ubuntu"}}
        });
        let spec: VmSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.memory_mb, Some(4096));
        assert_eq!(spec.network, "pxe-net");
        assert_eq!(spec.boot.as_ref().unwrap().order, vec!["network", "disk"]);

        let back: VmSpec =
            serde_json::from_value(serde_json::to_value(&spec).unwrap()).unwrap();
        assert_eq!(spec, back);
    }

    #[test]
    fn network_spec_defaults_to_nat_with_dhcp_enabled() {
        let spec: NetworkSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.kind, "nat");
        let dhcp: DhcpSpec = serde_json::from_str("{}").unwrap();
        assert!(dhcp.enabled);
    }
}
