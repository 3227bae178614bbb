//! Cloud-init media: user-data, meta-data and network-config documents.
//!
//! The three documents land in a staging directory and are assembled
//! into an ISO (volume id `cidata`) by the host tools.

use std::collections::BTreeMap;

use serde::Serialize;

use testenv_proto::spec::{CloudInitSpec, NetworkConfigSpec, UserSpec};
use testenv_proto::ProviderError;

/// Touched by the final run-command; the cloud-init readiness probe
/// checks for it.
pub const BOOT_FINISHED_MARKER: &str = "/var/lib/cloud/instance/testenv-boot-finished";

const DEFAULT_NETWORK_CONFIG: &str = "version: 2
ethernets:
  all-en:
    match:
      name: \"en*\"
    dhcp4: true
  all-eth:
    match:
      name: \"eth*\"
    dhcp4: true
";

#[derive(Debug, Clone, PartialEq)]
pub struct CloudInitDocs {
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
}

#[derive(Serialize)]
struct UserDataDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    users: Vec<UserEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    packages: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    write_files: Vec<WriteFileEntry>,
    runcmd: Vec<String>,
}

#[derive(Serialize)]
struct UserEntry {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sudo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shell: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_authorized_keys: Vec<String>,
}

#[derive(Serialize)]
struct WriteFileEntry {
    path: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    permissions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
}

#[derive(Serialize)]
struct NetplanDoc {
    version: u32,
    ethernets: BTreeMap<String, NetplanEthernet>,
}

#[derive(Serialize)]
struct NetplanEthernet {
    #[serde(skip_serializing_if = "Option::is_none")]
    dhcp4: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nameservers: Option<NetplanNameservers>,
}

#[derive(Serialize)]
struct NetplanNameservers {
    addresses: Vec<String>,
}

fn default_user() -> UserEntry {
    UserEntry {
        name: "ubuntu".to_string(),
        sudo: Some("ALL=(ALL) NOPASSWD:ALL".to_string()),
        shell: Some("/bin/bash".to_string()),
        ssh_authorized_keys: Vec::new(),
    }
}

fn user_entry(user: &UserSpec) -> UserEntry {
    UserEntry {
        name: user.name.clone(),
        sudo: user.sudo.clone(),
        shell: user.shell.clone(),
        ssh_authorized_keys: user
            .ssh_authorized_keys
            .iter()
            .map(|k| k.trim().to_string())
            .collect(),
    }
}

/// Build the three documents for one VM.
pub fn build_docs(
    vm_name: &str,
    instance_id: &str,
    spec: Option<&CloudInitSpec>,
) -> Result<CloudInitDocs, ProviderError> {
    let hostname = spec
        .and_then(|c| c.hostname.clone())
        .unwrap_or_else(|| vm_name.to_string());

    let users = match spec {
        Some(cloud_init) if !cloud_init.users.is_empty() => {
            cloud_init.users.iter().map(user_entry).collect()
        }
        _ => vec![default_user()],
    };

    let mut runcmd: Vec<String> = spec
        .map(|c| c.run_commands.clone())
        .unwrap_or_default();
    // The boot-finished marker is always last.
    runcmd.push(format!("touch {BOOT_FINISHED_MARKER}"));

    let doc = UserDataDoc {
        hostname: Some(hostname.clone()),
        users,
        packages: spec.map(|c| c.packages.clone()).unwrap_or_default(),
        write_files: spec
            .map(|c| {
                c.write_files
                    .iter()
                    .map(|f| WriteFileEntry {
                        path: f.path.clone(),
                        content: f.content.clone(),
                        permissions: f.permissions.clone(),
                        owner: f.owner.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        runcmd,
    };
    let body = serde_yaml::to_string(&doc)
        .map_err(|e| ProviderError::provider(format!("user-data serialization failed: {e}")))?;
    let user_data = format!("#cloud-config\n{body}");

    let meta_data = format!("instance-id: {instance_id}\nlocal-hostname: {hostname}\n");

    let network_config = match spec.and_then(|c| c.network_config.as_ref()) {
        Some(config) => netplan(config)?,
        None => DEFAULT_NETWORK_CONFIG.to_string(),
    };

    Ok(CloudInitDocs {
        user_data,
        meta_data,
        network_config,
    })
}

fn netplan(config: &NetworkConfigSpec) -> Result<String, ProviderError> {
    let ethernets = config
        .ethernets
        .iter()
        .map(|(name, eth)| {
            (
                name.clone(),
                NetplanEthernet {
                    dhcp4: eth.dhcp4,
                    addresses: eth.addresses.clone(),
                    gateway4: eth.gateway4.clone(),
                    nameservers: (!eth.nameservers.is_empty()).then(|| NetplanNameservers {
                        addresses: eth.nameservers.clone(),
                    }),
                },
            )
        })
        .collect();
    let doc = NetplanDoc {
        version: config.version.unwrap_or(2),
        ethernets,
    };
    serde_yaml::to_string(&doc)
        .map_err(|e| ProviderError::provider(format!("network-config serialization failed: {e}")))
}

/// Last-resort IP source: the first static address of the custom
/// netplan, with the prefix stripped.
pub fn static_address(spec: Option<&CloudInitSpec>) -> Option<String> {
    spec.and_then(|c| c.network_config.as_ref())
        .and_then(|config| {
            config
                .ethernets
                .values()
                .flat_map(|eth| eth.addresses.first())
                .next()
        })
        .map(|address| address.split('/').next().unwrap_or(address).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use testenv_proto::spec::EthernetSpec;

    #[test]
    fn user_data_starts_with_cloud_config_header() {
        let docs = build_docs("v", "i-123", None).unwrap();
        assert!(docs.user_data.starts_with("#cloud-config\n"));
    }

    #[test]
    fn default_user_is_ubuntu_with_nopasswd_sudo() {
        let docs = build_docs("v", "i-123", None).unwrap();
        assert!(docs.user_data.contains("name: ubuntu"));
        assert!(docs.user_data.contains("ALL=(ALL) NOPASSWD:ALL"));
        assert!(docs.user_data.contains("shell: /bin/bash"));
    }

    #[test]
    fn listed_users_are_emitted_with_keys() {
        let spec = CloudInitSpec {
            users: vec![UserSpec {
                name: "ci".into(),
                sudo: Some("ALL=(ALL) NOPASSWD:ALL".into()),
                shell: Some("/bin/sh".into()),
                ssh_authorized_keys: vec!["ssh-ed25519 AAAA ci@host ".into()],
            }],
            ..Default::default()
        };
        let docs = build_docs("v", "i-123", Some(&spec)).unwrap();
        assert!(docs.user_data.contains("name: ci"));
        assert!(docs.user_data.contains("ssh-ed25519 AAAA ci@host"));
        assert!(!docs.user_data.contains("name: ubuntu"));
    }

    #[test]
    fn boot_finished_marker_is_always_the_last_runcmd() {
        let spec = CloudInitSpec {
            run_commands: vec!["systemctl enable foo".into()],
            ..Default::default()
        };
        let docs = build_docs("v", "i-123", Some(&spec)).unwrap();
        let marker_pos = docs.user_data.find(BOOT_FINISHED_MARKER).unwrap();
        let cmd_pos = docs.user_data.find("systemctl enable foo").unwrap();
        assert!(marker_pos > cmd_pos);
    }

    #[test]
    fn meta_data_carries_instance_id_and_hostname() {
        let spec = CloudInitSpec {
            hostname: Some("node-0".into()),
            ..Default::default()
        };
        let docs = build_docs("v", "i-abc", Some(&spec)).unwrap();
        assert_eq!(
            docs.meta_data,
            "instance-id: i-abc\nlocal-hostname: node-0\n"
        );
    }

    #[test]
    fn default_network_config_enables_dhcp_on_en_and_eth() {
        let docs = build_docs("v", "i", None).unwrap();
        assert!(docs.network_config.contains("en*"));
        assert!(docs.network_config.contains("eth*"));
        assert!(docs.network_config.contains("dhcp4: true"));
    }

    #[test]
    fn custom_netplan_is_rendered_and_static_address_extracted() {
        let mut ethernets = BTreeMap::new();
        ethernets.insert(
            "eth0".to_string(),
            EthernetSpec {
                dhcp4: Some(false),
                addresses: vec!["192.168.100.50/24".into()],
                gateway4: Some("192.168.100.1".into()),
                nameservers: vec!["1.1.1.1".into()],
            },
        );
        let spec = CloudInitSpec {
            network_config: Some(NetworkConfigSpec {
                version: None,
                ethernets,
            }),
            ..Default::default()
        };
        let docs = build_docs("v", "i", Some(&spec)).unwrap();
        assert!(docs.network_config.contains("eth0"));
        assert!(docs.network_config.contains("192.168.100.50/24"));
        assert!(docs.network_config.contains("gateway4: 192.168.100.1"));

        assert_eq!(
            static_address(Some(&spec)).as_deref(),
            Some("192.168.100.50")
        );
        assert_eq!(static_address(None), None);
    }
}
