//! Observed resource state returned by providers after creation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::spec::KeyType;

/// Resource lifecycle status. Keys report `ready`, networks `active`,
/// VMs `running`/`stopped`; the remaining variants are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    #[default]
    Creating,
    Ready,
    Active,
    Running,
    Stopped,
    Failed,
    Destroyed,
}

impl ResourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceStatus::Creating => "creating",
            ResourceStatus::Ready => "ready",
            ResourceStatus::Active => "active",
            ResourceStatus::Running => "running",
            ResourceStatus::Stopped => "stopped",
            ResourceStatus::Failed => "failed",
            ResourceStatus::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyState {
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: KeyType,
    pub status: ResourceStatus,
    /// Public key in authorized-keys format.
    pub public_key: String,
    pub public_key_path: String,
    pub private_key_path: String,
    /// `SHA256:` fingerprint of the public key.
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub provider_state: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkState {
    pub name: String,
    pub kind: String,
    pub status: ResourceStatus,
    /// Gateway address of the network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub provider_state: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmState {
    pub name: String,
    pub status: ResourceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnc_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub provider_state: Map<String, Value>,
}

/// The well-known shape of a VM's opaque provider state. Providers
/// record the resources the VM holds references to; the busy checks on
/// key and network deletion read it back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmProviderState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_init_iso: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
}

impl VmProviderState {
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn from_map(map: &Map<String, Value>) -> Self {
        serde_json::from_value(Value::Object(map.clone())).unwrap_or_default()
    }
}

impl VmState {
    pub fn provider_state_typed(&self) -> VmProviderState {
        VmProviderState::from_map(&self.provider_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_state_round_trip_with_provider_state() {
        let ps = VmProviderState {
            disk_path: Some("/state/disks/v.qcow2".into()),
            cloud_init_iso: Some("/state/cloudinit/v.iso".into()),
            network: Some("n".into()),
            keys: vec!["vm-ssh".into()],
        };
        let state = VmState {
            name: "v".into(),
            status: ResourceStatus::Running,
            ip: Some("192.168.100.37".into()),
            mac: Some("52:54:00:aa:bb:cc".into()),
            uuid: Some("d94c9e33-15be-4d8e-9e4e-000000000001".into()),
            ssh_command: Some("ssh -i /state/keys/vm-ssh ubuntu@192.168.100.37".into()),
            provider_state: ps.to_map(),
            ..Default::default()
        };

        let json = serde_json::to_string(&state).unwrap();
        let back: VmState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
        assert_eq!(back.provider_state_typed().keys, vec!["vm-ssh"]);
        assert_eq!(back.provider_state_typed().network.as_deref(), Some("n"));
    }

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&ResourceStatus::Active).unwrap(),
            "\"active\""
        );
        assert_eq!(
            serde_json::to_string(&ResourceStatus::Running).unwrap(),
            "\"running\""
        );
    }

    #[test]
    fn key_state_round_trip() {
        let state = KeyState {
            name: "k1".into(),
            key_type: KeyType::Ed25519,
            status: ResourceStatus::Ready,
            public_key: "ssh-ed25519 AAAAC3Nz k1@testenv".into(),
            public_key_path: "/state/keys/k1.pub".into(),
            private_key_path: "/state/keys/k1".into(),
            fingerprint: "SHA256:abcdef".into(),
            created_at: Some(Utc::now()),
            provider_state: Map::new(),
        };
        let back: KeyState =
            serde_json::from_str(&serde_json::to_string(&state).unwrap()).unwrap();
        assert_eq!(state, back);
    }
}
