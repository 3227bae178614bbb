//! Provider capability advertisement.
//!
//! The first request on every provider channel is `provider_capabilities`;
//! the manager routes resources only to providers that advertise the
//! `(kind, operation)` pair.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::spec::ResourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Get,
    List,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Create,
        Operation::Get,
        Operation::List,
        Operation::Delete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Get => "get",
            Operation::List => "list",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceCapability {
    pub kind: ResourceKind,
    pub operations: Vec<Operation>,
    /// For `kind == network`: the network kinds this provider can build.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network_kinds: Vec<String>,
    /// For `kind == key`: supported algorithms.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub key_types: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vm_features: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderCapabilities {
    pub provider_name: String,
    pub version: String,
    pub resources: Vec<ResourceCapability>,
}

impl ProviderCapabilities {
    pub fn supports(&self, kind: ResourceKind, op: Operation) -> bool {
        self.resources
            .iter()
            .any(|r| r.kind == kind && r.operations.contains(&op))
    }

    pub fn supports_network_kind(&self, network_kind: &str) -> bool {
        self.resources.iter().any(|r| {
            r.kind == ResourceKind::Network
                && (r.network_kinds.is_empty()
                    || r.network_kinds.iter().any(|k| k == network_kind))
        })
    }

    pub fn supports_key_type(&self, key_type: &str) -> bool {
        self.resources.iter().any(|r| {
            r.kind == ResourceKind::Key
                && (r.key_types.is_empty() || r.key_types.iter().any(|t| t == key_type))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> ProviderCapabilities {
        ProviderCapabilities {
            provider_name: "vm".into(),
            version: "0.1.0".into(),
            resources: vec![
                ResourceCapability {
                    kind: ResourceKind::Key,
                    operations: Operation::ALL.to_vec(),
                    key_types: vec!["rsa".into(), "ed25519".into(), "ecdsa".into()],
                    ..Default::default()
                },
                ResourceCapability {
                    kind: ResourceKind::Network,
                    operations: vec![Operation::Create, Operation::Delete],
                    network_kinds: vec!["nat".into(), "bridge".into(), "isolated".into()],
                    ..Default::default()
                },
            ],
        }
    }

    #[test]
    fn supports_kind_operation() {
        let caps = caps();
        assert!(caps.supports(ResourceKind::Key, Operation::List));
        assert!(caps.supports(ResourceKind::Network, Operation::Create));
        assert!(!caps.supports(ResourceKind::Network, Operation::Get));
        assert!(!caps.supports(ResourceKind::Vm, Operation::Create));
    }

    #[test]
    fn supports_network_kind_and_key_type() {
        let caps = caps();
        assert!(caps.supports_network_kind("bridge"));
        assert!(!caps.supports_network_kind("dnsmasq"));
        assert!(caps.supports_key_type("ed25519"));
    }

    #[test]
    fn capabilities_round_trip() {
        let caps = caps();
        let back: ProviderCapabilities =
            serde_json::from_str(&serde_json::to_string(&caps).unwrap()).unwrap();
        assert_eq!(caps, back);
    }
}
