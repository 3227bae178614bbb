//! The user-supplied environment spec: named keys, networks, and VMs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use testenv_proto::spec::{KeySpec, NetworkSpec, ResourceKind, VmSpec};
use testenv_proto::ProviderError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedSpec<S> {
    pub name: String,
    pub spec: S,
}

/// One test environment: every resource the user asked for, by kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvSpec {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<NamedSpec<KeySpec>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<NamedSpec<NetworkSpec>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vms: Vec<NamedSpec<VmSpec>>,
}

impl EnvSpec {
    pub fn from_value(value: &Value) -> Result<Self, ProviderError> {
        serde_json::from_value(value.clone())
            .map_err(|e| ProviderError::invalid_spec(format!("malformed environment spec: {e}")))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.networks.is_empty() && self.vms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len() + self.networks.len() + self.vms.len()
    }

    /// All `(kind, name)` pairs in declaration order: keys, then
    /// networks, then VMs.
    pub fn names(&self) -> Vec<(ResourceKind, &str)> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.keys.iter().map(|k| (ResourceKind::Key, k.name.as_str())));
        out.extend(
            self.networks
                .iter()
                .map(|n| (ResourceKind::Network, n.name.as_str())),
        );
        out.extend(self.vms.iter().map(|v| (ResourceKind::Vm, v.name.as_str())));
        out
    }

    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        match kind {
            ResourceKind::Key => self.keys.iter().any(|k| k.name == name),
            ResourceKind::Network => self.networks.iter().any(|n| n.name == name),
            ResourceKind::Vm => self.vms.iter().any(|v| v.name == name),
        }
    }

    /// The raw spec of one resource as a JSON value, ready for template
    /// scanning or rendering.
    pub fn spec_value(&self, kind: ResourceKind, name: &str) -> Option<Value> {
        let value = match kind {
            ResourceKind::Key => self
                .keys
                .iter()
                .find(|k| k.name == name)
                .map(|k| serde_json::to_value(&k.spec)),
            ResourceKind::Network => self
                .networks
                .iter()
                .find(|n| n.name == name)
                .map(|n| serde_json::to_value(&n.spec)),
            ResourceKind::Vm => self
                .vms
                .iter()
                .find(|v| v.name == name)
                .map(|v| serde_json::to_value(&v.spec)),
        };
        value.and_then(|v| v.ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_minimal_spec() {
        let value = json!({
            "keys": [{"name": "k1", "spec": {"type": "ed25519"}}],
            "networks": [{"name": "n", "spec": {"kind": "bridge", "cidr": "192.168.100.0/24"}}],
            "vms": [{"name": "v", "spec": {
                "disk": {"baseImage": "/images/base.qcow2"},
                "network": "n"
            }}]
        });
        let spec = EnvSpec::from_value(&value).unwrap();
        assert_eq!(spec.len(), 3);
        assert!(spec.contains(ResourceKind::Key, "k1"));
        assert!(spec.contains(ResourceKind::Vm, "v"));
        assert!(!spec.contains(ResourceKind::Network, "missing"));

        let names = spec.names();
        assert_eq!(names[0], (ResourceKind::Key, "k1"));
        assert_eq!(names[2], (ResourceKind::Vm, "v"));
    }

    #[test]
    fn malformed_spec_is_invalid() {
        let err = EnvSpec::from_value(&json!({"keys": [{"spec": {}}]})).unwrap_err();
        assert_eq!(err.code, testenv_proto::ErrorCode::InvalidSpec);
    }

    #[test]
    fn spec_value_preserves_templates() {
        let value = json!({
            "vms": [{"name": "v", "spec": {
                "disk": {"baseImage": "/images/base.qcow2"},
                "network": "{{ .Networks.n.Name }}"
            }}]
        });
        let spec = EnvSpec::from_value(&value).unwrap();
        let vm = spec.spec_value(ResourceKind::Vm, "v").unwrap();
        assert_eq!(vm["network"], "{{ .Networks.n.Name }}");
    }
}
