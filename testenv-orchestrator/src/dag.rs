//! Dependency graph construction and phase partitioning.
//!
//! One node per `(kind, name)`. Edges come from template references and
//! from the VM `network` field. The output is an ordered list of
//! phases; every node's predecessors live in strictly earlier phases.
//! The builder performs no I/O.

use std::collections::HashMap;
use std::fmt;

use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;

use testenv_proto::spec::ResourceKind;
use testenv_proto::ProviderError;

use crate::envspec::EnvSpec;
use crate::template;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl NodeRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Phased execution plan. Nodes within one phase are independent.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub phases: Vec<Vec<NodeRef>>,
}

impl Plan {
    /// Flattened topological order.
    pub fn topological(&self) -> Vec<NodeRef> {
        self.phases.iter().flatten().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }
}

/// Build the plan for a spec. Duplicate names, unknown references and
/// cycles are all `INVALID_SPEC`.
pub fn build(spec: &EnvSpec) -> Result<Plan, ProviderError> {
    let nodes: Vec<NodeRef> = spec
        .names()
        .into_iter()
        .map(|(kind, name)| NodeRef::new(kind, name))
        .collect();

    let mut index: HashMap<(ResourceKind, &str), usize> = HashMap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        if node.name.is_empty() {
            return Err(ProviderError::invalid_spec(format!(
                "{} resource with empty name",
                node.kind
            )));
        }
        if index.insert((node.kind, node.name.as_str()), i).is_some() {
            return Err(ProviderError::invalid_spec(format!(
                "duplicate resource {node}"
            )));
        }
    }

    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for i in 0..nodes.len() {
        graph.add_node(i);
    }

    for (i, node) in nodes.iter().enumerate() {
        let raw = spec
            .spec_value(node.kind, &node.name)
            .ok_or_else(|| ProviderError::provider(format!("lost spec for {node}")))?;
        for reference in template::scan_value(&raw) {
            let dep = *index
                .get(&(reference.kind, reference.name.as_str()))
                .ok_or_else(|| {
                    ProviderError::invalid_spec(format!(
                        "{node} references unknown resource {}/{}",
                        reference.kind, reference.name
                    ))
                })?;
            graph.add_edge(dep, i, ());
        }
    }

    // Implicit edge: a VM depends on its network even when the field is
    // a plain name rather than a template reference.
    for vm in &spec.vms {
        let network = vm.spec.network.as_str();
        if network.is_empty() || !template::scan_str(network).is_empty() {
            continue;
        }
        let this = index[&(ResourceKind::Vm, vm.name.as_str())];
        let dep = *index
            .get(&(ResourceKind::Network, network))
            .ok_or_else(|| {
                ProviderError::invalid_spec(format!(
                    "vm/{} references unknown network {network}",
                    vm.name
                ))
            })?;
        graph.add_edge(dep, this, ());
    }

    partition(&nodes, &graph)
}

/// Kahn's algorithm, emitting each in-degree-zero generation as one
/// phase.
fn partition(nodes: &[NodeRef], graph: &DiGraphMap<usize, ()>) -> Result<Plan, ProviderError> {
    let mut indegree: Vec<usize> = (0..nodes.len())
        .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
        .collect();
    let mut remaining: Vec<bool> = vec![true; nodes.len()];
    let mut left = nodes.len();
    let mut phases = Vec::new();

    while left > 0 {
        let ready: Vec<usize> = (0..nodes.len())
            .filter(|&i| remaining[i] && indegree[i] == 0)
            .collect();
        if ready.is_empty() {
            let cycle: Vec<String> = (0..nodes.len())
                .filter(|&i| remaining[i])
                .map(|i| nodes[i].to_string())
                .collect();
            return Err(ProviderError::invalid_spec(format!(
                "dependency cycle involving {}",
                cycle.join(", ")
            )));
        }
        for &i in &ready {
            remaining[i] = false;
            left -= 1;
            for successor in graph.neighbors_directed(i, Direction::Outgoing) {
                indegree[successor] = indegree[successor].saturating_sub(1);
            }
        }
        phases.push(ready.into_iter().map(|i| nodes[i].clone()).collect());
    }

    Ok(Plan { phases })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use testenv_proto::ErrorCode;

    fn spec(value: serde_json::Value) -> EnvSpec {
        EnvSpec::from_value(&value).unwrap()
    }

    fn phase_names(plan: &Plan) -> Vec<Vec<String>> {
        plan.phases
            .iter()
            .map(|p| p.iter().map(|n| n.to_string()).collect())
            .collect()
    }

    #[test]
    fn independent_resources_share_one_phase() {
        let plan = build(&spec(json!({
            "keys": [
                {"name": "k1", "spec": {"type": "ed25519"}},
                {"name": "k2", "spec": {"type": "rsa", "bits": 2048}}
            ]
        })))
        .unwrap();
        assert_eq!(phase_names(&plan), vec![vec!["key/k1", "key/k2"]]);
    }

    #[test]
    fn chain_produces_ordered_phases() {
        let plan = build(&spec(json!({
            "keys": [{"name": "vm-ssh", "spec": {"type": "ed25519"}}],
            "networks": [{"name": "n", "spec": {"kind": "bridge", "cidr": "192.168.100.0/24"}}],
            "vms": [{"name": "v", "spec": {
                "disk": {"baseImage": "/images/base.qcow2"},
                "network": "{{.Networks.n.Name}}",
                "cloudInit": {"users": [{
                    "name": "ubuntu",
                    "sshAuthorizedKeys": ["{{.Keys.vm-ssh.PublicKey}}"]
                }]}
            }}]
        })))
        .unwrap();
        assert_eq!(
            phase_names(&plan),
            vec![vec!["key/vm-ssh", "network/n"], vec!["vm/v"]]
        );
    }

    #[test]
    fn plain_network_name_adds_implicit_edge() {
        let plan = build(&spec(json!({
            "networks": [{"name": "n", "spec": {"kind": "nat"}}],
            "vms": [{"name": "v", "spec": {
                "disk": {"baseImage": "/images/base.qcow2"},
                "network": "n"
            }}]
        })))
        .unwrap();
        assert_eq!(phase_names(&plan), vec![vec!["network/n"], vec!["vm/v"]]);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let err = build(&spec(json!({
            "keys": [
                {"name": "k", "spec": {}},
                {"name": "k", "spec": {}}
            ]
        })))
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSpec);
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let err = build(&spec(json!({
            "vms": [{"name": "v", "spec": {
                "disk": {"baseImage": "/images/base.qcow2"},
                "network": "{{.Networks.ghost.Name}}"
            }}]
        })))
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSpec);
        assert!(err.message.contains("ghost"));
    }

    #[test]
    fn unknown_plain_network_is_rejected() {
        let err = build(&spec(json!({
            "vms": [{"name": "v", "spec": {
                "disk": {"baseImage": "/images/base.qcow2"},
                "network": "ghost"
            }}]
        })))
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSpec);
    }

    #[test]
    fn cycle_is_rejected() {
        let err = build(&spec(json!({
            "networks": [{"name": "n", "spec": {"kind": "nat"}}],
            "vms": [
                {"name": "a", "spec": {
                    "disk": {"baseImage": "/i.qcow2"},
                    "network": "n",
                    "cloudInit": {"hostname": "{{.VMs.b.Name}}"}
                }},
                {"name": "b", "spec": {
                    "disk": {"baseImage": "/i.qcow2"},
                    "network": "n",
                    "cloudInit": {"hostname": "{{.VMs.a.Name}}"}
                }}
            ]
        })))
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSpec);
        assert!(err.message.contains("cycle"));
    }

    #[test]
    fn every_predecessor_lands_in_an_earlier_phase() {
        let env = spec(json!({
            "keys": [{"name": "k", "spec": {}}],
            "networks": [
                {"name": "n1", "spec": {"kind": "nat"}},
                {"name": "n2", "spec": {"kind": "isolated"}}
            ],
            "vms": [
                {"name": "a", "spec": {"disk": {"baseImage": "/i"}, "network": "n1"}},
                {"name": "b", "spec": {
                    "disk": {"baseImage": "/i"},
                    "network": "n2",
                    "cloudInit": {"hostname": "{{.VMs.a.Name}}"}
                }}
            ]
        }));
        let plan = build(&env).unwrap();

        let mut phase_of: HashMap<String, usize> = HashMap::new();
        for (i, phase) in plan.phases.iter().enumerate() {
            for node in phase {
                phase_of.insert(node.to_string(), i);
            }
        }
        assert!(phase_of["vm/a"] > phase_of["network/n1"]);
        assert!(phase_of["vm/b"] > phase_of["vm/a"]);
        assert_eq!(plan.node_count(), 5);
    }
}
