//! In-memory provider: full protocol semantics, no hypervisor.
//!
//! Produces deterministic fake states so orchestrator behavior (phasing,
//! template rendering, rollback, busy checks) can be tested without a
//! host. Fault injection lets tests force any tool to fail, either
//! permanently or for the first N calls.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use ipnet::Ipv4Net;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use testenv_proto::capabilities::{Operation, ProviderCapabilities, ResourceCapability};
use testenv_proto::spec::{KeySpec, KeyType, NetworkSpec, ResourceKind, VmSpec};
use testenv_proto::state::{
    KeyState, NetworkState, ResourceStatus, VmProviderState, VmState,
};
use testenv_proto::{OperationResult, Provider, ProviderError, RequestContext};

#[derive(Debug, Clone)]
enum Fault {
    /// Fail every call to the tool.
    Always(ProviderError),
    /// Fail the first N calls, then succeed.
    Times(ProviderError, u32),
}

#[derive(Default)]
pub struct MemProvider {
    keys: RwLock<HashMap<String, KeyState>>,
    networks: RwLock<HashMap<String, NetworkState>>,
    vms: RwLock<HashMap<String, VmState>>,
    faults: RwLock<HashMap<String, Fault>>,
    ip_counter: AtomicU32,
}

impl MemProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `tool` (e.g. `vm_create`) fail every call.
    pub async fn fail_tool(&self, tool: &str, error: ProviderError) {
        self.faults
            .write()
            .await
            .insert(tool.to_string(), Fault::Always(error));
    }

    /// Make `tool` fail its first `times` calls with a retryable error,
    /// then succeed.
    pub async fn fail_tool_times(&self, tool: &str, error: ProviderError, times: u32) {
        self.faults
            .write()
            .await
            .insert(tool.to_string(), Fault::Times(error, times));
    }

    async fn injected_fault(&self, tool: &str) -> Option<ProviderError> {
        let mut faults = self.faults.write().await;
        match faults.get_mut(tool) {
            Some(Fault::Always(error)) => Some(error.clone()),
            Some(Fault::Times(error, times)) => {
                if *times == 0 {
                    faults.remove(tool);
                    None
                } else {
                    *times -= 1;
                    Some(error.clone())
                }
            }
            None => None,
        }
    }

    fn fake_public_key(name: &str, key_type: KeyType, comment: Option<&str>) -> String {
        let alg = match key_type {
            KeyType::Rsa => "ssh-rsa",
            KeyType::Ed25519 => "ssh-ed25519",
            KeyType::Ecdsa => "ecdsa-sha2-nistp256",
        };
        // Deterministic blob so repeated creates compare equal.
        let blob: String = name
            .bytes()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        let comment = comment.unwrap_or("testenv");
        format!("{alg} AAAA{blob} {comment}")
    }

    fn fake_fingerprint(public_key: &str) -> String {
        let sum: u64 = public_key.bytes().map(u64::from).sum();
        format!("SHA256:mem{sum:016x}")
    }

    async fn network_in_use_by(&self, name: &str) -> Option<String> {
        let vms = self.vms.read().await;
        vms.values()
            .find(|vm| vm.provider_state_typed().network.as_deref() == Some(name))
            .map(|vm| vm.name.clone())
    }

    async fn key_in_use_by(&self, name: &str) -> Option<String> {
        let vms = self.vms.read().await;
        vms.values()
            .find(|vm| vm.provider_state_typed().keys.iter().any(|k| k == name))
            .map(|vm| vm.name.clone())
    }
}

#[async_trait]
impl Provider for MemProvider {
    async fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            provider_name: "mem".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            resources: vec![
                ResourceCapability {
                    kind: ResourceKind::Key,
                    operations: Operation::ALL.to_vec(),
                    key_types: vec!["rsa".into(), "ed25519".into(), "ecdsa".into()],
                    ..Default::default()
                },
                ResourceCapability {
                    kind: ResourceKind::Network,
                    operations: Operation::ALL.to_vec(),
                    network_kinds: vec![
                        "nat".into(),
                        "bridge".into(),
                        "isolated".into(),
                        "dnsmasq".into(),
                        "libvirt".into(),
                    ],
                    ..Default::default()
                },
                ResourceCapability {
                    kind: ResourceKind::Vm,
                    operations: Operation::ALL.to_vec(),
                    ..Default::default()
                },
            ],
        }
    }

    async fn key_create(
        &self,
        _ctx: &RequestContext,
        name: &str,
        spec: KeySpec,
    ) -> OperationResult {
        if let Some(err) = self.injected_fault("key_create").await {
            return OperationResult::err(err);
        }
        debug!(key = %name, "creating in-memory key");
        let public_key = Self::fake_public_key(name, spec.key_type, spec.comment.as_deref());
        let state = KeyState {
            name: name.to_string(),
            key_type: spec.key_type,
            status: ResourceStatus::Ready,
            fingerprint: Self::fake_fingerprint(&public_key),
            public_key,
            public_key_path: format!("mem://keys/{name}.pub"),
            private_key_path: format!("mem://keys/{name}"),
            created_at: Some(Utc::now()),
            provider_state: Default::default(),
        };
        // Stale state with the same name is simply replaced.
        self.keys
            .write()
            .await
            .insert(name.to_string(), state.clone());
        OperationResult::ok(&state)
    }

    async fn key_get(&self, _ctx: &RequestContext, name: &str) -> OperationResult {
        if let Some(err) = self.injected_fault("key_get").await {
            return OperationResult::err(err);
        }
        match self.keys.read().await.get(name) {
            Some(state) => OperationResult::ok(state),
            None => OperationResult::err(ProviderError::not_found(format!("key {name} not found"))),
        }
    }

    async fn key_list(&self, _ctx: &RequestContext) -> OperationResult {
        let keys = self.keys.read().await;
        let mut all: Vec<&KeyState> = keys.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        OperationResult::ok(&all)
    }

    async fn key_delete(&self, _ctx: &RequestContext, name: &str) -> OperationResult {
        if let Some(err) = self.injected_fault("key_delete").await {
            return OperationResult::err(err);
        }
        if let Some(vm) = self.key_in_use_by(name).await {
            return OperationResult::err(ProviderError::resource_busy(format!(
                "key {name} is embedded in vm {vm}"
            )));
        }
        self.keys.write().await.remove(name);
        OperationResult::ok_empty()
    }

    async fn network_create(
        &self,
        _ctx: &RequestContext,
        name: &str,
        spec: NetworkSpec,
    ) -> OperationResult {
        if let Some(err) = self.injected_fault("network_create").await {
            return OperationResult::err(err);
        }
        debug!(network = %name, kind = %spec.kind, "creating in-memory network");
        let gateway = spec
            .cidr
            .as_deref()
            .and_then(|cidr| cidr.parse::<Ipv4Net>().ok())
            .map(|net| Ipv4Addr::from(u32::from(net.network()) + 1).to_string());
        let state = NetworkState {
            name: name.to_string(),
            kind: spec.kind.clone(),
            status: ResourceStatus::Active,
            ip: gateway.or_else(|| Some("10.77.0.1".to_string())),
            cidr: spec.cidr.clone(),
            interface_name: Some(format!("tvm-{}", name.chars().take(11).collect::<String>())),
            uuid: Some(Uuid::new_v4().to_string()),
            provider_state: Default::default(),
        };
        self.networks
            .write()
            .await
            .insert(name.to_string(), state.clone());
        OperationResult::ok(&state)
    }

    async fn network_get(&self, _ctx: &RequestContext, name: &str) -> OperationResult {
        match self.networks.read().await.get(name) {
            Some(state) => OperationResult::ok(state),
            None => OperationResult::err(ProviderError::not_found(format!(
                "network {name} not found"
            ))),
        }
    }

    async fn network_list(&self, _ctx: &RequestContext) -> OperationResult {
        let networks = self.networks.read().await;
        let mut all: Vec<&NetworkState> = networks.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        OperationResult::ok(&all)
    }

    async fn network_delete(&self, _ctx: &RequestContext, name: &str) -> OperationResult {
        if let Some(err) = self.injected_fault("network_delete").await {
            return OperationResult::err(err);
        }
        if let Some(vm) = self.network_in_use_by(name).await {
            return OperationResult::err(ProviderError::resource_busy(format!(
                "network {name} is attached to vm {vm}"
            )));
        }
        self.networks.write().await.remove(name);
        OperationResult::ok_empty()
    }

    async fn vm_create(&self, _ctx: &RequestContext, name: &str, spec: VmSpec) -> OperationResult {
        if let Some(err) = self.injected_fault("vm_create").await {
            return OperationResult::err(err);
        }
        let networks = self.networks.read().await;
        let Some(network) = networks.get(&spec.network) else {
            return OperationResult::err(ProviderError::not_found(format!(
                "network {} not found",
                spec.network
            )));
        };

        // Record every key whose public material is embedded in
        // cloud-init, powering the busy check on key deletion.
        let keys = self.keys.read().await;
        let mut matched: Vec<String> = Vec::new();
        if let Some(cloud_init) = &spec.cloud_init {
            for user in &cloud_init.users {
                for authorized in &user.ssh_authorized_keys {
                    let authorized = authorized.trim();
                    if let Some(key) = keys
                        .values()
                        .find(|k| k.public_key.trim() == authorized)
                    {
                        if !matched.contains(&key.name) {
                            matched.push(key.name.clone());
                        }
                    }
                }
            }
        }

        let host = 10 + self.ip_counter.fetch_add(1, Ordering::Relaxed);
        let ip = network
            .cidr
            .as_deref()
            .and_then(|cidr| cidr.parse::<Ipv4Net>().ok())
            .map(|net| Ipv4Addr::from(u32::from(net.network()) + host).to_string())
            .unwrap_or_else(|| format!("10.77.0.{host}"));

        let provider_state = VmProviderState {
            disk_path: Some(format!("mem://disks/{name}.qcow2")),
            cloud_init_iso: Some(format!("mem://cloudinit/{name}.iso")),
            network: Some(network.name.clone()),
            keys: matched,
        };
        let state = VmState {
            name: name.to_string(),
            status: ResourceStatus::Running,
            ip: Some(ip),
            mac: Some(format!("52:54:00:00:00:{:02x}", host & 0xff)),
            uuid: Some(Uuid::new_v4().to_string()),
            ssh_command: None,
            vnc_address: None,
            serial_device: Some("pty".to_string()),
            created_at: Some(Utc::now()),
            provider_state: provider_state.to_map(),
        };
        drop(keys);
        drop(networks);
        self.vms
            .write()
            .await
            .insert(name.to_string(), state.clone());
        OperationResult::ok(&state)
    }

    async fn vm_get(&self, _ctx: &RequestContext, name: &str) -> OperationResult {
        match self.vms.read().await.get(name) {
            Some(state) => OperationResult::ok(state),
            None => OperationResult::err(ProviderError::not_found(format!("vm {name} not found"))),
        }
    }

    async fn vm_list(&self, _ctx: &RequestContext) -> OperationResult {
        let vms = self.vms.read().await;
        let mut all: Vec<&VmState> = vms.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        OperationResult::ok(&all)
    }

    async fn vm_delete(&self, _ctx: &RequestContext, name: &str) -> OperationResult {
        if let Some(err) = self.injected_fault("vm_delete").await {
            return OperationResult::err(err);
        }
        self.vms.write().await.remove(name);
        OperationResult::ok_empty()
    }
}
