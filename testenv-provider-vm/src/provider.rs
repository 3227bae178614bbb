//! The hypervisor-backed `Provider` implementation.
//!
//! Three guarded maps (keys, networks, VMs) back the existence and
//! busy checks; creation and deletion are serialized by the
//! per-subprocess request queue, gets and lists run concurrently.
//! Every create tolerates stale provider-side state with the same name
//! by destroying it first.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use testenv_proto::capabilities::{Operation, ProviderCapabilities, ResourceCapability};
use testenv_proto::spec::{KeySpec, NetworkSpec, ResourceKind, SshReadinessSpec, VmSpec};
use testenv_proto::state::{
    KeyState, NetworkState, ResourceStatus, VmProviderState, VmState,
};
use testenv_proto::{OperationResult, Provider, ProviderError, RequestContext};

use crate::cloudinit;
use crate::domain;
use crate::host::{HostTools, SystemTools};
use crate::hypervisor::{Hypervisor, Virsh};
use crate::keys::KeyManager;
use crate::network;
use crate::readiness;

pub struct VmProvider {
    state_dir: PathBuf,
    hv: Arc<dyn Hypervisor>,
    tools: Arc<dyn HostTools>,
    key_manager: KeyManager,
    keys: RwLock<HashMap<String, KeyState>>,
    networks: RwLock<HashMap<String, NetworkState>>,
    vms: RwLock<HashMap<String, VmState>>,
}

/// Cleanup actions for a partially created VM, run in reverse order.
enum UndoStep {
    RemoveFile(PathBuf),
    RemoveDir(PathBuf),
    DestroyDomain(String),
    UndefineDomain(String),
}

struct UndoStack {
    hv: Arc<dyn Hypervisor>,
    steps: Vec<UndoStep>,
}

impl UndoStack {
    fn new(hv: Arc<dyn Hypervisor>) -> Self {
        Self {
            hv,
            steps: Vec::new(),
        }
    }

    fn push(&mut self, step: UndoStep) {
        self.steps.push(step);
    }

    async fn run(&mut self) {
        for step in self.steps.drain(..).rev() {
            match step {
                UndoStep::RemoveFile(path) => {
                    let _ = tokio::fs::remove_file(&path).await;
                }
                UndoStep::RemoveDir(path) => {
                    let _ = tokio::fs::remove_dir_all(&path).await;
                }
                UndoStep::DestroyDomain(name) => {
                    if let Err(e) = self.hv.destroy_domain(&name).await {
                        debug!(domain = %name, error = %e, "undo destroy failed");
                    }
                }
                UndoStep::UndefineDomain(name) => {
                    if let Err(e) = self.hv.undefine_domain(&name).await {
                        debug!(domain = %name, error = %e, "undo undefine failed");
                    }
                }
            }
        }
    }
}

impl VmProvider {
    /// Production wiring: `virsh` and the real host utilities.
    pub fn new(state_dir: PathBuf, connect_uri: Option<String>) -> Self {
        Self::with_backends(state_dir, Arc::new(Virsh::new(connect_uri)), Arc::new(SystemTools))
    }

    pub fn with_backends(
        state_dir: PathBuf,
        hv: Arc<dyn Hypervisor>,
        tools: Arc<dyn HostTools>,
    ) -> Self {
        let key_manager = KeyManager::new(&state_dir, Arc::clone(&tools));
        Self {
            state_dir,
            hv,
            tools,
            key_manager,
            keys: RwLock::new(HashMap::new()),
            networks: RwLock::new(HashMap::new()),
            vms: RwLock::new(HashMap::new()),
        }
    }

    fn disk_path(&self, name: &str) -> PathBuf {
        self.state_dir.join("disks").join(format!("{name}.qcow2"))
    }

    fn cloudinit_iso_path(&self, name: &str) -> PathBuf {
        self.state_dir.join("cloudinit").join(format!("{name}.iso"))
    }

    fn cloudinit_staging_dir(&self, name: &str) -> PathBuf {
        self.state_dir.join("cloudinit").join(name)
    }

    async fn key_in_use_by(&self, name: &str) -> Option<String> {
        let vms = self.vms.read().await;
        vms.values()
            .find(|vm| vm.provider_state_typed().keys.iter().any(|k| k == name))
            .map(|vm| vm.name.clone())
    }

    async fn network_in_use_by(&self, name: &str) -> Option<String> {
        let vms = self.vms.read().await;
        vms.values()
            .find(|vm| vm.provider_state_typed().network.as_deref() == Some(name))
            .map(|vm| vm.name.clone())
    }

    /// Names of recorded keys whose public material appears in the VM's
    /// authorized keys.
    async fn match_keys(&self, spec: &VmSpec) -> Vec<String> {
        let keys = self.keys.read().await;
        let mut matched = Vec::new();
        if let Some(cloud_init) = &spec.cloud_init {
            for user in &cloud_init.users {
                for authorized in &user.ssh_authorized_keys {
                    let authorized = authorized.trim();
                    if let Some(key) = keys.values().find(|k| k.public_key.trim() == authorized)
                    {
                        if !matched.contains(&key.name) {
                            matched.push(key.name.clone());
                        }
                    }
                }
            }
        }
        matched
    }

    async fn create_network_inner(
        &self,
        name: &str,
        spec: &NetworkSpec,
    ) -> Result<NetworkState, ProviderError> {
        let plan = network::plan(name, spec)?;

        // Idempotency: a leftover network with the same name is torn
        // down before defining the new one.
        if self.hv.network_exists(name).await.unwrap_or(false) {
            warn!(network = %name, "stale network found, destroying");
            let _ = self.hv.destroy_network(name).await;
            let _ = self.hv.undefine_network(name).await;
        }

        let xml = network::network_xml(&plan, spec);
        self.hv
            .define_network(&xml)
            .await
            .map_err(|e| ProviderError::provider(format!("network {name} define failed: {e:#}")))?;

        if let Err(e) = self.hv.start_network(name).await {
            let _ = self.hv.undefine_network(name).await;
            return Err(
                ProviderError::provider(format!("network {name} failed to start: {e:#}"))
                    .with_retryable(true),
            );
        }

        let uuid = self.hv.network_uuid(name).await.ok().flatten();
        let state = NetworkState {
            name: name.to_string(),
            kind: plan.kind.clone(),
            status: ResourceStatus::Active,
            ip: plan.gateway.map(|gw| gw.to_string()),
            cidr: spec.cidr.clone(),
            interface_name: Some(plan.bridge.clone()),
            uuid,
            provider_state: Default::default(),
        };
        info!(network = %name, bridge = %plan.bridge, "network active");
        self.networks
            .write()
            .await
            .insert(name.to_string(), state.clone());
        Ok(state)
    }

    async fn create_vm_inner(
        &self,
        ctx: &RequestContext,
        name: &str,
        spec: &VmSpec,
    ) -> Result<VmState, ProviderError> {
        let network_name = spec.network.clone();
        if network_name.is_empty() {
            return Err(ProviderError::invalid_spec(format!(
                "vm {name}: network reference is empty"
            )));
        }
        if !self.networks.read().await.contains_key(&network_name) {
            return Err(ProviderError::not_found(format!(
                "network {network_name} not found"
            )));
        }

        let mut undo = UndoStack::new(Arc::clone(&self.hv));

        // 1. COW disk overlay.
        let base_image = PathBuf::from(&spec.disk.base_image);
        if !tokio::fs::try_exists(&base_image).await.unwrap_or(false) {
            return Err(ProviderError::provider(format!(
                "vm {name}: base image {} does not exist",
                base_image.display()
            )));
        }
        let disk_path = self.disk_path(name);
        if let Some(parent) = disk_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::provider(format!("failed to create disk dir: {e}")))?;
        }
        let size = spec.disk.size.clone().unwrap_or_else(|| "20G".to_string());
        if let Err(e) = self.tools.create_cow_disk(&disk_path, &base_image, &size).await {
            return Err(ProviderError::provider(format!(
                "vm {name}: disk creation failed: {e:#}"
            )));
        }
        undo.push(UndoStep::RemoveFile(disk_path.clone()));

        // 2. Cloud-init media.
        let matched_keys = self.match_keys(spec).await;
        let instance_id = format!("iid-{}", Uuid::new_v4());
        let docs = cloudinit::build_docs(name, &instance_id, spec.cloud_init.as_ref())?;
        let staging = self.cloudinit_staging_dir(name);
        if let Err(e) = tokio::fs::create_dir_all(&staging).await {
            undo.run().await;
            return Err(ProviderError::provider(format!(
                "failed to create cloud-init staging dir: {e}"
            )));
        }
        undo.push(UndoStep::RemoveDir(staging.clone()));
        let files = [
            (staging.join("user-data"), &docs.user_data),
            (staging.join("meta-data"), &docs.meta_data),
            (staging.join("network-config"), &docs.network_config),
        ];
        for (path, content) in &files {
            if let Err(e) = tokio::fs::write(path, content.as_bytes()).await {
                undo.run().await;
                return Err(ProviderError::provider(format!(
                    "failed to write {}: {e}",
                    path.display()
                )));
            }
        }
        let iso_path = self.cloudinit_iso_path(name);
        let file_paths: Vec<PathBuf> = files.iter().map(|(path, _)| path.clone()).collect();
        if let Err(e) = self.tools.make_cloudinit_iso(&iso_path, &file_paths).await {
            undo.run().await;
            return Err(ProviderError::provider(format!(
                "vm {name}: cloud-init iso failed: {e:#}"
            )));
        }
        undo.push(UndoStep::RemoveFile(iso_path.clone()));

        // 3. Idempotency: destroy any orphan domain with this name.
        if self.hv.domain_exists(name).await.unwrap_or(false) {
            warn!(vm = %name, "stale domain found, destroying");
            let _ = self.hv.destroy_domain(name).await;
            let _ = self.hv.undefine_domain(name).await;
        }

        // 4. Define and start.
        let plan = domain::build_plan(name, spec, &network_name, disk_path.clone(), iso_path.clone());
        let xml = domain::domain_xml(&plan, spec);
        if let Err(e) = self.hv.define_domain(&xml).await {
            undo.run().await;
            return Err(ProviderError::provider(format!(
                "vm {name}: define failed: {e:#}"
            )));
        }
        undo.push(UndoStep::UndefineDomain(name.to_string()));
        if let Err(e) = self.hv.start_domain(name).await {
            undo.run().await;
            return Err(ProviderError::provider(format!(
                "vm {name}: start failed: {e:#}"
            )));
        }
        undo.push(UndoStep::DestroyDomain(name.to_string()));

        let mac = self
            .hv
            .domain_xml(name)
            .await
            .ok()
            .and_then(|xml| domain::extract_mac(&xml))
            .unwrap_or_else(|| plan.mac.clone());
        let uuid = self
            .hv
            .domain_uuid(name)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| plan.uuid.clone());

        // 5. Readiness.
        let ssh_spec: Option<SshReadinessSpec> = spec
            .readiness
            .as_ref()
            .and_then(|r| r.ssh.clone())
            .filter(|s| s.enabled);
        let strict = ssh_spec.is_some();
        let ip_budget = match &ssh_spec {
            Some(ssh) => Duration::from_secs(
                ssh.timeout_secs
                    .unwrap_or(readiness::DEFAULT_SSH_TIMEOUT.as_secs()),
            ),
            None => readiness::BEST_EFFORT_IP_TIMEOUT,
        };
        let boot_window = Duration::from_secs(60).min(ip_budget / 2);
        let progressed = readiness::wait_for_boot(self.hv.as_ref(), name, boot_window, &ctx.cancel)
            .await
            .unwrap_or(false);
        if !progressed {
            if strict {
                undo.run().await;
                return Err(ProviderError::provider(format!(
                    "vm {name}: no boot progress within {}s",
                    boot_window.as_secs()
                ))
                .with_retryable(true));
            }
            debug!(vm = %name, "no boot progress observed, continuing best-effort");
        }

        let static_fallback = cloudinit::static_address(spec.cloud_init.as_ref());
        let ip = readiness::resolve_ip(
            self.hv.as_ref(),
            &network_name,
            name,
            &mac,
            ip_budget,
            static_fallback,
            &ctx.cancel,
        )
        .await
        .unwrap_or(None);
        if ip.is_none() && strict {
            undo.run().await;
            return Err(ProviderError::timeout(format!(
                "vm {name}: no address for {mac} on {network_name} within {}s",
                ip_budget.as_secs()
            )));
        }

        let default_user = spec
            .cloud_init
            .as_ref()
            .and_then(|c| c.users.first())
            .map(|u| u.name.clone())
            .unwrap_or_else(|| "ubuntu".to_string());
        let matched_key_path = {
            let keys = self.keys.read().await;
            matched_keys
                .first()
                .and_then(|key| keys.get(key))
                .map(|key| PathBuf::from(&key.private_key_path))
        };

        if let (Some(ssh), Some(ip)) = (&ssh_spec, &ip) {
            let user = ssh.user.clone().unwrap_or_else(|| default_user.clone());
            let key = ssh
                .private_key
                .as_ref()
                .map(PathBuf::from)
                .or_else(|| matched_key_path.clone());
            let Some(key) = key else {
                undo.run().await;
                return Err(ProviderError::invalid_spec(format!(
                    "vm {name}: ssh readiness requested but no private key is available"
                )));
            };
            let budget = Duration::from_secs(
                ssh.timeout_secs
                    .unwrap_or(readiness::DEFAULT_SSH_TIMEOUT.as_secs()),
            );
            if let Err(e) = readiness::wait_for_ssh(ip, &user, &key, budget, &ctx.cancel).await {
                undo.run().await;
                return Err(e);
            }
        }

        if let (Some(tcp), Some(ip)) = (
            spec.readiness.as_ref().and_then(|r| r.tcp.as_ref()),
            &ip,
        ) {
            let budget = Duration::from_secs(tcp.timeout_secs.unwrap_or(60));
            if let Err(e) =
                readiness::wait_for_tcp(ip, tcp.port, budget, &ctx.cancel).await
            {
                undo.run().await;
                return Err(e);
            }
        }

        if let Some(cloud_init_readiness) = spec
            .readiness
            .as_ref()
            .and_then(|r| r.cloud_init.as_ref())
            .filter(|c| c.enabled)
        {
            let user = ssh_spec
                .as_ref()
                .and_then(|s| s.user.clone())
                .unwrap_or_else(|| default_user.clone());
            let key = ssh_spec
                .as_ref()
                .and_then(|s| s.private_key.as_ref().map(PathBuf::from))
                .or_else(|| matched_key_path.clone());
            match (&ip, key) {
                (Some(ip), Some(key)) => {
                    let budget = Duration::from_secs(
                        cloud_init_readiness
                            .timeout_secs
                            .unwrap_or(readiness::DEFAULT_CLOUD_INIT_TIMEOUT.as_secs()),
                    );
                    if let Err(e) =
                        readiness::wait_for_cloud_init(ip, &user, &key, budget, &ctx.cancel).await
                    {
                        undo.run().await;
                        return Err(e);
                    }
                }
                _ => warn!(vm = %name, "cloud-init readiness skipped, no address or key"),
            }
        }

        // A cancelled request must not persist its result.
        if ctx.is_cancelled() {
            undo.run().await;
            return Err(ProviderError::provider(format!(
                "vm {name}: request cancelled"
            )));
        }

        let ssh_command = match (&ip, &matched_key_path) {
            (Some(ip), Some(key)) => Some(format!(
                "ssh -o StrictHostKeyChecking=no -i {} {}@{}",
                key.display(),
                ssh_spec
                    .as_ref()
                    .and_then(|s| s.user.clone())
                    .unwrap_or_else(|| default_user.clone()),
                ip
            )),
            _ => None,
        };
        let console = spec.console.clone().unwrap_or_default();
        let vnc_address = console
            .vnc
            .then(|| match console.vnc_port {
                Some(port) => format!("127.0.0.1:{port}"),
                None => "127.0.0.1".to_string(),
            });

        let provider_state = VmProviderState {
            disk_path: Some(disk_path.display().to_string()),
            cloud_init_iso: Some(iso_path.display().to_string()),
            network: Some(network_name),
            keys: matched_keys,
        };
        let state = VmState {
            name: name.to_string(),
            status: ResourceStatus::Running,
            ip,
            mac: Some(mac),
            uuid: Some(uuid),
            ssh_command,
            vnc_address,
            serial_device: console.serial.then(|| "pty".to_string()),
            created_at: Some(Utc::now()),
            provider_state: provider_state.to_map(),
        };
        info!(vm = %name, ip = ?state.ip, "vm running");
        self.vms
            .write()
            .await
            .insert(name.to_string(), state.clone());
        Ok(state)
    }

    async fn delete_vm_inner(&self, name: &str) {
        // Absent resources are already gone; deletion always succeeds.
        if let Err(e) = self.hv.destroy_domain(name).await {
            debug!(vm = %name, error = %e, "destroy skipped");
        }
        if let Err(e) = self.hv.undefine_domain(name).await {
            debug!(vm = %name, error = %e, "undefine skipped");
        }
        let _ = tokio::fs::remove_file(self.disk_path(name)).await;
        let _ = tokio::fs::remove_file(self.cloudinit_iso_path(name)).await;
        let _ = tokio::fs::remove_dir_all(self.cloudinit_staging_dir(name)).await;
        self.vms.write().await.remove(name);
        info!(vm = %name, "vm deleted");
    }

    #[cfg(test)]
    pub(crate) async fn vm_names(&self) -> Vec<String> {
        self.vms.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl Provider for VmProvider {
    async fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            provider_name: "vm".into(),
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
                    network_kinds: vec!["nat".into(), "bridge".into(), "isolated".into()],
                    ..Default::default()
                },
                ResourceCapability {
                    kind: ResourceKind::Vm,
                    operations: Operation::ALL.to_vec(),
                    vm_features: vec![
                        "cloud-init".into(),
                        "pxe".into(),
                        "uefi".into(),
                        "virtiofs".into(),
                    ],
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
        match self.key_manager.create(name, &spec).await {
            Ok(state) => {
                self.keys
                    .write()
                    .await
                    .insert(name.to_string(), state.clone());
                OperationResult::ok(&state)
            }
            Err(e) => OperationResult::err(e),
        }
    }

    async fn key_get(&self, _ctx: &RequestContext, name: &str) -> OperationResult {
        match self.keys.read().await.get(name) {
            Some(state) => OperationResult::ok(state),
            None => OperationResult::err(ProviderError::not_found(format!(
                "key {name} not found"
            ))),
        }
    }

    async fn key_list(&self, _ctx: &RequestContext) -> OperationResult {
        let keys = self.keys.read().await;
        let mut all: Vec<&KeyState> = keys.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        OperationResult::ok(&all)
    }

    async fn key_delete(&self, _ctx: &RequestContext, name: &str) -> OperationResult {
        if let Some(vm) = self.key_in_use_by(name).await {
            return OperationResult::err(ProviderError::resource_busy(format!(
                "key {name} is embedded in vm {vm}"
            )));
        }
        match self.key_manager.delete(name).await {
            Ok(()) => {
                self.keys.write().await.remove(name);
                OperationResult::ok_empty()
            }
            Err(e) => OperationResult::err(e),
        }
    }

    async fn network_create(
        &self,
        _ctx: &RequestContext,
        name: &str,
        spec: NetworkSpec,
    ) -> OperationResult {
        match self.create_network_inner(name, &spec).await {
            Ok(state) => OperationResult::ok(&state),
            Err(e) => OperationResult::err(e),
        }
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
        if let Some(vm) = self.network_in_use_by(name).await {
            return OperationResult::err(ProviderError::resource_busy(format!(
                "network {name} is attached to vm {vm}"
            )));
        }
        if let Err(e) = self.hv.destroy_network(name).await {
            debug!(network = %name, error = %e, "destroy skipped");
        }
        if let Err(e) = self.hv.undefine_network(name).await {
            debug!(network = %name, error = %e, "undefine skipped");
        }
        self.networks.write().await.remove(name);
        info!(network = %name, "network deleted");
        OperationResult::ok_empty()
    }

    async fn vm_create(&self, ctx: &RequestContext, name: &str, spec: VmSpec) -> OperationResult {
        match self.create_vm_inner(ctx, name, &spec).await {
            Ok(state) => OperationResult::ok(&state),
            Err(e) => OperationResult::err(e),
        }
    }

    async fn vm_get(&self, _ctx: &RequestContext, name: &str) -> OperationResult {
        match self.vms.read().await.get(name) {
            Some(state) => OperationResult::ok(state),
            None => OperationResult::err(ProviderError::not_found(format!(
                "vm {name} not found"
            ))),
        }
    }

    async fn vm_list(&self, _ctx: &RequestContext) -> OperationResult {
        let vms = self.vms.read().await;
        let mut all: Vec<&VmState> = vms.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        OperationResult::ok(&all)
    }

    async fn vm_delete(&self, _ctx: &RequestContext, name: &str) -> OperationResult {
        self.delete_vm_inner(name).await;
        OperationResult::ok_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeTools;
    use crate::hypervisor::fake::FakeHypervisor;
    use testenv_proto::spec::{CloudInitSpec, DiskSpec, ReadinessSpec, UserSpec};
    use testenv_proto::ErrorCode;

    struct Fixture {
        _dir: tempfile::TempDir,
        hv: Arc<FakeHypervisor>,
        provider: VmProvider,
        base_image: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base_image = dir.path().join("base.qcow2");
        std::fs::write(&base_image, b"base").unwrap();
        let hv = Arc::new(FakeHypervisor::new());
        let provider = VmProvider::with_backends(
            dir.path().join("state"),
            Arc::clone(&hv) as Arc<dyn Hypervisor>,
            Arc::new(FakeTools),
        );
        Fixture {
            _dir: dir,
            hv,
            provider,
            base_image,
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new()
    }

    fn network_spec() -> NetworkSpec {
        NetworkSpec {
            kind: "bridge".into(),
            cidr: Some("192.168.100.0/24".into()),
            ..Default::default()
        }
    }

    fn vm_spec(fx: &Fixture, authorized_keys: Vec<String>) -> VmSpec {
        VmSpec {
            disk: DiskSpec {
                base_image: fx.base_image.display().to_string(),
                ..Default::default()
            },
            network: "n".into(),
            cloud_init: Some(CloudInitSpec {
                users: vec![UserSpec {
                    name: "ubuntu".into(),
                    ssh_authorized_keys: authorized_keys,
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn network_create_reports_gateway_and_bridge() {
        let fx = fixture();
        let state = fx
            .provider
            .network_create(&ctx(), "n", network_spec())
            .await
            .state::<NetworkState>()
            .unwrap();
        assert_eq!(state.status, ResourceStatus::Active);
        assert_eq!(state.ip.as_deref(), Some("192.168.100.1"));
        assert_eq!(state.cidr.as_deref(), Some("192.168.100.0/24"));
        assert!(state.interface_name.unwrap().starts_with("tv-"));
    }

    #[tokio::test]
    async fn network_start_failure_undefines_and_is_retryable() {
        let fx = fixture();
        fx.hv.state.lock().unwrap().fail_network_start = true;
        let err = fx
            .provider
            .network_create(&ctx(), "n", network_spec())
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProviderError);
        assert!(err.retryable);
        assert!(!fx.hv.state.lock().unwrap().networks.contains_key("n"));
    }

    #[tokio::test]
    async fn vm_create_builds_disk_iso_domain_and_records_references() {
        let fx = fixture();
        fx.hv.auto_lease("192.168.100.37");
        let key = fx
            .provider
            .key_create(&ctx(), "vm-ssh", KeySpec::default())
            .await
            .state::<KeyState>()
            .unwrap();
        fx.provider
            .network_create(&ctx(), "n", network_spec())
            .await
            .into_result()
            .unwrap();

        let state = fx
            .provider
            .vm_create(&ctx(), "v", vm_spec(&fx, vec![key.public_key.clone()]))
            .await
            .state::<VmState>()
            .unwrap();

        assert_eq!(state.status, ResourceStatus::Running);
        assert_eq!(state.ip.as_deref(), Some("192.168.100.37"));
        assert!(state.mac.as_ref().unwrap().starts_with("52:54:00:"));
        let ps = state.provider_state_typed();
        assert_eq!(ps.network.as_deref(), Some("n"));
        assert_eq!(ps.keys, vec!["vm-ssh"]);
        assert!(PathBuf::from(ps.disk_path.unwrap()).exists());
        assert!(PathBuf::from(ps.cloud_init_iso.unwrap()).exists());
        assert!(state.ssh_command.unwrap().contains("ubuntu@192.168.100.37"));
    }

    #[tokio::test]
    async fn vm_create_destroys_stale_domain_first() {
        let fx = fixture();
        fx.hv.auto_lease("192.168.100.40");
        fx.hv.seed_domain("v");
        fx.provider
            .network_create(&ctx(), "n", network_spec())
            .await
            .into_result()
            .unwrap();

        fx.provider
            .vm_create(&ctx(), "v", vm_spec(&fx, vec![]))
            .await
            .into_result()
            .unwrap();

        let log = fx.hv.log();
        let destroy = log.iter().position(|l| l == "destroy v").unwrap();
        let undefine = log.iter().position(|l| l == "undefine v").unwrap();
        let define = log.iter().rposition(|l| l == "define v").unwrap();
        assert!(destroy < define);
        assert!(undefine < define);
    }

    #[tokio::test]
    async fn missing_base_image_fails_with_provider_error_and_no_leftovers() {
        let fx = fixture();
        fx.provider
            .network_create(&ctx(), "n", network_spec())
            .await
            .into_result()
            .unwrap();
        let mut spec = vm_spec(&fx, vec![]);
        spec.disk.base_image = "/nonexistent/image.qcow2".into();

        let err = fx
            .provider
            .vm_create(&ctx(), "v", spec)
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProviderError);
        assert!(fx.provider.vm_names().await.is_empty());
        assert!(fx.hv.state.lock().unwrap().domains.is_empty());
    }

    #[tokio::test]
    async fn strict_ip_timeout_rolls_back_the_domain() {
        let fx = fixture();
        fx.provider
            .network_create(&ctx(), "n", network_spec())
            .await
            .into_result()
            .unwrap();
        let mut spec = vm_spec(&fx, vec![]);
        spec.readiness = Some(ReadinessSpec {
            ssh: Some(SshReadinessSpec {
                enabled: true,
                timeout_secs: Some(1),
                user: Some("ubuntu".into()),
                private_key: Some("/tmp/key".into()),
            }),
            ..Default::default()
        });

        let err = fx
            .provider
            .vm_create(&ctx(), "v", spec)
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
        assert!(err.retryable);
        // Partial state is gone: no domain, no overlay, no iso.
        assert!(fx.hv.state.lock().unwrap().domains.is_empty());
        assert!(fx.provider.vm_names().await.is_empty());
    }

    #[tokio::test]
    async fn vm_missing_network_is_not_found() {
        let fx = fixture();
        let err = fx
            .provider
            .vm_create(&ctx(), "v", vm_spec(&fx, vec![]))
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn busy_checks_guard_key_and_network_deletion() {
        let fx = fixture();
        fx.hv.auto_lease("192.168.100.41");
        let key = fx
            .provider
            .key_create(&ctx(), "k", KeySpec::default())
            .await
            .state::<KeyState>()
            .unwrap();
        fx.provider
            .network_create(&ctx(), "n", network_spec())
            .await
            .into_result()
            .unwrap();
        fx.provider
            .vm_create(&ctx(), "v", vm_spec(&fx, vec![key.public_key]))
            .await
            .into_result()
            .unwrap();

        let err = fx
            .provider
            .key_delete(&ctx(), "k")
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceBusy);
        let err = fx
            .provider
            .network_delete(&ctx(), "n")
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceBusy);

        fx.provider.vm_delete(&ctx(), "v").await.into_result().unwrap();
        fx.provider
            .key_delete(&ctx(), "k")
            .await
            .into_result()
            .unwrap();
        fx.provider
            .network_delete(&ctx(), "n")
            .await
            .into_result()
            .unwrap();
    }

    #[tokio::test]
    async fn vm_delete_is_idempotent_and_removes_artifacts() {
        let fx = fixture();
        fx.hv.auto_lease("192.168.100.42");
        fx.provider
            .network_create(&ctx(), "n", network_spec())
            .await
            .into_result()
            .unwrap();
        let state = fx
            .provider
            .vm_create(&ctx(), "v", vm_spec(&fx, vec![]))
            .await
            .state::<VmState>()
            .unwrap();
        let disk = PathBuf::from(state.provider_state_typed().disk_path.unwrap());
        assert!(disk.exists());

        fx.provider.vm_delete(&ctx(), "v").await.into_result().unwrap();
        assert!(!disk.exists());
        assert!(fx.hv.state.lock().unwrap().domains.is_empty());

        // Deleting again is still a success.
        fx.provider.vm_delete(&ctx(), "v").await.into_result().unwrap();
    }
}
