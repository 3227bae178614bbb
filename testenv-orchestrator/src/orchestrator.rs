//! Orchestrator facade and the outer tool surface.
//!
//! `create` turns a spec into a running environment and returns an
//! artifact summarizing what was built; `delete` tears an environment
//! down from persisted state. Both are exposed to the host test-runner
//! as tools on stdin/stdout.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use testenv_proto::channel::{require_object, require_str};
use testenv_proto::provider::{Provider, RequestContext};
use testenv_proto::spec::ResourceKind;
use testenv_proto::state::{KeyState, NetworkState, VmState};
use testenv_proto::{ProviderError, ToolHandler};

use crate::config::Config;
use crate::dag;
use crate::envspec::EnvSpec;
use crate::executor::{aggregate_failures, Executor};
use crate::manager::ProviderManager;
use crate::store::{ManifestEntry, StateStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub test_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmp_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub spec: EnvSpec,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub test_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagedResources {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<KeyState>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<NetworkState>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vms: Vec<VmState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEnvArtifact {
    pub test_id: String,
    /// Artifact files on the host, keyed by role.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub managed_resources: ManagedResources,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

pub struct Orchestrator {
    config: Config,
    store: Arc<StateStore>,
    local_providers: Vec<(String, Arc<dyn Provider>)>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(StateStore::new(config.state_dir.clone()));
        Self {
            config,
            store,
            local_providers: Vec::new(),
        }
    }

    /// Bind an in-process provider in addition to the configured
    /// subprocesses. Subprocesses keep routing priority.
    pub fn with_local_provider(
        mut self,
        name: impl Into<String>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        self.local_providers.push((name.into(), provider));
        self
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    async fn start_manager(&self) -> Result<Arc<ProviderManager>, ProviderError> {
        let mut manager = ProviderManager::new();
        for provider in &self.config.providers {
            manager.spawn(provider).await?;
        }
        for (name, provider) in &self.local_providers {
            manager.register_local(name, Arc::clone(provider)).await?;
        }
        if manager.is_empty() {
            return Err(ProviderError::provider("no providers configured"));
        }
        Ok(Arc::new(manager))
    }

    fn executor(&self, manager: Arc<ProviderManager>) -> Executor {
        Executor::new(
            manager,
            Arc::clone(&self.store),
            self.config.retry.clone(),
            self.config.per_provider_limit,
            self.config.cleanup_on_failure,
        )
    }

    /// Create the environment described by the request.
    pub async fn create(&self, request: CreateRequest) -> Result<TestEnvArtifact, ProviderError> {
        info!(test_id = %request.test_id, resources = request.spec.len(), "creating environment");

        // Validation happens before any state is written. A corrupt
        // manifest reads as absent, so only a healthy environment
        // blocks re-creation.
        let plan = dag::build(&request.spec)?;
        if self.store.load(&request.test_id).await?.is_some() {
            return Err(ProviderError::already_exists(format!(
                "environment {} already exists",
                request.test_id
            )));
        }

        let manager = self.start_manager().await?;
        let executor = self.executor(Arc::clone(&manager));

        let outcome = async {
            self.store
                .init_env(&request.test_id, &request.metadata)
                .await?;
            executor
                .create_all(
                    &request.test_id,
                    &request.spec,
                    &plan,
                    CancellationToken::new(),
                )
                .await
        }
        .await;

        manager.shutdown(self.config.shutdown_grace).await;
        let entries = outcome?;

        info!(test_id = %request.test_id, resources = entries.len(), "environment ready");
        Ok(self.artifact(request, &entries))
    }

    fn artifact(&self, request: CreateRequest, entries: &[ManifestEntry]) -> TestEnvArtifact {
        let mut resources = ManagedResources::default();
        let mut files = BTreeMap::new();
        files.insert(
            "manifest".to_string(),
            self.store.manifest_path(&request.test_id).display().to_string(),
        );

        for entry in entries {
            match entry.kind {
                ResourceKind::Key => match serde_json::from_value::<KeyState>(entry.state.clone())
                {
                    Ok(key) => {
                        files.insert(
                            format!("keys/{}", key.name),
                            key.private_key_path.clone(),
                        );
                        resources.keys.push(key);
                    }
                    Err(e) => warn!(resource = %entry.name, error = %e, "unparseable key state"),
                },
                ResourceKind::Network => {
                    match serde_json::from_value::<NetworkState>(entry.state.clone()) {
                        Ok(network) => resources.networks.push(network),
                        Err(e) => {
                            warn!(resource = %entry.name, error = %e, "unparseable network state")
                        }
                    }
                }
                ResourceKind::Vm => match serde_json::from_value::<VmState>(entry.state.clone()) {
                    Ok(vm) => resources.vms.push(vm),
                    Err(e) => warn!(resource = %entry.name, error = %e, "unparseable vm state"),
                },
            }
        }

        TestEnvArtifact {
            test_id: request.test_id,
            files,
            metadata: request.metadata,
            managed_resources: resources,
            env: request.env,
        }
    }

    /// Destroy the environment. Unknown test ids succeed idempotently.
    pub async fn delete(&self, request: DeleteRequest) -> Result<(), ProviderError> {
        let Some(manifest) = self.store.load(&request.test_id).await? else {
            info!(test_id = %request.test_id, "environment absent, delete is a no-op");
            return Ok(());
        };

        info!(
            test_id = %request.test_id,
            resources = manifest.resources.len(),
            "deleting environment"
        );
        let manager = self.start_manager().await?;
        let executor = self.executor(Arc::clone(&manager));
        let failures = executor.delete_all(&manifest).await;
        manager.shutdown(self.config.shutdown_grace).await;

        if failures.is_empty() {
            self.store.delete_env(&request.test_id).await?;
            info!(test_id = %request.test_id, "environment deleted");
            Ok(())
        } else {
            Err(aggregate_failures("delete", failures))
        }
    }
}

/// Outer tool surface: `create` and `delete` for the host test-runner.
pub struct OrchestratorHandler {
    orchestrator: Arc<Orchestrator>,
}

impl OrchestratorHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ToolHandler for OrchestratorHandler {
    async fn handle(
        &self,
        tool: &str,
        params: Value,
        _ctx: &RequestContext,
    ) -> Result<Value, ProviderError> {
        match tool {
            "create" => {
                require_str(&params, "testId")?;
                require_object(&params, "spec")?;
                let request: CreateRequest = serde_json::from_value(params).map_err(|e| {
                    ProviderError::invalid_spec(format!("malformed create request: {e}"))
                })?;
                let artifact = self.orchestrator.create(request).await?;
                Ok(serde_json::to_value(artifact)?)
            }
            "delete" => {
                require_str(&params, "testId")?;
                let request: DeleteRequest = serde_json::from_value(params).map_err(|e| {
                    ProviderError::invalid_spec(format!("malformed delete request: {e}"))
                })?;
                self.orchestrator.delete(request).await?;
                Ok(json!({"ok": true}))
            }
            other => Err(ProviderError::not_implemented(format!(
                "unknown tool {other}"
            ))),
        }
    }
}
