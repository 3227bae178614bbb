//! Provider subprocess lifecycle and request routing.
//!
//! Each provider is spawned once per environment operation and stays up
//! until shutdown. Requests are routed by `(kind, operation)` against
//! the advertised capabilities; each subprocess sees at most one
//! outstanding request.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use testenv_proto::capabilities::{Operation, ProviderCapabilities};
use testenv_proto::channel::{ToolClient, TOOL_SHUTDOWN};
use testenv_proto::provider::{OperationResult, Provider, ProviderToolHandler, RequestContext};
use testenv_proto::spec::ResourceKind;
use testenv_proto::{ProviderError, ToolHandler};

const CAPABILITIES_TIMEOUT: Duration = Duration::from_secs(10);

/// How to launch one provider. The manager appends the `serve-tools`
/// argument after `args`.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
        }
    }
}

enum ProviderConn {
    Child {
        client: ToolClient<ChildStdout, ChildStdin>,
        child: Mutex<Child>,
    },
    /// In-process binding, used by tests. Goes through the same tool
    /// dispatch as a subprocess.
    Local(Arc<dyn ToolHandler>),
}

pub struct ProviderHandle {
    name: String,
    caps: ProviderCapabilities,
    conn: ProviderConn,
    dead: AtomicBool,
}

impl ProviderHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &ProviderCapabilities {
        &self.caps
    }

    async fn call(&self, ctx: &RequestContext, tool: &str, params: Value) -> OperationResult {
        if self.dead.load(Ordering::Acquire) {
            return OperationResult::err(
                ProviderError::provider(format!("provider {} is dead", self.name))
                    .with_retryable(false),
            );
        }
        let result = match &self.conn {
            ProviderConn::Local(handler) => handler.handle(tool, params, ctx).await,
            ProviderConn::Child { client, .. } => match client.call(tool, params).await {
                Ok(response) => response.into_result(),
                Err(e) => {
                    warn!(provider = %self.name, error = %e, "channel failure, marking provider dead");
                    self.dead.store(true, Ordering::Release);
                    return OperationResult::err(
                        ProviderError::provider(format!(
                            "provider {} channel failure: {e}",
                            self.name
                        ))
                        .with_retryable(false),
                    );
                }
            },
        };
        match result {
            Ok(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                OperationResult::err(ProviderError::provider(format!(
                    "provider {} returned a malformed operation result: {e}",
                    self.name
                )))
            }),
            Err(error) => OperationResult::err(error),
        }
    }
}

#[derive(Default)]
pub struct ProviderManager {
    providers: Vec<ProviderHandle>,
}

impl ProviderManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch a provider subprocess and perform the capabilities
    /// handshake.
    pub async fn spawn(&mut self, config: &ProviderConfig) -> Result<(), ProviderError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .arg("serve-tools")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Logs stay on the diagnostic stream.
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            ProviderError::provider(format!(
                "failed to launch provider {} ({}): {e}",
                config.name, config.command
            ))
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            ProviderError::provider(format!("provider {} has no stdin", config.name))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ProviderError::provider(format!("provider {} has no stdout", config.name))
        })?;

        let client = ToolClient::new(stdout, stdin);
        let caps = Self::handshake(&config.name, &client).await?;
        info!(
            provider = %config.name,
            version = %caps.version,
            kinds = caps.resources.len(),
            "provider ready"
        );

        self.providers.push(ProviderHandle {
            name: config.name.clone(),
            caps,
            conn: ProviderConn::Child {
                client,
                child: Mutex::new(child),
            },
            dead: AtomicBool::new(false),
        });
        Ok(())
    }

    async fn handshake(
        name: &str,
        client: &ToolClient<ChildStdout, ChildStdin>,
    ) -> Result<ProviderCapabilities, ProviderError> {
        let response = timeout(
            CAPABILITIES_TIMEOUT,
            client.call("provider_capabilities", json!({})),
        )
        .await
        .map_err(|_| {
            ProviderError::timeout(format!("provider {name} capabilities handshake timed out"))
        })?
        .map_err(|e| {
            ProviderError::provider(format!("provider {name} handshake failed: {e}"))
        })?;
        let value = response.into_result()?;
        serde_json::from_value(value).map_err(|e| {
            ProviderError::provider(format!("provider {name} sent malformed capabilities: {e}"))
        })
    }

    /// Bind an in-process provider. Used by tests and by embedders that
    /// do not want a subprocess.
    pub async fn register_local(
        &mut self,
        name: &str,
        provider: Arc<dyn Provider>,
    ) -> Result<(), ProviderError> {
        let handler: Arc<dyn ToolHandler> = Arc::new(ProviderToolHandler::new(provider));
        let ctx = RequestContext::new();
        let value = handler
            .handle("provider_capabilities", json!({}), &ctx)
            .await?;
        let caps: ProviderCapabilities = serde_json::from_value(value).map_err(|e| {
            ProviderError::provider(format!("provider {name} sent malformed capabilities: {e}"))
        })?;
        self.providers.push(ProviderHandle {
            name: name.to_string(),
            caps,
            conn: ProviderConn::Local(handler),
            dead: AtomicBool::new(false),
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn by_name(&self, name: &str) -> Option<&ProviderHandle> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// First declared provider advertising `(kind, operation)`.
    fn route(&self, kind: ResourceKind, op: Operation) -> Result<&ProviderHandle, ProviderError> {
        let mut matches = self
            .providers
            .iter()
            .filter(|p| p.caps.supports(kind, op));
        let first = matches.next().ok_or_else(|| {
            ProviderError::not_implemented(format!("no provider supports {kind} {op}"))
        })?;
        if let Some(second) = matches.next() {
            warn!(
                kind = %kind,
                chosen = %first.name,
                ignored = %second.name,
                "multiple providers advertise this kind, first declared wins"
            );
        }
        Ok(first)
    }

    /// Name of the provider a create for this kind would route to.
    pub fn route_provider_name(
        &self,
        kind: ResourceKind,
        op: Operation,
    ) -> Result<String, ProviderError> {
        Ok(self.route(kind, op)?.name.clone())
    }

    async fn dispatch(
        &self,
        ctx: &RequestContext,
        provider: Option<&str>,
        kind: ResourceKind,
        op: Operation,
        params: Value,
    ) -> (String, OperationResult) {
        let handle = match provider {
            Some(name) => match self.by_name(name) {
                Some(handle) => handle,
                None => {
                    return (
                        name.to_string(),
                        OperationResult::err(ProviderError::not_found(format!(
                            "provider {name} is not configured"
                        ))),
                    );
                }
            },
            None => match self.route(kind, op) {
                Ok(handle) => handle,
                Err(e) => return (String::new(), OperationResult::err(e)),
            },
        };
        let tool = format!("{kind}_{op}");
        debug!(provider = %handle.name, tool = %tool, "dispatching");
        let result = handle.call(ctx, &tool, params).await;
        (handle.name.clone(), result)
    }

    pub async fn create(
        &self,
        ctx: &RequestContext,
        kind: ResourceKind,
        name: &str,
        spec: Value,
    ) -> (String, OperationResult) {
        self.dispatch(
            ctx,
            None,
            kind,
            Operation::Create,
            json!({"name": name, "spec": spec}),
        )
        .await
    }

    pub async fn get(
        &self,
        ctx: &RequestContext,
        provider: Option<&str>,
        kind: ResourceKind,
        name: &str,
    ) -> (String, OperationResult) {
        self.dispatch(ctx, provider, kind, Operation::Get, json!({ "name": name }))
            .await
    }

    pub async fn list(
        &self,
        ctx: &RequestContext,
        provider: Option<&str>,
        kind: ResourceKind,
    ) -> (String, OperationResult) {
        self.dispatch(ctx, provider, kind, Operation::List, json!({}))
            .await
    }

    pub async fn delete(
        &self,
        ctx: &RequestContext,
        provider: Option<&str>,
        kind: ResourceKind,
        name: &str,
    ) -> (String, OperationResult) {
        self.dispatch(
            ctx,
            provider,
            kind,
            Operation::Delete,
            json!({ "name": name }),
        )
        .await
    }

    /// Graceful shutdown: `shutdown` tool, bounded wait, then kill.
    pub async fn shutdown(&self, grace: Duration) {
        for handle in &self.providers {
            let ProviderConn::Child { client, child } = &handle.conn else {
                continue;
            };
            if !handle.dead.load(Ordering::Acquire) {
                let _ = timeout(grace, client.call(TOOL_SHUTDOWN, json!({}))).await;
            }
            let mut child = child.lock().await;
            match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(provider = %handle.name, status = ?status, "provider exited");
                }
                Ok(Err(e)) => {
                    warn!(provider = %handle.name, error = %e, "failed to reap provider");
                }
                Err(_) => {
                    warn!(provider = %handle.name, "provider ignored shutdown, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}
