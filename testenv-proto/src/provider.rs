//! The provider seam: one async trait implemented by every resource
//! provider, plus the `OperationResult` envelope each call returns and
//! the adapter that exposes a `Provider` over the tool channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::capabilities::ProviderCapabilities;
use crate::channel::{require_str, ToolHandler};
use crate::error::ProviderError;
use crate::spec::{KeySpec, NetworkSpec, VmSpec};

/// Per-request context. Long-running provider work checks the token
/// between polling iterations and refuses to persist results once it
/// has fired.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Envelope for every provider operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    /// The resource state (or a list of states for `list`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderError>,
}

impl OperationResult {
    pub fn ok<T: Serialize>(resource: &T) -> Self {
        match serde_json::to_value(resource) {
            Ok(value) => Self {
                success: true,
                resource: Some(value),
                error: None,
            },
            Err(e) => Self::err(e.into()),
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            resource: None,
            error: None,
        }
    }

    pub fn err(error: ProviderError) -> Self {
        Self {
            success: false,
            resource: None,
            error: Some(error),
        }
    }

    /// Deserialize the resource payload into a typed state.
    pub fn state<T: DeserializeOwned>(&self) -> Result<T, ProviderError> {
        match (&self.resource, &self.error) {
            (Some(value), _) => serde_json::from_value(value.clone())
                .map_err(|e| ProviderError::provider(format!("malformed resource payload: {e}"))),
            (None, Some(err)) => Err(err.clone()),
            (None, None) => Err(ProviderError::provider("operation returned no resource")),
        }
    }

    pub fn into_result(self) -> Result<Option<Value>, ProviderError> {
        if self.success {
            Ok(self.resource)
        } else {
            Err(self
                .error
                .unwrap_or_else(|| ProviderError::provider("operation failed without error")))
        }
    }
}

impl From<ProviderError> for OperationResult {
    fn from(e: ProviderError) -> Self {
        OperationResult::err(e)
    }
}

/// Resource provider. One implementation per backing system: the
/// hypervisor provider for real hosts, the in-memory provider for
/// tests.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn capabilities(&self) -> ProviderCapabilities;

    async fn key_create(&self, ctx: &RequestContext, name: &str, spec: KeySpec)
        -> OperationResult;
    async fn key_get(&self, ctx: &RequestContext, name: &str) -> OperationResult;
    async fn key_list(&self, ctx: &RequestContext) -> OperationResult;
    async fn key_delete(&self, ctx: &RequestContext, name: &str) -> OperationResult;

    async fn network_create(
        &self,
        ctx: &RequestContext,
        name: &str,
        spec: NetworkSpec,
    ) -> OperationResult;
    async fn network_get(&self, ctx: &RequestContext, name: &str) -> OperationResult;
    async fn network_list(&self, ctx: &RequestContext) -> OperationResult;
    async fn network_delete(&self, ctx: &RequestContext, name: &str) -> OperationResult;

    async fn vm_create(&self, ctx: &RequestContext, name: &str, spec: VmSpec) -> OperationResult;
    async fn vm_get(&self, ctx: &RequestContext, name: &str) -> OperationResult;
    async fn vm_list(&self, ctx: &RequestContext) -> OperationResult;
    async fn vm_delete(&self, ctx: &RequestContext, name: &str) -> OperationResult;
}

fn parse_spec<S: DeserializeOwned + Default>(params: &Value) -> Result<S, ProviderError> {
    match params.get("spec") {
        None | Some(Value::Null) => Ok(S::default()),
        Some(spec) => serde_json::from_value(spec.clone())
            .map_err(|e| ProviderError::invalid_spec(format!("malformed spec: {e}"))),
    }
}

/// Adapts a [`Provider`] to the thirteen provider tools.
pub struct ProviderToolHandler<P: ?Sized> {
    provider: Arc<P>,
}

impl<P: ?Sized> ProviderToolHandler<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<P: Provider + ?Sized + 'static> ToolHandler for ProviderToolHandler<P> {
    async fn handle(
        &self,
        tool: &str,
        params: Value,
        ctx: &RequestContext,
    ) -> Result<Value, ProviderError> {
        let result = match tool {
            "provider_capabilities" => {
                return Ok(serde_json::to_value(self.provider.capabilities().await)?);
            }
            "key_create" => {
                let name = require_str(&params, "name")?;
                self.provider
                    .key_create(ctx, &name, parse_spec(&params)?)
                    .await
            }
            "key_get" => {
                let name = require_str(&params, "name")?;
                self.provider.key_get(ctx, &name).await
            }
            "key_list" => self.provider.key_list(ctx).await,
            "key_delete" => {
                let name = require_str(&params, "name")?;
                self.provider.key_delete(ctx, &name).await
            }
            "network_create" => {
                let name = require_str(&params, "name")?;
                self.provider
                    .network_create(ctx, &name, parse_spec(&params)?)
                    .await
            }
            "network_get" => {
                let name = require_str(&params, "name")?;
                self.provider.network_get(ctx, &name).await
            }
            "network_list" => self.provider.network_list(ctx).await,
            "network_delete" => {
                let name = require_str(&params, "name")?;
                self.provider.network_delete(ctx, &name).await
            }
            "vm_create" => {
                let name = require_str(&params, "name")?;
                self.provider
                    .vm_create(ctx, &name, parse_spec(&params)?)
                    .await
            }
            "vm_get" => {
                let name = require_str(&params, "name")?;
                self.provider.vm_get(ctx, &name).await
            }
            "vm_list" => self.provider.vm_list(ctx).await,
            "vm_delete" => {
                let name = require_str(&params, "name")?;
                self.provider.vm_delete(ctx, &name).await
            }
            other => {
                return Err(ProviderError::not_implemented(format!(
                    "unknown tool {other}"
                )));
            }
        };
        Ok(serde_json::to_value(result)?)
    }
}
