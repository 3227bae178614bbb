//! Shared protocol between the testenv orchestrator and its resource
//! providers.
//!
//! Providers are separate processes speaking newline-delimited JSON over
//! stdin/stdout. This crate holds everything both sides must agree on:
//! the error taxonomy, the resource spec and state types, provider
//! capabilities, and the tool channel itself. The [`Provider`] trait is
//! the in-process seam: the serve loop dispatches tool calls to it, and
//! test code can bind an implementation directly without a subprocess.

pub mod capabilities;
pub mod channel;
pub mod error;
pub mod provider;
pub mod spec;
pub mod state;

pub use capabilities::{Operation, ProviderCapabilities, ResourceCapability};
pub use channel::{serve, ToolClient, ToolHandler, ToolRequest, ToolResponse};
pub use error::{ErrorCode, ProviderError};
pub use provider::{OperationResult, Provider, ProviderToolHandler, RequestContext};
pub use spec::{KeySpec, KeyType, NetworkSpec, ResourceKind, VmSpec};
pub use state::{KeyState, NetworkState, ResourceStatus, VmProviderState, VmState};
