//! testenv orchestrator library.
//!
//! Turns one declarative environment spec into real resources: parses
//! and validates the spec, discovers dependencies from template
//! references, partitions the graph into parallel phases, drives
//! provider subprocesses over the tool channel, persists per-test
//! state, and rolls back on failure.

pub mod config;
pub mod dag;
pub mod envspec;
pub mod executor;
pub mod manager;
pub mod orchestrator;
pub mod store;
pub mod template;

pub use config::Config;
pub use envspec::EnvSpec;
pub use manager::{ProviderConfig, ProviderManager};
pub use orchestrator::{
    CreateRequest, DeleteRequest, ManagedResources, Orchestrator, OrchestratorHandler,
    TestEnvArtifact,
};
