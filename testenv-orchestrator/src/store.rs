//! Per-test persistent state.
//!
//! Each environment owns `state_dir/envs/<test_id>/manifest.json`. All
//! writes go through a temp file plus atomic rename; reads treat
//! unreadable files as absent so a crash mid-write never wedges the
//! store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use testenv_proto::spec::ResourceKind;
use testenv_proto::ProviderError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub kind: ResourceKind,
    pub name: String,
    /// Provider that created the resource; delete dispatches back to it.
    pub provider: String,
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub test_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Resources in creation order.
    #[serde(default)]
    pub resources: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn find(&self, kind: ResourceKind, name: &str) -> Option<&ManifestEntry> {
        self.resources
            .iter()
            .find(|e| e.kind == kind && e.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn env_dir(&self, test_id: &str) -> PathBuf {
        self.root.join("envs").join(test_id)
    }

    pub fn manifest_path(&self, test_id: &str) -> PathBuf {
        self.env_dir(test_id).join("manifest.json")
    }

    fn validate_test_id(test_id: &str) -> Result<(), ProviderError> {
        if test_id.is_empty() {
            return Err(ProviderError::invalid_spec("testId must not be empty"));
        }
        if test_id == "." || test_id == ".." || test_id.contains(['/', '\\']) {
            return Err(ProviderError::invalid_spec(format!(
                "testId {test_id:?} is not a valid directory name"
            )));
        }
        Ok(())
    }

    pub async fn env_exists(&self, test_id: &str) -> bool {
        tokio::fs::try_exists(self.manifest_path(test_id))
            .await
            .unwrap_or(false)
    }

    /// Create the environment record. Fails with `ALREADY_EXISTS` when a
    /// readable manifest for the id is present.
    pub async fn init_env(
        &self,
        test_id: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        Self::validate_test_id(test_id)?;
        if self.load(test_id).await?.is_some() {
            return Err(ProviderError::already_exists(format!(
                "environment {test_id} already exists"
            )));
        }
        let manifest = Manifest {
            test_id: test_id.to_string(),
            created_at: Utc::now(),
            metadata: metadata.clone(),
            resources: Vec::new(),
        };
        self.write_manifest(test_id, &manifest).await
    }

    /// Load the manifest, treating missing or unreadable files as
    /// absent.
    pub async fn load(&self, test_id: &str) -> Result<Option<Manifest>, ProviderError> {
        Self::validate_test_id(test_id)?;
        let path = self.manifest_path(test_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "manifest unreadable, treating as absent");
                return Ok(None);
            }
        };
        match serde_json::from_str(&raw) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "manifest corrupt, treating as absent");
                Ok(None)
            }
        }
    }

    /// Record (or replace) one resource's state.
    pub async fn record_resource(
        &self,
        test_id: &str,
        entry: ManifestEntry,
    ) -> Result<(), ProviderError> {
        let mut manifest = self.load(test_id).await?.ok_or_else(|| {
            ProviderError::provider(format!("environment {test_id} is not initialized"))
        })?;
        manifest
            .resources
            .retain(|e| !(e.kind == entry.kind && e.name == entry.name));
        manifest.resources.push(entry);
        self.write_manifest(test_id, &manifest).await
    }

    /// Drop one resource from the manifest. Absent entries are fine.
    pub async fn remove_resource(
        &self,
        test_id: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<(), ProviderError> {
        let Some(mut manifest) = self.load(test_id).await? else {
            return Ok(());
        };
        manifest
            .resources
            .retain(|e| !(e.kind == kind && e.name == name));
        self.write_manifest(test_id, &manifest).await
    }

    /// Remove every trace of the environment.
    pub async fn delete_env(&self, test_id: &str) -> Result<(), ProviderError> {
        Self::validate_test_id(test_id)?;
        let dir = self.env_dir(test_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(test_id, "environment state removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProviderError::provider(format!(
                "failed to remove environment state for {test_id}: {e}"
            ))),
        }
    }

    async fn write_manifest(&self, test_id: &str, manifest: &Manifest) -> Result<(), ProviderError> {
        let dir = self.env_dir(test_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ProviderError::provider(format!("failed to create {}: {e}", dir.display())))?;

        let path = self.manifest_path(test_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(manifest)?;
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| ProviderError::provider(format!("failed to write manifest: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ProviderError::provider(format!("failed to commit manifest: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use testenv_proto::ErrorCode;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        (dir, store)
    }

    fn entry(kind: ResourceKind, name: &str) -> ManifestEntry {
        ManifestEntry {
            kind,
            name: name.into(),
            provider: "mem".into(),
            state: json!({"name": name, "status": "ready"}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn init_then_double_init_is_already_exists() {
        let (_dir, store) = store();
        store.init_env("t1", &BTreeMap::new()).await.unwrap();
        let err = store.init_env("t1", &BTreeMap::new()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);
    }

    #[tokio::test]
    async fn record_and_reload_resources_in_order() {
        let (_dir, store) = store();
        store.init_env("t1", &BTreeMap::new()).await.unwrap();
        store
            .record_resource("t1", entry(ResourceKind::Key, "k"))
            .await
            .unwrap();
        store
            .record_resource("t1", entry(ResourceKind::Network, "n"))
            .await
            .unwrap();

        let manifest = store.load("t1").await.unwrap().unwrap();
        assert_eq!(manifest.resources.len(), 2);
        assert_eq!(manifest.resources[0].name, "k");
        assert_eq!(manifest.resources[1].name, "n");
        assert!(manifest.find(ResourceKind::Network, "n").is_some());
    }

    #[tokio::test]
    async fn corrupt_manifest_reads_as_absent() {
        let (_dir, store) = store();
        store.init_env("t1", &BTreeMap::new()).await.unwrap();
        tokio::fs::write(store.manifest_path("t1"), b"{half a manifest")
            .await
            .unwrap();
        assert!(store.load("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_env_is_idempotent() {
        let (_dir, store) = store();
        store.init_env("t1", &BTreeMap::new()).await.unwrap();
        store.delete_env("t1").await.unwrap();
        assert!(!store.env_exists("t1").await);
        // Second delete of a missing environment still succeeds.
        store.delete_env("t1").await.unwrap();
    }

    #[tokio::test]
    async fn hostile_test_id_is_rejected() {
        let (_dir, store) = store();
        let err = store
            .init_env("../escape", &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSpec);
    }

    #[tokio::test]
    async fn remove_resource_tolerates_absence() {
        let (_dir, store) = store();
        store
            .remove_resource("ghost", ResourceKind::Key, "k")
            .await
            .unwrap();
    }
}
