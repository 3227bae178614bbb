//! SSH key pair materialization.
//!
//! Keys live under `state_dir/keys/<name>` (+ `.pub`), private at 0600,
//! public at 0644. The fingerprint is the SHA-256 digest of the decoded
//! public key blob, in the usual `SHA256:` form.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use testenv_proto::spec::{KeySpec, KeyType};
use testenv_proto::state::{KeyState, ResourceStatus};
use testenv_proto::ProviderError;

use crate::host::HostTools;

const DEFAULT_RSA_BITS: u32 = 4096;

pub struct KeyManager {
    keys_dir: PathBuf,
    tools: Arc<dyn HostTools>,
}

impl KeyManager {
    pub fn new(state_dir: &Path, tools: Arc<dyn HostTools>) -> Self {
        Self {
            keys_dir: state_dir.join("keys"),
            tools,
        }
    }

    pub fn private_path(&self, name: &str) -> PathBuf {
        self.keys_dir.join(name)
    }

    pub fn public_path(&self, name: &str) -> PathBuf {
        self.keys_dir.join(format!("{name}.pub"))
    }

    pub async fn create(&self, name: &str, spec: &KeySpec) -> Result<KeyState, ProviderError> {
        validate_name(name)?;
        tokio::fs::create_dir_all(&self.keys_dir)
            .await
            .map_err(|e| ProviderError::provider(format!("failed to create key dir: {e}")))?;

        let private_path = self.private_path(name);
        let public_path = self.public_path(name);

        // Stale material from a crashed run is replaced, not reused.
        let _ = tokio::fs::remove_file(&private_path).await;
        let _ = tokio::fs::remove_file(&public_path).await;

        let bits = match spec.key_type {
            KeyType::Rsa => spec.bits.unwrap_or(DEFAULT_RSA_BITS),
            _ => 0,
        };
        let comment = spec
            .comment
            .clone()
            .unwrap_or_else(|| format!("{name}@testenv"));
        self.tools
            .generate_keypair(spec.key_type, bits, &comment, &private_path)
            .await
            .map_err(|e| ProviderError::provider(format!("key generation failed: {e:#}")))?;

        set_mode(&private_path, 0o600).await?;
        set_mode(&public_path, 0o644).await?;

        let public_key = tokio::fs::read_to_string(&public_path)
            .await
            .map_err(|e| ProviderError::provider(format!("failed to read public key: {e}")))?
            .trim()
            .to_string();
        let fingerprint = fingerprint(&public_key)?;

        if let Some(output_dir) = &spec.output_dir {
            self.copy_pair(name, &private_path, &public_path, Path::new(output_dir))
                .await?;
        }

        info!(key = %name, r#type = %spec.key_type, fingerprint = %fingerprint, "key pair ready");
        Ok(KeyState {
            name: name.to_string(),
            key_type: spec.key_type,
            status: ResourceStatus::Ready,
            public_key,
            public_key_path: public_path.display().to_string(),
            private_key_path: private_path.display().to_string(),
            fingerprint,
            created_at: Some(Utc::now()),
            provider_state: Default::default(),
        })
    }

    async fn copy_pair(
        &self,
        name: &str,
        private_path: &Path,
        public_path: &Path,
        output_dir: &Path,
    ) -> Result<(), ProviderError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| ProviderError::provider(format!("failed to create output dir: {e}")))?;
        for (src, dst) in [
            (private_path, output_dir.join(name)),
            (public_path, output_dir.join(format!("{name}.pub"))),
        ] {
            tokio::fs::copy(src, &dst).await.map_err(|e| {
                ProviderError::provider(format!("failed to copy key to {}: {e}", dst.display()))
            })?;
        }
        Ok(())
    }

    /// Remove both files; absence is fine.
    pub async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        validate_name(name)?;
        for path in [self.private_path(name), self.public_path(name)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "key file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ProviderError::provider(format!(
                        "failed to remove {}: {e}",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), ProviderError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(ProviderError::invalid_spec(format!(
            "key name {name:?} is not a valid file name"
        )));
    }
    Ok(())
}

async fn set_mode(path: &Path, mode: u32) -> Result<(), ProviderError> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| {
            ProviderError::provider(format!("failed to chmod {}: {e}", path.display()))
        })
}

/// `SHA256:` fingerprint of an authorized-keys line.
pub fn fingerprint(public_key: &str) -> Result<String, ProviderError> {
    let blob = public_key
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| ProviderError::provider("malformed public key line"))?;
    let raw = STANDARD
        .decode(blob)
        .map_err(|e| ProviderError::provider(format!("public key is not base64: {e}")))?;
    let digest = Sha256::digest(&raw);
    Ok(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
}
