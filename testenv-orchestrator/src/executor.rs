//! Phased execution of the dependency plan.
//!
//! Every phase runs its resources concurrently (optionally bounded per
//! provider), rendering each spec against the scope of already-ready
//! resources immediately before dispatch. Retryable provider errors
//! back off exponentially; a fatal error cancels the rest of the phase
//! and, when cleanup is enabled, rolls back everything created so far
//! in reverse order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use testenv_proto::capabilities::Operation;
use testenv_proto::provider::RequestContext;
use testenv_proto::{ErrorCode, ProviderError};

use crate::dag::{NodeRef, Plan};
use crate::envspec::EnvSpec;
use crate::manager::ProviderManager;
use crate::store::{Manifest, ManifestEntry, StateStore};
use crate::template::{self, Scope};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * self.multiplier.saturating_pow(attempt.saturating_sub(1))
    }
}

pub struct Executor {
    manager: Arc<ProviderManager>,
    store: Arc<StateStore>,
    retry: RetryPolicy,
    per_provider_limit: Option<usize>,
    cleanup_on_failure: bool,
}

struct TaskOutcome {
    node: NodeRef,
    result: Result<(String, Value), ProviderError>,
}

impl Executor {
    pub fn new(
        manager: Arc<ProviderManager>,
        store: Arc<StateStore>,
        retry: RetryPolicy,
        per_provider_limit: Option<usize>,
        cleanup_on_failure: bool,
    ) -> Self {
        Self {
            manager,
            store,
            retry,
            per_provider_limit,
            cleanup_on_failure,
        }
    }

    /// Create every resource of the plan. On failure the aggregated
    /// error is returned after rollback (when enabled).
    pub async fn create_all(
        &self,
        test_id: &str,
        spec: &EnvSpec,
        plan: &Plan,
        cancel: CancellationToken,
    ) -> Result<Vec<ManifestEntry>, ProviderError> {
        let mut scope = Scope::default();
        let mut entries: Vec<ManifestEntry> = Vec::new();

        for (phase_no, phase) in plan.phases.iter().enumerate() {
            debug!(test_id, phase = phase_no, resources = phase.len(), "starting phase");
            let phase_cancel = cancel.child_token();
            let phase_scope = Arc::new(scope.clone());
            let mut semaphores: HashMap<String, Arc<Semaphore>> = HashMap::new();
            let mut join: JoinSet<TaskOutcome> = JoinSet::new();
            let phase_start = entries.len();

            for node in phase {
                let raw = spec.spec_value(node.kind, &node.name).ok_or_else(|| {
                    ProviderError::provider(format!("lost spec for {node} during execution"))
                })?;
                let semaphore = match self.per_provider_limit {
                    Some(limit) => {
                        let provider = self
                            .manager
                            .route_provider_name(node.kind, Operation::Create)
                            .unwrap_or_default();
                        Some(Arc::clone(semaphores.entry(provider).or_insert_with(
                            || Arc::new(Semaphore::new(limit.max(1))),
                        )))
                    }
                    None => None,
                };
                join.spawn(run_create(
                    Arc::clone(&self.manager),
                    Arc::clone(&phase_scope),
                    node.clone(),
                    raw,
                    self.retry.clone(),
                    phase_cancel.clone(),
                    semaphore,
                ));
            }

            let mut failures: Vec<(String, ProviderError)> = Vec::new();
            while let Some(joined) = join.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(test_id, error = %e, "resource task aborted");
                        phase_cancel.cancel();
                        failures.push((
                            "internal".to_string(),
                            ProviderError::provider(format!("resource task aborted: {e}")),
                        ));
                        continue;
                    }
                };
                match outcome.result {
                    Ok((provider, state)) => {
                        if phase_cancel.is_cancelled() {
                            debug!(resource = %outcome.node, "discarding result of cancelled request");
                            continue;
                        }
                        info!(resource = %outcome.node, provider = %provider, "resource ready");
                        let entry = ManifestEntry {
                            kind: outcome.node.kind,
                            name: outcome.node.name.clone(),
                            provider,
                            state,
                            created_at: Utc::now(),
                        };
                        if let Err(e) = self.store.record_resource(test_id, entry.clone()).await {
                            error!(resource = %outcome.node, error = %e, "failed to persist state");
                            phase_cancel.cancel();
                            failures.push((outcome.node.to_string(), e));
                            continue;
                        }
                        entries.push(entry);
                    }
                    Err(err)
                        if err.code == ErrorCode::DependencyFailed
                            && phase_cancel.is_cancelled() =>
                    {
                        // Skipped because a sibling already failed.
                        debug!(resource = %outcome.node, "skipped after phase cancellation");
                    }
                    Err(err) => {
                        error!(resource = %outcome.node, code = %err.code, error = %err.message, "resource failed");
                        phase_cancel.cancel();
                        failures.push((outcome.node.to_string(), err));
                    }
                }
            }

            if !failures.is_empty() {
                if self.cleanup_on_failure {
                    let rollback_failures = self.rollback(test_id, &entries).await;
                    for (resource, err) in rollback_failures {
                        warn!(resource = %resource, error = %err, "rollback failure");
                    }
                }
                return Err(aggregate_failures("create", failures));
            }

            for entry in &entries[phase_start..] {
                scope.insert(entry.kind, entry.name.clone(), entry.state.clone());
            }
        }

        Ok(entries)
    }

    /// Best-effort reverse-order destruction of created resources.
    /// Failures are accumulated, never fatal to the walk. The
    /// environment directory is removed once everything is gone.
    pub async fn rollback(
        &self,
        test_id: &str,
        entries: &[ManifestEntry],
    ) -> Vec<(String, ProviderError)> {
        info!(test_id, resources = entries.len(), "rolling back environment");
        let failures = self.destroy_reverse(test_id, entries).await;
        if failures.is_empty() {
            if let Err(e) = self.store.delete_env(test_id).await {
                warn!(test_id, error = %e, "failed to remove environment state after rollback");
            }
        }
        failures
    }

    /// Tear down every resource recorded in the manifest, newest first.
    pub async fn delete_all(&self, manifest: &Manifest) -> Vec<(String, ProviderError)> {
        self.destroy_reverse(&manifest.test_id, &manifest.resources)
            .await
    }

    async fn destroy_reverse(
        &self,
        test_id: &str,
        entries: &[ManifestEntry],
    ) -> Vec<(String, ProviderError)> {
        let mut failures = Vec::new();
        for entry in entries.iter().rev() {
            // Deletion never cancels; it runs to completion or failure.
            let ctx = RequestContext::new();
            let (_, result) = self
                .manager
                .delete(&ctx, Some(&entry.provider), entry.kind, &entry.name)
                .await;
            let resource = NodeRef::new(entry.kind, entry.name.clone());
            match result.into_result() {
                Ok(_) => {
                    debug!(resource = %resource, "resource destroyed");
                }
                Err(err) if err.code == ErrorCode::NotFound => {
                    debug!(resource = %resource, "resource already gone");
                }
                Err(err) => {
                    error!(resource = %resource, code = %err.code, error = %err.message, "delete failed");
                    failures.push((resource.to_string(), err));
                    continue;
                }
            }
            if let Err(e) = self
                .store
                .remove_resource(test_id, entry.kind, &entry.name)
                .await
            {
                warn!(resource = %resource, error = %e, "failed to drop manifest entry");
            }
        }
        failures
    }
}

async fn run_create(
    manager: Arc<ProviderManager>,
    scope: Arc<Scope>,
    node: NodeRef,
    raw_spec: Value,
    retry: RetryPolicy,
    cancel: CancellationToken,
    semaphore: Option<Arc<Semaphore>>,
) -> TaskOutcome {
    let _permit = match semaphore {
        Some(semaphore) => match semaphore.acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => {
                return TaskOutcome {
                    node,
                    result: Err(ProviderError::dependency_failed("phase cancelled")),
                };
            }
        },
        None => None,
    };

    let mut attempt: u32 = 0;
    let result = loop {
        if cancel.is_cancelled() {
            break Err(ProviderError::dependency_failed("phase cancelled"));
        }

        // Just-in-time render against the immutable phase scope.
        let rendered = match template::render_value(&raw_spec, &scope) {
            Ok(rendered) => rendered,
            Err(e) => break Err(e),
        };

        let ctx = RequestContext::with_cancel(cancel.clone());
        let (provider, result) = manager.create(&ctx, node.kind, &node.name, rendered).await;
        match result.into_result() {
            Ok(Some(state)) => break Ok((provider, state)),
            Ok(None) => {
                break Err(ProviderError::provider(format!(
                    "{node} create returned no state"
                )));
            }
            Err(err) => {
                attempt += 1;
                if err.retryable && attempt < retry.attempts {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        resource = %node,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.message,
                        "retrying after backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            break Err(ProviderError::dependency_failed("phase cancelled"));
                        }
                        _ = sleep(delay) => continue,
                    }
                }
                break Err(err);
            }
        }
    };

    TaskOutcome { node, result }
}

/// Collapse per-resource failures into one error carrying the root
/// cause's code and a detail per resource.
pub(crate) fn aggregate_failures(
    operation: &str,
    failures: Vec<(String, ProviderError)>,
) -> ProviderError {
    let code = failures
        .first()
        .map(|(_, e)| e.code)
        .unwrap_or(ErrorCode::ProviderError);
    let summary: Vec<&str> = failures.iter().map(|(r, _)| r.as_str()).collect();
    let mut err = ProviderError::new(
        code,
        format!(
            "{operation} failed for {} resource(s): {}",
            failures.len(),
            summary.join(", ")
        ),
    )
    .with_retryable(false);
    for (resource, failure) in &failures {
        err = err.with_detail(
            resource.as_str(),
            format!("{}: {}", failure.code, failure.message),
        );
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_for(1), Duration::from_millis(500));
        assert_eq!(retry.delay_for(2), Duration::from_millis(1000));
        assert_eq!(retry.delay_for(3), Duration::from_millis(2000));
    }

    #[test]
    fn aggregate_keeps_root_cause_code() {
        let err = aggregate_failures(
            "create",
            vec![
                ("vm/v".into(), ProviderError::timeout("ip never appeared")),
                ("vm/w".into(), ProviderError::provider("boom")),
            ],
        );
        assert_eq!(err.code, ErrorCode::Timeout);
        assert!(!err.retryable);
        assert!(err.details.contains_key("vm/v"));
        assert!(err.details.contains_key("vm/w"));
    }
}
