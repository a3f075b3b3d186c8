//! Idempotent converge/destroy synchronization
//!
//! The [`Synchronizer`] drives a set of [`Descriptor`]s toward reality
//! through an [`ObjectStore`]: create when absent, patch builder-controlled
//! fields when present, retry bounded on optimistic-concurrency conflicts.
//! A create racing to "already exists" and a delete finding nothing are both
//! success, which is what makes a full pass safe to re-run at any time.

mod store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use rand::Rng;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::Sleuth;
use crate::Error;

pub use store::{KindRegistry, KubeObjectStore};

/// Kinds of objects the desired-state builder produces
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DescriptorKind {
    /// Workload identity
    ServiceAccount,
    /// Network exposure
    Service,
    /// The diagnostics server workload
    Deployment,
    /// Cluster-wide read permissions for analysis
    ClusterRole,
    /// Binding of the ClusterRole to the workload identity
    ClusterRoleBinding,
    /// Credential secrets referenced by the spec (pre-check only, never
    /// created or destroyed by the operator)
    Secret,
}

impl DescriptorKind {
    /// Returns true if objects of this kind are cluster-scoped
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(self, Self::ClusterRole | Self::ClusterRoleBinding)
    }
}

impl std::fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServiceAccount => write!(f, "ServiceAccount"),
            Self::Service => write!(f, "Service"),
            Self::Deployment => write!(f, "Deployment"),
            Self::ClusterRole => write!(f, "ClusterRole"),
            Self::ClusterRoleBinding => write!(f, "ClusterRoleBinding"),
            Self::Secret => write!(f, "Secret"),
        }
    }
}

/// Stable identity of one converged object
///
/// Namespace is `None` for cluster-scoped kinds.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Object kind
    pub kind: DescriptorKind,
    /// Namespace, absent for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a namespaced key
    pub fn namespaced(
        kind: DescriptorKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Create a cluster-scoped key
    pub fn cluster_scoped(kind: DescriptorKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// One concrete object to converge
///
/// Produced fresh each pass by the desired-state builder; the payload is the
/// full manifest (apiVersion, kind, metadata, spec-equivalent fields) and
/// contains exactly the fields the builder controls.
#[derive(Clone, Debug, PartialEq)]
pub struct Descriptor {
    /// Stable identity used for idempotent lookup
    pub key: ObjectKey,
    /// Full manifest of the builder-controlled fields
    pub payload: serde_json::Value,
}

impl Descriptor {
    /// Create a descriptor from its identity key and manifest payload
    pub fn new(key: ObjectKey, payload: serde_json::Value) -> Self {
        Self { key, payload }
    }
}

/// Errors from the object store
///
/// The three non-generic outcomes (already-exists, conflict, not-found) are
/// distinguishable from arbitrary API errors because the synchronizer's
/// correctness depends on the disambiguation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Create raced another writer; the object already exists
    #[error("object already exists")]
    AlreadyExists,

    /// Patch lost an optimistic-concurrency race
    #[error("optimistic concurrency conflict")]
    Conflict,

    /// The object does not exist
    #[error("object not found")]
    NotFound,

    /// The operation exceeded its per-call timeout
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Any other Kubernetes API error, propagated unmodified
    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict => Error::conflict("unretried optimistic-concurrency conflict"),
            StoreError::Timeout(d) => {
                Error::timeout(format!("store operation exceeded {}s", d.as_secs()))
            }
            StoreError::Api(e) => Error::Kube(e),
            // AlreadyExists and NotFound are success paths; reaching here
            // means a caller failed to map them first.
            other => Error::Kube(kube::Error::Service(Box::new(other))),
        }
    }
}

/// Object store collaborator contract
///
/// Implemented against the Kubernetes API in production and mocked in tests.
/// Every method is bounded by the implementation's per-call timeout.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Look up an object by identity key; absent is `Ok(None)`, not an error
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError>;

    /// Create the object described by the descriptor
    async fn create(&self, descriptor: &Descriptor) -> Result<(), StoreError>;

    /// Patch only the builder-controlled fields of an existing object,
    /// leaving unrelated externally-set fields untouched
    async fn patch(&self, descriptor: &Descriptor) -> Result<(), StoreError>;

    /// Delete an object by identity key
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;
}

/// Bounded retry policy for optimistic-concurrency conflicts
///
/// Only conflict responses are retried; any other store error propagates on
/// the first occurrence.
#[derive(Clone, Debug)]
pub struct ConflictRetry {
    /// Maximum number of patch attempts (including the first)
    pub max_attempts: u32,
    /// Initial delay between attempts; doubled each retry with jitter
    pub base_delay: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_CONFLICT_RETRIES,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl ConflictRetry {
    /// Create a policy with a custom attempt bound
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }
}

/// Idempotent converge/destroy engine over an [`ObjectStore`]
///
/// Holds no per-object state: re-running any operation (or a whole pass) is
/// always safe, which is how partial progress is recovered — the next pass
/// simply converges the full set again.
pub struct Synchronizer {
    store: Arc<dyn ObjectStore>,
    retry: ConflictRetry,
}

impl Synchronizer {
    /// Create a synchronizer with the default conflict retry policy
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            retry: ConflictRetry::default(),
        }
    }

    /// Create a synchronizer with a custom conflict retry policy
    pub fn with_retry(store: Arc<dyn ObjectStore>, retry: ConflictRetry) -> Self {
        Self { store, retry }
    }

    /// Converge one descriptor: create when absent, patch when present
    ///
    /// A create racing to "already exists" is success. A patch conflict is
    /// retried up to the configured bound with jittered backoff.
    pub async fn converge(&self, descriptor: &Descriptor) -> Result<(), Error> {
        match self.store.get(&descriptor.key).await? {
            None => match self.store.create(descriptor).await {
                Ok(()) => {
                    info!(key = %descriptor.key, "created object");
                    Ok(())
                }
                Err(StoreError::AlreadyExists) => {
                    // Lost a create race to another pass; the object is there,
                    // which is all converge promises.
                    debug!(key = %descriptor.key, "create raced to already-exists, treating as success");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            Some(_) => self.patch_with_retry(descriptor).await,
        }
    }

    /// Destroy the object identified by the key; "not found" is success
    pub async fn destroy(&self, key: &ObjectKey) -> Result<(), Error> {
        match self.store.delete(key).await {
            Ok(()) => {
                info!(key = %key, "deleted object");
                Ok(())
            }
            Err(StoreError::NotFound) => {
                debug!(key = %key, "object already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Converge the full descriptor set for one Sleuth instance
    ///
    /// If the spec references a credential secret, its existence is confirmed
    /// first; absence aborts the pass before any object is touched so that a
    /// partially configured workload is never created. Ordering is
    /// best-effort, not a transaction: a later failure leaves earlier
    /// successes in place for the next pass to pick up.
    pub async fn converge_all(
        &self,
        sleuth: &Sleuth,
        descriptors: &[Descriptor],
    ) -> Result<(), Error> {
        self.precheck_credentials(sleuth).await?;

        for descriptor in descriptors {
            self.converge(descriptor).await?;
        }
        Ok(())
    }

    /// Destroy every object in the key set, tolerating absent objects
    pub async fn destroy_all(&self, keys: &[ObjectKey]) -> Result<(), Error> {
        for key in keys {
            self.destroy(key).await?;
        }
        Ok(())
    }

    /// Confirm that a spec-referenced credential secret exists
    async fn precheck_credentials(&self, sleuth: &Sleuth) -> Result<(), Error> {
        let Some(secret) = &sleuth.spec.ai.secret else {
            return Ok(());
        };

        let namespace = sleuth
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let key = ObjectKey::namespaced(DescriptorKind::Secret, namespace, &secret.name);

        match self.store.get(&key).await? {
            Some(_) => Ok(()),
            None => Err(Error::configuration(format!(
                "credential secret \"{}\" not found",
                secret.name
            ))),
        }
    }

    /// Patch with bounded conflict retry
    ///
    /// Attempt numbering matches the spec: N conflicts followed by an ok
    /// succeed after exactly N+1 patch attempts when N is below the bound.
    async fn patch_with_retry(&self, descriptor: &Descriptor) -> Result<(), Error> {
        let mut delay = self.retry.base_delay;

        let max_attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.store.patch(descriptor).await {
                Ok(()) => {
                    debug!(key = %descriptor.key, attempt, "patched object");
                    return Ok(());
                }
                Err(StoreError::Conflict) => {
                    if attempt == max_attempts {
                        return Err(Error::conflict(format!(
                            "patch of {} lost {} conflict races",
                            descriptor.key, attempt
                        )));
                    }

                    // Jitter the delay to avoid lockstep with the competing writer
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                    warn!(
                        key = %descriptor.key,
                        attempt,
                        delay_ms = jittered.as_millis(),
                        "patch conflict, retrying"
                    );
                    tokio::time::sleep(jittered).await;
                    delay *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }

        unreachable!("retry loop returns on the final attempt")
    }
}
