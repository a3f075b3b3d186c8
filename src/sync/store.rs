//! Kubernetes-backed object store
//!
//! [`KubeObjectStore`] adapts the raw client into the [`ObjectStore`]
//! contract the synchronizer consumes: kind resolution through a
//! [`KindRegistry`] built once at startup, a per-call timeout, and error
//! classification into the outcomes the synchronizer distinguishes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

use super::{Descriptor, DescriptorKind, ObjectKey, ObjectStore, StoreError};

/// Maps descriptor kinds to their API coordinates
///
/// Constructed once at startup and shared by reference; nothing registers
/// into it afterward, so lookups need no locking.
#[derive(Clone, Debug)]
pub struct KindRegistry {
    entries: HashMap<DescriptorKind, ApiResource>,
}

impl KindRegistry {
    /// Build the registry for every kind the desired-state builder produces
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            DescriptorKind::ServiceAccount,
            core_resource("ServiceAccount", "serviceaccounts"),
        );
        entries.insert(DescriptorKind::Service, core_resource("Service", "services"));
        entries.insert(DescriptorKind::Secret, core_resource("Secret", "secrets"));
        entries.insert(
            DescriptorKind::Deployment,
            ApiResource {
                group: "apps".to_string(),
                version: "v1".to_string(),
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                plural: "deployments".to_string(),
            },
        );
        entries.insert(
            DescriptorKind::ClusterRole,
            rbac_resource("ClusterRole", "clusterroles"),
        );
        entries.insert(
            DescriptorKind::ClusterRoleBinding,
            rbac_resource("ClusterRoleBinding", "clusterrolebindings"),
        );
        Self { entries }
    }

    /// Resolve the API coordinates for a kind
    pub fn resolve(&self, kind: &DescriptorKind) -> &ApiResource {
        self.entries
            .get(kind)
            .unwrap_or_else(|| panic!("kind registry is missing {kind}"))
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn core_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: String::new(),
        version: "v1".to_string(),
        api_version: "v1".to_string(),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

fn rbac_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: "rbac.authorization.k8s.io".to_string(),
        version: "v1".to_string(),
        api_version: "rbac.authorization.k8s.io/v1".to_string(),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// [`ObjectStore`] implementation over the Kubernetes API
pub struct KubeObjectStore {
    client: Client,
    registry: Arc<KindRegistry>,
    timeout: Duration,
}

impl KubeObjectStore {
    /// Create a store with the default per-call timeout
    pub fn new(client: Client, registry: Arc<KindRegistry>) -> Self {
        Self::with_timeout(
            client,
            registry,
            Duration::from_secs(crate::DEFAULT_STORE_TIMEOUT_SECS),
        )
    }

    /// Create a store with a custom per-call timeout
    pub fn with_timeout(client: Client, registry: Arc<KindRegistry>, timeout: Duration) -> Self {
        Self {
            client,
            registry,
            timeout,
        }
    }

    fn api_for(&self, key: &ObjectKey) -> Api<DynamicObject> {
        let resource = self.registry.resolve(&key.kind);
        match &key.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    /// Run a store call under the per-call timeout and classify the outcome
    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

/// Classify a Kubernetes API error into the outcomes the synchronizer
/// distinguishes; anything else passes through unmodified
fn classify(e: kube::Error) -> StoreError {
    if let kube::Error::Api(response) = &e {
        match response.code {
            404 => return StoreError::NotFound,
            409 if response.reason == "AlreadyExists" => return StoreError::AlreadyExists,
            409 => return StoreError::Conflict,
            _ => {}
        }
    }
    StoreError::Api(e)
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        let api = self.api_for(key);
        match self.bounded(api.get(&key.name)).await {
            Ok(obj) => Ok(Some(obj)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, descriptor: &Descriptor) -> Result<(), StoreError> {
        let obj: DynamicObject = serde_json::from_value(descriptor.payload.clone())
            .map_err(|e| StoreError::Api(kube::Error::SerdeError(e)))?;

        debug!(key = %descriptor.key, "creating object");
        self.bounded(async {
            self.api_for(&descriptor.key)
                .create(&PostParams::default(), &obj)
                .await
        })
        .await?;
        Ok(())
    }

    async fn patch(&self, descriptor: &Descriptor) -> Result<(), StoreError> {
        // Merge patch carries only the builder-controlled fields, so
        // externally-set fields on the live object stay untouched.
        let patch = Patch::Merge(descriptor.payload.clone());
        let params = PatchParams::default();

        debug!(key = %descriptor.key, "patching object");
        self.bounded(async {
            self.api_for(&descriptor.key)
                .patch(&descriptor.key.name, &params, &patch)
                .await
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        debug!(key = %key, "deleting object");
        self.bounded(async {
            self.api_for(key)
                .delete(&key.name, &DeleteParams::default())
                .await
        })
        .await?;
        Ok(())
    }
}
