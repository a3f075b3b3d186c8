//! Sleuth reconciliation controller
//!
//! The driver owns the outer loop: teardown on deletion, spec validation,
//! finalizer management, then the step [`Pipeline`] that does the actual
//! convergence work. Collaborators reach the cluster through trait seams so
//! every branch is testable without an API server.

mod configure;
mod finish;
mod step;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{BackoffSpec, Condition, ConditionStatus, Sleuth, SleuthPhase, SleuthStatus};
use crate::resources;
use crate::signal::SignalSender;
use crate::sync::Synchronizer;
use crate::Error;

pub use configure::ConfigureStep;
pub use finish::FinishStep;
pub use step::{Outcome, PassContext, Pipeline, ReconcileStep};

/// Writes against the Sleuth resource itself and reads of its workload
///
/// Separate from the generic object store because these operations are typed
/// and instance-scoped: derived-default persistence, status, finalizers, and
/// the readiness lookup.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Write a derived backoff default into the instance's spec
    async fn persist_backoff(&self, sleuth: &Sleuth, backoff: &BackoffSpec) -> Result<(), Error>;

    /// Replace the instance's status subresource
    async fn patch_status(&self, sleuth: &Sleuth, status: &SleuthStatus) -> Result<(), Error>;

    /// Add the teardown finalizer if it is not present
    async fn ensure_finalizer(&self, sleuth: &Sleuth) -> Result<(), Error>;

    /// Remove the teardown finalizer
    async fn remove_finalizer(&self, sleuth: &Sleuth) -> Result<(), Error>;

    /// Fetch the instance's workload deployment, if it exists yet
    async fn get_workload(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;
}

/// [`InstanceStore`] over the Kubernetes API
pub struct KubeInstanceStore {
    client: Client,
}

impl KubeInstanceStore {
    /// Create a store over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn sleuths(&self, sleuth: &Sleuth) -> Api<Sleuth> {
        let namespace = sleuth.namespace().unwrap_or_else(|| "default".to_string());
        Api::namespaced(self.client.clone(), &namespace)
    }
}

#[async_trait]
impl InstanceStore for KubeInstanceStore {
    async fn persist_backoff(&self, sleuth: &Sleuth, backoff: &BackoffSpec) -> Result<(), Error> {
        let patch = json!({"spec": {"ai": {"backoff": backoff}}});
        self.sleuths(sleuth)
            .patch(
                &sleuth.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| Error::persistence(format!("failed to persist backoff default: {e}")))?;
        Ok(())
    }

    async fn patch_status(&self, sleuth: &Sleuth, status: &SleuthStatus) -> Result<(), Error> {
        let patch = json!({"status": status});
        self.sleuths(sleuth)
            .patch_status(
                &sleuth.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn ensure_finalizer(&self, sleuth: &Sleuth) -> Result<(), Error> {
        if sleuth.finalizers().iter().any(|f| f == crate::FINALIZER) {
            return Ok(());
        }
        let mut finalizers = sleuth.finalizers().to_vec();
        finalizers.push(crate::FINALIZER.to_string());
        let patch = json!({"metadata": {"finalizers": finalizers}});
        self.sleuths(sleuth)
            .patch(
                &sleuth.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, sleuth: &Sleuth) -> Result<(), Error> {
        let finalizers: Vec<_> = sleuth
            .finalizers()
            .iter()
            .filter(|f| *f != crate::FINALIZER)
            .cloned()
            .collect();
        let patch = json!({"metadata": {"finalizers": finalizers}});
        self.sleuths(sleuth)
            .patch(
                &sleuth.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Reconcile timing and mode knobs
#[derive(Clone, Debug)]
pub struct Settings {
    /// Skip the workload readiness gate (development against a local setup
    /// where the diagnostics image never becomes available)
    pub local_mode: bool,
    /// Requeue interval after a fully converged, ready pass
    pub requeue_ready: Duration,
    /// Requeue interval while waiting for the workload to come up
    pub requeue_waiting: Duration,
    /// Requeue interval after a failed pass
    pub requeue_error: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_mode: false,
            requeue_ready: Duration::from_secs(60),
            requeue_waiting: Duration::from_secs(30),
            requeue_error: Duration::from_secs(5),
        }
    }
}

/// Shared controller state handed to every reconcile pass
pub struct Context {
    /// Converge/destroy engine
    pub synchronizer: Synchronizer,
    /// Typed writes to the Sleuth resource and workload lookup
    pub instances: Arc<dyn InstanceStore>,
    /// Outbound readiness signals
    pub signals: SignalSender,
    /// Timing and mode knobs
    pub settings: Settings,
    /// The ordered reconcile steps
    pub pipeline: Pipeline,
}

impl Context {
    /// Start building a context
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }
}

/// Builder for [`Context`]
#[derive(Default)]
pub struct ContextBuilder {
    synchronizer: Option<Synchronizer>,
    instances: Option<Arc<dyn InstanceStore>>,
    signals: Option<SignalSender>,
    settings: Settings,
    pipeline: Option<Pipeline>,
}

impl ContextBuilder {
    /// Set the synchronizer
    pub fn synchronizer(mut self, synchronizer: Synchronizer) -> Self {
        self.synchronizer = Some(synchronizer);
        self
    }

    /// Set the instance store
    pub fn instances(mut self, instances: Arc<dyn InstanceStore>) -> Self {
        self.instances = Some(instances);
        self
    }

    /// Set the signal sender
    pub fn signals(mut self, signals: SignalSender) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Override the default settings
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Override the standard pipeline
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Build the context; missing collaborators are a configuration error
    pub fn build(self) -> Result<Context, Error> {
        Ok(Context {
            synchronizer: self
                .synchronizer
                .ok_or_else(|| Error::configuration("context requires a synchronizer"))?,
            instances: self
                .instances
                .ok_or_else(|| Error::configuration("context requires an instance store"))?,
            signals: self
                .signals
                .ok_or_else(|| Error::configuration("context requires a signal sender"))?,
            settings: self.settings,
            pipeline: self.pipeline.unwrap_or_else(standard_pipeline),
        })
    }
}

/// The standard reconcile pipeline: configure, then finish
pub fn standard_pipeline() -> Pipeline {
    Pipeline::new(vec![Box::new(ConfigureStep), Box::new(FinishStep)])
}

/// Reconcile one Sleuth instance
///
/// Deletion runs teardown; a contradictory spec is recorded as Failed and
/// parked until the spec changes; everything else goes through the pipeline.
#[instrument(skip(sleuth, ctx), fields(sleuth = %sleuth.name_any()))]
pub async fn reconcile(sleuth: Arc<Sleuth>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = sleuth.name_any();
    let namespace = sleuth.namespace().unwrap_or_else(|| "default".to_string());

    if sleuth.metadata.deletion_timestamp.is_some() {
        return teardown(&sleuth, &ctx).await;
    }

    if let Err(e) = sleuth.spec.validate() {
        warn!(%namespace, %name, error = %e, "rejecting contradictory spec");
        let status = SleuthStatus::with_phase(SleuthPhase::Failed)
            .ready(false)
            .message(e.to_string())
            .condition(Condition::new(
                "Ready",
                ConditionStatus::False,
                "InvalidSpec",
                e.to_string(),
            ));
        ctx.instances.patch_status(&sleuth, &status).await?;
        // Terminal: retrying cannot fix a contradictory spec
        return Ok(Action::await_change());
    }

    ctx.instances.ensure_finalizer(&sleuth).await?;

    let mut pass = PassContext::new((*sleuth).clone());
    match ctx.pipeline.run(&mut pass, &ctx).await? {
        Outcome::Continue => {
            info!(%namespace, %name, ready = pass.ready, "reconcile pass complete");
            Ok(Action::requeue(ctx.settings.requeue_ready))
        }
        Outcome::StopSoft => {
            let status = SleuthStatus::with_phase(SleuthPhase::Progressing)
                .ready(false)
                .message("waiting for workload replicas")
                .condition(Condition::new(
                    "Ready",
                    ConditionStatus::False,
                    "WaitingForWorkload",
                    "diagnostics server has no available replicas",
                ));
            ctx.instances.patch_status(&pass.sleuth, &status).await?;
            Ok(Action::requeue(ctx.settings.requeue_waiting))
        }
        Outcome::StopTerminal => Ok(Action::await_change()),
    }
}

/// Destroy every owned object, then release the finalizer
///
/// Key derivation is metadata-only, so teardown works even when the spec no
/// longer passes validation.
async fn teardown(sleuth: &Sleuth, ctx: &Context) -> Result<Action, Error> {
    if sleuth.finalizers().iter().any(|f| f == crate::FINALIZER) {
        let name = sleuth.name_any();
        info!(name = %name, "tearing down owned objects");
        let keys = resources::descriptor_keys(sleuth);
        ctx.synchronizer.destroy_all(&keys).await?;
        ctx.instances.remove_finalizer(sleuth).await?;
    }
    Ok(Action::await_change())
}

/// Requeue policy for failed passes
pub fn error_policy(sleuth: Arc<Sleuth>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        name = %sleuth.name_any(),
        error = %error,
        "reconcile failed, requeueing"
    );
    Action::requeue(ctx.settings.requeue_error)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crd::{AiSpec, SleuthSpec};
    use crate::signal::{signal_channel, SignalReceiver};
    use crate::sync::MockObjectStore;

    pub fn test_sleuth() -> Sleuth {
        let mut sleuth = Sleuth::new(
            "diag",
            SleuthSpec {
                repository: "ghcr.io/sleuth-dev/sleuth".to_string(),
                version: "latest".to_string(),
                image_pull_policy: None,
                ai: AiSpec {
                    model: "gpt-4o-mini".to_string(),
                    ..Default::default()
                },
                resources: None,
                kubeconfig: None,
                extra_options: None,
                remote_cache: None,
                node_selector: None,
            },
        );
        sleuth.metadata.namespace = Some("default".to_string());
        sleuth.metadata.uid = Some("7b1c1d52-0000-4000-8000-000000000000".to_string());
        sleuth
    }

    pub fn build_context(
        instances: MockInstanceStore,
        store: MockObjectStore,
        settings: Settings,
    ) -> (Context, SignalReceiver) {
        let (tx, rx) = signal_channel(crate::DEFAULT_SIGNAL_CAPACITY);
        let ctx = Context::builder()
            .synchronizer(Synchronizer::new(Arc::new(store)))
            .instances(Arc::new(instances))
            .signals(tx)
            .settings(settings)
            .build()
            .expect("test context builds");
        (ctx, rx)
    }

    pub fn test_context() -> Context {
        let (ctx, rx) = build_context(
            MockInstanceStore::new(),
            MockObjectStore::new(),
            Settings::default(),
        );
        // Steps under test never drain signals; keep the receiver alive so
        // sends do not fail with a closed channel.
        std::mem::forget(rx);
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{build_context, test_sleuth};
    use super::*;
    use crate::sync::{MockObjectStore, StoreError};
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn ready_deployment() -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                available_replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // =========================================================================
    // Driver Stories
    // =========================================================================

    /// Story: A contradictory spec is recorded as Failed and parked
    ///
    /// No finalizer is added and no object is touched; only a spec change
    /// can revive the instance.
    #[tokio::test]
    async fn story_invalid_spec_fails_terminally_without_touching_objects() {
        let mut sleuth = test_sleuth();
        sleuth.spec.ai.engine = Some("gpt-4".to_string());

        let mut instances = MockInstanceStore::new();
        instances
            .expect_patch_status()
            .withf(|_, status| status.phase == SleuthPhase::Failed && !status.ready)
            .times(1)
            .returning(|_, _| Ok(()));
        instances.expect_ensure_finalizer().never();

        let mut store = MockObjectStore::new();
        store.expect_get().never();
        store.expect_create().never();

        let (ctx, _rx) = build_context(instances, store, Settings::default());
        let action = reconcile(Arc::new(sleuth), Arc::new(ctx)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: A first pass converges everything and reports Ready
    ///
    /// Defaults are persisted, all five objects are created, the workload is
    /// ready, and exactly one readiness signal goes out.
    #[tokio::test]
    async fn story_first_pass_converges_and_signals_readiness() {
        let mut instances = MockInstanceStore::new();
        instances.expect_ensure_finalizer().times(1).returning(|_| Ok(()));
        instances
            .expect_persist_backoff()
            .times(1)
            .returning(|_, _| Ok(()));
        instances
            .expect_get_workload()
            .returning(|_, _| Ok(Some(ready_deployment())));
        instances
            .expect_patch_status()
            .withf(|_, status| status.phase == SleuthPhase::Ready && status.ready)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut store = MockObjectStore::new();
        store.expect_get().returning(|_| Ok(None));
        store.expect_create().times(5).returning(|_| Ok(()));

        let (ctx, mut rx) = build_context(instances, store, Settings::default());
        let action = reconcile(Arc::new(test_sleuth()), Arc::new(ctx))
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        let signal = rx.try_recv().expect("one readiness signal");
        assert_eq!(signal.reason, "default/diag");
        assert!(rx.try_recv().is_err(), "exactly one signal");
    }

    /// Story: A waiting workload soft-stops the pass as Progressing
    #[tokio::test]
    async fn story_waiting_workload_reports_progressing() {
        let mut instances = MockInstanceStore::new();
        instances.expect_ensure_finalizer().returning(|_| Ok(()));
        instances.expect_persist_backoff().returning(|_, _| Ok(()));
        instances.expect_get_workload().returning(|_, _| Ok(None));
        instances
            .expect_patch_status()
            .withf(|_, status| status.phase == SleuthPhase::Progressing && !status.ready)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut store = MockObjectStore::new();
        store.expect_get().returning(|_| Ok(None));
        store.expect_create().returning(|_| Ok(()));

        let (ctx, mut rx) = build_context(instances, store, Settings::default());
        let action = reconcile(Arc::new(test_sleuth()), Arc::new(ctx))
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        assert!(rx.try_recv().is_err(), "no signal while waiting");
    }

    /// Story: Deletion destroys every owned object, then releases the hold
    #[tokio::test]
    async fn story_deletion_tears_down_and_releases_finalizer() {
        let mut sleuth = test_sleuth();
        sleuth.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        sleuth.metadata.finalizers = Some(vec![crate::FINALIZER.to_string()]);

        let mut instances = MockInstanceStore::new();
        instances.expect_remove_finalizer().times(1).returning(|_| Ok(()));

        let mut store = MockObjectStore::new();
        // Two objects still exist, three are already gone; both are success
        let deleted = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = deleted.clone();
        store.expect_delete().times(5).returning(move |_| {
            if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 {
                Ok(())
            } else {
                Err(StoreError::NotFound)
            }
        });

        let (ctx, _rx) = build_context(instances, store, Settings::default());
        let action = reconcile(Arc::new(sleuth), Arc::new(ctx)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: Deletion without our finalizer is a no-op
    #[tokio::test]
    async fn story_deletion_without_finalizer_touches_nothing() {
        let mut sleuth = test_sleuth();
        sleuth.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let mut instances = MockInstanceStore::new();
        instances.expect_remove_finalizer().never();
        let mut store = MockObjectStore::new();
        store.expect_delete().never();

        let (ctx, _rx) = build_context(instances, store, Settings::default());
        assert!(reconcile(Arc::new(sleuth), Arc::new(ctx)).await.is_ok());
    }

    /// Story: Teardown works for a spec that no longer validates
    ///
    /// Key derivation reads only metadata, so a broken spec cannot strand
    /// its objects behind the finalizer.
    #[tokio::test]
    async fn story_teardown_succeeds_for_invalid_spec() {
        let mut sleuth = test_sleuth();
        sleuth.spec.ai.engine = Some("gpt-4".to_string());
        assert!(sleuth.spec.validate().is_err());
        sleuth.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        sleuth.metadata.finalizers = Some(vec![crate::FINALIZER.to_string()]);

        let mut instances = MockInstanceStore::new();
        instances.expect_remove_finalizer().times(1).returning(|_| Ok(()));
        let mut store = MockObjectStore::new();
        store.expect_delete().times(5).returning(|_| Err(StoreError::NotFound));

        let (ctx, _rx) = build_context(instances, store, Settings::default());
        assert!(reconcile(Arc::new(sleuth), Arc::new(ctx)).await.is_ok());
    }

    /// Story: The error policy requeues on the short error interval
    #[tokio::test]
    async fn story_error_policy_requeues() {
        let (ctx, _rx) = build_context(
            MockInstanceStore::new(),
            MockObjectStore::new(),
            Settings::default(),
        );
        let action = error_policy(
            Arc::new(test_sleuth()),
            &Error::timeout("store call exceeded 35s"),
            Arc::new(ctx),
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }

    /// Story: The context builder refuses incomplete wiring
    #[test]
    fn story_context_builder_requires_all_collaborators() {
        assert!(matches!(
            Context::builder().build(),
            Err(Error::Configuration(_))
        ));
    }
}
