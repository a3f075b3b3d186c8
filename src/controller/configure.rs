//! Configure step: defaults, convergence, readiness gate

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use super::step::{Outcome, PassContext, ReconcileStep};
use super::Context;
use crate::crd::BackoffSpec;
use crate::resources;
use crate::Error;

/// First pipeline stage
///
/// Persists the derived backoff default, converges the full descriptor set,
/// then gates on workload readiness: a workload without available replicas
/// soft-stops the pass (unless local mode skips the gate).
pub struct ConfigureStep;

#[async_trait]
impl ReconcileStep for ConfigureStep {
    fn name(&self) -> &'static str {
        "configure"
    }

    async fn execute(&self, pass: &mut PassContext, ctx: &Context) -> Result<Outcome, Error> {
        let name = pass.sleuth.name_any();
        let namespace = pass
            .sleuth
            .namespace()
            .unwrap_or_else(|| "default".to_string());

        if pass.sleuth.spec.ai.backoff.is_none() {
            let backoff = BackoffSpec::default();
            ctx.instances.persist_backoff(&pass.sleuth, &backoff).await?;
            // Mirror the persisted default so later steps see the effective spec
            pass.sleuth.spec.ai.backoff = Some(backoff);
            debug!(%namespace, %name, "persisted default backoff policy");
        }

        let descriptors = resources::descriptors(&pass.sleuth)?;
        ctx.synchronizer
            .converge_all(&pass.sleuth, &descriptors)
            .await?;

        pass.deployment = ctx.instances.get_workload(&namespace, &name).await?;
        pass.ready = pass
            .deployment
            .as_ref()
            .and_then(|d| d.status.as_ref())
            .and_then(|s| s.available_replicas)
            .unwrap_or(0)
            > 0;

        if !pass.ready && !ctx.settings.local_mode {
            info!(%namespace, %name, "workload not ready yet");
            return Ok(Outcome::StopSoft);
        }

        Ok(Outcome::Continue)
    }
}
