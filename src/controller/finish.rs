//! Finish step: readiness signal and status write

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

use super::step::{Outcome, PassContext, ReconcileStep};
use super::Context;
use crate::crd::{Condition, ConditionStatus, SleuthPhase, SleuthStatus};
use crate::signal::Signal;
use crate::Error;

/// Last pipeline stage
///
/// Emits the readiness signal on the not-ready-to-ready transition, then
/// records the pass outcome in the status subresource. The signal goes out
/// before the status write: if the pass dies between the two, the unwritten
/// status makes the next pass re-detect the transition and re-signal, so a
/// transition can be announced twice but never lost.
pub struct FinishStep;

#[async_trait]
impl ReconcileStep for FinishStep {
    fn name(&self) -> &'static str {
        "finish"
    }

    async fn execute(&self, pass: &mut PassContext, ctx: &Context) -> Result<Outcome, Error> {
        let name = pass.sleuth.name_any();
        let namespace = pass
            .sleuth
            .namespace()
            .unwrap_or_else(|| "default".to_string());

        if pass.ready && !pass.was_ready {
            info!(%namespace, %name, "workload became ready, signalling");
            ctx.signals
                .send(Signal::workload_ready(&namespace, &name))
                .await
                .map_err(|e| Error::signal(format!("readiness signal not delivered: {e}")))?;
        }

        let status = if pass.ready {
            SleuthStatus::with_phase(SleuthPhase::Ready)
                .ready(true)
                .message("diagnostics server is serving")
                .condition(Condition::new(
                    "Ready",
                    ConditionStatus::True,
                    "WorkloadReady",
                    "diagnostics server has available replicas",
                ))
        } else {
            SleuthStatus::with_phase(SleuthPhase::Progressing)
                .ready(false)
                .message("waiting for workload replicas")
                .condition(Condition::new(
                    "Ready",
                    ConditionStatus::False,
                    "WaitingForWorkload",
                    "diagnostics server has no available replicas",
                ))
        };
        ctx.instances.patch_status(&pass.sleuth, &status).await?;

        Ok(Outcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::{build_context, test_sleuth};
    use crate::controller::{MockInstanceStore, Settings};
    use crate::signal::SignalKind;
    use crate::sync::MockObjectStore;

    fn pass_with(ready: bool, was_ready: bool) -> PassContext {
        let mut pass = PassContext::new(test_sleuth());
        pass.ready = ready;
        pass.was_ready = was_ready;
        pass
    }

    /// Story: The not-ready-to-ready transition emits exactly one signal
    #[tokio::test]
    async fn story_transition_to_ready_signals_once() {
        let mut instances = MockInstanceStore::new();
        instances
            .expect_patch_status()
            .withf(|_, status| status.phase == SleuthPhase::Ready && status.ready)
            .times(1)
            .returning(|_, _| Ok(()));

        let (ctx, mut rx) = build_context(instances, MockObjectStore::new(), Settings::default());
        let mut pass = pass_with(true, false);

        assert_eq!(
            FinishStep.execute(&mut pass, &ctx).await.unwrap(),
            Outcome::Continue
        );

        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.kind, SignalKind::WorkloadReady);
        assert_eq!(signal.reason, "default/diag");
        assert!(rx.try_recv().is_err());
    }

    /// Story: A workload that stays ready does not re-announce
    #[tokio::test]
    async fn story_steady_ready_state_does_not_signal() {
        let mut instances = MockInstanceStore::new();
        instances
            .expect_patch_status()
            .times(1)
            .returning(|_, _| Ok(()));

        let (ctx, mut rx) = build_context(instances, MockObjectStore::new(), Settings::default());
        let mut pass = pass_with(true, true);

        FinishStep.execute(&mut pass, &ctx).await.unwrap();
        assert!(rx.try_recv().is_err(), "no signal on steady state");
    }

    /// Story: An unready pass records Progressing and stays silent
    #[tokio::test]
    async fn story_unready_pass_records_progressing() {
        let mut instances = MockInstanceStore::new();
        instances
            .expect_patch_status()
            .withf(|_, status| status.phase == SleuthPhase::Progressing && !status.ready)
            .times(1)
            .returning(|_, _| Ok(()));

        let (ctx, mut rx) = build_context(instances, MockObjectStore::new(), Settings::default());
        let mut pass = pass_with(false, false);

        FinishStep.execute(&mut pass, &ctx).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    /// Story: The signal is sent before the status write
    ///
    /// If the status write fails after the signal went out, the persisted
    /// status still says not-ready and the next pass re-signals; duplicated
    /// announcements are acceptable, lost ones are not.
    #[tokio::test]
    async fn story_signal_precedes_status_write() {
        let mut instances = MockInstanceStore::new();
        instances
            .expect_patch_status()
            .returning(|_, _| Err(Error::persistence("status write failed")));

        let (ctx, mut rx) = build_context(instances, MockObjectStore::new(), Settings::default());
        let mut pass = pass_with(true, false);

        assert!(FinishStep.execute(&mut pass, &ctx).await.is_err());
        assert!(
            rx.try_recv().is_ok(),
            "signal already out despite the failed status write"
        );
    }
}
