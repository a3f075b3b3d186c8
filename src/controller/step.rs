//! Reconcile step pipeline
//!
//! A reconcile pass walks an explicit, ordered list of steps. Each step sees
//! the shared [`PassContext`] and decides whether the pass continues, stops
//! softly (come back soon, nothing is wrong) or stops terminally (only a spec
//! change can help). Failures are `Err`, not outcomes.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use tracing::debug;

use super::Context;
use crate::crd::Sleuth;
use crate::Error;

/// How a step ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Proceed to the next step
    Continue,
    /// End the pass without error; requeue on the short interval
    StopSoft,
    /// End the pass; only a spec change will unblock it
    StopTerminal,
}

/// Mutable state shared by the steps of one pass
///
/// Built fresh per pass from the triggering resource; nothing in here
/// survives across passes except what a step explicitly persists.
pub struct PassContext {
    /// The resource under reconciliation, including any derived defaults a
    /// step persisted and mirrored locally this pass
    pub sleuth: Sleuth,
    /// The live workload, once the configure step has looked it up
    pub deployment: Option<Deployment>,
    /// Whether the workload has available replicas this pass
    pub ready: bool,
    /// Whether the persisted status already recorded readiness before this
    /// pass; the finish step signals only on the false-to-true transition
    pub was_ready: bool,
}

impl PassContext {
    /// Start a pass for the given resource
    ///
    /// `was_ready` is taken from the persisted status so a restarted
    /// controller does not re-announce an old transition.
    pub fn new(sleuth: Sleuth) -> Self {
        let was_ready = sleuth.status.as_ref().map(|s| s.ready).unwrap_or(false);
        Self {
            sleuth,
            deployment: None,
            ready: false,
            was_ready,
        }
    }
}

/// One stage of a reconcile pass
#[async_trait]
pub trait ReconcileStep: Send + Sync {
    /// Step name for logs
    fn name(&self) -> &'static str;

    /// Run the step against the shared pass state
    async fn execute(&self, pass: &mut PassContext, ctx: &Context) -> Result<Outcome, Error>;
}

/// Ordered list of steps making up a reconcile pass
///
/// The order is fixed at construction; there is no step-to-step linkage, so
/// reading the pipeline definition is reading the whole control flow.
pub struct Pipeline {
    steps: Vec<Box<dyn ReconcileStep>>,
}

impl Pipeline {
    /// Build a pipeline from an ordered step list
    pub fn new(steps: Vec<Box<dyn ReconcileStep>>) -> Self {
        Self { steps }
    }

    /// Run steps in order until one stops the pass or fails
    pub async fn run(&self, pass: &mut PassContext, ctx: &Context) -> Result<Outcome, Error> {
        for step in &self.steps {
            debug!(step = step.name(), "running reconcile step");
            match step.execute(pass, ctx).await? {
                Outcome::Continue => continue,
                stop => {
                    debug!(step = step.name(), outcome = ?stop, "step ended the pass");
                    return Ok(stop);
                }
            }
        }
        Ok(Outcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::{test_context, test_sleuth};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingStep {
        name: &'static str,
        outcome: Outcome,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ReconcileStep for RecordingStep {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(&self, _pass: &mut PassContext, _ctx: &Context) -> Result<Outcome, Error> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome)
        }
    }

    fn step(name: &'static str, outcome: Outcome, runs: &Arc<AtomicUsize>) -> Box<dyn ReconcileStep> {
        Box::new(RecordingStep {
            name,
            outcome,
            runs: runs.clone(),
        })
    }

    /// Story: Steps run in declaration order until the end
    #[tokio::test]
    async fn story_pipeline_runs_every_step_in_order() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(vec![
            step("first", Outcome::Continue, &first),
            step("second", Outcome::Continue, &second),
        ]);

        let ctx = test_context();
        let mut pass = PassContext::new(test_sleuth());
        let outcome = pipeline.run(&mut pass, &ctx).await.unwrap();

        assert_eq!(outcome, Outcome::Continue);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    /// Story: A soft stop halts the pass without running later steps
    #[tokio::test]
    async fn story_soft_stop_skips_later_steps() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(vec![
            step("gate", Outcome::StopSoft, &first),
            step("never", Outcome::Continue, &second),
        ]);

        let ctx = test_context();
        let mut pass = PassContext::new(test_sleuth());
        let outcome = pipeline.run(&mut pass, &ctx).await.unwrap();

        assert_eq!(outcome, Outcome::StopSoft);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    /// Story: A step failure aborts the pass and surfaces the error
    #[tokio::test]
    async fn story_step_failure_aborts_the_pass() {
        struct FailingStep;

        #[async_trait]
        impl ReconcileStep for FailingStep {
            fn name(&self) -> &'static str {
                "failing"
            }

            async fn execute(
                &self,
                _pass: &mut PassContext,
                _ctx: &Context,
            ) -> Result<Outcome, Error> {
                Err(Error::persistence("store write failed"))
            }
        }

        let after = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(vec![
            Box::new(FailingStep),
            step("never", Outcome::Continue, &after),
        ]);

        let ctx = test_context();
        let mut pass = PassContext::new(test_sleuth());
        assert!(pipeline.run(&mut pass, &ctx).await.is_err());
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    /// Story: Persisted readiness seeds the transition baseline
    #[test]
    fn story_pass_context_reads_prior_readiness_from_status() {
        use crate::crd::{SleuthPhase, SleuthStatus};

        let mut sleuth = test_sleuth();
        assert!(!PassContext::new(sleuth.clone()).was_ready);

        sleuth.status = Some(SleuthStatus::with_phase(SleuthPhase::Ready).ready(true));
        assert!(PassContext::new(sleuth).was_ready);
    }
}
