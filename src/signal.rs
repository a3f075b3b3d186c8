//! Inter-controller signals
//!
//! When a managed workload transitions to ready, the reconciler emits a
//! [`Signal`] on a bounded channel so a dependent controller can follow up
//! (re-check analysis results, refresh its own state). The channel applies
//! backpressure instead of dropping: a full channel blocks the sender until
//! the consumer catches up, so readiness transitions are never lost.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// What a signal announces
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum SignalKind {
    /// The diagnostics workload transitioned to ready
    WorkloadReady,
}

/// One inter-controller notification
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// What happened
    pub kind: SignalKind,
    /// Which instance it concerns, as `namespace/name`
    pub reason: String,
}

impl Signal {
    /// Signal that the named instance's workload became ready
    pub fn workload_ready(namespace: &str, name: &str) -> Self {
        Self {
            kind: SignalKind::WorkloadReady,
            reason: format!("{namespace}/{name}"),
        }
    }
}

/// Sender half of the signal channel
pub type SignalSender = mpsc::Sender<Signal>;

/// Receiver half of the signal channel
pub type SignalReceiver = mpsc::Receiver<Signal>;

/// Create the bounded signal channel
///
/// `send().await` on a full channel parks the reconciler until the consumer
/// drains a slot; nothing is ever silently discarded.
pub fn signal_channel(capacity: usize) -> (SignalSender, SignalReceiver) {
    mpsc::channel(capacity)
}
