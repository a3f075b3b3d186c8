//! Sleuth - CRD-driven Kubernetes operator for AI diagnostics deployments
//!
//! Sleuth manages the lifecycle of an in-cluster AI diagnostics server. A
//! single custom resource declares the desired deployment (AI backend, model,
//! resource limits, credential references, networking mode) and the operator
//! converges the dependent Kubernetes objects toward that declaration on
//! every reconcile pass.
//!
//! # Architecture
//!
//! Reconciliation is a step pipeline driven once per trigger event:
//! - The desired-state builder derives an ordered descriptor set from the spec
//! - The synchronizer converges each descriptor idempotently (create-or-patch
//!   with bounded conflict retry)
//! - A bounded signal channel notifies the secondary controller when the
//!   managed server becomes ready
//!
//! Every externally visible effect is idempotent, so a pass is always safe to
//! re-run in full after partial progress.
//!
//! # Modules
//!
//! - [`crd`] - The Sleuth Custom Resource Definition and supporting types
//! - [`resources`] - Desired-state builder (spec to descriptor set)
//! - [`sync`] - Idempotent converge/destroy synchronizer and object store
//! - [`controller`] - Reconcile step pipeline and driver
//! - [`signal`] - Inter-controller readiness signal channel
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod resources;
pub mod signal;
pub mod sync;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the default values used throughout Sleuth.
// Centralizing them here ensures consistency across CRD defaults, controller
// settings, and test fixtures.

/// Default number of attempts for an optimistic-concurrency conflict retry
///
/// Only conflict responses are retried; any other store error propagates on
/// the first occurrence.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;

/// Default capacity of the inter-controller signal channel
///
/// Sends block when the channel is full rather than dropping, because a lost
/// readiness signal can leave the secondary controller permanently unaware.
pub const DEFAULT_SIGNAL_CAPACITY: usize = 10;

/// Default timeout for a single object store operation, in seconds
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 35;

/// Default max retries persisted into a spec that lacks a backoff policy
pub const DEFAULT_BACKOFF_MAX_RETRIES: i32 = 5;

/// Default CPU limit for the managed workload container
pub const DEFAULT_CPU_LIMIT: &str = "1";

/// Default memory limit for the managed workload container
pub const DEFAULT_MEMORY_LIMIT: &str = "512Mi";

/// Default CPU request for the managed workload container
pub const DEFAULT_CPU_REQUEST: &str = "0.2";

/// Default memory request for the managed workload container
pub const DEFAULT_MEMORY_REQUEST: &str = "256Mi";

/// Port the managed diagnostics server listens on
pub const WORKLOAD_PORT: i32 = 8080;

/// Field manager name used for all patches issued by the operator
pub const FIELD_MANAGER: &str = "sleuth-controller";

/// Finalizer placed on Sleuth resources to guarantee descriptor teardown
pub const FINALIZER: &str = "sleuth.dev/teardown";
