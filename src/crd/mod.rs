//! Custom Resource Definitions for Sleuth
//!
//! The [`Sleuth`] CRD declares the desired state of one managed AI
//! diagnostics deployment. Supporting types live in [`types`].

mod sleuth;
pub mod types;

pub use sleuth::{Sleuth, SleuthSpec, SleuthStatus};
pub use types::{
    AiSpec, Backend, BackoffSpec, Condition, ConditionStatus, ExtraOptions, RemoteCacheProvider,
    RemoteCacheSpec, ResourcesSpec, SecretRef, SleuthPhase,
};
